//! Per-subscriber TLS material kept on disk as `certs/<id>/{ca,cert,key}`.

use crate::error::{Result, TransporterError};
use log::{debug, error, warn};
use openssl::pkey::PKey;
use openssl::x509::X509;
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rumqttc::tokio_rustls::rustls::{ClientConfig, RootCertStore};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const TRUST_FILE_NAME: &str = "ca";
pub const CERT_FILE_NAME: &str = "cert";
pub const KEY_FILE_NAME: &str = "key";

/// Client certificate and private key, both PEM.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// What a provider needs to build its TLS client configuration.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterial {
    pub ca_pem: Option<Vec<u8>>,
    pub identity: Option<ClientIdentity>,
}

impl TlsMaterial {
    /// TLS settings for an MQTT client. Without a trust anchor the broker is
    /// verified against the platform roots. The client identity is presented
    /// in both cases.
    pub fn mqtt_configuration(&self) -> Result<rumqttc::TlsConfiguration> {
        if let Some(ca) = &self.ca_pem {
            return Ok(rumqttc::TlsConfiguration::Simple {
                ca: ca.clone(),
                alpn: None,
                client_auth: self
                    .identity
                    .as_ref()
                    .map(|id| (id.cert_pem.clone(), id.key_pem.clone())),
            });
        }

        let builder = ClientConfig::builder().with_root_certificates(platform_roots());
        let config = match &self.identity {
            Some(identity) => {
                let (chain, key) = identity.rustls_parts()?;
                builder.with_client_auth_cert(chain, key).map_err(|e| {
                    TransporterError::Certificate(format!("Unusable client certificate: {}", e))
                })?
            }
            None => builder.with_no_client_auth(),
        };
        Ok(rumqttc::TlsConfiguration::Rustls(Arc::new(config)))
    }

    /// Adds the trust anchor and client identity to an HTTP client builder.
    /// Unusable material is logged and skipped.
    pub fn apply_to_http(&self, mut builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        if let Some(ca) = &self.ca_pem {
            match reqwest::Certificate::from_pem(ca) {
                Ok(cert) => builder = builder.add_root_certificate(cert),
                Err(e) => error!("Failed to load trust anchor: {}", e),
            }
        }
        if let Some(identity) = &self.identity {
            let mut pem = identity.cert_pem.clone();
            pem.extend_from_slice(&identity.key_pem);
            match reqwest::Identity::from_pem(&pem) {
                Ok(id) => builder = builder.identity(id),
                Err(e) => error!("Failed to load client certificate: {}", e),
            }
        }
        builder
    }
}

impl ClientIdentity {
    fn rustls_parts(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let chain = rustls_pemfile::certs(&mut self.cert_pem.as_slice())
            .collect::<std::io::Result<Vec<_>>>()?;
        let key = rustls_pemfile::private_key(&mut self.key_pem.as_slice())?
            .ok_or_else(|| TransporterError::Certificate("No private key in keystore".to_string()))?;
        Ok((chain, key))
    }
}

fn platform_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = roots.add_parsable_certificates(certs);
            debug!("Loaded {} platform trust anchors, {} ignored", added, ignored);
        }
        Err(e) => warn!("Failed to load platform trust anchors: {}", e),
    }
    roots
}

#[derive(Clone, Debug)]
pub struct CertStore {
    root: PathBuf,
}

impl CertStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of `id`. Ids that would leave the store root are refused.
    pub fn dir(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
            return Err(TransporterError::validation(format!(
                "Invalid subscriber id '{}'",
                id.escape_default()
            )));
        }
        Ok(self.root.join(id))
    }

    fn file(&self, id: &str, name: &str) -> Result<PathBuf> {
        Ok(self.dir(id)?.join(name))
    }

    fn ensure_dir(&self, id: &str) -> Result<PathBuf> {
        let dir = self.dir(id)?;
        if !dir.exists() {
            create_private_dir(&dir)?;
        }
        Ok(dir)
    }

    /// Stores `pem` as the trust anchor, replacing any previous one.
    pub fn set_trust_anchor(&self, id: &str, pem: &[u8]) -> Result<()> {
        let certs = X509::stack_from_pem(pem)
            .map_err(|e| TransporterError::Certificate(format!("Invalid trust anchor: {}", e)))?;
        if certs.is_empty() {
            return Err(TransporterError::Certificate(
                "Trust anchor contains no certificate".to_string(),
            ));
        }
        let dir = self.ensure_dir(id)?;
        write_private(&dir.join(TRUST_FILE_NAME), pem)
    }

    pub fn has_trust_anchor(&self, id: &str) -> bool {
        self.file(id, TRUST_FILE_NAME).is_ok_and(|f| f.is_file())
    }

    pub fn delete_trust_anchor(&self, id: &str) -> Result<()> {
        remove_if_exists(&self.file(id, TRUST_FILE_NAME)?)
    }

    /// Writes the client key and certificate, replacing prior files.
    pub fn write_keystore(&self, id: &str, key_pem: &[u8], cert_pem: &[u8]) -> Result<()> {
        let dir = self.ensure_dir(id)?;
        write_private(&dir.join(KEY_FILE_NAME), key_pem)?;
        write_private(&dir.join(CERT_FILE_NAME), cert_pem)
    }

    pub fn has_keystore(&self, id: &str) -> bool {
        self.file(id, KEY_FILE_NAME).is_ok_and(|f| f.is_file())
    }

    pub fn delete_keystore(&self, id: &str) -> Result<()> {
        remove_if_exists(&self.file(id, KEY_FILE_NAME)?)?;
        remove_if_exists(&self.file(id, CERT_FILE_NAME)?)
    }

    /// Removes the whole directory of `id`.
    pub fn remove_all(&self, id: &str) -> Result<()> {
        let dir = self.dir(id)?;
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Reads the material of `id`. A missing trust anchor yields an empty
    /// pool; an unreadable key pair is logged and left out.
    pub fn load(&self, id: &str) -> TlsMaterial {
        let ca_pem = self
            .file(id, TRUST_FILE_NAME)
            .ok()
            .and_then(|f| fs::read(f).ok());

        let mut identity = None;
        if self.has_keystore(id) {
            match self.load_identity(id) {
                Ok(pair) => identity = Some(pair),
                Err(e) => error!("Failed to load client key pair for {}: {}", id, e),
            }
        }

        TlsMaterial { ca_pem, identity }
    }

    fn load_identity(&self, id: &str) -> Result<ClientIdentity> {
        let cert_pem = fs::read(self.file(id, CERT_FILE_NAME)?)?;
        let key_pem = fs::read(self.file(id, KEY_FILE_NAME)?)?;
        X509::from_pem(&cert_pem)?;
        PKey::private_key_from_pem(&key_pem)?;
        Ok(ClientIdentity { cert_pem, key_pem })
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    Ok(())
}
