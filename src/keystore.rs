//! PKCS#12 keystore acceptance: decode, verify, persist as PEM.

use crate::error::{Result, TransporterError};
use crate::tls::CertStore;
use openssl::asn1::Asn1Time;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::Id;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509StoreContext, X509VerifyResult, X509};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

// OpenSSL verify codes. Names follow x509_vfy.h.
const X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT: i32 = 2;
const X509_V_ERR_CERT_NOT_YET_VALID: i32 = 9;
const X509_V_ERR_CERT_HAS_EXPIRED: i32 = 10;
const X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT: i32 = 18;
const X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN: i32 = 19;
const X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY: i32 = 20;
const X509_V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE: i32 = 21;

const UNKNOWN_AUTHORITY: [i32; 5] = [
    X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT,
    X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT,
    X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN,
    X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY,
    X509_V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE,
];

const EXPIRED_MESSAGE: &str = "certificate has expired or is not yet valid";

/// Verifies `cert` without any installed trust roots.
///
/// An expired or not yet valid certificate is rejected. A chain that cannot
/// be anchored (self-signed or privately rooted) is accepted. Any other
/// verification failure is returned as is.
pub fn verify(cert: &X509) -> Result<()> {
    let now = Asn1Time::days_from_now(0)?;
    if cert.not_after().compare(&now)? == Ordering::Less
        || cert.not_before().compare(&now)? == Ordering::Greater
    {
        return Err(TransporterError::Certificate(EXPIRED_MESSAGE.to_string()));
    }

    let store = X509StoreBuilder::new()?.build();
    let chain = Stack::new()?;
    let mut context = X509StoreContext::new()?;
    let outcome = context.init(&store, cert, &chain, |ctx| {
        if ctx.verify_cert()? {
            Ok(None)
        } else {
            Ok(Some(ctx.error()))
        }
    })?;

    match outcome {
        None => Ok(()),
        Some(result) => classify(result),
    }
}

fn classify(result: X509VerifyResult) -> Result<()> {
    let code = result.as_raw();
    if UNKNOWN_AUTHORITY.contains(&code) {
        debug!("certificate authority unknown, accepting: {}", result.error_string());
        return Ok(());
    }
    match code {
        X509_V_ERR_CERT_HAS_EXPIRED | X509_V_ERR_CERT_NOT_YET_VALID => {
            Err(TransporterError::Certificate(EXPIRED_MESSAGE.to_string()))
        }
        _ => Err(TransporterError::Certificate(
            result.error_string().to_string(),
        )),
    }
}

/// Decoded keystore as PEM blobs ready to be written.
#[derive(Debug)]
pub struct DecodedKeystore {
    pub key_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
}

/// Parses a PKCS#12 bundle, requires an RSA key and a leaf certificate, and
/// verifies the certificate.
pub fn decode_keystore(bundle: &[u8], passphrase: &str) -> Result<DecodedKeystore> {
    let parsed = Pkcs12::from_der(bundle)
        .and_then(|p12| p12.parse2(passphrase))
        .map_err(|e| TransporterError::Certificate(format!("Failed to decode keystore: {}", e)))?;

    let pkey = parsed
        .pkey
        .ok_or_else(|| TransporterError::Certificate("keystore contains no private key".into()))?;
    let cert = parsed
        .cert
        .ok_or_else(|| TransporterError::Certificate("keystore contains no certificate".into()))?;

    verify(&cert)?;

    if pkey.id() != Id::RSA {
        return Err(TransporterError::Certificate(
            "expected RSA private key type".to_string(),
        ));
    }
    let key_pem = pkey.rsa()?.private_key_to_pem()?;
    let cert_pem = cert.to_pem()?;

    Ok(DecodedKeystore { key_pem, cert_pem })
}

/// Decodes `bundle` and stores its key and certificate for `id`.
pub fn accept_keystore(store: &CertStore, id: &str, bundle: &[u8], passphrase: &str) -> Result<()> {
    let decoded = decode_keystore(bundle, passphrase).inspect_err(|e| error!("{}", e))?;
    store.write_keystore(id, &decoded.key_pem, &decoded.cert_pem)
}

/// One-time tokens standing in for keystore passphrases.
#[derive(Debug, Default)]
pub struct PassphraseVault {
    secrets: Mutex<HashMap<String, String>>,
}

impl PassphraseVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, passphrase: &[u8]) -> Result<String> {
        if passphrase.is_empty() {
            return Err(TransporterError::validation("Could not read passphrase value"));
        }
        let passphrase = String::from_utf8(passphrase.to_vec())
            .map_err(|_| TransporterError::validation("Passphrase must be valid UTF-8"))?;
        let token = Uuid::new_v4().to_string();
        self.lock().insert(token.clone(), passphrase);
        Ok(token)
    }

    /// Removes and returns the passphrase behind `token`.
    pub fn take(&self, token: &str) -> Result<String> {
        self.lock()
            .remove(token)
            .ok_or_else(|| TransporterError::validation("No passphrase specified"))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // a poisoned map is still a valid map
        self.secrets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::test_certs::{now, self_signed, valid_self_signed};
    use openssl::ec::{EcGroup, EcKey};
    use openssl::nid::Nid;
    use openssl::pkey::PKey;
    use tempfile::TempDir;

    fn bundle(pass: &str) -> Vec<u8> {
        let (key, cert) = valid_self_signed("client");
        Pkcs12::builder()
            .name("client")
            .pkey(&key)
            .cert(&cert)
            .build2(pass)
            .unwrap()
            .to_der()
            .unwrap()
    }

    #[test]
    fn self_signed_certificate_is_accepted() {
        let (_, cert) = valid_self_signed("self");
        assert!(verify(&cert).is_ok());
    }

    #[test]
    fn expired_certificate_is_rejected() {
        let (_, cert) = self_signed("old", now() - 86_400 * 30, now() - 86_400);
        let err = verify(&cert).unwrap_err();
        assert!(matches!(err, TransporterError::Certificate(msg) if msg.contains("expired")));
    }

    #[test]
    fn future_certificate_is_rejected() {
        let (_, cert) = self_signed("future", now() + 86_400, now() + 86_400 * 30);
        assert!(verify(&cert).is_err());
    }

    #[test]
    fn decode_round_trips_rsa_bundle() {
        let decoded = decode_keystore(&bundle("secret"), "secret").unwrap();
        assert!(String::from_utf8_lossy(&decoded.key_pem).contains("BEGIN RSA PRIVATE KEY"));
        assert!(String::from_utf8_lossy(&decoded.cert_pem).contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn wrong_passphrase_is_a_certificate_error() {
        let err = decode_keystore(&bundle("secret"), "nope").unwrap_err();
        assert!(matches!(err, TransporterError::Certificate(_)));
    }

    #[test]
    fn ec_key_is_unsupported() {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "ec").unwrap();
        let name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::from_unix(now() - 60).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::from_unix(now() + 86_400).unwrap())
            .unwrap();
        builder
            .sign(&key, openssl::hash::MessageDigest::sha256())
            .unwrap();
        let cert = builder.build();

        let der = Pkcs12::builder()
            .name("ec")
            .pkey(&key)
            .cert(&cert)
            .build2("pw")
            .unwrap()
            .to_der()
            .unwrap();
        let err = decode_keystore(&der, "pw").unwrap_err();
        assert!(matches!(err, TransporterError::Certificate(msg) if msg.contains("RSA")));
    }

    #[test]
    fn accepted_keystore_lands_on_disk() {
        let tmp = TempDir::new().unwrap();
        let store = CertStore::new(tmp.path());
        accept_keystore(&store, "sub", &bundle("pw"), "pw").unwrap();
        assert!(store.has_keystore("sub"));
        assert!(store.load("sub").identity.is_some());
    }

    #[test]
    fn tokens_are_single_use() {
        let vault = PassphraseVault::new();
        let token = vault.issue(b"secret").unwrap();
        assert_eq!(vault.take(&token).unwrap(), "secret");
        let err = vault.take(&token).unwrap_err();
        assert_eq!(err.to_string(), "No passphrase specified");
    }

    #[test]
    fn empty_passphrase_is_refused() {
        let vault = PassphraseVault::new();
        assert!(vault.issue(b"").is_err());
    }
}
