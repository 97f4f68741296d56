use super::{userinfo, ProviderContext};
use crate::error::{Result, TransporterError};
use crate::metrics::Protocol;
use crate::models::Subscriber;
use crate::properties::{
    apply_properties, parse_bool, parse_http_method, parse_timeout, PropertyRule, HTTP_METHOD,
    HTTPS_BYPASS_SSL_VERIFICATION, HTTP_TIMEOUT, MIME_TYPE,
};
use crate::tls::TlsMaterial;
use log::{debug, error};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

const MAX_IDLE_CONNECTIONS: usize = 10;

#[derive(Debug, Clone)]
struct HttpSettings {
    timeout: Duration,
    method: String,
    bypass_ssl_verification: bool,
    mime_type: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1_000),
            method: "POST".to_string(),
            bypass_ssl_verification: false,
            mime_type: "application/json".to_string(),
        }
    }
}

static HTTP_RULES: &[PropertyRule<HttpSettings>] = &[
    PropertyRule {
        key: HTTP_TIMEOUT,
        apply: |s, v| {
            s.timeout = parse_timeout(v)?;
            Ok(())
        },
    },
    PropertyRule {
        key: HTTP_METHOD,
        apply: |s, v| {
            s.method = parse_http_method(v)?;
            Ok(())
        },
    },
    PropertyRule {
        key: HTTPS_BYPASS_SSL_VERIFICATION,
        apply: |s, v| {
            s.bypass_ssl_verification = parse_bool(HTTPS_BYPASS_SSL_VERIFICATION, v)?;
            Ok(())
        },
    },
    PropertyRule {
        key: MIME_TYPE,
        apply: |s, v| {
            if v.trim().is_empty() {
                return Err("MimeType must not be empty".to_string());
            }
            s.mime_type = v.to_string();
            Ok(())
        },
    },
];

/// Sends every report as one HTTP request to the subscriber URI.
#[derive(Debug)]
pub struct HttpProvider {
    client: RwLock<Client>,
    url: Url,
    method: Method,
    credentials: Option<(String, String)>,
    settings: HttpSettings,
    ctx: ProviderContext,
    /// Set while a failure streak is running, so it is only logged once.
    failing: AtomicBool,
}

impl HttpProvider {
    pub fn new(subscriber: &Subscriber, url: &Url, ctx: &ProviderContext) -> Result<Self> {
        if url.host_str().map_or(true, str::is_empty) {
            return Err(TransporterError::validation("No host specified"));
        }

        let settings = apply_properties(
            "HTTP",
            HTTP_RULES,
            &subscriber.properties,
            &HttpSettings::default(),
        )?;
        let method = Method::from_bytes(settings.method.as_bytes()).map_err(|_| {
            TransporterError::validation(format!("Invalid HTTP method value '{}'", settings.method))
        })?;

        let credentials = match userinfo(url) {
            (user, Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        };
        let mut target = url.clone();
        // only fails for URLs that cannot carry credentials at all
        let _ = target.set_username("");
        let _ = target.set_password(None);

        let client = build_client(&settings, &TlsMaterial::default())?;

        Ok(Self {
            client: RwLock::new(client),
            url: target,
            method,
            credentials,
            settings,
            ctx: ctx.clone(),
            failing: AtomicBool::new(false),
        })
    }

    /// The topic is not used: every report goes to the subscriber URI.
    pub async fn publish(&self, _topic: &str, payload: &str) {
        let client = self.client.read().await.clone();
        let mut request = client
            .request(self.method.clone(), self.url.clone())
            .header(CONTENT_TYPE, self.settings.mime_type.as_str())
            .body(payload.to_string());
        if !self.settings.timeout.is_zero() {
            request = request.timeout(self.settings.timeout);
        }
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                if self.failing.swap(false, Ordering::SeqCst) {
                    debug!("HTTP delivery to {} recovered", self.url);
                }
                self.ctx.metrics.delivered(Protocol::Http);
            }
            Ok(response) => {
                let status = response.status();
                self.report_failure(format_args!("HTTP {}: {}", status.as_u16(), status));
            }
            Err(e) => self.report_failure(format_args!("{}", e)),
        }
    }

    fn report_failure(&self, reason: std::fmt::Arguments<'_>) {
        self.ctx.metrics.failed(Protocol::Http);
        if !self.failing.swap(true, Ordering::SeqCst) {
            error!("Publish to {} failed: {}", self.url, reason);
        }
    }

    /// Swaps in a client that trusts the stored anchor and presents the
    /// stored client certificate.
    pub async fn set_tls(&self, id: &str) -> Result<()> {
        let material = self.ctx.certs.load(id);
        let client = build_client(&self.settings, &material)?;
        *self.client.write().await = client;
        Ok(())
    }
}

fn build_client(settings: &HttpSettings, material: &TlsMaterial) -> Result<Client> {
    let builder = Client::builder()
        .cookie_store(true)
        .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
        .pool_idle_timeout((!settings.timeout.is_zero()).then_some(settings.timeout))
        .danger_accept_invalid_certs(settings.bypass_ssl_verification);
    material
        .apply_to_http(builder)
        .build()
        .map_err(|e| TransporterError::transport(format!("Failed to build HTTP client: {}", e)))
}
