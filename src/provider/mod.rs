//! Transport providers backing enabled subscribers.
//!
//! A provider is picked from the subscriber URI scheme. Publishing is fire and
//! forget: failures are logged and counted, never returned.

pub mod azure;
pub mod http;
pub mod mqtt;
pub mod socket;

use crate::error::{Result, TransporterError};
use crate::metrics::SharedMetrics;
use crate::models::Subscriber;
use crate::tls::CertStore;
use percent_encoding::percent_decode_str;
use std::future::Future;
use std::time::Duration;
use url::Url;

pub use azure::AzureProvider;
pub use http::HttpProvider;
pub use mqtt::MqttProvider;
pub use socket::SocketProvider;

/// Shared collaborators handed to every provider constructor.
#[derive(Clone, Debug)]
pub struct ProviderContext {
    pub certs: CertStore,
    pub metrics: SharedMetrics,
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
}

#[derive(Debug)]
pub enum Provider {
    Mqtt(MqttProvider),
    Http(HttpProvider),
    Socket(SocketProvider),
    Azure(AzureProvider),
}

/// A freshly constructed provider and whether it wants its TLS material bound
/// right away.
#[derive(Debug)]
pub struct Built {
    pub provider: Provider,
    pub eager_tls: bool,
}

impl Provider {
    /// Builds the provider matching the scheme of `subscriber.uri`.
    pub async fn build(subscriber: &Subscriber, ctx: &ProviderContext) -> Result<Built> {
        if subscriber.uri.is_empty() {
            return Err(TransporterError::validation("URI must not be null"));
        }
        let url = parse_uri(&subscriber.uri)?;
        let (provider, eager_tls) = match url.scheme() {
            "mqtt" => (Provider::Mqtt(MqttProvider::new(subscriber, &url, ctx).await?), false),
            "mqtts" => (Provider::Mqtt(MqttProvider::new(subscriber, &url, ctx).await?), true),
            "http" => (Provider::Http(HttpProvider::new(subscriber, &url, ctx)?), false),
            "https" => (Provider::Http(HttpProvider::new(subscriber, &url, ctx)?), true),
            "tcp" | "udp" => (Provider::Socket(SocketProvider::new(subscriber, &url, ctx)?), false),
            "azure" => (Provider::Azure(AzureProvider::new(subscriber, ctx).await?), false),
            other => {
                return Err(TransporterError::validation(format!(
                    "Unsupported scheme {}",
                    other
                )))
            }
        };
        Ok(Built {
            provider,
            eager_tls,
        })
    }

    pub async fn publish(&self, topic: &str, payload: &str) {
        match self {
            Provider::Mqtt(p) => p.publish(topic, payload).await,
            Provider::Http(p) => p.publish(topic, payload).await,
            Provider::Socket(p) => p.publish(topic, payload).await,
            Provider::Azure(p) => p.publish(topic, payload).await,
        }
    }

    /// Releases network resources. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        match self {
            Provider::Mqtt(p) => p.shutdown().await,
            Provider::Http(_) | Provider::Socket(_) => {}
            Provider::Azure(p) => p.shutdown().await,
        }
    }

    /// Rebuilds the TLS configuration from the material stored for `id`.
    pub async fn set_tls(&self, id: &str) -> Result<()> {
        match self {
            Provider::Mqtt(p) => p.set_tls(id).await,
            Provider::Http(p) => p.set_tls(id).await,
            Provider::Socket(_) | Provider::Azure(_) => Ok(()),
        }
    }
}

pub(crate) fn parse_uri(uri: &str) -> Result<Url> {
    Url::parse(uri)
        .map_err(|e| TransporterError::validation(format!("Can't parse subscriber URI: {}", e)))
}

/// Awaits `fut` for at most `limit`, `None` once it elapsed. A zero limit
/// waits without deadline.
pub(crate) async fn within<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    if limit.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(limit, fut).await.ok()
    }
}

/// Percent-decoded URI user name and password.
pub(crate) fn userinfo(url: &Url) -> (String, Option<String>) {
    let decode = |raw: &str| percent_decode_str(raw).decode_utf8_lossy().into_owned();
    (decode(url.username()), url.password().map(decode))
}
