//! Application context tying the registries, the TLS material store and the
//! passphrase vault together. One instance is built at startup and shared
//! with the REST layer and report producers.

use crate::config::Config;
use crate::error::{Result, TransporterError};
use crate::keystore::{accept_keystore, PassphraseVault};
use crate::metrics::{PublishCounts, PublishMetrics, Protocol, SharedMetrics};
use crate::models::{Subscriber, Subscriptor};
use crate::provider::ProviderContext;
use crate::subscribers::SubscriberRegistry;
use crate::subscriptors::SubscriptorRegistry;
use crate::tls::{create_private_dir, CertStore};
use tracing::info;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

pub struct Transport {
    subscribers: Arc<SubscriberRegistry>,
    subscriptors: SubscriptorRegistry,
    certs: CertStore,
    vault: PassphraseVault,
    metrics: SharedMetrics,
}

impl Transport {
    /// Creates the configuration directory if needed and loads the persisted
    /// subscribers.
    pub async fn open(config: &Config) -> Result<Self> {
        create_private_dir(&config.conf_dir)?;

        let certs = CertStore::new(config.certs_dir());
        let metrics = PublishMetrics::new();
        let ctx = ProviderContext {
            certs: certs.clone(),
            metrics: metrics.clone(),
            retry_interval: config.mqtt_retry_interval(),
            max_retry_interval: config.mqtt_max_retry_interval(),
        };

        let subscribers = Arc::new(SubscriberRegistry::load(config.subscribers_file(), ctx).await);
        let subscriptors = SubscriptorRegistry::new(subscribers.clone());
        info!("Transport configuration opened at {}", config.conf_dir.display());

        Ok(Self {
            subscribers,
            subscriptors,
            certs,
            vault: PassphraseVault::new(),
            metrics,
        })
    }

    pub async fn add_subscriber(&self, subscriber: Subscriber) -> Result<String> {
        self.subscribers.add(subscriber).await
    }

    pub async fn get_subscriber(&self, id: &str) -> Result<Subscriber> {
        self.subscribers.get(id).await
    }

    pub async fn list_subscribers(&self) -> Vec<Subscriber> {
        self.subscribers.list().await
    }

    pub async fn has_provider(&self, id: &str) -> bool {
        self.subscribers.has_provider(id).await
    }

    pub async fn set_subscriber(&self, subscriber: Subscriber) -> Result<()> {
        let usage = self.subscriptors.usage().await;
        self.subscribers.set(subscriber, &usage).await
    }

    pub async fn delete_subscriber(&self, id: &str) -> Result<()> {
        let usage = self.subscriptors.usage().await;
        self.subscribers.delete(id, &usage).await
    }

    /// Publishes straight to a subscriber, bypassing subscriptor routing.
    pub async fn publish(&self, subscriber_id: &str, topic: &str, payload: &str) -> bool {
        self.subscribers.publish(subscriber_id, topic, payload).await
    }

    async fn require_subscriber(&self, id: &str) -> Result<()> {
        if self.subscribers.contains(id).await {
            Ok(())
        } else {
            Err(TransporterError::not_found(format!(
                "Subscriber with ID {} does not exist",
                id
            )))
        }
    }

    /// Stores a PEM trust anchor and rebinds TLS on the live provider.
    pub async fn set_trust_anchor(&self, id: &str, pem: &[u8]) -> Result<()> {
        self.require_subscriber(id).await?;
        self.certs.set_trust_anchor(id, pem)?;
        self.rebind(id).await
    }

    /// `false` for unknown subscribers.
    pub async fn has_trust_anchor(&self, id: &str) -> bool {
        self.subscribers.contains(id).await && self.certs.has_trust_anchor(id)
    }

    pub async fn delete_trust_anchor(&self, id: &str) -> Result<()> {
        self.require_subscriber(id).await?;
        self.certs.delete_trust_anchor(id)
    }

    /// Redeems `token`, decodes the PKCS#12 `bundle` with its passphrase and
    /// stores the client key pair of `id`. The token is spent even when the
    /// upload fails.
    pub async fn set_keystore(&self, id: &str, bundle: &[u8], token: &str) -> Result<()> {
        let passphrase = self.vault.take(token)?;
        self.require_subscriber(id).await?;
        accept_keystore(&self.certs, id, bundle, &passphrase)?;
        self.rebind(id).await
    }

    /// `false` for unknown subscribers.
    pub async fn has_keystore(&self, id: &str) -> bool {
        self.subscribers.contains(id).await && self.certs.has_keystore(id)
    }

    pub async fn delete_keystore(&self, id: &str) -> Result<()> {
        self.require_subscriber(id).await?;
        self.certs.delete_keystore(id)
    }

    pub fn issue_passphrase_token(&self, passphrase: &[u8]) -> Result<String> {
        self.vault.issue(passphrase)
    }

    /// The subscriber may have been deleted since the upload started.
    async fn rebind(&self, id: &str) -> Result<()> {
        match self.subscribers.update(id).await {
            Err(TransporterError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn add_subscriptor(&self, subscriptor: Subscriptor) -> Result<()> {
        self.subscriptors.add(subscriptor).await
    }

    pub async fn define_subscriptor(&self, subscriptor: Subscriptor) -> Result<String> {
        self.subscriptors.define(subscriptor).await
    }

    pub async fn update_subscriptor(&self, subscriptor: Subscriptor) -> Result<()> {
        self.subscriptors.update(subscriptor).await
    }

    pub async fn delete_subscriptor(&self, id: &str) -> Result<()> {
        self.subscriptors.delete(id).await
    }

    pub async fn get_subscriptor(&self, id: &str) -> Result<Subscriptor> {
        self.subscriptors.get(id).await
    }

    pub async fn list_subscriptors(&self) -> Vec<Subscriptor> {
        self.subscriptors.list().await
    }

    pub async fn send_report<R: Display + ?Sized>(&self, subscriptor_id: &str, report: &R) {
        self.subscriptors.send_report(subscriptor_id, report).await
    }

    pub fn metrics(&self) -> BTreeMap<Protocol, PublishCounts> {
        self.metrics.snapshot()
    }

    pub async fn shutdown(&self) {
        self.subscribers.shutdown_all().await;
        info!("All providers stopped");
    }
}
