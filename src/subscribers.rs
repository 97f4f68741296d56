//! Subscriber registry: the configured destinations, their live providers and
//! the `subscribers.json` document they are persisted to.

use crate::error::{Result, TransporterError};
use crate::models::Subscriber;
use crate::provider::{parse_uri, Provider, ProviderContext};
use futures::future::join_all;
use tracing::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Reference counts the registry consults before mutating or removing a
/// subscriber.
pub trait UsageLocks {
    /// Subscriptors pointing at `subscriber_id`, enabled or not.
    fn reference_count(&self, subscriber_id: &str) -> usize;
    /// Enabled subscriptors pointing at `subscriber_id`.
    fn enabled_reference_count(&self, subscriber_id: &str) -> usize;
}

struct Entry {
    record: Subscriber,
    /// Shared so a publish can run after the table lock is released.
    provider: Option<Arc<Provider>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    subscribers: BTreeMap<String, Subscriber>,
}

pub struct SubscriberRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    file: PathBuf,
    ctx: ProviderContext,
}

impl SubscriberRegistry {
    /// Reads `file` and starts providers for every enabled subscriber.
    /// A missing or unreadable document starts an empty registry.
    pub async fn load(file: impl Into<PathBuf>, ctx: ProviderContext) -> Self {
        let file = file.into();
        let mut entries = HashMap::new();

        for (id, mut record) in read_document(&file).subscribers {
            record.id = id.clone();
            let provider = if record.enable {
                match start_provider(&record, &ctx).await {
                    Ok(provider) => Some(Arc::new(provider)),
                    Err(e) => {
                        warn!("Failed to create provider for {}: {}", id, e);
                        None
                    }
                }
            } else {
                None
            };
            entries.insert(id, Entry { record, provider });
        }

        info!("Loaded {} subscribers from {}", entries.len(), file.display());
        Self {
            entries: RwLock::new(entries),
            file,
            ctx,
        }
    }

    pub fn context(&self) -> &ProviderContext {
        &self.ctx
    }

    /// Stores a new subscriber under a generated id. Nothing is stored when
    /// the provider of an enabled subscriber cannot be built.
    pub async fn add(&self, mut subscriber: Subscriber) -> Result<String> {
        if !subscriber.id.is_empty() {
            return Err(TransporterError::validation("Subscriber ID must not be set"));
        }
        if subscriber.uri.trim().is_empty() {
            return Err(TransporterError::validation("Subscriber URI must be set"));
        }
        parse_uri(&subscriber.uri)?;

        let mut entries = self.entries.write().await;
        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        subscriber.id = id.clone();

        let provider = if subscriber.enable {
            let built = Provider::build(&subscriber, &self.ctx).await?;
            Some(Arc::new(built.provider))
        } else {
            None
        };

        info!("Subscriber {} added for {}", id, subscriber.uri);
        entries.insert(
            id.clone(),
            Entry {
                record: subscriber,
                provider,
            },
        );
        self.persist(&entries).await;
        Ok(id)
    }

    /// Replaces the configuration of an existing subscriber and restarts its
    /// provider. Refused while an enabled subscriptor routes through it.
    pub async fn set(&self, subscriber: Subscriber, locks: &impl UsageLocks) -> Result<()> {
        if subscriber.id.trim().is_empty() {
            return Err(TransporterError::validation("ID must not be null"));
        }
        if locks.enabled_reference_count(&subscriber.id) > 0 {
            return Err(TransporterError::conflict("Subscriber is locked"));
        }
        if subscriber.uri.trim().is_empty() {
            return Err(TransporterError::validation("Subscriber URI must be set"));
        }
        parse_uri(&subscriber.uri)?;

        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&subscriber.id).ok_or_else(|| {
            TransporterError::not_found(format!(
                "Subscriber with ID {} does not exist",
                subscriber.id
            ))
        })?;

        if let Some(old) = entry.provider.take() {
            old.shutdown().await;
        }

        if subscriber.enable {
            // on failure the previous record stays, without provider
            entry.provider = Some(Arc::new(start_provider(&subscriber, &self.ctx).await?));
        }

        debug!("Subscriber {} updated", subscriber.id);
        entry.record = subscriber;
        self.persist(&entries).await;
        Ok(())
    }

    /// Removes a subscriber no subscriptor references any more, together with
    /// its TLS material.
    pub async fn delete(&self, id: &str, locks: &impl UsageLocks) -> Result<()> {
        if id.trim().is_empty() {
            return Err(TransporterError::validation("ID must not be null"));
        }
        if locks.reference_count(id) > 0 {
            return Err(TransporterError::conflict("Subscriber is in use"));
        }

        let mut entries = self.entries.write().await;
        let entry = entries.remove(id).ok_or_else(|| {
            TransporterError::not_found(format!("Subscriber with ID {} does not exist", id))
        })?;
        if let Some(provider) = entry.provider {
            provider.shutdown().await;
        }
        if let Err(e) = self.ctx.certs.remove_all(id) {
            warn!("Failed to delete certificate folder of {}: {}", id, e);
        }

        info!("Subscriber {} deleted", id);
        self.persist(&entries).await;
        Ok(())
    }

    /// Rebinds TLS material on the live provider of an enabled subscriber.
    pub async fn update(&self, id: &str) -> Result<()> {
        let entries = self.entries.write().await;
        let entry = entries.get(id).ok_or_else(|| {
            TransporterError::not_found(format!("Subscriber with ID {} does not exist", id))
        })?;
        match (&entry.provider, entry.record.enable) {
            (Some(provider), true) => provider.set_tls(id).await,
            _ => Ok(()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Subscriber> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| {
                TransporterError::not_found(format!("Subscriber with ID {} does not exist", id))
            })
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// All records ordered by id.
    pub async fn list(&self) -> Vec<Subscriber> {
        let entries = self.entries.read().await;
        let mut records: Vec<Subscriber> =
            entries.values().map(|entry| entry.record.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn has_provider(&self, id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(id)
            .is_some_and(|entry| entry.provider.is_some())
    }

    /// Hands `payload` to the provider of `id`. Returns `false` when the
    /// subscriber is unknown or has no live provider.
    pub async fn publish(&self, id: &str, topic: &str, payload: &str) -> bool {
        let provider = match self.entries.read().await.get(id) {
            Some(entry) => entry.provider.clone(),
            None => {
                error!("Subscriptor subscriber {} does not exist", id);
                return false;
            }
        };
        match provider {
            Some(provider) => {
                provider.publish(topic, payload).await;
                true
            }
            None => false,
        }
    }

    /// Stops every provider. Records stay in place.
    pub async fn shutdown_all(&self) {
        let mut entries = self.entries.write().await;
        let providers: Vec<Arc<Provider>> = entries
            .values_mut()
            .filter_map(|entry| entry.provider.take())
            .collect();
        debug!("Shutting down {} providers", providers.len());
        join_all(providers.iter().map(|provider| provider.shutdown())).await;
    }

    async fn persist(&self, entries: &HashMap<String, Entry>) {
        let document = Document {
            subscribers: entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.record.clone()))
                .collect(),
        };
        let bytes = match encode_document(&document) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode subscriber configuration: {}", e);
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.file, bytes).await {
            error!(
                "Failed to create or open configuration file {}: {}",
                self.file.display(),
                e
            );
        }
    }
}

/// Builds the provider of an enabled record and binds TLS right away when the
/// protocol asks for it.
async fn start_provider(subscriber: &Subscriber, ctx: &ProviderContext) -> Result<Provider> {
    let built = Provider::build(subscriber, ctx).await?;
    if built.eager_tls {
        if let Err(e) = built.provider.set_tls(&subscriber.id).await {
            built.provider.shutdown().await;
            return Err(e);
        }
    }
    Ok(built.provider)
}

fn read_document(file: &Path) -> Document {
    let bytes = match std::fs::read(file) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Failed to read config {}: {}", file.display(), e);
            return Document::default();
        }
    };
    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        warn!("Failed to parse config {}: {}", file.display(), e);
        Document::default()
    })
}

fn encode_document(document: &Document) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    document.serialize(&mut serializer)?;
    out.push(b'\n');
    Ok(out)
}
