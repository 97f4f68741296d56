//! Subscriptor registry: named report routes and the per-subscriber usage
//! counters that lock subscribers against change.
//!
//! The route table and both counter maps share one lock. Callers that need
//! the registry and the subscriber table together always take this lock
//! first.

use crate::error::{Result, TransporterError};
use crate::models::Subscriptor;
use crate::subscribers::{SubscriberRegistry, UsageLocks};
use tracing::{debug, error};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use uuid::Uuid;

#[derive(Default)]
struct Table {
    routes: HashMap<String, Subscriptor>,
    /// subscriber id -> ids of all subscriptors targeting it
    subs: HashMap<String, HashSet<String>>,
    /// subscriber id -> ids of the enabled ones
    sub_enabled: HashMap<String, HashSet<String>>,
}

impl Table {
    fn link(&mut self, route: &Subscriptor) {
        self.subs
            .entry(route.subscriber_id.clone())
            .or_default()
            .insert(route.id.clone());
        let enabled = self
            .sub_enabled
            .entry(route.subscriber_id.clone())
            .or_default();
        if route.enable {
            enabled.insert(route.id.clone());
        } else {
            enabled.remove(&route.id);
        }
    }

    fn unlink(&mut self, subscriber_id: &str, route_id: &str) {
        for counters in [&mut self.subs, &mut self.sub_enabled] {
            if let Some(set) = counters.get_mut(subscriber_id) {
                set.remove(route_id);
                if set.is_empty() {
                    counters.remove(subscriber_id);
                }
            }
        }
    }
}

/// Read access to the usage counters. Holding it keeps subscriptors from
/// being added, changed or removed.
pub struct UsageGuard<'a> {
    table: RwLockReadGuard<'a, Table>,
}

impl UsageLocks for UsageGuard<'_> {
    fn reference_count(&self, subscriber_id: &str) -> usize {
        self.table.subs.get(subscriber_id).map_or(0, HashSet::len)
    }

    fn enabled_reference_count(&self, subscriber_id: &str) -> usize {
        self.table.sub_enabled.get(subscriber_id).map_or(0, HashSet::len)
    }
}

pub struct SubscriptorRegistry {
    table: RwLock<Table>,
    subscribers: Arc<SubscriberRegistry>,
}

impl SubscriptorRegistry {
    pub fn new(subscribers: Arc<SubscriberRegistry>) -> Self {
        Self {
            table: RwLock::new(Table::default()),
            subscribers,
        }
    }

    pub async fn usage(&self) -> UsageGuard<'_> {
        UsageGuard {
            table: self.table.read().await,
        }
    }

    async fn validate(&self, route: &Subscriptor) -> Result<()> {
        if route.name.trim().is_empty() {
            return Err(TransporterError::validation("Subscriptor must have a name"));
        }
        if route.subscriber_id.trim().is_empty() {
            return Err(TransporterError::validation(
                "Subscriptor must have a subscriber",
            ));
        }
        if !self.subscribers.contains(&route.subscriber_id).await {
            return Err(TransporterError::validation(
                "Subscriptor subscriber does not exist",
            ));
        }
        Ok(())
    }

    /// Registers a subscriptor under its caller-chosen id.
    pub async fn add(&self, route: Subscriptor) -> Result<()> {
        if route.id.trim().is_empty() {
            return Err(TransporterError::validation("Subscriptor ID must be set"));
        }
        let mut table = self.table.write().await;
        if table.routes.contains_key(&route.id) {
            return Err(TransporterError::conflict(format!(
                "Subscriptor with Id {} already exists",
                route.id
            )));
        }
        self.validate(&route).await?;

        table.link(&route);
        debug!("Subscriptor {} routes to {}", route.id, route.subscriber_id);
        table.routes.insert(route.id.clone(), route);
        Ok(())
    }

    /// Registers a subscriptor under a generated id and returns it.
    pub async fn define(&self, mut route: Subscriptor) -> Result<String> {
        if !route.id.is_empty() {
            return Err(TransporterError::validation("Subscriptor ID must not be set"));
        }
        let mut table = self.table.write().await;
        self.validate(&route).await?;

        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !table.routes.contains_key(&candidate) {
                break candidate;
            }
        };
        route.id = id.clone();
        table.link(&route);
        table.routes.insert(id.clone(), route);
        Ok(id)
    }

    /// Replaces a stored subscriptor. A route that is enabled before and
    /// after cannot be changed in one step.
    pub async fn update(&self, route: Subscriptor) -> Result<()> {
        let mut table = self.table.write().await;
        let stored = table.routes.get(&route.id).ok_or_else(|| {
            TransporterError::not_found(format!(
                "Subscriptor with Id {} has not been initialized",
                route.id
            ))
        })?;
        if stored.enable && route.enable {
            return Err(TransporterError::conflict("Can't update an used subscriptor"));
        }
        let previous_target = stored.subscriber_id.clone();
        if let Err(e) = self.validate(&route).await {
            error!("{}", e);
            return Err(e);
        }

        if previous_target != route.subscriber_id {
            table.unlink(&previous_target, &route.id);
        }
        table.link(&route);
        table.routes.insert(route.id.clone(), route);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut table = self.table.write().await;
        let route = table.routes.remove(id).ok_or_else(|| {
            TransporterError::not_found(format!(
                "Subscriptor with Id {} has not been initialized",
                id
            ))
        })?;
        table.unlink(&route.subscriber_id, id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Subscriptor> {
        self.table
            .read()
            .await
            .routes
            .get(id)
            .cloned()
            .ok_or_else(|| {
                TransporterError::not_found(format!(
                    "Subscriptor with Id {} has not been initialized",
                    id
                ))
            })
    }

    pub async fn list(&self) -> Vec<Subscriptor> {
        let table = self.table.read().await;
        let mut routes: Vec<Subscriptor> = table.routes.values().cloned().collect();
        routes.sort_by(|a, b| a.id.cmp(&b.id));
        routes
    }

    /// Publishes the string form of `report` on the path of subscriptor `id`.
    /// Unknown routes, missing subscribers and disabled subscribers drop the
    /// report.
    pub async fn send_report<R: Display + ?Sized>(&self, id: &str, report: &R) {
        let target = {
            let table = self.table.read().await;
            table
                .routes
                .get(id)
                .map(|route| (route.subscriber_id.clone(), route.path.clone()))
        };
        let Some((subscriber_id, path)) = target else {
            error!("Subscriptor {} does not exist", id);
            return;
        };
        if !self
            .subscribers
            .publish(&subscriber_id, &path, &report.to_string())
            .await
        {
            debug!("Report of subscriptor {} dropped, no active provider", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Subscriber;
    use crate::provider::test_support::context;
    use tempfile::TempDir;

    async fn setup(tmp: &TempDir) -> (Arc<SubscriberRegistry>, SubscriptorRegistry, String) {
        let subscribers = Arc::new(
            SubscriberRegistry::load(tmp.path().join("subscribers.json"), context(tmp.path()))
                .await,
        );
        let subscriber_id = subscribers
            .add(Subscriber::new("tcp://127.0.0.1:9000", false))
            .await
            .unwrap();
        let routes = SubscriptorRegistry::new(subscribers.clone());
        (subscribers, routes, subscriber_id)
    }

    #[tokio::test]
    async fn define_counts_references() {
        let tmp = TempDir::new().unwrap();
        let (_, routes, target) = setup(&tmp).await;

        let enabled = routes
            .define(Subscriptor::new("a", "x", target.as_str(), true))
            .await
            .unwrap();
        routes
            .define(Subscriptor::new("b", "y", target.as_str(), false))
            .await
            .unwrap();

        let usage = routes.usage().await;
        assert_eq!(usage.reference_count(&target), 2);
        assert_eq!(usage.enabled_reference_count(&target), 1);
        drop(usage);

        routes.delete(&enabled).await.unwrap();
        let usage = routes.usage().await;
        assert_eq!(usage.reference_count(&target), 1);
        assert_eq!(usage.enabled_reference_count(&target), 0);
    }

    #[tokio::test]
    async fn validation_rules() {
        let tmp = TempDir::new().unwrap();
        let (_, routes, target) = setup(&tmp).await;

        assert!(routes
            .define(Subscriptor::new("  ", "x", target.as_str(), true))
            .await
            .is_err());
        assert!(routes
            .define(Subscriptor::new("n", "x", "unknown", true))
            .await
            .is_err());

        let mut with_id = Subscriptor::new("n", "x", target.as_str(), true);
        with_id.id = "fixed".to_string();
        assert!(routes.define(with_id.clone()).await.is_err());
        routes.add(with_id.clone()).await.unwrap();
        assert!(matches!(
            routes.add(with_id).await,
            Err(TransporterError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn update_moves_counters_and_refuses_live_swap() {
        let tmp = TempDir::new().unwrap();
        let (subscribers, routes, first) = setup(&tmp).await;
        let second = subscribers
            .add(Subscriber::new("udp://127.0.0.1:9000", false))
            .await
            .unwrap();

        let id = routes
            .define(Subscriptor::new("r", "p", first.as_str(), true))
            .await
            .unwrap();
        let mut moved = routes.get(&id).await.unwrap();
        moved.subscriber_id = second.clone();
        assert!(matches!(
            routes.update(moved.clone()).await,
            Err(TransporterError::Conflict(_))
        ));

        moved.enable = false;
        routes.update(moved.clone()).await.unwrap();
        {
            let usage = routes.usage().await;
            assert_eq!(usage.reference_count(&first), 0);
            assert_eq!(usage.reference_count(&second), 1);
            assert_eq!(usage.enabled_reference_count(&second), 0);
        }

        moved.enable = true;
        routes.update(moved).await.unwrap();
        assert_eq!(routes.usage().await.enabled_reference_count(&second), 1);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let (_, routes, _) = setup(&tmp).await;
        assert!(matches!(
            routes.delete("nope").await,
            Err(TransporterError::NotFound(_))
        ));
        routes.send_report("nope", "ignored").await;
    }
}
