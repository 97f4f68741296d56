use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

pub type SharedMetrics = Arc<PublishMetrics>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mqtt,
    Http,
    Tcp,
    Udp,
    Azure,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Mqtt,
        Protocol::Http,
        Protocol::Tcp,
        Protocol::Udp,
        Protocol::Azure,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Azure => "azure",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    queued: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Outcome counters for fire-and-forget publishes. Providers record here
/// instead of returning errors to the caller.
#[derive(Default)]
pub struct PublishMetrics {
    counters: [Counters; 5],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishCounts {
    pub delivered: u64,
    pub queued: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl PublishMetrics {
    pub fn new() -> SharedMetrics {
        Arc::new(Self::default())
    }

    pub fn delivered(&self, protocol: Protocol) {
        self.counters[protocol.index()]
            .delivered
            .fetch_add(1, Ordering::Relaxed);
        trace!(protocol = %protocol, outcome = "delivered", "publish");
    }

    /// Accepted into a client's outgoing queue; the broker has not
    /// acknowledged it yet.
    pub fn queued(&self, protocol: Protocol) {
        self.counters[protocol.index()]
            .queued
            .fetch_add(1, Ordering::Relaxed);
        trace!(protocol = %protocol, outcome = "queued", "publish");
    }

    pub fn failed(&self, protocol: Protocol) {
        self.counters[protocol.index()]
            .failed
            .fetch_add(1, Ordering::Relaxed);
        trace!(protocol = %protocol, outcome = "failed", "publish");
    }

    /// Message discarded before reaching the wire, e.g. a full MQTT queue.
    pub fn dropped(&self, protocol: Protocol) {
        self.counters[protocol.index()]
            .dropped
            .fetch_add(1, Ordering::Relaxed);
        trace!(protocol = %protocol, outcome = "dropped", "publish");
    }

    pub fn counts(&self, protocol: Protocol) -> PublishCounts {
        let c = &self.counters[protocol.index()];
        PublishCounts {
            delivered: c.delivered.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<Protocol, PublishCounts> {
        Protocol::ALL
            .iter()
            .map(|p| (*p, self.counts(*p)))
            .collect()
    }
}

impl fmt::Debug for PublishMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(Protocol::ALL.iter().map(|p| (p.as_str(), self.counts(*p))))
            .finish()
    }
}
