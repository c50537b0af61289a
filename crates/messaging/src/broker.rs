//! Message broker abstraction and an in-memory partitioned broker.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{MessagingError, Result};

/// Records kept per topic for replay to late subscribers.
pub const DEFAULT_RETENTION: usize = 10_000;

/// A message handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: String,
    pub payload: String,
}

/// Where the broker stored a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    pub partition: u32,
    pub offset: u64,
}

/// A record as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

/// The producer side of a broker.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Sends a record and waits for the broker's acknowledgement.
    async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata>;
}

/// Per-partition receivers for one consumer group on one topic.
#[derive(Debug)]
pub struct Subscription {
    pub topic: String,
    pub group: String,
    pub partitions: Vec<mpsc::UnboundedReceiver<BrokerRecord>>,
}

#[derive(Default)]
struct TopicState {
    next_offsets: HashMap<u32, u64>,
    log: VecDeque<BrokerRecord>,
    groups: HashMap<String, Vec<mpsc::UnboundedSender<BrokerRecord>>>,
}

struct BrokerInner {
    partitions: u32,
    retention: usize,
    topics: Mutex<HashMap<String, TopicState>>,
    available: AtomicBool,
    latency: Mutex<Duration>,
}

/// Partitioned in-process broker.
///
/// Records with the same key always land on the same partition, and every
/// partition of a consumer group is delivered in offset order. Each
/// consumer group receives every record of the topics it subscribed to,
/// including the retained records sent before it subscribed. Each topic
/// keeps at most `retention` records; older ones are dropped.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self::with_retention(partitions, DEFAULT_RETENTION)
    }

    pub fn with_retention(partitions: u32, retention: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                partitions: partitions.max(1),
                retention: retention.max(1),
                topics: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                latency: Mutex::new(Duration::ZERO),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    /// Marks the broker reachable or unreachable. Sends fail while unreachable.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Delays every send acknowledgement by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut current) = self.inner.latency.lock() {
            *current = latency;
        }
    }

    /// Subscribes `group` to `topic`.
    pub fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription> {
        let mut topics = self.topics()?;
        let state = topics.entry(topic.to_string()).or_default();

        let mut senders = Vec::with_capacity(self.inner.partitions as usize);
        let mut receivers = Vec::with_capacity(self.inner.partitions as usize);
        for _ in 0..self.inner.partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }
        for record in &state.log {
            let _ = senders[record.partition as usize].send(record.clone());
        }
        state.groups.insert(group.to_string(), senders);

        Ok(Subscription {
            topic: topic.to_string(),
            group: group.to_string(),
            partitions: receivers,
        })
    }

    /// Retained records of `topic`, in send order.
    pub fn records(&self, topic: &str) -> Vec<BrokerRecord> {
        self.topics()
            .map(|topics| {
                topics
                    .get(topic)
                    .map(|state| state.log.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.inner.partitions)) as u32
    }

    fn topics(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, TopicState>>> {
        self.inner
            .topics
            .lock()
            .map_err(|_| MessagingError::Broker("topic table poisoned".into()))
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata> {
        let latency = self
            .inner
            .latency
            .lock()
            .map(|l| *l)
            .unwrap_or(Duration::ZERO);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(MessagingError::Broker("broker unavailable".into()));
        }

        let partition = self.partition_for(&record.key);
        let mut topics = self.topics()?;
        let state = topics.entry(record.topic.clone()).or_default();

        let offset = state.next_offsets.entry(partition).or_insert(0);
        let stored = BrokerRecord {
            topic: record.topic,
            partition,
            offset: *offset,
            key: record.key,
            payload: record.payload,
            timestamp: Utc::now(),
        };
        *offset += 1;

        for senders in state.groups.values() {
            let _ = senders[partition as usize].send(stored.clone());
        }
        let metadata = RecordMetadata {
            partition,
            offset: stored.offset,
        };
        state.log.push_back(stored);
        while state.log.len() > self.inner.retention {
            state.log.pop_front();
        }
        Ok(metadata)
    }
}
