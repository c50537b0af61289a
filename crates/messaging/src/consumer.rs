//! Partitioned consumer runtime with in-place retry and dead-lettering.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventEnvelope;
use common::topics::dead_letter_topic;
use resource_lock::Backoff;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::broker::{BrokerRecord, MessageBroker, ProducerRecord, Subscription};
use crate::error::HandlerError;

/// Processes records of one topic.
///
/// Business failures are not errors here: a handler that rejects a command
/// publishes the failure event through its outbox and returns `Ok`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Step name recorded on dead letters (e.g. `"stock-decrease"`).
    fn name(&self) -> &'static str;

    async fn handle(&self, envelope: EventEnvelope, record: &BrokerRecord) -> Result<(), HandlerError>;
}

/// A record that could not be processed, as published on `<topic>-dlt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_topic: String,
    pub key: String,
    pub order_id: Option<String>,
    pub step: String,
    pub partition: u32,
    pub offset: u64,
    pub attempts: u32,
    pub error: String,
    pub payload: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    fn new(record: &BrokerRecord, step: &str, attempts: u32, error: &HandlerError) -> Self {
        Self {
            original_topic: record.topic.clone(),
            key: record.key.clone(),
            order_id: order_id_of(&record.payload),
            step: step.to_string(),
            partition: record.partition,
            offset: record.offset,
            attempts,
            error: error.to_string(),
            payload: record.payload.clone(),
            failed_at: Utc::now(),
        }
    }
}

fn order_id_of(payload: &str) -> Option<String> {
    let envelope = EventEnvelope::from_json(payload).ok()?;
    envelope
        .payload
        .get("order_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Runs a handler over every partition of a subscription.
pub struct ConsumerWorker;

impl ConsumerWorker {
    /// Spawns one task per partition. Records of a partition are handled one
    /// at a time, in offset order; partitions run in parallel.
    pub fn spawn(
        subscription: Subscription,
        handler: Arc<dyn MessageHandler>,
        backoff: Backoff,
        dead_letters: Arc<dyn MessageBroker>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let group = Arc::<str>::from(subscription.group.as_str());
        subscription
            .partitions
            .into_iter()
            .enumerate()
            .map(|(partition, receiver)| {
                let worker = PartitionWorker {
                    group: group.clone(),
                    partition: partition as u32,
                    handler: handler.clone(),
                    backoff,
                    dead_letters: dead_letters.clone(),
                };
                tokio::spawn(worker.run(receiver, shutdown.clone()))
            })
            .collect()
    }
}

struct PartitionWorker {
    group: Arc<str>,
    partition: u32,
    handler: Arc<dyn MessageHandler>,
    backoff: Backoff,
    dead_letters: Arc<dyn MessageBroker>,
}

impl PartitionWorker {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<BrokerRecord>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                record = receiver.recv() => match record {
                    Some(record) => self.process(record).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(group = %self.group, partition = self.partition, "partition worker stopped");
    }

    #[tracing::instrument(
        skip(self, record),
        fields(group = %self.group, step = self.handler.name(), partition = record.partition, offset = record.offset, key = %record.key)
    )]
    async fn process(&self, record: BrokerRecord) {
        let envelope = match EventEnvelope::from_json(&record.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                let error = HandlerError::Permanent(format!("malformed envelope: {e}"));
                self.dead_letter(&record, 1, &error).await;
                return;
            }
        };

        let attempts = AtomicU32::new(0);
        let (handler, envelope, record_ref, attempts_ref) = (&self.handler, &envelope, &record, &attempts);
        let result = self
            .backoff
            .retry(
                move || {
                    attempts_ref.fetch_add(1, Ordering::Relaxed);
                    handler.handle(envelope.clone(), record_ref)
                },
                HandlerError::is_transient,
            )
            .await;

        if let Err(error) = result {
            self.dead_letter(&record, attempts.load(Ordering::Relaxed), &error).await;
        }
    }

    async fn dead_letter(&self, record: &BrokerRecord, attempts: u32, error: &HandlerError) {
        let letter = DeadLetter::new(record, self.handler.name(), attempts, error);
        tracing::error!(
            error = %error,
            attempts,
            order_id = letter.order_id.as_deref().unwrap_or("unknown"),
            "record routed to dead-letter topic"
        );
        metrics::counter!("consumer_dlt_total", "step" => self.handler.name()).increment(1);

        let payload = match serde_json::to_string(&letter) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "dead letter could not be serialized");
                return;
            }
        };
        let dlt = ProducerRecord {
            topic: dead_letter_topic(&record.topic),
            key: record.key.clone(),
            payload,
        };
        if let Err(e) = self.dead_letters.send(dlt).await {
            tracing::error!(error = %e, "dead letter could not be published");
        }
    }
}
