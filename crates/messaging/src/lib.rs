//! Reliable messaging between services.
//!
//! - [`LocalDatabase`]: a service's business tables plus its outbox table,
//!   committed together.
//! - [`PostgresOutboxStore`]: the same outbox table in PostgreSQL.
//! - [`MessageRelay`]: after-commit delivery plus a periodic sweep; rows are
//!   deleted only once the broker acknowledged them.
//! - [`MessageBroker`] / [`InMemoryBroker`]: keyed, partitioned topics.
//! - [`ConsumerWorker`]: per-partition handler loops with bounded retry and
//!   dead-lettering.

pub mod broker;
pub mod consumer;
pub mod error;
pub mod local;
pub mod outbox;
pub mod postgres;
pub mod relay;
pub mod scheduler;

pub use broker::{BrokerRecord, InMemoryBroker, MessageBroker, ProducerRecord, RecordMetadata, Subscription};
pub use consumer::{ConsumerWorker, DeadLetter, MessageHandler};
pub use error::{HandlerError, MessagingError, Result};
pub use local::{Committed, LocalDatabase, Transaction};
pub use outbox::{OutboxMessage, OutboxStore};
pub use postgres::PostgresOutboxStore;
pub use relay::{MessageRelay, RelayConfig, SweepReport};
pub use scheduler::FixedSchedule;
