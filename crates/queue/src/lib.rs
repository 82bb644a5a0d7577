//! Remote execution queues for mazepa.
//!
//! A [`RemoteExecutionQueue`] sends task specs to a work queue and drains
//! outcomes from an outcome queue; [`Worker`]s sit on the other side.

pub mod broker;
pub mod config;
pub mod memory;
pub mod remote;
pub mod sqs;
pub mod worker;

pub use broker::{MessageBroker, QueueHealth, QueueMessage};
pub use config::{outcome_queue_name, work_queue_name, AwsConfig, SqsQueueConfig};
pub use mazepa_core::QueueError;
pub use memory::MemoryBroker;
pub use remote::{LeasedTask, RemoteExecutionQueue, SqsExecutionQueue};
pub use sqs::SqsBroker;
pub use worker::{generated_worker_name, Worker, WorkerStats};
