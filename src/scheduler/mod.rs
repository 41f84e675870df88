//! Queue-of-queues task scheduler.
//!
//! Tasks sharing a queue key live in one store list. Workers either drain a
//! known queue or ask for work from any queue accepted by a predicate:
//!
//! - **TaskScheduler**: enqueue, dequeue by key or predicate, inactive queue discovery
//! - **Listener**: in-process waiter for predicate dequeues
//! - **ActiveQueueTracker**: write-through cache of queue activity
//!
//! # Architecture
//!
//! ```text
//!    ┌──────────┐  enqueue   ┌──────────────────┐
//!    │ Producer ├───────────►│ {prefix}/queue/* │
//!    └──────────┘            └────────┬─────────┘
//!                                     │ new queue
//!                             ┌───────▼────────┐
//!                             │ notification   │
//!                             │     loop       │
//!                             └───────┬────────┘
//!              ┌──────────────────────┼──────────────────────┐
//!              ▼                      ▼                      ▼
//!        ┌──────────┐           ┌──────────┐           ┌──────────┐
//!        │Listener 1│           │Listener 2│           │Listener N│
//!        └──────────┘           └──────────┘           └──────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use farm_scheduler::scheduler::{SchedulerConfig, TaskScheduler};
//! use farm_scheduler::store::MemoryQueueStore;
//! use farm_scheduler::clock::SystemClock;
//! use futures::FutureExt;
//! use tokio_util::sync::CancellationToken;
//!
//! let scheduler: TaskScheduler<QueueKey, ComputeTask> = TaskScheduler::new(
//!     Arc::new(MemoryQueueStore::new()),
//!     SchedulerConfig::default(),
//!     Arc::new(SystemClock),
//! );
//! scheduler.start().await?;
//!
//! scheduler.enqueue(&key, &task, false).await?;
//! let next = scheduler
//!     .dequeue_matching(|key| async move { key.cluster_id == "default" }.boxed(), &CancellationToken::new())
//!     .await?;
//!
//! scheduler.shutdown().await;
//! ```
//!
//! # Delivery
//!
//! - **At least once**: a popped task that cannot be handed to a caller goes back to the front of its queue
//! - **FIFO per queue**: front inserts jump ahead, there is no order across queues
//! - **Bounded staleness**: queues nobody drains show up in `inactive_queues`

pub mod codec;
pub mod listener;
pub mod liveness;
pub mod task_scheduler;

pub use codec::{decode_json, encode_json, QueueId, QueueItem, StoreCodec};
pub use listener::QueuePredicate;
pub use liveness::ActiveQueueTracker;
pub use task_scheduler::{SchedulerConfig, TaskScheduler};
