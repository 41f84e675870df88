//! Compute task service.
//!
//! Clients submit task references in bulk, grouped by cluster and
//! requirements hash. Agents ask for leases; the service hands each agent a
//! task whose requirements it satisfies and reports every lifecycle change on
//! the client's status channel.
//!
//! # Components
//!
//! - [`ComputeService`]: lease assignment, lifecycle statuses, expiry sweep
//! - [`ClusterCache`] / [`ClusterRegistry`]: where each cluster keeps its blobs
//! - [`RequirementsCache`]: requirements documents keyed by content hash
//! - [`Requirements`] / [`Agent`]: condition and resource matching
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use farm_scheduler::compute::{Agent, ComputeService, StaticClusterRegistry};
//!
//! let service = ComputeService::new(store, blobs, Arc::new(StaticClusterRegistry::default()), &config, clock);
//! service.start().await?;
//! service.add_tasks("default", "chan-1", &task_refs, &requirements_hash).await?;
//!
//! let agent = Agent::new("agent-1").with_property("OSFamily=Linux");
//! if let Some(lease) = service.assign_lease(&agent, &cancel).await? {
//!     // run the task described by lease.payload
//! }
//! ```

pub mod cache;
pub mod cluster;
pub mod requirements;
pub mod service;
pub mod types;

pub use cache::{CacheStats, RequirementsCache};
pub use cluster::{ClusterCache, ClusterConfig, ClusterRegistry, StaticClusterRegistry};
pub use requirements::{Agent, CompiledRequirements, Condition, Requirements};
pub use service::ComputeService;
pub use types::{
    ComputeTask, ComputeTaskMessage, ComputeTaskResult, Lease, LeaseOutcome, QueueKey, TaskOutcome,
    TaskState, TaskStatus,
};
