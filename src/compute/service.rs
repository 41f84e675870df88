//! Task lifecycle orchestration.
//!
//! The service turns queued task references into leases for agents and
//! reports every lifecycle transition on the task's status channel:
//!
//! ```text
//! add_tasks ──► queued ──► assign_lease ──► on_lease_started ──► on_lease_finished
//!                 │             │                (executing)          (complete)
//!                 │             └─ missing cluster/requirements ──► complete{failed|blob_not_found}
//!                 └─ nobody draining the queue ──► sweep ──► complete{expired}
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cache::{CacheStats, RequirementsCache};
use super::cluster::{ClusterCache, ClusterConfig, ClusterRegistry};
use super::requirements::{Agent, CompiledRequirements, Requirements};
use super::types::{
    ComputeTask, ComputeTaskMessage, ComputeTaskResult, Lease, LeaseOutcome, QueueKey,
    TaskOutcome, TaskStatus,
};
use crate::blob::{validate_hash, BlobStore};
use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::error::{BlobError, ComputeError};
use crate::messages::MessageQueue;
use crate::metrics::MetricsCollector;
use crate::scheduler::TaskScheduler;
use crate::store::QueueStore;

/// What is known about the queue a task came from.
enum Resolution {
    MissingCluster,
    MissingRequirements {
        outcome: TaskOutcome,
        detail: String,
    },
    Ready {
        cluster: ClusterConfig,
        requirements: Arc<CompiledRequirements>,
    },
}

struct ServiceInner {
    scheduler: TaskScheduler<QueueKey, ComputeTask>,
    messages: MessageQueue<TaskStatus>,
    clusters: ClusterCache,
    blobs: Arc<dyn BlobStore>,
    requirements: RequirementsCache,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
}

/// Compute task service over a scheduler and a status message queue.
pub struct ComputeService {
    inner: Arc<ServiceInner>,
    sweep_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ComputeService {
    pub fn new(
        store: Arc<dyn QueueStore>,
        blobs: Arc<dyn BlobStore>,
        registry: Arc<dyn ClusterRegistry>,
        config: &ServiceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        let scheduler = TaskScheduler::new(
            Arc::clone(&store),
            config.scheduler_config(),
            Arc::clone(&clock),
        );
        let messages = MessageQueue::new(store, config.message_queue_config());

        Self {
            inner: Arc::new(ServiceInner {
                scheduler,
                messages,
                clusters: ClusterCache::new(registry, config.cluster_refresh, Arc::clone(&clock)),
                blobs,
                requirements: RequirementsCache::new(config.requirements_ttl, Arc::clone(&clock)),
                clock,
                metrics: MetricsCollector::new(),
            }),
            sweep_interval: config.sweep_interval,
            shutdown_tx,
            sweep_handle: Mutex::new(None),
        }
    }

    /// Starts the scheduler and message loops and the periodic expiry sweep.
    pub async fn start(&self) -> Result<(), ComputeError> {
        let mut handle = self.sweep_handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }

        self.inner.scheduler.start().await?;
        self.inner.messages.start().await?;

        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.sweep_interval;
        *handle = Some(tokio::spawn(async move {
            inner.run_sweep_loop(interval, shutdown_rx).await;
        }));

        info!(sweep_interval_secs = interval.as_secs(), "Compute service started");
        Ok(())
    }

    /// Stops the sweep and the background loops.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            let _ = self.shutdown_tx.send(());
            if let Err(e) = handle.await {
                error!(error = %e, "Expiry sweep panicked");
            }
        }

        self.inner.scheduler.shutdown().await;
        self.inner.messages.shutdown().await;
        info!("Compute service stopped");
    }

    /// Returns the configuration of `cluster_id`.
    pub async fn get_cluster_info(&self, cluster_id: &str) -> Result<ClusterConfig, ComputeError> {
        self.inner
            .clusters
            .get(cluster_id)
            .await?
            .ok_or_else(|| ComputeError::ClusterNotFound(cluster_id.to_string()))
    }

    /// Queues one task per reference in `task_ref_ids`.
    ///
    /// The cluster id must be non-empty and the requirements hash a lowercase
    /// hex digest; otherwise nothing is queued. Every enqueue is attempted; a
    /// failure does not undo the others. The first failure is returned once
    /// all attempts have finished.
    pub async fn add_tasks(
        &self,
        cluster_id: &str,
        channel_id: &str,
        task_ref_ids: &[String],
        requirements_hash: &str,
    ) -> Result<(), ComputeError> {
        if cluster_id.is_empty() {
            return Err(ComputeError::InvalidRequest(
                "cluster id must not be empty".to_string(),
            ));
        }
        validate_hash(requirements_hash)
            .map_err(|e| ComputeError::InvalidRequest(e.to_string()))?;

        let key = QueueKey::new(cluster_id, requirements_hash);
        let enqueues = task_ref_ids.iter().map(|task_ref_id| {
            let task = ComputeTask {
                cluster_id: cluster_id.to_string(),
                task_ref_id: task_ref_id.clone(),
                channel_id: channel_id.to_string(),
            };
            let key = &key;
            async move { self.inner.scheduler.enqueue(key, &task, false).await }
        });

        let results = join_all(enqueues).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            queue = %key,
            channel = channel_id,
            added = results.len() - failed,
            failed = failed,
            "Added tasks"
        );

        match results.into_iter().find_map(Result::err) {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Waits for a task `agent` can run and returns a lease for it.
    ///
    /// Tasks whose cluster or requirements cannot be resolved are completed
    /// with a failure status and skipped. Returns `None` when `cancel` fires.
    pub async fn assign_lease(
        &self,
        agent: &Agent,
        cancel: &CancellationToken,
    ) -> Result<Option<Lease>, ComputeError> {
        let started = Instant::now();
        let agent = Arc::new(agent.clone());

        loop {
            let inner = Arc::clone(&self.inner);
            let predicate_agent = Arc::clone(&agent);
            let predicate = move |key: QueueKey| {
                let inner = Arc::clone(&inner);
                let agent = Arc::clone(&predicate_agent);
                async move { inner.agent_accepts(&agent, &key).await }.boxed()
            };

            let Some((key, task)) = self.inner.scheduler.dequeue_matching(predicate, cancel).await?
            else {
                return Ok(None);
            };

            let resolution = match self.inner.resolve(&key).await {
                Ok(resolution) => resolution,
                Err(e) => {
                    // Not the task's fault; let another agent try.
                    self.inner.scheduler.enqueue(&key, &task, true).await?;
                    return Err(e);
                }
            };

            match resolution {
                Resolution::MissingCluster => {
                    let status = TaskStatus::complete(
                        &task.task_ref_id,
                        self.inner.clock.now(),
                        TaskOutcome::Failed,
                    )
                    .with_detail(format!("Cluster '{}' not found", key.cluster_id));
                    self.inner.post_status(&task, status).await?;
                }
                Resolution::MissingRequirements { outcome, detail } => {
                    let status =
                        TaskStatus::complete(&task.task_ref_id, self.inner.clock.now(), outcome)
                            .with_detail(detail.clone());
                    self.inner.post_status(&task, status).await?;
                    self.inner.drain_queue(&key, outcome, &detail).await?;
                }
                Resolution::Ready {
                    cluster,
                    requirements,
                } => {
                    let lease = build_lease(&cluster, &key, &task, &requirements.requirements)?;
                    self.inner
                        .metrics
                        .record_lease_assigned(started.elapsed().as_secs_f64());
                    info!(
                        agent = %agent.id,
                        lease = %lease.id,
                        queue = %key,
                        task_ref_id = %task.task_ref_id,
                        "Assigned lease"
                    );
                    return Ok(Some(lease));
                }
            }
        }
    }

    /// Puts the task of a cancelled lease back at the front of its queue.
    pub async fn cancel_lease(
        &self,
        agent_id: &str,
        lease_id: Uuid,
        payload: &str,
    ) -> Result<(), ComputeError> {
        let message = decode_payload(payload)?;
        self.inner
            .scheduler
            .enqueue(&message.queue_key(), &message.task(), true)
            .await?;

        info!(
            agent = agent_id,
            lease = %lease_id,
            task_ref_id = %message.task_ref_id,
            "Requeued task of cancelled lease"
        );
        Ok(())
    }

    /// Takes the statuses currently queued for a channel.
    pub async fn get_task_updates(
        &self,
        cluster_id: &str,
        channel_id: &str,
    ) -> Result<Vec<TaskStatus>, ComputeError> {
        Ok(self
            .inner
            .messages
            .read_messages(&status_channel(cluster_id, channel_id))
            .await?)
    }

    /// Waits for statuses on a channel; empty when `cancel` fires first.
    pub async fn wait_for_task_updates(
        &self,
        cluster_id: &str,
        channel_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskStatus>, ComputeError> {
        Ok(self
            .inner
            .messages
            .wait_for_messages(&status_channel(cluster_id, channel_id), cancel)
            .await?)
    }

    /// Waits up to `wait` for statuses on a channel.
    pub async fn wait_for_task_updates_for(
        &self,
        cluster_id: &str,
        channel_id: &str,
        wait: Duration,
    ) -> Result<Vec<TaskStatus>, ComputeError> {
        Ok(self
            .inner
            .messages
            .wait_for_messages_for(&status_channel(cluster_id, channel_id), wait)
            .await?)
    }

    /// Records that an agent started executing a lease.
    pub async fn on_lease_started(
        &self,
        agent_id: &str,
        lease_id: Uuid,
        payload: &str,
    ) -> Result<(), ComputeError> {
        let message = decode_payload(payload)?;
        let status = TaskStatus::executing(
            &message.task_ref_id,
            self.inner.clock.now(),
            agent_id,
            lease_id,
        );
        self.inner.post_status(&message.task(), status).await
    }

    /// Records the end of a lease.
    ///
    /// The outcome is taken from the task's own result when it reported one,
    /// otherwise from how the lease ended.
    pub async fn on_lease_finished(
        &self,
        agent_id: &str,
        lease_id: Uuid,
        payload: &str,
        lease_outcome: LeaseOutcome,
        result: Option<&ComputeTaskResult>,
    ) -> Result<(), ComputeError> {
        let message = decode_payload(payload)?;
        let now = self.inner.clock.now();

        let status = match result {
            Some(ComputeTaskResult {
                result_ref_id: Some(result_ref_id),
                ..
            }) => TaskStatus::complete(&message.task_ref_id, now, TaskOutcome::Success)
                .with_result(result_ref_id),
            Some(ComputeTaskResult {
                outcome: Some(outcome),
                detail,
                ..
            }) if *outcome != TaskOutcome::Success => {
                let status = TaskStatus::complete(&message.task_ref_id, now, *outcome);
                match detail {
                    Some(detail) => status.with_detail(detail),
                    None => status,
                }
            }
            _ => {
                let outcome = match lease_outcome {
                    LeaseOutcome::Cancelled => TaskOutcome::Cancelled,
                    LeaseOutcome::Failed => TaskOutcome::Failed,
                    LeaseOutcome::Success => TaskOutcome::NoResult,
                };
                TaskStatus::complete(&message.task_ref_id, now, outcome)
            }
        };

        self.inner
            .post_status(&message.task(), status.with_lease(agent_id, lease_id))
            .await
    }

    /// Drains every inactive queue, completing its tasks as expired.
    ///
    /// Returns the number of tasks drained.
    pub async fn expire_inactive_queues(&self) -> Result<usize, ComputeError> {
        self.inner.expire_inactive_queues().await
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &TaskScheduler<QueueKey, ComputeTask> {
        &self.inner.scheduler
    }

    /// The status message queue.
    pub fn messages(&self) -> &MessageQueue<TaskStatus> {
        &self.inner.messages
    }

    pub fn requirements_cache_stats(&self) -> CacheStats {
        self.inner.requirements.stats()
    }
}

impl ServiceInner {
    /// Predicate used by predicate dequeues on behalf of `agent`.
    ///
    /// Queues of unknown clusters are accepted so that their tasks reach the
    /// failure path in `assign_lease`. Queues with unfetchable requirements
    /// are drained here and never accepted.
    async fn agent_accepts(&self, agent: &Agent, key: &QueueKey) -> bool {
        match self.resolve(key).await {
            Ok(Resolution::MissingCluster) => true,
            Ok(Resolution::MissingRequirements { outcome, detail }) => {
                if let Err(e) = self.drain_queue(key, outcome, &detail).await {
                    error!(queue = %key, error = %e, "Failed to drain queue with missing requirements");
                }
                false
            }
            Ok(Resolution::Ready { requirements, .. }) => requirements.is_met_by(agent),
            Err(e) => {
                warn!(queue = %key, error = %e, "Failed to resolve queue requirements");
                false
            }
        }
    }

    async fn resolve(&self, key: &QueueKey) -> Result<Resolution, ComputeError> {
        let Some(cluster) = self.clusters.get(&key.cluster_id).await? else {
            return Ok(Resolution::MissingCluster);
        };

        if let Some(requirements) = self.requirements.get(&key.requirements_hash) {
            self.metrics.record_cache_lookup(true);
            return Ok(Resolution::Ready {
                cluster,
                requirements,
            });
        }
        self.metrics.record_cache_lookup(false);

        let fetched = match self
            .blobs
            .get(&cluster.namespace_id, &key.requirements_hash)
            .await
        {
            Ok(fetched) => fetched,
            Err(BlobError::InvalidHash(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let Some(bytes) = fetched else {
            return Ok(Resolution::MissingRequirements {
                outcome: TaskOutcome::BlobNotFound,
                detail: format!(
                    "Requirements {} not found in namespace {}",
                    key.requirements_hash, cluster.namespace_id
                ),
            });
        };

        match serde_json::from_slice::<Requirements>(&bytes) {
            Ok(requirements) => {
                let requirements = self.requirements.insert(&key.requirements_hash, requirements);
                Ok(Resolution::Ready {
                    cluster,
                    requirements,
                })
            }
            Err(e) => Ok(Resolution::MissingRequirements {
                outcome: TaskOutcome::Failed,
                detail: format!("Requirements {} are invalid: {}", key.requirements_hash, e),
            }),
        }
    }

    /// Completes every task left in `key` with `outcome`.
    async fn drain_queue(
        &self,
        key: &QueueKey,
        outcome: TaskOutcome,
        detail: &str,
    ) -> Result<usize, ComputeError> {
        let mut drained = 0;
        while let Some(task) = self.scheduler.dequeue(key).await? {
            let mut status = TaskStatus::complete(&task.task_ref_id, self.clock.now(), outcome);
            if !detail.is_empty() {
                status = status.with_detail(detail);
            }
            self.post_status(&task, status).await?;
            drained += 1;
        }

        if drained > 0 {
            warn!(queue = %key, outcome = %outcome, drained = drained, "Drained queue");
        }
        Ok(drained)
    }

    async fn expire_inactive_queues(&self) -> Result<usize, ComputeError> {
        let mut expired = 0;

        for key in self.scheduler.inactive_queues().await? {
            let (outcome, detail) = match self.resolve(&key).await {
                Ok(Resolution::MissingRequirements { detail, .. }) => {
                    (TaskOutcome::BlobNotFound, detail)
                }
                Ok(_) => (TaskOutcome::Expired, String::new()),
                Err(e) => {
                    warn!(queue = %key, error = %e, "Failed to resolve inactive queue");
                    (TaskOutcome::Expired, String::new())
                }
            };

            // One bad queue must not stop the sweep.
            match self.drain_queue(&key, outcome, &detail).await {
                Ok(count) => {
                    self.metrics.record_expired(count);
                    expired += count;
                }
                Err(e) => error!(queue = %key, error = %e, "Failed to drain inactive queue"),
            }
        }

        Ok(expired)
    }

    async fn run_sweep_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }

            match self.expire_inactive_queues().await {
                Ok(0) => debug!("Expiry sweep found no inactive queues"),
                Ok(count) => info!(expired = count, "Expiry sweep drained inactive queues"),
                Err(e) => error!(error = %e, "Expiry sweep failed"),
            }
        }
    }

    async fn post_status(&self, task: &ComputeTask, status: TaskStatus) -> Result<(), ComputeError> {
        let outcome = status.outcome.map_or("none", |o| o.as_str());
        self.metrics.record_status(status.state.as_str(), outcome);

        match status.outcome {
            Some(TaskOutcome::Success) | None => debug!(
                task_ref_id = %task.task_ref_id,
                state = %status.state,
                outcome = outcome,
                "Posting task status"
            ),
            Some(_) => warn!(
                task_ref_id = %task.task_ref_id,
                outcome = outcome,
                detail = status.detail.as_deref().unwrap_or_default(),
                "Task did not succeed"
            ),
        }

        self.messages
            .post(&status_channel(&task.cluster_id, &task.channel_id), &status)
            .await?;
        Ok(())
    }
}

/// Message queue channel carrying the statuses of one client channel.
fn status_channel(cluster_id: &str, channel_id: &str) -> String {
    format!("{}/{}", cluster_id, channel_id)
}

fn decode_payload(payload: &str) -> Result<ComputeTaskMessage, ComputeError> {
    serde_json::from_str(payload).map_err(|e| ComputeError::InvalidPayload(e.to_string()))
}

fn build_lease(
    cluster: &ClusterConfig,
    key: &QueueKey,
    task: &ComputeTask,
    requirements: &Requirements,
) -> Result<Lease, ComputeError> {
    let message = ComputeTaskMessage {
        cluster_id: cluster.id.clone(),
        channel_id: task.channel_id.clone(),
        namespace_id: cluster.namespace_id.clone(),
        input_bucket_id: cluster.request_bucket_id.clone(),
        output_bucket_id: cluster.response_bucket_id.clone(),
        requirements_hash: key.requirements_hash.clone(),
        task_ref_id: task.task_ref_id.clone(),
    };

    Ok(Lease {
        id: Uuid::new_v4(),
        name: format!("Compute task {}", task.task_ref_id),
        payload: serde_json::to_string(&message)?,
        resources: requirements.resources.clone(),
        exclusive: requirements.exclusive,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_channel_key() {
        assert_eq!(status_channel("default", "chan-1"), "default/chan-1");
    }

    #[test]
    fn test_build_lease_embeds_cluster_locations() {
        let cluster = ClusterConfig::default_cluster();
        let key = QueueKey::new("default", "abc");
        let task = ComputeTask {
            cluster_id: "default".to_string(),
            task_ref_id: "task-1".to_string(),
            channel_id: "chan".to_string(),
        };
        let requirements = Requirements::default()
            .with_resource("cpu", 2)
            .exclusive(true);

        let lease = build_lease(&cluster, &key, &task, &requirements).unwrap();
        let message = lease.message().unwrap();

        assert_eq!(message.namespace_id, cluster.namespace_id);
        assert_eq!(message.input_bucket_id, "requests");
        assert_eq!(message.output_bucket_id, "responses");
        assert_eq!(message.requirements_hash, "abc");
        assert_eq!(lease.resources.get("cpu"), Some(&2));
        assert!(lease.exclusive);
    }

    #[test]
    fn test_decode_payload_rejects_garbage() {
        assert!(matches!(
            decode_payload("not json"),
            Err(ComputeError::InvalidPayload(_))
        ));
    }
}
