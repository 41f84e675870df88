//! Integration tests for lease assignment and task status reporting.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use farm_scheduler::blob::{BlobStore, MemoryBlobStore};
use farm_scheduler::clock::ManualClock;
use farm_scheduler::compute::{
    Agent, ComputeService, ComputeTaskResult, LeaseOutcome, QueueKey, Requirements,
    StaticClusterRegistry, TaskOutcome, TaskState,
};
use farm_scheduler::config::ServiceConfig;
use farm_scheduler::store::MemoryQueueStore;
use farm_scheduler::ComputeError;

const NAMESPACE: &str = "horde.compute";
const CLUSTER: &str = "default";

struct Harness {
    service: Arc<ComputeService>,
    blobs: Arc<MemoryBlobStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryQueueStore::with_clock(clock.clone()));
        let blobs = Arc::new(MemoryBlobStore::new());
        let service = ComputeService::new(
            store,
            blobs.clone(),
            Arc::new(StaticClusterRegistry::default()),
            &ServiceConfig::default(),
            clock.clone(),
        );

        Self {
            service: Arc::new(service),
            blobs,
            clock,
        }
    }

    async fn put_requirements(&self, requirements: &Requirements) -> String {
        let json = serde_json::to_vec(requirements).unwrap();
        self.blobs.put(NAMESPACE, &json).await.unwrap()
    }

    async fn add(&self, channel: &str, refs: &[&str], hash: &str) {
        let refs: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
        self.service
            .add_tasks(CLUSTER, channel, &refs, hash)
            .await
            .unwrap();
    }
}

fn linux_agent() -> Agent {
    Agent::new("agent-1")
        .with_property("os=linux")
        .with_resource("cpu", 8)
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
    cancel
}

#[tokio::test]
async fn test_get_cluster_info() {
    let harness = Harness::new();

    let cluster = harness.service.get_cluster_info(CLUSTER).await.unwrap();
    assert_eq!(cluster.namespace_id, NAMESPACE);

    let err = harness.service.get_cluster_info("missing").await.unwrap_err();
    assert!(matches!(err, ComputeError::ClusterNotFound(id) if id == "missing"));
}

#[tokio::test]
async fn test_add_tasks_queues_under_requirements_hash() {
    let harness = Harness::new();
    let hash = harness.put_requirements(&Requirements::default()).await;

    harness.add("chan", &["t1", "t2", "t3"], &hash).await;

    let key = QueueKey::new(CLUSTER, hash);
    assert_eq!(harness.service.scheduler().queue_length(&key).await.unwrap(), 3);
}

#[tokio::test]
async fn test_add_tasks_rejects_keys_that_cannot_be_scheduled() {
    let harness = Harness::new();
    let refs = vec!["t1".to_string()];

    for (cluster, hash) in [(CLUSTER, ""), (CLUSTER, "sha:abc"), (CLUSTER, "ABC"), ("", "abc")] {
        let err = harness
            .service
            .add_tasks(cluster, "chan", &refs, hash)
            .await
            .unwrap_err();
        assert!(
            matches!(err, ComputeError::InvalidRequest(_)),
            "cluster '{cluster}', hash '{hash}': {err}"
        );
    }

    assert!(harness.service.scheduler().queues().await.unwrap().is_empty());
    harness.clock.advance(Duration::from_secs(601));
    assert!(harness
        .service
        .scheduler()
        .inactive_queues()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_lease_lifecycle_reports_statuses() {
    let harness = Harness::new();
    let requirements = Requirements::default()
        .with_condition("os == linux")
        .with_resource("cpu", 4)
        .exclusive(true);
    let hash = harness.put_requirements(&requirements).await;
    harness.add("chan", &["task-1"], &hash).await;

    let agent = linux_agent();
    let lease = harness
        .service
        .assign_lease(&agent, &CancellationToken::new())
        .await
        .unwrap()
        .expect("lease for matching agent");

    assert_eq!(lease.resources.get("cpu"), Some(&4));
    assert!(lease.exclusive);
    let message = lease.message().unwrap();
    assert_eq!(message.task_ref_id, "task-1");
    assert_eq!(message.namespace_id, NAMESPACE);
    assert_eq!(message.channel_id, "chan");

    harness
        .service
        .on_lease_started(&agent.id, lease.id, &lease.payload)
        .await
        .unwrap();
    harness
        .service
        .on_lease_finished(
            &agent.id,
            lease.id,
            &lease.payload,
            LeaseOutcome::Success,
            Some(&ComputeTaskResult::success("result-1")),
        )
        .await
        .unwrap();

    let updates = harness.service.get_task_updates(CLUSTER, "chan").await.unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].state, TaskState::Executing);
    assert_eq!(updates[0].agent_id.as_deref(), Some("agent-1"));
    assert_eq!(updates[0].lease_id, Some(lease.id));
    assert_eq!(updates[1].state, TaskState::Complete);
    assert_eq!(updates[1].outcome, Some(TaskOutcome::Success));
    assert_eq!(updates[1].result_ref_id.as_deref(), Some("result-1"));
}

#[tokio::test]
async fn test_lease_finish_outcome_mapping() {
    let harness = Harness::new();
    let hash = harness.put_requirements(&Requirements::default()).await;
    let cases = [
        (
            LeaseOutcome::Success,
            Some(ComputeTaskResult::failure(TaskOutcome::Failed, "exit code 3")),
            TaskOutcome::Failed,
        ),
        (LeaseOutcome::Success, None, TaskOutcome::NoResult),
        (LeaseOutcome::Failed, None, TaskOutcome::Failed),
        (LeaseOutcome::Cancelled, None, TaskOutcome::Cancelled),
        (
            LeaseOutcome::Failed,
            Some(ComputeTaskResult::success("partial")),
            TaskOutcome::Success,
        ),
    ];

    for (i, (lease_outcome, result, expected)) in cases.into_iter().enumerate() {
        let channel = format!("chan-{}", i);
        harness.add(&channel, &["task"], &hash).await;
        let lease = harness
            .service
            .assign_lease(&linux_agent(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        harness
            .service
            .on_lease_finished("agent-1", lease.id, &lease.payload, lease_outcome, result.as_ref())
            .await
            .unwrap();

        let updates = harness.service.get_task_updates(CLUSTER, &channel).await.unwrap();
        assert_eq!(updates.len(), 1, "case {}", i);
        assert_eq!(updates[0].outcome, Some(expected), "case {}", i);
    }
}

#[tokio::test]
async fn test_unmatched_agent_leaves_task_queued() {
    let harness = Harness::new();
    harness.service.start().await.unwrap();
    let hash = harness
        .put_requirements(&Requirements::default().with_condition("os == windows"))
        .await;
    harness.add("chan", &["task-1"], &hash).await;

    let lease = harness
        .service
        .assign_lease(&linux_agent(), &cancel_after(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(lease.is_none());

    let key = QueueKey::new(CLUSTER, hash);
    assert_eq!(harness.service.scheduler().queue_length(&key).await.unwrap(), 1);

    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_waiting_agent_receives_new_task() {
    let harness = Harness::new();
    harness.service.start().await.unwrap();
    let hash = harness.put_requirements(&Requirements::default()).await;

    let service = Arc::clone(&harness.service);
    let waiting = tokio::spawn(async move {
        service
            .assign_lease(&linux_agent(), &CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    harness.add("chan", &["late-task"], &hash).await;

    let lease = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("agent was not woken")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(lease.message().unwrap().task_ref_id, "late-task");

    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_missing_requirements_complete_as_blob_not_found() {
    let harness = Harness::new();
    harness.service.start().await.unwrap();

    // An agent is polling; nobody dequeues the task explicitly.
    let service = Arc::clone(&harness.service);
    let cancel = CancellationToken::new();
    let polling = {
        let cancel = cancel.clone();
        tokio::spawn(async move { service.assign_lease(&linux_agent(), &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    harness.add("chan", &["doomed"], "deadbeef").await;

    let updates = harness
        .service
        .wait_for_task_updates_for(CLUSTER, "chan", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].task_ref_id, "doomed");
    assert_eq!(updates[0].outcome, Some(TaskOutcome::BlobNotFound));

    cancel.cancel();
    assert!(polling.await.unwrap().unwrap().is_none());
    let key = QueueKey::new(CLUSTER, "deadbeef");
    assert_eq!(harness.service.scheduler().queue_length(&key).await.unwrap(), 0);

    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_unknown_cluster_fails_task() {
    let harness = Harness::new();
    let refs = vec!["orphan".to_string()];
    harness
        .service
        .add_tasks("ghost", "chan", &refs, "abc")
        .await
        .unwrap();

    let lease = harness
        .service
        .assign_lease(&linux_agent(), &cancel_after(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(lease.is_none());

    let updates = harness.service.get_task_updates("ghost", "chan").await.unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].outcome, Some(TaskOutcome::Failed));
    assert!(updates[0].detail.as_deref().unwrap().contains("ghost"));
}

#[tokio::test]
async fn test_sweep_expires_idle_queue() {
    let harness = Harness::new();
    let hash = harness.put_requirements(&Requirements::default()).await;
    harness.add("chan", &["t1", "t2"], &hash).await;

    assert_eq!(harness.service.expire_inactive_queues().await.unwrap(), 0);

    harness.clock.advance(Duration::from_secs(601));
    assert_eq!(harness.service.expire_inactive_queues().await.unwrap(), 2);

    let updates = harness.service.get_task_updates(CLUSTER, "chan").await.unwrap();
    assert_eq!(updates.len(), 2);
    assert!(updates
        .iter()
        .all(|u| u.outcome == Some(TaskOutcome::Expired)));

    let key = QueueKey::new(CLUSTER, hash);
    assert_eq!(harness.service.scheduler().queue_length(&key).await.unwrap(), 0);
}

#[tokio::test]
async fn test_sweep_reports_missing_requirements() {
    let harness = Harness::new();
    harness.add("chan", &["t1"], "deadbeef").await;

    harness.clock.advance(Duration::from_secs(601));
    assert_eq!(harness.service.expire_inactive_queues().await.unwrap(), 1);

    let updates = harness.service.get_task_updates(CLUSTER, "chan").await.unwrap();
    assert_eq!(updates[0].outcome, Some(TaskOutcome::BlobNotFound));
}

#[tokio::test]
async fn test_cancelled_lease_goes_to_front() {
    let harness = Harness::new();
    let hash = harness.put_requirements(&Requirements::default()).await;
    harness.add("chan", &["first"], &hash).await;

    let lease = harness
        .service
        .assign_lease(&linux_agent(), &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.message().unwrap().task_ref_id, "first");

    harness.add("chan", &["second"], &hash).await;
    harness
        .service
        .cancel_lease("agent-1", lease.id, &lease.payload)
        .await
        .unwrap();

    let key = QueueKey::new(CLUSTER, hash);
    let scheduler = harness.service.scheduler();
    assert_eq!(
        scheduler.dequeue(&key).await.unwrap().unwrap().task_ref_id,
        "first"
    );
    assert_eq!(
        scheduler.dequeue(&key).await.unwrap().unwrap().task_ref_id,
        "second"
    );
}

#[tokio::test]
async fn test_invalid_payload_is_rejected() {
    let harness = Harness::new();

    let err = harness
        .service
        .cancel_lease("agent-1", uuid::Uuid::new_v4(), "{}")
        .await
        .unwrap_err();
    assert!(matches!(err, ComputeError::InvalidPayload(_)));
}

#[tokio::test]
async fn test_requirements_are_cached() {
    let harness = Harness::new();
    let hash = harness.put_requirements(&Requirements::default()).await;
    harness.add("chan", &["a", "b"], &hash).await;

    for _ in 0..2 {
        harness
            .service
            .assign_lease(&linux_agent(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
    }

    let stats = harness.service.requirements_cache_stats();
    assert_eq!(stats.entries_added, 1);
    assert!(stats.hits >= 1);
}
