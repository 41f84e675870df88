//! Core data types for compute task scheduling.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::scheduler::{decode_json, encode_json, StoreCodec};

/// Identifies the cohort of tasks in one cluster sharing a requirements hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub cluster_id: String,
    pub requirements_hash: String,
}

impl QueueKey {
    pub fn new(cluster_id: impl Into<String>, requirements_hash: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            requirements_hash: requirements_hash.into(),
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cluster_id, self.requirements_hash)
    }
}

impl StoreCodec for QueueKey {
    fn encode(&self) -> Result<String, StoreError> {
        if self.cluster_id.is_empty()
            || self.requirements_hash.is_empty()
            || self.requirements_hash.contains(':')
        {
            return Err(StoreError::Encode(format!(
                "queue key '{}' would not decode back to itself",
                self
            )));
        }
        Ok(self.to_string())
    }

    fn decode(raw: &str) -> Result<Self, StoreError> {
        // Hashes never contain ':', cluster ids may.
        match raw.rsplit_once(':') {
            Some((cluster_id, hash)) if !cluster_id.is_empty() && !hash.is_empty() => {
                Ok(Self::new(cluster_id, hash))
            }
            _ => Err(StoreError::Decode {
                value: raw.to_string(),
                reason: "expected '<cluster>:<requirements hash>'".to_string(),
            }),
        }
    }
}

/// A queued reference to a task description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeTask {
    pub cluster_id: String,
    pub task_ref_id: String,
    pub channel_id: String,
}

impl StoreCodec for ComputeTask {
    fn encode(&self) -> Result<String, StoreError> {
        encode_json(self)
    }

    fn decode(raw: &str) -> Result<Self, StoreError> {
        decode_json(raw)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Executing,
    Complete,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Executing => "executing",
            TaskState::Complete => "complete",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failed,
    Cancelled,
    Expired,
    NoResult,
    BlobNotFound,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Success => "success",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Cancelled => "cancelled",
            TaskOutcome::Expired => "expired",
            TaskOutcome::NoResult => "no_result",
            TaskOutcome::BlobNotFound => "blob_not_found",
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event of a task, delivered on its status channel.
///
/// Statuses are never edited; a later state is a new record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_ref_id: String,
    pub time: DateTime<Utc>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TaskStatus {
    /// A task picked up by an agent.
    pub fn executing(
        task_ref_id: impl Into<String>,
        time: DateTime<Utc>,
        agent_id: impl Into<String>,
        lease_id: Uuid,
    ) -> Self {
        Self {
            task_ref_id: task_ref_id.into(),
            time,
            state: TaskState::Executing,
            outcome: None,
            agent_id: Some(agent_id.into()),
            lease_id: Some(lease_id),
            result_ref_id: None,
            detail: None,
        }
    }

    /// A task that reached a terminal outcome.
    pub fn complete(
        task_ref_id: impl Into<String>,
        time: DateTime<Utc>,
        outcome: TaskOutcome,
    ) -> Self {
        Self {
            task_ref_id: task_ref_id.into(),
            time,
            state: TaskState::Complete,
            outcome: Some(outcome),
            agent_id: None,
            lease_id: None,
            result_ref_id: None,
            detail: None,
        }
    }

    pub fn with_lease(mut self, agent_id: impl Into<String>, lease_id: Uuid) -> Self {
        self.agent_id = Some(agent_id.into());
        self.lease_id = Some(lease_id);
        self
    }

    pub fn with_result(mut self, result_ref_id: impl Into<String>) -> Self {
        self.result_ref_id = Some(result_ref_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl StoreCodec for TaskStatus {
    fn encode(&self) -> Result<String, StoreError> {
        encode_json(self)
    }

    fn decode(raw: &str) -> Result<Self, StoreError> {
        decode_json(raw)
    }
}

/// Payload carried by a lease; everything an agent needs to run the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeTaskMessage {
    pub cluster_id: String,
    pub channel_id: String,
    pub namespace_id: String,
    pub input_bucket_id: String,
    pub output_bucket_id: String,
    pub requirements_hash: String,
    pub task_ref_id: String,
}

impl ComputeTaskMessage {
    /// The queue this task was taken from.
    pub fn queue_key(&self) -> QueueKey {
        QueueKey::new(&self.cluster_id, &self.requirements_hash)
    }

    /// The queued form of this task.
    pub fn task(&self) -> ComputeTask {
        ComputeTask {
            cluster_id: self.cluster_id.clone(),
            task_ref_id: self.task_ref_id.clone(),
            channel_id: self.channel_id.clone(),
        }
    }
}

/// Work assignment handed to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: Uuid,
    pub name: String,
    /// JSON-encoded [`ComputeTaskMessage`].
    pub payload: String,
    /// Resources reserved on the agent for the duration of the lease.
    pub resources: BTreeMap<String, u32>,
    pub exclusive: bool,
}

impl Lease {
    pub fn message(&self) -> Result<ComputeTaskMessage, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// How the lease ended at the process level, as reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOutcome {
    Success,
    Failed,
    Cancelled,
}

/// Result reported by the task itself, if it produced one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeTaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComputeTaskResult {
    /// A successful result pointing at `result_ref_id`.
    pub fn success(result_ref_id: impl Into<String>) -> Self {
        Self {
            result_ref_id: Some(result_ref_id.into()),
            ..Default::default()
        }
    }

    /// A reported failure with an explicit outcome.
    pub fn failure(outcome: TaskOutcome, detail: impl Into<String>) -> Self {
        Self {
            result_ref_id: None,
            outcome: Some(outcome),
            detail: Some(detail.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key_encoding() {
        let key = QueueKey::new("eu:west", "abc123");
        let encoded = key.encode().unwrap();

        assert_eq!(encoded, "eu:west:abc123");
        assert_eq!(QueueKey::decode(&encoded).unwrap(), key);
        assert!(QueueKey::decode("nocolon").is_err());
        assert!(QueueKey::decode("cluster:").is_err());
    }

    #[test]
    fn test_queue_key_refuses_ambiguous_encoding() {
        assert!(QueueKey::new("default", "").encode().is_err());
        assert!(QueueKey::new("", "abc").encode().is_err());
        assert!(QueueKey::new("default", "sha:abc").encode().is_err());
    }

    #[test]
    fn test_task_status_omits_empty_fields() {
        let time = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let status = TaskStatus::complete("ref", time, TaskOutcome::BlobNotFound)
            .with_detail("missing requirements");
        let json = status.encode().unwrap();

        assert!(json.contains(r#""outcome":"blob_not_found""#));
        assert!(!json.contains("agent_id"));
        assert_eq!(TaskStatus::decode(&json).unwrap(), status);
    }

    #[test]
    fn test_task_message_round_trips_to_queue() {
        let message = ComputeTaskMessage {
            cluster_id: "default".to_string(),
            channel_id: "chan".to_string(),
            namespace_id: "ns".to_string(),
            input_bucket_id: "in".to_string(),
            output_bucket_id: "out".to_string(),
            requirements_hash: "h".to_string(),
            task_ref_id: "t".to_string(),
        };

        assert_eq!(message.queue_key(), QueueKey::new("default", "h"));
        assert_eq!(message.task().channel_id, "chan");
    }
}
