//! Cluster definitions and their cached lookup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{ComputeError, ConfigError};

/// Storage locations used by the tasks of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub id: String,
    /// Blob namespace holding requirements, task descriptions and results.
    pub namespace_id: String,
    pub request_bucket_id: String,
    pub response_bucket_id: String,
}

impl ClusterConfig {
    /// The cluster used when no definitions are configured.
    pub fn default_cluster() -> Self {
        Self {
            id: "default".to_string(),
            namespace_id: "horde.compute".to_string(),
            request_bucket_id: "requests".to_string(),
            response_bucket_id: "responses".to_string(),
        }
    }
}

/// Source of cluster definitions.
#[async_trait]
pub trait ClusterRegistry: Send + Sync + 'static {
    async fn list_clusters(&self) -> Result<Vec<ClusterConfig>, ComputeError>;
}

#[derive(Debug, Deserialize)]
struct ClustersFile {
    clusters: Vec<ClusterConfig>,
}

/// Registry over a fixed list of clusters.
#[derive(Debug, Clone)]
pub struct StaticClusterRegistry {
    clusters: Vec<ClusterConfig>,
}

impl Default for StaticClusterRegistry {
    fn default() -> Self {
        Self::new(vec![ClusterConfig::default_cluster()])
    }
}

impl StaticClusterRegistry {
    pub fn new(clusters: Vec<ClusterConfig>) -> Self {
        Self { clusters }
    }

    /// Parses a document of the form:
    ///
    /// ```yaml
    /// clusters:
    ///   - id: default
    ///     namespace_id: horde.compute
    ///     request_bucket_id: requests
    ///     response_bucket_id: responses
    /// ```
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: ClustersFile = serde_yaml::from_str(yaml)?;

        let mut seen = std::collections::HashSet::new();
        for cluster in &file.clusters {
            if !seen.insert(cluster.id.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "duplicate cluster id '{}'",
                    cluster.id
                )));
            }
        }

        Ok(Self::new(file.clusters))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }
}

#[async_trait]
impl ClusterRegistry for StaticClusterRegistry {
    async fn list_clusters(&self) -> Result<Vec<ClusterConfig>, ComputeError> {
        Ok(self.clusters.clone())
    }
}

struct CachedClusters {
    fetched_at: DateTime<Utc>,
    clusters: Arc<HashMap<String, ClusterConfig>>,
}

/// Cluster lookup that refetches the registry at most once per refresh
/// interval.
pub struct ClusterCache {
    registry: Arc<dyn ClusterRegistry>,
    refresh: Duration,
    clock: Arc<dyn Clock>,
    cached: Mutex<Option<CachedClusters>>,
}

impl ClusterCache {
    pub fn new(registry: Arc<dyn ClusterRegistry>, refresh: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            refresh,
            clock,
            cached: Mutex::new(None),
        }
    }

    /// Returns the cluster `cluster_id`, or `None` if the registry does not
    /// define it.
    pub async fn get(&self, cluster_id: &str) -> Result<Option<ClusterConfig>, ComputeError> {
        let clusters = self.clusters().await?;
        Ok(clusters.get(cluster_id).cloned())
    }

    async fn clusters(&self) -> Result<Arc<HashMap<String, ClusterConfig>>, ComputeError> {
        let now = self.clock.now();
        if let Some(fresh) = self.fresh_snapshot(now) {
            return Ok(fresh);
        }

        // Concurrent misses may both fetch; the later result wins.
        let fetched: HashMap<String, ClusterConfig> = self
            .registry
            .list_clusters()
            .await?
            .into_iter()
            .map(|cluster| (cluster.id.clone(), cluster))
            .collect();
        let fetched = Arc::new(fetched);

        tracing::debug!(count = fetched.len(), "Refreshed cluster list");
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(CachedClusters {
            fetched_at: now,
            clusters: Arc::clone(&fetched),
        });
        Ok(fetched)
    }

    fn fresh_snapshot(&self, now: DateTime<Utc>) -> Option<Arc<HashMap<String, ClusterConfig>>> {
        let cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let cached = cached.as_ref()?;

        let age = (now - cached.fetched_at).to_std().unwrap_or(Duration::ZERO);
        (age < self.refresh).then(|| Arc::clone(&cached.clusters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRegistry {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClusterRegistry for CountingRegistry {
        async fn list_clusters(&self) -> Result<Vec<ClusterConfig>, ComputeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ClusterConfig::default_cluster()])
        }
    }

    #[test]
    fn test_from_yaml_str() {
        let yaml = r#"
clusters:
  - id: default
    namespace_id: horde.compute
    request_bucket_id: requests
    response_bucket_id: responses
  - id: gpu
    namespace_id: gpu.compute
    request_bucket_id: gpu-requests
    response_bucket_id: gpu-responses
"#;
        let registry = StaticClusterRegistry::from_yaml_str(yaml).unwrap();
        assert_eq!(registry.clusters.len(), 2);
        assert_eq!(registry.clusters[1].namespace_id, "gpu.compute");
    }

    #[test]
    fn test_from_yaml_rejects_duplicates() {
        let yaml = r#"
clusters:
  - { id: a, namespace_id: n, request_bucket_id: r, response_bucket_id: s }
  - { id: a, namespace_id: n, request_bucket_id: r, response_bucket_id: s }
"#;
        let err = StaticClusterRegistry::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate cluster id 'a'"));
    }

    #[tokio::test]
    async fn test_cache_refreshes_after_interval() {
        let registry = Arc::new(CountingRegistry {
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(ManualClock::new());
        let cache = ClusterCache::new(registry.clone(), Duration::from_secs(120), clock.clone());

        assert!(cache.get("default").await.unwrap().is_some());
        assert!(cache.get("missing").await.unwrap().is_none());
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(120));
        cache.get("default").await.unwrap();
        assert_eq!(registry.calls.load(Ordering::SeqCst), 2);
    }
}
