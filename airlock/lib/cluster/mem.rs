//! An in-memory cluster for tests, benches, and single-process runs.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    cluster::{
        ClusterClient, ClusterError, ConfigMap, NetworkPolicy, Pod, PodPhase, PodStatus,
    },
    AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`ClusterClient`] backed by process memory.
///
/// Implements the same compare-and-swap and not-found semantics as the real API, so claim races
/// and idempotent teardown behave identically. By default created pods immediately report
/// `Running` with IP `127.0.0.1`; use [`MemCluster::with_manual_scheduling`] to control pod
/// readiness from a test instead.
#[derive(Debug)]
pub struct MemCluster {
    /// All stored objects, keyed by `namespace/name`.
    state: Mutex<MemState>,

    /// Monotonic source of resource versions.
    version: AtomicU64,

    /// Total API calls served. Lets tests assert that validation short-circuits.
    ops: AtomicU64,

    /// Whether created pods immediately report `Running` with an IP.
    auto_run_pods: bool,
}

#[derive(Debug, Default)]
struct MemState {
    pods: HashMap<String, Pod>,
    config_maps: HashMap<String, ConfigMap>,
    network_policies: HashMap<String, NetworkPolicy>,
    fail_next_create: Option<String>,
    fail_deletes: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemCluster {
    /// Creates a cluster where pods report `Running` as soon as they are created.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            version: AtomicU64::new(0),
            ops: AtomicU64::new(0),
            auto_run_pods: true,
        }
    }

    /// Creates a cluster where pods stay `Pending` until [`MemCluster::mark_pod_running`].
    pub fn with_manual_scheduling() -> Self {
        Self {
            auto_run_pods: false,
            ..Self::new()
        }
    }

    /// Returns the total number of API calls served so far.
    pub fn op_count(&self) -> u64 {
        self.ops.load(Ordering::SeqCst)
    }

    /// Makes the next create of the given kind (`Pod`, `ConfigMap`, `NetworkPolicy`) fail.
    pub async fn fail_next_create(&self, kind: &str) {
        self.state.lock().await.fail_next_create = Some(kind.to_string());
    }

    /// While set, all deletes fail with a server error.
    pub async fn set_fail_deletes(&self, fail: bool) {
        self.state.lock().await.fail_deletes = fail;
    }

    /// Marks a pod as `Running` with the given IP. Only useful with manual scheduling.
    pub async fn mark_pod_running(&self, namespace: &str, name: &str, ip: &str) -> AirlockResult<()> {
        let mut state = self.state.lock().await;
        let pod = state
            .pods
            .get_mut(&object_key(namespace, name))
            .ok_or_else(|| ClusterError::NotFound {
                kind: "Pod".to_string(),
                name: name.to_string(),
            })?;

        pod.status = Some(PodStatus {
            phase: Some(PodPhase::Running),
            pod_ip: Some(ip.to_string()),
        });

        Ok(())
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn record_op(&self) {
        self.ops.fetch_add(1, Ordering::SeqCst);
    }

    fn check_create(state: &mut MemState, kind: &str) -> Result<(), ClusterError> {
        if state.fail_next_create.as_deref() == Some(kind) {
            state.fail_next_create = None;
            return Err(ClusterError::Api {
                status: 500,
                message: format!("injected {} create failure", kind),
            });
        }
        Ok(())
    }

    fn check_delete(state: &MemState, kind: &str, name: &str) -> Result<(), ClusterError> {
        if state.fail_deletes {
            return Err(ClusterError::Api {
                status: 500,
                message: format!("injected delete failure for {} '{}'", kind, name),
            });
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn matches_selector(labels: &HashMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|pair| !pair.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((key, value)) => labels.get(key).map(|have| have == value).unwrap_or(false),
            None => false,
        })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for MemCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for MemCluster {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> AirlockResult<Pod> {
        self.record_op();
        let mut state = self.state.lock().await;
        Self::check_create(&mut state, "Pod")?;

        let name = pod.metadata.name.clone();
        if name.is_empty() {
            return Err(ClusterError::Api {
                status: 422,
                message: "pod name is required".to_string(),
            }
            .into());
        }

        let key = object_key(namespace, &name);
        if state.pods.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: "Pod".to_string(),
                name,
            }
            .into());
        }

        let mut stored = pod.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(self.next_version());
        stored.metadata.creation_timestamp = Some(Utc::now());
        stored.status = Some(if self.auto_run_pods {
            PodStatus {
                phase: Some(PodPhase::Running),
                pod_ip: Some("127.0.0.1".to_string()),
            }
        } else {
            PodStatus {
                phase: Some(PodPhase::Pending),
                pod_ip: None,
            }
        });

        state.pods.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> AirlockResult<Pod> {
        self.record_op();
        let state = self.state.lock().await;
        state
            .pods
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| {
                ClusterError::NotFound {
                    kind: "Pod".to_string(),
                    name: name.to_string(),
                }
                .into()
            })
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> AirlockResult<Vec<Pod>> {
        self.record_op();
        let state = self.state.lock().await;
        let prefix = format!("{}/", namespace);

        let mut pods: Vec<Pod> = state
            .pods
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter(|(_, pod)| matches_selector(&pod.metadata.labels, label_selector))
            .map(|(_, pod)| pod.clone())
            .collect();

        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(pods)
    }

    async fn update_pod(&self, namespace: &str, pod: &Pod) -> AirlockResult<Pod> {
        self.record_op();
        let mut state = self.state.lock().await;
        let key = object_key(namespace, &pod.metadata.name);

        let stored = state.pods.get(&key).ok_or_else(|| ClusterError::NotFound {
            kind: "Pod".to_string(),
            name: pod.metadata.name.clone(),
        })?;

        if stored.metadata.resource_version != pod.metadata.resource_version {
            return Err(ClusterError::Conflict {
                kind: "Pod".to_string(),
                name: pod.metadata.name.clone(),
            }
            .into());
        }

        let mut updated = pod.clone();
        // Status is cluster-owned; a replace never changes it.
        updated.status = stored.status.clone();
        updated.metadata.resource_version = Some(self.next_version());
        state.pods.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> AirlockResult<bool> {
        self.record_op();
        let mut state = self.state.lock().await;
        Self::check_delete(&state, "Pod", name)?;
        Ok(state.pods.remove(&object_key(namespace, name)).is_some())
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> AirlockResult<ConfigMap> {
        self.record_op();
        let mut state = self.state.lock().await;
        Self::check_create(&mut state, "ConfigMap")?;

        let name = config_map.metadata.name.clone();
        let key = object_key(namespace, &name);
        if state.config_maps.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: "ConfigMap".to_string(),
                name,
            }
            .into());
        }

        let mut stored = config_map.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(self.next_version());
        stored.metadata.creation_timestamp = Some(Utc::now());
        state.config_maps.insert(key, stored.clone());
        Ok(stored)
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> AirlockResult<Vec<ConfigMap>> {
        self.record_op();
        let state = self.state.lock().await;
        let prefix = format!("{}/", namespace);

        let mut config_maps: Vec<ConfigMap> = state
            .config_maps
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter(|(_, cm)| matches_selector(&cm.metadata.labels, label_selector))
            .map(|(_, cm)| cm.clone())
            .collect();

        config_maps.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(config_maps)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> AirlockResult<bool> {
        self.record_op();
        let mut state = self.state.lock().await;
        Self::check_delete(&state, "ConfigMap", name)?;
        Ok(state
            .config_maps
            .remove(&object_key(namespace, name))
            .is_some())
    }

    async fn get_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> AirlockResult<NetworkPolicy> {
        self.record_op();
        let state = self.state.lock().await;
        state
            .network_policies
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| {
                ClusterError::NotFound {
                    kind: "NetworkPolicy".to_string(),
                    name: name.to_string(),
                }
                .into()
            })
    }

    async fn create_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> AirlockResult<NetworkPolicy> {
        self.record_op();
        let mut state = self.state.lock().await;
        Self::check_create(&mut state, "NetworkPolicy")?;

        let name = policy.metadata.name.clone();
        let key = object_key(namespace, &name);
        if state.network_policies.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: "NetworkPolicy".to_string(),
                name,
            }
            .into());
        }

        let mut stored = policy.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(self.next_version());
        stored.metadata.creation_timestamp = Some(Utc::now());
        state.network_policies.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete_network_policy(&self, namespace: &str, name: &str) -> AirlockResult<bool> {
        self.record_op();
        let mut state = self.state.lock().await;
        Self::check_delete(&state, "NetworkPolicy", name)?;
        Ok(state
            .network_policies
            .remove(&object_key(namespace, name))
            .is_some())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
