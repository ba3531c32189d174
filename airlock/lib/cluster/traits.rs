//! The narrow cluster API surface the controller depends on.

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    cluster::{ConfigMap, NetworkPolicy, Pod},
    AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An error returned by the cluster API.
///
/// Call sites distinguish "not found" and "conflict" from genuine failures; both are expected
/// outcomes of idempotent deletes and compare-and-swap updates respectively.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The object does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// The kind of the object.
        kind: String,

        /// The name of the object.
        name: String,
    },

    /// The object changed since it was read. The caller's resource version is stale.
    #[error("conflict updating {kind} '{name}': resource version is stale")]
    Conflict {
        /// The kind of the object.
        kind: String,

        /// The name of the object.
        name: String,
    },

    /// An object with the same name already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// The kind of the object.
        kind: String,

        /// The name of the object.
        name: String,
    },

    /// The API rejected or failed the request.
    #[error("cluster api error ({status}): {message}")]
    Api {
        /// The HTTP status code the API returned.
        status: u16,

        /// The failure message from the API.
        message: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Typed access to the cluster objects that make up sandboxes.
///
/// The cluster is the single source of truth for sandbox existence and claim state. `update_pod`
/// is a compare-and-swap on the pod's resource version; every claim race is decided there.
/// Deletes return `Ok(false)` when the object was already absent, so teardown is idempotent.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Creates a pod in the given namespace.
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> AirlockResult<Pod>;

    /// Fetches a pod by name.
    async fn get_pod(&self, namespace: &str, name: &str) -> AirlockResult<Pod>;

    /// Lists pods matching a label selector, e.g. `airlock.dev/sandbox=true`.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> AirlockResult<Vec<Pod>>;

    /// Replaces a pod, conditional on the resource version carried in its metadata.
    ///
    /// Returns [`ClusterError::Conflict`] if another writer got there first.
    async fn update_pod(&self, namespace: &str, pod: &Pod) -> AirlockResult<Pod>;

    /// Deletes a pod. Returns `Ok(false)` if it was already gone.
    async fn delete_pod(&self, namespace: &str, name: &str) -> AirlockResult<bool>;

    /// Creates a config map in the given namespace.
    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> AirlockResult<ConfigMap>;

    /// Lists config maps matching a label selector.
    async fn list_config_maps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> AirlockResult<Vec<ConfigMap>>;

    /// Deletes a config map. Returns `Ok(false)` if it was already gone.
    async fn delete_config_map(&self, namespace: &str, name: &str) -> AirlockResult<bool>;

    /// Fetches a network policy by name.
    async fn get_network_policy(&self, namespace: &str, name: &str)
        -> AirlockResult<NetworkPolicy>;

    /// Creates a network policy in the given namespace.
    async fn create_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> AirlockResult<NetworkPolicy>;

    /// Deletes a network policy. Returns `Ok(false)` if it was already gone.
    async fn delete_network_policy(&self, namespace: &str, name: &str) -> AirlockResult<bool>;
}
