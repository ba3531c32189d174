//! Minimal typed models of the cluster objects airlock manages.
//!
//! Only the fields the controller reads or writes are modeled. Field spellings follow the
//! Kubernetes wire format, so these types serialize straight into API request bodies.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Standard object metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    /// The name of the object, unique within its namespace.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// The namespace the object lives in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Labels attached to the object.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    /// Annotations attached to the object.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,

    /// The optimistic-concurrency token assigned by the cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    /// When the cluster recorded the object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// A pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pod {
    /// The API version of the object. Always `v1`.
    pub api_version: String,

    /// The kind of the object. Always `Pod`.
    pub kind: String,

    /// Standard object metadata.
    pub metadata: ObjectMeta,

    /// The desired pod behavior.
    pub spec: PodSpec,

    /// The most recently observed status, written by the cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PodStatus>,
}

/// The desired behavior of a pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodSpec {
    /// The containers belonging to the pod.
    pub containers: Vec<Container>,

    /// The volumes that containers can mount.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// The runtime class that selects the isolation technology the pod runs under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,

    /// Whether a service account token is mounted into the pod.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,

    /// The restart policy for containers in the pod.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,

    /// How long the pod is given to shut down before it is killed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

/// A single container within a pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Container {
    /// The name of the container.
    pub name: String,

    /// The image the container runs.
    pub image: String,

    /// Arguments passed to the container entrypoint.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables set in the container.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Ports the container exposes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,

    /// Volumes mounted into the container's filesystem.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

/// An environment variable in a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvVar {
    /// The name of the variable.
    pub name: String,

    /// The value of the variable.
    pub value: String,
}

/// A port exposed by a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerPort {
    /// The port number.
    pub container_port: u16,

    /// An optional name for the port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A named volume a pod can mount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Volume {
    /// The name of the volume.
    pub name: String,

    /// A config map populating the volume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapVolumeSource>,

    /// An empty scratch directory backing the volume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
}

/// A config map projected as a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigMapVolumeSource {
    /// The name of the config map.
    pub name: String,
}

/// An ephemeral scratch directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmptyDirVolumeSource {}

/// A volume mounted into a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeMount {
    /// The name of the volume being mounted.
    pub name: String,

    /// Where in the container the volume appears.
    pub mount_path: String,

    /// Whether the mount is read-only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

/// The observed status of a pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodStatus {
    /// The coarse lifecycle phase of the pod.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<PodPhase>,

    /// The IP address assigned to the pod.
    #[serde(rename = "podIP", skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
}

/// The coarse lifecycle phase the cluster reports for a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    /// The pod has been accepted but not all containers are running.
    Pending,

    /// All containers are running.
    Running,

    /// All containers terminated successfully.
    Succeeded,

    /// At least one container terminated in failure.
    Failed,

    /// The pod state could not be obtained.
    Unknown,
}

/// A config map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigMap {
    /// The API version of the object. Always `v1`.
    pub api_version: String,

    /// The kind of the object. Always `ConfigMap`.
    pub kind: String,

    /// Standard object metadata.
    pub metadata: ObjectMeta,

    /// The configuration entries.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, String>,
}

/// A network policy restricting pod traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkPolicy {
    /// The API version of the object. Always `networking.k8s.io/v1`.
    pub api_version: String,

    /// The kind of the object. Always `NetworkPolicy`.
    pub kind: String,

    /// Standard object metadata.
    pub metadata: ObjectMeta,

    /// The restriction rules.
    pub spec: NetworkPolicySpec,
}

/// The rules of a network policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkPolicySpec {
    /// The pods the policy applies to.
    pub pod_selector: LabelSelector,

    /// Which directions the policy restricts, e.g. `Egress`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub policy_types: Vec<String>,

    /// The egress rules. Traffic not matched by any rule is denied.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<EgressRule>,
}

/// A label-based object selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSelector {
    /// Labels an object must carry to match.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub match_labels: HashMap<String, String>,
}

/// A single egress allowance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EgressRule {
    /// The destinations traffic may flow to. Empty means any destination.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<NetworkPolicyPeer>,

    /// The ports traffic may flow on. Empty means any port.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<NetworkPolicyPort>,
}

/// A traffic destination in a network policy rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkPolicyPeer {
    /// A CIDR-based destination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_block: Option<IpBlock>,
}

/// A CIDR range in a network policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpBlock {
    /// The CIDR the rule applies to.
    pub cidr: IpNetwork,

    /// CIDRs carved out of `cidr`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<IpNetwork>,
}

/// A port in a network policy rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkPolicyPort {
    /// The transport protocol, `TCP` or `UDP`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// The port number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// A list of objects as returned by the cluster API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectList<T> {
    /// The objects in the list.
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// The status body the cluster API returns for failed requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiStatus {
    /// A human-readable description of the failure.
    pub message: Option<String>,

    /// A machine-readable reason, e.g. `AlreadyExists`.
    pub reason: Option<String>,

    /// The HTTP status code.
    pub code: Option<u16>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Pod {
    /// Creates a pod with the given metadata and spec.
    pub fn new(metadata: ObjectMeta, spec: PodSpec) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata,
            spec,
            status: None,
        }
    }

    /// Whether the cluster reports the pod as running with an assigned IP.
    pub fn is_running(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase == Some(PodPhase::Running) && s.pod_ip.is_some())
            .unwrap_or(false)
    }
}

impl ConfigMap {
    /// Creates a config map with the given metadata and entries.
    pub fn new(metadata: ObjectMeta, data: HashMap<String, String>) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            metadata,
            data,
        }
    }
}

impl NetworkPolicy {
    /// Creates a network policy with the given metadata and spec.
    pub fn new(metadata: ObjectMeta, spec: NetworkPolicySpec) -> Self {
        Self {
            api_version: "networking.k8s.io/v1".to_string(),
            kind: "NetworkPolicy".to_string(),
            metadata,
            spec,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Pod {
    fn default() -> Self {
        Self::new(ObjectMeta::default(), PodSpec::default())
    }
}

impl Default for ConfigMap {
    fn default() -> Self {
        Self::new(ObjectMeta::default(), HashMap::new())
    }
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self::new(ObjectMeta::default(), NetworkPolicySpec::default())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_serializes_with_wire_field_names() -> anyhow::Result<()> {
        let mut pod = Pod::default();
        pod.metadata.name = "sbx-0a1b2c3d".to_string();
        pod.spec.runtime_class_name = Some("gvisor".to_string());
        pod.spec.automount_service_account_token = Some(false);
        pod.status = Some(PodStatus {
            phase: Some(PodPhase::Running),
            pod_ip: Some("10.0.0.12".to_string()),
        });

        let json = serde_json::to_string(&pod)?;
        assert!(json.contains("\"apiVersion\":\"v1\""));
        assert!(json.contains("\"kind\":\"Pod\""));
        assert!(json.contains("\"runtimeClassName\":\"gvisor\""));
        assert!(json.contains("\"automountServiceAccountToken\":false"));
        assert!(json.contains("\"podIP\":\"10.0.0.12\""));
        assert!(json.contains("\"phase\":\"Running\""));
        Ok(())
    }

    #[test]
    fn test_pod_deserializes_partial_status() -> anyhow::Result<()> {
        let json = r#"{
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "sbx-ffeeddcc",
                "namespace": "airlock",
                "resourceVersion": "4217",
                "labels": {"airlock.dev/state": "unclaimed"}
            },
            "spec": {"containers": [{"name": "sandbox", "image": "airlock/sandbox:1"}]},
            "status": {"phase": "Pending"}
        }"#;

        let pod: Pod = serde_json::from_str(json)?;
        assert_eq!(pod.metadata.name, "sbx-ffeeddcc");
        assert_eq!(pod.metadata.resource_version.as_deref(), Some("4217"));
        assert!(!pod.is_running());
        Ok(())
    }

    #[test]
    fn test_network_policy_egress_shape() -> anyhow::Result<()> {
        let policy = NetworkPolicy::new(
            ObjectMeta {
                name: "airlock-egress".to_string(),
                ..Default::default()
            },
            NetworkPolicySpec {
                pod_selector: LabelSelector::default(),
                policy_types: vec!["Egress".to_string()],
                egress: vec![EgressRule {
                    to: vec![NetworkPolicyPeer {
                        ip_block: Some(IpBlock {
                            cidr: "10.96.0.14/32".parse()?,
                            except: vec![],
                        }),
                    }],
                    ports: vec![NetworkPolicyPort {
                        protocol: Some("TCP".to_string()),
                        port: Some(8443),
                    }],
                }],
            },
        );

        let json = serde_json::to_string(&policy)?;
        assert!(json.contains("\"apiVersion\":\"networking.k8s.io/v1\""));
        assert!(json.contains("\"policyTypes\":[\"Egress\"]"));
        assert!(json.contains("\"ipBlock\":{\"cidr\":\"10.96.0.14/32\"}"));
        Ok(())
    }

    #[test]
    fn test_object_list_tolerates_missing_items() -> anyhow::Result<()> {
        let list: ObjectList<Pod> = serde_json::from_str(r#"{"kind": "PodList"}"#)?;
        assert!(list.items.is_empty());
        Ok(())
    }
}
