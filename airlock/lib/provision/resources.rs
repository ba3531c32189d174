//! Builders for the cluster objects that make up one sandbox.
//!
//! The credential-isolation contract is enforced here: sandbox pods get an empty environment,
//! no service account token, and an egress policy that only reaches the traffic interceptor.
//! The only secret material a sandbox ever receives is its claim token, delivered over the
//! control endpoint after the claim wins.

use std::collections::HashMap;

use crate::{
    cluster::{
        ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EgressRule,
        EmptyDirVolumeSource, IpBlock, LabelSelector, NetworkPolicy, NetworkPolicyPeer,
        NetworkPolicyPort, NetworkPolicySpec, ObjectMeta, Pod, PodSpec, Volume, VolumeMount,
    },
    config::{EgressConfig, SandboxConfig},
    sandbox::{SandboxState, OWNER_LABEL, SANDBOX_LABEL, STATE_LABEL, TIER_LABEL},
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The name of the namespace-shared egress policy
pub const EGRESS_POLICY_NAME: &str = "airlock-egress";

/// The config object key holding the hex-encoded token verification key
pub const VERIFY_KEY_CONFIG_KEY: &str = "token_verify_key";

/// Where the sandbox's config object is mounted inside the pod
pub const CONFIG_MOUNT_PATH: &str = "/etc/airlock";

/// The name of the container running the sandbox runtime
const SANDBOX_CONTAINER_NAME: &str = "sandbox";

/// The pod volume projecting the sandbox's config object
const CONFIG_VOLUME_NAME: &str = "airlock-config";

/// The pod volume backing the artifacts directory
const ARTIFACTS_VOLUME_NAME: &str = "artifacts";

/// Suffix appended to the sandbox id to name its config object
const CONFIG_NAME_SUFFIX: &str = "-config";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The name of the config object belonging to a sandbox.
pub fn config_map_name(sandbox_id: &str) -> String {
    format!("{}{}", sandbox_id, CONFIG_NAME_SUFFIX)
}

/// Builds the pod for a new sandbox.
///
/// The pod starts in the `provisioning` state. Its environment stays empty and no service
/// account token is mounted: the claim token arrives later over the control endpoint, and
/// third-party credentials never enter the pod at all.
pub fn sandbox_pod(
    sandbox_id: &str,
    namespace: &str,
    tier: &str,
    image: &str,
    sandbox: &SandboxConfig,
) -> Pod {
    let metadata = ObjectMeta {
        name: sandbox_id.to_string(),
        namespace: Some(namespace.to_string()),
        labels: HashMap::from([
            (SANDBOX_LABEL.to_string(), "true".to_string()),
            (
                STATE_LABEL.to_string(),
                SandboxState::Provisioning.to_string(),
            ),
            (TIER_LABEL.to_string(), tier.to_string()),
        ]),
        ..Default::default()
    };

    let container = Container {
        name: SANDBOX_CONTAINER_NAME.to_string(),
        image: image.to_string(),
        args: vec![
            "serve".to_string(),
            "--sandbox-id".to_string(),
            sandbox_id.to_string(),
            "--control-port".to_string(),
            sandbox.get_control_port().to_string(),
            "--artifacts-dir".to_string(),
            sandbox.get_artifacts_dir().to_string(),
            "--verify-key-file".to_string(),
            format!("{}/{}", CONFIG_MOUNT_PATH, VERIFY_KEY_CONFIG_KEY),
        ],
        env: vec![],
        ports: vec![ContainerPort {
            container_port: *sandbox.get_control_port(),
            name: Some("control".to_string()),
        }],
        volume_mounts: vec![
            VolumeMount {
                name: CONFIG_VOLUME_NAME.to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
            },
            VolumeMount {
                name: ARTIFACTS_VOLUME_NAME.to_string(),
                mount_path: sandbox.get_artifacts_dir().to_string(),
                read_only: None,
            },
        ],
    };

    let spec = PodSpec {
        containers: vec![container],
        volumes: vec![
            Volume {
                name: CONFIG_VOLUME_NAME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map_name(sandbox_id),
                }),
                empty_dir: None,
            },
            Volume {
                name: ARTIFACTS_VOLUME_NAME.to_string(),
                config_map: None,
                empty_dir: Some(EmptyDirVolumeSource {}),
            },
        ],
        runtime_class_name: Some(sandbox.get_runtime_class().to_string()),
        automount_service_account_token: Some(false),
        restart_policy: Some("Never".to_string()),
        termination_grace_period_seconds: Some(5),
    };

    Pod::new(metadata, spec)
}

/// Builds the config object for a new sandbox.
///
/// Carries only the public token verification key. Nothing in it is secret.
pub fn sandbox_config_map(sandbox_id: &str, namespace: &str, verify_key_hex: &str) -> ConfigMap {
    let metadata = ObjectMeta {
        name: config_map_name(sandbox_id),
        namespace: Some(namespace.to_string()),
        labels: HashMap::from([
            (SANDBOX_LABEL.to_string(), "true".to_string()),
            (OWNER_LABEL.to_string(), sandbox_id.to_string()),
        ]),
        ..Default::default()
    };

    ConfigMap::new(
        metadata,
        HashMap::from([(
            VERIFY_KEY_CONFIG_KEY.to_string(),
            verify_key_hex.to_string(),
        )]),
    )
}

/// Builds the namespace-shared egress policy for sandbox pods.
///
/// Denies all egress except the traffic interceptor and in-cluster DNS, so every outbound
/// third-party call is forced through the credential-injection layer.
pub fn egress_policy(namespace: &str, egress: &EgressConfig) -> NetworkPolicy {
    let metadata = ObjectMeta {
        name: EGRESS_POLICY_NAME.to_string(),
        namespace: Some(namespace.to_string()),
        labels: HashMap::from([(SANDBOX_LABEL.to_string(), "true".to_string())]),
        ..Default::default()
    };

    let interceptor_rule = EgressRule {
        to: vec![NetworkPolicyPeer {
            ip_block: Some(IpBlock {
                cidr: *egress.get_interceptor_cidr(),
                except: vec![],
            }),
        }],
        ports: egress
            .get_interceptor_ports()
            .iter()
            .map(|port| NetworkPolicyPort {
                protocol: Some("TCP".to_string()),
                port: Some(*port),
            })
            .collect(),
    };

    let dns_rule = EgressRule {
        to: vec![],
        ports: vec![
            NetworkPolicyPort {
                protocol: Some("UDP".to_string()),
                port: Some(53),
            },
            NetworkPolicyPort {
                protocol: Some("TCP".to_string()),
                port: Some(53),
            },
        ],
    };

    NetworkPolicy::new(
        metadata,
        NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: HashMap::from([(SANDBOX_LABEL.to_string(), "true".to_string())]),
            },
            policy_types: vec!["Egress".to_string()],
            egress: vec![interceptor_rule, dns_rule],
        },
    )
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
