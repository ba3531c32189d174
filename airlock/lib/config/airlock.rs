//! The airlock configuration types, loading, and validation.

use std::{collections::HashMap, fs, path::Path, time::Duration};

use getset::Getters;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    config::defaults::*,
    utils::{normalize_path, validate_safe_ident},
    AirlockError, AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The airlock controller configuration, usually loaded from `airlock.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct AirlockConfig {
    /// How the controller reaches the cluster API.
    #[serde(default)]
    #[builder(default)]
    cluster: ClusterConfig,

    /// Warm pool sizing and replenishment.
    #[serde(default)]
    #[builder(default)]
    pool: PoolConfig,

    /// The shape of sandbox pods.
    #[serde(default)]
    #[builder(default)]
    sandbox: SandboxConfig,

    /// Provisioning timeouts and readiness polling.
    #[serde(default)]
    #[builder(default)]
    provisioning: ProvisioningConfig,

    /// Claim-token delivery behavior.
    #[serde(default)]
    #[builder(default)]
    delivery: DeliveryConfig,

    /// The controller's own API server.
    #[serde(default)]
    #[builder(default)]
    server: ServerConfig,

    /// Egress restriction applied to sandbox pods.
    #[serde(default)]
    #[builder(default)]
    egress: EgressConfig,

    /// Lifecycle supervision cadence and bounds.
    #[serde(default)]
    #[builder(default)]
    lifecycle: LifecycleConfig,
}

/// How the controller reaches the cluster API.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct ClusterConfig {
    /// The access mode.
    #[serde(default)]
    #[builder(default)]
    mode: ClusterMode,

    /// The API server URL. Required when `mode` is `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    api_url: Option<String>,

    /// The namespace sandboxes are provisioned in.
    #[serde(default = "default_namespace")]
    #[builder(default = default_namespace())]
    namespace: String,
}

/// The cluster access mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMode {
    /// Use the service account mounted into the controller's own pod.
    #[default]
    InCluster,

    /// Use an explicit API server URL.
    Url,

    /// Use the in-memory cluster. Single-process runs and tests.
    Memory,
}

/// Warm pool sizing and replenishment.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct PoolConfig {
    /// The pool tiers, keyed by tier name.
    #[serde(default = "default_tiers")]
    #[builder(default = default_tiers())]
    tiers: HashMap<String, TierConfig>,

    /// Whether an empty pool falls back to provisioning a sandbox on demand.
    ///
    /// Off by default: exhaustion surfaces to the caller instead of silently taking the
    /// slower cold-start path.
    #[serde(default)]
    #[builder(default)]
    allow_cold_start: bool,

    /// Seconds between periodic capacity checks.
    #[serde(default = "default_pool_interval_secs")]
    #[builder(default = default_pool_interval_secs())]
    check_interval_secs: u64,
}

/// One warm pool tier.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct TierConfig {
    /// How many unclaimed sandboxes to keep ready.
    #[serde(default = "default_pool_target")]
    #[builder(default = default_pool_target())]
    target: u32,

    /// An image overriding the global sandbox image for this tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    image: Option<String>,
}

/// The shape of sandbox pods.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct SandboxConfig {
    /// The sandbox image.
    #[serde(default = "default_sandbox_image")]
    #[builder(default = default_sandbox_image())]
    image: String,

    /// The runtime class selecting the isolation technology.
    #[serde(default = "default_runtime_class")]
    #[builder(default = default_runtime_class())]
    runtime_class: String,

    /// The hard deadline for a claimed sandbox, in seconds. Claim tokens expire with it.
    #[serde(default = "default_deadline_secs")]
    #[builder(default = default_deadline_secs())]
    deadline_secs: u64,

    /// The port the in-pod control endpoint listens on.
    #[serde(default = "default_control_port")]
    #[builder(default = default_control_port())]
    control_port: u16,

    /// The directory inside the sandbox where investigation artifacts are written.
    #[serde(default = "default_artifacts_dir")]
    #[builder(default = default_artifacts_dir())]
    artifacts_dir: String,
}

/// Provisioning timeouts and readiness polling.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct ProvisioningConfig {
    /// How long a sandbox may take to become ready, in seconds.
    #[serde(default = "default_provision_timeout_secs")]
    #[builder(default = default_provision_timeout_secs())]
    timeout_secs: u64,

    /// The first readiness-poll delay, in milliseconds.
    #[serde(default = "default_poll_initial_ms")]
    #[builder(default = default_poll_initial_ms())]
    poll_initial_ms: u64,

    /// The readiness-poll delay ceiling, in milliseconds.
    #[serde(default = "default_poll_max_ms")]
    #[builder(default = default_poll_max_ms())]
    poll_max_ms: u64,
}

/// Claim-token delivery behavior.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct DeliveryConfig {
    /// The per-attempt network timeout, in seconds.
    #[serde(default = "default_delivery_timeout_secs")]
    #[builder(default = default_delivery_timeout_secs())]
    timeout_secs: u64,

    /// How many times a failed delivery is retried. At most one.
    #[serde(default = "default_delivery_retries")]
    #[builder(default = default_delivery_retries())]
    retries: u32,
}

/// The controller's own API server.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct ServerConfig {
    /// The address to bind.
    #[serde(default = "default_server_host")]
    #[builder(default = default_server_host())]
    host: String,

    /// The port to bind.
    #[serde(default = "default_server_port")]
    #[builder(default = default_server_port())]
    port: u16,

    /// A static bearer key callers must present. Unset disables authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    api_key: Option<String>,
}

/// Egress restriction applied to sandbox pods.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct EgressConfig {
    /// The CIDR of the traffic interceptor all sandbox egress is forced through.
    #[serde(default = "default_interceptor_cidr")]
    #[builder(default = default_interceptor_cidr())]
    interceptor_cidr: IpNetwork,

    /// The interceptor ports sandboxes may reach.
    #[serde(default = "default_interceptor_ports")]
    #[builder(default = default_interceptor_ports())]
    interceptor_ports: Vec<u16>,
}

/// Lifecycle supervision cadence and bounds.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct LifecycleConfig {
    /// Seconds between supervisor sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    #[builder(default = default_sweep_interval_secs())]
    sweep_interval_secs: u64,

    /// Seconds a sandbox may sit in provisioning or claiming before it is reaped.
    #[serde(default = "default_stale_pending_secs")]
    #[builder(default = default_stale_pending_secs())]
    stale_pending_secs: u64,

    /// Delete attempts per resource before the sandbox is flagged as stuck.
    #[serde(default = "default_teardown_max_attempts")]
    #[builder(default = default_teardown_max_attempts())]
    teardown_max_attempts: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AirlockConfig {
    /// Loads and validates a configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> AirlockResult<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration, collecting all problems before failing.
    pub fn validate(&self) -> AirlockResult<()> {
        let mut errors = Vec::new();

        if self.cluster.mode == ClusterMode::Url && self.cluster.api_url.is_none() {
            errors.push("cluster.api_url is required when cluster.mode is 'url'".to_string());
        }
        if let Err(e) = validate_safe_ident("cluster.namespace", &self.cluster.namespace) {
            errors.push(e.to_string());
        }

        if self.pool.tiers.is_empty() {
            errors.push("pool.tiers must define at least one tier".to_string());
        }
        for name in self.pool.tiers.keys() {
            if let Err(e) = validate_safe_ident("pool tier name", name) {
                errors.push(e.to_string());
            }
        }

        if self.sandbox.image.is_empty() {
            errors.push("sandbox.image cannot be empty".to_string());
        }
        if self.sandbox.deadline_secs == 0 {
            errors.push("sandbox.deadline_secs must be greater than zero".to_string());
        }
        if self.sandbox.control_port == 0 {
            errors.push("sandbox.control_port must be greater than zero".to_string());
        }
        if let Err(e) = normalize_path(&self.sandbox.artifacts_dir, true) {
            errors.push(format!("sandbox.artifacts_dir: {}", e));
        }

        if self.provisioning.timeout_secs == 0 {
            errors.push("provisioning.timeout_secs must be greater than zero".to_string());
        }
        if self.provisioning.poll_initial_ms == 0 {
            errors.push("provisioning.poll_initial_ms must be greater than zero".to_string());
        }
        if self.provisioning.poll_max_ms < self.provisioning.poll_initial_ms {
            errors.push(
                "provisioning.poll_max_ms cannot be smaller than poll_initial_ms".to_string(),
            );
        }

        if self.delivery.timeout_secs == 0 {
            errors.push("delivery.timeout_secs must be greater than zero".to_string());
        }
        if self.delivery.retries > 1 {
            errors.push("delivery.retries is bounded at one retry".to_string());
        }

        if self.egress.interceptor_ports.is_empty() {
            errors.push("egress.interceptor_ports must list at least one port".to_string());
        }

        if self.lifecycle.sweep_interval_secs == 0 {
            errors.push("lifecycle.sweep_interval_secs must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AirlockError::ConfigValidationErrors(errors))
        }
    }
}

impl PoolConfig {
    /// The interval between periodic capacity checks.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl SandboxConfig {
    /// The hard deadline as a duration.
    pub fn deadline(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.deadline_secs as i64)
    }
}

impl ProvisioningConfig {
    /// The overall readiness timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The first readiness-poll delay.
    pub fn poll_initial(&self) -> Duration {
        Duration::from_millis(self.poll_initial_ms)
    }

    /// The readiness-poll delay ceiling.
    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms)
    }
}

impl DeliveryConfig {
    /// The per-attempt network timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl LifecycleConfig {
    /// The interval between supervisor sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// How long a sandbox may sit in a pre-claim state before it is reaped.
    pub fn stale_pending(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_pending_secs as i64)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_tiers() -> HashMap<String, TierConfig> {
    HashMap::from([(DEFAULT_TIER.to_string(), TierConfig::default())])
}

fn default_pool_target() -> u32 {
    DEFAULT_POOL_TARGET
}

fn default_pool_interval_secs() -> u64 {
    DEFAULT_POOL_INTERVAL_SECS
}

fn default_sandbox_image() -> String {
    DEFAULT_SANDBOX_IMAGE.to_string()
}

fn default_runtime_class() -> String {
    DEFAULT_RUNTIME_CLASS.to_string()
}

fn default_deadline_secs() -> u64 {
    DEFAULT_DEADLINE_SECS
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_artifacts_dir() -> String {
    DEFAULT_ARTIFACTS_DIR.to_string()
}

fn default_provision_timeout_secs() -> u64 {
    DEFAULT_PROVISION_TIMEOUT_SECS
}

fn default_poll_initial_ms() -> u64 {
    DEFAULT_POLL_INITIAL_MS
}

fn default_poll_max_ms() -> u64 {
    DEFAULT_POLL_MAX_MS
}

fn default_delivery_timeout_secs() -> u64 {
    DEFAULT_DELIVERY_TIMEOUT_SECS
}

fn default_delivery_retries() -> u32 {
    DEFAULT_DELIVERY_RETRIES
}

fn default_server_host() -> String {
    DEFAULT_SERVER_HOST.to_string()
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_interceptor_cidr() -> IpNetwork {
    *DEFAULT_INTERCEPTOR_CIDR
}

fn default_interceptor_ports() -> Vec<u16> {
    vec![DEFAULT_INTERCEPTOR_PORT]
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_stale_pending_secs() -> u64 {
    DEFAULT_STALE_PENDING_SECS
}

fn default_teardown_max_attempts() -> u32 {
    DEFAULT_TEARDOWN_MAX_ATTEMPTS
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::default(),
            api_url: None,
            namespace: default_namespace(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            allow_cold_start: false,
            check_interval_secs: default_pool_interval_secs(),
        }
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            target: default_pool_target(),
            image: None,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_sandbox_image(),
            runtime_class: default_runtime_class(),
            deadline_secs: default_deadline_secs(),
            control_port: default_control_port(),
            artifacts_dir: default_artifacts_dir(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_provision_timeout_secs(),
            poll_initial_ms: default_poll_initial_ms(),
            poll_max_ms: default_poll_max_ms(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_delivery_timeout_secs(),
            retries: default_delivery_retries(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            api_key: None,
        }
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            interceptor_cidr: default_interceptor_cidr(),
            interceptor_ports: default_interceptor_ports(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_pending_secs: default_stale_pending_secs(),
            teardown_max_attempts: default_teardown_max_attempts(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
