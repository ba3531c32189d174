//! Default values for airlock configuration.

use std::{path::PathBuf, sync::LazyLock};

use ipnetwork::IpNetwork;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default airlock home directory
pub static DEFAULT_AIRLOCK_HOME: LazyLock<PathBuf> =
    LazyLock::new(|| dirs::home_dir().unwrap().join(".airlock"));

/// The default egress interceptor CIDR
pub static DEFAULT_INTERCEPTOR_CIDR: LazyLock<IpNetwork> =
    LazyLock::new(|| "10.96.0.14/32".parse().unwrap());

/// The default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "airlock.yaml";

/// The default namespace sandboxes are provisioned in
pub const DEFAULT_NAMESPACE: &str = "airlock";

/// The default warm-pool tier name
pub const DEFAULT_TIER: &str = "standard";

/// The default warm-pool target per tier
pub const DEFAULT_POOL_TARGET: u32 = 3;

/// The default interval between warm-pool capacity checks, in seconds
pub const DEFAULT_POOL_INTERVAL_SECS: u64 = 15;

/// The default sandbox image
pub const DEFAULT_SANDBOX_IMAGE: &str = "ghcr.io/airlock-run/sandbox:latest";

/// The default isolation runtime class for sandbox pods
pub const DEFAULT_RUNTIME_CLASS: &str = "gvisor";

/// The default hard deadline for a claimed sandbox, in seconds
pub const DEFAULT_DEADLINE_SECS: u64 = 600;

/// The default in-pod control endpoint port
pub const DEFAULT_CONTROL_PORT: u16 = 8420;

/// The default artifacts directory inside a sandbox
pub const DEFAULT_ARTIFACTS_DIR: &str = "/artifacts";

/// The default provisioning timeout, in seconds
pub const DEFAULT_PROVISION_TIMEOUT_SECS: u64 = 120;

/// The default first readiness-poll delay, in milliseconds
pub const DEFAULT_POLL_INITIAL_MS: u64 = 250;

/// The default readiness-poll delay ceiling, in milliseconds
pub const DEFAULT_POLL_MAX_MS: u64 = 5000;

/// The default claim-delivery timeout, in seconds
pub const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 5;

/// The default number of claim-delivery retries
pub const DEFAULT_DELIVERY_RETRIES: u32 = 1;

/// The default controller API host
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// The default controller API port
pub const DEFAULT_SERVER_PORT: u16 = 3030;

/// The default egress interceptor port
pub const DEFAULT_INTERCEPTOR_PORT: u16 = 8443;

/// The default interval between lifecycle sweeps, in seconds
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;

/// How long a sandbox may sit in provisioning or claiming before it is reaped, in seconds
pub const DEFAULT_STALE_PENDING_SECS: u64 = 300;

/// Maximum teardown delete attempts before the sandbox is flagged as stuck
pub const DEFAULT_TEARDOWN_MAX_ATTEMPTS: u32 = 5;
