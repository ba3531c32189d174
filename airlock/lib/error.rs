use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

use crate::{cluster::ClusterError, sandbox::SandboxState};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an airlock-related operation.
pub type AirlockResult<T> = Result<T, AirlockError>;

/// An error that occurred during a sandbox lifecycle operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum AirlockError {
    /// The investigation thread already holds a live sandbox binding.
    #[error("claim conflict: thread '{thread_id}' of tenant '{tenant_id}' is already bound to sandbox '{sandbox_id}'")]
    ClaimConflict {
        /// The tenant that owns the conflicting binding.
        tenant_id: String,

        /// The investigation thread that is already bound.
        thread_id: String,

        /// The sandbox the thread is bound to.
        sandbox_id: String,
    },

    /// The warm pool is empty and on-demand provisioning is disabled.
    #[error("pool exhausted: no unclaimed sandbox available in tier '{tier}'")]
    PoolExhausted {
        /// The tier whose pool was empty.
        tier: String,
    },

    /// A sandbox could not be brought to a claimable or claimed state.
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// A caller-supplied identifier or parameter was rejected.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A sandbox outlived its hard deadline.
    #[error("deadline exceeded for sandbox '{sandbox_id}'")]
    DeadlineExceeded {
        /// The sandbox that ran past its deadline.
        sandbox_id: String,
    },

    /// Teardown could not complete within its retry bound.
    #[error("teardown stuck for sandbox '{sandbox_id}' after {attempts} attempts: {reason}")]
    TeardownStuck {
        /// The sandbox whose resources could not be deleted.
        sandbox_id: String,

        /// How many delete attempts were made.
        attempts: u32,

        /// The last failure observed.
        reason: String,
    },

    /// A sandbox state transition that the lifecycle state machine forbids.
    #[error("invalid state transition for sandbox '{sandbox_id}': {from} -> {to}")]
    InvalidStateTransition {
        /// The sandbox whose state was being changed.
        sandbox_id: String,

        /// The state the sandbox was in.
        from: SandboxState,

        /// The state the transition asked for.
        to: SandboxState,
    },

    /// A claim token failed verification.
    #[error("token rejected: {0}")]
    TokenRejected(String),

    /// An error returned by the cluster API.
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// An error that occurred when validating a configuration.
    #[error("config validation error: {0}")]
    ConfigValidation(String),

    /// Errors collected while validating a configuration.
    #[error("config validation errors: {}", .0.join("; "))]
    ConfigValidationErrors(Vec<String>),

    /// An error that occurred when validating paths.
    #[error("path validation error: {0}")]
    PathValidation(String),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that occurred during JSON serialization.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error that occurred during YAML serialization.
    #[error("serde yaml error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred while encoding or decoding a JWT.
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AirlockError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> AirlockError {
        AirlockError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Whether the error is the expected outcome of losing a resource-version race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, AirlockError::Cluster(ClusterError::Conflict { .. }))
    }

    /// Whether the error means the object was not there to begin with.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AirlockError::Cluster(ClusterError::NotFound { .. }))
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `AirlockResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> AirlockResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
