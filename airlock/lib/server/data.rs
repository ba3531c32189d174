//! Request and response bodies of the controller API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    claim::ClaimGrant,
    sandbox::{InvestigationOutcome, Sandbox, SandboxState},
};

//--------------------------------------------------------------------------------------------------
// Types: Requests
//--------------------------------------------------------------------------------------------------

/// Request body for claiming a sandbox
#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    /// The tenant making the claim
    pub tenant_id: String,

    /// The investigation thread the sandbox will be bound to
    pub thread_id: String,

    /// The pool tier to claim from, defaulting to the standard tier
    pub tier: Option<String>,
}

/// Request body for releasing a sandbox
#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    /// The terminal outcome to record
    pub outcome: InvestigationOutcome,
}

//--------------------------------------------------------------------------------------------------
// Types: Responses
//--------------------------------------------------------------------------------------------------

/// Response body for a successful claim
#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    /// The claimed sandbox
    pub sandbox_id: String,

    /// The tier it came from
    pub tier: String,

    /// The sandbox's control endpoint base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// The claim token scoped to the sandbox
    pub token: String,

    /// When the token expires; also the sandbox's hard deadline
    pub expires_at: DateTime<Utc>,
}

/// Response body for a release
#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    /// The released sandbox
    pub sandbox_id: String,

    /// The recorded outcome
    pub outcome: InvestigationOutcome,

    /// Whether the sandbox still existed when released
    pub found: bool,
}

/// One sandbox in a listing
#[derive(Debug, Serialize)]
pub struct SandboxSummary {
    /// The sandbox id
    pub sandbox_id: String,

    /// The warm-pool tier
    pub tier: String,

    /// The lifecycle state
    pub state: SandboxState,

    /// The bound tenant, once claimed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// The bound investigation thread, once claimed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// When the claim completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    /// The hard deadline set at claim time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

/// Response body for the sandbox listing
#[derive(Debug, Serialize)]
pub struct SandboxListResponse {
    /// Every managed sandbox in the namespace
    pub sandboxes: Vec<SandboxSummary>,
}

/// Warm-pool occupancy of one tier
#[derive(Debug, Serialize)]
pub struct TierStatus {
    /// The tier name
    pub tier: String,

    /// The configured warm target
    pub target: u32,

    /// Sandboxes ready to claim
    pub unclaimed: usize,

    /// Sandboxes still provisioning
    pub provisioning: usize,

    /// Sandboxes bound to a thread
    pub bound: usize,
}

/// Response body for the controller status endpoint
#[derive(Debug, Serialize)]
pub struct ControllerStatusResponse {
    /// Occupancy per tier
    pub tiers: Vec<TierStatus>,

    /// Threads currently holding a sandbox
    pub bound_threads: usize,

    /// Sandboxes whose teardown is past the attempt cap
    pub stuck_teardowns: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Types: Error Response
//--------------------------------------------------------------------------------------------------

/// Standard error response format
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub code: u16,

    /// Error message
    pub message: String,

    /// Error type for categorizing errors
    pub error_type: ErrorType,

    /// Optional additional details about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Types of errors the API reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Invalid request parameters or identifiers
    ValidationError,

    /// Missing or invalid credentials
    AuthenticationError,

    /// The thread already holds a sandbox
    ClaimConflict,

    /// No claimable sandbox in the requested tier
    PoolExhausted,

    /// Resource not found
    NotFound,

    /// Sandbox lifecycle operation errors
    SandboxError,

    /// Internal server errors
    InternalError,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ClaimResponse {
    /// Builds the response from a claim grant.
    pub fn from_grant(grant: &ClaimGrant, control_port: u16) -> Self {
        Self {
            sandbox_id: grant.sandbox.get_sandbox_id().clone(),
            tier: grant.sandbox.get_tier().clone(),
            endpoint: grant.sandbox.control_endpoint(control_port),
            token: grant.token.get_token().clone(),
            expires_at: *grant.token.get_expires_at(),
        }
    }
}

impl SandboxSummary {
    /// Builds a summary from a decoded sandbox record.
    pub fn from_sandbox(sandbox: &Sandbox) -> Self {
        Self {
            sandbox_id: sandbox.get_sandbox_id().clone(),
            tier: sandbox.get_tier().clone(),
            state: *sandbox.get_state(),
            tenant_id: sandbox.get_bound_tenant_id().clone(),
            thread_id: sandbox.get_bound_thread_id().clone(),
            claimed_at: *sandbox.get_claimed_at(),
            deadline: *sandbox.get_deadline(),
        }
    }
}

impl ErrorResponse {
    /// Creates a new error response.
    pub fn new(code: u16, message: String, error_type: ErrorType) -> Self {
        Self {
            code,
            message,
            error_type,
            details: None,
        }
    }

    /// Adds details to the error response, withheld for 500-level errors.
    pub fn with_details(mut self, details: String) -> Self {
        if self.code < 500 {
            self.details = Some(details);
        }
        self
    }
}
