//! The sandbox record and its encoding onto the pod that backs it.
//!
//! A sandbox has no store of its own. Its entire record lives on the pod object as labels and
//! annotations, so the cluster API is both the ledger and the serialization point for every
//! claim race. Decoding a pod yields a [`Sandbox`]; encoding one back is what a compare-and-swap
//! update writes.

use chrono::{DateTime, Utc};
use getset::Getters;

use crate::{
    cluster::Pod,
    sandbox::{InvestigationOutcome, SandboxState},
    AirlockError, AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Label marking a pod as managed by airlock. Always set to `"true"`.
pub const SANDBOX_LABEL: &str = "airlock.dev/sandbox";

/// Label carrying the sandbox lifecycle state
pub const STATE_LABEL: &str = "airlock.dev/state";

/// Label carrying the bound tenant id, present once claimed
pub const TENANT_LABEL: &str = "airlock.dev/tenant";

/// Label carrying the bound investigation thread id, present once claimed
pub const THREAD_LABEL: &str = "airlock.dev/thread";

/// Label carrying the warm-pool tier the sandbox belongs to
pub const TIER_LABEL: &str = "airlock.dev/tier";

/// Label on secondary resources naming the sandbox that owns them
pub const OWNER_LABEL: &str = "airlock.dev/owner";

/// Annotation recording when the claim was completed
pub const CLAIMED_AT_ANNOTATION: &str = "airlock.dev/claimed-at";

/// Annotation recording the hard deadline set at claim time
pub const DEADLINE_ANNOTATION: &str = "airlock.dev/deadline";

/// Annotation recording the id of the claim token bound to the sandbox
pub const TOKEN_ID_ANNOTATION: &str = "airlock.dev/token-id";

/// Annotation recording the terminal investigation outcome
pub const OUTCOME_ANNOTATION: &str = "airlock.dev/outcome";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One isolated execution unit, decoded from the pod that backs it.
///
/// `bound_tenant_id` and `bound_thread_id` are either both absent (unclaimed) or both present
/// (claimed); a claimed sandbox only ever proceeds toward termination.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Sandbox {
    /// The sandbox id. Doubles as the name of the pod backing it.
    sandbox_id: String,

    /// The namespace the sandbox's resources live in.
    namespace: String,

    /// The warm-pool tier the sandbox was provisioned for.
    tier: String,

    /// The lifecycle state.
    state: SandboxState,

    /// When the cluster recorded the pod.
    created_at: Option<DateTime<Utc>>,

    /// When the claim completed.
    claimed_at: Option<DateTime<Utc>>,

    /// The tenant the sandbox is bound to.
    bound_tenant_id: Option<String>,

    /// The investigation thread the sandbox is bound to.
    bound_thread_id: Option<String>,

    /// The hard deadline set at claim time.
    deadline: Option<DateTime<Utc>>,

    /// The id of the claim token delivered to the sandbox.
    token_id: Option<String>,

    /// The recorded terminal outcome, if any.
    outcome: Option<InvestigationOutcome>,

    /// The pod's optimistic-concurrency token at decode time.
    resource_version: Option<String>,

    /// The pod's assigned IP, once scheduled.
    pod_ip: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Sandbox {
    /// Decodes a sandbox record from a managed pod.
    ///
    /// Rejects pods that are not airlock-managed, carry no parseable state, or violate the
    /// both-or-neither binding invariant.
    pub fn from_pod(pod: &Pod) -> AirlockResult<Self> {
        let name = pod.metadata.name.clone();
        let labels = &pod.metadata.labels;
        let annotations = &pod.metadata.annotations;

        if labels.get(SANDBOX_LABEL).map(String::as_str) != Some("true") {
            return Err(AirlockError::ValidationError(format!(
                "pod '{}' is not managed by airlock",
                name
            )));
        }

        let state: SandboxState = labels
            .get(STATE_LABEL)
            .ok_or_else(|| {
                AirlockError::ValidationError(format!(
                    "pod '{}' is missing the '{}' label",
                    name, STATE_LABEL
                ))
            })?
            .parse()?;

        let bound_tenant_id = labels.get(TENANT_LABEL).cloned();
        let bound_thread_id = labels.get(THREAD_LABEL).cloned();
        if bound_tenant_id.is_some() != bound_thread_id.is_some() {
            return Err(AirlockError::ValidationError(format!(
                "pod '{}' carries a half binding: tenant and thread labels must be set together",
                name
            )));
        }

        let claimed_at = annotations
            .get(CLAIMED_AT_ANNOTATION)
            .map(|v| parse_timestamp(&name, CLAIMED_AT_ANNOTATION, v))
            .transpose()?;
        let deadline = annotations
            .get(DEADLINE_ANNOTATION)
            .map(|v| parse_timestamp(&name, DEADLINE_ANNOTATION, v))
            .transpose()?;
        let outcome = annotations
            .get(OUTCOME_ANNOTATION)
            .map(|v| v.parse::<InvestigationOutcome>())
            .transpose()?;

        Ok(Self {
            sandbox_id: name,
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            tier: labels
                .get(TIER_LABEL)
                .cloned()
                .unwrap_or_else(|| "default".to_string()),
            state,
            created_at: pod.metadata.creation_timestamp,
            claimed_at,
            bound_tenant_id,
            bound_thread_id,
            deadline,
            token_id: annotations.get(TOKEN_ID_ANNOTATION).cloned(),
            outcome,
            resource_version: pod.metadata.resource_version.clone(),
            pod_ip: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
        })
    }

    /// Writes the record back onto a pod's labels and annotations.
    ///
    /// Only sets keys; a claimed sandbox never sheds its binding, so nothing is ever removed.
    pub fn apply_to_pod(&self, pod: &mut Pod) {
        let labels = &mut pod.metadata.labels;
        labels.insert(SANDBOX_LABEL.to_string(), "true".to_string());
        labels.insert(STATE_LABEL.to_string(), self.state.to_string());
        labels.insert(TIER_LABEL.to_string(), self.tier.clone());
        if let Some(tenant) = &self.bound_tenant_id {
            labels.insert(TENANT_LABEL.to_string(), tenant.clone());
        }
        if let Some(thread) = &self.bound_thread_id {
            labels.insert(THREAD_LABEL.to_string(), thread.clone());
        }

        let annotations = &mut pod.metadata.annotations;
        if let Some(claimed_at) = &self.claimed_at {
            annotations.insert(CLAIMED_AT_ANNOTATION.to_string(), claimed_at.to_rfc3339());
        }
        if let Some(deadline) = &self.deadline {
            annotations.insert(DEADLINE_ANNOTATION.to_string(), deadline.to_rfc3339());
        }
        if let Some(token_id) = &self.token_id {
            annotations.insert(TOKEN_ID_ANNOTATION.to_string(), token_id.clone());
        }
        if let Some(outcome) = &self.outcome {
            annotations.insert(OUTCOME_ANNOTATION.to_string(), outcome.to_string());
        }
    }

    /// The name of the pod backing this sandbox.
    pub fn pod_name(&self) -> &str {
        &self.sandbox_id
    }

    /// The base URL of the sandbox's control endpoint, once the pod has an IP.
    pub fn control_endpoint(&self, port: u16) -> Option<String> {
        self.pod_ip
            .as_ref()
            .map(|ip| format!("http://{}:{}", ip, port))
    }

    /// The `(tenant, thread)` pair the sandbox is bound to, once claimed.
    pub fn binding(&self) -> Option<(&str, &str)> {
        match (&self.bound_tenant_id, &self.bound_thread_id) {
            (Some(tenant), Some(thread)) => Some((tenant.as_str(), thread.as_str())),
            _ => None,
        }
    }

    /// Whether the sandbox's hard deadline has passed.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|deadline| now > deadline).unwrap_or(false)
    }

    /// Moves the record to `next`, enforcing the lifecycle state machine.
    pub fn transition_to(&mut self, next: SandboxState) -> AirlockResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(AirlockError::InvalidStateTransition {
                sandbox_id: self.sandbox_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Reserves the sandbox for a claim: moves to `Claiming` and stamps the binding.
    ///
    /// This is the record half of the claim race; the compare-and-swap that writes it decides
    /// the winner.
    pub fn begin_claim(&mut self, tenant_id: &str, thread_id: &str) -> AirlockResult<()> {
        self.transition_to(SandboxState::Claiming)?;
        self.bound_tenant_id = Some(tenant_id.to_string());
        self.bound_thread_id = Some(thread_id.to_string());
        Ok(())
    }

    /// Completes the claim after token delivery: moves to `Claimed` and records the token id,
    /// claim time, and hard deadline.
    pub fn complete_claim(
        &mut self,
        token_id: &str,
        claimed_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> AirlockResult<()> {
        self.transition_to(SandboxState::Claimed)?;
        self.token_id = Some(token_id.to_string());
        self.claimed_at = Some(claimed_at);
        self.deadline = Some(deadline);
        Ok(())
    }

    /// Records the terminal outcome reported at release time.
    pub fn record_outcome(&mut self, outcome: InvestigationOutcome) -> AirlockResult<()> {
        self.transition_to(outcome.as_state())?;
        self.outcome = Some(outcome);
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The label selector matching every airlock-managed pod.
pub fn managed_selector() -> String {
    format!("{}=true", SANDBOX_LABEL)
}

/// The label selector matching unclaimed pods of one tier.
pub fn unclaimed_selector(tier: &str) -> String {
    format!(
        "{}=true,{}={},{}={}",
        SANDBOX_LABEL,
        STATE_LABEL,
        SandboxState::Unclaimed,
        TIER_LABEL,
        tier
    )
}

fn parse_timestamp(pod_name: &str, key: &str, value: &str) -> AirlockResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            AirlockError::ValidationError(format!(
                "pod '{}' has an unparseable '{}' annotation: {}",
                pod_name, key, e
            ))
        })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
