//! Sandbox lifecycle states and the transitions allowed between them.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::AirlockError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a sandbox.
///
/// States advance in one direction only. A claimed sandbox never reverts to unclaimed; teardown
/// is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxState {
    /// Cluster objects are being created; the pod is not yet ready.
    Provisioning,

    /// The pod is ready and waiting in the warm pool.
    Unclaimed,

    /// A claim request won the compare-and-swap and is delivering the claim token.
    Claiming,

    /// The claim token was delivered; the sandbox is bound to one tenant and thread.
    Claimed,

    /// The investigation payload was submitted and is executing.
    Running,

    /// The investigation concluded successfully.
    Completed,

    /// The investigation or the claim handshake failed.
    Failed,

    /// The sandbox outlived its deadline and was forced down.
    TimedOut,

    /// Resource deletion is in progress.
    Terminating,

    /// All cluster objects are gone.
    Terminated,
}

/// The terminal outcome a caller reports when releasing a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvestigationOutcome {
    /// The investigation finished and produced its result.
    Completed,

    /// The investigation aborted with an error.
    Failed,

    /// The investigation ran past its deadline.
    TimedOut,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxState {
    /// Whether the lifecycle state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SandboxState) -> bool {
        use SandboxState::*;

        match (*self, next) {
            (Provisioning, Unclaimed) => true,
            (Provisioning, Failed) => true,
            (Unclaimed, Claiming) => true,
            (Claiming, Claimed) => true,
            (Claiming, Failed) => true,
            (Claimed, Running) => true,
            (Claimed, Completed | Failed | TimedOut) => true,
            (Running, Completed | Failed | TimedOut) => true,
            // Teardown is reachable from every state except terminated.
            (from, Terminating) => from != Terminated && from != Terminating,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }

    /// Whether the sandbox holds a live tenant/thread binding.
    pub fn is_bound(&self) -> bool {
        matches!(self, SandboxState::Claimed | SandboxState::Running)
    }

    /// Whether the sandbox can be taken from the warm pool.
    pub fn is_claimable(&self) -> bool {
        matches!(self, SandboxState::Unclaimed)
    }

    /// Whether the state is a recorded investigation outcome.
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            SandboxState::Completed | SandboxState::Failed | SandboxState::TimedOut
        )
    }

    /// Whether the lifecycle supervisor should be deleting this sandbox's resources.
    pub fn needs_teardown(&self) -> bool {
        self.is_outcome() || matches!(self, SandboxState::Terminating)
    }
}

impl InvestigationOutcome {
    /// The lifecycle state this outcome records on the sandbox.
    pub fn as_state(&self) -> SandboxState {
        match self {
            InvestigationOutcome::Completed => SandboxState::Completed,
            InvestigationOutcome::Failed => SandboxState::Failed,
            InvestigationOutcome::TimedOut => SandboxState::TimedOut,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxState::Provisioning => "provisioning",
            SandboxState::Unclaimed => "unclaimed",
            SandboxState::Claiming => "claiming",
            SandboxState::Claimed => "claimed",
            SandboxState::Running => "running",
            SandboxState::Completed => "completed",
            SandboxState::Failed => "failed",
            SandboxState::TimedOut => "timed-out",
            SandboxState::Terminating => "terminating",
            SandboxState::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SandboxState {
    type Err = AirlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(SandboxState::Provisioning),
            "unclaimed" => Ok(SandboxState::Unclaimed),
            "claiming" => Ok(SandboxState::Claiming),
            "claimed" => Ok(SandboxState::Claimed),
            "running" => Ok(SandboxState::Running),
            "completed" => Ok(SandboxState::Completed),
            "failed" => Ok(SandboxState::Failed),
            "timed-out" => Ok(SandboxState::TimedOut),
            "terminating" => Ok(SandboxState::Terminating),
            "terminated" => Ok(SandboxState::Terminated),
            _ => Err(AirlockError::ValidationError(format!(
                "unknown sandbox state '{}'",
                s
            ))),
        }
    }
}

impl fmt::Display for InvestigationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_state())
    }
}

impl FromStr for InvestigationOutcome {
    type Err = AirlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(InvestigationOutcome::Completed),
            "failed" => Ok(InvestigationOutcome::Failed),
            "timed-out" => Ok(InvestigationOutcome::TimedOut),
            _ => Err(AirlockError::ValidationError(format!(
                "unknown investigation outcome '{}'",
                s
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_forward_path() {
        use SandboxState::*;

        assert!(Provisioning.can_transition_to(Unclaimed));
        assert!(Unclaimed.can_transition_to(Claiming));
        assert!(Claiming.can_transition_to(Claimed));
        assert!(Claimed.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Terminated));
    }

    #[test]
    fn test_claimed_sandbox_never_reverts_to_unclaimed() {
        use SandboxState::*;

        for state in [Claiming, Claimed, Running, Completed, Failed, TimedOut] {
            assert!(
                !state.can_transition_to(Unclaimed),
                "{} must not revert to unclaimed",
                state
            );
        }
    }

    #[test]
    fn test_failed_claim_delivery_goes_to_failed() {
        assert!(SandboxState::Claiming.can_transition_to(SandboxState::Failed));
        assert!(!SandboxState::Claiming.can_transition_to(SandboxState::Running));
    }

    #[test]
    fn test_teardown_reachable_from_any_live_state() {
        use SandboxState::*;

        for state in [
            Provisioning,
            Unclaimed,
            Claiming,
            Claimed,
            Running,
            Completed,
            Failed,
            TimedOut,
        ] {
            assert!(
                state.can_transition_to(Terminating),
                "{} must allow teardown",
                state
            );
        }
        assert!(!Terminated.can_transition_to(Terminating));
    }

    #[test]
    fn test_display_from_str_round_trip() -> anyhow::Result<()> {
        use SandboxState::*;

        for state in [
            Provisioning,
            Unclaimed,
            Claiming,
            Claimed,
            Running,
            Completed,
            Failed,
            TimedOut,
            Terminating,
            Terminated,
        ] {
            assert_eq!(state.to_string().parse::<SandboxState>()?, state);
        }

        assert!("paused".parse::<SandboxState>().is_err());
        Ok(())
    }

    #[test]
    fn test_outcome_maps_to_state() {
        assert_eq!(
            InvestigationOutcome::Completed.as_state(),
            SandboxState::Completed
        );
        assert_eq!(
            InvestigationOutcome::TimedOut.as_state(),
            SandboxState::TimedOut
        );
        assert_eq!("timed-out".parse::<InvestigationOutcome>().ok(), Some(InvestigationOutcome::TimedOut));
    }
}
