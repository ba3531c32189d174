//! Compare-and-swap persistence of sandbox records.

use tracing::debug;

use crate::{
    cluster::{ClusterClient, ClusterError},
    sandbox::Sandbox,
    AirlockError, AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Read-mutate-write attempts before a version race is given up on
const STATE_UPDATE_RETRIES: u32 = 3;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Applies `mutate` to the current record of `sandbox_id` and writes it back, retrying the
/// read-mutate-write cycle on version conflicts.
///
/// The mutation runs against a freshly decoded record on every attempt, so a state check inside
/// it sees whatever a concurrent writer committed. A mutation error aborts without writing.
pub async fn update_sandbox<F>(
    cluster: &dyn ClusterClient,
    namespace: &str,
    sandbox_id: &str,
    mutate: F,
) -> AirlockResult<Sandbox>
where
    F: Fn(&mut Sandbox) -> AirlockResult<()>,
{
    for _ in 0..STATE_UPDATE_RETRIES {
        let pod = cluster.get_pod(namespace, sandbox_id).await?;
        let mut sandbox = Sandbox::from_pod(&pod)?;
        mutate(&mut sandbox)?;

        let mut updated = pod.clone();
        sandbox.apply_to_pod(&mut updated);

        match cluster.update_pod(namespace, &updated).await {
            Ok(written) => return Sandbox::from_pod(&written),
            Err(e) if e.is_conflict() => {
                debug!("version conflict on '{}', retrying", sandbox_id);
            }
            Err(e) => return Err(e),
        }
    }

    Err(AirlockError::Cluster(ClusterError::Conflict {
        kind: "Pod".to_string(),
        name: sandbox_id.to_string(),
    }))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
