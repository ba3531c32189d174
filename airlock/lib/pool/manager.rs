//! Warm pool replenishment and claim-side candidate selection.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::{
    cluster::ClusterClient,
    config::AirlockConfig,
    provision::Provisioner,
    sandbox::{managed_selector, unclaimed_selector, Sandbox, SandboxState},
    AirlockError, AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Keeps each tier stocked with claimable sandboxes and hands them out under contention.
///
/// The cluster API is the only ledger: capacity is always measured by listing pods, never from
/// a cached count, so a restarted controller converges on the same pool.
pub struct WarmPool {
    /// The cluster API.
    cluster: Arc<dyn ClusterClient>,

    /// The provisioner that creates and rolls back resource sets.
    provisioner: Arc<Provisioner>,

    /// The controller configuration.
    config: AirlockConfig,

    /// Wakes the maintenance loop early after a sandbox is taken.
    replenish: Notify,

    /// Serializes capacity checks so concurrent wakeups do not over-provision.
    ensure_lock: Mutex<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WarmPool {
    /// Creates a warm pool over the given cluster and provisioner.
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        provisioner: Arc<Provisioner>,
        config: AirlockConfig,
    ) -> Self {
        Self {
            cluster,
            provisioner,
            config,
            replenish: Notify::new(),
            ensure_lock: Mutex::new(()),
        }
    }

    /// Asks the maintenance loop to top the pool up before its next scheduled check.
    pub fn request_replenish(&self) {
        self.replenish.notify_one();
    }

    /// Tops every tier up to its configured target.
    ///
    /// Pods still provisioning count towards the target, so repeated calls never overshoot.
    /// Individual provisioning failures are logged and retried on the next pass.
    pub async fn ensure_capacity(&self) -> AirlockResult<()> {
        let _guard = self.ensure_lock.lock().await;

        for (tier, tier_config) in self.config.get_pool().get_tiers() {
            let target = *tier_config.get_target() as usize;
            let live = self.live_count(tier).await?;
            if live >= target {
                continue;
            }

            let shortfall = target - live;
            info!(
                "tier '{}' has {} of {} warm sandboxes, provisioning {}",
                tier, live, target, shortfall
            );

            let results =
                join_all((0..shortfall).map(|_| self.provisioner.provision(tier))).await;
            for result in results {
                if let Err(e) = result {
                    warn!("replenishing tier '{}': {}", tier, e);
                }
            }
        }

        Ok(())
    }

    /// Claims one unclaimed sandbox in the tier for the given tenant and thread.
    ///
    /// Candidates are tried in order; losing the version race on one moves to the next, never
    /// back to the same pod. Returns [`AirlockError::PoolExhausted`] when every candidate is
    /// taken or none exist.
    pub async fn take_one(
        &self,
        tier: &str,
        tenant_id: &str,
        thread_id: &str,
    ) -> AirlockResult<Sandbox> {
        let namespace = self.provisioner.namespace();
        let pods = self
            .cluster
            .list_pods(namespace, &unclaimed_selector(tier))
            .await?;

        for pod in pods {
            let mut sandbox = match Sandbox::from_pod(&pod) {
                Ok(sandbox) => sandbox,
                Err(e) => {
                    debug!("skipping malformed pod '{}': {}", pod.metadata.name, e);
                    continue;
                }
            };
            if let Err(e) = sandbox.begin_claim(tenant_id, thread_id) {
                debug!("skipping '{}': {}", pod.metadata.name, e);
                continue;
            }

            let mut updated = pod.clone();
            sandbox.apply_to_pod(&mut updated);

            match self.cluster.update_pod(namespace, &updated).await {
                Ok(written) => {
                    self.request_replenish();
                    return Sandbox::from_pod(&written);
                }
                Err(e) if e.is_conflict() => {
                    debug!(
                        "lost claim race on '{}', trying next candidate",
                        pod.metadata.name
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(AirlockError::PoolExhausted {
            tier: tier.to_string(),
        })
    }

    /// Runs the maintenance loop until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.get_pool().check_interval());
        info!(
            "warm pool maintaining {} tier(s)",
            self.config.get_pool().get_tiers().len()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.replenish.notified() => {}
                _ = shutdown.recv() => {
                    info!("warm pool shutting down");
                    return;
                }
            }

            if let Err(e) = self.ensure_capacity().await {
                error!("warm pool maintenance failed: {}", e);
            }
        }
    }

    async fn live_count(&self, tier: &str) -> AirlockResult<usize> {
        let pods = self
            .cluster
            .list_pods(self.provisioner.namespace(), &managed_selector())
            .await?;

        let mut live = 0;
        for pod in &pods {
            let sandbox = match Sandbox::from_pod(pod) {
                Ok(sandbox) => sandbox,
                Err(_) => continue,
            };
            if sandbox.get_tier().as_str() == tier
                && matches!(
                    sandbox.get_state(),
                    SandboxState::Provisioning | SandboxState::Unclaimed
                )
            {
                live += 1;
            }
        }

        Ok(live)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
