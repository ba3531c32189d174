//! Deadline enforcement, teardown, and drift repair.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::{
    claim::{ThreadBinding, ThreadRegistry},
    cluster::ClusterClient,
    config::AirlockConfig,
    pool::WarmPool,
    provision::Provisioner,
    sandbox::{
        managed_selector, update_sandbox, InvestigationOutcome, Sandbox, SandboxState, OWNER_LABEL,
    },
    token::TokenIssuer,
    AirlockError, AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What one supervisor sweep acted on.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    /// Bound sandboxes forced down past their deadline.
    pub expired: usize,

    /// Sandboxes reaped out of a stalled pre-claim state.
    pub reaped: usize,

    /// Resource sets fully deleted this pass.
    pub torn_down: usize,

    /// Teardowns at or past the attempt cap.
    pub stuck: usize,

    /// Ownerless config objects deleted.
    pub orphans: usize,
}

/// Walks the cluster on an interval and repairs whatever drifted.
///
/// The supervisor enforces deadlines, finishes teardowns other paths deferred, reaps sandboxes
/// stalled before their claim completed, deletes ownerless secondary resources, and rebuilds
/// the thread registry from the pods that actually exist. Running it once at startup is what
/// recovers a crashed controller.
#[derive(TypedBuilder)]
pub struct LifecycleSupervisor {
    /// The cluster API.
    cluster: Arc<dyn ClusterClient>,

    /// Deletes sandbox resource sets.
    provisioner: Arc<Provisioner>,

    /// The per-thread exclusivity registry to keep in step with the cluster.
    registry: Arc<ThreadRegistry>,

    /// Revokes the tokens of sandboxes forced down.
    issuer: Arc<TokenIssuer>,

    /// Nudged to backfill after teardowns free capacity.
    pool: Arc<WarmPool>,

    /// The controller configuration.
    config: AirlockConfig,

    /// Delete attempts per sandbox, carried across sweeps.
    #[builder(default)]
    teardown_attempts: Mutex<HashMap<String, u32>>,

    /// Sandboxes whose teardown is past the attempt cap.
    #[builder(default)]
    stuck: Mutex<HashSet<String>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LifecycleSupervisor {
    /// The namespace under supervision.
    pub fn namespace(&self) -> &str {
        self.config.get_cluster().get_namespace()
    }

    /// Sandboxes whose teardown is stuck, sorted by name.
    pub async fn stuck_sandboxes(&self) -> Vec<String> {
        let stuck = self.stuck.lock().await;
        let mut names: Vec<String> = stuck.iter().cloned().collect();
        names.sort();
        names
    }

    /// Runs the sweep loop until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.get_lifecycle().sweep_interval());
        info!(
            "lifecycle supervisor sweeping every {}s",
            self.config.get_lifecycle().get_sweep_interval_secs()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    info!("lifecycle supervisor shutting down");
                    return;
                }
            }

            match self.sweep().await {
                Ok(report) if report.acted() => {
                    info!(
                        "sweep: {} expired, {} reaped, {} torn down, {} stuck, {} orphans",
                        report.expired, report.reaped, report.torn_down, report.stuck,
                        report.orphans
                    );
                }
                Ok(_) => {}
                Err(e) => error!("sweep failed: {}", e),
            }
        }
    }

    /// Performs one full sweep of the namespace.
    pub async fn sweep(&self) -> AirlockResult<SweepReport> {
        let namespace = self.namespace();
        let now = Utc::now();
        let mut report = SweepReport::default();

        // Read before the listing; claims committing while it is in flight must survive the merge.
        let registry_cutoff = self.registry.generation();

        let pods = self.cluster.list_pods(namespace, &managed_selector()).await?;
        let mut sandboxes = Vec::new();
        for pod in &pods {
            match Sandbox::from_pod(pod) {
                Ok(sandbox) => sandboxes.push(sandbox),
                Err(e) => warn!("sweep skipping undecodable pod '{}': {}", pod.metadata.name, e),
            }
        }

        self.reconcile_registry(&sandboxes, registry_cutoff).await;

        let pod_names: HashSet<String> =
            pods.iter().map(|pod| pod.metadata.name.clone()).collect();

        for sandbox in &sandboxes {
            self.sweep_sandbox(sandbox, now, &mut report).await;
        }

        report.orphans = self.reap_orphan_config_maps(&pod_names, now).await?;

        if report.torn_down > 0 {
            self.pool.request_replenish();
        }
        Ok(report)
    }

    async fn sweep_sandbox(&self, sandbox: &Sandbox, now: DateTime<Utc>, report: &mut SweepReport) {
        let sandbox_id = sandbox.get_sandbox_id();
        let state = *sandbox.get_state();

        if state.is_bound() && sandbox.is_past_deadline(now) {
            warn!("sandbox '{}' passed its deadline, forcing it down", sandbox_id);
            self.expire(sandbox).await;
            report.expired += 1;
            self.teardown(sandbox_id, report).await;
            return;
        }

        if matches!(state, SandboxState::Provisioning | SandboxState::Claiming)
            && self.is_stale(sandbox, now)
        {
            warn!(
                "sandbox '{}' sat in {} past the stale window, reaping it",
                sandbox_id, state
            );
            if let Some((tenant, thread)) = sandbox.binding() {
                self.registry.release(tenant, thread, sandbox_id).await;
            }
            if let Err(e) = update_sandbox(&*self.cluster, self.namespace(), sandbox_id, |s| {
                s.transition_to(SandboxState::Failed)
            })
            .await
            {
                debug!("could not mark '{}' failed: {}", sandbox_id, e);
            }
            report.reaped += 1;
            self.teardown(sandbox_id, report).await;
            return;
        }

        if state.needs_teardown() {
            self.teardown(sandbox_id, report).await;
        }
    }

    /// Revokes, unbinds, and records the timeout of a sandbox past its deadline.
    async fn expire(&self, sandbox: &Sandbox) {
        let sandbox_id = sandbox.get_sandbox_id();

        if let Some(token_id) = sandbox.get_token_id().as_deref() {
            self.issuer.revoke(token_id).await;
        }
        if let Some((tenant, thread)) = sandbox.binding() {
            self.registry.release(tenant, thread, sandbox_id).await;
        }
        if let Err(e) = update_sandbox(&*self.cluster, self.namespace(), sandbox_id, |s| {
            s.record_outcome(InvestigationOutcome::TimedOut)
        })
        .await
        {
            warn!("could not record the timeout of '{}': {}", sandbox_id, e);
        }
    }

    async fn teardown(&self, sandbox_id: &str, report: &mut SweepReport) {
        // Mark the descent before deleting so a restarted controller resumes it.
        if let Err(e) = update_sandbox(&*self.cluster, self.namespace(), sandbox_id, |s| {
            if s.get_state().needs_teardown() && *s.get_state() != SandboxState::Terminating {
                s.transition_to(SandboxState::Terminating)
            } else {
                Ok(())
            }
        })
        .await
        {
            if !e.is_not_found() {
                debug!("could not mark '{}' terminating: {}", sandbox_id, e);
            }
        }

        match self.provisioner.delete_resource_set(sandbox_id).await {
            Ok(()) => {
                self.teardown_attempts.lock().await.remove(sandbox_id);
                if self.stuck.lock().await.remove(sandbox_id) {
                    info!("teardown of '{}' recovered", sandbox_id);
                }
                report.torn_down += 1;
            }
            Err(e) => {
                let mut attempts = self.teardown_attempts.lock().await;
                let count = attempts.entry(sandbox_id.to_string()).or_insert(0);
                *count += 1;
                let max = *self.config.get_lifecycle().get_teardown_max_attempts();

                if *count >= max {
                    let stuck = AirlockError::TeardownStuck {
                        sandbox_id: sandbox_id.to_string(),
                        attempts: *count,
                        reason: e.to_string(),
                    };
                    if self.stuck.lock().await.insert(sandbox_id.to_string()) {
                        error!("{}", stuck);
                    }
                    report.stuck += 1;
                } else {
                    warn!(
                        "teardown of '{}' failed (attempt {} of {}): {}",
                        sandbox_id, count, max, e
                    );
                }
            }
        }
    }

    fn is_stale(&self, sandbox: &Sandbox, now: DateTime<Utc>) -> bool {
        match sandbox.get_created_at() {
            Some(created_at) => now - *created_at > self.config.get_lifecycle().stale_pending(),
            None => false,
        }
    }

    async fn reconcile_registry(&self, sandboxes: &[Sandbox], cutoff: u64) {
        let bindings = sandboxes
            .iter()
            .filter(|s| {
                matches!(
                    s.get_state(),
                    SandboxState::Claiming | SandboxState::Claimed | SandboxState::Running
                )
            })
            .filter_map(|s| {
                s.binding().map(|(tenant, thread)| ThreadBinding {
                    tenant_id: tenant.to_string(),
                    thread_id: thread.to_string(),
                    sandbox_id: s.get_sandbox_id().clone(),
                })
            })
            .collect();

        self.registry.reconcile(bindings, cutoff).await;
    }

    async fn reap_orphan_config_maps(
        &self,
        pod_names: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> AirlockResult<usize> {
        let namespace = self.namespace();
        let config_maps = self
            .cluster
            .list_config_maps(namespace, &managed_selector())
            .await?;
        let grace = self.config.get_lifecycle().stale_pending();
        let mut reaped = 0;

        for config_map in &config_maps {
            let owner = match config_map.metadata.labels.get(OWNER_LABEL) {
                Some(owner) => owner,
                None => continue,
            };
            if pod_names.contains(owner) {
                continue;
            }

            // Leave just-created objects alone; their pod may still be on its way.
            let old_enough = config_map
                .metadata
                .creation_timestamp
                .map(|created| now - created > grace)
                .unwrap_or(false);
            if !old_enough {
                continue;
            }

            let name = &config_map.metadata.name;
            match self.cluster.delete_config_map(namespace, name).await {
                Ok(_) => {
                    info!("deleted orphaned config object '{}'", name);
                    reaped += 1;
                }
                Err(e) => warn!("could not delete orphaned config object '{}': {}", name, e),
            }
        }

        Ok(reaped)
    }
}

impl SweepReport {
    /// Whether the sweep changed anything.
    pub fn acted(&self) -> bool {
        self.expired + self.reaped + self.torn_down + self.stuck + self.orphans > 0
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
