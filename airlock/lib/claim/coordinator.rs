//! The claim and release flows.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::{
    claim::{ClaimDelivery, ThreadRegistry},
    cluster::ClusterClient,
    config::AirlockConfig,
    pool::WarmPool,
    provision::Provisioner,
    sandbox::{update_sandbox, InvestigationOutcome, Sandbox, SandboxState},
    token::{MintedToken, TokenIssuer},
    utils::validate_safe_ident,
    AirlockError, AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a successful claim, handed back to the caller.
#[derive(Debug)]
pub struct ClaimGrant {
    /// The claimed sandbox.
    pub sandbox: Sandbox,

    /// The claim token minted for it.
    pub token: MintedToken,
}

/// Runs the claim contract end to end.
///
/// A claim validates its identifiers before touching the cluster, reserves the thread, takes a
/// warm sandbox through the compare-and-swap race, mints and delivers the claim token, and only
/// then records the binding. Every failure on that path unwinds completely: the token is
/// revoked, the sandbox discarded, the thread freed.
#[derive(TypedBuilder)]
pub struct ClaimCoordinator {
    /// The cluster API.
    cluster: Arc<dyn ClusterClient>,

    /// Creates and deletes sandbox resource sets.
    provisioner: Arc<Provisioner>,

    /// Hands out warm sandboxes.
    pool: Arc<WarmPool>,

    /// Enforces per-thread exclusivity.
    registry: Arc<ThreadRegistry>,

    /// Mints and revokes claim tokens.
    issuer: Arc<TokenIssuer>,

    /// Delivers claim tokens to sandboxes.
    delivery: Arc<dyn ClaimDelivery>,

    /// The controller configuration.
    config: AirlockConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ClaimCoordinator {
    /// The namespace sandboxes live in.
    pub fn namespace(&self) -> &str {
        self.config.get_cluster().get_namespace()
    }

    /// The per-thread exclusivity registry.
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    /// Claims a sandbox in `tier` for one investigation thread.
    ///
    /// At most one sandbox is ever bound per `(tenant_id, thread_id)`; a thread that already
    /// holds one gets [`AirlockError::ClaimConflict`] naming it. Identifiers are validated
    /// before any cluster call.
    pub async fn claim(
        &self,
        tenant_id: &str,
        thread_id: &str,
        tier: &str,
    ) -> AirlockResult<ClaimGrant> {
        validate_safe_ident("tenant_id", tenant_id)?;
        validate_safe_ident("thread_id", thread_id)?;
        validate_safe_ident("tier", tier)?;
        if !self.config.get_pool().get_tiers().contains_key(tier) {
            return Err(AirlockError::ValidationError(format!(
                "unknown pool tier '{}'",
                tier
            )));
        }

        self.registry.reserve(tenant_id, thread_id).await?;

        match self.claim_inner(tenant_id, thread_id, tier).await {
            Ok(grant) => {
                self.registry
                    .commit(tenant_id, thread_id, grant.sandbox.get_sandbox_id())
                    .await;
                info!(
                    "thread '{}' of tenant '{}' claimed sandbox '{}'",
                    thread_id,
                    tenant_id,
                    grant.sandbox.get_sandbox_id()
                );
                Ok(grant)
            }
            Err(e) => {
                self.registry.abort(tenant_id, thread_id).await;
                Err(e)
            }
        }
    }

    /// Releases a sandbox with its terminal outcome and tears its resources down.
    ///
    /// Releasing a sandbox that is already gone returns `Ok(None)`; one already on its way
    /// down has its teardown finished instead of failing. Releasing a sandbox that was never
    /// claimed is an error.
    pub async fn release(
        &self,
        sandbox_id: &str,
        outcome: InvestigationOutcome,
    ) -> AirlockResult<Option<Sandbox>> {
        validate_safe_ident("sandbox_id", sandbox_id)?;
        let namespace = self.namespace();

        let pod = match self.cluster.get_pod(namespace, sandbox_id).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                debug!("release of '{}': already gone", sandbox_id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let current = Sandbox::from_pod(&pod)?;
        let released = if current.get_state().needs_teardown() {
            current
        } else {
            let released = update_sandbox(&*self.cluster, namespace, sandbox_id, |s| {
                s.record_outcome(outcome)
            })
            .await?;
            info!("sandbox '{}' released as {}", sandbox_id, outcome);
            released
        };

        if let Some((tenant, thread)) = released.binding() {
            self.registry.release(tenant, thread, sandbox_id).await;
        }
        if let Some(token_id) = released.get_token_id().as_deref() {
            self.issuer.revoke(token_id).await;
        }

        if let Err(e) = self.provisioner.delete_resource_set(sandbox_id).await {
            warn!("teardown of '{}' deferred to the sweeper: {}", sandbox_id, e);
        }

        self.pool.request_replenish();
        Ok(Some(released))
    }

    async fn claim_inner(
        &self,
        tenant_id: &str,
        thread_id: &str,
        tier: &str,
    ) -> AirlockResult<ClaimGrant> {
        let sandbox = self.acquire_sandbox(tier, tenant_id, thread_id).await?;
        let sandbox_id = sandbox.get_sandbox_id().clone();

        let minted = self.issuer.mint(&sandbox_id, tenant_id, thread_id)?;

        if let Err(e) = self.delivery.deliver(&sandbox, &minted).await {
            warn!(
                "token delivery to '{}' failed, discarding it: {}",
                sandbox_id, e
            );
            self.issuer.revoke(minted.get_token_id()).await;
            self.discard(&sandbox_id).await;
            return Err(e);
        }

        // The token's expiry is the sandbox's hard deadline.
        let claimed_at = Utc::now();
        let deadline = *minted.get_expires_at();
        let bound = match update_sandbox(&*self.cluster, self.namespace(), &sandbox_id, |s| {
            s.complete_claim(minted.get_token_id(), claimed_at, deadline)
        })
        .await
        {
            Ok(bound) => bound,
            Err(e) => {
                warn!(
                    "could not record the claim of '{}', discarding it: {}",
                    sandbox_id, e
                );
                self.issuer.revoke(minted.get_token_id()).await;
                self.discard(&sandbox_id).await;
                return Err(e);
            }
        };

        Ok(ClaimGrant {
            sandbox: bound,
            token: minted,
        })
    }

    async fn acquire_sandbox(
        &self,
        tier: &str,
        tenant_id: &str,
        thread_id: &str,
    ) -> AirlockResult<Sandbox> {
        match self.pool.take_one(tier, tenant_id, thread_id).await {
            Ok(sandbox) => Ok(sandbox),
            Err(AirlockError::PoolExhausted { tier: exhausted }) => {
                if !*self.config.get_pool().get_allow_cold_start() {
                    return Err(AirlockError::PoolExhausted { tier: exhausted });
                }

                info!(
                    "tier '{}' exhausted, provisioning a cold sandbox for thread '{}'",
                    exhausted, thread_id
                );
                let fresh = self.provisioner.provision(&exhausted).await?;
                update_sandbox(&*self.cluster, self.namespace(), fresh.get_sandbox_id(), |s| {
                    s.begin_claim(tenant_id, thread_id)
                })
                .await
            }
            Err(e) => Err(e),
        }
    }

    /// Fails a half-claimed sandbox and tears it down. Never claimed again.
    async fn discard(&self, sandbox_id: &str) {
        if let Err(e) = update_sandbox(&*self.cluster, self.namespace(), sandbox_id, |s| {
            s.transition_to(SandboxState::Failed)
        })
        .await
        {
            warn!("could not mark '{}' failed: {}", sandbox_id, e);
        }
        if let Err(e) = self.provisioner.delete_resource_set(sandbox_id).await {
            error!(
                "teardown of discarded '{}' failed, leaving it to the sweeper: {}",
                sandbox_id, e
            );
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicBool, Ordering},
    };

    use async_trait::async_trait;
    use axum::{routing::get, Router};
    use tokio::sync::Mutex;

    use crate::{
        cluster::MemCluster,
        config::{PoolConfig, ProvisioningConfig, SandboxConfig, TierConfig},
        sandbox::managed_selector,
        token::generate_signing_key,
    };

    use super::*;

    #[derive(Default)]
    struct MockDelivery {
        fail_next: AtomicBool,
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClaimDelivery for MockDelivery {
        async fn deliver(&self, sandbox: &Sandbox, _token: &MintedToken) -> AirlockResult<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(AirlockError::ProvisioningFailed(
                    "delivery refused".to_string(),
                ));
            }
            self.delivered
                .lock()
                .await
                .push(sandbox.get_sandbox_id().clone());
            Ok(())
        }
    }

    async fn spawn_health_server() -> anyhow::Result<u16> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let app = Router::new().route("/health", get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Ok(port)
    }

    async fn test_stack(
        target: u32,
        allow_cold_start: bool,
    ) -> anyhow::Result<(Arc<MemCluster>, Arc<MockDelivery>, ClaimCoordinator)> {
        let port = spawn_health_server().await?;
        let config = AirlockConfig::builder()
            .pool(
                PoolConfig::builder()
                    .tiers(HashMap::from([(
                        "standard".to_string(),
                        TierConfig::builder().target(target).build(),
                    )]))
                    .allow_cold_start(allow_cold_start)
                    .build(),
            )
            .sandbox(SandboxConfig::builder().control_port(port).build())
            .provisioning(
                ProvisioningConfig::builder()
                    .timeout_secs(5)
                    .poll_initial_ms(10)
                    .poll_max_ms(50)
                    .build(),
            )
            .build();

        let cluster = Arc::new(MemCluster::new());
        let issuer = Arc::new(TokenIssuer::new(
            &generate_signing_key()?,
            config.get_sandbox().deadline(),
        )?);
        let provisioner = Arc::new(Provisioner::new(
            cluster.clone() as Arc<dyn ClusterClient>,
            config.clone(),
            issuer.verify_key_hex(),
        )?);
        let pool = Arc::new(WarmPool::new(
            cluster.clone() as Arc<dyn ClusterClient>,
            provisioner.clone(),
            config.clone(),
        ));
        pool.ensure_capacity().await?;

        let delivery = Arc::new(MockDelivery::default());
        let coordinator = ClaimCoordinator::builder()
            .cluster(cluster.clone() as Arc<dyn ClusterClient>)
            .provisioner(provisioner)
            .pool(pool)
            .registry(Arc::new(ThreadRegistry::new()))
            .issuer(issuer)
            .delivery(delivery.clone() as Arc<dyn ClaimDelivery>)
            .config(config)
            .build();

        Ok((cluster, delivery, coordinator))
    }

    #[test_log::test(tokio::test)]
    async fn test_claim_binds_delivers_and_stamps_deadline() -> anyhow::Result<()> {
        let (cluster, delivery, coordinator) = test_stack(2, false).await?;

        let grant = coordinator.claim("acme", "incident-42", "standard").await?;

        assert_eq!(*grant.sandbox.get_state(), SandboxState::Claimed);
        assert_eq!(grant.sandbox.binding(), Some(("acme", "incident-42")));
        assert_eq!(
            grant.sandbox.get_token_id().as_deref(),
            Some(grant.token.get_token_id().as_str())
        );
        assert_eq!(
            *grant.sandbox.get_deadline(),
            Some(*grant.token.get_expires_at()),
            "the token expiry is the deadline"
        );
        assert_eq!(
            delivery.delivered.lock().await.clone(),
            vec![grant.sandbox.get_sandbox_id().clone()]
        );

        let pod = cluster
            .get_pod("airlock", grant.sandbox.get_sandbox_id())
            .await?;
        let persisted = Sandbox::from_pod(&pod)?;
        assert_eq!(*persisted.get_state(), SandboxState::Claimed);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_second_claim_for_same_thread_conflicts() -> anyhow::Result<()> {
        let (_cluster, _delivery, coordinator) = test_stack(2, false).await?;

        let grant = coordinator.claim("acme", "incident-42", "standard").await?;
        let err = coordinator
            .claim("acme", "incident-42", "standard")
            .await
            .expect_err("a bound thread must not claim twice");

        assert!(matches!(
            err,
            AirlockError::ClaimConflict { sandbox_id, .. }
                if sandbox_id == *grant.sandbox.get_sandbox_id()
        ));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_bad_identifier_rejected_before_any_cluster_call() -> anyhow::Result<()> {
        let (cluster, _delivery, coordinator) = test_stack(1, false).await?;
        let ops_before = cluster.op_count();

        let err = coordinator
            .claim("acme corp", "incident-42", "standard")
            .await
            .expect_err("identifier with a space must be rejected");

        assert!(matches!(err, AirlockError::ValidationError(_)));
        assert_eq!(cluster.op_count(), ops_before);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_tier_rejected() -> anyhow::Result<()> {
        let (_cluster, _delivery, coordinator) = test_stack(1, false).await?;

        let err = coordinator
            .claim("acme", "incident-42", "premium")
            .await
            .expect_err("unknown tier must be rejected");

        assert!(matches!(err, AirlockError::ValidationError(e) if e.contains("premium")));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_delivery_failure_unwinds_completely() -> anyhow::Result<()> {
        let (cluster, delivery, coordinator) = test_stack(2, false).await?;

        delivery.fail_next.store(true, Ordering::SeqCst);
        let err = coordinator
            .claim("acme", "incident-42", "standard")
            .await
            .expect_err("failed delivery must fail the claim");
        assert!(matches!(err, AirlockError::ProvisioningFailed(_)));

        // The discarded sandbox is gone and the thread is free to claim the remaining one.
        let pods = cluster.list_pods("airlock", &managed_selector()).await?;
        assert_eq!(pods.len(), 1, "the half-claimed sandbox must be torn down");

        let grant = coordinator.claim("acme", "incident-42", "standard").await?;
        assert_eq!(*grant.sandbox.get_state(), SandboxState::Claimed);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_exhausted_pool_without_cold_start() -> anyhow::Result<()> {
        let (_cluster, _delivery, coordinator) = test_stack(0, false).await?;

        let err = coordinator
            .claim("acme", "incident-42", "standard")
            .await
            .expect_err("empty pool must surface exhaustion");
        assert!(matches!(
            err,
            AirlockError::PoolExhausted { tier } if tier == "standard"
        ));

        // The failed claim must not leave the thread reserved.
        let err = coordinator
            .claim("acme", "incident-42", "standard")
            .await
            .expect_err("still exhausted");
        assert!(matches!(err, AirlockError::PoolExhausted { .. }));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_cold_start_provisions_when_enabled() -> anyhow::Result<()> {
        let (cluster, _delivery, coordinator) = test_stack(0, true).await?;

        let grant = coordinator.claim("acme", "incident-42", "standard").await?;

        assert_eq!(*grant.sandbox.get_state(), SandboxState::Claimed);
        let pods = cluster.list_pods("airlock", &managed_selector()).await?;
        assert_eq!(pods.len(), 1);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_release_tears_down_and_frees_the_thread() -> anyhow::Result<()> {
        let (cluster, _delivery, coordinator) = test_stack(2, false).await?;

        let grant = coordinator.claim("acme", "incident-42", "standard").await?;
        let sandbox_id = grant.sandbox.get_sandbox_id().clone();

        let released = coordinator
            .release(&sandbox_id, InvestigationOutcome::Completed)
            .await?
            .ok_or_else(|| anyhow::anyhow!("sandbox should have existed"))?;
        assert_eq!(*released.get_state(), SandboxState::Completed);

        let err = cluster
            .get_pod("airlock", &sandbox_id)
            .await
            .expect_err("released sandbox must be deleted");
        assert!(err.is_not_found());

        // Releasing again is a quiet no-op and the thread can claim anew.
        assert!(coordinator
            .release(&sandbox_id, InvestigationOutcome::Completed)
            .await?
            .is_none());
        let again = coordinator.claim("acme", "incident-42", "standard").await?;
        assert_ne!(*again.sandbox.get_sandbox_id(), sandbox_id);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_release_of_unclaimed_sandbox_is_an_error() -> anyhow::Result<()> {
        let (cluster, _delivery, coordinator) = test_stack(1, false).await?;

        let pods = cluster.list_pods("airlock", &managed_selector()).await?;
        let unclaimed = &pods[0].metadata.name;

        let err = coordinator
            .release(unclaimed, InvestigationOutcome::Completed)
            .await
            .expect_err("an unclaimed sandbox has no outcome to record");
        assert!(matches!(err, AirlockError::InvalidStateTransition { .. }));
        Ok(())
    }
}
