use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use airlock::{
    claim::{ClaimCoordinator, ClaimDelivery, NoopDelivery, ThreadRegistry},
    cluster::{ClusterClient, MemCluster},
    config::{
        AirlockConfig, LifecycleConfig, PoolConfig, ProvisioningConfig, SandboxConfig, TierConfig,
    },
    lifecycle::LifecycleSupervisor,
    pool::WarmPool,
    provision::Provisioner,
    sandbox::{managed_selector, unclaimed_selector, InvestigationOutcome, SandboxState},
    token::{generate_signing_key, TokenIssuer},
    AirlockError,
};
use axum::{routing::get, Router};
use chrono::Duration;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The controller stack wired together the way the daemon wires it, over an in-memory cluster.
struct Stack {
    cluster: Arc<MemCluster>,
    pool: Arc<WarmPool>,
    registry: Arc<ThreadRegistry>,
    coordinator: Arc<ClaimCoordinator>,
    supervisor: LifecycleSupervisor,
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_concurrent_claims_grant_each_sandbox_at_most_once() -> anyhow::Result<()> {
    let stack = stack(3, 600, LifecycleConfig::default()).await?;

    let mut handles = Vec::new();
    for i in 0..6 {
        let coordinator = stack.coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .claim("acme", &format!("incident-{}", i), "standard")
                .await
        }));
    }

    let mut granted = HashSet::new();
    let mut exhausted = 0;
    for handle in handles {
        match handle.await? {
            Ok(grant) => {
                granted.insert(grant.sandbox.get_sandbox_id().clone());
            }
            Err(AirlockError::PoolExhausted { tier }) => {
                assert_eq!(tier, "standard");
                exhausted += 1;
            }
            Err(e) => anyhow::bail!("unexpected claim failure: {}", e),
        }
    }

    assert_eq!(granted.len(), 3, "every warm sandbox must be granted exactly once");
    assert_eq!(exhausted, 3, "the losers must see exhaustion, not a shared sandbox");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_claim_release_reclaim_journey() -> anyhow::Result<()> {
    let stack = stack(2, 600, LifecycleConfig::default()).await?;

    let grant = stack.coordinator.claim("acme", "incident-42", "standard").await?;
    let first_id = grant.sandbox.get_sandbox_id().clone();
    assert_eq!(*grant.sandbox.get_state(), SandboxState::Claimed);
    assert_eq!(
        stack.registry.held_sandbox("acme", "incident-42").await.as_deref(),
        Some(first_id.as_str())
    );

    let released = stack
        .coordinator
        .release(&first_id, InvestigationOutcome::Completed)
        .await?
        .ok_or_else(|| anyhow::anyhow!("the sandbox should have existed"))?;
    assert_eq!(*released.get_state(), SandboxState::Completed);
    assert!(stack
        .cluster
        .get_pod("airlock", &first_id)
        .await
        .expect_err("released sandbox must be deleted")
        .is_not_found());
    assert_eq!(stack.registry.held_sandbox("acme", "incident-42").await, None);

    // The pool backfills what the claim drained, and the freed thread claims anew.
    stack.pool.ensure_capacity().await?;
    let unclaimed = stack
        .cluster
        .list_pods("airlock", &unclaimed_selector("standard"))
        .await?;
    assert_eq!(unclaimed.len(), 2, "the pool must return to its target");

    let again = stack.coordinator.claim("acme", "incident-42", "standard").await?;
    assert_ne!(*again.sandbox.get_sandbox_id(), first_id);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_expired_claim_is_timed_out_and_the_thread_freed() -> anyhow::Result<()> {
    // Tokens minted already expired put every claim past its deadline immediately.
    let stack = stack(2, -5, LifecycleConfig::default()).await?;

    let grant = stack.coordinator.claim("acme", "incident-42", "standard").await?;
    let sandbox_id = grant.sandbox.get_sandbox_id().clone();
    assert!(grant.sandbox.is_past_deadline(chrono::Utc::now()));

    let report = stack.supervisor.sweep().await?;
    assert_eq!(report.expired, 1);
    assert_eq!(report.torn_down, 1);
    assert!(stack
        .cluster
        .get_pod("airlock", &sandbox_id)
        .await
        .expect_err("expired sandbox must be deleted")
        .is_not_found());

    // The forced timeout frees the thread for the remaining warm sandbox.
    assert_eq!(stack.registry.held_sandbox("acme", "incident-42").await, None);
    let again = stack.coordinator.claim("acme", "incident-42", "standard").await?;
    assert_ne!(*again.sandbox.get_sandbox_id(), sandbox_id);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_release_deferred_teardown_recovers_through_the_sweeper() -> anyhow::Result<()> {
    let lifecycle = LifecycleConfig::builder().teardown_max_attempts(1).build();
    let stack = stack(1, 600, lifecycle).await?;

    let grant = stack.coordinator.claim("acme", "incident-42", "standard").await?;
    let sandbox_id = grant.sandbox.get_sandbox_id().clone();

    // The outcome is recorded even though the resource deletion cannot go through.
    stack.cluster.set_fail_deletes(true).await;
    let released = stack
        .coordinator
        .release(&sandbox_id, InvestigationOutcome::Failed)
        .await?
        .ok_or_else(|| anyhow::anyhow!("the sandbox should have existed"))?;
    assert_eq!(*released.get_state(), SandboxState::Failed);
    stack.cluster.get_pod("airlock", &sandbox_id).await?;

    let report = stack.supervisor.sweep().await?;
    assert_eq!(report.stuck, 1);
    assert_eq!(
        stack.supervisor.stuck_sandboxes().await,
        vec![sandbox_id.clone()]
    );

    stack.cluster.set_fail_deletes(false).await;
    let report = stack.supervisor.sweep().await?;
    assert_eq!(report.torn_down, 1);
    assert!(stack.supervisor.stuck_sandboxes().await.is_empty());
    assert!(stack
        .cluster
        .get_pod("airlock", &sandbox_id)
        .await
        .expect_err("recovered teardown must delete the pod")
        .is_not_found());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_pool_heals_around_lost_pods_and_orphans() -> anyhow::Result<()> {
    let lifecycle = LifecycleConfig::builder().stale_pending_secs(0).build();
    let stack = stack(2, 600, lifecycle).await?;

    let pods = stack.cluster.list_pods("airlock", &managed_selector()).await?;
    assert_eq!(pods.len(), 2);

    // A pod vanishing out from under the controller leaves its config object orphaned.
    stack
        .cluster
        .delete_pod("airlock", &pods[0].metadata.name)
        .await?;

    let report = stack.supervisor.sweep().await?;
    assert_eq!(report.orphans, 1, "the ownerless config object must be reaped");

    stack.pool.ensure_capacity().await?;
    let unclaimed = stack
        .cluster
        .list_pods("airlock", &unclaimed_selector("standard"))
        .await?;
    assert_eq!(unclaimed.len(), 2, "the pool must be restocked to its target");
    let config_maps = stack
        .cluster
        .list_config_maps("airlock", &managed_selector())
        .await?;
    assert_eq!(config_maps.len(), 2, "each live sandbox keeps its config object");
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helper
//--------------------------------------------------------------------------------------------------

/// Serves a bare liveness endpoint standing in for sandbox control endpoints.
async fn spawn_health_server() -> anyhow::Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let app = Router::new().route("/health", get(|| async { "ok" }));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Ok(port)
}

/// Builds the full controller stack over an in-memory cluster, with the warm pool prefilled.
async fn stack(
    target: u32,
    token_ttl_secs: i64,
    lifecycle: LifecycleConfig,
) -> anyhow::Result<Stack> {
    let port = spawn_health_server().await?;
    let config = AirlockConfig::builder()
        .pool(
            PoolConfig::builder()
                .tiers(HashMap::from([(
                    "standard".to_string(),
                    TierConfig::builder().target(target).build(),
                )]))
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
        .lifecycle(lifecycle)
        .build();

    let cluster = Arc::new(MemCluster::new());
    let issuer = Arc::new(TokenIssuer::new(
        &generate_signing_key()?,
        Duration::seconds(token_ttl_secs),
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
    let registry = Arc::new(ThreadRegistry::new());

    let coordinator = Arc::new(
        ClaimCoordinator::builder()
            .cluster(cluster.clone() as Arc<dyn ClusterClient>)
            .provisioner(provisioner.clone())
            .pool(pool.clone())
            .registry(registry.clone())
            .issuer(issuer.clone())
            .delivery(Arc::new(NoopDelivery) as Arc<dyn ClaimDelivery>)
            .config(config.clone())
            .build(),
    );
    let supervisor = LifecycleSupervisor::builder()
        .cluster(cluster.clone() as Arc<dyn ClusterClient>)
        .provisioner(provisioner)
        .registry(registry.clone())
        .issuer(issuer)
        .pool(pool.clone())
        .config(config)
        .build();

    Ok(Stack {
        cluster,
        pool,
        registry,
        coordinator,
        supervisor,
    })
}
