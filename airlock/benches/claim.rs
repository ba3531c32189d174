//! If you are trying to run this benchmark, run `cargo bench --bench claim` from the `airlock`
//! subdirectory.

use std::{collections::HashMap, sync::Arc, time::Duration};

use airlock::{
    claim::{ClaimCoordinator, ClaimDelivery, NoopDelivery, ThreadRegistry},
    cluster::{ClusterClient, MemCluster},
    config::{AirlockConfig, PoolConfig, ProvisioningConfig, SandboxConfig, TierConfig},
    lifecycle::LifecycleSupervisor,
    pool::WarmPool,
    provision::Provisioner,
    sandbox::InvestigationOutcome,
    token::{generate_signing_key, TokenIssuer, TokenVerifier},
};
use axum::{routing::get, Router};
use criterion::{criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

//--------------------------------------------------------------------------------------------------
// Benchmark
//--------------------------------------------------------------------------------------------------

fn benchmark_claim_cycle(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let (coordinator, pool, _supervisor) = rt.block_on(async {
        stack().await.expect("controller stack")
    });

    c.bench_function("claim_release_cycle", |b| {
        b.iter(|| {
            rt.block_on(async {
                let grant = coordinator
                    .claim("acme", "incident-bench", "standard")
                    .await
                    .expect("claim");
                coordinator
                    .release(
                        grant.sandbox.get_sandbox_id(),
                        InvestigationOutcome::Completed,
                    )
                    .await
                    .expect("release");
                pool.ensure_capacity().await.expect("replenish");
            })
        })
    });
}

fn benchmark_sweep_pass(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let (_coordinator, _pool, supervisor) = rt.block_on(async {
        stack().await.expect("controller stack")
    });

    c.bench_function("sweep_quiet_namespace", |b| {
        b.iter(|| {
            rt.block_on(async {
                supervisor.sweep().await.expect("sweep");
            })
        })
    });
}

fn benchmark_token_mint_verify(c: &mut Criterion) {
    let issuer = TokenIssuer::new(
        &generate_signing_key().expect("signing key"),
        chrono::Duration::seconds(600),
    )
    .expect("issuer");
    let verifier = TokenVerifier::from_hex(&issuer.verify_key_hex()).expect("verifier");

    c.bench_function("token_mint_verify", |b| {
        b.iter(|| {
            let minted = issuer
                .mint("sbx-0abc1234", "acme", "incident-42")
                .expect("mint");
            verifier
                .verify(minted.get_token(), "sbx-0abc1234")
                .expect("verify");
        })
    });
}

//--------------------------------------------------------------------------------------------------
// Functions: Helper
//--------------------------------------------------------------------------------------------------

async fn stack() -> anyhow::Result<(ClaimCoordinator, Arc<WarmPool>, LifecycleSupervisor)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let app = Router::new().route("/health", get(|| async { "ok" }));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = AirlockConfig::builder()
        .pool(
            PoolConfig::builder()
                .tiers(HashMap::from([(
                    "standard".to_string(),
                    TierConfig::builder().target(2).build(),
                )]))
                .build(),
        )
        .sandbox(SandboxConfig::builder().control_port(port).build())
        .provisioning(
            ProvisioningConfig::builder()
                .timeout_secs(5)
                .poll_initial_ms(1)
                .poll_max_ms(5)
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
    let registry = Arc::new(ThreadRegistry::new());

    let coordinator = ClaimCoordinator::builder()
        .cluster(cluster.clone() as Arc<dyn ClusterClient>)
        .provisioner(provisioner.clone())
        .pool(pool.clone())
        .registry(registry.clone())
        .issuer(issuer.clone())
        .delivery(Arc::new(NoopDelivery) as Arc<dyn ClaimDelivery>)
        .config(config.clone())
        .build();
    let supervisor = LifecycleSupervisor::builder()
        .cluster(cluster as Arc<dyn ClusterClient>)
        .provisioner(provisioner)
        .registry(registry)
        .issuer(issuer)
        .pool(pool.clone())
        .config(config)
        .build();

    Ok((coordinator, pool, supervisor))
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10).measurement_time(Duration::from_secs(10));
    targets = benchmark_claim_cycle, benchmark_sweep_pass, benchmark_token_mint_verify
}
criterion_main!(benches);
