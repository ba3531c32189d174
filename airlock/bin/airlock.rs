//! `airlock` is the sandbox lifecycle controller daemon and its operator CLI.
//!
//! # Overview
//!
//! The `serve` subcommand runs the controller: it keeps the warm pool full, serves the claim
//! and release API, and sweeps the cluster for expired or stranded sandboxes. The remaining
//! subcommands are operator utilities.
//!
//! ## Usage
//!
//! ```bash
//! airlock serve --config airlock.yaml
//! airlock status --endpoint http://127.0.0.1:3030
//! airlock keygen
//! airlock validate --config airlock.yaml
//! ```

use std::{fs, path::PathBuf, sync::Arc};

use airlock::{
    claim::{ClaimCoordinator, ClaimDelivery, HttpClaimDelivery, NoopDelivery, ThreadRegistry},
    cli::{AirlockArgs, AirlockSubcommand},
    cluster::{ClusterClient, HttpCluster, MemCluster},
    config::{AirlockConfig, ClusterMode, DEFAULT_CONFIG_FILE},
    lifecycle::LifecycleSupervisor,
    pool::WarmPool,
    provision::Provisioner,
    server::ControllerServer,
    token::{load_or_create_signing_key, TokenIssuer},
    utils::{airlock_home_path, SIGNING_KEY_FILENAME},
    AirlockError, AirlockResult,
};
use clap::{CommandFactory, Parser};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AirlockResult<()> {
    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = AirlockArgs::parse();
    match args.subcommand {
        Some(AirlockSubcommand::Serve { config }) => {
            serve(config).await?;
        }
        Some(AirlockSubcommand::Status { endpoint, api_key }) => {
            status(&endpoint, api_key.as_deref()).await?;
        }
        Some(AirlockSubcommand::Keygen { force }) => {
            keygen(force)?;
        }
        Some(AirlockSubcommand::Validate { config }) => {
            validate(config)?;
        }
        None => {
            AirlockArgs::command().print_help()?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Subcommands
//--------------------------------------------------------------------------------------------------

/// Runs the controller daemon until interrupted.
async fn serve(config_path: Option<PathBuf>) -> AirlockResult<()> {
    let config = load_config(config_path)?;

    let cluster: Arc<dyn ClusterClient> = match config.get_cluster().get_mode() {
        ClusterMode::InCluster => Arc::new(HttpCluster::in_cluster()?),
        ClusterMode::Url => {
            let api_url = config.get_cluster().get_api_url().as_deref().ok_or_else(|| {
                AirlockError::ConfigValidation(
                    "cluster.api_url is required when cluster.mode is 'url'".to_string(),
                )
            })?;
            Arc::new(HttpCluster::new(api_url)?)
        }
        ClusterMode::Memory => Arc::new(MemCluster::new()),
    };

    let issuer = Arc::new(TokenIssuer::from_key_file(
        airlock_home_path().join(SIGNING_KEY_FILENAME),
        config.get_sandbox().deadline(),
    )?);
    let provisioner = Arc::new(Provisioner::new(
        cluster.clone(),
        config.clone(),
        issuer.verify_key_hex(),
    )?);
    let pool = Arc::new(WarmPool::new(
        cluster.clone(),
        provisioner.clone(),
        config.clone(),
    ));
    let registry = Arc::new(ThreadRegistry::new());

    let delivery: Arc<dyn ClaimDelivery> = match config.get_cluster().get_mode() {
        ClusterMode::Memory => Arc::new(NoopDelivery),
        _ => Arc::new(HttpClaimDelivery::new(
            config.get_delivery(),
            *config.get_sandbox().get_control_port(),
        )?),
    };

    let coordinator = Arc::new(
        ClaimCoordinator::builder()
            .cluster(cluster.clone())
            .provisioner(provisioner.clone())
            .pool(pool.clone())
            .registry(registry.clone())
            .issuer(issuer.clone())
            .delivery(delivery)
            .config(config.clone())
            .build(),
    );
    let supervisor = Arc::new(
        LifecycleSupervisor::builder()
            .cluster(cluster.clone())
            .provisioner(provisioner)
            .registry(registry)
            .issuer(issuer)
            .pool(pool.clone())
            .config(config.clone())
            .build(),
    );

    // Rebuild the registry and finish interrupted teardowns before taking traffic.
    supervisor.sweep().await?;
    pool.ensure_capacity().await?;

    let (shutdown_tx, server_shutdown) = broadcast::channel(1);
    let pool_task = {
        let pool = pool.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { pool.run(shutdown).await })
    };
    let sweep_task = {
        let supervisor = supervisor.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { supervisor.run(shutdown).await })
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    let server = ControllerServer::builder()
        .coordinator(coordinator)
        .supervisor(supervisor)
        .cluster(cluster)
        .config(config)
        .build();
    server.serve(server_shutdown).await?;

    pool_task.await?;
    sweep_task.await?;

    Ok(())
}

/// Prints pool occupancy and the sandbox listing from a running controller.
async fn status(endpoint: &str, api_key: Option<&str>) -> AirlockResult<()> {
    let client = reqwest::Client::new();
    let endpoint = endpoint.trim_end_matches('/');

    let status: serde_json::Value = fetch(&client, &format!("{}/status", endpoint), api_key).await?;
    if let Some(tiers) = status["tiers"].as_array() {
        println!(
            "{:<16} {:>8} {:>10} {:>13} {:>7}",
            "TIER", "TARGET", "UNCLAIMED", "PROVISIONING", "BOUND"
        );
        for tier in tiers {
            println!(
                "{:<16} {:>8} {:>10} {:>13} {:>7}",
                tier["tier"].as_str().unwrap_or("?"),
                tier["target"],
                tier["unclaimed"],
                tier["provisioning"],
                tier["bound"]
            );
        }
    }
    println!("bound threads: {}", status["bound_threads"]);
    if let Some(stuck) = status["stuck_teardowns"].as_array() {
        if !stuck.is_empty() {
            println!("stuck teardowns: {}", serde_json::to_string(stuck)?);
        }
    }

    let listing: serde_json::Value =
        fetch(&client, &format!("{}/sandboxes", endpoint), api_key).await?;
    if let Some(sandboxes) = listing["sandboxes"].as_array() {
        if !sandboxes.is_empty() {
            println!();
            println!(
                "{:<14} {:<12} {:<14} {:<16} {:<20}",
                "SANDBOX", "TIER", "STATE", "TENANT", "THREAD"
            );
            for sandbox in sandboxes {
                println!(
                    "{:<14} {:<12} {:<14} {:<16} {:<20}",
                    sandbox["sandbox_id"].as_str().unwrap_or("?"),
                    sandbox["tier"].as_str().unwrap_or("?"),
                    sandbox["state"].as_str().unwrap_or("?"),
                    sandbox["tenant_id"].as_str().unwrap_or("-"),
                    sandbox["thread_id"].as_str().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

/// Generates the claim-token signing key under the airlock home directory.
fn keygen(force: bool) -> AirlockResult<()> {
    let path = airlock_home_path().join(SIGNING_KEY_FILENAME);
    if path.exists() {
        if !force {
            return Err(AirlockError::ValidationError(format!(
                "signing key already exists at '{}'; pass --force to replace it",
                path.display()
            )));
        }
        fs::remove_file(&path)?;
    }

    let signing_key = load_or_create_signing_key(&path)?;
    let issuer = TokenIssuer::new(&signing_key, chrono::Duration::zero())?;
    println!("signing key written to {}", path.display());
    println!("verification key (hex): {}", issuer.verify_key_hex());

    Ok(())
}

/// Validates a configuration file and reports every problem it has.
fn validate(config_path: Option<PathBuf>) -> AirlockResult<()> {
    let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    AirlockConfig::from_file(&path)?;
    println!("{} is valid", path.display());

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Loads the configuration: an explicit file, the default file if present, or defaults.
fn load_config(config_path: Option<PathBuf>) -> AirlockResult<AirlockConfig> {
    match config_path {
        Some(path) => AirlockConfig::from_file(path),
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                AirlockConfig::from_file(default_path)
            } else {
                let config = AirlockConfig::default();
                config.validate()?;
                Ok(config)
            }
        }
    }
}

/// Fetches a JSON document from the controller API.
async fn fetch(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
) -> AirlockResult<serde_json::Value> {
    let mut request = client.get(url);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(AirlockError::custom(anyhow::anyhow!(
            "controller returned {} for {}",
            response.status(),
            url
        )));
    }

    Ok(response.json().await?)
}
