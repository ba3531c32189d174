//! `alrun` is the in-sandbox control endpoint binary.
//!
//! It runs as PID 1 of the sandbox container and serves the claim handoff, investigation
//! dispatch, and artifact retrieval API on the control port. It holds no credentials at
//! startup; the claim token arrives over the claim handoff and lives only in memory.
//!
//! ## Usage
//!
//! ```bash
//! alrun serve --sandbox-id sbx-9f2c41aa --control-port 8420 \
//!     --artifacts-dir /artifacts --verify-key-file /etc/airlock/token_verify_key
//! ```

use std::{fs, sync::Arc};

use airlock::{
    cli::{AlrunArgs, AlrunSubcommand},
    podapi::ControlEndpoint,
    token::TokenVerifier,
    AirlockResult,
};
use clap::Parser;
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

    let args = AlrunArgs::parse();
    match args.subcommand {
        AlrunSubcommand::Serve {
            sandbox_id,
            control_port,
            artifacts_dir,
            verify_key_file,
        } => {
            let verify_key_hex = fs::read_to_string(&verify_key_file)?;
            let verifier = TokenVerifier::from_hex(&verify_key_hex)?;
            let endpoint = Arc::new(ControlEndpoint::new(
                sandbox_id,
                control_port,
                verifier,
                &artifacts_dir,
            )?);

            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, shutting down");
                    let _ = shutdown_tx.send(());
                }
            });

            endpoint.serve(shutdown_rx).await?;
        }
    }

    Ok(())
}
