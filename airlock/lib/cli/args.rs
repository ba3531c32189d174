use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cli::styles;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Airlock CLI - a sandbox lifecycle controller for incident investigations
#[derive(Debug, Parser)]
#[command(name = "airlock", author, about, version, styles=styles::styles())]
pub struct AirlockArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<AirlockSubcommand>,
}

/// Available subcommands for operating the controller
#[derive(Debug, Subcommand)]
pub enum AirlockSubcommand {
    /// Run the controller daemon
    Serve {
        /// Path to the configuration file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Print pool occupancy and sandboxes via a running controller
    Status {
        /// Base URL of the controller API
        #[arg(long, default_value = "http://127.0.0.1:3030")]
        endpoint: String,

        /// API key when the controller runs in secure mode
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Generate the claim-token signing key
    Keygen {
        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

/// Arguments for the alrun command
#[derive(Debug, Parser)]
#[command(name = "alrun", author, styles=styles::styles())]
pub struct AlrunArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: AlrunSubcommand,
}

/// Available subcommands for the in-pod runtime
#[derive(Debug, Subcommand)]
pub enum AlrunSubcommand {
    /// Serve the sandbox control endpoint
    Serve {
        /// The id of the sandbox this pod backs
        #[arg(long)]
        sandbox_id: String,

        /// The port the control endpoint listens on
        #[arg(long)]
        control_port: u16,

        /// The artifacts directory
        #[arg(long)]
        artifacts_dir: String,

        /// Path to the hex-encoded token verification key
        #[arg(long)]
        verify_key_file: PathBuf,
    },
}
