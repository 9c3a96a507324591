//! Command line interface.
//!
//! ```text
//! tailgate [--config <PATH>] [--env-file <PATH>] [--check-config]
//! ```
//!
//! Everything else is configured through `tailgate.toml` and environment
//! variables (see `tailgate_common::config`).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tailgate", version, about = "Overlay-network identity gateway")]
pub struct Cli {
    /// Config file with a [gateway] section.
    #[arg(long, value_name = "PATH", env = "TAILGATE_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Env file loaded before configuration (default: .env if present).
    #[arg(long, value_name = "PATH", env = "TAILGATE_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    /// Load and validate the configuration, print it, and exit.
    #[arg(long)]
    pub check_config: bool,
}
