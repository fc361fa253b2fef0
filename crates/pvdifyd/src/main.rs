//! pvdifyd: the Pvdify daemon.
//!
//! Single binary that assembles all Pvdify subsystems:
//! - State store (redb)
//! - Host actuators (podman, systemd, journald)
//! - Ingress rule file
//! - Reconciliation worker
//! - Health monitor
//! - REST API
//!
//! # Usage
//!
//! ```text
//! pvdifyd --config /etc/pvdify/pvdifyd.toml
//! pvdifyd --dev
//! ```

mod daemon;
mod logging;

use std::path::PathBuf;

use clap::Parser;

use pvdify_core::DaemonConfig;

#[derive(Parser)]
#[command(name = "pvdifyd", version, about = "Pvdify deployment daemon")]
struct Cli {
    /// Path to the daemon config file. A missing file means defaults.
    #[arg(long, default_value = "/etc/pvdify/pvdifyd.toml")]
    config: PathBuf,

    /// Development mode: debug logging in text format.
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(&cli.config)?;
    if cli.dev {
        config.dev = true;
    }
    logging::init(&config);

    daemon::run(config).await
}
