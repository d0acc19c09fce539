//! hostd — the hostgrid daemon.
//!
//! Single binary that assembles the control plane:
//! - Instance store (redb)
//! - Orchestrator + provisioning queue consumer
//! - Health monitor
//! - Reconciler
//!
//! # Usage
//!
//! ```text
//! hostd default-config > hostgrid.toml
//! hostd gen-kek > /etc/hostgrid/kek
//! hostd run --config hostgrid.toml --simulate --demo 3
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hostgrid_core::HostgridConfig;
use hostgrid_crypto::SecretKey;
use tracing::info;

mod control_plane;

use control_plane::RunOptions;

#[derive(Parser)]
#[command(name = "hostd", about = "Hostgrid control plane daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until Ctrl-C.
    Run {
        /// Configuration file. Without one the development config is used.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state (overrides the config).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Use in-process simulated infrastructure backends.
        #[arg(long)]
        simulate: bool,

        /// Probe instance URLs over HTTP instead of asking the simulator.
        #[arg(long)]
        http_probes: bool,

        /// Create this many demo instances at startup.
        #[arg(long, default_value = "0")]
        demo: u32,
    },

    /// Print a freshly generated base64 key-encryption key.
    GenKek,

    /// Print the development configuration as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Command::Run {
            config,
            data_dir,
            simulate,
            http_probes,
            demo,
        } => {
            let mut config = match config {
                Some(path) => {
                    let config = HostgridConfig::from_file(&path)?;
                    info!(path = ?path, "configuration loaded");
                    config
                }
                None => {
                    info!("no --config given, using development configuration");
                    HostgridConfig::development()
                }
            };
            if let Some(dir) = data_dir {
                config.control_plane.data_dir = dir;
            }
            control_plane::run(
                config,
                RunOptions {
                    simulate,
                    http_probes,
                    demo,
                },
            )
            .await
        }
        Command::GenKek => {
            println!("{}", SecretKey::generate().to_base64().as_str());
            Ok(())
        }
        Command::DefaultConfig => {
            print!("{}", HostgridConfig::development().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => "info,hostd=debug,hostgrid=debug".parse()?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
