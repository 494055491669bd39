//! wanguard daemon
//!
//! Thin entry point around the controller crates:
//!
//! - `wanguard autorate --config wan1.toml` — run one WAN's shaper controller
//! - `wanguard steer --config steer.toml [--dry-run]` — run the steering
//!   controller for the primary WAN
//! - `wanguard check --config <file> [--steering]` — validate a config file
//!
//! All policy lives in `wanguard-control`; this binary only wires config
//! loading, logging, the PID lock, and the shutdown signal.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use wanguard_common::config::{AutorateConfig, RouterConfig, SteeringConfig, TransportKind};
use wanguard_control::autorate::AutorateController;
use wanguard_control::lockfile::PidLock;
use wanguard_control::observe::ObserverHooks;
use wanguard_control::steering::SteeringController;
use wanguard_router::{Failover, RestBackend, RetryPolicy, RouterBackend, SshBackend};

/// Adaptive bandwidth controller and traffic steerer for a CAKE-like router.
#[derive(Parser, Debug)]
#[command(name = "wanguard", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the autorate controller for one WAN.
    Autorate {
        /// Path to the WAN's TOML configuration.
        #[arg(long)]
        config: PathBuf,
    },
    /// Run the steering controller for the primary WAN.
    Steer {
        #[arg(long)]
        config: PathBuf,
        /// Log intended rule toggles without performing them.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Validate a configuration file and exit.
    Check {
        #[arg(long)]
        config: PathBuf,
        /// Treat the file as a steering configuration.
        #[arg(long, default_value_t = false)]
        steering: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Autorate { config } => run_autorate(&config).await,
        Command::Steer { config, dry_run } => run_steer(&config, dry_run).await,
        Command::Check { config, steering } => check(&config, steering),
    }
}

async fn run_autorate(path: &Path) -> anyhow::Result<()> {
    let cfg: AutorateConfig = load_config(path)?;
    cfg.validate()?;

    let _lock = PidLock::acquire(&cfg.paths.lock)?;
    let policy = RetryPolicy::autorate();
    tracing::info!(wan = %cfg.wan_name, config = %path.display(), "starting autorate");

    match cfg.router.transport {
        TransportKind::Rest => {
            let backend = rest_with_ssh_fallback(&cfg.router, policy)?;
            drive_autorate(cfg, backend).await
        }
        TransportKind::Ssh => {
            let backend = ssh_only(&cfg.router, policy);
            drive_autorate(cfg, backend).await
        }
    }
}

async fn drive_autorate<B: RouterBackend>(cfg: AutorateConfig, backend: B) -> anyhow::Result<()> {
    let mut controller = AutorateController::new(cfg, backend, ObserverHooks::tracing())?;
    controller.run(shutdown_signal()).await?;
    Ok(())
}

async fn run_steer(path: &Path, dry_run: bool) -> anyhow::Result<()> {
    let cfg: SteeringConfig = load_config(path)?;
    cfg.validate()?;

    let _lock = PidLock::acquire(&cfg.paths.lock)?;
    let policy = RetryPolicy::steering();
    tracing::info!(
        primary = %cfg.wan_name,
        config = %path.display(),
        dry_run,
        "starting steering"
    );

    match cfg.router.transport {
        TransportKind::Rest => {
            let backend = rest_with_ssh_fallback(&cfg.router, policy)?;
            drive_steer(cfg, backend, dry_run).await
        }
        TransportKind::Ssh => {
            let backend = ssh_only(&cfg.router, policy);
            drive_steer(cfg, backend, dry_run).await
        }
    }
}

async fn drive_steer<B: RouterBackend>(
    cfg: SteeringConfig,
    backend: B,
    dry_run: bool,
) -> anyhow::Result<()> {
    let mut controller = SteeringController::new(cfg, backend, ObserverHooks::tracing())?;
    controller.set_dry_run(dry_run);
    controller.run(shutdown_signal()).await?;
    Ok(())
}

fn check(path: &Path, steering: bool) -> anyhow::Result<()> {
    if steering {
        let cfg: SteeringConfig = load_config(path)?;
        cfg.validate()?;
        cfg.router.resolve_password()?;
        println!("{}: steering config ok (primary {})", path.display(), cfg.wan_name);
    } else {
        let cfg: AutorateConfig = load_config(path)?;
        cfg.validate()?;
        cfg.router.resolve_password()?;
        println!("{}: autorate config ok (wan {})", path.display(), cfg.wan_name);
    }
    Ok(())
}

fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn rest_with_ssh_fallback(
    router: &RouterConfig,
    policy: RetryPolicy,
) -> anyhow::Result<Failover<RestBackend, SshBackend>> {
    let password = router.resolve_password()?;
    let rest = RestBackend::new(router, password, policy.call_deadline)?;
    let ssh = SshBackend::new(router, policy.call_deadline);
    Ok(Failover::new(rest, ssh, policy))
}

fn ssh_only(router: &RouterConfig, policy: RetryPolicy) -> Failover<SshBackend, SshBackend> {
    Failover::single(SshBackend::new(router, policy.call_deadline), policy)
}

/// Ctrl-C flips the cooperative shutdown flag; the controllers finish their
/// cycle at the next safe persistence point and exit.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, shutting down");
            let _ = tx.send(true);
        }
    });
    rx
}
