//! natrouterd daemon entry point.
//!
//! Loads the daemon settings, boots the router against the Linux backends
//! and keeps handling network events until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use natrouterd::backend::{IptablesNat, LinuxNetStack, LinuxStackSettings};
use natrouterd::config_file::{DaemonConfig, DEFAULT_CONFIG_PATH};
use natrouterd::{BootOptions, BootOutcome, Router};
use router_common::FileStore;

/// Control plane of a dual-role Wi-Fi NAT router
#[derive(Parser, Debug)]
#[command(name = "natrouterd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Daemon configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Persistent store file (overrides the configuration file)
    #[arg(short = 's', long)]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long)]
    log_level: Option<String>,
}

fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = DaemonConfig::load_or_default(&args.config)?;
    if let Some(store) = args.store {
        config.store.path = store;
    }
    config.validate()?;

    info!(
        store = %config.store.path.display(),
        upstream = %config.interfaces.upstream,
        downstream = %config.interfaces.downstream,
        "Daemon configuration loaded"
    );

    let store = Arc::new(FileStore::new(config.store.path.clone()));
    let stack = Arc::new(LinuxNetStack::new(LinuxStackSettings::from_config(&config)));
    let nat = Arc::new(IptablesNat::new(config.interfaces.upstream.clone()));

    let options = BootOptions {
        namespace: config.store.namespace.clone(),
        join_timeout: config.join_timeout(),
    };
    let (router, outcome) = Router::boot(store, stack, nat, options)
        .await
        .context("router boot failed")?;

    match outcome {
        BootOutcome::Connected => info!("Upstream connected"),
        BootOutcome::TimedOut => info!("Upstream not connected yet, serving access point"),
        BootOutcome::AccessPointOnly => info!("Serving access point only"),
    }

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    router.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Settings file may name the level; read it before logging is up.
    let file_level = DaemonConfig::load_or_default(&args.config)
        .map(|c| c.logging.level)
        .unwrap_or_else(|_| "info".to_string());
    init_logging(args.log_level.as_deref().unwrap_or(&file_level));

    info!("--- Starting natrouterd ---");

    match run(args).await {
        Ok(()) => {
            info!("--- Stopping natrouterd ---");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
