use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mawk_server::recovery::{install_panic_hook, panic_message};
use mawk_server::reload::ErrorKind;
use mawk_server::{ConfigWatcher, Orchestrator, PluginRegistry};

/// Configuration-driven mock HTTP server
#[derive(Parser, Debug)]
#[command(name = "mawk", author, version, about)]
struct Args {
    /// Configuration file (YAML, or JSON when it ends in .json)
    #[arg(short, long, env = "MAWK_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "MAWK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Do not reload when the configuration file changes
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    install_panic_hook();

    let plugins = Arc::new(PluginRegistry::new());
    let orchestrator = Orchestrator::start(args.config.clone(), plugins).await?;
    for (name, addr) in orchestrator.local_addrs() {
        info!(server = %name, %addr, "serving");
    }

    // The watcher stops when dropped, so it lives as long as main.
    let (_watcher, signals) = if args.no_watch {
        let (_tx, rx) = mpsc::channel(1);
        (None, rx)
    } else {
        let (watcher, rx) = ConfigWatcher::new(&args.config);
        match watcher.run() {
            Ok(watcher) => (Some(watcher), rx),
            Err(e) => {
                warn!(error = %e, "config watcher unavailable, hot reload disabled");
                (None, rx)
            }
        }
    };

    let errors = orchestrator.errors();
    let task = tokio::spawn(orchestrator.run(signals, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    }));

    if let Err(e) = task.await {
        if e.is_panic() {
            let message = panic_message(e.into_panic().as_ref());
            errors.record(ErrorKind::Panic, &message);
            error!(panic = %message, "server task panicked");
            std::process::exit(1);
        }
        return Err(e.into());
    }
    Ok(())
}
