use anyhow::{Context, Result};
use clap::Parser;
use dispatch_core::config::Configuration;
use dispatch_core::{build_store, FilterRegistry};
use dispatch_server::coordinator::Coordinator;
use dispatch_server::handler;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Coordinator binary. A config file path is required; `-v/-g/-p` override
/// the loaded configuration's echo/logging knobs, in the same spirit as
/// `original_source/server.py`'s argparse surface.
#[derive(Parser, Debug)]
#[command(name = "dispatch-server")]
struct Cli {
    /// Path to the JSON configuration document.
    config_file_path: PathBuf,

    /// Override `global.echo.mandatory.verbose`.
    #[arg(short = 'v', long = "verbose")]
    verbose: Option<bool>,

    /// Override `global.echo.mandatory.logging`.
    #[arg(short = 'g', long = "logging")]
    logging: Option<bool>,

    /// Override `global.echo.mandatory.loggingpath`.
    #[arg(short = 'p', long = "logging-path")]
    logging_path: Option<String>,

    /// Override `global.connection.address`.
    #[arg(long)]
    address: Option<String>,

    /// Override `global.connection.port`.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli.config_file_path)
        .with_context(|| format!("failed to load configuration from {:?}", cli.config_file_path))?;
    apply_overrides(&mut config, &cli);

    init_tracing(&config);

    let store = build_store(&config.server.persistence)
        .await
        .context("failed to construct the configured persistence store")?;
    let filter_registry = Arc::new(FilterRegistry::new());
    let coordinator = Arc::new(
        Coordinator::new(
            store,
            filter_registry,
            config.server.filtering.filter.clone(),
            config.global.feedback,
            config.server.loop_forever,
        )
        .context("failed to construct the process-wide filter roster")?,
    );

    let addr = format!(
        "{}:{}",
        config.global.connection.address, config.global.connection.port
    );
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "coordinator listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    let span = tracing::info_span!("connection", peer = %peer);
                    let _enter = span.enter();
                    handler::handle_connection(coordinator, stream, peer).await;
                });
            }
            _ = coordinator.wait_for_stop_accept() => {
                tracing::info!("shutdown requested, no longer accepting connections");
                break;
            }
        }
    }

    Ok(())
}

fn load_config(path: &PathBuf) -> Result<Configuration> {
    let text = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&text)?;
    Ok(serde_json::from_value(value)?)
}

fn apply_overrides(config: &mut Configuration, cli: &Cli) {
    if let Some(verbose) = cli.verbose {
        config.global.echo.mandatory.verbose = verbose;
    }
    if let Some(logging) = cli.logging {
        config.global.echo.mandatory.logging = logging;
    }
    if let Some(path) = &cli.logging_path {
        config.global.echo.mandatory.loggingpath = Some(path.clone());
    }
    if let Some(address) = &cli.address {
        config.global.connection.address = address.clone();
    }
    if let Some(port) = cli.port {
        config.global.connection.port = port;
    }
}

/// Initializes the global `tracing` subscriber from the loaded
/// configuration's echo knobs: `verbose=false` raises the default filter
/// to `warn`, `logging=true` layers on a non-blocking file appender
/// rooted at `loggingpath`.
fn init_tracing(config: &Configuration) {
    let default_level = if config.global.echo.mandatory.verbose {
        "info"
    } else {
        "warn"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if config.global.echo.mandatory.logging {
        let log_dir = config
            .global
            .echo
            .mandatory
            .loggingpath
            .clone()
            .unwrap_or_else(|| ".".to_string());
        let file_appender = tracing_appender::rolling::daily(log_dir, "dispatch-server.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leaked so the writer outlives `main`; the process owns it for its
        // entire lifetime.
        std::mem::forget(guard);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
            .init();
    } else {
        fmt().with_env_filter(env_filter).init();
    }
}
