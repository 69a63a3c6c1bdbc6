//! isogate: ISO-8583 gateway.
//!
//! Loads `~/.isogate/config.toml` (overridable on the command line), starts
//! the gateway and runs until SIGINT/SIGTERM.

use clap::Parser;
use isogate_server::config::LogConfig;
use isogate_server::logging::LogSink;
use isogate_server::{crypto_backend, tls, Gateway, GatewayConfig, GatewayEvent, Overrides};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Command-line options for the gateway binary.
#[derive(Parser, Debug)]
#[command(name = "isogate", version, about = "ISO-8583 gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.isogate/config.toml")]
    config: String,

    /// Listen address, e.g. 0.0.0.0:5000
    #[arg(short, long)]
    listen: Option<String>,

    /// Maximum concurrent source connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Default destination host:port
    #[arg(long)]
    destination: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (cert, key) = if cli.generate_cert {
        match tls::generate_self_signed_cert(&tls::default_cert_dir()) {
            Ok((c, k)) => (
                Some(c.to_string_lossy().into_owned()),
                Some(k.to_string_lossy().into_owned()),
            ),
            Err(e) => {
                init_tracing(&cli.log_level, None);
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    let overrides = Overrides {
        listen: cli.listen.clone(),
        max_connections: cli.max_connections,
        destination: cli.destination.clone(),
        cert,
        key,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing(&cli.log_level, None);
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    init_tracing(&cli.log_level, Some(&config.log));
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        transmission = ?config.transmission,
        "starting isogate"
    );
    if cli.generate_cert {
        if let Some(paths) = &config.tls {
            info!(cert = %paths.cert.display(), key = %paths.key.display(), "generated self-signed certificate");
        }
    }

    let crypto = match crypto_backend(&config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load crypto keys");
            std::process::exit(1);
        }
    };

    let gateway = Gateway::new(config, crypto);
    let events = tokio::spawn(log_events(gateway.subscribe()));

    if let Err(e) = gateway.start().await {
        error!(error = %e, "failed to start gateway");
        std::process::exit(1);
    }

    shutdown_signal().await;
    info!("received shutdown signal");

    gateway.stop().await;
    events.abort();
    info!(stats = %gateway.stats().await, "isogate stopped");
}

/// Install the stdout layer and, when configured, the rotating file layer.
/// `RUST_LOG` wins over `--log-level`.
fn init_tracing(level: &str, log: Option<&LogConfig>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stdout = tracing_subscriber::fmt::layer().with_target(false);

    let mut file_error = None;
    let file_layer = log.and_then(|log| log.file.as_ref().map(|path| (log, path))).and_then(
        |(log, path)| match LogSink::with_file(path, log.max_bytes, log.keep) {
            Ok(sink) => Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(sink),
            ),
            Err(e) => {
                file_error = Some(format!("{}: {e}", path.display()));
                None
            }
        },
    );

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        warn!(error = %e, "cannot open log file, logging to stdout only");
    }
}

/// Mirror gateway events into the log at debug level.
async fn log_events(mut rx: tokio::sync::broadcast::Receiver<GatewayEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match rx.recv().await {
            Ok(event) => debug!(?event, "gateway event"),
            Err(RecvError::Lagged(n)) => debug!(skipped = n, "event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
