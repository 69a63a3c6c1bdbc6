//! Periodic status reports pushed to a TCP monitor endpoint.

pub mod backlog;

use crate::config::MonitorConfig;
use crate::handler::ConnectionInfo;
use crate::permanent::LinkStatus;
use crate::stats::StatsSnapshot;
use backlog::Backlog;
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const BLOCK_BEGIN: &str = "#ISOGATE-MONITOR-BEGIN";
pub const BLOCK_END: &str = "#ISOGATE-MONITOR-END";

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can describe the gateway's current state.
pub trait MonitorSource: Send + Sync + 'static {
    fn report(&self) -> impl Future<Output = String> + Send;
}

/// Render one monitor block.
pub fn render_block(
    snapshot: &StatsSnapshot,
    links: &[LinkStatus],
    connections: &[ConnectionInfo],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{BLOCK_BEGIN}");
    let _ = writeln!(out, "{snapshot}");
    for link in links {
        let _ = writeln!(
            out,
            "link nii={} target={} alive={} reconnects={}",
            link.nii, link.target, link.alive, link.reconnect_attempts
        );
    }
    for conn in connections {
        let _ = writeln!(out, "{conn}");
    }
    let _ = writeln!(out, "{BLOCK_END}");
    out
}

/// Reconnect delay: 1 s doubling to 60 s.
#[derive(Debug)]
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: MIN_BACKOFF,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.current = MIN_BACKOFF;
    }
}

/// Report every `config.interval` until `cancel_rx` fires.
pub async fn run<S: MonitorSource>(
    config: MonitorConfig,
    source: Arc<S>,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    let mut backlog = Backlog::new(config.backlog_bytes);
    let mut conn: Option<TcpStream> = None;
    let mut backoff = Backoff::new();
    let mut next_attempt = Instant::now();
    let mut ticker = tokio::time::interval(config.interval);
    info!(address = %config.address, interval = ?config.interval, "monitor reporter started");

    loop {
        tokio::select! {
            _ = cancel_rx.recv() => break,
            _ = ticker.tick() => {}
        }

        let block = source.report().await;
        backlog.push(block.as_bytes());

        if conn.is_none() && Instant::now() >= next_attempt {
            let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&config.address));
            let connected = tokio::select! {
                _ = cancel_rx.recv() => break,
                connected = connect => connected,
            };
            match connected {
                Ok(Ok(stream)) => {
                    info!(address = %config.address, "monitor connected");
                    backoff.reset();
                    conn = Some(stream);
                }
                Ok(Err(e)) => {
                    let delay = backoff.next_delay();
                    debug!(address = %config.address, error = %e, retry_in = ?delay, "monitor unreachable");
                    next_attempt = Instant::now() + delay;
                }
                Err(_) => {
                    let delay = backoff.next_delay();
                    debug!(address = %config.address, retry_in = ?delay, "monitor connect timed out");
                    next_attempt = Instant::now() + delay;
                }
            }
        }

        if let Some(stream) = conn.as_mut() {
            let pending = backlog.peek();
            let write = tokio::time::timeout(WRITE_TIMEOUT, stream.write_all(&pending));
            let outcome = tokio::select! {
                _ = cancel_rx.recv() => break,
                outcome = write => outcome,
            };
            let failure = match outcome {
                Ok(Ok(())) => {
                    backlog.clear();
                    None
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("endpoint stopped reading".to_string()),
            };
            if let Some(error) = failure {
                let delay = backoff.next_delay();
                warn!(address = %config.address, %error, buffered = backlog.len(), retry_in = ?delay, "monitor write failed");
                conn = None;
                next_attempt = Instant::now() + delay;
            }
        }
    }

    if backlog.dropped() > 0 {
        debug!(dropped = backlog.dropped(), "monitor backlog overflowed");
    }
    info!("monitor reporter stopped");
}
