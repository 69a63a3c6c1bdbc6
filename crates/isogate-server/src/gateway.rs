//! Gateway orchestrator: owns the listener, the handler registry, the
//! permanent links and the monitor reporter for one run.

use crate::config::GatewayConfig;
use crate::events::{EventBus, GatewayEvent};
use crate::handler::{ConnectionHandler, ConnectionInfo, HandlerShared, HandlerStatus};
use crate::monitor::{self, MonitorSource};
use crate::permanent::{LinkStatus, PermanentConnectionManager, PermanentSettings};
use crate::policy::{AdmissionControl, ConnectionGuard};
use crate::stats::{GatewayStats, StatsSnapshot};
use crate::tls;
use isogate_core::{
    CryptoService, GatewayError, GatewayResult, NoCrypto, SoftwareCrypto, VerificationError,
};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Crypto backend for the configured key table.
pub fn crypto_backend(config: &GatewayConfig) -> GatewayResult<Arc<dyn CryptoService>> {
    if config.crypto_keys.is_empty() {
        return Ok(Arc::new(NoCrypto));
    }
    let crypto = SoftwareCrypto::from_hex_keys(
        config
            .crypto_keys
            .iter()
            .map(|(id, key)| (id.as_str(), key.as_str())),
    )?;
    info!(keys = crypto.len(), "software crypto backend loaded");
    Ok(Arc::new(crypto))
}

/// Bookkeeping for one live handler.
struct HandlerEntry {
    status: Arc<HandlerStatus>,
    /// Sending (or dropping) asks the handler to close its sockets.
    cancel_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Tasks and addresses that exist only between `start` and `stop`.
struct RunState {
    local_addr: SocketAddr,
    accept_cancel: mpsc::Sender<()>,
    accept_task: JoinHandle<()>,
    monitor: Option<(mpsc::Sender<()>, JoinHandle<()>)>,
}

struct GatewayInner {
    config: Arc<GatewayConfig>,
    crypto: Arc<dyn CryptoService>,
    stats: Arc<GatewayStats>,
    events: EventBus,
    permanent: Arc<PermanentConnectionManager>,
    admission: AdmissionControl,
    handlers: Mutex<HashMap<u64, HandlerEntry>>,
    next_id: AtomicU64,
    stopping: Arc<AtomicBool>,
    running: AtomicBool,
    run: Mutex<Option<RunState>>,
}

impl GatewayInner {
    fn snapshot(&self, permanent_alive: usize) -> StatsSnapshot {
        self.stats.snapshot(self.admission.active(), permanent_alive)
    }

    async fn connections(&self) -> Vec<ConnectionInfo> {
        let mut out: Vec<ConnectionInfo> = self
            .handlers
            .lock()
            .await
            .values()
            .map(|e| e.status.info())
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }
}

impl MonitorSource for GatewayInner {
    async fn report(&self) -> String {
        let links = self.permanent.status().await;
        let alive = links.iter().filter(|l| l.alive).count();
        let connections = self.connections().await;
        monitor::render_block(&self.snapshot(alive), &links, &connections)
    }
}

/// A configured ISO-8583 gateway.
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, crypto: Arc<dyn CryptoService>) -> Self {
        let permanent = Arc::new(PermanentConnectionManager::new(
            PermanentSettings::from_config(&config),
        ));
        let admission = AdmissionControl::new(config.max_connections);
        Self {
            inner: Arc::new(GatewayInner {
                config: Arc::new(config),
                crypto,
                stats: Arc::new(GatewayStats::new()),
                events: EventBus::new(),
                permanent,
                admission,
                handlers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                stopping: Arc::new(AtomicBool::new(false)),
                running: AtomicBool::new(false),
                run: Mutex::new(None),
            }),
        }
    }

    /// Bind the listener and start accepting. A second call returns the
    /// address of the running listener.
    pub async fn start(&self) -> GatewayResult<SocketAddr> {
        let inner = &self.inner;
        let mut run = inner.run.lock().await;
        if let Some(state) = run.as_ref() {
            return Ok(state.local_addr);
        }
        let config = &inner.config;

        let tls = match &config.tls {
            Some(paths) => Some(tls::load_acceptor(&paths.cert, &paths.key).map_err(|e| {
                GatewayError::new(VerificationError::SslError, e.to_string())
            })?),
            None => None,
        };

        let listener = TcpListener::bind(config.listen).await?;
        let local_addr = listener.local_addr()?;

        inner.stopping.store(false, Ordering::Release);
        if inner.permanent.is_enabled() {
            inner.permanent.start().await;
        }

        let shared = Arc::new(HandlerShared {
            config: config.clone(),
            crypto: inner.crypto.clone(),
            stats: inner.stats.clone(),
            events: inner.events.clone(),
            permanent: inner.permanent.clone(),
            tls,
            stopping: inner.stopping.clone(),
        });

        let (accept_cancel, cancel_rx) = mpsc::channel::<()>(1);
        let accept_task = tokio::spawn(supervise_accept(
            inner.clone(),
            shared,
            Arc::new(listener),
            cancel_rx,
        ));

        let monitor = config.monitor.clone().map(|monitor_config| {
            let (tx, rx) = mpsc::channel::<()>(1);
            let task = tokio::spawn(monitor::run(monitor_config, inner.clone(), rx));
            (tx, task)
        });

        *run = Some(RunState {
            local_addr,
            accept_cancel,
            accept_task,
            monitor,
        });
        inner.running.store(true, Ordering::Release);
        info!(
            addr = %local_addr,
            max_connections = inner.admission.max_connections(),
            transmission = ?config.transmission,
            tls = config.tls.is_some(),
            "gateway started"
        );
        Ok(local_addr)
    }

    /// Stop accepting, close every handler and permanent link. Safe to call
    /// when already stopped.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let mut run = inner.run.lock().await;
        let Some(state) = run.take() else {
            return;
        };
        inner.stopping.store(true, Ordering::Release);

        let _ = state.accept_cancel.send(()).await;
        let _ = state.accept_task.await;
        if let Some((tx, task)) = state.monitor {
            let _ = tx.send(()).await;
            let _ = task.await;
        }

        let entries: Vec<HandlerEntry> = inner
            .handlers
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        debug!(count = entries.len(), "cancelling handlers");
        for entry in &entries {
            let _ = entry.cancel_tx.try_send(());
        }
        for entry in entries {
            let _ = entry.task.await;
        }

        inner.permanent.stop().await;
        inner.running.store(false, Ordering::Release);
        info!("gateway stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.run.lock().await.as_ref().map(|s| s.local_addr)
    }

    pub async fn stats(&self) -> StatsSnapshot {
        let alive = self.inner.permanent.alive_count().await;
        self.inner.snapshot(alive)
    }

    pub async fn active_connections(&self) -> Vec<ConnectionInfo> {
        self.inner.connections().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events.subscribe()
    }

    pub async fn permanent_links(&self) -> Vec<LinkStatus> {
        self.inner.permanent.status().await
    }
}

/// Keep the accept loop alive: on error or panic wait `restart_cooldown`
/// and run it again on the same listener.
async fn supervise_accept(
    inner: Arc<GatewayInner>,
    shared: Arc<HandlerShared>,
    listener: Arc<TcpListener>,
    cancel_rx: mpsc::Receiver<()>,
) {
    let registry = inner.clone();
    supervise(inner, cancel_rx, move || {
        accept_loop(registry.clone(), shared.clone(), listener.clone())
    })
    .await;
}

async fn supervise<F, Fut>(
    inner: Arc<GatewayInner>,
    mut cancel_rx: mpsc::Receiver<()>,
    mut spawn_loop: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<()>> + Send + 'static,
{
    loop {
        let mut task = tokio::spawn(spawn_loop());
        tokio::select! {
            _ = cancel_rx.recv() => {
                task.abort();
                let _ = task.await;
                debug!("accept loop stopped");
                return;
            }
            result = &mut task => match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => error!(kind = %e.kind, error = %e.detail, "accept loop failed"),
                Err(join) if join.is_panic() => error!("accept loop panicked"),
                Err(_) => return,
            },
        }

        inner.stats.record_accept_restart();
        let cooldown = inner.config.restart_cooldown;
        tokio::select! {
            _ = cancel_rx.recv() => return,
            _ = tokio::time::sleep(cooldown) => {}
        }
        warn!(cooldown = ?cooldown, "restarting accept loop");
    }
}

async fn accept_loop(
    inner: Arc<GatewayInner>,
    shared: Arc<HandlerShared>,
    listener: Arc<TcpListener>,
) -> GatewayResult<()> {
    let backoff = inner.config.admission_backoff;
    loop {
        // Hold a slot before accepting so the ceiling is never exceeded.
        let guard = loop {
            if let Some(guard) = inner.admission.try_acquire() {
                break guard;
            }
            tokio::time::sleep(backoff).await;
        };

        let (stream, remote) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        spawn_handler(&inner, shared.clone(), stream, remote, guard).await;
    }
}

async fn spawn_handler(
    inner: &Arc<GatewayInner>,
    shared: Arc<HandlerShared>,
    stream: TcpStream,
    remote: SocketAddr,
    guard: ConnectionGuard,
) {
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let status = Arc::new(HandlerStatus::new(id, remote));
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
    let handler = ConnectionHandler::new(shared, status.clone());
    debug!(conn_id = id, %remote, "accepted");

    // Registered under the lock so the task's own removal always comes after.
    let mut handlers = inner.handlers.lock().await;
    let registry = inner.clone();
    let task = tokio::spawn(async move {
        let _guard = guard;
        handler.run(stream, cancel_rx).await;
        registry.handlers.lock().await.remove(&id);
    });
    handlers.insert(
        id,
        HandlerEntry {
            status,
            cancel_tx,
            task,
        },
    );
}
