//! Per-connection handler.
//!
//! One [`ConnectionHandler`] runs per accepted source connection. It checks
//! the peer against the access policy, optionally terminates TLS, then relays
//! messages to a destination chosen per message from the header NII. Every
//! failure goes through [`recovery::decide`], which says which sockets to drop.

pub mod recovery;
pub mod state;

use crate::config::{GatewayConfig, Transmission};
use crate::events::{EventBus, GatewayEvent};
use crate::permanent::PermanentConnectionManager;
use crate::stats::GatewayStats;
use isogate_core::{
    write_message, CryptoService, GatewayError, GatewayMessage, GatewayResult, MessageReader,
    Nii, Side, TlvFrame, VerificationError,
};
use recovery::{decide, RecoveryContext};
use state::{Endpoints, Phase, PhaseCell};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Any bidirectional byte stream a source can arrive on (plain TCP or TLS).
pub trait SourceStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> SourceStream for T {}

type BoxedStream = Box<dyn SourceStream>;

/// Everything a handler borrows from the gateway.
pub struct HandlerShared {
    pub config: Arc<GatewayConfig>,
    pub crypto: Arc<dyn CryptoService>,
    pub stats: Arc<GatewayStats>,
    pub events: EventBus,
    pub permanent: Arc<PermanentConnectionManager>,
    pub tls: Option<TlsAcceptor>,
    pub stopping: Arc<AtomicBool>,
}

/// Handler state visible to the registry and the monitor.
pub struct HandlerStatus {
    pub id: u64,
    pub remote: SocketAddr,
    created: Instant,
    phase: PhaseCell,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    destination: StdMutex<Option<String>>,
    last_error: StdMutex<Option<VerificationError>>,
}

impl HandlerStatus {
    pub fn new(id: u64, remote: SocketAddr) -> Self {
        Self {
            id,
            remote,
            created: Instant::now(),
            phase: PhaseCell::new(Phase::Accepted),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            destination: StdMutex::new(None),
            last_error: StdMutex::new(None),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    fn set_destination(&self, target: Option<String>) {
        *self.destination.lock().unwrap_or_else(|e| e.into_inner()) = target;
    }

    fn set_last_error(&self, kind: VerificationError) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(kind);
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            remote: self.remote,
            phase: self.phase.get(),
            destination: self
                .destination
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            age: self.created.elapsed(),
            last_error: *self.last_error.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

/// Snapshot of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub remote: SocketAddr,
    pub phase: Phase,
    pub destination: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub age: Duration,
    pub last_error: Option<VerificationError>,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conn={} remote={} phase={} dest={} in={} out={} age={}s last_error={}",
            self.id,
            self.remote,
            self.phase,
            self.destination.as_deref().unwrap_or("-"),
            self.bytes_in,
            self.bytes_out,
            self.age.as_secs(),
            self.last_error.map(|k| k.as_str()).unwrap_or("-"),
        )
    }
}

struct Source {
    reader: MessageReader<ReadHalf<BoxedStream>>,
    writer: WriteHalf<BoxedStream>,
}

enum Destination {
    Dialed {
        target: String,
        reader: MessageReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    },
    /// Handle on a shared link; dropping it only detaches this handler.
    Permanent(Nii),
}

impl Destination {
    fn serves(&self, route: &Route) -> bool {
        match (self, route) {
            (Destination::Dialed { target, .. }, Route::Dial(wanted)) => target == wanted,
            (Destination::Permanent(nii), Route::Permanent(wanted)) => nii == wanted,
            _ => false,
        }
    }
}

/// Where one message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Permanent(Nii),
    Dial(String),
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Permanent(nii) => write!(f, "permanent:{nii}"),
            Route::Dial(target) => f.write_str(target),
        }
    }
}

enum Pumped {
    FromSource(Vec<u8>),
    FromDestination(Vec<u8>),
}

/// Request context kept for responses that arrive asynchronously,
/// matched to responses in arrival order.
#[derive(Default)]
struct PendingRequest {
    header: Option<TlvFrame>,
    bytes: usize,
}

pub struct ConnectionHandler {
    shared: Arc<HandlerShared>,
    status: Arc<HandlerStatus>,
    endpoints: Endpoints<Source, Destination>,
    logged_on: bool,
    retries_used: u32,
    pending: VecDeque<PendingRequest>,
}

impl ConnectionHandler {
    pub fn new(shared: Arc<HandlerShared>, status: Arc<HandlerStatus>) -> Self {
        Self {
            shared,
            status,
            endpoints: Endpoints::NoSource,
            logged_on: false,
            retries_used: 0,
            pending: VecDeque::new(),
        }
    }

    fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.status.phase.get();
        if previous != phase {
            self.status.phase.set(phase);
            debug!(conn_id = self.status.id, remote = %self.status.remote, from = %previous, phase = %phase, "phase change");
        }
    }

    /// Drive the connection until it terminates or `cancel_rx` fires.
    pub async fn run<S>(mut self, stream: S, mut cancel_rx: mpsc::Receiver<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let id = self.status.id;
        let remote = self.status.remote;

        self.set_phase(Phase::Authenticating);
        let source = match self.authenticate(stream).await {
            Ok(source) => source,
            Err(err) => {
                warn!(conn_id = id, %remote, kind = %err.kind, error = %err.detail, "connection rejected");
                self.shared.stats.record_rejected();
                if err.kind == VerificationError::SslError {
                    self.shared.stats.record_error(err.kind);
                }
                self.status.set_last_error(err.kind);
                self.shared.events.publish(GatewayEvent::ConnectionRejected {
                    remote,
                    reason: err.to_string(),
                });
                self.set_phase(Phase::Terminated);
                return;
            }
        };

        self.shared.stats.record_accepted();
        self.shared
            .events
            .publish(GatewayEvent::ConnectionAccepted { id, remote });
        info!(conn_id = id, %remote, "connection accepted");
        self.endpoints.open(source);

        loop {
            self.set_phase(self.endpoints.phase());
            let result = tokio::select! {
                _ = cancel_rx.recv() => {
                    debug!(conn_id = id, "handler cancelled");
                    break;
                }
                result = self.step() => result,
            };
            if let Err(err) = result {
                if !self.recover(err) {
                    break;
                }
            }
        }

        self.set_phase(Phase::Closing);
        self.endpoints.close();
        self.status.set_destination(None);
        self.set_phase(Phase::Terminated);
        self.shared.stats.record_closed();
        self.shared
            .events
            .publish(GatewayEvent::ConnectionClosed { id, remote });
        info!(conn_id = id, %remote, "connection closed");
    }

    async fn authenticate<S>(&self, stream: S) -> GatewayResult<Source>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let config = self.config();
        if !config.access.is_allowed(self.status.remote.ip()) {
            return Err(GatewayError::config(format!(
                "{} is not allowed",
                self.status.remote.ip()
            ))
            .on(Side::Source));
        }

        let boxed: BoxedStream = match &self.shared.tls {
            Some(acceptor) => {
                let tls = tokio::time::timeout(config.connect_timeout, acceptor.accept(stream))
                    .await
                    .map_err(|_| {
                        GatewayError::new(VerificationError::SslError, "TLS handshake timed out")
                            .on(Side::Source)
                    })?
                    .map_err(|e| {
                        GatewayError::new(VerificationError::SslError, e.to_string())
                            .on(Side::Source)
                    })?;
                Box::new(tls)
            }
            None => Box::new(stream),
        };

        let (read_half, writer) = tokio::io::split(boxed);
        Ok(Source {
            reader: MessageReader::new(
                read_half,
                Side::Source,
                config.length_header,
                config.max_message_size,
            ),
            writer,
        })
    }

    /// Handle one unit of traffic: a full exchange in synchronous mode, or
    /// one message in either direction in asynchronous mode.
    async fn step(&mut self) -> GatewayResult<()> {
        let pumping = self.config().transmission == Transmission::Async
            && matches!(
                self.endpoints.both_mut(),
                Some((_, Destination::Dialed { .. }))
            );
        if pumping {
            match self.pump().await? {
                Pumped::FromSource(raw) => self.handle_source(raw).await,
                Pumped::FromDestination(raw) => {
                    let pending = self.pending.pop_front().unwrap_or_default();
                    self.deliver(raw, pending).await
                }
            }
        } else {
            let raw = self.read_source().await?;
            self.handle_source(raw).await
        }
    }

    async fn read_source(&mut self) -> GatewayResult<Vec<u8>> {
        let timeout = self.config().source_timeout;
        let source = self
            .endpoints
            .source_mut()
            .ok_or_else(|| GatewayError::disconnected(Side::Source))?;
        match tokio::time::timeout(timeout, source.reader.next_message()).await {
            Err(_) => Err(GatewayError::timeout(Side::Source)),
            Ok(Ok(Some(raw))) => Ok(raw),
            Ok(Ok(None)) => Err(GatewayError::disconnected(Side::Source)),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Wait for whichever side speaks first.
    async fn pump(&mut self) -> GatewayResult<Pumped> {
        let timeout = self.config().source_timeout;
        let Some((source, Destination::Dialed { reader, .. })) = self.endpoints.both_mut() else {
            return Err(GatewayError::disconnected(Side::Destination));
        };
        tokio::select! {
            from_source = tokio::time::timeout(timeout, source.reader.next_message()) => {
                match from_source {
                    Err(_) => Err(GatewayError::timeout(Side::Source)),
                    Ok(Ok(Some(raw))) => Ok(Pumped::FromSource(raw)),
                    Ok(Ok(None)) => Err(GatewayError::disconnected(Side::Source)),
                    Ok(Err(e)) => Err(e),
                }
            }
            from_destination = reader.next_message() => {
                match from_destination {
                    Ok(Some(raw)) => Ok(Pumped::FromDestination(raw)),
                    Ok(None) => Err(GatewayError::disconnected(Side::Destination)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn handle_source(&mut self, raw: Vec<u8>) -> GatewayResult<()> {
        self.shared.stats.record_inbound(raw.len());
        self.status
            .bytes_in
            .fetch_add(raw.len() as u64, Ordering::Relaxed);

        let msg = self
            .config()
            .source
            .decode(&raw, self.shared.crypto.as_ref())
            .map_err(|e| e.on(Side::Source))?;

        if self.config().require_logon && !self.logged_on && !msg.is_network_management() {
            return Err(GatewayError::new(
                VerificationError::NotSendLogonBefore,
                format!("MTI {} before logon", msg.mti().unwrap_or("????")),
            )
            .on(Side::Source));
        }

        let route = self.route(msg.nii()?).await?;
        self.ensure_destination(&route).await?;

        let outbound = self
            .config()
            .destination
            .encode(&msg, self.shared.crypto.as_ref())?;
        let pending = PendingRequest {
            header: msg.header,
            bytes: raw.len(),
        };

        match route {
            Route::Permanent(nii) => {
                let response = self.shared.permanent.exchange(nii, outbound).await?;
                self.deliver(response, pending).await
            }
            Route::Dial(_) => {
                let asynchronous = self.config().transmission == Transmission::Async;
                let (length_header, timeout) =
                    (self.config().length_header, self.config().destination_timeout);
                let Some((_, Destination::Dialed { reader, writer, .. })) =
                    self.endpoints.both_mut()
                else {
                    return Err(GatewayError::disconnected(Side::Destination));
                };
                write_message(writer, Side::Destination, &outbound, length_header).await?;
                if asynchronous {
                    self.pending.push_back(pending);
                    return Ok(());
                }
                let response = match tokio::time::timeout(timeout, reader.next_message()).await {
                    Err(_) => return Err(GatewayError::timeout(Side::Destination)),
                    Ok(Ok(Some(response))) => response,
                    Ok(Ok(None)) => return Err(GatewayError::disconnected(Side::Destination)),
                    Ok(Err(e)) => return Err(e),
                };
                self.deliver(response, pending).await
            }
        }
    }

    /// Send a destination response back to the source.
    async fn deliver(&mut self, raw: Vec<u8>, request: PendingRequest) -> GatewayResult<()> {
        let response = self
            .config()
            .destination
            .decode(&raw, self.shared.crypto.as_ref())
            .map_err(|e| e.on(Side::Destination))?;
        let declined = response.is_declined();
        let reply = GatewayMessage {
            header: response.header.or(request.header),
            body: response.body,
        };
        let nii = reply.nii().ok().flatten();
        let out = self
            .config()
            .source
            .encode(&reply, self.shared.crypto.as_ref())?;

        let length_header = self.config().length_header;
        let source = self
            .endpoints
            .source_mut()
            .ok_or_else(|| GatewayError::disconnected(Side::Source))?;
        write_message(&mut source.writer, Side::Source, &out, length_header).await?;

        self.shared.stats.record_outbound(out.len());
        self.shared.stats.record_transaction(declined);
        self.status
            .bytes_out
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        self.shared.events.publish(GatewayEvent::MessageRelayed {
            id: self.status.id,
            nii,
            request_bytes: request.bytes,
            response_bytes: out.len(),
            declined,
        });
        debug!(conn_id = self.status.id, nii = ?nii, declined, "exchange complete");
        self.logged_on = true;
        self.retries_used = 0;
        Ok(())
    }

    /// Permanent link for the NII if one serves it, else the route table,
    /// else the default destination.
    async fn route(&self, nii: Option<Nii>) -> GatewayResult<Route> {
        let key = nii.unwrap_or(Nii::ANY);
        if self.shared.permanent.serves(key).await {
            return Ok(Route::Permanent(key));
        }
        let config = self.config();
        if let Some(target) = nii.and_then(|n| config.routes.get(&n)) {
            return Ok(Route::Dial(target.clone()));
        }
        config
            .destination_addr
            .clone()
            .map(Route::Dial)
            .ok_or_else(|| {
                GatewayError::config(format!(
                    "no destination for NII {}",
                    nii.map(|n| n.to_string()).unwrap_or_else(|| "-".into())
                ))
            })
    }

    async fn ensure_destination(&mut self, route: &Route) -> GatewayResult<()> {
        if let Some((_, current)) = self.endpoints.both_mut() {
            if current.serves(route) {
                return Ok(());
            }
        }
        if self.endpoints.detach().is_some() {
            self.pending.clear();
            debug!(conn_id = self.status.id, new = %route, "switching destination");
        }

        let destination = match route {
            Route::Permanent(nii) => Destination::Permanent(*nii),
            Route::Dial(target) => self.dial(target).await?,
        };
        self.endpoints
            .attach(destination)
            .map_err(|_| GatewayError::disconnected(Side::Source))?;
        self.status.set_destination(Some(route.to_string()));
        self.set_phase(Phase::Relaying);
        Ok(())
    }

    async fn dial(&self, target: &str) -> GatewayResult<Destination> {
        let stream = tokio::time::timeout(self.config().connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| GatewayError::timeout(Side::Destination))?
            .map_err(|e| GatewayError::io(Side::Destination, e))?;
        let _ = stream.set_nodelay(true);
        debug!(conn_id = self.status.id, %target, "destination dialed");
        let (read_half, writer) = stream.into_split();
        Ok(Destination::Dialed {
            target: target.to_string(),
            reader: MessageReader::new(
                read_half,
                Side::Destination,
                self.config().length_header,
                self.config().max_message_size,
            ),
            writer,
        })
    }

    /// Apply the recovery policy. Returns `false` when the handler must stop.
    fn recover(&mut self, err: GatewayError) -> bool {
        let id = self.status.id;
        self.shared.stats.record_error(err.kind);
        self.status.set_last_error(err.kind);
        self.shared.events.publish(GatewayEvent::HandlerError {
            id,
            kind: err.kind,
            detail: err.detail.clone(),
        });

        // Liveness comes from the endpoints; only a peer close marks a side dead.
        let ctx = RecoveryContext {
            kind: err.kind,
            source_alive: self.endpoints.source_alive()
                && err.kind != VerificationError::DisconnectedFromSource,
            destination_alive: self.endpoints.destination_alive()
                && err.kind != VerificationError::DisconnectedFromDestination,
            action: self.config().action_when_disconnect,
            stopping: self.shared.stopping.load(Ordering::Acquire),
            synchronous: self.config().transmission == Transmission::Sync,
            retries_left: self
                .config()
                .max_exchange_retries
                .saturating_sub(self.retries_used),
        };
        let decision = decide(ctx);
        warn!(
            conn_id = id,
            remote = %self.status.remote,
            kind = %err.kind,
            side = ?err.side,
            error = %err.detail,
            close_source = decision.close_source,
            close_destination = decision.close_destination,
            retry = decision.retry,
            "exchange failed"
        );

        if decision.retry {
            self.retries_used += 1;
            return true;
        }
        if decision.close_source {
            return false;
        }
        if decision.close_destination && self.endpoints.detach().is_some() {
            self.status.set_destination(None);
            self.pending.clear();
        }
        true
    }
}
