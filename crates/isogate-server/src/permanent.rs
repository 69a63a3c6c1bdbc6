//! Always-on upstream links keyed by NII.
//!
//! Each live link is a task that owns the socket. Exchanges reach it over an
//! `mpsc` channel and are answered through a `oneshot`, so a link carries at
//! most one request/response at a time no matter how many handlers share it.
//! While idle the task watches the socket and marks the link dead on EOF.

use crate::config::GatewayConfig;
use isogate_core::{
    write_message, GatewayError, GatewayResult, LengthHeader, MessageReader, Nii, Side,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the manager needs from the gateway configuration.
#[derive(Debug, Clone)]
pub struct PermanentSettings {
    pub links: BTreeMap<Nii, String>,
    pub wildcard: bool,
    pub default_target: Option<String>,
    pub routes: BTreeMap<Nii, String>,
    pub length_header: LengthHeader,
    pub max_message_size: usize,
    pub connect_timeout: Duration,
    pub exchange_timeout: Duration,
}

impl PermanentSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            links: config.permanent.links.clone(),
            wildcard: config.permanent.wildcard(),
            default_target: config.destination_addr.clone(),
            routes: config.routes.clone(),
            length_header: config.length_header,
            max_message_size: config.max_message_size,
            connect_timeout: config.connect_timeout,
            exchange_timeout: config.destination_timeout,
        }
    }
}

/// Snapshot of one link for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub nii: Nii,
    pub target: String,
    pub alive: bool,
    pub reconnect_attempts: u64,
}

struct LinkRequest {
    payload: Vec<u8>,
    reply: oneshot::Sender<GatewayResult<Vec<u8>>>,
}

#[derive(Default)]
struct LinkState {
    requests: Option<mpsc::Sender<LinkRequest>>,
    task: Option<JoinHandle<()>>,
}

/// One permanent upstream connection.
pub struct PermanentLink {
    nii: Nii,
    target: String,
    settings: Arc<PermanentSettings>,
    alive: Arc<AtomicBool>,
    reconnect_attempts: AtomicU64,
    state: Mutex<LinkState>,
}

impl PermanentLink {
    fn new(nii: Nii, target: String, settings: Arc<PermanentSettings>) -> Self {
        Self {
            nii,
            target,
            settings,
            alive: Arc::new(AtomicBool::new(false)),
            reconnect_attempts: AtomicU64::new(0),
            state: Mutex::new(LinkState::default()),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            nii: self.nii,
            target: self.target.clone(),
            alive: self.is_alive(),
            reconnect_attempts: self.reconnect_attempts(),
        }
    }

    /// Dial the target and spawn the link task. Caller holds the state lock.
    async fn connect(&self, state: &mut LinkState) -> GatewayResult<()> {
        let stream = tokio::time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect(&self.target),
        )
        .await
        .map_err(|_| GatewayError::timeout(Side::Destination))?
        .map_err(|e| GatewayError::io(Side::Destination, e))?;
        let _ = stream.set_nodelay(true);

        if let Some(old) = state.task.take() {
            old.abort();
        }

        let (tx, rx) = mpsc::channel::<LinkRequest>(16);
        self.alive.store(true, Ordering::Release);
        let task = tokio::spawn(link_task(
            stream,
            rx,
            self.alive.clone(),
            self.settings.clone(),
            self.nii,
        ));
        state.requests = Some(tx);
        state.task = Some(task);
        info!(nii = %self.nii, target = %self.target, "permanent link up");
        Ok(())
    }

    /// Send one request and wait for its response.
    ///
    /// A dead link gets exactly one reconnect attempt first; if that fails
    /// the caller sees `DisconnectedFromDestination`.
    pub async fn exchange(&self, payload: Vec<u8>) -> GatewayResult<Vec<u8>> {
        let mut reconnected = false;
        let mut payload = payload;
        loop {
            let tx = self.sender(&mut reconnected).await?;
            let (reply_tx, reply_rx) = oneshot::channel();
            match tx
                .send(LinkRequest {
                    payload,
                    reply: reply_tx,
                })
                .await
            {
                Ok(()) => {
                    return reply_rx
                        .await
                        .map_err(|_| GatewayError::disconnected(Side::Destination))?;
                }
                // The link task went away after we picked up its sender.
                Err(mpsc::error::SendError(request)) => {
                    if reconnected {
                        return Err(GatewayError::disconnected(Side::Destination));
                    }
                    payload = request.payload;
                }
            }
        }
    }

    /// Request channel of a live link, reconnecting once per exchange.
    async fn sender(&self, reconnected: &mut bool) -> GatewayResult<mpsc::Sender<LinkRequest>> {
        let mut state = self.state.lock().await;
        let usable = self.is_alive() && state.requests.as_ref().is_some_and(|tx| !tx.is_closed());
        if !usable {
            if *reconnected {
                return Err(GatewayError::disconnected(Side::Destination));
            }
            *reconnected = true;
            self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.connect(&mut state).await {
                warn!(nii = %self.nii, target = %self.target, error = %e, "permanent link reconnect failed");
                let mut err = GatewayError::disconnected(Side::Destination);
                err.detail = format!("reconnect to {} failed: {}", self.target, e.detail);
                return Err(err);
            }
        }
        state
            .requests
            .clone()
            .ok_or_else(|| GatewayError::disconnected(Side::Destination))
    }

    /// Close the socket and wait for the link task to finish.
    async fn shutdown(&self) {
        let task = {
            let mut state = self.state.lock().await;
            state.requests = None;
            state.task.take()
        };
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.alive.store(false, Ordering::Release);
    }
}

async fn link_task(
    stream: TcpStream,
    mut rx: mpsc::Receiver<LinkRequest>,
    alive: Arc<AtomicBool>,
    settings: Arc<PermanentSettings>,
    nii: Nii,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = MessageReader::new(
        read_half,
        Side::Destination,
        settings.length_header,
        settings.max_message_size,
    );

    loop {
        tokio::select! {
            req = rx.recv() => {
                let Some(req) = req else {
                    debug!(%nii, "permanent link released");
                    break;
                };
                let result = round_trip(&mut reader, &mut write_half, &req.payload, &settings).await;
                if result.is_err() {
                    // Mark dead before the caller sees the error.
                    alive.store(false, Ordering::Release);
                    rx.close();
                    let _ = req.reply.send(result);
                    break;
                }
                let _ = req.reply.send(result);
            }
            msg = reader.next_message() => {
                match msg {
                    Ok(Some(frame)) => {
                        warn!(%nii, len = frame.len(), "unsolicited message on permanent link dropped");
                    }
                    Ok(None) => {
                        info!(%nii, "permanent link closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(%nii, error = %e, "permanent link read failed");
                        break;
                    }
                }
            }
        }
    }

    alive.store(false, Ordering::Release);
}

async fn round_trip(
    reader: &mut MessageReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    payload: &[u8],
    settings: &PermanentSettings,
) -> GatewayResult<Vec<u8>> {
    write_message(writer, Side::Destination, payload, settings.length_header).await?;
    match tokio::time::timeout(settings.exchange_timeout, reader.next_message()).await {
        Err(_) => Err(GatewayError::timeout(Side::Destination)),
        Ok(Ok(Some(response))) => Ok(response),
        Ok(Ok(None)) => Err(GatewayError::disconnected(Side::Destination)),
        Ok(Err(e)) => Err(e),
    }
}

/// Owns every [`PermanentLink`] of a gateway run.
pub struct PermanentConnectionManager {
    settings: Arc<PermanentSettings>,
    links: Mutex<HashMap<Nii, Arc<PermanentLink>>>,
    running: AtomicBool,
}

impl PermanentConnectionManager {
    pub fn new(settings: PermanentSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            links: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.settings.links.is_empty() || self.settings.wildcard
    }

    /// Create and connect the configured links. A failed initial connect
    /// leaves that link dead; the first exchange will try again.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut targets: Vec<(Nii, String)> = self
            .settings
            .links
            .iter()
            .map(|(nii, target)| (*nii, target.clone()))
            .collect();
        if targets.is_empty() && self.settings.wildcard {
            if let Some(target) = &self.settings.default_target {
                targets.push((Nii::ANY, target.clone()));
            }
        }

        let mut links = self.links.lock().await;
        for (nii, target) in targets {
            let link = Arc::new(PermanentLink::new(nii, target, self.settings.clone()));
            {
                let mut state = link.state.lock().await;
                if let Err(e) = link.connect(&mut state).await {
                    warn!(%nii, target = %link.target, error = %e, "permanent link initial connect failed");
                }
            }
            links.insert(nii, link);
        }
    }

    /// Close every link and clear the table. Safe to call twice.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Arc<PermanentLink>> = self.links.lock().await.drain().map(|(_, l)| l).collect();
        for link in drained {
            link.shutdown().await;
        }
        info!("permanent links stopped");
    }

    /// Whether traffic for `nii` goes over a permanent link.
    /// Traffic without an NII is looked up as [`Nii::ANY`].
    pub async fn serves(&self, nii: Nii) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        if self.settings.wildcard {
            return true;
        }
        self.links.lock().await.contains_key(&nii)
    }

    /// Relay one request over the link for `nii`.
    pub async fn exchange(&self, nii: Nii, payload: Vec<u8>) -> GatewayResult<Vec<u8>> {
        let link = self.link_for(nii).await?;
        link.exchange(payload).await
    }

    async fn link_for(&self, nii: Nii) -> GatewayResult<Arc<PermanentLink>> {
        if !self.running.load(Ordering::Acquire) {
            let mut err = GatewayError::disconnected(Side::Destination);
            err.detail = "permanent links are stopped".into();
            return Err(err);
        }
        let mut links = self.links.lock().await;
        if let Some(link) = links.get(&nii) {
            return Ok(link.clone());
        }
        if !self.settings.wildcard {
            return Err(GatewayError::config(format!("no permanent link for NII {nii}")));
        }
        let target = self
            .settings
            .routes
            .get(&nii)
            .or(self.settings.default_target.as_ref())
            .cloned()
            .ok_or_else(|| GatewayError::config("wildcard permanent mode without destination"))?;
        debug!(%nii, %target, "creating permanent link on first use");
        // Created dead; the first exchange connects it.
        let link = Arc::new(PermanentLink::new(nii, target, self.settings.clone()));
        links.insert(nii, link.clone());
        Ok(link)
    }

    pub async fn status(&self) -> Vec<LinkStatus> {
        let mut out: Vec<LinkStatus> = self
            .links
            .lock()
            .await
            .values()
            .map(|l| l.status())
            .collect();
        out.sort_by_key(|s| s.nii);
        out
    }

    pub async fn alive_count(&self) -> usize {
        self.links
            .lock()
            .await
            .values()
            .filter(|l| l.is_alive())
            .count()
    }

    pub async fn reconnect_attempts(&self, nii: Nii) -> Option<u64> {
        self.links
            .lock()
            .await
            .get(&nii)
            .map(|l| l.reconnect_attempts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isogate_core::VerificationError;
    use tokio::net::TcpListener;

    /// Upstream that answers `R` + request, closing each connection after
    /// `per_connection` answers.
    async fn upstream(per_connection: usize) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (r, mut w) = stream.into_split();
                    let mut reader =
                        MessageReader::new(r, Side::Source, LengthHeader::Binary2, 8192);
                    for _ in 0..per_connection {
                        let Ok(Some(req)) = reader.next_message().await else {
                            return;
                        };
                        let mut resp = b"R".to_vec();
                        resp.extend(req);
                        if write_message(&mut w, Side::Source, &resp, LengthHeader::Binary2)
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                });
            }
        });
        (addr, task)
    }

    fn settings(links: &[(Nii, &str)]) -> PermanentSettings {
        PermanentSettings {
            links: links.iter().map(|(n, t)| (*n, t.to_string())).collect(),
            wildcard: false,
            default_target: None,
            routes: BTreeMap::new(),
            length_header: LengthHeader::Binary2,
            max_message_size: 8192,
            connect_timeout: Duration::from_secs(2),
            exchange_timeout: Duration::from_secs(2),
        }
    }

    async fn wait_dead(mgr: &PermanentConnectionManager) {
        for _ in 0..200 {
            if mgr.alive_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("link never noticed the peer closing");
    }

    #[tokio::test]
    async fn table_links_relay() {
        let (addr, _srv) = upstream(usize::MAX).await;
        let mgr = PermanentConnectionManager::new(settings(&[(Nii(1), &addr)]));
        mgr.start().await;
        assert!(mgr.serves(Nii(1)).await);
        assert!(!mgr.serves(Nii(2)).await);
        assert_eq!(mgr.alive_count().await, 1);

        let resp = mgr.exchange(Nii(1), b"0200".to_vec()).await.unwrap();
        assert_eq!(resp, b"R0200");
        let resp = mgr.exchange(Nii(1), b"0220".to_vec()).await.unwrap();
        assert_eq!(resp, b"R0220");
        assert_eq!(mgr.reconnect_attempts(Nii(1)).await, Some(0));
        mgr.stop().await;
    }

    #[tokio::test]
    async fn killed_link_reconnects_exactly_once() {
        let (addr, _srv) = upstream(1).await;
        let mgr = PermanentConnectionManager::new(settings(&[(Nii(7), &addr)]));
        mgr.start().await;

        assert_eq!(mgr.exchange(Nii(7), b"a".to_vec()).await.unwrap(), b"Ra");
        wait_dead(&mgr).await;

        assert_eq!(mgr.exchange(Nii(7), b"b".to_vec()).await.unwrap(), b"Rb");
        assert_eq!(mgr.reconnect_attempts(Nii(7)).await, Some(1));
        mgr.stop().await;
    }

    #[tokio::test]
    async fn exchange_right_after_failed_round_trip_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _srv = tokio::spawn(async move {
            let mut first = true;
            while let Ok((stream, _)) = listener.accept().await {
                let drop_after_read = std::mem::take(&mut first);
                tokio::spawn(async move {
                    let (r, mut w) = stream.into_split();
                    let mut reader =
                        MessageReader::new(r, Side::Source, LengthHeader::Binary2, 8192);
                    while let Ok(Some(req)) = reader.next_message().await {
                        if drop_after_read {
                            return;
                        }
                        let mut resp = b"R".to_vec();
                        resp.extend(req);
                        if write_message(&mut w, Side::Source, &resp, LengthHeader::Binary2)
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                });
            }
        });

        let mgr = PermanentConnectionManager::new(settings(&[(Nii(4), &addr)]));
        mgr.start().await;
        assert_eq!(mgr.alive_count().await, 1);

        let err = mgr.exchange(Nii(4), b"a".to_vec()).await.unwrap_err();
        assert_eq!(err.kind, VerificationError::DisconnectedFromDestination);
        assert_eq!(mgr.exchange(Nii(4), b"b".to_vec()).await.unwrap(), b"Rb");
        assert_eq!(mgr.reconnect_attempts(Nii(4)).await, Some(1));
        mgr.stop().await;
    }

    #[tokio::test]
    async fn failed_reconnect_is_disconnected_from_destination() {
        let (addr, srv) = upstream(1).await;
        let mgr = PermanentConnectionManager::new(settings(&[(Nii(7), &addr)]));
        mgr.start().await;
        mgr.exchange(Nii(7), b"a".to_vec()).await.unwrap();
        srv.abort();
        let _ = srv.await;
        wait_dead(&mgr).await;

        let err = mgr.exchange(Nii(7), b"b".to_vec()).await.unwrap_err();
        assert_eq!(err.kind, VerificationError::DisconnectedFromDestination);
        assert_eq!(mgr.reconnect_attempts(Nii(7)).await, Some(1));
        mgr.stop().await;
    }

    #[tokio::test]
    async fn initial_connect_failure_leaves_link_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mgr = PermanentConnectionManager::new(settings(&[(Nii(3), &addr)]));
        mgr.start().await;
        let status = mgr.status().await;
        assert_eq!(status.len(), 1);
        assert!(!status[0].alive);
        mgr.stop().await;
    }

    #[tokio::test]
    async fn wildcard_creates_links_on_first_use() {
        let (addr, _srv) = upstream(usize::MAX).await;
        let mgr = PermanentConnectionManager::new(PermanentSettings {
            wildcard: true,
            default_target: Some(addr),
            ..settings(&[])
        });
        mgr.start().await;
        assert!(mgr.serves(Nii::ANY).await);
        assert!(mgr.serves(Nii(42)).await);
        assert_eq!(mgr.status().await.len(), 1);

        assert_eq!(mgr.exchange(Nii(42), b"x".to_vec()).await.unwrap(), b"Rx");
        let niis: Vec<Nii> = mgr.status().await.iter().map(|s| s.nii).collect();
        assert_eq!(niis, vec![Nii(42), Nii::ANY]);
        mgr.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_clears_table() {
        let (addr, _srv) = upstream(usize::MAX).await;
        let mgr = PermanentConnectionManager::new(settings(&[(Nii(1), &addr)]));
        mgr.start().await;
        mgr.start().await;
        assert_eq!(mgr.status().await.len(), 1);

        mgr.stop().await;
        mgr.stop().await;
        assert!(mgr.status().await.is_empty());
        assert!(!mgr.serves(Nii(1)).await);
        let err = mgr.exchange(Nii(1), b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.kind, VerificationError::DisconnectedFromDestination);
    }
}
