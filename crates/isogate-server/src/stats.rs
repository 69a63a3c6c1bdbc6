//! Gateway-wide counters.

use isogate_core::VerificationError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const KINDS: usize = VerificationError::ALL.len();

/// Live counters, shared by every handler via `Arc<GatewayStats>`.
pub struct GatewayStats {
    started: Instant,
    accepted: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    tx_approved: AtomicU64,
    tx_declined: AtomicU64,
    accept_restarts: AtomicU64,
    errors: [AtomicU64; KINDS],
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            tx_approved: AtomicU64::new(0),
            tx_declined: AtomicU64::new(0),
            accept_restarts: AtomicU64::new(0),
            errors: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accept_restart(&self) {
        self.accept_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// A source message was read (`bytes` as received, framing excluded).
    pub fn record_inbound(&self, bytes: usize) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A message was written back to the source.
    pub fn record_outbound(&self, bytes: usize) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_transaction(&self, declined: bool) {
        if declined {
            self.tx_declined.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tx_approved.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self, kind: VerificationError) {
        self.errors[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active: usize, permanent_alive: usize) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            active: active as u64,
            permanent_alive: permanent_alive as u64,
            accepted: load(&self.accepted),
            rejected: load(&self.rejected),
            closed: load(&self.closed),
            messages_in: load(&self.messages_in),
            messages_out: load(&self.messages_out),
            bytes_in: load(&self.bytes_in),
            bytes_out: load(&self.bytes_out),
            tx_approved: load(&self.tx_approved),
            tx_declined: load(&self.tx_declined),
            accept_restarts: load(&self.accept_restarts),
            errors: std::array::from_fn(|i| load(&self.errors[i])),
        }
    }
}

/// Point-in-time copy of [`GatewayStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub active: u64,
    pub permanent_alive: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub closed: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub tx_approved: u64,
    pub tx_declined: u64,
    pub accept_restarts: u64,
    pub errors: [u64; KINDS],
}

impl StatsSnapshot {
    pub fn errors_of(&self, kind: VerificationError) -> u64 {
        self.errors[kind.index()]
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "uptime={}s active={} permanent_alive={} accepted={} rejected={} closed={}",
            self.uptime_secs,
            self.active,
            self.permanent_alive,
            self.accepted,
            self.rejected,
            self.closed
        )?;
        writeln!(
            f,
            "messages_in={} messages_out={} bytes_in={} bytes_out={}",
            self.messages_in, self.messages_out, self.bytes_in, self.bytes_out
        )?;
        writeln!(
            f,
            "tx_approved={} tx_declined={} accept_restarts={}",
            self.tx_approved, self.tx_declined, self.accept_restarts
        )?;
        write!(f, "errors:")?;
        for kind in VerificationError::ALL {
            let n = self.errors_of(kind);
            if n > 0 {
                write!(f, " {kind}={n}")?;
            }
        }
        Ok(())
    }
}
