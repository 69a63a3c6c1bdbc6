//! Subscribe points for embedding code (GUIs, tests, audit).

use isogate_core::{Nii, VerificationError};
use std::net::SocketAddr;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

/// Something observable happened inside the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    ConnectionAccepted {
        id: u64,
        remote: SocketAddr,
    },
    ConnectionRejected {
        remote: SocketAddr,
        reason: String,
    },
    MessageRelayed {
        id: u64,
        nii: Option<Nii>,
        request_bytes: usize,
        response_bytes: usize,
        declined: bool,
    },
    HandlerError {
        id: u64,
        kind: VerificationError,
        detail: String,
    },
    ConnectionClosed {
        id: u64,
        remote: SocketAddr,
    },
}

/// Fan-out of [`GatewayEvent`]s. Publishing with no subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    pub fn publish(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}
