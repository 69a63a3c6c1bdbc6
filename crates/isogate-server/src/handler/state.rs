//! Handler lifecycle phase and endpoint ownership.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Where a connection handler is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Accepted = 0,
    Authenticating = 1,
    /// Source and destination both open.
    Relaying = 2,
    /// Only the source is open; the next source message dials a destination.
    AwaitingDestination = 3,
    Closing = 4,
    Terminated = 5,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Accepted,
            1 => Phase::Authenticating,
            2 => Phase::Relaying,
            3 => Phase::AwaitingDestination,
            4 => Phase::Closing,
            _ => Phase::Terminated,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Accepted => "accepted",
            Phase::Authenticating => "authenticating",
            Phase::Relaying => "relaying",
            Phase::AwaitingDestination => "awaiting-destination",
            Phase::Closing => "closing",
            Phase::Terminated => "terminated",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase readable from other tasks (registry, monitor).
#[derive(Debug)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn new(phase: Phase) -> Self {
        Self(AtomicU8::new(phase as u8))
    }

    pub fn get(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

/// The sockets a handler currently owns.
///
/// `S` is the source connection, `D` the destination (a dialed socket or a
/// handle on a shared permanent link). A destination never exists without a
/// source.
#[derive(Debug)]
pub enum Endpoints<S, D> {
    NoSource,
    SourceOnly(S),
    SourceAndDestination(S, D),
    Closed,
}

impl<S, D> Default for Endpoints<S, D> {
    fn default() -> Self {
        Endpoints::NoSource
    }
}

impl<S, D> Endpoints<S, D> {
    pub fn source_alive(&self) -> bool {
        matches!(
            self,
            Endpoints::SourceOnly(_) | Endpoints::SourceAndDestination(..)
        )
    }

    pub fn destination_alive(&self) -> bool {
        matches!(self, Endpoints::SourceAndDestination(..))
    }

    /// Phase implied by which sockets are open.
    pub fn phase(&self) -> Phase {
        match self {
            Endpoints::NoSource => Phase::Accepted,
            Endpoints::SourceOnly(_) => Phase::AwaitingDestination,
            Endpoints::SourceAndDestination(..) => Phase::Relaying,
            Endpoints::Closed => Phase::Terminated,
        }
    }

    /// Take the source in (first transition out of `NoSource`).
    pub fn open(&mut self, source: S) {
        *self = Endpoints::SourceOnly(source);
    }

    /// Pair a destination with the open source. Returns the destination
    /// back if there is no source to pair it with.
    pub fn attach(&mut self, destination: D) -> Result<(), D> {
        match std::mem::take(self) {
            Endpoints::SourceOnly(s) => {
                *self = Endpoints::SourceAndDestination(s, destination);
                Ok(())
            }
            Endpoints::SourceAndDestination(s, old) => {
                *self = Endpoints::SourceAndDestination(s, destination);
                drop(old);
                Ok(())
            }
            other => {
                *self = other;
                Err(destination)
            }
        }
    }

    /// Drop the destination, keeping the source.
    pub fn detach(&mut self) -> Option<D> {
        match std::mem::take(self) {
            Endpoints::SourceAndDestination(s, d) => {
                *self = Endpoints::SourceOnly(s);
                Some(d)
            }
            other => {
                *self = other;
                None
            }
        }
    }

    /// Drop everything.
    pub fn close(&mut self) {
        *self = Endpoints::Closed;
    }

    pub fn source_mut(&mut self) -> Option<&mut S> {
        match self {
            Endpoints::SourceOnly(s) | Endpoints::SourceAndDestination(s, _) => Some(s),
            _ => None,
        }
    }

    pub fn both_mut(&mut self) -> Option<(&mut S, &mut D)> {
        match self {
            Endpoints::SourceAndDestination(s, d) => Some((s, d)),
            _ => None,
        }
    }
}
