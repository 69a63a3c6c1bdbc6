use std::fmt;
use thiserror::Error;

/// Closed set of failure causes the gateway reasons over.
///
/// Every fallible operation in the relay path reports exactly one of these,
/// and the connection handler's recovery policy decides what to close based
/// on it alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationError {
    Timeout,
    WrongMac,
    SocketError,
    DisconnectedFromSource,
    DisconnectedFromDestination,
    WrongHeader,
    NotSendLogonBefore,
    Declined,
    SslError,
    WrongConfiguration,
    CryptoError,
    MessageTooLarge,
}

impl VerificationError {
    /// Every variant, in declaration order. Used for per-kind counters.
    pub const ALL: [VerificationError; 12] = [
        VerificationError::Timeout,
        VerificationError::WrongMac,
        VerificationError::SocketError,
        VerificationError::DisconnectedFromSource,
        VerificationError::DisconnectedFromDestination,
        VerificationError::WrongHeader,
        VerificationError::NotSendLogonBefore,
        VerificationError::Declined,
        VerificationError::SslError,
        VerificationError::WrongConfiguration,
        VerificationError::CryptoError,
        VerificationError::MessageTooLarge,
    ];

    /// Stable index into [`VerificationError::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerificationError::Timeout => "TIMEOUT",
            VerificationError::WrongMac => "WRONG_MAC",
            VerificationError::SocketError => "SOCKET_ERROR",
            VerificationError::DisconnectedFromSource => "DISCONNECTED_FROM_SOURCE",
            VerificationError::DisconnectedFromDestination => "DISCONNECTED_FROM_DESTINATION",
            VerificationError::WrongHeader => "WRONG_HEADER",
            VerificationError::NotSendLogonBefore => "NOT_SEND_LOGON_BEFORE",
            VerificationError::Declined => "DECLINED",
            VerificationError::SslError => "SSL_ERROR",
            VerificationError::WrongConfiguration => "WRONG_CONFIGURATION",
            VerificationError::CryptoError => "CRYPTO_ERROR",
            VerificationError::MessageTooLarge => "MESSAGE_TOO_LARGE",
        }
    }
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which endpoint of a relayed connection an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Destination => f.write_str("destination"),
        }
    }
}

/// Error produced anywhere in the gateway.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {detail}")]
pub struct GatewayError {
    pub kind: VerificationError,
    pub side: Option<Side>,
    pub detail: String,
}

impl GatewayError {
    pub fn new(kind: VerificationError, detail: impl Into<String>) -> Self {
        Self {
            kind,
            side: None,
            detail: detail.into(),
        }
    }

    /// Attach the endpoint this error belongs to.
    pub fn on(mut self, side: Side) -> Self {
        self.side = Some(side);
        self
    }

    pub fn wrong_header(detail: impl Into<String>) -> Self {
        Self::new(VerificationError::WrongHeader, detail)
    }

    pub fn config(detail: impl Into<String>) -> Self {
        Self::new(VerificationError::WrongConfiguration, detail)
    }

    pub fn crypto(detail: impl Into<String>) -> Self {
        Self::new(VerificationError::CryptoError, detail)
    }

    pub fn timeout(side: Side) -> Self {
        Self::new(VerificationError::Timeout, format!("{side} silent")).on(side)
    }

    /// Peer closed its end of the socket.
    pub fn disconnected(side: Side) -> Self {
        let kind = match side {
            Side::Source => VerificationError::DisconnectedFromSource,
            Side::Destination => VerificationError::DisconnectedFromDestination,
        };
        Self::new(kind, format!("{side} closed the connection")).on(side)
    }

    /// Map an I/O failure observed on `side`.
    pub fn io(side: Side, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                Self::new(VerificationError::Timeout, err.to_string()).on(side)
            }
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => {
                let mut e = Self::disconnected(side);
                e.detail = err.to_string();
                e
            }
            _ => Self::new(VerificationError::SocketError, err.to_string()).on(side),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::new(VerificationError::SocketError, e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn index_matches_all_order() {
        for (i, kind) in VerificationError::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn io_errors_map_to_taxonomy() {
        let e = GatewayError::io(Side::Destination, Error::new(ErrorKind::TimedOut, "t"));
        assert_eq!(e.kind, VerificationError::Timeout);
        assert_eq!(e.side, Some(Side::Destination));

        let e = GatewayError::io(Side::Source, Error::new(ErrorKind::ConnectionReset, "r"));
        assert_eq!(e.kind, VerificationError::DisconnectedFromSource);

        let e = GatewayError::io(Side::Destination, Error::new(ErrorKind::BrokenPipe, "p"));
        assert_eq!(e.kind, VerificationError::DisconnectedFromDestination);

        let e = GatewayError::io(Side::Source, Error::new(ErrorKind::PermissionDenied, "x"));
        assert_eq!(e.kind, VerificationError::SocketError);
    }

    #[test]
    fn display_includes_kind() {
        let e = GatewayError::wrong_header("first tag is not START");
        assert_eq!(e.to_string(), "WRONG_HEADER: first tag is not START");
    }
}
