//! What to close after a failed exchange.
//!
//! Every error a handler sees goes through [`decide`]; nothing else in the
//! relay path closes sockets on its own.

use crate::config::ActionWhenDisconnect;
use isogate_core::VerificationError;

#[derive(Debug, Clone, Copy)]
pub struct RecoveryContext {
    pub kind: VerificationError,
    pub source_alive: bool,
    pub destination_alive: bool,
    pub action: ActionWhenDisconnect,
    pub stopping: bool,
    pub synchronous: bool,
    /// Consecutive in-place retries still allowed.
    pub retries_left: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryDecision {
    pub close_source: bool,
    pub close_destination: bool,
    /// Keep both sockets and handle the next source message.
    pub retry: bool,
}

impl RecoveryDecision {
    const CLOSE_BOTH: RecoveryDecision = RecoveryDecision {
        close_source: true,
        close_destination: true,
        retry: false,
    };

    const RETRY: RecoveryDecision = RecoveryDecision {
        close_source: false,
        close_destination: false,
        retry: true,
    };
}

/// Kinds after which the connection cannot be trusted any more.
fn is_terminal(kind: VerificationError) -> bool {
    matches!(
        kind,
        VerificationError::WrongHeader
            | VerificationError::SslError
            | VerificationError::WrongConfiguration
    )
}

fn is_retryable(kind: VerificationError) -> bool {
    matches!(
        kind,
        VerificationError::NotSendLogonBefore | VerificationError::WrongMac
    )
}

pub fn decide(ctx: RecoveryContext) -> RecoveryDecision {
    if ctx.kind == VerificationError::DisconnectedFromSource || ctx.stopping {
        return RecoveryDecision::CLOSE_BOTH;
    }
    if is_retryable(ctx.kind) && ctx.synchronous && ctx.retries_left > 0 {
        return RecoveryDecision::RETRY;
    }
    if is_terminal(ctx.kind) {
        return RecoveryDecision::CLOSE_BOTH;
    }
    RecoveryDecision {
        close_source: !ctx.source_alive || ctx.action.closes_source(),
        close_destination: !ctx.destination_alive || ctx.action.closes_destination(),
        retry: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(kind: VerificationError) -> RecoveryContext {
        RecoveryContext {
            kind,
            source_alive: true,
            destination_alive: true,
            action: ActionWhenDisconnect::NoDisconnect,
            stopping: false,
            synchronous: true,
            retries_left: 3,
        }
    }

    /// (kind, action, source alive, destination alive) -> (close source, close destination)
    #[test]
    fn disconnect_matrix() {
        use ActionWhenDisconnect::*;
        use VerificationError::*;
        #[rustfmt::skip]
        let table = [
            // A source socket error with a live destination.
            (SocketError, DisconnectBoth,        true,  true,  (true,  true)),
            (SocketError, NoDisconnect,          true,  true,  (false, false)),
            (SocketError, DisconnectSource,      true,  true,  (true,  false)),
            (SocketError, DisconnectDestination, true,  true,  (false, true)),
            // Dead sockets are closed whatever the action says.
            (SocketError, NoDisconnect,          true,  false, (false, true)),
            (SocketError, NoDisconnect,          false, true,  (true,  false)),
            (SocketError, NoDisconnect,          false, false, (true,  true)),
            (SocketError, DisconnectSource,      true,  false, (true,  true)),
            (SocketError, DisconnectSource,      false, true,  (true,  false)),
            (SocketError, DisconnectDestination, false, true,  (true,  true)),
            (SocketError, DisconnectDestination, true,  false, (false, true)),
            (SocketError, DisconnectBoth,        false, false, (true,  true)),
            (Timeout,     NoDisconnect,          true,  true,  (false, false)),
            (Timeout,     DisconnectDestination, true,  true,  (false, true)),
            (Declined,    DisconnectSource,      true,  true,  (true,  false)),
            (CryptoError, NoDisconnect,          true,  true,  (false, false)),
            (MessageTooLarge, DisconnectDestination, true, true, (false, true)),
            (DisconnectedFromDestination, NoDisconnect,     true, false, (false, true)),
            (DisconnectedFromDestination, DisconnectSource, true, false, (true,  true)),
            // Source gone: always both.
            (DisconnectedFromSource, NoDisconnect,          false, true,  (true, true)),
            (DisconnectedFromSource, DisconnectDestination, true,  true,  (true, true)),
            // Terminal kinds: always both.
            (WrongHeader,        NoDisconnect,          true, true, (true, true)),
            (SslError,           DisconnectDestination, true, true, (true, true)),
            (WrongConfiguration, NoDisconnect,          true, false, (true, true)),
        ];
        for (kind, action, source_alive, destination_alive, (close_source, close_destination)) in table {
            let c = RecoveryContext {
                kind,
                action,
                source_alive,
                destination_alive,
                ..ctx(kind)
            };
            assert_eq!(
                decide(c),
                RecoveryDecision {
                    close_source,
                    close_destination,
                    retry: false,
                },
                "{c:?}"
            );
        }
    }

    #[test]
    fn retryable_kinds_close_nothing_in_sync_mode() {
        for action in ActionWhenDisconnect::ALL {
            for kind in [VerificationError::WrongMac, VerificationError::NotSendLogonBefore] {
                let d = decide(RecoveryContext {
                    action,
                    destination_alive: false,
                    ..ctx(kind)
                });
                assert_eq!(d, RecoveryDecision::RETRY, "{kind:?} {action:?}");
            }
        }
    }

    #[test]
    fn timeout_with_no_disconnect_keeps_both() {
        let d = decide(ctx(VerificationError::Timeout));
        assert_eq!(d, RecoveryDecision::default());
    }

    #[test]
    fn dead_destination_is_closed_even_without_policy() {
        let d = decide(RecoveryContext {
            destination_alive: false,
            ..ctx(VerificationError::DisconnectedFromDestination)
        });
        assert!(d.close_destination);
        assert!(!d.close_source);
    }

    #[test]
    fn wrong_mac_retries_only_while_budget_lasts() {
        assert!(decide(ctx(VerificationError::WrongMac)).retry);
        let exhausted = decide(RecoveryContext {
            retries_left: 0,
            action: ActionWhenDisconnect::DisconnectSource,
            ..ctx(VerificationError::WrongMac)
        });
        assert!(!exhausted.retry);
        assert!(exhausted.close_source);
        assert!(!exhausted.close_destination);
    }

    #[test]
    fn async_mode_never_retries() {
        let d = decide(RecoveryContext {
            synchronous: false,
            ..ctx(VerificationError::NotSendLogonBefore)
        });
        assert!(!d.retry);
    }

    #[test]
    fn stopping_beats_retry() {
        let d = decide(RecoveryContext {
            stopping: true,
            ..ctx(VerificationError::WrongMac)
        });
        assert_eq!(d, RecoveryDecision::CLOSE_BOTH);
    }

    #[test]
    fn wrong_header_is_terminal() {
        let d = decide(ctx(VerificationError::WrongHeader));
        assert_eq!(d, RecoveryDecision::CLOSE_BOTH);
    }
}
