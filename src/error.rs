//! Named failures surfaced by the peer layer.
//!
//! Most plumbing returns `anyhow::Result`; the variants here are the ones a
//! caller may want to match on (via `anyhow::Error::downcast_ref`), in
//! particular to tell a timeout apart from a hard failure.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("unknown public key")]
    UnknownPublicKey,

    #[error("peer already exists")]
    PeerExists,

    #[error("peer does not exist")]
    PeerNotFound,

    #[error("peer does not have a connected address")]
    NoPeerAddress,

    #[error("peer does not have relay public key specified")]
    NoRelayKey,

    #[error("response public key does not match request public key")]
    ResponseKeyMismatch,

    #[error("could not connect to peer")]
    CouldNotConnect,

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("ping challenge was not echoed back")]
    ChallengeMismatch,

    #[error("peer is not allowed to access vault '{0}'")]
    VaultAccessDenied(String),

    #[error("no {0} handler installed")]
    HandlerMissing(&'static str),

    #[error("message type {expected} carried a {found} body")]
    KindMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

impl PeerError {
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        PeerError::Timeout { operation, after }
    }

    /// True if `err` (or anything it wraps) is a [`PeerError::Timeout`].
    pub fn is_timeout(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<PeerError>(),
                Some(PeerError::Timeout { .. })
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_detectable_through_context() {
        let err = anyhow::Error::new(PeerError::timeout("ping", Duration::from_millis(5)))
            .context("pinging peer");
        assert!(PeerError::is_timeout(&err));

        let hard = anyhow::Error::new(PeerError::CouldNotConnect);
        assert!(!PeerError::is_timeout(&hard));
    }

    #[test]
    fn messages_match_wire_visible_text() {
        assert_eq!(
            PeerError::NoPeerAddress.to_string(),
            "peer does not have a connected address"
        );
        assert_eq!(
            PeerError::ResponseKeyMismatch.to_string(),
            "response public key does not match request public key"
        );
    }
}
