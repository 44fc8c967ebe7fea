//! Client errors

use backhaul_connection::{ChannelError, TransportError};
use backhaul_crypto::CryptoError;
use backhaul_proto::CodecError;
use thiserror::Error;

/// Coarse failure classes, for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer broke the protocol; the connection is unusable
    Protocol,
    /// The server refused the tunnel
    Admission,
    /// Key exchange or payload decryption failed
    Crypto,
    /// Connect, read/write or idle failures; usually worth a retry
    Transport,
}

/// Tunnel client errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tunnel rejected: {0}")]
    Rejected(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tunnel forced off by server")]
    ForcedOff,

    #[error("Tunnel closed")]
    Closed,
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Protocol(_) => ErrorKind::Protocol,
            TunnelError::Rejected(_) => ErrorKind::Admission,
            TunnelError::Crypto(_) => ErrorKind::Crypto,
            TunnelError::Transport(_) | TunnelError::ForcedOff | TunnelError::Closed => {
                ErrorKind::Transport
            }
        }
    }

    /// Rejection reason sent by the server, if that is what this is
    pub fn rejection_reason(&self) -> Option<&str> {
        match self {
            TunnelError::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<ChannelError> for TunnelError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Codec(CodecError::Io(e)) => TunnelError::Transport(e.to_string()),
            ChannelError::Codec(e) => TunnelError::Protocol(e.to_string()),
            ChannelError::Closed => TunnelError::Closed,
            e @ (ChannelError::IdleTimeout(_) | ChannelError::Full) => {
                TunnelError::Transport(e.to_string())
            }
        }
    }
}

impl From<TransportError> for TunnelError {
    fn from(err: TransportError) -> Self {
        TunnelError::Transport(err.to_string())
    }
}

impl From<CryptoError> for TunnelError {
    fn from(err: CryptoError) -> Self {
        TunnelError::Crypto(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_classification() {
        assert_eq!(
            TunnelError::Rejected("bad auth token".to_string()).kind(),
            ErrorKind::Admission
        );
        assert_eq!(TunnelError::ForcedOff.kind(), ErrorKind::Transport);

        let idle: TunnelError = ChannelError::IdleTimeout(Duration::from_secs(60)).into();
        assert_eq!(idle.kind(), ErrorKind::Transport);

        let malformed: TunnelError = ChannelError::Codec(CodecError::UnknownCommand(0xFF)).into();
        assert_eq!(malformed.kind(), ErrorKind::Protocol);

        let tampered: TunnelError = CryptoError::Decrypt.into();
        assert_eq!(tampered.kind(), ErrorKind::Crypto);
    }

    #[test]
    fn test_rejection_reason() {
        let rejected = TunnelError::Rejected("port 40000 already used".to_string());
        assert_eq!(rejected.rejection_reason(), Some("port 40000 already used"));
        assert_eq!(rejected.to_string(), "Tunnel rejected: port 40000 already used");
        assert_eq!(TunnelError::Closed.rejection_reason(), None);
    }
}
