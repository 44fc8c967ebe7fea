//! Runtime options of tunnel connections

use backhaul_connection::{HeartbeatConfig, ReconnectConfig, TlsClientSettings};
use backhaul_crypto::DEFAULT_RSA_BITS;
use backhaul_proto::MAX_FRAME_SIZE;

/// When a tunnel connection is re-established automatically
///
/// Two independent bits: *disconnect* covers an established connection going
/// away (including FORCE_OFF), *error* covers failures before the tunnel is
/// established (refused connect, failed handshake, rejection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy(u8);

impl RetryPolicy {
    pub const RETRY_ON_DISCONNECT: u8 = 0b01;
    pub const RETRY_ON_ERROR: u8 = 0b10;

    pub const NEVER: Self = Self(0);
    pub const ALWAYS: Self = Self(Self::RETRY_ON_DISCONNECT | Self::RETRY_ON_ERROR);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & (Self::RETRY_ON_DISCONNECT | Self::RETRY_ON_ERROR))
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn with_retry_on_disconnect(mut self) -> Self {
        self.0 |= Self::RETRY_ON_DISCONNECT;
        self
    }

    pub fn with_retry_on_error(mut self) -> Self {
        self.0 |= Self::RETRY_ON_ERROR;
        self
    }

    pub fn on_disconnect(&self) -> bool {
        self.0 & Self::RETRY_ON_DISCONNECT != 0
    }

    pub fn on_error(&self) -> bool {
        self.0 & Self::RETRY_ON_ERROR != 0
    }
}

/// Settings shared by every connection of a [`crate::TunnelClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Wrap the control connection in TLS
    pub tls: Option<TlsClientSettings>,
    pub heartbeat: HeartbeatConfig,
    pub retry: RetryPolicy,
    pub reconnect: ReconnectConfig,
    /// Offer gzip for TRANSFER payloads
    pub compress: bool,
    /// RSA key size for the encrypted handshake
    pub rsa_bits: usize,
    pub max_frame_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            tls: None,
            heartbeat: HeartbeatConfig::default(),
            retry: RetryPolicy::default().with_retry_on_disconnect(),
            reconnect: ReconnectConfig::default(),
            compress: false,
            rsa_bits: DEFAULT_RSA_BITS,
            max_frame_size: MAX_FRAME_SIZE as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_bits_are_independent() {
        let disconnect = RetryPolicy::NEVER.with_retry_on_disconnect();
        assert!(disconnect.on_disconnect());
        assert!(!disconnect.on_error());

        let error = RetryPolicy::NEVER.with_retry_on_error();
        assert!(!error.on_disconnect());
        assert!(error.on_error());

        assert_eq!(RetryPolicy::from_bits(0xFF), RetryPolicy::ALWAYS);
        assert_eq!(RetryPolicy::ALWAYS.bits(), 0b11);
    }

    #[test]
    fn test_default_options() {
        let options = ClientOptions::default();
        assert!(options.tls.is_none());
        assert!(options.retry.on_disconnect());
        assert!(!options.retry.on_error());
        assert_eq!(options.rsa_bits, 2048);
    }
}
