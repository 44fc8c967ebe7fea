//! TRANSFER payload sealing: optional gzip, then optional AES-128
//!
//! The sender decides per frame and records what it did in the TRANSFER
//! flags; the receiver undoes exactly what the flags say.

use backhaul_crypto::{decompress, decrypt_aes128, encrypt_aes128, try_compress, AesKey, CryptoError};
use backhaul_proto::{ProtoMessage, TransferFlags, MAX_FRAME_SIZE};
use bytes::Bytes;

/// Negotiated payload transforms of one control connection
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    key: Option<AesKey>,
    compress: bool,
    max_payload: usize,
}

impl PayloadCodec {
    pub fn new(key: Option<AesKey>, compress: bool) -> Self {
        Self {
            key,
            compress,
            max_payload: MAX_FRAME_SIZE as usize,
        }
    }

    pub fn plain() -> Self {
        Self::new(None, false)
    }

    /// Upper bound for decompressed payloads
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    pub fn compresses(&self) -> bool {
        self.compress
    }

    pub fn seal(&self, data: &[u8]) -> Result<(TransferFlags, Bytes), CryptoError> {
        let mut flags = TransferFlags::new();

        let (compressed, payload) = if self.compress {
            try_compress(data)
        } else {
            (false, std::borrow::Cow::Borrowed(data))
        };
        if compressed {
            flags = flags.with_compressed();
        }

        let body = match &self.key {
            Some(key) => {
                flags = flags.with_encrypted();
                Bytes::from(encrypt_aes128(&payload, key)?)
            }
            None => Bytes::copy_from_slice(&payload),
        };

        Ok((flags, body))
    }

    pub fn open(&self, flags: TransferFlags, body: Bytes) -> Result<Bytes, CryptoError> {
        let payload = if flags.is_encrypted() {
            let key = self.key.as_ref().ok_or(CryptoError::InvalidKey)?;
            Bytes::from(decrypt_aes128(&body, key)?)
        } else if self.key.is_some() && !body.is_empty() {
            // Once a key is negotiated every non-empty payload must be sealed
            return Err(CryptoError::Decrypt);
        } else {
            body
        };

        if flags.is_compressed() {
            Ok(Bytes::from(decompress(&payload, self.max_payload)?))
        } else {
            Ok(payload)
        }
    }

    /// Seal `data` into a TRANSFER frame
    pub fn transfer(
        &self,
        tunnel_id: i64,
        session_id: i64,
        data: &[u8],
    ) -> Result<ProtoMessage, CryptoError> {
        let (flags, body) = self.seal(data)?;
        Ok(ProtoMessage::transfer(tunnel_id, session_id, flags, body))
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::plain()
    }
}
