//! Cryptographic primitives for the tunnel handshake
//!
//! - RSA key pairs used to wrap a per-connection AES key
//! - AES-128 (GCM) encryption of TRANSFER payloads
//! - Opportunistic gzip compression of payloads

mod cipher;
mod compress;
mod keys;

pub use cipher::{decrypt_aes128, encrypt_aes128, AesKey, AES_KEY_LEN, NONCE_LEN};
pub use compress::{decompress, gzip, try_compress, COMPRESSION_THRESHOLD};
pub use keys::{wrap_aes_key, KeyPair, DEFAULT_RSA_BITS};

use thiserror::Error;

/// Crypto errors
///
/// A decryption failure means the payload was tampered with or the key is
/// wrong; callers treat it as a protocol error.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("Invalid public key: {0}")]
    PublicKey(String),

    #[error("Invalid key material")]
    InvalidKey,

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed")]
    Decrypt,

    #[error("Compression error: {0}")]
    Compression(String),
}
