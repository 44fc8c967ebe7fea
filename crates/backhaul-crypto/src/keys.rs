//! RSA key pairs for the AES key exchange

use crate::{AesKey, CryptoError};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::debug;

/// Default modulus size for handshake key pairs
pub const DEFAULT_RSA_BITS: usize = 2048;

/// RSA key pair generated by the client for one handshake
pub struct KeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl KeyPair {
    /// Generate a key pair with [`DEFAULT_RSA_BITS`]
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_bits(DEFAULT_RSA_BITS)
    }

    /// Generate a key pair with a custom modulus size
    ///
    /// CPU heavy; run it on a blocking thread from async code.
    pub fn generate_with_bits(bits: usize) -> Result<Self, CryptoError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)?;
        let public_key = RsaPublicKey::from(&private_key);
        debug!("Generated {}-bit RSA key pair", bits);

        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Public key as DER-encoded SubjectPublicKeyInfo
    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        self.public_key
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::PublicKey(e.to_string()))
    }

    /// Recover the AES key the server wrapped with our public key
    pub fn unwrap_aes_key(&self, wrapped: &[u8]) -> Result<AesKey, CryptoError> {
        let raw = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| CryptoError::Decrypt)?;
        AesKey::from_slice(&raw)
    }
}

/// Wrap `key` with the peer's DER public key (server side of the exchange)
pub fn wrap_aes_key(public_key_der: &[u8], key: &AesKey) -> Result<Vec<u8>, CryptoError> {
    let public_key = RsaPublicKey::from_public_key_der(public_key_der)
        .map_err(|e| CryptoError::PublicKey(e.to_string()))?;
    let mut rng = rand::thread_rng();
    Ok(public_key.encrypt(&mut rng, Oaep::new::<Sha256>(), key.as_bytes())?)
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decrypt_aes128, encrypt_aes128};

    // Small keys keep the tests fast; the exchange logic is size independent.
    const TEST_BITS: usize = 1024;

    #[test]
    fn test_key_exchange_then_payload_round_trip() {
        let pair = KeyPair::generate_with_bits(TEST_BITS).unwrap();
        let der = pair.public_key_der().unwrap();

        // Server: random key, wrapped with the client's public key
        let server_key = AesKey::generate();
        let wrapped = wrap_aes_key(&der, &server_key).unwrap();

        // Client: unwrap and use it to read what the server encrypted
        let client_key = pair.unwrap_aes_key(&wrapped).unwrap();
        let payload = b"GET / HTTP/1.1\r\nHost: t1.tunnel.lo\r\n\r\n";
        let sealed = encrypt_aes128(payload, &server_key).unwrap();
        assert_eq!(decrypt_aes128(&sealed, &client_key).unwrap(), payload);
    }

    #[test]
    fn test_unwrap_with_wrong_private_key_fails() {
        let pair = KeyPair::generate_with_bits(TEST_BITS).unwrap();
        let other = KeyPair::generate_with_bits(TEST_BITS).unwrap();

        let wrapped = wrap_aes_key(&pair.public_key_der().unwrap(), &AesKey::generate()).unwrap();
        assert!(matches!(
            other.unwrap_aes_key(&wrapped),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn test_garbage_public_key_rejected() {
        assert!(matches!(
            wrap_aes_key(b"not a key", &AesKey::generate()),
            Err(CryptoError::PublicKey(_))
        ));
    }
}
