#![forbid(unsafe_code)]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

/// Bit size of the keypair generated on construction. Both ends of a
/// connection must agree on this out of band; it is not negotiated.
const KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum AsymError {
    #[error("malformed public key blob: {0}")]
    MalformedBlob(String),
    #[error("plaintext exceeds the key modulus")]
    PlaintextTooLarge,
    #[error("failed to decode base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("key generation failed: {0}")]
    KeyGen(rsa::Error),
    #[error("rsa operation failed: {0}")]
    Rsa(rsa::Error),
}

/// A peer's imported public key, usable only for `encrypt_to_peer`.
pub struct PeerKey(RsaPublicKey);

/// Generates its own keypair on construction (expensive; callers should
/// create one `AsymHelper` per connection and reuse it across full
/// handshakes, rather than per-message). Partial rekeys mint their own
/// short-lived `AsymHelper` instead of reusing the connection's.
pub struct AsymHelper {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl AsymHelper {
    pub fn generate() -> Result<Self, AsymError> {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(AsymError::KeyGen)?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(AsymHelper { private_key, public_key })
    }

    /// Bytes suitable for sending to a peer, who imports them with
    /// `import_peer`.
    pub fn public_key_blob(&self) -> Result<Vec<u8>, AsymError> {
        self.public_key
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| AsymError::MalformedBlob(e.to_string()))
    }

    pub fn import_peer(blob: &[u8]) -> Result<PeerKey, AsymError> {
        RsaPublicKey::from_public_key_der(blob)
            .map(PeerKey)
            .map_err(|e| AsymError::MalformedBlob(e.to_string()))
    }

    pub fn encrypt_to_peer(peer: &PeerKey, plaintext: &[u8]) -> Result<String, AsymError> {
        let mut rng = OsRng;
        let ciphertext = peer
            .0
            .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| match e {
                rsa::Error::MessageTooLong => AsymError::PlaintextTooLarge,
                other => AsymError::Rsa(other),
            })?;
        Ok(BASE64.encode(ciphertext))
    }

    /// Private-key operation. Tolerates a trailing CR so callers that
    /// read handshake lines terminated by CRLF don't need to normalize
    /// first.
    pub fn decrypt_from_base64(&self, line: &str) -> Result<Vec<u8>, AsymError> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let ciphertext = BASE64.decode(trimmed)?;
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .map_err(AsymError::Rsa)
    }
}

#[cfg(test)]
mod test_asym {
    use super::*;

    #[test]
    fn round_trips_short_blobs() {
        let bob = AsymHelper::generate().unwrap();

        let bob_peer = AsymHelper::import_peer(&bob.public_key_blob().unwrap()).unwrap();
        let line = AsymHelper::encrypt_to_peer(&bob_peer, b"hello session key").unwrap();
        let recovered = bob.decrypt_from_base64(&line).unwrap();
        assert_eq!(recovered, b"hello session key");
    }

    #[test]
    fn tolerates_crlf_line_endings() {
        let alice = AsymHelper::generate().unwrap();
        let peer = AsymHelper::import_peer(&alice.public_key_blob().unwrap()).unwrap();
        let mut line = AsymHelper::encrypt_to_peer(&peer, b"payload").unwrap();
        line.push_str("\r\n");
        assert_eq!(alice.decrypt_from_base64(&line).unwrap(), b"payload");
    }

    #[test]
    fn rejects_malformed_public_key_blob() {
        let err = AsymHelper::import_peer(b"not a key").unwrap_err();
        assert!(matches!(err, AsymError::MalformedBlob(_)));
    }

    #[test]
    fn rejects_oversize_plaintext() {
        let bob = AsymHelper::generate().unwrap();
        let peer = AsymHelper::import_peer(&bob.public_key_blob().unwrap()).unwrap();
        let huge = vec![0u8; 4096];
        let err = AsymHelper::encrypt_to_peer(&peer, &huge).unwrap_err();
        assert!(matches!(err, AsymError::PlaintextTooLarge));
    }
}
