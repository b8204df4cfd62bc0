use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// The key and nonce that seed one direction of a session. This is the
/// only part of a `SymProvider` that ever crosses the wire, wrapped
/// inside an asymmetric-encrypted handshake envelope.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub key: [u8; KEY_SIZE],
    pub nonce: [u8; NONCE_SIZE],
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "KeyMaterial {{ key: {}, nonce: {} }}",
            hex::encode(self.key),
            hex::encode(self.nonce),
        )
    }
}

/// `SymProvider` wraps a single direction's keystream cipher. Unlike an
/// AEAD construction, `encrypt`/`decrypt` never change the length of the
/// buffer they operate on: this is a hard invariant of the session
/// protocol, which frames payloads by length before a `SymProvider` ever
/// touches them.
pub struct SymProvider {
    material: KeyMaterial,
    cipher: ChaCha20,
}

impl fmt::Debug for SymProvider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SymProvider {{ material: {:?} }}", self.material)
    }
}

impl SymProvider {
    pub fn new(material: KeyMaterial) -> Self {
        let cipher = ChaCha20::new(&material.key.into(), &material.nonce.into());
        SymProvider { material, cipher }
    }

    /// Generates a fresh random key and nonce. Used by the handshake
    /// engine whenever a new session key needs to be minted.
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut key = [0u8; KEY_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut nonce);
        Self::new(KeyMaterial { key, nonce })
    }

    /// Restores the cipher to the state it held right after construction,
    /// discarding whatever keystream position prior `encrypt`/`decrypt`
    /// calls have advanced it to.
    pub fn reset(&mut self) {
        self.cipher = ChaCha20::new(&self.material.key.into(), &self.material.nonce.into());
    }

    /// XORs `data` against the running keystream in place and returns it.
    /// Ciphertext length always equals plaintext length.
    pub fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut buf = data.to_vec();
        self.cipher.apply_keystream(&mut buf);
        buf
    }

    /// `decrypt` is the same keystream XOR as `encrypt`; the cipher
    /// doesn't distinguish direction, only the caller's bookkeeping does.
    pub fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
        self.encrypt(data)
    }

    pub fn key_material(&self) -> KeyMaterial {
        self.material.clone()
    }
}

impl From<KeyMaterial> for SymProvider {
    fn from(material: KeyMaterial) -> Self {
        SymProvider::new(material)
    }
}
