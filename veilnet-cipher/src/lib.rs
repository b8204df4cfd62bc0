#![forbid(unsafe_code)]

mod provider;

pub use self::provider::{KeyMaterial, SymProvider, KEY_SIZE, NONCE_SIZE};
