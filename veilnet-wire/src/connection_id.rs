use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A 16-byte connection identity. `Ord` is derived over the raw bytes,
/// which gives exactly the byte-wise, first-differing-byte comparison
/// the rekey tie-break relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId([u8; 16]);

impl ConnectionId {
    pub fn generate() -> Self {
        ConnectionId(*Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ConnectionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

#[cfg(test)]
mod test_connection_id {
    use super::*;

    #[test]
    fn orders_lexicographically_by_first_differing_byte() {
        let smaller = ConnectionId::from_bytes([0, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let larger = ConnectionId::from_bytes([1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(smaller < larger);
    }

    #[test]
    fn generate_is_not_deterministic() {
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
    }
}
