use serde::{Deserialize, Serialize};

use crate::frame::WireError;

/// The envelope carried inside every frame. `type_id` is drawn from the
/// closed control set in `type_id` or from a user-defined, disjoint
/// range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub type_id: u32,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(type_id: u32, data: Vec<u8>) -> Self {
        Packet { type_id, data }
    }

    /// Canonical binary form. `data` is the envelope's last field, so a
    /// peer that appends trailing bytes to a future, wider envelope
    /// cannot desync this decoder; bincode has no length-delimited
    /// "rest of the fields" ambiguity to worry about here.
    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        bincode::serialize(self).map_err(WireError::Encode)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        bincode::deserialize(bytes).map_err(WireError::Decode)
    }
}

#[cfg(test)]
mod test_packet {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trips_empty_payload() {
        let p = Packet::new(1000, vec![]);
        assert_eq!(Packet::deserialize(&p.serialize().unwrap()).unwrap(), p);
    }

    proptest! {
        #[test]
        fn round_trips_arbitrary_payloads(type_id: u32, data in proptest::collection::vec(any::<u8>(), 0..65536)) {
            let p = Packet::new(type_id, data);
            let bytes = p.serialize().unwrap();
            let back = Packet::deserialize(&bytes).unwrap();
            prop_assert_eq!(back, p);
        }
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(Packet::deserialize(&[0xFF; 3]).is_err());
    }
}
