#![forbid(unsafe_code)]

mod connection_id;
mod frame;
mod packet;
pub mod type_id;

pub use connection_id::ConnectionId;
pub use frame::{
    read_encrypted_packet, read_frame, read_line, write_encrypted_packet, write_frame, write_line,
    WireError,
};
pub use packet::Packet;
