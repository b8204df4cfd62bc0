use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::packet::Packet;
use veilnet_cipher::SymProvider;

/// Reads beyond the length prefix happen in chunks this large, mirroring
/// the teacher's fixed re-used read buffer rather than allocating per
/// call.
const READ_CHUNK: usize = 512;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed mid-frame: {missing} bytes short of the advertised length")]
    ShortFrame { missing: usize },
    #[error("failed to encode packet: {0}")]
    Encode(bincode::Error),
    #[error("failed to decode packet: {0}")]
    Decode(bincode::Error),
}

impl WireError {
    /// True for a read that simply hasn't produced the next frame's
    /// length prefix yet (a transient `ReadTimeout`); the reader loop
    /// treats this as "try again", not as an error to count.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            WireError::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

/// Writes `LE32(len(payload)) ++ payload`. Returns the total wire byte
/// count (`4 + payload.len()`).
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<usize, WireError> {
    w.write_u32::<LittleEndian>(payload.len() as u32)?;
    w.write_all(payload)?;
    Ok(4 + payload.len())
}

/// Reads one length-prefixed frame. Short reads after the length prefix
/// has started concatenate until the advertised length is reached; EOF
/// before that point is `ShortFrame`, a fatal error. A timeout before
/// any byte of the length prefix arrives surfaces as a plain `Io` error
/// the caller can recognize with [`WireError::is_timeout`].
pub fn read_frame<R: Read>(r: &mut R) -> Result<(Vec<u8>, usize), WireError> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let end = (filled + READ_CHUNK).min(len);
        let n = r.read(&mut buf[filled..end])?;
        if n == 0 {
            return Err(WireError::ShortFrame { missing: len - filled });
        }
        filled += n;
    }
    Ok((buf, 4 + len))
}

/// Writes an asymmetric-wrapped handshake blob as a base64 line
/// terminated by a single line feed.
pub fn write_line<W: Write>(w: &mut W, line: &str) -> Result<(), WireError> {
    w.write_all(line.as_bytes())?;
    w.write_all(b"\n")?;
    Ok(())
}

/// Reads one line terminated by `\n`, tolerating a preceding `\r` so a
/// peer that writes CRLF (the platform default on some systems) is
/// still understood.
pub fn read_line<R: Read>(r: &mut R) -> Result<String, WireError> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = r.read(&mut byte)?;
        if n == 0 {
            return Err(WireError::ShortFrame { missing: 1 });
        }
        if byte[0] == b'\n' {
            break;
        }
        bytes.push(byte[0]);
    }
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Components A + B + D composed: frame, then decrypt/deserialize (or
/// serialize/encrypt) a `Packet`. This is the steady-state, post-handshake
/// read/write path.
pub fn write_encrypted_packet<W: Write>(
    w: &mut W,
    cipher: &mut SymProvider,
    packet: &Packet,
) -> Result<usize, WireError> {
    let plaintext = packet.serialize()?;
    let ciphertext = cipher.encrypt(&plaintext);
    write_frame(w, &ciphertext)
}

/// Returns `Err(WireError::Decode(_))` on a frame that read fully but
/// failed to deserialize into a `Packet`; callers use this to
/// distinguish transport corruption (recoverable, up to a limit) from a
/// genuine I/O failure.
pub fn read_encrypted_packet<R: Read>(
    r: &mut R,
    cipher: &mut SymProvider,
) -> Result<(Packet, usize), WireError> {
    let (ciphertext, wire_len) = read_frame(r)?;
    let plaintext = cipher.decrypt(&ciphertext);
    let packet = Packet::deserialize(&plaintext)?;
    Ok((packet, wire_len))
}
