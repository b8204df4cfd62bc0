use std::io::{self, Read, Write};
use std::net::TcpStream;

use veilnet_cipher::SymProvider;
use veilnet_wire::{read_encrypted_packet, write_encrypted_packet, Packet, WireError};

fn to_io_err(err: WireError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

/// Adapts the partial-handshake line protocol (designed in
/// `veilnet-handshake` to run over any `Read + Write`) onto the
/// already-encrypted connection: each line written through this channel
/// becomes one control `Packet` sent with the *current* `encryptor`;
/// each line read blocks for the next control `Packet` of the expected
/// type, decrypted with the current `decryptor`. This lets the full and
/// partial handshake protocols share one implementation even though a
/// partial handshake's messages ride inside the ordinary frame pipe
/// instead of a bare socket.
pub struct PacketChannel<'a> {
    read_stream: &'a mut TcpStream,
    write_stream: &'a mut TcpStream,
    decryptor: &'a mut SymProvider,
    encryptor: &'a mut SymProvider,
    write_type_id: u32,
    read_type_id: u32,
    out_buf: Vec<u8>,
    in_buf: Vec<u8>,
    in_pos: usize,
}

impl<'a> PacketChannel<'a> {
    pub fn new(
        read_stream: &'a mut TcpStream,
        write_stream: &'a mut TcpStream,
        decryptor: &'a mut SymProvider,
        encryptor: &'a mut SymProvider,
        write_type_id: u32,
        read_type_id: u32,
    ) -> Self {
        PacketChannel {
            read_stream,
            write_stream,
            decryptor,
            encryptor,
            write_type_id,
            read_type_id,
            out_buf: Vec::new(),
            in_buf: Vec::new(),
            in_pos: 0,
        }
    }

    fn flush_out(&mut self) -> io::Result<()> {
        if self.out_buf.is_empty() {
            return Ok(());
        }
        let mut payload = std::mem::take(&mut self.out_buf);
        if payload.last() == Some(&b'\n') {
            payload.pop();
        }
        let packet = Packet::new(self.write_type_id, payload);
        write_encrypted_packet(self.write_stream, self.encryptor, &packet).map_err(to_io_err)?;
        Ok(())
    }

    /// Primes the read side with a control packet's payload the reader
    /// loop already consumed and dispatched before this channel existed;
    /// used when the message that triggers building the channel (e.g. the
    /// peer's opening handshake line) has already been read off the wire.
    pub fn seed_input(&mut self, payload: Vec<u8>) {
        let mut buf = payload;
        buf.push(b'\n');
        self.in_buf = buf;
        self.in_pos = 0;
    }
}

impl<'a> Read for PacketChannel<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.in_pos >= self.in_buf.len() {
            self.flush_out()?;
            let (packet, _) = read_encrypted_packet(self.read_stream, self.decryptor).map_err(to_io_err)?;
            if packet.type_id != self.read_type_id {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected control packet {}, got {}", self.read_type_id, packet.type_id),
                ));
            }
            self.in_buf = packet.data;
            self.in_buf.push(b'\n');
            self.in_pos = 0;
        }
        let remaining = &self.in_buf[self.in_pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.in_pos += n;
        Ok(n)
    }
}

impl<'a> Write for PacketChannel<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out_buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_out()
    }
}
