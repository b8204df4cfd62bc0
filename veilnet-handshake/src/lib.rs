#![forbid(unsafe_code)]

//! Key establishment. A full handshake runs once, at connection open, over
//! the raw socket before either side has a cipher. A partial handshake
//! (a rekey) runs later, carried as ordinary control packets over the
//! still-live cipher, and only ever replaces the key material flowing in
//! one logical direction.
//!
//! Both are expressed here purely in terms of `Read`/`Write`, so the same
//! code drives the raw `TcpStream` during a full handshake and a small
//! in-memory adapter during a partial one; the connection crate decides
//! which transport to hand in.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

use veilnet_asym::{AsymError, AsymHelper, PeerKey};
use veilnet_cipher::{KeyMaterial, SymProvider};
use veilnet_wire::{read_line, write_line, WireError};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("transport error: {0}")]
    Wire(#[from] WireError),
    #[error("asymmetric layer error: {0}")]
    Asym(#[from] AsymError),
    #[error("malformed key offer: {0}")]
    Decode(#[from] bincode::Error),
    #[error("peer echoed different key material than we sent")]
    EchoMismatch,
}

/// What one side proposes for its two directions. `out` is the key the
/// sender will encrypt with; `in_` is the key the sender wants the peer
/// to encrypt with when writing back to it.
#[derive(Serialize, Deserialize)]
struct KeyOffer {
    out: KeyMaterial,
    in_: KeyMaterial,
}

fn send_public_key<W: Write>(stream: &mut W, local: &AsymHelper) -> Result<(), HandshakeError> {
    let blob = local.public_key_blob()?;
    write_line(stream, &BASE64.encode(blob))?;
    Ok(())
}

fn recv_public_key<R: Read>(stream: &mut R) -> Result<PeerKey, HandshakeError> {
    let line = read_line(stream)?;
    let blob = BASE64
        .decode(line.trim())
        .map_err(|_| HandshakeError::Asym(AsymError::MalformedBlob("not valid base64".into())))?;
    Ok(AsymHelper::import_peer(&blob)?)
}

fn send_offer<W: Write>(stream: &mut W, peer: &PeerKey, offer: &KeyOffer) -> Result<(), HandshakeError> {
    let plaintext = bincode::serialize(offer)?;
    let line = AsymHelper::encrypt_to_peer(peer, &plaintext)?;
    write_line(stream, &line)?;
    Ok(())
}

fn recv_offer<R: Read>(stream: &mut R, local: &AsymHelper) -> Result<KeyOffer, HandshakeError> {
    let line = read_line(stream)?;
    let plaintext = local.decrypt_from_base64(&line)?;
    Ok(bincode::deserialize(&plaintext)?)
}

/// Runs the full handshake described in the connection's opening
/// sequence. Returns `(encryptor, decryptor, peer_key)` ready for
/// immediate use; `peer_key` is the peer's long-term public key,
/// learned here and reused for later partial handshakes so a rekey
/// doesn't need to pay for a fresh RSA keypair. Both sides run this
/// concurrently; `initiator` only decides the message order, not any
/// asymmetry in the key material itself.
pub fn run_full_handshake<S: Read + Write>(
    stream: &mut S,
    local_asym: &AsymHelper,
    initiator: bool,
) -> Result<(SymProvider, SymProvider, PeerKey), HandshakeError> {
    let mut rng = OsRng;

    if initiator {
        send_public_key(stream, local_asym)?;
        let peer_key = recv_public_key(stream)?;

        let mine = KeyOffer {
            out: SymProvider::generate(&mut rng).key_material(),
            in_: SymProvider::generate(&mut rng).key_material(),
        };
        send_offer(stream, &peer_key, &mine)?;

        let theirs = recv_offer(stream, local_asym)?;
        let encryptor = SymProvider::new(theirs.in_);
        let decryptor = SymProvider::new(theirs.out);
        Ok((encryptor, decryptor, peer_key))
    } else {
        let peer_key = recv_public_key(stream)?;
        send_public_key(stream, local_asym)?;

        let theirs = recv_offer(stream, local_asym)?;
        let encryptor = SymProvider::new(theirs.in_);
        let decryptor = SymProvider::new(theirs.out);

        let mine = KeyOffer {
            out: SymProvider::generate(&mut rng).key_material(),
            in_: SymProvider::generate(&mut rng).key_material(),
        };
        send_offer(stream, &peer_key, &mine)?;

        Ok((encryptor, decryptor, peer_key))
    }
}

/// Starts a partial handshake (a rekey of one direction). Generates the
/// new key material, sends it wrapped to `peer_key`, then waits for the
/// peer's echo and confirms it matches before returning. The caller
/// installs the returned material into whichever slot the rekeyed
/// direction maps to.
pub fn initiate_partial<S: Read + Write>(
    stream: &mut S,
    local_asym: &AsymHelper,
    peer_key: &PeerKey,
) -> Result<KeyMaterial, HandshakeError> {
    let mut rng = OsRng;
    let fresh = SymProvider::generate(&mut rng).key_material();

    let plaintext = bincode::serialize(&fresh)?;
    let line = AsymHelper::encrypt_to_peer(peer_key, &plaintext)?;
    write_line(stream, &line)?;

    let echoed_line = read_line(stream)?;
    let echoed_plaintext = local_asym.decrypt_from_base64(&echoed_line)?;
    let echoed: KeyMaterial = bincode::deserialize(&echoed_plaintext)?;

    if echoed.key != fresh.key || echoed.nonce != fresh.nonce {
        return Err(HandshakeError::EchoMismatch);
    }
    Ok(fresh)
}

/// Completes the responder side of a partial handshake. `received_line`
/// is the already-dispatched `InitPartialHandshake` payload; this
/// function only needs to write the echo, not read the opening message
/// itself.
pub fn respond_to_partial<W: Write>(
    stream: &mut W,
    local_asym: &AsymHelper,
    peer_key: &PeerKey,
    received_line: &str,
) -> Result<KeyMaterial, HandshakeError> {
    let plaintext = local_asym.decrypt_from_base64(received_line)?;
    let material: KeyMaterial = bincode::deserialize(&plaintext)?;

    let echo_plaintext = bincode::serialize(&material)?;
    let echo_line = AsymHelper::encrypt_to_peer(peer_key, &echo_plaintext)?;
    write_line(stream, &echo_line)?;

    Ok(material)
}

#[cfg(test)]
mod test_handshake {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        (server, client.join().unwrap())
    }

    #[test]
    fn full_handshake_yields_crossed_keys() {
        let (mut resp_sock, mut init_sock) = socket_pair();
        let initiator_asym = AsymHelper::generate().unwrap();
        let responder_asym = AsymHelper::generate().unwrap();

        let responder = thread::spawn(move || run_full_handshake(&mut resp_sock, &responder_asym, false).unwrap());
        let (init_encryptor_material, init_decryptor_material) = {
            let (mut enc, mut dec, _peer_key) = run_full_handshake(&mut init_sock, &initiator_asym, true).unwrap();
            (enc.key_material(), dec.key_material())
        };
        let (mut resp_enc, mut resp_dec, _resp_peer_key) = responder.join().unwrap();

        // What the initiator encrypts with, the responder must decrypt
        // with, and vice versa.
        assert_eq!(init_encryptor_material.key, resp_dec.key_material().key);
        assert_eq!(init_decryptor_material.key, resp_enc.key_material().key);

        let probe = b"probe payload";
        let ciphertext = SymProvider::new(init_encryptor_material).encrypt(probe);
        assert_eq!(resp_dec.decrypt(&ciphertext), probe);
        let reply = resp_enc.encrypt(probe);
        assert_eq!(SymProvider::new(init_decryptor_material).decrypt(&reply), probe);
    }

    #[test]
    fn partial_handshake_echo_round_trips_key_material() {
        let (mut resp_sock, mut init_sock) = socket_pair();
        let initiator_asym = AsymHelper::generate().unwrap();
        let responder_asym = AsymHelper::generate().unwrap();
        let initiator_peer_key =
            AsymHelper::import_peer(&responder_asym.public_key_blob().unwrap()).unwrap();
        let responder_peer_key =
            AsymHelper::import_peer(&initiator_asym.public_key_blob().unwrap()).unwrap();

        let responder = thread::spawn(move || {
            let received = read_line(&mut resp_sock).unwrap();
            respond_to_partial(&mut resp_sock, &responder_asym, &responder_peer_key, &received).unwrap()
        });

        let initiator_view = initiate_partial(&mut init_sock, &initiator_asym, &initiator_peer_key).unwrap();
        let responder_view = responder.join().unwrap();

        assert_eq!(initiator_view.key, responder_view.key);
        assert_eq!(initiator_view.nonce, responder_view.nonce);
    }

    #[test]
    fn partial_handshake_rejects_tampered_echo() {
        let local_asym = AsymHelper::generate().unwrap();
        let peer_asym = AsymHelper::generate().unwrap();
        let peer_key = AsymHelper::import_peer(&peer_asym.public_key_blob().unwrap()).unwrap();

        // Build a stream that echoes back an unrelated key instead of the
        // one it was sent; `initiate_partial` must refuse it. The echo is
        // wrapped to `local_asym`'s own key, since that's what it will try
        // to decrypt with.
        let local_peer_key = AsymHelper::import_peer(&local_asym.public_key_blob().unwrap()).unwrap();
        let mut rng = OsRng;
        let other = SymProvider::generate(&mut rng).key_material();
        let wrong_echo =
            AsymHelper::encrypt_to_peer(&local_peer_key, &bincode::serialize(&other).unwrap()).unwrap();

        struct FixedEcho<'a> {
            sent: Vec<u8>,
            reply: &'a [u8],
            read_pos: usize,
        }
        impl<'a> Read for FixedEcho<'a> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let remaining = &self.reply[self.read_pos..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                self.read_pos += n;
                Ok(n)
            }
        }
        impl<'a> Write for FixedEcho<'a> {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.sent.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut reply_line = wrong_echo.into_bytes();
        reply_line.push(b'\n');
        let mut stream = FixedEcho { sent: Vec::new(), reply: &reply_line, read_pos: 0 };

        let err = initiate_partial(&mut stream, &local_asym, &peer_key).unwrap_err();
        assert!(matches!(err, HandshakeError::EchoMismatch));
    }
}
