//! A small end-to-end exercise of the veilnet connection stack: wraps a
//! TCP socket, logs handshake/rekey/disconnect events, and echoes back
//! whatever payload it receives.
//!
//! ```text
//! echo_peer listen 127.0.0.1:9000
//! echo_peer connect 127.0.0.1:9000
//! ```

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use veilnet_connection::{Connection, ConnectionConfig, DisconnectReason, Packet, StdLogger};

const ECHO_TYPE_ID: u32 = 1;

fn install_echo(conn: &Arc<Connection>) {
    let echo_conn = conn.clone();
    conn.set_packet_received_callback(move |packet, wire_len| {
        log::info!("received {} bytes (wire {wire_len}) on type {}", packet.data.len(), packet.type_id);
        if packet.type_id == ECHO_TYPE_ID {
            if let Err(err) = echo_conn.send_packet(&Packet::new(ECHO_TYPE_ID, packet.data)) {
                log::warn!("failed to echo payload back: {err}");
            }
        }
    });

    conn.set_disconnected_callback(|reason| match reason {
        DisconnectReason::Graceful => log::info!("peer disconnected gracefully"),
        DisconnectReason::Error => log::warn!("connection tore down on error"),
    });
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_default();
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:9000".to_string());

    let config = ConnectionConfig::default();
    let logger = Arc::new(StdLogger);

    let conn = match mode.as_str() {
        "listen" => {
            let listener = TcpListener::bind(&addr).expect("failed to bind listener");
            log::info!("listening on {addr}");
            let (socket, peer) = listener.accept().expect("accept failed");
            log::info!("accepted connection from {peer}");
            Connection::wrap(socket, false, config, Some(logger), None).expect("handshake failed")
        }
        "connect" => {
            let socket = TcpStream::connect(&addr).expect("connect failed");
            log::info!("connected to {addr}");
            Connection::wrap(socket, true, config, Some(logger), None).expect("handshake failed")
        }
        other => {
            eprintln!("usage: echo_peer <listen|connect> [addr]  (got {other:?})");
            std::process::exit(2);
        }
    };

    install_echo(&conn);

    if mode == "connect" {
        conn.send_packet(&Packet::new(ECHO_TYPE_ID, b"hello from veilnet".to_vec())).expect("send failed");
    }

    while conn.connected() {
        std::thread::sleep(Duration::from_millis(200));
    }
    log::info!("connection closed, exiting");
}
