use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use veilnet_asym::{AsymError, AsymHelper, PeerKey};
use veilnet_cipher::SymProvider;
use veilnet_handshake::{self, HandshakeError};
use veilnet_wire::{read_encrypted_packet, type_id, write_encrypted_packet, ConnectionId, Packet, WireError};

use crate::channel::PacketChannel;
use crate::collab::{Dispatcher, DisconnectReason, InlineDispatcher, Logger, NopLogger};
use crate::config::ConnectionConfig;
use crate::delivery::{Callback, Delivery};
use crate::flags::{ConfigFlags, RunFlags};

/// spec.md §4.F: consecutive null-packet reads tolerated before the
/// reader declares the transport fatally corrupted.
const MAX_READ_ERRORS: u32 = 5;

/// spec.md §7: errors tolerated while draining after a peer
/// `DisconnectNotification`.
const DRAIN_MAX_ERRORS: u32 = 4;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("asymmetric layer error: {0}")]
    Asym(#[from] AsymError),
    #[error("not connected")]
    NotConnected,
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

struct ReadHalf {
    stream: TcpStream,
    decryptor: SymProvider,
}

struct WriteHalf {
    stream: TcpStream,
    encryptor: SymProvider,
}

/// State mutated only under the connection lock (spec.md §4.G), aside
/// from `Delivery`'s own interior mutability and the `is_connected`
/// atomic kept alongside it on `Connection` for the lock-free fast path.
struct ConnState {
    run_flags: RunFlags,
    config_flags: ConfigFlags,
    connection_id: ConnectionId,
    remote_id: Option<ConnectionId>,
    last_handshake: Instant,
    local_asym: AsymHelper,
    peer_key: PeerKey,
}

/// An encrypted, handshaken, point-to-point TCP connection. Constructed
/// exclusively via [`Connection::wrap`] or [`Connection::connect_to`];
/// both run the full handshake before any other state exists.
pub struct Connection {
    read_half: Mutex<ReadHalf>,
    write_half: Mutex<WriteHalf>,
    state: Mutex<ConnState>,
    delivery: Delivery,
    is_connected: AtomicBool,
    local_endpoint: SocketAddr,
    remote_endpoint: SocketAddr,
    logger: Arc<dyn Logger>,
    dispatcher: Arc<dyn Dispatcher>,
    disconnected_callback: Mutex<Option<Box<dyn Fn(DisconnectReason) + Send>>>,
    config: ConnectionConfig,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Dials `addr` and wraps the resulting socket as the handshake
    /// initiator.
    pub fn connect_to<A: ToSocketAddrs>(addr: A, config: ConnectionConfig) -> Result<Arc<Self>, ConnectionError> {
        let stream = TcpStream::connect(addr)?;
        Self::wrap(stream, true, config, None, None)
    }

    /// Wraps an already-connected socket. `initiator` decides which side
    /// speaks first during the opening full handshake; the accepting end
    /// of a listener should pass `false`.
    pub fn wrap(
        socket: TcpStream,
        initiator: bool,
        config: ConnectionConfig,
        logger: Option<Arc<dyn Logger>>,
        dispatcher: Option<Arc<dyn Dispatcher>>,
    ) -> Result<Arc<Self>, ConnectionError> {
        socket.set_nodelay(true).ok();
        socket.set_read_timeout(Some(config.read_timeout))?;
        socket.set_write_timeout(Some(config.write_timeout))?;

        let local_endpoint = socket.local_addr()?;
        let remote_endpoint = socket.peer_addr()?;
        let logger: Arc<dyn Logger> = logger.unwrap_or_else(|| Arc::new(NopLogger));
        let dispatcher: Arc<dyn Dispatcher> = dispatcher.unwrap_or_else(|| Arc::new(InlineDispatcher));

        let local_asym = AsymHelper::generate()?;

        logger.info("starting full handshake");
        let mut handshake_sock = socket.try_clone()?;
        let (encryptor, decryptor, peer_key) =
            veilnet_handshake::run_full_handshake(&mut handshake_sock, &local_asym, initiator)?;
        logger.info("full handshake complete");

        let read_stream = socket.try_clone()?;
        let write_stream = socket.try_clone()?;

        let conn = Arc::new(Connection {
            read_half: Mutex::new(ReadHalf { stream: read_stream, decryptor }),
            write_half: Mutex::new(WriteHalf { stream: write_stream, encryptor }),
            state: Mutex::new(ConnState {
                run_flags: RunFlags::initial(),
                config_flags: ConfigFlags::empty(),
                connection_id: ConnectionId::generate(),
                remote_id: None,
                last_handshake: Instant::now(),
                local_asym,
                peer_key,
            }),
            delivery: Delivery::new(),
            is_connected: AtomicBool::new(true),
            local_endpoint,
            remote_endpoint,
            logger,
            dispatcher,
            disconnected_callback: Mutex::new(None),
            config,
            reader_handle: Mutex::new(None),
        });

        conn.send_connection_id_exchange()?;

        let reader_conn = conn.clone();
        let handle = thread::spawn(move || reader_conn.reader_loop());
        *conn.reader_handle.lock().unwrap() = Some(handle);

        Ok(conn)
    }

    // ---- consumer-facing properties ----

    pub fn connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.state.lock().unwrap().connection_id
    }

    pub fn remote_id(&self) -> Option<ConnectionId> {
        self.state.lock().unwrap().remote_id
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    pub fn last_handshake(&self) -> Instant {
        self.state.lock().unwrap().last_handshake
    }

    pub fn max_key_age(&self) -> Duration {
        self.config.max_key_age
    }

    pub fn max_age_skew(&self) -> Duration {
        self.config.max_age_skew
    }

    // ---- configuration flags ----

    pub fn set_flag(&self, flag: ConfigFlags) {
        let mut state = self.state.lock().unwrap();
        let was_manual = state.config_flags.contains(ConfigFlags::MANUAL_READ);
        state.config_flags.insert(flag);
        if !was_manual && state.config_flags.contains(ConfigFlags::MANUAL_READ) {
            self.delivery.enable_manual_read();
        }
    }

    pub fn unset_flag(&self, flag: ConfigFlags) {
        let mut state = self.state.lock().unwrap();
        let was_manual = state.config_flags.contains(ConfigFlags::MANUAL_READ);
        state.config_flags.remove(flag);
        if was_manual && !state.config_flags.contains(ConfigFlags::MANUAL_READ) {
            self.delivery.disable_manual_read();
        }
    }

    fn pass_on(&self) -> bool {
        self.state.lock().unwrap().config_flags.contains(ConfigFlags::PASS_ON)
    }

    // ---- delivery registration ----

    pub fn set_packet_received_callback<F>(&self, callback: F)
    where
        F: Fn(Packet, usize) + Send + Sync + 'static,
    {
        self.delivery.set_callback(Arc::new(callback) as Callback);
    }

    pub fn set_disconnected_callback<F>(&self, callback: F)
    where
        F: Fn(DisconnectReason) + Send + 'static,
    {
        *self.disconnected_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Blocks (cooperative 1 ms poll) until a packet is available, per
    /// spec.md §4.F. Returns `None` once the connection has been torn
    /// down and no more packets will ever arrive.
    pub fn read_packet(&self) -> Option<(Packet, usize)> {
        let still_running = || self.connected();
        self.delivery.read_packet_blocking(&still_running)
    }

    // ---- sending ----

    pub fn send_packet(&self, packet: &Packet) -> Result<usize, ConnectionError> {
        if !self.connected() {
            return Err(ConnectionError::NotConnected);
        }
        let mut write_half = self.write_half.lock().unwrap();
        Ok(write_encrypted_packet(&mut write_half.stream, &mut write_half.encryptor, packet)?)
    }

    fn send_connection_id_exchange(&self) -> Result<(), ConnectionError> {
        let id_bytes = *self.state.lock().unwrap().connection_id.as_bytes();
        self.send_packet(&Packet::new(type_id::CONNECTION_ID_EXCHANGE, id_bytes.to_vec()))?;
        Ok(())
    }

    /// Local, cooperative teardown: notifies the peer if still connected,
    /// half-closes the socket, and clears run state. Does not invoke the
    /// local disconnect callback; that callback reports conditions the
    /// consumer didn't itself initiate, mirroring spec.md §7's "Reported"
    /// band, which only ever fires from the reader loop.
    pub fn close(&self) {
        if self.connected() {
            let _ = self.send_packet(&Packet::new(type_id::DISCONNECT_NOTIFICATION, Vec::new()));
        }
        self.is_connected.store(false, Ordering::Release);
        {
            let mut state = self.state.lock().unwrap();
            state.run_flags.remove(RunFlags::RUN | RunFlags::IS_CONNECTED);
        }
        let read_half = self.read_half.lock().unwrap();
        let _ = read_half.stream.shutdown(std::net::Shutdown::Both);
    }

    // ---- reader thread ----

    fn still_running(&self) -> bool {
        self.state.lock().unwrap().run_flags.contains(RunFlags::RUN) && self.connected()
    }

    fn reader_loop(self: Arc<Self>) {
        let mut read_errors: u32 = 0;

        while self.still_running() && read_errors < MAX_READ_ERRORS {
            let outcome = {
                let mut read_half = self.read_half.lock().unwrap();
                read_encrypted_packet(&mut read_half.stream, &mut read_half.decryptor)
            };

            let (packet, wire_len) = match outcome {
                Ok(pair) => pair,
                Err(err) if err.is_timeout() => {
                    if !self.check_session_key_expiry() {
                        return;
                    }
                    continue;
                }
                Err(WireError::Decode(_)) => {
                    if self.socket_has_readable_byte() {
                        read_errors += 1;
                        self.logger.warn("decrypted payload failed to parse as a packet; retrying");
                        continue;
                    } else {
                        self.logger.info("peer closed the connection");
                        self.teardown(DisconnectReason::Graceful);
                        return;
                    }
                }
                Err(err) => {
                    self.logger.exception("fatal transport error in reader loop", &err);
                    self.teardown(DisconnectReason::Error);
                    return;
                }
            };
            read_errors = 0;

            if !self.dispatch_packet(packet, wire_len) {
                return;
            }

            if !self.check_session_key_expiry() {
                return;
            }
        }

        if read_errors >= MAX_READ_ERRORS {
            self.logger.error("too many consecutive corrupt frames; closing connection");
            self.teardown(DisconnectReason::Error);
        }
    }

    /// A 1 ms read-select stand-in: peeks whether the socket still has
    /// bytes ready without consuming them, to distinguish "peer sent
    /// garbage" from "peer went away" after a decode failure.
    fn socket_has_readable_byte(&self) -> bool {
        let read_half = self.read_half.lock().unwrap();
        match read_half.stream.set_read_timeout(Some(Duration::from_millis(1))) {
            Ok(()) => {}
            Err(_) => return false,
        }
        let mut probe = [0u8; 1];
        let readable = match read_half.stream.peek(&mut probe) {
            Ok(n) => n > 0,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut => false,
            Err(_) => false,
        };
        let _ = read_half.stream.set_read_timeout(Some(self.config.read_timeout));
        readable
    }

    /// Routes one decoded packet to its built-in handler (if any) and/or
    /// the consumer, per spec.md §4.F. Returns `false` if the reader loop
    /// should exit (the connection was torn down while handling it).
    fn dispatch_packet(&self, packet: Packet, wire_len: usize) -> bool {
        let handled = match packet.type_id {
            type_id::HANDSHAKE_REQUEST => {
                self.on_handshake_request();
                true
            }
            type_id::INIT_HANDSHAKE => {
                self.on_init_handshake(&packet);
                true
            }
            type_id::INIT_PARTIAL_HANDSHAKE => {
                self.on_init_partial_handshake(&packet);
                true
            }
            type_id::CANCEL_HANDSHAKE => {
                self.logger.debug("peer cancelled handshake");
                true
            }
            type_id::DISCONNECT_NOTIFICATION => {
                self.on_disconnect_notification();
                return false;
            }
            type_id::CONNECTION_ID_EXCHANGE => {
                self.on_connection_id_exchange(&packet);
                true
            }
            _ => false,
        };

        if !handled || self.pass_on() {
            self.delivery.deliver(self.dispatcher.as_ref(), packet, wire_len, &|| self.connected());
        }
        true
    }

    fn on_connection_id_exchange(&self, packet: &Packet) {
        if packet.data.len() != 16 {
            self.logger.warn("malformed ConnectionIDExchange payload");
            return;
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&packet.data);
        let peer_id = ConnectionId::from_bytes(bytes);

        let mut state = self.state.lock().unwrap();
        if peer_id == state.connection_id {
            state.connection_id = ConnectionId::generate();
            let new_id = *state.connection_id.as_bytes();
            drop(state);
            let _ = self.send_packet(&Packet::new(type_id::CONNECTION_ID_EXCHANGE, new_id.to_vec()));
        } else {
            state.remote_id = Some(peer_id);
        }
    }

    fn on_disconnect_notification(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.run_flags.insert(RunFlags::DISCONNECT_RECEIVED);
        }
        self.drain_after_disconnect();
        self.teardown(DisconnectReason::Graceful);
    }

    /// spec.md §7: tolerate up to `DRAIN_MAX_ERRORS` while mopping up
    /// whatever the peer had in flight when it announced disconnect.
    fn drain_after_disconnect(&self) {
        let mut errors = 0;
        while errors < DRAIN_MAX_ERRORS {
            let outcome = {
                let mut read_half = self.read_half.lock().unwrap();
                read_half.stream.set_read_timeout(Some(Duration::from_millis(1))).ok();
                read_encrypted_packet(&mut read_half.stream, &mut read_half.decryptor)
            };
            match outcome {
                Ok(_) => continue,
                Err(err) if err.is_timeout() => break,
                Err(_) => errors += 1,
            }
        }
    }

    fn teardown(&self, reason: DisconnectReason) {
        self.is_connected.store(false, Ordering::Release);
        {
            let mut state = self.state.lock().unwrap();
            state.run_flags.remove(RunFlags::RUN | RunFlags::IS_CONNECTED);
        }
        let read_half = self.read_half.lock().unwrap();
        let _ = read_half.stream.shutdown(std::net::Shutdown::Both);
        drop(read_half);

        if let Some(cb) = self.disconnected_callback.lock().unwrap().as_ref() {
            cb(reason);
        }
    }

    // ---- rekeying ----

    /// spec.md §4.F expiry scheduler, run once per reader iteration.
    /// Returns `false` if it closed the connection.
    fn check_session_key_expiry(&self) -> bool {
        let (age, requested, blocking) = {
            let state = self.state.lock().unwrap();
            (
                state.last_handshake.elapsed(),
                state.run_flags.contains(RunFlags::LOCAL_HANDSHAKE_REQUESTED),
                state.run_flags.contains(RunFlags::IS_BLOCKING),
            )
        };

        if age < self.config.max_key_age {
            return true;
        }

        // A tie-break loser is already waiting on the peer to drive the
        // rekey; don't send it a second HandshakeRequest in the meantime,
        // but still apply the same deadline as an outstanding request in
        // case the peer never follows through.
        if blocking {
            if age >= self.config.max_key_age + self.config.max_age_skew {
                self.logger.error("peer failed to rekey in time");
                self.teardown(DisconnectReason::Error);
                return false;
            }
            return true;
        }

        if requested {
            if age >= self.config.max_key_age + self.config.max_age_skew {
                self.logger.error("peer failed to rekey in time");
                self.teardown(DisconnectReason::Error);
                return false;
            }
            return true;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.run_flags.insert(RunFlags::LOCAL_HANDSHAKE_REQUESTED);
        }
        self.logger.debug("session key aged out; requesting rekey");
        let _ = self.send_packet(&Packet::new(type_id::HANDSHAKE_REQUEST, Vec::new()));
        true
    }

    /// A peer's `HandshakeRequest` arrived. If we already asked for one
    /// ourselves, resolve via the tie-break; otherwise, if our own key is
    /// still comfortably fresh, drive a partial handshake; otherwise run
    /// the full handshake (our key is aging too).
    fn on_handshake_request(&self) {
        let (age, local_requested, local_id) = {
            let state = self.state.lock().unwrap();
            (state.last_handshake.elapsed(), state.run_flags.contains(RunFlags::LOCAL_HANDSHAKE_REQUESTED), state.connection_id)
        };

        if local_requested {
            let remote_id = self.state.lock().unwrap().remote_id;
            if let Some(remote_id) = remote_id {
                if local_id < remote_id {
                    self.logger.debug("rekey tie-break: deferring to peer");
                    let mut state = self.state.lock().unwrap();
                    state.run_flags.remove(RunFlags::LOCAL_HANDSHAKE_REQUESTED);
                    // Awaiting the peer's full rekey, which will clear this
                    // and advance last_handshake; suppress re-requesting in
                    // the meantime.
                    state.run_flags.insert(RunFlags::IS_BLOCKING);
                    return;
                }
            }
            self.logger.debug("rekey tie-break: driving full handshake");
            self.run_full_rekey();
            return;
        }

        if age + self.config.max_age_skew < self.config.max_key_age {
            self.logger.debug("responding to peer rekey request with a partial handshake");
            self.respond_partial_rekey();
        } else {
            self.logger.debug("our key is aging too; running full handshake");
            self.run_full_rekey();
        }
    }

    /// Drives a full rekey as the handshake's initiator, riding over the
    /// still-live cipher as ordinary `InitHandshake` control packets,
    /// the same `PacketChannel` trick that lets a partial handshake share
    /// the connection's packet pipe instead of bypassing it, since the
    /// peer's reader loop is the only thing dispatching frames to the
    /// other side's matching handler. A raw-socket exchange (as the
    /// initial `wrap()` uses) would require both reader loops to drop
    /// out of packet framing in lockstep, which nothing here coordinates.
    fn run_full_rekey(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.run_flags.insert(RunFlags::IS_BLOCKING);
        }

        let local_asym = match AsymHelper::generate() {
            Ok(asym) => asym,
            Err(err) => {
                self.logger.exception("failed to generate ephemeral keypair for rekey", &err);
                self.clear_blocking_and_request();
                return;
            }
        };

        let mut read_half = self.read_half.lock().unwrap();
        let mut write_half = self.write_half.lock().unwrap();

        let mut channel = PacketChannel::new(
            &mut read_half.stream,
            &mut write_half.stream,
            &mut read_half.decryptor,
            &mut write_half.encryptor,
            type_id::INIT_HANDSHAKE,
            type_id::INIT_HANDSHAKE,
        );
        let result = veilnet_handshake::run_full_handshake(&mut channel, &local_asym, true);
        let _ = channel.flush();

        drop(write_half);
        drop(read_half);
        self.finish_full_rekey(result, local_asym, "initiator");
    }

    /// Responder side of a peer-driven full rekey: `packet` is the
    /// `InitHandshake` control packet the reader loop already dispatched,
    /// carrying the peer's first handshake line.
    fn on_init_handshake(&self, packet: &Packet) {
        {
            let mut state = self.state.lock().unwrap();
            state.run_flags.insert(RunFlags::IS_BLOCKING);
        }

        let local_asym = match AsymHelper::generate() {
            Ok(asym) => asym,
            Err(err) => {
                self.logger.exception("failed to generate ephemeral keypair for rekey", &err);
                self.clear_blocking_and_request();
                return;
            }
        };

        let mut read_half = self.read_half.lock().unwrap();
        let mut write_half = self.write_half.lock().unwrap();

        let mut channel = PacketChannel::new(
            &mut read_half.stream,
            &mut write_half.stream,
            &mut read_half.decryptor,
            &mut write_half.encryptor,
            type_id::INIT_HANDSHAKE,
            type_id::INIT_HANDSHAKE,
        );
        channel.seed_input(packet.data.clone());
        let result = veilnet_handshake::run_full_handshake(&mut channel, &local_asym, false);
        let _ = channel.flush();

        drop(write_half);
        drop(read_half);
        self.finish_full_rekey(result, local_asym, "responder");
    }

    fn finish_full_rekey(
        &self,
        result: Result<(SymProvider, SymProvider, PeerKey), HandshakeError>,
        local_asym: AsymHelper,
        role: &str,
    ) {
        match result {
            Ok((mut encryptor, mut decryptor, peer_key)) => {
                encryptor.reset();
                decryptor.reset();
                let mut write_half = self.write_half.lock().unwrap();
                write_half.encryptor = encryptor;
                drop(write_half);
                let mut read_half = self.read_half.lock().unwrap();
                read_half.decryptor = decryptor;
                drop(read_half);

                let mut state = self.state.lock().unwrap();
                state.local_asym = local_asym;
                state.peer_key = peer_key;
                state.last_handshake = Instant::now();
                state.run_flags.remove(RunFlags::IS_BLOCKING | RunFlags::LOCAL_HANDSHAKE_REQUESTED);
                self.logger.info(&format!("full rekey ({role}) complete"));
            }
            Err(err) => {
                self.logger.exception(&format!("full rekey ({role}) failed"), &err);
                self.clear_blocking_and_request();
            }
        }
    }

    fn clear_blocking_and_request(&self) {
        let mut state = self.state.lock().unwrap();
        state.run_flags.remove(RunFlags::IS_BLOCKING | RunFlags::LOCAL_HANDSHAKE_REQUESTED);
    }

    /// Responder side of a partial handshake: the `InitPartialHandshake`
    /// packet has already been dispatched to us by the reader loop with
    /// its payload in `packet.data`; this only needs to echo a fresh key
    /// and install it as the *encryptor* (we are the sender of the
    /// direction being rotated).
    fn on_init_partial_handshake(&self, packet: &Packet) {
        let received_line = match std::str::from_utf8(&packet.data) {
            Ok(s) => s.to_string(),
            Err(_) => {
                self.logger.warn("InitPartialHandshake payload was not valid UTF-8");
                return;
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            state.run_flags.insert(RunFlags::IS_BLOCKING);
        }

        let mut read_half = self.read_half.lock().unwrap();
        let mut write_half = self.write_half.lock().unwrap();

        let result = {
            let state = self.state.lock().unwrap();
            let mut channel = PacketChannel::new(
                &mut read_half.stream,
                &mut write_half.stream,
                &mut read_half.decryptor,
                &mut write_half.encryptor,
                type_id::END_PARTIAL_HANDSHAKE,
                type_id::END_PARTIAL_HANDSHAKE,
            );
            let result = veilnet_handshake::respond_to_partial(&mut channel, &state.local_asym, &state.peer_key, &received_line);
            let _ = channel.flush();
            result
        };

        drop(write_half);
        drop(read_half);

        match result {
            Ok(new_material) => {
                let mut new_encryptor = SymProvider::new(new_material);
                new_encryptor.reset();
                let mut write_half = self.write_half.lock().unwrap();
                write_half.encryptor = new_encryptor;
                drop(write_half);

                let mut state = self.state.lock().unwrap();
                state.last_handshake = Instant::now();
                state.run_flags.remove(RunFlags::IS_BLOCKING);
                self.logger.info("partial rekey (responder) complete");
            }
            Err(err) => {
                self.logger.exception("partial rekey (responder) failed", &err);
                self.clear_blocking_and_request();
            }
        }
    }

    /// Initiator side of a partial handshake, driven from the expiry
    /// scheduler. Rotates our *decryptor*; we are the side that will
    /// receive on the direction being rotated.
    fn respond_partial_rekey(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.run_flags.insert(RunFlags::IS_BLOCKING | RunFlags::LOCAL_HANDSHAKE_REQUESTED);
        }

        let mut read_half = self.read_half.lock().unwrap();
        let mut write_half = self.write_half.lock().unwrap();

        let result = {
            let state = self.state.lock().unwrap();
            let mut channel = PacketChannel::new(
                &mut read_half.stream,
                &mut write_half.stream,
                &mut read_half.decryptor,
                &mut write_half.encryptor,
                type_id::INIT_PARTIAL_HANDSHAKE,
                type_id::END_PARTIAL_HANDSHAKE,
            );
            veilnet_handshake::initiate_partial(&mut channel, &state.local_asym, &state.peer_key)
        };

        drop(write_half);
        drop(read_half);

        match result {
            Ok(new_material) => {
                let mut new_decryptor = SymProvider::new(new_material);
                new_decryptor.reset();
                let mut read_half = self.read_half.lock().unwrap();
                read_half.decryptor = new_decryptor;
                drop(read_half);

                let mut state = self.state.lock().unwrap();
                state.last_handshake = Instant::now();
                state.run_flags.remove(RunFlags::IS_BLOCKING | RunFlags::LOCAL_HANDSHAKE_REQUESTED);
                self.logger.info("partial rekey (initiator) complete");
            }
            Err(err) => {
                self.logger.exception("partial rekey (initiator) failed", &err);
                self.clear_blocking_and_request();
            }
        }
    }
}

#[cfg(test)]
mod test_connection {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig::default()
            .with_max_key_age(StdDuration::from_secs(3600))
            .with_socket_timeouts(StdDuration::from_millis(200), StdDuration::from_millis(200))
    }

    /// Spins up both ends of a handshaken connection over a real loopback
    /// socket, the same way the server and a dialing client would.
    fn connect_pair() -> (Arc<Connection>, Arc<Connection>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            Connection::wrap(socket, false, test_config(), None, None).unwrap()
        });

        let client_socket = TcpStream::connect(addr).unwrap();
        let client = Connection::wrap(client_socket, true, test_config(), None, None).unwrap();
        let server = server.join().unwrap();
        (client, server)
    }

    fn wait_until<F: Fn() -> bool>(cond: F, timeout: StdDuration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(StdDuration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn push_mode_delivers_sent_packet_to_callback() {
        let (client, server) = connect_pair();

        let (tx, rx) = mpsc::channel();
        server.set_packet_received_callback(move |packet, _wire_len| {
            let _ = tx.send(packet);
        });

        client.send_packet(&Packet::new(1000, b"hello veilnet".to_vec())).unwrap();

        let received = rx.recv_timeout(StdDuration::from_secs(2)).expect("packet never arrived");
        assert_eq!(received.type_id, 1000);
        assert_eq!(received.data, b"hello veilnet");

        client.close();
        server.close();
    }

    #[test]
    fn manual_read_mode_delivers_via_read_packet() {
        let (client, server) = connect_pair();
        server.set_flag(ConfigFlags::MANUAL_READ);

        client.send_packet(&Packet::new(2000, b"pulled".to_vec())).unwrap();

        let (packet, _) = server.read_packet().expect("connection closed before packet arrived");
        assert_eq!(packet.type_id, 2000);
        assert_eq!(packet.data, b"pulled");

        client.close();
        server.close();
    }

    #[test]
    fn connection_id_exchange_learns_a_distinct_remote_id() {
        let (client, server) = connect_pair();

        let both_learned = wait_until(
            || client.remote_id().is_some() && server.remote_id().is_some(),
            StdDuration::from_secs(2),
        );
        assert!(both_learned, "both sides should learn the peer's connection id");
        assert_eq!(client.remote_id(), Some(server.connection_id()));
        assert_eq!(server.remote_id(), Some(client.connection_id()));

        client.close();
        server.close();
    }

    #[test]
    fn closing_one_side_disconnects_the_peer() {
        let (client, server) = connect_pair();
        assert!(client.connected());
        assert!(server.connected());

        client.close();

        let peer_saw_it = wait_until(|| !server.connected(), StdDuration::from_secs(2));
        assert!(peer_saw_it, "peer should observe the disconnect notification");
    }

    #[test]
    fn sending_after_close_is_rejected() {
        let (client, server) = connect_pair();
        client.close();

        let err = client.send_packet(&Packet::new(1, vec![])).unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected));

        server.close();
    }

    #[test]
    fn disconnected_callback_fires_on_graceful_peer_disconnect() {
        let (client, server) = connect_pair();
        let notified = Arc::new(AtomicBool::new(false));
        let notified_clone = notified.clone();
        server.set_disconnected_callback(move |reason| {
            notified_clone.store(reason == DisconnectReason::Graceful, Ordering::SeqCst);
        });

        client.close();

        let fired = wait_until(|| notified.load(Ordering::SeqCst), StdDuration::from_secs(2));
        assert!(fired, "disconnected callback should have fired with Graceful");
    }
}
