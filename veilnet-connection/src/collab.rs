//! External collaborator interfaces named by spec.md §6: `Logger`,
//! `PacketCodec`, and the "captured cooperative dispatch context" used to
//! trampoline delivery callbacks. `SymProvider`/`AsymHelper` are the
//! traits' namesakes in `veilnet-cipher`/`veilnet-asym` and are used
//! directly rather than re-wrapped here.

use veilnet_wire::{Packet, WireError};

/// Why a connection stopped delivering packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent `DisconnectNotification` and both sides closed cleanly.
    Graceful,
    /// A fatal transport or protocol error tore the connection down.
    Error,
}

/// Structured logging collaborator. A consumer can register one; internal
/// code also always emits `log` crate statements at the same call sites
/// regardless of whether a `Logger` is registered, so the crate stays
/// observable without any consumer wiring.
pub trait Logger: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
    fn critical(&self, message: &str);
    fn exception(&self, message: &str, err: &dyn std::error::Error);
}

/// Discards everything. The default when no `Logger` is registered.
pub struct NopLogger;

impl Logger for NopLogger {
    fn debug(&self, _message: &str) {}
    fn info(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
    fn critical(&self, _message: &str) {}
    fn exception(&self, _message: &str, _err: &dyn std::error::Error) {}
}

/// Forwards to the `log` facade crate.
pub struct StdLogger;

impl Logger for StdLogger {
    fn debug(&self, message: &str) {
        log::debug!("{message}");
    }
    fn info(&self, message: &str) {
        log::info!("{message}");
    }
    fn warn(&self, message: &str) {
        log::warn!("{message}");
    }
    fn error(&self, message: &str) {
        log::error!("{message}");
    }
    fn critical(&self, message: &str) {
        log::error!("[critical] {message}");
    }
    fn exception(&self, message: &str, err: &dyn std::error::Error) {
        log::error!("{message}: {err}");
    }
}

/// Mirrors spec.md §6's `PacketCodec` collaborator; `veilnet_wire::Packet`
/// already implements this shape inherently, this trait exists so the
/// connection core can be generic over it if a consumer ever wants a
/// different wire representation.
pub trait PacketCodec {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, WireError>;
    fn decode(&self, bytes: &[u8]) -> Result<Packet, WireError>;
}

/// Default codec, delegating to `Packet`'s own bincode serialization.
pub struct BincodeCodec;

impl PacketCodec for BincodeCodec {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, WireError> {
        packet.serialize()
    }
    fn decode(&self, bytes: &[u8]) -> Result<Packet, WireError> {
        Packet::deserialize(bytes)
    }
}

/// The "captured cooperative dispatch context" of spec.md §4.F/§9: a
/// trampoline that runs a delivered-packet or disconnect callback on
/// whatever context the consumer prefers. The default, `InlineDispatcher`,
/// just calls it on the calling thread (almost always the reader thread).
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: Box<dyn FnOnce() + Send>);
}

pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

#[cfg(test)]
mod test_collab {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn nop_logger_swallows_everything() {
        let logger = NopLogger;
        logger.info("should not panic or print");
    }

    #[test]
    fn inline_dispatcher_runs_job_synchronously() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        InlineDispatcher.dispatch(Box::new(move || ran_clone.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn bincode_codec_round_trips_packet() {
        let codec = BincodeCodec;
        let packet = Packet::new(42, vec![1, 2, 3]);
        let bytes = codec.encode(&packet).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), packet);
    }
}
