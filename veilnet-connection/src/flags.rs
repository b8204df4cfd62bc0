use bitflags::bitflags;

bitflags! {
    /// Run-time state, mutated only under the connection lock except for
    /// the reader thread's own private checks. `IS_CONNECTED` additionally
    /// lives in an `AtomicBool` fast path (see `Connection::connected`) so
    /// `send_packet` can check it without taking the lock.
    ///
    /// `DISCONNECT_RECEIVED` is its own bit rather than the `0x30`
    /// alias of `IS_BLOCKING | DONT_THROW_ON_ABORTED` carried by the
    /// system this was ported from; that overlap looks like a copy-paste
    /// bug upstream, not an intended flag combination.
    pub struct RunFlags: u8 {
        const RUN                        = 0b0000_0001;
        const IS_CONNECTED               = 0b0000_0010;
        const LOCAL_HANDSHAKE_REQUESTED  = 0b0000_0100;
        const IS_BLOCKING                = 0b0000_1000;
        const DONT_THROW_ON_ABORTED      = 0b0001_0000;
        const DISCONNECT_RECEIVED        = 0b0010_0000;
    }
}

impl RunFlags {
    /// Flags set on a freshly wrapped, successfully handshaken connection.
    pub fn initial() -> Self {
        RunFlags::RUN | RunFlags::IS_CONNECTED
    }
}

bitflags! {
    /// User-settable delivery/visibility policy, mutated only under the
    /// connection lock because flipping `MANUAL_READ` migrates queued
    /// packets between the push and pull delivery paths.
    pub struct ConfigFlags: u8 {
        /// Internally handled control packets are also surfaced to the
        /// consumer instead of being silently absorbed.
        const PASS_ON     = 0b0000_0001;
        /// Packets are delivered by pull (`read_packet`) rather than push
        /// (the registered callback).
        const MANUAL_READ = 0b0000_0010;
    }
}

#[cfg(test)]
mod test_flags {
    use super::*;

    #[test]
    fn initial_run_flags_are_run_and_connected_only() {
        let flags = RunFlags::initial();
        assert!(flags.contains(RunFlags::RUN));
        assert!(flags.contains(RunFlags::IS_CONNECTED));
        assert!(!flags.contains(RunFlags::IS_BLOCKING));
        assert!(!flags.contains(RunFlags::DISCONNECT_RECEIVED));
    }

    #[test]
    fn disconnect_received_does_not_alias_other_bits() {
        let combined = RunFlags::IS_BLOCKING | RunFlags::DONT_THROW_ON_ABORTED;
        assert!(!combined.contains(RunFlags::DISCONNECT_RECEIVED));
        assert_ne!(RunFlags::DISCONNECT_RECEIVED.bits(), combined.bits());
    }
}
