use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use veilnet_wire::Packet;

use crate::collab::Dispatcher;

/// Capacity shared by both delivery disciplines' bounded queues
/// (spec.md §4.F: "capacity 20").
pub const QUEUE_CAPACITY: usize = 20;

/// How long the reader sleeps between retries while a queue is full;
/// the intended backpressure choke signal (spec.md §4.F: "~10 ms").
const PUSH_BACKOFF: Duration = Duration::from_millis(10);

/// How often `read_packet` polls an empty queue (spec.md §4.F:
/// "cooperative 1 ms poll").
const POP_POLL: Duration = Duration::from_millis(1);

pub type Callback = Arc<dyn Fn(Packet, usize) + Send + Sync>;

/// A bounded FIFO of `(packet, wire_byte_count)`. Used both as the
/// `ManualRead` pull queue and, when no callback is registered, as the
/// pending-events queue; the same object serves both roles, so toggling
/// `ManualRead` never needs to physically move entries between two
/// queues to keep FIFO order; it only changes how new arrivals and reads
/// are handled.
struct PacketQueue {
    items: Mutex<VecDeque<(Packet, usize)>>,
}

impl PacketQueue {
    fn new() -> Self {
        PacketQueue { items: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)) }
    }

    fn try_push(&self, item: (Packet, usize)) -> Result<(), (Packet, usize)> {
        let mut items = self.items.lock().unwrap();
        if items.len() >= QUEUE_CAPACITY {
            return Err(item);
        }
        items.push_back(item);
        Ok(())
    }

    /// Blocks in short sleeps until there is room, or `still_running`
    /// goes false (the connection is tearing down and should stop
    /// stalling the reader).
    fn push_blocking(&self, item: (Packet, usize), still_running: &dyn Fn() -> bool) {
        let mut item = item;
        loop {
            match self.try_push(item) {
                Ok(()) => return,
                Err(returned) => {
                    item = returned;
                    if !still_running() {
                        return;
                    }
                    thread::sleep(PUSH_BACKOFF);
                }
            }
        }
    }

    fn try_pop(&self) -> Option<(Packet, usize)> {
        self.items.lock().unwrap().pop_front()
    }

    fn pop_blocking(&self, still_running: &dyn Fn() -> bool) -> Option<(Packet, usize)> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if !still_running() {
                return None;
            }
            thread::sleep(POP_POLL);
        }
    }

    fn drain(&self) -> Vec<(Packet, usize)> {
        self.items.lock().unwrap().drain(..).collect()
    }
}

/// Owns both delivery paths and the registered callback.
///
/// The *decision* to flip `ManualRead` is made under the connection lock
/// (spec.md §4.G: it's a configuration-flags mutation), but the queue
/// push/pop traffic that happens every reader iteration and every
/// `read_packet` call is not: those go through `manual_read`'s atomic
/// load and the queue's own short-lived lock, so a consumer blocked in
/// `read_packet` never stalls the reader thread trying to deliver the
/// very packet it's waiting for.
pub struct Delivery {
    manual_read: AtomicBool,
    callback: Mutex<Option<Callback>>,
    queue: PacketQueue,
}

impl Delivery {
    pub fn new() -> Self {
        Delivery { manual_read: AtomicBool::new(false), callback: Mutex::new(None), queue: PacketQueue::new() }
    }

    pub fn manual_read(&self) -> bool {
        self.manual_read.load(Ordering::Acquire)
    }

    /// Called while holding the connection lock when the consumer flips
    /// `ManualRead` on: nothing to migrate since both disciplines share
    /// one queue, but any registered callback stops receiving new
    /// arrivals from this point on.
    pub fn enable_manual_read(&self) {
        self.manual_read.store(true, Ordering::Release);
    }

    /// Called while holding the connection lock when the consumer flips
    /// `ManualRead` off: if a callback is registered, drain whatever
    /// queued up while in pull mode to it now, in FIFO order, so nothing
    /// is stranded waiting for a `read_packet` call that will never come.
    pub fn disable_manual_read(&self) {
        self.manual_read.store(false, Ordering::Release);
        self.drain_to_callback_if_registered();
    }

    /// Registers (or replaces) the push-mode callback. If packets
    /// accumulated in the pending-events queue while none was
    /// registered, they are drained to it synchronously, in order,
    /// before this returns.
    pub fn set_callback(&self, callback: Callback) {
        *self.callback.lock().unwrap() = Some(callback);
        if !self.manual_read() {
            self.drain_to_callback_if_registered();
        }
    }

    fn drain_to_callback_if_registered(&self) {
        let callback = self.callback.lock().unwrap();
        if let Some(cb) = callback.as_ref() {
            for (packet, wire_len) in self.queue.drain() {
                cb(packet, wire_len);
            }
        }
    }

    /// Delivers one packet to the consumer per the current discipline.
    /// Blocks (with backpressure sleeps) if the packet has to queue and
    /// the queue is full; this is the reader thread's intentional
    /// choke point.
    pub fn deliver(
        &self,
        dispatcher: &dyn Dispatcher,
        packet: Packet,
        wire_len: usize,
        still_running: &dyn Fn() -> bool,
    ) {
        if self.manual_read() {
            self.queue.push_blocking((packet, wire_len), still_running);
            return;
        }
        let callback = self.callback.lock().unwrap().clone();
        match callback {
            Some(cb) => dispatcher.dispatch(Box::new(move || cb(packet, wire_len))),
            None => self.queue.push_blocking((packet, wire_len), still_running),
        }
    }

    pub fn read_packet_blocking(&self, still_running: &dyn Fn() -> bool) -> Option<(Packet, usize)> {
        self.queue.pop_blocking(still_running)
    }
}

#[cfg(test)]
mod test_delivery {
    use super::*;
    use crate::collab::InlineDispatcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn always_running() -> bool {
        true
    }

    #[test]
    fn pull_mode_preserves_fifo_order() {
        let delivery = Delivery::new();
        delivery.enable_manual_read();
        let dispatcher = InlineDispatcher;

        for i in 0..5u32 {
            delivery.deliver(&dispatcher, Packet::new(i, vec![]), 0, &always_running);
        }
        for i in 0..5u32 {
            let (packet, _) = delivery.read_packet_blocking(&always_running).unwrap();
            assert_eq!(packet.type_id, i);
        }
    }

    #[test]
    fn push_mode_drains_pending_queue_in_order_on_registration() {
        let delivery = Delivery::new();
        let dispatcher = InlineDispatcher;

        for i in 0..3u32 {
            delivery.deliver(&dispatcher, Packet::new(i, vec![]), 0, &always_running);
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        delivery.set_callback(Arc::new(move |p, _| seen_clone.lock().unwrap().push(p.type_id)));

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn push_mode_delivers_live_packets_through_callback() {
        let delivery = Delivery::new();
        let dispatcher = InlineDispatcher;
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        delivery.set_callback(Arc::new(move |_, _| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        delivery.deliver(&dispatcher, Packet::new(7, vec![]), 0, &always_running);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn toggling_manual_read_off_flushes_queued_packets_to_callback() {
        let delivery = Delivery::new();
        let dispatcher = InlineDispatcher;
        delivery.enable_manual_read();
        delivery.deliver(&dispatcher, Packet::new(1, vec![]), 0, &always_running);
        delivery.deliver(&dispatcher, Packet::new(2, vec![]), 0, &always_running);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        delivery.set_callback(Arc::new(move |p, _| seen_clone.lock().unwrap().push(p.type_id)));
        // still manual_read: registering a callback doesn't drain yet.
        assert!(seen.lock().unwrap().is_empty());

        delivery.disable_manual_read();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
