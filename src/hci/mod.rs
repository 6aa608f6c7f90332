//! HCI command/event dispatcher (spec.md §4.2).
//!
//! Correlates `send_command_sync` callers to their Command-Complete /
//! Command-Status event by opcode, the way
//! `other_examples/3689353f_jmagnuson-bo-tie__src-hci-cb.rs.rs` keys
//! waiters by opcode. The "fair mutex" serializing concurrent synchronous
//! commands (spec.md: "Concurrent synchronous commands serialize via a fair
//! mutex so only one is in-flight") is `tokio::sync::Mutex`, which queues
//! waiters FIFO.

pub mod event;
pub mod transport;

pub use event::Event;
pub use transport::{PacketKind, Transport};

use crate::codec::ByteWriter;
use crate::error::HciError;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

/// A 16-bit HCI command opcode, `ogf:6 | ocf:10`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Opcode(pub u16);

impl Opcode {
    pub const fn new(ogf: u8, ocf: u16) -> Self {
        Opcode(((ogf as u16) << 10) | (ocf & 0x03FF))
    }

    pub fn ogf(self) -> u8 {
        (self.0 >> 10) as u8
    }

    pub fn ocf(self) -> u16 {
        self.0 & 0x03FF
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

// A selection of opcodes this crate issues or recognizes directly; the
// remainder pass through send_command/send_command_sync opaquely.
pub const OPCODE_LINK_KEY_REQUEST_REPLY: Opcode = Opcode::new(0x01, 0x000B);
pub const OPCODE_LINK_KEY_REQUEST_NEGATIVE_REPLY: Opcode = Opcode::new(0x01, 0x000C);
pub const OPCODE_PIN_CODE_REQUEST_REPLY: Opcode = Opcode::new(0x01, 0x000D);
pub const OPCODE_PIN_CODE_REQUEST_NEGATIVE_REPLY: Opcode = Opcode::new(0x01, 0x000E);
pub const OPCODE_AUTHENTICATION_REQUESTED: Opcode = Opcode::new(0x01, 0x0011);
pub const OPCODE_IO_CAPABILITY_REQUEST_REPLY: Opcode = Opcode::new(0x01, 0x002B);
pub const OPCODE_USER_CONFIRMATION_REQUEST_REPLY: Opcode = Opcode::new(0x01, 0x002C);
pub const OPCODE_USER_CONFIRMATION_REQUEST_NEGATIVE_REPLY: Opcode = Opcode::new(0x01, 0x002D);
pub const OPCODE_USER_PASSKEY_REQUEST_REPLY: Opcode = Opcode::new(0x01, 0x002E);
pub const OPCODE_USER_PASSKEY_REQUEST_NEGATIVE_REPLY: Opcode = Opcode::new(0x01, 0x002F);

type EventListener = Box<dyn Fn(&Event) + Send + Sync>;

struct Waiter {
    tx: oneshot::Sender<Vec<u8>>,
}

/// The HCI command/event dispatcher.
///
/// Owns no event loop of its own: the embedding application feeds inbound
/// bytes in via [`Dispatcher::handle_event`] / the ACL/SCO hand-off points,
/// matching spec.md's "the core consumes an abstract bidirectional packet
/// pipe" framing rather than owning a global loop (§5: "There is NO single
/// global event loop").
pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    waiters: DashMap<u16, Waiter>,
    sync_gate: AsyncMutex<()>,
    listeners: RwLock<Vec<EventListener>>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            waiters: DashMap::new(),
            sync_gate: AsyncMutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn encode_command(opcode: Opcode, params: &[u8]) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(3 + params.len());
        w.write_u16_le(opcode.0);
        w.write_u8(params.len() as u8);
        w.write_slice(params);
        w.into_vec()
    }

    /// Fire-and-forget command send (spec.md §4.2).
    pub async fn send_command(&self, opcode: Opcode, params: &[u8]) {
        let bytes = Self::encode_command(opcode, params);
        self.transport.send(PacketKind::Command, bytes).await;
    }

    /// Blocks the caller until a Command-Complete or Command-Status event
    /// for `opcode` arrives, or `timeout` elapses. Concurrent calls to this
    /// method serialize on the dispatcher's fair mutex; `send_command` does
    /// not participate in that serialization.
    pub async fn send_command_sync(
        &self,
        opcode: Opcode,
        params: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, HciError> {
        let _gate = self.sync_gate.lock().await;

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(opcode.0, Waiter { tx });

        let bytes = Self::encode_command(opcode, params);
        self.transport.send(PacketKind::Command, bytes).await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event_bytes)) => Ok(event_bytes),
            Ok(Err(_)) => Err(HciError::Closed),
            Err(_) => {
                // Don't leak the waiter slot on timeout.
                self.waiters.remove(&opcode.0);
                Err(HciError::Timeout)
            }
        }
    }

    pub async fn send_acl(&self, bytes: Vec<u8>) {
        self.transport.send(PacketKind::Acl, bytes).await;
    }

    pub async fn send_sco_iso(&self, bytes: Vec<u8>) {
        self.transport.send(PacketKind::ScoIso, bytes).await;
    }

    /// Registers a listener invoked synchronously for every classified
    /// event (spec.md §4.2: "Listeners must be non-blocking"). Listeners
    /// are never invoked for events consumed by a `send_command_sync`
    /// waiter in a way that would double-resolve state, but they *do* see
    /// Command-Complete/Command-Status events too, for callers tracking
    /// fire-and-forget commands.
    pub fn add_event_listener(&self, f: impl Fn(&Event) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(f));
    }

    /// Feeds one raw inbound event packet `[code:8][param_len:8][params]`
    /// into the dispatcher. Resolves a matching `send_command_sync` waiter
    /// (if any) and fans the classified event out to all listeners.
    pub fn handle_event(&self, raw: &[u8]) {
        let event = match Event::parse(raw) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("dropping malformed HCI event: {e}");
                return;
            }
        };

        let matched_opcode = match &event {
            Event::CommandComplete { opcode, .. } => Some(*opcode),
            Event::CommandStatus { opcode, .. } => Some(*opcode),
            _ => None,
        };

        if let Some(opcode) = matched_opcode {
            if let Some((_, waiter)) = self.waiters.remove(&opcode.0) {
                let _ = waiter.tx.send(raw.to_vec());
            }
        }

        for listener in self.listeners.read().iter() {
            listener(&event);
        }
    }

    /// Resolves every outstanding synchronous waiter with a terminal error
    /// and clears listeners' ability to be invoked again, per spec.md §5
    /// ("On shutdown, all pending operations resolve with an 'engine
    /// closed' error").
    pub fn shutdown(&self) {
        self.waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingTransport {
        sent: parking_lot::Mutex<Vec<(PacketKind, Vec<u8>)>>,
    }

    impl Transport for RecordingTransport {
        fn send(&self, kind: PacketKind, bytes: Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            self.sent.lock().push((kind, bytes));
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn sync_command_resolves_on_command_complete() {
        let transport = Arc::new(RecordingTransport { sent: parking_lot::Mutex::new(Vec::new()) });
        let dispatcher = Arc::new(Dispatcher::new(transport));

        let opcode = Opcode::new(0x03, 0x0003); // Reset
        let d2 = dispatcher.clone();
        let handle = tokio::spawn(async move {
            d2.send_command_sync(opcode, &[], Duration::from_millis(500)).await
        });

        tokio::task::yield_now().await;
        // Command-Complete: code=0x0E, len=4, num_packets=1, opcode LE, status=0
        let mut evt = vec![0x0E, 0x04, 0x01];
        evt.extend_from_slice(&opcode.0.to_le_bytes());
        evt.push(0x00);
        dispatcher.handle_event(&evt);

        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn timeout_does_not_leak_waiter_slot() {
        let transport = Arc::new(RecordingTransport { sent: parking_lot::Mutex::new(Vec::new()) });
        let dispatcher = Dispatcher::new(transport);
        let opcode = Opcode::new(0x03, 0x0003);

        let result = dispatcher
            .send_command_sync(opcode, &[], Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(HciError::Timeout)));
        assert!(dispatcher.waiters.is_empty());
    }

    #[tokio::test]
    async fn listeners_see_all_events() {
        let transport = Arc::new(RecordingTransport { sent: parking_lot::Mutex::new(Vec::new()) });
        let dispatcher = Dispatcher::new(transport);
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        dispatcher.add_event_listener(move |_evt| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.handle_event(&[0x05, 0x04, 0x00, 0x01, 0x00, 0x13]); // DisconnectionComplete
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
