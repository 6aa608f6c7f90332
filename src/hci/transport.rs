//! The transport boundary consumed by the dispatcher (spec.md §6).
//!
//! Grounded in the teacher's `config::Config` pattern: a single trait an
//! embedding application implements once, passed in at construction time
//! instead of reached for as a global (DESIGN NOTES: "pass as
//! construction-time dependencies, not process globals").

use std::future::Future;
use std::pin::Pin;

/// Which of the four typed channels a packet belongs to (spec.md §6).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Command,
    Event,
    Acl,
    ScoIso,
}

/// An abstract bidirectional packet pipe to the HCI transport driver. The
/// driver (serial/USB/vendor HAL) is an external collaborator per spec.md
/// §1 Non-goals; CourierStack only ever talks to this trait.
pub trait Transport: Send + Sync + 'static {
    /// Sends a raw packet of the given kind. Must not block past the
    /// underlying transport's own backpressure.
    fn send(&self, kind: PacketKind, bytes: Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}
