//! Shared fake-transport plumbing for the end-to-end tests (spec.md §8).
//!
//! Outbound packets queue up on an unbounded channel instead of going
//! anywhere real; each test drains what it cares about and hand-builds
//! peer replies, feeding them back in through `handle_acl`/`handle_event`.

use courier_stack::hci::{PacketKind, Transport};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct ChannelTransport {
    pub tx: mpsc::UnboundedSender<(PacketKind, Vec<u8>)>,
}

impl Transport for ChannelTransport {
    fn send(&self, kind: PacketKind, bytes: Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let _ = self.tx.send((kind, bytes));
        Box::pin(async {})
    }
}

pub fn channel_transport() -> (Arc<ChannelTransport>, mpsc::UnboundedReceiver<(PacketKind, Vec<u8>)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelTransport { tx }), rx)
}

/// Builds the wire bytes `L2capCore::handle_acl` expects for one
/// unfragmented frame: `[handle_flags LE][total_len LE][l2cap_len LE][cid LE][payload]`.
pub fn build_acl_frame(handle: u16, cid: u16, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + payload.len());
    let handle_flags = (handle & 0x0FFF) | (0b10 << 12);
    bytes.extend_from_slice(&handle_flags.to_le_bytes());
    let body_len = (4 + payload.len()) as u16;
    bytes.extend_from_slice(&body_len.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    bytes.extend_from_slice(&cid.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Strips the ACL/L2CAP framing `build_acl_frame` adds, returning `(cid, payload)`.
pub fn strip_acl_frame(raw: &[u8]) -> (u16, Vec<u8>) {
    let l2cap_len = u16::from_le_bytes([raw[4], raw[5]]) as usize;
    let cid = u16::from_le_bytes([raw[6], raw[7]]);
    (cid, raw[8..8 + l2cap_len].to_vec())
}
