//! Attribute Protocol (Vol 3 Part F): MTU exchange, the three-phase
//! discovery state machine and the single-pending-operation client/server
//! split (spec.md §4.4).

pub mod client;
pub mod handle;
pub mod pdus;
pub mod server;

pub use client::AttClient;
pub use handle::{Handle, HandleRange};
pub use server::{AttributeServer, ServerAttribute};

/// The ATT default MTU before any Exchange MTU exchange (Vol 3 Part F §3.2.8).
pub const DEFAULT_ATT_MTU: u16 = 23;
