//! Error types threaded through every subsystem.
//!
//! Mirrors the shape of the teacher's single `Error` enum
//! (one flat, `#[non_exhaustive]` enum with a `Display` impl) but split one
//! enum per subsystem so each layer can carry its own protocol-specific
//! error code, then composed into [`CourierError`] for anything that
//! crosses a layer boundary.

use thiserror::Error;

/// Errors from the stateless PDU codec layer (§4.1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    #[error("packet too short: need {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },
    #[error("invalid value for field {field}")]
    InvalidValue { field: &'static str },
    #[error("length field disagreed with actual payload length")]
    LengthMismatch,
    #[error("trailing data left in buffer after parsing")]
    IncompleteParse,
    #[error("FCS checksum mismatch")]
    BadFcs,
}

/// Errors surfaced by the HCI dispatcher (§4.2).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HciError {
    #[error("command timed out waiting for completion")]
    Timeout,
    #[error("command status indicated failure: {0:#04x}")]
    CommandStatus(u8),
    #[error("command complete indicated failure: {0:#04x}")]
    CommandComplete(u8),
    #[error("transport pipe closed")]
    TransportClosed,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("engine is shutting down")]
    Closed,
}

/// L2CAP signaling result codes (Vol 3 Part A §4.2), surfaced as errors when
/// a connection attempt or configuration fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum L2capResult {
    Pending,
    PsmNotSupported,
    SecurityBlock,
    NoResources,
    InvalidSourceCid,
    SourceCidAlreadyAllocated,
    Unknown(u16),
}

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum L2capError {
    #[error("channel is in the wrong state for this operation")]
    WrongState,
    #[error("no dynamic CID available in the allocation range")]
    NoCidAvailable,
    #[error("connection request refused: {0:?}")]
    ConnectionRefused(L2capResult),
    #[error("no LE credits available to send")]
    NoCredits,
    #[error("peer sent a CONTINUING fragment with no reassembly in progress")]
    UnexpectedContinuation,
    #[error("unknown PSM {0:#06x}")]
    UnknownPsm(u16),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("acl connection not found for handle {0:#x}")]
    UnknownHandle(u16),
    #[error("channel closed")]
    ChannelClosed,
}

/// ATT error codes (Vol 3 Part F §3.4.1.1), used both on the wire and as the
/// Rust error describing a failed client request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum AttErrorCode {
    InvalidHandle = 0x01,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    InvalidPdu = 0x04,
    InsufficientAuthentication = 0x05,
    RequestNotSupported = 0x06,
    InvalidOffset = 0x07,
    InsufficientAuthorization = 0x08,
    PrepareQueueFull = 0x09,
    AttributeNotFound = 0x0A,
    AttributeNotLong = 0x0B,
    InsufficientEncryptionKeySize = 0x0C,
    InvalidAttributeValueLength = 0x0D,
    UnlikelyError = 0x0E,
    InsufficientEncryption = 0x0F,
    UnsupportedGroupType = 0x10,
    InsufficientResources = 0x11,
    Unknown(u8),
}

impl From<u8> for AttErrorCode {
    fn from(v: u8) -> Self {
        use AttErrorCode::*;
        match v {
            0x01 => InvalidHandle,
            0x02 => ReadNotPermitted,
            0x03 => WriteNotPermitted,
            0x04 => InvalidPdu,
            0x05 => InsufficientAuthentication,
            0x06 => RequestNotSupported,
            0x07 => InvalidOffset,
            0x08 => InsufficientAuthorization,
            0x09 => PrepareQueueFull,
            0x0A => AttributeNotFound,
            0x0B => AttributeNotLong,
            0x0C => InsufficientEncryptionKeySize,
            0x0D => InvalidAttributeValueLength,
            0x0E => UnlikelyError,
            0x0F => InsufficientEncryption,
            0x10 => UnsupportedGroupType,
            0x11 => InsufficientResources,
            other => Unknown(other),
        }
    }
}

impl From<AttErrorCode> for u8 {
    fn from(v: AttErrorCode) -> u8 {
        use AttErrorCode::*;
        match v {
            InvalidHandle => 0x01,
            ReadNotPermitted => 0x02,
            WriteNotPermitted => 0x03,
            InvalidPdu => 0x04,
            InsufficientAuthentication => 0x05,
            RequestNotSupported => 0x06,
            InvalidOffset => 0x07,
            InsufficientAuthorization => 0x08,
            PrepareQueueFull => 0x09,
            AttributeNotFound => 0x0A,
            AttributeNotLong => 0x0B,
            InsufficientEncryptionKeySize => 0x0C,
            InvalidAttributeValueLength => 0x0D,
            UnlikelyError => 0x0E,
            InsufficientEncryption => 0x0F,
            UnsupportedGroupType => 0x10,
            InsufficientResources => 0x11,
            Unknown(other) => other,
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AttError {
    #[error("attribute protocol error {code:?} on handle {handle:#06x}")]
    Protocol { code: AttErrorCode, handle: u16 },
    #[error("a request is already pending on this connection")]
    RequestInFlight,
    #[error("value length {len} exceeds the negotiated MTU bound")]
    ValueTooLong { len: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    L2cap(#[from] L2capError),
    #[error("GATT connection closed")]
    Closed,
}

impl AttError {
    pub fn protocol(code: AttErrorCode, handle: u16) -> Self {
        AttError::Protocol { code, handle }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RfcommError {
    #[error("multiplexer session is not open")]
    MuxNotOpen,
    #[error("dlci {0} is in the wrong state for this operation")]
    WrongState(u8),
    #[error("peer rejected the connection (DM)")]
    Rejected,
    #[error("no rfcomm credits available to send")]
    NoCredits,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    L2cap(#[from] L2capError),
    #[error("sdp lookup failed to resolve a channel for the requested service")]
    SdpLookupFailed,
}

#[derive(Debug, Error, Clone, Copy)]
#[non_exhaustive]
pub enum PairingError {
    #[error("pairing session is not in a state that allows this action")]
    WrongState,
    #[error("no link key on file for this address")]
    NoLinkKey,
    #[error("pairing failed: {0}")]
    Failed(&'static str),
}

/// Top-level error composing every subsystem error, for APIs that can fail
/// across layer boundaries (e.g. RFCOMM `connect_by_uuid` touching SDP,
/// L2CAP and RFCOMM all at once).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CourierError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Hci(#[from] HciError),
    #[error(transparent)]
    L2cap(#[from] L2capError),
    #[error(transparent)]
    Att(#[from] AttError),
    #[error(transparent)]
    Rfcomm(#[from] RfcommError),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error("engine is shutting down")]
    Closed,
}
