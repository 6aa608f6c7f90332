//! The ATT server half: an attribute table plus request dispatch
//! (Vol 3 Part F §3.4.4), grounded in the teacher's
//! `AttributeServer::process_request` match arms (`rubble/src/att/server.rs`)
//! but operating on an owned `Vec<Attribute>` table instead of the
//! teacher's `AttributeProvider` trait, since GATT's service/characteristic
//! layout here is built once at startup rather than iterated lazily.

use crate::att::handle::{Handle, HandleRange};
use crate::att::pdus::{encode_find_info_entry16, encode_group_entry, encode_type_entry, AttPdu};
use crate::codec::{ByteWriter, Encode};
use crate::error::AttErrorCode;
use crate::uuid::{Uuid, Uuid16, PRIMARY_SERVICE_UUID, SECONDARY_SERVICE_UUID};
use parking_lot::RwLock;

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Permissions: u8 {
        const READ = 0b0000_0001;
        const WRITE = 0b0000_0010;
    }
}

/// One row of the server's attribute table.
pub struct ServerAttribute {
    pub handle: Handle,
    pub att_type: Uuid,
    pub value: Vec<u8>,
    pub permissions: Permissions,
    /// Set on grouping attributes (service declarations); the handle of the
    /// last attribute belonging to the group.
    pub group_end: Option<Handle>,
}

/// Implemented by GATT's attribute table so the ATT server can answer
/// requests without knowing about services/characteristics directly.
pub trait AttributeTable: Send + Sync {
    fn attribute(&self, handle: Handle) -> Option<&ServerAttribute>;
    fn attributes_in_range(&self, range: HandleRange) -> Vec<&ServerAttribute>;
    fn set_value(&mut self, handle: Handle, value: Vec<u8>) -> bool;
}

/// A simple in-memory table; `gatt::Service::build` populates one of these.
#[derive(Default)]
pub struct VecAttributeTable {
    pub attrs: Vec<ServerAttribute>,
}

impl AttributeTable for VecAttributeTable {
    fn attribute(&self, handle: Handle) -> Option<&ServerAttribute> {
        self.attrs.iter().find(|a| a.handle == handle)
    }

    fn attributes_in_range(&self, range: HandleRange) -> Vec<&ServerAttribute> {
        self.attrs.iter().filter(|a| range.contains(a.handle)).collect()
    }

    fn set_value(&mut self, handle: Handle, value: Vec<u8>) -> bool {
        if let Some(attr) = self.attrs.iter_mut().find(|a| a.handle == handle) {
            attr.value = value;
            true
        } else {
            false
        }
    }
}

/// Consulted by Read-Request/Read-Blob-Request before falling back to the
/// stored attribute value; `Some(value)` overrides, `None` defers to the
/// table (spec.md §4.4.4).
type ReadCallback = Box<dyn Fn(Handle) -> Option<Vec<u8>> + Send + Sync>;

/// Consulted by Write-Request/Write-Command before the value is stored;
/// `Some(code)` rejects the write with that error (request only - commands
/// have no reply to carry it), `None` accepts and stores (spec.md §4.4.4).
type WriteCallback = Box<dyn Fn(Handle, &[u8]) -> Option<AttErrorCode> + Send + Sync>;

/// An Attribute Protocol server answering requests against a shared
/// attribute table. `RwLock`-guarded since notifications (which read the
/// table) and writes from the peer can race (spec.md §5).
pub struct AttributeServer<A: AttributeTable> {
    table: RwLock<A>,
    /// This server's own receive MTU, advertised verbatim in every
    /// Exchange-MTU-Response regardless of what the peer proposed (Vol 3
    /// Part F §3.4.2.1: both sides report their own capability, then each
    /// independently takes the minimum).
    local_mtu: u16,
    mtu: RwLock<u16>,
    read_callback: RwLock<Option<ReadCallback>>,
    write_callback: RwLock<Option<WriteCallback>>,
}

impl<A: AttributeTable> AttributeServer<A> {
    pub fn new(table: A) -> Self {
        Self {
            table: RwLock::new(table),
            local_mtu: 517,
            mtu: RwLock::new(super::DEFAULT_ATT_MTU),
            read_callback: RwLock::new(None),
            write_callback: RwLock::new(None),
        }
    }

    pub fn mtu(&self) -> u16 {
        *self.mtu.read()
    }

    /// Registers the application callback consulted before a Read-Request
    /// or Read-Blob-Request falls back to the stored value.
    pub fn set_read_callback(&self, f: impl Fn(Handle) -> Option<Vec<u8>> + Send + Sync + 'static) {
        *self.read_callback.write() = Some(Box::new(f));
    }

    /// Registers the application callback consulted before a Write-Request
    /// or Write-Command is accepted.
    pub fn set_write_callback(&self, f: impl Fn(Handle, &[u8]) -> Option<AttErrorCode> + Send + Sync + 'static) {
        *self.write_callback.write() = Some(Box::new(f));
    }

    /// Builds a Handle-Value-Notification PDU for the caller to send; no
    /// acknowledgement is expected (spec.md §4.4.4).
    pub fn notify(&self, handle: Handle, value: Vec<u8>) -> Vec<u8> {
        AttPdu::HandleValueNotification { handle: handle.as_u16(), value }.encoded()
    }

    /// Builds a Handle-Value-Indication PDU for the caller to send; the peer
    /// must reply with Handle-Value-Confirmation (spec.md §4.4.4).
    pub fn indicate(&self, handle: Handle, value: Vec<u8>) -> Vec<u8> {
        AttPdu::HandleValueIndication { handle: handle.as_u16(), value }.encoded()
    }

    pub fn set_value(&self, handle: Handle, value: Vec<u8>) -> bool {
        self.table.write().set_value(handle, value)
    }

    pub fn read_value(&self, handle: Handle) -> Option<Vec<u8>> {
        self.table.read().attribute(handle).map(|a| a.value.clone())
    }

    /// Processes one inbound request PDU, returning the raw response bytes
    /// to send back (an `ErrorRsp` on failure), or `None` for PDUs that get
    /// no response (`WriteCmd`).
    pub fn process_request(&self, request: &AttPdu) -> Option<Vec<u8>> {
        let result = self.process(request);
        match result {
            Ok(Some(pdu)) => Some(pdu.encoded()),
            Ok(None) => None,
            Err((request_opcode, handle, code)) => {
                Some(AttPdu::ErrorRsp { request_opcode, handle, error_code: code }.encoded())
            }
        }
    }

    fn process(&self, request: &AttPdu) -> Result<Option<AttPdu>, (u8, u16, AttErrorCode)> {
        match request {
            AttPdu::ExchangeMtuReq { client_rx_mtu } => {
                let negotiated = (*client_rx_mtu).min(self.local_mtu).max(super::DEFAULT_ATT_MTU);
                *self.mtu.write() = negotiated;
                Ok(Some(AttPdu::ExchangeMtuRsp { server_rx_mtu: self.local_mtu }))
            }

            AttPdu::ReadByGroupTypeReq { start, end, group_type } => {
                if *group_type != Uuid::Uuid16(PRIMARY_SERVICE_UUID) && *group_type != Uuid::Uuid16(SECONDARY_SERVICE_UUID) {
                    return Err((request.opcode() as u8, *start, AttErrorCode::UnsupportedGroupType));
                }
                let range = HandleRange {
                    start: Handle::new(*start).ok_or((request.opcode() as u8, *start, AttErrorCode::InvalidHandle))?,
                    end: Handle::new(*end).unwrap_or(Handle::MAX),
                };
                let table = self.table.read();
                let mtu = self.mtu() as usize;
                let mut w = ByteWriter::new();
                let mut entry_len = None;
                for attr in table.attributes_in_range(range) {
                    if attr.att_type == *group_type {
                        let Some(group_end) = attr.group_end else { continue };
                        let candidate_len = 4 + attr.value.len();
                        if entry_len.is_none() || entry_len == Some(candidate_len) {
                            if w.len() + candidate_len + 2 > mtu {
                                break;
                            }
                            encode_group_entry(&mut w, attr.handle.as_u16(), group_end.as_u16(), &attr.value);
                            entry_len = Some(candidate_len);
                        }
                    }
                }
                match entry_len {
                    Some(len) => Ok(Some(AttPdu::ReadByGroupTypeRsp { length: len as u8, data: w.into_vec() })),
                    None => Err((request.opcode() as u8, *start, AttErrorCode::AttributeNotFound)),
                }
            }

            AttPdu::ReadByTypeReq { start, end, attribute_type } => {
                let range = HandleRange {
                    start: Handle::new(*start).ok_or((request.opcode() as u8, *start, AttErrorCode::InvalidHandle))?,
                    end: Handle::new(*end).unwrap_or(Handle::MAX),
                };
                let table = self.table.read();
                let mtu = self.mtu() as usize;
                let mut w = ByteWriter::new();
                let mut entry_len = None;
                for attr in table.attributes_in_range(range) {
                    if attr.att_type == *attribute_type {
                        let candidate_len = 2 + attr.value.len();
                        if entry_len.is_none() || entry_len == Some(candidate_len) {
                            if w.len() + candidate_len + 2 > mtu {
                                break;
                            }
                            encode_type_entry(&mut w, attr.handle.as_u16(), &attr.value);
                            entry_len = Some(candidate_len);
                        }
                    }
                }
                match entry_len {
                    Some(len) => Ok(Some(AttPdu::ReadByTypeRsp { length: len as u8, data: w.into_vec() })),
                    None => Err((request.opcode() as u8, *start, AttErrorCode::AttributeNotFound)),
                }
            }

            AttPdu::FindInformationReq { start, end } => {
                let range = HandleRange {
                    start: Handle::new(*start).ok_or((request.opcode() as u8, *start, AttErrorCode::InvalidHandle))?,
                    end: Handle::new(*end).unwrap_or(Handle::MAX),
                };
                let table = self.table.read();
                let mut w = ByteWriter::new();
                let mut any = false;
                for attr in table.attributes_in_range(range) {
                    if let Uuid::Uuid16(u) = attr.att_type {
                        encode_find_info_entry16(&mut w, attr.handle.as_u16(), u);
                        any = true;
                    }
                }
                if any {
                    Ok(Some(AttPdu::FindInformationRsp { format: 0x01, data: w.into_vec() }))
                } else {
                    Err((request.opcode() as u8, *start, AttErrorCode::AttributeNotFound))
                }
            }

            AttPdu::ReadReq { handle } => {
                let h = Handle::new(*handle).ok_or((request.opcode() as u8, *handle, AttErrorCode::InvalidHandle))?;
                let stored = {
                    let table = self.table.read();
                    let attr = table.attribute(h).ok_or((request.opcode() as u8, *handle, AttErrorCode::InvalidHandle))?;
                    if !attr.permissions.contains(Permissions::READ) {
                        return Err((request.opcode() as u8, *handle, AttErrorCode::ReadNotPermitted));
                    }
                    attr.value.clone()
                };
                let full = self.read_callback.read().as_ref().and_then(|cb| cb(h)).unwrap_or(stored);
                let mtu = self.mtu() as usize;
                let value = if full.len() > mtu.saturating_sub(1) { full[..mtu - 1].to_vec() } else { full };
                Ok(Some(AttPdu::ReadRsp { value }))
            }

            AttPdu::ReadBlobReq { handle, offset } => {
                let h = Handle::new(*handle).ok_or((request.opcode() as u8, *handle, AttErrorCode::InvalidHandle))?;
                let stored = {
                    let table = self.table.read();
                    let attr = table.attribute(h).ok_or((request.opcode() as u8, *handle, AttErrorCode::InvalidHandle))?;
                    if !attr.permissions.contains(Permissions::READ) {
                        return Err((request.opcode() as u8, *handle, AttErrorCode::ReadNotPermitted));
                    }
                    attr.value.clone()
                };
                let full = self.read_callback.read().as_ref().and_then(|cb| cb(h)).unwrap_or(stored);
                if *offset as usize > full.len() {
                    return Err((request.opcode() as u8, *handle, AttErrorCode::InvalidOffset));
                }
                let mtu = self.mtu() as usize;
                let rest = &full[*offset as usize..];
                let value = if rest.len() > mtu.saturating_sub(1) { rest[..mtu - 1].to_vec() } else { rest.to_vec() };
                Ok(Some(AttPdu::ReadBlobRsp { value }))
            }

            AttPdu::WriteReq { handle, value } => {
                let h = Handle::new(*handle).ok_or((request.opcode() as u8, *handle, AttErrorCode::InvalidHandle))?;
                let writable = {
                    let table = self.table.read();
                    table.attribute(h).map(|a| a.permissions.contains(Permissions::WRITE)).unwrap_or(false)
                };
                if !writable {
                    return Err((request.opcode() as u8, *handle, AttErrorCode::WriteNotPermitted));
                }
                if let Some(code) = self.write_callback.read().as_ref().and_then(|cb| cb(h, value)) {
                    return Err((request.opcode() as u8, *handle, code));
                }
                self.table.write().set_value(h, value.clone());
                Ok(Some(AttPdu::WriteRsp))
            }

            AttPdu::WriteCmd { handle, value } => {
                if let Some(h) = Handle::new(*handle) {
                    let writable = {
                        let table = self.table.read();
                        table.attribute(h).map(|a| a.permissions.contains(Permissions::WRITE)).unwrap_or(false)
                    };
                    if writable {
                        let rejected = self.write_callback.read().as_ref().and_then(|cb| cb(h, value)).is_some();
                        if !rejected {
                            self.table.write().set_value(h, value.clone());
                        }
                    }
                }
                Ok(None)
            }

            AttPdu::HandleValueConfirmation => Ok(None),

            _ => Err((request.opcode() as u8, 0, AttErrorCode::RequestNotSupported)),
        }
    }
}

impl AttributeServer<VecAttributeTable> {
    /// Appends a newly registered service's attributes to the live table
    /// (spec.md §4.4.4: "rebuilt whenever a service is registered"); used by
    /// [`crate::gatt::GattServer::register_service`].
    pub fn register_attrs(&self, new_attrs: Vec<ServerAttribute>) {
        self.table.write().attrs.extend(new_attrs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::Uuid16;

    fn sample_table() -> VecAttributeTable {
        VecAttributeTable {
            attrs: vec![
                ServerAttribute {
                    handle: Handle::from_raw_unchecked(1),
                    att_type: Uuid::Uuid16(Uuid16(0x2800)),
                    value: Uuid16(0x1800).encoded(),
                    permissions: Permissions::READ,
                    group_end: Some(Handle::from_raw_unchecked(3)),
                },
                ServerAttribute {
                    handle: Handle::from_raw_unchecked(3),
                    att_type: Uuid::Uuid16(Uuid16(0x2A00)),
                    value: b"device".to_vec(),
                    permissions: Permissions::READ,
                    group_end: None,
                },
            ],
        }
    }

    #[test]
    fn exchange_mtu_negotiates_minimum() {
        let server = AttributeServer::new(sample_table());
        let resp = server.process_request(&AttPdu::ExchangeMtuReq { client_rx_mtu: 23 });
        assert!(resp.is_some());
        assert_eq!(server.mtu(), 23);
    }

    #[test]
    fn read_by_group_type_finds_service() {
        let server = AttributeServer::new(sample_table());
        let req = AttPdu::ReadByGroupTypeReq { start: 1, end: 0xFFFF, group_type: Uuid::Uuid16(Uuid16(0x2800)) };
        let resp = server.process_request(&req).unwrap();
        assert_eq!(resp[0], 0x11); // ReadByGroupTypeRsp
    }

    #[test]
    fn read_unreadable_handle_errors() {
        let mut table = sample_table();
        table.attrs[1].permissions = Permissions::WRITE;
        let server = AttributeServer::new(table);
        let resp = server.process_request(&AttPdu::ReadReq { handle: 3 }).unwrap();
        assert_eq!(resp[0], 0x01); // ErrorRsp
    }

    #[test]
    fn read_by_group_type_rejects_unsupported_group_type() {
        let server = AttributeServer::new(sample_table());
        let req = AttPdu::ReadByGroupTypeReq { start: 1, end: 0xFFFF, group_type: Uuid::Uuid16(Uuid16(0x2A00)) };
        let resp = server.process_request(&req).unwrap();
        assert_eq!(resp[0], 0x01); // ErrorRsp
        assert_eq!(resp[4], u8::from(AttErrorCode::UnsupportedGroupType));
    }

    #[test]
    fn read_callback_overrides_stored_value() {
        let server = AttributeServer::new(sample_table());
        server.set_read_callback(|h| (h.as_u16() == 3).then(|| b"live".to_vec()));
        let resp = server.process_request(&AttPdu::ReadReq { handle: 3 }).unwrap();
        assert_eq!(resp[0], 0x0B); // ReadRsp
        assert_eq!(&resp[1..], b"live");
    }

    #[test]
    fn write_callback_rejection_is_surfaced_and_not_stored() {
        let mut table = sample_table();
        table.attrs[1].permissions = Permissions::WRITE;
        let server = AttributeServer::new(table);
        server.set_write_callback(|_, _| Some(AttErrorCode::WriteNotPermitted));
        let resp = server.process_request(&AttPdu::WriteReq { handle: 3, value: vec![1] }).unwrap();
        assert_eq!(resp[0], 0x01); // ErrorRsp
        assert_eq!(server.read_value(Handle::from_raw_unchecked(3)).unwrap(), b"device");
    }
}
