//! Generic Attribute Profile: builds a GATT service layout on top of the
//! ATT attribute table (Vol 3 Part G §3).
//!
//! The teacher's `gatt::{Service, Characteristic}` (`rubble/src/gatt/mod.rs`)
//! is a hand-rolled fixed-size array of attributes with handles assigned by
//! hand; this crate generalizes that into a builder that assigns handles
//! sequentially as services/characteristics/descriptors are declared, the
//! way a host stack serving an arbitrary peripheral profile needs to.

use crate::att::handle::Handle;
use crate::att::server::{AttributeServer, Permissions, ServerAttribute, VecAttributeTable};
use crate::codec::{ByteWriter, Encode};
use crate::hci::Transport;
use crate::l2cap::{L2capCore, CID_ATT};
use crate::uuid::{Uuid, Uuid16, CCCD_UUID, CHARACTERISTIC_UUID, PRIMARY_SERVICE_UUID, SECONDARY_SERVICE_UUID};
use parking_lot::RwLock;
use std::sync::Arc;

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0b0000_0001;
        const READ = 0b0000_0010;
        const WRITE_WITHOUT_RESPONSE = 0b0000_0100;
        const WRITE = 0b0000_1000;
        const NOTIFY = 0b0001_0000;
        const INDICATE = 0b0010_0000;
    }
}

pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub value: Vec<u8>,
    pub permissions: Permissions,
}

pub struct CharacteristicSpec {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub initial_value: Vec<u8>,
    pub permissions: Permissions,
    pub descriptors: Vec<CharacteristicDescriptor>,
    /// Adds a Client Characteristic Configuration Descriptor (spec.md
    /// §4.4.3: subscription bookkeeping lives here).
    pub notifiable: bool,
}

impl CharacteristicSpec {
    pub fn new(uuid: impl Into<Uuid>, properties: CharacteristicProperties, initial_value: Vec<u8>) -> Self {
        let notifiable = properties.intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE);
        let mut permissions = Permissions::empty();
        if properties.contains(CharacteristicProperties::READ) {
            permissions |= Permissions::READ;
        }
        if properties.intersects(CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_WITHOUT_RESPONSE) {
            permissions |= Permissions::WRITE;
        }
        Self { uuid: uuid.into(), properties, initial_value, permissions, descriptors: Vec::new(), notifiable }
    }
}

pub enum ServiceKind {
    Primary,
    Secondary,
}

pub struct ServiceSpec {
    pub uuid: Uuid,
    pub kind: ServiceKind,
    pub characteristics: Vec<CharacteristicSpec>,
}

impl ServiceSpec {
    pub fn primary(uuid: impl Into<Uuid>) -> Self {
        Self { uuid: uuid.into(), kind: ServiceKind::Primary, characteristics: Vec::new() }
    }

    pub fn with_characteristic(mut self, characteristic: CharacteristicSpec) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// Records where each characteristic's value and CCCD ended up, so the
/// application can map a logical characteristic to the handles the wire
/// protocol actually uses for notify/indicate/read/write.
pub struct CharacteristicHandles {
    pub value_handle: Handle,
    pub cccd_handle: Option<Handle>,
}

pub struct GattDatabase {
    pub table: VecAttributeTable,
    pub characteristics: Vec<CharacteristicHandles>,
}

fn characteristic_declaration_value(properties: CharacteristicProperties, value_handle: Handle, uuid: Uuid) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_u8(properties.bits());
    w.write_u16_le(value_handle.as_u16());
    uuid.encode(&mut w);
    w.into_vec()
}

/// Lays out one service's attributes starting at `*next`, advancing it past
/// the handles consumed. Shared by [`build_database`] (whole table up front)
/// and [`GattServer::register_service`] (one service at a time, spec.md
/// §4.4.4: "rebuilt whenever a service is registered").
fn layout_service(service: ServiceSpec, next: &mut u16) -> (Vec<ServerAttribute>, Vec<CharacteristicHandles>) {
    let mut attrs = Vec::new();
    let mut characteristics = Vec::new();

    let service_handle = Handle::from_raw_unchecked(*next);
    *next += 1;
    let group_type = match service.kind {
        ServiceKind::Primary => PRIMARY_SERVICE_UUID,
        ServiceKind::Secondary => SECONDARY_SERVICE_UUID,
    };
    attrs.push(ServerAttribute {
        handle: service_handle,
        att_type: Uuid::Uuid16(group_type),
        value: service.uuid.shorten().encoded(),
        permissions: Permissions::READ,
        group_end: None, // patched once we know the last handle in this group
    });

    for characteristic in service.characteristics {
        let declaration_handle = Handle::from_raw_unchecked(*next);
        *next += 1;
        let value_handle = Handle::from_raw_unchecked(*next);
        *next += 1;

        attrs.push(ServerAttribute {
            handle: declaration_handle,
            att_type: Uuid::Uuid16(CHARACTERISTIC_UUID),
            value: characteristic_declaration_value(characteristic.properties, value_handle, characteristic.uuid),
            permissions: Permissions::READ,
            group_end: None,
        });
        attrs.push(ServerAttribute {
            handle: value_handle,
            att_type: characteristic.uuid,
            value: characteristic.initial_value,
            permissions: characteristic.permissions,
            group_end: None,
        });

        let mut cccd_handle = None;
        if characteristic.notifiable {
            let handle = Handle::from_raw_unchecked(*next);
            *next += 1;
            attrs.push(ServerAttribute {
                handle,
                att_type: Uuid::Uuid16(CCCD_UUID),
                value: vec![0x00, 0x00],
                permissions: Permissions::READ | Permissions::WRITE,
                group_end: None,
            });
            cccd_handle = Some(handle);
        }

        for descriptor in characteristic.descriptors {
            let handle = Handle::from_raw_unchecked(*next);
            *next += 1;
            attrs.push(ServerAttribute {
                handle,
                att_type: descriptor.uuid,
                value: descriptor.value,
                permissions: descriptor.permissions,
                group_end: None,
            });
        }

        characteristics.push(CharacteristicHandles { value_handle, cccd_handle });
    }

    let last_handle = Handle::from_raw_unchecked(*next - 1);
    attrs[0].group_end = Some(last_handle);
    (attrs, characteristics)
}

/// Builds a flat attribute table from a list of service specs, assigning
/// handles starting at 1 in declaration order (Vol 3 Part G §3.1: handles
/// only need to be stable for the lifetime of a connection, not globally).
pub fn build_database(services: Vec<ServiceSpec>) -> GattDatabase {
    let mut attrs = Vec::new();
    let mut characteristics = Vec::new();
    let mut next = 1u16;

    for service in services {
        let (mut service_attrs, mut service_chars) = layout_service(service, &mut next);
        attrs.append(&mut service_attrs);
        characteristics.append(&mut service_chars);
    }

    GattDatabase { table: VecAttributeTable { attrs }, characteristics }
}

/// Incrementally assembles one service before handing it to
/// [`GattServer::register_service`] (spec.md §6: `create_service` /
/// `add_characteristic` / `add_descriptor` / `add_cccd`).
pub struct ServiceBuilder {
    uuid: Uuid,
    kind: ServiceKind,
    characteristics: Vec<CharacteristicSpec>,
}

impl ServiceBuilder {
    pub fn add_characteristic(mut self, characteristic: CharacteristicSpec) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Attaches a descriptor to the most recently added characteristic.
    pub fn add_descriptor(mut self, uuid: impl Into<Uuid>, value: Vec<u8>, permissions: Permissions) -> Self {
        if let Some(characteristic) = self.characteristics.last_mut() {
            characteristic.descriptors.push(CharacteristicDescriptor { uuid: uuid.into(), value, permissions });
        }
        self
    }

    /// Forces a Client Characteristic Configuration Descriptor onto the most
    /// recently added characteristic, independent of its declared
    /// properties.
    pub fn add_cccd(mut self) -> Self {
        if let Some(characteristic) = self.characteristics.last_mut() {
            characteristic.notifiable = true;
        }
        self
    }

    fn into_spec(self) -> ServiceSpec {
        ServiceSpec { uuid: self.uuid, kind: self.kind, characteristics: self.characteristics }
    }
}

/// A running GATT server: an [`AttributeServer`] whose table grows as
/// services are registered, plus the L2CAP channel to send notifications
/// and indications on (spec.md §6 GATT server API surface).
pub struct GattServer<T: Transport> {
    server: Arc<AttributeServer<VecAttributeTable>>,
    l2cap: Arc<L2capCore<T>>,
    next_handle: RwLock<u16>,
    characteristics: RwLock<Vec<CharacteristicHandles>>,
}

impl<T: Transport> GattServer<T> {
    pub fn new(l2cap: Arc<L2capCore<T>>) -> Self {
        Self {
            server: Arc::new(AttributeServer::new(VecAttributeTable::default())),
            l2cap,
            next_handle: RwLock::new(1),
            characteristics: RwLock::new(Vec::new()),
        }
    }

    /// The underlying attribute server, for wiring into the inbound ATT
    /// request dispatcher and for `set_read_callback`/`set_write_callback`.
    pub fn attribute_server(&self) -> Arc<AttributeServer<VecAttributeTable>> {
        self.server.clone()
    }

    pub fn create_service(&self, uuid: impl Into<Uuid>, kind: ServiceKind) -> ServiceBuilder {
        ServiceBuilder { uuid: uuid.into(), kind, characteristics: Vec::new() }
    }

    /// Finalizes a service built with [`GattServer::create_service`],
    /// allocating handles after whatever is already registered and
    /// appending them to the live table.
    pub fn register_service(&self, service: ServiceBuilder) -> Vec<CharacteristicHandles> {
        let mut next = self.next_handle.write();
        let (attrs, chars) = layout_service(service.into_spec(), &mut *next);
        self.server.register_attrs(attrs);
        self.characteristics.write().extend(chars.iter().map(|c| CharacteristicHandles {
            value_handle: c.value_handle,
            cccd_handle: c.cccd_handle,
        }));
        chars
    }

    /// Sends a Handle-Value-Notification for `value_handle` on `acl_handle`;
    /// no acknowledgement is expected (spec.md §4.4.4).
    pub fn send_notification(&self, acl_handle: u16, value_handle: Handle, value: Vec<u8>) {
        let pdu = self.server.notify(value_handle, value);
        self.l2cap.write_fixed(acl_handle, CID_ATT, &pdu);
    }

    /// Sends a Handle-Value-Indication for `value_handle` on `acl_handle`;
    /// the peer is expected to reply with Handle-Value-Confirmation
    /// (spec.md §4.4.4).
    pub fn send_indication(&self, acl_handle: u16, value_handle: Handle, value: Vec<u8>) {
        let pdu = self.server.indicate(value_handle, value);
        self.l2cap.write_fixed(acl_handle, CID_ATT, &pdu);
    }

    /// Whether the peer has written the notify bit into `value_handle`'s
    /// CCCD, if it has one.
    pub fn is_subscribed_for_notify(&self, value_handle: Handle) -> bool {
        self.cccd_value(value_handle).map(|v| cccd_wants_notify(&v)).unwrap_or(false)
    }

    /// Whether the peer has written the indicate bit into `value_handle`'s
    /// CCCD, if it has one.
    pub fn is_subscribed_for_indicate(&self, value_handle: Handle) -> bool {
        self.cccd_value(value_handle).map(|v| cccd_wants_indicate(&v)).unwrap_or(false)
    }

    fn cccd_value(&self, value_handle: Handle) -> Option<Vec<u8>> {
        let cccd_handle = self
            .characteristics
            .read()
            .iter()
            .find(|c| c.value_handle == value_handle)
            .and_then(|c| c.cccd_handle)?;
        self.server.read_value(cccd_handle)
    }
}

/// Reads whether a CCCD currently has the notify or indicate bit set
/// (spec.md §4.4.3: subscription state lives in the attribute value
/// itself, matching the GATT spec rather than out-of-band bookkeeping).
pub fn cccd_wants_notify(value: &[u8]) -> bool {
    value.first().map(|b| b & 0x01 != 0).unwrap_or(false)
}

pub fn cccd_wants_indicate(value: &[u8]) -> bool {
    value.first().map(|b| b & 0x02 != 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::{Dispatcher, PacketKind};
    use crate::uuid::Uuid16;
    use std::future::Future;
    use std::pin::Pin;

    struct NoopTransport;

    impl Transport for NoopTransport {
        fn send(&self, _kind: PacketKind, _bytes: Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
    }

    fn test_gatt_server() -> GattServer<NoopTransport> {
        let hci = Arc::new(Dispatcher::new(Arc::new(NoopTransport)));
        GattServer::new(Arc::new(L2capCore::new(hci)))
    }

    #[test]
    fn register_service_allocates_handles_after_existing_ones() {
        let gatt = test_gatt_server();
        let first = gatt.register_service(
            gatt.create_service(Uuid16(0x180F), ServiceKind::Primary).add_characteristic(CharacteristicSpec::new(
                Uuid16(0x2A19),
                CharacteristicProperties::READ,
                vec![100],
            )),
        );
        let second = gatt.register_service(
            gatt.create_service(Uuid16(0x1800), ServiceKind::Primary).add_characteristic(CharacteristicSpec::new(
                Uuid16(0x2A00),
                CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                b"dev".to_vec(),
            )),
        );
        assert!(second[0].value_handle.as_u16() > first[0].value_handle.as_u16());
        assert!(second[0].cccd_handle.is_some());
    }

    #[test]
    fn add_cccd_forces_a_configuration_descriptor() {
        let gatt = test_gatt_server();
        let chars = gatt.register_service(
            gatt.create_service(Uuid16(0x180D), ServiceKind::Primary)
                .add_characteristic(CharacteristicSpec::new(Uuid16(0x2A37), CharacteristicProperties::READ, vec![0]))
                .add_cccd(),
        );
        assert!(chars[0].cccd_handle.is_some());
    }

    #[test]
    fn builds_service_with_notifiable_characteristic() {
        let db = build_database(vec![ServiceSpec::primary(Uuid16(0x180F)).with_characteristic(
            CharacteristicSpec::new(Uuid16(0x2A19), CharacteristicProperties::READ | CharacteristicProperties::NOTIFY, vec![100]),
        )]);

        assert_eq!(db.table.attrs.len(), 4); // service + decl + value + cccd
        assert_eq!(db.characteristics.len(), 1);
        assert!(db.characteristics[0].cccd_handle.is_some());
        assert_eq!(db.table.attrs[0].group_end, Some(Handle::from_raw_unchecked(4)));
    }

    #[test]
    fn cccd_bit_parsing() {
        assert!(cccd_wants_notify(&[0x01, 0x00]));
        assert!(!cccd_wants_notify(&[0x02, 0x00]));
        assert!(cccd_wants_indicate(&[0x02, 0x00]));
    }
}
