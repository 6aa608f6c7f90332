//! End-to-end ATT MTU exchange (spec.md §8, scenario 1).

use courier_stack::att::handle::Handle;
use courier_stack::att::pdus::AttPdu;
use courier_stack::att::server::{AttributeServer, Permissions, ServerAttribute, VecAttributeTable};

#[test]
fn exchange_mtu_negotiates_the_smaller_value_and_replies() {
    let table = VecAttributeTable {
        attrs: vec![ServerAttribute {
            handle: Handle::from_raw_unchecked(1),
            att_type: courier_stack::uuid::Uuid::Uuid16(courier_stack::uuid::Uuid16(0x2800)),
            value: vec![0x00, 0x18],
            permissions: Permissions::READ,
            group_end: Some(Handle::from_raw_unchecked(1)),
        }],
    };
    let server = AttributeServer::new(table);

    let response = server
        .process_request(&AttPdu::ExchangeMtuReq { client_rx_mtu: 500 })
        .expect("exchange mtu always yields a response");

    // opcode 0x03 (Exchange-MTU-Response), server_rx_mtu=517 little-endian.
    assert_eq!(response, vec![0x03, 0x05, 0x02]);
    assert_eq!(server.mtu(), 500);
}

#[test]
fn exchange_mtu_never_negotiates_below_the_default() {
    let server = AttributeServer::new(VecAttributeTable::default());

    let response = server
        .process_request(&AttPdu::ExchangeMtuReq { client_rx_mtu: 5 })
        .expect("exchange mtu always yields a response");

    assert_eq!(response, vec![0x03, 0x05, 0x02]);
    assert_eq!(server.mtu(), 23);
}
