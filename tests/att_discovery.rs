//! End-to-end ATT service/characteristic discovery over a looped-back
//! L2CAP ATT channel (spec.md §8, scenario 3).

mod common;

use common::channel_transport;
use courier_stack::addr::BdAddr;
use courier_stack::att::client::AttClient;
use courier_stack::att::handle::Handle;
use courier_stack::att::pdus::AttPdu;
use courier_stack::att::server::{AttributeServer, Permissions, ServerAttribute, VecAttributeTable};
use courier_stack::codec::{ByteReader, Decode};
use courier_stack::hci::{Dispatcher, Event, PacketKind};
use courier_stack::l2cap::{L2capCore, CID_ATT};
use courier_stack::uuid::{Uuid, Uuid16};
use std::sync::Arc;

fn build_table() -> VecAttributeTable {
    VecAttributeTable {
        attrs: vec![
            ServerAttribute {
                handle: Handle::from_raw_unchecked(1),
                att_type: Uuid::Uuid16(Uuid16(0x2800)),
                value: vec![0x00, 0x18], // Battery... no, Generic Access 0x1800, LE
                permissions: Permissions::READ,
                group_end: Some(Handle::from_raw_unchecked(3)),
            },
            ServerAttribute {
                handle: Handle::from_raw_unchecked(2),
                att_type: Uuid::Uuid16(Uuid16(0x2803)),
                value: vec![0x02, 0x03, 0x00, 0x00, 0x2A], // properties=READ, value_handle=3, uuid=0x2A00
                permissions: Permissions::READ,
                group_end: None,
            },
            ServerAttribute {
                handle: Handle::from_raw_unchecked(3),
                att_type: Uuid::Uuid16(Uuid16(0x2A00)),
                value: b"courier".to_vec(),
                permissions: Permissions::READ,
                group_end: None,
            },
        ],
    }
}

#[tokio::test]
async fn discovers_one_service_and_one_characteristic() {
    let (transport, mut outbound) = channel_transport();
    let hci = Arc::new(Dispatcher::new(transport));
    let l2cap = Arc::new(L2capCore::new(hci));

    let handle = 0x0011;
    l2cap.handle_hci_event(&Event::ConnectionComplete {
        status: 0,
        handle,
        bd_addr: BdAddr::new([9, 9, 9, 9, 9, 9]),
        link_type: 1,
        encryption_enabled: false,
    });

    let client = Arc::new(AttClient::new(l2cap.clone(), handle));
    let client_for_listener = client.clone();
    l2cap.register_channel_listener(handle, CID_ATT, move |bytes| {
        let mut r = ByteReader::new(&bytes);
        if let Ok(pdu) = AttPdu::decode(&mut r) {
            client_for_listener.handle_pdu(pdu);
        }
    });

    // A background "peer" loop: decode every outbound ATT request into a
    // live AttributeServer and feed the response straight back in.
    let server = AttributeServer::new(build_table());
    let l2cap_peer = l2cap.clone();
    tokio::spawn(async move {
        while let Some((kind, bytes)) = outbound.recv().await {
            if kind != PacketKind::Acl {
                continue;
            }
            let (cid, payload) = common::strip_acl_frame(&bytes);
            if cid != CID_ATT {
                continue;
            }
            let mut r = ByteReader::new(&payload);
            let request = match AttPdu::decode(&mut r) {
                Ok(pdu) => pdu,
                Err(_) => continue,
            };
            if let Some(response) = server.process_request(&request) {
                l2cap_peer.handle_acl(&common::build_acl_frame(handle, CID_ATT, &response)).ok();
            }
        }
    });

    let services = client.discover_primary_services().await.expect("discovery succeeds");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].uuid, Uuid::Uuid16(Uuid16(0x1800)));

    let chars = client.discover_characteristics(&services[0]).await.expect("char discovery succeeds");
    assert_eq!(chars.len(), 1);
    assert_eq!(chars[0].uuid, Uuid::Uuid16(Uuid16(0x2A00)));
    assert_eq!(chars[0].value_handle, Handle::from_raw_unchecked(3));
}
