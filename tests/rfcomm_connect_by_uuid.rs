//! End-to-end RFCOMM `connect_by_uuid`: SDP channel service lookup followed
//! by mux/DLCI bring-up over a second dynamic channel (spec.md §8, scenario 5).

mod common;

use common::{build_acl_frame, channel_transport, strip_acl_frame};
use courier_stack::addr::BdAddr;
use courier_stack::codec::{ByteReader, ByteWriter, Decode, Encode};
use courier_stack::hci::{Dispatcher, Event, PacketKind};
use courier_stack::l2cap::signaling::{
    self, mtu_option, ConfigureRequest, ConfigureResponse, ConnectionRequest, ConnectionResponse, SignalingCode,
};
use courier_stack::l2cap::{L2capCore, CID_SIGNALING, PSM_RFCOMM, PSM_SDP};
use courier_stack::error::L2capResult;
use courier_stack::rfcomm::frame::{Frame, FrameType};
use courier_stack::rfcomm::mcc::{self, McCommand, PnParams};
use courier_stack::rfcomm::RfcommCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const ADVERTISED_CHANNEL: u8 = 7;

/// Hand-duplicates the private SDP wire-format helpers
/// (`sdp.rs` keeps them crate-private) to build a Service-Search-Attribute
/// response advertising one RFCOMM channel.
fn build_sdp_response(transaction_id: u16, channel: u8) -> Vec<u8> {
    // Element header byte: (kind << 3) | size_index.
    let mut protocol = ByteWriter::new();
    protocol.write_u8((3 << 3) | 1); // UUID, 2 bytes
    protocol.write_u16_be(0x0003); // RFCOMM protocol UUID
    protocol.write_u8((1 << 3) | 0); // UInt, 1 byte
    protocol.write_u8(channel);

    let mut descriptor = ByteWriter::new();
    descriptor.write_u8((6 << 3) | 5); // Seq, 1-byte length
    descriptor.write_u8(protocol.len() as u8);
    descriptor.write_slice(&protocol.into_vec());

    let mut list = ByteWriter::new();
    list.write_u8((6 << 3) | 5);
    list.write_u8(descriptor.len() as u8);
    list.write_slice(&descriptor.into_vec());

    let mut record = ByteWriter::new();
    record.write_u8((1 << 3) | 1); // UInt16 attribute id
    record.write_u16_be(0x0004); // ProtocolDescriptorList
    record.write_slice(&list.into_vec());

    let mut record_seq = ByteWriter::new();
    record_seq.write_u8((6 << 3) | 5);
    record_seq.write_u8(record.len() as u8);
    record_seq.write_slice(&record.into_vec());

    let mut records = ByteWriter::new();
    records.write_u8((6 << 3) | 5);
    records.write_u8(record_seq.len() as u8);
    records.write_slice(&record_seq.into_vec());
    let attr_bytes = records.into_vec();

    let mut params = ByteWriter::with_capacity(2 + attr_bytes.len() + 1);
    params.write_u16_be(attr_bytes.len() as u16);
    params.write_slice(&attr_bytes);
    params.write_u8(0); // no continuation

    let mut pdu = ByteWriter::with_capacity(5 + params.len());
    pdu.write_u8(0x07); // PDU_SERVICE_SEARCH_ATTRIBUTE_RESPONSE
    pdu.write_u16_be(transaction_id);
    let params_bytes = params.into_vec();
    pdu.write_u16_be(params_bytes.len() as u16);
    pdu.write_slice(&params_bytes);
    pdu.into_vec()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Sdp,
    RfcommMux,
}

/// Drives a fake BR/EDR peer answering L2CAP signaling, one SDP lookup, and
/// the RFCOMM mux/DLCI handshake, entirely from outbound bytes observed on
/// `outbound`.
async fn run_fake_peer(
    l2cap: Arc<L2capCore<common::ChannelTransport>>,
    handle: u16,
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<(PacketKind, Vec<u8>)>,
) {
    let mut next_peer_cid: u16 = 0x1000;
    let mut role_by_local_cid: HashMap<u16, Role> = HashMap::new();
    let mut peer_cid_by_local_cid: HashMap<u16, u16> = HashMap::new();
    let mut local_cid_by_peer_cid: HashMap<u16, u16> = HashMap::new();

    while let Some((kind, bytes)) = outbound.recv().await {
        if kind != PacketKind::Acl {
            continue;
        }
        let (cid, payload) = strip_acl_frame(&bytes);

        if cid == CID_SIGNALING {
            let Ok((code, id, body)) = signaling::parse_header(&payload) else { continue };
            if code != SignalingCode::ConnectionRequest {
                continue;
            }
            let mut r = ByteReader::new(&body);
            let Ok(req) = ConnectionRequest::decode(&mut r) else { continue };
            let local_cid = req.scid;
            let peer_cid = next_peer_cid;
            next_peer_cid += 1;
            let role = if req.psm == PSM_SDP { Role::Sdp } else { Role::RfcommMux };
            role_by_local_cid.insert(local_cid, role);
            peer_cid_by_local_cid.insert(local_cid, peer_cid);
            local_cid_by_peer_cid.insert(peer_cid, local_cid);

            let conn_rsp = ConnectionResponse { dcid: peer_cid, scid: local_cid, result: L2capResult::Unknown(0), status: 0x0000 };
            l2cap
                .handle_acl(&build_acl_frame(
                    handle,
                    CID_SIGNALING,
                    &signaling::wrap(SignalingCode::ConnectionResponse, id, &conn_rsp.encoded()),
                ))
                .ok();
            let cfg_req = ConfigureRequest { dcid: local_cid, flags: 0, options: mtu_option(672) };
            l2cap
                .handle_acl(&build_acl_frame(
                    handle,
                    CID_SIGNALING,
                    &signaling::wrap(SignalingCode::ConfigureRequest, id.wrapping_add(1), &cfg_req.encoded()),
                ))
                .ok();
            let cfg_rsp = ConfigureResponse { scid: local_cid, flags: 0, result: 0, options: vec![] };
            l2cap
                .handle_acl(&build_acl_frame(
                    handle,
                    CID_SIGNALING,
                    &signaling::wrap(SignalingCode::ConfigureResponse, id.wrapping_add(2), &cfg_rsp.encoded()),
                ))
                .ok();
            continue;
        }

        let Some(&local_cid) = local_cid_by_peer_cid.get(&cid) else { continue };
        let role = role_by_local_cid[&local_cid];

        match role {
            Role::Sdp => {
                // Expect a Service-Search-Attribute request; any transaction
                // id is accepted since we don't validate the pattern here.
                if payload.first() != Some(&0x06) {
                    continue;
                }
                let response = build_sdp_response(1, ADVERTISED_CHANNEL);
                l2cap.handle_acl(&build_acl_frame(handle, local_cid, &response)).ok();
            }
            Role::RfcommMux => {
                let mut r = ByteReader::new(&payload);
                let Ok(frame) = Frame::decode(&mut r) else { continue };
                if frame.dlci == 0 {
                    match frame.frame_type {
                        FrameType::Sabm => {
                            let reply = Frame { dlci: 0, command: false, frame_type: FrameType::Ua, poll_final: true, data: vec![] };
                            l2cap.handle_acl(&build_acl_frame(handle, local_cid, &reply.encoded())).ok();
                        }
                        FrameType::Uih => {
                            if let Ok((McCommand::Pn(params), true)) = mcc::decode(&frame.data) {
                                let resp = PnParams { initial_credits: 7, ..params };
                                let body = mcc::encode(&McCommand::Pn(resp), false);
                                let reply = Frame { dlci: 0, command: false, frame_type: FrameType::Uih, poll_final: false, data: body };
                                l2cap.handle_acl(&build_acl_frame(handle, local_cid, &reply.encoded())).ok();
                            }
                        }
                        _ => {}
                    }
                } else if frame.frame_type == FrameType::Sabm {
                    let reply = Frame { dlci: frame.dlci, command: false, frame_type: FrameType::Ua, poll_final: true, data: vec![] };
                    l2cap.handle_acl(&build_acl_frame(handle, local_cid, &reply.encoded())).ok();
                }
            }
        }
    }
}

#[tokio::test]
async fn connect_by_uuid_resolves_channel_via_sdp_then_opens_the_dlci() {
    let (transport, outbound) = channel_transport();
    let hci = Arc::new(Dispatcher::new(transport));
    let l2cap = Arc::new(L2capCore::new(hci));

    let handle = 0x0099;
    l2cap.handle_hci_event(&Event::ConnectionComplete {
        status: 0,
        handle,
        bd_addr: BdAddr::new([2, 2, 2, 2, 2, 2]),
        link_type: 1,
        encryption_enabled: false,
    });

    tokio::spawn(run_fake_peer(l2cap.clone(), handle, outbound));

    let rfcomm = RfcommCore::new(l2cap.clone());
    let service_uuid = courier_stack::uuid::Uuid128::from(
        uuid::Uuid::parse_str("00001101-0000-1000-8000-00805f9b34fb").unwrap(),
    );

    let (local_cid, dlci) = tokio::time::timeout(Duration::from_secs(2), rfcomm.connect_by_uuid(handle, service_uuid))
        .await
        .expect("connect_by_uuid did not time out")
        .expect("connect_by_uuid succeeds");

    assert_eq!(dlci >> 1, ADVERTISED_CHANNEL);
    assert_ne!(local_cid, 0);
}
