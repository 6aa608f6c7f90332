//! End-to-end L2CAP dynamic-channel configuration (spec.md §8, scenario 2).

mod common;

use common::{build_acl_frame, channel_transport};
use courier_stack::addr::BdAddr;
use courier_stack::hci::{Dispatcher, Event};
use courier_stack::l2cap::signaling::{ConfigureRequest, ConfigureResponse, ConnectionResponse, mtu_option};
use courier_stack::l2cap::{L2capCore, CID_SIGNALING, PSM_RFCOMM};
use courier_stack::codec::Encode;
use courier_stack::error::L2capResult;
use std::sync::Arc;

#[tokio::test]
async fn outbound_channel_opens_after_connection_response_and_configure_exchange() {
    let (transport, _rx) = channel_transport();
    let hci = Arc::new(Dispatcher::new(transport));
    let l2cap = Arc::new(L2capCore::new(hci));

    let handle = 0x0042;
    l2cap.handle_hci_event(&Event::ConnectionComplete {
        status: 0,
        handle,
        bd_addr: BdAddr::new([1, 2, 3, 4, 5, 6]),
        link_type: 1,
        encryption_enabled: false,
    });

    let local_cid = l2cap.connect(handle, PSM_RFCOMM).expect("outbound connect");
    let peer_cid = 0x0050;

    let l2cap_waiter = l2cap.clone();
    let wait_handle = tokio::spawn(async move { l2cap_waiter.await_open(handle, local_cid).await });
    tokio::task::yield_now().await;

    let conn_rsp = ConnectionResponse { dcid: peer_cid, scid: local_cid, result: L2capResult::Unknown(0), status: 0x0000 };
    l2cap
        .handle_acl(&build_acl_frame(handle, CID_SIGNALING, &courier_stack::l2cap::signaling::wrap(
            courier_stack::l2cap::signaling::SignalingCode::ConnectionResponse,
            1,
            &conn_rsp.encoded(),
        )))
        .expect("connection response accepted");
    tokio::task::yield_now().await;

    let configure_req = ConfigureRequest { dcid: local_cid, flags: 0, options: mtu_option(672) };
    l2cap
        .handle_acl(&build_acl_frame(handle, CID_SIGNALING, &courier_stack::l2cap::signaling::wrap(
            courier_stack::l2cap::signaling::SignalingCode::ConfigureRequest,
            2,
            &configure_req.encoded(),
        )))
        .expect("configure request accepted");
    tokio::task::yield_now().await;

    let configure_rsp = ConfigureResponse { scid: local_cid, flags: 0, result: 0, options: vec![] };
    l2cap
        .handle_acl(&build_acl_frame(handle, CID_SIGNALING, &courier_stack::l2cap::signaling::wrap(
            courier_stack::l2cap::signaling::SignalingCode::ConfigureResponse,
            3,
            &configure_rsp.encoded(),
        )))
        .expect("configure response accepted");

    let result = tokio::time::timeout(std::time::Duration::from_secs(1), wait_handle)
        .await
        .expect("await_open did not time out")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(l2cap.remote_cid(handle, local_cid), Some(peer_cid));
}
