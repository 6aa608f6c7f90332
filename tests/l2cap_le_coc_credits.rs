//! End-to-end LE Credit-Based Connection flow control (spec.md §8, scenario 4).

mod common;

use common::{build_acl_frame, channel_transport};
use courier_stack::addr::BdAddr;
use courier_stack::codec::Encode;
use courier_stack::error::L2capError;
use courier_stack::hci::{Dispatcher, Event};
use courier_stack::l2cap::signaling::{FlowControlCreditInd, LeCreditBasedConnectionResponse};
use courier_stack::l2cap::{L2capCore, CID_LE_SIGNALING};

#[tokio::test]
async fn write_coc_refuses_once_peer_credits_are_exhausted_then_resumes_after_credit_ind() {
    let (transport, _rx) = channel_transport();
    let hci = std::sync::Arc::new(Dispatcher::new(transport));
    let l2cap = std::sync::Arc::new(L2capCore::new(hci));

    let handle = 0x0077;
    l2cap.handle_hci_event(&Event::LeConnectionComplete {
        status: 0,
        handle,
        role: 0,
        peer_address_type: 0,
        peer_address: BdAddr::new([1, 1, 1, 1, 1, 1]),
        local_resolvable_private_address: None,
    });

    let local_cid = l2cap.connect_le_coc(handle, 0x0025, 250, 250, 0).expect("outbound coc connect");

    let resp = LeCreditBasedConnectionResponse { dcid: 0x0090, mtu: 250, mps: 250, initial_credits: 2, result: 0 };
    l2cap
        .handle_acl(&build_acl_frame(
            handle,
            CID_LE_SIGNALING,
            &courier_stack::l2cap::signaling::wrap(
                courier_stack::l2cap::signaling::SignalingCode::LeCreditBasedConnectionResponse,
                1,
                &resp.encoded(),
            ),
        ))
        .expect("le coc response accepted");

    l2cap.write_coc(handle, local_cid, b"one").expect("first credit available");
    l2cap.write_coc(handle, local_cid, b"two").expect("second credit available");
    let exhausted = l2cap.write_coc(handle, local_cid, b"three");
    assert!(matches!(exhausted, Err(L2capError::NoCredits)));

    let credit_ind = FlowControlCreditInd { cid: local_cid, credits: 5 };
    l2cap
        .handle_acl(&build_acl_frame(
            handle,
            CID_LE_SIGNALING,
            &courier_stack::l2cap::signaling::wrap(
                courier_stack::l2cap::signaling::SignalingCode::FlowControlCreditInd,
                2,
                &credit_ind.encoded(),
            ),
        ))
        .expect("credit ind accepted");

    for _ in 0..5 {
        l2cap.write_coc(handle, local_cid, b"more").expect("replenished credit available");
    }
    let exhausted_again = l2cap.write_coc(handle, local_cid, b"over");
    assert!(matches!(exhausted_again, Err(L2capError::NoCredits)));
}
