//! CourierStack: a host-side Bluetooth protocol stack covering HCI
//! dispatch, L2CAP, ATT/GATT, RFCOMM and BR/EDR Secure Simple Pairing.
//!
//! The crate is organized the way the teacher organizes a layered radio
//! stack: one module per protocol layer, each exposing the types needed to
//! drive it and nothing about the layers above or below. [`CourierStack`]
//! is the only type that wires them together; everything else can be used
//! standalone against a custom [`hci::Transport`].

pub mod addr;
pub mod att;
pub mod codec;
pub mod error;
pub mod gatt;
pub mod hci;
pub mod l2cap;
pub mod pairing;
pub mod rfcomm;
pub mod sdp;
pub mod uuid;

use crate::addr::BdAddr;
use crate::att::client::AttClient;
use crate::att::pdus::AttPdu;
use crate::codec::{ByteReader, Decode};
use crate::error::CourierError;
use crate::gatt::GattServer;
use crate::hci::{Dispatcher, Transport};
use crate::l2cap::{L2capCore, CID_ATT};
use crate::pairing::{LinkKeyStore, MemoryLinkKeyStore, PairingOrchestrator};
use crate::rfcomm::RfcommCore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Construction-time configuration (spec.md §5: "pass as construction-time
/// dependencies, not process globals"), mirroring the teacher's `Config`
/// trait/struct split.
pub struct EngineConfig {
    /// Timeout applied to every `send_command_sync` call that doesn't
    /// specify its own.
    pub default_command_timeout: Duration,
    /// Default LE Credit-Based Connection initial credits (spec.md
    /// §4.3.3).
    pub default_le_credits: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_command_timeout: Duration::from_secs(5),
            default_le_credits: 10,
        }
    }
}

/// The top-level engine tying the HCI dispatcher, L2CAP core, ATT/GATT,
/// RFCOMM and pairing orchestrator together (spec.md §2's data-flow
/// diagram). Generic over the transport so embedders can plug in whatever
/// serial/USB/vendor HAL driver they have; CourierStack never talks to
/// hardware directly (spec.md §1 Non-goals).
pub struct CourierStack<T: Transport> {
    pub config: EngineConfig,
    pub hci: Arc<Dispatcher<T>>,
    pub l2cap: Arc<L2capCore<T>>,
    pub pairing: Arc<PairingOrchestrator<T>>,
    pub gatt: Arc<GattServer<T>>,
    pub rfcomm: Arc<RfcommCore<T>>,
    att_clients: Arc<DashMap<u16, Arc<AttClient<T>>>>,
}

/// ATT PDUs this crate's server answers; everything else (responses,
/// notifications, indications, confirmations) belongs to a client.
fn is_att_request(pdu: &AttPdu) -> bool {
    matches!(
        pdu,
        AttPdu::ExchangeMtuReq { .. }
            | AttPdu::ReadByGroupTypeReq { .. }
            | AttPdu::ReadByTypeReq { .. }
            | AttPdu::FindInformationReq { .. }
            | AttPdu::ReadReq { .. }
            | AttPdu::ReadBlobReq { .. }
            | AttPdu::WriteReq { .. }
            | AttPdu::WriteCmd { .. }
    )
}

impl<T: Transport> CourierStack<T> {
    pub fn new(transport: Arc<T>, config: EngineConfig) -> Self {
        let hci = Arc::new(Dispatcher::new(transport));
        let l2cap = Arc::new(L2capCore::new(hci.clone()));
        let link_keys: Arc<dyn LinkKeyStore> = Arc::new(MemoryLinkKeyStore::new());
        let pairing = Arc::new(PairingOrchestrator::new(hci.clone(), link_keys));
        let gatt = Arc::new(GattServer::new(l2cap.clone()));
        let rfcomm = RfcommCore::new(l2cap.clone());
        let att_clients: Arc<DashMap<u16, Arc<AttClient<T>>>> = Arc::new(DashMap::new());

        let hci_for_l2cap = hci.clone();
        let l2cap_for_events = l2cap.clone();
        hci.add_event_listener(move |event| {
            l2cap_for_events.handle_hci_event(event);
            let _ = &hci_for_l2cap;
        });

        let pairing_for_events = pairing.clone();
        hci.add_event_listener(move |event| {
            pairing_for_events.handle_hci_event(event);
        });

        let gatt_for_att = gatt.clone();
        let l2cap_for_att = l2cap.clone();
        let att_clients_for_listener = att_clients.clone();
        l2cap.register_fixed_channel_listener(CID_ATT, move |acl_handle, payload| {
            let mut r = ByteReader::new(&payload);
            let Ok(pdu) = AttPdu::decode(&mut r) else { return };
            if is_att_request(&pdu) {
                if let Some(response) = gatt_for_att.attribute_server().process_request(&pdu) {
                    l2cap_for_att.write_fixed(acl_handle, CID_ATT, &response);
                }
            } else {
                let client = att_clients_for_listener
                    .entry(acl_handle)
                    .or_insert_with(|| Arc::new(AttClient::new(l2cap_for_att.clone(), acl_handle)))
                    .clone();
                client.handle_pdu(pdu);
            }
        });

        Self { config, hci, l2cap, pairing, gatt, rfcomm, att_clients }
    }

    /// Feeds one raw inbound HCI event packet into the engine.
    pub fn handle_event(&self, raw: &[u8]) {
        self.hci.handle_event(raw);
    }

    /// Feeds one raw inbound ACL data packet into the engine (spec.md
    /// §4.3.1 reassembly).
    pub fn handle_acl(&self, raw: &[u8]) -> Result<(), CourierError> {
        self.l2cap.handle_acl(raw).map_err(CourierError::from)
    }

    pub fn peer_address(&self, handle: u16) -> Option<BdAddr> {
        self.l2cap.peer_address(handle)
    }

    /// Returns the ATT client bound to `acl_handle`, creating one the first
    /// time it's asked for. A fresh client has no in-flight request, so this
    /// is safe to call even before the connection has done anything ATT-
    /// related yet.
    pub fn att_client(&self, acl_handle: u16) -> Arc<AttClient<T>> {
        self.att_clients
            .entry(acl_handle)
            .or_insert_with(|| Arc::new(AttClient::new(self.l2cap.clone(), acl_handle)))
            .clone()
    }
}
