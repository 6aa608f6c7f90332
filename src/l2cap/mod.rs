//! L2CAP: ACL reassembly, dynamic channel signaling and LE Credit-Based
//! Connections (Vol 3 Part A), sitting directly on [`crate::hci::Dispatcher`].
//!
//! The connection table is a concurrent map the way the teacher's
//! `link::Responder`/`ll` keeps per-link state, but keyed by ACL handle with
//! `dashmap` instead of the teacher's single-connection `no_std` field,
//! since this crate serves many concurrent ACL links (spec.md §4.3.1).

pub mod channel;
pub mod signaling;

use crate::addr::{BdAddr, LinkTransport};
use crate::codec::{ByteReader, ByteWriter, Decode as _, Encode as _};
use crate::error::{CodecError, L2capError, L2capResult};
use crate::hci::{Dispatcher, Event, Transport};
use channel::{allocate_cid, Channel, ChannelState, CreditState};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

pub use channel::{ChannelState as DynamicChannelState, CID_ATT, CID_LE_SIGNALING, CID_SIGNALING};

/// Service Discovery Protocol PSM (Vol 3 Part B): special-cased in inbound
/// Connection Request handling per spec.md §4.3.2.
pub const PSM_SDP: u16 = 0x0001;
/// RFCOMM PSM (spec.md §2 data-flow table).
pub const PSM_RFCOMM: u16 = 0x0003;

struct Reassembly {
    cid: u16,
    expected_len: usize,
    buf: Vec<u8>,
}

struct AclConnection {
    peer_address: BdAddr,
    transport: LinkTransport,
    reassembly: Option<Reassembly>,
}

/// One registered listener for inbound connections on a PSM (spec.md
/// §4.3.2: "an application registers interest in a PSM before a peer can
/// connect to it").
type AcceptCallback = Box<dyn Fn(u16, u16) + Send + Sync>;

/// A sink for inbound payload on a fixed channel (keyed only by CID, shared
/// across every ACL handle) — the shape `register_fixed_channel_listener`
/// exposes for ATT's CID 0x0004 (spec.md §6).
type FixedChannelSink = Box<dyn Fn(u16, Vec<u8>) + Send + Sync>;
/// A sink for inbound payload on one specific dynamic channel, registered
/// once a higher layer (RFCOMM) owns that CID (spec.md §4.5).
type ChannelSink = Box<dyn Fn(Vec<u8>) + Send + Sync>;
/// Waiters parked on a dynamic channel reaching OPEN or being torn down
/// (spec.md §4.3.2: "only then is the opening callback fulfilled").
type OpenWaiter = oneshot::Sender<Result<(), L2capError>>;

pub struct L2capCore<T: Transport> {
    hci: Arc<Dispatcher<T>>,
    connections: DashMap<u16, AclConnection>,
    channels: DashMap<(u16, u16), Channel>,
    listening_psms: DashMap<u16, AcceptCallback>,
    fixed_listeners: DashMap<u16, FixedChannelSink>,
    channel_listeners: DashMap<(u16, u16), ChannelSink>,
    open_waiters: DashMap<(u16, u16), Vec<OpenWaiter>>,
    next_identifier: AtomicU8,
    default_mtu: u16,
}

impl<T: Transport> L2capCore<T> {
    pub fn new(hci: Arc<Dispatcher<T>>) -> Self {
        Self {
            hci,
            connections: DashMap::new(),
            channels: DashMap::new(),
            listening_psms: DashMap::new(),
            fixed_listeners: DashMap::new(),
            channel_listeners: DashMap::new(),
            open_waiters: DashMap::new(),
            next_identifier: AtomicU8::new(1),
            default_mtu: 672, // Vol 3 Part A §5.1 default signaling MTU floor
        }
    }

    /// Registers a sink for every inbound payload on a fixed channel CID
    /// (e.g. ATT's 0x0004), across every ACL handle (spec.md §6:
    /// `register_fixed_channel_listener(cid)`).
    pub fn register_fixed_channel_listener(&self, cid: u16, f: impl Fn(u16, Vec<u8>) + Send + Sync + 'static) {
        self.fixed_listeners.insert(cid, Box::new(f));
    }

    /// Registers a sink for inbound payload on one dynamic channel, used by
    /// RFCOMM once it owns a local CID on PSM 0x0003 (spec.md §4.5).
    pub fn register_channel_listener(&self, handle: u16, local_cid: u16, f: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        self.channel_listeners.insert((handle, local_cid), Box::new(f));
    }

    pub fn remove_channel_listener(&self, handle: u16, local_cid: u16) {
        self.channel_listeners.remove(&(handle, local_cid));
    }

    /// Resolves once the dynamic channel reaches OPEN, or immediately if it
    /// already has. Errs if the channel closes/gets refused first. Used by
    /// RFCOMM to know when its L2CAP transport is ready for mux SABM
    /// (spec.md §4.5.1) instead of polling channel state.
    pub async fn await_open(&self, handle: u16, local_cid: u16) -> Result<(), L2capError> {
        if let Some(ch) = self.channels.get(&(handle, local_cid)) {
            if ch.is_open() {
                return Ok(());
            }
        } else {
            return Err(L2capError::ChannelClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.open_waiters.entry((handle, local_cid)).or_default().push(tx);
        // Re-check after registering: the channel may have opened between
        // the check above and the insert.
        if let Some(ch) = self.channels.get(&(handle, local_cid)) {
            if ch.is_open() {
                self.resolve_open_waiters(handle, local_cid, Ok(()));
            }
        }
        rx.await.map_err(|_| L2capError::ChannelClosed)?
    }

    fn resolve_open_waiters(&self, handle: u16, local_cid: u16, result: Result<(), L2capError>) {
        if let Some((_, waiters)) = self.open_waiters.remove(&(handle, local_cid)) {
            for w in waiters {
                let _ = w.send(result.clone());
            }
        }
    }

    fn next_id(&self) -> u8 {
        // Identifiers 0x00 and nothing else are reserved; wrap through 1..=255.
        let id = self.next_identifier.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.next_identifier.store(2, Ordering::Relaxed);
            1
        } else {
            id
        }
    }

    pub fn peer_address(&self, handle: u16) -> Option<BdAddr> {
        self.connections.get(&handle).map(|c| c.peer_address)
    }

    /// Reverse lookup from peer address to ACL handle, for callers (RFCOMM,
    /// the external API) that only know the address, not the handle.
    pub fn handle_for_addr(&self, addr: BdAddr) -> Option<u16> {
        self.connections.iter().find(|e| e.peer_address == addr).map(|e| *e.key())
    }

    /// The peer's CID for a dynamic channel we own, i.e. the CID to put in
    /// the outbound L2CAP header (spec.md §4.3.2's `(local-cid, remote-cid)`
    /// pair) — needed by callers writing through [`L2capCore::write_fixed`]
    /// on a dynamic channel rather than a fixed one like ATT's 0x0004, where
    /// local and remote CIDs always coincide.
    pub fn remote_cid(&self, handle: u16, local_cid: u16) -> Option<u16> {
        self.channels.get(&(handle, local_cid)).map(|ch| ch.remote_cid)
    }

    /// Registers a PSM as acceptable for inbound Connection Requests. Called
    /// once per service a peer might connect to (e.g. RFCOMM's 0x0003).
    pub fn listen(&self, psm: u16, on_accept: impl Fn(u16, u16) + Send + Sync + 'static) {
        self.listening_psms.insert(psm, Box::new(on_accept));
    }

    /// Creates and tracks an ACL connection entry on Connection-Complete /
    /// LE-(Enhanced-)Connection-Complete events. Called from the engine's
    /// event fan-out.
    pub fn handle_hci_event(&self, event: &Event) {
        match event {
            Event::ConnectionComplete { status: 0, handle, bd_addr, .. } => {
                self.connections.insert(
                    *handle,
                    AclConnection { peer_address: *bd_addr, transport: LinkTransport::BrEdr, reassembly: None },
                );
            }
            Event::LeConnectionComplete { status: 0, handle, peer_address, .. } => {
                self.connections.insert(
                    *handle,
                    AclConnection { peer_address: *peer_address, transport: LinkTransport::Le, reassembly: None },
                );
            }
            Event::DisconnectionComplete { handle, .. } => {
                self.connections.remove(handle);
                let dead_cids: Vec<u16> = self
                    .channels
                    .iter()
                    .filter(|e| e.key().0 == *handle)
                    .map(|e| e.key().1)
                    .collect();
                self.channels.retain(|(h, _), _| h != handle);
                for cid in dead_cids {
                    self.channel_listeners.remove(&(*handle, cid));
                    self.resolve_open_waiters(*handle, cid, Err(L2capError::ChannelClosed));
                }
            }
            _ => {}
        }
    }

    /// Feeds one raw HCI ACL Data packet
    /// `[handle_flags:16][total_len:16][payload...]` into reassembly
    /// (spec.md §4.3.1). Dispatches the completed L2CAP frame once fully
    /// reassembled.
    pub fn handle_acl(&self, raw: &[u8]) -> Result<(), L2capError> {
        let mut r = ByteReader::new(raw);
        let handle_flags = r.read_u16_le()?;
        let handle = handle_flags & 0x0FFF;
        let pb_flag = (handle_flags >> 12) & 0x3;
        let total_len = r.read_u16_le()? as usize;
        let data = r.read_vec(total_len)?;

        if !self.connections.contains_key(&handle) {
            return Err(L2capError::UnknownHandle(handle));
        }

        let complete = {
            let mut conn = self.connections.get_mut(&handle).ok_or(L2capError::UnknownHandle(handle))?;
            match pb_flag {
                0b00 | 0b10 => {
                    // First fragment: carries the L2CAP header.
                    let mut fr = ByteReader::new(&data);
                    let l2cap_len = fr.read_u16_le()? as usize;
                    let cid = fr.read_u16_le()?;
                    let payload = fr.read_rest();
                    if payload.len() >= l2cap_len {
                        Some((cid, payload[..l2cap_len].to_vec()))
                    } else {
                        conn.reassembly = Some(Reassembly { cid, expected_len: l2cap_len, buf: payload });
                        None
                    }
                }
                0b01 => {
                    let reassembly = conn.reassembly.as_mut().ok_or(L2capError::UnexpectedContinuation)?;
                    reassembly.buf.extend_from_slice(&data);
                    if reassembly.buf.len() >= reassembly.expected_len {
                        let cid = reassembly.cid;
                        let mut buf = std::mem::take(&mut reassembly.buf);
                        buf.truncate(reassembly.expected_len);
                        conn.reassembly = None;
                        Some((cid, buf))
                    } else {
                        None
                    }
                }
                _ => return Err(CodecError::InvalidValue { field: "pb_flag" }.into()),
            }
        };

        if let Some((cid, payload)) = complete {
            self.dispatch_frame(handle, cid, payload)?;
        }
        Ok(())
    }

    fn dispatch_frame(&self, handle: u16, cid: u16, payload: Vec<u8>) -> Result<(), L2capError> {
        match cid {
            CID_SIGNALING | CID_LE_SIGNALING => self.handle_signaling(handle, &payload),
            _ => {
                // LE CoC credit bookkeeping happens at this layer regardless
                // of who consumes the payload above it.
                if let Some(mut ch) = self.channels.get_mut(&(handle, cid)) {
                    if let Some(credits) = ch.credits.as_mut() {
                        if credits.local_credits > 0 {
                            credits.local_credits -= 1;
                        }
                    }
                }
                if let Some(listener) = self.fixed_listeners.get(&cid) {
                    listener(handle, payload);
                } else if let Some(listener) = self.channel_listeners.get(&(handle, cid)) {
                    listener(payload);
                }
                Ok(())
            }
        }
    }

    fn send_frame(&self, handle: u16, cid: u16, payload: &[u8]) {
        let mut w = ByteWriter::with_capacity(8 + payload.len());
        w.write_u16_le(handle & 0x0FFF | (0b10 << 12)); // first-fragment, PB=10
        let body_len = 4 + payload.len();
        w.write_u16_le(body_len as u16);
        w.write_u16_le(payload.len() as u16);
        w.write_u16_le(cid);
        w.write_slice(payload);
        let bytes = w.into_vec();
        let hci = self.hci.clone();
        tokio::spawn(async move {
            hci.send_acl(bytes).await;
        });
    }

    fn signaling_cid_for(&self, handle: u16) -> u16 {
        match self.connections.get(&handle).map(|c| c.transport) {
            Some(LinkTransport::Le) => CID_LE_SIGNALING,
            _ => CID_SIGNALING,
        }
    }

    fn handle_signaling(&self, handle: u16, payload: &[u8]) -> Result<(), L2capError> {
        let (code, id, body) = signaling::parse_header(payload)?;
        use signaling::SignalingCode::*;
        match code {
            ConnectionRequest => self.handle_connection_request(handle, id, &body)?,
            ConnectionResponse => self.handle_connection_response(handle, &body)?,
            ConfigureRequest => self.handle_configure_request(handle, id, &body)?,
            ConfigureResponse => self.handle_configure_response(handle, &body)?,
            DisconnectionRequest => self.handle_disconnection_request(handle, id, &body)?,
            EchoRequest => {
                let resp = signaling::wrap(signaling::SignalingCode::EchoResponse, id, &body);
                self.send_frame(handle, self.signaling_cid_for(handle), &resp);
            }
            InformationRequest => {
                let mut r = ByteReader::new(&body);
                let info_type = r.read_u16_le()?;
                let resp_body = signaling::information_response_body(info_type);
                let resp = signaling::wrap(signaling::SignalingCode::InformationResponse, id, &resp_body);
                self.send_frame(handle, self.signaling_cid_for(handle), &resp);
            }
            LeCreditBasedConnectionRequest => self.handle_le_coc_request(handle, id, &body)?,
            LeCreditBasedConnectionResponse => self.handle_le_coc_response(handle, &body)?,
            FlowControlCreditInd => self.handle_credit_ind(handle, &body)?,
            _ => {}
        }
        Ok(())
    }

    fn handle_connection_request(&self, handle: u16, id: u8, body: &[u8]) -> Result<(), L2capError> {
        use signaling::{wrap, ConnectionRequest, ConnectionResponse, SignalingCode};
        let mut r = ByteReader::new(body);
        let req = ConnectionRequest::decode(&mut r)?;

        let is_le = matches!(self.connections.get(&handle).map(|c| c.transport), Some(LinkTransport::Le));
        if !self.listening_psms.contains_key(&req.psm) {
            // PSM 0x0001 (SDP) without a registered server replies PENDING
            // instead of PSM-not-supported: some peers abort pairing on a
            // flat refusal of an SDP connection attempt (spec.md §4.3.2).
            let (result, status) = if req.psm == PSM_SDP {
                (L2capResult::Pending, 0x0001) // "Authentication Pending"
            } else {
                (L2capResult::PsmNotSupported, 0x0000)
            };
            let resp = ConnectionResponse { dcid: 0, scid: req.scid, result, status };
            self.send_frame(handle, self.signaling_cid_for(handle), &wrap(SignalingCode::ConnectionResponse, id, &resp.encoded()));
            return Ok(());
        }

        let local_cid = allocate_cid(is_le, |cid| self.channels.contains_key(&(handle, cid)))?;
        let mut channel = Channel::new_inbound(handle, local_cid, req.scid, req.psm, self.default_mtu);
        channel.enter_config();
        self.channels.insert((handle, local_cid), channel);

        let resp = ConnectionResponse { dcid: local_cid, scid: req.scid, result: L2capResult::Unknown(0), status: 0x0000 };
        self.send_frame(handle, self.signaling_cid_for(handle), &wrap(SignalingCode::ConnectionResponse, id, &resp.encoded()));

        if let Some(cb) = self.listening_psms.get(&req.psm) {
            cb(handle, local_cid);
        }
        Ok(())
    }

    /// Handles the response to our own outbound Connection Request
    /// (spec.md §4.3.2): SUCCESS moves to CONFIG and sends our own
    /// Configuration Request; PENDING waits for a follow-up; anything else
    /// fails the pending open and drops the channel.
    fn handle_connection_response(&self, handle: u16, body: &[u8]) -> Result<(), L2capError> {
        use signaling::ConnectionResponse;
        let mut r = ByteReader::new(body);
        let resp = ConnectionResponse::decode(&mut r)?;

        let is_success = matches!(resp.result, L2capResult::Unknown(0));
        if is_success {
            let local_mtu = {
                let mut ch = match self.channels.get_mut(&(handle, resp.scid)) {
                    Some(ch) => ch,
                    None => return Ok(()),
                };
                ch.remote_cid = resp.dcid;
                ch.enter_config();
                ch.local_mtu
            };
            let id = self.next_id();
            let req = signaling::ConfigureRequest { dcid: resp.dcid, flags: 0, options: signaling::mtu_option(local_mtu) };
            self.send_frame(
                handle,
                self.signaling_cid_for(handle),
                &signaling::wrap(signaling::SignalingCode::ConfigureRequest, id, &req.encoded()),
            );
        } else if matches!(resp.result, L2capResult::Pending) {
            // Remain WAIT_CONNECT_RSP awaiting a follow-up response.
        } else {
            self.channels.remove(&(handle, resp.scid));
            self.resolve_open_waiters(handle, resp.scid, Err(L2capError::ConnectionRefused(resp.result)));
        }
        Ok(())
    }

    fn handle_configure_request(&self, handle: u16, id: u8, body: &[u8]) -> Result<(), L2capError> {
        use signaling::{wrap, ConfigureRequest, ConfigureResponse, SignalingCode};
        let mut r = ByteReader::new(body);
        let req = ConfigureRequest::decode(&mut r)?;

        let now_open = if let Some(mut ch) = self.channels.get_mut(&(handle, req.dcid)) {
            ch.mark_remote_config_done();
            ch.is_open()
        } else {
            false
        };

        let resp = ConfigureResponse { scid: req.dcid, flags: 0, result: 0, options: req.options };
        self.send_frame(handle, self.signaling_cid_for(handle), &wrap(SignalingCode::ConfigureResponse, id, &resp.encoded()));
        if now_open {
            self.resolve_open_waiters(handle, req.dcid, Ok(()));
        }
        Ok(())
    }

    fn handle_configure_response(&self, handle: u16, body: &[u8]) -> Result<(), L2capError> {
        use signaling::ConfigureResponse;
        let mut r = ByteReader::new(body);
        let resp = ConfigureResponse::decode(&mut r)?;
        let now_open = if let Some(mut ch) = self.channels.get_mut(&(handle, resp.scid)) {
            ch.mark_local_config_done();
            ch.is_open()
        } else {
            false
        };
        if now_open {
            self.resolve_open_waiters(handle, resp.scid, Ok(()));
        }
        Ok(())
    }

    fn handle_disconnection_request(&self, handle: u16, id: u8, body: &[u8]) -> Result<(), L2capError> {
        use signaling::{wrap, DisconnectionRequest, SignalingCode};
        let mut r = ByteReader::new(body);
        let req = DisconnectionRequest::decode(&mut r)?;
        self.channels.remove(&(handle, req.dcid));
        self.channel_listeners.remove(&(handle, req.dcid));
        self.resolve_open_waiters(handle, req.dcid, Err(L2capError::ChannelClosed));
        self.send_frame(handle, self.signaling_cid_for(handle), &wrap(SignalingCode::DisconnectionResponse, id, body));
        Ok(())
    }

    /// Initiates a graceful disconnect of a dynamic channel (spec.md
    /// §4.3.2: "either side may send Disconnection-Request").
    pub fn disconnect(&self, handle: u16, local_cid: u16) -> Result<(), L2capError> {
        let ch = self.channels.get(&(handle, local_cid)).ok_or(L2capError::ChannelClosed)?;
        let remote_cid = ch.remote_cid;
        drop(ch);
        let req = signaling::DisconnectionRequest { dcid: remote_cid, scid: local_cid };
        let id = self.next_id();
        self.send_frame(
            handle,
            self.signaling_cid_for(handle),
            &signaling::wrap(signaling::SignalingCode::DisconnectionRequest, id, &req.encoded()),
        );
        self.channels.remove(&(handle, local_cid));
        self.channel_listeners.remove(&(handle, local_cid));
        Ok(())
    }

    /// Initiates a dynamic channel connection on `psm` over `handle`
    /// (spec.md §4.3.2). Returns the locally-allocated CID immediately; the
    /// channel transitions to OPEN asynchronously once signaling completes.
    pub fn connect(&self, handle: u16, psm: u16) -> Result<u16, L2capError> {
        let is_le = matches!(self.connections.get(&handle).map(|c| c.transport), Some(LinkTransport::Le));
        let local_cid = allocate_cid(is_le, |cid| self.channels.contains_key(&(handle, cid)))?;
        self.channels.insert((handle, local_cid), Channel::new_outbound(handle, local_cid, psm, self.default_mtu));

        let req = signaling::ConnectionRequest { psm, scid: local_cid };
        let id = self.next_id();
        self.send_frame(handle, self.signaling_cid_for(handle), &signaling::wrap(signaling::SignalingCode::ConnectionRequest, id, &req.encoded()));
        Ok(local_cid)
    }

    fn handle_le_coc_request(&self, handle: u16, id: u8, body: &[u8]) -> Result<(), L2capError> {
        use signaling::{wrap, LeCreditBasedConnectionRequest, LeCreditBasedConnectionResponse, SignalingCode};
        let mut r = ByteReader::new(body);
        let req = LeCreditBasedConnectionRequest::decode(&mut r)?;

        if !self.listening_psms.contains_key(&req.psm) {
            let resp = LeCreditBasedConnectionResponse { dcid: 0, mtu: 0, mps: 0, initial_credits: 0, result: 0x0002 };
            self.send_frame(handle, self.signaling_cid_for(handle), &wrap(SignalingCode::LeCreditBasedConnectionResponse, id, &resp.encoded()));
            return Ok(());
        }

        let local_cid = allocate_cid(true, |cid| self.channels.contains_key(&(handle, cid)))?;
        let mut channel = Channel::new_inbound(handle, local_cid, req.scid, req.psm, req.mtu);
        channel.remote_mtu = req.mtu;
        channel.credits = Some(CreditState { local_credits: 10, peer_credits: req.initial_credits, mps: req.mps.min(self.default_mtu) });
        channel.state = ChannelState::Open;
        self.channels.insert((handle, local_cid), channel);

        let resp = LeCreditBasedConnectionResponse {
            dcid: local_cid,
            mtu: self.default_mtu,
            mps: self.default_mtu.min(req.mps),
            initial_credits: 10,
            result: 0,
        };
        self.send_frame(handle, self.signaling_cid_for(handle), &wrap(SignalingCode::LeCreditBasedConnectionResponse, id, &resp.encoded()));

        if let Some(cb) = self.listening_psms.get(&req.psm) {
            cb(handle, local_cid);
        }
        Ok(())
    }

    /// Initiates an LE Credit-Based Connection (spec.md §4.3.3).
    pub fn connect_le_coc(&self, handle: u16, psm: u16, mtu: u16, mps: u16, initial_credits: u16) -> Result<u16, L2capError> {
        let local_cid = allocate_cid(true, |cid| self.channels.contains_key(&(handle, cid)))?;
        let mut channel = Channel::new_outbound(handle, local_cid, psm, mtu);
        channel.credits = Some(CreditState { local_credits: initial_credits, peer_credits: 0, mps });
        self.channels.insert((handle, local_cid), channel);

        let req = signaling::LeCreditBasedConnectionRequest { psm, scid: local_cid, mtu, mps, initial_credits };
        let id = self.next_id();
        self.send_frame(handle, self.signaling_cid_for(handle), &signaling::wrap(signaling::SignalingCode::LeCreditBasedConnectionRequest, id, &req.encoded()));
        Ok(local_cid)
    }

    fn handle_le_coc_response(&self, handle: u16, body: &[u8]) -> Result<(), L2capError> {
        use signaling::LeCreditBasedConnectionResponse;
        let mut r = ByteReader::new(body);
        let resp = LeCreditBasedConnectionResponse::decode(&mut r)?;
        if resp.result != 0 {
            // dcid is 0 on most LE CoC failure results, so find the pending
            // channel the same way as the success path rather than trusting it.
            let local_cid = self
                .channels
                .iter()
                .find(|e| e.key().0 == handle && e.state == ChannelState::WaitConnect)
                .map(|e| e.key().1);
            if let Some(local_cid) = local_cid {
                self.channels.remove(&(handle, local_cid));
                self.resolve_open_waiters(handle, local_cid, Err(L2capError::ConnectionRefused(L2capResult::Unknown(resp.result))));
            }
            return Ok(());
        }
        // dcid here is the *peer's* local CID == our remote_cid; we look up
        // the pending channel by iterating since we only know our own CID.
        let local_cid = {
            let found = self.channels.iter_mut().find(|e| e.key().0 == handle && e.state == ChannelState::WaitConnect);
            match found {
                Some(mut entry) => {
                    entry.remote_cid = resp.dcid;
                    entry.remote_mtu = resp.mtu;
                    if let Some(credits) = entry.credits.as_mut() {
                        credits.peer_credits = resp.initial_credits;
                        credits.mps = credits.mps.min(resp.mps);
                    }
                    entry.state = ChannelState::Open;
                    Some(*entry.key())
                }
                None => None,
            }
        };
        if let Some((handle, local_cid)) = local_cid {
            self.resolve_open_waiters(handle, local_cid, Ok(()));
        }
        Ok(())
    }

    fn handle_credit_ind(&self, handle: u16, body: &[u8]) -> Result<(), L2capError> {
        use signaling::FlowControlCreditInd;
        let mut r = ByteReader::new(body);
        let ind = FlowControlCreditInd::decode(&mut r)?;
        if let Some(mut ch) = self.channels.get_mut(&(handle, ind.cid)) {
            if let Some(credits) = ch.credits.as_mut() {
                credits.peer_credits = credits.peer_credits.saturating_add(ind.credits);
            }
        }
        Ok(())
    }

    /// Writes `payload` on an open LE Credit-Based Connection channel,
    /// consuming one peer credit (spec.md §4.3.3: "refuse to write when
    /// peer credits are zero").
    pub fn write_coc(&self, handle: u16, local_cid: u16, payload: &[u8]) -> Result<(), L2capError> {
        let mut ch = self.channels.get_mut(&(handle, local_cid)).ok_or(L2capError::UnknownHandle(handle))?;
        if !ch.is_open() {
            return Err(L2capError::WrongState);
        }
        let remote_cid = ch.remote_cid;
        let credits = ch.credits.as_mut().ok_or(L2capError::WrongState)?;
        credits.consume_peer_credit()?;
        drop(ch);
        self.send_frame(handle, remote_cid, payload);
        Ok(())
    }

    /// Writes a raw frame directly on a fixed or already-OPEN dynamic
    /// channel CID, used by the ATT and RFCOMM layers which own their own
    /// framing above L2CAP (spec.md §4.4, §4.5).
    pub fn write_fixed(&self, handle: u16, cid: u16, payload: &[u8]) {
        self.send_frame(handle, cid, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::PacketKind;
    use std::future::Future;
    use std::pin::Pin;

    struct NullTransport;
    impl Transport for NullTransport {
        fn send(&self, _kind: PacketKind, _bytes: Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
    }

    fn core() -> L2capCore<NullTransport> {
        let hci = Arc::new(Dispatcher::new(Arc::new(NullTransport)));
        L2capCore::new(hci)
    }

    #[tokio::test]
    async fn connection_request_for_unregistered_psm_is_refused() {
        let core = core();
        core.connections.insert(1, AclConnection { peer_address: BdAddr::any(), transport: LinkTransport::BrEdr, reassembly: None });
        let req = signaling::ConnectionRequest { psm: 0x1001, scid: 0x50 };
        let result = core.handle_connection_request(1, 1, &req.encoded());
        assert!(result.is_ok());
        assert!(core.channels.is_empty());
    }

    #[tokio::test]
    async fn registered_psm_allocates_a_channel() {
        let core = core();
        core.connections.insert(1, AclConnection { peer_address: BdAddr::any(), transport: LinkTransport::BrEdr, reassembly: None });
        core.listen(0x0003, |_, _| {});
        let req = signaling::ConnectionRequest { psm: 0x0003, scid: 0x50 };
        core.handle_connection_request(1, 1, &req.encoded()).unwrap();
        assert_eq!(core.channels.len(), 1);
    }
}
