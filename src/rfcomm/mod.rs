//! RFCOMM multiplexer: mux session lifecycle, DLCI open/credit flow, and the
//! external connect/send/disconnect surface (spec.md §4.5).
//!
//! Sessions are tracked the way [`crate::l2cap::L2capCore`] tracks ACL
//! connections and dynamic channels — one concurrent map keyed by
//! `(handle, local_cid)` — but completion of an asynchronous open (mux or
//! DLCI) is a `tokio::sync::oneshot` exactly like `AttClient::request` and
//! `L2capCore::await_open`, so `connect`/`connect_by_uuid` read as a single
//! linear `async fn` instead of a callback chain.

pub mod channel;
pub mod frame;
pub mod mcc;

use crate::codec::{ByteReader, Decode as _, Encode as _};
use crate::error::RfcommError;
use crate::hci::Transport;
use crate::l2cap::{L2capCore, PSM_RFCOMM};
use channel::Channel;
use frame::{Frame, FrameType};
use mcc::{McCommand, PnParams};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Default values proposed in an outbound PN request and used for a
/// responder's own reply (spec.md §4.5.2).
pub const DEFAULT_FRAME_SIZE: u16 = 127;
pub const DEFAULT_CREDITS: u8 = 7;
/// RS-232 control signals this stack always advertises in MSC: RTC, RTR, DV
/// set (spec.md §4.5.2: "MSC with RS-232 bits RTC|RTR|DV").
pub const DEFAULT_MODEM_SIGNALS: u8 = 0x8D;

const MUX_DLCI: u8 = 0;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum MuxState {
    Closed,
    Connecting,
    Open,
    Disconnecting,
}

type AcceptCallback = Box<dyn Fn(u16, u16, u8) + Send + Sync>;
type DataSink = Box<dyn Fn(u8, Vec<u8>) + Send + Sync>;
type ModemSink = Box<dyn Fn(u8, u8) + Send + Sync>;

/// One mux session to a peer over one L2CAP dynamic channel (spec.md §3
/// "RFCOMM Session"). `is_initiator` reflects which side started the mux,
/// fixed for the lifetime of the session and used as the D-bit for every
/// DLCI opened on top of it, per TS 27.010 DLCI numbering.
struct Session {
    is_initiator: bool,
    mux_state: MuxState,
    credit_flow_enabled: bool,
    channels: HashMap<u8, Channel>,
    pending_dlci_opens: HashMap<u8, Vec<oneshot::Sender<Result<(), RfcommError>>>>,
    mux_waiters: Vec<oneshot::Sender<Result<(), RfcommError>>>,
}

impl Session {
    fn new(is_initiator: bool) -> Self {
        Self {
            is_initiator,
            mux_state: MuxState::Connecting,
            credit_flow_enabled: true,
            channels: HashMap::new(),
            pending_dlci_opens: HashMap::new(),
            mux_waiters: Vec::new(),
        }
    }
}

fn dlci_for(server_channel: u8, session_is_initiator: bool) -> u8 {
    ((server_channel & 0x1F) << 1) | (session_is_initiator as u8)
}

pub struct RfcommCore<T: Transport> {
    l2cap: Arc<L2capCore<T>>,
    sessions: DashMap<(u16, u16), Session>,
    session_by_handle: DashMap<u16, u16>,
    servers: DashMap<u8, AcceptCallback>,
    data_listeners: DashMap<(u16, u16), DataSink>,
    modem_listeners: DashMap<(u16, u16), ModemSink>,
}

impl<T: Transport> RfcommCore<T> {
    /// Constructs the core and registers it as the L2CAP PSM 0x0003
    /// acceptor, so every inbound RFCOMM connection (regardless of which
    /// server channel the peer eventually addresses) routes back here.
    pub fn new(l2cap: Arc<L2capCore<T>>) -> Arc<Self> {
        let core = Arc::new(Self {
            l2cap: l2cap.clone(),
            sessions: DashMap::new(),
            session_by_handle: DashMap::new(),
            servers: DashMap::new(),
            data_listeners: DashMap::new(),
            modem_listeners: DashMap::new(),
        });
        let accept_core = core.clone();
        l2cap.listen(PSM_RFCOMM, move |handle, local_cid| {
            accept_core.accept_inbound_session(handle, local_cid);
        });
        core
    }

    /// Registers a server channel peers may `connect`/`connect_by_uuid` to
    /// (spec.md §6). `on_accept(handle, local_cid, dlci)` fires once the DLCI
    /// reaches CONNECTED.
    pub fn register_server(&self, server_channel: u8, on_accept: impl Fn(u16, u16, u8) + Send + Sync + 'static) {
        self.servers.insert(server_channel, Box::new(on_accept));
    }

    /// Registers the sink for inbound UIH payload on every DLCI of one
    /// session (the caller distinguishes DLCIs from the callback argument).
    pub fn register_data_listener(&self, handle: u16, local_cid: u16, f: impl Fn(u8, Vec<u8>) + Send + Sync + 'static) {
        self.data_listeners.insert((handle, local_cid), Box::new(f));
    }

    pub fn register_modem_listener(&self, handle: u16, local_cid: u16, f: impl Fn(u8, u8) + Send + Sync + 'static) {
        self.modem_listeners.insert((handle, local_cid), Box::new(f));
    }

    fn accept_inbound_session(self: &Arc<Self>, handle: u16, local_cid: u16) {
        let core = self.clone();
        self.l2cap.register_channel_listener(handle, local_cid, move |payload| {
            core.handle_frame(handle, local_cid, payload);
        });
        self.session_by_handle.insert(handle, local_cid);
        self.sessions.insert((handle, local_cid), Session::new(false));
    }

    /// Opens (or reuses) the mux session to `handle`, then opens a DLCI for
    /// `server_channel` on it (spec.md §4.5.1-4.5.2).
    pub async fn connect(self: &Arc<Self>, handle: u16, server_channel: u8) -> Result<(u16, u8), RfcommError> {
        let local_cid = self.ensure_session(handle).await?;
        let dlci = self.open_dlci(handle, local_cid, server_channel).await?;
        Ok((local_cid, dlci))
    }

    /// Resolves `service_uuid` to a server channel via SDP, then connects
    /// (spec.md §6 `connect_by_uuid`, SPEC_FULL.md's minimal SDP client).
    pub async fn connect_by_uuid(self: &Arc<Self>, handle: u16, service_uuid: crate::uuid::Uuid128) -> Result<(u16, u8), RfcommError> {
        let sdp = crate::sdp::SdpClient::new(self.l2cap.clone(), handle);
        let server_channel = sdp.find_rfcomm_channel(service_uuid).await?;
        self.connect(handle, server_channel).await
    }

    async fn ensure_session(self: &Arc<Self>, handle: u16) -> Result<u16, RfcommError> {
        if let Some(local_cid) = self.session_by_handle.get(&handle).map(|e| *e) {
            let rx = {
                let mut session = self.sessions.get_mut(&(handle, local_cid)).ok_or(RfcommError::MuxNotOpen)?;
                match session.mux_state {
                    MuxState::Open => None,
                    MuxState::Connecting => {
                        let (tx, rx) = oneshot::channel();
                        session.mux_waiters.push(tx);
                        Some(rx)
                    }
                    MuxState::Closed | MuxState::Disconnecting => return Err(RfcommError::MuxNotOpen),
                }
            };
            if let Some(rx) = rx {
                rx.await.map_err(|_| RfcommError::MuxNotOpen)??;
            }
            return Ok(local_cid);
        }

        let local_cid = self.l2cap.connect(handle, PSM_RFCOMM)?;
        self.session_by_handle.insert(handle, local_cid);
        self.sessions.insert((handle, local_cid), Session::new(true));

        let core = self.clone();
        self.l2cap.register_channel_listener(handle, local_cid, move |payload| {
            core.handle_frame(handle, local_cid, payload);
        });

        let (tx, rx) = oneshot::channel();
        if let Some(mut session) = self.sessions.get_mut(&(handle, local_cid)) {
            session.mux_waiters.push(tx);
        }

        self.l2cap.await_open(handle, local_cid).await?;
        self.send_mux_command(handle, local_cid, FrameType::Sabm, true);

        rx.await.map_err(|_| RfcommError::MuxNotOpen)??;
        Ok(local_cid)
    }

    async fn open_dlci(&self, handle: u16, local_cid: u16, server_channel: u8) -> Result<u8, RfcommError> {
        let is_initiator = self
            .sessions
            .get(&(handle, local_cid))
            .map(|s| s.is_initiator)
            .ok_or(RfcommError::MuxNotOpen)?;
        let dlci = dlci_for(server_channel, is_initiator);

        let (tx, rx) = oneshot::channel();
        {
            let mut session = self.sessions.get_mut(&(handle, local_cid)).ok_or(RfcommError::MuxNotOpen)?;
            if session.channels.contains_key(&dlci) {
                return Err(RfcommError::WrongState(dlci));
            }
            session.channels.insert(dlci, Channel::new_outbound(dlci));
            session.pending_dlci_opens.entry(dlci).or_default().push(tx);
        }

        let pn = PnParams::request(dlci, DEFAULT_FRAME_SIZE, DEFAULT_CREDITS);
        self.send_mcc(handle, local_cid, &McCommand::Pn(pn), true);

        rx.await.map_err(|_| RfcommError::Rejected)??;
        Ok(dlci)
    }

    /// Writes `data` on an open DLCI, consuming a peer credit when credit
    /// flow is negotiated and prepending a credit grant when the local
    /// window has dropped below half (spec.md §4.5.3).
    pub fn send_data(&self, handle: u16, local_cid: u16, dlci: u8, data: Vec<u8>) -> Result<(), RfcommError> {
        let (credit_flow, grant) = {
            let mut session = self.sessions.get_mut(&(handle, local_cid)).ok_or(RfcommError::MuxNotOpen)?;
            let credit_flow = session.credit_flow_enabled;
            let ch = session.channels.get_mut(&dlci).ok_or(RfcommError::WrongState(dlci))?;
            if !ch.is_open() {
                return Err(RfcommError::WrongState(dlci));
            }
            if credit_flow {
                ch.consume_peer_credit()?;
            }
            let grant = ch.replenish_if_needed(DEFAULT_CREDITS);
            (credit_flow, grant)
        };

        let mut payload = Vec::with_capacity(data.len() + 1);
        if let Some(g) = grant {
            payload.push(g);
        }
        payload.extend_from_slice(&data);
        self.send_channel_frame(handle, local_cid, dlci, FrameType::Uih, true, credit_flow && grant.is_some(), payload)
    }

    /// Sends a Modem Status Command carrying `signals` for `dlci` (spec.md
    /// §4.5.4).
    pub fn send_modem_status(&self, handle: u16, local_cid: u16, dlci: u8, signals: u8) -> Result<(), RfcommError> {
        {
            let mut session = self.sessions.get_mut(&(handle, local_cid)).ok_or(RfcommError::MuxNotOpen)?;
            let ch = session.channels.get_mut(&dlci).ok_or(RfcommError::WrongState(dlci))?;
            ch.local_signals = signals;
        }
        self.send_mcc(handle, local_cid, &McCommand::Msc { dlci, signals }, true);
        Ok(())
    }

    /// Tears a single DLCI down with DISC (spec.md §4.5.1's "disconnect is
    /// SABM's inverse"). Does not tear the mux session itself down.
    pub fn disconnect(&self, handle: u16, local_cid: u16, dlci: u8) -> Result<(), RfcommError> {
        if let Some(mut session) = self.sessions.get_mut(&(handle, local_cid)) {
            session.channels.remove(&dlci);
        }
        self.send_channel_frame(handle, local_cid, dlci, FrameType::Disc, true, true, Vec::new())
    }

    fn handle_frame(&self, handle: u16, local_cid: u16, payload: Vec<u8>) {
        let mut r = ByteReader::new(&payload);
        let frame = match Frame::decode(&mut r) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("dropping malformed rfcomm frame: {e}");
                return;
            }
        };
        if frame.dlci == MUX_DLCI {
            self.handle_mux_frame(handle, local_cid, frame);
        } else {
            self.handle_channel_frame(handle, local_cid, frame);
        }
    }

    fn handle_mux_frame(&self, handle: u16, local_cid: u16, frame: Frame) {
        match frame.frame_type {
            FrameType::Sabm => {
                self.send_mux_command(handle, local_cid, FrameType::Ua, false);
                self.open_mux(handle, local_cid);
            }
            FrameType::Ua => self.open_mux(handle, local_cid),
            FrameType::Dm => self.teardown_mux(handle, local_cid, RfcommError::Rejected),
            FrameType::Disc => {
                self.send_mux_command(handle, local_cid, FrameType::Ua, false);
                self.teardown_mux(handle, local_cid, RfcommError::MuxNotOpen);
            }
            FrameType::Uih => self.handle_mcc(handle, local_cid, &frame.data),
        }
    }

    fn open_mux(&self, handle: u16, local_cid: u16) {
        let waiters = match self.sessions.get_mut(&(handle, local_cid)) {
            Some(mut session) if session.mux_state != MuxState::Open => {
                session.mux_state = MuxState::Open;
                std::mem::take(&mut session.mux_waiters)
            }
            _ => return,
        };
        for w in waiters {
            let _ = w.send(Ok(()));
        }
    }

    fn teardown_mux(&self, handle: u16, local_cid: u16, err: RfcommError) {
        if let Some((_, mut session)) = self.sessions.remove(&(handle, local_cid)) {
            session.mux_state = MuxState::Closed;
            for w in session.mux_waiters {
                let _ = w.send(Err(err_clone(&err)));
            }
            for (_, txs) in session.pending_dlci_opens {
                for tx in txs {
                    let _ = tx.send(Err(err_clone(&err)));
                }
            }
        }
        self.session_by_handle.remove(&handle);
    }

    fn handle_mcc(&self, handle: u16, local_cid: u16, info: &[u8]) {
        let (command, is_command) = match mcc::decode(info) {
            Ok(v) => v,
            Err(_) => {
                if let Some(&type_byte) = info.first() {
                    let rejected_type = (type_byte >> 2) & 0x3F;
                    self.send_mcc(handle, local_cid, &McCommand::Nsc { rejected_type }, false);
                }
                return;
            }
        };
        match command {
            McCommand::Pn(params) if is_command => self.handle_pn_request(handle, local_cid, params),
            McCommand::Pn(params) => self.handle_pn_response(handle, local_cid, params),
            McCommand::Msc { dlci, signals } => self.handle_msc(handle, local_cid, dlci, signals, is_command),
            McCommand::Rls { dlci, status } if is_command => {
                self.send_mcc(handle, local_cid, &McCommand::Rls { dlci, status }, false);
            }
            McCommand::Rpn { dlci, params } if is_command => {
                self.send_mcc(handle, local_cid, &McCommand::Rpn { dlci, params }, false);
            }
            McCommand::Test { data } if is_command => {
                self.send_mcc(handle, local_cid, &McCommand::Test { data }, false);
            }
            McCommand::FCon if is_command => self.send_mcc(handle, local_cid, &McCommand::FCon, false),
            McCommand::FCoff if is_command => self.send_mcc(handle, local_cid, &McCommand::FCoff, false),
            // Response echoes and Nsc need no further action.
            _ => {}
        }
    }

    fn handle_pn_request(&self, handle: u16, local_cid: u16, params: PnParams) {
        let local_frame_size = DEFAULT_FRAME_SIZE.min(params.max_frame_size);
        if let Some(mut session) = self.sessions.get_mut(&(handle, local_cid)) {
            let ch = session.channels.entry(params.dlci).or_insert_with(|| Channel::new_inbound(params.dlci));
            ch.apply_pn(local_frame_size, params.initial_credits);
        }
        let resp = PnParams {
            dlci: params.dlci,
            frame_type: params.frame_type,
            credit_based_flow: params.credit_based_flow,
            priority: params.priority,
            ack_timer: params.ack_timer,
            max_frame_size: local_frame_size,
            max_retransmissions: params.max_retransmissions,
            initial_credits: DEFAULT_CREDITS,
        };
        self.send_mcc(handle, local_cid, &McCommand::Pn(resp), false);
    }

    /// Updates the negotiated frame size/credits then sends SABM on the
    /// target DLCI (spec.md §4.5.2: "On PN response ... Then send SABM").
    fn handle_pn_response(&self, handle: u16, local_cid: u16, params: PnParams) {
        if let Some(mut session) = self.sessions.get_mut(&(handle, local_cid)) {
            if let Some(ch) = session.channels.get_mut(&params.dlci) {
                ch.apply_pn(params.max_frame_size, params.initial_credits);
            }
        }
        let _ = self.send_channel_frame(handle, local_cid, params.dlci, FrameType::Sabm, true, true, Vec::new());
    }

    fn handle_msc(&self, handle: u16, local_cid: u16, dlci: u8, signals: u8, is_command: bool) {
        if let Some(mut session) = self.sessions.get_mut(&(handle, local_cid)) {
            if let Some(ch) = session.channels.get_mut(&dlci) {
                ch.peer_signals = signals;
            }
        }
        if is_command {
            let local_signals = self
                .sessions
                .get(&(handle, local_cid))
                .and_then(|s| s.channels.get(&dlci).map(|c| c.local_signals))
                .unwrap_or(DEFAULT_MODEM_SIGNALS);
            self.send_mcc(handle, local_cid, &McCommand::Msc { dlci, signals: local_signals }, false);
        }
        if let Some(sink) = self.modem_listeners.get(&(handle, local_cid)) {
            sink(dlci, signals);
        }
    }

    fn handle_channel_frame(&self, handle: u16, local_cid: u16, frame: Frame) {
        let dlci = frame.dlci;
        match frame.frame_type {
            FrameType::Sabm => self.handle_sabm(handle, local_cid, dlci),
            FrameType::Ua => self.handle_channel_ua(handle, local_cid, dlci),
            FrameType::Dm => self.fail_dlci_open(handle, local_cid, dlci),
            FrameType::Disc => {
                let _ = self.send_channel_frame(handle, local_cid, dlci, FrameType::Ua, false, false, Vec::new());
                if let Some(mut session) = self.sessions.get_mut(&(handle, local_cid)) {
                    session.channels.remove(&dlci);
                }
            }
            FrameType::Uih => self.handle_channel_uih(handle, local_cid, dlci, frame.poll_final, frame.data),
        }
    }

    fn handle_sabm(&self, handle: u16, local_cid: u16, dlci: u8) {
        let server_channel = dlci >> 1;
        if !self.servers.contains_key(&server_channel) {
            let _ = self.send_channel_frame(handle, local_cid, dlci, FrameType::Dm, false, false, Vec::new());
            return;
        }
        if let Some(mut session) = self.sessions.get_mut(&(handle, local_cid)) {
            session.channels.entry(dlci).or_insert_with(|| Channel::new_inbound(dlci)).mark_open();
        }
        let _ = self.send_channel_frame(handle, local_cid, dlci, FrameType::Ua, false, false, Vec::new());
        if let Some(cb) = self.servers.get(&server_channel) {
            cb(handle, local_cid, dlci);
        }
    }

    fn handle_channel_ua(&self, handle: u16, local_cid: u16, dlci: u8) {
        let waiters = if let Some(mut session) = self.sessions.get_mut(&(handle, local_cid)) {
            if let Some(ch) = session.channels.get_mut(&dlci) {
                ch.mark_open();
            }
            session.pending_dlci_opens.remove(&dlci)
        } else {
            None
        };
        if let Some(waiters) = waiters {
            for w in waiters {
                let _ = w.send(Ok(()));
            }
        }
        self.send_mcc(handle, local_cid, &McCommand::Msc { dlci, signals: DEFAULT_MODEM_SIGNALS }, true);
    }

    fn fail_dlci_open(&self, handle: u16, local_cid: u16, dlci: u8) {
        let waiters = if let Some(mut session) = self.sessions.get_mut(&(handle, local_cid)) {
            session.channels.remove(&dlci);
            session.pending_dlci_opens.remove(&dlci)
        } else {
            None
        };
        if let Some(waiters) = waiters {
            for w in waiters {
                let _ = w.send(Err(RfcommError::Rejected));
            }
        }
    }

    fn handle_channel_uih(&self, handle: u16, local_cid: u16, dlci: u8, poll_final: bool, mut data: Vec<u8>) {
        let credit_flow = self.sessions.get(&(handle, local_cid)).map(|s| s.credit_flow_enabled).unwrap_or(false);
        if credit_flow && poll_final && !data.is_empty() {
            let grant = data.remove(0);
            if let Some(mut session) = self.sessions.get_mut(&(handle, local_cid)) {
                if let Some(ch) = session.channels.get_mut(&dlci) {
                    ch.peer_credits = ch.peer_credits.saturating_add(grant);
                }
            }
        }
        if data.is_empty() {
            return;
        }
        if let Some(mut session) = self.sessions.get_mut(&(handle, local_cid)) {
            if let Some(ch) = session.channels.get_mut(&dlci) {
                if ch.local_credits > 0 {
                    ch.local_credits -= 1;
                }
            }
        }
        if let Some(sink) = self.data_listeners.get(&(handle, local_cid)) {
            sink(dlci, data);
        }
    }

    fn send_mux_command(&self, handle: u16, local_cid: u16, frame_type: FrameType, poll_final: bool) {
        let _ = self.send_channel_frame(handle, local_cid, MUX_DLCI, frame_type, true, poll_final, Vec::new());
    }

    fn send_mcc(&self, handle: u16, local_cid: u16, command: &McCommand, is_command: bool) {
        let body = mcc::encode(command, is_command);
        let _ = self.send_channel_frame(handle, local_cid, MUX_DLCI, FrameType::Uih, true, false, body);
    }

    fn send_channel_frame(
        &self,
        handle: u16,
        local_cid: u16,
        dlci: u8,
        frame_type: FrameType,
        command: bool,
        poll_final: bool,
        data: Vec<u8>,
    ) -> Result<(), RfcommError> {
        let remote_cid = self.l2cap.remote_cid(handle, local_cid).ok_or(RfcommError::MuxNotOpen)?;
        let frame = Frame { dlci, command, frame_type, poll_final, data };
        self.l2cap.write_fixed(handle, remote_cid, &frame.encoded());
        Ok(())
    }
}

/// `RfcommError` isn't `Clone` (it wraps non-`Clone` codec/L2CAP errors in
/// some variants upstream); the handful of variants used to fan a single
/// failure out to several queued waiters are reconstructed by value instead.
fn err_clone(err: &RfcommError) -> RfcommError {
    match err {
        RfcommError::MuxNotOpen => RfcommError::MuxNotOpen,
        RfcommError::WrongState(d) => RfcommError::WrongState(*d),
        RfcommError::Rejected => RfcommError::Rejected,
        RfcommError::NoCredits => RfcommError::NoCredits,
        RfcommError::Codec(_) => RfcommError::Rejected,
        RfcommError::L2cap(_) => RfcommError::MuxNotOpen,
        RfcommError::SdpLookupFailed => RfcommError::SdpLookupFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::{Dispatcher, PacketKind};
    use std::future::Future;
    use std::pin::Pin;

    struct NullTransport;
    impl Transport for NullTransport {
        fn send(&self, _kind: PacketKind, _bytes: Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
    }

    fn core() -> Arc<RfcommCore<NullTransport>> {
        let hci = Arc::new(Dispatcher::new(Arc::new(NullTransport)));
        let l2cap = Arc::new(L2capCore::new(hci));
        RfcommCore::new(l2cap)
    }

    #[test]
    fn dlci_numbering_follows_server_channel_and_direction() {
        assert_eq!(dlci_for(1, true), 0x03);
        assert_eq!(dlci_for(1, false), 0x02);
        assert_eq!(dlci_for(5, true), 0x0B);
    }

    #[test]
    fn unregistered_server_channel_is_refused() {
        let core = core();
        core.sessions.insert((1, 0x40), Session::new(false));
        core.handle_sabm(1, 0x40, dlci_for(3, false));
        assert!(core.sessions.get(&(1, 0x40)).unwrap().channels.is_empty());
    }

    #[test]
    fn registered_server_channel_opens_on_sabm() {
        let core = core();
        core.sessions.insert((1, 0x40), Session::new(false));
        core.register_server(3, |_, _, _| {});
        let dlci = dlci_for(3, false);
        core.handle_sabm(1, 0x40, dlci);
        assert!(core.sessions.get(&(1, 0x40)).unwrap().channels.get(&dlci).unwrap().is_open());
    }
}
