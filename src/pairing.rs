//! BR/EDR Secure Simple Pairing orchestrator: consumes SSP events straight
//! off the HCI dispatcher and drives the link-key store (spec.md §3's
//! per-handle pairing session, §4.6 in the external-interface table).
//!
//! The crate doing SSP's cryptography (the "SMP collaborator") is out of
//! scope (spec.md §1 Non-goals); this module only orchestrates the HCI
//! event/reply dance and persists the resulting link key.

use crate::addr::{AddressType, BdAddr};
use crate::error::PairingError;
use crate::hci::{self, Dispatcher, Event, Transport};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A bonded device's persisted credential (spec.md §6: "link-key records
/// `(address, address_type, link_key:16B, key_type:u8, authenticated:bool)`").
#[derive(Debug, Clone, Copy)]
pub struct LinkKeyRecord {
    pub address: BdAddr,
    pub address_type: AddressType,
    pub link_key: [u8; 16],
    pub key_type: u8,
    pub authenticated: bool,
}

/// Authenticated-combination-key type codes (Vol 2 Part E §7.7.24); anything
/// else is an unauthenticated or legacy key.
fn key_type_is_authenticated(key_type: u8) -> bool {
    matches!(key_type, 0x05 | 0x08)
}

/// Opaque bonding table the orchestrator consults on Link-Key-Request and
/// writes on Link-Key-Notification. Serialization format is left to the
/// embedder (spec.md §6).
pub trait LinkKeyStore: Send + Sync {
    fn get(&self, address: BdAddr) -> Option<LinkKeyRecord>;
    fn put(&self, record: LinkKeyRecord);
    fn remove(&self, address: BdAddr);
}

/// An in-memory [`LinkKeyStore`], read-heavy and lock-protected per spec.md
/// §5's "shared-resource policy" for the link-key store.
pub struct MemoryLinkKeyStore {
    table: RwLock<HashMap<BdAddr, LinkKeyRecord>>,
}

impl MemoryLinkKeyStore {
    pub fn new() -> Self {
        Self { table: RwLock::new(HashMap::new()) }
    }
}

impl Default for MemoryLinkKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkKeyStore for MemoryLinkKeyStore {
    fn get(&self, address: BdAddr) -> Option<LinkKeyRecord> {
        self.table.read().get(&address).copied()
    }

    fn put(&self, record: LinkKeyRecord) {
        self.table.write().insert(record.address, record);
    }

    fn remove(&self, address: BdAddr) {
        self.table.write().remove(&address);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum PairingState {
    Idle,
    Authenticating,
    IoCapExchange,
    UserConfirm,
    PasskeyEntry,
    Confirmed,
    WaitingLinkKey,
    Authenticated,
    Paired,
    Failed,
}

struct PairingSession {
    state: PairingState,
    legacy_pin: bool,
    simple_pairing_done: bool,
    encryption_enabled: bool,
}

impl PairingSession {
    fn new() -> Self {
        Self { state: PairingState::Idle, legacy_pin: false, simple_pairing_done: false, encryption_enabled: false }
    }
}

/// Construction-time tunables (spec.md §9: "pass as construction-time
/// dependencies, not process globals").
pub struct PairingConfig {
    /// IO capability advertised in every IO-Capability-Request-Reply
    /// (0x00 DisplayOnly, 0x01 DisplayYesNo, 0x02 KeyboardOnly, 0x03
    /// NoInputNoOutput).
    pub local_io_capability: u8,
    pub authentication_requirements: u8,
    /// When set, numeric-comparison confirmations are accepted immediately
    /// without surfacing them to a user callback (testable scenario in
    /// spec.md §8 #6).
    pub auto_accept_numeric_comparison: bool,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            local_io_capability: 0x03, // NoInputNoOutput
            authentication_requirements: 0x01, // MITM protection requested, dedicated bonding
            auto_accept_numeric_comparison: true,
        }
    }
}

type NumericComparisonListener = Box<dyn Fn(BdAddr, u32) + Send + Sync>;
type PasskeyRequestListener = Box<dyn Fn(BdAddr) + Send + Sync>;
type CompletionListener = Box<dyn Fn(BdAddr, Result<(), PairingError>) + Send + Sync>;

/// Drives one pairing session per connected peer off the raw HCI event
/// stream (spec.md §3's pairing-session state list, §6's `Pairing` API).
pub struct PairingOrchestrator<T: Transport> {
    hci: Arc<Dispatcher<T>>,
    link_keys: Arc<dyn LinkKeyStore>,
    config: PairingConfig,
    sessions: DashMap<BdAddr, PairingSession>,
    handle_to_addr: DashMap<u16, BdAddr>,
    addr_to_handle: DashMap<BdAddr, u16>,
    numeric_comparison_listeners: RwLock<Vec<NumericComparisonListener>>,
    passkey_request_listeners: RwLock<Vec<PasskeyRequestListener>>,
    completion_listeners: RwLock<Vec<CompletionListener>>,
}

impl<T: Transport> PairingOrchestrator<T> {
    pub fn new(hci: Arc<Dispatcher<T>>, link_keys: Arc<dyn LinkKeyStore>) -> Self {
        Self::with_config(hci, link_keys, PairingConfig::default())
    }

    pub fn with_config(hci: Arc<Dispatcher<T>>, link_keys: Arc<dyn LinkKeyStore>, config: PairingConfig) -> Self {
        Self {
            hci,
            link_keys,
            config,
            sessions: DashMap::new(),
            handle_to_addr: DashMap::new(),
            addr_to_handle: DashMap::new(),
            numeric_comparison_listeners: RwLock::new(Vec::new()),
            passkey_request_listeners: RwLock::new(Vec::new()),
            completion_listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn on_numeric_comparison(&self, f: impl Fn(BdAddr, u32) + Send + Sync + 'static) {
        self.numeric_comparison_listeners.write().push(Box::new(f));
    }

    pub fn on_passkey_request(&self, f: impl Fn(BdAddr) + Send + Sync + 'static) {
        self.passkey_request_listeners.write().push(Box::new(f));
    }

    pub fn on_pairing_complete(&self, f: impl Fn(BdAddr, Result<(), PairingError>) + Send + Sync + 'static) {
        self.completion_listeners.write().push(Box::new(f));
    }

    /// Starts authentication on an already-connected peer (spec.md §6
    /// `initiate_pairing`).
    pub fn initiate_pairing(&self, address: BdAddr) -> Result<(), PairingError> {
        let handle = self.addr_to_handle.get(&address).map(|e| *e).ok_or(PairingError::WrongState)?;
        self.sessions.insert(address, PairingSession { state: PairingState::Authenticating, ..PairingSession::new() });
        self.fire_command(hci::OPCODE_AUTHENTICATION_REQUESTED, {
            let mut w = crate::codec::ByteWriter::with_capacity(2);
            w.write_u16_le(handle);
            w.into_vec()
        });
        Ok(())
    }

    /// Answers a pending numeric-comparison confirmation (spec.md §6
    /// `confirm_numeric_comparison`).
    pub fn confirm_numeric_comparison(&self, address: BdAddr, accept: bool) -> Result<(), PairingError> {
        {
            let mut session = self.sessions.get_mut(&address).ok_or(PairingError::WrongState)?;
            if session.state != PairingState::UserConfirm {
                return Err(PairingError::WrongState);
            }
            session.state = if accept { PairingState::Confirmed } else { PairingState::Failed };
        }
        if accept {
            self.fire_command(hci::OPCODE_USER_CONFIRMATION_REQUEST_REPLY, bd_addr_params(address));
            Ok(())
        } else {
            self.fire_command(hci::OPCODE_USER_CONFIRMATION_REQUEST_NEGATIVE_REPLY, bd_addr_params(address));
            self.fail(address, "numeric comparison rejected locally");
            Ok(())
        }
    }

    /// Answers a pending passkey-entry request (spec.md §6 `enter_passkey`).
    pub fn enter_passkey(&self, address: BdAddr, passkey: u32) -> Result<(), PairingError> {
        {
            let mut session = self.sessions.get_mut(&address).ok_or(PairingError::WrongState)?;
            if session.state != PairingState::PasskeyEntry {
                return Err(PairingError::WrongState);
            }
            session.state = PairingState::Confirmed;
        }
        let mut params = bd_addr_params(address);
        let mut w = crate::codec::ByteWriter::with_capacity(4);
        w.write_u32_le(passkey);
        params.extend(w.into_vec());
        self.fire_command(hci::OPCODE_USER_PASSKEY_REQUEST_REPLY, params);
        Ok(())
    }

    /// Pre-seeds the bonding table outside of a live pairing flow (spec.md
    /// §6 `store_link_key`).
    pub fn store_link_key(&self, address: BdAddr, link_key: [u8; 16]) {
        self.link_keys.put(LinkKeyRecord {
            address,
            address_type: AddressType::BrEdr,
            link_key,
            key_type: 0x04,
            authenticated: false,
        });
    }

    pub fn get_bonding_info(&self, address: BdAddr) -> Option<LinkKeyRecord> {
        self.link_keys.get(address)
    }

    /// Feeds one classified HCI event into the pairing state machine
    /// (invoked from the same `Dispatcher::add_event_listener` fan-out
    /// L2CAP uses, per spec.md §2's data-flow diagram).
    pub fn handle_hci_event(&self, event: &Event) {
        match event {
            Event::ConnectionComplete { status: 0, handle, bd_addr, .. } => self.track_connection(*handle, *bd_addr),
            Event::LeConnectionComplete { status: 0, handle, peer_address, .. } => self.track_connection(*handle, *peer_address),
            Event::DisconnectionComplete { handle, .. } => self.untrack_connection(*handle),
            Event::IoCapabilityRequest { bd_addr } => self.handle_io_capability_request(*bd_addr),
            Event::UserConfirmationRequest { bd_addr, numeric_value } => self.handle_user_confirmation_request(*bd_addr, *numeric_value),
            Event::UserPasskeyRequest { bd_addr } => self.handle_user_passkey_request(*bd_addr),
            Event::SimplePairingComplete { status, bd_addr } => self.handle_simple_pairing_complete(*bd_addr, *status),
            Event::LinkKeyRequest { bd_addr } => self.handle_link_key_request(*bd_addr),
            Event::LinkKeyNotification { bd_addr, link_key, key_type } => self.handle_link_key_notification(*bd_addr, *link_key, *key_type),
            Event::PinCodeRequest { bd_addr } => self.handle_pin_code_request(*bd_addr),
            Event::AuthenticationComplete { status, handle } => self.handle_authentication_complete(*handle, *status),
            Event::EncryptionChange { status, handle, enabled } => self.handle_encryption_change(*handle, *status, *enabled),
            _ => {}
        }
    }

    fn track_connection(&self, handle: u16, address: BdAddr) {
        self.handle_to_addr.insert(handle, address);
        self.addr_to_handle.insert(address, handle);
    }

    fn untrack_connection(&self, handle: u16) {
        if let Some((_, address)) = self.handle_to_addr.remove(&handle) {
            self.addr_to_handle.remove(&address);
            self.sessions.remove(&address);
        }
    }

    fn handle_io_capability_request(&self, address: BdAddr) {
        self.sessions.entry(address).or_insert_with(PairingSession::new).state = PairingState::IoCapExchange;
        let mut params = bd_addr_params(address);
        params.push(self.config.local_io_capability);
        params.push(0x00); // OOB data not present
        params.push(self.config.authentication_requirements);
        self.fire_command(hci::OPCODE_IO_CAPABILITY_REQUEST_REPLY, params);
    }

    fn handle_user_confirmation_request(&self, address: BdAddr, numeric_value: u32) {
        {
            let mut session = self.sessions.entry(address).or_insert_with(PairingSession::new);
            session.state = PairingState::UserConfirm;
        }
        if self.config.auto_accept_numeric_comparison {
            // Best-effort: a WrongState error here would only mean the
            // session moved on between the two lock acquisitions above.
            let _ = self.confirm_numeric_comparison(address, true);
        } else {
            for cb in self.numeric_comparison_listeners.read().iter() {
                cb(address, numeric_value);
            }
        }
    }

    fn handle_user_passkey_request(&self, address: BdAddr) {
        self.sessions.entry(address).or_insert_with(PairingSession::new).state = PairingState::PasskeyEntry;
        for cb in self.passkey_request_listeners.read().iter() {
            cb(address);
        }
    }

    fn handle_simple_pairing_complete(&self, address: BdAddr, status: u8) {
        if status != 0 {
            self.fail(address, "simple pairing complete reported failure");
            return;
        }
        if let Some(mut session) = self.sessions.get_mut(&address) {
            session.simple_pairing_done = true;
        }
        self.check_paired(address);
    }

    fn handle_link_key_request(&self, address: BdAddr) {
        self.sessions.entry(address).or_insert_with(PairingSession::new).state = PairingState::WaitingLinkKey;
        match self.link_keys.get(address) {
            Some(record) => {
                let mut params = bd_addr_params(address);
                params.extend_from_slice(&record.link_key);
                self.fire_command(hci::OPCODE_LINK_KEY_REQUEST_REPLY, params);
            }
            None => self.fire_command(hci::OPCODE_LINK_KEY_REQUEST_NEGATIVE_REPLY, bd_addr_params(address)),
        }
    }

    fn handle_link_key_notification(&self, address: BdAddr, link_key: [u8; 16], key_type: u8) {
        self.link_keys.put(LinkKeyRecord {
            address,
            address_type: AddressType::BrEdr,
            link_key,
            key_type,
            authenticated: key_type_is_authenticated(key_type),
        });
    }

    fn handle_pin_code_request(&self, address: BdAddr) {
        // Legacy PIN entry has no external API surface (spec.md §6 lists no
        // way for an embedder to supply digits), so legacy pairing is
        // always declined; the authentication-complete-suffices rule below
        // still applies structurally if a future embedder starts accepting.
        self.sessions.entry(address).or_insert_with(PairingSession::new).legacy_pin = true;
        self.fire_command(hci::OPCODE_PIN_CODE_REQUEST_NEGATIVE_REPLY, bd_addr_params(address));
    }

    fn handle_authentication_complete(&self, handle: u16, status: u8) {
        let Some(address) = self.handle_to_addr.get(&handle).map(|e| *e) else { return };
        if status != 0 {
            self.fail(address, "authentication complete reported failure");
            return;
        }
        let legacy = self.sessions.get(&address).map(|s| s.legacy_pin).unwrap_or(false);
        if let Some(mut session) = self.sessions.get_mut(&address) {
            session.state = PairingState::Authenticated;
        }
        if legacy {
            self.complete_paired(address);
        }
    }

    fn handle_encryption_change(&self, handle: u16, status: u8, enabled: bool) {
        let Some(address) = self.handle_to_addr.get(&handle).map(|e| *e) else { return };
        if status != 0 {
            self.fail(address, "encryption change reported failure");
            return;
        }
        if enabled {
            if let Some(mut session) = self.sessions.get_mut(&address) {
                session.encryption_enabled = true;
            }
            self.check_paired(address);
        }
    }

    fn check_paired(&self, address: BdAddr) {
        let ready = self
            .sessions
            .get(&address)
            .map(|s| s.simple_pairing_done && s.encryption_enabled && s.state != PairingState::Paired)
            .unwrap_or(false);
        if ready {
            self.complete_paired(address);
        }
    }

    fn complete_paired(&self, address: BdAddr) {
        if let Some(mut session) = self.sessions.get_mut(&address) {
            session.state = PairingState::Paired;
        }
        self.notify_complete(address, Ok(()));
    }

    fn fail(&self, address: BdAddr, reason: &'static str) {
        if self.sessions.remove(&address).is_some() {
            self.notify_complete(address, Err(PairingError::Failed(reason)));
        }
    }

    fn notify_complete(&self, address: BdAddr, result: Result<(), PairingError>) {
        for cb in self.completion_listeners.read().iter() {
            cb(address, result);
        }
    }

    fn fire_command(&self, opcode: hci::Opcode, params: Vec<u8>) {
        let hci = self.hci.clone();
        tokio::spawn(async move {
            hci.send_command(opcode, &params).await;
        });
    }
}

fn bd_addr_params(address: BdAddr) -> Vec<u8> {
    address.bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::PacketKind;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullTransport;
    impl Transport for NullTransport {
        fn send(&self, _kind: PacketKind, _bytes: Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
    }

    fn orchestrator() -> PairingOrchestrator<NullTransport> {
        let hci = Arc::new(Dispatcher::new(Arc::new(NullTransport)));
        let store: Arc<dyn LinkKeyStore> = Arc::new(MemoryLinkKeyStore::new());
        PairingOrchestrator::new(hci, store)
    }

    #[tokio::test]
    async fn numeric_comparison_auto_accepts_and_pairs_on_encryption() {
        let orch = orchestrator();
        let addr = BdAddr::new([1, 2, 3, 4, 5, 6]);
        let done = Arc::new(AtomicUsize::new(0));
        let d2 = done.clone();
        orch.on_pairing_complete(move |_addr, result| {
            assert!(result.is_ok());
            d2.fetch_add(1, Ordering::SeqCst);
        });

        orch.handle_hci_event(&Event::ConnectionComplete {
            status: 0,
            handle: 7,
            bd_addr: addr,
            link_type: 1,
            encryption_enabled: false,
        });
        orch.handle_hci_event(&Event::IoCapabilityRequest { bd_addr: addr });
        orch.handle_hci_event(&Event::UserConfirmationRequest { bd_addr: addr, numeric_value: 123456 });
        assert_eq!(orch.sessions.get(&addr).unwrap().state, PairingState::Confirmed);

        orch.handle_hci_event(&Event::SimplePairingComplete { status: 0, bd_addr: addr });
        orch.handle_hci_event(&Event::EncryptionChange { status: 0, handle: 7, enabled: true });

        tokio::task::yield_now().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(orch.sessions.get(&addr).unwrap().state, PairingState::Paired);
    }

    #[tokio::test]
    async fn link_key_notification_is_persisted_for_later_link_key_request() {
        let orch = orchestrator();
        let addr = BdAddr::new([9, 9, 9, 9, 9, 9]);
        orch.handle_hci_event(&Event::LinkKeyNotification { bd_addr: addr, link_key: [0xAB; 16], key_type: 0x05 });
        let record = orch.get_bonding_info(addr).unwrap();
        assert_eq!(record.link_key, [0xAB; 16]);
        assert!(record.authenticated);
    }

    #[tokio::test]
    async fn failed_authentication_notifies_listener_with_error() {
        let orch = orchestrator();
        let addr = BdAddr::new([1, 1, 1, 1, 1, 1]);
        let failed = Arc::new(AtomicUsize::new(0));
        let f2 = failed.clone();
        orch.on_pairing_complete(move |_addr, result| {
            if result.is_err() {
                f2.fetch_add(1, Ordering::SeqCst);
            }
        });
        orch.handle_hci_event(&Event::ConnectionComplete {
            status: 0,
            handle: 3,
            bd_addr: addr,
            link_type: 1,
            encryption_enabled: false,
        });
        orch.handle_hci_event(&Event::IoCapabilityRequest { bd_addr: addr });
        orch.handle_hci_event(&Event::SimplePairingComplete { status: 0x05, bd_addr: addr });
        tokio::task::yield_now().await;
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }
}
