//! End-to-end Secure Simple Pairing via numeric comparison (spec.md §8,
//! scenario 6), driven purely from HCI events the way a real controller
//! would deliver them.

mod common;

use common::channel_transport;
use courier_stack::addr::BdAddr;
use courier_stack::hci::{Dispatcher, Event};
use courier_stack::pairing::{LinkKeyStore, MemoryLinkKeyStore, PairingOrchestrator};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn numeric_comparison_auto_accepts_and_completes_on_encryption() {
    let (transport, _rx) = channel_transport();
    let hci = Arc::new(Dispatcher::new(transport));
    let store: Arc<dyn LinkKeyStore> = Arc::new(MemoryLinkKeyStore::new());
    let orchestrator = PairingOrchestrator::new(hci, store);

    let addr = BdAddr::new([5, 5, 5, 5, 5, 5]);
    let completions = Arc::new(AtomicUsize::new(0));
    let c2 = completions.clone();
    orchestrator.on_pairing_complete(move |_addr, result| {
        assert!(result.is_ok());
        c2.fetch_add(1, Ordering::SeqCst);
    });

    orchestrator.handle_hci_event(&Event::ConnectionComplete {
        status: 0,
        handle: 11,
        bd_addr: addr,
        link_type: 1,
        encryption_enabled: false,
    });
    orchestrator.handle_hci_event(&Event::IoCapabilityRequest { bd_addr: addr });
    orchestrator.handle_hci_event(&Event::UserConfirmationRequest { bd_addr: addr, numeric_value: 654321 });
    orchestrator.handle_hci_event(&Event::SimplePairingComplete { status: 0, bd_addr: addr });
    orchestrator.handle_hci_event(&Event::EncryptionChange { status: 0, handle: 11, enabled: true });

    tokio::task::yield_now().await;
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn link_key_notification_is_retrievable_as_bonding_info() {
    let (transport, _rx) = channel_transport();
    let hci = Arc::new(Dispatcher::new(transport));
    let store: Arc<dyn LinkKeyStore> = Arc::new(MemoryLinkKeyStore::new());
    let orchestrator = PairingOrchestrator::new(hci, store);

    let addr = BdAddr::new([6, 6, 6, 6, 6, 6]);
    orchestrator.handle_hci_event(&Event::LinkKeyNotification { bd_addr: addr, link_key: [0x42; 16], key_type: 0x05 });

    let record = orchestrator.get_bonding_info(addr).expect("link key was persisted");
    assert_eq!(record.link_key, [0x42; 16]);
    assert!(record.authenticated);
}
