//! HCI event parsing (Vol 2 Part E §7.7).
//!
//! Event field layout (code, parameter length, command-complete payload
//! shape) follows `other_examples/3e2f8b49_deviceplug-btleplug__src-bluez-protocol-hci.rs.rs`'s
//! `Message`/event parsing; command/event correlation by opcode follows
//! `other_examples/3689353f_jmagnuson-bo-tie__src-hci-cb.rs.rs`'s
//! waiter-per-opcode pattern.

use crate::addr::BdAddr;
use crate::codec::{ByteReader, Decode};
use crate::error::CodecError;
use crate::hci::Opcode;

pub const EVT_INQUIRY_COMPLETE: u8 = 0x01;
pub const EVT_CONNECTION_COMPLETE: u8 = 0x03;
pub const EVT_CONNECTION_REQUEST: u8 = 0x04;
pub const EVT_DISCONNECTION_COMPLETE: u8 = 0x05;
pub const EVT_AUTHENTICATION_COMPLETE: u8 = 0x06;
pub const EVT_PIN_CODE_REQUEST: u8 = 0x16;
pub const EVT_LINK_KEY_REQUEST: u8 = 0x17;
pub const EVT_LINK_KEY_NOTIFICATION: u8 = 0x18;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_COMMAND_COMPLETE: u8 = 0x0E;
pub const EVT_COMMAND_STATUS: u8 = 0x0F;
pub const EVT_IO_CAPABILITY_REQUEST: u8 = 0x31;
pub const EVT_IO_CAPABILITY_RESPONSE: u8 = 0x32;
pub const EVT_USER_CONFIRMATION_REQUEST: u8 = 0x33;
pub const EVT_USER_PASSKEY_REQUEST: u8 = 0x34;
pub const EVT_SIMPLE_PAIRING_COMPLETE: u8 = 0x36;
pub const EVT_USER_PASSKEY_NOTIFICATION: u8 = 0x3B;
pub const EVT_LE_META: u8 = 0x3E;

pub const LE_SUBEVT_CONNECTION_COMPLETE: u8 = 0x01;
pub const LE_SUBEVT_ENHANCED_CONNECTION_COMPLETE: u8 = 0x0A;

/// A classified HCI event. `Unparsed` preserves the raw params for any
/// event code this crate doesn't special-case so listeners can still fan
/// out generic events (spec.md §4.2: "all other events fan out to
/// registered listeners synchronously").
#[derive(Debug, Clone)]
pub enum Event {
    CommandComplete { num_hci_command_packets: u8, opcode: Opcode, return_params: Vec<u8> },
    CommandStatus { status: u8, num_hci_command_packets: u8, opcode: Opcode },
    ConnectionComplete {
        status: u8,
        handle: u16,
        bd_addr: BdAddr,
        link_type: u8,
        encryption_enabled: bool,
    },
    DisconnectionComplete { status: u8, handle: u16, reason: u8 },
    LeConnectionComplete {
        status: u8,
        handle: u16,
        role: u8,
        peer_address_type: u8,
        peer_address: BdAddr,
        /// Only present on the Enhanced variant; the Open Question in
        /// spec.md §9 resolves this as "same handling, different offset".
        local_resolvable_private_address: Option<BdAddr>,
    },
    IoCapabilityRequest { bd_addr: BdAddr },
    IoCapabilityResponse { bd_addr: BdAddr, io_capability: u8, oob_present: u8, authentication_requirements: u8 },
    UserConfirmationRequest { bd_addr: BdAddr, numeric_value: u32 },
    UserPasskeyRequest { bd_addr: BdAddr },
    UserPasskeyNotification { bd_addr: BdAddr, passkey: u32 },
    SimplePairingComplete { status: u8, bd_addr: BdAddr },
    LinkKeyRequest { bd_addr: BdAddr },
    LinkKeyNotification { bd_addr: BdAddr, link_key: [u8; 16], key_type: u8 },
    PinCodeRequest { bd_addr: BdAddr },
    AuthenticationComplete { status: u8, handle: u16 },
    EncryptionChange { status: u8, handle: u16, enabled: bool },
    Unparsed { code: u8, params: Vec<u8> },
}

impl Event {
    /// Parses the event body `[code:8][param_len:8][params]` per spec.md §6.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(bytes);
        let code = r.read_u8()?;
        let param_len = r.read_u8()? as usize;
        let params = r.read_vec(param_len)?;
        Self::parse_body(code, &params)
    }

    fn parse_body(code: u8, params: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(params);
        Ok(match code {
            EVT_COMMAND_COMPLETE => {
                let num_hci_command_packets = r.read_u8()?;
                let opcode = Opcode(r.read_u16_le()?);
                let return_params = r.read_rest();
                Event::CommandComplete { num_hci_command_packets, opcode, return_params }
            }
            EVT_COMMAND_STATUS => {
                let status = r.read_u8()?;
                let num_hci_command_packets = r.read_u8()?;
                let opcode = Opcode(r.read_u16_le()?);
                Event::CommandStatus { status, num_hci_command_packets, opcode }
            }
            EVT_CONNECTION_COMPLETE => Event::ConnectionComplete {
                status: r.read_u8()?,
                handle: r.read_u16_le()? & 0x0FFF,
                bd_addr: BdAddr(r.read_array::<6>()?),
                link_type: r.read_u8()?,
                encryption_enabled: r.read_u8()? != 0,
            },
            EVT_DISCONNECTION_COMPLETE => Event::DisconnectionComplete {
                status: r.read_u8()?,
                handle: r.read_u16_le()? & 0x0FFF,
                reason: r.read_u8()?,
            },
            EVT_IO_CAPABILITY_REQUEST => Event::IoCapabilityRequest { bd_addr: BdAddr(r.read_array::<6>()?) },
            EVT_IO_CAPABILITY_RESPONSE => Event::IoCapabilityResponse {
                bd_addr: BdAddr(r.read_array::<6>()?),
                io_capability: r.read_u8()?,
                oob_present: r.read_u8()?,
                authentication_requirements: r.read_u8()?,
            },
            EVT_USER_CONFIRMATION_REQUEST => Event::UserConfirmationRequest {
                bd_addr: BdAddr(r.read_array::<6>()?),
                numeric_value: r.read_u32_le()?,
            },
            EVT_USER_PASSKEY_REQUEST => Event::UserPasskeyRequest { bd_addr: BdAddr(r.read_array::<6>()?) },
            EVT_USER_PASSKEY_NOTIFICATION => Event::UserPasskeyNotification {
                bd_addr: BdAddr(r.read_array::<6>()?),
                passkey: r.read_u32_le()?,
            },
            EVT_SIMPLE_PAIRING_COMPLETE => Event::SimplePairingComplete {
                status: r.read_u8()?,
                bd_addr: BdAddr(r.read_array::<6>()?),
            },
            EVT_LINK_KEY_REQUEST => Event::LinkKeyRequest { bd_addr: BdAddr(r.read_array::<6>()?) },
            EVT_LINK_KEY_NOTIFICATION => Event::LinkKeyNotification {
                bd_addr: BdAddr(r.read_array::<6>()?),
                link_key: r.read_array::<16>()?,
                key_type: r.read_u8()?,
            },
            EVT_PIN_CODE_REQUEST => Event::PinCodeRequest { bd_addr: BdAddr(r.read_array::<6>()?) },
            EVT_AUTHENTICATION_COMPLETE => {
                let status = r.read_u8()?;
                let handle = r.read_u16_le()? & 0x0FFF;
                Event::AuthenticationComplete { status, handle }
            }
            EVT_ENCRYPTION_CHANGE => Event::EncryptionChange {
                status: r.read_u8()?,
                handle: r.read_u16_le()? & 0x0FFF,
                enabled: r.read_u8()? != 0,
            },
            EVT_LE_META => {
                let subcode = r.read_u8()?;
                match subcode {
                    LE_SUBEVT_CONNECTION_COMPLETE => parse_le_connection_complete(&mut r, false)?,
                    LE_SUBEVT_ENHANCED_CONNECTION_COMPLETE => parse_le_connection_complete(&mut r, true)?,
                    _ => Event::Unparsed { code, params: params.to_vec() },
                }
            }
            _ => Event::Unparsed { code, params: params.to_vec() },
        })
    }
}

/// Handles LE-Connection-Complete (0x01) and LE-Enhanced-Connection-Complete
/// (0x0A) identically except for where the resolvable private address is
/// read from, resolving the Open Question in spec.md §9.
fn parse_le_connection_complete(r: &mut ByteReader<'_>, enhanced: bool) -> Result<Event, CodecError> {
    let status = r.read_u8()?;
    let handle = r.read_u16_le()? & 0x0FFF;
    let role = r.read_u8()?;
    let peer_address_type = r.read_u8()?;
    let peer_address = BdAddr(r.read_array::<6>()?);
    let local_resolvable_private_address = if enhanced {
        // Enhanced event carries local then peer resolvable private
        // addresses before the rest of the connection parameters; we only
        // need the local one.
        let local = BdAddr(r.read_array::<6>()?);
        r.skip(6)?; // peer resolvable private address
        Some(local)
    } else {
        None
    };
    Ok(Event::LeConnectionComplete {
        status,
        handle,
        role,
        peer_address_type,
        peer_address,
        local_resolvable_private_address,
    })
}

impl<'a> Decode<'a> for Event {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        let rest = r.read_rest();
        Event::parse(&rest)
    }
}
