//! A minimal Service Discovery Protocol client (Vol 3 Part B), sufficient to
//! resolve one RFCOMM server channel from a service-class UUID for
//! `rfcomm::RfcommCore::connect_by_uuid` (spec.md §4.5, SPEC_FULL.md's
//! Supplemented-features section). The full attribute catalog, service
//! registration, and browsing remain a Non-goal.

use crate::codec::{ByteReader, ByteWriter, Decode, Encode};
use crate::error::{CodecError, RfcommError};
use crate::hci::Transport;
use crate::l2cap::{L2capCore, PSM_SDP};
use crate::uuid::{Uuid, Uuid128};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const PDU_SERVICE_SEARCH_ATTRIBUTE_REQUEST: u8 = 0x06;
const PDU_SERVICE_SEARCH_ATTRIBUTE_RESPONSE: u8 = 0x07;
const PDU_ERROR_RESPONSE: u8 = 0x01;

/// Attribute ID carrying a service's `ProtocolDescriptorList` (Vol 3 Part B
/// §5.1.7), the only attribute this client ever looks for.
const ATTR_PROTOCOL_DESCRIPTOR_LIST: u16 = 0x0004;
/// Protocol UUID identifying the RFCOMM layer within a descriptor.
const PROTOCOL_UUID_RFCOMM: u16 = 0x0003;

/// One decoded SDP data element (Vol 3 Part B §3.1). Only the variants this
/// client's request/response shape actually produces are represented.
#[derive(Debug, Clone)]
enum DataElement {
    UInt(u64),
    Uuid(Uuid),
    Seq(Vec<DataElement>),
    Other,
}

fn encode_element_header(w: &mut ByteWriter, kind: u8, size_index: u8) {
    w.write_u8((kind << 3) | size_index);
}

fn encode_uuid16(w: &mut ByteWriter, uuid: u16) {
    encode_element_header(w, 3, 1); // type=UUID, size index 1 => 2 bytes
    w.write_u16_be(uuid);
}

fn encode_uuid128(w: &mut ByteWriter, uuid: &Uuid128) {
    encode_element_header(w, 3, 4); // size index 4 => 16 bytes
    w.write_slice(uuid.as_bytes());
}

fn encode_uint16(w: &mut ByteWriter, v: u16) {
    encode_element_header(w, 1, 1);
    w.write_u16_be(v);
}

fn encode_seq(w: &mut ByteWriter, body: &[u8]) {
    if body.len() <= 255 {
        encode_element_header(w, 6, 5);
        w.write_u8(body.len() as u8);
    } else {
        encode_element_header(w, 6, 6);
        w.write_u16_be(body.len() as u16);
    }
    w.write_slice(body);
}

/// Decodes one data element, returning it and the number of bytes consumed.
fn decode_element(r: &mut ByteReader<'_>) -> Result<DataElement, CodecError> {
    let header = r.read_u8()?;
    let kind = header >> 3;
    let size_index = header & 0x07;

    let len = match size_index {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 4,
        4 => 8,
        5 => r.read_u8()? as usize,
        6 => r.read_u16_be()? as usize,
        7 => {
            let hi = r.read_u16_be()? as usize;
            let lo = r.read_u16_be()? as usize;
            (hi << 16) | lo
        }
        _ => unreachable!(),
    };

    Ok(match kind {
        0 => DataElement::UInt(0), // Nil
        1 | 2 => {
            // Unsigned/signed int, widths 1/2/4/8 bytes.
            let bytes = r.read_vec(len)?;
            let mut v: u64 = 0;
            for b in &bytes {
                v = (v << 8) | (*b as u64);
            }
            DataElement::UInt(v)
        }
        3 => {
            // UUID: 2, 4 or 16 bytes, big-endian on the wire for SDP.
            let bytes = r.read_vec(len)?;
            match bytes.len() {
                2 => DataElement::Uuid(Uuid::Uuid16(crate::uuid::Uuid16(u16::from_be_bytes([bytes[0], bytes[1]])))),
                16 => {
                    let mut arr = [0u8; 16];
                    arr.copy_from_slice(&bytes);
                    DataElement::Uuid(Uuid::Uuid128(Uuid128::from_bytes(arr)))
                }
                _ => DataElement::Other,
            }
        }
        6 | 7 => {
            let body = r.read_vec(len)?;
            let mut br = ByteReader::new(&body);
            let mut items = Vec::new();
            while !br.is_empty() {
                items.push(decode_element(&mut br)?);
            }
            DataElement::Seq(items)
        }
        _ => {
            r.read_vec(len)?;
            DataElement::Other
        }
    })
}

/// Builds the parameters of a Service-Search-Attribute request looking for
/// `service_uuid` and pulling only the `ProtocolDescriptorList` attribute.
fn build_request(service_uuid: Uuid128, max_bytes: u16) -> Vec<u8> {
    let mut pattern = ByteWriter::new();
    encode_uuid128(&mut pattern, &service_uuid);
    let mut search_seq = ByteWriter::new();
    encode_seq(&mut search_seq, &pattern.into_vec());

    let mut attr_ids = ByteWriter::new();
    encode_uint16(&mut attr_ids, ATTR_PROTOCOL_DESCRIPTOR_LIST);
    let mut attr_seq = ByteWriter::new();
    encode_seq(&mut attr_seq, &attr_ids.into_vec());

    let mut w = ByteWriter::new();
    w.write_slice(&search_seq.into_vec());
    w.write_u16_be(max_bytes);
    w.write_slice(&attr_seq.into_vec());
    w.write_u8(0); // no continuation state
    w.into_vec()
}

fn wrap_pdu(pdu_id: u8, transaction_id: u16, params: &[u8]) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(5 + params.len());
    w.write_u8(pdu_id);
    w.write_u16_be(transaction_id);
    w.write_u16_be(params.len() as u16);
    w.write_slice(params);
    w.into_vec()
}

/// Searches a decoded attribute value (a `ProtocolDescriptorList`, a
/// sequence of per-protocol descriptor sequences) for an RFCOMM channel
/// number, the first element of the descriptor tagged with the RFCOMM UUID.
fn find_rfcomm_channel_in_protocol_list(list: &DataElement) -> Option<u8> {
    let DataElement::Seq(descriptors) = list else { return None };
    for descriptor in descriptors {
        let DataElement::Seq(fields) = descriptor else { continue };
        let is_rfcomm = matches!(
            fields.first(),
            Some(DataElement::Uuid(Uuid::Uuid16(crate::uuid::Uuid16(u)))) if *u == PROTOCOL_UUID_RFCOMM
        );
        if is_rfcomm {
            if let Some(DataElement::UInt(channel)) = fields.get(1) {
                return Some(*channel as u8);
            }
        }
    }
    None
}

/// Walks every (attribute id, attribute value) pair across every service
/// record in a Service-Search-Attribute response body looking for
/// `ProtocolDescriptorList`.
fn extract_channel_from_response(attribute_lists: &DataElement) -> Option<u8> {
    let DataElement::Seq(records) = attribute_lists else { return None };
    for record in records {
        let DataElement::Seq(pairs) = record else { continue };
        let mut iter = pairs.iter();
        while let (Some(id), Some(value)) = (iter.next(), iter.next()) {
            if let DataElement::UInt(id) = id {
                if *id as u16 == ATTR_PROTOCOL_DESCRIPTOR_LIST {
                    if let Some(channel) = find_rfcomm_channel_in_protocol_list(value) {
                        return Some(channel);
                    }
                }
            }
        }
    }
    None
}

struct PendingSlot {
    tx: oneshot::Sender<Vec<u8>>,
}

/// One SDP client bound to an ACL link, opening its own transient L2CAP
/// channel on PSM 0x0001 per query (spec.md §4.3.2's PSM-0x0001 PENDING
/// special case exists precisely so this client's connection attempt
/// doesn't abort an in-progress pairing).
pub struct SdpClient<T: Transport> {
    l2cap: Arc<L2capCore<T>>,
    handle: u16,
}

impl<T: Transport> SdpClient<T> {
    pub fn new(l2cap: Arc<L2capCore<T>>, handle: u16) -> Self {
        Self { l2cap, handle }
    }

    /// Resolves the RFCOMM server channel number advertising `service_uuid`
    /// on the peer (spec.md scenario 5, `connect_by_uuid`).
    pub async fn find_rfcomm_channel(&self, service_uuid: Uuid128) -> Result<u8, RfcommError> {
        let local_cid = self.l2cap.connect(self.handle, PSM_SDP)?;
        self.l2cap.await_open(self.handle, local_cid).await?;

        let (tx, rx) = oneshot::channel();
        let pending = std::sync::Mutex::new(Some(PendingSlot { tx }));
        self.l2cap.register_channel_listener(self.handle, local_cid, move |payload| {
            if let Some(slot) = pending.lock().unwrap().take() {
                let _ = slot.tx.send(payload);
            }
        });

        let remote_cid = self.l2cap.remote_cid(self.handle, local_cid).ok_or(RfcommError::SdpLookupFailed)?;
        let params = build_request(service_uuid, 512);
        let request = wrap_pdu(PDU_SERVICE_SEARCH_ATTRIBUTE_REQUEST, 1, &params);
        self.l2cap.write_fixed(self.handle, remote_cid, &request);

        let result = tokio::time::timeout(Duration::from_secs(5), rx).await;
        self.l2cap.remove_channel_listener(self.handle, local_cid);
        let _ = self.l2cap.disconnect(self.handle, local_cid);

        let raw = result.map_err(|_| RfcommError::SdpLookupFailed)?.map_err(|_| RfcommError::SdpLookupFailed)?;
        let mut r = ByteReader::new(&raw);
        let pdu_id = r.read_u8().map_err(|_| RfcommError::SdpLookupFailed)?;
        let _transaction_id = r.read_u16_be().map_err(|_| RfcommError::SdpLookupFailed)?;
        let param_len = r.read_u16_be().map_err(|_| RfcommError::SdpLookupFailed)? as usize;
        let params = r.read_vec(param_len).map_err(|_| RfcommError::SdpLookupFailed)?;

        if pdu_id == PDU_ERROR_RESPONSE {
            return Err(RfcommError::SdpLookupFailed);
        }
        if pdu_id != PDU_SERVICE_SEARCH_ATTRIBUTE_RESPONSE {
            return Err(RfcommError::SdpLookupFailed);
        }

        let mut pr = ByteReader::new(&params);
        let attr_bytes_count = pr.read_u16_be().map_err(|_| RfcommError::SdpLookupFailed)? as usize;
        let attr_bytes = pr.read_vec(attr_bytes_count).map_err(|_| RfcommError::SdpLookupFailed)?;
        let mut ar = ByteReader::new(&attr_bytes);
        let attribute_lists = decode_element(&mut ar).map_err(|_| RfcommError::SdpLookupFailed)?;

        extract_channel_from_response(&attribute_lists).ok_or(RfcommError::SdpLookupFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodes_a_uuid128_search_pattern() {
        let uuid = Uuid128::from(uuid::Uuid::parse_str("00001101-0000-1000-8000-00805f9b34fb").unwrap());
        let params = build_request(uuid, 512);
        // ServiceSearchPattern sequence header, then element header for the
        // 16-byte UUID (type=3 << 3 | size_index=4 == 0x1C).
        assert_eq!(params[0], 0x35); // seq, 1-byte length
        assert_eq!(params[2], 0x1C);
    }

    #[test]
    fn finds_rfcomm_channel_in_protocol_descriptor_list() {
        // ProtocolDescriptorList: seq[ seq[UUID(L2CAP)], seq[UUID(RFCOMM), UInt(channel=5)] ]
        let list = DataElement::Seq(vec![
            DataElement::Seq(vec![DataElement::Uuid(Uuid::Uuid16(crate::uuid::Uuid16(0x0100)))]),
            DataElement::Seq(vec![
                DataElement::Uuid(Uuid::Uuid16(crate::uuid::Uuid16(PROTOCOL_UUID_RFCOMM))),
                DataElement::UInt(5),
            ]),
        ]);
        assert_eq!(find_rfcomm_channel_in_protocol_list(&list), Some(5));
    }

    #[test]
    fn decodes_a_service_search_attribute_response_body() {
        // One service record: seq[ UInt16(attr=0x0004), seq[seq[UUID16(RFCOMM), UInt8(7)]] ]
        let mut protocol = ByteWriter::new();
        encode_uuid16(&mut protocol, PROTOCOL_UUID_RFCOMM);
        encode_element_header(&mut protocol, 1, 0);
        protocol.write_u8(7);
        let mut descriptor = ByteWriter::new();
        encode_seq(&mut descriptor, &protocol.into_vec());
        let mut list = ByteWriter::new();
        encode_seq(&mut list, &descriptor.into_vec());

        let mut record = ByteWriter::new();
        encode_uint16(&mut record, ATTR_PROTOCOL_DESCRIPTOR_LIST);
        record.write_slice(&list.into_vec());
        let mut record_seq = ByteWriter::new();
        encode_seq(&mut record_seq, &record.into_vec());
        let mut records = ByteWriter::new();
        encode_seq(&mut records, &record_seq.into_vec());

        let bytes = records.into_vec();
        let mut r = ByteReader::new(&bytes);
        let decoded = decode_element(&mut r).unwrap();
        assert_eq!(extract_channel_from_response(&decoded), Some(7));
    }
}
