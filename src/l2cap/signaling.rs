//! L2CAP signaling channel PDUs and the connection/configuration/
//! disconnection/information/echo request dispatch (Vol 3 Part A §4).
//!
//! PDU shapes and the Information Request "connectionless MTU / local
//! features / fixed channels" cases are ported from bluefang's
//! `handle_l2cap_signaling` family
//! (`other_examples/6fe10cb9_sidit77-bluefang__src-l2cap-signaling.rs.rs`),
//! rewritten against this crate's owned-buffer `Encode`/`Decode` instead of
//! bluefang's `instructor` derive macros.

use crate::codec::{ByteReader, ByteWriter, Decode, Encode};
use crate::error::{CodecError, L2capResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalingCode {
    CommandReject = 0x01,
    ConnectionRequest = 0x02,
    ConnectionResponse = 0x03,
    ConfigureRequest = 0x04,
    ConfigureResponse = 0x05,
    DisconnectionRequest = 0x06,
    DisconnectionResponse = 0x07,
    EchoRequest = 0x08,
    EchoResponse = 0x09,
    InformationRequest = 0x0A,
    InformationResponse = 0x0B,
    LeCreditBasedConnectionRequest = 0x14,
    LeCreditBasedConnectionResponse = 0x15,
    FlowControlCreditInd = 0x16,
}

impl SignalingCode {
    fn from_u8(v: u8) -> Option<Self> {
        use SignalingCode::*;
        Some(match v {
            0x01 => CommandReject,
            0x02 => ConnectionRequest,
            0x03 => ConnectionResponse,
            0x04 => ConfigureRequest,
            0x05 => ConfigureResponse,
            0x06 => DisconnectionRequest,
            0x07 => DisconnectionResponse,
            0x08 => EchoRequest,
            0x09 => EchoResponse,
            0x0A => InformationRequest,
            0x0B => InformationResponse,
            0x14 => LeCreditBasedConnectionRequest,
            0x15 => LeCreditBasedConnectionResponse,
            0x16 => FlowControlCreditInd,
            _ => return None,
        })
    }
}

/// `[code:8][identifier:8][length:16]` prefix shared by every signaling PDU.
#[derive(Debug, Copy, Clone)]
pub struct SignalingHeader {
    pub code: u8,
    pub identifier: u8,
    pub length: u16,
}

impl Encode for SignalingHeader {
    fn encode(&self, w: &mut ByteWriter) {
        w.write_u8(self.code);
        w.write_u8(self.identifier);
        w.write_u16_le(self.length);
    }
}

impl<'a> Decode<'a> for SignalingHeader {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        Ok(Self { code: r.read_u8()?, identifier: r.read_u8()?, length: r.read_u16_le()? })
    }
}

/// Wraps `payload` with a signaling header for `code`/`identifier` and
/// returns the full PDU ready to hand to `L2capCore::send_acl_payload`
/// on CID 0x0001 (or 0x0005 for LE).
pub fn wrap(code: SignalingCode, identifier: u8, payload: &[u8]) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(4 + payload.len());
    SignalingHeader { code: code as u8, identifier, length: payload.len() as u16 }.encode(&mut w);
    w.write_slice(payload);
    w.into_vec()
}

#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub psm: u16,
    pub scid: u16,
}

impl Encode for ConnectionRequest {
    fn encode(&self, w: &mut ByteWriter) {
        w.write_u16_le(self.psm);
        w.write_u16_le(self.scid);
    }
}

impl<'a> Decode<'a> for ConnectionRequest {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        Ok(Self { psm: r.read_u16_le()?, scid: r.read_u16_le()? })
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionResponse {
    pub dcid: u16,
    pub scid: u16,
    pub result: L2capResult,
    /// Extended status carried alongside a `Pending` result, e.g.
    /// "Authentication Pending" (0x0001) for PSM 0x0001 without a
    /// registered server (spec.md §4.3.2). `0x0000` ("no further
    /// information") outside the pending case.
    pub status: u16,
}

fn result_to_u16(r: L2capResult) -> u16 {
    match r {
        L2capResult::Pending => 0x0001,
        L2capResult::PsmNotSupported => 0x0002,
        L2capResult::SecurityBlock => 0x0003,
        L2capResult::NoResources => 0x0004,
        L2capResult::InvalidSourceCid => 0x0006,
        L2capResult::SourceCidAlreadyAllocated => 0x0007,
        L2capResult::Unknown(v) => v,
    }
}

fn u16_to_result(v: u16) -> L2capResult {
    match v {
        0x0000 => return L2capResult::Unknown(0), // caller checks == 0 for Success separately
        0x0001 => L2capResult::Pending,
        0x0002 => L2capResult::PsmNotSupported,
        0x0003 => L2capResult::SecurityBlock,
        0x0004 => L2capResult::NoResources,
        0x0006 => L2capResult::InvalidSourceCid,
        0x0007 => L2capResult::SourceCidAlreadyAllocated,
        other => L2capResult::Unknown(other),
    }
}

impl Encode for ConnectionResponse {
    fn encode(&self, w: &mut ByteWriter) {
        w.write_u16_le(self.dcid);
        w.write_u16_le(self.scid);
        w.write_u16_le(result_to_u16(self.result));
        w.write_u16_le(self.status);
    }
}

impl<'a> Decode<'a> for ConnectionResponse {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        let dcid = r.read_u16_le()?;
        let scid = r.read_u16_le()?;
        let raw_result = r.read_u16_le()?;
        let status = r.read_u16_le()?;
        let result = if raw_result == 0 { L2capResult::Unknown(0) } else { u16_to_result(raw_result) };
        Ok(Self { dcid, scid, result, status })
    }
}

/// `true` iff the wire value `0x0000` ("Success") was read; callers should
/// check this instead of matching on `L2capResult` for the success case.
pub fn is_success(raw_result: u16) -> bool {
    raw_result == 0
}

#[derive(Debug, Clone)]
pub struct ConfigureRequest {
    pub dcid: u16,
    pub flags: u16,
    pub options: Vec<u8>,
}

impl Encode for ConfigureRequest {
    fn encode(&self, w: &mut ByteWriter) {
        w.write_u16_le(self.dcid);
        w.write_u16_le(self.flags);
        w.write_slice(&self.options);
    }
}

impl<'a> Decode<'a> for ConfigureRequest {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        let dcid = r.read_u16_le()?;
        let flags = r.read_u16_le()?;
        let options = r.read_rest();
        Ok(Self { dcid, flags, options })
    }
}

#[derive(Debug, Clone)]
pub struct ConfigureResponse {
    pub scid: u16,
    pub flags: u16,
    pub result: u16,
    pub options: Vec<u8>,
}

impl Encode for ConfigureResponse {
    fn encode(&self, w: &mut ByteWriter) {
        w.write_u16_le(self.scid);
        w.write_u16_le(self.flags);
        w.write_u16_le(self.result);
        w.write_slice(&self.options);
    }
}

impl<'a> Decode<'a> for ConfigureResponse {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        let scid = r.read_u16_le()?;
        let flags = r.read_u16_le()?;
        let result = r.read_u16_le()?;
        let options = r.read_rest();
        Ok(Self { scid, flags, result, options })
    }
}

#[derive(Debug, Clone)]
pub struct DisconnectionRequest {
    pub dcid: u16,
    pub scid: u16,
}

impl Encode for DisconnectionRequest {
    fn encode(&self, w: &mut ByteWriter) {
        w.write_u16_le(self.dcid);
        w.write_u16_le(self.scid);
    }
}

impl<'a> Decode<'a> for DisconnectionRequest {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        Ok(Self { dcid: r.read_u16_le()?, scid: r.read_u16_le()? })
    }
}

/// Parses the signaling header off `payload` and returns `(code, identifier,
/// body)`, or `None` for a code this crate doesn't recognize (the caller
/// should respond Command Reject / Not Understood, per bluefang's default
/// arm).
pub fn parse_header(payload: &[u8]) -> Result<(SignalingCode, u8, Vec<u8>), CodecError> {
    let mut r = ByteReader::new(payload);
    let header = SignalingHeader::decode(&mut r)?;
    let body = r.read_vec(header.length as usize)?;
    let code = SignalingCode::from_u8(header.code).ok_or(CodecError::InvalidValue { field: "signaling_code" })?;
    Ok((code, header.identifier, body))
}

#[derive(Debug, Clone)]
pub struct LeCreditBasedConnectionRequest {
    pub psm: u16,
    pub scid: u16,
    pub mtu: u16,
    pub mps: u16,
    pub initial_credits: u16,
}

impl Encode for LeCreditBasedConnectionRequest {
    fn encode(&self, w: &mut ByteWriter) {
        w.write_u16_le(self.psm);
        w.write_u16_le(self.scid);
        w.write_u16_le(self.mtu);
        w.write_u16_le(self.mps);
        w.write_u16_le(self.initial_credits);
    }
}

impl<'a> Decode<'a> for LeCreditBasedConnectionRequest {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        Ok(Self {
            psm: r.read_u16_le()?,
            scid: r.read_u16_le()?,
            mtu: r.read_u16_le()?,
            mps: r.read_u16_le()?,
            initial_credits: r.read_u16_le()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LeCreditBasedConnectionResponse {
    pub dcid: u16,
    pub mtu: u16,
    pub mps: u16,
    pub initial_credits: u16,
    pub result: u16,
}

impl Encode for LeCreditBasedConnectionResponse {
    fn encode(&self, w: &mut ByteWriter) {
        w.write_u16_le(self.dcid);
        w.write_u16_le(self.mtu);
        w.write_u16_le(self.mps);
        w.write_u16_le(self.initial_credits);
        w.write_u16_le(self.result);
    }
}

impl<'a> Decode<'a> for LeCreditBasedConnectionResponse {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        Ok(Self {
            dcid: r.read_u16_le()?,
            mtu: r.read_u16_le()?,
            mps: r.read_u16_le()?,
            initial_credits: r.read_u16_le()?,
            result: r.read_u16_le()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FlowControlCreditInd {
    pub cid: u16,
    pub credits: u16,
}

impl Encode for FlowControlCreditInd {
    fn encode(&self, w: &mut ByteWriter) {
        w.write_u16_le(self.cid);
        w.write_u16_le(self.credits);
    }
}

impl<'a> Decode<'a> for FlowControlCreditInd {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        Ok(Self { cid: r.read_u16_le()?, credits: r.read_u16_le()? })
    }
}

/// Builds a single Configuration option carrying the MTU (type 0x01, Vol 3
/// Part A §5.1), the only option this stack sends on outbound Configuration
/// Requests (spec.md §4.3.2).
pub fn mtu_option(mtu: u16) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(4);
    w.write_u8(0x01);
    w.write_u8(2);
    w.write_u16_le(mtu);
    w.into_vec()
}

/// Information Request types this stack answers (Vol 3 Part A §4.10-4.13).
pub const INFO_TYPE_CONNECTIONLESS_MTU: u16 = 0x0001;
pub const INFO_TYPE_LOCAL_FEATURES: u16 = 0x0002;
pub const INFO_TYPE_FIXED_CHANNELS: u16 = 0x0003;

/// Builds the Information Response body for a supported `info_type`, or
/// the "not supported" response for anything else.
pub fn information_response_body(info_type: u16) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_u16_le(info_type);
    match info_type {
        INFO_TYPE_CONNECTIONLESS_MTU => {
            w.write_u16_le(0x0000);
            w.write_u16_le(672); // spec.md §4.3.2
        }
        INFO_TYPE_LOCAL_FEATURES => {
            w.write_u16_le(0x0000);
            w.write_u32_le(1 << 7); // fixed channels supported over BR/EDR
        }
        INFO_TYPE_FIXED_CHANNELS => {
            w.write_u16_le(0x0000);
            let mut channels = [0u8; 8];
            // bit 1: L2CAP signaling (CID 0x0001), bit 4: ATT (CID 0x0004),
            // bit 5: LE L2CAP signaling (CID 0x0005), bit 6: SMP (CID
            // 0x0006) (Vol 3 Part A §4.12, spec.md §4.3.2).
            channels[0] = 0b0111_0010;
            w.write_slice(&channels);
        }
        _ => {
            w.write_u16_le(0x0001); // not supported
        }
    }
    w.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_request_round_trips() {
        let req = ConnectionRequest { psm: 0x0019, scid: 0x0041 };
        let bytes = req.encoded();
        let mut r = ByteReader::new(&bytes);
        let decoded = ConnectionRequest::decode(&mut r).unwrap();
        assert_eq!(decoded.psm, 0x0019);
        assert_eq!(decoded.scid, 0x0041);
    }

    #[test]
    fn information_response_reports_fixed_channels() {
        let body = information_response_body(INFO_TYPE_FIXED_CHANNELS);
        assert_eq!(&body[0..2], &0x0003u16.to_le_bytes());
        assert_eq!(&body[2..4], &0x0000u16.to_le_bytes());
        assert_eq!(body[4], 0b0111_0010); // signaling, ATT, LE signaling, SMP
    }

    #[test]
    fn information_response_reports_connectionless_mtu() {
        let body = information_response_body(INFO_TYPE_CONNECTIONLESS_MTU);
        assert_eq!(&body[4..6], &672u16.to_le_bytes());
    }

    #[test]
    fn unknown_signaling_code_is_rejected() {
        let header = wrap(SignalingCode::EchoRequest, 1, &[]);
        let (code, id, body) = parse_header(&header).unwrap();
        assert_eq!(code, SignalingCode::EchoRequest);
        assert_eq!(id, 1);
        assert!(body.is_empty());
    }
}
