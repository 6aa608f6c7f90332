//! RFCOMM multiplexer control channel (MCC) commands, carried inside UIH
//! frames addressed to DLCI 0 (GSM 07.10 §5.4.6.3).

use crate::codec::{ByteReader, ByteWriter, Decode, Encode};
use crate::error::CodecError;

pub const MCC_TYPE_PN: u8 = 0x20;
pub const MCC_TYPE_MSC: u8 = 0x38;
pub const MCC_TYPE_RPN: u8 = 0x24;
pub const MCC_TYPE_RLS: u8 = 0x14;
pub const MCC_TYPE_TEST: u8 = 0x08;
pub const MCC_TYPE_FCON: u8 = 0x28;
pub const MCC_TYPE_FCOFF: u8 = 0x18;
pub const MCC_TYPE_NSC: u8 = 0x04;

#[derive(Debug, Clone)]
pub enum McCommand {
    Pn(PnParams),
    Msc { dlci: u8, signals: u8 },
    Rpn { dlci: u8, params: Vec<u8> },
    Rls { dlci: u8, status: u8 },
    Test { data: Vec<u8> },
    FCon,
    FCoff,
    Nsc { rejected_type: u8 },
}

#[derive(Debug, Copy, Clone)]
pub struct PnParams {
    pub dlci: u8,
    pub frame_type: u8,
    pub credit_based_flow: bool,
    pub priority: u8,
    pub ack_timer: u8,
    pub max_frame_size: u16,
    pub max_retransmissions: u8,
    pub initial_credits: u8,
}

impl PnParams {
    pub fn request(dlci: u8, max_frame_size: u16, initial_credits: u8) -> Self {
        Self {
            dlci,
            frame_type: 0,
            credit_based_flow: true,
            priority: 0,
            ack_timer: 0,
            max_frame_size,
            max_retransmissions: 0,
            initial_credits,
        }
    }

    fn encode_body(&self, w: &mut ByteWriter) {
        w.write_u8(self.dlci & 0x3F);
        let flow_bits = if self.credit_based_flow { 0xF0 } else { 0x00 };
        w.write_u8(self.frame_type | flow_bits);
        w.write_u8(self.priority & 0x3F);
        w.write_u8(self.ack_timer);
        w.write_u16_le(self.max_frame_size);
        w.write_u8(self.max_retransmissions);
        w.write_u8(self.initial_credits & 0x07);
    }

    fn decode_body(r: &mut ByteReader) -> Result<Self, CodecError> {
        let dlci = r.read_u8()? & 0x3F;
        let type_and_flow = r.read_u8()?;
        let credit_based_flow = type_and_flow & 0xF0 == 0xF0;
        let frame_type = type_and_flow & 0x0F;
        let priority = r.read_u8()? & 0x3F;
        let ack_timer = r.read_u8()?;
        let max_frame_size = r.read_u16_le()?;
        let max_retransmissions = r.read_u8()?;
        let initial_credits = r.read_u8()? & 0x07;
        Ok(Self { dlci, frame_type, credit_based_flow, priority, ack_timer, max_frame_size, max_retransmissions, initial_credits })
    }
}

fn type_byte(ty: u8, command: bool) -> u8 {
    // EA=1, C/R bit, type in bits 2..=7.
    0x01 | ((command as u8) << 1) | (ty << 2)
}

fn length_byte(len: usize) -> u8 {
    ((len as u8) << 1) | 0x01
}

/// Wraps one MCC command as the information field of a UIH frame sent on
/// DLCI 0 (the caller still has to frame it with [`crate::rfcomm::frame`]).
pub fn encode(command: &McCommand, is_command: bool) -> Vec<u8> {
    let mut body = ByteWriter::new();
    let ty = match command {
        McCommand::Pn(params) => {
            params.encode_body(&mut body);
            MCC_TYPE_PN
        }
        McCommand::Msc { dlci, signals } => {
            body.write_u8((dlci & 0x3F) << 2 | 0x03);
            body.write_u8(*signals);
            MCC_TYPE_MSC
        }
        McCommand::Rpn { dlci, params } => {
            body.write_u8((dlci & 0x3F) << 2 | 0x03);
            body.write_slice(params);
            MCC_TYPE_RPN
        }
        McCommand::Rls { dlci, status } => {
            body.write_u8((dlci & 0x3F) << 2 | 0x03);
            body.write_u8(*status);
            MCC_TYPE_RLS
        }
        McCommand::Test { data } => {
            body.write_slice(data);
            MCC_TYPE_TEST
        }
        McCommand::FCon => MCC_TYPE_FCON,
        McCommand::FCoff => MCC_TYPE_FCOFF,
        McCommand::Nsc { rejected_type } => {
            body.write_u8(*rejected_type);
            MCC_TYPE_NSC
        }
    };
    let body = body.into_vec();
    let mut w = ByteWriter::with_capacity(2 + body.len());
    w.write_u8(type_byte(ty, is_command));
    w.write_u8(length_byte(body.len()));
    w.write_slice(&body);
    w.into_vec()
}

/// Decodes one MCC command from a UIH-on-DLCI-0 information field. Returns
/// the command plus whether the C/R bit marked it a command (vs. a
/// response echo).
pub fn decode(bytes: &[u8]) -> Result<(McCommand, bool), CodecError> {
    let mut r = ByteReader::new(bytes);
    let type_byte = r.read_u8()?;
    let is_command = (type_byte & 0x02) != 0;
    let ty = (type_byte >> 2) & 0x3F;
    let length_byte = r.read_u8()?;
    let len = (length_byte >> 1) as usize;
    let body = r.read_vec(len)?;
    let mut br = ByteReader::new(&body);

    let command = match ty {
        MCC_TYPE_PN => McCommand::Pn(PnParams::decode_body(&mut br)?),
        MCC_TYPE_MSC => {
            let dlci = (br.read_u8()? >> 2) & 0x3F;
            McCommand::Msc { dlci, signals: br.read_u8()? }
        }
        MCC_TYPE_RPN => {
            let dlci = (br.read_u8()? >> 2) & 0x3F;
            McCommand::Rpn { dlci, params: br.read_rest() }
        }
        MCC_TYPE_RLS => {
            let dlci = (br.read_u8()? >> 2) & 0x3F;
            McCommand::Rls { dlci, status: br.read_u8()? }
        }
        MCC_TYPE_TEST => McCommand::Test { data: br.read_rest() },
        MCC_TYPE_FCON => McCommand::FCon,
        MCC_TYPE_FCOFF => McCommand::FCoff,
        MCC_TYPE_NSC => McCommand::Nsc { rejected_type: br.read_u8()? },
        _ => return Err(CodecError::InvalidValue { field: "mcc_type" }),
    };
    Ok((command, is_command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pn_round_trips() {
        let cmd = McCommand::Pn(PnParams::request(3, 127, 7));
        let bytes = encode(&cmd, true);
        let (decoded, is_command) = decode(&bytes).unwrap();
        assert!(is_command);
        match decoded {
            McCommand::Pn(p) => {
                assert_eq!(p.dlci, 3);
                assert_eq!(p.max_frame_size, 127);
                assert_eq!(p.initial_credits, 7);
                assert!(p.credit_based_flow);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn msc_round_trips() {
        let cmd = McCommand::Msc { dlci: 5, signals: 0x8D };
        let bytes = encode(&cmd, true);
        let (decoded, _) = decode(&bytes).unwrap();
        match decoded {
            McCommand::Msc { dlci, signals } => {
                assert_eq!(dlci, 5);
                assert_eq!(signals, 0x8D);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
