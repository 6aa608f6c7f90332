//! RFCOMM frame codec (ETSI TS 101 369 / GSM 07.10 §5), layered directly on
//! top of an L2CAP dynamic channel (PSM 0x0003, spec.md §4.5).
//!
//! No example repo in the retrieval pack implements TS 27.010 at the wire
//! level (bluer's `rfcomm` module only wraps the kernel's RFCOMM socket,
//! `other_examples/46b04758_bluez-bluer__bluer-src-rfcomm-mod.rs.rs`), so
//! the frame/address/control layout here follows the standard directly; the
//! `Encode`/`Decode` trait shape and the "never panic, return `CodecError`"
//! discipline still follow [`crate::codec`].

use crate::codec::{ByteReader, ByteWriter, Decode, Encode};
use crate::error::CodecError;
use std::sync::OnceLock;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameType {
    Sabm,
    Ua,
    Dm,
    Disc,
    Uih,
}

impl FrameType {
    fn control_bits(self) -> u8 {
        match self {
            FrameType::Sabm => 0x2F,
            FrameType::Ua => 0x63,
            FrameType::Dm => 0x0F,
            FrameType::Disc => 0x43,
            FrameType::Uih => 0xEF,
        }
    }

    fn from_control_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0x2F => FrameType::Sabm,
            0x63 => FrameType::Ua,
            0x0F => FrameType::Dm,
            0x43 => FrameType::Disc,
            0xEF => FrameType::Uih,
            _ => return None,
        })
    }

    /// Only UIH frames exclude the length field from the FCS (DESIGN.md's
    /// resolution of the documented Open Question).
    pub fn fcs_includes_length(self) -> bool {
        !matches!(self, FrameType::Uih)
    }
}

/// One TS 27.010 frame: `[address][control][length...][data][fcs]`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub dlci: u8,
    /// Command/Response bit (address byte bit 1); distinguishes a command
    /// from its response on the same DLCI.
    pub command: bool,
    pub frame_type: FrameType,
    pub poll_final: bool,
    pub data: Vec<u8>,
}

fn crc8_table() -> &'static [u8; 256] {
    static TABLE: OnceLock<[u8; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u8; 256];
        let mut i = 0usize;
        while i < 256 {
            let mut crc = i as u8;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 0x01 != 0 { (crc >> 1) ^ 0xE0 } else { crc >> 1 };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    })
}

fn compute_fcs(bytes: &[u8]) -> u8 {
    let table = crc8_table();
    let mut crc: u8 = 0xFF;
    for &b in bytes {
        crc = table[(crc ^ b) as usize];
    }
    0xFF - crc
}

impl Frame {
    fn address_byte(&self) -> u8 {
        // EA=1 (no extended DLCI), C/R, DLCI in bits 2..=7.
        0x01 | ((self.command as u8) << 1) | (self.dlci << 2)
    }

    fn control_byte(&self) -> u8 {
        self.frame_type.control_bits() | ((self.poll_final as u8) << 4)
    }
}

impl Encode for Frame {
    fn encode(&self, w: &mut ByteWriter) {
        let address = self.address_byte();
        let control = self.control_byte();

        let mut head = ByteWriter::new();
        head.write_u8(address);
        head.write_u8(control);
        encode_length(&mut head, self.data.len());
        let head_bytes = head.into_vec();

        let fcs_input: Vec<u8> = if self.frame_type.fcs_includes_length() {
            head_bytes.clone()
        } else {
            head_bytes[..2].to_vec()
        };
        let fcs = compute_fcs(&fcs_input);

        w.write_slice(&head_bytes);
        w.write_slice(&self.data);
        w.write_u8(fcs);
    }
}

fn encode_length(w: &mut ByteWriter, len: usize) {
    if len <= 127 {
        w.write_u8(((len as u8) << 1) | 0x01);
    } else {
        // Two-byte length: EA=0 on first octet, EA=1 on second.
        w.write_u8(((len as u8 & 0x7F) << 1) as u8);
        w.write_u8(((len >> 7) as u8) << 1 | 0x01);
    }
}

impl<'a> Decode<'a> for Frame {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        let address = r.read_u8()?;
        let control = r.read_u8()?;
        let dlci = (address >> 2) & 0x3F;
        let command = (address & 0x02) != 0;

        let len_byte1 = r.read_u8()?;
        let (length, length_bytes): (usize, Vec<u8>) = if len_byte1 & 0x01 != 0 {
            (((len_byte1 >> 1) as usize), vec![len_byte1])
        } else {
            let len_byte2 = r.read_u8()?;
            let len = ((len_byte1 >> 1) as usize) | ((len_byte2 >> 1) as usize) << 7;
            (len, vec![len_byte1, len_byte2])
        };

        let data = r.read_vec(length)?;
        let fcs = r.read_u8()?;

        let frame_type_bits = control & !0x10;
        let poll_final = control & 0x10 != 0;
        let frame_type =
            FrameType::from_control_bits(frame_type_bits).ok_or(CodecError::InvalidValue { field: "rfcomm_control" })?;

        let mut fcs_input = vec![address, control];
        if frame_type.fcs_includes_length() {
            fcs_input.extend_from_slice(&length_bytes);
        }
        if compute_fcs(&fcs_input) != fcs {
            return Err(CodecError::BadFcs);
        }

        Ok(Frame { dlci, command, frame_type, poll_final, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sabm_round_trips_with_valid_fcs() {
        let frame = Frame { dlci: 2, command: true, frame_type: FrameType::Sabm, poll_final: true, data: vec![] };
        let bytes = frame.encoded();
        let mut r = ByteReader::new(&bytes);
        let decoded = Frame::decode(&mut r).unwrap();
        assert_eq!(decoded.dlci, 2);
        assert_eq!(decoded.frame_type, FrameType::Sabm);
    }

    #[test]
    fn uih_frame_fcs_excludes_length() {
        let frame = Frame { dlci: 2, command: true, frame_type: FrameType::Uih, poll_final: false, data: vec![1, 2, 3] };
        let bytes = frame.encoded();
        let mut r = ByteReader::new(&bytes);
        let decoded = Frame::decode(&mut r).unwrap();
        assert_eq!(decoded.data, vec![1, 2, 3]);
    }

    #[test]
    fn corrupted_fcs_is_rejected() {
        let frame = Frame { dlci: 2, command: true, frame_type: FrameType::Ua, poll_final: true, data: vec![] };
        let mut bytes = frame.encoded();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut r = ByteReader::new(&bytes);
        assert!(matches!(Frame::decode(&mut r), Err(CodecError::BadFcs)));
    }

    #[test]
    fn long_uih_payload_uses_two_byte_length() {
        let data = vec![0xAB; 200];
        let frame = Frame { dlci: 5, command: false, frame_type: FrameType::Uih, poll_final: false, data: data.clone() };
        let bytes = frame.encoded();
        let mut r = ByteReader::new(&bytes);
        let decoded = Frame::decode(&mut r).unwrap();
        assert_eq!(decoded.data, data);
    }
}
