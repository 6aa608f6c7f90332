//! Bluetooth UUIDs (16-, 32- and 128-bit), with Base UUID shortening.
//!
//! Ported from the teacher's `rubble::uuid` module: the `BASE_UUID`
//! constant, the `Uuid16 -> Uuid32 -> Uuid128` `From` ladder, and the
//! little-endian wire encoding rule are kept verbatim in spirit. Unlike the
//! teacher, `Uuid128` here also knows how to *shorten* back down to a
//! 16/32-bit alias (spec.md §4.1's round-trip requirement
//! `uuidFromShort(n)` / `shortOf(_)`), which the teacher's beacon/GATT-only
//! use case never needed.

use crate::codec::{ByteReader, ByteWriter, Decode, Encode};
use crate::error::CodecError;
use std::fmt;

/// `00000000-0000-1000-8000-00805F9B34FB`, little-endian on the wire.
const BASE_UUID: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
];

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Uuid16(pub u16);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Uuid32(pub u32);

/// A full 128-bit UUID, stored as the 16 bytes of its string form (i.e.
/// big-endian field order, matching `uuid::Uuid::as_bytes`). Wire encoding
/// reverses this to little-endian, per spec.md §4.1.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Uuid128([u8; 16]);

/// Any of the three wire representations a PDU field might carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Uuid {
    Uuid16(Uuid16),
    Uuid128(Uuid128),
}

impl Uuid {
    pub fn to_uuid128(self) -> Uuid128 {
        match self {
            Uuid::Uuid16(u) => u.into(),
            Uuid::Uuid128(u) => u,
        }
    }

    /// Shortens to 16 bits if representable, widening the comparison side
    /// via the Base UUID rule rather than the other way around.
    pub fn shorten(self) -> Uuid {
        match self {
            Uuid::Uuid16(u) => Uuid::Uuid16(u),
            Uuid::Uuid128(u) => match u.try_shorten() {
                Some(short) => Uuid::Uuid16(short),
                None => Uuid::Uuid128(u),
            },
        }
    }
}

impl From<Uuid16> for Uuid {
    fn from(u: Uuid16) -> Self {
        Uuid::Uuid16(u)
    }
}

impl From<Uuid128> for Uuid {
    fn from(u: Uuid128) -> Self {
        Uuid::Uuid128(u)
    }
}

impl Uuid128 {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Bits [95:48] zero and lower 96 bits equal to the Base UUID's lower 96
    /// bits: representable as 16-bit (spec.md §4.1).
    pub fn try_shorten(&self) -> Option<Uuid16> {
        if self.0[4..16] == BASE_UUID[4..16] && self.0[0] == 0 && self.0[1] == 0 {
            Some(Uuid16(u16::from_be_bytes([self.0[2], self.0[3]])))
        } else {
            None
        }
    }

    pub fn try_shorten32(&self) -> Option<Uuid32> {
        if self.0[4..16] == BASE_UUID[4..16] {
            Some(Uuid32(u32::from_be_bytes([
                self.0[0], self.0[1], self.0[2], self.0[3],
            ])))
        } else {
            None
        }
    }
}

impl From<Uuid16> for Uuid32 {
    fn from(u: Uuid16) -> Self {
        Uuid32(u.0 as u32)
    }
}

impl From<Uuid16> for Uuid128 {
    fn from(u: Uuid16) -> Self {
        Uuid32::from(u).into()
    }
}

impl From<Uuid32> for Uuid128 {
    fn from(u: Uuid32) -> Self {
        let mut buf = BASE_UUID;
        buf[0..4].copy_from_slice(&u.0.to_be_bytes());
        Uuid128(buf)
    }
}

impl Encode for Uuid16 {
    fn encode(&self, w: &mut ByteWriter) {
        w.write_u16_le(self.0);
    }
}

impl Encode for Uuid128 {
    fn encode(&self, w: &mut ByteWriter) {
        let mut le = self.0;
        le.reverse();
        w.write_slice(&le);
    }
}

impl Encode for Uuid {
    fn encode(&self, w: &mut ByteWriter) {
        match self {
            Uuid::Uuid16(u) => u.encode(w),
            Uuid::Uuid128(u) => u.encode(w),
        }
    }
}

impl<'a> Decode<'a> for Uuid16 {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        Ok(Uuid16(r.read_u16_le()?))
    }
}

impl<'a> Decode<'a> for Uuid128 {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError> {
        let mut bytes = r.read_array::<16>()?;
        bytes.reverse();
        Ok(Uuid128(bytes))
    }
}

/// Decodes a UUID whose wire width (2 or 16 bytes) is determined by how
/// many bytes remain in `r` — the shape ATT PDUs use for a trailing UUID
/// field (e.g. `ReadByTypeReq`'s `attribute_type`).
pub fn decode_sized<'a>(r: &mut ByteReader<'a>, remaining: usize) -> Result<Uuid, CodecError> {
    match remaining {
        2 => Ok(Uuid::Uuid16(Uuid16::decode(r)?)),
        16 => Ok(Uuid::Uuid128(Uuid128::decode(r)?)),
        _ => Err(CodecError::InvalidValue { field: "uuid_length" }),
    }
}

impl fmt::Debug for Uuid128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Uuid128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

/// Interop with the `uuid` crate so callers can pass a standard
/// [`uuid::Uuid`] into public APIs (e.g. `connect_by_uuid`) instead of
/// building a [`Uuid128`] by hand.
impl From<uuid::Uuid> for Uuid128 {
    fn from(u: uuid::Uuid) -> Self {
        Uuid128(*u.as_bytes())
    }
}

impl From<Uuid128> for uuid::Uuid {
    fn from(u: Uuid128) -> Self {
        uuid::Uuid::from_bytes(u.0)
    }
}

/// UUID assigned to the Client Characteristic Configuration Descriptor.
pub const CCCD_UUID: Uuid16 = Uuid16(0x2902);
/// Assigned grouping type for a primary service declaration.
pub const PRIMARY_SERVICE_UUID: Uuid16 = Uuid16(0x2800);
/// Assigned grouping type for a secondary service declaration.
pub const SECONDARY_SERVICE_UUID: Uuid16 = Uuid16(0x2801);
/// Assigned type for a characteristic declaration.
pub const CHARACTERISTIC_UUID: Uuid16 = Uuid16(0x2803);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_round_trips_through_128() {
        for n in [0u16, 1, 0x1800, 0x2902, 0xFFFF] {
            let wide: Uuid128 = Uuid16(n).into();
            assert_eq!(wide.try_shorten(), Some(Uuid16(n)));
        }
    }

    #[test]
    fn non_base_uuid_is_not_shortenable() {
        let random = Uuid128::from_bytes([
            0x6e, 0x40, 0x00, 0x01, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc,
            0xca, 0x9e,
        ]);
        assert_eq!(random.try_shorten(), None);
    }

    #[test]
    fn display_matches_canonical_form() {
        let u = Uuid128::from_bytes([
            0x00, 0x00, 0x18, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B,
            0x34, 0xFB,
        ]);
        assert_eq!(format!("{}", u), "00001800-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn interop_with_uuid_crate_round_trips() {
        let external = uuid::Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let ours: Uuid128 = external.into();
        let back: uuid::Uuid = ours.into();
        assert_eq!(external, back);
    }

    #[test]
    fn wire_encoding_is_little_endian() {
        let u: Uuid128 = Uuid16(0x1800).into();
        let bytes = u.encoded();
        // Base UUID's last byte (0xFB) is first on the wire.
        assert_eq!(bytes[0], 0xFB);
        assert_eq!(bytes[14], 0x00);
        assert_eq!(bytes[15], 0x18);
    }
}
