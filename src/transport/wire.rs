//! Wire primitives for the binary control codec
//!
//! Tag/varint framing compatible with the protobuf wire format:
//! - tag = `field_number * 8 + wire_type`
//! - varints are little-endian base-128 groups
//! - strings, byte blobs, nested messages and packed scalars are
//!   length-delimited
//!
//! The [`Writer`] builds a frame; nested messages are written into a scratch
//! writer and spliced in behind their length prefix. The [`Reader`] walks a
//! borrowed buffer and knows how to skip every field it does not model.

use bytes::{BufMut, BytesMut};
use std::fmt;

/// Codec failures. Each one rejects a single frame; the channel stays up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The buffer ended in the middle of a field.
    #[error("MALFORMED_MESSAGE: {context} truncated at offset {offset}")]
    MalformedMessage {
        context: &'static str,
        offset: usize,
    },

    /// A wire type that cannot be skipped (groups, reserved values).
    #[error("UNSUPPORTED_WIRE_TYPE: wire type {wire_type} on field {field}")]
    UnsupportedWireType { field: u32, wire_type: u8 },
}

impl CodecError {
    /// Stable error code used in logs.
    pub fn code(&self) -> &'static str {
        match self {
            CodecError::MalformedMessage { .. } => "MALFORMED_MESSAGE",
            CodecError::UnsupportedWireType { .. } => "UNSUPPORTED_WIRE_TYPE",
        }
    }
}

/// Wire types carried in the low three bits of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
    /// Group markers and reserved values; never skippable.
    Unsupported(u8),
}

impl WireType {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => WireType::Varint,
            1 => WireType::Fixed64,
            2 => WireType::LengthDelimited,
            5 => WireType::Fixed32,
            other => WireType::Unsupported(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            WireType::Varint => 0,
            WireType::Fixed64 => 1,
            WireType::LengthDelimited => 2,
            WireType::Fixed32 => 5,
            WireType::Unsupported(bits) => bits,
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireType::Varint => write!(f, "varint"),
            WireType::Fixed64 => write!(f, "fixed64"),
            WireType::LengthDelimited => write!(f, "length-delimited"),
            WireType::Fixed32 => write!(f, "fixed32"),
            WireType::Unsupported(bits) => write!(f, "unsupported({})", bits),
        }
    }
}

/// Build a tag value from a field number and wire type.
pub fn make_tag(field: u32, wire_type: WireType) -> u32 {
    (field << 3) | u32::from(wire_type.bits())
}

/// Append-only frame builder.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn write_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    pub fn write_tag(&mut self, field: u32, wire_type: WireType) {
        self.write_varint(u64::from(make_tag(field, wire_type)));
    }

    /// `int64` field: negative values use the full ten-byte two's complement form.
    pub fn write_int64(&mut self, field: u32, value: i64) {
        self.write_tag(field, WireType::Varint);
        self.write_varint(value as u64);
    }

    /// `int32` field: sign-extended to 64 bits on the wire.
    pub fn write_int32(&mut self, field: u32, value: i32) {
        self.write_tag(field, WireType::Varint);
        self.write_varint(i64::from(value) as u64);
    }

    pub fn write_bool(&mut self, field: u32, value: bool) {
        self.write_tag(field, WireType::Varint);
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_bytes(&mut self, field: u32, value: &[u8]) {
        self.write_tag(field, WireType::LengthDelimited);
        self.write_varint(value.len() as u64);
        self.buf.put_slice(value);
    }

    /// Strings are UTF-8 on the wire; a Rust `&str` already is.
    pub fn write_string(&mut self, field: u32, value: &str) {
        self.write_bytes(field, value.as_bytes());
    }

    /// Encode a nested message into a scratch buffer, then splice it in
    /// behind its length prefix.
    pub fn write_message<F>(&mut self, field: u32, encode: F)
    where
        F: FnOnce(&mut Writer),
    {
        let mut nested = Writer::new();
        encode(&mut nested);
        self.write_bytes(field, &nested.buf);
    }

    /// Packed repeated `int32`: one length-delimited field of concatenated varints.
    pub fn write_packed_int32(&mut self, field: u32, values: &[i32]) {
        if values.is_empty() {
            return;
        }
        let mut packed = Writer::new();
        for value in values {
            packed.write_varint(i64::from(*value) as u64);
        }
        self.write_bytes(field, &packed.buf);
    }
}

/// A decoded field header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHeader {
    pub field: u32,
    pub wire_type: WireType,
}

/// Cursor over a borrowed frame.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn truncated(&self, context: &'static str) -> CodecError {
        CodecError::MalformedMessage {
            context,
            offset: self.pos,
        }
    }

    fn read_byte(&mut self, context: &'static str) -> Result<u8, CodecError> {
        let byte = *self.buf.get(self.pos).ok_or_else(|| self.truncated(context))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize, context: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| self.truncated(context))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read a varint of up to ten bytes. Bits past 64 are discarded.
    pub fn read_varint(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        for index in 0..10 {
            let byte = self.read_byte("varint")?;
            let shift = index * 7;
            if shift < 64 {
                value |= u64::from(byte & 0x7f) << shift;
            }
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        // Over-long varint: swallow continuation bytes like a lenient peer would.
        while self.read_byte("varint")? & 0x80 != 0 {}
        Ok(value)
    }

    /// Read the next tag, or `None` at the end of the buffer.
    ///
    /// Field number zero is never valid and terminates the message.
    pub fn read_header(&mut self) -> Result<Option<FieldHeader>, CodecError> {
        if self.is_at_end() {
            return Ok(None);
        }
        let tag = self.read_varint()? as u32;
        let field = tag >> 3;
        if field == 0 {
            self.pos = self.buf.len();
            return Ok(None);
        }
        Ok(Some(FieldHeader {
            field,
            wire_type: WireType::from_bits((tag & 7) as u8),
        }))
    }

    pub fn read_int64(&mut self) -> Result<i64, CodecError> {
        Ok(self.read_varint()? as i64)
    }

    pub fn read_int32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_varint()? as i32)
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_varint()? != 0)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| self.truncated("length prefix"))?;
        self.take(len, "length-delimited field")
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        Ok(decode_utf8_lossy(self.read_bytes()?))
    }

    /// Borrow a nested message as its own reader.
    pub fn read_nested(&mut self) -> Result<Reader<'a>, CodecError> {
        Ok(Reader::new(self.read_bytes()?))
    }

    /// Append packed (or a single unpacked) `int32` values.
    pub fn read_repeated_int32(
        &mut self,
        wire_type: WireType,
        out: &mut Vec<i32>,
    ) -> Result<(), CodecError> {
        match wire_type {
            WireType::LengthDelimited => {
                let mut packed = self.read_nested()?;
                while !packed.is_at_end() {
                    out.push(packed.read_int32()?);
                }
            }
            _ => out.push(self.read_int32()?),
        }
        Ok(())
    }

    /// Skip the value of a field this decoder does not model.
    pub fn skip(&mut self, header: FieldHeader) -> Result<(), CodecError> {
        match header.wire_type {
            WireType::Varint => {
                self.read_varint()?;
            }
            WireType::Fixed64 => {
                self.take(8, "fixed64 field")?;
            }
            WireType::LengthDelimited => {
                self.read_bytes()?;
            }
            WireType::Fixed32 => {
                self.take(4, "fixed32 field")?;
            }
            WireType::Unsupported(bits) => {
                return Err(CodecError::UnsupportedWireType {
                    field: header.field,
                    wire_type: bits,
                });
            }
        }
        Ok(())
    }
}

/// Decode UTF-8, substituting U+FFFD for every malformed sequence instead
/// of failing. Truncated, overlong, surrogate and out-of-range encodings
/// each produce one replacement character and resume at the next byte.
pub fn decode_utf8_lossy(bytes: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_owned();
    }

    let mut text = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let (decoded, consumed) = decode_one(&bytes[i..]);
        text.push(decoded.unwrap_or(char::REPLACEMENT_CHARACTER));
        i += consumed;
    }
    text
}

/// Decode one code point from the front of `bytes`.
///
/// Returns the char (or `None` for a malformed sequence) and how many
/// bytes to advance. Malformed input always advances exactly one byte.
fn decode_one(bytes: &[u8]) -> (Option<char>, usize) {
    let lead = bytes[0];
    let (len, min, initial) = match lead {
        0x00..=0x7f => return (Some(char::from(lead)), 1),
        b if b & 0xe0 == 0xc0 => (2, 0x80, u32::from(b & 0x1f)),
        b if b & 0xf0 == 0xe0 => (3, 0x800, u32::from(b & 0x0f)),
        b if b & 0xf8 == 0xf0 => (4, 0x1_0000, u32::from(b & 0x07)),
        _ => return (None, 1),
    };

    if bytes.len() < len {
        return (None, 1);
    }

    let mut code = initial;
    for &cont in &bytes[1..len] {
        if cont & 0xc0 != 0x80 {
            return (None, 1);
        }
        code = (code << 6) | u32::from(cont & 0x3f);
    }

    if code < min || code > 0x10_ffff {
        return (None, 1);
    }

    // char::from_u32 rejects the surrogate range.
    match char::from_u32(code) {
        Some(ch) => (Some(ch), len),
        None => (None, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_varint(value: u64) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_varint(value);
        w.into_vec()
    }

    #[test]
    fn varint_boundaries_have_expected_widths() {
        assert_eq!(encoded_varint(0).len(), 1);
        assert_eq!(encoded_varint(127).len(), 1);
        assert_eq!(encoded_varint(128).len(), 2);
        assert_eq!(encoded_varint((1 << 28) - 1).len(), 4);
        assert_eq!(encoded_varint(1 << 28).len(), 5);
        assert_eq!(encoded_varint(u64::MAX).len(), 10);
    }

    #[test]
    fn varint_straddling_32_bits_round_trips() {
        for value in [4_294_967_295u64, 4_294_967_296, 4_294_967_297, 1 << 35] {
            let bytes = encoded_varint(value);
            let mut r = Reader::new(&bytes);
            assert_eq!(r.read_varint().unwrap(), value);
            assert!(r.is_at_end());
        }
    }

    #[test]
    fn negative_int64_uses_ten_bytes() {
        let mut w = Writer::new();
        w.write_int64(1, -1);
        let bytes = w.into_vec();
        // one tag byte + ten varint bytes
        assert_eq!(bytes.len(), 11);
        let mut r = Reader::new(&bytes);
        r.read_header().unwrap().unwrap();
        assert_eq!(r.read_int64().unwrap(), -1);
    }

    #[test]
    fn tag_layout_matches_field_and_type() {
        assert_eq!(make_tag(1, WireType::LengthDelimited), 10);
        assert_eq!(make_tag(3, WireType::LengthDelimited), 26);
        assert_eq!(make_tag(4, WireType::Varint), 32);
    }

    #[test]
    fn astral_code_point_round_trips_as_surrogate_pair() {
        let mut w = Writer::new();
        w.write_string(1, "cam \u{1F600}");
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        r.read_header().unwrap().unwrap();
        let text = r.read_string().unwrap();
        assert_eq!(text, "cam \u{1F600}");

        let units: Vec<u16> = text.chars().last().unwrap().encode_utf16(&mut [0; 2]).to_vec();
        assert_eq!(units, vec![0xD83D, 0xDE00]);
    }

    #[test]
    fn truncated_multibyte_sequence_becomes_replacement() {
        // First three bytes of U+1F600.
        assert_eq!(decode_utf8_lossy(&[b'a', 0xF0, 0x9F, 0x98]), "a\u{FFFD}\u{FFFD}\u{FFFD}");
        assert_eq!(decode_utf8_lossy(&[0xE2, 0x82]), "\u{FFFD}\u{FFFD}");
    }

    #[test]
    fn overlong_and_surrogate_encodings_are_rejected() {
        // Overlong '/'.
        assert_eq!(decode_utf8_lossy(&[0xC0, 0xAF]), "\u{FFFD}\u{FFFD}");
        // Encoded surrogate U+D800.
        assert_eq!(decode_utf8_lossy(&[0xED, 0xA0, 0x80]), "\u{FFFD}\u{FFFD}\u{FFFD}");
        // Stray continuation byte between valid text.
        assert_eq!(decode_utf8_lossy(&[b'o', 0x80, b'k']), "o\u{FFFD}k");
    }

    #[test]
    fn skip_handles_every_skippable_type() {
        let bytes = [
            0x08, 0x96, 0x01, // field 1 varint
            0x11, 1, 2, 3, 4, 5, 6, 7, 8, // field 2 fixed64
            0x1a, 0x02, b'h', b'i', // field 3 length-delimited
            0x25, 1, 2, 3, 4, // field 4 fixed32
        ];
        let mut r = Reader::new(&bytes);
        while let Some(header) = r.read_header().unwrap() {
            r.skip(header).unwrap();
        }
        assert!(r.is_at_end());
    }

    #[test]
    fn group_wire_type_is_unsupported() {
        let bytes = [0x0b]; // field 1, wire type 3
        let mut r = Reader::new(&bytes);
        let header = r.read_header().unwrap().unwrap();
        let err = r.skip(header).unwrap_err();
        assert_eq!(err, CodecError::UnsupportedWireType { field: 1, wire_type: 3 });
        assert_eq!(err.code(), "UNSUPPORTED_WIRE_TYPE");
    }

    #[test]
    fn length_past_end_is_malformed() {
        let bytes = [0x0a, 0x05, b'a', b'b'];
        let mut r = Reader::new(&bytes);
        r.read_header().unwrap().unwrap();
        let err = r.read_bytes().unwrap_err();
        assert_eq!(err.code(), "MALFORMED_MESSAGE");
    }

    #[test]
    fn packed_and_unpacked_int32_both_decode() {
        let mut w = Writer::new();
        w.write_packed_int32(1, &[1, 3, 5]);
        w.write_int32(1, 6);
        let bytes = w.into_vec();

        let mut values = Vec::new();
        let mut r = Reader::new(&bytes);
        while let Some(header) = r.read_header().unwrap() {
            r.read_repeated_int32(header.wire_type, &mut values).unwrap();
        }
        assert_eq!(values, vec![1, 3, 5, 6]);
    }
}
