//! Little-endian primitive writers for the serialized form
//!
//! Sizes that are "small most of the time" (counts, string lengths, table
//! sizes) use a 7-bit continuation varint; instruction words and floats are
//! fixed-width little-endian.

#[inline]
pub fn write_byte(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

#[inline]
pub fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_f32(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_f64(out: &mut Vec<u8>, value: f64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write an unsigned integer as a little-endian base-128 varint.
///
/// Each byte carries 7 payload bits; the high bit marks continuation.
pub fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        out.push((value & 127) as u8 | (((value > 127) as u8) << 7));
        value >>= 7;

        if value == 0 {
            break;
        }
    }
}
