//! Constant pool tags and import-chain id packing

use serde::{Deserialize, Serialize};

/// Type tag of a constant pool entry.
///
/// The discriminant values are the serialized tag bytes; they are part of the
/// binary format and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConstantTag {
    /// nil
    Nil = 0,
    /// boolean payload: 1 byte
    Boolean = 1,
    /// number payload: little-endian f64
    Number = 2,
    /// import payload: packed import-chain id (fixed 32-bit)
    Import = 3,
    /// string payload: varint 1-based string table reference
    String = 4,
    /// table payload: varint key count then varint string-constant ids
    Table = 5,
    /// closure payload: varint function id
    Closure = 6,
    /// vector payload: four little-endian f32 components
    Vector = 7,
}

/// Pack a one-step import chain (`library`) into a 32-bit id.
///
/// Each step is a string-constant index below 1024; the top two bits carry
/// the chain length.
#[inline]
pub fn import_id_1(id0: u32) -> u32 {
    debug_assert!(id0 < 1024);

    (1 << 30) | (id0 << 20)
}

/// Pack a two-step import chain (`library.member`) into a 32-bit id.
#[inline]
pub fn import_id_2(id0: u32, id1: u32) -> u32 {
    debug_assert!(id0 | id1 < 1024);

    (2 << 30) | (id0 << 20) | (id1 << 10)
}

/// Pack a three-step import chain (`library.member.field`) into a 32-bit id.
#[inline]
pub fn import_id_3(id0: u32, id1: u32, id2: u32) -> u32 {
    debug_assert!(id0 | id1 | id2 < 1024);

    (3 << 30) | (id0 << 20) | (id1 << 10) | id2
}

/// Unpack an import-chain id into its length and up to three constant ids.
///
/// Absent steps are `None`.
pub fn decompose_import_id(ids: u32) -> (usize, [Option<u32>; 3]) {
    let count = (ids >> 30) as usize;

    let id0 = (count > 0).then(|| (ids >> 20) & 1023);
    let id1 = (count > 1).then(|| (ids >> 10) & 1023);
    let id2 = (count > 2).then(|| ids & 1023);

    (count, [id0, id1, id2])
}
