//! Constant pool values and their dedup keys

use ferret_bytecode::ConstantTag;

/// A constant pool entry as held by the builder.
///
/// String, import, table and closure constants store references (string table
/// id, packed import id, shape list index, function id) rather than owned
/// payloads; the referenced data lives in the builder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    /// nil
    Nil,
    /// boolean literal
    Boolean(bool),
    /// 64-bit float literal
    Number(f64),
    /// 4-component float vector literal
    Vector([f32; 4]),
    /// 1-based string table reference
    String(u32),
    /// packed import-chain id
    Import(u32),
    /// index into the per-function table-shape list
    Table(u32),
    /// function id of a pre-built closure
    Closure(u32),
}

impl Constant {
    /// Serialized type tag of this constant
    pub fn tag(&self) -> ConstantTag {
        match self {
            Self::Nil => ConstantTag::Nil,
            Self::Boolean(_) => ConstantTag::Boolean,
            Self::Number(_) => ConstantTag::Number,
            Self::Vector(_) => ConstantTag::Vector,
            Self::String(_) => ConstantTag::String,
            Self::Import(_) => ConstantTag::Import,
            Self::Table(_) => ConstantTag::Table,
            Self::Closure(_) => ConstantTag::Closure,
        }
    }
}

/// Dedup key for a constant: type tag plus raw value bits.
///
/// Numbers and vectors are keyed on their bit patterns, so `0.0` and `-0.0`
/// are distinct keys and NaN payloads dedup exactly. `extra` carries the
/// upper two vector components and is zero for every other tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstantKey {
    pub(crate) tag: ConstantTag,
    pub(crate) value: u64,
    pub(crate) extra: u64,
}

impl ConstantKey {
    pub(crate) fn new(tag: ConstantTag, value: u64) -> Self {
        Self { tag, value, extra: 0 }
    }

    pub(crate) fn number(value: f64) -> Self {
        Self::new(ConstantTag::Number, value.to_bits())
    }

    pub(crate) fn vector(x: f32, y: f32, z: f32, w: f32) -> Self {
        let value = x.to_bits() as u64 | ((y.to_bits() as u64) << 32);
        let extra = z.to_bits() as u64 | ((w.to_bits() as u64) << 32);

        Self { tag: ConstantTag::Vector, value, extra }
    }
}

/// Ordered list of string-constant ids describing the fixed keys of a table
/// constructor.
///
/// Two shapes are equal iff their key sequences are identical, order
/// included; this captures shape as used for constructor-time pre-sizing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableShape {
    /// String-constant ids of the declared keys, in declaration order
    pub keys: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_zero_keys_differ() {
        assert_ne!(ConstantKey::number(0.0), ConstantKey::number(-0.0));
        assert_eq!(ConstantKey::number(1.5), ConstantKey::number(1.5));
    }

    #[test]
    fn test_shape_order_sensitive() {
        let ab = TableShape { keys: vec![1, 2] };
        let ba = TableShape { keys: vec![2, 1] };
        assert_ne!(ab, ba);
        assert_eq!(ab, TableShape { keys: vec![1, 2] });
    }
}
