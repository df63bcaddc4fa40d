//! # Ferret VM Bytecode
//!
//! This crate defines the bytecode format for the Ferret register VM: the
//! instruction set, the 32-bit instruction word layout, constant pool tags,
//! import-chain id packing and the format version/capacity constants.
//!
//! ## Design Principles
//!
//! - **Register-based**: instructions address virtual registers, not a stack
//! - **Fixed-width**: every instruction is one 32-bit word plus a statically
//!   known number of auxiliary words
//! - **Self-describing**: serialized blobs carry a format version and a type
//!   encoding version so loaders can reject incompatible output

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod constant;
pub mod error;
pub mod opcode;
pub mod word;

pub use constant::{ConstantTag, decompose_import_id, import_id_1, import_id_2, import_id_3};
pub use error::{EncodeError, Result};
pub use opcode::{CaptureKind, Opcode};

/// Bytecode format version, written as the first byte of every blob.
///
/// A first byte of 0 is reserved for the compile-error escape form.
pub const BYTECODE_VERSION: u8 = 1;

/// Version of the optional type-info encoding.
pub const TYPE_VERSION: u8 = 1;

/// Maximum number of constants in one function's pool.
pub const MAX_CONSTANT_COUNT: u32 = 1 << 23;

/// Maximum number of child functions referenced by one function.
pub const MAX_CLOSURE_COUNT: u32 = 1 << 15;

/// Maximum branch distance representable even in the wide (E-field) form.
pub const MAX_JUMP_DISTANCE: i32 = 1 << 23;

/// Type tags for the optional per-function type-info block.
///
/// These are passthrough bytes as far as the assembler is concerned; the high
/// bit marks an optional type and values at `TAGGED_USERDATA_BASE` and above
/// refer to named userdata types registered with the builder.
pub mod bctype {
    /// No value
    pub const NIL: u8 = 0;
    /// Boolean
    pub const BOOLEAN: u8 = 1;
    /// 64-bit float
    pub const NUMBER: u8 = 2;
    /// String
    pub const STRING: u8 = 3;
    /// Table
    pub const TABLE: u8 = 4;
    /// Function
    pub const FUNCTION: u8 = 5;
    /// Coroutine/thread
    pub const THREAD: u8 = 6;
    /// Untyped userdata
    pub const USERDATA: u8 = 7;
    /// 4-component float vector
    pub const VECTOR: u8 = 8;
    /// Byte buffer
    pub const BUFFER: u8 = 9;
    /// Unknown/any
    pub const ANY: u8 = 15;

    /// High bit marking an optional (`T?`) type.
    pub const OPTIONAL_BIT: u8 = 1 << 7;

    /// First tag value reserved for named userdata types.
    pub const TAGGED_USERDATA_BASE: u8 = 64;
}
