//! Encoding errors

use thiserror::Error;

/// Errors surfaced while assembling bytecode.
///
/// All of these mean "this compilation unit cannot produce valid bytecode";
/// a front end should report them as the function being too complex to
/// compile. There are no retry semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Constant pool grew past its dense-index limit
    #[error("Too many constants (max {})", crate::MAX_CONSTANT_COUNT)]
    TooManyConstants,

    /// Child-function table grew past its dense-index limit
    #[error("Too many child functions (max {})", crate::MAX_CLOSURE_COUNT)]
    TooManyChildFunctions,

    /// Branch distance exceeds even the wide-jump encoding
    #[error("Jump distance {0} exceeds the maximum encodable distance")]
    JumpTooFar(i32),

    /// Skip count does not fit the unsigned 8-bit skip field
    #[error("Skip distance {0} does not fit in 8 bits")]
    SkipTooFar(i32),
}

/// Result type for bytecode assembly
pub type Result<T> = std::result::Result<T, EncodeError>;
