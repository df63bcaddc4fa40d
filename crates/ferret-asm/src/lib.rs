//! # Ferret VM Assembler
//!
//! Single-pass assembler and serializer for Ferret bytecode. A code
//! generator drives [`BytecodeBuilder`] one function at a time: emit
//! instruction words, register constants and debug info, patch branch
//! offsets through labels, then close the function. Closing folds jump
//! chains, rewrites over-long branches through `JUMPX` trampolines,
//! validates the stream in debug builds and serializes the function record;
//! [`BytecodeBuilder::finalize`] assembles the versioned blob.
//!
//! ## Design Principles
//!
//! - **Append-only**: instructions are emitted forward; the only rewrites
//!   are branch-offset patches and the trampoline expansion at close
//! - **Dense ids**: constants, child functions and interned strings all get
//!   dense indices with transparent dedup
//! - **Fail loud**: capacity and encodability limits are `Result`s; misuse
//!   of the builder protocol is a panic

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod builder;
pub mod constant;
mod dump;
pub mod lineinfo;
#[cfg(debug_assertions)]
mod validate;
mod writer;

pub use builder::{BytecodeBuilder, BytecodeEncoder, DumpFlags};
pub use constant::{Constant, TableShape};
