//! x86-64 instruction encoding, sections, relocations and the in-memory
//! loader of the cjit compiler.
//!
//! The [`asm::Assembler`] exposes one method per supported mnemonic and
//! serializes each instruction through an explicit encoding record
//! ([`enc::Encoding`]): prefixes, REX, opcode, ModR/M, SIB, displacement,
//! immediate. Code and data accumulate in two append-only sections; label
//! references within a section are patched by a two-pass fixup scheme, and
//! references across sections or to other symbols become relocations
//! resolved by [`asm::Assembler::finalize`], which maps the result into
//! executable memory.

#![warn(missing_docs)]
#![deny(unused_must_use)]

pub mod asm;
pub mod cc;
pub mod enc;
pub mod exec;
pub mod operand;
pub mod reg;

mod error;
mod label;
mod section;
mod symbol;

pub use error::X64Error;
pub use label::LabelId;
pub use section::SectionKind;
pub use symbol::{RelocKind, SymbolId, SymbolKind};

/// Result alias for encoder/loader operations.
pub type Result<T> = core::result::Result<T, X64Error>;
