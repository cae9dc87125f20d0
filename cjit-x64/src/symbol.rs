//! Symbols and relocations.

use crate::label::LabelId;

/// Id of a symbol within an [`crate::asm::Assembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub(crate) u32);

/// What a symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// A global variable in `.data`.
    GlobalVar,
    /// A function in `.text`.
    Function,
}

/// Relocation kinds.
///
/// `Rel32(k)` records that `k` bytes of instruction follow the 32-bit
/// displacement field, so the patch value is
/// `target − (patch_site + 4 + k)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Absolute 64-bit address.
    Addr64,
    /// PC-relative 32-bit with an instruction tail of 0..=5 bytes.
    Rel32(u8),
}

/// A pending patch inside a symbol's bytes, referencing another symbol by
/// name.
#[derive(Debug, Clone)]
pub(crate) struct Relocation {
    pub kind: RelocKind,
    /// Offset of the patch site, relative to the owning symbol's start.
    pub offset: u32,
    /// Referenced symbol name.
    pub target: String,
}

/// A named module-level entity and its pending relocations.
#[derive(Debug)]
pub(crate) struct SymbolData {
    pub kind: SymbolKind,
    pub name: String,
    pub label: LabelId,
    pub relocs: Vec<Relocation>,
}
