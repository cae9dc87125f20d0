//! Encoder and loader errors.

/// Errors raised while encoding instructions or loading the module.
#[derive(Debug, thiserror::Error)]
pub enum X64Error {
    /// Operand combination has no x86-64 encoding.
    #[error("unencodable operand combination: {0}")]
    Encoding(String),
    /// A referenced symbol was neither defined nor resolvable.
    #[error("unresolved external symbol '{0}'")]
    UnresolvedSymbol(String),
    /// A 32-bit relative relocation target is out of range.
    #[error("relocation out of 32-bit range for symbol '{0}'")]
    RelocationOutOfRange(String),
    /// Executable-page allocation or protection failed.
    #[error("executable memory error: {0}")]
    Memory(String),
    /// Internal bookkeeping violation; indicates a compiler bug.
    #[error("internal encoder error: {0}")]
    Internal(String),
}
