//! IR-construction errors.
//!
//! The parser guarantees a well-formed typed AST, so any error raised here
//! indicates a compiler bug rather than bad user input; the pipeline treats
//! these as fatal.

/// Internal invariant violations detected while building IR.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// An AST shape the builder cannot lower reached IR construction.
    #[error("internal error: {0}")]
    Internal(String),
}
