//! Compiler-wide error type.

use cjit_front::FrontError;
use cjit_ir::IrError;
use cjit_x64::X64Error;

/// Any failure across the pipeline.
///
/// Front-end errors are source-located and recoverable by fixing the input;
/// IR, allocator and encoder errors indicate compiler bugs; loader errors
/// surface resource and resolution problems to the host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Lex, parse, type or constant-evaluation error.
    #[error(transparent)]
    Front(#[from] FrontError),
    /// IR construction invariant violation.
    #[error(transparent)]
    Ir(#[from] IrError),
    /// Encoder or loader error.
    #[error(transparent)]
    X64(#[from] X64Error),
    /// Lowering / allocation invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error names a problem in the input program (as opposed
    /// to a compiler bug or a loader failure).
    pub fn is_source_error(&self) -> bool {
        matches!(self, Self::Front(_))
    }
}
