//! Front-end diagnostics.
//!
//! There is no multi-error accumulation: the first error aborts the current
//! translation unit. Every variant carries the `file:line` position it was
//! raised at.

use core::fmt;

/// A rendered `file:line` position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Where {
    /// Source file name.
    pub file: String,
    /// 1-based line.
    pub line: u32,
}

impl fmt::Display for Where {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Front-end error variants, grouped by the phase that raised them.
#[derive(Debug, thiserror::Error)]
pub enum FrontError {
    /// Malformed literal, unterminated comment/string, invalid character.
    #[error("{0}: {1}")]
    Lex(Where, String),
    /// Unexpected token, expected punctuator.
    #[error("{0}: {1}")]
    Parse(Where, String),
    /// Redefinition, incompatible types, invalid operand.
    #[error("{0}: {1}")]
    Type(Where, String),
    /// Divide-by-zero in a constant context, non-constant where one is required.
    #[error("{0}: {1}")]
    ConstEval(Where, String),
}

impl FrontError {
    /// Position the error was raised at.
    pub fn position(&self) -> &Where {
        match self {
            Self::Lex(w, _) | Self::Parse(w, _) | Self::Type(w, _) | Self::ConstEval(w, _) => w,
        }
    }
}
