//! Typed SSA intermediate representation of the cjit compiler.
//!
//! A [`module::Module`] holds global-variable definitions and functions
//! whose bodies are basic-block graphs of typed instructions. User
//! variables are routed through `alloca` slots rather than phi webs; a
//! later `mem2reg`-style pass could promote them, but none is needed for
//! correctness. The [`build`] module walks the typed AST produced by
//! `cjit-front` and emits the IR.

#![warn(missing_docs)]
#![deny(unused_must_use)]

pub mod build;
pub mod inst;
pub mod module;
pub mod ty;

mod error;

pub use error::IrError;

/// Result alias for IR construction.
pub type Result<T> = core::result::Result<T, IrError>;
