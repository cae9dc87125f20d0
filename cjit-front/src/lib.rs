//! C front end of the cjit compiler.
//!
//! Turns preprocessed C source bytes into a [`obj::TranslationUnit`]: a list
//! of typed global objects whose function bodies are fully typed ASTs. The
//! pipeline inside this crate is lexing ([`lexer`]), then recursive-descent
//! parsing with scope-aware semantic analysis ([`parser`]). All identifiers
//! are interned ([`intern`]) and all C types live in an id-keyed table
//! ([`ctype`]) owned by the [`session::Session`].

#![warn(missing_docs)]
#![deny(unused_must_use)]

pub mod ast;
pub mod ctype;
pub mod error;
pub mod intern;
pub mod lexer;
pub mod obj;
pub mod parser;
pub mod session;
pub mod token;

mod loc;

pub use error::FrontError;
pub use loc::SourceLoc;

/// Result alias used throughout the front end.
pub type Result<T> = core::result::Result<T, FrontError>;
