//! The phase-ordered compilation pipeline.

use tracing::debug;

use cjit_front::session::Session;
use cjit_front::{lexer, parser};
use cjit_ir::module::Module;
use cjit_x64::asm::{Assembler, LoadedModule};

use crate::{emit, lower, regalloc, Result};

/// Owns every phase of a compilation. One `Compiler` handles one
/// translation unit at a time; all intermediate state lives in the
/// [`Session`] and dies with it.
#[derive(Debug, Default)]
pub struct Compiler {
    /// Interner, type table and id counters shared by every phase.
    pub sess: Session,
}

impl Compiler {
    /// Fresh compiler.
    pub fn new() -> Self {
        Self {
            sess: Session::new(),
        }
    }

    /// Lex and parse only: source bytes → typed AST translation unit,
    /// exposing the declared global objects with their types and
    /// definition status.
    pub fn parse_unit(
        &mut self,
        source: &[u8],
        filename: &str,
    ) -> Result<cjit_front::obj::TranslationUnit> {
        let tokens = lexer::tokenize(&mut self.sess, filename, source)?;
        Ok(parser::parse(&mut self.sess, tokens)?)
    }

    /// Front end: source bytes → typed SSA IR module.
    ///
    /// Errors carry a `file:line` position and abort the unit at the first
    /// problem; there is no recovery.
    pub fn compile(&mut self, source: &[u8], filename: &str) -> Result<Module> {
        let unit = self.parse_unit(source, filename)?;
        let module = cjit_ir::build::build(&self.sess, &unit)?;
        debug!(file = filename, "compiled to IR");
        Ok(module)
    }

    /// Back end: IR module → encoded sections with pending relocations.
    pub fn emit(&mut self, module: &Module) -> Result<CodeBuffer> {
        let mut mir = lower::lower_module(&self.sess, module)?;
        for func in &mut mir.funcs {
            regalloc::allocate(func)?;
        }
        let asm = emit::emit_module(&self.sess, module, &mir)?;
        Ok(CodeBuffer { asm })
    }

    /// Whole pipeline: compile, emit, finalize.
    pub fn jit(
        &mut self,
        source: &[u8],
        filename: &str,
        resolve_external: impl FnMut(&str) -> Option<*const u8>,
    ) -> Result<LoadedModule> {
        let module = self.compile(source, filename)?;
        let buffer = self.emit(&module)?;
        buffer.finalize(resolve_external)
    }
}

/// Encoded `.text`/`.data` with unresolved relocations: the value between
/// [`Compiler::emit`] and finalization.
#[derive(Debug)]
pub struct CodeBuffer {
    asm: Assembler,
}

impl CodeBuffer {
    /// The executable section bytes.
    pub fn text(&self) -> &[u8] {
        self.asm.text()
    }

    /// The initialized-data section bytes.
    pub fn data(&self) -> &[u8] {
        self.asm.data()
    }

    /// Section-relative offset of a defined symbol.
    pub fn symbol_offset(&self, name: &str) -> Option<u32> {
        self.asm.symbol_offset(name)
    }

    /// Resolve relocations, map pages, flip them executable.
    pub fn finalize(
        self,
        resolve_external: impl FnMut(&str) -> Option<*const u8>,
    ) -> Result<LoadedModule> {
        Ok(self.asm.finalize(resolve_external)?)
    }
}
