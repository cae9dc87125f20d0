//! Per-compilation state shared by every front-end phase.

use crate::ctype::TypeTable;
use crate::error::Where;
use crate::intern::{Interner, Sym};
use crate::SourceLoc;

/// Compile-time control-flow label, unique within a translation unit.
///
/// The parser allocates one for every branch target it creates (then/else
/// joins, loop heads, break/continue targets, cases, user labels); the IR
/// builder maps each to a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Owns the interner, the type table and the id counters every phase draws
/// from. Created once per compilation and threaded through lexer, parser and
/// the downstream IR builder.
#[derive(Debug)]
pub struct Session {
    /// Identifier / string table.
    pub interner: Interner,
    /// All C types built during this compilation.
    pub types: TypeTable,
    next_label: u32,
    next_anon: u32,
}

impl Session {
    /// Fresh session with the primitive types pre-seeded.
    pub fn new() -> Self {
        Self {
            interner: Interner::new(),
            types: TypeTable::new(),
            next_label: 0,
            next_anon: 0,
        }
    }

    /// Allocate a fresh control-flow label.
    pub fn new_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    /// Intern a fresh compiler-generated name, e.g. for string literals and
    /// static locals (`.L.anon.7`).
    pub fn anon_name(&mut self, prefix: &str) -> Sym {
        let n = self.next_anon;
        self.next_anon += 1;
        let name = format!(".L.{prefix}.{n}");
        self.interner.intern(&name)
    }

    /// Render a location for a diagnostic.
    pub fn whereis(&self, loc: SourceLoc) -> Where {
        Where {
            file: self.interner.resolve(loc.file).to_owned(),
            line: loc.line,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
