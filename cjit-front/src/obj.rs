//! Declared objects: globals, functions, locals, parameters.

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::ast::Stmt;
use crate::ctype::TypeId;
use crate::intern::Sym;
use crate::session::Label;

/// Stable id of an object in a [`TranslationUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId(u32);

impl ObjId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("object table overflow"))
    }

    /// Raw table index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Storage and liveness flags of an object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjFlags: u16 {
        /// Local variable or parameter.
        const LOCAL = 1 << 0;
        /// Function.
        const FUNCTION = 1 << 1;
        /// Has a definition (body or initializer), not just a declaration.
        const DEFINITION = 1 << 2;
        /// Internal linkage.
        const STATIC = 1 << 3;
        /// Tentative definition awaiting a possible full one.
        const TENTATIVE = 1 << 4;
        /// `_Thread_local`.
        const TLS = 1 << 5;
        /// `inline`.
        const INLINE = 1 << 6;
        /// Reached from a root during the reachability pass.
        const LIVE = 1 << 7;
        /// Non-static, non-inline definition: a reachability root.
        const ROOT = 1 << 8;
    }
}

/// A relocation inside a global initializer image: the 8 bytes at `offset`
/// hold the address of the named global plus `addend`.
#[derive(Debug, Clone)]
pub struct InitReloc {
    /// Byte offset within the initializer image.
    pub offset: u32,
    /// Referenced global's name.
    pub name: Sym,
    /// Constant added to the referenced address.
    pub addend: i64,
}

/// A named declaration: global variable, function, local or parameter.
#[derive(Debug)]
pub struct Obj {
    /// Name; compiler-generated for anonymous temporaries.
    pub name: Sym,
    /// Declared type.
    pub ty: TypeId,
    /// Alignment in bytes.
    pub align: u32,
    /// Flags.
    pub flags: ObjFlags,
    /// Flat byte image for initialized globals.
    pub init_data: Option<Vec<u8>>,
    /// Pointer fixups into `init_data`.
    pub relocs: Vec<InitReloc>,
    /// Parameter objects, in declaration order (functions).
    pub params: Vec<ObjId>,
    /// Function body; `None` for declarations.
    pub body: Option<Vec<Stmt>>,
    /// Every local and parameter of the function.
    pub locals: Vec<ObjId>,
    /// Goto labels declared in the body, by name.
    pub goto_labels: HashMap<Sym, Label>,
    /// Names of functions and globals this function references, for the
    /// reachability pass.
    pub refs: Vec<Sym>,
}

impl Obj {
    /// Fresh object with empty bodies and no flags beyond `flags`.
    pub fn new(name: Sym, ty: TypeId, align: u32, flags: ObjFlags) -> Self {
        Self {
            name,
            ty,
            align,
            flags,
            init_data: None,
            relocs: Vec::new(),
            params: Vec::new(),
            body: None,
            locals: Vec::new(),
            goto_labels: HashMap::new(),
            refs: Vec::new(),
        }
    }

    /// Whether this object is a function.
    pub fn is_function(&self) -> bool {
        self.flags.contains(ObjFlags::FUNCTION)
    }

    /// Whether this object has a definition.
    pub fn is_definition(&self) -> bool {
        self.flags.contains(ObjFlags::DEFINITION)
    }

    /// Whether the reachability pass kept this object.
    pub fn is_live(&self) -> bool {
        self.flags.contains(ObjFlags::LIVE)
    }
}

/// Parse result: every object of the unit plus the ordered global list.
#[derive(Debug, Default)]
pub struct TranslationUnit {
    objs: Vec<Obj>,
    globals: Vec<ObjId>,
}

impl TranslationUnit {
    /// Empty unit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object to the arena without listing it as a global.
    pub fn alloc(&mut self, obj: Obj) -> ObjId {
        let id = ObjId::new(self.objs.len());
        self.objs.push(obj);
        id
    }

    /// Add an object and append it to the global list.
    pub fn alloc_global(&mut self, obj: Obj) -> ObjId {
        let id = self.alloc(obj);
        self.globals.push(id);
        id
    }

    /// Object by id.
    pub fn get(&self, id: ObjId) -> &Obj {
        &self.objs[id.index()]
    }

    /// Mutable object access.
    pub fn get_mut(&mut self, id: ObjId) -> &mut Obj {
        &mut self.objs[id.index()]
    }

    /// Ids of the globals in declaration order.
    pub fn globals(&self) -> &[ObjId] {
        &self.globals
    }

    /// Iterate the globals in declaration order.
    pub fn iter_globals(&self) -> impl Iterator<Item = (ObjId, &Obj)> {
        self.globals.iter().map(move |&id| (id, self.get(id)))
    }
}
