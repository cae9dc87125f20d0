//! Recursive-descent parser and semantic analyzer.
//!
//! Consumes the token stream and produces a [`TranslationUnit`]: typed
//! global objects whose function bodies are fully typed ASTs. Semantic
//! analysis is interleaved with parsing: every expression node receives its
//! type as it is built, implicit conversions are materialized as cast nodes,
//! and goto/break/continue targets are bound to labels before a function
//! body is handed over.

mod decl;
mod eval;
mod expr;
mod init;
mod stmt;

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::ast::{CaseArm, Stmt, StmtKind};
use crate::ctype::{TypeId, TypeKind};
use crate::error::FrontError;
use crate::intern::Sym;
use crate::obj::{Obj, ObjFlags, ObjId, TranslationUnit};
use crate::session::{Label, Session};
use crate::token::{Token, TokenKind};
use crate::{Result, SourceLoc};

pub use init::Initializer;

/// Parse a token stream into a translation unit.
pub fn parse(sess: &mut Session, tokens: Vec<Token>) -> Result<TranslationUnit> {
    let mut parser = Parser::new(sess, tokens);
    parser.translation_unit()?;
    let mut unit = parser.finish();
    mark_live(&mut unit);
    drop_superseded_tentatives(&mut unit);
    Ok(unit)
}

/// What an ordinary identifier resolves to in some scope.
#[derive(Debug, Clone, Copy)]
pub(crate) enum VarScopeEntry {
    /// A variable or function object.
    Var(ObjId),
    /// A typedef name.
    Typedef(TypeId),
    /// An enumerator constant.
    EnumConst {
        /// The enum type.
        ty: TypeId,
        /// Constant value.
        value: i64,
    },
}

/// One lexical scope: ordinary identifiers and struct/union/enum tags.
#[derive(Debug, Default)]
struct Scope {
    vars: HashMap<Sym, VarScopeEntry>,
    tags: HashMap<Sym, TypeId>,
}

/// Attributes accumulated from declaration specifiers.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct VarAttr {
    pub is_typedef: bool,
    pub is_static: bool,
    pub is_extern: bool,
    pub is_inline: bool,
    pub is_tls: bool,
    pub align: Option<u32>,
}

/// Per-switch state collected while parsing the body.
#[derive(Debug)]
struct SwitchFrame {
    cases: Vec<CaseArm>,
    default_label: Option<Label>,
    cond_ty: TypeId,
}

pub(crate) struct Parser<'s> {
    pub(crate) sess: &'s mut Session,
    toks: Vec<Token>,
    pos: usize,
    pub(crate) unit: TranslationUnit,
    scopes: Vec<Scope>,

    // Current-function state.
    cur_fn: Option<ObjId>,
    cur_fn_ret: Option<TypeId>,
    locals: Vec<ObjId>,
    fn_refs: Vec<Sym>,
    goto_labels: HashMap<Sym, Label>,
    defined_labels: HashSet<Sym>,
    used_gotos: Vec<(Sym, SourceLoc)>,
    break_stack: Vec<Label>,
    continue_stack: Vec<Label>,
    switch_stack: Vec<SwitchFrame>,

    // Parameter names captured by the most recent function declarator.
    pub(crate) last_param_names: Vec<Option<Sym>>,
}

impl<'s> Parser<'s> {
    fn new(sess: &'s mut Session, toks: Vec<Token>) -> Self {
        Self {
            sess,
            toks,
            pos: 0,
            unit: TranslationUnit::new(),
            scopes: vec![Scope::default()],
            cur_fn: None,
            cur_fn_ret: None,
            locals: Vec::new(),
            fn_refs: Vec::new(),
            goto_labels: HashMap::new(),
            defined_labels: HashSet::new(),
            used_gotos: Vec::new(),
            break_stack: Vec::new(),
            continue_stack: Vec::new(),
            switch_stack: Vec::new(),
            last_param_names: Vec::new(),
        }
    }

    fn finish(self) -> TranslationUnit {
        self.unit
    }

    // ----- token cursor ------------------------------------------------

    pub(crate) fn tok(&self) -> &Token {
        &self.toks[self.pos]
    }

    pub(crate) fn kind(&self) -> TokenKind {
        self.tok().kind
    }

    pub(crate) fn loc(&self) -> SourceLoc {
        self.tok().loc
    }

    pub(crate) fn peek_kind(&self, ahead: usize) -> TokenKind {
        self.toks
            .get(self.pos + ahead)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    pub(crate) fn advance(&mut self) -> Token {
        let tok = self.toks[self.pos].clone();
        if !tok.is_eof() {
            self.pos += 1;
        }
        tok
    }

    pub(crate) fn is(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    pub(crate) fn eat(&mut self, kind: TokenKind) -> bool {
        if self.is(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token> {
        if self.is(kind) {
            Ok(self.advance())
        } else {
            let text = self.sess.interner.resolve(self.tok().text).to_owned();
            Err(self.parse_err(format!("expected {what}, found '{text}'")))
        }
    }

    pub(crate) fn checkpoint(&self) -> usize {
        self.pos
    }

    pub(crate) fn rewind(&mut self, checkpoint: usize) {
        self.pos = checkpoint;
    }

    // ----- diagnostics -------------------------------------------------

    pub(crate) fn parse_err(&self, msg: impl Into<String>) -> FrontError {
        FrontError::Parse(self.sess.whereis(self.loc()), msg.into())
    }

    pub(crate) fn type_err(&self, loc: SourceLoc, msg: impl Into<String>) -> FrontError {
        FrontError::Type(self.sess.whereis(loc), msg.into())
    }

    pub(crate) fn const_err(&self, loc: SourceLoc, msg: impl Into<String>) -> FrontError {
        FrontError::ConstEval(self.sess.whereis(loc), msg.into())
    }

    // ----- scopes ------------------------------------------------------

    pub(crate) fn enter_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub(crate) fn leave_scope(&mut self) {
        self.scopes.pop();
    }

    fn at_global_scope(&self) -> bool {
        self.scopes.len() == 1
    }

    pub(crate) fn push_var_scope(&mut self, name: Sym, entry: VarScopeEntry) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .vars
            .insert(name, entry);
    }

    pub(crate) fn push_tag_scope(&mut self, name: Sym, ty: TypeId) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .tags
            .insert(name, ty);
    }

    pub(crate) fn find_var(&self, name: Sym) -> Option<VarScopeEntry> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.vars.get(&name).copied())
    }

    fn find_var_in_global_scope(&self, name: Sym) -> Option<VarScopeEntry> {
        self.scopes[0].vars.get(&name).copied()
    }

    pub(crate) fn find_tag(&self, name: Sym) -> Option<TypeId> {
        self.scopes.iter().rev().find_map(|s| s.tags.get(&name).copied())
    }

    pub(crate) fn find_tag_in_current_scope(&self, name: Sym) -> Option<TypeId> {
        self.scopes
            .last()
            .expect("scope stack is never empty")
            .tags
            .get(&name)
            .copied()
    }

    /// Whether `name` is a typedef name in scope (drives declaration vs
    /// statement disambiguation).
    pub(crate) fn is_typedef_name(&self, name: Sym) -> bool {
        matches!(self.find_var(name), Some(VarScopeEntry::Typedef(_)))
    }

    // ----- object creation ---------------------------------------------

    pub(crate) fn new_lvar(&mut self, name: Sym, ty: TypeId) -> ObjId {
        let align = self.sess.types.align_of(ty);
        let obj = Obj::new(name, ty, align, ObjFlags::LOCAL);
        let id = self.unit.alloc(obj);
        self.locals.push(id);
        self.push_var_scope(name, VarScopeEntry::Var(id));
        id
    }

    pub(crate) fn new_gvar(&mut self, name: Sym, ty: TypeId, flags: ObjFlags) -> ObjId {
        let align = self.sess.types.align_of(ty);
        let obj = Obj::new(name, ty, align, flags);
        let id = self.unit.alloc_global(obj);
        self.push_var_scope(name, VarScopeEntry::Var(id));
        id
    }

    /// Anonymous global holding literal data (string literals, float pool).
    pub(crate) fn new_anon_gvar(&mut self, ty: TypeId, data: Vec<u8>) -> ObjId {
        let name = self.sess.anon_name("str");
        let align = self.sess.types.align_of(ty);
        let mut obj = Obj::new(
            name,
            ty,
            align,
            ObjFlags::STATIC | ObjFlags::DEFINITION,
        );
        obj.init_data = Some(data);
        self.unit.alloc_global(obj)
    }

    pub(crate) fn record_fn_ref(&mut self, name: Sym) {
        if self.cur_fn.is_some() {
            self.fn_refs.push(name);
        }
    }

    // ----- top level ---------------------------------------------------

    fn translation_unit(&mut self) -> Result<()> {
        while !self.tok().is_eof() {
            let mut attr = VarAttr::default();
            let basety = self.declspec(Some(&mut attr))?;

            if attr.is_typedef {
                self.parse_typedef(basety)?;
                continue;
            }

            if self.is_function_decl() {
                self.function(basety, attr)?;
            } else {
                self.global_variable(basety, attr)?;
            }
        }
        Ok(())
    }

    /// Lookahead: does a declarator starting here name a function?
    fn is_function_decl(&mut self) -> bool {
        if self.is(TokenKind::Semicolon) {
            return false;
        }
        let cp = self.checkpoint();
        let is_func = self
            .declarator_peek()
            .map(|ty| self.sess.types.kind(ty) == TypeKind::Func)
            .unwrap_or(false);
        self.rewind(cp);
        is_func
    }

    fn function(&mut self, basety: TypeId, attr: VarAttr) -> Result<()> {
        let loc = self.loc();
        let (ty, name) = self.declarator(basety)?;
        let name = name.ok_or_else(|| self.parse_err("function name omitted"))?;
        let param_names = std::mem::take(&mut self.last_param_names);

        // Redeclaration checks against an earlier global of the same name.
        let existing = match self.find_var_in_global_scope(name) {
            Some(VarScopeEntry::Var(id)) => {
                let prev = self.unit.get(id);
                if !prev.is_function() {
                    return Err(self.type_err(
                        loc,
                        format!("redeclared as a function: '{}'", self.sess.interner.resolve(name)),
                    ));
                }
                if !self.sess.types.is_compatible(prev.ty, ty) {
                    return Err(self.type_err(
                        loc,
                        format!(
                            "conflicting types for '{}'",
                            self.sess.interner.resolve(name)
                        ),
                    ));
                }
                let prev_static = prev.flags.contains(ObjFlags::STATIC);
                if prev_static != attr.is_static && !attr.is_static {
                    // static after non-static (or vice versa) is a linkage clash.
                    if prev_static {
                        return Err(self.type_err(
                            loc,
                            format!(
                                "linkage mismatch for '{}'",
                                self.sess.interner.resolve(name)
                            ),
                        ));
                    }
                }
                Some(id)
            }
            Some(_) => {
                return Err(self.type_err(
                    loc,
                    format!("redefined as a function: '{}'", self.sess.interner.resolve(name)),
                ));
            }
            None => None,
        };

        let mut flags = ObjFlags::FUNCTION;
        if attr.is_static {
            flags |= ObjFlags::STATIC;
        }
        if attr.is_inline {
            flags |= ObjFlags::INLINE;
        }

        let fn_id = match existing {
            Some(id) => {
                self.unit.get_mut(id).flags |= flags;
                id
            }
            None => self.new_gvar(name, ty, flags),
        };

        if self.eat(TokenKind::Semicolon) {
            return Ok(());
        }

        // Definition.
        if self.unit.get(fn_id).is_definition() {
            return Err(self.type_err(
                loc,
                format!("redefinition of '{}'", self.sess.interner.resolve(name)),
            ));
        }
        {
            let obj = self.unit.get_mut(fn_id);
            obj.flags |= ObjFlags::DEFINITION;
            obj.ty = ty;
            if !(attr.is_static && attr.is_inline) {
                obj.flags |= ObjFlags::ROOT;
            }
        }

        self.cur_fn = Some(fn_id);
        self.cur_fn_ret = self.sess.types.get(ty).ret;
        self.locals.clear();
        self.fn_refs.clear();
        self.goto_labels.clear();
        self.defined_labels.clear();
        self.used_gotos.clear();

        self.enter_scope();

        // Parameters become locals of the outermost function scope.
        let param_types = self.sess.types.get(ty).params.clone();
        let mut params = Vec::with_capacity(param_types.len());
        for (i, &pty) in param_types.iter().enumerate() {
            let pname = param_names.get(i).copied().flatten().unwrap_or_else(|| {
                self.sess.anon_name("param")
            });
            params.push(self.new_lvar(pname, pty));
        }
        self.unit.get_mut(fn_id).params = params;

        // `__func__` is a static char array holding the function name.
        let fname = self.sess.interner.resolve(name).to_owned();
        let mut bytes = fname.into_bytes();
        bytes.push(0);
        let str_ty = self
            .sess
            .types
            .array_of(crate::ctype::TypeTable::CHAR, bytes.len() as i32);
        let func_gvar = self.new_anon_gvar(str_ty, bytes);
        let func_sym = self.sess.interner.intern("__func__");
        self.push_var_scope(func_sym, VarScopeEntry::Var(func_gvar));

        let body_tok = self.expect(TokenKind::LBrace, "'{'")?;
        let body = self.compound_stmt_tail(body_tok.loc)?;
        self.leave_scope();

        // Goto resolution: every used label must have been defined.
        for (sym, loc) in std::mem::take(&mut self.used_gotos) {
            if !self.defined_labels.contains(&sym) {
                return Err(self.type_err(
                    loc,
                    format!("use of undeclared label '{}'", self.sess.interner.resolve(sym)),
                ));
            }
        }

        let locals = std::mem::take(&mut self.locals);
        let refs = std::mem::take(&mut self.fn_refs);
        let labels = std::mem::take(&mut self.goto_labels);
        let obj = self.unit.get_mut(fn_id);
        obj.body = Some(match body {
            Stmt {
                kind: StmtKind::Block(stmts),
                ..
            } => stmts,
            other => vec![other],
        });
        obj.locals = locals;
        obj.refs = refs;
        obj.goto_labels = labels;

        self.cur_fn = None;
        self.cur_fn_ret = None;
        debug!(name = self.sess.interner.resolve(name), "parsed function");
        Ok(())
    }

    fn global_variable(&mut self, basety: TypeId, attr: VarAttr) -> Result<()> {
        let mut first = true;
        while !self.eat(TokenKind::Semicolon) {
            if !first {
                self.expect(TokenKind::Comma, "','")?;
            }
            first = false;

            let loc = self.loc();
            let (ty, name) = self.declarator(basety)?;
            let name = name.ok_or_else(|| self.parse_err("variable name omitted"))?;

            let mut flags = ObjFlags::empty();
            if attr.is_static {
                flags |= ObjFlags::STATIC;
            }
            if attr.is_tls {
                flags |= ObjFlags::TLS;
            }

            let existing = match self.find_var_in_global_scope(name) {
                Some(VarScopeEntry::Var(id)) => {
                    let prev = self.unit.get(id);
                    if prev.is_function() || !self.sess.types.is_compatible(prev.ty, ty) {
                        return Err(self.type_err(
                            loc,
                            format!(
                                "conflicting types for '{}'",
                                self.sess.interner.resolve(name)
                            ),
                        ));
                    }
                    Some(id)
                }
                Some(_) => {
                    return Err(self.type_err(
                        loc,
                        format!("redefinition of '{}'", self.sess.interner.resolve(name)),
                    ));
                }
                None => None,
            };
            let gvar = existing.unwrap_or_else(|| self.new_gvar(name, ty, flags));

            if let Some(align) = attr.align {
                self.unit.get_mut(gvar).align = align;
            }

            if self.eat(TokenKind::Assign) {
                if self.unit.get(gvar).is_definition()
                    && !self.unit.get(gvar).flags.contains(ObjFlags::TENTATIVE)
                {
                    return Err(self.type_err(
                        loc,
                        format!("redefinition of '{}'", self.sess.interner.resolve(name)),
                    ));
                }
                self.gvar_initializer(gvar)?;
                let obj = self.unit.get_mut(gvar);
                obj.flags |= ObjFlags::DEFINITION;
                obj.flags.remove(ObjFlags::TENTATIVE);
            } else if !attr.is_extern {
                // Tentative definition: zero-initialized unless superseded.
                let obj = self.unit.get_mut(gvar);
                if !obj.is_definition() {
                    obj.flags |= ObjFlags::DEFINITION | ObjFlags::TENTATIVE;
                }
            }
        }
        Ok(())
    }
}

/// Reachability: mark `main` and every root function, then everything they
/// transitively reference. Unreached function bodies are elided downstream.
fn mark_live(unit: &mut TranslationUnit) {
    let mut by_name: HashMap<Sym, ObjId> = HashMap::new();
    for (id, obj) in unit.iter_globals() {
        by_name.insert(obj.name, id);
    }

    let mut stack: Vec<ObjId> = unit
        .iter_globals()
        .filter(|(_, o)| o.is_function() && o.is_definition() && o.flags.contains(ObjFlags::ROOT))
        .map(|(id, _)| id)
        .collect();

    while let Some(id) = stack.pop() {
        if unit.get(id).is_live() {
            continue;
        }
        unit.get_mut(id).flags |= ObjFlags::LIVE;
        let refs = unit.get(id).refs.clone();
        for name in refs {
            if let Some(&target) = by_name.get(&name) {
                if !unit.get(target).is_live() {
                    stack.push(target);
                }
            }
        }
    }
}

/// Drop a tentative definition when a later full definition of the same name
/// exists (keeps the unit deterministic for emission).
fn drop_superseded_tentatives(unit: &mut TranslationUnit) {
    let globals: Vec<ObjId> = unit.globals().to_vec();
    for &id in &globals {
        if !unit.get(id).flags.contains(ObjFlags::TENTATIVE) {
            continue;
        }
        let name = unit.get(id).name;
        let superseded = globals.iter().any(|&other| {
            other != id
                && unit.get(other).name == name
                && unit.get(other).is_definition()
                && !unit.get(other).flags.contains(ObjFlags::TENTATIVE)
        });
        if superseded {
            unit.get_mut(id).flags.remove(ObjFlags::DEFINITION);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctype::TypeKind;
    use crate::lexer;

    fn parse_src(src: &str) -> (Session, TranslationUnit) {
        let mut sess = Session::new();
        let toks = lexer::tokenize(&mut sess, "test.c", src.as_bytes()).expect("lex ok");
        let unit = parse(&mut sess, toks).expect("parse ok");
        (sess, unit)
    }

    fn parse_err(src: &str) -> FrontError {
        let mut sess = Session::new();
        let toks = lexer::tokenize(&mut sess, "test.c", src.as_bytes()).expect("lex ok");
        parse(&mut sess, toks).expect_err("parse must fail")
    }

    fn global<'u>(sess: &Session, unit: &'u TranslationUnit, name: &str) -> &'u Obj {
        unit.iter_globals()
            .find(|(_, o)| sess.interner.resolve(o.name) == name)
            .map(|(_, o)| o)
            .unwrap_or_else(|| panic!("no global named {name}"))
    }

    #[test]
    fn function_objects_carry_bodies_and_locals() {
        let (sess, unit) = parse_src("int f(int a) { int b = a + 1; return b; }");
        let f = global(&sess, &unit, "f");
        assert!(f.is_function() && f.is_definition());
        assert_eq!(f.params.len(), 1);
        // Parameter plus one block local.
        assert_eq!(f.locals.len(), 2);
        assert!(f.body.is_some());
    }

    #[test]
    fn struct_layout_honors_alignment_and_packing() {
        let (sess, unit) = parse_src(
            "struct { char c; int i; char d; } x; \
             struct { char c; int i; } __attribute__((packed)) y; \
             union { char c[3]; int i; } z; \
             int main() { return 0; }",
        );
        let x = global(&sess, &unit, "x");
        assert_eq!(sess.types.size_of(x.ty), 12);
        assert_eq!(sess.types.align_of(x.ty), 4);
        let y = global(&sess, &unit, "y");
        assert_eq!(sess.types.size_of(y.ty), 5);
        assert_eq!(sess.types.align_of(y.ty), 1);
        let z = global(&sess, &unit, "z");
        assert_eq!(sess.types.size_of(z.ty), 4);
    }

    #[test]
    fn bitfields_share_storage_units() {
        let (sess, unit) = parse_src(
            "struct { unsigned a : 3; unsigned b : 5; unsigned c : 9; } x; \
             int main() { return 0; }",
        );
        let x = global(&sess, &unit, "x");
        let ty = sess.types.get(x.ty);
        assert_eq!(ty.size, 4);
        assert_eq!(ty.members[0].bit_offset, 0);
        assert_eq!(ty.members[1].bit_offset, 3);
        assert_eq!(ty.members[2].bit_offset, 8);
        assert_eq!(ty.members[2].offset, 0);
    }

    #[test]
    fn zero_width_bitfield_forces_a_new_unit() {
        let (sess, unit) = parse_src(
            "struct { unsigned a : 3; unsigned : 0; unsigned b : 1; } x; \
             int main() { return 0; }",
        );
        let x = global(&sess, &unit, "x");
        let ty = sess.types.get(x.ty);
        let b = ty.members.last().expect("member b");
        assert_eq!(b.offset, 4);
        assert_eq!(b.bit_offset, 0);
    }

    #[test]
    fn global_initializers_become_images_and_relocations() {
        let (sess, unit) = parse_src(
            "int x = 7; int *p = &x; char s[] = \"hi\"; int main() { return 0; }",
        );
        let x = global(&sess, &unit, "x");
        assert_eq!(x.init_data.as_deref(), Some(&7i32.to_le_bytes()[..]));

        let p = global(&sess, &unit, "p");
        assert_eq!(p.relocs.len(), 1);
        assert_eq!(sess.interner.resolve(p.relocs[0].name), "x");

        let s = global(&sess, &unit, "s");
        assert_eq!(s.init_data.as_deref(), Some(&b"hi\0"[..]));
        assert_eq!(sess.types.size_of(s.ty), 3);
    }

    #[test]
    fn enum_constants_resolve_in_expressions() {
        let (sess, unit) = parse_src(
            "enum e { A, B = 5, C }; int x = C; int main() { return 0; }",
        );
        let x = global(&sess, &unit, "x");
        assert_eq!(x.init_data.as_deref(), Some(&6i32.to_le_bytes()[..]));
    }

    #[test]
    fn expressions_are_fully_typed() {
        use crate::ast::{ExprKind, StmtKind};
        let (sess, unit) = parse_src("int main() { int a = 1; return a + 2 * 3; }");
        let main = global(&sess, &unit, "main");
        // Walk every expression in the body; all carry a concrete type.
        fn walk_expr(e: &crate::ast::Expr, seen: &mut usize) {
            *seen += 1;
            match &e.kind {
                ExprKind::Binary { lhs, rhs, .. }
                | ExprKind::Assign { lhs, rhs }
                | ExprKind::CompoundAssign { lhs, rhs, .. }
                | ExprKind::LogAnd { lhs, rhs }
                | ExprKind::LogOr { lhs, rhs }
                | ExprKind::Comma { lhs, rhs }
                | ExprKind::Gep {
                    ptr: lhs,
                    index: rhs,
                } => {
                    walk_expr(lhs, seen);
                    walk_expr(rhs, seen);
                }
                ExprKind::Neg(x)
                | ExprKind::Not(x)
                | ExprKind::BitNot(x)
                | ExprKind::Addr(x)
                | ExprKind::Deref(x)
                | ExprKind::Cast(x) => walk_expr(x, seen),
                _ => {}
            }
        }
        fn walk_stmt(s: &crate::ast::Stmt, seen: &mut usize) {
            match &s.kind {
                StmtKind::Expr(e) | StmtKind::Return(Some(e)) => walk_expr(e, seen),
                StmtKind::Block(stmts) => {
                    for s in stmts {
                        walk_stmt(s, seen);
                    }
                }
                _ => {}
            }
        }
        let mut seen = 0;
        for s in main.body.as_deref().unwrap_or(&[]) {
            walk_stmt(s, &mut seen);
        }
        assert!(seen >= 4, "expected to visit several typed expressions");
    }

    #[test]
    fn unresolved_goto_is_an_error() {
        let err = parse_err("int main() { goto nowhere; return 0; }");
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn typedefs_shadow_and_resolve() {
        let (sess, unit) = parse_src(
            "typedef int word; word g = 3; int main() { word w = g; return w; }",
        );
        let g = global(&sess, &unit, "g");
        assert_eq!(sess.types.kind(g.ty), TypeKind::Int);
    }
}
