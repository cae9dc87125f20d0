//! AST → SSA IR construction.
//!
//! Walks the live global objects of a parsed translation unit. Every
//! function gets an entry block holding the `alloca`s for its parameters
//! and locals plus the parameter copies, then a branch to the first body
//! block. All reads and writes of user variables go through load/store of
//! those slots.

use hashbrown::HashMap;
use tracing::debug;

use cjit_front::ast::{BinaryOp, CaseArm, Expr, ExprKind, Stmt, StmtKind};
use cjit_front::ctype::{Member, TypeId as CTypeId, TypeKind};
use cjit_front::obj::{Obj, ObjId, TranslationUnit};
use cjit_front::session::{Label, Session};

use crate::inst::{
    BinOp, BlockId, Callee, CastOp, Cond, GepStep, Inst, Operand, Terminator, UnOp, ValueId,
};
use crate::module::{Function, GlobalVar, IrConst, Module};
use crate::ty::{IrField, IrTypes, TyId, TyKind};
use crate::{IrError, Result};

/// Build an IR module from a parsed translation unit.
pub fn build(sess: &Session, unit: &TranslationUnit) -> Result<Module> {
    let mut b = Builder {
        sess,
        unit,
        types: IrTypes::new(),
        ty_map: HashMap::new(),
        globals: Vec::new(),
        funcs: Vec::new(),
    };

    for (_, obj) in unit.iter_globals() {
        if obj.is_function() {
            if obj.is_definition() && obj.is_live() {
                b.build_function(obj)?;
            }
        } else if obj.is_definition() {
            b.build_global(obj)?;
        }
    }

    debug!(
        globals = b.globals.len(),
        funcs = b.funcs.len(),
        "built IR module"
    );
    Ok(Module {
        types: b.types,
        globals: b.globals,
        funcs: b.funcs,
    })
}

/// ABI-normalized view of a C function signature.
#[derive(Debug, Clone)]
struct FnSig {
    /// IR return type; `VOID` when `sret` is set.
    ret: TyId,
    /// Return goes through a hidden pointer argument.
    sret: bool,
    /// The struct type behind `sret`, when set.
    sret_ty: Option<TyId>,
    /// ABI parameter types (hidden return pointer not included).
    params: Vec<TyId>,
    variadic: bool,
}

/// A local variable's stack slot.
#[derive(Debug, Clone, Copy)]
struct Slot {
    value: ValueId,
    /// The slot holds a pointer to the object (large by-value struct
    /// parameters arrive as a caller-owned copy's address).
    indirect: bool,
}

struct FnCtx {
    func: Function,
    cur: BlockId,
    entry: BlockId,
    /// Number of leading `alloca`s in the entry block, so late slots are
    /// inserted into the alloca run rather than appended after the copies.
    entry_allocas: usize,
    slots: HashMap<ObjId, Slot>,
    label_blocks: HashMap<Label, BlockId>,
    sret: Option<ValueId>,
    ret_cty: CTypeId,
}

struct Builder<'a> {
    sess: &'a Session,
    unit: &'a TranslationUnit,
    types: IrTypes,
    ty_map: HashMap<CTypeId, TyId>,
    globals: Vec<GlobalVar>,
    funcs: Vec<Function>,
}

impl<'a> Builder<'a> {
    fn internal(&self, msg: impl Into<String>) -> IrError {
        IrError::Internal(msg.into())
    }

    // ----- type conversion ---------------------------------------------

    fn ir_type(&mut self, cty: CTypeId) -> TyId {
        if let Some(&id) = self.ty_map.get(&cty) {
            return id;
        }
        let t = self.sess.types.get(cty).clone();
        let id = match t.kind {
            TypeKind::Void => IrTypes::VOID,
            TypeKind::Bool => IrTypes::BOOL,
            TypeKind::Char | TypeKind::Short | TypeKind::Int | TypeKind::Long => {
                IrTypes::int_of_size(t.size.unsigned_abs(), t.is_unsigned())
            }
            TypeKind::Enum => IrTypes::I32,
            TypeKind::Float => IrTypes::F32,
            TypeKind::Double => IrTypes::F64,
            TypeKind::Ptr => {
                let base = t.base.expect("pointer base");
                let inner = self.ir_type(base);
                self.types.ptr_to(inner)
            }
            TypeKind::Array => {
                let base = t.base.expect("array base");
                let elem = self.ir_type(base);
                self.types.intern(TyKind::Array {
                    elem,
                    len: t.array_len.max(0) as u32,
                })
            }
            TypeKind::Struct | TypeKind::Union => {
                // Reserve the slot first so self-referential members (via
                // pointers) resolve to the same id.
                let id = self.types.reserve_struct();
                self.ty_map.insert(cty, id);
                let fields = t
                    .members
                    .iter()
                    .map(|m| {
                        let fty = if m.is_bitfield {
                            let unit = self.sess.types.get(m.ty);
                            IrTypes::int_of_size(unit.size.unsigned_abs(), unit.is_unsigned())
                        } else {
                            self.ir_type(m.ty)
                        };
                        IrField {
                            ty: fty,
                            offset: m.offset,
                        }
                    })
                    .collect();
                self.types
                    .complete_struct(id, fields, t.size.max(0) as u32, t.align.max(1));
                return id;
            }
            TypeKind::Func => {
                let sig = self.fn_sig(cty);
                let ret = sig.ret;
                self.types.intern(TyKind::Func {
                    ret,
                    params: sig.params,
                    variadic: sig.variadic,
                })
            }
        };
        self.ty_map.insert(cty, id);
        id
    }

    /// ABI type of one argument: small aggregates travel as integers of
    /// their exact size, larger ones by pointer to a caller-made copy.
    fn abi_arg_ty(&mut self, cty: CTypeId) -> TyId {
        let t = self.sess.types.get(cty).clone();
        if t.is_aggregate() {
            let size = t.size.max(0) as u32;
            if matches!(size, 1 | 2 | 4 | 8) {
                IrTypes::int_of_size(size, true)
            } else {
                let inner = self.ir_type(cty);
                self.types.ptr_to(inner)
            }
        } else {
            self.ir_type(cty)
        }
    }

    fn fn_sig(&mut self, cty: CTypeId) -> FnSig {
        let t = self.sess.types.get(cty).clone();
        debug_assert_eq!(t.kind, TypeKind::Func);
        let ret_cty = t.ret.expect("function return type");
        let rt = self.sess.types.get(ret_cty).clone();

        let (ret, sret, sret_ty) = if rt.kind == TypeKind::Void {
            (IrTypes::VOID, false, None)
        } else if rt.is_aggregate() {
            let size = rt.size.max(0) as u32;
            if matches!(size, 1 | 2 | 4 | 8) {
                (IrTypes::int_of_size(size, true), false, None)
            } else {
                let inner = self.ir_type(ret_cty);
                (IrTypes::VOID, true, Some(inner))
            }
        } else {
            (self.ir_type(ret_cty), false, None)
        };

        let params = t.params.iter().map(|&p| self.abi_arg_ty(p)).collect();
        FnSig {
            ret,
            sret,
            sret_ty,
            params,
            variadic: t.flags.contains(cjit_front::ctype::TypeFlags::VARIADIC),
        }
    }

    // ----- globals ------------------------------------------------------

    fn build_global(&mut self, obj: &Obj) -> Result<()> {
        let ty = self.ir_type(obj.ty);
        let init = match &obj.init_data {
            Some(data) => Some(self.const_tree(obj.ty, data, 0, obj)?),
            None => None,
        };
        self.globals.push(GlobalVar {
            name: obj.name,
            ty,
            align: obj.align.max(1),
            internal: obj.flags.contains(cjit_front::obj::ObjFlags::STATIC),
            init,
        });
        Ok(())
    }

    /// Rebuild a typed constant tree from the parser's flat byte image plus
    /// relocation list.
    fn const_tree(&mut self, cty: CTypeId, data: &[u8], offset: u32, obj: &Obj) -> Result<IrConst> {
        let t = self.sess.types.get(cty).clone();
        let size = t.size.max(0) as u32;
        let at = offset as usize;
        match t.kind {
            TypeKind::Array => {
                let base = t.base.expect("array base");
                let elem_size = self.sess.types.size_of(base).max(0) as u32;
                let mut elems = Vec::with_capacity(t.array_len.max(0) as usize);
                for i in 0..t.array_len.max(0) as u32 {
                    elems.push(self.const_tree(base, data, offset + i * elem_size, obj)?);
                }
                Ok(IrConst::Array(elems))
            }
            TypeKind::Struct => {
                let mut fields = Vec::new();
                let mut done_units: Vec<u32> = Vec::new();
                for m in &t.members {
                    if m.is_bitfield {
                        // Emit each storage unit once, as raw bits.
                        if done_units.contains(&m.offset) {
                            continue;
                        }
                        done_units.push(m.offset);
                        let unit = self.sess.types.size_of(m.ty).max(1) as usize;
                        let lo = at + m.offset as usize;
                        let word = read_le(&data[lo..lo + unit]);
                        let ty = IrTypes::int_of_size(unit as u32, true);
                        fields.push((m.offset, IrConst::Int { value: word, ty }));
                    } else {
                        fields.push((m.offset, self.const_tree(m.ty, data, offset + m.offset, obj)?));
                    }
                }
                Ok(IrConst::Struct(fields))
            }
            TypeKind::Union => {
                if let Some(r) = obj.relocs.iter().find(|r| r.offset == offset) {
                    return Ok(IrConst::SymbolAddr {
                        name: r.name,
                        addend: r.addend,
                    });
                }
                Ok(IrConst::Bytes(data[at..at + size as usize].to_vec()))
            }
            TypeKind::Float => Ok(IrConst::Float {
                value: f64::from(f32::from_le_bytes(
                    data[at..at + 4].try_into().expect("f32 bytes"),
                )),
                ty: IrTypes::F32,
            }),
            TypeKind::Double => Ok(IrConst::Float {
                value: f64::from_le_bytes(data[at..at + 8].try_into().expect("f64 bytes")),
                ty: IrTypes::F64,
            }),
            TypeKind::Ptr => {
                if let Some(r) = obj.relocs.iter().find(|r| r.offset == offset) {
                    return Ok(IrConst::SymbolAddr {
                        name: r.name,
                        addend: r.addend,
                    });
                }
                Ok(IrConst::Int {
                    value: read_le(&data[at..at + 8]),
                    ty: self.ir_type(cty),
                })
            }
            TypeKind::Func | TypeKind::Void => {
                Err(self.internal("unsized object in global initializer"))
            }
            _ => Ok(IrConst::Int {
                value: read_le(&data[at..at + size as usize]),
                ty: self.ir_type(cty),
            }),
        }
    }

    // ----- functions ----------------------------------------------------

    fn build_function(&mut self, obj: &Obj) -> Result<()> {
        let sig = self.fn_sig(obj.ty);
        let fn_ty = self.ir_type(obj.ty);
        let ret_cty = self
            .sess
            .types
            .get(obj.ty)
            .ret
            .expect("function return type");

        let mut func = Function {
            name: obj.name,
            ty: fn_ty,
            params: Vec::new(),
            blocks: Vec::new(),
            values: Vec::new(),
            internal: obj.flags.contains(cjit_front::obj::ObjFlags::STATIC),
        };
        let entry = func.new_block();
        let body = func.new_block();

        // ABI parameter values.
        let mut sret_val = None;
        if sig.sret {
            let st = sig.sret_ty.expect("sret struct type");
            let pty = self.types.ptr_to(st);
            let v = func.new_value(pty);
            func.params.push(v);
            sret_val = Some(v);
        }
        let mut param_vals = Vec::new();
        for &pty in &sig.params {
            let v = func.new_value(pty);
            func.params.push(v);
            param_vals.push(v);
        }

        let mut f = FnCtx {
            func,
            cur: body,
            entry,
            entry_allocas: 0,
            slots: HashMap::new(),
            label_blocks: HashMap::new(),
            sret: sret_val,
            ret_cty,
        };

        // Stack slots for every local, parameters included.
        for &lid in &obj.locals {
            let lobj = self.unit.get(lid);
            let is_param = obj.params.contains(&lid);
            let by_ptr = is_param && {
                let t = self.sess.types.get(lobj.ty);
                t.is_aggregate() && !matches!(t.size, 1 | 2 | 4 | 8)
            };
            let slot_ty = if by_ptr {
                let inner = self.ir_type(lobj.ty);
                self.types.ptr_to(inner)
            } else {
                self.ir_type(lobj.ty)
            };
            let align = if by_ptr { 8 } else { lobj.align.max(1) };
            let v = self.emit_alloca(&mut f, slot_ty, align);
            f.slots.insert(
                lid,
                Slot {
                    value: v,
                    indirect: by_ptr,
                },
            );
        }

        // Copy incoming arguments into their slots.
        for (i, &pid) in obj.params.iter().enumerate() {
            let slot = f.slots[&pid];
            let arg = param_vals[i];
            let pobj = self.unit.get(pid);
            let pt = self.sess.types.get(pobj.ty).clone();
            if pt.is_aggregate() && matches!(pt.size, 1 | 2 | 4 | 8) {
                // Small by-value struct: store the integer through a
                // reinterpreted slot pointer.
                let int_ty = IrTypes::int_of_size(pt.size as u32, true);
                let ptr_ty = self.types.ptr_to(int_ty);
                let cast = f.func.new_value(ptr_ty);
                f.func.blocks[f.entry.index()].insts.push(Inst::Cast {
                    op: CastOp::Bitcast,
                    dst: cast,
                    src: Operand::Value(slot.value),
                });
                f.func.blocks[f.entry.index()].insts.push(Inst::Store {
                    addr: Operand::Value(cast),
                    value: Operand::Value(arg),
                });
            } else {
                f.func.blocks[f.entry.index()].insts.push(Inst::Store {
                    addr: Operand::Value(slot.value),
                    value: Operand::Value(arg),
                });
            }
        }

        f.func.blocks[f.entry.index()].term = Some(Terminator::Br(body));

        for stmt in obj.body.as_deref().unwrap_or(&[]) {
            self.gen_stmt(&mut f, stmt)?;
        }

        // Implicit return when control falls off the end.
        if f.func.blocks[f.cur.index()].term.is_none() {
            let term = self.implicit_return(&mut f);
            f.func.blocks[f.cur.index()].term = Some(term);
        }
        // Seal stray blocks (dead code after returns, unreferenced labels).
        for blk in f.func.blocks.iter_mut() {
            if blk.term.is_none() {
                blk.term = Some(Terminator::Unreachable);
            }
        }

        debug!(
            name = self.sess.interner.resolve(obj.name),
            blocks = f.func.blocks.len(),
            "built function"
        );
        self.funcs.push(f.func);
        Ok(())
    }

    fn implicit_return(&mut self, f: &mut FnCtx) -> Terminator {
        let rt = self.sess.types.get(f.ret_cty).clone();
        if rt.kind == TypeKind::Void || f.sret.is_some() {
            return Terminator::Ret(None);
        }
        if rt.is_float() {
            let ty = if rt.kind == TypeKind::Float {
                IrTypes::F32
            } else {
                IrTypes::F64
            };
            return Terminator::Ret(Some(Operand::ConstFloat { value: 0.0, ty }));
        }
        if rt.is_aggregate() {
            let ty = IrTypes::int_of_size(rt.size.max(1) as u32, true);
            return Terminator::Ret(Some(Operand::ConstInt { value: 0, ty }));
        }
        let ty = self.ir_type(f.ret_cty);
        Terminator::Ret(Some(Operand::ConstInt { value: 0, ty }))
    }

    // ----- block plumbing ----------------------------------------------

    fn emit(&mut self, f: &mut FnCtx, inst: Inst) {
        f.func.blocks[f.cur.index()].insts.push(inst);
    }

    /// Allocas live at the head of the entry block regardless of where the
    /// need for one arises.
    fn emit_alloca(&mut self, f: &mut FnCtx, ty: TyId, align: u32) -> ValueId {
        let ptr_ty = self.types.ptr_to(ty);
        let dst = f.func.new_value(ptr_ty);
        let at = f.entry_allocas;
        f.func.blocks[f.entry.index()]
            .insts
            .insert(at, Inst::Alloca { dst, ty, align });
        f.entry_allocas += 1;
        dst
    }

    fn seal(&mut self, f: &mut FnCtx, term: Terminator) {
        let blk = &mut f.func.blocks[f.cur.index()];
        if blk.term.is_none() {
            blk.term = Some(term);
        }
    }

    /// Seal the current block with a branch to `target` and continue there.
    fn branch_to(&mut self, f: &mut FnCtx, target: BlockId) {
        self.seal(f, Terminator::Br(target));
        f.cur = target;
    }

    fn label_block(&mut self, f: &mut FnCtx, label: Label) -> BlockId {
        if let Some(&b) = f.label_blocks.get(&label) {
            return b;
        }
        let b = f.func.new_block();
        f.label_blocks.insert(label, b);
        b
    }

    // ----- statements ---------------------------------------------------

    fn gen_stmt(&mut self, f: &mut FnCtx, stmt: &Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Block(stmts) => {
                for s in stmts {
                    self.gen_stmt(f, s)?;
                }
                Ok(())
            }
            StmtKind::Expr(e) => {
                self.gen_expr(f, e)?;
                Ok(())
            }
            StmtKind::Return(value) => {
                match value {
                    None => self.seal(f, Terminator::Ret(None)),
                    Some(e) => {
                        let rt = self.sess.types.get(f.ret_cty).clone();
                        if rt.is_aggregate() {
                            let src = self.gen_expr(f, e)?;
                            if let Some(sret) = f.sret {
                                self.emit(
                                    f,
                                    Inst::MemCpy {
                                        dst: Operand::Value(sret),
                                        src,
                                        len: rt.size.max(0) as u64,
                                    },
                                );
                                self.seal(f, Terminator::Ret(None));
                            } else {
                                // Small struct: return its bits as an integer.
                                let int_ty =
                                    IrTypes::int_of_size(rt.size.max(1) as u32, true);
                                let v = self.load_via_bitcast(f, src, int_ty);
                                self.seal(f, Terminator::Ret(Some(Operand::Value(v))));
                            }
                        } else {
                            let v = self.gen_expr(f, e)?;
                            self.seal(f, Terminator::Ret(Some(v)));
                        }
                    }
                }
                // Anything that follows is unreachable; collect it apart.
                let next = f.func.new_block();
                f.cur = next;
                Ok(())
            }
            StmtKind::If {
                cond,
                then_stmt,
                else_stmt,
                then_label,
                else_label,
                end_label,
            } => {
                let then_bb = self.label_block(f, *then_label);
                let else_bb = self.label_block(f, *else_label);
                let end_bb = self.label_block(f, *end_label);

                let c = self.gen_bool(f, cond)?;
                self.seal(
                    f,
                    Terminator::CondBr {
                        cond: c,
                        then_blk: then_bb,
                        else_blk: else_bb,
                    },
                );
                f.cur = then_bb;
                self.gen_stmt(f, then_stmt)?;
                self.seal(f, Terminator::Br(end_bb));

                if let Some(else_stmt) = else_stmt {
                    f.cur = else_bb;
                    self.gen_stmt(f, else_stmt)?;
                    self.seal(f, Terminator::Br(end_bb));
                }
                f.cur = end_bb;
                Ok(())
            }
            StmtKind::For {
                init,
                cond,
                inc,
                body,
                break_label,
                continue_label,
                body_label,
            } => {
                if let Some(init) = init {
                    self.gen_stmt(f, init)?;
                }
                let cond_bb = f.func.new_block();
                let body_bb = self.label_block(f, *body_label);
                let inc_bb = self.label_block(f, *continue_label);
                let end_bb = self.label_block(f, *break_label);

                self.branch_to(f, cond_bb);
                match cond {
                    Some(c) => {
                        let v = self.gen_bool(f, c)?;
                        self.seal(
                            f,
                            Terminator::CondBr {
                                cond: v,
                                then_blk: body_bb,
                                else_blk: end_bb,
                            },
                        );
                    }
                    None => self.seal(f, Terminator::Br(body_bb)),
                }

                f.cur = body_bb;
                self.gen_stmt(f, body)?;
                self.seal(f, Terminator::Br(inc_bb));

                f.cur = inc_bb;
                if let Some(inc) = inc {
                    self.gen_expr(f, inc)?;
                }
                self.seal(f, Terminator::Br(cond_bb));

                f.cur = end_bb;
                Ok(())
            }
            StmtKind::DoWhile {
                body,
                cond,
                break_label,
                continue_label,
                body_label,
            } => {
                let body_bb = self.label_block(f, *body_label);
                let cond_bb = self.label_block(f, *continue_label);
                let end_bb = self.label_block(f, *break_label);

                self.branch_to(f, body_bb);
                self.gen_stmt(f, body)?;
                self.seal(f, Terminator::Br(cond_bb));

                f.cur = cond_bb;
                let v = self.gen_bool(f, cond)?;
                self.seal(
                    f,
                    Terminator::CondBr {
                        cond: v,
                        then_blk: body_bb,
                        else_blk: end_bb,
                    },
                );
                f.cur = end_bb;
                Ok(())
            }
            StmtKind::Switch {
                cond,
                body,
                cases,
                default_label,
                break_label,
            } => {
                let scrut = self.gen_expr(f, cond)?;
                let scrut_ty = self.operand_ty(f, &scrut);
                let unsigned = self.types.is_unsigned(scrut_ty);
                let end_bb = self.label_block(f, *break_label);

                self.gen_switch_dispatch(f, scrut, scrut_ty, unsigned, cases, *default_label, end_bb);

                self.gen_stmt(f, body)?;
                self.seal(f, Terminator::Br(end_bb));
                f.cur = end_bb;
                Ok(())
            }
            StmtKind::Case { body, label } => {
                let case_bb = self.label_block(f, *label);
                self.branch_to(f, case_bb);
                self.gen_stmt(f, body)
            }
            StmtKind::Goto { label, .. } => {
                let bb = self.label_block(f, *label);
                self.seal(f, Terminator::Br(bb));
                let next = f.func.new_block();
                f.cur = next;
                Ok(())
            }
            StmtKind::Labeled { label, stmt, .. } => {
                let bb = self.label_block(f, *label);
                self.branch_to(f, bb);
                self.gen_stmt(f, stmt)
            }
            // Inline assembly is carried to this point and dropped; nothing
            // in the supported corpus observes its effects.
            StmtKind::Asm { .. } => Ok(()),
        }
    }

    /// Linearized case dispatch: equality tests (pairs of compares for
    /// ranges) chained in source order, ending at default or the end block.
    #[allow(clippy::too_many_arguments)]
    fn gen_switch_dispatch(
        &mut self,
        f: &mut FnCtx,
        scrut: Operand,
        scrut_ty: TyId,
        unsigned: bool,
        cases: &[CaseArm],
        default_label: Option<Label>,
        end_bb: BlockId,
    ) {
        for arm in cases {
            let case_bb = self.label_block(f, arm.label);
            let next_test = f.func.new_block();
            if arm.lo == arm.hi {
                let c = f.func.new_value(IrTypes::BOOL);
                self.emit(
                    f,
                    Inst::Cmp {
                        cond: Cond::Eq,
                        dst: c,
                        lhs: scrut.clone(),
                        rhs: Operand::ConstInt {
                            value: arm.lo,
                            ty: scrut_ty,
                        },
                    },
                );
                self.seal(
                    f,
                    Terminator::CondBr {
                        cond: Operand::Value(c),
                        then_blk: case_bb,
                        else_blk: next_test,
                    },
                );
            } else {
                // lo <= x && x <= hi
                let ge = f.func.new_value(IrTypes::BOOL);
                self.emit(
                    f,
                    Inst::Cmp {
                        cond: if unsigned { Cond::UGe } else { Cond::SGe },
                        dst: ge,
                        lhs: scrut.clone(),
                        rhs: Operand::ConstInt {
                            value: arm.lo,
                            ty: scrut_ty,
                        },
                    },
                );
                let second = f.func.new_block();
                self.seal(
                    f,
                    Terminator::CondBr {
                        cond: Operand::Value(ge),
                        then_blk: second,
                        else_blk: next_test,
                    },
                );
                f.cur = second;
                let le = f.func.new_value(IrTypes::BOOL);
                self.emit(
                    f,
                    Inst::Cmp {
                        cond: if unsigned { Cond::ULe } else { Cond::SLe },
                        dst: le,
                        lhs: scrut.clone(),
                        rhs: Operand::ConstInt {
                            value: arm.hi,
                            ty: scrut_ty,
                        },
                    },
                );
                self.seal(
                    f,
                    Terminator::CondBr {
                        cond: Operand::Value(le),
                        then_blk: case_bb,
                        else_blk: next_test,
                    },
                );
            }
            f.cur = next_test;
        }

        let fallback = match default_label {
            Some(l) => self.label_block(f, l),
            None => end_bb,
        };
        self.seal(f, Terminator::Br(fallback));
        // The switch body is generated from a fresh, unreachable position;
        // case statements bind their own blocks as they appear.
        let limbo = f.func.new_block();
        f.cur = limbo;
    }

    // ----- expressions --------------------------------------------------

    fn operand_ty(&self, f: &FnCtx, op: &Operand) -> TyId {
        match op {
            Operand::Value(v) => f.func.value_ty(*v),
            Operand::ConstInt { ty, .. } | Operand::ConstFloat { ty, .. } => *ty,
            Operand::Symbol(_) => IrTypes::U64,
        }
    }

    /// Convert a scalar operand to a boolean value.
    fn to_bool(&mut self, f: &mut FnCtx, v: Operand) -> Operand {
        let ty = self.operand_ty(f, &v);
        if ty == IrTypes::BOOL {
            return v;
        }
        let zero = if self.types.is_float(ty) {
            Operand::ConstFloat { value: 0.0, ty }
        } else {
            Operand::ConstInt { value: 0, ty }
        };
        let dst = f.func.new_value(IrTypes::BOOL);
        self.emit(
            f,
            Inst::Cmp {
                cond: Cond::Ne,
                dst,
                lhs: v,
                rhs: zero,
            },
        );
        Operand::Value(dst)
    }

    fn gen_bool(&mut self, f: &mut FnCtx, e: &Expr) -> Result<Operand> {
        let v = self.gen_expr(f, e)?;
        Ok(self.to_bool(f, v))
    }

    fn load_value(&mut self, f: &mut FnCtx, addr: Operand, ty: TyId) -> ValueId {
        let dst = f.func.new_value(ty);
        self.emit(f, Inst::Load { dst, addr });
        dst
    }

    /// Load an integer of `int_ty` through a reinterpreted pointer.
    fn load_via_bitcast(&mut self, f: &mut FnCtx, addr: Operand, int_ty: TyId) -> ValueId {
        let pty = self.types.ptr_to(int_ty);
        let cast = f.func.new_value(pty);
        self.emit(
            f,
            Inst::Cast {
                op: CastOp::Bitcast,
                dst: cast,
                src: addr,
            },
        );
        self.load_value(f, Operand::Value(cast), int_ty)
    }

    /// Value of an lvalue address: aggregates, arrays and functions stay as
    /// addresses; scalars load.
    fn load_or_addr(&mut self, f: &mut FnCtx, addr: Operand, cty: CTypeId) -> Result<Operand> {
        let t = self.sess.types.get(cty).clone();
        match t.kind {
            TypeKind::Array | TypeKind::Struct | TypeKind::Union | TypeKind::Func => Ok(addr),
            _ => {
                let ty = self.ir_type(cty);
                Ok(Operand::Value(self.load_value(f, addr, ty)))
            }
        }
    }

    fn gen_expr(&mut self, f: &mut FnCtx, e: &Expr) -> Result<Operand> {
        match &e.kind {
            ExprKind::Null => Ok(Operand::ConstInt {
                value: 0,
                ty: IrTypes::I32,
            }),
            ExprKind::Num(v) => {
                let ty = self.ir_type(e.ty);
                Ok(Operand::ConstInt { value: *v, ty })
            }
            ExprKind::Fnum(v) => {
                let ty = self.ir_type(e.ty);
                Ok(Operand::ConstFloat { value: *v, ty })
            }
            ExprKind::Var(_) | ExprKind::Deref(_) => {
                let addr = self.gen_addr(f, e)?;
                self.load_or_addr(f, addr, e.ty)
            }
            ExprKind::Member { member, .. } => {
                if member.is_bitfield {
                    let addr = self.gen_addr(f, e)?;
                    let v = self.gen_bitfield_read(f, addr, member);
                    let member_ty = self.ir_type(member.ty);
                    let out = self.emit_cast_val(f, v, member_ty);
                    Ok(out)
                } else {
                    let addr = self.gen_addr(f, e)?;
                    self.load_or_addr(f, addr, e.ty)
                }
            }
            ExprKind::Addr(inner) => self.gen_addr(f, inner),
            ExprKind::Gep { ptr, index } => {
                let base = self.gen_expr(f, ptr)?;
                let idx = self.gen_expr(f, index)?;
                let elem_cty = self
                    .sess
                    .types
                    .get(ptr.ty)
                    .base
                    .ok_or_else(|| self.internal("gep base is not pointer-like"))?;
                let elem = self.ir_type(elem_cty);
                let out_ty = self.ir_type(e.ty);
                let dst = f.func.new_value(out_ty);
                self.emit(
                    f,
                    Inst::Gep {
                        dst,
                        base,
                        steps: vec![GepStep::Index { index: idx, elem }],
                    },
                );
                Ok(Operand::Value(dst))
            }
            ExprKind::Binary { op, lhs, rhs } => self.gen_binary(f, e, *op, lhs, rhs),
            ExprKind::Neg(x) => {
                let v = self.gen_expr(f, x)?;
                let ty = self.ir_type(e.ty);
                let dst = f.func.new_value(ty);
                self.emit(
                    f,
                    Inst::Un {
                        op: UnOp::Neg,
                        dst,
                        src: v,
                    },
                );
                Ok(Operand::Value(dst))
            }
            ExprKind::BitNot(x) => {
                let v = self.gen_expr(f, x)?;
                let ty = self.ir_type(e.ty);
                let dst = f.func.new_value(ty);
                self.emit(
                    f,
                    Inst::Un {
                        op: UnOp::Not,
                        dst,
                        src: v,
                    },
                );
                Ok(Operand::Value(dst))
            }
            ExprKind::Not(x) => {
                let v = self.gen_expr(f, x)?;
                let ty = self.operand_ty(f, &v);
                let zero = if self.types.is_float(ty) {
                    Operand::ConstFloat { value: 0.0, ty }
                } else {
                    Operand::ConstInt { value: 0, ty }
                };
                let b = f.func.new_value(IrTypes::BOOL);
                self.emit(
                    f,
                    Inst::Cmp {
                        cond: Cond::Eq,
                        dst: b,
                        lhs: v,
                        rhs: zero,
                    },
                );
                Ok(self.emit_cast_val(f, Operand::Value(b), IrTypes::I32))
            }
            ExprKind::LogAnd { lhs, rhs } => self.gen_logical(f, lhs, rhs, true),
            ExprKind::LogOr { lhs, rhs } => self.gen_logical(f, lhs, rhs, false),
            ExprKind::Assign { lhs, rhs } => self.gen_assign(f, lhs, rhs),
            ExprKind::CompoundAssign { op, lhs, rhs } => self.gen_compound(f, *op, lhs, rhs),
            ExprKind::Cond {
                cond,
                then_expr,
                else_expr,
            } => self.gen_cond(f, e, cond, then_expr, else_expr),
            ExprKind::Comma { lhs, rhs } => {
                self.gen_expr(f, lhs)?;
                self.gen_expr(f, rhs)
            }
            ExprKind::Cast(inner) => {
                let v = self.gen_expr(f, inner)?;
                let target = self.sess.types.get(e.ty).clone();
                if target.kind == TypeKind::Void {
                    return Ok(Operand::ConstInt {
                        value: 0,
                        ty: IrTypes::I32,
                    });
                }
                if target.kind == TypeKind::Bool {
                    let b = self.to_bool(f, v);
                    return Ok(b);
                }
                let ty = self.ir_type(e.ty);
                Ok(self.emit_cast_val(f, v, ty))
            }
            ExprKind::MemZero(obj) => {
                let slot = f.slots.get(obj).copied().ok_or_else(|| {
                    self.internal("memzero of a variable without a stack slot")
                })?;
                let size = self.sess.types.size_of(self.unit.get(*obj).ty).max(0) as u64;
                self.emit(
                    f,
                    Inst::MemSet {
                        dst: Operand::Value(slot.value),
                        value: 0,
                        len: size,
                    },
                );
                Ok(Operand::ConstInt {
                    value: 0,
                    ty: IrTypes::I32,
                })
            }
            ExprKind::FuncCall {
                callee,
                func_ty,
                args,
            } => self.gen_call(f, e, callee, *func_ty, args),
        }
    }

    fn gen_binary(
        &mut self,
        f: &mut FnCtx,
        e: &Expr,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Operand> {
        let l = self.gen_expr(f, lhs)?;
        let r = self.gen_expr(f, rhs)?;

        if op.is_comparison() {
            let unsigned = {
                let t = self.sess.types.get(lhs.ty);
                t.is_unsigned() || t.is_float() || t.kind == TypeKind::Ptr
            };
            let cond = match op {
                BinaryOp::Eq => Cond::Eq,
                BinaryOp::Ne => Cond::Ne,
                BinaryOp::Lt => {
                    if unsigned {
                        Cond::ULt
                    } else {
                        Cond::SLt
                    }
                }
                BinaryOp::Le => {
                    if unsigned {
                        Cond::ULe
                    } else {
                        Cond::SLe
                    }
                }
                _ => unreachable!("comparison operator"),
            };
            let b = f.func.new_value(IrTypes::BOOL);
            self.emit(
                f,
                Inst::Cmp {
                    cond,
                    dst: b,
                    lhs: l,
                    rhs: r,
                },
            );
            return Ok(self.emit_cast_val(f, Operand::Value(b), IrTypes::I32));
        }

        let bin = match op {
            BinaryOp::Add => BinOp::Add,
            BinaryOp::Sub => BinOp::Sub,
            BinaryOp::Mul => BinOp::Mul,
            BinaryOp::Div => BinOp::Div,
            BinaryOp::Mod => BinOp::Rem,
            BinaryOp::BitAnd => BinOp::And,
            BinaryOp::BitOr => BinOp::Or,
            BinaryOp::BitXor => BinOp::Xor,
            BinaryOp::Shl => BinOp::Shl,
            BinaryOp::Shr => BinOp::Shr,
            _ => unreachable!("arithmetic operator"),
        };
        let ty = self.ir_type(e.ty);
        // Shift counts arrive in whatever integer type the source used.
        let r = if matches!(bin, BinOp::Shl | BinOp::Shr) {
            self.emit_cast_val(f, r, ty)
        } else {
            r
        };
        let dst = f.func.new_value(ty);
        self.emit(
            f,
            Inst::Bin {
                op: bin,
                dst,
                lhs: l,
                rhs: r,
            },
        );
        Ok(Operand::Value(dst))
    }

    /// Short-circuit `&&` / `||`: four blocks threading the outcome through
    /// a one-byte stack slot, no phi required.
    fn gen_logical(&mut self, f: &mut FnCtx, lhs: &Expr, rhs: &Expr, is_and: bool) -> Result<Operand> {
        let slot = self.emit_alloca(f, IrTypes::BOOL, 1);
        let rhs_bb = f.func.new_block();
        let true_bb = f.func.new_block();
        let false_bb = f.func.new_block();
        let end_bb = f.func.new_block();

        let l = self.gen_bool(f, lhs)?;
        let (then_blk, else_blk) = if is_and {
            (rhs_bb, false_bb)
        } else {
            (true_bb, rhs_bb)
        };
        self.seal(
            f,
            Terminator::CondBr {
                cond: l,
                then_blk,
                else_blk,
            },
        );

        f.cur = rhs_bb;
        let r = self.gen_bool(f, rhs)?;
        self.seal(
            f,
            Terminator::CondBr {
                cond: r,
                then_blk: true_bb,
                else_blk: false_bb,
            },
        );

        f.cur = true_bb;
        self.emit(
            f,
            Inst::Store {
                addr: Operand::Value(slot),
                value: Operand::ConstInt {
                    value: 1,
                    ty: IrTypes::BOOL,
                },
            },
        );
        self.seal(f, Terminator::Br(end_bb));

        f.cur = false_bb;
        self.emit(
            f,
            Inst::Store {
                addr: Operand::Value(slot),
                value: Operand::ConstInt {
                    value: 0,
                    ty: IrTypes::BOOL,
                },
            },
        );
        self.seal(f, Terminator::Br(end_bb));

        f.cur = end_bb;
        let loaded = self.load_value(f, Operand::Value(slot), IrTypes::BOOL);
        Ok(self.emit_cast_val(f, Operand::Value(loaded), IrTypes::I32))
    }

    fn gen_cond(
        &mut self,
        f: &mut FnCtx,
        e: &Expr,
        cond: &Expr,
        then_expr: &Expr,
        else_expr: &Expr,
    ) -> Result<Operand> {
        let then_bb = f.func.new_block();
        let else_bb = f.func.new_block();
        let merge_bb = f.func.new_block();

        let c = self.gen_bool(f, cond)?;
        self.seal(
            f,
            Terminator::CondBr {
                cond: c,
                then_blk: then_bb,
                else_blk: else_bb,
            },
        );

        f.cur = then_bb;
        let tv = self.gen_expr(f, then_expr)?;
        let then_pred = f.cur;
        self.seal(f, Terminator::Br(merge_bb));

        f.cur = else_bb;
        let ev = self.gen_expr(f, else_expr)?;
        let else_pred = f.cur;
        self.seal(f, Terminator::Br(merge_bb));

        f.cur = merge_bb;
        if self.sess.types.kind(e.ty) == TypeKind::Void {
            return Ok(Operand::ConstInt {
                value: 0,
                ty: IrTypes::I32,
            });
        }
        let ty = if self.sess.types.get(e.ty).is_aggregate() {
            // Branches produced addresses.
            let inner = self.ir_type(e.ty);
            self.types.ptr_to(inner)
        } else {
            self.ir_type(e.ty)
        };
        let dst = f.func.new_value(ty);
        self.emit(
            f,
            Inst::Phi {
                dst,
                incoming: vec![(then_pred, tv), (else_pred, ev)],
            },
        );
        Ok(Operand::Value(dst))
    }

    fn gen_assign(&mut self, f: &mut FnCtx, lhs: &Expr, rhs: &Expr) -> Result<Operand> {
        // Bitfield write: read-modify-write on the storage unit.
        if let ExprKind::Member { member, .. } = &lhs.kind {
            if member.is_bitfield {
                let addr = self.gen_addr(f, lhs)?;
                let v = self.gen_expr(f, rhs)?;
                self.gen_bitfield_write(f, addr, member, v.clone());
                return Ok(v);
            }
        }

        let addr = self.gen_addr(f, lhs)?;
        let lt = self.sess.types.get(lhs.ty).clone();
        if lt.is_aggregate() {
            let src = self.gen_expr(f, rhs)?;
            self.emit(
                f,
                Inst::MemCpy {
                    dst: addr.clone(),
                    src,
                    len: lt.size.max(0) as u64,
                },
            );
            return Ok(addr);
        }
        let v = self.gen_expr(f, rhs)?;
        self.emit(
            f,
            Inst::Store {
                addr,
                value: v.clone(),
            },
        );
        Ok(v)
    }

    fn gen_compound(
        &mut self,
        f: &mut FnCtx,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Operand> {
        let lt = self.sess.types.get(lhs.ty).clone();

        // Pointer += / -= is pointer arithmetic on the stored pointer.
        if lt.has_base() {
            let addr = self.gen_addr(f, lhs)?;
            let ptr_ty = self.ir_type(lhs.ty);
            let old = self.load_value(f, addr.clone(), ptr_ty);
            let idx = self.gen_expr(f, rhs)?;
            let idx = if op == BinaryOp::Sub {
                let ity = self.operand_ty(f, &idx);
                let neg = f.func.new_value(ity);
                self.emit(
                    f,
                    Inst::Un {
                        op: UnOp::Neg,
                        dst: neg,
                        src: idx,
                    },
                );
                Operand::Value(neg)
            } else {
                idx
            };
            let elem_cty = lt.base.expect("pointer base");
            let elem = self.ir_type(elem_cty);
            let dst = f.func.new_value(ptr_ty);
            self.emit(
                f,
                Inst::Gep {
                    dst,
                    base: Operand::Value(old),
                    steps: vec![GepStep::Index { index: idx, elem }],
                },
            );
            self.emit(
                f,
                Inst::Store {
                    addr,
                    value: Operand::Value(dst),
                },
            );
            return Ok(Operand::Value(dst));
        }

        let bitfield = match &lhs.kind {
            ExprKind::Member { member, .. } if member.is_bitfield => Some(member.clone()),
            _ => None,
        };

        let addr = self.gen_addr(f, lhs)?;
        let lhs_ir = self.ir_type(lhs.ty);
        let old = match &bitfield {
            Some(m) => {
                let raw = self.gen_bitfield_read(f, addr.clone(), m);
                self.emit_cast_val(f, raw, lhs_ir)
            }
            None => Operand::Value(self.load_value(f, addr.clone(), lhs_ir)),
        };

        // The parser pre-converted the right operand to the common type.
        let r = self.gen_expr(f, rhs)?;
        let common = self.operand_ty(f, &r);
        let old_c = self.emit_cast_val(f, old, common);

        let bin = match op {
            BinaryOp::Add => BinOp::Add,
            BinaryOp::Sub => BinOp::Sub,
            BinaryOp::Mul => BinOp::Mul,
            BinaryOp::Div => BinOp::Div,
            BinaryOp::Mod => BinOp::Rem,
            BinaryOp::BitAnd => BinOp::And,
            BinaryOp::BitOr => BinOp::Or,
            BinaryOp::BitXor => BinOp::Xor,
            BinaryOp::Shl => BinOp::Shl,
            BinaryOp::Shr => BinOp::Shr,
            _ => return Err(self.internal("comparison as compound assignment")),
        };
        let dst = f.func.new_value(common);
        self.emit(
            f,
            Inst::Bin {
                op: bin,
                dst,
                lhs: old_c,
                rhs: r,
            },
        );
        let new_v = self.emit_cast_val(f, Operand::Value(dst), lhs_ir);
        match &bitfield {
            Some(m) => self.gen_bitfield_write(f, addr, m, new_v.clone()),
            None => self.emit(
                f,
                Inst::Store {
                    addr,
                    value: new_v.clone(),
                },
            ),
        }
        Ok(new_v)
    }

    fn gen_call(
        &mut self,
        f: &mut FnCtx,
        e: &Expr,
        callee: &Expr,
        func_cty: CTypeId,
        args: &[Expr],
    ) -> Result<Operand> {
        let sig = self.fn_sig(func_cty);

        // Arguments, left to right.
        let mut lowered = Vec::with_capacity(args.len() + 1);
        for (i, arg) in args.iter().enumerate() {
            let at = self.sess.types.get(arg.ty).clone();
            let v = self.gen_expr(f, arg)?;
            let abi = if let Some(&p) = sig.params.get(i) {
                p
            } else {
                self.abi_arg_ty(arg.ty)
            };
            let v = if at.is_aggregate() {
                let size = at.size.max(0) as u32;
                if matches!(size, 1 | 2 | 4 | 8) {
                    // Pass the struct bits in an integer register.
                    Operand::Value(self.load_via_bitcast(f, v, abi))
                } else {
                    // Copy to a temporary; pass its address.
                    let inner = self.ir_type(arg.ty);
                    let tmp = self.emit_alloca(f, inner, at.align.max(1));
                    self.emit(
                        f,
                        Inst::MemCpy {
                            dst: Operand::Value(tmp),
                            src: v,
                            len: u64::from(size),
                        },
                    );
                    Operand::Value(tmp)
                }
            } else {
                v
            };
            lowered.push(v);
        }

        // Hidden return buffer.
        let mut sret_tmp = None;
        if sig.sret {
            let st = sig.sret_ty.expect("sret struct type");
            let align = self.types.align_of(st);
            let tmp = self.emit_alloca(f, st, align.max(1));
            lowered.insert(0, Operand::Value(tmp));
            sret_tmp = Some(tmp);
        }

        let target = match &callee.kind {
            ExprKind::Var(id) if self.unit.get(*id).is_function() => {
                Callee::Symbol(self.unit.get(*id).name)
            }
            _ => {
                let v = self.gen_expr(f, callee)?;
                Callee::Indirect(v)
            }
        };

        let ret_cty = self
            .sess
            .types
            .get(func_cty)
            .ret
            .expect("function return type");
        let rt = self.sess.types.get(ret_cty).clone();

        let dst = if sig.ret == IrTypes::VOID {
            None
        } else {
            Some(f.func.new_value(sig.ret))
        };
        self.emit(
            f,
            Inst::Call {
                dst,
                callee: target,
                args: lowered,
                sret: sig.sret,
                variadic: sig.variadic,
            },
        );

        if let Some(tmp) = sret_tmp {
            return Ok(Operand::Value(tmp));
        }
        if rt.is_aggregate() {
            // Small struct came back as an integer; spill it to a temporary
            // so member accesses have an address to work with.
            let inner = self.ir_type(ret_cty);
            let tmp = self.emit_alloca(f, inner, rt.align.max(1));
            let int_ty = IrTypes::int_of_size(rt.size.max(1) as u32, true);
            let pty = self.types.ptr_to(int_ty);
            let cast = f.func.new_value(pty);
            self.emit(
                f,
                Inst::Cast {
                    op: CastOp::Bitcast,
                    dst: cast,
                    src: Operand::Value(tmp),
                },
            );
            self.emit(
                f,
                Inst::Store {
                    addr: Operand::Value(cast),
                    value: Operand::Value(dst.expect("struct return value")),
                },
            );
            return Ok(Operand::Value(tmp));
        }
        match dst {
            Some(v) => Ok(Operand::Value(v)),
            None => Ok(Operand::ConstInt {
                value: 0,
                ty: IrTypes::I32,
            }),
        }
    }

    // ----- lvalues ------------------------------------------------------

    fn gen_addr(&mut self, f: &mut FnCtx, e: &Expr) -> Result<Operand> {
        match &e.kind {
            ExprKind::Var(id) => {
                if let Some(slot) = f.slots.get(id).copied() {
                    if slot.indirect {
                        let obj_ty = self.ir_type(self.unit.get(*id).ty);
                        let pty = self.types.ptr_to(obj_ty);
                        let v = self.load_value(f, Operand::Value(slot.value), pty);
                        return Ok(Operand::Value(v));
                    }
                    return Ok(Operand::Value(slot.value));
                }
                Ok(Operand::Symbol(self.unit.get(*id).name))
            }
            ExprKind::Deref(inner) => self.gen_expr(f, inner),
            ExprKind::Member { base, member } => {
                let base_addr = self.gen_addr(f, base)?;
                let base_kind = self.sess.types.kind(base.ty);
                if base_kind == TypeKind::Union {
                    // Union member access reinterprets the same storage.
                    let target = if member.is_bitfield {
                        let unit = self.sess.types.get(member.ty).clone();
                        IrTypes::int_of_size(unit.size.unsigned_abs(), unit.is_unsigned())
                    } else {
                        self.ir_type(member.ty)
                    };
                    let pty = self.types.ptr_to(target);
                    let dst = f.func.new_value(pty);
                    self.emit(
                        f,
                        Inst::Cast {
                            op: CastOp::Bitcast,
                            dst,
                            src: base_addr,
                        },
                    );
                    return Ok(Operand::Value(dst));
                }
                let of = self.ir_type(base.ty);
                let field_ty = match self.types.kind(of) {
                    TyKind::Struct { fields, .. } => fields[member.index as usize].ty,
                    _ => return Err(self.internal("member access on non-struct IR type")),
                };
                let pty = self.types.ptr_to(field_ty);
                let dst = f.func.new_value(pty);
                self.emit(
                    f,
                    Inst::Gep {
                        dst,
                        base: base_addr,
                        steps: vec![GepStep::Field {
                            of,
                            index: member.index,
                        }],
                    },
                );
                Ok(Operand::Value(dst))
            }
            ExprKind::Comma { lhs, rhs } => {
                self.gen_expr(f, lhs)?;
                self.gen_addr(f, rhs)
            }
            ExprKind::Gep { .. } => self.gen_expr(f, e),
            _ => Err(self.internal("expression is not an lvalue")),
        }
    }

    // ----- bitfields ----------------------------------------------------

    /// Load the storage unit, shift the field down, mask (sign-extending
    /// for signed fields). The result has the unit's integer type.
    fn gen_bitfield_read(&mut self, f: &mut FnCtx, unit_addr: Operand, m: &Member) -> Operand {
        let unit = self.sess.types.get(m.ty).clone();
        let unit_ty = IrTypes::int_of_size(unit.size.unsigned_abs(), unit.is_unsigned());
        let unit_bits = unit.size.unsigned_abs() * 8;
        let word = self.load_value(f, unit_addr, unit_ty);

        if unit.is_unsigned() {
            let shr = self.emit_bin(
                f,
                BinOp::Shr,
                unit_ty,
                Operand::Value(word),
                Operand::ConstInt {
                    value: i64::from(m.bit_offset),
                    ty: unit_ty,
                },
            );
            let mask = if m.bit_width >= 64 {
                -1i64
            } else {
                ((1u64 << m.bit_width) - 1) as i64
            };
            self.emit_bin(
                f,
                BinOp::And,
                unit_ty,
                shr,
                Operand::ConstInt {
                    value: mask,
                    ty: unit_ty,
                },
            )
        } else {
            // Shift the field to the top, then arithmetic-shift back down.
            let up = i64::from(unit_bits - m.bit_offset - m.bit_width);
            let down = i64::from(unit_bits - m.bit_width);
            let shl = self.emit_bin(
                f,
                BinOp::Shl,
                unit_ty,
                Operand::Value(word),
                Operand::ConstInt {
                    value: up,
                    ty: unit_ty,
                },
            );
            self.emit_bin(
                f,
                BinOp::Shr,
                unit_ty,
                shl,
                Operand::ConstInt {
                    value: down,
                    ty: unit_ty,
                },
            )
        }
    }

    /// Clear the field's bits, or in the shifted new value, store back.
    fn gen_bitfield_write(&mut self, f: &mut FnCtx, unit_addr: Operand, m: &Member, value: Operand) {
        let unit = self.sess.types.get(m.ty).clone();
        let unit_ty = IrTypes::int_of_size(unit.size.unsigned_abs(), unit.is_unsigned());
        let mask = if m.bit_width >= 64 {
            -1i64
        } else {
            ((1u64 << m.bit_width) - 1) as i64
        };

        let old = self.load_value(f, unit_addr.clone(), unit_ty);
        let keep_mask = !(mask << m.bit_offset);
        let cleared = self.emit_bin(
            f,
            BinOp::And,
            unit_ty,
            Operand::Value(old),
            Operand::ConstInt {
                value: keep_mask,
                ty: unit_ty,
            },
        );
        let v = self.emit_cast_val(f, value, unit_ty);
        let masked = self.emit_bin(
            f,
            BinOp::And,
            unit_ty,
            v,
            Operand::ConstInt {
                value: mask,
                ty: unit_ty,
            },
        );
        let shifted = self.emit_bin(
            f,
            BinOp::Shl,
            unit_ty,
            masked,
            Operand::ConstInt {
                value: i64::from(m.bit_offset),
                ty: unit_ty,
            },
        );
        let merged = self.emit_bin(f, BinOp::Or, unit_ty, cleared, shifted);
        self.emit(
            f,
            Inst::Store {
                addr: unit_addr,
                value: merged,
            },
        );
    }

    fn emit_bin(
        &mut self,
        f: &mut FnCtx,
        op: BinOp,
        ty: TyId,
        lhs: Operand,
        rhs: Operand,
    ) -> Operand {
        let dst = f.func.new_value(ty);
        self.emit(f, Inst::Bin { op, dst, lhs, rhs });
        Operand::Value(dst)
    }

    // ----- casts --------------------------------------------------------

    /// Emit whatever conversion sequence takes `v` to type `to`.
    fn emit_cast_val(&mut self, f: &mut FnCtx, v: Operand, to: TyId) -> Operand {
        let from = self.operand_ty(f, &v);
        if from == to {
            return v;
        }

        let emit_one = |b: &mut Self, f: &mut FnCtx, op: CastOp, src: Operand, ty: TyId| {
            let dst = f.func.new_value(ty);
            b.emit(f, Inst::Cast { op, dst, src });
            Operand::Value(dst)
        };

        // Booleans are compare results.
        if to == IrTypes::BOOL {
            return self.to_bool(f, v);
        }

        let from_int = self.types.is_integer(from);
        let to_int = self.types.is_integer(to);
        let from_f = self.types.is_float(from);
        let to_f = self.types.is_float(to);
        let from_p = self.types.is_ptr(from);
        let to_p = self.types.is_ptr(to);

        if from_int && to_int {
            let sf = self.types.size_of(from);
            let st = self.types.size_of(to);
            let op = if st < sf {
                CastOp::Trunc
            } else if st > sf {
                if self.types.is_unsigned(from) {
                    CastOp::Zext
                } else {
                    CastOp::Sext
                }
            } else {
                CastOp::Bitcast
            };
            return emit_one(self, f, op, v, to);
        }
        if from_p && to_p {
            return emit_one(self, f, CastOp::Bitcast, v, to);
        }
        if from_int && to_p {
            let v = if self.types.size_of(from) < 8 {
                let wide = if self.types.is_unsigned(from) {
                    CastOp::Zext
                } else {
                    CastOp::Sext
                };
                emit_one(self, f, wide, v, IrTypes::I64)
            } else {
                v
            };
            return emit_one(self, f, CastOp::IntToPtr, v, to);
        }
        if from_p && to_int {
            let wide = emit_one(self, f, CastOp::PtrToInt, v, IrTypes::U64);
            return self.emit_cast_val(f, wide, to);
        }
        if from_f && to_f {
            let op = if self.types.size_of(to) > self.types.size_of(from) {
                CastOp::FpExt
            } else {
                CastOp::FpTrunc
            };
            return emit_one(self, f, op, v, to);
        }
        if from_int && to_f {
            // Widen small ints first; u32 widens to i64 so the signed
            // convert instruction is always correct; u64 needs a fixup.
            let sf = self.types.size_of(from);
            let unsigned = self.types.is_unsigned(from);
            if unsigned && sf == 8 {
                return self.emit_u64_to_fp(f, v, to);
            }
            let (v, op) = if sf < 4 || (unsigned && sf == 4) {
                let wide = if unsigned { CastOp::Zext } else { CastOp::Sext };
                let target = if unsigned && sf == 4 {
                    IrTypes::I64
                } else {
                    IrTypes::I32
                };
                (emit_one(self, f, wide, v, target), CastOp::SiToFp)
            } else {
                (v, CastOp::SiToFp)
            };
            return emit_one(self, f, op, v, to);
        }
        if from_f && to_int {
            let unsigned = self.types.is_unsigned(to);
            let op = if unsigned { CastOp::FpToUi } else { CastOp::FpToSi };
            // Convert through 64 bits, then narrow.
            let wide_ty = if unsigned { IrTypes::U64 } else { IrTypes::I64 };
            let wide = emit_one(self, f, op, v, wide_ty);
            return self.emit_cast_val(f, wide, to);
        }
        // Same-size reinterpretation fallback.
        emit_one(self, f, CastOp::Bitcast, v, to)
    }

    /// u64 → floating needs a sign fixup: negative bit patterns convert via
    /// `(v >> 1 | v & 1) * 2`.
    fn emit_u64_to_fp(&mut self, f: &mut FnCtx, v: Operand, to: TyId) -> Operand {
        let big_bb = f.func.new_block();
        let small_bb = f.func.new_block();
        let merge_bb = f.func.new_block();

        let neg = f.func.new_value(IrTypes::BOOL);
        self.emit(
            f,
            Inst::Cmp {
                cond: Cond::SLt,
                dst: neg,
                lhs: v.clone(),
                rhs: Operand::ConstInt {
                    value: 0,
                    ty: IrTypes::I64,
                },
            },
        );
        self.seal(
            f,
            Terminator::CondBr {
                cond: Operand::Value(neg),
                then_blk: big_bb,
                else_blk: small_bb,
            },
        );

        f.cur = small_bb;
        let direct = f.func.new_value(to);
        self.emit(
            f,
            Inst::Cast {
                op: CastOp::SiToFp,
                dst: direct,
                src: v.clone(),
            },
        );
        let small_pred = f.cur;
        self.seal(f, Terminator::Br(merge_bb));

        f.cur = big_bb;
        let half = self.emit_bin(
            f,
            BinOp::Shr,
            IrTypes::U64,
            v.clone(),
            Operand::ConstInt {
                value: 1,
                ty: IrTypes::U64,
            },
        );
        let low = self.emit_bin(
            f,
            BinOp::And,
            IrTypes::U64,
            v,
            Operand::ConstInt {
                value: 1,
                ty: IrTypes::U64,
            },
        );
        let rounded = self.emit_bin(f, BinOp::Or, IrTypes::U64, half, low);
        let halved = f.func.new_value(to);
        self.emit(
            f,
            Inst::Cast {
                op: CastOp::SiToFp,
                dst: halved,
                src: rounded,
            },
        );
        let doubled = self.emit_bin(
            f,
            BinOp::Add,
            to,
            Operand::Value(halved),
            Operand::Value(halved),
        );
        let doubled = match doubled {
            Operand::Value(x) => x,
            _ => unreachable!("emit_bin returns a value"),
        };
        let big_pred = f.cur;
        self.seal(f, Terminator::Br(merge_bb));

        f.cur = merge_bb;
        let dst = f.func.new_value(to);
        self.emit(
            f,
            Inst::Phi {
                dst,
                incoming: vec![
                    (small_pred, Operand::Value(direct)),
                    (big_pred, Operand::Value(doubled)),
                ],
            },
        );
        Operand::Value(dst)
    }
}

fn read_le(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
    i64::from_le_bytes(buf)
}
