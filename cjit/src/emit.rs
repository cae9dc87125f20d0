//! MIR → machine-code emission.
//!
//! Lays out each function's frame (stack objects, spill slots, shadow
//! space, 16-byte rounding), expands prologue/epilogue templates and feeds
//! every instruction to the `cjit-x64` assembler. Global variables are
//! flattened from their typed constant trees into byte images with
//! relocations; external symbols get an 8-byte `.data` stub slot patched
//! with their absolute address at finalization.

use hashbrown::HashMap;
use tracing::debug;

use cjit_front::session::Session;
use cjit_ir::module::{GlobalVar, IrConst, Module};
use cjit_ir::ty::{IrTypes, TyId, TyKind};
use cjit_x64::asm::Assembler;
use cjit_x64::operand::{Mem, Operand, Scale};
use cjit_x64::reg::{OpSize, Reg};
use cjit_x64::{LabelId, RelocKind, SectionKind, SymbolId};

use crate::error::Error;
use crate::mir::{AluOp, FAluOp, MInst, MMem, MOperand, MirFunction, MirModule, ShiftOp};
use crate::Result;

/// Emit a lowered module into an assembler, ready for finalization.
pub fn emit_module(sess: &Session, ir: &Module, mir: &MirModule) -> Result<Assembler> {
    let mut asm = Assembler::new();

    // Declare everything first so emission order cannot matter.
    for f in &mir.funcs {
        asm.func_declare(&f.name);
    }
    for g in &ir.globals {
        asm.global_var_declare(sess.interner.resolve(g.name));
    }
    for (name, _) in &mir.float_consts {
        asm.global_var_declare(name);
    }
    for ext in &mir.externals {
        asm.global_var_declare(&format!("__imp_{ext}"));
    }

    // Data: globals, float pool, external stub slots.
    for g in &ir.globals {
        define_global(sess, &ir.types, &mut asm, g)?;
    }
    for (name, bytes) in &mir.float_consts {
        let sym = asm.global_var_declare(name);
        asm.global_var_define(sym, bytes, bytes.len() as u32, &[])?;
    }
    for ext in &mir.externals {
        let sym = asm.global_var_declare(&format!("__imp_{ext}"));
        asm.global_var_define(sym, &[0u8; 8], 8, &[(RelocKind::Addr64, 0, ext.clone())])?;
    }

    // Code.
    for f in &mir.funcs {
        emit_function(&mut asm, f)?;
    }

    debug!(
        text = asm.text().len(),
        data = asm.data().len(),
        "emitted module"
    );
    Ok(asm)
}

// ----- globals ---------------------------------------------------------

fn define_global(
    sess: &Session,
    types: &IrTypes,
    asm: &mut Assembler,
    g: &GlobalVar,
) -> Result<()> {
    let size = types.size_of(g.ty) as usize;
    let mut buf = vec![0u8; size];
    let mut relocs: Vec<(RelocKind, u32, String)> = Vec::new();
    if let Some(init) = &g.init {
        flatten_const(sess, types, g.ty, init, 0, &mut buf, &mut relocs)?;
    }
    let name = sess.interner.resolve(g.name).to_owned();
    let sym = asm.global_var_declare(&name);
    asm.global_var_define(sym, &buf, g.align, &relocs)?;
    Ok(())
}

/// Flatten a typed constant tree into the byte image, collecting `Addr64`
/// relocations for address-valued leaves.
fn flatten_const(
    sess: &Session,
    types: &IrTypes,
    ty: TyId,
    c: &IrConst,
    at: usize,
    buf: &mut [u8],
    relocs: &mut Vec<(RelocKind, u32, String)>,
) -> Result<()> {
    match c {
        IrConst::Int { value, ty } => {
            let size = types.size_of(*ty).clamp(1, 8) as usize;
            let bytes = value.to_le_bytes();
            buf[at..at + size].copy_from_slice(&bytes[..size]);
        }
        IrConst::Float { value, ty } => {
            if types.size_of(*ty) == 4 {
                buf[at..at + 4].copy_from_slice(&(*value as f32).to_le_bytes());
            } else {
                buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
            }
        }
        IrConst::SymbolAddr { name, addend } => {
            // The addend rides in the slot; finalization adds the address.
            buf[at..at + 8].copy_from_slice(&addend.to_le_bytes());
            relocs.push((
                RelocKind::Addr64,
                at as u32,
                sess.interner.resolve(*name).to_owned(),
            ));
        }
        IrConst::Array(elems) => {
            let TyKind::Array { elem, .. } = types.kind(ty) else {
                return Err(Error::Internal("array constant for non-array type".into()));
            };
            let elem = *elem;
            let elem_size = types.size_of(elem) as usize;
            for (i, e) in elems.iter().enumerate() {
                flatten_const(sess, types, elem, e, at + i * elem_size, buf, relocs)?;
            }
        }
        IrConst::Struct(fields) => {
            let field_tys: Vec<TyId> = match types.kind(ty) {
                TyKind::Struct { fields, .. } => fields.iter().map(|f| f.ty).collect(),
                _ => {
                    return Err(Error::Internal("struct constant for non-struct type".into()))
                }
            };
            for (i, (offset, fc)) in fields.iter().enumerate() {
                let fty = field_tys
                    .get(i)
                    .copied()
                    .ok_or_else(|| Error::Internal("constant field out of range".into()))?;
                flatten_const(sess, types, fty, fc, at + *offset as usize, buf, relocs)?;
            }
        }
        IrConst::Bytes(bytes) => {
            buf[at..at + bytes.len()].copy_from_slice(bytes);
        }
        IrConst::Zero(_) => {}
    }
    Ok(())
}

// ----- functions -------------------------------------------------------

/// Resolved frame geometry.
struct Frame {
    /// Bytes pushed by prologue pushes (rbp + callee-saved).
    push_bytes: u32,
    /// Amount subtracted from rsp after the pushes.
    sub_bytes: u32,
    /// RBP-relative displacement per slot id.
    slot_disp: Vec<i32>,
    /// Frame slots that hold saved callee-saved XMM registers.
    xmm_saves: Vec<(u8, i32)>,
}

/// Stack objects are laid out lowest-address-first with alignment padding;
/// the total rounds up to 16 bytes, plus the shadow space for calls.
fn layout_frame(f: &mut MirFunction) -> Frame {
    // Saved-XMM slots join the ordinary slot table.
    let xmm_slot_ids: Vec<(u8, crate::mir::SlotId)> = f
        .used_callee_xmm
        .clone()
        .into_iter()
        .map(|r| (r, f.new_slot(8, 8)))
        .collect();

    let push_bytes = 8 * (1 + f.used_callee_gp.len() as u32);

    let mut off: u32 = 0;
    let mut ends = Vec::with_capacity(f.slots.len());
    for slot in &f.slots {
        off = align_up(off, slot.align);
        ends.push(off + slot.size);
        off += slot.size;
    }
    let mut locals = align_up(off, 16);
    if push_bytes % 16 != 0 {
        locals += 8;
    }

    let outgoing = if f.has_calls {
        align_up(32.max(8 * f.max_call_args as u32), 16)
    } else {
        0
    };
    let sub_bytes = locals + outgoing;

    // Locals sit at [rbp - push - locals, rbp - push); each slot's end is
    // its distance from the area top.
    let mut slot_disp = Vec::with_capacity(f.slots.len());
    for (i, slot) in f.slots.iter().enumerate() {
        let start = ends[i] - slot.size;
        slot_disp.push(start as i32 - (push_bytes + locals) as i32);
    }
    for (i, slot) in f.slots.iter_mut().enumerate() {
        slot.disp = slot_disp[i];
    }

    let xmm_saves = xmm_slot_ids
        .into_iter()
        .map(|(r, id)| (r, slot_disp[id.0 as usize]))
        .collect();

    Frame {
        push_bytes,
        sub_bytes,
        slot_disp,
        xmm_saves,
    }
}

fn align_up(n: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

struct FnEmitter<'a> {
    asm: &'a mut Assembler,
    frame: Frame,
    block_labels: Vec<LabelId>,
    callee_gp: Vec<u8>,
}

fn emit_function(asm: &mut Assembler, func: &MirFunction) -> Result<()> {
    let mut func = clone_function(func);
    let frame = layout_frame(&mut func);

    let sym = asm.func_declare(&func.name);
    asm.func_begin(sym)?;

    let block_labels: Vec<LabelId> = (0..func.blocks.len())
        .map(|_| asm.label_alloc(SectionKind::Text))
        .collect();

    let mut e = FnEmitter {
        asm,
        frame,
        block_labels,
        callee_gp: func.used_callee_gp.clone(),
    };

    e.prologue()?;
    for (b, blk) in func.blocks.iter().enumerate() {
        let label = e.block_labels[b];
        e.asm.label_bind(label);
        for inst in &blk.insts {
            e.inst(inst)?;
        }
    }

    e.asm.func_end();
    Ok(())
}

// The emitter mutates slot displacements during layout; work on a copy so
// the MIR module stays inspectable after emission.
fn clone_function(f: &MirFunction) -> MirFunction {
    MirFunction {
        name: f.name.clone(),
        internal: f.internal,
        blocks: f
            .blocks
            .iter()
            .map(|b| crate::mir::MirBlock {
                insts: b.insts.clone(),
            })
            .collect(),
        slots: f.slots.clone(),
        next_vreg: f.next_vreg,
        max_call_args: f.max_call_args,
        has_calls: f.has_calls,
        used_callee_gp: f.used_callee_gp.clone(),
        used_callee_xmm: f.used_callee_xmm.clone(),
    }
}

impl<'a> FnEmitter<'a> {
    fn prologue(&mut self) -> Result<()> {
        self.asm.push(Reg::RBP)?;
        self.asm.mov(Operand::reg(Reg::RBP), Operand::reg(Reg::RSP))?;
        for &r in &self.callee_gp.clone() {
            self.asm.push(Reg::gp(r, OpSize::B64))?;
        }
        if self.frame.sub_bytes > 0 {
            self.asm.sub(
                Operand::reg(Reg::RSP),
                Operand::imm(i64::from(self.frame.sub_bytes), OpSize::B64),
            )?;
        }
        for &(r, disp) in &self.frame.xmm_saves.clone() {
            self.asm.movs_store(
                true,
                Operand::mem(Mem::base_disp(Reg::RBP, disp), OpSize::B64),
                Reg::xmm(r),
            )?;
        }
        Ok(())
    }

    fn epilogue(&mut self) -> Result<()> {
        for &(r, disp) in &self.frame.xmm_saves.clone() {
            self.asm.movs_load(
                true,
                Reg::xmm(r),
                Operand::mem(Mem::base_disp(Reg::RBP, disp), OpSize::B64),
            )?;
        }
        if self.frame.sub_bytes > 0 {
            self.asm.add(
                Operand::reg(Reg::RSP),
                Operand::imm(i64::from(self.frame.sub_bytes), OpSize::B64),
            )?;
        }
        for &r in self.callee_gp.clone().iter().rev() {
            self.asm.pop(Reg::gp(r, OpSize::B64))?;
        }
        self.asm.pop(Reg::RBP)?;
        Ok(self.asm.ret()?)
    }

    fn mem(&self, m: &MMem) -> Mem {
        Mem {
            base: m.base.map(|r| r.with_size(OpSize::B64).hw()),
            index: m.index.map(|(r, _)| r.with_size(OpSize::B64).hw()),
            scale: m.index.map(|(_, s)| s).unwrap_or(Scale::S1),
            disp: m.disp,
        }
    }

    fn slot_mem(&self, id: crate::mir::SlotId, offset: i32) -> Mem {
        Mem::base_disp(Reg::RBP, self.frame.slot_disp[id.0 as usize] + offset)
    }

    fn sym_of(&mut self, name: &str) -> SymbolId {
        match self.asm.symbol_by_name(name) {
            Some(id) => id,
            None => self.asm.global_var_declare(name),
        }
    }

    fn operand(&mut self, op: &MOperand) -> Operand {
        match op {
            MOperand::Reg(r) => Operand::reg(r.hw()),
            MOperand::Imm { value, size } => Operand::imm(*value, *size),
            MOperand::Mem { mem, size } => Operand::mem(self.mem(mem), *size),
            MOperand::Slot { id, offset, size } => {
                Operand::mem(self.slot_mem(*id, *offset), *size)
            }
            MOperand::SymMem { name, offset, size } => {
                let sym = self.sym_of(name);
                Operand::RipSym {
                    sym,
                    disp: *offset,
                    size: *size,
                }
            }
        }
    }

    fn inst(&mut self, inst: &MInst) -> Result<()> {
        match inst {
            MInst::Mov { dst, src } => {
                let d = self.operand(dst);
                let s = self.operand(src);
                Ok(self.asm.mov(d, s)?)
            }
            MInst::MovSX { dst, src } => Ok(self.asm.movsx(dst.hw(), src.hw())?),
            MInst::MovZX { dst, src } => Ok(self.asm.movzx(dst.hw(), src.hw())?),
            MInst::Alu { op, dst, src } => {
                let d = self.operand(dst);
                let s = self.operand(src);
                Ok(match op {
                    AluOp::Add => self.asm.add(d, s),
                    AluOp::Sub => self.asm.sub(d, s),
                    AluOp::And => self.asm.and(d, s),
                    AluOp::Or => self.asm.or(d, s),
                    AluOp::Xor => self.asm.xor(d, s),
                    AluOp::Cmp => self.asm.cmp(d, s),
                }?)
            }
            MInst::IMul { dst, src } => {
                let s = self.operand(src);
                Ok(self.asm.imul(dst.hw(), s)?)
            }
            MInst::Div {
                signed, divisor, ..
            } => {
                let d = self.operand(divisor);
                Ok(if *signed {
                    self.asm.idiv(d)
                } else {
                    self.asm.div(d)
                }?)
            }
            MInst::SignExtendAx { size } => Ok(if *size == OpSize::B64 {
                self.asm.cqo()
            } else {
                self.asm.cdq()
            }?),
            MInst::Neg { op } => {
                let o = self.operand(op);
                Ok(self.asm.neg(o)?)
            }
            MInst::Not { op } => {
                let o = self.operand(op);
                Ok(self.asm.not(o)?)
            }
            MInst::Shift { op, dst, count } => {
                let d = self.operand(dst);
                let c = self.operand(count);
                Ok(match op {
                    ShiftOp::Shl => self.asm.shl(d, c),
                    ShiftOp::Shr => self.asm.shr(d, c),
                    ShiftOp::Sar => self.asm.sar(d, c),
                }?)
            }
            MInst::Lea { dst, mem } => {
                let m = Operand::mem(self.mem(mem), OpSize::B64);
                Ok(self.asm.lea(dst.with_size(OpSize::B64).hw(), m)?)
            }
            MInst::LeaSlot { dst, slot, offset } => {
                let m = Operand::mem(self.slot_mem(*slot, *offset), OpSize::B64);
                Ok(self.asm.lea(dst.with_size(OpSize::B64).hw(), m)?)
            }
            MInst::LeaSym { dst, name } => {
                let sym = self.sym_of(name);
                Ok(self.asm.lea(
                    dst.with_size(OpSize::B64).hw(),
                    Operand::RipSym {
                        sym,
                        disp: 0,
                        size: OpSize::B64,
                    },
                )?)
            }
            MInst::Setcc { cc, dst } => Ok(self.asm.setcc(*cc, dst.hw())?),
            MInst::Jcc { cc, target } => {
                let l = self.block_labels[target.index()];
                Ok(self.asm.jcc(*cc, l)?)
            }
            MInst::Jmp { target } => {
                let l = self.block_labels[target.index()];
                Ok(self.asm.jmp(l)?)
            }
            MInst::CallSym { name, .. } => {
                let sym = self.asm.func_declare(name);
                Ok(self.asm.call_sym(sym)?)
            }
            MInst::CallRip { name, .. } => {
                let sym = self.sym_of(name);
                Ok(self.asm.call_rip(sym)?)
            }
            MInst::CallReg { target, .. } => Ok(self.asm.call_reg(target.hw())?),
            MInst::Ret => self.epilogue(),
            MInst::Trap => Ok(self.asm.int3()?),
            MInst::MovS { double, dst, src } => match (dst, src) {
                (MOperand::Reg(d), _) => {
                    let s = self.operand(src);
                    Ok(self.asm.movs_load(*double, d.hw(), s)?)
                }
                (_, MOperand::Reg(s)) => {
                    let d = self.operand(dst);
                    Ok(self.asm.movs_store(*double, d, s.hw())?)
                }
                _ => Err(cjit_x64::X64Error::Encoding("movs mem, mem".into()).into()),
            },
            MInst::AluS {
                double,
                op,
                dst,
                src,
            } => {
                let s = self.operand(src);
                Ok(match op {
                    FAluOp::Add => self.asm.adds(*double, dst.hw(), s),
                    FAluOp::Sub => self.asm.subs(*double, dst.hw(), s),
                    FAluOp::Mul => self.asm.muls(*double, dst.hw(), s),
                    FAluOp::Div => self.asm.divs(*double, dst.hw(), s),
                }?)
            }
            MInst::UComiS { double, a, b } => {
                let bo = self.operand(b);
                Ok(self.asm.ucomis(*double, a.hw(), bo)?)
            }
            MInst::Cvtsi2S { double, dst, src } => {
                Ok(self.asm.cvtsi2s(*double, dst.hw(), src.hw())?)
            }
            MInst::Cvtts2Si { double, dst, src } => {
                Ok(self.asm.cvtts2si(*double, dst.hw(), src.hw())?)
            }
            MInst::Cvts2S {
                to_double,
                dst,
                src,
            } => {
                let s = self.operand(src);
                Ok(self.asm.cvts2s(*to_double, dst.hw(), s)?)
            }
            MInst::Xorps { dst, src } => Ok(self.asm.xorps(dst.hw(), Operand::reg(src.hw()))?),
            MInst::MovdToXmm { dst, src } => Ok(self.asm.movd_to_xmm(dst.hw(), src.hw())?),
            MInst::MovdFromXmm { dst, src } => Ok(self.asm.movd_from_xmm(dst.hw(), src.hw())?),
        }
    }
}

/// Section-relative offsets of every defined symbol, for diagnostics and
/// tests that inspect the raw buffer before loading.
pub fn symbol_offsets(asm: &Assembler, names: &[String]) -> HashMap<String, u32> {
    names
        .iter()
        .filter_map(|n| asm.symbol_offset(n).map(|off| (n.clone(), off)))
        .collect()
}
