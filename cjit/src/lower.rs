//! SSA → machine IR lowering.
//!
//! One-to-few pattern matching per SSA opcode. `alloca`s become stack
//! objects; every other SSA value gets a virtual register sized by its
//! type. The Windows x64 calling convention is expanded entirely here
//! (argument registers, shadow space, stack arguments, variadic float
//! duplication) so the register allocator and emitter never reason about
//! the ABI.

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use cjit_front::session::Session;
use cjit_ir::inst::{
    BinOp, BlockId, Callee, CastOp, Cond, GepStep, Inst, Operand, Terminator, UnOp, ValueId,
};
use cjit_ir::module::{Function, Module};
use cjit_ir::ty::{IrTypes, TyId, TyKind};
use cjit_x64::cc::CondCode;
use cjit_x64::operand::Scale;
use cjit_x64::reg::{OpSize, Reg, RegClass};

use crate::error::Error;
use crate::mir::{
    AluOp, FAluOp, MInst, MMem, MOperand, MReg, MirBlock, MirFunction, MirModule, ShiftOp, SlotId,
};
use crate::Result;

/// Integer argument registers, in positional order.
pub const GP_ARGS: [Reg; 4] = [Reg::RCX, Reg::RDX, Reg::R8, Reg::R9];
/// Floating argument registers, in positional order.
pub const XMM_ARGS: [Reg; 4] = [Reg::XMM0, Reg::XMM1, Reg::XMM2, Reg::XMM3];

/// Lower an IR module to machine IR.
pub fn lower_module(sess: &Session, module: &Module) -> Result<MirModule> {
    let mut defined: HashSet<String> = HashSet::new();
    for g in &module.globals {
        defined.insert(sess.interner.resolve(g.name).to_owned());
    }
    for f in &module.funcs {
        defined.insert(sess.interner.resolve(f.name).to_owned());
    }

    let mut out = MirModule::default();
    let mut shared = SharedState {
        defined,
        externals: Vec::new(),
        float_consts: Vec::new(),
        float_dedup: HashMap::new(),
    };

    for func in &module.funcs {
        let lowered = Lowerer::run(sess, module, func, &mut shared)?;
        out.funcs.push(lowered);
    }

    out.float_consts = shared.float_consts;
    out.externals = shared.externals;
    debug!(
        funcs = out.funcs.len(),
        externals = out.externals.len(),
        "lowered module"
    );
    Ok(out)
}

/// Module-level state accumulated across functions.
struct SharedState {
    defined: HashSet<String>,
    externals: Vec<String>,
    float_consts: Vec<(String, Vec<u8>)>,
    float_dedup: HashMap<(u64, bool), String>,
}

impl SharedState {
    fn note_external(&mut self, name: &str) {
        if !self.defined.contains(name) && !self.externals.iter().any(|e| e == name) {
            self.externals.push(name.to_owned());
        }
    }

    fn is_external(&self, name: &str) -> bool {
        !self.defined.contains(name)
    }

    /// Pool a floating literal, deduplicated by bit pattern.
    fn float_const(&mut self, value: f64, double: bool) -> String {
        let key = (value.to_bits(), double);
        if let Some(name) = self.float_dedup.get(&key) {
            return name.clone();
        }
        let name = format!(".Lfp{}", self.float_consts.len());
        let bytes = if double {
            value.to_le_bytes().to_vec()
        } else {
            (value as f32).to_le_bytes().to_vec()
        };
        self.float_consts.push((name.clone(), bytes));
        self.float_dedup.insert(key, name.clone());
        name
    }
}

/// Where an SSA value lives.
#[derive(Debug, Clone, Copy)]
enum VLoc {
    Reg(MReg),
    Slot(SlotId),
}

/// Address forms produced while lowering memory operations.
enum Addr {
    Slot(SlotId, i32),
    Mem(MMem),
    Sym(String),
}

struct Lowerer<'a> {
    sess: &'a Session,
    module: &'a Module,
    func: &'a Function,
    shared: &'a mut SharedState,
    mf: MirFunction,
    vmap: HashMap<ValueId, VLoc>,
    cur: usize,
    phis: Vec<(BlockId, MReg, Vec<(BlockId, Operand)>)>,
}

impl<'a> Lowerer<'a> {
    fn run(
        sess: &'a Session,
        module: &'a Module,
        func: &'a Function,
        shared: &'a mut SharedState,
    ) -> Result<MirFunction> {
        let mf = MirFunction {
            name: sess.interner.resolve(func.name).to_owned(),
            internal: func.internal,
            blocks: (0..func.blocks.len()).map(|_| MirBlock::default()).collect(),
            slots: Vec::new(),
            next_vreg: crate::mir::VREG_BASE,
            max_call_args: 0,
            has_calls: false,
            used_callee_gp: Vec::new(),
            used_callee_xmm: Vec::new(),
        };
        let mut this = Lowerer {
            sess,
            module,
            func,
            shared,
            mf,
            vmap: HashMap::new(),
            cur: 0,
            phis: Vec::new(),
        };
        this.prepare_values();
        this.lower_params();
        for b in 0..this.func.blocks.len() {
            this.cur = b;
            this.lower_block(BlockId(b as u32))?;
        }
        this.insert_phi_copies()?;
        Ok(this.mf)
    }

    fn types(&self) -> &IrTypes {
        &self.module.types
    }

    fn internal_err(&self, msg: impl Into<String>) -> Error {
        Error::Internal(msg.into())
    }

    // ----- value bookkeeping -------------------------------------------

    fn class_of(&self, ty: TyId) -> RegClass {
        if self.types().is_float(ty) {
            RegClass::Xmm
        } else {
            RegClass::Gp
        }
    }

    fn gp_size(&self, ty: TyId) -> OpSize {
        OpSize::from_bytes(self.types().size_of(ty).max(1))
    }

    fn reg_for_ty(&mut self, ty: TyId) -> MReg {
        match self.class_of(ty) {
            RegClass::Xmm => self.mf.new_vreg(RegClass::Xmm, OpSize::B128),
            RegClass::Gp => {
                let size = self.gp_size(ty);
                self.mf.new_vreg(RegClass::Gp, size)
            }
        }
    }

    /// Allocate slots for allocas and virtual registers for every other
    /// value-producing instruction.
    fn prepare_values(&mut self) {
        for block in &self.func.blocks {
            for inst in &block.insts {
                match inst {
                    Inst::Alloca { dst, ty, align } => {
                        let size = self.types().size_of(*ty);
                        let slot = self.mf.new_slot(size, *align);
                        self.vmap.insert(*dst, VLoc::Slot(slot));
                    }
                    _ => {
                        if let Some(dst) = inst_dst(inst) {
                            let ty = self.func.value_ty(dst);
                            let r = self.reg_for_ty(ty);
                            self.vmap.insert(dst, VLoc::Reg(r));
                        }
                    }
                }
            }
        }
        // Parameters get registers too.
        for &p in &self.func.params {
            let ty = self.func.value_ty(p);
            let r = self.reg_for_ty(ty);
            self.vmap.insert(p, VLoc::Reg(r));
        }
    }

    fn emit(&mut self, inst: MInst) {
        self.mf.blocks[self.cur].insts.push(inst);
    }

    fn vreg_of(&self, v: ValueId) -> Result<MReg> {
        match self.vmap.get(&v) {
            Some(VLoc::Reg(r)) => Ok(*r),
            _ => Err(self.internal_err("value has no register")),
        }
    }

    // ----- parameters ---------------------------------------------------

    /// Copy incoming arguments into their virtual registers at the head of
    /// the entry block.
    fn lower_params(&mut self) {
        self.cur = 0;
        for (i, &p) in self.func.params.iter().enumerate() {
            let ty = self.func.value_ty(p);
            let Some(VLoc::Reg(dst)) = self.vmap.get(&p).copied() else {
                continue;
            };
            let is_float = self.class_of(ty) == RegClass::Xmm;
            if i < 4 {
                if is_float {
                    let src = MReg::phys(XMM_ARGS[i]);
                    self.emit(MInst::MovS {
                        double: self.types().size_of(ty) == 8,
                        dst: MOperand::reg(dst),
                        src: MOperand::reg(src),
                    });
                } else {
                    let src = MReg::phys(GP_ARGS[i]).with_size(dst.size);
                    self.emit(MInst::Mov {
                        dst: MOperand::reg(dst),
                        src: MOperand::reg(src),
                    });
                }
            } else {
                // Stack argument: above the return address and the caller's
                // 32-byte home area.
                let mem = MMem::base_disp(MReg::phys(Reg::RBP), 16 + 8 * i as i32);
                if is_float {
                    self.emit(MInst::MovS {
                        double: self.types().size_of(ty) == 8,
                        dst: MOperand::reg(dst),
                        src: MOperand::Mem {
                            mem,
                            size: OpSize::B64,
                        },
                    });
                } else {
                    self.emit(MInst::Mov {
                        dst: MOperand::reg(dst),
                        src: MOperand::Mem {
                            mem,
                            size: dst.size,
                        },
                    });
                }
            }
        }
    }

    // ----- operand lowering --------------------------------------------

    fn sym_name(&self, sym: cjit_front::intern::Sym) -> String {
        self.sess.interner.resolve(sym).to_owned()
    }

    /// Materialize the address of a named symbol into a register.
    fn symbol_addr(&mut self, name: &str) -> MReg {
        let dst = self.mf.new_vreg(RegClass::Gp, OpSize::B64);
        if self.shared.is_external(name) {
            self.shared.note_external(name);
            self.emit(MInst::Mov {
                dst: MOperand::reg(dst),
                src: MOperand::SymMem {
                    name: format!("__imp_{name}"),
                    offset: 0,
                    size: OpSize::B64,
                },
            });
        } else {
            self.emit(MInst::LeaSym {
                dst,
                name: name.to_owned(),
            });
        }
        dst
    }

    /// Lower an operand to a MIR operand usable as an ALU source.
    fn use_op(&mut self, op: &Operand) -> Result<MOperand> {
        match op {
            Operand::Value(v) => match self.vmap.get(v).copied() {
                Some(VLoc::Reg(r)) => Ok(MOperand::reg(r)),
                Some(VLoc::Slot(slot)) => {
                    let dst = self.mf.new_vreg(RegClass::Gp, OpSize::B64);
                    self.emit(MInst::LeaSlot {
                        dst,
                        slot,
                        offset: 0,
                    });
                    Ok(MOperand::reg(dst))
                }
                None => Err(self.internal_err("operand value not lowered")),
            },
            Operand::ConstInt { value, ty } => {
                let size = self.gp_size(*ty);
                Ok(MOperand::imm(*value, size))
            }
            Operand::ConstFloat { value, ty } => {
                let double = self.types().size_of(*ty) == 8;
                let name = self.shared.float_const(*value, double);
                let dst = self.mf.new_vreg(RegClass::Xmm, OpSize::B128);
                self.emit(MInst::MovS {
                    double,
                    dst: MOperand::reg(dst),
                    src: MOperand::SymMem {
                        name,
                        offset: 0,
                        size: if double { OpSize::B64 } else { OpSize::B32 },
                    },
                });
                Ok(MOperand::reg(dst))
            }
            Operand::Symbol(sym) => {
                let name = self.sym_name(*sym);
                Ok(MOperand::reg(self.symbol_addr(&name)))
            }
        }
    }

    /// Lower an operand and force it into a register.
    fn use_reg(&mut self, op: &Operand) -> Result<MReg> {
        let ty = self.operand_ir_ty(op);
        let lowered = self.use_op(op)?;
        match lowered {
            MOperand::Reg(r) => Ok(r),
            other => {
                let dst = self.reg_for_ty(ty);
                if dst.class == RegClass::Xmm {
                    self.emit(MInst::MovS {
                        double: self.types().size_of(ty) == 8,
                        dst: MOperand::reg(dst),
                        src: other,
                    });
                } else {
                    self.emit(MInst::Mov {
                        dst: MOperand::reg(dst),
                        src: other,
                    });
                }
                Ok(dst)
            }
        }
    }

    fn operand_ir_ty(&self, op: &Operand) -> TyId {
        match op {
            Operand::Value(v) => self.func.value_ty(*v),
            Operand::ConstInt { ty, .. } | Operand::ConstFloat { ty, .. } => *ty,
            Operand::Symbol(_) => IrTypes::U64,
        }
    }

    /// Widen an integer operand to a 64-bit register, honoring its sign.
    fn use_reg_wide(&mut self, op: &Operand) -> Result<MReg> {
        let ty = self.operand_ir_ty(op);
        if let Operand::ConstInt { value, .. } = op {
            let dst = self.mf.new_vreg(RegClass::Gp, OpSize::B64);
            self.emit(MInst::Mov {
                dst: MOperand::reg(dst),
                src: MOperand::imm(*value, OpSize::B64),
            });
            return Ok(dst);
        }
        let r = self.use_reg(op)?;
        if r.size == OpSize::B64 {
            return Ok(r);
        }
        let dst = self.mf.new_vreg(RegClass::Gp, OpSize::B64);
        if self.types().is_unsigned(ty) {
            self.emit(MInst::MovZX { dst, src: r });
        } else {
            self.emit(MInst::MovSX { dst, src: r });
        }
        Ok(dst)
    }

    /// Address form of a pointer operand.
    fn addr_of(&mut self, op: &Operand) -> Result<Addr> {
        match op {
            Operand::Value(v) => match self.vmap.get(v).copied() {
                Some(VLoc::Slot(slot)) => Ok(Addr::Slot(slot, 0)),
                Some(VLoc::Reg(r)) => Ok(Addr::Mem(MMem::base(r.with_size(OpSize::B64)))),
                None => Err(self.internal_err("address operand not lowered")),
            },
            Operand::Symbol(sym) => {
                let name = self.sym_name(*sym);
                if self.shared.is_external(&name) {
                    let r = self.symbol_addr(&name);
                    Ok(Addr::Mem(MMem::base(r)))
                } else {
                    Ok(Addr::Sym(name))
                }
            }
            _ => {
                let r = self.use_reg(op)?;
                Ok(Addr::Mem(MMem::base(r.with_size(OpSize::B64))))
            }
        }
    }

    fn addr_operand(&self, addr: &Addr, offset: i32, size: OpSize) -> MOperand {
        match addr {
            Addr::Slot(id, base_off) => MOperand::Slot {
                id: *id,
                offset: base_off + offset,
                size,
            },
            Addr::Mem(mem) => MOperand::Mem {
                mem: MMem {
                    disp: mem.disp + offset,
                    ..*mem
                },
                size,
            },
            Addr::Sym(name) => MOperand::SymMem {
                name: clone_name(name),
                offset,
                size,
            },
        }
    }

    // ----- blocks -------------------------------------------------------

    fn lower_block(&mut self, b: BlockId) -> Result<()> {
        let block = &self.func.blocks[b.index()];
        let insts = block.insts.clone();
        for inst in &insts {
            self.lower_inst(b, inst)?;
        }
        let term = block
            .term
            .clone()
            .ok_or_else(|| self.internal_err("unterminated block"))?;
        self.lower_terminator(&term)?;
        Ok(())
    }

    fn lower_terminator(&mut self, term: &Terminator) -> Result<()> {
        match term {
            Terminator::Br(t) => self.emit(MInst::Jmp { target: *t }),
            Terminator::CondBr {
                cond,
                then_blk,
                else_blk,
            } => match cond {
                Operand::ConstInt { value, .. } => {
                    let target = if *value != 0 { *then_blk } else { *else_blk };
                    self.emit(MInst::Jmp { target });
                }
                _ => {
                    let c = self.use_reg(cond)?;
                    self.emit(MInst::Alu {
                        op: AluOp::Cmp,
                        dst: MOperand::reg(c.with_size(OpSize::B8)),
                        src: MOperand::imm(0, OpSize::B8),
                    });
                    self.emit(MInst::Jcc {
                        cc: CondCode::Ne,
                        target: *then_blk,
                    });
                    self.emit(MInst::Jmp { target: *else_blk });
                }
            },
            Terminator::Ret(value) => {
                if let Some(v) = value {
                    let ty = self.operand_ir_ty(v);
                    if self.class_of(ty) == RegClass::Xmm {
                        let src = self.use_op(v)?;
                        self.emit(MInst::MovS {
                            double: self.types().size_of(ty) == 8,
                            dst: MOperand::reg(MReg::phys(Reg::XMM0)),
                            src,
                        });
                    } else {
                        let src = self.use_op(v)?;
                        let size = src.size();
                        self.emit(MInst::Mov {
                            dst: MOperand::reg(MReg::phys(Reg::RAX).with_size(size)),
                            src,
                        });
                    }
                }
                self.emit(MInst::Ret);
            }
            Terminator::Unreachable => self.emit(MInst::Trap),
        }
        Ok(())
    }

    fn lower_inst(&mut self, b: BlockId, inst: &Inst) -> Result<()> {
        match inst {
            Inst::Alloca { .. } => Ok(()),
            Inst::Bin { op, dst, lhs, rhs } => self.lower_bin(*op, *dst, lhs, rhs),
            Inst::Un { op, dst, src } => self.lower_un(*op, *dst, src),
            Inst::Cmp {
                cond,
                dst,
                lhs,
                rhs,
            } => self.lower_cmp(*cond, *dst, lhs, rhs),
            Inst::Load { dst, addr } => self.lower_load(*dst, addr),
            Inst::Store { addr, value } => self.lower_store(addr, value),
            Inst::Gep { dst, base, steps } => self.lower_gep(*dst, base, steps),
            Inst::Cast { op, dst, src } => self.lower_cast(*op, *dst, src),
            Inst::Call {
                dst,
                callee,
                args,
                sret: _,
                variadic,
            } => self.lower_call(*dst, callee, args, *variadic),
            Inst::Phi { dst, incoming } => {
                let r = self.vreg_of(*dst)?;
                self.phis.push((b, r, incoming.clone()));
                Ok(())
            }
            Inst::MemCpy { dst, src, len } => self.lower_memcpy(dst, src, *len),
            Inst::MemSet { dst, value, len } => self.lower_memset(dst, *value, *len),
        }
    }

    // ----- integer / float arithmetic ----------------------------------

    fn lower_bin(&mut self, op: BinOp, dst: ValueId, lhs: &Operand, rhs: &Operand) -> Result<()> {
        let ty = self.func.value_ty(dst);
        let d = self.vreg_of(dst)?;

        if self.class_of(ty) == RegClass::Xmm {
            let double = self.types().size_of(ty) == 8;
            let l = self.use_op(lhs)?;
            self.emit(MInst::MovS {
                double,
                dst: MOperand::reg(d),
                src: l,
            });
            let r = self.use_reg(rhs)?;
            let fop = match op {
                BinOp::Add => FAluOp::Add,
                BinOp::Sub => FAluOp::Sub,
                BinOp::Mul => FAluOp::Mul,
                BinOp::Div => FAluOp::Div,
                _ => return Err(self.internal_err("bitwise op on float")),
            };
            self.emit(MInst::AluS {
                double,
                op: fop,
                dst: d,
                src: MOperand::reg(r),
            });
            return Ok(());
        }

        let unsigned = self.types().is_unsigned(ty);
        match op {
            BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or | BinOp::Xor => {
                let alu = match op {
                    BinOp::Add => AluOp::Add,
                    BinOp::Sub => AluOp::Sub,
                    BinOp::And => AluOp::And,
                    BinOp::Or => AluOp::Or,
                    _ => AluOp::Xor,
                };
                self.move_into(d, lhs)?;
                let src = self.alu_src(rhs, d.size)?;
                self.emit(MInst::Alu {
                    op: alu,
                    dst: MOperand::reg(d),
                    src,
                });
                Ok(())
            }
            BinOp::Mul => {
                // imul has no 8-bit two-operand form; compute at 32 bits.
                let wide = if d.size == OpSize::B8 {
                    OpSize::B32
                } else {
                    d.size
                };
                self.move_into(d, lhs)?;
                let r = self.use_reg(rhs)?;
                self.emit(MInst::IMul {
                    dst: d.with_size(wide),
                    src: MOperand::reg(r.with_size(wide)),
                });
                Ok(())
            }
            BinOp::Div | BinOp::Rem => self.lower_div(d, ty, op == BinOp::Rem, unsigned, lhs, rhs),
            BinOp::Shl | BinOp::Shr => {
                self.move_into(d, lhs)?;
                let shift = match op {
                    BinOp::Shl => ShiftOp::Shl,
                    _ if unsigned => ShiftOp::Shr,
                    _ => ShiftOp::Sar,
                };
                match rhs {
                    Operand::ConstInt { value, .. } => {
                        self.emit(MInst::Shift {
                            op: shift,
                            dst: MOperand::reg(d),
                            count: MOperand::imm(*value, OpSize::B8),
                        });
                    }
                    _ => {
                        // Variable count goes through cl.
                        let c = self.use_reg(rhs)?;
                        self.emit(MInst::Mov {
                            dst: MOperand::reg(MReg::phys(Reg::RCX).with_size(c.size)),
                            src: MOperand::reg(c),
                        });
                        self.emit(MInst::Shift {
                            op: shift,
                            dst: MOperand::reg(d),
                            count: MOperand::reg(MReg::phys(Reg::CL)),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Signed: sign-extend into rdx:rax, `idiv`; unsigned: zero rdx, `div`.
    /// Quotient in rax, remainder in rdx. Sub-32-bit operands widen first.
    fn lower_div(
        &mut self,
        d: MReg,
        ty: TyId,
        want_rem: bool,
        unsigned: bool,
        lhs: &Operand,
        rhs: &Operand,
    ) -> Result<()> {
        let size = self.gp_size(ty);
        let wide = if size == OpSize::B64 {
            OpSize::B64
        } else {
            OpSize::B32
        };
        let rax = MReg::phys(Reg::RAX).with_size(wide);
        let rdx = MReg::phys(Reg::RDX).with_size(wide);

        // Dividend into rax, widened as needed.
        let l = self.use_reg(lhs)?;
        if l.size < wide {
            if unsigned {
                self.emit(MInst::MovZX { dst: rax, src: l });
            } else {
                self.emit(MInst::MovSX { dst: rax, src: l });
            }
        } else {
            self.emit(MInst::Mov {
                dst: MOperand::reg(rax),
                src: MOperand::reg(l.with_size(wide)),
            });
        }

        // Divisor in a register, widened as needed.
        let r = self.use_reg(rhs)?;
        let divisor = if r.size < wide {
            let t = self.mf.new_vreg(RegClass::Gp, wide);
            if unsigned {
                self.emit(MInst::MovZX { dst: t, src: r });
            } else {
                self.emit(MInst::MovSX { dst: t, src: r });
            }
            t
        } else {
            r.with_size(wide)
        };

        if unsigned {
            self.emit(MInst::Alu {
                op: AluOp::Xor,
                dst: MOperand::reg(rdx.with_size(OpSize::B32)),
                src: MOperand::reg(rdx.with_size(OpSize::B32)),
            });
        } else {
            self.emit(MInst::SignExtendAx { size: wide });
        }
        self.emit(MInst::Div {
            signed: !unsigned,
            divisor: MOperand::reg(divisor),
            size: wide,
        });

        let result = if want_rem { rdx } else { rax };
        self.emit(MInst::Mov {
            dst: MOperand::reg(d),
            src: MOperand::reg(result.with_size(d.size)),
        });
        Ok(())
    }

    fn lower_un(&mut self, op: UnOp, dst: ValueId, src: &Operand) -> Result<()> {
        let ty = self.func.value_ty(dst);
        let d = self.vreg_of(dst)?;
        if self.class_of(ty) == RegClass::Xmm {
            // -x as 0.0 - x.
            let double = self.types().size_of(ty) == 8;
            let s = self.use_reg(src)?;
            self.emit(MInst::Xorps { dst: d, src: d });
            self.emit(MInst::AluS {
                double,
                op: FAluOp::Sub,
                dst: d,
                src: MOperand::reg(s),
            });
            return Ok(());
        }
        self.move_into(d, src)?;
        match op {
            UnOp::Neg => self.emit(MInst::Neg {
                op: MOperand::reg(d),
            }),
            UnOp::Not => self.emit(MInst::Not {
                op: MOperand::reg(d),
            }),
        }
        Ok(())
    }

    fn lower_cmp(&mut self, cond: Cond, dst: ValueId, lhs: &Operand, rhs: &Operand) -> Result<()> {
        let d = self.vreg_of(dst)?;
        let lty = self.operand_ir_ty(lhs);
        if self.class_of(lty) == RegClass::Xmm {
            let double = self.types().size_of(lty) == 8;
            let a = self.use_reg(lhs)?;
            let b = self.use_op(rhs)?;
            self.emit(MInst::UComiS { double, a, b });
        } else {
            let a = self.use_reg(lhs)?;
            let b = self.alu_src(rhs, a.size)?;
            self.emit(MInst::Alu {
                op: AluOp::Cmp,
                dst: MOperand::reg(a),
                src: b,
            });
        }
        self.emit(MInst::Setcc {
            cc: cond_to_cc(cond),
            dst: d.with_size(OpSize::B8),
        });
        Ok(())
    }

    /// Copy `src` into the destination register.
    fn move_into(&mut self, d: MReg, src: &Operand) -> Result<()> {
        if d.class == RegClass::Xmm {
            let ty = self.operand_ir_ty(src);
            let double = self.types().size_of(ty) == 8;
            let s = self.use_op(src)?;
            self.emit(MInst::MovS {
                double,
                dst: MOperand::reg(d),
                src: s,
            });
            return Ok(());
        }
        let s = self.use_op(src)?;
        let s = match s {
            MOperand::Reg(r) => MOperand::reg(r.with_size(d.size)),
            other => other,
        };
        self.emit(MInst::Mov {
            dst: MOperand::reg(d),
            src: s,
        });
        Ok(())
    }

    /// ALU source: immediates that fit a sign-extended 32-bit field stay
    /// immediate, everything else lands in a register.
    fn alu_src(&mut self, op: &Operand, size: OpSize) -> Result<MOperand> {
        if let Operand::ConstInt { value, .. } = op {
            if cjit_x64::operand::Operand::imm_fits_i32(*value) {
                return Ok(MOperand::imm(*value, size));
            }
            let t = self.mf.new_vreg(RegClass::Gp, OpSize::B64);
            self.emit(MInst::Mov {
                dst: MOperand::reg(t),
                src: MOperand::imm(*value, OpSize::B64),
            });
            return Ok(MOperand::reg(t.with_size(size)));
        }
        let r = self.use_reg(op)?;
        Ok(MOperand::reg(r.with_size(size)))
    }

    // ----- memory -------------------------------------------------------

    fn lower_load(&mut self, dst: ValueId, addr: &Operand) -> Result<()> {
        let ty = self.func.value_ty(dst);
        let d = self.vreg_of(dst)?;
        let a = self.addr_of(addr)?;
        if self.class_of(ty) == RegClass::Xmm {
            let double = self.types().size_of(ty) == 8;
            let src = self.addr_operand(&a, 0, self.gp_size(ty));
            self.emit(MInst::MovS {
                double,
                dst: MOperand::reg(d),
                src,
            });
        } else {
            let src = self.addr_operand(&a, 0, d.size);
            self.emit(MInst::Mov {
                dst: MOperand::reg(d),
                src,
            });
        }
        Ok(())
    }

    fn lower_store(&mut self, addr: &Operand, value: &Operand) -> Result<()> {
        let ty = self.operand_ir_ty(value);
        let a = self.addr_of(addr)?;
        if self.class_of(ty) == RegClass::Xmm {
            let double = self.types().size_of(ty) == 8;
            let v = self.use_reg(value)?;
            let dst = self.addr_operand(&a, 0, self.gp_size(ty));
            self.emit(MInst::MovS {
                double,
                dst,
                src: MOperand::reg(v),
            });
            return Ok(());
        }
        let size = self.gp_size(ty);
        let dst = self.addr_operand(&a, 0, size);
        match value {
            Operand::ConstInt { value, .. }
                if cjit_x64::operand::Operand::imm_fits_i32(*value) =>
            {
                self.emit(MInst::Mov {
                    dst,
                    src: MOperand::imm(*value, size),
                });
            }
            _ => {
                let v = self.use_reg(value)?;
                self.emit(MInst::Mov {
                    dst,
                    src: MOperand::reg(v.with_size(size)),
                });
            }
        }
        Ok(())
    }

    /// Fold GEP steps into as few `lea`s as possible: constant indices and
    /// field offsets accumulate into the displacement; one scaled variable
    /// index rides along when the scale is 1/2/4/8.
    fn lower_gep(&mut self, dst: ValueId, base: &Operand, steps: &[GepStep]) -> Result<()> {
        let d = self.vreg_of(dst)?;
        let mut addr = self.addr_of(base)?;
        let mut index: Option<(MReg, Scale)> = None;
        let mut disp: i64 = 0;

        for step in steps {
            match step {
                GepStep::Field { of, index: fi } => {
                    let offset = match self.types().kind(*of) {
                        TyKind::Struct { fields, .. } => fields[*fi as usize].offset,
                        _ => return Err(self.internal_err("field step on non-struct")),
                    };
                    disp += i64::from(offset);
                }
                GepStep::Index {
                    index: iop,
                    elem,
                } => {
                    let elem_size = i64::from(self.types().size_of(*elem));
                    match iop {
                        Operand::ConstInt { value, .. } => {
                            disp += value * elem_size;
                        }
                        _ => {
                            let idx = self.use_reg_wide(iop)?;
                            let scaled = match Scale::from_bytes(elem_size as u32) {
                                Some(s) => (idx, s),
                                None => {
                                    // Irregular element size: multiply out.
                                    let t = self.mf.new_vreg(RegClass::Gp, OpSize::B64);
                                    self.emit(MInst::Mov {
                                        dst: MOperand::reg(t),
                                        src: MOperand::imm(elem_size, OpSize::B64),
                                    });
                                    self.emit(MInst::IMul {
                                        dst: t,
                                        src: MOperand::reg(idx),
                                    });
                                    (t, Scale::S1)
                                }
                            };
                            if index.is_some() {
                                // Second variable index: flush what we have.
                                let flushed = self.flush_addr(addr, index, disp)?;
                                addr = Addr::Mem(MMem::base(flushed));
                                index = None;
                                disp = 0;
                            }
                            index = Some(scaled);
                        }
                    }
                }
            }
        }

        self.flush_addr_into(d, addr, index, disp)?;
        Ok(())
    }

    /// Emit `lea tmp, [form]` and return the temporary.
    fn flush_addr(
        &mut self,
        addr: Addr,
        index: Option<(MReg, Scale)>,
        disp: i64,
    ) -> Result<MReg> {
        let t = self.mf.new_vreg(RegClass::Gp, OpSize::B64);
        self.flush_addr_into(t, addr, index, disp)?;
        Ok(t)
    }

    fn flush_addr_into(
        &mut self,
        dst: MReg,
        addr: Addr,
        index: Option<(MReg, Scale)>,
        disp: i64,
    ) -> Result<MReg> {
        let disp32 = i32::try_from(disp)
            .map_err(|_| self.internal_err("address displacement overflow"))?;
        match addr {
            Addr::Slot(slot, off) => {
                if let Some((idx, scale)) = index {
                    let t = self.mf.new_vreg(RegClass::Gp, OpSize::B64);
                    self.emit(MInst::LeaSlot {
                        dst: t,
                        slot,
                        offset: off,
                    });
                    self.emit(MInst::Lea {
                        dst,
                        mem: MMem {
                            base: Some(t),
                            index: Some((idx, scale)),
                            disp: disp32,
                        },
                    });
                } else {
                    self.emit(MInst::LeaSlot {
                        dst,
                        slot,
                        offset: off + disp32,
                    });
                }
            }
            Addr::Mem(mem) => {
                self.emit(MInst::Lea {
                    dst,
                    mem: MMem {
                        base: mem.base,
                        index: index.or(mem.index),
                        disp: mem.disp + disp32,
                    },
                });
            }
            Addr::Sym(name) => {
                let t = self.mf.new_vreg(RegClass::Gp, OpSize::B64);
                self.emit(MInst::LeaSym { dst: t, name });
                if index.is_some() || disp32 != 0 {
                    self.emit(MInst::Lea {
                        dst,
                        mem: MMem {
                            base: Some(t),
                            index,
                            disp: disp32,
                        },
                    });
                } else {
                    self.emit(MInst::Mov {
                        dst: MOperand::reg(dst),
                        src: MOperand::reg(t),
                    });
                }
            }
        }
        Ok(dst)
    }

    // ----- casts --------------------------------------------------------

    fn lower_cast(&mut self, op: CastOp, dst: ValueId, src: &Operand) -> Result<()> {
        let d = self.vreg_of(dst)?;
        let src_ty = self.operand_ir_ty(src);
        match op {
            CastOp::Bitcast | CastOp::IntToPtr | CastOp::PtrToInt => self.move_into(d, src),
            CastOp::Trunc => {
                let s = self.use_reg(src)?;
                self.emit(MInst::Mov {
                    dst: MOperand::reg(d),
                    src: MOperand::reg(s.with_size(d.size)),
                });
                Ok(())
            }
            CastOp::Zext => {
                let s = self.use_reg(src)?;
                self.emit(MInst::MovZX { dst: d, src: s });
                Ok(())
            }
            CastOp::Sext => {
                let s = self.use_reg(src)?;
                self.emit(MInst::MovSX { dst: d, src: s });
                Ok(())
            }
            CastOp::FpExt | CastOp::FpTrunc => {
                let s = self.use_op(src)?;
                self.emit(MInst::Cvts2S {
                    to_double: op == CastOp::FpExt,
                    dst: d,
                    src: s,
                });
                Ok(())
            }
            CastOp::SiToFp | CastOp::UiToFp => {
                let s = self.use_reg(src)?;
                let double = self.types().size_of(self.func.value_ty(dst)) == 8;
                self.emit(MInst::Cvtsi2S {
                    double,
                    dst: d,
                    src: s,
                });
                Ok(())
            }
            CastOp::FpToSi | CastOp::FpToUi => {
                let s = self.use_reg(src)?;
                let double = self.types().size_of(src_ty) == 8;
                self.emit(MInst::Cvtts2Si {
                    double,
                    dst: d,
                    src: s,
                });
                Ok(())
            }
        }
    }

    // ----- calls --------------------------------------------------------

    fn lower_call(
        &mut self,
        dst: Option<ValueId>,
        callee: &Callee,
        args: &[Operand],
        variadic: bool,
    ) -> Result<()> {
        self.mf.has_calls = true;
        self.mf.max_call_args = self.mf.max_call_args.max(args.len());

        // Evaluate every argument before the first move into a fixed
        // register, so later evaluations cannot clobber earlier moves.
        let mut values: Vec<(MOperand, bool, bool)> = Vec::with_capacity(args.len());
        for arg in args {
            let ty = self.operand_ir_ty(arg);
            let is_float = self.class_of(ty) == RegClass::Xmm;
            let double = self.types().size_of(ty) == 8;
            let v = if is_float {
                MOperand::reg(self.use_reg(arg)?)
            } else {
                self.alu_src(arg, self.gp_size(ty))?
            };
            values.push((v, is_float, double));
        }

        let mut uses: Vec<MReg> = Vec::new();
        for (i, (v, is_float, double)) in values.iter().enumerate() {
            if i < 4 {
                if *is_float {
                    let xmm = MReg::phys(XMM_ARGS[i]);
                    self.emit(MInst::MovS {
                        double: *double,
                        dst: MOperand::reg(xmm),
                        src: v.clone(),
                    });
                    uses.push(xmm);
                    if variadic {
                        // Win64 varargs: duplicate the float bits into the
                        // matching integer register.
                        let gp = MReg::phys(GP_ARGS[i]);
                        self.emit(MInst::MovdFromXmm { dst: gp, src: xmm });
                        uses.push(gp);
                    }
                } else {
                    let gp = MReg::phys(GP_ARGS[i]).with_size(v.size());
                    self.emit(MInst::Mov {
                        dst: MOperand::reg(gp),
                        src: v.clone(),
                    });
                    uses.push(gp.with_size(OpSize::B64));
                }
            } else {
                // Stack argument at [rsp + 8*i], above the shadow space.
                let mem = MMem::base_disp(MReg::phys(Reg::RSP), 8 * i as i32);
                if *is_float {
                    self.emit(MInst::MovS {
                        double: *double,
                        dst: MOperand::Mem {
                            mem,
                            size: OpSize::B64,
                        },
                        src: v.clone(),
                    });
                } else {
                    let src = match v {
                        MOperand::Imm { value, .. } => MOperand::imm(*value, OpSize::B64),
                        MOperand::Reg(r) => MOperand::reg(r.with_size(OpSize::B64)),
                        other => other.clone(),
                    };
                    self.emit(MInst::Mov {
                        dst: MOperand::Mem {
                            mem,
                            size: OpSize::B64,
                        },
                        src,
                    });
                }
            }
        }

        // Result register.
        let def = dst
            .map(|v| -> Result<MReg> {
                let ty = self.func.value_ty(v);
                if self.class_of(ty) == RegClass::Xmm {
                    Ok(MReg::phys(Reg::XMM0))
                } else {
                    Ok(MReg::phys(Reg::RAX).with_size(self.gp_size(ty)))
                }
            })
            .transpose()?;

        match callee {
            Callee::Symbol(sym) => {
                let name = self.sym_name(*sym);
                if self.shared.is_external(&name) {
                    self.shared.note_external(&name);
                    self.emit(MInst::CallRip {
                        name: format!("__imp_{name}"),
                        uses,
                        def,
                    });
                } else {
                    self.emit(MInst::CallSym { name, uses, def });
                }
            }
            Callee::Indirect(target) => {
                let t = self.use_reg(target)?;
                self.emit(MInst::CallReg {
                    target: t.with_size(OpSize::B64),
                    uses,
                    def,
                });
            }
        }

        if let (Some(v), Some(ret)) = (dst, def) {
            let d = self.vreg_of(v)?;
            let ty = self.func.value_ty(v);
            if self.class_of(ty) == RegClass::Xmm {
                self.emit(MInst::MovS {
                    double: self.types().size_of(ty) == 8,
                    dst: MOperand::reg(d),
                    src: MOperand::reg(ret),
                });
            } else {
                self.emit(MInst::Mov {
                    dst: MOperand::reg(d),
                    src: MOperand::reg(ret.with_size(d.size)),
                });
            }
        }
        Ok(())
    }

    // ----- memcpy / memset ---------------------------------------------

    const UNROLL_LIMIT: u64 = 64;

    fn lower_memcpy(&mut self, dst: &Operand, src: &Operand, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if len <= Self::UNROLL_LIMIT {
            let d = self.addr_of(dst)?;
            let s = self.addr_of(src)?;
            let mut off = 0u64;
            for chunk in [8u64, 4, 2, 1] {
                while len - off >= chunk {
                    let size = OpSize::from_bytes(chunk as u32);
                    let t = self.mf.new_vreg(RegClass::Gp, size);
                    let from = self.addr_operand(&s, off as i32, size);
                    self.emit(MInst::Mov {
                        dst: MOperand::reg(t),
                        src: from,
                    });
                    let to = self.addr_operand(&d, off as i32, size);
                    self.emit(MInst::Mov {
                        dst: to,
                        src: MOperand::reg(t),
                    });
                    off += chunk;
                    if off == len {
                        return Ok(());
                    }
                }
            }
            return Ok(());
        }
        // Large copy: call the runtime routine.
        self.call_mem_intrinsic("memcpy", dst, src, None, len)
    }

    fn lower_memset(&mut self, dst: &Operand, value: u8, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if len <= Self::UNROLL_LIMIT {
            let d = self.addr_of(dst)?;
            let splat = |chunk: u64| -> i64 {
                let mut v: u64 = 0;
                for _ in 0..chunk {
                    v = (v << 8) | u64::from(value);
                }
                v as i64
            };
            let mut off = 0u64;
            for chunk in [8u64, 4, 2, 1] {
                // 8-byte splats of a nonzero byte exceed imm32; stop at 4.
                if chunk == 8 && value != 0 {
                    continue;
                }
                while len - off >= chunk {
                    let size = OpSize::from_bytes(chunk as u32);
                    let to = self.addr_operand(&d, off as i32, size);
                    self.emit(MInst::Mov {
                        dst: to,
                        src: MOperand::imm(splat(chunk), size),
                    });
                    off += chunk;
                    if off == len {
                        return Ok(());
                    }
                }
            }
            return Ok(());
        }
        self.call_mem_intrinsic("memset", dst, dst, Some(value), len)
    }

    fn call_mem_intrinsic(
        &mut self,
        name: &str,
        dst: &Operand,
        src: &Operand,
        fill: Option<u8>,
        len: u64,
    ) -> Result<()> {
        self.mf.has_calls = true;
        self.mf.max_call_args = self.mf.max_call_args.max(3);

        let d = self.use_reg(dst)?;
        self.emit(MInst::Mov {
            dst: MOperand::reg(MReg::phys(Reg::RCX)),
            src: MOperand::reg(d.with_size(OpSize::B64)),
        });
        match fill {
            Some(byte) => {
                self.emit(MInst::Mov {
                    dst: MOperand::reg(MReg::phys(Reg::RDX)),
                    src: MOperand::imm(i64::from(byte), OpSize::B64),
                });
            }
            None => {
                let s = self.use_reg(src)?;
                self.emit(MInst::Mov {
                    dst: MOperand::reg(MReg::phys(Reg::RDX)),
                    src: MOperand::reg(s.with_size(OpSize::B64)),
                });
            }
        }
        self.emit(MInst::Mov {
            dst: MOperand::reg(MReg::phys(Reg::R8)),
            src: MOperand::imm(len as i64, OpSize::B64),
        });

        self.shared.note_external(name);
        self.emit(MInst::CallRip {
            name: format!("__imp_{name}"),
            uses: vec![
                MReg::phys(Reg::RCX),
                MReg::phys(Reg::RDX),
                MReg::phys(Reg::R8),
            ],
            def: Some(MReg::phys(Reg::RAX)),
        });
        Ok(())
    }

    // ----- phi elimination ---------------------------------------------

    /// Turn each phi into copies at the tails of its predecessors. The
    /// builder only creates phis whose predecessors end in an unconditional
    /// jump, so inserting right before that jump is always safe.
    fn insert_phi_copies(&mut self) -> Result<()> {
        let phis = core::mem::take(&mut self.phis);
        for (_merge, dst, incoming) in phis {
            for (pred, op) in incoming {
                self.cur = pred.index();
                let jump = self.mf.blocks[self.cur]
                    .insts
                    .pop()
                    .ok_or_else(|| self.internal_err("empty predecessor block"))?;
                if !matches!(jump, MInst::Jmp { .. }) {
                    return Err(self.internal_err("phi predecessor does not end in jmp"));
                }
                self.move_into(dst, &op)?;
                self.mf.blocks[self.cur].insts.push(jump);
            }
        }
        Ok(())
    }
}

fn clone_name(name: &str) -> String {
    name.to_owned()
}

fn inst_dst(inst: &Inst) -> Option<ValueId> {
    match inst {
        Inst::Bin { dst, .. }
        | Inst::Un { dst, .. }
        | Inst::Cmp { dst, .. }
        | Inst::Load { dst, .. }
        | Inst::Gep { dst, .. }
        | Inst::Cast { dst, .. }
        | Inst::Phi { dst, .. } => Some(*dst),
        Inst::Call { dst, .. } => *dst,
        Inst::Alloca { .. } | Inst::Store { .. } | Inst::MemCpy { .. } | Inst::MemSet { .. } => {
            None
        }
    }
}

fn cond_to_cc(c: Cond) -> CondCode {
    match c {
        Cond::Eq => CondCode::E,
        Cond::Ne => CondCode::Ne,
        Cond::SLt => CondCode::L,
        Cond::SLe => CondCode::Le,
        Cond::SGt => CondCode::Nle,
        Cond::SGe => CondCode::Nl,
        Cond::ULt => CondCode::B,
        Cond::ULe => CondCode::Be,
        Cond::UGt => CondCode::Nbe,
        Cond::UGe => CondCode::Nb,
    }
}
