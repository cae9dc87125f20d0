//! Machine IR.
//!
//! Instructions mirror the x86-64 subset the encoder supports, but operate
//! on a mix of hardware registers and virtual registers. Virtual ids start
//! at [`VREG_BASE`] so they can never collide with hardware ids. The CFG
//! and block ids are carried over from the SSA module unchanged.

use cjit_ir::inst::BlockId;
use cjit_x64::cc::CondCode;
use cjit_x64::operand::Scale;
use cjit_x64::reg::{OpSize, Reg, RegClass};

/// First virtual register id.
pub const VREG_BASE: u32 = 64;

// Hardware ids stop at 15; the gap keeps the two spaces unmistakable.
static_assertions::const_assert!(VREG_BASE > 15);

/// A machine register: hardware when `id < 16`, virtual when
/// `id >= VREG_BASE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MReg {
    /// Register id.
    pub id: u32,
    /// Register class.
    pub class: RegClass,
    /// Operand width.
    pub size: OpSize,
}

impl MReg {
    /// Wrap a hardware register.
    pub fn phys(reg: Reg) -> Self {
        Self {
            id: u32::from(reg.id()),
            class: reg.class(),
            size: reg.size(),
        }
    }

    /// Whether this is a virtual register.
    pub fn is_virtual(&self) -> bool {
        self.id >= VREG_BASE
    }

    /// Same register at another width.
    pub fn with_size(self, size: OpSize) -> Self {
        Self { size, ..self }
    }

    /// The hardware register; panics on virtual registers, which must have
    /// been rewritten by the allocator before encoding.
    pub fn hw(&self) -> Reg {
        assert!(!self.is_virtual(), "unallocated virtual register");
        match self.class {
            RegClass::Gp => Reg::gp(self.id as u8, self.size),
            RegClass::Xmm => Reg::xmm(self.id as u8),
        }
    }
}

/// Id of a stack object within a function frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u32);

/// A fixed-size, fixed-alignment region in the callee frame.
#[derive(Debug, Clone, Copy)]
pub struct StackSlot {
    /// Size in bytes.
    pub size: u32,
    /// Alignment in bytes.
    pub align: u32,
    /// RBP-relative displacement, filled in by frame layout.
    pub disp: i32,
}

/// A `[base + index*scale + disp]` reference over machine registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MMem {
    /// Base register.
    pub base: Option<MReg>,
    /// Scaled index register.
    pub index: Option<(MReg, Scale)>,
    /// Displacement.
    pub disp: i32,
}

impl MMem {
    /// `[base]`
    pub fn base(base: MReg) -> Self {
        Self {
            base: Some(base),
            index: None,
            disp: 0,
        }
    }

    /// `[base + disp]`
    pub fn base_disp(base: MReg, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: None,
            disp,
        }
    }
}

/// MIR operand forms.
#[derive(Debug, Clone, PartialEq)]
pub enum MOperand {
    /// Register (hardware or virtual).
    Reg(MReg),
    /// Sized immediate.
    Imm {
        /// Value.
        value: i64,
        /// Width.
        size: OpSize,
    },
    /// Memory reference.
    Mem {
        /// Address.
        mem: MMem,
        /// Access width.
        size: OpSize,
    },
    /// Frame slot; becomes an RBP-relative memory reference after layout.
    Slot {
        /// Slot id.
        id: SlotId,
        /// Extra displacement into the slot.
        offset: i32,
        /// Access width.
        size: OpSize,
    },
    /// RIP-relative access to a named symbol's storage.
    SymMem {
        /// Symbol name.
        name: String,
        /// Extra displacement past the symbol start.
        offset: i32,
        /// Access width.
        size: OpSize,
    },
}

impl MOperand {
    /// Register operand.
    pub fn reg(r: MReg) -> Self {
        Self::Reg(r)
    }

    /// Immediate operand.
    pub fn imm(value: i64, size: OpSize) -> Self {
        Self::Imm { value, size }
    }

    /// Operand width.
    pub fn size(&self) -> OpSize {
        match self {
            Self::Reg(r) => r.size,
            Self::Imm { size, .. }
            | Self::Mem { size, .. }
            | Self::Slot { size, .. }
            | Self::SymMem { size, .. } => *size,
        }
    }
}

/// Two-operand integer ALU opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    /// `add`
    Add,
    /// `sub`
    Sub,
    /// `and`
    And,
    /// `or`
    Or,
    /// `xor`
    Xor,
    /// `cmp`
    Cmp,
}

/// Shift opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    /// `shl`
    Shl,
    /// `shr`
    Shr,
    /// `sar`
    Sar,
}

/// Scalar SSE arithmetic opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FAluOp {
    /// `adds[sd]`
    Add,
    /// `subs[sd]`
    Sub,
    /// `muls[sd]`
    Mul,
    /// `divs[sd]`
    Div,
}

/// MIR instructions.
#[derive(Debug, Clone, PartialEq)]
pub enum MInst {
    /// Integer move (register/memory/immediate forms).
    Mov {
        /// Destination.
        dst: MOperand,
        /// Source.
        src: MOperand,
    },
    /// Sign-extending move.
    MovSX {
        /// Destination (wider).
        dst: MReg,
        /// Source.
        src: MReg,
    },
    /// Zero-extending move.
    MovZX {
        /// Destination (wider).
        dst: MReg,
        /// Source.
        src: MReg,
    },
    /// Integer ALU op (including `cmp`).
    Alu {
        /// Opcode.
        op: AluOp,
        /// Destination / left operand.
        dst: MOperand,
        /// Source / right operand.
        src: MOperand,
    },
    /// Two-operand signed multiply.
    IMul {
        /// Destination / left operand.
        dst: MReg,
        /// Right operand.
        src: MOperand,
    },
    /// `idiv`/`div`; dividend in rdx:rax, quotient → rax, remainder → rdx.
    Div {
        /// Signed division.
        signed: bool,
        /// Divisor (register or memory).
        divisor: MOperand,
        /// Operand width (32 or 64).
        size: OpSize,
    },
    /// `cdq` (32-bit) or `cqo` (64-bit).
    SignExtendAx {
        /// Width.
        size: OpSize,
    },
    /// Two's-complement negate.
    Neg {
        /// Operand.
        op: MOperand,
    },
    /// One's-complement.
    Not {
        /// Operand.
        op: MOperand,
    },
    /// Shift; count is `cl` or an immediate.
    Shift {
        /// Opcode.
        op: ShiftOp,
        /// Shifted operand.
        dst: MOperand,
        /// Count: `Reg(cl)` or `Imm`.
        count: MOperand,
    },
    /// Address computation.
    Lea {
        /// Destination.
        dst: MReg,
        /// Address.
        mem: MMem,
    },
    /// `lea dst, [rbp + slot]`.
    LeaSlot {
        /// Destination.
        dst: MReg,
        /// Frame slot.
        slot: SlotId,
        /// Extra displacement into the slot.
        offset: i32,
    },
    /// `lea dst, [rip + symbol]`.
    LeaSym {
        /// Destination.
        dst: MReg,
        /// Symbol name.
        name: String,
    },
    /// Flag materialization into an 8-bit register.
    Setcc {
        /// Condition.
        cc: CondCode,
        /// Destination (8-bit).
        dst: MReg,
    },
    /// Conditional branch.
    Jcc {
        /// Condition.
        cc: CondCode,
        /// Target block.
        target: BlockId,
    },
    /// Unconditional branch.
    Jmp {
        /// Target block.
        target: BlockId,
    },
    /// Direct call to a module function.
    CallSym {
        /// Callee name.
        name: String,
        /// Argument registers read by the call.
        uses: Vec<MReg>,
        /// Result register written by the call.
        def: Option<MReg>,
    },
    /// Call through an external-symbol stub slot.
    CallRip {
        /// Stub slot symbol name.
        name: String,
        /// Argument registers read by the call.
        uses: Vec<MReg>,
        /// Result register written by the call.
        def: Option<MReg>,
    },
    /// Indirect call through a register.
    CallReg {
        /// Callee address.
        target: MReg,
        /// Argument registers read by the call.
        uses: Vec<MReg>,
        /// Result register written by the call.
        def: Option<MReg>,
    },
    /// Return; the emitter expands the epilogue in place.
    Ret,
    /// Trap for unreachable control flow.
    Trap,
    /// Scalar SSE move.
    MovS {
        /// Double precision.
        double: bool,
        /// Destination.
        dst: MOperand,
        /// Source.
        src: MOperand,
    },
    /// Scalar SSE arithmetic.
    AluS {
        /// Double precision.
        double: bool,
        /// Opcode.
        op: FAluOp,
        /// Destination / left operand (XMM).
        dst: MReg,
        /// Right operand.
        src: MOperand,
    },
    /// Scalar SSE compare.
    UComiS {
        /// Double precision.
        double: bool,
        /// Left operand (XMM).
        a: MReg,
        /// Right operand.
        b: MOperand,
    },
    /// Integer → floating conversion.
    Cvtsi2S {
        /// Double precision destination.
        double: bool,
        /// Destination (XMM).
        dst: MReg,
        /// Source (GP, 32 or 64 bits).
        src: MReg,
    },
    /// Truncating floating → integer conversion.
    Cvtts2Si {
        /// Double precision source.
        double: bool,
        /// Destination (GP, 32 or 64 bits).
        dst: MReg,
        /// Source (XMM).
        src: MReg,
    },
    /// Float ↔ double conversion.
    Cvts2S {
        /// Destination precision.
        to_double: bool,
        /// Destination (XMM).
        dst: MReg,
        /// Source.
        src: MOperand,
    },
    /// Bitwise xor of XMM registers (zeroing).
    Xorps {
        /// Destination.
        dst: MReg,
        /// Source.
        src: MReg,
    },
    /// GP → XMM bit move.
    MovdToXmm {
        /// Destination (XMM).
        dst: MReg,
        /// Source (GP).
        src: MReg,
    },
    /// XMM → GP bit move.
    MovdFromXmm {
        /// Destination (GP).
        dst: MReg,
        /// Source (XMM).
        src: MReg,
    },
}

impl MInst {
    /// Visit registers read by this instruction.
    pub fn visit_uses(&self, f: &mut impl FnMut(&MReg)) {
        let mem_uses = |m: &MMem, f: &mut dyn FnMut(&MReg)| {
            if let Some(b) = &m.base {
                f(b);
            }
            if let Some((i, _)) = &m.index {
                f(i);
            }
        };
        let op_uses = |op: &MOperand, f: &mut dyn FnMut(&MReg)| match op {
            MOperand::Reg(r) => f(r),
            MOperand::Mem { mem, .. } => mem_uses(mem, f),
            _ => {}
        };
        match self {
            Self::Mov { dst, src } | Self::MovS { dst, src, .. } => {
                op_uses(src, f);
                // A memory destination reads its address registers.
                if let MOperand::Mem { mem, .. } = dst {
                    mem_uses(mem, f);
                }
            }
            Self::MovSX { src, .. } | Self::MovZX { src, .. } => f(src),
            Self::Alu { dst, src, .. } => {
                op_uses(dst, f);
                op_uses(src, f);
            }
            Self::IMul { dst, src } => {
                f(dst);
                op_uses(src, f);
            }
            Self::Div { divisor, .. } => {
                f(&MReg::phys(Reg::RAX));
                f(&MReg::phys(Reg::RDX));
                op_uses(divisor, f);
            }
            Self::SignExtendAx { .. } => f(&MReg::phys(Reg::RAX)),
            Self::Neg { op } | Self::Not { op } => op_uses(op, f),
            Self::Shift { dst, count, .. } => {
                op_uses(dst, f);
                op_uses(count, f);
            }
            Self::Lea { mem, .. } => mem_uses(mem, f),
            Self::UComiS { a, b, .. } => {
                f(a);
                op_uses(b, f);
            }
            Self::AluS { dst, src, .. } => {
                f(dst);
                op_uses(src, f);
            }
            Self::Cvtsi2S { src, .. }
            | Self::Cvtts2Si { src, .. }
            | Self::MovdToXmm { src, .. }
            | Self::MovdFromXmm { src, .. } => f(src),
            Self::Cvts2S { src, .. } => op_uses(src, f),
            Self::Xorps { dst, src } => {
                f(dst);
                f(src);
            }
            Self::CallSym { uses, .. } | Self::CallRip { uses, .. } => {
                for u in uses {
                    f(u);
                }
            }
            Self::CallReg { target, uses, .. } => {
                f(target);
                for u in uses {
                    f(u);
                }
            }
            Self::Ret => f(&MReg::phys(Reg::RAX)),
            Self::LeaSlot { .. }
            | Self::LeaSym { .. }
            | Self::Setcc { .. }
            | Self::Jcc { .. }
            | Self::Jmp { .. }
            | Self::Trap => {}
        }
    }

    /// Visit registers written by this instruction.
    pub fn visit_defs(&self, f: &mut impl FnMut(&MReg)) {
        match self {
            Self::Mov { dst, .. } | Self::MovS { dst, .. } => {
                if let MOperand::Reg(r) = dst {
                    f(r);
                }
            }
            Self::MovSX { dst, .. }
            | Self::MovZX { dst, .. }
            | Self::IMul { dst, .. }
            | Self::Lea { dst, .. }
            | Self::LeaSlot { dst, .. }
            | Self::LeaSym { dst, .. }
            | Self::Setcc { dst, .. }
            | Self::AluS { dst, .. }
            | Self::Cvtsi2S { dst, .. }
            | Self::Cvtts2Si { dst, .. }
            | Self::Cvts2S { dst, .. }
            | Self::Xorps { dst, .. }
            | Self::MovdToXmm { dst, .. }
            | Self::MovdFromXmm { dst, .. } => f(dst),
            Self::Alu { op, dst, .. } => {
                if *op != AluOp::Cmp {
                    if let MOperand::Reg(r) = dst {
                        f(r);
                    }
                }
            }
            Self::Div { .. } => {
                f(&MReg::phys(Reg::RAX));
                f(&MReg::phys(Reg::RDX));
            }
            Self::SignExtendAx { .. } => f(&MReg::phys(Reg::RDX)),
            Self::Neg { op } | Self::Not { op } => {
                if let MOperand::Reg(r) = op {
                    f(r);
                }
            }
            Self::Shift { dst, .. } => {
                if let MOperand::Reg(r) = dst {
                    f(r);
                }
            }
            Self::CallSym { def, .. } | Self::CallRip { def, .. } | Self::CallReg { def, .. } => {
                if let Some(d) = def {
                    f(d);
                }
            }
            Self::Ret
            | Self::Trap
            | Self::Jcc { .. }
            | Self::Jmp { .. }
            | Self::UComiS { .. } => {}
        }
    }

    /// Whether this is a call (clobbers the caller-saved set).
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Self::CallSym { .. } | Self::CallRip { .. } | Self::CallReg { .. }
        )
    }

    /// A register-to-register copy, as `(dst, src)`.
    pub fn is_copy(&self) -> Option<(MReg, MReg)> {
        match self {
            Self::Mov {
                dst: MOperand::Reg(d),
                src: MOperand::Reg(s),
            }
            | Self::MovS {
                dst: MOperand::Reg(d),
                src: MOperand::Reg(s),
                ..
            } => Some((*d, *s)),
            _ => None,
        }
    }
}

/// One MIR basic block.
#[derive(Debug, Default)]
pub struct MirBlock {
    /// Instructions in order; the tail is the lowered terminator.
    pub insts: Vec<MInst>,
}

/// A function in machine IR.
#[derive(Debug)]
pub struct MirFunction {
    /// Symbol name.
    pub name: String,
    /// Internal linkage.
    pub internal: bool,
    /// Blocks, with the ids of the source SSA function.
    pub blocks: Vec<MirBlock>,
    /// Stack-object table: allocas, spill slots, compiler temporaries.
    pub slots: Vec<StackSlot>,
    /// Next unused virtual register id.
    pub next_vreg: u32,
    /// Highest argument count among calls in the body.
    pub max_call_args: usize,
    /// Whether the body contains calls (forces shadow-space reservation).
    pub has_calls: bool,
    /// Callee-saved GP registers the allocator handed out (ascending ids).
    pub used_callee_gp: Vec<u8>,
    /// Callee-saved XMM registers the allocator handed out (ascending ids).
    pub used_callee_xmm: Vec<u8>,
}

impl MirFunction {
    /// Allocate a fresh virtual register.
    pub fn new_vreg(&mut self, class: RegClass, size: OpSize) -> MReg {
        let id = self.next_vreg;
        self.next_vreg += 1;
        MReg { id, class, size }
    }

    /// Allocate a stack slot.
    pub fn new_slot(&mut self, size: u32, align: u32) -> SlotId {
        let id = SlotId(self.slots.len() as u32);
        self.slots.push(StackSlot {
            size: size.max(1),
            align: align.max(1),
            disp: 0,
        });
        id
    }
}

/// A lowered module: functions plus the data the emitter needs.
#[derive(Debug, Default)]
pub struct MirModule {
    /// Lowered functions.
    pub funcs: Vec<MirFunction>,
    /// Floating-point literal pool: symbol name → little-endian bytes.
    pub float_consts: Vec<(String, Vec<u8>)>,
    /// Names referenced but not defined in this module.
    pub externals: Vec<String>,
}
