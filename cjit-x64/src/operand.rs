//! Assembler operands.

use crate::label::LabelId;
use crate::reg::{OpSize, Reg};
use crate::symbol::SymbolId;

/// Scale factor of an indexed memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Scale {
    /// ×1
    S1 = 0,
    /// ×2
    S2 = 1,
    /// ×4
    S4 = 2,
    /// ×8
    S8 = 3,
}

impl Scale {
    /// Scale from a byte multiplier (1, 2, 4 or 8).
    pub fn from_bytes(n: u32) -> Option<Self> {
        match n {
            1 => Some(Self::S1),
            2 => Some(Self::S2),
            4 => Some(Self::S4),
            8 => Some(Self::S8),
            _ => None,
        }
    }
}

/// A `[base + index*scale + disp]` memory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    /// Base register; `None` for absolute/index-only addressing.
    pub base: Option<Reg>,
    /// Index register; never RSP.
    pub index: Option<Reg>,
    /// Scale applied to the index.
    pub scale: Scale,
    /// Signed displacement.
    pub disp: i32,
}

impl Mem {
    /// `[base]`
    pub fn base(base: Reg) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: Scale::S1,
            disp: 0,
        }
    }

    /// `[base + disp]`
    pub fn base_disp(base: Reg, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: Scale::S1,
            disp,
        }
    }

    /// `[base + index*scale + disp]`
    pub fn base_index(base: Reg, index: Reg, scale: Scale, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            scale,
            disp,
        }
    }
}

/// One instruction operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// Hardware register.
    Reg(Reg),
    /// Sized immediate.
    Imm {
        /// Value, sign-extended.
        value: i64,
        /// Encoded width.
        size: OpSize,
    },
    /// Memory reference with an explicit operand size.
    Mem {
        /// Address computation.
        mem: Mem,
        /// Access width.
        size: OpSize,
    },
    /// Branch target label in the current section.
    Label(LabelId),
    /// Direct reference to a module symbol (call/jmp target).
    Sym(SymbolId),
    /// RIP-relative access to a module symbol's storage.
    RipSym {
        /// Referenced symbol.
        sym: SymbolId,
        /// Extra displacement past the symbol start.
        disp: i32,
        /// Access width.
        size: OpSize,
    },
}

impl Operand {
    /// Register operand.
    pub fn reg(r: Reg) -> Self {
        Self::Reg(r)
    }

    /// Immediate of the given width.
    pub fn imm(value: i64, size: OpSize) -> Self {
        Self::Imm { value, size }
    }

    /// Sized memory operand.
    pub fn mem(mem: Mem, size: OpSize) -> Self {
        Self::Mem { mem, size }
    }

    /// Whether an immediate fits in a sign-extended 32-bit field.
    pub fn imm_fits_i32(value: i64) -> bool {
        i64::from(value as i32) == value
    }

    /// Access/operand width of this operand, when meaningful.
    pub fn size(&self) -> OpSize {
        match self {
            Self::Reg(r) => r.size(),
            Self::Imm { size, .. } | Self::Mem { size, .. } | Self::RipSym { size, .. } => *size,
            Self::Label(_) | Self::Sym(_) => OpSize::B32,
        }
    }
}
