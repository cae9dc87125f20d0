//! Hardware register encoding.
//!
//! A [`Reg`] packs the 4-bit hardware id, a register-class bit and an
//! operand-size class into one byte, so the encoder can extract ModR/M and
//! REX fields with shifts alone.

use strum::EnumIter;

/// Operand size classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter)]
#[repr(u8)]
pub enum OpSize {
    /// 8-bit.
    B8 = 0,
    /// 16-bit.
    B16 = 1,
    /// 32-bit.
    B32 = 2,
    /// 64-bit.
    B64 = 3,
    /// 128-bit (XMM).
    B128 = 4,
}

impl OpSize {
    /// Size class covering a value of `bytes` bytes.
    pub fn from_bytes(bytes: u32) -> Self {
        match bytes {
            1 => Self::B8,
            2 => Self::B16,
            4 => Self::B32,
            _ => Self::B64,
        }
    }

    /// Width in bytes (16 for XMM).
    pub const fn bytes(self) -> u32 {
        match self {
            Self::B8 => 1,
            Self::B16 => 2,
            Self::B32 => 4,
            Self::B64 => 8,
            Self::B128 => 16,
        }
    }
}

/// Register class: general purpose or SSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    /// rax .. r15 (any width).
    Gp,
    /// xmm0 .. xmm15.
    Xmm,
}

const CLASS_BIT: u8 = 1 << 4;
const SIZE_SHIFT: u8 = 5;

/// A hardware register: id, class and width packed into one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(u8);

macro_rules! gp {
    ($name:ident, $id:expr, $size:expr) => {
        #[doc = concat!("`", stringify!($name), "`")]
        pub const $name: Reg = Reg::gp($id, $size);
    };
}

impl Reg {
    /// Construct a general-purpose register.
    pub const fn gp(id: u8, size: OpSize) -> Self {
        Self(id & 0x0F | ((size as u8) << SIZE_SHIFT))
    }

    /// Construct an XMM register.
    pub const fn xmm(id: u8) -> Self {
        Self((id & 0x0F) | CLASS_BIT | ((OpSize::B128 as u8) << SIZE_SHIFT))
    }

    /// Hardware id (0..=15).
    pub const fn id(self) -> u8 {
        self.0 & 0x0F
    }

    /// Register class.
    pub const fn class(self) -> RegClass {
        if self.0 & CLASS_BIT != 0 {
            RegClass::Xmm
        } else {
            RegClass::Gp
        }
    }

    /// Operand size class.
    pub const fn size(self) -> OpSize {
        match self.0 >> SIZE_SHIFT {
            0 => OpSize::B8,
            1 => OpSize::B16,
            2 => OpSize::B32,
            3 => OpSize::B64,
            _ => OpSize::B128,
        }
    }

    /// Same register at a different width.
    pub const fn with_size(self, size: OpSize) -> Self {
        Self((self.0 & 0x1F) | ((size as u8) << SIZE_SHIFT))
    }

    /// High bit of the id, for REX.R / REX.X / REX.B.
    pub const fn rex_bit(self) -> u8 {
        (self.0 >> 3) & 1
    }

    /// ModR/M field bits (low 3 bits of the id).
    pub const fn modrm_bits(self) -> u8 {
        self.0 & 0x07
    }

    /// Whether accessing this 8-bit register requires a REX prefix
    /// (spl/bpl/sil/dil are unreachable without one).
    pub const fn needs_rex_for_8bit(self) -> bool {
        matches!(self.size(), OpSize::B8) && self.id() >= 4 && self.id() <= 7
    }

    gp!(RAX, 0, OpSize::B64);
    gp!(RCX, 1, OpSize::B64);
    gp!(RDX, 2, OpSize::B64);
    gp!(RBX, 3, OpSize::B64);
    gp!(RSP, 4, OpSize::B64);
    gp!(RBP, 5, OpSize::B64);
    gp!(RSI, 6, OpSize::B64);
    gp!(RDI, 7, OpSize::B64);
    gp!(R8, 8, OpSize::B64);
    gp!(R9, 9, OpSize::B64);
    gp!(R10, 10, OpSize::B64);
    gp!(R11, 11, OpSize::B64);
    gp!(R12, 12, OpSize::B64);
    gp!(R13, 13, OpSize::B64);
    gp!(R14, 14, OpSize::B64);
    gp!(R15, 15, OpSize::B64);

    gp!(EAX, 0, OpSize::B32);
    gp!(ECX, 1, OpSize::B32);
    gp!(EDX, 2, OpSize::B32);

    gp!(AX, 0, OpSize::B16);
    gp!(AL, 0, OpSize::B8);
    gp!(CL, 1, OpSize::B8);
    gp!(DL, 2, OpSize::B8);

    /// `xmm0`
    pub const XMM0: Reg = Reg::xmm(0);
    /// `xmm1`
    pub const XMM1: Reg = Reg::xmm(1);
    /// `xmm2`
    pub const XMM2: Reg = Reg::xmm(2);
    /// `xmm3`
    pub const XMM3: Reg = Reg::xmm(3);
    /// `xmm4`
    pub const XMM4: Reg = Reg::xmm(4);
    /// `xmm5`
    pub const XMM5: Reg = Reg::xmm(5);
}
