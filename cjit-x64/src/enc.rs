//! The instruction-encoding record.
//!
//! Every instruction is described by one [`Encoding`] record (prefixes,
//! REX, opcode bytes, ModR/M, SIB, displacement, immediate), then serialized.
//! The ModR/M and SIB corner rules live in [`Encoding::mem_operand`]:
//! RSP/R12 bases force a SIB byte, RBP/R13 bases force `mod != 00`, RSP can
//! never be an index, and RIP-relative addressing is `mod=00 r/m=101` with
//! a 32-bit displacement and no SIB.

use crate::operand::Mem;
use crate::reg::{OpSize, Reg, RegClass};
use crate::{Result, X64Error};

/// Displacement widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispSize {
    /// 8-bit.
    D8,
    /// 32-bit.
    D32,
}

/// An x86-64 instruction encoding under construction.
#[derive(Debug, Clone, Default)]
pub struct Encoding {
    /// `F2`/`F3`: REP-family or SSE mandatory prefix.
    rep: Option<u8>,
    /// `66` operand-size override (16-bit ops, SSE2 mandatory prefix).
    op_size: bool,
    /// `67` address-size override (32-bit addressing registers).
    addr_size: bool,
    has_rex: bool,
    rex_w: u8,
    rex_r: u8,
    rex_x: u8,
    rex_b: u8,
    opcode: [u8; 3],
    opcode_len: usize,
    modrm: Option<u8>,
    sib: Option<u8>,
    disp: Option<(DispSize, i32)>,
    imm: Option<(OpSize, i64)>,
}

impl Encoding {
    /// Fresh, empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// One-byte opcode.
    pub fn opcode1(&mut self, b0: u8) -> &mut Self {
        self.opcode = [b0, 0, 0];
        self.opcode_len = 1;
        self
    }

    /// Two-byte opcode.
    pub fn opcode2(&mut self, b0: u8, b1: u8) -> &mut Self {
        self.opcode = [b0, b1, 0];
        self.opcode_len = 2;
        self
    }

    /// Three-byte opcode.
    pub fn opcode3(&mut self, b0: u8, b1: u8, b2: u8) -> &mut Self {
        self.opcode = [b0, b1, b2];
        self.opcode_len = 3;
        self
    }

    /// Set the `F2`/`F3` prefix slot.
    pub fn rep_prefix(&mut self, b: u8) -> &mut Self {
        self.rep = Some(b);
        self
    }

    /// Request the `66` operand-size prefix.
    pub fn operand_size_override(&mut self) -> &mut Self {
        self.op_size = true;
        self
    }

    /// Request the `67` address-size prefix.
    pub fn address_size_override(&mut self) -> &mut Self {
        self.addr_size = true;
        self
    }

    /// Merge REX bits; the prefix is emitted once any bit is set.
    pub fn rex(&mut self, w: u8, r: u8, x: u8, b: u8) -> &mut Self {
        self.rex_w |= w & 1;
        self.rex_r |= r & 1;
        self.rex_x |= x & 1;
        self.rex_b |= b & 1;
        if self.rex_w | self.rex_r | self.rex_x | self.rex_b != 0 {
            self.has_rex = true;
        }
        self
    }

    /// Force an empty REX prefix (spl/bpl/sil/dil access).
    pub fn force_rex(&mut self) -> &mut Self {
        self.has_rex = true;
        self
    }

    /// Set ModR/M fields.
    pub fn modrm(&mut self, mode: u8, reg: u8, rm: u8) -> &mut Self {
        self.modrm = Some(((mode & 3) << 6) | ((reg & 7) << 3) | (rm & 7));
        self
    }

    /// Set the SIB byte.
    pub fn sib(&mut self, scale: u8, index: u8, base: u8) -> &mut Self {
        self.sib = Some(((scale & 3) << 6) | ((index & 7) << 3) | (base & 7));
        self
    }

    /// Attach a displacement.
    pub fn disp(&mut self, size: DispSize, value: i32) -> &mut Self {
        self.disp = Some((size, value));
        self
    }

    /// Attach an immediate.
    pub fn imm(&mut self, size: OpSize, value: i64) -> &mut Self {
        self.imm = Some((size, value));
        self
    }

    /// Size-dependent common setup for integer ops: the `66` prefix for
    /// 16-bit operands and REX.W for 64-bit ones.
    pub fn int_op_size(&mut self, size: OpSize) -> &mut Self {
        match size {
            OpSize::B16 => {
                self.operand_size_override();
            }
            OpSize::B64 => {
                self.rex(1, 0, 0, 0);
            }
            _ => {}
        }
        self
    }

    /// Encode a register operand in the `rm` field (`mod = 11`).
    pub fn rm_reg(&mut self, reg_field: u8, rm: Reg) -> &mut Self {
        self.rex(0, reg_field >> 3, 0, rm.rex_bit());
        if rm.needs_rex_for_8bit() {
            self.force_rex();
        }
        self.modrm(0b11, reg_field, rm.modrm_bits())
    }

    /// Encode a memory operand: ModR/M, SIB, displacement and the REX.X/B
    /// bits it implies. `reg_field` is the full 4-bit reg-field value.
    pub fn mem_operand(&mut self, reg_field: u8, mem: &Mem) -> Result<()> {
        self.rex(0, reg_field >> 3, 0, 0);
        let reg = reg_field & 7;

        if let Some(index) = mem.index {
            if index.class() == RegClass::Gp && index.id() == 4 && index.size() != OpSize::B128 {
                return Err(X64Error::Encoding("rsp cannot be an index register".into()));
            }
        }
        // 32-bit addressing registers need the 67 prefix.
        let addr32 = mem
            .base
            .map(|b| b.size() == OpSize::B32)
            .or_else(|| mem.index.map(|i| i.size() == OpSize::B32))
            .unwrap_or(false);
        if addr32 {
            self.address_size_override();
        }

        match (mem.base, mem.index) {
            (Some(base), None) => {
                self.rex(0, 0, 0, base.rex_bit());
                let (mode, disp) = pick_disp(base.modrm_bits(), mem.disp);
                if base.modrm_bits() == 0b100 {
                    // RSP/R12 base requires a SIB with "no index".
                    self.modrm(mode, reg, 0b100);
                    self.sib(0, 0b100, base.modrm_bits());
                } else {
                    self.modrm(mode, reg, base.modrm_bits());
                }
                if let Some(d) = disp {
                    self.disp(d, mem.disp);
                }
            }
            (Some(base), Some(index)) => {
                self.rex(0, 0, index.rex_bit(), base.rex_bit());
                let (mode, disp) = pick_disp(base.modrm_bits(), mem.disp);
                self.modrm(mode, reg, 0b100);
                self.sib(mem.scale as u8, index.modrm_bits(), base.modrm_bits());
                if let Some(d) = disp {
                    self.disp(d, mem.disp);
                }
            }
            (None, Some(index)) => {
                // Index with no base: SIB base = 101, mod = 00, disp32.
                self.rex(0, 0, index.rex_bit(), 0);
                self.modrm(0b00, reg, 0b100);
                self.sib(mem.scale as u8, index.modrm_bits(), 0b101);
                self.disp(DispSize::D32, mem.disp);
            }
            (None, None) => {
                // Absolute disp32.
                self.modrm(0b00, reg, 0b100);
                self.sib(0, 0b100, 0b101);
                self.disp(DispSize::D32, mem.disp);
            }
        }
        Ok(())
    }

    /// RIP-relative operand: `mod = 00`, `r/m = 101`, no SIB, disp32.
    pub fn rip_operand(&mut self, reg_field: u8, disp: i32) -> &mut Self {
        self.rex(0, reg_field >> 3, 0, 0);
        self.modrm(0b00, reg_field & 7, 0b101);
        self.disp(DispSize::D32, disp)
    }

    /// Byte offset of the displacement field within the encoded bytes.
    pub fn disp_offset(&self) -> Option<usize> {
        self.disp?;
        let mut off = self.prefix_len() + self.opcode_len;
        if self.modrm.is_some() {
            off += 1;
        }
        if self.sib.is_some() {
            off += 1;
        }
        Some(off)
    }

    /// Byte offset of the immediate field within the encoded bytes.
    pub fn imm_offset(&self) -> Option<usize> {
        self.imm?;
        Some(self.len() - self.imm_len())
    }

    fn prefix_len(&self) -> usize {
        usize::from(self.rep.is_some())
            + usize::from(self.op_size)
            + usize::from(self.addr_size)
            + usize::from(self.has_rex)
    }

    fn disp_len(&self) -> usize {
        match self.disp {
            None => 0,
            Some((DispSize::D8, _)) => 1,
            Some((DispSize::D32, _)) => 4,
        }
    }

    fn imm_len(&self) -> usize {
        match self.imm {
            None => 0,
            Some((size, _)) => size.bytes().min(8) as usize,
        }
    }

    /// Total encoded length in bytes.
    pub fn len(&self) -> usize {
        self.prefix_len()
            + self.opcode_len
            + usize::from(self.modrm.is_some())
            + usize::from(self.sib.is_some())
            + self.disp_len()
            + self.imm_len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.opcode_len == 0
    }

    /// Serialize the record.
    pub fn encode(&self, out: &mut Vec<u8>) {
        if let Some(p) = self.rep {
            out.push(p);
        }
        if self.op_size {
            out.push(0x66);
        }
        if self.addr_size {
            out.push(0x67);
        }
        if self.has_rex {
            out.push(0x40 | (self.rex_w << 3) | (self.rex_r << 2) | (self.rex_x << 1) | self.rex_b);
        }
        out.extend_from_slice(&self.opcode[..self.opcode_len]);
        if let Some(m) = self.modrm {
            out.push(m);
        }
        if let Some(s) = self.sib {
            out.push(s);
        }
        match self.disp {
            Some((DispSize::D8, v)) => out.push(v as u8),
            Some((DispSize::D32, v)) => out.extend_from_slice(&v.to_le_bytes()),
            None => {}
        }
        if let Some((size, v)) = self.imm {
            let bytes = v.to_le_bytes();
            out.extend_from_slice(&bytes[..size.bytes().min(8) as usize]);
        }
    }
}

/// Displacement mode selection: `mod=00` only when the displacement is zero
/// and the base is not RBP/R13; disp8 iff the value fits in a signed byte.
fn pick_disp(base_bits: u8, disp: i32) -> (u8, Option<DispSize>) {
    if disp == 0 && base_bits != 0b101 {
        (0b00, None)
    } else if i32::from(disp as i8) == disp {
        (0b01, Some(DispSize::D8))
    } else {
        (0b10, Some(DispSize::D32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::Scale;

    fn enc_bytes(e: &Encoding) -> Vec<u8> {
        let mut out = Vec::new();
        e.encode(&mut out);
        out
    }

    #[test]
    fn mov_reg_reg_64() {
        // mov rax, rcx => 48 89 C8
        let mut e = Encoding::new();
        e.int_op_size(OpSize::B64).opcode1(0x89).rm_reg(Reg::RCX.id(), Reg::RAX);
        assert_eq!(enc_bytes(&e), vec![0x48, 0x89, 0xC8]);
    }

    #[test]
    fn rsp_base_needs_sib() {
        // mov eax, [rsp+8] => 8B 44 24 08
        let mut e = Encoding::new();
        e.opcode1(0x8B);
        e.mem_operand(Reg::RAX.id(), &Mem::base_disp(Reg::RSP, 8)).unwrap();
        assert_eq!(enc_bytes(&e), vec![0x8B, 0x44, 0x24, 0x08]);
    }

    #[test]
    fn rbp_base_forces_disp8() {
        // mov eax, [rbp] => 8B 45 00
        let mut e = Encoding::new();
        e.opcode1(0x8B);
        e.mem_operand(Reg::RAX.id(), &Mem::base(Reg::RBP)).unwrap();
        assert_eq!(enc_bytes(&e), vec![0x8B, 0x45, 0x00]);
    }

    #[test]
    fn r13_base_forces_disp8() {
        // mov rax, [r13] => 49 8B 45 00
        let mut e = Encoding::new();
        e.int_op_size(OpSize::B64).opcode1(0x8B);
        e.mem_operand(Reg::RAX.id(), &Mem::base(Reg::R13)).unwrap();
        assert_eq!(enc_bytes(&e), vec![0x49, 0x8B, 0x45, 0x00]);
    }

    #[test]
    fn scaled_index() {
        // mov eax, [rcx + rdx*4 + 0x40] => 8B 44 91 40
        let mut e = Encoding::new();
        e.opcode1(0x8B);
        e.mem_operand(
            Reg::RAX.id(),
            &Mem::base_index(Reg::RCX, Reg::RDX, Scale::S4, 0x40),
        )
        .unwrap();
        assert_eq!(enc_bytes(&e), vec![0x8B, 0x44, 0x91, 0x40]);
    }

    #[test]
    fn rsp_index_is_rejected() {
        let mut e = Encoding::new();
        e.opcode1(0x8B);
        let err = e.mem_operand(
            Reg::RAX.id(),
            &Mem::base_index(Reg::RCX, Reg::RSP, Scale::S1, 0),
        );
        assert!(err.is_err());
    }

    #[test]
    fn rip_relative() {
        // lea rax, [rip+0] => 48 8D 05 00 00 00 00
        let mut e = Encoding::new();
        e.int_op_size(OpSize::B64).opcode1(0x8D).rip_operand(Reg::RAX.id(), 0);
        assert_eq!(enc_bytes(&e), vec![0x48, 0x8D, 0x05, 0, 0, 0, 0]);
        assert_eq!(e.disp_offset(), Some(3));
    }

    #[test]
    fn high_regs_set_rex_bits() {
        // mov r9, r8 => 4D 89 C1
        let mut e = Encoding::new();
        e.int_op_size(OpSize::B64).opcode1(0x89).rm_reg(Reg::R8.id(), Reg::R9);
        assert_eq!(enc_bytes(&e), vec![0x4D, 0x89, 0xC1]);
    }
}
