//! The assembler: mnemonic methods, sections, symbols and finalization.

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::cc::CondCode;
use crate::enc::Encoding;
use crate::exec::{ExecBuffer, PAGE_SIZE};
use crate::label::{Fixup, LabelData, LabelId};
use crate::operand::Operand;
use crate::reg::{OpSize, Reg, RegClass};
use crate::section::{Section, SectionKind};
use crate::symbol::{RelocKind, Relocation, SymbolData, SymbolId, SymbolKind};
use crate::{Result, X64Error};

/// Which 32-bit field of an instruction references a label or symbol.
enum InstrRef {
    /// The displacement field, label-relative.
    LabelDisp(LabelId),
    /// The immediate field, label-relative (rel32 branches).
    LabelImm(LabelId),
    /// The displacement field, symbol-relative (RIP addressing).
    SymDisp(SymbolId),
    /// The immediate field, symbol-relative (rel32 calls).
    SymImm(SymbolId),
}

/// In-memory x86-64 assembler over a `.text` and a `.data` section.
#[derive(Debug, Default)]
pub struct Assembler {
    text: Section,
    data: Section,
    labels: Vec<LabelData>,
    symbols: Vec<SymbolData>,
    by_name: HashMap<String, SymbolId>,
    cur_func: Option<SymbolId>,
}

impl Assembler {
    /// Empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    fn section(&mut self, kind: SectionKind) -> &mut Section {
        match kind {
            SectionKind::Text => &mut self.text,
            SectionKind::Data => &mut self.data,
        }
    }

    /// Bytes of the executable section emitted so far.
    pub fn text(&self) -> &[u8] {
        &self.text.bytes
    }

    /// Bytes of the initialized-data section emitted so far.
    pub fn data(&self) -> &[u8] {
        &self.data.bytes
    }

    // ----- labels -------------------------------------------------------

    /// Allocate an unbound label in `section`.
    pub fn label_alloc(&mut self, section: SectionKind) -> LabelId {
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(LabelData::new(section));
        id
    }

    /// Bind `label` to the current offset of its section and patch every
    /// pending fixup.
    pub fn label_bind(&mut self, label: LabelId) {
        let section = self.labels[label.0 as usize].section;
        let offset = match section {
            SectionKind::Text => self.text.offset(),
            SectionKind::Data => self.data.offset(),
        };
        let fixups = {
            let data = &mut self.labels[label.0 as usize];
            data.offset = Some(offset);
            core::mem::take(&mut data.fixups)
        };
        for fixup in fixups {
            let disp = offset.wrapping_sub(fixup.end_offset) as i32;
            self.section(section).patch_u32(fixup.patch_offset, disp as u32);
        }
    }

    /// Bound offset of a label within its section.
    pub fn label_offset(&self, label: LabelId) -> Option<u32> {
        self.labels[label.0 as usize].offset
    }

    fn label_ref(&mut self, label: LabelId, patch_offset: u32, end_offset: u32) {
        let (bound, section) = {
            let data = &self.labels[label.0 as usize];
            (data.offset, data.section)
        };
        match bound {
            Some(bound) => {
                let disp = bound.wrapping_sub(end_offset) as i32;
                self.section(section).patch_u32(patch_offset, disp as u32);
            }
            None => self.labels[label.0 as usize].fixups.push(Fixup {
                patch_offset,
                end_offset,
            }),
        }
    }

    // ----- symbols ------------------------------------------------------

    fn declare(&mut self, kind: SymbolKind, name: &str) -> SymbolId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let section = match kind {
            SymbolKind::Function => SectionKind::Text,
            SymbolKind::GlobalVar => SectionKind::Data,
        };
        let label = self.label_alloc(section);
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(SymbolData {
            kind,
            name: name.to_owned(),
            label,
            relocs: Vec::new(),
        });
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Declare (or look up) a global variable symbol.
    pub fn global_var_declare(&mut self, name: &str) -> SymbolId {
        self.declare(SymbolKind::GlobalVar, name)
    }

    /// Declare (or look up) a function symbol.
    pub fn func_declare(&mut self, name: &str) -> SymbolId {
        self.declare(SymbolKind::Function, name)
    }

    /// Look up a symbol by name.
    pub fn symbol_by_name(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    /// Section-relative offset of a defined symbol.
    pub fn symbol_offset(&self, name: &str) -> Option<u32> {
        let id = self.symbol_by_name(name)?;
        self.label_offset(self.symbols[id.0 as usize].label)
    }

    /// Define a global variable: align, bind, write the initializer image
    /// and attach its relocations (offsets relative to the symbol start).
    pub fn global_var_define(
        &mut self,
        sym: SymbolId,
        data: &[u8],
        align: u32,
        relocs: &[(RelocKind, u32, String)],
    ) -> Result<()> {
        self.data.align_to(align.max(1), 0);
        let label = self.symbols[sym.0 as usize].label;
        self.label_bind(label);
        self.data.emit(data);
        for (kind, offset, target) in relocs {
            self.symbols[sym.0 as usize].relocs.push(Relocation {
                kind: *kind,
                offset: *offset,
                target: target.clone(),
            });
        }
        Ok(())
    }

    /// Begin a function definition: align `.text`, bind the symbol.
    pub fn func_begin(&mut self, sym: SymbolId) -> Result<()> {
        if self.cur_func.is_some() {
            return Err(X64Error::Internal("nested function definition".into()));
        }
        self.text.align_to(16, 0x90);
        let label = self.symbols[sym.0 as usize].label;
        self.label_bind(label);
        self.cur_func = Some(sym);
        trace!(name = %self.symbols[sym.0 as usize].name, "func begin");
        Ok(())
    }

    /// End the current function definition.
    pub fn func_end(&mut self) {
        self.cur_func = None;
    }

    fn record_reloc(&mut self, kind: RelocKind, patch_offset: u32, target: SymbolId) -> Result<()> {
        let owner = self
            .cur_func
            .ok_or_else(|| X64Error::Internal("relocation outside a function".into()))?;
        let owner_start = self
            .label_offset(self.symbols[owner.0 as usize].label)
            .ok_or_else(|| X64Error::Internal("unbound function symbol".into()))?;
        let target_name = self.symbols[target.0 as usize].name.clone();
        self.symbols[owner.0 as usize].relocs.push(Relocation {
            kind,
            offset: patch_offset - owner_start,
            target: target_name,
        });
        Ok(())
    }

    // ----- instruction emission ----------------------------------------

    fn push_instr(&mut self, enc: &Encoding, iref: Option<InstrRef>) -> Result<()> {
        let start = self.text.offset();
        let mut bytes = Vec::with_capacity(16);
        enc.encode(&mut bytes);
        let len = bytes.len() as u32;
        self.text.emit(&bytes);
        let end = start + len;

        if let Some(iref) = iref {
            let field_off = match &iref {
                InstrRef::LabelDisp(_) | InstrRef::SymDisp(_) => enc
                    .disp_offset()
                    .ok_or_else(|| X64Error::Internal("missing displacement field".into()))?,
                InstrRef::LabelImm(_) | InstrRef::SymImm(_) => enc
                    .imm_offset()
                    .ok_or_else(|| X64Error::Internal("missing immediate field".into()))?,
            };
            let patch = start + field_off as u32;
            let tail = len - (patch - start) - 4;
            match iref {
                InstrRef::LabelDisp(l) | InstrRef::LabelImm(l) => {
                    self.label_ref(l, patch, end);
                }
                InstrRef::SymDisp(s) | InstrRef::SymImm(s) => {
                    self.record_reloc(RelocKind::Rel32(tail as u8), patch, s)?;
                }
            }
        }
        Ok(())
    }

    /// Append raw bytes to a section.
    pub fn emit_bytes(&mut self, section: SectionKind, bytes: &[u8]) {
        self.section(section).emit(bytes);
    }

    // ----- integer moves ------------------------------------------------

    /// `mov` over every supported operand combination.
    pub fn mov(&mut self, dst: Operand, src: Operand) -> Result<()> {
        match (dst, src) {
            (Operand::Reg(d), Operand::Reg(s)) => {
                self.check_gp2(d, s)?;
                let mut e = Encoding::new();
                e.int_op_size(d.size());
                e.opcode1(if d.size() == OpSize::B8 { 0x88 } else { 0x89 });
                e.rex(0, s.rex_bit(), 0, 0);
                if s.needs_rex_for_8bit() {
                    e.force_rex();
                }
                e.rm_reg(s.id(), d);
                self.push_instr(&e, None)
            }
            (Operand::Reg(d), Operand::Mem { mem, size }) => {
                let mut e = Encoding::new();
                e.int_op_size(size);
                e.opcode1(if size == OpSize::B8 { 0x8A } else { 0x8B });
                if d.needs_rex_for_8bit() {
                    e.force_rex();
                }
                e.mem_operand(d.id(), &mem)?;
                self.push_instr(&e, None)
            }
            (Operand::Mem { mem, size }, Operand::Reg(s)) => {
                let mut e = Encoding::new();
                e.int_op_size(size);
                e.opcode1(if size == OpSize::B8 { 0x88 } else { 0x89 });
                if s.needs_rex_for_8bit() {
                    e.force_rex();
                }
                e.mem_operand(s.id(), &mem)?;
                self.push_instr(&e, None)
            }
            (Operand::Reg(d), Operand::Imm { value, .. }) => {
                let mut e = Encoding::new();
                match d.size() {
                    OpSize::B64 if !Operand::imm_fits_i32(value) => {
                        // movabs: B8+r io
                        e.rex(1, 0, 0, d.rex_bit());
                        e.opcode1(0xB8 + d.modrm_bits());
                        e.imm(OpSize::B64, value);
                    }
                    OpSize::B64 => {
                        // C7 /0 id, sign-extended
                        e.int_op_size(OpSize::B64);
                        e.opcode1(0xC7);
                        e.rm_reg(0, d);
                        e.imm(OpSize::B32, value);
                    }
                    OpSize::B8 => {
                        if d.needs_rex_for_8bit() {
                            e.force_rex();
                        }
                        e.rex(0, 0, 0, d.rex_bit());
                        e.opcode1(0xB0 + d.modrm_bits());
                        e.imm(OpSize::B8, value);
                    }
                    size => {
                        e.int_op_size(size);
                        e.rex(0, 0, 0, d.rex_bit());
                        e.opcode1(0xB8 + d.modrm_bits());
                        e.imm(size, value);
                    }
                }
                self.push_instr(&e, None)
            }
            (Operand::Mem { mem, size }, Operand::Imm { value, .. }) => {
                if size == OpSize::B64 && !Operand::imm_fits_i32(value) {
                    return Err(X64Error::Encoding("64-bit immediate store".into()));
                }
                let mut e = Encoding::new();
                e.int_op_size(size);
                e.opcode1(if size == OpSize::B8 { 0xC6 } else { 0xC7 });
                e.mem_operand(0, &mem)?;
                let imm_size = match size {
                    OpSize::B8 => OpSize::B8,
                    OpSize::B16 => OpSize::B16,
                    _ => OpSize::B32,
                };
                e.imm(imm_size, value);
                self.push_instr(&e, None)
            }
            (Operand::Reg(d), Operand::RipSym { sym, disp, size }) => {
                let mut e = Encoding::new();
                e.int_op_size(size);
                e.opcode1(if size == OpSize::B8 { 0x8A } else { 0x8B });
                if d.needs_rex_for_8bit() {
                    e.force_rex();
                }
                e.rip_operand(d.id(), disp);
                self.push_instr(&e, Some(InstrRef::SymDisp(sym)))
            }
            (Operand::RipSym { sym, disp, size }, Operand::Imm { value, .. }) => {
                if size == OpSize::B64 && !Operand::imm_fits_i32(value) {
                    return Err(X64Error::Encoding("64-bit immediate store".into()));
                }
                let mut e = Encoding::new();
                e.int_op_size(size);
                e.opcode1(if size == OpSize::B8 { 0xC6 } else { 0xC7 });
                e.rip_operand(0, disp);
                let imm_size = match size {
                    OpSize::B8 => OpSize::B8,
                    OpSize::B16 => OpSize::B16,
                    _ => OpSize::B32,
                };
                e.imm(imm_size, value);
                self.push_instr(&e, Some(InstrRef::SymDisp(sym)))
            }
            (Operand::RipSym { sym, disp, size }, Operand::Reg(s)) => {
                let mut e = Encoding::new();
                e.int_op_size(size);
                e.opcode1(if size == OpSize::B8 { 0x88 } else { 0x89 });
                if s.needs_rex_for_8bit() {
                    e.force_rex();
                }
                e.rip_operand(s.id(), disp);
                self.push_instr(&e, Some(InstrRef::SymDisp(sym)))
            }
            (dst, src) => Err(X64Error::Encoding(format!("mov {dst:?}, {src:?}"))),
        }
    }

    fn check_gp2(&self, a: Reg, b: Reg) -> Result<()> {
        if a.class() != RegClass::Gp || b.class() != RegClass::Gp {
            return Err(X64Error::Encoding("expected general registers".into()));
        }
        Ok(())
    }

    /// `movsx` (and `movsxd` for 32→64).
    pub fn movsx(&mut self, dst: Reg, src: Reg) -> Result<()> {
        let mut e = Encoding::new();
        e.int_op_size(dst.size());
        match src.size() {
            OpSize::B8 => {
                e.opcode2(0x0F, 0xBE);
            }
            OpSize::B16 => {
                e.opcode2(0x0F, 0xBF);
            }
            OpSize::B32 => {
                e.opcode1(0x63);
            }
            _ => return Err(X64Error::Encoding("movsx source width".into())),
        }
        e.rex(0, dst.rex_bit(), 0, 0);
        if src.needs_rex_for_8bit() {
            e.force_rex();
        }
        e.rm_reg(dst.id(), src);
        self.push_instr(&e, None)
    }

    /// `movzx`; 32→64 zero extension is a plain 32-bit `mov`.
    pub fn movzx(&mut self, dst: Reg, src: Reg) -> Result<()> {
        if src.size() == OpSize::B32 {
            return self.mov(
                Operand::reg(dst.with_size(OpSize::B32)),
                Operand::reg(src),
            );
        }
        let mut e = Encoding::new();
        e.int_op_size(dst.size());
        match src.size() {
            OpSize::B8 => {
                e.opcode2(0x0F, 0xB6);
            }
            OpSize::B16 => {
                e.opcode2(0x0F, 0xB7);
            }
            _ => return Err(X64Error::Encoding("movzx source width".into())),
        }
        e.rex(0, dst.rex_bit(), 0, 0);
        if src.needs_rex_for_8bit() {
            e.force_rex();
        }
        e.rm_reg(dst.id(), src);
        self.push_instr(&e, None)
    }

    // ----- integer arithmetic ------------------------------------------

    fn math_binary(&mut self, base: u8, ext: u8, dst: Operand, src: Operand) -> Result<()> {
        match (dst, src) {
            (Operand::Reg(d), Operand::Reg(s)) => {
                self.check_gp2(d, s)?;
                let mut e = Encoding::new();
                e.int_op_size(d.size());
                e.opcode1(if d.size() == OpSize::B8 { base } else { base + 1 });
                e.rex(0, s.rex_bit(), 0, 0);
                if s.needs_rex_for_8bit() {
                    e.force_rex();
                }
                e.rm_reg(s.id(), d);
                self.push_instr(&e, None)
            }
            (Operand::Reg(d), Operand::Mem { mem, size }) => {
                let mut e = Encoding::new();
                e.int_op_size(size);
                e.opcode1(if size == OpSize::B8 { base + 2 } else { base + 3 });
                if d.needs_rex_for_8bit() {
                    e.force_rex();
                }
                e.mem_operand(d.id(), &mem)?;
                self.push_instr(&e, None)
            }
            (Operand::Mem { mem, size }, Operand::Reg(s)) => {
                let mut e = Encoding::new();
                e.int_op_size(size);
                e.opcode1(if size == OpSize::B8 { base } else { base + 1 });
                if s.needs_rex_for_8bit() {
                    e.force_rex();
                }
                e.mem_operand(s.id(), &mem)?;
                self.push_instr(&e, None)
            }
            (Operand::Reg(d), Operand::Imm { value, .. }) => {
                if !Operand::imm_fits_i32(value) {
                    return Err(X64Error::Encoding("64-bit arithmetic immediate".into()));
                }
                let mut e = Encoding::new();
                e.int_op_size(d.size());
                if d.size() == OpSize::B8 {
                    if d.needs_rex_for_8bit() {
                        e.force_rex();
                    }
                    e.opcode1(0x80);
                    e.rm_reg(ext, d);
                    e.imm(OpSize::B8, value);
                } else if i64::from(value as i8) == value {
                    e.opcode1(0x83);
                    e.rm_reg(ext, d);
                    e.imm(OpSize::B8, value);
                } else {
                    e.opcode1(0x81);
                    e.rm_reg(ext, d);
                    let imm_size = if d.size() == OpSize::B16 {
                        OpSize::B16
                    } else {
                        OpSize::B32
                    };
                    e.imm(imm_size, value);
                }
                self.push_instr(&e, None)
            }
            (Operand::Mem { mem, size }, Operand::Imm { value, .. }) => {
                if !Operand::imm_fits_i32(value) {
                    return Err(X64Error::Encoding("64-bit arithmetic immediate".into()));
                }
                let mut e = Encoding::new();
                e.int_op_size(size);
                if size == OpSize::B8 {
                    e.opcode1(0x80);
                    e.mem_operand(ext, &mem)?;
                    e.imm(OpSize::B8, value);
                } else if i64::from(value as i8) == value {
                    e.opcode1(0x83);
                    e.mem_operand(ext, &mem)?;
                    e.imm(OpSize::B8, value);
                } else {
                    e.opcode1(0x81);
                    e.mem_operand(ext, &mem)?;
                    let imm_size = if size == OpSize::B16 {
                        OpSize::B16
                    } else {
                        OpSize::B32
                    };
                    e.imm(imm_size, value);
                }
                self.push_instr(&e, None)
            }
            (dst, src) => Err(X64Error::Encoding(format!("alu {dst:?}, {src:?}"))),
        }
    }

    /// `add`
    pub fn add(&mut self, dst: Operand, src: Operand) -> Result<()> {
        self.math_binary(0x00, 0, dst, src)
    }

    /// `or`
    pub fn or(&mut self, dst: Operand, src: Operand) -> Result<()> {
        self.math_binary(0x08, 1, dst, src)
    }

    /// `and`
    pub fn and(&mut self, dst: Operand, src: Operand) -> Result<()> {
        self.math_binary(0x20, 4, dst, src)
    }

    /// `sub`
    pub fn sub(&mut self, dst: Operand, src: Operand) -> Result<()> {
        self.math_binary(0x28, 5, dst, src)
    }

    /// `xor`
    pub fn xor(&mut self, dst: Operand, src: Operand) -> Result<()> {
        self.math_binary(0x30, 6, dst, src)
    }

    /// `cmp`
    pub fn cmp(&mut self, dst: Operand, src: Operand) -> Result<()> {
        self.math_binary(0x38, 7, dst, src)
    }

    /// `test`
    pub fn test(&mut self, a: Operand, b: Operand) -> Result<()> {
        match (a, b) {
            (Operand::Reg(d), Operand::Reg(s)) => {
                self.check_gp2(d, s)?;
                let mut e = Encoding::new();
                e.int_op_size(d.size());
                e.opcode1(if d.size() == OpSize::B8 { 0x84 } else { 0x85 });
                e.rex(0, s.rex_bit(), 0, 0);
                e.rm_reg(s.id(), d);
                self.push_instr(&e, None)
            }
            (a, b) => Err(X64Error::Encoding(format!("test {a:?}, {b:?}"))),
        }
    }

    fn math_unary(&mut self, ext: u8, op: Operand) -> Result<()> {
        match op {
            Operand::Reg(r) => {
                let mut e = Encoding::new();
                e.int_op_size(r.size());
                e.opcode1(if r.size() == OpSize::B8 { 0xF6 } else { 0xF7 });
                if r.needs_rex_for_8bit() {
                    e.force_rex();
                }
                e.rm_reg(ext, r);
                self.push_instr(&e, None)
            }
            Operand::Mem { mem, size } => {
                let mut e = Encoding::new();
                e.int_op_size(size);
                e.opcode1(if size == OpSize::B8 { 0xF6 } else { 0xF7 });
                e.mem_operand(ext, &mem)?;
                self.push_instr(&e, None)
            }
            op => Err(X64Error::Encoding(format!("unary {op:?}"))),
        }
    }

    /// `not`
    pub fn not(&mut self, op: Operand) -> Result<()> {
        self.math_unary(2, op)
    }

    /// `neg`
    pub fn neg(&mut self, op: Operand) -> Result<()> {
        self.math_unary(3, op)
    }

    /// `div` (unsigned; divides rdx:rax)
    pub fn div(&mut self, op: Operand) -> Result<()> {
        self.math_unary(6, op)
    }

    /// `idiv` (signed; divides rdx:rax)
    pub fn idiv(&mut self, op: Operand) -> Result<()> {
        self.math_unary(7, op)
    }

    /// Two-operand `imul`.
    pub fn imul(&mut self, dst: Reg, src: Operand) -> Result<()> {
        match src {
            Operand::Reg(s) => {
                let mut e = Encoding::new();
                e.int_op_size(dst.size());
                e.opcode2(0x0F, 0xAF);
                e.rex(0, dst.rex_bit(), 0, 0);
                e.rm_reg(dst.id(), s);
                self.push_instr(&e, None)
            }
            Operand::Mem { mem, .. } => {
                let mut e = Encoding::new();
                e.int_op_size(dst.size());
                e.opcode2(0x0F, 0xAF);
                e.mem_operand(dst.id(), &mem)?;
                self.push_instr(&e, None)
            }
            src => Err(X64Error::Encoding(format!("imul {dst:?}, {src:?}"))),
        }
    }

    fn shift_op(&mut self, ext: u8, op: Operand, count: Operand) -> Result<()> {
        let (size, encode_rm): (OpSize, Box<dyn Fn(&mut Encoding) -> Result<()>>) = match op {
            Operand::Reg(r) => (
                r.size(),
                Box::new(move |e: &mut Encoding| {
                    if r.needs_rex_for_8bit() {
                        e.force_rex();
                    }
                    e.rm_reg(ext, r);
                    Ok(())
                }),
            ),
            Operand::Mem { mem, size } => (
                size,
                Box::new(move |e: &mut Encoding| e.mem_operand(ext, &mem)),
            ),
            op => return Err(X64Error::Encoding(format!("shift {op:?}"))),
        };
        let mut e = Encoding::new();
        e.int_op_size(size);
        match count {
            Operand::Reg(c) if c.id() == Reg::CL.id() && c.class() == RegClass::Gp => {
                e.opcode1(if size == OpSize::B8 { 0xD2 } else { 0xD3 });
                encode_rm(&mut e)?;
            }
            Operand::Imm { value, .. } => {
                e.opcode1(if size == OpSize::B8 { 0xC0 } else { 0xC1 });
                encode_rm(&mut e)?;
                e.imm(OpSize::B8, value);
            }
            count => return Err(X64Error::Encoding(format!("shift count {count:?}"))),
        }
        self.push_instr(&e, None)
    }

    /// `shl` (count in `cl` or immediate)
    pub fn shl(&mut self, op: Operand, count: Operand) -> Result<()> {
        self.shift_op(4, op, count)
    }

    /// `shr` (logical)
    pub fn shr(&mut self, op: Operand, count: Operand) -> Result<()> {
        self.shift_op(5, op, count)
    }

    /// `sar` (arithmetic)
    pub fn sar(&mut self, op: Operand, count: Operand) -> Result<()> {
        self.shift_op(7, op, count)
    }

    /// `lea`
    pub fn lea(&mut self, dst: Reg, src: Operand) -> Result<()> {
        match src {
            Operand::Mem { mem, .. } => {
                let mut e = Encoding::new();
                e.int_op_size(dst.size());
                e.opcode1(0x8D);
                e.mem_operand(dst.id(), &mem)?;
                self.push_instr(&e, None)
            }
            Operand::RipSym { sym, disp, .. } => {
                let mut e = Encoding::new();
                e.int_op_size(dst.size());
                e.opcode1(0x8D);
                e.rip_operand(dst.id(), disp);
                self.push_instr(&e, Some(InstrRef::SymDisp(sym)))
            }
            src => Err(X64Error::Encoding(format!("lea {dst:?}, {src:?}"))),
        }
    }

    /// `setcc` into an 8-bit register.
    pub fn setcc(&mut self, cc: CondCode, dst: Reg) -> Result<()> {
        let mut e = Encoding::new();
        e.opcode2(0x0F, 0x90 + cc.value());
        if dst.needs_rex_for_8bit() {
            e.force_rex();
        }
        e.rm_reg(0, dst.with_size(OpSize::B8));
        self.push_instr(&e, None)
    }

    // ----- control flow -------------------------------------------------

    /// `jcc` to a label (rel32 form).
    pub fn jcc(&mut self, cc: CondCode, target: LabelId) -> Result<()> {
        let mut e = Encoding::new();
        e.opcode2(0x0F, 0x80 + cc.value());
        e.imm(OpSize::B32, 0);
        self.push_instr(&e, Some(InstrRef::LabelImm(target)))
    }

    /// `jmp` to a label (rel32 form).
    pub fn jmp(&mut self, target: LabelId) -> Result<()> {
        let mut e = Encoding::new();
        e.opcode1(0xE9);
        e.imm(OpSize::B32, 0);
        self.push_instr(&e, Some(InstrRef::LabelImm(target)))
    }

    /// Direct `call` to a module symbol (rel32 form).
    pub fn call_sym(&mut self, target: SymbolId) -> Result<()> {
        let mut e = Encoding::new();
        e.opcode1(0xE8);
        e.imm(OpSize::B32, 0);
        self.push_instr(&e, Some(InstrRef::SymImm(target)))
    }

    /// `call qword ptr [rip + sym]`, used for external-symbol stub slots.
    pub fn call_rip(&mut self, slot: SymbolId) -> Result<()> {
        let mut e = Encoding::new();
        e.opcode1(0xFF);
        e.rip_operand(2, 0);
        self.push_instr(&e, Some(InstrRef::SymDisp(slot)))
    }

    /// Indirect `call` through a register.
    pub fn call_reg(&mut self, target: Reg) -> Result<()> {
        let mut e = Encoding::new();
        e.opcode1(0xFF);
        e.rm_reg(2, target.with_size(OpSize::B64));
        self.push_instr(&e, None)
    }

    /// `ret`
    pub fn ret(&mut self) -> Result<()> {
        let mut e = Encoding::new();
        e.opcode1(0xC3);
        self.push_instr(&e, None)
    }

    /// `push` a 64-bit register.
    pub fn push(&mut self, reg: Reg) -> Result<()> {
        let mut e = Encoding::new();
        e.rex(0, 0, 0, reg.rex_bit());
        e.opcode1(0x50 + reg.modrm_bits());
        self.push_instr(&e, None)
    }

    /// `pop` a 64-bit register.
    pub fn pop(&mut self, reg: Reg) -> Result<()> {
        let mut e = Encoding::new();
        e.rex(0, 0, 0, reg.rex_bit());
        e.opcode1(0x58 + reg.modrm_bits());
        self.push_instr(&e, None)
    }

    /// `cdq`: sign-extend eax into edx.
    pub fn cdq(&mut self) -> Result<()> {
        let mut e = Encoding::new();
        e.opcode1(0x99);
        self.push_instr(&e, None)
    }

    /// `cqo`: sign-extend rax into rdx.
    pub fn cqo(&mut self) -> Result<()> {
        let mut e = Encoding::new();
        e.rex(1, 0, 0, 0);
        e.opcode1(0x99);
        self.push_instr(&e, None)
    }

    /// `int3`
    pub fn int3(&mut self) -> Result<()> {
        let mut e = Encoding::new();
        e.opcode1(0xCC);
        self.push_instr(&e, None)
    }

    /// Emit `n` bytes of `nop`.
    pub fn nop(&mut self, n: usize) {
        for _ in 0..n {
            self.text.emit(&[0x90]);
        }
    }

    // ----- SSE ----------------------------------------------------------

    fn sse_rm(
        &mut self,
        prefix: Option<u8>,
        op2: u8,
        reg: Reg,
        rm: Operand,
        rex_w: u8,
    ) -> Result<()> {
        let mut e = Encoding::new();
        match prefix {
            Some(0x66) => {
                e.operand_size_override();
            }
            Some(p) => {
                e.rep_prefix(p);
            }
            None => {}
        }
        e.rex(rex_w, 0, 0, 0);
        e.opcode2(0x0F, op2);
        match rm {
            Operand::Reg(r) => {
                e.rex(0, reg.rex_bit(), 0, 0);
                e.rm_reg(reg.id(), r);
                self.push_instr(&e, None)
            }
            Operand::Mem { mem, .. } => {
                e.mem_operand(reg.id(), &mem)?;
                self.push_instr(&e, None)
            }
            Operand::RipSym { sym, disp, .. } => {
                e.rip_operand(reg.id(), disp);
                self.push_instr(&e, Some(InstrRef::SymDisp(sym)))
            }
            rm => Err(X64Error::Encoding(format!("sse operand {rm:?}"))),
        }
    }

    fn sse_prefix(double: bool) -> u8 {
        if double {
            0xF2
        } else {
            0xF3
        }
    }

    /// `movss`/`movsd` load (xmm ← rm).
    pub fn movs_load(&mut self, double: bool, dst: Reg, src: Operand) -> Result<()> {
        self.sse_rm(Some(Self::sse_prefix(double)), 0x10, dst, src, 0)
    }

    /// `movss`/`movsd` store (rm ← xmm).
    pub fn movs_store(&mut self, double: bool, dst: Operand, src: Reg) -> Result<()> {
        self.sse_rm(Some(Self::sse_prefix(double)), 0x11, src, dst, 0)
    }

    /// `adds[sd]`
    pub fn adds(&mut self, double: bool, dst: Reg, src: Operand) -> Result<()> {
        self.sse_rm(Some(Self::sse_prefix(double)), 0x58, dst, src, 0)
    }

    /// `subs[sd]`
    pub fn subs(&mut self, double: bool, dst: Reg, src: Operand) -> Result<()> {
        self.sse_rm(Some(Self::sse_prefix(double)), 0x5C, dst, src, 0)
    }

    /// `muls[sd]`
    pub fn muls(&mut self, double: bool, dst: Reg, src: Operand) -> Result<()> {
        self.sse_rm(Some(Self::sse_prefix(double)), 0x59, dst, src, 0)
    }

    /// `divs[sd]`
    pub fn divs(&mut self, double: bool, dst: Reg, src: Operand) -> Result<()> {
        self.sse_rm(Some(Self::sse_prefix(double)), 0x5E, dst, src, 0)
    }

    /// `ucomiss`/`ucomisd`
    pub fn ucomis(&mut self, double: bool, a: Reg, b: Operand) -> Result<()> {
        let prefix = if double { Some(0x66) } else { None };
        self.sse_rm(prefix, 0x2E, a, b, 0)
    }

    /// `cvtsi2ss`/`cvtsi2sd` from a 32- or 64-bit integer register.
    pub fn cvtsi2s(&mut self, double: bool, dst: Reg, src: Reg) -> Result<()> {
        let w = u8::from(src.size() == OpSize::B64);
        self.sse_rm(
            Some(Self::sse_prefix(double)),
            0x2A,
            dst,
            Operand::reg(src),
            w,
        )
    }

    /// `cvttss2si`/`cvttsd2si` into a 32- or 64-bit integer register.
    pub fn cvtts2si(&mut self, double: bool, dst: Reg, src: Reg) -> Result<()> {
        let w = u8::from(dst.size() == OpSize::B64);
        self.sse_rm(
            Some(Self::sse_prefix(double)),
            0x2C,
            dst,
            Operand::reg(src),
            w,
        )
    }

    /// `cvtss2sd` (when `to_double`) or `cvtsd2ss`.
    pub fn cvts2s(&mut self, to_double: bool, dst: Reg, src: Operand) -> Result<()> {
        self.sse_rm(Some(Self::sse_prefix(!to_double)), 0x5A, dst, src, 0)
    }

    /// `xorps` (used to zero or sign-flip XMM registers).
    pub fn xorps(&mut self, dst: Reg, src: Operand) -> Result<()> {
        self.sse_rm(None, 0x57, dst, src, 0)
    }

    /// `movd`/`movq` general register → XMM.
    pub fn movd_to_xmm(&mut self, dst: Reg, src: Reg) -> Result<()> {
        let w = u8::from(src.size() == OpSize::B64);
        self.sse_rm(Some(0x66), 0x6E, dst, Operand::reg(src), w)
    }

    /// `movd`/`movq` XMM → general register.
    pub fn movd_from_xmm(&mut self, dst: Reg, src: Reg) -> Result<()> {
        let w = u8::from(dst.size() == OpSize::B64);
        self.sse_rm(Some(0x66), 0x7E, src, Operand::reg(dst), w)
    }

    // ----- finalization -------------------------------------------------

    /// Resolve relocations, map the sections into executable memory, flip
    /// the pages to RX and hand back the loaded module.
    pub fn finalize(
        self,
        mut resolve_external: impl FnMut(&str) -> Option<*const u8>,
    ) -> Result<LoadedModule> {
        let text_len = self.text.bytes.len();
        let data_base = text_len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let total = data_base + self.data.bytes.len();

        let mut buf = ExecBuffer::alloc(total.max(1))?;
        let base_addr = buf.base() as u64;
        {
            let mem = buf.as_mut_slice();
            mem[..text_len].copy_from_slice(&self.text.bytes);
            mem[data_base..data_base + self.data.bytes.len()].copy_from_slice(&self.data.bytes);
        }

        // Absolute offset of every defined symbol within the buffer.
        let mut defined: HashMap<&str, u64> = HashMap::new();
        let mut exports: HashMap<String, (SymbolKind, u32)> = HashMap::new();
        for sym in &self.symbols {
            if let Some(off) = self.labels[sym.label.0 as usize].offset {
                let section_base = match self.labels[sym.label.0 as usize].section {
                    SectionKind::Text => 0usize,
                    SectionKind::Data => data_base,
                };
                defined.insert(sym.name.as_str(), section_base as u64 + u64::from(off));
                exports.insert(sym.name.clone(), (sym.kind, off));
            }
        }

        for sym in &self.symbols {
            let Some(sym_off) = self.labels[sym.label.0 as usize].offset else {
                continue;
            };
            let section_base = match self.labels[sym.label.0 as usize].section {
                SectionKind::Text => 0usize,
                SectionKind::Data => data_base,
            };
            for reloc in &sym.relocs {
                let patch = section_base + sym_off as usize + reloc.offset as usize;
                let target_addr = match defined.get(reloc.target.as_str()) {
                    Some(&off) => base_addr + off,
                    None => match resolve_external(&reloc.target) {
                        Some(p) => p as u64,
                        None => {
                            return Err(X64Error::UnresolvedSymbol(reloc.target.clone()));
                        }
                    },
                };
                let mem = buf.as_mut_slice();
                match reloc.kind {
                    RelocKind::Addr64 => {
                        let old = u64::from_le_bytes(
                            mem[patch..patch + 8].try_into().expect("addr64 slot"),
                        );
                        let val = target_addr.wrapping_add(old);
                        mem[patch..patch + 8].copy_from_slice(&val.to_le_bytes());
                    }
                    RelocKind::Rel32(tail) => {
                        let end = base_addr + patch as u64 + 4 + u64::from(tail);
                        let old = i64::from(i32::from_le_bytes(
                            mem[patch..patch + 4].try_into().expect("rel32 slot"),
                        ));
                        let delta = (target_addr as i64)
                            .wrapping_sub(end as i64)
                            .wrapping_add(old);
                        let narrow = i32::try_from(delta).map_err(|_| {
                            X64Error::RelocationOutOfRange(reloc.target.clone())
                        })?;
                        mem[patch..patch + 4].copy_from_slice(&narrow.to_le_bytes());
                    }
                }
            }
        }

        buf.protect_rx()?;
        debug!(text = text_len, data = self.data.bytes.len(), "module loaded");
        Ok(LoadedModule {
            buf,
            exports,
            data_base,
        })
    }
}

/// A finalized, executable module.
#[derive(Debug)]
pub struct LoadedModule {
    buf: ExecBuffer,
    exports: HashMap<String, (SymbolKind, u32)>,
    data_base: usize,
}

impl LoadedModule {
    /// Address of a defined function, ready to be cast to its signature.
    pub fn get_function(&self, name: &str) -> Option<*const u8> {
        match self.exports.get(name) {
            Some((SymbolKind::Function, off)) => {
                // Safety: offset points inside the mapped buffer.
                Some(unsafe { self.buf.base().add(*off as usize) })
            }
            _ => None,
        }
    }

    /// Address of a defined global variable.
    pub fn get_global(&self, name: &str) -> Option<*const u8> {
        match self.exports.get(name) {
            Some((SymbolKind::GlobalVar, off)) => {
                // Safety: offset points inside the mapped buffer.
                Some(unsafe { self.buf.base().add(self.data_base + *off as usize) })
            }
            _ => None,
        }
    }

    /// Section-relative offset of a defined symbol.
    pub fn symbol_offset(&self, name: &str) -> Option<u32> {
        self.exports.get(name).map(|&(_, off)| off)
    }
}
