//! Assembler-level tests: byte sequences, label fixups, relocation
//! resolution and a minimal load-and-call round trip.

use cjit_x64::asm::Assembler;
use cjit_x64::cc::CondCode;
use cjit_x64::operand::{Mem, Operand};
use cjit_x64::reg::{OpSize, Reg};
use cjit_x64::{RelocKind, SectionKind};

#[test]
fn simple_instructions_encode_as_expected() {
    let mut asm = Assembler::new();
    let f = asm.func_declare("f");
    asm.func_begin(f).unwrap();
    asm.mov(Operand::reg(Reg::EAX), Operand::imm(42, OpSize::B32))
        .unwrap();
    asm.add(Operand::reg(Reg::EAX), Operand::imm(1, OpSize::B32))
        .unwrap();
    asm.ret().unwrap();
    asm.func_end();

    assert_eq!(
        asm.text(),
        &[
            0xB8, 0x2A, 0x00, 0x00, 0x00, // mov eax, 42
            0x83, 0xC0, 0x01, // add eax, 1
            0xC3, // ret
        ]
    );
}

#[test]
fn forward_label_is_patched_on_bind() {
    let mut asm = Assembler::new();
    let f = asm.func_declare("f");
    asm.func_begin(f).unwrap();
    let target = asm.label_alloc(SectionKind::Text);
    asm.jmp(target).unwrap(); // E9 rel32, 5 bytes
    asm.nop(3);
    asm.label_bind(target);
    asm.ret().unwrap();
    asm.func_end();

    // Displacement is measured from the end of the jmp: 3 bytes of nops.
    assert_eq!(&asm.text()[..5], &[0xE9, 0x03, 0x00, 0x00, 0x00]);
    // Backward reference resolves immediately.
    let mut asm2 = Assembler::new();
    let g = asm2.func_declare("g");
    asm2.func_begin(g).unwrap();
    let top = asm2.label_alloc(SectionKind::Text);
    asm2.label_bind(top);
    asm2.jmp(top).unwrap();
    asm2.func_end();
    assert_eq!(&asm2.text()[..5], &[0xE9, 0xFB, 0xFF, 0xFF, 0xFF]); // -5
}

#[test]
fn jcc_uses_condition_encoding() {
    let mut asm = Assembler::new();
    let f = asm.func_declare("f");
    asm.func_begin(f).unwrap();
    let l = asm.label_alloc(SectionKind::Text);
    asm.label_bind(l);
    asm.jcc(CondCode::Ne, l).unwrap();
    asm.func_end();
    assert_eq!(&asm.text()[..2], &[0x0F, 0x85]);
}

#[test]
fn data_symbols_get_aligned_offsets() {
    let mut asm = Assembler::new();
    let a = asm.global_var_declare("a");
    asm.global_var_define(a, &[1], 1, &[]).unwrap();
    let b = asm.global_var_declare("b");
    asm.global_var_define(b, &[0; 8], 8, &[]).unwrap();

    assert_eq!(asm.symbol_offset("a"), Some(0));
    assert_eq!(asm.symbol_offset("b"), Some(8));
}

#[cfg(target_arch = "x86_64")]
#[test]
fn finalize_produces_callable_code() {
    let mut asm = Assembler::new();

    let gv = asm.global_var_declare("value");
    asm.global_var_define(gv, &7i64.to_le_bytes(), 8, &[]).unwrap();

    // fn read_value() -> i64 { value + 1 }
    let f = asm.func_declare("read_value");
    asm.func_begin(f).unwrap();
    let rip = Operand::RipSym {
        sym: gv,
        disp: 0,
        size: OpSize::B64,
    };
    asm.mov(Operand::reg(Reg::RAX), rip).unwrap();
    asm.add(Operand::reg(Reg::RAX), Operand::imm(1, OpSize::B64))
        .unwrap();
    asm.ret().unwrap();
    asm.func_end();

    let module = asm.finalize(|_| None).expect("no externals to resolve");
    let entry = module.get_function("read_value").expect("defined");
    let read_value: extern "win64" fn() -> i64 = unsafe { core::mem::transmute(entry) };
    assert_eq!(read_value(), 8);
    assert_eq!(module.symbol_offset("value"), Some(0));
}

#[cfg(target_arch = "x86_64")]
#[test]
fn external_symbols_resolve_through_addr64_slots() {
    extern "win64" fn forty_two() -> i64 {
        42
    }

    let mut asm = Assembler::new();
    let slot = asm.global_var_declare("__imp_forty_two");
    asm.global_var_define(slot, &[0; 8], 8, &[(RelocKind::Addr64, 0, "forty_two".into())])
        .unwrap();

    let f = asm.func_declare("call_out");
    asm.func_begin(f).unwrap();
    // Leaf call with a properly aligned stack.
    asm.sub(Operand::reg(Reg::RSP), Operand::imm(40, OpSize::B64))
        .unwrap();
    asm.call_rip(slot).unwrap();
    asm.add(Operand::reg(Reg::RSP), Operand::imm(40, OpSize::B64))
        .unwrap();
    asm.ret().unwrap();
    asm.func_end();

    let module = asm
        .finalize(|name| {
            (name == "forty_two").then_some(forty_two as *const u8)
        })
        .expect("external resolves");
    let entry = module.get_function("call_out").expect("defined");
    let call_out: extern "win64" fn() -> i64 = unsafe { core::mem::transmute(entry) };
    assert_eq!(call_out(), 42);
}

#[test]
fn unresolved_external_is_an_error() {
    let mut asm = Assembler::new();
    let slot = asm.global_var_declare("__imp_missing");
    asm.global_var_define(slot, &[0; 8], 8, &[(RelocKind::Addr64, 0, "missing".into())])
        .unwrap();
    let err = asm.finalize(|_| None).unwrap_err();
    assert!(err.to_string().contains("missing"));
}

#[test]
fn memory_operand_corner_cases() {
    let mut asm = Assembler::new();
    let f = asm.func_declare("f");
    asm.func_begin(f).unwrap();
    // mov rax, [rsp] requires a SIB byte.
    asm.mov(
        Operand::reg(Reg::RAX),
        Operand::mem(Mem::base(Reg::RSP), OpSize::B64),
    )
    .unwrap();
    asm.func_end();
    assert_eq!(asm.text(), &[0x48, 0x8B, 0x04, 0x24]);
}
