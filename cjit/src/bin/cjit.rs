//! Thin command-line driver: compile one C source file, run its `main`,
//! exit with its return value.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use cjit::Compiler;

#[derive(Parser)]
#[command(name = "cjit", about = "Compile and run a C source file in memory")]
struct Args {
    /// Source file (already preprocessed).
    source: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let source = match std::fs::read(&args.source) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("cjit: cannot read {}: {err}", args.source.display());
            return ExitCode::FAILURE;
        }
    };
    let filename = args.source.display().to_string();

    let mut compiler = Compiler::new();
    let module = match compiler.jit(&source, &filename, resolver) {
        Ok(module) => module,
        Err(err) => {
            eprintln!("cjit: {err}");
            return ExitCode::FAILURE;
        }
    };

    let Some(entry) = module.get_function("main") else {
        eprintln!("cjit: no main function");
        return ExitCode::FAILURE;
    };
    // Safety: freshly generated code for this machine; `main` takes no
    // arguments under the convention the compiler targets.
    let main: extern "win64" fn() -> i32 = unsafe { core::mem::transmute(entry) };
    ExitCode::from(main() as u8)
}

extern "win64" fn memcpy_shim(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    unsafe {
        core::ptr::copy_nonoverlapping(src, dst, n);
    }
    dst
}

extern "win64" fn memset_shim(dst: *mut u8, value: i32, n: usize) -> *mut u8 {
    unsafe {
        core::ptr::write_bytes(dst, value as u8, n);
    }
    dst
}

fn resolver(name: &str) -> Option<*const u8> {
    match name {
        "memcpy" => Some(memcpy_shim as *const u8),
        "memset" => Some(memset_shim as *const u8),
        _ => None,
    }
}
