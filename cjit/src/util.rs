//! Odds and ends shared by the driver and the test suites.

/// Test fixtures: a default external-symbol resolver backed by
/// Windows-x64-convention shims for the runtime routines the lowering may
/// call, plus a one-call source runner.
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use crate::{Compiler, Result};

    /// `memcpy` with the calling convention the generated code uses.
    pub extern "win64" fn memcpy_shim(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
        // Safety: the generated code passes valid, non-overlapping buffers.
        unsafe {
            core::ptr::copy_nonoverlapping(src, dst, n);
        }
        dst
    }

    /// `memset` with the calling convention the generated code uses.
    pub extern "win64" fn memset_shim(dst: *mut u8, value: i32, n: usize) -> *mut u8 {
        // Safety: the generated code passes a valid buffer.
        unsafe {
            core::ptr::write_bytes(dst, value as u8, n);
        }
        dst
    }

    /// Resolver covering the runtime routines the compiler may reference.
    pub fn default_resolver(name: &str) -> Option<*const u8> {
        match name {
            "memcpy" => Some(memcpy_shim as *const u8),
            "memset" => Some(memset_shim as *const u8),
            _ => None,
        }
    }

    /// Compile `source` and invoke its `main`, returning its exit value.
    pub fn run_main(source: &str) -> Result<i32> {
        let mut compiler = Compiler::new();
        let module = compiler.jit(source.as_bytes(), "test.c", default_resolver)?;
        let entry = module
            .get_function("main")
            .expect("program defines main");
        // Safety: the module was just produced for this machine, `main`
        // takes no arguments and returns int in eax under the convention
        // named in the signature.
        let main: extern "win64" fn() -> i32 = unsafe { core::mem::transmute(entry) };
        Ok(main())
    }
}
