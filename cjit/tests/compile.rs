//! Pipeline-level properties that do not require executing the output:
//! determinism, symbol bookkeeping, diagnostics.

use cjit::{Compiler, Error};

const PROGRAM: &str = "\
int helper(int x) { return x * 3; }
int used_global = 5;
static int quiet(int x) { return x; }
int main() { return helper(used_global); }
";

#[test]
fn emission_is_deterministic() {
    let build = || {
        let mut c = Compiler::new();
        let module = c.compile(PROGRAM.as_bytes(), "p.c").expect("compiles");
        let buf = c.emit(&module).expect("emits");
        (buf.text().to_vec(), buf.data().to_vec())
    };
    let (t1, d1) = build();
    let (t2, d2) = build();
    assert_eq!(t1, t2, "text sections differ between identical runs");
    assert_eq!(d1, d2, "data sections differ between identical runs");
}

#[test]
fn symbols_have_offsets() {
    let mut c = Compiler::new();
    let module = c.compile(PROGRAM.as_bytes(), "p.c").expect("compiles");
    let buf = c.emit(&module).expect("emits");

    let main_off = buf.symbol_offset("main").expect("main is defined");
    let helper_off = buf.symbol_offset("helper").expect("helper is defined");
    assert_ne!(main_off, helper_off);
    // Functions are 16-byte aligned within .text.
    assert_eq!(main_off % 16, 0);
    assert_eq!(helper_off % 16, 0);
    assert!(buf.symbol_offset("used_global").is_some());
    assert!(buf.symbol_offset("absent").is_none());
}

#[test]
fn unreachable_static_inline_functions_are_elided() {
    let source = "\
static inline int dead(int x) { return x; }
int main() { return 0; }
";
    let mut c = Compiler::new();
    let module = c.compile(source.as_bytes(), "p.c").expect("compiles");
    let buf = c.emit(&module).expect("emits");
    assert!(buf.symbol_offset("main").is_some());
    assert!(
        buf.symbol_offset("dead").is_none(),
        "static inline function with no callers must not be emitted"
    );
}

#[test]
fn reachable_static_inline_functions_survive() {
    let source = "\
static inline int thrice(int x) { return 3 * x; }
int main() { return thrice(2); }
";
    let mut c = Compiler::new();
    let module = c.compile(source.as_bytes(), "p.c").expect("compiles");
    let buf = c.emit(&module).expect("emits");
    assert!(buf.symbol_offset("thrice").is_some());
}

#[test]
fn first_error_aborts_with_location() {
    let cases: &[(&str, &str)] = &[
        ("int main() { return \"unterminated; }", "1"),
        ("int main() { return 1 +; }", "1"),
        ("int main() { return *1; }", "1"),
        ("int a[1/0]; int main() { return 0; }", "1"),
        ("int main() { return y; }", "1"),
    ];
    for (source, line) in cases {
        let mut c = Compiler::new();
        let err = c
            .compile(source.as_bytes(), "bad.c")
            .err()
            .unwrap_or_else(|| panic!("expected an error for: {source}"));
        assert!(err.is_source_error(), "wrong error class for: {source}");
        let msg = err.to_string();
        assert!(
            msg.contains(&format!("bad.c:{line}")),
            "missing location in '{msg}'"
        );
    }
}

#[test]
fn constant_divide_by_zero_is_reported() {
    let mut c = Compiler::new();
    let err = c
        .compile(b"int x = 1 / 0; int main() { return 0; }", "div.c")
        .err()
        .expect("constant division by zero is an error");
    assert!(matches!(err, Error::Front(_)));
    assert!(err.to_string().contains("zero"));
}

#[test]
fn unresolved_external_surfaces_at_finalize() {
    let mut c = Compiler::new();
    let err = c
        .jit(
            b"int external_thing(int); int main() { return external_thing(1); }",
            "ext.c",
            |_| None,
        )
        .err()
        .expect("unresolved external must fail at finalize");
    assert!(err.to_string().contains("external_thing"));
}

#[test]
fn tentative_definition_is_superseded() {
    let source = "\
int g;
int g = 9;
int main() { return g; }
";
    let mut c = Compiler::new();
    let module = c.compile(source.as_bytes(), "tent.c").expect("compiles");
    // Exactly one definition of g survives.
    let count = module
        .globals
        .iter()
        .filter(|gv| c.sess.interner.resolve(gv.name) == "g")
        .count();
    assert_eq!(count, 1);
}

#[test]
fn duplicate_definition_is_rejected() {
    let mut c = Compiler::new();
    let err = c
        .compile(
            b"int f() { return 1; } int f() { return 2; } int main() { return f(); }",
            "dup.c",
        )
        .err()
        .expect("redefinition is an error");
    assert!(err.to_string().contains("redefinition"));
}
