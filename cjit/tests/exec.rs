//! End-to-end execution tests: compile a C source in memory, call its
//! `main` and check the returned value.

#![cfg(target_arch = "x86_64")]

use rstest::rstest;

use cjit::util::test_helpers::run_main;

fn returns(source: &str, expected: i32) {
    let got = run_main(source).expect("program compiles and runs");
    assert_eq!(got, expected, "program:\n{source}");
}

#[rstest]
#[case("int main(){ return 0; }", 0)]
#[case("int f(int a, int b){ return a*b - b; } int main(){ return f(3,2); }", 4)]
#[case(
    "int main(){ int a[3]={1,2,3}; int s=0; for(int i=0;i<3;i++) s+=a[i]; return s-6; }",
    0
)]
#[case(
    "typedef struct{int x,y;} P; \
     P add(P a, P b){ P r; r.x=a.x+b.x; r.y=a.y+b.y; return r; } \
     int main(){ P a={1,2}, b={3,4}, c=add(a,b); return c.x+c.y-10; }",
    0
)]
#[case(
    "int fact(int n){ return n<=1 ? 1 : n*fact(n-1); } int main(){ return fact(5)-120; }",
    0
)]
#[case(
    "int main(){ int x=0; switch(2){ case 1: x=10; break; case 2: x=20; break; default: x=30; } return x-20; }",
    0
)]
fn reference_scenarios(#[case] source: &str, #[case] expected: i32) {
    returns(source, expected);
}

#[test]
fn arithmetic_and_precedence() {
    returns("int main(){ return 2 + 3 * 4 - 10 / 2; }", 9);
    returns("int main(){ return (2 + 3) * 4 % 7; }", 6);
    returns("int main(){ return 1 << 4 | 3; }", 19);
    returns("int main(){ return 0x7fffffff % 1000; }", 647);
    returns("int main(){ return -5 / 2; }", -2);
    returns("int main(){ return -5 % 2; }", -1);
}

#[test]
fn unsigned_arithmetic() {
    returns("int main(){ unsigned a = 3000000000u; return a / 1000000000u; }", 3);
    returns("int main(){ unsigned a = 1; return (a - 2) > 0; }", 1);
    returns(
        "int main(){ unsigned long long a = 1ull << 40; return (int)(a >> 36); }",
        16,
    );
}

#[test]
fn signed_overflow_wraps_in_constants() {
    // Two's-complement wrap, not a diagnostic.
    returns("int main(){ int x = 0x7FFFFFFF + 1; return x == -2147483648; }", 1);
}

#[test]
fn comparisons_and_logic() {
    returns("int main(){ return (1 < 2) + (2 <= 2) + (3 > 2) + (2 >= 3); }", 3);
    returns("int main(){ return 1 && 2; }", 1);
    returns("int main(){ return 0 || 0; }", 0);
    returns("int main(){ int x = 0; int y = x ? 10 : 20; return y; }", 20);
    returns("int main(){ return !42 + !0; }", 1);
    // Short-circuit: the right side must not run.
    returns(
        "int g = 0; int boom(){ g = 1; return 1; } \
         int main(){ int r = 0 && boom(); return r + g; }",
        0,
    );
}

#[test]
fn loops() {
    returns(
        "int main(){ int s = 0; int i = 0; while (i < 10) { s += i; i++; } return s; }",
        45,
    );
    returns(
        "int main(){ int s = 0; int i = 0; do { s += i; i++; } while (i < 5); return s; }",
        10,
    );
    returns(
        "int main(){ int s = 0; for (int i = 0; i < 10; i++) { if (i % 2) continue; if (i > 6) break; s += i; } return s; }",
        12,
    );
}

#[test]
fn goto_and_labels() {
    returns(
        "int main(){ int i = 0; again: i++; if (i < 4) goto again; return i; }",
        4,
    );
}

#[test]
fn switch_ranges_and_fallthrough() {
    returns(
        "int classify(int c){ switch(c){ case '0' ... '9': return 1; case 'a' ... 'z': return 2; default: return 0; } } \
         int main(){ return classify('5') * 100 + classify('q') * 10 + classify('!'); }",
        120,
    );
    returns(
        "int main(){ int x = 0; switch (1) { case 1: x += 1; case 2: x += 2; break; case 3: x += 4; } return x; }",
        3,
    );
}

#[test]
fn pointers_and_arrays() {
    returns(
        "int main(){ int x = 3; int *p = &x; *p = 5; return x; }",
        5,
    );
    returns(
        "int main(){ int a[4] = {1,2,3,4}; int *p = a + 1; return p[1] + *(a+3); }",
        7,
    );
    returns(
        "int main(){ int a[4]; int *p = &a[3]; int *q = &a[1]; return p - q; }",
        2,
    );
    returns(
        "int sum(int *v, int n){ int s = 0; for (int i = 0; i < n; i++) s += v[i]; return s; } \
         int main(){ int a[5] = {1,2,3,4,5}; return sum(a, 5); }",
        15,
    );
    returns(
        "int main(){ int a[2][3] = {{1,2,3},{4,5,6}}; return a[1][2]; }",
        6,
    );
}

#[test]
fn strings_and_chars() {
    returns("int main(){ char *s = \"hello\"; return s[1]; }", 'e' as i32);
    returns("int main(){ return sizeof(\"abc\"); }", 4);
    returns("int main(){ return 'A' + 2; }", 67);
    returns(
        "int len(char *s){ int n = 0; while (s[n]) n++; return n; } \
         int main(){ return len(\"four\"); }",
        4,
    );
}

#[test]
fn structs_and_unions() {
    returns(
        "struct S { char c; int i; char d; }; int main(){ return sizeof(struct S); }",
        12,
    );
    returns(
        "struct S { int a; int b; }; \
         int main(){ struct S s; s.a = 3; s.b = 4; struct S t = s; return t.a * 10 + t.b; }",
        34,
    );
    returns(
        "union U { int i; char c; }; int main(){ union U u; u.i = 0x41424344; return u.c; }",
        0x44,
    );
    returns(
        "struct P { int x, y; }; \
         int get(struct P *p){ return p->x - p->y; } \
         int main(){ struct P p = {9, 4}; return get(&p); }",
        5,
    );
    // Size 12: returned through the hidden pointer.
    returns(
        "struct T { int a, b, c; }; \
         struct T make(void){ struct T t = {1, 2, 3}; return t; } \
         int main(){ struct T t = make(); return t.a + t.b + t.c; }",
        6,
    );
    returns(
        "struct N { struct N *next; int v; }; \
         int main(){ struct N a = {0, 1}; struct N b = {&a, 2}; return b.next->v + b.v; }",
        3,
    );
}

#[test]
fn bitfields() {
    returns(
        "struct B { unsigned a : 3; unsigned b : 5; int c : 8; }; \
         int main(){ struct B x; x.a = 5; x.b = 17; x.c = -3; return x.a + x.b + x.c; }",
        19,
    );
    returns(
        "struct B { unsigned a : 4; unsigned b : 4; }; int main(){ return sizeof(struct B); }",
        4,
    );
}

#[test]
fn enums_and_typedefs() {
    returns(
        "enum E { A, B, C = 10, D }; int main(){ return A + B + C + D; }",
        22,
    );
    returns("typedef int word; int main(){ word w = 6; return w * 7; }", 42);
}

#[test]
fn globals_and_initializers() {
    returns("int g = 12; int main(){ return g; }", 12);
    returns(
        "int g[4] = {1, 2, 3}; int main(){ return g[0] + g[1] + g[2] + g[3]; }",
        6,
    );
    returns(
        "int x = 7; int *p = &x; int main(){ return *p; }",
        7,
    );
    returns(
        "struct S { int a; char b; } s = { 300, 'x' }; int main(){ return s.a - 300 + (s.b == 'x'); }",
        1,
    );
    returns(
        "int counter(void){ static int n = 0; return ++n; } \
         int main(){ counter(); counter(); return counter(); }",
        3,
    );
    returns(
        "int a[2][2] = { [1] = {3, 4} }; int main(){ return a[0][0] + a[1][0] + a[1][1]; }",
        7,
    );
    returns(
        "struct P { int x, y; } p = { .y = 9 }; int main(){ return p.x + p.y; }",
        9,
    );
}

#[test]
fn floats() {
    returns("int main(){ double d = 1.5; return (int)(d * 4.0); }", 6);
    returns("int main(){ float f = 2.5f; return (int)(f + f); }", 5);
    returns("int main(){ double d = 7.0; return d > 6.5; }", 1);
    returns("int main(){ int i = 9; double d = i; return (int)(d / 2.0); }", 4);
    returns(
        "double half(double x){ return x / 2.0; } int main(){ return (int)half(9.0); }",
        4,
    );
}

#[test]
fn casts_and_conversions() {
    returns("int main(){ char c = 300; return c; }", 44);
    returns("int main(){ unsigned char c = 200; return c + 100; }", 300);
    returns("int main(){ short s = -1; long long w = s; return w == -1; }", 1);
    returns("int main(){ _Bool b = 42; return b; }", 1);
    returns("int main(){ long long x = 1; x <<= 33; return (int)(x >> 32); }", 2);
}

#[test]
fn compound_assignment_and_inc_dec() {
    returns(
        "int main(){ int x = 10; x += 5; x -= 3; x *= 2; x /= 4; x %= 4; return x; }",
        2,
    );
    returns("int main(){ int x = 1; x <<= 3; x |= 1; x ^= 2; x &= 14; return x; }", 10);
    returns("int main(){ int i = 5; int a = i++; int b = ++i; return a * 10 + b; }", 57);
    returns(
        "int main(){ int a[3] = {1,2,3}; int *p = a + 2; int x = *p--; return x + *p; }",
        5,
    );
}

#[test]
fn function_features() {
    // More than four arguments spill onto the stack.
    returns(
        "int sum6(int a, int b, int c, int d, int e, int f){ return a+b+c+d+e+f; } \
         int main(){ return sum6(1,2,3,4,5,6); }",
        21,
    );
    returns(
        "int apply(int (*op)(int, int), int a, int b){ return op(a, b); } \
         int sub(int a, int b){ return a - b; } \
         int main(){ return apply(sub, 9, 3); }",
        6,
    );
    returns(
        "int odd(int n); \
         int even(int n){ return n == 0 ? 1 : odd(n - 1); } \
         int odd(int n){ return n == 0 ? 0 : even(n - 1); } \
         int main(){ return even(10) * 10 + odd(10); }",
        10,
    );
    returns("int main(){ return sizeof(__func__); }", 5);
}

#[test]
fn generic_selection() {
    returns(
        "int main(){ return _Generic(1, int: 10, double: 20, default: 30); }",
        10,
    );
    returns(
        "int main(){ return _Generic(1.5f, int: 10, float: 20, default: 30); }",
        20,
    );
    returns(
        "int main(){ return _Generic((char)0, int: 10, double: 20, default: 30); }",
        30,
    );
}

#[test]
fn memcpy_runtime_fallback() {
    // Large enough to bypass the unrolled copy.
    returns(
        "struct Big { int v[32]; }; \
         int main(){ struct Big a; for (int i = 0; i < 32; i++) a.v[i] = i; \
                     struct Big b = a; return b.v[31]; }",
        31,
    );
}

#[test]
fn comma_and_nested_calls() {
    returns("int main(){ int x = (1, 2, 3); return x; }", 3);
    returns(
        "int twice(int x){ return 2 * x; } int main(){ return twice(twice(twice(1))); }",
        8,
    );
}
