//! Typed abstract syntax tree.
//!
//! Two discriminated unions: [`ExprKind`] for expressions (every node
//! carries a fully resolved [`TypeId`] before IR building) and [`StmtKind`]
//! for statements. Control-flow statements carry the [`Label`]s the parser
//! allocated for their branch targets; `break`/`continue`/`goto`/`case` are
//! all bound to labels by the time a function body leaves the parser.

use crate::ctype::{Member, TypeId};
use crate::intern::Sym;
use crate::obj::ObjId;
use crate::session::Label;
use crate::SourceLoc;

/// Binary operators that survive into the AST.
///
/// `>` and `>=` are canonicalized by the parser into swapped `<` / `<=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+` (numeric; pointer arithmetic becomes [`ExprKind::Gep`])
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl BinaryOp {
    /// Whether the operator yields `int` regardless of operand type.
    pub fn is_comparison(self) -> bool {
        matches!(self, Self::Eq | Self::Ne | Self::Lt | Self::Le)
    }
}

/// An expression with its resolved type.
#[derive(Debug, Clone)]
pub struct Expr {
    /// Node payload.
    pub kind: ExprKind,
    /// Resolved type; never incomplete after semantic analysis.
    pub ty: TypeId,
    /// Source position.
    pub loc: SourceLoc,
}

/// Expression node kinds.
#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Do-nothing placeholder (empty initializer slots).
    Null,
    /// Integer constant.
    Num(i64),
    /// Floating constant.
    Fnum(f64),
    /// Variable reference.
    Var(ObjId),
    /// Binary arithmetic / comparison.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Unary minus.
    Neg(Box<Expr>),
    /// Logical not (`!`), yields `int`.
    Not(Box<Expr>),
    /// Bitwise not (`~`).
    BitNot(Box<Expr>),
    /// Short-circuit `&&`, yields `int`.
    LogAnd {
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Short-circuit `||`, yields `int`.
    LogOr {
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Simple assignment; value is the stored value.
    Assign {
        /// Assigned lvalue.
        lhs: Box<Expr>,
        /// Stored value, already converted to the lvalue type.
        rhs: Box<Expr>,
    },
    /// `+=`-family assignment evaluating the lvalue address once.
    CompoundAssign {
        /// Underlying operator.
        op: BinaryOp,
        /// Assigned lvalue.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// `?:`.
    Cond {
        /// Condition.
        cond: Box<Expr>,
        /// Then arm.
        then_expr: Box<Expr>,
        /// Else arm.
        else_expr: Box<Expr>,
    },
    /// Comma operator.
    Comma {
        /// Discarded operand.
        lhs: Box<Expr>,
        /// Result operand.
        rhs: Box<Expr>,
    },
    /// Member access on a struct/union lvalue.
    Member {
        /// Aggregate expression.
        base: Box<Expr>,
        /// Resolved member record (offset, GEP index, bitfield info).
        member: Member,
    },
    /// Address-of; never issues a load.
    Addr(Box<Expr>),
    /// Pointer dereference.
    Deref(Box<Expr>),
    /// Cast to `self.ty`.
    Cast(Box<Expr>),
    /// Zero the whole storage of a local before specified-field init.
    MemZero(ObjId),
    /// Function call.
    FuncCall {
        /// Callee expression (decayed to a function pointer).
        callee: Box<Expr>,
        /// The function type being invoked.
        func_ty: TypeId,
        /// Arguments, already converted to parameter types.
        args: Vec<Expr>,
    },
    /// Scaled pointer arithmetic: `ptr + index` in elements of the base type.
    Gep {
        /// Base pointer (or array lvalue).
        ptr: Box<Expr>,
        /// Element index, any integer type.
        index: Box<Expr>,
    },
}

/// A statement.
#[derive(Debug, Clone)]
pub struct Stmt {
    /// Node payload.
    pub kind: StmtKind,
    /// Source position.
    pub loc: SourceLoc,
}

/// One `case`/`case ...` arm recorded on the owning `switch`.
#[derive(Debug, Clone, Copy)]
pub struct CaseArm {
    /// Low bound (inclusive).
    pub lo: i64,
    /// High bound (inclusive); equals `lo` for a plain case.
    pub hi: i64,
    /// Label of the arm's body.
    pub label: Label,
}

/// Statement node kinds.
#[derive(Debug, Clone)]
pub enum StmtKind {
    /// `return`.
    Return(Option<Expr>),
    /// `if`.
    If {
        /// Condition.
        cond: Expr,
        /// Then branch.
        then_stmt: Box<Stmt>,
        /// Optional else branch.
        else_stmt: Option<Box<Stmt>>,
        /// Branch target labels.
        then_label: Label,
        /// Else target; equals `end_label` when there is no else branch.
        else_label: Label,
        /// Join label.
        end_label: Label,
    },
    /// `for` and `while` (while has no init/inc).
    For {
        /// Loop init; declaration or expression statement.
        init: Option<Box<Stmt>>,
        /// Controlling condition; absent means forever.
        cond: Option<Expr>,
        /// Increment expression.
        inc: Option<Expr>,
        /// Body.
        body: Box<Stmt>,
        /// `break` target.
        break_label: Label,
        /// `continue` target.
        continue_label: Label,
        /// Head of the body.
        body_label: Label,
    },
    /// `do`-`while`.
    DoWhile {
        /// Body.
        body: Box<Stmt>,
        /// Condition checked after the body.
        cond: Expr,
        /// `break` target.
        break_label: Label,
        /// `continue` target.
        continue_label: Label,
        /// Head of the body.
        body_label: Label,
    },
    /// `switch`.
    Switch {
        /// Controlling expression.
        cond: Expr,
        /// Body containing the case statements.
        body: Box<Stmt>,
        /// All case arms in source order.
        cases: Vec<CaseArm>,
        /// Label of the `default` arm, if present.
        default_label: Option<Label>,
        /// `break` target.
        break_label: Label,
    },
    /// `case` / `default` arm inside a switch body.
    Case {
        /// Arm body.
        body: Box<Stmt>,
        /// Label the owning switch jumps to.
        label: Label,
    },
    /// Compound statement.
    Block(Vec<Stmt>),
    /// `goto`, bound to the unique label of its target.
    Goto {
        /// Source label name.
        name: Sym,
        /// Resolved target.
        label: Label,
    },
    /// Labeled statement.
    Labeled {
        /// Source label name.
        name: Sym,
        /// Unique label id.
        label: Label,
        /// The labeled statement.
        stmt: Box<Stmt>,
    },
    /// Expression statement.
    Expr(Expr),
    /// Inline assembly, carried as an opaque string.
    Asm {
        /// Raw assembly text.
        code: Sym,
    },
}
