//! Expression parsing with interleaved type checking.
//!
//! Every constructor resolves the node type immediately: usual arithmetic
//! conversions are materialized as cast nodes, pointer arithmetic becomes a
//! scaled [`ExprKind::Gep`], and `>` / `>=` are canonicalized to swapped
//! `<` / `<=`.

use crate::ast::{BinaryOp, Expr, ExprKind};
use crate::ctype::{Member, TypeId, TypeKind, TypeTable};
use crate::obj::ObjFlags;
use crate::token::{TokenKind, TokenValue};
use crate::{Result, SourceLoc};

use super::{Parser, VarScopeEntry};

impl<'s> Parser<'s> {
    pub(crate) fn new_num(&self, value: i64, loc: SourceLoc) -> Expr {
        Expr {
            kind: ExprKind::Num(value),
            ty: TypeTable::INT,
            loc,
        }
    }

    fn new_typed_num(&self, value: i64, ty: TypeId, loc: SourceLoc) -> Expr {
        Expr {
            kind: ExprKind::Num(value),
            ty,
            loc,
        }
    }

    /// Wrap `expr` in a cast to `ty`.
    pub(crate) fn new_cast(&self, expr: Expr, ty: TypeId) -> Expr {
        let loc = expr.loc;
        Expr {
            kind: ExprKind::Cast(Box::new(expr)),
            ty,
            loc,
        }
    }

    fn cast_if_needed(&self, expr: Expr, ty: TypeId) -> Expr {
        if expr.ty == ty {
            expr
        } else {
            self.new_cast(expr, ty)
        }
    }

    /// Apply the usual arithmetic conversions to a binary operand pair.
    fn usual_arith_conv(&mut self, lhs: Expr, rhs: Expr) -> (Expr, Expr, TypeId) {
        let common = self.sess.types.common_type(lhs.ty, rhs.ty);
        let lhs = self.cast_if_needed(lhs, common);
        let rhs = self.cast_if_needed(rhs, common);
        (lhs, rhs, common)
    }

    fn is_lvalue(&self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Var(id) => !self.unit.get(*id).is_function(),
            ExprKind::Deref(_) | ExprKind::Member { .. } => true,
            _ => false,
        }
    }

    // ----- grammar ------------------------------------------------------

    /// expr = assign ("," expr)*
    pub(crate) fn expr(&mut self) -> Result<Expr> {
        let lhs = self.assign()?;
        if self.is(TokenKind::Comma) {
            let loc = self.loc();
            self.advance();
            let rhs = self.expr()?;
            let ty = rhs.ty;
            return Ok(Expr {
                kind: ExprKind::Comma {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                ty,
                loc,
            });
        }
        Ok(lhs)
    }

    /// assign = conditional (assign-op assign)?
    pub(crate) fn assign(&mut self) -> Result<Expr> {
        let lhs = self.conditional()?;

        let compound = |k: TokenKind| -> Option<BinaryOp> {
            match k {
                TokenKind::AddAssign => Some(BinaryOp::Add),
                TokenKind::SubAssign => Some(BinaryOp::Sub),
                TokenKind::MulAssign => Some(BinaryOp::Mul),
                TokenKind::DivAssign => Some(BinaryOp::Div),
                TokenKind::ModAssign => Some(BinaryOp::Mod),
                TokenKind::AndAssign => Some(BinaryOp::BitAnd),
                TokenKind::OrAssign => Some(BinaryOp::BitOr),
                TokenKind::XorAssign => Some(BinaryOp::BitXor),
                TokenKind::ShlAssign => Some(BinaryOp::Shl),
                TokenKind::ShrAssign => Some(BinaryOp::Shr),
                _ => None,
            }
        };

        if self.is(TokenKind::Assign) {
            let loc = self.loc();
            self.advance();
            let rhs = self.assign()?;
            return self.new_assign(lhs, rhs, loc);
        }
        if let Some(op) = compound(self.kind()) {
            let loc = self.loc();
            self.advance();
            let rhs = self.assign()?;
            return self.new_compound(op, lhs, rhs, loc);
        }
        Ok(lhs)
    }

    pub(crate) fn new_assign(&mut self, lhs: Expr, rhs: Expr, loc: SourceLoc) -> Result<Expr> {
        if !self.is_lvalue(&lhs) {
            return Err(self.type_err(loc, "not an lvalue".to_string()));
        }
        let lty = self.sess.types.get(lhs.ty).clone();
        if lty.kind == TypeKind::Array {
            return Err(self.type_err(loc, "array is not assignable".to_string()));
        }
        let rhs = if lty.is_aggregate() {
            if !self.sess.types.is_compatible(lhs.ty, rhs.ty) {
                return Err(self.type_err(loc, "incompatible types in assignment".to_string()));
            }
            rhs
        } else {
            self.cast_if_needed(rhs, lhs.ty)
        };
        let ty = lhs.ty;
        Ok(Expr {
            kind: ExprKind::Assign {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            loc,
        })
    }

    /// conditional = logor ("?" expr ":" conditional)?
    pub(crate) fn conditional(&mut self) -> Result<Expr> {
        let cond = self.logor()?;
        if !self.is(TokenKind::Question) {
            return Ok(cond);
        }
        let loc = self.loc();
        self.advance();
        let then_expr = self.expr()?;
        self.expect(TokenKind::Colon, "':'")?;
        let else_expr = self.conditional()?;

        let tk = self.sess.types.kind(then_expr.ty);
        let ek = self.sess.types.kind(else_expr.ty);
        if tk == TypeKind::Void || ek == TypeKind::Void {
            let ty = TypeTable::VOID;
            return Ok(Expr {
                kind: ExprKind::Cond {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                },
                ty,
                loc,
            });
        }
        if self.sess.types.get(then_expr.ty).is_aggregate() {
            if !self.sess.types.is_compatible(then_expr.ty, else_expr.ty) {
                return Err(self.type_err(loc, "incompatible operand types in ?:".to_string()));
            }
            let ty = then_expr.ty;
            return Ok(Expr {
                kind: ExprKind::Cond {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                },
                ty,
                loc,
            });
        }
        let (then_expr, else_expr, ty) = self.usual_arith_conv(then_expr, else_expr);
        Ok(Expr {
            kind: ExprKind::Cond {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
            ty,
            loc,
        })
    }

    fn logor(&mut self) -> Result<Expr> {
        let mut lhs = self.logand()?;
        while self.is(TokenKind::OrOr) {
            let loc = self.loc();
            self.advance();
            let rhs = self.logand()?;
            lhs = Expr {
                kind: ExprKind::LogOr {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                ty: TypeTable::INT,
                loc,
            };
        }
        Ok(lhs)
    }

    fn logand(&mut self) -> Result<Expr> {
        let mut lhs = self.bitor()?;
        while self.is(TokenKind::AndAnd) {
            let loc = self.loc();
            self.advance();
            let rhs = self.bitor()?;
            lhs = Expr {
                kind: ExprKind::LogAnd {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                ty: TypeTable::INT,
                loc,
            };
        }
        Ok(lhs)
    }

    fn bitor(&mut self) -> Result<Expr> {
        let mut lhs = self.bitxor()?;
        while self.is(TokenKind::Pipe) {
            let loc = self.loc();
            self.advance();
            let rhs = self.bitxor()?;
            lhs = self.new_arith(BinaryOp::BitOr, lhs, rhs, loc)?;
        }
        Ok(lhs)
    }

    fn bitxor(&mut self) -> Result<Expr> {
        let mut lhs = self.bitand()?;
        while self.is(TokenKind::Caret) {
            let loc = self.loc();
            self.advance();
            let rhs = self.bitand()?;
            lhs = self.new_arith(BinaryOp::BitXor, lhs, rhs, loc)?;
        }
        Ok(lhs)
    }

    fn bitand(&mut self) -> Result<Expr> {
        let mut lhs = self.equality()?;
        while self.is(TokenKind::Amp) {
            let loc = self.loc();
            self.advance();
            let rhs = self.equality()?;
            lhs = self.new_arith(BinaryOp::BitAnd, lhs, rhs, loc)?;
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.kind() {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::Ne,
                _ => return Ok(lhs),
            };
            let loc = self.loc();
            self.advance();
            let rhs = self.relational()?;
            lhs = self.new_comparison(op, lhs, rhs, loc)?;
        }
    }

    fn relational(&mut self) -> Result<Expr> {
        let mut lhs = self.shift()?;
        loop {
            let (op, swap) = match self.kind() {
                TokenKind::Less => (BinaryOp::Lt, false),
                TokenKind::LessEq => (BinaryOp::Le, false),
                TokenKind::Greater => (BinaryOp::Lt, true),
                TokenKind::GreaterEq => (BinaryOp::Le, true),
                _ => return Ok(lhs),
            };
            let loc = self.loc();
            self.advance();
            let rhs = self.shift()?;
            lhs = if swap {
                self.new_comparison(op, rhs, lhs, loc)?
            } else {
                self.new_comparison(op, lhs, rhs, loc)?
            };
        }
    }

    fn new_comparison(&mut self, op: BinaryOp, lhs: Expr, rhs: Expr, loc: SourceLoc) -> Result<Expr> {
        let lhs_ptr = self.sess.types.get(lhs.ty).has_base();
        let rhs_ptr = self.sess.types.get(rhs.ty).has_base();
        let (lhs, rhs) = if lhs_ptr || rhs_ptr {
            // Pointer comparisons (including against integer 0) are done on
            // the raw 64-bit address.
            (
                self.new_cast(lhs, TypeTable::ULONG),
                self.new_cast(rhs, TypeTable::ULONG),
            )
        } else if !self.sess.types.get(lhs.ty).is_numeric()
            || !self.sess.types.get(rhs.ty).is_numeric()
        {
            return Err(self.type_err(loc, "invalid operands to comparison".to_string()));
        } else {
            let (l, r, _) = self.usual_arith_conv(lhs, rhs);
            (l, r)
        };
        Ok(Expr {
            kind: ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty: TypeTable::INT,
            loc,
        })
    }

    fn shift(&mut self) -> Result<Expr> {
        let mut lhs = self.add_expr()?;
        loop {
            let op = match self.kind() {
                TokenKind::Shl => BinaryOp::Shl,
                TokenKind::Shr => BinaryOp::Shr,
                _ => return Ok(lhs),
            };
            let loc = self.loc();
            self.advance();
            let rhs = self.add_expr()?;
            if !self.sess.types.get(lhs.ty).is_integer()
                || !self.sess.types.get(rhs.ty).is_integer()
            {
                return Err(self.type_err(loc, "invalid operands to shift".to_string()));
            }
            let ty = self.sess.types.promote(lhs.ty);
            let lhs2 = self.cast_if_needed(lhs, ty);
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs2),
                    rhs: Box::new(rhs),
                },
                ty,
                loc,
            };
        }
    }

    fn add_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.mul_expr()?;
        loop {
            let loc = self.loc();
            if self.eat(TokenKind::Plus) {
                let rhs = self.mul_expr()?;
                lhs = self.new_add(lhs, rhs, loc)?;
            } else if self.eat(TokenKind::Minus) {
                let rhs = self.mul_expr()?;
                lhs = self.new_sub(lhs, rhs, loc)?;
            } else {
                return Ok(lhs);
            }
        }
    }

    /// `+` with C pointer-arithmetic rules.
    pub(crate) fn new_add(&mut self, lhs: Expr, rhs: Expr, loc: SourceLoc) -> Result<Expr> {
        let lhs_ptr = self.sess.types.get(lhs.ty).has_base();
        let rhs_ptr = self.sess.types.get(rhs.ty).has_base();
        match (lhs_ptr, rhs_ptr) {
            (false, false) => self.new_arith(BinaryOp::Add, lhs, rhs, loc),
            (true, false) => self.new_gep(lhs, rhs, loc),
            (false, true) => self.new_gep(rhs, lhs, loc),
            (true, true) => Err(self.type_err(loc, "invalid operands to +".to_string())),
        }
    }

    /// `-` with pointer difference support.
    pub(crate) fn new_sub(&mut self, lhs: Expr, rhs: Expr, loc: SourceLoc) -> Result<Expr> {
        let lhs_ptr = self.sess.types.get(lhs.ty).has_base();
        let rhs_ptr = self.sess.types.get(rhs.ty).has_base();
        match (lhs_ptr, rhs_ptr) {
            (false, false) => self.new_arith(BinaryOp::Sub, lhs, rhs, loc),
            (true, false) => {
                if !self.sess.types.get(rhs.ty).is_integer() {
                    return Err(self.type_err(loc, "invalid operands to -".to_string()));
                }
                let idx_ty = self.sess.types.promote(rhs.ty);
                let rhs = self.cast_if_needed(rhs, idx_ty);
                let neg = Expr {
                    kind: ExprKind::Neg(Box::new(rhs)),
                    ty: idx_ty,
                    loc,
                };
                self.new_gep(lhs, neg, loc)
            }
            (true, true) => {
                // ptr - ptr: element distance, in ptrdiff units.
                let base = self.sess.types.get(lhs.ty).base.expect("pointer base");
                if !self.sess.types.is_compatible(lhs.ty, rhs.ty) {
                    return Err(self.type_err(
                        loc,
                        "subtraction of incompatible pointers".to_string(),
                    ));
                }
                let size = self.sess.types.size_of(base);
                if size <= 0 {
                    return Err(self.type_err(loc, "pointer to incomplete type".to_string()));
                }
                let lhs = self.new_cast(lhs, TypeTable::LONG);
                let rhs = self.new_cast(rhs, TypeTable::LONG);
                let diff = Expr {
                    kind: ExprKind::Binary {
                        op: BinaryOp::Sub,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    ty: TypeTable::LONG,
                    loc,
                };
                let size = self.new_typed_num(i64::from(size), TypeTable::LONG, loc);
                Ok(Expr {
                    kind: ExprKind::Binary {
                        op: BinaryOp::Div,
                        lhs: Box::new(diff),
                        rhs: Box::new(size),
                    },
                    ty: TypeTable::LONG,
                    loc,
                })
            }
            (false, true) => Err(self.type_err(loc, "invalid operands to -".to_string())),
        }
    }

    fn new_gep(&mut self, ptr: Expr, index: Expr, loc: SourceLoc) -> Result<Expr> {
        if !self.sess.types.get(index.ty).is_integer() {
            return Err(self.type_err(loc, "pointer offset is not an integer".to_string()));
        }
        let base = self.sess.types.get(ptr.ty).base.expect("pointer base");
        if self.sess.types.size_of(base) < 0 {
            return Err(self.type_err(loc, "pointer to incomplete type".to_string()));
        }
        let ty = self.sess.types.pointer_to(base);
        Ok(Expr {
            kind: ExprKind::Gep {
                ptr: Box::new(ptr),
                index: Box::new(index),
            },
            ty,
            loc,
        })
    }

    fn new_arith(&mut self, op: BinaryOp, lhs: Expr, rhs: Expr, loc: SourceLoc) -> Result<Expr> {
        let ok = |t: &crate::ctype::Type| match op {
            BinaryOp::Mod | BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => t.is_integer(),
            _ => t.is_numeric(),
        };
        if !ok(self.sess.types.get(lhs.ty)) || !ok(self.sess.types.get(rhs.ty)) {
            return Err(self.type_err(loc, "invalid operands to arithmetic".to_string()));
        }
        let (lhs, rhs, ty) = self.usual_arith_conv(lhs, rhs);
        Ok(Expr {
            kind: ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            loc,
        })
    }

    fn mul_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.cast_expr()?;
        loop {
            let op = match self.kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            let loc = self.loc();
            self.advance();
            let rhs = self.cast_expr()?;
            lhs = self.new_arith(op, lhs, rhs, loc)?;
        }
    }

    /// cast = "(" typename ")" cast | unary
    pub(crate) fn cast_expr(&mut self) -> Result<Expr> {
        if self.is(TokenKind::LParen) {
            let next_is_type = {
                let cp = self.checkpoint();
                self.advance();
                let yes = self.is_typename();
                self.rewind(cp);
                yes
            };
            if next_is_type {
                let loc = self.loc();
                self.advance();
                let ty = self.typename()?;
                self.expect(TokenKind::RParen, "')'")?;
                let operand = self.cast_expr()?;
                return self.make_cast(operand, ty, loc);
            }
        }
        self.unary()
    }

    fn make_cast(&mut self, operand: Expr, ty: TypeId, loc: SourceLoc) -> Result<Expr> {
        if self.sess.types.kind(ty) == TypeKind::Void {
            return Ok(self.new_cast(operand, ty));
        }
        let target = self.sess.types.get(ty);
        if target.is_aggregate() || target.kind == TypeKind::Array || target.kind == TypeKind::Func
        {
            return Err(self.type_err(loc, "cast to non-scalar type".to_string()));
        }
        let src = self.sess.types.get(operand.ty);
        if src.is_aggregate() {
            return Err(self.type_err(loc, "cast of non-scalar operand".to_string()));
        }
        Ok(self.new_cast(operand, ty))
    }

    /// unary = ("+" | "-" | "&" | "*" | "!" | "~" | "++" | "--") unary
    ///       | "sizeof"/"_Alignof" (unary | "(" typename ")")
    ///       | postfix
    fn unary(&mut self) -> Result<Expr> {
        let loc = self.loc();
        match self.kind() {
            TokenKind::Plus => {
                self.advance();
                let e = self.cast_expr()?;
                if !self.sess.types.get(e.ty).is_numeric() {
                    return Err(self.type_err(loc, "invalid operand to unary +".to_string()));
                }
                let ty = self.sess.types.promote(e.ty);
                Ok(self.cast_if_needed(e, ty))
            }
            TokenKind::Minus => {
                self.advance();
                let e = self.cast_expr()?;
                if !self.sess.types.get(e.ty).is_numeric() {
                    return Err(self.type_err(loc, "invalid operand to unary -".to_string()));
                }
                let ty = self.sess.types.promote(e.ty);
                let e = self.cast_if_needed(e, ty);
                Ok(Expr {
                    kind: ExprKind::Neg(Box::new(e)),
                    ty,
                    loc,
                })
            }
            TokenKind::Amp => {
                self.advance();
                let e = self.cast_expr()?;
                if let ExprKind::Member { member, .. } = &e.kind {
                    if member.is_bitfield {
                        return Err(self.type_err(loc, "cannot take address of bitfield".to_string()));
                    }
                }
                if !self.is_lvalue(&e) && self.sess.types.kind(e.ty) != TypeKind::Func {
                    return Err(self.type_err(loc, "not an lvalue".to_string()));
                }
                let ty = self.sess.types.pointer_to(e.ty);
                Ok(Expr {
                    kind: ExprKind::Addr(Box::new(e)),
                    ty,
                    loc,
                })
            }
            TokenKind::Star => {
                self.advance();
                let e = self.cast_expr()?;
                self.new_deref(e, loc)
            }
            TokenKind::Bang => {
                self.advance();
                let e = self.cast_expr()?;
                Ok(Expr {
                    kind: ExprKind::Not(Box::new(e)),
                    ty: TypeTable::INT,
                    loc,
                })
            }
            TokenKind::Tilde => {
                self.advance();
                let e = self.cast_expr()?;
                if !self.sess.types.get(e.ty).is_integer() {
                    return Err(self.type_err(loc, "invalid operand to ~".to_string()));
                }
                let ty = self.sess.types.promote(e.ty);
                let e = self.cast_if_needed(e, ty);
                Ok(Expr {
                    kind: ExprKind::BitNot(Box::new(e)),
                    ty,
                    loc,
                })
            }
            TokenKind::Inc => {
                // ++i is i += 1.
                self.advance();
                let e = self.unary()?;
                let one = self.new_num(1, loc);
                self.new_compound(BinaryOp::Add, e, one, loc)
            }
            TokenKind::Dec => {
                self.advance();
                let e = self.unary()?;
                let one = self.new_num(1, loc);
                self.new_compound(BinaryOp::Sub, e, one, loc)
            }
            TokenKind::Sizeof => {
                self.advance();
                let ty = self.sizeof_operand()?;
                let size = self.sess.types.size_of(ty);
                if size < 0 {
                    return Err(self.type_err(loc, "sizeof of incomplete type".to_string()));
                }
                Ok(self.new_typed_num(i64::from(size), TypeTable::ULONG, loc))
            }
            TokenKind::Alignof => {
                self.advance();
                let ty = self.sizeof_operand()?;
                let align = self.sess.types.align_of(ty);
                Ok(self.new_typed_num(i64::from(align), TypeTable::ULONG, loc))
            }
            _ => self.postfix(),
        }
    }

    /// Build `lhs op= rhs`. The right operand is converted up front (to the
    /// common arithmetic type, or to the promoted left type for shifts) so
    /// the IR builder only has to convert the re-read left value.
    fn new_compound(
        &mut self,
        op: BinaryOp,
        lhs: Expr,
        rhs: Expr,
        loc: SourceLoc,
    ) -> Result<Expr> {
        if !self.is_lvalue(&lhs) {
            return Err(self.type_err(loc, "not an lvalue".to_string()));
        }
        let lt = self.sess.types.get(lhs.ty).clone();
        let rhs = if lt.has_base() {
            if !matches!(op, BinaryOp::Add | BinaryOp::Sub)
                || !self.sess.types.get(rhs.ty).is_integer()
            {
                return Err(self.type_err(loc, "invalid operands".to_string()));
            }
            rhs
        } else if matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
            if !lt.is_integer() || !self.sess.types.get(rhs.ty).is_integer() {
                return Err(self.type_err(loc, "invalid operands to shift".to_string()));
            }
            let common = self.sess.types.promote(lhs.ty);
            self.cast_if_needed(rhs, common)
        } else {
            let int_only = matches!(
                op,
                BinaryOp::Mod | BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor
            );
            let ok = |t: &crate::ctype::Type| {
                if int_only {
                    t.is_integer()
                } else {
                    t.is_numeric()
                }
            };
            if !ok(&lt) || !ok(self.sess.types.get(rhs.ty)) {
                return Err(self.type_err(loc, "invalid operands".to_string()));
            }
            let common = self.sess.types.common_type(lhs.ty, rhs.ty);
            self.cast_if_needed(rhs, common)
        };
        let ty = lhs.ty;
        Ok(Expr {
            kind: ExprKind::CompoundAssign {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            loc,
        })
    }

    fn sizeof_operand(&mut self) -> Result<TypeId> {
        if self.is(TokenKind::LParen) {
            let cp = self.checkpoint();
            self.advance();
            if self.is_typename() {
                let ty = self.typename()?;
                self.expect(TokenKind::RParen, "')'")?;
                return Ok(ty);
            }
            self.rewind(cp);
        }
        let e = self.unary()?;
        Ok(e.ty)
    }

    fn new_deref(&mut self, e: Expr, loc: SourceLoc) -> Result<Expr> {
        let t = self.sess.types.get(e.ty);
        if !t.has_base() {
            return Err(self.type_err(loc, "invalid pointer dereference".to_string()));
        }
        let base = t.base.expect("pointer base");
        if self.sess.types.kind(base) == TypeKind::Void {
            return Err(self.type_err(loc, "dereferencing a void pointer".to_string()));
        }
        Ok(Expr {
            kind: ExprKind::Deref(Box::new(e)),
            ty: base,
            loc,
        })
    }

    /// postfix = primary ("[" expr "]" | "." ident | "->" ident | "++" | "--"
    ///           | "(" args ")")*
    fn postfix(&mut self) -> Result<Expr> {
        let mut e = self.primary()?;
        loop {
            let loc = self.loc();
            match self.kind() {
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.expr()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    let sum = self.new_add(e, index, loc)?;
                    e = self.new_deref(sum, loc)?;
                }
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect(TokenKind::Ident, "member name")?.text;
                    e = self.struct_ref(e, name, loc)?;
                }
                TokenKind::Arrow => {
                    self.advance();
                    let name = self.expect(TokenKind::Ident, "member name")?.text;
                    let base = self.new_deref(e, loc)?;
                    e = self.struct_ref(base, name, loc)?;
                }
                TokenKind::Inc => {
                    self.advance();
                    e = self.new_inc_dec(e, 1, loc)?;
                }
                TokenKind::Dec => {
                    self.advance();
                    e = self.new_inc_dec(e, -1, loc)?;
                }
                TokenKind::LParen => {
                    self.advance();
                    e = self.funcall(e, loc)?;
                }
                _ => return Ok(e),
            }
        }
    }

    /// `i++` is `(typeof i)((i += 1) - 1)`.
    fn new_inc_dec(&mut self, e: Expr, delta: i64, loc: SourceLoc) -> Result<Expr> {
        let ty = e.ty;
        let one = self.new_num(delta, loc);
        let add = self.new_compound(BinaryOp::Add, e, one, loc)?;
        let neg = self.new_num(delta, loc);
        let back = self.new_sub(add, neg, loc)?;
        Ok(self.cast_if_needed(back, ty))
    }

    fn struct_ref(&mut self, base: Expr, name: crate::intern::Sym, loc: SourceLoc) -> Result<Expr> {
        if !self.sess.types.get(base.ty).is_aggregate() {
            return Err(self.type_err(loc, "member access on non-aggregate".to_string()));
        }
        let path = self.find_member_path(base.ty, name).ok_or_else(|| {
            self.type_err(
                loc,
                format!("no such member: '{}'", self.sess.interner.resolve(name)),
            )
        })?;
        let mut e = base;
        for member in path {
            let ty = member.ty;
            e = Expr {
                kind: ExprKind::Member {
                    base: Box::new(e),
                    member,
                },
                ty,
                loc,
            };
        }
        Ok(e)
    }

    /// Resolve `name` in `ty`, descending through anonymous members.
    fn find_member_path(&self, ty: TypeId, name: crate::intern::Sym) -> Option<Vec<Member>> {
        let t = self.sess.types.get(ty);
        for m in &t.members {
            if m.name == Some(name) {
                return Some(vec![m.clone()]);
            }
            if m.name.is_none() && self.sess.types.get(m.ty).is_aggregate() {
                if let Some(mut rest) = self.find_member_path(m.ty, name) {
                    let mut path = vec![m.clone()];
                    path.append(&mut rest);
                    return Some(path);
                }
            }
        }
        None
    }

    fn funcall(&mut self, callee: Expr, loc: SourceLoc) -> Result<Expr> {
        let func_ty = {
            let t = self.sess.types.get(callee.ty);
            match t.kind {
                TypeKind::Func => callee.ty,
                TypeKind::Ptr => {
                    let base = t.base.expect("pointer base");
                    if self.sess.types.kind(base) != TypeKind::Func {
                        return Err(self.type_err(loc, "called object is not a function".to_string()));
                    }
                    base
                }
                _ => {
                    return Err(self.type_err(loc, "called object is not a function".to_string()))
                }
            }
        };

        let params = self.sess.types.get(func_ty).params.clone();
        let variadic = self
            .sess
            .types
            .get(func_ty)
            .flags
            .contains(crate::ctype::TypeFlags::VARIADIC);
        let ret = self.sess.types.get(func_ty).ret.expect("function return");

        let mut args = Vec::new();
        let mut first = true;
        while !self.eat(TokenKind::RParen) {
            if !first {
                self.expect(TokenKind::Comma, "','")?;
            }
            first = false;
            let arg_loc = self.loc();
            let arg = self.assign()?;

            let arg = if let Some(&pty) = params.get(args.len()) {
                let pt = self.sess.types.get(pty);
                if pt.is_aggregate() {
                    if !self.sess.types.is_compatible(pty, arg.ty) {
                        return Err(
                            self.type_err(arg_loc, "incompatible argument type".to_string())
                        );
                    }
                    arg
                } else {
                    self.cast_if_needed(arg, pty)
                }
            } else if !variadic {
                return Err(self.type_err(arg_loc, "too many arguments".to_string()));
            } else {
                // Variadic tail: float promotes to double, small ints to int.
                let t = self.sess.types.get(arg.ty);
                if t.kind == TypeKind::Float {
                    self.new_cast(arg, TypeTable::DOUBLE)
                } else if t.is_integer() && self.sess.types.size_of(arg.ty) < 4 {
                    self.new_cast(arg, TypeTable::INT)
                } else if t.has_base() {
                    let base = t.base.expect("pointer base");
                    let pty = self.sess.types.pointer_to(base);
                    self.cast_if_needed(arg, pty)
                } else {
                    arg
                }
            };
            args.push(arg);
        }

        if args.len() < params.len() {
            return Err(self.type_err(loc, "too few arguments".to_string()));
        }

        Ok(Expr {
            kind: ExprKind::FuncCall {
                callee: Box::new(callee),
                func_ty,
                args,
            },
            ty: ret,
            loc,
        })
    }

    fn primary(&mut self) -> Result<Expr> {
        let loc = self.loc();
        match self.kind() {
            TokenKind::LParen => {
                self.advance();
                let e = self.expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(e)
            }
            TokenKind::Generic => self.generic_selection(),
            TokenKind::Num => {
                let tok = self.advance();
                match tok.value {
                    TokenValue::Int { value, ty } => Ok(self.new_typed_num(value, ty, loc)),
                    TokenValue::Float { value, ty } => Ok(Expr {
                        kind: ExprKind::Fnum(value),
                        ty,
                        loc,
                    }),
                    _ => Err(self.parse_err("malformed numeric literal")),
                }
            }
            TokenKind::Str => {
                let tok = self.advance();
                let TokenValue::Str { bytes, ty } = tok.value else {
                    return Err(self.parse_err("malformed string literal"));
                };
                let gvar = self.new_anon_gvar(ty, bytes);
                Ok(Expr {
                    kind: ExprKind::Var(gvar),
                    ty,
                    loc,
                })
            }
            TokenKind::Ident => {
                let name = self.tok().text;
                match self.find_var(name) {
                    Some(VarScopeEntry::Var(id)) => {
                        self.advance();
                        let (ty, is_module_level) = {
                            let obj = self.unit.get(id);
                            (
                                obj.ty,
                                obj.is_function() || !obj.flags.contains(ObjFlags::LOCAL),
                            )
                        };
                        if is_module_level {
                            self.record_fn_ref(name);
                        }
                        Ok(Expr {
                            kind: ExprKind::Var(id),
                            ty,
                            loc,
                        })
                    }
                    Some(VarScopeEntry::EnumConst { value, .. }) => {
                        self.advance();
                        Ok(self.new_num(value, loc))
                    }
                    Some(VarScopeEntry::Typedef(_)) | None => {
                        let text = self.sess.interner.resolve(name).to_owned();
                        if self.peek_kind(1) == TokenKind::LParen {
                            Err(self.type_err(
                                loc,
                                format!("implicit declaration of function '{text}'"),
                            ))
                        } else {
                            Err(self.type_err(loc, format!("undefined variable '{text}'")))
                        }
                    }
                }
            }
            _ => {
                let text = self.sess.interner.resolve(self.tok().text).to_owned();
                Err(self.parse_err(format!("expected an expression, found '{text}'")))
            }
        }
    }

    /// `_Generic(expr, type: expr, ..., default: expr)`. The first matching
    /// association wins, else the default association.
    fn generic_selection(&mut self) -> Result<Expr> {
        let loc = self.loc();
        self.advance();
        self.expect(TokenKind::LParen, "'('")?;
        let ctrl = self.assign()?;
        // Lvalue conversion of the controlling type.
        let mut ctrl_ty = ctrl.ty;
        {
            let t = self.sess.types.get(ctrl_ty);
            match t.kind {
                TypeKind::Array => {
                    let base = t.base.expect("array base");
                    ctrl_ty = self.sess.types.pointer_to(base);
                }
                TypeKind::Func => ctrl_ty = self.sess.types.pointer_to(ctrl_ty),
                _ => {}
            }
        }

        let mut chosen: Option<Expr> = None;
        let mut default: Option<Expr> = None;
        while !self.eat(TokenKind::RParen) {
            self.expect(TokenKind::Comma, "','")?;
            if self.eat(TokenKind::Default) {
                self.expect(TokenKind::Colon, "':'")?;
                let e = self.assign()?;
                default = Some(e);
                continue;
            }
            let ty = self.typename()?;
            self.expect(TokenKind::Colon, "':'")?;
            let e = self.assign()?;
            if chosen.is_none() && self.sess.types.is_compatible(ty, ctrl_ty) {
                chosen = Some(e);
            }
        }

        chosen
            .or(default)
            .ok_or_else(|| self.type_err(loc, "no matching generic association".to_string()))
    }
}
