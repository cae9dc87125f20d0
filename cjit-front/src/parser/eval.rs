//! Compile-time constant evaluation.
//!
//! Evaluates integer constant expressions to `i64` (and floating constants
//! to `f64`). In a global-initializer context an address-of expression
//! yields a `(symbol, addend)` pair instead of a value. Division or modulo
//! by zero in a constant context is an error; shift counts are masked to
//! the operand width so the result never depends on the host.

use crate::ast::{BinaryOp, Expr, ExprKind};
use crate::ctype::{TypeId, TypeKind};
use crate::intern::Sym;
use crate::obj::ObjFlags;
use crate::{Result, SourceLoc};

use super::Parser;

/// An address-valued constant: the named global plus a byte addend.
#[derive(Debug, Clone)]
pub(crate) struct RelocTarget {
    pub name: Sym,
    pub addend: i64,
}

impl<'s> Parser<'s> {
    /// Parse a conditional expression and fold it to an integer constant.
    pub(crate) fn const_expr(&mut self) -> Result<i64> {
        let e = self.conditional()?;
        self.eval_const(&e)
    }

    /// Fold to an integer; address-of is not allowed in this context.
    pub(crate) fn eval_const(&self, e: &Expr) -> Result<i64> {
        let mut none = None;
        let v = self.eval2(e, &mut none)?;
        if none.is_some() {
            return Err(self.const_err(e.loc, "not a compile-time constant".to_string()));
        }
        Ok(v)
    }

    /// Fold to an integer, permitting one address-valued term.
    pub(crate) fn eval_const_reloc(
        &self,
        e: &Expr,
        target: &mut Option<RelocTarget>,
    ) -> Result<i64> {
        self.eval2(e, target)
    }

    fn not_const(&self, loc: SourceLoc) -> crate::FrontError {
        self.const_err(loc, "not a compile-time constant".to_string())
    }

    fn is_unsigned(&self, ty: TypeId) -> bool {
        self.sess.types.get(ty).is_unsigned() || self.sess.types.kind(ty) == TypeKind::Ptr
    }

    fn eval2(&self, e: &Expr, reloc: &mut Option<RelocTarget>) -> Result<i64> {
        let loc = e.loc;
        match &e.kind {
            ExprKind::Num(v) => Ok(*v),
            ExprKind::Fnum(_) => Err(self.not_const(loc)),
            ExprKind::Binary { op, lhs, rhs } => {
                let unsigned = self.is_unsigned(lhs.ty);
                let l = self.eval2(lhs, reloc)?;
                let r = self.eval_const(rhs)?;
                let width = self.sess.types.size_of(lhs.ty);
                let shift_mask = if width == 8 { 63 } else { 31 };
                let v = match op {
                    BinaryOp::Add => l.wrapping_add(r),
                    BinaryOp::Sub => l.wrapping_sub(r),
                    BinaryOp::Mul => l.wrapping_mul(r),
                    BinaryOp::Div => {
                        if r == 0 {
                            return Err(
                                self.const_err(loc, "division by zero in constant".to_string())
                            );
                        }
                        if unsigned {
                            ((l as u64) / (r as u64)) as i64
                        } else {
                            l.wrapping_div(r)
                        }
                    }
                    BinaryOp::Mod => {
                        if r == 0 {
                            return Err(
                                self.const_err(loc, "division by zero in constant".to_string())
                            );
                        }
                        if unsigned {
                            ((l as u64) % (r as u64)) as i64
                        } else {
                            l.wrapping_rem(r)
                        }
                    }
                    BinaryOp::BitAnd => l & r,
                    BinaryOp::BitOr => l | r,
                    BinaryOp::BitXor => l ^ r,
                    BinaryOp::Shl => l.wrapping_shl((r & shift_mask) as u32),
                    BinaryOp::Shr => {
                        if unsigned {
                            (((l as u64) >> (r & shift_mask)) as i64)
                        } else {
                            l.wrapping_shr((r & shift_mask) as u32)
                        }
                    }
                    BinaryOp::Eq => i64::from(l == r),
                    BinaryOp::Ne => i64::from(l != r),
                    BinaryOp::Lt => {
                        if unsigned {
                            i64::from((l as u64) < (r as u64))
                        } else {
                            i64::from(l < r)
                        }
                    }
                    BinaryOp::Le => {
                        if unsigned {
                            i64::from((l as u64) <= (r as u64))
                        } else {
                            i64::from(l <= r)
                        }
                    }
                };
                Ok(v)
            }
            ExprKind::Neg(x) => Ok(self.eval2(x, reloc)?.wrapping_neg()),
            ExprKind::Not(x) => Ok(i64::from(self.eval_const(x)? == 0)),
            ExprKind::BitNot(x) => Ok(!self.eval_const(x)?),
            ExprKind::LogAnd { lhs, rhs } => {
                Ok(i64::from(self.eval_const(lhs)? != 0 && self.eval_const(rhs)? != 0))
            }
            ExprKind::LogOr { lhs, rhs } => {
                Ok(i64::from(self.eval_const(lhs)? != 0 || self.eval_const(rhs)? != 0))
            }
            ExprKind::Cond {
                cond,
                then_expr,
                else_expr,
            } => {
                if self.eval_const(cond)? != 0 {
                    self.eval2(then_expr, reloc)
                } else {
                    self.eval2(else_expr, reloc)
                }
            }
            ExprKind::Comma { rhs, .. } => self.eval2(rhs, reloc),
            ExprKind::Cast(inner) => {
                let it = self.sess.types.get(inner.ty);
                let v = if it.is_float() {
                    self.eval_const_double(inner)? as i64
                } else {
                    self.eval2(inner, reloc)?
                };
                // Truncate / extend per the destination type.
                let t = self.sess.types.get(e.ty);
                if !t.is_integer() && t.kind != TypeKind::Ptr {
                    return Ok(v);
                }
                if t.kind == TypeKind::Bool {
                    return Ok(i64::from(v != 0));
                }
                let v = match (self.sess.types.size_of(e.ty), t.is_unsigned()) {
                    (1, false) => i64::from(v as i8),
                    (1, true) => i64::from(v as u8),
                    (2, false) => i64::from(v as i16),
                    (2, true) => i64::from(v as u16),
                    (4, false) => i64::from(v as i32),
                    (4, true) => i64::from(v as u32),
                    _ => v,
                };
                Ok(v)
            }
            ExprKind::Addr(x) => self.eval_rval(x, reloc),
            ExprKind::Deref(x) => {
                // Only meaningful when re-taking the address of an element.
                self.eval2(x, reloc)
            }
            ExprKind::Gep { ptr, index } => {
                let base = self
                    .sess
                    .types
                    .get(ptr.ty)
                    .base
                    .expect("pointer-like type has a base");
                let size = i64::from(self.sess.types.size_of(base));
                let p = self.eval2(ptr, reloc)?;
                let i = self.eval_const(index)?;
                Ok(p.wrapping_add(i.wrapping_mul(size)))
            }
            ExprKind::Member { base, member } => {
                // Array members decay to their address.
                if self.sess.types.kind(e.ty) == TypeKind::Array {
                    let b = self.eval_rval(base, reloc)?;
                    return Ok(b.wrapping_add(i64::from(member.offset)));
                }
                Err(self.not_const(loc))
            }
            ExprKind::Var(id) => {
                let obj = self.unit.get(*id);
                // An array- or function-typed global decays to its address.
                let k = self.sess.types.kind(obj.ty);
                if (k == TypeKind::Array || k == TypeKind::Func)
                    && !obj.flags.contains(ObjFlags::LOCAL)
                {
                    if reloc.is_some() {
                        return Err(self.not_const(loc));
                    }
                    *reloc = Some(RelocTarget {
                        name: obj.name,
                        addend: 0,
                    });
                    return Ok(0);
                }
                Err(self.not_const(loc))
            }
            _ => Err(self.not_const(loc)),
        }
    }

    /// Address of an lvalue in a constant context.
    fn eval_rval(&self, e: &Expr, reloc: &mut Option<RelocTarget>) -> Result<i64> {
        match &e.kind {
            ExprKind::Var(id) => {
                let obj = self.unit.get(*id);
                if obj.flags.contains(ObjFlags::LOCAL) {
                    return Err(self.not_const(e.loc));
                }
                if reloc.is_some() {
                    return Err(self.not_const(e.loc));
                }
                *reloc = Some(RelocTarget {
                    name: obj.name,
                    addend: 0,
                });
                Ok(0)
            }
            ExprKind::Deref(x) => self.eval2(x, reloc),
            ExprKind::Member { base, member } => {
                let b = self.eval_rval(base, reloc)?;
                Ok(b.wrapping_add(i64::from(member.offset)))
            }
            _ => Err(self.not_const(e.loc)),
        }
    }

    /// Fold a floating constant expression.
    pub(crate) fn eval_const_double(&self, e: &Expr) -> Result<f64> {
        let t = self.sess.types.get(e.ty);
        if t.is_integer() {
            return Ok(self.eval_const(e)? as f64);
        }
        match &e.kind {
            ExprKind::Fnum(v) => Ok(*v),
            ExprKind::Num(v) => Ok(*v as f64),
            ExprKind::Binary { op, lhs, rhs } => {
                let l = self.eval_const_double(lhs)?;
                let r = self.eval_const_double(rhs)?;
                match op {
                    BinaryOp::Add => Ok(l + r),
                    BinaryOp::Sub => Ok(l - r),
                    BinaryOp::Mul => Ok(l * r),
                    BinaryOp::Div => Ok(l / r),
                    _ => Err(self.not_const(e.loc)),
                }
            }
            ExprKind::Neg(x) => Ok(-self.eval_const_double(x)?),
            ExprKind::Cond {
                cond,
                then_expr,
                else_expr,
            } => {
                if self.eval_const(cond)? != 0 {
                    self.eval_const_double(then_expr)
                } else {
                    self.eval_const_double(else_expr)
                }
            }
            ExprKind::Comma { rhs, .. } => self.eval_const_double(rhs),
            ExprKind::Cast(inner) => {
                if self.sess.types.get(inner.ty).is_float() {
                    self.eval_const_double(inner)
                } else {
                    Ok(self.eval_const(inner)? as f64)
                }
            }
            _ => Err(self.not_const(e.loc)),
        }
    }
}
