//! Statement parsing.

use crate::ast::{CaseArm, Expr, Stmt, StmtKind};
use crate::ctype::TypeKind;
use crate::obj::ObjFlags;
use crate::token::{TokenKind, TokenValue};
use crate::{Result, SourceLoc};

use super::{Parser, SwitchFrame, VarAttr, VarScopeEntry};

impl<'s> Parser<'s> {
    fn empty_stmt(&self, loc: SourceLoc) -> Stmt {
        Stmt {
            kind: StmtKind::Block(Vec::new()),
            loc,
        }
    }

    /// Body of a compound statement; the opening brace is already consumed.
    pub(crate) fn compound_stmt_tail(&mut self, loc: SourceLoc) -> Result<Stmt> {
        let mut stmts = Vec::new();
        while !self.eat(TokenKind::RBrace) {
            if self.tok().is_eof() {
                return Err(self.parse_err("unexpected end of file, expected '}'"));
            }
            let is_label = self.is(TokenKind::Ident) && self.peek_kind(1) == TokenKind::Colon;
            if self.is_typename() && !is_label {
                stmts.push(self.declaration()?);
            } else {
                stmts.push(self.stmt()?);
            }
        }
        Ok(Stmt {
            kind: StmtKind::Block(stmts),
            loc,
        })
    }

    /// Local declaration; returns a block of initializer statements.
    fn declaration(&mut self) -> Result<Stmt> {
        let loc = self.loc();
        let mut attr = VarAttr::default();
        let basety = self.declspec(Some(&mut attr))?;

        if attr.is_typedef {
            self.parse_typedef(basety)?;
            return Ok(self.empty_stmt(loc));
        }

        let mut stmts = Vec::new();
        let mut first = true;
        while !self.eat(TokenKind::Semicolon) {
            if !first {
                self.expect(TokenKind::Comma, "','")?;
            }
            first = false;

            let decl_loc = self.loc();
            let (ty, name) = self.declarator(basety)?;
            let name = name.ok_or_else(|| self.parse_err("variable name omitted"))?;

            if self.sess.types.kind(ty) == TypeKind::Void {
                return Err(self.type_err(decl_loc, "variable declared void".to_string()));
            }

            // Block-scope function declaration.
            if self.sess.types.kind(ty) == TypeKind::Func {
                self.new_gvar(name, ty, ObjFlags::FUNCTION);
                continue;
            }

            if attr.is_static {
                // Block-scope static: storage is a uniquely named global.
                let unique = self.sess.anon_name("static");
                let align = attr.align.unwrap_or_else(|| self.sess.types.align_of(ty));
                let mut obj = crate::obj::Obj::new(
                    unique,
                    ty,
                    align,
                    ObjFlags::STATIC | ObjFlags::DEFINITION,
                );
                obj.flags |= ObjFlags::TENTATIVE;
                let id = self.unit.alloc_global(obj);
                self.push_var_scope(name, VarScopeEntry::Var(id));
                if self.eat(TokenKind::Assign) {
                    self.gvar_initializer(id)?;
                    self.unit.get_mut(id).flags.remove(ObjFlags::TENTATIVE);
                }
                continue;
            }

            if attr.is_extern {
                let id = self.new_gvar(name, ty, ObjFlags::empty());
                self.push_var_scope(name, VarScopeEntry::Var(id));
                continue;
            }

            let var = self.new_lvar(name, ty);
            if let Some(align) = attr.align {
                self.unit.get_mut(var).align = align;
            }

            if self.eat(TokenKind::Assign) {
                let init_stmts = self.lvar_initializer(var, decl_loc)?;
                stmts.extend(init_stmts);
            }

            if self.sess.types.size_of(self.unit.get(var).ty) < 0 {
                return Err(self.type_err(decl_loc, "variable has incomplete type".to_string()));
            }
        }

        Ok(Stmt {
            kind: StmtKind::Block(stmts),
            loc,
        })
    }

    fn scalar_cond(&mut self, cond: Expr, loc: SourceLoc) -> Result<Expr> {
        let t = self.sess.types.get(cond.ty);
        if !t.is_numeric() && !t.has_base() {
            return Err(self.type_err(loc, "controlling expression is not scalar".to_string()));
        }
        Ok(cond)
    }

    fn stmt(&mut self) -> Result<Stmt> {
        let loc = self.loc();
        match self.kind() {
            TokenKind::Return => {
                self.advance();
                if self.eat(TokenKind::Semicolon) {
                    return Ok(Stmt {
                        kind: StmtKind::Return(None),
                        loc,
                    });
                }
                let e = self.expr()?;
                self.expect(TokenKind::Semicolon, "';'")?;
                let ret_ty = self.cur_fn_ret.expect("return outside a function");
                let e = if self.sess.types.kind(ret_ty) == TypeKind::Void {
                    e
                } else if self.sess.types.get(ret_ty).is_aggregate() {
                    if !self.sess.types.is_compatible(ret_ty, e.ty) {
                        return Err(
                            self.type_err(loc, "incompatible type in return".to_string())
                        );
                    }
                    e
                } else if e.ty == ret_ty {
                    e
                } else {
                    self.new_cast(e, ret_ty)
                };
                Ok(Stmt {
                    kind: StmtKind::Return(Some(e)),
                    loc,
                })
            }
            TokenKind::If => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                let cond = self.expr()?;
                let cond = self.scalar_cond(cond, loc)?;
                self.expect(TokenKind::RParen, "')'")?;
                let then_label = self.sess.new_label();
                let end_label = self.sess.new_label();
                let then_stmt = Box::new(self.stmt()?);
                let (else_stmt, else_label) = if self.eat(TokenKind::Else) {
                    let l = self.sess.new_label();
                    (Some(Box::new(self.stmt()?)), l)
                } else {
                    (None, end_label)
                };
                Ok(Stmt {
                    kind: StmtKind::If {
                        cond,
                        then_stmt,
                        else_stmt,
                        then_label,
                        else_label,
                        end_label,
                    },
                    loc,
                })
            }
            TokenKind::While => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                let cond = self.expr()?;
                let cond = self.scalar_cond(cond, loc)?;
                self.expect(TokenKind::RParen, "')'")?;

                let break_label = self.sess.new_label();
                let continue_label = self.sess.new_label();
                let body_label = self.sess.new_label();
                self.break_stack.push(break_label);
                self.continue_stack.push(continue_label);
                let body = Box::new(self.stmt()?);
                self.break_stack.pop();
                self.continue_stack.pop();

                Ok(Stmt {
                    kind: StmtKind::For {
                        init: None,
                        cond: Some(cond),
                        inc: None,
                        body,
                        break_label,
                        continue_label,
                        body_label,
                    },
                    loc,
                })
            }
            TokenKind::For => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                self.enter_scope();

                let init = if self.is_typename() {
                    Some(Box::new(self.declaration()?))
                } else if self.eat(TokenKind::Semicolon) {
                    None
                } else {
                    let e = self.expr()?;
                    self.expect(TokenKind::Semicolon, "';'")?;
                    Some(Box::new(Stmt {
                        kind: StmtKind::Expr(e),
                        loc,
                    }))
                };

                let cond = if self.is(TokenKind::Semicolon) {
                    None
                } else {
                    let c = self.expr()?;
                    Some(self.scalar_cond(c, loc)?)
                };
                self.expect(TokenKind::Semicolon, "';'")?;

                let inc = if self.is(TokenKind::RParen) {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.expect(TokenKind::RParen, "')'")?;

                let break_label = self.sess.new_label();
                let continue_label = self.sess.new_label();
                let body_label = self.sess.new_label();
                self.break_stack.push(break_label);
                self.continue_stack.push(continue_label);
                let body = Box::new(self.stmt()?);
                self.break_stack.pop();
                self.continue_stack.pop();
                self.leave_scope();

                Ok(Stmt {
                    kind: StmtKind::For {
                        init,
                        cond,
                        inc,
                        body,
                        break_label,
                        continue_label,
                        body_label,
                    },
                    loc,
                })
            }
            TokenKind::Do => {
                self.advance();
                let break_label = self.sess.new_label();
                let continue_label = self.sess.new_label();
                let body_label = self.sess.new_label();
                self.break_stack.push(break_label);
                self.continue_stack.push(continue_label);
                let body = Box::new(self.stmt()?);
                self.break_stack.pop();
                self.continue_stack.pop();

                self.expect(TokenKind::While, "'while'")?;
                self.expect(TokenKind::LParen, "'('")?;
                let cond = self.expr()?;
                let cond = self.scalar_cond(cond, loc)?;
                self.expect(TokenKind::RParen, "')'")?;
                self.expect(TokenKind::Semicolon, "';'")?;

                Ok(Stmt {
                    kind: StmtKind::DoWhile {
                        body,
                        cond,
                        break_label,
                        continue_label,
                        body_label,
                    },
                    loc,
                })
            }
            TokenKind::Switch => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                let cond = self.expr()?;
                if !self.sess.types.get(cond.ty).is_integer() {
                    return Err(
                        self.type_err(loc, "switch quantity is not an integer".to_string())
                    );
                }
                self.expect(TokenKind::RParen, "')'")?;
                let cond_ty = self.sess.types.promote(cond.ty);
                let cond = if cond.ty == cond_ty {
                    cond
                } else {
                    self.new_cast(cond, cond_ty)
                };

                let break_label = self.sess.new_label();
                self.break_stack.push(break_label);
                self.switch_stack.push(SwitchFrame {
                    cases: Vec::new(),
                    default_label: None,
                    cond_ty,
                });
                let body = Box::new(self.stmt()?);
                self.break_stack.pop();
                let frame = self.switch_stack.pop().expect("switch frame");

                Ok(Stmt {
                    kind: StmtKind::Switch {
                        cond,
                        body,
                        cases: frame.cases,
                        default_label: frame.default_label,
                        break_label,
                    },
                    loc,
                })
            }
            TokenKind::Case => {
                self.advance();
                if self.switch_stack.is_empty() {
                    return Err(self.parse_err("stray case"));
                }
                let lo = self.const_expr()?;
                let hi = if self.eat(TokenKind::Ellipsis) {
                    self.const_expr()?
                } else {
                    lo
                };
                self.expect(TokenKind::Colon, "':'")?;
                if hi < lo {
                    return Err(self.const_err(loc, "empty case range".to_string()));
                }

                let frame = self.switch_stack.last().expect("switch frame");
                // Narrow case values to the switch type so comparisons agree.
                let (lo, hi) = if self.sess.types.size_of(frame.cond_ty) == 4 {
                    (i64::from(lo as i32), i64::from(hi as i32))
                } else {
                    (lo, hi)
                };

                let label = self.sess.new_label();
                self.switch_stack
                    .last_mut()
                    .expect("switch frame")
                    .cases
                    .push(CaseArm { lo, hi, label });

                let body = Box::new(self.stmt()?);
                Ok(Stmt {
                    kind: StmtKind::Case { body, label },
                    loc,
                })
            }
            TokenKind::Default => {
                self.advance();
                self.expect(TokenKind::Colon, "':'")?;
                if self.switch_stack.is_empty() {
                    return Err(self.parse_err("stray default"));
                }
                let label = self.sess.new_label();
                let frame = self.switch_stack.last_mut().expect("switch frame");
                if frame.default_label.is_some() {
                    return Err(self.parse_err("multiple default labels in one switch"));
                }
                frame.default_label = Some(label);

                let body = Box::new(self.stmt()?);
                Ok(Stmt {
                    kind: StmtKind::Case { body, label },
                    loc,
                })
            }
            TokenKind::Goto => {
                self.advance();
                let name = self.expect(TokenKind::Ident, "label name")?.text;
                self.expect(TokenKind::Semicolon, "';'")?;
                let label = self.label_for(name);
                self.used_gotos.push((name, loc));
                Ok(Stmt {
                    kind: StmtKind::Goto { name, label },
                    loc,
                })
            }
            TokenKind::Break => {
                self.advance();
                self.expect(TokenKind::Semicolon, "';'")?;
                let Some(&label) = self.break_stack.last() else {
                    return Err(self.parse_err("stray break"));
                };
                let name = self.sess.interner.intern("break");
                Ok(Stmt {
                    kind: StmtKind::Goto { name, label },
                    loc,
                })
            }
            TokenKind::Continue => {
                self.advance();
                self.expect(TokenKind::Semicolon, "';'")?;
                let Some(&label) = self.continue_stack.last() else {
                    return Err(self.parse_err("stray continue"));
                };
                let name = self.sess.interner.intern("continue");
                Ok(Stmt {
                    kind: StmtKind::Goto { name, label },
                    loc,
                })
            }
            TokenKind::Ident if self.peek_kind(1) == TokenKind::Colon => {
                let name = self.advance().text;
                self.advance(); // ':'
                if !self.defined_labels.insert(name) {
                    return Err(self.type_err(
                        loc,
                        format!("duplicate label '{}'", self.sess.interner.resolve(name)),
                    ));
                }
                let label = self.label_for(name);
                let stmt = Box::new(self.stmt()?);
                Ok(Stmt {
                    kind: StmtKind::Labeled { name, label, stmt },
                    loc,
                })
            }
            TokenKind::Asm => {
                self.advance();
                // `asm volatile ( "..." )`; qualifiers are ignored.
                while matches!(self.kind(), TokenKind::Volatile | TokenKind::Inline) {
                    self.advance();
                }
                self.expect(TokenKind::LParen, "'('")?;
                let tok = self.expect(TokenKind::Str, "string literal")?;
                let code = match tok.value {
                    TokenValue::Str { bytes, .. } => {
                        let text = String::from_utf8_lossy(&bytes[..bytes.len().saturating_sub(1)])
                            .into_owned();
                        self.sess.interner.intern(&text)
                    }
                    _ => tok.text,
                };
                self.expect(TokenKind::RParen, "')'")?;
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Stmt {
                    kind: StmtKind::Asm { code },
                    loc,
                })
            }
            TokenKind::LBrace => {
                self.advance();
                self.enter_scope();
                let block = self.compound_stmt_tail(loc)?;
                self.leave_scope();
                Ok(block)
            }
            TokenKind::Semicolon => {
                self.advance();
                Ok(self.empty_stmt(loc))
            }
            _ => {
                let e = self.expr()?;
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Stmt {
                    kind: StmtKind::Expr(e),
                    loc,
                })
            }
        }
    }

    /// Unique label for a named goto target, created on first mention.
    fn label_for(&mut self, name: crate::intern::Sym) -> crate::session::Label {
        if let Some(&l) = self.goto_labels.get(&name) {
            return l;
        }
        let l = self.sess.new_label();
        self.goto_labels.insert(name, l);
        l
    }
}
