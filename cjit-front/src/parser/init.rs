//! Initializer parsing and lowering.
//!
//! A parsed initializer mirrors the target type as a tree. Locals lower to a
//! sequence of assignment statements (preceded by a whole-object zero when
//! the aggregate has unspecified positions); globals evaluate to a flat byte
//! image plus relocation entries for address-valued slots.

use crate::ast::{Expr, ExprKind, Stmt, StmtKind};
use crate::ctype::{Member, TypeId, TypeKind, TypeFlags};
use crate::obj::{InitReloc, ObjId};
use crate::token::{TokenKind, TokenValue};
use crate::{Result, SourceLoc};

use super::eval::RelocTarget;
use super::Parser;

/// A parsed initializer tree mirroring the target type.
#[derive(Debug)]
pub struct Initializer {
    /// Target type of this node.
    pub ty: TypeId,
    /// Scalar expression, or a whole-aggregate expression.
    pub expr: Option<Expr>,
    /// Sub-initializers for aggregate types.
    pub children: Vec<Initializer>,
    /// For unions: which member the initializer targets.
    pub union_member: Option<usize>,
    /// Array of unknown length whose size the initializer determines.
    flexible: bool,
}

impl<'s> Parser<'s> {
    fn new_initializer(&mut self, ty: TypeId, allow_flexible: bool) -> Initializer {
        let t = self.sess.types.get(ty).clone();
        let mut init = Initializer {
            ty,
            expr: None,
            children: Vec::new(),
            union_member: None,
            flexible: false,
        };
        match t.kind {
            TypeKind::Array => {
                if t.array_len < 0 {
                    init.flexible = allow_flexible;
                } else {
                    let base = t.base.expect("array base");
                    init.children = (0..t.array_len)
                        .map(|_| self.new_initializer(base, false))
                        .collect();
                }
            }
            TypeKind::Struct | TypeKind::Union => {
                let members = t.members.clone();
                let flexible_struct = t.flags.contains(TypeFlags::FLEXIBLE);
                let last = members.len().saturating_sub(1);
                init.children = members
                    .iter()
                    .enumerate()
                    .map(|(i, m)| {
                        let child_flexible =
                            allow_flexible && flexible_struct && i == last;
                        self.new_initializer(m.ty, child_flexible)
                    })
                    .collect();
            }
            _ => {}
        }
        init
    }

    /// Parse an initializer for `ty`; returns the tree and the possibly
    /// completed type (arrays of unknown length take their size from the
    /// initializer).
    fn initializer(&mut self, ty: TypeId) -> Result<(Initializer, TypeId)> {
        let mut init = self.new_initializer(ty, true);
        self.initializer2(&mut init)?;
        let completed = init.ty;
        Ok((init, completed))
    }

    /// Dispatch on the target type.
    fn initializer2(&mut self, init: &mut Initializer) -> Result<()> {
        let kind = self.sess.types.kind(init.ty);
        match kind {
            TypeKind::Array => {
                if self.is(TokenKind::Str) {
                    return self.string_initializer(init);
                }
                if self.is(TokenKind::LBrace) {
                    self.array_initializer_braced(init)
                } else {
                    self.array_initializer_unbraced(init)
                }
            }
            TypeKind::Struct => {
                if self.is(TokenKind::LBrace) {
                    return self.struct_initializer_braced(init);
                }
                // A struct can be initialized from another struct value.
                let cp = self.checkpoint();
                if let Ok(e) = self.assign() {
                    if self.sess.types.is_compatible(e.ty, init.ty) {
                        init.expr = Some(e);
                        return Ok(());
                    }
                }
                self.rewind(cp);
                self.struct_initializer_unbraced(init)
            }
            TypeKind::Union => self.union_initializer(init),
            _ => {
                // Scalar, possibly wrapped in redundant braces.
                if self.eat(TokenKind::LBrace) {
                    self.initializer2(init)?;
                    // Ignore anything after the first element.
                    while !self.consume_initializer_end() {
                        self.expect(TokenKind::Comma, "','")?;
                        if self.consume_initializer_end() {
                            break;
                        }
                        self.skip_excess_element()?;
                    }
                    return Ok(());
                }
                let loc = self.loc();
                let e = self.assign()?;
                let target = self.sess.types.get(init.ty).clone();
                if !target.is_numeric() && !matches!(target.kind, TypeKind::Ptr) {
                    return Err(self.type_err(loc, "invalid initializer".to_string()));
                }
                init.expr = Some(e);
                Ok(())
            }
        }
    }

    /// `}` or `,}` ends a braced list.
    fn consume_initializer_end(&mut self) -> bool {
        if self.eat(TokenKind::RBrace) {
            return true;
        }
        if self.is(TokenKind::Comma) && self.peek_kind(1) == TokenKind::RBrace {
            self.advance();
            self.advance();
            return true;
        }
        false
    }

    /// Excess initializers are consumed but ignored.
    fn skip_excess_element(&mut self) -> Result<()> {
        if self.eat(TokenKind::LBrace) {
            let mut depth = 1;
            while depth > 0 {
                if self.tok().is_eof() {
                    return Err(self.parse_err("unterminated initializer"));
                }
                match self.kind() {
                    TokenKind::LBrace => depth += 1,
                    TokenKind::RBrace => depth -= 1,
                    _ => {}
                }
                self.advance();
            }
            return Ok(());
        }
        let _ = self.assign()?;
        Ok(())
    }

    /// `[k]` or `[a ... b]` designator; returns the inclusive index range.
    fn array_designator(&mut self, len: i32) -> Result<(usize, usize)> {
        let loc = self.loc();
        self.expect(TokenKind::LBracket, "'['")?;
        let begin = self.const_expr()?;
        let end = if self.eat(TokenKind::Ellipsis) {
            self.const_expr()?
        } else {
            begin
        };
        self.expect(TokenKind::RBracket, "']'")?;
        if begin < 0 || end < begin || (len >= 0 && end >= i64::from(len)) {
            return Err(self.const_err(loc, "array designator index out of range".to_string()));
        }
        Ok((begin as usize, end as usize))
    }

    /// `.field` designator; returns the member ordinal.
    fn struct_designator(&mut self, ty: TypeId) -> Result<usize> {
        let loc = self.loc();
        self.expect(TokenKind::Dot, "'.'")?;
        let name = self.expect(TokenKind::Ident, "member name")?.text;
        let members = self.sess.types.get(ty).members.clone();
        // Direct member, or a member of an anonymous aggregate.
        for (i, m) in members.iter().enumerate() {
            if m.name == Some(name) {
                return Ok(i);
            }
        }
        for (i, m) in members.iter().enumerate() {
            if m.name.is_none() && self.sess.types.get(m.ty).is_aggregate() {
                let found = self.sess.types.get(m.ty).members.iter().any(|inner| inner.name == Some(name));
                if found {
                    // Back up so the nested initializer sees the designator.
                    self.rewind(self.checkpoint() - 2);
                    return Ok(i);
                }
            }
        }
        Err(self.type_err(
            loc,
            format!("no such member: '{}'", self.sess.interner.resolve(name)),
        ))
    }

    /// Continuation after a designator: nested designators or `=`, then the
    /// element initializer.
    fn designation(&mut self, init: &mut Initializer) -> Result<()> {
        if self.is(TokenKind::LBracket) {
            if self.sess.types.kind(init.ty) != TypeKind::Array {
                return Err(self.parse_err("array index in non-array initializer"));
            }
            let len = self.sess.types.get(init.ty).array_len;
            let (begin, end) = self.array_designator(len)?;
            let cp = self.checkpoint();
            for i in begin..=end {
                self.rewind(cp);
                self.designation(&mut init.children[i])?;
            }
            return Ok(());
        }
        if self.is(TokenKind::Dot) {
            let kind = self.sess.types.kind(init.ty);
            if kind == TypeKind::Struct || kind == TypeKind::Union {
                let idx = self.struct_designator(init.ty)?;
                if kind == TypeKind::Union {
                    init.union_member = Some(idx);
                }
                return self.designation(&mut init.children[idx]);
            }
            return Err(self.parse_err("field name not in a struct or union initializer"));
        }
        self.eat(TokenKind::Assign);
        self.initializer2(init)
    }

    /// Speculative pre-scan to size an array of unknown length.
    fn count_array_elements(&mut self, elem: TypeId) -> Result<usize> {
        let cp = self.checkpoint();
        let mut dummy = self.new_initializer(elem, true);
        let mut i: usize = 0;
        let mut max: usize = 0;
        let mut first = true;
        while !self.consume_initializer_end() {
            if !first {
                self.expect(TokenKind::Comma, "','")?;
            }
            first = false;
            if self.is(TokenKind::LBracket) {
                self.advance();
                let idx = self.const_expr()?;
                let idx = if self.eat(TokenKind::Ellipsis) {
                    self.const_expr()?
                } else {
                    idx
                };
                self.expect(TokenKind::RBracket, "']'")?;
                if idx < 0 {
                    return Err(self.parse_err("array designator index is negative"));
                }
                i = idx as usize;
                self.designation(&mut dummy)?;
            } else {
                self.initializer2(&mut dummy)?;
            }
            i += 1;
            max = max.max(i);
        }
        self.rewind(cp);
        Ok(max)
    }

    fn complete_flexible_array(&mut self, init: &mut Initializer, len: usize) {
        let base = self.sess.types.get(init.ty).base.expect("array base");
        let completed = self.sess.types.array_of(base, len as i32);
        *init = self.new_initializer(completed, false);
    }

    fn array_initializer_braced(&mut self, init: &mut Initializer) -> Result<()> {
        self.expect(TokenKind::LBrace, "'{'")?;
        if init.flexible {
            let base = self.sess.types.get(init.ty).base.expect("array base");
            let len = self.count_array_elements(base)?;
            self.complete_flexible_array(init, len);
        }

        let len = init.children.len();
        let mut i: usize = 0;
        let mut first = true;
        while !self.consume_initializer_end() {
            if !first {
                self.expect(TokenKind::Comma, "','")?;
                if self.consume_initializer_end() {
                    break;
                }
            }
            first = false;

            if self.is(TokenKind::LBracket) {
                let (begin, end) = self.array_designator(len as i32)?;
                let cp = self.checkpoint();
                for j in begin..=end {
                    self.rewind(cp);
                    self.designation(&mut init.children[j])?;
                }
                i = end + 1;
                continue;
            }

            if i < len {
                self.initializer2(&mut init.children[i])?;
            } else {
                self.skip_excess_element()?;
            }
            i += 1;
        }
        Ok(())
    }

    fn array_initializer_unbraced(&mut self, init: &mut Initializer) -> Result<()> {
        if init.flexible {
            let base = self.sess.types.get(init.ty).base.expect("array base");
            let len = self.count_array_elements_unbraced(base)?;
            self.complete_flexible_array(init, len);
        }
        let len = init.children.len();
        let mut i = 0;
        while i < len && !self.is(TokenKind::RBrace) && !self.is(TokenKind::Semicolon) {
            if i > 0 && !self.eat(TokenKind::Comma) {
                break;
            }
            self.initializer2(&mut init.children[i])?;
            i += 1;
        }
        Ok(())
    }

    fn count_array_elements_unbraced(&mut self, elem: TypeId) -> Result<usize> {
        let cp = self.checkpoint();
        let mut dummy = self.new_initializer(elem, true);
        let mut n = 0;
        loop {
            if n > 0 && !self.eat(TokenKind::Comma) {
                break;
            }
            self.initializer2(&mut dummy)?;
            n += 1;
            if self.is(TokenKind::RBrace) || self.is(TokenKind::Semicolon) {
                break;
            }
        }
        self.rewind(cp);
        Ok(n)
    }

    fn struct_initializer_braced(&mut self, init: &mut Initializer) -> Result<()> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let len = init.children.len();
        let mut i: usize = 0;
        let mut first = true;
        while !self.consume_initializer_end() {
            if !first {
                self.expect(TokenKind::Comma, "','")?;
                if self.consume_initializer_end() {
                    break;
                }
            }
            first = false;

            if self.is(TokenKind::Dot) {
                let idx = self.struct_designator(init.ty)?;
                self.designation(&mut init.children[idx])?;
                i = idx + 1;
                continue;
            }

            if i < len {
                self.initializer2(&mut init.children[i])?;
            } else {
                self.skip_excess_element()?;
            }
            i += 1;
        }
        Ok(())
    }

    fn struct_initializer_unbraced(&mut self, init: &mut Initializer) -> Result<()> {
        let len = init.children.len();
        let mut i = 0;
        while i < len && !self.is(TokenKind::RBrace) && !self.is(TokenKind::Semicolon) {
            if i > 0 && !self.eat(TokenKind::Comma) {
                break;
            }
            self.initializer2(&mut init.children[i])?;
            i += 1;
        }
        Ok(())
    }

    fn union_initializer(&mut self, init: &mut Initializer) -> Result<()> {
        if self.is(TokenKind::LBrace) && self.peek_kind(1) == TokenKind::Dot {
            self.advance();
            let idx = self.struct_designator(init.ty)?;
            init.union_member = Some(idx);
            self.designation(&mut init.children[idx])?;
            // Anything further is ignored.
            while !self.consume_initializer_end() {
                self.expect(TokenKind::Comma, "','")?;
                if self.consume_initializer_end() {
                    break;
                }
                self.skip_excess_element()?;
            }
            return Ok(());
        }

        init.union_member = Some(0);
        if self.eat(TokenKind::LBrace) {
            if init.children.is_empty() {
                return Err(self.parse_err("initializer for empty union"));
            }
            self.initializer2(&mut init.children[0])?;
            while !self.consume_initializer_end() {
                self.expect(TokenKind::Comma, "','")?;
                if self.consume_initializer_end() {
                    break;
                }
                self.skip_excess_element()?;
            }
            Ok(())
        } else {
            if init.children.is_empty() {
                return Err(self.parse_err("initializer for empty union"));
            }
            self.initializer2(&mut init.children[0])
        }
    }

    fn string_initializer(&mut self, init: &mut Initializer) -> Result<()> {
        let tok = self.advance();
        let TokenValue::Str { bytes, ty: str_ty } = tok.value else {
            return Err(self.parse_err("malformed string literal"));
        };
        let lit_elem = self.sess.types.get(str_ty).base.expect("string base");
        let lit_width = self.sess.types.size_of(lit_elem).unsigned_abs() as usize;
        let lit_len = bytes.len() / lit_width;

        if init.flexible {
            self.complete_flexible_array(init, lit_len);
        }
        let n = init.children.len().min(lit_len);
        for i in 0..n {
            let chunk = &bytes[i * lit_width..(i + 1) * lit_width];
            let v = match lit_width {
                1 => i64::from(chunk[0] as i8),
                2 => i64::from(u16::from_le_bytes([chunk[0], chunk[1]])),
                _ => i64::from(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            };
            init.children[i].expr = Some(Expr {
                kind: ExprKind::Num(v),
                ty: crate::ctype::TypeTable::INT,
                loc: tok.loc,
            });
        }
        Ok(())
    }

    // ----- local lowering ----------------------------------------------

    /// Whether every leaf position of the initializer is explicitly set.
    fn is_fully_specified(&self, init: &Initializer) -> bool {
        if init.expr.is_some() {
            return true;
        }
        let t = self.sess.types.get(init.ty);
        match t.kind {
            TypeKind::Array | TypeKind::Struct => {
                !init.children.is_empty()
                    && init.children.iter().all(|c| self.is_fully_specified(c))
            }
            // Unions always leave the non-chosen members unspecified.
            TypeKind::Union => false,
            _ => false,
        }
    }

    /// Lower a local initializer to assignment statements.
    pub(crate) fn lvar_initializer(&mut self, var: ObjId, loc: SourceLoc) -> Result<Vec<Stmt>> {
        let ty = self.unit.get(var).ty;
        let (init, completed) = self.initializer(ty)?;
        if completed != ty {
            self.unit.get_mut(var).ty = completed;
        }

        let mut stmts = Vec::new();
        let aggregate = self.sess.types.get(completed).is_aggregate()
            || self.sess.types.kind(completed) == TypeKind::Array;
        if aggregate && !self.is_fully_specified(&init) {
            stmts.push(Stmt {
                kind: StmtKind::Expr(Expr {
                    kind: ExprKind::MemZero(var),
                    ty: crate::ctype::TypeTable::VOID,
                    loc,
                }),
                loc,
            });
        }

        let lvalue = Expr {
            kind: ExprKind::Var(var),
            ty: completed,
            loc,
        };
        self.lvar_init_stmts(&init, lvalue, loc, &mut stmts)?;
        Ok(stmts)
    }

    fn lvar_init_stmts(
        &mut self,
        init: &Initializer,
        lvalue: Expr,
        loc: SourceLoc,
        stmts: &mut Vec<Stmt>,
    ) -> Result<()> {
        let t = self.sess.types.get(init.ty).clone();
        match t.kind {
            TypeKind::Array => {
                for (i, child) in init.children.iter().enumerate() {
                    let idx = self.new_num(i as i64, loc);
                    let sum = self.new_add(lvalue.clone(), idx, loc)?;
                    let elem = Expr {
                        kind: ExprKind::Deref(Box::new(sum)),
                        ty: child.ty,
                        loc,
                    };
                    self.lvar_init_stmts(child, elem, loc, stmts)?;
                }
                Ok(())
            }
            TypeKind::Struct if init.expr.is_none() => {
                for (member, child) in t.members.iter().zip(init.children.iter()) {
                    let mem_lv = self.member_lvalue(lvalue.clone(), member, loc);
                    self.lvar_init_stmts(child, mem_lv, loc, stmts)?;
                }
                Ok(())
            }
            TypeKind::Union => {
                let idx = init.union_member.unwrap_or(0);
                if let (Some(member), Some(child)) =
                    (t.members.get(idx), init.children.get(idx))
                {
                    let mem_lv = self.member_lvalue(lvalue, member, loc);
                    self.lvar_init_stmts(child, mem_lv, loc, stmts)?;
                }
                Ok(())
            }
            _ => {
                if let Some(expr) = init.expr.clone() {
                    let assign = self.new_assign(lvalue, expr, loc)?;
                    stmts.push(Stmt {
                        kind: StmtKind::Expr(assign),
                        loc,
                    });
                }
                Ok(())
            }
        }
    }

    fn member_lvalue(&self, base: Expr, member: &Member, loc: SourceLoc) -> Expr {
        Expr {
            kind: ExprKind::Member {
                base: Box::new(base),
                member: member.clone(),
            },
            ty: member.ty,
            loc,
        }
    }

    // ----- global lowering ---------------------------------------------

    /// Parse and evaluate a global initializer to a byte image + relocations.
    pub(crate) fn gvar_initializer(&mut self, var: ObjId) -> Result<()> {
        let ty = self.unit.get(var).ty;
        let (init, completed) = self.initializer(ty)?;
        if completed != ty {
            self.unit.get_mut(var).ty = completed;
        }

        let size = self.sess.types.size_of(completed);
        if size < 0 {
            let loc = self.loc();
            return Err(self.type_err(loc, "variable has incomplete type".to_string()));
        }
        let mut buf = vec![0u8; size as usize];
        let mut relocs = Vec::new();
        self.write_gvar_data(&init, &mut buf, 0, &mut relocs)?;

        let obj = self.unit.get_mut(var);
        obj.init_data = Some(buf);
        obj.relocs = relocs;
        Ok(())
    }

    fn write_gvar_data(
        &mut self,
        init: &Initializer,
        buf: &mut [u8],
        offset: usize,
        relocs: &mut Vec<InitReloc>,
    ) -> Result<()> {
        let t = self.sess.types.get(init.ty).clone();
        match t.kind {
            TypeKind::Array => {
                let base = t.base.expect("array base");
                let elem_size = self.sess.types.size_of(base).max(0) as usize;
                for (i, child) in init.children.iter().enumerate() {
                    self.write_gvar_data(child, buf, offset + i * elem_size, relocs)?;
                }
                Ok(())
            }
            TypeKind::Struct => {
                for (member, child) in t.members.iter().zip(init.children.iter()) {
                    if member.is_bitfield {
                        let Some(expr) = child.expr.as_ref() else {
                            continue;
                        };
                        let loc = expr.loc;
                        let val = self.eval_const(expr)?;
                        let unit_size = self.sess.types.size_of(member.ty).max(1) as usize;
                        let at = offset + member.offset as usize;
                        if at + unit_size > buf.len() {
                            return Err(
                                self.const_err(loc, "initializer overflows object".to_string())
                            );
                        }
                        let mut unit = [0u8; 8];
                        unit[..unit_size].copy_from_slice(&buf[at..at + unit_size]);
                        let mut word = u64::from_le_bytes(unit);
                        let mask = if member.bit_width >= 64 {
                            u64::MAX
                        } else {
                            (1u64 << member.bit_width) - 1
                        };
                        word |= ((val as u64) & mask) << member.bit_offset;
                        let enc = word.to_le_bytes();
                        buf[at..at + unit_size].copy_from_slice(&enc[..unit_size]);
                    } else {
                        self.write_gvar_data(child, buf, offset + member.offset as usize, relocs)?;
                    }
                }
                Ok(())
            }
            TypeKind::Union => {
                let idx = init.union_member.unwrap_or(0);
                if let (Some(member), Some(child)) = (t.members.get(idx), init.children.get(idx)) {
                    let at = offset + member.offset as usize;
                    self.write_gvar_data(child, buf, at, relocs)?;
                }
                Ok(())
            }
            TypeKind::Float => {
                if let Some(expr) = init.expr.as_ref() {
                    let v = self.eval_const_double(expr)? as f32;
                    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
                }
                Ok(())
            }
            TypeKind::Double => {
                if let Some(expr) = init.expr.as_ref() {
                    let v = self.eval_const_double(expr)?;
                    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
                }
                Ok(())
            }
            _ => {
                let Some(expr) = init.expr.as_ref() else {
                    return Ok(());
                };
                let loc = expr.loc;
                let size = self.sess.types.size_of(init.ty).max(0) as usize;
                let mut target: Option<RelocTarget> = None;
                let val = self.eval_const_reloc(expr, &mut target)?;
                if let Some(reloc) = target {
                    if size != 8 {
                        return Err(self.const_err(
                            loc,
                            "address initializer in non-pointer object".to_string(),
                        ));
                    }
                    relocs.push(InitReloc {
                        offset: offset as u32,
                        name: reloc.name,
                        addend: reloc.addend.wrapping_add(val),
                    });
                    return Ok(());
                }
                if offset + size > buf.len() {
                    return Err(self.const_err(loc, "initializer overflows object".to_string()));
                }
                let bytes = val.to_le_bytes();
                buf[offset..offset + size].copy_from_slice(&bytes[..size]);
                Ok(())
            }
        }
    }
}
