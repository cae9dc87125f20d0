//! Declaration parsing: specifiers, declarators, aggregates, enums,
//! typedefs and struct layout.

use crate::ctype::{align_to, Member, TypeFlags, TypeId, TypeKind, TypeTable};
use crate::intern::Sym;
use crate::token::TokenKind;
use crate::Result;

use super::{Parser, VarAttr, VarScopeEntry};

// Counting bit positions for basic type specifiers: each keyword adds a
// fixed increment so combinations like `unsigned long long int` resolve by
// plain integer matching.
const K_VOID: u32 = 1 << 0;
const K_BOOL: u32 = 1 << 2;
const K_CHAR: u32 = 1 << 4;
const K_SHORT: u32 = 1 << 6;
const K_INT: u32 = 1 << 8;
const K_LONG: u32 = 1 << 10;
const K_FLOAT: u32 = 1 << 12;
const K_DOUBLE: u32 = 1 << 14;
const K_OTHER: u32 = 1 << 16;
const K_SIGNED: u32 = 1 << 17;
const K_UNSIGNED: u32 = 1 << 18;

impl<'s> Parser<'s> {
    /// Whether the current token can start a type name.
    pub(crate) fn is_typename(&self) -> bool {
        use TokenKind as T;
        match self.kind() {
            T::Void
            | T::Bool
            | T::Char
            | T::Short
            | T::Int
            | T::Long
            | T::Float
            | T::Double
            | T::Struct
            | T::Union
            | T::Enum
            | T::Typedef
            | T::Static
            | T::Extern
            | T::Inline
            | T::ThreadLocal
            | T::Signed
            | T::Unsigned
            | T::Const
            | T::Volatile
            | T::Auto
            | T::Register
            | T::Restrict
            | T::Noreturn
            | T::Alignas
            | T::Atomic
            | T::Attribute => true,
            T::Ident => self.is_typedef_name(self.tok().text),
            _ => false,
        }
    }

    /// declspec = type-specifier+ with interleaved storage classes and
    /// qualifiers. `attr` is `None` where storage classes are not allowed.
    pub(crate) fn declspec(&mut self, mut attr: Option<&mut VarAttr>) -> Result<TypeId> {
        let mut counter: u32 = 0;
        let mut ty = TypeTable::INT;

        while self.is_typename() {
            let loc = self.loc();
            match self.kind() {
                TokenKind::Typedef
                | TokenKind::Static
                | TokenKind::Extern
                | TokenKind::Inline
                | TokenKind::ThreadLocal => {
                    let kind = self.kind();
                    let Some(a) = attr.as_deref_mut() else {
                        return Err(self
                            .parse_err("storage class specifier is not allowed in this context"));
                    };
                    match kind {
                        TokenKind::Typedef => a.is_typedef = true,
                        TokenKind::Static => a.is_static = true,
                        TokenKind::Extern => a.is_extern = true,
                        TokenKind::Inline => a.is_inline = true,
                        TokenKind::ThreadLocal => a.is_tls = true,
                        _ => unreachable!(),
                    }
                    if a.is_typedef && (a.is_static || a.is_extern || a.is_inline || a.is_tls) {
                        return Err(self.type_err(
                            loc,
                            "typedef may not be used together with other storage classes"
                                .to_string(),
                        ));
                    }
                    self.advance();
                    continue;
                }
                // Qualifiers are accepted and ignored.
                TokenKind::Const
                | TokenKind::Volatile
                | TokenKind::Auto
                | TokenKind::Register
                | TokenKind::Restrict
                | TokenKind::Noreturn => {
                    self.advance();
                    continue;
                }
                TokenKind::Atomic => {
                    self.advance();
                    if self.eat(TokenKind::LParen) {
                        // `_Atomic(type)`
                        ty = self.typename()?;
                        self.expect(TokenKind::RParen, "')'")?;
                        counter += K_OTHER;
                        let flagged = self.sess.types.copy(ty);
                        self.sess.types.get_mut(flagged).flags |= TypeFlags::ATOMIC;
                        ty = flagged;
                    }
                    continue;
                }
                TokenKind::Alignas => {
                    let Some(a) = attr.as_deref_mut() else {
                        return Err(self.parse_err("_Alignas is not allowed in this context"));
                    };
                    self.advance();
                    self.expect(TokenKind::LParen, "'('")?;
                    let align = if self.is_typename() {
                        let t = self.typename()?;
                        self.sess.types.align_of(t)
                    } else {
                        let v = self.const_expr()?;
                        u32::try_from(v)
                            .map_err(|_| self.const_err(loc, "invalid alignment".to_string()))?
                    };
                    a.align = Some(align);
                    self.expect(TokenKind::RParen, "')'")?;
                    continue;
                }
                TokenKind::Attribute => {
                    let (_, align) = self.attribute_list()?;
                    if let (Some(a), Some(align)) = (attr.as_deref_mut(), align) {
                        a.align = Some(align);
                    }
                    continue;
                }
                TokenKind::Struct | TokenKind::Union => {
                    if counter != 0 {
                        break;
                    }
                    ty = self.struct_union_decl()?;
                    counter += K_OTHER;
                    continue;
                }
                TokenKind::Enum => {
                    if counter != 0 {
                        break;
                    }
                    ty = self.enum_specifier()?;
                    counter += K_OTHER;
                    continue;
                }
                TokenKind::Ident => {
                    // Typedef name; only valid as the sole type specifier.
                    if counter != 0 {
                        break;
                    }
                    let name = self.tok().text;
                    match self.find_var(name) {
                        Some(VarScopeEntry::Typedef(t)) => {
                            ty = t;
                            counter += K_OTHER;
                            self.advance();
                            continue;
                        }
                        _ => break,
                    }
                }
                TokenKind::Void => counter += K_VOID,
                TokenKind::Bool => counter += K_BOOL,
                TokenKind::Char => counter += K_CHAR,
                TokenKind::Short => counter += K_SHORT,
                TokenKind::Int => counter += K_INT,
                TokenKind::Long => counter += K_LONG,
                TokenKind::Float => counter += K_FLOAT,
                TokenKind::Double => counter += K_DOUBLE,
                TokenKind::Signed => counter += K_SIGNED,
                TokenKind::Unsigned => counter += K_UNSIGNED,
                _ => break,
            }
            self.advance();

            // LLP64: `long` alone stays 32-bit; only `long long` widens.
            ty = match counter {
                x if x == K_VOID => TypeTable::VOID,
                x if x == K_BOOL => TypeTable::BOOL,
                x if x == K_CHAR || x == K_SIGNED + K_CHAR => TypeTable::CHAR,
                x if x == K_UNSIGNED + K_CHAR => TypeTable::UCHAR,
                x if x == K_SHORT
                    || x == K_SHORT + K_INT
                    || x == K_SIGNED + K_SHORT
                    || x == K_SIGNED + K_SHORT + K_INT =>
                {
                    TypeTable::SHORT
                }
                x if x == K_UNSIGNED + K_SHORT || x == K_UNSIGNED + K_SHORT + K_INT => {
                    TypeTable::USHORT
                }
                x if x == K_INT
                    || x == K_SIGNED
                    || x == K_SIGNED + K_INT
                    || x == K_LONG
                    || x == K_LONG + K_INT
                    || x == K_SIGNED + K_LONG
                    || x == K_SIGNED + K_LONG + K_INT =>
                {
                    TypeTable::INT
                }
                x if x == K_UNSIGNED
                    || x == K_UNSIGNED + K_INT
                    || x == K_UNSIGNED + K_LONG
                    || x == K_UNSIGNED + K_LONG + K_INT =>
                {
                    TypeTable::UINT
                }
                x if x == K_LONG + K_LONG
                    || x == K_LONG + K_LONG + K_INT
                    || x == K_SIGNED + K_LONG + K_LONG
                    || x == K_SIGNED + K_LONG + K_LONG + K_INT =>
                {
                    TypeTable::LONG
                }
                x if x == K_UNSIGNED + K_LONG + K_LONG
                    || x == K_UNSIGNED + K_LONG + K_LONG + K_INT =>
                {
                    TypeTable::ULONG
                }
                x if x == K_FLOAT => TypeTable::FLOAT,
                x if x == K_DOUBLE || x == K_LONG + K_DOUBLE => TypeTable::DOUBLE,
                x if x & K_OTHER != 0 => ty,
                _ => {
                    return Err(self.type_err(loc, "invalid type specifier combination".to_string()))
                }
            };
        }

        Ok(ty)
    }

    /// `__attribute__((...))`; only `packed` and `aligned(N)` are honored.
    pub(crate) fn attribute_list(&mut self) -> Result<(bool, Option<u32>)> {
        let mut packed = false;
        let mut align = None;
        while self.is(TokenKind::Attribute) {
            self.advance();
            self.expect(TokenKind::LParen, "'('")?;
            self.expect(TokenKind::LParen, "'('")?;
            let mut first = true;
            while !self.is(TokenKind::RParen) {
                if !first {
                    self.expect(TokenKind::Comma, "','")?;
                }
                first = false;
                if self.eat(TokenKind::Packed) {
                    packed = true;
                } else if self.eat(TokenKind::Aligned) {
                    if self.eat(TokenKind::LParen) {
                        let loc = self.loc();
                        let v = self.const_expr()?;
                        align = Some(u32::try_from(v).map_err(|_| {
                            self.const_err(loc, "invalid alignment".to_string())
                        })?);
                        self.expect(TokenKind::RParen, "')'")?;
                    } else {
                        align = Some(16);
                    }
                } else {
                    // Unknown attribute: consume one identifier-ish token and
                    // any parenthesized arguments.
                    self.advance();
                    if self.eat(TokenKind::LParen) {
                        let mut depth = 1;
                        while depth > 0 && !self.tok().is_eof() {
                            match self.kind() {
                                TokenKind::LParen => depth += 1,
                                TokenKind::RParen => depth -= 1,
                                _ => {}
                            }
                            self.advance();
                        }
                        continue;
                    }
                }
            }
            self.expect(TokenKind::RParen, "')'")?;
            self.expect(TokenKind::RParen, "')'")?;
        }
        Ok((packed, align))
    }

    // ----- declarators -------------------------------------------------

    fn pointers(&mut self, mut ty: TypeId) -> Result<TypeId> {
        while self.eat(TokenKind::Star) {
            ty = self.sess.types.pointer_to(ty);
            while matches!(
                self.kind(),
                TokenKind::Const
                    | TokenKind::Volatile
                    | TokenKind::Restrict
                    | TokenKind::Atomic
            ) {
                self.advance();
            }
        }
        Ok(ty)
    }

    /// declarator = "*"* ("(" declarator ")" | ident?) type-suffix
    pub(crate) fn declarator(&mut self, base: TypeId) -> Result<(TypeId, Option<Sym>)> {
        let base = self.pointers(base)?;

        if self.is(TokenKind::LParen) && !self.group_is_param_list() {
            // Parenthesized declarator: the suffix after the group binds
            // tighter than the group contents, so parse the suffix first
            // against a dummy, then re-parse the group with the real base.
            let group_start = self.checkpoint();
            self.advance(); // '('
            let _ = self.declarator(TypeTable::VOID)?;
            self.expect(TokenKind::RParen, "')'")?;
            let suffixed = self.type_suffix(base)?;
            let after = self.checkpoint();

            self.rewind(group_start);
            self.advance(); // '('
            let (ty, name) = self.declarator(suffixed)?;
            self.rewind(after);
            return Ok((ty, name));
        }

        let name = if self.is(TokenKind::Ident) {
            Some(self.advance().text)
        } else {
            None
        };
        let ty = self.type_suffix(base)?;
        Ok((ty, name))
    }

    /// Speculative declarator used by function/variable disambiguation.
    pub(crate) fn declarator_peek(&mut self) -> Option<TypeId> {
        self.declarator(TypeTable::INT).ok().map(|(ty, _)| ty)
    }

    /// A `(` starts a parameter list (not a grouped declarator) when the
    /// next token is a type name or an immediate `)`.
    fn group_is_param_list(&self) -> bool {
        match self.peek_kind(1) {
            TokenKind::RParen => true,
            TokenKind::Ident => {
                // A typedef name right after '(' starts a parameter list; any
                // other identifier is a grouped declarator.
                let name = self.toks[self.pos + 1].text;
                self.is_typedef_name(name)
            }
            k => {
                matches!(
                    k,
                    TokenKind::Void
                        | TokenKind::Bool
                        | TokenKind::Char
                        | TokenKind::Short
                        | TokenKind::Int
                        | TokenKind::Long
                        | TokenKind::Float
                        | TokenKind::Double
                        | TokenKind::Struct
                        | TokenKind::Union
                        | TokenKind::Enum
                        | TokenKind::Signed
                        | TokenKind::Unsigned
                        | TokenKind::Const
                )
            }
        }
    }

    /// type-suffix = "(" func-params | "[" array-dims | ε
    fn type_suffix(&mut self, ty: TypeId) -> Result<TypeId> {
        if self.eat(TokenKind::LParen) {
            return self.func_params(ty);
        }
        if self.eat(TokenKind::LBracket) {
            let len = if self.is(TokenKind::RBracket) {
                -1
            } else {
                let loc = self.loc();
                let v = self.const_expr()?;
                i32::try_from(v)
                    .ok()
                    .filter(|&n| n >= 0)
                    .ok_or_else(|| self.const_err(loc, "invalid array size".to_string()))?
            };
            self.expect(TokenKind::RBracket, "']'")?;
            let inner = self.type_suffix(ty)?;
            return Ok(self.sess.types.array_of(inner, len));
        }
        Ok(ty)
    }

    fn func_params(&mut self, ret: TypeId) -> Result<TypeId> {
        // `(void)` and `()` both declare a zero-parameter function.
        if self.is(TokenKind::Void) && self.peek_kind(1) == TokenKind::RParen {
            self.advance();
            self.advance();
            self.last_param_names = Vec::new();
            return Ok(self.sess.types.func(ret, Vec::new(), false));
        }
        if self.eat(TokenKind::RParen) {
            self.last_param_names = Vec::new();
            return Ok(self.sess.types.func(ret, Vec::new(), false));
        }

        let mut params = Vec::new();
        let mut names = Vec::new();
        let mut variadic = false;
        let mut first = true;
        while !self.eat(TokenKind::RParen) {
            if !first {
                self.expect(TokenKind::Comma, "','")?;
            }
            first = false;

            if self.eat(TokenKind::Ellipsis) {
                variadic = true;
                self.expect(TokenKind::RParen, "')'")?;
                break;
            }

            let basety = self.declspec(None)?;
            let (mut pty, pname) = self.declarator(basety)?;

            // Array and function parameters decay to pointers.
            match self.sess.types.kind(pty) {
                TypeKind::Array => {
                    let base = self.sess.types.get(pty).base.expect("array base");
                    pty = self.sess.types.pointer_to(base);
                }
                TypeKind::Func => {
                    pty = self.sess.types.pointer_to(pty);
                }
                _ => {}
            }
            params.push(pty);
            names.push(pname);
        }

        self.last_param_names = names;
        Ok(self.sess.types.func(ret, params, variadic))
    }

    /// typename = declspec abstract-declarator (casts, sizeof, _Alignas).
    pub(crate) fn typename(&mut self) -> Result<TypeId> {
        let base = self.declspec(None)?;
        let (ty, _) = self.declarator(base)?;
        Ok(ty)
    }

    // ----- aggregates ---------------------------------------------------

    fn struct_union_decl(&mut self) -> Result<TypeId> {
        let record_kind = if self.kind() == TokenKind::Struct {
            TypeKind::Struct
        } else {
            TypeKind::Union
        };
        self.advance();
        let (mut packed, mut explicit_align) = self.attribute_list()?;

        let tag = if self.is(TokenKind::Ident) {
            Some(self.advance().text)
        } else {
            None
        };

        if let Some(tag) = tag {
            if !self.is(TokenKind::LBrace) {
                // Reference (possibly forward) to a tagged record.
                if let Some(existing) = self.find_tag(tag) {
                    return Ok(existing);
                }
                let id = self.sess.types.incomplete_record(record_kind);
                self.sess.types.get_mut(id).name = Some(tag);
                self.push_tag_scope(tag, id);
                return Ok(id);
            }
        }

        let loc = self.loc();
        self.expect(TokenKind::LBrace, "'{'")?;
        let (members, flexible_member) = self.struct_members()?;
        let (p2, a2) = self.attribute_list()?;
        packed |= p2;
        if a2.is_some() {
            explicit_align = a2;
        }

        // Redefining a tag completes the earlier incomplete record in place,
        // so self-referencing members resolve to the same TypeId.
        let id = match tag.and_then(|t| self.find_tag_in_current_scope(t)) {
            Some(existing) if self.sess.types.size_of(existing) < 0 => existing,
            Some(_existing) => {
                return Err(self.type_err(
                    loc,
                    format!(
                        "redefinition of '{}'",
                        tag.map(|t| self.sess.interner.resolve(t).to_owned())
                            .unwrap_or_default()
                    ),
                ));
            }
            None => {
                let id = self.sess.types.incomplete_record(record_kind);
                if let Some(tag) = tag {
                    self.sess.types.get_mut(id).name = Some(tag);
                    self.push_tag_scope(tag, id);
                }
                id
            }
        };

        let (size, align, members) = if record_kind == TypeKind::Struct {
            self.layout_struct(members, packed, explicit_align)?
        } else {
            self.layout_union(members, packed, explicit_align)?
        };
        let flexible = flexible_member && record_kind == TypeKind::Struct;

        let rec = self.sess.types.get_mut(id);
        rec.kind = record_kind;
        rec.size = size;
        rec.align = align;
        rec.members = members;
        if packed {
            rec.flags |= TypeFlags::PACKED;
        }
        if flexible {
            rec.flags |= TypeFlags::FLEXIBLE;
        }
        Ok(id)
    }

    fn struct_members(&mut self) -> Result<(Vec<Member>, bool)> {
        let mut members: Vec<Member> = Vec::new();
        while !self.eat(TokenKind::RBrace) {
            let mut attr = VarAttr::default();
            let basety = self.declspec(Some(&mut attr))?;

            // Anonymous struct/union member.
            if self.sess.types.get(basety).is_aggregate() && self.eat(TokenKind::Semicolon) {
                members.push(Member {
                    name: None,
                    ty: basety,
                    index: members.len() as u32,
                    align: self.sess.types.align_of(basety),
                    offset: 0,
                    bit_offset: 0,
                    bit_width: 0,
                    is_bitfield: false,
                });
                continue;
            }

            let mut first = true;
            while !self.eat(TokenKind::Semicolon) {
                if !first {
                    self.expect(TokenKind::Comma, "','")?;
                }
                first = false;

                let (ty, name) = self.declarator(basety)?;
                let mut member = Member {
                    name,
                    ty,
                    index: members.len() as u32,
                    align: attr.align.unwrap_or_else(|| self.sess.types.align_of(ty)),
                    offset: 0,
                    bit_offset: 0,
                    bit_width: 0,
                    is_bitfield: false,
                };
                if self.eat(TokenKind::Colon) {
                    let loc = self.loc();
                    let width = self.const_expr()?;
                    let max = i64::from(self.sess.types.size_of(ty)) * 8;
                    if width < 0 || width > max {
                        return Err(self.type_err(loc, "invalid bit-field width".to_string()));
                    }
                    member.is_bitfield = true;
                    member.bit_width = width as u32;
                }
                members.push(member);
            }
        }

        // A trailing incomplete array is a flexible array member, treated as
        // zero-sized for layout.
        let mut flexible = false;
        if let Some(last) = members.last_mut() {
            let t = self.sess.types.get(last.ty);
            if t.kind == TypeKind::Array && t.array_len < 0 {
                let base = t.base.expect("array base");
                last.ty = self.sess.types.array_of(base, 0);
                flexible = true;
            }
        }
        Ok((members, flexible))
    }

    fn layout_struct(
        &mut self,
        mut members: Vec<Member>,
        packed: bool,
        explicit_align: Option<u32>,
    ) -> Result<(i32, u32, Vec<Member>)> {
        let mut bits: i64 = 0;
        let mut max_align: u32 = 1;

        for m in members.iter_mut() {
            let size = self.sess.types.size_of(m.ty);
            if size < 0 {
                let loc = self.loc();
                return Err(self.type_err(loc, "member has incomplete type".to_string()));
            }

            if m.is_bitfield {
                let unit_bits = i64::from(size) * 8;
                if m.bit_width == 0 {
                    // Zero-width bitfield: force alignment to the next unit.
                    bits = align_to_i64(bits, unit_bits);
                    continue;
                }
                if !packed && bits / unit_bits != (bits + i64::from(m.bit_width) - 1) / unit_bits {
                    bits = align_to_i64(bits, unit_bits);
                }
                m.offset = ((bits / 8) as u32) & !(size as u32 - 1);
                m.bit_offset = (bits - i64::from(m.offset) * 8) as u32;
                bits += i64::from(m.bit_width);
            } else {
                if !packed {
                    bits = align_to_i64(bits, i64::from(m.align) * 8);
                }
                m.offset = (bits / 8) as u32;
                bits += i64::from(size.max(0)) * 8;
            }

            if !packed {
                max_align = max_align.max(m.align);
            }
        }

        let align = explicit_align.unwrap_or(if packed { 1 } else { max_align });
        let size = align_to(((bits + 7) / 8) as i32, align as i32);
        Ok((size, align, members))
    }

    fn layout_union(
        &mut self,
        mut members: Vec<Member>,
        packed: bool,
        explicit_align: Option<u32>,
    ) -> Result<(i32, u32, Vec<Member>)> {
        let mut size: i32 = 0;
        let mut max_align: u32 = 1;
        for m in members.iter_mut() {
            m.offset = 0;
            m.bit_offset = 0;
            size = size.max(self.sess.types.size_of(m.ty).max(0));
            if !packed {
                max_align = max_align.max(m.align);
            }
        }
        let align = explicit_align.unwrap_or(if packed { 1 } else { max_align });
        Ok((align_to(size, align as i32), align, members))
    }

    // ----- enums --------------------------------------------------------

    fn enum_specifier(&mut self) -> Result<TypeId> {
        self.advance(); // `enum`
        let tag = if self.is(TokenKind::Ident) {
            Some(self.advance().text)
        } else {
            None
        };

        if let Some(tag) = tag {
            if !self.is(TokenKind::LBrace) {
                let loc = self.loc();
                return match self.find_tag(tag) {
                    Some(ty) if self.sess.types.kind(ty) == TypeKind::Enum => Ok(ty),
                    Some(_) => Err(self.type_err(
                        loc,
                        format!("not an enum tag: '{}'", self.sess.interner.resolve(tag)),
                    )),
                    None => Err(self.type_err(
                        loc,
                        format!("unknown enum type: '{}'", self.sess.interner.resolve(tag)),
                    )),
                };
            }
        }

        self.expect(TokenKind::LBrace, "'{'")?;
        let ty = self.sess.types.enum_type();

        let mut value: i64 = 0;
        let mut first = true;
        while !self.eat(TokenKind::RBrace) {
            if !first {
                self.expect(TokenKind::Comma, "','")?;
                // Trailing comma.
                if self.eat(TokenKind::RBrace) {
                    break;
                }
            }
            first = false;

            let name = self.expect(TokenKind::Ident, "enumerator name")?.text;
            if self.eat(TokenKind::Assign) {
                value = self.const_expr()?;
            }
            self.push_var_scope(name, VarScopeEntry::EnumConst { ty, value });
            value = value.wrapping_add(1);
        }

        if let Some(tag) = tag {
            self.push_tag_scope(tag, ty);
        }
        Ok(ty)
    }

    // ----- typedef ------------------------------------------------------

    pub(crate) fn parse_typedef(&mut self, basety: TypeId) -> Result<()> {
        let mut first = true;
        while !self.eat(TokenKind::Semicolon) {
            if !first {
                self.expect(TokenKind::Comma, "','")?;
            }
            first = false;
            let (ty, name) = self.declarator(basety)?;
            let name = name.ok_or_else(|| self.parse_err("typedef name omitted"))?;
            self.push_var_scope(name, VarScopeEntry::Typedef(ty));
        }
        Ok(())
    }
}

fn align_to_i64(n: i64, align: i64) -> i64 {
    debug_assert!(align > 0);
    (n + align - 1) / align * align
}
