//! Lexical analysis.
//!
//! Tokenization runs over a normalized copy of the source: BOM stripped,
//! line endings canonicalized to `\n`, backslash-newline continuations
//! removed (line count preserved by re-emitting the newlines at the end of
//! the buffer) and `\uXXXX` / `\UXXXXXXXX` escapes decoded to UTF-8 in
//! place. Numeric literals are first scanned as preprocessing numbers and
//! refined in a second pass; a final pass concatenates adjacent string
//! literals of the same character width.

use tracing::debug;

use crate::ctype::{TypeId, TypeTable};
use crate::error::FrontError;
use crate::intern::Sym;
use crate::session::Session;
use crate::token::{Token, TokenFlags, TokenKind, TokenValue};
use crate::{Result, SourceLoc};

/// Element width of a string or character literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrKind {
    /// `"..."` and `u8"..."`.
    Narrow,
    /// `u"..."` and `L"..."` (UTF-16 on this target).
    Utf16,
    /// `U"..."`.
    Utf32,
}

impl StrKind {
    fn elem_type(self) -> TypeId {
        match self {
            StrKind::Narrow => TypeTable::CHAR,
            StrKind::Utf16 => TypeTable::USHORT,
            StrKind::Utf32 => TypeTable::UINT,
        }
    }

    fn elem_size(self) -> usize {
        match self {
            StrKind::Narrow => 1,
            StrKind::Utf16 => 2,
            StrKind::Utf32 => 4,
        }
    }
}

const KEYWORDS: &[(&str, TokenKind)] = &[
    ("return", TokenKind::Return),
    ("if", TokenKind::If),
    ("else", TokenKind::Else),
    ("for", TokenKind::For),
    ("while", TokenKind::While),
    ("int", TokenKind::Int),
    ("sizeof", TokenKind::Sizeof),
    ("char", TokenKind::Char),
    ("struct", TokenKind::Struct),
    ("union", TokenKind::Union),
    ("short", TokenKind::Short),
    ("long", TokenKind::Long),
    ("void", TokenKind::Void),
    ("typedef", TokenKind::Typedef),
    ("_Bool", TokenKind::Bool),
    ("enum", TokenKind::Enum),
    ("static", TokenKind::Static),
    ("goto", TokenKind::Goto),
    ("break", TokenKind::Break),
    ("continue", TokenKind::Continue),
    ("switch", TokenKind::Switch),
    ("case", TokenKind::Case),
    ("default", TokenKind::Default),
    ("extern", TokenKind::Extern),
    ("_Alignof", TokenKind::Alignof),
    ("_Alignas", TokenKind::Alignas),
    ("do", TokenKind::Do),
    ("signed", TokenKind::Signed),
    ("unsigned", TokenKind::Unsigned),
    ("const", TokenKind::Const),
    ("volatile", TokenKind::Volatile),
    ("auto", TokenKind::Auto),
    ("register", TokenKind::Register),
    ("restrict", TokenKind::Restrict),
    ("__restrict", TokenKind::Restrict),
    ("__restrict__", TokenKind::Restrict),
    ("_Noreturn", TokenKind::Noreturn),
    ("float", TokenKind::Float),
    ("double", TokenKind::Double),
    ("asm", TokenKind::Asm),
    ("__asm__", TokenKind::Asm),
    ("_Thread_local", TokenKind::ThreadLocal),
    ("__thread", TokenKind::ThreadLocal),
    ("_Atomic", TokenKind::Atomic),
    ("__attribute__", TokenKind::Attribute),
    ("inline", TokenKind::Inline),
    ("_Generic", TokenKind::Generic),
    ("packed", TokenKind::Packed),
    ("aligned", TokenKind::Aligned),
];

/// Punctuators ordered longest-first so a linear scan gives longest match.
const PUNCTUATORS: &[(&str, TokenKind)] = &[
    ("<<=", TokenKind::ShlAssign),
    (">>=", TokenKind::ShrAssign),
    ("...", TokenKind::Ellipsis),
    ("==", TokenKind::EqEq),
    ("!=", TokenKind::NotEq),
    ("<=", TokenKind::LessEq),
    (">=", TokenKind::GreaterEq),
    ("->", TokenKind::Arrow),
    ("+=", TokenKind::AddAssign),
    ("-=", TokenKind::SubAssign),
    ("*=", TokenKind::MulAssign),
    ("/=", TokenKind::DivAssign),
    ("++", TokenKind::Inc),
    ("--", TokenKind::Dec),
    ("%=", TokenKind::ModAssign),
    ("&=", TokenKind::AndAssign),
    ("|=", TokenKind::OrAssign),
    ("^=", TokenKind::XorAssign),
    ("&&", TokenKind::AndAnd),
    ("||", TokenKind::OrOr),
    ("<<", TokenKind::Shl),
    (">>", TokenKind::Shr),
    ("##", TokenKind::HashHash),
    ("!", TokenKind::Bang),
    ("#", TokenKind::Hash),
    ("%", TokenKind::Percent),
    ("&", TokenKind::Amp),
    ("(", TokenKind::LParen),
    (")", TokenKind::RParen),
    ("*", TokenKind::Star),
    ("+", TokenKind::Plus),
    (",", TokenKind::Comma),
    ("-", TokenKind::Minus),
    (".", TokenKind::Dot),
    ("/", TokenKind::Slash),
    (":", TokenKind::Colon),
    (";", TokenKind::Semicolon),
    ("<", TokenKind::Less),
    ("=", TokenKind::Assign),
    (">", TokenKind::Greater),
    ("?", TokenKind::Question),
    ("[", TokenKind::LBracket),
    ("]", TokenKind::RBracket),
    ("^", TokenKind::Caret),
    ("{", TokenKind::LBrace),
    ("|", TokenKind::Pipe),
    ("}", TokenKind::RBrace),
    ("~", TokenKind::Tilde),
];

/// Tokenize `source`, returning the token stream terminated by an EOF token.
pub fn tokenize(sess: &mut Session, filename: &str, source: &[u8]) -> Result<Vec<Token>> {
    let file = sess.interner.intern(filename);
    let normalized = normalize(source);
    let mut lexer = Lexer {
        sess,
        src: &normalized,
        pos: 0,
        line: 1,
        file,
        at_bol: true,
        has_space: false,
    };
    let mut tokens = lexer.run()?;
    refine_numbers(sess, &mut tokens)?;
    concat_string_literals(sess, &mut tokens);
    debug!(file = filename, count = tokens.len(), "tokenized");
    Ok(tokens)
}

/// Source normalization: BOM, newlines, line splices, universal characters.
fn normalize(src: &[u8]) -> Vec<u8> {
    let src = src.strip_prefix(&[0xEF, 0xBB, 0xBF][..]).unwrap_or(src);
    let mut out = Vec::with_capacity(src.len());
    let mut removed_newlines = 0usize;
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            b'\r' => {
                out.push(b'\n');
                i += if src.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
            }
            b'\\' if src.get(i + 1) == Some(&b'\n') => {
                removed_newlines += 1;
                i += 2;
            }
            b'\\' if src.get(i + 1) == Some(&b'\r') => {
                removed_newlines += 1;
                i += if src.get(i + 2) == Some(&b'\n') { 3 } else { 2 };
            }
            b'\\' if matches!(src.get(i + 1), Some(b'\\')) => {
                out.extend_from_slice(&src[i..i + 2]);
                i += 2;
            }
            b'\\' if matches!(src.get(i + 1), Some(b'u') | Some(b'U')) => {
                let digits = if src[i + 1] == b'u' { 4 } else { 8 };
                match read_universal_char(&src[i + 2..], digits) {
                    Some(cp) => {
                        let mut buf = [0u8; 4];
                        out.extend_from_slice(char::from_u32(cp).unwrap_or('\u{FFFD}').encode_utf8(&mut buf).as_bytes());
                        i += 2 + digits;
                    }
                    None => {
                        out.push(src[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out.extend(std::iter::repeat(b'\n').take(removed_newlines));
    out
}

fn read_universal_char(src: &[u8], digits: usize) -> Option<u32> {
    if src.len() < digits {
        return None;
    }
    let mut cp = 0u32;
    for &b in &src[..digits] {
        cp = cp.checked_mul(16)? + (b as char).to_digit(16)?;
    }
    Some(cp)
}

struct Lexer<'a, 's> {
    sess: &'s mut Session,
    src: &'a [u8],
    pos: usize,
    line: u32,
    file: Sym,
    at_bol: bool,
    has_space: bool,
}

impl<'a, 's> Lexer<'a, 's> {
    fn loc(&self) -> SourceLoc {
        SourceLoc::new(self.file, self.line)
    }

    fn err(&self, msg: impl Into<String>) -> FrontError {
        FrontError::Lex(self.sess.whereis(self.loc()), msg.into())
    }

    fn peek(&self, ahead: usize) -> u8 {
        self.src.get(self.pos + ahead).copied().unwrap_or(0)
    }

    fn starts_with(&self, s: &str) -> bool {
        self.src[self.pos..].starts_with(s.as_bytes())
    }

    fn bump_line(&mut self, byte: u8) {
        if byte == b'\n' {
            self.line += 1;
        }
    }

    fn run(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while self.pos < self.src.len() {
            let c = self.src[self.pos];

            // Line comment.
            if self.starts_with("//") {
                while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                    self.pos += 1;
                }
                self.has_space = true;
                continue;
            }
            // Block comment.
            if self.starts_with("/*") {
                let start = self.loc();
                self.pos += 2;
                loop {
                    if self.pos >= self.src.len() {
                        return Err(FrontError::Lex(
                            self.sess.whereis(start),
                            "unterminated block comment".into(),
                        ));
                    }
                    if self.starts_with("*/") {
                        self.pos += 2;
                        break;
                    }
                    self.bump_line(self.src[self.pos]);
                    self.pos += 1;
                }
                self.has_space = true;
                continue;
            }
            // Whitespace.
            if c == b'\n' {
                self.pos += 1;
                self.line += 1;
                self.at_bol = true;
                self.has_space = false;
                continue;
            }
            if c.is_ascii_whitespace() {
                self.pos += 1;
                self.has_space = true;
                continue;
            }

            // Preprocessing number.
            if c.is_ascii_digit() || (c == b'.' && self.peek(1).is_ascii_digit()) {
                let tok = self.read_pp_number();
                tokens.push(tok);
                continue;
            }

            // String literal, with optional width prefix.
            if let Some((kind, prefix_len)) = self.string_prefix() {
                let tok = self.read_string_literal(kind, prefix_len)?;
                tokens.push(tok);
                continue;
            }

            // Character literal, with optional width prefix.
            if let Some((ty, prefix_len)) = self.char_prefix() {
                let tok = self.read_char_literal(ty, prefix_len)?;
                tokens.push(tok);
                continue;
            }

            // Keyword or identifier.
            if is_ident_start(self.decode_char()) {
                let tok = self.read_ident();
                tokens.push(tok);
                continue;
            }

            // Punctuator, longest match.
            if let Some(tok) = self.read_punctuator() {
                tokens.push(tok);
                continue;
            }

            return Err(self.err(format!("invalid character '{}'", c as char)));
        }

        tokens.push(self.make_token(TokenKind::Eof, self.pos, self.pos));
        Ok(tokens)
    }

    fn make_token(&mut self, kind: TokenKind, start: usize, end: usize) -> Token {
        let text = std::str::from_utf8(&self.src[start..end]).unwrap_or("");
        let text = self.sess.interner.intern(text);
        let mut flags = TokenFlags::empty();
        if self.at_bol {
            flags |= TokenFlags::BOL;
        }
        if self.has_space {
            flags |= TokenFlags::SPACE;
        }
        self.at_bol = false;
        self.has_space = false;
        Token {
            kind,
            flags,
            loc: self.loc(),
            text,
            value: TokenValue::None,
        }
    }

    fn read_pp_number(&mut self) -> Token {
        let start = self.pos;
        self.pos += 1;
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            let prev = self.src[self.pos - 1];
            // Exponent signs bind to the number only after e/E/p/P.
            if matches!(c, b'+' | b'-') && matches!(prev, b'e' | b'E' | b'p' | b'P') {
                self.pos += 1;
            } else if c.is_ascii_alphanumeric() || c == b'.' || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.make_token(TokenKind::PpNum, start, self.pos)
    }

    fn string_prefix(&self) -> Option<(StrKind, usize)> {
        if self.starts_with("u8\"") {
            Some((StrKind::Narrow, 2))
        } else if self.starts_with("u\"") {
            Some((StrKind::Utf16, 1))
        } else if self.starts_with("L\"") {
            Some((StrKind::Utf16, 1))
        } else if self.starts_with("U\"") {
            Some((StrKind::Utf32, 1))
        } else if self.peek(0) == b'"' {
            Some((StrKind::Narrow, 0))
        } else {
            None
        }
    }

    fn char_prefix(&self) -> Option<(TypeId, usize)> {
        if self.starts_with("u'") {
            Some((TypeTable::USHORT, 1))
        } else if self.starts_with("L'") || self.starts_with("U'") {
            Some((TypeTable::UINT, 1))
        } else if self.peek(0) == b'\'' {
            Some((TypeTable::INT, 0))
        } else {
            None
        }
    }

    /// Scan the raw body of a quoted literal, returning the byte range
    /// between the quotes with escapes left in place.
    fn scan_quoted(&mut self, quote: u8) -> Result<(usize, usize)> {
        debug_assert_eq!(self.src[self.pos], quote);
        let start_loc = self.loc();
        self.pos += 1;
        let body_start = self.pos;
        loop {
            if self.pos >= self.src.len() || self.src[self.pos] == b'\n' {
                let what = if quote == b'"' { "string" } else { "character" };
                return Err(FrontError::Lex(
                    self.sess.whereis(start_loc),
                    format!("unterminated {what} literal"),
                ));
            }
            let c = self.src[self.pos];
            if c == quote {
                break;
            }
            if c == b'\\' {
                self.pos += 1;
                if self.pos >= self.src.len() {
                    continue;
                }
            }
            self.pos += 1;
        }
        let body_end = self.pos;
        self.pos += 1;
        Ok((body_start, body_end))
    }

    fn read_string_literal(&mut self, kind: StrKind, prefix_len: usize) -> Result<Token> {
        let tok_start = self.pos;
        self.pos += prefix_len;
        let (body_start, body_end) = self.scan_quoted(b'"')?;
        let tok_end = self.pos;

        // Decode escapes into code points, then encode per element width.
        let body = self.src[body_start..body_end].to_vec();
        let mut bytes = Vec::new();
        let mut i = 0;
        while i < body.len() {
            if body[i] == b'\\' {
                let (cp, next) = decode_escape(&body, i + 1).map_err(|msg| self.err(msg))?;
                // Escapes name raw element values, not code points.
                match kind {
                    StrKind::Narrow => bytes.push(cp as u8),
                    StrKind::Utf16 => bytes.extend_from_slice(&(cp as u16).to_le_bytes()),
                    StrKind::Utf32 => bytes.extend_from_slice(&cp.to_le_bytes()),
                }
                i = next;
            } else {
                let (cp, len) = decode_utf8(&body[i..]);
                encode_elem(&mut bytes, cp, kind);
                i += len;
            }
        }
        // Terminating element.
        bytes.extend(std::iter::repeat(0u8).take(kind.elem_size()));

        let elem = kind.elem_type();
        let len = (bytes.len() / kind.elem_size()) as i32;
        let ty = self.sess.types.array_of(elem, len);
        let mut tok = self.make_token(TokenKind::Str, tok_start, tok_end);
        tok.value = TokenValue::Str { bytes, ty };
        Ok(tok)
    }

    fn read_char_literal(&mut self, ty: TypeId, prefix_len: usize) -> Result<Token> {
        let tok_start = self.pos;
        self.pos += prefix_len;
        let (body_start, body_end) = self.scan_quoted(b'\'')?;
        let tok_end = self.pos;
        let body = self.src[body_start..body_end].to_vec();
        if body.is_empty() {
            return Err(self.err("empty character literal"));
        }
        let (cp, _) = if body[0] == b'\\' {
            decode_escape(&body, 1).map_err(|msg| self.err(msg))?
        } else {
            let (cp, len) = decode_utf8(&body);
            (cp, len)
        };
        let value = if ty == TypeTable::INT {
            // Plain char constants are sign-extended chars.
            cp as u8 as i8 as i64
        } else {
            i64::from(cp)
        };
        let mut tok = self.make_token(TokenKind::Num, tok_start, tok_end);
        tok.value = TokenValue::Int { value, ty };
        Ok(tok)
    }

    /// Decode the UTF-8 code point at the cursor (for identifier checks).
    fn decode_char(&self) -> u32 {
        decode_utf8(&self.src[self.pos..]).0
    }

    fn read_ident(&mut self) -> Token {
        let start = self.pos;
        loop {
            let (cp, len) = decode_utf8(&self.src[self.pos..]);
            if len == 0 || !is_ident_continue(cp) {
                break;
            }
            self.pos += len;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        let kind = KEYWORDS
            .iter()
            .find(|(kw, _)| *kw == text)
            .map(|&(_, k)| k)
            .unwrap_or(TokenKind::Ident);
        self.make_token(kind, start, self.pos)
    }

    fn read_punctuator(&mut self) -> Option<Token> {
        for &(text, kind) in PUNCTUATORS {
            if self.starts_with(text) {
                let start = self.pos;
                self.pos += text.len();
                return Some(self.make_token(kind, start, self.pos));
            }
        }
        None
    }
}

/// Decode one simple/hex/octal escape starting after the backslash.
/// Returns the code point and the index just past the escape.
fn decode_escape(body: &[u8], mut i: usize) -> core::result::Result<(u32, usize), String> {
    let c = *body.get(i).ok_or_else(|| "stray backslash".to_string())?;
    i += 1;
    let cp = match c {
        b'a' => 0x07,
        b'b' => 0x08,
        b'f' => 0x0C,
        b'n' => b'\n' as u32,
        b'r' => b'\r' as u32,
        b't' => b'\t' as u32,
        b'v' => 0x0B,
        b'e' => 0x1B, // GNU extension
        b'\\' | b'\'' | b'"' | b'?' => c as u32,
        b'x' => {
            let mut v: u32 = 0;
            let mut any = false;
            while let Some(d) = body.get(i).and_then(|&b| (b as char).to_digit(16)) {
                v = v.wrapping_mul(16).wrapping_add(d);
                i += 1;
                any = true;
            }
            if !any {
                return Err("invalid hex escape sequence".into());
            }
            v
        }
        b'0'..=b'7' => {
            let mut v = u32::from(c - b'0');
            for _ in 0..2 {
                match body.get(i) {
                    Some(&b @ b'0'..=b'7') => {
                        v = v * 8 + u32::from(b - b'0');
                        i += 1;
                    }
                    _ => break,
                }
            }
            v
        }
        _ => return Err(format!("invalid escape sequence '\\{}'", c as char)),
    };
    Ok((cp, i))
}

/// Decode one UTF-8 code point; returns (code point, byte length).
fn decode_utf8(bytes: &[u8]) -> (u32, usize) {
    let Some(&b0) = bytes.first() else {
        return (0, 0);
    };
    if b0 < 0x80 {
        return (u32::from(b0), 1);
    }
    let (len, init) = match b0 {
        0xC0..=0xDF => (2, u32::from(b0 & 0x1F)),
        0xE0..=0xEF => (3, u32::from(b0 & 0x0F)),
        0xF0..=0xF7 => (4, u32::from(b0 & 0x07)),
        _ => return (u32::from(b0), 1),
    };
    if bytes.len() < len {
        return (u32::from(b0), 1);
    }
    let mut cp = init;
    for &b in &bytes[1..len] {
        cp = (cp << 6) | u32::from(b & 0x3F);
    }
    (cp, len)
}

/// Encode `cp` into `out` in the literal's element width. UTF-16 uses
/// surrogate pairs for non-BMP code points.
fn encode_elem(out: &mut Vec<u8>, cp: u32, kind: StrKind) {
    match kind {
        StrKind::Narrow => {
            if cp < 0x80 {
                out.push(cp as u8);
            } else if let Some(ch) = char::from_u32(cp) {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            } else {
                out.push(cp as u8);
            }
        }
        StrKind::Utf16 => {
            if cp < 0x10000 {
                out.extend_from_slice(&(cp as u16).to_le_bytes());
            } else {
                let v = cp - 0x10000;
                let hi = 0xD800 + (v >> 10) as u16;
                let lo = 0xDC00 + (v & 0x3FF) as u16;
                out.extend_from_slice(&hi.to_le_bytes());
                out.extend_from_slice(&lo.to_le_bytes());
            }
        }
        StrKind::Utf32 => out.extend_from_slice(&cp.to_le_bytes()),
    }
}

fn is_ident_start(cp: u32) -> bool {
    matches!(cp, 0x41..=0x5A | 0x61..=0x7A) || cp == b'_' as u32 || cp == b'$' as u32 || cp >= 0x80
}

fn is_ident_continue(cp: u32) -> bool {
    is_ident_start(cp) || matches!(cp, 0x30..=0x39)
}

/// Second pass: classify every preprocessing number as an integer or a
/// floating literal and attach the decoded value and resolved type.
fn refine_numbers(sess: &mut Session, tokens: &mut [Token]) -> Result<()> {
    for tok in tokens.iter_mut() {
        if tok.kind != TokenKind::PpNum {
            continue;
        }
        let text = sess.interner.resolve(tok.text).to_owned();
        match refine_one(&text) {
            Some(value) => {
                tok.kind = TokenKind::Num;
                tok.value = value;
            }
            None => {
                return Err(FrontError::Lex(
                    sess.whereis(tok.loc),
                    format!("invalid numeric literal '{text}'"),
                ));
            }
        }
    }
    Ok(())
}

fn refine_one(text: &str) -> Option<TokenValue> {
    if let Some(v) = refine_integer(text) {
        return Some(v);
    }
    refine_float(text)
}

fn refine_integer(text: &str) -> Option<TokenValue> {
    let lower = text.to_ascii_lowercase();
    let (digits, base) = if let Some(rest) = lower.strip_prefix("0x") {
        (rest, 16)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (rest, 2)
    } else if lower.starts_with('0') && lower.len() > 1 {
        (&lower[1..], 8)
    } else {
        (lower.as_str(), 10)
    };

    // Split off the U/L/LL suffix.
    let mut end = digits.len();
    while end > 0 {
        let c = digits.as_bytes()[end - 1];
        if c == b'u' || c == b'l' {
            end -= 1;
        } else {
            break;
        }
    }
    let (num, suffix) = digits.split_at(end);
    if num.is_empty() && base != 8 {
        return None;
    }
    let num = if num.is_empty() { "0" } else { num };

    let is_unsigned_sfx = suffix.contains('u');
    let l_count = suffix.bytes().filter(|&b| b == b'l').count();
    if suffix.bytes().filter(|&b| b == b'u').count() > 1 || l_count > 2 {
        return None;
    }

    let value = u64::from_str_radix(num, base).ok()?;

    // LLP64: `long` is 32-bit, so only the `ll` suffix forces 64 bits.
    let wide_sfx = l_count == 2;
    let ty = match (is_unsigned_sfx, wide_sfx, base) {
        (true, true, _) => TypeTable::ULONG,
        (true, false, _) => {
            if value <= u64::from(u32::MAX) {
                TypeTable::UINT
            } else {
                TypeTable::ULONG
            }
        }
        (false, true, _) => {
            if base != 10 && value > i64::MAX as u64 {
                TypeTable::ULONG
            } else {
                TypeTable::LONG
            }
        }
        (false, false, 10) => {
            if value <= i32::MAX as u64 {
                TypeTable::INT
            } else {
                TypeTable::LONG
            }
        }
        (false, false, _) => {
            // Non-decimal constants may go unsigned before widening.
            if value <= i32::MAX as u64 {
                TypeTable::INT
            } else if value <= u64::from(u32::MAX) {
                TypeTable::UINT
            } else if value <= i64::MAX as u64 {
                TypeTable::LONG
            } else {
                TypeTable::ULONG
            }
        }
    };
    Some(TokenValue::Int {
        value: value as i64,
        ty,
    })
}

fn refine_float(text: &str) -> Option<TokenValue> {
    let lower = text.to_ascii_lowercase();
    if !lower.contains('.') && !lower.contains('e') {
        return None;
    }
    let (num, ty) = if let Some(rest) = lower.strip_suffix('f') {
        (rest, TypeTable::FLOAT)
    } else if let Some(rest) = lower.strip_suffix('l') {
        (rest, TypeTable::DOUBLE)
    } else {
        (lower.as_str(), TypeTable::DOUBLE)
    };
    let value: f64 = num.parse().ok()?;
    Some(TokenValue::Float { value, ty })
}

/// Terminal pass: merge adjacent string literals of the same element width.
fn concat_string_literals(sess: &mut Session, tokens: &mut Vec<Token>) {
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    for tok in tokens.drain(..) {
        let merged = match (out.last_mut(), &tok) {
            (
                Some(Token {
                    kind: TokenKind::Str,
                    value: TokenValue::Str { bytes, ty },
                    ..
                }),
                Token {
                    kind: TokenKind::Str,
                    value: TokenValue::Str {
                        bytes: next_bytes,
                        ty: next_ty,
                    },
                    ..
                },
            ) => {
                let elem = sess.types.get(*ty).base.expect("string type is an array");
                let next_elem = sess
                    .types
                    .get(*next_ty)
                    .base
                    .expect("string type is an array");
                if elem == next_elem {
                    let width = sess.types.size_of(elem).unsigned_abs() as usize;
                    // Drop the previous terminator and splice.
                    bytes.truncate(bytes.len() - width);
                    bytes.extend_from_slice(next_bytes);
                    let len = (bytes.len() / width) as i32;
                    *ty = sess.types.array_of(elem, len);
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if !merged {
            out.push(tok);
        }
    }
    *tokens = core::mem::take(&mut out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn lex(src: &str) -> (Session, Vec<Token>) {
        let mut sess = Session::new();
        let toks = tokenize(&mut sess, "test.c", src.as_bytes()).expect("lex ok");
        (sess, toks)
    }

    #[test]
    fn kinds_and_locations_are_monotonic() {
        let (_, toks) = lex("int main() {\n  return 42;\n}\n");
        let kinds: Vec<_> = toks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Int,
                TokenKind::Ident,
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::LBrace,
                TokenKind::Return,
                TokenKind::Num,
                TokenKind::Semicolon,
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
        let mut last = 0;
        for t in &toks {
            assert!(t.loc.line >= last);
            last = t.loc.line;
        }
    }

    #[rstest]
    #[case("0", 0, TypeTable::INT)]
    #[case("2147483647", i64::from(i32::MAX), TypeTable::INT)]
    #[case("2147483648", 2147483648, TypeTable::LONG)]
    #[case("0x80000000", 0x8000_0000, TypeTable::UINT)]
    #[case("42u", 42, TypeTable::UINT)]
    #[case("42ll", 42, TypeTable::LONG)]
    #[case("42ull", 42, TypeTable::ULONG)]
    #[case("0b101", 5, TypeTable::INT)]
    #[case("017", 0o17, TypeTable::INT)]
    fn integer_refinement(#[case] src: &str, #[case] value: i64, #[case] ty: TypeId) {
        let (_, toks) = lex(src);
        assert_eq!(toks[0].kind, TokenKind::Num);
        assert_eq!(toks[0].value, TokenValue::Int { value, ty });
    }

    #[rstest]
    #[case("1.5", 1.5, TypeTable::DOUBLE)]
    #[case("1e2", 100.0, TypeTable::DOUBLE)]
    #[case("2.5f", 2.5, TypeTable::FLOAT)]
    fn float_refinement(#[case] src: &str, #[case] value: f64, #[case] ty: TypeId) {
        let (_, toks) = lex(src);
        assert_eq!(toks[0].value, TokenValue::Float { value, ty });
    }

    #[test]
    fn string_concatenation_merges_same_width() {
        let (sess, toks) = lex(r#""foo" "bar""#);
        assert_eq!(toks[0].kind, TokenKind::Str);
        assert_eq!(toks[1].kind, TokenKind::Eof);
        match &toks[0].value {
            TokenValue::Str { bytes, ty } => {
                assert_eq!(bytes.as_slice(), b"foobar\0");
                assert_eq!(sess.types.get(*ty).array_len, 7);
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn escapes_and_line_splices() {
        let (_, toks) = lex("\"a\\nb\\x41\"\n1 \\\n+ 2\n");
        match &toks[0].value {
            TokenValue::Str { bytes, .. } => assert_eq!(bytes.as_slice(), b"a\nbA\0"),
            other => panic!("unexpected value {other:?}"),
        }
        // The continuation joined `1 + 2` onto one logical line.
        assert_eq!(toks[1].loc.line, 2);
        assert_eq!(toks[2].loc.line, 2);
        assert_eq!(toks[3].loc.line, 2);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut sess = Session::new();
        let err = tokenize(&mut sess, "bad.c", b"\"abc").unwrap_err();
        assert!(matches!(err, FrontError::Lex(_, _)));
    }

    #[test]
    fn char_literals() {
        let (_, toks) = lex("'a' '\\n' u'x'");
        assert_eq!(
            toks[0].value,
            TokenValue::Int {
                value: 97,
                ty: TypeTable::INT
            }
        );
        assert_eq!(
            toks[1].value,
            TokenValue::Int {
                value: 10,
                ty: TypeTable::INT
            }
        );
        assert_eq!(
            toks[2].value,
            TokenValue::Int {
                value: 120,
                ty: TypeTable::USHORT
            }
        );
    }
}
