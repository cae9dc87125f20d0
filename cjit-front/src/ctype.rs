//! C type representation.
//!
//! Every type built during a compilation lives in the [`TypeTable`] and is
//! referred to by a stable [`TypeId`]. Types are immutable once built; a
//! declaration that needs to tweak one (alignment, completion of an array
//! length) copies it first, keeping an origin link used by compatibility
//! checks. The target model is LLP64 Windows x64: `long` is 32 bits,
//! `long long` and pointers are 64 bits.

use bitflags::bitflags;

use crate::intern::Sym;

/// Stable id of a type in the [`TypeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(u32);

impl TypeId {
    /// Raw table index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Kind tag of a C type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// `void`
    Void,
    /// `_Bool`
    Bool,
    /// `char`
    Char,
    /// `short`
    Short,
    /// `int`
    Int,
    /// `long long` (64-bit under LLP64)
    Long,
    /// `float`
    Float,
    /// `double`
    Double,
    /// `enum`
    Enum,
    /// Pointer.
    Ptr,
    /// Function.
    Func,
    /// Array.
    Array,
    /// `struct`
    Struct,
    /// `union`
    Union,
}

bitflags! {
    /// Qualifier-ish flags carried on a type record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u8 {
        /// Unsigned integer type.
        const UNSIGNED = 1 << 0;
        /// `_Atomic`-qualified (parsed, not lowered specially).
        const ATOMIC = 1 << 1;
        /// Struct ends with a flexible array member.
        const FLEXIBLE = 1 << 2;
        /// `__attribute__((packed))` struct.
        const PACKED = 1 << 3;
        /// Variadic function.
        const VARIADIC = 1 << 4;
    }
}

/// One struct or union member.
#[derive(Debug, Clone)]
pub struct Member {
    /// Member name; `None` for anonymous struct/union members.
    pub name: Option<Sym>,
    /// Member type.
    pub ty: TypeId,
    /// Index used by `getelementptr` when addressing the member.
    pub index: u32,
    /// Alignment applied during layout.
    pub align: u32,
    /// Byte offset from the start of the aggregate.
    pub offset: u32,
    /// Bit offset within the storage unit (bitfields only).
    pub bit_offset: u32,
    /// Bit width (bitfields only).
    pub bit_width: u32,
    /// Whether the member is a bitfield.
    pub is_bitfield: bool,
}

/// A C type record.
#[derive(Debug, Clone)]
pub struct Type {
    /// Kind tag.
    pub kind: TypeKind,
    /// Size in bytes; negative for incomplete types.
    pub size: i32,
    /// Alignment in bytes.
    pub align: u32,
    /// Flags.
    pub flags: TypeFlags,
    /// Pointee / element type for pointers and arrays.
    pub base: Option<TypeId>,
    /// Element count for arrays; negative if not yet known.
    pub array_len: i32,
    /// Return type for functions.
    pub ret: Option<TypeId>,
    /// Parameter types for functions.
    pub params: Vec<TypeId>,
    /// Members for structs and unions.
    pub members: Vec<Member>,
    /// The type this one was copied from, chased by compatibility checks.
    pub origin: Option<TypeId>,
    /// Declared tag or typedef name, for diagnostics.
    pub name: Option<Sym>,
}

impl Type {
    fn basic(kind: TypeKind, size: i32, align: u32, flags: TypeFlags) -> Self {
        Self {
            kind,
            size,
            align,
            flags,
            base: None,
            array_len: 0,
            ret: None,
            params: Vec::new(),
            members: Vec::new(),
            origin: None,
            name: None,
        }
    }

    /// Whether this is an integer type (enums and `_Bool` included).
    pub fn is_integer(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Bool
                | TypeKind::Char
                | TypeKind::Short
                | TypeKind::Int
                | TypeKind::Long
                | TypeKind::Enum
        )
    }

    /// Whether this is `float` or `double`.
    pub fn is_float(&self) -> bool {
        matches!(self.kind, TypeKind::Float | TypeKind::Double)
    }

    /// Integer or floating.
    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    /// Whether the unsigned flag is set.
    pub fn is_unsigned(&self) -> bool {
        self.flags.contains(TypeFlags::UNSIGNED)
    }

    /// Pointer or array (pointer-decayed contexts look at `base`).
    pub fn has_base(&self) -> bool {
        self.base.is_some() && matches!(self.kind, TypeKind::Ptr | TypeKind::Array)
    }

    /// Struct or union.
    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, TypeKind::Struct | TypeKind::Union)
    }
}

/// Round `n` up to a multiple of `align` (power of two).
pub fn align_to(n: i32, align: i32) -> i32 {
    debug_assert!(align > 0 && (align & (align - 1)) == 0);
    (n + align - 1) & !(align - 1)
}

/// Id-keyed table of every type in a compilation.
#[derive(Debug)]
pub struct TypeTable {
    types: Vec<Type>,
}

impl TypeTable {
    /// `void`
    pub const VOID: TypeId = TypeId(0);
    /// `_Bool`
    pub const BOOL: TypeId = TypeId(1);
    /// `char`
    pub const CHAR: TypeId = TypeId(2);
    /// `unsigned char`
    pub const UCHAR: TypeId = TypeId(3);
    /// `short`
    pub const SHORT: TypeId = TypeId(4);
    /// `unsigned short`
    pub const USHORT: TypeId = TypeId(5);
    /// `int`
    pub const INT: TypeId = TypeId(6);
    /// `unsigned int`
    pub const UINT: TypeId = TypeId(7);
    /// `long long`
    pub const LONG: TypeId = TypeId(8);
    /// `unsigned long long`
    pub const ULONG: TypeId = TypeId(9);
    /// `float`
    pub const FLOAT: TypeId = TypeId(10);
    /// `double`
    pub const DOUBLE: TypeId = TypeId(11);

    /// Table with the primitive types pre-seeded at fixed ids.
    pub fn new() -> Self {
        use TypeFlags as F;
        use TypeKind as K;
        let u = F::UNSIGNED;
        let types = vec![
            Type::basic(K::Void, 1, 1, F::empty()),
            Type::basic(K::Bool, 1, 1, u),
            Type::basic(K::Char, 1, 1, F::empty()),
            Type::basic(K::Char, 1, 1, u),
            Type::basic(K::Short, 2, 2, F::empty()),
            Type::basic(K::Short, 2, 2, u),
            Type::basic(K::Int, 4, 4, F::empty()),
            Type::basic(K::Int, 4, 4, u),
            Type::basic(K::Long, 8, 8, F::empty()),
            Type::basic(K::Long, 8, 8, u),
            Type::basic(K::Float, 4, 4, F::empty()),
            Type::basic(K::Double, 8, 8, F::empty()),
        ];
        Self { types }
    }

    /// Insert a new type record.
    pub fn alloc(&mut self, ty: Type) -> TypeId {
        let id = TypeId(u32::try_from(self.types.len()).expect("type table overflow"));
        self.types.push(ty);
        id
    }

    /// Immutable access.
    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.index()]
    }

    /// Mutable access; used only while a declaration is being completed.
    pub fn get_mut(&mut self, id: TypeId) -> &mut Type {
        &mut self.types[id.index()]
    }

    /// Kind of `id`.
    pub fn kind(&self, id: TypeId) -> TypeKind {
        self.get(id).kind
    }

    /// Size of `id` in bytes; negative while incomplete.
    pub fn size_of(&self, id: TypeId) -> i32 {
        self.get(id).size
    }

    /// Alignment of `id` in bytes.
    pub fn align_of(&self, id: TypeId) -> u32 {
        self.get(id).align
    }

    /// Clone `id` into a fresh record whose origin points back at `id`.
    pub fn copy(&mut self, id: TypeId) -> TypeId {
        let mut ty = self.get(id).clone();
        ty.origin = Some(id);
        self.alloc(ty)
    }

    /// Pointer to `base`.
    pub fn pointer_to(&mut self, base: TypeId) -> TypeId {
        let mut ty = Type::basic(TypeKind::Ptr, 8, 8, TypeFlags::UNSIGNED);
        ty.base = Some(base);
        self.alloc(ty)
    }

    /// Array of `len` elements of `base`; `len < 0` leaves the size open.
    pub fn array_of(&mut self, base: TypeId, len: i32) -> TypeId {
        let elem_size = self.size_of(base);
        let align = self.align_of(base);
        let size = if len < 0 { -1 } else { elem_size * len };
        let mut ty = Type::basic(TypeKind::Array, size, align, TypeFlags::empty());
        ty.base = Some(base);
        ty.array_len = len;
        self.alloc(ty)
    }

    /// Function type.
    pub fn func(&mut self, ret: TypeId, params: Vec<TypeId>, variadic: bool) -> TypeId {
        let flags = if variadic {
            TypeFlags::VARIADIC
        } else {
            TypeFlags::empty()
        };
        let mut ty = Type::basic(TypeKind::Func, 1, 1, flags);
        ty.ret = Some(ret);
        ty.params = params;
        self.alloc(ty)
    }

    /// Fresh `enum` type (int-sized).
    pub fn enum_type(&mut self) -> TypeId {
        self.alloc(Type::basic(TypeKind::Enum, 4, 4, TypeFlags::empty()))
    }

    /// Fresh incomplete struct or union.
    pub fn incomplete_record(&mut self, kind: TypeKind) -> TypeId {
        debug_assert!(matches!(kind, TypeKind::Struct | TypeKind::Union));
        self.alloc(Type::basic(kind, -1, 1, TypeFlags::empty()))
    }

    /// Integer conversion rank stand-in: byte size, with `_Bool` below `char`.
    fn rank(&self, id: TypeId) -> i32 {
        let t = self.get(id);
        match t.kind {
            TypeKind::Bool => 0,
            _ => t.size,
        }
    }

    /// Integer promotion: everything of rank below `int` promotes to `int`.
    pub fn promote(&self, id: TypeId) -> TypeId {
        let t = self.get(id);
        if t.is_integer() && self.rank(id) < self.size_of(Self::INT) {
            Self::INT
        } else if t.kind == TypeKind::Enum {
            Self::INT
        } else {
            id
        }
    }

    /// Usual arithmetic conversions: the common type of two numeric operands.
    pub fn common_type(&mut self, a: TypeId, b: TypeId) -> TypeId {
        let ta = self.get(a);
        if ta.has_base() {
            let base = ta.base.expect("pointer-like type without base");
            return self.pointer_to(base);
        }
        if self.kind(a) == TypeKind::Func {
            return self.pointer_to(a);
        }
        if self.kind(b) == TypeKind::Func {
            return self.pointer_to(b);
        }

        if self.kind(a) == TypeKind::Double || self.kind(b) == TypeKind::Double {
            return Self::DOUBLE;
        }
        if self.kind(a) == TypeKind::Float || self.kind(b) == TypeKind::Float {
            return Self::FLOAT;
        }

        let a = self.promote(a);
        let b = self.promote(b);
        let (sa, sb) = (self.size_of(a), self.size_of(b));
        if sa != sb {
            return if sa < sb { b } else { a };
        }
        // Same rank: unsigned wins a sign mismatch.
        if self.get(b).is_unsigned() {
            b
        } else {
            a
        }
    }

    /// Structural compatibility with origin-type chasing.
    pub fn is_compatible(&self, a: TypeId, b: TypeId) -> bool {
        if a == b {
            return true;
        }
        if let Some(origin) = self.get(a).origin {
            return self.is_compatible(origin, b);
        }
        if let Some(origin) = self.get(b).origin {
            return self.is_compatible(a, origin);
        }
        let (ta, tb) = (self.get(a), self.get(b));
        if ta.kind != tb.kind {
            return false;
        }
        match ta.kind {
            TypeKind::Void => true,
            TypeKind::Bool
            | TypeKind::Char
            | TypeKind::Short
            | TypeKind::Int
            | TypeKind::Long
            | TypeKind::Enum => ta.is_unsigned() == tb.is_unsigned(),
            TypeKind::Float | TypeKind::Double => true,
            TypeKind::Ptr => match (ta.base, tb.base) {
                (Some(x), Some(y)) => self.is_compatible(x, y),
                _ => false,
            },
            TypeKind::Array => {
                let elems_ok = match (ta.base, tb.base) {
                    (Some(x), Some(y)) => self.is_compatible(x, y),
                    _ => false,
                };
                elems_ok && (ta.array_len < 0 || tb.array_len < 0 || ta.array_len == tb.array_len)
            }
            TypeKind::Func => {
                let ret_ok = match (ta.ret, tb.ret) {
                    (Some(x), Some(y)) => self.is_compatible(x, y),
                    _ => false,
                };
                ret_ok
                    && ta.flags.contains(TypeFlags::VARIADIC)
                        == tb.flags.contains(TypeFlags::VARIADIC)
                    && ta.params.len() == tb.params.len()
                    && ta
                        .params
                        .iter()
                        .zip(tb.params.iter())
                        .all(|(&x, &y)| self.is_compatible(x, y))
            }
            // Distinct record definitions are distinct types.
            TypeKind::Struct | TypeKind::Union => false,
        }
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usual_arithmetic_conversions() {
        let mut tt = TypeTable::new();
        assert_eq!(
            tt.common_type(TypeTable::CHAR, TypeTable::SHORT),
            TypeTable::INT
        );
        assert_eq!(
            tt.common_type(TypeTable::INT, TypeTable::UINT),
            TypeTable::UINT
        );
        assert_eq!(
            tt.common_type(TypeTable::UINT, TypeTable::LONG),
            TypeTable::LONG
        );
        assert_eq!(
            tt.common_type(TypeTable::INT, TypeTable::DOUBLE),
            TypeTable::DOUBLE
        );
        assert_eq!(
            tt.common_type(TypeTable::FLOAT, TypeTable::LONG),
            TypeTable::FLOAT
        );
    }

    #[test]
    fn compatibility_chases_origin() {
        let mut tt = TypeTable::new();
        let copy = tt.copy(TypeTable::INT);
        assert!(tt.is_compatible(copy, TypeTable::INT));
        assert!(!tt.is_compatible(copy, TypeTable::UINT));

        let p_int = tt.pointer_to(TypeTable::INT);
        let p_int2 = tt.pointer_to(TypeTable::INT);
        assert!(tt.is_compatible(p_int, p_int2));
    }

    #[test]
    fn incomplete_array_completes() {
        let mut tt = TypeTable::new();
        let open = tt.array_of(TypeTable::INT, -1);
        assert!(tt.size_of(open) < 0);
        let closed = tt.array_of(TypeTable::INT, 3);
        assert_eq!(tt.size_of(closed), 12);
        assert!(tt.is_compatible(open, closed));
    }
}
