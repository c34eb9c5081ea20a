//! Type descriptor model.
//!
//! Descriptors are emitted by the instrumenting compiler as read-only data and
//! live for the whole process. Two shapes exist:
//!
//! - **struct**: an ordered list of `(child, byte offset)` members followed by
//!   a NUL-terminated name. Scalars are structs with no members.
//! - **member**: a field access `access` at `offset` inside `base`.
//!
//! The C layout is a tagged union with the struct members and name
//! tail-allocated:
//!
//! ```text
//! struct  : [tag=2][count][child0][off0]...[childN][offN][name bytes..\0]
//! member  : [tag=1][base][access][offset]
//! ```
//!
//! [`TypeRef`] is a lightweight handle compared by identity; [`TypeRef::kind`]
//! exposes the two shapes as [`Descriptor`] so every consumer matches them
//! exhaustively. [`DescriptorArena`] builds descriptors with exactly the
//! compiler's layout for embedders and tests.

use std::borrow::Cow;
use std::ffi::{CStr, c_char};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;

use parking_lot::{Mutex, const_mutex};

use crate::error::DescriptorError;
use crate::symbolizer::Symbolizer;

/// Tag of a member-access descriptor.
pub const MEMBER_TAG: usize = 1;
/// Tag of a struct (or scalar) descriptor.
pub const STRUCT_TAG: usize = 2;

const TYPEINFO_PREFIX: &str = "typeinfo name for ";
const ANONYMOUS_NAME: &str = "<anonymous type>";
const UNKNOWN_NAME: &str = "<unknown type>";

/// Common header of every descriptor. Opaque beyond its tag.
#[repr(C)]
pub struct RawTypeDescriptor {
    tag: usize,
}

#[repr(C)]
struct RawMember {
    tag: usize,
    base: *const RawTypeDescriptor,
    access: *const RawTypeDescriptor,
    offset: usize,
}

#[repr(C)]
struct RawStructHeader {
    tag: usize,
    member_count: usize,
}

#[repr(C)]
struct RawField {
    ty: *const RawTypeDescriptor,
    offset: usize,
}

/// Identity handle to an immutable, process-lifetime type descriptor.
#[derive(Clone, Copy)]
pub struct TypeRef(NonNull<RawTypeDescriptor>);

// SAFETY: descriptors are immutable and never freed, so sharing the handle
// across threads cannot observe a write or a dangling pointer.
unsafe impl Send for TypeRef {}
// SAFETY: see `Send`.
unsafe impl Sync for TypeRef {}

impl PartialEq for TypeRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for TypeRef {}

impl Hash for TypeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeRef({:p})", self.0)
    }
}

/// A member of a struct descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub ty: TypeRef,
    pub offset: usize,
}

/// Struct-shaped view of a descriptor.
#[derive(Clone, Copy)]
pub struct StructType {
    fields: &'static [RawField],
    name: &'static CStr,
}

impl StructType {
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn field(&self, index: usize) -> Option<Field> {
        self.fields.get(index).map(field_of)
    }

    pub fn fields(&self) -> impl ExactSizeIterator<Item = Field> + '_ {
        self.fields.iter().map(field_of)
    }

    /// The last member whose offset is `<= offset`, or the first member when
    /// every member starts after `offset`. `None` for member-less structs.
    #[must_use]
    pub fn member_at(&self, offset: usize) -> Option<Field> {
        let idx = self.fields.partition_point(|f| f.offset <= offset);
        self.field(idx.saturating_sub(1))
    }

    /// The raw stored name; empty for anonymous types. Invalid UTF-8 is
    /// replaced, not dropped.
    #[must_use]
    pub fn raw_name(&self) -> Cow<'static, str> {
        self.name.to_string_lossy()
    }
}

fn field_of(raw: &RawField) -> Field {
    Field {
        // SAFETY: well-formed struct descriptors never carry null children.
        ty: TypeRef(unsafe { NonNull::new_unchecked(raw.ty.cast_mut()) }),
        offset: raw.offset,
    }
}

/// Member-access view of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberType {
    /// The enclosing aggregate.
    pub base: TypeRef,
    /// The type of the accessed field.
    pub access: TypeRef,
    /// Offset of the field inside `base`.
    pub offset: usize,
}

/// The two descriptor shapes.
#[derive(Clone, Copy)]
pub enum Descriptor {
    Struct(StructType),
    Member(MemberType),
}

impl TypeRef {
    /// Wrap a compiler-emitted descriptor pointer. Null means "unknown type".
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must point to a well-formed descriptor that stays
    /// valid and unmodified for the rest of the process.
    #[inline]
    #[must_use]
    pub unsafe fn from_raw(ptr: *const RawTypeDescriptor) -> Option<Self> {
        NonNull::new(ptr.cast_mut()).map(Self)
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(self) -> *const RawTypeDescriptor {
        self.0.as_ptr()
    }

    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Decode the descriptor shape.
    #[must_use]
    pub fn kind(self) -> Descriptor {
        let ptr = self.0.as_ptr();
        // SAFETY: `from_raw`/arena contract: the header is readable forever.
        let tag = unsafe { (*ptr).tag };
        debug_assert!(tag == MEMBER_TAG || tag == STRUCT_TAG, "bad descriptor tag {tag}");
        if tag == MEMBER_TAG {
            // SAFETY: member tag implies the member layout.
            let raw = unsafe { &*ptr.cast::<RawMember>() };
            // SAFETY: well-formed member descriptors have non-null links.
            let (base, access) = unsafe {
                (
                    NonNull::new_unchecked(raw.base.cast_mut()),
                    NonNull::new_unchecked(raw.access.cast_mut()),
                )
            };
            Descriptor::Member(MemberType {
                base: TypeRef(base),
                access: TypeRef(access),
                offset: raw.offset,
            })
        } else {
            let header = ptr.cast::<RawStructHeader>();
            // SAFETY: struct tag implies the struct layout: `member_count`
            // fields follow the header and the name follows the fields.
            unsafe {
                let count = (*header).member_count;
                let first = header.add(1).cast::<RawField>();
                let fields = std::slice::from_raw_parts(first, count);
                let name = CStr::from_ptr(first.add(count).cast::<c_char>());
                Descriptor::Struct(StructType { fields, name })
            }
        }
    }

    /// Follow first members (structs) and accessed fields (members) until a
    /// descriptor with nothing further to unwrap is reached.
    #[must_use]
    pub fn root(self) -> TypeRef {
        let mut td = self;
        loop {
            let next = match td.kind() {
                Descriptor::Struct(s) => s.field(0).map(|f| f.ty),
                Descriptor::Member(m) => Some(m.access),
            };
            match next {
                Some(child) => td = child,
                None => return td,
            }
        }
    }

    /// Human-readable type name, e.g. `float (in Point at offset 4)`.
    #[must_use]
    pub fn display_name(self, symbolizer: &dyn Symbolizer) -> String {
        let mut out = String::new();
        let _ = write_type_name(&mut out, Some(self), symbolizer);
        out
    }
}

/// Write the display name of `td` (or `<unknown type>` for `None`).
pub fn write_type_name(
    out: &mut dyn fmt::Write,
    td: Option<TypeRef>,
    symbolizer: &dyn Symbolizer,
) -> fmt::Result {
    let Some(td) = td else {
        return out.write_str(UNKNOWN_NAME);
    };
    match td.kind() {
        Descriptor::Member(m) => {
            write_type_name(out, Some(m.access), symbolizer)?;
            if m.access != m.base {
                out.write_str(" (in ")?;
                write_type_name(out, Some(m.base), symbolizer)?;
                write!(out, " at offset {})", m.offset)?;
            }
            Ok(())
        }
        Descriptor::Struct(s) => {
            let name = s.raw_name();
            if name.is_empty() {
                return out.write_str(ANONYMOUS_NAME);
            }
            let demangled = symbolizer.demangle(&name);
            out.write_str(demangled.strip_prefix(TYPEINFO_PREFIX).unwrap_or(&demangled))
        }
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Words per arena chunk.
const CHUNK_WORDS: usize = 4096;

struct ArenaState {
    cursor: *mut usize,
    remaining: usize,
}

// SAFETY: the cursor points into leaked chunks only ever touched under the
// arena mutex.
unsafe impl Send for ArenaState {}

/// Bump arena producing descriptors in the compiler's C layout.
///
/// Memory is never returned: descriptors live for the rest of the process, so
/// every [`TypeRef`] handed out stays valid even after the arena is dropped.
pub struct DescriptorArena {
    state: Mutex<ArenaState>,
}

impl Default for DescriptorArena {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorArena {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: const_mutex(ArenaState {
                cursor: std::ptr::null_mut(),
                remaining: 0,
            }),
        }
    }

    /// A scalar type: a struct descriptor with no members.
    pub fn scalar(&self, name: &str) -> Result<TypeRef, DescriptorError> {
        self.structure(name, &[])
    }

    /// A struct descriptor. Member offsets must be non-decreasing.
    pub fn structure(
        &self,
        name: &str,
        members: &[(TypeRef, usize)],
    ) -> Result<TypeRef, DescriptorError> {
        if name.as_bytes().contains(&0) {
            return Err(DescriptorError::NulInName);
        }
        for (index, pair) in members.windows(2).enumerate() {
            if pair[1].1 < pair[0].1 {
                return Err(DescriptorError::UnorderedMembers {
                    index: index + 1,
                    offset: pair[1].1,
                    previous: pair[0].1,
                });
            }
        }

        let name_words = (name.len() + 1).div_ceil(size_of::<usize>());
        let words = self.alloc_words(2 + 2 * members.len() + name_words);
        // SAFETY: `words` is a fresh zeroed run of the requested length.
        unsafe {
            words.write(STRUCT_TAG);
            words.add(1).write(members.len());
            for (i, (ty, offset)) in members.iter().enumerate() {
                words.add(2 + 2 * i).write(ty.addr());
                words.add(3 + 2 * i).write(*offset);
            }
            let name_dst = words.add(2 + 2 * members.len()).cast::<u8>();
            std::ptr::copy_nonoverlapping(name.as_ptr(), name_dst, name.len());
        }
        Ok(self.handle(words))
    }

    /// A member-access descriptor: `access` at `offset` inside `base`.
    #[must_use]
    pub fn member(&self, base: TypeRef, access: TypeRef, offset: usize) -> TypeRef {
        let words = self.alloc_words(4);
        // SAFETY: `words` is a fresh run of four words.
        unsafe {
            words.write(MEMBER_TAG);
            words.add(1).write(base.addr());
            words.add(2).write(access.addr());
            words.add(3).write(offset);
        }
        self.handle(words)
    }

    fn handle(&self, words: *mut usize) -> TypeRef {
        // SAFETY: arena allocations are never null.
        TypeRef(unsafe { NonNull::new_unchecked(words.cast::<RawTypeDescriptor>()) })
    }

    fn alloc_words(&self, n: usize) -> *mut usize {
        let mut state = self.state.lock();
        if n > state.remaining {
            let chunk = Box::leak(vec![0usize; n.max(CHUNK_WORDS)].into_boxed_slice());
            state.remaining = chunk.len();
            state.cursor = chunk.as_mut_ptr();
        }
        let out = state.cursor;
        // SAFETY: `n <= remaining`, so the cursor stays inside the chunk.
        state.cursor = unsafe { state.cursor.add(n) };
        state.remaining -= n;
        out
    }
}
