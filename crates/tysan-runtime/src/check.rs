//! The per-access check hook.

use std::fmt;

use crate::descriptor::TypeRef;
use crate::legality::is_aliasing_legal;
use crate::shadow::{INTERIOR, ShadowMemory, Slot};

/// Direction of an instrumented access, decoded from the ABI flag word
/// (bit 0 = read, bit 1 = write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    AtomicUpdate,
}

impl AccessKind {
    pub const READ_FLAG: i32 = 1;
    pub const WRITE_FLAG: i32 = 2;

    /// Read-only and write-only map to themselves; anything else (both bits
    /// or neither) is an atomic update.
    #[must_use]
    pub const fn from_flags(flags: i32) -> Self {
        let read = flags & Self::READ_FLAG != 0;
        let write = flags & Self::WRITE_FLAG != 0;
        match (read, write) {
            (true, false) => Self::Read,
            (false, true) => Self::Write,
            _ => Self::AtomicUpdate,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::AtomicUpdate => "ATOMIC UPDATE",
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an illegal access overlaps the stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// The access starts exactly at the stored object.
    ExistingObject,
    /// The access starts inside the stored object.
    PartOfObject,
    /// A later byte of the access lands on a different object.
    PartialAccess,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 3] = [
        ViolationKind::ExistingObject,
        ViolationKind::PartOfObject,
        ViolationKind::PartialAccess,
    ];

    /// Report text of this kind.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::ExistingObject => "accesses an existing object",
            Self::PartOfObject => "accesses part of an existing object",
            Self::PartialAccess => "partially accesses an object",
        }
    }

    /// Short identifier used in structured output and summaries.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::ExistingObject => "existing-object",
            Self::PartOfObject => "part-of-object",
            Self::PartialAccess => "partial-access",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::ExistingObject => 0,
            Self::PartOfObject => 1,
            Self::PartialAccess => 2,
        }
    }
}

/// One instrumented access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub addr: usize,
    pub size: usize,
    /// Type of the access; `None` when the compiler had no descriptor.
    pub ty: Option<TypeRef>,
    pub kind: AccessKind,
}

/// A detected aliasing violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub access: Access,
    /// The type recorded in shadow memory.
    pub stored: Option<TypeRef>,
    /// Negative: bytes back to the start of the stored object
    /// ([`ViolationKind::PartOfObject`]). Positive: byte index inside the
    /// access ([`ViolationKind::PartialAccess`]). Zero otherwise.
    pub offset: isize,
}

/// Check `access` against the shadow and pass every violation to `sink`.
///
/// Returns the number of violations reported. The shadow is only read.
pub fn check_access(
    shadow: &ShadowMemory,
    access: &Access,
    mut sink: impl FnMut(Violation),
) -> usize {
    let incoming = access.ty;
    let first = shadow.raw_slot(access.addr);

    if first == INTERIOR {
        let mut addr = access.addr;
        let mut offset: isize = 0;
        let mut word = first;
        while word == INTERIOR {
            addr = addr.wrapping_sub(1);
            offset -= 1;
            word = shadow.raw_slot(addr);
        }
        let stored = Slot::from_raw(word).descriptor();
        if is_aliasing_legal(incoming, stored) {
            return 0;
        }
        sink(Violation {
            kind: ViolationKind::PartOfObject,
            access: *access,
            stored,
            offset,
        });
        return 1;
    }

    let stored = Slot::from_raw(first).descriptor();
    if !is_aliasing_legal(incoming, stored) {
        sink(Violation {
            kind: ViolationKind::ExistingObject,
            access: *access,
            stored,
            offset: 0,
        });
        return 1;
    }

    let mut reported = 0;
    for i in 0..access.size {
        let word = shadow.raw_slot(access.addr.wrapping_add(i));
        if word == INTERIOR {
            continue;
        }
        let stored = Slot::from_raw(word).descriptor();
        if !is_aliasing_legal(incoming, stored) {
            sink(Violation {
                kind: ViolationKind::PartialAccess,
                access: *access,
                stored,
                offset: i as isize,
            });
            reported += 1;
        }
    }
    reported
}
