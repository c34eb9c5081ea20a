//! Aliasing legality.
//!
//! A relaxed subset of the strict-aliasing rules: unknown types never
//! conflict, types with different roots never conflict, and types sharing a
//! root are legal only if one resolves to the exact position of the other
//! inside the shared aggregate.

use crate::descriptor::{Descriptor, TypeRef};

/// Whether an access typed `a` may alias memory holding `b`.
///
/// `None` means "type unknown".
#[must_use]
pub fn is_aliasing_legal(a: Option<TypeRef>, b: Option<TypeRef>) -> bool {
    let (Some(a), Some(b)) = (a, b) else {
        return true;
    };
    if a == b {
        return true;
    }
    if a.root() != b.root() {
        return true;
    }
    is_aliasing_legal_up(a, b) || is_aliasing_legal_up(b, a)
}

/// Walk down from `a` through the members covering its offset, looking for
/// `b` at the same position.
///
/// One member-access wrapper is peeled off each side first, turning it into
/// (base aggregate, offset). The walk is directional; callers wanting the
/// full relation check both orders.
#[must_use]
pub fn is_aliasing_legal_up(a: TypeRef, b: TypeRef) -> bool {
    let (mut td, mut offset_a) = peel_member(a);
    let (target, offset_b) = peel_member(b);

    loop {
        if td == target {
            return offset_a == offset_b;
        }
        let Descriptor::Struct(s) = td.kind() else {
            return false;
        };
        let Some(field) = s.member_at(offset_a) else {
            return false;
        };
        let Some(rest) = offset_a.checked_sub(field.offset) else {
            return false;
        };
        offset_a = rest;
        td = field.ty;
    }
}

fn peel_member(td: TypeRef) -> (TypeRef, usize) {
    match td.kind() {
        Descriptor::Member(m) => (m.base, m.offset),
        Descriptor::Struct(_) => (td, 0),
    }
}
