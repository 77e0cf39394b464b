//! B-tree key: `(objectid, type, offset)`, lexicographically ordered,
//! with the `noOffset` prefix form used for `(objectid, type)` range
//! scans.

use super::structs::BtrfsKeyRaw;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub objectid: u64,
    pub ty: u8,
    pub offset: u64,
}

impl Key {
    pub const fn new(objectid: u64, ty: u8, offset: u64) -> Self {
        Self {
            objectid,
            ty,
            offset,
        }
    }

    /// `(objectid, type, 0)` — used as a search prefix when the caller
    /// wants to iterate every item sharing an `(objectid, type)` pair.
    pub const fn no_offset(&self) -> Self {
        Self {
            objectid: self.objectid,
            ty: self.ty,
            offset: 0,
        }
    }

    /// True if `self` and `other` share `(objectid, type)`, ignoring
    /// `offset`. Equivalent to `self.no_offset() == other.no_offset()`.
    pub const fn same_prefix(&self, other: &Key) -> bool {
        self.objectid == other.objectid && self.ty == other.ty
    }
}

impl From<BtrfsKeyRaw> for Key {
    fn from(raw: BtrfsKeyRaw) -> Self {
        Key::new(raw.objectid.get(), raw.ty, raw.offset.get())
    }
}
