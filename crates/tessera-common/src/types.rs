//! Core identifiers for the blockstore
//!
//! Objects are addressed by `(inode, stripe)`. Every mutation carries a
//! version, so the pair `(object, version)` names one write in the history
//! of an object.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Identifier of a stored object
///
/// Ordered by inode first, then stripe. An inode of zero never names a real
/// object; on-disk slots holding it are empty.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{inode:x}:{stripe:x}")]
pub struct ObjectId {
    /// Inode number (zero means "no object")
    pub inode: u64,
    /// Stripe offset within the inode
    pub stripe: u64,
}

impl ObjectId {
    /// Create an object id
    #[must_use]
    pub const fn new(inode: u64, stripe: u64) -> Self {
        Self { inode, stripe }
    }

    /// Whether this id names a real object
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.inode != 0
    }

    /// Serialize into the 16-byte on-disk form
    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.inode.to_le_bytes());
        out[8..].copy_from_slice(&self.stripe.to_le_bytes());
        out
    }
}

/// One version of one object
///
/// Ordering is `(oid, version)`, which keeps all versions of an object
/// adjacent and ascending in ordered maps.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{oid} v{version}")]
pub struct ObjVerId {
    /// Object
    pub oid: ObjectId,
    /// Version of the object
    pub version: u64,
}

impl ObjVerId {
    /// Create an object/version pair
    #[must_use]
    pub const fn new(oid: ObjectId, version: u64) -> Self {
        Self { oid, version }
    }

    /// The lowest possible key for `oid`
    #[must_use]
    pub const fn first_of(oid: ObjectId) -> Self {
        Self { oid, version: 0 }
    }

    /// The highest possible key for `oid`
    #[must_use]
    pub const fn last_of(oid: ObjectId) -> Self {
        Self {
            oid,
            version: u64::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_object_id_display() {
        let oid = ObjectId::new(0x1f, 0x20000);
        assert_eq!(oid.to_string(), "1f:20000");
        assert_eq!(ObjVerId::new(oid, 7).to_string(), "1f:20000 v7");
    }

    #[test]
    fn test_versions_are_adjacent_per_object() {
        let a = ObjectId::new(1, 0);
        let b = ObjectId::new(1, 1);
        let mut map = BTreeMap::new();
        map.insert(ObjVerId::new(b, 1), ());
        map.insert(ObjVerId::new(a, 3), ());
        map.insert(ObjVerId::new(a, 1), ());

        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(
            keys,
            vec![ObjVerId::new(a, 1), ObjVerId::new(a, 3), ObjVerId::new(b, 1)]
        );

        let run: Vec<_> = map
            .range(ObjVerId::first_of(a)..=ObjVerId::last_of(a))
            .map(|(k, _)| k.version)
            .collect();
        assert_eq!(run, vec![1, 3]);
    }

    #[test]
    fn test_zero_inode_is_empty() {
        assert!(!ObjectId::default().is_valid());
        assert!(ObjectId::new(1, 0).is_valid());
    }

    #[test]
    fn test_object_id_bytes() {
        let bytes = ObjectId::new(2, 3).to_le_bytes();
        assert_eq!(u64::from_le_bytes(bytes[..8].try_into().unwrap()), 2);
        assert_eq!(u64::from_le_bytes(bytes[8..].try_into().unwrap()), 3);
    }
}
