use std::{
    collections::BTreeSet,
    sync::Arc,
};

use value::Schema;

/// Remote-assigned id of a table. Stable for the lifetime of the store.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct TableId(u64);

impl TableId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Primary key of a row within a table.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct Key(u64);

impl Key {
    pub const fn new(key: u64) -> Self {
        Self(key)
    }
}

/// Version stamped on every write by the transaction that made it.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
pub struct Version(u64);

impl Version {
    pub const MIN: Version = Version(0);

    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn succ(self) -> Self {
        Self(self.0 + 1)
    }
}

/// A transaction's read/write window. Writes made under a snapshot carry its
/// `version()`. A committed version is readable if it is at most
/// `base_version` or was committed above it before the snapshot was issued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    version: Version,
    base_version: Version,
    committed_above_base: Arc<BTreeSet<Version>>,
}

impl Snapshot {
    pub fn new(
        version: Version,
        base_version: Version,
        committed_above_base: BTreeSet<Version>,
    ) -> Self {
        Self {
            version,
            base_version,
            committed_above_base: Arc::new(committed_above_base),
        }
    }

    /// The version this transaction writes at.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn base_version(&self) -> Version {
        self.base_version
    }

    /// Whether a write made at `version` is part of this snapshot. A
    /// transaction always sees its own writes.
    pub fn is_visible(&self, version: Version) -> bool {
        version == self.version
            || version <= self.base_version
            || self.committed_above_base.contains(&version)
    }
}

/// Name, id and schema of a table as published to every transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableMetadata {
    pub id: TableId,
    pub name: String,
    pub schema: Arc<Schema>,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{
        Snapshot,
        Version,
    };

    #[test]
    fn test_snapshot_visibility() {
        let committed: BTreeSet<_> = [Version::new(7)].into_iter().collect();
        let snapshot = Snapshot::new(Version::new(9), Version::new(5), committed);
        assert!(snapshot.is_visible(Version::new(3)));
        assert!(snapshot.is_visible(Version::new(5)));
        assert!(!snapshot.is_visible(Version::new(6)));
        assert!(snapshot.is_visible(Version::new(7)));
        assert!(!snapshot.is_visible(Version::new(8)));
        assert!(snapshot.is_visible(Version::new(9)));
        assert!(!snapshot.is_visible(Version::new(10)));
    }
}
