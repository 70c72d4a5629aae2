use std::fmt;

use crate::{
    sorting::{
        bytes_to_fields,
        fields_to_bytes,
    },
    Field,
};

/// Key of an entry in a secondary index: the sort keys of the indexed columns,
/// concatenated. Byte order is index order, and a key that is a prefix of
/// another sorts first.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey(Vec<u8>);

impl IndexKey {
    pub fn new(fields: &[Field]) -> Self {
        Self(fields_to_bytes(fields))
    }

    /// The smallest key; a scan starting here covers the whole index.
    pub fn min() -> Self {
        Self(vec![])
    }

    /// Wrap bytes read back from storage, rejecting anything that is not a
    /// valid field sequence.
    pub fn from_bytes(bytes: Vec<u8>) -> anyhow::Result<Self> {
        bytes_to_fields(&bytes)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn fields(&self) -> Vec<Field> {
        bytes_to_fields(&self.0).expect("IndexKey holds a valid encoding")
    }
}

impl From<Vec<Field>> for IndexKey {
    fn from(fields: Vec<Field>) -> Self {
        Self::new(&fields)
    }
}

impl fmt::Debug for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IndexKey").field(&self.fields()).finish()
    }
}

#[cfg(any(test, feature = "testing"))]
impl proptest::arbitrary::Arbitrary for IndexKey {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Self>;

    fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
        use proptest::prelude::*;
        prop::collection::vec(any::<Field>(), 0..3)
            .prop_map(IndexKey::from)
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::{
        Field,
        IndexKey,
    };

    #[test]
    fn test_prefix_sorts_first() {
        let short = IndexKey::new(&[Field::from("b")]);
        let long = IndexKey::new(&[Field::from("b"), Field::BigInt(i64::MIN)]);
        assert!(IndexKey::min() < short);
        assert!(short < long);
        assert!(long < IndexKey::new(&[Field::from("ba")]));
        assert!(IndexKey::from_bytes(vec![0xFF]).is_err());
    }

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_index_key_order_matches_fields(
            l in prop::collection::vec(any::<Field>(), 1..3),
            r in prop::collection::vec(any::<Field>(), 1..3),
        ) {
            prop_assert_eq!(IndexKey::new(&l).cmp(&IndexKey::new(&r)), l.cmp(&r));
        }
    }
}
