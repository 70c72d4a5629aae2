use std::fmt::{
    self,
    Display,
};

use anyhow::bail;

/// Storage type of a column. Integers are signed and fixed width.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub enum FieldType {
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Text,
    Blob,
}

impl FieldType {
    /// Whether values of this type have a fixed encoded width.
    pub fn is_fixed_size(&self) -> bool {
        !matches!(self, FieldType::Text | FieldType::Blob)
    }
}

/// A single column value. `Null` is only valid in columns that are not
/// declared `not_null`.
///
/// Equality and ordering are total: floats compare with `total_cmp`, so `NaN`
/// equals itself and `-0.0 < 0.0`. See `sorting.rs`.
#[derive(Clone, Debug)]
pub enum Field {
    Null,
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Field {
    /// `None` for `Null`, which fits any nullable column.
    pub fn field_type(&self) -> Option<FieldType> {
        let ty = match self {
            Field::Null => return None,
            Field::SmallInt(_) => FieldType::SmallInt,
            Field::Int(_) => FieldType::Int,
            Field::BigInt(_) => FieldType::BigInt,
            Field::Float(_) => FieldType::Float,
            Field::Double(_) => FieldType::Double,
            Field::Text(_) => FieldType::Text,
            Field::Blob(_) => FieldType::Blob,
        };
        Some(ty)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Field::Null)
    }

    /// Widen any integer column to `i64`.
    pub fn as_i64(&self) -> anyhow::Result<i64> {
        match self {
            Field::SmallInt(v) => Ok(i64::from(*v)),
            Field::Int(v) => Ok(i64::from(*v)),
            Field::BigInt(v) => Ok(*v),
            _ => bail!("Expected an integer field, found {self:?}"),
        }
    }

    pub fn as_f64(&self) -> anyhow::Result<f64> {
        match self {
            Field::Float(v) => Ok(f64::from(*v)),
            Field::Double(v) => Ok(*v),
            _ => bail!("Expected a floating point field, found {self:?}"),
        }
    }

    pub fn as_str(&self) -> anyhow::Result<&str> {
        match self {
            Field::Text(s) => Ok(s),
            _ => bail!("Expected a text field, found {self:?}"),
        }
    }

    pub fn as_bytes(&self) -> anyhow::Result<&[u8]> {
        match self {
            Field::Blob(b) => Ok(b),
            _ => bail!("Expected a blob field, found {self:?}"),
        }
    }
}

impl Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Null => write!(f, "null"),
            Field::SmallInt(v) => write!(f, "{v}"),
            Field::Int(v) => write!(f, "{v}"),
            Field::BigInt(v) => write!(f, "{v}"),
            Field::Float(v) => write!(f, "{v}"),
            Field::Double(v) => write!(f, "{v}"),
            Field::Text(s) => write!(f, "{s:?}"),
            Field::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i16> for Field {
    fn from(v: i16) -> Self {
        Field::SmallInt(v)
    }
}

impl From<i32> for Field {
    fn from(v: i32) -> Self {
        Field::Int(v)
    }
}

impl From<i64> for Field {
    fn from(v: i64) -> Self {
        Field::BigInt(v)
    }
}

impl From<f32> for Field {
    fn from(v: f32) -> Self {
        Field::Float(v)
    }
}

impl From<f64> for Field {
    fn from(v: f64) -> Self {
        Field::Double(v)
    }
}

impl From<String> for Field {
    fn from(v: String) -> Self {
        Field::Text(v)
    }
}

impl From<&str> for Field {
    fn from(v: &str) -> Self {
        Field::Text(v.to_owned())
    }
}

impl From<Vec<u8>> for Field {
    fn from(v: Vec<u8>) -> Self {
        Field::Blob(v)
    }
}

#[cfg(any(test, feature = "testing"))]
mod arbitrary_impls {
    use proptest::prelude::*;

    use super::Field;

    impl Arbitrary for Field {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            prop_oneof![
                Just(Field::Null),
                any::<i16>().prop_map(Field::SmallInt),
                any::<i32>().prop_map(Field::Int),
                any::<i64>().prop_map(Field::BigInt),
                any::<f32>().prop_map(Field::Float),
                any::<f64>().prop_map(Field::Double),
                ".{0,8}".prop_map(Field::Text),
                prop::collection::vec(any::<u8>(), 0..8).prop_map(Field::Blob),
            ]
            .boxed()
        }
    }
}
