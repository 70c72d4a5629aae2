use std::collections::BTreeMap;

use anyhow::Context;
use errors::ErrorMetadata;

use crate::{
    check_valid_name,
    Field,
    FieldType,
};

pub type FieldId = u16;

/// Whether writes to a table go through snapshot isolation. Counter rows live
/// in non-transactional tables so that every client sees the latest value.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TableType {
    #[default]
    Transactional,
    NonTransactional,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub not_null: bool,
}

/// Column layout of a table plus the secondary indexes declared on it. A
/// `Schema` is immutable once the table is created; tuples share it through
/// an `Arc`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schema {
    table_type: TableType,
    fields: Vec<FieldDescriptor>,
    indexes: BTreeMap<String, Vec<FieldId>>,
}

impl Schema {
    pub fn new(table_type: TableType) -> Self {
        Self {
            table_type,
            ..Default::default()
        }
    }

    pub fn table_type(&self) -> TableType {
        self.table_type
    }

    /// Append a column. Field ids are assigned in declaration order.
    pub fn add_field(
        &mut self,
        field_type: FieldType,
        name: impl Into<String>,
        not_null: bool,
    ) -> anyhow::Result<FieldId> {
        let name = name.into();
        check_valid_name(&name)?;
        if self.id_of(&name).is_some() {
            anyhow::bail!(ErrorMetadata::bad_request(
                "DuplicateFieldName",
                format!("Field {name:?} is declared twice"),
            ));
        }
        let id = FieldId::try_from(self.fields.len()).context("Too many fields")?;
        self.fields.push(FieldDescriptor {
            name,
            field_type,
            not_null,
        });
        Ok(id)
    }

    /// Declare a secondary index over `fields`, in key order.
    pub fn add_index(
        &mut self,
        name: impl Into<String>,
        fields: Vec<FieldId>,
    ) -> anyhow::Result<()> {
        let name = name.into();
        check_valid_name(&name)?;
        anyhow::ensure!(!fields.is_empty(), "Index {name:?} has no fields");
        for id in &fields {
            anyhow::ensure!(
                usize::from(*id) < self.fields.len(),
                "Index {name:?} refers to unknown field {id}"
            );
        }
        if self.indexes.contains_key(&name) {
            anyhow::bail!(ErrorMetadata::bad_request(
                "DuplicateIndexName",
                format!("Index {name:?} is declared twice"),
            ));
        }
        self.indexes.insert(name, fields);
        Ok(())
    }

    pub fn id_of(&self, name: &str) -> Option<FieldId> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as FieldId)
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldDescriptor> {
        self.fields.get(usize::from(id))
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn indexes(&self) -> &BTreeMap<String, Vec<FieldId>> {
        &self.indexes
    }

    /// Check `value` against the declaration of column `id`.
    pub fn check_field(&self, id: FieldId, value: &Field) -> anyhow::Result<()> {
        let descriptor = self
            .field(id)
            .with_context(|| format!("Unknown field id {id}"))?;
        match value.field_type() {
            None if descriptor.not_null => anyhow::bail!(ErrorMetadata::bad_request(
                "FieldNotSet",
                format!("Field {:?} may not be null", descriptor.name),
            )),
            None => Ok(()),
            Some(ty) if ty != descriptor.field_type => {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "WrongFieldType",
                    format!(
                        "Field {:?} has type {}, not {ty}",
                        descriptor.name, descriptor.field_type
                    ),
                ))
            },
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use crate::{
        Field,
        FieldType,
        Schema,
        TableType,
    };

    #[test]
    fn test_schema_declarations() -> anyhow::Result<()> {
        let mut schema = Schema::new(TableType::Transactional);
        let balance = schema.add_field(FieldType::BigInt, "balance", true)?;
        let owner = schema.add_field(FieldType::Text, "owner", false)?;
        assert_eq!((balance, owner), (0, 1));
        assert_eq!(schema.id_of("owner"), Some(1));

        let err = schema.add_field(FieldType::Int, "owner", false).unwrap_err();
        assert_eq!(err.short_msg(), "DuplicateFieldName");

        schema.add_index("by_owner", vec![owner, balance])?;
        assert!(schema.add_index("by_nothing", vec![7]).is_err());
        assert!(schema.add_index("by_owner", vec![owner]).unwrap_err().is_bad_request());

        schema.check_field(owner, &Field::Null)?;
        assert_eq!(
            schema.check_field(balance, &Field::Null).unwrap_err().short_msg(),
            "FieldNotSet"
        );
        assert_eq!(
            schema.check_field(balance, &Field::Int(1)).unwrap_err().short_msg(),
            "WrongFieldType"
        );
        Ok(())
    }
}
