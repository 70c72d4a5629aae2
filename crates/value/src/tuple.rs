use std::{
    fmt,
    sync::Arc,
};

use anyhow::Context;

use crate::{
    Field,
    FieldId,
    IndexKey,
    Schema,
};

/// One row of a table: a value per declared column, addressed by id or name
/// through the table's schema. Clones are independent values.
#[derive(Clone)]
pub struct Tuple {
    schema: Arc<Schema>,
    fields: Vec<Field>,
}

impl Tuple {
    /// A row with every column set to `Null`.
    pub fn new(schema: Arc<Schema>) -> Self {
        let fields = vec![Field::Null; schema.fields().len()];
        Self { schema, fields }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn get(&self, id: FieldId) -> Option<&Field> {
        self.fields.get(usize::from(id))
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Field> {
        self.get(self.schema.id_of(name)?)
    }

    pub fn set(&mut self, id: FieldId, value: impl Into<Field>) -> anyhow::Result<()> {
        let value = value.into();
        self.schema.check_field(id, &value)?;
        self.fields[usize::from(id)] = value;
        Ok(())
    }

    pub fn set_by_name(&mut self, name: &str, value: impl Into<Field>) -> anyhow::Result<()> {
        let id = self
            .schema
            .id_of(name)
            .with_context(|| format!("Unknown field {name:?}"))?;
        self.set(id, value)
    }

    /// Builder form of `set_by_name`.
    pub fn with(mut self, name: &str, value: impl Into<Field>) -> anyhow::Result<Self> {
        self.set_by_name(name, value)?;
        Ok(self)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Key of this row in an index declared over `columns`.
    pub fn index_key(&self, columns: &[FieldId]) -> IndexKey {
        let fields: Vec<Field> = columns
            .iter()
            .map(|id| self.get(*id).cloned().unwrap_or(Field::Null))
            .collect();
        IndexKey::new(&fields)
    }
}

// Only the values take part in comparisons; two rows read through different
// handles on the same table are equal if their columns match.
impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for Tuple {}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (descriptor, value) in self.schema.fields().iter().zip(&self.fields) {
            map.entry(&descriptor.name, value);
        }
        map.finish()
    }
}
