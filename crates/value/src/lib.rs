//! Values stored by the transactional client: typed fields, rows, table
//! schemas and secondary-index keys.
mod field;
mod index_key;
mod schema;
pub mod sorting;
mod tuple;

use errors::ErrorMetadata;

pub use crate::{
    field::{
        Field,
        FieldType,
    },
    index_key::IndexKey,
    schema::{
        FieldDescriptor,
        FieldId,
        Schema,
        TableType,
    },
    tuple::Tuple,
};

pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Names reserved for the client's own bookkeeping tables start with this.
pub const SYSTEM_TABLE_PREFIX: &str = "__";

/// Check a table, field or index name.
pub fn check_valid_name(s: &str) -> anyhow::Result<()> {
    if s.len() > MAX_IDENTIFIER_LEN {
        anyhow::bail!(ErrorMetadata::bad_request(
            "InvalidName",
            format!(
                "Name is too long ({} > maximum {}).",
                s.len(),
                MAX_IDENTIFIER_LEN
            ),
        ));
    }
    if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        anyhow::bail!(ErrorMetadata::bad_request(
            "InvalidName",
            format!("Name {s:?} can only contain alphanumeric characters or underscores."),
        ));
    }
    if !s.chars().any(|c| c.is_ascii_alphanumeric()) {
        anyhow::bail!(ErrorMetadata::bad_request(
            "InvalidName",
            format!("Name {s:?} must have at least one alphanumeric character."),
        ));
    }
    Ok(())
}

pub fn is_system_table(name: &str) -> bool {
    name.starts_with(SYSTEM_TABLE_PREFIX)
}

#[cfg(test)]
mod tests {
    use crate::{
        check_valid_name,
        is_system_table,
    };

    #[test]
    fn test_names() {
        assert!(check_valid_name("accounts").is_ok());
        assert!(check_valid_name("__transactions_12").is_ok());
        assert!(check_valid_name("__").is_err());
        assert!(check_valid_name("has space").is_err());
        assert!(check_valid_name(&"a".repeat(65)).is_err());
        assert!(is_system_table("__clients"));
        assert!(!is_system_table("_clients"));
    }
}
