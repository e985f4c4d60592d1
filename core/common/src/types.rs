//! Common types used throughout the offline engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a caller-supplied entity table name.
pub const MAX_TABLE_NAME_LEN: usize = 48;

/// Name of an entity-mirror table.
///
/// Table names are spliced into SQL statements, so they are restricted to
/// ASCII letters, digits and underscores, and must start with a letter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    /// Create a new TableName from a string.
    ///
    /// # Preconditions
    /// - `name` must be non-empty and at most [`MAX_TABLE_NAME_LEN`] bytes
    /// - `name` must match `[A-Za-z][A-Za-z0-9_]*`
    ///
    /// # Errors
    /// - Returns `InvalidInput` if any precondition is violated
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Table name cannot be empty".to_string(),
            ));
        }
        if name.len() > MAX_TABLE_NAME_LEN {
            return Err(crate::Error::InvalidInput(format!(
                "Table name exceeds {} characters: {}",
                MAX_TABLE_NAME_LEN, name
            )));
        }
        let mut chars = name.chars();
        let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
        if !starts_with_letter || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(crate::Error::InvalidInput(format!(
                "Table name must match [A-Za-z][A-Za-z0-9_]*: {}",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for TableName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

/// Identifier of a queued mutation.
///
/// Generated ids embed the enqueue time in milliseconds followed by a random
/// suffix (`<millis>-<hex>`), so they are distinguishable and roughly sortable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId(String);

impl MutationId {
    /// Create a MutationId from an existing string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "MutationId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Build an id from a millisecond timestamp and a random suffix.
    pub fn from_parts(timestamp_millis: i64, suffix: &str) -> Self {
        Self(format!("{}-{}", timestamp_millis, suffix))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The timestamp embedded in a generated id, if present.
    pub fn timestamp_millis(&self) -> Option<i64> {
        self.0.split_once('-').and_then(|(ts, _)| ts.parse().ok())
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_table_name_creation() {
        let name = TableName::new("drivers").unwrap();
        assert_eq!(name.as_str(), "drivers");
    }

    #[test]
    fn test_table_name_rejects_sql() {
        assert!(TableName::new("").is_err());
        assert!(TableName::new("1drivers").is_err());
        assert!(TableName::new("drivers; DROP TABLE cache").is_err());
        assert!(TableName::new("a\"b").is_err());
        assert!(TableName::new("x".repeat(MAX_TABLE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_table_name_serde() {
        let name: TableName = serde_json::from_str("\"location_pings\"").unwrap();
        assert_eq!(name.as_str(), "location_pings");
        assert!(serde_json::from_str::<TableName>("\"bad name\"").is_err());
    }

    #[test]
    fn test_mutation_id_empty_fails() {
        assert!(MutationId::new("").is_err());
    }

    #[test]
    fn test_mutation_id_timestamp() {
        let id = MutationId::from_parts(1_700_000_000_123, "9f2c1a7b");
        assert_eq!(id.as_str(), "1700000000123-9f2c1a7b");
        assert_eq!(id.timestamp_millis(), Some(1_700_000_000_123));
        assert_eq!(MutationId::new("opaque").unwrap().timestamp_millis(), None);
    }

    proptest! {
        #[test]
        fn prop_valid_identifiers_accepted(name in "[A-Za-z][A-Za-z0-9_]{0,40}") {
            prop_assert!(TableName::new(name).is_ok());
        }

        #[test]
        fn prop_names_with_punctuation_rejected(
            prefix in "[a-z]{1,8}",
            bad in "[ ;'\"().-]",
            suffix in "[a-z]{0,8}",
        ) {
            let name = format!("{}{}{}", prefix, bad, suffix);
            prop_assert!(TableName::new(name).is_err());
        }
    }
}
