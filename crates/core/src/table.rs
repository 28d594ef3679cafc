//! Target table descriptions for the local store.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::record::{RecordKey, SqlValue};

/// A synced table: its name, ordered column list and upsert key.
///
/// Identifiers are validated on construction so adapters can splice them
/// into SQL text (quoted) without further checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTableSpec")]
pub struct TableSpec {
    name: String,
    columns: Vec<String>,
    key_columns: Vec<String>,
    #[serde(skip)]
    key_positions: Vec<usize>,
}

impl TableSpec {
    pub fn new<C, K>(name: impl Into<String>, columns: C, key_columns: K) -> CoreResult<Self>
    where
        C: IntoIterator,
        C::Item: Into<String>,
        K: IntoIterator,
        K::Item: Into<String>,
    {
        let name = name.into();
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let key_columns: Vec<String> = key_columns.into_iter().map(Into::into).collect();

        for part in name.split('.') {
            validate_identifier(part)?;
        }
        if name.split('.').count() > 2 {
            return Err(CoreError::invalid_id(format!(
                "table name `{name}` has more than one schema qualifier"
            )));
        }
        if columns.is_empty() {
            return Err(CoreError::validation(format!("table `{name}` declares no columns")));
        }
        if key_columns.is_empty() {
            return Err(CoreError::validation(format!(
                "table `{name}` declares no upsert key"
            )));
        }

        for (idx, column) in columns.iter().enumerate() {
            validate_identifier(column)?;
            if columns[..idx].contains(column) {
                return Err(CoreError::validation(format!(
                    "table `{name}` lists column `{column}` twice"
                )));
            }
        }

        let mut key_positions = Vec::with_capacity(key_columns.len());
        for key in &key_columns {
            let pos = columns.iter().position(|c| c == key).ok_or_else(|| {
                CoreError::validation(format!("upsert key `{key}` is not a column of `{name}`"))
            })?;
            if key_positions.contains(&pos) {
                return Err(CoreError::validation(format!(
                    "upsert key `{key}` listed twice for `{name}`"
                )));
            }
            key_positions.push(pos);
        }

        Ok(Self {
            name,
            columns,
            key_columns,
            key_positions,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    /// Columns updated on conflict (everything outside the upsert key).
    pub fn non_key_columns(&self) -> impl Iterator<Item = &String> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.key_positions.contains(idx))
            .map(|(_, c)| c)
    }

    /// Table name quoted for SQL (`"schema"."table"`).
    pub fn quoted_name(&self) -> String {
        self.name
            .split('.')
            .map(quote_identifier)
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Ensure a row has one value per column.
    pub fn check_arity(&self, values: &[SqlValue]) -> CoreResult<()> {
        if values.len() != self.columns.len() {
            return Err(CoreError::validation(format!(
                "row for `{}` has {} values, expected {}",
                self.name,
                values.len(),
                self.columns.len()
            )));
        }
        Ok(())
    }

    /// Extract the upsert key of a row (values in column order).
    pub fn key_of(&self, values: &[SqlValue]) -> RecordKey {
        RecordKey::new(
            self.key_positions
                .iter()
                .filter_map(|&pos| values.get(pos))
                .map(SqlValue::key_part)
                .collect(),
        )
    }
}

#[derive(Deserialize)]
struct RawTableSpec {
    name: String,
    columns: Vec<String>,
    key_columns: Vec<String>,
}

impl TryFrom<RawTableSpec> for TableSpec {
    type Error = CoreError;

    fn try_from(raw: RawTableSpec) -> Result<Self, Self::Error> {
        Self::new(raw.name, raw.columns, raw.key_columns)
    }
}

/// Quote an already-validated identifier.
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn validate_identifier(ident: &str) -> CoreResult<()> {
    let mut chars = ident.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || ident.len() > 63 {
        return Err(CoreError::invalid_id(format!("unsafe SQL identifier `{ident}`")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delegators() -> TableSpec {
        TableSpec::new(
            "sync.pool_delegators",
            ["pool_id", "stake_address", "amount", "updated_at"],
            ["pool_id", "stake_address"],
        )
        .unwrap()
    }

    #[test]
    fn quoted_name_handles_schema() {
        assert_eq!(delegators().quoted_name(), "\"sync\".\"pool_delegators\"");
    }

    #[test]
    fn non_key_columns_excludes_upsert_key() {
        let table = delegators();
        let rest: Vec<_> = table.non_key_columns().cloned().collect();
        assert_eq!(rest, vec!["amount".to_string(), "updated_at".to_string()]);
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        let err = TableSpec::new("pools; drop table x", ["id"], ["id"]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidId(_)));

        let err = TableSpec::new("pools", ["id", "na me"], ["id"]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidId(_)));
    }

    #[test]
    fn rejects_key_outside_columns() {
        let err = TableSpec::new("pools", ["id"], ["pool_id"]).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn deserialize_revalidates() {
        let table: TableSpec = serde_json::from_value(serde_json::json!({
            "name": "dreps",
            "columns": ["drep_id", "power"],
            "key_columns": ["drep_id"],
        }))
        .unwrap();
        assert_eq!(table.non_key_columns().count(), 1);

        let bad = serde_json::from_value::<TableSpec>(serde_json::json!({
            "name": "dreps",
            "columns": ["drep_id"],
            "key_columns": ["power"],
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn key_of_uses_key_positions() {
        let table = delegators();
        let row = vec![
            SqlValue::text("pool1"),
            SqlValue::text("stake1"),
            SqlValue::bigint(10),
            SqlValue::Timestamp(None),
        ];
        let key = table.key_of(&row);
        assert_eq!(key.parts(), &["t:pool1".to_string(), "t:stake1".to_string()]);
    }
}
