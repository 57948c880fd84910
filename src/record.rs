//! Row-oriented buffers for full records fetched in bulk.
//!
//! A batch is reused across fetches within a phase: clearing drops the rows
//! and the captured column names but keeps the row capacity, so the next
//! fill may come from a differently-shaped statement.

use std::cmp::Ordering;
use std::fmt::Write as _;

use mysql_async::Row;

use crate::error::SyncError;
use crate::value::{sql_type_of, TypedValue};

/// One fetched record. When the batch carries fingerprints the last value is
/// the server-computed row MD5 and takes no part in record comparison.
#[derive(Debug, Clone)]
pub struct RecordRow {
    fingerprint: bool,
    values: Vec<TypedValue>,
}

impl RecordRow {
    pub(crate) fn new(values: Vec<TypedValue>, fingerprint: bool) -> Self {
        RecordRow {
            fingerprint,
            values,
        }
    }

    fn from_row(row: Row, fingerprint: bool) -> Result<Self, SyncError> {
        let columns = row.columns();
        let mut values = Vec::with_capacity(columns.len());
        for (column, value) in columns.iter().zip(row.unwrap()) {
            values.push(TypedValue::from_value(sql_type_of(column), value)?);
        }
        Ok(RecordRow {
            fingerprint,
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn at(&self, index: usize) -> &TypedValue {
        &self.values[index]
    }

    pub fn values(&self) -> &[TypedValue] {
        &self.values
    }

    /// Cyclic left shift by the key column count, so a record fetched as
    /// `(keys…, non-keys…)` binds as `(non-keys…, keys…)` for UPDATE.
    pub fn rotate(&mut self, key_count: usize) {
        debug_assert!(key_count > 0 && key_count < self.values.len());
        self.values.rotate_left(key_count);
    }

    /// The trailing fingerprint value, when present.
    pub fn fingerprint_value(&self) -> Option<&TypedValue> {
        if self.fingerprint {
            self.values.last()
        } else {
            None
        }
    }

    /// Value equality over the non-fingerprint prefix; false when the two
    /// records differ in shape.
    pub fn matches(&self, other: &RecordRow) -> bool {
        if self.values.len() != other.values.len() {
            return false;
        }
        let end = self.values.len() - usize::from(self.fingerprint);
        self.values[..end]
            .iter()
            .zip(&other.values[..end])
            .all(|(a, b)| a.partial_cmp(b) == Some(Ordering::Equal))
    }

    pub fn to_string_with(&self, names: &[String]) -> String {
        let end = self.values.len() - usize::from(self.fingerprint);
        let mut out = String::new();
        for i in 0..end {
            let name = names.get(i).map(String::as_str).unwrap_or("");
            let _ = write!(out, "{name}[{}] ", self.values[i]);
        }
        if self.fingerprint {
            if let Some(md5) = self.values.last() {
                let _ = write!(out, "<{md5}> ");
            }
        }
        out
    }
}

/// Reusable buffer of records returned by one bulk statement.
#[derive(Debug)]
pub struct RowBatch {
    fingerprint: bool,
    names: Vec<String>,
    rows: Vec<RecordRow>,
}

impl RowBatch {
    pub fn new(fingerprint: bool, capacity_hint: usize) -> Self {
        RowBatch {
            fingerprint,
            names: Vec::new(),
            rows: Vec::with_capacity(capacity_hint),
        }
    }

    /// Drops rows and captured column names, keeping row capacity.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.names.clear();
    }

    /// Appends one driver row; the first append captures the column names,
    /// without the fingerprint alias when the batch carries one.
    pub fn append(&mut self, row: Row) -> Result<(), SyncError> {
        if self.rows.is_empty() {
            let columns = row.columns();
            let end = columns.len() - usize::from(self.fingerprint);
            self.names = columns[..end]
                .iter()
                .map(|c| c.name_str().into_owned())
                .collect();
        }
        self.rows.push(RecordRow::from_row(row, self.fingerprint)?);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn push_record(&mut self, names: &[&str], row: RecordRow) {
        if self.rows.is_empty() {
            self.names = names.iter().map(|n| n.to_string()).collect();
        }
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn at(&self, index: usize) -> &RecordRow {
        &self.rows[index]
    }

    pub fn at_mut(&mut self, index: usize) -> &mut RecordRow {
        &mut self.rows[index]
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn row_string(&self, index: usize) -> String {
        self.rows[index].to_string_with(&self.names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Scalar, SqlType};

    fn record(values: Vec<TypedValue>, fingerprint: bool) -> RecordRow {
        RecordRow::new(values, fingerprint)
    }

    fn int(v: i32) -> TypedValue {
        TypedValue::new(SqlType::Integer, Scalar::Int(v))
    }

    fn text(v: &str) -> TypedValue {
        TypedValue::new(SqlType::String, Scalar::Text(v.into()))
    }

    #[test]
    fn rotate_moves_keys_to_the_tail() {
        let mut row = record(vec![int(1), text("a"), text("b")], false);
        row.rotate(1);
        assert_eq!(row.at(0).to_string(), "a");
        assert_eq!(row.at(1).to_string(), "b");
        assert_eq!(row.at(2).to_string(), "1");
    }

    #[test]
    fn matches_ignores_the_fingerprint_column() {
        let a = record(vec![int(1), text("aaaa")], true);
        let b = record(vec![int(1), text("bbbb")], true);
        assert!(a.matches(&b));
        let c = record(vec![int(2), text("aaaa")], true);
        assert!(!a.matches(&c));
    }

    #[test]
    fn null_values_do_not_match_non_null() {
        let a = record(vec![int(1), TypedValue::null(SqlType::String)], false);
        let b = record(vec![int(1), text("x")], false);
        assert!(!a.matches(&b));
        let c = record(vec![int(1), TypedValue::null(SqlType::String)], false);
        assert!(a.matches(&c));
    }

    #[test]
    fn clear_resets_rows_and_names() {
        let mut batch = RowBatch::new(false, 8);
        batch.push_record(&["key", "payload"], record(vec![int(1), text("x")], false));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.column_names(), ["key", "payload"]);
        batch.clear();
        assert!(batch.is_empty());
        assert!(batch.column_names().is_empty());
        batch.push_record(&["other"], record(vec![int(2)], false));
        assert_eq!(batch.column_names(), ["other"]);
    }

    #[test]
    fn row_string_renders_nulls_and_fingerprint() {
        let mut batch = RowBatch::new(true, 4);
        batch.push_record(
            &["key"],
            record(vec![int(7), TypedValue::null(SqlType::String)], true),
        );
        assert_eq!(batch.row_string(0), "key[7] <∅> ");
    }
}
