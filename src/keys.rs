//! Column-oriented storage for the primary-key projection of one table side.
//!
//! A typical table has one to four key columns and up to millions of rows;
//! storing each column in its own contiguous vector keeps the sort
//! cache-friendly and makes a row swap one scalar move per column. The sort
//! never moves the data itself: it builds an `order` permutation, and every
//! external accessor addresses rows through it. A packed per-row flag bit is
//! reused by consecutive phases — "only on this side" after the key diff,
//! then "needs update" after the fingerprint filter.

use std::cmp::Ordering;
use std::fmt::Write as _;

use mysql_async::{Row, Value};
use tracing::debug;

use crate::error::SyncError;
use crate::progress::{memory_usage, Timer};
use crate::value::{sql_type_of, Scalar, SqlType, TypedValue};

/// Packed bit-per-row flag storage.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlagVec {
    words: Vec<u64>,
    len: usize,
}

impl FlagVec {
    pub fn with_len(len: usize) -> Self {
        FlagVec {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        (self.words[index / 64] >> (index % 64)) & 1 == 1
    }

    pub fn set(&mut self, index: usize, value: bool) {
        debug_assert!(index < self.len);
        let mask = 1u64 << (index % 64);
        if value {
            self.words[index / 64] |= mask;
        } else {
            self.words[index / 64] &= !mask;
        }
    }

    /// Flips every bit; the unused tail of the last word stays clear.
    pub fn flip_all(&mut self) {
        for word in &mut self.words {
            *word = !*word;
        }
        let tail = self.len % 64;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }

    pub fn count(&self, value: bool) -> usize {
        let ones: usize = self.words.iter().map(|w| w.count_ones() as usize).sum();
        if value {
            ones
        } else {
            self.len - ones
        }
    }
}

/// One column of key storage, tagged by its SQL type class.
#[derive(Debug)]
enum KeyColumn {
    Int(Vec<i32>),
    BigInt(Vec<i64>),
    UBigInt(Vec<u64>),
    Real(Vec<f64>),
    Epoch(Vec<i64>),
    Text(Vec<String>),
}

impl KeyColumn {
    fn for_type(sql_type: SqlType, capacity: usize) -> KeyColumn {
        match sql_type {
            SqlType::Integer => KeyColumn::Int(Vec::with_capacity(capacity)),
            SqlType::LongLong => KeyColumn::BigInt(Vec::with_capacity(capacity)),
            SqlType::ULongLong => KeyColumn::UBigInt(Vec::with_capacity(capacity)),
            SqlType::Double => KeyColumn::Real(Vec::with_capacity(capacity)),
            SqlType::Date => KeyColumn::Epoch(Vec::with_capacity(capacity)),
            SqlType::String | SqlType::Blob | SqlType::Xml => {
                KeyColumn::Text(Vec::with_capacity(capacity))
            }
        }
    }

    fn push(&mut self, scalar: Scalar) -> Result<(), SyncError> {
        match (self, scalar) {
            (KeyColumn::Int(v), Scalar::Int(x)) => v.push(x),
            (KeyColumn::BigInt(v), Scalar::BigInt(x)) => v.push(x),
            (KeyColumn::UBigInt(v), Scalar::UBigInt(x)) => v.push(x),
            (KeyColumn::Real(v), Scalar::Real(x)) => v.push(x),
            (KeyColumn::Epoch(v), Scalar::Epoch(x)) => v.push(x),
            (KeyColumn::Text(v), Scalar::Text(x)) => v.push(x),
            _ => {
                return Err(SyncError::Decode(
                    "key value shape changed between rows".into(),
                ))
            }
        }
        Ok(())
    }

    /// Storage-index comparison within one column.
    fn cmp_within(&self, a: usize, b: usize) -> Ordering {
        match self {
            KeyColumn::Int(v) => v[a].cmp(&v[b]),
            KeyColumn::BigInt(v) => v[a].cmp(&v[b]),
            KeyColumn::UBigInt(v) => v[a].cmp(&v[b]),
            KeyColumn::Real(v) => v[a].total_cmp(&v[b]),
            KeyColumn::Epoch(v) => v[a].cmp(&v[b]),
            KeyColumn::Text(v) => v[a].cmp(&v[b]),
        }
    }

    /// Storage-index comparison across two tables; unordered when the
    /// column classes disagree.
    fn cmp_across(&self, a: usize, other: &KeyColumn, b: usize) -> Option<Ordering> {
        match (self, other) {
            (KeyColumn::Int(x), KeyColumn::Int(y)) => Some(x[a].cmp(&y[b])),
            (KeyColumn::BigInt(x), KeyColumn::BigInt(y)) => Some(x[a].cmp(&y[b])),
            (KeyColumn::UBigInt(x), KeyColumn::UBigInt(y)) => Some(x[a].cmp(&y[b])),
            (KeyColumn::Real(x), KeyColumn::Real(y)) => Some(x[a].total_cmp(&y[b])),
            (KeyColumn::Epoch(x), KeyColumn::Epoch(y)) => Some(x[a].cmp(&y[b])),
            (KeyColumn::Text(x), KeyColumn::Text(y)) => Some(x[a].cmp(&y[b])),
            _ => None,
        }
    }

    fn value_at(&self, index: usize) -> Scalar {
        match self {
            KeyColumn::Int(v) => Scalar::Int(v[index]),
            KeyColumn::BigInt(v) => Scalar::BigInt(v[index]),
            KeyColumn::UBigInt(v) => Scalar::UBigInt(v[index]),
            KeyColumn::Real(v) => Scalar::Real(v[index]),
            KeyColumn::Epoch(v) => Scalar::Epoch(v[index]),
            KeyColumn::Text(v) => Scalar::Text(v[index].clone()),
        }
    }
}

/// Column store of a table's primary keys, optionally with a trailing row
/// fingerprint column.
#[derive(Debug)]
pub struct KeyTable {
    fingerprint: bool,
    capacity_hint: usize,
    count: usize,
    names: Vec<String>,
    columns: Vec<(SqlType, KeyColumn)>,
    order: Vec<usize>,
    flags: FlagVec,
    sorted: bool,
}

impl KeyTable {
    pub fn new(fingerprint: bool, capacity_hint: usize) -> Self {
        KeyTable {
            fingerprint,
            capacity_hint,
            count: 0,
            names: Vec::new(),
            columns: Vec::new(),
            order: Vec::new(),
            flags: FlagVec::default(),
            sorted: true,
        }
    }

    pub fn has_fingerprint(&self) -> bool {
        self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Key column names, excluding the fingerprint alias.
    pub fn column_names(&self) -> &[String] {
        &self.names[..self.key_column_count()]
    }

    fn key_column_count(&self) -> usize {
        self.columns.len() - usize::from(self.fingerprint)
    }

    fn init(&mut self, row: &Row) {
        for column in row.columns_ref() {
            let sql_type = sql_type_of(column);
            self.names.push(column.name_str().into_owned());
            self.columns
                .push((sql_type, KeyColumn::for_type(sql_type, self.capacity_hint)));
        }
    }

    /// Appends one driver row. The first call captures the column layout
    /// from the row metadata. Sortedness is tracked on the fly so a key scan
    /// that arrives in key order skips the client-side sort.
    pub fn append(&mut self, row: Row) -> Result<(), SyncError> {
        if self.count == 0 && self.columns.is_empty() {
            self.init(&row);
        }
        let values = row.unwrap();
        if values.len() != self.columns.len() {
            return Err(SyncError::Decode(format!(
                "key row has {} columns, expected {}",
                values.len(),
                self.columns.len()
            )));
        }
        for (i, value) in values.into_iter().enumerate() {
            let (sql_type, column) = &mut self.columns[i];
            let decoded = TypedValue::from_value(*sql_type, value)?;
            let scalar = match decoded.scalar() {
                Some(s) => s.clone(),
                None => {
                    return Err(SyncError::Decode(format!(
                        "NULL in key column `{}`",
                        self.names[i]
                    )))
                }
            };
            column.push(scalar)?;
        }
        self.count += 1;
        if self.count > 1 && self.sorted {
            self.sorted = self.storage_less(self.count - 2, self.count - 1);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn init_columns(&mut self, specs: Vec<(String, SqlType)>) {
        for (name, sql_type) in specs {
            self.names.push(name);
            self.columns
                .push((sql_type, KeyColumn::for_type(sql_type, self.capacity_hint)));
        }
    }

    #[cfg(test)]
    pub(crate) fn push_row(&mut self, scalars: Vec<Scalar>) {
        for (i, scalar) in scalars.into_iter().enumerate() {
            self.columns[i].1.push(scalar).unwrap();
        }
        self.count += 1;
        if self.count > 1 && self.sorted {
            self.sorted = self.storage_less(self.count - 2, self.count - 1);
        }
    }

    fn storage_less(&self, a: usize, b: usize) -> bool {
        let key_columns = self.key_column_count();
        compare_storage(&self.columns[..key_columns], a, b) == Ordering::Less
    }

    /// Builds the `order` permutation and the flag array. When the rows
    /// arrived already sorted the sort itself is skipped, but `order` and
    /// the flags are still allocated so logical addressing stays valid.
    pub fn sort(&mut self, side: &str) {
        if !self.order.is_empty() {
            return;
        }
        let timer = Timer::new();
        debug!(
            "sort {side} begin [keys: {}] [RSS: {}]",
            self.count,
            memory_usage()
        );
        self.order = (0..self.count).collect();
        self.flags = FlagVec::with_len(self.count);
        if self.count > 0 && !self.sorted {
            let key_columns = &self.columns[..self.key_column_count()];
            self.order
                .sort_unstable_by(|&a, &b| compare_storage(key_columns, a, b));
        }
        let report = timer.report(self.count as u64);
        debug!(
            "sort {side} done [{:.0} keys/sec] [elapsed {}] [RSS: {}]",
            report.speed,
            crate::progress::format_duration(report.elapsed),
            memory_usage()
        );
    }

    /// Cross-table comparison of logical rows over the key columns.
    /// Unordered only when the column layouts disagree.
    pub fn compare(&self, i: usize, other: &KeyTable, j: usize) -> Option<Ordering> {
        let a = self.order[i];
        let b = other.order[j];
        let key_columns = self.key_column_count();
        if key_columns != other.key_column_count() {
            return None;
        }
        for k in 0..key_columns {
            match self.columns[k].1.cmp_across(a, &other.columns[k].1, b)? {
                Ordering::Equal => continue,
                decided => return Some(decided),
            }
        }
        Some(Ordering::Equal)
    }

    pub fn less(&self, i: usize, other: &KeyTable, j: usize) -> bool {
        self.compare(i, other, j) == Some(Ordering::Less)
    }

    /// Fingerprint equality of two logical rows. Only meaningful when both
    /// tables carry the fingerprint column.
    pub fn update_equal(&self, i: usize, other: &KeyTable, j: usize) -> bool {
        debug_assert!(self.fingerprint && other.fingerprint);
        let a = self.order[i];
        let b = other.order[j];
        match (
            &self.columns[self.columns.len() - 1].1,
            &other.columns[other.columns.len() - 1].1,
        ) {
            (KeyColumn::Text(x), KeyColumn::Text(y)) => x[a] == y[b],
            _ => false,
        }
    }

    pub fn set_flag(&mut self, i: usize, value: bool) {
        self.flags.set(i, value);
    }

    pub fn flag(&self, i: usize) -> bool {
        self.flags.get(i)
    }

    /// Flips every row flag; used when the diff's "common" rows become the
    /// update phase's candidate set.
    pub fn revert_flags(&mut self) {
        self.flags.flip_all();
    }

    /// Number of rows whose flag equals `value`.
    pub fn size_of(&self, value: bool) -> usize {
        self.flags.count(value)
    }

    /// Iterates logical indices whose flag equals `want`, in logical order.
    pub fn iter(&self, want: bool) -> KeyIter<'_> {
        KeyIter {
            table: self,
            want,
            pos: 0,
        }
    }

    /// Pushes the key column values of logical row `i` as statement
    /// parameters, one per key column, in column order.
    pub fn push_params(&self, i: usize, params: &mut Vec<Value>) {
        let idx = self.order[i];
        for (sql_type, column) in &self.columns[..self.key_column_count()] {
            params.push(TypedValue::new(*sql_type, column.value_at(idx)).to_value());
        }
    }

    /// Textual rendering of logical row `i` for logs and errors.
    pub fn row_string(&self, i: usize) -> String {
        let idx = self.order[i];
        let mut out = String::new();
        for (k, (sql_type, column)) in self.columns[..self.key_column_count()].iter().enumerate() {
            let value = TypedValue::new(*sql_type, column.value_at(idx));
            let _ = write!(out, "{}[{}] ", self.names[k], value);
        }
        if self.fingerprint {
            if let KeyColumn::Text(v) = &self.columns[self.columns.len() - 1].1 {
                let _ = write!(out, "<{}> ", v[idx]);
            }
        }
        out
    }
}

fn compare_storage(columns: &[(SqlType, KeyColumn)], a: usize, b: usize) -> Ordering {
    for (_, column) in columns {
        match column.cmp_within(a, b) {
            Ordering::Equal => continue,
            decided => return decided,
        }
    }
    Ordering::Equal
}

/// Iterator over the logical indices carrying a given flag value.
#[derive(Clone)]
pub struct KeyIter<'a> {
    table: &'a KeyTable,
    want: bool,
    pos: usize,
}

impl Iterator for KeyIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.pos < self.table.len() {
            let i = self.pos;
            self.pos += 1;
            if self.table.flag(i) == self.want {
                return Some(i);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_table(values: &[i32], fingerprint: Option<&[&str]>) -> KeyTable {
        let mut table = KeyTable::new(fingerprint.is_some(), 16);
        let mut specs = vec![("key".to_string(), SqlType::Integer)];
        if fingerprint.is_some() {
            specs.push((crate::value::MD5_CHECK_ALIAS.to_string(), SqlType::String));
        }
        table.init_columns(specs);
        for (pos, v) in values.iter().enumerate() {
            let mut row = vec![Scalar::Int(*v)];
            if let Some(md5) = fingerprint {
                row.push(Scalar::Text(md5[pos].to_string()));
            }
            table.push_row(row);
        }
        table
    }

    fn pair_table(values: &[(i64, &str)]) -> KeyTable {
        let mut table = KeyTable::new(false, 16);
        table.init_columns(vec![
            ("a".to_string(), SqlType::LongLong),
            ("b".to_string(), SqlType::String),
        ]);
        for (a, b) in values {
            table.push_row(vec![Scalar::BigInt(*a), Scalar::Text(b.to_string())]);
        }
        table
    }

    #[test]
    fn sort_orders_logical_access() {
        let mut table = int_table(&[5, 1, 4, 2, 3], None);
        assert!(!table.is_empty());
        table.sort("test");
        let mut other = int_table(&[1, 2, 3, 4, 5], None);
        other.sort("test");
        for i in 0..table.len() {
            assert_eq!(table.compare(i, &other, i), Some(Ordering::Equal));
        }
        for i in 1..table.len() {
            assert_ne!(table.compare(i - 1, &table, i), Some(Ordering::Greater));
        }
    }

    #[test]
    fn presorted_input_skips_sort_but_allows_access() {
        let mut table = int_table(&[1, 2, 3], None);
        table.sort("test");
        assert_eq!(table.size_of(false), 3);
        assert_eq!(table.row_string(0), "key[1] ");
        assert_eq!(table.row_string(2), "key[3] ");
    }

    #[test]
    fn composite_key_ordering_is_lexicographic() {
        let mut table = pair_table(&[(2, "a"), (1, "z"), (1, "a")]);
        table.sort("test");
        assert_eq!(table.row_string(0), "a[1] b[a] ");
        assert_eq!(table.row_string(1), "a[1] b[z] ");
        assert_eq!(table.row_string(2), "a[2] b[a] ");
    }

    #[test]
    fn flags_count_revert_and_iterate() {
        let mut table = int_table(&[10, 20, 30, 40], None);
        table.sort("test");
        table.set_flag(1, true);
        table.set_flag(3, true);
        assert_eq!(table.size_of(true), 2);
        assert_eq!(table.size_of(false), 2);
        assert_eq!(table.iter(true).collect::<Vec<_>>(), vec![1, 3]);
        table.revert_flags();
        assert_eq!(table.iter(true).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(table.size_of(true), 2);
    }

    #[test]
    fn fingerprint_column_is_excluded_from_ordering() {
        let src = {
            let mut t = int_table(&[1, 2], Some(&["aaaa", "bbbb"]));
            t.sort("source");
            t
        };
        let dest = {
            let mut t = int_table(&[1, 2], Some(&["aaaa", "cccc"]));
            t.sort("target");
            t
        };
        assert_eq!(src.compare(0, &dest, 0), Some(Ordering::Equal));
        assert_eq!(src.compare(1, &dest, 1), Some(Ordering::Equal));
        assert!(src.update_equal(0, &dest, 0));
        assert!(!src.update_equal(1, &dest, 1));
    }

    #[test]
    fn column_names_drop_fingerprint_alias() {
        let table = int_table(&[1], Some(&["aaaa"]));
        assert_eq!(table.column_names(), ["key".to_string()]);
    }

    #[test]
    fn append_order_tracking_detects_unsorted_input() {
        let sorted = int_table(&[1, 2, 3], None);
        assert!(sorted.sorted);
        let unsorted = int_table(&[3, 1, 2], None);
        assert!(!unsorted.sorted);
        let duplicate = int_table(&[1, 1], None);
        assert!(!duplicate.sorted);
    }

    #[test]
    fn params_are_pushed_in_key_order() {
        let mut table = pair_table(&[(7, "x")]);
        table.sort("test");
        let mut params = Vec::new();
        table.push_params(0, &mut params);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], Value::Int(7));
        assert_eq!(params[1], Value::Bytes(b"x".to_vec()));
    }

    #[test]
    fn flag_vec_flip_keeps_tail_clear() {
        let mut flags = FlagVec::with_len(70);
        flags.set(0, true);
        flags.set(69, true);
        assert_eq!(flags.count(true), 2);
        flags.flip_all();
        assert_eq!(flags.count(true), 68);
        assert!(!flags.get(0));
        assert!(!flags.get(69));
        assert!(flags.get(1));
        assert_eq!(flags.len(), 70);
    }
}
