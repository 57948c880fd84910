//! Scalar values as they travel between the two servers.
//!
//! Every field read from either side is normalised into a [`TypedValue`]: a
//! SQL type tag, a null indicator and one of six payload shapes. The driver
//! delivers values in two wire forms depending on the protocol in use —
//! plain queries return every cell as text bytes, prepared statements return
//! typed cells — and [`TypedValue::from_value`] accepts both.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::{Column, Value};

use crate::error::SyncError;

/// Sentinel rendered for NULL, both in logs and inside the server-side
/// fingerprint expression (`COALESCE(col, '∅')`).
pub const NULL_SENTINEL: &str = "∅";

/// Column alias of the server-computed row fingerprint.
pub const MD5_CHECK_ALIAS: &str = "#MD5@CHECK#";

/// The eight SQL type classes handled by the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    String,
    Blob,
    Xml,
    Date,
    Integer,
    LongLong,
    ULongLong,
    Double,
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlType::String => "string",
            SqlType::Blob => "blob",
            SqlType::Xml => "xml",
            SqlType::Date => "date",
            SqlType::Integer => "integer",
            SqlType::LongLong => "long_long",
            SqlType::ULongLong => "unsigned_long_long",
            SqlType::Double => "double",
        };
        f.write_str(name)
    }
}

/// Maps a driver column definition onto the type classes above.
///
/// Unsigned 32-bit integers are widened to `LongLong`; only unsigned BIGINT
/// columns land in `ULongLong`. TEXT columns share the BLOB column type on
/// the wire and are told apart by the binary flag.
pub fn sql_type_of(column: &Column) -> SqlType {
    let unsigned = column.flags().contains(ColumnFlags::UNSIGNED_FLAG);
    let binary = column.flags().contains(ColumnFlags::BINARY_FLAG);
    match column.column_type() {
        ColumnType::MYSQL_TYPE_DECIMAL
        | ColumnType::MYSQL_TYPE_NEWDECIMAL
        | ColumnType::MYSQL_TYPE_FLOAT
        | ColumnType::MYSQL_TYPE_DOUBLE => SqlType::Double,
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_YEAR => SqlType::Integer,
        ColumnType::MYSQL_TYPE_LONG | ColumnType::MYSQL_TYPE_INT24 => {
            if unsigned {
                SqlType::LongLong
            } else {
                SqlType::Integer
            }
        }
        ColumnType::MYSQL_TYPE_LONGLONG => {
            if unsigned {
                SqlType::ULongLong
            } else {
                SqlType::LongLong
            }
        }
        ColumnType::MYSQL_TYPE_DATE
        | ColumnType::MYSQL_TYPE_NEWDATE
        | ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_DATETIME2
        | ColumnType::MYSQL_TYPE_TIMESTAMP
        | ColumnType::MYSQL_TYPE_TIMESTAMP2 => SqlType::Date,
        ColumnType::MYSQL_TYPE_BLOB
        | ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB => {
            if binary {
                SqlType::Blob
            } else {
                SqlType::String
            }
        }
        ColumnType::MYSQL_TYPE_GEOMETRY => SqlType::Blob,
        ColumnType::MYSQL_TYPE_VARCHAR
        | ColumnType::MYSQL_TYPE_VAR_STRING
        | ColumnType::MYSQL_TYPE_STRING => {
            if binary {
                SqlType::Blob
            } else {
                SqlType::String
            }
        }
        _ => SqlType::String,
    }
}

/// Payload of a non-null value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Epoch(i64),
    Int(i32),
    BigInt(i64),
    UBigInt(u64),
    Real(f64),
}

impl Scalar {
    /// Same-type ordering; values of different shapes are unordered.
    fn partial_cmp(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Text(a), Scalar::Text(b)) => Some(a.cmp(b)),
            (Scalar::Epoch(a), Scalar::Epoch(b)) => Some(a.cmp(b)),
            (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
            (Scalar::BigInt(a), Scalar::BigInt(b)) => Some(a.cmp(b)),
            (Scalar::UBigInt(a), Scalar::UBigInt(b)) => Some(a.cmp(b)),
            (Scalar::Real(a), Scalar::Real(b)) => Some(a.total_cmp(b)),
            _ => None,
        }
    }
}

/// One database field: a SQL type tag, a null indicator and the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    sql_type: SqlType,
    value: Option<Scalar>,
}

impl TypedValue {
    pub fn null(sql_type: SqlType) -> Self {
        TypedValue {
            sql_type,
            value: None,
        }
    }

    pub fn new(sql_type: SqlType, scalar: Scalar) -> Self {
        TypedValue {
            sql_type,
            value: Some(scalar),
        }
    }

    /// Decodes one driver cell against the declared column type.
    ///
    /// Accepts both wire forms: typed cells from prepared statements, and
    /// text cells from plain queries. A cell whose shape cannot be read as
    /// the declared type fails with a decode error.
    pub fn from_value(sql_type: SqlType, value: Value) -> Result<Self, SyncError> {
        let scalar = match (sql_type, value) {
            (_, Value::NULL) => return Ok(TypedValue::null(sql_type)),
            (SqlType::String | SqlType::Blob | SqlType::Xml, Value::Bytes(b)) => {
                Scalar::Text(String::from_utf8_lossy(&b).into_owned())
            }
            (SqlType::Date, Value::Date(y, mo, d, h, mi, s, micro)) => {
                Scalar::Epoch(calendar_to_epoch(y, mo, d, h, mi, s, micro).ok_or_else(|| {
                    SyncError::Decode(format!("invalid date {y:04}-{mo:02}-{d:02}"))
                })?)
            }
            (SqlType::Date, Value::Bytes(b)) => {
                let text = String::from_utf8_lossy(&b);
                Scalar::Epoch(parse_epoch(&text).ok_or_else(|| {
                    SyncError::Decode(format!("invalid date text '{text}'"))
                })?)
            }
            (SqlType::Integer, Value::Int(i)) => Scalar::Int(
                i32::try_from(i)
                    .map_err(|_| SyncError::Decode(format!("integer overflow: {i}")))?,
            ),
            (SqlType::Integer, Value::UInt(u)) => Scalar::Int(
                i32::try_from(u)
                    .map_err(|_| SyncError::Decode(format!("integer overflow: {u}")))?,
            ),
            (SqlType::Integer, Value::Bytes(b)) => Scalar::Int(parse_number(&b)?),
            (SqlType::LongLong, Value::Int(i)) => Scalar::BigInt(i),
            (SqlType::LongLong, Value::UInt(u)) => Scalar::BigInt(
                i64::try_from(u)
                    .map_err(|_| SyncError::Decode(format!("bigint overflow: {u}")))?,
            ),
            (SqlType::LongLong, Value::Bytes(b)) => Scalar::BigInt(parse_number(&b)?),
            (SqlType::ULongLong, Value::UInt(u)) => Scalar::UBigInt(u),
            (SqlType::ULongLong, Value::Int(i)) => Scalar::UBigInt(
                u64::try_from(i)
                    .map_err(|_| SyncError::Decode(format!("negative unsigned: {i}")))?,
            ),
            (SqlType::ULongLong, Value::Bytes(b)) => Scalar::UBigInt(parse_number(&b)?),
            (SqlType::Double, Value::Double(d)) => Scalar::Real(d),
            (SqlType::Double, Value::Float(f)) => Scalar::Real(f64::from(f)),
            (SqlType::Double, Value::Int(i)) => Scalar::Real(i as f64),
            (SqlType::Double, Value::UInt(u)) => Scalar::Real(u as f64),
            (SqlType::Double, Value::Bytes(b)) => Scalar::Real(parse_number(&b)?),
            (declared, got) => {
                return Err(SyncError::Decode(format!(
                    "column declared {declared} but driver delivered {got:?}"
                )))
            }
        };
        Ok(TypedValue::new(sql_type, scalar))
    }

    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    pub fn scalar(&self) -> Option<&Scalar> {
        self.value.as_ref()
    }

    /// Converts back into a driver value for statement binding. Dates are
    /// bound as datetime literals so both wire protocols accept them.
    pub fn to_value(&self) -> Value {
        match &self.value {
            None => Value::NULL,
            Some(Scalar::Text(s)) => Value::Bytes(s.clone().into_bytes()),
            Some(Scalar::Epoch(e)) => Value::Bytes(epoch_to_text(*e).into_bytes()),
            Some(Scalar::Int(i)) => Value::Int(i64::from(*i)),
            Some(Scalar::BigInt(i)) => Value::Int(*i),
            Some(Scalar::UBigInt(u)) => Value::UInt(*u),
            Some(Scalar::Real(d)) => Value::Double(*d),
        }
    }

    /// Total order within one SQL type: null < value, null == null.
    /// Values of different SQL types are unordered.
    pub fn partial_cmp(&self, other: &TypedValue) -> Option<Ordering> {
        if self.sql_type != other.sql_type {
            return None;
        }
        match (&self.value, &other.value) {
            (None, None) => Some(Ordering::Equal),
            (None, Some(_)) => Some(Ordering::Less),
            (Some(_), None) => Some(Ordering::Greater),
            (Some(a), Some(b)) => a.partial_cmp(b),
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            None => f.write_str(NULL_SENTINEL),
            Some(Scalar::Text(s)) => f.write_str(s),
            Some(Scalar::Epoch(e)) => f.write_str(&epoch_to_text(*e)),
            Some(Scalar::Int(i)) => write!(f, "{i}"),
            Some(Scalar::BigInt(i)) => write!(f, "{i}"),
            Some(Scalar::UBigInt(u)) => write!(f, "{u}"),
            Some(Scalar::Real(d)) => write!(f, "{d}"),
        }
    }
}

fn calendar_to_epoch(y: u16, mo: u8, d: u8, h: u8, mi: u8, s: u8, micro: u32) -> Option<i64> {
    let _ = micro;
    NaiveDate::from_ymd_opt(i32::from(y), u32::from(mo), u32::from(d))
        .and_then(|date| date.and_hms_opt(u32::from(h), u32::from(mi), u32::from(s)))
        .map(|dt| dt.and_utc().timestamp())
}

fn parse_epoch(text: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|dt| dt.and_utc().timestamp())
}

fn epoch_to_text(epoch: i64) -> String {
    match DateTime::from_timestamp(epoch, 0) {
        Some(dt) => dt.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string(),
        None => epoch.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(bytes: &[u8]) -> Result<T, SyncError> {
    let text = String::from_utf8_lossy(bytes);
    text.trim()
        .parse::<T>()
        .map_err(|_| SyncError::Decode(format!("not a number: '{text}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sorts_below_any_value_and_equal_to_null() {
        let null = TypedValue::null(SqlType::Integer);
        let one = TypedValue::new(SqlType::Integer, Scalar::Int(1));
        assert_eq!(null.partial_cmp(&one), Some(Ordering::Less));
        assert_eq!(one.partial_cmp(&null), Some(Ordering::Greater));
        assert_eq!(
            null.partial_cmp(&TypedValue::null(SqlType::Integer)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn mismatched_types_are_unordered() {
        let i = TypedValue::new(SqlType::Integer, Scalar::Int(1));
        let s = TypedValue::new(SqlType::String, Scalar::Text("1".into()));
        assert_eq!(i.partial_cmp(&s), None);
    }

    #[test]
    fn decodes_binary_protocol_cells() {
        let v = TypedValue::from_value(SqlType::LongLong, Value::Int(42)).unwrap();
        assert_eq!(v.scalar(), Some(&Scalar::BigInt(42)));
        let v = TypedValue::from_value(SqlType::Double, Value::Double(1.5)).unwrap();
        assert_eq!(v.scalar(), Some(&Scalar::Real(1.5)));
        let v =
            TypedValue::from_value(SqlType::Date, Value::Date(2024, 3, 1, 12, 30, 0, 0)).unwrap();
        assert_eq!(v.to_string(), "2024-03-01 12:30:00");
    }

    #[test]
    fn decodes_text_protocol_cells() {
        let v = TypedValue::from_value(SqlType::Integer, Value::Bytes(b"-7".to_vec())).unwrap();
        assert_eq!(v.scalar(), Some(&Scalar::Int(-7)));
        let v = TypedValue::from_value(SqlType::Double, Value::Bytes(b"2.5000".to_vec())).unwrap();
        assert_eq!(v.scalar(), Some(&Scalar::Real(2.5)));
        let v = TypedValue::from_value(
            SqlType::Date,
            Value::Bytes(b"2024-03-01 12:30:00".to_vec()),
        )
        .unwrap();
        assert_eq!(v.to_string(), "2024-03-01 12:30:00");
        let v = TypedValue::from_value(SqlType::Date, Value::Bytes(b"2024-03-01".to_vec()))
            .unwrap();
        assert_eq!(v.to_string(), "2024-03-01 00:00:00");
    }

    #[test]
    fn rejects_shape_mismatch() {
        let err = TypedValue::from_value(SqlType::Integer, Value::Double(1.0));
        assert!(matches!(err, Err(SyncError::Decode(_))));
        let err = TypedValue::from_value(SqlType::Integer, Value::Int(i64::MAX));
        assert!(matches!(err, Err(SyncError::Decode(_))));
    }

    #[test]
    fn null_renders_as_sentinel() {
        assert_eq!(TypedValue::null(SqlType::String).to_string(), NULL_SENTINEL);
    }

    #[test]
    fn unicode_text_round_trips_through_binding() {
        let v = TypedValue::new(SqlType::String, Scalar::Text("héllo ∅ 漢字".into()));
        match v.to_value() {
            Value::Bytes(b) => assert_eq!(String::from_utf8(b).unwrap(), "héllo ∅ 漢字"),
            other => panic!("unexpected value {other:?}"),
        }
    }
}
