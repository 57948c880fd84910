//! Table metadata as read from `information_schema`.
//!
//! Source and target must agree position-wise on every processed table; the
//! comparison is over the full column descriptor, not just the name.

use std::fmt;

use crate::value::SqlType;

/// One column descriptor. Equality is field-wise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl fmt::Display for ColumnMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` type {}", self.name, self.sql_type)?;
        if self.nullable {
            f.write_str(" nullable")?;
        }
        if self.primary_key {
            f.write_str(" primary key")?;
        }
        Ok(())
    }
}

/// Ordered column list of one table, in server storage order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMeta {
    pub columns: Vec<ColumnMeta>,
}

impl TableMeta {
    pub fn key_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn key_count(&self) -> usize {
        self.columns.iter().filter(|c| c.primary_key).count()
    }

    pub fn non_key_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn non_key_count(&self) -> usize {
        self.columns.len() - self.key_count()
    }

    /// Position-wise differences against the other side, one description per
    /// mismatch. Empty means the two tables are compatible.
    pub fn mismatches(&self, other: &TableMeta) -> Vec<String> {
        if self.columns.len() != other.columns.len() {
            return vec![format!(
                "columns count mismatch [source {}] [target {}]",
                self.columns.len(),
                other.columns.len()
            )];
        }
        self.columns
            .iter()
            .zip(other.columns.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, (a, b))| format!("column {i} mismatch [source {a}] [target {b}]"))
            .collect()
    }
}

impl fmt::Display for TableMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[columns: {}]", self.columns.len())
    }
}

/// Maps an `information_schema.columns.data_type` onto a type class.
///
/// Decimals intentionally land in the double class; exact numeric columns
/// are compared and fingerprinted through their floating representation.
pub fn sql_type_from_info(data_type: &str) -> SqlType {
    match data_type.to_ascii_lowercase().as_str() {
        "char" | "varchar" | "text" | "tinytext" | "mediumtext" | "longtext" | "enum" | "set"
        | "json" | "time" | "year" => SqlType::String,
        "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" | "bit"
        | "geometry" => SqlType::Blob,
        "xml" => SqlType::Xml,
        "date" | "datetime" | "timestamp" => SqlType::Date,
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" => SqlType::Integer,
        "bigint" => SqlType::LongLong,
        "float" | "double" | "real" | "decimal" | "numeric" => SqlType::Double,
        _ => SqlType::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, sql_type: SqlType, nullable: bool, primary_key: bool) -> ColumnMeta {
        ColumnMeta {
            name: name.into(),
            sql_type,
            nullable,
            primary_key,
        }
    }

    fn fixture() -> TableMeta {
        TableMeta {
            columns: vec![
                column("key", SqlType::Integer, false, true),
                column("intero", SqlType::Integer, true, false),
                column("stringa", SqlType::String, true, false),
                column("timestamp", SqlType::Date, true, false),
                column("blob", SqlType::String, true, false),
                column("decimale", SqlType::Double, true, false),
            ],
        }
    }

    #[test]
    fn key_projection_and_non_keys() {
        let meta = fixture();
        assert_eq!(meta.key_names(), vec!["key".to_string()]);
        assert_eq!(meta.key_count(), 1);
        assert_eq!(meta.non_key_count(), 5);
        assert_eq!(meta.non_key_names().len(), 5);
    }

    #[test]
    fn identical_tables_are_compatible() {
        assert!(fixture().mismatches(&fixture()).is_empty());
    }

    #[test]
    fn column_count_mismatch_is_reported_once() {
        let mut other = fixture();
        other.columns.pop();
        let errs = fixture().mismatches(&other);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("columns count mismatch"));
    }

    #[test]
    fn per_position_mismatch_is_reported() {
        let mut other = fixture();
        other.columns[2].nullable = false;
        other.columns[5].sql_type = SqlType::String;
        let errs = fixture().mismatches(&other);
        assert_eq!(errs.len(), 2);
        assert!(errs[0].contains("column 2 mismatch"));
        assert!(errs[1].contains("column 5 mismatch"));
    }

    #[test]
    fn info_schema_type_mapping() {
        assert_eq!(sql_type_from_info("varchar"), SqlType::String);
        assert_eq!(sql_type_from_info("LONGTEXT"), SqlType::String);
        assert_eq!(sql_type_from_info("longblob"), SqlType::Blob);
        assert_eq!(sql_type_from_info("datetime"), SqlType::Date);
        assert_eq!(sql_type_from_info("int"), SqlType::Integer);
        assert_eq!(sql_type_from_info("bigint"), SqlType::LongLong);
        assert_eq!(sql_type_from_info("decimal"), SqlType::Double);
    }
}
