//! One live server connection and everything issued through it.
//!
//! Each session belongs to exactly one owner (a worker or the control
//! plane) and caches at most one read and one write prepared statement. The
//! bulk read statements have a fixed shape — an IN-list of exactly `bulk`
//! key tuples — so the server can reuse one compiled plan for a whole
//! table; when the final batch comes up short the remaining tuples are
//! bound to NULL, which can never match a primary key.
//!
//! Every driver call funnels through [`DbSession::capture`]: on failure the
//! message (and the vendor error code when the server supplied one) is
//! recorded as the session's last error, on success the last error is
//! cleared.

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Row, Statement, Value};
use std::fmt;
use tracing::{debug, error, info, trace};

use crate::error::SyncError;
use crate::keys::KeyTable;
use crate::progress::{memory_usage, progress, Timer};
use crate::record::{RecordRow, RowBatch};
use crate::schema::{sql_type_from_info, ColumnMeta, TableMeta};
use crate::value::{MD5_CHECK_ALIAS, NULL_SENTINEL};

pub(crate) const SQL_TABLES: &str = "SELECT table_name FROM information_schema.tables \
     WHERE table_schema = ? AND table_type = 'BASE TABLE' ORDER BY 1";

pub(crate) const SQL_COLUMNS: &str = "SELECT column_name, data_type, is_nullable, \
     EXISTS(SELECT 1 FROM information_schema.key_column_usage k \
        WHERE k.constraint_name = 'primary' \
        AND k.table_schema = c.table_schema \
        AND k.table_name = c.table_name \
        AND k.column_name = c.column_name) \
     FROM information_schema.columns c \
     WHERE table_schema = ? AND table_name = ?";

const SQL_UNIQUE_CHECKS_OFF: &str = "SET @OLD_UNIQUE_CHECKS=@@UNIQUE_CHECKS, UNIQUE_CHECKS=0";
const SQL_FOREIGN_KEY_CHECKS_OFF: &str =
    "SET @OLD_FOREIGN_KEY_CHECKS=@@FOREIGN_KEY_CHECKS, FOREIGN_KEY_CHECKS=0";
const SQL_BINLOG_OFF: &str = "SET SESSION SQL_LOG_BIN=0";
const SQL_UNIQUE_CHECKS_RESTORE: &str = "SET UNIQUE_CHECKS=@OLD_UNIQUE_CHECKS";
const SQL_FOREIGN_KEY_CHECKS_RESTORE: &str = "SET FOREIGN_KEY_CHECKS=@OLD_FOREIGN_KEY_CHECKS";
const SQL_BINLOG_RESTORE: &str = "SET SESSION SQL_LOG_BIN=1";

/// Connection coordinates for one side of the replication.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub schema: String,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host={} port={} db={} user={}",
            self.host, self.port, self.schema, self.user
        )
    }
}

/// One connection with its prepared statement cache and last-error slot.
pub struct DbSession {
    label: &'static str,
    schema: String,
    conn: Conn,
    dry_run: bool,
    stmt_read: Option<Statement>,
    read_bulk: usize,
    stmt_write: Option<Statement>,
    key_count: usize,
    last_error: Option<String>,
}

impl DbSession {
    /// Connects to one server. `dry_run` short-circuits the write
    /// executors while leaving reads and transaction control untouched.
    pub async fn open(
        label: &'static str,
        endpoint: &Endpoint,
        dry_run: bool,
    ) -> Result<DbSession, SyncError> {
        info!("<{label}> connecting {endpoint}");
        let opts = OptsBuilder::default()
            .ip_or_hostname(endpoint.host.clone())
            .tcp_port(endpoint.port)
            .user(Some(endpoint.user.clone()))
            .pass(Some(endpoint.password.clone()))
            .db_name(Some(endpoint.schema.clone()));
        let conn = Conn::new(opts)
            .await
            .map_err(|e| SyncError::Connect(format!("<{label}> {endpoint}: {e}")))?;
        Ok(DbSession {
            label,
            schema: endpoint.schema.clone(),
            conn,
            dry_run,
            stmt_read: None,
            read_bulk: 0,
            stmt_write: None,
            key_count: 0,
            last_error: None,
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Last captured error text, empty when the previous call succeeded.
    pub fn last_error(&self) -> &str {
        self.last_error.as_deref().unwrap_or("")
    }

    pub async fn disconnect(self) {
        debug!("<{}> closing db", self.label);
        let _ = self.conn.disconnect().await;
    }

    fn capture<T>(
        &mut self,
        op: &str,
        result: Result<T, mysql_async::Error>,
    ) -> Result<T, SyncError> {
        match result {
            Ok(value) => {
                self.last_error = None;
                Ok(value)
            }
            Err(mysql_async::Error::Server(e)) => {
                error!("<{}> [{op}] error [{}]: {}", self.label, e.code, e.message);
                self.last_error = Some(format!("[{}]: {}", e.code, e.message));
                Err(SyncError::Vendor {
                    code: e.code,
                    message: e.message,
                })
            }
            Err(e) => {
                error!("<{}> [{op}] error: {e}", self.label);
                self.last_error = Some(e.to_string());
                Err(SyncError::Db(e.to_string()))
            }
        }
    }

    /// Runs one plain statement, discarding any result.
    pub async fn exec(&mut self, sql: &str) -> Result<(), SyncError> {
        let result = self.conn.query_drop(sql).await;
        self.capture(sql, result)
    }

    /// Base-table names of the schema, ascending.
    pub async fn load_table_names(&mut self) -> Result<Vec<String>, SyncError> {
        let schema = self.schema.clone();
        let result = self.conn.exec(SQL_TABLES, (schema,)).await;
        self.capture("load tables", result)
    }

    /// Reads the column list of every requested table, in server storage
    /// order, with primary-key membership resolved through
    /// `key_column_usage`.
    pub async fn load_metadata(
        &mut self,
        tables: &std::collections::BTreeSet<String>,
    ) -> Result<std::collections::HashMap<String, TableMeta>, SyncError> {
        let stmt = {
            let result = self.conn.prep(SQL_COLUMNS).await;
            self.capture("prepare metadata", result)
                .map_err(|e| SyncError::Metadata(e.to_string()))?
        };
        let mut map = std::collections::HashMap::new();
        for table in tables {
            let schema = self.schema.clone();
            let result = self
                .conn
                .exec::<(String, String, String, i32), _, _>(&stmt, (schema, table.clone()))
                .await;
            let rows = self
                .capture("metadata", result)
                .map_err(|e| SyncError::Metadata(e.to_string()))?;
            let columns = rows
                .into_iter()
                .map(|(name, data_type, nullable, pk)| ColumnMeta {
                    name,
                    sql_type: sql_type_from_info(&data_type),
                    nullable: nullable.eq_ignore_ascii_case("yes"),
                    primary_key: pk > 0,
                })
                .collect();
            map.insert(table.clone(), TableMeta { columns });
        }
        Ok(map)
    }

    pub fn log_table_info(&self, map: &std::collections::HashMap<String, TableMeta>) {
        info!("<{}> metadata information", self.label);
        let mut tables: Vec<_> = map.iter().collect();
        tables.sort_by(|a, b| a.0.cmp(b.0));
        for (table, meta) in tables {
            info!("`{table}` {meta}");
            for column in &meta.columns {
                info!("  {column}");
            }
        }
    }

    /// Pages the key projection of one table into `keys`.
    ///
    /// No ordering is requested from the server; the client-side sort
    /// establishes the ordering both sides agree on. Paging ends when a
    /// page comes back short.
    pub async fn load_pk(
        &mut self,
        table: &str,
        meta: &TableMeta,
        keys: &mut KeyTable,
        bulk: usize,
    ) -> Result<(), SyncError> {
        let select = sql_key_projection(table, meta, keys.has_fingerprint());
        let timer = Timer::new();
        let loading = format!("{} key loading", self.label);
        let mut loaded = bulk;
        while loaded == bulk {
            progress(table, &timer, &loading, keys.len() as u64, None);
            let sql = format!("{select} LIMIT {bulk} OFFSET {}", keys.len());
            let result = self.conn.query::<Row, _>(sql.as_str()).await;
            let rows = self.capture(&sql, result)?;
            loaded = rows.len();
            for row in rows {
                keys.append(row)?;
            }
        }
        progress(
            table,
            &timer,
            &format!("{} key loaded", self.label),
            keys.len() as u64,
            Some(keys.len() as u64),
        );
        trace!("{} load done [RSS: {}]", self.label, memory_usage());
        Ok(())
    }

    pub async fn transaction_begin(&mut self) -> Result<(), SyncError> {
        let result = self.conn.query_drop("START TRANSACTION").await;
        self.capture("transaction begin", result)
    }

    pub async fn transaction_commit(&mut self) -> Result<(), SyncError> {
        let result = self.conn.query_drop("COMMIT").await;
        self.capture("transaction commit", result)
    }

    async fn prepare_write(&mut self, sql: String) -> Result<(), SyncError> {
        let result = self.conn.prep(sql.as_str()).await;
        let stmt = self
            .capture(&sql, result)
            .map_err(|e| SyncError::Prepare(e.to_string()))?;
        self.stmt_write = Some(stmt);
        Ok(())
    }

    async fn prepare_read(&mut self, sql: String, bulk: usize) -> Result<(), SyncError> {
        let result = self.conn.prep(sql.as_str()).await;
        let stmt = self
            .capture(&sql, result)
            .map_err(|e| SyncError::Prepare(e.to_string()))?;
        self.stmt_read = Some(stmt);
        self.read_bulk = bulk;
        Ok(())
    }

    /// Caches `INSERT INTO t VALUES (?,…)` sized to the full column list.
    pub async fn insert_prepare(&mut self, table: &str, columns: usize) -> Result<(), SyncError> {
        self.prepare_write(sql_insert(table, columns)).await
    }

    pub async fn insert_execute(&mut self, table: &str, row: &RecordRow) -> Result<(), SyncError> {
        if self.dry_run {
            return Ok(());
        }
        let stmt = self.write_statement()?;
        let params: Vec<Value> = row.values().iter().map(|v| v.to_value()).collect();
        let result = self.conn.exec_drop(&stmt, params).await;
        self.capture(&format!("exec prepared insert `{table}`"), result)
    }

    /// Caches `UPDATE t SET nk=?… WHERE pk=?…`. The caller-side contract is
    /// that each row is rotated so its values arrive as (non-keys…, keys…).
    pub async fn update_prepare(
        &mut self,
        table: &str,
        key_names: &[String],
        all_names: &[String],
    ) -> Result<(), SyncError> {
        self.key_count = key_names.len();
        self.prepare_write(sql_update(table, key_names, all_names))
            .await
    }

    pub async fn update_execute(
        &mut self,
        table: &str,
        row: &mut RecordRow,
    ) -> Result<(), SyncError> {
        if self.dry_run {
            return Ok(());
        }
        let stmt = self.write_statement()?;
        row.rotate(self.key_count);
        let params: Vec<Value> = row.values().iter().map(|v| v.to_value()).collect();
        let result = self.conn.exec_drop(&stmt, params).await;
        self.capture(&format!("exec prepared update `{table}`"), result)
    }

    /// Caches `DELETE FROM t WHERE pk=?…`.
    pub async fn delete_prepare(
        &mut self,
        table: &str,
        key_names: &[String],
    ) -> Result<(), SyncError> {
        self.key_count = key_names.len();
        self.prepare_write(sql_delete(table, key_names)).await
    }

    pub async fn delete_execute(
        &mut self,
        table: &str,
        keys: &KeyTable,
        index: usize,
    ) -> Result<(), SyncError> {
        if self.dry_run {
            return Ok(());
        }
        let stmt = self.write_statement()?;
        trace!("delete bind [{index}] {}", keys.row_string(index));
        let mut params = Vec::with_capacity(self.key_count);
        keys.push_params(index, &mut params);
        let result = self.conn.exec_drop(&stmt, params).await;
        self.capture(&format!("exec prepared delete `{table}`"), result)
    }

    /// Caches the bulk full-record fetch for `bulk` key tuples.
    pub async fn select_prepare(
        &mut self,
        table: &str,
        key_names: &[String],
        bulk: usize,
    ) -> Result<(), SyncError> {
        self.key_count = key_names.len();
        self.prepare_read(sql_select_in(table, key_names, bulk), bulk)
            .await
    }

    /// Caches the bulk fingerprint fetch for `bulk` key tuples.
    pub async fn compare_prepare(
        &mut self,
        table: &str,
        meta: &TableMeta,
        bulk: usize,
    ) -> Result<(), SyncError> {
        self.key_count = meta.key_count();
        self.prepare_read(sql_compare_in(table, meta, bulk), bulk)
            .await
    }

    /// Binds up to `bulk` key tuples pulled from `iter` into the cached
    /// read statement and streams the result rows into `into`. When the
    /// iterator runs dry the remaining tuples are NULL-bound so the
    /// statement shape stays reusable.
    pub async fn select_execute<I>(
        &mut self,
        table: &str,
        keys: &KeyTable,
        iter: &mut I,
        into: &mut RowBatch,
    ) -> Result<(), SyncError>
    where
        I: Iterator<Item = usize>,
    {
        let stmt = self
            .stmt_read
            .clone()
            .ok_or_else(|| SyncError::Prepare("no bulk select prepared".into()))?;
        let mut params: Vec<Value> = Vec::with_capacity(self.read_bulk * self.key_count);
        let mut bound = 0;
        while bound < self.read_bulk {
            match iter.next() {
                Some(index) => {
                    trace!("select bind [{index}] {}", keys.row_string(index));
                    keys.push_params(index, &mut params);
                    bound += 1;
                }
                None => break,
            }
        }
        for _ in bound..self.read_bulk {
            for _ in 0..self.key_count {
                params.push(Value::NULL);
            }
        }
        let result = self.conn.exec::<Row, _, _>(&stmt, params).await;
        let rows = self.capture(&format!("exec prepared select `{table}`"), result)?;
        for row in rows {
            into.append(row)?;
        }
        Ok(())
    }

    fn write_statement(&self) -> Result<Statement, SyncError> {
        self.stmt_write
            .clone()
            .ok_or_else(|| SyncError::Prepare("no write statement prepared".into()))
    }
}

/// Disables unique and foreign-key checks for this session, and optionally
/// binary logging. Issued by the control plane before dispatch and by every
/// worker target session on open.
pub async fn target_session_init(
    session: &mut DbSession,
    disable_bin_log: bool,
) -> Result<(), SyncError> {
    session.exec(SQL_UNIQUE_CHECKS_OFF).await?;
    session.exec(SQL_FOREIGN_KEY_CHECKS_OFF).await?;
    if disable_bin_log {
        session.exec(SQL_BINLOG_OFF).await?;
    }
    Ok(())
}

/// Restores the session flags changed by [`target_session_init`].
pub async fn target_session_restore(
    session: &mut DbSession,
    disable_bin_log: bool,
) -> Result<(), SyncError> {
    session.exec(SQL_UNIQUE_CHECKS_RESTORE).await?;
    session.exec(SQL_FOREIGN_KEY_CHECKS_RESTORE).await?;
    if disable_bin_log {
        session.exec(SQL_BINLOG_RESTORE).await?;
    }
    Ok(())
}

fn quoted(names: &[String]) -> Vec<String> {
    names.iter().map(|n| format!("`{n}`")).collect()
}

/// Server-side row fingerprint: MD5 over the non-key columns with NULL
/// normalised to the `∅` sentinel.
fn md5_expression(meta: &TableMeta) -> String {
    let coalesced: Vec<String> = meta
        .columns
        .iter()
        .filter(|c| !c.primary_key)
        .map(|c| format!("COALESCE(`{}`,'{NULL_SENTINEL}')", c.name))
        .collect();
    format!(
        "MD5(CONCAT({})) AS `{MD5_CHECK_ALIAS}`",
        coalesced.join(",")
    )
}

/// Key projection of one table, optionally extended with the fingerprint.
pub(crate) fn sql_key_projection(table: &str, meta: &TableMeta, fingerprint: bool) -> String {
    let mut select = quoted(&meta.key_names()).join(",");
    if fingerprint {
        select.push(',');
        select.push_str(&md5_expression(meta));
    }
    format!("SELECT {select} FROM `{table}`")
}

pub(crate) fn sql_insert(table: &str, columns: usize) -> String {
    let placeholders = vec!["?"; columns].join(",");
    format!("INSERT INTO `{table}` VALUES ({placeholders})")
}

pub(crate) fn sql_update(table: &str, key_names: &[String], all_names: &[String]) -> String {
    let assignments: Vec<String> = all_names[key_names.len()..]
        .iter()
        .map(|n| format!("`{n}`=?"))
        .collect();
    let conditions: Vec<String> = key_names.iter().map(|n| format!("`{n}`=?")).collect();
    format!(
        "UPDATE `{table}` SET {} WHERE {}",
        assignments.join(", "),
        conditions.join(" AND ")
    )
}

pub(crate) fn sql_delete(table: &str, key_names: &[String]) -> String {
    let conditions: Vec<String> = key_names.iter().map(|n| format!("`{n}`=?")).collect();
    format!("DELETE FROM `{table}` WHERE {}", conditions.join(" AND "))
}

fn sql_in_clause(key_names: &[String], bulk: usize) -> String {
    let tuple = format!("({})", vec!["?"; key_names.len()].join(","));
    let tuples = vec![tuple; bulk].join(",");
    format!("({}) IN ({tuples})", quoted(key_names).join(","))
}

pub(crate) fn sql_select_in(table: &str, key_names: &[String], bulk: usize) -> String {
    format!(
        "SELECT * FROM `{table}` WHERE {}",
        sql_in_clause(key_names, bulk)
    )
}

pub(crate) fn sql_compare_in(table: &str, meta: &TableMeta, bulk: usize) -> String {
    let keys = meta.key_names();
    format!(
        "SELECT {},{} FROM `{table}` WHERE {}",
        quoted(&keys).join(","),
        md5_expression(meta),
        sql_in_clause(&keys, bulk)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SqlType;

    fn meta() -> TableMeta {
        TableMeta {
            columns: vec![
                ColumnMeta {
                    name: "key".into(),
                    sql_type: SqlType::Integer,
                    nullable: false,
                    primary_key: true,
                },
                ColumnMeta {
                    name: "stringa".into(),
                    sql_type: SqlType::String,
                    nullable: true,
                    primary_key: false,
                },
                ColumnMeta {
                    name: "decimale".into(),
                    sql_type: SqlType::Double,
                    nullable: true,
                    primary_key: false,
                },
            ],
        }
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn key_projection_without_fingerprint() {
        assert_eq!(
            sql_key_projection("tabella", &meta(), false),
            "SELECT `key` FROM `tabella`"
        );
    }

    #[test]
    fn key_projection_with_fingerprint() {
        assert_eq!(
            sql_key_projection("tabella", &meta(), true),
            "SELECT `key`,MD5(CONCAT(COALESCE(`stringa`,'∅'),COALESCE(`decimale`,'∅'))) \
             AS `#MD5@CHECK#` FROM `tabella`"
        );
    }

    #[test]
    fn insert_is_sized_to_the_column_list() {
        assert_eq!(
            sql_insert("tabella", 3),
            "INSERT INTO `tabella` VALUES (?,?,?)"
        );
    }

    #[test]
    fn update_sets_non_keys_and_filters_on_keys() {
        let sql = sql_update(
            "tabella",
            &names(&["key"]),
            &names(&["key", "stringa", "decimale"]),
        );
        assert_eq!(
            sql,
            "UPDATE `tabella` SET `stringa`=?, `decimale`=? WHERE `key`=?"
        );
    }

    #[test]
    fn update_with_composite_key() {
        let sql = sql_update("t", &names(&["a", "b"]), &names(&["a", "b", "c"]));
        assert_eq!(sql, "UPDATE `t` SET `c`=? WHERE `a`=? AND `b`=?");
    }

    #[test]
    fn delete_filters_on_every_key_column() {
        assert_eq!(
            sql_delete("t", &names(&["a", "b"])),
            "DELETE FROM `t` WHERE `a`=? AND `b`=?"
        );
    }

    #[test]
    fn select_in_has_exactly_bulk_tuples() {
        let sql = sql_select_in("t", &names(&["a", "b"]), 3);
        assert_eq!(
            sql,
            "SELECT * FROM `t` WHERE (`a`,`b`) IN ((?,?),(?,?),(?,?))"
        );
        assert_eq!(sql.matches('?').count(), 6);
    }

    #[test]
    fn compare_in_projects_keys_and_fingerprint() {
        let sql = sql_compare_in("tabella", &meta(), 2);
        assert!(sql.starts_with(
            "SELECT `key`,MD5(CONCAT(COALESCE(`stringa`,'∅'),COALESCE(`decimale`,'∅'))) \
             AS `#MD5@CHECK#` FROM `tabella` WHERE (`key`) IN "
        ));
        assert_eq!(sql.matches('?').count(), 2);
    }
}
