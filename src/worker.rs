//! Per-table replication pipeline.
//!
//! A worker owns one source and one target session and pulls table names
//! from the coordinator until the queue drains or a shutdown is observed.
//! For each table it loads both key sets concurrently, sorts them off the
//! async runtime, diffs them in place, and then runs the add / update /
//! delete phases with bulk fetches and per-batch target transactions.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, trace};

use crate::coordinator::{Coordinator, Mode};
use crate::db::{target_session_init, DbSession};
use crate::diff::compare_keys;
use crate::error::SyncError;
use crate::keys::KeyTable;
use crate::progress::{format_duration, progress, Timer};
use crate::record::RowBatch;
use crate::schema::TableMeta;

pub struct TableWorker {
    id: usize,
    coord: Arc<Coordinator>,
    source: DbSession,
    target: DbSession,
}

impl TableWorker {
    /// Opens the worker's two sessions. The target session runs the same
    /// check-disabling sequence the control plane issued, so every
    /// connection writing to the target behaves alike.
    pub async fn connect(coord: Arc<Coordinator>, id: usize) -> Result<TableWorker, SyncError> {
        let dry_run = coord.config().dry_run;
        let disable_bin_log = coord.config().disable_bin_log;
        let source = DbSession::open("source", coord.source_endpoint(), false).await?;
        let mut target = DbSession::open("target", coord.target_endpoint(), dry_run).await?;
        target_session_init(&mut target, disable_bin_log).await?;
        Ok(TableWorker {
            id,
            coord,
            source,
            target,
        })
    }

    /// Processes tables until the queue empties, a failure aborts this
    /// worker, or a shutdown is observed. Returns whether every processed
    /// table completed.
    pub async fn run(mut self) -> bool {
        debug!(
            "worker {} start processing with configuration {}",
            self.id,
            self.coord.config()
        );
        let mode = self.coord.config().mode;
        let dry_run = if self.coord.config().dry_run {
            " dry run"
        } else {
            ""
        };
        while let Some(table) = self.coord.table_to_process() {
            let Some(meta) = self.coord.source_meta(&table) else {
                error!("`{table}` metadata missing");
                return false;
            };
            if meta.columns.is_empty() {
                info!("`{table}` empty table");
                continue;
            }
            info!("`{table}` {mode}{dry_run}");
            let timer = Timer::new();
            match self.process_table(&table, &meta).await {
                Ok(()) => {
                    info!(
                        "`{table}` processed in {}",
                        format_duration(timer.elapsed())
                    );
                }
                Err(SyncError::Cancelled) => {
                    debug!("worker {} stop requested", self.id);
                    return false;
                }
                Err(e) => {
                    error!("`{table}` failed: {e}");
                    if !self.coord.config().no_fail {
                        self.coord.stop();
                    }
                    return false;
                }
            }
        }
        true
    }

    async fn process_table(&mut self, table: &str, meta: &TableMeta) -> Result<(), SyncError> {
        debug!("`{table}` start processing");
        let (update, mode, pk_bulk) = {
            let config = self.coord.config();
            (config.update, config.mode, config.pk_bulk)
        };
        // A table with no non-key columns has nothing to fingerprint; the
        // update phase degenerates to a no-op.
        let fingerprint = update && meta.non_key_count() > 0;
        let (src_loaded, dest_loaded) = {
            let coord = &self.coord;
            let source = &mut self.source;
            let target = &mut self.target;
            tokio::join!(
                load_keys(source, coord, table, meta, fingerprint, pk_bulk),
                load_keys(target, coord, table, meta, fingerprint, pk_bulk),
            )
        };
        let mut src_keys = src_loaded?;
        if !self.coord.can_run() {
            return Err(SyncError::Cancelled);
        }
        let mut dest_keys = dest_loaded?;
        if !self.coord.can_run() {
            return Err(SyncError::Cancelled);
        }
        let diff = compare_keys(table, &mut src_keys, &mut dest_keys);
        if !self.coord.can_run() {
            return Err(SyncError::Cancelled);
        }
        self.phase_add(table, meta, &src_keys, diff.only_source)
            .await?;
        if fingerprint {
            self.phase_update(table, meta, &mut src_keys, diff.common)
                .await?;
        }
        if mode == Mode::Sync {
            // Deletes run against the target, so the key names come from the
            // target side's metadata (validated position-equal at startup).
            let Some(target_meta) = self.coord.target_meta(table) else {
                return Err(SyncError::Metadata(format!(
                    "`{table}` target metadata missing"
                )));
            };
            self.phase_delete(table, &target_meta, &dest_keys, diff.only_target)
                .await?;
        }
        Ok(())
    }

    /// Streams rows that exist only on the source and inserts them into the
    /// target in batch-sized transactions.
    async fn phase_add(
        &mut self,
        table: &str,
        meta: &TableMeta,
        src_keys: &KeyTable,
        total: usize,
    ) -> Result<(), SyncError> {
        if total == 0 {
            return Ok(());
        }
        let config = self.coord.config();
        let timer = Timer::with_expected(total as u64);
        let key_names = meta.key_names();
        let mut batch = RowBatch::new(false, total.min(config.modify_bulk));
        let mut iter = src_keys.iter(true);
        let mut count = 0usize;
        self.target.insert_prepare(table, meta.columns.len()).await?;
        progress(table, &timer, "copy", 0, Some(total as u64));
        while count < total {
            if !self.coord.can_run() {
                return Err(SyncError::Cancelled);
            }
            let bulk = (total - count).min(config.modify_bulk);
            if count == 0 || bulk < config.modify_bulk {
                self.source.select_prepare(table, &key_names, bulk).await?;
            }
            batch.clear();
            let loaded = self
                .source
                .select_execute(table, src_keys, &mut iter, &mut batch)
                .await;
            if let Err(e) = loaded {
                error!("`{table}` select failed {}", self.source.last_error());
                return Err(e);
            }
            if batch.is_empty() {
                break;
            }
            progress(
                table,
                &timer,
                "copy load",
                (count + batch.len()) as u64,
                Some(total as u64),
            );
            self.target.transaction_begin().await?;
            for i in 0..batch.len() {
                let n = count + i + 1;
                if feedback(n, batch.len(), total) {
                    progress(table, &timer, "insert", n as u64, Some(total as u64));
                }
                trace!("`{table}` insert {n}: {}", batch.row_string(i));
                if let Err(e) = self.target.insert_execute(table, batch.at(i)).await {
                    error!(
                        "`{table}` insert failed {} {}",
                        batch.row_string(i),
                        self.target.last_error()
                    );
                    if !config.no_fail {
                        return Err(e);
                    }
                    self.coord.add_error(1);
                }
                if !self.coord.can_run() {
                    let _ = self.target.transaction_commit().await;
                    return Err(SyncError::Cancelled);
                }
            }
            self.target.transaction_commit().await?;
            count += batch.len();
            self.coord.add_rw(batch.len());
        }
        progress(table, &timer, "copied", count as u64, None);
        Ok(())
    }

    /// Finds common rows whose non-key payload differs, then rewrites them
    /// on the target.
    async fn phase_update(
        &mut self,
        table: &str,
        meta: &TableMeta,
        src_keys: &mut KeyTable,
        common: usize,
    ) -> Result<(), SyncError> {
        if common == 0 {
            return Ok(());
        }
        let config = self.coord.config();
        let mut timer = Timer::with_expected(common as u64);
        // The diff left common rows unflagged; flip so they become the
        // candidate set.
        src_keys.revert_flags();
        let candidates: Vec<usize> = src_keys.iter(true).collect();
        let mut src_compare = RowBatch::new(true, common.min(config.compare_bulk));
        let mut dest_compare = RowBatch::new(true, common.min(config.compare_bulk));
        progress(table, &timer, "compare fields md5", 0, Some(common as u64));
        let mut count = 0usize;
        for chunk in candidates.chunks(config.compare_bulk) {
            let bulk = chunk.len();
            if count == 0 || bulk < config.compare_bulk {
                self.source.compare_prepare(table, meta, bulk).await?;
                self.target.compare_prepare(table, meta, bulk).await?;
            }
            src_compare.clear();
            dest_compare.clear();
            let (src_loaded, dest_loaded) = {
                let source = &mut self.source;
                let target = &mut self.target;
                let keys: &KeyTable = src_keys;
                let mut src_iter = chunk.iter().copied();
                let mut dest_iter = chunk.iter().copied();
                tokio::join!(
                    source.select_execute(table, keys, &mut src_iter, &mut src_compare),
                    target.select_execute(table, keys, &mut dest_iter, &mut dest_compare),
                )
            };
            if src_loaded.is_err() || dest_loaded.is_err() {
                error!(
                    "`{table}` load md5 sum failed - source [{}] target [{}]",
                    self.source.last_error(),
                    self.target.last_error()
                );
                src_loaded?;
                dest_loaded?;
            }
            if src_compare.len() != dest_compare.len() {
                return Err(SyncError::Db(format!(
                    "`{table}` fingerprint row count mismatch [source {}] [target {}]",
                    src_compare.len(),
                    dest_compare.len()
                )));
            }
            self.coord.add_rw(src_compare.len() + dest_compare.len());
            for pos in 0..src_compare.len() {
                let index = chunk[pos];
                let src_row = src_compare.at(pos);
                let dest_row = dest_compare.at(pos);
                debug_assert!(src_row.matches(dest_row));
                let differs = match (src_row.fingerprint_value(), dest_row.fingerprint_value()) {
                    (Some(a), Some(b)) => a.partial_cmp(b) != Some(Ordering::Equal),
                    _ => {
                        return Err(SyncError::Db(format!(
                            "`{table}` fingerprint column missing from compare result"
                        )))
                    }
                };
                src_keys.set_flag(index, differs);
                count += 1;
            }
            if !self.coord.can_run() {
                return Err(SyncError::Cancelled);
            }
            progress(
                table,
                &timer,
                "comparing fields md5",
                count as u64,
                Some(common as u64),
            );
        }
        progress(
            table,
            &timer,
            "compared fields md5",
            common as u64,
            Some(common as u64),
        );

        let total = src_keys.size_of(true);
        if total == 0 {
            info!("`{table}` no record to update found");
            return Ok(());
        }
        info!("`{table}` {total} records to update found");
        timer.reset(total as u64);
        let key_names = meta.key_names();
        let src_keys: &KeyTable = src_keys;
        let mut batch = RowBatch::new(false, total.min(config.modify_bulk));
        let mut iter = src_keys.iter(true);
        let mut count = 0usize;
        progress(table, &timer, "update", 0, Some(total as u64));
        while count < total {
            if !self.coord.can_run() {
                return Err(SyncError::Cancelled);
            }
            let bulk = (total - count).min(config.modify_bulk);
            if count == 0 || bulk < config.modify_bulk {
                self.source.select_prepare(table, &key_names, bulk).await?;
            }
            batch.clear();
            let loaded = self
                .source
                .select_execute(table, src_keys, &mut iter, &mut batch)
                .await;
            if let Err(e) = loaded {
                error!("`{table}` select failed {}", self.source.last_error());
                return Err(e);
            }
            if batch.is_empty() {
                break;
            }
            self.coord.add_rw(batch.len());
            progress(
                table,
                &timer,
                "update load",
                (count + batch.len()) as u64,
                Some(total as u64),
            );
            if count == 0 {
                self.target
                    .update_prepare(table, &key_names, batch.column_names())
                    .await?;
            }
            self.target.transaction_begin().await?;
            for i in 0..batch.len() {
                let n = count + i + 1;
                if feedback(n, batch.len(), total) {
                    progress(table, &timer, "update", n as u64, Some(total as u64));
                }
                trace!("`{table}` update {n}: {}", batch.row_string(i));
                if let Err(e) = self.target.update_execute(table, batch.at_mut(i)).await {
                    error!(
                        "`{table}` update failed for {} {}",
                        batch.row_string(i),
                        self.target.last_error()
                    );
                    if !config.no_fail {
                        return Err(e);
                    }
                    self.coord.add_error(1);
                }
                if !self.coord.can_run() {
                    let _ = self.target.transaction_commit().await;
                    return Err(SyncError::Cancelled);
                }
            }
            self.target.transaction_commit().await?;
            count += batch.len();
            self.coord.add_rw(batch.len());
        }
        progress(table, &timer, "updated", count as u64, None);
        Ok(())
    }

    /// Removes target-only rows inside one transaction spanning the whole
    /// delete run of the table.
    async fn phase_delete(
        &mut self,
        table: &str,
        meta: &TableMeta,
        dest_keys: &KeyTable,
        total: usize,
    ) -> Result<(), SyncError> {
        if total == 0 {
            return Ok(());
        }
        let config = self.coord.config();
        let timer = Timer::with_expected(total as u64);
        let key_names = meta.key_names();
        self.target.delete_prepare(table, &key_names).await?;
        let mut count = 0usize;
        progress(table, &timer, "deleting", 0, Some(total as u64));
        self.target.transaction_begin().await?;
        for index in dest_keys.iter(true) {
            count += 1;
            if feedback(count, total, total) {
                progress(table, &timer, "deleting", count as u64, Some(total as u64));
            }
            trace!("`{table}` delete {count}: {}", dest_keys.row_string(index));
            if let Err(e) = self.target.delete_execute(table, dest_keys, index).await {
                error!(
                    "`{table}` delete failed {} {}",
                    dest_keys.row_string(index),
                    self.target.last_error()
                );
                if !config.no_fail {
                    return Err(e);
                }
                self.coord.add_error(1);
            }
            if !self.coord.can_run() {
                let _ = self.target.transaction_commit().await;
                return Err(SyncError::Cancelled);
            }
            self.coord.add_rw(1);
        }
        self.target.transaction_commit().await?;
        progress(table, &timer, "deleted", count as u64, None);
        Ok(())
    }
}

/// Loads one side's key projection and sorts it off the async runtime. The
/// two sides of a table run this concurrently on their own sessions.
async fn load_keys(
    session: &mut DbSession,
    coord: &Arc<Coordinator>,
    table: &str,
    meta: &TableMeta,
    fingerprint: bool,
    bulk: usize,
) -> Result<KeyTable, SyncError> {
    let capacity = bulk.min(1_000_000);
    let mut keys = KeyTable::new(fingerprint, capacity);
    session.load_pk(table, meta, &mut keys, bulk).await?;
    if !coord.can_run() {
        return Err(SyncError::Cancelled);
    }
    let side = session.label();
    let keys = tokio::task::spawn_blocking(move || {
        keys.sort(side);
        keys
    })
    .await
    .map_err(|e| SyncError::Db(format!("sort task failed: {e}")))?;
    coord.add_rw(keys.len());
    Ok(keys)
}

/// Progress cadence: batch boundaries always report, plus logarithmically
/// spaced row counts in between.
fn feedback(count: usize, bulk: usize, total: usize) -> bool {
    if count == total {
        return true;
    }
    if bulk > 0 && count % bulk == 0 {
        return true;
    }
    if count < 1_000 {
        return count % 100 == 0;
    }
    if count < 10_000 {
        return count % 1_000 == 0;
    }
    if count < 100_000 {
        return count % 10_000 == 0;
    }
    count % 100_000 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_reports_final_row() {
        assert!(feedback(17, 5000, 17));
    }

    #[test]
    fn feedback_reports_batch_boundaries() {
        assert!(feedback(5_000, 5_000, 1_000_000));
        assert!(feedback(10_000, 5_000, 1_000_000));
    }

    #[test]
    fn feedback_is_logarithmic_between_batches() {
        assert!(feedback(100, 7_777, 1_000_000));
        assert!(!feedback(150, 7_777, 1_000_000));
        assert!(feedback(2_000, 7_777, 1_000_000));
        assert!(!feedback(2_100, 7_777, 1_000_000));
        assert!(feedback(20_000, 7_777, 1_000_000));
        assert!(!feedback(21_000, 7_777, 1_000_000));
        assert!(feedback(200_000, 7_777, 1_000_000));
        assert!(!feedback(210_000, 7_777, 1_000_000));
    }
}
