//! Whole-run control plane.
//!
//! Owns the validated table set, the shared metadata maps, the worker pool
//! and the cooperative cancellation flag. Workers pull table names from the
//! dispatch queue one at a time; the mutex guards only the in-memory set
//! extraction, never a network round-trip.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::db::{target_session_init, target_session_restore, DbSession, Endpoint};
use crate::error::SyncError;
use crate::schema::TableMeta;
use crate::worker::TableWorker;

/// Replication mode: copy only inserts, sync also deletes target-only rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Copy,
    Sync,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Copy => f.write_str("copy"),
            Mode::Sync => f.write_str("sync"),
        }
    }
}

/// Run-wide configuration, fixed after argument validation.
#[derive(Debug, Clone)]
pub struct OperationConfig {
    pub mode: Mode,
    pub update: bool,
    pub dry_run: bool,
    pub disable_bin_log: bool,
    pub no_fail: bool,
    pub tables: Vec<String>,
    pub jobs: usize,
    pub pk_bulk: usize,
    pub compare_bulk: usize,
    pub modify_bulk: usize,
}

impl fmt::Display for OperationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[mode: {}] [update: {}] [dryRun: {}] [tables: {}] [disableBinLog: {}] [noFail: {}]",
            self.mode,
            self.update,
            self.dry_run,
            self.tables.join(","),
            self.disable_bin_log,
            self.no_fail
        )
    }
}

/// The single control-plane object shared by every worker.
pub struct Coordinator {
    config: OperationConfig,
    source: Endpoint,
    target: Endpoint,
    tables: Mutex<BTreeSet<String>>,
    source_meta: HashMap<String, TableMeta>,
    target_meta: HashMap<String, TableMeta>,
    run: AtomicBool,
    db_rw: AtomicU64,
    errors: AtomicU64,
}

impl Coordinator {
    pub fn new(config: OperationConfig, source: Endpoint, target: Endpoint) -> Self {
        Coordinator {
            config,
            source,
            target,
            tables: Mutex::new(BTreeSet::new()),
            source_meta: HashMap::new(),
            target_meta: HashMap::new(),
            run: AtomicBool::new(true),
            db_rw: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &OperationConfig {
        &self.config
    }

    pub fn source_endpoint(&self) -> &Endpoint {
        &self.source
    }

    pub fn target_endpoint(&self) -> &Endpoint {
        &self.target
    }

    pub fn source_meta(&self, table: &str) -> Option<TableMeta> {
        self.source_meta.get(table).cloned()
    }

    pub fn target_meta(&self, table: &str) -> Option<TableMeta> {
        self.target_meta.get(table).cloned()
    }

    /// Resolves the table set to process: the user filter (or all source
    /// tables), each confirmed to exist on both sides. Every missing table
    /// is reported before failing.
    pub fn check_tables(&mut self, src: &[String], dest: &[String]) -> Result<(), SyncError> {
        let mut selected = BTreeSet::new();
        let mut ok = true;
        if self.config.tables.is_empty() {
            debug!("tables filter empty - using all tables from source");
            selected.extend(src.iter().cloned());
        } else {
            debug!("tables filter: {}", self.config.tables.join(", "));
            for name in &self.config.tables {
                let name = name.trim();
                if src.iter().any(|t| t == name) {
                    selected.insert(name.to_string());
                } else {
                    error!("table `{name}` not found in source");
                    ok = false;
                }
            }
        }
        if ok {
            for name in &selected {
                if !dest.iter().any(|t| t == name) {
                    error!("table `{name}` not found in target");
                    ok = false;
                }
            }
        }
        if !ok {
            self.run.store(false, Ordering::Release);
            return Err(SyncError::Validation("table check failed".into()));
        }
        info!(
            "tables to process: {}",
            selected.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        *lock(&self.tables) = selected;
        Ok(())
    }

    /// Loads the column metadata of every selected table on both sides and
    /// verifies position-wise compatibility.
    pub async fn check_metadata(
        &mut self,
        source: &mut DbSession,
        target: &mut DbSession,
    ) -> Result<(), SyncError> {
        let tables = lock(&self.tables).clone();
        let source_meta = source.load_metadata(&tables).await?;
        source.log_table_info(&source_meta);
        let target_meta = target.load_metadata(&tables).await?;
        target.log_table_info(&target_meta);
        let mut ok = true;
        for table in &tables {
            let (Some(src), Some(dest)) = (source_meta.get(table), target_meta.get(table)) else {
                error!("table \"{table}\" metadata missing");
                ok = false;
                continue;
            };
            for mismatch in src.mismatches(dest) {
                error!("table \"{table}\" {mismatch}");
                ok = false;
            }
        }
        if !ok {
            self.run.store(false, Ordering::Release);
            return Err(SyncError::Validation("metadata check failed".into()));
        }
        self.source_meta = source_meta;
        self.target_meta = target_meta;
        Ok(())
    }

    /// Atomically extracts one table name, or `None` when the queue is
    /// drained or a shutdown was requested.
    pub fn table_to_process(&self) -> Option<String> {
        if !self.can_run() {
            return None;
        }
        lock(&self.tables).pop_first()
    }

    pub fn tables_count(&self) -> usize {
        lock(&self.tables).len()
    }

    pub fn can_run(&self) -> bool {
        self.run.load(Ordering::Acquire)
    }

    /// Requests a cooperative shutdown; idempotent and async-signal friendly.
    pub fn stop(&self) {
        if self.run.swap(false, Ordering::AcqRel) {
            info!("shutdown requested");
        }
    }

    pub fn add_rw(&self, count: usize) {
        self.db_rw.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn rw_count(&self) -> u64 {
        self.db_rw.load(Ordering::Relaxed)
    }

    pub fn add_error(&self, count: usize) {
        self.errors.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Disables unique / foreign-key checks (and optionally the binary log)
    /// on the bootstrap target session before any worker dispatch.
    pub async fn pre_execute(&self, target: &mut DbSession) -> Result<(), SyncError> {
        target_session_init(target, self.config.disable_bin_log).await
    }

    /// Restores the session flags changed by [`Coordinator::pre_execute`].
    pub async fn post_execute(&self, target: &mut DbSession) -> Result<(), SyncError> {
        target_session_restore(target, self.config.disable_bin_log).await
    }

    /// Spawns `min(tables, jobs)` workers and waits for all of them.
    /// Returns whether every worker completed cleanly. The first failed
    /// worker flips the cancellation flag unless failures are tolerated.
    pub async fn run_workers(self: Arc<Self>) -> bool {
        let jobs = match self.config.jobs {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        };
        let workers = jobs.min(self.tables_count()).max(1);
        info!("processing with {workers} parallel workers");
        let mut pool = JoinSet::new();
        for id in 0..workers {
            let coord = Arc::clone(&self);
            pool.spawn(async move {
                match TableWorker::connect(coord, id).await {
                    Ok(worker) => worker.run().await,
                    Err(e) => {
                        error!("worker {id} failed to start: {e}");
                        false
                    }
                }
            });
        }
        let mut ok = true;
        while let Some(joined) = pool.join_next().await {
            let worker_ok = joined.unwrap_or(false);
            if !worker_ok {
                ok = false;
                if !self.config.no_fail {
                    self.stop();
                }
            }
        }
        ok
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Routes SIGINT / SIGTERM / SIGQUIT to [`Coordinator::stop`].
pub fn install_signal_handlers(coord: Arc<Coordinator>) -> Result<(), SyncError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())
            .map_err(|e| SyncError::Db(format!("signal handler install failed: {e}")))?;
        let mut quit = signal(SignalKind::quit())
            .map_err(|e| SyncError::Db(format!("signal handler install failed: {e}")))?;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
                _ = quit.recv() => {}
            }
            coord.stop();
        });
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                coord.stop();
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "localhost".into(),
            port: 3306,
            user: "root".into(),
            password: "root".into(),
            schema: "test".into(),
        }
    }

    fn config(tables: Vec<String>) -> OperationConfig {
        OperationConfig {
            mode: Mode::Sync,
            update: false,
            dry_run: false,
            disable_bin_log: false,
            no_fail: false,
            tables,
            jobs: 1,
            pk_bulk: 10_000_000,
            compare_bulk: 10_000,
            modify_bulk: 5_000,
        }
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_filter_takes_all_source_tables() {
        let mut coord = Coordinator::new(config(vec![]), endpoint(), endpoint());
        coord
            .check_tables(&names(&["a", "b"]), &names(&["a", "b", "c"]))
            .unwrap();
        assert_eq!(coord.tables_count(), 2);
    }

    #[test]
    fn filter_must_exist_on_both_sides() {
        let mut coord = Coordinator::new(config(names(&["a", "x"])), endpoint(), endpoint());
        let err = coord.check_tables(&names(&["a", "b"]), &names(&["a", "b"]));
        assert!(matches!(err, Err(SyncError::Validation(_))));
        assert!(!coord.can_run());

        let mut coord = Coordinator::new(config(names(&["a"])), endpoint(), endpoint());
        let err = coord.check_tables(&names(&["a"]), &names(&["b"]));
        assert!(matches!(err, Err(SyncError::Validation(_))));
    }

    #[test]
    fn filter_entries_are_trimmed() {
        let mut coord = Coordinator::new(config(names(&[" a ", "b"])), endpoint(), endpoint());
        coord
            .check_tables(&names(&["a", "b"]), &names(&["a", "b"]))
            .unwrap();
        assert_eq!(coord.tables_count(), 2);
    }

    #[test]
    fn dispatch_queue_drains_in_order_and_respects_stop() {
        let mut coord = Coordinator::new(config(vec![]), endpoint(), endpoint());
        coord
            .check_tables(&names(&["b", "a", "c"]), &names(&["a", "b", "c"]))
            .unwrap();
        assert_eq!(coord.table_to_process(), Some("a".to_string()));
        coord.stop();
        assert_eq!(coord.table_to_process(), None);
        assert_eq!(coord.tables_count(), 2);
    }

    #[test]
    fn stop_is_idempotent() {
        let coord = Coordinator::new(config(vec![]), endpoint(), endpoint());
        assert!(coord.can_run());
        coord.stop();
        coord.stop();
        assert!(!coord.can_run());
    }

    #[test]
    fn counters_accumulate() {
        let coord = Coordinator::new(config(vec![]), endpoint(), endpoint());
        coord.add_rw(6);
        coord.add_rw(6);
        coord.add_error(1);
        assert_eq!(coord.rw_count(), 12);
        assert_eq!(coord.error_count(), 1);
    }
}
