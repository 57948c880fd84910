//! Row-level table replicator for MySQL and MariaDB.
//!
//! Given two schemas reachable through independent connections, makes the
//! target's contents of a configured set of tables agree with the source
//! using only primary keys and the declared column list of each table.
//! Table structure is never altered.
//!
//! # Features
//!
//! - Copy mode: rows present only on the source are inserted
//! - Sync mode: copy plus deletion of target-only rows
//! - Update detection: rows sharing a primary key are compared through a
//!   server-side MD5 fingerprint of their non-key columns
//! - Parallel workers: tables are dispatched to a pool, each worker owning
//!   one source and one target connection
//! - Dry run: drives every read and transaction without touching the target
//!
//! # CLI Usage
//!
//! ```bash
//! # preview a full sync with update detection
//! row-sync --sync --update --dry-run \
//!   --fromHost db1 --fromUser u --fromPwd p --fromSchema prod \
//!   --toHost db2 --toUser u --toPwd p --toSchema replica
//!
//! # copy two tables with four workers
//! row-sync --copy --tables orders customers --jobs 4 \
//!   --fromHost db1 --fromUser u --fromPwd p --fromSchema prod \
//!   --toHost db2 --toUser u --toPwd p --toSchema replica
//! ```

pub mod cli;
pub mod coordinator;
pub mod db;
pub mod diff;
pub mod error;
pub mod keys;
pub mod progress;
pub mod record;
pub mod schema;
pub mod value;
pub mod worker;

pub use cli::Cli;
pub use coordinator::{install_signal_handlers, Coordinator, Mode, OperationConfig};
pub use db::{DbSession, Endpoint};
pub use diff::{compare_keys, DiffCounts};
pub use error::SyncError;
pub use keys::{KeyIter, KeyTable};
pub use record::{RecordRow, RowBatch};
pub use schema::{ColumnMeta, TableMeta};
pub use value::{SqlType, TypedValue};
