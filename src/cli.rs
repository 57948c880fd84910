//! Command-line surface and exit-code mapping.
//!
//! Exactly one of `--copy`, `--sync`, `--help`, `--version` selects the run
//! mode. Everything that can fail before a connection is opened maps to a
//! distinct exit code so wrapper scripts can tell the failure classes
//! apart.

use clap::Parser;

use crate::coordinator::{Mode, OperationConfig};
use crate::db::Endpoint;

/// Process exit codes.
pub mod exit {
    pub const OK: i32 = 0;
    pub const USAGE: i32 = 1;
    pub const MODE: i32 = 2;
    pub const PK_BULK: i32 = 3;
    pub const COMPARE_BULK: i32 = 4;
    pub const MODIFY_BULK: i32 = 5;
    pub const SOURCE_ARGS: i32 = 10;
    pub const SOURCE_CONNECT: i32 = 11;
    pub const SOURCE_TABLES: i32 = 12;
    pub const TARGET_ARGS: i32 = 20;
    pub const TARGET_CONNECT: i32 = 21;
    pub const TARGET_TABLES: i32 = 22;
    pub const TABLE_CHECK: i32 = 30;
    pub const METADATA_CHECK: i32 = 31;
    pub const PRE_EXECUTE: i32 = 40;
    pub const SIGNALS: i32 = 50;
    pub const EXECUTE: i32 = 100;
}

#[derive(Parser, Debug)]
#[command(
    name = "row-sync",
    about = "Row-level table replicator for MySQL and MariaDB",
    disable_version_flag = true,
    allow_negative_numbers = true
)]
pub struct Cli {
    /// copy records from source to target
    #[arg(short, long)]
    pub copy: bool,

    /// sync records from source to target
    #[arg(short, long)]
    pub sync: bool,

    /// print version
    #[arg(short = 'v', long)]
    pub version: bool,

    /// execute without modifying the target database
    #[arg(short, long)]
    pub dry_run: bool,

    /// refresh rows whose non-key columns differ
    #[arg(short, long)]
    pub update: bool,

    /// keep processing after a failed row
    #[arg(long)]
    pub nofail: bool,

    /// disable binary logging on target sessions
    #[arg(long)]
    pub disablebinlog: bool,

    /// source database host IP or name
    #[arg(long = "fromHost")]
    pub from_host: Option<String>,

    /// source database port
    #[arg(long = "fromPort", default_value_t = 3306)]
    pub from_port: u16,

    /// source database username
    #[arg(long = "fromUser")]
    pub from_user: Option<String>,

    /// source database password
    #[arg(long = "fromPwd")]
    pub from_pwd: Option<String>,

    /// source database schema
    #[arg(long = "fromSchema")]
    pub from_schema: Option<String>,

    /// target database host IP or name
    #[arg(long = "toHost")]
    pub to_host: Option<String>,

    /// target database port
    #[arg(long = "toPort", default_value_t = 3306)]
    pub to_port: u16,

    /// target database username
    #[arg(long = "toUser")]
    pub to_user: Option<String>,

    /// target database password
    #[arg(long = "toPwd")]
    pub to_pwd: Option<String>,

    /// target database schema
    #[arg(long = "toSchema")]
    pub to_schema: Option<String>,

    /// tables to process (default: all common tables)
    #[arg(long, num_args = 0..)]
    pub tables: Vec<String>,

    /// parallel table workers (0 = hardware concurrency)
    #[arg(long, default_value_t = 1)]
    pub jobs: usize,

    /// rows per primary-key page read
    #[arg(long = "pkBulk", default_value_t = 10_000_000)]
    pub pk_bulk: i64,

    /// key tuples per fingerprint select
    #[arg(long = "compareBulk", default_value_t = 10_000)]
    pub compare_bulk: i64,

    /// rows per record select and per target transaction
    #[arg(long = "modifyBulk", default_value_t = 5_000)]
    pub modify_bulk: i64,

    /// tracing filter directives (overridden by RUST_LOG)
    #[arg(long = "logFilter", default_value = "info")]
    pub log_filter: String,
}

impl Cli {
    /// Number of mode flags given; more than one is an argument error.
    pub fn mode_count(&self) -> usize {
        usize::from(self.copy) + usize::from(self.sync) + usize::from(self.version)
    }

    pub fn mode(&self) -> Option<Mode> {
        if self.copy {
            Some(Mode::Copy)
        } else if self.sync {
            Some(Mode::Sync)
        } else {
            None
        }
    }

    /// Builds the run configuration, rejecting non-positive bulk sizes.
    pub fn operation_config(&self, mode: Mode) -> Result<OperationConfig, i32> {
        if self.pk_bulk <= 0 {
            eprintln!("pkBulk must be positive");
            return Err(exit::PK_BULK);
        }
        if self.compare_bulk <= 0 {
            eprintln!("compareBulk must be positive");
            return Err(exit::COMPARE_BULK);
        }
        if self.modify_bulk <= 0 {
            eprintln!("modifyBulk must be positive");
            return Err(exit::MODIFY_BULK);
        }
        Ok(OperationConfig {
            mode,
            update: self.update,
            dry_run: self.dry_run,
            disable_bin_log: self.disablebinlog,
            no_fail: self.nofail,
            tables: self.tables.clone(),
            jobs: self.jobs,
            pk_bulk: self.pk_bulk as usize,
            compare_bulk: self.compare_bulk as usize,
            modify_bulk: self.modify_bulk as usize,
        })
    }

    pub fn source_endpoint(&self) -> Result<Endpoint, i32> {
        endpoint(
            "source",
            &self.from_host,
            self.from_port,
            &self.from_user,
            &self.from_pwd,
            &self.from_schema,
        )
        .ok_or(exit::SOURCE_ARGS)
    }

    pub fn target_endpoint(&self) -> Result<Endpoint, i32> {
        endpoint(
            "target",
            &self.to_host,
            self.to_port,
            &self.to_user,
            &self.to_pwd,
            &self.to_schema,
        )
        .ok_or(exit::TARGET_ARGS)
    }
}

fn endpoint(
    side: &str,
    host: &Option<String>,
    port: u16,
    user: &Option<String>,
    password: &Option<String>,
    schema: &Option<String>,
) -> Option<Endpoint> {
    match (host, user, password, schema) {
        (Some(host), Some(user), Some(password), Some(schema)) => Some(Endpoint {
            host: host.clone(),
            port,
            user: user.clone(),
            password: password.clone(),
            schema: schema.clone(),
        }),
        _ => {
            eprintln!("missing {side} connection arguments (host, user, password, schema)");
            None
        }
    }
}
