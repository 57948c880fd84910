use std::sync::Arc;

use clap::{CommandFactory, Parser};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use row_sync::cli::{exit, Cli};
use row_sync::progress::{format_duration, peak_memory_usage, Timer};
use row_sync::{install_signal_handlers, Coordinator, DbSession};

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit::OK,
                _ => exit::USAGE,
            };
            let _ = e.print();
            return code;
        }
    };

    if cli.mode_count() > 1 {
        eprintln!("only one mode argument allowed [help|version|copy|sync]");
        return exit::MODE;
    }
    if cli.version {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return exit::OK;
    }
    let Some(mode) = cli.mode() else {
        let _ = Cli::command().print_help();
        return exit::OK;
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_filter.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match cli.operation_config(mode) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let source_endpoint = match cli.source_endpoint() {
        Ok(endpoint) => endpoint,
        Err(code) => return code,
    };
    let target_endpoint = match cli.target_endpoint() {
        Ok(endpoint) => endpoint,
        Err(code) => return code,
    };

    // Bootstrap sessions: table list, metadata validation and the
    // session-level SETs around the whole run.
    let mut source = match DbSession::open("source", &source_endpoint, false).await {
        Ok(session) => session,
        Err(e) => {
            eprintln!("{e}");
            return exit::SOURCE_CONNECT;
        }
    };
    let mut target = match DbSession::open("target", &target_endpoint, config.dry_run).await {
        Ok(session) => session,
        Err(e) => {
            eprintln!("{e}");
            return exit::TARGET_CONNECT;
        }
    };
    let source_tables = match source.load_table_names().await {
        Ok(tables) => tables,
        Err(e) => {
            eprintln!("cannot load source table list: {e}");
            return exit::SOURCE_TABLES;
        }
    };
    let target_tables = match target.load_table_names().await {
        Ok(tables) => tables,
        Err(e) => {
            eprintln!("cannot load target table list: {e}");
            return exit::TARGET_TABLES;
        }
    };

    let mut coordinator = Coordinator::new(config, source_endpoint, target_endpoint);
    if coordinator
        .check_tables(&source_tables, &target_tables)
        .is_err()
    {
        return exit::TABLE_CHECK;
    }
    if coordinator
        .check_metadata(&mut source, &mut target)
        .await
        .is_err()
    {
        return exit::METADATA_CHECK;
    }
    let coordinator = Arc::new(coordinator);

    if let Err(e) = install_signal_handlers(Arc::clone(&coordinator)) {
        eprintln!("{e}");
        return exit::SIGNALS;
    }

    let timer = Timer::new();
    if coordinator.pre_execute(&mut target).await.is_err() {
        summary(&coordinator, &timer);
        return exit::PRE_EXECUTE;
    }

    let ok = Arc::clone(&coordinator).run_workers().await;

    if let Err(e) = coordinator.post_execute(&mut target).await {
        warn!("session restore failed: {e}");
    }
    source.disconnect().await;
    target.disconnect().await;

    summary(&coordinator, &timer);
    if ok && coordinator.error_count() == 0 {
        exit::OK
    } else {
        exit::EXECUTE
    }
}

fn summary(coordinator: &Coordinator, timer: &Timer) {
    println!(
        "{} database reads+writes in {} [errors: {}] [peak RSS: {}]",
        coordinator.rw_count(),
        format_duration(timer.elapsed()),
        coordinator.error_count(),
        peak_memory_usage()
    );
}
