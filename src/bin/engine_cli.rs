//! Manual driver for the storage engine: open a table, run one operation,
//! shut down. Running it twice against the same files - once without a
//! clean shutdown - exercises crash recovery by hand.
//!
//! Usage:
//!   engine_cli <table_path> <wal_path> <logmsg_path> put <key> <value>
//!   engine_cli <table_path> <wal_path> <logmsg_path> get <key>
//!   engine_cli <table_path> <wal_path> <logmsg_path> delete <key>
//!   engine_cli <table_path> <wal_path> <logmsg_path> scan <begin> <end>
//!   engine_cli <table_path> <wal_path> <logmsg_path> bulk_insert <count>
//!   engine_cli <table_path> <wal_path> <logmsg_path> txn_update <key> <value>
//!
//! Set `ENGINE_RECOVERY=redo_crash:<n>` or `ENGINE_RECOVERY=undo_crash:<n>`
//! to run recovery in one of the simulated-crash modes instead of normal.

use std::env;
use std::process::exit;
use wal_btree_engine::{Engine, EngineConfig, RecoveryMode};

fn recovery_mode_from_env() -> RecoveryMode {
    let Ok(spec) = env::var("ENGINE_RECOVERY") else {
        return RecoveryMode::Normal;
    };
    let Some((kind, count)) = spec.split_once(':') else {
        return RecoveryMode::Normal;
    };
    let Ok(after) = count.parse::<usize>() else {
        return RecoveryMode::Normal;
    };
    match kind {
        "redo_crash" => RecoveryMode::RedoCrash { after },
        "undo_crash" => RecoveryMode::UndoCrash { after },
        _ => RecoveryMode::Normal,
    }
}

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();

    if args.len() < 5 {
        eprintln!("Usage: engine_cli <table_path> <wal_path> <logmsg_path> <command> [args...]");
        eprintln!("Commands:");
        eprintln!("  put <key> <value>");
        eprintln!("  get <key>");
        eprintln!("  delete <key>");
        eprintln!("  scan <begin> <end>");
        eprintln!("  bulk_insert <count>");
        eprintln!("  txn_update <key> <value>  - update inside its own committed transaction");
        exit(1);
    }

    let table_path = &args[1];
    let wal_path = &args[2];
    let logmsg_path = &args[3];
    let command = &args[4];

    let config = EngineConfig::new(wal_path, logmsg_path)
        .table_path(table_path)
        .recovery_mode(recovery_mode_from_env());

    let engine = match Engine::init(config) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("ERROR: failed to initialize engine: {e}");
            exit(1);
        }
    };
    let table = match engine.open_table(table_path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("ERROR: failed to open table: {e}");
            exit(1);
        }
    };

    let result = run_command(&engine, table, command, &args[5..]);
    if let Err(e) = result {
        eprintln!("ERROR: {e}");
        exit(1);
    }

    if let Err(e) = engine.shutdown() {
        eprintln!("Warning: shutdown failed: {e}");
    }
}

fn run_command(
    engine: &Engine,
    table: wal_btree_engine::TableId,
    command: &str,
    rest: &[String],
) -> wal_btree_engine::Result<()> {
    match command {
        "put" => {
            let [key, value] = require_args(rest, "put <key> <value>");
            engine.insert(table, key.parse().expect("key must be an integer"), value.into_bytes())?;
            println!("OK");
        }
        "get" => {
            let [key] = require_args::<1>(rest, "get <key>");
            match engine.find(table, key.parse().expect("key must be an integer"), None)? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("NOT_FOUND"),
            }
        }
        "delete" => {
            let [key] = require_args::<1>(rest, "delete <key>");
            engine.delete(table, key.parse().expect("key must be an integer"))?;
            println!("DELETED");
        }
        "scan" => {
            let [begin, end] = require_args(rest, "scan <begin> <end>");
            let results = engine.scan(
                table,
                begin.parse().expect("begin must be an integer"),
                end.parse().expect("end must be an integer"),
            )?;
            println!("COUNT: {}", results.len());
            for (key, value) in results {
                println!("{key} -> {}", String::from_utf8_lossy(&value));
            }
        }
        "bulk_insert" => {
            let [count] = require_args::<1>(rest, "bulk_insert <count>");
            let count: i64 = count.parse().expect("count must be an integer");
            let start = std::time::Instant::now();
            for key in 0..count {
                let mut value = format!("value_{key:08}").into_bytes();
                value.resize(wal_btree_engine::types::MIN_VAL_SIZE, b'_');
                engine.insert(table, key, value)?;
            }
            let elapsed = start.elapsed();
            println!("INSERTED: {count}");
            println!("TIME_MS: {}", elapsed.as_millis());
        }
        "txn_update" => {
            let [key, value] = require_args(rest, "txn_update <key> <value>");
            let trx = engine.begin_transaction();
            match engine.update(table, key.parse().expect("key must be an integer"), value.into_bytes(), trx) {
                Ok(old_size) => {
                    engine.commit_transaction(trx)?;
                    println!("OK (old size {old_size})");
                }
                Err(e) => {
                    let _ = engine.abort_transaction(trx);
                    eprintln!("update failed, transaction aborted: {e}");
                }
            }
        }
        other => {
            eprintln!("Unknown command: {other}");
            exit(1);
        }
    }
    Ok(())
}

fn require_args<const N: usize>(rest: &[String], usage: &str) -> [String; N] {
    match <[String; N]>::try_from(rest.to_vec()) {
        Ok(args) => args,
        Err(_) => {
            eprintln!("Usage: engine_cli <table_path> <wal_path> <logmsg_path> {usage}");
            exit(1);
        }
    }
}
