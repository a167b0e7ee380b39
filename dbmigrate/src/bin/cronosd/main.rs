//! Cronos database maintenance CLI

use clap::{Arg, ArgAction, Command};
use cronos_dbmigrate::{Error, DB_APPLICATION};
use std::{path::PathBuf, process::ExitCode};
use tracing::error;

mod migrate;
mod patch;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Parent of the `migrate` and `patch` subcommands
const DATABASE_CMD: &str = "database";

/// Width of the banners printed around summaries
const BANNER_WIDTH: usize = 80;

/// Every database a node home holds
const ALL_DATABASES: [&str; 5] = [DB_APPLICATION, "blockstore", "state", "tx_index", "evidence"];

/// Print `title` between two rules.
fn banner(title: &str) {
    let rule = "=".repeat(BANNER_WIDTH);
    println!();
    println!("{rule}");
    println!("{title}");
    println!("{rule}");
}

/// Parse a comma-separated list of database names, keeping the first occurrence of each.
fn parse_databases(list: &str) -> Result<Vec<String>, Error> {
    let mut databases: Vec<String> = Vec::new();
    for name in list.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        if !ALL_DATABASES.contains(&name) {
            return Err(Error::ConfigInvalid(format!(
                "invalid database: {name} (valid: {})",
                ALL_DATABASES.join(", ")
            )));
        }
        if !databases.iter().any(|db| db == name) {
            databases.push(name.to_string());
        }
    }
    if databases.is_empty() {
        return Err(Error::ConfigInvalid("no databases specified".into()));
    }
    Ok(databases)
}

fn backend_arg(name: &'static str, default: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .default_value(default)
        .help(help)
        .value_parser(clap::value_parser!(String))
}

fn batch_size_arg() -> Arg {
    Arg::new("batch-size")
        .long("batch-size")
        .default_value("10000")
        .help("Number of writes per batch (must be >= 1)")
        .value_parser(clap::builder::RangedU64ValueParser::<usize>::new().range(1..))
}

fn migrate_command(name: &'static str) -> Command {
    Command::new(name)
        .about("Copy databases to another backend. Each database is written to a `.migrate-temp` directory next to the original, which is left untouched.")
        .arg(
            Arg::new("home")
                .long("home")
                .visible_alias("source-home")
                .required(true)
                .help("Node home directory (holding data/)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("target-home")
                .long("target-home")
                .help("Home directory receiving the migrated databases (defaults to --home)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(backend_arg("source-backend", "goleveldb", "Backend of the existing databases"))
        .arg(backend_arg("target-backend", "rocksdb", "Backend of the migrated databases"))
        .arg(
            Arg::new("db-type")
                .long("db-type")
                .default_value("app")
                .help("Databases to migrate: app (application), cometbft (blockstore, state, tx_index, evidence) or all")
                .value_parser(["app", "cometbft", "all"]),
        )
        .arg(
            Arg::new("databases")
                .long("databases")
                .help("Comma-separated databases to migrate (overrides --db-type)")
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .help("Heights to migrate for blockstore and tx_index (e.g. 100, 100-200 or 100,150,200)")
                .value_parser(clap::value_parser!(String)),
        )
        .arg(batch_size_arg())
        .arg(
            Arg::new("verify")
                .long("verify")
                .action(ArgAction::Set)
                .default_value("true")
                .help("Compare source and target after copying")
                .value_parser(clap::value_parser!(bool)),
        )
}

fn patch_command(name: &'static str) -> Command {
    Command::new(name)
        .about("Copy selected heights of blockstore or tx_index into an existing database.")
        .arg(
            Arg::new("source-home")
                .long("source-home")
                .required(true)
                .help("Home directory of the node holding the heights (holding data/)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("target-path")
                .long("target-path")
                .required(true)
                .help("Database to patch: a *.db directory for one database, the data directory for several")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("database")
                .long("database")
                .required(true)
                .help("blockstore, tx_index or blockstore,tx_index")
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .required(true)
                .help("Heights to patch (e.g. 100, 100-200 or 100,150,200)")
                .value_parser(clap::value_parser!(String)),
        )
        .arg(backend_arg("source-backend", "goleveldb", "Backend of the source database"))
        .arg(backend_arg("target-backend", "rocksdb", "Backend of the database to patch"))
        .arg(batch_size_arg())
        .arg(
            Arg::new("conflict-strategy")
                .long("conflict-strategy")
                .default_value("ask")
                .help("What to do with keys that exist with a different value: ask, replace-all, skip-all or keep-target")
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("skip-conflict-checks")
                .long("skip-conflict-checks")
                .help("Overwrite without reading the target first")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Report what would be patched without writing")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("update-store-height")
                .long("update-store-height")
                .action(ArgAction::Set)
                .default_value("true")
                .help("Raise the block store height to the highest patched height")
                .value_parser(clap::value_parser!(bool)),
        )
}

/// Entrypoint for the Cronos database maintenance CLI
fn main() -> ExitCode {
    // Define application
    let matches = Command::new("cronosd")
        .version(crate_version())
        .about("Migrate and patch Cronos node databases.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(migrate_command(migrate::CMD))
        .subcommand(
            Command::new(DATABASE_CMD)
                .visible_alias("db")
                .about("Database maintenance.")
                .subcommand(migrate_command(migrate::DATABASE_CMD))
                .subcommand(patch_command(patch::CMD)),
        )
        .subcommand(patch_command(patch::LEGACY_CMD).hide(true))
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    let result = match matches.subcommand() {
        Some((migrate::CMD, matches)) => migrate::run(matches),
        Some((DATABASE_CMD, database)) => match database.subcommand() {
            Some((migrate::DATABASE_CMD, matches)) => migrate::run(matches),
            Some((patch::CMD, matches)) => patch::run(matches),
            Some((cmd, _)) => {
                error!(cmd, "invalid subcommand");
                return ExitCode::FAILURE;
            }
            None => {
                error!("no subcommand provided");
                return ExitCode::FAILURE;
            }
        },
        Some((patch::LEGACY_CMD, matches)) => patch::run(matches),
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
            return ExitCode::FAILURE;
        }
        None => {
            error!("no subcommand provided");
            return ExitCode::FAILURE;
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error=?e, "command failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_databases() {
        assert_eq!(
            parse_databases("blockstore, tx_index,blockstore").unwrap(),
            vec!["blockstore".to_string(), "tx_index".to_string()]
        );
        assert!(matches!(
            parse_databases("blockstore,wal"),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(parse_databases(" , "), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_commands() {
        migrate_command(migrate::CMD).debug_assert();
        patch_command(patch::CMD).debug_assert();
    }
}
