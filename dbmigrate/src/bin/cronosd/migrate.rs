use crate::{banner, parse_databases, BANNER_WIDTH};
use clap::ArgMatches;
use cronos_dbmigrate::{
    migrate, parse_backend, parse_height_flag, temp_target_path, Error, HeightRange,
    MigrateOptions, COMETBFT_DATABASES, DB_APPLICATION,
};
use std::{path::PathBuf, time::Instant};
use tracing::{error, info};

pub const CMD: &str = "migrate-db";
pub const DATABASE_CMD: &str = "migrate";

/// Databases selected by `--db-type`.
fn databases_for_type(db_type: &str) -> Vec<String> {
    let mut databases = Vec::new();
    if db_type == "app" || db_type == "all" {
        databases.push(DB_APPLICATION.to_string());
    }
    if db_type == "cometbft" || db_type == "all" {
        databases.extend(COMETBFT_DATABASES.iter().map(|db| db.to_string()));
    }
    databases
}

pub fn run(matches: &ArgMatches) -> Result<(), Error> {
    let home = matches.get_one::<PathBuf>("home").unwrap();
    let target_home = matches.get_one::<PathBuf>("target-home").cloned();
    let source_backend = parse_backend(matches.get_one::<String>("source-backend").unwrap())?;
    let target_backend = parse_backend(matches.get_one::<String>("target-backend").unwrap())?;
    if source_backend == target_backend {
        return Err(Error::ConfigInvalid(format!(
            "source and target backend must differ (both {source_backend})"
        )));
    }
    let databases = match matches.get_one::<String>("databases") {
        Some(list) => parse_databases(list)?,
        None => databases_for_type(matches.get_one::<String>("db-type").unwrap()),
    };
    let height_range = match matches.get_one::<String>("height") {
        Some(height) => parse_height_flag(height)?,
        None => HeightRange::default(),
    };
    let batch_size = *matches.get_one::<usize>("batch-size").unwrap();
    let verify = *matches.get_one::<bool>("verify").unwrap();
    info!(
        home = %home.display(),
        %source_backend,
        %target_backend,
        databases = %databases.join(","),
        batch_size,
        verify,
        "migrating databases"
    );

    let started = Instant::now();
    let (mut total, mut processed, mut errors) = (0, 0, 0);
    let mut migrated: Vec<PathBuf> = Vec::new();
    let mut first_error = None;
    for db_name in &databases {
        let opts = MigrateOptions {
            source_home: home.clone(),
            target_home: target_home.clone(),
            source_backend,
            target_backend,
            db_name: db_name.clone(),
            batch_size,
            verify,
            height_range: height_range.clone(),
        };
        match migrate(&opts) {
            Ok(stats) => {
                total += stats.total_keys();
                processed += stats.processed_keys();
                errors += stats.error_count();
                migrated.push(temp_target_path(
                    target_home.as_deref().unwrap_or(home),
                    db_name,
                ));
            }
            Err(e) => {
                error!(database = %db_name, error=?e, "migration failed");
                first_error.get_or_insert(e);
            }
        }
    }

    if first_error.is_none() {
        banner("ALL MIGRATIONS COMPLETED SUCCESSFULLY");
    } else {
        banner("MIGRATION COMPLETED WITH ERRORS");
    }
    println!("Databases:       {}", databases.join(", "));
    if !height_range.is_empty() {
        println!("Height:          {height_range}");
    }
    println!("Total Keys:      {total}");
    println!("Processed Keys:  {processed}");
    println!("Errors:          {errors}");
    println!("Total Duration:  {:.2?}", started.elapsed());
    if !migrated.is_empty() {
        println!("{}", "=".repeat(BANNER_WIDTH));
        println!("IMPORTANT NEXT STEPS:");
        println!("1. Back up the original databases");
        println!("2. Check the migrated databases:");
        for path in &migrated {
            println!("   {}", path.display());
        }
        println!("3. Replace each original *.db directory with its .migrate-temp directory");
        println!("4. Set the node's database backend to {target_backend}");
        println!("{}", "=".repeat(BANNER_WIDTH));
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
