use crate::{banner, parse_databases, BANNER_WIDTH};
use clap::ArgMatches;
use cronos_dbmigrate::{
    display::{format_key, format_value},
    filter::supports_height_filtering,
    parse_backend, parse_height_flag, patch_database, update_block_store_height, Conflict,
    ConflictResolver, ConflictStrategy, Error, PatchOptions, Resolution, DB_BLOCKSTORE,
    DB_EXTENSION,
};
use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{info, warn};

pub const CMD: &str = "patch";
pub const LEGACY_CMD: &str = "patchdb";

/// Resolves conflicts by asking on stdin.
struct Prompt<R> {
    input: R,
}

impl<R: BufRead> Prompt<R> {
    fn print(conflict: &Conflict<'_>) {
        banner("KEY CONFLICT DETECTED");
        println!("Database:       {}", conflict.db_name);
        match conflict.height {
            Some(height) => println!(
                "Key:            {} (height {height})",
                format_key(conflict.key, 80)
            ),
            None => println!("Key:            {}", format_key(conflict.key, 80)),
        }
        println!("Existing size:  {} bytes", conflict.existing.len());
        println!("New size:       {} bytes", conflict.incoming.len());
        println!("Existing:       {}", format_value(conflict.existing, 100));
        println!("New:            {}", format_value(conflict.incoming, 100));
        println!("{}", "=".repeat(BANNER_WIDTH));
    }
}

impl<R: BufRead> ConflictResolver for Prompt<R> {
    fn resolve(&mut self, conflict: &Conflict<'_>) -> Result<Resolution, Error> {
        Self::print(conflict);
        loop {
            print!("Choose [(r)eplace, (s)kip, (R)eplace all, (S)kip all, (a)bort]: ");
            io::stdout().flush()?;
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                // Closed input cannot answer any further conflicts
                return Ok(Resolution::Abort);
            }
            let resolution = match line.trim() {
                "r" | "replace" => Resolution::Replace,
                "s" | "skip" => Resolution::Skip,
                "R" | "replace all" => Resolution::ReplaceAll,
                "S" | "skip all" => Resolution::SkipAll,
                "a" | "A" | "abort" => Resolution::Abort,
                other => {
                    println!("Invalid choice: {other:?}");
                    continue;
                }
            };
            return Ok(resolution);
        }
    }
}

/// Where each database is patched.
fn target_paths(target_path: &Path, databases: &[String]) -> Result<Vec<PathBuf>, Error> {
    if let [db_name] = databases {
        if !target_path.to_string_lossy().ends_with(DB_EXTENSION) {
            return Err(Error::ConfigInvalid(format!(
                "--target-path must be a {DB_EXTENSION} directory when patching {db_name}: {}",
                target_path.display()
            )));
        }
        return Ok(vec![target_path.to_path_buf()]);
    }
    if target_path.to_string_lossy().ends_with(DB_EXTENSION) {
        return Err(Error::ConfigInvalid(format!(
            "--target-path must be a data directory when patching multiple databases: {}",
            target_path.display()
        )));
    }
    Ok(databases
        .iter()
        .map(|db_name| target_path.join(format!("{db_name}{DB_EXTENSION}")))
        .collect())
}

pub fn run(matches: &ArgMatches) -> Result<(), Error> {
    let source_home = matches.get_one::<PathBuf>("source-home").unwrap();
    let target_path = matches.get_one::<PathBuf>("target-path").unwrap();
    let source_backend = parse_backend(matches.get_one::<String>("source-backend").unwrap())?;
    let target_backend = parse_backend(matches.get_one::<String>("target-backend").unwrap())?;
    let databases = parse_databases(matches.get_one::<String>("database").unwrap())?;
    if let Some(db_name) = databases.iter().find(|db| !supports_height_filtering(db)) {
        return Err(Error::UnsupportedForPatch(db_name.clone()));
    }
    let height_range = parse_height_flag(matches.get_one::<String>("height").unwrap())?;
    if height_range.is_empty() {
        return Err(Error::ConfigInvalid(
            "height range is required for patching".into(),
        ));
    }
    let batch_size = *matches.get_one::<usize>("batch-size").unwrap();
    let dry_run = matches.get_flag("dry-run");
    let skip_conflict_checks = matches.get_flag("skip-conflict-checks");
    let update_store_height = *matches.get_one::<bool>("update-store-height").unwrap();
    let mut conflict_strategy: ConflictStrategy = matches
        .get_one::<String>("conflict-strategy")
        .unwrap()
        .parse()?;
    if dry_run && conflict_strategy == ConflictStrategy::Ask {
        // Nothing is written, so count conflicting keys as they would be written
        conflict_strategy = ConflictStrategy::ReplaceAll;
    }
    let targets = target_paths(target_path, &databases)?;
    info!(
        source_home = %source_home.display(),
        target = %target_path.display(),
        databases = %databases.join(","),
        %height_range,
        %conflict_strategy,
        dry_run,
        "patching databases"
    );

    let started = Instant::now();
    let mut resolver = Prompt {
        input: io::stdin().lock(),
    };
    let (mut processed, mut skipped, mut errors) = (0, 0, 0);
    for (db_name, target) in databases.iter().zip(&targets) {
        let opts = PatchOptions {
            source_home: source_home.clone(),
            target_path: target.clone(),
            source_backend,
            target_backend,
            db_name: db_name.clone(),
            height_range: height_range.clone(),
            batch_size,
            conflict_strategy,
            skip_conflict_checks,
            dry_run,
        };
        let stats = patch_database(&opts, &mut resolver)?;
        processed += stats.processed_keys();
        skipped += stats.skipped_keys();
        errors += stats.error_count();
        info!(
            database = %db_name,
            processed = stats.processed_keys(),
            skipped = stats.skipped_keys(),
            errors = stats.error_count(),
            duration = ?stats.duration(),
            "patched database"
        );

        let highest = stats.highest_height();
        if db_name == DB_BLOCKSTORE && update_store_height && !dry_run && highest > 0 {
            if update_block_store_height(target, target_backend, highest)? {
                info!(height = highest, "raised block store height");
            }
        } else if db_name == DB_BLOCKSTORE && !update_store_height {
            warn!("block store height left unchanged");
        }
    }

    if dry_run {
        banner("DATABASE PATCH DRY RUN COMPLETED");
    } else {
        banner("DATABASE PATCH COMPLETED SUCCESSFULLY");
    }
    println!("Mode:            {}", if dry_run { "DRY RUN" } else { "PATCH" });
    println!("Databases:       {}", databases.join(", "));
    println!("Height:          {height_range}");
    if dry_run {
        println!("Keys Found:      {processed}");
    } else {
        println!("Keys Patched:    {processed}");
    }
    println!("Keys Skipped:    {skipped}");
    println!("Errors:          {errors}");
    println!("Total Duration:  {:.2?}", started.elapsed());
    println!("{}", "=".repeat(BANNER_WIDTH));
    if dry_run {
        println!("This was a dry run. No changes were made to the target database.");
    } else {
        println!("The target database has been updated with the patched heights.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn conflict() -> Conflict<'static> {
        Conflict {
            db_name: DB_BLOCKSTORE,
            key: b"C:4",
            height: Some(4),
            existing: b"old",
            incoming: b"new",
        }
    }

    #[test]
    fn test_prompt_answers() {
        let mut prompt = Prompt {
            input: Cursor::new("x\nR\n"),
        };
        assert_eq!(prompt.resolve(&conflict()).unwrap(), Resolution::ReplaceAll);

        let mut prompt = Prompt {
            input: Cursor::new("s\n"),
        };
        assert_eq!(prompt.resolve(&conflict()).unwrap(), Resolution::Skip);
    }

    #[test]
    fn test_prompt_closed_input_aborts() {
        let mut prompt = Prompt {
            input: Cursor::new(""),
        };
        assert_eq!(prompt.resolve(&conflict()).unwrap(), Resolution::Abort);
    }

    #[test]
    fn test_target_paths() {
        let single = target_paths(Path::new("/node/data/blockstore.db"), &["blockstore".into()]);
        assert_eq!(single.unwrap(), vec![PathBuf::from("/node/data/blockstore.db")]);

        assert!(matches!(
            target_paths(Path::new("/node/data"), &["blockstore".into()]),
            Err(Error::ConfigInvalid(_))
        ));

        let both = target_paths(
            Path::new("/node/data"),
            &["blockstore".into(), "tx_index".into()],
        )
        .unwrap();
        assert_eq!(
            both,
            vec![
                PathBuf::from("/node/data/blockstore.db"),
                PathBuf::from("/node/data/tx_index.db"),
            ]
        );
    }

    #[test]
    fn test_target_paths_rejects_db_dir_for_multiple_databases() {
        assert!(matches!(
            target_paths(
                Path::new("/node/data/blockstore.db"),
                &["blockstore".into(), "tx_index".into()],
            ),
            Err(Error::ConfigInvalid(_))
        ));
    }
}
