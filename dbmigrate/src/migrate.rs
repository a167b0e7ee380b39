//! Copy a logical database into a fresh directory on another backend.

use crate::{
    db_path,
    display::format_key,
    filter::{
        get_blockstore_iterators, get_tx_index_iterator, increment_bytes, should_include_key,
        BLOCK_HASH_PREFIX, BLOCK_STORE_STATE_KEY,
    },
    Error, HeightRange, MigrationStats, DB_APPLICATION, DB_BLOCKSTORE, DEFAULT_BATCH_SIZE,
};
use cronos_kv::{open, Backend, Config, Database, KvIterator};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Suffix appended to the target directory of a migration.
const MIGRATE_TEMP_SUFFIX: &str = ".migrate-temp";

/// Interval between progress reports.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts made when reopening a database for verification.
const REOPEN_ATTEMPTS: u32 = 5;

/// Delay before the first reopen retry (doubled after every failure).
const REOPEN_DELAY: Duration = Duration::from_millis(50);

/// Number of individual verification failures logged before going quiet.
const MISMATCH_LOG_LIMIT: u64 = 10;

/// Options for [migrate].
#[derive(Clone, Debug)]
pub struct MigrateOptions {
    /// Home directory holding `data/{db_name}.db`.
    pub source_home: PathBuf,

    /// Home directory receiving `data/{db_name}.db.migrate-temp` (defaults to `source_home`).
    pub target_home: Option<PathBuf>,

    /// Engine of the source database.
    pub source_backend: Backend,

    /// Engine of the new database.
    pub target_backend: Backend,

    /// Logical database to copy.
    pub db_name: String,

    /// Writes staged per batch (`0` selects [DEFAULT_BATCH_SIZE]).
    pub batch_size: usize,

    /// Compare source and target after copying.
    pub verify: bool,

    /// Heights to copy (ignored for databases whose keys carry no height).
    pub height_range: HeightRange,
}

impl MigrateOptions {
    /// Migrate the application database of `source_home` with default settings.
    pub fn new(source_home: impl AsRef<Path>, source_backend: Backend, target_backend: Backend) -> Self {
        Self {
            source_home: source_home.as_ref().to_path_buf(),
            target_home: None,
            source_backend,
            target_backend,
            db_name: DB_APPLICATION.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            verify: true,
            height_range: HeightRange::default(),
        }
    }

    fn target_home(&self) -> &Path {
        self.target_home.as_deref().unwrap_or(&self.source_home)
    }

    fn batch_size(&self) -> usize {
        if self.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            self.batch_size
        }
    }

    fn filtered(&self) -> bool {
        !self.height_range.is_empty() && crate::filter::supports_height_filtering(&self.db_name)
    }
}

/// Directory a migration of `db_name` writes into: `{target_home}/data/{db_name}.db.migrate-temp`.
pub fn temp_target_path(target_home: &Path, db_name: &str) -> PathBuf {
    let mut path = db_path(target_home, db_name).into_os_string();
    path.push(MIGRATE_TEMP_SUFFIX);
    PathBuf::from(path)
}

/// Copy `opts.db_name` from the source home into a new `.migrate-temp` directory.
///
/// The source is opened read-only and never modified. The caller swaps the temporary directory
/// into place. On [Error::VerificationFailed] the temporary directory is left for inspection.
pub fn migrate(opts: &MigrateOptions) -> Result<MigrationStats, Error> {
    for backend in [opts.source_backend, opts.target_backend] {
        if !backend.is_persistent() {
            return Err(Error::ConfigInvalid(format!(
                "backend {backend} cannot be used for an on-disk database"
            )));
        }
    }
    opts.height_range.validate()?;

    let source_path = db_path(&opts.source_home, &opts.db_name);
    let target_path = temp_target_path(opts.target_home(), &opts.db_name);
    if target_path.exists() {
        return Err(Error::ConfigInvalid(format!(
            "migration target already exists: {}",
            target_path.display()
        )));
    }
    if opts.filtered() {
        info!(
            database = %opts.db_name,
            height_range = %opts.height_range,
            "restricting migration to heights"
        );
    } else if !opts.height_range.is_empty() {
        warn!(
            database = %opts.db_name,
            "height filtering not supported for this database, migrating all keys"
        );
    }
    info!(
        database = %opts.db_name,
        source = %source_path.display(),
        source_backend = %opts.source_backend,
        target = %target_path.display(),
        target_backend = %opts.target_backend,
        "starting database migration"
    );

    // Copy (both handles are released before verification reopens them)
    let stats = MigrationStats::new();
    {
        let source = open(&Config::read_only(opts.source_backend, &source_path))?;
        let target = open(&Config::read_write(opts.target_backend, &target_path))?;
        copy(source.as_ref(), target.as_ref(), opts, &stats)?;
        target.flush()?;
        source.close()?;
        target.close()?;
    }
    stats.finish();
    info!(
        database = %opts.db_name,
        total = stats.total_keys(),
        processed = stats.processed_keys(),
        errors = stats.error_count(),
        duration = ?stats.duration(),
        "copied database"
    );

    if opts.verify {
        let mismatches = verify(opts, &source_path, &target_path)?;
        if mismatches > 0 {
            warn!(database = %opts.db_name, mismatches, duration = ?stats.duration(), "verification failed");
            return Err(Error::VerificationFailed {
                mismatches,
                target: target_path,
            });
        }
        info!(database = %opts.db_name, "verification passed");
    }
    Ok(stats)
}

/// Scans over the keys selected by `opts`.
///
/// Unfiltered migrations scan the whole database. Filtered block store migrations scan each
/// height prefix within its bounds plus the block hash index and store state, which carry no
/// height. Filtered tx_index migrations scan the `tx.height/` keys within bounds.
fn scans<'a>(db: &'a dyn Database, opts: &MigrateOptions) -> Result<Vec<KvIterator<'a>>, Error> {
    if !opts.filtered() {
        return Ok(vec![db.iterator(None, None)?]);
    }
    if opts.db_name != DB_BLOCKSTORE {
        return Ok(vec![get_tx_index_iterator(db, &opts.height_range)?]);
    }
    let mut scans: Vec<KvIterator<'a>> = get_blockstore_iterators(db, &opts.height_range)?
        .into_iter()
        .map(|(_, iter)| iter)
        .collect();
    let hashes_end = increment_bytes(BLOCK_HASH_PREFIX);
    scans.push(db.iterator(Some(BLOCK_HASH_PREFIX), hashes_end.as_deref())?);
    if let Some(state) = db.get(BLOCK_STORE_STATE_KEY)? {
        let state = Ok::<_, cronos_kv::Error>((BLOCK_STORE_STATE_KEY.to_vec(), state));
        scans.push(Box::new(std::iter::once(state)));
    }
    Ok(scans)
}

fn copy(
    source: &dyn Database,
    target: &dyn Database,
    opts: &MigrateOptions,
    stats: &MigrationStats,
) -> Result<(), Error> {
    // Count keys for progress reporting
    let mut total = 0;
    for scan in scans(source, opts)? {
        for item in scan {
            item?;
            total += 1;
        }
    }
    stats.set_total(total);
    info!(database = %opts.db_name, total, "counted keys to migrate");

    let batch_size = opts.batch_size();
    let mut batch = target.new_batch();
    let mut last_report = Instant::now();
    for item in scans(source, opts)?.into_iter().flatten() {
        let (key, value) = item?;
        if let Err(err) = batch.set(&key, &value) {
            stats.add_error();
            warn!(key = %format_key(&key, 80), error = %err, "failed to stage key");
            continue;
        }
        if batch.len() >= batch_size {
            let staged = batch.len() as u64;
            batch.write()?;
            stats.add_processed(staged);
            debug!(staged, "wrote batch");
        }
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            info!(
                database = %opts.db_name,
                processed = stats.processed_keys(),
                total = stats.total_keys(),
                progress = %format!("{:.2}%", stats.progress()),
                errors = stats.error_count(),
                "migration progress"
            );
            last_report = Instant::now();
        }
    }
    if !batch.is_empty() {
        let staged = batch.len() as u64;
        batch.write()?;
        stats.add_processed(staged);
    }
    Ok(())
}

fn open_with_retry(cfg: &Config) -> Result<Arc<dyn Database>, Error> {
    let mut delay = REOPEN_DELAY;
    let mut attempt = 1;
    loop {
        match open(cfg) {
            Ok(db) => return Ok(db),
            Err(err) if attempt < REOPEN_ATTEMPTS => {
                debug!(path = %cfg.path.display(), attempt, error = %err, "failed to reopen database, retrying");
                thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Compare source and target in both directions, returning the number of mismatches.
fn verify(opts: &MigrateOptions, source_path: &Path, target_path: &Path) -> Result<u64, Error> {
    info!(database = %opts.db_name, "verifying migration");
    let source = open_with_retry(&Config::read_only(opts.source_backend, source_path))?;
    let target = open_with_retry(&Config::read_only(opts.target_backend, target_path))?;
    let filtered = opts.filtered();
    let include = |key: &[u8]| !filtered || should_include_key(key, &opts.db_name, &opts.height_range);

    // Every selected source key must be present in the target with the same value
    let mut mismatches = 0;
    let mut checked = 0u64;
    for item in scans(source.as_ref(), opts)?.into_iter().flatten() {
        let (key, value) = item?;
        checked += 1;
        let reason = match target.get(&key)? {
            None => "missing in target",
            Some(found) if found != value => "value differs",
            Some(_) => continue,
        };
        mismatches += 1;
        if mismatches <= MISMATCH_LOG_LIMIT {
            warn!(key = %format_key(&key, 80), reason, "verification mismatch");
        }
    }
    info!(checked, mismatches, "verified source keys");

    // Every target key must come from the source (and from the selected heights)
    let mut extra = 0u64;
    for item in target.iterator(None, None)? {
        let (key, _) = item?;
        if include(key.as_slice()) && source.has(&key)? {
            continue;
        }
        extra += 1;
        if extra <= MISMATCH_LOG_LIMIT {
            warn!(key = %format_key(&key, 80), "unexpected key in target");
        }
    }
    info!(extra, "verified target keys");
    Ok(mismatches + extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_height_flag, DB_TX_INDEX};
    use std::fs;

    fn seed(home: &Path, db_name: &str, backend: Backend, pairs: &[(Vec<u8>, Vec<u8>)]) {
        let path = db_path(home, db_name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let db = open(&Config::read_write(backend, &path)).unwrap();
        let mut batch = db.new_batch();
        for (k, v) in pairs {
            batch.set(k, v).unwrap();
        }
        batch.write().unwrap();
        db.close().unwrap();
    }

    fn read_all(backend: Backend, path: &Path) -> Vec<(Vec<u8>, Vec<u8>)> {
        let db = open(&Config::read_only(backend, path)).unwrap();
        let pairs = db.iterator(None, None).unwrap().map(|r| r.unwrap()).collect();
        pairs
    }

    // Both ends on sled keeps the tests independent of the rocksdb feature
    fn options(home: &Path) -> MigrateOptions {
        MigrateOptions::new(home, Backend::Sled, Backend::Sled)
    }

    #[test]
    fn test_temp_target_path() {
        assert_eq!(
            temp_target_path(Path::new("/node"), "application"),
            PathBuf::from("/node/data/application.db.migrate-temp")
        );
    }

    #[test]
    fn test_migrate_tiny_db() {
        let home = tempfile::tempdir().unwrap();
        let pairs: Vec<_> = (0..100)
            .map(|i| {
                (
                    format!("key-{i:06}").into_bytes(),
                    format!("value-{i:06}-payload").into_bytes(),
                )
            })
            .collect();
        seed(home.path(), DB_APPLICATION, Backend::Sled, &pairs);

        let mut opts = options(home.path());
        opts.batch_size = 10;
        let stats = migrate(&opts).unwrap();
        assert_eq!(stats.total_keys(), 100);
        assert_eq!(stats.processed_keys(), 100);
        assert_eq!(stats.error_count(), 0);
        assert_eq!(stats.progress(), 100.0);

        let copied = read_all(Backend::Sled, &temp_target_path(home.path(), DB_APPLICATION));
        assert_eq!(copied, pairs);
    }

    #[test]
    fn test_migrate_empty_db() {
        let home = tempfile::tempdir().unwrap();
        seed(home.path(), DB_APPLICATION, Backend::Sled, &[]);
        let stats = migrate(&options(home.path())).unwrap();
        assert_eq!(stats.total_keys(), 0);
        assert_eq!(stats.processed_keys(), 0);
    }

    #[test]
    fn test_migrate_binary_payloads() {
        let home = tempfile::tempdir().unwrap();
        let big = vec![0xA5; 1 << 20];
        let pairs = vec![
            (b"\x00nul\x00key".to_vec(), b"v".to_vec()),
            (b"large".to_vec(), big),
        ];
        seed(home.path(), DB_APPLICATION, Backend::Sled, &pairs);
        migrate(&options(home.path())).unwrap();
        let copied = read_all(Backend::Sled, &temp_target_path(home.path(), DB_APPLICATION));
        assert_eq!(copied, pairs);
    }

    #[test]
    fn test_migrate_height_filtered_blockstore() {
        let home = tempfile::tempdir().unwrap();
        let mut pairs = vec![(b"BS:H".to_vec(), b"state".to_vec())];
        for h in 1..=12u64 {
            pairs.push((format!("H:{h}").into_bytes(), b"meta".to_vec()));
            pairs.push((format!("C:{h}").into_bytes(), b"commit".to_vec()));
        }
        seed(home.path(), DB_BLOCKSTORE, Backend::Sled, &pairs);

        let mut opts = options(home.path());
        opts.db_name = DB_BLOCKSTORE.into();
        opts.height_range = parse_height_flag("2-10").unwrap();
        let stats = migrate(&opts).unwrap();
        assert_eq!(stats.processed_keys(), 1 + 2 * 9);

        let copied = read_all(Backend::Sled, &temp_target_path(home.path(), DB_BLOCKSTORE));
        let keys: Vec<_> = copied.iter().map(|(k, _)| k.clone()).collect();
        assert!(keys.contains(&b"BS:H".to_vec()));
        assert!(keys.contains(&b"H:10".to_vec()));
        assert!(!keys.contains(&b"H:1".to_vec()));
        assert!(!keys.contains(&b"H:11".to_vec()));
    }

    #[test]
    fn test_migrate_height_filtered_tx_index() {
        let home = tempfile::tempdir().unwrap();
        let mut pairs = vec![(b"\x8a\x01hash".to_vec(), b"record".to_vec())];
        for h in 1..=20u64 {
            pairs.push((format!("tx.height/{h}/{h}/0").into_bytes(), b"hash".to_vec()));
        }
        seed(home.path(), DB_TX_INDEX, Backend::Sled, &pairs);

        let mut opts = options(home.path());
        opts.db_name = DB_TX_INDEX.into();
        opts.height_range = parse_height_flag("11-15").unwrap();
        let stats = migrate(&opts).unwrap();
        assert_eq!(stats.total_keys(), 5);
        assert_eq!(stats.processed_keys(), 5);

        // Only the bounded tx.height scan is copied
        let copied = read_all(Backend::Sled, &temp_target_path(home.path(), DB_TX_INDEX));
        let keys: Vec<_> = copied
            .iter()
            .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
            .collect();
        assert_eq!(
            keys,
            vec![
                "tx.height/11/11/0",
                "tx.height/12/12/0",
                "tx.height/13/13/0",
                "tx.height/14/14/0",
                "tx.height/15/15/0",
            ]
        );
    }

    #[test]
    fn test_duration_stops_before_verification_returns() {
        let home = tempfile::tempdir().unwrap();
        seed(
            home.path(),
            DB_APPLICATION,
            Backend::Sled,
            &[(b"a".to_vec(), b"1".to_vec())],
        );
        let stats = migrate(&options(home.path())).unwrap();
        let first = stats.duration();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.duration(), first);
    }

    #[test]
    fn test_migrate_refuses_existing_target() {
        let home = tempfile::tempdir().unwrap();
        seed(home.path(), DB_APPLICATION, Backend::Sled, &[]);
        fs::create_dir_all(temp_target_path(home.path(), DB_APPLICATION)).unwrap();
        assert!(matches!(
            migrate(&options(home.path())),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_migrate_missing_source() {
        let home = tempfile::tempdir().unwrap();
        assert!(matches!(
            migrate(&options(home.path())),
            Err(Error::Kv(cronos_kv::Error::NotFound(_)))
        ));
    }

    #[test]
    fn test_migrate_rejects_memdb() {
        let home = tempfile::tempdir().unwrap();
        let opts = MigrateOptions::new(home.path(), Backend::MemDb, Backend::Sled);
        assert!(matches!(migrate(&opts), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_verify_detects_divergence() {
        let home = tempfile::tempdir().unwrap();
        let pairs = vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())];
        seed(home.path(), DB_APPLICATION, Backend::Sled, &pairs);
        let mut opts = options(home.path());
        opts.verify = false;
        migrate(&opts).unwrap();

        // Tamper with the copy: change one value and add a stray key
        let target = temp_target_path(home.path(), DB_APPLICATION);
        {
            let db = open(&Config::existing(Backend::Sled, &target)).unwrap();
            db.set(b"a", b"changed").unwrap();
            db.set(b"zzz", b"stray").unwrap();
            db.close().unwrap();
        }
        let source = db_path(home.path(), DB_APPLICATION);
        assert_eq!(verify(&opts, &source, &target).unwrap(), 2);
    }
}
