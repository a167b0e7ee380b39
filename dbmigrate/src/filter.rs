//! Classify CometBFT keys by height and build height-bounded scans.
//!
//! # Format
//!
//! Block store keys:
//!
//! ```text
//! H:<height>               block meta
//! P:<height>:<part>        block part
//! C:<height>               commit
//! SC:<height>              seen commit
//! EC:<height>              extended commit
//! BH:<hash>                height by block hash (no height in key)
//! BS:H                     store state (no height in key)
//! ```
//!
//! Transaction index keys:
//!
//! ```text
//! tx.height/<height>/<height>/<index>[$es$<seq>]
//! ```
//!
//! Heights are decimal strings, so `[prefix + start, prefix + (end + 1))` also admits longer
//! numbers that sort inside the window (`H:10` lies between `H:1` and `H:2`). Callers must re-check
//! every key with [extract_height_from_blockstore_key] or [extract_height_from_tx_index_key].

use crate::{HeightRange, DB_BLOCKSTORE, DB_TX_INDEX};
use cronos_kv::{Database, Error, KvIterator};

/// Block store prefixes that carry a height.
pub const BLOCKSTORE_PREFIXES: [&str; 5] = ["H:", "P:", "C:", "SC:", "EC:"];

/// Prefix of height-indexed transaction keys.
pub const TX_HEIGHT_PREFIX: &str = "tx.height/";

/// Prefix of Ethereum transaction hash index keys.
pub const ETH_TX_HASH_PREFIX: &str = "ethereum_tx.ethereumTxHash/";

/// Key holding the block store base and height.
pub const BLOCK_STORE_STATE_KEY: &[u8] = b"BS:H";

/// Prefix of block-hash-to-height keys.
pub const BLOCK_HASH_PREFIX: &[u8] = b"BH:";

/// Upper bound for `tx.height/` scans that are unbounded above (`~` sorts after digits and `/`).
const TX_HEIGHT_UPPER: &str = "tx.height/~";

fn parse_decimal(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Extract the height embedded in a block store key.
pub fn extract_height_from_blockstore_key(key: &[u8]) -> Option<u64> {
    if key.starts_with(b"BH:") || key.starts_with(b"BS:") {
        return None;
    }
    if let Some(rest) = key.strip_prefix(b"P:") {
        let end = rest.iter().position(|b| *b == b':').unwrap_or(rest.len());
        return parse_decimal(&rest[..end]);
    }
    for prefix in ["H:", "C:", "SC:", "EC:"] {
        if let Some(rest) = key.strip_prefix(prefix.as_bytes()) {
            return parse_decimal(rest);
        }
    }
    None
}

/// Extract the height embedded in a `tx.height/` key.
pub fn extract_height_from_tx_index_key(key: &[u8]) -> Option<u64> {
    let rest = key.strip_prefix(TX_HEIGHT_PREFIX.as_bytes())?;
    let end = rest.iter().position(|b| *b == b'/').unwrap_or(rest.len());
    parse_decimal(&rest[..end])
}

/// Extract `(height, tx_index)` from a `tx.height/<h>/<h>/<index>[$es$<seq>]` key.
pub fn extract_height_and_tx_index(key: &[u8]) -> Option<(u64, u64)> {
    let rest = std::str::from_utf8(key.strip_prefix(TX_HEIGHT_PREFIX.as_bytes())?).ok()?;
    let mut parts = rest.split('/');
    let height = parse_decimal(parts.next()?.as_bytes())?;
    let _ = parts.next()?;
    let index = parts.next()?;
    let index = index.split("$es$").next()?;
    Some((height, parse_decimal(index.as_bytes())?))
}

/// Returns true if keys of `db_name` embed a height.
pub fn supports_height_filtering(db_name: &str) -> bool {
    db_name == DB_BLOCKSTORE || db_name == DB_TX_INDEX
}

/// Extract the height of `key` according to the schema of `db_name`.
pub fn extract_height(db_name: &str, key: &[u8]) -> Option<u64> {
    match db_name {
        DB_BLOCKSTORE => extract_height_from_blockstore_key(key),
        DB_TX_INDEX => extract_height_from_tx_index_key(key),
        _ => None,
    }
}

/// Returns true if `key` belongs in a copy restricted to `range`.
///
/// Keys without a height (metadata) always pass, as does everything in a database whose keys
/// carry no height.
pub fn should_include_key(key: &[u8], db_name: &str, range: &HeightRange) -> bool {
    if range.is_empty() || !supports_height_filtering(db_name) {
        return true;
    }
    match extract_height(db_name, key) {
        Some(height) => range.is_within_range(height),
        None => true,
    }
}

/// Scan bounds `[lower, upper)` covering every key under `prefix` whose height (followed by
/// `suffix`) is in `range`.
///
/// When `start` and `end + 1` have the same number of digits the window is tight. Otherwise the
/// whole prefix is scanned, since a lexicographic window cannot cover numbers of different widths.
fn height_bounds(prefix: &str, suffix: &str, range: &HeightRange, unbounded: &[u8]) -> KvBounds {
    let (start, end) = range.bounds();
    let whole = (prefix.as_bytes().to_vec(), unbounded.to_vec());
    if start == 0 || end == 0 {
        return whole;
    }
    let (lower, upper) = (start.to_string(), end.saturating_add(1).to_string());
    if lower.len() != upper.len() {
        return whole;
    }
    (
        format!("{prefix}{lower}{suffix}").into_bytes(),
        format!("{prefix}{upper}{suffix}").into_bytes(),
    )
}

type KvBounds = (Vec<u8>, Vec<u8>);

/// Scan bounds for one block store prefix.
pub fn blockstore_bounds(prefix: &str, range: &HeightRange) -> KvBounds {
    let mut unbounded = prefix.as_bytes().to_vec();
    unbounded.extend_from_slice(&[0xFF; 8]);
    height_bounds(prefix, "", range, &unbounded)
}

/// Scan bounds for the `tx.height/` keys.
pub fn tx_index_bounds(range: &HeightRange) -> KvBounds {
    height_bounds(TX_HEIGHT_PREFIX, "/", range, TX_HEIGHT_UPPER.as_bytes())
}

fn filtered<'a>(
    db: &'a dyn Database,
    (lower, upper): KvBounds,
    range: HeightRange,
    extract: fn(&[u8]) -> Option<u64>,
) -> Result<KvIterator<'a>, Error> {
    let iter = db.iterator(Some(lower.as_slice()), Some(upper.as_slice()))?;
    Ok(Box::new(iter.filter(move |item| match item {
        Ok((key, _)) => extract(key).is_some_and(|h| range.is_within_range(h)),
        Err(_) => true,
    })))
}

/// One scan per block store prefix in [BLOCKSTORE_PREFIXES].
pub fn get_blockstore_iterators<'a>(
    db: &'a dyn Database,
    range: &HeightRange,
) -> Result<Vec<(&'static str, KvIterator<'a>)>, Error> {
    BLOCKSTORE_PREFIXES
        .iter()
        .map(|prefix| -> Result<_, Error> {
            let iter = filtered(
                db,
                blockstore_bounds(prefix, range),
                range.clone(),
                extract_height_from_blockstore_key,
            )?;
            Ok((*prefix, iter))
        })
        .collect()
}

/// A scan over the `tx.height/` keys selected by `range`.
pub fn get_tx_index_iterator<'a>(
    db: &'a dyn Database,
    range: &HeightRange,
) -> Result<KvIterator<'a>, Error> {
    filtered(
        db,
        tx_index_bounds(range),
        range.clone(),
        extract_height_from_tx_index_key,
    )
}

/// Find the block hash inside an encoded `BlockMeta`.
///
/// Looks for field 1 (`BlockID`, length-delimited) whose first field is the hash
/// (`0x0a <len> 0x0a <hash_len> <hash>`), accepting hash lengths of 20 to 64 bytes.
pub fn extract_block_hash(value: &[u8]) -> Option<Vec<u8>> {
    if value.len() < 35 {
        return None;
    }
    for i in 0..value.len() - 34 {
        if value[i] != 0x0a {
            continue;
        }
        let block_id_len = value[i + 1] as usize;
        if i + 2 + block_id_len > value.len() || value[i + 2] != 0x0a {
            continue;
        }
        let hash_len = value[i + 3] as usize;
        if (20..=64).contains(&hash_len) && i + 4 + hash_len <= value.len() {
            return Some(value[i + 4..i + 4 + hash_len].to_vec());
        }
    }
    None
}

/// The smallest key greater than every key prefixed by `bytes`, if one exists.
pub fn increment_bytes(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut out = bytes.to_vec();
    while let Some(last) = out.pop() {
        if last < 0xFF {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronos_kv::MemDb;
    use test_case::test_case;

    #[test_case(b"H:123", Some(123); "meta")]
    #[test_case(b"P:77:3", Some(77); "part")]
    #[test_case(b"P:77", Some(77); "part without index")]
    #[test_case(b"C:5", Some(5); "commit")]
    #[test_case(b"SC:9", Some(9); "seen commit")]
    #[test_case(b"EC:11", Some(11); "extended commit")]
    #[test_case(b"BH:\x01\x02\x03", None; "block hash")]
    #[test_case(b"BS:H", None; "store state")]
    #[test_case(b"H:", None; "no digits")]
    #[test_case(b"H:12x", None; "trailing garbage")]
    #[test_case(b"XX:1", None; "unknown prefix")]
    fn test_extract_blockstore(key: &[u8], expected: Option<u64>) {
        assert_eq!(extract_height_from_blockstore_key(key), expected);
    }

    #[test_case(b"tx.height/100/100/0", Some(100); "index key")]
    #[test_case(b"tx.height/100/100/0$es$1", Some(100); "event sequence")]
    #[test_case(b"tx.height/42", Some(42); "bare")]
    #[test_case(b"tx.height/", None; "empty")]
    #[test_case(b"tx.hash/abc", None; "other index")]
    fn test_extract_tx_index(key: &[u8], expected: Option<u64>) {
        assert_eq!(extract_height_from_tx_index_key(key), expected);
    }

    #[test]
    fn test_extract_height_and_tx_index() {
        assert_eq!(
            extract_height_and_tx_index(b"tx.height/15/15/3$es$0"),
            Some((15, 3))
        );
        assert_eq!(extract_height_and_tx_index(b"tx.height/15/15/2"), Some((15, 2)));
        assert_eq!(extract_height_and_tx_index(b"tx.height/15"), None);
    }

    #[test]
    fn test_should_include_key() {
        let range = HeightRange::range(10, 20);
        assert!(should_include_key(b"H:15", DB_BLOCKSTORE, &range));
        assert!(!should_include_key(b"H:25", DB_BLOCKSTORE, &range));
        assert!(should_include_key(b"BS:H", DB_BLOCKSTORE, &range));
        assert!(should_include_key(b"H:25", "application", &range));
        assert!(should_include_key(b"H:25", DB_BLOCKSTORE, &HeightRange::default()));
        assert!(!should_include_key(b"tx.height/9/9/0", DB_TX_INDEX, &range));
    }

    #[test]
    fn test_blockstore_bounds() {
        let (lower, upper) = blockstore_bounds("H:", &HeightRange::range(10000, 20000));
        assert_eq!(lower, b"H:10000".to_vec());
        assert_eq!(upper, b"H:20001".to_vec());

        let (lower, upper) = blockstore_bounds("P:", &HeightRange::range(10, 0));
        assert_eq!(lower, b"P:".to_vec());
        assert_eq!(upper, [b"P:".as_slice(), [0xFF; 8].as_slice()].concat());

        // Different widths fall back to the whole prefix
        let (lower, _) = blockstore_bounds("C:", &HeightRange::range(5, 15));
        assert_eq!(lower, b"C:".to_vec());
    }

    #[test]
    fn test_tx_index_bounds() {
        let (lower, upper) = tx_index_bounds(&HeightRange::range(11, 15));
        assert_eq!(lower, b"tx.height/11/".to_vec());
        assert_eq!(upper, b"tx.height/16/".to_vec());

        let (_, upper) = tx_index_bounds(&HeightRange::range(11, 0));
        assert_eq!(upper, b"tx.height/~".to_vec());
    }

    #[test]
    fn test_blockstore_iterators_reject_false_positives() {
        let db = MemDb::default();
        for h in [1u64, 2, 10, 11, 20, 100] {
            db.set(format!("H:{h}").as_bytes(), b"meta").unwrap();
            db.set(format!("P:{h}:0").as_bytes(), b"part").unwrap();
        }
        db.set(b"BS:H", b"state").unwrap();

        let range = HeightRange::range(1, 2);
        let mut seen = Vec::new();
        for (_, iter) in get_blockstore_iterators(&db, &range).unwrap() {
            for item in iter {
                seen.push(String::from_utf8(item.unwrap().0).unwrap());
            }
        }
        assert_eq!(seen, vec!["H:1", "H:2", "P:1:0", "P:2:0"]);

        let specific = HeightRange::heights(vec![10, 100]);
        let keys: Vec<_> = get_blockstore_iterators(&db, &specific)
            .unwrap()
            .into_iter()
            .flat_map(|(_, iter)| iter.map(|r| r.unwrap().0))
            .collect();
        assert_eq!(
            keys,
            vec![
                b"H:10".to_vec(),
                b"H:100".to_vec(),
                // '0' sorts before ':'
                b"P:100:0".to_vec(),
                b"P:10:0".to_vec()
            ]
        );
    }

    #[test]
    fn test_tx_index_iterator() {
        let db = MemDb::default();
        for h in [9u64, 10, 11, 15, 16, 110] {
            db.set(format!("tx.height/{h}/{h}/0").as_bytes(), b"hash").unwrap();
        }
        db.set(b"tx.hash/x", b"record").unwrap();
        let keys: Vec<_> = get_tx_index_iterator(&db, &HeightRange::range(10, 15))
            .unwrap()
            .map(|r| String::from_utf8(r.unwrap().0).unwrap())
            .collect();
        assert_eq!(
            keys,
            vec!["tx.height/10/10/0", "tx.height/11/11/0", "tx.height/15/15/0"]
        );
    }

    #[test]
    fn test_extract_block_hash() {
        let hash = [0xAB; 32];
        let mut meta = vec![0x0a, 0x22, 0x0a, 0x20];
        meta.extend_from_slice(&hash);
        meta.extend_from_slice(&[0x12, 0x00, 0x18, 0x01]);
        assert_eq!(extract_block_hash(&meta), Some(hash.to_vec()));

        assert_eq!(extract_block_hash(&[0x0a; 10]), None);
        assert_eq!(extract_block_hash(&[0x00; 40]), None);
    }

    #[test]
    fn test_increment_bytes() {
        assert_eq!(increment_bytes(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(increment_bytes(&[0x01, 0xFF]), Some(vec![0x02]));
        assert_eq!(increment_bytes(&[0xFF, 0xFF]), None);
        assert_eq!(increment_bytes(b""), None);
    }
}
