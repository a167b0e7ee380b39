//! Relayer configuration.
//!
//! A [Config] is read from a JSON file. When the file does not exist, defaults are used and
//! the endpoints and mnemonic may be supplied through the environment instead (see
//! [Config::apply_env]).
//!
//! Durations accept either integer nanoseconds or a string such as `"500ms"`, `"5s"`, or
//! `"1m"`, and are written back as strings.

use crate::Error;
use cronos_kv::Backend;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Environment variables read when no config file exists.
pub const ENV_SOURCE_RPC: &str = "SOURCE_RPC";
pub const ENV_SOURCE_GRPC: &str = "SOURCE_GRPC";
pub const ENV_ATTESTATION_RPC: &str = "ATTESTATION_RPC";
pub const ENV_ATTESTATION_GRPC: &str = "ATTESTATION_GRPC";
pub const ENV_RELAYER_MNEMONIC: &str = "RELAYER_MNEMONIC";

/// How transactions are broadcast to the attestation chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastMode {
    /// Wait for the transaction to be committed.
    Sync,
    /// Return as soon as the transaction is accepted into the mempool.
    #[default]
    Async,
}

impl fmt::Display for BroadcastMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastMode::Sync => f.write_str("sync"),
            BroadcastMode::Async => f.write_str("async"),
        }
    }
}

impl FromStr for BroadcastMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(BroadcastMode::Sync),
            "async" => Ok(BroadcastMode::Async),
            other => Err(Error::ConfigInvalid(format!(
                "broadcast_mode must be sync or async: {other}"
            ))),
        }
    }
}

/// Control server settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub listen_addr: String,
    #[serde(with = "duration")]
    pub read_timeout: Duration,
    #[serde(with = "duration")]
    pub write_timeout: Duration,
    #[serde(with = "duration")]
    pub shutdown_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration of a relayer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source_chain_id: String,
    pub source_rpc: String,
    pub source_grpc: String,
    pub attestation_chain_id: String,
    pub attestation_rpc: String,
    pub attestation_grpc: String,
    #[serde(skip_serializing)]
    pub relayer_mnemonic: String,
    pub relayer_address: String,

    /// Blocks submitted per attestation transaction.
    pub block_batch_size: usize,
    pub max_retries: u32,
    #[serde(with = "duration")]
    pub retry_delay: Duration,
    #[serde(with = "duration")]
    pub block_poll_interval: Duration,
    #[serde(with = "duration")]
    pub finality_poll_interval: Duration,
    #[serde(with = "duration")]
    pub forced_tx_poll_interval: Duration,

    pub gas_adjustment: f64,
    pub gas_prices: String,
    pub broadcast_mode: BroadcastMode,

    /// Backend of the finality store (`memory`, `leveldb`, `sled`, or `rocksdb`).
    pub finality_store_type: String,
    pub finality_store_path: PathBuf,

    /// Defaults to `<home>/data/relayer_checkpoint.json`.
    pub checkpoint_path: Option<PathBuf>,
    #[serde(with = "duration")]
    pub checkpoint_interval: Duration,

    /// In-flight attestations older than this are declared lost.
    #[serde(with = "duration")]
    pub pending_attestation_timeout: Duration,

    pub rpc_enabled: bool,
    pub rpc_config: RpcConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_chain_id: "cronos_777-1".into(),
            source_rpc: "http://localhost:26657".into(),
            source_grpc: "localhost:9090".into(),
            attestation_chain_id: "attestation-1".into(),
            attestation_rpc: "http://localhost:26667".into(),
            attestation_grpc: "http://localhost:1317".into(),
            relayer_mnemonic: String::new(),
            relayer_address: String::new(),
            block_batch_size: 10,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            block_poll_interval: Duration::from_secs(2),
            finality_poll_interval: Duration::from_secs(5),
            forced_tx_poll_interval: Duration::from_secs(3),
            gas_adjustment: 1.5,
            gas_prices: "0.025stake".into(),
            broadcast_mode: BroadcastMode::Async,
            finality_store_type: "leveldb".into(),
            finality_store_path: PathBuf::from("./data/finality"),
            checkpoint_path: None,
            checkpoint_interval: Duration::from_secs(30),
            pending_attestation_timeout: Duration::from_secs(5 * 60),
            rpc_enabled: true,
            rpc_config: RpcConfig::default(),
        }
    }
}

impl Config {
    /// Read the config at `path`, falling back to defaults and the environment if it is missing.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        } else {
            let mut config = Self::default();
            config.apply_env(|key| std::env::var(key).ok());
            config
        };
        config.validate()?;
        Ok(config)
    }

    /// Overlay endpoints and the mnemonic with any values `lookup` returns.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let fields = [
            (ENV_SOURCE_RPC, &mut self.source_rpc),
            (ENV_SOURCE_GRPC, &mut self.source_grpc),
            (ENV_ATTESTATION_RPC, &mut self.attestation_rpc),
            (ENV_ATTESTATION_GRPC, &mut self.attestation_grpc),
            (ENV_RELAYER_MNEMONIC, &mut self.relayer_mnemonic),
        ];
        for (key, field) in fields {
            if let Some(value) = lookup(key).filter(|value| !value.is_empty()) {
                *field = value;
            }
        }
    }

    /// Check that the config describes a relayer that can start.
    pub fn validate(&self) -> Result<(), Error> {
        let required = [
            ("source_chain_id", &self.source_chain_id),
            ("source_rpc", &self.source_rpc),
            ("attestation_chain_id", &self.attestation_chain_id),
            ("attestation_rpc", &self.attestation_rpc),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::ConfigInvalid(format!("{name} is required")));
            }
        }
        if self.block_batch_size == 0 {
            return Err(Error::ConfigInvalid(
                "block_batch_size must be greater than 0".into(),
            ));
        }
        if self.gas_adjustment <= 0.0 {
            return Err(Error::ConfigInvalid(
                "gas_adjustment must be positive".into(),
            ));
        }
        for (name, interval) in [
            ("block_poll_interval", self.block_poll_interval),
            ("finality_poll_interval", self.finality_poll_interval),
            ("forced_tx_poll_interval", self.forced_tx_poll_interval),
            ("checkpoint_interval", self.checkpoint_interval),
        ] {
            if interval.is_zero() {
                return Err(Error::ConfigInvalid(format!("{name} must be non-zero")));
            }
        }
        self.store_backend()?;
        Ok(())
    }

    /// Backend named by `finality_store_type`.
    pub fn store_backend(&self) -> Result<Backend, Error> {
        let backend: Backend = self
            .finality_store_type
            .parse()
            .map_err(|e| Error::ConfigInvalid(format!("finality_store_type: {e}")))?;
        if !backend.is_available() {
            return Err(Error::ConfigInvalid(format!(
                "{backend} support not compiled in"
            )));
        }
        Ok(backend)
    }

    /// Where the checkpoint is kept for a relayer whose home is `home`.
    pub fn checkpoint_path(&self, home: &Path) -> PathBuf {
        match &self.checkpoint_path {
            Some(path) => path.clone(),
            None => home.join("data").join("relayer_checkpoint.json"),
        }
    }
}

/// Parse `"<n>ns"`, `"<n>us"`, `"<n>ms"`, `"<n>s"`, `"<n>m"`, or `"<n>h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration is missing a unit: {s:?}"))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration: {s:?}"))?;
    let duration = match unit {
        "ns" => Duration::from_nanos(value),
        "us" | "µs" => Duration::from_micros(value),
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(3600)),
        _ => return Err(format!("unknown duration unit: {s:?}")),
    };
    Ok(duration)
}

/// Render `duration` in the largest unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if duration.subsec_nanos() % 1_000_000 != 0 {
        return format!("{}ns", duration.as_nanos());
    }
    if millis == 0 {
        return "0s".into();
    }
    if millis % 3_600_000 == 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1_000 == 0 {
        format!("{}s", millis / 1_000)
    } else {
        format!("{millis}ms")
    }
}

/// Serde adapter for durations written as nanoseconds or unit strings.
pub mod duration {
    use super::{format_duration, parse_duration};
    use serde::{
        de::{self, Visitor},
        Deserializer, Serializer,
    };
    use std::{fmt, time::Duration};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("nanoseconds or a duration string such as \"5s\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
                Ok(Duration::from_nanos(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
                u64::try_from(value)
                    .map(Duration::from_nanos)
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
                parse_duration(value).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use test_case::test_case;

    #[test_case("5s", Duration::from_secs(5); "seconds")]
    #[test_case("500ms", Duration::from_millis(500); "millis")]
    #[test_case("2m", Duration::from_secs(120); "minutes")]
    #[test_case("1h", Duration::from_secs(3600); "hours")]
    #[test_case(" 10ns ", Duration::from_nanos(10); "nanos")]
    fn test_parse_duration(input: &str, expected: Duration) {
        assert_eq!(parse_duration(input).unwrap(), expected);
    }

    #[test_case("5"; "no unit")]
    #[test_case("s"; "no value")]
    #[test_case("5d"; "unknown unit")]
    #[test_case("-5s"; "negative")]
    fn test_parse_duration_invalid(input: &str) {
        assert!(parse_duration(input).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_nanos(7)), "7ns");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_deserialize() {
        let config: Config = serde_json::from_value(json!({
            "source_chain_id": "cronos_777-1",
            "attestation_chain_id": "attestation-1",
            "block_batch_size": 20,
            "retry_delay": 2_000_000_000u64,
            "block_poll_interval": "500ms",
            "broadcast_mode": "sync",
            "finality_store_type": "memory",
            "rpc_config": {"listen_addr": "127.0.0.1:9000"},
        }))
        .unwrap();
        assert_eq!(config.block_batch_size, 20);
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert_eq!(config.block_poll_interval, Duration::from_millis(500));
        assert_eq!(config.broadcast_mode, BroadcastMode::Sync);
        assert_eq!(config.store_backend().unwrap(), Backend::MemDb);
        assert_eq!(config.rpc_config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.rpc_config.read_timeout, Duration::from_secs(15));

        // Unset fields keep their defaults
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.finality_poll_interval, Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn test_serialize_hides_mnemonic() {
        let config = Config {
            relayer_mnemonic: "secret words".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&config).unwrap();
        assert!(value.get("relayer_mnemonic").is_none());
        assert_eq!(value["retry_delay"], json!("5s"));
        assert_eq!(value["pending_attestation_timeout"], json!("5m"));
    }

    #[test]
    fn test_apply_env() {
        let env: HashMap<&str, &str> = [
            (ENV_SOURCE_RPC, "http://source:26657"),
            (ENV_ATTESTATION_GRPC, "http://attestation:1317"),
            (ENV_RELAYER_MNEMONIC, "abandon abandon"),
            (ENV_SOURCE_GRPC, ""),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|value| value.to_string()));
        assert_eq!(config.source_rpc, "http://source:26657");
        assert_eq!(config.attestation_grpc, "http://attestation:1317");
        assert_eq!(config.relayer_mnemonic, "abandon abandon");
        assert_eq!(config.source_grpc, Config::default().source_grpc);
    }

    #[test]
    fn test_validate() {
        Config::default().validate().unwrap();

        let config = Config {
            source_chain_id: " ".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));

        let config = Config {
            block_batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));

        let config = Config {
            finality_store_type: "badger".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"source_chain_id": "s-1", "attestation_chain_id": "a-1", "checkpoint_path": "/tmp/cp.json"}"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.source_chain_id, "s-1");
        assert_eq!(
            config.checkpoint_path(dir.path()),
            PathBuf::from("/tmp/cp.json")
        );

        std::fs::write(&path, r#"{"block_batch_size": 0}"#).unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(Error::ConfigInvalid(_))
        ));

        std::fs::write(&path, "{").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Serialization(_))));

        assert_eq!(
            Config::default().checkpoint_path(Path::new("/home/relayer")),
            PathBuf::from("/home/relayer/data/relayer_checkpoint.json")
        );
    }
}
