//! Counters and gauges exported by the relayer.

use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Relayer metrics. Clones share the underlying values.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub blocks_forwarded: Counter,
    pub forward_failures: Counter,
    pub finality_events: Counter,
    pub forced_txs_executed: Counter,
    pub forced_tx_failures: Counter,
    pub checkpoint_saves: Counter,
    pub checkpoint_save_failures: Counter,
    pub pending_attestations: Gauge,
    pub last_block_forwarded: Gauge,
}

impl Metrics {
    /// Create metrics and register them with `registry`.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "blocks_forwarded",
            "Blocks submitted to the attestation chain",
            metrics.blocks_forwarded.clone(),
        );
        registry.register(
            "forward_failures",
            "Batches that could not be submitted",
            metrics.forward_failures.clone(),
        );
        registry.register(
            "finality_events",
            "Blocks reported final by the attestation chain",
            metrics.finality_events.clone(),
        );
        registry.register(
            "forced_txs_executed",
            "Forced transactions executed on the source chain",
            metrics.forced_txs_executed.clone(),
        );
        registry.register(
            "forced_tx_failures",
            "Forced transactions that exhausted their retries",
            metrics.forced_tx_failures.clone(),
        );
        registry.register(
            "checkpoint_saves",
            "Checkpoints written",
            metrics.checkpoint_saves.clone(),
        );
        registry.register(
            "checkpoint_save_failures",
            "Checkpoints that could not be written",
            metrics.checkpoint_save_failures.clone(),
        );
        registry.register(
            "pending_attestations",
            "Attestations submitted but not yet final",
            metrics.pending_attestations.clone(),
        );
        registry.register(
            "last_block_forwarded",
            "Height of the last block submitted",
            metrics.last_block_forwarded.clone(),
        );
        metrics
    }
}

/// Render `registry` in the OpenMetrics text format.
pub fn render(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    encode(&mut buffer, registry)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let mut registry = Registry::default();
        let metrics = Metrics::register(&mut registry);
        metrics.blocks_forwarded.inc_by(3);
        metrics.last_block_forwarded.set(42);

        let clone = metrics.clone();
        clone.blocks_forwarded.inc();

        let rendered = render(&registry).unwrap();
        assert!(rendered.contains("blocks_forwarded_total 4"));
        assert!(rendered.contains("last_block_forwarded 42"));
        assert!(rendered.ends_with("# EOF\n"));
    }
}
