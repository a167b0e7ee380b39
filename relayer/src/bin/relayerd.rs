//! Cronos attestation relayer daemon

use clap::{Arg, Command};
use cronos_relayer::{
    checkpoint::Checkpoint,
    config::Config,
    finality_store::FinalityStore,
    metrics::Metrics,
    rpc::http::{CometClient, RpcAttestationClient},
    server::{self, AppState},
    service::{Clients, Relayer, INCLUSION_TIMEOUT},
    signer::{MnemonicSigner, Signer},
    telemetry::{self, LogFormat},
    Error,
};
use prometheus_client::registry::Registry;
use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

/// How often the status is logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout of every call to a node.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run(config: Config, home: PathBuf) -> Result<(), Error> {
    let store_config = cronos_kv::Config::read_write(
        config.store_backend()?,
        config.finality_store_path.clone(),
    );
    let store = Arc::new(FinalityStore::open(&store_config)?);

    let mut registry = Registry::with_prefix("relayer");
    let metrics = Metrics::register(&mut registry);
    let registry = Arc::new(registry);
    let checkpoint = Arc::new(Checkpoint::open(
        config.checkpoint_path(&home),
        metrics.clone(),
    ));

    let signer = Arc::new(MnemonicSigner::from_mnemonic(&config.relayer_mnemonic)?);
    let relayer_address = if config.relayer_address.is_empty() {
        signer.address()
    } else {
        config.relayer_address.clone()
    };
    info!(address = %relayer_address, "relayer key loaded");

    let source = CometClient::new(&config.source_rpc, RPC_TIMEOUT)?;
    let attestation_chain = CometClient::new(&config.attestation_rpc, RPC_TIMEOUT)?;
    let attestation = RpcAttestationClient::new(
        attestation_chain.clone(),
        &config.attestation_grpc,
        signer.clone(),
        relayer_address,
        config.broadcast_mode,
        INCLUSION_TIMEOUT,
    )?;
    let clients = Clients {
        source: source.clone(),
        attestation_chain,
        attestation,
        broadcaster: source,
    };
    let relayer = Relayer::new(
        config.clone(),
        clients,
        signer,
        store.clone(),
        checkpoint.clone(),
        metrics,
    );

    let shutdown = CancellationToken::new();
    relayer.start(&shutdown).await?;

    let server = if config.rpc_enabled {
        let state = AppState::new(
            relayer.status_handle(),
            store.clone(),
            checkpoint,
            registry,
            &config.source_chain_id,
        );
        let rpc_config = config.rpc_config.clone();
        let token = shutdown.child_token();
        Some(tokio::spawn(async move {
            if let Err(e) = server::serve(state, &rpc_config, token).await {
                error!(error = %e, "control server failed");
            }
        }))
    } else {
        None
    };

    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = &mut signal => break,
            _ = relayer.stopped() => {
                error!("relayer workers stopped unexpectedly");
                break;
            },
            _ = ticker.tick() => {
                let status = relayer.status();
                info!(
                    running = status.running,
                    last_block_forwarded = status.last_block_forwarded,
                    last_finality_received = status.last_finality_received,
                    last_forced_tx_processed = status.last_forced_tx_processed,
                    pending_blocks = status.pending_blocks_count,
                    pending_attestations = relayer.pending_attestations_count(),
                    finalized_blocks = status.finalized_blocks_count,
                    last_error = %status.last_error,
                    "relayer status"
                );
                match store.stats(&config.source_chain_id) {
                    Ok(stats) => info!(
                        total_blocks = stats.total_blocks,
                        finalized_blocks = stats.finalized_blocks,
                        latest_finalized = stats.latest_finalized,
                        "finality store"
                    ),
                    Err(e) => warn!(error = %e, "failed to read finality store stats"),
                }
            },
        }
    }

    info!("shutting down");
    shutdown.cancel();
    if let Some(server) = server {
        if tokio::time::timeout(config.rpc_config.shutdown_timeout, server)
            .await
            .is_err()
        {
            warn!("control server did not stop in time");
        }
    }
    relayer.stop().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = Command::new("relayerd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relay Cronos blocks to the attestation chain and execute forced transactions.")
        .arg(
            Arg::new("config")
                .long("config")
                .default_value("config.json")
                .help("Path to the JSON config file")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("home")
                .long("home")
                .default_value(".")
                .help("Home directory holding the checkpoint")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .help("Log level (trace, debug, info, warn, error)")
                .value_parser(clap::value_parser!(Level)),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .default_value("json")
                .help("Log format (json or text)")
                .value_parser(|s: &str| s.parse::<LogFormat>().map_err(|e| e.to_string())),
        )
        .get_matches();

    let level = *matches.get_one::<Level>("log-level").unwrap();
    let format = *matches.get_one::<LogFormat>("log-format").unwrap();
    if let Err(e) = telemetry::init(level, format) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let config_path = matches.get_one::<PathBuf>("config").unwrap();
    let home = matches.get_one::<PathBuf>("home").unwrap().clone();
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    match run(config, home).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "relayer failed");
            ExitCode::FAILURE
        }
    }
}
