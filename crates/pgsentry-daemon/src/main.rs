use anyhow::{bail, Result};
use pgsentry_common::stats;
use pgsentry_common::types::StoreMessage;
use pgsentry_daemon::config::{DaemonConfig, Datastore};
use pgsentry_daemon::core::Core;
use pgsentry_daemon::stats_http;
use pgsentry_daemon::supervisor::Supervisor;
use pgsentry_sink::graphite::GraphiteSink;
use pgsentry_sink::jsonfile::JsonFileSink;
use pgsentry_sink::postgres::{self, PartitionScheme, PostgresSink};
use pgsentry_sink::snapshot::SnapshotSink;
use pgsentry_sink::{batcher, persister, MetricsSink};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

/// Batch and persist channels buffer this many bundles; a full channel
/// blocks the senders, which is the intended backpressure.
const CHANNEL_CAPACITY: usize = 10_000;

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  pgsentry-daemon [config.toml]                         Start the gatherer");
    eprintln!("  pgsentry-daemon encrypt-password <keyphrase> <pw>     Print the password envelope");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pgsentry=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("encrypt-password") => {
            let (Some(keyphrase), Some(password)) = (args.get(2), args.get(3)) else {
                print_usage();
                bail!("encrypt-password requires <keyphrase> and <password>");
            };
            println!("{}", pgsentry_common::crypto::encrypt_password(keyphrase, password)?);
            Ok(())
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        other => {
            let config_path = other.unwrap_or("config/pgsentry.toml");
            run_daemon(config_path).await
        }
    }
}

fn build_sinks(core: &Arc<Core>) -> Result<Vec<Box<dyn MetricsSink>>> {
    let metrics = &core.config.metrics;
    let gatherer = &core.config.gatherer;
    let mut sinks: Vec<Box<dyn MetricsSink>> = Vec::new();
    match core.config.datastore()? {
        Datastore::Postgres => {
            let scheme: PartitionScheme = metrics
                .pg_schema_type
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            for (index, conn_str) in metrics.pg_store_conn_strs.iter().enumerate() {
                let name = if index == 0 {
                    "postgres".to_string()
                } else {
                    format!("postgres#{}", index + 1)
                };
                sinks.push(Box::new(PostgresSink::new(name, conn_str.clone(), scheme)));
            }
        }
        Datastore::Graphite => {
            sinks.push(Box::new(GraphiteSink::new(
                "graphite",
                metrics.graphite_host.clone(),
                metrics.graphite_port,
            )));
        }
        Datastore::Json => {
            sinks.push(Box::new(
                JsonFileSink::new("json", metrics.json_storage_file.clone())
                    .with_real_dbname(gatherer.add_real_dbname, gatherer.real_dbname_field.clone())
                    .with_system_identifier(
                        gatherer.add_system_identifier,
                        gatherer.system_identifier_field.clone(),
                    ),
            ));
        }
        Datastore::Prometheus => {
            sinks.push(Box::new(SnapshotSink::new(
                "prometheus-cache",
                Arc::clone(&core.snapshot_cache),
            )));
        }
    }
    Ok(sinks)
}

async fn run_daemon(config_path: &str) -> Result<()> {
    stats::mark_started();

    let config = DaemonConfig::load(config_path)?;
    let datastore = config.datastore()?;
    tracing::info!(config = config_path, datastore = %config.metrics.datastore, "pgsentry starting");

    let core = Arc::new(Core::new(config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (persist_tx, persist_rx) = mpsc::channel::<Vec<StoreMessage>>(CHANNEL_CAPACITY);

    // pull mode smooths through its own cache, batching adds nothing
    let batching_delay_ms = if datastore == Datastore::Prometheus {
        0
    } else {
        core.config.gatherer.batching_delay_ms
    };
    let store_tx = if batching_delay_ms > 0 {
        let (buffered_tx, buffered_rx) = mpsc::channel::<Vec<StoreMessage>>(CHANNEL_CAPACITY);
        tracing::info!(batching_delay_ms, "starting metrics batcher");
        tokio::spawn(batcher::run_batcher(
            batching_delay_ms,
            buffered_rx,
            persist_tx.clone(),
        ));
        buffered_tx
    } else {
        persist_tx.clone()
    };

    let sinks = build_sinks(&core)?;
    tracing::info!(sinks = sinks.len(), "starting metrics persister");
    let persister_handle = tokio::spawn(persister::run_persister(
        sinks,
        persist_rx,
        shutdown_rx.clone(),
    ));

    if datastore == Datastore::Postgres && core.config.metrics.pg_retention_days > 0 {
        let scheme: PartitionScheme = core
            .config
            .metrics
            .pg_schema_type
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        tokio::spawn(postgres::run_retention(
            core.config.metrics.pg_store_conn_strs[0].clone(),
            scheme,
            core.config.metrics.pg_retention_days,
            shutdown_rx.clone(),
        ));
    }

    if core.config.gatherer.stats_port > 0 {
        tokio::spawn(stats_http::run_stats_server(
            Arc::clone(&core),
            core.config.gatherer.stats_port,
        ));
        tokio::spawn(stats_http::run_stats_summarizer());
    }

    let supervisor = Supervisor::new(Arc::clone(&core), store_tx);
    let supervisor_handle = tokio::spawn(supervisor.run(shutdown_rx));

    tokio::select! {
        result = supervisor_handle => {
            // a first-iteration config failure lands here
            let _ = shutdown_tx.send(true);
            result??;
        }
        _ = signal::ctrl_c() => {
            tracing::info!("shutting down gracefully");
            let _ = shutdown_tx.send(true);
        }
    }

    // closing the last store sender lets the pipeline drain and stop
    drop(persist_tx);
    let _ = persister_handle.await;

    Ok(())
}
