//! Spindle - authenticated ingest and enrichment gateway
//!
//! Run with: `spindle --config spindle.toml`
//!
//! Secrets come from the environment:
//! - `SPINDLE_SENSOR_<ID>`: token for sensor `<ID>` (underscores become dashes)
//! - `SPINDLE_ELASTICSEARCH_USER` / `SPINDLE_ELASTICSEARCH_PASS`
//! - `SPINDLE_CLICKHOUSE_USER` / `SPINDLE_CLICKHOUSE_PASSWORD`

use clap::Parser;
use spindle::config::{Config, LogFormat};
use spindle::enrich::{DnsEnricher, Enricher};
use spindle::error::SpindleError;
use spindle::ingest::{IngestLimits, IngestMetrics, IngestState, ProcessBatch};
use spindle::output::{self, FlushLog};
use spindle::ratelimit::PerSensorLimiter;
use spindle::server::{ManagementState, Server, TlsPaths};
use spindle::Validator;
use prometheus::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "spindle", about = "Authenticated ingest and enrichment gateway")]
struct Args {
    /// Path to config file (TOML)
    #[arg(long, default_value = "spindle.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    init_tracing(&config);
    info!(
        listen = %config.server.listen_address,
        output = %config.output.r#type,
        "starting spindle"
    );

    let validator = Arc::new(Validator::new(&config.auth.tokens));
    let limiter = Arc::new(PerSensorLimiter::new(config.limits.per_sensor_rps));

    let dns = if config.enrichment.dns.enabled {
        let ttl = if config.enrichment.dns.cache_ttl_seconds <= 0 {
            300
        } else {
            config.enrichment.dns.cache_ttl_seconds as u64
        };
        Some(DnsEnricher::new(
            Duration::from_secs(ttl),
            config.enrichment.dns.max_qps,
        ))
    } else {
        None
    };
    let enricher = Arc::new(Enricher::new(
        &config.enrichment.geoip_db_path,
        &config.enrichment.asn_db_path,
        dns,
    )?);

    let flush_log: FlushLog = Arc::new(|rows, err| match err {
        Some(err) => warn!(rows, error = %err, "output flush"),
        None => debug!(rows, "output flush ok"),
    });
    let writer = output::make_writer(&config.output, Some(flush_log)).await?;

    let (registry, ingest_metrics) = if config.observability.metrics_enabled {
        let registry = Registry::new();
        let metrics = Arc::new(IngestMetrics::new(&registry)?);
        (Some(registry), Some(metrics))
    } else {
        (None, None)
    };

    // Default batch processing: enrich each event in place, then write it,
    // in input order. Any error fails the whole batch.
    let process: ProcessBatch = {
        let enricher = Arc::clone(&enricher);
        let writer = Arc::clone(&writer);
        Arc::new(move |_sensor_id, events| {
            let enricher = Arc::clone(&enricher);
            let writer = Arc::clone(&writer);
            Box::pin(async move {
                for mut event in events {
                    enricher.enrich(&mut event).await;
                    writer.write(event).await?;
                }
                Ok(())
            })
        })
    };

    let listen_addr: SocketAddr = config
        .server
        .listen_address
        .parse()
        .map_err(|e| SpindleError::Config(format!("invalid listen_address: {e}")))?;
    let management_addr = if config.server.management_listen_address.is_empty() {
        None
    } else {
        Some(
            config
                .server
                .management_listen_address
                .parse::<SocketAddr>()
                .map_err(|e| {
                    SpindleError::Config(format!("invalid management_listen_address: {e}"))
                })?,
        )
    };

    let server = Server {
        listen_addr,
        management_addr,
        tls: config.server.tls.then(|| TlsPaths {
            cert_file: config.server.cert_file.clone(),
            key_file: config.server.key_file.clone(),
        }),
        ingest: IngestState {
            validator,
            limiter,
            limits: IngestLimits {
                max_body_bytes: config.limits.max_body_size_bytes as usize,
                max_events: config.limits.max_events_per_batch,
                max_event_bytes: config.limits.max_event_size_bytes as usize,
            },
            process,
            metrics: ingest_metrics,
        },
        management: ManagementState {
            enricher_ready: {
                let enricher = Arc::clone(&enricher);
                Arc::new(move || enricher.ready())
            },
            output_ready: Arc::new(|| true),
            registry,
        },
    };

    server.run(shutdown_signal()).await?;

    info!("shutting down");
    if let Err(e) = writer.close().await {
        warn!(error = %e, "output close");
    }
    enricher.close();
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
