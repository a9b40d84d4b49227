//! Fieldsync ingestion daemon.
//!
//! Backfills the recent history of one LoRaWAN device from the network
//! server's storage API, then follows its live uplinks over MQTT, writing
//! every distinct reading once to a local JSON file.
//!
//! # Usage
//!
//! ```bash
//! # Backfill the last 12 hours, then follow live uplinks
//! TTN_API_KEY=... TTN_MQTT_PASSWORD=... fieldsync-ingest \
//!     --application-id soil-app \
//!     --device-id sensor-1 \
//!     --mqtt-url mqtt://nam1.cloud.thethings.network:1883 \
//!     --mqtt-username soil-app@ttn
//!
//! # Live only, custom store location
//! fieldsync-ingest --skip-backfill --data-file /var/lib/fieldsync/data.json ...
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT or SIGTERM cancels the live subscription between messages. The
//! store is persisted one last time if anything is unwritten and a summary is
//! logged.

use anyhow::{Context, Result};
use clap::Parser;
use fieldsync_core::metrics::{init_metrics, start_metrics_server};
use fieldsync_ingest::source::{parse_window, uplink_topic};
use fieldsync_ingest::{
    HistoricalConfig, HistoricalFetcher, LiveConfig, LiveIngestor, ReconciliationLoop,
    RunSummary, TracingSink,
};
use metrics::gauge;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Fieldsync ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "fieldsync-ingest")]
#[command(about = "Historical backfill plus live MQTT ingestion for one device")]
#[command(version)]
struct Args {
    /// Record store file
    #[arg(long, env = "FIELDSYNC_DATA_FILE", default_value = "hybrid_data.json")]
    data_file: PathBuf,

    /// Network server base URL
    #[arg(long, default_value = "https://nam1.cloud.thethings.network")]
    api_base: String,

    /// Application ID
    #[arg(long, env = "TTN_APPLICATION_ID")]
    application_id: String,

    /// Device ID
    #[arg(long, env = "TTN_DEVICE_ID")]
    device_id: String,

    /// Bearer token for the storage API
    #[arg(long, env = "TTN_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// How far back to backfill (e.g. 30m, 12h, 2d)
    #[arg(long, default_value = "12h", value_parser = parse_window_arg)]
    window: Duration,

    /// Timeout for the historical query, in seconds
    #[arg(long, default_value = "30")]
    fetch_timeout_secs: u64,

    /// Skip the backfill phase and go straight to live
    #[arg(long)]
    skip_backfill: bool,

    /// MQTT broker URL (mqtt://host:port)
    #[arg(long, default_value = "mqtt://nam1.cloud.thethings.network:1883")]
    mqtt_url: String,

    /// MQTT username (defaults to {application-id}@{tenant})
    #[arg(long)]
    mqtt_username: Option<String>,

    /// MQTT password
    #[arg(long, env = "TTN_MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    /// Tenant suffix for the topic and default username (empty for none)
    #[arg(long, default_value = "ttn")]
    tenant: String,

    /// Subscribe to this topic instead of the device uplink topic
    #[arg(long)]
    topic: Option<String>,

    /// MQTT client ID
    #[arg(long, default_value = "fieldsync-ingest")]
    client_id: String,

    /// MQTT keep-alive interval, in seconds
    #[arg(long, default_value = "60")]
    keep_alive_secs: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "0")]
    metrics_port: u16,
}

fn parse_window_arg(input: &str) -> std::result::Result<Duration, String> {
    parse_window(input).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("fieldsync_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Fieldsync ingestion daemon starting...");

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .with_context(|| format!("Failed to bind metrics port {}", args.metrics_port))?;
    }

    // Set up graceful shutdown
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        cancel_clone.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let mut engine = ReconciliationLoop::open(&args.data_file, TracingSink)
        .with_context(|| {
            format!(
                "Refusing to start: cannot load record store {}",
                args.data_file.display()
            )
        })?;

    let tenant = Some(args.tenant.as_str()).filter(|t| !t.is_empty());
    let topic = args
        .topic
        .clone()
        .unwrap_or_else(|| uplink_topic(&args.application_id, tenant, &args.device_id));
    let username = args.mqtt_username.clone().or_else(|| {
        Some(match tenant {
            Some(tenant) => format!("{}@{}", args.application_id, tenant),
            None => args.application_id.clone(),
        })
    });

    tracing::info!("Configuration:");
    tracing::info!("  Data file: {}", args.data_file.display());
    tracing::info!("  Device: {}/{}", args.application_id, args.device_id);
    tracing::info!(
        "  Backfill: {}",
        if args.skip_backfill {
            "disabled".to_string()
        } else {
            format!("last {:?}", args.window)
        }
    );
    tracing::info!("  Broker: {}", args.mqtt_url);
    tracing::info!("  Topic: {}", topic);
    tracing::info!("  Existing records: {}", engine.store().len());

    let mut historical = if args.skip_backfill {
        None
    } else {
        let config = HistoricalConfig {
            api_base: args.api_base.clone(),
            application_id: args.application_id.clone(),
            device_id: args.device_id.clone(),
            api_key: args.api_key.clone(),
            window: args.window,
            timeout: Duration::from_secs(args.fetch_timeout_secs),
        };
        Some(HistoricalFetcher::new(config).context("Failed to create historical fetcher")?)
    };

    let mut live = LiveIngestor::new(
        LiveConfig {
            broker_url: args.mqtt_url.clone(),
            client_id: args.client_id.clone(),
            username,
            password: args.mqtt_password.clone(),
            topic,
            keep_alive: Duration::from_secs(args.keep_alive_secs),
            ..Default::default()
        },
        cancel,
    );

    gauge!("ingest_running").set(1.0);
    let result = engine.run(historical.as_mut(), &mut live).await;
    gauge!("ingest_running").set(0.0);

    match &result {
        Ok(summary) => log_summary(summary),
        Err(e) => {
            tracing::error!("Ingestion stopped: {}", e);
            log_summary(engine.summary());
        }
    }

    result.map(|_| ()).context("Ingestion failed")
}

fn log_summary(summary: &RunSummary) {
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Records loaded:        {}", summary.loaded);
    tracing::info!(
        "Backfill:              {} fetched, {} added, {} duplicates{}",
        summary.backfill_fetched,
        summary.backfill_admitted,
        summary.backfill_duplicates,
        if summary.fetch_failed {
            " (fetch failed)"
        } else {
            ""
        }
    );
    tracing::info!(
        "Live:                  {} received, {} added, {} duplicates",
        summary.live_received,
        summary.live_admitted,
        summary.live_duplicates
    );
    tracing::info!("Without timestamp:     {}", summary.unkeyed_admitted);
    tracing::info!("Parse errors:          {}", summary.parse_errors);
    tracing::info!("Records on disk:       {}", summary.final_count);
}
