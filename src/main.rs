use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracklink::cache::CacheConfig;
use tracklink::stream::{
    ConnectionSupervisor, ReconnectPolicy, SupervisorConfig, WebSocketTransport,
};
use tracklink::stream::config::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_JITTER_FRACTION, DEFAULT_SILENCE_TIMEOUT_SECONDS,
    INITIAL_BACKOFF_SECONDS, MAX_BACKOFF_SECONDS,
};
use tracklink::traccar::{StreamMessage, TripService, TripServiceConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket endpoint of the event stream, e.g. wss://host/api/socket
    #[arg(short, long)]
    url: String,

    /// Bearer token sent with the handshake and API requests
    #[arg(short, long)]
    token: Option<String>,

    /// Seconds without any frame before the connection is considered dead
    #[arg(long, default_value_t = DEFAULT_SILENCE_TIMEOUT_SECONDS)]
    silence_timeout: u64,

    /// First reconnect delay in seconds
    #[arg(long, default_value_t = INITIAL_BACKOFF_SECONDS)]
    initial_delay: u64,

    /// Reconnect delay ceiling in seconds
    #[arg(long, default_value_t = MAX_BACKOFF_SECONDS)]
    max_delay: u64,

    /// Server root for REST calls; enables the trip fetch
    #[arg(long)]
    api: Option<String>,

    /// Device to fetch trips for
    #[arg(long)]
    device: Option<i64>,

    /// Trip window, in hours back from now
    #[arg(long, default_value_t = 24)]
    hours: i64,
}

/// The `hours` long window ending at `to`
fn trip_window(to: DateTime<Utc>, hours: i64) -> anyhow::Result<(DateTime<Utc>, DateTime<Utc>)> {
    let span = ChronoDuration::try_hours(hours)
        .with_context(|| format!("--hours {hours} is out of range"))?;
    let from = to
        .checked_sub_signed(span)
        .with_context(|| format!("--hours {hours} reaches before the supported date range"))?;
    Ok((from, to))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let policy = ReconnectPolicy::new(
        Duration::from_secs(args.initial_delay),
        Duration::from_secs(args.max_delay),
        DEFAULT_BACKOFF_MULTIPLIER,
        DEFAULT_JITTER_FRACTION,
    )
    .context("invalid reconnect settings")?;
    let config = SupervisorConfig {
        policy,
        silence_timeout: Duration::from_secs(args.silence_timeout),
        ..SupervisorConfig::default()
    };

    let mut transport = WebSocketTransport::new(args.url.clone());
    if let Some(token) = &args.token {
        transport = transport.with_bearer_token(token.clone());
    }
    let supervisor = ConnectionSupervisor::new(Arc::new(transport), config);

    supervisor.on_status_change(|previous, next| {
        info!("status: {} → {}", previous, next);
    });
    supervisor.on_message(|payload| match StreamMessage::decode(payload) {
        Ok(message) if message.is_keep_alive() => {}
        Ok(message) => {
            for position in message.positions.unwrap_or_default() {
                info!(
                    "📍 device {} at ({:.5}, {:.5}) {:.1} kn",
                    position.device_id, position.latitude, position.longitude, position.speed
                );
            }
            for device in message.devices.unwrap_or_default() {
                info!(
                    "🚚 device {} '{}' is {}",
                    device.id,
                    device.name,
                    device.status.as_deref().unwrap_or("unknown")
                );
            }
            for event in message.events.unwrap_or_default() {
                info!("🔔 device {} event {}", event.device_id, event.event_type);
            }
        }
        Err(e) => warn!("Undecodable stream payload: {}", e),
    });

    let pruner_cancel = CancellationToken::new();
    if let (Some(api), Some(device)) = (args.api.clone(), args.device) {
        let mut trip_config = TripServiceConfig::new(api);
        trip_config.bearer_token.clone_from(&args.token);
        let trips = TripService::new(trip_config).context("failed to build HTTP client")?;
        let _pruner = trips
            .cache()
            .spawn_pruner(CacheConfig::default().prune_interval, pruner_cancel.clone());

        let (from, to) = trip_window(Utc::now(), args.hours)?;
        match trips.trips(device, from, to).await {
            Ok(list) => info!("🧭 {} trips for device {} in the last {}h", list.len(), device, args.hours),
            Err(e) => warn!("Trip fetch failed: {}", e),
        }
    }

    supervisor.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down");

    pruner_cancel.cancel();
    supervisor.stop().await;
    Ok(())
}
