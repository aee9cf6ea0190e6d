use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tapledger_server::{Api, BackendKind, Ledger, ProgressStore, ServerConfig, StoreOptions, SystemClock};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PORT: u16 = 8080;

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "tapledger-server".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("tapledger-server");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on (falls back to PORT, then 8080).
    #[arg(short, long)]
    port: Option<u16>,

    /// Storage backend: memory, file, sqlite, postgres or redis. Defaults to
    /// postgres when DATABASE_URL is set, redis when REDIS_URL is set, and
    /// sqlite otherwise.
    #[arg(long)]
    backend: Option<String>,

    /// Data file for the file and sqlite backends.
    #[arg(long)]
    data_path: Option<PathBuf>,

    /// Postgres connection string (falls back to DATABASE_URL).
    #[arg(long)]
    database_url: Option<String>,

    /// Redis connection string (falls back to REDIS_URL).
    #[arg(long)]
    redis_url: Option<String>,

    /// Key prefix for the redis backend.
    #[arg(long)]
    redis_prefix: Option<String>,

    /// Delete other players sharing a nickname when a player is fetched.
    #[arg(long, default_value_t = false)]
    evict_duplicate_nicknames: bool,

    /// Leaderboard size when the client does not ask for one (0 uses default).
    #[arg(long)]
    leaderboard_default_limit: Option<usize>,

    /// Largest leaderboard a client may request (0 uses default).
    #[arg(long)]
    leaderboard_max_limit: Option<usize>,

    /// Seconds between daily-rollover checks (0 disables scheduled resets).
    #[arg(long)]
    reset_interval_secs: Option<u64>,

    /// Max request body size in bytes (0 disables limit).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,
}

/// Maps an optional arg value to Option: 0 => None, Some(v) => Some(v), None => default
fn map_optional_limit<T: Copy + PartialEq + From<u8>>(arg: Option<T>, default: Option<T>) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => None,
        Some(v) => Some(v),
        None => default,
    }
}

/// Maps an optional arg value keeping default on 0: 0 => default, Some(v) => v, None => default
fn map_default_on_zero<T: Copy + PartialEq + From<u8>>(arg: Option<T>, default: T) -> T {
    match arg {
        Some(v) if v == T::from(0) => default,
        Some(v) => v,
        None => default,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn build_config(args: &Args, env: &dyn Fn(&str) -> Option<String>) -> Result<ServerConfig> {
    let defaults = ServerConfig::default();
    let database_url = non_empty(args.database_url.clone()).or_else(|| non_empty(env("DATABASE_URL")));
    let redis_url = non_empty(args.redis_url.clone()).or_else(|| non_empty(env("REDIS_URL")));
    let backend = match args.backend.as_deref() {
        Some(value) => value
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid backend: {err}"))?,
        None if database_url.is_some() => BackendKind::Postgres,
        None if redis_url.is_some() => BackendKind::Redis,
        None => BackendKind::Sqlite,
    };

    let leaderboard_max_limit =
        map_default_on_zero(args.leaderboard_max_limit, defaults.leaderboard_max_limit);
    let leaderboard_default_limit =
        map_default_on_zero(args.leaderboard_default_limit, defaults.leaderboard_default_limit);
    if leaderboard_default_limit > leaderboard_max_limit {
        anyhow::bail!(
            "leaderboard default limit {leaderboard_default_limit} exceeds max {leaderboard_max_limit}"
        );
    }

    Ok(ServerConfig {
        backend,
        data_path: args.data_path.clone(),
        database_url,
        redis_url,
        redis_prefix: args.redis_prefix.clone().unwrap_or(defaults.redis_prefix),
        store: StoreOptions {
            evict_duplicate_nicknames: args.evict_duplicate_nicknames,
        },
        leaderboard_default_limit,
        leaderboard_max_limit,
        reset_interval_secs: map_optional_limit(args.reset_interval_secs, defaults.reset_interval_secs),
        http_body_limit_bytes: map_optional_limit(
            args.http_body_limit_bytes,
            defaults.http_body_limit_bytes,
        ),
        admin_token: non_empty(env("ADMIN_TOKEN")),
        metrics_token: non_empty(env("METRICS_AUTH_TOKEN")),
    })
}

fn resolve_port(args: &Args, env: &dyn Fn(&str) -> Option<String>) -> Result<u16> {
    if let Some(port) = args.port {
        return Ok(port);
    }
    match non_empty(env("PORT")) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid PORT value {value:?}")),
        None => Ok(DEFAULT_PORT),
    }
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing()?;

    let config = build_config(&args, &process_env)?;
    let port = resolve_port(&args, &process_env)?;
    // Serialized form omits connection strings and tokens.
    let summary = serde_json::to_string(&config).context("serialize config")?;
    info!(config = %summary, "configuration loaded");

    // Network backends connect with blocking clients.
    let open_config = config.clone();
    let backend = tokio::task::spawn_blocking(move || open_config.open_backend())
        .await
        .context("backend open task failed")??;
    info!(backend = backend.name(), "progress store opened");

    let store = ProgressStore::new(backend, Arc::new(SystemClock), config.store);
    let ledger = Arc::new(Ledger::new(config, store));
    let schedule = ledger.start_reset_schedule();
    let app = Api::new(Arc::clone(&ledger)).router();

    let addr = SocketAddr::new(args.host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for shutdown signal: {err}");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await
        .context("axum server error")?;

    if let Some(handle) = schedule {
        handle.abort();
        let _ = handle.await;
    }
    // Blocking database clients must not be dropped on an async worker.
    tokio::task::spawn_blocking(move || drop(ledger))
        .await
        .context("store shutdown task failed")?;
    Ok(())
}
