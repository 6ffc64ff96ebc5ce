//! QKey Gateway - REST front end for the key provisioning context
//!
//! Serves quantum keys produced by a QKD device to applications over HTTP.
//!
//! # Features
//!
//! - Optional preprocessing of the raw device key log into one key per line
//! - `GET /api/keys` to take the next key, `GET /api/keys/:id` to fetch an
//!   issued key again
//! - Prometheus metrics and health monitoring
//! - Static web assets served from a configurable directory

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::Parser;
use qkey_core::{
    config::GatewayConfig,
    context::KeyContext,
    keylog::KeyLogChunker,
    metrics::Metrics,
    protocol::{GatewayStatus, HealthStatus, KeyResponse},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{cors::CorsLayer, services::ServeDir, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "qkey-gateway")]
#[command(about = "QKey Gateway - Serves quantum keys via REST API", long_about = None)]
struct Args {
    /// Path to configuration file (ignored if --env-mode is set)
    #[arg(short, long, default_value = "config/gateway.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Load configuration from environment variables instead of file
    #[arg(long, default_value = "false")]
    env_mode: bool,
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    context: Arc<KeyContext>,
    metrics: Metrics,
    start_time: Instant,
}

impl AppState {
    fn new(context: Arc<KeyContext>) -> Self {
        Self {
            context,
            metrics: Metrics::new(),
            start_time: Instant::now(),
        }
    }
}

/// GET /api/keys - Dispense the next key
async fn dispense_key(State(state): State<AppState>) -> Response {
    let start = Instant::now();

    match state.context.dispense() {
        Ok(record) => {
            state.metrics.record_dispense(start.elapsed().as_micros() as u64);
            debug!("Dispensed key {}", record.id());
            (
                [(hyper::header::CACHE_CONTROL, "no-store")],
                Json(KeyResponse::from(record)),
            )
                .into_response()
        }
        Err(e) => {
            state.metrics.record_request_failure();
            error!("Failed to dispense key: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failure").into_response()
        }
    }
}

/// GET /api/keys/:id - Fetch a previously dispensed key
async fn retrieve_key(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let record = id.parse::<i64>().ok().and_then(|id| state.context.retrieve(id));

    match record {
        Some(record) => {
            state.metrics.record_retrieval();
            (
                [(hyper::header::CACHE_CONTROL, "no-store")],
                Json(KeyResponse::from(record)),
            )
                .into_response()
        }
        None => {
            state.metrics.record_retrieval_miss();
            debug!("No key with id {}", id);
            (StatusCode::NOT_FOUND, Json(KeyResponse::invalid())).into_response()
        }
    }
}

/// GET /api/status - System status
async fn get_status(State(state): State<AppState>) -> Json<GatewayStatus> {
    Json(GatewayStatus::from_context(
        &state.context.status(),
        state.start_time.elapsed().as_secs(),
        state.metrics.requests_total(),
        state.metrics.requests_per_second(),
    ))
}

/// GET /health - Simple health check
async fn health_check(State(state): State<AppState>) -> StatusCode {
    match HealthStatus::assess(&state.context.status()) {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    }
}

/// GET /metrics - Prometheus metrics
async fn get_metrics(State(state): State<AppState>) -> String {
    state.metrics.prometheus_format(&state.context.status())
}

fn router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let mut app = Router::new()
        .route("/api/keys", get(dispense_key))
        .route("/api/keys/:id", get(retrieve_key))
        .route("/api/status", get(get_status))
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics));

    match static_dir {
        Some(dir) if dir.is_dir() => {
            info!("Serving static files from {}", dir.display());
            app = app.fallback_service(ServeDir::new(dir));
        }
        Some(dir) => warn!("Static directory {} not found, not serving files", dir.display()),
        None => {}
    }

    app.layer(TimeoutLayer::new(Duration::from_secs(10)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use futures::stream::StreamExt;
        use signal_hook::consts::signal::*;
        use signal_hook_tokio::Signals;

        match Signals::new([SIGINT, SIGTERM]) {
            Ok(mut signals) => {
                if let Some(signal) = signals.next().await {
                    info!("Received signal: {:?}", signal);
                }
            }
            Err(e) => {
                error!("Failed to register signal handlers: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(windows)]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .json()
        .init();

    info!("QKey Gateway v{}", qkey_core::VERSION);

    // Load configuration
    let config = if args.env_mode {
        info!("Loading configuration from environment variables");
        GatewayConfig::from_env().context("Failed to load configuration from environment")?
    } else {
        info!("Loading configuration from file: {:?}", args.config);
        GatewayConfig::from_file(&args.config).context("Failed to load configuration from file")?
    };

    info!("Listen address: {}", config.listen_address);
    info!("Key source: {}", config.source_path.display());

    // Cut the raw device log into the flat key file the loader tails
    if let Some(input) = &config.keylog_input {
        let chunker = KeyLogChunker::new(config.chunk_width)?;
        chunker
            .transform_file(input, &config.source_path)
            .with_context(|| format!("Failed to preprocess key log {}", input.display()))?;
    }

    // Start the key context; blocks until the first key is loaded
    let context = Arc::new(KeyContext::default());
    context
        .configure(config.context_config())
        .context("Invalid key context configuration")?;

    let starting = Arc::clone(&context);
    tokio::task::spawn_blocking(move || starting.start())
        .await
        .context("Key context startup task panicked")?
        .context("Failed to start key context")?;

    let state = AppState::new(Arc::clone(&context));
    let app = router(state, config.static_dir.clone());

    let addr = config.listen_addr()?;
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down key context");
    tokio::task::spawn_blocking(move || context.stop())
        .await
        .context("Key context shutdown task panicked")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use qkey_core::config::ContextConfig;
    use tower::ServiceExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        context: Arc<KeyContext>,
        state: AppState,
    }

    /// Context started on a key file holding `keys`, with the whole file buffered
    fn started(keys: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("keyDB.txt");
        let mut content = keys.join("\n");
        content.push('\n');
        std::fs::write(&source, content).unwrap();

        let mut config = ContextConfig::new(&source);
        config.idle_backoff_ms = 5;
        let context = Arc::new(KeyContext::new(config));
        context.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while context.buffered() + 1 < keys.len() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        Fixture {
            _dir: dir,
            state: AppState::new(Arc::clone(&context)),
            context,
        }
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn key(body: &str) -> KeyResponse {
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn test_dispense_and_retrieve() {
        let fixture = started(&["K0", "K1", "K2"]);
        let app = router(fixture.state.clone(), None);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/keys").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[hyper::header::CACHE_CONTROL], "no-store");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            serde_json::from_slice::<KeyResponse>(&body).unwrap(),
            KeyResponse { id: 0, key: "K0".to_string() }
        );

        let (_, body) = get(&app, "/api/keys").await;
        assert_eq!(key(&body), KeyResponse { id: 1, key: "K1".to_string() });

        let (status, body) = get(&app, "/api/keys/0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(key(&body).key, "K0");

        assert_eq!(fixture.state.metrics.keys_dispensed(), 2);
        assert_eq!(fixture.state.metrics.keys_retrieved(), 1);
    }

    #[tokio::test]
    async fn test_unknown_key_is_404() {
        let fixture = started(&["K0"]);
        let app = router(fixture.state.clone(), None);

        for uri in ["/api/keys/5", "/api/keys/-1", "/api/keys/abc"] {
            let (status, body) = get(&app, uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
            assert_eq!(key(&body), KeyResponse::invalid());
        }
        assert_eq!(fixture.state.metrics.retrieval_misses(), 3);
    }

    #[tokio::test]
    async fn test_stopped_context() {
        let fixture = started(&["K0"]);
        let app = router(fixture.state.clone(), None);
        fixture.context.stop();

        let (status, body) = get(&app, "/api/keys").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "Failure");
        assert_eq!(fixture.state.metrics.requests_failed(), 1);

        let (status, _) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_status_and_metrics() {
        let fixture = started(&["K0", "K1"]);
        let app = router(fixture.state.clone(), None);
        get(&app, "/api/keys").await;

        let (status, _) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = get(&app, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["keys_dispensed"], 1);
        assert_eq!(json["total_requests_served"], 1);

        let (status, body) = get(&app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("qkey_keys_dispensed_total 1\n"));
        assert!(body.contains("qkey_context_running 1\n"));
    }

    #[tokio::test]
    async fn test_static_fallback() {
        let fixture = started(&["K0"]);
        let web = tempfile::tempdir().unwrap();
        std::fs::write(web.path().join("index.html"), "<h1>QKey</h1>").unwrap();

        let app = router(fixture.state.clone(), Some(web.path().to_path_buf()));
        let (status, body) = get(&app, "/index.html").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<h1>QKey</h1>");

        // API routes still win over the fallback
        let (status, _) = get(&app, "/api/keys").await;
        assert_eq!(status, StatusCode::OK);
    }
}
