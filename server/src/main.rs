use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use mjpeg_snap_common::config::{Config, RetryConfig, StreamConfig, STATUS_PATH};
use mjpeg_snap_relay::{
    CacheMode, ConnectorOptions, ConnectorStatus, SnapshotService, StreamConnector, StreamTarget,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    /// Connectors keyed by the path they are served under.
    streams: Vec<(String, Arc<StreamConnector>)>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /status: connector state for every configured stream
async fn stream_status(
    State(state): State<Arc<AppState>>,
) -> Json<BTreeMap<String, ConnectorStatus>> {
    let statuses = state
        .streams
        .iter()
        .map(|(path, connector)| (path.clone(), connector.status()))
        .collect();
    Json(statuses)
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn connector_options(retry: &RetryConfig, stream: &StreamConfig) -> ConnectorOptions {
    ConnectorOptions {
        backoff: retry.backoff(),
        status_retries: retry.status_retries,
        connect_timeout: retry.connect_timeout(),
        max_frame_size: stream.max_frame_bytes,
    }
}

fn cache_mode(stream: &StreamConfig) -> CacheMode {
    if stream.conditional_get {
        CacheMode::LastModified
    } else {
        CacheMode::NoCache
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let mut app = Router::new();
    let mut streams = Vec::with_capacity(config.streams.len());

    for stream in &config.streams {
        let connector = Arc::new(StreamConnector::new(connector_options(&config.retry, stream)));
        let target = StreamTarget::new(
            stream.url.clone(),
            &stream.username,
            &stream.password,
            stream.idle_timeout(),
        );
        if let Err(e) = connector.start(target) {
            error!(error = %e, path = stream.path, "failed to start stream connector");
            std::process::exit(1);
        }

        let service = SnapshotService::new(Arc::clone(&connector), cache_mode(stream));
        app = app.merge(service.into_router(&stream.path));
        info!(
            path = stream.path,
            url = stream.url,
            idle_timeout_secs = stream.idle_timeout_secs,
            conditional_get = stream.conditional_get,
            "serving MJPEG snapshots"
        );
        streams.push((stream.path.clone(), connector));
    }

    let state = Arc::new(AppState { streams });
    let app = app
        .merge(
            Router::new()
                .route(STATUS_PATH, get(stream_status))
                .with_state(Arc::clone(&state)),
        )
        .layer(TraceLayer::new_for_http());

    let addr = config.server.listen.clone();
    info!(addr, streams = state.streams.len(), "mjpeg-snap server starting");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "HTTP server failed");
    }

    for (path, connector) in &state.streams {
        connector.stop().await;
        info!(path, "stream connector shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stream_config(conditional_get: bool) -> StreamConfig {
        StreamConfig {
            path: "/img.jpg".into(),
            url: "http://camera.local/mjpg/video.mjpg".into(),
            username: String::new(),
            password: String::new(),
            idle_timeout_secs: 30,
            conditional_get,
            max_frame_bytes: 1000,
        }
    }

    #[test]
    fn options_follow_config() {
        let retry = RetryConfig {
            backoff_ms: 250,
            status_retries: 4,
            connect_timeout_secs: 3,
        };
        let options = connector_options(&retry, &stream_config(false));
        assert_eq!(options.backoff, Duration::from_millis(250));
        assert_eq!(options.status_retries, 4);
        assert_eq!(options.connect_timeout, Duration::from_secs(3));
        assert_eq!(options.max_frame_size, 1000);
    }

    #[test]
    fn conditional_get_selects_cache_mode() {
        assert_eq!(cache_mode(&stream_config(false)), CacheMode::NoCache);
        assert_eq!(cache_mode(&stream_config(true)), CacheMode::LastModified);
    }
}
