use std::sync::Arc;

use axum::extract::State;
use axum::http::header::{
    CACHE_CONTROL, CONTENT_TYPE, EXPIRES, IF_MODIFIED_SINCE, LAST_MODIFIED, PRAGMA,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};

use crate::cache::Frame;
use crate::connector::StreamConnector;

const IMAGE_JPEG: &str = "image/jpeg";
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Response caching headers, fixed per service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// `Cache-Control: no-cache, no-store, must-revalidate` and friends.
    #[default]
    NoCache,
    /// `Last-Modified` from the frame timestamp; `If-Modified-Since` can
    /// short-circuit to 304.
    LastModified,
}

/// Serves the connector's latest frame as a single JPEG per request.
pub struct SnapshotService {
    connector: Arc<StreamConnector>,
    mode: CacheMode,
}

impl SnapshotService {
    pub fn new(connector: Arc<StreamConnector>, mode: CacheMode) -> Self {
        Self { connector, mode }
    }

    /// Build the response for one request and signal liveness to the
    /// connector. Never fails: before the first frame the body is empty.
    pub fn respond(&self, request_headers: &HeaderMap) -> Response {
        let frame = self.connector.cache().snapshot();
        let response = match self.mode {
            CacheMode::NoCache => no_cache_response(frame.map(|f| f.data).unwrap_or_default()),
            CacheMode::LastModified => conditional_response(frame, request_headers),
        };
        self.connector.signal_demand();
        response
    }

    pub fn into_router(self, path: &str) -> Router {
        Router::new()
            .route(path, get(serve_snapshot))
            .with_state(Arc::new(self))
    }
}

/// GET handler for a snapshot path.
pub async fn serve_snapshot(
    State(service): State<Arc<SnapshotService>>,
    headers: HeaderMap,
) -> Response {
    service.respond(&headers)
}

fn no_cache_response(body: Bytes) -> Response {
    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, IMAGE_JPEG),
            (CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (PRAGMA, "no-cache"),
            (EXPIRES, "0"),
        ],
        body,
    )
        .into_response()
}

fn conditional_response(frame: Option<Frame>, request_headers: &HeaderMap) -> Response {
    let Some(frame) = frame else {
        return (StatusCode::OK, [(CONTENT_TYPE, IMAGE_JPEG)], Bytes::new()).into_response();
    };

    // HTTP dates have one-second resolution
    let modified = frame.captured_at.trunc_subsecs(0);
    let last_modified = modified.format(HTTP_DATE).to_string();

    if if_modified_since(request_headers).is_some_and(|since| modified <= since) {
        return (StatusCode::NOT_MODIFIED, [(LAST_MODIFIED, last_modified)]).into_response();
    }

    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, IMAGE_JPEG.to_string()),
            (LAST_MODIFIED, last_modified),
        ],
        frame.data,
    )
        .into_response()
}

fn if_modified_since(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let value = headers.get(IF_MODIFIED_SINCE)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}
