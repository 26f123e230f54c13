//! Upstream camera fixtures shared by the connector and handler tests.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio::time::Instant;

/// Serve `app` on an ephemeral local port and return its `/stream` URL.
pub(crate) async fn spawn_upstream(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/stream")
}

pub(crate) async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Endless stream emitting a part every 30ms; counts connections.
pub(crate) fn endless_upstream(connections: Arc<AtomicUsize>) -> Router {
    Router::new().route(
        "/stream",
        get(move || {
            let connections = Arc::clone(&connections);
            async move {
                connections.fetch_add(1, Ordering::SeqCst);
                let parts = futures_util::stream::unfold(0u64, |n| async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    let part = format!(
                        "--frame\r\nContent-Type: image/jpeg\r\n\r\nframe-{n}\r\n"
                    );
                    Some((Ok::<_, Infallible>(Bytes::from(part)), n + 1))
                });
                (
                    [(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")],
                    Body::from_stream(parts),
                )
            }
        }),
    )
}
