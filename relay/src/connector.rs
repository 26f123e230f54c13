use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::FrameCache;
use crate::demand::DemandSignal;
use crate::multipart::{parse_boundary, MultipartDecoder, DEFAULT_MAX_FRAME_SIZE};
use crate::RelayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Upstream MJPEG source for one connector run.
#[derive(Debug, Clone)]
pub struct StreamTarget {
    pub url: String,
    pub credentials: Option<Credentials>,
    /// Client inactivity after which the upstream is closed. Zero holds the
    /// connection forever once opened.
    pub idle_timeout: Duration,
}

impl StreamTarget {
    /// Basic auth is only attached when both username and password are set.
    pub fn new(
        url: impl Into<String>,
        username: &str,
        password: &str,
        idle_timeout: Duration,
    ) -> Self {
        let credentials =
            (!username.is_empty() && !password.is_empty()).then(|| Credentials {
                username: username.to_string(),
                password: password.to_string(),
            });
        Self {
            url: url.into(),
            credentials,
            idle_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Delay before reconnecting after a transient failure.
    pub backoff: Duration,
    /// Consecutive unexpected statuses tolerated before giving up.
    pub status_retries: u32,
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(2),
            status_retries: 0,
            connect_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStatus {
    pub running: bool,
    pub connected: bool,
    /// Parked with no upstream connection, waiting for a client request.
    pub waiting: bool,
    pub frames: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct Shared {
    options: ConnectorOptions,
    cache: Arc<FrameCache>,
    demand: DemandSignal,
    running: AtomicBool,
    connected: AtomicBool,
    frames: AtomicU64,
    last_error: Mutex<Option<String>>,
    stop_tx: watch::Sender<bool>,
}

impl Shared {
    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

/// How a connected session ended without an error.
enum SessionEnd {
    Idle,
    Stopped,
}

/// Background owner of the upstream MJPEG connection.
///
/// The connector stays parked until a client signals demand, then holds the
/// upstream open and keeps the [`FrameCache`] current until clients stop
/// polling for `idle_timeout`. Transient failures are retried after a backoff;
/// configuration errors end the loop and flip [`is_running`](Self::is_running)
/// to false.
pub struct StreamConnector {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamConnector {
    pub fn new(options: ConnectorOptions) -> Self {
        Self::with_cache(options, Arc::new(FrameCache::new()))
    }

    pub fn with_cache(options: ConnectorOptions, cache: Arc<FrameCache>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                options,
                cache,
                demand: DemandSignal::new(),
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                frames: AtomicU64::new(0),
                last_error: Mutex::new(None),
                stop_tx,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<FrameCache> {
        &self.shared.cache
    }

    /// Tell the connector a client is polling. Returns whether an idle
    /// connector was woken.
    pub fn signal_demand(&self) -> bool {
        self.shared.demand.signal()
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.shared.demand.last_activity()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ConnectorStatus {
        ConnectorStatus {
            running: self.is_running(),
            connected: self.shared.connected.load(Ordering::Acquire),
            waiting: self.shared.demand.is_parked(),
            frames: self.shared.frames.load(Ordering::Relaxed),
            last_frame_at: self.shared.cache.last_modified(),
            last_error: self
                .shared
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Spawn the connector loop for `target`. Must be called from within a
    /// tokio runtime. A stopped or failed connector can be started again.
    pub fn start(&self, target: StreamTarget) -> Result<(), RelayError> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_running() {
            return Err(RelayError::AlreadyRunning);
        }

        let url = Url::parse(&target.url).map_err(|e| RelayError::InvalidUrl {
            url: target.url.clone(),
            reason: e.to_string(),
        })?;
        // No idle pooled sockets: every session opens a fresh connection.
        let client = reqwest::Client::builder()
            .connect_timeout(self.shared.options.connect_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(RelayError::ClientBuild)?;

        self.shared.stop_tx.send_replace(false);
        self.shared.set_last_error(None);
        self.shared.running.store(true, Ordering::Release);

        info!(
            url = %url,
            idle_timeout = ?target.idle_timeout,
            auth = target.credentials.is_some(),
            "starting stream connector"
        );

        let stop = self.shared.stop_tx.subscribe();
        let started = Instant::now();
        *task = Some(tokio::spawn(run_connector(
            Arc::clone(&self.shared),
            client,
            url,
            target,
            stop,
            started,
        )));
        Ok(())
    }

    /// Stop the loop, close any upstream connection and wait for the task to
    /// finish. A no-op on a stopped connector.
    pub async fn stop(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.running.store(false, Ordering::Release);
        self.shared.stop_tx.send_replace(true);

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "stream connector task failed");
            }
            info!("stream connector stopped");
        }
    }
}

impl Drop for StreamConnector {
    fn drop(&mut self) {
        self.shared.stop_tx.send_replace(true);
    }
}

/// Resolves once stop has been requested.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A closed channel also means nobody can restart us.
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn run_connector(
    shared: Arc<Shared>,
    client: reqwest::Client,
    url: Url,
    target: StreamTarget,
    mut stop: watch::Receiver<bool>,
    started: Instant,
) {
    // Client activity at or after this instant counts as pending demand.
    let mut checkpoint = started;
    let mut status_failures = 0u32;

    loop {
        tokio::select! {
            _ = shared.demand.wait_since(checkpoint) => {}
            _ = stopped(&mut stop) => break,
        }

        if shared.demand.is_idle(target.idle_timeout) {
            debug!(url = %url, "ignoring stale demand");
            checkpoint = Instant::now();
            continue;
        }

        let outcome = run_session(
            &shared,
            &client,
            &url,
            &target,
            &mut stop,
            &mut status_failures,
        )
        .await;
        checkpoint = Instant::now();
        shared.connected.store(false, Ordering::Release);

        match outcome {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::Idle) => {
                info!(url = %url, "no clients within idle timeout, closed MJPEG stream");
                continue;
            }
            Err(RelayError::HttpStatus(status))
                if status_failures < shared.options.status_retries =>
            {
                status_failures += 1;
                warn!(
                    url = %url,
                    status,
                    attempt = status_failures,
                    "invalid response status, retrying in {:?}",
                    shared.options.backoff
                );
                shared.set_last_error(Some(RelayError::HttpStatus(status).to_string()));
            }
            Err(RelayError::Unavailable) => {
                debug!(url = %url, "MJPEG source unavailable (503), retrying");
                shared.set_last_error(Some(RelayError::Unavailable.to_string()));
            }
            Err(
                e @ (RelayError::Multipart(_) | RelayError::StreamEnded | RelayError::HttpStream(_)),
            ) => {
                warn!(
                    error = %e,
                    url = %url,
                    "MJPEG stream interrupted, reconnecting in {:?}",
                    shared.options.backoff
                );
                shared.set_last_error(Some(e.to_string()));
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    error = %e,
                    url = %url,
                    "MJPEG connection failed, retrying in {:?}",
                    shared.options.backoff
                );
                shared.set_last_error(Some(e.to_string()));
            }
            Err(e) => {
                error!(error = %e, url = %url, "MJPEG source misconfigured, stopping connector");
                shared.set_last_error(Some(e.to_string()));
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.options.backoff) => {}
            _ = stopped(&mut stop) => break,
        }
    }

    shared.running.store(false, Ordering::Release);
    debug!(url = %url, "stream connector loop exited");
}

/// One upstream connection: request, validate, then decode frames into the
/// cache until the clients go idle, stop is requested, or something fails.
async fn run_session(
    shared: &Shared,
    client: &reqwest::Client,
    url: &Url,
    target: &StreamTarget,
    stop: &mut watch::Receiver<bool>,
    status_failures: &mut u32,
) -> Result<SessionEnd, RelayError> {
    let mut request = client.get(url.clone()).header(CONNECTION, "close");
    if let Some(credentials) = &target.credentials {
        request = request.basic_auth(&credentials.username, Some(&credentials.password));
    }

    info!(url = %url, "connecting to MJPEG stream");
    let response = tokio::select! {
        response = request.send() => response.map_err(RelayError::HttpConnect)?,
        _ = stopped(stop) => return Ok(SessionEnd::Stopped),
    };

    match response.status() {
        StatusCode::OK => *status_failures = 0,
        StatusCode::SERVICE_UNAVAILABLE => return Err(RelayError::Unavailable),
        other => return Err(RelayError::HttpStatus(other.as_u16())),
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let boundary = parse_boundary(content_type)?;

    info!(status = %response.status(), boundary = %boundary, "connected to MJPEG stream");
    shared.connected.store(true, Ordering::Release);

    let mut decoder = MultipartDecoder::new(&boundary, shared.options.max_frame_size);
    let mut body = response.bytes_stream();

    loop {
        while let Some(frame) = decoder.next_part()? {
            if frame.is_empty() {
                debug!("skipping empty multipart part");
            } else {
                let seq = shared.frames.fetch_add(1, Ordering::Relaxed);
                debug!(seq, bytes = frame.len(), "caching frame");
                shared.cache.write(frame);
            }
            if shared.demand.is_idle(target.idle_timeout) {
                return Ok(SessionEnd::Idle);
            }
        }
        if decoder.is_closed() {
            return Err(RelayError::StreamEnded);
        }

        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            _ = stopped(stop) => return Ok(SessionEnd::Stopped),
        };
        match chunk {
            Some(chunk) => decoder.push(&chunk.map_err(RelayError::HttpStream)?),
            None => {
                decoder.finish()?;
                return Err(RelayError::StreamEnded);
            }
        }
    }
}
