//! Demand-driven MJPEG snapshot relay.
//!
//! A [`StreamConnector`] holds one upstream `multipart/x-mixed-replace`
//! connection open while clients are polling, keeping the newest frame in a
//! [`FrameCache`]. [`SnapshotService`] serves that frame as a single JPEG and
//! wakes the connector when a request arrives after an idle teardown.

pub mod cache;
pub mod connector;
pub mod demand;
pub mod handler;
pub mod multipart;
#[cfg(test)]
mod testutil;

pub use cache::{Frame, FrameCache};
pub use connector::{ConnectorOptions, ConnectorStatus, Credentials, StreamConnector, StreamTarget};
pub use demand::DemandSignal;
pub use handler::{CacheMode, SnapshotService};

use multipart::{ContentTypeError, MultipartError};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid stream url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("stream connector is already running")]
    AlreadyRunning,
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(reqwest::Error),
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("stream source unavailable (503 Service Unavailable)")]
    Unavailable,
    #[error("got invalid response status {0}")]
    HttpStatus(u16),
    #[error(transparent)]
    ContentType(#[from] ContentTypeError),
    #[error("multipart decode failed: {0}")]
    Multipart(#[from] MultipartError),
    #[error("MJPEG stream ended")]
    StreamEnded,
}

impl RelayError {
    /// Transient upstream failures that are retried after the backoff delay.
    ///
    /// `HttpStatus` is terminal here; the connector retries it only while the
    /// configured status allowance lasts.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpConnect(_)
            | Self::HttpStream(_)
            | Self::Unavailable
            | Self::Multipart(_)
            | Self::StreamEnded => true,
            Self::InvalidUrl { .. }
            | Self::AlreadyRunning
            | Self::ClientBuild(_)
            | Self::HttpStatus(_)
            | Self::ContentType(_) => false,
        }
    }
}
