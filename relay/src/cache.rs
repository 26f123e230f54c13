use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::{PoisonError, RwLock};

/// A complete JPEG frame as cut from the upstream multipart body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub captured_at: DateTime<Utc>,
}

/// Single-slot cache holding the most recent frame.
///
/// Writers swap in a whole new [`Frame`]; readers clone the `Bytes` handle,
/// so a reader sees either the old frame or the new one, never a mix.
#[derive(Debug, Default)]
pub struct FrameCache {
    slot: RwLock<Option<Frame>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached frame, stamped with the current time.
    pub fn write(&self, data: Bytes) {
        self.write_at(data, Utc::now());
    }

    pub fn write_at(&self, data: Bytes, captured_at: DateTime<Utc>) {
        let frame = Frame { data, captured_at };
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    /// Current frame bytes; empty before the first frame arrives.
    pub fn read(&self) -> Bytes {
        self.snapshot().map(|frame| frame.data).unwrap_or_default()
    }

    /// Frame bytes and timestamp, read together.
    pub fn snapshot(&self) -> Option<Frame> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.snapshot().map(|frame| frame.captured_at)
    }
}
