//! Reader/writer idle detection for control connections
//!
//! Writer idle means nothing was written for the window and a PING is due.
//! Reader idle means the peer has been silent for the window; the configured
//! callback decides what happens, closing the connection by default.

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Idle windows; `None` disables the corresponding timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub reader_idle: Option<Duration>,
    pub writer_idle: Option<Duration>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            reader_idle: Some(Duration::from_secs(60)),
            writer_idle: Some(Duration::from_secs(20)),
        }
    }
}

impl HeartbeatConfig {
    pub fn disabled() -> Self {
        Self {
            reader_idle: None,
            writer_idle: None,
        }
    }
}

/// Idle windows in seconds; `0` disables a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub reader_idle_secs: u64,
    pub writer_idle_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        let defaults = HeartbeatConfig::default();
        Self {
            reader_idle_secs: defaults.reader_idle.map(|d| d.as_secs()).unwrap_or(0),
            writer_idle_secs: defaults.writer_idle.map(|d| d.as_secs()).unwrap_or(0),
        }
    }
}

impl From<HeartbeatSettings> for HeartbeatConfig {
    fn from(settings: HeartbeatSettings) -> Self {
        let window = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        HeartbeatConfig {
            reader_idle: window(settings.reader_idle_secs),
            writer_idle: window(settings.writer_idle_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    ReaderIdle,
    WriterIdle,
}

/// What to do when the reader goes idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    Close,
    Continue,
}

pub type IdleCallback = Arc<dyn Fn() -> IdleAction + Send + Sync>;

/// Last-write timestamp, updated by the writer task without locking
#[derive(Debug)]
pub struct ActivityClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let offset = self.base.elapsed().as_millis() as u64;
        self.offset_ms.fetch_max(offset, Ordering::Relaxed);
    }

    pub fn last(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::Relaxed))
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Idle timer owned by the connection's read loop
///
/// Each timer re-arms from the moment it fired, so a silent peer produces
/// one event per window rather than one per poll.
#[derive(Debug)]
pub struct IdleMonitor {
    config: HeartbeatConfig,
    reader_mark: Instant,
    writer_mark: Instant,
    writes: Arc<ActivityClock>,
}

impl IdleMonitor {
    pub fn new(config: HeartbeatConfig, writes: Arc<ActivityClock>) -> Self {
        let now = Instant::now();
        Self {
            config,
            reader_mark: now,
            writer_mark: now,
            writes,
        }
    }

    pub fn config(&self) -> HeartbeatConfig {
        self.config
    }

    pub fn record_read(&mut self) {
        self.reader_mark = Instant::now();
    }

    fn reader_deadline(&self) -> Option<Instant> {
        self.config.reader_idle.map(|window| self.reader_mark + window)
    }

    fn writer_deadline(&self) -> Option<Instant> {
        self.config
            .writer_idle
            .map(|window| self.writer_mark.max(self.writes.last()) + window)
    }

    /// Wait for the next idle event
    ///
    /// Cancel safe: state only changes right before an event is returned.
    pub async fn next_idle(&mut self) -> IdleEvent {
        loop {
            let deadline = match (self.reader_deadline(), self.writer_deadline()) {
                (Some(r), Some(w)) => r.min(w),
                (Some(r), None) => r,
                (None, Some(w)) => w,
                (None, None) => return std::future::pending().await,
            };

            sleep_until(deadline).await;
            let now = Instant::now();

            if self.reader_deadline().is_some_and(|d| d <= now) {
                self.reader_mark = now;
                return IdleEvent::ReaderIdle;
            }
            // A write may have landed while sleeping; recompute before firing
            if self.writer_deadline().is_some_and(|d| d <= now) {
                self.writer_mark = now;
                return IdleEvent::WriterIdle;
            }
        }
    }
}
