//! Tunables for capture, upload and polling.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Configuration for the tracking pipeline and the live map feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Queue length that triggers a batch upload.
    /// Default: 5 samples
    pub batch_threshold: usize,

    /// Backlog length above which every failed upload logs a warning.
    /// The backlog itself is never capped.
    /// Default: 500 samples
    pub backlog_warn_threshold: usize,

    /// Minimum spacing between two on-demand captures.
    /// Default: 10_000 ms
    pub on_demand_min_interval_ms: u64,

    /// Distance moved that triggers a scheduled capture.
    /// Default: 50.0 meters
    pub capture_distance_interval_m: f64,

    /// Time elapsed that triggers a scheduled capture, whichever comes first.
    /// Default: 60_000 ms
    pub capture_time_interval_ms: u64,

    /// Trailing debounce applied to user-driven viewport changes.
    /// Default: 500 ms
    pub viewport_debounce_ms: u64,

    /// Default: 30_000 ms
    pub events_poll_interval_ms: u64,

    /// Applies to both group feeds. Default: 30_000 ms
    pub group_poll_interval_ms: u64,

    /// Default: 30_000 ms
    pub tracked_poll_interval_ms: u64,

    /// Radius used when the camera is centred on the viewing user.
    /// Default: 5_000.0 meters
    pub default_camera_radius_m: f64,

    /// Concurrent position-history reads per tracked refresh.
    /// Default: 4
    pub max_concurrent_tracked_fetches: usize,

    /// Storage key of the pending sample buffer.
    pub queue_key: String,

    /// Storage key of the persisted tracking session record.
    pub session_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_threshold: 5,
            backlog_warn_threshold: 500,
            on_demand_min_interval_ms: 10_000,
            capture_distance_interval_m: 50.0,
            capture_time_interval_ms: 60_000,
            viewport_debounce_ms: 500,
            events_poll_interval_ms: 30_000,
            group_poll_interval_ms: 30_000,
            tracked_poll_interval_ms: 30_000,
            default_camera_radius_m: 5_000.0,
            max_concurrent_tracked_fetches: 4,
            queue_key: "pending_samples".to_string(),
            session_key: "tracking_session".to_string(),
        }
    }
}

impl SyncConfig {
    /// Parse a (possibly partial) JSON document over the defaults and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_threshold == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_threshold must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_tracked_fetches == 0 {
            return Err(SyncError::InvalidConfig(
                "max_concurrent_tracked_fetches must be at least 1".to_string(),
            ));
        }
        let intervals = [
            ("capture_time_interval_ms", self.capture_time_interval_ms),
            ("events_poll_interval_ms", self.events_poll_interval_ms),
            ("group_poll_interval_ms", self.group_poll_interval_ms),
            ("tracked_poll_interval_ms", self.tracked_poll_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            return Err(SyncError::InvalidConfig(format!("{} must be positive", name)));
        }
        if !(self.capture_distance_interval_m > 0.0) {
            return Err(SyncError::InvalidConfig(
                "capture_distance_interval_m must be positive".to_string(),
            ));
        }
        if !(self.default_camera_radius_m > 0.0) {
            return Err(SyncError::InvalidConfig(
                "default_camera_radius_m must be positive".to_string(),
            ));
        }
        if self.queue_key.is_empty() || self.session_key.is_empty() {
            return Err(SyncError::InvalidConfig("storage keys must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn on_demand_min_interval(&self) -> Duration {
        Duration::from_millis(self.on_demand_min_interval_ms)
    }

    pub fn viewport_debounce(&self) -> Duration {
        Duration::from_millis(self.viewport_debounce_ms)
    }

    pub fn events_poll_interval(&self) -> Duration {
        Duration::from_millis(self.events_poll_interval_ms)
    }

    pub fn group_poll_interval(&self) -> Duration {
        Duration::from_millis(self.group_poll_interval_ms)
    }

    pub fn tracked_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tracked_poll_interval_ms)
    }
}
