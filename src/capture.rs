//! Distance/time dual trigger for scheduled captures.
//!
//! A fix is admitted when the device moved at least the distance interval
//! since the last admitted fix, or when the time interval elapsed, whichever
//! happens first. Platforms only treat watch options as hints, so the gate is
//! applied to every delivered fix.

use crate::config::SyncConfig;
use crate::geo_utils::haversine_distance;
use crate::LocationSample;

#[derive(Debug, Clone)]
pub struct CaptureGate {
    distance_interval_m: f64,
    time_interval_ms: i64,
    last: Option<LocationSample>,
}

impl CaptureGate {
    pub fn new(distance_interval_m: f64, time_interval_ms: u64) -> Self {
        Self {
            distance_interval_m,
            time_interval_ms: i64::try_from(time_interval_ms).unwrap_or(i64::MAX),
            last: None,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.capture_distance_interval_m, config.capture_time_interval_ms)
    }

    /// Record a fix that was captured out-of-band as the reference point.
    pub fn seed(&mut self, sample: LocationSample) {
        self.last = Some(sample);
    }

    /// Decide whether `sample` becomes a capture. Admitted fixes become the
    /// new reference point.
    pub fn admit(&mut self, sample: &LocationSample) -> bool {
        if !sample.point().is_valid() {
            return false;
        }
        let Some(last) = self.last else {
            self.last = Some(*sample);
            return true;
        };
        // Late delivery of an older fix
        if sample.captured_at < last.captured_at {
            return false;
        }

        let moved = haversine_distance(&last.point(), &sample.point());
        let elapsed = sample.captured_at - last.captured_at;
        if moved >= self.distance_interval_m || elapsed >= self.time_interval_ms {
            self.last = Some(*sample);
            true
        } else {
            false
        }
    }
}
