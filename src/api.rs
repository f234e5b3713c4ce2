//! Interfaces to the collaborators the engine consumes: the remote read API,
//! the remote position sink and the platform location sensor.
//!
//! Entity types mirror the remote wire format (camelCase JSON).

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::{Bounds, GpsPoint, LocationSample};

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventStatus {
    InProgress,
    Closed,
}

/// A reported event shown on the live map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub status: EventStatus,
    #[serde(default)]
    pub real_time_tracking: bool,
    #[serde(default)]
    pub is_urgent: bool,
    pub location: GpsPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub updated_at: i64,
}

impl Event {
    pub fn is_in_progress(&self) -> bool {
        self.status == EventStatus::InProgress
    }

    /// Real-time tracked and still running: its position history is polled.
    pub fn is_tracked(&self) -> bool {
        self.real_time_tracking && self.is_in_progress()
    }

    /// Survives the switch into group mode.
    pub fn is_urgent_tracked(&self) -> bool {
        self.is_urgent && self.is_tracked()
    }
}

/// One page of a region or group event query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    pub events: Vec<Event>,
    /// Ids of events that were closed since they were last reported.
    #[serde(default)]
    pub closed_ids: Vec<String>,
}

/// Last known position of a group member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberPosition {
    pub user_id: String,
    pub location: GpsPoint,
    /// Unix timestamp in milliseconds
    pub updated_at: i64,
}

/// An active group the viewing user is sharing position with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupContext {
    pub group_id: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl GroupContext {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self { group_id: group_id.into(), members: Vec::new(), is_active: true }
    }
}

/// A user-configured area the camera opens on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaOfInterest {
    pub center: GpsPoint,
    pub radius_meters: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub area_of_interest: Option<AreaOfInterest>,
}

/// User-selected restriction of the public events feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    /// Empty means all categories.
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub urgent_only: bool,
}

// ============================================================================
// Remote APIs
// ============================================================================

/// Remote read API for events, tracked routes and group data.
///
/// Implementations return [`crate::SyncError::NotFound`] when an id no longer exists.
#[async_trait]
pub trait FeedApi: Send + Sync {
    /// Events inside a bounding box.
    async fn events_in_region(&self, bounds: &Bounds, filter: &EventFilter) -> Result<EventsPage>;

    /// Position history of one tracked event, oldest first.
    async fn event_positions(&self, event_id: &str) -> Result<Vec<LocationSample>>;

    async fn group_positions(&self, group_id: &str) -> Result<Vec<MemberPosition>>;

    async fn group_events(&self, group_id: &str) -> Result<EventsPage>;

    async fn user_profile(&self) -> Result<UserProfile>;
}

/// Remote position submission. Tolerates occasional duplicates.
#[async_trait]
pub trait PositionSink: Send + Sync {
    async fn submit_sample(&self, sample: &LocationSample) -> Result<()>;

    async fn submit_batch(&self, samples: &[LocationSample]) -> Result<()>;
}

// ============================================================================
// Platform location sensor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionLevel {
    Foreground,
    /// Delivery while the app is not foregrounded; requires foreground first.
    Background,
}

/// Options for a continuous location subscription.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    /// Minimum movement in meters between deliveries
    pub distance_interval_m: f64,
    /// Minimum time between deliveries
    pub time_interval_ms: u64,
    /// Keep delivering while the application is backgrounded
    pub background: bool,
}

impl WatchOptions {
    /// Passive "where am I" updates for camera placement.
    pub fn viewing() -> Self {
        Self { distance_interval_m: 10.0, time_interval_ms: 5_000, background: false }
    }
}

/// Platform location sensor.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Ask for access at `level`. Returns whether it was granted.
    async fn request_permission(&self, level: PermissionLevel) -> Result<bool>;

    /// One-shot fix.
    async fn current_position(&self) -> Result<LocationSample>;

    /// Continuous updates. The subscription ends when the receiver is dropped.
    async fn watch(&self, options: WatchOptions) -> Result<mpsc::Receiver<LocationSample>>;
}
