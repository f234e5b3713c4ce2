//! Scripted fakes for the engine's collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::api::{
    Event, EventFilter, EventStatus, EventsPage, FeedApi, LocationProvider, MemberPosition,
    PermissionLevel, PositionSink, UserProfile, WatchOptions,
};
use crate::error::{Result, SyncError};
use crate::store::{KeyValueStore, MemoryStore};
use crate::{Bounds, GpsPoint, LocationSample};

pub fn sample(i: i64) -> LocationSample {
    LocationSample::new(51.5 + i as f64 * 0.001, -0.12, 1_700_000_000_000 + i * 1_000)
}

pub fn event(id: &str) -> Event {
    Event {
        id: id.to_string(),
        status: EventStatus::InProgress,
        real_time_tracking: false,
        is_urgent: false,
        location: GpsPoint::new(51.5, -0.12),
        title: None,
        category: None,
        updated_at: 0,
    }
}

pub fn tracked_event(id: &str) -> Event {
    Event { real_time_tracking: true, ..event(id) }
}

pub fn urgent_tracked_event(id: &str) -> Event {
    Event { real_time_tracking: true, is_urgent: true, ..event(id) }
}

pub fn page(events: Vec<Event>, closed: &[&str]) -> EventsPage {
    EventsPage { events, closed_ids: closed.iter().map(|s| s.to_string()).collect() }
}

/// Yield to the scheduler until `cond` holds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Block the next call on a one-shot gate until released.
#[derive(Default)]
pub struct Hold {
    gate: Mutex<Option<Arc<Notify>>>,
}

impl Hold {
    pub fn arm(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(notify.clone());
        notify
    }

    async fn pass(&self) {
        let gate = self.gate.lock().unwrap().take();
        if let Some(notify) = gate {
            notify.notified().await;
        }
    }
}

// ============================================================================
// Position sink
// ============================================================================

#[derive(Default)]
pub struct MockSink {
    fail_remaining: AtomicUsize,
    calls: AtomicUsize,
    delivered: Mutex<Vec<Vec<LocationSample>>>,
    pub hold: Hold,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<LocationSample>> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_samples(&self) -> Vec<LocationSample> {
        self.batches().into_iter().flatten().collect()
    }

    async fn accept(&self, samples: Vec<LocationSample>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.hold.pass().await;
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::Network("connection reset".to_string()));
        }
        self.delivered.lock().unwrap().push(samples);
        Ok(())
    }
}

#[async_trait]
impl PositionSink for MockSink {
    async fn submit_sample(&self, sample: &LocationSample) -> Result<()> {
        self.accept(vec![*sample]).await
    }

    async fn submit_batch(&self, samples: &[LocationSample]) -> Result<()> {
        self.accept(samples.to_vec()).await
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        self.inner.load(key).await
    }

    async fn store(&self, key: &str, value: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
        }
        self.inner.store(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await
    }
}

// ============================================================================
// Remote read API
// ============================================================================

#[derive(Default)]
pub struct MockFeedApi {
    pub events_page: Mutex<EventsPage>,
    pub positions: Mutex<HashMap<String, Vec<LocationSample>>>,
    pub group_positions: Mutex<Vec<MemberPosition>>,
    pub group_events: Mutex<EventsPage>,
    pub profile: Mutex<UserProfile>,
    pub fail_events: AtomicBool,
    pub fail_profile: AtomicBool,
    pub events_hold: Hold,
    pub group_positions_hold: Hold,
    pub last_bounds: Mutex<Option<Bounds>>,
    pub last_filter: Mutex<Option<EventFilter>>,
    events_calls: AtomicUsize,
    events_in_flight: AtomicUsize,
    max_events_in_flight: AtomicUsize,
    positions_calls: AtomicUsize,
    group_positions_calls: AtomicUsize,
    /// Group ids passed to `group_positions`, in call order.
    group_position_requests: Mutex<Vec<String>>,
    group_events_calls: AtomicUsize,
    profile_calls: AtomicUsize,
}

impl MockFeedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_events(&self, page: EventsPage) {
        *self.events_page.lock().unwrap() = page;
    }

    pub fn set_positions(&self, event_id: &str, samples: Vec<LocationSample>) {
        self.positions.lock().unwrap().insert(event_id.to_string(), samples);
    }

    pub fn delete_positions(&self, event_id: &str) {
        self.positions.lock().unwrap().remove(event_id);
    }

    pub fn set_group_events(&self, page: EventsPage) {
        *self.group_events.lock().unwrap() = page;
    }

    pub fn events_calls(&self) -> usize {
        self.events_calls.load(Ordering::SeqCst)
    }

    pub fn max_events_in_flight(&self) -> usize {
        self.max_events_in_flight.load(Ordering::SeqCst)
    }

    pub fn positions_calls(&self) -> usize {
        self.positions_calls.load(Ordering::SeqCst)
    }

    pub fn group_positions_calls(&self) -> usize {
        self.group_positions_calls.load(Ordering::SeqCst)
    }

    pub fn group_position_requests(&self) -> Vec<String> {
        self.group_position_requests.lock().unwrap().clone()
    }

    pub fn group_events_calls(&self) -> usize {
        self.group_events_calls.load(Ordering::SeqCst)
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedApi for MockFeedApi {
    async fn events_in_region(&self, bounds: &Bounds, filter: &EventFilter) -> Result<EventsPage> {
        self.events_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.events_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_events_in_flight.fetch_max(now, Ordering::SeqCst);
        *self.last_bounds.lock().unwrap() = Some(*bounds);
        *self.last_filter.lock().unwrap() = Some(filter.clone());

        self.events_hold.pass().await;
        self.events_in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_events.load(Ordering::SeqCst) {
            return Err(SyncError::Network("timeout".to_string()));
        }
        Ok(self.events_page.lock().unwrap().clone())
    }

    async fn event_positions(&self, event_id: &str) -> Result<Vec<LocationSample>> {
        self.positions_calls.fetch_add(1, Ordering::SeqCst);
        self.positions
            .lock()
            .unwrap()
            .get(event_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("event {}", event_id)))
    }

    async fn group_positions(&self, group_id: &str) -> Result<Vec<MemberPosition>> {
        self.group_positions_calls.fetch_add(1, Ordering::SeqCst);
        self.group_position_requests.lock().unwrap().push(group_id.to_string());
        self.group_positions_hold.pass().await;
        Ok(self.group_positions.lock().unwrap().clone())
    }

    async fn group_events(&self, _group_id: &str) -> Result<EventsPage> {
        self.group_events_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.group_events.lock().unwrap().clone())
    }

    async fn user_profile(&self) -> Result<UserProfile> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_profile.load(Ordering::SeqCst) {
            return Err(SyncError::Network("timeout".to_string()));
        }
        Ok(self.profile.lock().unwrap().clone())
    }
}

// ============================================================================
// Location sensor
// ============================================================================

pub struct MockLocation {
    grant_foreground: AtomicBool,
    grant_background: AtomicBool,
    position: Mutex<LocationSample>,
    watchers: Mutex<Vec<(WatchOptions, mpsc::Sender<LocationSample>)>>,
    permission_requests: Mutex<Vec<PermissionLevel>>,
    current_calls: AtomicUsize,
}

impl MockLocation {
    pub fn granting() -> Self {
        Self {
            grant_foreground: AtomicBool::new(true),
            grant_background: AtomicBool::new(true),
            position: Mutex::new(sample(0)),
            watchers: Mutex::new(Vec::new()),
            permission_requests: Mutex::new(Vec::new()),
            current_calls: AtomicUsize::new(0),
        }
    }

    pub fn deny(&self, level: PermissionLevel) {
        match level {
            PermissionLevel::Foreground => self.grant_foreground.store(false, Ordering::SeqCst),
            PermissionLevel::Background => self.grant_background.store(false, Ordering::SeqCst),
        }
    }

    pub fn set_position(&self, sample: LocationSample) {
        *self.position.lock().unwrap() = sample;
    }

    pub fn permission_requests(&self) -> Vec<PermissionLevel> {
        self.permission_requests.lock().unwrap().clone()
    }

    pub fn current_calls(&self) -> usize {
        self.current_calls.load(Ordering::SeqCst)
    }

    /// Subscriptions whose receiver is still alive.
    pub fn active_watchers(&self) -> usize {
        self.watchers.lock().unwrap().iter().filter(|(_, tx)| !tx.is_closed()).count()
    }

    pub fn watch_options(&self) -> Vec<WatchOptions> {
        self.watchers.lock().unwrap().iter().map(|(opts, _)| *opts).collect()
    }

    /// Deliver a fix to every live subscription.
    pub async fn emit(&self, sample: LocationSample) {
        let senders: Vec<mpsc::Sender<LocationSample>> =
            self.watchers.lock().unwrap().iter().map(|(_, tx)| tx.clone()).collect();
        for tx in senders {
            let _ = tx.send(sample).await;
        }
    }
}

#[async_trait]
impl LocationProvider for MockLocation {
    async fn request_permission(&self, level: PermissionLevel) -> Result<bool> {
        self.permission_requests.lock().unwrap().push(level);
        Ok(match level {
            PermissionLevel::Foreground => self.grant_foreground.load(Ordering::SeqCst),
            PermissionLevel::Background => self.grant_background.load(Ordering::SeqCst),
        })
    }

    async fn current_position(&self) -> Result<LocationSample> {
        self.current_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.position.lock().unwrap())
    }

    async fn watch(&self, options: WatchOptions) -> Result<mpsc::Receiver<LocationSample>> {
        let (tx, rx) = mpsc::channel(16);
        self.watchers.lock().unwrap().push((options, tx));
        Ok(rx)
    }
}
