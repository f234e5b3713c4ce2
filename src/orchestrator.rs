//! # Map Orchestrator
//!
//! Composition root of the map side. Owns the viewport controller, the feed
//! poller and the live state, and wires them together:
//!
//! - a driver task receives feed triggers (poll timer ticks, viewport commits,
//!   state transitions) and spawns the matching refresh
//! - a passive location watch tracks where the viewing user is, for camera
//!   placement only
//! - the user profile is loaded once to place the camera on the configured
//!   area of interest, falling back to the user's location
//!
//! Every state mutation happens under one lock and is preceded by a mounted
//! check, so nothing is applied after [`MapOrchestrator::unmount`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::api::{
    AreaOfInterest, Event, EventFilter, FeedApi, GroupContext, LocationProvider, MemberPosition,
    PermissionLevel, WatchOptions,
};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::merger::{FeedMode, LiveState};
use crate::poller::{Feed, FeedPoller, Flight};
use crate::spatial::EventIndex;
use crate::viewport::ViewportController;
use crate::{Bounds, GpsPoint, LocationSample, Viewport};

/// Why a refresh did not touch the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A read of the same feed was already in flight.
    Busy,
    NotMounted,
    /// The feed's preconditions do not hold (no viewport, live view off, wrong mode...).
    Gated,
    /// The mode changed while the read was in flight; the response was dropped.
    Superseded,
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Applied,
    Skipped(SkipReason),
    /// The read failed; state is unchanged and the next tick retries.
    Failed(SyncError),
}

impl RefreshOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RefreshOutcome::Applied)
    }
}

/// Derived state handed to the UI layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapSnapshot {
    pub mode: FeedMode,
    /// Sorted by id.
    pub display_events: Vec<Event>,
    pub tracked_positions: HashMap<String, Vec<LocationSample>>,
    /// Sorted by user id.
    pub group_positions: Vec<MemberPosition>,
    pub user_location: Option<GpsPoint>,
    pub viewport: Option<Viewport>,
    pub selected_event: Option<String>,
}

impl MapSnapshot {
    /// Displayed events inside `bounds`, sorted by id.
    pub fn events_within(&self, bounds: &Bounds) -> Vec<Event> {
        EventIndex::build(self.display_events.clone())
            .within(bounds)
            .into_iter()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ProfileState {
    Pending,
    Loaded(Option<AreaOfInterest>),
}

struct ViewState {
    live: LiveState,
    live_view: bool,
    map_ready: bool,
    filter: EventFilter,
    group: Option<GroupContext>,
    user_location: Option<GpsPoint>,
    profile: ProfileState,
    camera_placed: bool,
}

struct Inner {
    api: Arc<dyn FeedApi>,
    location: Arc<dyn LocationProvider>,
    config: SyncConfig,
    poller: FeedPoller,
    viewport: ViewportController,
    state: Mutex<ViewState>,
    snapshot: watch::Sender<MapSnapshot>,
    mounted: AtomicBool,
    cancel: CancellationToken,
}

pub struct MapOrchestrator {
    inner: Arc<Inner>,
}

impl MapOrchestrator {
    /// Mount the map: start the driver, the passive location watch and the
    /// one-time profile load. Must be called inside a tokio runtime.
    ///
    /// Fails with [`SyncError::InvalidConfig`] before anything is spawned.
    pub fn mount(
        api: Arc<dyn FeedApi>,
        location: Arc<dyn LocationProvider>,
        config: SyncConfig,
    ) -> crate::error::Result<Self> {
        config.validate()?;
        let (poller, triggers) = FeedPoller::new();
        let viewport = ViewportController::new(config.viewport_debounce());
        let viewports = viewport.subscribe();
        let (snapshot, _rx) = watch::channel(MapSnapshot::default());

        let inner = Arc::new(Inner {
            api,
            location,
            config,
            poller,
            viewport,
            state: Mutex::new(ViewState {
                live: LiveState::new(),
                live_view: false,
                map_ready: false,
                filter: EventFilter::default(),
                group: None,
                user_location: None,
                profile: ProfileState::Pending,
                camera_placed: false,
            }),
            snapshot,
            mounted: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(drive(inner.clone(), triggers, viewports));
        tokio::spawn(watch_user_location(inner.clone()));
        tokio::spawn(load_profile(inner.clone()));

        info!("[MapOrchestrator] mounted");
        Ok(Self { inner })
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.is_mounted()
    }

    /// Tear down: cancel every timer, task and in-flight refresh.
    ///
    /// Waits for any state mutation in progress, so nothing is merged or
    /// published once this returns.
    pub async fn unmount(&self) {
        let _state = self.inner.state.lock().await;
        self.inner.unmount();
    }

    /// Current derived state.
    pub fn snapshot(&self) -> MapSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MapSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.inner.viewport.current()
    }

    /// The map view finished loading and can report its region.
    pub async fn set_map_ready(&self) {
        self.inner.update(|state| {
            state.map_ready = true;
            true
        })
        .await;
    }

    /// Toggle live viewing ("peek" mode), which gates the events feed.
    pub async fn set_live_view(&self, active: bool) {
        self.inner.update(|state| {
            let changed = state.live_view != active;
            state.live_view = active;
            changed && active
        })
        .await;
    }

    /// User-driven region change; committed after the debounce.
    pub fn on_region_change(&self, region: Viewport) {
        if self.inner.is_mounted() {
            self.inner.viewport.on_external_change(region);
        }
    }

    /// Programmatic camera move, committed immediately.
    pub fn center_on(&self, point: GpsPoint, radius_meters: f64) -> Option<Viewport> {
        if !self.inner.is_mounted() {
            return None;
        }
        Some(self.inner.viewport.center_on(point, radius_meters))
    }

    pub async fn set_filter(&self, filter: EventFilter) {
        self.inner.update(|state| {
            if state.filter == filter {
                return false;
            }
            state.filter = filter;
            state.live_view
        })
        .await;
    }

    /// Enter, switch or leave group mode. Inactive contexts count as none.
    pub async fn set_group_context(&self, group: Option<GroupContext>) {
        let group = group.filter(|g| g.is_active);
        self.inner.update(|state| match group {
            Some(ctx) => {
                state.live.enter_group(&ctx.group_id);
                state.group = Some(ctx);
                false
            }
            None => {
                state.group = None;
                // Leaving wipes pinned events; only do it when a group was active
                state.live.group_id().is_some() && state.live.exit_group()
            }
        })
        .await;
    }

    pub async fn refresh_events(&self) -> RefreshOutcome {
        self.inner.refresh_events().await
    }

    pub async fn refresh_group_positions(&self) -> RefreshOutcome {
        self.inner.refresh_group_positions().await
    }

    pub async fn refresh_group_events(&self) -> RefreshOutcome {
        self.inner.refresh_group_events().await
    }

    pub async fn refresh_tracked_positions(&self) -> RefreshOutcome {
        self.inner.refresh_tracked_positions().await
    }

    /// Select a displayed event by id, or clear the selection with `None`.
    /// Returns false if the id is not displayed.
    pub async fn select_event(&self, event_id: Option<&str>) -> bool {
        let mut state = self.inner.state.lock().await;
        if !self.inner.is_mounted() {
            return false;
        }
        let selected = state.live.select(event_id);
        self.inner.publish(&state);
        selected
    }

    /// Select the displayed event nearest to a tap, within `radius_meters`.
    /// A tap on empty space clears the selection.
    pub async fn select_event_near(&self, point: GpsPoint, radius_meters: f64) -> Option<Event> {
        let mut state = self.inner.state.lock().await;
        if !self.inner.is_mounted() {
            return None;
        }
        let index = EventIndex::build(state.live.display_events());
        let hit = index.nearest(&point, radius_meters).cloned();
        state.live.select(hit.as_ref().map(|e| e.id.as_str()));
        self.inner.publish(&state);
        hit
    }
}

impl Drop for MapOrchestrator {
    fn drop(&mut self) {
        // Best effort: a holder of the lock may finish its current step
        let _state = self.inner.state.try_lock();
        self.inner.unmount();
    }
}

impl Inner {
    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    fn unmount(&self) {
        if self.mounted.swap(false, Ordering::AcqRel) {
            info!("[MapOrchestrator] unmounted");
        }
        self.cancel.cancel();
        self.poller.shutdown();
        self.viewport.cancel_pending();
    }

    /// Apply a UI-side transition. `change` returns whether the events feed
    /// should be refreshed right away.
    async fn update(&self, change: impl FnOnce(&mut ViewState) -> bool) {
        let mut state = self.state.lock().await;
        if !self.is_mounted() {
            return;
        }
        let refresh_events = change(&mut state);
        self.after_change(&state);
        if refresh_events {
            self.poller.trigger(Feed::Events);
        }
    }

    async fn on_viewport_committed(&self) {
        let state = self.state.lock().await;
        if !self.is_mounted() {
            return;
        }
        self.after_change(&state);
        if self.events_gate_open(&state) {
            self.poller.trigger(Feed::Events);
        }
    }

    async fn on_user_location(&self, point: GpsPoint) {
        if !point.is_valid() {
            return;
        }
        let mut state = self.state.lock().await;
        if !self.is_mounted() {
            return;
        }
        state.user_location = Some(point);
        self.place_camera(&mut state);
        self.publish(&state);
    }

    async fn on_profile_loaded(&self, area: Option<AreaOfInterest>) {
        let mut state = self.state.lock().await;
        if !self.is_mounted() {
            return;
        }
        state.profile = ProfileState::Loaded(area);
        self.place_camera(&mut state);
    }

    /// One-time initial camera: area of interest first, else the user's
    /// location. Skipped once the map already shows a region.
    fn place_camera(&self, state: &mut ViewState) {
        if state.camera_placed {
            return;
        }
        if self.viewport.current().is_some() {
            state.camera_placed = true;
            return;
        }
        let target = match state.profile {
            ProfileState::Pending => return,
            ProfileState::Loaded(Some(area)) => (area.center, area.radius_meters),
            ProfileState::Loaded(None) => match state.user_location {
                Some(point) => (point, self.config.default_camera_radius_m),
                None => return,
            },
        };
        debug!("[MapOrchestrator] initial camera at {:.4},{:.4}", target.0.latitude, target.0.longitude);
        self.viewport.center_on(target.0, target.1);
        state.camera_placed = true;
    }

    fn events_gate_open(&self, state: &ViewState) -> bool {
        state.live_view
            && state.map_ready
            && state.group.is_none()
            && self.viewport.current().is_some()
    }

    fn feed_serves_mode(&self, feed: Feed, state: &ViewState) -> bool {
        match feed {
            Feed::Events => self.events_gate_open(state),
            Feed::GroupPositions | Feed::GroupEvents => state.live.group_id().is_some(),
            Feed::TrackedPositions => !state.live.tracked_key().is_empty(),
        }
    }

    fn after_change(&self, state: &ViewState) {
        self.sync_timers(state);
        self.publish(state);
    }

    /// Start, restart or stop each feed's timer to match the current state.
    fn sync_timers(&self, state: &ViewState) {
        if self.events_gate_open(state) {
            self.poller.ensure_timer(Feed::Events, "public", self.config.events_poll_interval());
        } else {
            self.poller.stop_timer(Feed::Events);
        }

        match state.live.group_id() {
            Some(group_id) => {
                let period = self.config.group_poll_interval();
                for feed in [Feed::GroupPositions, Feed::GroupEvents] {
                    if self.poller.ensure_timer(feed, group_id, period) {
                        self.poller.trigger(feed);
                    }
                }
            }
            None => {
                self.poller.stop_timer(Feed::GroupPositions);
                self.poller.stop_timer(Feed::GroupEvents);
            }
        }

        let key = state.live.tracked_key();
        if key.is_empty() {
            self.poller.stop_timer(Feed::TrackedPositions);
        } else if self.poller.ensure_timer(
            Feed::TrackedPositions,
            &key,
            self.config.tracked_poll_interval(),
        ) {
            debug!("[MapOrchestrator] tracked set is now [{}]", key);
            self.poller.trigger(Feed::TrackedPositions);
        }
    }

    fn publish(&self, state: &ViewState) {
        let mut group_positions: Vec<MemberPosition> =
            state.live.group_positions().values().cloned().collect();
        group_positions.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        self.snapshot.send_replace(MapSnapshot {
            mode: state.live.mode().clone(),
            display_events: state.live.display_events(),
            tracked_positions: state.live.tracked_positions().clone(),
            group_positions,
            user_location: state.user_location,
            viewport: self.viewport.current(),
            selected_event: state.live.selected_event().map(str::to_string),
        });
    }

    /// Merge a response if still mounted and, when `requested` is given,
    /// still in the mode it was requested for.
    async fn apply(
        &self,
        feed: Feed,
        requested: Option<&FeedMode>,
        merge: impl FnOnce(&mut LiveState),
    ) -> RefreshOutcome {
        let mut state = self.state.lock().await;
        if !self.is_mounted() {
            return RefreshOutcome::Skipped(SkipReason::NotMounted);
        }
        if requested.is_some_and(|mode| mode != state.live.mode()) {
            debug!("[MapOrchestrator] dropping {:?} response for a previous mode", feed);
            // The current mode's trigger may have been skipped behind this read
            if self.feed_serves_mode(feed, &state) {
                self.poller.trigger(feed);
            }
            return RefreshOutcome::Skipped(SkipReason::Superseded);
        }
        merge(&mut state.live);
        self.after_change(&state);
        RefreshOutcome::Applied
    }

    async fn refresh(&self, feed: Feed) -> RefreshOutcome {
        match feed {
            Feed::Events => self.refresh_events().await,
            Feed::GroupPositions => self.refresh_group_positions().await,
            Feed::GroupEvents => self.refresh_group_events().await,
            Feed::TrackedPositions => self.refresh_tracked_positions().await,
        }
    }

    async fn refresh_events(&self) -> RefreshOutcome {
        let (bounds, filter) = {
            let state = self.state.lock().await;
            if !self.is_mounted() {
                return RefreshOutcome::Skipped(SkipReason::NotMounted);
            }
            if !self.events_gate_open(&state) {
                return RefreshOutcome::Skipped(SkipReason::Gated);
            }
            let Some(viewport) = self.viewport.current() else {
                return RefreshOutcome::Skipped(SkipReason::Gated);
            };
            (viewport.bounds(), state.filter.clone())
        };

        let flight = self
            .poller
            .run(Feed::Events, self.api.events_in_region(&bounds, &filter))
            .await;
        match flight {
            Flight::Skipped => RefreshOutcome::Skipped(SkipReason::Busy),
            Flight::Completed(Err(e)) => {
                warn!("[MapOrchestrator] events refresh failed: {}", e);
                RefreshOutcome::Failed(e)
            }
            Flight::Completed(Ok(page)) => {
                self.apply(Feed::Events, Some(&FeedMode::Public), |live| {
                    live.apply_events_page(page)
                })
                .await
            }
        }
    }

    async fn current_group(&self) -> Result<String, RefreshOutcome> {
        let state = self.state.lock().await;
        if !self.is_mounted() {
            return Err(RefreshOutcome::Skipped(SkipReason::NotMounted));
        }
        state
            .live
            .group_id()
            .map(str::to_string)
            .ok_or(RefreshOutcome::Skipped(SkipReason::Gated))
    }

    async fn refresh_group_positions(&self) -> RefreshOutcome {
        let group_id = match self.current_group().await {
            Ok(id) => id,
            Err(skipped) => return skipped,
        };
        let flight = self
            .poller
            .run(Feed::GroupPositions, self.api.group_positions(&group_id))
            .await;
        match flight {
            Flight::Skipped => RefreshOutcome::Skipped(SkipReason::Busy),
            Flight::Completed(Err(e)) => {
                warn!("[MapOrchestrator] group positions refresh failed: {}", e);
                RefreshOutcome::Failed(e)
            }
            Flight::Completed(Ok(positions)) => {
                let mode = FeedMode::Group(group_id);
                self.apply(Feed::GroupPositions, Some(&mode), |live| {
                    live.apply_group_positions(positions)
                })
                .await
            }
        }
    }

    async fn refresh_group_events(&self) -> RefreshOutcome {
        let group_id = match self.current_group().await {
            Ok(id) => id,
            Err(skipped) => return skipped,
        };
        let flight = self
            .poller
            .run(Feed::GroupEvents, self.api.group_events(&group_id))
            .await;
        match flight {
            Flight::Skipped => RefreshOutcome::Skipped(SkipReason::Busy),
            Flight::Completed(Err(e)) => {
                warn!("[MapOrchestrator] group events refresh failed: {}", e);
                RefreshOutcome::Failed(e)
            }
            Flight::Completed(Ok(page)) => {
                let mode = FeedMode::Group(group_id);
                self.apply(Feed::GroupEvents, Some(&mode), |live| live.apply_group_events(page))
                    .await
            }
        }
    }

    /// Fetch every tracked event's history, a bounded number at a time.
    /// Per-event failures are handled by the merge, not surfaced.
    async fn refresh_tracked_positions(&self) -> RefreshOutcome {
        let ids = {
            let state = self.state.lock().await;
            if !self.is_mounted() {
                return RefreshOutcome::Skipped(SkipReason::NotMounted);
            }
            state.live.tracked_event_ids()
        };
        if ids.is_empty() {
            return RefreshOutcome::Skipped(SkipReason::Gated);
        }

        let api = &self.api;
        let concurrency = self.config.max_concurrent_tracked_fetches.max(1);
        let fetch_all = stream::iter(ids)
            .map(|event_id| async move {
                let result = api.event_positions(&event_id).await;
                (event_id, result)
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>();

        match self.poller.run(Feed::TrackedPositions, fetch_all).await {
            Flight::Skipped => RefreshOutcome::Skipped(SkipReason::Busy),
            Flight::Completed(results) => {
                self.apply(Feed::TrackedPositions, None, |live| {
                    let update = live.apply_tracked_positions(results);
                    if !update.removed.is_empty() {
                        info!("[MapOrchestrator] removed deleted events {:?}", update.removed);
                    }
                })
                .await
            }
        }
    }
}

/// Route feed triggers to refreshes and viewport commits to the events feed.
async fn drive(
    inner: Arc<Inner>,
    mut triggers: mpsc::UnboundedReceiver<Feed>,
    mut viewports: watch::Receiver<Option<Viewport>>,
) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            Some(feed) = triggers.recv() => {
                let task_inner = inner.clone();
                let cancel = inner.cancel.child_token();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        outcome = task_inner.refresh(feed) => {
                            debug!("[MapOrchestrator] {:?} refresh: {:?}", feed, outcome);
                        }
                    }
                });
            }
            changed = viewports.changed() => {
                if changed.is_err() {
                    break;
                }
                viewports.borrow_and_update();
                inner.on_viewport_committed().await;
            }
        }
    }
    debug!("[MapOrchestrator] driver stopped");
}

/// Passive "where is the viewing user" signal, used for the camera only.
async fn watch_user_location(inner: Arc<Inner>) {
    let cancel = inner.cancel.clone();
    let subscribe = async {
        match inner.location.request_permission(PermissionLevel::Foreground).await {
            Ok(true) => inner.location.watch(WatchOptions::viewing()).await.map(Some),
            Ok(false) => Ok(None),
            Err(e) => Err(e),
        }
    };
    let mut rx = tokio::select! {
        _ = cancel.cancelled() => return,
        result = subscribe => match result {
            Ok(Some(rx)) => rx,
            Ok(None) => {
                info!("[MapOrchestrator] no location permission, camera uses profile only");
                return;
            }
            Err(e) => {
                warn!("[MapOrchestrator] user location unavailable: {}", e);
                return;
            }
        },
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(fix) => inner.on_user_location(fix.point()).await,
                None => break,
            },
        }
    }
}

async fn load_profile(inner: Arc<Inner>) {
    let cancel = inner.cancel.clone();
    let area = tokio::select! {
        _ = cancel.cancelled() => return,
        profile = inner.api.user_profile() => match profile {
            Ok(profile) => profile.area_of_interest,
            Err(e) => {
                warn!("[MapOrchestrator] profile unavailable, no area of interest: {}", e);
                None
            }
        },
    };
    inner.on_profile_loaded(area).await;
}
