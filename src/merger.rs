//! Live state and the per-feed merge policies.
//!
//! All feed state lives in one [`LiveState`] value and every merge is a single
//! `&mut self` call, so a cascade that touches several collections (an event
//! deleted upstream leaving `events`, `pinned_events` and `tracked_positions`)
//! is applied as one step and no reader sees it half done.
//!
//! Pinned events are in-progress, real-time-tracked events kept across event
//! refreshes that no longer contain them, until they are reported closed or
//! deleted.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, info};

use crate::api::{Event, EventStatus, EventsPage, MemberPosition};
use crate::error::Result;
use crate::LocationSample;

/// Which feeds drive the map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FeedMode {
    #[default]
    Public,
    Group(String),
}

/// Stable, order-independent fingerprint of a set of ids.
pub fn fingerprint<'a>(ids: impl IntoIterator<Item = &'a str>) -> String {
    let sorted: BTreeSet<&str> = ids.into_iter().collect();
    sorted.into_iter().collect::<Vec<_>>().join(",")
}

/// Result of merging one tracked-positions refresh.
#[derive(Debug, Default, PartialEq)]
pub struct TrackedUpdate {
    pub updated: Vec<String>,
    /// Reported not-found and removed from every feed.
    pub removed: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct LiveState {
    mode: FeedMode,
    events: HashMap<String, Event>,
    pinned_events: HashMap<String, Event>,
    tracked_positions: HashMap<String, Vec<LocationSample>>,
    group_positions: HashMap<String, MemberPosition>,
    group_events: HashMap<String, Event>,
    selected_event: Option<String>,
}

impl LiveState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> &FeedMode {
        &self.mode
    }

    pub fn group_id(&self) -> Option<&str> {
        match &self.mode {
            FeedMode::Group(id) => Some(id),
            FeedMode::Public => None,
        }
    }

    pub fn events(&self) -> &HashMap<String, Event> {
        &self.events
    }

    pub fn pinned_events(&self) -> &HashMap<String, Event> {
        &self.pinned_events
    }

    pub fn tracked_positions(&self) -> &HashMap<String, Vec<LocationSample>> {
        &self.tracked_positions
    }

    pub fn group_positions(&self) -> &HashMap<String, MemberPosition> {
        &self.group_positions
    }

    pub fn group_events(&self) -> &HashMap<String, Event> {
        &self.group_events
    }

    pub fn selected_event(&self) -> Option<&str> {
        self.selected_event.as_deref()
    }

    // ------------------------------------------------------------------------
    // Feed merges
    // ------------------------------------------------------------------------

    /// Merge a fresh public events page.
    ///
    /// `events` is replaced by the page, plus previously pinned events that
    /// are missing from it but still in progress and not reported closed.
    /// `pinned_events` becomes the tracked events of the page plus those
    /// survivors.
    pub fn apply_events_page(&mut self, page: EventsPage) {
        let closed = closed_set(&page);
        let fresh: HashMap<String, Event> = page
            .events
            .into_iter()
            .filter(|e| !closed.contains(&e.id))
            .map(|e| (e.id.clone(), e))
            .collect();

        let survivors: Vec<Event> = self
            .pinned_events
            .values()
            .filter(|p| !fresh.contains_key(&p.id) && p.is_in_progress() && !closed.contains(&p.id))
            .cloned()
            .collect();

        let mut pinned: HashMap<String, Event> = fresh
            .values()
            .filter(|e| e.is_tracked())
            .map(|e| (e.id.clone(), e.clone()))
            .collect();
        let mut events = fresh;
        for event in survivors {
            events.insert(event.id.clone(), event.clone());
            pinned.insert(event.id.clone(), event);
        }

        debug!(
            "[LiveStateMerger] events page: {} events, {} pinned, {} closed",
            events.len(),
            pinned.len(),
            closed.len()
        );
        self.events = events;
        self.pinned_events = pinned;
        self.remove_closed(&closed);
        self.prune_untracked();
    }

    /// Replace the group event set and drop anything the page reports closed.
    pub fn apply_group_events(&mut self, page: EventsPage) {
        let closed = closed_set(&page);
        self.group_events = page
            .events
            .into_iter()
            .filter(|e| !closed.contains(&e.id))
            .map(|e| (e.id.clone(), e))
            .collect();
        self.remove_closed(&closed);
        self.prune_untracked();
    }

    pub fn apply_group_positions(&mut self, positions: Vec<MemberPosition>) {
        self.group_positions = positions.into_iter().map(|p| (p.user_id.clone(), p)).collect();
    }

    /// Merge per-event position histories.
    ///
    /// Successful reads replace the history; not-found removes the event from
    /// every feed; other failures keep the previous history for the next cycle.
    pub fn apply_tracked_positions(
        &mut self,
        results: Vec<(String, Result<Vec<LocationSample>>)>,
    ) -> TrackedUpdate {
        let tracked = self.tracked_event_ids();
        let mut update = TrackedUpdate::default();

        for (event_id, result) in results {
            match result {
                Ok(history) => {
                    // Stopped being tracked while the read was in flight
                    if !tracked.contains(&event_id) {
                        continue;
                    }
                    self.tracked_positions.insert(event_id.clone(), history);
                    update.updated.push(event_id);
                }
                Err(e) if e.is_not_found() => {
                    self.remove_deleted(&event_id);
                    update.removed.push(event_id);
                }
                Err(e) => {
                    debug!("[LiveStateMerger] keeping stale history for {}: {}", event_id, e);
                }
            }
        }
        self.prune_untracked();
        update
    }

    /// Remove an event deleted upstream from every feed at once.
    pub fn remove_deleted(&mut self, event_id: &str) {
        info!("[LiveStateMerger] event {} deleted upstream, pruning", event_id);
        self.events.remove(event_id);
        self.pinned_events.remove(event_id);
        self.group_events.remove(event_id);
        self.tracked_positions.remove(event_id);
        if self.selected_event.as_deref() == Some(event_id) {
            self.selected_event = None;
        }
    }

    // ------------------------------------------------------------------------
    // Mode transitions
    // ------------------------------------------------------------------------

    /// Switch to group mode. Returns true if the group changed.
    ///
    /// Pinned events are pruned to urgent tracked ones and public events are
    /// cleared. Calling it again for the same group changes nothing further.
    pub fn enter_group(&mut self, group_id: &str) -> bool {
        let changed = self.group_id() != Some(group_id);
        if changed {
            // Data of a previous group does not carry over
            self.group_positions.clear();
            self.group_events.clear();
            info!("[LiveStateMerger] entering group {}", group_id);
        }
        self.pinned_events.retain(|_, e| e.is_urgent_tracked());
        self.events.clear();
        self.mode = FeedMode::Group(group_id.to_string());
        self.prune_untracked();
        self.clear_stale_selection();
        changed
    }

    /// Back to public mode. Returns true if a group was active.
    pub fn exit_group(&mut self) -> bool {
        let was_group = self.mode != FeedMode::Public;
        if was_group {
            info!("[LiveStateMerger] leaving group mode");
        }
        self.group_positions.clear();
        self.group_events.clear();
        self.tracked_positions.clear();
        self.pinned_events.clear();
        self.selected_event = None;
        self.mode = FeedMode::Public;
        was_group
    }

    // ------------------------------------------------------------------------
    // Derived views
    // ------------------------------------------------------------------------

    /// Events the map shows, deduplicated by id and sorted by id.
    ///
    /// Group mode: group events plus urgent tracked pinned events.
    /// Public mode: events plus pinned events.
    pub fn display_events(&self) -> Vec<Event> {
        let mut merged: HashMap<&str, &Event> = HashMap::new();
        match self.mode {
            FeedMode::Group(_) => {
                for e in self.group_events.values() {
                    merged.insert(&e.id, e);
                }
                for e in self.pinned_events.values().filter(|e| e.is_urgent_tracked()) {
                    merged.entry(&e.id).or_insert(e);
                }
            }
            FeedMode::Public => {
                for e in self.events.values() {
                    merged.insert(&e.id, e);
                }
                for e in self.pinned_events.values() {
                    merged.entry(&e.id).or_insert(e);
                }
            }
        }
        let mut events: Vec<Event> = merged.into_values().cloned().collect();
        events.sort_by(|a, b| a.id.cmp(&b.id));
        events
    }

    /// Ids of displayed events whose position history is polled.
    pub fn tracked_event_ids(&self) -> BTreeSet<String> {
        self.display_events()
            .into_iter()
            .filter(Event::is_tracked)
            .map(|e| e.id)
            .collect()
    }

    /// Fingerprint of [`Self::tracked_event_ids`]; empty when nothing is tracked.
    pub fn tracked_key(&self) -> String {
        let ids = self.tracked_event_ids();
        fingerprint(ids.iter().map(String::as_str))
    }

    // ------------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------------

    /// Select a displayed event. Returns false (and clears) for unknown ids.
    pub fn select(&mut self, event_id: Option<&str>) -> bool {
        self.selected_event = event_id
            .filter(|id| self.display_events().iter().any(|e| e.id == *id))
            .map(str::to_string);
        self.selected_event.is_some() || event_id.is_none()
    }

    fn clear_stale_selection(&mut self) {
        if let Some(id) = self.selected_event.clone() {
            if !self.display_events().iter().any(|e| e.id == id) {
                self.selected_event = None;
            }
        }
    }

    fn remove_closed(&mut self, closed: &HashSet<String>) {
        for id in closed {
            self.pinned_events.remove(id);
            self.events.remove(id);
            self.group_events.remove(id);
        }
        self.clear_stale_selection();
    }

    /// Keep `tracked_positions` to the current tracked set.
    fn prune_untracked(&mut self) {
        let tracked = self.tracked_event_ids();
        self.tracked_positions.retain(|id, _| tracked.contains(id));
    }
}

/// Ids reported closed, either listed explicitly or returned with closed status.
fn closed_set(page: &EventsPage) -> HashSet<String> {
    page.closed_ids
        .iter()
        .cloned()
        .chain(
            page.events
                .iter()
                .filter(|e| e.status == EventStatus::Closed)
                .map(|e| e.id.clone()),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::test_support::{event, page, sample, tracked_event, urgent_tracked_event};
    use crate::GpsPoint;

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        assert_eq!(fingerprint(["b", "a", "c"]), "a,b,c");
        assert_eq!(fingerprint(["c", "a", "b", "a"]), "a,b,c");
        assert_eq!(fingerprint(Vec::<&str>::new()), "");
    }

    #[test]
    fn test_tracked_event_survives_absence_until_closed() {
        let mut state = LiveState::new();
        state.apply_events_page(page(vec![event("a"), tracked_event("t")], &[]));
        assert_eq!(ids(&state.display_events()), vec!["a", "t"]);
        assert!(state.pinned_events().contains_key("t"));

        // Viewport moved: neither event in the page
        state.apply_events_page(page(vec![event("b")], &[]));
        assert_eq!(ids(&state.display_events()), vec!["b", "t"]);
        assert!(state.events().contains_key("t"));

        // Reported closed: gone from both sets
        state.apply_events_page(page(vec![event("b")], &["t"]));
        assert_eq!(ids(&state.display_events()), vec!["b"]);
        assert!(state.pinned_events().is_empty());
    }

    #[test]
    fn test_closed_status_in_page_counts_as_closed() {
        let mut state = LiveState::new();
        state.apply_events_page(page(vec![tracked_event("t")], &[]));

        let closed = Event { status: EventStatus::Closed, ..tracked_event("t") };
        state.apply_events_page(page(vec![closed], &[]));
        assert!(state.display_events().is_empty());
    }

    #[test]
    fn test_untracked_events_are_replaced_wholesale() {
        let mut state = LiveState::new();
        state.apply_events_page(page(vec![event("a"), event("b")], &[]));
        state.apply_events_page(page(vec![event("c")], &[]));
        assert_eq!(ids(&state.display_events()), vec!["c"]);
    }

    #[test]
    fn test_not_found_removes_from_every_feed() {
        let mut state = LiveState::new();
        state.apply_events_page(page(vec![tracked_event("e"), tracked_event("f")], &[]));
        state.apply_tracked_positions(vec![
            ("e".to_string(), Ok(vec![sample(1)])),
            ("f".to_string(), Ok(vec![sample(2)])),
        ]);
        assert!(state.select(Some("e")));

        let update = state.apply_tracked_positions(vec![
            ("e".to_string(), Err(SyncError::NotFound("e".to_string()))),
            ("f".to_string(), Ok(vec![sample(2), sample(3)])),
        ]);

        assert_eq!(update.removed, vec!["e".to_string()]);
        assert_eq!(update.updated, vec!["f".to_string()]);
        assert!(!state.events().contains_key("e"));
        assert!(!state.pinned_events().contains_key("e"));
        assert!(!state.tracked_positions().contains_key("e"));
        assert_eq!(state.tracked_positions()["f"].len(), 2);
        assert_eq!(state.selected_event(), None);
    }

    #[test]
    fn test_transient_error_keeps_previous_history() {
        let mut state = LiveState::new();
        state.apply_events_page(page(vec![tracked_event("e")], &[]));
        state.apply_tracked_positions(vec![("e".to_string(), Ok(vec![sample(1)]))]);

        let update = state.apply_tracked_positions(vec![(
            "e".to_string(),
            Err(SyncError::Network("timeout".to_string())),
        )]);
        assert_eq!(update, TrackedUpdate::default());
        assert_eq!(state.tracked_positions()["e"], vec![sample(1)]);
    }

    #[test]
    fn test_tracked_positions_follow_tracked_set() {
        let mut state = LiveState::new();
        state.apply_events_page(page(vec![tracked_event("e")], &[]));
        state.apply_tracked_positions(vec![("e".to_string(), Ok(vec![sample(1)]))]);

        state.apply_events_page(page(vec![], &["e"]));
        assert!(state.tracked_positions().is_empty());

        // A late history for an event no longer tracked is ignored
        state.apply_tracked_positions(vec![("e".to_string(), Ok(vec![sample(2)]))]);
        assert!(state.tracked_positions().is_empty());
    }

    #[test]
    fn test_enter_group_keeps_only_urgent_tracked_and_is_idempotent() {
        let mut state = LiveState::new();
        state.apply_events_page(page(
            vec![event("a"), tracked_event("t"), urgent_tracked_event("u")],
            &[],
        ));

        assert!(state.enter_group("g1"));
        let once = state.clone();
        assert!(!state.enter_group("g1"));

        assert_eq!(state.mode(), &FeedMode::Group("g1".to_string()));
        assert!(state.events().is_empty());
        assert_eq!(state.pinned_events().keys().collect::<Vec<_>>(), vec!["u"]);
        assert_eq!(ids(&state.display_events()), ids(&once.display_events()));
        assert_eq!(state.tracked_key(), once.tracked_key());
    }

    #[test]
    fn test_group_display_set_and_exit() {
        let mut state = LiveState::new();
        state.apply_events_page(page(vec![urgent_tracked_event("u")], &[]));
        state.enter_group("g1");
        state.apply_group_events(page(vec![event("g-a"), tracked_event("g-t")], &[]));
        state.apply_group_positions(vec![MemberPosition {
            user_id: "m1".to_string(),
            location: GpsPoint::new(51.5, -0.12),
            updated_at: 1,
        }]);
        state.apply_tracked_positions(vec![
            ("u".to_string(), Ok(vec![sample(1)])),
            ("g-t".to_string(), Ok(vec![sample(2)])),
        ]);

        assert_eq!(ids(&state.display_events()), vec!["g-a", "g-t", "u"]);
        assert_eq!(state.tracked_key(), "g-t,u");
        assert_eq!(state.tracked_positions().len(), 2);

        assert!(state.exit_group());
        assert_eq!(state.mode(), &FeedMode::Public);
        assert!(state.group_positions().is_empty());
        assert!(state.group_events().is_empty());
        assert!(state.tracked_positions().is_empty());
        assert!(state.pinned_events().is_empty());
        assert!(!state.exit_group());
    }

    #[test]
    fn test_switching_groups_clears_previous_group_data() {
        let mut state = LiveState::new();
        state.enter_group("g1");
        state.apply_group_events(page(vec![event("x")], &[]));

        assert!(state.enter_group("g2"));
        assert!(state.group_events().is_empty());
    }

    #[test]
    fn test_group_closed_ids_prune_pinned() {
        let mut state = LiveState::new();
        state.apply_events_page(page(vec![urgent_tracked_event("u")], &[]));
        state.enter_group("g1");
        state.apply_group_events(page(vec![], &["u"]));
        assert!(state.display_events().is_empty());
    }

    #[test]
    fn test_select_unknown_event_clears_selection() {
        let mut state = LiveState::new();
        state.apply_events_page(page(vec![event("a")], &[]));
        assert!(state.select(Some("a")));
        assert!(!state.select(Some("missing")));
        assert_eq!(state.selected_event(), None);
        assert!(state.select(None));
    }
}
