//! R-tree over the displayed events, for tap selection and viewport queries.

use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::api::Event;
use crate::geo_utils::{haversine_distance, meters_to_degrees};
use crate::{Bounds, GpsPoint};

/// An event's position with its slot in the backing list.
#[derive(Debug, Clone, Copy)]
struct IndexedEvent {
    idx: usize,
    lat: f64,
    lng: f64,
}

impl RTreeObject for IndexedEvent {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lat, self.lng])
    }
}

impl PointDistance for IndexedEvent {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlat = self.lat - point[0];
        let dlng = self.lng - point[1];
        dlat * dlat + dlng * dlng
    }
}

#[derive(Debug, Default)]
pub struct EventIndex {
    events: Vec<Event>,
    tree: RTree<IndexedEvent>,
}

impl EventIndex {
    /// Index events; those with invalid coordinates are kept out of the tree.
    pub fn build(events: Vec<Event>) -> Self {
        let indexed: Vec<IndexedEvent> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.location.is_valid())
            .map(|(idx, e)| IndexedEvent { idx, lat: e.location.latitude, lng: e.location.longitude })
            .collect();
        Self { events, tree: RTree::bulk_load(indexed) }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Events inside `bounds`, sorted by id.
    pub fn within(&self, bounds: &Bounds) -> Vec<&Event> {
        let envelope = AABB::from_corners(
            [bounds.min_lat, bounds.min_lng],
            [bounds.max_lat, bounds.max_lng],
        );
        let mut found: Vec<&Event> = self
            .tree
            .locate_in_envelope(&envelope)
            .map(|item| &self.events[item.idx])
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    /// Closest event to `point` no further than `max_distance_m`.
    pub fn nearest(&self, point: &GpsPoint, max_distance_m: f64) -> Option<&Event> {
        if !point.is_valid() {
            return None;
        }
        // Degree distance is only a pre-filter; longitude degrees shrink with
        // latitude so the candidate radius uses the longitude scale.
        let radius_deg = meters_to_degrees(max_distance_m, point.latitude);
        let query = [point.latitude, point.longitude];

        self.tree
            .locate_within_distance(query, radius_deg * radius_deg)
            .map(|item| &self.events[item.idx])
            .map(|event| (haversine_distance(point, &event.location), event))
            .filter(|(d, _)| *d <= max_distance_m)
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, event)| event)
    }
}
