//! Viewport ownership with a trailing debounce.
//!
//! Committed viewports are published on a `watch` channel; dependents
//! subscribe and refetch when it changes. A burst of user-driven changes
//! commits once, with the value of the last call, `debounce` after that call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::geo_utils::viewport_around;
use crate::{GpsPoint, Viewport};

pub struct ViewportController {
    debounce: Duration,
    tx: Arc<watch::Sender<Option<Viewport>>>,
    /// The single pending debounced commit, if any.
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl ViewportController {
    pub fn new(debounce: Duration) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { debounce, tx: Arc::new(tx), pending: Mutex::new(None) }
    }

    /// Last committed viewport.
    pub fn current(&self) -> Option<Viewport> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Viewport>> {
        self.tx.subscribe()
    }

    /// User-driven change: (re)schedule the commit `debounce` from now.
    pub fn on_external_change(&self, region: Viewport) {
        let tx = self.tx.clone();
        let deadline = Instant::now() + self.debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            commit(&tx, region);
        });
        if let Some(previous) = self.replace_pending(Some(task)) {
            debug!("[ViewportController] debounce rescheduled");
            previous.abort();
        }
    }

    /// Programmatic change, committed immediately. Cancels a pending debounce.
    pub fn center_on(&self, point: GpsPoint, radius_meters: f64) -> Viewport {
        self.cancel_pending();
        let viewport = viewport_around(point, radius_meters);
        commit(&self.tx, viewport);
        viewport
    }

    pub fn cancel_pending(&self) {
        if let Some(task) = self.replace_pending(None) {
            task.abort();
        }
    }

    fn replace_pending(&self, task: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *pending, task)
    }
}

impl Drop for ViewportController {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

fn commit(tx: &watch::Sender<Option<Viewport>>, viewport: Viewport) {
    let changed = tx.send_if_modified(|current| {
        if *current == Some(viewport) {
            false
        } else {
            *current = Some(viewport);
            true
        }
    });
    if changed {
        debug!(
            "[ViewportController] committed {:.4},{:.4} span {:.4}x{:.4}",
            viewport.latitude, viewport.longitude, viewport.latitude_span, viewport.longitude_span
        );
    }
}
