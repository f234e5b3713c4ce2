//! Feed polling: single-flight guards and independently scheduled timers.
//!
//! Each feed has one busy flag. A read started while the flag is set is not
//! issued at all, so at most one request per feed is ever in flight. Timers
//! do not call into the feeds directly; each tick sends the feed on a trigger
//! channel owned by whoever drives the refreshes.
//!
//! Timers are keyed. Re-ensuring a timer with the same key is a no-op, while a
//! new key restarts it, which is how the tracked-positions loop follows the
//! set of tracked events without restarting on unrelated changes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One independently polled live data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feed {
    Events,
    GroupPositions,
    GroupEvents,
    TrackedPositions,
}

impl Feed {
    pub const ALL: [Feed; 4] = [
        Feed::Events,
        Feed::GroupPositions,
        Feed::GroupEvents,
        Feed::TrackedPositions,
    ];

    fn index(self) -> usize {
        match self {
            Feed::Events => 0,
            Feed::GroupPositions => 1,
            Feed::GroupEvents => 2,
            Feed::TrackedPositions => 3,
        }
    }
}

/// At most one in-flight operation.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag, or `None` if an operation is already in flight.
    pub fn try_begin(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { busy: &self.busy })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Clears the busy flag when dropped, including when the read is cancelled.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Outcome of a guarded read.
#[derive(Debug, Clone, PartialEq)]
pub enum Flight<T> {
    /// Another read of the same feed was in flight; this one was not issued.
    Skipped,
    Completed(T),
}

struct PollTimer {
    key: String,
    cancel: CancellationToken,
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct FeedPoller {
    flights: [SingleFlight; 4],
    timers: Mutex<HashMap<Feed, PollTimer>>,
    triggers: mpsc::UnboundedSender<Feed>,
    shutdown: CancellationToken,
}

impl FeedPoller {
    /// Create a poller and the receiving end of its trigger channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Feed>) {
        let (triggers, rx) = mpsc::unbounded_channel();
        let poller = Self {
            flights: Default::default(),
            timers: Mutex::new(HashMap::new()),
            triggers,
            shutdown: CancellationToken::new(),
        };
        (poller, rx)
    }

    /// Issue `read` unless a read of `feed` is already in flight.
    pub async fn run<T, F>(&self, feed: Feed, read: F) -> Flight<T>
    where
        F: Future<Output = T>,
    {
        let Some(_guard) = self.flights[feed.index()].try_begin() else {
            debug!("[FeedPoller] {:?} busy, skipping", feed);
            return Flight::Skipped;
        };
        Flight::Completed(read.await)
    }

    pub fn is_busy(&self, feed: Feed) -> bool {
        self.flights[feed.index()].is_busy()
    }

    /// Request an immediate refresh of `feed`.
    pub fn trigger(&self, feed: Feed) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self.triggers.send(feed).is_err() {
            debug!("[FeedPoller] trigger for {:?} dropped, no driver", feed);
        }
    }

    /// Make sure `feed` ticks every `period` under `key`.
    ///
    /// Returns true if a timer was started, false if one with the same key
    /// was already running or `period` is zero. The first tick fires one
    /// period from now.
    pub fn ensure_timer(&self, feed: Feed, key: &str, period: Duration) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        if period.is_zero() {
            warn!("[FeedPoller] {:?} timer not started: zero period", feed);
            return false;
        }
        let mut timers = self.lock_timers();
        if timers.get(&feed).is_some_and(|t| t.key == key) {
            return false;
        }

        let cancel = self.shutdown.child_token();
        let triggers = self.triggers.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if triggers.send(feed).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        debug!("[FeedPoller] {:?} timer started (key '{}', every {:?})", feed, key, period);
        // Replacing drops, and so cancels, the previous timer
        timers.insert(feed, PollTimer { key: key.to_string(), cancel });
        true
    }

    pub fn stop_timer(&self, feed: Feed) {
        if self.lock_timers().remove(&feed).is_some() {
            debug!("[FeedPoller] {:?} timer stopped", feed);
        }
    }

    pub fn timer_key(&self, feed: Feed) -> Option<String> {
        self.lock_timers().get(&feed).map(|t| t.key.clone())
    }

    /// Cancel every timer; later triggers and timers are ignored.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.lock_timers().clear();
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, HashMap<Feed, PollTimer>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for FeedPoller {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
