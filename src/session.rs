//! Tracking session: the producer side that shares the device position.
//!
//! ```text
//! Disabled ──start──▶ RequestingPermission ──granted──▶ ActiveForeground | ActiveBackground
//!    ▲                        │ denied                          │
//!    └────────────────────────┴──────────────stop───────────────┘
//! ```
//!
//! The session owns the capture task, the uploader and the on-demand
//! throttle. Nothing here is ambient: hosts create one session per sharing
//! context and drop it (after [`TrackingSession::end`]) when the context ends.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{LocationProvider, PermissionLevel, WatchOptions};
use crate::capture::CaptureGate;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::store::KeyValueStore;
use crate::uploader::{BatchUploader, UploadOutcome};
use crate::LocationSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackingMode {
    Foreground,
    /// Keeps capturing while the app is not foregrounded.
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Disabled,
    RequestingPermission,
    ActiveForeground,
    ActiveBackground,
}

impl TrackingState {
    fn active(mode: TrackingMode) -> Self {
        match mode {
            TrackingMode::Foreground => TrackingState::ActiveForeground,
            TrackingMode::Background => TrackingState::ActiveBackground,
        }
    }

    pub fn mode(self) -> Option<TrackingMode> {
        match self {
            TrackingState::ActiveForeground => Some(TrackingMode::Foreground),
            TrackingState::ActiveBackground => Some(TrackingMode::Background),
            _ => None,
        }
    }
}

/// Result of a server-requested single capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDemandOutcome {
    /// Delivered straight to the sink.
    Submitted,
    /// The sink failed; the sample waits in the durable queue.
    Queued,
    /// Called again inside the minimum interval; ignored.
    Throttled,
    /// The session was ended.
    Inactive,
}

/// Persisted so a host can resume sharing after a restart.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    mode: Option<TrackingMode>,
}

struct CaptureTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct SessionInner {
    state: TrackingState,
    session_active: bool,
    last_on_demand_at: Option<Instant>,
    capture: Option<CaptureTask>,
}

pub struct TrackingSession {
    provider: Arc<dyn LocationProvider>,
    uploader: Arc<BatchUploader>,
    store: Arc<dyn KeyValueStore>,
    config: SyncConfig,
    inner: Mutex<SessionInner>,
    /// Parent of every capture task token; cancelled on drop.
    shutdown: CancellationToken,
}

impl TrackingSession {
    /// Create an active session with scheduled capture disabled.
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        uploader: Arc<BatchUploader>,
        store: Arc<dyn KeyValueStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            provider,
            uploader,
            store,
            config,
            inner: Mutex::new(SessionInner {
                state: TrackingState::Disabled,
                session_active: true,
                last_on_demand_at: None,
                capture: None,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Mode the previous process was sharing in, if it did not stop cleanly.
    pub async fn persisted_mode(store: &dyn KeyValueStore, config: &SyncConfig) -> Result<Option<TrackingMode>> {
        match store.load(&config.session_key).await? {
            Some(json) => Ok(serde_json::from_str::<SessionRecord>(&json)?.mode),
            None => Ok(None),
        }
    }

    pub async fn state(&self) -> TrackingState {
        self.inner.lock().await.state
    }

    pub async fn is_session_active(&self) -> bool {
        self.inner.lock().await.session_active
    }

    pub fn uploader(&self) -> &Arc<BatchUploader> {
        &self.uploader
    }

    /// Request permission and begin scheduled capture in `mode`.
    ///
    /// On grant, one sample is submitted immediately so the user is visible
    /// before the first scheduled capture. On denial the session stays
    /// `Disabled` and [`SyncError::PermissionDenied`] is returned.
    pub async fn start(&self, mode: TrackingMode) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == TrackingState::active(mode) {
            debug!("[TrackingSession] already active in {:?} mode", mode);
            return Ok(());
        }
        if let Some(task) = inner.capture.take() {
            info!("[TrackingSession] switching capture mode to {:?}", mode);
            task.cancel.cancel();
            let _ = task.handle.await;
        }

        inner.session_active = true;
        inner.state = TrackingState::RequestingPermission;
        if let Err(e) = self.request_permissions(mode).await {
            warn!("[TrackingSession] cannot start {:?} tracking: {}", mode, e);
            inner.state = TrackingState::Disabled;
            return Err(e);
        }

        let mut gate = CaptureGate::from_config(&self.config);
        match self.provider.current_position().await {
            Ok(sample) => {
                gate.seed(sample);
                self.uploader.submit_now(sample).await;
            }
            Err(e) => warn!("[TrackingSession] no immediate fix: {}", e),
        }

        let options = WatchOptions {
            distance_interval_m: self.config.capture_distance_interval_m,
            time_interval_ms: self.config.capture_time_interval_ms,
            background: mode == TrackingMode::Background,
        };
        let rx = match self.provider.watch(options).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("[TrackingSession] location watch failed: {}", e);
                inner.state = TrackingState::Disabled;
                return Err(e);
            }
        };

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(run_capture(rx, self.uploader.clone(), gate, cancel.clone()));
        inner.capture = Some(CaptureTask { cancel, handle });
        inner.state = TrackingState::active(mode);
        info!("[TrackingSession] tracking active ({:?})", mode);

        self.persist(Some(mode)).await;
        Ok(())
    }

    /// Cancel scheduled capture and flush the queue. Idempotent.
    pub async fn stop(&self) -> UploadOutcome {
        let mut inner = self.inner.lock().await;
        let was_active = inner.state != TrackingState::Disabled;
        if let Some(task) = inner.capture.take() {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
        inner.state = TrackingState::Disabled;

        let outcome = self.uploader.flush().await;
        if was_active {
            info!("[TrackingSession] tracking stopped, flush: {:?}", outcome);
            self.persist(None).await;
        }
        outcome
    }

    /// Stop, flush and deactivate. On-demand captures are rejected afterwards.
    pub async fn end(&self) -> UploadOutcome {
        let outcome = self.stop().await;
        self.inner.lock().await.session_active = false;
        outcome
    }

    /// Capture and submit one sample now, e.g. on a server ping.
    ///
    /// Calls closer together than the configured minimum interval are
    /// silently ignored to bound battery use.
    pub async fn submit_on_demand(&self) -> Result<OnDemandOutcome> {
        {
            let mut inner = self.inner.lock().await;
            if !inner.session_active {
                debug!("[TrackingSession] on-demand capture on an ended session");
                return Ok(OnDemandOutcome::Inactive);
            }
            let now = Instant::now();
            let min_interval: Duration = self.config.on_demand_min_interval();
            if let Some(last) = inner.last_on_demand_at {
                if now.duration_since(last) < min_interval {
                    debug!("[TrackingSession] on-demand capture throttled");
                    return Ok(OnDemandOutcome::Throttled);
                }
            }
            inner.last_on_demand_at = Some(now);
        }

        if !self.provider.request_permission(PermissionLevel::Foreground).await? {
            return Err(SyncError::PermissionDenied(PermissionLevel::Foreground));
        }
        let sample = self.provider.current_position().await?;
        Ok(match self.uploader.submit_now(sample).await {
            UploadOutcome::Delivered(_) => OnDemandOutcome::Submitted,
            _ => OnDemandOutcome::Queued,
        })
    }

    async fn request_permissions(&self, mode: TrackingMode) -> Result<()> {
        if !self.provider.request_permission(PermissionLevel::Foreground).await? {
            return Err(SyncError::PermissionDenied(PermissionLevel::Foreground));
        }
        if mode == TrackingMode::Background
            && !self.provider.request_permission(PermissionLevel::Background).await?
        {
            return Err(SyncError::PermissionDenied(PermissionLevel::Background));
        }
        Ok(())
    }

    async fn persist(&self, mode: Option<TrackingMode>) {
        let record = SessionRecord { mode };
        let result = match serde_json::to_string(&record) {
            Ok(json) => self.store.store(&self.config.session_key, &json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("[TrackingSession] could not persist session record: {}", e);
        }
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_capture(
    mut rx: mpsc::Receiver<LocationSample>,
    uploader: Arc<BatchUploader>,
    mut gate: CaptureGate,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(sample) => {
                    if gate.admit(&sample) {
                        uploader.push(sample).await;
                    }
                }
                None => {
                    warn!("[TrackingSession] location watch ended");
                    break;
                }
            },
        }
    }
}
