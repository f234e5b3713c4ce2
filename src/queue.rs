//! Durable pending-sample buffer.
//!
//! Samples are kept in capture order in memory and mirrored in full to a
//! [`KeyValueStore`] after every mutation. A sample only leaves the buffer
//! through [`DurableSampleQueue::confirm`], after the batch containing it was
//! delivered.
//!
//! If the store fails, the in-memory copy stays authoritative: the error is
//! returned and logged, and the next mutation rewrites the full buffer.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{info, warn};

use crate::error::Result;
use crate::store::KeyValueStore;
use crate::LocationSample;

pub struct DurableSampleQueue {
    store: Arc<dyn KeyValueStore>,
    key: String,
    samples: VecDeque<LocationSample>,
    /// Last write to the store failed; durability is degraded until the next success.
    degraded: bool,
}

impl DurableSampleQueue {
    /// Open the queue stored under `key`, restoring samples left over from a
    /// previous process.
    ///
    /// A buffer that no longer parses is moved to `<key>.corrupt` and the
    /// queue opens empty. If it cannot be moved it stays where it is and the
    /// queue opens degraded; the next successful write replaces it.
    pub async fn open(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let mut degraded = false;
        let samples: VecDeque<LocationSample> = match store.load(&key).await? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!("[DurableSampleQueue] buffer '{}' is unreadable, starting empty: {}", key, e);
                    degraded = !set_aside(store.as_ref(), &key, &json).await;
                    VecDeque::new()
                }
            },
            None => VecDeque::new(),
        };
        if !samples.is_empty() {
            info!("[DurableSampleQueue] restored {} pending samples from '{}'", samples.len(), key);
        }
        Ok(Self { store, key, samples, degraded })
    }

    /// Add a sample at the tail. The sample is kept even if persisting fails.
    pub async fn append(&mut self, sample: LocationSample) -> Result<()> {
        self.samples.push_back(sample);
        self.persist().await
    }

    /// Up to `max_count` oldest samples, without removing them.
    pub fn drain(&self, max_count: usize) -> Vec<LocationSample> {
        self.samples.iter().take(max_count).copied().collect()
    }

    /// Every pending sample, oldest first.
    pub fn peek_all(&self) -> Vec<LocationSample> {
        self.samples.iter().copied().collect()
    }

    /// Remove the oldest `count` samples after they were delivered.
    /// Returns how many were removed.
    pub async fn confirm(&mut self, count: usize) -> Result<usize> {
        let removed = count.min(self.samples.len());
        self.samples.drain(..removed);
        self.persist().await?;
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True when the last persist failed and the store lags the in-memory buffer.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    async fn persist(&mut self) -> Result<()> {
        let json = serde_json::to_string(&self.samples)?;
        match self.store.store(&self.key, &json).await {
            Ok(()) => {
                if self.degraded {
                    info!("[DurableSampleQueue] storage recovered ({} samples)", self.samples.len());
                }
                self.degraded = false;
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[DurableSampleQueue] persist failed, keeping {} samples in memory: {}",
                    self.samples.len(),
                    e
                );
                self.degraded = true;
                Err(e)
            }
        }
    }
}

/// Copy an unreadable buffer to `<key>.corrupt` and clear `key`.
async fn set_aside(store: &dyn KeyValueStore, key: &str, json: &str) -> bool {
    let aside = format!("{}.corrupt", key);
    if let Err(e) = store.store(&aside, json).await {
        warn!("[DurableSampleQueue] could not keep unreadable buffer as '{}': {}", aside, e);
        return false;
    }
    match store.remove(key).await {
        Ok(()) => {
            info!("[DurableSampleQueue] unreadable buffer kept as '{}'", aside);
            true
        }
        Err(e) => {
            warn!("[DurableSampleQueue] could not clear '{}': {}", key, e);
            false
        }
    }
}
