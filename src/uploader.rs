//! Batch uploader draining the durable queue to the remote position sink.
//!
//! Delivery is at-least-once:
//! - An upload takes every queued sample and confirms exactly that many on
//!   success, so samples appended while the request was in flight stay queued.
//! - On failure nothing is removed and no retry timer is started. The next
//!   trigger (sample arrival past the threshold, or a flush) retries with the
//!   larger batch.
//! - A confirm racing a false-negative network error can still deliver a
//!   batch twice; the sink tolerates duplicates.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::api::PositionSink;
use crate::config::SyncConfig;
use crate::queue::DurableSampleQueue;
use crate::LocationSample;

/// Result of one upload trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Below the batch threshold; nothing attempted.
    Queued { pending: usize },
    /// Another upload is in flight; this trigger was dropped.
    Busy,
    /// Nothing to send.
    Empty,
    Delivered(usize),
    /// The sink rejected the batch; all samples are still queued.
    Failed { pending: usize },
}

pub struct BatchUploader {
    queue: Mutex<DurableSampleQueue>,
    sink: Arc<dyn PositionSink>,
    batch_threshold: usize,
    backlog_warn_threshold: usize,
    /// Held for the duration of one upload so at most one is in flight.
    in_flight: Mutex<()>,
}

impl BatchUploader {
    pub fn new(queue: DurableSampleQueue, sink: Arc<dyn PositionSink>, config: &SyncConfig) -> Self {
        Self {
            queue: Mutex::new(queue),
            sink,
            batch_threshold: config.batch_threshold.max(1),
            backlog_warn_threshold: config.backlog_warn_threshold,
            in_flight: Mutex::new(()),
        }
    }

    /// Queue a captured sample and upload once the threshold is reached.
    pub async fn push(&self, sample: LocationSample) -> UploadOutcome {
        let pending = {
            let mut queue = self.queue.lock().await;
            if let Err(e) = queue.append(sample).await {
                warn!("[BatchUploader] sample kept in memory only: {}", e);
            }
            queue.len()
        };

        if pending < self.batch_threshold {
            return UploadOutcome::Queued { pending };
        }

        match self.in_flight.try_lock() {
            Ok(_guard) => self.upload_all().await,
            Err(_) => {
                debug!("[BatchUploader] upload in flight, {} samples wait for the next trigger", pending);
                UploadOutcome::Busy
            }
        }
    }

    /// Upload everything queued, waiting for an in-flight upload to finish first.
    pub async fn flush(&self) -> UploadOutcome {
        let _guard = self.in_flight.lock().await;
        self.upload_all().await
    }

    /// Send one sample immediately, bypassing the batch. If the sink rejects
    /// it, the sample is queued for the next batch instead of being dropped.
    pub async fn submit_now(&self, sample: LocationSample) -> UploadOutcome {
        match self.sink.submit_sample(&sample).await {
            Ok(()) => {
                debug!("[BatchUploader] out-of-band sample delivered");
                UploadOutcome::Delivered(1)
            }
            Err(e) => {
                warn!("[BatchUploader] out-of-band sample failed, queueing: {}", e);
                let mut queue = self.queue.lock().await;
                if let Err(e) = queue.append(sample).await {
                    warn!("[BatchUploader] sample kept in memory only: {}", e);
                }
                UploadOutcome::Failed { pending: queue.len() }
            }
        }
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn pending_samples(&self) -> Vec<LocationSample> {
        self.queue.lock().await.peek_all()
    }

    /// Caller must hold `in_flight`.
    async fn upload_all(&self) -> UploadOutcome {
        // Never hold the queue across the network call
        let batch = self.queue.lock().await.peek_all();
        if batch.is_empty() {
            return UploadOutcome::Empty;
        }
        let count = batch.len();

        let result = if count == 1 {
            self.sink.submit_sample(&batch[0]).await
        } else {
            self.sink.submit_batch(&batch).await
        };

        match result {
            Ok(()) => {
                let mut queue = self.queue.lock().await;
                if let Err(e) = queue.confirm(count).await {
                    warn!("[BatchUploader] confirmed {} samples in memory only: {}", count, e);
                }
                info!("[BatchUploader] delivered {} samples ({} still queued)", count, queue.len());
                UploadOutcome::Delivered(count)
            }
            Err(e) => {
                warn!("[BatchUploader] upload of {} samples failed, keeping them queued: {}", count, e);
                if count > self.backlog_warn_threshold {
                    warn!(
                        "[BatchUploader] backlog of {} samples exceeds {}",
                        count, self.backlog_warn_threshold
                    );
                }
                UploadOutcome::Failed { pending: count }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyValueStore, MemoryStore};
    use crate::test_support::{sample, wait_until, MockSink};

    async fn uploader(sink: Arc<MockSink>) -> Arc<BatchUploader> {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = DurableSampleQueue::open(store, "pending").await.unwrap();
        Arc::new(BatchUploader::new(queue, sink, &SyncConfig::default()))
    }

    #[tokio::test]
    async fn test_uploads_at_threshold() {
        let sink = Arc::new(MockSink::new());
        let uploader = uploader(sink.clone()).await;

        for i in 0..4 {
            assert_eq!(uploader.push(sample(i)).await, UploadOutcome::Queued { pending: i as usize + 1 });
        }
        assert_eq!(sink.calls(), 0);

        assert_eq!(uploader.push(sample(4)).await, UploadOutcome::Delivered(5));
        assert_eq!(sink.batches(), vec![(0..5).map(sample).collect::<Vec<_>>()]);
        assert_eq!(uploader.pending().await, 0);
    }

    #[tokio::test]
    async fn test_failed_batches_retry_on_flush_without_loss_or_duplicates() {
        let sink = Arc::new(MockSink::new());
        let uploader = uploader(sink.clone()).await;
        sink.fail_next(3);

        for i in 0..7 {
            uploader.push(sample(i)).await;
        }
        // Attempts at 5, 6 and 7 samples all failed
        assert_eq!(sink.calls(), 3);
        assert_eq!(uploader.pending().await, 7);

        assert_eq!(uploader.flush().await, UploadOutcome::Delivered(7));
        assert_eq!(uploader.pending().await, 0);
        assert_eq!(sink.delivered_samples(), (0..7).map(sample).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_confirms_only_uploaded_count() {
        let sink = Arc::new(MockSink::new());
        let uploader = uploader(sink.clone()).await;
        let release = sink.hold.arm();

        for i in 0..4 {
            uploader.push(sample(i)).await;
        }
        let first = tokio::spawn({
            let uploader = uploader.clone();
            async move { uploader.push(sample(4)).await }
        });
        wait_until(|| sink.calls() == 1).await;

        // Arrives while the 5-sample batch is on the wire
        assert_eq!(uploader.push(sample(5)).await, UploadOutcome::Busy);

        release.notify_one();
        assert_eq!(first.await.unwrap(), UploadOutcome::Delivered(5));
        assert_eq!(uploader.pending_samples().await, vec![sample(5)]);
    }

    #[tokio::test]
    async fn test_submit_now_queues_on_failure() {
        let sink = Arc::new(MockSink::new());
        let uploader = uploader(sink.clone()).await;

        sink.fail_next(1);
        assert_eq!(uploader.submit_now(sample(1)).await, UploadOutcome::Failed { pending: 1 });
        assert_eq!(uploader.submit_now(sample(2)).await, UploadOutcome::Delivered(1));

        assert_eq!(uploader.flush().await, UploadOutcome::Delivered(1));
        assert_eq!(sink.delivered_samples(), vec![sample(2), sample(1)]);
        assert_eq!(uploader.flush().await, UploadOutcome::Empty);
    }
}
