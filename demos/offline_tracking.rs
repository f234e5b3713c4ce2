//! Tracking through a flaky connection with a file-backed queue.
//!
//! Run with: cargo run --example offline_tracking

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use livemap_sync::{
    now_millis, BatchUploader, DurableSampleQueue, FileStore, LocationProvider, LocationSample,
    PermissionLevel, PositionSink, SyncConfig, SyncError, TrackingMode, TrackingSession,
    WatchOptions,
};
use tokio::sync::mpsc;

/// Rejects the first `offline_calls` submissions, then prints what it receives.
struct PrintingSink {
    offline_calls: AtomicUsize,
}

impl PrintingSink {
    fn check_online(&self) -> livemap_sync::Result<()> {
        let offline = self
            .offline_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if offline {
            println!("   [sink] offline, rejecting");
            return Err(SyncError::Network("offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PositionSink for PrintingSink {
    async fn submit_sample(&self, sample: &LocationSample) -> livemap_sync::Result<()> {
        self.check_online()?;
        println!("   [sink] 1 sample at {:.5},{:.5}", sample.latitude, sample.longitude);
        Ok(())
    }

    async fn submit_batch(&self, samples: &[LocationSample]) -> livemap_sync::Result<()> {
        self.check_online()?;
        println!("   [sink] batch of {} samples", samples.len());
        Ok(())
    }
}

/// Walks north in 60m steps, one fix per simulated second.
struct WalkingSensor;

#[async_trait]
impl LocationProvider for WalkingSensor {
    async fn request_permission(&self, _level: PermissionLevel) -> livemap_sync::Result<bool> {
        Ok(true)
    }

    async fn current_position(&self) -> livemap_sync::Result<LocationSample> {
        Ok(LocationSample::new(51.5074, -0.1278, now_millis()))
    }

    async fn watch(&self, _options: WatchOptions) -> livemap_sync::Result<mpsc::Receiver<LocationSample>> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let start = now_millis();
            for step in 1..=12 {
                let fix = LocationSample::new(
                    51.5074 + step as f64 * 0.00054,
                    -0.1278,
                    start + step * 1_000,
                );
                if tx.send(fix).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        Ok(rx)
    }
}

#[tokio::main]
async fn main() -> livemap_sync::Result<()> {
    println!("Offline Tracking Example\n");

    let dir = std::env::temp_dir().join("livemap-sync-demo");
    let store = Arc::new(FileStore::open(&dir).await?);
    let config = SyncConfig::default();

    let queue = DurableSampleQueue::open(store.clone(), config.queue_key.clone()).await?;
    println!("1. Opened queue in {} ({} samples restored)", dir.display(), queue.len());

    let sink = Arc::new(PrintingSink { offline_calls: AtomicUsize::new(4) });
    let uploader = Arc::new(BatchUploader::new(queue, sink, &config));
    let session = TrackingSession::new(Arc::new(WalkingSensor), uploader.clone(), store.clone(), config);

    println!("2. Starting foreground tracking");
    session.start(TrackingMode::Foreground).await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    println!("   pending after walk: {}", uploader.pending().await);

    println!("3. Stopping (flushes the queue)");
    let outcome = session.stop().await;
    println!("   flush: {:?}, pending: {}", outcome, uploader.pending().await);

    Ok(())
}
