use crate::client::RotatingClient;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_REFRESH_TICK: Duration = Duration::from_secs(60);

/// Periodic task that walks every credential and enqueues refreshes for
/// OAuth tokens nearing expiry. Stop is bounded: at most two ticks, then
/// the task is aborted.
pub struct BackgroundRefresher {
    interval: Duration,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BackgroundRefresher {
    pub fn new(interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            interval,
            shutdown,
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self, client: Arc<RotatingClient>) {
        let mut rx = self.shutdown.subscribe();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracing::debug!(interval_secs = interval.as_secs(), "proactive refresh tick");
                        client.proactively_refresh_all().await;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("background refresher stopped");
        });
        *self.handle.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.interval * 2, handle).await.is_err() {
                tracing::warn!("background refresher did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}
