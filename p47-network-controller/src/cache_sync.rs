use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;

/// How often [`wait_for_cache_sync`] polls the sync predicates.
pub(crate) const SYNCED_POLL_PERIOD: Duration = Duration::from_millis(100);

pub(crate) trait HasSynced: Send + Sync {
    /// Whether the cache received its complete initial listing.
    fn has_synced(&self) -> bool;
}

impl<F> HasSynced for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn has_synced(&self) -> bool {
        self()
    }
}

/// Sync flag of a single informer, set once and never cleared.
#[derive(Clone, Default)]
pub(crate) struct InformerSynced(Arc<AtomicBool>);

impl InformerSynced {
    pub fn mark_synced(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl HasSynced for InformerSynced {
    fn has_synced(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Waits until every predicate reports synced.
///
/// Returns `false` if `stop` fires first, or if `timeout` elapses without any
/// further predicate becoming synced.
pub(crate) async fn wait_for_cache_sync(
    stop: &CancellationToken,
    timeout: Duration,
    synced: &[Arc<dyn HasSynced>],
) -> bool {
    let mut last_progress = 0usize;
    let mut deadline = Instant::now() + timeout;
    loop {
        let done = synced.iter().filter(|s| s.has_synced()).count();
        if done == synced.len() {
            return true;
        }
        let now = Instant::now();
        if done > last_progress {
            last_progress = done;
            deadline = now + timeout;
        } else if now >= deadline {
            warn!(
                "gave up waiting for caches to sync after {:?}, {} of {} synced",
                timeout,
                done,
                synced.len()
            );
            return false;
        }
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("stop requested while waiting for caches to sync");
                return false;
            }
            _ = sleep(SYNCED_POLL_PERIOD) => (),
        }
    }
}
