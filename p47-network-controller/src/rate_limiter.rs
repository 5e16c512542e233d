use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::time::{Duration, Instant};

/// Base delay of the per item exponential backoff.
pub(crate) const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Upper bound of the per item exponential backoff.
pub(crate) const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
/// Overall retry rate shared by all items.
pub(crate) const DEFAULT_QPS: f64 = 10.0;
pub(crate) const DEFAULT_BURST: u32 = 100;

/// Decides how long an item has to wait before it is retried.
pub(crate) trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`, records the retry.
    fn when(&self, item: &T) -> Duration;
    /// Stop tracking `item`, e.g. because it was processed successfully.
    fn forget(&self, item: &T);
    /// Number of failures recorded for `item`.
    fn num_requeues(&self, item: &T) -> u32;
    /// Delay for an item added without a prior failure. Not recorded as a
    /// retry.
    fn throttle(&self, _item: &T) -> Duration {
        Duration::ZERO
    }
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `base * 2^failures`, capped at `max`.
pub(crate) struct ItemExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Default::default(),
        }
    }
}

impl<T> RateLimiter<T> for ItemExponentialFailureRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = lock(&self.failures);
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };
        1u32.checked_shl(exp)
            .map(|factor| self.base.saturating_mul(factor))
            .unwrap_or(self.max)
            .min(self.max)
    }

    fn forget(&self, item: &T) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket over all items; limits the overall retry rate, not a single item.
pub(crate) struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        // Reserve a token, going into debt if none is left.
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }

    fn throttle(&self, item: &T) -> Duration {
        RateLimiter::<T>::when(self, item)
    }
}

/// Combines several limiters, the longest delay wins.
pub(crate) struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }

    fn throttle(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.throttle(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Per item exponential backoff combined with an overall token bucket of
/// [`DEFAULT_QPS`] and [`DEFAULT_BURST`].
pub(crate) fn default_controller_rate_limiter<T>(
    base: Duration,
    max: Duration,
) -> MaxOfRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(base, max)),
        Box::new(BucketRateLimiter::new(DEFAULT_QPS, DEFAULT_BURST)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_millis(40),
        );
        let item = "ns/x".to_string();
        let delays: Vec<Duration> = (0..6).map(|_| limiter.when(&item)).collect();
        assert_eq!(
            vec![5, 10, 20, 40, 40, 40],
            delays.iter().map(|d| d.as_millis()).collect::<Vec<_>>()
        );
        assert_eq!(6, limiter.num_requeues(&item));
    }

    #[test]
    fn forget_resets_to_base() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );
        let item = "ns/x".to_string();
        limiter.when(&item);
        limiter.when(&item);
        limiter.forget(&item);
        assert_eq!(0, limiter.num_requeues(&item));
        assert_eq!(Duration::from_millis(5), limiter.when(&item));
    }

    #[test]
    fn items_are_tracked_independently() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(1),
            Duration::from_secs(1),
        );
        let a = "a".to_string();
        let b = "b".to_string();
        limiter.when(&a);
        limiter.when(&a);
        assert_eq!(Duration::from_millis(1), limiter.when(&b));
        assert_eq!(Duration::from_millis(4), limiter.when(&a));
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );
        let item = 1u32;
        let mut last = Duration::ZERO;
        for _ in 0..100 {
            let next = limiter.when(&item);
            assert!(next >= last);
            last = next;
        }
        assert_eq!(Duration::from_secs(1000), last);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_throttles() {
        let limiter = BucketRateLimiter::new(10.0, 2);
        assert_eq!(Duration::ZERO, RateLimiter::<u32>::when(&limiter, &1));
        assert_eq!(Duration::ZERO, RateLimiter::<u32>::when(&limiter, &2));
        assert_eq!(
            Duration::from_millis(100),
            RateLimiter::<u32>::when(&limiter, &3)
        );
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(Duration::ZERO, RateLimiter::<u32>::when(&limiter, &4));
    }

    #[tokio::test(start_paused = true)]
    async fn max_of_takes_the_longest_delay() {
        let limiter: MaxOfRateLimiter<String> =
            default_controller_rate_limiter(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY);
        let item = "default/net-a".to_string();
        assert_eq!(Duration::from_millis(5), limiter.when(&item));
        assert_eq!(Duration::from_millis(10), limiter.when(&item));
        assert_eq!(2, limiter.num_requeues(&item));
        limiter.forget(&item);
        assert_eq!(0, limiter.num_requeues(&item));
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_is_not_a_failure() {
        let limiter: MaxOfRateLimiter<String> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                DEFAULT_BASE_DELAY,
                DEFAULT_MAX_DELAY,
            )),
            Box::new(BucketRateLimiter::new(10.0, 2)),
        ]);
        let item = "default/net-a".to_string();
        assert_eq!(Duration::ZERO, limiter.throttle(&item));
        assert_eq!(Duration::ZERO, limiter.throttle(&item));
        // the shared bucket still applies
        assert_eq!(Duration::from_millis(100), limiter.throttle(&item));
        assert_eq!(0, limiter.num_requeues(&item));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(DEFAULT_BASE_DELAY, limiter.when(&item));
    }
}
