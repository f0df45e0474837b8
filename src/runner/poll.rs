//! Poll-until-deadline combinator
//!
//! One reusable shape for every transport-confirmation wait, instead of
//! repeating interval/deadline math across layer drivers. The probe runs
//! immediately, then at `interval`, until it yields a value or `deadline`
//! elapses. Deadline expiry returns `None` and the caller turns that into a
//! recorded timeout, never a silently dropped test.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

pub async fn poll_until<T, F, Fut>(interval: Duration, deadline: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let end = Instant::now() + deadline;
    loop {
        if let Some(value) = probe().await {
            return Some(value);
        }
        if Instant::now() + interval > end {
            return None;
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_value_once_probe_succeeds() {
        let attempts = AtomicUsize::new(0);
        let result = poll_until(Duration::from_millis(100), Duration::from_secs(10), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { (n >= 3).then_some(n) }
        })
        .await;
        assert_eq!(result, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_returns_none() {
        let attempts = AtomicUsize::new(0);
        let result: Option<()> =
            poll_until(Duration::from_millis(100), Duration::from_millis(350), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { None }
            })
            .await;
        assert_eq!(result, None);
        // Probe at t=0,100,200,300; the next tick would pass the deadline.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_runs_at_least_once_even_with_zero_deadline() {
        let attempts = AtomicUsize::new(0);
        let result = poll_until(Duration::from_millis(50), Duration::ZERO, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Some(42u32) }
        })
        .await;
        assert_eq!(result, Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
