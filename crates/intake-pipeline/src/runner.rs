//! Bounded-parallelism executor for fallible async tasks.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use intake_core::BatchResult;

/// Runs `task` over `items` with at most `limit` tasks in flight.
///
/// Every item ends up either in `successful` (as the task output) or in `failed` (as the input,
/// with the error text). A failing or panicking task never stops its siblings. `on_progress` gets
/// the running count of settled tasks; settlement order is not input order.
pub async fn run_bounded<T, R, E, F, Fut>(
    items: Vec<T>,
    limit: usize,
    task: F,
    mut on_progress: impl FnMut(usize),
) -> BatchResult<R, T>
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Display,
{
    let limit = limit.max(1);
    let mut result = BatchResult::default();
    let mut completed = 0usize;

    let mut settled = stream::iter(items)
        .map(|item| {
            let fut = AssertUnwindSafe(task(item.clone())).catch_unwind();
            async move { (item, fut.await) }
        })
        .buffer_unordered(limit);

    while let Some((item, outcome)) = settled.next().await {
        match outcome {
            Ok(Ok(value)) => result.successful.push(value),
            Ok(Err(err)) => result.record_failure(item, err),
            Err(_) => result.record_failure(item, "task panicked"),
        }
        completed += 1;
        on_progress(completed);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_the_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let result = run_bounded(
            (0..12).collect::<Vec<u32>>(),
            3,
            |n| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5 + u64::from(n % 3))).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(n * 2)
                }
            },
            |_| {},
        )
        .await;

        assert_eq!(result.successful.len(), 12);
        assert!(result.failed.is_empty());
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failures_are_isolated_and_counted() {
        let mut progress = Vec::new();
        let result = run_bounded(
            (0..10).collect::<Vec<u32>>(),
            3,
            |n| async move {
                if n == 2 || n == 7 {
                    Err(format!("upload {n} failed"))
                } else {
                    Ok(n)
                }
            },
            |done| progress.push(done),
        )
        .await;

        assert_eq!(result.successful.len(), 8);
        let mut failed: Vec<u32> = result.failed.iter().map(|f| f.item).collect();
        failed.sort_unstable();
        assert_eq!(failed, vec![2, 7]);
        assert_eq!(result.failed.iter().find(|f| f.item == 7).map(|f| f.error.as_str()), Some("upload 7 failed"));
        assert_eq!(progress, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn panicking_task_is_recorded_as_failure() {
        let result = run_bounded(
            vec![1u32, 2, 3],
            2,
            |n| async move {
                if n == 2 {
                    panic!("boom");
                }
                Ok::<_, String>(n)
            },
            |_| {},
        )
        .await;
        assert_eq!(result.total(), 3);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].item, 2);
    }

    #[tokio::test]
    async fn zero_limit_is_clamped_and_empty_input_is_fine() {
        let result = run_bounded(vec![1u8], 0, |n| async move { Ok::<_, String>(n) }, |_| {}).await;
        assert_eq!(result.successful, vec![1]);

        let empty = run_bounded(Vec::<u8>::new(), 3, |n| async move { Ok::<_, String>(n) }, |_| {}).await;
        assert_eq!(empty.total(), 0);
    }
}
