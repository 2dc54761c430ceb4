//! Bounded worker pool for per-cell work inside one step.
//!
//! Work items run as tokio tasks in a `JoinSet`, gated by a `Semaphore` so
//! at most `limit` run at once. Results come back in input order regardless
//! of completion order, which keeps step outputs deterministic. A panicking
//! worker yields an `Err` for its own slot only.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub async fn run_bounded<I, O, F, Fut>(items: Vec<I>, limit: usize, worker: F) -> Vec<Result<O, String>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let worker = Arc::new(worker);
    let mut set = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let worker = worker.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            (index, worker(item).await)
        });
    }

    let mut slots: Vec<Option<O>> = (0..total).map(|_| None).collect();
    let mut failures: Vec<String> = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, output)) => {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = Some(output);
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "worker task failed");
                failures.push(err.to_string());
            }
        }
    }

    let reason = failures
        .first()
        .cloned()
        .unwrap_or_else(|| "worker task did not complete".to_string());
    slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| reason.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let items: Vec<u64> = vec![30, 10, 20, 0];
        let results = run_bounded(items, 4, |ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ms * 2
        })
        .await;
        let values: Vec<u64> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![60, 20, 40, 0]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        run_bounded((0..12).collect::<Vec<u32>>(), 3, move |_| {
            let active = a.clone();
            let peak = p.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_panicking_worker_only_fails_its_slot() {
        let results = run_bounded(vec![1, 2, 3], 2, |n| async move {
            if n == 2 {
                panic!("boom");
            }
            n
        })
        .await;
        assert_eq!(results[0], Ok(1));
        assert!(results[1].is_err());
        assert_eq!(results[2], Ok(3));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let results = run_bounded(Vec::<u8>::new(), 2, |n| async move { n }).await;
        assert!(results.is_empty());
    }
}
