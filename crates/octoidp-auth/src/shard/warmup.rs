//! Bounded batch fan-out for admin operations.
//!
//! Items run concurrently inside a batch and batches run one after another,
//! so at most `batch_size` operations are in flight. A failing item is
//! recorded and never aborts the rest of the run.

use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use futures_util::future::join_all;
use serde::Serialize;

/// Failure of one item.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ItemFailure {
    /// Item label.
    pub item: String,
    /// Error text.
    pub error: String,
}

/// Timing and failures of one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchTiming {
    /// Zero-based batch number.
    pub index: usize,
    /// Items in this batch.
    pub size: usize,
    /// Wall time of the batch.
    pub elapsed_ms: u128,
    /// Items that failed.
    pub failures: Vec<ItemFailure>,
}

/// Outcome of a batched run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Items submitted.
    pub total: usize,
    /// Items that succeeded.
    pub succeeded: usize,
    /// Items that failed.
    pub failed: usize,
    /// Per-batch detail.
    pub batches: Vec<BatchTiming>,
}

/// Runs `operation` over `items` in batches of `batch_size`.
///
/// Items are `(label, value)` pairs; the label identifies the item in
/// failure reports. A `batch_size` of 0 is treated as 1.
pub async fn run_batched<T, F, Fut, E>(
    items: Vec<(String, T)>,
    batch_size: usize,
    operation: F,
) -> BatchReport
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let total = items.len();
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(total.div_ceil(batch_size));
    let mut failed = 0;

    let mut remaining = items.into_iter().peekable();
    let mut index = 0;
    while remaining.peek().is_some() {
        let chunk: Vec<(String, T)> = remaining.by_ref().take(batch_size).collect();
        let size = chunk.len();
        let started = Instant::now();

        let (labels, values): (Vec<String>, Vec<T>) = chunk.into_iter().unzip();
        let results = join_all(values.into_iter().map(&operation)).await;

        let failures: Vec<ItemFailure> = labels
            .into_iter()
            .zip(results)
            .filter_map(|(item, result)| {
                result.err().map(|e| ItemFailure {
                    item,
                    error: e.to_string(),
                })
            })
            .collect();

        failed += failures.len();
        let elapsed_ms = started.elapsed().as_millis();
        tracing::debug!(
            batch = index,
            size,
            failures = failures.len(),
            elapsed_ms,
            "Batch finished"
        );
        batches.push(BatchTiming {
            index,
            size,
            elapsed_ms,
            failures,
        });
        index += 1;
    }

    BatchReport {
        total,
        succeeded: total - failed,
        failed,
        batches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn labelled(n: u32) -> Vec<(String, u32)> {
        (0..n).map(|i| (format!("item-{i}"), i)).collect()
    }

    #[tokio::test]
    async fn test_splits_into_batches() {
        let report = run_batched(labelled(10), 4, |_| async { Ok::<_, String>(()) }).await;

        assert_eq!(report.total, 10);
        assert_eq!(report.succeeded, 10);
        let sizes: Vec<usize> = report.batches.iter().map(|b| b.size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_failures_are_collected_per_item() {
        let report = run_batched(labelled(5), 2, |i| async move {
            if i % 2 == 1 {
                Err(format!("odd {i}"))
            } else {
                Ok(())
            }
        })
        .await;

        assert_eq!(report.failed, 2);
        assert_eq!(report.succeeded, 3);
        assert_eq!(
            report.batches[0].failures,
            vec![ItemFailure {
                item: "item-1".to_string(),
                error: "odd 1".to_string()
            }]
        );
        assert_eq!(report.batches[1].failures[0].item, "item-3");
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_batch_size() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let report = run_batched(labelled(9), 3, |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(())
            }
        })
        .await;

        assert_eq!(report.batches.len(), 3);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let report = run_batched(Vec::<(String, u32)>::new(), 0, |_| async {
            Ok::<_, String>(())
        })
        .await;
        assert_eq!(report.total, 0);
        assert!(report.batches.is_empty());
    }
}
