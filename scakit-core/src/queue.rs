//! Fan-out/fan-in coordinator for per-connection operations.
//!
//! The queue issues one asynchronous sub-call per connection and delivers a
//! single aggregated outcome once every sub-call has resolved. A failing
//! sub-call is recorded and never short-circuits the others. Completion
//! order races across I/O tasks, so result ordering is unspecified;
//! callers rely on completeness only.

use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::PerConnectionError;

/// Aggregated result of one [`BatchRequestQueue::execute`] invocation.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// Successful per-connection results, in completion order.
    pub successes: Vec<T>,
    /// Per-connection failures, in completion order.
    pub errors: Vec<PerConnectionError>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            successes: Vec::new(),
            errors: Vec::new(),
        }
    }
}

struct Aggregate<T> {
    pending: usize,
    outcome: BatchOutcome<T>,
    done: Option<oneshot::Sender<BatchOutcome<T>>>,
}

/// Counting fan-out coordinator.
#[derive(Default)]
pub struct BatchRequestQueue {
    // Serializes overlapping execute() calls so two batches can never
    // interleave into the same counters.
    gate: tokio::sync::Mutex<()>,
}

impl BatchRequestQueue {
    /// Creates an idle queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `operation` against every item and resolves once all sub-calls
    /// have completed, with zero items resolving immediately. The
    /// aggregated outcome is delivered exactly once per invocation.
    pub async fn execute<C, T, F, Fut>(&self, items: Vec<C>, operation: F) -> BatchOutcome<T>
    where
        C: Send + 'static,
        T: Send + 'static,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PerConnectionError>> + Send + 'static,
    {
        let _guard = self.gate.lock().await;

        let total = items.len();
        if total == 0 {
            return BatchOutcome::default();
        }

        let (done, aggregated) = oneshot::channel();
        let state = Arc::new(Mutex::new(Aggregate {
            pending: total,
            outcome: BatchOutcome::default(),
            done: Some(done),
        }));
        let operation = Arc::new(operation);

        for item in items {
            let state = Arc::clone(&state);
            let operation = Arc::clone(&operation);
            tokio::spawn(async move {
                let result = operation(item).await;
                let mut aggregate = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                match result {
                    Ok(value) => aggregate.outcome.successes.push(value),
                    Err(error) => aggregate.outcome.errors.push(error),
                }
                aggregate.pending -= 1;
                if aggregate.pending == 0 {
                    if let Some(done) = aggregate.done.take() {
                        let outcome = mem::take(&mut aggregate.outcome);
                        // The receiver is only gone if execute() was
                        // cancelled; nothing to deliver to in that case.
                        let _ = done.send(outcome);
                    }
                }
            });
        }

        aggregated.await.unwrap_or_else(|_| {
            tracing::error!("batch aggregation channel closed before completion");
            BatchOutcome::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::Rng;

    use crate::error::ScaError;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn aggregates_all_results_under_randomized_completion_order() {
        let queue = BatchRequestQueue::new();
        let items: Vec<u32> = (0..16).collect();
        let delays: Vec<u64> = {
            let mut rng = rand::thread_rng();
            (0..16).map(|_| rng.gen_range(0..30)).collect()
        };

        let outcome = queue
            .execute(items, move |item| {
                let delay = delays[item as usize];
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if item % 4 == 0 {
                        Err(PerConnectionError::new(
                            format!("conn-{item}"),
                            ScaError::transport("url", "unreachable"),
                        ))
                    } else {
                        Ok(item)
                    }
                }
            })
            .await;

        assert_eq!(outcome.successes.len() + outcome.errors.len(), 16);
        assert_eq!(outcome.errors.len(), 4);
        let mut successes = outcome.successes;
        successes.sort_unstable();
        assert_eq!(successes, vec![1, 2, 3, 5, 6, 7, 9, 10, 11, 13, 14, 15]);
    }

    #[tokio::test]
    async fn zero_items_completes_immediately_with_empty_outcome() {
        let queue = BatchRequestQueue::new();
        let outcome: BatchOutcome<u32> = queue
            .execute(Vec::new(), |_: u32| async move { Ok(0) })
            .await;

        assert!(outcome.successes.is_empty());
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_failure_does_not_short_circuit_the_rest() {
        let queue = BatchRequestQueue::new();
        let outcome = queue
            .execute(vec!["a", "b", "c"], |item: &'static str| async move {
                if item == "b" {
                    // The failing call resolves first; the others must
                    // still run to completion.
                    Err(PerConnectionError::new(item, ScaError::transport("url", "down")))
                } else {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(item)
                }
            })
            .await;

        assert_eq!(outcome.successes.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].connection_guid, "b");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overlapping_executes_never_share_counters() {
        let queue = Arc::new(BatchRequestQueue::new());

        let first = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .execute(vec![1u32, 2, 3], |item| async move {
                        tokio::time::sleep(Duration::from_millis(15)).await;
                        Ok(item)
                    })
                    .await
            })
        };
        let second = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .execute(vec![10u32, 20], |item| async move { Ok(item) })
                    .await
            })
        };

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert_eq!(first.successes.len(), 3);
        assert_eq!(second.successes.len(), 2);
    }
}
