//! Bounded-concurrency batch execution with per-item results.
//!
//! A batch never fails as a whole because one item failed. It stops early
//! only when cancelled (completed items are still returned) or when an item
//! fails with a batch-fatal error such as an authentication failure.

use crate::cancel::Cancellation;
use crate::error::{FailureCategory, Result};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, warn};

/// Result of one batch item, matched back to its key
#[derive(Debug)]
pub struct BatchItem<K, T> {
    pub key: K,
    pub result: Result<T>,
}

#[derive(Debug)]
pub struct BatchOutcome<K, T> {
    /// Completed items in completion order
    pub items: Vec<BatchItem<K, T>>,
    /// Keys that never completed because the batch stopped early
    pub pending: Vec<K>,
    pub cancelled: bool,
    /// Log-safe reason when a batch-fatal error short-circuited the batch
    pub aborted: Option<String>,
}

impl<K, T> BatchOutcome<K, T> {
    pub fn succeeded(&self) -> impl Iterator<Item = (&K, &T)> {
        self.items
            .iter()
            .filter_map(|item| item.result.as_ref().ok().map(|v| (&item.key, v)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&K, &crate::Error)> {
        self.items
            .iter()
            .filter_map(|item| item.result.as_ref().err().map(|e| (&item.key, e)))
    }

    pub fn success_count(&self) -> usize {
        self.succeeded().count()
    }

    /// Failure counts by category, including items left pending
    pub fn failure_counts(&self) -> BTreeMap<FailureCategory, usize> {
        let mut counts = BTreeMap::new();
        for (_, err) in self.failed() {
            *counts.entry(err.category()).or_insert(0) += 1;
        }
        if !self.pending.is_empty() {
            *counts.entry(FailureCategory::Cancelled).or_insert(0) += self.pending.len();
        }
        counts
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && !self.cancelled && self.aborted.is_none()
    }
}

/// Run `task` for every key with at most `concurrency` tasks in flight.
pub async fn run_bounded<K, T, F, Fut>(
    keys: Vec<K>,
    concurrency: usize,
    cancel: &Cancellation,
    task: F,
) -> BatchOutcome<K, T>
where
    K: Clone,
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let concurrency = concurrency.max(1);
    let total = keys.len();
    let mut completed = vec![false; total];
    let mut items = Vec::with_capacity(total);
    let mut cancelled = false;
    let mut aborted = None;

    debug!(
        "Running batch of {} items with concurrency {}",
        total, concurrency
    );

    {
        let mut results = stream::iter(keys.iter().cloned().enumerate())
            .map(|(index, key)| {
                let fut = task(key);
                async move { (index, fut.await) }
            })
            .buffer_unordered(concurrency);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = results.next() => next,
            };

            let Some((index, result)) = next else {
                break;
            };
            completed[index] = true;

            let fatal = match &result {
                Err(e) if e.is_batch_fatal() => Some(e.log_safe()),
                _ => None,
            };
            items.push(BatchItem {
                key: keys[index].clone(),
                result,
            });

            if let Some(reason) = fatal {
                warn!("Aborting batch after fatal error: {}", reason);
                aborted = Some(reason);
                break;
            }
        }
    } // In-flight work is dropped here

    let pending: Vec<K> = keys
        .into_iter()
        .zip(completed)
        .filter_map(|(key, done)| (!done).then_some(key))
        .collect();

    if cancelled {
        warn!(
            "Batch cancelled: {}/{} items completed",
            items.len(),
            total
        );
    }

    BatchOutcome {
        items,
        pending,
        cancelled,
        aborted,
    }
}
