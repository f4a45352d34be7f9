// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The concurrent lifecycle driver: apply one operation to every item of an
//! unordered collection in parallel, attempt every item even when siblings
//! fail, and surface all collected failures as a single aggregate error.

use futures::stream::{self, StreamExt};

use crate::errors::{AggregateError, Error};

/// Cap on in-flight operations when the caller does not configure one.
pub const DEFAULT_MAX_CONCURRENCY: usize = 200;

/// Run `op` once per item with at most `limit` operations in flight.
///
/// The call returns only after every item has been attempted. There is no
/// ordering between items, and a failing item never prevents the rest from
/// running; all failures come back together in one `AggregateError`.
pub async fn run_parallel<T, F, Fut>(
    items: Vec<T>,
    limit: Option<usize>,
    op: F,
) -> Result<(), AggregateError>
where
    F: Fn(T) -> Fut,
    Fut: std::future::Future<Output = Result<(), Error>>,
{
    let limit = limit.unwrap_or(DEFAULT_MAX_CONCURRENCY).max(1);

    let failures: Vec<Error> = stream::iter(items.into_iter().map(op))
        .buffer_unordered(limit)
        .filter_map(|result| async move { result.err() })
        .collect()
        .await;

    if failures.is_empty() {
        Ok(())
    } else {
        Err(AggregateError { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::errors::ProviderError;
    use crate::errors::ResourceError;

    fn failure(name: &str) -> Error {
        Error::Resource(ResourceError::Operation {
            cloud: "GCP".to_string(),
            kind: "vm",
            name: name.to_string(),
            op: "create",
            source: ProviderError::Failed("boom".to_string()),
        })
    }

    #[tokio::test]
    async fn every_item_is_attempted_despite_failures() {
        let completed = AtomicUsize::new(0);
        let completed = &completed;

        let result = run_parallel((1..=6).collect(), None, |n: usize| async move {
            if n == 2 || n == 5 {
                return Err(failure(&format!("vm-{n}")));
            }
            completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        // Items 1, 3, 4, and 6 all completed their operation.
        assert_eq!(completed.load(Ordering::SeqCst), 4);

        let aggregate = result.unwrap_err();
        assert_eq!(aggregate.failures.len(), 2);
        let message = aggregate.to_string();
        assert!(message.contains("vm-2"));
        assert!(message.contains("vm-5"));
    }

    #[tokio::test]
    async fn empty_input_succeeds() {
        let items: Vec<usize> = Vec::new();
        run_parallel(items, Some(4), |_| async move { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn the_concurrency_cap_is_respected() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let (in_flight, peak) = (&in_flight, &peak);

        run_parallel((0..32).collect(), Some(4), |_: usize| async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 4);
    }
}
