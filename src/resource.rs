// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The lifecycle contract shared by every creatable/deletable resource: the
//! state machine, the idempotence rules, and the bounded-backoff retry loop
//! used for post-create readiness checks.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;

/// Serde adapter for interior `Mutex` state.
///
/// Only the guarded value is serialized; a fresh primitive is constructed
/// around it on load. This is what lets a live object graph be persisted at
/// the end of provisioning and restored in a later process for teardown.
pub mod lock {
    use std::sync::Mutex;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(lock: &Mutex<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        lock.lock().unwrap().serialize(serializer)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Mutex<T>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        T::deserialize(deserializer).map(Mutex::new)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Unborn,
    Creating,
    Created,
    Deleting,
    Deleted,
}

/// Lifecycle bookkeeping embedded in every resource.
///
/// `begin_create`/`begin_delete` gate the operations so that `create()` is a
/// no-op on an already-created resource and `delete()` is a no-op on a
/// resource that was never created or is already gone. A resource stuck in
/// `Creating` (a failed create) is still deletable, so partial provisioning
/// can be cleaned up.
#[derive(Debug, Serialize, Deserialize)]
pub struct Lifecycle {
    #[serde(with = "lock")]
    state: Mutex<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle {
            state: Mutex::new(LifecycleState::Unborn),
        }
    }

    /// A lifecycle for a resource that already exists and was not created by
    /// this run (a pre-provisioned machine).
    pub fn live() -> Self {
        Lifecycle {
            state: Mutex::new(LifecycleState::Created),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    /// Returns false when create should be skipped because the resource is
    /// already created.
    pub fn begin_create(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == LifecycleState::Created {
            return false;
        }
        *state = LifecycleState::Creating;
        true
    }

    pub fn finish_create(&self) {
        *self.state.lock().unwrap() = LifecycleState::Created;
    }

    /// Returns false when delete should be skipped because there is nothing
    /// to delete.
    pub fn begin_delete(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, LifecycleState::Unborn | LifecycleState::Deleted) {
            return false;
        }
        *state = LifecycleState::Deleting;
        true
    }

    pub fn finish_delete(&self) {
        *self.state.lock().unwrap() = LifecycleState::Deleted;
    }
}

/// Bounds for the post-create readiness retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Why a retried operation ultimately failed. Callers tag this with resource
/// identity when converting it into a resource error.
#[derive(Debug)]
pub enum RetryError {
    /// The operation failed in a way retrying cannot fix.
    Permanent(ProviderError),

    /// Every attempt failed transiently and the budget ran out.
    Exhausted { attempts: u32, last: ProviderError },
}

/// Run `op` until it succeeds, it fails permanently, or the attempt budget is
/// exhausted. Transient ("not ready") failures are retried with exponential
/// backoff capped at the policy's max delay.
pub async fn retry_not_ready<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut last = None;

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => last = Some(e),
            Err(e) => return Err(RetryError::Permanent(e)),
        }

        if attempt < max_attempts {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(policy.max_delay);
        }
    }

    Err(RetryError::Exhausted {
        attempts: max_attempts,
        last: last.unwrap(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn create_is_idempotent_once_created() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_create());
        lifecycle.finish_create();
        assert!(!lifecycle.begin_create());
        assert_eq!(lifecycle.state(), LifecycleState::Created);
    }

    #[test]
    fn delete_is_a_noop_when_unborn_or_deleted() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.begin_delete());

        lifecycle.finish_create();
        assert!(lifecycle.begin_delete());
        lifecycle.finish_delete();
        assert!(!lifecycle.begin_delete());
    }

    #[test]
    fn failed_create_leaves_the_resource_deletable() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_create());
        // No finish_create(): the create failed partway.
        assert!(lifecycle.begin_delete());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_the_attempt_budget() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        };
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = retry_not_ready(&policy, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::NotReady("instance not found".to_string()))
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match result {
            Err(RetryError::Exhausted { attempts: 3, .. }) => {}
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_stops_the_retry_loop() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = retry_not_ready(&policy, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Failed("malformed response".to_string()))
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Permanent(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_eventually_succeed() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);

        let result = retry_not_ready(&policy, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::NotReady("still booting".to_string()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
