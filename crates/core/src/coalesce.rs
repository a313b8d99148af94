//! In-flight request coalescing.
//!
//! Concurrent callers asking for the same key share one execution. The
//! first caller becomes the group leader and runs the work inline; everyone
//! arriving while it runs subscribes to a `watch` channel and receives a
//! clone of the leader's outcome, success or error alike.
//!
//! If the leader goes away without an outcome (its future is dropped, or its
//! own context is cancelled) the group is torn down and attached waiters
//! start over, so one of them takes the lead. A waiter's own cancellation
//! detaches only that waiter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

type Shared<T> = Result<T, CoreError>;

struct Group<T> {
    id: u64,
    tx: watch::Sender<Option<Shared<T>>>,
}

/// Deduplicates concurrent work by key.
pub struct Coalescer<T> {
    groups: Mutex<HashMap<String, Group<T>>>,
    next_id: AtomicU64,
    joined: AtomicU64,
}

enum Role<T> {
    Leader(u64),
    Follower(watch::Receiver<Option<Shared<T>>>),
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with an execution in flight.
    pub fn in_flight(&self) -> usize {
        self.groups.lock().len()
    }

    /// Total callers that attached to someone else's execution.
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }

    /// Run `work` for `key`, or wait for the execution already in flight.
    ///
    /// `work` is invoked at most once, and only if this caller ends up
    /// leading a group.
    pub async fn run<F, Fut>(&self, key: &str, ctx: &CancellationToken, work: F) -> Shared<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Shared<T>>,
    {
        let mut work = Some(work);
        let mut attached = false;

        loop {
            match self.join_or_lead(key) {
                Role::Leader(id) => {
                    let Some(work) = work.take() else {
                        return Err(CoreError::Internal(
                            "coalescing leader elected twice".to_string(),
                        ));
                    };
                    let guard = LeaderGuard {
                        groups: &self.groups,
                        key,
                        id,
                        finished: false,
                    };
                    let outcome = work().await;

                    if ctx.is_cancelled() && matches!(outcome, Err(CoreError::Canceled(_))) {
                        // Followers are not bound by this caller's deadline.
                        drop(guard);
                    } else {
                        guard.publish(&outcome);
                    }
                    return outcome;
                }
                Role::Follower(mut rx) => {
                    // Count a caller once, even if it waits on several groups.
                    if !attached {
                        attached = true;
                        self.joined.fetch_add(1, Ordering::Relaxed);
                    }
                    let wait = async {
                        rx.wait_for(Option::is_some)
                            .await
                            .map(|value| (*value).clone())
                    };

                    tokio::select! {
                        _ = ctx.cancelled() => return Err(CoreError::canceled()),
                        shared = wait => match shared {
                            Ok(Some(outcome)) => return outcome,
                            Ok(None) | Err(_) => {
                                tracing::debug!(key, "Coalescing leader abandoned; retrying");
                            }
                        },
                    }
                }
            }
        }
    }

    fn join_or_lead(&self, key: &str) -> Role<T> {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get(key) {
            return Role::Follower(group.tx.subscribe());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = watch::channel(None);
        groups.insert(key.to_string(), Group { id, tx });
        Role::Leader(id)
    }
}

/// Removes the leader's group when it finishes or is dropped.
struct LeaderGuard<'a, T> {
    groups: &'a Mutex<HashMap<String, Group<T>>>,
    key: &'a str,
    id: u64,
    finished: bool,
}

impl<T> LeaderGuard<'_, T> {
    fn take_group(&self) -> Option<Group<T>> {
        let mut groups = self.groups.lock();
        match groups.get(self.key) {
            Some(group) if group.id == self.id => groups.remove(self.key),
            _ => None,
        }
    }

    fn publish(mut self, outcome: &Shared<T>)
    where
        T: Clone,
    {
        self.finished = true;
        if let Some(group) = self.take_group() {
            group.tx.send_replace(Some(outcome.clone()));
        }
    }
}

impl<T> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if !self.finished && self.take_group().is_some() {
            tracing::debug!(key = self.key, "Coalescing group torn down without a result");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
