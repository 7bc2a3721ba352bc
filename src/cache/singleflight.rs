//! Per-key single-flight coordination.
//!
//! Collapses concurrent refreshes of the same key into one computation.
//! Each admitted computation holds a ticket in a sharded map; callers that
//! arrive while it runs join the ticket and receive a clone of its outcome.
//! The ticket is removed when the computation finishes, so the next call
//! starts a new generation instead of replaying the old result.
//!
//! The computation runs on its own tracked task. A waiter that gives up
//! (deadline, dropped future) detaches without cancelling the work.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{AnalyzerError, Result};

/// `None` until the computation finishes.
type Outcome<T> = Option<Result<T>>;

/// An admitted, in-progress computation for one key.
struct Ticket<T> {
    generation: u64,
    outcome: watch::Receiver<Outcome<T>>,
}

impl<T: Clone> Ticket<T> {
    async fn wait(&self, key: &str) -> Result<T> {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            // Sender dropped without a result: the task never ran to completion.
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(AnalyzerError::computation(
                key,
                "refresh abandoned before completing",
            ))
        })
    }
}

/// Deduplicates concurrent computations per key.
pub struct SingleFlight<T> {
    tickets: Arc<DashMap<String, Arc<Ticket<T>>>>,
    next_generation: Arc<AtomicU64>,
    tracker: TaskTracker,
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            tickets: Arc::clone(&self.tickets),
            next_generation: Arc::clone(&self.next_generation),
            tracker: self.tracker.clone(),
        }
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            tickets: Arc::new(DashMap::new()),
            next_generation: Arc::new(AtomicU64::new(0)),
            tracker: TaskTracker::new(),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `compute` for `key` unless a computation for it is already in
    /// flight, in which case wait for that one instead.
    ///
    /// Every caller joined to the same ticket receives the same outcome. A
    /// panic inside the computation becomes a `Computation` error for all of
    /// them, and the ticket is cleared either way so a later call can retry.
    pub async fn run<F, Fut>(&self, key: &str, compute: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (ticket, leader) = self.admit(key);
        if let Some(tx) = leader {
            debug!(key, generation = ticket.generation, "refresh admitted");
            self.launch(key, ticket.generation, tx, compute());
        } else {
            debug!(key, generation = ticket.generation, "joined in-flight refresh");
        }
        ticket.wait(key).await
    }

    /// Claim the ticket for `key`, or join the existing one.
    ///
    /// Returns the sender only to the caller that created the ticket.
    fn admit(&self, key: &str) -> (Arc<Ticket<T>>, Option<watch::Sender<Outcome<T>>>) {
        match self.tickets.entry(key.to_string()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), None),
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                let ticket = Arc::new(Ticket {
                    generation,
                    outcome: rx,
                });
                slot.insert(Arc::clone(&ticket));
                (ticket, Some(tx))
            }
        }
    }

    fn launch<Fut>(&self, key: &str, generation: u64, tx: watch::Sender<Outcome<T>>, fut: Fut)
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let tickets = Arc::clone(&self.tickets);
        let key = key.to_string();
        self.tracker.spawn(async move {
            let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(key = %key, generation, "refresh computation panicked");
                    Err(AnalyzerError::computation(
                        &key,
                        "refresh computation panicked",
                    ))
                }
            };
            // A forgotten ticket may already have been replaced by a newer generation.
            tickets.remove_if(&key, |_, ticket| ticket.generation == generation);
            tx.send_replace(Some(outcome));
        });
    }

    /// Detach the current ticket for `key`, if any.
    ///
    /// Callers already waiting on it still get its outcome; the next `run`
    /// for `key` admits a new computation.
    pub fn forget(&self, key: &str) -> bool {
        self.tickets.remove(key).is_some()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.tickets.contains_key(key)
    }

    /// Number of keys with an admitted computation.
    pub fn in_flight(&self) -> usize {
        self.tickets.len()
    }

    /// Wait for every spawned computation, including detached ones, to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Computation that counts invocations and blocks until the gate opens.
    async fn gated(calls: Arc<AtomicUsize>, gate: Arc<Semaphore>, value: u32) -> Result<u32> {
        calls.fetch_add(1, Ordering::SeqCst);
        let _permit = gate
            .acquire()
            .await
            .map_err(|e| AnalyzerError::computation("gate", e))?;
        Ok(value)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_computation() {
        let flights = SingleFlight::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let flights = flights.clone();
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                flights
                    .run("hot", move || gated(calls, gate, 7))
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(flights.is_in_flight("hot"));
        gate.add_permits(1);

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight("hot"), "ticket cleared after completion");
    }

    #[tokio::test]
    async fn completed_ticket_is_not_replayed() {
        let flights = SingleFlight::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in 1..=3 {
            let calls = Arc::clone(&calls);
            let value = flights
                .run("k", move || async move {
                    Ok(calls.fetch_add(1, Ordering::SeqCst) as u32 + 1)
                })
                .await;
            assert_eq!(value, Ok(expected));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failure_is_shared_and_ticket_cleared() {
        let flights = SingleFlight::<u32>::new();
        let gate = Arc::new(Semaphore::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let flights = flights.clone();
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                flights
                    .run("bad", move || async move {
                        let _permit = gate.acquire().await;
                        Err::<u32, _>(AnalyzerError::computation("bad", "upstream down"))
                    })
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        gate.add_permits(1);

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                Err(AnalyzerError::computation("bad", "upstream down"))
            );
        }

        let retried = flights.run("bad", || async { Ok(1) }).await;
        assert_eq!(retried, Ok(1));
    }

    #[tokio::test]
    async fn panic_becomes_computation_error() {
        let flights = SingleFlight::<u32>::new();
        let result = flights
            .run("boom", || async {
                if true {
                    panic!("analysis model crashed");
                }
                Ok(0)
            })
            .await;

        assert!(matches!(result, Err(AnalyzerError::Computation { .. })));
        assert!(!flights.is_in_flight("boom"));
        assert_eq!(flights.run("boom", || async { Ok(2) }).await, Ok(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn keys_do_not_block_each_other() {
        let flights = SingleFlight::<u32>::new();
        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let blocked = {
            let flights = flights.clone();
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move { flights.run("slow", move || gated(calls, gate, 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let other = tokio::time::timeout(
            Duration::from_secs(1),
            flights.run("fast", || async { Ok(2) }),
        )
        .await
        .expect("unrelated key must not wait on another key's ticket");
        assert_eq!(other, Ok(2));

        gate.add_permits(1);
        assert_eq!(blocked.await.unwrap(), Ok(1));
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_cancel_computation() {
        let flights = SingleFlight::<u32>::new();
        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let waited = {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            let done = Arc::clone(&done);
            tokio::time::timeout(
                Duration::from_millis(20),
                flights.run("k", move || async move {
                    let value = gated(calls, gate, 9).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    value
                }),
            )
            .await
        };
        assert!(waited.is_err(), "waiter should time out");
        assert!(flights.is_in_flight("k"));

        gate.add_permits(1);
        flights.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight("k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forget_starts_new_generation() {
        let flights = SingleFlight::<u32>::new();
        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let flights = flights.clone();
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move { flights.run("k", move || gated(calls, gate, 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(flights.forget("k"));
        assert!(!flights.forget("k"), "forget is idempotent");

        let second = flights.run("k", || async { Ok(2) }).await;
        assert_eq!(second, Ok(2));

        gate.add_permits(1);
        assert_eq!(first.await.unwrap(), Ok(1));
        assert_eq!(flights.in_flight(), 0);
    }
}
