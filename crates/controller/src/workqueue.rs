//! Keyed work queue: per-key work is serialized, distinct keys run in
//! parallel up to the worker budget. Keys re-queued while running are run
//! again afterwards; failures re-queue with exponential backoff.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};

use crate::ControllerError;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Outcome of one reconciliation: done, or run again after a delay.
pub type ReconcileResult = Result<Option<Duration>, ControllerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Queued,
    Running,
    RunningDirty,
}

struct QueueInner {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    state: Mutex<HashMap<String, KeyState>>,
    attempts: Mutex<HashMap<String, u32>>,
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(QueueInner {
                tx,
                rx: Mutex::new(Some(rx)),
                state: Mutex::new(HashMap::new()),
                attempts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Enqueues a key. A key that is already queued is not duplicated; a key
    /// that is currently running is marked to run again.
    pub fn add(&self, key: &str) {
        let mut state = lock(&self.inner.state);
        match state.get(key) {
            None => {
                state.insert(key.to_string(), KeyState::Queued);
                let _ = self.inner.tx.send(key.to_string());
            }
            Some(KeyState::Running) => {
                state.insert(key.to_string(), KeyState::RunningDirty);
            }
            Some(KeyState::Queued) | Some(KeyState::RunningDirty) => {}
        }
    }

    pub fn add_after(&self, key: &str, delay: Duration) {
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Consumes the queue, running `handler` for ready keys with at most
    /// `workers` keys in flight. Returns when the queue is dropped.
    pub async fn run<F, Fut>(&self, workers: usize, handler: F)
    where
        F: Fn(String) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ReconcileResult> + Send + 'static,
    {
        let Some(mut rx) = lock(&self.inner.rx).take() else {
            tracing::error!("work queue is already being consumed");
            return;
        };
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));

        while let Some(key) = rx.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                return;
            };
            {
                let mut state = lock(&self.inner.state);
                state.insert(key.clone(), KeyState::Running);
            }

            let queue = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let result = handler(key.clone()).await;
                queue.finish(&key, result);
                drop(permit);
            });
        }
    }

    fn finish(&self, key: &str, result: ReconcileResult) {
        let dirty = {
            let mut state = lock(&self.inner.state);
            matches!(state.remove(key), Some(KeyState::RunningDirty))
        };

        match result {
            Ok(requeue_after) => {
                lock(&self.inner.attempts).remove(key);
                if dirty {
                    self.add(key);
                } else if let Some(delay) = requeue_after {
                    self.add_after(key, delay);
                }
            }
            Err(err) => {
                let attempts = {
                    let mut attempts = lock(&self.inner.attempts);
                    let entry = attempts.entry(key.to_string()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                let delay = backoff(attempts);
                tracing::warn!(
                    key = %key,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "reconciliation failed, requeueing"
                );
                self.add_after(key, delay);
            }
        }
    }
}

fn backoff(attempts: u32) -> Duration {
    let shift = attempts.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << shift)
        .min(BACKOFF_MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(4), Duration::from_secs(8));
        assert_eq!(backoff(30), BACKOFF_MAX);
    }

    #[tokio::test]
    async fn keys_are_deduplicated_while_queued() {
        let queue = WorkQueue::new();
        let runs = Arc::new(AtomicU32::new(0));

        queue.add("a");
        queue.add("a");
        queue.add("b");

        let consumer = {
            let queue = queue.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                queue
                    .run(2, move |_key| {
                        let runs = runs.clone();
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Ok(None)
                        }
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        consumer.abort();
    }

    #[tokio::test]
    async fn key_added_while_running_runs_again() {
        let queue = WorkQueue::new();
        let runs = Arc::new(AtomicU32::new(0));

        queue.add("a");

        let consumer = {
            let queue = queue.clone();
            let inner_queue = queue.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                queue
                    .run(1, move |key| {
                        let runs = runs.clone();
                        let queue = inner_queue.clone();
                        async move {
                            if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                                // Re-add while this run is still in flight.
                                queue.add(&key);
                                tokio::time::sleep(Duration::from_millis(20)).await;
                            }
                            Ok(None)
                        }
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        consumer.abort();
    }

    #[tokio::test]
    async fn requeue_after_runs_the_key_again() {
        let queue = WorkQueue::new();
        let runs = Arc::new(AtomicU32::new(0));

        queue.add("a");

        let consumer = {
            let queue = queue.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                queue
                    .run(1, move |_key| {
                        let runs = runs.clone();
                        async move {
                            if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                                Ok(Some(Duration::from_millis(10)))
                            } else {
                                Ok(None)
                            }
                        }
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        consumer.abort();
    }
}
