//! Global build serializer
//!
//! Every external package-manager or bundler invocation goes through one
//! `BuildQueue`, which runs at most one task at a time in submission order
//! regardless of which module the task belongs to. The queue is an owned
//! value, so independent stores (and tests) get independent queues.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    running: bool,
    waiting: VecDeque<oneshot::Sender<BuildSlot>>,
}

#[derive(Default)]
struct QueueShared {
    state: Mutex<QueueState>,
    scheduled: AtomicU64,
    completed: AtomicU64,
}

impl QueueShared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-flight FIFO executor for build side effects
#[derive(Clone, Default)]
pub struct BuildQueue {
    shared: Arc<QueueShared>,
}

impl BuildQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once every earlier task has finished, and return its output
    pub async fn run<F>(&self, label: &str, task: F) -> F::Output
    where
        F: Future,
    {
        let slot = self.enqueue().wait().await;
        debug!(task = label, "build task started");
        let output = task.await;
        debug!(task = label, "build task finished");
        drop(slot);
        output
    }

    /// Queue `task` without waiting for it.
    ///
    /// The queue position is taken synchronously, so tasks scheduled one
    /// after another run in that order.
    pub fn schedule<F>(&self, label: &str, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let ticket = self.enqueue();
        let label = label.to_string();
        tokio::spawn(async move {
            let slot = ticket.wait().await;
            debug!(task = %label, "build task started");
            let output = task.await;
            debug!(task = %label, "build task finished");
            drop(slot);
            output
        })
    }

    /// Total number of tasks ever submitted
    pub fn scheduled(&self) -> u64 {
        self.shared.scheduled.load(Ordering::SeqCst)
    }

    /// Total number of tasks that have finished
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    /// Whether a task currently holds the queue
    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    /// Number of tasks waiting behind the running one
    pub fn pending(&self) -> usize {
        self.shared.state().waiting.len()
    }

    fn enqueue(&self) -> Ticket {
        self.shared.scheduled.fetch_add(1, Ordering::SeqCst);
        self.join()
    }

    fn join(&self) -> Ticket {
        let mut state = self.shared.state();
        if !state.running {
            state.running = true;
            Ticket::Ready(BuildSlot::new(Arc::clone(&self.shared)))
        } else {
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(tx);
            Ticket::Waiting(self.clone(), rx)
        }
    }
}

enum Ticket {
    Ready(BuildSlot),
    Waiting(BuildQueue, oneshot::Receiver<BuildSlot>),
}

impl Ticket {
    async fn wait(self) -> BuildSlot {
        let mut ticket = self;
        loop {
            match ticket {
                Ticket::Ready(slot) => return slot,
                Ticket::Waiting(queue, rx) => match rx.await {
                    Ok(slot) => return slot,
                    // Queue entry discarded without a hand-over; take a new place
                    Err(_) => ticket = queue.join(),
                },
            }
        }
    }
}

/// The right to run; handed to the next waiter when dropped
struct BuildSlot {
    shared: Arc<QueueShared>,
    armed: bool,
}

impl BuildSlot {
    fn new(shared: Arc<QueueShared>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }
}

impl Drop for BuildSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.shared.completed.fetch_add(1, Ordering::SeqCst);

        loop {
            let next = {
                let mut state = self.shared.state();
                match state.waiting.pop_front() {
                    Some(tx) => tx,
                    None => {
                        state.running = false;
                        return;
                    }
                }
            };

            match next.send(BuildSlot::new(Arc::clone(&self.shared))) {
                Ok(()) => return,
                Err(mut unclaimed) => unclaimed.armed = false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::time::{sleep, Duration};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tasks_never_overlap() {
        let queue = BuildQueue::new();
        let intervals = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..10u64 {
            let queue = queue.clone();
            let intervals = Arc::clone(&intervals);
            handles.push(tokio::spawn(async move {
                queue
                    .run("interval", async move {
                        let start = Instant::now();
                        sleep(Duration::from_millis(2 + i % 3)).await;
                        intervals.lock().unwrap().push((start, Instant::now()));
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut intervals = intervals.lock().unwrap().clone();
        intervals.sort();
        assert_eq!(intervals.len(), 10);
        for pair in intervals.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "build tasks overlapped");
        }
        assert_eq!(queue.scheduled(), 10);
        assert_eq!(queue.completed(), 10);
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn test_schedule_preserves_submission_order() {
        let queue = BuildQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let order = Arc::clone(&order);
                queue.schedule("ordered", async move {
                    tokio::task::yield_now().await;
                    order.lock().unwrap().push(i);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_run_returns_task_output() {
        let queue = BuildQueue::new();
        let value = queue.run("answer", async { 42 }).await;
        assert_eq!(value, 42);
        assert_eq!(queue.pending(), 0);
    }
}
