//! Readiness gate deferring work until external conditions are satisfied
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::{Error, ErrorKind, Result};

type GateTask = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

#[derive(Default)]
struct GateState {
    unchecked: HashSet<String>,
    queue: VecDeque<GateTask>,
    torn_down: bool,
}

/// Holds back task execution until every named condition is checked
///
/// The gate is ready iff no condition is currently unchecked. Tasks submitted
/// while the gate is closed are queued and replayed in FIFO order on the
/// transition to ready. Tearing the gate down rejects all queued tasks
/// instead of leaving them pending forever.
pub struct ReadyGate {
    state: Mutex<GateState>,
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyGate {
    /// Creates a gate with no unchecked conditions (ready)
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
        }
    }

    /// Returns whether tasks currently run immediately
    pub fn is_ready(&self) -> bool {
        let state = self
            .state
            .lock()
            .expect("Unable to acquire lock on gate state");
        state.unchecked.is_empty() && !state.torn_down
    }

    /// Runs the task immediately if the gate is ready, otherwise queues it
    /// until the gate opens
    pub async fn call<F, Fut, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        // Every lock scope below is a plain (non-async) block with no
        // `.await` inside it, so the `MutexGuard` is never part of this
        // function's generator state across a suspension point; it is
        // fully dropped (by the block's closing brace) before any
        // `.await` runs, which keeps the returned future `Send`.
        loop {
            let ready = {
                let state = self
                    .state
                    .lock()
                    .expect("Unable to acquire lock on gate state");

                if state.torn_down {
                    return Err(teardown_error());
                }

                state.unchecked.is_empty()
            };

            if ready {
                return task().await;
            }

            let queued_receiver = {
                let mut state = self
                    .state
                    .lock()
                    .expect("Unable to acquire lock on gate state");

                if state.torn_down {
                    return Err(teardown_error());
                }

                if state.unchecked.is_empty() {
                    // The gate opened between the snapshot above and this
                    // lock; retry, which will take the `ready` path above.
                    None
                } else {
                    let (sender, queued_receiver) = oneshot::channel();
                    state.queue.push_back(Box::new(move || {
                        Box::pin(async move {
                            if sender.send(task().await).is_err() {
                                log::debug!(
                                    "Gated task completed after its caller went away"
                                );
                            }
                        })
                    }));
                    Some(queued_receiver)
                }
            };

            match queued_receiver {
                Some(receiver) => {
                    return receiver.await.unwrap_or_else(|_| Err(teardown_error()));
                }
                None => continue,
            }
        }
    }

    /// Marks a named condition as satisfied; when this was the last
    /// unsatisfied condition, queued tasks run in arrival order
    pub async fn check(&self, token: &str) {
        let drained: Vec<GateTask> = {
            let mut state = self
                .state
                .lock()
                .expect("Unable to acquire lock on gate state");
            state.unchecked.remove(token);

            if state.unchecked.is_empty() && !state.torn_down {
                state.queue.drain(..).collect()
            } else {
                Vec::new()
            }
        };

        for task in drained {
            task().await;
        }
    }

    /// Marks a named condition as unsatisfied, closing the gate
    pub fn uncheck(&self, token: &str) {
        self.state
            .lock()
            .expect("Unable to acquire lock on gate state")
            .unchecked
            .insert(token.to_string());
    }

    /// Rejects all queued tasks and refuses new ones; used when the hosting
    /// context goes away before the gate opens
    pub fn teardown(&self) {
        let mut state = self
            .state
            .lock()
            .expect("Unable to acquire lock on gate state");
        state.torn_down = true;
        // dropping the queued tasks drops their completion senders, which
        // rejects every waiting caller
        state.queue.clear();
    }
}

fn teardown_error() -> Error {
    Error::new(
        ErrorKind::UserRejectedError,
        "Context torn down before task ran",
    )
}
