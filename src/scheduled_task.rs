//! Delayed, cooperatively cancellable partition load/unload tasks.
//!
//! A [`ScheduledPartitionTask`] moves through these phases:
//!
//! ```text
//! Scheduled --(delay elapsed)--> Running --(work finished)--> Completed
//!     |
//!     +--(cancel)--> Cancelled
//! ```
//!
//! Cancellation only succeeds while the task is still Scheduled. Once the work
//! has started it always runs to completion, and callers that must not
//! overlap with it wait on the completion signal instead.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledTaskType {
    Load,
    Unload,
}

impl fmt::Display for ScheduledTaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduledTaskType::Load => f.write_str("load"),
            ScheduledTaskType::Unload => f.write_str("unload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskPhase {
    Scheduled = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
}

impl TaskPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskPhase::Scheduled,
            1 => TaskPhase::Running,
            2 => TaskPhase::Completed,
            _ => TaskPhase::Cancelled,
        }
    }
}

/// Result of a cancellation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task had not started and never will.
    Cancelled,
    /// The task has started and cannot be cancelled.
    AlreadyRunning,
    /// The task had already completed or been cancelled.
    AlreadyFinished,
}

/// Marks the task finished when the spawned future ends, including by panic
/// or abort.
struct CompletionGuard {
    phase: Arc<AtomicU8>,
    done_tx: watch::Sender<bool>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let _ = self.phase.compare_exchange(
            TaskPhase::Running as u8,
            TaskPhase::Completed as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.done_tx.send_replace(true);
    }
}

/// Handle to one scheduled load or unload.
pub struct ScheduledPartitionTask {
    task_id: Uuid,
    task_type: ScheduledTaskType,
    sink_id: Uuid,
    phase: Arc<AtomicU8>,
    done_rx: watch::Receiver<bool>,
    join_handle: JoinHandle<()>,
}

impl ScheduledPartitionTask {
    /// Spawn `work` on `runtime`, to start after `delay`.
    pub fn spawn<F>(
        runtime: &Handle,
        task_type: ScheduledTaskType,
        delay: Duration,
        sink_id: Uuid,
        work: F,
    ) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let phase = Arc::new(AtomicU8::new(TaskPhase::Scheduled as u8));
        let (done_tx, done_rx) = watch::channel(false);

        let task_phase = phase.clone();
        let join_handle = runtime.spawn(async move {
            let _guard = CompletionGuard {
                phase: task_phase.clone(),
                done_tx,
            };

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if task_phase
                .compare_exchange(
                    TaskPhase::Scheduled as u8,
                    TaskPhase::Running as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                return;
            }

            work.await;
        });

        Self {
            task_id: Uuid::new_v4(),
            task_type,
            sink_id,
            phase,
            done_rx,
            join_handle,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn task_type(&self) -> ScheduledTaskType {
        self.task_type
    }

    /// Id of the lease event sink that scheduled this task.
    pub fn sink_id(&self) -> Uuid {
        self.sink_id
    }

    pub fn phase(&self) -> TaskPhase {
        TaskPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Completed or cancelled.
    pub fn is_done(&self) -> bool {
        matches!(self.phase(), TaskPhase::Completed | TaskPhase::Cancelled)
    }

    /// The work has not started yet.
    pub fn is_cancellable(&self) -> bool {
        self.phase() == TaskPhase::Scheduled
    }

    pub fn cancel(&self) -> CancelOutcome {
        match self.phase.compare_exchange(
            TaskPhase::Scheduled as u8,
            TaskPhase::Cancelled as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.join_handle.abort();
                CancelOutcome::Cancelled
            }
            Err(actual) if actual == TaskPhase::Running as u8 => CancelOutcome::AlreadyRunning,
            Err(_) => CancelOutcome::AlreadyFinished,
        }
    }

    /// Resolve once the task is done. Never resolves while the work may
    /// still be executing.
    pub async fn wait_until_done(&self) {
        let mut done_rx = self.done_rx.clone();
        loop {
            if self.is_done() {
                return;
            }
            let signalled = *done_rx.borrow_and_update();
            if signalled {
                return;
            }
            // Sender dropped: the spawned future is gone.
            if done_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Cancel if possible, otherwise wait for the running work to finish.
    pub async fn cancel_or_wait_until_done(&self) -> CancelOutcome {
        let outcome = self.cancel();
        if outcome == CancelOutcome::AlreadyRunning {
            self.wait_until_done().await;
        }
        outcome
    }
}

impl fmt::Debug for ScheduledPartitionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledPartitionTask")
            .field("task_id", &self.task_id)
            .field("task_type", &self.task_type)
            .field("sink_id", &self.sink_id)
            .field("phase", &self.phase())
            .finish()
    }
}
