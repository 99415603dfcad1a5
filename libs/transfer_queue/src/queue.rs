//! Observable registry of active transfers (C8), styled on the teacher's
//! `DeletionQueue`/`DeletionQueueClient` split: `TransferQueue` is a cheaply
//! `Clone`-able handle around an `Arc<Inner>`, all mutable state lives
//! behind one `parking_lot::RwLock`, and every transition also broadcasts a
//! deep-copy event for external observers (a tray UI, say) to pick up.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{EventKind, TransferEvent};
use crate::task::{Direction, TaskId, TaskState, TransferTask};

/// EMA smoothing factor for the speed estimate.
const EMA_ALPHA: f64 = 0.1;
/// Samples closer together than this are folded into the running progress
/// value but don't produce a new speed estimate — too little wall-clock
/// time has passed to measure a rate.
const MIN_SAMPLE_GAP: std::time::Duration = std::time::Duration::from_millis(300);
/// Samples whose progress barely moved are likewise skipped for the speed
/// estimate, to avoid amplifying measurement noise into a wild EMA swing.
const MIN_PROGRESS_DELTA: f64 = 0.001;
const MIN_SANE_BPS: f64 = 1024.0; // 1 KB/s
const MAX_SANE_BPS: f64 = 1024.0 * 1024.0 * 1024.0; // 1 GB/s

/// A caller-registered handle invoked by `Cancel`/`CancelAll`. Stored
/// type-erased since the orchestrator's actual cancellation mechanism
/// (a `CancellationToken::cancel()` closure, typically) is opaque to the
/// queue.
pub type CancelHandle = Arc<dyn Fn() + Send + Sync>;

/// Re-submits a task for execution after `Retry` resets its state. The
/// queue only owns bookkeeping; actually redriving the transfer is the
/// orchestrator's job, reached through this trait so the two crates don't
/// depend on each other.
pub trait RetryExecutor: Send + Sync {
    fn retry(&self, task_id: TaskId);
}

struct Sample {
    at: Instant,
    progress: f64,
}

struct Entry {
    task: TransferTask,
    last_sample: Option<Sample>,
    cancel: Option<CancelHandle>,
    retry_executor: Option<Arc<dyn RetryExecutor>>,
}

struct Inner {
    tasks: RwLock<HashMap<TaskId, Entry>>,
    events: broadcast::Sender<TransferEvent>,
}

#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<Inner>,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferQueue {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                tasks: RwLock::new(HashMap::new()),
                events: tx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, kind: EventKind, task: &TransferTask) {
        // A `send` error just means there are currently no subscribers;
        // that's not a failure condition for the queue itself.
        let _ = self.inner.events.send(TransferEvent {
            kind,
            task_id: task.id,
            direction: task.direction,
            name: task.display_name.clone(),
            size: task.declared_size,
            progress: task.progress,
            bytes_per_second: task.bytes_per_second,
            error: task.error.clone(),
        });
    }

    /// Registers a new task in state `Queued` and emits `transfer.queued`.
    pub fn track_transfer(
        &self,
        direction: Direction,
        display_name: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        declared_size: u64,
    ) -> TaskId {
        let id = Uuid::new_v4();
        let task = TransferTask::new(
            id,
            direction,
            display_name.into(),
            source.into(),
            destination.into(),
            declared_size,
            now_unix(),
        );
        self.emit(EventKind::Queued, &task);
        self.inner.tasks.write().insert(
            id,
            Entry {
                task,
                last_sample: None,
                cancel: None,
                retry_executor: None,
            },
        );
        id
    }

    fn with_task_mut<R>(&self, id: TaskId, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        let mut tasks = self.inner.tasks.write();
        tasks.get_mut(&id).map(f)
    }

    /// Called when a worker slot is acquired for the transfer (→
    /// `Initializing`).
    pub fn activate(&self, id: TaskId) {
        let emitted = self.with_task_mut(id, |entry| {
            entry.task.state = TaskState::Initializing;
            entry.task.clone()
        });
        if let Some(task) = emitted {
            self.emit(EventKind::Initializing, &task);
        }
    }

    /// Called on the first real byte of progress (→ `Active`).
    pub fn start_transfer(&self, id: TaskId) {
        let emitted = self.with_task_mut(id, |entry| {
            entry.task.state = TaskState::Active;
            entry.task.started_at_unix = Some(now_unix());
            entry.task.clone()
        });
        if let Some(task) = emitted {
            self.emit(EventKind::Started, &task);
        }
    }

    pub fn set_cancel(&self, id: TaskId, cancel: CancelHandle) {
        self.with_task_mut(id, |entry| entry.cancel = Some(cancel));
    }

    pub fn set_retry_executor(&self, id: TaskId, executor: Arc<dyn RetryExecutor>) {
        self.with_task_mut(id, |entry| entry.retry_executor = Some(executor));
    }

    /// Updates progress and, on a qualifying sample, the EMA speed
    /// estimate. `progress` is clamped to `[0, 1]`; NaN is treated as no
    /// change (explicit guard per spec §8 "Progress bounds").
    pub fn update_progress(&self, id: TaskId, progress: f64) {
        let progress = if progress.is_nan() { return } else { progress.clamp(0.0, 1.0) };
        let now = Instant::now();

        let emitted = self.with_task_mut(id, |entry| {
            if let Some(sample) = &entry.last_sample {
                let elapsed = now.duration_since(sample.at);
                let delta = (progress - sample.progress).abs();
                if elapsed >= MIN_SAMPLE_GAP && delta >= MIN_PROGRESS_DELTA {
                    let bytes_delta = (progress - sample.progress) * entry.task.declared_size as f64;
                    let instantaneous = (bytes_delta / elapsed.as_secs_f64())
                        .abs()
                        .clamp(MIN_SANE_BPS, MAX_SANE_BPS);
                    entry.task.bytes_per_second = if entry.task.bytes_per_second == 0.0 {
                        instantaneous
                    } else {
                        EMA_ALPHA * instantaneous + (1.0 - EMA_ALPHA) * entry.task.bytes_per_second
                    };
                    entry.last_sample = Some(Sample { at: now, progress });
                }
            } else {
                entry.last_sample = Some(Sample { at: now, progress });
            }
            entry.task.progress = progress;
            entry.task.clone()
        });

        if let Some(task) = emitted {
            self.emit(EventKind::Progress, &task);
        }
    }

    pub fn complete(&self, id: TaskId) {
        let emitted = self.with_task_mut(id, |entry| {
            entry.task.state = TaskState::Completed;
            entry.task.progress = 1.0;
            entry.task.completed_at_unix = Some(now_unix());
            entry.task.clone()
        });
        if let Some(task) = emitted {
            self.emit(EventKind::Completed, &task);
        }
    }

    pub fn fail(&self, id: TaskId, error: impl Into<String>) {
        let emitted = self.with_task_mut(id, |entry| {
            entry.task.state = TaskState::Failed;
            entry.task.error = Some(error.into());
            entry.task.completed_at_unix = Some(now_unix());
            entry.task.clone()
        });
        if let Some(task) = emitted {
            self.emit(EventKind::Failed, &task);
        }
    }

    /// Invokes the stored cancel handle (if any) and transitions to
    /// `Cancelled`. A task with no registered handle (not yet started, or
    /// already terminal) is still marked cancelled but nothing is invoked.
    pub fn cancel(&self, id: TaskId) {
        let result = self.with_task_mut(id, |entry| {
            let cancel = entry.cancel.take();
            entry.task.state = TaskState::Cancelled;
            entry.task.completed_at_unix = Some(now_unix());
            (entry.task.clone(), cancel)
        });
        if let Some((task, cancel)) = result {
            if let Some(cancel) = cancel {
                cancel();
            }
            self.emit(EventKind::Cancelled, &task);
        }
    }

    /// Cancels every task currently `Active` or `Initializing`.
    pub fn cancel_all(&self) {
        let ids: Vec<TaskId> = {
            let tasks = self.inner.tasks.read();
            tasks
                .iter()
                .filter(|(_, e)| matches!(e.task.state, TaskState::Active | TaskState::Initializing))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.cancel(id);
        }
    }

    /// Resets a task in place (new state `Queued`, zeroed progress/speed/
    /// error) and hands it to its registered `RetryExecutor`. Returns the
    /// same ID, never a duplicate — there is still exactly one entry for
    /// this transfer in `get_tasks()` afterward.
    pub fn retry(&self, id: TaskId) -> Option<TaskId> {
        let executor = self.with_task_mut(id, |entry| {
            entry.task.state = TaskState::Queued;
            entry.task.progress = 0.0;
            entry.task.bytes_per_second = 0.0;
            entry.task.error = None;
            entry.task.started_at_unix = None;
            entry.task.completed_at_unix = None;
            entry.last_sample = None;
            let task = entry.task.clone();
            (task, entry.retry_executor.clone())
        });
        let Some((task, executor)) = executor else {
            return None;
        };
        self.emit(EventKind::Queued, &task);
        match executor {
            Some(executor) => executor.retry(id),
            None => warn!(task_id = %id, "retry requested but no RetryExecutor is registered"),
        }
        Some(id)
    }

    pub fn get_task(&self, id: TaskId) -> Option<TransferTask> {
        self.inner.tasks.read().get(&id).map(|e| e.task.clone())
    }

    /// Returns a deep copy of every tracked task; observers never see the
    /// queue's internal cancel handles or retry executors.
    pub fn get_tasks(&self) -> Vec<TransferTask> {
        self.inner.tasks.read().values().map(|e| e.task.clone()).collect()
    }

    /// Drops terminal tasks from the registry, the way a long-running tray
    /// companion would periodically garbage-collect completed history.
    pub fn prune_terminal(&self) {
        let mut tasks = self.inner.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, e| !e.task.state.is_terminal());
        debug!(removed = before - tasks.len(), "pruned terminal transfer tasks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_queue() -> TransferQueue {
        TransferQueue::new()
    }

    #[test]
    fn track_transfer_starts_in_queued_state() {
        let q = sample_queue();
        let id = q.track_transfer(Direction::Upload, "f.bin", "/local/f.bin", "bucket/f.bin", 1024);
        let task = q.get_task(id).unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.progress, 0.0);
    }

    #[test]
    fn lifecycle_transitions_in_order() {
        let q = sample_queue();
        let id = q.track_transfer(Direction::Download, "f.bin", "bucket/f.bin", "/local/f.bin", 1024);
        q.activate(id);
        assert_eq!(q.get_task(id).unwrap().state, TaskState::Initializing);
        q.start_transfer(id);
        assert_eq!(q.get_task(id).unwrap().state, TaskState::Active);
        q.complete(id);
        let task = q.get_task(id).unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.progress, 1.0);
    }

    #[test]
    fn progress_is_always_bounded_and_never_nan() {
        let q = sample_queue();
        let id = q.track_transfer(Direction::Upload, "f", "s", "d", 0);
        q.update_progress(id, f64::NAN);
        assert!(!q.get_task(id).unwrap().progress.is_nan());
        q.update_progress(id, 1.5);
        assert_eq!(q.get_task(id).unwrap().progress, 1.0);
        q.update_progress(id, -0.5);
        assert_eq!(q.get_task(id).unwrap().progress, 0.0);
    }

    #[test]
    fn zero_byte_upload_reports_progress_one_immediately() {
        let q = sample_queue();
        let id = q.track_transfer(Direction::Upload, "empty", "s", "d", 0);
        q.update_progress(id, 1.0);
        assert_eq!(q.get_task(id).unwrap().progress, 1.0);
    }

    #[test]
    fn speed_ema_matches_synthetic_samples_within_twenty_percent() {
        let q = sample_queue();
        // 100 KB task.
        let id = q.track_transfer(Direction::Upload, "f", "s", "d", 100 * 1024);
        q.update_progress(id, 0.0);
        // Force the elapsed-time gate by backdating the first sample.
        {
            let mut tasks = q.inner.tasks.write();
            let entry = tasks.get_mut(&id).unwrap();
            entry.last_sample = Some(Sample {
                at: Instant::now() - std::time::Duration::from_secs(1),
                progress: 0.0,
            });
        }
        q.update_progress(id, 0.5);
        let bps = q.get_task(id).unwrap().bytes_per_second;
        let expected = 50.0 * 1024.0;
        assert!(
            (bps - expected).abs() / expected < 0.2,
            "bps {bps} not within 20% of {expected}"
        );
    }

    #[test]
    fn cancel_invokes_registered_handle() {
        let q = sample_queue();
        let id = q.track_transfer(Direction::Upload, "f", "s", "d", 1024);
        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_clone = invoked.clone();
        q.set_cancel(id, Arc::new(move || {
            invoked_clone.fetch_add(1, Ordering::SeqCst);
        }));
        q.cancel(id);
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(q.get_task(id).unwrap().state, TaskState::Cancelled);
    }

    #[test]
    fn cancel_all_only_touches_active_and_initializing_tasks() {
        let q = sample_queue();
        let queued = q.track_transfer(Direction::Upload, "a", "s", "d", 1);
        let active = q.track_transfer(Direction::Upload, "b", "s", "d", 1);
        q.activate(active);
        q.start_transfer(active);
        q.cancel_all();
        assert_eq!(q.get_task(queued).unwrap().state, TaskState::Queued);
        assert_eq!(q.get_task(active).unwrap().state, TaskState::Cancelled);
    }

    struct CountingExecutor {
        calls: AtomicUsize,
    }
    impl RetryExecutor for CountingExecutor {
        fn retry(&self, _task_id: TaskId) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn retry_returns_same_id_and_resets_state() {
        let q = sample_queue();
        let id = q.track_transfer(Direction::Upload, "f", "s", "d", 1024);
        q.activate(id);
        q.start_transfer(id);
        q.fail(id, "boom");

        let executor = Arc::new(CountingExecutor { calls: AtomicUsize::new(0) });
        q.set_retry_executor(id, executor.clone());

        let retried_id = q.retry(id).unwrap();
        assert_eq!(retried_id, id);
        assert_eq!(q.get_tasks().len(), 1);
        let task = q.get_task(id).unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.error, None);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_tasks_returns_deep_copies() {
        let q = sample_queue();
        let id = q.track_transfer(Direction::Upload, "f", "s", "d", 1024);
        let mut copy = q.get_tasks().into_iter().next().unwrap();
        copy.progress = 0.9;
        assert_eq!(q.get_task(id).unwrap().progress, 0.0);
    }
}
