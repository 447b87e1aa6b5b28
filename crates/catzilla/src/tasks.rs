// src/tasks.rs
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

pub const PRIORITIES: [Priority; 4] = [
    Priority::Critical,
    Priority::High,
    Priority::Normal,
    Priority::Low,
];

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Monotonic task identifier: millisecond timestamp in the high bits,
/// a process-local sequence in the low 20.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Cooperative cancellation flag. The executor sets it; the task is
/// expected to observe it at safe points.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub type TaskFn = Box<dyn FnOnce(&CancelToken) -> Result<Value, String> + Send + 'static>;

pub struct TaskDescriptor {
    pub priority: Priority,
    /// Fast-path eligible: may run inline on the submitting thread.
    pub fast: bool,
    /// Declared by the submitter: the task performs no I/O.
    pub no_io: bool,
    pub name: Option<String>,
    pub func: TaskFn,
}

impl TaskDescriptor {
    pub fn new(func: impl FnOnce(&CancelToken) -> Result<Value, String> + Send + 'static) -> Self {
        TaskDescriptor {
            priority: Priority::Normal,
            fast: false,
            no_io: false,
            name: None,
            func: Box::new(func),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Mark as fast-path eligible; only honored together with `no_io`.
    pub fn fast(mut self, no_io: bool) -> Self {
        self.fast = true;
        self.no_io = no_io;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// A LOW task older than this promotes one level.
    pub starvation_bound: Duration,
    /// Scale up when total depth exceeds `workers * high_watermark`.
    pub high_watermark: usize,
    pub scale_up_window: Duration,
    pub scale_down_window: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            min_workers: 2,
            max_workers: num_cpus::get().max(2),
            starvation_bound: Duration::from_secs(5),
            high_watermark: 4,
            scale_up_window: Duration::from_millis(500),
            scale_down_window: Duration::from_secs(30),
        }
    }
}

struct QueuedTask {
    id: TaskId,
    func: TaskFn,
    token: CancelToken,
    enqueued: Instant,
}

struct Queues {
    lanes: [VecDeque<QueuedTask>; 4],
}

impl Queues {
    fn new() -> Self {
        Queues {
            lanes: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
        }
    }

    fn depth(&self) -> usize {
        self.lanes.iter().map(|q| q.len()).sum()
    }

    fn depths(&self) -> [usize; 4] {
        [
            self.lanes[0].len(),
            self.lanes[1].len(),
            self.lanes[2].len(),
            self.lanes[3].len(),
        ]
    }

    /// Dequeue order CRITICAL > HIGH > NORMAL > LOW, after promoting a
    /// starving LOW head one level.
    fn pop_next(&mut self, starvation_bound: Duration) -> Option<QueuedTask> {
        if let Some(front) = self.lanes[Priority::Low as usize].front()
            && front.enqueued.elapsed() >= starvation_bound
        {
            let promoted = self.lanes[Priority::Low as usize].pop_front();
            if let Some(task) = promoted {
                self.lanes[Priority::Normal as usize].push_back(task);
            }
        }
        for lane in &mut self.lanes {
            if let Some(task) = lane.pop_front() {
                return Some(task);
            }
        }
        None
    }
}

struct TaskRecord {
    state: TaskState,
    priority: Priority,
    result: Option<Value>,
    error: Option<String>,
    token: CancelToken,
}

struct Inner {
    config: ExecutorConfig,
    queues: Mutex<Queues>,
    work_cv: Condvar,
    registry: Mutex<FxHashMap<u64, TaskRecord>>,
    done_cv: Condvar,
    seq: AtomicU64,
    workers: AtomicUsize,
    busy: AtomicUsize,
    target_workers: AtomicUsize,
    executed: AtomicU64,
    failed: AtomicU64,
    shutdown: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub queue_depths: [usize; 4],
    pub workers: usize,
    pub busy_workers: usize,
    pub executed: u64,
    pub failed: u64,
}

/// Process-wide background task executor. Four priority lanes, a worker
/// pool bounded by [min_workers, max_workers], and a supervisor thread
/// applying the auto-scaling heuristic. A panicking task records FAILED
/// with the panic payload; the worker survives.
pub struct TaskExecutor {
    inner: Arc<Inner>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl TaskExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let min = config.min_workers.max(1);
        let inner = Arc::new(Inner {
            config: ExecutorConfig {
                min_workers: min,
                max_workers: config.max_workers.max(min),
                ..config
            },
            queues: Mutex::new(Queues::new()),
            work_cv: Condvar::new(),
            registry: Mutex::new(FxHashMap::default()),
            done_cv: Condvar::new(),
            seq: AtomicU64::new(0),
            workers: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            target_workers: AtomicUsize::new(min),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let executor = TaskExecutor {
            inner: inner.clone(),
            handles: Mutex::new(Vec::new()),
        };
        for _ in 0..min {
            executor.spawn_worker();
        }
        executor.spawn_supervisor();
        executor
    }

    fn next_id(&self) -> TaskId {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        TaskId((ms << 20) | (seq & 0xFFFFF))
    }

    /// Submit a task. Fast-path tasks declared I/O-free run inline on
    /// the submitting thread when their lane is empty.
    pub fn submit(&self, descriptor: TaskDescriptor) -> TaskId {
        let id = self.next_id();
        let token = CancelToken::new();
        self.inner.registry.lock().insert(
            id.0,
            TaskRecord {
                state: TaskState::Queued,
                priority: descriptor.priority,
                result: None,
                error: None,
                token: token.clone(),
            },
        );

        if descriptor.fast && descriptor.no_io {
            let lane_empty = self.inner.queues.lock().lanes[descriptor.priority as usize]
                .is_empty();
            if lane_empty {
                run_task(&self.inner, id, descriptor.func, token);
                return id;
            }
        }

        {
            let mut queues = self.inner.queues.lock();
            queues.lanes[descriptor.priority as usize].push_back(QueuedTask {
                id,
                func: descriptor.func,
                token,
                enqueued: Instant::now(),
            });
        }
        self.inner.work_cv.notify_one();
        tracing::debug!(
            target: "catzilla::tasks",
            id = %id,
            priority = descriptor.priority.as_str(),
            "task submitted"
        );
        id
    }

    /// Cancel a task. Queued tasks are cancelled synchronously; running
    /// tasks get their cancellation flag set and are expected to observe
    /// it. Terminal tasks report `false`.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut registry = self.inner.registry.lock();
        match registry.get_mut(&id.0) {
            Some(record) => match record.state {
                TaskState::Queued => {
                    record.state = TaskState::Cancelled;
                    record.token.cancel();
                    self.inner.done_cv.notify_all();
                    true
                }
                TaskState::Running => {
                    record.token.cancel();
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    pub fn status(&self, id: TaskId) -> Option<TaskState> {
        self.inner.registry.lock().get(&id.0).map(|r| r.state)
    }

    /// Block until the task reaches a terminal state or the deadline
    /// passes. Returns `None` on unknown id or timeout.
    pub fn result(&self, id: TaskId, timeout: Duration) -> Option<Result<Value, String>> {
        let deadline = Instant::now() + timeout;
        let mut registry = self.inner.registry.lock();
        loop {
            match registry.get(&id.0) {
                None => return None,
                Some(record) if record.state.is_terminal() => {
                    return Some(match record.state {
                        TaskState::Succeeded => Ok(record.result.clone().unwrap_or(Value::Null)),
                        TaskState::Cancelled => Err("cancelled".to_string()),
                        _ => Err(record
                            .error
                            .clone()
                            .unwrap_or_else(|| "unknown failure".to_string())),
                    });
                }
                Some(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    if self
                        .inner
                        .done_cv
                        .wait_until(&mut registry, deadline)
                        .timed_out()
                    {
                        // Re-check once after the timeout before giving up.
                        continue;
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let depths = self.inner.queues.lock().depths();
        ExecutorStats {
            queue_depths: depths,
            workers: self.inner.workers.load(Ordering::Relaxed),
            busy_workers: self.inner.busy.load(Ordering::Relaxed),
            executed: self.inner.executed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.work_cv.notify_all();
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    fn spawn_worker(&self) {
        let inner = self.inner.clone();
        inner.workers.fetch_add(1, Ordering::Relaxed);
        let handle = std::thread::Builder::new()
            .name("catzilla-task-worker".to_string())
            .spawn(move || worker_loop(inner))
            .expect("spawn task worker");
        self.handles.lock().push(handle);
    }

    fn spawn_supervisor(&self) {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("catzilla-task-supervisor".to_string())
            .spawn(move || supervisor_loop(inner))
            .expect("spawn task supervisor");
        self.handles.lock().push(handle);
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let task = {
            let mut queues = inner.queues.lock();
            loop {
                if let Some(task) = queues.pop_next(inner.config.starvation_bound) {
                    break Some(task);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                // Retire this worker if the pool shrank below us.
                if inner.workers.load(Ordering::Relaxed)
                    > inner.target_workers.load(Ordering::Relaxed)
                {
                    break None;
                }
                inner
                    .work_cv
                    .wait_for(&mut queues, Duration::from_millis(100));
            }
        };

        let Some(task) = task else {
            inner.workers.fetch_sub(1, Ordering::Relaxed);
            return;
        };

        // Skip tasks cancelled while queued.
        let cancelled = inner
            .registry
            .lock()
            .get(&task.id.0)
            .is_none_or(|r| r.state == TaskState::Cancelled);
        if cancelled {
            continue;
        }

        inner.busy.fetch_add(1, Ordering::Relaxed);
        run_task(&inner, task.id, task.func, task.token);
        inner.busy.fetch_sub(1, Ordering::Relaxed);
    }
}

fn run_task(inner: &Inner, id: TaskId, func: TaskFn, token: CancelToken) {
    if let Some(record) = inner.registry.lock().get_mut(&id.0) {
        record.state = TaskState::Running;
    }

    let outcome = catch_unwind(AssertUnwindSafe(|| func(&token)));

    let mut registry = inner.registry.lock();
    let Some(record) = registry.get_mut(&id.0) else {
        return;
    };
    match outcome {
        Ok(Ok(value)) => {
            if token.is_cancelled() {
                record.state = TaskState::Cancelled;
            } else {
                record.state = TaskState::Succeeded;
                record.result = Some(value);
            }
            inner.executed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(message)) => {
            record.state = TaskState::Failed;
            record.error = Some(message);
            inner.failed.fetch_add(1, Ordering::Relaxed);
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task panicked".to_string());
            tracing::warn!(target: "catzilla::tasks", id = %id, %message, "task panicked");
            record.state = TaskState::Failed;
            record.error = Some(message);
            inner.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
    drop(registry);
    inner.done_cv.notify_all();
}

fn supervisor_loop(inner: Arc<Inner>) {
    let mut over_since: Option<Instant> = None;
    let mut empty_since: Option<Instant> = None;

    while !inner.shutdown.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(50));

        let depth = inner.queues.lock().depth();
        let workers = inner.workers.load(Ordering::Relaxed);

        if depth > workers * inner.config.high_watermark {
            empty_since = None;
            let since = *over_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= inner.config.scale_up_window
                && workers < inner.config.max_workers
            {
                over_since = None;
                inner.target_workers.fetch_add(1, Ordering::Relaxed);
                spawn_detached_worker(&inner);
                tracing::debug!(
                    target: "catzilla::tasks",
                    workers = workers + 1,
                    depth,
                    "scaled worker pool up"
                );
            }
        } else if depth == 0 && inner.busy.load(Ordering::Relaxed) == 0 {
            over_since = None;
            let since = *empty_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= inner.config.scale_down_window
                && workers > inner.config.min_workers
            {
                empty_since = None;
                inner.target_workers.fetch_sub(1, Ordering::Relaxed);
                inner.work_cv.notify_all();
                tracing::debug!(
                    target: "catzilla::tasks",
                    workers = workers - 1,
                    "scaled worker pool down"
                );
            }
        } else {
            over_since = None;
            empty_since = None;
        }
    }
}

fn spawn_detached_worker(inner: &Arc<Inner>) {
    let inner = inner.clone();
    inner.workers.fetch_add(1, Ordering::Relaxed);
    let _ = std::thread::Builder::new()
        .name("catzilla-task-worker".to_string())
        .spawn(move || worker_loop(inner));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quick_config() -> ExecutorConfig {
        ExecutorConfig {
            min_workers: 1,
            max_workers: 1,
            starvation_bound: Duration::from_millis(50),
            high_watermark: 1000,
            scale_up_window: Duration::from_secs(3600),
            scale_down_window: Duration::from_secs(3600),
        }
    }

    #[test]
    fn submit_and_collect_result() {
        let executor = TaskExecutor::new(quick_config());
        let id = executor.submit(TaskDescriptor::new(|_| Ok(json!({"sum": 3}))));
        let result = executor
            .result(id, Duration::from_secs(2))
            .expect("result in time");
        assert_eq!(result.unwrap(), json!({"sum": 3}));
        assert_eq!(executor.status(id), Some(TaskState::Succeeded));
    }

    #[test]
    fn failure_is_recorded_not_propagated() {
        let executor = TaskExecutor::new(quick_config());
        let id = executor.submit(TaskDescriptor::new(|_| Err("no disk".to_string())));
        let result = executor.result(id, Duration::from_secs(2)).unwrap();
        assert_eq!(result.unwrap_err(), "no disk");
        assert_eq!(executor.status(id), Some(TaskState::Failed));
    }

    #[test]
    fn panicking_task_fails_and_pool_survives() {
        let executor = TaskExecutor::new(quick_config());
        let id = executor.submit(TaskDescriptor::new(|_| panic!("boom: {}", 42)));
        let result = executor.result(id, Duration::from_secs(2)).unwrap();
        assert!(result.unwrap_err().contains("boom"));

        // The worker is still alive and processes the next task.
        let id = executor.submit(TaskDescriptor::new(|_| Ok(json!(1))));
        assert!(executor.result(id, Duration::from_secs(2)).is_some());
        assert_eq!(executor.stats().failed, 1);
    }

    #[test]
    fn queued_cancellation_is_synchronous() {
        let executor = TaskExecutor::new(quick_config());

        // Jam the single worker so the next submission stays queued.
        let gate = Arc::new(AtomicBool::new(false));
        let gate_clone = gate.clone();
        let blocker = executor.submit(TaskDescriptor::new(move |_| {
            while !gate_clone.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(Value::Null)
        }));

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let id = executor.submit(TaskDescriptor::new(move |_| {
            ran_clone.store(true, Ordering::Relaxed);
            Ok(Value::Null)
        }));

        assert!(executor.cancel(id));
        assert_eq!(executor.status(id), Some(TaskState::Cancelled));
        let result = executor.result(id, Duration::from_secs(1)).unwrap();
        assert_eq!(result.unwrap_err(), "cancelled");

        gate.store(true, Ordering::Relaxed);
        executor.result(blocker, Duration::from_secs(2)).unwrap().unwrap();
        // Give the worker a beat: the cancelled task must never run.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!ran.load(Ordering::Relaxed));
    }

    #[test]
    fn running_cancellation_is_cooperative() {
        let executor = TaskExecutor::new(quick_config());
        let id = executor.submit(TaskDescriptor::new(|token: &CancelToken| {
            while !token.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(Value::Null)
        }));

        // Wait for it to start, then cancel.
        let deadline = Instant::now() + Duration::from_secs(2);
        while executor.status(id) != Some(TaskState::Running) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(executor.cancel(id));
        let result = executor.result(id, Duration::from_secs(2)).unwrap();
        assert_eq!(result.unwrap_err(), "cancelled");
        assert_eq!(executor.status(id), Some(TaskState::Cancelled));
    }

    #[test]
    fn priority_order_and_low_aging() {
        let mut queues = Queues::new();
        let push = |queues: &mut Queues, priority: Priority, id: u64, age: Duration| {
            queues.lanes[priority as usize].push_back(QueuedTask {
                id: TaskId(id),
                func: Box::new(|_| Ok(Value::Null)),
                token: CancelToken::new(),
                enqueued: Instant::now() - age,
            });
        };

        push(&mut queues, Priority::Low, 1, Duration::ZERO);
        push(&mut queues, Priority::Normal, 2, Duration::ZERO);
        push(&mut queues, Priority::Critical, 3, Duration::ZERO);
        push(&mut queues, Priority::High, 4, Duration::ZERO);

        let bound = Duration::from_secs(5);
        assert_eq!(queues.pop_next(bound).unwrap().id, TaskId(3));
        assert_eq!(queues.pop_next(bound).unwrap().id, TaskId(4));
        assert_eq!(queues.pop_next(bound).unwrap().id, TaskId(2));
        assert_eq!(queues.pop_next(bound).unwrap().id, TaskId(1));
        assert!(queues.pop_next(bound).is_none());

        // A starving LOW task promotes one level and then beats a
        // freshly queued LOW task but not NORMAL work already promoted.
        push(&mut queues, Priority::Low, 10, Duration::from_secs(10));
        push(&mut queues, Priority::Low, 11, Duration::ZERO);
        assert_eq!(queues.pop_next(bound).unwrap().id, TaskId(10));
        assert_eq!(queues.pop_next(bound).unwrap().id, TaskId(11));
    }

    #[test]
    fn fast_path_runs_inline_on_submitter() {
        let executor = TaskExecutor::new(quick_config());
        let submitter = std::thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let ran_on_clone = ran_on.clone();

        let id = executor.submit(
            TaskDescriptor::new(move |_| {
                *ran_on_clone.lock() = Some(std::thread::current().id());
                Ok(Value::Null)
            })
            .fast(true),
        );

        // Inline execution means the state is terminal upon return.
        assert_eq!(executor.status(id), Some(TaskState::Succeeded));
        assert_eq!(*ran_on.lock(), Some(submitter));
    }

    #[test]
    fn stats_expose_depths_and_counts() {
        let executor = TaskExecutor::new(quick_config());
        let gate = Arc::new(AtomicBool::new(false));
        let gate_clone = gate.clone();
        executor.submit(TaskDescriptor::new(move |_| {
            while !gate_clone.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(Value::Null)
        }));
        let queued = executor.submit(
            TaskDescriptor::new(|_| Ok(Value::Null)).with_priority(Priority::High),
        );

        // One task running, one queued in the HIGH lane.
        let deadline = Instant::now() + Duration::from_secs(2);
        while executor.stats().busy_workers == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let stats = executor.stats();
        assert_eq!(stats.queue_depths[Priority::High as usize], 1);
        assert_eq!(stats.workers, 1);

        gate.store(true, Ordering::Relaxed);
        executor.result(queued, Duration::from_secs(2)).unwrap().unwrap();
        assert!(executor.stats().executed >= 2);
    }

    #[test]
    fn pool_scales_up_under_sustained_depth() {
        let executor = TaskExecutor::new(ExecutorConfig {
            min_workers: 1,
            max_workers: 3,
            starvation_bound: Duration::from_secs(5),
            high_watermark: 1,
            scale_up_window: Duration::from_millis(60),
            scale_down_window: Duration::from_secs(3600),
        });

        let gate = Arc::new(AtomicBool::new(false));
        for _ in 0..6 {
            let gate_clone = gate.clone();
            executor.submit(TaskDescriptor::new(move |_| {
                while !gate_clone.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(Value::Null)
            }));
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while executor.stats().workers < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(executor.stats().workers >= 2, "pool did not scale up");
        gate.store(true, Ordering::Relaxed);
    }
}
