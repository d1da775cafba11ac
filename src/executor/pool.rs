//! Bounded thread pool with runtime-adjustable core and maximum sizes.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::{ExecutorError, Result};
use crate::config::{ConfigError, ExecutorConfig, PoolSize, RejectionPolicy};
use crate::management::{
    self, AttributeInfo, AttributeValue, ManagedObject, ManagementError, ObjectName,
};

type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) const ATTRIBUTES: &[AttributeInfo] = &[
    AttributeInfo::read_only("ActiveCount", "Threads actively executing tasks"),
    AttributeInfo::read_only("CompletedTaskCount", "Tasks that have completed execution"),
    AttributeInfo::read_write("CorePoolSize", "Core number of threads"),
    AttributeInfo::read_write("MaximumPoolSize", "Maximum allowed number of threads"),
    AttributeInfo::read_only("LargestPoolSize", "Largest number of threads ever in the pool"),
    AttributeInfo::read_only("PoolSize", "Current number of threads"),
    AttributeInfo::read_only("QueueRemainingCapacity", "Tasks the queue can still accept"),
    AttributeInfo::read_only("RejectedExecutionCount", "Tasks ever rejected"),
    AttributeInfo::read_only("TaskCount", "Tasks ever scheduled, rejected ones excluded"),
];

struct PoolState {
    queue: VecDeque<Task>,
    workers: usize,
    idle: usize,
    largest: usize,
    core: usize,
    max: usize,
    next_thread: usize,
    shutdown: bool,
}

struct Shared {
    name: String,
    queue_capacity: Option<usize>,
    keep_alive: Duration,
    policy: RejectionPolicy,
    state: Mutex<PoolState>,
    task_available: Condvar,
    terminated: Condvar,
    active: AtomicUsize,
    completed: AtomicU64,
    scheduled: AtomicU64,
    rejected: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the queue takes one more task.
    ///
    /// Without capacity every task is queued; with capacity 0 a task is
    /// only handed to a worker already waiting for one.
    fn queue_accepts(&self, state: &PoolState) -> bool {
        match self.queue_capacity {
            None => true,
            Some(0) => state.idle > state.queue.len(),
            Some(capacity) => state.queue.len() < capacity,
        }
    }

    fn run_task(&self, task: Task) {
        self.active.fetch_add(1, Ordering::Relaxed);
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(pool = %self.name, panic = %message, "Task panicked");
        }
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Next task for a worker, or `None` when the worker must exit.
    ///
    /// A worker above the core size waits at most `keep_alive` for a task.
    fn next_task(&self) -> Option<Task> {
        let mut state = self.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                return Some(task);
            }
            if state.shutdown || state.workers > state.max {
                return self.retire(state);
            }
            let timed = state.workers > state.core;
            state.idle += 1;
            if timed {
                let (guard, timeout) = self
                    .task_available
                    .wait_timeout(state, self.keep_alive)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
                state.idle -= 1;
                if timeout.timed_out() && state.queue.is_empty() && state.workers > state.core {
                    return self.retire(state);
                }
            } else {
                state = self
                    .task_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                state.idle -= 1;
            }
        }
    }

    fn retire(&self, mut state: MutexGuard<'_, PoolState>) -> Option<Task> {
        state.workers -= 1;
        if state.workers == 0 && state.shutdown {
            self.terminated.notify_all();
        }
        None
    }
}

fn worker_loop(shared: Arc<Shared>, first: Option<Task>) {
    let mut task = first;
    while let Some(current) = task.take().or_else(|| shared.next_task()) {
        shared.run_task(current);
    }
    debug!(pool = %shared.name, "Worker exiting");
}

enum Placement {
    Accepted,
    Rejected(Task),
    Shutdown,
}

/// Thread pool publishing its sizes and counters on the management bus.
///
/// A task starts a new thread while fewer than `core` threads exist, is
/// queued otherwise, starts a thread above `core` (up to `max`) when the
/// queue refuses it, and goes to the rejection policy last.
pub struct ThreadPoolExecutor {
    shared: Arc<Shared>,
    object_name: ObjectName,
}

impl ThreadPoolExecutor {
    /// Pool described by `config`, named `<domain>:type=ThreadPoolExecutor,name=<name>`.
    pub fn new(config: &ExecutorConfig, domain: &str) -> Result<Self> {
        if config.name.is_empty() {
            return Err(ConfigError::MissingField {
                section: "executors",
                field: "name",
            }
            .into());
        }
        let size = config.pool_size()?;
        info!(
            pool = %config.name,
            pool_size = %size,
            queue_capacity = ?config.queue_capacity,
            policy = %config.rejection_policy,
            "Creating thread pool"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                name: config.name.clone(),
                queue_capacity: config.queue_capacity,
                keep_alive: config.keep_alive(),
                policy: config.rejection_policy,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    largest: 0,
                    core: size.core,
                    max: size.max,
                    next_thread: 1,
                    shutdown: false,
                }),
                task_available: Condvar::new(),
                terminated: Condvar::new(),
                active: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                scheduled: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
            object_name: ObjectName::typed(domain, "ThreadPoolExecutor", Some(&config.name)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Submit a task.
    ///
    /// Rejected tasks are counted whatever the policy; only `Abort`
    /// reports the rejection to the caller.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.place(Box::new(task))? {
            Placement::Accepted => Ok(()),
            Placement::Rejected(task) => self.reject(task),
            Placement::Shutdown => {
                self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.shared.name, "Task submitted after shutdown");
                match self.shared.policy {
                    RejectionPolicy::Abort => Err(ExecutorError::Shutdown {
                        pool: self.shared.name.clone(),
                    }),
                    _ => Ok(()),
                }
            }
        }
    }

    fn place(&self, task: Task) -> Result<Placement> {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Ok(Placement::Shutdown);
        }
        if state.workers < state.core {
            self.spawn_worker(state, task)?;
        } else if self.shared.queue_accepts(&state) {
            state.queue.push_back(task);
            self.shared.task_available.notify_one();
        } else if state.workers < state.max {
            self.spawn_worker(state, task)?;
        } else {
            return Ok(Placement::Rejected(task));
        }
        self.shared.scheduled.fetch_add(1, Ordering::Relaxed);
        Ok(Placement::Accepted)
    }

    /// Start one worker running `task` first. Consumes the lock.
    fn spawn_worker(&self, mut state: MutexGuard<'_, PoolState>, task: Task) -> Result<()> {
        state.workers += 1;
        state.largest = state.largest.max(state.workers);
        let thread_name = format!("{}-{}", self.shared.name, state.next_thread);
        state.next_thread += 1;
        drop(state);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker_loop(shared, Some(task)));
        match spawned {
            Ok(_) => {
                debug!(thread = %thread_name, "Started pool thread");
                Ok(())
            }
            Err(e) => {
                self.shared.lock().workers -= 1;
                error!(thread = %thread_name, error = %e, "Failed to start pool thread");
                Err(ExecutorError::Rejected {
                    pool: self.shared.name.clone(),
                    reason: format!("cannot start thread: {e}"),
                })
            }
        }
    }

    fn reject(&self, task: Task) -> Result<()> {
        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(pool = %self.shared.name, policy = %self.shared.policy, "Task rejected");
        match self.shared.policy {
            RejectionPolicy::Abort => Err(ExecutorError::Rejected {
                pool: self.shared.name.clone(),
                reason: "pool and queue are full".to_string(),
            }),
            RejectionPolicy::CallerRuns => {
                task();
                Ok(())
            }
            RejectionPolicy::Discard => Ok(()),
            RejectionPolicy::DiscardOldest => {
                let mut state = self.shared.lock();
                if state.shutdown {
                    return Ok(());
                }
                if state.queue.pop_front().is_some() {
                    state.queue.push_back(task);
                    self.shared.scheduled.fetch_add(1, Ordering::Relaxed);
                    self.shared.task_available.notify_one();
                }
                Ok(())
            }
        }
    }

    /// Stop accepting tasks. Queued tasks still run.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        if state.workers == 0 {
            self.shared.terminated.notify_all();
        }
        self.shared.task_available.notify_all();
        info!(pool = %self.shared.name, queued = state.queue.len(), "Thread pool shutting down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Shut down and every worker exited.
    pub fn is_terminated(&self) -> bool {
        let state = self.shared.lock();
        state.shutdown && state.workers == 0
    }

    /// Wait for termination after `shutdown`. Returns whether the pool
    /// terminated within `timeout`.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if state.shutdown && state.workers == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = self
                .shared
                .terminated
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn core_pool_size(&self) -> usize {
        self.shared.lock().core
    }

    /// Change the core size. Excess threads exit when next idle; queued
    /// tasks get new threads when the size grows.
    pub fn set_core_pool_size(&self, core: usize) -> Result<()> {
        let mut state = self.shared.lock();
        state.core = PoolSize::new(core, state.max)?.core;
        self.shared.task_available.notify_all();
        info!(pool = %self.shared.name, core, "Core pool size changed");

        while !state.shutdown && state.workers < state.core && state.queue.len() > state.idle {
            let Some(task) = state.queue.pop_front() else {
                break;
            };
            self.spawn_worker(state, task)?;
            state = self.shared.lock();
        }
        Ok(())
    }

    pub fn maximum_pool_size(&self) -> usize {
        self.shared.lock().max
    }

    /// Change the maximum size. Excess threads exit when next idle.
    pub fn set_maximum_pool_size(&self, max: usize) -> Result<()> {
        let mut state = self.shared.lock();
        let size = PoolSize::new(state.core, max)?;
        state.max = size.max;
        self.shared.task_available.notify_all();
        info!(pool = %self.shared.name, max, "Maximum pool size changed");
        Ok(())
    }

    /// Threads currently running a task.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    pub fn completed_task_count(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn pool_size(&self) -> usize {
        self.shared.lock().workers
    }

    pub fn largest_pool_size(&self) -> usize {
        self.shared.lock().largest
    }

    pub fn queue_size(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Tasks the queue can still take; `usize::MAX` when unbounded.
    pub fn queue_remaining_capacity(&self) -> usize {
        match self.shared.queue_capacity {
            None => usize::MAX,
            Some(capacity) => capacity.saturating_sub(self.queue_size()),
        }
    }

    pub fn rejected_execution_count(&self) -> u64 {
        self.shared.rejected.load(Ordering::Relaxed)
    }

    /// Tasks ever scheduled on the pool, rejected ones excluded.
    pub fn task_count(&self) -> u64 {
        self.shared.scheduled.load(Ordering::Relaxed)
    }

    pub fn keep_alive(&self) -> Duration {
        self.shared.keep_alive
    }

    pub fn rejection_policy(&self) -> RejectionPolicy {
        self.shared.policy
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pool_size_value(attribute: &str, value: &AttributeValue) -> management::Result<usize> {
    let size = value.expect_i64(attribute)?;
    usize::try_from(size).map_err(|_| ManagementError::InvalidValue {
        attribute: attribute.to_string(),
        reason: format!("pool size must not be negative, got {size}"),
    })
}

fn rejected_size(attribute: &str, error: ExecutorError) -> ManagementError {
    ManagementError::InvalidValue {
        attribute: attribute.to_string(),
        reason: error.to_string(),
    }
}

impl ManagedObject for ThreadPoolExecutor {
    fn object_name(&self) -> ObjectName {
        self.object_name.clone()
    }

    fn attributes(&self) -> Vec<AttributeInfo> {
        ATTRIBUTES.to_vec()
    }

    fn get_attribute(&self, attribute: &str) -> management::Result<AttributeValue> {
        let value: AttributeValue = match attribute {
            "ActiveCount" => self.active_count().into(),
            "CompletedTaskCount" => self.completed_task_count().into(),
            "CorePoolSize" => self.core_pool_size().into(),
            "MaximumPoolSize" => self.maximum_pool_size().into(),
            "LargestPoolSize" => self.largest_pool_size().into(),
            "PoolSize" => self.pool_size().into(),
            "QueueRemainingCapacity" => self.queue_remaining_capacity().into(),
            "RejectedExecutionCount" => self.rejected_execution_count().into(),
            "TaskCount" => self.task_count().into(),
            other => return Err(ManagementError::unknown_attribute(other)),
        };
        Ok(value)
    }

    fn set_attribute(&self, attribute: &str, value: AttributeValue) -> management::Result<()> {
        match attribute {
            "CorePoolSize" => self
                .set_core_pool_size(pool_size_value(attribute, &value)?)
                .map_err(|e| rejected_size(attribute, e)),
            "MaximumPoolSize" => self
                .set_maximum_pool_size(pool_size_value(attribute, &value)?)
                .map_err(|e| rejected_size(attribute, e)),
            other if ATTRIBUTES.iter().any(|a| a.name == other) => {
                Err(ManagementError::read_only(other))
            }
            other => Err(ManagementError::unknown_attribute(other)),
        }
    }
}
