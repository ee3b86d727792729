//! Worker core: task queue, per-task execution, and reconciliation
//!
//! The worker owns a FIFO of tasks awaiting execution and a task store with
//! the latest snapshot of everything it has run. Three periodic loops drive
//! it (see `main.rs`): the run loop executes queued work, the stats loop
//! refreshes the host snapshot, and the reconcile loop compares stored state
//! against what the container runtime actually reports.

use anyhow::{anyhow, Result};
use bollard::models::ContainerInspectResponse;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use shared::task::{valid_transition, State, Task, TaskSpec};
use shared::{OrchestratorError, Stats, Store};

use crate::runtime::{container_exited, port_map_from_runtime, DockerRuntime, RuntimeResult};
use crate::stats;

pub struct Worker {
    name: String,
    /// Tasks awaiting execution, drained one per run-loop tick.
    queue: Mutex<VecDeque<Task>>,
    /// Latest snapshot per task id.
    db: Mutex<Box<dyn Store<Task>>>,
    /// Host snapshot served on `GET /stats`.
    stats: Mutex<Stats>,
    task_count: AtomicUsize,
}

impl Worker {
    pub fn new(name: impl Into<String>, store: Box<dyn Store<Task>>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            db: Mutex::new(store),
            stats: Mutex::new(Stats::default()),
            task_count: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a task at the tail of the FIFO.
    pub async fn add_task(&self, task: Task) {
        debug!(task_id = %task.id, state = ?task.state, "Task queued");
        self.queue.lock().await.push_back(task);
    }

    /// Current store contents.
    pub async fn get_tasks(&self) -> Result<Vec<Task>> {
        self.db.lock().await.list()
    }

    pub async fn stats(&self) -> Stats {
        self.stats.lock().await.clone()
    }

    pub fn task_count(&self) -> usize {
        self.task_count.load(Ordering::Relaxed)
    }

    async fn persist(&self, task: &Task) -> Result<()> {
        self.db.lock().await.put(&task.id.to_string(), task)
    }

    /// One run-loop tick: dequeue a task and execute it.
    ///
    /// The persisted copy is the transition source; a task never seen before
    /// is inserted with the queued copy as authoritative. An illegal
    /// transition is recorded and the task dropped.
    pub async fn run_next_task(&self) -> Result<Option<RuntimeResult>> {
        let queued = self.queue.lock().await.pop_front();
        let Some(queued) = queued else {
            debug!("No tasks to process currently");
            return Ok(None);
        };

        let key = queued.id.to_string();
        let persisted = {
            let mut db = self.db.lock().await;
            match db.get(&key) {
                Ok(existing) => existing,
                Err(_) => {
                    db.put(&key, &queued)?;
                    queued.clone()
                }
            }
        };

        if !valid_transition(persisted.state, queued.state) {
            let err = OrchestratorError::InvalidTransition {
                from: persisted.state,
                to: queued.state,
            };
            error!(task_id = %queued.id, "{}", err);
            return Err(err.into());
        }

        match queued.state {
            State::Scheduled => self.start_task(queued).await.map(Some),
            State::Completed => self.stop_task(queued).await.map(Some),
            other => {
                error!(task_id = %queued.id, state = ?other, "Unexpected queued task state");
                Err(anyhow!("we should not get here"))
            }
        }
    }

    /// Launch the task's container. On runtime failure the task is marked
    /// Failed and persisted so the manager's health loop can see it.
    pub async fn start_task(&self, mut task: Task) -> Result<RuntimeResult> {
        task.start_time = Some(Utc::now());

        let spec = TaskSpec::from_task(&task);
        let result = match DockerRuntime::new(spec) {
            Ok(runtime) => runtime.run().await,
            Err(e) => Err(e),
        };

        match result {
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Error running task");
                task.state = State::Failed;
                self.persist(&task).await?;
                Err(e)
            }
            Ok(result) => {
                task.container_id = result.container_id.clone();
                task.state = State::Running;
                self.persist(&task).await?;
                info!(task_id = %task.id, container_id = %task.container_id, "Task started");
                Ok(result)
            }
        }
    }

    /// Stop the task's container. Whatever the runtime says, the task is
    /// stamped finished and persisted as Completed.
    pub async fn stop_task(&self, mut task: Task) -> Result<RuntimeResult> {
        let stop_result = match DockerRuntime::new(TaskSpec::from_task(&task)) {
            Ok(runtime) => runtime.stop(&task.container_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &stop_result {
            error!(container_id = %task.container_id, error = %e, "Error stopping container");
        }

        task.finish_time = Some(Utc::now());
        task.state = State::Completed;
        self.persist(&task).await?;
        info!(
            task_id = %task.id,
            container_id = %task.container_id,
            "Stopped and removed container"
        );
        stop_result
    }

    /// The runtime's current view of the task's container.
    pub async fn inspect_task(&self, task: &Task) -> Result<ContainerInspectResponse> {
        if task.container_id.is_empty() {
            return Err(anyhow!("task {} has no container to inspect", task.id));
        }
        let runtime = DockerRuntime::new(TaskSpec::from_task(task))?;
        runtime.inspect(&task.container_id).await
    }

    /// Refresh the host snapshot and the task count.
    pub async fn collect_stats(&self) {
        let mut collected = stats::collect();
        let count = self.db.lock().await.count().unwrap_or(0);
        collected.task_count = count;
        self.task_count.store(count, Ordering::Relaxed);
        *self.stats.lock().await = collected;
    }

    /// One reconcile tick: compare every stored Running task against the
    /// runtime. A missing or exited container demotes the task to Failed;
    /// observed port bindings are recorded either way.
    pub async fn update_tasks(&self) {
        let tasks = match self.get_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Failed to list tasks for reconciliation");
                return;
            }
        };

        for mut task in tasks {
            if task.state != State::Running {
                continue;
            }

            match self.inspect_task(&task).await {
                Err(e) => {
                    // The runtime no longer knows the container.
                    warn!(task_id = %task.id, error = %e, "Container missing, marking task failed");
                    task.state = State::Failed;
                }
                Ok(snapshot) => {
                    if container_exited(&snapshot) {
                        info!(task_id = %task.id, "Container exited, marking task failed");
                        task.state = State::Failed;
                    }
                    task.host_ports =
                        port_map_from_runtime(snapshot.network_settings.and_then(|n| n.ports));
                }
            }

            if let Err(e) = self.persist(&task).await {
                error!(task_id = %task.id, error = %e, "Failed to persist reconciled task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::MemoryStore;

    fn test_worker() -> Worker {
        Worker::new("worker-test", Box::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_no_op() {
        let w = test_worker();
        let result = w.run_next_task().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_add_task_preserves_fifo_order() {
        let w = test_worker();
        let first = Task::new("a", "nginx", 0.1, 64);
        let second = Task::new("b", "nginx", 0.1, 64);
        w.add_task(first.clone()).await;
        w.add_task(second.clone()).await;

        let mut queue = w.queue.lock().await;
        assert_eq!(queue.pop_front().unwrap().id, first.id);
        assert_eq!(queue.pop_front().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_dropped() {
        let w = test_worker();

        // Persist a completed task, then ask the worker to schedule it again.
        let mut done = Task::new("done", "nginx", 0.1, 64);
        done.state = State::Completed;
        w.persist(&done).await.unwrap();

        let mut queued = done.clone();
        queued.state = State::Scheduled;
        w.add_task(queued).await;

        let err = w.run_next_task().await.unwrap_err();
        assert!(err.to_string().contains("invalid transition"));

        // The store still holds the terminal state.
        let stored = w.db.lock().await.get(&done.id.to_string()).unwrap();
        assert_eq!(stored.state, State::Completed);
    }

    #[tokio::test]
    async fn test_unexpected_queued_state_errors() {
        let w = test_worker();

        let mut scheduled = Task::new("t", "nginx", 0.1, 64);
        scheduled.state = State::Scheduled;
        w.persist(&scheduled).await.unwrap();

        // Running is a legal transition target but not a dispatchable
        // queued state.
        let mut queued = scheduled.clone();
        queued.state = State::Running;
        w.add_task(queued).await;

        let err = w.run_next_task().await.unwrap_err();
        assert!(err.to_string().contains("we should not get here"));
    }

    #[tokio::test]
    async fn test_unknown_task_is_inserted_as_authoritative() {
        let w = test_worker();

        // Completed -> Completed is not a legal self-transition, so the
        // queued copy is persisted and then dropped.
        let mut queued = Task::new("t", "nginx", 0.1, 64);
        queued.state = State::Completed;
        w.add_task(queued.clone()).await;

        let err = w.run_next_task().await.unwrap_err();
        assert!(err.to_string().contains("invalid transition"));
        assert_eq!(w.get_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_collect_stats_counts_store() {
        let w = test_worker();
        let t = Task::new("t", "nginx", 0.1, 64);
        w.persist(&t).await.unwrap();

        w.collect_stats().await;
        assert_eq!(w.task_count(), 1);

        let stats = w.stats().await;
        assert_eq!(stats.task_count, 1);
        assert!(stats.mem_stats.is_some());
        assert!(stats.disk_stats.is_some());
    }
}
