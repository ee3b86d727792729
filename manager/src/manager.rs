//! Manager core: dispatch, reconciliation, and health-driven restarts
//!
//! The manager accepts task events on a pending queue, schedules them onto
//! workers, mirrors worker state back into its own stores, and restarts
//! failed or unhealthy tasks within the restart budget. Three periodic loops
//! drive it (see `main.rs`): process, update, and health.

use anyhow::Result;
use reqwest::StatusCode;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared::api::{endpoints, ErrResponse};
use shared::task::{valid_transition, Event, State, Task};
use shared::{OrchestratorError, Store};

use crate::node::Node;
use crate::scheduler::Scheduler;

/// Automatic restarts stop once a task has been restarted this many times.
pub const MAX_RESTARTS: u32 = 3;

pub struct Manager {
    /// Events awaiting dispatch, drained one per process-loop tick.
    pending: Mutex<VecDeque<Event>>,
    /// Latest snapshot per task id.
    task_db: Mutex<Box<dyn Store<Task>>>,
    /// Append-only history of everything that was submitted.
    event_db: Mutex<Box<dyn Store<Event>>>,
    /// Worker addresses in `host:port` form.
    workers: Vec<String>,
    /// Tasks placed per worker.
    worker_task_map: Mutex<HashMap<String, Vec<Uuid>>>,
    /// Owning worker per task; populated once a task leaves Pending.
    task_worker_map: Mutex<HashMap<Uuid, String>>,
    /// Cached capacity/usage view per worker.
    nodes: Mutex<Vec<Node>>,
    scheduler: Mutex<Box<dyn Scheduler>>,
    client: reqwest::Client,
}

impl Manager {
    pub fn new(
        workers: Vec<String>,
        scheduler: Box<dyn Scheduler>,
        task_store: Box<dyn Store<Task>>,
        event_store: Box<dyn Store<Event>>,
    ) -> Result<Self> {
        let mut worker_task_map = HashMap::new();
        let mut nodes = Vec::new();
        for worker in &workers {
            worker_task_map.insert(worker.clone(), Vec::new());
            nodes.push(Node::new(
                worker.clone(),
                format!("http://{}", worker),
                "worker",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            pending: Mutex::new(VecDeque::new()),
            task_db: Mutex::new(task_store),
            event_db: Mutex::new(event_store),
            workers,
            worker_task_map: Mutex::new(worker_task_map),
            task_worker_map: Mutex::new(HashMap::new()),
            nodes: Mutex::new(nodes),
            scheduler: Mutex::new(scheduler),
            client,
        })
    }

    /// Enqueue an event at the tail of the pending queue.
    pub async fn add_task(&self, event: Event) {
        debug!(event_id = %event.id, task_id = %event.task.id, "Event queued");
        self.pending.lock().await.push_back(event);
    }

    /// Current task store contents: the manager's view of the cluster.
    pub async fn get_tasks(&self) -> Result<Vec<Task>> {
        self.task_db.lock().await.list()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Run the scheduling pipeline for one task: candidates, scores, pick.
    pub async fn select_worker(&self, task: &Task) -> Result<Node> {
        let nodes = self.nodes.lock().await.clone();
        let mut scheduler = self.scheduler.lock().await;

        let candidates = scheduler.select_candidate_nodes(task, &nodes);
        if candidates.is_empty() {
            return Err(OrchestratorError::NoCandidates(task.id).into());
        }

        let scores = scheduler.score(task, &candidates);
        scheduler
            .pick(&scores, &candidates)
            .ok_or_else(|| OrchestratorError::NoCandidates(task.id).into())
    }

    /// One process-loop tick: dequeue an event and act on it.
    pub async fn send_work(&self) {
        let event = self.pending.lock().await.pop_front();
        let Some(mut event) = event else {
            debug!("No work in the queue");
            return;
        };

        info!(
            event_id = %event.id,
            task_id = %event.task.id,
            desired_state = ?event.state,
            "Pulled event off pending queue"
        );

        // The event store keeps the full submission history. A failed write
        // is logged and dispatch proceeds; the task store stays correct.
        if let Err(e) = self
            .event_db
            .lock()
            .await
            .put(&event.id.to_string(), &event)
        {
            error!(event_id = %event.id, error = %e, "Failed to persist event");
        }

        let task_id = event.task.id;
        let assigned = self.task_worker_map.lock().await.get(&task_id).cloned();

        if let Some(worker) = assigned {
            self.handle_existing_task(&worker, event).await;
            return;
        }

        // New placement. The only sensible request for an unscheduled task
        // is to run it.
        if event.state != State::Running || !valid_transition(event.task.state, State::Scheduled) {
            warn!(
                task_id = %task_id,
                "invalid transition from {:?} to {:?}",
                event.task.state,
                event.state
            );
            return;
        }

        let node = match self.select_worker(&event.task).await {
            Ok(node) => node,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to select worker for task");
                return;
            }
        };
        let worker = node.name.clone();

        self.assign(task_id, &worker).await;
        event.task.state = State::Scheduled;
        if let Err(e) = self
            .task_db
            .lock()
            .await
            .put(&task_id.to_string(), &event.task)
        {
            error!(task_id = %task_id, error = %e, "Failed to persist scheduled task");
        }

        match self.post_event(&worker, &event).await {
            Err(e) => {
                // Transport failure: undo the placement and retry later.
                error!(worker = %worker, error = %e, "Error connecting to worker, requeueing task");
                self.unassign(task_id, &worker).await;
                self.pending.lock().await.push_back(event);
            }
            Ok(None) => {
                // Worker-side application error, already logged; not retried.
            }
            Ok(Some(task)) => {
                self.increment_node_task_count(&worker).await;
                info!(task_id = %task.id, worker = %worker, "Task scheduled on worker");
            }
        }
    }

    /// An event for a task that already has an owning worker.
    async fn handle_existing_task(&self, worker: &str, event: Event) {
        let task_id = event.task.id;
        let persisted = match self.task_db.lock().await.get(&task_id.to_string()) {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Assigned task missing from store");
                return;
            }
        };

        match event.state {
            // A stop request, checked against the persisted state.
            State::Completed if valid_transition(persisted.state, State::Completed) => {
                self.stop_task(worker, &task_id.to_string()).await;
            }
            // A restart that bounced off a dead worker earlier and was
            // requeued; the task is already marked Scheduled, so deliver it.
            State::Running if persisted.state == State::Scheduled => {
                match self.post_event(worker, &event).await {
                    Err(e) => {
                        error!(worker = %worker, error = %e, "Error connecting to worker, requeueing task");
                        self.pending.lock().await.push_back(event);
                    }
                    Ok(None) => {}
                    Ok(Some(task)) => {
                        info!(task_id = %task.id, worker = %worker, "Task redelivered to worker");
                    }
                }
            }
            _ => {
                warn!(
                    task_id = %task_id,
                    "invalid transition from {:?} to {:?}",
                    persisted.state,
                    event.state
                );
            }
        }
    }

    /// POST an event to a worker's `/tasks`.
    ///
    /// `Err` means transport failure (the caller decides whether to requeue);
    /// `Ok(None)` means the worker rejected the event with an application
    /// error, which is logged and never retried.
    async fn post_event(&self, worker: &str, event: &Event) -> Result<Option<Task>> {
        let url = format!("http://{}{}", worker, endpoints::TASKS);
        let resp = self.client.post(&url).json(event).send().await?;

        if resp.status() != StatusCode::CREATED {
            match resp.json::<ErrResponse>().await {
                Ok(body) => error!(
                    worker = %worker,
                    code = body.http_status_code,
                    message = %body.message,
                    "Worker rejected task event"
                ),
                Err(e) => error!(worker = %worker, error = %e, "Error decoding error response"),
            }
            return Ok(None);
        }

        match resp.json::<Task>().await {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                error!(worker = %worker, error = %e, "Error decoding task response");
                Ok(None)
            }
        }
    }

    async fn assign(&self, task_id: Uuid, worker: &str) {
        self.worker_task_map
            .lock()
            .await
            .entry(worker.to_string())
            .or_default()
            .push(task_id);
        self.task_worker_map
            .lock()
            .await
            .insert(task_id, worker.to_string());
    }

    async fn unassign(&self, task_id: Uuid, worker: &str) {
        if let Some(tasks) = self.worker_task_map.lock().await.get_mut(worker) {
            tasks.retain(|id| *id != task_id);
        }
        self.task_worker_map.lock().await.remove(&task_id);
    }

    async fn increment_node_task_count(&self, worker: &str) {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.iter_mut().find(|n| n.name == worker) {
            node.task_count += 1;
        }
    }

    /// Refresh every node view from its worker's `/stats`.
    pub async fn update_nodes(&self) {
        let mut nodes = self.nodes.lock().await;
        for node in nodes.iter_mut() {
            if let Err(e) = node.get_stats(&self.client).await {
                error!(node = %node.name, error = %e, "Failed to refresh node stats");
            }
        }
    }

    /// One update-loop tick: pull every worker's task list and fold the
    /// observed runtime state into the local store. Tasks the manager never
    /// scheduled are logged and skipped.
    pub async fn update_tasks(&self) {
        for worker in &self.workers {
            debug!(worker = %worker, "Checking worker for task updates");
            let url = format!("http://{}{}", worker, endpoints::TASKS);

            let resp = match self.client.get(&url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    error!(worker = %worker, error = %e, "Error connecting to worker");
                    continue;
                }
            };
            if !resp.status().is_success() {
                error!(worker = %worker, status = %resp.status(), "Error requesting tasks");
                continue;
            }
            let tasks: Vec<Task> = match resp.json().await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(worker = %worker, error = %e, "Error unmarshalling tasks");
                    continue;
                }
            };

            for task in tasks {
                debug!(task_id = %task.id, "Attempting to update task");

                let mut db = self.task_db.lock().await;
                let mut local = match db.get(&task.id.to_string()) {
                    Ok(local) => local,
                    Err(_) => {
                        warn!(task_id = %task.id, "Task not found locally, skipping");
                        continue;
                    }
                };

                if local.state != task.state {
                    local.state = task.state;
                }
                local.start_time = task.start_time;
                local.finish_time = task.finish_time;
                local.container_id = task.container_id.clone();
                local.host_ports = task.host_ports.clone();

                if let Err(e) = db.put(&local.id.to_string(), &local) {
                    error!(task_id = %local.id, error = %e, "Failed to persist task update");
                }
            }
        }
    }

    /// One health-loop tick: probe running tasks and restart what failed,
    /// within the restart budget.
    pub async fn do_health_checks(&self) {
        let tasks = match self.get_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Failed to list tasks for health checks");
                return;
            }
        };

        for task in tasks {
            if task.state == State::Running && task.restart_count < MAX_RESTARTS {
                if let Err(e) = self.check_task_health(&task).await {
                    warn!(task_id = %task.id, error = %e, "Health check failed");
                    self.restart_task(task).await;
                }
            } else if task.state == State::Failed && task.restart_count < MAX_RESTARTS {
                self.restart_task(task).await;
            }
        }
    }

    /// Probe the task's health endpoint through its first observed host port.
    /// Tasks with no collected port yet are skipped without error.
    pub async fn check_task_health(&self, task: &Task) -> Result<()> {
        if task.health_check.is_empty() {
            debug!(task_id = %task.id, "Task has no health check path, skipping");
            return Ok(());
        }

        let worker = self
            .task_worker_map
            .lock()
            .await
            .get(&task.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no worker assigned to task {}", task.id))?;

        let Some(host_port) = first_host_port(&task.host_ports) else {
            info!(task_id = %task.id, "Have not collected task host port yet, skipping");
            return Ok(());
        };

        let host = worker.split(':').next().unwrap_or(worker.as_str());
        let url = format!("http://{}:{}{}", host, host_port, task.health_check);
        debug!(task_id = %task.id, url = %url, "Calling health check");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("error connecting to health check {}: {}", url, e))?;

        if resp.status().as_u16() != 200 {
            anyhow::bail!(
                "health check for task {} did not return 200 (got {})",
                task.id,
                resp.status()
            );
        }

        debug!(task_id = %task.id, status = %resp.status(), "Health check passed");
        Ok(())
    }

    /// Re-dispatch a task to its worker, consuming one unit of the restart
    /// budget.
    pub async fn restart_task(&self, mut task: Task) {
        let worker = match self.task_worker_map.lock().await.get(&task.id).cloned() {
            Some(worker) => worker,
            None => {
                error!(task_id = %task.id, "Cannot restart task with no assigned worker");
                return;
            }
        };

        task.state = State::Scheduled;
        task.restart_count += 1;
        if let Err(e) = self
            .task_db
            .lock()
            .await
            .put(&task.id.to_string(), &task)
        {
            error!(task_id = %task.id, error = %e, "Failed to persist restarted task");
        }

        let event = Event::new(State::Running, task.clone());
        if let Err(e) = self
            .event_db
            .lock()
            .await
            .put(&event.id.to_string(), &event)
        {
            error!(event_id = %event.id, error = %e, "Failed to persist restart event");
        }

        match self.post_event(&worker, &event).await {
            Err(e) => {
                error!(worker = %worker, error = %e, "Error connecting to worker, requeueing task");
                self.pending.lock().await.push_back(event);
            }
            Ok(None) => {}
            Ok(Some(task)) => {
                info!(
                    task_id = %task.id,
                    worker = %worker,
                    restart_count = task.restart_count,
                    "Task restarted on worker"
                );
            }
        }
    }

    /// Ask a worker to stop a task. A failed stop is logged, not retried;
    /// the health loop will observe the task and act if appropriate.
    pub async fn stop_task(&self, worker: &str, task_id: &str) {
        let url = format!("http://{}{}/{}", worker, endpoints::TASKS, task_id);
        match self.client.delete(&url).send().await {
            Err(e) => {
                error!(worker = %worker, task_id = %task_id, error = %e, "Error connecting to worker");
            }
            Ok(resp) if resp.status() != StatusCode::NO_CONTENT => {
                error!(
                    worker = %worker,
                    task_id = %task_id,
                    status = %resp.status(),
                    "Error sending stop request"
                );
            }
            Ok(_) => {
                info!(task_id = %task_id, worker = %worker, "Task has been scheduled for stopping");
            }
        }
    }
}

/// First host port over the unordered port map; keys are sorted so the
/// choice is deterministic.
fn first_host_port(ports: &shared::task::PortMap) -> Option<String> {
    let mut keys: Vec<_> = ports.keys().collect();
    keys.sort();
    for key in keys {
        if let Some(binding) = ports[key].first() {
            return Some(binding.host_port.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler;
    use shared::task::PortBinding;
    use shared::MemoryStore;

    fn test_manager(workers: Vec<String>, scheduler_name: &str) -> Manager {
        Manager::new(
            workers,
            scheduler::from_name(scheduler_name).unwrap(),
            Box::new(MemoryStore::new()),
            Box::new(MemoryStore::new()),
        )
        .unwrap()
    }

    fn seed_node(manager: &Manager, name: &str, total_mib: u64, allocated_mib: u64) {
        let mut nodes = manager.nodes.try_lock().unwrap();
        let node = nodes.iter_mut().find(|n| n.name == name).unwrap();
        node.memory = total_mib * 1024;
        node.memory_allocated = allocated_mib * 1024;
        node.cores = 4;
    }

    #[tokio::test]
    async fn test_add_task_enqueues_event() {
        let m = test_manager(vec!["127.0.0.1:1".to_string()], "roundrobin");
        let event = Event::new(State::Running, Task::new("t", "nginx", 0.1, 64));
        m.add_task(event).await;
        assert_eq!(m.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_select_worker_epvm_picks_the_only_fit() {
        let m = test_manager(
            vec!["a:5555".to_string(), "b:5555".to_string()],
            "epvm",
        );
        seed_node(&m, "a:5555", 1024, 900);
        seed_node(&m, "b:5555", 1024, 100);

        let task = Task::new("t", "nginx", 0.1, 200);
        let node = m.select_worker(&task).await.unwrap();
        assert_eq!(node.name, "b:5555");
    }

    #[tokio::test]
    async fn test_select_worker_reports_no_candidates() {
        let m = test_manager(vec!["a:5555".to_string()], "epvm");
        seed_node(&m, "a:5555", 1024, 1000);

        let task = Task::new("t", "nginx", 0.1, 512);
        let err = m.select_worker(&task).await.unwrap_err();
        assert!(err.to_string().contains("no candidate nodes"));
    }

    #[tokio::test]
    async fn test_send_work_rejects_completed_target_for_pending_task() {
        let m = test_manager(vec!["127.0.0.1:1".to_string()], "roundrobin");
        let task = Task::new("t", "nginx", 0.1, 64);
        let event = Event::new(State::Completed, task.clone());
        m.add_task(event).await;

        m.send_work().await;

        // Rejected: nothing queued, nothing scheduled, no mapping.
        assert_eq!(m.pending_len().await, 0);
        assert!(m.get_tasks().await.unwrap().is_empty());
        assert!(m.task_worker_map.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_work_requeues_on_transport_failure() {
        // Nothing listens on port 1, so dispatch hits a connection error.
        let m = test_manager(vec!["127.0.0.1:1".to_string()], "roundrobin");
        let task = Task::new("t", "nginx", 0.1, 64);
        let task_id = task.id;
        m.add_task(Event::new(State::Running, task)).await;

        m.send_work().await;

        // The event went back on the queue and the placement was undone, so
        // the next tick can try a fresh dispatch.
        assert_eq!(m.pending_len().await, 1);
        assert!(m.task_worker_map.lock().await.get(&task_id).is_none());

        // The scheduled snapshot is persisted and the event recorded.
        let stored = m.task_db.lock().await.get(&task_id.to_string()).unwrap();
        assert_eq!(stored.state, State::Scheduled);
        assert_eq!(m.event_db.lock().await.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_existing_task_invalid_target_is_dropped() {
        let m = test_manager(vec!["127.0.0.1:1".to_string()], "roundrobin");

        let mut task = Task::new("t", "nginx", 0.1, 64);
        task.state = State::Running;
        m.task_db
            .lock()
            .await
            .put(&task.id.to_string(), &task)
            .unwrap();
        m.assign(task.id, "127.0.0.1:1").await;

        // Asking a running task to become Scheduled is not honored.
        let mut snapshot = task.clone();
        snapshot.state = State::Running;
        m.add_task(Event::new(State::Scheduled, snapshot)).await;
        m.send_work().await;

        let stored = m.task_db.lock().await.get(&task.id.to_string()).unwrap();
        assert_eq!(stored.state, State::Running);
        assert_eq!(m.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_restart_task_increments_count_and_requeues() {
        let m = test_manager(vec!["127.0.0.1:1".to_string()], "roundrobin");

        let mut task = Task::new("t", "nginx", 0.1, 64);
        task.state = State::Failed;
        m.task_db
            .lock()
            .await
            .put(&task.id.to_string(), &task)
            .unwrap();
        m.assign(task.id, "127.0.0.1:1").await;

        m.restart_task(task.clone()).await;

        let stored = m.task_db.lock().await.get(&task.id.to_string()).unwrap();
        assert_eq!(stored.state, State::Scheduled);
        assert_eq!(stored.restart_count, 1);
        // The POST hit a dead worker, so the restart event is pending again.
        assert_eq!(m.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_health_loop_respects_restart_budget() {
        let m = test_manager(vec!["127.0.0.1:1".to_string()], "roundrobin");

        let mut task = Task::new("t", "nginx", 0.1, 64);
        task.state = State::Failed;
        task.restart_count = MAX_RESTARTS;
        m.task_db
            .lock()
            .await
            .put(&task.id.to_string(), &task)
            .unwrap();
        m.assign(task.id, "127.0.0.1:1").await;

        m.do_health_checks().await;

        // Budget exhausted: no restart issued, state unchanged.
        let stored = m.task_db.lock().await.get(&task.id.to_string()).unwrap();
        assert_eq!(stored.state, State::Failed);
        assert_eq!(stored.restart_count, MAX_RESTARTS);
        assert_eq!(m.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_health_loop_restarts_failed_task_within_budget() {
        let m = test_manager(vec!["127.0.0.1:1".to_string()], "roundrobin");

        let mut task = Task::new("t", "nginx", 0.1, 64);
        task.state = State::Failed;
        task.restart_count = 2;
        m.task_db
            .lock()
            .await
            .put(&task.id.to_string(), &task)
            .unwrap();
        m.assign(task.id, "127.0.0.1:1").await;

        m.do_health_checks().await;

        let stored = m.task_db.lock().await.get(&task.id.to_string()).unwrap();
        assert_eq!(stored.state, State::Scheduled);
        assert_eq!(stored.restart_count, 3);
    }

    #[tokio::test]
    async fn test_check_task_health_skips_until_ports_collected() {
        let m = test_manager(vec!["127.0.0.1:1".to_string()], "roundrobin");

        let mut task = Task::new("t", "nginx", 0.1, 64);
        task.state = State::Running;
        task.health_check = "/health".to_string();
        m.assign(task.id, "127.0.0.1:1").await;

        // No host ports observed yet: not a failure.
        assert!(m.check_task_health(&task).await.is_ok());
    }

    #[tokio::test]
    async fn test_bookkeeping_bijection() {
        let m = test_manager(vec!["a:5555".to_string()], "roundrobin");
        let task_id = Uuid::new_v4();

        m.assign(task_id, "a:5555").await;
        assert_eq!(
            m.task_worker_map.lock().await.get(&task_id).unwrap(),
            "a:5555"
        );
        assert!(m
            .worker_task_map
            .lock()
            .await
            .get("a:5555")
            .unwrap()
            .contains(&task_id));

        m.unassign(task_id, "a:5555").await;
        assert!(m.task_worker_map.lock().await.get(&task_id).is_none());
        assert!(!m
            .worker_task_map
            .lock()
            .await
            .get("a:5555")
            .unwrap()
            .contains(&task_id));
    }

    #[test]
    fn test_first_host_port_is_deterministic() {
        let mut ports = shared::task::PortMap::new();
        ports.insert(
            "9090/tcp".to_string(),
            vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: "49154".to_string(),
            }],
        );
        ports.insert(
            "80/tcp".to_string(),
            vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: "49153".to_string(),
            }],
        );

        // Sorted key order, so "80/tcp" always wins.
        assert_eq!(first_host_port(&ports).unwrap(), "49153");
        assert!(first_host_port(&shared::task::PortMap::new()).is_none());
    }
}
