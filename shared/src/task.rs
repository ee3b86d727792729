//! Task model, event envelope, and the task state machine
//!
//! A `Task` is the unit of work: a declarative request to run one container
//! plus the state observed for it at runtime. An `Event` wraps a task together
//! with a desired state and is what clients submit and the manager dispatches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// The starting point for every task.
    Pending,
    /// The manager has placed the task onto a worker.
    Scheduled,
    /// The worker has started the container.
    Running,
    /// The task finished its work normally.
    Completed,
    /// The task failed at runtime or its container disappeared.
    Failed,
}

/// One observed host-side binding for a container port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// Container port ("80/tcp") to host bindings, as reported by the runtime.
pub type PortMap = HashMap<String, Vec<PortBinding>>;

/// The unit of work: one container plus its observed runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub state: State,
    pub image: String,
    /// Requested CPU cores, fractional.
    pub cpu: f64,
    /// Requested memory in MiB.
    pub memory: u64,
    /// Requested disk in GiB.
    pub disk: u64,
    /// Container ports to expose, in "port/proto" form.
    #[serde(default)]
    pub exposed_ports: Vec<String>,
    /// Host-side bindings observed through the runtime; empty until the
    /// worker's reconciliation pass records them.
    #[serde(default)]
    pub host_ports: PortMap,
    /// One of "", "no", "always", "unless-stopped", "on-failure".
    #[serde(default)]
    pub restart_policy: String,
    /// Runtime container identifier; empty until the container is started.
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
    /// URL path probed over HTTP against the task's host port.
    #[serde(default)]
    pub health_check: String,
    /// Automatic restarts issued so far; capped at 3.
    #[serde(default)]
    pub restart_count: u32,
}

impl Task {
    /// A new task starts out Pending with no runtime state attached.
    pub fn new(name: impl Into<String>, image: impl Into<String>, cpu: f64, memory: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state: State::Pending,
            image: image.into(),
            cpu,
            memory,
            disk: 1,
            exposed_ports: Vec::new(),
            host_ports: PortMap::new(),
            restart_policy: String::new(),
            container_id: String::new(),
            start_time: None,
            finish_time: None,
            health_check: String::new(),
            restart_count: 0,
        }
    }
}

/// The envelope that requests a state transition for a task.
///
/// Events are append-only: the event store keeps the full history that drove
/// a task to its current state, while the task store holds only the latest
/// snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// The desired target state.
    pub state: State,
    pub timestamp: DateTime<Utc>,
    /// Snapshot of the task at submission time.
    pub task: Task,
}

impl Event {
    pub fn new(state: State, task: Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            state,
            timestamp: Utc::now(),
            task,
        }
    }
}

/// Everything the runtime adapter needs to launch one container.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub name: String,
    pub image: String,
    pub cpu: f64,
    /// Memory in MiB.
    pub memory: u64,
    /// Disk in GiB.
    pub disk: u64,
    pub env: Vec<String>,
    pub exposed_ports: Vec<String>,
    pub restart_policy: String,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

impl TaskSpec {
    pub fn from_task(t: &Task) -> Self {
        Self {
            name: t.name.clone(),
            image: t.image.clone(),
            cpu: t.cpu,
            memory: t.memory,
            disk: t.disk,
            env: Vec::new(),
            exposed_ports: t.exposed_ports.clone(),
            restart_policy: t.restart_policy.clone(),
            attach_stdin: false,
            attach_stdout: true,
            attach_stderr: true,
        }
    }
}

/// Legal transitions of the task state machine.
///
/// Scheduled and Running may re-enter themselves (a task can be re-dispatched
/// or re-observed without changing state). The re-entries into Scheduled from
/// Running and Failed carry the manager's restart path; they are only taken
/// while the restart budget allows it. Completed is terminal.
pub fn valid_transition(from: State, to: State) -> bool {
    match from {
        State::Pending => matches!(to, State::Scheduled),
        State::Scheduled => matches!(to, State::Scheduled | State::Running | State::Failed),
        State::Running => matches!(
            to,
            State::Running | State::Completed | State::Failed | State::Scheduled
        ),
        State::Completed => false,
        State::Failed => matches!(to, State::Scheduled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_pending() {
        let t = Task::new("web", "nginx:latest", 0.5, 256);
        assert_eq!(t.state, State::Pending);
        assert!(t.container_id.is_empty());
        assert!(t.start_time.is_none());
        assert_eq!(t.restart_count, 0);
    }

    #[test]
    fn test_transition_graph() {
        assert!(valid_transition(State::Pending, State::Scheduled));
        assert!(valid_transition(State::Scheduled, State::Scheduled));
        assert!(valid_transition(State::Scheduled, State::Running));
        assert!(valid_transition(State::Scheduled, State::Failed));
        assert!(valid_transition(State::Running, State::Running));
        assert!(valid_transition(State::Running, State::Completed));
        assert!(valid_transition(State::Running, State::Failed));

        // Restart path re-entries.
        assert!(valid_transition(State::Failed, State::Scheduled));
        assert!(valid_transition(State::Running, State::Scheduled));

        // Completed is terminal; Pending cannot jump ahead.
        assert!(!valid_transition(State::Pending, State::Running));
        assert!(!valid_transition(State::Pending, State::Completed));
        assert!(!valid_transition(State::Completed, State::Scheduled));
        assert!(!valid_transition(State::Completed, State::Running));
        assert!(!valid_transition(State::Failed, State::Running));
    }

    #[test]
    fn test_spec_from_task_copies_request() {
        let mut t = Task::new("web", "nginx:latest", 1.5, 512);
        t.exposed_ports = vec!["80/tcp".to_string()];
        t.restart_policy = "on-failure".to_string();

        let spec = TaskSpec::from_task(&t);
        assert_eq!(spec.image, "nginx:latest");
        assert_eq!(spec.cpu, 1.5);
        assert_eq!(spec.memory, 512);
        assert_eq!(spec.exposed_ports, vec!["80/tcp".to_string()]);
        assert_eq!(spec.restart_policy, "on-failure");
        assert!(spec.attach_stdout && spec.attach_stderr && !spec.attach_stdin);
    }

    #[test]
    fn test_task_json_round_trip() {
        let mut t = Task::new("web", "nginx:latest", 0.25, 64);
        t.state = State::Running;
        t.container_id = "abc123".to_string();
        t.start_time = Some(Utc::now());
        t.host_ports.insert(
            "80/tcp".to_string(),
            vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: "49153".to_string(),
            }],
        );

        let json = serde_json::to_string(&t).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_event_json_round_trip() {
        let e = Event::new(State::Running, Task::new("web", "nginx", 0.1, 64));
        let json = serde_json::to_string(&e).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
