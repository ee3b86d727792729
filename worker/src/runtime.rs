//! Docker runtime adapter
//!
//! Translates a [`TaskSpec`] into calls against the local Docker daemon:
//! pull, create, start, and log-attach on the way up; stop and remove on the
//! way down; inspect for reconciliation. The adapter is stateless across
//! calls: one instance per operation is fine.

use anyhow::{Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, HostConfig, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, error, info};

use shared::task::{PortBinding, PortMap, TaskSpec};

/// Maximum retry count handed to the daemon for "on-failure" tasks.
const MAX_RESTART_POLICY_RETRIES: i64 = 5;

/// Outcome of a runtime operation, reported back to the worker and (through
/// it) to the manager.
#[derive(Debug, Clone, Default)]
pub struct RuntimeResult {
    /// "start" or "stop".
    pub action: String,
    pub container_id: String,
    pub result: String,
}

/// Everything needed to drive one container through the Docker API.
pub struct DockerRuntime {
    client: Docker,
    spec: TaskSpec,
}

fn restart_policy_name(symbol: &str) -> RestartPolicyNameEnum {
    match symbol {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::EMPTY,
    }
}

/// Convert the daemon's port map into the wire model's.
pub fn port_map_from_runtime(ports: Option<bollard::models::PortMap>) -> PortMap {
    let mut out = PortMap::new();
    let Some(ports) = ports else {
        return out;
    };
    for (port, bindings) in ports {
        let bindings = bindings
            .unwrap_or_default()
            .into_iter()
            .map(|b| PortBinding {
                host_ip: b.host_ip.unwrap_or_default(),
                host_port: b.host_port.unwrap_or_default(),
            })
            .collect();
        out.insert(port, bindings);
    }
    out
}

/// True when the inspected container has exited.
pub fn container_exited(snapshot: &ContainerInspectResponse) -> bool {
    snapshot
        .state
        .as_ref()
        .and_then(|s| s.status)
        .map(|s| s == ContainerStateStatusEnum::EXITED)
        .unwrap_or(false)
}

impl DockerRuntime {
    /// Connect through the daemon's canonical local defaults (socket path or
    /// host URL from the standard environment).
    pub fn new(spec: TaskSpec) -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .context("Failed to create Docker client")?;
        Ok(Self { client, spec })
    }

    /// Pull, create, start, and attach to logs. Any failing step yields an
    /// error naming the step; the caller decides what to do with the task.
    pub async fn run(&self) -> Result<RuntimeResult> {
        info!(image = %self.spec.image, name = %self.spec.name, "Starting container");

        let mut pull = self.client.create_image(
            Some(CreateImageOptions {
                from_image: self.spec.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            let info = progress
                .with_context(|| format!("Failed to pull image {}", self.spec.image))?;
            if let Some(status) = info.status {
                debug!(image = %self.spec.image, status = %status, "Image pull progress");
            }
        }

        let maximum_retry_count = if self.spec.restart_policy == "on-failure" {
            MAX_RESTART_POLICY_RETRIES
        } else {
            0
        };
        let restart_policy = RestartPolicy {
            name: Some(restart_policy_name(&self.spec.restart_policy)),
            maximum_retry_count: Some(maximum_retry_count),
        };

        // Resource request translation: MiB to bytes, cores to nano-CPUs.
        let memory_bytes = (self.spec.memory as i64) << 20;
        let nano_cpus = (self.spec.cpu * 1e9) as i64;

        let exposed_ports: HashMap<String, HashMap<(), ()>> = self
            .spec
            .exposed_ports
            .iter()
            .map(|p| (p.clone(), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            restart_policy: Some(restart_policy),
            memory: Some(memory_bytes),
            nano_cpus: Some(nano_cpus),
            publish_all_ports: Some(true),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.spec.image.clone()),
            tty: Some(false),
            env: Some(self.spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            attach_stdin: Some(self.spec.attach_stdin),
            attach_stdout: Some(self.spec.attach_stdout),
            attach_stderr: Some(self.spec.attach_stderr),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: self.spec.name.clone(),
                    ..Default::default()
                }),
                container_config,
            )
            .await
            .with_context(|| {
                format!("Failed to create container using image {}", self.spec.image)
            })?;

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("Failed to start container {}", created.id))?;

        // Snapshot of the container's output so far, stdout and stderr with
        // timestamps; the daemon keeps streaming after we detach.
        let mut logs = self.client.logs(
            &created.id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                timestamps: true,
                ..Default::default()
            }),
        );
        while let Some(line) = logs.next().await {
            match line {
                Ok(output) => debug!(container_id = %created.id, "{}", output),
                Err(e) => {
                    error!(container_id = %created.id, error = %e, "Failed reading container logs");
                    break;
                }
            }
        }

        Ok(RuntimeResult {
            action: "start".to_string(),
            container_id: created.id,
            result: "success".to_string(),
        })
    }

    /// Stop, then remove with anonymous volumes; never forced.
    pub async fn stop(&self, container_id: &str) -> Result<RuntimeResult> {
        info!(container_id = %container_id, "Attempting to stop container");

        self.client
            .stop_container(container_id, None::<StopContainerOptions>)
            .await
            .with_context(|| format!("Failed to stop container {}", container_id))?;

        self.client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    v: true,
                    link: false,
                    force: false,
                }),
            )
            .await
            .with_context(|| format!("Failed to remove container {}", container_id))?;

        Ok(RuntimeResult {
            action: "stop".to_string(),
            container_id: container_id.to_string(),
            result: "success".to_string(),
        })
    }

    /// The daemon's current view of the container, including state and port
    /// mappings.
    pub async fn inspect(&self, container_id: &str) -> Result<ContainerInspectResponse> {
        self.client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("Failed to inspect container {}", container_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_mapping() {
        assert_eq!(restart_policy_name(""), RestartPolicyNameEnum::EMPTY);
        assert_eq!(restart_policy_name("no"), RestartPolicyNameEnum::NO);
        assert_eq!(restart_policy_name("always"), RestartPolicyNameEnum::ALWAYS);
        assert_eq!(
            restart_policy_name("unless-stopped"),
            RestartPolicyNameEnum::UNLESS_STOPPED
        );
        assert_eq!(
            restart_policy_name("on-failure"),
            RestartPolicyNameEnum::ON_FAILURE
        );
        assert_eq!(restart_policy_name("bogus"), RestartPolicyNameEnum::EMPTY);
    }

    #[test]
    fn test_port_map_conversion() {
        let mut ports = bollard::models::PortMap::new();
        ports.insert(
            "80/tcp".to_string(),
            Some(vec![bollard::models::PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("49153".to_string()),
            }]),
        );
        ports.insert("81/tcp".to_string(), None);

        let converted = port_map_from_runtime(Some(ports));
        assert_eq!(converted["80/tcp"][0].host_port, "49153");
        assert!(converted["81/tcp"].is_empty());
        assert!(port_map_from_runtime(None).is_empty());
    }

    #[test]
    fn test_container_exited() {
        let snapshot = ContainerInspectResponse {
            state: Some(bollard::models::ContainerState {
                status: Some(ContainerStateStatusEnum::EXITED),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(container_exited(&snapshot));

        let running = ContainerInspectResponse {
            state: Some(bollard::models::ContainerState {
                status: Some(ContainerStateStatusEnum::RUNNING),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!container_exited(&running));
        assert!(!container_exited(&ContainerInspectResponse::default()));
    }
}
