//! The manager's view of one worker node
//!
//! A `Node` caches what the manager last learned about a worker's capacity
//! and usage. It is refreshed from the worker's `/stats` endpoint and read by
//! the scheduler when placing tasks.

use anyhow::{anyhow, Result};
use tracing::{debug, warn};

use shared::api::endpoints;
use shared::utils::http_get_with_retry;
use shared::Stats;

#[derive(Debug, Clone, Default)]
pub struct Node {
    /// Logical name; for workers this is the reachable `host:port` address.
    pub name: String,
    /// Base URL of the node's API.
    pub api: String,
    pub cores: usize,
    /// Total memory in KiB.
    pub memory: u64,
    /// Memory in use in KiB.
    pub memory_allocated: u64,
    /// Total disk in bytes.
    pub disk: u64,
    /// Disk in use in bytes.
    pub disk_allocated: u64,
    /// Last stats snapshot pulled from the node.
    pub stats: Stats,
    pub role: String,
    /// Tasks the manager has placed on this node.
    pub task_count: u64,
}

impl Node {
    pub fn new(name: impl Into<String>, api: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api: api.into(),
            role: role.into(),
            ..Default::default()
        }
    }

    /// Fetch `/stats` from the node with bounded retry and fold the result
    /// into the cached totals. Payloads missing the memory or disk block are
    /// rejected.
    pub async fn get_stats(&mut self, client: &reqwest::Client) -> Result<&Stats> {
        let url = format!("{}{}", self.api, endpoints::STATS);

        let resp = http_get_with_retry(client, &url).await.map_err(|e| {
            warn!(node = %self.name, error = %e, "Unable to connect to node, permanent failure");
            anyhow!("unable to connect to {}: {}", self.api, e)
        })?;

        if resp.status().as_u16() != 200 {
            return Err(anyhow!(
                "error retrieving stats from {}: status {}",
                self.api,
                resp.status()
            ));
        }

        let stats: Stats = resp
            .json()
            .await
            .map_err(|e| anyhow!("error decoding stats for node {}: {}", self.name, e))?;

        if stats.mem_stats.is_none() || stats.disk_stats.is_none() {
            return Err(anyhow!("error getting stats from node {}", self.name));
        }

        self.memory = stats.mem_total_kb();
        self.memory_allocated = stats.mem_used_kb();
        self.disk = stats.disk_total();
        self.disk_allocated = stats.disk_used();
        self.cores = stats.cpu_cores();
        self.stats = stats;

        debug!(
            node = %self.name,
            memory_kb = self.memory,
            allocated_kb = self.memory_allocated,
            "Node stats refreshed"
        );
        Ok(&self.stats)
    }
}
