//! Scheduling policies
//!
//! A scheduler filters candidate nodes for a task, scores them (lower is
//! better), and picks the best. Two policies are provided: a naive
//! round-robin and an E-PVM cost function that spreads load away from
//! saturated nodes.

use std::collections::HashMap;
use tracing::debug;

use shared::task::Task;

use crate::node::Node;

/// Convex barrier exponents per resource.
const EPVM_MEM_ALPHA: f64 = 1.0;
const EPVM_CPU_ALPHA: f64 = 2.0;

pub trait Scheduler: Send {
    fn name(&self) -> &str;
    /// Nodes able to take the task's resource request.
    fn select_candidate_nodes(&self, task: &Task, nodes: &[Node]) -> Vec<Node>;
    /// Score each candidate; lower is better.
    fn score(&mut self, task: &Task, nodes: &[Node]) -> HashMap<String, f64>;
    /// The candidate with the lowest score; ties go to the first occurrence.
    fn pick(&self, scores: &HashMap<String, f64>, candidates: &[Node]) -> Option<Node>;
}

/// Build the scheduler named in configuration.
pub fn from_name(name: &str) -> anyhow::Result<Box<dyn Scheduler>> {
    match name {
        "roundrobin" | "round-robin" => Ok(Box::new(RoundRobin::new())),
        "epvm" => Ok(Box::new(Epvm::new())),
        other => anyhow::bail!("unknown scheduler '{}' (expected 'roundrobin' or 'epvm')", other),
    }
}

/// Rotates through the nodes in order, one advance per `score` call.
pub struct RoundRobin {
    name: String,
    last_worker: isize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            name: "roundrobin".to_string(),
            last_worker: -1,
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for RoundRobin {
    fn name(&self) -> &str {
        &self.name
    }

    fn select_candidate_nodes(&self, _task: &Task, nodes: &[Node]) -> Vec<Node> {
        nodes.to_vec()
    }

    fn score(&mut self, _task: &Task, nodes: &[Node]) -> HashMap<String, f64> {
        let mut scores = HashMap::new();
        if nodes.is_empty() {
            return scores;
        }

        let next = if self.last_worker + 1 < nodes.len() as isize {
            self.last_worker + 1
        } else {
            0
        };
        self.last_worker = next;

        for (idx, node) in nodes.iter().enumerate() {
            let score = if idx as isize == next { 0.1 } else { 1.0 };
            scores.insert(node.name.clone(), score);
        }
        scores
    }

    fn pick(&self, scores: &HashMap<String, f64>, candidates: &[Node]) -> Option<Node> {
        pick_lowest(scores, candidates)
    }
}

/// Enhanced Parallel Virtual Machine cost scheduler.
///
/// Each candidate is scored with the sum over {cpu, memory} of the marginal
/// cost `f(util_after) - f(util_before)` where
/// `f(u) = e^(alpha*u) + e^(alpha*(1-u))`. The barrier grows steeply as a
/// node approaches saturation, so lightly loaded nodes win.
pub struct Epvm {
    name: String,
}

impl Epvm {
    pub fn new() -> Self {
        Self {
            name: "epvm".to_string(),
        }
    }

    /// Whether the node's memory can take the task after placement.
    fn fits(task: &Task, node: &Node) -> bool {
        let requested_kb = task.memory * 1024;
        node.memory_allocated.saturating_add(requested_kb) <= node.memory
    }
}

impl Default for Epvm {
    fn default() -> Self {
        Self::new()
    }
}

fn barrier(utilization: f64, alpha: f64) -> f64 {
    (alpha * utilization).exp() + (alpha * (1.0 - utilization)).exp()
}

impl Scheduler for Epvm {
    fn name(&self) -> &str {
        &self.name
    }

    fn select_candidate_nodes(&self, task: &Task, nodes: &[Node]) -> Vec<Node> {
        nodes
            .iter()
            .filter(|node| Self::fits(task, node))
            .cloned()
            .collect()
    }

    fn score(&mut self, task: &Task, nodes: &[Node]) -> HashMap<String, f64> {
        let mut scores = HashMap::new();

        for node in nodes {
            if !Self::fits(task, node) {
                debug!(node = %node.name, "Node cannot accommodate task, not scoring");
                continue;
            }

            let total_kb = node.memory.max(1) as f64;
            let requested_kb = (task.memory * 1024) as f64;
            let mem_before = node.memory_allocated as f64 / total_kb;
            let mem_after = (node.memory_allocated as f64 + requested_kb) / total_kb;
            let mem_cost =
                barrier(mem_after, EPVM_MEM_ALPHA) - barrier(mem_before, EPVM_MEM_ALPHA);

            let cores = node.cores.max(1) as f64;
            let cpu_before = node.stats.cpu_usage_fraction();
            let cpu_after = cpu_before + task.cpu / cores;
            let cpu_cost =
                barrier(cpu_after, EPVM_CPU_ALPHA) - barrier(cpu_before, EPVM_CPU_ALPHA);

            scores.insert(node.name.clone(), mem_cost + cpu_cost);
        }
        scores
    }

    fn pick(&self, scores: &HashMap<String, f64>, candidates: &[Node]) -> Option<Node> {
        pick_lowest(scores, candidates)
    }
}

/// Lowest score wins; a strict comparison keeps the first occurrence on ties.
fn pick_lowest(scores: &HashMap<String, f64>, candidates: &[Node]) -> Option<Node> {
    let mut best: Option<(&Node, f64)> = None;
    for node in candidates {
        let Some(&score) = scores.get(&node.name) else {
            continue;
        };
        match best {
            Some((_, lowest)) if score >= lowest => {}
            _ => best = Some((node, score)),
        }
    }
    best.map(|(node, _)| node.clone())
}
