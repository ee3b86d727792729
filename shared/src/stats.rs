//! Host statistics reported by workers
//!
//! A worker refreshes this snapshot periodically and serves it on
//! `GET /stats`; the manager folds it into its node view before scheduling.
//! The memory and disk blocks are required: a stats payload missing either
//! is rejected by the consumer.

use serde::{Deserialize, Serialize};

/// Memory figures in KiB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemStats {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemStats {
    pub fn used_kb(&self) -> u64 {
        self.total_kb.saturating_sub(self.available_kb)
    }
}

/// Disk figures in bytes, summed across mounted filesystems.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub all: u64,
    pub used: u64,
    pub free: u64,
}

/// CPU figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub cores: usize,
    /// Aggregate usage across all cores, 0.0 to 100.0.
    pub usage_percent: f64,
}

/// One-, five-, and fifteen-minute load averages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadStats {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Full stats envelope served on `GET /stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(rename = "MemStats")]
    pub mem_stats: Option<MemStats>,
    #[serde(rename = "DiskStats")]
    pub disk_stats: Option<DiskStats>,
    #[serde(rename = "CPUStats")]
    pub cpu_stats: Option<CpuStats>,
    #[serde(rename = "LoadStats")]
    pub load_stats: Option<LoadStats>,
    #[serde(rename = "TaskCount")]
    pub task_count: usize,
}

impl Stats {
    pub fn mem_total_kb(&self) -> u64 {
        self.mem_stats.as_ref().map_or(0, |m| m.total_kb)
    }

    pub fn mem_used_kb(&self) -> u64 {
        self.mem_stats.as_ref().map_or(0, |m| m.used_kb())
    }

    pub fn disk_total(&self) -> u64 {
        self.disk_stats.as_ref().map_or(0, |d| d.all)
    }

    pub fn disk_used(&self) -> u64 {
        self.disk_stats.as_ref().map_or(0, |d| d.used)
    }

    pub fn cpu_cores(&self) -> usize {
        self.cpu_stats.as_ref().map_or(0, |c| c.cores)
    }

    /// Aggregate CPU usage as a fraction in [0, 1].
    pub fn cpu_usage_fraction(&self) -> f64 {
        self.cpu_stats
            .as_ref()
            .map_or(0.0, |c| (c.usage_percent / 100.0).clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_json_keys() {
        let stats = Stats {
            mem_stats: Some(MemStats {
                total_kb: 1024,
                available_kb: 512,
            }),
            disk_stats: Some(DiskStats::default()),
            cpu_stats: Some(CpuStats {
                cores: 4,
                usage_percent: 25.0,
            }),
            load_stats: Some(LoadStats::default()),
            task_count: 2,
        };

        let json = serde_json::to_string(&stats).unwrap();
        for key in ["MemStats", "DiskStats", "CPUStats", "LoadStats", "TaskCount"] {
            assert!(json.contains(key), "missing key {key} in {json}");
        }
    }

    #[test]
    fn test_mem_used_and_cpu_fraction() {
        let stats = Stats {
            mem_stats: Some(MemStats {
                total_kb: 1000,
                available_kb: 400,
            }),
            cpu_stats: Some(CpuStats {
                cores: 8,
                usage_percent: 50.0,
            }),
            ..Default::default()
        };
        assert_eq!(stats.mem_used_kb(), 600);
        assert_eq!(stats.cpu_usage_fraction(), 0.5);
    }

    #[test]
    fn test_missing_blocks_read_as_zero() {
        let stats = Stats::default();
        assert!(stats.mem_stats.is_none());
        assert_eq!(stats.mem_total_kb(), 0);
        assert_eq!(stats.cpu_usage_fraction(), 0.0);
    }
}
