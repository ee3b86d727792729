//! Host statistics collection
//!
//! Fills the shared [`Stats`] envelope from the local machine. Memory is
//! reported in KiB and disk in bytes, matching what the manager's node view
//! expects.

use shared::stats::{CpuStats, DiskStats, LoadStats, MemStats, Stats};
use sysinfo::{Disks, System};

/// Take a fresh snapshot of the host. TaskCount is filled in by the caller.
pub fn collect() -> Stats {
    let mut sys = System::new_all();
    sys.refresh_all();

    let mem_stats = MemStats {
        total_kb: sys.total_memory() / 1024,
        available_kb: sys.available_memory() / 1024,
    };

    let disks = Disks::new_with_refreshed_list();
    let mut all = 0u64;
    let mut free = 0u64;
    for disk in disks.list() {
        all = all.saturating_add(disk.total_space());
        free = free.saturating_add(disk.available_space());
    }
    let disk_stats = DiskStats {
        all,
        free,
        used: all.saturating_sub(free),
    };

    let cpu_stats = CpuStats {
        cores: sys.cpus().len(),
        usage_percent: sys.global_cpu_usage() as f64,
    };

    let load = System::load_average();
    let load_stats = LoadStats {
        one: load.one,
        five: load.five,
        fifteen: load.fifteen,
    };

    Stats {
        mem_stats: Some(mem_stats),
        disk_stats: Some(disk_stats),
        cpu_stats: Some(cpu_stats),
        load_stats: Some(load_stats),
        task_count: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_fills_required_blocks() {
        let stats = collect();
        // MemStats and DiskStats are the blocks consumers require.
        let mem = stats.mem_stats.expect("memory block");
        assert!(mem.total_kb > 0);
        assert!(mem.available_kb <= mem.total_kb);
        assert!(stats.disk_stats.is_some());
        assert!(stats.cpu_stats.expect("cpu block").cores > 0);
    }
}
