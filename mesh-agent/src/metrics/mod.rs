//! Compact system snapshot sent with each handshake
//!
//! Uptime, CPU usage and load averages, memory usage.

use serde::Serialize;
use sysinfo::System;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub uptime_seconds: u64,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuMetrics {
    pub percent: f32,
    pub load_avg: [f64; 3], // [1min, 5min, 15min]
    pub core_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryMetrics {
    pub total_mb: u64,
    pub used_mb: u64,
    pub available_mb: u64,
    pub percent_used: f32,
}

/// Keeps one `System` alive so CPU usage is measured between two collections.
pub struct Collector {
    sys: System,
}

impl Collector {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self { sys }
    }

    pub fn collect(&mut self) -> SystemSnapshot {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        debug!("system snapshot refreshed");

        SystemSnapshot {
            uptime_seconds: System::uptime(),
            cpu: CpuMetrics::from_system(&self.sys),
            memory: MemoryMetrics::from_bytes(self.sys.total_memory(), self.sys.available_memory()),
        }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuMetrics {
    fn from_system(sys: &System) -> Self {
        // Unix only; zeros elsewhere
        let load_avg = if cfg!(unix) {
            let load = System::load_average();
            [load.one, load.five, load.fifteen]
        } else {
            [0.0, 0.0, 0.0]
        };

        CpuMetrics {
            percent: sys.global_cpu_info().cpu_usage(),
            load_avg,
            core_count: sys.cpus().len(),
        }
    }
}

impl MemoryMetrics {
    fn from_bytes(total_bytes: u64, available_bytes: u64) -> Self {
        const MB: u64 = 1024 * 1024;
        let used_bytes = total_bytes.saturating_sub(available_bytes);
        let percent_used = if total_bytes > 0 {
            (used_bytes as f32 / total_bytes as f32) * 100.0
        } else {
            0.0
        };

        MemoryMetrics {
            total_mb: total_bytes / MB,
            used_mb: used_bytes / MB,
            available_mb: available_bytes / MB,
            percent_used,
        }
    }
}
