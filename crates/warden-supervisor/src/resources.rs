use parking_lot::Mutex;
use sysinfo::System;
use warden_core::ResourceThresholds;

/// Point-in-time view of machine resources
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub available_memory_mib: u64,
}

/// Gate consulted before every dequeue tick. Read-only observer of the
/// machine; never influences worker processes directly.
pub trait ResourceGate: Send + Sync {
    fn snapshot(&self) -> ResourceSnapshot;

    /// Whether the machine has headroom for more work under the
    /// configured thresholds
    fn has_headroom(&self) -> bool;
}

/// System-backed resource gate (machine-wide CPU and available memory)
pub struct ResourceMonitor {
    sys: Mutex<System>,
    thresholds: ResourceThresholds,
}

impl ResourceMonitor {
    pub fn new(thresholds: ResourceThresholds) -> Self {
        let mut sys = System::new();
        // First CPU refresh only establishes the baseline; usage numbers
        // become meaningful from the second refresh on
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        ResourceMonitor {
            sys: Mutex::new(sys),
            thresholds,
        }
    }
}

impl ResourceGate for ResourceMonitor {
    fn snapshot(&self) -> ResourceSnapshot {
        let mut sys = self.sys.lock();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        ResourceSnapshot {
            cpu_percent: sys.global_cpu_usage(),
            available_memory_mib: sys.available_memory() / 1024 / 1024,
        }
    }

    fn has_headroom(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.cpu_percent < self.thresholds.max_cpu_percent
            && snapshot.available_memory_mib >= self.thresholds.min_free_memory_mib
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reports_something() {
        let monitor = ResourceMonitor::new(ResourceThresholds {
            max_cpu_percent: 90.0,
            min_free_memory_mib: 0,
        });

        let snapshot = monitor.snapshot();
        assert!(snapshot.cpu_percent >= 0.0);
    }

    #[test]
    fn test_impossible_memory_threshold_blocks() {
        // No machine has this much free memory
        let monitor = ResourceMonitor::new(ResourceThresholds {
            max_cpu_percent: 100.0,
            min_free_memory_mib: u64::MAX,
        });

        assert!(!monitor.has_headroom());
    }
}
