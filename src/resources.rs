//! Host resource usage for the health report.
//!
//! CPU load is measured between consecutive samples, so the first report
//! after startup shows `0.0`. Collection problems are logged and reported
//! as zeros; they never change the health status.

use serde::Serialize;
use std::sync::Mutex;
use sysinfo::System;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu_load_percent: f32,
    pub memory_usage_percent: f32,
}

pub struct ResourceMonitor {
    system: Mutex<System>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        // Baseline for the first CPU delta.
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }

    pub fn sample(&self) -> ResourceUsage {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            warn!("Resource usage is not available on this platform");
            return ResourceUsage::default();
        }
        let Ok(mut system) = self.system.lock() else {
            warn!("Resource monitor lock poisoned; reporting zero usage");
            return ResourceUsage::default();
        };
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            warn!("Could not read total memory; reporting zero usage");
            return ResourceUsage::default();
        }
        ResourceUsage {
            cpu_load_percent: percent(system.global_cpu_usage()),
            memory_usage_percent: percent(system.used_memory() as f32 / total as f32 * 100.0),
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Clamp to `[0, 100]`, mapping NaN to zero.
fn percent(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent(f32::NAN), 0.0);
        assert_eq!(percent(-3.0), 0.0);
        assert_eq!(percent(42.5), 42.5);
        assert_eq!(percent(180.0), 100.0);
    }

    #[test]
    fn samples_stay_in_range() {
        let monitor = ResourceMonitor::new();
        for _ in 0..2 {
            let usage = monitor.sample();
            assert!((0.0..=100.0).contains(&usage.cpu_load_percent));
            assert!((0.0..=100.0).contains(&usage.memory_usage_percent));
        }
    }

    #[test]
    fn usage_serializes_with_percent_fields() {
        let value = serde_json::to_value(ResourceUsage {
            cpu_load_percent: 12.5,
            memory_usage_percent: 50.0,
        })
        .unwrap();
        assert_eq!(value["cpu_load_percent"], 12.5);
        assert_eq!(value["memory_usage_percent"], 50.0);
    }
}
