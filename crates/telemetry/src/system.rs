//! Host resource readings embedded into metric snapshots.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Point-in-time host resource readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemReadings {
    pub cpu_usage_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
}

/// Reusable probe over the host. Refreshing mutates sysinfo state, so the
/// probe holds the `System` behind a lock.
pub struct SystemProbe {
    sys: Mutex<System>,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    /// Refresh and read current CPU and memory usage.
    ///
    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn read(&self) -> SystemReadings {
        let mut sys = self.sys.lock().expect("system probe lock poisoned");
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        SystemReadings {
            cpu_usage_percent: sys.global_cpu_usage(),
            memory_used_bytes: sys.used_memory(),
            memory_total_bytes: sys.total_memory(),
        }
    }
}
