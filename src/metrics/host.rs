//! Host resource sampling.
//!
//! CPU usage is the average over a short window, so a sample takes at least
//! [`sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`].

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::System;

use super::MetricsError;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One reading of host resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HostSample {
    /// CPU usage across all cores, in percent.
    pub cpu_usage: f64,
    /// Memory in use, in percent.
    pub memory_usage: f64,
    /// Memory still available, in GiB.
    pub memory_available_gb: f64,
}

/// Source of host resource readings.
#[async_trait]
pub trait HostSampler: Send + Sync {
    /// Takes one reading.
    async fn sample(&self) -> Result<HostSample, MetricsError>;
}

/// Samples the local machine through `sysinfo`.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    /// Creates a sampler and primes the CPU counters.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostSampler for SysinfoSampler {
    async fn sample(&self) -> Result<HostSample, MetricsError> {
        self.system
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refresh_cpu_usage();

        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;

        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Err(MetricsError::Host("total memory reported as zero".to_string()));
        }
        let available = system.available_memory();

        Ok(HostSample {
            cpu_usage: f64::from(system.global_cpu_usage()),
            memory_usage: (total.saturating_sub(available)) as f64 / total as f64 * 100.0,
            memory_available_gb: available as f64 / BYTES_PER_GB,
        })
    }
}

/// Returns the same reading every time.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticSampler(pub HostSample);

#[async_trait]
impl HostSampler for StaticSampler {
    async fn sample(&self) -> Result<HostSample, MetricsError> {
        Ok(self.0)
    }
}
