//! Heartbeat sender and host resource sampling

use std::sync::Arc;
use sysinfo::System;

use super::WorkerNode;
use crate::registry::{HeartbeatReport, RegistryError};

/// CPU and memory sampler for heartbeat reports
pub struct SystemSampler {
    system: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// CPU usage and memory usage, both in percent.
    ///
    /// CPU usage is measured between consecutive calls, so the first sample
    /// reads zero.
    pub fn sample(&mut self) -> (f64, f64) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpu = f64::from(self.system.global_cpu_usage()).clamp(0.0, 100.0);
        let total = self.system.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            (self.system.used_memory() as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        };
        (cpu, memory)
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerNode {
    /// Send one heartbeat, re-registering when the registry no longer knows us
    pub async fn send_heartbeat(&self, sampler: &mut SystemSampler) -> Result<(), RegistryError> {
        let (cpu, memory) = sampler.sample();
        let mut metrics = self.stats().await.performance_metrics();
        metrics.cpu_usage = cpu;
        metrics.memory_usage = memory;

        let report = HeartbeatReport::new(metrics).with_current_tasks(self.in_flight());
        match self.registry.heartbeat(self.node_id(), report).await {
            Err(RegistryError::NodeNotFound(_)) => {
                tracing::warn!(node = %self.node_id(), "Node was evicted, re-registering");
                self.register().await
            }
            other => other,
        }
    }

    pub(super) async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(self.cluster.heartbeat_interval());
        let mut sampler = SystemSampler::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.send_heartbeat(&mut sampler).await {
                        tracing::warn!(node = %self.node_id(), error = %e, "Heartbeat failed");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::info!(node = %self.node_id(), "Heartbeat loop shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_in_range() {
        let mut sampler = SystemSampler::new();
        for _ in 0..2 {
            let (cpu, memory) = sampler.sample();
            assert!((0.0..=100.0).contains(&cpu));
            assert!((0.0..=100.0).contains(&memory));
        }
    }
}
