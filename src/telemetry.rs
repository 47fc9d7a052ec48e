//! Background memory telemetry for running containers.

use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    docker::{ActiveContainers, ContainerRuntime, MemorySample},
    worker::Observer,
};

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

pub fn fmt_bytes(n: u64) -> String {
    if n >= GIB {
        format!("{:.1}G", n as f64 / GIB as f64)
    } else {
        format!("{}M", n / MIB)
    }
}

pub fn format_memory(usage: u64, limit: u64) -> String {
    format!("{} / {}", fmt_bytes(usage), fmt_bytes(limit))
}

/// A single poll observation published to the host.
#[derive(Debug, Clone)]
pub struct TelemetrySample {
    pub container: String,
    pub usage: u64,
    pub limit: u64,
    pub peak: u64,
}

/// Per-container memory caches keyed by runtime container name.
///
/// The poller is the only writer; runners read the peak for their own key
/// when a run finishes, and status events read the human string.
#[derive(Default)]
pub struct MemoryTelemetry {
    human: parking_lot::Mutex<HashMap<String, String>>,
    peak: parking_lot::Mutex<HashMap<String, u64>>,
}

impl MemoryTelemetry {
    /// Records a sample, returning the updated peak. Samples without a limit
    /// are ignored (the container is gone or cgroup data is unavailable).
    pub fn record(&self, container: &str, sample: MemorySample) -> u64 {
        if sample.limit == 0 {
            return self.peak(container);
        }
        self.human
            .lock()
            .insert(container.to_owned(), format_memory(sample.usage, sample.limit));
        let mut peaks = self.peak.lock();
        let peak = peaks.entry(container.to_owned()).or_insert(0);
        *peak = (*peak).max(sample.usage);
        *peak
    }

    pub fn human(&self, container: &str) -> String {
        self.human.lock().get(container).cloned().unwrap_or_default()
    }

    pub fn peak(&self, container: &str) -> u64 {
        self.peak.lock().get(container).copied().unwrap_or(0)
    }
}

/// Spawns the poller thread. It samples every active container on a fixed
/// cadence and exits once `stop` is signalled or dropped. Telemetry failures
/// are logged and swallowed; they never affect a run.
pub fn spawn_poller(
    runtime: Arc<dyn ContainerRuntime>,
    active: Arc<ActiveContainers>,
    telemetry: Arc<MemoryTelemetry>,
    observer: Arc<Observer>,
    stop: crossbeam_channel::Receiver<()>,
) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("telemetry-poller".to_owned())
        .spawn(move || {
            loop {
                match stop.recv_timeout(POLL_INTERVAL) {
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                }
                poll_once(runtime.as_ref(), &active, &telemetry, &observer);
            }
            tracing::debug!("telemetry poller stopped");
        })?;
    Ok(handle)
}

fn poll_once(
    runtime: &dyn ContainerRuntime,
    active: &ActiveContainers,
    telemetry: &MemoryTelemetry,
    observer: &Observer,
) {
    for container in active.snapshot() {
        match runtime.stats(&container) {
            Ok(sample) if sample.limit > 0 => {
                let peak = telemetry.record(&container.name, sample);
                observer.telemetry(TelemetrySample {
                    container: container.name,
                    usage: sample.usage,
                    limit: sample.limit,
                    peak,
                });
            }
            Ok(_) => {}
            Err(e) => {
                // The container may have exited between the snapshot of the
                // registry and the stats request.
                tracing::debug!("stats unavailable for {}: {e:#}", container.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::ContainerHandle;

    #[test]
    fn fmt_bytes_megabytes_floor() {
        assert_eq!(fmt_bytes(343 * MIB + 512), "343M");
        assert_eq!(fmt_bytes(0), "0M");
    }

    #[test]
    fn fmt_bytes_gigabytes_one_decimal() {
        assert_eq!(fmt_bytes(GIB), "1.0G");
        assert_eq!(fmt_bytes(GIB + GIB / 2), "1.5G");
    }

    #[test]
    fn format_memory_usage_over_limit() {
        assert_eq!(format_memory(128 * MIB, 512 * MIB), "128M / 512M");
    }

    #[test]
    fn record_tracks_peak() {
        let telemetry = MemoryTelemetry::default();
        telemetry.record("c0", MemorySample { usage: 100, limit: 512 * MIB });
        telemetry.record("c0", MemorySample { usage: 400, limit: 512 * MIB });
        telemetry.record("c0", MemorySample { usage: 250, limit: 512 * MIB });
        assert_eq!(telemetry.peak("c0"), 400);
    }

    #[test]
    fn record_ignores_zero_limit() {
        let telemetry = MemoryTelemetry::default();
        telemetry.record("c0", MemorySample { usage: 100, limit: 0 });
        assert_eq!(telemetry.peak("c0"), 0);
        assert_eq!(telemetry.human("c0"), "");
    }

    #[test]
    fn peak_defaults_to_zero() {
        let telemetry = MemoryTelemetry::default();
        assert_eq!(telemetry.peak("unknown"), 0);
    }

    struct StaticStats(MemorySample);

    impl ContainerRuntime for StaticStats {
        fn create(&self, _: &crate::docker::ContainerSpec) -> anyhow::Result<ContainerHandle> {
            anyhow::bail!("unused")
        }
        fn start(&self, _: &ContainerHandle) -> anyhow::Result<()> {
            anyhow::bail!("unused")
        }
        fn wait(&self, _: &ContainerHandle, _: Duration) -> anyhow::Result<Option<i64>> {
            anyhow::bail!("unused")
        }
        fn stop(&self, _: &ContainerHandle) -> anyhow::Result<()> {
            anyhow::bail!("unused")
        }
        fn kill(&self, _: &ContainerHandle) -> anyhow::Result<()> {
            anyhow::bail!("unused")
        }
        fn logs(&self, _: &ContainerHandle) -> anyhow::Result<(String, String)> {
            anyhow::bail!("unused")
        }
        fn stats(&self, _: &ContainerHandle) -> anyhow::Result<MemorySample> {
            Ok(self.0)
        }
        fn oom_killed(&self, _: &ContainerHandle) -> anyhow::Result<bool> {
            anyhow::bail!("unused")
        }
        fn remove(&self, _: &ContainerHandle) -> anyhow::Result<()> {
            Ok(())
        }
        fn total_memory(&self) -> anyhow::Result<u64> {
            anyhow::bail!("unused")
        }
    }

    #[test]
    fn poll_once_records_and_publishes() {
        let runtime = StaticStats(MemorySample { usage: 300 * MIB, limit: 512 * MIB });
        let active = ActiveContainers::default();
        active.register(ContainerHandle { name: "c0".to_owned() });
        let telemetry = MemoryTelemetry::default();

        let samples = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = samples.clone();
        let observer = Observer::new(|_| {})
            .with_on_telemetry(move |sample: TelemetrySample| sink.lock().push(sample));

        poll_once(&runtime, &active, &telemetry, &observer);

        assert_eq!(telemetry.peak("c0"), 300 * MIB);
        assert_eq!(telemetry.human("c0"), "300M / 512M");
        let samples = samples.lock();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].peak, 300 * MIB);
    }

    #[test]
    fn poller_exits_when_stop_dropped() {
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(StaticStats(MemorySample { usage: 0, limit: 0 }));
        let active = Arc::new(ActiveContainers::default());
        let telemetry = Arc::new(MemoryTelemetry::default());
        let observer = Arc::new(Observer::new(|_| {}));
        let (tx, rx) = crossbeam_channel::bounded(0);

        let handle = spawn_poller(runtime, active, telemetry, observer, rx).unwrap();
        drop(tx);
        handle.join().unwrap();
    }
}
