//! Bounded-parallel dispatch of (skill, scenario) pairs.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::{
    config::{ContainerConfig, ScenarioConfig, SkillConfig},
    docker::{ActiveContainers, ContainerRuntime},
    runner::{self, ContainerStatus, RunContext, RunResult, RunState},
    telemetry::{self, MemoryTelemetry, TelemetrySample},
    utils::Shutdown,
};

/// Host-attached hooks for live status, per-run results and telemetry.
///
/// `on_status` is invoked from arbitrary worker threads, serially per run.
/// `on_result` fires once per completed pair, after the terminal status.
pub struct Observer {
    on_status: Box<dyn Fn(ContainerStatus) + Send + Sync>,
    on_result: Option<Box<dyn Fn(&RunResult) + Send + Sync>>,
    on_telemetry: Option<Box<dyn Fn(TelemetrySample) + Send + Sync>>,
}

impl Observer {
    pub fn new(on_status: impl Fn(ContainerStatus) + Send + Sync + 'static) -> Self {
        Self { on_status: Box::new(on_status), on_result: None, on_telemetry: None }
    }

    pub fn with_on_result(mut self, f: impl Fn(&RunResult) + Send + Sync + 'static) -> Self {
        self.on_result = Some(Box::new(f));
        self
    }

    pub fn with_on_telemetry(
        mut self,
        f: impl Fn(TelemetrySample) + Send + Sync + 'static,
    ) -> Self {
        self.on_telemetry = Some(Box::new(f));
        self
    }

    pub(crate) fn status(&self, status: ContainerStatus) {
        (self.on_status)(status);
    }

    pub(crate) fn result(&self, result: &RunResult) {
        if let Some(f) = &self.on_result {
            f(result);
        }
    }

    pub(crate) fn telemetry(&self, sample: TelemetrySample) {
        if let Some(f) = &self.on_telemetry {
            f(sample);
        }
    }
}

/// One unit of work for the pool.
#[derive(Debug, Clone)]
pub struct Pair {
    pub skill: SkillConfig,
    pub scenario: Option<ScenarioConfig>,
}

/// Expands the matrix in skill-major, scenario-minor order. Without
/// scenarios each skill yields a single pair.
pub fn expand_pairs(skills: &[SkillConfig], scenarios: &[ScenarioConfig]) -> Vec<Pair> {
    if scenarios.is_empty() {
        return skills
            .iter()
            .map(|skill| Pair { skill: skill.clone(), scenario: None })
            .collect();
    }
    let mut pairs = Vec::with_capacity(skills.len() * scenarios.len());
    for skill in skills {
        for scenario in scenarios {
            pairs.push(Pair { skill: skill.clone(), scenario: Some(scenario.clone()) });
        }
    }
    pairs
}

pub struct WorkerPool {
    task_sender: Option<Sender<Pair>>,
    task_receiver: Receiver<Pair>,
    shutdown: Arc<Shutdown>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.task_sender.is_some() {
            self.wait_for_workers();
        }
    }
}

impl WorkerPool {
    pub fn new(shutdown: Arc<Shutdown>) -> Self {
        let (task_sender, task_receiver) = crossbeam_channel::bounded(0);
        Self { task_sender: Some(task_sender), task_receiver, shutdown, workers: vec![] }
    }

    /// Spawn a new worker and add it to the pool.
    pub fn add_worker<F>(&mut self, mut worker: F) -> anyhow::Result<()>
    where
        F: FnMut(Pair) -> anyhow::Result<()> + Send + 'static,
    {
        let id = self.workers.len();
        let rx = self.task_receiver.clone();
        let name = format!("[worker#{id:02}] pair receiver");

        let worker = std::thread::Builder::new().name(name).spawn(move || {
            // Stagger start up slightly so workers do not all hit the
            // container runtime at the same instant.
            std::thread::sleep(std::time::Duration::from_millis(10 * id as u64));

            tracing::debug!("worker {id} started");
            for pair in rx {
                if let Err(e) = worker(pair) {
                    tracing::error!("error running pair: {e:?}");
                }
            }
        })?;

        self.workers.push(worker);
        Ok(())
    }

    /// Queue a pair on the pool, blocking until a worker picks it up.
    pub fn add_task(&self, pair: Pair) -> anyhow::Result<()> {
        if let Some(sender) = self.task_sender.as_ref() {
            crossbeam_channel::select! {
                send(sender, pair) -> res => {
                    if res.is_err() {
                        anyhow::bail!("failed to send pair to worker");
                    }
                },
                recv(self.shutdown.channel()) -> _ => anyhow::bail!("shutdown requested"),
            }
        }
        Ok(())
    }

    /// Wait for all workers to finish execution.
    pub fn wait_for_workers(&mut self) {
        // Dropping the sender tells the workers no pairs remain.
        drop(self.task_sender.take());

        tracing::debug!("waiting for {} workers to finish", self.workers.len());
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.join() {
                tracing::error!("worker crashed: {e:?}");
            }
        }
    }
}

/// Kills every active container once the shutdown signal fires, then exits.
/// Also exits quietly when the batch completes first.
fn spawn_interrupt_watcher(
    runtime: Arc<dyn ContainerRuntime>,
    active: Arc<ActiveContainers>,
    shutdown: Arc<Shutdown>,
    done: Receiver<()>,
) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("interrupt-watcher".to_owned())
        .spawn(move || {
            crossbeam_channel::select! {
                recv(shutdown.channel()) -> _ => {
                    let containers = active.snapshot();
                    tracing::info!("interrupt: stopping {} active containers", containers.len());
                    for container in containers {
                        if let Err(e) = runtime.kill(&container) {
                            tracing::debug!("error killing {}: {e:#}", container.name);
                        }
                    }
                }
                recv(done) -> _ => {}
            }
        })?;
    Ok(handle)
}

/// Runs the full matrix on a bounded worker pool.
///
/// Results arrive in completion order, not submission order. On interrupt the
/// accumulated results are returned; this function does not fail because runs
/// were cancelled.
pub fn run_matrix(
    skills: &[SkillConfig],
    scenarios: &[ScenarioConfig],
    config: &ContainerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    observer: Arc<Observer>,
    shutdown: Arc<Shutdown>,
    max_workers: Option<usize>,
) -> anyhow::Result<Vec<RunResult>> {
    let pairs = expand_pairs(skills, scenarios);
    let workers = match max_workers {
        Some(n) => n,
        None => crate::config::max_workers(runtime.total_memory()?, config.mem_limit_bytes),
    };
    let workers = workers.min(pairs.len()).max(1);
    tracing::info!("running {} pairs on {workers} workers", pairs.len());

    let active = Arc::new(ActiveContainers::default());
    let memory = Arc::new(MemoryTelemetry::default());

    let (poller_stop, poller_stop_rx) = crossbeam_channel::bounded::<()>(0);
    let poller = telemetry::spawn_poller(
        runtime.clone(),
        active.clone(),
        memory.clone(),
        observer.clone(),
        poller_stop_rx,
    )?;

    let (watcher_done, watcher_done_rx) = crossbeam_channel::bounded::<()>(0);
    let watcher =
        spawn_interrupt_watcher(runtime.clone(), active.clone(), shutdown.clone(), watcher_done_rx)?;

    let (result_tx, result_rx) = crossbeam_channel::unbounded();
    let mut pool = WorkerPool::new(shutdown.clone());
    for _ in 0..workers {
        let ctx = RunContext {
            runtime: runtime.clone(),
            config: config.clone(),
            telemetry: memory.clone(),
            active: active.clone(),
            shutdown: shutdown.clone(),
            observer: observer.clone(),
        };
        let result_tx = result_tx.clone();
        pool.add_worker(move |pair: Pair| {
            let result = if ctx.shutdown.is_set() {
                // Pair was queued but never started.
                let label = runner::run_label(&pair.skill, pair.scenario.as_ref());
                ctx.observer.status(ContainerStatus {
                    label: label.clone(),
                    state: RunState::Interrupted,
                    memory_usage: String::new(),
                    duration_seconds: 0.0,
                    container_name: String::new(),
                });
                RunResult::interrupted(label, 0.0, 0)
            } else {
                runner::run_pair(&ctx, &pair.skill, pair.scenario.as_ref())?
            };
            ctx.observer.result(&result);
            let _ = result_tx.send(result);
            Ok(())
        })?;
    }
    drop(result_tx);

    for pair in pairs {
        if let Err(e) = pool.add_task(pair) {
            tracing::warn!("not queueing remaining pairs: {e}");
            break;
        }
    }
    pool.wait_for_workers();

    drop(poller_stop);
    let _ = poller.join();
    drop(watcher_done);
    let _ = watcher.join();

    Ok(result_rx.try_iter().collect())
}
