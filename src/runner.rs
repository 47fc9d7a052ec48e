//! Drives a single (skill, scenario) pair through its container lifecycle.

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use indexmap::IndexMap;

use crate::{
    config::{ContainerConfig, ScenarioConfig, SkillConfig},
    docker::{ActiveContainers, ContainerHandle, ContainerRuntime, ContainerSpec, VolumeBind},
    telemetry::MemoryTelemetry,
    utils::Shutdown,
    worker::Observer,
};

pub const SKILLS_MOUNT_ROOT: &str = "/home/claude/.claude/skills";
pub const SCENARIO_MOUNT: &str = "/tmp/scenario";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Running,
    Completed,
    Failed,
    Timeout,
    Oom,
    Interrupted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
            Self::Timeout => f.write_str("timeout"),
            Self::Oom => f.write_str("oom"),
            Self::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// A live status observation for one run. Emitted at every state transition;
/// the terminal state is emitted exactly once and last.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub label: String,
    pub state: RunState,
    pub memory_usage: String,
    pub duration_seconds: f64,
    pub container_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    Timeout,
    OomKilled,
    Interrupted,
    NonzeroExit(i64),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::OomKilled => f.write_str("oom_killed"),
            Self::Interrupted => f.write_str("interrupted"),
            Self::NonzeroExit(code) => write!(f, "nonzero_exit:{code}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub label: String,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
    pub error: Option<RunError>,
    pub peak_memory_bytes: u64,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub(crate) fn interrupted(label: String, duration_seconds: f64, peak: u64) -> Self {
        Self {
            label,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration_seconds,
            error: Some(RunError::Interrupted),
            peak_memory_bytes: peak,
        }
    }
}

/// Stable identifier for one execution. The skill's directory name is used
/// in the matrix form so labels stay put when display names are overridden.
pub fn run_label(skill: &SkillConfig, scenario: Option<&ScenarioConfig>) -> String {
    match scenario {
        Some(scenario) => format!("{}/{}", skill.dirname(), scenario.name),
        None => skill.name.clone(),
    }
}

fn classify_exit(exit_code: i64, oom_killed: bool) -> Option<RunError> {
    if exit_code == 0 {
        return None;
    }
    // Exit 137 alone is not proof of an OOM kill (SIGKILL from any source
    // yields 137); the runtime's flag decides.
    if oom_killed {
        return Some(RunError::OomKilled);
    }
    Some(RunError::NonzeroExit(exit_code))
}

/// Builds the container spec for one pair.
pub(crate) fn build_spec(
    name: String,
    skill: &SkillConfig,
    config: &ContainerConfig,
    scenario: Option<&ScenarioConfig>,
) -> anyhow::Result<ContainerSpec> {
    let mut volumes = IndexMap::new();
    volumes.insert(
        skill.path.to_string_lossy().into_owned(),
        VolumeBind::read_only(format!("{SKILLS_MOUNT_ROOT}/{}", skill.name)),
    );
    if let Some(scenario) = scenario {
        volumes.insert(
            scenario.path.to_string_lossy().into_owned(),
            VolumeBind::read_only(SCENARIO_MOUNT),
        );
    }
    for (host, bind) in &config.extra_volumes {
        volumes.insert(host.clone(), bind.clone());
    }

    let (entrypoint, command) = match scenario {
        Some(_) => {
            // The setup script prepares /workspace, then the agent replaces
            // the shell so its exit code becomes the container's.
            let mut agent_cmd: Vec<&str> = vec!["claude"];
            agent_cmd.extend(config.extra_flags.iter().map(String::as_str));
            agent_cmd.push("--print");
            agent_cmd.push(&config.prompt);
            let quoted = shlex::try_join(agent_cmd.iter().copied())
                .context("prompt or flags contain characters that cannot be shell-quoted")?;
            let script = format!("bash {SCENARIO_MOUNT}/setup.sh && exec {quoted}");
            (Some(vec!["bash".to_owned(), "-c".to_owned()]), vec![script])
        }
        None => {
            let mut command = config.extra_flags.clone();
            command.push("--print".to_owned());
            command.push(config.prompt.clone());
            (None, command)
        }
    };

    Ok(ContainerSpec {
        name,
        image: config.image.clone(),
        command,
        entrypoint,
        env: config.env.clone(),
        volumes,
        mem_limit: config.mem_limit.clone(),
        network_mode: "bridge".to_owned(),
        working_dir: "/workspace".to_owned(),
    })
}

/// Shared state a worker needs to execute pairs.
#[derive(Clone)]
pub struct RunContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub config: ContainerConfig,
    pub telemetry: Arc<MemoryTelemetry>,
    pub active: Arc<ActiveContainers>,
    pub shutdown: Arc<Shutdown>,
    pub observer: Arc<Observer>,
}

impl RunContext {
    fn emit(&self, label: &str, container: &ContainerHandle, state: RunState, elapsed: f64) {
        self.observer.status(ContainerStatus {
            label: label.to_owned(),
            state,
            memory_usage: self.telemetry.human(&container.name),
            duration_seconds: elapsed,
            container_name: container.name.clone(),
        });
    }
}

/// Unregisters and force-removes the container on every exit path. Removal
/// errors are logged and suppressed.
struct CleanupGuard<'a> {
    ctx: &'a RunContext,
    container: ContainerHandle,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.ctx.active.unregister(&self.container);
        if let Err(e) = self.ctx.runtime.remove(&self.container) {
            tracing::debug!("error removing container {}: {e:#}", self.container.name);
        }
    }
}

/// Runs one (skill, scenario) pair to completion.
///
/// Per-run failures (timeout, OOM, nonzero exit, interrupt) are reported in
/// the result; runtime errors from create/start/wait propagate after cleanup.
pub fn run_pair(
    ctx: &RunContext,
    skill: &SkillConfig,
    scenario: Option<&ScenarioConfig>,
) -> anyhow::Result<RunResult> {
    let label = run_label(skill, scenario);
    let start = Instant::now();

    let spec = build_spec(crate::docker::next_container_name(), skill, &ctx.config, scenario)?;
    let container = ctx
        .runtime
        .create(&spec)
        .with_context(|| format!("error creating container for {label}"))?;
    ctx.active.register(container.clone());
    let _guard = CleanupGuard { ctx, container: container.clone() };

    if ctx.shutdown.is_set() {
        ctx.emit(&label, &container, RunState::Interrupted, start.elapsed().as_secs_f64());
        return Ok(RunResult::interrupted(
            label,
            start.elapsed().as_secs_f64(),
            ctx.telemetry.peak(&container.name),
        ));
    }

    ctx.emit(&label, &container, RunState::Starting, 0.0);
    if let Err(e) = ctx.runtime.start(&container) {
        ctx.emit(&label, &container, RunState::Failed, start.elapsed().as_secs_f64());
        return Err(e).with_context(|| format!("error starting container for {label}"));
    }
    ctx.emit(&label, &container, RunState::Running, start.elapsed().as_secs_f64());

    let exit_code = match ctx.runtime.wait(&container, ctx.config.timeout) {
        Err(e) => {
            ctx.emit(&label, &container, RunState::Failed, start.elapsed().as_secs_f64());
            return Err(e).with_context(|| format!("error waiting for {label}"));
        }
        Ok(None) => {
            if let Err(e) = ctx.runtime.stop(&container) {
                tracing::warn!("error stopping timed-out container {}: {e:#}", container.name);
            }
            let elapsed = start.elapsed().as_secs_f64();
            ctx.emit(&label, &container, RunState::Timeout, elapsed);
            return Ok(RunResult {
                label,
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                duration_seconds: elapsed,
                error: Some(RunError::Timeout),
                peak_memory_bytes: ctx.telemetry.peak(&container.name),
            });
        }
        Ok(Some(code)) => code,
    };

    let oom_killed = match ctx.runtime.oom_killed(&container) {
        Ok(flag) => flag,
        Err(e) => {
            ctx.emit(&label, &container, RunState::Failed, start.elapsed().as_secs_f64());
            return Err(e).with_context(|| format!("error reading state of {label}"));
        }
    };
    let (stdout, stderr) = match ctx.runtime.logs(&container) {
        Ok(logs) => logs,
        Err(e) => {
            ctx.emit(&label, &container, RunState::Failed, start.elapsed().as_secs_f64());
            return Err(e).with_context(|| format!("error collecting logs of {label}"));
        }
    };

    let elapsed = start.elapsed().as_secs_f64();
    let error = classify_exit(exit_code, oom_killed);
    let state = match &error {
        None => RunState::Completed,
        Some(RunError::OomKilled) => RunState::Oom,
        Some(_) => RunState::Failed,
    };
    ctx.emit(&label, &container, state, elapsed);

    Ok(RunResult {
        label,
        exit_code,
        stdout,
        stderr,
        duration_seconds: elapsed,
        error,
        peak_memory_bytes: ctx.telemetry.peak(&container.name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{fake::FakeRuntime, MemorySample};
    use std::time::Duration;

    fn make_skill(root: &std::path::Path, name: &str) -> SkillConfig {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        SkillConfig { path: dir, name: name.to_owned() }
    }

    fn make_scenario(root: &std::path::Path, name: &str) -> ScenarioConfig {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("setup.sh"), "echo setup").unwrap();
        ScenarioConfig { path: dir, name: name.to_owned() }
    }

    fn make_config() -> ContainerConfig {
        let mut env = IndexMap::new();
        env.insert("CLAUDE_CODE_OAUTH_TOKEN".to_owned(), "sk-test".to_owned());
        ContainerConfig {
            image: "test:latest".to_owned(),
            mem_limit: "512m".to_owned(),
            mem_limit_bytes: 512 * 1024 * 1024,
            timeout: Duration::from_secs(300),
            env,
            prompt: "do the thing".to_owned(),
            extra_flags: vec![],
            extra_volumes: IndexMap::new(),
        }
    }

    struct Harness {
        ctx: RunContext,
        runtime: Arc<FakeRuntime>,
        statuses: Arc<parking_lot::Mutex<Vec<ContainerStatus>>>,
    }

    fn harness(runtime: FakeRuntime, config: ContainerConfig) -> Harness {
        let runtime = Arc::new(runtime);
        let statuses = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = statuses.clone();
        let observer = Arc::new(Observer::new(move |s| sink.lock().push(s)));
        let ctx = RunContext {
            runtime: runtime.clone(),
            config,
            telemetry: Arc::new(MemoryTelemetry::default()),
            active: Arc::new(ActiveContainers::default()),
            shutdown: Arc::new(Shutdown::new()),
            observer,
        };
        Harness { ctx, runtime, statuses }
    }

    #[test]
    fn happy_path() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "test-skill");
        let h = harness(FakeRuntime::default(), make_config());

        let result = run_pair(&h.ctx, &skill, None).unwrap();

        assert_eq!(result.label, "test-skill");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "out");
        assert_eq!(result.stderr, "err");
        assert!(result.error.is_none());

        let states: Vec<RunState> = h.statuses.lock().iter().map(|s| s.state).collect();
        assert_eq!(states, [RunState::Starting, RunState::Running, RunState::Completed]);

        let runtime = &h.runtime;
        assert_eq!(runtime.started.lock().len(), 1);
        assert_eq!(runtime.removed.lock().len(), 1);
        assert!(h.ctx.active.snapshot().is_empty());
    }

    #[test]
    fn timeout_stops_and_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let runtime = FakeRuntime { wait_times_out: true, ..Default::default() };
        let h = harness(runtime, make_config());

        let result = run_pair(&h.ctx, &skill, None).unwrap();

        assert_eq!(result.error, Some(RunError::Timeout));
        assert_eq!(result.exit_code, -1);
        let runtime = &h.runtime;
        assert_eq!(runtime.stopped.lock().len(), 1);
        assert_eq!(runtime.removed.lock().len(), 1);
        let last = h.statuses.lock().last().unwrap().state;
        assert_eq!(last, RunState::Timeout);
    }

    #[test]
    fn oom_flag_wins_over_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let runtime = FakeRuntime { exit_code: 137, oom: true, ..Default::default() };
        let h = harness(runtime, make_config());

        let result = run_pair(&h.ctx, &skill, None).unwrap();

        assert_eq!(result.error, Some(RunError::OomKilled));
        assert_eq!(result.exit_code, 137);
        assert_eq!(h.statuses.lock().last().unwrap().state, RunState::Oom);
    }

    #[test]
    fn exit_137_without_flag_is_not_oom() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let runtime = FakeRuntime { exit_code: 137, oom: false, ..Default::default() };
        let h = harness(runtime, make_config());

        let result = run_pair(&h.ctx, &skill, None).unwrap();

        assert_eq!(result.error, Some(RunError::NonzeroExit(137)));
        assert_eq!(result.error.unwrap().to_string(), "nonzero_exit:137");
    }

    #[test]
    fn start_failure_propagates_after_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let runtime = FakeRuntime { fail_start: true, ..Default::default() };
        let h = harness(runtime, make_config());

        let err = run_pair(&h.ctx, &skill, None).unwrap_err();
        assert!(format!("{err:#}").contains("start failed"));
        let runtime = &h.runtime;
        assert_eq!(runtime.removed.lock().len(), 1);
        assert!(h.ctx.active.snapshot().is_empty());
    }

    #[test]
    fn shutdown_before_start_interrupts_and_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let h = harness(FakeRuntime::default(), make_config());
        h.ctx.shutdown.trigger();

        let result = run_pair(&h.ctx, &skill, None).unwrap();

        assert_eq!(result.error, Some(RunError::Interrupted));
        assert_eq!(result.exit_code, -1);
        let runtime = &h.runtime;
        assert!(runtime.started.lock().is_empty());
        assert_eq!(runtime.removed.lock().len(), 1);
        let states: Vec<RunState> = h.statuses.lock().iter().map(|s| s.state).collect();
        assert_eq!(states, [RunState::Interrupted]);
    }

    #[test]
    fn exactly_one_terminal_status() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let h = harness(FakeRuntime::default(), make_config());

        run_pair(&h.ctx, &skill, None).unwrap();

        let statuses = h.statuses.lock();
        let terminal: Vec<_> = statuses.iter().filter(|s| s.state.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(statuses.last().unwrap().state.is_terminal());
    }

    #[test]
    fn statuses_carry_container_name() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let runtime = FakeRuntime { name: Some("quirky_darwin".to_owned()), ..Default::default() };
        let h = harness(runtime, make_config());

        run_pair(&h.ctx, &skill, None).unwrap();

        assert!(h.statuses.lock().iter().all(|s| s.container_name == "quirky_darwin"));
    }

    #[test]
    fn peak_memory_read_from_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let runtime = FakeRuntime { name: Some("my_container".to_owned()), ..Default::default() };
        let h = harness(runtime, make_config());
        h.ctx.telemetry.record(
            "my_container",
            MemorySample { usage: 500_000_000, limit: 1_000_000_000 },
        );

        let result = run_pair(&h.ctx, &skill, None).unwrap();
        assert_eq!(result.peak_memory_bytes, 500_000_000);
    }

    #[test]
    fn peak_memory_zero_without_samples() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let h = harness(FakeRuntime::default(), make_config());

        let result = run_pair(&h.ctx, &skill, None).unwrap();
        assert_eq!(result.peak_memory_bytes, 0);
    }

    #[test]
    fn spec_mounts_skill_read_only() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "test-skill");
        let spec = build_spec("c0".into(), &skill, &make_config(), None).unwrap();

        let bind = &spec.volumes[&skill.path.to_string_lossy().into_owned()];
        assert_eq!(bind.bind, "/home/claude/.claude/skills/test-skill");
        assert_eq!(bind.mode, "ro");
        assert_eq!(spec.working_dir, "/workspace");
        assert_eq!(spec.network_mode, "bridge");
        assert_eq!(spec.mem_limit, "512m");
        assert!(spec.entrypoint.is_none());
    }

    #[test]
    fn spec_without_flags_keeps_default_command() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let spec = build_spec("c0".into(), &skill, &make_config(), None).unwrap();
        assert_eq!(spec.command, ["--print", "do the thing"]);
    }

    #[test]
    fn spec_flags_precede_print() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let mut config = make_config();
        config.extra_flags =
            vec!["--model".into(), "sonnet-4".into(), "--max-turns".into(), "5".into()];
        let spec = build_spec("c0".into(), &skill, &config, None).unwrap();
        assert_eq!(
            spec.command,
            ["--model", "sonnet-4", "--max-turns", "5", "--print", "do the thing"]
        );
    }

    #[test]
    fn scenario_spec_runs_setup_then_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let scenario = make_scenario(tmp.path(), "code-review");
        let mut config = make_config();
        config.extra_flags = vec!["--model".into(), "sonnet-4".into()];
        config.prompt = "do it".into();

        let spec = build_spec("c0".into(), &skill, &config, Some(&scenario)).unwrap();

        assert_eq!(spec.entrypoint, Some(vec!["bash".to_owned(), "-c".to_owned()]));
        assert_eq!(
            spec.command,
            ["bash /tmp/scenario/setup.sh && exec claude --model sonnet-4 --print 'do it'"]
        );
        let bind = &spec.volumes[&scenario.path.to_string_lossy().into_owned()];
        assert_eq!(bind.bind, "/tmp/scenario");
        assert_eq!(bind.mode, "ro");
    }

    #[test]
    fn extra_volumes_merged() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let mut config = make_config();
        config.extra_volumes.insert(
            "/host/creds.json".to_owned(),
            VolumeBind::read_only("/container/creds.json"),
        );
        let spec = build_spec("c0".into(), &skill, &config, None).unwrap();
        assert_eq!(spec.volumes["/host/creds.json"].bind, "/container/creds.json");
        // skill volume still present
        assert!(spec.volumes.contains_key(&skill.path.to_string_lossy().into_owned()));
    }

    #[test]
    fn label_uses_dirname_with_scenario() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("actual-dir");
        std::fs::create_dir(&dir).unwrap();
        let skill = SkillConfig { path: dir, name: "overridden-name".to_owned() };
        let scenario = make_scenario(tmp.path(), "review");

        assert_eq!(run_label(&skill, Some(&scenario)), "actual-dir/review");
        assert_eq!(run_label(&skill, None), "overridden-name");
    }

    #[test]
    fn container_registered_while_waiting() {
        let tmp = tempfile::tempdir().unwrap();
        let skill = make_skill(tmp.path(), "s");
        let runtime = FakeRuntime {
            name: Some("c-reg".to_owned()),
            wait_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let h = harness(runtime, make_config());

        let active = h.ctx.active.clone();
        let seen = Arc::new(parking_lot::Mutex::new(false));
        let seen2 = seen.clone();
        let probe = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            *seen2.lock() = active.contains("c-reg");
        });

        run_pair(&h.ctx, &skill, None).unwrap();
        probe.join().unwrap();

        assert!(*seen.lock());
        assert!(!h.ctx.active.contains("c-reg"));
    }

    #[test]
    fn classify_exit_rules() {
        assert_eq!(classify_exit(0, false), None);
        assert_eq!(classify_exit(0, true), None);
        assert_eq!(classify_exit(137, true), Some(RunError::OomKilled));
        assert_eq!(classify_exit(137, false), Some(RunError::NonzeroExit(137)));
        assert_eq!(classify_exit(1, false), Some(RunError::NonzeroExit(1)));
    }
}
