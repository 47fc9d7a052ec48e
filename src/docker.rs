//! Handle interactions with docker

use std::{
    path::PathBuf,
    process::{Command, Stdio},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::Context;
use indexmap::IndexMap;

use crate::XShellExt;

/// A host path mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBind {
    pub bind: String,
    pub mode: String,
}

impl VolumeBind {
    pub fn read_only(bind: impl Into<String>) -> Self {
        Self { bind: bind.into(), mode: "ro".into() }
    }
}

/// Everything needed to create one container, passed by value into the
/// runtime adapter.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub env: IndexMap<String, String>,
    /// Host path to bind options.
    pub volumes: IndexMap<String, VolumeBind>,
    /// Human form (e.g. "1g"). Swap is pinned to the same value so the
    /// container cannot page its way past the limit.
    pub mem_limit: String,
    pub network_mode: String,
    pub working_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub usage: u64,
    pub limit: u64,
}

/// The container runtime operations the harness depends on.
///
/// The production implementation shells out to the `docker` CLI; tests
/// substitute an in-memory fake.
pub trait ContainerRuntime: Send + Sync {
    fn create(&self, spec: &ContainerSpec) -> anyhow::Result<ContainerHandle>;
    fn start(&self, container: &ContainerHandle) -> anyhow::Result<()>;
    /// Waits for the container to exit, bounded by `timeout`. Returns the
    /// exit code, or `None` if the wait timed out.
    fn wait(&self, container: &ContainerHandle, timeout: Duration) -> anyhow::Result<Option<i64>>;
    fn stop(&self, container: &ContainerHandle) -> anyhow::Result<()>;
    fn kill(&self, container: &ContainerHandle) -> anyhow::Result<()>;
    /// Collected stdout and stderr, decoded as UTF-8.
    fn logs(&self, container: &ContainerHandle) -> anyhow::Result<(String, String)>;
    /// One-shot memory snapshot of a running container.
    fn stats(&self, container: &ContainerHandle) -> anyhow::Result<MemorySample>;
    /// Whether the kernel OOM killer terminated the container.
    fn oom_killed(&self, container: &ContainerHandle) -> anyhow::Result<bool>;
    /// Force-removes the container.
    fn remove(&self, container: &ContainerHandle) -> anyhow::Result<()>;
    /// Total host memory in bytes.
    fn total_memory(&self) -> anyhow::Result<u64>;
}

/// Registry of containers that are currently alive, used by the telemetry
/// poller and the interrupt path.
#[derive(Default)]
pub struct ActiveContainers {
    inner: parking_lot::Mutex<Vec<ContainerHandle>>,
}

impl ActiveContainers {
    pub fn register(&self, container: ContainerHandle) {
        self.inner.lock().push(container);
    }

    pub fn unregister(&self, container: &ContainerHandle) {
        self.inner.lock().retain(|c| c.name != container.name);
    }

    pub fn snapshot(&self) -> Vec<ContainerHandle> {
        self.inner.lock().clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().iter().any(|c| c.name == name)
    }
}

static CONTAINER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A process-unique container name, also used as the key for the status map
/// and the memory caches.
pub fn next_container_name() -> String {
    let n = CONTAINER_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("skill-harness-{}-{n}", std::process::id())
}

/// Flattens a container spec into `docker create` arguments.
pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_owned(),
        "--name".to_owned(),
        spec.name.clone(),
        "--memory".to_owned(),
        spec.mem_limit.clone(),
        "--memory-swap".to_owned(),
        spec.mem_limit.clone(),
        "--network".to_owned(),
        spec.network_mode.clone(),
        "--workdir".to_owned(),
        spec.working_dir.clone(),
    ];
    for (key, value) in &spec.env {
        args.push("-e".to_owned());
        args.push(format!("{key}={value}"));
    }
    for (host, bind) in &spec.volumes {
        args.push("-v".to_owned());
        args.push(format!("{host}:{}:{}", bind.bind, bind.mode));
    }

    // The CLI only accepts the entrypoint binary itself; any remaining
    // entrypoint words are folded into the leading command arguments.
    let mut trailing: Vec<String> = vec![];
    if let Some(entrypoint) = &spec.entrypoint {
        if let Some((first, rest)) = entrypoint.split_first() {
            args.push("--entrypoint".to_owned());
            args.push(first.clone());
            trailing.extend(rest.iter().cloned());
        }
    }
    args.push(spec.image.clone());
    trailing.extend(spec.command.iter().cloned());
    args.extend(trailing);
    args
}

/// Container runtime backed by the `docker` CLI plus the engine's unix socket
/// for numeric stats.
pub struct DockerCli {
    socket: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self { socket: PathBuf::from("/var/run/docker.sock") }
    }

    #[allow(unused)]
    pub fn with_socket(socket: PathBuf) -> Self {
        Self { socket }
    }

    /// GET a docker engine API path over the unix socket.
    fn api_get(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut client = curl::easy::Easy::new();
        client.unix_socket(
            self.socket
                .to_str()
                .ok_or_else(|| anyhow::format_err!("non-utf8 socket path"))?,
        )?;
        client.url(&format!("http://localhost{path}"))?;
        {
            let mut transfer = client.transfer();
            transfer.write_function(|data| {
                buf.extend_from_slice(data);
                Ok(data.len())
            })?;
            transfer.perform()?;
        }
        let code = client.response_code()?;
        if code != 200 {
            anyhow::bail!(
                "docker API GET {path} failed with {code}: {}",
                String::from_utf8_lossy(&buf)
            );
        }
        Ok(buf)
    }
}

impl ContainerRuntime for DockerCli {
    fn create(&self, spec: &ContainerSpec) -> anyhow::Result<ContainerHandle> {
        let args = create_args(spec);
        let sh = xshell::Shell::new()?;
        xshell::cmd!(sh, "docker {args...}")
            .read_with_err()
            .context("failed to create container")?;
        Ok(ContainerHandle { name: spec.name.clone() })
    }

    fn start(&self, container: &ContainerHandle) -> anyhow::Result<()> {
        let name = &container.name;
        let sh = xshell::Shell::new()?;
        xshell::cmd!(sh, "docker start {name}")
            .read_with_err()
            .context("failed to start container")?;
        Ok(())
    }

    fn wait(&self, container: &ContainerHandle, timeout: Duration) -> anyhow::Result<Option<i64>> {
        let mut child = Command::new("docker")
            .args(["wait", &container.name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn docker wait")?;

        let Some(status) = crate::utils::wait_for_process_timeout(&mut child, timeout)? else {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        };

        let output = child.wait_with_output()?;
        if !status.success() {
            anyhow::bail!(
                "docker wait failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let code = String::from_utf8(output.stdout)
            .map_err(anyhow::Error::msg)
            .and_then(|x| x.trim().parse::<i64>().map_err(anyhow::Error::msg))
            .context("error parsing exit code from docker wait")?;
        Ok(Some(code))
    }

    fn stop(&self, container: &ContainerHandle) -> anyhow::Result<()> {
        let name = &container.name;
        let sh = xshell::Shell::new()?;
        xshell::cmd!(sh, "docker stop -t 1 {name}")
            .read_with_err()
            .context("failed to stop container")?;
        Ok(())
    }

    fn kill(&self, container: &ContainerHandle) -> anyhow::Result<()> {
        let name = &container.name;
        let sh = xshell::Shell::new()?;
        xshell::cmd!(sh, "docker kill {name}")
            .read_with_err()
            .context("failed to kill container")?;
        Ok(())
    }

    fn logs(&self, container: &ContainerHandle) -> anyhow::Result<(String, String)> {
        // `docker logs` replays the container's stdout and stderr onto the
        // matching local streams, so the two arrive already separated.
        let output = Command::new("docker")
            .args(["logs", &container.name])
            .stdin(Stdio::null())
            .output()
            .context("failed to run docker logs")?;
        if !output.status.success() {
            anyhow::bail!(
                "docker logs failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok((
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    fn stats(&self, container: &ContainerHandle) -> anyhow::Result<MemorySample> {
        #[derive(serde::Deserialize)]
        struct StatsResponse {
            #[serde(default)]
            memory_stats: MemoryStats,
        }
        #[derive(Default, serde::Deserialize)]
        struct MemoryStats {
            #[serde(default)]
            usage: u64,
            #[serde(default)]
            limit: u64,
        }

        let body = self.api_get(&format!(
            "/containers/{}/stats?stream=false&one-shot=true",
            container.name
        ))?;
        let stats: StatsResponse =
            serde_json::from_slice(&body).context("invalid stats response")?;
        Ok(MemorySample { usage: stats.memory_stats.usage, limit: stats.memory_stats.limit })
    }

    fn oom_killed(&self, container: &ContainerHandle) -> anyhow::Result<bool> {
        let mut cmd = Command::new("docker");
        cmd.args(["inspect", "--format", "{{.State.OOMKilled}}", &container.name]);
        let output = run_with_output(cmd).context("failed to inspect container state")?;
        Ok(output.trim() == "true")
    }

    fn remove(&self, container: &ContainerHandle) -> anyhow::Result<()> {
        let name = &container.name;
        let sh = xshell::Shell::new()?;
        xshell::cmd!(sh, "docker rm -f {name}")
            .read_with_err()
            .context("failed to remove container")?;
        Ok(())
    }

    fn total_memory(&self) -> anyhow::Result<u64> {
        #[derive(serde::Deserialize)]
        struct Info {
            #[serde(rename = "MemTotal")]
            mem_total: u64,
        }
        let body = self.api_get("/info")?;
        let info: Info = serde_json::from_slice(&body).context("invalid docker info response")?;
        Ok(info.mem_total)
    }
}

fn run_with_output(mut cmd: Command) -> anyhow::Result<String> {
    tracing::debug!("Running: {cmd:?}");
    let output = cmd.output()?;
    match output.status.success() {
        true => Ok(String::from_utf8(output.stdout)?.trim().to_owned()),
        false => {
            anyhow::bail!("{cmd:?} failed with {}", String::from_utf8_lossy(&output.stderr))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        let mut env = IndexMap::new();
        env.insert("TOKEN".to_owned(), "abc".to_owned());
        let mut volumes = IndexMap::new();
        volumes.insert("/host/skill".to_owned(), VolumeBind::read_only("/dst/skill"));
        ContainerSpec {
            name: "c0".to_owned(),
            image: "img:latest".to_owned(),
            command: vec!["--print".to_owned(), "hi".to_owned()],
            entrypoint: None,
            env,
            volumes,
            mem_limit: "512m".to_owned(),
            network_mode: "bridge".to_owned(),
            working_dir: "/workspace".to_owned(),
        }
    }

    #[test]
    fn create_args_basic() {
        let args = create_args(&spec());
        assert_eq!(
            args,
            [
                "create", "--name", "c0", "--memory", "512m", "--memory-swap", "512m",
                "--network", "bridge", "--workdir", "/workspace", "-e", "TOKEN=abc",
                "-v", "/host/skill:/dst/skill:ro", "img:latest", "--print", "hi",
            ]
        );
    }

    #[test]
    fn create_args_entrypoint_words_lead_the_command() {
        let mut spec = spec();
        spec.entrypoint = Some(vec!["bash".to_owned(), "-c".to_owned()]);
        spec.command = vec!["echo hi".to_owned()];
        let args = create_args(&spec);

        let entry_pos = args.iter().position(|x| x == "--entrypoint").unwrap();
        assert_eq!(args[entry_pos + 1], "bash");
        let image_pos = args.iter().position(|x| x == "img:latest").unwrap();
        assert_eq!(&args[image_pos + 1..], ["-c", "echo hi"]);
    }

    #[test]
    fn container_names_are_unique() {
        let a = next_container_name();
        let b = next_container_name();
        assert_ne!(a, b);
        assert!(a.starts_with("skill-harness-"));
    }

    #[test]
    fn active_containers_register_unregister() {
        let active = ActiveContainers::default();
        let c = ContainerHandle { name: "c1".to_owned() };
        active.register(c.clone());
        assert!(active.contains("c1"));
        assert_eq!(active.snapshot().len(), 1);
        active.unregister(&c);
        assert!(!active.contains("c1"));
        assert!(active.snapshot().is_empty());
    }
}
