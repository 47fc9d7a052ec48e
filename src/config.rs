use std::{path::{Path, PathBuf}, time::Duration};

use anyhow::Context;
use indexmap::IndexMap;

use crate::docker::VolumeBind;

/// Validation errors raised before any container is created.
#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("path does not exist: {}", .0.display())]
    PathMissing(PathBuf),
    #[error("path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("scenario is missing setup.sh: {}", .0.display())]
    SetupScriptMissing(PathBuf),
    #[error("invalid memory string: {0:?} (expected e.g. \"512m\" or \"1g\")")]
    InvalidMemoryString(String),
    #[error("invalid environment pair: {0:?} (expected KEY=VALUE with a non-empty key)")]
    InvalidEnvPair(String),
    #[error("trial directories disagree on skills: {0}")]
    TrialSkillMismatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillConfig {
    pub path: PathBuf,
    pub name: String,
}

impl SkillConfig {
    /// The on-disk directory name, independent of any `--name` override.
    pub fn dirname(&self) -> String {
        self.path
            .file_name()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioConfig {
    pub path: PathBuf,
    pub name: String,
}

/// Shared settings for every container in a batch.
#[derive(Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub mem_limit: String,
    pub mem_limit_bytes: u64,
    pub timeout: Duration,
    pub env: IndexMap<String, String>,
    pub prompt: String,
    pub extra_flags: Vec<String>,
    pub extra_volumes: IndexMap<String, VolumeBind>,
}

fn resolve_dir(path: &Path) -> Result<PathBuf, PreflightError> {
    if !path.exists() {
        return Err(PreflightError::PathMissing(path.to_path_buf()));
    }
    if !path.is_dir() {
        return Err(PreflightError::NotADirectory(path.to_path_buf()));
    }
    path.canonicalize()
        .map_err(|_| PreflightError::PathMissing(path.to_path_buf()))
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|x| x.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Validates skill directories, preserving input order.
pub fn discover_skills(
    paths: &[PathBuf],
    name_override: Option<&str>,
) -> Result<Vec<SkillConfig>, PreflightError> {
    let mut skills = Vec::with_capacity(paths.len());
    for path in paths {
        let resolved = resolve_dir(path)?;
        let name = match name_override {
            Some(name) => name.to_owned(),
            None => dir_name(&resolved),
        };
        skills.push(SkillConfig { path: resolved, name });
    }
    Ok(skills)
}

/// Validates scenario directories. Each must carry an executable `setup.sh`.
pub fn discover_scenarios(paths: &[PathBuf]) -> Result<Vec<ScenarioConfig>, PreflightError> {
    let mut scenarios = Vec::with_capacity(paths.len());
    for path in paths {
        let resolved = resolve_dir(path)?;
        let setup = resolved.join("setup.sh");
        if !setup.is_file() {
            return Err(PreflightError::SetupScriptMissing(resolved));
        }
        let name = dir_name(&resolved);
        scenarios.push(ScenarioConfig { path: resolved, name });
    }
    Ok(scenarios)
}

/// Resolves a prompt argument: an existing file is read (trimmed), anything
/// else is used verbatim.
pub fn load_prompt(arg: &str) -> anyhow::Result<String> {
    let path = Path::new(arg);
    if path.is_file() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt file: {}", path.display()))?;
        return Ok(text.trim().to_owned());
    }
    Ok(arg.to_owned())
}

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Converts a human memory limit such as `512m` or `1g` to bytes.
pub fn parse_mem_string(mem: &str) -> Result<u64, PreflightError> {
    static PATTERN: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new("^([0-9]+)([mMgG])$").unwrap());

    let captures = PATTERN
        .captures(mem)
        .ok_or_else(|| PreflightError::InvalidMemoryString(mem.to_owned()))?;
    let amount: u64 = captures[1]
        .parse()
        .map_err(|_| PreflightError::InvalidMemoryString(mem.to_owned()))?;
    let multiplier = match &captures[2] {
        "m" | "M" => MIB,
        _ => GIB,
    };
    Ok(amount * multiplier)
}

/// Worker capacity from host memory, keeping 20% headroom for the host.
pub fn max_workers(total_memory: u64, per_container: u64) -> usize {
    let capacity = (total_memory as f64 * 0.8 / per_container as f64) as usize;
    capacity.max(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    /// Parses `KEY=VALUE`, splitting at the first `=`. The value may contain
    /// further `=` characters and may be empty; the key may not.
    pub fn parse(input: &str) -> Result<Self, PreflightError> {
        let pos = input
            .find('=')
            .ok_or_else(|| PreflightError::InvalidEnvPair(input.to_owned()))?;
        let (key, value) = input.split_at(pos);
        if key.is_empty() {
            return Err(PreflightError::InvalidEnvPair(input.to_owned()));
        }
        Ok(Self { key: key.to_owned(), value: value[1..].to_owned() })
    }
}

/// Parses repeated `-e KEY=VALUE` arguments into an ordered map.
pub fn parse_env_pairs(pairs: &[String]) -> Result<IndexMap<String, String>, PreflightError> {
    let mut env = IndexMap::new();
    for pair in pairs {
        let kv = KeyValue::parse(pair)?;
        env.insert(kv.key, kv.value);
    }
    Ok(env)
}

/// Loads a dotenv-style file. Blank lines and `#` comments are skipped. A
/// missing file yields an empty map.
pub fn load_env_file(path: &Path) -> anyhow::Result<IndexMap<String, String>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(IndexMap::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to read: {}", path.display())),
    };

    let mut env = IndexMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match KeyValue::parse(line) {
            Ok(kv) => {
                env.insert(kv.key, kv.value);
            }
            Err(_) => tracing::warn!("ignoring malformed line in {}: {line:?}", path.display()),
        }
    }
    Ok(env)
}

const ADC_CONTAINER_PATH: &str =
    "/home/claude/.config/gcloud/application_default_credentials.json";

fn adc_path() -> Option<PathBuf> {
    let config_dir = match std::env::var_os("CLOUDSDK_CONFIG") {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(std::env::var_os("HOME")?).join(".config/gcloud"),
    };
    Some(config_dir.join("application_default_credentials.json"))
}

/// Resolves agent credentials into container environment variables plus any
/// extra read-only mounts they require.
///
/// An OAuth token wins; otherwise a Vertex configuration is forwarded along
/// with the gcloud application-default credentials file. The process
/// environment takes precedence over the env file.
pub fn resolve_auth(
    env_file: &IndexMap<String, String>,
) -> anyhow::Result<(IndexMap<String, String>, IndexMap<String, VolumeBind>)> {
    let lookup =
        |key: &str| std::env::var(key).ok().or_else(|| env_file.get(key).cloned());
    resolve_auth_from(lookup, adc_path().filter(|p| p.is_file()))
}

fn resolve_auth_from(
    lookup: impl Fn(&str) -> Option<String>,
    adc: Option<PathBuf>,
) -> anyhow::Result<(IndexMap<String, String>, IndexMap<String, VolumeBind>)> {
    if let Some(token) = lookup("CLAUDE_CODE_OAUTH_TOKEN") {
        if !token.is_empty() {
            let mut env = IndexMap::new();
            env.insert("CLAUDE_CODE_OAUTH_TOKEN".to_owned(), token);
            return Ok((env, IndexMap::new()));
        }
    }

    if lookup("CLAUDE_CODE_USE_VERTEX").is_some() {
        let mut env = IndexMap::new();
        env.insert("CLAUDE_CODE_USE_VERTEX".to_owned(), "1".to_owned());
        for key in [
            "CLOUD_ML_REGION",
            "ANTHROPIC_VERTEX_PROJECT_ID",
            "ANTHROPIC_MODEL",
            "ANTHROPIC_SMALL_FAST_MODEL",
            "CLAUDE_CODE_SUBAGENT_MODEL",
            "CLAUDE_CODE_DISABLE_NONESSENTIAL_TRAFFIC",
        ] {
            if let Some(value) = lookup(key) {
                env.insert(key.to_owned(), value);
            }
        }

        let adc = adc.ok_or_else(|| {
            anyhow::format_err!(
                "Vertex auth selected but no application default credentials found; \
                 run `gcloud auth application-default login`"
            )
        })?;
        let mut volumes = IndexMap::new();
        volumes.insert(
            adc.to_string_lossy().into_owned(),
            VolumeBind { bind: ADC_CONTAINER_PATH.to_owned(), mode: "ro".to_owned() },
        );
        return Ok((env, volumes));
    }

    anyhow::bail!(
        "no credentials found: set CLAUDE_CODE_OAUTH_TOKEN or configure Vertex \
         (CLAUDE_CODE_USE_VERTEX) in the environment or env file"
    )
}
