use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use indexmap::IndexMap;

use crate::{
    config::ContainerConfig,
    docker::ContainerRuntime,
    runner::{ContainerStatus, RunResult},
    telemetry::TelemetrySample,
    utils::Shutdown,
    worker::Observer,
};

mod config;
mod docker;
mod evaluate;
mod export;
mod llm;
mod report;
mod runner;
mod telemetry;
mod utils;
mod worker;

#[derive(clap::Parser)]
#[clap(name = "skill-harness", about = "Run agent skills in containers and score the results")]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run each skill (optionally across scenarios) in a container.
    Run(RunArgs),
    /// Score exported run results against per-scenario ground truth.
    Evaluate(EvaluateArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Skill directories.
    #[clap(required = true)]
    skills: Vec<PathBuf>,

    /// Prompt text, or a path to a file containing it.
    #[clap(long)]
    prompt: String,

    /// Container image to run.
    #[clap(long, default_value = "docker-skill-evaluator:minimal")]
    image: String,

    /// Per-container memory limit (e.g. 512m, 1g).
    #[clap(long, default_value = "1g")]
    memory: String,

    /// Per-container wall clock timeout in seconds.
    #[clap(long, default_value_t = 300)]
    timeout: u64,

    /// Worker cap. Defaults to a limit derived from host memory.
    #[clap(long)]
    max_workers: Option<usize>,

    /// File with KEY=VALUE lines loaded before credential resolution.
    #[clap(long, default_value = ".env", value_name = "FILE")]
    env_file: PathBuf,

    /// Extra KEY=VALUE environment pairs for the container.
    #[clap(short = 'e', long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Extra agent command line flags, shell-split.
    #[clap(long, default_value = "")]
    flags: String,

    /// Scenario directories. Each must contain a setup.sh.
    #[clap(long, num_args = 1.., value_name = "DIR")]
    scenario: Vec<PathBuf>,

    /// Directory for result markdown files.
    #[clap(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Repeat the full matrix this many times, partitioning the output by
    /// trial-<n>/.
    #[clap(long, default_value_t = 1)]
    trials: usize,

    /// Display name override for the skills.
    #[clap(long)]
    name: Option<String>,

    /// Print the resolved configuration without touching the runtime.
    #[clap(long)]
    dry_run: bool,

    /// Dump each run's stdout and stderr after the batch.
    #[clap(long)]
    verbose: bool,
}

#[derive(clap::Args)]
struct EvaluateArgs {
    /// Results directory: per-skill subdirectories of .md files, or
    /// trial-<n>/ subdirectories for multi-trial runs.
    results: PathBuf,

    /// Directory of scenario directories with ground_truth.json files.
    #[clap(long, value_name = "DIR")]
    scenarios: PathBuf,

    /// Model used for the fallback matching pass.
    #[clap(long, default_value = llm::DEFAULT_MODEL)]
    model: String,

    /// Report JSON path.
    #[clap(long, default_value = "report.json", value_name = "FILE")]
    output: PathBuf,

    /// File with KEY=VALUE lines (read for MISTRAL_API_KEY).
    #[clap(long, default_value = ".env", value_name = "FILE")]
    env_file: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_env_var("RUST_LOG")
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("interrupt received, shutting down");
            shutdown.trigger();
        })
        .unwrap();
    }

    let result = match &args.command {
        Command::Run(run_args) => run_cmd(run_args, shutdown),
        Command::Evaluate(evaluate_args) => evaluate_cmd(evaluate_args),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run_cmd(args: &RunArgs, shutdown: Arc<Shutdown>) -> anyhow::Result<ExitCode> {
    anyhow::ensure!(args.trials >= 1, "--trials must be at least 1");

    let env_file = config::load_env_file(&args.env_file)?;
    let skills = config::discover_skills(&args.skills, args.name.as_deref())?;
    let scenarios = config::discover_scenarios(&args.scenario)?;
    let prompt = config::load_prompt(&args.prompt)?;
    let mem_limit_bytes = config::parse_mem_string(&args.memory)?;
    let extra_flags = shlex::split(&args.flags)
        .ok_or_else(|| anyhow::format_err!("invalid --flags value: {:?}", args.flags))?;

    let (mut env, extra_volumes) = config::resolve_auth(&env_file)?;
    env.extend(config::parse_env_pairs(&args.env)?);

    let container_config = ContainerConfig {
        image: args.image.clone(),
        mem_limit: args.memory.clone(),
        mem_limit_bytes,
        timeout: Duration::from_secs(args.timeout),
        env,
        prompt,
        extra_flags,
        extra_volumes,
    };

    if args.dry_run {
        println!(
            "{}",
            export::format_dry_run(&skills, &scenarios, &container_config, args.max_workers)
        );
        return Ok(ExitCode::SUCCESS);
    }

    let total_pairs = skills.len() * scenarios.len().max(1) * args.trials;
    let observer = Arc::new(build_observer(total_pairs)?);
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker::DockerCli::new());

    let start = std::time::Instant::now();
    let mut all_results: Vec<RunResult> = vec![];
    for trial in 1..=args.trials {
        if shutdown.is_set() {
            break;
        }
        if args.trials > 1 {
            tracing::info!("trial {trial}/{}", args.trials);
        }
        let results = worker::run_matrix(
            &skills,
            &scenarios,
            &container_config,
            runtime.clone(),
            observer.clone(),
            shutdown.clone(),
            args.max_workers,
        )?;
        if let Some(output) = &args.output {
            let dir = match args.trials {
                1 => output.clone(),
                _ => output.join(format!("trial-{trial}")),
            };
            export::export_results(&results, &dir)?;
            tracing::info!("results written to {}", dir.display());
        }
        all_results.extend(results);
    }
    drop(observer);

    println!("{}", export::format_summary(&all_results, start.elapsed().as_secs_f64()));
    if args.verbose {
        for result in &all_results {
            println!("\n--- {} ---", result.label);
            if !result.stdout.is_empty() {
                println!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprintln!("{}", result.stderr);
            }
        }
    }

    match all_results.iter().all(RunResult::succeeded) {
        true => Ok(ExitCode::SUCCESS),
        false => Ok(ExitCode::FAILURE),
    }
}

enum UiEvent {
    Status(ContainerStatus),
    Telemetry(TelemetrySample),
}

/// Builds the host observer: workers and the poller publish onto channels,
/// and a single aggregator thread owns the status map and the progress log.
fn build_observer(total: usize) -> anyhow::Result<Observer> {
    let (tx, rx) = crossbeam_channel::unbounded::<UiEvent>();
    std::thread::Builder::new()
        .name("status-aggregator".to_owned())
        .spawn(move || aggregator_loop(rx, total))?;

    let status_tx = tx.clone();
    let telemetry_tx = tx;
    Ok(Observer::new(move |status| {
        let _ = status_tx.send(UiEvent::Status(status));
    })
    .with_on_telemetry(move |sample| {
        let _ = telemetry_tx.send(UiEvent::Telemetry(sample));
    }))
}

fn aggregator_loop(rx: crossbeam_channel::Receiver<UiEvent>, total: usize) {
    let mut statuses: IndexMap<String, ContainerStatus> = IndexMap::new();
    let mut done = 0usize;
    for event in rx {
        match event {
            UiEvent::Status(status) => {
                let memory = match status.memory_usage.is_empty() {
                    true => String::new(),
                    false => format!(", {}", status.memory_usage),
                };
                if status.state.is_terminal() {
                    done += 1;
                    tracing::info!(
                        "[{done}/{total}] {}: {} ({:.1}s{memory})",
                        status.label,
                        status.state,
                        status.duration_seconds,
                    );
                } else {
                    tracing::info!("{}: {}", status.label, status.state);
                }
                if !status.container_name.is_empty() {
                    statuses.insert(status.container_name.clone(), status);
                }
            }
            UiEvent::Telemetry(sample) => {
                let memory = telemetry::format_memory(sample.usage, sample.limit);
                if let Some(row) = statuses.get_mut(&sample.container) {
                    row.memory_usage = memory.clone();
                    tracing::debug!("{}: {} ({memory})", row.label, row.state);
                }
            }
        }
    }
}

fn evaluate_cmd(args: &EvaluateArgs) -> anyhow::Result<ExitCode> {
    let env_file = config::load_env_file(&args.env_file)?;
    let api_key = std::env::var("MISTRAL_API_KEY")
        .ok()
        .or_else(|| env_file.get("MISTRAL_API_KEY").cloned())
        .unwrap_or_default();
    let client = llm::MistralClient::new(api_key)?;

    // Container runs are thread-blocking, but the matcher batches its LLM
    // calls on a cooperative runtime.
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    match evaluate::find_trial_dirs(&args.results)? {
        None => {
            let results = runtime.block_on(evaluate::evaluate_results(
                &args.results,
                &args.scenarios,
                &client,
                &args.model,
            ))?;
            println!("{}", report::format_report(&results));
            report::export_report_json(&results, &args.output)?;
        }
        Some(trial_dirs) => {
            let mut trials = vec![];
            for dir in &trial_dirs {
                trials.push(runtime.block_on(evaluate::evaluate_results(
                    dir,
                    &args.scenarios,
                    &client,
                    &args.model,
                ))?);
            }
            let rows = report::aggregate_trials(&trials)?;
            println!("{}", report::format_trial_report(trials.len(), &rows));
            report::export_trial_report_json(&trials, &rows, &args.output)?;
        }
    }
    tracing::info!("report written to {}", args.output.display());
    Ok(ExitCode::SUCCESS)
}

pub trait XShellExt {
    /// Runs a command, returning stdout on success, and including stderr in
    /// the error message.
    fn read_with_err(self) -> anyhow::Result<String>;

    /// Echos the command to tracing.
    fn trace_cmd(self) -> Self;
}

impl<'a> XShellExt for xshell::Cmd<'a> {
    fn read_with_err(self) -> anyhow::Result<String> {
        let cmd = format!("{}", self);
        let output = self.trace_cmd().ignore_status().output()?;
        match output.status.success() {
            true => Ok(String::from_utf8(output.stdout)?),
            false => {
                anyhow::bail!("`{cmd}` failed with {}", String::from_utf8_lossy(&output.stderr))
            }
        }
    }

    fn trace_cmd(self) -> Self {
        tracing::debug!("$ {}", self);
        self
    }
}
