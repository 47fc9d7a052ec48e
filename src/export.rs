//! Plain-text and markdown output for the run path.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::{
    config::{ContainerConfig, ScenarioConfig, SkillConfig},
    runner::RunResult,
    telemetry::fmt_bytes,
};

const MAX_PROMPT_DISPLAY: usize = 200;

/// Renders one run result in the handoff format consumed by `evaluate`.
pub fn format_result_markdown(result: &RunResult) -> String {
    let error_display =
        result.error.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "none".to_owned());
    let peak_display = match result.peak_memory_bytes {
        0 => "N/A".to_owned(),
        peak => fmt_bytes(peak),
    };
    format!(
        "# {label}\n\
         \n\
         | Field | Value |\n\
         |-------|-------|\n\
         | Exit Code | {exit} |\n\
         | Duration | {duration:.1}s |\n\
         | Peak Memory | {peak_display} |\n\
         | Error | {error_display} |\n\
         \n\
         ## stdout\n\
         \n\
         ```\n\
         {stdout}\n\
         ```\n\
         \n\
         ## stderr\n\
         \n\
         ```\n\
         {stderr}\n\
         ```\n",
        label = result.label,
        exit = result.exit_code,
        duration = result.duration_seconds,
        stdout = result.stdout,
        stderr = result.stderr,
    )
}

/// Writes one result under `output_dir`. Matrix labels (`skill/scenario`)
/// become nested directories.
pub fn export_result(result: &RunResult, output_dir: &Path) -> anyhow::Result<PathBuf> {
    let path = output_dir.join(format!("{}.md", result.label));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create: {}", parent.display()))?;
    }
    std::fs::write(&path, format_result_markdown(result))
        .with_context(|| format!("failed to write: {}", path.display()))?;
    Ok(path)
}

pub fn export_results(results: &[RunResult], output_dir: &Path) -> anyhow::Result<()> {
    for result in results {
        export_result(result, output_dir)?;
    }
    Ok(())
}

/// Configuration preview printed by `--dry-run`.
pub fn format_dry_run(
    skills: &[SkillConfig],
    scenarios: &[ScenarioConfig],
    config: &ContainerConfig,
    max_workers: Option<usize>,
) -> String {
    let workers = match max_workers {
        Some(n) => n.to_string(),
        None => "auto".to_owned(),
    };
    let flags = match config.extra_flags.is_empty() {
        true => "(none)".to_owned(),
        false => config.extra_flags.join(" "),
    };
    let env = match config.env.is_empty() {
        true => "(none)".to_owned(),
        false => config.env.keys().cloned().collect::<Vec<_>>().join(" "),
    };
    let prompt = match config.prompt.char_indices().nth(MAX_PROMPT_DISPLAY) {
        Some((i, _)) => format!("{}...", &config.prompt[..i]),
        None => config.prompt.clone(),
    };

    let mut lines = vec![
        "Dry run".to_owned(),
        format!("  Image:    {}", config.image),
        format!("  Memory:   {}", config.mem_limit),
        format!("  Timeout:  {}s", config.timeout.as_secs()),
        format!("  Workers:  {workers}"),
        format!("  Flags:    {flags}"),
        format!("  Env:      {env}"),
        String::new(),
        "  Skills:".to_owned(),
    ];
    for skill in skills {
        lines.push(format!("    {}  {}", skill.name, skill.path.display()));
    }
    if !scenarios.is_empty() {
        lines.push("  Scenarios:".to_owned());
        for scenario in scenarios {
            lines.push(format!("    {}  {}", scenario.name, scenario.path.display()));
        }
        lines.push(format!(
            "  Matrix:   {} skills x {} scenarios = {} containers",
            skills.len(),
            scenarios.len(),
            skills.len() * scenarios.len()
        ));
    }
    lines.push(String::new());
    lines.push(format!("  Prompt:   {prompt}"));
    lines.join("\n")
}

/// Final batch summary.
pub fn format_summary(results: &[RunResult], total_duration: f64) -> String {
    let succeeded = results.iter().filter(|r| r.succeeded()).count();
    let errors = results.len() - succeeded;
    let mut lines = vec![
        format!(
            "Total: {} | Succeeded: {succeeded} | Errors: {errors}",
            results.len()
        ),
        format!("Duration: {total_duration:.1}s"),
        String::new(),
    ];
    for result in results {
        let status = match &result.error {
            None => "OK".to_owned(),
            Some(error) => format!("ERROR ({error})"),
        };
        let peak = match result.peak_memory_bytes {
            0 => String::new(),
            peak => format!(" peak:{}", fmt_bytes(peak)),
        };
        lines.push(format!(
            "  {}: {status} ({:.1}s{peak})",
            result.label, result.duration_seconds
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunError;
    use indexmap::IndexMap;
    use std::time::Duration;

    fn make_result(label: &str) -> RunResult {
        RunResult {
            label: label.to_owned(),
            exit_code: 0,
            stdout: "hello world".to_owned(),
            stderr: "some warning".to_owned(),
            duration_seconds: 5.3,
            error: None,
            peak_memory_bytes: 0,
        }
    }

    #[test]
    fn markdown_contains_all_fields() {
        let mut result = make_result("test-skill");
        result.exit_code = 137;
        result.duration_seconds = 12.5;
        result.error = Some(RunError::OomKilled);
        result.peak_memory_bytes = 343 * 1024 * 1024;

        let md = format_result_markdown(&result);
        assert!(md.starts_with("# test-skill\n"));
        assert!(md.contains("| Exit Code | 137 |"));
        assert!(md.contains("| Duration | 12.5s |"));
        assert!(md.contains("| Peak Memory | 343M |"));
        assert!(md.contains("| Error | oom_killed |"));
        assert!(md.contains("## stdout\n\n```\nhello world\n```"));
        assert!(md.contains("## stderr\n\n```\nsome warning\n```"));
    }

    #[test]
    fn markdown_defaults_for_success() {
        let md = format_result_markdown(&make_result("my-skill"));
        assert!(md.contains("| Error | none |"));
        assert!(md.contains("| Peak Memory | N/A |"));
    }

    #[test]
    fn export_writes_file() {
        let tmp = tempfile::tempdir().unwrap();
        export_results(&[make_result("my-skill")], tmp.path()).unwrap();
        let content = std::fs::read_to_string(tmp.path().join("my-skill.md")).unwrap();
        assert!(content.contains("# my-skill"));
        assert!(content.contains("hello world"));
    }

    #[test]
    fn matrix_label_creates_subdirectory() {
        let tmp = tempfile::tempdir().unwrap();
        export_results(&[make_result("code-review/missing-null-check")], tmp.path()).unwrap();
        let path = tmp.path().join("code-review").join("missing-null-check.md");
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("# code-review/missing-null-check"));
    }

    fn make_config() -> ContainerConfig {
        ContainerConfig {
            image: "my-image:latest".to_owned(),
            mem_limit: "512m".to_owned(),
            mem_limit_bytes: 512 * 1024 * 1024,
            timeout: Duration::from_secs(300),
            env: IndexMap::new(),
            prompt: "Do the thing".to_owned(),
            extra_flags: vec![],
            extra_volumes: IndexMap::new(),
        }
    }

    #[test]
    fn dry_run_shows_config_and_matrix() {
        let skills = vec![
            SkillConfig { path: "/tmp/a".into(), name: "alpha".into() },
            SkillConfig { path: "/tmp/b".into(), name: "beta".into() },
        ];
        let scenarios = vec![
            ScenarioConfig { path: "/tmp/s1".into(), name: "s1".into() },
            ScenarioConfig { path: "/tmp/s2".into(), name: "s2".into() },
            ScenarioConfig { path: "/tmp/s3".into(), name: "s3".into() },
        ];
        let text = format_dry_run(&skills, &scenarios, &make_config(), None);
        assert!(text.contains("my-image:latest"));
        assert!(text.contains("512m"));
        assert!(text.contains("300s"));
        assert!(text.contains("auto"));
        assert!(text.contains("alpha"));
        assert!(text.contains("2 skills x 3 scenarios = 6 containers"));
        assert!(text.contains("Do the thing"));
    }

    #[test]
    fn dry_run_truncates_long_prompt() {
        let skills = vec![SkillConfig { path: "/tmp/a".into(), name: "s".into() }];
        let mut config = make_config();
        config.prompt = "x".repeat(300);
        let text = format_dry_run(&skills, &[], &config, Some(4));
        assert!(text.contains("..."));
        assert!(!text.contains(&"x".repeat(201)));
        assert!(text.contains("Workers:  4"));
    }

    #[test]
    fn summary_counts_errors() {
        let ok = make_result("skill-a");
        let mut oom = make_result("skill-b");
        oom.error = Some(RunError::OomKilled);
        oom.peak_memory_bytes = 2 * 1024 * 1024 * 1024;
        let text = format_summary(&[ok, oom], 15.0);
        assert!(text.contains("Total: 2 | Succeeded: 1 | Errors: 1"));
        assert!(text.contains("skill-a: OK"));
        assert!(text.contains("skill-b: ERROR (oom_killed)"));
        assert!(text.contains("peak:2.0G"));
    }
}
