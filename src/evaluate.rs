//! Scoring of run results against per-scenario ground truth.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::llm::{self, MatchClient};

/// A single issue reported by the agent.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Finding {
    pub category: String,
    pub severity: String,
    pub confidence: i64,
    pub file: String,
    /// Inclusive line range.
    pub line_range: (i64, i64),
    pub description: String,
    pub reasoning: String,
}

/// An expected finding from ground truth.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExpectedFinding {
    pub category: String,
    pub severity: String,
    pub file: String,
    pub line_range: (i64, i64),
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Sibling indices scored as equivalent: matching any member of the
    /// group credits the whole group.
    #[serde(default)]
    pub consolidated_with: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct GroundTruth {
    pub expected_findings: Vec<ExpectedFinding>,
    pub expected_clean: bool,
    pub max_acceptable_findings: i64,
    pub language: String,
    pub difficulty: String,
}

pub fn load_ground_truth(scenario_dir: &Path) -> anyhow::Result<GroundTruth> {
    #[derive(Default, serde::Deserialize)]
    struct Metadata {
        #[serde(default)]
        language: String,
        #[serde(default)]
        difficulty: String,
    }
    #[derive(serde::Deserialize)]
    struct Raw {
        #[serde(default)]
        expected_findings: Vec<ExpectedFinding>,
        expected_clean: bool,
        max_acceptable_findings: i64,
        #[serde(default)]
        metadata: Metadata,
    }

    let path = scenario_dir.join("ground_truth.json");
    let bytes =
        std::fs::read(&path).with_context(|| format!("failed to read: {}", path.display()))?;
    let raw: Raw = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse: {}", path.display()))?;
    Ok(GroundTruth {
        expected_findings: raw.expected_findings,
        expected_clean: raw.expected_clean,
        max_acceptable_findings: raw.max_acceptable_findings,
        language: raw.metadata.language,
        difficulty: raw.metadata.difficulty,
    })
}

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\|[ \t]*Duration[ \t]*\|[ \t]*([0-9][0-9.]*)s[ \t]*\|").unwrap());

fn stdout_block(text: &str) -> Option<&str> {
    let start = text.find("## stdout")?;
    let rest = &text[start..];
    let end = rest.find("## stderr")?;
    Some(&rest[..end])
}

// Two anchored searches instead of one greedy pattern: the stdout block is
// itself fenced, so a single regex would swallow the outer fence.
fn inner_json_fence(block: &str) -> Option<&str> {
    let start = block.find("```json")?;
    let after = &block[start + "```json".len()..];
    let content = &after[after.find('\n')? + 1..];
    Some(&content[..content.find("\n```")?])
}

/// Extracts the findings JSON and the run duration from a result document.
/// A missing or malformed findings block yields an empty list; the duration
/// is still reported.
pub fn parse_result_markdown(text: &str) -> (Vec<Finding>, f64) {
    #[derive(serde::Deserialize)]
    struct Doc {
        #[serde(default)]
        findings: Vec<Finding>,
    }

    let duration = DURATION_RE
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .unwrap_or(0.0);

    let findings = stdout_block(text)
        .and_then(inner_json_fence)
        .and_then(|json| serde_json::from_str::<Doc>(json).ok())
        .map(|doc| doc.findings)
        .unwrap_or_default();

    (findings, duration)
}

pub fn ranges_overlap(a: (i64, i64), b: (i64, i64)) -> bool {
    a.0 <= b.1 && b.0 <= a.1
}

/// First matching stage: same file and overlapping line ranges. Scans
/// expected entries in order, skipping indices already claimed by an earlier
/// finding.
pub fn match_deterministic(
    findings: &[Finding],
    expected: &[ExpectedFinding],
) -> Vec<Option<usize>> {
    let mut claimed = BTreeSet::new();
    findings
        .iter()
        .map(|finding| {
            let hit = expected.iter().enumerate().find(|(i, candidate)| {
                !claimed.contains(i)
                    && candidate.file == finding.file
                    && ranges_overlap(finding.line_range, candidate.line_range)
            });
            hit.map(|(i, _)| {
                claimed.insert(i);
                i
            })
        })
        .collect()
}

/// Full matching: the deterministic stage, then an LLM pass over whatever is
/// left. The LLM sees only the residual findings and the unclaimed expected
/// entries (original indices preserved, keywords withheld).
pub async fn match_findings(
    findings: &[Finding],
    expected: &[ExpectedFinding],
    client: &dyn MatchClient,
    model: &str,
) -> anyhow::Result<Vec<Option<usize>>> {
    let mut matches = match_deterministic(findings, expected);

    let mut claimed: BTreeSet<usize> = matches.iter().flatten().copied().collect();
    let residual: Vec<usize> = matches
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_none())
        .map(|(i, _)| i)
        .collect();
    let remaining: Vec<(usize, &ExpectedFinding)> = expected
        .iter()
        .enumerate()
        .filter(|(i, _)| !claimed.contains(i))
        .collect();
    if residual.is_empty() || remaining.is_empty() {
        return Ok(matches);
    }

    let residual_findings: Vec<&Finding> = residual.iter().map(|&i| &findings[i]).collect();
    let prompt = llm::build_match_prompt(&residual_findings, &remaining);
    let decision = client.request_matches(model, &prompt).await?;
    tracing::debug!("match reasoning: {}", decision.reasoning);
    if decision.matches.len() != residual.len() {
        anyhow::bail!(
            "matcher returned {} entries for {} findings",
            decision.matches.len(),
            residual.len()
        );
    }

    for (&slot, matched) in residual.iter().zip(decision.matches) {
        match matched {
            Some(index) if index < expected.len() && !claimed.contains(&index) => {
                claimed.insert(index);
                matches[slot] = Some(index);
            }
            Some(index) => {
                tracing::warn!("dropping invalid match to expected index {index}");
            }
            None => {}
        }
    }
    Ok(matches)
}

pub fn precision(tp: usize, fp: usize) -> f64 {
    match tp + fp {
        0 => 1.0,
        denom => tp as f64 / denom as f64,
    }
}

pub fn recall(tp: usize, fn_: usize) -> f64 {
    match tp + fn_ {
        0 => 1.0,
        denom => tp as f64 / denom as f64,
    }
}

/// F-measure weighted toward precision (beta^2 = 0.25).
pub fn f05(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        return 0.0;
    }
    1.25 * precision * recall / (0.25 * precision + recall)
}

/// Counts near-identical finding pairs: same file, both range endpoints
/// within three lines of each other.
pub fn count_duplicates(findings: &[Finding]) -> usize {
    let mut duplicates = 0;
    for (i, a) in findings.iter().enumerate() {
        for b in &findings[i + 1..] {
            if a.file == b.file
                && (a.line_range.0 - b.line_range.0).abs() <= 3
                && (a.line_range.1 - b.line_range.1).abs() <= 3
            {
                duplicates += 1;
            }
        }
    }
    duplicates
}

/// Evaluation result for a single (scenario, skill) pair.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScenarioResult {
    pub scenario_name: String,
    pub skill_name: String,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub f05: f64,
    pub duplicates: usize,
    pub duration_seconds: f64,
    pub findings: Vec<Finding>,
    pub matched_expected: Vec<usize>,
    pub unmatched_findings: Vec<Finding>,
}

/// Computes counts and metrics from a matches vector.
///
/// Matching one member of a consolidated group credits every member, so TP
/// can exceed the number of matched findings; FN is clamped at zero when
/// consolidation credits cover the full expected list.
pub fn score_scenario(
    scenario_name: &str,
    skill_name: &str,
    findings: Vec<Finding>,
    ground_truth: &GroundTruth,
    matches: &[Option<usize>],
    duration: f64,
) -> ScenarioResult {
    let expected = &ground_truth.expected_findings;
    let matched: BTreeSet<usize> = matches.iter().flatten().copied().collect();
    let mut credited = matched.clone();
    for &index in &matched {
        credited.extend(
            expected[index]
                .consolidated_with
                .iter()
                .copied()
                .filter(|&i| i < expected.len()),
        );
    }

    let tp = credited.len();
    let fp = matches.iter().filter(|m| m.is_none()).count();
    let fn_ = expected.len().saturating_sub(tp);
    let precision = precision(tp, fp);
    let recall = recall(tp, fn_);
    let unmatched: Vec<Finding> = findings
        .iter()
        .zip(matches)
        .filter(|(_, m)| m.is_none())
        .map(|(f, _)| f.clone())
        .collect();

    ScenarioResult {
        scenario_name: scenario_name.to_owned(),
        skill_name: skill_name.to_owned(),
        true_positives: tp,
        false_positives: fp,
        false_negatives: fn_,
        precision,
        recall,
        f05: f05(precision, recall),
        duplicates: count_duplicates(&findings),
        duration_seconds: duration,
        matched_expected: credited.into_iter().collect(),
        unmatched_findings: unmatched,
        findings,
    }
}

/// Returns trial subdirectories (`trial-1`, `trial-2`, ...) in trial order,
/// or `None` when the results directory is single-trial.
pub fn find_trial_dirs(results_root: &Path) -> anyhow::Result<Option<Vec<PathBuf>>> {
    static TRIAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^trial-([0-9]+)$").unwrap());

    let mut trials: Vec<(u64, PathBuf)> = vec![];
    for entry in std::fs::read_dir(results_root)
        .with_context(|| format!("failed to read: {}", results_root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(captures) = TRIAL_RE.captures(&name.to_string_lossy()) {
            let n: u64 = captures[1].parse().unwrap_or(0);
            trials.push((n, entry.path()));
        }
    }
    if trials.is_empty() {
        return Ok(None);
    }
    trials.sort_by_key(|(n, _)| *n);
    Ok(Some(trials.into_iter().map(|(_, path)| path).collect()))
}

/// Result markdown files under a results directory, as (skill, file) pairs.
/// Accepts either per-skill subdirectories or a flat directory of `.md`
/// files (in which case the directory's own name is the skill).
fn collect_result_files(results_root: &Path) -> Vec<(String, PathBuf)> {
    let root_name = results_root
        .file_name()
        .map(|x| x.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut files = vec![];
    for entry in walkdir::WalkDir::new(results_root)
        .min_depth(1)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().map(|x| x != "md").unwrap_or(true) {
            continue;
        }
        let skill = match entry.depth() {
            1 => root_name.clone(),
            _ => path
                .parent()
                .and_then(|p| p.file_name())
                .map(|x| x.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        files.push((skill, path.to_path_buf()));
    }
    files
}

/// Scores every result file under `results_root` against ground truth.
///
/// Result files whose scenario has no `ground_truth.json` are skipped. All
/// LLM fallback calls are issued concurrently; a matcher protocol error
/// aborts the evaluation.
pub async fn evaluate_results(
    results_root: &Path,
    scenarios_dir: &Path,
    client: &dyn MatchClient,
    model: &str,
) -> anyhow::Result<Vec<ScenarioResult>> {
    struct Entry {
        scenario_name: String,
        skill_name: String,
        findings: Vec<Finding>,
        ground_truth: GroundTruth,
        duration: f64,
    }

    let mut entries = vec![];
    for (skill_name, md_file) in collect_result_files(results_root) {
        let scenario_name = md_file
            .file_stem()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_default();
        let scenario_dir = scenarios_dir.join(&scenario_name);
        if !scenario_dir.join("ground_truth.json").is_file() {
            tracing::debug!("no ground truth for {scenario_name}, skipping");
            continue;
        }
        let text = std::fs::read_to_string(&md_file)
            .with_context(|| format!("failed to read: {}", md_file.display()))?;
        let (findings, duration) = parse_result_markdown(&text);
        let ground_truth = load_ground_truth(&scenario_dir)?;
        entries.push(Entry { scenario_name, skill_name, findings, ground_truth, duration });
    }

    let tasks = entries.iter().map(|entry| async move {
        let matches = match_findings(
            &entry.findings,
            &entry.ground_truth.expected_findings,
            client,
            model,
        )
        .await
        .with_context(|| format!("error matching {}/{}", entry.skill_name, entry.scenario_name))?;
        Ok::<ScenarioResult, anyhow::Error>(score_scenario(
            &entry.scenario_name,
            &entry.skill_name,
            entry.findings.clone(),
            &entry.ground_truth,
            &matches,
            entry.duration,
        ))
    });

    futures::future::join_all(tasks)
        .await
        .into_iter()
        .collect()
}
