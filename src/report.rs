//! Evaluation reports: plain-text tables and JSON export, including the
//! multi-trial aggregation.

use std::{collections::HashMap, path::Path};

use anyhow::Context;

use crate::{
    config::PreflightError,
    evaluate::{f05, precision, recall, ScenarioResult},
};

/// Mean and population standard deviation across trials.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricStats {
    pub mean: f64,
    pub std: f64,
}

impl MetricStats {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self { mean: 0.0, std: 0.0 };
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        Self { mean, std: variance.sqrt() }
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[derive(serde::Serialize)]
struct Aggregate {
    total_tp: usize,
    total_fp: usize,
    total_fn: usize,
    total_duplicates: usize,
    precision: f64,
    recall: f64,
    f05: f64,
    avg_duration: f64,
    median_duration: f64,
}

// Counts aggregate across scenarios; the ratios are recomputed from the
// summed counts rather than averaged.
fn aggregate(results: &[ScenarioResult]) -> Aggregate {
    let total_tp: usize = results.iter().map(|r| r.true_positives).sum();
    let total_fp: usize = results.iter().map(|r| r.false_positives).sum();
    let total_fn: usize = results.iter().map(|r| r.false_negatives).sum();
    let total_duplicates: usize = results.iter().map(|r| r.duplicates).sum();
    let durations: Vec<f64> = results.iter().map(|r| r.duration_seconds).collect();
    let precision = precision(total_tp, total_fp);
    let recall = recall(total_tp, total_fn);
    Aggregate {
        total_tp,
        total_fp,
        total_fn,
        total_duplicates,
        precision,
        recall,
        f05: f05(precision, recall),
        avg_duration: match durations.is_empty() {
            true => 0.0,
            false => durations.iter().sum::<f64>() / durations.len() as f64,
        },
        median_duration: median(&durations),
    }
}

/// Writes the single-trial report JSON.
pub fn export_report_json(results: &[ScenarioResult], path: &Path) -> anyhow::Result<()> {
    #[derive(serde::Serialize)]
    struct Report<'a> {
        scenarios: &'a [ScenarioResult],
        aggregate: Aggregate,
    }

    let report = Report { scenarios: results, aggregate: aggregate(results) };
    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(path, json).with_context(|| format!("failed to write: {}", path.display()))?;
    Ok(())
}

/// Per-pair metrics lifted to mean/std across trials.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScenarioTrialResult {
    pub scenario_name: String,
    pub skill_name: String,
    pub true_positives: MetricStats,
    pub false_positives: MetricStats,
    pub false_negatives: MetricStats,
    pub duplicates: MetricStats,
    pub precision: MetricStats,
    pub recall: MetricStats,
    pub f05: MetricStats,
    pub duration_seconds: MetricStats,
}

fn pair_key(result: &ScenarioResult) -> (String, String) {
    (result.scenario_name.clone(), result.skill_name.clone())
}

/// Combines per-trial results into mean/std rows. Every trial must contain
/// the same (scenario, skill) pairs.
pub fn aggregate_trials(
    trials: &[Vec<ScenarioResult>],
) -> Result<Vec<ScenarioTrialResult>, PreflightError> {
    let Some(first) = trials.first() else {
        return Ok(vec![]);
    };

    let reference: Vec<(String, String)> = first.iter().map(pair_key).collect();
    for (n, trial) in trials.iter().enumerate() {
        let mut keys: Vec<(String, String)> = trial.iter().map(pair_key).collect();
        keys.sort();
        let mut expected_keys = reference.clone();
        expected_keys.sort();
        if keys != expected_keys {
            return Err(PreflightError::TrialSkillMismatch(format!(
                "trial {} evaluated a different (scenario, skill) set",
                n + 1
            )));
        }
    }

    let mut by_key: HashMap<(String, String), Vec<&ScenarioResult>> = HashMap::new();
    for trial in trials {
        for result in trial {
            by_key.entry(pair_key(result)).or_default().push(result);
        }
    }

    let stats = |values: Vec<f64>| MetricStats::from_values(&values);
    let rows = reference
        .into_iter()
        .map(|key| {
            let samples = &by_key[&key];
            ScenarioTrialResult {
                scenario_name: key.0,
                skill_name: key.1,
                true_positives: stats(
                    samples.iter().map(|r| r.true_positives as f64).collect(),
                ),
                false_positives: stats(
                    samples.iter().map(|r| r.false_positives as f64).collect(),
                ),
                false_negatives: stats(
                    samples.iter().map(|r| r.false_negatives as f64).collect(),
                ),
                duplicates: stats(samples.iter().map(|r| r.duplicates as f64).collect()),
                precision: stats(samples.iter().map(|r| r.precision).collect()),
                recall: stats(samples.iter().map(|r| r.recall).collect()),
                f05: stats(samples.iter().map(|r| r.f05).collect()),
                duration_seconds: stats(
                    samples.iter().map(|r| r.duration_seconds).collect(),
                ),
            }
        })
        .collect();
    Ok(rows)
}

#[derive(serde::Serialize)]
struct TrialAggregate {
    total_tp: MetricStats,
    total_fp: MetricStats,
    total_fn: MetricStats,
    total_duplicates: MetricStats,
    precision: MetricStats,
    recall: MetricStats,
    f05: MetricStats,
    avg_duration: MetricStats,
    median_duration: MetricStats,
}

/// Summary across scenarios for a multi-trial report. Count means are
/// summed; the mean ratios are recomputed from those sums, while their
/// spread comes from the per-trial aggregates.
fn trial_aggregate(rows: &[ScenarioTrialResult], trials: &[Vec<ScenarioResult>]) -> TrialAggregate {
    let per_trial: Vec<Aggregate> = trials.iter().map(|t| aggregate(t)).collect();
    let stat =
        |f: fn(&Aggregate) -> f64| MetricStats::from_values(&per_trial.iter().map(f).collect::<Vec<_>>());

    let tp_mean: f64 = rows.iter().map(|r| r.true_positives.mean).sum();
    let fp_mean: f64 = rows.iter().map(|r| r.false_positives.mean).sum();
    let fn_mean: f64 = rows.iter().map(|r| r.false_negatives.mean).sum();
    let mean_precision = match tp_mean + fp_mean > 0.0 {
        true => tp_mean / (tp_mean + fp_mean),
        false => 1.0,
    };
    let mean_recall = match tp_mean + fn_mean > 0.0 {
        true => tp_mean / (tp_mean + fn_mean),
        false => 1.0,
    };

    TrialAggregate {
        total_tp: MetricStats { mean: tp_mean, std: stat(|a| a.total_tp as f64).std },
        total_fp: MetricStats { mean: fp_mean, std: stat(|a| a.total_fp as f64).std },
        total_fn: MetricStats { mean: fn_mean, std: stat(|a| a.total_fn as f64).std },
        total_duplicates: stat(|a| a.total_duplicates as f64),
        precision: MetricStats { mean: mean_precision, std: stat(|a| a.precision).std },
        recall: MetricStats { mean: mean_recall, std: stat(|a| a.recall).std },
        f05: MetricStats {
            mean: f05(mean_precision, mean_recall),
            std: stat(|a| a.f05).std,
        },
        avg_duration: stat(|a| a.avg_duration),
        median_duration: stat(|a| a.median_duration),
    }
}

/// Writes the multi-trial report JSON.
pub fn export_trial_report_json(
    trials: &[Vec<ScenarioResult>],
    rows: &[ScenarioTrialResult],
    path: &Path,
) -> anyhow::Result<()> {
    #[derive(serde::Serialize)]
    struct Report<'a> {
        trials: usize,
        scenarios: &'a [ScenarioTrialResult],
        aggregate: TrialAggregate,
    }

    let report =
        Report { trials: trials.len(), scenarios: rows, aggregate: trial_aggregate(rows, trials) };
    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(path, json).with_context(|| format!("failed to write: {}", path.display()))?;
    Ok(())
}

/// Plain-text evaluation table with a TOTAL row and a false-positive listing.
pub fn format_report(results: &[ScenarioResult]) -> String {
    let mut lines = vec![
        format!(
            "{:<28} {:<18} {:>3} {:>3} {:>3} {:>9} {:>7} {:>6} {:>9}",
            "Scenario", "Skill", "TP", "FP", "FN", "Precision", "Recall", "F0.5", "Duration"
        ),
    ];
    for r in results {
        lines.push(format!(
            "{:<28} {:<18} {:>3} {:>3} {:>3} {:>9.2} {:>7.2} {:>6.2} {:>8.1}s",
            r.scenario_name,
            r.skill_name,
            r.true_positives,
            r.false_positives,
            r.false_negatives,
            r.precision,
            r.recall,
            r.f05,
            r.duration_seconds,
        ));
    }
    if !results.is_empty() {
        let agg = aggregate(results);
        lines.push(format!(
            "{:<28} {:<18} {:>3} {:>3} {:>3} {:>9.2} {:>7.2} {:>6.2} avg={:.1}s med={:.1}s",
            "TOTAL",
            "",
            agg.total_tp,
            agg.total_fp,
            agg.total_fn,
            agg.precision,
            agg.recall,
            agg.f05,
            agg.avg_duration,
            agg.median_duration,
        ));
    }

    let false_positives: Vec<String> = results
        .iter()
        .flat_map(|r| {
            r.unmatched_findings.iter().map(move |f| {
                format!(
                    "  {}/{}: {}:{}-{} {}",
                    r.scenario_name,
                    r.skill_name,
                    f.file,
                    f.line_range.0,
                    f.line_range.1,
                    f.description
                )
            })
        })
        .collect();
    if !false_positives.is_empty() {
        lines.push(String::new());
        lines.push("False positives:".to_owned());
        lines.extend(false_positives);
    }
    lines.join("\n")
}

/// Plain-text table for multi-trial rows, one `mean +/- std` cell per metric.
pub fn format_trial_report(trials: usize, rows: &[ScenarioTrialResult]) -> String {
    let cell = |m: &MetricStats| format!("{:.2}±{:.2}", m.mean, m.std);
    let mut lines = vec![
        format!("Across {trials} trials:"),
        format!(
            "{:<28} {:<18} {:>11} {:>11} {:>11} {:>11} {:>11} {:>11}",
            "Scenario", "Skill", "TP", "FP", "FN", "Precision", "Recall", "F0.5"
        ),
    ];
    for r in rows {
        lines.push(format!(
            "{:<28} {:<18} {:>11} {:>11} {:>11} {:>11} {:>11} {:>11}",
            r.scenario_name,
            r.skill_name,
            cell(&r.true_positives),
            cell(&r.false_positives),
            cell(&r.false_negatives),
            cell(&r.precision),
            cell(&r.recall),
            cell(&r.f05),
        ));
    }
    lines.join("\n")
}
