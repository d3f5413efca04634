use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::github::PrState;
use crate::overrides::{OverrideOutcome, evaluate_overrides, parse_overrides};
use crate::verdict::{Finding, ReviewerVerdict, Severity, Stats, VerdictKind};

/// One reviewer's verdict as the aggregator sees it: annotated with its
/// profile's `critical` flag and whether an override downgraded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerOutcome {
    #[serde(flatten)]
    pub verdict: ReviewerVerdict,
    pub critical: bool,
    pub overridden: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveMeta {
    pub wave: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_wave: Option<String>,
    pub next_wave_allowed: bool,
    pub gate_severity: Severity,
}

/// The final, per-run artifact: one verdict for the whole PR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CerberusVerdict {
    pub verdict: VerdictKind,
    pub reviewers: Vec<ReviewerOutcome>,
    pub overrides: OverrideOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wave: Option<WaveMeta>,
    pub head_sha: String,
}

/// The cerberus-level decision rule.
///
/// A single non-critical FAIL is advisory; two independent FAILs are
/// cross-perspective agreement; a critical reviewer's FAIL is authoritative.
pub fn decide(outcomes: &[ReviewerOutcome]) -> VerdictKind {
    let n = outcomes
        .iter()
        .filter(|o| o.verdict.verdict != VerdictKind::Skip)
        .count();
    if n == 0 {
        return VerdictKind::Skip;
    }

    let blocking_fails: Vec<&ReviewerOutcome> = outcomes
        .iter()
        .filter(|o| o.verdict.verdict == VerdictKind::Fail && !o.overridden)
        .collect();
    let critical_fail = blocking_fails.iter().any(|o| o.critical);
    let f = blocking_fails.len();
    let w = outcomes
        .iter()
        .filter(|o| o.verdict.verdict == VerdictKind::Warn)
        .count();

    if critical_fail {
        VerdictKind::Fail
    } else if f >= 2 {
        VerdictKind::Fail
    } else if f == 1 || w >= 1 {
        VerdictKind::Warn
    } else {
        VerdictKind::Pass
    }
}

/// Wave-gating predicate: the next wave runs only when no finding in the
/// current wave's verdicts reaches `gate`. Advancing is the workflow's job.
pub fn next_wave_allowed(verdicts: &[ReviewerVerdict], gate: Severity) -> bool {
    !verdicts
        .iter()
        .flat_map(|v| v.findings.iter())
        .any(|f| f.severity >= gate)
}

/// Synthesized verdict for a reviewer whose artifact never materialized.
pub fn missing_artifact_verdict(codename: &str, perspective: &str) -> ReviewerVerdict {
    ReviewerVerdict {
        reviewer: codename.to_string(),
        perspective: perspective.to_string(),
        verdict: VerdictKind::Skip,
        confidence: 0.0,
        summary: "api_error: ARTIFACT_MISSING".to_string(),
        findings: vec![Finding::synthetic(
            Severity::Info,
            "api_error",
            "ARTIFACT_MISSING",
            "no verdict artifact was uploaded for this reviewer",
        )],
        stats: Stats::default(),
        runtime_seconds: 0.0,
        model_used: String::new(),
        primary_model: String::new(),
        fallback_used: false,
        raw_review: None,
    }
}

/// Load per-reviewer verdict artifacts for the expected roster, counting
/// absent or unreadable ones as SKIP.
pub fn load_verdicts(
    artifacts_dir: &Path,
    expected: &[(String, String)],
) -> Vec<ReviewerVerdict> {
    expected
        .iter()
        .map(|(codename, perspective)| {
            let path = artifacts_dir.join(format!("{perspective}.verdict.json"));
            match std::fs::read_to_string(&path) {
                Err(_) => {
                    warn!(perspective, "verdict artifact missing, counting as SKIP");
                    missing_artifact_verdict(codename, perspective)
                }
                Ok(content) => match serde_json::from_str::<ReviewerVerdict>(&content) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(perspective, "verdict artifact unreadable ({e}), counting as SKIP");
                        missing_artifact_verdict(codename, perspective)
                    }
                },
            }
        })
        .collect()
}

/// Combine reviewer verdicts, PR overrides, and wave policy into the final
/// CerberusVerdict. Reviewer order in the output is deterministic by
/// codename.
pub fn aggregate(
    config: &Config,
    mut verdicts: Vec<ReviewerVerdict>,
    state: &dyn PrState,
    wave: Option<&str>,
) -> Result<CerberusVerdict> {
    verdicts.sort_by(|a, b| a.reviewer.cmp(&b.reviewer));

    let head_sha = state.head_sha()?;
    let failed: Vec<String> = verdicts
        .iter()
        .filter(|v| v.verdict == VerdictKind::Fail)
        .map(|v| v.reviewer.clone())
        .collect();

    let comments = state.comments()?;
    let candidates = parse_overrides(
        &comments,
        &config.overrides.command,
        &config.overrides.legacy_command,
    );
    let overrides = evaluate_overrides(&candidates, config, state, &failed)?;

    let outcomes: Vec<ReviewerOutcome> = verdicts
        .into_iter()
        .map(|v| {
            let critical = config
                .get_reviewer_by_codename(&v.reviewer)
                .map(|p| p.critical)
                .unwrap_or(false);
            let overridden =
                v.verdict == VerdictKind::Fail && overrides.is_overridden(&v.reviewer);
            ReviewerOutcome {
                verdict: v,
                critical,
                overridden,
            }
        })
        .collect();

    let verdict = decide(&outcomes);

    let wave_meta = match (wave, &config.waves) {
        (Some(name), Some(waves)) => {
            let wave_verdicts: Vec<ReviewerVerdict> =
                outcomes.iter().map(|o| o.verdict.clone()).collect();
            let allowed = next_wave_allowed(&wave_verdicts, waves.gate_severity);
            Some(WaveMeta {
                wave: name.to_string(),
                next_wave: waves.next_after(name).map(str::to_string),
                next_wave_allowed: allowed,
                gate_severity: waves.gate_severity,
            })
        }
        (Some(name), None) => {
            return Err(Error::Aggregate(format!(
                "wave {name} given but config defines no waves"
            )));
        }
        _ => None,
    };

    info!(%verdict, overrides = overrides.applied.len(), "cerberus verdict decided");
    Ok(CerberusVerdict {
        verdict,
        reviewers: outcomes,
        overrides,
        wave: wave_meta,
        head_sha,
    })
}
