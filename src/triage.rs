use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::github::{PrComment, PrState};
use crate::overrides::short_sha;
use crate::render::VERDICT_MARKER;
use crate::verdict::VerdictKind;

/// Commit-message token that marks a commit produced by a triage fix.
/// Its presence on HEAD means the loop already ran once for this state.
pub const TRIAGE_COMMIT_TOKEN: &str = "[triage]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageTrigger {
    PullRequest,
    Comment,
    Schedule,
}

impl TriageTrigger {
    pub fn parse(s: &str) -> Option<TriageTrigger> {
        match s {
            "pr" | "pull_request" => Some(TriageTrigger::PullRequest),
            "comment" => Some(TriageTrigger::Comment),
            "schedule" => Some(TriageTrigger::Schedule),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageMode {
    Diagnose,
    Fix,
}

impl TriageMode {
    pub fn parse(s: &str) -> Option<TriageMode> {
        match s {
            "diagnose" => Some(TriageMode::Diagnose),
            "fix" => Some(TriageMode::Fix),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageDecision {
    Disabled,
    Skip,
    Diagnose,
    Fix,
}

impl std::fmt::Display for TriageDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriageDecision::Disabled => "disabled",
            TriageDecision::Skip => "skip",
            TriageDecision::Diagnose => "diagnose",
            TriageDecision::Fix => "fix",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageDecisionRecord {
    pub decision: TriageDecision,
    pub reason: String,
}

/// Result of an executed fix attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixOutcome {
    Fixed,
    NoChanges,
    FixFailed,
}

pub struct TriageInput<'a> {
    pub trigger: TriageTrigger,
    pub head_sha: &'a str,
    pub head_commit_message: &'a str,
    pub comments: &'a [PrComment],
    /// Global kill switch (config `triage.enabled = false` or env).
    pub kill_switch: bool,
    /// Head repository differs from the target repository.
    pub is_fork: bool,
    /// The working tree is a real git checkout (not a tarball export).
    pub is_git_checkout: bool,
    pub requested_mode: TriageMode,
    pub bot_login: &'a str,
    pub max_attempts: u32,
    pub stale_hours: u64,
    pub now: DateTime<Utc>,
}

/// Per-run triage comment marker.
pub fn triage_marker(head_sha: &str, run_id: &str) -> String {
    format!("<!-- cerberus:triage sha={} run={run_id} -->", short_sha(head_sha))
}

/// Attempts already made for this HEAD: triage-marker comments authored by
/// the trusted bot. Nobody else's comments count.
pub fn attempt_count(comments: &[PrComment], bot_login: &str, head_sha: &str) -> usize {
    let needle = format!("cerberus:triage sha={}", short_sha(head_sha));
    comments
        .iter()
        .filter(|c| c.author == bot_login && c.body.contains(&needle))
        .count()
}

/// The latest verdict comment from the trusted bot, if any.
fn latest_verdict_comment<'a>(comments: &'a [PrComment], bot_login: &str) -> Option<&'a PrComment> {
    comments
        .iter()
        .filter(|c| c.author == bot_login && c.body.contains(VERDICT_MARKER))
        .next_back()
}

/// Pull the verdict out of a rendered verdict comment.
pub fn extract_verdict(body: &str) -> Option<VerdictKind> {
    let idx = body.find("Cerberus verdict:")?;
    let rest = body[idx + "Cerberus verdict:".len()..].trim_start();
    let word: String = rest.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    VerdictKind::parse(&word)
}

fn verdict_age_hours(comment: &PrComment, now: DateTime<Utc>) -> Option<f64> {
    let created = comment.created_at.as_deref()?;
    let parsed = DateTime::parse_from_rfc3339(created).ok()?;
    Some((now - parsed.with_timezone(&Utc)).num_seconds() as f64 / 3600.0)
}

/// The triage circuit breaker. Pure over its input; the caller supplies PR
/// state and workspace facts.
pub fn decide(input: &TriageInput) -> TriageDecisionRecord {
    use TriageDecision::*;

    if input.kill_switch {
        return record(Disabled, "triage disabled by kill switch");
    }

    let Some(verdict_comment) = latest_verdict_comment(input.comments, input.bot_login) else {
        return record(Skip, "no authoritative verdict comment from trusted bot");
    };

    let verdict = extract_verdict(&verdict_comment.body);
    if verdict != Some(VerdictKind::Fail) {
        return record(
            Skip,
            &format!(
                "latest verdict is {}, not FAIL",
                verdict.map(|v| v.to_string()).unwrap_or_else(|| "unreadable".into())
            ),
        );
    }

    let attempts = attempt_count(input.comments, input.bot_login, input.head_sha);
    if attempts >= input.max_attempts as usize {
        return record(
            Skip,
            &format!("attempt limit reached for this HEAD ({attempts}/{})", input.max_attempts),
        );
    }

    if input.head_commit_message.contains(TRIAGE_COMMIT_TOKEN) {
        return record(Skip, "HEAD is already a triage commit");
    }

    if input.trigger == TriageTrigger::Schedule
        && let Some(age) = verdict_age_hours(verdict_comment, input.now)
        && age < input.stale_hours as f64
    {
        return record(Skip, &format!("verdict is only {age:.1}h old, below stale threshold"));
    }

    // Mode selection: anything but a direct PR event, a fork head, or a
    // non-git workspace demotes to diagnose (read-only).
    if input.trigger != TriageTrigger::PullRequest {
        return record(Diagnose, "non-PR trigger runs read-only");
    }
    if input.is_fork {
        return record(Diagnose, "fork PRs run read-only");
    }
    if !input.is_git_checkout {
        return record(Diagnose, "workspace is not a git checkout");
    }

    match input.requested_mode {
        TriageMode::Diagnose => record(Diagnose, "diagnose requested"),
        TriageMode::Fix => record(Fix, "fix mode eligible"),
    }
}

fn record(decision: TriageDecision, reason: &str) -> TriageDecisionRecord {
    info!(?decision, reason, "triage decision");
    TriageDecisionRecord {
        decision,
        reason: reason.to_string(),
    }
}

/// Render the triage comment body for one run.
pub fn render_triage_comment(
    head_sha: &str,
    run_id: &str,
    decision: &TriageDecisionRecord,
    outcome: Option<FixOutcome>,
    detail: &str,
) -> String {
    let mut out = String::new();
    out.push_str(&triage_marker(head_sha, run_id));
    out.push('\n');
    out.push_str(&format!("### Cerberus triage — {}\n\n", decision.decision));
    out.push_str(&format!("{}\n", decision.reason));
    if let Some(outcome) = outcome {
        let line = match outcome {
            FixOutcome::Fixed => "The fix attempt produced changes and pushed a `[triage]` commit.",
            FixOutcome::NoChanges => "The fix command succeeded but the tree was already clean.",
            FixOutcome::FixFailed => "The fix command or push failed; see run logs.",
        };
        out.push_str(&format!("\n{line}\n"));
    }
    if !detail.is_empty() {
        out.push_str(&format!("\n{detail}\n"));
    }
    out
}

/// Post (or update) this run's triage comment. The per-run marker keeps
/// history: earlier runs' comments are never touched.
pub fn post_triage_comment(
    state: &dyn PrState,
    head_sha: &str,
    run_id: &str,
    body: &str,
) -> Result<()> {
    state.upsert_comment(&triage_marker(head_sha, run_id), body)
}
