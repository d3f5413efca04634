use crate::aggregate::{CerberusVerdict, ReviewerOutcome};
use crate::github::PrComment;
use crate::overrides::short_sha;
use crate::verdict::{ReviewerVerdict, SkipKind, VerdictKind};

pub const VERDICT_MARKER: &str = "<!-- cerberus:verdict -->";

/// Cap on inline review annotations extracted from findings.
pub const MAX_INLINE_ANNOTATIONS: usize = 30;

pub fn reviewer_marker(perspective: &str) -> String {
    format!("<!-- cerberus:{perspective} -->")
}

/// Locate an existing comment by marker substring. The read half of the
/// upsert contract.
pub fn find_marker_comment<'a>(comments: &'a [PrComment], marker: &str) -> Option<&'a PrComment> {
    comments.iter().find(|c| c.body.contains(marker))
}

fn verdict_icon(verdict: VerdictKind) -> &'static str {
    match verdict {
        VerdictKind::Pass => "✅",
        VerdictKind::Warn => "⚠️",
        VerdictKind::Fail => "❌",
        VerdictKind::Skip => "⏭️",
    }
}

fn skip_banner(verdict: &ReviewerVerdict) -> Option<String> {
    let kind = verdict.skip_kind()?;
    let finding = verdict.findings.first();
    let title = finding.map(|f| f.title.as_str()).unwrap_or("UNKNOWN");
    let detail = finding.map(|f| f.description.as_str()).unwrap_or("");
    let banner = match kind {
        SkipKind::Timeout => format!("> ⏱️ **Reviewer timed out.** {detail}"),
        SkipKind::ApiError => match title {
            "API_CREDITS_DEPLETED" => {
                "> 💳 **API credits depleted.** The reviewer could not run; no fallback model was attempted.".to_string()
            }
            "API_KEY_INVALID" => {
                "> 🔑 **API key invalid.** Check the repository secret configured for cerberus.".to_string()
            }
            other => format!("> 🚫 **API error ({other}).** {detail}"),
        },
        SkipKind::ParseFailure => {
            "> 🧩 **Unparseable output.** The reviewer replied but produced no valid verdict JSON; raw text is preserved in the artifact.".to_string()
        }
    };
    Some(banner)
}

fn finding_line(f: &crate::verdict::Finding) -> String {
    let anchor = if f.file.is_empty() {
        String::new()
    } else if f.line > 0 {
        format!(" `{}:{}`", f.file, f.line)
    } else {
        format!(" `{}`", f.file)
    };
    let mut line = format!("- **{}** [{}]{anchor} — {}", f.severity.label(), f.category, f.title);
    if !f.description.is_empty() {
        line.push_str(&format!("\n  {}", f.description.replace('\n', "\n  ")));
    }
    if !f.suggestion.is_empty() {
        line.push_str(&format!("\n  _Suggestion:_ {}", f.suggestion.replace('\n', " ")));
    }
    line
}

fn model_line(v: &ReviewerVerdict) -> String {
    if v.model_used.is_empty() {
        return String::new();
    }
    if v.fallback_used {
        format!(
            "_model: `{}` (fallback from `{}`) · {:.0}s_",
            v.model_used, v.primary_model, v.runtime_seconds
        )
    } else {
        format!("_model: `{}` · {:.0}s_", v.model_used, v.runtime_seconds)
    }
}

fn reviewer_section(outcome: &ReviewerOutcome) -> String {
    let v = &outcome.verdict;
    let mut summary_line = format!(
        "{} <b>{}</b> — {}: {}",
        verdict_icon(v.verdict),
        v.reviewer,
        v.perspective,
        v.verdict
    );
    if outcome.critical {
        summary_line.push_str(" (critical)");
    }
    if outcome.overridden {
        summary_line.push_str(" — overridden, non-blocking");
    }

    let mut body = String::new();
    if let Some(banner) = skip_banner(v) {
        body.push_str(&banner);
        body.push_str("\n\n");
    } else {
        if !v.summary.is_empty() {
            body.push_str(&v.summary);
            body.push_str("\n\n");
        }
        if v.findings.is_empty() {
            body.push_str("No findings.\n\n");
        } else {
            for f in &v.findings {
                body.push_str(&finding_line(f));
                body.push('\n');
            }
            body.push('\n');
        }
    }
    let model = model_line(v);
    if !model.is_empty() {
        body.push_str(&model);
        body.push('\n');
    }

    format!("<details>\n<summary>{summary_line}</summary>\n\n{body}</details>\n")
}

/// Render the single PR verdict comment. Pure function of the verdict; the
/// marker makes the upsert idempotent.
pub fn render_verdict_comment(cv: &CerberusVerdict) -> String {
    let mut out = String::new();
    out.push_str(VERDICT_MARKER);
    out.push('\n');
    out.push_str(&format!(
        "## {} Cerberus verdict: {}\n\n",
        verdict_icon(cv.verdict),
        cv.verdict
    ));
    out.push_str(&format!("HEAD: `{}`\n\n", short_sha(&cv.head_sha)));

    if let Some(wave) = &cv.wave {
        let gate = match wave.next_wave.as_deref() {
            None => format!("Wave `{}` (final wave).", wave.wave),
            Some(next) if wave.next_wave_allowed => {
                format!("Wave `{}` — next wave `{next}` may run.", wave.wave)
            }
            Some(next) => format!(
                "Wave `{}` — next wave `{next}` gated (findings at {} or above).",
                wave.wave,
                wave.gate_severity.label().to_lowercase()
            ),
        };
        out.push_str(&gate);
        out.push_str("\n\n");
    }

    if !cv.overrides.applied.is_empty() {
        out.push_str("**Applied overrides**\n\n");
        for o in &cv.overrides.applied {
            out.push_str(&format!(
                "- @{} overrode {} at `{}`: {}\n",
                o.actor,
                o.reviewers.join(", "),
                short_sha(&o.sha),
                o.reason.replace('\n', " ")
            ));
        }
        out.push('\n');
    }
    if !cv.overrides.rejected.is_empty() {
        out.push_str("**Rejected overrides**\n\n");
        for o in &cv.overrides.rejected {
            out.push_str(&format!("- @{} (`{}`): {}\n", o.actor, short_sha(&o.sha), o.rejection));
        }
        out.push('\n');
    }

    for outcome in &cv.reviewers {
        out.push_str(&reviewer_section(outcome));
    }
    out
}

/// Render one reviewer's standalone comment, marked per perspective.
pub fn render_reviewer_comment(outcome: &ReviewerOutcome) -> String {
    format!(
        "{}\n{}",
        reviewer_marker(&outcome.verdict.perspective),
        reviewer_section(outcome)
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineAnnotation {
    pub file: String,
    pub line: u64,
    pub body: String,
}

/// Findings that can anchor to a diff position, most severe first, capped.
pub fn inline_annotations(cv: &CerberusVerdict) -> Vec<InlineAnnotation> {
    let mut anchored: Vec<(&crate::verdict::Finding, &str)> = cv
        .reviewers
        .iter()
        .flat_map(|o| {
            o.verdict
                .findings
                .iter()
                .map(move |f| (f, o.verdict.reviewer.as_str()))
        })
        .filter(|(f, _)| !f.file.is_empty() && f.line > 0)
        .collect();
    anchored.sort_by(|(a, _), (b, _)| b.severity.cmp(&a.severity));
    anchored
        .into_iter()
        .take(MAX_INLINE_ANNOTATIONS)
        .map(|(f, reviewer)| InlineAnnotation {
            file: f.file.clone(),
            line: f.line,
            body: format!("**{}** ({reviewer}): {} — {}", f.severity.label(), f.title, f.description),
        })
        .collect()
}
