use serde_json::Value;
use tracing::{debug, warn};

use crate::artifact::{ArtifactDescriptor, RunClassification};
use crate::verdict::{
    CONFIDENCE_THRESHOLD, Finding, FindingScope, ReviewerVerdict, Severity, SkipKind, Stats,
    VerdictKind,
};

/// Cap on the raw text preserved for debugging when parsing fails.
pub const MAX_RAW_REVIEW_BYTES: usize = 50 * 1024;

const UNVERIFIED_PREFIX: &str = "[unverified]";

/// Parse one reviewer artifact into a verdict. Never fails: every problem
/// folds into a SKIP with a precise subtype, so a reviewer-internal failure
/// can never take down the CI job.
pub fn parse_descriptor(desc: &ArtifactDescriptor) -> ReviewerVerdict {
    let verdict = match &desc.classification {
        RunClassification::Timeout => {
            let marker = std::fs::read_to_string(&desc.artifact_path).unwrap_or_default();
            skip_verdict(
                desc,
                SkipKind::Timeout,
                "REVIEW_TIMEOUT",
                "Reviewer did not produce a verdict within its wall-clock budget.",
                Some(marker),
            )
        }
        RunClassification::ApiError { title, detail } => skip_verdict(
            desc,
            SkipKind::ApiError,
            title.as_str(),
            detail,
            None,
        ),
        RunClassification::Ok => match std::fs::read_to_string(&desc.artifact_path) {
            Err(e) => skip_verdict(
                desc,
                SkipKind::ParseFailure,
                "ARTIFACT_UNREADABLE",
                &format!("could not read reviewer artifact: {e}"),
                None,
            ),
            Ok(content) => parse_content(desc, &content),
        },
    };
    attach_metadata(desc, verdict)
}

fn parse_content(desc: &ArtifactDescriptor, content: &str) -> ReviewerVerdict {
    if content.trim().is_empty() {
        return skip_verdict(
            desc,
            SkipKind::ParseFailure,
            "EMPTY_ARTIFACT",
            "reviewer produced no output",
            None,
        );
    }

    let Some(block) = extract_last_json_block(content) else {
        return skip_verdict(
            desc,
            SkipKind::ParseFailure,
            "NO_JSON_BLOCK",
            "reviewer output contains no fenced json block",
            Some(content.to_string()),
        );
    };

    let (value, partial) = match serde_json::from_str::<Value>(block) {
        Ok(v) if v.is_object() => (v, false),
        _ => match largest_json_object(block) {
            Some(v) => (v, true),
            None => {
                return skip_verdict(
                    desc,
                    SkipKind::ParseFailure,
                    "MALFORMED_JSON",
                    "fenced json block does not parse",
                    Some(content.to_string()),
                );
            }
        },
    };

    match build_verdict(desc, &value, partial, content) {
        Ok(v) => v,
        Err(missing) => skip_verdict(
            desc,
            SkipKind::ParseFailure,
            "MISSING_REQUIRED_FIELD",
            &format!("verdict object is missing required field: {missing}"),
            Some(content.to_string()),
        ),
    }
}

/// Build a verdict from a parsed object; `Err` names the first missing
/// required field.
fn build_verdict(
    desc: &ArtifactDescriptor,
    value: &Value,
    partial: bool,
    raw: &str,
) -> std::result::Result<ReviewerVerdict, &'static str> {
    for field in [
        "reviewer",
        "perspective",
        "verdict",
        "confidence",
        "summary",
        "findings",
        "stats",
    ] {
        if value.get(field).is_none() {
            return Err(field);
        }
    }

    let findings: Vec<Finding> = value["findings"]
        .as_array()
        .map(|items| items.iter().map(normalize_finding).collect())
        .unwrap_or_default();

    let claimed = value["verdict"].as_str().and_then(VerdictKind::parse);
    let recomputed = recompute_verdict(&findings);
    if let Some(claimed) = claimed
        && claimed != recomputed
    {
        warn!(
            perspective = %desc.perspective,
            claimed = %claimed,
            recomputed = %recomputed,
            "model verdict disagrees with recomputation, recomputed wins"
        );
    }

    let confidence = lenient_f64(&value["confidence"]).unwrap_or(0.0).clamp(0.0, 1.0);
    let stats: Stats =
        serde_json::from_value(value["stats"].clone()).unwrap_or_default();

    Ok(ReviewerVerdict {
        // Identity comes from the pipeline, not from model output.
        reviewer: desc.codename.clone(),
        perspective: desc.perspective.clone(),
        verdict: recomputed,
        confidence,
        summary: value["summary"].as_str().unwrap_or_default().to_string(),
        stats: stats.recounted(&findings),
        findings,
        runtime_seconds: 0.0,
        model_used: String::new(),
        primary_model: String::new(),
        fallback_used: false,
        raw_review: if partial {
            Some(truncate_raw(raw))
        } else {
            None
        },
    })
}

/// Normalize one raw finding object. Schema violations are repaired, not
/// discarded: bad severity collapses to `info`, bad line to 0, and the
/// evidence/suggestion gates demote severity instead of dropping findings.
fn normalize_finding(value: &Value) -> Finding {
    let mut severity = match value.get("severity") {
        Some(Value::String(s)) => Severity::parse_lenient(s),
        _ => Severity::Info,
    };
    let title = string_field(value, "title");
    let evidence = match value.get("evidence") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    };
    let scope = match value.get("scope") {
        Some(Value::String(s)) if s == "defaults-change" => FindingScope::DefaultsChange,
        _ => FindingScope::Diff,
    };
    let suggestion_verified = value.get("suggestion_verified").and_then(Value::as_bool);

    let unverified_claim = title.to_lowercase().starts_with(UNVERIFIED_PREFIX);
    if evidence.is_none() && !unverified_claim && scope != FindingScope::DefaultsChange {
        debug!(title = %title, "finding lacks evidence, demoting to info");
        severity = Severity::Info;
    }
    if suggestion_verified == Some(false) {
        severity = Severity::Info;
    }

    Finding {
        severity,
        category: {
            let c = string_field(value, "category");
            if c.is_empty() { "general".to_string() } else { c }
        },
        file: string_field(value, "file"),
        line: value.get("line").and_then(lenient_u64).unwrap_or(0),
        title,
        description: string_field(value, "description"),
        suggestion: string_field(value, "suggestion"),
        evidence,
        scope,
        suggestion_verified,
        confidence: value
            .get("confidence")
            .and_then(lenient_f64)
            .unwrap_or(1.0)
            .clamp(0.0, 1.0),
    }
}

/// Recompute the reviewer verdict from normalized findings. Pure: the same
/// findings always yield the same verdict. Only findings at or above the
/// confidence threshold count.
pub fn recompute_verdict(findings: &[Finding]) -> VerdictKind {
    let counted: Vec<&Finding> = findings
        .iter()
        .filter(|f| f.confidence >= CONFIDENCE_THRESHOLD)
        .collect();

    let critical = counted.iter().filter(|f| f.severity == Severity::Critical).count();
    let major = counted.iter().filter(|f| f.severity == Severity::Major).count();
    let minors: Vec<&&Finding> = counted
        .iter()
        .filter(|f| f.severity == Severity::Minor)
        .collect();

    if critical >= 1 || major >= 2 {
        return VerdictKind::Fail;
    }

    let mut minor_per_category: std::collections::HashMap<&str, usize> =
        std::collections::HashMap::new();
    for f in &minors {
        *minor_per_category.entry(f.category.as_str()).or_default() += 1;
    }
    let clustered_minors = minor_per_category.values().any(|&n| n >= 3);

    if major == 1 || minors.len() >= 5 || clustered_minors {
        return VerdictKind::Warn;
    }
    VerdictKind::Pass
}

fn skip_verdict(
    desc: &ArtifactDescriptor,
    kind: SkipKind,
    title: &str,
    description: &str,
    raw: Option<String>,
) -> ReviewerVerdict {
    ReviewerVerdict {
        reviewer: desc.codename.clone(),
        perspective: desc.perspective.clone(),
        verdict: VerdictKind::Skip,
        confidence: 0.0,
        summary: format!("{}: {title}", kind.category()),
        findings: vec![Finding::synthetic(
            Severity::Info,
            kind.category(),
            title,
            description,
        )],
        stats: Stats::default(),
        runtime_seconds: 0.0,
        model_used: String::new(),
        primary_model: String::new(),
        fallback_used: false,
        raw_review: raw.filter(|r| !r.trim().is_empty()).map(|r| truncate_raw(&r)),
    }
}

fn attach_metadata(desc: &ArtifactDescriptor, mut verdict: ReviewerVerdict) -> ReviewerVerdict {
    verdict.runtime_seconds = desc.metadata.runtime_seconds;
    verdict.model_used = desc.metadata.model_used.clone();
    verdict.primary_model = desc.metadata.primary_model.clone();
    verdict.fallback_used = desc.metadata.fallback_used;
    verdict
}

fn truncate_raw(raw: &str) -> String {
    if raw.len() <= MAX_RAW_REVIEW_BYTES {
        return raw.to_string();
    }
    let mut cut = MAX_RAW_REVIEW_BYTES;
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    raw[..cut].to_string()
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Find the last fenced ```json block in a text and return its body.
/// An unclosed final fence is taken to the end of the text.
pub fn extract_last_json_block(text: &str) -> Option<&str> {
    let start_tag = text.rfind("```json")?;
    let after = &text[start_tag + "```json".len()..];
    let body_start = match after.find('\n') {
        Some(i) => i + 1,
        None => return None,
    };
    let body = &after[body_start..];
    match body.find("```") {
        Some(end) => Some(body[..end].trim()),
        None => Some(body.trim()),
    }
}

/// Largest balanced `{...}` substring that parses as a JSON object.
/// Used when a model wraps valid JSON in commentary inside the fence.
pub fn largest_json_object(text: &str) -> Option<Value> {
    // Single string-aware pass collecting every balanced span, nested ones
    // included: an outer span can balance without parsing while an inner
    // object is valid.
    let mut candidates: Vec<(usize, usize)> = Vec::new();
    let mut open_stack: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in text.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => open_stack.push(i),
            b'}' => {
                if let Some(start) = open_stack.pop() {
                    candidates.push((start, i));
                }
            }
            _ => {}
        }
    }
    candidates.sort_by_key(|(s, e)| std::cmp::Reverse(e - s));
    for (s, e) in candidates {
        if let Ok(v) = serde_json::from_str::<Value>(&text[s..=e])
            && v.is_object()
        {
            return Some(v);
        }
    }
    None
}
