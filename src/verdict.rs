use serde::{Deserialize, Serialize};

/// Finding severity, ordered from least to most severe so that
/// comparisons like `severity >= gate` read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Minor,
    Major,
    Critical,
}

impl Severity {
    /// Lenient parse used during normalization: anything outside the
    /// enumerated set collapses to `info`.
    pub fn parse_lenient(s: &str) -> Severity {
        match s.trim().to_lowercase().as_str() {
            "critical" => Severity::Critical,
            "major" => Severity::Major,
            "minor" => Severity::Minor,
            _ => Severity::Info,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::Major => "MAJOR",
            Severity::Minor => "MINOR",
            Severity::Info => "INFO",
        }
    }
}

/// The four-valued verdict shared by reviewers and the cerberus level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictKind {
    Pass,
    Warn,
    Fail,
    Skip,
}

impl std::fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerdictKind::Pass => "PASS",
            VerdictKind::Warn => "WARN",
            VerdictKind::Fail => "FAIL",
            VerdictKind::Skip => "SKIP",
        };
        write!(f, "{s}")
    }
}

impl VerdictKind {
    pub fn parse(s: &str) -> Option<VerdictKind> {
        match s.trim().to_uppercase().as_str() {
            "PASS" => Some(VerdictKind::Pass),
            "WARN" => Some(VerdictKind::Warn),
            "FAIL" => Some(VerdictKind::Fail),
            "SKIP" => Some(VerdictKind::Skip),
            _ => None,
        }
    }
}

/// Why a reviewer produced no normal verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    Timeout,
    ApiError,
    ParseFailure,
}

impl SkipKind {
    pub fn category(&self) -> &'static str {
        match self {
            SkipKind::Timeout => "timeout",
            SkipKind::ApiError => "api_error",
            SkipKind::ParseFailure => "parse_failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingScope {
    #[default]
    Diff,
    DefaultsChange,
}

/// Only findings at or above this confidence count toward threshold rules.
pub const CONFIDENCE_THRESHOLD: f64 = 0.7;

fn default_finding_confidence() -> f64 {
    1.0
}

fn is_default_confidence(c: &f64) -> bool {
    *c == 1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub category: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u64,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub suggestion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, skip_serializing_if = "is_diff_scope")]
    pub scope: FindingScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion_verified: Option<bool>,
    #[serde(
        default = "default_finding_confidence",
        skip_serializing_if = "is_default_confidence"
    )]
    pub confidence: f64,
}

fn is_diff_scope(s: &FindingScope) -> bool {
    *s == FindingScope::Diff
}

impl Finding {
    /// A minimal finding used for SKIP synthesis and aggregator banners.
    pub fn synthetic(severity: Severity, category: &str, title: &str, description: &str) -> Self {
        Finding {
            severity,
            category: category.to_string(),
            file: String::new(),
            line: 0,
            title: title.to_string(),
            description: description.to_string(),
            suggestion: String::new(),
            evidence: None,
            scope: FindingScope::Diff,
            suggestion_verified: None,
            confidence: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stats {
    #[serde(default)]
    pub files_reviewed: u64,
    #[serde(default)]
    pub files_with_issues: u64,
    #[serde(default)]
    pub critical: u64,
    #[serde(default)]
    pub major: u64,
    #[serde(default)]
    pub minor: u64,
    #[serde(default)]
    pub info: u64,
}

impl Stats {
    /// Recount severity totals from a normalized finding list, keeping the
    /// model-supplied file counts.
    pub fn recounted(&self, findings: &[Finding]) -> Stats {
        let mut out = Stats {
            files_reviewed: self.files_reviewed,
            files_with_issues: self.files_with_issues,
            ..Stats::default()
        };
        for f in findings {
            match f.severity {
                Severity::Critical => out.critical += 1,
                Severity::Major => out.major += 1,
                Severity::Minor => out.minor += 1,
                Severity::Info => out.info += 1,
            }
        }
        out
    }
}

/// The primary per-reviewer artifact: a parsed, normalized verdict plus the
/// metadata the pipeline attaches on the way through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerVerdict {
    pub reviewer: String,
    pub perspective: String,
    pub verdict: VerdictKind,
    pub confidence: f64,
    pub summary: String,
    pub findings: Vec<Finding>,
    pub stats: Stats,
    #[serde(default)]
    pub runtime_seconds: f64,
    #[serde(default)]
    pub model_used: String,
    #[serde(default)]
    pub primary_model: String,
    #[serde(default)]
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_review: Option<String>,
}

impl ReviewerVerdict {
    /// The skip subtype, when this is a SKIP verdict. Derived from the
    /// synthetic finding's category.
    pub fn skip_kind(&self) -> Option<SkipKind> {
        if self.verdict != VerdictKind::Skip {
            return None;
        }
        self.findings.first().and_then(|f| match f.category.as_str() {
            "timeout" => Some(SkipKind::Timeout),
            "api_error" => Some(SkipKind::ApiError),
            "parse_failure" => Some(SkipKind::ParseFailure),
            _ => None,
        })
    }
}
