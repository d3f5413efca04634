use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{Config, OverridePolicy};
use crate::error::Result;
use crate::github::{PrComment, PrState};

/// A syntactically valid override command found in a PR comment.
/// Semantic checks (SHA binding, authorization) happen in `evaluate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideCommand {
    pub sha: String,
    pub reason: String,
    pub actor: String,
    /// Targeted reviewer codenames; empty means every FAILed reviewer.
    pub reviewers: Vec<String>,
    pub legacy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOverride {
    pub actor: String,
    pub sha: String,
    pub reason: String,
    /// Resolved codenames whose FAIL was downgraded.
    pub reviewers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedOverride {
    pub actor: String,
    pub sha: String,
    pub rejection: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideOutcome {
    pub applied: Vec<AppliedOverride>,
    pub rejected: Vec<RejectedOverride>,
}

impl OverrideOutcome {
    /// Whether `codename`'s FAIL has been downgraded by any applied
    /// override.
    pub fn is_overridden(&self, codename: &str) -> bool {
        self.applied
            .iter()
            .any(|o| o.reviewers.iter().any(|r| r == codename))
    }
}

fn is_hex_sha(s: &str) -> bool {
    (7..=40).contains(&s.len()) && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Short or full SHA match against HEAD.
pub fn sha_matches(candidate: &str, head: &str) -> bool {
    if !is_hex_sha(candidate) {
        return false;
    }
    head.to_lowercase().starts_with(&candidate.to_lowercase())
}

/// Scan PR comments for override commands.
///
/// Grammar: a line `<command> sha=<7-40 hex> [reviewers=a,b]` followed by a
/// `Reason:` line. The reason continues over following lines until a blank
/// line or the end of the comment. Anything not matching the grammar is
/// ignored outright.
pub fn parse_overrides(
    comments: &[PrComment],
    command: &str,
    legacy_command: &str,
) -> Vec<OverrideCommand> {
    let mut out = Vec::new();
    for comment in comments {
        let lines: Vec<&str> = comment.body.lines().collect();
        let mut i = 0;
        while i < lines.len() {
            let trimmed = lines[i].trim();
            let (rest, legacy) = if let Some(rest) = trimmed.strip_prefix(command) {
                (rest, false)
            } else if let Some(rest) = trimmed.strip_prefix(legacy_command) {
                (rest, true)
            } else {
                i += 1;
                continue;
            };

            let mut sha = None;
            let mut reviewers = Vec::new();
            for token in rest.split_whitespace() {
                if let Some(v) = token.strip_prefix("sha=") {
                    sha = Some(v.to_string());
                } else if let Some(v) = token.strip_prefix("reviewers=") {
                    reviewers = v
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
            }
            let Some(sha) = sha.filter(|s| is_hex_sha(s)) else {
                debug!(line = trimmed, "override command without valid sha, ignoring");
                i += 1;
                continue;
            };

            // Collect the reason from following lines.
            let mut reason = String::new();
            let mut j = i + 1;
            while j < lines.len() {
                let line = lines[j].trim();
                if line.is_empty() {
                    if !reason.is_empty() {
                        break;
                    }
                    j += 1;
                    continue;
                }
                if let Some(rest) = line.strip_prefix("Reason:") {
                    reason = rest.trim().to_string();
                    j += 1;
                    // multi-line reasons continue until a blank line
                    while j < lines.len() && !lines[j].trim().is_empty() {
                        reason.push('\n');
                        reason.push_str(lines[j].trim());
                        j += 1;
                    }
                    break;
                }
                // something other than a Reason line follows the command
                break;
            }

            out.push(OverrideCommand {
                sha,
                reason,
                actor: comment.author.clone(),
                reviewers,
                legacy,
            });
            i = j.max(i + 1);
        }
    }
    out
}

fn authorized(
    policy: OverridePolicy,
    actor: &str,
    pr_author: &str,
    permission: crate::github::ActorPermission,
) -> bool {
    match policy {
        OverridePolicy::PrAuthor => actor == pr_author || permission.has_write(),
        OverridePolicy::WriteAccess => permission.has_write(),
        OverridePolicy::MaintainersOnly => permission.is_maintainer(),
    }
}

/// Validate parsed override candidates against HEAD, the reason rule, and
/// each targeted reviewer's policy. `failed` names the codenames that
/// currently hold a FAIL verdict.
pub fn evaluate_overrides(
    candidates: &[OverrideCommand],
    config: &Config,
    state: &dyn PrState,
    failed: &[String],
) -> Result<OverrideOutcome> {
    let head = state.head_sha()?;
    let pr_author = state.pr_author()?;
    let mut outcome = OverrideOutcome::default();

    for candidate in candidates {
        if !sha_matches(&candidate.sha, &head) {
            outcome.rejected.push(RejectedOverride {
                actor: candidate.actor.clone(),
                sha: candidate.sha.clone(),
                rejection: format!("sha does not match HEAD {}", short_sha(&head)),
            });
            continue;
        }
        if candidate.reason.trim().is_empty() {
            outcome.rejected.push(RejectedOverride {
                actor: candidate.actor.clone(),
                sha: candidate.sha.clone(),
                rejection: "missing or empty Reason line".to_string(),
            });
            continue;
        }

        let targets: Vec<String> = if candidate.reviewers.is_empty() {
            failed.to_vec()
        } else {
            candidate.reviewers.clone()
        };
        if targets.is_empty() {
            outcome.rejected.push(RejectedOverride {
                actor: candidate.actor.clone(),
                sha: candidate.sha.clone(),
                rejection: "no failing reviewers to override".to_string(),
            });
            continue;
        }

        let permission = state.actor_permission(&candidate.actor)?;
        let mut rejection = None;
        for codename in &targets {
            let Some(profile) = config.get_reviewer_by_codename(codename) else {
                rejection = Some(format!("unknown reviewer: {codename}"));
                break;
            };
            if !authorized(profile.override_policy, &candidate.actor, &pr_author, permission) {
                rejection = Some(format!(
                    "{} lacks permission to override {codename}",
                    candidate.actor
                ));
                break;
            }
        }

        match rejection {
            Some(rejection) => outcome.rejected.push(RejectedOverride {
                actor: candidate.actor.clone(),
                sha: candidate.sha.clone(),
                rejection,
            }),
            None => {
                info!(actor = %candidate.actor, ?targets, "override applied");
                outcome.applied.push(AppliedOverride {
                    actor: candidate.actor.clone(),
                    sha: candidate.sha.clone(),
                    reason: candidate.reason.clone(),
                    reviewers: targets,
                });
            }
        }
    }
    Ok(outcome)
}

pub fn short_sha(sha: &str) -> &str {
    if sha.len() >= 7 { &sha[..7] } else { sha }
}
