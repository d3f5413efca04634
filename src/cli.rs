use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// cerberus — multi-reviewer PR gate
#[derive(Parser, Debug)]
#[command(name = "cerberus", version, about)]
pub struct Cli {
    /// Path to the cerberus config document
    #[arg(long, global = true, default_value = ".cerberus/cerberus.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Expand the reviewer roster into the task list for a CI matrix
    Matrix {
        /// Restrict to one wave's reviewers
        #[arg(long)]
        wave: Option<String>,

        /// Model tier chosen by the complexity router (flash/standard/pro)
        #[arg(long)]
        tier: Option<String>,
    },

    /// Run one reviewer against a diff and write its verdict artifact
    Review {
        /// Perspective to review from (must exist in the roster)
        #[arg(long)]
        perspective: String,

        /// Path to the PR diff file
        #[arg(long)]
        diff: PathBuf,

        /// Directory for artifacts (verdict, descriptor, stderr log)
        #[arg(long)]
        out: PathBuf,

        #[arg(long)]
        wave: Option<String>,

        #[arg(long)]
        tier: Option<String>,

        /// Action-level model override (wins over every pool)
        #[arg(long)]
        model: Option<String>,

        /// Total wall-clock budget in seconds (default from config)
        #[arg(long)]
        timeout: Option<u64>,

        /// Consumer checkout the reviewer CLI runs in
        #[arg(long, default_value = ".")]
        workspace: PathBuf,

        /// Directory of prompt template overrides
        #[arg(long)]
        prompts_dir: Option<String>,

        #[arg(long, default_value = "")]
        pr_title: String,

        #[arg(long, default_value = "")]
        pr_author: String,

        /// File holding the PR body (may contain anything)
        #[arg(long)]
        pr_body_file: Option<PathBuf>,

        #[arg(long, default_value = "main")]
        base_branch: String,

        #[arg(long, default_value = "")]
        head_branch: String,
    },

    /// Join all reviewer verdicts into the cerberus verdict
    Aggregate {
        /// Directory holding `<perspective>.verdict.json` artifacts
        #[arg(long)]
        artifacts: PathBuf,

        /// PR snapshot JSON (head sha, comments, permissions)
        #[arg(long, conflicts_with = "pr")]
        comments: Option<PathBuf>,

        /// Live PR number (uses the gh CLI)
        #[arg(long)]
        pr: Option<u64>,

        #[arg(long)]
        wave: Option<String>,

        #[arg(long)]
        tier: Option<String>,

        /// Write the CerberusVerdict JSON here (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Upsert the rendered verdict comment through the PR state
        #[arg(long)]
        post: bool,

        /// Exit 1 when the cerberus verdict is FAIL
        #[arg(long)]
        fail_on_verdict: bool,

        /// Exit 1 when the cerberus verdict is SKIP
        #[arg(long)]
        fail_on_skip: bool,
    },

    /// Decide whether the triage loop runs, and in which mode
    Triage {
        /// Trigger type: pr, comment, or schedule
        #[arg(long)]
        trigger: String,

        /// HEAD commit sha
        #[arg(long)]
        head: String,

        /// HEAD commit message (for the [triage] loop breaker)
        #[arg(long, default_value = "")]
        head_message: String,

        #[arg(long, conflicts_with = "pr")]
        comments: Option<PathBuf>,

        #[arg(long)]
        pr: Option<u64>,

        /// Requested mode: diagnose or fix
        #[arg(long, default_value = "fix")]
        mode: String,

        /// Head repository is a fork of the target
        #[arg(long)]
        fork: bool,

        /// Workspace is not a true git checkout
        #[arg(long)]
        not_git: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_matrix() {
        let cli = Cli::parse_from(["cerberus", "matrix", "--wave", "wave1", "--tier", "flash"]);
        match cli.command {
            Command::Matrix { wave, tier } => {
                assert_eq!(wave.as_deref(), Some("wave1"));
                assert_eq!(tier.as_deref(), Some("flash"));
            }
            _ => panic!("expected matrix"),
        }
        assert_eq!(cli.config, ".cerberus/cerberus.toml");
    }

    #[test]
    fn parse_review_required_flags() {
        let cli = Cli::parse_from([
            "cerberus",
            "review",
            "--perspective",
            "security",
            "--diff",
            "/tmp/pr.diff",
            "--out",
            "/tmp/out",
        ]);
        match cli.command {
            Command::Review {
                perspective,
                diff,
                out,
                workspace,
                base_branch,
                ..
            } => {
                assert_eq!(perspective, "security");
                assert_eq!(diff, PathBuf::from("/tmp/pr.diff"));
                assert_eq!(out, PathBuf::from("/tmp/out"));
                assert_eq!(workspace, PathBuf::from("."));
                assert_eq!(base_branch, "main");
            }
            _ => panic!("expected review"),
        }
    }

    #[test]
    fn review_missing_perspective_rejected() {
        let result = Cli::try_parse_from(["cerberus", "review", "--diff", "d", "--out", "o"]);
        assert!(result.is_err());
    }

    #[test]
    fn parse_aggregate_flags() {
        let cli = Cli::parse_from([
            "cerberus",
            "aggregate",
            "--artifacts",
            "/tmp/artifacts",
            "--comments",
            "/tmp/pr.json",
            "--fail-on-verdict",
        ]);
        match cli.command {
            Command::Aggregate {
                artifacts,
                comments,
                fail_on_verdict,
                fail_on_skip,
                post,
                ..
            } => {
                assert_eq!(artifacts, PathBuf::from("/tmp/artifacts"));
                assert_eq!(comments, Some(PathBuf::from("/tmp/pr.json")));
                assert!(fail_on_verdict);
                assert!(!fail_on_skip);
                assert!(!post);
            }
            _ => panic!("expected aggregate"),
        }
    }

    #[test]
    fn aggregate_comments_conflicts_with_pr() {
        let result = Cli::try_parse_from([
            "cerberus",
            "aggregate",
            "--artifacts",
            "a",
            "--comments",
            "c",
            "--pr",
            "7",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn parse_triage_defaults() {
        let cli = Cli::parse_from([
            "cerberus",
            "triage",
            "--trigger",
            "pr",
            "--head",
            "abc1234",
        ]);
        match cli.command {
            Command::Triage {
                trigger,
                head,
                mode,
                fork,
                not_git,
                ..
            } => {
                assert_eq!(trigger, "pr");
                assert_eq!(head, "abc1234");
                assert_eq!(mode, "fix");
                assert!(!fork);
                assert!(!not_git);
            }
            _ => panic!("expected triage"),
        }
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let cli = Cli::parse_from(["cerberus", "matrix", "--config", "/etc/cerberus.toml"]);
        assert_eq!(cli.config, "/etc/cerberus.toml");
    }
}
