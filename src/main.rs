use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use cerberus::aggregate::{aggregate, load_verdicts};
use cerberus::cli::{Cli, Command};
use cerberus::config::{Config, Tier, UniformSelector};
use cerberus::error::{Error, Result};
use cerberus::github::{FilePrState, GithubPrState, PrState};
use cerberus::matrix::expand;
use cerberus::parser::parse_descriptor;
use cerberus::prompts::PromptEngine;
use cerberus::render::render_verdict_comment;
use cerberus::runner::{PrMeta, RetryPolicy, ReviewRequest, run_review};
use cerberus::triage::{TriageInput, TriageMode, TriageTrigger, decide};
use cerberus::verdict::{Finding, ReviewerVerdict, Severity, Stats, VerdictKind};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    }
}

fn parse_tier(tier: Option<&str>) -> Result<Option<Tier>> {
    match tier {
        None => Ok(None),
        Some(s) => Tier::parse(s)
            .map(Some)
            .ok_or_else(|| Error::ConfigValidation(format!("unknown tier: {s}"))),
    }
}

fn load_pr_state(comments: Option<&Path>, pr: Option<u64>) -> Result<Box<dyn PrState>> {
    match (comments, pr) {
        (Some(path), _) => Ok(Box::new(FilePrState::load(path)?)),
        (None, Some(n)) => Ok(Box::new(GithubPrState::new(n))),
        (None, None) => Err(Error::ConfigValidation(
            "either --comments or --pr is required".to_string(),
        )),
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(Path::new(&cli.config))?;

    match cli.command {
        Command::Matrix { wave, tier } => {
            let tier = parse_tier(tier.as_deref())?;
            let tasks = expand(&config, wave.as_deref(), tier)?;
            println!("{}", serde_json::to_string_pretty(&tasks).expect("tasks serialize"));
            Ok(0)
        }

        Command::Review {
            perspective,
            diff,
            out,
            wave,
            tier,
            model,
            timeout,
            workspace,
            prompts_dir,
            pr_title,
            pr_author,
            pr_body_file,
            base_branch,
            head_branch,
        } => {
            let profile = config.get_reviewer(&perspective)?.clone();
            let tier = parse_tier(tier.as_deref())?;
            let primary = config.resolve_model(
                &profile,
                tier,
                wave.as_deref(),
                model.as_deref(),
                &UniformSelector,
            )?;
            let models = config.model_chain(&primary);
            info!(perspective, primary = %primary, "reviewer starting");

            let pr_body = match pr_body_file {
                Some(path) => std::fs::read_to_string(&path)?,
                None => String::new(),
            };

            let request = ReviewRequest {
                codename: profile.codename.clone(),
                perspective: profile.perspective.clone(),
                description: profile.description.clone(),
                diff_path: diff,
                models,
                pr: PrMeta {
                    title: pr_title,
                    author: pr_author,
                    body: pr_body,
                    base_branch,
                    head_branch,
                },
                cli: config.runner.cli.clone(),
                api_key_env: config.runner.api_key_env.clone(),
                timeout_total: Duration::from_secs(
                    timeout.unwrap_or(config.runner.timeout_seconds),
                ),
                workspace: workspace.clone(),
                out_dir: out.clone(),
                staging: staging_pairs(&config, &workspace, &profile.perspective),
                retry: RetryPolicy::default(),
            };

            let engine = PromptEngine::new(prompts_dir);
            let verdict = match run_review(&request, &engine).await {
                Ok(descriptor) => parse_descriptor(&descriptor),
                Err(e) => {
                    warn!("reviewer run failed outside the CLI contract: {e}");
                    environment_failure_verdict(&profile.codename, &profile.perspective, &e)
                }
            };

            std::fs::create_dir_all(&out)?;
            let verdict_path = out.join(format!("{perspective}.verdict.json"));
            std::fs::write(
                &verdict_path,
                serde_json::to_string_pretty(&verdict).expect("verdict serializes"),
            )?;
            info!(path = %verdict_path.display(), verdict = %verdict.verdict, "verdict written");
            Ok(0)
        }

        Command::Aggregate {
            artifacts,
            comments,
            pr,
            wave,
            tier,
            out,
            post,
            fail_on_verdict,
            fail_on_skip,
        } => {
            let tier = parse_tier(tier.as_deref())?;
            let expected: Vec<(String, String)> = expand(&config, wave.as_deref(), tier)?
                .into_iter()
                .map(|t| (t.codename, t.perspective))
                .collect();
            let verdicts = load_verdicts(&artifacts, &expected);
            let state = load_pr_state(comments.as_deref(), pr)?;
            let cv = aggregate(&config, verdicts, state.as_ref(), wave.as_deref())?;

            let json = serde_json::to_string_pretty(&cv).expect("verdict serializes");
            match &out {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(path, &json)?;
                    let comment_path = path.with_extension("md");
                    std::fs::write(&comment_path, render_verdict_comment(&cv))?;
                }
                None => println!("{json}"),
            }

            if post {
                state.upsert_comment(
                    cerberus::render::VERDICT_MARKER,
                    &render_verdict_comment(&cv),
                )?;
            }

            let code = match cv.verdict {
                VerdictKind::Fail if fail_on_verdict => 1,
                VerdictKind::Skip if fail_on_skip => 1,
                _ => 0,
            };
            Ok(code)
        }

        Command::Triage {
            trigger,
            head,
            head_message,
            comments,
            pr,
            mode,
            fork,
            not_git,
        } => {
            let trigger = TriageTrigger::parse(&trigger)
                .ok_or_else(|| Error::ConfigValidation(format!("unknown trigger: {trigger}")))?;
            let mode = TriageMode::parse(&mode)
                .ok_or_else(|| Error::ConfigValidation(format!("unknown mode: {mode}")))?;
            let state = load_pr_state(comments.as_deref(), pr)?;
            let pr_comments = state.comments()?;

            let kill_switch = !config.triage.enabled
                || std::env::var("CERBERUS_TRIAGE_DISABLED").is_ok_and(|v| !v.is_empty());

            let record = decide(&TriageInput {
                trigger,
                head_sha: &head,
                head_commit_message: &head_message,
                comments: &pr_comments,
                kill_switch,
                is_fork: fork,
                is_git_checkout: !not_git,
                requested_mode: mode,
                bot_login: &config.overrides.trusted_bot_login,
                max_attempts: config.triage.max_attempts,
                stale_hours: config.triage.stale_hours,
                now: chrono::Utc::now(),
            });
            println!("{}", serde_json::to_string_pretty(&record).expect("record serializes"));
            Ok(0)
        }
    }
}

/// Files to stage into the consumer checkout before invoking the CLI:
/// the per-perspective agent definition and the project config, when the
/// trusted copies exist.
fn staging_pairs(
    config: &Config,
    workspace: &Path,
    perspective: &str,
) -> Vec<(PathBuf, PathBuf)> {
    let trusted = PathBuf::from(&config.runner.agents_dir);
    let mut pairs = Vec::new();
    let agent = trusted.join(format!("{perspective}.md"));
    if agent.is_file() {
        pairs.push((
            agent,
            workspace.join(".agentctl").join("agents").join(format!("{perspective}.md")),
        ));
    }
    let project = trusted.join("config.toml");
    if project.is_file() {
        pairs.push((project, workspace.join(".agentctl").join("config.toml")));
    }
    pairs
}

/// A run that failed outside the reviewer CLI contract (unspawnable binary,
/// unwritable artifact dir) still must not break the matrix job.
fn environment_failure_verdict(codename: &str, perspective: &str, err: &Error) -> ReviewerVerdict {
    ReviewerVerdict {
        reviewer: codename.to_string(),
        perspective: perspective.to_string(),
        verdict: VerdictKind::Skip,
        confidence: 0.0,
        summary: "api_error: API_ERROR".to_string(),
        findings: vec![Finding::synthetic(
            Severity::Info,
            "api_error",
            "API_ERROR",
            &format!("reviewer environment failure: {err}"),
        )],
        stats: Stats::default(),
        runtime_seconds: 0.0,
        model_used: String::new(),
        primary_model: String::new(),
        fallback_used: false,
        raw_review: None,
    }
}
