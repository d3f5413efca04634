use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::artifact::{ArtifactDescriptor, RunClassification, RunMetadata};
use crate::classify::{FailureClass, classify};
use crate::error::{Error, Result};
use crate::process::{ProcessConfig, ProcessOutput, run_bounded};
use crate::prompts::{PromptEngine, wrap_untrusted};
use crate::staging::{IsolatedHome, WorkspaceStaging};

/// Inline-diff cap for the fast-path prompt.
pub const MAX_INLINE_DIFF_BYTES: usize = 50 * 1024;
pub const DIFF_TRUNCATION_MARKER: &str = "\n[diff truncated]\n";

const MAX_RETRIES: u32 = 3;

/// PR metadata substituted into the prompt. All fields are author-supplied
/// and get wrapped in untrusted markers before rendering.
#[derive(Debug, Clone, Default)]
pub struct PrMeta {
    pub title: String,
    pub author: String,
    pub body: String,
    pub base_branch: String,
    pub head_branch: String,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: [Duration; 3],
    pub retry_after_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff: [
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ],
            retry_after_cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), preferring a provider
    /// `Retry-After` hint when present.
    pub fn delay(&self, retry: u32, retry_after: Option<u64>) -> Duration {
        if let Some(secs) = retry_after {
            return Duration::from_secs(secs).min(self.retry_after_cap);
        }
        let idx = (retry.saturating_sub(1) as usize).min(self.backoff.len() - 1);
        self.backoff[idx]
    }
}

/// Everything one reviewer run needs. Built by the CLI layer from config,
/// the matrix task, and PR metadata.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub codename: String,
    pub perspective: String,
    pub description: String,
    pub diff_path: PathBuf,
    /// `[primary] + fallback chain`, already resolved.
    pub models: Vec<String>,
    pub pr: PrMeta,
    pub cli: String,
    pub api_key_env: String,
    pub timeout_total: Duration,
    pub workspace: PathBuf,
    pub out_dir: PathBuf,
    /// (trusted source, workspace destination) pairs staged for the run.
    pub staging: Vec<(PathBuf, PathBuf)>,
    pub retry: RetryPolicy,
}

/// Fast-path sub-budget: a fifth of the total, clamped to [60, 120] seconds.
/// Runs under two minutes total keep everything for the primary attempt.
pub fn fastpath_budget(total: Duration) -> Duration {
    if total < Duration::from_secs(120) {
        return Duration::ZERO;
    }
    let fifth = total / 5;
    fifth.clamp(Duration::from_secs(60), Duration::from_secs(120))
}

/// Cut a diff at the inline cap, on a char boundary, appending the marker.
pub fn truncate_diff(diff: &str) -> String {
    if diff.len() <= MAX_INLINE_DIFF_BYTES {
        return diff.to_string();
    }
    let mut cut = MAX_INLINE_DIFF_BYTES;
    while !diff.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = diff[..cut].to_string();
    out.push_str(DIFF_TRUNCATION_MARKER);
    out
}

/// File paths touched by a unified diff, from `+++ b/` headers.
pub fn diff_file_list(diff: &str) -> Vec<String> {
    diff.lines()
        .filter_map(|line| line.strip_prefix("+++ b/"))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty() && p != "/dev/null")
        .collect()
}

/// Replace secret values in surfaced text before it reaches logs or
/// comments.
pub fn mask_secrets(text: &str, secrets: &[&str]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            out = out.replace(secret, "***");
        }
    }
    out
}

fn has_json_block(text: &str) -> bool {
    text.contains("```json")
}

fn read_if_present(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

struct AttemptLog {
    path: PathBuf,
    file: std::fs::File,
}

impl AttemptLog {
    fn create(out_dir: &Path, perspective: &str) -> Result<Self> {
        std::fs::create_dir_all(out_dir)?;
        let path = out_dir.join(format!("{perspective}.stderr.log"));
        let file = std::fs::File::create(&path)?;
        Ok(Self { path, file })
    }

    fn record(&mut self, attempt: u32, model: &str, output: &ProcessOutput, secret: &str) {
        let header = format!("=== attempt {attempt} model={model} exit={}\n", output.exit_code);
        let body = mask_secrets(&output.stderr(), &[secret]);
        let _ = self.file.write_all(header.as_bytes());
        let _ = self.file.write_all(body.as_bytes());
        let _ = self.file.write_all(b"\n");
    }
}

enum RunEnd {
    /// Output worth handing to salvage/parser, produced by `model_index`.
    Output { model_index: usize, output: ProcessOutput, timed_out: bool },
    /// Terminal API failure.
    Terminal { model_index: usize, class: FailureClass, detail: String },
    /// Primary budget expired between attempts.
    BudgetExhausted { model_index: usize },
}

/// Run one reviewer: retry/fallback state machine, salvage, fast path.
///
/// Always returns a descriptor; reviewer-internal failures become SKIP
/// classifications rather than errors. `Err` is reserved for environment
/// problems (unspawnable CLI, unwritable out dir).
pub async fn run_review(req: &ReviewRequest, engine: &PromptEngine) -> Result<ArtifactDescriptor> {
    let started = Instant::now();
    let home = IsolatedHome::new()?;
    let scratchpad = home.scratchpad_path(&req.perspective);

    let mut staging = WorkspaceStaging::new()?;
    for (source, dest) in &req.staging {
        staging.stage(source, dest)?;
    }

    let prompt = render_review_prompt(req, engine, &scratchpad)?;
    let fastpath = fastpath_budget(req.timeout_total);
    let primary_budget = req.timeout_total - fastpath;
    let deadline = started + primary_budget;
    let api_key = std::env::var(&req.api_key_env).unwrap_or_default();

    let mut log = AttemptLog::create(&req.out_dir, &req.perspective)?;
    let mut attempts: u32 = 0;

    let end = drive_models(
        req,
        &prompt,
        &home,
        &scratchpad,
        deadline,
        &mut log,
        &mut attempts,
        &api_key,
    )
    .await?;

    let descriptor = match end {
        RunEnd::Terminal {
            model_index,
            class,
            detail,
        } => {
            let title = class.api_error_title();
            let artifact_path = req.out_dir.join(format!("{}.review.md", req.perspective));
            let masked = mask_secrets(&detail, &[&api_key]);
            std::fs::write(&artifact_path, &masked)?;
            finish(
                req,
                artifact_path,
                Some(log.path.clone()),
                RunClassification::ApiError {
                    title,
                    detail: masked,
                },
                model_index,
                started,
                attempts,
            )
        }
        RunEnd::Output {
            model_index,
            output,
            timed_out,
        } => {
            salvage(
                req,
                engine,
                &home,
                &scratchpad,
                &output,
                model_index,
                timed_out,
                fastpath,
                started,
                attempts,
                &log.path,
                &api_key,
            )
            .await?
        }
        RunEnd::BudgetExhausted { model_index } => {
            // Nothing ran to completion; treat like a timeout with whatever
            // the scratchpad holds.
            let empty = ProcessOutput {
                exit_code: 124,
                signal: None,
                timed_out: true,
                stdout_lines: vec![],
                stderr_lines: vec![],
            };
            salvage(
                req,
                engine,
                &home,
                &scratchpad,
                &empty,
                model_index,
                true,
                fastpath,
                started,
                attempts,
                &log.path,
                &api_key,
            )
            .await?
        }
    };

    staging.restore()?;
    let path = ArtifactDescriptor::descriptor_path(&req.out_dir, &req.perspective);
    descriptor.save(&path)?;
    Ok(descriptor)
}

#[allow(clippy::too_many_arguments)]
async fn drive_models(
    req: &ReviewRequest,
    prompt: &str,
    home: &IsolatedHome,
    scratchpad: &Path,
    deadline: Instant,
    log: &mut AttemptLog,
    attempts: &mut u32,
    api_key: &str,
) -> Result<RunEnd> {
    let mut last_transient: Option<(usize, FailureClass, String)> = None;

    for (model_index, model) in req.models.iter().enumerate() {
        let mut retries: u32 = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(RunEnd::BudgetExhausted { model_index });
            }

            *attempts += 1;
            info!(
                perspective = %req.perspective,
                model = %model,
                attempt = *attempts,
                "invoking reviewer CLI"
            );
            let output = invoke_cli(req, model, prompt, remaining, home, api_key, false).await?;
            log.record(*attempts, model, &output, api_key);

            let scratch_content = read_if_present(scratchpad);
            let usable =
                !output.stdout().trim().is_empty() || !scratch_content.trim().is_empty();
            let combined = output.combined();
            let class = classify(output.exit_code, output.timed_out, &combined, usable);

            match class {
                FailureClass::Success => {
                    return Ok(RunEnd::Output {
                        model_index,
                        output,
                        timed_out: false,
                    });
                }
                FailureClass::Timeout => {
                    return Ok(RunEnd::Output {
                        model_index,
                        output,
                        timed_out: true,
                    });
                }
                FailureClass::AuthOrQuota(_) => {
                    // Same key everywhere; fallback is pointless.
                    warn!(perspective = %req.perspective, "terminal auth/quota failure");
                    return Ok(RunEnd::Terminal {
                        model_index,
                        class,
                        detail: combined,
                    });
                }
                FailureClass::UnknownNonZero => {
                    if usable {
                        // Delegate best-effort output to the parser.
                        return Ok(RunEnd::Output {
                            model_index,
                            output,
                            timed_out: false,
                        });
                    }
                    warn!(model = %model, exit = output.exit_code, "unknown failure, trying next model");
                    last_transient = Some((model_index, class, combined));
                    break;
                }
                FailureClass::Client4xx => {
                    warn!(model = %model, "client error, trying next model");
                    last_transient = Some((model_index, class, combined));
                    break;
                }
                transient => {
                    retries += 1;
                    last_transient = Some((model_index, transient, combined));
                    if retries > req.retry.max_retries {
                        warn!(model = %model, "transient retries exhausted, trying next model");
                        break;
                    }
                    let retry_after = match transient {
                        FailureClass::RateLimit { retry_after } => retry_after,
                        _ => None,
                    };
                    let delay = req
                        .retry
                        .delay(retries, retry_after)
                        .min(deadline.saturating_duration_since(Instant::now()));
                    info!(model = %model, retry = retries, ?delay, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // Every model exhausted.
    let (model_index, class, detail) =
        last_transient.unwrap_or((0, FailureClass::ProviderGeneric, String::new()));
    Ok(RunEnd::Terminal {
        model_index,
        class,
        detail,
    })
}

#[allow(clippy::too_many_arguments)]
async fn salvage(
    req: &ReviewRequest,
    engine: &PromptEngine,
    home: &IsolatedHome,
    scratchpad: &Path,
    output: &ProcessOutput,
    model_index: usize,
    timed_out: bool,
    fastpath: Duration,
    started: Instant,
    attempts: u32,
    stderr_path: &Path,
    api_key: &str,
) -> Result<ArtifactDescriptor> {
    let scratch = read_if_present(scratchpad);
    let stdout = output.stdout();
    let artifact_path = req.out_dir.join(format!("{}.review.md", req.perspective));

    // Preference order: json block in scratchpad, json block in stdout,
    // then any non-empty content.
    let selected = if has_json_block(&scratch) {
        Some(scratch)
    } else if has_json_block(&stdout) {
        Some(stdout.clone())
    } else if !scratch.trim().is_empty() {
        Some(scratch)
    } else if !stdout.trim().is_empty() {
        Some(stdout.clone())
    } else {
        None
    };

    if let Some(content) = selected {
        std::fs::write(&artifact_path, &content)?;
        return Ok(finish(
            req,
            artifact_path,
            Some(stderr_path.to_path_buf()),
            RunClassification::Ok,
            model_index,
            started,
            attempts,
        ));
    }

    let mut fastpath_attempted = false;
    if timed_out && fastpath > Duration::ZERO {
        fastpath_attempted = true;
        info!(perspective = %req.perspective, budget = ?fastpath, "running fast-path re-invocation");
        let model = &req.models[model_index];
        let prompt = render_fastpath_prompt(req, engine)?;
        let out = invoke_cli(req, model, &prompt, fastpath, home, api_key, true).await?;
        let text = out.stdout();
        if has_json_block(&text) {
            std::fs::write(&artifact_path, &text)?;
            return Ok(finish(
                req,
                artifact_path,
                Some(stderr_path.to_path_buf()),
                RunClassification::Ok,
                model_index,
                started,
                attempts + 1,
            ));
        }
        warn!(perspective = %req.perspective, "fast path produced no json block");
    }

    // Nothing salvageable: synthesize the timeout marker.
    let diff = read_if_present(&req.diff_path);
    let marker = timeout_marker(
        &req.perspective,
        req.timeout_total,
        &diff_file_list(&diff),
        fastpath_attempted,
    );
    std::fs::write(&artifact_path, marker)?;
    Ok(finish(
        req,
        artifact_path,
        Some(stderr_path.to_path_buf()),
        RunClassification::Timeout,
        model_index,
        started,
        attempts,
    ))
}

fn finish(
    req: &ReviewRequest,
    artifact_path: PathBuf,
    stderr_path: Option<PathBuf>,
    classification: RunClassification,
    model_index: usize,
    started: Instant,
    attempts: u32,
) -> ArtifactDescriptor {
    let model_used = req.models[model_index].clone();
    let primary_model = req.models[0].clone();
    let fallback_used = model_used != primary_model;
    ArtifactDescriptor {
        codename: req.codename.clone(),
        perspective: req.perspective.clone(),
        artifact_path,
        stderr_path,
        classification,
        metadata: RunMetadata {
            model_used,
            primary_model,
            fallback_used,
            runtime_seconds: started.elapsed().as_secs_f64(),
            attempts,
        },
    }
}

fn timeout_marker(
    perspective: &str,
    budget: Duration,
    files: &[String],
    fastpath_attempted: bool,
) -> String {
    let mut out = String::new();
    out.push_str("CERBERUS TIMEOUT MARKER\n");
    out.push_str(&format!("perspective: {perspective}\n"));
    out.push_str(&format!("budget_seconds: {}\n", budget.as_secs()));
    out.push_str(&format!("fast_path_attempted: {fastpath_attempted}\n"));
    out.push_str("diff_files:\n");
    for f in files {
        out.push_str(&format!("  - {f}\n"));
    }
    out
}

fn render_review_prompt(
    req: &ReviewRequest,
    engine: &PromptEngine,
    scratchpad: &Path,
) -> Result<String> {
    let mut vars = HashMap::new();
    vars.insert("perspective".to_string(), req.perspective.clone());
    vars.insert("codename".to_string(), req.codename.clone());
    vars.insert("description".to_string(), req.description.clone());
    vars.insert(
        "date".to_string(),
        chrono::Local::now().format("%Y-%m-%d").to_string(),
    );
    vars.insert(
        "diff_path".to_string(),
        req.diff_path.display().to_string(),
    );
    vars.insert(
        "scratchpad_path".to_string(),
        scratchpad.display().to_string(),
    );
    vars.insert("pr_title".to_string(), wrap_untrusted(&req.pr.title));
    vars.insert("pr_author".to_string(), wrap_untrusted(&req.pr.author));
    vars.insert("pr_body".to_string(), wrap_untrusted(&req.pr.body));
    vars.insert("base_branch".to_string(), wrap_untrusted(&req.pr.base_branch));
    vars.insert("head_branch".to_string(), wrap_untrusted(&req.pr.head_branch));
    engine.render("review", &vars)
}

fn render_fastpath_prompt(req: &ReviewRequest, engine: &PromptEngine) -> Result<String> {
    let diff = read_if_present(&req.diff_path);
    let mut vars = HashMap::new();
    vars.insert("perspective".to_string(), req.perspective.clone());
    vars.insert("codename".to_string(), req.codename.clone());
    vars.insert(
        "date".to_string(),
        chrono::Local::now().format("%Y-%m-%d").to_string(),
    );
    vars.insert("diff_content".to_string(), truncate_diff(&diff));
    engine.render("fastpath", &vars)
}

async fn invoke_cli(
    req: &ReviewRequest,
    model: &str,
    prompt: &str,
    timeout: Duration,
    home: &IsolatedHome,
    api_key: &str,
    fastpath: bool,
) -> Result<ProcessOutput> {
    let mut args = vec![
        "run".to_string(),
        "-m".to_string(),
        model.to_string(),
        "--agent".to_string(),
        req.perspective.clone(),
    ];
    if fastpath {
        args.push("--no-tools".to_string());
        args.push("--max-steps".to_string());
        args.push("1".to_string());
    }

    let mut env = vec![
        (
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_default(),
        ),
        ("HOME".to_string(), home.path().display().to_string()),
        ("TMPDIR".to_string(), home.path().display().to_string()),
    ];
    if !api_key.is_empty() {
        env.push((req.api_key_env.clone(), api_key.to_string()));
    }

    run_bounded(ProcessConfig {
        command: req.cli.clone(),
        args,
        working_dir: req.workspace.clone(),
        timeout: Some(timeout),
        log_prefix: format!("reviewer:{}", req.perspective),
        clear_env: true,
        env,
        stdin_data: Some(prompt.to_string()),
    })
    .await
    .map_err(|e| Error::Runner(e.to_string()))
}
