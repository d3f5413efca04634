use std::path::{Path, PathBuf};
use std::time::Duration;

use cerberus::artifact::RunClassification;
use cerberus::classify::ApiErrorTitle;
use cerberus::parser::parse_descriptor;
use cerberus::prompts::PromptEngine;
use cerberus::runner::{PrMeta, RetryPolicy, ReviewRequest, run_review};
use cerberus::verdict::{SkipKind, VerdictKind};

/// Write a bash script standing in for the reviewer CLI.
///
/// The returned path lives inside `dir`, which the caller keeps alive for
/// the duration of the test.
fn mock_cli(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("mock_agentctl");
    std::fs::write(&path, format!("#!/bin/bash\n{script}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        backoff: [Duration::from_millis(5); 3],
        retry_after_cap: Duration::from_millis(10),
    }
}

struct TestRun {
    _tmp: tempfile::TempDir,
    request: ReviewRequest,
}

fn request(script: &str, models: &[&str], timeout: Duration) -> TestRun {
    let tmp = tempfile::tempdir().unwrap();
    let cli = mock_cli(tmp.path(), script);
    let diff_path = tmp.path().join("pr.diff");
    std::fs::write(
        &diff_path,
        "--- a/src/a.rs\n+++ b/src/a.rs\n@@ -1 +1 @@\n-old\n+new\n",
    )
    .unwrap();
    let out_dir = tmp.path().join("out");
    let workspace = tmp.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();

    let request = ReviewRequest {
        codename: "guard".to_string(),
        perspective: "security".to_string(),
        description: "trust boundaries".to_string(),
        diff_path,
        models: models.iter().map(|m| m.to_string()).collect(),
        pr: PrMeta {
            title: "Add widget".to_string(),
            author: "alice".to_string(),
            body: "does things".to_string(),
            base_branch: "main".to_string(),
            head_branch: "feature".to_string(),
        },
        cli: cli.to_string_lossy().to_string(),
        api_key_env: "CERBERUS_TEST_API_KEY".to_string(),
        timeout_total: timeout,
        workspace,
        out_dir,
        staging: vec![],
        retry: fast_retry(),
    };
    TestRun { _tmp: tmp, request }
}

const GOOD_VERDICT: &str = r#"cat <<'EOF'
Review complete.
```json
{"reviewer": "guard", "perspective": "security", "verdict": "PASS",
 "confidence": 0.9, "summary": "clean", "findings": [], "stats": {}}
```
EOF"#;

#[tokio::test]
async fn success_produces_ok_descriptor_and_pass_verdict() {
    let run = request(GOOD_VERDICT, &["sonnet-4"], Duration::from_secs(30));
    let engine = PromptEngine::new(None);
    let desc = run_review(&run.request, &engine).await.unwrap();

    assert_eq!(desc.classification, RunClassification::Ok);
    assert_eq!(desc.metadata.model_used, "sonnet-4");
    assert!(!desc.metadata.fallback_used);
    assert_eq!(desc.metadata.attempts, 1);

    let verdict = parse_descriptor(&desc);
    assert_eq!(verdict.verdict, VerdictKind::Pass);
    assert_eq!(verdict.reviewer, "guard");
    assert_eq!(verdict.model_used, "sonnet-4");
}

#[tokio::test]
async fn prompt_delivered_on_stdin() {
    // The mock consumes its stdin before answering.
    let script = r#"
cat > "$HOME/prompt-capture.txt"
cat <<'EOF'
```json
{"reviewer": "guard", "perspective": "security", "verdict": "PASS",
 "confidence": 0.9, "summary": "clean", "findings": [], "stats": {}}
```
EOF"#;
    let run = request(script, &["sonnet-4"], Duration::from_secs(30));
    let engine = PromptEngine::new(None);
    let desc = run_review(&run.request, &engine).await.unwrap();
    assert_eq!(desc.classification, RunClassification::Ok);
    // The isolated HOME is gone after the run; the prompt capture lived and
    // died with it. What we can still assert: the run consumed stdin fine
    // and the artifact carries the stdout verdict.
    let artifact = std::fs::read_to_string(&desc.artifact_path).unwrap();
    assert!(artifact.contains("```json"));
}

#[tokio::test]
async fn credits_depleted_is_terminal_without_fallback() {
    // S6: insufficient_credits on stderr stops the run outright.
    let script = r#"echo "Error: insufficient_credits" >&2; exit 1"#;
    let run = request(script, &["sonnet-4", "haiku-4"], Duration::from_secs(30));
    let engine = PromptEngine::new(None);
    let desc = run_review(&run.request, &engine).await.unwrap();

    match &desc.classification {
        RunClassification::ApiError { title, .. } => {
            assert_eq!(*title, ApiErrorTitle::ApiCreditsDepleted);
        }
        other => panic!("expected ApiError, got {other:?}"),
    }
    // No fallback was attempted: a single invocation.
    assert_eq!(desc.metadata.attempts, 1);

    let verdict = parse_descriptor(&desc);
    assert_eq!(verdict.verdict, VerdictKind::Skip);
    assert_eq!(verdict.skip_kind(), Some(SkipKind::ApiError));
    assert_eq!(verdict.findings[0].title, "API_CREDITS_DEPLETED");
}

#[tokio::test]
async fn client_error_falls_back_to_next_model() {
    // First model 400s; second model succeeds.
    let script = format!(
        r#"
model="$3"
if [ "$model" = "sonnet-4" ]; then
  echo "HTTP 400 invalid_request_error" >&2
  exit 1
fi
{GOOD_VERDICT}"#
    );
    let run = request(&script, &["sonnet-4", "haiku-4"], Duration::from_secs(30));
    let engine = PromptEngine::new(None);
    let desc = run_review(&run.request, &engine).await.unwrap();

    assert_eq!(desc.classification, RunClassification::Ok);
    assert_eq!(desc.metadata.model_used, "haiku-4");
    assert_eq!(desc.metadata.primary_model, "sonnet-4");
    assert!(desc.metadata.fallback_used);

    let verdict = parse_descriptor(&desc);
    assert!(verdict.fallback_used);
}

#[tokio::test]
async fn transient_error_retried_then_succeeds() {
    // Fails once with a 503, succeeds on the retry. State carried in a
    // side file because each attempt is a fresh process.
    let script = format!(
        r#"
if [ ! -f "$TMPDIR/attempted" ]; then
  touch "$TMPDIR/attempted"
  echo "HTTP 503 service unavailable" >&2
  exit 1
fi
{GOOD_VERDICT}"#
    );
    let run = request(&script, &["sonnet-4"], Duration::from_secs(30));
    let engine = PromptEngine::new(None);
    let desc = run_review(&run.request, &engine).await.unwrap();
    assert_eq!(desc.classification, RunClassification::Ok);
    assert_eq!(desc.metadata.attempts, 2);
    assert!(!desc.metadata.fallback_used);
}

#[tokio::test]
async fn empty_output_everywhere_ends_in_api_error_skip() {
    let script = "exit 0";
    let run = request(script, &["sonnet-4", "haiku-4"], Duration::from_secs(30));
    let engine = PromptEngine::new(None);
    let desc = run_review(&run.request, &engine).await.unwrap();

    assert!(matches!(desc.classification, RunClassification::ApiError { .. }));
    // retried once per model (fast_retry policy), both models exhausted
    assert_eq!(desc.metadata.attempts, 4);

    let verdict = parse_descriptor(&desc);
    assert_eq!(verdict.skip_kind(), Some(SkipKind::ApiError));
}

#[tokio::test]
async fn timeout_salvages_scratchpad_json() {
    // The model writes a complete verdict to the scratchpad, then hangs.
    let script = r#"
cat > "$HOME/security-scratchpad.md" <<'EOF'
progress notes
```json
{"reviewer": "guard", "perspective": "security", "verdict": "PASS",
 "confidence": 0.8, "summary": "from scratchpad", "findings": [], "stats": {}}
```
EOF
sleep 60"#;
    let run = request(script, &["sonnet-4"], Duration::from_secs(2));
    let engine = PromptEngine::new(None);
    let desc = run_review(&run.request, &engine).await.unwrap();

    assert_eq!(desc.classification, RunClassification::Ok);
    let verdict = parse_descriptor(&desc);
    assert_eq!(verdict.verdict, VerdictKind::Pass);
    assert_eq!(verdict.summary, "from scratchpad");
    assert!(!verdict.fallback_used);
}

#[tokio::test]
async fn timeout_without_output_writes_marker() {
    let script = "sleep 60";
    // 2s total: fast path disabled, straight to the marker.
    let run = request(script, &["sonnet-4"], Duration::from_secs(2));
    let engine = PromptEngine::new(None);
    let desc = run_review(&run.request, &engine).await.unwrap();

    assert_eq!(desc.classification, RunClassification::Timeout);
    let marker = std::fs::read_to_string(&desc.artifact_path).unwrap();
    assert!(marker.contains("CERBERUS TIMEOUT MARKER"));
    assert!(marker.contains("perspective: security"));
    assert!(marker.contains("src/a.rs"));
    assert!(marker.contains("fast_path_attempted: false"));

    let verdict = parse_descriptor(&desc);
    assert_eq!(verdict.verdict, VerdictKind::Skip);
    assert_eq!(verdict.skip_kind(), Some(SkipKind::Timeout));
}

#[tokio::test]
async fn partial_stdout_on_timeout_goes_to_parser() {
    // Timed out mid-answer with free-form text: salvage keeps the partial
    // text and the parser turns it into a parse_failure SKIP.
    let script = r#"echo "I was looking at src/a.rs when"; sleep 60"#;
    let run = request(script, &["sonnet-4"], Duration::from_secs(2));
    let engine = PromptEngine::new(None);
    let desc = run_review(&run.request, &engine).await.unwrap();

    assert_eq!(desc.classification, RunClassification::Ok);
    let verdict = parse_descriptor(&desc);
    assert_eq!(verdict.skip_kind(), Some(SkipKind::ParseFailure));
    assert!(verdict.raw_review.as_deref().unwrap().contains("src/a.rs"));
}

#[tokio::test]
async fn workspace_restored_after_run() {
    // P7: the consumer checkout is byte-identical after the run.
    let tmp = tempfile::tempdir().unwrap();
    let trusted = tmp.path().join("trusted");
    std::fs::create_dir_all(&trusted).unwrap();
    let agent_src = trusted.join("security.md");
    std::fs::write(&agent_src, "trusted agent definition").unwrap();

    let mut run = request(GOOD_VERDICT, &["sonnet-4"], Duration::from_secs(30));
    let staged_dest = run
        .request
        .workspace
        .join(".agentctl")
        .join("agents")
        .join("security.md");
    // Pre-existing consumer file at the staging destination
    std::fs::create_dir_all(staged_dest.parent().unwrap()).unwrap();
    std::fs::write(&staged_dest, "consumer's own agent file").unwrap();
    run.request.staging = vec![(agent_src, staged_dest.clone())];

    let engine = PromptEngine::new(None);
    let desc = run_review(&run.request, &engine).await.unwrap();
    assert_eq!(desc.classification, RunClassification::Ok);
    assert_eq!(
        std::fs::read_to_string(&staged_dest).unwrap(),
        "consumer's own agent file"
    );
}

#[tokio::test]
async fn stderr_preserved_on_disk() {
    let script = r#"echo "diagnostic noise" >&2; echo "HTTP 400 bad request" >&2; exit 1"#;
    let run = request(script, &["sonnet-4"], Duration::from_secs(30));
    let engine = PromptEngine::new(None);
    let desc = run_review(&run.request, &engine).await.unwrap();
    let log = std::fs::read_to_string(desc.stderr_path.as_ref().unwrap()).unwrap();
    assert!(log.contains("diagnostic noise"));
    assert!(log.contains("attempt 1"));
}

#[tokio::test]
async fn descriptor_persisted_next_to_artifact() {
    let run = request(GOOD_VERDICT, &["sonnet-4"], Duration::from_secs(30));
    let engine = PromptEngine::new(None);
    let desc = run_review(&run.request, &engine).await.unwrap();
    let path = cerberus::artifact::ArtifactDescriptor::descriptor_path(
        &run.request.out_dir,
        "security",
    );
    let loaded = cerberus::artifact::ArtifactDescriptor::load(&path).unwrap();
    assert_eq!(loaded, desc);
}
