use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for spawning a bounded child process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub log_prefix: String,
    /// When true the child starts from an empty environment and receives
    /// only the pairs in `env`. Secrets in the parent environment never
    /// leak through.
    pub clear_env: bool,
    pub env: Vec<(String, String)>,
    pub stdin_data: Option<String>,
}

/// Output from a completed (or killed) child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none() && !self.timed_out
    }

    pub fn stdout(&self) -> String {
        self.stdout_lines.join("\n")
    }

    pub fn stderr(&self) -> String {
        self.stderr_lines.join("\n")
    }

    /// Stdout and stderr concatenated, for failure classification.
    pub fn combined(&self) -> String {
        let mut s = self.stdout();
        if !self.stderr_lines.is_empty() {
            if !s.is_empty() {
                s.push('\n');
            }
            s.push_str(&self.stderr());
        }
        s
    }
}

/// Spawn a child process, stream its output line-by-line, and enforce a
/// wall-clock budget.
///
/// The child is placed in its own process group on Unix; on timeout the
/// whole group receives SIGTERM, then SIGKILL. A timeout is an *outcome*,
/// not an error: partial output is preserved and `timed_out` is set so the
/// caller can salvage whatever the child produced.
pub async fn run_bounded(config: ProcessConfig) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .stdin(if config.stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if config.clear_env {
        cmd.env_clear();
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", config.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Process("child has no pid".into()))?;

    if let Some(data) = config.stdin_data {
        let mut stdin = child.stdin.take().expect("stdin is piped");
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(data.as_bytes()).await {
                warn!("failed to write child stdin: {e}");
            }
            // stdin drops here, closing the pipe
        });
    }

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");

    let prefix_out = config.log_prefix.clone();
    let prefix_err = config.log_prefix.clone();

    let stdout_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("[{prefix_out}] {line}");
            lines.push(line);
        }
        lines
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("[{prefix_err}] {line}");
            lines.push(line);
        }
        lines
    });

    #[cfg(unix)]
    let signal_task = {
        let pgid = pid as i32;
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
            let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
            loop {
                tokio::select! {
                    _ = sigint.recv() => {
                        unsafe { libc::killpg(pgid, libc::SIGINT); }
                    }
                    _ = sigterm.recv() => {
                        unsafe { libc::killpg(pgid, libc::SIGTERM); }
                    }
                }
            }
        })
    };

    let mut timed_out = false;
    let status = if let Some(dur) = config.timeout {
        match tokio::time::timeout(dur, child.wait()).await {
            Ok(r) => r.map_err(|e| Error::Process(format!("wait error: {e}")))?,
            Err(_) => {
                timed_out = true;
                warn!(
                    "[{}] wall clock exceeded after {dur:?}, killing process group",
                    config.log_prefix
                );
                #[cfg(unix)]
                unsafe {
                    libc::killpg(pid as i32, libc::SIGTERM);
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
                #[cfg(unix)]
                unsafe {
                    libc::killpg(pid as i32, libc::SIGKILL);
                }
                #[cfg(not(unix))]
                {
                    let _ = child.kill().await;
                }
                child
                    .wait()
                    .await
                    .map_err(|e| Error::Process(format!("wait error after kill: {e}")))?
            }
        }
    } else {
        child
            .wait()
            .await
            .map_err(|e| Error::Process(format!("wait error: {e}")))?
    };

    #[cfg(unix)]
    signal_task.abort();

    // Pipes are closed once the group is dead; readers drain to EOF and
    // keep whatever partial output was written before the kill.
    let stdout_lines = stdout_task
        .await
        .map_err(|e| Error::Process(format!("stdout reader failed: {e}")))?;
    let stderr_lines = stderr_task
        .await
        .map_err(|e| Error::Process(format!("stderr reader failed: {e}")))?;

    let (mut exit_code, signal) = extract_exit_info(&status);
    if timed_out {
        exit_code = 124;
    }

    Ok(ProcessOutput {
        exit_code,
        signal,
        timed_out,
        stdout_lines,
        stderr_lines,
    })
}

fn extract_exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Option<Duration>) -> ProcessConfig {
        ProcessConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: std::env::temp_dir(),
            timeout,
            log_prefix: "test".to_string(),
            clear_env: false,
            env: vec![],
            stdin_data: None,
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let out = run_bounded(sh("echo one; echo two >&2; echo three", None))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_lines, vec!["one", "three"]);
        assert_eq!(out.stderr_lines, vec!["two"]);
        assert!(out.combined().contains("two"));
    }

    #[tokio::test]
    async fn nonzero_exit_reported() {
        let out = run_bounded(sh("echo err >&2; exit 3", None)).await.unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr_lines, vec!["err"]);
    }

    #[tokio::test]
    async fn timeout_preserves_partial_output() {
        let out = run_bounded(sh(
            "echo early; sleep 30; echo late",
            Some(Duration::from_millis(300)),
        ))
        .await
        .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, 124);
        assert_eq!(out.stdout_lines, vec!["early"]);
    }

    #[tokio::test]
    async fn stdin_data_delivered() {
        let mut config = sh("cat", None);
        config.stdin_data = Some("hello stdin".to_string());
        let out = run_bounded(config).await.unwrap();
        assert_eq!(out.stdout_lines, vec!["hello stdin"]);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn clear_env_strips_parent_variables() {
        // SAFETY: test-only env mutation; serialized by the test harness
        // running this module's env tests in one process.
        unsafe { std::env::set_var("CERBERUS_TEST_SECRET", "leak") };
        let mut config = sh("echo \"v=${CERBERUS_TEST_SECRET:-unset}\"", None);
        config.clear_env = true;
        config.env = vec![("PATH".to_string(), std::env::var("PATH").unwrap())];
        let out = run_bounded(config).await.unwrap();
        assert_eq!(out.stdout_lines, vec!["v=unset"]);
        unsafe { std::env::remove_var("CERBERUS_TEST_SECRET") };
    }

    #[tokio::test]
    async fn allow_listed_env_passes_through() {
        let mut config = sh("echo \"k=$CERBERUS_TEST_KEY\"", None);
        config.clear_env = true;
        config.env = vec![
            ("PATH".to_string(), std::env::var("PATH").unwrap()),
            ("CERBERUS_TEST_KEY".to_string(), "sk-test".to_string()),
        ];
        let out = run_bounded(config).await.unwrap();
        assert_eq!(out.stdout_lines, vec!["k=sk-test"]);
    }

    #[tokio::test]
    async fn missing_binary_is_process_error() {
        let config = ProcessConfig {
            command: "/nonexistent/cerberus-cli".to_string(),
            args: vec![],
            working_dir: std::env::temp_dir(),
            timeout: None,
            log_prefix: "test".to_string(),
            clear_env: false,
            env: vec![],
            stdin_data: None,
        };
        let err = run_bounded(config).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
