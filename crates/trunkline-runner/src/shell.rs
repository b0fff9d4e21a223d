//! Shell-based step execution on the host.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};
use trunkline_core::ports::{CommandExecutor, StepContext, StepResult};
use trunkline_core::{Error, Result};

/// Configuration for host step execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Executor-level timeout. Unset means a step may run forever.
    pub timeout_seconds: Option<u64>,
    pub shell: String,
    pub shell_args: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let (shell, flag) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };
        Self {
            timeout_seconds: None,
            shell: shell.to_string(),
            shell_args: vec![flag.to_string()],
        }
    }
}

/// Shell executor for running step commands on the host.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    config: RunnerConfig,
}

impl ShellExecutor {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }
}

async fn stream_lines<R>(reader: R, job: String, step: String, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "trunkline::step", job = %job, step = %step, stream, "{}", line);
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, ctx: &StepContext) -> Result<StepResult> {
        let start = std::time::Instant::now();

        debug!(command = %ctx.command, workspace = %ctx.workspace.display(), "Executing shell command");

        let mut child = Command::new(&self.config.shell)
            .args(&self.config.shell_args)
            .arg(&ctx.command)
            .current_dir(&ctx.workspace)
            .envs(&ctx.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", ctx.command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr not captured".to_string()))?;

        let stdout_handle = tokio::spawn(stream_lines(
            stdout,
            ctx.job.clone(),
            ctx.step.clone(),
            "stdout",
        ));
        let stderr_handle = tokio::spawn(stream_lines(
            stderr,
            ctx.job.clone(),
            ctx.step.clone(),
            "stderr",
        ));

        let wait_result = match self.config.timeout_seconds {
            Some(timeout_secs) => {
                match timeout(Duration::from_secs(timeout_secs), child.wait()).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(timeout_secs, step = %ctx.step, "Command timed out, killing process");
                        let _ = child.kill().await;
                        return Err(Error::StepTimeout {
                            seconds: timeout_secs,
                        });
                    }
                }
            }
            None => child.wait().await,
        };

        let _ = stdout_handle.await;
        let _ = stderr_handle.await;

        let status = wait_result?;
        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(exit_code, duration_ms, "Command completed");

        Ok(StepResult {
            exit_code,
            duration_ms,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn ctx(command: &str, workspace: &Path) -> StepContext {
        StepContext {
            job: "test (platform=ubuntu)".to_string(),
            step: "run".to_string(),
            command: command.to_string(),
            workspace: workspace.to_path_buf(),
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_shell_executor_success() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellExecutor::default()
            .execute(&ctx("echo hello", dir.path()))
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_shell_executor_failure() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellExecutor::default()
            .execute(&ctx("exit 3", dir.path()))
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_shell_executor_passes_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut step = ctx(r#"test "$MATRIX_PLATFORM" = ubuntu"#, dir.path());
        step.env
            .insert("MATRIX_PLATFORM".to_string(), "ubuntu".to_string());
        let result = ShellExecutor::default().execute(&step).await.unwrap();
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_shell_executor_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new(RunnerConfig {
            timeout_seconds: Some(1),
            ..Default::default()
        });
        let err = executor
            .execute(&ctx("sleep 5", dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StepTimeout { seconds: 1 }));
    }

    #[tokio::test]
    async fn test_shell_executor_missing_workspace() {
        let err = ShellExecutor::default()
            .execute(&ctx("true", Path::new("/definitely/not/here")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }
}
