use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    #[error("command `{cmd}` timed out after {timeout:?}")]
    Timeout { cmd: String, timeout: Duration },
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of a finished subprocess.
#[derive(Debug)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

pub fn render(program: &str, args: &[&str]) -> String {
    let mut line = String::from(program);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Run a subprocess with the default timeout.
pub async fn run(program: &str, args: &[&str]) -> Result<CmdOutput, CmdError> {
    run_with_timeout(program, args, DEFAULT_CMD_TIMEOUT).await
}

/// Run a subprocess, killing it if it outlives `timeout`.
///
/// The child is killed and reaped on expiry so no zombie survives a hung
/// `ovs-vsctl` or `ip` invocation.
pub async fn run_with_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CmdOutput, CmdError> {
    let rendered = render(program, args);
    debug!(cmd = %rendered, "running");

    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CmdError::Spawn {
            cmd: rendered.clone(),
            source,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(CmdError::Spawn {
                cmd: rendered,
                source,
            })
        }
        Err(_) => {
            return Err(CmdError::Timeout {
                cmd: rendered,
                timeout,
            })
        }
    };

    Ok(CmdOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run("sh", &["-c", "echo hello"]).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let out = run("sh", &["-c", "echo bad >&2; exit 3"]).await.unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stderr_trimmed(), "bad");
    }

    #[tokio::test]
    async fn kills_child_on_timeout() {
        let err = run_with_timeout("sleep", &["30"], Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            CmdError::Timeout { cmd, .. } => assert_eq!(cmd, "sleep 30"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
