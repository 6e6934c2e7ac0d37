//! Remote command dispatch into a running service instance.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("target {pod}/{container} is unreachable: {reason}")]
    Unreachable {
        pod: String,
        container: String,
        reason: String,
    },
    #[error("command in {pod}/{container} exceeded the {timeout:?} budget")]
    Timeout {
        pod: String,
        container: String,
        timeout: Duration,
    },
    #[error("command in {pod}/{container} exited with status {status}: {stderr}")]
    NonZeroExit {
        pod: String,
        container: String,
        status: i32,
        stderr: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Channel for running a command inside a pod container. Every call is
/// bounded by the configured per-call timeout.
pub trait ExecChannel: Send + Sync {
    fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, ExecError>;
}

/// Runs callables as local processes. Used by the standalone daemon, where
/// the "containers" are plain processes on the host.
#[derive(Debug, Clone)]
pub struct LocalExec {
    pub timeout: Duration,
}

impl LocalExec {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ExecChannel for LocalExec {
    fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, ExecError> {
        let Some((program, args)) = command.split_first() else {
            return Err(ExecError::Unreachable {
                pod: pod.to_string(),
                container: container.to_string(),
                reason: "empty command".to_string(),
            });
        };

        let mut child = std::process::Command::new(program)
            .args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|err| ExecError::Unreachable {
                pod: pod.to_string(),
                container: container.to_string(),
                reason: err.to_string(),
            })?;

        let deadline = std::time::Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {
                    if std::time::Instant::now() >= deadline {
                        let _ = child.kill();
                        return Err(ExecError::Timeout {
                            pod: pod.to_string(),
                            container: container.to_string(),
                            timeout: self.timeout,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(err) => {
                    return Err(ExecError::Unreachable {
                        pod: pod.to_string(),
                        container: container.to_string(),
                        reason: err.to_string(),
                    })
                }
            }
        }

        let output = child.wait_with_output().map_err(|err| ExecError::Unreachable {
            pod: pod.to_string(),
            container: container.to_string(),
            reason: err.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        match output.status.code() {
            Some(0) => Ok(ExecOutput { stdout, stderr }),
            Some(status) => Err(ExecError::NonZeroExit {
                pod: pod.to_string(),
                container: container.to_string(),
                status,
                stderr,
            }),
            None => Err(ExecError::Unreachable {
                pod: pod.to_string(),
                container: container.to_string(),
                reason: "terminated by signal".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> LocalExec {
        LocalExec::new(Duration::from_secs(5))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn local_exec_captures_stdout() {
        let output = local().exec("demo", "svc", "main", &sh("echo hello")).unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn local_exec_reports_nonzero_exit_with_stderr() {
        let err = local()
            .exec("demo", "svc", "main", &sh("echo oops >&2; exit 3"))
            .unwrap_err();
        match err {
            ExecError::NonZeroExit { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert_eq!(stderr.trim(), "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn local_exec_times_out_runaway_commands() {
        let exec = LocalExec::new(Duration::from_millis(100));
        let err = exec.exec("demo", "svc", "main", &sh("sleep 5")).unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }
}
