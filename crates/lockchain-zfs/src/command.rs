//! Execution wrapper for invoking `zfs` and `zpool`.
//!
//! Every invocation is bounded by the configured per-call timeout; a child that
//! overruns it is killed and reported as a transient provider error.

use lockchain_core::error::{LockchainError, LockchainResult};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub(crate) struct CommandRunner {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub(crate) fn success(&self) -> bool {
        self.status == 0
    }

    /// Stderr when present, otherwise stdout; trimmed.
    pub(crate) fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

impl CommandRunner {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub(crate) fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run the binary with `args`, feeding `input` on stdin when present.
    pub(crate) fn run(&self, args: &[&str], input: Option<&[u8]>) -> LockchainResult<Output> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            LockchainError::Provider(format!("failed to spawn {}: {err}", self.binary.display()))
        })?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // A child that exits before draining stdin surfaces through its status.
                if let Err(err) = stdin.write_all(payload) {
                    log::debug!("{} closed stdin early: {err}", self.binary.display());
                }
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> LockchainResult<Output> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        let Some(status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(LockchainError::Provider(format!(
                "{} timed out after {:?}",
                self.binary.display(),
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| LockchainError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| LockchainError::Provider("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            status: status.code().unwrap_or(-1),
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<LockchainResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> LockchainResult<String> {
        let Some(mut reader) = pipe else {
            return Ok(String::new());
        };
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(timeout: Duration) -> CommandRunner {
        CommandRunner::new(PathBuf::from("/bin/sh"), timeout)
    }

    #[test]
    fn captures_status_and_streams() {
        let out = shell(Duration::from_secs(5))
            .run(&["-c", "echo out; echo err >&2; exit 3"], None)
            .unwrap();
        assert_eq!(out.status, 3);
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.diagnostic(), "err");
    }

    #[test]
    fn forwards_stdin_payload() {
        let out = shell(Duration::from_secs(5))
            .run(&["-c", "wc -c"], Some(&[7u8; 32]))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "32");
    }

    #[test]
    fn kills_children_that_overrun_the_timeout() {
        let started = Instant::now();
        let err = shell(Duration::from_millis(200))
            .run(&["-c", "sleep 10"], None)
            .unwrap_err();
        assert!(matches!(err, LockchainError::Provider(ref msg) if msg.contains("timed out")));
        assert!(err.is_transient());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_binary_is_a_provider_error() {
        let runner = CommandRunner::new(PathBuf::from("/nonexistent/zfs"), Duration::from_secs(1));
        assert!(matches!(
            runner.run(&["list"], None),
            Err(LockchainError::Provider(_))
        ));
    }
}
