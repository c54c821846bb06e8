//! Non-interactive shell command execution with a wall-clock timeout and a
//! combined output cap.
//!
//! There is no sandbox here. A command runs with the gateway's own user and
//! sees the whole host; the only limits are the allow-list, the rate limit,
//! the timeout, the output cap and a substring screen of blocked patterns.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use utoipa::ToSchema;

use console_gateway_error::{GatewayError, ProblemDetails};

use crate::config::GatewayConfig;
use crate::stream::{Producer, ProducerFuture, StreamEnd, StreamSink};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecResponse {
    pub output: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetails>,
}

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    timeout: Duration,
    output_cap: usize,
    blocked_patterns: Vec<String>,
}

impl CommandExecutor {
    pub fn new(timeout: Duration, output_cap: usize, blocked_patterns: Vec<String>) -> Self {
        Self {
            timeout,
            output_cap,
            blocked_patterns,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.command_timeout,
            config.output_cap_bytes,
            config.blocked_patterns.clone(),
        )
    }

    /// Rejects empty commands and commands containing a blocked pattern.
    pub fn screen(&self, command: &str) -> Result<(), GatewayError> {
        if command.trim().is_empty() {
            return Err(GatewayError::InvalidRequest {
                message: "command is empty".to_string(),
            });
        }
        let lowered = command.to_lowercase();
        for pattern in &self.blocked_patterns {
            if !pattern.is_empty() && lowered.contains(&pattern.to_lowercase()) {
                tracing::warn!(pattern = %pattern, "command blocked");
                return Err(GatewayError::CommandBlocked {
                    pattern: pattern.clone(),
                });
            }
        }
        Ok(())
    }

    /// Screens the command and binds it to a working directory. Nothing is
    /// spawned until the returned producer runs.
    pub fn prepare(&self, command: &str, cwd: PathBuf) -> Result<CommandExecution, GatewayError> {
        self.screen(command)?;
        Ok(CommandExecution {
            command: command.to_string(),
            cwd,
            timeout: self.timeout,
            output_cap: self.output_cap,
        })
    }
}

/// One invocation, owned by the stream it feeds.
#[derive(Debug)]
pub struct CommandExecution {
    command: String,
    cwd: PathBuf,
    timeout: Duration,
    output_cap: usize,
}

impl Producer for CommandExecution {
    fn run(self: Box<Self>, sink: StreamSink) -> ProducerFuture {
        Box::pin(async move { self.execute(sink).await })
    }
}

enum PumpOutcome {
    Eof,
    Truncated,
    Disconnected,
    Failed(std::io::Error),
}

impl CommandExecution {
    async fn execute(self, sink: StreamSink) -> StreamEnd {
        let started = Instant::now();
        let mut cmd = shell_command(&self.command);
        cmd.current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn command");
                return StreamEnd::Failed(GatewayError::Internal {
                    message: format!("failed to spawn command: {err}"),
                });
            }
        };
        let mut group = ProcessGroup::new(child.id());
        tracing::info!(
            pid = child.id().unwrap_or_default(),
            cwd = %self.cwd.display(),
            "command started"
        );

        // Held open and never written: a command waiting on input blocks until
        // the timeout instead of seeing EOF.
        let _stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let pumped = tokio::time::timeout(
            self.timeout,
            pump_output(stdout, stderr, &sink, self.output_cap),
        )
        .await;

        let end = match pumped {
            Err(_) => self.timed_out(),
            Ok(PumpOutcome::Truncated) => StreamEnd::Truncated {
                limit_bytes: self.output_cap,
            },
            Ok(PumpOutcome::Disconnected) => StreamEnd::Failed(GatewayError::StreamError {
                message: "client disconnected".to_string(),
            }),
            Ok(PumpOutcome::Failed(err)) => StreamEnd::Failed(GatewayError::Internal {
                message: format!("failed to read command output: {err}"),
            }),
            Ok(PumpOutcome::Eof) => {
                let remaining = self.timeout.saturating_sub(started.elapsed());
                self.wait_exit(&mut child, remaining).await
            }
        };

        // Also runs after a clean exit so background jobs left in the group
        // die with the command. The pgid stays reserved while any member is
        // alive; once the group is empty the signal only lands elsewhere if
        // the pid space wrapped between the reap and this call.
        group.kill();
        if !matches!(end, StreamEnd::Completed { .. }) {
            let _ = child.kill().await;
        }
        tracing::info!(
            status = end.status(),
            exit_code = end.exit_code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "command finished"
        );
        end
    }

    async fn wait_exit(&self, child: &mut Child, remaining: Duration) -> StreamEnd {
        match tokio::time::timeout(remaining, child.wait()).await {
            Ok(Ok(status)) => StreamEnd::Completed {
                exit_code: status.code(),
            },
            Ok(Err(err)) => StreamEnd::Failed(GatewayError::Internal {
                message: format!("failed to wait for command: {err}"),
            }),
            Err(_) => self.timed_out(),
        }
    }

    fn timed_out(&self) -> StreamEnd {
        tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "command timed out");
        StreamEnd::Failed(GatewayError::ExecutionTimeout {
            timeout_ms: self.timeout.as_millis() as u64,
        })
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Kills every process in the child's group when dropped, so background jobs
/// started by the command die with it.
struct ProcessGroup {
    pid: Option<u32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn kill(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        #[cfg(unix)]
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = pid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn read_from<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

/// Relays stdout and stderr in arrival order until both close or the byte
/// budget is exceeded. At most `cap` bytes are delivered; on truncation any
/// multi-byte sequence still incomplete in either decoder is dropped.
async fn pump_output<O, E>(
    mut stdout: Option<O>,
    mut stderr: Option<E>,
    sink: &StreamSink,
    cap: usize,
) -> PumpOutcome
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut out_text = Utf8Decoder::default();
    let mut err_text = Utf8Decoder::default();
    let mut remaining = cap;

    while stdout.is_some() || stderr.is_some() {
        let (read, is_stdout) = tokio::select! {
            read = read_from(&mut stdout, &mut out_buf), if stdout.is_some() => (read, true),
            read = read_from(&mut stderr, &mut err_buf), if stderr.is_some() => (read, false),
        };
        let n = match read {
            Ok(n) => n,
            Err(err) => return PumpOutcome::Failed(err),
        };
        let (buf, decoder) = if is_stdout {
            (&out_buf, &mut out_text)
        } else {
            (&err_buf, &mut err_text)
        };

        if n == 0 {
            let tail = decoder.finish();
            if is_stdout {
                stdout = None;
            } else {
                stderr = None;
            }
            if sink.send(tail).await.is_err() {
                return PumpOutcome::Disconnected;
            }
            continue;
        }

        if n > remaining {
            let text = decoder.push(&buf[..remaining]);
            let _ = sink.send(text).await;
            return PumpOutcome::Truncated;
        }
        remaining -= n;
        let text = decoder.push(&buf[..n]);
        if sink.send(text).await.is_err() {
            return PumpOutcome::Disconnected;
        }
    }
    PumpOutcome::Eof
}

/// Incremental UTF-8 decoding that keeps a split multi-byte sequence for the
/// next read. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
