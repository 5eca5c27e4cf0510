//! Log streaming through the external line-processing engine.
//!
//! Each stream request spawns one engine process:
//!
//! ```text
//! rgkl stream-forward|stream-backward <path> [--grep G] [--follow-from F]
//!      [--start-time RFC3339] [--stop-time RFC3339]
//! ```
//!
//! The engine writes one JSON record per line on stdout and free-form
//! diagnostics on stderr. The process never outlives its stream.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::SecondsFormat;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kubetail_k8s::{PermissionGate, Verb};
use kubetail_types::{LogRecord, LogStreamRequest, StreamDirection};

use crate::error::{LogError, Result};
use crate::index::LogFileIndex;
use crate::record::RecordParser;

/// Engine binary looked up on `PATH` when none is configured
pub const DEFAULT_ENGINE_PROGRAM: &str = "rgkl";

const LINE_BUFFER: usize = 256;

/// How long a finished engine gets to flush stderr into the log
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// Program and leading arguments used to launch the engine
#[derive(Clone, Debug)]
pub struct EngineCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl EngineCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Argument placed before the stream subcommand
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Default for EngineCommand {
    fn default() -> Self {
        Self::new(DEFAULT_ENGINE_PROGRAM)
    }
}

/// Engine arguments for one stream request
pub fn engine_args(
    direction: StreamDirection,
    path: &Path,
    req: &LogStreamRequest,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![direction.subcommand().into(), path.into()];

    if !req.grep.is_empty() {
        args.push("--grep".into());
        args.push(req.grep.clone().into());
    }
    if direction == StreamDirection::Forward {
        args.push("--follow-from".into());
        args.push(req.follow_from.as_arg().into());
    }
    if let Some(start) = req.start_time {
        args.push("--start-time".into());
        args.push(start.to_rfc3339_opts(SecondsFormat::Nanos, true).into());
    }
    if let Some(stop) = req.stop_time {
        args.push("--stop-time".into());
        args.push(stop.to_rfc3339_opts(SecondsFormat::Nanos, true).into());
    }

    args
}

/// Streams container log records for authorized callers
#[derive(Clone)]
pub struct LogStreamEngine {
    index: LogFileIndex,
    gate: PermissionGate,
    command: EngineCommand,
    shutdown: CancellationToken,
}

impl LogStreamEngine {
    /// `shutdown` is the agent-wide signal; every running stream ends when it fires.
    pub fn new(
        index: LogFileIndex,
        gate: PermissionGate,
        command: EngineCommand,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            index,
            gate,
            command,
            shutdown,
        }
    }

    pub fn index(&self) -> &LogFileIndex {
        &self.index
    }

    pub async fn stream_forward(
        &self,
        token: Option<&str>,
        req: &LogStreamRequest,
        cancel: &CancellationToken,
        sink: mpsc::Sender<LogRecord>,
    ) -> Result<()> {
        self.stream(StreamDirection::Forward, token, req, cancel, sink)
            .await
    }

    pub async fn stream_backward(
        &self,
        token: Option<&str>,
        req: &LogStreamRequest,
        cancel: &CancellationToken,
        sink: mpsc::Sender<LogRecord>,
    ) -> Result<()> {
        self.stream(StreamDirection::Backward, token, req, cancel, sink)
            .await
    }

    /// Stream records into `sink` until the engine finishes, the request is
    /// cancelled, the agent shuts down or the receiver goes away.
    ///
    /// Permission, grep and file lookup errors are returned before anything
    /// is spawned.
    pub async fn stream(
        &self,
        direction: StreamDirection,
        token: Option<&str>,
        req: &LogStreamRequest,
        cancel: &CancellationToken,
        sink: mpsc::Sender<LogRecord>,
    ) -> Result<()> {
        self.gate
            .check(token, std::slice::from_ref(&req.namespace), Verb::Get)
            .await?;

        if !req.grep.is_empty() {
            Regex::new(&req.grep)?;
        }

        let path = self.index.find(
            &req.namespace,
            &req.pod_name,
            &req.container_name,
            &req.container_id,
        )?;
        let source = self.index.spec(
            &req.namespace,
            &req.pod_name,
            &req.container_name,
            &req.container_id,
        );

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .args(engine_args(direction, &path, req))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LogError::Spawn {
                program: self.command.program.display().to_string(),
                source,
            })?;

        debug!(
            path = %path.display(),
            direction = direction.subcommand(),
            pid = child.id(),
            "Started log engine"
        );

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            return Err(std::io::Error::other("log engine pipes unavailable").into());
        };

        let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_BUFFER);
        let stdout_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Failed to read log engine output");
                        break;
                    }
                }
                let line = match String::from_utf8(std::mem::take(&mut buf)) {
                    Ok(line) => line,
                    Err(_) => {
                        warn!("Skipping log engine line that is not UTF-8");
                        continue;
                    }
                };
                if line_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        let stderr_path = path.clone();
        let mut stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            while matches!(reader.read_until(b'\n', &mut buf).await, Ok(n) if n > 0) {
                let line = String::from_utf8_lossy(&buf);
                warn!(path = %stderr_path.display(), "log engine: {}", line.trim_end());
                buf.clear();
            }
        });

        let mut exhausted = false;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Agent shutting down, ending stream");
                    break;
                }
                _ = cancel.cancelled() => break,
                line = line_rx.recv() => {
                    let Some(line) = line else {
                        exhausted = true;
                        break;
                    };
                    let record = match RecordParser::parse_with_source(&line, &source) {
                        Ok(record) => record,
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed log record");
                            continue;
                        }
                    };
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = cancel.cancelled() => break,
                        sent = sink.send(record) => {
                            if sent.is_err() {
                                debug!("Stream receiver dropped");
                                break;
                            }
                        }
                    }
                }
            }
        }

        // The engine may still be running on every path above
        let _ = child.start_kill();
        match child.wait().await {
            Ok(status) => debug!(%status, path = %path.display(), "Log engine exited"),
            Err(e) => warn!(error = %e, "Failed to reap log engine"),
        }
        stdout_task.abort();
        if !exhausted || timeout(STDERR_DRAIN, &mut stderr_task).await.is_err() {
            stderr_task.abort();
        }

        Ok(())
    }
}
