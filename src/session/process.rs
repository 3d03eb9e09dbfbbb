//! Session adapter driving an external helper program.
//!
//! The helper speaks line-delimited JSON over stdin/stdout:
//!
//! ```text
//! helper  -> {"event":"ready"}
//! request -> {"id":"…","activity":"<base64>","password":null,"net_stabilization_delay":0.0,"read_file_timeout":30.0}
//! helper  -> {"id":"…","ok":true,"value":{…}}
//! helper  -> {"id":"…","ok":false,"error":{"kind":"decode","message":"…"}}
//! ```
//!
//! Anything the helper writes on stderr is forwarded to `tracing` at debug
//! level. When a virtual display is requested, a display server is started
//! first and the helper gets `DISPLAY=:N`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{secs, ProcessSessionConfig};
use crate::scheduler::{DecodedActivity, Task, TaskId};

use super::{Session, SessionError, SessionFactory, SessionOptions, VirtualDisplay};

/// How long the helper may take to exit once its stdin is closed.
const HELPER_EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct HelperRequest<'a> {
    id: TaskId,
    activity: String,
    password: Option<&'a str>,
    #[serde(with = "secs")]
    net_stabilization_delay: Duration,
    #[serde(with = "secs")]
    read_file_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct HelperEvent {
    event: String,
}

#[derive(Debug, Deserialize)]
struct HelperResponse {
    id: TaskId,
    ok: bool,
    #[serde(default)]
    value: Option<DecodedActivity>,
    #[serde(default)]
    error: Option<HelperError>,
}

#[derive(Debug, Deserialize)]
struct HelperError {
    kind: String,
    #[serde(default)]
    message: String,
}

/// Builds `ProcessSession`s from a `ProcessSessionConfig`.
#[derive(Debug, Clone)]
pub struct ProcessSessionFactory {
    config: ProcessSessionConfig,
}

impl ProcessSessionFactory {
    pub fn new(config: ProcessSessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessSessionConfig {
        &self.config
    }
}

#[async_trait]
impl SessionFactory for ProcessSessionFactory {
    async fn create(&self, options: &SessionOptions) -> Result<Box<dyn Session>, SessionError> {
        let display = if options.virtual_display {
            Some(VirtualDisplay::start(&self.config.display, options.worker_id).await?)
        } else {
            None
        };

        let session = ProcessSession::spawn(&self.config, options, display).await?;
        Ok(Box::new(session))
    }
}

/// A running helper process, plus its display server if any.
pub struct ProcessSession {
    worker_id: usize,
    read_file_timeout: Duration,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<()>>,
    display: Option<VirtualDisplay>,
}

impl ProcessSession {
    /// Spawns the helper and waits for its ready event.
    ///
    /// On failure the display (if any) is dropped, which kills it.
    pub async fn spawn(
        config: &ProcessSessionConfig,
        options: &SessionOptions,
        display: Option<VirtualDisplay>,
    ) -> Result<Self, SessionError> {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(display) = &display {
            command.env("DISPLAY", display.env_value());
        }

        let mut child = command.spawn().map_err(|e| {
            SessionError::Startup(format!("failed to spawn {}: {}", config.program, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Startup("helper stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Startup("helper stdout not captured".to_string()))?;
        let stderr_task = child.stderr.take().map(|stderr| {
            let worker_id = options.worker_id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(worker_id = worker_id, "helper: {}", line);
                }
            })
        });

        let mut session = Self {
            worker_id: options.worker_id,
            read_file_timeout: options.read_file_timeout,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            stderr_task,
            display,
        };

        session.wait_ready().await?;

        info!(
            worker_id = session.worker_id,
            pid = session.child.id().unwrap_or_default(),
            display = session.display.as_ref().map(VirtualDisplay::number),
            "Helper session started"
        );
        Ok(session)
    }

    async fn wait_ready(&mut self) -> Result<(), SessionError> {
        loop {
            let line = self.stdout.next_line().await?.ok_or_else(|| {
                SessionError::Startup("helper exited before signalling ready".to_string())
            })?;

            match serde_json::from_str::<HelperEvent>(&line) {
                Ok(event) if event.event == "ready" => return Ok(()),
                _ => debug!(worker_id = self.worker_id, "Ignoring helper output before ready: {}", line),
            }
        }
    }

    /// Process id of the helper, if still running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn send(&mut self, task: &Task) -> Result<(), SessionError> {
        let request = HelperRequest {
            id: task.id,
            activity: base64::engine::general_purpose::STANDARD.encode(&task.activity),
            password: task.password.as_deref(),
            net_stabilization_delay: task.net_stabilization_delay,
            read_file_timeout: self.read_file_timeout,
        };
        let mut line = serde_json::to_vec(&request)
            .map_err(|e| SessionError::BadInput(format!("failed to encode request: {}", e)))?;
        line.push(b'\n');

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SessionError::Crashed("helper stdin already closed".to_string()))?;

        let written = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        }
        .await;

        written.map_err(|e| SessionError::Crashed(format!("failed to write to helper: {}", e)))
    }

    async fn receive(&mut self, task_id: TaskId) -> Result<DecodedActivity, SessionError> {
        let line = loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| SessionError::Crashed(format!("failed to read from helper: {}", e)))?
                .ok_or_else(|| SessionError::Crashed("helper closed its output".to_string()))?;
            if !line.trim().is_empty() {
                break line;
            }
        };

        let response: HelperResponse = serde_json::from_str(&line)
            .map_err(|e| SessionError::Unresponsive(format!("malformed response: {}", e)))?;

        if response.id != task_id {
            return Err(SessionError::Unresponsive(format!(
                "response for {} while waiting for {}",
                response.id, task_id
            )));
        }

        if response.ok {
            return Ok(response.value.unwrap_or(DecodedActivity::Null));
        }

        let error = response.error.ok_or_else(|| {
            SessionError::Unresponsive("failed response without error".to_string())
        })?;
        match error.kind.as_str() {
            "bad_input" => Err(SessionError::BadInput(error.message)),
            "decode" => Err(SessionError::Decode(error.message)),
            other => Err(SessionError::Unresponsive(format!(
                "unknown error kind '{}': {}",
                other, error.message
            ))),
        }
    }
}

#[async_trait]
impl Session for ProcessSession {
    async fn execute(
        &mut self,
        task: &Task,
        timeout: Duration,
    ) -> Result<DecodedActivity, SessionError> {
        self.send(task).await?;

        match tokio::time::timeout(timeout, self.receive(task.id)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(timeout)),
        }
    }

    async fn destroy(self: Box<Self>) -> Result<(), SessionError> {
        let mut this = self;

        // EOF on stdin asks the helper to exit.
        drop(this.stdin.take());

        let waited = tokio::time::timeout(HELPER_EXIT_GRACE, this.child.wait()).await;
        let exited = match waited {
            Ok(Ok(status)) => {
                debug!(worker_id = this.worker_id, status = %status, "Helper exited");
                Ok(())
            }
            Ok(Err(e)) => Err(SessionError::Teardown(format!("failed to wait for helper: {}", e))),
            Err(_) => {
                warn!(worker_id = this.worker_id, "Helper ignored EOF, killing it");
                this.child
                    .kill()
                    .await
                    .map_err(|e| SessionError::Teardown(format!("failed to kill helper: {}", e)))
            }
        };

        if let Some(task) = this.stderr_task.take() {
            task.abort();
        }
        if let Some(display) = this.display.take() {
            display.stop().await;
        }

        exited
    }
}
