//! Client for the unix-socket front end.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::ClientError;
use crate::metrics::SchedulerStats;
use crate::scheduler::{Outcome, TaskId};
use crate::server::{ErrorCode, Reply, Request, Response};

/// Connects to a running server for every call.
#[derive(Debug, Clone)]
pub struct Client {
    path: PathBuf,
}

impl Client {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sends one request and returns the successful reply.
    pub async fn call(&self, request: &Request) -> Result<Reply, ClientError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.path.clone(),
                source,
            })?;
        let (read, mut write) = stream.into_split();

        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        write.write_all(&line).await?;
        write.flush().await?;

        let mut response = String::new();
        let read_bytes = BufReader::new(read).read_line(&mut response).await?;
        if read_bytes == 0 {
            return Err(ClientError::NoResponse);
        }

        match serde_json::from_str::<Response>(&response)? {
            Response::Ok(reply) => Ok(reply),
            Response::Error { code, message } => Err(ClientError::Rejected {
                code: code.to_string(),
                message,
            }),
        }
    }

    /// Submits an activity and returns its task id.
    pub async fn put(
        &self,
        activity: &[u8],
        password: Option<String>,
        net_stabilization_delay: Duration,
    ) -> Result<TaskId, ClientError> {
        match self
            .call(&Request::put(activity, password, net_stabilization_delay))
            .await?
        {
            Reply::Accepted { task_id } => Ok(task_id),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Fetches the outcome of a task.
    pub async fn get(&self, task_id: TaskId) -> Result<Outcome, ClientError> {
        match self.call(&Request::Get { task_id }).await? {
            Reply::Outcome { outcome } => Ok(outcome),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Fetches the Prometheus exposition and the counter snapshot.
    pub async fn metrics(&self) -> Result<(String, SchedulerStats), ClientError> {
        match self.call(&Request::Metrics).await? {
            Reply::Metrics { metrics, stats } => Ok((metrics, stats)),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Polls `get` until the task has an outcome.
    pub async fn wait(
        &self,
        task_id: TaskId,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Outcome, ClientError> {
        let poll = async {
            loop {
                match self.get(task_id).await {
                    Err(ClientError::Rejected { code, .. })
                        if code == ErrorCode::TaskNotCompleted.as_str() =>
                    {
                        debug!(task_id = %task_id, "Task not completed yet");
                        tokio::time::sleep(poll_interval).await;
                    }
                    result => return result,
                }
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ClientError::WaitTimeout(timeout))?
    }
}
