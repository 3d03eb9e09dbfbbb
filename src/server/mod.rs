//! Unix-socket front end exposing `put`, `get` and metrics to local clients.
//!
//! One connection may carry any number of requests; each request line gets
//! exactly one response line.

pub mod protocol;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::scheduler::Scheduler;

pub use protocol::{dispatch, ErrorCode, Reply, Request, Response, MAX_REQUEST_BYTES};

/// Listening front end bound to a scheduler.
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    scheduler: Arc<Scheduler>,
}

impl Server {
    /// Binds the socket, replacing a stale socket file left by a previous run.
    pub fn bind(path: &Path, scheduler: Arc<Scheduler>) -> Result<Self, ServerError> {
        if path.exists() {
            debug!(path = %path.display(), "Removing stale socket");
            std::fs::remove_file(path).map_err(|source| ServerError::Bind {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let listener = UnixListener::bind(path).map_err(|source| ServerError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), "Listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            scheduler,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serves connections until `shutdown` resolves, then closes open
    /// connections and removes the socket file.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let scheduler = Arc::clone(&self.scheduler);
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, &scheduler).await {
                                warn!(error = %e, "Connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Failed to remove socket");
        }
        info!("Server stopped");
        Ok(())
    }
}

/// Answers every request line received on `stream`.
pub async fn handle_connection(stream: UnixStream, scheduler: &Scheduler) -> Result<(), ServerError> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_REQUEST_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Ok(());
        }

        if line.len() > MAX_REQUEST_BYTES && line.last() != Some(&b'\n') {
            let response = Response::error(
                ErrorCode::BadRequest,
                format!("request exceeds {} bytes", MAX_REQUEST_BYTES),
            );
            write_response(&mut write, &response).await?;
            return Err(ServerError::RequestTooLarge {
                limit: MAX_REQUEST_BYTES,
            });
        }

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let response = match serde_json::from_slice::<Request>(&line) {
            Ok(request) => dispatch(scheduler, request),
            Err(e) => Response::error(ErrorCode::BadRequest, format!("invalid request: {}", e)),
        };
        write_response(&mut write, &response).await?;
    }
}

async fn write_response(write: &mut OwnedWriteHalf, response: &Response) -> Result<(), ServerError> {
    let mut buf = serde_json::to_vec(response)?;
    buf.push(b'\n');
    write.write_all(&buf).await?;
    write.flush().await?;
    Ok(())
}
