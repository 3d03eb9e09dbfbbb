//! Wire format of the unix-socket front end.
//!
//! Each request and each response is a single JSON line. Requests are
//! tagged by `op`, responses by `status`:
//!
//! ```text
//! {"op":"put","activity":"<base64>","password":null,"net_stabilization_delay":2.0}
//! {"status":"ok","task_id":"…"}
//!
//! {"op":"get","task_id":"…"}
//! {"status":"ok","outcome":{…}}
//! {"status":"error","code":"task_not_completed","message":"…"}
//!
//! {"op":"metrics"}
//! {"status":"ok","metrics":"# HELP …","stats":{…}}
//! ```

use std::fmt;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::secs;
use crate::error::{GetError, PutError};
use crate::metrics::SchedulerStats;
use crate::scheduler::{Outcome, Scheduler, TaskId};

/// Largest request line accepted, in bytes.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024 * 1024;

/// Request sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Submit an activity; see `Scheduler::put`.
    Put {
        /// Activity file contents, standard base64.
        activity: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default, with = "secs")]
        net_stabilization_delay: Duration,
    },
    /// Look up an outcome; see `Scheduler::get`.
    Get { task_id: TaskId },
    /// Fetch the scheduler metrics.
    Metrics,
}

impl Request {
    /// Builds a `put` request, encoding the activity.
    pub fn put(activity: &[u8], password: Option<String>, net_stabilization_delay: Duration) -> Self {
        Request::Put {
            activity: base64::engine::general_purpose::STANDARD.encode(activity),
            password,
            net_stabilization_delay,
        }
    }
}

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    QueueIsFull,
    TaskIdNotFound,
    TaskNotCompleted,
    BadRequest,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::QueueIsFull => "queue_is_full",
            ErrorCode::TaskIdNotFound => "task_id_not_found",
            ErrorCode::TaskNotCompleted => "task_not_completed",
            ErrorCode::BadRequest => "bad_request",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Accepted { task_id: TaskId },
    Outcome { outcome: Outcome },
    Metrics { metrics: String, stats: SchedulerStats },
}

/// Response sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok(Reply),
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

impl From<PutError> for Response {
    fn from(err: PutError) -> Self {
        match err {
            PutError::QueueIsFull => Response::error(ErrorCode::QueueIsFull, err.to_string()),
        }
    }
}

impl From<GetError> for Response {
    fn from(err: GetError) -> Self {
        let code = match err {
            GetError::TaskIdNotFound(_) => ErrorCode::TaskIdNotFound,
            GetError::TaskNotCompleted(_) => ErrorCode::TaskNotCompleted,
        };
        Response::error(code, err.to_string())
    }
}

/// Executes a request against the scheduler.
pub fn dispatch(scheduler: &Scheduler, request: Request) -> Response {
    match request {
        Request::Put {
            activity,
            password,
            net_stabilization_delay,
        } => {
            let activity = match base64::engine::general_purpose::STANDARD.decode(activity) {
                Ok(bytes) => bytes,
                Err(e) => {
                    return Response::error(
                        ErrorCode::BadRequest,
                        format!("activity is not valid base64: {}", e),
                    )
                }
            };
            match scheduler.put(activity, password, net_stabilization_delay) {
                Ok(task_id) => Response::Ok(Reply::Accepted { task_id }),
                Err(e) => e.into(),
            }
        }
        Request::Get { task_id } => match scheduler.get(task_id) {
            Ok(outcome) => Response::Ok(Reply::Outcome { outcome }),
            Err(e) => e.into(),
        },
        Request::Metrics => Response::Ok(Reply::Metrics {
            metrics: scheduler.export_metrics(),
            stats: scheduler.stats(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_request_parsing() {
        let request: Request = serde_json::from_str(
            r#"{"op":"put","activity":"AAEC","net_stabilization_delay":2.5}"#,
        )
        .expect("put request");
        assert_eq!(
            request,
            Request::Put {
                activity: "AAEC".to_string(),
                password: None,
                net_stabilization_delay: Duration::from_millis(2500),
            }
        );

        let id = Uuid::new_v4();
        let request: Request =
            serde_json::from_str(&format!(r#"{{"op":"get","task_id":"{}"}}"#, id)).expect("get");
        assert_eq!(request, Request::Get { task_id: id });

        let request: Request = serde_json::from_str(r#"{"op":"metrics"}"#).expect("metrics");
        assert_eq!(request, Request::Metrics);
    }

    #[test]
    fn test_put_helper_encodes_activity() {
        let request = Request::put(&[0, 1, 2], Some("pw".to_string()), Duration::ZERO);
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["op"], "put");
        assert_eq!(json["activity"], "AAEC");
        assert_eq!(json["password"], "pw");
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"op":"delete"}"#).is_err());
    }

    #[test]
    fn test_response_wire_format() {
        let id = Uuid::new_v4();
        let accepted = serde_json::to_value(Response::Ok(Reply::Accepted { task_id: id }))
            .expect("serialize");
        assert_eq!(accepted["status"], "ok");
        assert_eq!(accepted["task_id"], id.to_string());

        let rejected = serde_json::to_value(Response::from(PutError::QueueIsFull)).expect("serialize");
        assert_eq!(rejected["status"], "error");
        assert_eq!(rejected["code"], "queue_is_full");
    }

    #[test]
    fn test_response_parsing() {
        let id = Uuid::new_v4();
        let line = serde_json::to_string(&Response::Ok(Reply::Accepted { task_id: id }))
            .expect("serialize");
        let parsed: Response = serde_json::from_str(&line).expect("parse");
        assert_eq!(parsed, Response::Ok(Reply::Accepted { task_id: id }));

        let line = serde_json::to_string(&Response::from(GetError::TaskNotCompleted(id)))
            .expect("serialize");
        match serde_json::from_str::<Response>(&line).expect("parse") {
            Response::Error { code, message } => {
                assert_eq!(code, ErrorCode::TaskNotCompleted);
                assert!(message.contains(&id.to_string()));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
