mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use activity_decoder::client::Client;
use activity_decoder::scheduler::Scheduler;
use activity_decoder::server::Server;
use activity_decoder::ClientError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use common::{start, test_config, Behavior, FakeFactory};

struct Running {
    scheduler: Arc<Scheduler>,
    path: PathBuf,
    stop: oneshot::Sender<()>,
    server: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl Running {
    async fn stop(self) {
        let _ = self.stop.send(());
        tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .expect("server should stop")
            .expect("server task should not panic");
        assert!(!self.path.exists(), "socket file should be removed");
        self.scheduler.shutdown().await;
    }
}

fn serve(scheduler: Scheduler) -> Running {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("decoder.sock");
    let scheduler = Arc::new(scheduler);

    let server = Server::bind(&path, Arc::clone(&scheduler)).expect("bind");
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = stopped.await;
            })
            .await
            .expect("server should run");
    });

    Running {
        scheduler,
        path,
        stop,
        server,
        _dir: dir,
    }
}

async fn raw_exchange(path: &PathBuf, lines: &[&str]) -> Vec<serde_json::Value> {
    let stream = UnixStream::connect(path).await.expect("connect");
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let mut responses = Vec::new();
    for line in lines {
        write.write_all(line.as_bytes()).await.expect("write");
        write.write_all(b"\n").await.expect("write");

        let mut response = String::new();
        reader.read_line(&mut response).await.expect("read");
        responses.push(serde_json::from_str(&response).expect("response should be JSON"));
    }
    responses
}

#[tokio::test]
async fn test_put_get_round_trip() {
    let (scheduler, _counters) = start(test_config(1), FakeFactory::new(Behavior::Echo));
    let running = serve(scheduler);
    let client = Client::new(&running.path);

    let task_id = client
        .put(b"ride", Some("secret".to_string()), Duration::ZERO)
        .await
        .expect("put");
    let outcome = client
        .wait(task_id, Duration::from_millis(10), Duration::from_secs(5))
        .await
        .expect("outcome");

    assert_eq!(outcome.task_id, task_id);
    let value = outcome.value.expect("value");
    assert_eq!(value["bytes"], 4);
    assert_eq!(value["has_password"], true);

    let (text, stats) = client.metrics().await.expect("metrics");
    assert_eq!(stats.tasks_completed, 1);
    assert!(text.contains("activity_decoder_tasks_submitted_total 1"));

    running.stop().await;
}

#[tokio::test]
async fn test_error_codes() {
    let gate = Arc::new(Semaphore::new(0));
    let factory = FakeFactory::new(Behavior::Echo).with_create_gate(Arc::clone(&gate));
    let (scheduler, _counters) = start(test_config(1).with_queue_size(1), factory);
    let running = serve(scheduler);
    let client = Client::new(&running.path);

    let err = client.get(Uuid::new_v4()).await.expect_err("unknown id");
    assert_eq!(err.code(), Some("task_id_not_found"));

    let task_id = client.put(b"a", None, Duration::ZERO).await.expect("put");
    let err = client.get(task_id).await.expect_err("not completed");
    assert_eq!(err.code(), Some("task_not_completed"));

    let err = client.put(b"b", None, Duration::ZERO).await.expect_err("queue full");
    assert_eq!(err.code(), Some("queue_is_full"));
    assert!(matches!(err, ClientError::Rejected { .. }));

    gate.add_permits(1);
    running.stop().await;
}

#[tokio::test]
async fn test_bad_requests_keep_connection_open() {
    let (scheduler, _counters) = start(test_config(1), FakeFactory::new(Behavior::Echo));
    let running = serve(scheduler);

    let responses = raw_exchange(
        &running.path,
        &[
            "this is not json",
            r#"{"op":"put","activity":"!!not base64!!"}"#,
            r#"{"op":"launch"}"#,
            r#"{"op":"metrics"}"#,
        ],
    )
    .await;

    for response in &responses[..3] {
        assert_eq!(response["status"], "error");
        assert_eq!(response["code"], "bad_request");
    }
    assert_eq!(responses[3]["status"], "ok");
    assert!(responses[3]["metrics"].is_string());

    running.stop().await;
}

#[tokio::test]
async fn test_bind_replaces_stale_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("stale.sock");
    std::fs::write(&path, b"").expect("create stale file");

    let (scheduler, _counters) = start(test_config(1), FakeFactory::new(Behavior::Echo));
    let scheduler = Arc::new(scheduler);
    let server = Server::bind(&path, Arc::clone(&scheduler)).expect("bind over stale file");
    assert_eq!(server.path(), path.as_path());

    server.run_until(async {}).await.expect("server");
    assert!(!path.exists());
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_client_without_server() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = Client::new(dir.path().join("missing.sock"));

    let err = client.metrics().await.expect_err("no server");
    assert!(matches!(err, ClientError::Connect { .. }));
}
