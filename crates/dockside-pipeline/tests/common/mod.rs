//! Shared fixtures: a project directory, a healthy scripted toolchain and
//! tiny HTTP servers standing in for the tunnelled web service.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dockside_core::fakes::ScriptedRunner;
use dockside_core::DeployConfig;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const CLUSTER_RUNNING: &str =
    r#"{"Name":"minikube","Host":"Running","Kubelet":"Running","APIServer":"Running"}"#;
pub const DEPLOYMENT_READY: &str = r#"{"metadata":{"generation":1},"spec":{"replicas":1},"status":{"observedGeneration":1,"replicas":1,"updatedReplicas":1,"readyReplicas":1}}"#;
pub const TASK_QUEUED: &str = r#"{"task_id":"t-1","message":"Task queued"}"#;
pub const TASK_DONE: &str =
    r#"{"task_id":"t-1","status":"SUCCESS","result":"Task completed for test_device"}"#;

/// Project directory holding every required file.
pub fn project() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for file in [
        "Dockerfile",
        "requirements.txt",
        "main.py",
        "config.py",
        ".env",
        "k8s/deployment.yaml",
        "k8s/services.yaml",
    ] {
        let path = dir.path().join(file);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "# fixture\n").unwrap();
    }
    dir
}

/// Defaults with short timeouts, pointed at `project` and `web_port`.
pub fn config(project: &TempDir, web_port: u16) -> DeployConfig {
    let mut config = DeployConfig::default();
    config.project_dir = project.path().to_path_buf();
    config.cluster.state_dir = Some(project.path().join(".minikube-state"));
    config.services.web.local_port = web_port;
    config.timeouts.poll_interval_ms = 20;
    config.timeouts.tunnel_probe_secs = 1;
    config.timeouts.task_wait_secs = 1;
    config.timeouts.ready_secs = 1;
    config.timeouts.request_secs = 5;
    config
}

/// A toolchain where the cluster is up and everything succeeds.
pub fn healthy_runner() -> Arc<ScriptedRunner> {
    healthy_runner_without(&[])
}

/// [`healthy_runner`] minus the rules for `skip`, so a test can script
/// those commands itself.
pub fn healthy_runner_without(skip: &[&str]) -> Arc<ScriptedRunner> {
    let runner = Arc::new(ScriptedRunner::new());
    let script = [
        ("minikube status", CLUSTER_RUNNING),
        ("kubectl config current-context", "minikube\n"),
        (
            "minikube image ls",
            "registry.k8s.io/pause:3.9\ndocker.io/library/fastapi-celery-app:latest\n",
        ),
        ("kubectl get deployment", DEPLOYMENT_READY),
        ("kubectl get pods", "celery-worker-5f6d"),
        (
            "kubectl exec",
            "Task completed for test_device at Mon Jan  6 10:00:00 2025\n",
        ),
    ];
    for (prefix, stdout) in script {
        if !skip.contains(&prefix) {
            runner.ok(prefix, stdout);
        }
    }
    runner
}

/// Serve fixed `(status, body)` replies keyed by exact request path.
/// Unknown paths get a 404.
pub async fn serve(routes: &[(&str, u16, &str)]) -> u16 {
    let routes: Arc<HashMap<String, (u16, String)>> = Arc::new(
        routes
            .iter()
            .map(|(path, status, body)| (path.to_string(), (*status, body.to_string())))
            .collect(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let routes = routes.clone();
            tokio::spawn(async move { handle(socket, &routes).await });
        }
    });
    port
}

async fn handle(mut socket: TcpStream, routes: &HashMap<String, (u16, String)>) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match socket.read(&mut buf).await {
            // Readiness probes connect and hang up without a request
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let text = String::from_utf8_lossy(&request);
    let path = text
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let (status, body) = routes
        .get(&path)
        .cloned()
        .unwrap_or((404, r#"{"detail":"Not Found"}"#.to_string()));

    let response = format!(
        "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// Accepts connections and never answers.
pub async fn serve_hanging() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _held = socket;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            });
        }
    });
    port
}

/// A server answering the task round trip successfully.
pub async fn serve_task_api() -> u16 {
    serve(&[
        ("/task/test_device", 200, TASK_QUEUED),
        ("/task/status/t-1", 200, TASK_DONE),
    ])
    .await
}

/// Broker stand-in answering every PING with PONG.
pub async fn serve_broker() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                if let Ok(n) = socket.read(&mut buf).await {
                    if n > 0 {
                        let _ = socket.write_all(b"+PONG\r\n").await;
                    }
                }
            });
        }
    });
    port
}

/// Position of the first recorded command starting with `prefix`.
pub fn position(runner: &ScriptedRunner, prefix: &str) -> usize {
    runner
        .calls()
        .iter()
        .position(|c| c.starts_with(prefix))
        .unwrap_or_else(|| panic!("{prefix} was never called"))
}
