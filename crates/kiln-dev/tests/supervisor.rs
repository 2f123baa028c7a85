//! Integration tests for the application supervisor.
//!
//! The supervised "application" is a shell command, so these only run on Unix.
#![cfg(unix)]

use axum::body::Body;
use axum::extract::Request;
use axum::http::{StatusCode, header};
use kiln_dev::{AppSettings, ProcessSupervisor, SupervisorError};
use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn app_project() -> TempDir {
    kiln_dev::logger::init_test_logger();
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("go.mod"), "module example.com/shop\n").unwrap();
    fs::write(temp.path().join("main.go"), "package main\n").unwrap();
    temp
}

fn settings(script: &str) -> AppSettings {
    AppSettings {
        command: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
        ready_timeout: Duration::from_secs(10),
        restart_delay: Duration::from_millis(50),
        stop_grace: Duration::from_secs(2),
        inject_reload_script: true,
    }
}

fn has_python() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn get(path: &str) -> Request {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn wait_for_port_change(supervisor: &ProcessSupervisor, old: u16) -> Option<u16> {
    for _ in 0..100 {
        match supervisor.port() {
            Some(port) if port != old => return Some(port),
            _ => tokio::time::sleep(Duration::from_millis(30)).await,
        }
    }
    None
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unready_app_times_out_and_proxy_retries() {
    let temp = app_project();
    let supervisor = ProcessSupervisor::new(temp.path(), settings("sleep 30"))
        .await
        .unwrap();

    let started = Instant::now();
    let err = supervisor
        .wait_until_ready(&CancellationToken::new(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::ReadyTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!supervisor.is_ready());

    let response = supervisor.serve_http(get("/")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&body).contains("http-equiv=\"refresh\""));

    supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_until_ready_honours_cancellation() {
    let temp = app_project();
    let supervisor = ProcessSupervisor::new(temp.path(), settings("sleep 30"))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let err = supervisor
        .wait_until_ready(&cancel, Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Cancelled));

    supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_child_environment() {
    let temp = app_project();
    let marker = temp.path().join("env.txt");
    let script = format!(
        "echo \"$PORT $KILN_DEV $KILN_ROOT\" > {}; sleep 30",
        marker.display()
    );
    let supervisor = ProcessSupervisor::new(temp.path(), settings(&script))
        .await
        .unwrap();
    let port = supervisor.port().unwrap();

    let mut content = String::new();
    for _ in 0..100 {
        content = fs::read_to_string(&marker).unwrap_or_default();
        if !content.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        content.trim(),
        format!("{} 1 {}", port, temp.path().display())
    );

    supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_port_is_free_after_shutdown() {
    let temp = app_project();
    let script = if has_python() {
        "exec python3 -m http.server \"$PORT\" --bind 127.0.0.1"
    } else {
        "sleep 30"
    };
    let supervisor = ProcessSupervisor::new(temp.path(), settings(script))
        .await
        .unwrap();
    let port = supervisor.port().unwrap();

    if has_python() {
        supervisor
            .wait_until_ready(&CancellationToken::new(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(supervisor.is_ready());

        let response = supervisor.serve_http(get("/")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    supervisor.shutdown().await;
    assert_eq!(supervisor.port(), None);
    assert!(
        TcpListener::bind(("127.0.0.1", port)).is_ok(),
        "port {port} still held after shutdown"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stubborn_child_is_killed_after_grace() {
    let temp = app_project();
    let mut settings = settings("trap '' TERM; sleep 30 & wait");
    settings.stop_grace = Duration::from_millis(300);
    let supervisor = ProcessSupervisor::new(temp.path(), settings).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    supervisor.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_grandchild_ignoring_term_releases_port() {
    if !has_python() {
        return;
    }
    let temp = app_project();
    let mut settings = settings(
        "(trap '' TERM; exec python3 -m http.server \"$PORT\" --bind 127.0.0.1) & wait",
    );
    settings.stop_grace = Duration::from_millis(300);
    let supervisor = ProcessSupervisor::new(temp.path(), settings).await.unwrap();
    let port = supervisor.port().unwrap();
    supervisor
        .wait_until_ready(&CancellationToken::new(), Duration::from_secs(10))
        .await
        .unwrap();

    let started = Instant::now();
    supervisor.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(
        TcpListener::bind(("127.0.0.1", port)).is_ok(),
        "port {port} still held after shutdown"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relevant_change_restarts_on_new_port() {
    let temp = app_project();
    let supervisor = ProcessSupervisor::new(temp.path(), settings("sleep 30"))
        .await
        .unwrap();
    let first = supervisor.port().unwrap();

    supervisor.on_file_change(&temp.path().join("static/app.css"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(supervisor.port(), Some(first));

    // A burst folds into one restart.
    for _ in 0..5 {
        supervisor.on_file_change(&temp.path().join("main.go"));
    }
    let second = wait_for_port_change(&supervisor, first)
        .await
        .expect("application was not restarted");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(supervisor.port(), Some(second));

    supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_is_final() {
    let temp = app_project();
    let supervisor = ProcessSupervisor::new(temp.path(), settings("sleep 30"))
        .await
        .unwrap();

    supervisor.shutdown().await;
    supervisor.shutdown().await;
    assert!(matches!(supervisor.start().await, Err(SupervisorError::ShutDown)));
    assert!(matches!(supervisor.restart().await, Err(SupervisorError::ShutDown)));

    supervisor.on_file_change(Path::new("main.go"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(supervisor.port(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_entry_point_is_fatal() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("go.mod"), "module x\n").unwrap();

    let err = ProcessSupervisor::new(temp.path(), settings("sleep 30"))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::EntryPointNotFound { .. }));
}
