//! End-to-end tests for the dev server lifecycle.

use futures_util::StreamExt;
use kiln_dev::{DevError, DevServer, Mode, ReloadMessage, ServerConfig, ServerState};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const SCRIPT_TAG: &str = r#"<script src="/__kiln/reload.js"></script>"#;

fn component_project() -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("component.yaml"),
        "name: Button\nprops:\n  label: Buy now\n",
    )
    .unwrap();
    fs::write(
        temp.path().join("component.html"),
        "<html><body><button>{{ label }}</button></body></html>",
    )
    .unwrap();
    temp
}

fn config(root: &Path) -> kiln_dev::ServerConfigBuilder {
    ServerConfig::builder(root)
        .port(0)
        .poll_interval(Duration::from_millis(50))
        .debounce(Duration::ZERO)
        .shutdown_timeout(Duration::from_secs(2))
}

async fn launch(server: &DevServer) -> (JoinHandle<kiln_dev::Result<()>>, SocketAddr) {
    kiln_dev::logger::init_test_logger();
    let handle = tokio::spawn({
        let server = server.clone();
        async move { server.start(CancellationToken::new()).await }
    });
    let addr = tokio::time::timeout(Duration::from_secs(10), server.serving())
        .await
        .expect("server did not start in time")
        .expect("server failed to start");
    (handle, addr)
}

async fn get(addr: SocketAddr, path: &str) -> reqwest::Response {
    reqwest::get(format!("http://{addr}{path}")).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_component_lifecycle() {
    let temp = component_project();
    let server = DevServer::new(config(temp.path()).build().unwrap()).unwrap();
    assert_eq!(server.state(), ServerState::Created);

    let (handle, addr) = launch(&server).await;
    assert_eq!(server.state(), ServerState::Serving);
    assert_eq!(server.mode(), Some(Mode::Component));
    assert_ne!(addr.port(), 0);

    let page = get(addr, "/").await;
    assert_eq!(page.status(), 200);
    let body = page.text().await.unwrap();
    assert!(body.contains("<button>Buy now</button>"));
    assert_eq!(body.matches(SCRIPT_TAG).count(), 1);
    assert!(body.find(SCRIPT_TAG).unwrap() < body.find("</body>").unwrap());

    let script = get(addr, "/__kiln/reload.js").await;
    assert_eq!(script.status(), 200);
    assert!(script.text().await.unwrap().contains("/ws"));

    assert_eq!(get(addr, "/favicon.ico").await.status(), 204);
    assert_eq!(get(addr, "/missing.css").await.status(), 404);

    let status: serde_json::Value =
        serde_json::from_str(&get(addr, "/__kiln/status").await.text().await.unwrap()).unwrap();
    assert_eq!(status["mode"], "component");
    assert_eq!(
        status["root"],
        temp.path().canonicalize().unwrap().display().to_string()
    );
    assert!(status["app"].is_null());

    server.shutdown().await;
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(handle.await.unwrap().is_ok());
    assert_eq!(server.local_addr(), None);
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_twice_is_rejected() {
    let temp = component_project();
    let server = DevServer::new(config(temp.path()).build().unwrap()).unwrap();
    let (handle, _) = launch(&server).await;

    let err = server.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, DevError::AlreadyStarted));
    assert_eq!(server.state(), ServerState::Serving);

    server.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_token_stops_server() {
    let temp = component_project();
    let server = DevServer::new(config(temp.path()).build().unwrap()).unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let server = server.clone();
        let cancel = cancel.clone();
        async move { server.start(cancel).await }
    });
    server.serving().await.unwrap();

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server did not stop");
    assert!(result.unwrap().is_ok());
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_undetected_project_fails_before_binding() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("notes.txt"), "nothing here").unwrap();
    let server = DevServer::new(config(temp.path()).build().unwrap()).unwrap();

    let err = server.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, DevError::NotDetected { .. }));
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.serving().await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forced_mode_mismatch() {
    let temp = component_project();
    let server = DevServer::new(config(temp.path()).mode(Mode::Kit).build().unwrap()).unwrap();

    let err = server.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, DevError::ModeMismatch { mode: Mode::Kit, .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_occupied_port_is_a_bind_error() {
    let temp = component_project();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let server = DevServer::new(config(temp.path()).port(port).build().unwrap()).unwrap();
    let err = server.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, DevError::Bind { .. }), "got {err:?}");
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.hub().client_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broken_component_recovers_after_fix() {
    let temp = component_project();
    fs::write(temp.path().join("component.yaml"), "props: [unclosed\n").unwrap();
    let server = DevServer::new(config(temp.path()).build().unwrap()).unwrap();
    let (handle, addr) = launch(&server).await;

    let page = get(addr, "/").await;
    assert_eq!(page.status(), 500);
    let body = page.text().await.unwrap();
    assert!(body.contains("component.yaml"));
    assert!(body.contains(SCRIPT_TAG));

    fs::write(temp.path().join("component.yaml"), "props:\n  label: Fixed\n").unwrap();
    let mut recovered = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let page = get(addr, "/").await;
        if page.status() == 200 {
            assert!(page.text().await.unwrap().contains("Fixed"));
            recovered = true;
            break;
        }
    }
    assert!(recovered, "preview did not recover");

    server.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_change_pushes_reload() {
    let temp = component_project();
    let server = DevServer::new(config(temp.path()).build().unwrap()).unwrap();
    let (handle, addr) = launch(&server).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    let first = socket.next().await.unwrap().unwrap();
    let connected: ReloadMessage = serde_json::from_str(first.to_text().unwrap()).unwrap();
    assert!(matches!(connected, ReloadMessage::Connected { .. }));

    fs::create_dir(temp.path().join("css")).unwrap();
    fs::write(temp.path().join("css").join("site.css"), "body {}").unwrap();

    let reload = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(frame)) = socket.next().await {
            if let Message::Text(text) = frame {
                for line in text.as_str().split('\n').filter(|l| !l.is_empty()) {
                    if let Ok(message @ ReloadMessage::Reload { .. }) = serde_json::from_str::<ReloadMessage>(line) {
                        return Some(message);
                    }
                }
            }
        }
        None
    })
    .await
    .expect("no reload within 5s");
    assert_eq!(
        reload,
        Some(ReloadMessage::Reload {
            path: "css/site.css".to_string()
        })
    );

    server.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_without_live_reload() {
    let temp = component_project();
    let server = DevServer::new(config(temp.path()).live_reload(false).build().unwrap()).unwrap();
    let (handle, addr) = launch(&server).await;

    let body = get(addr, "/").await.text().await.unwrap();
    assert!(!body.contains(SCRIPT_TAG));
    assert_eq!(get(addr, "/__kiln/reload.js").await.status(), 404);

    server.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_kit_index_and_component() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("kit.yaml"),
        "name: Storefront\ncomponents:\n  - card\n",
    )
    .unwrap();
    fs::create_dir(temp.path().join("card")).unwrap();
    fs::write(temp.path().join("card").join("component.html"), "<div class=\"card\"></div>").unwrap();

    let server = DevServer::new(config(temp.path()).build().unwrap()).unwrap();
    let (handle, addr) = launch(&server).await;
    assert_eq!(server.mode(), Some(Mode::Kit));

    let index = get(addr, "/").await.text().await.unwrap();
    assert!(index.contains("Storefront"));
    assert!(index.contains("href=\"/card/\""));

    let card = get(addr, "/card/").await;
    assert_eq!(card.status(), 200);
    assert!(card.text().await.unwrap().contains("class=\"card\""));

    server.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_app_mode_serves_retry_page_until_ready() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("go.mod"), "module example.com/shop\n").unwrap();
    fs::write(temp.path().join("main.go"), "package main\n").unwrap();

    let config = config(temp.path())
        .app_command(["sh", "-c", "sleep 30"])
        .stop_grace(Duration::from_secs(1))
        .build()
        .unwrap();
    let server = DevServer::new(config).unwrap();
    let (handle, addr) = launch(&server).await;
    assert_eq!(server.mode(), Some(Mode::App));
    let app_port = server.app_port().expect("application port");

    let page = get(addr, "/").await;
    assert_eq!(page.status(), 502);
    assert_eq!(page.headers()["retry-after"], "1");

    let status: serde_json::Value =
        serde_json::from_str(&get(addr, "/__kiln/status").await.text().await.unwrap()).unwrap();
    assert_eq!(status["mode"], "app");
    assert_eq!(status["app"]["port"], app_port);
    assert_eq!(status["app"]["ready"], false);

    server.shutdown().await;
    handle.await.unwrap().unwrap();
    assert!(std::net::TcpListener::bind(("127.0.0.1", app_port)).is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_app_without_entry_point_serves_error_page() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("go.mod"), "module example.com/shop\n").unwrap();

    let server = DevServer::new(config(temp.path()).build().unwrap()).unwrap();
    let (handle, addr) = launch(&server).await;
    assert_eq!(server.mode(), Some(Mode::App));
    assert_eq!(server.app_port(), None);

    let page = get(addr, "/").await;
    assert_eq!(page.status(), 500);
    assert!(page.text().await.unwrap().contains("entry point"));

    server.shutdown().await;
    handle.await.unwrap().unwrap();
}
