//! Sidecar supervisor tests with an in-process runtime stand-in

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use pulse_core::Cancellation;
use pulse_llm::{ChildProcess, LaunchSpec, Launcher, Sidecar, SidecarConfig};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Serves `/global/health` on the requested port instead of spawning a process
#[derive(Default)]
struct FakeLauncher {
    launches: AtomicUsize,
    stops: Arc<AtomicUsize>,
    /// Health switch of the most recent child
    current: Mutex<Option<Arc<AtomicBool>>>,
    specs: Mutex<Vec<LaunchSpec>>,
}

struct FakeChild {
    cancel: Cancellation,
    server: Option<JoinHandle<()>>,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn shutdown(&mut self, _grace: Duration) -> pulse_llm::Result<()> {
        self.cancel.cancel();
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn health(State(ok): State<Arc<AtomicBool>>) -> StatusCode {
    if ok.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> pulse_llm::Result<Box<dyn ChildProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().unwrap().push(spec.clone());

        let ok = Arc::new(AtomicBool::new(true));
        *self.current.lock().unwrap() = Some(ok.clone());

        let app = Router::new().route("/global/health", get(health)).with_state(ok);
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", spec.port)).await?;
        let cancel = Cancellation::new();
        let shutdown = cancel.clone();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });
        Ok(Box::new(FakeChild {
            cancel,
            server: Some(server),
            stops: self.stops.clone(),
        }))
    }
}

fn config(dir: &std::path::Path) -> SidecarConfig {
    SidecarConfig {
        data_dir: dir.to_path_buf(),
        mcp_url: "http://127.0.0.1:7777/".into(),
        model: "anthropic:claude-sonnet-4-20250514".into(),
        anthropic_api_key: "sk-test".into(),
        startup_timeout: Duration::from_secs(5),
        startup_poll: Duration::from_millis(20),
        health_interval: Duration::from_millis(50),
        health_timeout: Duration::from_millis(500),
        stop_grace: Duration::from_millis(200),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_start_is_idempotent_and_writes_config() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(FakeLauncher::default());
    let sidecar = Sidecar::with_launcher(config(dir.path()), launcher.clone());

    sidecar.start().await.unwrap();
    sidecar.start().await.unwrap();
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

    let status = sidecar.status().await;
    assert!(status.running);
    assert!(status.healthy);
    assert_ne!(status.port, 0);
    assert_eq!(status.url, format!("http://127.0.0.1:{}", status.port));
    assert_eq!(status.restarts, 0);

    let written: Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("opencode.json")).unwrap()).unwrap();
    assert_eq!(written["mcp"]["pulse"]["url"], "http://127.0.0.1:7777/");
    assert_eq!(written["model"], "anthropic/claude-sonnet-4-20250514");

    let spec = launcher.specs.lock().unwrap()[0].clone();
    assert!(spec.env.contains(&("ANTHROPIC_API_KEY".to_string(), "sk-test".to_string())));

    sidecar.client().await.unwrap().health().await.unwrap();
    sidecar.stop().await;
}

#[tokio::test]
async fn test_start_stop_cycles_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(FakeLauncher::default());
    let sidecar = Sidecar::with_launcher(config(dir.path()), launcher.clone());

    for _ in 0..2 {
        sidecar.start().await.unwrap();
        assert!(sidecar.is_running().await);
        sidecar.stop().await;
        sidecar.stop().await;
        assert!(!sidecar.is_running().await);
    }
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    assert_eq!(launcher.stops.load(Ordering::SeqCst), 2);
    assert!(!sidecar.status().await.running);
}

#[tokio::test]
async fn test_unhealthy_child_is_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(FakeLauncher::default());
    let sidecar = Sidecar::with_launcher(config(dir.path()), launcher.clone());
    sidecar.start().await.unwrap();
    let port = sidecar.port().await.unwrap();

    let current = launcher.current.lock().unwrap().clone().unwrap();
    current.store(false, Ordering::SeqCst);

    let restarted = async {
        while sidecar.status().await.restarts == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), restarted).await.unwrap();

    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    assert_eq!(sidecar.port().await, Some(port));
    assert!(sidecar.status().await.healthy);
    sidecar.stop().await;
}

#[tokio::test]
async fn test_restart_applies_new_model() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(FakeLauncher::default());
    let sidecar = Sidecar::with_launcher(config(dir.path()), launcher.clone());
    sidecar.start().await.unwrap();

    let mut next = config(dir.path());
    next.model = "openai:gpt-4o".into();
    sidecar.restart(next).await.unwrap();

    assert_eq!(sidecar.status().await.model, "openai:gpt-4o");
    let written: Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("opencode.json")).unwrap()).unwrap();
    assert_eq!(written["model"], "openai/gpt-4o");
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    sidecar.stop().await;
}

#[tokio::test]
async fn test_unhealthy_start_fails_and_can_retry() {
    struct NeverHealthy;

    #[async_trait]
    impl Launcher for NeverHealthy {
        async fn launch(&self, _spec: &LaunchSpec) -> pulse_llm::Result<Box<dyn ChildProcess>> {
            Ok(Box::new(FakeChild {
                cancel: Cancellation::new(),
                server: None,
                stops: Arc::new(AtomicUsize::new(0)),
            }))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.startup_timeout = Duration::from_millis(100);
    let sidecar = Sidecar::with_launcher(cfg, Arc::new(NeverHealthy));

    let err = sidecar.start().await.unwrap_err();
    assert!(err.is_timeout());
    assert!(!sidecar.is_running().await);
    // Lifecycle rolled back, so a second attempt is allowed
    assert!(sidecar.start().await.unwrap_err().is_timeout());
}
