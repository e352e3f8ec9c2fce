//! Discovery scans against scripted analyzers

use async_trait::async_trait;
use pulse_core::snapshot::{DockerContainer, DockerHost, StateSnapshot};
use pulse_core::Result;
use pulse_discovery::{Analyzer, DiscoveryConfig, DiscoveryService};
use pulse_store::{KnowledgeStore, NoteCategory};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POSTGRES: &str = r#"Here you go:
```json
{"service_type":"postgres","service_name":"PostgreSQL","category":"database","cli_command":"docker exec {container} psql -U postgres","confidence":0.95,"reasoning":"official image"}
```"#;

struct Scripted {
    answer: String,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: answer.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for Scripted {
    async fn analyze(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer.clone())
    }
}

/// Never answers
struct Stalled;

#[async_trait]
impl Analyzer for Stalled {
    async fn analyze(&self, _prompt: &str) -> Result<String> {
        std::future::pending::<()>().await;
        Ok(String::new())
    }
}

fn container(name: &str, image: &str) -> DockerContainer {
    DockerContainer {
        id: format!("{}-id", name),
        name: name.to_string(),
        image: image.to_string(),
        state: "running".to_string(),
        ..Default::default()
    }
}

fn snapshot(containers: Vec<DockerContainer>) -> Arc<StateSnapshot> {
    Arc::new(StateSnapshot {
        docker_hosts: vec![DockerHost {
            id: "dh-1".into(),
            agent_id: "agent-dock1".into(),
            hostname: "dock1".into(),
            status: "online".into(),
            containers,
            ..Default::default()
        }],
        ..Default::default()
    })
}

fn config() -> DiscoveryConfig {
    DiscoveryConfig {
        interval: Duration::from_secs(3600),
        cache_expiry: Duration::from_secs(3600),
        ai_analysis_timeout: Duration::from_secs(5),
        max_cache_entries: 1024,
    }
}

#[tokio::test]
async fn test_same_image_analyzed_once() {
    let dir = tempfile::tempdir().unwrap();
    let knowledge = Arc::new(KnowledgeStore::with_sealer(dir.path(), None).unwrap());
    let state = snapshot(vec![container("mydb", "postgres:14"), container("other", "postgres:14")]);
    let service = DiscoveryService::new(state, Some(knowledge.clone()), config());
    let analyzer = Scripted::new(POSTGRES);
    service.set_analyzer(Some(analyzer.clone())).await;

    let apps = service.run_discovery().await;
    assert_eq!(analyzer.calls(), 1);
    assert_eq!(apps.len(), 2);
    assert_eq!(apps[0].cli_access, "docker exec mydb psql -U postgres");
    assert_eq!(apps[1].cli_access, "docker exec other psql -U postgres");
    assert_eq!(apps[0].id, "docker:dock1:mydb");
    assert_eq!(apps[0].runs_in, "docker");

    let notes = knowledge.get("agent-dock1").await.unwrap();
    let infra: Vec<_> = notes
        .notes
        .iter()
        .filter(|n| n.category == NoteCategory::Infrastructure)
        .collect();
    assert!(!infra.is_empty());
    assert!(infra.iter().all(|n| n.title == "PostgreSQL (docker)"));
    assert!(infra[0].content.starts_with("Detected PostgreSQL running in docker on dock1. CLI access: docker exec"));

    assert_eq!(service.get_discoveries().await.len(), 2);
    let status = service.status().await;
    assert_eq!(status.discovery_count, 2);
    assert_eq!(status.cache_size, 1);
    assert!(status.last_run.is_some());
}

#[tokio::test]
async fn test_repeat_scan_uses_cache() {
    let state = snapshot(vec![container("mydb", "postgres:14"), container("web", "nginx:1.25")]);
    let service = DiscoveryService::new(state, None, config());
    let analyzer = Scripted::new(POSTGRES);
    service.set_analyzer(Some(analyzer.clone())).await;

    let first: Vec<String> = service.run_discovery().await.into_iter().map(|a| a.id).collect();
    let calls = analyzer.calls();
    let second: Vec<String> = service.run_discovery().await.into_iter().map(|a| a.id).collect();
    assert_eq!(first, second);
    assert_eq!(analyzer.calls(), calls);

    service.clear_cache().await;
    service.run_discovery().await;
    assert_eq!(analyzer.calls(), calls * 2);
}

#[tokio::test]
async fn test_low_confidence_is_cached_but_skipped() {
    let state = snapshot(vec![container("mystery", "acme/thing:1")]);
    let service = DiscoveryService::new(state, None, config());
    let analyzer = Scripted::new(r#"{"service_type":"unknown","confidence":0.3}"#);
    service.set_analyzer(Some(analyzer.clone())).await;

    assert!(service.run_discovery().await.is_empty());
    assert_eq!(analyzer.calls(), 1);
    assert_eq!(service.cache_size().await, 1);

    service.run_discovery().await;
    assert_eq!(analyzer.calls(), 1);
}

#[tokio::test]
async fn test_analysis_timeout_skips_container() {
    let state = snapshot(vec![container("slow", "postgres:14")]);
    let mut cfg = config();
    cfg.ai_analysis_timeout = Duration::from_millis(20);
    let service = DiscoveryService::new(state, None, cfg);
    service.set_analyzer(Some(Arc::new(Stalled))).await;

    let started = Instant::now();
    let apps = service.run_discovery().await;
    assert!(apps.is_empty());
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(service.cache_size().await, 0);

    // Still usable afterwards
    service.start().await;
    service.stop().await;
    service.start().await;
    assert!(service.is_running());
    service.stop().await;
    assert!(!service.is_running());
}

#[tokio::test]
async fn test_cache_overflow_wipes_all_entries() {
    let images = ["a:1", "b:1", "c:1"];
    let state = snapshot(
        images
            .iter()
            .enumerate()
            .map(|(i, img)| container(&format!("c{}", i), img))
            .collect(),
    );
    let mut cfg = config();
    cfg.max_cache_entries = 2;
    let service = DiscoveryService::new(state, None, cfg);
    service.set_analyzer(Some(Scripted::new(POSTGRES))).await;

    service.run_discovery().await;
    // Third insert found the map full and cleared it first
    assert_eq!(service.cache_size().await, 1);
}

#[tokio::test]
async fn test_no_analyzer_means_no_scan() {
    let state = snapshot(vec![container("mydb", "postgres:14")]);
    let service = DiscoveryService::new(state, None, config());
    assert!(service.run_discovery().await.is_empty());
    assert!(service.status().await.last_run.is_none());
    assert!(!service.status().await.analyzer_set);
}

#[tokio::test]
async fn test_start_runs_initial_scan_and_force_refresh() {
    let state = snapshot(vec![container("mydb", "postgres:14")]);
    let service = DiscoveryService::new(state, None, config());
    let analyzer = Scripted::new(POSTGRES);
    service.set_analyzer(Some(analyzer.clone())).await;

    service.start().await;
    service.start().await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while service.get_discoveries().await.is_empty() {
        assert!(Instant::now() < deadline, "initial scan did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(analyzer.calls(), 1);

    service.clear_cache().await;
    service.force_refresh().await;
    while analyzer.calls() < 2 {
        assert!(Instant::now() < deadline, "force refresh did not run");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    service.stop().await;
    service.stop().await;
    assert!(!service.status().await.running);
}
