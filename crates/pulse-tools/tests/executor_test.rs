//! End-to-end tests for the tool executor against in-process providers

use async_trait::async_trait;
use pulse_core::snapshot::{DockerContainer, DockerHost, Guest};
use pulse_core::{ControlLevel, Result, StateSnapshot};
use pulse_store::KnowledgeStore;
use pulse_tools::{
    AgentTransport, CommandPolicy, CommandRequest, CommandResult, ConnectedAgent, ExecutionContext,
    PolicyDecision, Providers, ToolExecutor, APPROVAL_PREFIX,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingAgent {
    commands: Mutex<Vec<String>>,
}

#[async_trait]
impl AgentTransport for RecordingAgent {
    fn connected_agents(&self) -> Vec<ConnectedAgent> {
        vec![ConnectedAgent {
            agent_id: "agent-1".into(),
            hostname: "node1".into(),
            version: "1.0.0".into(),
        }]
    }

    async fn execute_command(&self, _agent_id: &str, request: CommandRequest) -> Result<CommandResult> {
        self.commands.lock().unwrap().push(request.command);
        Ok(CommandResult {
            success: true,
            stdout: "done".into(),
            ..Default::default()
        })
    }
}

struct DenyRm;

impl CommandPolicy for DenyRm {
    fn evaluate(&self, command: &str) -> PolicyDecision {
        if command.starts_with("rm ") {
            PolicyDecision::Deny
        } else {
            PolicyDecision::Allow
        }
    }
}

fn state() -> StateSnapshot {
    StateSnapshot {
        vms: vec![
            Guest {
                id: "pve/qemu/100".into(),
                vmid: 100,
                name: "web".into(),
                node: "node1".into(),
                guest_type: "qemu".into(),
                status: "running".into(),
                ..Default::default()
            },
            Guest {
                id: "pve/qemu/101".into(),
                vmid: 101,
                name: "db".into(),
                node: "node1".into(),
                guest_type: "qemu".into(),
                status: "running".into(),
                ..Default::default()
            },
        ],
        docker_hosts: vec![DockerHost {
            id: "dh-1".into(),
            hostname: "node1".into(),
            containers: vec![DockerContainer {
                id: "abc123".into(),
                name: "nginx".into(),
                state: "running".into(),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

async fn executor(level: ControlLevel) -> (ToolExecutor, Arc<RecordingAgent>) {
    let agent = Arc::new(RecordingAgent::default());
    let exec = ToolExecutor::new(Providers {
        state: Some(Arc::new(state())),
        agents: Some(agent.clone()),
        policy: Some(Arc::new(DenyRm)),
        ..Default::default()
    });
    exec.set_control_level(level).await;
    (exec, agent)
}

fn text(result: &pulse_tools::ToolResult) -> String {
    result.text_content()
}

#[tokio::test]
async fn test_suggest_returns_command_text() {
    let (exec, agent) = executor(ControlLevel::Suggest).await;
    let result = exec
        .execute_tool("pulse_control_guest", json!({"guest_id": "100", "action": "restart"}))
        .await
        .unwrap();
    let out = text(&result);
    assert!(out.contains("qm reboot 100"), "{}", out);
    assert!(out.contains("run this command on node node1"));
    assert!(agent.commands.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_controlled_emits_approval_sentinel() {
    let (exec, agent) = executor(ControlLevel::Controlled).await;
    let result = exec
        .execute_tool("pulse_control_docker", json!({"container": "nginx", "action": "restart"}))
        .await
        .unwrap();
    let out = text(&result);
    let payload: Value = serde_json::from_str(out.strip_prefix(APPROVAL_PREFIX).unwrap()).unwrap();
    assert_eq!(payload["type"], "approval_required");
    assert_eq!(payload["command"], "docker restart nginx");
    assert_eq!(payload["container_name"], "nginx");
    assert_eq!(payload["do_not_retry"], true);

    let id = payload["approval_id"].as_str().unwrap();
    let record = exec.approvals().get(id).await.unwrap();
    assert_eq!(record.tool, "pulse_control_docker");
    assert!(agent.commands.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_autonomous_context_executes_through_agent() {
    let (exec, agent) = executor(ControlLevel::Controlled).await;
    exec.set_context(ExecutionContext {
        autonomous: true,
        ..Default::default()
    })
    .await;

    let result = exec
        .execute_tool("pulse_control_guest", json!({"guest_id": "web", "action": "stop", "force": true}))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert!(text(&result).starts_with("Successfully executed 'stop' on web (VMID 100)."));
    assert_eq!(*agent.commands.lock().unwrap(), vec!["qm stop 100 --skiplock".to_string()]);
}

#[tokio::test]
async fn test_protected_guest_refused() {
    let (exec, agent) = executor(ControlLevel::Autonomous).await;
    exec.set_protected_guests(vec!["101".into()]).await;
    let result = exec
        .execute_tool("pulse_control_guest", json!({"guest_id": "db", "action": "stop"}))
        .await
        .unwrap();
    assert_eq!(
        text(&result),
        "Guest db (VMID 101) is protected and cannot be controlled by AI."
    );
    assert!(agent.commands.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_policy_deny_blocks_even_autonomous() {
    let (exec, agent) = executor(ControlLevel::Autonomous).await;
    let result = exec
        .execute_tool("pulse_run_command", json!({"command": "rm -rf /tmp/x", "run_on_host": true}))
        .await
        .unwrap();
    assert!(text(&result).starts_with("POLICY_BLOCKED: "));
    assert!(agent.commands.lock().unwrap().is_empty());

    let result = exec
        .execute_tool("pulse_run_command", json!({"command": "uptime"}))
        .await
        .unwrap();
    assert_eq!(text(&result), "done");
}

#[tokio::test]
async fn test_missing_providers_degrade_to_text() {
    let exec = ToolExecutor::new(Providers::default());
    let result = exec.execute_tool("pulse_list_backups", json!({})).await.unwrap();
    assert_eq!(text(&result), "Backup information not available.");
    assert!(!result.is_error);

    let result = exec
        .execute_tool("patrol_get_findings", json!({}))
        .await
        .unwrap();
    assert_eq!(text(&result), "Patrol finding creator not available.");
}

#[tokio::test]
async fn test_knowledge_tools_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(KnowledgeStore::with_sealer(dir.path(), None).unwrap());
    let exec = ToolExecutor::new(Providers {
        knowledge: Some(store.clone()),
        ..Default::default()
    });

    let result = exec
        .execute_tool(
            "pulse_save_note",
            json!({
                "guest_id": "vm-100",
                "guest_name": "web",
                "category": "service",
                "title": "nginx",
                "content": "Reverse proxy on :443"
            }),
        )
        .await
        .unwrap();
    assert!(!result.is_error, "{}", text(&result));

    let result = exec
        .execute_tool("pulse_get_notes", json!({"guest_id": "vm-100", "category": "service"}))
        .await
        .unwrap();
    let body: Value = serde_json::from_str(&text(&result)).unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["notes"][0]["content"], "Reverse proxy on :443");

    let bad = exec
        .execute_tool("pulse_get_notes", json!({"guest_id": "vm-100", "category": "bogus"}))
        .await
        .unwrap();
    assert!(bad.is_error);
}

#[tokio::test]
async fn test_url_fetch_truncates_large_bodies() {
    let app = axum::Router::new()
        .route("/small", axum::routing::get(|| async { "hello" }))
        .route("/big", axum::routing::get(|| async { "x".repeat(80 * 1024) }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let exec = ToolExecutor::new(Providers::default());
    let small = exec
        .execute_tool("pulse_get_url_content", json!({"url": format!("http://{}/small", addr)}))
        .await
        .unwrap();
    let body: Value = serde_json::from_str(&text(&small)).unwrap();
    assert_eq!(body["status_code"], 200);
    assert_eq!(body["body"], "hello");
    assert_eq!(body["truncated"], false);

    let big = exec
        .execute_tool("pulse_get_url_content", json!({"url": format!("http://{}/big", addr)}))
        .await
        .unwrap();
    let body: Value = serde_json::from_str(&text(&big)).unwrap();
    assert_eq!(body["truncated"], true);
    assert_eq!(body["body"].as_str().unwrap().len(), 50 * 1024);

    let rejected = exec
        .execute_tool("pulse_get_url_content", json!({"url": "file:///etc/passwd"}))
        .await
        .unwrap();
    assert!(rejected.is_error);
}
