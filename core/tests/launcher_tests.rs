//! Integration tests for binary resolution and real process supervision.
//!
//! The "agent" is a small shell script written into a temp dir, so these run on unix only.
#![cfg(unix)]

use futures::StreamExt;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use warden_core::stream::agent_output;
use warden_core::{
    AgentConfig, AgentHealth, AgentMetrics, AgentStatus, HealthError, HealthProbe, HealthResult,
    LocalProcessLauncher, OutputItem, PreflightValidator, ProcessLauncher, ResolutionStrategy,
    Supervisor, SupervisorSettings, Termination, TerminationMonitor,
};

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

async fn collect_lines(agent: warden_core::SpawnedAgent) -> (Vec<String>, Termination) {
    let (tx, rx) = oneshot::channel();
    let _monitor = TerminationMonitor::spawn(agent.child, |t| async move {
        let _ = tx.send(t);
    });

    let lines: Vec<String> = agent_output(agent.stdout, agent.stderr)
        .filter_map(|item| async move {
            match item {
                OutputItem::Line(line) => Some(line.message),
                OutputItem::Progress(_) => None,
            }
        })
        .collect()
        .await;

    let termination = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    (lines, termination)
}

#[tokio::test]
async fn test_bundled_binary_is_preferred() {
    let bundled = tempfile::tempdir().unwrap();
    let on_path = tempfile::tempdir().unwrap();

    let launcher = LocalProcessLauncher::new("fake-agent")
        .with_bundled_dir(Some(bundled.path().to_path_buf()))
        .with_search_path(on_path.path().as_os_str());

    write_script(
        bundled.path(),
        &launcher.bundled_binary_name(),
        "echo bundled port=$HTTP_PORT",
    );
    write_script(on_path.path(), "fake-agent", "echo from-path");

    let agent = launcher
        .launch(&AgentConfig::default(), &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(agent.handle.strategy, ResolutionStrategy::Bundled);

    let (lines, termination) = collect_lines(agent).await;
    assert_eq!(lines, vec!["bundled port=18920".to_string()]);
    assert_eq!(termination, Termination::GracefulExit(0));
}

#[tokio::test]
async fn test_falls_back_to_path() {
    let bundled = tempfile::tempdir().unwrap();
    let on_path = tempfile::tempdir().unwrap();
    write_script(
        on_path.path(),
        "fake-agent",
        "echo slots=$PARALLEL_SLOTS host=$AGENT_HOST extra=$EXTRA_FLAG; exit 2",
    );

    let launcher = LocalProcessLauncher::new("fake-agent")
        .with_bundled_dir(Some(bundled.path().to_path_buf()))
        .with_search_path(on_path.path().as_os_str());

    let config = AgentConfig {
        ctx_size: 8192,
        parallel_slots: 4,
        ..Default::default()
    };
    let mut overrides = BTreeMap::new();
    overrides.insert("EXTRA_FLAG".to_string(), "on".to_string());

    let agent = launcher.launch(&config, &overrides).await.unwrap();
    assert_eq!(agent.handle.strategy, ResolutionStrategy::Path);
    assert!(agent.handle.pid.is_some());
    assert_eq!(agent.handle.env["EXTRA_FLAG"], "on");

    let (lines, termination) = collect_lines(agent).await;
    assert_eq!(
        lines,
        vec!["slots=2 host=127.0.0.1 extra=on".to_string()]
    );
    assert_eq!(
        termination,
        Termination::Crash {
            code: Some(2),
            signal: None
        }
    );
}

#[tokio::test]
async fn test_llama_server_variables_reach_the_agent() {
    let on_path = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();
    write_script(
        on_path.path(),
        "fake-agent",
        "echo $LLAMA_ARG_MODEL $LLAMA_ARG_HOST:$LLAMA_ARG_PORT metrics=$LLAMA_ARG_ENDPOINT_METRICS",
    );

    let launcher = LocalProcessLauncher::new("fake-agent")
        .with_models_dir(Some(models.path().to_path_buf()))
        .with_search_path(on_path.path().as_os_str());

    let agent = launcher
        .launch(&AgentConfig::default(), &BTreeMap::new())
        .await
        .unwrap();

    let (lines, _) = collect_lines(agent).await;
    let expected = format!(
        "{} 127.0.0.1:18920 metrics=1",
        models.path().join("Qwen3-32B-Q4_K_M.gguf").display()
    );
    assert_eq!(lines, vec![expected]);
}

#[tokio::test]
async fn test_secret_is_injected_but_masked_in_output() {
    let on_path = tempfile::tempdir().unwrap();
    write_script(on_path.path(), "fake-agent", "echo key=$PLUMISE_PRIVATE_KEY");

    let key = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    let config = AgentConfig {
        private_key: warden_core::PrivateKey::new(key),
        ..Default::default()
    };

    let agent = LocalProcessLauncher::new("fake-agent")
        .with_search_path(on_path.path().as_os_str())
        .launch(&config, &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(agent.handle.env["PLUMISE_PRIVATE_KEY"], "****");

    let (lines, _) = collect_lines(agent).await;
    assert_eq!(lines, vec!["key=0x4c08****...****2318".to_string()]);
}

/// Never becomes ready and has no shutdown endpoint.
struct SilentProbe;

#[async_trait::async_trait]
impl HealthProbe for SilentProbe {
    async fn health(&self) -> HealthResult<AgentHealth> {
        Err(HealthError::Status(503))
    }

    async fn metrics(&self) -> HealthResult<AgentMetrics> {
        Err(HealthError::Status(503))
    }

    async fn request_shutdown(&self) -> HealthResult<()> {
        Err(HealthError::Status(404))
    }
}

#[tokio::test]
async fn test_supervisor_stops_real_process() {
    let on_path = tempfile::tempdir().unwrap();
    write_script(
        on_path.path(),
        "fake-agent",
        "echo agent booting\nexec sleep 30",
    );

    let settings = SupervisorSettings {
        binary_name: "fake-agent".to_string(),
        poll_interval_ms: 20,
        shutdown_timeout_secs: 3,
        ..Default::default()
    };
    let launcher =
        LocalProcessLauncher::new("fake-agent").with_search_path(on_path.path().as_os_str());

    let supervisor = Supervisor::builder(settings)
        .launcher(Arc::new(launcher))
        .probe_factory(Arc::new(|_: &AgentConfig| {
            Arc::new(SilentProbe) as Arc<dyn HealthProbe>
        }))
        .preflight(PreflightValidator::with_checks(Vec::new()))
        .build();

    supervisor.start(AgentConfig::default()).await.unwrap();
    assert_eq!(supervisor.status(), AgentStatus::Starting);
    assert_eq!(
        supervisor.handle().unwrap().strategy,
        ResolutionStrategy::Path
    );

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.status(), AgentStatus::Stopped);
    assert!(supervisor.handle().is_none());
    assert!(supervisor
        .logs()
        .iter()
        .any(|e| e.message == "Agent stopped (Agent was terminated by signal 15)"));
}
