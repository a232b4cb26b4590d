//! Checks run before an agent launch is allowed.
//!
//! Each check is independent and reports pass or fail with a message. The validator runs
//! them in a fixed order and passes only if all of them pass.

use crate::config::{AgentConfig, SupervisorSettings, DEVICES};
use crate::errors::PreflightError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

impl CheckOutcome {
    pub fn pass(name: &str, message: impl Into<String>) -> Self {
        CheckOutcome {
            name: name.to_string(),
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(name: &str, message: impl Into<String>) -> Self {
        CheckOutcome {
            name: name.to_string(),
            passed: false,
            message: message.into(),
        }
    }
}

/// Ordered check outcomes plus the aggregate verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub passed: bool,
    pub checks: Vec<CheckOutcome>,
}

impl PreflightReport {
    pub fn failed_names(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.clone())
            .collect()
    }

    /// `Err` naming every failed check, if any failed.
    pub fn into_result(self) -> Result<Self, PreflightError> {
        if self.passed {
            Ok(self)
        } else {
            Err(PreflightError::Failed {
                failed: self.failed_names(),
            })
        }
    }
}

#[async_trait]
pub trait PreflightCheck: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, config: &AgentConfig) -> CheckOutcome;
}

/// Wallet key shape: `0x` followed by 64 hex digits.
pub struct PrivateKeyCheck;

#[async_trait]
impl PreflightCheck for PrivateKeyCheck {
    fn name(&self) -> &'static str {
        "Wallet"
    }

    async fn run(&self, config: &AgentConfig) -> CheckOutcome {
        if config.private_key.is_empty() {
            CheckOutcome::fail(self.name(), "Private key is not set")
        } else if config.private_key.has_valid_format() {
            CheckOutcome::pass(
                self.name(),
                format!("Private key configured ({})", config.private_key.masked()),
            )
        } else {
            CheckOutcome::fail(
                self.name(),
                "Invalid private key: expected 0x followed by 64 hex digits",
            )
        }
    }
}

pub struct ModelCheck;

#[async_trait]
impl PreflightCheck for ModelCheck {
    fn name(&self) -> &'static str {
        "Model"
    }

    async fn run(&self, config: &AgentConfig) -> CheckOutcome {
        let model = config.model_file.trim();
        if model.is_empty() {
            CheckOutcome::fail(self.name(), "No model file configured")
        } else {
            CheckOutcome::pass(self.name(), model)
        }
    }
}

pub struct DeviceCheck;

#[async_trait]
impl PreflightCheck for DeviceCheck {
    fn name(&self) -> &'static str {
        "Device"
    }

    async fn run(&self, config: &AgentConfig) -> CheckOutcome {
        if DEVICES.contains(&config.device.as_str()) {
            CheckOutcome::pass(self.name(), config.device.as_str())
        } else {
            CheckOutcome::fail(
                self.name(),
                format!(
                    "Unknown device '{}' (expected one of: {})",
                    config.device,
                    DEVICES.join(", ")
                ),
            )
        }
    }
}

/// Context size and slot count.
pub struct ContextCheck;

#[async_trait]
impl PreflightCheck for ContextCheck {
    fn name(&self) -> &'static str {
        "Context"
    }

    async fn run(&self, config: &AgentConfig) -> CheckOutcome {
        if config.ctx_size == 0 {
            return CheckOutcome::fail(self.name(), "Context size must be greater than 0");
        }

        let slots = config.effective_parallel_slots();
        if slots != config.parallel_slots {
            CheckOutcome::pass(
                self.name(),
                format!(
                    "{} tokens, parallel slots reduced {} -> {}",
                    config.ctx_size, config.parallel_slots, slots
                ),
            )
        } else {
            CheckOutcome::pass(
                self.name(),
                format!("{} tokens across {} slot(s)", config.ctx_size, slots),
            )
        }
    }
}

/// Pause after killing a leftover agent so the OS releases its socket.
const PORT_RELEASE_WAIT: Duration = Duration::from_millis(500);

/// Bound on each `lsof` and `ps` call made while looking for leftovers.
const LEFTOVER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// The agent's HTTP port must be free on the listen host.
///
/// With [`PortCheck::reclaiming_from`], an agent left behind by an earlier run (for example
/// after a force-quit) is killed to free the port. Other holders are never touched.
pub struct PortCheck {
    host: String,
    reclaim_from: Option<String>,
}

impl PortCheck {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            reclaim_from: None,
        }
    }

    /// Kill leftover `binary_name` processes found listening on the port.
    pub fn reclaiming_from(mut self, binary_name: impl Into<String>) -> Self {
        self.reclaim_from = Some(binary_name.into());
        self
    }

    async fn try_bind(&self, port: u16) -> std::io::Result<()> {
        // dropped right away so the agent can take it
        TcpListener::bind((self.host.as_str(), port)).await.map(drop)
    }
}

#[async_trait]
impl PreflightCheck for PortCheck {
    fn name(&self) -> &'static str {
        "HTTP Port"
    }

    async fn run(&self, config: &AgentConfig) -> CheckOutcome {
        let port = config.http_port;
        if port == 0 {
            return CheckOutcome::fail(self.name(), "HTTP port must be set");
        }

        let busy = match self.try_bind(port).await {
            Ok(()) => return CheckOutcome::pass(self.name(), format!("Port {} available", port)),
            Err(e) => e,
        };

        let Some(binary_name) = &self.reclaim_from else {
            return CheckOutcome::fail(self.name(), format!("Port {} in use: {}", port, busy));
        };

        let killed = kill_leftover_agents(port, binary_name).await;
        if killed.is_empty() {
            return CheckOutcome::fail(
                self.name(),
                format!("Port {} in use by another process: {}", port, busy),
            );
        }

        let killed = killed.join(", ");
        tokio::time::sleep(PORT_RELEASE_WAIT).await;
        match self.try_bind(port).await {
            Ok(()) => CheckOutcome::pass(
                self.name(),
                format!("Port {} freed (killed leftover: {})", port, killed),
            ),
            Err(e) => CheckOutcome::fail(
                self.name(),
                format!("Port {} still in use after killing {}: {}", port, killed, e),
            ),
        }
    }
}

/// True when a process looks like a `binary_name` agent, run directly or through an
/// interpreter.
///
/// `comm` is the kernel's short process name; `args` the full command line.
pub fn is_agent_process(binary_name: &str, comm: &str, args: &str) -> bool {
    let names_agent = |word: &str| {
        std::path::Path::new(word)
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(binary_name))
    };
    comm.contains(binary_name) || args.split_whitespace().take(2).any(names_agent)
}

#[cfg(unix)]
async fn lookup_output(program: &str, args: &[&str]) -> Option<String> {
    let run = Command::new(program).args(args).kill_on_drop(true).output();
    match tokio::time::timeout(LEFTOVER_LOOKUP_TIMEOUT, run).await {
        Ok(Ok(output)) => Some(String::from_utf8_lossy(&output.stdout).trim().to_string()),
        Ok(Err(e)) => {
            debug!("{} unavailable: {}", program, e);
            None
        }
        Err(_) => {
            debug!("{} timed out", program);
            None
        }
    }
}

/// Kill `binary_name` processes listening on `port`; returns a description of each.
#[cfg(unix)]
async fn kill_leftover_agents(port: u16, binary_name: &str) -> Vec<String> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let listen = format!("-iTCP:{}", port);
    let Some(pids) = lookup_output("lsof", &["-nP", "-t", &listen, "-sTCP:LISTEN"]).await else {
        return Vec::new();
    };

    let own_pid = std::process::id() as i32;
    let mut killed = Vec::new();

    for pid in pids.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
        if pid == own_pid {
            continue;
        }

        let pid_arg = pid.to_string();
        let comm = lookup_output("ps", &["-p", &pid_arg, "-o", "comm="])
            .await
            .unwrap_or_default();
        let args = lookup_output("ps", &["-p", &pid_arg, "-o", "args="])
            .await
            .unwrap_or_default();

        if !is_agent_process(binary_name, &comm, &args) {
            warn!(
                "Port {} held by PID {} ({}), not a {} process; leaving it",
                port, pid, comm, binary_name
            );
            continue;
        }

        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => {
                warn!("Killed leftover agent PID {} ({}) on port {}", pid, comm, port);
                killed.push(format!("PID {} ({})", pid, comm));
            }
            Err(e) => warn!("Failed to kill leftover PID {}: {}", pid, e),
        }
    }

    killed
}

#[cfg(not(unix))]
async fn kill_leftover_agents(_port: u16, _binary_name: &str) -> Vec<String> {
    Vec::new()
}

fn probe_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!("Falling back to default HTTP client: {}", e);
            reqwest::Client::new()
        })
}

/// Oracle API answers `GET /api/stats`.
pub struct OracleCheck {
    client: reqwest::Client,
}

impl OracleCheck {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: probe_client(timeout),
        }
    }
}

#[async_trait]
impl PreflightCheck for OracleCheck {
    fn name(&self) -> &'static str {
        "Oracle"
    }

    async fn run(&self, config: &AgentConfig) -> CheckOutcome {
        let url = format!("{}/api/stats", config.oracle_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                CheckOutcome::pass(self.name(), format!("Connected to {}", config.oracle_url))
            }
            Ok(response) => CheckOutcome::fail(
                self.name(),
                format!(
                    "{} returned HTTP {}",
                    config.oracle_url,
                    response.status().as_u16()
                ),
            ),
            Err(e) => {
                debug!("Oracle probe failed: {}", e);
                CheckOutcome::fail(self.name(), format!("Cannot reach {}", config.oracle_url))
            }
        }
    }
}

/// Chain RPC answers an `eth_chainId` call.
pub struct ChainRpcCheck {
    client: reqwest::Client,
}

impl ChainRpcCheck {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: probe_client(timeout),
        }
    }
}

#[async_trait]
impl PreflightCheck for ChainRpcCheck {
    fn name(&self) -> &'static str {
        "Chain RPC"
    }

    async fn run(&self, config: &AgentConfig) -> CheckOutcome {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_chainId",
            "params": [],
            "id": 1,
        });

        let response = match self.client.post(&config.chain_rpc_url).json(&request).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                return CheckOutcome::fail(
                    self.name(),
                    format!(
                        "{} returned HTTP {}",
                        config.chain_rpc_url,
                        response.status().as_u16()
                    ),
                )
            }
            Err(e) => {
                debug!("Chain RPC probe failed: {}", e);
                return CheckOutcome::fail(
                    self.name(),
                    format!("Cannot reach {}", config.chain_rpc_url),
                );
            }
        };

        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return CheckOutcome::fail(
                    self.name(),
                    format!("Invalid JSON-RPC response: {}", e),
                )
            }
        };

        match body.get("result").and_then(|v| v.as_str()) {
            Some(chain_id) => CheckOutcome::pass(
                self.name(),
                format!("Connected to {} (chain {})", config.chain_rpc_url, chain_id),
            ),
            None => {
                let reason = body
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("missing result");
                CheckOutcome::fail(self.name(), format!("JSON-RPC error: {}", reason))
            }
        }
    }
}

/// A GPU must be visible when layers are offloaded to it.
pub struct GpuCheck {
    timeout: Duration,
}

impl GpuCheck {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PreflightCheck for GpuCheck {
    fn name(&self) -> &'static str {
        "GPU"
    }

    async fn run(&self, config: &AgentConfig) -> CheckOutcome {
        if config.gpu_layers == 0 || config.device == "cpu" {
            return CheckOutcome::pass(self.name(), "CPU mode, no GPU required");
        }

        match tokio::time::timeout(self.timeout, detect_gpu()).await {
            Ok(Some(name)) => CheckOutcome::pass(self.name(), name),
            Ok(None) => CheckOutcome::fail(
                self.name(),
                "No GPU detected. Install GPU drivers or set GPU layers to 0 for CPU mode.",
            ),
            Err(_) => CheckOutcome::fail(self.name(), "GPU detection timed out"),
        }
    }
}

/// Name of the first NVIDIA GPU reported by `nvidia-smi`.
#[cfg(not(target_os = "macos"))]
async fn detect_gpu() -> Option<String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    first_gpu_name(&String::from_utf8_lossy(&output.stdout))
}

/// Metal GPU from `system_profiler`. Every supported Mac has one, so a failing query still
/// reports a generic Apple GPU.
#[cfg(target_os = "macos")]
async fn detect_gpu() -> Option<String> {
    let output = Command::new("system_profiler")
        .arg("SPDisplaysDataType")
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return Some("Apple GPU (Metal)".to_string());
    }
    let name = metal_chipset(&String::from_utf8_lossy(&output.stdout))
        .unwrap_or_else(|| "Apple GPU".to_string());
    Some(format!("{} (Metal)", name))
}

#[cfg_attr(target_os = "macos", allow(dead_code))]
fn first_gpu_name(nvidia_smi: &str) -> Option<String> {
    nvidia_smi
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn metal_chipset(system_profiler: &str) -> Option<String> {
    system_profiler
        .lines()
        .map(str::trim_start)
        .find(|l| l.starts_with("Chipset Model:"))
        .and_then(|l| l.split_once(':'))
        .map(|(_, name)| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Runs checks in order and aggregates the result.
pub struct PreflightValidator {
    checks: Vec<Box<dyn PreflightCheck>>,
}

impl PreflightValidator {
    pub fn with_checks(checks: Vec<Box<dyn PreflightCheck>>) -> Self {
        Self { checks }
    }

    /// The built-in check sequence for `settings`.
    pub fn standard(settings: &SupervisorSettings) -> Self {
        let timeout = settings.probe_timeout();
        let mut checks: Vec<Box<dyn PreflightCheck>> = vec![
            Box::new(PrivateKeyCheck),
            Box::new(ModelCheck),
            Box::new(DeviceCheck),
            Box::new(ContextCheck),
            Box::new(
                PortCheck::new(settings.host.clone())
                    .reclaiming_from(settings.binary_name.clone()),
            ),
            Box::new(OracleCheck::new(timeout)),
            Box::new(ChainRpcCheck::new(timeout)),
        ];
        if settings.check_gpu {
            checks.push(Box::new(GpuCheck::new(timeout)));
        }
        Self { checks }
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    pub async fn run(&self, config: &AgentConfig) -> PreflightReport {
        let mut report = PreflightReport {
            passed: true,
            checks: Vec::with_capacity(self.checks.len()),
        };

        for check in &self.checks {
            let outcome = check.run(config).await;
            if outcome.passed {
                info!("Preflight [{}] ok: {}", outcome.name, outcome.message);
            } else {
                warn!("Preflight [{}] failed: {}", outcome.name, outcome.message);
                report.passed = false;
            }
            report.checks.push(outcome);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::PrivateKey;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn config_with_key(key: &str) -> AgentConfig {
        AgentConfig {
            private_key: PrivateKey::new(key),
            ..Default::default()
        }
    }

    fn offline_validator() -> PreflightValidator {
        PreflightValidator::with_checks(vec![
            Box::new(PrivateKeyCheck),
            Box::new(ModelCheck),
            Box::new(DeviceCheck),
            Box::new(ContextCheck),
        ])
    }

    #[tokio::test]
    async fn test_valid_key_passes() {
        let report = offline_validator().run(&config_with_key(KEY)).await;
        assert!(report.passed);
        assert_eq!(report.checks.len(), 4);
        assert!(report.checks[0].passed);
        assert!(!report.checks[0].message.contains(&KEY[10..60]));
    }

    #[tokio::test]
    async fn test_invalid_keys_fail_check_and_aggregate() {
        let bad = [
            "",
            "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f3623",
            "0xZZ0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
        ];
        for key in bad {
            let report = offline_validator().run(&config_with_key(key)).await;
            assert!(!report.passed, "key {:?} should fail", key);
            assert!(!report.checks[0].passed);
            assert_eq!(report.failed_names(), vec!["Wallet".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_report_into_result() {
        let report = offline_validator().run(&config_with_key("0x12")).await;
        let err = report.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Preflight failed: Wallet");
    }

    #[tokio::test]
    async fn test_device_and_context_checks() {
        let config = AgentConfig {
            device: "tpu".to_string(),
            ..config_with_key(KEY)
        };
        assert!(!DeviceCheck.run(&config).await.passed);

        let config = AgentConfig {
            ctx_size: 8192,
            parallel_slots: 4,
            ..config_with_key(KEY)
        };
        let outcome = ContextCheck.run(&config).await;
        assert!(outcome.passed);
        assert!(outcome.message.contains("reduced 4 -> 2"));

        let config = AgentConfig {
            ctx_size: 0,
            ..config_with_key(KEY)
        };
        assert!(!ContextCheck.run(&config).await.passed);
    }

    #[tokio::test]
    async fn test_port_in_use_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = AgentConfig {
            http_port: port,
            ..Default::default()
        };
        let outcome = PortCheck::new("127.0.0.1").run(&config).await;
        assert!(!outcome.passed);
        assert!(outcome.message.contains(&port.to_string()));

        drop(listener);
        assert!(PortCheck::new("127.0.0.1").run(&config).await.passed);
    }

    #[tokio::test]
    async fn test_port_held_by_other_process_is_left_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = AgentConfig {
            http_port: port,
            ..Default::default()
        };
        let outcome = PortCheck::new("127.0.0.1")
            .reclaiming_from("llama-server")
            .run(&config)
            .await;
        assert!(!outcome.passed);
        assert!(outcome.message.contains("in use by another process"));

        // still ours
        assert!(listener.local_addr().is_ok());
        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_err());
    }

    #[test]
    fn test_gpu_name_parsing() {
        assert_eq!(
            first_gpu_name("\nNVIDIA GeForce RTX 4090\nNVIDIA A100\n").as_deref(),
            Some("NVIDIA GeForce RTX 4090")
        );
        assert_eq!(first_gpu_name("  \n"), None);

        let profiler = "Graphics/Displays:\n\n    Apple M2 Pro:\n\n      Chipset Model: Apple M2 Pro\n      Type: GPU\n      Metal Support: Metal 3\n";
        assert_eq!(metal_chipset(profiler).as_deref(), Some("Apple M2 Pro"));
        assert_eq!(metal_chipset("Graphics/Displays:\n"), None);
    }

    #[test]
    fn test_is_agent_process() {
        assert!(is_agent_process("llama-server", "llama-server", "llama-server"));
        assert!(is_agent_process(
            "llama-server",
            "llama-server-x8",
            "/opt/warden/llama-server-x86_64-unknown-linux-gnu"
        ));
        assert!(is_agent_process(
            "fake-agent",
            "python3",
            "/usr/bin/python3 /tmp/run/fake-agent 18920"
        ));
        assert!(!is_agent_process("llama-server", "nginx", "nginx: master process"));
        assert!(!is_agent_process(
            "llama-server",
            "python3",
            "python3 -m http.server 18920"
        ));
    }

    #[tokio::test]
    async fn test_network_checks_against_mock() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oracle/api/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(serde_json::json!({"method": "eth_chainId"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": "0xa"}),
            ))
            .mount(&server)
            .await;

        let config = AgentConfig {
            oracle_url: format!("{}/oracle/", server.uri()),
            chain_rpc_url: format!("{}/rpc", server.uri()),
            ..config_with_key(KEY)
        };

        let oracle = OracleCheck::new(Duration::from_secs(2)).run(&config).await;
        assert!(oracle.passed, "{}", oracle.message);

        let rpc = ChainRpcCheck::new(Duration::from_secs(2)).run(&config).await;
        assert!(rpc.passed, "{}", rpc.message);
        assert!(rpc.message.contains("chain 0xa"));
    }

    #[tokio::test]
    async fn test_rpc_error_body_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32601, "message": "method not found"}
            })))
            .mount(&server)
            .await;

        let config = AgentConfig {
            chain_rpc_url: server.uri(),
            ..Default::default()
        };
        let outcome = ChainRpcCheck::new(Duration::from_secs(2)).run(&config).await;
        assert!(!outcome.passed);
        assert!(outcome.message.contains("method not found"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoints_fail_within_timeout() {
        let config = AgentConfig {
            oracle_url: "http://127.0.0.1:9".to_string(),
            chain_rpc_url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        };

        let started = std::time::Instant::now();
        let oracle = OracleCheck::new(Duration::from_millis(500)).run(&config).await;
        let rpc = ChainRpcCheck::new(Duration::from_millis(500)).run(&config).await;

        assert!(!oracle.passed);
        assert!(oracle.message.starts_with("Cannot reach"));
        assert!(!rpc.passed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_gpu_check_skipped_for_cpu() {
        let config = AgentConfig {
            gpu_layers: 0,
            ..Default::default()
        };
        assert!(GpuCheck::new(Duration::from_secs(1)).run(&config).await.passed);
    }

    #[test]
    fn test_standard_order() {
        let settings = SupervisorSettings::default();
        assert_eq!(
            PreflightValidator::standard(&settings).check_names(),
            vec!["Wallet", "Model", "Device", "Context", "HTTP Port", "Oracle", "Chain RPC"]
        );

        let settings = SupervisorSettings {
            check_gpu: true,
            ..Default::default()
        };
        assert_eq!(
            PreflightValidator::standard(&settings).check_names().last(),
            Some(&"GPU")
        );
    }
}
