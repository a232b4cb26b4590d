//! Agent health and metrics polling.
//!
//! The agent has no push channel, so readiness is discovered by polling `GET /health` on a
//! fixed interval. Transient failures are expected while the model loads and are retried on
//! the next tick; only cancellation ends a poller.

use crate::errors::{HealthError, HealthResult};
use crate::stream::{LoadingPhase, LoadingProgress};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Snapshot of `GET /health`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub status: String,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub address: Option<String>,
    pub uptime: Option<u64>,
    pub layers: Option<Value>,
    /// Load fraction reported while `status == "loading model"`
    pub progress: Option<f64>,
}

impl AgentHealth {
    /// Lenient parse; unknown or mistyped fields are ignored.
    pub fn from_json(body: &Value) -> Self {
        let text = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
        AgentHealth {
            status: text("status").unwrap_or_default(),
            model: text("model"),
            mode: text("mode"),
            address: text("address"),
            uptime: body
                .get("uptime")
                .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64))),
            layers: body.get("layers").cloned(),
            progress: body.get("progress").and_then(Value::as_f64),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.status.as_str(), "ok" | "ready")
    }

    pub fn loading_progress(&self) -> Option<LoadingProgress> {
        if self.status != "loading model" {
            return None;
        }
        self.progress
            .map(|fraction| LoadingProgress::from_fraction(fraction, LoadingPhase::Loading))
    }
}

/// Snapshot of the agent's metrics endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentMetrics {
    pub total_requests: u64,
    pub total_tokens_processed: u64,
    pub avg_latency_ms: f64,
    pub tokens_per_second: f64,
    pub uptime_seconds: u64,
    pub prompt_tokens: u64,
    pub requests_processing: u64,
}

impl AgentMetrics {
    /// Parse llama.cpp Prometheus exposition text.
    ///
    /// Both `llamacpp:` and `llamacpp_` name prefixes are accepted.
    pub fn from_prometheus(text: &str) -> Self {
        let mut samples: HashMap<String, f64> = HashMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (name, rest) = match line.find('{') {
                Some(open) => match line[open..].find('}') {
                    Some(close) => (&line[..open], &line[open + close + 1..]),
                    None => continue,
                },
                None => match line.split_once(char::is_whitespace) {
                    Some((name, rest)) => (name, rest),
                    None => continue,
                },
            };

            let value = rest.split_whitespace().next().and_then(|v| v.parse::<f64>().ok());
            if let Some(value) = value {
                let key = name
                    .trim()
                    .trim_start_matches("llamacpp:")
                    .trim_start_matches("llamacpp_");
                // labeled series of one metric (per slot, per model) add up
                *samples.entry(key.to_string()).or_default() += value;
            }
        }

        let get = |key: &str| samples.get(key).copied().unwrap_or(0.0);

        let predicted = get("tokens_predicted_total");
        let prompt = get("prompt_tokens_total").max(get("prompt_tokens_processed_total"));
        let predicted_seconds = get("tokens_predicted_seconds_total");

        AgentMetrics {
            total_requests: 0,
            total_tokens_processed: (predicted + prompt) as u64,
            avg_latency_ms: 0.0,
            tokens_per_second: if predicted_seconds > 0.0 {
                predicted / predicted_seconds
            } else {
                0.0
            },
            uptime_seconds: 0,
            prompt_tokens: prompt as u64,
            requests_processing: get("requests_processing") as u64,
        }
    }

    /// JSON body or Prometheus text, whichever `body` looks like.
    pub fn parse(body: &str) -> HealthResult<Self> {
        if body.trim_start().starts_with('{') {
            serde_json::from_str(body).map_err(|e| HealthError::Decode(e.to_string()))
        } else {
            Ok(Self::from_prometheus(body))
        }
    }
}

/// Access to the agent's HTTP surface.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn health(&self) -> HealthResult<AgentHealth>;

    async fn metrics(&self) -> HealthResult<AgentMetrics>;

    /// Ask the agent to exit on its own.
    async fn request_shutdown(&self) -> HealthResult<()>;
}

/// [`HealthProbe`] over reqwest.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    shutdown_timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            shutdown_timeout: request_timeout,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn health(&self) -> HealthResult<AgentHealth> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.request_timeout)
            .send()
            .await?;

        // 503 while the model loads still carries a JSON body
        let status = response.status();
        let body = response.text().await?;
        match serde_json::from_str::<Value>(&body) {
            Ok(json) => Ok(AgentHealth::from_json(&json)),
            Err(_) if !status.is_success() => Err(HealthError::Status(status.as_u16())),
            Err(e) => Err(HealthError::Decode(e.to_string())),
        }
    }

    async fn metrics(&self) -> HealthResult<AgentMetrics> {
        let response = self
            .client
            .get(format!("{}/metrics", self.base_url))
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(HealthError::Status(status.as_u16()));
        }
        AgentMetrics::parse(&response.text().await?)
    }

    async fn request_shutdown(&self) -> HealthResult<()> {
        let response = self
            .client
            .post(format!("{}/shutdown", self.base_url))
            .timeout(self.shutdown_timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(HealthError::Status(status.as_u16()))
        }
    }
}

/// Receives poll results. Implemented by the supervisor.
#[async_trait]
pub trait PollObserver: Send + Sync {
    async fn on_health(&self, health: AgentHealth);

    async fn on_metrics(&self, metrics: AgentMetrics);

    /// Called once, on the first ready response.
    async fn on_ready(&self);

    async fn on_progress(&self, progress: LoadingProgress);

    /// Called each time `consecutive` failures reach a multiple of the warn threshold.
    async fn on_unreachable(&self, consecutive: u32, error: &HealthError);
}

/// Counters returned when a poller stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub polls: u64,
    pub failures: u64,
    pub ready_at_poll: Option<u64>,
}

/// Periodic health and metrics poller for one agent run.
pub struct HealthPoller {
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    warn_after: u32,
}

impl HealthPoller {
    pub fn new(probe: Arc<dyn HealthProbe>, interval: Duration) -> Self {
        Self {
            probe,
            interval,
            warn_after: 20,
        }
    }

    pub fn with_warn_after(mut self, failures: u32) -> Self {
        self.warn_after = failures.max(1);
        self
    }

    pub fn spawn(
        self,
        observer: Arc<dyn PollObserver>,
        cancel: CancellationToken,
    ) -> JoinHandle<PollSummary> {
        tokio::spawn(self.run(observer, cancel))
    }

    /// Poll until `cancel` fires. The first tick is immediate.
    pub async fn run(
        self,
        observer: Arc<dyn PollObserver>,
        cancel: CancellationToken,
    ) -> PollSummary {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut summary = PollSummary::default();
        let mut consecutive_failures: u32 = 0;

        debug!("Health poller started (every {:?})", self.interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            summary.polls += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.probe.health() => result,
            };

            match result {
                Ok(health) => {
                    consecutive_failures = 0;
                    if let Some(progress) = health.loading_progress() {
                        observer.on_progress(progress).await;
                    }

                    let ready = health.is_ready();
                    observer.on_health(health).await;

                    if ready && summary.ready_at_poll.is_none() {
                        summary.ready_at_poll = Some(summary.polls);
                        info!("Agent reported ready after {} polls", summary.polls);
                        observer.on_ready().await;
                    }
                }
                Err(e) => {
                    summary.failures += 1;
                    consecutive_failures += 1;
                    debug!("Health poll {} failed: {}", summary.polls, e);
                    if consecutive_failures % self.warn_after == 0 {
                        warn!(
                            "Agent health endpoint unreachable for {} consecutive polls: {}",
                            consecutive_failures, e
                        );
                        observer.on_unreachable(consecutive_failures, &e).await;
                    }
                    continue;
                }
            }

            let metrics = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.probe.metrics() => result,
            };
            match metrics {
                Ok(metrics) => observer.on_metrics(metrics).await,
                Err(e) => debug!("Metrics poll failed: {}", e),
            }
        }

        debug!("Health poller stopped after {} polls", summary.polls);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PROMETHEUS: &str = "\
# HELP llamacpp:prompt_tokens_total Number of prompt tokens processed.
# TYPE llamacpp:prompt_tokens_total counter
llamacpp:prompt_tokens_total 1200
llamacpp:tokens_predicted_total 800
llamacpp:tokens_predicted_seconds_total 20.0
llamacpp:requests_processing{slot=\"0\"} 2
";

    #[test]
    fn test_health_from_json() {
        let body = serde_json::json!({
            "status": "loading model",
            "progress": 0.25,
            "model": "qwen3",
            "uptime": 12.7,
        });
        let health = AgentHealth::from_json(&body);
        assert!(!health.is_ready());
        assert_eq!(health.uptime, Some(12));
        assert_eq!(health.loading_progress().unwrap().percent, 25.0);

        let ready = AgentHealth::from_json(&serde_json::json!({"status": "ok"}));
        assert!(ready.is_ready());
        assert!(AgentHealth::from_json(&serde_json::json!({"status": "ready"})).is_ready());
        assert!(ready.loading_progress().is_none());
    }

    #[test]
    fn test_metrics_from_prometheus() {
        let metrics = AgentMetrics::from_prometheus(PROMETHEUS);
        assert_eq!(metrics.total_tokens_processed, 2000);
        assert_eq!(metrics.prompt_tokens, 1200);
        assert_eq!(metrics.tokens_per_second, 40.0);
        assert_eq!(metrics.requests_processing, 2);
    }

    #[test]
    fn test_prometheus_sums_labeled_series() {
        let body = "\
llamacpp:requests_processing{slot=\"0\"} 1
llamacpp:requests_processing{slot=\"1\"} 2
llamacpp:tokens_predicted_total{slot=\"0\"} 300
llamacpp:tokens_predicted_total{slot=\"1\"} 100
llamacpp:tokens_predicted_seconds_total 10
";
        let metrics = AgentMetrics::from_prometheus(body);
        assert_eq!(metrics.requests_processing, 3);
        assert_eq!(metrics.total_tokens_processed, 400);
        assert_eq!(metrics.tokens_per_second, 40.0);
    }

    #[test]
    fn test_metrics_parse_json() {
        let metrics = AgentMetrics::parse(
            r#"{"total_requests":5,"total_tokens_processed":900,"avg_latency_ms":120.5,"tokens_per_second":33.0,"uptime_seconds":60}"#,
        )
        .unwrap();
        assert_eq!(metrics.total_requests, 5);
        assert_eq!(metrics.avg_latency_ms, 120.5);
        assert_eq!(metrics.uptime_seconds, 60);
    }

    #[tokio::test]
    async fn test_http_probe_reads_loading_body_on_503() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_string(r#"{"status":"loading model","progress":0.5}"#),
            )
            .mount(&server)
            .await;

        let probe = HttpHealthProbe::new(server.uri(), Duration::from_secs(3));
        let health = probe.health().await.unwrap();
        assert_eq!(health.status, "loading model");
        assert_eq!(health.progress, Some(0.5));
    }

    #[tokio::test]
    async fn test_http_probe_metrics_and_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PROMETHEUS))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/shutdown"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let probe = HttpHealthProbe::new(format!("{}/", server.uri()), Duration::from_secs(3));
        assert_eq!(probe.metrics().await.unwrap().tokens_per_second, 40.0);
        probe.request_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        // Nothing listens on port 9 of localhost in test environments
        let probe = HttpHealthProbe::new("http://127.0.0.1:9", Duration::from_millis(500));
        assert!(matches!(probe.health().await, Err(HealthError::Request(_))));
    }

    /// Replays a fixed script of health results, then repeats the last one.
    struct ScriptedProbe {
        script: Mutex<Vec<HealthResult<AgentHealth>>>,
    }

    impl ScriptedProbe {
        fn new(mut script: Vec<HealthResult<AgentHealth>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
            }
        }
    }

    fn status(s: &str) -> HealthResult<AgentHealth> {
        Ok(AgentHealth {
            status: s.to_string(),
            ..Default::default()
        })
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn health(&self) -> HealthResult<AgentHealth> {
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop().unwrap_or_else(|| status("ok"))
            } else {
                match script.last() {
                    Some(Ok(h)) => Ok(h.clone()),
                    _ => Err(HealthError::Status(503)),
                }
            }
        }

        async fn metrics(&self) -> HealthResult<AgentMetrics> {
            Ok(AgentMetrics {
                total_requests: 1,
                ..Default::default()
            })
        }

        async fn request_shutdown(&self) -> HealthResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        ready: Mutex<u32>,
        health: Mutex<Vec<String>>,
        metrics: Mutex<u32>,
        unreachable: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl PollObserver for Recorder {
        async fn on_health(&self, health: AgentHealth) {
            self.health.lock().push(health.status);
        }
        async fn on_metrics(&self, _metrics: AgentMetrics) {
            *self.metrics.lock() += 1;
        }
        async fn on_ready(&self) {
            *self.ready.lock() += 1;
        }
        async fn on_progress(&self, _progress: LoadingProgress) {}
        async fn on_unreachable(&self, consecutive: u32, _error: &HealthError) {
            self.unreachable.lock().push(consecutive);
        }
    }

    #[tokio::test]
    async fn test_poller_signals_ready_once() {
        let probe = Arc::new(ScriptedProbe::new(vec![
            Err(HealthError::Status(503)),
            status("loading model"),
            status("ready"),
            status("ready"),
        ]));
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let poller = HealthPoller::new(probe, Duration::from_millis(5));
        let task = poller.spawn(recorder.clone(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let summary = task.await.unwrap();

        assert_eq!(summary.ready_at_poll, Some(3));
        assert_eq!(*recorder.ready.lock(), 1);
        assert!(recorder.health.lock().len() >= 4);
        assert!(*recorder.metrics.lock() >= 3);
    }

    #[tokio::test]
    async fn test_poller_warns_on_sustained_failure() {
        let probe = Arc::new(ScriptedProbe::new(vec![Err(HealthError::Status(503))]));
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let task = HealthPoller::new(probe, Duration::from_millis(2))
            .with_warn_after(3)
            .spawn(recorder.clone(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let summary = task.await.unwrap();

        assert!(summary.failures >= 6);
        assert_eq!(summary.ready_at_poll, None);
        let warnings = recorder.unreachable.lock().clone();
        assert!(warnings.len() >= 2);
        assert_eq!(&warnings[..2], &[3, 6]);
    }

    #[tokio::test]
    async fn test_cancelled_poller_stops() {
        let probe = Arc::new(ScriptedProbe::new(vec![status("ok")]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = HealthPoller::new(probe, Duration::from_secs(3))
            .run(Arc::new(Recorder::default()), cancel)
            .await;
        assert_eq!(summary.polls, 0);
    }
}
