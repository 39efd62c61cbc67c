use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use metrics::counter;
use rollout_core::{RolloutError, RolloutResult, Timings};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const HEALTH_PATH: &str = "/admin/health";

/// Fetches the raw body of a module's health endpoint.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, port: u16) -> Result<String>;
}

/// Probes `http://<host>:<port>/admin/health`.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    host: String,
}

impl HttpHealthProbe {
    pub fn new(host: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build().context("building http client")?;
        Ok(Self { client, host: host.trim_end_matches('/').to_string() })
    }
}

#[async_trait::async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, port: u16) -> Result<String> {
        let url = format!("{}:{}{}", self.host, port, HEALTH_PATH);
        let resp = self.client.get(&url).send().await.with_context(|| format!("GET {}", url))?;
        let status = resp.status();
        let body = resp.text().await.context("reading health body")?;
        if !status.is_success() {
            return Err(anyhow!("GET {} returned {}", url, status));
        }
        Ok(body)
    }
}

/// Health endpoints answer either a plain-text body containing `OK` or an
/// actuator-style `{"status":"UP"}`; the module runtime is unknown, so both shapes are accepted.
pub fn is_healthy(body: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(v) => v.get("status").and_then(|s| s.as_str()).map_or(false, |s| s.contains("UP")),
        Err(_) => body.contains("OK"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl From<&Timings> for ProbePolicy {
    fn from(t: &Timings) -> Self {
        Self { interval: t.health_interval, max_attempts: t.health_max_attempts }
    }
}

impl Default for ProbePolicy {
    fn default() -> Self {
        (&Timings::default()).into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub module: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Healthy {
    pub module: String,
    pub attempts: u32,
}

/// Poll one module until healthy. Running out of attempts is fatal for the run.
pub async fn await_healthy(probe: &dyn HealthProbe, module: &str, port: u16, policy: ProbePolicy) -> RolloutResult<Healthy> {
    info!(module, port, "waiting for module container to initialize");
    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(policy.interval).await;
        counter!("probe_attempts", 1u64);
        let healthy = match probe.probe(port).await {
            Ok(body) => is_healthy(&body),
            Err(e) => {
                debug!(module, error = %e, "health probe failed");
                false
            }
        };
        if healthy {
            info!(module, attempt, "module container is healthy");
            return Ok(Healthy { module: module.to_string(), attempts: attempt });
        }
        let left = policy.max_attempts - attempt;
        if left > 0 {
            info!(module, attempts_left = left, max_attempts = policy.max_attempts, "module container is unhealthy");
        }
    }
    warn!(module, "module container is unhealthy, out of attempts");
    Err(RolloutError::HealthExhausted { module: module.to_string(), attempts: policy.max_attempts })
}

/// Probe every target concurrently and wait for all of them.
///
/// A failing module does not cancel its siblings; the first failure observed is
/// returned once every task has finished.
pub async fn await_all_healthy(probe: Arc<dyn HealthProbe>, targets: Vec<ProbeTarget>, policy: ProbePolicy) -> RolloutResult<Vec<Healthy>> {
    let mut set = JoinSet::new();
    for target in targets {
        let probe = Arc::clone(&probe);
        set.spawn(async move { await_healthy(probe.as_ref(), &target.module, target.port, policy).await });
    }

    let mut healthy = Vec::new();
    let mut first_err: Option<RolloutError> = None;
    while let Some(joined) = set.join_next().await {
        let outcome = joined.map_err(|e| RolloutError::Other(anyhow!("health probe task failed: {}", e))).and_then(|r| r);
        match outcome {
            Ok(h) => healthy.push(h),
            Err(e) if first_err.is_none() => first_err = Some(e),
            Err(e) => warn!(error = %e, "additional module failed to initialize"),
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    healthy.sort_by(|a, b| a.module.cmp(&b.module));
    info!(count = healthy.len(), "all module containers have initialized");
    Ok(healthy)
}
