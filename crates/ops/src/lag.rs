//! Consumer-lag barrier.
//!
//! Capability sets are generated asynchronously from entitlement events, so a
//! tenant's roles can only be bound once the capability consumer group has
//! drained that tenant's backlog. Two states: polling and drained (terminal).

use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use rollout_core::{LagSample, RolloutError, RolloutResult, Timings};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Raw output of one admin CLI invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Message-queue administrative interface.
#[async_trait::async_trait]
pub trait QueueAdmin: Send + Sync {
    /// Describe a consumer group: one row per topic partition.
    async fn describe_group(&self, group: &str) -> Result<AdminOutput>;
}

/// Runs `kafka-consumer-groups.sh` inside the broker container.
pub struct KafkaCliAdmin {
    container: String,
    broker: String,
}

impl KafkaCliAdmin {
    pub fn new(container: &str, broker: &str) -> Self {
        Self { container: container.to_string(), broker: broker.to_string() }
    }
}

#[async_trait::async_trait]
impl QueueAdmin for KafkaCliAdmin {
    async fn describe_group(&self, group: &str) -> Result<AdminOutput> {
        let script = format!("kafka-consumer-groups.sh --bootstrap-server {} --describe --group {}", self.broker, group);
        debug!(container = %self.container, group, "describing consumer group");
        let out = Command::new("docker")
            .args(["exec", "-i", self.container.as_str(), "bash", "-c", script.as_str()])
            .output()
            .await
            .context("running kafka-consumer-groups.sh")?;
        Ok(AdminOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

pub fn no_active_members_message(group: &str) -> String {
    format!("Consumer group '{}' has no active members.", group)
}

pub fn rebalancing_message(group: &str) -> String {
    format!("Consumer group '{}' is rebalancing.", group)
}

/// Interpretation of one admin call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LagReading {
    Lag(u64),
    /// No new information: the group has no members or is rebalancing.
    Transient(String),
}

/// Read the tenant's lag out of `describe` output.
///
/// Rows are selected by the tenant appearing in the TOPIC column; LAG is the
/// sixth column and is summed across the tenant's partitions.
pub fn read_lag(output: &AdminOutput, group: &str, tenant: &str) -> RolloutResult<LagReading> {
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        if stderr.contains(&no_active_members_message(group)) || stderr.contains(&rebalancing_message(group)) {
            return Ok(LagReading::Transient(stderr.to_string()));
        }
        return Err(RolloutError::QueueAdmin { group: group.to_string(), stderr: stderr.to_string() });
    }

    let mut total = 0u64;
    let mut rows = 0usize;
    for line in output.stdout.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.get(1).map_or(true, |topic| !topic.contains(tenant)) {
            continue;
        }
        let raw = cols.get(5).copied().unwrap_or("");
        let lag = raw
            .parse::<u64>()
            .map_err(|_| RolloutError::LagNotNumeric { tenant: tenant.to_string(), raw: raw.to_string() })?;
        total += lag;
        rows += 1;
    }
    if rows == 0 {
        return Err(RolloutError::LagNotNumeric { tenant: tenant.to_string(), raw: output.stdout.trim().to_string() });
    }
    Ok(LagReading::Lag(total))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    /// Last known lag; `None` until a value has been parsed.
    Polling { lag: Option<u64> },
    Drained,
}

/// Transition function of the barrier, fed one admin output per tick.
pub struct LagBarrier {
    group: String,
    tenant: String,
    state: BarrierState,
    last: Option<LagSample>,
}

impl LagBarrier {
    pub fn new(group: &str, tenant: &str) -> Self {
        Self { group: group.to_string(), tenant: tenant.to_string(), state: BarrierState::Polling { lag: None }, last: None }
    }

    pub fn state(&self) -> BarrierState {
        self.state
    }

    pub fn last_sample(&self) -> Option<&LagSample> {
        self.last.as_ref()
    }

    pub fn observe(&mut self, output: &AdminOutput) -> RolloutResult<BarrierState> {
        if self.state == BarrierState::Drained {
            return Ok(self.state);
        }
        match read_lag(output, &self.group, &self.tenant)? {
            LagReading::Lag(lag) => {
                self.last = Some(LagSample {
                    consumer_group: self.group.clone(),
                    tenant: self.tenant.clone(),
                    lag,
                    timestamp: chrono::Utc::now(),
                });
                self.state = if lag == 0 { BarrierState::Drained } else { BarrierState::Polling { lag: Some(lag) } };
            }
            LagReading::Transient(msg) => {
                warn!(group = %self.group, tenant = %self.tenant, message = %msg, "consumer group not ready; keeping previous lag");
            }
        }
        Ok(self.state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LagPolicy {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl From<&Timings> for LagPolicy {
    fn from(t: &Timings) -> Self {
        Self { initial_delay: t.lag_initial_delay, interval: t.lag_interval, max_attempts: t.lag_max_attempts }
    }
}

/// Block until the tenant's backlog is fully consumed. Returns the number of polls.
pub async fn wait_for_drain(admin: &dyn QueueAdmin, group: &str, tenant: &str, policy: LagPolicy) -> RolloutResult<u32> {
    info!(group, tenant, "polling for capability sets creation");
    tokio::time::sleep(policy.initial_delay).await;
    let mut barrier = LagBarrier::new(group, tenant);
    for attempt in 1..=policy.max_attempts {
        counter!("lag_polls", 1u64);
        let output = admin.describe_group(group).await?;
        match barrier.observe(&output)? {
            BarrierState::Drained => {
                info!(group, tenant, polls = attempt, "consumer group has no new message to process");
                return Ok(attempt);
            }
            BarrierState::Polling { lag } => {
                info!(group, tenant, lag = ?lag, "waiting for consumer group to process all messages");
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.interval).await;
                }
            }
        }
    }
    Err(RolloutError::LagExhausted { group: group.to_string(), tenant: tenant.to_string(), attempts: policy.max_attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const GROUP: &str = "folio-mod-roles-keycloak-capability-group";
    const HEADER: &str = "GROUP TOPIC PARTITION CURRENT-OFFSET LOG-END-OFFSET LAG CONSUMER-ID HOST CLIENT-ID";

    fn table(rows: &[(&str, &str)]) -> AdminOutput {
        let mut stdout = format!("\n{}\n", HEADER);
        for (i, (tenant, lag)) in rows.iter().enumerate() {
            stdout.push_str(&format!(
                "{} folio.{}.mgr-tenant-entitlements.capability {} 10 15 {} consumer-1 /10.0.0.7 client-1\n",
                GROUP, tenant, i, lag
            ));
        }
        AdminOutput { stdout, stderr: String::new() }
    }

    fn lag(n: u64) -> AdminOutput {
        table(&[("diku", &n.to_string()), ("other", "999")])
    }

    fn rebalancing() -> AdminOutput {
        AdminOutput { stdout: String::new(), stderr: format!("\n{}\n", rebalancing_message(GROUP)) }
    }

    struct Scripted(Mutex<VecDeque<AdminOutput>>);

    #[async_trait::async_trait]
    impl QueueAdmin for Scripted {
        async fn describe_group(&self, group: &str) -> Result<AdminOutput> {
            assert_eq!(group, GROUP);
            Ok(self.0.lock().unwrap().pop_front().unwrap_or_else(|| lag(7)))
        }
    }

    fn fast(max_attempts: u32) -> LagPolicy {
        LagPolicy { initial_delay: Duration::ZERO, interval: Duration::from_millis(1), max_attempts }
    }

    #[test]
    fn sums_only_the_tenant_partitions() {
        let out = table(&[("diku", "3"), ("diku", "4"), ("test", "100")]);
        assert_eq!(read_lag(&out, GROUP, "diku").unwrap(), LagReading::Lag(7));
        assert_eq!(read_lag(&out, GROUP, "test").unwrap(), LagReading::Lag(100));
    }

    #[test]
    fn tolerated_stderr_patterns_are_transient() {
        let none = AdminOutput { stdout: String::new(), stderr: no_active_members_message(GROUP) };
        assert!(matches!(read_lag(&none, GROUP, "diku").unwrap(), LagReading::Transient(_)));
        assert!(matches!(read_lag(&rebalancing(), GROUP, "diku").unwrap(), LagReading::Transient(_)));
    }

    #[test]
    fn unknown_stderr_is_fatal() {
        let out = AdminOutput { stdout: String::new(), stderr: "Error: Executing consumer group command failed".into() };
        assert!(matches!(read_lag(&out, GROUP, "diku"), Err(RolloutError::QueueAdmin { .. })));
    }

    #[test]
    fn non_numeric_lag_is_fatal() {
        let out = table(&[("diku", "unparseable")]);
        match read_lag(&out, GROUP, "diku") {
            Err(RolloutError::LagNotNumeric { raw, .. }) => assert_eq!(raw, "unparseable"),
            other => panic!("expected LagNotNumeric, got {other:?}"),
        }
        let missing = table(&[("test", "0")]);
        assert!(matches!(read_lag(&missing, GROUP, "diku"), Err(RolloutError::LagNotNumeric { .. })));
    }

    #[test]
    fn sample_sequence_drains_without_aborting() {
        let mut barrier = LagBarrier::new(GROUP, "diku");
        let states: Vec<BarrierState> = [lag(5), lag(5), rebalancing(), lag(2), lag(0)]
            .iter()
            .map(|o| barrier.observe(o).expect("never fatal"))
            .collect();
        assert_eq!(
            states,
            vec![
                BarrierState::Polling { lag: Some(5) },
                BarrierState::Polling { lag: Some(5) },
                BarrierState::Polling { lag: Some(5) },
                BarrierState::Polling { lag: Some(2) },
                BarrierState::Drained,
            ]
        );
        assert_eq!(barrier.last_sample().map(|s| s.lag), Some(0));
    }

    #[test]
    fn unparseable_sample_aborts() {
        let mut barrier = LagBarrier::new(GROUP, "diku");
        barrier.observe(&lag(5)).unwrap();
        let garbage = AdminOutput { stdout: String::new(), stderr: "unparseable".into() };
        assert!(barrier.observe(&garbage).is_err());
    }

    #[tokio::test]
    async fn wait_for_drain_polls_until_zero() {
        let admin = Scripted(Mutex::new(VecDeque::from(vec![lag(5), lag(5), rebalancing(), lag(2), lag(0)])));
        let polls = wait_for_drain(&admin, GROUP, "diku", fast(10)).await.expect("drained");
        assert_eq!(polls, 5);
    }

    #[tokio::test]
    async fn wait_for_drain_is_attempt_bounded() {
        let admin = Scripted(Mutex::new(VecDeque::new()));
        match wait_for_drain(&admin, GROUP, "diku", fast(3)).await {
            Err(RolloutError::LagExhausted { attempts, tenant, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(tenant, "diku");
            }
            other => panic!("expected LagExhausted, got {other:?}"),
        }
    }
}
