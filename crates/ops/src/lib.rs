//! Rollout Ops: readiness barriers that block the pipeline on external convergence.
//! Module health probes fan in over a task group; the consumer-lag barrier polls
//! the message queue's admin CLI until a tenant's backlog drains.

#![forbid(unsafe_code)]

pub mod health;
pub mod lag;

pub use health::{await_all_healthy, await_healthy, is_healthy, HealthProbe, Healthy, HttpHealthProbe, ProbePolicy, ProbeTarget};
pub use lag::{
    read_lag, wait_for_drain, AdminOutput, BarrierState, KafkaCliAdmin, LagBarrier, LagPolicy, LagReading, QueueAdmin,
};
