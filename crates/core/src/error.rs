use std::fmt;

use serde::{Deserialize, Serialize};

/// Fatal conditions of a rollout. Tolerated conditions (rebalancing consumer
/// groups, role names that do not resolve) never surface as errors.
#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    #[error("malformed module identifier: {id:?}")]
    MalformedIdentifier { id: String },
    #[error("role name {name:?} matched {count} roles, expected at most one")]
    AmbiguousRole { name: String, count: usize },
    #[error("module {module} did not become healthy after {attempts} attempts")]
    HealthExhausted { module: String, attempts: u32 },
    #[error("consumer group {group} still lagging for tenant {tenant} after {attempts} polls")]
    LagExhausted { group: String, tenant: String, attempts: u32 },
    #[error("queue admin failed for consumer group {group}: {stderr}")]
    QueueAdmin { group: String, stderr: String },
    #[error("consumer group lag for tenant {tenant} is not a number: {raw:?}")]
    LagNotNumeric { tenant: String, raw: String },
    #[error("config: {0}")]
    Config(String),
    /// A failure attributed to the tenant and entity (user, role, module) being worked on.
    #[error("{entity}: {source}")]
    At { tenant: Option<String>, entity: String, source: Box<RolloutError> },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type RolloutResult<T> = Result<T, RolloutError>;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Resolve,
    HealthGate,
    Application,
    Discovery,
    Tenants,
    Entitlements,
    CapabilityBarrier,
    Roles,
    CapabilityBinding,
    Users,
    Teardown,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Resolve => "resolve",
            Stage::HealthGate => "health-gate",
            Stage::Application => "application",
            Stage::Discovery => "discovery",
            Stage::Tenants => "tenants",
            Stage::Entitlements => "entitlements",
            Stage::CapabilityBarrier => "capability-barrier",
            Stage::Roles => "roles",
            Stage::CapabilityBinding => "capability-binding",
            Stage::Users => "users",
            Stage::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fatal error annotated with where the run was when it happened.
#[derive(Debug, thiserror::Error)]
pub struct StageFailure {
    pub stage: Stage,
    pub tenant: Option<String>,
    pub entity: Option<String>,
    #[source]
    pub source: RolloutError,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} failed", self.stage)?;
        if let Some(t) = &self.tenant {
            write!(f, " for tenant {}", t)?;
        }
        if let Some(e) = &self.entity {
            write!(f, " at {}", e)?;
        }
        write!(f, ": {}", self.source)
    }
}

pub trait StageResultExt<T> {
    fn in_stage(self, stage: Stage, tenant: Option<&str>, entity: Option<&str>) -> Result<T, StageFailure>;
}

impl<T> StageResultExt<T> for Result<T, RolloutError> {
    fn in_stage(self, stage: Stage, tenant: Option<&str>, entity: Option<&str>) -> Result<T, StageFailure> {
        self.map_err(|source| {
            let mut failure = StageFailure { stage, tenant: tenant.map(str::to_string), entity: entity.map(str::to_string), source };
            // Innermost attribution is the most specific one.
            loop {
                match failure.source {
                    RolloutError::At { tenant, entity, source } => {
                        failure.tenant = tenant.or(failure.tenant);
                        failure.entity = Some(entity);
                        failure.source = *source;
                    }
                    other => {
                        failure.source = other;
                        return failure;
                    }
                }
            }
        })
    }
}

impl<T> StageResultExt<T> for anyhow::Result<T> {
    fn in_stage(self, stage: Stage, tenant: Option<&str>, entity: Option<&str>) -> Result<T, StageFailure> {
        self.map_err(RolloutError::from).in_stage(stage, tenant, entity)
    }
}

pub trait EntityResultExt<T> {
    /// Attribute a failure to the entity being worked on, and its tenant when there is one.
    fn for_entity(self, tenant: Option<&str>, entity: impl Into<String>) -> RolloutResult<T>;
}

impl<T, E: Into<RolloutError>> EntityResultExt<T> for Result<T, E> {
    fn for_entity(self, tenant: Option<&str>, entity: impl Into<String>) -> RolloutResult<T> {
        self.map_err(|e| RolloutError::At { tenant: tenant.map(str::to_string), entity: entity.into(), source: Box::new(e.into()) })
    }
}
