//! Immutable configuration snapshot for one rollout run.
//!
//! Loaded once from YAML and shared as `Arc<RolloutConfig>`; nothing mutates it
//! after load. Runtime knobs (poll intervals, attempt bounds) come from
//! `ROLLOUT_*` environment variables via [`Timings::from_env`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::RolloutError;
use crate::{ApplicationDescriptor, User};

/// Consumer group suffix of the service that generates capability sets.
pub const CAPABILITY_CONSUMER_GROUP_SUFFIX: &str = "mod-roles-keycloak-capability-group";

/// Sentinel in a role's capability-set list meaning "every capability set".
pub const ALL_CAPABILITY_SETS: &str = "all";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RolloutConfig {
    /// Environment prefix used for consumer group names.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// DNS suffix of the container network that sidecars live on.
    #[serde(default = "default_network")]
    pub network: String,
    /// Module registries by name.
    #[serde(default)]
    pub registries: BTreeMap<String, String>,
    /// Registry whose `/_/proxy/modules/<id>` serves module descriptors.
    #[serde(default = "default_descriptor_registry")]
    pub descriptor_registry: String,
    pub application: ApplicationConfig,
    #[serde(default)]
    pub tenants: BTreeSet<String>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
    #[serde(default)]
    pub users: BTreeMap<String, UserConfig>,
    #[serde(default)]
    pub backend_modules: BTreeMap<String, BackendModuleConfig>,
    #[serde(default)]
    pub frontend_modules: BTreeMap<String, FrontendModuleConfig>,
    #[serde(default)]
    pub kafka: KafkaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApplicationConfig {
    pub name: String,
    pub version: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub fetch_descriptors: bool,
    #[serde(default = "default_tenant_parameters")]
    pub tenant_parameters: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RoleConfig {
    pub tenant: String,
    #[serde(default)]
    pub capability_sets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    pub tenant: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackendModuleConfig {
    #[serde(default = "default_true")]
    pub deploy_module: bool,
    /// Port the module listens on inside the network; drives the sidecar URL.
    #[serde(default)]
    pub server_port: Option<u16>,
    /// Host port the health endpoint is published on.
    #[serde(default)]
    pub health_port: Option<u16>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FrontendModuleConfig {
    #[serde(default = "default_true")]
    pub deploy_module: bool,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KafkaConfig {
    #[serde(default = "default_kafka_container")]
    pub container: String,
    #[serde(default = "default_kafka_broker")]
    pub broker: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self { container: default_kafka_container(), broker: default_kafka_broker() }
    }
}

fn default_environment() -> String {
    "folio".to_string()
}

fn default_network() -> String {
    "eureka".to_string()
}

fn default_descriptor_registry() -> String {
    "folio".to_string()
}

fn default_platform() -> String {
    "base".to_string()
}

fn default_tenant_parameters() -> String {
    "loadReference=true,loadSample=true".to_string()
}

fn default_kafka_container() -> String {
    "kafka".to_string()
}

fn default_kafka_broker() -> String {
    "kafka.eureka:9092".to_string()
}

fn default_true() -> bool {
    true
}

impl RolloutConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, RolloutError> {
        let cfg: Self = serde_yaml::from_str(s).map_err(|e| RolloutError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, RolloutError> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config at {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    fn validate(&self) -> Result<(), RolloutError> {
        if self.application.name.is_empty() || self.application.version.is_empty() {
            return Err(RolloutError::Config("application name and version are required".into()));
        }
        for (role, rc) in &self.roles {
            if !self.tenants.contains(&rc.tenant) {
                return Err(RolloutError::Config(format!("role {} references unknown tenant {}", role, rc.tenant)));
            }
        }
        for (user, uc) in &self.users {
            if !self.tenants.contains(&uc.tenant) {
                return Err(RolloutError::Config(format!("user {} references unknown tenant {}", user, uc.tenant)));
            }
        }
        Ok(())
    }

    pub fn application_id(&self) -> String {
        ApplicationDescriptor::application_id(&self.application.name, &self.application.version)
    }

    pub fn has_tenant(&self, name: &str) -> bool {
        self.tenants.contains(name)
    }

    pub fn descriptor_registry_url(&self) -> Option<&str> {
        self.registries.get(&self.descriptor_registry).map(String::as_str)
    }

    /// Consumer group that turns entitlement events into capability sets.
    pub fn capability_consumer_group(&self) -> String {
        format!("{}-{}", self.environment, CAPABILITY_CONSUMER_GROUP_SUFFIX)
    }

    /// Configured role matching a platform role name (platform names are title-cased).
    pub fn role_for(&self, platform_name: &str) -> Option<(&str, &RoleConfig)> {
        let key = platform_name.to_lowercase();
        self.roles.get_key_value(&key).map(|(k, v)| (k.as_str(), v))
    }

    pub fn roles_for_tenant(&self, tenant: &str) -> Vec<(&str, &RoleConfig)> {
        self.roles.iter().filter(|(_, rc)| rc.tenant == tenant).map(|(k, v)| (k.as_str(), v)).collect()
    }

    pub fn users_for_tenant(&self, tenant: &str) -> Vec<User> {
        self.users
            .iter()
            .filter(|(_, uc)| uc.tenant == tenant)
            .map(|(username, uc)| User {
                username: username.clone(),
                tenant: uc.tenant.clone(),
                password: uc.password.clone(),
                first_name: uc.first_name.clone(),
                last_name: uc.last_name.clone(),
                role_names: uc.roles.iter().cloned().collect(),
            })
            .collect()
    }
}

/// Poll intervals and attempt bounds for the two barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub health_interval: Duration,
    pub health_max_attempts: u32,
    pub lag_interval: Duration,
    pub lag_max_attempts: u32,
    pub lag_initial_delay: Duration,
    pub http_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            health_max_attempts: 50,
            lag_interval: Duration::from_secs(30),
            lag_max_attempts: 120,
            lag_initial_delay: Duration::from_secs(3),
            http_timeout: Duration::from_secs(60),
        }
    }
}

impl Timings {
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |key: &str, default: Duration| {
            std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(default)
        };
        let count = |key: &str, default: u32| std::env::var(key).ok().and_then(|s| s.parse::<u32>().ok()).unwrap_or(default);
        Self {
            health_interval: secs("ROLLOUT_HEALTH_INTERVAL_SECS", d.health_interval),
            health_max_attempts: count("ROLLOUT_HEALTH_MAX_ATTEMPTS", d.health_max_attempts).max(1),
            lag_interval: secs("ROLLOUT_LAG_INTERVAL_SECS", d.lag_interval),
            lag_max_attempts: count("ROLLOUT_LAG_MAX_ATTEMPTS", d.lag_max_attempts).max(1),
            lag_initial_delay: secs("ROLLOUT_LAG_INITIAL_DELAY_SECS", d.lag_initial_delay),
            http_timeout: secs("ROLLOUT_HTTP_TIMEOUT_SECS", d.http_timeout),
        }
    }
}
