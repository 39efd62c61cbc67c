use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use rollout_api::{Collaborators, Orchestrator};
use rollout_core::{RolloutConfig, Timings};
use rollout_ops::{HttpHealthProbe, KafkaCliAdmin};
use rollout_platform::{HttpPlatform, StaticToken, TokenSource};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rolloutctl", version, about = "Rollout CLI: applications, tenants, roles and users for a modular platform")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Rollout configuration (YAML)
    #[arg(long = "config", env = "ROLLOUT_CONFIG", global = true, default_value = "rollout.yaml")]
    config: PathBuf,

    /// Host the platform services and module health ports are published on
    #[arg(long = "gateway", env = "ROLLOUT_GATEWAY", global = true, default_value = "http://localhost")]
    gateway: String,

    /// Access token for gateway-fronted endpoints (roles, capability sets, users)
    #[arg(long = "token", env = "ROLLOUT_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the whole pipeline: health gate, application, tenants, entitlements, then per tenant roles, capability sets and users
    Run,
    /// Assemble the application from the registries and create it with its module discovery
    DeployApplication,
    /// Remove every registered application
    RemoveApplications,
    /// Create the configured tenants
    CreateTenants,
    /// Remove configured tenants found on the platform
    RemoveTenants,
    /// Entitle configured tenants to the application
    CreateEntitlements,
    /// Remove the application entitlement of configured tenants
    RemoveEntitlements,
    /// Create configured roles
    CreateRoles {
        /// Only this tenant (default: every configured tenant found on the platform)
        #[arg(long = "tenant")]
        tenant: Option<String>,
    },
    /// Remove configured roles
    RemoveRoles {
        #[arg(long = "tenant")]
        tenant: Option<String>,
    },
    /// Wait for capability sets to be generated, then attach them to configured roles
    AttachCapabilitySets {
        #[arg(long = "tenant")]
        tenant: Option<String>,
        /// Attach right away without waiting for the consumer group to drain
        #[arg(long = "no-wait", action = ArgAction::SetTrue)]
        no_wait: bool,
    },
    /// Detach capability sets from configured roles
    DetachCapabilitySets {
        #[arg(long = "tenant")]
        tenant: Option<String>,
    },
    /// Create configured users with their password and roles
    CreateUsers {
        #[arg(long = "tenant")]
        tenant: Option<String>,
    },
    /// Remove configured users
    RemoveUsers {
        #[arg(long = "tenant")]
        tenant: Option<String>,
    },
    /// Point a module's discovery at a custom location, or restore the default sidecar
    UpdateDiscovery {
        /// Module id, e.g. mod-users-19.3.0 or mod-users:19.3.0
        id: String,
        /// Custom location, e.g. http://host.docker.internal:9130
        #[arg(long = "url")]
        url: Option<String>,
        /// Restore the default sidecar location
        #[arg(long = "restore", action = ArgAction::SetTrue)]
        restore: bool,
        /// Module server port behind the sidecar
        #[arg(long = "server-port", default_value_t = 8081)]
        server_port: u16,
    },
    /// Wait for every deployed backend module with a health port to report healthy
    AwaitHealth,
    /// Remove users, roles, entitlements, tenants and applications
    Teardown,
}

/// Stands in when no token was given; gateway-fronted calls fail with a clear message.
struct NoToken;

#[async_trait::async_trait]
impl TokenSource for NoToken {
    async fn access_token(&self, tenant: &str) -> Result<String> {
        Err(anyhow!("no access token for tenant {}; pass --token or set ROLLOUT_TOKEN", tenant))
    }
}

fn init_tracing() {
    let env = std::env::var("ROLLOUT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ROLLOUT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ROLLOUT_METRICS_ADDR; expected host:port");
        }
    }
}

fn build_orchestrator(cli: &Cli) -> Result<Orchestrator> {
    let config = RolloutConfig::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;
    let timings = Timings::from_env();
    let platform = HttpPlatform::new(&cli.gateway, timings.http_timeout)?;
    let probe = HttpHealthProbe::new(&cli.gateway, timings.http_timeout)?;
    let queue_admin = KafkaCliAdmin::new(&config.kafka.container, &config.kafka.broker);
    let tokens: Arc<dyn TokenSource> = match &cli.token {
        Some(t) => Arc::new(StaticToken(t.clone())),
        None => Arc::new(NoToken),
    };
    info!(
        config = %cli.config.display(),
        gateway = %cli.gateway,
        application = %config.application_id(),
        tenants = config.tenants.len(),
        "configuration loaded"
    );
    let with = Collaborators { platform: Arc::new(platform), probe: Arc::new(probe), queue_admin: Arc::new(queue_admin), tokens };
    Ok(Orchestrator::new(Arc::new(config), with, timings))
}

/// Tenants a tenant-scoped command applies to.
async fn target_tenants(o: &Orchestrator, only: Option<String>) -> Result<Vec<String>> {
    match only {
        Some(t) if !o.config().has_tenant(&t) => Err(anyhow!("tenant {} is not configured", t)),
        Some(t) => Ok(vec![t]),
        None => Ok(o.existing_tenants().await?),
    }
}

fn print<T: Serialize>(output: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match output {
        Output::Human => human(value),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn print_names(output: Output, verb: &str, names: &[String]) -> Result<()> {
    print(output, &names, |names| {
        if names.is_empty() {
            println!("nothing {}", verb);
        }
        for n in names.iter() {
            println!("{} {}", verb, n);
        }
    })
}

#[derive(Serialize)]
struct PerTenant<T> {
    tenant: String,
    result: T,
}

async fn execute(cli: &Cli, o: &Orchestrator) -> Result<()> {
    let out = cli.output;
    match &cli.command {
        Commands::Run => {
            let report = o.run().await?;
            print(out, &report, |r| {
                println!("application {} ({} modules, {} ui modules, {} discovery entries)", r.application, r.backend_modules, r.frontend_modules, r.discovery_entries);
                for t in &r.tenants {
                    println!(
                        "tenant {}: {} roles, {} role bindings, {} users (lag drained after {} polls)",
                        t.tenant,
                        t.roles.len(),
                        t.bindings.len(),
                        t.users.len(),
                        t.lag_polls
                    );
                }
            })?;
        }
        Commands::DeployApplication => {
            let (descriptor, discovery) = o.deploy_application().await?;
            #[derive(Serialize)]
            struct Deployed<'a> {
                application: &'a str,
                modules: Vec<&'a str>,
                ui_modules: Vec<&'a str>,
                discovery_entries: usize,
            }
            let deployed = Deployed {
                application: &descriptor.id,
                modules: descriptor.backend_modules.iter().map(|m| m.id.as_str()).collect(),
                ui_modules: descriptor.frontend_modules.iter().map(|m| m.id.as_str()).collect(),
                discovery_entries: discovery,
            };
            print(out, &deployed, |d| {
                println!("created application {}", d.application);
                for m in d.modules.iter().chain(d.ui_modules.iter()) {
                    println!("  {}", m);
                }
                println!("created {} discovery entries", d.discovery_entries);
            })?;
        }
        Commands::RemoveApplications => print_names(out, "removed application", &o.remove_applications().await?)?,
        Commands::CreateTenants => print_names(out, "created tenant", &o.create_tenants().await?)?,
        Commands::RemoveTenants => print_names(out, "removed tenant", &o.remove_tenants().await?)?,
        Commands::CreateEntitlements => print_names(out, "entitled tenant", &o.create_entitlements().await?)?,
        Commands::RemoveEntitlements => print_names(out, "removed entitlement of tenant", &o.remove_entitlements().await?)?,
        Commands::CreateRoles { tenant } => {
            for t in target_tenants(o, tenant.clone()).await? {
                print_names(out, &format!("[{}] created role", t), &o.create_roles(&t).await?)?;
            }
        }
        Commands::RemoveRoles { tenant } => {
            for t in target_tenants(o, tenant.clone()).await? {
                print_names(out, &format!("[{}] removed role", t), &o.remove_roles(&t).await?)?;
            }
        }
        Commands::AttachCapabilitySets { tenant, no_wait } => {
            for t in target_tenants(o, tenant.clone()).await? {
                if !no_wait {
                    o.await_capability_sets(&t).await?;
                }
                let bindings = o.attach_capability_sets(&t).await?;
                print(out, &PerTenant { tenant: t, result: bindings }, |p| {
                    for b in &p.result {
                        println!("[{}] attached {} capability sets to {}", p.tenant, b.capability_sets, b.role);
                    }
                })?;
            }
        }
        Commands::DetachCapabilitySets { tenant } => {
            for t in target_tenants(o, tenant.clone()).await? {
                print_names(out, &format!("[{}] detached capability sets from", t), &o.detach_capability_sets(&t).await?)?;
            }
        }
        Commands::CreateUsers { tenant } => {
            for t in target_tenants(o, tenant.clone()).await? {
                let users = o.create_users(&t).await?;
                print(out, &PerTenant { tenant: t, result: users }, |p| {
                    for u in &p.result {
                        println!("[{}] created user {} with {} roles", p.tenant, u.username, u.roles);
                    }
                })?;
            }
        }
        Commands::RemoveUsers { tenant } => {
            for t in target_tenants(o, tenant.clone()).await? {
                print_names(out, &format!("[{}] removed user", t), &o.remove_users(&t).await?)?;
            }
        }
        Commands::UpdateDiscovery { id, url, restore, server_port } => {
            let entry = o.update_discovery(id, url.as_deref(), *restore, *server_port).await?;
            print(out, &entry, |e| println!("{} -> {}", e.id, e.location))?;
        }
        Commands::AwaitHealth => {
            let healthy = o.await_health().await?;
            let modules: Vec<String> = healthy.into_iter().map(|h| format!("{} ({} attempts)", h.module, h.attempts)).collect();
            print_names(out, "healthy", &modules)?;
        }
        Commands::Teardown => {
            let report = o.teardown().await?;
            print(out, &report, |r| {
                println!(
                    "removed {} users, {} roles, {} entitlements, {} tenants, {} applications",
                    r.users.len(),
                    r.roles.len(),
                    r.entitlements.len(),
                    r.tenants.len(),
                    r.applications.len()
                );
            })?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let orchestrator = build_orchestrator(&cli)?;

    tokio::select! {
        res = execute(&cli, &orchestrator) => {
            if let Err(e) = &res {
                error!(error = %e, "command failed");
            }
            res
        }
        _ = signal::ctrl_c() => {
            warn!("interrupted; platform state may be partially rolled out");
            Err(anyhow!("interrupted"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_apply_to_subcommands() {
        let cli = Cli::try_parse_from(["rolloutctl", "create-roles", "--tenant", "diku", "-o", "json", "--token", "t0k"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert_eq!(cli.token.as_deref(), Some("t0k"));
        assert!(matches!(cli.command, Commands::CreateRoles { tenant: Some(ref t) } if t == "diku"));
    }

    #[test]
    fn update_discovery_defaults() {
        let cli = Cli::try_parse_from(["rolloutctl", "update-discovery", "mod-users:19.3.0", "--restore"]).unwrap();
        match cli.command {
            Commands::UpdateDiscovery { id, url, restore, server_port } => {
                assert_eq!(id, "mod-users:19.3.0");
                assert!(url.is_none());
                assert!(restore);
                assert_eq!(server_port, 8081);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn every_stage_has_a_subcommand() {
        for name in [
            "run",
            "deploy-application",
            "remove-applications",
            "create-tenants",
            "remove-tenants",
            "create-entitlements",
            "remove-entitlements",
            "create-roles",
            "remove-roles",
            "attach-capability-sets",
            "detach-capability-sets",
            "create-users",
            "remove-users",
            "await-health",
            "teardown",
        ] {
            assert!(Cli::try_parse_from(["rolloutctl", name]).is_ok(), "{name}");
        }
    }
}
