use rollout_core::{Entitlement, RolloutConfig, RolloutError};
use rollout_platform::{Call, MockPlatform, TenantSession};
use rollout_provision::*;
use serde_json::json;

const REGISTRY: &str = "https://folio-registry.dev.folio.org";

const CONFIG: &str = r#"
registries:
  folio: https://folio-registry.dev.folio.org
application:
  name: app-platform-minimal
  version: 1.0.0
  dependencies:
    app-platform-base: "^1.0.0"
tenants: [diku, test]
roles:
  admin:
    tenant: diku
    capability-sets: [all]
  librarian:
    tenant: diku
    capability-sets: [Users, Users, Notes]
  auditor:
    tenant: diku
    capability-sets: [Nothing]
  ghost:
    tenant: diku
users:
  diku_admin:
    tenant: diku
    password: admin
    first-name: Diku
    last-name: Admin
    roles: [admin, missing]
  diku_nobody:
    tenant: diku
    password: secret
    roles: [missing]
  test_admin:
    tenant: test
    password: admin
    roles: [admin]
backend-modules:
  mod-users:
    server-port: 8081
  mod-notes:
    server-port: 8082
    version: 5.1.0
  mod-inventory: {}
frontend-modules:
  folio_users: {}
"#;

fn config() -> RolloutConfig {
    RolloutConfig::from_yaml_str(CONFIG).expect("config")
}

fn session(tenant: &str) -> TenantSession {
    TenantSession::new(tenant, "token")
}

fn registry() -> MockPlatform {
    MockPlatform::new().with_registry(
        REGISTRY,
        &["okapi", "mgr-applications-2.0.0", "mod-users-19.3.0", "mod-notes-5.0.0", "mod-inventory-20.0.0", "folio_users-10.1.0", "mod-unlisted-1.0.0"],
    )
}

#[tokio::test]
async fn assembled_application_references_registry_and_sidecars() {
    let cfg = config();
    let platform = registry();
    let descriptor = assemble_application(&platform, &cfg).await.expect("assembled");

    assert_eq!(descriptor.id, "app-platform-minimal-1.0.0");
    assert_eq!(descriptor.description, "Default");
    assert_eq!(descriptor.dependencies["app-platform-base"], "^1.0.0");
    let backend: Vec<_> = descriptor.backend_modules.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(backend, vec!["mod-users-19.3.0", "mod-notes-5.1.0", "mod-inventory-20.0.0"]);
    assert_eq!(descriptor.frontend_modules.len(), 1);
    assert_eq!(
        descriptor.backend_modules[1].url.as_deref(),
        Some("https://folio-registry.dev.folio.org/_/proxy/modules/mod-notes-5.1.0")
    );
    assert!(descriptor.module_descriptors.is_empty());

    // mod-inventory has no server port, so it has no discovery entry.
    let locations: Vec<_> = descriptor.discovery.iter().map(|d| d.location.as_str()).collect();
    assert_eq!(locations, vec!["http://mod-users-sc.eureka:8081", "http://mod-notes-sc.eureka:8082"]);

    let created = create_application(&platform, &descriptor).await.expect("created");
    assert_eq!(created, 2);
    let calls = platform.calls();
    assert!(matches!(&calls[0], Call::CreateApplication(d) if d.id == descriptor.id));
    assert!(matches!(&calls[1], Call::CreateDiscovery(entries) if entries.len() == 2));
}

#[tokio::test]
async fn fetch_mode_inlines_descriptors() {
    let cfg = RolloutConfig::from_yaml_str(&CONFIG.replace("  version: 1.0.0\n", "  version: 1.0.0\n  fetch-descriptors: true\n"))
        .expect("config");
    assert!(cfg.application.fetch_descriptors);
    let platform = MockPlatform::new()
        .with_registry(REGISTRY, &["mod-users-19.3.0", "folio_users-10.1.0"])
        .with_descriptor(&descriptor_url(REGISTRY, "mod-users-19.3.0"), json!({"id": "mod-users-19.3.0"}))
        .with_descriptor(&descriptor_url(REGISTRY, "folio_users-10.1.0"), json!({"id": "folio_users-10.1.0"}));

    let descriptor = assemble_application(&platform, &cfg).await.expect("assembled");
    assert_eq!(descriptor.module_descriptors, vec![json!({"id": "mod-users-19.3.0"})]);
    assert_eq!(descriptor.ui_module_descriptors, vec![json!({"id": "folio_users-10.1.0"})]);
    assert!(descriptor.backend_modules.iter().all(|m| m.url.is_none()));
}

#[tokio::test]
async fn empty_discovery_batch_is_not_submitted() {
    let cfg = config();
    let platform = MockPlatform::new().with_registry(REGISTRY, &["folio_users-10.1.0"]);
    let descriptor = assemble_application(&platform, &cfg).await.unwrap();
    assert_eq!(create_application(&platform, &descriptor).await.unwrap(), 0);
    assert_eq!(platform.calls().len(), 1);
}

#[tokio::test]
async fn missing_descriptor_registry_is_a_config_error() {
    let cfg = RolloutConfig::from_yaml_str(&CONFIG.replace("  folio: https", "  eureka: https")).unwrap();
    let err = assemble_application(&registry(), &cfg).await.unwrap_err();
    assert!(matches!(err, RolloutError::Config(_)));
}

#[tokio::test]
async fn removals_only_touch_configured_tenants() {
    let cfg = config();
    let platform = MockPlatform::new()
        .with_tenant("t-diku", "diku")
        .with_tenant("t-other", "other")
        .with_tenant("t-test", "test");

    let removed = remove_entitlements(&platform, &cfg).await.unwrap();
    assert_eq!(removed, vec!["diku", "test"]);
    let removed = remove_tenants(&platform, &cfg).await.unwrap();
    assert_eq!(removed, vec!["diku", "test"]);

    let calls = platform.calls();
    assert_eq!(
        calls,
        vec![
            Call::DeleteEntitlement(Entitlement::new("t-diku", "app-platform-minimal-1.0.0")),
            Call::DeleteEntitlement(Entitlement::new("t-test", "app-platform-minimal-1.0.0")),
            Call::DeleteTenant("t-diku".into()),
            Call::DeleteTenant("t-test".into()),
        ]
    );
}

#[tokio::test]
async fn entitlements_need_existing_configured_tenants() {
    let cfg = config();
    let platform = MockPlatform::new().with_tenant("t-other", "other");
    create_tenants(&platform, &cfg).await.unwrap();
    let entitled = create_entitlements(&platform, &cfg).await.unwrap();
    assert_eq!(entitled, vec!["diku", "test"]);

    let params: Vec<_> = platform
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::CreateEntitlement { entitlement, tenant_parameters } => Some((entitlement.tenant_id, tenant_parameters)),
            _ => None,
        })
        .collect();
    assert_eq!(
        params,
        vec![
            ("diku-id".to_string(), "loadReference=true,loadSample=true".to_string()),
            ("test-id".to_string(), "loadReference=true,loadSample=true".to_string()),
        ]
    );
}

#[tokio::test]
async fn failed_tenant_delete_is_tolerated() {
    let cfg = config();
    let platform = MockPlatform::new().with_tenant("t-diku", "diku").failing("delete_tenant");
    assert!(remove_tenants(&platform, &cfg).await.unwrap().is_empty());
}

#[tokio::test]
async fn role_lookup_distinguishes_missing_and_ambiguous() {
    let platform = MockPlatform::new().with_role("diku", "r1", "Admin").with_role("diku", "r2", "Admin").with_role("diku", "r3", "Librarian");
    let s = session("diku");

    assert_eq!(find_role_by_name(&platform, &s, "Nobody").await.unwrap(), RoleLookup::Missing);
    assert!(matches!(find_role_by_name(&platform, &s, "Librarian").await.unwrap(), RoleLookup::Found(r) if r.id == "r3"));
    match find_role_by_name(&platform, &s, "Admin").await {
        Err(RolloutError::AmbiguousRole { name, count }) => {
            assert_eq!(name, "Admin");
            assert_eq!(count, 2);
        }
        other => panic!("expected AmbiguousRole, got {other:?}"),
    }
}

fn capability_platform() -> MockPlatform {
    MockPlatform::new()
        .with_application("app-a-1.0.0")
        .with_application("app-b-1.0.0")
        .with_application("app-empty-1.0.0")
        .with_role("diku", "r-admin", "Admin")
        .with_role("diku", "r-lib", "Librarian")
        .with_role("diku", "r-aud", "Auditor")
        .with_capability_set("diku", "cs-1", "Users", "app-a-1.0.0")
        .with_capability_set("diku", "cs-2", "Notes", "app-a-1.0.0")
        .with_capability_set("diku", "cs-2", "Notes", "app-b-1.0.0")
        .with_capability_set("diku", "cs-3", "Inventory", "app-b-1.0.0")
}

#[tokio::test]
async fn all_selects_the_union_without_duplicates() {
    let platform = capability_platform();
    let sets = select_capability_sets(&platform, &session("diku"), &CapabilitySelection::All).await.unwrap();
    let ids: Vec<_> = sets.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["cs-1", "cs-2", "cs-3"]);
}

#[tokio::test]
async fn binding_detaches_before_attaching() {
    let cfg = config();
    let platform = capability_platform();
    let bindings = bind_capability_sets(&platform, &cfg, &session("diku")).await.expect("bound");

    assert_eq!(
        bindings,
        vec![
            RoleBinding { role: "Admin".into(), capability_sets: 3 },
            RoleBinding { role: "Librarian".into(), capability_sets: 2 },
        ]
    );

    let calls = platform.calls();
    let first_attach = calls.iter().position(|c| matches!(c, Call::AttachCapabilitySets { .. })).expect("attached");
    let last_detach = calls.iter().rposition(|c| matches!(c, Call::DetachCapabilitySets { .. })).expect("detached");
    assert!(last_detach < first_attach);

    // Ghost is configured but absent on the platform; Auditor selects nothing.
    let detached: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            Call::DetachCapabilitySets { role_id, .. } => Some(role_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(detached, vec!["r-admin", "r-aud", "r-lib"]);
    assert!(calls.contains(&Call::AttachCapabilitySets {
        tenant: "diku".into(),
        role_id: "r-lib".into(),
        ids: vec!["cs-1".into(), "cs-2".into()],
    }));
}

#[tokio::test]
async fn roles_are_created_title_cased_and_removed_by_config() {
    let cfg = config();
    let platform = MockPlatform::new().with_role("diku", "r-x", "Stranger");
    let s = session("diku");
    let created = create_roles(&platform, &cfg, &s).await.unwrap();
    assert_eq!(created, vec!["Admin", "Auditor", "Ghost", "Librarian"]);

    let removed = remove_roles(&platform, &cfg, &s).await.unwrap();
    assert_eq!(removed.len(), 4);
    assert!(!removed.contains(&"Stranger".to_string()));
}

#[tokio::test]
async fn users_get_credentials_and_resolved_roles_only() {
    let cfg = config();
    let platform = MockPlatform::new().with_role("diku", "r-admin", "Admin");
    let users = create_users(&platform, &cfg, &session("diku")).await.expect("users");

    assert_eq!(users.len(), 2);
    assert_eq!(users[0], ProvisionedUser { username: "diku_admin".into(), id: "user-diku_admin".into(), roles: 1 });
    assert_eq!(users[1].roles, 0);

    let calls = platform.calls();
    assert!(calls.contains(&Call::AttachUserRoles {
        tenant: "diku".into(),
        user_id: "user-diku_admin".into(),
        role_ids: vec!["r-admin".into()],
    }));
    // No role resolved for diku_nobody: credentials yes, role attachment no.
    assert!(calls.contains(&Call::AttachCredentials { tenant: "diku".into(), user_id: "user-diku_nobody".into() }));
    assert!(!calls.iter().any(|c| matches!(c, Call::AttachUserRoles { user_id, .. } if user_id == "user-diku_nobody")));
}

#[tokio::test]
async fn ambiguous_user_role_is_fatal() {
    let cfg = config();
    let platform = MockPlatform::new().with_role("test", "r1", "Admin").with_role("test", "r2", "Admin");
    match create_users(&platform, &cfg, &session("test")).await.unwrap_err() {
        RolloutError::At { tenant, entity, source } => {
            assert_eq!(tenant.as_deref(), Some("test"));
            assert_eq!(entity, "user test_admin");
            assert!(matches!(*source, RolloutError::AmbiguousRole { count: 2, .. }));
        }
        other => panic!("expected an attributed AmbiguousRole, got {other:?}"),
    }
}

#[tokio::test]
async fn remove_users_matches_configured_usernames_in_tenant() {
    let cfg = config();
    let platform = MockPlatform::new()
        .with_user("diku", "u1", "diku_admin")
        .with_user("diku", "u2", "test_admin")
        .with_user("diku", "u3", "walk_in");
    let removed = remove_users(&platform, &cfg, &session("diku")).await.unwrap();
    assert_eq!(removed, vec!["diku_admin"]);
}

#[tokio::test]
async fn discovery_update_is_a_full_replace() {
    let platform = MockPlatform::new();
    let entry = update_discovery(&platform, "eureka", "mod-users:19.3.0", Some("http://host.docker.internal:9130"), false, 8081)
        .await
        .unwrap();
    assert_eq!(platform.calls(), vec![Call::ReplaceDiscovery(entry)]);
}
