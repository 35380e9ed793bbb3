//! Test helpers and utilities for unit and integration testing.
//!
//! Provides an in-memory SQLite database running the real migrations plus
//! row factories for the common fixtures.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, Set};
use sea_orm_migration::MigratorTrait;

use crate::migrations::Migrator;
use crate::models::gcp_account::{AuthStatus, BillingStatus, TokenStatus};
use crate::models::prelude::*;
use crate::models::proxy_pool::ProxyStatus;
use crate::models::vm_instance::{ProxyKind, VmStatus};

/// Create an in-memory SQLite database for testing
pub async fn create_test_db() -> DatabaseConnection {
    // Each connection gets its own database
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");

    Migrator::up(&db, None)
        .await
        .expect("Failed to run test migrations");

    db
}

/// Insert a VM row with sensible defaults.
pub async fn create_test_vm(
    db: &DatabaseConnection,
    vm_id: &str,
    kind: ProxyKind,
    status: VmStatus,
    proxy: &str,
) -> vm_instance::Model {
    let now = Utc::now();
    vm_instance::ActiveModel {
        vm_id: Set(vm_id.to_string()),
        vm_name: Set(vm_id.to_string()),
        zone: Set("us-central1-a".to_string()),
        machine_type: Set("e2-small".to_string()),
        external_ip: Set("203.0.113.10".to_string()),
        internal_ip: Set("10.128.0.2".to_string()),
        proxy: Set(proxy.to_string()),
        proxy_type: Set(kind),
        ssh_user: Set("gatc".to_string()),
        ssh_key_content: Set(String::new()),
        status: Set(status),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("failed to insert test VM")
}

/// Insert a pool entry projected from a VM.
pub async fn create_test_pool_entry(
    db: &DatabaseConnection,
    proxy: &str,
    kind: ProxyKind,
    status: ProxyStatus,
    from_vm: i32,
) -> proxy_pool::Model {
    let now = Utc::now();
    proxy_pool::ActiveModel {
        proxy: Set(proxy.to_string()),
        proxy_type: Set(kind),
        status: Set(status),
        from_vm: Set(from_vm),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("failed to insert test pool entry")
}

/// Insert an account project row.
pub async fn create_test_account_project(
    db: &DatabaseConnection,
    email: &str,
    project_id: &str,
    billing: BillingStatus,
    token: TokenStatus,
    official_token: &str,
) -> gcp_account::Model {
    let now = Utc::now();
    gcp_account::ActiveModel {
        email: Set(email.to_string()),
        project_id: Set(project_id.to_string()),
        billing_status: Set(billing),
        token_status: Set(token),
        vm_id: Set("gatcvm-server-test-0101120000".to_string()),
        proxy_hint: Set("http://203.0.113.10:1081/px".to_string()),
        official_token: Set(official_token.to_string()),
        official_token_id: Set(0),
        region: Set("us-central1".to_string()),
        auth_status: Set(AuthStatus::LoggedIn),
        auth_debug_info: Set(String::new()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("failed to insert test account project")
}

/// Insert an official token row routed through `base_url`.
pub async fn create_test_token(
    db: &DatabaseConnection,
    email: &str,
    project_id: &str,
    base_url: &str,
) -> official_token::Model {
    let now = Utc::now();
    official_token::ActiveModel {
        channel_id: Set(16),
        name: Set("gatc".to_string()),
        token: Set("AIzaTestToken".to_string()),
        base_url: Set(base_url.to_string()),
        status: Set(1),
        priority: Set(50),
        weight: Set(100),
        rpm_limit: Set(0),
        tpm_limit: Set(0),
        proxy: Set(String::new()),
        token_type: Set("static".to_string()),
        oauth2_config: Set(String::new()),
        runtime_token: Set(String::new()),
        email: Set(email.to_string()),
        project_id: Set(project_id.to_string()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("failed to insert test token")
}
