//! Tests for the proxy-pool convergence loop (Sync-From-VMs)
//!
//! The pool's from-VM rows must converge to exactly the set of Running
//! http-path VMs: stale rows are tombstoned, missing rows inserted, and a
//! second run with no cloud change is a no-op.

mod common;
use common::{create_test_db, create_test_pool_entry, create_test_vm};

use gatc::models::prelude::*;
use gatc::models::proxy_pool::ProxyStatus;
use gatc::models::vm_instance::{ProxyKind, VmStatus};
use gatc::services::vm::sync_proxy_pool_from_vms;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

#[tokio::test]
async fn test_sync_inserts_entry_for_running_http_path_vm() {
    let db = create_test_db().await;
    create_test_vm(
        &db,
        "gatcvm-server-a-0101120000",
        ProxyKind::HttpPath,
        VmStatus::Running,
        "http://203.0.113.10:1081/px",
    )
    .await;

    let res = sync_proxy_pool_from_vms(&db).await.unwrap();

    assert_eq!(res.add_proxy_count, 1);
    assert_eq!(res.del_proxies_count, 0);
    assert_eq!(res.add_proxies, vec!["http://203.0.113.10:1081".to_string()]);

    let entry = ProxyPool::find()
        .filter(gatc::models::proxy_pool::Column::Proxy.eq("http://203.0.113.10:1081"))
        .one(&db)
        .await
        .unwrap()
        .expect("pool entry must exist");
    assert_eq!(entry.status, ProxyStatus::Active);
    assert!(entry.from_vm > 0);
}

#[tokio::test]
async fn test_sync_tombstones_entry_without_backing_vm() {
    let db = create_test_db().await;
    let stale = create_test_pool_entry(
        &db,
        "http://203.0.113.99:1081",
        ProxyKind::HttpPath,
        ProxyStatus::Active,
        1,
    )
    .await;

    let res = sync_proxy_pool_from_vms(&db).await.unwrap();

    assert_eq!(res.del_proxies_count, 1);
    assert_eq!(res.del_proxies, vec![stale.id]);
    assert_eq!(res.add_proxy_count, 0);

    let reloaded = ProxyPool::find_by_id(stale.id)
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.status, ProxyStatus::Deleted);
}

#[tokio::test]
async fn test_sync_keeps_matching_entry() {
    let db = create_test_db().await;
    create_test_vm(
        &db,
        "gatcvm-server-a-0101120000",
        ProxyKind::HttpPath,
        VmStatus::Running,
        "http://203.0.113.10:1081/px",
    )
    .await;
    let matching = create_test_pool_entry(
        &db,
        "http://203.0.113.10:1081",
        ProxyKind::HttpPath,
        ProxyStatus::Active,
        1,
    )
    .await;

    let res = sync_proxy_pool_from_vms(&db).await.unwrap();
    assert_eq!(res.add_proxy_count, 0);
    assert_eq!(res.del_proxies_count, 0);

    let reloaded = ProxyPool::find_by_id(matching.id)
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.status, ProxyStatus::Active);
}

#[tokio::test]
async fn test_sync_ignores_non_http_path_vms() {
    let db = create_test_db().await;
    create_test_vm(
        &db,
        "gatcvm-socks5-a-0101120000",
        ProxyKind::Socks5,
        VmStatus::Running,
        "user:pass@203.0.113.10:1080",
    )
    .await;
    create_test_vm(
        &db,
        "gatcvm-tinyproxy-b-0101120000",
        ProxyKind::TinyProxy,
        VmStatus::Running,
        "http://203.0.113.11:8080",
    )
    .await;

    let res = sync_proxy_pool_from_vms(&db).await.unwrap();
    assert_eq!(res.add_proxy_count, 0);
    assert_eq!(res.del_proxies_count, 0);
}

#[tokio::test]
async fn test_sync_ignores_pending_delete_vms() {
    let db = create_test_db().await;
    create_test_vm(
        &db,
        "gatcvm-server-old-0101120000",
        ProxyKind::HttpPath,
        VmStatus::PendingDelete,
        "http://203.0.113.20:1081/px",
    )
    .await;
    let old_entry = create_test_pool_entry(
        &db,
        "http://203.0.113.20:1081",
        ProxyKind::HttpPath,
        ProxyStatus::Active,
        1,
    )
    .await;

    // A VM leaving Running means its pool row loses its backing.
    let res = sync_proxy_pool_from_vms(&db).await.unwrap();
    assert_eq!(res.del_proxies_count, 1);
    assert_eq!(res.del_proxies, vec![old_entry.id]);
}

#[tokio::test]
async fn test_sync_is_idempotent() {
    let db = create_test_db().await;
    create_test_vm(
        &db,
        "gatcvm-server-a-0101120000",
        ProxyKind::HttpPath,
        VmStatus::Running,
        "http://203.0.113.10:1081/px",
    )
    .await;
    create_test_pool_entry(
        &db,
        "http://203.0.113.98:1081",
        ProxyKind::HttpPath,
        ProxyStatus::Active,
        1,
    )
    .await;

    let first = sync_proxy_pool_from_vms(&db).await.unwrap();
    assert_eq!(first.add_proxy_count, 1);
    assert_eq!(first.del_proxies_count, 1);

    // No cloud change: the second run must be a no-op.
    let second = sync_proxy_pool_from_vms(&db).await.unwrap();
    assert_eq!(second.add_proxy_count, 0);
    assert_eq!(second.del_proxies_count, 0);
}

#[tokio::test]
async fn test_sync_rotation_scenario() {
    // Two old VMs rotate to PendingDelete while two replacements come up:
    // the pool ends with Active rows for the new pair and tombstones for
    // the old pair.
    let db = create_test_db().await;

    for (vm_id, ip, status) in [
        ("gatcvm-server-old-0-0101", "203.0.113.1", VmStatus::PendingDelete),
        ("gatcvm-server-old-1-0101", "203.0.113.2", VmStatus::PendingDelete),
        ("gatcvm-server-new-0-0102", "203.0.113.3", VmStatus::Running),
        ("gatcvm-server-new-1-0102", "203.0.113.4", VmStatus::Running),
    ] {
        create_test_vm(
            &db,
            vm_id,
            ProxyKind::HttpPath,
            status,
            &format!("http://{}:1081/px", ip),
        )
        .await;
    }
    for ip in ["203.0.113.1", "203.0.113.2"] {
        create_test_pool_entry(
            &db,
            &format!("http://{}:1081", ip),
            ProxyKind::HttpPath,
            ProxyStatus::Active,
            1,
        )
        .await;
    }

    let res = sync_proxy_pool_from_vms(&db).await.unwrap();
    assert_eq!(res.del_proxies_count, 2);
    assert_eq!(res.add_proxy_count, 2);

    let active = ProxyPool::find()
        .filter(gatc::models::proxy_pool::Column::Status.eq(ProxyStatus::Active))
        .all(&db)
        .await
        .unwrap();
    let mut active_proxies: Vec<String> = active.into_iter().map(|e| e.proxy).collect();
    active_proxies.sort();
    assert_eq!(
        active_proxies,
        vec![
            "http://203.0.113.3:1081".to_string(),
            "http://203.0.113.4:1081".to_string(),
        ]
    );
}
