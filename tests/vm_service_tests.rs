//! Tests for the DB-side VM controller operations.

mod common;
use common::{create_test_db, create_test_vm};

use gatc::models::vm_instance::{ProxyKind, VmStatus};
use gatc::services::vm::{
    get_active_vms, get_by_prefix, get_by_proxy, get_running_vms, list_vms, ListVmParam,
};

#[tokio::test]
async fn test_list_vms_paginates_newest_first() {
    let db = create_test_db().await;
    for i in 0..15 {
        create_test_vm(
            &db,
            &format!("gatcvm-server-p{:02}-0101", i),
            ProxyKind::HttpPath,
            VmStatus::Running,
            &format!("http://203.0.113.{}:1081/px", i + 1),
        )
        .await;
    }

    let page1 = list_vms(
        &db,
        &ListVmParam {
            page: Some(1),
            size: Some(10),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(page1.total, 15);
    assert_eq!(page1.items.len(), 10);

    let page2 = list_vms(
        &db,
        &ListVmParam {
            page: Some(2),
            size: Some(10),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(page2.items.len(), 5);
}

#[tokio::test]
async fn test_list_vms_caps_page_size() {
    let db = create_test_db().await;
    let result = list_vms(
        &db,
        &ListVmParam {
            size: Some(500),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    // Oversized requests fall back to the default page size.
    assert_eq!(result.size, 10);
}

#[tokio::test]
async fn test_get_by_prefix_excludes_deleted() {
    let db = create_test_db().await;
    create_test_vm(
        &db,
        "gatcvm-server-edge-0-0101",
        ProxyKind::HttpPath,
        VmStatus::Running,
        "http://203.0.113.1:1081/px",
    )
    .await;
    create_test_vm(
        &db,
        "gatcvm-server-edge-1-0101",
        ProxyKind::HttpPath,
        VmStatus::Deleted,
        "http://203.0.113.2:1081/px",
    )
    .await;
    create_test_vm(
        &db,
        "gatcvm-socks5-other-0101",
        ProxyKind::Socks5,
        VmStatus::Running,
        "u:p@203.0.113.3:1080",
    )
    .await;

    let vms = get_by_prefix(&db, "gatcvm-server-edge-", None).await.unwrap();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].vm_id, "gatcvm-server-edge-0-0101");
}

#[tokio::test]
async fn test_get_by_prefix_honors_limit() {
    let db = create_test_db().await;
    for i in 0..5 {
        create_test_vm(
            &db,
            &format!("gatcvm-server-lim-{}-0101", i),
            ProxyKind::HttpPath,
            VmStatus::Running,
            &format!("http://203.0.113.{}:1081/px", i + 1),
        )
        .await;
    }

    let vms = get_by_prefix(&db, "gatcvm-server-lim-", Some(2)).await.unwrap();
    assert_eq!(vms.len(), 2);
}

#[tokio::test]
async fn test_active_vs_running_sets() {
    let db = create_test_db().await;
    create_test_vm(
        &db,
        "gatcvm-server-run-0101",
        ProxyKind::HttpPath,
        VmStatus::Running,
        "http://203.0.113.1:1081/px",
    )
    .await;
    create_test_vm(
        &db,
        "gatcvm-server-pend-0101",
        ProxyKind::HttpPath,
        VmStatus::PendingDelete,
        "http://203.0.113.2:1081/px",
    )
    .await;
    create_test_vm(
        &db,
        "gatcvm-server-gone-0101",
        ProxyKind::HttpPath,
        VmStatus::Deleted,
        "http://203.0.113.3:1081/px",
    )
    .await;

    // Active excludes only Deleted; Running is strictly Running.
    let active = get_active_vms(&db).await.unwrap();
    assert_eq!(active.len(), 2);

    let running = get_running_vms(&db).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].vm_id, "gatcvm-server-run-0101");
}

#[tokio::test]
async fn test_get_by_proxy_resolves_vm() {
    let db = create_test_db().await;
    create_test_vm(
        &db,
        "gatcvm-server-a-0101",
        ProxyKind::HttpPath,
        VmStatus::Running,
        "http://203.0.113.1:1081/px",
    )
    .await;

    let found = get_by_proxy(&db, "http://203.0.113.1:1081/px").await.unwrap();
    assert_eq!(found.unwrap().vm_id, "gatcvm-server-a-0101");

    let missing = get_by_proxy(&db, "http://203.0.113.9:1081/px").await.unwrap();
    assert!(missing.is_none());
}
