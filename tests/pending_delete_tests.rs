//! Tests for the PendingDelete retention query and batch status updates.

mod common;
use common::{create_test_db, create_test_vm};

use chrono::{Duration, Utc};
use gatc::models::prelude::*;
use gatc::models::vm_instance::{ProxyKind, VmStatus};
use gatc::services::vm::{batch_update_status, get_pending_delete_before, update_status};
use sea_orm::{ActiveModelTrait, EntityTrait, Set};

#[tokio::test]
async fn test_retention_query_only_returns_aged_pending_delete() {
    let db = create_test_db().await;

    let fresh = create_test_vm(
        &db,
        "gatcvm-server-fresh-0101",
        ProxyKind::HttpPath,
        VmStatus::PendingDelete,
        "http://203.0.113.1:1081/px",
    )
    .await;
    let aged = create_test_vm(
        &db,
        "gatcvm-server-aged-0101",
        ProxyKind::HttpPath,
        VmStatus::PendingDelete,
        "http://203.0.113.2:1081/px",
    )
    .await;
    create_test_vm(
        &db,
        "gatcvm-server-live-0101",
        ProxyKind::HttpPath,
        VmStatus::Running,
        "http://203.0.113.3:1081/px",
    )
    .await;

    // Age one row past the retention horizon.
    let mut am: gatc::models::vm_instance::ActiveModel = aged.clone().into();
    am.updated_at = Set(Utc::now() - Duration::hours(2));
    am.update(&db).await.unwrap();

    let cutoff = Utc::now() - Duration::hours(1);
    let due = get_pending_delete_before(&db, cutoff).await.unwrap();

    assert_eq!(due.len(), 1);
    assert_eq!(due[0].vm_id, aged.vm_id);
    assert_ne!(due[0].vm_id, fresh.vm_id);
}

#[tokio::test]
async fn test_batch_update_status_marks_pending_delete_and_bumps_updated_at() {
    let db = create_test_db().await;
    let before = Utc::now() - Duration::seconds(5);

    for i in 0..2 {
        let vm = create_test_vm(
            &db,
            &format!("gatcvm-server-x{}-0101", i),
            ProxyKind::HttpPath,
            VmStatus::Running,
            &format!("http://203.0.113.{}:1081/px", i + 10),
        )
        .await;
        let mut am: gatc::models::vm_instance::ActiveModel = vm.into();
        am.updated_at = Set(before);
        am.update(&db).await.unwrap();
    }

    let ids = vec![
        "gatcvm-server-x0-0101".to_string(),
        "gatcvm-server-x1-0101".to_string(),
    ];
    let affected = batch_update_status(&db, &ids, VmStatus::PendingDelete)
        .await
        .unwrap();
    assert_eq!(affected, 2);

    for id in &ids {
        let vm = gatc::services::vm::get_by_vm_id(&db, id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vm.status, VmStatus::PendingDelete);
        // Entering PendingDelete stamps the moment the retention clock
        // starts from.
        assert!(vm.updated_at > before);
    }
}

#[tokio::test]
async fn test_batch_update_status_empty_list_is_noop() {
    let db = create_test_db().await;
    let affected = batch_update_status(&db, &[], VmStatus::Deleted).await.unwrap();
    assert_eq!(affected, 0);
}

#[tokio::test]
async fn test_update_status_soft_delete() {
    let db = create_test_db().await;
    create_test_vm(
        &db,
        "gatcvm-socks5-z-0101",
        ProxyKind::Socks5,
        VmStatus::Running,
        "u:p@203.0.113.5:1080",
    )
    .await;

    update_status(&db, "gatcvm-socks5-z-0101", VmStatus::Deleted)
        .await
        .unwrap();

    let vm = VmInstance::find()
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(vm.status, VmStatus::Deleted);
}
