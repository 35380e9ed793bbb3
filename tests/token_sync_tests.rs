//! Tests for the official_tokens sync step: the set difference between
//! bootstrapped projects and already-synced token rows.

mod common;
use common::{create_test_account_project, create_test_db, create_test_token};

use gatc::models::gcp_account::{BillingStatus, TokenStatus};
use gatc::models::prelude::*;
use gatc::services::bootstrap::{get_projects_by_email, sync_official_tokens};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

#[tokio::test]
async fn test_sync_inserts_row_for_tokenized_project() {
    let db = create_test_db().await;
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-1",
        BillingStatus::Bound,
        TokenStatus::Got,
        "AIzaNewKey",
    )
    .await;

    let synced = sync_official_tokens(&db, "a@x.com").await.unwrap();
    assert_eq!(synced, 1);

    let row = OfficialToken::find()
        .filter(gatc::models::official_token::Column::Email.eq("a@x.com"))
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.channel_id, 16);
    assert_eq!(row.name, "gatc");
    assert_eq!(row.token, "AIzaNewKey");
    assert_eq!(row.priority, 50);
    assert_eq!(row.weight, 100);
    assert_eq!(row.status, 1);
    assert_eq!(row.token_type, "static");
    assert_eq!(row.project_id, "proj-1");
    assert_eq!(row.proxy, "http://203.0.113.10:1081/px");
}

#[tokio::test]
async fn test_sync_records_back_link_on_account_row() {
    let db = create_test_db().await;
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-1",
        BillingStatus::Bound,
        TokenStatus::Got,
        "AIzaNewKey",
    )
    .await;

    sync_official_tokens(&db, "a@x.com").await.unwrap();

    let token = OfficialToken::find().one(&db).await.unwrap().unwrap();
    let project = &get_projects_by_email(&db, "a@x.com").await.unwrap()[0];
    assert_eq!(project.official_token_id, token.id);
}

#[tokio::test]
async fn test_sync_skips_projects_already_present() {
    let db = create_test_db().await;
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-1",
        BillingStatus::Bound,
        TokenStatus::Got,
        "AIzaKey1",
    )
    .await;
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-2",
        BillingStatus::Bound,
        TokenStatus::Got,
        "AIzaKey2",
    )
    .await;
    create_test_token(&db, "a@x.com", "proj-1", "http://203.0.113.1:1081/px").await;

    let synced = sync_official_tokens(&db, "a@x.com").await.unwrap();
    assert_eq!(synced, 1);

    let rows = OfficialToken::find()
        .filter(gatc::models::official_token::Column::Email.eq("a@x.com"))
        .all(&db)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_sync_ignores_unbound_and_tokenless_projects() {
    let db = create_test_db().await;
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-unbound",
        BillingStatus::Unbound,
        TokenStatus::Got,
        "AIzaKey",
    )
    .await;
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-no-token",
        BillingStatus::Bound,
        TokenStatus::None,
        "",
    )
    .await;
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-fail",
        BillingStatus::Bound,
        TokenStatus::CreateFail,
        "",
    )
    .await;

    let synced = sync_official_tokens(&db, "a@x.com").await.unwrap();
    assert_eq!(synced, 0);
    assert_eq!(OfficialToken::find().all(&db).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_sync_twice_is_noop() {
    let db = create_test_db().await;
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-1",
        BillingStatus::Bound,
        TokenStatus::Got,
        "AIzaKey",
    )
    .await;

    assert_eq!(sync_official_tokens(&db, "a@x.com").await.unwrap(), 1);
    assert_eq!(sync_official_tokens(&db, "a@x.com").await.unwrap(), 0);
    assert_eq!(OfficialToken::find().all(&db).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sync_scoped_to_email() {
    let db = create_test_db().await;
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-1",
        BillingStatus::Bound,
        TokenStatus::Got,
        "AIzaKeyA",
    )
    .await;
    create_test_account_project(
        &db,
        "b@x.com",
        "proj-1",
        BillingStatus::Bound,
        TokenStatus::Got,
        "AIzaKeyB",
    )
    .await;

    assert_eq!(sync_official_tokens(&db, "a@x.com").await.unwrap(), 1);

    let rows = OfficialToken::find().all(&db).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].email, "a@x.com");
}
