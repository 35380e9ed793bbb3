//! Tests for the account session record, token invalidation, and stale-VM
//! cleanup paths.

mod common;
use common::{create_test_account_project, create_test_db, create_test_vm};

use gatc::models::gcp_account::{AuthStatus, BillingStatus, TokenStatus};
use gatc::models::vm_instance::{ProxyKind, VmStatus};
use gatc::services::account::{
    clean_account_vm_id_tag, get_account_status, update_account_vm_info, upsert_account_status,
};
use gatc::services::bootstrap::{
    emails_with_unbound_projects, get_projects_by_email, set_token_invalid_by_email_project,
    set_token_invalid_by_id,
};

#[tokio::test]
async fn test_upsert_creates_session_record_once() {
    let db = create_test_db().await;

    upsert_account_status(&db, "a@x.com", "gatcvm-1", AuthStatus::LoggedIn, "ok")
        .await
        .unwrap();
    let first = get_account_status(&db, "a@x.com").await.unwrap().unwrap();
    assert_eq!(first.project_id, "");
    assert_eq!(first.auth_status, AuthStatus::LoggedIn);
    assert_eq!(first.vm_id, "gatcvm-1");

    // Updating keeps the single session row, it does not add another.
    upsert_account_status(&db, "a@x.com", "gatcvm-2", AuthStatus::NotLogin, "again")
        .await
        .unwrap();
    let second = get_account_status(&db, "a@x.com").await.unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.vm_id, "gatcvm-2");
    assert_eq!(second.auth_status, AuthStatus::NotLogin);
}

#[tokio::test]
async fn test_session_record_is_separate_from_project_rows() {
    let db = create_test_db().await;
    upsert_account_status(&db, "a@x.com", "gatcvm-1", AuthStatus::LoggedIn, "")
        .await
        .unwrap();
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-1",
        BillingStatus::Unbound,
        TokenStatus::None,
        "",
    )
    .await;

    let projects = get_projects_by_email(&db, "a@x.com").await.unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].project_id, "proj-1");
}

#[tokio::test]
async fn test_update_account_vm_info_rewrites_all_rows() {
    let db = create_test_db().await;
    upsert_account_status(&db, "a@x.com", "gatcvm-old", AuthStatus::LoggedIn, "")
        .await
        .unwrap();
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-1",
        BillingStatus::Bound,
        TokenStatus::Got,
        "AIzaX",
    )
    .await;
    let new_vm = create_test_vm(
        &db,
        "gatcvm-server-new-0101",
        ProxyKind::HttpPath,
        VmStatus::Running,
        "http://203.0.113.9:1081/px",
    )
    .await;

    let affected = update_account_vm_info(&db, "a@x.com", &new_vm).await.unwrap();
    assert_eq!(affected, 2);

    for row in get_projects_by_email(&db, "a@x.com").await.unwrap() {
        assert_eq!(row.vm_id, "gatcvm-server-new-0101");
        assert_eq!(row.proxy_hint, "http://203.0.113.9:1081/px");
    }
}

#[tokio::test]
async fn test_clean_account_vm_id_tag() {
    let db = create_test_db().await;
    create_test_vm(
        &db,
        "gatcvm-server-stale-0101",
        ProxyKind::HttpPath,
        VmStatus::Running,
        "http://203.0.113.7:1081/px",
    )
    .await;
    upsert_account_status(
        &db,
        "a@x.com",
        "gatcvm-server-stale-0101",
        AuthStatus::LoggedIn,
        "",
    )
    .await
    .unwrap();

    clean_account_vm_id_tag(&db, "gatcvm-server-stale-0101")
        .await
        .unwrap();

    let vm = gatc::services::vm::get_by_vm_id(&db, "gatcvm-server-stale-0101")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(vm.status, VmStatus::Deleted);

    let account = get_account_status(&db, "a@x.com").await.unwrap().unwrap();
    assert_eq!(account.vm_id, "");
}

#[tokio::test]
async fn test_set_token_invalid_by_id() {
    let db = create_test_db().await;
    let row = create_test_account_project(
        &db,
        "a@x.com",
        "proj-1",
        BillingStatus::Bound,
        TokenStatus::Got,
        "AIzaX",
    )
    .await;

    set_token_invalid_by_id(&db, row.id).await.unwrap();

    let projects = get_projects_by_email(&db, "a@x.com").await.unwrap();
    assert_eq!(projects[0].token_status, TokenStatus::Invalid);
}

#[tokio::test]
async fn test_set_token_invalid_by_email_and_project() {
    let db = create_test_db().await;
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-1",
        BillingStatus::Bound,
        TokenStatus::Got,
        "AIzaX",
    )
    .await;
    create_test_account_project(
        &db,
        "a@x.com",
        "proj-2",
        BillingStatus::Bound,
        TokenStatus::Got,
        "AIzaY",
    )
    .await;

    set_token_invalid_by_email_project(&db, "a@x.com", "proj-2")
        .await
        .unwrap();

    let projects = get_projects_by_email(&db, "a@x.com").await.unwrap();
    let proj1 = projects.iter().find(|p| p.project_id == "proj-1").unwrap();
    let proj2 = projects.iter().find(|p| p.project_id == "proj-2").unwrap();
    assert_eq!(proj1.token_status, TokenStatus::Got);
    assert_eq!(proj2.token_status, TokenStatus::Invalid);
}

#[tokio::test]
async fn test_emails_with_unbound_projects() {
    let db = create_test_db().await;
    create_test_account_project(
        &db,
        "unbound@x.com",
        "proj-1",
        BillingStatus::Unbound,
        TokenStatus::None,
        "",
    )
    .await;
    create_test_account_project(
        &db,
        "bound@x.com",
        "proj-2",
        BillingStatus::Bound,
        TokenStatus::Got,
        "AIzaX",
    )
    .await;
    // A session record with Unbound billing must not count: it is not a
    // project.
    upsert_account_status(&db, "session-only@x.com", "gatcvm-1", AuthStatus::LoggedIn, "")
        .await
        .unwrap();

    let emails = emails_with_unbound_projects(&db).await.unwrap();
    assert_eq!(emails, vec!["unbound@x.com".to_string()]);
}
