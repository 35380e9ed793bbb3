//! Proxy pool storage operations
//!
//! The pool is a projection: the authority on which proxies exist is the
//! vm_instances table. Rows here only record which proxies downstream
//! routers may currently select.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};

use crate::error::Result;
use crate::models::prelude::*;
use crate::models::proxy_pool::ProxyStatus;
use crate::models::vm_instance::ProxyKind;
use crate::state::DbConn;

/// Last `limit` entries of the given kind and status, newest first.
pub async fn last_batch_by_kind(
    db: &DbConn,
    kind: ProxyKind,
    status: ProxyStatus,
    limit: u64,
) -> Result<Vec<proxy_pool::Model>> {
    let rows = ProxyPool::find()
        .filter(proxy_pool::Column::ProxyType.eq(kind))
        .filter(proxy_pool::Column::Status.eq(status))
        .order_by_desc(proxy_pool::Column::CreatedAt)
        .limit(limit)
        .all(db)
        .await?;
    Ok(rows)
}

/// Insert a batch of new entries.
pub async fn batch_create(db: &DbConn, entries: Vec<proxy_pool::ActiveModel>) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    ProxyPool::insert_many(entries).exec(db).await?;
    Ok(())
}

/// Set the status of the given entries, bumping updated_at.
pub async fn batch_update_status(db: &DbConn, ids: &[i64], status: ProxyStatus) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let res = ProxyPool::update_many()
        .col_expr(proxy_pool::Column::Status, Expr::value(status))
        .col_expr(proxy_pool::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(proxy_pool::Column::Id.is_in(ids.to_vec()))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

/// Look one entry up by its canonical proxy address.
pub async fn get_by_proxy(db: &DbConn, proxy: &str) -> Result<Option<proxy_pool::Model>> {
    let row = ProxyPool::find()
        .filter(proxy_pool::Column::Proxy.eq(proxy))
        .one(db)
        .await?;
    Ok(row)
}

/// Every entry that was projected from a VM (`from_vm > 0`), regardless of
/// status except tombstones.
pub async fn list_from_vm(db: &DbConn) -> Result<Vec<proxy_pool::Model>> {
    let rows = ProxyPool::find()
        .filter(proxy_pool::Column::FromVm.gt(0))
        .filter(proxy_pool::Column::Status.ne(ProxyStatus::Deleted))
        .all(db)
        .await?;
    Ok(rows)
}

/// Build an Active entry projected from a VM, `proxy` already in canonical
/// form (no `/px` suffix).
pub fn new_from_vm_entry(proxy: &str, kind: ProxyKind) -> proxy_pool::ActiveModel {
    let now = Utc::now();
    proxy_pool::ActiveModel {
        proxy: Set(proxy.to_string()),
        proxy_type: Set(kind),
        status: Set(ProxyStatus::Active),
        from_vm: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
}

/// Insert a single entry (used by tests and manual seeding).
pub async fn create(db: &DbConn, entry: proxy_pool::ActiveModel) -> Result<proxy_pool::Model> {
    Ok(entry.insert(db).await?)
}
