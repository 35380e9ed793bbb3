use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::vm_instance::ProxyKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
pub enum ProxyStatus {
    #[sea_orm(num_value = 0)]
    Inactive,
    #[sea_orm(num_value = 1)]
    Active,
    #[sea_orm(num_value = 2)]
    Occupied,
    /// Terminal; rows are tombstoned rather than removed so the
    /// (proxy, status) unique index tolerates address reuse.
    #[sea_orm(num_value = 9)]
    Deleted,
}

/// Pool of routable proxies downstream routers may choose from.
///
/// For http-path entries `proxy` is the canonical form without the `/px`
/// suffix, e.g. `http://35.208.147.190:1081`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "proxy_pool")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub proxy: String,
    pub proxy_type: ProxyKind,
    pub status: ProxyStatus,
    /// Non-zero when the entry was projected from a running VM.
    pub from_vm: i32,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
