use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Billing binding state of one upstream project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
pub enum BillingStatus {
    #[sea_orm(num_value = 0)]
    Unbound,
    #[sea_orm(num_value = 1)]
    Bound,
    /// Was bound once, then detached on request.
    #[sea_orm(num_value = 2)]
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
pub enum TokenStatus {
    #[sea_orm(num_value = 0)]
    None,
    #[sea_orm(num_value = 1)]
    CreateFail,
    #[sea_orm(num_value = 2)]
    Got,
    /// Flipped externally when a downstream gateway reports the key dead.
    #[sea_orm(num_value = 3)]
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
pub enum AuthStatus {
    #[sea_orm(num_value = 0)]
    NotLogin,
    #[sea_orm(num_value = 1)]
    LoggedIn,
    #[sea_orm(num_value = 2)]
    LoginFailed,
    #[sea_orm(num_value = 3)]
    VmError,
}

/// One row per (email, project). The row with an empty `project_id` is the
/// session record: the durable handle to the email's last-known VM and
/// auth status.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "gcp_accounts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub email: String,
    pub project_id: String,
    pub billing_status: BillingStatus,
    pub token_status: TokenStatus,
    /// VM the account is logged in on.
    pub vm_id: String,
    /// The VM's proxy address copied onto the account row, later stamped
    /// into issued token rows as their routing hint.
    pub proxy_hint: String,
    #[sea_orm(column_type = "Text")]
    pub official_token: String,
    /// Back-link to the official_tokens row once issued.
    pub official_token_id: i64,
    pub region: String,
    pub auth_status: AuthStatus,
    #[sea_orm(column_type = "Text")]
    pub auth_debug_info: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
