use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A dispatchable upstream credential with its routing metadata.
///
/// `base_url` encodes the data-plane route (e.g. `http://IP:1081/px`) and is
/// rewritten atomically during proxy replacement.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "official_tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub channel_id: i64,
    pub name: String,
    #[sea_orm(column_type = "Text")]
    pub token: String,
    pub base_url: String,
    /// 1 = selectable by downstream gateways.
    pub status: i32,
    pub priority: i32,
    pub weight: i32,
    pub rpm_limit: i64,
    pub tpm_limit: i64,
    /// Extra proxy hint, e.g. a socks5 address on the issuing VM.
    pub proxy: String,
    /// "static" or "oauth2".
    pub token_type: String,
    #[sea_orm(column_type = "Text")]
    pub oauth2_config: String,
    #[sea_orm(column_type = "Text")]
    pub runtime_token: String,
    pub email: String,
    pub project_id: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
