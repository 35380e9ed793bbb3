use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// VM lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
pub enum VmStatus {
    #[sea_orm(num_value = 1)]
    Running,
    #[sea_orm(num_value = 2)]
    Stopped,
    #[sea_orm(num_value = 3)]
    Deleted,
    /// Marked for destruction; a background reconciler deletes it after the
    /// retention horizon.
    #[sea_orm(num_value = 4)]
    PendingDelete,
}

/// Listener contract running on a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ProxyKind {
    /// SOCKS5 on tcp/1080, credentials provisioned via VM metadata.
    #[sea_orm(string_value = "socks5")]
    #[serde(rename = "socks5")]
    Socks5,
    /// Unauthenticated HTTP CONNECT proxy on tcp/8080.
    #[sea_orm(string_value = "tinyproxy")]
    #[serde(rename = "tinyproxy")]
    TinyProxy,
    /// Path-prefix proxy (`/px/<url>`) on tcp/1081. Wire aliases `server`
    /// and `httpProxyServer` collapse to this variant at the boundary.
    #[sea_orm(string_value = "server")]
    #[serde(rename = "server")]
    HttpPath,
}

impl ProxyKind {
    /// Parse a wire value, collapsing the historical aliases.
    pub fn parse(s: &str) -> Option<ProxyKind> {
        match s {
            "socks5" => Some(ProxyKind::Socks5),
            "tinyproxy" => Some(ProxyKind::TinyProxy),
            "server" | "httpProxyServer" => Some(ProxyKind::HttpPath),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyKind::Socks5 => write!(f, "socks5"),
            ProxyKind::TinyProxy => write!(f, "tinyproxy"),
            ProxyKind::HttpPath => write!(f, "server"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vm_instances")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Provider-assigned instance name, globally unique.
    #[sea_orm(unique)]
    pub vm_id: String,
    pub vm_name: String,
    pub zone: String,
    pub machine_type: String,
    pub external_ip: String,
    pub internal_ip: String,
    /// Routable proxy address. Format depends on kind:
    /// socks5 `user:pass@ip:1080`, tinyproxy `http://ip:8080`,
    /// http-path `http://ip:1081/px` (the `/px` suffix is significant).
    pub proxy: String,
    pub proxy_type: ProxyKind,
    pub ssh_user: String,
    #[sea_orm(column_type = "Text")]
    #[serde(skip_serializing)]
    pub ssh_key_content: String,
    pub status: VmStatus,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
