pub mod batch;
pub mod config;
pub mod forward;

pub use config::{BatchConfig, ProxyConfig};
pub use forward::ProxyServer;
