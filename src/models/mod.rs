pub mod gcp_account;
pub mod official_token;
pub mod proxy_pool;
pub mod vm_instance;

#[allow(unused_imports)]
pub mod prelude {
    pub use super::gcp_account::{self, Entity as GcpAccount};
    pub use super::official_token::{self, Entity as OfficialToken};
    pub use super::proxy_pool::{self, Entity as ProxyPool};
    pub use super::vm_instance::{self, Entity as VmInstance};
}
