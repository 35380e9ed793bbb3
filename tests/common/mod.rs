//! Shared fixtures for integration tests.

#[allow(unused_imports)]
pub use gatc::test_helpers::{
    create_test_account_project, create_test_db, create_test_pool_entry, create_test_token,
    create_test_vm,
};
