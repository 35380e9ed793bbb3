use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;

use crate::services::gcp::GcloudClient;
use crate::services::login_session::AuthSessionCache;
use crate::services::ratelimit::EmailRateLimiter;

/// Database connection type alias
pub type DbConn = DatabaseConnection;

/// Minimum interval between project-process runs for one email.
pub const PROJECT_PROCESS_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Application state containing all shared resources
#[derive(Clone)]
pub struct AppState {
    pub db: DbConn,
    pub gcp: Arc<GcloudClient>,
    pub sessions: Arc<AuthSessionCache>,
    pub email_limiter: Arc<EmailRateLimiter>,
}

impl AppState {
    pub fn new(db: DbConn, gcp: Arc<GcloudClient>) -> Self {
        Self {
            db,
            gcp,
            sessions: Arc::new(AuthSessionCache::new()),
            email_limiter: Arc::new(EmailRateLimiter::new(PROJECT_PROCESS_INTERVAL)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::create_test_db;

    #[tokio::test]
    async fn test_app_state_clone_shares_resources() {
        let db = create_test_db().await;
        let state1 = AppState::new(db, Arc::new(GcloudClient::from_config()));
        let state2 = state1.clone();

        assert!(Arc::ptr_eq(&state1.sessions, &state2.sessions));
        assert!(Arc::ptr_eq(&state1.email_limiter, &state2.email_limiter));
    }
}
