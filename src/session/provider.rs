//! Session provider boundary.
//!
//! The remote browser service is an external collaborator; the pool only
//! talks to it through [`SessionProvider`].

use async_trait::async_trait;

use super::model::{SessionConfig, SessionHandle};
use crate::error::ProviderError;

/// Creates and closes remote browser sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Starts a new remote session.
    async fn create_session(&self, config: &SessionConfig) -> Result<SessionHandle, ProviderError>;

    /// Terminates a remote session.
    async fn close_session(&self, handle: &SessionHandle) -> Result<(), ProviderError>;

    /// Liveness ping used by health checks.
    async fn is_alive(&self, _handle: &SessionHandle) -> bool {
        true
    }
}
