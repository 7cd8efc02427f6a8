//! Channel authorization boundary
//!
//! Whether a user may join a channel is decided by an external
//! collaborator. The relay calls through this trait before creating any
//! membership state; a rejection aborts the join with nothing to clean up.

use async_trait::async_trait;
use meshvoice_core::{ChannelId, Result, UserId};

/// Decides whether a user may join a voice channel.
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    /// Return `Ok(())` if the user may join, or `Error::Unauthorized`.
    async fn authorize(&self, channel_id: &ChannelId, user_id: &UserId) -> Result<()>;
}

/// Authorizer that admits everyone. Used in tests and single-tenant
/// deployments where membership checks happen upstream.
pub struct AllowAllAuthorizer;

#[async_trait]
impl ChannelAuthorizer for AllowAllAuthorizer {
    async fn authorize(&self, _channel_id: &ChannelId, _user_id: &UserId) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvoice_core::Error;

    struct DenyAll;

    #[async_trait]
    impl ChannelAuthorizer for DenyAll {
        async fn authorize(&self, channel_id: &ChannelId, _user_id: &UserId) -> Result<()> {
            Err(Error::Unauthorized(format!("not a member of {channel_id}")))
        }
    }

    #[tokio::test]
    async fn test_allow_all() {
        let auth = AllowAllAuthorizer;
        assert!(auth
            .authorize(&"c1".to_string(), &"alice".to_string())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_rejection_aborts_join() {
        let auth = DenyAll;
        let err = auth
            .authorize(&"c1".to_string(), &"alice".to_string())
            .await
            .unwrap_err();
        assert!(err.aborts_join());
    }
}
