use std::sync::Arc;

use session_auth::{TokenError, TokenIssuer, TokenKind};
use tracing::{debug, info};

use crate::{
    connection::Identity,
    error::{persistence, RealtimeError},
    store::ChatStore,
};

/// Resolves the bearer credential presented when a connection opens.
pub struct SessionAuthenticator {
    tokens: TokenIssuer,
    store: Arc<dyn ChatStore>,
}

impl SessionAuthenticator {
    pub fn new(tokens: TokenIssuer, store: Arc<dyn ChatStore>) -> Self {
        Self { tokens, store }
    }

    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity, RealtimeError> {
        let token = credential
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(RealtimeError::Unauthenticated)?;

        let session = self
            .tokens
            .verify(token, TokenKind::Access)
            .map_err(|err| {
                debug!(error = %err, "rejected connection credential");
                match err {
                    TokenError::Malformed => RealtimeError::Unauthenticated,
                    other => RealtimeError::InvalidCredential(other.to_string()),
                }
            })?;

        let account = self
            .store
            .account(session.user_id)
            .await
            .map_err(persistence)?;
        match account {
            Some(account) if !account.disabled => {
                info!(user_id = account.user_id.0, "connection authenticated");
                Ok(Identity {
                    user_id: account.user_id,
                    display_name: account.display_name,
                })
            }
            _ => Err(RealtimeError::AccountUnavailable),
        }
    }
}
