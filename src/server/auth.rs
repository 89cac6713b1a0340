use async_trait::async_trait;
use log::{debug, info, warn};
use sqlx::Row;

use crate::common::errors::{ChatError, ChatResult};
use crate::common::models::Identity;
use crate::server::database::Database;

/// Resolves a bearer credential into the identity every authorization check trusts.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> ChatResult<Identity>;
}

/// Opaque session tokens issued by the external credential service, stored in `sessions`.
#[derive(Clone)]
pub struct SessionAuthenticator {
    db: Database,
}

impl SessionAuthenticator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

// Never log whole tokens
fn mask(token: &str) -> &str {
    token.get(..8).unwrap_or("<short>")
}

#[async_trait]
impl Authenticator for SessionAuthenticator {
    async fn authenticate(&self, token: &str) -> ChatResult<Identity> {
        let now = chrono::Utc::now().timestamp();
        let row = sqlx::query(
            "SELECT u.id, u.name FROM sessions s JOIN users u ON u.id = s.user_id
             WHERE s.session_token = ? AND s.expires_at > ?",
        )
        .bind(token)
        .bind(now)
        .fetch_optional(&self.db.pool)
        .await?;

        match row {
            Some(row) => {
                let identity = Identity { user_id: row.try_get("id")?, name: row.try_get("name")? };
                debug!("[AUTH] Token {}… valid for user {}", mask(token), identity.user_id);
                Ok(identity)
            }
            None => {
                warn!("[AUTH] Token {}… invalid or expired", mask(token));
                Err(ChatError::Unauthorized)
            }
        }
    }
}

/// Deletes expired sessions. Idempotent, run periodically by the server.
pub async fn cleanup_expired_sessions(db: &Database) {
    match delete_expired(db, chrono::Utc::now().timestamp()).await {
        Ok(removed) => info!("[AUTH] Cleaned up {} expired sessions", removed),
        Err(e) => warn!("[AUTH] Failed to cleanup sessions: {}", e),
    }
}

async fn delete_expired(db: &Database, now: i64) -> Result<u64, sqlx::Error> {
    let mut tx = db.begin_write().await?;
    let res = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected())
}
