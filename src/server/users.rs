// Identity directory: profiles and the persisted online flag
use log::info;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::common::errors::{ChatError, ChatResult, NOT_FOUND};
use crate::common::models::{now_millis, User, UserSummary};
use crate::common::validation::ProfileInput;
use crate::server::database::Database;

const USER_COLUMNS: &str = "id, name, email, avatar, is_online, created_at, updated_at";

fn row_to_user(row: &SqliteRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        avatar: row.try_get("avatar")?,
        is_online: row.try_get("is_online")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Directory entry creation, driven by the external registration flow.
pub async fn create_user(db: &Database, name: &str, email: &str) -> ChatResult<User> {
    let now = now_millis();
    let user = User {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        email: email.trim().to_lowercase(),
        avatar: String::new(),
        is_online: false,
        created_at: now,
        updated_at: now,
    };
    let mut tx = db.begin_write().await?;
    sqlx::query("INSERT INTO users (id, name, email, avatar, is_online, created_at, updated_at) VALUES (?, ?, ?, '', 0, ?, ?)")
        .bind(&user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!("[USERS] Created user {} <{}>", user.id, user.email);
    Ok(user)
}

pub async fn get_user(db: &Database, user_id: &str) -> ChatResult<User> {
    let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?
        .ok_or(ChatError::NotFound(NOT_FOUND))?;
    Ok(row_to_user(&row)?)
}

pub async fn find_by_email(db: &Database, email: &str) -> ChatResult<UserSummary> {
    let row = sqlx::query("SELECT id, name, avatar FROM users WHERE email = ?")
        .bind(email.trim().to_lowercase())
        .fetch_optional(&db.pool)
        .await?
        .ok_or(ChatError::NotFound(NOT_FOUND))?;
    Ok(UserSummary {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        avatar: row.try_get("avatar")?,
    })
}

/// Replaces name, email and avatar; a missing avatar resets it to empty.
pub async fn update_profile(db: &Database, user_id: &str, input: &ProfileInput) -> ChatResult<User> {
    let mut tx = db.begin_write().await?;
    let res = sqlx::query("UPDATE users SET name = ?, email = ?, avatar = ?, updated_at = ? WHERE id = ?")
        .bind(&input.name)
        .bind(&input.email)
        .bind(input.avatar.as_deref().unwrap_or(""))
        .bind(now_millis())
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ChatError::NotFound(NOT_FOUND));
    }
    tx.commit().await?;
    get_user(db, user_id).await
}

pub async fn set_online(db: &Database, user_id: &str, online: bool) -> ChatResult<()> {
    let mut tx = db.begin_write().await?;
    sqlx::query("UPDATE users SET is_online = ? WHERE id = ?")
        .bind(online)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}
