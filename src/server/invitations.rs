// Email invitations: issued by a group creator, redeemed by the user owning that address
use log::info;
use sqlx::Row;

use crate::common::errors::{ChatError, ChatResult, NOT_CREATOR, NOT_FOUND};
use crate::common::models::{now_millis, GroupId, Invitation};
use crate::common::validation;
use crate::server::database::Database;
use crate::server::groups;

/// Creator-only. Records the invitation; sending the email is the caller's business.
pub async fn invite_member(db: &Database, actor_id: &str, group_id: &str, email: &str) -> ChatResult<Invitation> {
    let receiver_email = validation::email(email)?;
    let mut tx = db.begin_write().await?;
    let group = groups::fetch_group(&mut tx, group_id).await?;
    if group.creator_id != actor_id {
        return Err(ChatError::Forbidden(NOT_CREATOR));
    }

    let invitation = Invitation {
        id: uuid::Uuid::new_v4().to_string(),
        group_id: group.id,
        receiver_email,
        invited_by: actor_id.to_string(),
        created_at: now_millis(),
    };
    sqlx::query("INSERT INTO invitations (id, group_id, receiver_email, invited_by, created_at) VALUES (?, ?, ?, ?, ?)")
        .bind(&invitation.id)
        .bind(&invitation.group_id)
        .bind(&invitation.receiver_email)
        .bind(&invitation.invited_by)
        .bind(invitation.created_at)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!("[INVITE] {} invited {} to group {}", actor_id, invitation.receiver_email, invitation.group_id);
    Ok(invitation)
}

/// Joins the invited group and consumes the invitation. Returns the group and whether a
/// membership was actually created (accepting while already a member is a no-op join).
pub async fn accept_invitation(db: &Database, user_id: &str, invitation_id: &str) -> ChatResult<(GroupId, bool)> {
    let mut tx = db.begin_write().await?;
    let row = sqlx::query(
        "SELECT i.group_id FROM invitations i JOIN users u ON u.email = i.receiver_email
         WHERE i.id = ? AND u.id = ?",
    )
    .bind(invitation_id)
    .bind(user_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(ChatError::NotFound(NOT_FOUND))?;
    let group_id: String = row.try_get("group_id")?;

    // the group may have been deleted since; fetch_group reports that
    groups::fetch_group(&mut tx, &group_id).await?;
    let joined = groups::insert_member(&mut tx, &group_id, user_id, None, now_millis()).await?;
    sqlx::query("DELETE FROM invitations WHERE id = ?")
        .bind(invitation_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!("[INVITE] {} accepted invitation {} to group {}", user_id, invitation_id, group_id);
    Ok((group_id, joined))
}
