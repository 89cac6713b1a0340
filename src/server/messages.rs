use log::{debug, info};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::common::errors::{ChatError, ChatResult, GROUP_NOT_FOUND, NOT_FOUND, NOT_MEMBER};
use crate::common::models::{
    now_millis, LastMessage, Message, MessageId, MessageKind, MessageWithSender, Page, UserSummary,
};
use crate::common::validation::{self, MessageInput, Pagination};
use crate::server::database::Database;
use crate::server::groups;

const MESSAGE_COLUMNS: &str = "m.id, m.group_id, m.sender_id, m.content, m.kind, m.file_name, m.created_at, m.updated_at,
    (SELECT group_concat(r.user_id) FROM message_reads r WHERE r.message_id = m.id) AS read_by";

/// Outcome of a delete, including the group's projection if it had to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDeletion {
    pub message: Message,
    pub last_message_changed: bool,
    pub last_message: Option<LastMessage>,
}

pub(crate) fn split_ids(raw: Option<String>) -> Vec<String> {
    let mut ids: Vec<String> = raw
        .map(|s| s.split(',').filter(|id| !id.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    ids.sort();
    ids
}

fn row_to_message(row: &SqliteRow) -> Result<Message, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    Ok(Message {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        sender_id: row.try_get("sender_id")?,
        content: row.try_get("content")?,
        kind: MessageKind::parse(&kind)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown message kind '{}'", kind).into()))?,
        file_name: row.try_get("file_name")?,
        read_by: split_ids(row.try_get("read_by")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) async fn fetch_message(conn: &mut SqliteConnection, message_id: MessageId) -> ChatResult<Option<Message>> {
    let row = sqlx::query(&format!("SELECT {} FROM messages m WHERE m.id = ?", MESSAGE_COLUMNS))
        .bind(message_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(row_to_message).transpose()?)
}

/// Appends a message and moves the group's last-message projection onto it.
///
/// Must run inside the caller's write transaction: the message row, the sender's read
/// receipt and the projection land together or not at all.
pub(crate) async fn insert_message(
    conn: &mut SqliteConnection,
    group_id: &str,
    sender_id: &str,
    input: &MessageInput,
    now: i64,
) -> ChatResult<(Message, LastMessage)> {
    let res = sqlx::query(
        "INSERT INTO messages (group_id, sender_id, content, kind, file_name, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(group_id)
    .bind(sender_id)
    .bind(&input.content)
    .bind(input.kind.as_str())
    .bind(&input.file_name)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    let message_id = res.last_insert_rowid();

    sqlx::query("INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?)")
        .bind(message_id)
        .bind(sender_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    let updated = sqlx::query(
        "UPDATE groups SET last_message_id = ?, last_sender_id = ?, last_sent_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(message_id)
    .bind(sender_id)
    .bind(now)
    .bind(now)
    .bind(group_id)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(ChatError::NotFound(GROUP_NOT_FOUND));
    }

    let message = Message {
        id: message_id,
        group_id: group_id.to_string(),
        sender_id: sender_id.to_string(),
        content: input.content.clone(),
        kind: input.kind,
        file_name: input.file_name.clone(),
        read_by: vec![sender_id.to_string()],
        created_at: now,
        updated_at: now,
    };
    let last = LastMessage { message_id, sender_id: sender_id.to_string(), sent_at: now };
    Ok((message, last))
}

async fn require_member(conn: &mut SqliteConnection, group_id: &str, user_id: &str) -> ChatResult<()> {
    groups::fetch_group(conn, group_id).await?;
    if !groups::is_member(conn, group_id, user_id).await? {
        return Err(ChatError::Forbidden(NOT_MEMBER));
    }
    Ok(())
}

pub async fn append_message(
    db: &Database,
    sender_id: &str,
    group_id: &str,
    content: &str,
    kind: Option<MessageKind>,
    file_name: Option<&str>,
) -> ChatResult<(Message, LastMessage)> {
    let input = validation::message_content(content, kind, file_name)?;
    let mut tx = db.begin_write().await?;
    require_member(&mut tx, group_id, sender_id).await?;
    let (message, last) = insert_message(&mut tx, group_id, sender_id, &input, now_millis()).await?;
    tx.commit().await?;
    debug!("[MSG] Message {} appended to group {} by {}", message.id, group_id, sender_id);
    Ok((message, last))
}

/// Sender-only edit. Anyone else gets `NotFound`, same as for a missing message.
pub async fn edit_message(db: &Database, sender_id: &str, message_id: MessageId, content: &str) -> ChatResult<Message> {
    let content = validation::edited_content(content)?;
    let mut tx = db.begin_write().await?;
    let res = sqlx::query("UPDATE messages SET content = ?, updated_at = ? WHERE id = ? AND sender_id = ?")
        .bind(&content)
        .bind(now_millis())
        .bind(message_id)
        .bind(sender_id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ChatError::NotFound(NOT_FOUND));
    }
    let message = fetch_message(&mut tx, message_id).await?.ok_or(ChatError::NotFound(NOT_FOUND))?;
    tx.commit().await?;
    Ok(message)
}

/// Sender-only hard delete.
///
/// When the message was the group's last one, the projection moves back to the newest
/// remaining message, or is cleared if the group has none left.
pub async fn delete_message(db: &Database, sender_id: &str, message_id: MessageId) -> ChatResult<MessageDeletion> {
    let mut tx = db.begin_write().await?;
    let message = match fetch_message(&mut tx, message_id).await? {
        Some(m) if m.sender_id == sender_id => m,
        _ => return Err(ChatError::NotFound(NOT_FOUND)),
    };

    sqlx::query("DELETE FROM message_reads WHERE message_id = ?")
        .bind(message_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM messages WHERE id = ?")
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

    let current: Option<i64> = sqlx::query_scalar("SELECT last_message_id FROM groups WHERE id = ?")
        .bind(&message.group_id)
        .fetch_optional(&mut *tx)
        .await?
        .flatten();

    let mut deletion = MessageDeletion { message, last_message_changed: false, last_message: None };
    if current == Some(message_id) {
        let prior = sqlx::query("SELECT id, sender_id, created_at FROM messages WHERE group_id = ? ORDER BY id DESC LIMIT 1")
            .bind(&deletion.message.group_id)
            .fetch_optional(&mut *tx)
            .await?;
        let last = match prior {
            Some(row) => Some(LastMessage {
                message_id: row.try_get("id")?,
                sender_id: row.try_get("sender_id")?,
                sent_at: row.try_get("created_at")?,
            }),
            None => None,
        };
        sqlx::query("UPDATE groups SET last_message_id = ?, last_sender_id = ?, last_sent_at = ? WHERE id = ?")
            .bind(last.as_ref().map(|l| l.message_id))
            .bind(last.as_ref().map(|l| l.sender_id.clone()))
            .bind(last.as_ref().map(|l| l.sent_at))
            .bind(&deletion.message.group_id)
            .execute(&mut *tx)
            .await?;
        deletion.last_message_changed = true;
        deletion.last_message = last;
    }

    tx.commit().await?;
    info!("[MSG] Message {} deleted from group {}", message_id, deletion.message.group_id);
    Ok(deletion)
}

/// Adds the reader to every message of the group written by someone else. Idempotent.
pub async fn mark_read(db: &Database, user_id: &str, group_id: &str) -> ChatResult<u64> {
    let mut tx = db.begin_write().await?;
    require_member(&mut tx, group_id, user_id).await?;
    let res = sqlx::query(
        "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
         SELECT id, ?, ? FROM messages WHERE group_id = ? AND sender_id != ?",
    )
    .bind(user_id)
    .bind(now_millis())
    .bind(group_id)
    .bind(user_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(res.rows_affected())
}

/// Newest first.
pub async fn list_messages(db: &Database, user_id: &str, group_id: &str, page: Pagination) -> ChatResult<Page<MessageWithSender>> {
    let mut conn = db.pool.acquire().await?;
    require_member(&mut conn, group_id, user_id).await?;

    let rows = sqlx::query(&format!(
        "SELECT {}, COALESCE(u.name, '') AS sender_name, COALESCE(u.avatar, '') AS sender_avatar
         FROM messages m LEFT JOIN users u ON u.id = m.sender_id
         WHERE m.group_id = ? ORDER BY m.id DESC LIMIT ? OFFSET ?",
        MESSAGE_COLUMNS
    ))
    .bind(group_id)
    .bind(page.limit as i64)
    .bind(page.offset())
    .fetch_all(&mut *conn)
    .await?;

    let mut data = Vec::with_capacity(rows.len());
    for row in rows.iter() {
        let message = row_to_message(row)?;
        let sender = UserSummary {
            id: message.sender_id.clone(),
            name: row.try_get("sender_name")?,
            avatar: row.try_get("sender_avatar")?,
        };
        data.push(MessageWithSender { message, sender });
    }

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE group_id = ?")
        .bind(group_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(Page { data, total, current_page: page.page })
}

pub async fn get_message(db: &Database, message_id: MessageId) -> ChatResult<Message> {
    let mut conn = db.pool.acquire().await?;
    fetch_message(&mut conn, message_id).await?.ok_or(ChatError::NotFound(NOT_FOUND))
}
