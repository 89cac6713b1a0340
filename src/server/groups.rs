//! Membership coordinator.
//!
//! Every operation that touches membership, the member counter, join requests or the
//! last-message projection runs inside one write transaction (`Database::begin_write`).
//! Conditional predicates ("not already a member", "request pending") are evaluated by the
//! same statements that perform the change, so concurrent callers cannot double-apply them.

use log::{info, warn};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::common::errors::{
    ChatError, ChatResult, CREATOR_CANNOT_LEAVE, GROUP_NOT_FOUND, NOT_CREATOR, NOT_FOUND, NOT_MEMBER,
};
use crate::common::models::{
    now_millis, Group, GroupListing, JoinRequest, LastMessage, LastMessagePreview, Member, MessageKind,
    Page, UserId, UserSummary,
};
use crate::common::validation::{self, MessageInput, Pagination};
use crate::server::database::Database;
use crate::server::messages;

const GROUP_COLUMNS: &str = "id, name, description, image, creator_id, total_members, last_message_id, last_sender_id, last_sent_at, created_at, updated_at";

const CREATE_GROUP_MESSAGE: &str = "Create group";

fn row_to_group(row: &SqliteRow) -> Result<Group, sqlx::Error> {
    let last_message = match row.try_get::<Option<i64>, _>("last_message_id")? {
        Some(message_id) => Some(LastMessage {
            message_id,
            sender_id: row.try_get::<Option<String>, _>("last_sender_id")?.unwrap_or_default(),
            sent_at: row.try_get::<Option<i64>, _>("last_sent_at")?.unwrap_or_default(),
        }),
        None => None,
    };
    Ok(Group {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        image: row.try_get("image")?,
        creator_id: row.try_get("creator_id")?,
        total_members: row.try_get("total_members")?,
        last_message,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) async fn fetch_group(conn: &mut SqliteConnection, group_id: &str) -> ChatResult<Group> {
    let row = sqlx::query(&format!("SELECT {} FROM groups WHERE id = ?", GROUP_COLUMNS))
        .bind(group_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(ChatError::NotFound(GROUP_NOT_FOUND))?;
    Ok(row_to_group(&row)?)
}

async fn require_creator(conn: &mut SqliteConnection, group_id: &str, actor_id: &str) -> ChatResult<Group> {
    let group = fetch_group(conn, group_id).await?;
    if group.creator_id != actor_id {
        return Err(ChatError::Forbidden(NOT_CREATOR));
    }
    Ok(group)
}

pub(crate) async fn is_member(conn: &mut SqliteConnection, group_id: &str, user_id: &str) -> ChatResult<bool> {
    let found = sqlx::query("SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

/// Inserts a membership row and bumps the counter; a pending join request for the same
/// user is consumed. Returns `false` (and changes nothing) when the user already is a member.
pub(crate) async fn insert_member(
    conn: &mut SqliteConnection,
    group_id: &str,
    user_id: &str,
    nickname: Option<&str>,
    now: i64,
) -> ChatResult<bool> {
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at, notify, nickname) VALUES (?, ?, ?, 1, ?)",
    )
    .bind(group_id)
    .bind(user_id)
    .bind(now)
    .bind(nickname)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if inserted == 0 {
        return Ok(false);
    }

    sqlx::query("UPDATE groups SET total_members = total_members + 1, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(group_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM join_requests WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(true)
}

// Returns false when there was no such membership; the counter is untouched then
async fn delete_member(conn: &mut SqliteConnection, group_id: &str, user_id: &str, now: i64) -> ChatResult<bool> {
    let removed = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if removed == 0 {
        return Ok(false);
    }
    sqlx::query("UPDATE groups SET total_members = total_members - 1, updated_at = ? WHERE id = ? AND total_members > 0")
        .bind(now)
        .bind(group_id)
        .execute(&mut *conn)
        .await?;
    Ok(true)
}

fn user_summary(row: &SqliteRow) -> Result<UserSummary, sqlx::Error> {
    Ok(UserSummary {
        id: row.try_get("user_id")?,
        name: row.try_get("user_name")?,
        avatar: row.try_get("user_avatar")?,
    })
}

/// Creates a group with its creator as sole member and a "Create group" system message
/// as the initial last message.
pub async fn create_group(
    db: &Database,
    creator_id: &str,
    name: &str,
    description: Option<&str>,
    image: Option<&str>,
) -> ChatResult<Group> {
    let input = validation::group_info(name, description, image)?;
    let group_id = uuid::Uuid::new_v4().to_string();
    let now = now_millis();

    let mut tx = db.begin_write().await?;
    sqlx::query(
        "INSERT INTO groups (id, name, description, image, creator_id, total_members, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(&group_id)
    .bind(&input.name)
    .bind(&input.description)
    .bind(&input.image)
    .bind(creator_id)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let creator_name: Option<String> = sqlx::query_scalar("SELECT name FROM users WHERE id = ?")
        .bind(creator_id)
        .fetch_optional(&mut *tx)
        .await?;
    insert_member(&mut tx, &group_id, creator_id, creator_name.as_deref(), now).await?;

    let system = MessageInput { content: CREATE_GROUP_MESSAGE.to_string(), kind: MessageKind::System, file_name: None };
    messages::insert_message(&mut tx, &group_id, creator_id, &system, now).await?;

    let group = fetch_group(&mut tx, &group_id).await?;
    tx.commit().await?;
    info!("[GROUPS] Group '{}' created with id {} by {}", group.name, group.id, creator_id);
    Ok(group)
}

pub async fn group_info(db: &Database, group_id: &str) -> ChatResult<Group> {
    let mut conn = db.pool.acquire().await?;
    fetch_group(&mut conn, group_id).await
}

/// Creator-only. `name` is always required; a missing description or image clears it.
pub async fn update_group(
    db: &Database,
    actor_id: &str,
    group_id: &str,
    name: &str,
    description: Option<&str>,
    image: Option<&str>,
) -> ChatResult<Group> {
    let input = validation::group_info(name, description, image)?;
    let mut tx = db.begin_write().await?;
    require_creator(&mut tx, group_id, actor_id).await?;
    sqlx::query("UPDATE groups SET name = ?, description = ?, image = ?, updated_at = ? WHERE id = ?")
        .bind(&input.name)
        .bind(&input.description)
        .bind(&input.image)
        .bind(now_millis())
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
    let group = fetch_group(&mut tx, group_id).await?;
    tx.commit().await?;
    Ok(group)
}

/// Creator-only. Removes the group with all of its members, join requests, invitations,
/// messages and read receipts. Returns who was a member, for notification.
pub async fn delete_group(db: &Database, actor_id: &str, group_id: &str) -> ChatResult<Vec<UserId>> {
    let mut tx = db.begin_write().await?;
    require_creator(&mut tx, group_id, actor_id).await?;

    let members: Vec<UserId> = sqlx::query_scalar("SELECT user_id FROM group_members WHERE group_id = ?")
        .bind(group_id)
        .fetch_all(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM message_reads WHERE message_id IN (SELECT id FROM messages WHERE group_id = ?)")
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
    for table in ["messages", "group_members", "join_requests", "invitations"] {
        sqlx::query(&format!("DELETE FROM {} WHERE group_id = ?", table))
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("DELETE FROM groups WHERE id = ?")
        .bind(group_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    info!("[GROUPS] Group {} deleted by {} ({} members)", group_id, actor_id, members.len());
    Ok(members)
}

/// Groups the user belongs to, most recently active first.
pub async fn list_groups(db: &Database, user_id: &str, page: Pagination) -> ChatResult<Page<GroupListing>> {
    let mut conn = db.pool.acquire().await?;
    let rows = sqlx::query(
        "SELECT g.id, g.name, g.image, g.last_message_id, g.last_sender_id, g.last_sent_at,
                m.content AS last_content,
                COALESCE(u.name, '') AS sender_name, COALESCE(u.avatar, '') AS sender_avatar,
                (SELECT group_concat(r.user_id) FROM message_reads r WHERE r.message_id = g.last_message_id) AS read_by
         FROM groups g
         JOIN group_members gm ON gm.group_id = g.id AND gm.user_id = ?
         LEFT JOIN messages m ON m.id = g.last_message_id
         LEFT JOIN users u ON u.id = g.last_sender_id
         ORDER BY g.last_sent_at DESC, g.created_at DESC
         LIMIT ? OFFSET ?",
    )
    .bind(user_id)
    .bind(page.limit as i64)
    .bind(page.offset())
    .fetch_all(&mut *conn)
    .await?;

    let mut data = Vec::with_capacity(rows.len());
    for row in rows.iter() {
        let last_message = match (row.try_get::<Option<i64>, _>("last_message_id")?, row.try_get::<Option<String>, _>("last_content")?) {
            (Some(message_id), Some(content)) => Some(LastMessagePreview {
                message_id,
                sender: UserSummary {
                    id: row.try_get::<Option<String>, _>("last_sender_id")?.unwrap_or_default(),
                    name: row.try_get("sender_name")?,
                    avatar: row.try_get("sender_avatar")?,
                },
                content,
                read_by: messages::split_ids(row.try_get("read_by")?),
                sent_at: row.try_get::<Option<i64>, _>("last_sent_at")?.unwrap_or_default(),
            }),
            _ => None,
        };
        data.push(GroupListing {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            image: row.try_get("image")?,
            last_message,
        });
    }

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM group_members WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(Page { data, total, current_page: page.page })
}

/// Member-only listing, oldest members first.
pub async fn list_members(db: &Database, actor_id: &str, group_id: &str, page: Pagination) -> ChatResult<Page<Member>> {
    let mut conn = db.pool.acquire().await?;
    fetch_group(&mut conn, group_id).await?;
    if !is_member(&mut conn, group_id, actor_id).await? {
        return Err(ChatError::Forbidden(NOT_MEMBER));
    }

    let rows = sqlx::query(
        "SELECT gm.user_id, COALESCE(u.name, '') AS user_name, COALESCE(u.avatar, '') AS user_avatar,
                COALESCE(u.is_online, 0) AS is_online, gm.joined_at, gm.notify, gm.nickname
         FROM group_members gm LEFT JOIN users u ON u.id = gm.user_id
         WHERE gm.group_id = ?
         ORDER BY gm.joined_at ASC, gm.user_id ASC
         LIMIT ? OFFSET ?",
    )
    .bind(group_id)
    .bind(page.limit as i64)
    .bind(page.offset())
    .fetch_all(&mut *conn)
    .await?;

    let mut data = Vec::with_capacity(rows.len());
    for row in rows.iter() {
        data.push(Member {
            user: user_summary(row)?,
            is_online: row.try_get("is_online")?,
            joined_at: row.try_get("joined_at")?,
            notify: row.try_get("notify")?,
            nickname: row.try_get("nickname")?,
        });
    }

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM group_members WHERE group_id = ?")
        .bind(group_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(Page { data, total, current_page: page.page })
}

/// Creator-only. Adding an existing member is a successful no-op (`Ok(false)`).
pub async fn add_member(db: &Database, actor_id: &str, group_id: &str, target_id: &str) -> ChatResult<bool> {
    let mut tx = db.begin_write().await?;
    require_creator(&mut tx, group_id, actor_id).await?;
    let exists = sqlx::query("SELECT 1 FROM users WHERE id = ?")
        .bind(target_id)
        .fetch_optional(&mut *tx)
        .await?;
    if exists.is_none() {
        return Err(ChatError::NotFound(NOT_FOUND));
    }
    let added = insert_member(&mut tx, group_id, target_id, None, now_millis()).await?;
    tx.commit().await?;
    if added {
        info!("[GROUPS] {} added to group {} by {}", target_id, group_id, actor_id);
    }
    Ok(added)
}

/// The member themself or the creator may change notify/nickname. A missing nickname
/// clears it, a missing notify keeps the current value.
pub async fn edit_member(
    db: &Database,
    actor_id: &str,
    group_id: &str,
    member_id: &str,
    notify: Option<bool>,
    nickname: Option<&str>,
) -> ChatResult<()> {
    let input = validation::member_info(notify, nickname)?;
    let mut tx = db.begin_write().await?;
    let group = fetch_group(&mut tx, group_id).await?;
    if actor_id != member_id && actor_id != group.creator_id {
        return Err(ChatError::Forbidden(NOT_CREATOR));
    }
    let res = sqlx::query("UPDATE group_members SET notify = COALESCE(?, notify), nickname = ? WHERE group_id = ? AND user_id = ?")
        .bind(input.notify)
        .bind(&input.nickname)
        .bind(group_id)
        .bind(member_id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ChatError::NotFound(NOT_FOUND));
    }
    tx.commit().await?;
    Ok(())
}

/// Creator-only. The creator cannot be removed; an absent target is `NotFound`.
pub async fn remove_member(db: &Database, actor_id: &str, group_id: &str, target_id: &str) -> ChatResult<()> {
    let mut tx = db.begin_write().await?;
    let group = require_creator(&mut tx, group_id, actor_id).await?;
    if target_id == group.creator_id {
        return Err(ChatError::Forbidden(CREATOR_CANNOT_LEAVE));
    }
    if group.total_members <= 0 || !delete_member(&mut tx, group_id, target_id, now_millis()).await? {
        return Err(ChatError::NotFound(NOT_FOUND));
    }
    tx.commit().await?;
    info!("[GROUPS] {} removed from group {} by {}", target_id, group_id, actor_id);
    Ok(())
}

/// The creator has to delete the group instead of leaving it.
pub async fn leave_group(db: &Database, user_id: &str, group_id: &str) -> ChatResult<()> {
    let mut tx = db.begin_write().await?;
    let group = fetch_group(&mut tx, group_id).await?;
    if group.creator_id == user_id {
        return Err(ChatError::Forbidden(CREATOR_CANNOT_LEAVE));
    }
    if !delete_member(&mut tx, group_id, user_id, now_millis()).await? {
        return Err(ChatError::NotFound(NOT_MEMBER));
    }
    tx.commit().await?;
    info!("[GROUPS] {} left group {}", user_id, group_id);
    Ok(())
}

/// Fails with the same `NotFound` whether the group is missing, the user is already a
/// member, or a request is already pending.
pub async fn request_to_join(db: &Database, user_id: &str, group_id: &str) -> ChatResult<()> {
    let mut tx = db.begin_write().await?;
    let res = sqlx::query(
        "INSERT INTO join_requests (group_id, user_id, is_read, requested_at)
         SELECT ?, ?, 0, ?
         WHERE EXISTS (SELECT 1 FROM groups WHERE id = ?)
           AND NOT EXISTS (SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ?)
           AND NOT EXISTS (SELECT 1 FROM join_requests WHERE group_id = ? AND user_id = ?)",
    )
    .bind(group_id)
    .bind(user_id)
    .bind(now_millis())
    .bind(group_id)
    .bind(group_id)
    .bind(user_id)
    .bind(group_id)
    .bind(user_id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        return Err(ChatError::NotFound(NOT_FOUND));
    }
    tx.commit().await?;
    info!("[GROUPS] {} requested to join group {}", user_id, group_id);
    Ok(())
}

/// Creator-only, oldest request first.
pub async fn list_join_requests(db: &Database, actor_id: &str, group_id: &str) -> ChatResult<Vec<JoinRequest>> {
    let mut conn = db.pool.acquire().await?;
    require_creator(&mut conn, group_id, actor_id).await?;
    let rows = sqlx::query(
        "SELECT jr.user_id, COALESCE(u.name, '') AS user_name, COALESCE(u.avatar, '') AS user_avatar,
                jr.is_read, jr.requested_at
         FROM join_requests jr LEFT JOIN users u ON u.id = jr.user_id
         WHERE jr.group_id = ?
         ORDER BY jr.requested_at ASC, jr.user_id ASC",
    )
    .bind(group_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut requests = Vec::with_capacity(rows.len());
    for row in rows.iter() {
        requests.push(JoinRequest {
            user: user_summary(row)?,
            is_read: row.try_get("is_read")?,
            requested_at: row.try_get("requested_at")?,
        });
    }
    Ok(requests)
}

/// Creator-only. Callers treat this as best-effort and only log failures.
pub async fn mark_join_requests_read(db: &Database, actor_id: &str, group_id: &str) -> ChatResult<u64> {
    let mut tx = db.begin_write().await?;
    require_creator(&mut tx, group_id, actor_id).await?;
    let res = sqlx::query("UPDATE join_requests SET is_read = 1 WHERE group_id = ? AND is_read = 0")
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected())
}

/// Creator-only. Promotes a pending request to membership.
pub async fn approve_join_request(db: &Database, actor_id: &str, group_id: &str, requester_id: &str) -> ChatResult<()> {
    let mut tx = db.begin_write().await?;
    require_creator(&mut tx, group_id, actor_id).await?;
    let removed = sqlx::query("DELETE FROM join_requests WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(requester_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if removed == 0 {
        return Err(ChatError::NotFound(NOT_FOUND));
    }
    if !insert_member(&mut tx, group_id, requester_id, None, now_millis()).await? {
        // requests and memberships are kept disjoint, so this means the tables drifted
        warn!("[GROUPS] Approved request of {} who already is a member of {}", requester_id, group_id);
    }
    tx.commit().await?;
    info!("[GROUPS] Join request of {} approved for group {}", requester_id, group_id);
    Ok(())
}

/// Allowed for the requester themself or the creator.
pub async fn cancel_join_request(db: &Database, actor_id: &str, group_id: &str, requester_id: &str) -> ChatResult<()> {
    let mut tx = db.begin_write().await?;
    let group = fetch_group(&mut tx, group_id).await?;
    if actor_id != requester_id && actor_id != group.creator_id {
        return Err(ChatError::Forbidden(NOT_CREATOR));
    }
    let removed = sqlx::query("DELETE FROM join_requests WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(requester_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if removed == 0 {
        return Err(ChatError::NotFound(NOT_FOUND));
    }
    tx.commit().await?;
    Ok(())
}

/// Current member ids; `NotFound` when the group no longer exists.
pub async fn member_ids(db: &Database, group_id: &str) -> ChatResult<Vec<UserId>> {
    let rows = sqlx::query(
        "SELECT gm.user_id FROM groups g LEFT JOIN group_members gm ON gm.group_id = g.id WHERE g.id = ?",
    )
    .bind(group_id)
    .fetch_all(&db.pool)
    .await?;
    if rows.is_empty() {
        return Err(ChatError::NotFound(GROUP_NOT_FOUND));
    }
    let mut ids = Vec::with_capacity(rows.len());
    for row in rows.iter() {
        if let Some(id) = row.try_get::<Option<String>, _>("user_id")? {
            ids.push(id);
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::User;
    use crate::common::validation::{paginate, GROUPS_PAGE_LIMIT, MEMBERS_PAGE_LIMIT};
    use crate::server::users;

    async fn setup() -> (Database, User, User, User) {
        let db = Database::in_memory().await.unwrap();
        let a = users::create_user(&db, "Ada", "ada@example.com").await.unwrap();
        let b = users::create_user(&db, "Bob", "bob@example.com").await.unwrap();
        let c = users::create_user(&db, "Cy", "cy@example.com").await.unwrap();
        (db, a, b, c)
    }

    async fn counted_members(db: &Database, group_id: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM group_members WHERE group_id = ?")
            .bind(group_id)
            .fetch_one(&db.pool)
            .await
            .unwrap()
    }

    async fn assert_counter_consistent(db: &Database, group_id: &str) {
        let group = group_info(db, group_id).await.unwrap();
        assert_eq!(group.total_members, counted_members(db, group_id).await);
    }

    #[tokio::test]
    async fn create_group_seeds_member_and_system_message() {
        let (db, a, _, _) = setup().await;
        let group = create_group(&db, &a.id, "Team", Some("Our team"), None).await.unwrap();

        assert_eq!(group.total_members, 1);
        assert_eq!(group.creator_id, a.id);
        assert_eq!(group.description.as_deref(), Some("Our team"));
        let last = group.last_message.clone().unwrap();
        assert_eq!(last.sender_id, a.id);

        let ids = member_ids(&db, &group.id).await.unwrap();
        assert_eq!(ids, vec![a.id.clone()]);

        let listing = list_groups(&db, &a.id, paginate(None, None, GROUPS_PAGE_LIMIT).unwrap()).await.unwrap();
        assert_eq!(listing.total, 1);
        let preview = listing.data[0].last_message.clone().unwrap();
        assert_eq!(preview.message_id, last.message_id);
        assert_eq!(preview.content, "Create group");
        assert_eq!(preview.sender.name, "Ada");
        assert_eq!(preview.read_by, vec![a.id.clone()]);

        let members = list_members(&db, &a.id, &group.id, paginate(None, None, MEMBERS_PAGE_LIMIT).unwrap()).await.unwrap();
        assert_eq!(members.data[0].nickname.as_deref(), Some("Ada"));
        assert!(members.data[0].notify);
    }

    #[tokio::test]
    async fn invalid_group_name_creates_nothing() {
        let (db, a, _, _) = setup().await;
        let err = create_group(&db, &a.id, "   ", None, None).await.unwrap_err();
        assert_eq!(err.status(), 400);
        let groups: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM groups").fetch_one(&db.pool).await.unwrap();
        assert_eq!(groups, 0);
    }

    #[tokio::test]
    async fn add_member_is_idempotent() {
        let (db, a, b, _) = setup().await;
        let group = create_group(&db, &a.id, "Team", None, None).await.unwrap();

        assert!(add_member(&db, &a.id, &group.id, &b.id).await.unwrap());
        assert!(!add_member(&db, &a.id, &group.id, &b.id).await.unwrap());
        assert_eq!(group_info(&db, &group.id).await.unwrap().total_members, 2);
        assert_counter_consistent(&db, &group.id).await;

        assert!(matches!(add_member(&db, &b.id, &group.id, &b.id).await, Err(ChatError::Forbidden(NOT_CREATOR))));
        assert!(matches!(add_member(&db, &a.id, &group.id, "ghost").await, Err(ChatError::NotFound(_))));
        assert!(matches!(add_member(&db, &a.id, "nope", &b.id).await, Err(ChatError::NotFound(GROUP_NOT_FOUND))));
    }

    #[tokio::test]
    async fn concurrent_adds_count_once() {
        let (db, a, b, _) = setup().await;
        let group = create_group(&db, &a.id, "Team", None, None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let (db, a, b, g) = (db.clone(), a.id.clone(), b.id.clone(), group.id.clone());
            handles.push(tokio::spawn(async move { add_member(&db, &a, &g, &b).await }));
        }
        let mut added = 0;
        for h in handles {
            if h.await.unwrap().unwrap() {
                added += 1;
            }
        }
        assert_eq!(added, 1);
        assert_eq!(group_info(&db, &group.id).await.unwrap().total_members, 2);
        assert_counter_consistent(&db, &group.id).await;
    }

    #[tokio::test]
    async fn concurrent_removes_succeed_once() {
        let (db, a, b, _) = setup().await;
        let group = create_group(&db, &a.id, "Team", None, None).await.unwrap();
        add_member(&db, &a.id, &group.id, &b.id).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let (db, a, b, g) = (db.clone(), a.id.clone(), b.id.clone(), group.id.clone());
            handles.push(tokio::spawn(async move { remove_member(&db, &a, &g, &b).await }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => ok += 1,
                Err(e) => assert!(matches!(e, ChatError::NotFound(_))),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(group_info(&db, &group.id).await.unwrap().total_members, 1);
        assert_counter_consistent(&db, &group.id).await;
    }

    #[tokio::test]
    async fn creator_cannot_leave_or_be_removed() {
        let (db, a, b, _) = setup().await;
        let group = create_group(&db, &a.id, "Team", None, None).await.unwrap();
        add_member(&db, &a.id, &group.id, &b.id).await.unwrap();

        assert!(matches!(leave_group(&db, &a.id, &group.id).await, Err(ChatError::Forbidden(CREATOR_CANNOT_LEAVE))));
        assert!(matches!(
            remove_member(&db, &a.id, &group.id, &a.id).await,
            Err(ChatError::Forbidden(CREATOR_CANNOT_LEAVE))
        ));

        leave_group(&db, &b.id, &group.id).await.unwrap();
        assert!(leave_group(&db, &b.id, &group.id).await.is_err());
        assert_eq!(group_info(&db, &group.id).await.unwrap().total_members, 1);
    }

    #[tokio::test]
    async fn join_request_lifecycle() {
        let (db, a, b, c) = setup().await;
        let group = create_group(&db, &a.id, "Team", None, None).await.unwrap();

        request_to_join(&db, &b.id, &group.id).await.unwrap();
        // duplicate, member, and missing group all look the same
        assert!(matches!(request_to_join(&db, &b.id, &group.id).await, Err(ChatError::NotFound(NOT_FOUND))));
        assert!(matches!(request_to_join(&db, &a.id, &group.id).await, Err(ChatError::NotFound(NOT_FOUND))));
        assert!(matches!(request_to_join(&db, &b.id, "nope").await, Err(ChatError::NotFound(NOT_FOUND))));

        request_to_join(&db, &c.id, &group.id).await.unwrap();
        let pending = list_join_requests(&db, &a.id, &group.id).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|r| !r.is_read));
        assert!(list_join_requests(&db, &b.id, &group.id).await.is_err());

        assert_eq!(mark_join_requests_read(&db, &a.id, &group.id).await.unwrap(), 2);
        assert_eq!(mark_join_requests_read(&db, &a.id, &group.id).await.unwrap(), 0);

        approve_join_request(&db, &a.id, &group.id, &b.id).await.unwrap();
        assert!(matches!(
            approve_join_request(&db, &a.id, &group.id, &b.id).await,
            Err(ChatError::NotFound(NOT_FOUND))
        ));
        cancel_join_request(&db, &c.id, &group.id, &c.id).await.unwrap();

        assert!(list_join_requests(&db, &a.id, &group.id).await.unwrap().is_empty());
        assert_eq!(group_info(&db, &group.id).await.unwrap().total_members, 2);
        assert_counter_consistent(&db, &group.id).await;
    }

    #[tokio::test]
    async fn direct_add_consumes_pending_request() {
        let (db, a, b, _) = setup().await;
        let group = create_group(&db, &a.id, "Team", None, None).await.unwrap();
        request_to_join(&db, &b.id, &group.id).await.unwrap();
        add_member(&db, &a.id, &group.id, &b.id).await.unwrap();
        assert!(list_join_requests(&db, &a.id, &group.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_and_delete_are_creator_only() {
        let (db, a, b, _) = setup().await;
        let group = create_group(&db, &a.id, "Team", Some("desc"), Some("team.png")).await.unwrap();
        add_member(&db, &a.id, &group.id, &b.id).await.unwrap();

        assert!(matches!(
            update_group(&db, &b.id, &group.id, "Mine", None, None).await,
            Err(ChatError::Forbidden(NOT_CREATOR))
        ));
        let updated = update_group(&db, &a.id, &group.id, "Team 2", None, None).await.unwrap();
        assert_eq!(updated.name, "Team 2");
        assert_eq!(updated.description, None);
        assert_eq!(updated.image, None);

        assert!(delete_group(&db, &b.id, &group.id).await.is_err());
        let mut former = delete_group(&db, &a.id, &group.id).await.unwrap();
        former.sort();
        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort();
        assert_eq!(former, expected);

        assert!(matches!(group_info(&db, &group.id).await, Err(ChatError::NotFound(GROUP_NOT_FOUND))));
        assert!(matches!(member_ids(&db, &group.id).await, Err(ChatError::NotFound(GROUP_NOT_FOUND))));
        let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages").fetch_one(&db.pool).await.unwrap();
        assert_eq!(messages, 0);
    }

    #[tokio::test]
    async fn edit_member_by_self_or_creator() {
        let (db, a, b, c) = setup().await;
        let group = create_group(&db, &a.id, "Team", None, None).await.unwrap();
        add_member(&db, &a.id, &group.id, &b.id).await.unwrap();
        add_member(&db, &a.id, &group.id, &c.id).await.unwrap();

        edit_member(&db, &b.id, &group.id, &b.id, Some(false), Some("bobby")).await.unwrap();
        edit_member(&db, &a.id, &group.id, &b.id, None, Some("Robert")).await.unwrap();
        assert!(matches!(
            edit_member(&db, &c.id, &group.id, &b.id, Some(true), None).await,
            Err(ChatError::Forbidden(_))
        ));

        let page = list_members(&db, &b.id, &group.id, paginate(None, None, MEMBERS_PAGE_LIMIT).unwrap()).await.unwrap();
        let bob = page.data.iter().find(|m| m.user.id == b.id).unwrap();
        assert!(!bob.notify);
        assert_eq!(bob.nickname.as_deref(), Some("Robert"));
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn listings_require_membership_and_paginate() {
        let (db, a, b, _) = setup().await;
        let mut ids = Vec::new();
        for i in 0..7 {
            ids.push(create_group(&db, &a.id, &format!("G{}", i), None, None).await.unwrap().id);
        }
        assert!(matches!(
            list_members(&db, &b.id, &ids[0], paginate(None, None, MEMBERS_PAGE_LIMIT).unwrap()).await,
            Err(ChatError::Forbidden(NOT_MEMBER))
        ));

        let first = list_groups(&db, &a.id, paginate(None, None, GROUPS_PAGE_LIMIT).unwrap()).await.unwrap();
        assert_eq!(first.data.len(), 5);
        assert_eq!(first.total, 7);
        let second = list_groups(&db, &a.id, paginate(Some(2), None, GROUPS_PAGE_LIMIT).unwrap()).await.unwrap();
        assert_eq!(second.data.len(), 2);
        assert_eq!(second.current_page, 2);

        assert_eq!(list_groups(&db, &b.id, paginate(None, None, GROUPS_PAGE_LIMIT).unwrap()).await.unwrap().total, 0);
    }
}
