// Dumps groups, memberships and recent messages; flags member counters that drifted
use ruggine_groups::server::config::ServerConfig;
use ruggine_groups::server::database::Database;
use sqlx::Row;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    let db_url = std::env::args().nth(1).unwrap_or(config.database_url);
    println!("Connecting to {}", db_url);
    let db = Database::connect(&db_url, 1).await?;

    println!("\n-- groups --");
    let rows = sqlx::query(
        "SELECT g.id, g.name, g.creator_id, g.total_members, g.last_message_id,
                (SELECT COUNT(*) FROM group_members gm WHERE gm.group_id = g.id) AS counted
         FROM groups g ORDER BY g.created_at",
    )
    .fetch_all(&db.pool)
    .await?;
    let mut drifted = 0;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let name: String = r.try_get("name").unwrap_or_default();
        let creator: String = r.try_get("creator_id").unwrap_or_default();
        let total: i64 = r.try_get("total_members").unwrap_or(0);
        let counted: i64 = r.try_get("counted").unwrap_or(0);
        let last: Option<i64> = r.try_get("last_message_id").unwrap_or(None);
        let flag = if total != counted {
            drifted += 1;
            "  <-- counter drift"
        } else {
            ""
        };
        println!("id={} name={} creator={} total_members={} counted={} last_message={:?}{}",
                 id, name, creator, total, counted, last, flag);
    }

    println!("\n-- join_requests --");
    let rows = sqlx::query("SELECT group_id, user_id, is_read, requested_at FROM join_requests ORDER BY requested_at")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let group_id: String = r.try_get("group_id").unwrap_or_default();
        let user_id: String = r.try_get("user_id").unwrap_or_default();
        let is_read: bool = r.try_get("is_read").unwrap_or(false);
        println!("group_id={} user_id={} is_read={}", group_id, user_id, is_read);
    }

    println!("\n-- messages (last 10) --");
    let rows = sqlx::query("SELECT id, group_id, sender_id, kind, content, created_at FROM messages ORDER BY id DESC LIMIT 10")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: i64 = r.try_get("id").unwrap_or(0);
        let group_id: String = r.try_get("group_id").unwrap_or_default();
        let sender_id: String = r.try_get("sender_id").unwrap_or_default();
        let kind: String = r.try_get("kind").unwrap_or_default();
        let content: String = r.try_get("content").unwrap_or_default();
        let created_at: i64 = r.try_get("created_at").unwrap_or(0);
        println!("id={} group_id={} sender_id={} kind={} content_len={} created_at={}",
                 id, group_id, sender_id, kind, content.len(), created_at);
    }

    if drifted > 0 {
        println!("\n{} group(s) with total_members out of sync", drifted);
    }
    Ok(())
}
