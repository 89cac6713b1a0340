use std::sync::Arc;

use ruggine_groups::common::errors::ChatError;
use ruggine_groups::server::config::ServerConfig;
use ruggine_groups::server::database::Database;
use ruggine_groups::server::handlers::AppContext;
use ruggine_groups::server::mailer::LogMailer;
use ruggine_groups::server::{groups, messages, users};

const ROUNDS: usize = 25;

// Same pool shape the server binary runs with: WAL file, several connections
async fn file_app(dir: &tempfile::TempDir) -> AppContext {
    let url = format!("sqlite://{}", dir.path().join("ruggine_groups.db").display());
    let db = Database::connect(&url, 5).await.unwrap();
    db.migrate().await.unwrap();
    AppContext::new(db, ServerConfig::default(), Arc::new(LogMailer))
}

fn assert_not_internal<T>(result: &Result<T, ChatError>, what: &str) {
    if let Err(e) = result {
        assert!(!matches!(e, ChatError::Internal(_)), "{} failed: {}", what, e);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_and_presence_writers_share_a_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = file_app(&dir).await;
    let creator = users::create_user(&ctx.db, "Ada", "ada@example.com").await.unwrap();
    let group = groups::create_group(&ctx.db, &creator.id, "Team", None, None).await.unwrap();

    let mut members = Vec::new();
    let mut watchers = Vec::new();
    for i in 0..4 {
        members.push(users::create_user(&ctx.db, &format!("Member{}", i), &format!("member{}@example.com", i)).await.unwrap().id);
        watchers.push(users::create_user(&ctx.db, &format!("Watcher{}", i), &format!("watcher{}@example.com", i)).await.unwrap().id);
    }

    let mut tasks = Vec::new();
    for member in members.clone() {
        let (db, creator, group_id) = (ctx.db.clone(), creator.id.clone(), group.id.clone());
        tasks.push(tokio::spawn(async move {
            for round in 0..ROUNDS {
                let added = groups::add_member(&db, &creator, &group_id, &member).await;
                assert_not_internal(&added, "add_member");
                assert!(added.unwrap());

                let sent = messages::append_message(&db, &member, &group_id, &format!("round {}", round), None, None).await;
                assert_not_internal(&sent, "append_message");
                sent.unwrap();

                let removed = groups::remove_member(&db, &creator, &group_id, &member).await;
                assert_not_internal(&removed, "remove_member");
                removed.unwrap();
            }
        }));
    }
    {
        let (db, creator, group_id) = (ctx.db.clone(), creator.id.clone(), group.id.clone());
        tasks.push(tokio::spawn(async move {
            for round in 0..ROUNDS {
                let sent = messages::append_message(&db, &creator, &group_id, &format!("creator {}", round), None, None).await;
                assert_not_internal(&sent, "append_message");
                sent.unwrap();
            }
        }));
    }
    for watcher in watchers.clone() {
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..ROUNDS {
                let connection = ctx.router.connect(&watcher).await;
                ctx.router.disconnect(&watcher, connection.id).await;
                let flipped = users::set_online(&ctx.db, &watcher, false).await;
                assert_not_internal(&flipped, "set_online");
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let info = groups::group_info(&ctx.db, &group.id).await.unwrap();
    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM group_members WHERE group_id = ?")
        .bind(&group.id)
        .fetch_one(&ctx.db.pool)
        .await
        .unwrap();
    assert_eq!(info.total_members, stored);
    assert_eq!(stored, 1);

    let sent: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE group_id = ? AND kind = 'text'")
        .bind(&group.id)
        .fetch_one(&ctx.db.pool)
        .await
        .unwrap();
    assert_eq!(sent, ((members.len() + 1) * ROUNDS) as i64);

    for watcher in &watchers {
        assert!(!users::get_user(&ctx.db, watcher).await.unwrap().is_online);
    }
    ctx.db.pool.close().await;
}
