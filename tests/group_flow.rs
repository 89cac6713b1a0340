use std::sync::Arc;

use ruggine_groups::common::errors::{ChatError, CREATOR_CANNOT_LEAVE, NOT_FOUND};
use ruggine_groups::common::models::{Identity, User};
use ruggine_groups::common::protocol::{EventAction, PresenceAction, Request, ServerEvent};
use ruggine_groups::server::config::ServerConfig;
use ruggine_groups::server::database::Database;
use ruggine_groups::server::handlers::{dispatch, AppContext};
use ruggine_groups::server::mailer::LogMailer;
use ruggine_groups::server::{groups, messages, users};

async fn app() -> AppContext {
    let db = Database::in_memory().await.unwrap();
    AppContext::new(db, ServerConfig::default(), Arc::new(LogMailer))
}

async fn user(ctx: &AppContext, name: &str) -> (User, Identity) {
    let user = users::create_user(&ctx.db, name, &format!("{}@example.com", name.to_lowercase())).await.unwrap();
    let identity = Identity { user_id: user.id.clone(), name: user.name.clone() };
    (user, identity)
}

async fn member_count(db: &Database, group_id: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM group_members WHERE group_id = ?")
        .bind(group_id)
        .fetch_one(&db.pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn team_creation_seeds_counter_and_last_message() {
    let ctx = app().await;
    let (a, ida) = user(&ctx, "Ada").await;

    let created = dispatch(&ctx, &ida, Request::CreateGroup { name: "Team".into(), description: None, image: None })
        .await
        .unwrap();
    assert_eq!(created["total_members"], 1);
    assert_eq!(created["last_message"]["sender_id"], a.id.as_str());

    let group_id = created["id"].as_str().unwrap();
    assert_eq!(member_count(&ctx.db, group_id).await, 1);
    let page = dispatch(&ctx, &ida, Request::ListMessages { group_id: group_id.into(), page: None, limit: None })
        .await
        .unwrap();
    assert_eq!(page["total"], 1);
    assert_eq!(page["data"][0]["content"], "Create group");
    assert_eq!(page["data"][0]["kind"], "system");
}

#[tokio::test]
async fn join_then_approve_keeps_sets_disjoint() {
    let ctx = app().await;
    let (a, _) = user(&ctx, "Ada").await;
    let (b, _) = user(&ctx, "Bob").await;
    let group = groups::create_group(&ctx.db, &a.id, "Team", None, None).await.unwrap();

    groups::request_to_join(&ctx.db, &b.id, &group.id).await.unwrap();
    assert_eq!(groups::list_join_requests(&ctx.db, &a.id, &group.id).await.unwrap().len(), 1);

    groups::approve_join_request(&ctx.db, &a.id, &group.id, &b.id).await.unwrap();
    assert!(groups::list_join_requests(&ctx.db, &a.id, &group.id).await.unwrap().is_empty());
    assert_eq!(groups::group_info(&ctx.db, &group.id).await.unwrap().total_members, 2);
    assert_eq!(member_count(&ctx.db, &group.id).await, 2);

    let overlap: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM join_requests jr JOIN group_members gm
         ON gm.group_id = jr.group_id AND gm.user_id = jr.user_id",
    )
    .fetch_one(&ctx.db.pool)
    .await
    .unwrap();
    assert_eq!(overlap, 0);
}

#[tokio::test]
async fn fan_out_skips_offline_members() {
    let ctx = app().await;
    let (a, ida) = user(&ctx, "Ada").await;
    let (b, _) = user(&ctx, "Bob").await;
    let (c, _) = user(&ctx, "Cy").await;
    let group = groups::create_group(&ctx.db, &a.id, "Team", None, None).await.unwrap();
    groups::add_member(&ctx.db, &a.id, &group.id, &b.id).await.unwrap();
    groups::add_member(&ctx.db, &a.id, &group.id, &c.id).await.unwrap();

    let mut bob = ctx.router.connect(&b.id).await;
    dispatch(&ctx, &ida, Request::SendMessage { group_id: group.id.clone(), content: "hi".into(), kind: None, file_name: None })
        .await
        .unwrap();

    match bob.events.recv().await.unwrap() {
        ServerEvent::Message { action, group_id, message, last_message, .. } => {
            assert_eq!(action, EventAction::Send);
            assert_eq!(group_id, group.id);
            let message = message.unwrap();
            assert_eq!(message.content, "hi");
            assert_eq!(message.read_by, vec![a.id.clone()]);
            assert_eq!(last_message.unwrap().message_id, message.id);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // offline cy finds nothing queued once connected, and bob hears about it
    let mut cy = ctx.router.connect(&c.id).await;
    assert!(cy.events.try_recv().is_err());
    assert_eq!(
        bob.events.recv().await.unwrap(),
        ServerEvent::UserStatus { user_id: c.id.clone(), action: PresenceAction::Online }
    );
    assert!(users::get_user(&ctx.db, &c.id).await.unwrap().is_online);
}

#[tokio::test]
async fn creator_cannot_leave() {
    let ctx = app().await;
    let (_, ida) = user(&ctx, "Ada").await;
    let created = dispatch(&ctx, &ida, Request::CreateGroup { name: "Team".into(), description: None, image: None })
        .await
        .unwrap();
    let group_id = created["id"].as_str().unwrap().to_string();

    let err = dispatch(&ctx, &ida, Request::LeaveGroup { group_id: group_id.clone() }).await.unwrap_err();
    assert!(matches!(err, ChatError::Forbidden(CREATOR_CANNOT_LEAVE)));
    assert_eq!(groups::group_info(&ctx.db, &group_id).await.unwrap().total_members, 1);
}

#[tokio::test]
async fn concurrent_removes_decrement_once() {
    let ctx = app().await;
    let (a, _) = user(&ctx, "Ada").await;
    let (b, _) = user(&ctx, "Bob").await;
    let group = groups::create_group(&ctx.db, &a.id, "Team", None, None).await.unwrap();
    groups::add_member(&ctx.db, &a.id, &group.id, &b.id).await.unwrap();

    let first = {
        let (db, a, g, b) = (ctx.db.clone(), a.id.clone(), group.id.clone(), b.id.clone());
        tokio::spawn(async move { groups::remove_member(&db, &a, &g, &b).await })
    };
    let second = {
        let (db, a, g, b) = (ctx.db.clone(), a.id.clone(), group.id.clone(), b.id.clone());
        tokio::spawn(async move { groups::remove_member(&db, &a, &g, &b).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(ChatError::NotFound(NOT_FOUND)))));
    assert_eq!(groups::group_info(&ctx.db, &group.id).await.unwrap().total_members, 1);
    assert_eq!(member_count(&ctx.db, &group.id).await, 1);
}

#[tokio::test]
async fn message_ids_increase_and_reads_are_monotonic() {
    let ctx = app().await;
    let (a, _) = user(&ctx, "Ada").await;
    let (b, _) = user(&ctx, "Bob").await;
    let group = groups::create_group(&ctx.db, &a.id, "Team", None, None).await.unwrap();
    groups::add_member(&ctx.db, &a.id, &group.id, &b.id).await.unwrap();

    let mut last_id = 0;
    for text in ["one", "two", "three"] {
        let (m, _) = messages::append_message(&ctx.db, &a.id, &group.id, text, None, None).await.unwrap();
        assert!(m.id > last_id);
        last_id = m.id;
    }

    messages::mark_read(&ctx.db, &b.id, &group.id).await.unwrap();
    messages::mark_read(&ctx.db, &b.id, &group.id).await.unwrap();
    let last = messages::get_message(&ctx.db, last_id).await.unwrap();
    let mut expected = vec![a.id.clone(), b.id.clone()];
    expected.sort();
    assert_eq!(last.read_by, expected);
}
