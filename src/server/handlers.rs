//! Request dispatch: runs one operation for an authenticated caller, then publishes the
//! resulting events. Publishing happens after the commit and never changes the reply.

use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};

use crate::common::errors::ChatResult;
use crate::common::models::{Group, Identity, UserId};
use crate::common::protocol::{EventAction, Request, ServerEvent};
use crate::common::validation::{self, GROUPS_PAGE_LIMIT, MEMBERS_PAGE_LIMIT, MESSAGES_PAGE_LIMIT};
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::mailer::{self, Mailer};
use crate::server::presence::PresenceRouter;
use crate::server::{groups, invitations, messages, users};

/// Everything a request needs, built once at startup and shared by every connection.
#[derive(Clone)]
pub struct AppContext {
    pub db: Database,
    pub router: PresenceRouter,
    pub config: ServerConfig,
    pub mailer: Arc<dyn Mailer>,
}

impl AppContext {
    pub fn new(db: Database, config: ServerConfig, mailer: Arc<dyn Mailer>) -> Self {
        let router = PresenceRouter::new(db.clone(), config.event_buffer);
        Self { db, router, config, mailer }
    }

    async fn publish(&self, group_id: &str, event: ServerEvent) {
        match self.router.publish_group_event(group_id, &event).await {
            Ok(n) => debug!("[DISPATCH] Event for group {} delivered to {} connections", group_id, n),
            Err(e) => warn!("[DISPATCH] Publish to group {} failed: {}", group_id, e),
        }
    }

    fn publish_to(&self, user_ids: &[UserId], event: ServerEvent) {
        let n = self.router.publish_to_users(user_ids, &event);
        debug!("[DISPATCH] Event delivered to {} connections", n);
    }
}

fn to_value<T: Serialize>(value: T) -> ChatResult<Value> {
    Ok(serde_json::to_value(value)?)
}

fn group_event(action: EventAction, group_id: &str, group: Option<Group>) -> ServerEvent {
    ServerEvent::Group { action, group_id: group_id.to_string(), group }
}

pub async fn dispatch(ctx: &AppContext, caller: &Identity, request: Request) -> ChatResult<Value> {
    let me = caller.user_id.as_str();
    match request {
        Request::Me => to_value(users::get_user(&ctx.db, me).await?),
        Request::UpdateProfile { name, email, avatar } => {
            let input = validation::profile(&name, &email, avatar.as_deref())?;
            to_value(users::update_profile(&ctx.db, me, &input).await?)
        }
        Request::FindUser { email } => to_value(users::find_by_email(&ctx.db, &email).await?),

        Request::ListGroups { page, limit } => {
            let page = validation::paginate(page, limit, GROUPS_PAGE_LIMIT)?;
            to_value(groups::list_groups(&ctx.db, me, page).await?)
        }
        Request::CreateGroup { name, description, image } => {
            let group = groups::create_group(&ctx.db, me, &name, description.as_deref(), image.as_deref()).await?;
            ctx.publish(&group.id, group_event(EventAction::Send, &group.id, Some(group.clone()))).await;
            to_value(group)
        }
        Request::GroupInfo { group_id } => to_value(groups::group_info(&ctx.db, &group_id).await?),
        Request::UpdateGroup { group_id, name, description, image } => {
            let group =
                groups::update_group(&ctx.db, me, &group_id, &name, description.as_deref(), image.as_deref()).await?;
            ctx.publish(&group_id, group_event(EventAction::Update, &group_id, Some(group.clone()))).await;
            to_value(group)
        }
        Request::DeleteGroup { group_id } => {
            let former = groups::delete_group(&ctx.db, me, &group_id).await?;
            ctx.publish_to(&former, group_event(EventAction::Delete, &group_id, None));
            Ok(json!({ "group_id": group_id }))
        }

        Request::ListMembers { group_id, page, limit } => {
            let page = validation::paginate(page, limit, MEMBERS_PAGE_LIMIT)?;
            to_value(groups::list_members(&ctx.db, me, &group_id, page).await?)
        }
        Request::AddMember { group_id, user_id } => {
            let added = groups::add_member(&ctx.db, me, &group_id, &user_id).await?;
            if added {
                let group = groups::group_info(&ctx.db, &group_id).await.ok();
                ctx.publish(&group_id, group_event(EventAction::Update, &group_id, group)).await;
            }
            Ok(json!({ "added": added }))
        }
        Request::EditMember { group_id, member_id, notify, nickname } => {
            groups::edit_member(&ctx.db, me, &group_id, &member_id, notify, nickname.as_deref()).await?;
            Ok(json!({ "group_id": group_id, "member_id": member_id }))
        }
        Request::RemoveMember { group_id, member_id } => {
            groups::remove_member(&ctx.db, me, &group_id, &member_id).await?;
            // the removed user is no longer a member, so tell them directly
            ctx.publish_to(std::slice::from_ref(&member_id), group_event(EventAction::Delete, &group_id, None));
            let group = groups::group_info(&ctx.db, &group_id).await.ok();
            ctx.publish(&group_id, group_event(EventAction::Update, &group_id, group)).await;
            Ok(json!({ "group_id": group_id, "member_id": member_id }))
        }
        Request::LeaveGroup { group_id } => {
            groups::leave_group(&ctx.db, me, &group_id).await?;
            let group = groups::group_info(&ctx.db, &group_id).await.ok();
            ctx.publish(&group_id, group_event(EventAction::Update, &group_id, group)).await;
            Ok(json!({ "group_id": group_id }))
        }

        Request::RequestToJoin { group_id } => {
            groups::request_to_join(&ctx.db, me, &group_id).await?;
            Ok(json!({ "group_id": group_id }))
        }
        Request::ListJoinRequests { group_id } => to_value(groups::list_join_requests(&ctx.db, me, &group_id).await?),
        Request::MarkJoinRequestsRead { group_id } => {
            let marked = match groups::mark_join_requests_read(&ctx.db, me, &group_id).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("[DISPATCH] Marking join requests of {} as read failed: {}", group_id, e);
                    0
                }
            };
            Ok(json!({ "marked": marked }))
        }
        Request::ApproveJoinRequest { group_id, requester_id } => {
            groups::approve_join_request(&ctx.db, me, &group_id, &requester_id).await?;
            let group = groups::group_info(&ctx.db, &group_id).await.ok();
            ctx.publish(&group_id, group_event(EventAction::Update, &group_id, group)).await;
            Ok(json!({ "group_id": group_id, "member_id": requester_id }))
        }
        Request::CancelJoinRequest { group_id, requester_id } => {
            groups::cancel_join_request(&ctx.db, me, &group_id, &requester_id).await?;
            Ok(json!({ "group_id": group_id, "requester_id": requester_id }))
        }

        Request::InviteMember { group_id, email } => {
            let invitation = invitations::invite_member(&ctx.db, me, &group_id, &email).await?;
            let link = mailer::invite_link(&ctx.config.invite_base_url, &invitation.group_id, &invitation.id);
            let sender = ctx.mailer.clone();
            let to = invitation.receiver_email.clone();
            tokio::spawn(async move {
                if let Err(e) = sender.send_invitation(&to, &link).await {
                    warn!("[MAIL] Invitation to {} not delivered: {}", to, e);
                }
            });
            to_value(invitation)
        }
        Request::AcceptInvitation { invitation_id } => {
            let (group_id, joined) = invitations::accept_invitation(&ctx.db, me, &invitation_id).await?;
            if joined {
                let group = groups::group_info(&ctx.db, &group_id).await.ok();
                ctx.publish(&group_id, group_event(EventAction::Update, &group_id, group)).await;
            }
            Ok(json!({ "group_id": group_id, "joined": joined }))
        }

        Request::ListMessages { group_id, page, limit } => {
            let page = validation::paginate(page, limit, MESSAGES_PAGE_LIMIT)?;
            to_value(messages::list_messages(&ctx.db, me, &group_id, page).await?)
        }
        Request::SendMessage { group_id, content, kind, file_name } => {
            let (message, last) =
                messages::append_message(&ctx.db, me, &group_id, &content, kind, file_name.as_deref()).await?;
            let event = ServerEvent::Message {
                action: EventAction::Send,
                group_id: group_id.clone(),
                message_id: message.id,
                message: Some(message.clone()),
                last_message: Some(last),
            };
            ctx.publish(&group_id, event).await;
            to_value(message)
        }
        Request::EditMessage { message_id, content } => {
            let message = messages::edit_message(&ctx.db, me, message_id, &content).await?;
            let event = ServerEvent::Message {
                action: EventAction::Update,
                group_id: message.group_id.clone(),
                message_id,
                message: Some(message.clone()),
                last_message: None,
            };
            ctx.publish(&message.group_id, event).await;
            to_value(message)
        }
        Request::DeleteMessage { message_id } => {
            let deletion = messages::delete_message(&ctx.db, me, message_id).await?;
            let group_id = deletion.message.group_id.clone();
            let event = ServerEvent::Message {
                action: EventAction::Delete,
                group_id: group_id.clone(),
                message_id,
                message: None,
                last_message: deletion.last_message.clone(),
            };
            ctx.publish(&group_id, event).await;
            Ok(json!({
                "message_id": message_id,
                "group_id": group_id,
                "last_message_changed": deletion.last_message_changed,
                "last_message": deletion.last_message,
            }))
        }
        Request::MarkRead { group_id } => {
            let marked = messages::mark_read(&ctx.db, me, &group_id).await?;
            Ok(json!({ "group_id": group_id, "marked": marked }))
        }
    }
}
