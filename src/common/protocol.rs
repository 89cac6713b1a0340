// JSON frames exchanged over the WebSocket endpoint
use serde::{Deserialize, Serialize};

use crate::common::errors::{ChatError, FieldError};
use crate::common::models::{Group, GroupId, LastMessage, Message, MessageId, MessageKind, UserId};

/// First frame a client must send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "auth")]
pub struct AuthMessage {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "auth_response")]
pub struct AuthResponse {
    pub success: bool,
    pub user_id: Option<UserId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    // Directory
    Me,
    UpdateProfile { name: String, email: String, avatar: Option<String> },
    FindUser { email: String },

    // Groups
    ListGroups { page: Option<u32>, limit: Option<u32> },
    CreateGroup { name: String, description: Option<String>, image: Option<String> },
    GroupInfo { group_id: GroupId },
    UpdateGroup { group_id: GroupId, name: String, description: Option<String>, image: Option<String> },
    DeleteGroup { group_id: GroupId },

    // Membership
    ListMembers { group_id: GroupId, page: Option<u32>, limit: Option<u32> },
    AddMember { group_id: GroupId, user_id: UserId },
    EditMember { group_id: GroupId, member_id: UserId, notify: Option<bool>, nickname: Option<String> },
    RemoveMember { group_id: GroupId, member_id: UserId },
    LeaveGroup { group_id: GroupId },

    // Join requests
    RequestToJoin { group_id: GroupId },
    ListJoinRequests { group_id: GroupId },
    MarkJoinRequestsRead { group_id: GroupId },
    ApproveJoinRequest { group_id: GroupId, requester_id: UserId },
    CancelJoinRequest { group_id: GroupId, requester_id: UserId },

    // Invitations
    InviteMember { group_id: GroupId, email: String },
    AcceptInvitation { invitation_id: String },

    // Messages
    ListMessages { group_id: GroupId, page: Option<u32>, limit: Option<u32> },
    SendMessage { group_id: GroupId, content: String, kind: Option<MessageKind>, file_name: Option<String> },
    EditMessage { message_id: MessageId, content: String },
    DeleteMessage { message_id: MessageId },
    MarkRead { group_id: GroupId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldErrorBody>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldErrorBody {
    pub field: String,
    pub message: String,
}

impl From<&FieldError> for FieldErrorBody {
    fn from(f: &FieldError) -> Self {
        Self { field: f.field.to_string(), message: f.message.clone() }
    }
}

// Only the code and status class leave the server
impl From<&ChatError> for ErrorBody {
    fn from(e: &ChatError) -> Self {
        Self {
            code: e.code().to_string(),
            status: e.status(),
            fields: e.fields().map(|fs| fs.iter().map(FieldErrorBody::from).collect()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "reply")]
pub struct Reply {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self { id, ok: true, result: Some(result), error: None }
    }

    pub fn failure(id: u64, error: &ChatError) -> Self {
        Self { id, ok: false, result: None, error: Some(ErrorBody::from(error)) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Send,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Online,
    Offline,
}

/// Real-time events pushed to connected users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Message {
        action: EventAction,
        group_id: GroupId,
        message_id: MessageId,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_message: Option<LastMessage>,
    },
    Group {
        action: EventAction,
        group_id: GroupId,
        #[serde(skip_serializing_if = "Option::is_none")]
        group: Option<Group>,
    },
    UserStatus {
        user_id: UserId,
        action: PresenceAction,
    },
}
