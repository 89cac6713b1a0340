//! Pure validation functions, one per request shape.
//!
//! Each function trims and bounds its input and returns either the normalized value or every
//! field error found, so callers can report all problems at once. Field errors carry a
//! translatable key, never display text.

use validator::{ValidateEmail, ValidateLength};

use crate::common::errors::{
    ChatError, ChatResult, FieldError, FIELD_NOT_ALLOWED, FIELD_REQUIRED, FIELD_TOO_LONG, INVALID_EMAIL,
    INVALID_LIMIT, INVALID_MESSAGE_TYPE, INVALID_PAGE,
};
use crate::common::models::MessageKind;

pub const MAX_GROUP_NAME: usize = 100;
pub const MAX_DESCRIPTION: usize = 500;
pub const MAX_CONTENT: usize = 500;
pub const MAX_FILE_NAME: usize = 100;
pub const MAX_NICKNAME: usize = 50;
pub const MAX_USER_NAME: usize = 100;
pub const MAX_PAGE_LIMIT: u32 = 100;

pub const GROUPS_PAGE_LIMIT: u32 = 5;
pub const MEMBERS_PAGE_LIMIT: u32 = 10;
pub const MESSAGES_PAGE_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfoInput {
    pub name: String,
    pub description: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInput {
    pub content: String,
    pub kind: MessageKind,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfoInput {
    pub notify: Option<bool>,
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileInput {
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Pagination {
    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.limit as i64
    }
}

fn finish<T>(value: T, errors: Vec<FieldError>) -> ChatResult<T> {
    if errors.is_empty() {
        Ok(value)
    } else {
        Err(ChatError::Validation(errors))
    }
}

// Empty-after-trim optionals collapse to None
fn optional(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn check_len(errors: &mut Vec<FieldError>, field: &'static str, value: &str, max: usize) {
    // counts chars, not bytes
    if !value.validate_length(None, Some(max as u64), None) {
        errors.push(FieldError::new(field, FIELD_TOO_LONG));
    }
}

pub fn group_info(name: &str, description: Option<&str>, image: Option<&str>) -> ChatResult<GroupInfoInput> {
    let mut errors = Vec::new();
    let name = name.trim().to_string();
    if name.is_empty() {
        errors.push(FieldError::new("name", FIELD_REQUIRED));
    }
    check_len(&mut errors, "name", &name, MAX_GROUP_NAME);
    let description = optional(description);
    if let Some(d) = &description {
        check_len(&mut errors, "description", d, MAX_DESCRIPTION);
    }
    finish(GroupInfoInput { name, description, image: optional(image) }, errors)
}

pub fn message_content(content: &str, kind: Option<MessageKind>, file_name: Option<&str>) -> ChatResult<MessageInput> {
    let mut errors = Vec::new();
    let content = content.trim().to_string();
    if content.is_empty() {
        errors.push(FieldError::new("content", FIELD_REQUIRED));
    }
    check_len(&mut errors, "content", &content, MAX_CONTENT);

    let kind = kind.unwrap_or(MessageKind::Text);
    if kind == MessageKind::System {
        errors.push(FieldError::new("type", INVALID_MESSAGE_TYPE));
    }
    let file_name = optional(file_name);
    if let Some(f) = &file_name {
        check_len(&mut errors, "file_name", f, MAX_FILE_NAME);
        if kind == MessageKind::Text {
            errors.push(FieldError::new("file_name", FIELD_NOT_ALLOWED));
        }
    }
    finish(MessageInput { content, kind, file_name }, errors)
}

/// Content of an edit; the kind of an existing message never changes.
pub fn edited_content(content: &str) -> ChatResult<String> {
    message_content(content, None, None).map(|m| m.content)
}

pub fn member_info(notify: Option<bool>, nickname: Option<&str>) -> ChatResult<MemberInfoInput> {
    let mut errors = Vec::new();
    let nickname = optional(nickname);
    if let Some(n) = &nickname {
        check_len(&mut errors, "nickname", n, MAX_NICKNAME);
    }
    finish(MemberInfoInput { notify, nickname }, errors)
}

pub fn profile(name: &str, email: &str, avatar: Option<&str>) -> ChatResult<ProfileInput> {
    let mut errors = Vec::new();
    let name = name.trim().to_string();
    if name.is_empty() {
        errors.push(FieldError::new("name", FIELD_REQUIRED));
    }
    check_len(&mut errors, "name", &name, MAX_USER_NAME);
    let email = email.trim().to_lowercase();
    if !email.validate_email() {
        errors.push(FieldError::new("email", INVALID_EMAIL));
    }
    finish(ProfileInput { name, email, avatar: optional(avatar) }, errors)
}

pub fn email(raw: &str) -> ChatResult<String> {
    let email = raw.trim().to_lowercase();
    if email.validate_email() {
        Ok(email)
    } else {
        Err(ChatError::validation("email", INVALID_EMAIL))
    }
}

pub fn paginate(page: Option<u32>, limit: Option<u32>, default_limit: u32) -> ChatResult<Pagination> {
    let mut errors = Vec::new();
    let page = page.unwrap_or(1);
    if page == 0 {
        errors.push(FieldError::new("page", INVALID_PAGE));
    }
    let limit = limit.unwrap_or(default_limit);
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        errors.push(FieldError::new("limit", INVALID_LIMIT));
    }
    finish(Pagination { page, limit }, errors)
}
