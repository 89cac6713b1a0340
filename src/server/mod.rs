pub mod auth;
pub mod config;
pub mod connection;
pub mod database;
pub mod groups;
pub mod handlers;
pub mod invitations;
pub mod mailer;
pub mod messages;
pub mod presence;
pub mod users;
pub mod websocket;
