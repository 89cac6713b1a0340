use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::sync::mpsc::error::TrySendError;

use crate::common::errors::ChatResult;
use crate::common::models::UserId;
use crate::common::protocol::{PresenceAction, ServerEvent};
use crate::server::database::Database;
use crate::server::{groups, users};

#[derive(Clone)]
struct Channel {
    id: u64,
    tx: mpsc::Sender<ServerEvent>,
}

struct RouterInner {
    db: Database,
    // user_id -> one channel per live connection of that user
    channels: RwLock<HashMap<UserId, Vec<Channel>>>,
    // serializes online/offline flips so the persisted flag follows the last transition
    transitions: Mutex<()>,
    next_id: AtomicU64,
    buffer: usize,
}

/// A registered connection; events for its user arrive on `events`.
pub struct Connection {
    pub id: u64,
    pub user_id: UserId,
    pub events: mpsc::Receiver<ServerEvent>,
}

/// Registry of connected users and best-effort event fan-out.
///
/// Delivery never blocks: a full or closed channel just misses the event, and an offline
/// user catches up by listing the group later.
#[derive(Clone)]
pub struct PresenceRouter {
    inner: Arc<RouterInner>,
}

impl PresenceRouter {
    pub fn new(db: Database, buffer: usize) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                db,
                channels: RwLock::new(HashMap::new()),
                transitions: Mutex::new(()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Registers a connection. The user's first connection marks them online and tells
    /// everyone else.
    pub async fn connect(&self, user_id: &str) -> Connection {
        let _gate = self.inner.transitions.lock().await;
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let first = {
            let mut map = self.inner.channels.write().unwrap_or_else(PoisonError::into_inner);
            let list = map.entry(user_id.to_string()).or_default();
            list.push(Channel { id, tx });
            info!("[PRESENCE] Registered connection {} for user {} (total={})", id, user_id, list.len());
            list.len() == 1
        };

        if first {
            self.transition(user_id, true).await;
        }
        Connection { id, user_id: user_id.to_string(), events: rx }
    }

    /// Drops one connection. When it was the user's last, they go offline.
    pub async fn disconnect(&self, user_id: &str, connection_id: u64) {
        let _gate = self.inner.transitions.lock().await;
        let last = {
            let mut map = self.inner.channels.write().unwrap_or_else(PoisonError::into_inner);
            match map.get_mut(user_id) {
                Some(list) => {
                    list.retain(|c| c.id != connection_id);
                    info!("[PRESENCE] Unregistered connection {} for user {} (remaining={})", connection_id, user_id, list.len());
                    if list.is_empty() {
                        map.remove(user_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last {
            self.transition(user_id, false).await;
        }
    }

    async fn transition(&self, user_id: &str, online: bool) {
        if let Err(e) = users::set_online(&self.inner.db, user_id, online).await {
            warn!("[PRESENCE] Failed to persist online={} for {}: {}", online, user_id, e);
        }
        let action = if online { PresenceAction::Online } else { PresenceAction::Offline };
        let event = ServerEvent::UserStatus { user_id: user_id.to_string(), action };
        let delivered = self.broadcast_except(user_id, &event);
        debug!("[PRESENCE] {} is {:?}, told {} connections", user_id, action, delivered);
    }

    /// Delivers `event` to every live connection of each listed user. Returns how many
    /// connections accepted it.
    pub fn publish_to_users(&self, user_ids: &[UserId], event: &ServerEvent) -> usize {
        let targets: Vec<(UserId, Channel)> = {
            let map = self.inner.channels.read().unwrap_or_else(PoisonError::into_inner);
            user_ids
                .iter()
                .filter_map(|uid| map.get(uid).map(|list| (uid, list)))
                .flat_map(|(uid, list)| list.iter().map(move |c| (uid.clone(), c.clone())))
                .collect()
        };
        targets.iter().filter(|(uid, c)| deliver(c, uid, event)).count()
    }

    /// Sends to the group's current members that are online.
    pub async fn publish_group_event(&self, group_id: &str, event: &ServerEvent) -> ChatResult<usize> {
        let members = groups::member_ids(&self.inner.db, group_id).await?;
        Ok(self.publish_to_users(&members, event))
    }

    /// Sends to every connected user except `user_id`.
    pub fn broadcast_except(&self, user_id: &str, event: &ServerEvent) -> usize {
        let targets: Vec<(UserId, Channel)> = {
            let map = self.inner.channels.read().unwrap_or_else(PoisonError::into_inner);
            map.iter()
                .filter(|(uid, _)| uid.as_str() != user_id)
                .flat_map(|(uid, list)| list.iter().map(move |c| (uid.clone(), c.clone())))
                .collect()
        };
        targets.iter().filter(|(uid, c)| deliver(c, uid, event)).count()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        let map = self.inner.channels.read().unwrap_or_else(PoisonError::into_inner);
        map.get(user_id).map_or(false, |list| !list.is_empty())
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        let map = self.inner.channels.read().unwrap_or_else(PoisonError::into_inner);
        map.get(user_id).map(|list| list.len()).unwrap_or(0)
    }
}

fn deliver(channel: &Channel, user_id: &str, event: &ServerEvent) -> bool {
    match channel.tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("[PRESENCE] Queue full for connection {} of {}, event dropped", channel.id, user_id);
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!("[PRESENCE] Connection {} of {} already closed", channel.id, user_id);
            false
        }
    }
}
