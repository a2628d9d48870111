// src/presence.rs
//! Per-session broadcast of typing, membership and new-message events.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::chat::Message;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    Joined { user_id: Uuid },
    Left { user_id: Uuid },
    Typing { user_id: Uuid, is_typing: bool },
    Message { message: Message },
}

struct Channel {
    sender: broadcast::Sender<PresenceEvent>,
    members: usize,
}

#[derive(Default)]
pub struct PresenceHub {
    channels: Mutex<HashMap<Uuid, Channel>>,
}

impl PresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the session's channel, creating it on first use. Other members
    /// see `Joined`; dropping the membership announces `Left`.
    pub fn join(self: &Arc<Self>, session_id: Uuid, user_id: Uuid) -> Membership {
        let receiver = {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            let channel = channels.entry(session_id).or_insert_with(|| Channel {
                sender: broadcast::channel(CHANNEL_CAPACITY).0,
                members: 0,
            });
            channel.members += 1;
            let _ = channel.sender.send(PresenceEvent::Joined { user_id });
            channel.sender.subscribe()
        };

        tracing::debug!(%session_id, %user_id, "joined presence channel");
        Membership {
            hub: Arc::clone(self),
            session_id,
            user_id,
            receiver,
        }
    }

    /// Sends `event` to every member of the session. Returns how many
    /// receivers got it; zero when nobody is listening.
    pub fn publish(&self, session_id: Uuid, event: PresenceEvent) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(&session_id)
            .and_then(|c| c.sender.send(event).ok())
            .unwrap_or(0)
    }

    pub fn member_count(&self, session_id: Uuid) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(&session_id).map_or(0, |c| c.members)
    }

    fn leave(&self, session_id: Uuid, user_id: Uuid) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(channel) = channels.get_mut(&session_id) {
            channel.members = channel.members.saturating_sub(1);
            if channel.members == 0 {
                channels.remove(&session_id);
            } else {
                let _ = channel.sender.send(PresenceEvent::Left { user_id });
            }
        }
        tracing::debug!(%session_id, %user_id, "left presence channel");
    }
}

/// A live subscription to one session's channel.
pub struct Membership {
    hub: Arc<PresenceHub>,
    session_id: Uuid,
    user_id: Uuid,
    receiver: broadcast::Receiver<PresenceEvent>,
}

impl Membership {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn typing(&self, is_typing: bool) {
        self.hub.publish(
            self.session_id,
            PresenceEvent::Typing {
                user_id: self.user_id,
                is_typing,
            },
        );
    }

    /// Next event from another member. Events this member caused are
    /// skipped, as are events lost when the receiver lagged behind.
    pub async fn recv(&mut self) -> Option<PresenceEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(PresenceEvent::Joined { user_id })
                | Ok(PresenceEvent::Left { user_id })
                | Ok(PresenceEvent::Typing { user_id, .. })
                    if user_id == self.user_id =>
                {
                    continue
                }
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(session_id = %self.session_id, skipped, "presence receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.hub.leave(self.session_id, self.user_id);
    }
}
