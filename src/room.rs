use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::chat::ChatMessage;

/// Milliseconds since the Unix epoch, used for all wire-visible timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaStatus {
    pub video: bool,
    pub audio: bool,
    pub screen_share: bool,
}

/// Reconnection token with its issue instant; validity is checked at lookup
/// time against the configured window, never by a background timer.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub issued_at: Instant,
}

impl IssuedToken {
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.issued_at.elapsed() > ttl
    }
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub connection_id: String,
    pub name: String,
    pub is_creator: bool,
    pub joined_at: u64,
    pub last_seen: u64,
    pub connected: bool,
    pub token: Option<IssuedToken>,
    pub media: MediaStatus,
}

impl Participant {
    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            connection_id: self.connection_id.clone(),
            name: self.name.clone(),
            is_creator: self.is_creator,
            connected: self.connected,
            media: self.media,
        }
    }
}

/// Wire-safe view of a participant, sent in room-updated broadcasts. The
/// reconnection token never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub connection_id: String,
    pub name: String,
    pub is_creator: bool,
    pub connected: bool,
    pub media: MediaStatus,
}

#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_participants: usize,
    pub timeout: Duration,
}

/// Mutable per-room state. One mutex guards the whole struct so every
/// mutation on a room is serialized; distinct rooms lock independently.
pub struct RoomState {
    pub participants: HashMap<String, Participant>,
    pub messages: Vec<ChatMessage>,
    /// Ids of messages already deleted, kept so re-deletes stay idempotent.
    pub deleted_messages: HashSet<String>,
    pub typing: HashSet<String>,
    pub last_activity: Instant,
    pub active: bool,
    /// Set under this lock when the room is detached from the store map.
    /// A caller that fetched the room before detachment sees the flag after
    /// acquiring the lock and must treat the room as gone.
    pub reclaimed: bool,
}

impl RoomState {
    /// Point-in-time participant list for broadcast, creator first then by
    /// join time so every member sees the same ordering.
    pub fn snapshot(&self) -> Vec<ParticipantSummary> {
        let mut list: Vec<&Participant> = self.participants.values().collect();
        list.sort_by(|a, b| {
            (!a.is_creator, a.joined_at, &a.connection_id)
                .cmp(&(!b.is_creator, b.joined_at, &b.connection_id))
        });
        list.into_iter().map(Participant::summary).collect()
    }
}

pub struct Room {
    pub id: String,
    pub creator_name: String,
    pub created_at: u64,
    pub config: RoomConfig,
    pub state: Mutex<RoomState>,
}

impl Room {
    pub fn new(id: String, creator_name: String, config: RoomConfig) -> Self {
        Room {
            id,
            creator_name,
            created_at: now_millis(),
            config,
            state: Mutex::new(RoomState {
                participants: HashMap::new(),
                messages: Vec::new(),
                deleted_messages: HashSet::new(),
                typing: HashSet::new(),
                last_activity: Instant::now(),
                active: true,
                reclaimed: false,
            }),
        }
    }
}

/// Room metadata returned by get-room-info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub creator_name: String,
    pub created_at: u64,
    pub max_participants: usize,
    pub participants: Vec<ParticipantSummary>,
}
