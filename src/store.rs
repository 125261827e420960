use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::config::ServerConfig;
use crate::error::{CoordinatorError, Result};
use crate::repository::{ParticipantRecord, RoomRecord, RoomRepository, SystemStats};
use crate::room::{
    now_millis, IssuedToken, MediaStatus, Participant, ParticipantSummary, Room, RoomConfig,
    RoomInfo, RoomState,
};
use crate::validation;

/// Result of a successful create/join/reconnect. The token is the secret for
/// the joining connection only; it must never be broadcast.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room_id: String,
    pub participant: ParticipantSummary,
    pub token: String,
    pub is_reconnection: bool,
    pub participants: Vec<ParticipantSummary>,
    pub max_participants: usize,
    pub created_at: u64,
}

#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub room_id: String,
    pub name: String,
    pub participants: Vec<ParticipantSummary>,
    pub room_removed: bool,
}

#[derive(Debug, Clone)]
pub struct DisconnectOutcome {
    pub room_id: String,
    pub name: String,
    pub participants: Vec<ParticipantSummary>,
}

/// Authoritative in-process room state. The outer map lock is held only for
/// lookups and room insertion/removal; every mutation of a room's contents
/// happens under that room's own state mutex (room-scoped exclusion).
///
/// Lock order: map before state, never the reverse. The connection index
/// is always acquired on its own.
pub struct RoomStore {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Live connection id -> room id, enforcing one room per connection.
    connections: RwLock<HashMap<String, String>>,
    repository: Arc<dyn RoomRepository>,
    config: ServerConfig,
}

impl RoomStore {
    pub fn new(config: ServerConfig, repository: Arc<dyn RoomRepository>) -> Self {
        RoomStore {
            rooms: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            repository,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn repository(&self) -> Arc<dyn RoomRepository> {
        Arc::clone(&self.repository)
    }

    pub async fn create_room(
        &self,
        conn_id: &str,
        room_id: Option<String>,
        creator_name: &str,
        max_participants: Option<usize>,
        timeout_ms: Option<u64>,
    ) -> Result<JoinOutcome> {
        let name = validation::validate_username(creator_name)?;
        let room_id = match room_id {
            Some(id) => {
                validation::validate_room_id(&id)?;
                id
            }
            None => validation::generate_room_id(),
        };
        let max = max_participants.unwrap_or(self.config.default_max_participants);
        validation::validate_max_participants(max)?;
        let timeout_ms =
            timeout_ms.unwrap_or(self.config.default_room_timeout.as_millis() as u64);
        validation::validate_timeout_ms(timeout_ms)?;

        self.ensure_unbound(conn_id).await?;

        let room = Arc::new(Room::new(
            room_id.clone(),
            name.clone(),
            RoomConfig {
                max_participants: max,
                timeout: std::time::Duration::from_millis(timeout_ms),
            },
        ));
        let token = validation::generate_reconnection_token();
        let participant = new_participant(conn_id, &name, true, &token);
        let summary = participant.summary();
        let participants;
        let created_at = room.created_at;
        {
            // Creator is seated before the room becomes visible to joins.
            let mut state = room.state.lock().await;
            state
                .participants
                .insert(conn_id.to_string(), participant);
            participants = state.snapshot();
        }

        {
            let mut rooms = self.rooms.write().await;
            match rooms.get(&room_id) {
                Some(existing) => {
                    // An inactive room awaiting sweep may be replaced.
                    let active = existing.state.lock().await.active;
                    if active {
                        return Err(CoordinatorError::RoomIdTaken(room_id));
                    }
                    rooms.insert(room_id.clone(), Arc::clone(&room));
                }
                None => {
                    rooms.insert(room_id.clone(), Arc::clone(&room));
                }
            }
        }
        self.connections
            .write()
            .await
            .insert(conn_id.to_string(), room_id.clone());

        self.mirror_room(&room_id, created_at, timeout_ms, true, 1);
        self.mirror_participant(&room_id, conn_id, &name, true);
        log::info!("room {room_id} created by {name}");

        Ok(JoinOutcome {
            room_id,
            participant: summary,
            token,
            is_reconnection: false,
            participants,
            max_participants: max,
            created_at,
        })
    }

    /// Join a room, optionally resuming a disconnected identity when a
    /// valid, unexpired reconnection token is presented. An unusable token
    /// falls back to a fresh join; `reconnect` is the strict variant.
    pub async fn join(
        &self,
        conn_id: &str,
        room_id: &str,
        user_name: &str,
        token: Option<&str>,
    ) -> Result<JoinOutcome> {
        let name = validation::validate_username(user_name)?;
        self.ensure_unbound(conn_id).await?;
        let room = self.room_or_not_found(room_id).await?;

        let new_token = validation::generate_reconnection_token();
        let mut state = room.state.lock().await;
        // The sweeper may have detached this room between lookup and lock.
        if state.reclaimed {
            return Err(CoordinatorError::RoomNotFound(room_id.to_string()));
        }

        let resumable = token
            .filter(|t| validation::is_valid_token_format(t))
            .and_then(|t| find_reconnect_slot(&state, t, &self.config).ok().flatten());

        let (summary, is_reconnection) = if let Some(old_conn_id) = resumable {
            (
                resume_participant(&mut state, &old_conn_id, conn_id, &new_token),
                true,
            )
        } else {
            // Capacity check and insertion are atomic under the room lock;
            // disconnected participants keep their slot until timeout.
            if state.participants.len() >= room.config.max_participants {
                return Err(CoordinatorError::RoomFull);
            }
            let participant = new_participant(conn_id, &name, false, &new_token);
            let summary = participant.summary();
            state.participants.insert(conn_id.to_string(), participant);
            (summary, false)
        };

        state.active = true;
        state.last_activity = Instant::now();
        let participants = state.snapshot();
        let count = state.participants.len();
        drop(state);

        self.connections
            .write()
            .await
            .insert(conn_id.to_string(), room_id.to_string());
        self.mirror_participant(room_id, conn_id, &summary.name, true);
        self.mirror_touch(room_id, count);

        Ok(JoinOutcome {
            room_id: room_id.to_string(),
            participant: summary,
            token: new_token,
            is_reconnection,
            participants,
            max_participants: room.config.max_participants,
            created_at: room.created_at,
        })
    }

    /// Strict token-based rejoin: fails rather than falling back to a fresh
    /// join, and always rotates the token so the old one cannot be replayed.
    pub async fn reconnect(&self, conn_id: &str, room_id: &str, token: &str) -> Result<JoinOutcome> {
        self.ensure_unbound(conn_id).await?;
        if !validation::is_valid_token_format(token) {
            return Err(CoordinatorError::InvalidToken);
        }
        let room = self.room_or_not_found(room_id).await?;

        let new_token = validation::generate_reconnection_token();
        let mut state = room.state.lock().await;
        if state.reclaimed {
            return Err(CoordinatorError::RoomNotFound(room_id.to_string()));
        }
        let old_conn_id = find_reconnect_slot(&state, token, &self.config)?
            .ok_or(CoordinatorError::InvalidToken)?;
        let summary = resume_participant(&mut state, &old_conn_id, conn_id, &new_token);
        state.active = true;
        state.last_activity = Instant::now();
        let participants = state.snapshot();
        let count = state.participants.len();
        drop(state);

        self.connections
            .write()
            .await
            .insert(conn_id.to_string(), room_id.to_string());
        self.mirror_participant(room_id, conn_id, &summary.name, true);
        self.mirror_touch(room_id, count);
        log::info!("participant {} reconnected to {room_id}", summary.name);

        Ok(JoinOutcome {
            room_id: room_id.to_string(),
            participant: summary,
            token: new_token,
            is_reconnection: true,
            participants,
            max_participants: room.config.max_participants,
            created_at: room.created_at,
        })
    }

    /// Explicit, final departure. The participant record and its token are
    /// dropped; an empty room is flagged inactive for the sweeper unless
    /// `immediate_empty_room_eviction` removes it synchronously.
    pub async fn leave(&self, conn_id: &str) -> Result<LeaveOutcome> {
        let room_id = self
            .find_room_by_connection(conn_id)
            .await
            .ok_or(CoordinatorError::NotInRoom)?;
        let room = self.room_or_not_found(&room_id).await?;

        let mut state = room.state.lock().await;
        let Some(removed) = state.participants.remove(conn_id) else {
            return Err(CoordinatorError::NotInRoom);
        };
        state.typing.remove(&removed.name);
        state.last_activity = Instant::now();
        let now_empty = state.participants.is_empty();
        if now_empty {
            state.active = false;
        }
        let participants = state.snapshot();
        let count = state.participants.len();
        drop(state);

        self.connections.write().await.remove(conn_id);
        self.mirror_remove_participant(&room_id, conn_id);
        self.mirror_touch(&room_id, count);

        let mut room_removed = false;
        if now_empty {
            if self.config.immediate_empty_room_eviction {
                room_removed = self.remove_room_if_reclaimable(&room_id).await;
            } else {
                let repo = self.repository();
                let id = room_id.clone();
                self.spawn_mirror("mark_room_inactive", async move {
                    repo.mark_room_inactive(&id).await
                });
            }
        }

        Ok(LeaveOutcome {
            room_id,
            name: removed.name,
            participants,
            room_removed,
        })
    }

    /// Transport-level drop. The participant keeps its identity slot and
    /// token so it can resume within the token window; only the connectivity
    /// flag changes.
    pub async fn mark_disconnected(&self, conn_id: &str) -> Option<DisconnectOutcome> {
        let room_id = self.connections.write().await.remove(conn_id)?;
        let room = self.get_room(&room_id).await?;

        let mut state = room.state.lock().await;
        let participant = state.participants.get_mut(conn_id)?;
        participant.connected = false;
        let name = participant.name.clone();
        state.typing.remove(&name);
        let participants = state.snapshot();
        drop(state);

        self.mirror_participant_connected(&room_id, conn_id, false);
        log::info!("participant {name} disconnected from {room_id} (recoverable)");

        Some(DisconnectOutcome {
            room_id,
            name,
            participants,
        })
    }

    pub async fn touch_activity(&self, room_id: &str) {
        if let Some(room) = self.get_room(room_id).await {
            let mut state = room.state.lock().await;
            state.last_activity = Instant::now();
            let count = state.participants.len();
            drop(state);
            self.mirror_touch(room_id, count);
        }
    }

    /// Heartbeat: bump the participant's last-seen and the room clock.
    pub async fn heartbeat(&self, conn_id: &str) -> Result<()> {
        let (room, _room_id) = self.membership(conn_id).await?;
        let mut state = room.state.lock().await;
        if let Some(p) = state.participants.get_mut(conn_id) {
            p.last_seen = now_millis();
        }
        state.last_activity = Instant::now();
        Ok(())
    }

    pub async fn find_room_by_connection(&self, conn_id: &str) -> Option<String> {
        self.connections.read().await.get(conn_id).cloned()
    }

    pub async fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Resolve a connection to its room or fail with `NotInRoom`.
    pub async fn membership(&self, conn_id: &str) -> Result<(Arc<Room>, String)> {
        let room_id = self
            .find_room_by_connection(conn_id)
            .await
            .ok_or(CoordinatorError::NotInRoom)?;
        let room = self.room_or_not_found(&room_id).await?;
        Ok((room, room_id))
    }

    pub async fn snapshot_participants(&self, room_id: &str) -> Result<Vec<ParticipantSummary>> {
        let room = self.room_or_not_found(room_id).await?;
        let state = room.state.lock().await;
        Ok(state.snapshot())
    }

    pub async fn room_info(&self, room_id: &str) -> Result<RoomInfo> {
        let room = self.room_or_not_found(room_id).await?;
        let state = room.state.lock().await;
        Ok(RoomInfo {
            id: room.id.clone(),
            creator_name: room.creator_name.clone(),
            created_at: room.created_at,
            max_participants: room.config.max_participants,
            participants: state.snapshot(),
        })
    }

    /// Apply a media-status change to the sender's own record.
    pub async fn set_media_status(
        &self,
        conn_id: &str,
        media: MediaStatus,
    ) -> Result<(String, Vec<ParticipantSummary>)> {
        let (room, room_id) = self.membership(conn_id).await?;
        let mut state = room.state.lock().await;
        let participant = state
            .participants
            .get_mut(conn_id)
            .ok_or(CoordinatorError::NotInRoom)?;
        participant.media = media;
        participant.last_seen = now_millis();
        state.last_activity = Instant::now();
        Ok((room_id, state.snapshot()))
    }

    /// Compare-and-delete for the sweeper (and for immediate eviction):
    /// re-verifies under the room lock that the room is still empty, flagged
    /// inactive, or stale before removing it. A join that landed since the
    /// caller's scan makes this a no-op.
    pub async fn remove_room_if_reclaimable(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id).cloned() else {
            return false;
        };
        let mut state = room.state.lock().await;
        let stale = state.last_activity.elapsed() > room.config.timeout;
        if !(state.participants.is_empty() || !state.active || stale) {
            return false;
        }
        // Flag before detaching so a join holding the old Arc fails instead
        // of seating a participant in a room no longer in the map.
        state.reclaimed = true;
        let conn_ids: Vec<String> = state.participants.keys().cloned().collect();
        drop(state);
        rooms.remove(room_id);
        drop(rooms);

        if !conn_ids.is_empty() {
            let mut connections = self.connections.write().await;
            for id in &conn_ids {
                connections.remove(id);
            }
        }
        let repo = self.repository();
        let id = room_id.to_string();
        self.spawn_mirror("remove_room", async move { repo.remove_room(&id).await });
        log::info!("room {room_id} reclaimed");
        true
    }

    /// Store-side stats, used when the repository aggregate is unavailable.
    pub async fn stats(&self) -> SystemStats {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut stats = SystemStats::default();
        for room in rooms {
            let state = room.state.lock().await;
            if state.active {
                stats.active_rooms += 1;
            }
            stats.total_participants += state.participants.len();
        }
        stats
    }

    async fn room_or_not_found(&self, room_id: &str) -> Result<Arc<Room>> {
        self.get_room(room_id)
            .await
            .ok_or_else(|| CoordinatorError::RoomNotFound(room_id.to_string()))
    }

    /// One room per connection: a bound connection must leave first.
    async fn ensure_unbound(&self, conn_id: &str) -> Result<()> {
        match self.find_room_by_connection(conn_id).await {
            Some(existing) => Err(CoordinatorError::AlreadyInRoom(existing)),
            None => Ok(()),
        }
    }

    // Write-behind mirroring. Failures are logged, never surfaced: the
    // in-memory store is authoritative and repository lag is acceptable.
    fn spawn_mirror<F>(&self, what: &'static str, fut: F)
    where
        F: std::future::Future<Output = crate::repository::RepoResult<()>> + Send + 'static,
    {
        let timeout = self.config.repository_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("repository {what} failed: {e}"),
                Err(_) => log::warn!("repository {what} timed out"),
            }
        });
    }

    fn mirror_room(
        &self,
        room_id: &str,
        created_at: u64,
        timeout_ms: u64,
        is_active: bool,
        participant_count: usize,
    ) {
        let repo = self.repository();
        let record = RoomRecord {
            room_id: room_id.to_string(),
            created_at,
            last_activity: now_millis(),
            is_active,
            timeout_ms,
            participant_count,
        };
        self.spawn_mirror("record_room", async move { repo.record_room(record).await });
    }

    fn mirror_participant(&self, room_id: &str, conn_id: &str, name: &str, connected: bool) {
        let repo = self.repository();
        let record = ParticipantRecord {
            room_id: room_id.to_string(),
            connection_id: conn_id.to_string(),
            name: name.to_string(),
            connected,
        };
        self.spawn_mirror("record_participant", async move {
            repo.record_participant(record).await
        });
    }

    fn mirror_participant_connected(&self, room_id: &str, conn_id: &str, connected: bool) {
        let repo = self.repository();
        let room_id = room_id.to_string();
        let conn_id = conn_id.to_string();
        self.spawn_mirror("record_participant", async move {
            let existing = repo.get_room_snapshot(&room_id).await?;
            let Some(snapshot) = existing else {
                return Ok(());
            };
            let Some(record) = snapshot
                .participants
                .into_iter()
                .find(|p| p.connection_id == conn_id)
            else {
                return Ok(());
            };
            repo.record_participant(ParticipantRecord { connected, ..record })
                .await
        });
    }

    fn mirror_remove_participant(&self, room_id: &str, conn_id: &str) {
        let repo = self.repository();
        let room_id = room_id.to_string();
        let conn_id = conn_id.to_string();
        self.spawn_mirror("remove_participant", async move {
            repo.remove_participant(&room_id, &conn_id).await
        });
    }

    fn mirror_touch(&self, room_id: &str, participant_count: usize) {
        let repo = self.repository();
        let room_id = room_id.to_string();
        self.spawn_mirror("touch_room", async move {
            repo.touch_room(&room_id, now_millis(), participant_count).await
        });
    }
}

fn new_participant(conn_id: &str, name: &str, is_creator: bool, token: &str) -> Participant {
    let now = now_millis();
    Participant {
        connection_id: conn_id.to_string(),
        name: name.to_string(),
        is_creator,
        joined_at: now,
        last_seen: now,
        connected: true,
        token: Some(IssuedToken {
            token: token.to_string(),
            issued_at: Instant::now(),
        }),
        media: MediaStatus::default(),
    }
}

/// Locate the disconnected participant a token resumes. `Ok(None)` means no
/// matching token (a fresh join may proceed); `TokenExpired` means the match
/// exists but fell outside the validity window; a token still bound to a
/// connected participant is treated as invalid (replay of a rotated token).
fn find_reconnect_slot(
    state: &RoomState,
    token: &str,
    config: &ServerConfig,
) -> Result<Option<String>> {
    for participant in state.participants.values() {
        let Some(issued) = &participant.token else {
            continue;
        };
        if issued.token != token {
            continue;
        }
        if participant.connected {
            return Err(CoordinatorError::InvalidToken);
        }
        if issued.is_expired(config.token_ttl) {
            return Err(CoordinatorError::TokenExpired);
        }
        return Ok(Some(participant.connection_id.clone()));
    }
    Ok(None)
}

/// Rebind a disconnected participant to a new connection id, preserving its
/// identity (name, creator flag, original join time) and rotating the token.
fn resume_participant(
    state: &mut RoomState,
    old_conn_id: &str,
    new_conn_id: &str,
    new_token: &str,
) -> ParticipantSummary {
    let Some(mut participant) = state.participants.remove(old_conn_id) else {
        // Caller located the slot under this same lock; it cannot vanish.
        unreachable!("reconnect slot disappeared under room lock");
    };
    participant.connection_id = new_conn_id.to_string();
    participant.connected = true;
    participant.last_seen = now_millis();
    participant.token = Some(IssuedToken {
        token: new_token.to_string(),
        issued_at: Instant::now(),
    });
    let summary = participant.summary();
    state
        .participants
        .insert(new_conn_id.to_string(), participant);
    summary
}
