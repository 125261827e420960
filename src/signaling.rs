use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};
use crate::room::{now_millis, MediaStatus, ParticipantSummary};
use crate::store::RoomStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Delivery instruction handed back to the transport layer: forward the
/// untouched payload to this connection.
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub room_id: String,
    pub sender_name: String,
    pub target_conn_id: String,
}

/// Opaque WebRTC signaling relay. SDP and ICE payloads are never inspected;
/// the relay only proves that sender and target share a room and that the
/// target has a live connection to deliver to.
pub struct SignalingRelay {
    store: Arc<RoomStore>,
}

impl SignalingRelay {
    pub fn new(store: Arc<RoomStore>) -> Self {
        SignalingRelay { store }
    }

    pub async fn relay(
        &self,
        sender_conn_id: &str,
        target_conn_id: &str,
        kind: SignalKind,
    ) -> Result<RelayOutcome> {
        let (room, room_id) = self.store.membership(sender_conn_id).await?;
        let mut state = room.state.lock().await;

        let deliverable = state
            .participants
            .get(target_conn_id)
            .is_some_and(|target| target.connected);
        if !deliverable {
            return Err(CoordinatorError::TargetNotInRoom);
        }
        let sender = state
            .participants
            .get_mut(sender_conn_id)
            .ok_or(CoordinatorError::NotInRoom)?;
        sender.last_seen = now_millis();
        let sender_name = sender.name.clone();
        state.last_activity = Instant::now();
        drop(state);

        log::debug!("relaying {kind:?} from {sender_name} to {target_conn_id} in {room_id}");
        Ok(RelayOutcome {
            room_id,
            sender_name,
            target_conn_id: target_conn_id.to_string(),
        })
    }

    /// Apply a media-status change to the sender's record; the caller
    /// broadcasts the refreshed participant list as `media-status-changed`.
    pub async fn update_media_status(
        &self,
        conn_id: &str,
        media: MediaStatus,
    ) -> Result<(String, Vec<ParticipantSummary>)> {
        self.store.set_media_status(conn_id, media).await
    }
}
