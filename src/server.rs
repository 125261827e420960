use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::chat::ChatCoordinator;
use crate::error::CoordinatorError;
use crate::messages::{ClientMessage, RoomUpdateKind, ServerMessage};
use crate::repository::{bounded, SystemStats};
use crate::room::ParticipantSummary;
use crate::signaling::{SignalKind, SignalingRelay};
use crate::store::{JoinOutcome, RoomStore};

type Connections = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>>;

/// Transport layer: owns the connection map and drives the coordinator
/// components. Room state is mutated inside the components under room
/// locks; every broadcast here happens after those locks are released.
#[derive(Clone)]
pub struct Server {
    store: Arc<RoomStore>,
    chat: Arc<ChatCoordinator>,
    relay: Arc<SignalingRelay>,
    connections: Connections,
}

impl Server {
    pub fn new(store: Arc<RoomStore>) -> Self {
        Server {
            chat: Arc::new(ChatCoordinator::new(Arc::clone(&store))),
            relay: Arc::new(SignalingRelay::new(Arc::clone(&store))),
            store,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// System-wide stats for the health endpoint. Prefers the repository
    /// aggregate, falling back to the authoritative store on failure.
    pub async fn system_stats(&self) -> SystemStats {
        let repository = self.store.repository();
        match bounded(
            self.store.config().repository_timeout,
            repository.aggregate_system_stats(),
        )
        .await
        {
            Ok(stats) => stats,
            Err(e) => {
                log::warn!("stats aggregate failed, using store fallback: {e}");
                self.store.stats().await
            }
        }
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let conn_id = Uuid::new_v4().to_string();
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections.insert(conn_id.clone(), tx);
        }
        log::debug!("connection {conn_id} opened");

        let server = self.clone();
        let reader_conn_id = conn_id.clone();
        tokio::spawn(async move {
            while let Some(result) = ws_rx.next().await {
                match result {
                    Ok(msg) => {
                        if let Ok(text) = msg.to_str() {
                            match serde_json::from_str::<ClientMessage>(text) {
                                Ok(client_msg) => {
                                    server
                                        .handle_client_message(client_msg, &reader_conn_id)
                                        .await;
                                }
                                Err(e) => {
                                    server
                                        .send_to(
                                            &reader_conn_id,
                                            &ServerMessage::Error {
                                                message: format!("malformed request: {e}"),
                                                retryable: false,
                                            },
                                        )
                                        .await;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        log::debug!("websocket error on {reader_conn_id}: {e}");
                        break;
                    }
                }
            }
            server.handle_transport_drop(&reader_conn_id).await;
        });

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    log::debug!("failed to write websocket message: {e}");
                    break;
                }
            }
        });
    }

    async fn handle_client_message(&self, message: ClientMessage, conn_id: &str) {
        let result = self.dispatch(message, conn_id).await;
        if let Err(e) = result {
            self.send_to(
                conn_id,
                &ServerMessage::Error {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                },
            )
            .await;
        }
    }

    async fn dispatch(
        &self,
        message: ClientMessage,
        conn_id: &str,
    ) -> Result<(), CoordinatorError> {
        match message {
            ClientMessage::CreateRoom {
                room_id,
                user_name,
                max_participants,
                timeout_ms,
            } => {
                let outcome = self
                    .store
                    .create_room(conn_id, room_id, &user_name, max_participants, timeout_ms)
                    .await?;
                let room = self.store.room_info(&outcome.room_id).await?;
                self.send_to(
                    conn_id,
                    &ServerMessage::RoomCreated {
                        room,
                        participant: outcome.participant.clone(),
                    },
                )
                .await;
                self.push_reconnection_token(conn_id, &outcome).await;
                Ok(())
            }

            ClientMessage::JoinRoom {
                room_id,
                user_name,
                reconnection_token,
            } => {
                let outcome = self
                    .store
                    .join(conn_id, &room_id, &user_name, reconnection_token.as_deref())
                    .await?;
                self.finish_join(conn_id, &outcome).await
            }

            ClientMessage::ReconnectRoom {
                room_id,
                reconnection_token,
            } => {
                let outcome = self
                    .store
                    .reconnect(conn_id, &room_id, &reconnection_token)
                    .await?;
                self.finish_join(conn_id, &outcome).await
            }

            ClientMessage::GetRoomInfo { room_id } => {
                let room = self.store.room_info(&room_id).await?;
                self.send_to(conn_id, &ServerMessage::RoomInfoResponse { room })
                    .await;
                Ok(())
            }

            ClientMessage::LeaveRoom => {
                let outcome = self.store.leave(conn_id).await?;
                self.send_to(
                    conn_id,
                    &ServerMessage::RoomLeft {
                        room_id: outcome.room_id.clone(),
                    },
                )
                .await;
                if !outcome.room_removed && !outcome.participants.is_empty() {
                    self.broadcast(
                        &outcome.participants,
                        &ServerMessage::RoomUpdated {
                            room_id: outcome.room_id.clone(),
                            kind: RoomUpdateKind::ParticipantLeft,
                            participants: outcome.participants.clone(),
                        },
                    )
                    .await;
                    self.announce(&outcome.room_id, &format!("{} left the room", outcome.name))
                        .await;
                }
                Ok(())
            }

            ClientMessage::WebrtcOffer { target_id, payload } => {
                self.relay_signal(conn_id, &target_id, SignalKind::Offer, payload)
                    .await
            }
            ClientMessage::WebrtcAnswer { target_id, payload } => {
                self.relay_signal(conn_id, &target_id, SignalKind::Answer, payload)
                    .await
            }
            ClientMessage::WebrtcIceCandidate { target_id, payload } => {
                self.relay_signal(conn_id, &target_id, SignalKind::IceCandidate, payload)
                    .await
            }

            ClientMessage::UpdateMediaStatus { media } => {
                let (room_id, participants) =
                    self.relay.update_media_status(conn_id, media).await?;
                self.send_to(conn_id, &ServerMessage::MediaStatusUpdated { media })
                    .await;
                self.broadcast(
                    &participants,
                    &ServerMessage::RoomUpdated {
                        room_id,
                        kind: RoomUpdateKind::MediaStatusChanged,
                        participants: participants.clone(),
                    },
                )
                .await;
                Ok(())
            }

            ClientMessage::SendMessage {
                content,
                kind,
                reply_to,
                mentions,
            } => {
                let (room_id, chat_message, typing_update) = self
                    .chat
                    .send_message(conn_id, &content, kind, reply_to, mentions)
                    .await?;
                let participants = self.store.snapshot_participants(&room_id).await?;
                self.broadcast(
                    &participants,
                    &ServerMessage::ChatMessageEvent {
                        message: chat_message,
                    },
                )
                .await;
                if let Some(typing) = typing_update {
                    self.broadcast(
                        &participants,
                        &ServerMessage::ChatTyping { room_id, typing },
                    )
                    .await;
                }
                Ok(())
            }

            ClientMessage::EditMessage {
                message_id,
                content,
            } => {
                let (room_id, edited) = self
                    .chat
                    .edit_message(conn_id, &message_id, &content)
                    .await?;
                let participants = self.store.snapshot_participants(&room_id).await?;
                self.broadcast(
                    &participants,
                    &ServerMessage::ChatMessageEdited { message: edited },
                )
                .await;
                Ok(())
            }

            ClientMessage::DeleteMessage { message_id } => {
                let (room_id, deleted_id) =
                    self.chat.delete_message(conn_id, &message_id).await?;
                let participants = self.store.snapshot_participants(&room_id).await?;
                self.broadcast(
                    &participants,
                    &ServerMessage::ChatMessageDeleted {
                        room_id,
                        message_id: deleted_id,
                    },
                )
                .await;
                Ok(())
            }

            ClientMessage::AddReaction { message_id, emoji } => {
                match self.chat.add_reaction(conn_id, &message_id, &emoji).await? {
                    Some((room_id, message)) => {
                        let participants = self.store.snapshot_participants(&room_id).await?;
                        self.broadcast(
                            &participants,
                            &ServerMessage::ChatReactionAdded { message },
                        )
                        .await;
                    }
                    None => {
                        self.send_to(
                            conn_id,
                            &ServerMessage::Ok {
                                op: "add-reaction".to_string(),
                            },
                        )
                        .await;
                    }
                }
                Ok(())
            }

            ClientMessage::RemoveReaction { message_id, emoji } => {
                match self
                    .chat
                    .remove_reaction(conn_id, &message_id, &emoji)
                    .await?
                {
                    Some((room_id, message)) => {
                        let participants = self.store.snapshot_participants(&room_id).await?;
                        self.broadcast(
                            &participants,
                            &ServerMessage::ChatReactionRemoved { message },
                        )
                        .await;
                    }
                    None => {
                        self.send_to(
                            conn_id,
                            &ServerMessage::Ok {
                                op: "remove-reaction".to_string(),
                            },
                        )
                        .await;
                    }
                }
                Ok(())
            }

            ClientMessage::TypingIndicator { is_typing } => {
                match self.chat.set_typing(conn_id, is_typing).await? {
                    Some((room_id, typing)) => {
                        let participants = self.store.snapshot_participants(&room_id).await?;
                        self.broadcast(
                            &participants,
                            &ServerMessage::ChatTyping { room_id, typing },
                        )
                        .await;
                    }
                    None => {
                        self.send_to(
                            conn_id,
                            &ServerMessage::Ok {
                                op: "typing-indicator".to_string(),
                            },
                        )
                        .await;
                    }
                }
                Ok(())
            }

            ClientMessage::GetChatHistory => {
                let (room_id, messages) = self.chat.history(conn_id).await?;
                // A history read counts as room activity.
                self.store.touch_activity(&room_id).await;
                self.send_to(conn_id, &ServerMessage::ChatHistory { room_id, messages })
                    .await;
                Ok(())
            }

            ClientMessage::Ping => {
                // Heartbeats from an unjoined connection are still answered.
                let _ = self.store.heartbeat(conn_id).await;
                self.send_to(conn_id, &ServerMessage::Pong).await;
                Ok(())
            }
        }
    }

    /// Shared tail of join/reconnect: respond to the joiner, hand over the
    /// fresh token, and tell the room.
    async fn finish_join(
        &self,
        conn_id: &str,
        outcome: &JoinOutcome,
    ) -> Result<(), CoordinatorError> {
        let room = self.store.room_info(&outcome.room_id).await?;
        self.send_to(
            conn_id,
            &ServerMessage::RoomJoined {
                room,
                participant: outcome.participant.clone(),
                is_reconnection: outcome.is_reconnection,
            },
        )
        .await;
        self.push_reconnection_token(conn_id, outcome).await;

        let kind = if outcome.is_reconnection {
            RoomUpdateKind::ParticipantReconnected
        } else {
            RoomUpdateKind::ParticipantJoined
        };
        self.broadcast(
            &outcome.participants,
            &ServerMessage::RoomUpdated {
                room_id: outcome.room_id.clone(),
                kind,
                participants: outcome.participants.clone(),
            },
        )
        .await;
        if !outcome.is_reconnection {
            self.announce(
                &outcome.room_id,
                &format!("{} joined the room", outcome.participant.name),
            )
            .await;
        }
        Ok(())
    }

    async fn relay_signal(
        &self,
        conn_id: &str,
        target_id: &str,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<(), CoordinatorError> {
        let outcome = self.relay.relay(conn_id, target_id, kind).await?;
        let forwarded = match kind {
            SignalKind::Offer => ServerMessage::WebrtcOffer {
                from_id: conn_id.to_string(),
                from_name: outcome.sender_name,
                payload,
            },
            SignalKind::Answer => ServerMessage::WebrtcAnswer {
                from_id: conn_id.to_string(),
                from_name: outcome.sender_name,
                payload,
            },
            SignalKind::IceCandidate => ServerMessage::WebrtcIceCandidate {
                from_id: conn_id.to_string(),
                from_name: outcome.sender_name,
                payload,
            },
        };
        self.send_to(&outcome.target_conn_id, &forwarded).await;
        self.send_to(
            conn_id,
            &ServerMessage::SignalDelivered {
                target_id: target_id.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Transport-level drop: recoverable, unlike an explicit leave. The
    /// participant keeps its slot and token; the room learns about the
    /// connectivity change.
    async fn handle_transport_drop(&self, conn_id: &str) {
        if let Some(outcome) = self.store.mark_disconnected(conn_id).await {
            self.broadcast(
                &outcome.participants,
                &ServerMessage::RoomUpdated {
                    room_id: outcome.room_id,
                    kind: RoomUpdateKind::ParticipantDisconnected,
                    participants: outcome.participants.clone(),
                },
            )
            .await;
        }
        let mut connections = self.connections.write().await;
        connections.remove(conn_id);
        log::debug!("connection {conn_id} closed");
    }

    /// System chat notice to every member of a room.
    async fn announce(&self, room_id: &str, text: &str) {
        let Ok(message) = self.chat.send_system_message(room_id, text).await else {
            return;
        };
        if let Ok(participants) = self.store.snapshot_participants(room_id).await {
            self.broadcast(&participants, &ServerMessage::ChatMessageEvent { message })
                .await;
        }
    }

    async fn push_reconnection_token(&self, conn_id: &str, outcome: &JoinOutcome) {
        self.send_to(
            conn_id,
            &ServerMessage::ReconnectionAvailable {
                room_id: outcome.room_id.clone(),
                reconnection_token: outcome.token.clone(),
                expires_in_ms: self.store.config().token_ttl.as_millis() as u64,
            },
        )
        .await;
    }

    async fn send_to(&self, conn_id: &str, message: &ServerMessage) {
        if let Ok(text) = serde_json::to_string(message) {
            let connections = self.connections.read().await;
            if let Some(sender) = connections.get(conn_id) {
                let _ = sender.send(Message::text(text));
            }
        }
    }

    /// Fan a message out to every participant with a live connection. Runs
    /// on a point-in-time snapshot, never under a room lock.
    async fn broadcast(&self, participants: &[ParticipantSummary], message: &ServerMessage) {
        let Ok(text) = serde_json::to_string(message) else {
            return;
        };
        let connections = self.connections.read().await;
        for participant in participants {
            if !participant.connected {
                continue;
            }
            if let Some(sender) = connections.get(&participant.connection_id) {
                let _ = sender.send(Message::text(text.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::repository::InMemoryRepository;

    fn test_server() -> Server {
        Server::new(Arc::new(RoomStore::new(
            ServerConfig::default(),
            InMemoryRepository::new(),
        )))
    }

    async fn register_conn(server: &Server, conn_id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        server
            .connections
            .write()
            .await
            .insert(conn_id.to_string(), tx);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Ok(text) = msg.to_str() {
                if let Ok(parsed) = serde_json::from_str::<ServerMessage>(text) {
                    out.push(parsed);
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn create_join_and_broadcast_flow() {
        let server = test_server();
        let mut alice_rx = register_conn(&server, "alice-conn").await;
        let mut bob_rx = register_conn(&server, "bob-conn").await;

        server
            .handle_client_message(
                ClientMessage::CreateRoom {
                    room_id: Some("team-standup".into()),
                    user_name: "Alice".into(),
                    max_participants: Some(2),
                    timeout_ms: None,
                },
                "alice-conn",
            )
            .await;
        let alice_msgs = drain(&mut alice_rx);
        assert!(alice_msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::RoomCreated { .. })));
        assert!(alice_msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::ReconnectionAvailable { .. })));

        server
            .handle_client_message(
                ClientMessage::JoinRoom {
                    room_id: "team-standup".into(),
                    user_name: "Bob".into(),
                    reconnection_token: None,
                },
                "bob-conn",
            )
            .await;
        let bob_msgs = drain(&mut bob_rx);
        assert!(bob_msgs.iter().any(|m| matches!(
            m,
            ServerMessage::RoomJoined {
                is_reconnection: false,
                ..
            }
        )));
        // Alice saw the participant-joined update.
        let alice_msgs = drain(&mut alice_rx);
        assert!(alice_msgs.iter().any(|m| matches!(
            m,
            ServerMessage::RoomUpdated {
                kind: RoomUpdateKind::ParticipantJoined,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn third_join_rejected_when_full() {
        let server = test_server();
        let _alice_rx = register_conn(&server, "alice-conn").await;
        let _bob_rx = register_conn(&server, "bob-conn").await;
        let mut carol_rx = register_conn(&server, "carol-conn").await;

        server
            .handle_client_message(
                ClientMessage::CreateRoom {
                    room_id: Some("team-standup".into()),
                    user_name: "Alice".into(),
                    max_participants: Some(2),
                    timeout_ms: None,
                },
                "alice-conn",
            )
            .await;
        server
            .handle_client_message(
                ClientMessage::JoinRoom {
                    room_id: "team-standup".into(),
                    user_name: "Bob".into(),
                    reconnection_token: None,
                },
                "bob-conn",
            )
            .await;
        server
            .handle_client_message(
                ClientMessage::JoinRoom {
                    room_id: "team-standup".into(),
                    user_name: "Carol".into(),
                    reconnection_token: None,
                },
                "carol-conn",
            )
            .await;

        let carol_msgs = drain(&mut carol_rx);
        assert!(carol_msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::Error { retryable: false, .. })));
    }

    #[tokio::test]
    async fn signaling_forwarded_to_target_only() {
        let server = test_server();
        let mut alice_rx = register_conn(&server, "alice-conn").await;
        let mut bob_rx = register_conn(&server, "bob-conn").await;

        server
            .handle_client_message(
                ClientMessage::CreateRoom {
                    room_id: Some("signal-room".into()),
                    user_name: "Alice".into(),
                    max_participants: None,
                    timeout_ms: None,
                },
                "alice-conn",
            )
            .await;
        server
            .handle_client_message(
                ClientMessage::JoinRoom {
                    room_id: "signal-room".into(),
                    user_name: "Bob".into(),
                    reconnection_token: None,
                },
                "bob-conn",
            )
            .await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        server
            .handle_client_message(
                ClientMessage::WebrtcOffer {
                    target_id: "bob-conn".into(),
                    payload: serde_json::json!({"sdp": "v=0"}),
                },
                "alice-conn",
            )
            .await;

        let bob_msgs = drain(&mut bob_rx);
        assert!(bob_msgs.iter().any(|m| matches!(
            m,
            ServerMessage::WebrtcOffer { from_id, .. } if from_id == "alice-conn"
        )));
        let alice_msgs = drain(&mut alice_rx);
        assert!(alice_msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::SignalDelivered { .. })));
    }

    #[tokio::test]
    async fn transport_drop_notifies_room_and_keeps_slot() {
        let server = test_server();
        let mut alice_rx = register_conn(&server, "alice-conn").await;
        let _bob_rx = register_conn(&server, "bob-conn").await;

        server
            .handle_client_message(
                ClientMessage::CreateRoom {
                    room_id: Some("droppy".into()),
                    user_name: "Alice".into(),
                    max_participants: None,
                    timeout_ms: None,
                },
                "alice-conn",
            )
            .await;
        server
            .handle_client_message(
                ClientMessage::JoinRoom {
                    room_id: "droppy".into(),
                    user_name: "Bob".into(),
                    reconnection_token: None,
                },
                "bob-conn",
            )
            .await;
        drain(&mut alice_rx);

        server.handle_transport_drop("bob-conn").await;
        let alice_msgs = drain(&mut alice_rx);
        let update = alice_msgs.iter().find_map(|m| match m {
            ServerMessage::RoomUpdated {
                kind: RoomUpdateKind::ParticipantDisconnected,
                participants,
                ..
            } => Some(participants.clone()),
            _ => None,
        });
        let participants = update.expect("disconnect update");
        assert_eq!(participants.len(), 2);
        assert_eq!(participants.iter().filter(|p| p.connected).count(), 1);
    }
}
