use serde::{Deserialize, Serialize};

use crate::chat::{ChatMessage, MessageKind};
use crate::room::{MediaStatus, ParticipantSummary, RoomInfo};

/// Requests arriving over the WebSocket. Every variant gets either its
/// success payload or an `error` response; signaling payloads stay opaque
/// (`serde_json::Value` is forwarded untouched).
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "create-room")]
    CreateRoom {
        room_id: Option<String>,
        user_name: String,
        max_participants: Option<usize>,
        timeout_ms: Option<u64>,
    },
    #[serde(rename = "join-room")]
    JoinRoom {
        room_id: String,
        user_name: String,
        reconnection_token: Option<String>,
    },
    #[serde(rename = "reconnect-room")]
    ReconnectRoom {
        room_id: String,
        reconnection_token: String,
    },
    #[serde(rename = "get-room-info")]
    GetRoomInfo { room_id: String },
    #[serde(rename = "leave-room")]
    LeaveRoom,
    #[serde(rename = "webrtc-offer")]
    WebrtcOffer {
        target_id: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "webrtc-answer")]
    WebrtcAnswer {
        target_id: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "webrtc-ice-candidate")]
    WebrtcIceCandidate {
        target_id: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "update-media-status")]
    UpdateMediaStatus { media: MediaStatus },
    #[serde(rename = "send-message")]
    SendMessage {
        content: String,
        #[serde(default)]
        kind: MessageKind,
        reply_to: Option<String>,
        #[serde(default)]
        mentions: Vec<String>,
    },
    #[serde(rename = "edit-message")]
    EditMessage { message_id: String, content: String },
    #[serde(rename = "delete-message")]
    DeleteMessage { message_id: String },
    #[serde(rename = "add-reaction")]
    AddReaction { message_id: String, emoji: String },
    #[serde(rename = "remove-reaction")]
    RemoveReaction { message_id: String, emoji: String },
    #[serde(rename = "typing-indicator")]
    TypingIndicator { is_typing: bool },
    #[serde(rename = "get-chat-history")]
    GetChatHistory,
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RoomUpdateKind {
    ParticipantJoined,
    ParticipantLeft,
    ParticipantReconnected,
    ParticipantDisconnected,
    MediaStatusChanged,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "room-created")]
    RoomCreated {
        room: RoomInfo,
        participant: ParticipantSummary,
    },
    #[serde(rename = "room-joined")]
    RoomJoined {
        room: RoomInfo,
        participant: ParticipantSummary,
        is_reconnection: bool,
    },
    #[serde(rename = "room-info")]
    RoomInfoResponse { room: RoomInfo },
    #[serde(rename = "room-left")]
    RoomLeft { room_id: String },
    #[serde(rename = "room-updated")]
    RoomUpdated {
        room_id: String,
        kind: RoomUpdateKind,
        participants: Vec<ParticipantSummary>,
    },
    /// Single-use resume secret, pushed only to the connection it belongs to.
    #[serde(rename = "reconnection-available")]
    ReconnectionAvailable {
        room_id: String,
        reconnection_token: String,
        expires_in_ms: u64,
    },
    #[serde(rename = "webrtc-offer")]
    WebrtcOffer {
        from_id: String,
        from_name: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "webrtc-answer")]
    WebrtcAnswer {
        from_id: String,
        from_name: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "webrtc-ice-candidate")]
    WebrtcIceCandidate {
        from_id: String,
        from_name: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "signal-delivered")]
    SignalDelivered { target_id: String },
    #[serde(rename = "media-status-updated")]
    MediaStatusUpdated { media: MediaStatus },
    #[serde(rename = "chat-message")]
    ChatMessageEvent { message: ChatMessage },
    #[serde(rename = "chat-message-edited")]
    ChatMessageEdited { message: ChatMessage },
    #[serde(rename = "chat-message-deleted")]
    ChatMessageDeleted { room_id: String, message_id: String },
    #[serde(rename = "chat-typing")]
    ChatTyping { room_id: String, typing: Vec<String> },
    #[serde(rename = "chat-history")]
    ChatHistory {
        room_id: String,
        messages: Vec<ChatMessage>,
    },
    #[serde(rename = "chat-reaction-added")]
    ChatReactionAdded { message: ChatMessage },
    #[serde(rename = "chat-reaction-removed")]
    ChatReactionRemoved { message: ChatMessage },
    /// Acknowledgement for requests that changed nothing (redundant typing
    /// toggles, idempotent reaction retries).
    #[serde(rename = "ok")]
    Ok { op: String },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { message: String, retryable: bool },
}
