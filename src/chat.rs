use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoordinatorError, Result};
use crate::room::now_millis;
use crate::store::RoomStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    System,
    Emoji,
    File,
}

/// One emoji's reactor set on a message. Ids are deduplicated and `count`
/// always equals the set size; an entry with no reactors is pruned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReaction {
    pub emoji: String,
    pub participant_ids: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: u64,
    pub kind: MessageKind,
    #[serde(default)]
    pub edited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<MessageReaction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
}

/// Per-room chat operations. All mutations run under the same room lock as
/// membership changes, so chat state can never race a join or leave.
pub struct ChatCoordinator {
    store: Arc<RoomStore>,
}

impl ChatCoordinator {
    pub fn new(store: Arc<RoomStore>) -> Self {
        ChatCoordinator { store }
    }

    /// Append a message to the sender's room log. Content is trimmed;
    /// empty or over-long content is rejected before any mutation. Sending
    /// also clears the sender's typing indicator.
    pub async fn send_message(
        &self,
        conn_id: &str,
        content: &str,
        kind: MessageKind,
        reply_to: Option<String>,
        mentions: Vec<String>,
    ) -> Result<(String, ChatMessage, Option<Vec<String>>)> {
        let content = content.trim();
        if content.is_empty() {
            return Err(CoordinatorError::EmptyContent);
        }
        let max_len = self.store.config().max_message_len;
        if content.chars().count() > max_len {
            return Err(CoordinatorError::ContentTooLong(max_len));
        }

        let (room, room_id) = self.store.membership(conn_id).await?;
        let mut state = room.state.lock().await;
        let sender = state
            .participants
            .get(conn_id)
            .ok_or(CoordinatorError::NotInRoom)?;
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            sender_id: conn_id.to_string(),
            sender_name: sender.name.clone(),
            content: content.to_string(),
            timestamp: now_millis(),
            kind,
            edited: false,
            edited_at: None,
            reply_to,
            reactions: Vec::new(),
            mentions,
        };
        let sender_name = message.sender_name.clone();
        state.messages.push(message.clone());
        // Sending clears the sender's typing indicator; report the updated
        // set only when it actually changed.
        let typing_update = if state.typing.remove(&sender_name) {
            let mut names: Vec<String> = state.typing.iter().cloned().collect();
            names.sort();
            Some(names)
        } else {
            None
        };
        state.last_activity = Instant::now();
        Ok((room_id, message, typing_update))
    }

    /// Server-originated notice (join/leave announcements). No sender
    /// authorization applies; the message is attributed to the system.
    pub async fn send_system_message(&self, room_id: &str, content: &str) -> Result<ChatMessage> {
        let room = self
            .store
            .get_room(room_id)
            .await
            .ok_or_else(|| CoordinatorError::RoomNotFound(room_id.to_string()))?;
        let mut state = room.state.lock().await;
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            sender_id: "system".to_string(),
            sender_name: "system".to_string(),
            content: content.to_string(),
            timestamp: now_millis(),
            kind: MessageKind::System,
            edited: false,
            edited_at: None,
            reply_to: None,
            reactions: Vec::new(),
            mentions: Vec::new(),
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    /// Only the original sender may edit. Identifier and original timestamp
    /// are preserved, so the message keeps its position in history.
    pub async fn edit_message(
        &self,
        conn_id: &str,
        message_id: &str,
        new_content: &str,
    ) -> Result<(String, ChatMessage)> {
        let new_content = new_content.trim();
        if new_content.is_empty() {
            return Err(CoordinatorError::EmptyContent);
        }
        let max_len = self.store.config().max_message_len;
        if new_content.chars().count() > max_len {
            return Err(CoordinatorError::ContentTooLong(max_len));
        }

        let (room, room_id) = self.store.membership(conn_id).await?;
        let mut state = room.state.lock().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(CoordinatorError::MessageNotFound)?;
        if message.sender_id != conn_id {
            return Err(CoordinatorError::NotAuthor);
        }
        message.content = new_content.to_string();
        message.edited = true;
        message.edited_at = Some(now_millis());
        let updated = message.clone();
        state.last_activity = Instant::now();
        Ok((room_id, updated))
    }

    /// Sender or room creator may delete. Re-deleting an already-deleted
    /// message succeeds ("already gone") so duplicate client retries are
    /// harmless; a message that never existed is a `MessageNotFound`.
    pub async fn delete_message(&self, conn_id: &str, message_id: &str) -> Result<(String, String)> {
        let (room, room_id) = self.store.membership(conn_id).await?;
        let mut state = room.state.lock().await;
        if state.deleted_messages.contains(message_id) {
            return Ok((room_id, message_id.to_string()));
        }
        let Some(index) = state.messages.iter().position(|m| m.id == message_id) else {
            return Err(CoordinatorError::MessageNotFound);
        };
        let is_author = state.messages[index].sender_id == conn_id;
        let is_creator = state
            .participants
            .get(conn_id)
            .is_some_and(|p| p.is_creator);
        if !is_author && !is_creator {
            return Err(CoordinatorError::NotAuthorized);
        }
        state.messages.remove(index);
        state.deleted_messages.insert(message_id.to_string());
        state.last_activity = Instant::now();
        Ok((room_id, message_id.to_string()))
    }

    /// Toggle the sender's display name in the room typing set. Returns
    /// `None` when nothing changed, so redundant broadcasts are skipped.
    pub async fn set_typing(
        &self,
        conn_id: &str,
        is_typing: bool,
    ) -> Result<Option<(String, Vec<String>)>> {
        let (room, room_id) = self.store.membership(conn_id).await?;
        let mut state = room.state.lock().await;
        let name = state
            .participants
            .get(conn_id)
            .map(|p| p.name.clone())
            .ok_or(CoordinatorError::NotInRoom)?;
        let changed = if is_typing {
            state.typing.insert(name)
        } else {
            state.typing.remove(&name)
        };
        if !changed {
            return Ok(None);
        }
        let mut names: Vec<String> = state.typing.iter().cloned().collect();
        names.sort();
        Ok(Some((room_id, names)))
    }

    /// Add the reactor to the emoji's id set. Re-adding is idempotent and
    /// reported as unchanged so no broadcast goes out.
    pub async fn add_reaction(
        &self,
        conn_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Option<(String, ChatMessage)>> {
        let (room, room_id) = self.store.membership(conn_id).await?;
        let mut state = room.state.lock().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(CoordinatorError::MessageNotFound)?;
        let index = match message.reactions.iter().position(|r| r.emoji == emoji) {
            Some(index) => index,
            None => {
                message.reactions.push(MessageReaction {
                    emoji: emoji.to_string(),
                    participant_ids: Vec::new(),
                    count: 0,
                });
                message.reactions.len() - 1
            }
        };
        let reaction = &mut message.reactions[index];
        if reaction.participant_ids.iter().any(|id| id == conn_id) {
            return Ok(None);
        }
        reaction.participant_ids.push(conn_id.to_string());
        reaction.count = reaction.participant_ids.len();
        let updated = message.clone();
        state.last_activity = Instant::now();
        Ok(Some((room_id, updated)))
    }

    /// Remove the reactor from the emoji's id set; an empty entry is
    /// pruned. Removing a reaction that is not there (or whose message is
    /// gone) is a no-op.
    pub async fn remove_reaction(
        &self,
        conn_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Option<(String, ChatMessage)>> {
        let (room, room_id) = self.store.membership(conn_id).await?;
        let mut state = room.state.lock().await;
        let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) else {
            return Ok(None);
        };
        let Some(index) = message.reactions.iter().position(|r| r.emoji == emoji) else {
            return Ok(None);
        };
        let reaction = &mut message.reactions[index];
        let before = reaction.participant_ids.len();
        reaction.participant_ids.retain(|id| id != conn_id);
        if reaction.participant_ids.len() == before {
            return Ok(None);
        }
        reaction.count = reaction.participant_ids.len();
        if reaction.participant_ids.is_empty() {
            message.reactions.remove(index);
        }
        let updated = message.clone();
        state.last_activity = Instant::now();
        Ok(Some((room_id, updated)))
    }

    /// Full room log, timestamp ascending; ties keep insertion order.
    pub async fn history(&self, conn_id: &str) -> Result<(String, Vec<ChatMessage>)> {
        let (room, room_id) = self.store.membership(conn_id).await?;
        let state = room.state.lock().await;
        let mut messages = state.messages.clone();
        messages.sort_by_key(|m| m.timestamp);
        Ok((room_id, messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::repository::InMemoryRepository;

    async fn setup() -> (Arc<RoomStore>, ChatCoordinator, String) {
        let store = Arc::new(RoomStore::new(
            ServerConfig::default(),
            InMemoryRepository::new(),
        ));
        let room_id = store
            .create_room("alice-conn", Some("team-standup".into()), "Alice", Some(10), None)
            .await
            .unwrap()
            .room_id;
        store.join("bob-conn", &room_id, "Bob", None).await.unwrap();
        let chat = ChatCoordinator::new(Arc::clone(&store));
        (store, chat, room_id)
    }

    #[tokio::test]
    async fn send_and_history() {
        let (_store, chat, _room_id) = setup().await;
        let (_, message, _) = chat
            .send_message("alice-conn", "  hello  ", MessageKind::Text, None, vec![])
            .await
            .unwrap();
        assert_eq!(message.content, "hello");
        assert_eq!(message.sender_name, "Alice");

        let (_, history) = chat.history("bob-conn").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender_name, "Alice");
    }

    #[tokio::test]
    async fn empty_and_oversized_content_rejected() {
        let (store, chat, _) = setup().await;
        let err = chat
            .send_message("alice-conn", "   ", MessageKind::Text, None, vec![])
            .await
            .unwrap_err();
        assert_eq!(err, CoordinatorError::EmptyContent);

        let long = "x".repeat(store.config().max_message_len + 1);
        let err = chat
            .send_message("alice-conn", &long, MessageKind::Text, None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ContentTooLong(_)));
    }

    #[tokio::test]
    async fn only_author_may_edit() {
        let (_store, chat, _) = setup().await;
        let (_, message, _) = chat
            .send_message("alice-conn", "hello", MessageKind::Text, None, vec![])
            .await
            .unwrap();

        let err = chat
            .edit_message("bob-conn", &message.id, "hijacked")
            .await
            .unwrap_err();
        assert_eq!(err, CoordinatorError::NotAuthor);

        let (_, edited) = chat
            .edit_message("alice-conn", &message.id, "hello again")
            .await
            .unwrap();
        assert!(edited.edited);
        assert_eq!(edited.id, message.id);
        assert_eq!(edited.timestamp, message.timestamp);
    }

    #[tokio::test]
    async fn delete_authorization_and_idempotence() {
        let (_store, chat, _) = setup().await;
        let (_, message, _) = chat
            .send_message("bob-conn", "delete me", MessageKind::Text, None, vec![])
            .await
            .unwrap();

        // Creator may delete another participant's message.
        chat.delete_message("alice-conn", &message.id).await.unwrap();
        // Re-delete succeeds ("already gone").
        chat.delete_message("bob-conn", &message.id).await.unwrap();
        // A message that never existed is an error.
        let err = chat.delete_message("alice-conn", "no-such-id").await.unwrap_err();
        assert_eq!(err, CoordinatorError::MessageNotFound);
    }

    #[tokio::test]
    async fn non_creator_cannot_delete_others_messages() {
        let (_store, chat, _) = setup().await;
        let (_, message, _) = chat
            .send_message("alice-conn", "keep me", MessageKind::Text, None, vec![])
            .await
            .unwrap();
        let err = chat.delete_message("bob-conn", &message.id).await.unwrap_err();
        assert_eq!(err, CoordinatorError::NotAuthorized);
    }

    #[tokio::test]
    async fn typing_toggle_suppresses_redundant_updates() {
        let (_store, chat, _) = setup().await;
        let first = chat.set_typing("alice-conn", true).await.unwrap();
        assert!(first.is_some());
        let redundant = chat.set_typing("alice-conn", true).await.unwrap();
        assert!(redundant.is_none());
        let cleared = chat.set_typing("alice-conn", false).await.unwrap();
        assert!(cleared.is_some());
    }

    #[tokio::test]
    async fn sending_clears_typing_indicator() {
        let (_store, chat, _) = setup().await;
        chat.set_typing("alice-conn", true).await.unwrap();
        let (_, _, typing_update) = chat
            .send_message("alice-conn", "done typing", MessageKind::Text, None, vec![])
            .await
            .unwrap();
        assert_eq!(typing_update, Some(vec![]));
    }

    #[tokio::test]
    async fn reactions_dedupe_and_prune() {
        let (_store, chat, _) = setup().await;
        let (_, message, _) = chat
            .send_message("alice-conn", "react to me", MessageKind::Text, None, vec![])
            .await
            .unwrap();

        let added = chat
            .add_reaction("bob-conn", &message.id, "👍")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(added.1.reactions[0].count, 1);

        // Idempotent re-add.
        assert!(chat
            .add_reaction("bob-conn", &message.id, "👍")
            .await
            .unwrap()
            .is_none());

        let removed = chat
            .remove_reaction("bob-conn", &message.id, "👍")
            .await
            .unwrap()
            .unwrap();
        assert!(removed.1.reactions.is_empty());

        // Removing a reaction that is not there is a no-op.
        assert!(chat
            .remove_reaction("bob-conn", &message.id, "👍")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn history_sorted_with_stable_ties_after_edit() {
        let (store, chat, room_id) = setup().await;
        for i in 0..5 {
            chat.send_message("alice-conn", &format!("m{i}"), MessageKind::Text, None, vec![])
                .await
                .unwrap();
        }
        // Force identical timestamps to exercise the stable tie-break.
        {
            let room = store.get_room(&room_id).await.unwrap();
            let mut state = room.state.lock().await;
            for m in &mut state.messages {
                m.timestamp = 42;
            }
        }
        let (_, before) = chat.history("alice-conn").await.unwrap();
        let second_id = before[1].id.clone();
        chat.edit_message("alice-conn", &second_id, "edited")
            .await
            .unwrap();
        let (_, after) = chat.history("alice-conn").await.unwrap();
        assert_eq!(after[1].id, second_id);
        assert_eq!(after[1].content, "edited");
        let ids_before: Vec<&str> = before.iter().map(|m| m.id.as_str()).collect();
        let ids_after: Vec<&str> = after.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids_before, ids_after);
    }

    #[tokio::test]
    async fn mentions_are_stored_as_supplied() {
        let (_store, chat, _) = setup().await;
        let (_, message, _) = chat
            .send_message(
                "alice-conn",
                "hey @Bob",
                MessageKind::Text,
                None,
                vec!["bob-conn".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(message.mentions, vec!["bob-conn".to_string()]);
    }

    #[tokio::test]
    async fn non_member_cannot_send() {
        let (_store, chat, _) = setup().await;
        let err = chat
            .send_message("stranger", "hi", MessageKind::Text, None, vec![])
            .await
            .unwrap_err();
        assert_eq!(err, CoordinatorError::NotInRoom);
    }
}
