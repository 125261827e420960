use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("repository call timed out")]
    Timeout,
}

pub type RepoResult<T> = Result<T, RepositoryError>;

/// Durable mirror of a room. `last_activity` and `created_at` are epoch
/// milliseconds so records survive process restarts, unlike the store's
/// monotonic clocks.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub room_id: String,
    pub created_at: u64,
    pub last_activity: u64,
    pub is_active: bool,
    pub timeout_ms: u64,
    pub participant_count: usize,
}

#[derive(Debug, Clone)]
pub struct ParticipantRecord {
    pub room_id: String,
    pub connection_id: String,
    pub name: String,
    pub connected: bool,
}

#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub created_at: u64,
    pub last_activity: u64,
    pub is_active: bool,
    pub participants: Vec<ParticipantRecord>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemStats {
    pub active_rooms: usize,
    pub total_participants: usize,
}

pub type ParticipantPredicate = dyn Fn(&ParticipantRecord) -> bool + Send + Sync;

/// Durable room/participant mirror. Advisory only: the in-memory store stays
/// authoritative for admission decisions; writes here are best-effort and
/// reads degrade fail-safe when the adapter is unavailable.
#[async_trait]
pub trait RoomRepository: Send + Sync {
    // Write-behind mirror surface.
    async fn record_room(&self, record: RoomRecord) -> RepoResult<()>;
    async fn record_participant(&self, record: ParticipantRecord) -> RepoResult<()>;
    async fn remove_participant(&self, room_id: &str, connection_id: &str) -> RepoResult<()>;
    async fn remove_room(&self, room_id: &str) -> RepoResult<()>;
    async fn mark_room_inactive(&self, room_id: &str) -> RepoResult<()>;
    async fn touch_room(&self, room_id: &str, last_activity: u64, participant_count: usize)
        -> RepoResult<()>;

    // Query surface.
    async fn count_participants(&self, room_id: &str) -> RepoResult<usize>;
    async fn find_participant_by_connection(&self, connection_id: &str)
        -> RepoResult<Option<String>>;
    async fn get_room_snapshot(&self, room_id: &str) -> RepoResult<Option<RoomSnapshot>>;
    /// Reclamation candidates: rooms stale per their own timeout, rooms with
    /// zero participants, and rooms flagged inactive. Bounded by `limit`,
    /// oldest activity first.
    async fn find_stale_or_empty_room_ids(&self, now: u64, limit: usize) -> RepoResult<Vec<String>>;
    /// Delete participant records matching the predicate, returning the count.
    async fn delete_orphaned_participants(&self, predicate: &ParticipantPredicate)
        -> RepoResult<usize>;
    async fn aggregate_system_stats(&self) -> RepoResult<SystemStats>;
}

/// Wrap a repository read in the configured timeout. Expiry fails closed:
/// the caller sees a `Timeout` error and must treat the data as absent.
pub async fn bounded<T, F>(timeout: Duration, fut: F) -> RepoResult<T>
where
    F: std::future::Future<Output = RepoResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RepositoryError::Timeout),
    }
}

/// In-process repository backend. The default deployment runs with this; a
/// database-backed adapter implements the same trait.
#[derive(Default)]
pub struct InMemoryRepository {
    rooms: RwLock<HashMap<String, RoomRecord>>,
    participants: RwLock<HashMap<String, ParticipantRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn participant_key(room_id: &str, connection_id: &str) -> String {
        format!("{room_id}/{connection_id}")
    }
}

#[async_trait]
impl RoomRepository for InMemoryRepository {
    async fn record_room(&self, record: RoomRecord) -> RepoResult<()> {
        self.rooms.write().await.insert(record.room_id.clone(), record);
        Ok(())
    }

    async fn record_participant(&self, record: ParticipantRecord) -> RepoResult<()> {
        let key = Self::participant_key(&record.room_id, &record.connection_id);
        self.participants.write().await.insert(key, record);
        Ok(())
    }

    async fn remove_participant(&self, room_id: &str, connection_id: &str) -> RepoResult<()> {
        let key = Self::participant_key(room_id, connection_id);
        self.participants.write().await.remove(&key);
        Ok(())
    }

    async fn remove_room(&self, room_id: &str) -> RepoResult<()> {
        self.rooms.write().await.remove(room_id);
        self.participants
            .write()
            .await
            .retain(|_, p| p.room_id != room_id);
        Ok(())
    }

    async fn mark_room_inactive(&self, room_id: &str) -> RepoResult<()> {
        if let Some(record) = self.rooms.write().await.get_mut(room_id) {
            record.is_active = false;
        }
        Ok(())
    }

    async fn touch_room(
        &self,
        room_id: &str,
        last_activity: u64,
        participant_count: usize,
    ) -> RepoResult<()> {
        if let Some(record) = self.rooms.write().await.get_mut(room_id) {
            record.last_activity = last_activity;
            record.participant_count = participant_count;
            record.is_active = record.is_active || participant_count > 0;
        }
        Ok(())
    }

    async fn count_participants(&self, room_id: &str) -> RepoResult<usize> {
        Ok(self
            .participants
            .read()
            .await
            .values()
            .filter(|p| p.room_id == room_id)
            .count())
    }

    async fn find_participant_by_connection(
        &self,
        connection_id: &str,
    ) -> RepoResult<Option<String>> {
        Ok(self
            .participants
            .read()
            .await
            .values()
            .find(|p| p.connection_id == connection_id)
            .map(|p| p.room_id.clone()))
    }

    async fn get_room_snapshot(&self, room_id: &str) -> RepoResult<Option<RoomSnapshot>> {
        let rooms = self.rooms.read().await;
        let Some(record) = rooms.get(room_id) else {
            return Ok(None);
        };
        let participants = self
            .participants
            .read()
            .await
            .values()
            .filter(|p| p.room_id == room_id)
            .cloned()
            .collect();
        Ok(Some(RoomSnapshot {
            created_at: record.created_at,
            last_activity: record.last_activity,
            is_active: record.is_active,
            participants,
        }))
    }

    async fn find_stale_or_empty_room_ids(&self, now: u64, limit: usize) -> RepoResult<Vec<String>> {
        let rooms = self.rooms.read().await;
        let mut candidates: Vec<&RoomRecord> = rooms
            .values()
            .filter(|r| {
                !r.is_active
                    || r.participant_count == 0
                    || r.last_activity.saturating_add(r.timeout_ms) < now
            })
            .collect();
        candidates.sort_by_key(|r| r.last_activity);
        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|r| r.room_id.clone())
            .collect())
    }

    async fn delete_orphaned_participants(
        &self,
        predicate: &ParticipantPredicate,
    ) -> RepoResult<usize> {
        let mut participants = self.participants.write().await;
        let before = participants.len();
        participants.retain(|_, p| !predicate(p));
        Ok(before - participants.len())
    }

    async fn aggregate_system_stats(&self) -> RepoResult<SystemStats> {
        let rooms = self.rooms.read().await;
        let participants = self.participants.read().await;
        Ok(SystemStats {
            active_rooms: rooms.values().filter(|r| r.is_active).count(),
            total_participants: participants.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str, last_activity: u64, count: usize) -> RoomRecord {
        RoomRecord {
            room_id: id.to_string(),
            created_at: 0,
            last_activity,
            is_active: true,
            timeout_ms: 60_000,
            participant_count: count,
        }
    }

    #[tokio::test]
    async fn stale_query_respects_per_room_timeout_and_limit() {
        let repo = InMemoryRepository::new();
        repo.record_room(room("fresh", 100_000, 2)).await.unwrap();
        repo.record_room(room("stale", 10_000, 2)).await.unwrap();
        repo.record_room(room("empty", 100_000, 0)).await.unwrap();

        // now = 150_000: "stale" timed out (10_000 + 60_000 < 150_000),
        // "empty" has no participants, "fresh" survives.
        let ids = repo.find_stale_or_empty_room_ids(150_000, 10).await.unwrap();
        assert_eq!(ids, vec!["stale".to_string(), "empty".to_string()]);

        let ids = repo.find_stale_or_empty_room_ids(150_000, 1).await.unwrap();
        assert_eq!(ids, vec!["stale".to_string()]);
    }

    #[tokio::test]
    async fn orphan_deletion_reports_count() {
        let repo = InMemoryRepository::new();
        for i in 0..3 {
            repo.record_participant(ParticipantRecord {
                room_id: "gone".to_string(),
                connection_id: format!("c{i}"),
                name: format!("user{i}"),
                connected: false,
            })
            .await
            .unwrap();
        }
        repo.record_participant(ParticipantRecord {
            room_id: "live".to_string(),
            connection_id: "c9".to_string(),
            name: "keeper".to_string(),
            connected: true,
        })
        .await
        .unwrap();

        let removed = repo
            .delete_orphaned_participants(&|p| p.room_id == "gone")
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(repo.count_participants("live").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn participant_lookup_by_connection() {
        let repo = InMemoryRepository::new();
        repo.record_participant(ParticipantRecord {
            room_id: "team-standup".to_string(),
            connection_id: "c1".to_string(),
            name: "Alice".to_string(),
            connected: true,
        })
        .await
        .unwrap();

        let found = repo.find_participant_by_connection("c1").await.unwrap();
        assert_eq!(found, Some("team-standup".to_string()));
        let missing = repo.find_participant_by_connection("c2").await.unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn bounded_read_fails_closed_on_timeout() {
        let result: RepoResult<usize> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        })
        .await;
        assert!(matches!(result, Err(RepositoryError::Timeout)));
    }
}
