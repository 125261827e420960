use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::repository::bounded;
use crate::room::now_millis;
use crate::store::RoomStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub candidates: usize,
    pub rooms_removed: usize,
    pub orphans_removed: usize,
}

/// Background reclamation of stale and empty rooms. The repository supplies
/// candidates; the authoritative store re-verifies each one under its room
/// lock (compare-and-delete), so a join landing between scan and action
/// always wins. Failures are logged and retried on the next interval.
pub struct CleanupSweeper {
    store: Arc<RoomStore>,
}

impl CleanupSweeper {
    pub fn new(store: Arc<RoomStore>) -> Self {
        CleanupSweeper { store }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let interval = self.store.config().sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.sweep_once().await;
                if report.rooms_removed > 0 || report.orphans_removed > 0 {
                    log::info!(
                        "sweep: {} of {} candidate rooms reclaimed, {} orphaned participants removed",
                        report.rooms_removed,
                        report.candidates,
                        report.orphans_removed
                    );
                }
            }
        })
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let config = self.store.config();
        let repository = self.store.repository();

        let candidates = match bounded(
            config.repository_timeout,
            repository.find_stale_or_empty_room_ids(now_millis(), config.sweep_batch_size),
        )
        .await
        {
            Ok(ids) => ids,
            Err(e) => {
                // Fail-safe: an unreadable repository never triggers cleanup.
                log::warn!("sweep: stale-room query failed, skipping pass: {e}");
                return report;
            }
        };
        report.candidates = candidates.len();

        for room_id in &candidates {
            // Compare-and-delete; a room revived since the scan is skipped.
            if self.store.remove_room_if_reclaimable(room_id).await {
                report.rooms_removed += 1;
            } else {
                log::debug!("sweep: room {room_id} no longer eligible, skipped");
            }
        }

        // Reclaim participant records whose room no longer lives in the
        // authoritative store.
        let mut live_rooms: HashSet<String> = HashSet::new();
        for room_id in self.store.room_ids().await {
            live_rooms.insert(room_id);
        }
        match bounded(
            config.repository_timeout,
            repository.delete_orphaned_participants(&move |p| !live_rooms.contains(&p.room_id)),
        )
        .await
        {
            Ok(count) => report.orphans_removed = count,
            Err(e) => log::warn!("sweep: orphan reclamation failed: {e}"),
        }

        report
    }
}
