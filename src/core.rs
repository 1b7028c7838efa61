//! The core context: one object wiring the store, the activity log, the
//! conflict resolver, and the sync layer together.
//!
//! Every command a frontend executes goes through [`CoreContext::record_command`]:
//! it is appended to the activity log, scanned against recent commands for
//! conflicts, and any detected conflict is broadcast as a `sync.conflict`
//! event. Unresolved conflicts are recorded for inspection; they never
//! block the command itself.

use crate::activity::{ActivityLog, ActivityLogEntry, ActivityStats, CommandRecord, LogFilter};
use crate::conflict::{ConflictFilter, ConflictInfo, ConflictResolver};
use crate::models::{generate_id, EntityKind, EventAction, EventType, SyncEvent};
use crate::sync::{SyncClientConfig, SyncManager, SyncServerConfig, SyncStats};
use crate::{Result, SharedStore};
use chrono::{Duration, Utc};
use std::net::SocketAddr;
use tokio::sync::Mutex;

/// How far back the conflict scan looks.
const SCAN_WINDOW_MS: i64 = 10_000;
/// How many recent commands the scan compares against.
const SCAN_LIMIT: usize = 10;

/// A recorded command plus whatever conflicts it triggered.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub entry: ActivityLogEntry,
    pub conflicts: Vec<ConflictInfo>,
}

/// Shared context for one process.
pub struct CoreContext {
    store: SharedStore,
    activity: Mutex<ActivityLog>,
    conflicts: Mutex<ConflictResolver>,
    sync: Mutex<SyncManager>,
}

impl CoreContext {
    pub fn new(store: SharedStore) -> Self {
        CoreContext {
            sync: Mutex::new(SyncManager::new(store.clone())),
            store,
            activity: Mutex::new(ActivityLog::new()),
            conflicts: Mutex::new(ConflictResolver::new()),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Log a command, scan the recent window for conflicts, run resolution,
    /// and broadcast any conflict found. The command is never blocked; an
    /// unresolved conflict stays recorded for manual handling.
    pub async fn record_command(&self, record: CommandRecord) -> Result<CommandOutcome> {
        let (entry, recent) = {
            let mut activity = self.activity.lock().await;
            let entry = activity.log(record);
            let recent = activity.get(&LogFilter {
                since: Some(Utc::now() - Duration::milliseconds(SCAN_WINDOW_MS)),
                limit: Some(SCAN_LIMIT),
                ..Default::default()
            });
            (entry, recent)
        };

        let mut found = Vec::new();
        {
            let mut resolver = self.conflicts.lock().await;
            for other in recent.iter().filter(|e| e.id != entry.id) {
                if let Some(conflict) = resolver.detect_and_resolve(&entry, other)? {
                    found.push(conflict);
                }
            }
        }

        if !found.is_empty() {
            let sync = self.sync.lock().await;
            for conflict in &found {
                let event = conflict_event(&entry, conflict)?;
                if let Err(e) = sync.broadcast_event(&event).await {
                    tracing::error!(conflict = %conflict.id, error = %e, "failed to broadcast conflict");
                }
            }
        }

        Ok(CommandOutcome {
            entry,
            conflicts: found,
        })
    }

    pub async fn get_logs(&self, filter: &LogFilter) -> Vec<ActivityLogEntry> {
        self.activity.lock().await.get(filter)
    }

    pub async fn activity_stats(&self) -> ActivityStats {
        self.activity.lock().await.stats()
    }

    /// Drop log entries older than the cutoff (all of them when `None`).
    pub async fn clear_logs(&self, older_than: Option<chrono::DateTime<Utc>>) -> usize {
        self.activity.lock().await.clear(older_than)
    }

    pub async fn get_conflicts(&self, filter: &ConflictFilter) -> Vec<ConflictInfo> {
        self.conflicts.lock().await.get_conflicts(filter)
    }

    // --- sync wiring ------------------------------------------------------------

    pub async fn start_sync_server(&self, config: SyncServerConfig) -> Result<SocketAddr> {
        self.sync.lock().await.start_server(config).await
    }

    pub async fn start_sync_client(&self, config: SyncClientConfig) -> Result<()> {
        self.sync.lock().await.start_client(config).await
    }

    pub async fn stop_sync(&self) {
        self.sync.lock().await.stop().await
    }

    pub async fn sync_stats(&self) -> Result<SyncStats> {
        self.sync.lock().await.stats().await
    }

    /// Access the sync manager for outbound entity-change broadcasts.
    pub async fn sync(&self) -> tokio::sync::MutexGuard<'_, SyncManager> {
        self.sync.lock().await
    }
}

/// Wrap a conflict in the `sync.conflict` event envelope.
fn conflict_event(entry: &ActivityLogEntry, conflict: &ConflictInfo) -> Result<SyncEvent> {
    Ok(SyncEvent {
        id: generate_id("evt"),
        event_type: EventType::SyncConflict,
        entity_type: EntityKind::Event,
        entity_id: conflict.id.clone(),
        action: EventAction::Create,
        data: serde_json::to_value(conflict)?,
        previous_data: None,
        timestamp: Utc::now(),
        source: entry.source,
        metadata: serde_json::Map::new(),
    })
}
