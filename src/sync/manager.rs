//! Orchestrates the sync role of a process.
//!
//! A process runs at most one server and one client. Outbound entity
//! changes become [`SyncEvent`]s and are broadcast through whichever role
//! is active; inbound events from the server are applied to the local
//! store. When no role is active, events still land in the local event log
//! so the history stays complete.

use crate::models::{
    Agent, EntityKind, EventAction, EventType, GlobalConfig, Project, SyncEvent, Task,
    GLOBAL_CONFIG_ID,
};
use crate::storage::{repository, EventRepository};
use crate::sync::client::{ClientEvent, SyncClient, SyncClientConfig};
use crate::sync::server::{SyncServer, SyncServerConfig};
use crate::{Error, Result, SharedStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Point-in-time counters for the sync layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_connections: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_connected: Option<bool>,
    pub events_processed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<DateTime<Utc>>,
}

/// The sync coordinator for one process.
pub struct SyncManager {
    store: SharedStore,
    server: Option<SyncServer>,
    client: Option<SyncClient>,
    apply_task: Option<tokio::task::JoinHandle<()>>,
}

impl SyncManager {
    pub fn new(store: SharedStore) -> Self {
        SyncManager {
            store,
            server: None,
            client: None,
            apply_task: None,
        }
    }

    /// Start serving other processes. Fails if a server is already running.
    pub async fn start_server(&mut self, config: SyncServerConfig) -> Result<SocketAddr> {
        if self.server.is_some() {
            return Err(Error::InvalidInput("server already started".to_string()));
        }
        let server = SyncServer::bind(self.store.clone(), config).await?;
        let addr = server.local_addr();
        self.server = Some(server);
        Ok(addr)
    }

    /// Connect to another process's server and start applying its events to
    /// the local store. Subscribes to every topic. Fails if a client is
    /// already running.
    pub async fn start_client(&mut self, config: SyncClientConfig) -> Result<()> {
        if self.client.is_some() {
            return Err(Error::InvalidInput("client already started".to_string()));
        }
        let (client, event_rx) = SyncClient::connect(config);
        client.subscribe(&EventType::ALL)?;
        self.apply_task = Some(tokio::spawn(apply_loop(self.store.clone(), event_rx)));
        self.client = Some(client);
        Ok(())
    }

    /// Shut down whichever roles are active.
    pub async fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
        if let Some(client) = self.client.take() {
            client.disconnect().await;
        }
        if let Some(task) = self.apply_task.take() {
            task.abort();
        }
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr())
    }

    pub fn is_client_connected(&self) -> bool {
        self.client.as_ref().map(|c| c.is_connected()).unwrap_or(false)
    }

    // --- outbound changes -----------------------------------------------------

    pub async fn sync_agent_change(
        &self,
        action: EventAction,
        agent: &Agent,
        previous: Option<&Agent>,
    ) -> Result<Option<SyncEvent>> {
        self.sync_change(EntityKind::Agent, action, &agent.id, agent, previous)
            .await
    }

    pub async fn sync_project_change(
        &self,
        action: EventAction,
        project: &Project,
        previous: Option<&Project>,
    ) -> Result<Option<SyncEvent>> {
        self.sync_change(EntityKind::Project, action, &project.id, project, previous)
            .await
    }

    pub async fn sync_task_change(
        &self,
        action: EventAction,
        task: &Task,
        previous: Option<&Task>,
    ) -> Result<Option<SyncEvent>> {
        self.sync_change(EntityKind::Task, action, &task.id, task, previous)
            .await
    }

    pub async fn sync_config_change(
        &self,
        config: &GlobalConfig,
        previous: Option<&GlobalConfig>,
    ) -> Result<Option<SyncEvent>> {
        self.sync_change(
            EntityKind::Config,
            EventAction::Update,
            GLOBAL_CONFIG_ID,
            config,
            previous,
        )
        .await
    }

    /// Broadcast a pre-built event (used for conflict notifications).
    pub async fn broadcast_event(&self, event: &SyncEvent) -> Result<()> {
        self.dispatch(event).await
    }

    async fn sync_change<T: Serialize>(
        &self,
        kind: EntityKind,
        action: EventAction,
        entity_id: &str,
        entity: &T,
        previous: Option<&T>,
    ) -> Result<Option<SyncEvent>> {
        let previous = match previous {
            Some(p) => Some(serde_json::to_value(p)?),
            None => None,
        };
        let event = match SyncEvent::for_mutation(
            kind,
            action,
            entity_id,
            serde_json::to_value(entity)?,
            previous,
            crate::models::EventSource::Api,
        ) {
            Some(e) => e,
            None => return Ok(None),
        };
        self.dispatch(&event).await?;
        Ok(Some(event))
    }

    async fn dispatch(&self, event: &SyncEvent) -> Result<()> {
        match (&self.server, &self.client) {
            (Some(server), _) => {
                // The server path persists before fanning out.
                server.broadcast(event).await?;
                if let Some(client) = &self.client {
                    client.send_event(event.clone())?;
                }
            }
            (None, Some(client)) => {
                // The remote server owns persistence for client-sent events.
                client.send_event(event.clone())?;
            }
            (None, None) => {
                let store = self.store.lock().await;
                EventRepository::new(store.conn()).insert(event)?;
            }
        }
        Ok(())
    }

    /// Counters over the persisted event log plus live connection state.
    pub async fn stats(&self) -> Result<SyncStats> {
        let (events_processed, last_event_time) = {
            let store = self.store.lock().await;
            let repo = EventRepository::new(store.conn());
            let recent = repo.find_recent(1)?;
            (repo.count()?, recent.first().map(|e| e.timestamp))
        };
        let server_connections = match &self.server {
            Some(server) => Some(server.client_count().await),
            None => None,
        };
        Ok(SyncStats {
            server_connections,
            client_connected: self.client.as_ref().map(|c| c.is_connected()),
            events_processed,
            last_event_time,
        })
    }
}

/// Apply events received from the server to the local store.
async fn apply_loop(store: SharedStore, mut event_rx: mpsc::UnboundedReceiver<ClientEvent>) {
    while let Some(client_event) = event_rx.recv().await {
        match client_event {
            ClientEvent::Event(event) => {
                let store = store.lock().await;
                // Conflict notifications carry no entity mutation; they are
                // recorded in the local event log and nothing else.
                let applied = if event.entity_type == EntityKind::Event {
                    EventRepository::new(store.conn()).insert(&event)
                } else {
                    repository::apply_mutation(
                        store.conn(),
                        event.entity_type,
                        event.action,
                        &event.entity_id,
                        &event.data,
                    )
                };
                match applied {
                    Ok(()) => {
                        tracing::debug!(event = %event.id, topic = %event.event_type, "sync event applied");
                    }
                    Err(e) => {
                        tracing::error!(event = %event.id, error = %e, "failed to apply sync event");
                    }
                }
            }
            ClientEvent::Connected => tracing::info!("sync client connected"),
            ClientEvent::Disconnected => tracing::warn!("sync client disconnected"),
            ClientEvent::GaveUp => {
                tracing::error!("sync client gave up reconnecting");
            }
        }
    }
}
