//! Lifecycle registry for downstream clients.
//!
//! Shared across invocations. Start and close transitions are serialized per
//! server by the slot lock; calls go through cloned handles and never hold
//! the slot lock across downstream I/O.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;

use crate::client::{ClientState, DownstreamClient};
use crate::config::Catalog;
use crate::error::{BridgeError, Result};
use crate::naming::ServerName;

/// Grace period for one client during `shutdown`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct ClientPool {
    catalog: Arc<Catalog>,
    slots: tokio::sync::Mutex<BTreeMap<ServerName, Arc<Slot>>>,
}

struct Slot {
    state: tokio::sync::Mutex<SlotState>,
}

enum SlotState {
    Cold,
    Ready(Arc<DownstreamClient>),
    /// Restart exhausted; sticky until shutdown.
    Failed(String),
    Closing,
}

impl ClientPool {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            slots: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Names in `names` that no server record exists for.
    pub fn unknown_names<'a>(&self, names: &'a [ServerName]) -> Vec<&'a ServerName> {
        names
            .iter()
            .filter(|name| !self.catalog.contains(name.as_str()))
            .collect()
    }

    /// Starts every named client that is still cold. Fails fast on unknown
    /// names before starting anything.
    pub async fn ensure(&self, names: &[ServerName]) -> Result<()> {
        let unknown = self.unknown_names(names);
        if !unknown.is_empty() {
            let list = unknown
                .iter()
                .map(|name| name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(BridgeError::UnknownServer(list));
        }

        for name in names {
            self.acquire(name).await?;
        }
        Ok(())
    }

    /// Returns a ready client, starting or restarting it if needed.
    ///
    /// A client found dead gets one automatic restart; if that restart fails
    /// the slot goes to `Failed` and stays there. The (re)start runs inline
    /// on the caller's path, so it is charged to the caller's own deadline.
    pub async fn acquire(&self, name: &ServerName) -> Result<Arc<DownstreamClient>> {
        let record = self
            .catalog
            .get(name.as_str())
            .ok_or_else(|| BridgeError::UnknownServer(name.to_string()))?
            .clone();

        let slot = self.slot(name).await;
        let mut state = slot.state.lock().await;
        match &*state {
            SlotState::Ready(client) if client.is_alive() => Ok(client.clone()),
            SlotState::Failed(reason) => Err(BridgeError::DownstreamUnavailable(format!(
                "server {name} is marked failed: {reason}"
            ))),
            SlotState::Closing => Err(BridgeError::DownstreamUnavailable(format!(
                "server {name} is shutting down"
            ))),
            SlotState::Ready(_) => {
                // Crashed since last use: the one automatic restart.
                tracing::warn!(server = %name, "downstream client died, restarting");
                match DownstreamClient::start(&record).await {
                    Ok(client) => {
                        let client = Arc::new(client);
                        *state = SlotState::Ready(client.clone());
                        Ok(client)
                    }
                    Err(err) => {
                        let reason = err.to_string();
                        *state = SlotState::Failed(reason.clone());
                        Err(BridgeError::DownstreamUnavailable(reason))
                    }
                }
            }
            SlotState::Cold => {
                tracing::info!(server = %name, "starting downstream client");
                let client = Arc::new(DownstreamClient::start(&record).await?);
                *state = SlotState::Ready(client.clone());
                Ok(client)
            }
        }
    }

    /// Returns the ready client without side effects.
    pub async fn get(&self, name: &ServerName) -> Result<Arc<DownstreamClient>> {
        let slot = self.slot(name).await;
        let state = slot.state.lock().await;
        match &*state {
            SlotState::Ready(client) if client.is_alive() => Ok(client.clone()),
            SlotState::Failed(reason) => Err(BridgeError::DownstreamUnavailable(format!(
                "server {name} is marked failed: {reason}"
            ))),
            _ => Err(BridgeError::DownstreamUnavailable(format!(
                "server {name} is not ready"
            ))),
        }
    }

    /// Started-and-alive client, if any, without starting one.
    pub async fn ready(&self, name: &str) -> Option<Arc<DownstreamClient>> {
        let slots = self.slots.lock().await;
        let slot = slots.get(name)?.clone();
        drop(slots);
        let state = slot.state.lock().await;
        match &*state {
            SlotState::Ready(client) if client.is_alive() => Some(client.clone()),
            _ => None,
        }
    }

    pub async fn state(&self, name: &str) -> ClientState {
        let slots = self.slots.lock().await;
        let Some(slot) = slots.get(name).cloned() else {
            return ClientState::Cold;
        };
        drop(slots);
        let state = slot.state.lock().await;
        match &*state {
            SlotState::Cold => ClientState::Cold,
            SlotState::Ready(client) if client.is_alive() => ClientState::Ready,
            SlotState::Ready(_) => ClientState::Failed,
            SlotState::Failed(_) => ClientState::Failed,
            SlotState::Closing => ClientState::Closing,
        }
    }

    pub async fn is_failed(&self, name: &str) -> bool {
        matches!(self.state(name).await, ClientState::Failed)
    }

    /// Dispatch helper: acquire (restarting if needed) and call.
    pub async fn call_tool(
        &self,
        name: &ServerName,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let client = self.acquire(name).await?;
        client.call_tool(tool, arguments, timeout).await
    }

    /// Cached (or change-refreshed) tool list for a server, starting it if
    /// cold.
    pub async fn list_tools(&self, name: &ServerName) -> Result<Vec<Value>> {
        let client = self.acquire(name).await?;
        client.list_tools().await
    }

    /// Concurrently closes every client under one global grace period.
    pub async fn shutdown(&self) {
        let slots = {
            let mut slots = self.slots.lock().await;
            std::mem::take(&mut *slots)
        };

        let mut closing = JoinSet::new();
        for (name, slot) in slots {
            closing.spawn(async move {
                let mut state = slot.state.lock().await;
                if let SlotState::Ready(client) = &*state {
                    let client = client.clone();
                    *state = SlotState::Closing;
                    drop(state);
                    client.close(SHUTDOWN_GRACE).await;
                    tracing::debug!(server = %name, "downstream client closed");
                }
            });
        }
        while closing.join_next().await.is_some() {}
    }

    async fn slot(&self, name: &ServerName) -> Arc<Slot> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    state: tokio::sync::Mutex::new(SlotState::Cold),
                })
            })
            .clone()
    }

    /// Test seam: installs an already-connected client as ready.
    #[cfg(test)]
    pub(crate) async fn insert_ready(&self, client: Arc<DownstreamClient>) {
        let slot = self.slot(client.name()).await;
        let mut state = slot.state.lock().await;
        *state = SlotState::Ready(client);
    }
}
