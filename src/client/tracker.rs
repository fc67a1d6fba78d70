//! Live roster of the other clients registered with the hub.

use crate::{
    client::{invoke_handler_safely, Callable, CallableClient, ConnectionSlot},
    connection::HubConnection,
    error::SampError,
    protocol::{keys, Message, RpcMap, RpcValue},
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// What a roster change event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Register,
    Unregister,
    Meta,
    Subs,
    /// The whole id set was (re)loaded.
    Ids,
}

/// Everything known about one registered client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub id: String,
    pub metadata: Option<RpcMap>,
    pub subscriptions: Option<RpcMap>,
}

type ChangeListener = Arc<dyn Fn(Option<&str>, ChangeKind, Option<&RpcMap>) + Send + Sync>;

#[derive(Debug, Default)]
struct Roster {
    ids: BTreeSet<String>,
    metas: HashMap<String, RpcMap>,
    subs: HashMap<String, RpcMap>,
}

#[derive(Default)]
struct TrackerState {
    roster: Mutex<Roster>,
    listener: RwLock<Option<ChangeListener>>,
}

impl TrackerState {
    fn roster(&self) -> MutexGuard<'_, Roster> {
        self.roster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Notifies the listener; called with the roster lock released.
    fn changed(&self, id: Option<&str>, kind: ChangeKind, value: Option<&RpcMap>) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            if let Err(failure) = invoke_handler_safely(|| {
                listener(id, kind, value);
                Ok(())
            }) {
                warn!(?kind, error = %failure, "Roster listener failed");
            }
        }
    }
}

/// A [`CallableClient`] that keeps track of the hub's other clients.
#[derive(Clone)]
pub struct ClientTracker {
    client: CallableClient,
    state: Arc<TrackerState>,
}

impl fmt::Debug for ClientTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTracker")
            .field("client", &self.client)
            .field("roster", &*self.state.roster())
            .finish()
    }
}

fn event_id(message: &Message) -> anyhow::Result<String> {
    message
        .param_str(keys::PARAM_ID)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("{} event without client id", message.mtype))
}

fn event_map(message: &Message, key: &str) -> anyhow::Result<RpcMap> {
    message
        .params
        .get(key)
        .and_then(RpcValue::as_map)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("{} event without {key} map", message.mtype))
}

fn close_attached(slot: &ConnectionSlot, reason: &str) {
    info!(reason, "Hub is going away; closing connection");
    if let Some(connection) = slot.get() {
        connection.close();
    }
}

impl Default for ClientTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientTracker {
    pub fn new() -> Self {
        let state = Arc::new(TrackerState::default());
        let client = CallableClient::new();
        let slot = client.connection_slot();

        let client = {
            let slot = slot.clone();
            client.on(keys::EVENT_SHUTDOWN, move |_, _, _| {
                close_attached(&slot, keys::EVENT_SHUTDOWN);
                Ok(None)
            })
        };
        let client = client.on(keys::HUB_DISCONNECT, move |_, _, _| {
            close_attached(&slot, keys::HUB_DISCONNECT);
            Ok(None)
        });

        let tracked = Arc::clone(&state);
        let client = client.on(keys::EVENT_REGISTER, move |_, message, _| {
            let id = event_id(message)?;
            tracked.roster().ids.insert(id.clone());
            tracked.changed(Some(&id), ChangeKind::Register, None);
            Ok(None)
        });

        let tracked = Arc::clone(&state);
        let client = client.on(keys::EVENT_UNREGISTER, move |_, message, _| {
            let id = event_id(message)?;
            {
                let mut roster = tracked.roster();
                roster.ids.remove(&id);
                roster.metas.remove(&id);
                roster.subs.remove(&id);
            }
            tracked.changed(Some(&id), ChangeKind::Unregister, None);
            Ok(None)
        });

        let tracked = Arc::clone(&state);
        let client = client.on(keys::EVENT_METADATA, move |_, message, _| {
            let id = event_id(message)?;
            let metadata = event_map(message, keys::PARAM_METADATA)?;
            tracked.roster().metas.insert(id.clone(), metadata.clone());
            tracked.changed(Some(&id), ChangeKind::Meta, Some(&metadata));
            Ok(None)
        });

        let tracked = Arc::clone(&state);
        let client = client.on(keys::EVENT_SUBSCRIPTIONS, move |_, message, _| {
            let id = event_id(message)?;
            let subscriptions = event_map(message, keys::PARAM_SUBSCRIPTIONS)?;
            tracked
                .roster()
                .subs
                .insert(id.clone(), subscriptions.clone());
            tracked.changed(Some(&id), ChangeKind::Subs, Some(&subscriptions));
            Ok(None)
        });

        Self { client, state }
    }

    /// Adds an application handler alongside the roster handlers.
    pub fn on<F>(mut self, mtype: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, &Message, bool) -> anyhow::Result<Option<RpcMap>> + Send + Sync + 'static,
    {
        self.client = self.client.on(mtype, handler);
        self
    }

    /// Installs the listener for roster changes.
    ///
    /// The listener receives the client id (`None` for [`ChangeKind::Ids`])
    /// and, for metadata and subscription changes, the new map.
    pub fn on_change<F>(self, listener: F) -> Self
    where
        F: Fn(Option<&str>, ChangeKind, Option<&RpcMap>) + Send + Sync + 'static,
    {
        *self
            .state
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
        self
    }

    pub fn ids(&self) -> Vec<String> {
        self.state.roster().ids.iter().cloned().collect()
    }

    pub fn metadata(&self, id: &str) -> Option<RpcMap> {
        self.state.roster().metas.get(id).cloned()
    }

    pub fn subscriptions(&self, id: &str) -> Option<RpcMap> {
        self.state.roster().subs.get(id).cloned()
    }

    pub fn clients(&self) -> Vec<ClientRecord> {
        let roster = self.state.roster();
        roster
            .ids
            .iter()
            .map(|id| ClientRecord {
                id: id.clone(),
                metadata: roster.metas.get(id).cloned(),
                subscriptions: roster.subs.get(id).cloned(),
            })
            .collect()
    }

    /// The client's declared `samp.name`, or `[id]` when unknown.
    pub fn get_name(&self, id: &str) -> String {
        self.state
            .roster()
            .metas
            .get(id)
            .and_then(|meta| meta.get(keys::NAME))
            .and_then(RpcValue::as_str)
            .map_or_else(|| format!("[{id}]"), str::to_string)
    }
}

#[async_trait]
impl Callable for ClientTracker {
    fn dispatcher(&self) -> &CallableClient {
        &self.client
    }

    /// Loads the full roster, then raises a single [`ChangeKind::Ids`] event.
    async fn init(&self, connection: &HubConnection) -> Result<(), SampError> {
        self.client.attach(connection);

        let ids = connection.get_registered_clients().await?;
        debug!(count = ids.len(), "Loading client roster");

        let fetches = ids.iter().map(|id| async move {
            let (metadata, subscriptions) = tokio::join!(
                connection.get_metadata(id),
                connection.get_subscriptions(id)
            );
            (id, metadata, subscriptions)
        });
        let fetched = join_all(fetches).await;

        let mut roster = Roster::default();
        for (id, metadata, subscriptions) in fetched {
            roster.ids.insert(id.clone());
            match metadata {
                Ok(metadata) => {
                    roster.metas.insert(id.clone(), metadata);
                }
                Err(err) => warn!(%id, error = %err, "Failed to fetch client metadata"),
            }
            match subscriptions {
                Ok(subscriptions) => {
                    roster.subs.insert(id.clone(), subscriptions);
                }
                Err(err) => warn!(%id, error = %err, "Failed to fetch client subscriptions"),
            }
        }
        *self.state.roster() = roster;

        self.state.changed(None, ChangeKind::Ids, None);
        Ok(())
    }
}
