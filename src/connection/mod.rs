//! Registered SAMP hub sessions.
//!
//! This module handles one registration's lifecycle:
//! - Registering and holding the hub-issued private key,
//! - Keyed proxy calls for the hub's Web Profile methods,
//! - The reverse-callback poll loop,
//! - Idempotent close and unregistration.

pub mod manager;
mod methods;
mod poll;

use crate::{
    client::{invoke_handler_safely, Callable},
    config::HubConfig,
    error::SampError,
    protocol::{
        check_params, keys, Message, MethodCall, RegistrationInfo, Response, RpcMap, RpcValue,
        ValueKind,
    },
    transport::RpcTransport,
};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, info, warn};

pub use manager::{AvailabilityHandle, Connector, ConnectorBuilder};
pub use methods::{HubMethod, WEBHUB_PREFIX};
pub use poll::{FAST_FAILURE_THRESHOLD, PULL_CALLBACKS_TIMEOUT_SECS};

type CloseHook = Box<dyn FnOnce() + Send>;

/// Lifecycle state of a [`HubConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Registered,
    /// Unregistered but not yet closed.
    Unregistered,
    Closed,
}

struct Session {
    registration: Option<RegistrationInfo>,
    closed: bool,
    poll_task: Option<JoinHandle<()>>,
    on_close: Option<CloseHook>,
}

struct Inner {
    transport: RpcTransport,
    session: Mutex<Session>,
}

/// An active registration with a SAMP hub.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<Inner>,
}

/// A non-owning reference to a [`HubConnection`].
#[derive(Clone, Default)]
pub struct WeakHubConnection(Weak<Inner>);

impl WeakHubConnection {
    pub fn upgrade(&self) -> Option<HubConnection> {
        self.0.upgrade().map(|inner| HubConnection { inner })
    }

    pub fn points_to(&self, connection: &HubConnection) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&connection.inner))
    }
}

impl fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConnection")
            .field("endpoint", &self.inner.transport.endpoint().as_str())
            .field("state", &self.state())
            .field("polling", &self.is_polling())
            .finish()
    }
}

impl HubConnection {
    /// Registers `name` with the hub described by `config`.
    ///
    /// # Errors
    ///
    /// Any failure, including a hub fault or a reply without a private key,
    /// is returned as [`SampError::Registration`]; no connection exists then.
    pub async fn register(name: &str, config: &HubConfig) -> Result<Self, SampError> {
        let registration_error = |err: SampError| SampError::Registration(Box::new(err));

        let transport = RpcTransport::new(config).map_err(registration_error)?;
        let call = MethodCall::new(methods::REGISTER, vec![RpcValue::map([(keys::NAME, name)])]);
        call.check_params(&[ValueKind::Map])?;

        let value = transport.execute(&call).await.map_err(registration_error)?;
        let registration =
            RegistrationInfo::from_value(value).map_err(|e| registration_error(e.into()))?;

        info!(
            name,
            self_id = registration.self_id().unwrap_or("?"),
            "Registered with hub"
        );
        Ok(Self::from_registration(transport, registration))
    }

    /// Wraps an existing registration.
    pub fn from_registration(transport: RpcTransport, registration: RegistrationInfo) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                session: Mutex::new(Session {
                    registration: Some(registration),
                    closed: false,
                    poll_task: None,
                    on_close: None,
                }),
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn downgrade(&self) -> WeakHubConnection {
        WeakHubConnection(Arc::downgrade(&self.inner))
    }

    pub fn ptr_eq(&self, other: &HubConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> ConnectionState {
        let session = self.session();
        if session.closed {
            ConnectionState::Closed
        } else if session.registration.is_some() {
            ConnectionState::Registered
        } else {
            ConnectionState::Unregistered
        }
    }

    pub fn is_closed(&self) -> bool {
        self.session().closed
    }

    pub fn is_registered(&self) -> bool {
        self.state() == ConnectionState::Registered
    }

    /// Whether a reverse-callback poll loop is running.
    pub fn is_polling(&self) -> bool {
        self.session()
            .poll_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn registration(&self) -> Option<RegistrationInfo> {
        self.session().registration.clone()
    }

    fn private_key(&self) -> Result<String, SampError> {
        let session = self.session();
        match &session.registration {
            Some(registration) => Ok(registration.private_key().to_string()),
            None if session.closed => Err(SampError::Closed),
            None => Err(SampError::NotRegistered),
        }
    }

    /// Prefixes `url` with the hub's URL translator, if it announced one.
    pub fn translate_url(&self, url: &str) -> String {
        let session = self.session();
        let prefix = session
            .registration
            .as_ref()
            .and_then(RegistrationInfo::url_translator)
            .unwrap_or_default();
        format!("{prefix}{url}")
    }

    /// Installs the hook run once when the connection closes.
    pub fn set_on_close<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.session().on_close = Some(Box::new(hook));
    }

    pub fn clear_on_close(&self) {
        self.session().on_close = None;
    }

    fn keyed_call(&self, method_name: &str, params: Vec<RpcValue>) -> Result<MethodCall, SampError> {
        let mut keyed = Vec::with_capacity(params.len() + 1);
        keyed.push(RpcValue::String(self.private_key()?));
        keyed.extend(params);
        Ok(MethodCall::new(method_name, keyed))
    }

    /// Calls `method` with `params`, returning the raw result.
    ///
    /// # Errors
    ///
    /// [`SampError::Protocol`] if `params` does not match the method's
    /// signature (nothing is sent then); otherwise transport and fault errors
    /// are returned to the caller and the connection is left as it is.
    pub async fn invoke(
        &self,
        method: HubMethod,
        params: Vec<RpcValue>,
    ) -> Result<RpcValue, SampError> {
        check_params(&params, method.signature())?;
        let call = self.keyed_call(&method.method_name(), params)?;
        self.inner.transport.execute(&call).await
    }

    /// Calls `method` in the background with no error handler.
    ///
    /// Any transport failure or fault closes the connection.
    ///
    /// # Errors
    ///
    /// Bad parameters, a closed connection or no current Tokio runtime are
    /// reported here and nothing is sent.
    pub fn fire(
        &self,
        method: HubMethod,
        params: Vec<RpcValue>,
    ) -> Result<JoinHandle<Option<RpcValue>>, SampError> {
        check_params(&params, method.signature())?;
        let call = self.keyed_call(&method.method_name(), params)?;
        call.validate()?;
        let runtime = Handle::try_current().map_err(|_| SampError::NoRuntime)?;
        let connection = self.clone();
        Ok(runtime.spawn(async move {
            match connection.inner.transport.execute(&call).await {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(method = %call.method_name, error = %err, "Unhandled hub call failure; closing connection");
                    connection.close();
                    None
                }
            }
        }))
    }

    /// Sends `message` to one client and expects a reply later.
    ///
    /// # Arguments
    ///
    /// * `recipient_id` - Public id of the receiving client.
    /// * `msg_tag` - Tag echoed back with the reply, so it can be routed to
    ///   the handler registered with [`CallableClient::on_reply`].
    /// * `message` - The message to deliver.
    ///
    /// # Returns
    ///
    /// * `Ok(String)` - The hub-assigned message id.
    /// * `Err(SampError)` - On a transport failure, a fault or a non-string result.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use sampweb::{HubConfig, HubConnection, Message, RpcValue};
    ///
    /// # async fn example() -> Result<(), sampweb::SampError> {
    /// let conn = HubConnection::register("Viewer", &HubConfig::default()).await?;
    /// let message = Message::new(
    ///     "image.load.fits",
    ///     [("url".to_string(), RpcValue::from("http://localhost/a.fits"))].into(),
    /// );
    /// let msg_id = conn.call("c1", "load-1", &message).await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// [`CallableClient::on_reply`]: crate::client::CallableClient::on_reply
    pub async fn call(
        &self,
        recipient_id: &str,
        msg_tag: &str,
        message: &Message,
    ) -> Result<String, SampError> {
        let params = vec![recipient_id.into(), msg_tag.into(), message.to_value()];
        Ok(self
            .invoke(HubMethod::Call, params)
            .await?
            .into_string("message id")?)
    }

    /// Sends `message` to every subscribed client.
    ///
    /// # Returns
    ///
    /// * `Ok(RpcMap)` - Recipient id to message id, one entry per recipient.
    /// * `Err(SampError)` - On failure, or if the hub answers with a non-map.
    pub async fn call_all(&self, msg_tag: &str, message: &Message) -> Result<RpcMap, SampError> {
        let params = vec![msg_tag.into(), message.to_value()];
        Ok(self
            .invoke(HubMethod::CallAll, params)
            .await?
            .into_map("callAll result")?)
    }

    /// Sends `message` to one client and waits for its reply.
    ///
    /// # Arguments
    ///
    /// * `recipient_id` - Public id of the receiving client.
    /// * `message` - The message to deliver.
    /// * `timeout_secs` - How long the hub waits for the reply; `0` means no limit.
    ///
    /// The HTTP request itself is still bound by the configured request timeout.
    pub async fn call_and_wait(
        &self,
        recipient_id: &str,
        message: &Message,
        timeout_secs: u64,
    ) -> Result<Response, SampError> {
        let params = vec![
            recipient_id.into(),
            message.to_value(),
            timeout_secs.to_string().into(),
        ];
        let value = self.invoke(HubMethod::CallAndWait, params).await?;
        Ok(Response::from_value(value)?)
    }

    /// Replaces this client's metadata (`samp.name`, `samp.icon.url`, ...).
    pub async fn declare_metadata(&self, metadata: RpcMap) -> Result<(), SampError> {
        self.invoke(HubMethod::DeclareMetadata, vec![RpcValue::Map(metadata)])
            .await
            .map(drop)
    }

    /// Replaces the set of mtypes this client accepts. Keys may use `*` wildcards.
    pub async fn declare_subscriptions(&self, subscriptions: RpcMap) -> Result<(), SampError> {
        self.invoke(
            HubMethod::DeclareSubscriptions,
            vec![RpcValue::Map(subscriptions)],
        )
        .await
        .map(drop)
    }

    /// Fetches the metadata another client has declared.
    ///
    /// # Errors
    ///
    /// A fault if the hub does not know `client_id`.
    pub async fn get_metadata(&self, client_id: &str) -> Result<RpcMap, SampError> {
        Ok(self
            .invoke(HubMethod::GetMetadata, vec![client_id.into()])
            .await?
            .into_map("metadata")?)
    }

    /// Public ids of every other registered client.
    pub async fn get_registered_clients(&self) -> Result<Vec<String>, SampError> {
        let ids = self
            .invoke(HubMethod::GetRegisteredClients, vec![])
            .await?
            .into_list("registered clients")?;
        Ok(ids
            .into_iter()
            .map(|id| id.into_string("client id"))
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Clients subscribed to `mtype`, mapped to their subscription options.
    pub async fn get_subscribed_clients(&self, mtype: &str) -> Result<RpcMap, SampError> {
        Ok(self
            .invoke(HubMethod::GetSubscribedClients, vec![mtype.into()])
            .await?
            .into_map("subscribed clients")?)
    }

    pub async fn get_subscriptions(&self, client_id: &str) -> Result<RpcMap, SampError> {
        Ok(self
            .invoke(HubMethod::GetSubscriptions, vec![client_id.into()])
            .await?
            .into_map("subscriptions")?)
    }

    /// Sends `message` to one client without expecting a reply.
    pub async fn notify(&self, recipient_id: &str, message: &Message) -> Result<(), SampError> {
        self.invoke(HubMethod::Notify, vec![recipient_id.into(), message.to_value()])
            .await
            .map(drop)
    }

    /// Notifies every subscribed client; returns the recipients the hub named.
    pub async fn notify_all(&self, message: &Message) -> Result<Vec<String>, SampError> {
        let value = self
            .invoke(HubMethod::NotifyAll, vec![message.to_value()])
            .await?;
        Ok(value
            .as_list()
            .map(|ids| {
                ids.iter()
                    .filter_map(RpcValue::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Keyed liveness check.
    pub async fn ping(&self) -> Result<(), SampError> {
        self.invoke(HubMethod::Ping, vec![]).await.map(drop)
    }

    /// Answers the call identified by `msg_id`.
    ///
    /// # Arguments
    ///
    /// * `msg_id` - The id the hub assigned when delivering the call.
    /// * `response` - The response envelope; see [`Response::ok`] and [`Response::error`].
    pub async fn reply(&self, msg_id: &str, response: &Response) -> Result<(), SampError> {
        self.invoke(HubMethod::Reply, vec![msg_id.into(), response.to_value()])
            .await
            .map(drop)
    }

    /// Enables reverse callbacks for `callable` and starts polling for them.
    ///
    /// Returns once the hub has acknowledged and the callable's
    /// subscriptions have been declared. If the hub refuses reverse
    /// callbacks the connection is closed.
    pub async fn set_callable(&self, callable: Arc<dyn Callable>) -> Result<(), SampError> {
        self.stop_polling();
        callable.dispatcher().attach(self);

        if let Err(err) = self.allow_reverse_callbacks(true).await {
            warn!(error = %err, "Hub refused reverse callbacks; closing connection");
            self.close();
            return Err(err);
        }
        self.start_polling(Arc::clone(&callable));

        let subscriptions = callable.dispatcher().calculate_subscriptions();
        debug!(count = subscriptions.len(), "Declaring subscriptions");
        self.declare_subscriptions(subscriptions).await
    }

    /// Stops polling and tells the hub to stop queueing callbacks.
    pub async fn clear_callable(&self) -> Result<(), SampError> {
        self.stop_polling();
        if let Err(err) = self.allow_reverse_callbacks(false).await {
            warn!(error = %err, "Failed to disable reverse callbacks; closing connection");
            self.close();
            return Err(err);
        }
        Ok(())
    }

    async fn allow_reverse_callbacks(&self, allow: bool) -> Result<(), SampError> {
        let flag = if allow { "1" } else { "0" };
        let call = self.keyed_call(methods::ALLOW_REVERSE_CALLBACKS, vec![flag.into()])?;
        self.inner.transport.execute(&call).await.map(drop)
    }

    /// Unregisters from the hub, best effort.
    ///
    /// Any outstanding poll is aborted first. The unregister call runs in the
    /// background and its failure is ignored.
    pub fn unregister(&self) {
        let (registration, poll_task) = {
            let mut session = self.session();
            (session.registration.take(), session.poll_task.take())
        };
        if let Some(task) = poll_task {
            task.abort();
        }
        let Some(registration) = registration else {
            return;
        };

        let call = MethodCall::new(
            methods::UNREGISTER,
            vec![registration.private_key().into()],
        );
        let transport = self.inner.transport.clone();
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = transport.execute(&call).await {
                        debug!(error = %err, "Unregister failed; ignoring");
                    }
                });
            }
            Err(_) => debug!("No async runtime; skipping unregister call"),
        }
        info!("Unregistered from hub");
    }

    /// Closes the connection: aborts polling, unregisters and runs the
    /// close hook. Only the first call has any effect.
    pub fn close(&self) {
        let hook = {
            let mut session = self.session();
            if session.closed {
                return;
            }
            session.closed = true;
            session.on_close.take()
        };

        debug!("Closing hub connection");
        self.unregister();

        if let Some(hook) = hook {
            if let Err(failure) = invoke_handler_safely(|| {
                hook();
                Ok(())
            }) {
                warn!(error = %failure, "Close hook failed");
            }
        }
    }
}

/// Pings the hub without registering.
///
/// Returns whether the hub answered with a result.
pub async fn ping_hub(config: &HubConfig) -> bool {
    let transport = match RpcTransport::new(config) {
        Ok(transport) => transport,
        Err(err) => {
            warn!(error = %err, "Invalid hub endpoint");
            return false;
        }
    };
    transport
        .execute(&MethodCall::new(methods::PING, vec![]))
        .await
        .is_ok()
}
