//! Application-level connection manager.
//!
//! A [`Connector`] holds at most one live [`HubConnection`] for an
//! application. It registers on demand, re-declares the application's
//! metadata, callable and subscriptions on every new connection, and
//! reports registration changes through hooks.

use crate::{
    client::{invoke_handler_safely, Callable},
    config::HubConfig,
    connection::{ping_hub, HubConnection},
    error::SampError,
    protocol::RpcMap,
};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

type RegisterHook = Arc<dyn Fn(&HubConnection) + Send + Sync>;
type UnregisterHook = Arc<dyn Fn() + Send + Sync>;
type StatusHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Status reported after a successful [`Connector::register`].
pub const STATUS_REGISTERED: &str = "registered";

/// Builder for [`Connector`].
pub struct ConnectorBuilder {
    name: String,
    config: HubConfig,
    metadata: Option<RpcMap>,
    callable: Option<Arc<dyn Callable>>,
    subscriptions: Option<RpcMap>,
    on_register: Option<RegisterHook>,
    on_unregister: Option<UnregisterHook>,
    on_status: Option<StatusHook>,
}

impl ConnectorBuilder {
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// Metadata declared on every new connection.
    pub fn metadata(mut self, metadata: RpcMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Callable installed on every new connection.
    pub fn callable(mut self, callable: Arc<dyn Callable>) -> Self {
        self.callable = Some(callable);
        self
    }

    /// Subscriptions declared once the callable is polling, replacing the
    /// ones derived from its handlers.
    pub fn subscriptions(mut self, subscriptions: RpcMap) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    pub fn on_register<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HubConnection) + Send + Sync + 'static,
    {
        self.on_register = Some(Arc::new(hook));
        self
    }

    pub fn on_unregister<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_unregister = Some(Arc::new(hook));
        self
    }

    /// Receives a short registration status text after each attempt.
    pub fn on_status<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_status = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Connector {
        Connector {
            inner: Arc::new(ConnectorInner {
                name: self.name,
                config: self.config,
                metadata: self.metadata,
                callable: self.callable,
                subscriptions: self.subscriptions,
                on_register: self.on_register,
                on_unregister: self.on_unregister,
                on_status: self.on_status,
                held: Mutex::new(None),
                establish: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

struct ConnectorInner {
    name: String,
    config: HubConfig,
    metadata: Option<RpcMap>,
    callable: Option<Arc<dyn Callable>>,
    subscriptions: Option<RpcMap>,
    on_register: Option<RegisterHook>,
    on_unregister: Option<UnregisterHook>,
    on_status: Option<StatusHook>,
    held: Mutex<Option<HubConnection>>,
    // Serialises registration so concurrent callers share one connection.
    establish: tokio::sync::Mutex<()>,
}

impl ConnectorInner {
    fn held(&self) -> MutexGuard<'_, Option<HubConnection>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unregistered(&self) {
        if let Some(hook) = &self.on_unregister {
            if let Err(failure) = invoke_handler_safely(|| {
                hook();
                Ok(())
            }) {
                warn!(error = %failure, "Unregister hook failed");
            }
        }
    }

    fn registered(&self, connection: &HubConnection) {
        if let Some(hook) = &self.on_register {
            if let Err(failure) = invoke_handler_safely(|| {
                hook(connection);
                Ok(())
            }) {
                warn!(error = %failure, "Register hook failed");
            }
        }
    }

    fn status(&self, text: &str) {
        if let Some(hook) = &self.on_status {
            if let Err(failure) = invoke_handler_safely(|| {
                hook(text);
                Ok(())
            }) {
                warn!(error = %failure, "Status hook failed");
            }
        }
    }
}

/// Keeps one application registered with the hub.
///
/// # Example
///
/// ```no_run
/// use sampweb::{Connector, Message, RpcMap, RpcValue};
///
/// #[tokio::main]
/// async fn main() -> Result<(), sampweb::SampError> {
///     let connector = Connector::builder("Sender").build();
///     let params: RpcMap = [("url".to_string(), RpcValue::from("http://x/a.fits"))].into();
///     let message = Message::new("image.load.fits", params);
///
///     connector
///         .run_with_connection(|connection| async move {
///             connection.notify_all(&message).await
///         })
///         .await??;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.inner.name)
            .field("endpoint", &self.inner.config.endpoint)
            .field("connection", &*self.inner.held())
            .finish()
    }
}

impl Connector {
    /// Starts building a connector registering as `name` with the default hub.
    pub fn builder(name: impl Into<String>) -> ConnectorBuilder {
        ConnectorBuilder {
            name: name.into(),
            config: HubConfig::default(),
            metadata: None,
            callable: None,
            subscriptions: None,
            on_register: None,
            on_unregister: None,
            on_status: None,
        }
    }

    /// The held connection, if any.
    pub fn connection(&self) -> Option<HubConnection> {
        self.inner.held().clone()
    }

    pub fn is_registered(&self) -> bool {
        self.connection().is_some_and(|c| c.is_registered())
    }

    /// Pings the hub now and then every `period`, reporting reachability.
    ///
    /// Pinging stops when the returned handle is cancelled or dropped.
    ///
    /// # Errors
    ///
    /// [`SampError::NoRuntime`] when called outside a Tokio runtime.
    pub fn on_hub_availability<F>(
        &self,
        callback: F,
        period: Duration,
    ) -> Result<AvailabilityHandle, SampError>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| SampError::NoRuntime)?;
        let config = self.inner.config.clone();
        let period = period.max(Duration::from_millis(1));
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = None;
            loop {
                ticker.tick().await;
                let reachable = ping_hub(&config).await;
                if last != Some(reachable) {
                    debug!(reachable, "Hub availability changed");
                    last = Some(reachable);
                }
                if let Err(failure) = invoke_handler_safely(|| {
                    callback(reachable);
                    Ok(())
                }) {
                    warn!(error = %failure, "Availability callback failed");
                }
            }
        });
        Ok(AvailabilityHandle { task })
    }

    /// Registers a fresh connection and holds it.
    ///
    /// The outcome goes to the status hook, never to the caller as an error.
    pub async fn register(&self) -> bool {
        let _establishing = self.inner.establish.lock().await;
        self.establish().await.is_ok()
    }

    async fn establish(&self) -> Result<HubConnection, SampError> {
        match HubConnection::register(&self.inner.name, &self.inner.config).await {
            Ok(connection) => {
                self.set_connection(Some(connection.clone())).await;
                if connection.is_closed() {
                    self.inner.status(&format!("no ({})", SampError::Closed));
                    return Err(SampError::Closed);
                }
                self.inner.status(STATUS_REGISTERED);
                Ok(connection)
            }
            Err(err) => {
                warn!(name = %self.inner.name, error = %err, "Registration failed");
                self.inner.status(&format!("no ({err})"));
                Err(err)
            }
        }
    }

    /// Runs `f` with a live connection, registering first if needed.
    ///
    /// A held connection is checked with `getRegisteredClients`; if the hub
    /// no longer answers it is dropped and a new one registered.
    ///
    /// # Errors
    ///
    /// The registration error if no live connection could be obtained.
    pub async fn run_with_connection<F, Fut, T>(&self, f: F) -> Result<T, SampError>
    where
        F: FnOnce(HubConnection) -> Fut,
        Fut: Future<Output = T>,
    {
        let connection = self.live_connection().await?;
        Ok(f(connection).await)
    }

    async fn live_connection(&self) -> Result<HubConnection, SampError> {
        let _establishing = self.inner.establish.lock().await;

        if let Some(connection) = self.connection() {
            match connection.get_registered_clients().await {
                Ok(_) => return Ok(connection),
                Err(err) => {
                    info!(error = %err, "Held connection is stale; registering again");
                }
            }
        }

        match self.establish().await {
            Ok(connection) => Ok(connection),
            Err(err) => {
                self.set_connection(None).await;
                Err(err)
            }
        }
    }

    /// Replaces the held connection.
    ///
    /// A previous connection is closed and the unregister hook fires once.
    /// A new one gets the configured metadata, callable and subscriptions,
    /// then the register hook fires; if that setup fails it is closed.
    pub async fn set_connection(&self, connection: Option<HubConnection>) {
        let previous = std::mem::replace(&mut *self.inner.held(), connection.clone());
        if let Some(previous) = previous {
            if connection.as_ref().is_some_and(|c| c.ptr_eq(&previous)) {
                return;
            }
            previous.clear_on_close();
            previous.close();
            self.inner.unregistered();
        }

        let Some(connection) = connection else {
            return;
        };

        let owner: Weak<ConnectorInner> = Arc::downgrade(&self.inner);
        let this = connection.downgrade();
        connection.set_on_close(move || {
            let Some(inner) = owner.upgrade() else {
                return;
            };
            let cleared = {
                let mut held = inner.held();
                if held.as_ref().is_some_and(|c| this.points_to(c)) {
                    *held = None;
                    true
                } else {
                    false
                }
            };
            if cleared {
                inner.unregistered();
            }
        });

        if let Err(err) = self.prepare(&connection).await {
            warn!(error = %err, "Failed to set up new connection; closing it");
            connection.close();
            return;
        }
        self.inner.registered(&connection);
    }

    async fn prepare(&self, connection: &HubConnection) -> Result<(), SampError> {
        if let Some(metadata) = &self.inner.metadata {
            connection.declare_metadata(metadata.clone()).await?;
        }
        if let Some(callable) = &self.inner.callable {
            callable.init(connection).await?;
            connection.set_callable(Arc::clone(callable)).await?;
            if let Some(subscriptions) = &self.inner.subscriptions {
                connection.declare_subscriptions(subscriptions.clone()).await?;
            }
        }
        Ok(())
    }

    /// Unregisters and drops the held connection.
    pub async fn unregister(&self) {
        self.set_connection(None).await;
    }
}

/// Stops the periodic availability check when cancelled or dropped.
#[derive(Debug)]
pub struct AvailabilityHandle {
    task: JoinHandle<()>,
}

impl AvailabilityHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for AvailabilityHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CallableClient, ClientTracker};
    use crate::protocol::{keys, RpcValue};
    use crate::testing::{
        config_for, eventually, fault, idle_poll, ok, received, registration, short_name,
        start_hub, wait_for_calls,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::{MockServer, ResponseTemplate};

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&count), count)
    }

    async fn healthy_hub() -> MockServer {
        start_hub(|call| match short_name(call) {
            "register" => registration(),
            "pullCallbacks" => idle_poll(),
            "getRegisteredClients" => ok(RpcValue::List(vec![])),
            _ => ok(""),
        })
        .await
    }

    #[tokio::test]
    async fn test_register_declares_everything() {
        let server = healthy_hub().await;
        let (registers, register_count) = counter();
        let statuses: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&statuses);
        let metadata: RpcMap = [(keys::NAME.to_string(), RpcValue::from("Sender"))].into();
        let callable = CallableClient::new().on("test.ping", |_, _, _| Ok(None));

        let connector = Connector::builder("Sender")
            .config(config_for(&server))
            .metadata(metadata.clone())
            .callable(Arc::new(callable))
            .on_register(move |connection| {
                assert!(connection.is_registered());
                registers.fetch_add(1, Ordering::SeqCst);
            })
            .on_status(move |text| sink.lock().unwrap().push(text.to_string()))
            .build();

        assert!(connector.register().await);
        assert!(connector.is_registered());
        assert_eq!(register_count.load(Ordering::SeqCst), 1);
        assert_eq!(*statuses.lock().unwrap(), vec![STATUS_REGISTERED]);

        let declared = received(&server, "declareMetadata").await;
        assert_eq!(declared[0].params[1], RpcValue::Map(metadata));
        assert_eq!(received(&server, "allowReverseCallbacks").await.len(), 1);
        let subs = received(&server, "declareSubscriptions").await;
        assert_eq!(
            subs[0].params[1],
            RpcValue::map([("test.ping", RpcValue::Map(RpcMap::new()))])
        );
        assert!(connector.connection().unwrap().is_polling());

        connector.unregister().await;
    }

    #[tokio::test]
    async fn test_explicit_subscriptions_follow_derived_ones() {
        let server = healthy_hub().await;
        let explicit = RpcValue::map([("*", RpcValue::Map(RpcMap::new()))]);
        let connector = Connector::builder("Sender")
            .config(config_for(&server))
            .callable(Arc::new(CallableClient::new()))
            .subscriptions(explicit.as_map().unwrap().clone())
            .build();

        assert!(connector.register().await);
        let subs = received(&server, "declareSubscriptions").await;
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[1].params[1], explicit);
        connector.unregister().await;
    }

    #[tokio::test]
    async fn test_register_failure_reports_status() {
        let server = start_hub(|_| fault("1", "denied")).await;
        let statuses: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&statuses);
        let connector = Connector::builder("Sender")
            .config(config_for(&server))
            .on_status(move |text| sink.lock().unwrap().push(text.to_string()))
            .build();

        assert!(!connector.register().await);
        assert!(connector.connection().is_none());
        let statuses = statuses.lock().unwrap();
        assert!(statuses[0].starts_with("no ("), "{}", statuses[0]);
        assert!(statuses[0].contains("denied"));
    }

    #[tokio::test]
    async fn test_run_with_connection_reuses_live_connection() {
        let server = healthy_hub().await;
        let connector = Connector::builder("Sender")
            .config(config_for(&server))
            .build();

        let first = connector
            .run_with_connection(|connection| async move { connection })
            .await
            .unwrap();
        let second = connector
            .run_with_connection(|connection| async move { connection })
            .await
            .unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(received(&server, "register").await.len(), 1);
        assert_eq!(received(&server, "getRegisteredClients").await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_connection() {
        let server = healthy_hub().await;
        let connector = Connector::builder("Sender")
            .config(config_for(&server))
            .build();

        let (a, b) = tokio::join!(
            connector.run_with_connection(|connection| async move { connection }),
            connector.run_with_connection(|connection| async move { connection }),
        );
        assert!(a.unwrap().ptr_eq(&b.unwrap()));
        assert_eq!(received(&server, "register").await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_connection_is_replaced() {
        let server = start_hub(|call| match short_name(call) {
            "register" => registration(),
            "getRegisteredClients" => ResponseTemplate::new(500),
            _ => ok(""),
        })
        .await;
        let (unregs, unreg_count) = counter();
        let connector = Connector::builder("Sender")
            .config(config_for(&server))
            .on_unregister(move || {
                unregs.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        assert!(connector.register().await);
        let stale = connector.connection().unwrap();

        let fresh = connector
            .run_with_connection(|connection| async move { connection })
            .await
            .unwrap();

        assert!(!fresh.ptr_eq(&stale));
        assert!(stale.is_closed());
        assert!(!fresh.is_closed());
        assert_eq!(unreg_count.load(Ordering::SeqCst), 1);
        assert_eq!(received(&server, "register").await.len(), 2);
        assert!(wait_for_calls(&server, "unregister", 1).await);
    }

    #[tokio::test]
    async fn test_run_with_connection_reports_registration_error() {
        let connector = Connector::builder("Sender")
            .config(HubConfig::new("http://127.0.0.1:9/"))
            .build();
        let err = connector
            .run_with_connection(|_| async {})
            .await
            .unwrap_err();
        assert!(matches!(err, SampError::Registration(_)));
        assert!(connector.connection().is_none());
    }

    #[tokio::test]
    async fn test_connection_close_clears_held_reference() {
        let server = healthy_hub().await;
        let (unregs, unreg_count) = counter();
        let connector = Connector::builder("Sender")
            .config(config_for(&server))
            .on_unregister(move || {
                unregs.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        assert!(connector.register().await);
        let connection = connector.connection().unwrap();
        connection.close();
        connection.close();

        assert!(connector.connection().is_none());
        assert_eq!(unreg_count.load(Ordering::SeqCst), 1);

        connector.unregister().await;
        assert_eq!(unreg_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister_closes_and_fires_hook_once() {
        let server = healthy_hub().await;
        let (unregs, unreg_count) = counter();
        let connector = Connector::builder("Sender")
            .config(config_for(&server))
            .on_unregister(move || {
                unregs.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        assert!(connector.register().await);
        let connection = connector.connection().unwrap();
        connector.unregister().await;

        assert!(connection.is_closed());
        assert!(connector.connection().is_none());
        assert_eq!(unreg_count.load(Ordering::SeqCst), 1);
        assert!(wait_for_calls(&server, "unregister", 1).await);
    }

    #[tokio::test]
    async fn test_failed_setup_closes_new_connection() {
        let server = start_hub(|call| match short_name(call) {
            "register" => registration(),
            "getRegisteredClients" => ResponseTemplate::new(500),
            _ => ok(""),
        })
        .await;
        let (registers, register_count) = counter();
        let connector = Connector::builder("Tracker")
            .config(config_for(&server))
            .callable(Arc::new(ClientTracker::new()))
            .on_register(move |_| {
                registers.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        assert!(!connector.register().await);
        assert!(connector.connection().is_none());
        assert_eq!(register_count.load(Ordering::SeqCst), 0);
        assert!(received(&server, "allowReverseCallbacks").await.is_empty());
    }

    #[tokio::test]
    async fn test_hub_availability_pings_until_cancelled() {
        let server = healthy_hub().await;
        let connector = Connector::builder("Sender")
            .config(config_for(&server))
            .build();
        let seen: Arc<Mutex<Vec<bool>>> = Arc::default();
        let sink = Arc::clone(&seen);

        let handle = connector.on_hub_availability(
            move |reachable| sink.lock().unwrap().push(reachable),
            Duration::from_millis(50),
        )
        .unwrap();
        assert!(eventually(Duration::from_secs(5), || seen.lock().unwrap().len() >= 3).await);
        handle.cancel();
        handle.cancel();
        assert!(eventually(Duration::from_secs(1), || handle.is_cancelled()).await);

        let count = seen.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(seen.lock().unwrap().len(), count);
        assert!(seen.lock().unwrap().iter().all(|reachable| *reachable));
    }

    #[test]
    fn test_hub_availability_needs_runtime() {
        let connector = Connector::builder("Sender")
            .config(HubConfig::new("http://127.0.0.1:9/"))
            .build();
        let err = connector
            .on_hub_availability(|_| {}, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SampError::NoRuntime));
    }

    #[tokio::test]
    async fn test_hub_availability_reports_unreachable() {
        let connector = Connector::builder("Sender")
            .config(HubConfig::new("http://127.0.0.1:9/"))
            .build();
        let seen: Arc<Mutex<Vec<bool>>> = Arc::default();
        let sink = Arc::clone(&seen);

        let handle = connector.on_hub_availability(
            move |reachable| sink.lock().unwrap().push(reachable),
            Duration::from_secs(60),
        )
        .unwrap();
        assert!(eventually(Duration::from_secs(5), || !seen.lock().unwrap().is_empty()).await);
        assert_eq!(*seen.lock().unwrap(), vec![false]);
        drop(handle);
    }
}
