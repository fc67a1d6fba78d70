//! Dispatch of hub callbacks to application handlers.
//!
//! A [`CallableClient`] holds two handler tables: one keyed by mtype for
//! notifications and calls, one keyed by message tag for responses to calls
//! this client made. Every handler runs inside [`invoke_handler_safely`], so
//! a failing or panicking handler never reaches the poll loop.

pub mod tracker;

use crate::{
    connection::{HubConnection, WeakHubConnection},
    error::SampError,
    protocol::{Message, Response, RpcMap},
};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

pub use tracker::{ChangeKind, ClientRecord, ClientTracker};

/// Handles a notification (`is_call == false`) or a call for one mtype.
///
/// For calls, the returned map becomes the reply's result.
pub type CallHandler =
    Arc<dyn Fn(&str, &Message, bool) -> anyhow::Result<Option<RpcMap>> + Send + Sync>;

/// Handles the response to a call made with a given message tag.
pub type ReplyHandler = Arc<dyn Fn(&str, &str, &Response) -> anyhow::Result<()> + Send + Sync>;

/// A handler returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerFailure(pub String);

/// Runs `handler`, turning both errors and panics into a [`HandlerFailure`].
pub fn invoke_handler_safely<T, F>(handler: F) -> Result<T, HandlerFailure>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(HandlerFailure(format!("{err:#}"))),
        Err(payload) => Err(HandlerFailure(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {text}")
    } else if let Some(text) = payload.downcast_ref::<String>() {
        format!("handler panicked: {text}")
    } else {
        "handler panicked".to_string()
    }
}

#[derive(Default, Clone)]
struct HandlerTable {
    calls: HashMap<String, CallHandler>,
    replies: HashMap<String, ReplyHandler>,
}

/// Shared back-reference to the connection a client is attached to.
///
/// Handlers capture a clone to reach the connection without owning it.
#[derive(Clone, Default)]
pub struct ConnectionSlot(Arc<RwLock<Option<WeakHubConnection>>>);

impl ConnectionSlot {
    pub fn set(&self, connection: &HubConnection) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(connection.downgrade());
    }

    /// The attached connection, if it is still alive.
    pub fn get(&self) -> Option<HubConnection> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(WeakHubConnection::upgrade)
    }
}

/// Routes callbacks to registered handlers and replies to calls.
#[derive(Clone, Default)]
pub struct CallableClient {
    handlers: HandlerTable,
    connection: ConnectionSlot,
}

impl fmt::Debug for CallableClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut mtypes: Vec<_> = self.handlers.calls.keys().collect();
        mtypes.sort();
        let mut tags: Vec<_> = self.handlers.replies.keys().collect();
        tags.sort();
        f.debug_struct("CallableClient")
            .field("mtypes", &mtypes)
            .field("reply_tags", &tags)
            .finish()
    }
}

impl CallableClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for notifications and calls of `mtype`.
    pub fn on<F>(mut self, mtype: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, &Message, bool) -> anyhow::Result<Option<RpcMap>> + Send + Sync + 'static,
    {
        self.handlers.calls.insert(mtype.into(), Arc::new(handler));
        self
    }

    /// Registers the handler for responses to calls tagged `msg_tag`.
    pub fn on_reply<F>(mut self, msg_tag: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, &str, &Response) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .replies
            .insert(msg_tag.into(), Arc::new(handler));
        self
    }

    pub fn attach(&self, connection: &HubConnection) {
        self.connection.set(connection);
    }

    /// The connection this client replies through, if attached and alive.
    pub fn connection(&self) -> Option<HubConnection> {
        self.connection.get()
    }

    pub fn connection_slot(&self) -> ConnectionSlot {
        self.connection.clone()
    }

    /// Returns whether a handler for the message's mtype exists.
    pub fn receive_notification(&self, sender_id: &str, message: &Message) -> bool {
        let Some(handler) = self.handlers.calls.get(&message.mtype) else {
            debug!(mtype = %message.mtype, sender_id, "No handler for notification");
            return false;
        };
        if let Err(failure) = invoke_handler_safely(|| handler(sender_id, message, false)) {
            warn!(mtype = %message.mtype, sender_id, error = %failure, "Notification handler failed");
        }
        true
    }

    /// Runs the handler for a call and sends exactly one reply for `msg_id`.
    ///
    /// Returns whether the handler existed and completed normally. A reply
    /// that cannot be delivered closes the connection.
    pub async fn receive_call(&self, sender_id: &str, msg_id: &str, message: &Message) -> bool {
        let (response, handled) = match self.handlers.calls.get(&message.mtype) {
            Some(handler) => match invoke_handler_safely(|| handler(sender_id, message, true)) {
                Ok(result) => (Response::ok(result.unwrap_or_default()), true),
                Err(failure) => {
                    warn!(mtype = %message.mtype, sender_id, error = %failure, "Call handler failed");
                    (Response::error(failure.to_string()), false)
                }
            },
            None => {
                debug!(mtype = %message.mtype, sender_id, "No handler for call");
                (Response::warning(RpcMap::new(), "no action"), false)
            }
        };

        let Some(connection) = self.connection() else {
            warn!(msg_id, "No connection to reply through");
            return handled;
        };
        if let Err(err) = connection.reply(msg_id, &response).await {
            warn!(msg_id, error = %err, "Reply failed; closing connection");
            connection.close();
        }
        handled
    }

    /// Returns whether a handler for `msg_tag` existed and completed normally.
    pub fn receive_response(&self, sender_id: &str, msg_tag: &str, response: &Response) -> bool {
        let Some(handler) = self.handlers.replies.get(msg_tag) else {
            debug!(msg_tag, sender_id, "No handler for response");
            return false;
        };
        match invoke_handler_safely(|| handler(sender_id, msg_tag, response)) {
            Ok(()) => true,
            Err(failure) => {
                warn!(msg_tag, sender_id, error = %failure, "Response handler failed");
                false
            }
        }
    }

    /// One empty-map entry per mtype with a handler.
    pub fn calculate_subscriptions(&self) -> RpcMap {
        self.handlers
            .calls
            .keys()
            .map(|mtype| (mtype.clone(), RpcMap::new().into()))
            .collect()
    }
}

/// Something that can receive hub callbacks through a [`CallableClient`].
#[async_trait]
pub trait Callable: Send + Sync {
    fn dispatcher(&self) -> &CallableClient;

    /// Runs once when a connection is about to start delivering callbacks.
    async fn init(&self, connection: &HubConnection) -> Result<(), SampError> {
        self.dispatcher().attach(connection);
        Ok(())
    }
}

#[async_trait]
impl Callable for CallableClient {
    fn dispatcher(&self) -> &CallableClient {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ResponseStatus, RpcValue};
    use crate::testing::{config_for, default_answer, received, start_hub};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn attached(client: &CallableClient) -> (wiremock::MockServer, HubConnection) {
        let server = start_hub(default_answer).await;
        let connection = HubConnection::register("Receiver", &config_for(&server))
            .await
            .unwrap();
        client.attach(&connection);
        (server, connection)
    }

    fn sent_reply(call: &crate::protocol::MethodCall) -> (String, Response) {
        let msg_id = call.params[1].as_str().unwrap().to_string();
        (msg_id, Response::from_value(call.params[2].clone()).unwrap())
    }

    #[test]
    fn test_invoke_handler_safely() {
        assert_eq!(invoke_handler_safely(|| Ok(3)), Ok(3));

        let err = invoke_handler_safely::<(), _>(|| Err(anyhow::anyhow!("boom"))).unwrap_err();
        assert_eq!(err.0, "boom");

        let err = invoke_handler_safely::<(), _>(|| panic!("kaput")).unwrap_err();
        assert!(err.0.contains("kaput"));
    }

    #[test]
    fn test_calculate_subscriptions() {
        let client = CallableClient::new()
            .on("image.load.fits", |_, _, _| Ok(None))
            .on("table.load.votable", |_, _, _| Ok(None))
            .on_reply("tag-1", |_, _, _| Ok(()));

        let subs = client.calculate_subscriptions();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs["image.load.fits"], RpcValue::Map(RpcMap::new()));
        assert!(subs.contains_key("table.load.votable"));
    }

    #[test]
    fn test_receive_notification() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let client = CallableClient::new()
            .on("test.ping", move |sender, _, is_call| {
                assert_eq!(sender, "c1");
                assert!(!is_call);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .on("test.fail", |_, _, _| anyhow::bail!("nope"));

        let ping = Message::new("test.ping", RpcMap::new());
        assert!(client.receive_notification("c1", &ping));
        assert!(client.receive_notification("c1", &Message::new("test.fail", RpcMap::new())));
        assert!(!client.receive_notification("c1", &Message::new("test.other", RpcMap::new())));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_receive_response() {
        let client = CallableClient::new()
            .on_reply("tag-ok", |_, _, response| {
                assert_eq!(response.status, ResponseStatus::Ok);
                Ok(())
            })
            .on_reply("tag-panic", |_, _, _| panic!("reply handler"));

        let response = Response::ok(RpcMap::new());
        assert!(client.receive_response("c1", "tag-ok", &response));
        assert!(!client.receive_response("c1", "tag-panic", &response));
        assert!(!client.receive_response("c1", "tag-unknown", &response));
    }

    #[tokio::test]
    async fn test_call_handler_error_becomes_error_reply() {
        let client = CallableClient::new().on("test.boom", |_, _, _| anyhow::bail!("boom"));
        let (server, _connection) = attached(&client).await;

        let handled = client
            .receive_call("c1", "msg-1", &Message::new("test.boom", RpcMap::new()))
            .await;
        assert!(!handled);

        let replies = received(&server, "reply").await;
        assert_eq!(replies.len(), 1);
        let (msg_id, response) = sent_reply(&replies[0]);
        assert_eq!(msg_id, "msg-1");
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_exactly_one_reply_per_call() {
        let client = CallableClient::new()
            .on("test.echo", |_, message, is_call| {
                assert!(is_call);
                Ok(Some(message.params.clone()))
            })
            .on("test.boom", |_, _, _| panic!("boom"));
        let (server, _connection) = attached(&client).await;

        let params: RpcMap = [("x".to_string(), RpcValue::from("1"))].into();
        assert!(
            client
                .receive_call("c1", "m1", &Message::new("test.echo", params.clone()))
                .await
        );
        assert!(
            !client
                .receive_call("c1", "m2", &Message::new("test.boom", RpcMap::new()))
                .await
        );
        assert!(
            !client
                .receive_call("c1", "m3", &Message::new("test.none", RpcMap::new()))
                .await
        );

        let replies: HashMap<_, _> = received(&server, "reply")
            .await
            .iter()
            .map(sent_reply)
            .collect();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies["m1"], Response::ok(params));
        assert_eq!(replies["m2"].status, ResponseStatus::Error);
        assert_eq!(
            replies["m3"],
            Response::warning(RpcMap::new(), "no action")
        );
        assert_eq!(received(&server, "reply").await.len(), 3);
    }

    #[tokio::test]
    async fn test_connection_slot_is_weak() {
        let client = CallableClient::new();
        let (_server, connection) = attached(&client).await;
        assert!(client.connection().unwrap().ptr_eq(&connection));

        connection.close();
        drop(connection);
        assert!(client.connection().is_none());
    }
}
