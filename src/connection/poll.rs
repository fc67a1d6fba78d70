//! Reverse-callback long-poll loop.
//!
//! The hub queues callbacks for a registered client and hands them out via
//! `pullCallbacks`, holding each request open for up to
//! [`PULL_CALLBACKS_TIMEOUT_SECS`]. At most one poll is in flight per
//! connection; the next one is issued only after the previous completes.

use crate::{
    client::Callable,
    connection::{methods, HubConnection},
    error::SampError,
    protocol::{CallbackEvent, RpcValue},
};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long the hub may hold a `pullCallbacks` request.
pub const PULL_CALLBACKS_TIMEOUT_SECS: u64 = 600;

/// A poll failing sooner than this after it was issued means the hub is
/// gone rather than merely slow, and the connection is closed.
pub const FAST_FAILURE_THRESHOLD: Duration = Duration::from_millis(1000);

const POLL_GRACE: Duration = Duration::from_secs(30);

impl HubConnection {
    pub(super) fn start_polling(&self, callable: Arc<dyn Callable>) {
        let mut session = self.session();
        if session.closed || session.registration.is_none() {
            return;
        }
        if let Some(previous) = session.poll_task.take() {
            previous.abort();
        }
        let connection = self.clone();
        session.poll_task = Some(tokio::spawn(connection.poll_loop(callable)));
    }

    pub(super) fn stop_polling(&self) {
        let task = self.session().poll_task.take();
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn poll_loop(self, callable: Arc<dyn Callable>) {
        debug!("Callback poll loop started");
        let timeout = Duration::from_secs(PULL_CALLBACKS_TIMEOUT_SECS) + POLL_GRACE;

        loop {
            let Ok(call) = self.keyed_call(
                methods::PULL_CALLBACKS,
                vec![PULL_CALLBACKS_TIMEOUT_SECS.to_string().into()],
            ) else {
                break;
            };

            let started = Instant::now();
            let outcome = self
                .inner
                .transport
                .execute_with_timeout(&call, timeout)
                .await
                .and_then(|value| {
                    value
                        .into_list("pullCallbacks result")
                        .map_err(SampError::from)
                });

            match outcome {
                Ok(events) => {
                    if !events.is_empty() {
                        debug!(count = events.len(), "Received callbacks");
                    }
                    for event in events {
                        self.deliver(callable.as_ref(), event).await;
                    }
                }
                Err(err) => {
                    let elapsed = started.elapsed();
                    if is_fast_failure(elapsed) {
                        warn!(error = %err, ?elapsed, "pullCallbacks failed fast; closing connection");
                        self.close();
                        break;
                    }
                    debug!(error = %err, ?elapsed, "pullCallbacks failed after waiting; polling again");
                }
            }

            if self.is_closed() {
                break;
            }
        }
        debug!("Callback poll loop stopped");
    }

    /// Routes one callback; failures stay inside this call.
    async fn deliver(&self, callable: &dyn Callable, value: RpcValue) {
        let event = match CallbackEvent::from_value(value) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "Dropping malformed callback");
                return;
            }
        };

        let client = callable.dispatcher();
        match event {
            CallbackEvent::Notification { sender_id, message } => {
                client.receive_notification(&sender_id, &message);
            }
            CallbackEvent::Call {
                sender_id,
                msg_id,
                message,
            } => {
                client.receive_call(&sender_id, &msg_id, &message).await;
            }
            CallbackEvent::Response {
                sender_id,
                msg_tag,
                response,
            } => {
                client.receive_response(&sender_id, &msg_tag, &response);
            }
        }
    }
}

fn is_fast_failure(elapsed: Duration) -> bool {
    elapsed < FAST_FAILURE_THRESHOLD
}
