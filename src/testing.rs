//! Fake hub for tests: a wiremock server that decodes every incoming call
//! with [`XmlRpcCodec`] and answers through a per-test script.

use crate::{
    config::HubConfig,
    protocol::{Fault, MethodCall, MethodResponse, RpcValue, XmlRpcCodec},
};
use std::time::Duration;
use wiremock::{matchers::method, Mock, MockServer, Request, Respond, ResponseTemplate};

pub(crate) const KEY: &str = "abc";

pub(crate) fn ok(value: impl Into<RpcValue>) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/xml")
        .set_body_string(XmlRpcCodec::encode_response(&MethodResponse::Success(
            value.into(),
        )))
}

pub(crate) fn fault(code: &str, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/xml")
        .set_body_string(XmlRpcCodec::encode_response(&MethodResponse::Fault(Fault {
            code: code.into(),
            message: message.into(),
        })))
}

/// Registration answer carrying [`KEY`].
pub(crate) fn registration() -> ResponseTemplate {
    ok(RpcValue::map([
        ("samp.private-key", KEY),
        ("samp.self-id", "c0"),
        ("samp.hub-id", "hub"),
    ]))
}

/// A long-poll that never delivers anything within a test's lifetime.
pub(crate) fn idle_poll() -> ResponseTemplate {
    ok(RpcValue::List(vec![])).set_delay(Duration::from_secs(60))
}

/// Answers `register` with [`KEY`], keeps polls idle and returns `""` for
/// everything else.
pub(crate) fn default_answer(call: &MethodCall) -> ResponseTemplate {
    match short_name(call) {
        "register" => registration(),
        "pullCallbacks" => idle_poll(),
        _ => ok(""),
    }
}

pub(crate) fn short_name(call: &MethodCall) -> &str {
    call.method_name
        .strip_prefix("samp.webhub.")
        .unwrap_or(&call.method_name)
}

struct Script<F>(F);

impl<F> Respond for Script<F>
where
    F: Fn(&MethodCall) -> ResponseTemplate + Send + Sync,
{
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let decoded = std::str::from_utf8(&request.body)
            .ok()
            .and_then(|body| XmlRpcCodec::decode_call(body).ok());
        match decoded {
            Some(call) => (self.0)(&call),
            None => ResponseTemplate::new(400),
        }
    }
}

/// Starts a fake hub answering every POST through `script`.
pub(crate) async fn start_hub<F>(script: F) -> MockServer
where
    F: Fn(&MethodCall) -> ResponseTemplate + Send + Sync + 'static,
{
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(Script(script))
        .mount(&server)
        .await;
    server
}

pub(crate) fn config_for(server: &MockServer) -> HubConfig {
    HubConfig::new(server.uri())
}

/// Every call the hub has received so far whose short name is `name`.
pub(crate) async fn received(server: &MockServer, name: &str) -> Vec<MethodCall> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter_map(|request| std::str::from_utf8(&request.body).ok())
        .filter_map(|body| XmlRpcCodec::decode_call(body).ok())
        .filter(|call| short_name(call) == name)
        .collect()
}

/// Polls `condition` every 10 ms until it holds or `timeout` passes.
pub(crate) async fn eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until the hub has received at least `count` calls named `name`.
pub(crate) async fn wait_for_calls(server: &MockServer, name: &str, count: usize) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if received(server, name).await.len() >= count {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
