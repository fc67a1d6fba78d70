//! HTTP transport for XML-RPC calls.
//!
//! Every hub interaction is a single `POST` of a `<methodCall>` document to
//! the hub endpoint. Exactly one outcome is produced per call: the decoded
//! result, the hub's fault, or a [`TransportError`].

use crate::{
    config::HubConfig,
    error::{SampError, TransportError},
    protocol::{MethodCall, MethodResponse, RpcValue, XmlRpcCodec},
};
use reqwest::{header::CONTENT_TYPE, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Executes XML-RPC calls against one hub endpoint.
#[derive(Debug, Clone)]
pub struct RpcTransport {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

impl RpcTransport {
    /// # Errors
    ///
    /// Returns [`SampError::UrlParse`] if the configured endpoint is not a URL.
    pub fn new(config: &HubConfig) -> Result<Self, SampError> {
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: Url::parse(&config.endpoint)?,
            timeout: config.request_timeout(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Executes `call` with the configured request timeout.
    pub async fn execute(&self, call: &MethodCall) -> Result<RpcValue, SampError> {
        self.execute_with_timeout(call, self.timeout).await
    }

    /// Executes `call`, giving up after `timeout`.
    ///
    /// A hub fault is returned as [`SampError::Fault`]; network failures,
    /// non-200 statuses and undecodable bodies as [`SampError::Transport`].
    /// A call holding characters XML cannot carry fails with
    /// [`SampError::Protocol`] before anything is sent.
    pub async fn execute_with_timeout(
        &self,
        call: &MethodCall,
        timeout: Duration,
    ) -> Result<RpcValue, SampError> {
        call.validate()?;
        debug!(method = %call.method_name, "Sending XML-RPC call");

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "text/xml")
            .timeout(timeout)
            .body(call.to_xml())
            .send()
            .await
            .map_err(TransportError::Http)?;

        let status = response.status();
        if status != StatusCode::OK {
            debug!(method = %call.method_name, %status, "Hub rejected call");
            return Err(TransportError::Status(status).into());
        }

        let body = response.text().await.map_err(TransportError::Http)?;
        match XmlRpcCodec::decode_response(&body).map_err(TransportError::MalformedResponse)? {
            MethodResponse::Success(value) => Ok(value),
            MethodResponse::Fault(fault) => {
                debug!(method = %call.method_name, %fault, "Hub returned fault");
                Err(fault.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Fault, ProtocolError};
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn xml_response(response: &MethodResponse) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/xml")
            .set_body_string(XmlRpcCodec::encode_response(response))
    }

    fn transport_for(server: &MockServer) -> RpcTransport {
        RpcTransport::new(&HubConfig::new(server.uri())).unwrap()
    }

    #[tokio::test]
    async fn test_execute_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "text/xml"))
            .respond_with(xml_response(&MethodResponse::Success("pong".into())))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport_for(&server);
        let result = transport
            .execute(&MethodCall::new("samp.webhub.ping", vec![]))
            .await
            .unwrap();
        assert_eq!(result, RpcValue::from("pong"));
    }

    #[tokio::test]
    async fn test_execute_fault() {
        let server = MockServer::start().await;
        let fault = Fault {
            code: "1".into(),
            message: "denied".into(),
        };
        Mock::given(method("POST"))
            .respond_with(xml_response(&MethodResponse::Fault(fault.clone())))
            .mount(&server)
            .await;

        let transport = transport_for(&server);
        match transport.execute(&MethodCall::new("x", vec![])).await {
            Err(SampError::Fault(got)) => assert_eq!(got, fault),
            other => panic!("Expected Fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_bad_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let transport = transport_for(&server);
        let err = transport
            .execute(&MethodCall::new("x", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SampError::Transport(TransportError::Status(StatusCode::INTERNAL_SERVER_ERROR))
        ));
    }

    #[tokio::test]
    async fn test_execute_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not xml at all"))
            .mount(&server)
            .await;

        let transport = transport_for(&server);
        let err = transport
            .execute(&MethodCall::new("x", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SampError::Transport(TransportError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_unreachable_hub() {
        // Port 9 (discard) is not expected to run an HTTP server.
        let transport = RpcTransport::new(&HubConfig::new("http://127.0.0.1:9/")).unwrap();
        let err = transport
            .execute(&MethodCall::new("x", vec![]))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                xml_response(&MethodResponse::Success("late".into()))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let transport = transport_for(&server);
        let err = transport
            .execute_with_timeout(&MethodCall::new("x", vec![]), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_non_xml_character_is_not_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(xml_response(&MethodResponse::Success("ok".into())))
            .expect(0)
            .mount(&server)
            .await;

        let transport = transport_for(&server);
        let call = MethodCall::new("samp.webhub.notifyAll", vec!["abc".into(), "\u{1}".into()]);
        let err = transport.execute(&call).await.unwrap_err();
        assert!(matches!(err, SampError::Protocol(ProtocolError::Format(_))));
    }

    #[test]
    fn test_bad_endpoint() {
        let err = RpcTransport::new(&HubConfig::new("not a url")).unwrap_err();
        assert!(matches!(err, SampError::UrlParse(_)));
    }
}
