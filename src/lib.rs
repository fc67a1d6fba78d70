//! Async client for the SAMP Web Profile hub protocol.
//!
//! A web-profile client talks to a SAMP hub with XML-RPC calls POSTed to
//! `http://localhost:21012/`. After registering it holds a private key that
//! prefixes every further call, and it receives messages from other clients
//! by long-polling `pullCallbacks`.
//!
//! The crate is layered:
//! - [`protocol`]: values, the XML-RPC codec and SAMP envelopes,
//! - [`transport`]: one HTTP exchange per call,
//! - [`connection`]: a registered session, its poll loop and the [`Connector`],
//! - [`client`]: callback dispatch and the [`ClientTracker`] roster.
//!
//! # Quick start
//!
//! ```rust
//! use sampweb::protocol::{MethodCall, RpcValue, XmlRpcCodec};
//!
//! let call = MethodCall::new("samp.webhub.ping", vec![RpcValue::from("abc")]);
//! let xml = call.to_xml();
//! assert!(xml.contains("<value><string>abc</string></value>"));
//! assert_eq!(XmlRpcCodec::decode_call(&xml).unwrap(), call);
//! ```
//!
//! For registering and sending messages, see [`Connector`].

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{
    invoke_handler_safely, Callable, CallableClient, ChangeKind, ClientRecord, ClientTracker,
    HandlerFailure,
};
pub use config::{HubConfig, DEFAULT_HUB_URL};
pub use connection::{
    ping_hub, AvailabilityHandle, ConnectionState, Connector, ConnectorBuilder, HubConnection,
    HubMethod,
};
pub use error::{SampError, TransportError};
pub use protocol::{Fault, Message, Response, ResponseStatus, RpcMap, RpcValue};
