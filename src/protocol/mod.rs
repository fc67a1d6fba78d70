//! SAMP Web Profile wire protocol.
//!
//! This module provides the value model, the XML-RPC codec and the
//! application-level envelopes exchanged with a SAMP hub.

mod codec;
mod message;
mod value;

pub use codec::{Fault, MethodCall, MethodResponse, ProtocolError, XmlRpcCodec};
pub use message::{
    is_subscribed, keys, CallbackEvent, Message, RegistrationInfo, Response, ResponseStatus,
};
pub use value::{check_params, RpcMap, RpcValue, ValueKind};
