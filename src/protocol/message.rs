//! SAMP application-level envelopes.
//!
//! These are the maps carried inside hub calls: messages, response
//! envelopes, registration info and the callback events delivered by
//! `pullCallbacks`.

use crate::protocol::{
    value::{RpcMap, RpcValue},
    ProtocolError,
};

/// Wire keys and well-known names.
pub mod keys {
    pub const MTYPE: &str = "samp.mtype";
    pub const PARAMS: &str = "samp.params";
    pub const STATUS: &str = "samp.status";
    pub const RESULT: &str = "samp.result";
    pub const ERROR: &str = "samp.error";
    pub const ERRORTXT: &str = "samp.errortxt";
    pub const STATUS_OK: &str = "samp.ok";
    pub const STATUS_WARNING: &str = "samp.warning";
    pub const STATUS_ERROR: &str = "samp.error";
    pub const NAME: &str = "samp.name";
    pub const PRIVATE_KEY: &str = "samp.private-key";
    pub const URL_TRANSLATOR: &str = "samp.url-translator";
    pub const SELF_ID: &str = "samp.self-id";
    pub const HUB_ID: &str = "samp.hub-id";
    pub const METHOD_NAME: &str = "samp.methodName";

    /// Parameter keys of the hub roster events.
    pub const PARAM_ID: &str = "id";
    pub const PARAM_METADATA: &str = "metadata";
    pub const PARAM_SUBSCRIPTIONS: &str = "subscriptions";

    pub const EVENT_REGISTER: &str = "samp.hub.event.register";
    pub const EVENT_UNREGISTER: &str = "samp.hub.event.unregister";
    pub const EVENT_METADATA: &str = "samp.hub.event.metadata";
    pub const EVENT_SUBSCRIPTIONS: &str = "samp.hub.event.subscriptions";
    pub const EVENT_SHUTDOWN: &str = "samp.hub.event.shutdown";
    pub const HUB_DISCONNECT: &str = "samp.hub.disconnect";
}

/// A SAMP message: an mtype plus its parameter map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: String,
    pub params: RpcMap,
}

impl Message {
    pub fn new(mtype: impl Into<String>, params: RpcMap) -> Self {
        Self {
            mtype: mtype.into(),
            params,
        }
    }

    pub fn to_value(&self) -> RpcValue {
        RpcValue::map([
            (keys::MTYPE, RpcValue::from(self.mtype.as_str())),
            (keys::PARAMS, RpcValue::Map(self.params.clone())),
        ])
    }

    pub fn from_value(value: RpcValue) -> Result<Self, ProtocolError> {
        let mut map = value.into_map("message")?;
        let mtype = map
            .remove(keys::MTYPE)
            .ok_or_else(|| ProtocolError::Format(format!("message without {}", keys::MTYPE)))?
            .into_string(keys::MTYPE)?;
        let params = match map.remove(keys::PARAMS) {
            Some(params) => params.into_map(keys::PARAMS)?,
            None => RpcMap::new(),
        };
        Ok(Self { mtype, params })
    }

    /// Looks up a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(RpcValue::as_str)
    }
}

/// Status of a [`Response`] envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Warning,
    Error,
}

impl ResponseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseStatus::Ok => keys::STATUS_OK,
            ResponseStatus::Warning => keys::STATUS_WARNING,
            ResponseStatus::Error => keys::STATUS_ERROR,
        }
    }

    fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            keys::STATUS_OK => Ok(ResponseStatus::Ok),
            keys::STATUS_WARNING => Ok(ResponseStatus::Warning),
            keys::STATUS_ERROR => Ok(ResponseStatus::Error),
            other => Err(ProtocolError::Format(format!("unknown status {other}"))),
        }
    }
}

/// The envelope sent back to the hub in reply to a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: ResponseStatus,
    pub result: RpcMap,
    pub error: Option<String>,
}

impl Response {
    pub fn ok(result: RpcMap) -> Self {
        Self {
            status: ResponseStatus::Ok,
            result,
            error: None,
        }
    }

    pub fn warning(result: RpcMap, text: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Warning,
            result,
            error: Some(text.into()),
        }
    }

    /// An error envelope; it carries no result.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            result: RpcMap::new(),
            error: Some(text.into()),
        }
    }

    pub fn to_value(&self) -> RpcValue {
        let mut map = RpcMap::new();
        map.insert(keys::STATUS.to_string(), self.status.as_str().into());
        if self.status != ResponseStatus::Error {
            map.insert(keys::RESULT.to_string(), RpcValue::Map(self.result.clone()));
        }
        if let Some(text) = &self.error {
            map.insert(
                keys::ERROR.to_string(),
                RpcValue::map([(keys::ERRORTXT, text.as_str())]),
            );
        }
        RpcValue::Map(map)
    }

    pub fn from_value(value: RpcValue) -> Result<Self, ProtocolError> {
        let mut map = value.into_map("response")?;
        let status = map
            .remove(keys::STATUS)
            .ok_or_else(|| ProtocolError::Format(format!("response without {}", keys::STATUS)))?
            .into_string(keys::STATUS)?;
        let result = match map.remove(keys::RESULT) {
            Some(result) => result.into_map(keys::RESULT)?,
            None => RpcMap::new(),
        };
        let error = match map.remove(keys::ERROR) {
            Some(error) => error
                .into_map(keys::ERROR)?
                .remove(keys::ERRORTXT)
                .and_then(|text| text.as_str().map(str::to_string)),
            None => None,
        };
        Ok(Self {
            status: ResponseStatus::parse(&status)?,
            result,
            error,
        })
    }
}

/// The map a hub returns from `register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    private_key: String,
    raw: RpcMap,
}

impl RegistrationInfo {
    /// # Errors
    ///
    /// Fails unless the value is a map carrying a string private key.
    pub fn from_value(value: RpcValue) -> Result<Self, ProtocolError> {
        let raw = value.into_map("registration info")?;
        let private_key = raw
            .get(keys::PRIVATE_KEY)
            .and_then(RpcValue::as_str)
            .ok_or_else(|| ProtocolError::Format("Bad registration object".to_string()))?
            .to_string();
        Ok(Self { private_key, raw })
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// Any entry of the registration map, including hub-specific ones.
    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        self.raw.get(key)
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(RpcValue::as_str)
    }

    pub fn url_translator(&self) -> Option<&str> {
        self.get_str(keys::URL_TRANSLATOR)
    }

    pub fn self_id(&self) -> Option<&str> {
        self.get_str(keys::SELF_ID)
    }

    pub fn hub_id(&self) -> Option<&str> {
        self.get_str(keys::HUB_ID)
    }
}

/// One event delivered by `pullCallbacks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    Notification {
        sender_id: String,
        message: Message,
    },
    Call {
        sender_id: String,
        msg_id: String,
        message: Message,
    },
    Response {
        sender_id: String,
        msg_tag: String,
        response: Response,
    },
}

impl CallbackEvent {
    pub fn from_value(value: RpcValue) -> Result<Self, ProtocolError> {
        let mut map = value.into_map("callback")?;
        let method = map
            .remove(keys::METHOD_NAME)
            .ok_or_else(|| ProtocolError::Format("callback without method name".to_string()))?
            .into_string(keys::METHOD_NAME)?;
        let params = map
            .remove(keys::PARAMS)
            .ok_or_else(|| ProtocolError::Format("callback without params".to_string()))?
            .into_list(keys::PARAMS)?;

        let arity = match method.as_str() {
            "receiveNotification" => 2,
            "receiveCall" | "receiveResponse" => 3,
            other => {
                return Err(ProtocolError::Format(format!(
                    "unexpected callback method {other}"
                )))
            }
        };
        if params.len() != arity {
            return Err(ProtocolError::Format(format!(
                "{method} expects {arity} params, got {}",
                params.len()
            )));
        }

        let mut params = params.into_iter();
        let mut take = || {
            params
                .next()
                .ok_or_else(|| ProtocolError::Format("missing callback param".to_string()))
        };
        let sender_id = take()?.into_string("sender id")?;
        match method.as_str() {
            "receiveNotification" => Ok(CallbackEvent::Notification {
                sender_id,
                message: Message::from_value(take()?)?,
            }),
            "receiveCall" => Ok(CallbackEvent::Call {
                sender_id,
                msg_id: take()?.into_string("message id")?,
                message: Message::from_value(take()?)?,
            }),
            _ => Ok(CallbackEvent::Response {
                sender_id,
                msg_tag: take()?.into_string("message tag")?,
                response: Response::from_value(take()?)?,
            }),
        }
    }
}

/// Whether `subscriptions` (keys are mtype patterns) covers `mtype`.
///
/// A pattern matches exactly, or is `*`, or is `prefix.*` matching any
/// mtype that starts with `prefix`.
pub fn is_subscribed(subscriptions: &RpcMap, mtype: &str) -> bool {
    subscriptions.keys().any(|pattern| {
        pattern == mtype
            || pattern == "*"
            || pattern
                .strip_suffix(".*")
                .is_some_and(|prefix| mtype.starts_with(prefix))
    })
}
