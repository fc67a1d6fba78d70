//! The hub's Web Profile method table.

use crate::protocol::{
    ValueKind,
    ValueKind::{Map as M, String as S},
};

pub const WEBHUB_PREFIX: &str = "samp.webhub.";

pub(crate) const REGISTER: &str = "samp.webhub.register";
pub(crate) const UNREGISTER: &str = "samp.webhub.unregister";
pub(crate) const PING: &str = "samp.webhub.ping";
pub(crate) const PULL_CALLBACKS: &str = "samp.webhub.pullCallbacks";
pub(crate) const ALLOW_REVERSE_CALLBACKS: &str = "samp.webhub.allowReverseCallbacks";

/// Keyed hub methods callable through a registered connection.
///
/// Signatures exclude the private key, which is always prepended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubMethod {
    Call,
    CallAll,
    CallAndWait,
    DeclareMetadata,
    DeclareSubscriptions,
    GetMetadata,
    GetRegisteredClients,
    GetSubscribedClients,
    GetSubscriptions,
    Notify,
    NotifyAll,
    Ping,
    Reply,
}

// Indexed by discriminant.
const TABLE: &[(HubMethod, &str, &[ValueKind])] = &[
    (HubMethod::Call, "call", &[S, S, M]),
    (HubMethod::CallAll, "callAll", &[S, M]),
    (HubMethod::CallAndWait, "callAndWait", &[S, M, S]),
    (HubMethod::DeclareMetadata, "declareMetadata", &[M]),
    (HubMethod::DeclareSubscriptions, "declareSubscriptions", &[M]),
    (HubMethod::GetMetadata, "getMetadata", &[S]),
    (HubMethod::GetRegisteredClients, "getRegisteredClients", &[]),
    (HubMethod::GetSubscribedClients, "getSubscribedClients", &[S]),
    (HubMethod::GetSubscriptions, "getSubscriptions", &[S]),
    (HubMethod::Notify, "notify", &[S, M]),
    (HubMethod::NotifyAll, "notifyAll", &[M]),
    (HubMethod::Ping, "ping", &[]),
    (HubMethod::Reply, "reply", &[S, M]),
];

impl HubMethod {
    pub const ALL: [HubMethod; 13] = [
        HubMethod::Call,
        HubMethod::CallAll,
        HubMethod::CallAndWait,
        HubMethod::DeclareMetadata,
        HubMethod::DeclareSubscriptions,
        HubMethod::GetMetadata,
        HubMethod::GetRegisteredClients,
        HubMethod::GetSubscribedClients,
        HubMethod::GetSubscriptions,
        HubMethod::Notify,
        HubMethod::NotifyAll,
        HubMethod::Ping,
        HubMethod::Reply,
    ];

    /// Unprefixed name, e.g. `notifyAll`.
    pub fn name(self) -> &'static str {
        TABLE[self as usize].1
    }

    pub fn signature(self) -> &'static [ValueKind] {
        TABLE[self as usize].2
    }

    /// Full XML-RPC method name, e.g. `samp.webhub.notifyAll`.
    pub fn method_name(self) -> String {
        format!("{WEBHUB_PREFIX}{}", self.name())
    }
}
