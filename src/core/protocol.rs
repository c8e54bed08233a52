// src/core/protocol.rs

//! The wire-facing vocabulary shared by the engines and the transport seam:
//! channel names, exchange kinds, and the codec tag carried alongside a
//! subscription.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Prefix of keyspace notification channels emitted by the backend.
const KEYSPACE_PREFIX: &[u8] = b"__keyspace@";
/// Prefix of keyevent notification channels emitted by the backend.
const KEYEVENT_PREFIX: &[u8] = b"__keyevent@";

/// An opaque channel identifier. Equality and hashing are by raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName(Bytes);

impl ChannelName {
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self(name.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether this channel is a backend-emitted keyspace/keyevent
    /// notification channel. Cluster deployments broadcast these on every
    /// shard, so subscriptions to them must fan out across the full shard
    /// set.
    pub fn is_notification(&self) -> bool {
        self.0.starts_with(KEYSPACE_PREFIX) || self.0.starts_with(KEYEVENT_PREFIX)
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for ChannelName {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for ChannelName {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<Bytes> for ChannelName {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

/// The four pub/sub protocol exchanges. The two subscribe kinds distinguish
/// literal-channel from pattern subscriptions; the unsubscribe kinds mirror
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

impl SubscriptionKind {
    /// Whether this exchange targets a glob-pattern subscription.
    pub fn is_pattern(self) -> bool {
        matches!(
            self,
            SubscriptionKind::PSubscribe | SubscriptionKind::PUnsubscribe
        )
    }

    /// The teardown exchange paired with this kind. Teardown kinds map to
    /// themselves, so this also normalizes caller input.
    pub fn teardown(self) -> Self {
        match self {
            SubscriptionKind::Subscribe | SubscriptionKind::Unsubscribe => {
                SubscriptionKind::Unsubscribe
            }
            SubscriptionKind::PSubscribe | SubscriptionKind::PUnsubscribe => {
                SubscriptionKind::PUnsubscribe
            }
        }
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionKind::Subscribe => "subscribe",
            SubscriptionKind::Unsubscribe => "unsubscribe",
            SubscriptionKind::PSubscribe => "psubscribe",
            SubscriptionKind::PUnsubscribe => "punsubscribe",
        };
        write!(f, "{name}")
    }
}

/// An opaque tag identifying the payload codec a subscription was created
/// with. The service never decodes payloads; it carries the tag to the wire
/// and returns it from unsubscribe so a reattach can resubscribe with the
/// same codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec(Arc<str>);

impl Codec {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new("bytes")
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
