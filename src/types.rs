//! Core types for the subscription directory.

use crate::error::{DirectoryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Addressable endpoint that receives messages (e.g. `tcp://node1:9000`).
///
/// The canonical string form round-trips exactly: `Address::parse(&a.to_string()) == Ok(a)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse an address from its canonical string form.
    ///
    /// Rejects empty strings, surrounding whitespace and control characters,
    /// since none of those survive a round trip through the store unchanged.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() || s.trim() != s || s.chars().any(char::is_control) {
            return Err(DirectoryError::InvalidAddress(s.to_string()));
        }
        Ok(Address(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = DirectoryError;

    fn try_from(s: String) -> Result<Self> {
        Address::parse(&s)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier naming a category of message (e.g. `OrderCreated`).
///
/// May or may not be resolvable by the configured [`TypeResolver`](crate::TypeResolver).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageType(String);

impl MessageType {
    pub fn new(name: impl Into<String>) -> Self {
        MessageType(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageType {
    fn from(name: &str) -> Self {
        MessageType(name.to_string())
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        MessageType(name)
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageType({})", self.0)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque row key of a durable subscription record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// A fresh random identifier.
    pub fn new() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A durable subscription row, as stored.
///
/// Fields hold the raw string forms; parsing and type resolution happen when
/// a snapshot is built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    pub subscriber_address: String,
    pub message_type: String,
}

impl SubscriptionRecord {
    /// A new record with a fresh id.
    pub fn new(address: &Address, message_type: &MessageType) -> Self {
        Self {
            id: SubscriptionId::new(),
            subscriber_address: address.to_string(),
            message_type: message_type.to_string(),
        }
    }
}

/// Row filter for store queries. `None` fields match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub subscriber_address: Option<String>,
    pub message_type: Option<String>,
}

impl Filter {
    /// Match every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match every row of one subscriber.
    pub fn address(address: &Address) -> Self {
        Self {
            subscriber_address: Some(address.to_string()),
            message_type: None,
        }
    }

    /// Match the (address, message type) pair.
    pub fn pair(address: &Address, message_type: &MessageType) -> Self {
        Self {
            subscriber_address: Some(address.to_string()),
            message_type: Some(message_type.to_string()),
        }
    }

    pub fn matches(&self, record: &SubscriptionRecord) -> bool {
        if let Some(ref address) = self.subscriber_address {
            if *address != record.subscriber_address {
                return false;
            }
        }
        if let Some(ref message_type) = self.message_type {
            if *message_type != record.message_type {
                return false;
            }
        }
        true
    }
}
