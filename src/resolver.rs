//! Message type resolution.
//!
//! A stored message type is only a string. Before it is served from the
//! in-memory view it must resolve to a [`TypeDescriptor`]; records whose type
//! does not resolve are left out of the view without failing the rebuild.

use crate::types::MessageType;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Resolved form of a message type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    /// Canonical name the view is keyed by. Aliases resolve to the same name.
    pub canonical: MessageType,
}

impl TypeDescriptor {
    pub fn new(canonical: MessageType) -> Self {
        Self { canonical }
    }
}

/// Outcome of resolving a message type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Resolved(TypeDescriptor),
    NotFound,
}

impl Resolution {
    pub fn descriptor(self) -> Option<TypeDescriptor> {
        match self {
            Resolution::Resolved(descriptor) => Some(descriptor),
            Resolution::NotFound => None,
        }
    }
}

/// Capability mapping a type identifier to a descriptor.
///
/// Must be cheap and must not perform I/O: lookups resolve on the read path.
pub trait TypeResolver: Send + Sync {
    fn resolve(&self, message_type: &MessageType) -> Resolution;
}

/// Resolves every identifier to itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl TypeResolver for AcceptAll {
    fn resolve(&self, message_type: &MessageType) -> Resolution {
        Resolution::Resolved(TypeDescriptor::new(message_type.clone()))
    }
}

/// Explicit registry of known message types.
///
/// Types can be registered at runtime (e.g. as handler modules load) and can
/// carry aliases, such as older versioned names of the same type.
#[derive(Default)]
pub struct TypeRegistry {
    /// Identifier (canonical or alias) -> canonical descriptor.
    entries: RwLock<HashMap<MessageType, TypeDescriptor>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of canonical type names.
    pub fn with_types<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<MessageType>,
    {
        let registry = Self::new();
        for t in types {
            registry.register(t.into());
        }
        registry
    }

    /// Register a canonical type.
    pub fn register(&self, message_type: MessageType) {
        let descriptor = TypeDescriptor::new(message_type.clone());
        self.entries.write().insert(message_type, descriptor);
    }

    /// Register `alias` as another name for `canonical`, registering `canonical` if needed.
    pub fn alias(&self, alias: MessageType, canonical: MessageType) {
        let mut entries = self.entries.write();
        let descriptor = entries
            .entry(canonical.clone())
            .or_insert_with(|| TypeDescriptor::new(canonical))
            .clone();
        entries.insert(alias, descriptor);
    }

    /// Forget a type or alias. Records of that type drop out of the view on the next rebuild.
    pub fn unregister(&self, message_type: &MessageType) -> bool {
        self.entries.write().remove(message_type).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl TypeResolver for TypeRegistry {
    fn resolve(&self, message_type: &MessageType) -> Resolution {
        match self.entries.read().get(message_type) {
            Some(descriptor) => Resolution::Resolved(descriptor.clone()),
            None => Resolution::NotFound,
        }
    }
}
