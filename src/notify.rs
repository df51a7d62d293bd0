//! Notification bus for registry change events
//!
//! A single publisher (the registry) fanned out to the subsystems that
//! cache or materialize per-stream state. Fan-out is synchronous: every
//! handler must return before the mutation is considered complete, and any
//! handler error vetoes the mutation (the registry rolls back). The bus
//! does no retry; handlers must be idempotent with respect to redelivery.
//!
//! Subscribers register at process startup; the bus is passed explicitly
//! into component constructors rather than living in a global.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::Stream;

/// Capability set of a registry-change subscriber
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Subscriber name, used to attribute veto failures
    fn name(&self) -> &'static str;

    /// A stream was created and persisted
    async fn on_create(&self, stream: &Stream) -> Result<()>;

    /// A stream was updated; both snapshots are provided so subscribers
    /// can diff
    async fn on_update(&self, old: &Stream, new: &Stream) -> Result<()>;

    /// A stream is about to be deleted; fired before the registry commits
    /// the removal so subscribers can reclaim resources
    async fn on_delete(&self, stream: &Stream) -> Result<()>;
}

/// Synchronous fan-out of registry events to all registered listeners
///
/// Listener registration happens after the registry is constructed (the
/// connector needs the registry, which already holds the bus), so the
/// listener list sits behind its own lock.
#[derive(Default)]
pub struct Notifier {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl Notifier {
    /// Create an empty notifier
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners are invoked in registration order;
    /// deregistration is process teardown only.
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// True when no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventListener>> {
        self.listeners.read().clone()
    }

    /// Fan out a created event; fails with the first vetoing listener
    pub async fn created(&self, stream: &Stream) -> Result<()> {
        for l in self.snapshot() {
            debug!(listener = l.name(), stream = %stream.id, "notifying created");
            l.on_create(stream).await.map_err(|e| {
                Error::Internal(format!("subscriber {} rejected stream creation: {e}", l.name()))
            })?;
        }
        Ok(())
    }

    /// Fan out an updated event; fails with the first vetoing listener
    pub async fn updated(&self, old: &Stream, new: &Stream) -> Result<()> {
        for l in self.snapshot() {
            debug!(listener = l.name(), stream = %new.id, "notifying updated");
            l.on_update(old, new).await.map_err(|e| {
                Error::Internal(format!("subscriber {} rejected stream update: {e}", l.name()))
            })?;
        }
        Ok(())
    }

    /// Fan out a deleted event; fails with the first vetoing listener
    pub async fn deleted(&self, stream: &Stream) -> Result<()> {
        for l in self.snapshot() {
            debug!(listener = l.name(), stream = %stream.id, "notifying deleted");
            l.on_delete(stream).await.map_err(|e| {
                Error::Internal(format!("subscriber {} rejected stream deletion: {e}", l.name()))
            })?;
        }
        Ok(())
    }
}
