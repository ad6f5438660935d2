// # Change Events and Fan-out
//
// Every observed graph mutation becomes a `ChangeEvent`. The emitter is
// pure dispatch: it holds the subscriber list and nothing else, delivering
// each event to subscribers in registration order. Mutating the subscriber
// list from inside a delivery is not supported.

use crate::ast::TriggerType;
use crate::common::Value;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One observed property change (or lifecycle event) on an entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    /// What kind of mutation produced this event
    pub kind: TriggerType,

    /// Type label of the mutated entity
    pub entity_type: String,

    /// Identifier of the mutated entity
    pub entity_id: String,

    /// Property name, present for UPDATE events
    pub property: Option<String>,

    /// Value before the mutation
    pub old_value: Value,

    /// Value after the mutation
    pub new_value: Value,
}

impl ChangeEvent {
    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        property: impl Into<String>,
        old_value: Value,
        new_value: Value,
    ) -> Self {
        Self {
            kind: TriggerType::Update,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            property: Some(property.into()),
            old_value,
            new_value,
        }
    }

    pub fn create(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::lifecycle(TriggerType::Create, entity_type, entity_id)
    }

    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::lifecycle(TriggerType::Delete, entity_type, entity_id)
    }

    pub fn link(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::lifecycle(TriggerType::Link, entity_type, entity_id)
    }

    fn lifecycle(
        kind: TriggerType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            property: None,
            old_value: Value::Null,
            new_value: Value::Null,
        }
    }

    /// Key into the rule registry's trigger index, mirroring
    /// `Trigger::key`.
    pub fn trigger_key(&self) -> String {
        match (&self.kind, &self.property) {
            (TriggerType::Update, Some(property)) => {
                format!("UPDATE|{}|{}", self.entity_type, property)
            }
            (kind, _) => format!("{}|{}", kind, self.entity_type),
        }
    }
}

/// Single-capability subscriber contract. Bare callables are adapted at
/// subscription time via `EventEmitter::subscribe_fn`.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn deliver(&self, event: &ChangeEvent) -> Result<()>;
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct FnSubscriber<F>(F);

#[async_trait]
impl<F> EventSubscriber for FnSubscriber<F>
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    async fn deliver(&self, event: &ChangeEvent) -> Result<()> {
        (self.0)(event);
        Ok(())
    }
}

/// Fan-out record delivering events to subscribers in registration order.
pub struct EventEmitter {
    subscribers: RwLock<Vec<(SubscriberId, Arc<dyn EventSubscriber>)>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, subscriber));
        id
    }

    /// Adapt a bare callable into the subscriber contract.
    pub fn subscribe_fn<F>(&self, callable: F) -> SubscriberId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnSubscriber(callable)))
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.write().retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver to every subscriber in registration order. A failing
    /// subscriber is logged and does not block the rest.
    pub async fn emit(&self, event: &ChangeEvent) {
        let subscribers: Vec<Arc<dyn EventSubscriber>> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for subscriber in subscribers {
            if let Err(error) = subscriber.deliver(event).await {
                tracing::warn!(%error, key = %event.trigger_key(), "subscriber failed");
            }
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn sample() -> ChangeEvent {
        ChangeEvent::update(
            "Supplier",
            "BP_10001",
            "status",
            Value::String("Active".into()),
            Value::String("Suspended".into()),
        )
    }

    #[test]
    fn test_trigger_keys() {
        assert_eq!(sample().trigger_key(), "UPDATE|Supplier|status");
        assert_eq!(
            ChangeEvent::create("PurchaseOrder", "PO_1").trigger_key(),
            "CREATE|PurchaseOrder"
        );
    }

    #[tokio::test]
    async fn test_delivery_in_registration_order() {
        let emitter = EventEmitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            emitter.subscribe_fn(move |_event| seen.lock().push(tag));
        }
        emitter.emit(&sample()).await;
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let emitter = EventEmitter::new();
        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let id = emitter.subscribe_fn(move |_| *counter.lock() += 1);
        emitter.emit(&sample()).await;
        emitter.unsubscribe(id);
        emitter.emit(&sample()).await;
        assert_eq!(*seen.lock(), 1);
        assert_eq!(emitter.subscriber_count(), 0);
    }
}
