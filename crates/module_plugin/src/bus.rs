use std::{
    fmt,
    future::Future,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::{DataKind, Event};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no request handler registered for `{0}`")]
    HandlerNotFound(String),

    #[error("request handler `{target}` failed: {reason}")]
    HandlerFailed { target: String, reason: String },
}

/// Receives events matched by a subscription.
///
/// Errors and panics are contained by the bus and never reach the publisher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Answers point-to-point requests sent with [`MessageBus::send_request`].
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Value) -> anyhow::Result<Value>;
}

/// Narrow interface through which modules talk to each other.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver to every matching active subscription and wait for all handlers.
    async fn publish(&self, event: Event);

    fn subscribe(
        &self,
        filter: SubscriptionFilter,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle;

    /// Last registration for a target wins.
    fn register_handler(&self, target: &str, handler: Arc<dyn RequestHandler>);

    async fn send_request(&self, target: &str, request: Value) -> Result<Value, BusError>;
}

pub type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Which events a subscription receives.
///
/// A `kind` of `None` matches every kind; routing subscriptions rely on this to
/// forward whatever payload a port carries.
#[derive(Clone, Default)]
pub struct SubscriptionFilter {
    pub kind: Option<DataKind>,
    pub name: Option<String>,
    pub predicate: Option<Predicate>,
}

impl SubscriptionFilter {
    pub fn kind(kind: DataKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Any kind, exact event name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kind) = self.kind {
            if kind != event.kind {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if name != &event.name {
                return false;
            }
        }
        match &self.predicate {
            Some(p) => p(event),
            None => true,
        }
    }
}

impl fmt::Debug for SubscriptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionFilter")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Caller-side handle to a subscription. Dropping it does not unsubscribe;
/// call [`SubscriptionHandle::dispose`].
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: Uuid,
    active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn new(id: Uuid, active: Arc<AtomicBool>) -> Self {
        Self { id, active }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Idempotent.
    pub fn dispose(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F, Fut>
where
    F: Fn(Event, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: Event, cancel: CancellationToken) -> anyhow::Result<()> {
        (self.f)(event, cancel).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _fut: PhantomData,
    })
}

pub struct FnRequestHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, request: Value) -> anyhow::Result<Value> {
        (self.f)(request).await
    }
}

pub fn request_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnRequestHandler {
        f,
        _fut: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matching() {
        let event = Event::text("chat.port.userMessage", "hi");

        assert!(SubscriptionFilter::any().matches(&event));
        assert!(SubscriptionFilter::kind(DataKind::Text).matches(&event));
        assert!(!SubscriptionFilter::kind(DataKind::Number).matches(&event));
        assert!(SubscriptionFilter::named("chat.port.userMessage").matches(&event));
        assert!(!SubscriptionFilter::named("chat.port.other").matches(&event));

        let picky = SubscriptionFilter::kind(DataKind::Text)
            .with_predicate(|e| e.payload.as_text() == Some("bye"));
        assert!(!picky.matches(&event));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let handle = SubscriptionHandle::new(Uuid::new_v4(), Arc::new(AtomicBool::new(true)));
        let other = handle.clone();
        handle.dispose();
        handle.dispose();
        assert!(!other.is_active());
    }
}
