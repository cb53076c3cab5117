use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use module_plugin::{
    BusError, DataKind, Event, EventHandler, MessageBus, RequestHandler, SubscriptionFilter,
    SubscriptionHandle,
};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};
use uuid::Uuid;

pub const DEFAULT_COMPACTION_INTERVAL: u64 = 100;

struct Subscription {
    id: Uuid,
    filter: SubscriptionFilter,
    handler: Arc<dyn EventHandler>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub subscription: Uuid,
    pub error: String,
}

/// What happened to one published event.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// All failure messages joined, for error reporting.
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| f.error.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

enum Delivery {
    Delivered,
    Inactive,
    Failed(String),
}

/// In-process publish/subscribe bus.
///
/// Subscriptions are bucketed by data kind; the `None` bucket holds wildcard
/// subscriptions that see every kind. Disposed subscriptions stay in their bucket
/// until the next compaction, which runs on every `compaction_interval`-th publish.
pub struct EventBus {
    subscriptions: DashMap<Option<DataKind>, Vec<Arc<Subscription>>>,
    request_handlers: DashMap<String, Arc<dyn RequestHandler>>,
    publish_count: AtomicU64,
    compaction_interval: u64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_compaction_interval(DEFAULT_COMPACTION_INTERVAL)
    }

    /// An interval of 0 disables automatic compaction.
    pub fn with_compaction_interval(compaction_interval: u64) -> Self {
        Self {
            subscriptions: DashMap::new(),
            request_handlers: DashMap::new(),
            publish_count: AtomicU64::new(0),
            compaction_interval,
        }
    }

    pub async fn publish_with(&self, event: Event, cancel: CancellationToken) {
        // failures were already logged per handler
        let _ = self.dispatch(event, cancel).await;
    }

    /// Deliver `event` to every matching active subscription, wait for all
    /// handlers and report how many ran and which failed.
    pub async fn dispatch(&self, event: Event, cancel: CancellationToken) -> DispatchReport {
        let count = self.publish_count.fetch_add(1, Ordering::AcqRel) + 1;
        if self.compaction_interval > 0 && count % self.compaction_interval == 0 {
            self.compact();
        }

        // Snapshot the candidates so no map lock is held while predicates or handlers run.
        let candidates = self.candidates(event.kind);
        let matched: Vec<Arc<Subscription>> = candidates
            .into_iter()
            .filter(|s| s.is_active() && s.filter.matches(&event))
            .collect();

        let mut report = DispatchReport::default();
        if matched.is_empty() {
            trace!(event = %event.name, "no subscribers");
            return report;
        }

        let mut tasks = JoinSet::new();
        for sub in matched {
            let event = event.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                // disposed between matching and running
                if !sub.is_active() {
                    return (sub.id, Delivery::Inactive);
                }
                let outcome = AssertUnwindSafe(sub.handler.handle(event, cancel))
                    .catch_unwind()
                    .await;
                let delivery = match outcome {
                    Ok(Ok(())) => Delivery::Delivered,
                    Ok(Err(e)) => Delivery::Failed(format!("{:#}", e)),
                    Err(panic) => Delivery::Failed(panic_message(panic)),
                };
                (sub.id, delivery)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Delivery::Delivered)) => report.delivered += 1,
                Ok((_, Delivery::Inactive)) => {}
                Ok((id, Delivery::Failed(reason))) => {
                    error!(subscription = %id, event = %event.name, "handler failed: {}", reason);
                    report.delivered += 1;
                    report.failures.push(HandlerFailure {
                        subscription: id,
                        error: reason,
                    });
                }
                Err(join_err) => {
                    error!(event = %event.name, "handler task aborted: {}", join_err);
                    report.failures.push(HandlerFailure {
                        subscription: Uuid::nil(),
                        error: join_err.to_string(),
                    });
                }
            }
        }
        report
    }

    fn candidates(&self, kind: DataKind) -> Vec<Arc<Subscription>> {
        let mut out = Vec::new();
        if let Some(bucket) = self.subscriptions.get(&Some(kind)) {
            out.extend(bucket.iter().cloned());
        }
        if let Some(bucket) = self.subscriptions.get(&None) {
            out.extend(bucket.iter().cloned());
        }
        out
    }

    /// Drop disposed subscriptions from every bucket.
    pub fn compact(&self) {
        let mut removed = 0usize;
        for mut bucket in self.subscriptions.iter_mut() {
            let before = bucket.len();
            bucket.retain(|s| s.is_active());
            removed += before - bucket.len();
        }
        if removed > 0 {
            trace!(removed, "compacted subscriptions");
        }
    }

    /// Active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .iter()
            .map(|b| b.iter().filter(|s| s.is_active()).count())
            .sum()
    }

    /// Stored subscriptions, including disposed ones awaiting compaction.
    pub fn stored_subscriptions(&self) -> usize {
        self.subscriptions.iter().map(|b| b.len()).sum()
    }

    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MessageBus for EventBus {
    async fn publish(&self, event: Event) {
        self.publish_with(event, CancellationToken::new()).await;
    }

    fn subscribe(
        &self,
        filter: SubscriptionFilter,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let id = Uuid::new_v4();
        let active = Arc::new(AtomicBool::new(true));
        let kind = filter.kind;
        let sub = Arc::new(Subscription {
            id,
            filter,
            handler,
            active: Arc::clone(&active),
        });
        self.subscriptions.entry(kind).or_default().push(sub);
        SubscriptionHandle::new(id, active)
    }

    fn register_handler(&self, target: &str, handler: Arc<dyn RequestHandler>) {
        self.request_handlers.insert(target.to_string(), handler);
    }

    async fn send_request(&self, target: &str, request: Value) -> Result<Value, BusError> {
        let handler = self
            .request_handlers
            .get(target)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| BusError::HandlerNotFound(target.to_string()))?;
        handler
            .handle(request)
            .await
            .map_err(|e| BusError::HandlerFailed {
                target: target.to_string(),
                reason: format!("{:#}", e),
            })
    }
}

pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
