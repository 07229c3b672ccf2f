//! In-process typed pub/sub with a single dispatcher.
//!
//! Events are enqueued on an unbounded FIFO; one dispatcher task dequeues
//! them in order, fans each event out to the handlers registered for its
//! kind, and awaits all handlers before touching the next event. That gives
//! every subscriber publish-order delivery per event kind. Handler failures
//! and panics are logged and never reach other handlers or the dispatcher.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A listing's image set changed (or the listing was just created).
#[derive(Debug, Clone, Serialize)]
pub struct ListingImagesUpdated {
    pub listing_id: i64,
    pub external_id: String,
    pub image_urls: Vec<String>,
    pub triggered_at: DateTime<Utc>,
}

/// Result of one analyzer pass over a listing.
#[derive(Debug, Clone, Serialize)]
pub struct ListingAnalysisCompleted {
    pub listing_id: i64,
    pub external_id: String,
    pub is_suspicious: bool,
    pub reason: Option<String>,
    pub confidence: Option<f64>,
    pub meta: Option<serde_json::Value>,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ListingEvent {
    ImagesUpdated(ListingImagesUpdated),
    AnalysisCompleted(ListingAnalysisCompleted),
}

/// Runtime discriminant used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ImagesUpdated,
    AnalysisCompleted,
}

impl ListingEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ImagesUpdated(_) => EventKind::ImagesUpdated,
            Self::AnalysisCompleted(_) => EventKind::AnalysisCompleted,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(ListingEvent) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct EventBus {
    sender: mpsc::UnboundedSender<Option<ListingEvent>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Option<ListingEvent>>>>,
    subscribers: Arc<RwLock<HashMap<EventKind, Vec<EventHandler>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            dispatcher: Mutex::new(None),
        })
    }

    /// Register a handler for one event kind.
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.entry(kind).or_default().push(handler);
        }
    }

    /// Convenience wrapper turning an async closure into a handler.
    pub fn subscribe_fn<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(ListingEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(kind, Arc::new(move |event| Box::pin(handler(event))));
    }

    /// Enqueue an event; returns as soon as it is on the queue.
    pub fn publish(&self, event: ListingEvent) -> anyhow::Result<()> {
        self.sender
            .send(Some(event))
            .map_err(|_| anyhow::anyhow!("Event bus queue is closed"))
    }

    /// Start the dispatcher task if not already running.
    pub async fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Some(mut receiver) = self.receiver.lock().await.take() else {
            warn!("Event bus dispatcher already consumed its receiver");
            return;
        };
        let subscribers = Arc::clone(&self.subscribers);

        *dispatcher = Some(tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                let Some(event) = message else {
                    // Sentinel: graceful stop.
                    break;
                };
                let kind = event.kind();
                let handlers: Vec<EventHandler> = subscribers
                    .read()
                    .map(|map| map.get(&kind).cloned().unwrap_or_default())
                    .unwrap_or_default();
                if handlers.is_empty() {
                    debug!(?kind, "No subscribers for event");
                    continue;
                }

                // Fan out concurrently, but finish every handler before the
                // next dequeue so per-kind ordering holds for subscribers.
                let tasks: Vec<JoinHandle<()>> = handlers
                    .into_iter()
                    .map(|handler| {
                        let event = event.clone();
                        tokio::spawn(async move { handler(event).await })
                    })
                    .collect();
                for task in tasks {
                    if let Err(e) = task.await {
                        error!(?kind, "Event handler panicked: {e}");
                    }
                }
            }
            debug!("Event bus dispatcher exited");
        }));
        info!("Event bus started");
    }

    /// Stop the dispatcher, draining already-enqueued events first.
    pub async fn stop(&self) {
        let task = self.dispatcher.lock().await.take();
        if let Some(task) = task {
            if self.sender.send(None).is_err() {
                task.abort();
            }
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                error!("Event bus dispatcher failed during shutdown: {e}");
            }
            info!("Event bus stopped");
        }
    }
}
