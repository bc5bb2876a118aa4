//! Process-wide publish/subscribe channel.
//!
//! In asynchronous mode a single dispatch thread drains a bounded queue in
//! publish order and runs the handlers of each event one after another, in
//! subscription order. In synchronous mode `publish` delivers on the calling
//! thread before returning. A handler that fails or panics is logged and
//! skipped; it never affects other handlers, later events or the publisher.

use crate::config::{EventBusConfig, OverflowPolicy};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Event names published by the assistant core.
pub mod event_types {
    pub const AI_RESPONSE_RECEIVED: &str = "ai_response_received";
    pub const FUNCTIONS_CALLED: &str = "functions_called";
    pub const TOOL_EXECUTED: &str = "tool_executed";
    pub const ERROR: &str = "error";
    pub const REMINDER_DUE: &str = "reminder_due";
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Shorthand for reading a top-level payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

pub type HandlerResult = Result<(), String>;
pub type EventHandler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SubscriberMap = HashMap<String, Vec<(SubscriptionId, EventHandler)>>;

pub struct EventBus {
    subscribers: Arc<RwLock<SubscriberMap>>,
    next_id: AtomicU64,
    dispatcher: Option<Dispatcher>,
}

struct Dispatcher {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    overflow: OverflowPolicy,
    running: Arc<AtomicBool>,
    accepting: AtomicBool,
    shutdown_timeout: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: Option<ThreadId>,
    exited: Receiver<()>,
}

impl EventBus {
    pub fn new(config: &EventBusConfig) -> Self {
        let subscribers: Arc<RwLock<SubscriberMap>> = Arc::new(RwLock::new(HashMap::new()));

        let dispatcher = if config.async_dispatch {
            Some(Dispatcher::start(
                Arc::clone(&subscribers),
                config.queue_capacity.max(1),
                config.overflow,
                Duration::from_millis(config.shutdown_timeout_ms),
            ))
        } else {
            None
        };

        Self {
            subscribers,
            next_id: AtomicU64::new(1),
            dispatcher,
        }
    }

    /// A bus that delivers on the publishing thread.
    pub fn synchronous() -> Self {
        Self::new(&EventBusConfig {
            async_dispatch: false,
            ..EventBusConfig::default()
        })
    }

    pub fn is_async(&self) -> bool {
        self.dispatcher.is_some()
    }

    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(event_type, subscription = id.0, "Subscriber registered");
        id
    }

    /// Removes a subscription. Returns `false` when it was not registered.
    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(handlers) = subscribers.get_mut(event_type) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            subscribers.remove(event_type);
        }
        if removed {
            debug!(event_type, subscription = id.0, "Subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers
            .read()
            .get(event_type)
            .map(|handlers| handlers.len())
            .unwrap_or(0)
    }

    pub fn publish(&self, event_type: &str, payload: Value) {
        let event = Event::new(event_type, payload);
        debug!(event_type, id = %event.id, "Event published");

        match &self.dispatcher {
            Some(dispatcher) => dispatcher.enqueue(event),
            None => dispatch(&self.subscribers, &event),
        }
    }

    /// Events waiting for the dispatch thread. Always zero in synchronous mode.
    pub fn pending(&self) -> usize {
        self.dispatcher.as_ref().map(|d| d.rx.len()).unwrap_or(0)
    }

    /// Stops the dispatch thread. Events already queued are delivered if the
    /// worker finishes them within the shutdown timeout; the rest are dropped.
    pub fn shutdown(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.shutdown();
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Dispatcher {
    fn start(
        subscribers: Arc<RwLock<SubscriberMap>>,
        capacity: usize,
        overflow: OverflowPolicy,
        shutdown_timeout: Duration,
    ) -> Self {
        let (tx, rx) = bounded::<Event>(capacity);
        let (exit_tx, exited) = bounded::<()>(1);
        let running = Arc::new(AtomicBool::new(true));

        let worker_rx = rx.clone();
        let worker_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("event-dispatcher".to_string())
            .spawn(move || {
                dispatch_loop(&subscribers, &worker_rx, &worker_running);
                let _ = exit_tx.send(());
            });

        let worker = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "Failed to spawn event dispatcher thread");
                None
            }
        };

        debug!(capacity, ?overflow, "Event dispatcher started");

        Self {
            tx,
            rx,
            overflow,
            running,
            accepting: AtomicBool::new(worker.is_some()),
            shutdown_timeout,
            worker_thread: worker.as_ref().map(|handle| handle.thread().id()),
            worker: Mutex::new(worker),
            exited,
        }
    }

    fn enqueue(&self, event: Event) {
        if !self.accepting.load(Ordering::Acquire) {
            debug!(event_type = %event.event_type, "Event bus stopped, event discarded");
            return;
        }

        match self.overflow {
            // The worker is the queue's only consumer; blocking it on its own
            // queue would never return.
            OverflowPolicy::Block if !self.on_worker_thread() => {
                if self.tx.send(event).is_err() {
                    warn!("Event queue disconnected");
                }
            }
            _ => self.push_dropping_oldest(event),
        }
    }

    fn on_worker_thread(&self) -> bool {
        self.worker_thread == Some(thread::current().id())
    }

    fn push_dropping_oldest(&self, mut event: Event) {
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if let Ok(dropped) = self.rx.try_recv() {
                        warn!(
                            event_type = %dropped.event_type,
                            "Event queue full, dropped oldest event"
                        );
                    }
                    event = rejected;
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("Event queue disconnected");
                    return;
                }
            }
        }
    }

    fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);

        let Some(handle) = self.worker.lock().take() else {
            return;
        };

        match self.exited.recv_timeout(self.shutdown_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!("Event dispatcher thread panicked");
                }
                debug!("Event dispatcher stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "Event dispatcher did not stop in time, detaching"
                );
            }
        }

        let discarded = self.rx.try_iter().count();
        if discarded > 0 {
            info!(discarded, "Discarded undelivered events on shutdown");
        }
    }
}

fn dispatch_loop(subscribers: &RwLock<SubscriberMap>, rx: &Receiver<Event>, running: &AtomicBool) {
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => dispatch(subscribers, &event),
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if !running.load(Ordering::Acquire) && rx.is_empty() {
            break;
        }
    }
}

fn dispatch(subscribers: &RwLock<SubscriberMap>, event: &Event) {
    // Snapshot so handlers may subscribe or publish without deadlocking.
    let handlers: Vec<EventHandler> = match subscribers.read().get(&event.event_type) {
        Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
        None => Vec::new(),
    };

    if handlers.is_empty() {
        debug!(event_type = %event.event_type, "No subscribers for event");
        return;
    }

    for handler in handlers {
        match panic::catch_unwind(AssertUnwindSafe(|| (handler.as_ref())(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(event_type = %event.event_type, error = %e, "Event handler failed");
            }
            Err(panic) => {
                error!(
                    event_type = %event.event_type,
                    panic = %panic_message(&panic),
                    "Event handler panicked"
                );
            }
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
