//! Process-wide typed event bus. Bot lifecycle and trading events fan out to
//! subscribers filtered by user or by bot. Never persists anything itself --
//! the orchestrator's event handler is responsible for durability.

use portable_atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::engine::EngineStats;
use crate::executor::TrackedPosition;

/// Kind-specific payload for a `BotEvent`. Mirrors the teacher's tagged
/// `WsMessage` enum so the event bus and the outward SSE stream share one
/// wire format.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "engine_started")]
    EngineStarted,

    #[serde(rename = "engine_stopped")]
    EngineStopped { stats: EngineStats },

    #[serde(rename = "engine_error")]
    EngineError { reason: String },

    #[serde(rename = "scan_completed")]
    ScanCompleted { eligible: usize, entered: usize },

    #[serde(rename = "position_opened")]
    PositionOpened { position: Box<TrackedPosition> },

    #[serde(rename = "position_updated")]
    PositionUpdated {
        position_id: String,
        current_price_per_token: f64,
        unrealized_pnl_lamports: i64,
    },

    #[serde(rename = "position_closed")]
    PositionClosed { position: Box<TrackedPosition> },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::EngineStarted => "engine_started",
            EventPayload::EngineStopped { .. } => "engine_stopped",
            EventPayload::EngineError { .. } => "engine_error",
            EventPayload::ScanCompleted { .. } => "scan_completed",
            EventPayload::PositionOpened { .. } => "position_opened",
            EventPayload::PositionUpdated { .. } => "position_updated",
            EventPayload::PositionClosed { .. } => "position_closed",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BotEvent {
    pub sequence: u64,
    pub bot_id: String,
    pub user_id: String,
    pub emitted_at: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

type Handler = Box<dyn Fn(&BotEvent) + Send + Sync>;

enum Filter {
    User(String),
    Bot(String),
}

struct Subscriber {
    filter: Filter,
    handler: Handler,
}

/// Single in-process typed emitter. Safe to emit to concurrently; each
/// subscriber's handler is isolated -- a panic inside one handler is caught
/// and logged, it never takes down the emitter or other subscribers.
pub struct EventBus {
    sequence: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_sub_id: AtomicU64,
}

/// Returned by `subscribe_user` / `subscribe_bot`. Calling it unsubscribes;
/// calling it twice is a no-op.
pub struct Unsubscribe {
    bus: Arc<EventBus>,
    id: u64,
}

impl Unsubscribe {
    pub fn call(self) {
        self.bus.subscribers.lock().unwrap().remove(&self.id);
    }
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sequence: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(0),
        })
    }

    pub fn emit(self: &Arc<Self>, bot_id: &str, user_id: &str, payload: EventPayload) {
        let event = BotEvent {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            bot_id: bot_id.to_string(),
            user_id: user_id.to_string(),
            emitted_at: chrono::Utc::now(),
            payload,
        };

        let subs = self.subscribers.lock().unwrap();
        for sub in subs.values() {
            let matches = match &sub.filter {
                Filter::User(u) => u == user_id,
                Filter::Bot(b) => b == bot_id,
            };
            if !matches {
                continue;
            }
            let handler = &sub.handler;
            let event_ref = &event;
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event_ref))) {
                tracing::error!(?panic, bot_id = %bot_id, "event bus handler panicked");
            }
        }
    }

    pub fn subscribe_user(self: &Arc<Self>, user_id: impl Into<String>, handler: impl Fn(&BotEvent) + Send + Sync + 'static) -> Unsubscribe {
        self.add_subscriber(Filter::User(user_id.into()), handler)
    }

    pub fn subscribe_bot(self: &Arc<Self>, bot_id: impl Into<String>, handler: impl Fn(&BotEvent) + Send + Sync + 'static) -> Unsubscribe {
        self.add_subscriber(Filter::Bot(bot_id.into()), handler)
    }

    fn add_subscriber(self: &Arc<Self>, filter: Filter, handler: impl Fn(&BotEvent) + Send + Sync + 'static) -> Unsubscribe {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().insert(id, Subscriber { filter, handler: Box::new(handler) });
        Unsubscribe { bus: self.clone(), id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};

    #[test]
    fn test_bot_filter_isolates_events() {
        let bus = EventBus::new();
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));

        let ca = count_a.clone();
        let _unsub_a = bus.subscribe_bot("bot-a", move |_| {
            ca.fetch_add(1, StdOrdering::Relaxed);
        });
        let cb = count_b.clone();
        let _unsub_b = bus.subscribe_bot("bot-b", move |_| {
            cb.fetch_add(1, StdOrdering::Relaxed);
        });

        bus.emit("bot-a", "user-1", EventPayload::EngineStarted);

        assert_eq!(count_a.load(StdOrdering::Relaxed), 1);
        assert_eq!(count_b.load(StdOrdering::Relaxed), 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let unsub = bus.subscribe_user("user-1", |_| {});
        unsub.call();
        // second removal attempt via a fresh handle referencing a stale id is a no-op
        bus.emit("bot-a", "user-1", EventPayload::EngineStarted);
    }

    #[test]
    fn test_handler_panic_is_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _unsub_panicker = bus.subscribe_bot("bot-a", |_| panic!("boom"));
        let _unsub_counter = bus.subscribe_bot("bot-a", move |_| {
            c.fetch_add(1, StdOrdering::Relaxed);
        });

        bus.emit("bot-a", "user-1", EventPayload::EngineStarted);
        assert_eq!(count.load(StdOrdering::Relaxed), 1);
    }
}
