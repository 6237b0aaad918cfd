//! Process-wide shared state. Following the teacher's pattern, collaborators
//! reach each other through channels and `Arc`-shared handles rather than a
//! single giant lock -- the orchestrator, event bus, and DB writer each own
//! their own synchronization internally.

use std::sync::Arc;

use portable_atomic::{AtomicU64, Ordering};

use crate::config::AppConfig;
use crate::db::DbHandle;
use crate::events::EventBus;
use crate::orchestrator::BotOrchestrator;
use crate::predictor::PredictorClient;

/// Lock-free counters surfaced on a metrics/health endpoint.
pub struct PerfCounters {
    pub scans_completed: AtomicU64,
    pub positions_opened: AtomicU64,
    pub positions_closed: AtomicU64,
    pub errors_recovered: AtomicU64,
    pub events_emitted: AtomicU64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            scans_completed: AtomicU64::new(0),
            positions_opened: AtomicU64::new(0),
            positions_closed: AtomicU64::new(0),
            errors_recovered: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
        }
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AppState {
    pub config: AppConfig,
    pub db: DbHandle,
    pub events: Arc<EventBus>,
    pub orchestrator: Arc<BotOrchestrator>,
    pub predictor: Option<Arc<PredictorClient>>,
    pub counters: PerfCounters,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: DbHandle,
        events: Arc<EventBus>,
        orchestrator: Arc<BotOrchestrator>,
        predictor: Option<Arc<PredictorClient>>,
    ) -> Arc<Self> {
        Arc::new(Self { config, db, events, orchestrator, predictor, counters: PerfCounters::new() })
    }

    #[inline]
    pub fn record_event_emitted(&self) {
        self.counters.events_emitted.fetch_add(1, Ordering::Relaxed);
    }
}
