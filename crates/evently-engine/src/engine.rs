//! The actor that owns the pending-event store and drives it forward:
//! expansion, scheduling, rate-limited publishing, and the control surface
//! callers use to keep profiles and targets in sync.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use evently_core::{AutomationState, PendingRecord, PendingStore, Profile, SlotExpander};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::publisher::EventPublisher;
use crate::task::rate_limit::{PublishQueue, RateLimitState};
use crate::LOG_TARGET;

/// Broadcast channel capacity for `onMissed`/`onPublished` notifications.
/// Generous enough that a slow subscriber doesn't immediately start
/// dropping events under normal load.
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub(crate) struct EngineState {
    pub pending: PendingStore,
    pub automation: AutomationState,
    pub profiles: BTreeMap<(String, String), Profile>,
    pub known_targets: BTreeSet<String>,
}

/// Owns everything the engine needs to run: the durable store, the
/// rate-limit state per target, the priority queue of due records, and
/// handles to the two background loops that drive them.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) publisher: Arc<dyn EventPublisher>,
    pub(crate) expander: Arc<dyn SlotExpander>,
    pub(crate) state: RwLock<EngineState>,
    pub(crate) rate_limits: Mutex<BTreeMap<String, RateLimitState>>,
    pub(crate) queue: Mutex<PublishQueue>,
    pub(crate) wake: watch::Sender<()>,
    pub(crate) missed_tx: broadcast::Sender<PendingRecord>,
    pub(crate) published_tx: broadcast::Sender<PendingRecord>,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl Engine {
    /// Loads the durable documents from `pending_path`/`automation_path`
    /// and spawns the scheduler and publish-worker background tasks.
    pub async fn spawn(
        config: EngineConfig,
        publisher: Arc<dyn EventPublisher>,
        expander: Arc<dyn SlotExpander>,
        pending_path: PathBuf,
        automation_path: PathBuf,
    ) -> EngineResult<Arc<Self>> {
        let pending = PendingStore::load(pending_path, config.deleted_display_limit).await?;
        let automation = AutomationState::load(automation_path).await?;

        let (wake_tx, _wake_rx) = watch::channel(());
        let (missed_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (published_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let engine = Arc::new_cyclic(|weak: &Weak<Engine>| {
            let _ = weak;
            Engine {
                config,
                publisher,
                expander,
                state: RwLock::new(EngineState {
                    pending,
                    automation,
                    profiles: BTreeMap::new(),
                    known_targets: BTreeSet::new(),
                }),
                rate_limits: Mutex::new(BTreeMap::new()),
                queue: Mutex::new(PublishQueue::default()),
                wake: wake_tx,
                missed_tx,
                published_tx,
                shutdown: shutdown_tx,
            }
        });

        crate::task::scheduler::missed_on_start(&engine).await?;

        let handle = engine.handle();
        tokio::spawn(crate::task::scheduler::run(handle.clone()));
        tokio::spawn(crate::task::publish_worker::run(handle));

        info!(target: LOG_TARGET, "Engine started");
        Ok(engine)
    }

    pub fn handle(self: &Arc<Self>) -> EngineHandle {
        EngineHandle(Arc::downgrade(self))
    }

    pub fn subscribe_missed(&self) -> broadcast::Receiver<PendingRecord> {
        self.missed_tx.subscribe()
    }

    pub fn subscribe_published(&self) -> broadcast::Receiver<PendingRecord> {
        self.published_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Nudges the scheduler and publish worker to re-check immediately
    /// instead of waiting out their current idle sleep.
    pub(crate) fn notify(&self) {
        let _ = self.wake.send(());
    }
}

/// A weak handle background tasks hold so they stop on their own once the
/// owning [`Engine`] is dropped, instead of keeping it alive forever.
#[derive(Clone)]
pub struct EngineHandle(Weak<Engine>);

impl EngineHandle {
    pub fn upgrade(&self) -> Option<Arc<Engine>> {
        self.0.upgrade()
    }
}

impl From<&Arc<Engine>> for EngineHandle {
    fn from(engine: &Arc<Engine>) -> Self {
        engine.handle()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}
