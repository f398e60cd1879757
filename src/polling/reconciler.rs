//! Polling reconciler: refetch an entity until its completion predicate holds.
//!
//! Each session is a spawned task that waits on its interval ticker or on a
//! shutdown `Notify`, whichever fires first. Fetches run inline in that task,
//! so one session never has two fetches in flight; ticks that come due while
//! a fetch is outstanding are skipped rather than queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::config::PollingConfig;
use crate::core::ids::EntityId;
use crate::polling::entity::{EntityFields, PollableEntity};
use crate::transport::EntityFetcher;

/// Smallest accepted interval; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Progress report from a poll session.
#[derive(Clone, Debug, PartialEq)]
pub enum PollNotification {
    /// A fetch succeeded but the entity is not complete yet.
    Updated {
        /// Entity being polled.
        entity_id: EntityId,
        /// Fields returned by this fetch.
        fields: EntityFields,
        /// 1-based fetch number.
        attempt: u64,
    },
    /// The entity is complete; the session has stopped.
    Settled {
        /// Entity being polled.
        entity_id: EntityId,
        /// Fields that satisfied the predicate.
        fields: EntityFields,
        /// 1-based fetch number.
        attempt: u64,
    },
    /// The attempt cap was reached without settling; the session has stopped.
    Expired {
        /// Entity being polled.
        entity_id: EntityId,
        /// Fetches issued.
        attempts: u64,
    },
}

impl PollNotification {
    /// Fields carried by the notification, if any.
    #[must_use]
    pub const fn fields(&self) -> Option<&EntityFields> {
        match self {
            Self::Updated { fields, .. } | Self::Settled { fields, .. } => Some(fields),
            Self::Expired { .. } => None,
        }
    }

    /// Whether the session stopped after this notification.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled { .. } | Self::Expired { .. })
    }
}

/// Observable state of one poll session.
#[derive(Clone, Debug, PartialEq)]
pub struct PollSession {
    /// Entity being polled.
    pub entity_id: EntityId,
    /// Time between fetches.
    pub interval: Duration,
    /// Whether the session can still fetch.
    pub active: bool,
    /// Freshest known fields.
    pub last_fields: EntityFields,
    /// Fetches issued.
    pub attempts: u64,
    /// Fetches that failed.
    pub failures: u64,
    /// Whether a fetch is outstanding.
    pub in_flight: bool,
    /// Whether the predicate has been satisfied.
    pub settled: bool,
}

impl PollSession {
    fn new(entity: &PollableEntity, interval: Duration, active: bool, settled: bool) -> Self {
        Self {
            entity_id: entity.id.clone(),
            interval,
            active,
            last_fields: entity.fields.clone(),
            attempts: 0,
            failures: 0,
            in_flight: false,
            settled,
        }
    }
}

/// What `start` did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollStart {
    /// A new session is polling.
    Started,
    /// The known fields already satisfied the predicate; nothing was fetched.
    AlreadyComplete,
    /// Another session for the same entity is active; nothing was started.
    AlreadyActive,
}

#[derive(Debug)]
struct SessionControl {
    token: u64,
    cancelled: AtomicBool,
    shutdown: Notify,
}

impl SessionControl {
    fn new(token: u64) -> Self {
        Self {
            token,
            cancelled: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        if first {
            // notify_one stores a permit if the loop is not waiting yet.
            self.shutdown.notify_one();
        }
        first
    }
}

type Registry = DashMap<EntityId, Arc<SessionControl>>;

fn release(registry: &Registry, entity_id: &EntityId, token: u64) {
    registry.remove_if(entity_id, |_, control| control.token == token);
}

/// Caller's view of one `start` call.
///
/// Dropping the handle does not stop the session; call [`cancel`](Self::cancel).
#[derive(Debug)]
pub struct PollHandle {
    entity_id: EntityId,
    status: PollStart,
    control: Option<Arc<SessionControl>>,
    registry: Arc<Registry>,
    session: watch::Receiver<PollSession>,
    notifications: mpsc::UnboundedReceiver<PollNotification>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    fn inert(
        entity: &PollableEntity,
        interval: Duration,
        status: PollStart,
        registry: Arc<Registry>,
    ) -> Self {
        let settled = status == PollStart::AlreadyComplete;
        let (_, session) = watch::channel(PollSession::new(entity, interval, false, settled));
        let (_, notifications) = mpsc::unbounded_channel();
        Self {
            entity_id: entity.id.clone(),
            status,
            control: None,
            registry,
            session,
            notifications,
            task: None,
        }
    }

    /// Entity this handle observes.
    #[must_use]
    pub const fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// What `start` did.
    #[must_use]
    pub const fn status(&self) -> PollStart {
        self.status
    }

    /// Snapshot of the session state.
    #[must_use]
    pub fn session(&self) -> PollSession {
        self.session.borrow().clone()
    }

    /// Receiver that wakes whenever the session state changes.
    #[must_use]
    pub fn watch_session(&self) -> watch::Receiver<PollSession> {
        self.session.clone()
    }

    /// Whether the session can still fetch.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.control.as_ref().is_some_and(|c| !c.is_cancelled()) && self.session.borrow().active
    }

    /// Next notification; `None` once the session has stopped and all
    /// notifications were received (immediately for inert handles).
    pub async fn recv(&mut self) -> Option<PollNotification> {
        self.notifications.recv().await
    }

    /// Drain notifications until the session stops.
    ///
    /// Returns the settled fields, or `None` if the session expired, was
    /// cancelled, or never started. For `AlreadyComplete` handles the known
    /// fields are returned immediately.
    pub async fn wait_settled(&mut self) -> Option<EntityFields> {
        if self.status == PollStart::AlreadyComplete {
            return Some(self.session.borrow().last_fields.clone());
        }
        while let Some(notification) = self.recv().await {
            if let PollNotification::Settled { fields, .. } = notification {
                return Some(fields);
            }
        }
        None
    }

    /// Stop the session. Idempotent; a no-op on inert or finished handles.
    pub fn cancel(&self) {
        let Some(control) = &self.control else {
            return;
        };
        if control.cancel() {
            release(&self.registry, &self.entity_id, control.token);
            debug!(entity_id = %self.entity_id, "poll session cancel requested");
        }
    }

    /// Wait for the session task to exit.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(entity_id = %self.entity_id, ?err, "poll task ended abnormally");
            }
        }
    }
}

/// Runs independent poll sessions, at most one per entity.
pub struct PollingReconciler {
    fetcher: Arc<dyn EntityFetcher>,
    config: PollingConfig,
    sessions: Arc<Registry>,
    next_token: AtomicU64,
}

impl PollingReconciler {
    /// Create a reconciler that fetches through `fetcher`.
    #[must_use]
    pub fn new(fetcher: Arc<dyn EntityFetcher>, config: PollingConfig) -> Self {
        Self {
            fetcher,
            config,
            sessions: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Start polling at the configured interval.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(&self, entity: PollableEntity) -> PollHandle {
        self.start_with(entity, self.config.interval())
    }

    /// Start polling at an explicit interval.
    ///
    /// If the known fields already satisfy the predicate, or a session for
    /// this entity is already active, no fetch is issued and the returned
    /// handle is inert.
    #[must_use]
    pub fn start_with(&self, entity: PollableEntity, interval: Duration) -> PollHandle {
        let interval = interval.max(MIN_INTERVAL);

        if entity.is_complete() {
            debug!(
                entity_id = %entity.id,
                predicate = entity.predicate.description(),
                "already complete, not polling"
            );
            return PollHandle::inert(
                &entity,
                interval,
                PollStart::AlreadyComplete,
                Arc::clone(&self.sessions),
            );
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let control = Arc::new(SessionControl::new(token));
        match self.sessions.entry(entity.id.clone()) {
            Entry::Occupied(_) => {
                debug!(entity_id = %entity.id, "session already active, not starting another");
                return PollHandle::inert(
                    &entity,
                    interval,
                    PollStart::AlreadyActive,
                    Arc::clone(&self.sessions),
                );
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&control));
            }
        }

        let (session_tx, session_rx) =
            watch::channel(PollSession::new(&entity, interval, true, false));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        info!(
            entity_id = %entity.id,
            interval_ms = interval.as_millis(),
            predicate = entity.predicate.description(),
            "starting poll session"
        );

        let entity_id = entity.id.clone();
        let worker = SessionWorker {
            entity,
            interval,
            max_attempts: self.config.max_attempts,
            fetcher: Arc::clone(&self.fetcher),
            control: Arc::clone(&control),
            registry: Arc::clone(&self.sessions),
            session: session_tx,
            notifications: notify_tx,
        };
        let task = tokio::spawn(worker.run());

        PollHandle {
            entity_id,
            status: PollStart::Started,
            control: Some(control),
            registry: Arc::clone(&self.sessions),
            session: session_rx,
            notifications: notify_rx,
            task: Some(task),
        }
    }

    /// Stop a session. Idempotent.
    pub fn cancel(&self, handle: &PollHandle) {
        handle.cancel();
    }

    /// Stop every active session.
    pub fn cancel_all(&self) {
        let controls: Vec<(EntityId, Arc<SessionControl>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        for (entity_id, control) in controls {
            if control.cancel() {
                release(&self.sessions, &entity_id, control.token);
            }
        }
    }

    /// Entities with an active session.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<EntityId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Whether `entity_id` has an active session.
    #[must_use]
    pub fn is_polling(&self, entity_id: &EntityId) -> bool {
        self.sessions.contains_key(entity_id)
    }
}

impl Drop for PollingReconciler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

struct SessionWorker {
    entity: PollableEntity,
    interval: Duration,
    max_attempts: Option<u64>,
    fetcher: Arc<dyn EntityFetcher>,
    control: Arc<SessionControl>,
    registry: Arc<Registry>,
    session: watch::Sender<PollSession>,
    notifications: mpsc::UnboundedSender<PollNotification>,
}

impl SessionWorker {
    fn emit(&self, notification: PollNotification) {
        // A dropped receiver only means nobody is listening.
        let _ = self.notifications.send(notification);
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut attempts = 0_u64;

        loop {
            tokio::select! {
                biased;
                () = self.control.shutdown.notified() => break,
                _ = ticker.tick() => {}
            }
            if self.control.is_cancelled() {
                break;
            }

            attempts += 1;
            self.session.send_modify(|s| {
                s.attempts = attempts;
                s.in_flight = true;
            });

            let result = tokio::select! {
                biased;
                () = self.control.shutdown.notified() => break,
                result = self.fetcher.fetch_entity(&self.entity.id) => result,
            };
            self.session.send_modify(|s| s.in_flight = false);

            // Results that land after teardown are dropped.
            if self.control.is_cancelled() {
                break;
            }

            match result {
                Ok(fields) => {
                    let settled = self.entity.predicate.evaluate(&fields);
                    self.entity.fields = fields.clone();
                    self.session.send_modify(|s| {
                        s.last_fields = fields.clone();
                        s.settled = settled;
                    });
                    let entity_id = self.entity.id.clone();
                    if settled {
                        info!(entity_id = %entity_id, attempt = attempts, "entity settled");
                        self.emit(PollNotification::Settled {
                            entity_id,
                            fields,
                            attempt: attempts,
                        });
                        break;
                    }
                    debug!(entity_id = %entity_id, attempt = attempts, "entity not complete yet");
                    self.emit(PollNotification::Updated {
                        entity_id,
                        fields,
                        attempt: attempts,
                    });
                }
                Err(err) => {
                    self.session.send_modify(|s| s.failures += 1);
                    warn!(
                        entity_id = %self.entity.id,
                        attempt = attempts,
                        error = %err,
                        "poll fetch failed, retrying on next tick"
                    );
                }
            }

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                warn!(entity_id = %self.entity.id, attempts, "poll attempts exhausted");
                self.emit(PollNotification::Expired {
                    entity_id: self.entity.id.clone(),
                    attempts,
                });
                break;
            }
        }

        self.session.send_modify(|s| {
            s.active = false;
            s.in_flight = false;
        });
        release(&self.registry, &self.entity.id, self.control.token);
        debug!(entity_id = %self.entity.id, attempts, "poll session stopped");
    }
}
