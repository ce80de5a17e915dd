//! Background worker that waits for hints to become ready and runs a notification
//! pass for each of them.
use crate::delivery::Delivery;
use crate::dispatch::{self, PassError, PassOutcome};
use crate::render::{DEFAULT_LANGUAGE, Renderer};
use concepts::storage::{DbConnection, DbError, DbPool, HintClaim, HintStore};
use concepts::time::ClockFn;
use concepts::{BlockId, NotificationHint, WorkspaceId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Debounce window added to the time of an edit by producers.
    pub notify_freq: Duration,
    /// Capacity of the wake channel.
    pub hint_queue_size: usize,
    pub enqueue_timeout: Duration,
    /// Sleep when no hints are pending, unless woken up.
    pub idle_sleep: Duration,
    pub error_retry_sleep: Duration,
    /// How many times a hint whose root could not be resolved is put back.
    pub resolution_retries: u32,
    pub resolution_retry_backoff: Duration,
    /// Only process hints of this workspace. `None` means all workspaces.
    pub container_scope: Option<WorkspaceId>,
    pub server_root: String,
    pub language: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            notify_freq: Duration::from_secs(120),
            hint_queue_size: 20,
            enqueue_timeout: Duration::from_secs(10),
            idle_sleep: Duration::from_secs(60 * 60),
            error_retry_sleep: Duration::from_secs(60),
            resolution_retries: 3,
            resolution_retry_backoff: Duration::from_secs(60),
            container_scope: None,
            server_root: "http://localhost:8000".to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum NotifierState {
    Stopped,
    /// The worker was spawned but has not taken over the wake channel yet.
    Starting,
    Running,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("timed out after {timeout:?} while enqueueing a hint for block `{block_id}`")]
    HintEnqueueTimeout { block_id: BlockId, timeout: Duration },
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TickProgress {
    /// A hint was claimed, look for the next one right away.
    Processed(Option<PassOutcome>),
    Sleep(Duration),
}

#[derive(Debug)]
struct Lifecycle {
    state: NotifierState,
    /// Fresh token for every run.
    cancel: Option<CancellationToken>,
    run_id: u64,
    worker: Option<AbortHandle>,
}

struct NotifierInner<C: ClockFn> {
    config: NotifierConfig,
    renderer: Renderer,
    db_pool: Arc<dyn DbPool>,
    delivery: Arc<dyn Delivery>,
    clock_fn: C,
    wake_tx: mpsc::Sender<()>,
    /// Held by the active worker, so at most one worker runs at a time.
    wake_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<()>>>,
    lifecycle: Mutex<Lifecycle>,
    worker_runs: AtomicU64,
}

pub struct Notifier<C: ClockFn> {
    inner: Arc<NotifierInner<C>>,
}

impl<C: ClockFn> Notifier<C> {
    #[must_use]
    pub fn new(
        config: NotifierConfig,
        db_pool: Arc<dyn DbPool>,
        delivery: Arc<dyn Delivery>,
        clock_fn: C,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(config.hint_queue_size.max(1));
        let renderer = Renderer::new(&config.server_root, &config.language);
        Self {
            inner: Arc::new(NotifierInner {
                config,
                renderer,
                db_pool,
                delivery,
                clock_fn,
                wake_tx,
                wake_rx: Arc::new(tokio::sync::Mutex::new(wake_rx)),
                lifecycle: Mutex::new(Lifecycle {
                    state: NotifierState::Stopped,
                    cancel: None,
                    run_id: 0,
                    worker: None,
                }),
                worker_runs: AtomicU64::default(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &NotifierConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> NotifierState {
        self.inner.lifecycle.lock().unwrap().state
    }

    /// Spawn the worker unless it is already running. Must be called from within
    /// a tokio runtime.
    #[instrument(level = Level::DEBUG, name = "notifier.start", skip_all)]
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        if lifecycle.state != NotifierState::Stopped {
            debug!(state = %lifecycle.state, "Already started");
            return;
        }
        let cancel = CancellationToken::new();
        lifecycle.run_id += 1;
        lifecycle.state = NotifierState::Starting;
        lifecycle.cancel = Some(cancel.clone());
        let run_id = lifecycle.run_id;
        let inner = self.inner.clone();
        lifecycle.worker = Some(tokio::spawn(inner.run(cancel, run_id)).abort_handle());
        debug!(run_id, "Spawned the notifier worker");
    }

    /// Signal the worker to exit. A pass in progress is finished first.
    #[instrument(level = Level::DEBUG, name = "notifier.stop", skip_all)]
    pub fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        if lifecycle.state == NotifierState::Stopped {
            trace!("Already stopped");
            return;
        }
        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        lifecycle.state = NotifierState::Stopped;
        info!("Stopping the notifier");
    }

    /// Stop and wait until the worker exits.
    #[instrument(level = Level::DEBUG, name = "notifier.close", skip_all)]
    pub async fn close(&self) {
        self.stop();
        let worker = self.inner.lifecycle.lock().unwrap().worker.take();
        if let Some(worker) = worker {
            while !worker.is_finished() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        debug!("Gracefully closed");
    }

    /// Wake the worker up so that a new hint is not missed while it sleeps.
    #[instrument(level = Level::DEBUG, name = "notifier.enqueue_hint", skip_all, fields(block_id = %hint.block_id))]
    pub async fn enqueue_hint(&self, hint: &NotificationHint) -> Result<(), NotifyError> {
        let timeout = self.inner.config.enqueue_timeout;
        // The receiver lives as long as the sender, a full channel is the only failure.
        if self.inner.wake_tx.send_timeout((), timeout).await.is_err() {
            warn!("Wake channel stayed full for {timeout:?}");
            return Err(NotifyError::HintEnqueueTimeout {
                block_id: hint.block_id.clone(),
                timeout,
            });
        }
        Ok(())
    }

    /// Record a change of a block and wake the worker. Returns the stored hint.
    pub async fn notify_block_change(
        &self,
        hint: NotificationHint,
    ) -> Result<NotificationHint, NotifyError> {
        let stored = self
            .inner
            .db_pool
            .connection()
            .upsert_hint(hint, self.inner.config.notify_freq)
            .await?;
        self.enqueue_hint(&stored).await?;
        Ok(stored)
    }

    /// Run a notification pass for `hint` outside of the worker.
    pub async fn run_pass(&self, hint: &NotificationHint) -> Result<PassOutcome, PassError> {
        let db_connection = self.inner.db_pool.connection();
        dispatch::run_pass(
            db_connection.as_ref(),
            self.inner.delivery.as_ref(),
            &self.inner.renderer,
            hint,
        )
        .await
    }
}

impl<C: ClockFn> Drop for Notifier<C> {
    fn drop(&mut self) {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        if let Some(worker) = lifecycle.worker.take()
            && !worker.is_finished()
        {
            warn!("Aborting the notifier worker");
            worker.abort();
        }
    }
}

impl<C: ClockFn> NotifierInner<C> {
    #[instrument(level = Level::DEBUG, name = "notifier.run", skip_all, fields(run_id = run_id))]
    async fn run(self: Arc<Self>, cancel: CancellationToken, run_id: u64) {
        let mut wake_rx = tokio::select! {
            () = cancel.cancelled() => return,
            wake_rx = self.wake_rx.clone().lock_owned() => wake_rx,
        };
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if lifecycle.run_id != run_id || lifecycle.state != NotifierState::Starting {
                return;
            }
            lifecycle.state = NotifierState::Running;
        }
        self.worker_runs.fetch_add(1, Ordering::Relaxed);
        info!("Notifier started");
        let mut old_err = None;
        loop {
            let res = self.tick().await;
            let sleep = match &res {
                Ok(TickProgress::Processed(_)) => None,
                Ok(TickProgress::Sleep(duration)) => Some(*duration),
                Err(_) => Some(self.config.error_retry_sleep),
            };
            log_err_if_new(res, &mut old_err);
            if cancel.is_cancelled() {
                break;
            }
            let Some(sleep) = sleep else {
                continue;
            };
            trace!("Sleeping for {sleep:?}");
            tokio::select! {
                () = cancel.cancelled() => break,
                woken = wake_rx.recv() => {
                    if woken.is_none() {
                        break;
                    }
                    // One wake up is enough for any number of signals.
                    while wake_rx.try_recv().is_ok() {}
                }
                () = tokio::time::sleep(sleep) => {}
            }
        }
        info!("Notifier stopped");
    }

    #[instrument(level = Level::TRACE, name = "notifier.tick", skip_all)]
    async fn tick(&self) -> Result<TickProgress, DbError> {
        let db_connection = self.db_pool.connection();
        let now = self.clock_fn.now();
        match db_connection
            .claim_next_hint(self.config.container_scope.as_ref(), now)
            .await?
        {
            HintClaim::Claimed(hint) => Ok(TickProgress::Processed(
                self.process(db_connection.as_ref(), hint).await,
            )),
            HintClaim::NotReady { notify_at } => {
                let until_ready = (notify_at - now).to_std().unwrap_or_default();
                Ok(TickProgress::Sleep(until_ready.min(self.config.idle_sleep)))
            }
            HintClaim::Empty => Ok(TickProgress::Sleep(self.config.idle_sleep)),
        }
    }

    /// Run the pass of a claimed hint. Errors end here.
    #[instrument(level = Level::DEBUG, name = "notifier.process", skip_all, fields(block_id = %hint.block_id, attempts = hint.attempts))]
    async fn process(
        &self,
        db_connection: &dyn DbConnection,
        hint: NotificationHint,
    ) -> Option<PassOutcome> {
        match dispatch::run_pass(db_connection, self.delivery.as_ref(), &self.renderer, &hint)
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(PassError::Partial(composite)) => {
                error!("Notification pass finished with errors - {composite}");
                Some(composite.outcome)
            }
            Err(PassError::DiffResolution(err)) if err.is_not_found() => {
                warn!("Dropping hint of a missing block - {err}");
                None
            }
            Err(err) => {
                self.retry_later(db_connection, hint, &err).await;
                None
            }
        }
    }

    async fn retry_later(
        &self,
        db_connection: &dyn DbConnection,
        mut hint: NotificationHint,
        err: &PassError,
    ) {
        if hint.attempts >= self.config.resolution_retries {
            warn!("Dropping hint after {} attempts - {err}", hint.attempts + 1);
            return;
        }
        hint.attempts += 1;
        hint.notify_at = self.clock_fn.now() + self.config.resolution_retry_backoff;
        let notify_at = hint.notify_at;
        match db_connection.requeue_hint(hint).await {
            Ok(true) => info!(%notify_at, "Hint requeued - {err}"),
            Ok(false) => debug!("Not requeued, a fresher hint exists - {err}"),
            Err(db_err) => error!("Cannot requeue hint - {db_err}, pass failed with {err}"),
        }
    }
}

fn log_err_if_new(res: Result<TickProgress, DbError>, old_err: &mut Option<DbError>) {
    match (res, &old_err) {
        (Ok(_), _) => {
            *old_err = None;
        }
        (Err(err), Some(old)) if err == *old => {}
        (Err(err), _) => {
            error!("Tick failed: {err:?}");
            *old_err = Some(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::recording::RecordingDelivery;
    use assert_matches::assert_matches;
    use chrono::{DateTime, Utc};
    use concepts::storage::{BlockStore, SubscriptionStore};
    use concepts::{Block, BlockType, UserId};
    use db_mem::InMemoryPool;
    use db_tests::faulty::{FaultyPool, INJECTED_ERROR};
    use db_tests::fixtures::{board, card, container, edited, hint, subscription};
    use test_utils::set_up;
    use test_utils::sim_clock::SimClock;

    const WAIT_STEP: Duration = Duration::from_millis(10);

    fn notifier(
        config: NotifierConfig,
        sim_clock: &SimClock,
    ) -> (Notifier<SimClock>, Arc<dyn DbConnection>, RecordingDelivery) {
        let db_pool = Arc::new(InMemoryPool::new());
        let db_connection = db_pool.connection();
        let delivery = RecordingDelivery::default();
        let notifier = Notifier::new(
            config,
            db_pool,
            Arc::new(delivery.clone()),
            sim_clock.clone(),
        );
        (notifier, db_connection, delivery)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
        panic!("condition not met in time");
    }

    /// Board `b1` with card `c1`, `a` and `e` subscribed to the card.
    async fn seed(db_connection: &dyn DbConnection, at: DateTime<Utc>) -> Block {
        db_connection
            .insert_block(board("b1", "Board", "alice", at))
            .await
            .unwrap();
        let card = card("c1", "b1", "Card", "alice", at);
        db_connection.insert_block(card.clone()).await.unwrap();
        for subscriber in ["a", "e"] {
            db_connection
                .create_subscription(subscription("c1", BlockType::Card, subscriber, at))
                .await
                .unwrap();
        }
        card
    }

    #[tokio::test]
    async fn enqueue_times_out_when_the_queue_is_full() {
        set_up();
        let sim_clock = SimClock::default();
        let config = NotifierConfig {
            enqueue_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (notifier, _db_connection, _delivery) = notifier(config, &sim_clock);
        let hint = hint("c1", BlockType::Card, "e", sim_clock.now());
        for _ in 0..20 {
            notifier.enqueue_hint(&hint).await.unwrap();
        }
        let err = notifier.enqueue_hint(&hint).await.unwrap_err();
        assert_matches!(
            err,
            NotifyError::HintEnqueueTimeout { block_id, timeout }
                if block_id == hint.block_id && timeout == Duration::from_millis(50)
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        set_up();
        let sim_clock = SimClock::default();
        let (notifier, _db_connection, _delivery) = notifier(NotifierConfig::default(), &sim_clock);
        notifier.stop();
        notifier.start();
        notifier.stop();
        notifier.stop();
        assert_eq!(NotifierState::Stopped, notifier.state());
        notifier.close().await;
    }

    #[tokio::test]
    async fn start_twice_runs_one_worker() {
        set_up();
        let sim_clock = SimClock::default();
        let (notifier, _db_connection, _delivery) = notifier(NotifierConfig::default(), &sim_clock);
        notifier.start();
        notifier.start();
        wait_until(|| notifier.state() == NotifierState::Running).await;
        notifier.start();
        assert_eq!(1, notifier.inner.worker_runs.load(Ordering::Relaxed));

        notifier.close().await;
        notifier.start();
        wait_until(|| notifier.state() == NotifierState::Running).await;
        assert_eq!(2, notifier.inner.worker_runs.load(Ordering::Relaxed));
        notifier.close().await;
    }

    #[tokio::test]
    async fn running_worker_delivers_after_being_woken_up() {
        set_up();
        let sim_clock = SimClock::default();
        let config = NotifierConfig {
            notify_freq: Duration::ZERO,
            ..Default::default()
        };
        let (notifier, db_connection, delivery) = notifier(config, &sim_clock);
        let card = seed(db_connection.as_ref(), sim_clock.now()).await;
        notifier.start();
        wait_until(|| notifier.state() == NotifierState::Running).await;

        sim_clock.move_time_forward(Duration::from_secs(30));
        let mut renamed = edited(&card, "e", sim_clock.now());
        renamed.title = "Renamed".to_string();
        db_connection.insert_block(renamed).await.unwrap();
        // Idle sleep is an hour, only the wake up can get the hint processed.
        notifier
            .notify_block_change(hint("c1", BlockType::Card, "e", sim_clock.now()))
            .await
            .unwrap();

        wait_until(|| !delivery.delivered().is_empty()).await;
        assert_eq!(vec![UserId::new("a")], delivery.recipients());
        let (_, rendered) = &delivery.delivered()[0];
        assert_eq!("Renamed", rendered.title);
        notifier.close().await;

        assert_eq!(None, db_connection.peek_next_hint(None).await.unwrap());
        let subscribers = db_connection
            .subscribers_for_block(&container(), &card.id)
            .await
            .unwrap();
        assert!(
            subscribers
                .iter()
                .all(|sub| sub.notified_at == sim_clock.now())
        );
    }

    #[tokio::test]
    async fn hint_of_a_missing_block_is_dropped() {
        set_up();
        let sim_clock = SimClock::default();
        let (notifier, db_connection, _delivery) =
            notifier(NotifierConfig::default(), &sim_clock);
        db_connection
            .create_subscription(subscription("gone", BlockType::Card, "a", sim_clock.now()))
            .await
            .unwrap();

        let outcome = notifier
            .inner
            .process(
                db_connection.as_ref(),
                hint("gone", BlockType::Card, "e", sim_clock.now()),
            )
            .await;
        assert_eq!(None, outcome);
        assert_eq!(None, db_connection.peek_next_hint(None).await.unwrap());
    }

    #[tokio::test]
    async fn inconsistent_block_is_retried_a_bounded_number_of_times() {
        set_up();
        let sim_clock = SimClock::default();
        let config = NotifierConfig {
            resolution_retries: 1,
            ..Default::default()
        };
        let backoff = config.resolution_retry_backoff;
        let (notifier, db_connection, _delivery) = notifier(config, &sim_clock);
        // A comment without a parent cannot be resolved to a card.
        let mut orphan = card("k1", "b1", "orphan", "alice", sim_clock.now());
        orphan.block_type = BlockType::Comment;
        orphan.parent_id = None;
        db_connection.insert_block(orphan).await.unwrap();
        db_connection
            .create_subscription(subscription("k1", BlockType::Comment, "a", sim_clock.now()))
            .await
            .unwrap();

        let first = hint("k1", BlockType::Comment, "e", sim_clock.now());
        assert_eq!(
            None,
            notifier.inner.process(db_connection.as_ref(), first).await
        );
        let requeued = db_connection.peek_next_hint(None).await.unwrap().unwrap();
        assert_eq!(1, requeued.attempts);
        assert_eq!(sim_clock.now() + backoff, requeued.notify_at);

        sim_clock.move_time_forward(backoff);
        let claimed = assert_matches!(
            db_connection.claim_next_hint(None, sim_clock.now()).await.unwrap(),
            HintClaim::Claimed(claimed) => claimed
        );
        assert_eq!(
            None,
            notifier.inner.process(db_connection.as_ref(), claimed).await
        );
        assert_eq!(None, db_connection.peek_next_hint(None).await.unwrap());
    }

    #[tokio::test]
    async fn not_ready_hint_sleeps_until_notify_at() {
        set_up();
        let sim_clock = SimClock::default();
        let (notifier, db_connection, _delivery) =
            notifier(NotifierConfig::default(), &sim_clock);
        db_connection
            .upsert_hint(
                hint("c1", BlockType::Card, "e", sim_clock.now()),
                Duration::from_secs(90),
            )
            .await
            .unwrap();
        assert_eq!(
            TickProgress::Sleep(Duration::from_secs(90)),
            notifier.inner.tick().await.unwrap()
        );
        db_connection.claim_next_hint(None, sim_clock.now() + Duration::from_secs(90)).await.unwrap();
        assert_eq!(
            TickProgress::Sleep(notifier.config().idle_sleep),
            notifier.inner.tick().await.unwrap()
        );
    }

    #[tokio::test]
    async fn tick_fails_when_the_store_is_closed() {
        set_up();
        let sim_clock = SimClock::default();
        let db_pool = Arc::new(InMemoryPool::new());
        let notifier = Notifier::new(
            NotifierConfig::default(),
            db_pool.clone(),
            Arc::new(RecordingDelivery::default()),
            sim_clock,
        );
        db_pool.close().await.unwrap();
        assert_matches!(
            notifier.inner.tick().await,
            Err(DbError::Connection(concepts::storage::DbConnectionError::Closed))
        );
    }

    #[tokio::test]
    async fn worker_retries_after_claim_errors() {
        set_up();
        let sim_clock = SimClock::default();
        let db_pool = FaultyPool::new(Arc::new(InMemoryPool::new()));
        let faulty = db_pool.faulty_connection().clone();
        let db_connection = db_pool.connection();
        let delivery = RecordingDelivery::default();
        let notifier = Notifier::new(
            NotifierConfig {
                error_retry_sleep: Duration::from_millis(10),
                ..Default::default()
            },
            Arc::new(db_pool),
            Arc::new(delivery.clone()),
            sim_clock.clone(),
        );
        let card = seed(db_connection.as_ref(), sim_clock.now()).await;
        sim_clock.move_time_forward(Duration::from_secs(30));
        db_connection
            .insert_block(edited(&card, "e", sim_clock.now()))
            .await
            .unwrap();
        db_connection
            .upsert_hint(hint("c1", BlockType::Card, "e", sim_clock.now()), Duration::ZERO)
            .await
            .unwrap();
        faulty.fail_next_claims(2);
        assert_matches!(notifier.inner.tick().await, Err(err) if err == INJECTED_ERROR);

        // Nothing wakes the worker up, only the short error sleep gets it to the hint.
        notifier.start();
        wait_until(|| !delivery.delivered().is_empty()).await;
        assert_eq!(0, faulty.claim_failures_left());
        assert_eq!(vec![UserId::new("a")], delivery.recipients());
        notifier.close().await;
    }

    #[tokio::test]
    async fn enqueue_interrupts_the_wait_for_a_later_hint() {
        set_up();
        let sim_clock = SimClock::default();
        let config = NotifierConfig {
            notify_freq: Duration::ZERO,
            ..Default::default()
        };
        let (notifier, db_connection, delivery) = notifier(config, &sim_clock);
        seed(db_connection.as_ref(), sim_clock.now()).await;
        let later = Duration::from_secs(3600);
        db_connection
            .upsert_hint(hint("c1", BlockType::Card, "e", sim_clock.now()), later)
            .await
            .unwrap();
        let second = card("c2", "b1", "Second", "alice", sim_clock.now());
        db_connection.insert_block(second.clone()).await.unwrap();
        db_connection
            .create_subscription(subscription("c2", BlockType::Card, "a", sim_clock.now()))
            .await
            .unwrap();
        notifier.start();
        wait_until(|| notifier.state() == NotifierState::Running).await;
        // Let the worker settle into the wait for `c1`.
        tokio::time::sleep(WAIT_STEP * 5).await;
        assert!(delivery.delivered().is_empty());

        sim_clock.move_time_forward(Duration::from_secs(30));
        let mut renamed = edited(&second, "e", sim_clock.now());
        renamed.title = "Second renamed".to_string();
        db_connection.insert_block(renamed).await.unwrap();
        notifier
            .notify_block_change(hint("c2", BlockType::Card, "e", sim_clock.now()))
            .await
            .unwrap();

        wait_until(|| !delivery.delivered().is_empty()).await;
        let (_, rendered) = &delivery.delivered()[0];
        assert_eq!("Second renamed", rendered.title);
        notifier.close().await;
        let pending = db_connection.peek_next_hint(None).await.unwrap().unwrap();
        assert_eq!(BlockId::new("c1"), pending.block_id);
    }
}
