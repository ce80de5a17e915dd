//! Store wrappers that fail selected operations on demand.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concepts::storage::{
    BlockHistoryQuery, BlockStore, DbConnection, DbConnectionError, DbError, DbPool, HintClaim,
    HintStore, SubscriptionStore,
};
use concepts::{
    Block, BlockId, Container, NotificationHint, Subscriber, Subscription, UserId, WorkspaceId,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

pub const INJECTED_ERROR: DbError = DbError::Connection(DbConnectionError::Busy);

#[derive(Debug, Default)]
struct Faults {
    claim_failures: AtomicU32,
    fail_watermarks: AtomicBool,
}

/// Delegates to `inner` unless a fault was armed.
#[derive(Debug, Clone)]
pub struct FaultyConnection {
    inner: Arc<dyn DbConnection>,
    faults: Arc<Faults>,
}

impl FaultyConnection {
    #[must_use]
    pub fn new(inner: Arc<dyn DbConnection>) -> Self {
        Self {
            inner,
            faults: Arc::default(),
        }
    }

    /// The next `count` calls of `claim_next_hint` fail.
    pub fn fail_next_claims(&self, count: u32) {
        self.faults.claim_failures.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn claim_failures_left(&self) -> u32 {
        self.faults.claim_failures.load(Ordering::SeqCst)
    }

    /// Every `update_subscribers_notified_at` fails from now on.
    pub fn fail_watermarks(&self) {
        self.faults.fail_watermarks.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl HintStore for FaultyConnection {
    async fn upsert_hint(
        &self,
        hint: NotificationHint,
        notify_freq: Duration,
    ) -> Result<NotificationHint, DbError> {
        self.inner.upsert_hint(hint, notify_freq).await
    }

    async fn peek_next_hint(
        &self,
        scope: Option<&WorkspaceId>,
    ) -> Result<Option<NotificationHint>, DbError> {
        self.inner.peek_next_hint(scope).await
    }

    async fn claim_next_hint(
        &self,
        scope: Option<&WorkspaceId>,
        now: DateTime<Utc>,
    ) -> Result<HintClaim, DbError> {
        let armed = self
            .faults
            .claim_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if armed {
            return Err(INJECTED_ERROR);
        }
        self.inner.claim_next_hint(scope, now).await
    }

    async fn requeue_hint(&self, hint: NotificationHint) -> Result<bool, DbError> {
        self.inner.requeue_hint(hint).await
    }
}

#[async_trait]
impl SubscriptionStore for FaultyConnection {
    async fn create_subscription(&self, subscription: Subscription) -> Result<(), DbError> {
        self.inner.create_subscription(subscription).await
    }

    async fn delete_subscription(
        &self,
        container: &Container,
        block_id: &BlockId,
        subscriber_id: &UserId,
    ) -> Result<(), DbError> {
        self.inner
            .delete_subscription(container, block_id, subscriber_id)
            .await
    }

    async fn subscribers_for_block(
        &self,
        container: &Container,
        block_id: &BlockId,
    ) -> Result<Vec<Subscriber>, DbError> {
        self.inner.subscribers_for_block(container, block_id).await
    }

    async fn update_subscribers_notified_at(
        &self,
        container: &Container,
        block_id: &BlockId,
        notified_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        if self.faults.fail_watermarks.load(Ordering::SeqCst) {
            return Err(INJECTED_ERROR);
        }
        self.inner
            .update_subscribers_notified_at(container, block_id, notified_at)
            .await
    }
}

#[async_trait]
impl BlockStore for FaultyConnection {
    async fn insert_block(&self, block: Block) -> Result<(), DbError> {
        self.inner.insert_block(block).await
    }

    async fn delete_block(
        &self,
        container: &Container,
        block_id: &BlockId,
        modified_by: &UserId,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.inner
            .delete_block(container, block_id, modified_by, deleted_at)
            .await
    }

    async fn get_block(&self, container: &Container, block_id: &BlockId) -> Result<Block, DbError> {
        self.inner.get_block(container, block_id).await
    }

    async fn get_board_and_card(
        &self,
        container: &Container,
        block_id: &BlockId,
    ) -> Result<(Block, Option<Block>), DbError> {
        self.inner.get_board_and_card(container, block_id).await
    }

    async fn get_block_history(
        &self,
        container: &Container,
        block_id: &BlockId,
        query: BlockHistoryQuery,
    ) -> Result<Vec<Block>, DbError> {
        self.inner
            .get_block_history(container, block_id, query)
            .await
    }

    async fn get_subtree_history(
        &self,
        container: &Container,
        parent_id: &BlockId,
        after: DateTime<Utc>,
    ) -> Result<Vec<Block>, DbError> {
        self.inner
            .get_subtree_history(container, parent_id, after)
            .await
    }
}

/// Pool handing out one shared [`FaultyConnection`].
#[derive(Clone)]
pub struct FaultyPool {
    inner: Arc<dyn DbPool>,
    connection: FaultyConnection,
}

impl FaultyPool {
    #[must_use]
    pub fn new(inner: Arc<dyn DbPool>) -> Self {
        let connection = FaultyConnection::new(inner.connection());
        Self { inner, connection }
    }

    #[must_use]
    pub fn faulty_connection(&self) -> &FaultyConnection {
        &self.connection
    }
}

#[async_trait]
impl DbPool for FaultyPool {
    fn connection(&self) -> Arc<dyn DbConnection> {
        Arc::new(self.connection.clone())
    }

    async fn close(&self) -> Result<(), DbError> {
        self.inner.close().await
    }
}
