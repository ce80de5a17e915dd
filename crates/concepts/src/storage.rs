use crate::{
    Block, BlockId, BlockType, Container, NotificationHint, Subscriber, Subscription, UserId,
    WorkspaceId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum DbConnectionError {
    #[error("database is closed")]
    Closed,
    #[error("database is busy")]
    Busy,
    #[error("connection error: {0}")]
    Other(String),
}

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum SpecificError {
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("not found")]
    NotFound,
    #[error("consistency error: `{0}`")]
    ConsistencyError(String),
    #[error("{0}")]
    GenericError(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum DbError {
    #[error(transparent)]
    Connection(#[from] DbConnectionError),
    #[error(transparent)]
    Specific(#[from] SpecificError),
}

impl DbError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::Specific(SpecificError::NotFound))
    }
}

/// Result of [`HintStore::claim_next_hint`]. Peeking and claiming happen in one
/// atomic step so that a concurrent producer cannot slip in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HintClaim {
    /// The earliest hint was ready and has been removed from the store.
    Claimed(NotificationHint),
    /// The earliest hint becomes ready at `notify_at`. Nothing was removed.
    NotReady { notify_at: DateTime<Utc> },
    /// No hints are pending.
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHistoryQuery {
    /// Only rows with `update_at` strictly after this time.
    pub after: Option<DateTime<Utc>>,
    /// Only rows with `update_at` at or before this time.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub descending: bool,
}

impl BlockHistoryQuery {
    /// Latest version of a block as it was at `at`.
    #[must_use]
    pub fn last_at_or_before(at: DateTime<Utc>) -> Self {
        Self {
            after: None,
            until: Some(at),
            limit: Some(1),
            descending: true,
        }
    }

    /// All versions after `since`, oldest first.
    #[must_use]
    pub fn after(since: DateTime<Utc>) -> Self {
        Self {
            after: Some(since),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn matches(&self, update_at: DateTime<Utc>) -> bool {
        self.after.is_none_or(|after| update_at > after)
            && self.until.is_none_or(|until| update_at <= until)
    }
}

/// Durable queue of pending notification hints, at most one per block.
#[async_trait]
pub trait HintStore: Send + Sync {
    /// Insert a hint with `notify_at = create_at + notify_freq`. If a hint for the block
    /// already exists, overwrite its modifier and push `notify_at` forward, never back.
    async fn upsert_hint(
        &self,
        hint: NotificationHint,
        notify_freq: Duration,
    ) -> Result<NotificationHint, DbError>;

    /// Earliest pending hint, without claiming it.
    async fn peek_next_hint(
        &self,
        scope: Option<&WorkspaceId>,
    ) -> Result<Option<NotificationHint>, DbError>;

    /// Atomically remove and return the earliest hint if it is ready at `now`.
    async fn claim_next_hint(
        &self,
        scope: Option<&WorkspaceId>,
        now: DateTime<Utc>,
    ) -> Result<HintClaim, DbError>;

    /// Put a claimed hint back unless a fresher hint for the same block exists.
    /// Returns `true` if the hint was inserted.
    async fn requeue_hint(&self, hint: NotificationHint) -> Result<bool, DbError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Re-subscribing keeps the existing watermark.
    async fn create_subscription(&self, subscription: Subscription) -> Result<(), DbError>;

    async fn delete_subscription(
        &self,
        container: &Container,
        block_id: &BlockId,
        subscriber_id: &UserId,
    ) -> Result<(), DbError>;

    /// Subscribers of the block ordered by `notified_at`, oldest first.
    async fn subscribers_for_block(
        &self,
        container: &Container,
        block_id: &BlockId,
    ) -> Result<Vec<Subscriber>, DbError>;

    /// Advance the watermark of every subscriber of the block. Watermarks never regress.
    async fn update_subscribers_notified_at(
        &self,
        container: &Container,
        block_id: &BlockId,
        notified_at: DateTime<Utc>,
    ) -> Result<(), DbError>;
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Store the current state of the block and append it to the history.
    async fn insert_block(&self, block: Block) -> Result<(), DbError>;

    async fn delete_block(
        &self,
        container: &Container,
        block_id: &BlockId,
        modified_by: &UserId,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), DbError>;

    /// Current, not deleted block.
    async fn get_block(&self, container: &Container, block_id: &BlockId)
    -> Result<Block, DbError>;

    /// Resolve the board and the card that `block_id` belongs to.
    /// A board resolves to `(board, None)`, a card or any of its children to
    /// `(board, Some(card))`.
    async fn get_board_and_card(
        &self,
        container: &Container,
        block_id: &BlockId,
    ) -> Result<(Block, Option<Block>), DbError>;

    async fn get_block_history(
        &self,
        container: &Container,
        block_id: &BlockId,
        query: BlockHistoryQuery,
    ) -> Result<Vec<Block>, DbError>;

    /// History rows of the direct children of `parent_id` written after `after`,
    /// oldest first.
    async fn get_subtree_history(
        &self,
        container: &Container,
        parent_id: &BlockId,
        after: DateTime<Utc>,
    ) -> Result<Vec<Block>, DbError>;
}

pub trait DbConnection: HintStore + SubscriptionStore + BlockStore + Debug {}

impl<T> DbConnection for T where T: HintStore + SubscriptionStore + BlockStore + Debug {}

#[async_trait]
pub trait DbPool: Send + Sync {
    fn connection(&self) -> Arc<dyn DbConnection>;

    async fn close(&self) -> Result<(), DbError>;
}

/// Walks up the parent chain of `block_id` until a card or the board is found.
/// Shared by the store implementations of [`BlockStore::get_board_and_card`].
pub async fn resolve_board_and_card(
    store: &(impl BlockStore + ?Sized),
    container: &Container,
    block_id: &BlockId,
) -> Result<(Block, Option<Block>), DbError> {
    const MAX_DEPTH: usize = 16;
    let mut block = store.get_block(container, block_id).await?;
    for _ in 0..MAX_DEPTH {
        match block.block_type {
            BlockType::Board => return Ok((block, None)),
            BlockType::Card => {
                let board = store.get_block(container, &block.root_id).await?;
                if board.block_type != BlockType::Board {
                    return Err(DbError::Specific(SpecificError::ConsistencyError(format!(
                        "root `{}` of card `{}` is not a board",
                        board.id, block.id
                    ))));
                }
                return Ok((board, Some(block)));
            }
            _ => {
                let Some(parent_id) = &block.parent_id else {
                    return Err(DbError::Specific(SpecificError::ConsistencyError(format!(
                        "block `{}` has no parent",
                        block.id
                    ))));
                };
                block = store.get_block(container, parent_id).await?;
            }
        }
    }
    Err(DbError::Specific(SpecificError::ConsistencyError(format!(
        "block `{block_id}` is nested deeper than {MAX_DEPTH} levels"
    ))))
}
