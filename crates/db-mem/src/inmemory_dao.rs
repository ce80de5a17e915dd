//! In-memory store holding hints, subscriptions and the block history.
//! Every operation takes the single lock, which makes hint claiming atomic.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concepts::storage::{
    BlockHistoryQuery, BlockStore, DbConnection, DbConnectionError, DbError, DbPool, HintClaim,
    HintStore, SpecificError, SubscriptionStore, resolve_board_and_card,
};
use concepts::{
    Block, BlockId, Container, NotificationHint, Subscriber, Subscription, UserId, WorkspaceId,
};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, instrument, trace};

#[derive(Default, Debug)]
struct DbHolder {
    hints: HashMap<BlockId, NotificationHint>,
    subscriptions: Vec<Subscription>,
    blocks: HashMap<BlockId, Block>,
    // Append only.
    history: Vec<Block>,
}

impl DbHolder {
    fn next_hint(&self, scope: Option<&WorkspaceId>) -> Option<&NotificationHint> {
        self.hints
            .values()
            .filter(|hint| scope.is_none_or(|scope| hint.workspace_id == *scope))
            .min_by(|a, b| {
                a.notify_at
                    .cmp(&b.notify_at)
                    .then_with(|| a.block_id.cmp(&b.block_id))
            })
    }

    fn upsert_hint(&mut self, hint: NotificationHint, notify_freq: Duration) -> NotificationHint {
        let notify_at = hint.create_at + notify_freq;
        let stored = self
            .hints
            .entry(hint.block_id.clone())
            .and_modify(|existing| {
                existing.block_type = hint.block_type;
                existing.modified_by_id = hint.modified_by_id.clone();
                existing.modified_by_name.clone_from(&hint.modified_by_name);
                existing.notify_at = existing.notify_at.max(notify_at);
                existing.attempts = 0;
            })
            .or_insert_with(|| NotificationHint {
                notify_at,
                attempts: 0,
                ..hint
            });
        stored.clone()
    }

    fn claim_next_hint(&mut self, scope: Option<&WorkspaceId>, now: DateTime<Utc>) -> HintClaim {
        let Some(next) = self.next_hint(scope) else {
            return HintClaim::Empty;
        };
        if next.notify_at > now {
            return HintClaim::NotReady {
                notify_at: next.notify_at,
            };
        }
        let block_id = next.block_id.clone();
        let hint = self
            .hints
            .remove(&block_id)
            .expect("hint was found under the same lock");
        HintClaim::Claimed(hint)
    }

    fn subscriptions_of<'a>(
        &'a mut self,
        container: &'a Container,
        block_id: &'a BlockId,
    ) -> impl Iterator<Item = &'a mut Subscription> {
        self.subscriptions.iter_mut().filter(move |sub| {
            sub.workspace_id == container.workspace_id && sub.block_id == *block_id
        })
    }

    fn get_block(&self, container: &Container, block_id: &BlockId) -> Result<Block, DbError> {
        self.blocks
            .get(block_id)
            .filter(|block| block.workspace_id == container.workspace_id && !block.is_deleted())
            .cloned()
            .ok_or(DbError::Specific(SpecificError::NotFound))
    }

    fn write_block(&mut self, block: Block) {
        self.history.push(block.clone());
        self.blocks.insert(block.id.clone(), block);
    }
}

#[derive(Clone, Debug)]
pub struct InMemoryDbConnection {
    holder: Arc<Mutex<DbHolder>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryDbConnection {
    fn lock(&self) -> Result<MutexGuard<'_, DbHolder>, DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Connection(DbConnectionError::Closed));
        }
        Ok(self.holder.lock().unwrap())
    }
}

#[async_trait]
impl HintStore for InMemoryDbConnection {
    #[instrument(level = "trace", skip_all, fields(block_id = %hint.block_id))]
    async fn upsert_hint(
        &self,
        hint: NotificationHint,
        notify_freq: Duration,
    ) -> Result<NotificationHint, DbError> {
        let stored = self.lock()?.upsert_hint(hint, notify_freq);
        trace!(notify_at = %stored.notify_at, "Upserted hint");
        Ok(stored)
    }

    async fn peek_next_hint(
        &self,
        scope: Option<&WorkspaceId>,
    ) -> Result<Option<NotificationHint>, DbError> {
        Ok(self.lock()?.next_hint(scope).cloned())
    }

    #[instrument(level = "trace", skip(self))]
    async fn claim_next_hint(
        &self,
        scope: Option<&WorkspaceId>,
        now: DateTime<Utc>,
    ) -> Result<HintClaim, DbError> {
        Ok(self.lock()?.claim_next_hint(scope, now))
    }

    async fn requeue_hint(&self, hint: NotificationHint) -> Result<bool, DbError> {
        let mut holder = self.lock()?;
        if holder.hints.contains_key(&hint.block_id) {
            debug!(block_id = %hint.block_id, "Not requeueing, a fresher hint exists");
            return Ok(false);
        }
        holder.hints.insert(hint.block_id.clone(), hint);
        Ok(true)
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryDbConnection {
    async fn create_subscription(&self, subscription: Subscription) -> Result<(), DbError> {
        let mut holder = self.lock()?;
        let container = subscription.container();
        if let Some(existing) = holder
            .subscriptions_of(&container, &subscription.block_id)
            .find(|sub| sub.subscriber_id == subscription.subscriber_id)
        {
            existing.subscriber_type = subscription.subscriber_type;
            existing.block_type = subscription.block_type;
        } else {
            holder.subscriptions.push(subscription);
        }
        Ok(())
    }

    async fn delete_subscription(
        &self,
        container: &Container,
        block_id: &BlockId,
        subscriber_id: &UserId,
    ) -> Result<(), DbError> {
        let mut holder = self.lock()?;
        let before = holder.subscriptions.len();
        holder.subscriptions.retain(|sub| {
            !(sub.workspace_id == container.workspace_id
                && sub.block_id == *block_id
                && sub.subscriber_id == *subscriber_id)
        });
        if holder.subscriptions.len() == before {
            return Err(DbError::Specific(SpecificError::NotFound));
        }
        Ok(())
    }

    async fn subscribers_for_block(
        &self,
        container: &Container,
        block_id: &BlockId,
    ) -> Result<Vec<Subscriber>, DbError> {
        let mut holder = self.lock()?;
        let mut subscribers: Vec<_> = holder
            .subscriptions_of(container, block_id)
            .map(|sub| sub.subscriber())
            .collect();
        subscribers.sort_by(|a, b| {
            a.notified_at
                .cmp(&b.notified_at)
                .then_with(|| a.subscriber_id.cmp(&b.subscriber_id))
        });
        Ok(subscribers)
    }

    async fn update_subscribers_notified_at(
        &self,
        container: &Container,
        block_id: &BlockId,
        notified_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut holder = self.lock()?;
        for sub in holder.subscriptions_of(container, block_id) {
            sub.notified_at = sub.notified_at.max(notified_at);
        }
        Ok(())
    }
}

#[async_trait]
impl BlockStore for InMemoryDbConnection {
    async fn insert_block(&self, block: Block) -> Result<(), DbError> {
        if block.workspace_id.is_empty() {
            return Err(DbError::Specific(SpecificError::ValidationFailed(
                "workspace id must not be empty".to_string(),
            )));
        }
        self.lock()?.write_block(block);
        Ok(())
    }

    async fn delete_block(
        &self,
        container: &Container,
        block_id: &BlockId,
        modified_by: &UserId,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut holder = self.lock()?;
        let mut block = holder.get_block(container, block_id)?;
        block.modified_by = modified_by.clone();
        block.update_at = deleted_at;
        block.delete_at = Some(deleted_at);
        holder.write_block(block);
        Ok(())
    }

    async fn get_block(
        &self,
        container: &Container,
        block_id: &BlockId,
    ) -> Result<Block, DbError> {
        self.lock()?.get_block(container, block_id)
    }

    async fn get_board_and_card(
        &self,
        container: &Container,
        block_id: &BlockId,
    ) -> Result<(Block, Option<Block>), DbError> {
        resolve_board_and_card(self, container, block_id).await
    }

    async fn get_block_history(
        &self,
        container: &Container,
        block_id: &BlockId,
        query: BlockHistoryQuery,
    ) -> Result<Vec<Block>, DbError> {
        let holder = self.lock()?;
        let mut rows: Vec<_> = holder
            .history
            .iter()
            .filter(|row| {
                row.id == *block_id
                    && row.workspace_id == container.workspace_id
                    && query.matches(row.update_at)
            })
            .cloned()
            .collect();
        // Stable, rows written at the same millisecond keep their write order.
        rows.sort_by_key(|row| row.update_at);
        if query.descending {
            rows.reverse();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn get_subtree_history(
        &self,
        container: &Container,
        parent_id: &BlockId,
        after: DateTime<Utc>,
    ) -> Result<Vec<Block>, DbError> {
        let holder = self.lock()?;
        let mut rows: Vec<_> = holder
            .history
            .iter()
            .filter(|row| {
                row.parent_id.as_ref() == Some(parent_id)
                    && row.workspace_id == container.workspace_id
                    && row.update_at > after
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.update_at);
        Ok(rows)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryPool {
    holder: Arc<Mutex<DbHolder>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connection_typed(&self) -> InMemoryDbConnection {
        InMemoryDbConnection {
            holder: self.holder.clone(),
            closed: self.closed.clone(),
        }
    }
}

#[async_trait]
impl DbPool for InMemoryPool {
    fn connection(&self) -> Arc<dyn DbConnection> {
        Arc::new(self.connection_typed())
    }

    async fn close(&self) -> Result<(), DbError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
