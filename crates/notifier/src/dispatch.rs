//! A single notification pass: diff the root of a claimed hint, deliver the digest
//! to every subscriber except the editor and advance the watermarks.
use crate::delivery::{Delivery, DeliveryError};
use crate::diff::{self, DiffGenerator, DiffResolutionError};
use crate::render::Renderer;
use chrono::{DateTime, Utc};
use concepts::storage::{DbConnection, DbError, SubscriptionStore};
use concepts::{BlockId, NotificationHint, SubscriberType, UserId};
use tracing::{Level, debug, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub diff_count: usize,
    pub delivered: usize,
    pub failed: usize,
    pub skipped_editor: usize,
    /// Watermark every subscriber was advanced to. `None` when nothing changed.
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub subscriber_id: UserId,
    pub subscriber_type: SubscriberType,
    pub error: DeliveryError,
}

/// Everything that went wrong in a pass that otherwise ran to completion.
#[derive(Debug, thiserror::Error)]
#[error("{}", summary(.outcome, .delivery_failures, Option::as_ref(.watermark_error)))]
pub struct CompositeError {
    pub outcome: PassOutcome,
    pub delivery_failures: Vec<DeliveryFailure>,
    #[source]
    pub watermark_error: Option<DbError>,
}

fn summary(
    outcome: &PassOutcome,
    delivery_failures: &[DeliveryFailure],
    watermark_error: Option<&DbError>,
) -> String {
    let mut summary = format!(
        "{} of {} deliveries failed",
        delivery_failures.len(),
        outcome.delivered + outcome.failed
    );
    for failure in delivery_failures {
        summary.push_str(&format!(
            "; {} `{}`: {}",
            failure.subscriber_type, failure.subscriber_id, failure.error
        ));
    }
    if let Some(err) = watermark_error {
        summary.push_str(&format!("; watermark update failed: {err}"));
    }
    summary
}

#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("cannot fetch subscribers of block `{block_id}` - {source}")]
    Subscribers { block_id: BlockId, source: DbError },
    #[error(transparent)]
    DiffResolution(#[from] DiffResolutionError),
    #[error(transparent)]
    Partial(Box<CompositeError>),
}

#[instrument(level = Level::DEBUG, name = "notify_subscribers", skip_all, fields(block_id = %hint.block_id, workspace_id = %hint.workspace_id))]
pub async fn run_pass(
    db_connection: &dyn DbConnection,
    delivery: &dyn Delivery,
    renderer: &Renderer,
    hint: &NotificationHint,
) -> Result<PassOutcome, PassError> {
    let container = hint.container();
    let subscribers = db_connection
        .subscribers_for_block(&container, &hint.block_id)
        .await
        .map_err(|source| PassError::Subscribers {
            block_id: hint.block_id.clone(),
            source,
        })?;
    let Some(since) = diff::since(&subscribers) else {
        debug!("No subscribers");
        return Ok(PassOutcome::default());
    };
    let root = DiffGenerator::new(db_connection, &container, since)
        .generate(&hint.block_id)
        .await?;
    let Some(notification) = renderer.render(&root.board, root.card.as_ref(), &root.diffs) else {
        debug!(%since, "Nothing changed");
        return Ok(PassOutcome::default());
    };
    let watermark = root.diffs.iter().map(|diff| diff.update_at).max();

    let mut outcome = PassOutcome {
        diff_count: root.diffs.len(),
        ..Default::default()
    };
    let mut delivery_failures = Vec::new();
    for subscriber in &subscribers {
        if subscriber.is_author(&hint.modified_by_id) {
            debug!(subscriber_id = %subscriber.subscriber_id, "Skipping the editor");
            outcome.skipped_editor += 1;
            continue;
        }
        match delivery.deliver(&container, subscriber, &notification).await {
            Ok(()) => outcome.delivered += 1,
            Err(error) => {
                warn!(subscriber_id = %subscriber.subscriber_id, "Delivery failed - {error}");
                outcome.failed += 1;
                delivery_failures.push(DeliveryFailure {
                    subscriber_id: subscriber.subscriber_id.clone(),
                    subscriber_type: subscriber.subscriber_type,
                    error,
                });
            }
        }
    }

    // Every subscriber is advanced, including the editor and failed deliveries.
    let mut watermark_error = None;
    if let Some(watermark) = watermark {
        match db_connection
            .update_subscribers_notified_at(&container, &hint.block_id, watermark)
            .await
        {
            Ok(()) => outcome.watermark = Some(watermark),
            Err(err) => watermark_error = Some(err),
        }
    }
    info!(
        diff_count = outcome.diff_count,
        delivered = outcome.delivered,
        failed = outcome.failed,
        "Notified subscribers"
    );
    if delivery_failures.is_empty() && watermark_error.is_none() {
        Ok(outcome)
    } else {
        Err(PassError::Partial(Box::new(CompositeError {
            outcome,
            delivery_failures,
            watermark_error,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::recording::RecordingDelivery;
    use crate::render::DEFAULT_LANGUAGE;
    use assert_matches::assert_matches;
    use concepts::storage::{BlockStore, DbPool};
    use concepts::{BlockType, Subscriber};
    use db_mem::InMemoryPool;
    use db_tests::faulty::{FaultyConnection, INJECTED_ERROR};
    use db_tests::fixtures::{board, card, container, edited, hint, subscription};
    use db_tests::{Database, DbGuard};
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;

    fn at(secs: u64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn renderer() -> Renderer {
        Renderer::new("http://localhost", DEFAULT_LANGUAGE)
    }

    /// Card `c1` created at 10, subscribers A=100, B=200, E=150.
    async fn scenario(database: Database) -> (DbGuard, Arc<dyn DbPool>, Arc<dyn DbConnection>) {
        let (guard, db_pool) = database.set_up().await;
        let db_connection = db_pool.connection();
        db_connection
            .insert_block(board("b1", "Board", "alice", at(10)))
            .await
            .unwrap();
        db_connection
            .insert_block(card("c1", "b1", "Card", "alice", at(10)))
            .await
            .unwrap();
        for (subscriber, notified_at) in [("a", 100), ("b", 200), ("e", 150)] {
            db_connection
                .create_subscription(subscription("c1", BlockType::Card, subscriber, at(notified_at)))
                .await
                .unwrap();
        }
        (guard, db_pool, db_connection)
    }

    async fn edit_card(db_connection: &dyn DbConnection, by: &str, secs: u64) {
        let current = db_connection
            .get_block(&container(), &BlockId::new("c1"))
            .await
            .unwrap();
        let mut next = edited(&current, by, at(secs));
        next.title = format!("{} edited at {secs}", current.title);
        db_connection.insert_block(next).await.unwrap();
    }

    async fn watermarks(db_connection: &dyn DbConnection) -> Vec<(String, DateTime<Utc>)> {
        let mut subscribers: Vec<_> = db_connection
            .subscribers_for_block(&container(), &BlockId::new("c1"))
            .await
            .unwrap()
            .into_iter()
            .map(|Subscriber { subscriber_id, notified_at, .. }| {
                (subscriber_id.to_string(), notified_at)
            })
            .collect();
        subscribers.sort();
        subscribers
    }

    #[rstest]
    #[tokio::test]
    async fn editor_is_skipped_and_every_watermark_advances(
        #[values(Database::Memory, Database::Sqlite)] database: Database,
    ) {
        let (_guard, db_pool, db_connection) = scenario(database).await;
        edit_card(db_connection.as_ref(), "e", 300).await;
        let delivery = RecordingDelivery::default();

        let outcome = run_pass(
            db_connection.as_ref(),
            &delivery,
            &renderer(),
            &hint("c1", BlockType::Card, "e", at(300)),
        )
        .await
        .unwrap();

        assert_eq!(
            PassOutcome {
                diff_count: 1,
                delivered: 2,
                failed: 0,
                skipped_editor: 1,
                watermark: Some(at(300)),
            },
            outcome
        );
        let mut recipients = delivery.recipients();
        recipients.sort();
        assert_eq!(vec![UserId::new("a"), UserId::new("b")], recipients);
        assert_eq!(
            vec![
                ("a".to_string(), at(300)),
                ("b".to_string(), at(300)),
                ("e".to_string(), at(300)),
            ],
            watermarks(db_connection.as_ref()).await
        );
        db_pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn no_changes_means_no_deliveries_and_no_watermark_changes() {
        let (_guard, db_pool, db_connection) = scenario(Database::Memory).await;
        let delivery = RecordingDelivery::default();
        let before = watermarks(db_connection.as_ref()).await;

        let outcome = run_pass(
            db_connection.as_ref(),
            &delivery,
            &renderer(),
            &hint("c1", BlockType::Card, "e", at(300)),
        )
        .await
        .unwrap();

        assert_eq!(PassOutcome::default(), outcome);
        assert!(delivery.delivered().is_empty());
        assert_eq!(before, watermarks(db_connection.as_ref()).await);
        db_pool.close().await.unwrap();
    }

    #[rstest]
    #[tokio::test]
    async fn failed_delivery_does_not_stop_the_pass(
        #[values(Database::Memory, Database::Sqlite)] database: Database,
    ) {
        let (_guard, db_pool, db_connection) = scenario(database).await;
        edit_card(db_connection.as_ref(), "e", 300).await;
        let delivery = RecordingDelivery::default();
        delivery.fail_for(UserId::new("a"));

        let err = run_pass(
            db_connection.as_ref(),
            &delivery,
            &renderer(),
            &hint("c1", BlockType::Card, "e", at(300)),
        )
        .await
        .unwrap_err();

        let composite = assert_matches!(err, PassError::Partial(composite) => composite);
        assert_eq!(1, composite.outcome.delivered);
        assert_eq!(1, composite.outcome.failed);
        assert_eq!(Some(at(300)), composite.outcome.watermark);
        assert_matches!(
            composite.delivery_failures.as_slice(),
            [DeliveryFailure { subscriber_id, error: DeliveryError::Rejected(_), .. }]
                if *subscriber_id == UserId::new("a")
        );
        assert!(composite.watermark_error.is_none());
        assert_eq!(vec![UserId::new("b")], delivery.recipients());
        assert!(
            watermarks(db_connection.as_ref())
                .await
                .iter()
                .all(|(_, notified_at)| *notified_at == at(300))
        );
        db_pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn watermark_failure_is_reported_together_with_delivery_failures() {
        let (_guard, db_pool, db_connection) = scenario(Database::Memory).await;
        edit_card(db_connection.as_ref(), "e", 300).await;
        let before = watermarks(db_connection.as_ref()).await;
        let faulty = FaultyConnection::new(db_connection.clone());
        faulty.fail_watermarks();
        let delivery = RecordingDelivery::default();
        delivery.fail_for(UserId::new("a"));

        let err = run_pass(
            &faulty,
            &delivery,
            &renderer(),
            &hint("c1", BlockType::Card, "e", at(300)),
        )
        .await
        .unwrap_err();

        let composite = assert_matches!(err, PassError::Partial(composite) => composite);
        assert_eq!(Some(INJECTED_ERROR), composite.watermark_error);
        assert_eq!(1, composite.delivery_failures.len());
        assert_eq!(1, composite.outcome.delivered);
        assert_eq!(1, composite.outcome.failed);
        assert_eq!(1, composite.outcome.skipped_editor);
        assert_eq!(None, composite.outcome.watermark);
        assert_eq!(vec![UserId::new("b")], delivery.recipients());
        assert_eq!(before, watermarks(db_connection.as_ref()).await);
        db_pool.close().await.unwrap();
    }

    #[rstest]
    #[tokio::test]
    async fn subscribers_already_caught_up_still_get_the_digest_of_the_oldest(
        #[values(Database::Memory, Database::Sqlite)] database: Database,
    ) {
        let (_guard, db_pool, db_connection) = scenario(database).await;
        edit_card(db_connection.as_ref(), "alice", 120).await;
        let delivery = RecordingDelivery::default();

        let outcome = run_pass(
            db_connection.as_ref(),
            &delivery,
            &renderer(),
            &hint("c1", BlockType::Card, "alice", at(120)),
        )
        .await
        .unwrap();

        assert_eq!(3, outcome.delivered);
        // Watermarks never move back.
        assert_eq!(
            vec![
                ("a".to_string(), at(120)),
                ("b".to_string(), at(200)),
                ("e".to_string(), at(150)),
            ],
            watermarks(db_connection.as_ref()).await
        );
        db_pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn no_subscribers_is_a_no_op() {
        let pool = InMemoryPool::new();
        let db_connection = pool.connection();
        let delivery = RecordingDelivery::default();
        let outcome = run_pass(
            db_connection.as_ref(),
            &delivery,
            &renderer(),
            &hint("missing", BlockType::Card, "e", at(300)),
        )
        .await
        .unwrap();
        assert_eq!(PassOutcome::default(), outcome);
    }

    #[tokio::test]
    async fn unresolvable_root_is_reported() {
        let pool = InMemoryPool::new();
        let db_connection = pool.connection();
        db_connection
            .create_subscription(subscription("gone", BlockType::Card, "a", at(0)))
            .await
            .unwrap();
        let err = run_pass(
            db_connection.as_ref(),
            &RecordingDelivery::default(),
            &renderer(),
            &hint("gone", BlockType::Card, "e", at(300)),
        )
        .await
        .unwrap_err();
        assert_matches!(err, PassError::DiffResolution(err) if err.is_not_found());
    }

    #[test]
    fn composite_error_lists_every_failure() {
        let err = CompositeError {
            outcome: PassOutcome {
                delivered: 1,
                failed: 1,
                ..Default::default()
            },
            delivery_failures: vec![DeliveryFailure {
                subscriber_id: UserId::new("a"),
                subscriber_type: SubscriberType::User,
                error: DeliveryError::Timeout,
            }],
            watermark_error: Some(DbError::Connection(
                concepts::storage::DbConnectionError::Closed,
            )),
        };
        assert_eq!(
            "1 of 2 deliveries failed; user `a`: delivery timed out; watermark update failed: database is closed",
            err.to_string()
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
