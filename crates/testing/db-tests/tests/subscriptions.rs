use concepts::storage::SpecificError;
use concepts::storage::DbError;
use concepts::time::ClockFn;
use concepts::{BlockId, BlockType, UserId};
use db_tests::Database;
use db_tests::fixtures::{container, subscription};
use rstest::rstest;
use std::time::Duration;
use test_utils::set_up;
use test_utils::sim_clock::SimClock;

#[rstest]
#[tokio::test]
async fn subscribers_are_ordered_by_watermark(
    #[values(Database::Memory, Database::Sqlite)] database: Database,
) {
    set_up();
    let sim_clock = SimClock::default();
    let (_guard, db_pool) = database.set_up().await;
    let db_connection = db_pool.connection();
    let t0 = sim_clock.now();

    for (subscriber, offset) in [("a", 100), ("b", 200), ("e", 150)] {
        db_connection
            .create_subscription(subscription(
                "c1",
                BlockType::Card,
                subscriber,
                t0 + Duration::from_secs(offset),
            ))
            .await
            .unwrap();
    }
    // Another block's subscription must not show up.
    db_connection
        .create_subscription(subscription("c2", BlockType::Card, "z", t0))
        .await
        .unwrap();

    let subscribers = db_connection
        .subscribers_for_block(&container(), &BlockId::new("c1"))
        .await
        .unwrap();
    let ids: Vec<_> = subscribers
        .iter()
        .map(|sub| sub.subscriber_id.to_string())
        .collect();
    assert_eq!(vec!["a", "e", "b"], ids);
    assert_eq!(t0 + Duration::from_secs(100), subscribers[0].notified_at);
    drop(db_connection);
    db_pool.close().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn watermarks_only_move_forward(
    #[values(Database::Memory, Database::Sqlite)] database: Database,
) {
    set_up();
    let sim_clock = SimClock::default();
    let (_guard, db_pool) = database.set_up().await;
    let db_connection = db_pool.connection();
    let t0 = sim_clock.now();
    let card_id = BlockId::new("c1");

    db_connection
        .create_subscription(subscription("c1", BlockType::Card, "a", t0))
        .await
        .unwrap();
    db_connection
        .create_subscription(subscription(
            "c1",
            BlockType::Card,
            "b",
            t0 + Duration::from_secs(500),
        ))
        .await
        .unwrap();

    let notified_at = t0 + Duration::from_secs(300);
    db_connection
        .update_subscribers_notified_at(&container(), &card_id, notified_at)
        .await
        .unwrap();
    let subscribers = db_connection
        .subscribers_for_block(&container(), &card_id)
        .await
        .unwrap();
    assert_eq!(notified_at, subscribers[0].notified_at);
    assert_eq!(t0 + Duration::from_secs(500), subscribers[1].notified_at);
    drop(db_connection);
    db_pool.close().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn resubscribing_keeps_the_watermark(
    #[values(Database::Memory, Database::Sqlite)] database: Database,
) {
    set_up();
    let sim_clock = SimClock::default();
    let (_guard, db_pool) = database.set_up().await;
    let db_connection = db_pool.connection();
    let t0 = sim_clock.now();
    let card_id = BlockId::new("c1");

    db_connection
        .create_subscription(subscription(
            "c1",
            BlockType::Card,
            "a",
            t0 + Duration::from_secs(10),
        ))
        .await
        .unwrap();
    db_connection
        .create_subscription(subscription("c1", BlockType::Card, "a", t0))
        .await
        .unwrap();
    let subscribers = db_connection
        .subscribers_for_block(&container(), &card_id)
        .await
        .unwrap();
    assert_eq!(1, subscribers.len());
    assert_eq!(t0 + Duration::from_secs(10), subscribers[0].notified_at);
    drop(db_connection);
    db_pool.close().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn delete_subscription(#[values(Database::Memory, Database::Sqlite)] database: Database) {
    set_up();
    let sim_clock = SimClock::default();
    let (_guard, db_pool) = database.set_up().await;
    let db_connection = db_pool.connection();
    let card_id = BlockId::new("c1");
    let subscriber = UserId::new("a");

    db_connection
        .create_subscription(subscription("c1", BlockType::Card, "a", sim_clock.now()))
        .await
        .unwrap();
    db_connection
        .delete_subscription(&container(), &card_id, &subscriber)
        .await
        .unwrap();
    assert!(
        db_connection
            .subscribers_for_block(&container(), &card_id)
            .await
            .unwrap()
            .is_empty()
    );
    let err = db_connection
        .delete_subscription(&container(), &card_id, &subscriber)
        .await
        .unwrap_err();
    assert_eq!(DbError::Specific(SpecificError::NotFound), err);
    drop(db_connection);
    db_pool.close().await.unwrap();
}
