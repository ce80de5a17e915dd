//! Builders for boards, cards and their children shared by the storage and
//! notifier tests.
use chrono::{DateTime, Utc};
use concepts::{
    Block, BlockId, BlockType, Container, NotificationHint, SubscriberType, Subscription, UserId,
    WorkspaceId,
};
use serde_json::json;

pub const WORKSPACE: &str = "w1";
pub const STATUS_PROPERTY: &str = "p-status";
pub const TODO_OPTION: &str = "o-todo";
pub const DONE_OPTION: &str = "o-done";
pub const ESTIMATE_PROPERTY: &str = "p-estimate";

#[must_use]
pub fn container() -> Container {
    Container::new(WorkspaceId::new(WORKSPACE))
}

fn block(
    id: &str,
    parent_id: Option<&str>,
    root_id: &str,
    block_type: BlockType,
    title: &str,
    modified_by: &str,
    at: DateTime<Utc>,
) -> Block {
    Block {
        id: BlockId::new(id),
        parent_id: parent_id.map(BlockId::new),
        root_id: BlockId::new(root_id),
        workspace_id: WorkspaceId::new(WORKSPACE),
        block_type,
        title: title.to_string(),
        fields: serde_json::Map::new(),
        created_by: UserId::new(modified_by),
        modified_by: UserId::new(modified_by),
        create_at: at,
        update_at: at,
        delete_at: None,
    }
}

/// Board with a `Status` select property and an `Estimate` number property.
#[must_use]
pub fn board(id: &str, title: &str, modified_by: &str, at: DateTime<Utc>) -> Block {
    let mut board = block(id, None, id, BlockType::Board, title, modified_by, at);
    board.fields.insert(
        "cardProperties".to_string(),
        json!([
            {
                "id": STATUS_PROPERTY,
                "name": "Status",
                "type": "select",
                "options": [
                    {"id": TODO_OPTION, "value": "To Do"},
                    {"id": DONE_OPTION, "value": "Done"},
                ],
            },
            {
                "id": ESTIMATE_PROPERTY,
                "name": "Estimate",
                "type": "number",
                "options": [],
            },
        ]),
    );
    board
}

#[must_use]
pub fn card(id: &str, board_id: &str, title: &str, modified_by: &str, at: DateTime<Utc>) -> Block {
    block(
        id,
        Some(board_id),
        board_id,
        BlockType::Card,
        title,
        modified_by,
        at,
    )
}

/// Content block such as a comment or a text placed on a card.
#[must_use]
pub fn child(
    id: &str,
    card: &Block,
    block_type: BlockType,
    title: &str,
    modified_by: &str,
    at: DateTime<Utc>,
) -> Block {
    block(
        id,
        Some(&*card.id),
        &card.root_id,
        block_type,
        title,
        modified_by,
        at,
    )
}

/// The next version of `block` edited by `modified_by` at `at`.
#[must_use]
pub fn edited(block: &Block, modified_by: &str, at: DateTime<Utc>) -> Block {
    Block {
        modified_by: UserId::new(modified_by),
        update_at: at,
        ..block.clone()
    }
}

#[must_use]
pub fn with_property(mut card: Block, property_id: &str, value: &str) -> Block {
    let properties = card
        .fields
        .entry("properties")
        .or_insert_with(|| json!({}));
    if let Some(properties) = properties.as_object_mut() {
        properties.insert(property_id.to_string(), json!(value));
    }
    card
}

#[must_use]
pub fn hint(
    block_id: &str,
    block_type: BlockType,
    modified_by: &str,
    at: DateTime<Utc>,
) -> NotificationHint {
    NotificationHint {
        block_type,
        block_id: BlockId::new(block_id),
        workspace_id: WorkspaceId::new(WORKSPACE),
        modified_by_id: UserId::new(modified_by),
        modified_by_name: modified_by.to_string(),
        create_at: at,
        notify_at: at,
        attempts: 0,
    }
}

#[must_use]
pub fn subscription(
    block_id: &str,
    block_type: BlockType,
    subscriber_id: &str,
    notified_at: DateTime<Utc>,
) -> Subscription {
    Subscription {
        block_type,
        block_id: BlockId::new(block_id),
        workspace_id: WorkspaceId::new(WORKSPACE),
        subscriber_type: SubscriberType::User,
        subscriber_id: UserId::new(subscriber_id),
        notified_at,
        create_at: notified_at,
    }
}
