use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Borrow,
    fmt::{Debug, Display},
    hash::Hash,
    marker::PhantomData,
    ops::Deref,
    sync::Arc,
};

#[cfg(feature = "rusqlite")]
mod rusqlite_ext;
pub mod storage;
pub mod time;

/// String identifier tagged with a marker type so that block, workspace and user
/// identifiers cannot be mixed up.
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Id<T> {
    value: Arc<str>,
    #[serde(skip)]
    phantom_data: PhantomData<fn(T) -> T>,
}

impl<T> Id<T> {
    #[must_use]
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self {
            value: value.into(),
            phantom_data: PhantomData,
        }
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            phantom_data: PhantomData,
        }
    }
}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl<T> Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T> Display for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T> Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

impl<T> Deref for Id<T> {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> Borrow<str> for Id<T> {
    fn borrow(&self) -> &str {
        self.deref()
    }
}

impl<T> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

pub mod id_marker {
    pub struct Block;
    pub struct Workspace;
    pub struct User;
}

pub type BlockId = Id<id_marker::Block>;
pub type WorkspaceId = Id<id_marker::Workspace>;
/// Identifies a user or a channel. Subscribers and editors share one namespace.
pub type UserId = Id<id_marker::User>;

/// Tenant scope of every storage call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[display("{workspace_id}")]
pub struct Container {
    pub workspace_id: WorkspaceId,
}

impl Container {
    #[must_use]
    pub fn new(workspace_id: WorkspaceId) -> Self {
        Self { workspace_id }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum BlockType {
    Board,
    Card,
    View,
    Text,
    Comment,
    Checkbox,
    Divider,
    Image,
}

impl BlockType {
    /// Blocks that act as content roots for subscriptions.
    #[must_use]
    pub fn is_root(self) -> bool {
        matches!(self, BlockType::Board | BlockType::Card)
    }
}

/// The basic unit of board content. Every write of a block is also recorded in the
/// block history, which is what the diff generator reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: BlockId,
    /// Empty for boards.
    pub parent_id: Option<BlockId>,
    /// The board containing this block. Boards point to themselves.
    pub root_id: BlockId,
    pub workspace_id: WorkspaceId,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub title: String,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub created_by: UserId,
    pub modified_by: UserId,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
    #[serde(default)]
    pub delete_at: Option<DateTime<Utc>>,
}

impl Block {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.delete_at.is_some()
    }

    #[must_use]
    pub fn container(&self) -> Container {
        Container::new(self.workspace_id.clone())
    }
}

/// Marker saying that something changed under a block and has not been digested yet.
/// At most one hint exists per block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationHint {
    pub block_type: BlockType,
    pub block_id: BlockId,
    pub workspace_id: WorkspaceId,
    pub modified_by_id: UserId,
    pub modified_by_name: String,
    pub create_at: DateTime<Utc>,
    pub notify_at: DateTime<Utc>,
    /// Number of times the hint was put back after its block could not be resolved.
    #[serde(default)]
    pub attempts: u32,
}

impl NotificationHint {
    #[must_use]
    pub fn container(&self) -> Container {
        Container::new(self.workspace_id.clone())
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriberType {
    User,
    Channel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub subscriber_type: SubscriberType,
    pub subscriber_id: UserId,
    /// Watermark: the last update time this subscriber is caught up through.
    pub notified_at: DateTime<Utc>,
}

impl Subscriber {
    #[must_use]
    pub fn is_author(&self, modified_by_id: &UserId) -> bool {
        self.subscriber_id == *modified_by_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub block_type: BlockType,
    pub block_id: BlockId,
    pub workspace_id: WorkspaceId,
    pub subscriber_type: SubscriberType,
    pub subscriber_id: UserId,
    pub notified_at: DateTime<Utc>,
    pub create_at: DateTime<Utc>,
}

impl Subscription {
    #[must_use]
    pub fn container(&self) -> Container {
        Container::new(self.workspace_id.clone())
    }

    #[must_use]
    pub fn subscriber(&self) -> Subscriber {
        Subscriber {
            subscriber_type: self.subscriber_type,
            subscriber_id: self.subscriber_id.clone(),
            notified_at: self.notified_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn id_serializes_as_plain_string() {
        let id = BlockId::new("card-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!("\"card-1\"", json);
        let parsed: BlockId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[rstest]
    #[case(BlockType::Board, "board")]
    #[case(BlockType::Card, "card")]
    #[case(BlockType::Comment, "comment")]
    fn block_type_names(#[case] block_type: BlockType, #[case] expected: &str) {
        assert_eq!(expected, block_type.to_string());
        assert_eq!(block_type, expected.parse().unwrap());
    }

    #[test]
    fn author_is_matched_by_id() {
        let subscriber = Subscriber {
            subscriber_type: SubscriberType::User,
            subscriber_id: UserId::new("u1"),
            notified_at: DateTime::UNIX_EPOCH,
        };
        assert!(subscriber.is_author(&UserId::new("u1")));
        assert!(!subscriber.is_author(&UserId::new("u2")));
    }
}
