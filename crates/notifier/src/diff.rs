//! Computes what changed under a board or a card after a point in time by
//! comparing versions stored in the block history.
use chrono::{DateTime, Utc};
use concepts::storage::{BlockHistoryQuery, BlockStore, DbConnection, DbError};
use concepts::{Block, BlockId, BlockType, Container, Subscriber, UserId};
use hashbrown::{HashMap, HashSet};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{Level, debug, instrument, warn};

const CARD_PROPERTIES: &str = "cardProperties";
const PROPERTIES: &str = "properties";
/// Fields that are diffed separately or only hold presentation state.
const SKIPPED_FIELDS: [&str; 3] = [CARD_PROPERTIES, PROPERTIES, "contentOrder"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added,
    Deleted,
    TitleChanged {
        old: String,
        new: String,
    },
    /// Card property change, values are resolved to option labels when possible.
    PropertyChanged {
        property_id: String,
        property_name: String,
        old: Option<String>,
        new: Option<String>,
    },
    FieldChanged {
        field: String,
        old: Option<Value>,
        new: Option<Value>,
    },
}

/// One detected change of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub block_id: BlockId,
    pub block_type: BlockType,
    pub parent_id: Option<BlockId>,
    /// Title of the newest version.
    pub title: String,
    pub change: Change,
    pub update_at: DateTime<Utc>,
    pub modified_by: UserId,
}

impl Diff {
    fn new(block: &Block, change: Change) -> Self {
        Self {
            block_id: block.id.clone(),
            block_type: block.block_type,
            parent_id: block.parent_id.clone(),
            title: block.title.clone(),
            change,
            update_at: block.update_at,
            modified_by: block.modified_by.clone(),
        }
    }

    /// The card this change belongs to. `None` for changes of the board itself.
    #[must_use]
    pub fn card_id(&self) -> Option<&BlockId> {
        match self.block_type {
            BlockType::Card => Some(&self.block_id),
            BlockType::Board => None,
            _ => self.parent_id.as_ref(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiffResolutionError {
    #[error("cannot resolve board and card of block `{block_id}` - {source}")]
    Resolve { block_id: BlockId, source: DbError },
    #[error("cannot read history of block `{block_id}` - {source}")]
    History { block_id: BlockId, source: DbError },
}

impl DiffResolutionError {
    /// The root is gone, retrying cannot help.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, DiffResolutionError::Resolve { source, .. } if source.is_not_found())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PropertyTemplate {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    options: Vec<PropertyOption>,
}

#[derive(Debug, Clone, Deserialize)]
struct PropertyOption {
    id: String,
    value: String,
}

/// Card property definitions of a board, read from its `cardProperties` field.
#[derive(Debug, Default)]
pub struct PropertySchema {
    templates: HashMap<String, PropertyTemplate>,
}

impl PropertySchema {
    #[must_use]
    pub fn from_board(board: &Block) -> Self {
        let Some(value) = board.fields.get(CARD_PROPERTIES) else {
            return Self::default();
        };
        match Vec::<PropertyTemplate>::deserialize(value) {
            Ok(templates) => Self {
                templates: templates
                    .into_iter()
                    .map(|template| (template.id.clone(), template))
                    .collect(),
            },
            Err(err) => {
                warn!(board_id = %board.id, "Ignoring malformed card properties - {err}");
                Self::default()
            }
        }
    }

    fn name<'a>(&'a self, property_id: &'a str) -> &'a str {
        self.templates
            .get(property_id)
            .map(|template| template.name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(property_id)
    }

    fn display(&self, property_id: &str, value: &Value) -> String {
        let option_label = |option_id: &str| {
            self.templates
                .get(property_id)
                .and_then(|template| template.options.iter().find(|opt| opt.id == option_id))
                .map_or_else(|| option_id.to_string(), |opt| opt.value.clone())
        };
        match value {
            Value::String(option_id) => option_label(option_id),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(option_id) => option_label(option_id),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

fn properties(block: &Block) -> Option<&serde_json::Map<String, Value>> {
    block.fields.get(PROPERTIES).and_then(Value::as_object)
}

fn property_changes(old: &Block, new: &Block, schema: &PropertySchema) -> Vec<Change> {
    let empty = serde_json::Map::new();
    let old_props = properties(old).unwrap_or(&empty);
    let new_props = properties(new).unwrap_or(&empty);
    let ids: BTreeSet<&String> = old_props.keys().chain(new_props.keys()).collect();
    let mut changes = Vec::new();
    for id in ids {
        let display = |value: Option<&Value>| {
            value
                .map(|value| schema.display(id, value))
                .filter(|text| !text.is_empty())
        };
        let old_value = display(old_props.get(id));
        let new_value = display(new_props.get(id));
        if old_value != new_value {
            changes.push(Change::PropertyChanged {
                property_id: id.clone(),
                property_name: schema.name(id).to_string(),
                old: old_value,
                new: new_value,
            });
        }
    }
    changes
}

/// Changes between the version visible at the watermark (`old`) and the newest one.
/// Card properties are only compared when `schema` is set.
fn block_changes(old: Option<&Block>, new: &Block, schema: Option<&PropertySchema>) -> Vec<Change> {
    if new.is_deleted() {
        // Created and deleted within the window: nothing to report.
        return if old.is_some_and(|old| !old.is_deleted()) {
            vec![Change::Deleted]
        } else {
            Vec::new()
        };
    }
    let Some(old) = old.filter(|old| !old.is_deleted()) else {
        return vec![Change::Added];
    };
    let mut changes = Vec::new();
    if old.title != new.title {
        changes.push(Change::TitleChanged {
            old: old.title.clone(),
            new: new.title.clone(),
        });
    }
    if let Some(schema) = schema {
        changes.extend(property_changes(old, new, schema));
    }
    let fields: BTreeSet<&String> = old
        .fields
        .keys()
        .chain(new.fields.keys())
        .filter(|field| !SKIPPED_FIELDS.contains(&field.as_str()))
        .collect();
    for field in fields {
        let (old_value, new_value) = (old.fields.get(field), new.fields.get(field));
        if old_value != new_value {
            changes.push(Change::FieldChanged {
                field: field.clone(),
                old: old_value.cloned(),
                new: new_value.cloned(),
            });
        }
    }
    changes
}

/// Oldest watermark among `subscribers`, the point every diff must start from.
#[must_use]
pub fn since(subscribers: &[Subscriber]) -> Option<DateTime<Utc>> {
    subscribers.iter().map(|sub| sub.notified_at).min()
}

/// Diffs of a root together with its resolved board and card.
#[derive(Debug, Clone)]
pub struct RootDiffs {
    pub board: Block,
    /// `None` when the root is the board itself.
    pub card: Option<Block>,
    /// Oldest first.
    pub diffs: Vec<Diff>,
}

pub struct DiffGenerator<'a> {
    db_connection: &'a dyn DbConnection,
    container: &'a Container,
    since: DateTime<Utc>,
}

impl<'a> DiffGenerator<'a> {
    #[must_use]
    pub fn new(
        db_connection: &'a dyn DbConnection,
        container: &'a Container,
        since: DateTime<Utc>,
    ) -> Self {
        Self {
            db_connection,
            container,
            since,
        }
    }

    /// Resolve the board and card of `block_id` and collect every change strictly
    /// after `since`.
    #[instrument(level = Level::DEBUG, skip_all, fields(%block_id, since = %self.since))]
    pub async fn generate(&self, block_id: &BlockId) -> Result<RootDiffs, DiffResolutionError> {
        let (board, card) = self
            .db_connection
            .get_board_and_card(self.container, block_id)
            .await
            .map_err(|source| DiffResolutionError::Resolve {
                block_id: block_id.clone(),
                source,
            })?;
        let schema = PropertySchema::from_board(&board);
        let mut diffs = if let Some(card) = &card {
            self.card_diffs(&card.id, &schema).await?
        } else {
            self.board_diffs(&board, &schema).await?
        };
        diffs.sort_by_key(|diff| diff.update_at);
        debug!(diff_count = diffs.len(), "Generated diffs");
        Ok(RootDiffs { board, card, diffs })
    }

    async fn history(
        &self,
        block_id: &BlockId,
        query: BlockHistoryQuery,
    ) -> Result<Vec<Block>, DiffResolutionError> {
        self.db_connection
            .get_block_history(self.container, block_id, query)
            .await
            .map_err(|source| DiffResolutionError::History {
                block_id: block_id.clone(),
                source,
            })
    }

    /// The version visible at `since` and the newest version, if the block changed after it.
    async fn versions(
        &self,
        block_id: &BlockId,
    ) -> Result<Option<(Option<Block>, Block)>, DiffResolutionError> {
        let Some(new) = self
            .history(block_id, BlockHistoryQuery::after(self.since))
            .await?
            .pop()
        else {
            return Ok(None);
        };
        let old = self
            .history(block_id, BlockHistoryQuery::last_at_or_before(self.since))
            .await?
            .pop();
        Ok(Some((old, new)))
    }

    /// Distinct direct children of `parent_id` written after `after`, in order of first change.
    async fn children(
        &self,
        parent_id: &BlockId,
        after: DateTime<Utc>,
    ) -> Result<Vec<(BlockId, BlockType)>, DiffResolutionError> {
        let rows = self
            .db_connection
            .get_subtree_history(self.container, parent_id, after)
            .await
            .map_err(|source| DiffResolutionError::History {
                block_id: parent_id.clone(),
                source,
            })?;
        let mut seen = HashSet::new();
        Ok(rows
            .into_iter()
            .filter(|row| seen.insert(row.id.clone()))
            .map(|row| (row.id, row.block_type))
            .collect())
    }

    async fn card_diffs(
        &self,
        card_id: &BlockId,
        schema: &PropertySchema,
    ) -> Result<Vec<Diff>, DiffResolutionError> {
        let mut diffs = Vec::new();
        if let Some((old, new)) = self.versions(card_id).await? {
            diffs.extend(
                block_changes(old.as_ref(), &new, Some(schema))
                    .into_iter()
                    .map(|change| Diff::new(&new, change)),
            );
        }
        for (child_id, _) in self.children(card_id, self.since).await? {
            if let Some((old, new)) = self.versions(&child_id).await? {
                diffs.extend(
                    block_changes(old.as_ref(), &new, None)
                        .into_iter()
                        .filter(|change| !matches!(change, Change::FieldChanged { .. }))
                        .map(|change| Diff::new(&new, change)),
                );
            }
        }
        Ok(diffs)
    }

    async fn board_diffs(
        &self,
        board: &Block,
        schema: &PropertySchema,
    ) -> Result<Vec<Diff>, DiffResolutionError> {
        let mut diffs = Vec::new();
        if let Some((old, new)) = self.versions(&board.id).await? {
            diffs.extend(
                block_changes(old.as_ref(), &new, None)
                    .into_iter()
                    .map(|change| Diff::new(&new, change)),
            );
        }
        // A card might be unchanged while its comments changed, so every card of the
        // board is visited.
        for (card_id, block_type) in self.children(&board.id, DateTime::<Utc>::MIN_UTC).await? {
            if block_type == BlockType::Card {
                diffs.extend(self.card_diffs(&card_id, schema).await?);
            }
        }
        Ok(diffs)
    }
}
