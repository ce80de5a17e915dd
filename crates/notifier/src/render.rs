//! Turns diffs into the digest text delivered to subscribers.
use crate::diff::{Change, Diff};
use concepts::{Block, BlockId, BlockType};
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeLine {
    pub text: String,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedNotification {
    /// Card title, or the board title when the root is a board.
    pub title: String,
    pub link: String,
    pub changes: Vec<ChangeLine>,
}

impl RenderedNotification {
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = format!("### [{}]({})\n", self.title, self.link);
        for change in &self.changes {
            let line = match &change.link {
                Some(link) => format!("- {} ([open]({link}))\n", change.text),
                None => format!("- {}\n", change.text),
            };
            out.push_str(&line);
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Renderer {
    server_root: String,
}

impl Renderer {
    /// Only English phrases exist, other languages fall back to them.
    #[must_use]
    pub fn new(server_root: &str, language: &str) -> Self {
        if language != DEFAULT_LANGUAGE {
            debug!("Language `{language}` is not available, rendering in `{DEFAULT_LANGUAGE}`");
        }
        Self {
            server_root: server_root.trim_end_matches('/').to_string(),
        }
    }

    fn link(&self, board: &Block, card_id: Option<&BlockId>) -> String {
        let mut link = format!(
            "{}/workspace/{}/{}",
            self.server_root, board.workspace_id, board.id
        );
        if let Some(card_id) = card_id {
            link.push('/');
            link.push_str(card_id);
        }
        link
    }

    /// `None` when there is nothing to say.
    #[must_use]
    pub fn render(
        &self,
        board: &Block,
        card: Option<&Block>,
        diffs: &[Diff],
    ) -> Option<RenderedNotification> {
        if diffs.is_empty() {
            return None;
        }
        let changes = diffs
            .iter()
            .map(|diff| ChangeLine {
                text: describe(diff),
                link: Some(self.link(board, diff.card_id())),
            })
            .collect();
        Some(RenderedNotification {
            title: card.map_or_else(|| board.title.clone(), |card| card.title.clone()),
            link: self.link(board, card.map(|card| &card.id)),
            changes,
        })
    }
}

fn kind(block_type: BlockType) -> &'static str {
    match block_type {
        BlockType::Board => "board",
        BlockType::Card => "card",
        BlockType::View => "view",
        BlockType::Text => "text",
        BlockType::Comment => "comment",
        BlockType::Checkbox => "checkbox",
        BlockType::Divider => "divider",
        BlockType::Image => "image",
    }
}

fn describe(diff: &Diff) -> String {
    let author = &diff.modified_by;
    let kind = kind(diff.block_type);
    match &diff.change {
        Change::Added if diff.block_type == BlockType::Comment => {
            format!("{author} commented: {}", diff.title)
        }
        Change::Added => format!("{author} added {kind} \"{}\"", diff.title),
        Change::Deleted => format!("{author} deleted {kind} \"{}\"", diff.title),
        Change::TitleChanged { old, new } => {
            format!("{author} renamed {kind} \"{old}\" to \"{new}\"")
        }
        Change::PropertyChanged {
            property_name,
            old,
            new,
            ..
        } => match (old, new) {
            (Some(old), Some(new)) => {
                format!("{author} changed {property_name} from \"{old}\" to \"{new}\"")
            }
            (None, Some(new)) => format!("{author} set {property_name} to \"{new}\""),
            (Some(old), None) => format!("{author} cleared {property_name} (was \"{old}\")"),
            (None, None) => format!("{author} changed {property_name}"),
        },
        Change::FieldChanged { field, .. } => {
            format!("{author} changed {field} of {kind} \"{}\"", diff.title)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use concepts::UserId;
    use db_tests::fixtures::{board, card};

    fn diff(block: &Block, change: Change) -> Diff {
        Diff {
            block_id: block.id.clone(),
            block_type: block.block_type,
            parent_id: block.parent_id.clone(),
            title: block.title.clone(),
            change,
            update_at: block.update_at,
            modified_by: UserId::new("bob"),
        }
    }

    #[test]
    fn nothing_to_render_without_diffs() {
        let board = board("b1", "Board", "alice", DateTime::UNIX_EPOCH);
        let renderer = Renderer::new("http://localhost:8000", DEFAULT_LANGUAGE);
        assert_eq!(None, renderer.render(&board, None, &[]));
    }

    #[test]
    fn card_digest_links_to_the_card() {
        let board = board("b1", "Board", "alice", DateTime::UNIX_EPOCH);
        let card = card("c1", "b1", "Fix login", "alice", DateTime::UNIX_EPOCH);
        let renderer = Renderer::new("http://localhost:8000/", "fr");
        let rendered = renderer
            .render(
                &board,
                Some(&card),
                &[
                    diff(
                        &card,
                        Change::PropertyChanged {
                            property_id: "p-status".to_string(),
                            property_name: "Status".to_string(),
                            old: Some("To Do".to_string()),
                            new: Some("Done".to_string()),
                        },
                    ),
                    diff(
                        &board,
                        Change::TitleChanged {
                            old: "Board".to_string(),
                            new: "Roadmap".to_string(),
                        },
                    ),
                ],
            )
            .unwrap();
        assert_eq!("Fix login", rendered.title);
        assert_eq!("http://localhost:8000/workspace/w1/b1/c1", rendered.link);
        assert_eq!(
            vec![
                ChangeLine {
                    text: "bob changed Status from \"To Do\" to \"Done\"".to_string(),
                    link: Some("http://localhost:8000/workspace/w1/b1/c1".to_string()),
                },
                ChangeLine {
                    text: "bob renamed board \"Board\" to \"Roadmap\"".to_string(),
                    link: Some("http://localhost:8000/workspace/w1/b1".to_string()),
                },
            ],
            rendered.changes
        );
        assert!(
            rendered
                .to_markdown()
                .starts_with("### [Fix login](http://localhost:8000/workspace/w1/b1/c1)\n- bob changed Status")
        );
    }

    #[test]
    fn markdown_has_one_line_per_change() {
        let rendered = RenderedNotification {
            title: "Fix login".to_string(),
            link: "http://localhost/workspace/w1/b1/c1".to_string(),
            changes: vec![
                ChangeLine {
                    text: "bob commented: looks good".to_string(),
                    link: None,
                },
                ChangeLine {
                    text: "bob renamed board \"Board\" to \"Roadmap\"".to_string(),
                    link: Some("http://localhost/workspace/w1/b1".to_string()),
                },
            ],
        };
        assert_eq!(
            "### [Fix login](http://localhost/workspace/w1/b1/c1)\n\
             - bob commented: looks good\n\
             - bob renamed board \"Board\" to \"Roadmap\" ([open](http://localhost/workspace/w1/b1))\n",
            rendered.to_markdown()
        );
    }
}
