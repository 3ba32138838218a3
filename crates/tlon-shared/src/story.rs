//! Structured post content.
//!
//! A [`Story`] is an ordered list of verses; each verse is either a run of
//! inline nodes or a single block. Plain text inlines travel as bare JSON
//! strings, every other node as a single-key object (`{"bold": [...]}`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::{ChannelId, GroupId, Ship};

/// JSON `null` payload for nodes that carry no data (`{"break": null}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Nil;

impl Serialize for Nil {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_unit()
    }
}

impl<'de> Deserialize<'de> for Nil {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        <()>::deserialize(deserializer).map(|_| Nil)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Story(pub Vec<Verse>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verse {
    Inline(Vec<Inline>),
    Block(Block),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Inline {
    Text(String),
    Node(InlineNode),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InlineNode {
    Bold(Vec<Inline>),
    Italics(Vec<Inline>),
    Strike(Vec<Inline>),
    Blockquote(Vec<Inline>),
    InlineCode(String),
    Code(String),
    Ship(Ship),
    Tag(String),
    Link { href: String, content: String },
    Break(Nil),
    /// Reference to a block of the same story by index.
    Block { index: u32, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Block {
    Image {
        src: String,
        height: u32,
        width: u32,
        alt: String,
    },
    Cite(Cite),
    Header {
        tag: HeaderTag,
        content: Vec<Inline>,
    },
    Code {
        code: String,
        lang: String,
    },
    Rule(Nil),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderTag {
    H1,
    H2,
    H3,
    H4,
    H5,
    H6,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cite {
    Chan {
        nest: ChannelId,
        #[serde(rename = "where")]
        path: String,
    },
    Group(GroupId),
}

impl Story {
    /// A single paragraph of plain text.
    pub fn text(s: impl Into<String>) -> Self {
        Self(vec![Verse::Inline(vec![Inline::Text(s.into())])])
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|verse| match verse {
            Verse::Inline(inlines) => inlines.iter().all(Inline::is_blank),
            Verse::Block(_) => false,
        })
    }

    /// Flatten to plain text, e.g. for previews and search.
    pub fn to_plain_text(&self) -> String {
        let mut out = String::new();
        for verse in &self.0 {
            if !out.is_empty() {
                out.push('\n');
            }
            match verse {
                Verse::Inline(inlines) => push_inlines(&mut out, inlines),
                Verse::Block(block) => push_block(&mut out, block),
            }
        }
        out
    }

    /// Every ship mentioned anywhere in the story, in order of appearance.
    pub fn mentions(&self) -> Vec<Ship> {
        let mut ships = Vec::new();
        for verse in &self.0 {
            match verse {
                Verse::Inline(inlines) => collect_mentions(inlines, &mut ships),
                Verse::Block(Block::Header { content, .. }) => collect_mentions(content, &mut ships),
                Verse::Block(_) => {}
            }
        }
        ships
    }
}

impl Inline {
    fn is_blank(&self) -> bool {
        match self {
            Inline::Text(s) => s.trim().is_empty(),
            Inline::Node(InlineNode::Break(_)) => true,
            Inline::Node(_) => false,
        }
    }
}

fn push_inlines(out: &mut String, inlines: &[Inline]) {
    for inline in inlines {
        match inline {
            Inline::Text(s) => out.push_str(s),
            Inline::Node(node) => match node {
                InlineNode::Bold(inner)
                | InlineNode::Italics(inner)
                | InlineNode::Strike(inner)
                | InlineNode::Blockquote(inner) => push_inlines(out, inner),
                InlineNode::InlineCode(s) | InlineNode::Code(s) | InlineNode::Tag(s) => {
                    out.push_str(s)
                }
                InlineNode::Ship(ship) => out.push_str(ship.as_str()),
                InlineNode::Link { href, content } => {
                    out.push_str(if content.is_empty() { href } else { content })
                }
                InlineNode::Break(_) => out.push('\n'),
                InlineNode::Block { text, .. } => out.push_str(text),
            },
        }
    }
}

fn push_block(out: &mut String, block: &Block) {
    match block {
        Block::Image { alt, .. } => out.push_str(if alt.is_empty() { "(image)" } else { alt }),
        Block::Cite(Cite::Chan { nest, .. }) => out.push_str(nest.as_str()),
        Block::Cite(Cite::Group(group)) => out.push_str(&group.to_string()),
        Block::Header { content, .. } => push_inlines(out, content),
        Block::Code { code, .. } => out.push_str(code),
        Block::Rule(_) => out.push_str("---"),
    }
}

fn collect_mentions(inlines: &[Inline], ships: &mut Vec<Ship>) {
    for inline in inlines {
        if let Inline::Node(node) = inline {
            match node {
                InlineNode::Ship(ship) => {
                    if !ships.contains(ship) {
                        ships.push(ship.clone());
                    }
                }
                InlineNode::Bold(inner)
                | InlineNode::Italics(inner)
                | InlineNode::Strike(inner)
                | InlineNode::Blockquote(inner) => collect_mentions(inner, ships),
                InlineNode::InlineCode(_)
                | InlineNode::Code(_)
                | InlineNode::Tag(_)
                | InlineNode::Link { .. }
                | InlineNode::Break(_)
                | InlineNode::Block { .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_mixed_inlines() {
        let raw = json!([
            {"inline": ["hi ", {"ship": "~bus"}, {"bold": ["there"]}, {"break": null}]},
            {"block": {"image": {"src": "https://x/y.png", "height": 10, "width": 20, "alt": ""}}}
        ]);
        let story: Story = serde_json::from_value(raw).unwrap();
        assert_eq!(story.0.len(), 2);
        assert_eq!(story.to_plain_text(), "hi ~busthere\n\n(image)");
        assert_eq!(story.mentions(), vec!["~bus".parse().unwrap()]);
    }

    #[test]
    fn break_serializes_as_null() {
        let story = Story(vec![Verse::Inline(vec![Inline::Node(InlineNode::Break(Nil))])]);
        let value = serde_json::to_value(&story).unwrap();
        assert_eq!(value, json!([{"inline": [{"break": null}]}]));
        assert!(story.is_empty());
    }

    #[test]
    fn nested_mentions_are_deduplicated() {
        let story: Story = serde_json::from_value(json!([
            {"inline": [{"italics": [{"ship": "~zod"}]}, {"ship": "~zod"}, {"ship": "~nec"}]}
        ]))
        .unwrap();
        let names: Vec<String> = story.mentions().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, vec!["~zod", "~nec"]);
    }

    #[test]
    fn text_story_is_not_empty() {
        assert!(!Story::text("hello").is_empty());
        assert!(Story::text("   ").is_empty());
    }
}
