use serde::{Deserialize, Serialize};

use crate::{
    analysis::{bbox::Bbox, labels::Category},
    layout::element::Style,
};

/// Where a document node came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Origin {
    Element(String),
    Text(String),
}

impl Origin {
    pub fn id(&self) -> &str {
        match self {
            Origin::Element(id) | Origin::Text(id) => id,
        }
    }
}

/// A positioned, styled node of the merged document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub category: Category,
    pub bbox: Bbox,
    pub style: Style,
    /// Related node ids: anchors for arrows, grouped members for containers.
    pub children: Vec<String>,
    pub parent: Option<String>,
    /// Anchor at the tail of an arrow.
    #[serde(default)]
    pub source: Option<String>,
    /// Anchor at the head of an arrow.
    #[serde(default)]
    pub target: Option<String>,
    /// Displayed text, empty for non-text nodes.
    pub value: String,
    pub confidence: f32,
    pub origin: Origin,
}

impl Node {
    pub fn is_edge(&self) -> bool {
        self.category == Category::Arrow
    }
}

/// The merged reconstruction, nodes ordered by layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub width: u32,
    pub height: u32,
    pub nodes: Vec<Node>,
}

impl Document {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            nodes: Vec::new(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn count(&self, category: Category) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.category == category)
            .count()
    }
}
