use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed set of element categories a diagram is reconstructed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Icon,
    Picture,
    Shape,
    Arrow,
    Text,
    Formula,
    Background,
}

/// Z-order class of a category. Lower levels are drawn first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerLevel {
    Background,
    Content,
    Connector,
    Text,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Icon,
        Category::Picture,
        Category::Shape,
        Category::Arrow,
        Category::Text,
        Category::Formula,
        Category::Background,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Category::Icon => "icon",
            Category::Picture => "picture",
            Category::Shape => "shape",
            Category::Arrow => "arrow",
            Category::Text => "text",
            Category::Formula => "formula",
            Category::Background => "background",
        }
    }

    pub const fn idx(&self) -> usize {
        match self {
            Category::Icon => 0,
            Category::Picture => 1,
            Category::Shape => 2,
            Category::Arrow => 3,
            Category::Text => 4,
            Category::Formula => 5,
            Category::Background => 6,
        }
    }

    pub const fn color(&self) -> [u8; 3] {
        match self {
            Category::Icon => [255, 165, 0],       // Orange
            Category::Picture => [128, 0, 128],    // Purple
            Category::Shape => [0, 0, 255],        // Blue
            Category::Arrow => [255, 0, 0],        // Red
            Category::Text => [0, 128, 0],         // Dark Green
            Category::Formula => [255, 20, 147],   // Deep Pink
            Category::Background => [128, 128, 128], // Gray
        }
    }

    pub const fn layer(&self) -> LayerLevel {
        match self {
            Category::Background => LayerLevel::Background,
            Category::Shape | Category::Icon | Category::Picture => LayerLevel::Content,
            Category::Arrow => LayerLevel::Connector,
            Category::Text | Category::Formula => LayerLevel::Text,
        }
    }

    /// Categories represented by recognized text rather than by their own node.
    pub const fn is_textual(&self) -> bool {
        matches!(self, Category::Text | Category::Formula)
    }

    /// Categories an arrow endpoint may attach to.
    pub const fn is_anchor(&self) -> bool {
        matches!(self, Category::Shape | Category::Icon | Category::Picture)
    }

    /// Maps a free-form model label onto a category.
    ///
    /// Segmentation models are prompted with open vocabulary ("rounded box",
    /// "connector line", "company logo"), so the label is matched by keyword.
    /// Anything unrecognized is a shape.
    pub fn from_label(label: &str) -> Category {
        const KEYWORDS: [(Category, &[&str]); 6] = [
            (Category::Arrow, &["arrow", "line", "connector", "edge"]),
            (Category::Formula, &["formula", "equation", "math"]),
            (Category::Text, &["text", "label", "caption", "title", "word"]),
            (Category::Icon, &["icon", "symbol", "logo"]),
            (Category::Picture, &["image", "picture", "photo", "figure"]),
            (Category::Background, &["background", "bg"]),
        ];

        let label = label.trim().to_lowercase();
        if let Ok(category) = label.parse::<Category>() {
            return category;
        }
        KEYWORDS
            .iter()
            .find(|(_, words)| words.iter().any(|word| label.contains(word)))
            .map(|(category, _)| *category)
            .unwrap_or(Category::Shape)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.name() == s)
            .ok_or_else(|| format!("unknown category `{s}`"))
    }
}
