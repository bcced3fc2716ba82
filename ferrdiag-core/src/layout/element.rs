use std::{collections::BTreeMap, sync::Arc};

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::analysis::{
    bbox::Bbox,
    labels::{Category, LayerLevel},
    mask::Mask,
};

/// Open key/value styling attached to elements and document nodes.
///
/// Keys are kept sorted so the encoded form is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Style(BTreeMap<String, String>);

impl Style {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Sets a bare token such as `ellipse` or `text`.
    pub fn flag(&mut self, key: impl Into<String>) -> &mut Self {
        self.set(key, "")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encodes as a draw.io style string: `key=value;` pairs, bare `key;` for
    /// empty values. `%` and `;` are percent-escaped, as is `=` inside keys.
    ///
    /// # Example
    /// ```
    /// use ferrdiag_core::layout::element::Style;
    /// let mut style = Style::new();
    /// style.flag("ellipse").set("fillColor", "#FFFFFF");
    /// assert_eq!(style.encode(), "ellipse;fillColor=#FFFFFF;");
    /// assert_eq!(Style::decode(&style.encode()), style);
    /// ```
    pub fn encode(&self) -> String {
        let mut encoded = String::new();
        for (key, value) in &self.0 {
            encoded.push_str(&escape_style(key).replace('=', "%3D"));
            if !value.is_empty() {
                encoded.push('=');
                encoded.push_str(&escape_style(value));
            }
            encoded.push(';');
        }
        encoded
    }

    pub fn decode(encoded: &str) -> Self {
        let mut style = Style::new();
        for part in encoded.split(';').filter(|part| !part.is_empty()) {
            match part.split_once('=') {
                Some((key, value)) => style.set(unescape_style(key), unescape_style(value)),
                None => style.flag(unescape_style(part)),
            };
        }
        style
    }
}

fn escape_style(raw: &str) -> String {
    raw.replace('%', "%25").replace(';', "%3B")
}

fn unescape_style(escaped: &str) -> String {
    escaped
        .replace("%3D", "=")
        .replace("%3B", ";")
        .replace("%25", "%")
}

/// Arrow endpoints and the anchors they resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub start: Vec2,
    pub end: Vec2,
    pub source: Option<String>,
    pub target: Option<String>,
}

impl Connection {
    pub fn is_dangling(&self) -> bool {
        self.source.is_none() || self.target.is_none()
    }
}

/// A typed, positioned, styled unit of the reconstructed diagram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Element {
    pub id: String,
    pub category: Category,
    pub bbox: Bbox,
    pub confidence: f32,
    pub style: Style,
    pub children: Vec<String>,
    pub parent: Option<String>,
    /// Index in model output order, used to break ties deterministically.
    pub order: usize,
    /// Raw region geometry. Processors drop it once they have replaced it
    /// with a parametric description.
    #[serde(skip)]
    pub mask: Option<Arc<Mask>>,
    /// Wider area a refinement pass may look in. The element keeps `bbox` as
    /// its geometry; processors clear this when they are done.
    #[serde(skip)]
    pub search: Option<Bbox>,
    pub connection: Option<Connection>,
}

impl Element {
    pub fn new(id: impl Into<String>, category: Category, bbox: Bbox, confidence: f32) -> Self {
        Self {
            id: id.into(),
            category,
            bbox,
            confidence: confidence.clamp(0.0, 1.0),
            style: Style::new(),
            children: Vec::new(),
            parent: None,
            order: 0,
            mask: None,
            search: None,
            connection: None,
        }
    }

    pub fn layer(&self) -> LayerLevel {
        self.category.layer()
    }

    /// Lowers confidence by `penalty` and marks the element as degraded.
    pub fn degrade(&mut self, penalty: f32) {
        self.confidence = (self.confidence - penalty).max(0.0);
        self.style.set("degraded", "1");
    }

    pub fn is_degraded(&self) -> bool {
        self.style.get("degraded") == Some("1")
    }

    pub fn search_area(&self) -> Bbox {
        self.search.unwrap_or(self.bbox)
    }
}

/// Text recognized inside a region of the source image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    #[serde(default)]
    pub id: String,
    pub text: String,
    pub bbox: Bbox,
    pub confidence: f32,
    #[serde(default)]
    pub is_formula: bool,
    /// Canonical markup for formulas, e.g. `$\frac{a}{b}$`.
    #[serde(default)]
    pub notation: Option<String>,
    /// Element whose region produced this block.
    #[serde(default)]
    pub source: Option<String>,
}

impl TextBlock {
    pub fn new(text: impl Into<String>, bbox: Bbox, confidence: f32) -> Self {
        Self {
            id: String::new(),
            text: text.into(),
            bbox,
            confidence,
            is_formula: false,
            notation: None,
            source: None,
        }
    }

    pub fn category(&self) -> Category {
        if self.is_formula {
            Category::Formula
        } else {
            Category::Text
        }
    }

    /// What a document node shows: the notation for formulas, else the text.
    pub fn display_value(&self) -> &str {
        self.notation.as_deref().unwrap_or(&self.text)
    }
}
