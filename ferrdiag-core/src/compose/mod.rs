//! Merges refined elements and recognized text into one layered document.

pub mod drawio;

use std::collections::{HashMap, HashSet};

use snafu::ensure;
use tracing::*;

use crate::{
    consts::{FONT_SIZE_PER_PIXEL, FORMULA_FONT_SIZE, MAX_FONT_SIZE, MIN_FONT_SIZE, TEXT_FONT_SIZE},
    error::{FerrdiagError, MergeConflictSnafu},
    layout::{
        document::{Document, Node, Origin},
        element::{Element, Style, TextBlock},
    },
};

/// Builds the document for one iteration.
///
/// Text and formula elements are represented by the text blocks recognized
/// inside them. Same-category nodes with IoU above `merge_threshold` are
/// merged: candidates are visited by confidence, then detection order, and
/// one overlapping an already kept node is dropped, its references
/// redirected to the survivor. The result depends on the inputs only.
#[tracing::instrument(skip_all)]
pub fn compose(
    elements: &[Element],
    texts: &[TextBlock],
    width: u32,
    height: u32,
    merge_threshold: f32,
) -> Result<Document, FerrdiagError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut groups: HashMap<&str, &str> = HashMap::new();
    let mut candidates: Vec<Node> = Vec::with_capacity(elements.len() + texts.len());
    // Detection order: elements by model output order, then text blocks
    let mut ranks: Vec<(u8, usize)> = Vec::with_capacity(candidates.capacity());

    for element in elements {
        ensure!(
            seen.insert(element.id.as_str()),
            MergeConflictSnafu {
                id: element.id.clone()
            }
        );
        if let Some(parent) = &element.parent {
            groups.insert(element.id.as_str(), parent.as_str());
        }
        if !element.category.is_textual() {
            candidates.push(element_node(element));
            ranks.push((0, element.order));
        }
    }
    for (index, block) in texts.iter().enumerate() {
        ensure!(
            seen.insert(block.id.as_str()),
            MergeConflictSnafu {
                id: block.id.clone()
            }
        );
        // Labels join the container of the region they were read from
        let group = block
            .source
            .as_deref()
            .and_then(|source| groups.get(source))
            .map(|group| group.to_string());
        candidates.push(text_node(block, group));
        ranks.push((1, index));
    }

    let mut visit: Vec<usize> = (0..candidates.len()).collect();
    visit.sort_by(|&a, &b| {
        candidates[b]
            .confidence
            .total_cmp(&candidates[a].confidence)
            .then(ranks[a].cmp(&ranks[b]))
    });

    let mut kept: Vec<usize> = Vec::with_capacity(candidates.len());
    let mut redirect: HashMap<String, String> = HashMap::new();
    for index in visit {
        let candidate = &candidates[index];
        let survivor = kept.iter().map(|&k| &candidates[k]).find(|survivor| {
            survivor.category == candidate.category
                && survivor.bbox.iou(&candidate.bbox) > merge_threshold
        });
        match survivor {
            Some(survivor) => {
                debug!(
                    "Merge {} ({:.3}) into {} ({:.3})",
                    candidate.id, candidate.confidence, survivor.id, survivor.confidence
                );
                redirect.insert(candidate.id.clone(), survivor.id.clone());
            }
            None => kept.push(index),
        }
    }

    kept.sort_by_key(|&index| (candidates[index].category.layer(), ranks[index]));
    let mut slots: Vec<Option<Node>> = candidates.into_iter().map(Some).collect();
    let mut nodes: Vec<Node> = kept
        .iter()
        .filter_map(|&index| slots[index].take())
        .collect();

    relink(&mut nodes, &redirect);

    debug!(
        "Composed {} nodes, {} merged away",
        nodes.len(),
        redirect.len()
    );
    Ok(Document {
        width,
        height,
        nodes,
    })
}

/// Points references at surviving nodes and rebuilds member lists.
fn relink(nodes: &mut [Node], redirect: &HashMap<String, String>) {
    let ids: HashSet<String> = nodes.iter().map(|node| node.id.clone()).collect();
    let resolve = |id: &str, own: &str| -> Option<String> {
        let id = redirect.get(id).map(String::as_str).unwrap_or(id);
        (id != own && ids.contains(id)).then(|| id.to_string())
    };

    for node in nodes.iter_mut() {
        node.parent = node.parent.as_deref().and_then(|id| resolve(id, &node.id));
        if node.is_edge() {
            node.source = node.source.as_deref().and_then(|id| resolve(id, &node.id));
            node.target = node.target.as_deref().and_then(|id| resolve(id, &node.id));
            let mut children: Vec<String> = node.source.iter().cloned().collect();
            if node.target != node.source {
                children.extend(node.target.iter().cloned());
            }
            node.children = children;
            if node.source.is_some() && node.target.is_some() {
                node.style.remove("dangling");
            } else {
                node.style.set("dangling", "1");
            }
        }
    }

    let mut members: HashMap<String, Vec<String>> = HashMap::new();
    for node in nodes.iter() {
        if let Some(parent) = &node.parent {
            members
                .entry(parent.clone())
                .or_default()
                .push(node.id.clone());
        }
    }
    for node in nodes.iter_mut().filter(|node| !node.is_edge()) {
        node.children = members.remove(&node.id).unwrap_or_default();
    }
}

fn element_node(element: &Element) -> Node {
    let (source, target) = element
        .connection
        .as_ref()
        .map(|connection| (connection.source.clone(), connection.target.clone()))
        .unwrap_or_default();

    Node {
        id: element.id.clone(),
        category: element.category,
        bbox: element.bbox.snapped(),
        style: element.style.clone(),
        children: element.children.clone(),
        parent: element.parent.clone(),
        source,
        target,
        value: String::new(),
        confidence: element.confidence,
        origin: Origin::Element(element.id.clone()),
    }
}

fn text_node(block: &TextBlock, group: Option<String>) -> Node {
    let mut style = Style::new();
    style
        .flag("text")
        .set("html", "1")
        .set("whiteSpace", "wrap")
        .set("align", "center")
        .set("verticalAlign", "middle")
        .set("strokeColor", "none")
        .set("fillColor", "none");
    style.set("fontSize", font_size(block).to_string());
    if block.is_formula {
        style.set("formula", "1");
    }

    Node {
        id: block.id.clone(),
        category: block.category(),
        bbox: block.bbox.snapped(),
        style,
        children: Vec::new(),
        parent: group,
        source: None,
        target: None,
        value: block.display_value().to_string(),
        confidence: block.confidence,
        origin: Origin::Text(block.id.clone()),
    }
}

/// Point size that makes one line of `block` about as tall as its box.
fn font_size(block: &TextBlock) -> u32 {
    let default = if block.is_formula {
        FORMULA_FONT_SIZE
    } else {
        TEXT_FONT_SIZE
    };
    let lines = block.display_value().lines().count().max(1) as f32;
    let line_height = block.bbox.height() / lines;
    if !line_height.is_finite() || line_height <= 0.0 {
        return default;
    }
    ((line_height * FONT_SIZE_PER_PIXEL).round() as u32).clamp(MIN_FONT_SIZE, MAX_FONT_SIZE)
}
