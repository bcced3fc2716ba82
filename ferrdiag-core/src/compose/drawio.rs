//! draw.io (mxGraph XML) and JSON forms of a [`Document`].
//!
//! Every node becomes an `<object>` carrying the reconstruction attributes
//! around the `mxCell` draw.io renders. Reading back what [`to_drawio`]
//! wrote gives the same document, and writing that again gives the same
//! bytes.

use std::{collections::HashMap, fmt::Write, path::Path, str::FromStr};

use quick_xml::{Reader, escape::escape, events::BytesStart, events::Event};
use snafu::ResultExt;

use crate::{
    analysis::{bbox::Bbox, labels::Category},
    error::{FerrdiagError, IoReadSnafu, IoWriteSnafu, JsonSnafu, XmlSnafu},
    layout::{
        document::{Document, Node, Origin},
        element::Style,
    },
};

const STRUCTURAL_ROOT: &str = "0";
const DEFAULT_PARENT: &str = "1";

/// Serializes `document` to an uncompressed `.drawio` file.
pub fn to_drawio(document: &Document) -> String {
    let mut xml = String::new();
    let math = u8::from(document.count(Category::Formula) > 0);

    xml.push_str("<mxfile host=\"ferrdiag\">\n");
    xml.push_str("  <diagram id=\"ferrdiag\" name=\"Page-1\">\n");
    let _ = writeln!(
        xml,
        "    <mxGraphModel grid=\"0\" gridSize=\"10\" guides=\"1\" tooltips=\"1\" connect=\"1\" \
         arrows=\"1\" fold=\"1\" page=\"1\" pageScale=\"1\" pageWidth=\"{}\" pageHeight=\"{}\" \
         math=\"{}\" shadow=\"0\">",
        document.width, document.height, math
    );
    xml.push_str("      <root>\n");
    let _ = writeln!(xml, "        <mxCell id=\"{STRUCTURAL_ROOT}\"/>");
    let _ = writeln!(
        xml,
        "        <mxCell id=\"{DEFAULT_PARENT}\" parent=\"{STRUCTURAL_ROOT}\"/>"
    );

    for node in &document.nodes {
        write_node(&mut xml, node);
    }

    xml.push_str("      </root>\n");
    xml.push_str("    </mxGraphModel>\n");
    xml.push_str("  </diagram>\n");
    xml.push_str("</mxfile>\n");
    xml
}

fn write_node(xml: &mut String, node: &Node) {
    let _ = write!(
        xml,
        "        <object id=\"{}\" label=\"{}\" category=\"{}\" confidence=\"{}\" origin=\"{}\"",
        attr(&node.id),
        attr(&node.value),
        node.category.name(),
        node.confidence,
        attr(&origin_to_string(&node.origin)),
    );
    if !node.children.is_empty() {
        let _ = write!(xml, " children=\"{}\"", attr(&node.children.join(" ")));
    }
    if let Some(group) = &node.parent {
        let _ = write!(xml, " group=\"{}\"", attr(group));
    }
    xml.push_str(">\n");

    let _ = write!(
        xml,
        "          <mxCell style=\"{}\" parent=\"{DEFAULT_PARENT}\"",
        attr(&node.style.encode())
    );
    if node.is_edge() {
        xml.push_str(" edge=\"1\"");
        if let Some(source) = &node.source {
            let _ = write!(xml, " source=\"{}\"", attr(source));
        }
        if let Some(target) = &node.target {
            let _ = write!(xml, " target=\"{}\"", attr(target));
        }
    } else {
        xml.push_str(" vertex=\"1\"");
    }
    xml.push_str(">\n");

    let bbox = node.bbox;
    let _ = write!(
        xml,
        "            <mxGeometry x=\"{}\" y=\"{}\" width=\"{}\" height=\"{}\"",
        bbox.x(),
        bbox.y(),
        bbox.width(),
        bbox.height()
    );
    if node.is_edge() {
        xml.push_str(" relative=\"1\" as=\"geometry\">\n");
        for key in ["sourcePoint", "targetPoint"] {
            if let Some((x, y)) = node.style.get(key).and_then(|point| point.split_once(',')) {
                let _ = writeln!(
                    xml,
                    "              <mxPoint x=\"{}\" y=\"{}\" as=\"{key}\"/>",
                    attr(x),
                    attr(y)
                );
            }
        }
        xml.push_str("            </mxGeometry>\n");
    } else {
        xml.push_str(" as=\"geometry\"/>\n");
    }

    xml.push_str("          </mxCell>\n");
    xml.push_str("        </object>\n");
}

/// Escapes an attribute value, keeping line breaks and tabs intact through
/// attribute value normalization.
fn attr(raw: &str) -> String {
    escape(raw)
        .replace('\n', "&#10;")
        .replace('\r', "&#13;")
        .replace('\t', "&#9;")
}

fn origin_to_string(origin: &Origin) -> String {
    match origin {
        Origin::Element(id) => format!("element:{id}"),
        Origin::Text(id) => format!("text:{id}"),
    }
}

fn origin_from_str(raw: &str) -> Result<Origin, FerrdiagError> {
    match raw.split_once(':') {
        Some(("element", id)) => Ok(Origin::Element(id.to_string())),
        Some(("text", id)) => Ok(Origin::Text(id.to_string())),
        _ => XmlSnafu {
            stage: "origin",
            message: format!("unknown origin `{raw}`"),
        }
        .fail(),
    }
}

/// Attributes of the element being read, unescaped.
struct Attributes(HashMap<String, String>);

impl Attributes {
    fn from_event(event: &BytesStart<'_>) -> Result<Self, FerrdiagError> {
        let mut attributes = HashMap::new();
        for attribute in event.attributes() {
            let attribute = attribute.map_err(|err| {
                XmlSnafu {
                    stage: "attribute",
                    message: err.to_string(),
                }
                .build()
            })?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).to_string();
            let value = attribute.unescape_value().map_err(|err| {
                XmlSnafu {
                    stage: "attribute",
                    message: format!("`{key}`: {err}"),
                }
                .build()
            })?;
            attributes.insert(key, value.into_owned());
        }
        Ok(Self(attributes))
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn require(&self, element: &str, key: &str) -> Result<&str, FerrdiagError> {
        self.get(key).ok_or_else(|| {
            XmlSnafu {
                stage: element.to_string(),
                message: format!("missing `{key}`"),
            }
            .build()
        })
    }

    fn parse<T: FromStr>(&self, element: &str, key: &str) -> Result<T, FerrdiagError> {
        let raw = self.require(element, key)?;
        raw.parse().map_err(|_| {
            XmlSnafu {
                stage: element.to_string(),
                message: format!("invalid `{key}` value `{raw}`"),
            }
            .build()
        })
    }
}

/// A node whose `<object>` has been opened but not closed yet.
struct PendingNode {
    node: Node,
    has_cell: bool,
    has_geometry: bool,
}

/// Reads a document written by [`to_drawio`].
///
/// Malformed XML, unknown categories and missing attributes are reported as
/// [`FerrdiagError::Xml`].
pub fn from_drawio(xml: &str) -> Result<Document, FerrdiagError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut size: Option<(u32, u32)> = None;
    let mut nodes = Vec::new();
    let mut pending: Option<PendingNode> = None;

    loop {
        let event = reader.read_event().map_err(|err| {
            XmlSnafu {
                stage: "read",
                message: format!("at {}: {err}", reader.buffer_position()),
            }
            .build()
        })?;

        match event {
            Event::Start(element) | Event::Empty(element) => {
                let attributes = Attributes::from_event(&element)?;
                match element.name().as_ref() {
                    b"mxGraphModel" => {
                        size = Some((
                            attributes.parse("mxGraphModel", "pageWidth")?,
                            attributes.parse("mxGraphModel", "pageHeight")?,
                        ));
                    }
                    b"object" => {
                        if pending.is_some() {
                            return XmlSnafu {
                                stage: "object",
                                message: "nested object",
                            }
                            .fail();
                        }
                        pending = Some(PendingNode {
                            node: read_object(&attributes)?,
                            has_cell: false,
                            has_geometry: false,
                        });
                    }
                    b"mxCell" => {
                        if let Some(pending) = pending.as_mut() {
                            read_cell(&mut pending.node, &attributes);
                            pending.has_cell = true;
                        }
                    }
                    b"mxGeometry" => {
                        if let Some(pending) = pending.as_mut() {
                            pending.node.bbox = read_geometry(&attributes)?;
                            pending.has_geometry = true;
                        }
                    }
                    _ => {}
                }
            }
            Event::End(element) if element.name().as_ref() == b"object" => {
                let Some(done) = pending.take() else {
                    return XmlSnafu {
                        stage: "object",
                        message: "unbalanced object end",
                    }
                    .fail();
                };
                if !done.has_cell || !done.has_geometry {
                    return XmlSnafu {
                        stage: "object",
                        message: format!("object `{}` lacks a cell or geometry", done.node.id),
                    }
                    .fail();
                }
                nodes.push(done.node);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let Some((width, height)) = size else {
        return XmlSnafu {
            stage: "mxGraphModel",
            message: "no graph model",
        }
        .fail();
    };
    if pending.is_some() {
        return XmlSnafu {
            stage: "object",
            message: "unterminated object",
        }
        .fail();
    }

    Ok(Document {
        width,
        height,
        nodes,
    })
}

fn read_object(attributes: &Attributes) -> Result<Node, FerrdiagError> {
    let category_name = attributes.require("object", "category")?;
    let category = Category::from_str(category_name).map_err(|message| {
        XmlSnafu {
            stage: "object",
            message,
        }
        .build()
    })?;

    Ok(Node {
        id: attributes.require("object", "id")?.to_string(),
        category,
        bbox: Bbox::from_xywh(0.0, 0.0, 0.0, 0.0),
        style: Style::new(),
        children: attributes
            .get("children")
            .map(|children| children.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        parent: attributes.get("group").map(str::to_string),
        source: None,
        target: None,
        value: attributes.get("label").unwrap_or_default().to_string(),
        confidence: attributes.parse("object", "confidence")?,
        origin: origin_from_str(attributes.require("object", "origin")?)?,
    })
}

fn read_cell(node: &mut Node, attributes: &Attributes) {
    node.style = Style::decode(attributes.get("style").unwrap_or_default());
    node.source = attributes.get("source").map(str::to_string);
    node.target = attributes.get("target").map(str::to_string);
}

fn read_geometry(attributes: &Attributes) -> Result<Bbox, FerrdiagError> {
    let value = |key: &str| -> Result<f32, FerrdiagError> {
        match attributes.get(key) {
            // draw.io omits zero coordinates
            None => Ok(0.0),
            Some(_) => attributes.parse("mxGeometry", key),
        }
    };
    Ok(Bbox::from_xywh(value("x")?, value("y")?, value("width")?, value("height")?).snapped())
}

pub fn to_json(document: &Document) -> Result<String, FerrdiagError> {
    serde_json::to_string_pretty(document).context(JsonSnafu { stage: "document" })
}

pub fn from_json(json: &str) -> Result<Document, FerrdiagError> {
    serde_json::from_str(json).context(JsonSnafu { stage: "document" })
}

/// Writes `document` as a `.drawio` file.
pub fn save_drawio<P: AsRef<Path>>(document: &Document, path: P) -> Result<(), FerrdiagError> {
    let path = path.as_ref();
    std::fs::write(path, to_drawio(document)).context(IoWriteSnafu {
        path: path.display().to_string(),
    })
}

pub fn load_drawio<P: AsRef<Path>>(path: P) -> Result<Document, FerrdiagError> {
    let path = path.as_ref();
    let xml = std::fs::read_to_string(path).context(IoReadSnafu {
        path: path.display().to_string(),
    })?;
    from_drawio(&xml)
}
