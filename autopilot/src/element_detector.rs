//! Selector generation for recorded elements.
//!
//! Candidates are tried in priority order (`#id`, `data-*` attributes, stable
//! classes, `aria-label`, button/link text) and the first one that matches
//! exactly one element wins. When none does, a positional path from the body
//! is returned without re-validation.

use std::collections::BTreeMap;

use tracing::debug;

use crate::dom::{DocumentTree, NodeId};
use crate::model::ElementInfo;
use crate::selector::{is_ident, same_tag_index, PathSegment, Selector};

const CLICKABLE_INPUT_TYPES: [&str; 5] = ["button", "submit", "reset", "radio", "checkbox"];
const RELEVANT_ATTRIBUTES: [&str; 6] = ["id", "class", "name", "type", "role", "aria-label"];

#[derive(Debug, Clone, Default)]
pub struct ElementDetector;

impl ElementDetector {
    pub fn new() -> Self {
        Self
    }

    /// Candidate selectors for `node`, highest priority first.
    pub fn candidates<D: DocumentTree + ?Sized>(&self, doc: &D, node: NodeId) -> Vec<Selector> {
        let mut out = Vec::new();

        if let Some(id) = doc.attribute(node, "id").filter(|v| !v.is_empty()) {
            if is_ident(&id) {
                out.push(Selector::Id(id));
            } else {
                out.push(Selector::Attribute {
                    name: "id".to_string(),
                    value: id,
                });
            }
        }

        for (name, value) in doc.attributes(node) {
            if name.starts_with("data-") && is_ident(&name) {
                out.push(Selector::Attribute { name, value });
            }
        }

        if let Some(class) = doc.attribute(node, "class") {
            let stable: Vec<String> = class
                .split_whitespace()
                .filter(|c| is_ident(c))
                .map(str::to_string)
                .collect();
            if !stable.is_empty() {
                out.push(Selector::Classes(stable));
            }
        }

        if let Some(label) = doc.attribute(node, "aria-label").filter(|v| !v.is_empty()) {
            out.push(Selector::Attribute {
                name: "aria-label".to_string(),
                value: label,
            });
        }

        let tag = doc.tag_name(node);
        if tag == "button" || tag == "a" {
            let text = doc.text_content(node);
            let text = text.trim();
            if !text.is_empty() {
                out.push(Selector::TagText {
                    tag,
                    text: text.to_string(),
                });
            }
        }

        out
    }

    /// Produces a selector for `node`, unique in `doc` whenever a candidate allows it.
    pub fn generate_selector<D: DocumentTree + ?Sized>(&self, doc: &D, node: NodeId) -> String {
        for candidate in self.candidates(doc, node) {
            let count = doc.query_count(&candidate);
            if count == 1 {
                return candidate.to_string();
            }
            debug!(selector = %candidate, count, "selector candidate is not unique");
        }
        self.positional_selector(doc, node).to_string()
    }

    /// Path from the body down to `node`, stopping early at the nearest ancestor with an id.
    pub fn positional_selector<D: DocumentTree + ?Sized>(&self, doc: &D, node: NodeId) -> Selector {
        let body = doc.body();
        if node == body {
            return Selector::Path(vec![PathSegment::Tag {
                tag: doc.tag_name(body),
                nth: None,
            }]);
        }

        let mut path = Vec::new();
        let mut current = Some(node);
        while let Some(n) = current {
            if n == body {
                break;
            }
            if let Some(id) = doc.attribute(n, "id").filter(|v| is_ident(v)) {
                path.push(PathSegment::Id(id));
                break;
            }
            let (index, total) = same_tag_index(doc, n);
            path.push(PathSegment::Tag {
                tag: doc.tag_name(n),
                nth: (total > 1).then_some(index),
            });
            current = doc.parent(n);
        }
        path.reverse();
        Selector::Path(path)
    }

    pub fn is_visible<D: DocumentTree + ?Sized>(&self, doc: &D, node: NodeId) -> bool {
        let style = doc.computed_style(node);
        style.display != "none"
            && style.visibility != "hidden"
            && style.opacity != 0.0
            && doc.bounding_rect(node).has_area()
    }

    pub fn is_clickable<D: DocumentTree + ?Sized>(&self, doc: &D, node: NodeId) -> bool {
        let tag = doc.tag_name(node);
        if tag == "button" || tag == "a" {
            return true;
        }
        if tag == "input" {
            // An input without a type attribute is a text field.
            let kind = doc
                .attribute(node, "type")
                .unwrap_or_default()
                .to_lowercase();
            if CLICKABLE_INPUT_TYPES.contains(&kind.as_str()) {
                return true;
            }
        }
        doc.has_click_handler(node) || doc.attribute(node, "role").as_deref() == Some("button")
    }

    pub fn analyze_element<D: DocumentTree + ?Sized>(&self, doc: &D, node: NodeId) -> ElementInfo {
        let attributes: BTreeMap<String, String> = RELEVANT_ATTRIBUTES
            .iter()
            .filter_map(|name| {
                doc.attribute(node, name)
                    .filter(|v| !v.is_empty())
                    .map(|v| (name.to_string(), v))
            })
            .collect();

        ElementInfo {
            selector: self.generate_selector(doc, node),
            tag: doc.tag_name(node),
            input_type: doc.attribute(node, "type").unwrap_or_default(),
            visible: self.is_visible(doc, node),
            clickable: self.is_clickable(doc, node),
            attributes,
            position: doc.bounding_rect(node),
        }
    }
}
