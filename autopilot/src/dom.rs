//! Read access to a rendered document.
//!
//! [`DocumentTree`] is what selector generation and matching need from a host.
//! [`DomSnapshot`] is the serialisable implementation hosts ship alongside
//! element-based interaction events.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::model::Rect;
use crate::selector::Selector;

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputedStyle {
    pub display: String,
    pub visibility: String,
    pub opacity: f64,
}

impl Default for ComputedStyle {
    fn default() -> Self {
        Self {
            display: "block".to_string(),
            visibility: "visible".to_string(),
            opacity: 1.0,
        }
    }
}

pub trait DocumentTree: Send + Sync {
    /// The topmost element of the document.
    fn root(&self) -> NodeId;

    /// The `<body>` element, or the root when there is none.
    fn body(&self) -> NodeId;

    fn tag_name(&self, node: NodeId) -> String;

    fn attribute(&self, node: NodeId, name: &str) -> Option<String>;

    /// Attributes in document order.
    fn attributes(&self, node: NodeId) -> Vec<(String, String)>;

    fn parent(&self, node: NodeId) -> Option<NodeId>;

    fn children(&self, node: NodeId) -> Vec<NodeId>;

    /// Own text followed by the text of all descendants.
    fn text_content(&self, node: NodeId) -> String;

    fn computed_style(&self, node: NodeId) -> ComputedStyle;

    fn bounding_rect(&self, node: NodeId) -> Rect;

    fn has_click_handler(&self, node: NodeId) -> bool;

    /// Every element in document order, root first.
    fn elements(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(node) = stack.pop() {
            out.push(node);
            let mut kids = self.children(node);
            kids.reverse();
            stack.extend(kids);
        }
        out
    }

    fn query_all(&self, selector: &Selector) -> Vec<NodeId> {
        self.elements()
            .into_iter()
            .filter(|&node| selector.matches(self, node))
            .collect()
    }

    fn query_count(&self, selector: &Selector) -> usize {
        self.query_all(selector).len()
    }
}

/// Nested, JSON-friendly description of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub tag: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<ComputedStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rect: Option<Rect>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub click_handler: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into().to_lowercase(),
            attributes: IndexMap::new(),
            text: None,
            style: None,
            rect: None,
            click_handler: false,
            children: Vec::new(),
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn id(self, id: impl Into<String>) -> Self {
        self.attr("id", id)
    }

    pub fn class(self, classes: impl Into<String>) -> Self {
        self.attr("class", classes)
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn style(mut self, style: ComputedStyle) -> Self {
        self.style = Some(style);
        self
    }

    pub fn rect(mut self, rect: Rect) -> Self {
        self.rect = Some(rect);
        self
    }

    pub fn on_click(mut self) -> Self {
        self.click_handler = true;
        self
    }

    pub fn child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = NodeSpec>) -> Self {
        self.children.extend(children);
        self
    }
}

const DEFAULT_RECT: Rect = Rect {
    x: 0.0,
    y: 0.0,
    width: 100.0,
    height: 20.0,
};

#[derive(Debug, Clone, PartialEq)]
struct Node {
    tag: String,
    attributes: IndexMap<String, String>,
    text: Option<String>,
    style: ComputedStyle,
    rect: Rect,
    click_handler: bool,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena-backed document snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "NodeSpec", into = "NodeSpec")]
pub struct DomSnapshot {
    nodes: Vec<Node>,
}

impl DomSnapshot {
    pub fn new(root: NodeSpec) -> Self {
        let mut nodes = Vec::new();
        Self::push(&mut nodes, root, None);
        Self { nodes }
    }

    fn push(nodes: &mut Vec<Node>, spec: NodeSpec, parent: Option<NodeId>) -> NodeId {
        let id = nodes.len();
        nodes.push(Node {
            tag: spec.tag.to_lowercase(),
            attributes: spec.attributes,
            text: spec.text,
            style: spec.style.unwrap_or_default(),
            rect: spec.rect.unwrap_or(DEFAULT_RECT),
            click_handler: spec.click_handler,
            parent,
            children: Vec::new(),
        });
        for child in spec.children {
            let child_id = Self::push(nodes, child, Some(id));
            nodes[id].children.push(child_id);
        }
        id
    }

    fn to_spec(&self, id: NodeId) -> NodeSpec {
        let node = &self.nodes[id];
        NodeSpec {
            tag: node.tag.clone(),
            attributes: node.attributes.clone(),
            text: node.text.clone(),
            style: Some(node.style.clone()),
            rect: Some(node.rect),
            click_handler: node.click_handler,
            children: node.children.iter().map(|&c| self.to_spec(c)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node < self.nodes.len()
    }

    /// First element matching a selector string.
    pub fn select(&self, selector: &str) -> Option<NodeId> {
        self.query_all(&Selector::from(selector)).into_iter().next()
    }

    pub fn find_by_id(&self, id: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.attributes.get("id").map(String::as_str) == Some(id))
    }
}

impl From<NodeSpec> for DomSnapshot {
    fn from(spec: NodeSpec) -> Self {
        DomSnapshot::new(spec)
    }
}

impl From<DomSnapshot> for NodeSpec {
    fn from(snapshot: DomSnapshot) -> Self {
        if snapshot.nodes.is_empty() {
            return NodeSpec::new("html");
        }
        snapshot.to_spec(0)
    }
}

impl DocumentTree for DomSnapshot {
    fn root(&self) -> NodeId {
        0
    }

    fn body(&self) -> NodeId {
        self.nodes.iter().position(|n| n.tag == "body").unwrap_or(0)
    }

    fn tag_name(&self, node: NodeId) -> String {
        self.nodes[node].tag.clone()
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.nodes[node].attributes.get(name).cloned()
    }

    fn attributes(&self, node: NodeId) -> Vec<(String, String)> {
        self.nodes[node]
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node].parent
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes[node].children.clone()
    }

    fn text_content(&self, node: NodeId) -> String {
        let mut out = self.nodes[node].text.clone().unwrap_or_default();
        for &child in &self.nodes[node].children {
            out.push_str(&self.text_content(child));
        }
        out
    }

    fn computed_style(&self, node: NodeId) -> ComputedStyle {
        self.nodes[node].style.clone()
    }

    fn bounding_rect(&self, node: NodeId) -> Rect {
        self.nodes[node].rect
    }

    fn has_click_handler(&self, node: NodeId) -> bool {
        self.nodes[node].click_handler
    }

    fn elements(&self) -> Vec<NodeId> {
        // Nodes are pushed depth-first, so arena order is document order.
        (0..self.nodes.len()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> DomSnapshot {
        DomSnapshot::new(
            NodeSpec::new("html").child(
                NodeSpec::new("body")
                    .child(NodeSpec::new("div").id("app").child(NodeSpec::new("span").text("a")))
                    .child(NodeSpec::new("p").text("b")),
            ),
        )
    }

    #[test]
    fn arena_order_is_document_order() {
        let doc = page();
        let tags: Vec<String> = doc.elements().into_iter().map(|n| doc.tag_name(n)).collect();
        assert_eq!(tags, ["html", "body", "div", "span", "p"]);
        assert_eq!(doc.body(), 1);
        assert_eq!(doc.text_content(1), "ab");
    }

    #[test]
    fn snapshot_json_uses_nested_form() {
        let json = r#"{"tag":"body","children":[{"tag":"BUTTON","attributes":{"id":"go"},"text":"Go"}]}"#;
        let doc: DomSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.tag_name(1), "button");
        assert_eq!(doc.find_by_id("go"), Some(1));
        assert!(doc.bounding_rect(1).has_area());
        assert_eq!(doc.computed_style(1), ComputedStyle::default());
    }

    #[test]
    fn attributes_keep_document_order() {
        let json = r#"{"tag":"input","attributes":{"type":"text","data-z":"1","data-a":"2","id":"q"}}"#;
        let doc: DomSnapshot = serde_json::from_str(json).unwrap();
        let names: Vec<String> = doc.attributes(0).into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["type", "data-z", "data-a", "id"]);

        let round_trip = serde_json::to_string(&NodeSpec::from(doc)).unwrap();
        assert!(round_trip.starts_with(r#"{"tag":"input","attributes":{"type":"text","data-z":"1","data-a":"2","id":"q"}"#));
    }
}
