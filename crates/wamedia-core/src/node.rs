//! Minimal signaling node tree.
//!
//! The media retry handshake rides on the client's XMPP-like signaling
//! channel, whose stanzas are trees of tagged nodes carrying string
//! attributes and either child nodes or an opaque byte payload. Wire
//! encoding of these trees belongs to the signaling layer; this module
//! only models the tree.

use std::collections::BTreeMap;

/// Content of a [`BinaryNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeContent {
    /// Child nodes.
    Nodes(Vec<BinaryNode>),
    /// Raw byte payload.
    Bytes(Vec<u8>),
}

/// One node of a signaling stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryNode {
    /// Element tag.
    pub tag: String,
    /// Attribute map, ordered for deterministic encoding.
    pub attrs: BTreeMap<String, String>,
    /// Children or payload, if any.
    pub content: Option<NodeContent>,
}

impl BinaryNode {
    /// Create an empty node with the given tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: BTreeMap::new(),
            content: None,
        }
    }

    /// Add an attribute.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Set child nodes as content.
    pub fn with_children(mut self, children: Vec<BinaryNode>) -> Self {
        self.content = Some(NodeContent::Nodes(children));
        self
    }

    /// Set a byte payload as content.
    pub fn with_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.content = Some(NodeContent::Bytes(bytes));
        self
    }

    /// Look up an attribute value.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// The child nodes, or an empty slice for byte/empty content.
    pub fn children(&self) -> &[BinaryNode] {
        match &self.content {
            Some(NodeContent::Nodes(nodes)) => nodes,
            _ => &[],
        }
    }

    /// The first child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&BinaryNode> {
        self.children().iter().find(|node| node.tag == tag)
    }

    /// The byte payload, if this node carries one.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.content {
            Some(NodeContent::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }
}
