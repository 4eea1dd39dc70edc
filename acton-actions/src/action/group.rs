//! Action and handler trees with explicit recursive-descent flattening.
//!
//! Groups are tagged-union trees: a node is either a leaf definition or a
//! named sub-group. Handler trees mirror the group shape, which lets
//! `register_handlers` match each leaf function to its action by flattened
//! path alone — the handler tree never carries action names. Both trees
//! flatten with the same traversal, so structural correspondence is
//! guaranteed by construction.

use super::props::{ActionArgs, ActionHandler, ActionReply, HandlerFuture};
use super::ActionDef;
use crate::error::ActionResult;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A node in an action group tree.
#[derive(Debug, Clone)]
pub enum ActionNode {
    /// A single action definition.
    Leaf(ActionDef),
    /// A named collection of nested nodes.
    Group(BTreeMap<String, ActionNode>),
}

impl From<ActionDef> for ActionNode {
    fn from(def: ActionDef) -> Self {
        Self::Leaf(def)
    }
}

/// Build a group node from `(key, node)` entries.
///
/// The identity-style constructor for action namespaces; it performs no
/// registration, only structure.
#[must_use]
pub fn group<K, I>(entries: I) -> ActionNode
where
    K: Into<String>,
    I: IntoIterator<Item = (K, ActionNode)>,
{
    ActionNode::Group(
        entries
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect(),
    )
}

/// A node in a handler tree mirroring an action group's shape.
pub enum HandlerNode {
    /// A handler function for the action at the same path.
    Leaf(ActionHandler),
    /// A named collection of nested nodes.
    Group(BTreeMap<String, HandlerNode>),
}

impl std::fmt::Debug for HandlerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leaf(_) => f.write_str("Leaf(<handler>)"),
            Self::Group(map) => f.debug_map().entries(map.iter()).finish(),
        }
    }
}

/// Build a handler group node from `(key, node)` entries.
#[must_use]
pub fn handler_group<K, I>(entries: I) -> HandlerNode
where
    K: Into<String>,
    I: IntoIterator<Item = (K, HandlerNode)>,
{
    HandlerNode::Group(
        entries
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect(),
    )
}

/// Wrap an async function into a handler leaf.
///
/// The function receives [`ActionArgs`] (input, context, and the per-call
/// helpers injected at dispatch time) and returns the action's reply.
#[must_use]
pub fn handler<F, Fut>(f: F) -> HandlerNode
where
    F: Fn(ActionArgs) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ActionResult<ActionReply>> + Send + 'static,
{
    let wrapped: ActionHandler = Arc::new(move |args: ActionArgs| -> HandlerFuture {
        Box::pin(f(args))
    });
    HandlerNode::Leaf(wrapped)
}

/// Flatten an action group into `(dotted path, definition)` pairs.
pub(crate) fn flatten_group(node: &ActionNode) -> Vec<(String, ActionDef)> {
    let mut out = Vec::new();
    descend_group(node, None, &mut out);
    out
}

fn descend_group(node: &ActionNode, prefix: Option<&str>, out: &mut Vec<(String, ActionDef)>) {
    match node {
        ActionNode::Leaf(def) => {
            // A bare leaf at the root has no path; modules always wrap
            // definitions in at least one group level.
            out.push((prefix.unwrap_or_default().to_string(), def.clone()));
        }
        ActionNode::Group(entries) => {
            for (key, child) in entries {
                let path = prefix.map_or_else(|| key.clone(), |p| format!("{p}.{key}"));
                descend_group(child, Some(&path), out);
            }
        }
    }
}

/// Flatten a handler tree into `(dotted path, handler)` pairs.
pub(crate) fn flatten_handlers(node: HandlerNode) -> Vec<(String, ActionHandler)> {
    let mut out = Vec::new();
    descend_handlers(node, None, &mut out);
    out
}

fn descend_handlers(
    node: HandlerNode,
    prefix: Option<&str>,
    out: &mut Vec<(String, ActionHandler)>,
) {
    match node {
        HandlerNode::Leaf(h) => {
            out.push((prefix.unwrap_or_default().to_string(), h));
        }
        HandlerNode::Group(entries) => {
            for (key, child) in entries {
                let path = prefix.map_or_else(|| key.clone(), |p| format!("{p}.{key}"));
                descend_handlers(child, Some(&path), out);
            }
        }
    }
}
