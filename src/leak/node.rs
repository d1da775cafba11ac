//! Open-resource graph.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::debug;

use super::{CreationContext, LeakReport, LeakSink};
use crate::advice::ResourceKind;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Indentation added per tree level in dumps.
const DUMP_INDENT: &str = "   ";

/// One tracked resource and the children it currently has open.
///
/// A node is created when its delegate resource is returned, attached to
/// its parent right away, and detached once the delegate closed
/// successfully.
#[derive(Debug)]
pub struct ResourceNode {
    id: u64,
    /// `None` for the factory at the root of the graph.
    kind: Option<ResourceKind>,
    label: String,
    context: CreationContext,
    children: DashMap<u64, Arc<ResourceNode>>,
    parent: Weak<ResourceNode>,
    leak_reported: AtomicBool,
}

impl ResourceNode {
    /// Root node standing for a connection factory.
    pub fn root(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            kind: None,
            label: label.into(),
            context: CreationContext::capture(),
            children: DashMap::new(),
            parent: Weak::new(),
            leak_reported: AtomicBool::new(false),
        })
    }

    /// Create a node for a new child resource and register it with `self`.
    pub fn attach_child(self: &Arc<Self>, kind: ResourceKind, detail: Option<String>) -> Arc<Self> {
        let id = NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed);
        let label = match detail {
            Some(detail) => format!("{kind}#{id} ({detail})"),
            None => format!("{kind}#{id}"),
        };
        let child = Arc::new(Self {
            id,
            kind: Some(kind),
            label,
            context: CreationContext::capture(),
            children: DashMap::new(),
            parent: Arc::downgrade(self),
            leak_reported: AtomicBool::new(false),
        });
        self.children.insert(id, Arc::clone(&child));
        debug!(parent = %self.label, child = %child.label, "Registered open resource");
        child
    }

    /// Unregister from the parent. Detaching twice is a no-op.
    pub fn detach(&self) {
        if let Some(parent) = self.parent.upgrade() {
            if parent.children.remove(&self.id).is_some() {
                debug!(parent = %parent.label, child = %self.label, "Unregistered open resource");
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> Option<ResourceKind> {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn context(&self) -> &CreationContext {
        &self.context
    }

    pub fn is_registered(&self) -> bool {
        self.parent
            .upgrade()
            .is_some_and(|parent| parent.children.contains_key(&self.id))
    }

    /// Snapshot of the open children, oldest first.
    pub fn open_children(&self) -> Vec<Arc<ResourceNode>> {
        let mut children: Vec<_> = self.children.iter().map(|e| Arc::clone(e.value())).collect();
        children.sort_by_key(|c| c.id);
        children
    }

    pub fn open_child_count(&self) -> usize {
        self.children.len()
    }

    /// Report every child still open to `sink`, each child at most once.
    /// Returns how many were reported by this call.
    pub fn report_leaks(&self, sink: &dyn LeakSink) -> usize {
        let open = self.open_children();
        let mut reported = 0;
        for child in &open {
            if child.leak_reported.swap(true, Ordering::AcqRel) {
                continue;
            }
            sink.leak_detected(&LeakReport {
                parent: self.label.clone(),
                child: child.label.clone(),
                child_kind: child.kind,
                open_children: open.len(),
                context: child.context.clone(),
            });
            reported += 1;
        }
        reported
    }

    /// `<indent><label> - <creation context>`.
    pub fn dump(&self, indent: &str) -> String {
        format!("{indent}{} - {}", self.label, self.context.dump(indent))
    }

    /// Dump every open descendant, level by level, indented by depth.
    pub fn dump_all_open(&self) -> Vec<String> {
        let mut dumps = Vec::new();
        let mut pending: VecDeque<(Arc<ResourceNode>, usize)> =
            self.open_children().into_iter().map(|c| (c, 0)).collect();
        while let Some((node, depth)) = pending.pop_front() {
            dumps.push(node.dump(&DUMP_INDENT.repeat(depth)));
            pending.extend(node.open_children().into_iter().map(|c| (c, depth + 1)));
        }
        dumps
    }
}
