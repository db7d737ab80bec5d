//! Arena-backed document tree.
//!
//! Every node lives in a single `Vec` owned by [`DocumentTree`]; children are
//! held as ordered [`NodeId`] lists and the parent link is a plain index, so the
//! whole tree is dropped in one go with no reference cycles.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Synthetic group labels, in the order groups are appended to their owner.
pub const CATEGORY_LABELS: [&str; 3] = ["PEDA", "DOCS", "EVALS"];

/// A category group: the substring that routes a child into it and the
/// label of the synthetic node that collects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Peda,
    Docs,
    Evals,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Peda, Category::Docs, Category::Evals];

    pub fn label(self) -> &'static str {
        match self {
            Category::Peda => "PEDA",
            Category::Docs => "DOCS",
            Category::Evals => "EVALS",
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            Category::Peda => "_peda_",
            Category::Docs => "_doc_",
            Category::Evals => "_eval_",
        }
    }

    /// First category whose marker occurs in `name`.
    pub fn classify(name: &str) -> Option<Category> {
        Self::ALL.into_iter().find(|c| name.contains(c.marker()))
    }
}

/// True when `name` is exactly one of the synthetic group labels.
pub fn is_category_label(name: &str) -> bool {
    CATEGORY_LABELS.contains(&name)
}

/// Tri-state selection value.
///
/// The integer codes are the persisted encoding (`checkStates` in the
/// settings file): 0 unchecked, 1 partially checked, 2 checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CheckState {
    #[default]
    Unchecked,
    PartiallyChecked,
    Checked,
}

impl CheckState {
    pub fn code(self) -> u8 {
        match self {
            CheckState::Unchecked => 0,
            CheckState::PartiallyChecked => 1,
            CheckState::Checked => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CheckState::Unchecked),
            1 => Some(CheckState::PartiallyChecked),
            2 => Some(CheckState::Checked),
            _ => None,
        }
    }

    pub fn from_checked(checked: bool) -> Self {
        if checked {
            CheckState::Checked
        } else {
            CheckState::Unchecked
        }
    }

    /// Marker used by the text renderer.
    pub fn marker(self) -> &'static str {
        match self {
            CheckState::Unchecked => "[ ]",
            CheckState::PartiallyChecked => "[-]",
            CheckState::Checked => "[x]",
        }
    }
}

impl From<CheckState> for u8 {
    fn from(state: CheckState) -> u8 {
        state.code()
    }
}

impl TryFrom<u8> for CheckState {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        CheckState::from_code(code).ok_or_else(|| format!("invalid check state code {code}"))
    }
}

/// Aggregate the states of a node's children into the node's own state.
///
/// Checked when every child is checked, unchecked when every child is
/// unchecked, partially checked otherwise. Returns `None` for an empty set:
/// a leaf's state is never derived.
pub fn aggregate<I>(children: I) -> Option<CheckState>
where
    I: IntoIterator<Item = CheckState>,
{
    let mut total = 0usize;
    let mut checked = 0usize;
    let mut unchecked = 0usize;
    for state in children {
        total += 1;
        match state {
            CheckState::Checked => checked += 1,
            CheckState::Unchecked => unchecked += 1,
            CheckState::PartiallyChecked => {}
        }
    }
    if total == 0 {
        None
    } else if checked == total {
        Some(CheckState::Checked)
    } else if unchecked == total {
        Some(CheckState::Unchecked)
    } else {
        Some(CheckState::PartiallyChecked)
    }
}

/// Stable handle to a node inside one [`DocumentTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct DocumentNode {
    /// Display label: file stem, or the fixed label of a category group.
    pub name: String,
    /// Absolute source path. Category groups carry their owner's path.
    pub path: PathBuf,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    pub check_state: CheckState,
}

impl DocumentNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_category(&self) -> bool {
        is_category_label(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct DocumentTree {
    nodes: Vec<DocumentNode>,
    root: NodeId,
}

impl DocumentTree {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let root = DocumentNode {
            name: name.into(),
            path: path.into(),
            children: Vec::new(),
            parent: None,
            check_state: CheckState::Unchecked,
        };
        Self {
            nodes: vec![root],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &DocumentNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut DocumentNode {
        &mut self.nodes[id.0]
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn path(&self, id: NodeId) -> &Path {
        &self.nodes[id.0].path
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn state(&self, id: NodeId) -> CheckState {
        self.nodes[id.0].check_state
    }

    /// Allocate a detached node. It becomes part of the tree once attached.
    pub fn alloc(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(DocumentNode {
            name: name.into(),
            path: path.into(),
            children: Vec::new(),
            parent: None,
            check_state: CheckState::Unchecked,
        });
        id
    }

    /// Append `child` to `parent`'s children and point it back at `parent`.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> NodeId {
        let id = self.alloc(name, path);
        self.attach(parent, id);
        id
    }

    /// Replace `parent`'s child list wholesale, re-pointing every new child.
    pub fn set_children(&mut self, parent: NodeId, children: Vec<NodeId>) {
        for &child in &children {
            self.nodes[child.0].parent = Some(parent);
        }
        self.nodes[parent.0].children = children;
    }

    /// Pre-order walk of the subtree rooted at `start` (inclusive).
    pub fn descendants(&self, start: NodeId) -> Descendants<'_> {
        Descendants {
            tree: self,
            stack: vec![start],
        }
    }

    /// Post-order list of the subtree rooted at `start`: children before parents.
    pub fn post_order(&self, start: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![(start, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            stack.push((id, true));
            for &child in self.children(id).iter().rev() {
                stack.push((child, false));
            }
        }
        out
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(id), move |&p| self.parent(p))
    }

    pub fn depth(&self, id: NodeId) -> usize {
        self.ancestors(id).count()
    }

    /// Aggregate of `id`'s children's current states, `None` for a leaf.
    pub fn children_aggregate(&self, id: NodeId) -> Option<CheckState> {
        aggregate(self.children(id).iter().map(|&c| self.state(c)))
    }

    /// First node (pre-order) whose path equals `path`.
    pub fn find_by_path(&self, path: &Path) -> Option<NodeId> {
        self.descendants(self.root)
            .find(|&id| !self.path(id).as_os_str().is_empty() && self.path(id) == path)
    }

    /// First node (pre-order) whose name equals `name`.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.descendants(self.root).find(|&id| self.name(id) == name)
    }

    /// Indented text rendering with check markers.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for id in self.descendants(self.root) {
            let node = self.node(id);
            let indent = "  ".repeat(self.depth(id));
            out.push_str(&format!("{indent}{} {}", node.check_state.marker(), node.name));
            if !node.is_category() && !node.path.as_os_str().is_empty() {
                out.push_str(&format!("  ({})", node.path.display()));
            }
            out.push('\n');
        }
        out
    }
}

pub struct Descendants<'a> {
    tree: &'a DocumentTree,
    stack: Vec<NodeId>,
}

impl Iterator for Descendants<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        self.stack
            .extend(self.tree.children(id).iter().rev().copied());
        Some(id)
    }
}
