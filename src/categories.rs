//! Regroup sibling fragments into synthetic `PEDA` / `DOCS` / `EVALS` nodes.

use crate::tree::{Category, DocumentTree, NodeId};

/// Reorganize the subtree rooted at `start` in place.
///
/// Children whose name carries a category marker are moved under one group
/// node per category, appended after the unmatched children. Group nodes never
/// have their direct children regrouped, but the walk still descends through
/// them so deeper levels get the ordinary treatment. Running it twice leaves
/// the tree unchanged.
pub fn reorganize(tree: &mut DocumentTree, start: NodeId) {
    let mut work = vec![start];
    while let Some(id) = work.pop() {
        if !tree.node(id).is_category() {
            regroup(tree, id);
        }
        work.extend(tree.children(id).iter().copied());
    }
}

/// Regroup the direct children of `id`. Returns true when groups were created.
fn regroup(tree: &mut DocumentTree, id: NodeId) -> bool {
    let mut others = Vec::new();
    let mut buckets: [Vec<NodeId>; 3] = Default::default();
    for &child in tree.children(id) {
        match Category::classify(tree.name(child)) {
            Some(category) => buckets[category as usize].push(child),
            None => others.push(child),
        }
    }

    if buckets.iter().all(Vec::is_empty) {
        return false;
    }

    let owner_path = tree.path(id).to_path_buf();
    let mut children = others;
    for (category, members) in Category::ALL.into_iter().zip(buckets) {
        if members.is_empty() {
            continue;
        }
        let group = tree.alloc(category.label(), owner_path.clone());
        tree.set_children(group, members);
        if let Some(state) = tree.children_aggregate(group) {
            tree.node_mut(group).check_state = state;
        }
        children.push(group);
    }
    tree.set_children(id, children);
    true
}
