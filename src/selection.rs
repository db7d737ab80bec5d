//! Tri-state selection over a [`DocumentTree`].
//!
//! Mutations return the ids of the nodes a view would have to repaint, in the
//! order the changes were made.

use crate::error::Result;
use crate::parser;
use crate::tree::{CheckState, DocumentTree, NodeId};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Persisted selection: absolute source path -> state.
pub type CheckStateMap = BTreeMap<String, CheckState>;

#[derive(Debug, Default)]
pub struct SelectionModel {
    tree: Option<DocumentTree>,
}

impl SelectionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tree(tree: DocumentTree) -> Self {
        Self { tree: Some(tree) }
    }

    /// Parse `path` and replace the current tree.
    ///
    /// The previous tree is dropped before parsing starts; on failure the
    /// model is left empty.
    pub fn load_from_file(&mut self, path: &Path) -> Result<()> {
        self.tree = None;
        let tree = parser::parse(path, None)?;
        debug!(
            children = tree.children(tree.root()).len(),
            "selection model loaded"
        );
        self.tree = Some(tree);
        Ok(())
    }

    pub fn has_data(&self) -> bool {
        self.tree.is_some()
    }

    pub fn tree(&self) -> Option<&DocumentTree> {
        self.tree.as_ref()
    }

    /// Checkbox click on `node`.
    ///
    /// A partially checked node never stays partial: anything other than
    /// `Unchecked` lands on `Checked`. The state is pushed down to every
    /// descendant, then ancestors are re-aggregated until one is unchanged.
    pub fn set_check_state(&mut self, node: NodeId, desired: CheckState) -> Vec<NodeId> {
        let Some(tree) = self.tree.as_mut() else {
            return Vec::new();
        };

        let desired = match desired {
            CheckState::Unchecked => CheckState::Unchecked,
            _ => CheckState::Checked,
        };

        let subtree: Vec<NodeId> = tree.descendants(node).collect();
        for &id in &subtree {
            tree.node_mut(id).check_state = desired;
        }
        let parent = tree.parent(node);
        let mut changed = subtree;
        update_parent_state(tree, parent, &mut changed);
        changed
    }

    /// Set the whole subtree at `node` to checked or unchecked, then bring
    /// its ancestors back in line.
    pub fn select_subtree(&mut self, node: NodeId, checked: bool) -> Vec<NodeId> {
        let Some(tree) = self.tree.as_mut() else {
            return Vec::new();
        };

        let state = CheckState::from_checked(checked);
        let subtree: Vec<NodeId> = tree.descendants(node).collect();
        let mut changed = Vec::new();
        for id in subtree {
            if tree.state(id) != state {
                tree.node_mut(id).check_state = state;
                changed.push(id);
            }
        }
        let parent = tree.parent(node);
        update_parent_state(tree, parent, &mut changed);
        changed
    }

    /// Snapshot every independently restorable node.
    pub fn save_state(&self) -> CheckStateMap {
        let mut out = CheckStateMap::new();
        let Some(tree) = self.tree.as_ref() else {
            return out;
        };
        for id in tree.descendants(tree.root()) {
            if let Some(key) = state_key(tree, id) {
                out.insert(key, tree.state(id));
            }
        }
        out
    }

    /// Apply a saved snapshot, then recompute every interior node from its
    /// children so the result is consistent whatever shape the snapshot came
    /// from. Paths missing from the snapshot keep their current state.
    pub fn restore_state(&mut self, saved: &CheckStateMap) -> Vec<NodeId> {
        let Some(tree) = self.tree.as_mut() else {
            return Vec::new();
        };

        let before: Vec<(NodeId, CheckState)> = tree
            .descendants(tree.root())
            .map(|id| (id, tree.state(id)))
            .collect();
        for &(id, _) in &before {
            let Some(key) = state_key(tree, id) else {
                continue;
            };
            if let Some(&state) = saved.get(&key) {
                let state = if tree.node(id).is_leaf() && state == CheckState::PartiallyChecked {
                    CheckState::Unchecked
                } else {
                    state
                };
                tree.node_mut(id).check_state = state;
            }
        }

        for id in tree.post_order(tree.root()) {
            if let Some(state) = tree.children_aggregate(id) {
                tree.node_mut(id).check_state = state;
            }
        }

        before
            .into_iter()
            .filter(|&(id, state)| tree.state(id) != state)
            .map(|(id, _)| id)
            .collect()
    }

    /// True when every interior node equals the aggregate of its children.
    pub fn is_consistent(&self) -> bool {
        let Some(tree) = self.tree.as_ref() else {
            return true;
        };
        tree.descendants(tree.root()).all(|id| match tree.children_aggregate(id) {
            Some(state) => state == tree.state(id),
            None => tree.state(id) != CheckState::PartiallyChecked,
        })
    }
}

/// Re-aggregate from `start` upwards, stopping at the first level whose
/// state does not change.
fn update_parent_state(tree: &mut DocumentTree, start: Option<NodeId>, changed: &mut Vec<NodeId>) {
    let mut current = start;
    while let Some(id) = current {
        let Some(state) = tree.children_aggregate(id) else {
            break;
        };
        if state == tree.state(id) {
            break;
        }
        tree.node_mut(id).check_state = state;
        changed.push(id);
        current = tree.parent(id);
    }
}

/// Persistence key for `id`: its path, unless empty or shared with the parent
/// (category groups carry their owner's path).
fn state_key(tree: &DocumentTree, id: NodeId) -> Option<String> {
    let path = tree.path(id);
    if path.as_os_str().is_empty() {
        return None;
    }
    if let Some(parent) = tree.parent(id) {
        if tree.path(parent) == path {
            return None;
        }
    }
    Some(path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::reorganize;
    use CheckState::*;

    struct Fixture {
        model: SelectionModel,
        ch1: NodeId,
        intro: NodeId,
        peda_a: NodeId,
        ch2: NodeId,
    }

    /// main
    ///   ch1_cours
    ///     ch1_intro
    ///     PEDA
    ///       ch1_peda_a
    ///       ch1_peda_b
    ///   ch2_cours
    ///     ch2_intro
    fn fixture() -> Fixture {
        let mut tree = DocumentTree::new("main", "/d/main.tex");
        let root = tree.root();
        let ch1 = tree.add_child(root, "ch1_cours", "/d/ch1_cours.tex");
        let intro = tree.add_child(ch1, "ch1_intro", "/d/ch1_intro.tex");
        let peda_a = tree.add_child(ch1, "ch1_peda_a", "/d/ch1_peda_a.tex");
        tree.add_child(ch1, "ch1_peda_b", "/d/ch1_peda_b.tex");
        let ch2 = tree.add_child(root, "ch2_cours", "/d/ch2_cours.tex");
        tree.add_child(ch2, "ch2_intro", "/d/ch2_intro.tex");
        reorganize(&mut tree, root);
        Fixture {
            model: SelectionModel::from_tree(tree),
            ch1,
            intro,
            peda_a,
            ch2,
        }
    }

    fn states(model: &SelectionModel) -> Vec<CheckState> {
        let tree = model.tree().unwrap();
        tree.descendants(tree.root()).map(|id| tree.state(id)).collect()
    }

    #[test]
    fn checking_a_leaf_makes_ancestors_partial() {
        let mut f = fixture();
        f.model.set_check_state(f.peda_a, Checked);
        let tree = f.model.tree().unwrap();
        let peda = tree.parent(f.peda_a).unwrap();
        assert_eq!(tree.name(peda), "PEDA");
        assert_eq!(tree.state(peda), PartiallyChecked);
        assert_eq!(tree.state(f.ch1), PartiallyChecked);
        assert_eq!(tree.state(tree.root()), PartiallyChecked);
        assert_eq!(tree.state(f.ch2), Unchecked);
        assert!(f.model.is_consistent());
    }

    #[test]
    fn every_single_toggle_keeps_the_tree_consistent() {
        let f = fixture();
        let ids: Vec<NodeId> = {
            let tree = f.model.tree().unwrap();
            tree.descendants(tree.root()).collect()
        };
        let mut model = f.model;
        for (i, &id) in ids.iter().enumerate() {
            let desired = if i % 2 == 0 { Checked } else { Unchecked };
            model.set_check_state(id, desired);
            assert!(model.is_consistent(), "inconsistent after toggling node {i}");
        }
    }

    #[test]
    fn check_then_uncheck_round_trips() {
        let mut f = fixture();
        let before = states(&f.model);
        f.model.set_check_state(f.ch1, Checked);
        assert_ne!(states(&f.model), before);
        f.model.set_check_state(f.ch1, Unchecked);
        assert_eq!(states(&f.model), before);
    }

    #[test]
    fn partial_click_goes_to_checked_with_all_descendants() {
        let mut f = fixture();
        f.model.set_check_state(f.intro, Checked);
        assert_eq!(f.model.tree().unwrap().state(f.ch1), PartiallyChecked);

        for desired in [Checked, PartiallyChecked] {
            f.model.set_check_state(f.ch1, Unchecked);
            f.model.set_check_state(f.intro, Checked);
            f.model.set_check_state(f.ch1, desired);
            let tree = f.model.tree().unwrap();
            assert_eq!(tree.state(f.ch1), Checked);
            assert!(tree.descendants(f.ch1).all(|id| tree.state(id) == Checked));
        }
    }

    #[test]
    fn notifications_cover_subtree_and_changed_ancestors_only() {
        let mut f = fixture();
        let changed = f.model.set_check_state(f.ch2, Checked);
        let tree = f.model.tree().unwrap();
        let ch2_intro = tree.children(f.ch2)[0];
        assert_eq!(changed, vec![f.ch2, ch2_intro, tree.root()]);

        // Root is already partial, so checking ch1's intro stops at ch1.
        let changed = f.model.set_check_state(f.intro, Checked);
        assert_eq!(changed, vec![f.intro, f.ch1]);
    }

    #[test]
    fn select_subtree_reaggregates_ancestors() {
        let mut f = fixture();
        f.model.select_subtree(f.ch2, true);
        let tree = f.model.tree().unwrap();
        assert!(tree.descendants(f.ch2).all(|id| tree.state(id) == Checked));
        assert_eq!(tree.state(tree.root()), PartiallyChecked);
        assert!(f.model.is_consistent());
    }

    #[test]
    fn save_skips_group_nodes_sharing_their_owner_path() {
        let mut f = fixture();
        f.model.set_check_state(f.peda_a, Checked);
        let saved = f.model.save_state();
        assert_eq!(saved.len(), 7, "8 nodes minus the PEDA group");
        assert_eq!(saved["/d/ch1_peda_a.tex"], Checked);
        assert_eq!(saved["/d/ch1_cours.tex"], PartiallyChecked);
    }

    #[test]
    fn restore_of_own_snapshot_reports_no_changes() {
        let mut f = fixture();
        f.model.set_check_state(f.peda_a, Checked);
        f.model.set_check_state(f.ch2, Checked);
        let saved = f.model.save_state();
        assert!(f.model.restore_state(&saved).is_empty());
    }

    #[test]
    fn restore_recomputes_interior_nodes_from_leaves() {
        let mut f = fixture();
        let mut saved = CheckStateMap::new();
        // Stale interior value and an unknown path; only leaves matter.
        saved.insert("/d/ch1_cours.tex".into(), Checked);
        saved.insert("/d/ch1_intro.tex".into(), Checked);
        saved.insert("/d/elsewhere.tex".into(), Checked);
        let changed = f.model.restore_state(&saved);

        let tree = f.model.tree().unwrap();
        assert_eq!(tree.state(f.intro), Checked);
        assert_eq!(tree.state(f.ch1), PartiallyChecked);
        assert_eq!(tree.state(tree.root()), PartiallyChecked);
        assert!(changed.contains(&f.intro));
        assert!(f.model.is_consistent());
    }

    #[test]
    fn restored_partial_leaf_becomes_unchecked() {
        let mut f = fixture();
        let mut saved = CheckStateMap::new();
        saved.insert("/d/ch2_intro.tex".into(), PartiallyChecked);
        f.model.restore_state(&saved);
        assert!(f.model.is_consistent());
        assert_eq!(f.model.tree().unwrap().state(f.ch2), Unchecked);
    }

    #[test]
    fn empty_model_ignores_mutations() {
        let mut model = SelectionModel::new();
        assert!(!model.has_data());
        assert!(model.save_state().is_empty());
        assert!(model.restore_state(&CheckStateMap::new()).is_empty());
    }
}
