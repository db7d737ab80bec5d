//! Turn a selection into a self-contained compilation unit.
//!
//! A unit is the root document's preamble, the configured page setup, then
//! the raw text of each fragment between `\begin{document}` and
//! `\end{document}`. Units are written into a caller-owned scratch directory.

use crate::config::AssemblyConfig;
use crate::error::{BuildError, Result};
use crate::parser::read_source;
use crate::tree::{CheckState, DocumentTree, NodeId};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BODY_OPEN: &str = "\\begin{document}";
const BODY_CLOSE: &str = "\\end{document}";

/// One source file spliced into a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub label: String,
    pub path: PathBuf,
}

/// A first-level subtree compiled on its own by the chapter pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterInfo {
    pub name: String,
    pub path: PathBuf,
    pub files: Vec<Fragment>,
}

/// Every line of `root` before the one holding `\begin{document}`.
pub fn extract_preamble(root: &Path) -> Result<String> {
    let text = read_source(root)?;
    let mut preamble = String::new();
    for line in text.lines() {
        if line.contains(BODY_OPEN) {
            break;
        }
        preamble.push_str(line);
        preamble.push('\n');
    }
    if preamble.is_empty() {
        return Err(BuildError::EmptyPreamble {
            path: root.to_path_buf(),
        });
    }
    Ok(preamble)
}

/// Checked leaves below the root, in tree order. Category groups are walked
/// through but never recorded; paths that no longer exist are dropped.
pub fn collect_selected(tree: &DocumentTree) -> Vec<Fragment> {
    tree.descendants(tree.root())
        .skip(1)
        .filter(|&id| {
            let node = tree.node(id);
            node.is_leaf()
                && !node.is_category()
                && node.check_state == CheckState::Checked
                && node.path.is_file()
        })
        .map(|id| fragment(tree, id))
        .collect()
}

/// First-level subtrees holding at least one checked node, each with *all*
/// of its `.tex` descendants.
///
/// Summary files (name containing `summary_marker`) are left out of the body
/// but their own imports are kept. Chapters that end up with no files are
/// dropped. Order follows the tree.
pub fn collect_chapter_groups(tree: &DocumentTree, summary_marker: &str) -> Vec<ChapterInfo> {
    let root = tree.root();

    let marked: Vec<NodeId> = tree
        .children(root)
        .iter()
        .copied()
        .filter(|&id| !tree.node(id).is_category())
        .filter(|&id| {
            tree.descendants(id)
                .skip(1)
                .any(|d| tree.state(d) == CheckState::Checked)
        })
        .collect();

    let mut chapters = Vec::new();
    for chapter in marked {
        let files: Vec<Fragment> = tree
            .descendants(chapter)
            .skip(1)
            .filter(|&id| is_emittable_source(tree, id, summary_marker))
            .map(|id| fragment(tree, id))
            .collect();

        if files.is_empty() {
            debug!(chapter = tree.name(chapter), "chapter has no files, skipped");
            continue;
        }
        chapters.push(ChapterInfo {
            name: tree.name(chapter).to_string(),
            path: tree.path(chapter).to_path_buf(),
            files,
        });
    }
    chapters
}

/// Every existing `.tex` fragment of the document, checked or not.
///
/// Category groups and summary files are routing nodes: they are walked
/// through without being emitted. Any other file is emitted whole, so its
/// imports are not emitted a second time. A file missing from disk is walked
/// through like a routing node.
pub fn collect_all_document_files(tree: &DocumentTree, summary_marker: &str) -> Vec<Fragment> {
    let mut out = Vec::new();
    let mut stack: Vec<NodeId> = tree.children(tree.root()).iter().rev().copied().collect();
    while let Some(id) = stack.pop() {
        let routing = tree.node(id).is_category() || is_summary(tree.path(id), summary_marker);
        if routing {
            stack.extend(tree.children(id).iter().rev().copied());
            continue;
        }
        if is_tex_file(tree.path(id)) {
            out.push(fragment(tree, id));
        } else {
            // Gone from disk: its imports may still be there.
            stack.extend(tree.children(id).iter().rev().copied());
        }
    }
    out
}

/// Render and write a unit for `fragments` into `scratch_dir`.
///
/// The file is named `temp_<label>_<yyyyMMdd_HHmmss>.tex`; when that name is
/// taken a numeric suffix is added. Image search paths are resolved against
/// the directory of `root`.
pub fn build_unit(
    preamble: &str,
    fragments: &[Fragment],
    root: &Path,
    scratch_dir: &Path,
    label: &str,
    cfg: &AssemblyConfig,
) -> Result<PathBuf> {
    if fragments.is_empty() {
        return Err(BuildError::NoSelection(format!("no fragments for `{label}`")));
    }
    if !scratch_dir.is_dir() {
        return Err(BuildError::ScratchUnavailable {
            path: scratch_dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        });
    }

    let unit_path = scratch_path(scratch_dir, label);
    let text = render_unit(preamble, fragments, root, cfg);
    std::fs::write(&unit_path, text).map_err(|source| BuildError::ScratchUnavailable {
        path: unit_path.clone(),
        source,
    })?;

    debug!(unit = %unit_path.display(), fragments = fragments.len(), "unit written");
    Ok(unit_path)
}

/// The full text of a unit. Fragments that cannot be read are left out.
pub fn render_unit(
    preamble: &str,
    fragments: &[Fragment],
    root: &Path,
    cfg: &AssemblyConfig,
) -> String {
    let root_dir = root.parent().unwrap_or_else(|| Path::new(""));
    let root_dir = root_dir.to_string_lossy().replace('\\', "/");

    let mut out = String::with_capacity(preamble.len() + 1024);
    out.push_str(preamble);

    out.push_str("% Image search paths\n\\graphicspath{");
    for dir in &cfg.image_dirs {
        out.push_str(&format!("{{{root_dir}/{}/}}", dir.trim_end_matches('/')));
    }
    out.push_str("}\n\n");

    for line in &cfg.page_setup {
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');

    out.push_str(BODY_OPEN);
    out.push_str("\n\n");
    out.push_str(&cfg.body_setup);
    out.push_str("\n\n");

    for frag in fragments {
        match read_source(&frag.path) {
            Ok(content) => {
                out.push_str(&format!("% Source file: {}\n", frag.path.display()));
                out.push_str(&content);
                out.push_str("\n\n");
            }
            Err(e) => warn!("{e}"),
        }
    }

    out.push_str(BODY_CLOSE);
    out.push('\n');
    out
}

/// Chapter label used in scratch and artifact names: the summary marker is
/// removed and the rest made filename-safe.
pub fn chapter_slug(name: &str, summary_marker: &str) -> String {
    let stripped = if summary_marker.is_empty() {
        name.to_string()
    } else {
        name.replace(summary_marker, "")
    };
    let slug = sanitize_for_filename(&stripped);
    if slug.is_empty() {
        "chapter".to_string()
    } else {
        slug
    }
}

pub fn sanitize_for_filename(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch.is_alphanumeric() || ch == '_' || ch == '-' || ch == '.' {
            out.push(ch);
        } else if ch.is_whitespace() {
            out.push('_');
        } else {
            out.push('-');
        }
    }
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    out.trim_matches('_').to_string()
}

fn scratch_path(dir: &Path, label: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let stem = format!("temp_{}_{stamp}", sanitize_for_filename(label));
    let mut candidate = dir.join(format!("{stem}.tex"));
    let mut n = 2;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_{n}.tex"));
        n += 1;
    }
    candidate
}

fn fragment(tree: &DocumentTree, id: NodeId) -> Fragment {
    Fragment {
        label: tree.name(id).to_string(),
        path: tree.path(id).to_path_buf(),
    }
}

fn is_emittable_source(tree: &DocumentTree, id: NodeId, summary_marker: &str) -> bool {
    let path = tree.path(id);
    !tree.node(id).is_category() && !is_summary(path, summary_marker) && is_tex_file(path)
}

fn is_summary(path: &Path, marker: &str) -> bool {
    !marker.is_empty()
        && path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().contains(marker))
}

fn is_tex_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "tex") && path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::reorganize;
    use crate::selection::SelectionModel;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, content: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, content).unwrap();
        p
    }

    /// main
    ///   ch1_cours
    ///     ch1_intro
    ///     DOCS
    ///       ch1_doc_annexe
    ///   ch2_cours
    ///     ch2_intro
    fn document(dir: &Path) -> (DocumentTree, NodeId, NodeId) {
        let main = touch(dir, "main.tex", "\\documentclass{article}\n\\begin{document}\nx\n\\end{document}\n");
        let ch1 = touch(dir, "ch1_cours.tex", "");
        let intro = touch(dir, "ch1_intro.tex", "intro one");
        let annexe = touch(dir, "ch1_doc_annexe.tex", "annexe");
        let ch2 = touch(dir, "ch2_cours.tex", "");
        let intro2 = touch(dir, "ch2_intro.tex", "intro two");

        let mut tree = DocumentTree::new("main", main);
        let root = tree.root();
        let c1 = tree.add_child(root, "ch1_cours", ch1);
        let i1 = tree.add_child(c1, "ch1_intro", intro);
        tree.add_child(c1, "ch1_doc_annexe", annexe);
        let c2 = tree.add_child(root, "ch2_cours", ch2);
        tree.add_child(c2, "ch2_intro", intro2);
        reorganize(&mut tree, root);
        (tree, c1, i1)
    }

    fn labels(frags: &[Fragment]) -> Vec<&str> {
        frags.iter().map(|f| f.label.as_str()).collect()
    }

    #[test]
    fn preamble_stops_before_begin_document() {
        let tmp = TempDir::new().unwrap();
        let p = touch(tmp.path(), "r.tex", "\\documentclass{book}\r\n\\usepackage{x}\n  \\begin{document}\nbody\n");
        assert_eq!(extract_preamble(&p).unwrap(), "\\documentclass{book}\n\\usepackage{x}\n");

        let empty = touch(tmp.path(), "e.tex", "\\begin{document}\n");
        assert!(matches!(extract_preamble(&empty), Err(BuildError::EmptyPreamble { .. })));
        assert!(matches!(
            extract_preamble(&tmp.path().join("none.tex")),
            Err(BuildError::SourceUnreadable { .. })
        ));
    }

    #[test]
    fn selected_are_checked_leaves_through_groups() {
        let tmp = TempDir::new().unwrap();
        let (tree, c1, _) = document(tmp.path());
        let mut model = SelectionModel::from_tree(tree);
        model.set_check_state(c1, CheckState::Checked);
        let frags = collect_selected(model.tree().unwrap());
        assert_eq!(labels(&frags), vec!["ch1_intro", "ch1_doc_annexe"]);
    }

    #[test]
    fn selected_skips_missing_files() {
        let tmp = TempDir::new().unwrap();
        let (tree, _, intro) = document(tmp.path());
        let mut model = SelectionModel::from_tree(tree);
        model.set_check_state(intro, CheckState::Checked);
        std::fs::remove_file(tmp.path().join("ch1_intro.tex")).unwrap();
        assert!(collect_selected(model.tree().unwrap()).is_empty());
    }

    #[test]
    fn chapters_take_every_file_of_a_touched_chapter() {
        let tmp = TempDir::new().unwrap();
        let (tree, _, intro) = document(tmp.path());
        let mut model = SelectionModel::from_tree(tree);
        model.set_check_state(intro, CheckState::Checked);

        let chapters = collect_chapter_groups(model.tree().unwrap(), "_cours");
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].name, "ch1_cours");
        // The unchecked annexe comes along; the group node adds no duplicate.
        assert_eq!(labels(&chapters[0].files), vec!["ch1_intro", "ch1_doc_annexe"]);
    }

    #[test]
    fn summary_files_inside_a_chapter_are_recursed_not_emitted() {
        let tmp = TempDir::new().unwrap();
        let main = touch(tmp.path(), "main.tex", "");
        let part = touch(tmp.path(), "part.tex", "");
        let summary = touch(tmp.path(), "sec_cours.tex", "");
        let leaf = touch(tmp.path(), "leaf.tex", "");

        let mut tree = DocumentTree::new("main", main);
        let p = tree.add_child(tree.root(), "part", part);
        let s = tree.add_child(p, "sec_cours", summary);
        let l = tree.add_child(s, "leaf", leaf);
        tree.node_mut(l).check_state = CheckState::Checked;

        let chapters = collect_chapter_groups(&tree, "_cours");
        assert_eq!(labels(&chapters[0].files), vec!["leaf"]);
    }

    #[test]
    fn untouched_document_has_no_chapters() {
        let tmp = TempDir::new().unwrap();
        let (tree, _, _) = document(tmp.path());
        assert!(collect_chapter_groups(&tree, "_cours").is_empty());
    }

    #[test]
    fn full_document_excludes_summary_even_under_a_group() {
        let tmp = TempDir::new().unwrap();
        let main = touch(tmp.path(), "main.tex", "");
        let annexe = touch(tmp.path(), "x_doc_annexe.tex", "");
        let summary = touch(tmp.path(), "ch1_doc_cours.tex", "");
        let nested = touch(tmp.path(), "nested.tex", "");

        let mut tree = DocumentTree::new("main", main);
        let root = tree.root();
        tree.add_child(root, "x_doc_annexe", annexe);
        let s = tree.add_child(root, "ch1_doc_cours", summary);
        tree.add_child(s, "nested", nested);
        reorganize(&mut tree, root);
        assert_eq!(tree.name(tree.children(root)[0]), "DOCS");

        let files = collect_all_document_files(&tree, "_cours");
        assert_eq!(labels(&files), vec!["x_doc_annexe", "nested"]);
    }

    #[test]
    fn full_document_walks_through_missing_files() {
        let tmp = TempDir::new().unwrap();
        let main = touch(tmp.path(), "main.tex", "");
        let part = touch(tmp.path(), "part.tex", "");
        let leaf = touch(tmp.path(), "leaf.tex", "");

        let mut tree = DocumentTree::new("main", main);
        let p = tree.add_child(tree.root(), "part", part.clone());
        tree.add_child(p, "leaf", leaf);
        assert_eq!(labels(&collect_all_document_files(&tree, "_cours")), vec!["part"]);

        std::fs::remove_file(&part).unwrap();
        assert_eq!(labels(&collect_all_document_files(&tree, "_cours")), vec!["leaf"]);
    }

    #[test]
    fn full_document_ignores_selection() {
        let tmp = TempDir::new().unwrap();
        let (tree, _, _) = document(tmp.path());
        let files = collect_all_document_files(&tree, "_cours");
        assert_eq!(labels(&files), vec!["ch1_intro", "ch1_doc_annexe", "ch2_intro"]);
    }

    #[test]
    fn unit_layout() {
        let tmp = TempDir::new().unwrap();
        let root = touch(tmp.path(), "main.tex", "");
        let a = touch(tmp.path(), "a.tex", "Alpha");
        let frags = vec![
            Fragment { label: "a".into(), path: a.clone() },
            Fragment { label: "gone".into(), path: tmp.path().join("gone.tex") },
        ];
        let scratch = TempDir::new().unwrap();
        let cfg = AssemblyConfig::default();

        let unit = build_unit("\\documentclass{article}\n", &frags, &root, scratch.path(), "partial", &cfg).unwrap();
        assert_eq!(unit.parent(), Some(scratch.path()));
        let name = unit.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("temp_partial_") && name.ends_with(".tex"), "{name}");

        let text = std::fs::read_to_string(&unit).unwrap();
        let dir = tmp.path().to_string_lossy().replace('\\', "/");
        assert!(text.starts_with("\\documentclass{article}\n"));
        assert!(text.contains(&format!("\\graphicspath{{{{{dir}/images/}}{{{dir}/../images/}}}}")));
        assert!(text.contains("\\pagestyle{empty}\n"));
        assert!(text.contains(&format!("% Source file: {}\nAlpha\n\n", a.display())));
        assert!(!text.contains("gone.tex"));
        assert!(text.ends_with("\\end{document}\n"));

        let begin = text.find(BODY_OPEN).unwrap();
        assert!(text.find("\\pagestyle{empty}").unwrap() < begin);
        assert!(text.find("Alpha").unwrap() > begin);
    }

    #[test]
    fn second_unit_in_the_same_second_gets_a_suffix() {
        let tmp = TempDir::new().unwrap();
        let root = touch(tmp.path(), "main.tex", "");
        let a = touch(tmp.path(), "a.tex", "A");
        let frags = vec![Fragment { label: "a".into(), path: a }];
        let scratch = TempDir::new().unwrap();
        let cfg = AssemblyConfig::default();

        let first = build_unit("p\n", &frags, &root, scratch.path(), "full", &cfg).unwrap();
        let second = build_unit("p\n", &frags, &root, scratch.path(), "full", &cfg).unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }

    #[test]
    fn unit_errors() {
        let tmp = TempDir::new().unwrap();
        let root = touch(tmp.path(), "main.tex", "");
        let a = touch(tmp.path(), "a.tex", "A");
        let cfg = AssemblyConfig::default();

        let err = build_unit("p\n", &[], &root, tmp.path(), "partial", &cfg).unwrap_err();
        assert!(matches!(err, BuildError::NoSelection(_)));

        let frags = vec![Fragment { label: "a".into(), path: a }];
        let err = build_unit("p\n", &frags, &root, &tmp.path().join("nope"), "partial", &cfg).unwrap_err();
        assert!(matches!(err, BuildError::ScratchUnavailable { .. }));
    }

    #[test]
    fn chapter_slugs() {
        assert_eq!(chapter_slug("ch1_cours", "_cours"), "ch1");
        assert_eq!(chapter_slug("Chapitre 2_cours", "_cours"), "Chapitre_2");
        assert_eq!(chapter_slug("_cours", "_cours"), "chapter");
        assert_eq!(sanitize_for_filename("a/b c"), "a-b_c");
    }
}
