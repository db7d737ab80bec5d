//! Build a [`DocumentTree`] by following `\import{dir}{file}` directives.

use crate::categories::reorganize;
use crate::error::{BuildError, Result};
use crate::tree::{DocumentTree, NodeId};
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Imports nested deeper than this are skipped.
pub const MAX_IMPORT_DEPTH: usize = 64;

fn import_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\import\s*\{([^}]*)\}\s*\{([^}]*)\}").unwrap())
}

/// One live `\import{dir}{file}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDirective {
    pub dir: String,
    pub file: String,
    /// Byte offset of the backslash in the scanned text.
    pub offset: usize,
}

impl ImportDirective {
    /// Directory the imported file is read from, which is also the base for
    /// the imports it contains.
    pub fn base_dir(&self, base: &Path) -> PathBuf {
        normalize_path(&base.join(&self.dir))
    }

    pub fn resolve(&self, base: &Path) -> PathBuf {
        self.base_dir(base).join(format!("{}.tex", self.file))
    }
}

/// All import directives in `content`, skipping those on `%` comment lines.
pub fn find_imports(content: &str) -> Vec<ImportDirective> {
    import_regex()
        .captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            if is_commented(content, whole.start()) {
                return None;
            }
            Some(ImportDirective {
                dir: caps[1].trim().to_string(),
                file: caps[2].trim().to_string(),
                offset: whole.start(),
            })
        })
        .collect()
}

fn is_commented(content: &str, pos: usize) -> bool {
    let line_start = content[..pos].rfind('\n').map(|i| i + 1).unwrap_or(0);
    content[line_start..pos].trim_start().starts_with('%')
}

/// Parse `file_path` and everything it imports.
///
/// Imports resolve against `base_dir` when given, otherwise against the
/// file's own directory. An unreadable import is logged and left out; an
/// unreadable root is an error. An import already on the current inclusion
/// chain is skipped, so self-referential documents terminate. Category groups
/// are built once the whole tree is known.
pub fn parse(file_path: &Path, base_dir: Option<&Path>) -> Result<DocumentTree> {
    let abs = absolutize(file_path)?;
    let content = read_source(&abs)?;

    let base = match base_dir {
        Some(dir) => absolutize(dir)?,
        None => abs.parent().map(Path::to_path_buf).unwrap_or_default(),
    };

    let mut tree = DocumentTree::new(display_name(&abs), abs.clone());
    let root = tree.root();
    let mut chain = vec![abs];
    collect_imports(&mut tree, root, &content, &base, &mut chain);
    reorganize(&mut tree, root);

    debug!(nodes = tree.len(), root = %tree.path(root).display(), "document tree built");
    Ok(tree)
}

fn collect_imports(
    tree: &mut DocumentTree,
    parent: NodeId,
    content: &str,
    base: &Path,
    chain: &mut Vec<PathBuf>,
) {
    for import in find_imports(content) {
        let child_base = import.base_dir(base);
        let child_path = import.resolve(base);

        if chain.contains(&child_path) {
            warn!(path = %child_path.display(), "import cycle, skipping");
            continue;
        }
        if chain.len() >= MAX_IMPORT_DEPTH {
            warn!(path = %child_path.display(), "imports nested too deeply, skipping");
            continue;
        }

        let text = match read_source(&child_path) {
            Ok(text) => text,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };

        debug!(path = %child_path.display(), "import resolved");
        let child = tree.add_child(parent, display_name(&child_path), child_path.clone());
        chain.push(child_path);
        collect_imports(tree, child, &text, &child_base, chain);
        chain.pop();
    }
}

/// Read a source file; invalid UTF-8 is replaced rather than rejected.
pub fn read_source(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|source| BuildError::SourceUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
}

fn display_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(normalize_path(path));
    }
    let cwd = std::env::current_dir().map_err(|source| BuildError::SourceUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(normalize_path(&cwd.join(path)))
}

/// Lexically drop `.` components and fold `..` into their parent.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if out.file_name().is_some() {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
