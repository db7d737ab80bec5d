//! Typed notifications published by the orchestrator.

use crate::error::BuildError;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// The checked fragments only.
    Partial,
    /// One unit per touched chapter, compiled in turn.
    Chapter,
    /// Every fragment of the document.
    Full,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 3] = [PipelineKind::Partial, PipelineKind::Chapter, PipelineKind::Full];

    pub fn label(self) -> &'static str {
        match self {
            PipelineKind::Partial => "partial",
            PipelineKind::Chapter => "chapter",
            PipelineKind::Full => "full",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub enum BuildEvent {
    Started {
        kind: PipelineKind,
    },
    /// Pass `pass` of at most `cap` is about to run.
    Progress {
        kind: PipelineKind,
        pass: u32,
        cap: u32,
    },
    Output {
        kind: PipelineKind,
        line: String,
    },
    /// Exactly once per started pipeline.
    Finished {
        kind: PipelineKind,
        success: bool,
        artifact: Option<PathBuf>,
    },
    Error {
        kind: PipelineKind,
        error: Arc<BuildError>,
    },
    ChapterStarted {
        name: String,
    },
    ChapterFinished {
        name: String,
        success: bool,
        artifact: Option<PathBuf>,
    },
    AllChaptersDone,
    ArtifactAvailable {
        kind: PipelineKind,
        path: PathBuf,
    },
}

impl BuildEvent {
    pub fn kind(&self) -> PipelineKind {
        match self {
            BuildEvent::Started { kind }
            | BuildEvent::Progress { kind, .. }
            | BuildEvent::Output { kind, .. }
            | BuildEvent::Finished { kind, .. }
            | BuildEvent::Error { kind, .. }
            | BuildEvent::ArtifactAvailable { kind, .. } => *kind,
            BuildEvent::ChapterStarted { .. }
            | BuildEvent::ChapterFinished { .. }
            | BuildEvent::AllChaptersDone => PipelineKind::Chapter,
        }
    }
}

impl fmt::Display for BuildEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildEvent::Started { kind } => write!(f, "[{kind}] started"),
            BuildEvent::Progress { kind, pass, cap } => write!(f, "[{kind}] pass {pass}/{cap}"),
            BuildEvent::Output { kind, line } => write!(f, "[{kind}] {line}"),
            BuildEvent::Finished { kind, success: true, artifact: Some(path) } => {
                write!(f, "[{kind}] finished: {}", path.display())
            }
            BuildEvent::Finished { kind, success: true, artifact: None } => write!(f, "[{kind}] finished"),
            BuildEvent::Finished { kind, success: false, .. } => write!(f, "[{kind}] failed"),
            BuildEvent::Error { kind, error } => write!(f, "[{kind}] error: {error}"),
            BuildEvent::ChapterStarted { name } => write!(f, "[chapter] {name}: started"),
            BuildEvent::ChapterFinished { name, success: true, artifact: Some(path) } => {
                write!(f, "[chapter] {name}: {}", path.display())
            }
            BuildEvent::ChapterFinished { name, .. } => write!(f, "[chapter] {name}: failed"),
            BuildEvent::AllChaptersDone => write!(f, "[chapter] all chapters compiled"),
            BuildEvent::ArtifactAvailable { kind, path } => write!(f, "[{kind}] pdf: {}", path.display()),
        }
    }
}
