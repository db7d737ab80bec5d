//! Build error taxonomy.
//!
//! Every variant is surfaced to the front end as a [`crate::events::BuildEvent::Error`];
//! none of them is retried automatically.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("cannot read {}: {source}", path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no preamble found in {} (missing or empty before \\begin{{document}})", path.display())]
    EmptyPreamble { path: PathBuf },

    #[error("nothing to compile: {0}")]
    NoSelection(String),

    #[error("scratch location {} is unusable: {source}", path.display())]
    ScratchUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch `{program}`: {source}")]
    ToolLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("compiler failed ({})", describe_exit(*code))]
    ExternalToolFailure { code: Option<i32> },

    #[error("compiler succeeded but {} was not produced", path.display())]
    ArtifactMissing { path: PathBuf },

    #[error("could not move {} to {}: {source}", from.display(), to.display())]
    FinalizeFailure {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
