//! Persisted application settings.
//!
//! The file is a plain JSON object shared with other tools, so it is always
//! handled as a whole: load, change the known keys, write everything back.
//! Keys this crate does not know about are preserved.
//!
//! Known keys: `lastFile`, `lastUpdated`, `checkStates` (absolute path ->
//! 0/1/2), `stateUpdated`, `compilationOptions`.

use crate::selection::CheckStateMap;
use crate::tree::CheckState;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const LAST_FILE: &str = "lastFile";
const LAST_UPDATED: &str = "lastUpdated";
const CHECK_STATES: &str = "checkStates";
const STATE_UPDATED: &str = "stateUpdated";
const COMPILATION_OPTIONS: &str = "compilationOptions";

/// `<config_dir>/texslicer/config.json`.
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("texslicer")
        .join("config.json")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilationOptions {
    pub compile_chapter: bool,
    pub compile_document: bool,
}

impl Default for CompilationOptions {
    fn default() -> Self {
        Self {
            compile_chapter: true,
            compile_document: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    path: PathBuf,
    data: Map<String, Value>,
}

impl Settings {
    /// Load settings from `path`. A missing file gives empty settings; an
    /// unreadable or non-object file is logged and treated the same way.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    warn!(path = %path.display(), "settings file is not a JSON object, ignoring");
                    Map::new()
                }
                Err(e) => {
                    warn!(path = %path.display(), "ignoring invalid settings: {e}");
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        };
        Self { path, data }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_file(&self) -> Option<PathBuf> {
        self.data
            .get(LAST_FILE)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    /// Record `root` as the current document.
    ///
    /// Switching away from a previously recorded document resets the
    /// compilation options to their defaults. Returns true in that case.
    pub fn open_document(&mut self, root: &Path) -> bool {
        let switched = self.last_file().is_some_and(|last| last != root);
        if switched {
            self.set_compilation_options(CompilationOptions::default());
        }
        self.data.insert(
            LAST_FILE.to_string(),
            Value::String(root.to_string_lossy().into_owned()),
        );
        self.data.insert(LAST_UPDATED.to_string(), Value::String(now()));
        switched
    }

    /// Stored check states. Entries with an unknown code are skipped.
    pub fn check_states(&self) -> CheckStateMap {
        let Some(Value::Object(map)) = self.data.get(CHECK_STATES) else {
            return CheckStateMap::new();
        };
        map.iter()
            .filter_map(|(path, code)| {
                let code = u8::try_from(code.as_u64()?).ok()?;
                Some((path.clone(), CheckState::from_code(code)?))
            })
            .collect()
    }

    /// Merge `states` into the stored map. Paths not in `states` (for
    /// instance from other documents) keep their stored value.
    pub fn merge_check_states(&mut self, states: &CheckStateMap) {
        let entry = self
            .data
            .entry(CHECK_STATES.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            for (path, state) in states {
                map.insert(path.clone(), Value::from(state.code()));
            }
        }
        self.data.insert(STATE_UPDATED.to_string(), Value::String(now()));
    }

    pub fn compilation_options(&self) -> CompilationOptions {
        self.data
            .get(COMPILATION_OPTIONS)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn set_compilation_options(&mut self, options: CompilationOptions) {
        let value = serde_json::json!({
            "compileChapter": options.compile_chapter,
            "compileDocument": options.compile_document,
        });
        self.data.insert(COMPILATION_OPTIONS.to_string(), value);
    }

    /// Write the whole object back: temp file, then rename over the target.
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let json_text =
            serde_json::to_string_pretty(&self.data).context("Failed to serialize settings")?;
        fs::write(&tmp_path, json_text)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to rename settings to {}", self.path.display()))?;
        Ok(())
    }
}

fn now() -> String {
    chrono::Local::now().to_rfc3339()
}
