use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name of the per-document build configuration, looked up next to the
/// root document.
pub const CONFIG_FILE_NAME: &str = ".texslicer.json";

/// How the external compiler is driven.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub program: String,
    /// Fixed arguments; the unit path is always appended last.
    pub args: Vec<String>,
    /// Upper bound on passes per unit, rerun requests included.
    pub max_passes: u32,
    /// Output phrases (matched case-insensitively) that ask for another pass.
    pub rerun_phrases: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: "lualatex".to_string(),
            args: vec![
                "-synctex=1".to_string(),
                "-shell-escape".to_string(),
                "-interaction=nonstopmode".to_string(),
                "-file-line-error".to_string(),
            ],
            max_passes: 5,
            rerun_phrases: vec![
                "Rerun to get".to_string(),
                "Please rerun LaTeX".to_string(),
                "Rerun LaTeX".to_string(),
            ],
        }
    }
}

/// What goes into an assembled unit around the selected fragments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// Name substring of chapter summary files. They route the chapter's
    /// imports but are never emitted as fragments themselves.
    pub summary_marker: String,

    /// Image search directories, relative to the root document's directory.
    pub image_dirs: Vec<String>,

    /// Raw lines emitted after `\graphicspath`, before `\begin{document}`.
    pub page_setup: Vec<String>,

    /// Emitted right after `\begin{document}`.
    pub body_setup: String,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            summary_marker: "_cours".to_string(),
            image_dirs: vec!["images".to_string(), "../images".to_string()],
            page_setup: [
                r"\lhead{\textcolor{gris50}{\small\textit{\hyperlink{debut}{\monetablissement}}}}",
                r"\chead{}",
                r"\rhead{\textcolor{gris50}{\small\textit{\hyperlink{debut}{\maclasse}}}}",
                r"\lfoot{}",
                r"\cfoot{\textcolor{gris50}{\small\textit{page \thepage}}}",
                r"\rfoot{}",
                r"\def\headrulewidth{0pt}",
                r"\def\footrulewidth{0pt}",
                r"\pagestyle{empty}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            body_setup: r"\singlespacing\setlength{\parindent}{0pt}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub compiler: CompilerConfig,
    pub assembly: AssemblyConfig,
}

/// Load `.texslicer.json` from `doc_dir`. A missing or malformed file yields
/// the defaults.
pub fn load_config(doc_dir: &Path) -> Config {
    let primary = doc_dir.join(CONFIG_FILE_NAME);

    let text = std::fs::read_to_string(&primary);
    let Ok(text) = text else { return Config::default() };

    match serde_json::from_str::<Config>(&text) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %primary.display(), "ignoring invalid config: {e}");
            Config::default()
        }
    }
}
