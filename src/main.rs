use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use texslicer::config::load_config;
use texslicer::events::{BuildEvent, PipelineKind};
use texslicer::orchestrator::{BuildRequest, Orchestrator};
use texslicer::parser::normalize_path;
use texslicer::selection::SelectionModel;
use texslicer::settings::{default_settings_path, Settings};
use texslicer::tree::{CheckState, DocumentTree, NodeId};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "texslicer")]
#[command(version)]
#[command(about = "Compile a hand-picked slice of an \\import-based LaTeX document")]
struct Cli {
    /// Settings file (default: <config_dir>/texslicer/config.json)
    #[arg(long, global = true, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Debug logging; also echoes compiler output during builds
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the document tree with its saved selection
    Tree {
        root: PathBuf,

        /// Print the path -> state map as JSON instead
        #[arg(long)]
        json: bool,
    },

    /// Check or uncheck nodes (by path, path relative to ROOT's directory, or name)
    Select {
        root: PathBuf,

        #[arg(required = true, value_name = "TARGET")]
        targets: Vec<String>,

        /// Uncheck instead of check
        #[arg(long)]
        off: bool,

        /// Set whole subtrees uniformly
        #[arg(long)]
        subtree: bool,
    },

    /// Compile the selection, plus chapters and/or the full document
    Build {
        root: PathBuf,

        #[arg(long, overrides_with = "no_chapters")]
        chapters: bool,
        #[arg(long)]
        no_chapters: bool,

        #[arg(long, overrides_with = "no_document")]
        document: bool,
        #[arg(long)]
        no_document: bool,
    },
}

fn flag(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "texslicer=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let mut settings = Settings::load(settings_path);

    match cli.cmd {
        Command::Tree { root, json } => {
            let model = open_document(&mut settings, &root)?;
            let tree = loaded(&model)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&model.save_state())?);
            } else {
                print!("{}", tree.render());
            }
            persist(&mut settings, &model)?;
        }
        Command::Select {
            root,
            targets,
            off,
            subtree,
        } => {
            let mut model = open_document(&mut settings, &root)?;
            let ids = {
                let tree = loaded(&model)?;
                targets
                    .iter()
                    .map(|t| resolve_target(tree, t).with_context(|| format!("no node matches `{t}`")))
                    .collect::<Result<Vec<NodeId>>>()?
            };
            for id in ids {
                if subtree {
                    model.select_subtree(id, !off);
                } else {
                    let desired = if off { CheckState::Unchecked } else { CheckState::Checked };
                    model.set_check_state(id, desired);
                }
            }
            persist(&mut settings, &model)?;
            print!("{}", loaded(&model)?.render());
        }
        Command::Build {
            root,
            chapters,
            no_chapters,
            document,
            no_document,
        } => {
            let model = open_document(&mut settings, &root)?;
            let mut options = settings.compilation_options();
            if let Some(on) = flag(chapters, no_chapters) {
                options.compile_chapter = on;
            }
            if let Some(on) = flag(document, no_document) {
                options.compile_document = on;
            }
            settings.set_compilation_options(options);
            persist(&mut settings, &model)?;

            let request = BuildRequest {
                chapters: options.compile_chapter,
                full_document: options.compile_document,
            };
            let rt = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            let ok = rt.block_on(run_build(loaded(&model)?, request, cli.verbose))?;
            if !ok {
                bail!("build failed");
            }
        }
    }

    Ok(())
}

/// Parse `root`, record it as the current document and restore its saved
/// selection.
fn open_document(settings: &mut Settings, root: &Path) -> Result<SelectionModel> {
    let mut model = SelectionModel::new();
    model
        .load_from_file(root)
        .with_context(|| format!("Failed to load {}", root.display()))?;

    let tree = loaded(&model)?;
    let abs_root = tree.path(tree.root()).to_path_buf();
    if settings.open_document(&abs_root) {
        tracing::info!("new document, compilation options reset");
    }

    let saved = settings.check_states();
    if !saved.is_empty() {
        model.restore_state(&saved);
    }
    Ok(model)
}

fn loaded(model: &SelectionModel) -> Result<&DocumentTree> {
    model.tree().context("no document loaded")
}

fn persist(settings: &mut Settings, model: &SelectionModel) -> Result<()> {
    settings.merge_check_states(&model.save_state());
    settings
        .save()
        .with_context(|| format!("Failed to save settings to {}", settings.path().display()))
}

fn resolve_target(tree: &DocumentTree, target: &str) -> Option<NodeId> {
    let base = tree
        .path(tree.root())
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let p = Path::new(target);
    let candidate = if p.is_absolute() {
        normalize_path(p)
    } else {
        normalize_path(&base.join(p))
    };
    tree.find_by_path(&candidate)
        .or_else(|| tree.find_by_path(&candidate.with_extension("tex")))
        .or_else(|| tree.find_by_name(target))
}

async fn run_build(tree: &DocumentTree, request: BuildRequest, verbose: bool) -> Result<bool> {
    let root = tree.path(tree.root()).to_path_buf();
    let config = load_config(root.parent().unwrap_or_else(|| Path::new(".")));

    let (mut orchestrator, mut events) = Orchestrator::new(&root, config)?;
    let started = orchestrator.build(tree, request).await;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );

    let mut pending: HashSet<PipelineKind> = match started {
        Ok(kinds) => kinds.into_iter().collect(),
        Err(e) => {
            spinner.finish_and_clear();
            return Err(e).context("Nothing was compiled");
        }
    };
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner.set_message("compiling...");

    let mut ok = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;

    while !pending.is_empty() {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match &event {
                    BuildEvent::Progress { .. } => spinner.set_message(event.to_string()),
                    BuildEvent::Output { .. } => {
                        if verbose {
                            spinner.println(event.to_string());
                        }
                    }
                    BuildEvent::Finished { kind, success, .. } => {
                        ok &= *success;
                        pending.remove(kind);
                        spinner.println(event.to_string());
                    }
                    BuildEvent::Error { .. } => {
                        ok = false;
                        spinner.println(event.to_string());
                    }
                    BuildEvent::Started { .. } | BuildEvent::ArtifactAvailable { .. } => {}
                    _ => spinner.println(event.to_string()),
                }
            }
            _ = &mut ctrl_c, if !stopping => {
                stopping = true;
                spinner.set_message("stopping...");
                orchestrator.stop();
            }
        }
    }

    // Errors published for pipelines that never started.
    while let Ok(event) = events.try_recv() {
        if matches!(event, BuildEvent::Error { .. }) {
            ok = false;
            spinner.println(event.to_string());
        }
    }

    spinner.finish_and_clear();
    orchestrator.wait().await;
    Ok(ok && !stopping)
}
