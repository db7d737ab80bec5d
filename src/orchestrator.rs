//! Partial, chapter and full-document pipelines.
//!
//! Each pipeline owns a scratch directory and runs as its own task. A pipeline
//! compiles a unit pass after pass until the output stops asking for a rerun
//! or the pass cap is hit, then copies the PDF next to the root document.
//! Progress and results are published on the event channel handed out by
//! [`Orchestrator::new`].

use crate::assembler::{
    build_unit, chapter_slug, collect_all_document_files, collect_chapter_groups,
    collect_selected, extract_preamble, ChapterInfo,
};
use crate::config::{CompilerConfig, Config};
use crate::error::{BuildError, Result};
use crate::events::{BuildEvent, PipelineKind};
use crate::runner::{needs_rerun, run_pass, PassOutcome};
use crate::tree::DocumentTree;
use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which pipelines run besides the partial one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildRequest {
    pub chapters: bool,
    pub full_document: bool,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            chapters: true,
            full_document: false,
        }
    }
}

/// What to do after a pass has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run the same unit again.
    Rerun,
    /// Output is stable (or the cap is reached): collect the PDF.
    Finalize,
    /// Non-zero exit. No further passes.
    Fail,
}

pub fn next_step(outcome: &PassOutcome, pass: u32, cap: u32, phrases: &[String]) -> Step {
    if !outcome.success() {
        Step::Fail
    } else if pass < cap && needs_rerun(&outcome.output, phrases) {
        Step::Rerun
    } else {
        Step::Finalize
    }
}

/// Final location of a pipeline's PDF: beside `root`, named
/// `<stem>_<tag>_<yyyy_MM_dd_HH_mm_ss>.pdf`.
pub fn artifact_path(root: &Path, tag: &str) -> PathBuf {
    let stem = root
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let stamp = chrono::Local::now().format("%Y_%m_%d_%H_%M_%S");
    let dir = root.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!("{stem}_{tag}_{stamp}.pdf"))
}

/// Copy the PDF produced beside `unit` to `dest`, then drop the scratch copy.
///
/// On a failed copy the scratch PDF is left where it is.
pub fn finalize(unit: &Path, dest: &Path) -> Result<PathBuf> {
    let produced = unit.with_extension("pdf");
    if !produced.is_file() {
        return Err(BuildError::ArtifactMissing { path: produced });
    }
    std::fs::copy(&produced, dest).map_err(|source| BuildError::FinalizeFailure {
        from: produced.clone(),
        to: dest.to_path_buf(),
        source,
    })?;
    if let Err(e) = std::fs::remove_file(&produced) {
        debug!(path = %produced.display(), "scratch pdf not removed: {e}");
    }
    Ok(dest.to_path_buf())
}

/// Whether one run of a pipeline is still live.
///
/// Every event of a run is published through its flag, under the flag's lock.
/// Once the run is stopped or has published its final events, anything it
/// sends afterwards is dropped.
#[derive(Clone, Default)]
struct RunFlag(Arc<Mutex<bool>>);

impl RunFlag {
    fn live() -> Self {
        Self(Arc::new(Mutex::new(true)))
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_live(&self) -> bool {
        *self.lock()
    }

    fn publish(&self, events: &mpsc::UnboundedSender<BuildEvent>, event: BuildEvent) {
        if *self.lock() {
            // The receiver may be gone.
            events.send(event).ok();
        }
    }

    /// End the run with `last`. Returns false, publishing nothing, when the
    /// run had already ended.
    fn end(
        &self,
        events: &mpsc::UnboundedSender<BuildEvent>,
        last: impl IntoIterator<Item = BuildEvent>,
    ) -> bool {
        let mut live = self.lock();
        if !std::mem::replace(&mut *live, false) {
            return false;
        }
        for event in last {
            events.send(event).ok();
        }
        true
    }
}

struct Pipeline {
    scratch: TempDir,
    running: RunFlag,
    cancel: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Pipeline {
    fn new(kind: PipelineKind) -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("texslicer-{}-", kind.label()))
            .tempdir()
            .map_err(|source| BuildError::ScratchUnavailable {
                path: std::env::temp_dir(),
                source,
            })?;
        Ok(Self {
            scratch,
            running: RunFlag::default(),
            cancel: None,
            task: None,
        })
    }
}

/// Everything a running pipeline task needs, detached from the orchestrator.
#[derive(Clone)]
struct RunContext {
    kind: PipelineKind,
    root: PathBuf,
    compiler: CompilerConfig,
    events: mpsc::UnboundedSender<BuildEvent>,
    cancel: watch::Receiver<bool>,
    running: RunFlag,
}

impl RunContext {
    fn emit(&self, event: BuildEvent) {
        self.running.publish(&self.events, event);
    }

    fn report(&self, error: BuildError) {
        warn!(pipeline = %self.kind, "{error}");
        self.emit(BuildEvent::Error {
            kind: self.kind,
            error: Arc::new(error),
        });
    }

    fn is_running(&self) -> bool {
        self.running.is_live()
    }

    /// Compile `unit` until stable and move its PDF to `dest`.
    ///
    /// `Ok(None)` means the pipeline was stopped; no error is reported for it.
    async fn compile_unit(&self, unit: &Path, dest: &Path) -> Result<Option<PathBuf>> {
        let cap = self.compiler.max_passes.max(1);
        let mut pass = 1;
        self.emit(BuildEvent::Progress { kind: self.kind, pass, cap });

        loop {
            let events = self.events.clone();
            let running = self.running.clone();
            let kind = self.kind;
            let outcome = run_pass(
                &self.compiler.program,
                &self.compiler.args,
                unit,
                move |line| running.publish(&events, BuildEvent::Output { kind, line }),
                self.cancel.clone(),
            )
            .await?;

            if outcome.cancelled || !self.is_running() {
                debug!(pipeline = %self.kind, pass, "pass ended after stop");
                return Ok(None);
            }

            match next_step(&outcome, pass, cap, &self.compiler.rerun_phrases) {
                Step::Fail => {
                    return Err(BuildError::ExternalToolFailure {
                        code: outcome.exit_code,
                    })
                }
                Step::Rerun => {
                    pass += 1;
                    debug!(pipeline = %self.kind, pass, cap, "rerun requested");
                    self.emit(BuildEvent::Progress { kind: self.kind, pass, cap });
                }
                Step::Finalize => {
                    let artifact = finalize(unit, dest)?;
                    info!(pipeline = %self.kind, passes = pass, artifact = %artifact.display(), "pdf ready");
                    return Ok(Some(artifact));
                }
            }
        }
    }
}

/// Drives the three pipelines for one root document.
pub struct Orchestrator {
    root: PathBuf,
    config: Arc<Config>,
    events: mpsc::UnboundedSender<BuildEvent>,
    pipelines: [Pipeline; 3],
    chapter_queue: Arc<Mutex<VecDeque<ChapterInfo>>>,
}

impl Orchestrator {
    /// Create the orchestrator and its scratch directories. Scratch
    /// directories and everything in them are removed when it is dropped.
    pub fn new(
        root: impl Into<PathBuf>,
        config: Config,
    ) -> Result<(Self, mpsc::UnboundedReceiver<BuildEvent>)> {
        let (events, rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            root: root.into(),
            config: Arc::new(config),
            events,
            pipelines: [
                Pipeline::new(PipelineKind::Partial)?,
                Pipeline::new(PipelineKind::Chapter)?,
                Pipeline::new(PipelineKind::Full)?,
            ],
            chapter_queue: Arc::new(Mutex::new(VecDeque::new())),
        };
        Ok((orchestrator, rx))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch_dir(&self, kind: PipelineKind) -> &Path {
        self.pipelines[kind.index()].scratch.path()
    }

    pub fn is_running(&self, kind: PipelineKind) -> bool {
        self.pipelines[kind.index()].running.is_live()
    }

    pub fn is_any_running(&self) -> bool {
        PipelineKind::ALL.into_iter().any(|k| self.is_running(k))
    }

    /// Start a build from the current selection of `tree`.
    ///
    /// Anything still running is stopped first, and its tasks are awaited
    /// before the new run starts. The partial unit is assembled
    /// up front: if that fails nothing is started and the error is returned
    /// (it is also published). Chapter and full-document pipelines start when
    /// requested; their assembly errors are published only. Returns the
    /// pipelines that were started, each of which will publish `Finished`.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn build(
        &mut self,
        tree: &DocumentTree,
        request: BuildRequest,
    ) -> std::result::Result<Vec<PipelineKind>, Arc<BuildError>> {
        self.stop();
        self.wait().await;

        let assembly = &self.config.assembly;
        let preamble = extract_preamble(&self.root);
        let partial_unit = preamble.and_then(|preamble| {
            let selected = collect_selected(tree);
            if selected.is_empty() {
                return Err(BuildError::NoSelection("no checked fragment".to_string()));
            }
            let unit = build_unit(
                &preamble,
                &selected,
                &self.root,
                self.scratch_dir(PipelineKind::Partial),
                "partial",
                assembly,
            )?;
            Ok((preamble, unit))
        });
        let (preamble, partial_unit) = match partial_unit {
            Ok(ok) => ok,
            Err(e) => {
                let e = Arc::new(e);
                self.publish_error(PipelineKind::Partial, e.clone());
                return Err(e);
            }
        };

        let dest = self.root.clone();
        self.launch(PipelineKind::Partial, move |ctx| {
            run_single(ctx, partial_unit, artifact_path(&dest, "partiel"))
        });

        let mut started = vec![PipelineKind::Partial];
        if request.chapters && self.start_chapters(tree, preamble.clone()) {
            started.push(PipelineKind::Chapter);
        }
        if request.full_document && self.start_full(tree, &preamble) {
            started.push(PipelineKind::Full);
        }
        Ok(started)
    }

    fn start_chapters(&mut self, tree: &DocumentTree, preamble: String) -> bool {
        let marker = self.config.assembly.summary_marker.clone();
        let chapters = collect_chapter_groups(tree, &marker);
        if chapters.is_empty() {
            self.publish_error(
                PipelineKind::Chapter,
                Arc::new(BuildError::NoSelection("no chapter to compile".to_string())),
            );
            return false;
        }
        info!(count = chapters.len(), "chapters queued");
        {
            let mut queue = lock_queue(&self.chapter_queue);
            queue.clear();
            queue.extend(chapters);
        }

        let queue = Arc::clone(&self.chapter_queue);
        let scratch = self.scratch_dir(PipelineKind::Chapter).to_path_buf();
        let config = Arc::clone(&self.config);
        self.launch(PipelineKind::Chapter, move |ctx| {
            run_chapters(ctx, queue, preamble, scratch, config)
        });
        true
    }

    fn start_full(&mut self, tree: &DocumentTree, preamble: &str) -> bool {
        let assembly = &self.config.assembly;
        let files = collect_all_document_files(tree, &assembly.summary_marker);
        let unit = if files.is_empty() {
            Err(BuildError::NoSelection("the document has no fragment".to_string()))
        } else {
            build_unit(
                preamble,
                &files,
                &self.root,
                self.scratch_dir(PipelineKind::Full),
                "full",
                assembly,
            )
        };
        match unit {
            Ok(unit) => {
                let dest = self.root.clone();
                self.launch(PipelineKind::Full, move |ctx| {
                    run_single(ctx, unit, artifact_path(&dest, "complet"))
                });
                true
            }
            Err(e) => {
                self.publish_error(PipelineKind::Full, Arc::new(e));
                false
            }
        }
    }

    fn launch<F, Fut>(&mut self, kind: PipelineKind, body: F)
    where
        F: FnOnce(RunContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let running = RunFlag::live();
        let ctx = RunContext {
            kind,
            root: self.root.clone(),
            compiler: self.config.compiler.clone(),
            events: self.events.clone(),
            cancel: cancel_rx,
            running: running.clone(),
        };

        let pipeline = &mut self.pipelines[kind.index()];
        pipeline.running = running;
        pipeline.cancel = Some(cancel_tx);
        ctx.emit(BuildEvent::Started { kind });
        pipeline.task = Some(tokio::spawn(body(ctx)));
    }

    fn publish_error(&self, kind: PipelineKind, error: Arc<BuildError>) {
        warn!(pipeline = %kind, "{error}");
        self.events.send(BuildEvent::Error { kind, error }).ok();
    }

    /// Ask every running pipeline to stop and drop queued chapters.
    ///
    /// Returns immediately. Each running pipeline publishes
    /// `Finished { success: false }` here, and its compiler process is asked
    /// to terminate. Nothing the stopped run does afterwards is published.
    pub fn stop(&self) {
        lock_queue(&self.chapter_queue).clear();
        for (kind, pipeline) in PipelineKind::ALL.into_iter().zip(&self.pipelines) {
            let stopped = BuildEvent::Finished {
                kind,
                success: false,
                artifact: None,
            };
            if pipeline.running.end(&self.events, [stopped]) {
                debug!(pipeline = %kind, "stop requested");
                if let Some(cancel) = &pipeline.cancel {
                    cancel.send(true).ok();
                }
            }
        }
    }

    /// Resolve once every pipeline task has ended.
    pub async fn wait(&mut self) {
        for pipeline in &mut self.pipelines {
            if let Some(task) = pipeline.task.take() {
                if let Err(e) = task.await {
                    warn!("pipeline task aborted: {e}");
                }
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_queue(queue: &Mutex<VecDeque<ChapterInfo>>) -> MutexGuard<'_, VecDeque<ChapterInfo>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Partial and full-document pipelines: one unit, one artifact.
async fn run_single(ctx: RunContext, unit: PathBuf, dest: PathBuf) {
    let kind = ctx.kind;
    let artifact = match ctx.compile_unit(&unit, &dest).await {
        Ok(artifact) => artifact,
        Err(e) => {
            ctx.report(e);
            None
        }
    };

    let last = match artifact {
        Some(path) => vec![
            BuildEvent::Finished {
                kind,
                success: true,
                artifact: Some(path.clone()),
            },
            BuildEvent::ArtifactAvailable { kind, path },
        ],
        None => vec![BuildEvent::Finished {
            kind,
            success: false,
            artifact: None,
        }],
    };
    if !ctx.running.end(&ctx.events, last) {
        debug!(pipeline = %kind, "stopped run ended");
    }
}

/// Chapter pipeline: drain the queue one chapter at a time, whatever the
/// outcome of the previous one.
async fn run_chapters(
    ctx: RunContext,
    queue: Arc<Mutex<VecDeque<ChapterInfo>>>,
    preamble: String,
    scratch: PathBuf,
    config: Arc<Config>,
) {
    let marker = &config.assembly.summary_marker;
    let mut all_ok = true;

    while ctx.is_running() {
        let next = lock_queue(&queue).pop_front();
        let Some(chapter) = next else { break };

        info!(chapter = %chapter.name, files = chapter.files.len(), "compiling chapter");
        ctx.emit(BuildEvent::ChapterStarted {
            name: chapter.name.clone(),
        });

        let slug = chapter_slug(&chapter.name, marker);
        let result = match build_unit(&preamble, &chapter.files, &ctx.root, &scratch, &slug, &config.assembly) {
            Ok(unit) => ctx.compile_unit(&unit, &artifact_path(&ctx.root, &slug)).await,
            Err(e) => Err(e),
        };
        let artifact = match result {
            Ok(artifact) => artifact,
            Err(e) => {
                ctx.report(e);
                None
            }
        };

        all_ok &= artifact.is_some();
        ctx.emit(BuildEvent::ChapterFinished {
            name: chapter.name,
            success: artifact.is_some(),
            artifact,
        });
    }

    let last = [
        BuildEvent::AllChaptersDone,
        BuildEvent::Finished {
            kind: PipelineKind::Chapter,
            success: all_ok,
            artifact: None,
        },
    ];
    if !ctx.running.end(&ctx.events, last) {
        debug!("stopped chapter run ended");
    }
}
