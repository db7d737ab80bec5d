//! One compiler pass as a child process.

use crate::error::{BuildError, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Incremental splitter for raw process output.
///
/// Bytes are held until a `\n` arrives so multi-byte characters split across
/// reads decode correctly. A trailing `\r` is dropped from each line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let line = std::mem::replace(&mut self.pending, rest);
            lines.push(decode_line(&line[..pos]));
        }
        lines
    }

    /// The unterminated tail, if any. Called once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Result of one finished pass.
#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr, one line per `\n`.
    pub output: String,
    /// Termination was requested while the pass ran.
    pub cancelled: bool,
}

impl PassOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// True when `output` contains any of `phrases`, ignoring case.
pub fn needs_rerun(output: &str, phrases: &[String]) -> bool {
    let haystack = output.to_lowercase();
    phrases
        .iter()
        .filter(|p| !p.is_empty())
        .any(|p| haystack.contains(&p.to_lowercase()))
}

/// Run `program args... unit` in the unit's directory.
///
/// Every complete output line is handed to `on_line` as it arrives. When
/// `cancel` flips to true the child is asked to terminate and the pass keeps
/// waiting for it to exit; the outcome is then flagged `cancelled`.
pub async fn run_pass<F>(
    program: &str,
    args: &[String],
    unit: &Path,
    mut on_line: F,
    mut cancel: watch::Receiver<bool>,
) -> Result<PassOutcome>
where
    F: FnMut(String) + Send,
{
    if *cancel.borrow_and_update() {
        return Ok(PassOutcome {
            cancelled: true,
            ..PassOutcome::default()
        });
    }

    let workdir = unit.parent().unwrap_or_else(|| Path::new("."));
    let mut child = Command::new(program)
        .args(args)
        .arg(unit)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BuildError::ToolLaunch {
            program: program.to_string(),
            source,
        })?;
    debug!(program, unit = %unit.display(), pid = ?child.id(), "pass started");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, tx.clone()));
    }
    drop(tx);

    let mut output = String::new();
    let mut cancelled = false;
    let mut watching = true;
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    output.push_str(&line);
                    output.push('\n');
                    on_line(line);
                }
                None => break,
            },
            changed = cancel.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let stop = *cancel.borrow_and_update();
                if stop {
                    request_termination(&mut child).await;
                    cancelled = true;
                    watching = false;
                }
            }
        }
    }

    let status = child.wait().await.map_err(|source| BuildError::ToolLaunch {
        program: program.to_string(),
        source,
    })?;
    debug!(program, code = ?status.code(), cancelled, "pass finished");

    Ok(PassOutcome {
        exit_code: status.code(),
        output,
        cancelled,
    })
}

async fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = LineBuffer::default();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
            }
        }
    }
    if let Some(line) = lines.finish() {
        tx.send(line).ok();
    }
}

/// Ask the child to stop: SIGTERM where available, a kill request otherwise.
async fn request_termination(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let sent = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if matches!(sent, Ok(status) if status.success()) {
                debug!(pid, "sent SIGTERM");
                return;
            }
        }
    }
    if let Err(e) = child.start_kill() {
        debug!("kill request failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_splits_and_flushes() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.push(b"one\r\ntw"), vec!["one"]);
        assert_eq!(buf.push(b"o\nthree\nfo"), vec!["two", "three"]);
        assert_eq!(buf.finish().as_deref(), Some("fo"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn line_buffer_keeps_split_utf8_intact() {
        let mut buf = LineBuffer::default();
        let bytes = "é\n".as_bytes();
        assert!(buf.push(&bytes[..1]).is_empty());
        assert_eq!(buf.push(&bytes[1..]), vec!["é"]);
    }

    #[test]
    fn rerun_detection_ignores_case() {
        let phrases = crate::config::CompilerConfig::default().rerun_phrases;
        assert!(needs_rerun("LaTeX Warning: Label(s) may have changed. Rerun to get cross-references right.", &phrases));
        assert!(needs_rerun("please RERUN latex", &phrases));
        assert!(!needs_rerun("Output written on x.pdf", &phrases));
        assert!(!needs_rerun("anything", &[String::new()]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwards_both_streams_and_exit_code() {
        let tmp = tempfile::TempDir::new().unwrap();
        let unit = tmp.path().join("unit.tex");
        let args = vec![
            "-c".to_string(),
            "echo out; echo err >&2; printf 'tail %s' \"$(basename \"$1\")\"; exit 3".to_string(),
            "sh".to_string(),
        ];
        let (_tx, rx) = watch::channel(false);
        let mut seen = Vec::new();
        let outcome = run_pass("sh", &args, &unit, |line| seen.push(line), rx)
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
        assert!(!outcome.cancelled);
        seen.sort();
        assert_eq!(seen, vec!["err", "out", "tail unit.tex"]);
        assert!(outcome.output.contains("tail unit.tex\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_terminates_the_child() {
        let tmp = tempfile::TempDir::new().unwrap();
        let unit = tmp.path().join("unit.tex");
        let args = vec!["-c".to_string(), "exec sleep 30".to_string(), "sh".to_string()];
        let (tx, rx) = watch::channel(false);

        let pass = tokio::spawn(async move { run_pass("sh", &args, &unit, |_| {}, rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), pass)
            .await
            .expect("pass did not end after cancellation")
            .unwrap()
            .unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let (_tx, rx) = watch::channel(false);
        let err = run_pass("texslicer-no-such-program", &[], Path::new("/tmp/u.tex"), |_| {}, rx)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::ToolLaunch { .. }));
    }
}
