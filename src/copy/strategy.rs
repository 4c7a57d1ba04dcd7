use std::fs;
use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::copy::CancelToken;
use crate::error::CopyError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Keeps tool command lines well below platform argument limits.
const MAX_ARGS_LEN: usize = 8000;

/// Files of one batch, all sharing a source and a destination directory.
#[derive(Debug, Clone)]
pub struct Batch {
    pub source_dir: Utf8PathBuf,
    pub dest_dir: Utf8PathBuf,
    /// `(source, destination)` pairs.
    pub files: Vec<(Utf8PathBuf, Utf8PathBuf)>,
}

impl Batch {
    /// Pairs whose destination file name differs from the source file name
    /// can't be handed to directory based tools.
    fn is_renaming(&self) -> bool {
        self.files
            .iter()
            .any(|(src, dst)| src.file_name() != dst.file_name())
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().filter_map(|(src, _)| src.file_name())
    }
}

/// One way of moving files into the archive.
///
/// A strategy either copies the whole batch or fails outright; files that went
/// missing along the way are caught by verification afterwards.
pub trait CopyStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn copy(&self, batch: &Batch, cancel: &CancelToken) -> Result<(), CopyError>;
}

/// `robocopy`, the bulk copy tool shipped with Windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct Robocopy;

impl CopyStrategy for Robocopy {
    fn name(&self) -> &'static str {
        "robocopy"
    }

    fn copy(&self, batch: &Batch, cancel: &CancelToken) -> Result<(), CopyError> {
        if batch.is_renaming() {
            return Err(unsupported(self.name()));
        }

        for names in chunk_names(batch.names()) {
            let mut cmd = Command::new("robocopy");
            cmd.arg(batch.source_dir.as_str())
                .arg(batch.dest_dir.as_str())
                .args(names)
                .args(["/COPY:DAT", "/R:1", "/W:1", "/NJH", "/NJS", "/NP", "/NFL", "/NDL"]);

            // exit codes below 8 report success with various details
            run_tool(&mut cmd, None, self.name(), cancel, |status| {
                status.code().is_some_and(|code| code < 8)
            })?;
        }

        Ok(())
    }
}

/// `rsync`, reading the file list of the batch from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rsync;

impl CopyStrategy for Rsync {
    fn name(&self) -> &'static str {
        "rsync"
    }

    fn copy(&self, batch: &Batch, cancel: &CancelToken) -> Result<(), CopyError> {
        if batch.is_renaming() {
            return Err(unsupported(self.name()));
        }

        let list: String = batch.names().map(|name| format!("{name}\n")).collect();

        let mut cmd = Command::new("rsync");
        cmd.args(["--times", "--files-from=-"])
            .arg(format!("{}/", batch.source_dir))
            .arg(format!("{}/", batch.dest_dir));

        run_tool(&mut cmd, Some(list), self.name(), cancel, ExitStatus::success)
    }
}

/// Plain `cp -p`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCopy;

impl CopyStrategy for SystemCopy {
    fn name(&self) -> &'static str {
        "cp"
    }

    fn copy(&self, batch: &Batch, cancel: &CancelToken) -> Result<(), CopyError> {
        if batch.is_renaming() {
            return Err(unsupported(self.name()));
        }

        let sources = batch.files.iter().map(|(src, _)| src.as_str());
        for chunk in chunk_names(sources) {
            let mut cmd = Command::new("cp");
            cmd.arg("-p").args(chunk).arg(format!("{}/", batch.dest_dir));

            run_tool(&mut cmd, None, self.name(), cancel, ExitStatus::success)?;
        }

        Ok(())
    }
}

/// File-by-file copy through the standard library, always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCopy;

impl CopyStrategy for NativeCopy {
    fn name(&self) -> &'static str {
        "native"
    }

    fn copy(&self, batch: &Batch, cancel: &CancelToken) -> Result<(), CopyError> {
        let mut first_error = None;

        for (src, dst) in &batch.files {
            if cancel.is_cancelled() {
                return Err(CopyError::Cancelled);
            }
            if let Err(err) = fs::copy(src, dst) {
                tracing::debug!(%src, %dst, %err, "native copy failed");
                first_error.get_or_insert(CopyError::from(err));
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Finds the copy tools this host has, fastest first.
///
/// [`NativeCopy`] always closes the chain.
pub fn detect_strategies() -> Vec<Box<dyn CopyStrategy>> {
    let mut strategies: Vec<Box<dyn CopyStrategy>> = Vec::new();

    if cfg!(windows) {
        if is_on_path("robocopy", &["/?"]) {
            strategies.push(Box::new(Robocopy));
        }
    } else if is_on_path("rsync", &["--version"]) {
        strategies.push(Box::new(Rsync));
    }

    if !cfg!(windows) && is_on_path("cp", &["--help"]) {
        strategies.push(Box::new(SystemCopy));
    }

    strategies.push(Box::new(NativeCopy));

    tracing::info!(
        strategies = ?strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
        "detected copy tools"
    );
    strategies
}

/// Whether `tool` can be started at all; its exit status doesn't matter.
fn is_on_path(tool: &str, args: &[&str]) -> bool {
    Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

fn unsupported(tool: &'static str) -> CopyError {
    CopyError::Spawn {
        tool,
        message: "batch renames files".into(),
    }
}

/// Splits arguments into command lines of bounded length.
fn chunk_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<Vec<&'a str>> {
    let mut chunks = vec![];
    let mut current = vec![];
    let mut len = 0;

    for name in names {
        if !current.is_empty() && len + name.len() + 1 > MAX_ARGS_LEN {
            chunks.push(std::mem::take(&mut current));
            len = 0;
        }
        len += name.len() + 1;
        current.push(name);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Runs an external tool to completion, killing it when `cancel` fires.
fn run_tool(
    cmd: &mut Command,
    input: Option<String>,
    tool: &'static str,
    cancel: &CancelToken,
    success: impl Fn(&ExitStatus) -> bool,
) -> Result<(), CopyError> {
    let spawn_error = |err: std::io::Error| CopyError::Spawn {
        tool,
        message: err.to_string(),
    };

    let mut child = cmd
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_error)?;

    tracing::debug!(tool, "spawned copy tool");

    let writer = match (input, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => Some(thread::spawn(move || {
            let _ = pipe.write_all(input.as_bytes());
        })),
        _ => None,
    };

    let reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = String::new();
            let _ = pipe.read_to_string(&mut buffer);
            buffer
        })
    });

    let status = loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::warn!(tool, "copy tool killed on cancellation");
            return Err(CopyError::Cancelled);
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    if let Some(writer) = writer {
        let _ = writer.join();
    }
    let stderr = reader
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default();

    if success(&status) {
        return Ok(());
    }

    Err(CopyError::Tool {
        tool,
        status: status.to_string(),
        stderr: stderr.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(dir: &Utf8Path, names: &[&str]) -> Batch {
        let src = dir.join("src");
        let dst = dir.join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();

        Batch {
            files: names
                .iter()
                .map(|n| (src.join(n), dst.join(n)))
                .collect(),
            source_dir: src,
            dest_dir: dst,
        }
    }

    #[test]
    fn test_native_copy() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let batch = batch(root, &["a.exr", "b.exr"]);
        for (src, _) in &batch.files {
            fs::write(src, src.as_str()).unwrap();
        }

        NativeCopy.copy(&batch, &CancelToken::default()).unwrap();
        for (src, dst) in &batch.files {
            assert_eq!(fs::read_to_string(dst).unwrap(), src.as_str());
        }
    }

    #[test]
    fn test_native_copy_reports_missing_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let batch = batch(root, &["gone.exr"]);

        assert!(matches!(
            NativeCopy.copy(&batch, &CancelToken::default()),
            Err(CopyError::Io(_))
        ));
    }

    #[test]
    fn test_native_copy_stops_when_cancelled() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let batch = batch(root, &["a.exr"]);
        let cancel = CancelToken::default();
        cancel.cancel();

        assert_eq!(NativeCopy.copy(&batch, &cancel), Err(CopyError::Cancelled));
    }

    #[test]
    fn test_chunk_names() {
        let long = "x".repeat(MAX_ARGS_LEN / 2);
        let names = [long.as_str(), long.as_str(), "short"];
        let chunks = chunk_names(names.into_iter());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], vec![long.as_str(), "short"]);
        assert!(chunk_names(std::iter::empty()).is_empty());
    }

    #[test]
    fn test_missing_tool_is_a_spawn_error() {
        let mut cmd = Command::new("fixarc-no-such-tool");
        let err = run_tool(&mut cmd, None, "ghost", &CancelToken::default(), ExitStatus::success)
            .unwrap_err();
        assert!(matches!(err, CopyError::Spawn { tool: "ghost", .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_running_tool_is_killed_on_cancel() {
        let cancel = CancelToken::default();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let result = run_tool(&mut cmd, None, "sleep", &cancel, ExitStatus::success);
        canceller.join().unwrap();

        assert_eq!(result, Err(CopyError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_tool_reports_status_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo broken >&2; exit 3"]);
        let err = run_tool(&mut cmd, None, "sh", &CancelToken::default(), ExitStatus::success)
            .unwrap_err();

        let CopyError::Tool { tool, stderr, .. } = &err else {
            panic!("expected a tool error, got {err:?}");
        };
        assert_eq!(*tool, "sh");
        assert_eq!(stderr, "broken");
    }

    #[cfg(unix)]
    #[test]
    fn test_system_copy() {
        if !is_on_path("cp", &["--help"]) {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let batch = batch(root, &["a.1001.exr", "a.1002.exr"]);
        for (src, _) in &batch.files {
            fs::write(src, src.as_str()).unwrap();
        }

        SystemCopy.copy(&batch, &CancelToken::default()).unwrap();
        for (src, dst) in &batch.files {
            assert_eq!(fs::read_to_string(dst).unwrap(), src.as_str());
        }
    }

    #[test]
    fn test_directory_tools_refuse_renaming_batches() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let mut batch = batch(root, &["a.exr"]);
        batch.files[0].1 = batch.dest_dir.join("renamed.exr");
        fs::write(&batch.files[0].0, "px").unwrap();

        let cancel = CancelToken::default();
        let tools: [&dyn CopyStrategy; 3] = [&Robocopy, &Rsync, &SystemCopy];
        for tool in tools {
            assert!(
                matches!(tool.copy(&batch, &cancel), Err(CopyError::Spawn { .. })),
                "{} accepted a renaming batch",
                tool.name()
            );
        }
        // nothing was started, so nothing was written
        assert!(!batch.files[0].1.exists());

        NativeCopy.copy(&batch, &cancel).unwrap();
        assert_eq!(fs::read_to_string(&batch.files[0].1).unwrap(), "px");
    }

    #[test]
    fn test_detected_tools_end_native() {
        let strategies = detect_strategies();
        assert_eq!(strategies.last().map(|s| s.name()), Some("native"));
    }
}
