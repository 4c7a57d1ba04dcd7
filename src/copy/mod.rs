//! Moving files into the archive.
//!
//! Tasks are grouped into batches sharing a source and a destination
//! directory, so a bulk tool can copy a whole frame range in one invocation.
//! Each batch is owned end to end by one worker of a bounded pool:
//!
//! ```text
//! pending -> in-progress -> verified
//!                \--------> failed --(retry, with backoff)--> in-progress
//! ```
//!
//! Within an attempt, strategies are tried in order and the next one is only
//! used when the previous one fails outright. Every file is verified
//! afterwards regardless of what the tool reported.

mod strategy;

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::Hash32;
use crate::error::CopyError;
use crate::io::progress_style;
use crate::manifest::{EntryStatus, ManifestEntry};

pub use strategy::{Batch, CopyStrategy, NativeCopy, Robocopy, Rsync, SystemCopy, detect_strategies};

/// Shared flag that stops a copy run.
///
/// Batches not yet started are skipped and running tools are killed; every
/// affected task ends up failed with [`CopyError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How thoroughly a copied file is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// The destination exists.
    Exists,
    /// The destination exists and has the size of the source.
    #[default]
    Size,
    /// The destination has the same BLAKE3 hash as the source.
    Checksum,
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Number of batches copied at the same time.
    pub concurrency: usize,
    /// Attempts per task, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry, doubled for every further retry.
    pub backoff: Duration,
    pub verify: VerifyMode,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            verify: VerifyMode::Size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Verified,
    Failed,
}

/// A single file to copy.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyTask {
    pub source: Utf8PathBuf,
    pub destination: Utf8PathBuf,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<CopyError>,
    /// Size of the verified destination.
    pub size: Option<u64>,
}

impl CopyTask {
    pub fn new(source: impl Into<Utf8PathBuf>, destination: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            size: None,
        }
    }

    fn fail(&mut self, error: CopyError) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(error);
    }

    fn is_done(&self) -> bool {
        matches!(self.status, TaskStatus::Verified)
            || (self.status == TaskStatus::Failed && self.attempts == 0)
    }
}

impl From<CopyTask> for ManifestEntry {
    fn from(task: CopyTask) -> Self {
        let status = match task.status {
            TaskStatus::Verified => EntryStatus::Verified,
            _ => EntryStatus::Failed,
        };

        let error = match (&task.status, task.last_error) {
            (TaskStatus::Verified, _) => None,
            (_, Some(err)) => Some(err.to_string()),
            (_, None) => Some(CopyError::Unfinished.to_string()),
        };

        ManifestEntry {
            original: task.source,
            destination: Some(task.destination),
            size: task.size,
            status,
            error,
        }
    }
}

pub struct CopyEngine {
    strategies: Vec<Box<dyn CopyStrategy>>,
    options: CopyOptions,
    cancel: CancelToken,
}

impl CopyEngine {
    /// Engine using every copy tool found on this host.
    pub fn detect(options: CopyOptions) -> Self {
        Self::with_strategies(options, detect_strategies())
    }

    pub fn with_strategies(options: CopyOptions, strategies: Vec<Box<dyn CopyStrategy>>) -> Self {
        Self {
            strategies,
            options,
            cancel: CancelToken::default(),
        }
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Copies every task and reports each one, in input order.
    pub fn copy_all(&self, tasks: Vec<CopyTask>) -> Vec<ManifestEntry> {
        self.execute(tasks).into_iter().map(ManifestEntry::from).collect()
    }

    /// Reports what [`CopyEngine::copy_all`] would do without touching any
    /// file. Tasks whose source is missing are reported as failed.
    pub fn simulate(tasks: Vec<CopyTask>) -> Vec<ManifestEntry> {
        tasks
            .into_iter()
            .map(|task| match fs::metadata(&task.source) {
                Ok(meta) if meta.is_file() => ManifestEntry {
                    original: task.source,
                    destination: Some(task.destination),
                    size: Some(meta.len()),
                    status: EntryStatus::Simulated,
                    error: None,
                },
                _ => ManifestEntry {
                    error: Some(CopyError::SourceMissing(task.source.clone()).to_string()),
                    original: task.source,
                    destination: Some(task.destination),
                    size: None,
                    status: EntryStatus::Failed,
                },
            })
            .collect()
    }

    /// Runs the worker pool and returns the finished tasks in input order.
    pub fn execute(&self, tasks: Vec<CopyTask>) -> Vec<CopyTask> {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }

        let start = Instant::now();
        let pairs: Vec<_> = tasks
            .iter()
            .map(|t| (t.source.clone(), t.destination.clone()))
            .collect();
        let batches = group(tasks);
        let finished = AtomicUsize::new(0);

        let root_span = tracing::span!(Level::INFO, "copying");
        root_span.pb_set_length(total as u64);
        root_span.pb_set_style(&progress_style());
        root_span.pb_set_message("Copying dependencies...");
        let _enter = root_span.enter();

        tracing::info!(
            tasks = total,
            batches = batches.len(),
            concurrency = self.options.concurrency,
            "starting copy"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.concurrency.max(1))
            .thread_name(|i| format!("fixarc-copy-{i}"))
            .build();

        let (sender, receiver) = channel::<Vec<(usize, CopyTask)>>();
        let mut results: Vec<Option<CopyTask>> = (0..total).map(|_| None).collect();

        thread::scope(|scope| {
            let finished = &finished;

            scope.spawn(move || {
                match &pool {
                    Ok(pool) => pool.scope(|s| self.dispatch(s, batches, &sender, finished)),
                    Err(err) => {
                        tracing::warn!(%err, "couldn't build copy pool, using the global one");
                        rayon::scope(|s| self.dispatch(s, batches, &sender, finished));
                    }
                }
            });

            let mut shown = 0;
            loop {
                match receiver.recv_timeout(Duration::from_millis(100)) {
                    Ok(batch) => {
                        for (index, task) in batch {
                            results[index] = Some(task);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                let now = finished.load(Ordering::Relaxed);
                if now > shown {
                    root_span.pb_inc((now - shown) as u64);
                    shown = now;
                }
            }
        });

        let tasks = settle(results, pairs);

        let verified = tasks.iter().filter(|t| t.status == TaskStatus::Verified).count();
        tracing::info!(
            verified,
            failed = tasks.len() - verified,
            "copy finished {}",
            crate::io::as_overhead(start)
        );

        tasks
    }

    /// Hands every batch to the pool; results come back through `sender`.
    fn dispatch<'s>(
        &'s self,
        scope: &rayon::Scope<'s>,
        batches: Vec<Vec<(usize, CopyTask)>>,
        sender: &Sender<Vec<(usize, CopyTask)>>,
        finished: &'s AtomicUsize,
    ) {
        for batch in batches {
            let sender = sender.clone();
            scope.spawn(move |_| {
                let batch = self.run_guarded(batch, finished);
                let _ = sender.send(batch);
            });
        }
    }

    /// Runs a batch, turning a panic into failed tasks.
    fn run_guarded(&self, mut batch: Vec<(usize, CopyTask)>, finished: &AtomicUsize) -> Vec<(usize, CopyTask)> {
        // Tasks are plain data owned by this worker, a panic can at worst
        // leave some of them half updated, which is fixed up below.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.run_batch(&mut batch, finished);
        }));

        if let Err(panic) = outcome {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(%message, "copy worker panicked");

            for (_, task) in batch.iter_mut() {
                if task.status != TaskStatus::Verified {
                    task.fail(CopyError::Panic(message.clone()));
                }
            }
        }

        batch
    }

    fn run_batch(&self, batch: &mut [(usize, CopyTask)], finished: &AtomicUsize) {
        let done = |count: usize| {
            finished.fetch_add(count, Ordering::Relaxed);
        };

        if self.cancel.is_cancelled() {
            for (_, task) in batch.iter_mut() {
                task.fail(CopyError::Cancelled);
            }
            done(batch.len());
            return;
        }

        // missing sources can't get better by retrying
        for (_, task) in batch.iter_mut() {
            if !task.source.is_file() {
                tracing::warn!(source = %task.source, "source file is missing");
                task.fail(CopyError::SourceMissing(task.source.clone()));
            }
        }
        done(batch.iter().filter(|(_, t)| t.is_done()).count());

        for attempt in 1..=self.options.max_attempts.max(1) {
            let pending: Vec<usize> = (0..batch.len()).filter(|&i| !batch[i].1.is_done()).collect();
            if pending.is_empty() {
                return;
            }

            if attempt > 1 {
                let delay = self.options.backoff * 2u32.saturating_pow(attempt - 2);
                tracing::debug!(attempt, ?delay, files = pending.len(), "retrying batch");
                self.sleep(delay);
            }

            if self.cancel.is_cancelled() {
                for &i in &pending {
                    batch[i].1.fail(CopyError::Cancelled);
                }
                done(pending.len());
                return;
            }

            for &i in &pending {
                let task = &mut batch[i].1;
                task.status = TaskStatus::InProgress;
                task.attempts += 1;
            }

            let files = Batch {
                source_dir: parent(&batch[pending[0]].1.source),
                dest_dir: parent(&batch[pending[0]].1.destination),
                files: pending
                    .iter()
                    .map(|&i| (batch[i].1.source.clone(), batch[i].1.destination.clone()))
                    .collect(),
            };

            let outcome = fs::create_dir_all(&files.dest_dir)
                .map_err(CopyError::from)
                .and_then(|()| self.transfer(&files));

            if outcome == Err(CopyError::Cancelled) {
                for &i in &pending {
                    batch[i].1.fail(CopyError::Cancelled);
                }
                done(pending.len());
                return;
            }

            let last = attempt == self.options.max_attempts.max(1);
            let mut settled = 0;

            for &i in &pending {
                let task = &mut batch[i].1;
                match verify(task, self.options.verify) {
                    Ok(size) => {
                        task.status = TaskStatus::Verified;
                        task.size = Some(size);
                        task.last_error = None;
                        settled += 1;
                    }
                    Err(err) => {
                        let err = match &outcome {
                            Err(tool) => tool.clone(),
                            Ok(()) => err,
                        };
                        tracing::debug!(file = %task.source, attempt, %err, "copy attempt failed");
                        task.fail(err);
                        if last {
                            settled += 1;
                        }
                    }
                }
            }
            done(settled);
        }
    }

    /// Tries every strategy in order until one copies the batch.
    fn transfer(&self, batch: &Batch) -> Result<(), CopyError> {
        let mut last = CopyError::NoStrategy;

        for strategy in &self.strategies {
            match strategy.copy(batch, &self.cancel) {
                Ok(()) => {
                    tracing::debug!(strategy = strategy.name(), files = batch.files.len(), dir = %batch.dest_dir, "copied batch");
                    return Ok(());
                }
                Err(CopyError::Cancelled) => return Err(CopyError::Cancelled),
                Err(err) => {
                    tracing::warn!(strategy = strategy.name(), %err, "copy strategy failed, falling back");
                    last = err;
                }
            }
        }

        Err(last)
    }

    /// Sleeps, waking up early on cancellation.
    fn sleep(&self, delay: Duration) {
        let until = Instant::now() + delay;
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= until {
                break;
            }
            thread::sleep((until - now).min(Duration::from_millis(25)));
        }
    }
}

/// Fills slots no worker reported back with failed tasks, keeping every
/// result at its input index.
fn settle(results: Vec<Option<CopyTask>>, pairs: Vec<(Utf8PathBuf, Utf8PathBuf)>) -> Vec<CopyTask> {
    results
        .into_iter()
        .zip(pairs)
        .map(|(result, (source, destination))| {
            result.unwrap_or_else(|| {
                tracing::error!(%source, "copy task was never reported back");
                let mut task = CopyTask::new(source, destination);
                task.fail(CopyError::Unfinished);
                task
            })
        })
        .collect()
}

fn parent(path: &Utf8Path) -> Utf8PathBuf {
    path.parent().map(|p| p.to_path_buf()).unwrap_or_default()
}

/// Groups tasks by source and destination directory, keeping input indices.
fn group(tasks: Vec<CopyTask>) -> Vec<Vec<(usize, CopyTask)>> {
    let mut groups: BTreeMap<(Utf8PathBuf, Utf8PathBuf), Vec<(usize, CopyTask)>> = BTreeMap::new();

    for (index, task) in tasks.into_iter().enumerate() {
        let key = (parent(&task.source), parent(&task.destination));
        groups.entry(key).or_default().push((index, task));
    }

    groups.into_values().collect()
}

/// Checks a copied file, returning its size.
fn verify(task: &CopyTask, mode: VerifyMode) -> Result<u64, CopyError> {
    let failed = |reason: String| CopyError::Verification {
        path: task.destination.clone(),
        reason,
    };

    let dest = fs::metadata(&task.destination).map_err(|_| failed("destination does not exist".into()))?;
    if !dest.is_file() {
        return Err(failed("destination is not a file".into()));
    }
    if mode == VerifyMode::Exists {
        return Ok(dest.len());
    }

    let source = fs::metadata(&task.source).map_err(|err| failed(format!("source unreadable: {err}")))?;
    if source.len() != dest.len() {
        return Err(failed(format!(
            "size mismatch, expected {} bytes, found {}",
            source.len(),
            dest.len()
        )));
    }
    if mode == VerifyMode::Size {
        return Ok(dest.len());
    }

    let a = Hash32::hash_file(&task.source).map_err(|err| failed(format!("couldn't hash source: {err}")))?;
    let b = Hash32::hash_file(&task.destination).map_err(|err| failed(format!("couldn't hash destination: {err}")))?;
    if a != b {
        return Err(failed(format!("checksum mismatch, expected {}", a.to_hex())));
    }

    Ok(dest.len())
}
