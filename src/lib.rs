#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod collect;
pub mod copy;
mod core;
mod error;
pub mod gizmo;
pub mod graph;
mod io;
pub mod manifest;
pub mod mapper;
pub mod prune;
pub mod sequence;

use std::time::Instant;

use camino::Utf8PathBuf;
use console::style;

pub use crate::collect::{Category, DependencyCollector, DependencyReference};
pub use crate::copy::{CancelToken, CopyEngine, CopyOptions, CopyStrategy, CopyTask, VerifyMode};
pub use crate::core::{FrameRange, Metadata, Mode};
pub use crate::error::*;
pub use crate::gizmo::{DEFAULT_EXPANSION_LIMIT, GizmoDefinition, GizmoExpander};
pub use crate::graph::{Graph, GraphQueryPort, KnobValue, MemoryGraph, Node, NodeSet, ProjectFile, Region, Root};
pub use crate::io::{as_overhead, print_summary};
pub use crate::manifest::{EntryStatus, ManifestEntry, Report, RunStatus};
pub use crate::mapper::{ArchiveDestination, PathMapper};

/// A configured archive run.
///
/// Built through [`Archive::config`], then executed against any
/// [`GraphQueryPort`]:
///
/// ```no_run
/// use fixarc::{Archive, Metadata, ProjectFile};
///
/// let archive = Archive::config()
///     .archive_root("/mnt/archive")
///     .metadata(Metadata {
///         vendor: "FixFX".into(),
///         show: "BOB".into(),
///         season: Some("1".into()),
///         episode: "101".into(),
///         shot: "010".into(),
///     })
///     .update_script(true)
///     .finish()?;
///
/// let project = ProjectFile::open("/jobs/bob/010/comp_v012.nk.json")?;
/// let report = archive.run(&project)?;
/// assert!(report.is_success());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Archive {
    mapper: PathMapper,
    targets: Vec<String>,
    bake_gizmos: bool,
    update_script: bool,
    mode: Mode,
    frame_range: Option<FrameRange>,
    include_renders: bool,
    expansion_limit: usize,
    native_roots: Vec<Utf8PathBuf>,
    engine: CopyEngine,
    cancel: CancelToken,
}

impl Archive {
    pub fn config() -> Config {
        Config::new()
    }

    /// Token which stops the copy stage of [`Archive::run`] when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs the whole pipeline once.
    ///
    /// Structural problems (unreadable graph, no targets, runaway gizmo
    /// expansion) abort before any file is copied. Everything that goes wrong
    /// with individual files is recorded in the returned report instead.
    pub fn run(&self, port: &dyn GraphQueryPort) -> Result<Report, ArchiveError> {
        eprintln!(
            "Running {} in {} mode.",
            style("fixarc").red(),
            style(match self.mode {
                Mode::Archive => "archive",
                Mode::DryRun => "dry-run",
            })
            .blue()
        );

        let s = Instant::now();
        let mut warnings = Vec::new();

        let graph = Graph::load(port)?;

        let (targets, found) = prune::discover_targets(&graph.nodes, &self.targets)?;
        warnings.extend(found);

        let mut kept = prune::prune(&graph.nodes, &targets)?;
        tracing::info!(
            kept = kept.len(),
            total = graph.nodes.len(),
            "pruned graph {}",
            as_overhead(s)
        );

        if self.bake_gizmos {
            let expansion = GizmoExpander::new(&graph.gizmos, &self.native_roots)
                .limit(self.expansion_limit)
                .expand(&kept)?;
            tracing::info!(gizmos = expansion.count, "expanded gizmos");
            warnings.extend(expansion.warnings);
            kept = expansion.nodes;
        }

        let collection = DependencyCollector::new(&graph.root, &graph.script)
            .frame_range(self.frame_range)
            .include_renders(self.include_renders)
            .collect(&kept);
        tracing::info!(
            references = collection.references.len(),
            "collected dependencies {}",
            as_overhead(s)
        );
        warnings.extend(collection.warnings);

        let script_destination = self.mapper.map_script(&graph.script).path();
        let plan = self.mapper.map_all(&collection.references);
        warnings.extend(plan.warnings.iter().cloned());

        let nodes = if self.update_script {
            let (nodes, fallbacks) = mapper::repath(&kept, &plan, &script_destination);
            warnings.extend(fallbacks);
            nodes
        } else {
            kept
        };

        // unmapped references keep their slot so the report follows collection order
        let mut slots = Vec::with_capacity(plan.dependencies.len());
        let mut tasks = Vec::new();
        for mapped in plan.dependencies {
            match mapped.destination {
                Ok(destination) => {
                    tasks.push(CopyTask::new(mapped.reference.path, destination.path()));
                    slots.push(None);
                }
                Err(err) => slots.push(Some(ManifestEntry::unmapped(mapped.reference.path, err))),
            }
        }

        let copied = match self.mode {
            Mode::Archive => self.engine.copy_all(tasks),
            Mode::DryRun => CopyEngine::simulate(tasks),
        };
        let mut copied = copied.into_iter();
        let entries: Vec<ManifestEntry> = slots
            .into_iter()
            .filter_map(|slot| slot.or_else(|| copied.next()))
            .collect();

        let mut errors = Vec::new();
        let final_script = match self.mode {
            Mode::DryRun => Some(script_destination),
            Mode::Archive if self.cancel.is_cancelled() => {
                errors.push("cancelled before the script was saved".to_string());
                None
            }
            Mode::Archive => match port.write_script(&nodes, &graph.root, &script_destination) {
                Ok(()) => Some(script_destination),
                Err(err) => {
                    tracing::error!(%err, "couldn't save the archived script");
                    errors.push(err.to_string());
                    None
                }
            },
        };

        let report = Report::build(entries, &warnings, errors, final_script);
        tracing::info!(
            status = %report.status,
            warnings = report.warnings.len(),
            "archive finished {}",
            as_overhead(s)
        );

        Ok(report)
    }
}

/// A builder struct for creating an [`Archive`] with specified settings.
pub struct Config {
    archive_root: Option<Utf8PathBuf>,
    metadata: Metadata,
    targets: Vec<String>,
    bake_gizmos: bool,
    update_script: bool,
    mode: Mode,
    frame_range: Option<FrameRange>,
    include_renders: bool,
    expansion_limit: usize,
    native_roots: Vec<Utf8PathBuf>,
    copy: CopyOptions,
    strategies: Option<Vec<Box<dyn CopyStrategy>>>,
    cancel: CancelToken,
}

impl Config {
    fn new() -> Self {
        Self {
            archive_root: None,
            metadata: Metadata::default(),
            targets: Vec::new(),
            bake_gizmos: false,
            update_script: false,
            mode: Mode::default(),
            frame_range: None,
            include_renders: false,
            expansion_limit: DEFAULT_EXPANSION_LIMIT,
            native_roots: Vec::new(),
            copy: CopyOptions::default(),
            strategies: None,
            cancel: CancelToken::default(),
        }
    }

    /// Directory the archive tree is created under.
    pub fn archive_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.archive_root = Some(root.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Archive only the closure of this output node. Can be called many times;
    /// without any, every enabled write node is a target.
    pub fn target(mut self, name: impl Into<String>) -> Self {
        self.targets.push(name.into());
        self
    }

    pub fn targets(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.targets.extend(names.into_iter().map(Into::into));
        self
    }

    /// Replace non-native gizmos with the nodes they are made of.
    pub fn bake_gizmos(mut self, bake: bool) -> Self {
        self.bake_gizmos = bake;
        self
    }

    /// Point file knobs of the archived script at the archived files.
    pub fn update_script(mut self, update: bool) -> Self {
        self.update_script = update;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn dry_run(self, dry_run: bool) -> Self {
        self.mode(if dry_run { Mode::DryRun } else { Mode::Archive })
    }

    /// Frames collected for every image sequence.
    pub fn frame_range(mut self, range: FrameRange) -> Self {
        self.frame_range = Some(range);
        self
    }

    /// Also archive files rendered by write nodes.
    pub fn include_renders(mut self, include: bool) -> Self {
        self.include_renders = include;
        self
    }

    /// Upper bound on nested gizmo expansion passes.
    pub fn expansion_limit(mut self, limit: usize) -> Self {
        self.expansion_limit = limit;
        self
    }

    /// Gizmos defined under this directory ship with the host and are never
    /// expanded.
    pub fn native_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.native_roots.push(root.into());
        self
    }

    pub fn copy_options(mut self, options: CopyOptions) -> Self {
        self.copy = options;
        self
    }

    /// Use these copy strategies instead of probing the host for tools.
    pub fn strategies(mut self, strategies: Vec<Box<dyn CopyStrategy>>) -> Self {
        self.strategies = Some(strategies);
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn finish(self) -> Result<Archive, ArchiveError> {
        let root = self
            .archive_root
            .ok_or_else(|| ArchiveError::Config("archive root is not set".into()))?;
        if root.as_str().trim().is_empty() {
            return Err(ArchiveError::Config("archive root is empty".into()));
        }
        if self.copy.max_attempts == 0 {
            return Err(ArchiveError::Config("at least one copy attempt is required".into()));
        }

        let mapper = PathMapper::new(root, &self.metadata)?;

        let strategies = match (self.strategies, self.mode) {
            (Some(strategies), _) => strategies,
            // nothing is copied, no point in probing
            (None, Mode::DryRun) => Vec::new(),
            (None, Mode::Archive) => copy::detect_strategies(),
        };
        let engine = CopyEngine::with_strategies(self.copy, strategies).cancel_token(self.cancel.clone());

        tracing::debug!(shot = %mapper.shot_dir(), mode = ?self.mode, "archive configured");

        Ok(Archive {
            mapper,
            targets: self.targets,
            bake_gizmos: self.bake_gizmos,
            update_script: self.update_script,
            mode: self.mode,
            frame_range: self.frame_range,
            include_renders: self.include_renders,
            expansion_limit: self.expansion_limit,
            native_roots: self.native_roots,
            engine,
            cancel: self.cancel,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8Path;

    use super::*;
    use crate::copy::NativeCopy;

    fn metadata() -> Metadata {
        Metadata {
            vendor: "FixFX".into(),
            show: "BOB".into(),
            season: Some("1".into()),
            episode: "101".into(),
            shot: "010".into(),
        }
    }

    fn archive(root: &Utf8Path) -> Config {
        Archive::config()
            .archive_root(root)
            .metadata(metadata())
            .strategies(vec![Box::new(NativeCopy)])
    }

    #[test]
    fn test_finish_requires_root_and_metadata() {
        assert!(matches!(
            Archive::config().metadata(metadata()).finish(),
            Err(ArchiveError::Config(_))
        ));

        let mut partial = metadata();
        partial.shot = "  ".into();
        assert!(matches!(
            Archive::config().archive_root("/a").metadata(partial).finish(),
            Err(ArchiveError::ScriptMapping(PathMappingError::MissingSegment("shot")))
        ));
    }

    #[test]
    fn test_run_archives_closure() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let src = root.join("src");
        fs::create_dir_all(&src).unwrap();
        for frame in 1001..=1002 {
            fs::write(src.join(format!("plate.{frame}.exr")), b"px").unwrap();
        }
        fs::write(src.join("unused.exr"), b"px").unwrap();

        let graph = MemoryGraph::new(src.join("comp.nk"))
            .with_node(Node::new("Read1", "Read").knob("file", KnobValue::File(src.join("plate.%04d.exr").into())))
            .with_node(Node::new("Grade1", "Grade").input("Read1"))
            .with_node(Node::new("Write1", "Write").input("Grade1"))
            .with_node(Node::new("Read2", "Read").knob("file", KnobValue::File(src.join("unused.exr").into())));

        let report = archive(&root.join("archive"))
            .update_script(true)
            .finish()
            .unwrap()
            .run(&graph)
            .unwrap();

        assert_eq!(report.status, RunStatus::Ok);
        assert_eq!(report.dependencies.len(), 2);
        assert!(report.dependencies.iter().all(|e| e.status == EntryStatus::Verified));

        let shot = root.join("archive/FixFX/BOB/1/101/010");
        assert!(shot.join("elements/plates/plate.1001.exr").is_file());
        assert!(!shot.join("elements/plates/unused.exr").exists());

        let written = graph.written();
        assert_eq!(written.len(), 1);
        let (path, nodes) = &written[0];
        assert_eq!(*path, shot.join("project/nuke/010_archive.nk"));
        assert_eq!(report.final_script_path.as_ref(), Some(path));
        assert!(!nodes.contains("Read2"));
        assert_eq!(
            nodes.get("Read1").unwrap().knobs["file"],
            KnobValue::File("../../elements/plates/plate.%04d.exr".into())
        );
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("a.exr"), b"px").unwrap();

        let graph = MemoryGraph::new(root.join("comp.nk"))
            .with_node(Node::new("Read1", "Read").knob("file", KnobValue::File(root.join("a.exr").into())))
            .with_node(Node::new("Write1", "Write").input("Read1"));

        let report = archive(&root.join("archive"))
            .dry_run(true)
            .finish()
            .unwrap()
            .run(&graph)
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.dependencies[0].status, EntryStatus::Simulated);
        assert!(graph.written().is_empty());
        assert!(!root.join("archive").exists());
    }

    #[test]
    fn test_no_targets_is_fatal() {
        let graph = MemoryGraph::new("/jobs/comp.nk").with_node(Node::new("Read1", "Read"));
        let result = archive(Utf8Path::new("/archive")).finish().unwrap().run(&graph);
        assert!(matches!(result, Err(ArchiveError::NoTargetsFound)));
        assert!(graph.written().is_empty());
    }

    #[test]
    fn test_cancelled_run_fails_every_task() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("a.exr"), b"px").unwrap();

        let graph = MemoryGraph::new(root.join("comp.nk"))
            .with_node(Node::new("Read1", "Read").knob("file", KnobValue::File(root.join("a.exr").into())))
            .with_node(Node::new("Write1", "Write").input("Read1"));

        let archive = archive(&root.join("archive")).finish().unwrap();
        archive.cancel_token().cancel();
        let report = archive.run(&graph).unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.dependencies[0].error.as_deref(), Some("cancelled"));
        assert!(graph.written().is_empty());
    }
}
