//! Archive layout and path rewriting.
//!
//! Every archived file lands under
//!
//! ```text
//! <root>/<vendor>/<show>/[<season>/]<episode>/<shot>/
//!     project/nuke/<shot>_archive.<ext>        the script
//!     elements/<category>/[<subdir>/]<file>    everything it references
//! ```
//!
//! `<subdir>` only appears when files with the same name but from different
//! source directories would otherwise overwrite each other.

use std::collections::{HashMap, HashSet};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::collect::{Category, DependencyReference, KnobSite};
use crate::core::Metadata;
use crate::error::{PathMappingError, Warning};
use crate::graph::{KnobValue, NodeSet};

const UNSAFE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
/// Leading `..` of relative paths are kept, `..` above the root of an absolute
/// path is dropped.
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => {}
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

/// Lexical path from directory `from` to `to`.
///
/// Returns `None` when no such path exists without touching the filesystem,
/// e.g. when one path is absolute and the other is not, or they live on
/// different drives.
pub fn relative_path(from: &Utf8Path, to: &Utf8Path) -> Option<Utf8PathBuf> {
    let from = normalize_path(from);
    let to = normalize_path(to);

    if from.has_root() != to.has_root() {
        return None;
    }

    let mut a = from.components().peekable();
    let mut b = to.components().peekable();

    let prefixed = matches!(a.peek(), Some(Utf8Component::Prefix(_)))
        || matches!(b.peek(), Some(Utf8Component::Prefix(_)));
    if prefixed && a.next() != b.next() {
        return None;
    }

    while let (Some(x), Some(y)) = (a.peek(), b.peek()) {
        if x != y {
            break;
        }
        a.next();
        b.next();
    }

    let mut out = Utf8PathBuf::new();
    for component in a {
        match component {
            Utf8Component::Normal(_) => out.push(".."),
            // can't climb out of a directory we don't know the name of
            Utf8Component::ParentDir => return None,
            _ => {}
        }
    }
    for component in b {
        out.push(component);
    }

    if out.as_str().is_empty() {
        out.push(".");
    }
    Some(out)
}

/// Cleans one metadata value for use as a directory name.
fn sanitize(segment: &'static str, value: &str) -> Result<String, PathMappingError> {
    let clean: String = value
        .trim()
        .chars()
        .map(|c| if matches!(c, '\\' | '/' | ':') { '_' } else { c })
        .collect();

    if clean.is_empty() {
        return Err(PathMappingError::MissingSegment(segment));
    }
    if clean.contains(UNSAFE_CHARS) || clean.contains(char::is_whitespace) {
        return Err(PathMappingError::UnsafeSegment {
            segment,
            value: clean,
        });
    }
    Ok(clean)
}

fn is_unsafe_file_name(name: &str) -> bool {
    name.contains(UNSAFE_CHARS) || name.contains(char::is_whitespace)
}

/// Where one file goes inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDestination {
    pub root: Utf8PathBuf,
    /// vendor, show, season (if any), episode, shot
    pub shot: Vec<String>,
    /// `project/nuke` or `elements/<category>[/<subdir>]`
    pub area: Vec<String>,
    pub filename: String,
}

impl ArchiveDestination {
    pub fn dir(&self) -> Utf8PathBuf {
        let mut path = self.root.clone();
        path.extend(&self.shot);
        path.extend(&self.area);
        path
    }

    pub fn path(&self) -> Utf8PathBuf {
        self.dir().join(&self.filename)
    }
}

/// A collected reference together with where it goes.
#[derive(Debug, Clone)]
pub struct MappedDependency {
    pub reference: DependencyReference,
    pub destination: Result<ArchiveDestination, PathMappingError>,
}

impl MappedDependency {
    /// Archive location `site` should point at once repathed.
    pub fn destination_for(&self, site: &KnobSite) -> Option<Utf8PathBuf> {
        let destination = self.destination.as_ref().ok()?;
        Some(destination.dir().join(site.target.file_name()?))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MappingPlan {
    pub dependencies: Vec<MappedDependency>,
    pub warnings: Vec<Warning>,
}

/// Builds archive destinations for one shot.
#[derive(Debug, Clone)]
pub struct PathMapper {
    root: Utf8PathBuf,
    shot: Vec<String>,
    shot_name: String,
}

impl PathMapper {
    pub fn new(root: impl Into<Utf8PathBuf>, metadata: &Metadata) -> Result<Self, PathMappingError> {
        let mut shot = vec![
            sanitize("vendor", &metadata.vendor)?,
            sanitize("show", &metadata.show)?,
        ];
        if let Some(season) = metadata.season.as_deref()
            && !season.trim().is_empty()
        {
            shot.push(sanitize("season", season)?);
        }
        shot.push(sanitize("episode", &metadata.episode)?);
        let shot_name = sanitize("shot", &metadata.shot)?;
        shot.push(shot_name.clone());

        let root: Utf8PathBuf = root.into();

        Ok(Self {
            root: normalize_path(&root),
            shot,
            shot_name,
        })
    }

    /// Base directory of the shot inside the archive.
    pub fn shot_dir(&self) -> Utf8PathBuf {
        let mut path = self.root.clone();
        path.extend(&self.shot);
        path
    }

    pub fn map_script(&self, script: &Utf8Path) -> ArchiveDestination {
        let ext = script.extension().filter(|e| !e.is_empty()).unwrap_or("nk");

        ArchiveDestination {
            root: self.root.clone(),
            shot: self.shot.clone(),
            area: vec!["project".into(), "nuke".into()],
            filename: format!("{}_archive.{ext}", self.shot_name),
        }
    }

    pub fn map_dependency(
        &self,
        reference: &DependencyReference,
        subdir: Option<&str>,
    ) -> Result<ArchiveDestination, PathMappingError> {
        let filename = reference
            .path
            .file_name()
            .ok_or_else(|| PathMappingError::NoFileName(reference.path.clone()))?;

        let mut area = vec!["elements".to_string(), reference.category.to_string()];
        area.extend(subdir.map(str::to_string));

        Ok(ArchiveDestination {
            root: self.root.clone(),
            shot: self.shot.clone(),
            area,
            filename: filename.to_string(),
        })
    }

    /// Maps every reference, keeping distinct source files apart.
    ///
    /// Files from one source directory with the same category always share
    /// an archive directory, so the frames of a sequence stay together. A
    /// directory that would put a second source file (or sequence) under a
    /// name already taken gets a subdirectory of its own.
    pub fn map_all(&self, references: &[DependencyReference]) -> MappingPlan {
        let mut plan = MappingPlan::default();
        let mut warned = HashSet::new();

        let mut groups: Vec<SourceGroup> = Vec::new();
        let mut index: HashMap<(Category, Utf8PathBuf), usize> = HashMap::new();
        let mut group_of = Vec::with_capacity(references.len());

        for reference in references {
            let source_dir = reference.path.parent().map(Utf8Path::to_path_buf).unwrap_or_default();
            let i = *index
                .entry((reference.category, source_dir.clone()))
                .or_insert_with(|| {
                    groups.push(SourceGroup {
                        category: reference.category,
                        source_dir,
                        names: HashSet::new(),
                    });
                    groups.len() - 1
                });
            group_of.push(i);

            let names = &mut groups[i].names;
            names.extend(reference.path.file_name().map(str::to_string));
            if let Some(pattern) = &reference.sequence {
                names.insert(pattern.normalized_file_name());
            }

            for site in &reference.sites {
                let name = site.target.file_name().unwrap_or_default();
                if is_unsafe_file_name(name) && warned.insert(name.to_string()) {
                    tracing::warn!(file = %name, "file name is not LTFS safe");
                    plan.warnings.push(Warning::UnsafeFilename(name.to_string()));
                }
            }
        }

        let mut claims = Claims::new();
        let mut subdirs: Vec<Option<String>> = Vec::with_capacity(groups.len());

        for group in &groups {
            let subdir = if group.fits(&claims, &None) {
                None
            } else {
                let base = subdir_base(&group.source_dir);
                let subdir = std::iter::once(base.clone())
                    .chain((2..).map(|n| format!("{base}_{n}")))
                    .map(Some)
                    .find(|subdir| group.fits(&claims, subdir))
                    .unwrap_or(Some(base));
                tracing::debug!(source = %group.source_dir, subdir = ?subdir, "disambiguating colliding file names");
                subdir
            };

            let taken = claims.entry((group.category, subdir.clone())).or_default();
            for name in &group.names {
                taken.insert(name.as_str(), group.source_dir.as_path());
            }
            subdirs.push(subdir);
        }

        for (reference, i) in references.iter().zip(group_of) {
            let destination = self.map_dependency(reference, subdirs[i].as_deref());
            if let Err(err) = &destination {
                tracing::error!(path = %reference.path, %err, "couldn't map dependency");
            }

            plan.dependencies.push(MappedDependency {
                reference: reference.clone(),
                destination,
            });
        }

        plan
    }
}

/// (category, subdir) -> file name -> source directory that took it
type Claims<'a> = HashMap<(Category, Option<String>), HashMap<&'a str, &'a Utf8Path>>;

/// References sharing a category and a source directory.
struct SourceGroup {
    category: Category,
    source_dir: Utf8PathBuf,
    /// Concrete file names, plus the hash form of every sequence pattern.
    names: HashSet<String>,
}

impl SourceGroup {
    /// Whether none of the group's names is taken by another source in `subdir`.
    fn fits(&self, claims: &Claims<'_>, subdir: &Option<String>) -> bool {
        claims
            .get(&(self.category, subdir.clone()))
            .is_none_or(|taken| {
                self.names.iter().all(|name| {
                    taken
                        .get(name.as_str())
                        .is_none_or(|dir| *dir == self.source_dir.as_path())
                })
            })
    }
}

fn subdir_base(source_dir: &Utf8Path) -> String {
    source_dir
        .file_name()
        .map(|name| {
            name.chars()
                .map(|c| if UNSAFE_CHARS.contains(&c) || c.is_whitespace() { '_' } else { c })
                .collect::<String>()
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "source".to_string())
}

/// Rewrites every mapped file knob relative to the script's new directory.
///
/// Returns a new node set; `nodes` is left as it was so the collected
/// references keep pointing at the original files.
pub fn repath(nodes: &NodeSet, plan: &MappingPlan, script: &Utf8Path) -> (NodeSet, Vec<Warning>) {
    let mut out = nodes.clone();
    let mut warnings = Vec::new();
    let mut done = HashSet::new();
    let script_dir = script.parent().unwrap_or(Utf8Path::new(""));

    for mapped in &plan.dependencies {
        for site in &mapped.reference.sites {
            let Some(target) = mapped.destination_for(site) else {
                continue;
            };
            if !done.insert((site.node.as_str(), site.knob.as_str())) {
                continue;
            }

            let value = match relative_path(script_dir, &target) {
                Some(relative) => relative,
                None => {
                    tracing::warn!(from = %script_dir, to = %target, "no relative path, keeping absolute");
                    warnings.push(Warning::RelativePathFallback {
                        from: script_dir.to_path_buf(),
                        to: target.clone(),
                    });
                    target.clone()
                }
            };

            if let Some(node) = out.get_mut(&site.node) {
                tracing::debug!(node = %site.node, knob = %site.knob, %value, "repathed knob");
                node.knobs.insert(site.knob.clone(), KnobValue::File(value.into_string()));
            }
        }
    }

    (out, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::sequence::SequencePattern;

    fn metadata() -> Metadata {
        Metadata {
            vendor: "FixFX".into(),
            show: "BOB".into(),
            season: Some("1".into()),
            episode: "101".into(),
            shot: "010".into(),
        }
    }

    fn reference(path: &str, node: &str) -> DependencyReference {
        frame_reference(path, 1001, node)
    }

    fn frame_reference(path: &str, frame: i64, node: &str) -> DependencyReference {
        let sequence = SequencePattern::detect(path);
        DependencyReference {
            path: match &sequence {
                Some(pattern) => pattern.frame(frame),
                None => path.into(),
            },
            template: path.into(),
            frame: sequence.as_ref().map(|_| frame),
            sequence,
            category: Category::Plates,
            sites: vec![KnobSite {
                node: node.into(),
                knob: "file".into(),
                target: path.into(),
            }],
            exists: true,
        }
    }

    fn destinations(plan: &MappingPlan) -> Vec<Utf8PathBuf> {
        plan.dependencies
            .iter()
            .map(|m| m.destination.as_ref().unwrap().path())
            .collect()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Utf8Path::new("/a/./b/../c")), "/a/c");
        assert_eq!(normalize_path(Utf8Path::new("a/../../b")), "../b");
        assert_eq!(normalize_path(Utf8Path::new("/../a")), "/a");
    }

    #[test]
    fn test_relative_path() {
        let rel = |a: &str, b: &str| relative_path(Utf8Path::new(a), Utf8Path::new(b));

        assert_eq!(rel("/a/b/c", "/a/d/e.exr"), Some("../../d/e.exr".into()));
        assert_eq!(rel("/a/b", "/a/b/c.exr"), Some("c.exr".into()));
        assert_eq!(rel("/a/b", "/a/b"), Some(".".into()));
        assert_eq!(rel("/a", "relative/c.exr"), None);
        assert_eq!(rel("../x", "y"), None);
    }

    #[test]
    fn test_scenario_layout() {
        let mapper = PathMapper::new("/archive", &metadata()).unwrap();

        let script = mapper.map_script(Utf8Path::new("/shows/bob/comp_v012.nk"));
        assert_eq!(
            script.path(),
            "/archive/FixFX/BOB/1/101/010/project/nuke/010_archive.nk"
        );

        let plate = mapper
            .map_dependency(&reference("/src/plate.%04d.exr", "Read1"), None)
            .unwrap();
        assert_eq!(
            plate.path(),
            "/archive/FixFX/BOB/1/101/010/elements/plates/plate.1001.exr"
        );
    }

    #[test]
    fn test_season_is_optional() {
        let mut metadata = metadata();
        metadata.season = None;
        let mapper = PathMapper::new("/archive", &metadata).unwrap();
        assert_eq!(mapper.shot_dir(), "/archive/FixFX/BOB/101/010");

        let script = mapper.map_script(Utf8Path::new("/shows/comp"));
        assert_eq!(script.filename, "010_archive.nk");
    }

    #[test]
    fn test_metadata_is_sanitized() {
        let mut metadata = metadata();
        metadata.vendor = " Fix/FX ".into();
        metadata.show = "B:O\\B".into();
        let mapper = PathMapper::new("/archive", &metadata).unwrap();
        assert_eq!(mapper.shot_dir(), "/archive/Fix_FX/B_O_B/1/101/010");

        metadata.episode = "  ".into();
        assert_eq!(
            PathMapper::new("/archive", &metadata).unwrap_err(),
            PathMappingError::MissingSegment("episode")
        );

        metadata.episode = "ep 1".into();
        assert!(matches!(
            PathMapper::new("/archive", &metadata),
            Err(PathMappingError::UnsafeSegment { segment: "episode", .. })
        ));
    }

    #[test]
    fn test_repath_scenario() {
        let mapper = PathMapper::new("/archive", &metadata()).unwrap();
        let script = mapper.map_script(Utf8Path::new("/shows/comp.nk")).path();
        let nodes = NodeSet::new([Node::new("Read1", "Read").knob(
            "file",
            KnobValue::File("/src/plate.%04d.exr".into()),
        )]);

        let plan = mapper.map_all(&[reference("/src/plate.%04d.exr", "Read1")]);
        let (repathed, warnings) = repath(&nodes, &plan, &script);

        assert!(warnings.is_empty());
        assert_eq!(
            repathed.get("Read1").unwrap().knobs["file"],
            KnobValue::File("../../elements/plates/plate.%04d.exr".into())
        );
        // the input set is untouched
        assert_eq!(
            nodes.get("Read1").unwrap().knobs["file"],
            KnobValue::File("/src/plate.%04d.exr".into())
        );
    }

    #[test]
    fn test_relative_paths_resolve_to_destinations() {
        let mapper = PathMapper::new("/archive", &metadata()).unwrap();
        let script = mapper.map_script(Utf8Path::new("/shows/comp.nk")).path();
        let references = [
            reference("/src/a/plate.%04d.exr", "Read1"),
            reference("/src/b/plate.%04d.exr", "Read2"),
            reference("/lut/show.cube", "LUT"),
        ];
        let nodes: NodeSet = ["Read1", "Read2", "LUT"]
            .into_iter()
            .map(|n| Node::new(n, "Read"))
            .collect();

        let plan = mapper.map_all(&references);
        let (repathed, _) = repath(&nodes, &plan, &script);
        let script_dir = script.parent().unwrap();

        for mapped in &plan.dependencies {
            let site = &mapped.reference.sites[0];
            let KnobValue::File(value) = &repathed.get(&site.node).unwrap().knobs[&site.knob] else {
                panic!("knob is not a file");
            };
            assert_eq!(
                normalize_path(&script_dir.join(value)),
                mapped.destination_for(site).unwrap()
            );
        }
    }

    #[test]
    fn test_collisions_get_subdirectories() {
        let mapper = PathMapper::new("/archive", &metadata()).unwrap();
        let plan = mapper.map_all(&[
            reference("/src/shotA/plate.%04d.exr", "Read1"),
            reference("/src/shotB/plate.%04d.exr", "Read2"),
            reference("/other/shotB/plate.%04d.exr", "Read3"),
            reference("/src/shotA/plate.%04d.exr", "Read4"),
        ]);

        let dirs: Vec<_> = plan
            .dependencies
            .iter()
            .map(|m| m.destination.as_ref().unwrap().dir())
            .collect();
        let base = Utf8PathBuf::from("/archive/FixFX/BOB/1/101/010/elements/plates");
        assert_eq!(dirs[0], base);
        assert_eq!(dirs[1], base.join("shotB"));
        assert_eq!(dirs[2], base.join("shotB_2"));
        assert_eq!(dirs[3], base);

        let unique: HashSet<_> = plan
            .dependencies
            .iter()
            .filter_map(|m| m.destination_for(&m.reference.sites[0]))
            .collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_token_styles_do_not_hide_collisions() {
        let mapper = PathMapper::new("/archive", &metadata()).unwrap();
        let plan = mapper.map_all(&[
            frame_reference("/a/plate.%04d.exr", 1001, "Read1"),
            frame_reference("/a/plate.%04d.exr", 1002, "Read1"),
            frame_reference("/b/plate.####.exr", 1001, "Read2"),
            frame_reference("/b/plate.####.exr", 1002, "Read2"),
        ]);

        let paths = destinations(&plan);
        let base = Utf8PathBuf::from("/archive/FixFX/BOB/1/101/010/elements/plates");
        assert_eq!(paths[0], base.join("plate.1001.exr"));
        assert_eq!(paths[1], base.join("plate.1002.exr"));
        assert_eq!(paths[2], base.join("b/plate.1001.exr"));
        assert_eq!(paths[3], base.join("b/plate.1002.exr"));
    }

    #[test]
    fn test_single_frame_does_not_overwrite_a_sequence_frame() {
        let mapper = PathMapper::new("/archive", &metadata()).unwrap();
        let plan = mapper.map_all(&[
            frame_reference("/a/plate.%04d.exr", 1001, "Read1"),
            frame_reference("/a/plate.%04d.exr", 1002, "Read1"),
            reference("/b/plate.1001.exr", "Read2"),
            // no shared names, so this one stays at the top level
            reference("/c/grain.exr", "Read3"),
        ]);

        let paths = destinations(&plan);
        let unique: HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), paths.len());

        let base = Utf8PathBuf::from("/archive/FixFX/BOB/1/101/010/elements/plates");
        assert_eq!(paths[2], base.join("b/plate.1001.exr"));
        assert_eq!(paths[3], base.join("grain.exr"));
    }

    #[test]
    fn test_disjoint_frames_of_two_sequences_stay_apart() {
        let mapper = PathMapper::new("/archive", &metadata()).unwrap();
        let plan = mapper.map_all(&[
            frame_reference("/a/plate.%04d.exr", 1001, "Read1"),
            frame_reference("/b/plate.%04d.exr", 1005, "Read2"),
        ]);

        // the knobs would otherwise read each other's frames
        let [first, second] = &plan.dependencies[..] else {
            panic!("expected two dependencies");
        };
        assert_ne!(
            first.destination_for(&first.reference.sites[0]),
            second.destination_for(&second.reference.sites[0])
        );
    }

    #[test]
    fn test_sites_sharing_a_file_keep_their_own_targets() {
        let mapper = PathMapper::new("/archive", &metadata()).unwrap();
        let script = mapper.map_script(Utf8Path::new("/shows/comp.nk")).path();

        // Still1 reads one frame directly, Read1 reads the whole sequence
        let mut shared = frame_reference("/src/plate.%04d.exr", 1001, "Read1");
        shared.sites.insert(
            0,
            KnobSite {
                node: "Still1".into(),
                knob: "file".into(),
                target: "/src/plate.1001.exr".into(),
            },
        );
        let references = [shared, frame_reference("/src/plate.%04d.exr", 1002, "Read1")];
        let nodes: NodeSet = ["Still1", "Read1"]
            .into_iter()
            .map(|n| Node::new(n, "Read"))
            .collect();

        let plan = mapper.map_all(&references);
        let (repathed, _) = repath(&nodes, &plan, &script);

        assert_eq!(
            repathed.get("Still1").unwrap().knobs["file"],
            KnobValue::File("../../elements/plates/plate.1001.exr".into())
        );
        assert_eq!(
            repathed.get("Read1").unwrap().knobs["file"],
            KnobValue::File("../../elements/plates/plate.%04d.exr".into())
        );
    }

    #[test]
    fn test_unsafe_file_names_warn() {
        let mapper = PathMapper::new("/archive", &metadata()).unwrap();
        let plan = mapper.map_all(&[reference("/src/my plate.exr", "Read1")]);
        assert_eq!(
            plan.warnings,
            vec![Warning::UnsafeFilename("my plate.exr".into())]
        );
        assert!(plan.dependencies[0].destination.is_ok());
    }
}
