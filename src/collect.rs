//! Extraction of external file references from a node set.

use std::collections::HashMap;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::core::FrameRange;
use crate::error::Warning;
use crate::graph::{KnobValue, Node, NodeSet, Root, replace_expressions};
use crate::mapper::normalize_path;
use crate::prune::is_write_class;
use crate::sequence::SequencePattern;

/// Kind of element a file reference belongs to, decides the archive folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Plates,
    Geometry,
    Luts,
    Renders,
    Misc,
}

impl Category {
    pub fn of(class: &str) -> Self {
        match class {
            "Read" | "DeepRead" => Category::Plates,
            "ReadGeo" | "ReadGeo2" | "ParticleCache" | "PointCloudGenerator" => Category::Geometry,
            c if c.starts_with("Camera") || c.starts_with("Axis") => Category::Geometry,
            "OCIOFileTransform" | "GenerateLUT" | "Vectorfield" => Category::Luts,
            c if is_write_class(c) => Category::Renders,
            _ => Category::Misc,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Plates => "plates",
            Category::Geometry => "geometry",
            Category::Luts => "luts",
            Category::Renders => "renders",
            Category::Misc => "misc",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A knob that holds a file reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KnobSite {
    pub node: String,
    pub knob: String,
    /// What this knob points at once resolved: the pattern for sequences,
    /// the file itself otherwise. Sites sharing a file may disagree here.
    pub target: Utf8PathBuf,
}

/// One concrete external file needed by the archived script.
///
/// Sequences produce one reference per frame, all sharing the same
/// [`SequencePattern`].
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyReference {
    /// Absolute, normalized location of the file.
    pub path: Utf8PathBuf,
    /// Knob value before evaluation, as found on the first site.
    pub template: String,
    pub sequence: Option<SequencePattern>,
    /// `None` for non-sequences and for sequences without a known range.
    pub frame: Option<i64>,
    pub category: Category,
    /// Every knob that resolves to this file.
    pub sites: Vec<KnobSite>,
    pub exists: bool,
}

impl DependencyReference {
    pub fn is_sequence(&self) -> bool {
        self.sequence.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub references: Vec<DependencyReference>,
    pub warnings: Vec<Warning>,
}

pub struct DependencyCollector<'a> {
    root: &'a Root,
    script: &'a Utf8Path,
    frame_range: Option<FrameRange>,
    include_renders: bool,
}

impl<'a> DependencyCollector<'a> {
    pub fn new(root: &'a Root, script: &'a Utf8Path) -> Self {
        Self {
            root,
            script,
            frame_range: None,
            include_renders: false,
        }
    }

    /// Frame range used for every sequence, ahead of node ranges and probing.
    pub fn frame_range(mut self, range: Option<FrameRange>) -> Self {
        self.frame_range = range;
        self
    }

    pub fn include_renders(mut self, include: bool) -> Self {
        self.include_renders = include;
        self
    }

    fn script_dir(&self) -> &Utf8Path {
        self.script.parent().unwrap_or(Utf8Path::new(""))
    }

    /// Collects every file referenced by `nodes`.
    ///
    /// Expressions are evaluated against `nodes` only, so the result never
    /// depends on nodes that are not part of the archived script.
    pub fn collect(&self, nodes: &NodeSet) -> Collection {
        let mut out = Collection::default();
        // a file read under two categories is archived in both folders
        let mut seen: HashMap<(Utf8PathBuf, Category), usize> = HashMap::new();

        for node in nodes {
            if node.is_backdrop() {
                continue;
            }
            let category = Category::of(&node.class);
            if category == Category::Renders && !self.include_renders {
                continue;
            }

            for (knob, value) in &node.knobs {
                let KnobValue::File(template) = value else { continue };

                let resolved = self.evaluate(nodes, node, knob, template, &mut out.warnings);
                if resolved.trim().is_empty() {
                    continue;
                }
                let path = self.absolute(&resolved);

                for (path, sequence, frame) in self.expand(node, knob, &path, &mut out.warnings) {
                    let site = KnobSite {
                        node: node.name.clone(),
                        knob: knob.clone(),
                        target: sequence.as_ref().map_or_else(|| path.clone(), SequencePattern::as_path),
                    };

                    if let Some(&i) = seen.get(&(path.clone(), category)) {
                        let sites = &mut out.references[i].sites;
                        if !sites.contains(&site) {
                            sites.push(site);
                        }
                        continue;
                    }

                    let exists = path.is_file();
                    if !exists {
                        tracing::warn!(node = %node.name, knob = %knob, %path, "missing file");
                        out.warnings.push(Warning::MissingFile {
                            node: node.name.clone(),
                            knob: knob.clone(),
                            path: path.clone(),
                        });
                    }

                    seen.insert((path.clone(), category), out.references.len());
                    out.references.push(DependencyReference {
                        path,
                        template: template.clone(),
                        sequence,
                        frame,
                        category,
                        sites: vec![site],
                        exists,
                    });
                }
            }
        }

        tracing::info!(
            references = out.references.len(),
            warnings = out.warnings.len(),
            "collected dependencies"
        );
        out
    }

    /// Turns one resolved path into concrete files.
    fn expand(
        &self,
        node: &Node,
        knob: &str,
        path: &Utf8Path,
        warnings: &mut Vec<Warning>,
    ) -> Vec<(Utf8PathBuf, Option<SequencePattern>, Option<i64>)> {
        let Some(pattern) = SequencePattern::detect(path.as_str()) else {
            return vec![(path.to_path_buf(), None, None)];
        };

        let range = self
            .frame_range
            .or_else(|| node_range(node))
            .or_else(|| pattern.scan_range());

        match range {
            Some(range) => range
                .frames()
                .map(|frame| (pattern.frame(frame), Some(pattern.clone()), Some(frame)))
                .collect(),
            None => {
                tracing::warn!(node = %node.name, %knob, %pattern, "sequence has no frame range");
                warnings.push(Warning::NoFrameRange {
                    node: node.name.clone(),
                    knob: knob.to_string(),
                    pattern: pattern.as_path(),
                });
                vec![(pattern.as_path(), Some(pattern), None)]
            }
        }
    }

    /// Substitutes `${NAME}` variables and `[value Node.knob]` expressions.
    ///
    /// Anything that can't be resolved stays in the result verbatim and is
    /// reported.
    pub fn evaluate(
        &self,
        nodes: &NodeSet,
        node: &Node,
        knob: &str,
        template: &str,
        warnings: &mut Vec<Warning>,
    ) -> String {
        let mut unresolved = Vec::new();

        let text = replace_expressions(template, |name, field| {
            let value = if name == "root" {
                match field {
                    "name" => Some(self.script.to_string()),
                    _ => self.root.variables.get(field).cloned(),
                }
            } else {
                nodes
                    .get(name)
                    .and_then(|n| n.knobs.get(field))
                    .map(KnobValue::to_text)
            };
            if value.is_none() {
                unresolved.push(format!("[value {name}.{field}]"));
            }
            value
        });

        let text = self.substitute_variables(&text, &mut unresolved);

        for expression in unresolved {
            tracing::warn!(node = %node.name, %knob, %expression, "unresolved expression");
            warnings.push(Warning::UnresolvedExpression {
                node: node.name.clone(),
                knob: knob.to_string(),
                expression,
            });
        }

        text
    }

    fn substitute_variables(&self, text: &str, unresolved: &mut Vec<String>) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(at) = rest.find("${") {
            let Some(close) = rest[at..].find('}') else { break };
            let name = &rest[at + 2..at + close];
            let whole = &rest[at..=at + close];

            out.push_str(&rest[..at]);
            match self.root.variables.get(name) {
                Some(value) => out.push_str(value),
                None => {
                    unresolved.push(whole.to_string());
                    out.push_str(whole);
                }
            }
            rest = &rest[at + close + 1..];
        }

        out.push_str(rest);
        out
    }

    /// Makes a path absolute against the script directory and normalizes it.
    fn absolute(&self, resolved: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::from(resolved.trim().replace('\\', "/"));
        let path = if path.is_absolute() || has_drive(path.as_str()) {
            path
        } else {
            self.script_dir().join(path)
        };
        normalize_path(&path)
    }
}

/// `C:/...` style paths are absolute on every host.
fn has_drive(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

/// The frame range a read node declares through its `first`/`last` knobs.
fn node_range(node: &Node) -> Option<FrameRange> {
    let first = node.knobs.get("first")?.as_number()?;
    let last = node.knobs.get("last")?.as_number()?;
    FrameRange::new(first as i64, last as i64).ok()
}
