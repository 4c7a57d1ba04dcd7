//! The project graph as seen by the archiver.
//!
//! The graph itself lives in an external host (the compositing application).
//! Everything in this crate talks to it through [`GraphQueryPort`], reads the
//! graph exactly once into a [`Graph`] snapshot, and from then on only derives
//! new [`NodeSet`]s from it. The snapshot is never mutated, so it remains the
//! source of truth for error reporting.
//!
//! ## Edges
//!
//! Edges are not stored. A node depends on another node when
//! * one of its input slots is connected to it, or
//! * one of its knobs references it, either directly ([`KnobValue::Node`]) or
//!   through a `[value Node.knob]` expression inside a file template.
//!
//! [`DependencyGraph`] materializes these relations as a petgraph graph with
//! edges pointing from producer to consumer.

pub mod memory;
pub mod project;

use std::collections::{BTreeMap, HashMap};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::error::GraphQueryError;
use crate::gizmo::GizmoDefinition;

pub use memory::MemoryGraph;
pub use project::ProjectFile;

/// Class tag of annotation backdrops.
pub const BACKDROP_CLASS: &str = "BackdropNode";

/// Screen size the host assumes for nodes that do not report one.
const DEFAULT_NODE_WIDTH: f64 = 80.0;
const DEFAULT_NODE_HEIGHT: f64 = 18.0;

/// Value stored in a knob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnobValue {
    Text(String),
    Number(f64),
    Bool(bool),
    /// A file-reference template, possibly containing padding tokens and
    /// expressions.
    File(String),
    /// A direct reference to another node by name.
    Node(String),
}

impl KnobValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            KnobValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            KnobValue::Bool(b) => *b,
            KnobValue::Number(n) => *n != 0.0,
            KnobValue::Text(s) => matches!(s.as_str(), "true" | "1"),
            KnobValue::File(_) | KnobValue::Node(_) => false,
        }
    }

    /// Renders the value the way an expression would see it.
    pub fn to_text(&self) -> String {
        match self {
            KnobValue::Text(s) | KnobValue::File(s) | KnobValue::Node(s) => s.clone(),
            KnobValue::Number(n) => n.to_string(),
            KnobValue::Bool(b) => b.to_string(),
        }
    }
}

/// Position and size of a node in the node editor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub w: f64,
    #[serde(default)]
    pub h: f64,
}

impl Region {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    fn effective(&self) -> (f64, f64) {
        let w = if self.w > 0.0 { self.w } else { DEFAULT_NODE_WIDTH };
        let h = if self.h > 0.0 { self.h } else { DEFAULT_NODE_HEIGHT };
        (w, h)
    }

    /// Whether two regions share any area. Touching edges do not count.
    pub fn intersects(&self, other: &Region) -> bool {
        let (aw, ah) = self.effective();
        let (bw, bh) = other.effective();

        self.x < other.x + bw && other.x < self.x + aw && self.y < other.y + bh && other.y < self.y + ah
    }
}

/// A single node of the project graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub class: String,
    /// Input slots in order; `None` marks an unconnected slot.
    #[serde(default)]
    pub inputs: Vec<Option<String>>,
    #[serde(default)]
    pub knobs: BTreeMap<String, KnobValue>,
    #[serde(default)]
    pub region: Region,
}

impl Node {
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            inputs: Vec::new(),
            knobs: BTreeMap::new(),
            region: Region::default(),
        }
    }

    pub fn input(mut self, producer: impl Into<String>) -> Self {
        self.inputs.push(Some(producer.into()));
        self
    }

    pub fn empty_input(mut self) -> Self {
        self.inputs.push(None);
        self
    }

    pub fn knob(mut self, name: impl Into<String>, value: KnobValue) -> Self {
        self.knobs.insert(name.into(), value);
        self
    }

    pub fn at(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    pub fn is_backdrop(&self) -> bool {
        self.class == BACKDROP_CLASS
    }

    pub fn is_disabled(&self) -> bool {
        self.knobs.get("disable").is_some_and(KnobValue::is_truthy)
    }

    /// Names of every node this node reads from, inputs first, then knob
    /// references in knob order.
    pub fn producers(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.inputs.iter().flatten().map(String::as_str).collect();

        for value in self.knobs.values() {
            match value {
                KnobValue::Node(name) => out.push(name),
                KnobValue::File(template) | KnobValue::Text(template) => {
                    out.extend(expression_references(template));
                }
                _ => {}
            }
        }

        out
    }
}

/// Extracts the node names of every `[value Node.knob]` expression.
pub(crate) fn expression_references(template: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = template;

    while let Some(at) = rest.find("[value ") {
        let after = &rest[at + "[value ".len()..];
        let Some(close) = after.find(']') else { break };
        let reference = after[..close].trim();
        if let Some((node, _)) = reference.split_once('.')
            && node != "root"
            && !node.is_empty()
        {
            out.push(node);
        }
        rest = &after[close..];
    }

    out
}

/// Replaces every `[value Node.knob]` expression with whatever `f` returns for
/// `(node, knob)`. Expressions for which `f` returns `None` are kept verbatim.
pub(crate) fn replace_expressions(
    template: &str,
    mut f: impl FnMut(&str, &str) -> Option<String>,
) -> String {
    const OPEN: &str = "[value ";

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(at) = rest.find(OPEN) {
        let after = &rest[at + OPEN.len()..];
        let Some(close) = after.find(']') else { break };

        out.push_str(&rest[..at]);
        let whole = &rest[at..at + OPEN.len() + close + 1];
        let replaced = after[..close]
            .trim()
            .split_once('.')
            .and_then(|(node, knob)| f(node, knob));
        out.push_str(replaced.as_deref().unwrap_or(whole));

        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

/// Script-wide settings of the project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Root {
    /// Script-level variables available to `${NAME}` substitution.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Read-only access to the host that stores the project graph.
///
/// Implementations are expected to be one-shot: the archiver queries each
/// method at most once per run.
pub trait GraphQueryPort {
    /// Location of the project file being archived.
    fn script_path(&self) -> &Utf8Path;

    fn root(&self) -> Result<Root, GraphQueryError>;

    /// Every node of the project, in declaration order.
    fn nodes(&self) -> Result<Vec<Node>, GraphQueryError>;

    /// Definitions of every macro node type the host knows about.
    fn gizmos(&self) -> Result<Vec<GizmoDefinition>, GraphQueryError>;

    /// Serializes the given subset of nodes as a new project file at `path`.
    fn write_script(&self, nodes: &NodeSet, root: &Root, path: &Utf8Path) -> Result<(), GraphQueryError>;
}

/// An ordered set of nodes, unique by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSet {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl NodeSet {
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut set = Self::default();
        for node in nodes {
            set.push(node);
        }
        set
    }

    /// Appends a node, replacing any node with the same name in place.
    pub fn push(&mut self, node: Node) {
        match self.index.get(&node.name) {
            Some(&i) => self.nodes[i] = node,
            None => {
                self.index.insert(node.name.clone(), self.nodes.len());
                self.nodes.push(node);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.index.get(name).map(|&i| &mut self.nodes[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn into_vec(self) -> Vec<Node> {
        self.nodes
    }
}

impl<'a> IntoIterator for &'a NodeSet {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

impl FromIterator<Node> for NodeSet {
    fn from_iter<T: IntoIterator<Item = Node>>(iter: T) -> Self {
        NodeSet::new(iter)
    }
}

/// Immutable snapshot of everything read from the graph service.
#[derive(Debug, Clone)]
pub struct Graph {
    pub script: Utf8PathBuf,
    pub root: Root,
    pub nodes: NodeSet,
    pub gizmos: Vec<GizmoDefinition>,
}

impl Graph {
    /// Reads the whole project from the host in one pass.
    pub fn load(port: &dyn GraphQueryPort) -> Result<Self, GraphQueryError> {
        let script = port.script_path().to_path_buf();
        let root = port.root()?;
        let nodes = NodeSet::new(port.nodes()?);
        let gizmos = port.gizmos()?;

        tracing::debug!(
            script = %script,
            nodes = nodes.len(),
            gizmos = gizmos.len(),
            "loaded project graph"
        );

        Ok(Self {
            script,
            root,
            nodes,
            gizmos,
        })
    }

    /// Directory relative file references are resolved against.
    pub fn script_dir(&self) -> &Utf8Path {
        self.script.parent().unwrap_or(Utf8Path::new(""))
    }
}

/// Producer → consumer view of a [`NodeSet`].
pub struct DependencyGraph {
    pub(crate) graph: DiGraph<usize, ()>,
    pub(crate) lookup: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn build(nodes: &NodeSet) -> Self {
        let mut graph = DiGraph::with_capacity(nodes.len(), nodes.len());
        let mut lookup = HashMap::with_capacity(nodes.len());

        for (i, node) in nodes.iter().enumerate() {
            lookup.insert(node.name.clone(), graph.add_node(i));
        }

        for node in nodes {
            let consumer = lookup[&node.name];

            for producer in node.producers() {
                match lookup.get(producer) {
                    Some(&source) => {
                        graph.update_edge(source, consumer, ());
                    }
                    None => {
                        tracing::debug!(node = %node.name, producer, "dangling reference ignored");
                    }
                }
            }
        }

        Self { graph, lookup }
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.lookup.get(name).copied()
    }

    /// Position of the node in the originating [`NodeSet`].
    pub fn position(&self, index: NodeIndex) -> usize {
        self.graph[index]
    }
}
