use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::GraphQueryError;
use crate::gizmo::GizmoDefinition;
use crate::graph::{GraphQueryPort, Node, NodeSet, Root};

/// A graph held entirely in memory.
///
/// Serialized scripts are not written anywhere; they are recorded and can be
/// inspected with [`MemoryGraph::written`].
#[derive(Debug, Default)]
pub struct MemoryGraph {
    script: Utf8PathBuf,
    root: Root,
    nodes: Vec<Node>,
    gizmos: Vec<GizmoDefinition>,
    written: Mutex<Vec<(Utf8PathBuf, NodeSet)>>,
}

impl MemoryGraph {
    pub fn new(script: impl Into<Utf8PathBuf>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_nodes(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    pub fn with_gizmo(mut self, gizmo: GizmoDefinition) -> Self {
        self.gizmos.push(gizmo);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.root.variables.insert(name.into(), value.into());
        self
    }

    /// Every script serialized through this graph so far.
    pub fn written(&self) -> Vec<(Utf8PathBuf, NodeSet)> {
        match self.written.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl GraphQueryPort for MemoryGraph {
    fn script_path(&self) -> &Utf8Path {
        &self.script
    }

    fn root(&self) -> Result<Root, GraphQueryError> {
        Ok(self.root.clone())
    }

    fn nodes(&self) -> Result<Vec<Node>, GraphQueryError> {
        Ok(self.nodes.clone())
    }

    fn gizmos(&self) -> Result<Vec<GizmoDefinition>, GraphQueryError> {
        Ok(self.gizmos.clone())
    }

    fn write_script(&self, nodes: &NodeSet, _: &Root, path: &Utf8Path) -> Result<(), GraphQueryError> {
        self.written
            .lock()
            .map_err(|_| GraphQueryError::Host("script recorder poisoned".into()))?
            .push((path.to_path_buf(), nodes.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    #[test]
    fn test_load_snapshot() {
        let port = MemoryGraph::new("/shots/010/comp.nk")
            .with_node(Node::new("Read1", "Read"))
            .with_node(Node::new("Write1", "Write").input("Read1"))
            .with_variable("SEQ", "bob");

        let graph = Graph::load(&port).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.script_dir(), "/shots/010");
        assert_eq!(graph.root.variables["SEQ"], "bob");
    }

    #[test]
    fn test_records_written_scripts() {
        let port = MemoryGraph::new("/a.nk");
        let set = NodeSet::new([Node::new("Write1", "Write")]);
        port.write_script(&set, &Root::default(), Utf8Path::new("/out/b.nk"))
            .unwrap();

        let written = port.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, "/out/b.nk");
        assert!(written[0].1.contains("Write1"));
    }
}
