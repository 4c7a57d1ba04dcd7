//! Project files stored as JSON.
//!
//! ```json
//! {
//!   "root": { "variables": { "SHOW": "bob" } },
//!   "nodes": [
//!     { "name": "Read1", "class": "Read", "knobs": { "file": { "file": "plate.%04d.exr" } } },
//!     { "name": "Write1", "class": "Write", "inputs": ["Read1"] }
//!   ],
//!   "gizmos": []
//! }
//! ```
//!
//! This is the format used when the graph host exports a script for the
//! archiver, and the format the archived script is written back in.

use std::collections::HashSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::GraphQueryError;
use crate::gizmo::GizmoDefinition;
use crate::graph::{GraphQueryPort, Node, NodeSet, Root};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    root: Root,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    gizmos: Vec<GizmoDefinition>,
}

/// [`GraphQueryPort`] backed by a JSON project file on disk.
#[derive(Debug)]
pub struct ProjectFile {
    path: Utf8PathBuf,
    document: Document,
}

impl ProjectFile {
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, GraphQueryError> {
        let path = path.into();

        let text = fs::read_to_string(&path).map_err(|source| GraphQueryError::Io {
            path: path.clone(),
            source,
        })?;

        let document = serde_json::from_str(&text).map_err(|source| GraphQueryError::Parse {
            path: path.clone(),
            source,
        })?;

        Ok(Self { path, document })
    }
}

impl GraphQueryPort for ProjectFile {
    fn script_path(&self) -> &Utf8Path {
        &self.path
    }

    fn root(&self) -> Result<Root, GraphQueryError> {
        Ok(self.document.root.clone())
    }

    fn nodes(&self) -> Result<Vec<Node>, GraphQueryError> {
        Ok(self.document.nodes.clone())
    }

    fn gizmos(&self) -> Result<Vec<GizmoDefinition>, GraphQueryError> {
        Ok(self.document.gizmos.clone())
    }

    fn write_script(&self, nodes: &NodeSet, root: &Root, path: &Utf8Path) -> Result<(), GraphQueryError> {
        let io = |source| GraphQueryError::Io {
            path: path.to_path_buf(),
            source,
        };

        // only definitions still used by the subset travel with it
        let used: HashSet<&str> = nodes.iter().map(|n| n.class.as_str()).collect();
        let gizmos = self
            .document
            .gizmos
            .iter()
            .filter(|g| used.contains(g.class.as_str()))
            .cloned()
            .collect();

        let document = Document {
            root: root.clone(),
            nodes: nodes.iter().cloned().collect(),
            gizmos,
        };

        let text = serde_json::to_string_pretty(&document).map_err(|source| GraphQueryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }
        fs::write(path, text).map_err(io)?;

        tracing::info!(path = %path, nodes = nodes.len(), "wrote script");
        Ok(())
    }
}
