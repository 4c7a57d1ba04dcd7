use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors which abort the whole run before anything is copied or serialized.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Graph service failed:\n{0}")]
    GraphQuery(#[from] GraphQueryError),

    #[error("No target output nodes found in the script")]
    NoTargetsFound,

    #[error("Gizmo expansion did not settle after {limit} passes, still unexpanded: {}", .remaining.join(", "))]
    GizmoExpansionLimitExceeded { limit: usize, remaining: Vec<String> },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Couldn't map the script destination.\n{0}")]
    ScriptMapping(#[from] PathMappingError),
}

/// Failures reported by the graph service boundary.
#[derive(Debug, Error)]
pub enum GraphQueryError {
    #[error("Couldn't access project file '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse project file '{path}'.\n{source}")]
    Parse {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("Graph host error: {0}")]
    Host(String),
}

/// Metadata or path data insufficient to build a destination for one entry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathMappingError {
    #[error("required archive segment '{0}' is empty")]
    MissingSegment(&'static str),

    #[error("archive segment '{segment}' contains unsafe characters: '{value}'")]
    UnsafeSegment {
        segment: &'static str,
        value: String,
    },

    #[error("path '{0}' has no file name")]
    NoFileName(Utf8PathBuf),
}

/// Per-task copy failure; recorded on the task, never raised out of the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CopyError {
    #[error("source file is missing: {0}")]
    SourceMissing(Utf8PathBuf),

    #[error("{tool} exited with {status}: {stderr}")]
    Tool {
        tool: &'static str,
        status: String,
        stderr: String,
    },

    #[error("couldn't run {tool}: {message}")]
    Spawn { tool: &'static str, message: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("verification failed for {path}: {reason}")]
    Verification { path: Utf8PathBuf, reason: String },

    #[error("no copy strategy available")]
    NoStrategy,

    #[error("worker panicked: {0}")]
    Panic(String),

    #[error("task did not complete")]
    Unfinished,

    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for CopyError {
    fn from(err: std::io::Error) -> Self {
        CopyError::Io(err.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameRangeError {
    #[error("invalid frame range '{0}', use 'start' or 'start-end'")]
    Format(String),

    #[error("frame range end {end} is before start {start}")]
    Reversed { start: i64, end: i64 },
}

/// Conditions worth surfacing in the report which never stop the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    MissingFile {
        node: String,
        knob: String,
        path: Utf8PathBuf,
    },
    UnmappedKnob {
        gizmo: String,
        knob: String,
    },
    UnresolvedExpression {
        node: String,
        knob: String,
        expression: String,
    },
    NoFrameRange {
        node: String,
        knob: String,
        pattern: Utf8PathBuf,
    },
    UnknownTarget(String),
    UnsafeFilename(String),
    RelativePathFallback {
        from: Utf8PathBuf,
        to: Utf8PathBuf,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::MissingFile { node, knob, path } => {
                write!(f, "missing file {path} referenced by {node}.{knob}")
            }
            Warning::UnmappedKnob { gizmo, knob } => {
                write!(f, "gizmo {gizmo}: knob '{knob}' has no exposed counterpart")
            }
            Warning::UnresolvedExpression {
                node,
                knob,
                expression,
            } => write!(f, "unresolved expression '{expression}' in {node}.{knob}"),
            Warning::NoFrameRange {
                node,
                knob,
                pattern,
            } => write!(f, "no frame range for sequence {pattern} in {node}.{knob}"),
            Warning::UnknownTarget(name) => write!(f, "target node '{name}' does not exist"),
            Warning::UnsafeFilename(name) => {
                write!(f, "file name '{name}' contains unsafe characters")
            }
            Warning::RelativePathFallback { from, to } => {
                write!(f, "no relative path from {from} to {to}, kept absolute")
            }
        }
    }
}
