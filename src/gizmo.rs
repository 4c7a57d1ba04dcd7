//! Flattening of macro nodes ("gizmos") into the primitives they wrap.
//!
//! A gizmo instance is a node whose class has a [`GizmoDefinition`]. Expanding
//! it replaces the instance with a renamed copy of the definition's internal
//! nodes:
//! * internal placeholder inputs are rewired to whatever fed the instance,
//! * consumers of the instance are rewired to the internal output node,
//! * knob values set on the instance are pushed onto the internal knobs they
//!   are exposed from.
//!
//! Internal nodes may themselves be gizmos, so expansion runs passes until
//! nothing is left to expand, up to a fixed number of passes.

use std::collections::{BTreeMap, HashMap, HashSet};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Warning};
use crate::graph::{KnobValue, Node, NodeSet, replace_expressions};

/// Default number of expansion passes before giving up.
pub const DEFAULT_EXPANSION_LIMIT: usize = 32;

/// Where an exposed gizmo knob lands inside the gizmo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnobLink {
    pub node: String,
    pub knob: String,
}

/// The body of a macro node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GizmoDefinition {
    /// Class tag instances of this gizmo carry.
    pub class: String,
    /// Internal placeholder node per input slot, in slot order.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Internal node whose output is the gizmo's output.
    pub output: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Exposed knob name to the internal knob it drives.
    #[serde(default)]
    pub knobs: BTreeMap<String, KnobLink>,
    /// File the definition was loaded from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Utf8PathBuf>,
}

/// Result of flattening a node set.
#[derive(Debug, Clone)]
pub struct Expansion {
    pub nodes: NodeSet,
    /// Number of gizmo instances replaced across all passes.
    pub count: usize,
    pub warnings: Vec<Warning>,
}

pub struct GizmoExpander<'a> {
    definitions: HashMap<&'a str, &'a GizmoDefinition>,
    limit: usize,
}

impl<'a> GizmoExpander<'a> {
    /// Definitions whose source lies under one of `native_roots` ship with the
    /// host and are left as they are.
    pub fn new(definitions: &'a [GizmoDefinition], native_roots: &[Utf8PathBuf]) -> Self {
        let definitions = definitions
            .iter()
            .filter(|def| {
                let native = def
                    .source
                    .as_ref()
                    .is_some_and(|src| native_roots.iter().any(|root| src.starts_with(root)));
                if native {
                    tracing::debug!(class = %def.class, "native gizmo, not expanding");
                }
                !native
            })
            .map(|def| (def.class.as_str(), def))
            .collect();

        Self {
            definitions,
            limit: DEFAULT_EXPANSION_LIMIT,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn is_gizmo(&self, node: &Node) -> bool {
        self.definitions.contains_key(node.class.as_str())
    }

    pub fn expand(&self, kept: &NodeSet) -> Result<Expansion, ArchiveError> {
        let mut nodes = kept.clone();
        let mut count = 0;
        let mut warnings = Vec::new();

        for pass in 0..self.limit {
            let pending: Vec<String> = nodes
                .iter()
                .filter(|n| self.is_gizmo(n))
                .map(|n| n.name.clone())
                .collect();

            if pending.is_empty() {
                tracing::debug!(passes = pass, count, "gizmo expansion settled");
                return Ok(Expansion {
                    nodes,
                    count,
                    warnings,
                });
            }

            for name in &pending {
                nodes = self.expand_one(nodes, name, &mut warnings);
            }
            count += pending.len();
        }

        let remaining: Vec<String> = nodes
            .iter()
            .filter(|n| self.is_gizmo(n))
            .map(|n| n.name.clone())
            .collect();

        if remaining.is_empty() {
            return Ok(Expansion {
                nodes,
                count,
                warnings,
            });
        }

        Err(ArchiveError::GizmoExpansionLimitExceeded {
            limit: self.limit,
            remaining,
        })
    }

    fn expand_one(&self, nodes: NodeSet, name: &str, warnings: &mut Vec<Warning>) -> NodeSet {
        let Some(gizmo) = nodes.get(name).cloned() else {
            return nodes;
        };
        let Some(&def) = self.definitions.get(gizmo.class.as_str()) else {
            return nodes;
        };

        let mut taken: HashSet<String> = nodes.names().map(str::to_string).collect();
        let mut renamed: HashMap<&str, String> = HashMap::new();

        // placeholder -> producer feeding the matching input slot of the instance
        let slots: HashMap<&str, Option<String>> = def
            .inputs
            .iter()
            .enumerate()
            .map(|(i, placeholder)| {
                let producer = gizmo.inputs.get(i).cloned().flatten();
                (placeholder.as_str(), producer)
            })
            .collect();

        for inner in def.nodes.iter().filter(|n| !slots.contains_key(n.name.as_str())) {
            let fresh = unique_name(&format!("{}_{}", gizmo.name, inner.name), &taken);
            taken.insert(fresh.clone());
            renamed.insert(inner.name.as_str(), fresh);
        }

        let resolve = |inner: &str| -> Option<Option<String>> {
            if let Some(producer) = slots.get(inner) {
                return Some(producer.clone());
            }
            renamed.get(inner).map(|n| Some(n.clone()))
        };

        let mut body: Vec<Node> = def
            .nodes
            .iter()
            .filter(|n| renamed.contains_key(n.name.as_str()))
            .map(|inner| {
                let mut node = inner.clone();
                node.name = renamed[inner.name.as_str()].clone();
                node.region = gizmo.region;
                node.inputs = inner
                    .inputs
                    .iter()
                    .map(|input| match input {
                        Some(src) => resolve(src).unwrap_or_else(|| Some(src.clone())),
                        None => None,
                    })
                    .collect();
                for value in node.knobs.values_mut() {
                    rewrite_knob(value, |target| resolve(target).flatten(), |n, k| {
                        renamed.get(n).map(|fresh| format!("[value {fresh}.{k}]"))
                    });
                }
                node
            })
            .collect();

        for (knob, value) in &gizmo.knobs {
            let target = def.knobs.get(knob).and_then(|link| {
                let fresh = renamed.get(link.node.as_str())?;
                let index = body.iter().position(|n| &n.name == fresh)?;
                Some((index, link.knob.clone()))
            });

            match target {
                Some((index, inner_knob)) => {
                    body[index].knobs.insert(inner_knob, value.clone());
                }
                None => {
                    tracing::warn!(gizmo = %gizmo.name, %knob, "gizmo knob has no exposed counterpart");
                    warnings.push(Warning::UnmappedKnob {
                        gizmo: gizmo.name.clone(),
                        knob: knob.clone(),
                    });
                }
            }
        }

        let output = resolve(&def.output).flatten();
        let exposed = |knob: &str| -> Option<String> {
            let link = def.knobs.get(knob)?;
            let fresh = renamed.get(link.node.as_str())?;
            Some(format!("[value {fresh}.{}]", link.knob))
        };

        let mut out = Vec::with_capacity(nodes.len() + body.len());
        for mut node in nodes.into_vec() {
            if node.name == gizmo.name {
                out.append(&mut body);
                continue;
            }

            for input in node.inputs.iter_mut() {
                if input.as_deref() == Some(gizmo.name.as_str()) {
                    *input = output.clone();
                }
            }
            for value in node.knobs.values_mut() {
                rewrite_knob(
                    value,
                    |target| (target == gizmo.name).then(|| output.clone()).flatten(),
                    |n, k| (n == gizmo.name).then(|| exposed(k)).flatten(),
                );
            }
            out.push(node);
        }

        tracing::debug!(gizmo = %gizmo.name, class = %gizmo.class, nodes = renamed.len(), "expanded gizmo");
        NodeSet::new(out)
    }
}

/// Applies node renames to a knob. `node` maps direct node references,
/// `expression` maps `[value Node.knob]` expressions to their replacement.
fn rewrite_knob(
    value: &mut KnobValue,
    node: impl Fn(&str) -> Option<String>,
    expression: impl FnMut(&str, &str) -> Option<String>,
) {
    match value {
        KnobValue::Node(target) => {
            if let Some(fresh) = node(target) {
                *target = fresh;
            }
        }
        KnobValue::File(template) | KnobValue::Text(template) => {
            *template = replace_expressions(template, expression);
        }
        KnobValue::Number(_) | KnobValue::Bool(_) => {}
    }
}

fn unique_name(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}_{n}"))
        .find(|name| !taken.contains(name))
        .unwrap_or_else(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Region;

    /// A gizmo with one input, a blur followed by a grade, exposing `size`.
    fn soft_grade() -> GizmoDefinition {
        GizmoDefinition {
            class: "SoftGrade".into(),
            inputs: vec!["Input1".into()],
            output: "Grade1".into(),
            nodes: vec![
                Node::new("Input1", "Input"),
                Node::new("Blur1", "Blur").input("Input1"),
                Node::new("Grade1", "Grade").input("Blur1"),
            ],
            knobs: BTreeMap::from([(
                "size".to_string(),
                KnobLink {
                    node: "Blur1".into(),
                    knob: "size".into(),
                },
            )]),
            source: None,
        }
    }

    fn graph() -> NodeSet {
        NodeSet::new([
            Node::new("Read1", "Read"),
            Node::new("Soft1", "SoftGrade")
                .input("Read1")
                .knob("size", KnobValue::Number(12.0))
                .at(Region::new(100.0, 50.0, 80.0, 18.0)),
            Node::new("Write1", "Write")
                .input("Soft1")
                .knob("label", KnobValue::Text("[value Soft1.size]".into())),
        ])
    }

    #[test]
    fn test_expand_rewires_boundary() {
        let defs = [soft_grade()];
        let expansion = GizmoExpander::new(&defs, &[]).expand(&graph()).unwrap();
        let nodes = expansion.nodes;

        assert_eq!(expansion.count, 1);
        assert_eq!(
            nodes.names().collect::<Vec<_>>(),
            vec!["Read1", "Soft1_Blur1", "Soft1_Grade1", "Write1"]
        );

        let blur = nodes.get("Soft1_Blur1").unwrap();
        assert_eq!(blur.inputs, vec![Some("Read1".into())]);
        assert_eq!(blur.knobs["size"], KnobValue::Number(12.0));
        assert_eq!(blur.region, Region::new(100.0, 50.0, 80.0, 18.0));

        let write = nodes.get("Write1").unwrap();
        assert_eq!(write.inputs, vec![Some("Soft1_Grade1".into())]);
        assert_eq!(
            write.knobs["label"],
            KnobValue::Text("[value Soft1_Blur1.size]".into())
        );
        assert!(expansion.warnings.is_empty());
    }

    #[test]
    fn test_expand_is_idempotent() {
        let defs = [soft_grade()];
        let expander = GizmoExpander::new(&defs, &[]);
        let once = expander.expand(&graph()).unwrap();
        let twice = expander.expand(&once.nodes).unwrap();

        assert_eq!(twice.count, 0);
        assert_eq!(twice.nodes, once.nodes);
    }

    #[test]
    fn test_unmapped_knob_warns() {
        let defs = [soft_grade()];
        let mut nodes = graph();
        let mut soft = nodes.get("Soft1").unwrap().clone();
        soft.knobs.insert("mix".into(), KnobValue::Number(0.5));
        nodes.push(soft);

        let expansion = GizmoExpander::new(&defs, &[]).expand(&nodes).unwrap();
        assert_eq!(
            expansion.warnings,
            vec![Warning::UnmappedKnob {
                gizmo: "Soft1".into(),
                knob: "mix".into()
            }]
        );
    }

    #[test]
    fn test_nested_gizmos_expand_to_fixed_point() {
        let outer = GizmoDefinition {
            class: "Outer".into(),
            inputs: vec!["Input1".into()],
            output: "Inner1".into(),
            nodes: vec![
                Node::new("Input1", "Input"),
                Node::new("Inner1", "SoftGrade").input("Input1"),
            ],
            knobs: BTreeMap::new(),
            source: None,
        };
        let defs = [soft_grade(), outer];
        let nodes = NodeSet::new([
            Node::new("Read1", "Read"),
            Node::new("O1", "Outer").input("Read1"),
            Node::new("Write1", "Write").input("O1"),
        ]);

        let expansion = GizmoExpander::new(&defs, &[]).expand(&nodes).unwrap();
        assert_eq!(expansion.count, 2);
        assert_eq!(
            expansion.nodes.get("Write1").unwrap().inputs,
            vec![Some("O1_Inner1_Grade1".into())]
        );
        assert_eq!(
            expansion.nodes.get("O1_Inner1_Blur1").unwrap().inputs,
            vec![Some("Read1".into())]
        );
    }

    #[test]
    fn test_recursive_gizmo_hits_limit() {
        let looping = GizmoDefinition {
            class: "Loop".into(),
            inputs: vec![],
            output: "Again".into(),
            nodes: vec![Node::new("Again", "Loop")],
            knobs: BTreeMap::new(),
            source: None,
        };
        let defs = [looping];
        let nodes = NodeSet::new([Node::new("L", "Loop")]);

        let err = GizmoExpander::new(&defs, &[])
            .limit(4)
            .expand(&nodes)
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::GizmoExpansionLimitExceeded { limit: 4, ref remaining } if remaining.len() == 1
        ));
    }

    #[test]
    fn test_native_gizmos_are_kept() {
        let mut def = soft_grade();
        def.source = Some("/opt/host/plugins/SoftGrade.gizmo".into());
        let defs = [def];

        let expansion = GizmoExpander::new(&defs, &["/opt/host/plugins".into()])
            .expand(&graph())
            .unwrap();
        assert_eq!(expansion.count, 0);
        assert!(expansion.nodes.contains("Soft1"));
    }

    #[test]
    fn test_renaming_avoids_collisions() {
        let defs = [soft_grade()];
        let mut nodes = graph();
        nodes.push(Node::new("Soft1_Blur1", "Blur"));

        let expansion = GizmoExpander::new(&defs, &[]).expand(&nodes).unwrap();
        assert!(expansion.nodes.contains("Soft1_Blur1_2"));
        assert_eq!(
            expansion.nodes.get("Soft1_Grade1").unwrap().inputs,
            vec![Some("Soft1_Blur1_2".into())]
        );
    }
}
