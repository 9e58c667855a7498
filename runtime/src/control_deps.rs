// control_deps.rs — Automatic control dependencies between stateful operations
//
// While a function is traced, every new node is checked for the resources it
// reads and writes. Per resource the inserter remembers the last writer and
// the readers since that write, and adds control inputs so that
//   write → after every recorded read and the previous write
//   read  → after the last write
// Branch and call nodes act on every resource their function bodies touch.
//
// Preconditions: nodes are processed in creation order, before insertion.
// Postconditions: any two accesses of one resource where at least one is a
//                 write are ordered by a (possibly transitive) control path.
// Failure modes: recursive function references → `Error::Cycle`; a call to a
//                function missing from every visible library → `Error::NotFound`.
// Side effects: none; the caller adds the amended node spec to its graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::attr::AttrValue;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::{FunctionDef, Graph, Input, NodeSpec, TensorRef};
use crate::registry::{Access, OpRegistry};

/// Pseudo-resource written by stateful ops that touch no named resource
/// (printing, for example), so that they keep their program order.
pub const SIDE_EFFECTS: &str = "<side-effects>";

pub(crate) const MAX_CALL_DEPTH: usize = 64;

/// Resources a node reads and writes, by shared name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effects {
    pub reads: BTreeSet<String>,
    pub writes: BTreeSet<String>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    fn extend(&mut self, other: Effects) {
        self.reads.extend(other.reads);
        self.writes.extend(other.writes);
    }
}

#[derive(Debug, Default)]
struct ResourceState {
    last_writer: Option<String>,
    readers: Vec<String>,
}

#[derive(Debug, Default)]
pub struct AutoControlDeps {
    resources: BTreeMap<String, ResourceState>,
}

impl AutoControlDeps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the control inputs `spec` needs and return its effects. Call
    /// `record` once the node is in the graph.
    pub fn process(&self, graph: &Graph, registry: &OpRegistry, spec: &mut NodeSpec) -> Result<Effects> {
        let effects = node_effects(graph, registry, spec)?;
        let mut deps = BTreeSet::new();
        for key in &effects.writes {
            if let Some(state) = self.resources.get(key) {
                deps.extend(state.readers.iter().cloned());
                deps.extend(state.last_writer.iter().cloned());
            }
        }
        for key in effects.reads.difference(&effects.writes) {
            if let Some(writer) = self.resources.get(key).and_then(|s| s.last_writer.as_ref()) {
                deps.insert(writer.clone());
            }
        }
        for dep in deps {
            let present = dep == spec.name || spec.inputs.iter().any(|i| i.node_name() == dep);
            if !present {
                tracing::trace!(node = %spec.name, dep = %dep, "automatic control dependency");
                spec.inputs.push(Input::Control(dep));
            }
        }
        Ok(effects)
    }

    pub fn record(&mut self, node: &str, effects: &Effects) {
        for key in &effects.writes {
            let state = self.resources.entry(key.clone()).or_default();
            state.readers.clear();
            state.last_writer = Some(node.to_string());
        }
        for key in effects.reads.difference(&effects.writes) {
            self.resources
                .entry(key.clone())
                .or_default()
                .readers
                .push(node.to_string());
        }
    }

    /// Writes not yet superseded, one per resource, sorted and deduplicated.
    pub fn pending(&self) -> Vec<String> {
        let writers: BTreeSet<&String> = self
            .resources
            .values()
            .filter_map(|s| s.last_writer.as_ref())
            .collect();
        writers.into_iter().cloned().collect()
    }

    /// The last writer of `resource`, if any.
    pub fn last_writer(&self, resource: &str) -> Option<&str> {
        self.resources.get(resource)?.last_writer.as_deref()
    }
}

// ── Effect analysis ─────────────────────────────────────────────────────────

/// Where names resolve while walking nested function bodies.
struct Scope<'a> {
    graphs: Vec<&'a Graph>,
    /// Placeholder node → resource key of the argument bound to it.
    bindings: HashMap<String, String>,
}

impl<'a> Scope<'a> {
    fn graph(&self) -> &'a Graph {
        self.graphs[self.graphs.len() - 1]
    }

    fn function(&self, name: &str) -> Result<&'a Arc<FunctionDef>> {
        self.graphs
            .iter()
            .rev()
            .find_map(|g| g.function(name))
            .ok_or_else(|| Error::not_found("function", name))
    }

    /// Shared name behind a resource tensor: the bound argument, the
    /// `VarHandleOp` producing it (through `Identity` chains), or the tensor itself.
    fn resource_key(&self, t: &TensorRef) -> String {
        let mut t = t.clone();
        loop {
            if let Some(key) = self.bindings.get(&t.node) {
                return key.clone();
            }
            match self.graph().node(&t.node) {
                Some(node) if node.op == "VarHandleOp" => {
                    return match node.attr("shared_name").and_then(AttrValue::as_str) {
                        Some(shared) if !shared.is_empty() => shared.to_string(),
                        _ => node.name.clone(),
                    };
                }
                Some(node) if node.op == "Identity" => match node.data_inputs().next() {
                    Some(next) => t = next.clone(),
                    None => return t.to_string(),
                },
                _ => return t.to_string(),
            }
        }
    }
}

/// Effects of the node `spec` about to be added to `graph`.
pub fn node_effects(graph: &Graph, registry: &OpRegistry, spec: &NodeSpec) -> Result<Effects> {
    let scope = Scope {
        graphs: vec![graph],
        bindings: HashMap::new(),
    };
    let inputs: Vec<TensorRef> = spec
        .inputs
        .iter()
        .filter_map(|i| match i {
            Input::Data(t) => Some(t.clone()),
            Input::Control(_) => None,
        })
        .collect();
    effects_of(&scope, registry, &spec.name, &spec.op, &spec.attrs, &inputs, 0)
}

fn effects_of(
    scope: &Scope<'_>,
    registry: &OpRegistry,
    node: &str,
    op: &str,
    attrs: &BTreeMap<String, AttrValue>,
    inputs: &[TensorRef],
    depth: usize,
) -> Result<Effects> {
    let func = |name: &str| attrs.get(name).and_then(AttrValue::as_func);
    match op {
        "Identity" => return Ok(Effects::default()),
        "If" => {
            let args = inputs.get(1..).unwrap_or_default();
            let mut effects = Effects::default();
            for branch in ["then_branch", "else_branch"] {
                if let Some(f) = func(branch) {
                    effects.extend(function_effects(scope, registry, f, args, depth)?);
                }
            }
            return Ok(effects);
        }
        "PartitionedCall" | "StatefulPartitionedCall" => {
            return match func("f") {
                Some(f) => function_effects(scope, registry, f, inputs, depth),
                None => Ok(Effects::default()),
            };
        }
        _ => {}
    }

    let Some(def) = registry.lookup(op) else {
        return Ok(Effects::default());
    };
    let access = def.input_access(node, attrs)?;
    let types = def.input_types(node, attrs)?;
    let mut effects = Effects::default();
    for (i, t) in inputs.iter().enumerate() {
        let is_resource = types.get(i) == Some(&DType::Resource);
        match access.get(i).copied().flatten() {
            Some(Access::Read) => {
                effects.reads.insert(scope.resource_key(t));
            }
            Some(Access::Write) => {
                effects.writes.insert(scope.resource_key(t));
            }
            None if is_resource => {
                effects.writes.insert(scope.resource_key(t));
            }
            None => {}
        }
    }
    let creates_handle = def
        .output_types(node, attrs)?
        .iter()
        .any(|t| *t == DType::Resource);
    if def.stateful && effects.is_empty() && !creates_handle {
        effects.writes.insert(SIDE_EFFECTS.to_string());
    }
    Ok(effects)
}

/// Union of the effects of every node in function `name`, with its
/// parameters bound to the resource keys of `args`.
fn function_effects(
    scope: &Scope<'_>,
    registry: &OpRegistry,
    name: &str,
    args: &[TensorRef],
    depth: usize,
) -> Result<Effects> {
    if depth >= MAX_CALL_DEPTH {
        return Err(Error::Cycle {
            nodes: vec![name.to_string()],
        });
    }
    let f = scope.function(name)?;
    let mut graphs = scope.graphs.clone();
    graphs.push(&f.graph);
    let bindings = f
        .inputs
        .iter()
        .zip(args)
        .map(|(param, arg)| (param.node.clone(), scope.resource_key(arg)))
        .collect();
    let inner = Scope { graphs, bindings };

    let mut effects = Effects::default();
    for node in f.graph.nodes() {
        let inputs: Vec<TensorRef> = node.data_inputs().cloned().collect();
        effects.extend(effects_of(
            &inner,
            registry,
            &node.name,
            &node.op,
            &node.attrs,
            &inputs,
            depth + 1,
        )?);
    }
    Ok(effects)
}
