// graph.rs — Graph container: uniquely named typed nodes, data and control edges
//
// Nodes are stored in insertion order and indexed by name, so iteration (and
// therefore export) is deterministic. Every mutation bumps `version`.
//
// Preconditions: callers resolve name collisions before `add_node` (see `unique_name`).
// Postconditions: every data input references an existing output slot; every
//                 control input and colocation target references an existing node.
// Failure modes: duplicate names → `Error::DuplicateName`; dangling references
//                → `Error::NotFound` / `Error::MissingInput`.
// Side effects: none.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::attr::AttrValue;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;

/// Producer version written by this runtime.
pub const GRAPH_DEF_VERSION: i32 = 26;
/// Oldest producer version this runtime can consume.
pub const GRAPH_DEF_VERSION_MIN_PRODUCER: i32 = 0;
/// Oldest consumer version this runtime's graphs support.
pub const GRAPH_DEF_VERSION_MIN_CONSUMER: i32 = 0;

// ── Public types ────────────────────────────────────────────────────────────

/// Position of a node inside its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// A reference to output slot `index` of node `node`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorRef {
    pub node: String,
    pub index: usize,
}

impl TensorRef {
    pub fn new(node: impl Into<String>, index: usize) -> Self {
        TensorRef {
            node: node.into(),
            index,
        }
    }

    /// Parse `name` or `name:k`.
    pub fn parse(text: &str) -> Result<TensorRef> {
        match Input::parse(text)? {
            Input::Data(t) => Ok(t),
            Input::Control(_) => Err(Error::InvalidTensorName {
                text: text.to_string(),
            }),
        }
    }

    /// Interchange spelling: output 0 is written as the bare node name.
    pub fn to_input_string(&self) -> String {
        if self.index == 0 {
            self.node.clone()
        } else {
            format!("{}:{}", self.node, self.index)
        }
    }
}

impl fmt::Display for TensorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.index)
    }
}

/// One node input: a data edge from an output slot, or an ordering-only edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Input {
    Data(TensorRef),
    Control(String),
}

impl Input {
    /// Parse `name`, `name:k` or `^name`.
    pub fn parse(text: &str) -> Result<Input> {
        let invalid = || Error::InvalidTensorName {
            text: text.to_string(),
        };
        if let Some(name) = text.strip_prefix('^') {
            if name.is_empty() || name.contains(':') {
                return Err(invalid());
            }
            return Ok(Input::Control(name.to_string()));
        }
        match text.rsplit_once(':') {
            Some((node, idx)) => {
                let index = idx.parse::<usize>().map_err(|_| invalid())?;
                if node.is_empty() || node.contains(':') {
                    return Err(invalid());
                }
                Ok(Input::Data(TensorRef::new(node, index)))
            }
            None if !text.is_empty() => Ok(Input::Data(TensorRef::new(text, 0))),
            None => Err(invalid()),
        }
    }

    pub fn node_name(&self) -> &str {
        match self {
            Input::Data(t) => &t.node,
            Input::Control(n) => n,
        }
    }

    pub fn to_input_string(&self) -> String {
        match self {
            Input::Data(t) => t.to_input_string(),
            Input::Control(n) => format!("^{}", n),
        }
    }
}

/// Type and static shape of one node output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSlot {
    pub dtype: DType,
    pub shape: Shape,
}

/// An operation instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op: String,
    /// Data inputs first, then control inputs.
    pub inputs: Vec<Input>,
    pub outputs: Vec<OutputSlot>,
    pub device: String,
    /// Sorted, deduplicated names of nodes this node must share a device with.
    pub colocation: Vec<String>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl Node {
    pub fn data_inputs(&self) -> impl Iterator<Item = &TensorRef> {
        self.inputs.iter().filter_map(|i| match i {
            Input::Data(t) => Some(t),
            Input::Control(_) => None,
        })
    }

    pub fn control_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|i| match i {
            Input::Control(n) => Some(n.as_str()),
            Input::Data(_) => None,
        })
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }
}

/// Everything needed to construct a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    pub op: String,
    pub inputs: Vec<Input>,
    pub outputs: Vec<OutputSlot>,
    pub device: String,
    pub colocation: Vec<String>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        NodeSpec {
            name: name.into(),
            op: op.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            device: String::new(),
            colocation: Vec::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn input(mut self, t: TensorRef) -> Self {
        self.inputs.push(Input::Data(t));
        self
    }

    pub fn control_input(mut self, node: impl Into<String>) -> Self {
        self.inputs.push(Input::Control(node.into()));
        self
    }

    pub fn output(mut self, dtype: DType, shape: Shape) -> Self {
        self.outputs.push(OutputSlot { dtype, shape });
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn colocate_with(mut self, node: impl Into<String>) -> Self {
        self.colocation.push(node.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    fn into_node(self) -> Node {
        let (mut data, control): (Vec<Input>, Vec<Input>) = self
            .inputs
            .into_iter()
            .partition(|i| matches!(i, Input::Data(_)));
        let mut seen = HashSet::new();
        data.extend(
            control
                .into_iter()
                .filter(|c| seen.insert(c.node_name().to_string())),
        );
        let mut colocation = self.colocation;
        colocation.sort();
        colocation.dedup();
        Node {
            name: self.name,
            op: self.op,
            inputs: data,
            outputs: self.outputs,
            device: self.device,
            colocation,
            attrs: self.attrs,
        }
    }
}

/// Version bounds recorded in a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphVersions {
    pub producer: i32,
    pub min_consumer: i32,
    pub bad_consumers: Vec<i32>,
}

impl Default for GraphVersions {
    fn default() -> Self {
        GraphVersions {
            producer: GRAPH_DEF_VERSION,
            min_consumer: GRAPH_DEF_VERSION_MIN_CONSUMER,
            bad_consumers: Vec::new(),
        }
    }
}

/// A function body held in a graph's library (branch of an `If`, callee of a call op).
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub graph: Graph,
    /// Placeholder outputs receiving the call's arguments, in order.
    pub inputs: Vec<TensorRef>,
    pub outputs: Vec<TensorRef>,
    /// Nodes that must run whenever the function runs.
    pub control_outputs: Vec<String>,
}

impl FunctionDef {
    pub fn input_types(&self) -> Result<Vec<DType>> {
        self.inputs
            .iter()
            .map(|t| self.graph.output(t).map(|s| s.dtype))
            .collect()
    }

    pub fn output_types(&self) -> Result<Vec<DType>> {
        self.outputs
            .iter()
            .map(|t| self.graph.output(t).map(|s| s.dtype))
            .collect()
    }
}

/// The graph container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    version: u64,
    versions: GraphVersions,
    /// Lowercased name or scope → number of times handed out by `unique_name`.
    names_in_use: HashMap<String, usize>,
    library: BTreeMap<String, Arc<FunctionDef>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Queries ──

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Mutation counter; unchanged by read-only access and by no-op amendments.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn versions(&self) -> &GraphVersions {
        &self.versions
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|i| &self.nodes[*i])
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).map(|i| NodeId(*i as u32))
    }

    pub fn node_at(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get_node(&self, name: &str) -> Result<&Node> {
        self.node(name).ok_or_else(|| Error::not_found("node", name))
    }

    pub fn output(&self, t: &TensorRef) -> Result<&OutputSlot> {
        self.get_node(&t.node)?
            .outputs
            .get(t.index)
            .ok_or_else(|| Error::not_found("tensor", t.to_string()))
    }

    // ── Construction ──

    /// Add one node. Its inputs must already exist.
    pub fn add_node(&mut self, spec: NodeSpec) -> Result<&Node> {
        let name = spec.name.clone();
        self.add_nodes(vec![spec])?;
        self.get_node(&name)
    }

    /// Add a batch of nodes whose inputs may reference each other in any order
    /// (including cycles). The whole batch is validated before anything is inserted.
    pub fn add_nodes(&mut self, specs: Vec<NodeSpec>) -> Result<()> {
        let mut batch: HashMap<&str, &NodeSpec> = HashMap::new();
        for spec in &specs {
            if self.contains(&spec.name) || batch.insert(&spec.name, spec).is_some() {
                return Err(Error::DuplicateName {
                    name: spec.name.clone(),
                });
            }
        }
        let num_outputs = |name: &str| -> Option<usize> {
            self.node(name)
                .map(|n| n.outputs.len())
                .or_else(|| batch.get(name).map(|s| s.outputs.len()))
        };
        for spec in &specs {
            for input in &spec.inputs {
                match input {
                    Input::Data(t) => match num_outputs(&t.node) {
                        Some(n) if t.index < n => {}
                        _ => {
                            return Err(Error::MissingInput {
                                node: spec.name.clone(),
                                input: t.to_string(),
                            })
                        }
                    },
                    Input::Control(c) => {
                        if num_outputs(c).is_none() {
                            return Err(Error::MissingControlInput {
                                node: spec.name.clone(),
                                input: c.clone(),
                            });
                        }
                    }
                }
            }
            for target in &spec.colocation {
                if num_outputs(target).is_none() {
                    return Err(Error::UnknownColocation {
                        node: spec.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        for spec in specs {
            self.mark_name_used(&spec.name);
            let node = spec.into_node();
            self.index.insert(node.name.clone(), self.nodes.len());
            self.nodes.push(node);
            self.version += 1;
        }
        Ok(())
    }

    /// Amend the device of `name`. Returns whether anything changed.
    pub fn set_device(&mut self, name: &str, device: &str) -> Result<bool> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| Error::not_found("node", name))?;
        if self.nodes[idx].device == device {
            return Ok(false);
        }
        self.nodes[idx].device = device.to_string();
        self.version += 1;
        Ok(true)
    }

    /// Replace the colocation group of `name`. Returns whether anything changed.
    pub fn set_colocation(&mut self, name: &str, targets: &[String]) -> Result<bool> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| Error::not_found("node", name))?;
        for t in targets {
            if !self.contains(t) {
                return Err(Error::UnknownColocation {
                    node: name.to_string(),
                    target: t.clone(),
                });
            }
        }
        let mut targets = targets.to_vec();
        targets.sort();
        targets.dedup();
        if self.nodes[idx].colocation == targets {
            return Ok(false);
        }
        self.nodes[idx].colocation = targets;
        self.version += 1;
        Ok(true)
    }

    pub fn set_versions(&mut self, versions: GraphVersions) {
        if self.versions != versions {
            self.versions = versions;
            self.version += 1;
        }
    }

    // ── Names ──

    /// Whether `name` is taken by a node or a name scope (case-insensitive).
    pub fn is_name_in_use(&self, name: &str) -> bool {
        self.names_in_use.contains_key(&name.to_lowercase())
    }

    /// Return `name`, or `name_1`, `name_2`, ... if taken, and mark the result used.
    pub fn unique_name(&mut self, name: &str) -> String {
        let key = name.to_lowercase();
        let mut i = self.names_in_use.get(&key).copied().unwrap_or(0);
        self.names_in_use.insert(key.clone(), i + 1);
        if i == 0 {
            return name.to_string();
        }
        let mut candidate_key = key.clone();
        while self.names_in_use.contains_key(&candidate_key) {
            candidate_key = format!("{}_{}", key, i);
            i += 1;
        }
        self.names_in_use.insert(candidate_key, 1);
        format!("{}_{}", name, i - 1)
    }

    /// Record `name` and every enclosing scope of it as used.
    pub fn mark_name_used(&mut self, name: &str) {
        let key = name.to_lowercase();
        for (i, c) in key.char_indices() {
            if c == '/' && i > 0 {
                self.names_in_use.entry(key[..i].to_string()).or_insert(1);
            }
        }
        let count = self.names_in_use.entry(key).or_insert(0);
        *count = (*count).max(1);
    }

    // ── Function library ──

    pub fn function(&self, name: &str) -> Option<&Arc<FunctionDef>> {
        self.library.get(name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &Arc<FunctionDef>> {
        self.library.values()
    }

    /// Add a function body. Re-adding an identical body is a no-op.
    pub fn add_function(&mut self, def: Arc<FunctionDef>) -> Result<()> {
        if let Some(existing) = self.library.get(&def.name) {
            if Arc::ptr_eq(existing, &def) || **existing == *def {
                return Ok(());
            }
            return Err(Error::DuplicateName {
                name: format!("function {}", def.name),
            });
        }
        // Nested bodies travel with their caller.
        for nested in def.graph.functions() {
            self.add_function(nested.clone())?;
        }
        self.library.insert(def.name.clone(), def);
        self.version += 1;
        Ok(())
    }

    // ── Ordering ──

    /// Nodes in `subset` ordered so that every node follows its (data and
    /// control) inputs that are also in `subset`.
    pub fn topological_order(&self, subset: &[NodeId]) -> Result<Vec<NodeId>> {
        let members: HashSet<NodeId> = subset.iter().copied().collect();
        let mut indegree: HashMap<NodeId, usize> = HashMap::new();
        let mut consumers: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for &id in subset {
            indegree.entry(id).or_insert(0);
            for input in &self.node_at(id).inputs {
                if let Some(src) = self.node_id(input.node_name()) {
                    if members.contains(&src) {
                        *indegree.entry(id).or_insert(0) += 1;
                        consumers.entry(src).or_default().push(id);
                    }
                }
            }
        }
        let mut ready: Vec<NodeId> = subset
            .iter()
            .copied()
            .filter(|id| indegree[id] == 0)
            .collect();
        ready.reverse();
        let mut order = Vec::with_capacity(subset.len());
        while let Some(id) = ready.pop() {
            order.push(id);
            if let Some(next) = consumers.get(&id) {
                for n in next.iter().rev() {
                    let d = indegree.get_mut(n).map(|d| {
                        *d -= 1;
                        *d
                    });
                    if d == Some(0) {
                        ready.push(*n);
                    }
                }
            }
        }
        if order.len() != subset.len() {
            let cycle = self.find_cycle(subset);
            return Err(Error::Cycle {
                nodes: cycle
                    .into_iter()
                    .map(|id| self.node_at(id).name.clone())
                    .collect(),
            });
        }
        Ok(order)
    }

    /// One cycle among `subset`, empty if there is none.
    pub fn find_cycle(&self, subset: &[NodeId]) -> Vec<NodeId> {
        let members: HashSet<NodeId> = subset.iter().copied().collect();
        let mut adj: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for &id in subset {
            for input in &self.node_at(id).inputs {
                if let Some(src) = self.node_id(input.node_name()) {
                    if members.contains(&src) {
                        adj.entry(src).or_default().push(id);
                    }
                }
            }
        }
        let mut state: HashMap<NodeId, u8> = HashMap::new(); // 1 = on path, 2 = done
        let mut path = Vec::new();
        for &id in subset {
            if !state.contains_key(&id) {
                if let Some(cycle) = dfs_cycle(id, &adj, &mut state, &mut path) {
                    return cycle;
                }
            }
        }
        Vec::new()
    }
}

fn dfs_cycle(
    node: NodeId,
    adj: &HashMap<NodeId, Vec<NodeId>>,
    state: &mut HashMap<NodeId, u8>,
    path: &mut Vec<NodeId>,
) -> Option<Vec<NodeId>> {
    state.insert(node, 1);
    path.push(node);
    if let Some(next) = adj.get(&node) {
        for &n in next {
            match state.get(&n) {
                None => {
                    if let Some(c) = dfs_cycle(n, adj, state, path) {
                        return Some(c);
                    }
                }
                Some(1) => {
                    let pos = path.iter().position(|p| *p == n).unwrap_or(0);
                    return Some(path[pos..].to_vec());
                }
                _ => {}
            }
        }
    }
    path.pop();
    state.insert(node, 2);
    None
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn int_node(name: &str) -> NodeSpec {
        NodeSpec::new(name, "IntOutput").output(DType::Int32, Shape::scalar())
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut g = Graph::new();
        g.add_node(int_node("A")).unwrap();
        let err = g.add_node(int_node("A")).unwrap_err();
        assert!(matches!(err, Error::DuplicateName { ref name } if name == "A"));
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn get_node_reports_missing() {
        let g = Graph::new();
        assert_eq!(g.get_node("nope").unwrap_err().to_string(), "node 'nope' not found");
    }

    #[test]
    fn inputs_must_exist() {
        let mut g = Graph::new();
        g.add_node(int_node("A")).unwrap();
        let err = g
            .add_node(NodeSpec::new("B", "IntInput").input(TensorRef::new("A", 1)))
            .unwrap_err();
        assert!(matches!(err, Error::MissingInput { .. }));
        let err = g
            .add_node(NodeSpec::new("B", "NoOp").control_input("Z"))
            .unwrap_err();
        assert!(matches!(err, Error::MissingControlInput { .. }));
    }

    #[test]
    fn batch_allows_forward_refs_and_cycles() {
        let mut g = Graph::new();
        g.add_nodes(vec![
            NodeSpec::new("A", "Loop")
                .input(TensorRef::new("B", 0))
                .output(DType::Int32, Shape::scalar()),
            NodeSpec::new("B", "Loop")
                .input(TensorRef::new("A", 0))
                .output(DType::Int32, Shape::scalar()),
        ])
        .unwrap();
        let ids: Vec<NodeId> = ["A", "B"].iter().map(|n| g.node_id(n).unwrap()).collect();
        assert_eq!(g.find_cycle(&ids).len(), 2);
        assert!(matches!(
            g.topological_order(&ids),
            Err(Error::Cycle { .. })
        ));
    }

    #[test]
    fn amendments_bump_version_only_on_change() {
        let mut g = Graph::new();
        g.add_node(int_node("A")).unwrap();
        g.add_node(int_node("B")).unwrap();
        let v = g.version();
        assert!(!g.set_device("A", "").unwrap());
        assert_eq!(g.version(), v);
        assert!(g.set_device("A", "/device:CPU:0").unwrap());
        assert_eq!(g.version(), v + 1);
        assert!(g.set_colocation("B", &["A".to_string()]).unwrap());
        assert!(!g.set_colocation("B", &["A".to_string(), "A".to_string()]).unwrap());
        assert_eq!(g.version(), v + 2);
        assert!(g.set_colocation("B", &["Z".to_string()]).is_err());
    }

    #[test]
    fn control_inputs_follow_data_inputs() {
        let mut g = Graph::new();
        g.add_node(int_node("A")).unwrap();
        g.add_node(int_node("C")).unwrap();
        let n = g
            .add_node(
                NodeSpec::new("B", "IntInput")
                    .control_input("C")
                    .input(TensorRef::new("A", 0))
                    .control_input("C"),
            )
            .unwrap();
        let rendered: Vec<String> = n.inputs.iter().map(|i| i.to_input_string()).collect();
        assert_eq!(rendered, vec!["A", "^C"]);
    }

    #[test]
    fn unique_name_probes_suffixes() {
        let mut g = Graph::new();
        assert_eq!(g.unique_name("foo"), "foo");
        assert_eq!(g.unique_name("foo"), "foo_1");
        assert_eq!(g.unique_name("Foo"), "Foo_2");
        assert_eq!(g.unique_name("foo_1"), "foo_1_1");
    }

    #[test]
    fn node_names_mark_enclosing_scopes() {
        let mut g = Graph::new();
        g.add_node(int_node("outer/inner/c")).unwrap();
        assert!(g.is_name_in_use("outer"));
        assert!(g.is_name_in_use("outer/inner"));
        assert_eq!(g.unique_name("outer"), "outer_1");
    }

    #[test]
    fn input_parsing() {
        assert_eq!(
            Input::parse("A").unwrap(),
            Input::Data(TensorRef::new("A", 0))
        );
        assert_eq!(
            Input::parse("scope/A:2").unwrap(),
            Input::Data(TensorRef::new("scope/A", 2))
        );
        assert_eq!(Input::parse("^A").unwrap(), Input::Control("A".into()));
        assert_eq!(
            Input::parse("A:B").unwrap_err().to_string(),
            "cannot convert 'A:B' to a tensor name"
        );
        assert!(Input::parse("").is_err());
    }

    #[test]
    fn topological_order_respects_control_edges() {
        let mut g = Graph::new();
        g.add_node(int_node("A")).unwrap();
        g.add_node(int_node("B").control_input("A")).unwrap();
        g.add_node(NodeSpec::new("C", "IntInput").input(TensorRef::new("B", 0)))
            .unwrap();
        let ids: Vec<NodeId> = ["C", "B", "A"].iter().map(|n| g.node_id(n).unwrap()).collect();
        let order: Vec<&str> = g
            .topological_order(&ids)
            .unwrap()
            .into_iter()
            .map(|id| g.node_at(id).name.as_str())
            .collect();
        assert_eq!(order, vec!["A", "B", "C"]);
    }
}
