// import.rs — Merge a serialized graph definition into a live graph
//
// Preconditions: every op named by the definition is registered.
// Postconditions: on success every kept node of `def` exists in `graph` under its
//                 remapped name, with inputs, colocation and control edges rewritten
//                 consistently; requested return elements are reported in order.
// Failure modes: structural errors (version bounds, unmapped input_map keys,
//                missing inputs, dtype/arity mismatches, unknown colocation targets,
//                unknown ops/attrs) abort the import. Checks run before the
//                destination is touched wherever possible; later failures leave
//                it unspecified. Oversized definitions fail with `GraphTooLarge`.
// Side effects: mutates `graph`; logs through `tracing`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::attr::{colocation_targets, AttrValue, COLOCATION_ATTR};
use crate::device::merge_device;
use crate::diag::{codes, Diagnostic};
use crate::dtype::{type_list, DType};
use crate::error::{Error, Result};
use crate::graph::{
    FunctionDef, Graph, GraphVersions, Input, NodeSpec, OutputSlot, TensorRef,
    GRAPH_DEF_VERSION, GRAPH_DEF_VERSION_MIN_PRODUCER,
};
use crate::graph_def::{GraphDef, LibraryFunction, NodeDef, VersionDef};
use crate::registry::{OpDef, OpRegistry};
use crate::shape::Shape;

// ── Options and results ─────────────────────────────────────────────────────

/// Picks a device for a node that has none. Sees the node with resolved inputs.
pub type DeviceFn = Arc<dyn Fn(&NodeSpec) -> String + Send + Sync>;

/// Size thresholds for serialized graph definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportLimits {
    /// Above this size a `W0301` warning is emitted.
    pub warn_bytes: usize,
    /// Above this size import fails.
    pub max_bytes: usize,
}

impl Default for ImportLimits {
    fn default() -> Self {
        ImportLimits {
            warn_bytes: 512 << 20,
            max_bytes: (1usize << 31) - 1,
        }
    }
}

/// Graph versions this runtime produces and accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionBounds {
    pub current: i32,
    pub min_producer: i32,
}

impl Default for VersionBounds {
    fn default() -> Self {
        VersionBounds {
            current: GRAPH_DEF_VERSION,
            min_producer: GRAPH_DEF_VERSION_MIN_PRODUCER,
        }
    }
}

#[derive(Clone, Default)]
pub struct ImportOptions {
    /// Name scope for imported nodes; `None` means `import`, `Some("")` merges
    /// into the current namespace.
    pub prefix: Option<String>,
    /// `name:k` → destination tensor, `^name` → destination control input.
    pub input_map: BTreeMap<String, Input>,
    /// `name:k` requests a tensor, a bare `name` requests a node.
    pub return_elements: Vec<String>,
    pub device_fn: Option<DeviceFn>,
    /// Device scope active at the import site; node devices are merged over it.
    pub ambient_device: String,
    /// Control inputs added to every node without inputs from inside the definition.
    pub control_dependencies: Vec<String>,
    pub limits: ImportLimits,
    pub versions: VersionBounds,
}

impl ImportOptions {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn map_input(mut self, key: impl Into<String>, value: TensorRef) -> Self {
        self.input_map.insert(key.into(), Input::Data(value));
        self
    }

    pub fn map_control_input(mut self, key: impl Into<String>, node: impl Into<String>) -> Self {
        self.input_map.insert(key.into(), Input::Control(node.into()));
        self
    }

    pub fn return_element(mut self, name: impl Into<String>) -> Self {
        self.return_elements.push(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnElement {
    Tensor(TensorRef),
    Node(String),
}

impl ReturnElement {
    pub fn as_tensor(&self) -> Option<&TensorRef> {
        match self {
            ReturnElement::Tensor(t) => Some(t),
            ReturnElement::Node(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    /// `None` when no return elements were requested.
    pub returned: Option<Vec<ReturnElement>>,
    /// Original name → name in the destination, for every imported node.
    pub names: BTreeMap<String, String>,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Import ──────────────────────────────────────────────────────────────────

/// One node of the definition after op lookup and attribute defaulting.
struct Prepared<'a> {
    def: &'a NodeDef,
    op: &'a OpDef,
    attrs: BTreeMap<String, AttrValue>,
    inputs: Vec<Input>,
    colocation: Vec<String>,
    input_types: Vec<DType>,
    output_types: Vec<DType>,
}

#[tracing::instrument(skip_all, fields(nodes = def.node.len(), prefix = ?options.prefix))]
pub fn import_graph_def(
    graph: &mut Graph,
    registry: &OpRegistry,
    def: &GraphDef,
    options: &ImportOptions,
) -> Result<ImportResult> {
    let mut diagnostics = Vec::new();

    // ── Pass 1: validate the definition on its own ──
    check_size(def, &options.limits, &mut diagnostics)?;
    check_versions(&def.versions, &options.versions)?;

    let mut by_name: HashMap<&str, usize> = HashMap::new();
    let mut prepared = Vec::with_capacity(def.node.len());
    for (i, node) in def.node.iter().enumerate() {
        if by_name.insert(node.name.as_str(), i).is_some() {
            return Err(Error::DuplicateNodeDef {
                name: node.name.clone(),
            });
        }
        prepared.push(prepare(node, registry)?);
    }
    let num_outputs = |name: &str| by_name.get(name).map(|i| prepared[*i].output_types.len());

    // ── Pass 2: input_map keys and return elements ──
    let mut input_map: HashMap<Input, &Input> = HashMap::new();
    let mut unmapped = Vec::new();
    for (key, value) in &options.input_map {
        let parsed = Input::parse(key)?;
        let found = match &parsed {
            Input::Data(t) => num_outputs(&t.node).is_some_and(|n| t.index < n),
            Input::Control(n) => by_name.contains_key(n.as_str()),
        };
        if matches!(parsed, Input::Control(_)) != matches!(value, Input::Control(_)) {
            return Err(Error::invalid(format!(
                "input_map entry '{}' must map a tensor to a tensor or a control input to a control input",
                key
            )));
        }
        if !found {
            unmapped.push(match &parsed {
                Input::Data(t) => t.to_string(),
                Input::Control(n) => format!("^{}", n),
            });
        }
        input_map.insert(parsed, value);
    }
    if !unmapped.is_empty() {
        return Err(Error::UnmappedInputs { keys: unmapped });
    }

    let mut requests = Vec::with_capacity(options.return_elements.len());
    for name in &options.return_elements {
        let not_found = || Error::ReturnElementNotFound { name: name.clone() };
        if name.contains(':') {
            let t = TensorRef::parse(name).map_err(|_| not_found())?;
            if !num_outputs(&t.node).is_some_and(|n| t.index < n) {
                return Err(not_found());
            }
            requests.push(ReturnElement::Tensor(t));
        } else {
            if !by_name.contains_key(name.as_str()) {
                return Err(not_found());
            }
            requests.push(ReturnElement::Node(name.clone()));
        }
    }

    // ── Pass 3: decide which nodes input_map makes redundant ──
    let mut needed: HashSet<&str> = HashSet::new();
    for p in &prepared {
        for input in &p.inputs {
            if !input_map.contains_key(input) {
                needed.insert(input.node_name());
            }
        }
        needed.extend(p.colocation.iter().map(String::as_str));
    }
    for r in &requests {
        match r {
            ReturnElement::Tensor(t) if !input_map.contains_key(&Input::Data(t.clone())) => {
                needed.insert(&t.node);
            }
            ReturnElement::Tensor(_) => {}
            ReturnElement::Node(n) => {
                needed.insert(n);
            }
        }
    }
    let mapped_nodes: HashSet<&str> = input_map.keys().map(|k| k.node_name()).collect();
    let skipped: HashSet<&str> = mapped_nodes
        .into_iter()
        .filter(|n| !needed.contains(n))
        .collect();
    for name in def.node.iter().map(|n| n.name.as_str()).filter(|n| skipped.contains(n)) {
        diagnostics.push(
            Diagnostic::note("node not imported; input_map replaces every use of it")
                .with_code(codes::W0302)
                .with_subject(name),
        );
    }

    // ── Pass 4: function library ──
    let library = LibraryBuilder::new(&def.library, registry, graph).build_all()?;

    // ── Pass 5: names ──
    let prefix = options.prefix.as_deref().unwrap_or("import").trim_end_matches('/');
    let mut names: HashMap<&str, String> = HashMap::new();
    if !prefix.is_empty() {
        let scope = if def.node.is_empty() {
            prefix.to_string()
        } else {
            graph.unique_name(prefix)
        };
        for node in def.node.iter().filter(|n| !skipped.contains(n.name.as_str())) {
            names.insert(&node.name, format!("{}/{}", scope, node.name));
        }
    } else {
        let original: HashSet<&str> = by_name.keys().copied().collect();
        let mut assigned: HashSet<String> = HashSet::new();
        for node in def.node.iter().filter(|n| !skipped.contains(n.name.as_str())) {
            let mut name = node.name.clone();
            if graph.is_name_in_use(&name) || assigned.contains(&name) {
                let mut i = 1;
                name = loop {
                    let candidate = format!("{}_{}", node.name, i);
                    if !graph.is_name_in_use(&candidate)
                        && !assigned.contains(&candidate)
                        && !original.contains(candidate.as_str())
                    {
                        break candidate;
                    }
                    i += 1;
                };
            }
            assigned.insert(name.clone());
            names.insert(&node.name, name);
        }
    }

    // ── Pass 6: build node specs ──
    let mut shapes: HashMap<&str, Vec<Shape>> = HashMap::new();
    let mut specs = Vec::with_capacity(prepared.len());
    for p in prepared.iter().filter(|p| !skipped.contains(p.def.name.as_str())) {
        let node_name = &p.def.name;
        let mut inputs = Vec::with_capacity(p.inputs.len());
        let mut actual_types = Vec::new();
        let mut input_shapes = Vec::new();
        let mut internal_inputs = false;
        for (input, text) in p.inputs.iter().zip(&p.def.input) {
            if let Some(mapped) = input_map.get(input) {
                if let Input::Data(t) = mapped {
                    let slot = graph.output(t).map_err(|_| Error::MissingInput {
                        node: node_name.clone(),
                        input: t.to_string(),
                    })?;
                    actual_types.push(slot.dtype);
                    input_shapes.push(slot.shape.clone());
                }
                inputs.push((*mapped).clone());
                continue;
            }
            internal_inputs = true;
            let missing = || Error::MissingInput {
                node: node_name.clone(),
                input: text.clone(),
            };
            match input {
                Input::Data(t) => {
                    let src = by_name.get(t.node.as_str()).ok_or_else(missing)?;
                    let dtype = *prepared[*src].output_types.get(t.index).ok_or_else(missing)?;
                    actual_types.push(dtype);
                    input_shapes.push(
                        shapes
                            .get(t.node.as_str())
                            .and_then(|s| s.get(t.index))
                            .cloned()
                            .unwrap_or_default(),
                    );
                    inputs.push(Input::Data(TensorRef::new(names[t.node.as_str()].clone(), t.index)));
                }
                Input::Control(c) => {
                    if !by_name.contains_key(c.as_str()) {
                        return Err(Error::MissingControlInput {
                            node: node_name.clone(),
                            input: c.clone(),
                        });
                    }
                    inputs.push(Input::Control(names[c.as_str()].clone()));
                }
            }
        }
        check_input_types(node_name, &p.input_types, &actual_types, &inputs)?;
        if !internal_inputs {
            inputs.extend(
                options
                    .control_dependencies
                    .iter()
                    .map(|c| Input::Control(c.clone())),
            );
        }

        let out_shapes = p.op.infer_shapes(&input_shapes, &p.attrs, p.output_types.len());
        let mut spec = NodeSpec::new(names[node_name.as_str()].clone(), p.def.op.clone());
        spec.inputs = inputs;
        spec.outputs = p
            .output_types
            .iter()
            .zip(&out_shapes)
            .map(|(dtype, shape)| OutputSlot {
                dtype: *dtype,
                shape: shape.clone(),
            })
            .collect();
        spec.attrs = p.attrs.clone();
        for target in &p.colocation {
            let renamed = names.get(target.as_str()).ok_or_else(|| Error::UnknownColocation {
                node: node_name.clone(),
                target: target.clone(),
            })?;
            spec.colocation.push(renamed.clone());
        }
        check_functions(node_name, &spec.attrs, graph, &library)?;
        spec.device = place(p, &spec, &prepared, &by_name, options)?;
        shapes.insert(node_name, out_shapes);
        specs.push(spec);
    }

    // ── Pass 7: commit ──
    for f in library {
        graph.add_function(f)?;
    }
    let was_empty = graph.is_empty();
    graph.add_nodes(specs)?;
    if !def.node.is_empty() {
        merge_versions(graph, &def.versions, was_empty, &mut diagnostics);
    }

    let returned = if requests.is_empty() {
        None
    } else {
        Some(
            requests
                .into_iter()
                .map(|r| match r {
                    ReturnElement::Tensor(t) => match input_map.get(&Input::Data(t.clone())) {
                        Some(Input::Data(mapped)) => ReturnElement::Tensor(mapped.clone()),
                        _ => ReturnElement::Tensor(TensorRef::new(names[t.node.as_str()].clone(), t.index)),
                    },
                    ReturnElement::Node(n) => ReturnElement::Node(names[n.as_str()].clone()),
                })
                .collect(),
        )
    };

    tracing::debug!(imported = names.len(), skipped = skipped.len(), "import complete");
    Ok(ImportResult {
        returned,
        names: names
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        diagnostics,
    })
}

fn check_size(def: &GraphDef, limits: &ImportLimits, diagnostics: &mut Vec<Diagnostic>) -> Result<()> {
    let bytes = def.byte_size();
    if bytes > limits.max_bytes {
        return Err(Error::GraphTooLarge {
            bytes,
            limit: limits.max_bytes,
        });
    }
    if bytes > limits.warn_bytes {
        tracing::warn!(bytes, limit = limits.warn_bytes, "large graph definition");
        diagnostics.push(
            Diagnostic::warning(format!(
                "graph definition is {} bytes, above the {} byte warning threshold",
                bytes, limits.warn_bytes
            ))
            .with_code(codes::W0301)
            .with_hint("very large graphs are slow to import; consider splitting the graph"),
        );
    }
    Ok(())
}

fn check_versions(versions: &VersionDef, bounds: &VersionBounds) -> Result<()> {
    if versions.producer < bounds.min_producer {
        return Err(Error::ProducerTooOld {
            producer: versions.producer,
            min_producer: bounds.min_producer,
        });
    }
    if versions.min_consumer > bounds.current {
        return Err(Error::ConsumerTooNew {
            min_consumer: versions.min_consumer,
            current: bounds.current,
        });
    }
    if versions.bad_consumers.contains(&bounds.current) {
        return Err(Error::BadConsumer {
            version: bounds.current,
        });
    }
    Ok(())
}

fn prepare<'a>(node: &'a NodeDef, registry: &'a OpRegistry) -> Result<Prepared<'a>> {
    let op = registry.get(&node.op, &node.name)?;
    let mut attrs = node.attr.clone();
    let colocation = attrs
        .remove(COLOCATION_ATTR)
        .map(|v| colocation_targets(&v))
        .unwrap_or_default();
    op.fill_defaults(&mut attrs);
    op.check_attrs(&node.name, &attrs)?;

    let mut inputs = Vec::with_capacity(node.input.len());
    let mut seen_control = false;
    for text in &node.input {
        let input = Input::parse(text)?;
        match input {
            Input::Control(_) => seen_control = true,
            Input::Data(_) if seen_control => {
                return Err(Error::invalid(format!(
                    "node '{}': control inputs must follow data inputs (found '{}')",
                    node.name, text
                )))
            }
            Input::Data(_) => {}
        }
        inputs.push(input);
    }
    Ok(Prepared {
        def: node,
        op,
        input_types: op.input_types(&node.name, &attrs)?,
        output_types: op.output_types(&node.name, &attrs)?,
        attrs,
        inputs,
        colocation,
    })
}

pub(crate) fn check_input_types(node: &str, expected: &[DType], actual: &[DType], inputs: &[Input]) -> Result<()> {
    if expected.len() != actual.len() {
        return Err(Error::ArityMismatch {
            node: node.to_string(),
            expected: type_list(expected),
            actual: type_list(actual),
        });
    }
    let data = inputs.iter().filter_map(|i| match i {
        Input::Data(t) => Some(t),
        Input::Control(_) => None,
    });
    for (index, ((e, a), src)) in expected.iter().zip(actual).zip(data).enumerate() {
        if e != a {
            return Err(Error::InputTypeMismatch {
                node: node.to_string(),
                index,
                expected: *e,
                actual: *a,
                source_tensor: src.to_string(),
            });
        }
    }
    Ok(())
}

fn check_functions(
    node: &str,
    attrs: &BTreeMap<String, AttrValue>,
    graph: &Graph,
    library: &[Arc<FunctionDef>],
) -> Result<()> {
    for name in func_names(attrs.values()) {
        if graph.function(name).is_none() && !library.iter().any(|f| f.name == name) {
            return Err(Error::not_found(
                "function",
                format!("{} (referenced by node '{}')", name, node),
            ));
        }
    }
    Ok(())
}

fn func_names<'a>(values: impl Iterator<Item = &'a AttrValue>) -> Vec<&'a str> {
    let mut out = Vec::new();
    for v in values {
        match v {
            AttrValue::Func(f) => out.push(f.as_str()),
            AttrValue::List(items) => out.extend(func_names(items.iter())),
            _ => {}
        }
    }
    out
}

/// Device for an imported node: its own, else its colocation group's, else
/// the device function's; merged over the ambient device scope.
fn place(
    p: &Prepared<'_>,
    spec: &NodeSpec,
    prepared: &[Prepared<'_>],
    by_name: &HashMap<&str, usize>,
    options: &ImportOptions,
) -> Result<String> {
    let mut device = p.def.device.clone();
    if device.is_empty() {
        device = p
            .colocation
            .iter()
            .filter_map(|t| by_name.get(t.as_str()))
            .map(|i| prepared[*i].def.device.as_str())
            .filter(|d| !d.is_empty())
            .last()
            .unwrap_or_default()
            .to_string();
    }
    if device.is_empty() {
        if let Some(f) = &options.device_fn {
            device = f(spec);
        }
    }
    if options.ambient_device.is_empty() {
        Ok(device)
    } else {
        merge_device(&options.ambient_device, &device)
    }
}

fn merge_versions(
    graph: &mut Graph,
    versions: &VersionDef,
    was_empty: bool,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let incoming = GraphVersions::from(versions);
    if was_empty {
        graph.set_versions(incoming);
        return;
    }
    let current = graph.versions().clone();
    let mut merged = GraphVersions {
        producer: current.producer.min(incoming.producer),
        min_consumer: current.min_consumer.max(incoming.min_consumer),
        bad_consumers: current.bad_consumers.clone(),
    };
    for b in incoming.bad_consumers {
        if !merged.bad_consumers.contains(&b) {
            merged.bad_consumers.push(b);
        }
    }
    if merged != current {
        diagnostics.push(
            Diagnostic::note(format!(
                "graph versions narrowed to producer {} / min consumer {}",
                merged.producer, merged.min_consumer
            ))
            .with_code(codes::W0303),
        );
        graph.set_versions(merged);
    }
}

// ── Function library ────────────────────────────────────────────────────────

/// Turns library entries into function bodies, callees before callers.
struct LibraryBuilder<'a> {
    defs: BTreeMap<&'a str, &'a LibraryFunction>,
    registry: &'a OpRegistry,
    destination: &'a Graph,
    built: HashMap<String, Arc<FunctionDef>>,
    in_progress: Vec<String>,
}

impl<'a> LibraryBuilder<'a> {
    fn new(defs: &'a [LibraryFunction], registry: &'a OpRegistry, destination: &'a Graph) -> Self {
        LibraryBuilder {
            defs: defs.iter().map(|f| (f.name.as_str(), f)).collect(),
            registry,
            destination,
            built: HashMap::new(),
            in_progress: Vec::new(),
        }
    }

    fn build_all(mut self) -> Result<Vec<Arc<FunctionDef>>> {
        let names: Vec<&str> = self.defs.keys().copied().collect();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(self.build(name)?);
        }
        Ok(out)
    }

    fn build(&mut self, name: &str) -> Result<Arc<FunctionDef>> {
        if let Some(f) = self.built.get(name) {
            return Ok(f.clone());
        }
        if self.in_progress.iter().any(|n| n == name) {
            let mut nodes = self.in_progress.clone();
            nodes.push(name.to_string());
            return Err(Error::Cycle { nodes });
        }
        let entry = *self
            .defs
            .get(name)
            .ok_or_else(|| Error::not_found("function", name))?;
        self.in_progress.push(name.to_string());

        let mut body = Graph::new();
        for node in &entry.node {
            for callee in func_names(node.attr.values()) {
                if self.defs.contains_key(callee) {
                    body.add_function(self.build(callee)?)?;
                } else if let Some(f) = self.destination.function(callee) {
                    body.add_function(f.clone())?;
                }
            }
        }
        let def = GraphDef {
            node: entry.node.clone(),
            versions: VersionDef {
                producer: GRAPH_DEF_VERSION,
                ..VersionDef::default()
            },
            library: Vec::new(),
        };
        import_graph_def(
            &mut body,
            self.registry,
            &def,
            &ImportOptions::default().with_prefix(""),
        )?;

        let tensor = |text: &String| -> Result<TensorRef> {
            let t = TensorRef::parse(text)?;
            body.output(&t)?;
            Ok(t)
        };
        let inputs = entry.input.iter().map(tensor).collect::<Result<Vec<_>>>()?;
        let outputs = entry.output.iter().map(tensor).collect::<Result<Vec<_>>>()?;
        for c in &entry.control_output {
            body.get_node(c)?;
        }
        let f = Arc::new(FunctionDef {
            name: entry.name.clone(),
            graph: body,
            inputs,
            outputs,
            control_outputs: entry.control_output.clone(),
        });
        self.in_progress.pop();
        self.built.insert(name.to_string(), f.clone());
        Ok(f)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> OpRegistry {
        let mut r = OpRegistry::with_builtin_ops();
        r.register_source(
            r#"
REGISTER_OP(IntOutput, OUTPUT(a: int32))
REGISTER_OP(IntInput, INPUT(a: int32))
REGISTER_OP(FloatInput, INPUT(a: float32))
"#,
            std::path::Path::new("<test>"),
        )
        .unwrap();
        r
    }

    fn def(text: &str) -> GraphDef {
        GraphDef::from_text(text).unwrap()
    }

    #[test]
    fn default_prefix_is_import() {
        let mut g = Graph::new();
        let r = import_graph_def(
            &mut g,
            &registry(),
            &def(r#"node { name: "A" op: "IntOutput" }"#),
            &ImportOptions::default(),
        )
        .unwrap();
        assert!(g.contains("import/A"));
        assert!(r.returned.is_none());
    }

    #[test]
    fn prefix_scope_is_uniquified() {
        let mut g = Graph::new();
        let d = def(r#"node { name: "B" op: "IntOutput" }"#);
        let opts = ImportOptions::default().with_prefix("A");
        import_graph_def(&mut g, &registry(), &d, &opts).unwrap();
        import_graph_def(&mut g, &registry(), &d, &opts).unwrap();
        assert!(g.contains("A/B"));
        assert!(g.contains("A_1/B"));
    }

    #[test]
    fn type_mismatch_names_both_types() {
        let mut g = Graph::new();
        let err = import_graph_def(
            &mut g,
            &registry(),
            &def(r#"node { name: "A" op: "IntOutput" } node { name: "B" op: "FloatInput" input: "A" }"#),
            &ImportOptions::default(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "input 0 of node B was passed int32 from import/A:0 incompatible with expected float32"
        );
    }

    #[test]
    fn arity_mismatch_lists_types() {
        let mut g = Graph::new();
        let err = import_graph_def(
            &mut g,
            &registry(),
            &def(r#"node { name: "A" op: "IntOutput" } node { name: "B" op: "IntInput" input: "A" input: "A" }"#),
            &ImportOptions::default(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "input types mismatch for node 'B' (expected 'int32' but got 'int32, int32')"
        );
    }

    #[test]
    fn data_input_after_control_input_is_rejected() {
        let mut g = Graph::new();
        let err = import_graph_def(
            &mut g,
            &registry(),
            &def(r#"node { name: "A" op: "IntOutput" } node { name: "B" op: "IntInput" input: "^A" input: "A" }"#),
            &ImportOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn oversized_definitions() {
        let d = def(r#"node { name: "A" op: "IntOutput" }"#);
        let size = d.byte_size();
        let mut opts = ImportOptions::default();
        opts.limits = ImportLimits {
            warn_bytes: size - 1,
            max_bytes: size,
        };
        let r = import_graph_def(&mut Graph::new(), &registry(), &d, &opts).unwrap();
        assert_eq!(r.diagnostics[0].code, Some(codes::W0301));
        opts.limits.max_bytes = size - 1;
        let err = import_graph_def(&mut Graph::new(), &registry(), &d, &opts).unwrap_err();
        assert!(matches!(err, Error::GraphTooLarge { .. }));
    }

    #[test]
    fn unknown_op_is_fatal() {
        let err = import_graph_def(
            &mut Graph::new(),
            &registry(),
            &def(r#"node { name: "A" op: "Frobnicate" }"#),
            &ImportOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "op type 'Frobnicate' of node 'A' is not registered");
    }

    #[test]
    fn recursive_library_is_a_cycle() {
        let d = def(
            r#"library { function { name: "f" node { name: "c" op: "PartitionedCall"
                 attr { key: "Tin" value { list { } } } attr { key: "Tout" value { list { } } }
                 attr { key: "f" value { func { name: "f" } } } } } }"#,
        );
        let err = import_graph_def(&mut Graph::new(), &registry(), &d, &ImportOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Cycle { .. }));
    }
}
