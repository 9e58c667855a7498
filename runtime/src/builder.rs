// builder.rs — Graph-building context used while tracing
//
// A `GraphBuilder` owns the graph under construction plus the ambient state
// that shapes every node created through it: the name scope, the variable
// scope, device and colocation scopes, control-dependency scopes and, for
// function bodies, the automatic control-dependency inserter.
//
// Scopes are entered with closures; the previous state is restored when the
// closure returns, whether it succeeded or not.
//
// Preconditions: tensors passed in belong to this builder's graph.
// Postconditions: every created node has a unique name, type attrs consistent
//                 with its inputs, and output slots carrying dtype and shape.
// Failure modes: op/attr/type errors from the registry; variable policy errors
//                from the store; `BranchMismatch` for incompatible `cond` branches.
// Side effects: variables created here are registered in the runtime's store
//               and their initial values written to its resource manager.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::attr::AttrValue;
use crate::collections::{in_scope, CollectionItem, LOCAL_VARIABLES, REGULARIZATION_LOSSES};
use crate::control_deps::AutoControlDeps;
use crate::device::merge_device;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::{FunctionDef, Graph, Input, NodeSpec, OutputSlot, TensorRef};
use crate::graph_def::GraphDef;
use crate::import::{check_input_types, import_graph_def, DeviceFn, ImportOptions, ImportResult};
use crate::registry::{ArgType, OpDef};
use crate::regularizer::Regularizer;
use crate::runtime::Runtime;
use crate::shape::Shape;
use crate::tensor::HostTensor;
use crate::value::{SymbolicTensor, Value};
use crate::variable::{Reuse, Variable, VariableRef, VariableRequest};
use crate::variable_scope::{GetterStage, ScopeName, ScopeOptions, VariableScope};

// ── Scope state ─────────────────────────────────────────────────────────────

enum DeviceScope {
    /// Merged over the enclosing scopes; empty clears them.
    Fixed(String),
    Func(DeviceFn),
}

struct ControlFrame {
    deps: Vec<String>,
    /// Stops inheritance of enclosing frames.
    clear: bool,
    /// Nodes created while this frame was active.
    created: HashSet<String>,
}

pub struct GraphBuilder<'rt> {
    rt: &'rt Runtime,
    graph: Graph,
    name_stack: String,
    var_scope: VariableScope,
    device_stack: Vec<DeviceScope>,
    colocation_stack: Vec<Vec<String>>,
    control_stack: Vec<ControlFrame>,
    acd: Option<AutoControlDeps>,
    collections: BTreeMap<String, Vec<CollectionItem>>,
    var_handles: HashMap<String, TensorRef>,
}

impl<'rt> GraphBuilder<'rt> {
    pub fn new(rt: &'rt Runtime) -> Self {
        GraphBuilder::with_graph(rt, Graph::new())
    }

    /// Continue building on an existing graph.
    pub fn with_graph(rt: &'rt Runtime, graph: Graph) -> Self {
        GraphBuilder {
            rt,
            graph,
            name_stack: String::new(),
            var_scope: VariableScope::root(),
            device_stack: Vec::new(),
            colocation_stack: Vec::new(),
            control_stack: Vec::new(),
            acd: None,
            collections: BTreeMap::new(),
            var_handles: HashMap::new(),
        }
    }

    /// A builder for a function body: stateful ops are ordered automatically.
    pub fn for_function(rt: &'rt Runtime) -> Self {
        let mut b = GraphBuilder::new(rt);
        b.acd = Some(AutoControlDeps::new());
        b
    }

    /// Start from `scope` instead of the root variable scope.
    pub(crate) fn set_variable_scope(&mut self, scope: VariableScope) {
        self.var_scope = scope;
    }

    pub fn runtime(&self) -> &'rt Runtime {
        self.rt
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    pub fn add_function(&mut self, f: Arc<FunctionDef>) -> Result<()> {
        self.graph.add_function(f)
    }

    // ── Name scopes ──

    pub fn current_name_scope(&self) -> &str {
        &self.name_stack
    }

    fn scoped(&self, name: &str) -> String {
        if self.name_stack.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.name_stack, name)
        }
    }

    /// Empty resets to the root; a trailing `/` re-enters that scope as is;
    /// anything else opens a fresh, uniquified scope below the current one.
    fn resolve_name_scope(&mut self, name: &str) -> String {
        if name.is_empty() {
            return String::new();
        }
        if let Some(absolute) = name.strip_suffix('/') {
            return absolute.to_string();
        }
        let scoped = self.scoped(name);
        self.graph.unique_name(&scoped)
    }

    pub fn name_scope<R>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let entered = self.resolve_name_scope(name);
        let saved = std::mem::replace(&mut self.name_stack, entered);
        let out = f(self);
        self.name_stack = saved;
        out
    }

    // ── Variable scopes ──

    pub fn current_variable_scope(&self) -> &VariableScope {
        &self.var_scope
    }

    pub fn variable_scope<R>(
        &mut self,
        name: impl Into<ScopeName>,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        self.variable_scope_with(name, ScopeOptions::default(), f)
    }

    /// Enter a variable scope together with its name scope.
    pub fn variable_scope_with<R>(
        &mut self,
        name: impl Into<ScopeName>,
        options: ScopeOptions,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let store = self.rt.variables();
        let parent = self.var_scope.clone();
        let (base, full, name_scope, captured) = match name.into() {
            ScopeName::Named(name) => (parent.clone(), parent.full_name(&name), name, false),
            ScopeName::Default(prefix) => {
                if options.reuse == Some(Reuse::ReuseOnly) {
                    return Err(Error::InvalidReuse {
                        message: "reuse=True cannot be used without a name_or_scope".to_string(),
                    });
                }
                let full = store.unique_scope_name(&parent.full_name(&prefix));
                let relative = match parent.name.as_str() {
                    "" => full.clone(),
                    p => full
                        .strip_prefix(&format!("{}/", p))
                        .unwrap_or(&full)
                        .to_string(),
                };
                (parent.clone(), full, relative, false)
            }
            ScopeName::Captured(scope) => {
                let entry = scope.original_name_scope.clone();
                let full = scope.name.clone();
                (scope, full, entry, true)
            }
        };

        let entered = self.resolve_name_scope(&name_scope);
        let saved_names = std::mem::replace(&mut self.name_stack, entered);
        store.open_scope(&full);
        let snapshot = captured.then(|| store.snapshot_counts());

        let original = if self.name_stack.is_empty() {
            String::new()
        } else {
            format!("{}/", self.name_stack)
        };
        let mut child = base.derive(full.clone(), original, &options);
        if captured && child.reuse == Reuse::CreateOnly {
            child.reuse = parent.reuse;
        }
        tracing::trace!(scope = %full, reuse = ?child.reuse, "enter variable scope");
        let saved_scope = std::mem::replace(&mut self.var_scope, child);

        let out = f(self);

        self.var_scope = saved_scope;
        self.name_stack = saved_names;
        match snapshot {
            Some(counts) => store.restore_counts(counts),
            None => store.close_subscopes(&full),
        }
        out
    }

    // ── Device, colocation and control scopes ──

    /// Place nodes created in `f` on `device`, merged over enclosing device
    /// scopes. An empty device clears them.
    pub fn device<R>(&mut self, device: &str, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.device_stack.push(DeviceScope::Fixed(device.to_string()));
        let out = f(self);
        self.device_stack.pop();
        out
    }

    /// Let `device_fn` choose the device of nodes created in `f`.
    pub fn device_fn<R>(&mut self, device_fn: DeviceFn, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.device_stack.push(DeviceScope::Func(device_fn));
        let out = f(self);
        self.device_stack.pop();
        out
    }

    /// Colocate nodes created in `f` with `node` (joining its colocation group).
    pub fn colocate_with<R>(&mut self, node: &str, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let target = self.graph.get_node(node)?;
        let group = if target.colocation.is_empty() {
            vec![target.name.clone()]
        } else {
            target.colocation.clone()
        };
        self.colocation_stack.push(group);
        let out = f(self);
        self.colocation_stack.pop();
        out
    }

    /// Nodes created in `f` run after `deps`, unless one of their data inputs
    /// was itself created in `f`.
    pub fn control_dependencies<R, I, S>(&mut self, deps: I, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let deps: Vec<String> = deps.into_iter().map(Into::into).collect();
        for d in &deps {
            self.graph.get_node(d)?;
        }
        self.with_control_frame(deps, false, f)
    }

    /// Ignore every enclosing control-dependency scope inside `f`.
    pub fn clear_control_dependencies<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.with_control_frame(Vec::new(), true, f)
    }

    fn with_control_frame<R>(
        &mut self,
        deps: Vec<String>,
        clear: bool,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        self.control_stack.push(ControlFrame {
            deps,
            clear,
            created: HashSet::new(),
        });
        let out = f(self);
        self.control_stack.pop();
        out
    }

    /// Control inputs contributed by the active frames for a node with `inputs`.
    fn scope_control_inputs(&self, inputs: &[TensorRef]) -> Vec<String> {
        let start = self
            .control_stack
            .iter()
            .rposition(|f| f.clear)
            .map_or(0, |i| i + 1);
        let mut deps: Vec<String> = Vec::new();
        for frame in &self.control_stack[start..] {
            if inputs.iter().any(|t| frame.created.contains(&t.node)) {
                continue;
            }
            for d in &frame.deps {
                if !deps.contains(d) && !inputs.iter().any(|t| &t.node == d) {
                    deps.push(d.clone());
                }
            }
        }
        deps
    }

    fn ambient_device(&self, spec: &NodeSpec) -> Result<String> {
        let mut device = String::new();
        for scope in &self.device_stack {
            match scope {
                DeviceScope::Fixed(d) if d.is_empty() => device.clear(),
                DeviceScope::Fixed(d) => device = merge_device(&device, d)?,
                DeviceScope::Func(f) => {
                    let mut probe = spec.clone();
                    probe.device = device.clone();
                    device = f(&probe);
                }
            }
        }
        Ok(device)
    }

    // ── Ops ──

    pub fn op(&mut self, op: &str) -> OpBuilder<'_, 'rt> {
        OpBuilder {
            b: self,
            req: OpRequest {
                op: op.to_string(),
                ..OpRequest::default()
            },
        }
    }

    fn create_op(&mut self, req: OpRequest) -> Result<String> {
        let OpRequest {
            op,
            name,
            inputs,
            control,
            mut attrs,
            output_shapes,
            device,
        } = req;
        let def = self.rt.registry().get(&op, name.as_deref().unwrap_or(&op))?;
        let node_name = {
            let scoped = self.scoped(name.as_deref().unwrap_or(&op));
            self.graph.unique_name(&scoped)
        };

        let mut slots = Vec::with_capacity(inputs.len());
        for t in &inputs {
            slots.push(self.graph.output(t).map_err(|_| Error::MissingInput {
                node: node_name.clone(),
                input: t.to_string(),
            })?);
        }
        let actual: Vec<DType> = slots.iter().map(|s| s.dtype).collect();
        infer_type_attrs(def, &actual, &mut attrs);
        def.fill_defaults(&mut attrs);
        def.check_attrs(&node_name, &attrs)?;
        let expected = def.input_types(&node_name, &attrs)?;
        let data: Vec<Input> = inputs.iter().cloned().map(Input::Data).collect();
        check_input_types(&node_name, &expected, &actual, &data)?;

        let output_types = def.output_types(&node_name, &attrs)?;
        let shapes = match output_shapes {
            Some(shapes) if shapes.len() == output_types.len() => shapes,
            Some(shapes) => {
                return Err(Error::invalid(format!(
                    "node '{}' has {} outputs but {} output shapes were given",
                    node_name,
                    output_types.len(),
                    shapes.len()
                )))
            }
            None => {
                let input_shapes: Vec<Shape> = slots.iter().map(|s| s.shape.clone()).collect();
                def.infer_shapes(&input_shapes, &attrs, output_types.len())
            }
        };

        let mut spec = NodeSpec::new(node_name.clone(), op.clone());
        spec.inputs = data;
        spec.attrs = attrs;
        spec.outputs = output_types
            .into_iter()
            .zip(shapes)
            .map(|(dtype, shape)| OutputSlot { dtype, shape })
            .collect();

        if let Some(group) = self.colocation_stack.last() {
            spec.colocation = group.clone();
            spec.device = group
                .iter()
                .filter_map(|n| self.graph.node(n))
                .map(|n| n.device.as_str())
                .filter(|d| !d.is_empty())
                .last()
                .unwrap_or_default()
                .to_string();
        } else {
            let ambient = self.ambient_device(&spec)?;
            spec.device = match &device {
                Some(d) => merge_device(&ambient, d)?,
                None => ambient,
            };
            if spec.device.is_empty() {
                spec.device = self.rt.config().default_device.clone();
            }
        }

        for dep in self.scope_control_inputs(&inputs).into_iter().chain(control) {
            if !spec.inputs.iter().any(|i| i.node_name() == dep) {
                spec.inputs.push(Input::Control(dep));
            }
        }
        let effects = match &self.acd {
            Some(acd) => Some(acd.process(&self.graph, self.rt.registry(), &mut spec)?),
            None => None,
        };

        self.graph.add_node(spec)?;
        if let (Some(acd), Some(effects)) = (&mut self.acd, effects) {
            acd.record(&node_name, &effects);
        }
        for frame in &mut self.control_stack {
            frame.created.insert(node_name.clone());
        }
        Ok(node_name)
    }

    fn outputs_of(&self, node: &str) -> Result<Vec<TensorRef>> {
        let n = self.graph.get_node(node)?.outputs.len();
        Ok((0..n).map(|i| TensorRef::new(node, i)).collect())
    }

    pub fn constant(&mut self, value: HostTensor, name: Option<&str>) -> Result<TensorRef> {
        let dtype = value.dtype;
        let mut op = self
            .op("Const")
            .attr("value", AttrValue::Tensor(value))
            .attr("dtype", AttrValue::Type(dtype));
        if let Some(name) = name {
            op = op.name(name);
        }
        op.finish_one()
    }

    pub fn scalar(&mut self, value: f64, dtype: DType) -> Result<TensorRef> {
        self.constant(HostTensor::full(dtype, &[], value)?, None)
    }

    pub fn placeholder(&mut self, dtype: DType, shape: Shape, name: Option<&str>) -> Result<TensorRef> {
        let mut op = self
            .op("Placeholder")
            .attr("dtype", AttrValue::Type(dtype))
            .attr("shape", AttrValue::Shape(shape));
        if let Some(name) = name {
            op = op.name(name);
        }
        op.finish_one()
    }

    pub fn identity(&mut self, t: &TensorRef) -> Result<TensorRef> {
        self.op("Identity").input(t).finish_one()
    }

    /// `t` as a symbolic value carrying its dtype and static shape.
    pub fn symbolic(&self, t: &TensorRef) -> Result<Value> {
        let slot = self.graph.output(t)?;
        Ok(Value::Symbolic(SymbolicTensor {
            tensor: t.clone(),
            dtype: slot.dtype,
            shape: slot.shape.clone(),
        }))
    }

    // ── Variables ──

    /// `get_variable` under the current variable scope: the request name is
    /// qualified by the scope and unset fields take the scope's defaults.
    pub fn get_variable(&mut self, req: VariableRequest) -> Result<VariableRef> {
        let scope = self.var_scope.clone();
        let mut req = req;
        req.name = scope.full_name(&req.name);
        req.reuse = Some(req.reuse.unwrap_or(scope.reuse));
        if req.initializer.is_none() {
            req.initializer = scope.initializer.clone();
        }
        if req.regularizer.is_none() {
            req.regularizer = scope.regularizer.clone();
        }
        if req.partitioner.is_none() {
            req.partitioner = scope.partitioner.clone();
        }
        let has_value = req.initializer.as_ref().is_some_and(|i| i.is_value());
        if req.dtype.is_none() && !has_value {
            req.dtype = scope.dtype;
        }
        if req.use_resource.is_none() {
            req.use_resource = scope.use_resource;
        }

        let stage = match req.custom_getter.take() {
            Some(getter) => Some(GetterStage::Plain(getter)),
            None => scope.custom_getter.clone(),
        };
        let mut true_getter = |r: VariableRequest| self.true_getter(r);
        match stage {
            Some(stage) => stage.run(&mut true_getter, req),
            None => true_getter(req),
        }
    }

    /// A non-trainable variable in the local variables collection.
    pub fn get_local_variable(&mut self, req: VariableRequest) -> Result<VariableRef> {
        let mut req = req.trainable(false);
        if req.collections.is_none() {
            req.collections = Some(vec![LOCAL_VARIABLES.to_string()]);
        }
        self.get_variable(req)
    }

    fn true_getter(&mut self, req: VariableRequest) -> Result<VariableRef> {
        let acquired = self.rt.variables().get_variable(&req, self.rt.resources())?;
        if let Some(reg) = &req.regularizer {
            for var in &acquired.created {
                self.add_regularization(reg, var)?;
            }
        }
        Ok(acquired.variable)
    }

    fn add_regularization(&mut self, reg: &Regularizer, var: &Arc<Variable>) -> Result<()> {
        if self.build_penalty(reg, var)?.is_some() {
            self.rt.variables().record_regularizer(Arc::clone(var), reg.clone());
        }
        Ok(())
    }

    /// Build the penalty of `var` in this graph and record it in the graph's
    /// regularization-losses collection.
    fn build_penalty(&mut self, reg: &Regularizer, var: &Variable) -> Result<Option<TensorRef>> {
        let scope = format!("{}/Regularizer/", var.name);
        let penalty = self.clear_control_dependencies(|b| {
            b.name_scope(&scope, |b| {
                let value = b.read_variable(var)?;
                reg.apply(b, &value)
            })
        })?;
        if let Some(tensor) = &penalty {
            tracing::debug!(variable = %var.name, penalty = %tensor, "regularization loss");
            self.add_to_collection(
                REGULARIZATION_LOSSES,
                CollectionItem::Tensor {
                    variable: var.name.clone(),
                    tensor: tensor.clone(),
                },
            );
        }
        Ok(penalty)
    }

    /// Penalties of every regularized variable in the runtime under `scope`.
    /// Variables created in another graph (a traced function body, say) get
    /// their penalty rebuilt here once.
    pub fn regularization_losses(&mut self, scope: Option<&str>) -> Result<Vec<TensorRef>> {
        let mut losses = Vec::new();
        for (var, reg) in self.rt.variables().regularized(scope) {
            let recorded = self.collections.get(REGULARIZATION_LOSSES).and_then(|items| {
                items.iter().find_map(|item| match item {
                    CollectionItem::Tensor { variable, tensor } if *variable == var.name => Some(tensor.clone()),
                    _ => None,
                })
            });
            let penalty = match recorded {
                Some(tensor) => Some(tensor),
                None => self.build_penalty(&reg, &var)?,
            };
            losses.extend(penalty);
        }
        Ok(losses)
    }

    /// The handle node of `var` in this graph, created on first use at the
    /// root name scope outside any colocation or control-dependency scope.
    pub fn var_handle(&mut self, var: &Variable) -> Result<TensorRef> {
        if let Some(t) = self.var_handles.get(&var.name) {
            return Ok(t.clone());
        }
        let saved_names = std::mem::take(&mut self.name_stack);
        let saved_colocation = std::mem::take(&mut self.colocation_stack);
        let handle = self.clear_control_dependencies(|b| {
            b.op("VarHandleOp")
                .name(&var.name)
                .attr("shared_name", AttrValue::S(var.name.clone()))
                .attr("dtype", AttrValue::Type(var.dtype))
                .attr("shape", AttrValue::Shape(var.static_shape()))
                .finish_one()
        });
        self.name_stack = saved_names;
        self.colocation_stack = saved_colocation;
        let handle = handle?;
        self.var_handles.insert(var.name.clone(), handle.clone());
        Ok(handle)
    }

    pub fn read_variable(&mut self, var: &Variable) -> Result<TensorRef> {
        let handle = self.var_handle(var)?;
        self.op("ReadVariableOp")
            .input(&handle)
            .attr("dtype", AttrValue::Type(var.dtype))
            .output_shapes(vec![var.static_shape()])
            .finish_one()
    }

    /// Returns the name of the assignment node.
    pub fn assign_variable(&mut self, var: &Variable, value: &TensorRef) -> Result<String> {
        let handle = self.var_handle(var)?;
        self.op("AssignVariableOp")
            .input(&handle)
            .input(value)
            .attr("dtype", AttrValue::Type(var.dtype))
            .finish_node()
    }

    pub fn assign_add_variable(&mut self, var: &Variable, delta: &TensorRef) -> Result<String> {
        let handle = self.var_handle(var)?;
        self.op("AssignAddVariableOp")
            .input(&handle)
            .input(delta)
            .attr("dtype", AttrValue::Type(var.dtype))
            .finish_node()
    }

    // ── Collections ──

    pub fn add_to_collection(&mut self, key: &str, item: CollectionItem) {
        self.collections.entry(key.to_string()).or_default().push(item);
    }

    /// Variables of the runtime's store in collection `key`, followed by the
    /// items this graph recorded under `key`, filtered by name prefix. Use
    /// `regularization_losses` for penalties recorded in other graphs.
    pub fn get_collection(&self, key: &str, scope: Option<&str>) -> Vec<CollectionItem> {
        let mut items: Vec<CollectionItem> = self
            .rt
            .variables()
            .collection(key, scope)
            .into_iter()
            .map(CollectionItem::Variable)
            .collect();
        if let Some(local) = self.collections.get(key) {
            items.extend(
                local
                    .iter()
                    .filter(|item| in_scope(item.name(), scope))
                    .cloned(),
            );
        }
        items
    }

    // ── Functions and control flow ──

    /// Route `values` through identities that run after every pending
    /// stateful write of this function body.
    pub fn mark_as_return(&mut self, values: &[TensorRef]) -> Result<Vec<TensorRef>> {
        let pending = self.acd.as_ref().map(|a| a.pending()).unwrap_or_default();
        if pending.is_empty() {
            return Ok(values.to_vec());
        }
        let mut out = Vec::with_capacity(values.len());
        for v in values {
            let mut op = self.op("Identity").input(v);
            for dep in pending.iter().filter(|d| **d != v.node) {
                op = op.control_input(dep);
            }
            out.push(op.finish_one()?);
        }
        Ok(out)
    }

    /// Close this builder into a function body with the given parameters and results.
    pub fn into_function(
        mut self,
        name: &str,
        inputs: Vec<TensorRef>,
        outputs: &[TensorRef],
    ) -> Result<Arc<FunctionDef>> {
        let outputs = self.mark_as_return(outputs)?;
        let control_outputs = self.acd.as_ref().map(|a| a.pending()).unwrap_or_default();
        Ok(Arc::new(FunctionDef {
            name: name.to_string(),
            graph: self.graph,
            inputs,
            outputs,
            control_outputs,
        }))
    }

    /// Trace `body` into a function taking tensors shaped like `inputs`.
    pub fn trace_function<F>(&self, name: &str, inputs: &[TensorRef], body: F) -> Result<Arc<FunctionDef>>
    where
        F: FnOnce(&mut GraphBuilder<'rt>, &[TensorRef]) -> Result<Vec<TensorRef>>,
    {
        let mut child = GraphBuilder::for_function(self.rt);
        child.set_variable_scope(self.var_scope.clone());
        let mut params = Vec::with_capacity(inputs.len());
        for (i, t) in inputs.iter().enumerate() {
            let slot = self.graph.output(t)?;
            params.push(child.placeholder(slot.dtype, slot.shape.clone(), Some(&format!("input_{}", i)))?);
        }
        let outputs = body(&mut child, &params)?;
        child.into_function(name, params, &outputs)
    }

    /// Functional conditional: `then_fn` or `else_fn` runs on `inputs`
    /// depending on the scalar `pred`. Both branches must return the same
    /// number of tensors with equal dtypes.
    #[tracing::instrument(skip_all, fields(pred = %pred))]
    pub fn cond<T, E>(
        &mut self,
        pred: &TensorRef,
        inputs: &[TensorRef],
        then_fn: T,
        else_fn: E,
    ) -> Result<Vec<TensorRef>>
    where
        T: FnOnce(&mut GraphBuilder<'rt>, &[TensorRef]) -> Result<Vec<TensorRef>>,
        E: FnOnce(&mut GraphBuilder<'rt>, &[TensorRef]) -> Result<Vec<TensorRef>>,
    {
        let id = self.rt.next_function_id();
        let then_f = self.trace_function(&format!("cond_true_{}", id), inputs, then_fn)?;
        let else_f = self.trace_function(&format!("cond_false_{}", id), inputs, else_fn)?;

        let node = self.scoped("cond");
        let then_out = function_outputs(&then_f)?;
        let else_out = function_outputs(&else_f)?;
        if then_out.len() != else_out.len() {
            return Err(Error::BranchMismatch {
                node,
                detail: format!(
                    "true branch returns {} outputs, false branch returns {}",
                    then_out.len(),
                    else_out.len()
                ),
            });
        }
        let mut out_types = Vec::with_capacity(then_out.len());
        let mut out_shapes = Vec::with_capacity(then_out.len());
        for (i, (t, e)) in then_out.iter().zip(&else_out).enumerate() {
            if t.dtype != e.dtype {
                return Err(Error::BranchMismatch {
                    node,
                    detail: format!(
                        "output {} is {} in the true branch and {} in the false branch",
                        i, t.dtype, e.dtype
                    ),
                });
            }
            out_types.push(t.dtype);
            out_shapes.push(t.shape.merge_with(&e.shape).unwrap_or_default());
        }

        let in_types = inputs
            .iter()
            .map(|t| self.graph.output(t).map(|s| s.dtype))
            .collect::<Result<Vec<_>>>()?;
        self.graph.add_function(then_f.clone())?;
        self.graph.add_function(else_f.clone())?;
        tracing::debug!(then_branch = %then_f.name, else_branch = %else_f.name, "traced cond branches");
        self.op("If")
            .name("cond")
            .input(pred)
            .inputs(inputs)
            .attr("Tin", AttrValue::type_list(&in_types))
            .attr("Tout", AttrValue::type_list(&out_types))
            .attr("then_branch", AttrValue::Func(then_f.name.clone()))
            .attr("else_branch", AttrValue::Func(else_f.name.clone()))
            .output_shapes(out_shapes)
            .finish()
    }

    /// Emit a call node for `f`. Bodies with stateful ops get a stateful call.
    pub fn call_function(&mut self, f: &Arc<FunctionDef>, args: &[TensorRef]) -> Result<Vec<TensorRef>> {
        self.graph.add_function(f.clone())?;
        let registry = self.rt.registry();
        let stateful = !f.control_outputs.is_empty()
            || f
                .graph
                .nodes()
                .any(|n| registry.lookup(&n.op).is_some_and(|d| d.stateful));
        let op = if stateful {
            "StatefulPartitionedCall"
        } else {
            "PartitionedCall"
        };
        let outputs = function_outputs(f)?;
        self.op(op)
            .inputs(args)
            .attr("Tin", AttrValue::type_list(&f.input_types()?))
            .attr("Tout", AttrValue::type_list(&f.output_types()?))
            .attr("f", AttrValue::Func(f.name.clone()))
            .output_shapes(outputs.into_iter().map(|s| s.shape).collect())
            .finish()
    }

    /// Merge a serialized graph into this one. The builder's ambient device,
    /// device function and control dependencies apply unless `options` sets
    /// its own; size limits and version bounds come from the runtime config.
    pub fn import(&mut self, def: &GraphDef, options: ImportOptions) -> Result<ImportResult> {
        let mut options = options;
        if options.ambient_device.is_empty() {
            options.ambient_device = self.fixed_device()?;
        }
        if options.device_fn.is_none() {
            options.device_fn = self.device_stack.iter().rev().find_map(|s| match s {
                DeviceScope::Func(f) => Some(f.clone()),
                DeviceScope::Fixed(_) => None,
            });
        }
        if options.control_dependencies.is_empty() {
            options.control_dependencies = self.scope_control_inputs(&[]);
        }
        options.limits = self.rt.config().import;
        options.versions = self.rt.config().versions;
        import_graph_def(&mut self.graph, self.rt.registry(), def, &options)
    }

    fn fixed_device(&self) -> Result<String> {
        let mut device = String::new();
        for scope in &self.device_stack {
            if let DeviceScope::Fixed(d) = scope {
                if d.is_empty() {
                    device.clear();
                } else {
                    device = merge_device(&device, d)?;
                }
            }
        }
        Ok(device)
    }

    /// Inline the body of `f` with its parameters bound to `args`. Returns
    /// the tensors standing for its results.
    pub fn inline_function(&mut self, f: &FunctionDef, args: &[TensorRef]) -> Result<Vec<TensorRef>> {
        if args.len() != f.inputs.len() {
            return Err(Error::ArityMismatch {
                node: f.name.clone(),
                expected: crate::dtype::type_list(&f.input_types()?),
                actual: crate::dtype::type_list(
                    &args
                        .iter()
                        .map(|t| self.graph.output(t).map(|s| s.dtype))
                        .collect::<Result<Vec<_>>>()?,
                ),
            });
        }
        let mut options = ImportOptions::default().with_prefix(self.scoped(&f.name));
        for (param, arg) in f.inputs.iter().zip(args) {
            options = options.map_input(param.to_string(), arg.clone());
        }
        for out in &f.outputs {
            options = options.return_element(out.to_string());
        }
        let result = self.import(&GraphDef::from_graph(&f.graph), options)?;
        Ok(result
            .returned
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| r.as_tensor().cloned())
            .collect())
    }
}

fn function_outputs(f: &FunctionDef) -> Result<Vec<OutputSlot>> {
    f.outputs
        .iter()
        .map(|t| f.graph.output(t).cloned())
        .collect()
}

/// Set type attrs the caller left out from the dtypes of the inputs.
fn infer_type_attrs(def: &OpDef, actual: &[DType], attrs: &mut BTreeMap<String, AttrValue>) {
    let singles_after = |from: usize| {
        def.inputs[from..]
            .iter()
            .filter(|a| matches!(a.ty, ArgType::Fixed(_) | ArgType::Attr(_)))
            .count()
    };
    let mut pos = 0;
    for (i, arg) in def.inputs.iter().enumerate() {
        let remaining = actual.len().saturating_sub(pos);
        match &arg.ty {
            ArgType::Fixed(_) => pos += 1,
            ArgType::Attr(name) => {
                if let Some(t) = actual.get(pos) {
                    attrs.entry(name.clone()).or_insert(AttrValue::Type(*t));
                }
                pos += 1;
            }
            ArgType::Repeated { number_attr, elem } => {
                let n = match attrs.get(number_attr).and_then(AttrValue::as_int) {
                    Some(n) => n.max(0) as usize,
                    None => {
                        let n = remaining.saturating_sub(singles_after(i + 1));
                        attrs.insert(number_attr.clone(), AttrValue::I(n as i64));
                        n
                    }
                };
                if let (ArgType::Attr(t_attr), Some(t)) = (elem.as_ref(), actual.get(pos)) {
                    if n > 0 {
                        attrs.entry(t_attr.clone()).or_insert(AttrValue::Type(*t));
                    }
                }
                pos += n;
            }
            ArgType::List(name) => {
                let n = match attrs.get(name).and_then(AttrValue::as_type_list) {
                    Some(types) => types.len(),
                    None => {
                        let n = remaining.saturating_sub(singles_after(i + 1));
                        let start = pos.min(actual.len());
                        let end = (pos + n).min(actual.len());
                        attrs.insert(name.clone(), AttrValue::type_list(&actual[start..end]));
                        n
                    }
                };
                pos += n;
            }
        }
    }
}

// ── Op builder ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct OpRequest {
    op: String,
    name: Option<String>,
    inputs: Vec<TensorRef>,
    control: Vec<String>,
    attrs: BTreeMap<String, AttrValue>,
    output_shapes: Option<Vec<Shape>>,
    device: Option<String>,
}

/// One node under construction; created by `GraphBuilder::op`.
pub struct OpBuilder<'b, 'rt> {
    b: &'b mut GraphBuilder<'rt>,
    req: OpRequest,
}

impl<'b, 'rt> OpBuilder<'b, 'rt> {
    /// Base name, qualified by the current name scope; defaults to the op type.
    pub fn name(mut self, name: &str) -> Self {
        self.req.name = Some(name.to_string());
        self
    }

    pub fn input(mut self, t: &TensorRef) -> Self {
        self.req.inputs.push(t.clone());
        self
    }

    pub fn inputs(mut self, ts: &[TensorRef]) -> Self {
        self.req.inputs.extend(ts.iter().cloned());
        self
    }

    pub fn control_input(mut self, node: &str) -> Self {
        self.req.control.push(node.to_string());
        self
    }

    pub fn attr(mut self, name: &str, value: AttrValue) -> Self {
        self.req.attrs.insert(name.to_string(), value);
        self
    }

    /// Output shapes known to the caller, replacing the op's shape function.
    pub fn output_shapes(mut self, shapes: Vec<Shape>) -> Self {
        self.req.output_shapes = Some(shapes);
        self
    }

    pub fn device(mut self, device: &str) -> Self {
        self.req.device = Some(device.to_string());
        self
    }

    /// Create the node and return its name.
    pub fn finish_node(self) -> Result<String> {
        let OpBuilder { b, req } = self;
        b.create_op(req)
    }

    pub fn finish(self) -> Result<Vec<TensorRef>> {
        let OpBuilder { b, req } = self;
        let name = b.create_op(req)?;
        b.outputs_of(&name)
    }

    pub fn finish_one(self) -> Result<TensorRef> {
        let op = self.req.op.clone();
        self.finish()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::invalid(format!("op {} has no outputs", op)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable_scope::custom_getter;
    use std::sync::Mutex;

    fn float(dims: &[i64]) -> Shape {
        Shape::from_dims(dims)
    }

    #[test]
    fn op_names_are_scoped_and_unique() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let x = b.placeholder(DType::Float, float(&[2]), Some("x")).unwrap();
        let a = b.op("Add").input(&x).input(&x).finish_one().unwrap();
        let a1 = b.op("Add").input(&x).input(&x).finish_one().unwrap();
        assert_eq!((a.node.as_str(), a1.node.as_str()), ("Add", "Add_1"));
        let inner = b
            .name_scope("layer", |b| b.op("Neg").input(&x).finish_one())
            .unwrap();
        let again = b
            .name_scope("layer", |b| b.op("Neg").input(&x).finish_one())
            .unwrap();
        assert_eq!(inner.node, "layer/Neg");
        assert_eq!(again.node, "layer_1/Neg");
        let absolute = b
            .name_scope("layer/", |b| b.op("Neg").input(&x).finish_one())
            .unwrap();
        assert_eq!(absolute.node, "layer/Neg_1");
        assert_eq!(b.current_name_scope(), "");
    }

    #[test]
    fn type_attrs_are_inferred_and_checked() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let x = b.placeholder(DType::Float, float(&[3]), None).unwrap();
        let i = b.placeholder(DType::Int32, float(&[3]), None).unwrap();
        let sum = b.op("AddN").inputs(&[x.clone(), x.clone(), x.clone()]).finish_one().unwrap();
        let node = b.graph().get_node(&sum.node).unwrap();
        assert_eq!(node.attr("N"), Some(&AttrValue::I(3)));
        assert_eq!(node.attr("T"), Some(&AttrValue::Type(DType::Float)));
        assert_eq!(b.graph().output(&sum).unwrap().shape, float(&[3]));

        let err = b.op("Add").input(&x).input(&i).finish_one().unwrap_err();
        assert!(matches!(err, Error::InputTypeMismatch { index: 1, .. }));
        let err = b.op("Cast").input(&x).finish_one().unwrap_err();
        assert!(matches!(err, Error::MissingAttr { .. }));
    }

    #[test]
    fn variable_scopes_qualify_and_share() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let first = b
            .variable_scope("layer", |b| b.get_variable(VariableRequest::new("w").shape(&[2])))
            .unwrap();
        assert_eq!(first.name(), "layer/w");
        let err = b
            .variable_scope("layer", |b| b.get_variable(VariableRequest::new("w").shape(&[2])))
            .unwrap_err();
        assert!(matches!(err, Error::VariableExists { .. }));
        let shared = b
            .variable_scope_with("layer", ScopeOptions::default().reuse(Reuse::ReuseOnly), |b| {
                b.variable_scope("inner", |b| {
                    assert_eq!(b.current_variable_scope().reuse, Reuse::ReuseOnly);
                    Ok(())
                })?;
                b.get_variable(VariableRequest::new("w"))
            })
            .unwrap();
        assert!(shared.same_as(&first));
    }

    #[test]
    fn default_named_scopes_probe_suffixes() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let mut names = Vec::new();
        for _ in 0..2 {
            names.push(
                b.variable_scope(ScopeName::default_name("dense"), |b| {
                    Ok(b.current_variable_scope().name.clone())
                })
                .unwrap(),
            );
        }
        assert_eq!(names, ["dense", "dense_1"]);
        let nested = b
            .variable_scope("outer", |b| {
                b.variable_scope(ScopeName::default_name("dense"), |b| {
                    Ok(b.current_variable_scope().name.clone())
                })
            })
            .unwrap();
        assert_eq!(nested, "outer/dense");
        let err = b
            .variable_scope_with(
                ScopeName::default_name("dense"),
                ScopeOptions::default().reuse(Reuse::ReuseOnly),
                |_| Ok(()),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReuse { .. }));
    }

    #[test]
    fn captured_scopes_reenter_their_name_scope() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let captured = b
            .variable_scope("outer", |b| Ok(b.current_variable_scope().clone()))
            .unwrap();
        let (scope, names) = b
            .variable_scope("other", |b| {
                b.variable_scope(&captured, |b| {
                    Ok((
                        b.current_variable_scope().name.clone(),
                        b.current_name_scope().to_string(),
                    ))
                })
            })
            .unwrap();
        assert_eq!(scope, "outer");
        assert_eq!(names, "outer");
    }

    #[test]
    fn custom_getters_see_full_names_and_may_create_several() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let split = custom_getter(move |next, req| {
            log.lock().unwrap().push(req.name.clone());
            let mut imag = req.clone();
            imag.name = format!("{}/imag", req.name);
            next(imag)?;
            let mut real = req;
            real.name = format!("{}/real", real.name);
            next(real)
        });
        let got = b
            .variable_scope_with("c", ScopeOptions::default().custom_getter(split), |b| {
                b.get_variable(VariableRequest::new("z").shape(&[2]))
            })
            .unwrap();
        assert_eq!(got.name(), "c/z/real");
        assert_eq!(*seen.lock().unwrap(), vec!["c/z".to_string()]);
        assert!(rt.variables().variable("c/z/imag").is_some());
    }

    #[test]
    fn regularization_runs_on_creation_only() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let opts = ScopeOptions::default().regularizer(Regularizer::L2(0.1));
        b.variable_scope_with("layer", opts.clone(), |b| {
            b.get_variable(VariableRequest::new("w").shape(&[2, 2]))
        })
        .unwrap();
        let losses = b.get_collection(REGULARIZATION_LOSSES, None);
        assert_eq!(losses.len(), 1);
        assert!(losses[0].name().starts_with("layer/w/Regularizer/"));
        b.variable_scope_with("layer", opts.reuse(Reuse::ReuseOnly), |b| {
            b.get_variable(VariableRequest::new("w"))
        })
        .unwrap();
        assert_eq!(b.get_collection(REGULARIZATION_LOSSES, Some("layer/")).len(), 1);
        assert!(b.get_collection(REGULARIZATION_LOSSES, Some("other/")).is_empty());
    }

    #[test]
    fn local_variables_are_not_trainable() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        b.get_local_variable(VariableRequest::new("step").shape(&[]).dtype(DType::Int64))
            .unwrap();
        assert_eq!(b.get_collection(LOCAL_VARIABLES, None).len(), 1);
        assert!(b
            .get_collection(crate::collections::TRAINABLE_VARIABLES, None)
            .is_empty());
    }

    #[test]
    fn control_dependency_scopes_skip_dominated_nodes() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let a = b.scalar(1.0, DType::Float).unwrap();
        let c = b.scalar(2.0, DType::Float).unwrap();
        let (x, y, z) = b
            .control_dependencies([a.node.clone()], |b| {
                let x = b.op("Neg").input(&c).finish_one()?;
                let y = b.op("Neg").input(&x).finish_one()?;
                let z = b.clear_control_dependencies(|b| b.op("Neg").input(&c).finish_one())?;
                Ok((x, y, z))
            })
            .unwrap();
        let deps = |t: &TensorRef| -> Vec<String> {
            b.graph()
                .get_node(&t.node)
                .unwrap()
                .control_inputs()
                .map(str::to_string)
                .collect()
        };
        assert_eq!(deps(&x), vec![a.node.clone()]);
        assert!(deps(&y).is_empty());
        assert!(deps(&z).is_empty());
        assert!(b.control_dependencies(["missing"], |_| Ok(())).is_err());
    }

    #[test]
    fn devices_merge_and_colocation_wins() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let x = b
            .device("/job:ps/task:0", |b| b.device("/cpu:0", |b| b.scalar(1.0, DType::Float)))
            .unwrap();
        let placed = b.graph().get_node(&x.node).unwrap().device.clone();
        assert_eq!(placed, "/job:ps/task:0/device:CPU:0");
        let y = b
            .device("/gpu:0", |b| b.colocate_with(&x.node, |b| b.op("Neg").input(&x).finish_one()))
            .unwrap();
        let node = b.graph().get_node(&y.node).unwrap();
        assert_eq!(node.device, placed);
        assert_eq!(node.colocation, vec![x.node.clone()]);
        let cleared = b
            .device("/gpu:0", |b| b.device("", |b| b.scalar(0.0, DType::Float)))
            .unwrap();
        assert_eq!(b.graph().get_node(&cleared.node).unwrap().device, "");
    }

    #[test]
    fn function_bodies_order_stateful_ops() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::for_function(&rt);
        let v = b.get_variable(VariableRequest::new("counter").shape(&[])).unwrap();
        let v = v.as_single().unwrap().clone();
        let one = b.scalar(1.0, DType::Float).unwrap();
        let bump = b.assign_add_variable(&v, &one).unwrap();
        let read = b.read_variable(&v).unwrap();
        let deps: Vec<&str> = b.graph().get_node(&read.node).unwrap().control_inputs().collect();
        assert_eq!(deps, vec![bump.as_str()]);
        let f = b.into_function("f", vec![], &[read]).unwrap();
        assert_eq!(f.control_outputs, vec![bump.clone()]);
        let out = f.graph.get_node(&f.outputs[0].node).unwrap();
        assert_eq!(out.op, "Identity");
        assert_eq!(out.control_inputs().collect::<Vec<_>>(), vec![bump.as_str()]);
    }

    #[test]
    fn cond_builds_if_with_branch_functions() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let p = b.placeholder(DType::Bool, Shape::scalar(), Some("p")).unwrap();
        let x = b.placeholder(DType::Float, float(&[2]), Some("x")).unwrap();
        let out = b
            .cond(
                &p,
                &[x.clone()],
                |b, a| Ok(vec![b.op("Neg").input(&a[0]).finish_one()?]),
                |b, a| Ok(vec![b.identity(&a[0])?]),
            )
            .unwrap();
        let node = b.graph().get_node(&out[0].node).unwrap();
        assert_eq!(node.op, "If");
        let then = node.attr("then_branch").and_then(AttrValue::as_func).unwrap();
        assert!(b.graph().function(then).is_some());
        assert_eq!(b.graph().output(&out[0]).unwrap().shape, float(&[2]));

        let err = b
            .cond(
                &p,
                &[x.clone()],
                |b, a| Ok(vec![b.identity(&a[0])?]),
                |b, _| Ok(vec![b.scalar(1.0, DType::Int32)?]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::BranchMismatch { .. }));
    }

    #[test]
    fn calls_and_inlining() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let x = b.placeholder(DType::Float, float(&[2]), Some("x")).unwrap();
        let f = b
            .trace_function("double", &[x.clone()], |b, a| {
                Ok(vec![b.op("Add").input(&a[0]).input(&a[0]).finish_one()?])
            })
            .unwrap();
        let called = b.call_function(&f, &[x.clone()]).unwrap();
        assert_eq!(b.graph().get_node(&called[0].node).unwrap().op, "PartitionedCall");

        let inlined = b.inline_function(&f, &[x.clone()]).unwrap();
        let node = b.graph().get_node(&inlined[0].node).unwrap();
        assert_eq!(node.name, "double/Add");
        assert_eq!(node.data_inputs().cloned().collect::<Vec<_>>(), vec![x.clone(), x]);
    }
}
