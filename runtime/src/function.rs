// function.rs — Traced functions and their compiled graphs
//
// A `TracedFunction` wraps a host body that builds graph operations on
// symbolic tensors. Each call binds its arguments to the declared
// parameters, keys the bound arguments, and looks the key up in the trace
// cache; a miss traces the body into a `ConcreteFunction`. Eager calls then
// execute the compiled graph; calls made while building another graph emit
// a call node instead.
//
// Preconditions: the body only creates operations through the builder it is given.
// Postconditions: calls with equal keys share one `ConcreteFunction`; the
//                 device a call runs on never causes a retrace.
// Failure modes: `ArgumentBinding` for bad arguments; signature errors
//                (`KeywordParamsWithSignature`, `SignatureStructure`,
//                `NonTensorWithSignature`, `SignatureMismatch`);
//                `InputMutation` when the body restructures an argument.
// Side effects: tracing may create variables in the runtime's store.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::builder::GraphBuilder;
use crate::error::{Error, Result};
use crate::exec;
use crate::fingerprint::{CacheKey, ExecutionMode};
use crate::graph::{FunctionDef, TensorRef};
use crate::runtime::Runtime;
use crate::tensor::HostTensor;
use crate::trace_cache::TraceCache;
use crate::value::{SymbolicTensor, TensorSpec, Value};
use crate::variable_scope::VariableScope;

// ── Parameters ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Bound by position or by name.
    Positional,
    /// Collects surplus positional arguments into a tuple.
    VarPositional,
    /// Bound by name only.
    KeywordOnly,
    /// Collects unmatched keyword arguments into a dict.
    VarKeyword,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<Value>,
}

impl Param {
    pub fn positional(name: &str) -> Param {
        Param {
            name: name.to_string(),
            kind: ParamKind::Positional,
            default: None,
        }
    }

    pub fn keyword_only(name: &str) -> Param {
        Param {
            kind: ParamKind::KeywordOnly,
            ..Param::positional(name)
        }
    }

    pub fn var_positional(name: &str) -> Param {
        Param {
            kind: ParamKind::VarPositional,
            ..Param::positional(name)
        }
    }

    pub fn var_keyword(name: &str) -> Param {
        Param {
            kind: ParamKind::VarKeyword,
            ..Param::positional(name)
        }
    }

    pub fn default(mut self, value: impl Into<Value>) -> Param {
        self.default = Some(value.into());
        self
    }
}

/// Bind `args`/`kwargs` to `params`, one value per parameter: defaults
/// filled in, surplus positional arguments as a tuple, surplus keyword
/// arguments as a dict.
pub fn bind(function: &str, params: &[Param], args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Vec<Value>> {
    let fail = |message: String| Error::ArgumentBinding {
        function: function.to_string(),
        message,
    };
    let mut slots: Vec<Option<Value>> = vec![None; params.len()];
    let mut args = args.into_iter();

    for (i, p) in params.iter().enumerate() {
        match p.kind {
            ParamKind::Positional => match args.next() {
                Some(v) => slots[i] = Some(v),
                None => break,
            },
            ParamKind::VarPositional => {
                slots[i] = Some(Value::Tuple(args.by_ref().collect()));
                break;
            }
            ParamKind::KeywordOnly | ParamKind::VarKeyword => break,
        }
    }
    let surplus = args.count();
    if surplus > 0 {
        let accepted = params.iter().filter(|p| p.kind == ParamKind::Positional).count();
        return Err(fail(format!(
            "takes {} positional arguments but {} were given",
            accepted,
            accepted + surplus
        )));
    }

    let mut extra = BTreeMap::new();
    for (name, v) in kwargs {
        let target = params.iter().position(|p| {
            p.name == name && matches!(p.kind, ParamKind::Positional | ParamKind::KeywordOnly)
        });
        match target {
            Some(i) if slots[i].is_some() => {
                return Err(fail(format!("got multiple values for argument '{}'", name)));
            }
            Some(i) => slots[i] = Some(v),
            None if params.iter().any(|p| p.kind == ParamKind::VarKeyword) => {
                extra.insert(name, v);
            }
            None => return Err(fail(format!("got an unexpected keyword argument '{}'", name))),
        }
    }

    let mut bound = Vec::with_capacity(params.len());
    for (p, slot) in params.iter().zip(slots) {
        let v = match (slot, p.kind) {
            (Some(v), _) => v,
            (None, ParamKind::VarPositional) => Value::Tuple(Vec::new()),
            (None, ParamKind::VarKeyword) => Value::Dict(std::mem::take(&mut extra)),
            (None, _) => p
                .default
                .clone()
                .ok_or_else(|| fail(format!("missing required argument '{}'", p.name)))?,
        };
        bound.push(v);
    }
    Ok(bound)
}

// ── Concrete functions ──────────────────────────────────────────────────────

/// A compiled graph with the mapping from arguments to its inputs and from
/// its outputs to the structured result.
pub struct ConcreteFunction {
    pub key: CacheKey,
    pub fdef: Arc<FunctionDef>,
    /// Specs of the tensor arguments, in input order.
    pub inputs: Vec<TensorSpec>,
    /// The body's result; symbolic leaves stand for outputs in order.
    pub structured_outputs: Value,
}

impl ConcreteFunction {
    pub fn name(&self) -> &str {
        &self.fdef.name
    }

    /// Execute with one tensor per input.
    pub fn call(&self, rt: &Runtime, tensors: &[HostTensor], device: &str) -> Result<Value> {
        if tensors.len() != self.inputs.len() {
            return Err(Error::ArgumentBinding {
                function: self.name().to_string(),
                message: format!("expected {} tensors, got {}", self.inputs.len(), tensors.len()),
            });
        }
        let results = exec::run_function(rt, &self.fdef, tensors, device)?;
        let mut results = results.into_iter();
        Ok(self.structured_outputs.map_leaves(&mut |leaf| match leaf {
            Value::Symbolic(_) => results.next().map(Value::tensor).unwrap_or(Value::None),
            other => other.clone(),
        }))
    }
}

impl fmt::Debug for ConcreteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcreteFunction")
            .field("name", &self.fdef.name)
            .field("key", &self.key.to_string())
            .field("nodes", &self.fdef.graph.len())
            .finish()
    }
}

// ── Traced functions ────────────────────────────────────────────────────────

/// The traced body: receives the builder and one value per parameter, with
/// tensor leaves replaced by symbolic tensors.
pub type Body = Arc<dyn Fn(&mut GraphBuilder<'_>, &mut [Value]) -> Result<Value> + Send + Sync>;

pub struct TracedFunction {
    name: String,
    params: Vec<Param>,
    signature: Option<Vec<Value>>,
    body: Body,
    cache: TraceCache<ConcreteFunction>,
    /// Id of the runtime whose store holds this function's variables.
    owner: OnceLock<u64>,
}

impl TracedFunction {
    pub fn new<F>(name: &str, params: Vec<Param>, body: F) -> TracedFunction
    where
        F: Fn(&mut GraphBuilder<'_>, &mut [Value]) -> Result<Value> + Send + Sync + 'static,
    {
        TracedFunction {
            name: name.to_string(),
            params,
            signature: None,
            body: Arc::new(body),
            cache: TraceCache::new(),
            owner: OnceLock::new(),
        }
    }

    /// A function traced once, for arguments matching `signature` (one
    /// structure of `TensorSpec` leaves per parameter).
    pub fn with_input_signature<F>(name: &str, params: Vec<Param>, signature: Vec<Value>, body: F) -> Result<TracedFunction>
    where
        F: Fn(&mut GraphBuilder<'_>, &mut [Value]) -> Result<Value> + Send + Sync + 'static,
    {
        if params.iter().any(|p| p.kind != ParamKind::Positional) {
            return Err(Error::KeywordParamsWithSignature {
                function: name.to_string(),
            });
        }
        if let Some(p) = params.iter().find(|p| p.default.is_some()) {
            return Err(Error::DefaultWithSignature {
                function: name.to_string(),
                param: p.name.clone(),
            });
        }
        if signature.len() != params.len() {
            return Err(Error::SignatureStructure {
                function: name.to_string(),
                expected: params.len(),
                actual: signature.len(),
            });
        }
        if let Some(bad) = signature.iter().flat_map(Value::flatten).find(|l| !matches!(l, Value::Spec(_))) {
            return Err(Error::SignatureMismatch {
                function: name.to_string(),
                message: format!("input signature leaf {} is not a TensorSpec", bad),
            });
        }
        let mut f = TracedFunction::new(name, params, body);
        f.signature = Some(signature);
        Ok(f)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Completed traces.
    pub fn trace_count(&self) -> usize {
        self.cache.trace_count()
    }

    pub fn concrete_functions(&self) -> Vec<Arc<ConcreteFunction>> {
        self.cache.values()
    }

    /// Call eagerly on the runtime's default device.
    pub fn call(&self, rt: &Runtime, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
        self.call_on_device(rt, &rt.config().default_device, args, kwargs)
    }

    /// Call eagerly, executing on `device`.
    pub fn call_on_device(
        &self,
        rt: &Runtime,
        device: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value> {
        let bound = bind(&self.name, &self.params, args, kwargs)?;
        let concrete = self.concrete_for(rt, &bound, ExecutionMode::Eager, None)?;
        let mut tensors = Vec::with_capacity(concrete.inputs.len());
        for leaf in bound.iter().flat_map(Value::flatten) {
            match leaf {
                Value::Tensor(t) => tensors.push(t.value.clone()),
                Value::Symbolic(_) | Value::Spec(_) => {
                    return Err(Error::ArgumentBinding {
                        function: self.name.clone(),
                        message: format!("cannot execute with symbolic argument {}", leaf),
                    })
                }
                _ => {}
            }
        }
        concrete.call(rt, &tensors, device)
    }

    /// Call while building another graph: emits a call node in `b` and
    /// returns the result with symbolic tensors of `b`'s graph.
    pub fn call_in(&self, b: &mut GraphBuilder<'_>, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
        let bound = bind(&self.name, &self.params, args, kwargs)?;
        let scope = b.current_variable_scope().clone();
        let concrete = self.concrete_for(b.runtime(), &bound, ExecutionMode::Graph, Some(scope))?;
        let mut tensors = Vec::with_capacity(concrete.inputs.len());
        for leaf in bound.iter().flat_map(Value::flatten) {
            match leaf {
                Value::Symbolic(s) => tensors.push(s.tensor.clone()),
                Value::Tensor(t) => tensors.push(b.constant(t.value.clone(), None)?),
                Value::Spec(_) => {
                    return Err(Error::ArgumentBinding {
                        function: self.name.clone(),
                        message: format!("cannot call with TensorSpec argument {}", leaf),
                    })
                }
                _ => {}
            }
        }
        let outputs = b.call_function(&concrete.fdef, &tensors)?;
        let mut outputs = outputs.into_iter();
        concrete.structured_outputs.try_map_leaves(&mut |leaf| match leaf {
            Value::Symbolic(_) => {
                let t = outputs
                    .next()
                    .ok_or_else(|| Error::exec(&concrete.fdef.name, "call returned fewer outputs than traced"))?;
                b.symbolic(&t)
            }
            other => Ok(other.clone()),
        })
    }

    /// The compiled graph for these arguments, tracing it when needed.
    pub fn get_concrete_function(
        &self,
        rt: &Runtime,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Arc<ConcreteFunction>> {
        let bound = bind(&self.name, &self.params, args, kwargs)?;
        self.concrete_for(rt, &bound, ExecutionMode::Eager, None)
    }

    fn concrete_for(
        &self,
        rt: &Runtime,
        bound: &[Value],
        mode: ExecutionMode,
        scope: Option<VariableScope>,
    ) -> Result<Arc<ConcreteFunction>> {
        if *self.owner.get_or_init(|| rt.id()) != rt.id() {
            return Err(Error::invalid(format!(
                "'{}' was traced with a different runtime",
                self.name
            )));
        }
        let (key, specs) = match &self.signature {
            Some(signature) => {
                self.check_signature(signature, bound)?;
                let key = CacheKey::new(signature, ExecutionMode::Eager);
                let specs = signature
                    .iter()
                    .flat_map(Value::flatten)
                    .filter_map(|l| match l {
                        Value::Spec(s) => Some(s.clone()),
                        _ => None,
                    })
                    .collect();
                (key, Some(specs))
            }
            None => (CacheKey::new(bound, mode), None),
        };
        self.cache
            .get_or_trace(&key, || self.trace(rt, &key, bound, specs, scope))
    }

    fn check_signature(&self, signature: &[Value], bound: &[Value]) -> Result<()> {
        for ((sig, arg), param) in signature.iter().zip(bound).zip(&self.params) {
            if !sig.same_structure(arg) {
                return Err(Error::SignatureStructure {
                    function: self.name.clone(),
                    expected: sig.flatten().len(),
                    actual: arg.flatten().len(),
                });
            }
            for (spec, leaf) in sig.flatten().into_iter().zip(arg.flatten()) {
                let Some((dtype, shape)) = leaf.tensor_type() else {
                    return Err(Error::NonTensorWithSignature {
                        function: self.name.clone(),
                        param: param.name.clone(),
                    });
                };
                if let Value::Spec(spec) = spec {
                    if !spec.is_compatible_with(dtype, &shape) {
                        return Err(Error::SignatureMismatch {
                            function: self.name.clone(),
                            message: format!(
                                "argument '{}' is {}{}, expected {}{}",
                                param.name, dtype, shape, spec.dtype, spec.shape
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(function = %self.name, key = %key.digest()))]
    fn trace(
        &self,
        rt: &Runtime,
        key: &CacheKey,
        bound: &[Value],
        specs: Option<Vec<TensorSpec>>,
        scope: Option<VariableScope>,
    ) -> Result<ConcreteFunction> {
        let mut b = GraphBuilder::for_function(rt);
        if let Some(scope) = scope {
            b.set_variable_scope(scope);
        }
        let mut inputs: Vec<TensorRef> = Vec::new();
        let mut input_specs: Vec<TensorSpec> = Vec::new();
        let mut args = Vec::with_capacity(bound.len());
        for (arg, param) in bound.iter().zip(&self.params) {
            let leaves = arg.flatten().iter().filter(|l| l.is_tensor_like()).count();
            let mut j = 0;
            let symbolic = arg.try_map_leaves(&mut |leaf| {
                let Some((dtype, shape)) = leaf.tensor_type() else {
                    return Ok(leaf.clone());
                };
                let spec = match &specs {
                    Some(specs) => specs.get(inputs.len()).cloned().ok_or_else(|| Error::SignatureStructure {
                        function: self.name.clone(),
                        expected: specs.len(),
                        actual: inputs.len() + 1,
                    })?,
                    None => TensorSpec::new(dtype, shape),
                };
                let name = match (&spec.name, leaves) {
                    (Some(n), _) => n.clone(),
                    (None, 1) => param.name.clone(),
                    (None, _) => format!("{}_{}", param.name, j),
                };
                j += 1;
                let t = b.placeholder(spec.dtype, spec.shape.clone(), Some(&name))?;
                inputs.push(t.clone());
                input_specs.push(spec.clone());
                Ok::<Value, Error>(Value::Symbolic(SymbolicTensor {
                    tensor: t,
                    dtype: spec.dtype,
                    shape: spec.shape,
                }))
            })?;
            args.push(symbolic);
        }

        let before = args.clone();
        let result = (self.body)(&mut b, &mut args)?;
        for (old, new) in before.iter().zip(&args) {
            if let Some(container) = old.first_structure_change(new) {
                return Err(Error::InputMutation {
                    function: self.name.clone(),
                    container,
                });
            }
        }

        let mut outputs = Vec::new();
        let structured_outputs = result.try_map_leaves(&mut |leaf| match leaf {
            Value::Symbolic(s) => {
                b.graph().output(&s.tensor)?;
                outputs.push(s.tensor.clone());
                Ok(leaf.clone())
            }
            Value::Tensor(t) => {
                let c = b.constant(t.value.clone(), None)?;
                outputs.push(c.clone());
                Ok(Value::Symbolic(SymbolicTensor {
                    tensor: c,
                    dtype: t.value.dtype,
                    shape: t.value.static_shape(),
                }))
            }
            other => Ok::<Value, Error>(other.clone()),
        })?;

        let fname = format!("__inference_{}_{}", self.name, rt.next_function_id());
        let fdef = b.into_function(&fname, inputs, &outputs)?;
        tracing::debug!(function = %fname, nodes = fdef.graph.len(), "traced");
        Ok(ConcreteFunction {
            key: key.clone(),
            fdef,
            inputs: input_specs,
            structured_outputs,
        })
    }
}

impl fmt::Debug for TracedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("has_signature", &self.signature.is_some())
            .field("traces", &self.trace_count())
            .finish()
    }
}
