// kernels.rs — Reference CPU kernels and selective registration
//
// Each op the executor can run has one kernel, registered under the op name
// together with its implementation signature (`BinaryOp<CPUDevice,
// functor::add<{T}>>`). `{attr}` placeholders in a signature are filled with
// the element type named by that type attr of the node, which yields one
// signature per dtype instantiation.
//
// Preconditions: kernels receive inputs already checked against the op's
//                declared types by graph construction or import.
// Postconditions: outputs match the op's declared output count.
// Failure modes: `Error::Execution` naming the node for unfed placeholders,
//                incompatible operand shapes, uninitialized variables.
// Side effects: resource kernels read and write locked variable cells;
//               `Print` logs through `tracing`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::attr::AttrValue;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::exec;
use crate::graph::{Graph, Node};
use crate::graph_def::{GraphDef, NodeDef};
use crate::resource::LockedResources;
use crate::runtime::Runtime;
use crate::tensor::HostTensor;

/// Ops always kept by selective registration unless overridden.
pub const DEFAULT_OPS: &str = "NoOp:NoOp,_Recv:RecvOp,_Send:SendOp";

// ── Kernel interface ────────────────────────────────────────────────────────

pub struct KernelContext<'a, 'r> {
    pub rt: &'a Runtime,
    pub node: &'a Node,
    pub inputs: Vec<HostTensor>,
    /// Graph whose function library resolves `func` attrs.
    pub library: &'a Graph,
    pub resources: &'a mut LockedResources<'r>,
    pub device: &'a str,
    pub(crate) depth: usize,
}

impl KernelContext<'_, '_> {
    fn fail(&self, message: impl Into<String>) -> Error {
        Error::exec(&self.node.name, message)
    }

    pub fn input(&self, i: usize) -> Result<&HostTensor> {
        self.inputs
            .get(i)
            .ok_or_else(|| self.fail(format!("missing input {}", i)))
    }

    pub fn attr(&self, name: &str) -> Result<&AttrValue> {
        self.node.attr(name).ok_or_else(|| Error::MissingAttr {
            node: self.node.name.clone(),
            attr: name.to_string(),
        })
    }

    fn numbers(&self, i: usize) -> Result<Vec<f64>> {
        self.input(i)?
            .to_f64()
            .ok_or_else(|| self.fail(format!("input {} is not numeric", i)))
    }

    fn resource(&self, i: usize) -> Result<String> {
        let t = self.input(i)?;
        t.resource_name()
            .map(str::to_string)
            .ok_or_else(|| self.fail(format!("input {} is not a resource handle", i)))
    }

    /// Run function `name` of the library on `args` within this run.
    pub fn call_function(&mut self, name: &str, args: Vec<HostTensor>) -> Result<Vec<HostTensor>> {
        let f = self
            .library
            .function(name)
            .ok_or_else(|| Error::not_found("function", name))?
            .clone();
        exec::execute_function(self.rt, self.library, &f, args, self.resources, self.device, self.depth + 1)
    }
}

pub trait Kernel: Send + Sync {
    fn compute(&self, ctx: &mut KernelContext<'_, '_>) -> Result<Vec<HostTensor>>;
}

impl<F> Kernel for F
where
    F: Fn(&mut KernelContext<'_, '_>) -> Result<Vec<HostTensor>> + Send + Sync,
{
    fn compute(&self, ctx: &mut KernelContext<'_, '_>) -> Result<Vec<HostTensor>> {
        self(ctx)
    }
}

struct KernelDef {
    class: String,
    kernel: Arc<dyn Kernel>,
}

#[derive(Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, KernelDef>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the kernel of `op`, replacing any earlier one.
    pub fn register_kernel(&mut self, op: &str, class: &str, kernel: Arc<dyn Kernel>) {
        self.kernels.insert(
            op.to_string(),
            KernelDef {
                class: class.to_string(),
                kernel,
            },
        );
    }

    pub fn register<F>(&mut self, op: &str, class: &str, f: F)
    where
        F: Fn(&mut KernelContext<'_, '_>) -> Result<Vec<HostTensor>> + Send + Sync + 'static,
    {
        self.register_kernel(op, class, Arc::new(f));
    }

    pub fn get(&self, op: &str) -> Option<Arc<dyn Kernel>> {
        self.kernels.get(op).map(|k| k.kernel.clone())
    }

    pub fn contains(&self, op: &str) -> bool {
        self.kernels.contains_key(op)
    }

    /// Implementation signature of the kernel running `op` with `attrs`.
    pub fn class_for(&self, op: &str, attrs: &BTreeMap<String, AttrValue>) -> Option<String> {
        let template = &self.kernels.get(op)?.class;
        let mut out = String::with_capacity(template.len());
        let mut rest = template.as_str();
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            out.push_str(&rest[..start]);
            let attr = &rest[start + 1..start + len];
            match attrs.get(attr).and_then(AttrValue::as_type) {
                Some(t) => out.push_str(c_type_name(t)),
                None => out.push_str(attr),
            }
            rest = &rest[start + len + 1..];
        }
        out.push_str(rest);
        Some(out)
    }

    /// Every registered op with its uninstantiated signature, sorted.
    pub fn classes(&self) -> Vec<(String, String)> {
        let mut all: Vec<(String, String)> = self
            .kernels
            .iter()
            .map(|(op, k)| (op.clone(), k.class.clone()))
            .collect();
        all.sort();
        all
    }

    pub fn with_builtin_kernels() -> Self {
        let mut r = KernelRegistry::new();
        r.register("NoOp", "NoOp", |_| Ok(Vec::new()));
        r.register("Const", "ConstantOp", const_kernel);
        r.register("Placeholder", "PlaceholderOp", |ctx| {
            Err(ctx.fail(format!(
                "You must feed a value for placeholder tensor '{}'",
                ctx.node.name
            )))
        });
        r.register("Identity", "IdentityOp", |ctx| {
            Ok(vec![ctx.input(0)?.clone()])
        });
        r.register("Add", "BinaryOp<CPUDevice, functor::add<{T}>>", |ctx| {
            binary(ctx, |a, b| a + b, None)
        });
        r.register("Sub", "BinaryOp<CPUDevice, functor::sub<{T}>>", |ctx| {
            binary(ctx, |a, b| a - b, None)
        });
        r.register("Mul", "BinaryOp<CPUDevice, functor::mul<{T}>>", |ctx| {
            binary(ctx, |a, b| a * b, None)
        });
        r.register(
            "Greater",
            "BinaryOp<CPUDevice, functor::greater<{T}>>",
            |ctx| binary(ctx, |a, b| if a > b { 1.0 } else { 0.0 }, Some(DType::Bool)),
        );
        r.register("AddN", "AddNOp<CPUDevice, {T}>", add_n);
        r.register("Neg", "UnaryOp<CPUDevice, functor::neg<{T}>>", |ctx| {
            unary(ctx, |x| -x)
        });
        r.register("Abs", "UnaryOp<CPUDevice, functor::abs<{T}>>", |ctx| {
            unary(ctx, f64::abs)
        });
        r.register("Square", "UnaryOp<CPUDevice, functor::square<{T}>>", |ctx| {
            unary(ctx, |x| x * x)
        });
        r.register("Cast", "CastOpCPU", cast);
        r.register(
            "Sum",
            "ReductionOp<CPUDevice, {T}, Eigen::internal::SumReducer<{T}>>",
            |ctx| reduce(ctx, |v| v.iter().sum()),
        );
        r.register("L2Loss", "L2LossOp<CPUDevice, {T}>", |ctx| {
            reduce(ctx, |v| v.iter().map(|x| x * x).sum::<f64>() / 2.0)
        });
        r.register("VarHandleOp", "VarHandleOp", var_handle);
        r.register("ReadVariableOp", "ReadVariableOp", |ctx| {
            let name = ctx.resource(0)?;
            Ok(vec![ctx.resources.read(&name)?])
        });
        r.register("AssignVariableOp", "AssignVariableOp<CPUDevice, {dtype}>", |ctx| {
            assign(ctx, false)
        });
        r.register(
            "AssignAddVariableOp",
            "AssignUpdateVariableOp<CPUDevice, {dtype}, ADD>",
            |ctx| assign(ctx, true),
        );
        r.register("Print", "PrintOp", |ctx| {
            let t = ctx.input(0)?.clone();
            let message = ctx.node.attr("message").and_then(AttrValue::as_str).unwrap_or_default();
            tracing::info!(node = %ctx.node.name, values = ?t.data, "{}", message);
            Ok(vec![t])
        });
        r.register("If", "IfOp", if_kernel);
        r.register("PartitionedCall", "PartitionedCallOp", call);
        r.register("StatefulPartitionedCall", "PartitionedCallOp", call);
        r
    }
}

/// Element type name used in kernel signatures.
fn c_type_name(t: DType) -> &'static str {
    match t {
        DType::Half => "Eigen::half",
        DType::Float => "float",
        DType::Double => "double",
        DType::Bool => "bool",
        DType::String => "tstring",
        DType::Resource => "ResourceHandle",
        other => other.name(),
    }
}

// ── Builtin kernels ─────────────────────────────────────────────────────────

fn const_kernel(ctx: &mut KernelContext<'_, '_>) -> Result<Vec<HostTensor>> {
    let value = ctx
        .attr("value")?
        .as_tensor()
        .ok_or_else(|| ctx.fail("attr 'value' is not a tensor"))?;
    Ok(vec![value.clone()])
}

fn binary(ctx: &mut KernelContext<'_, '_>, f: impl Fn(f64, f64) -> f64, out: Option<DType>) -> Result<Vec<HostTensor>> {
    let (x, y) = (ctx.input(0)?, ctx.input(1)?);
    let (a, b) = (ctx.numbers(0)?, ctx.numbers(1)?);
    let (shape, values): (Vec<i64>, Vec<f64>) = if x.shape == y.shape {
        (x.shape.clone(), a.iter().zip(&b).map(|(p, q)| f(*p, *q)).collect())
    } else if b.len() == 1 {
        (x.shape.clone(), a.iter().map(|p| f(*p, b[0])).collect())
    } else if a.len() == 1 {
        (y.shape.clone(), b.iter().map(|q| f(a[0], *q)).collect())
    } else {
        return Err(ctx.fail(format!(
            "incompatible shapes: {:?} vs. {:?}",
            x.shape, y.shape
        )));
    };
    let template = match out {
        Some(dtype) => HostTensor::zeros(dtype, &[])?,
        None => x.clone(),
    };
    Ok(vec![template.with_f64(shape, values)?])
}

fn unary(ctx: &mut KernelContext<'_, '_>, f: impl Fn(f64) -> f64) -> Result<Vec<HostTensor>> {
    let x = ctx.input(0)?;
    let values = ctx.numbers(0)?.into_iter().map(f).collect();
    Ok(vec![x.with_f64(x.shape.clone(), values)?])
}

fn reduce(ctx: &mut KernelContext<'_, '_>, f: impl Fn(&[f64]) -> f64) -> Result<Vec<HostTensor>> {
    let x = ctx.input(0)?;
    let values = ctx.numbers(0)?;
    Ok(vec![x.with_f64(Vec::new(), vec![f(&values)])?])
}

fn add_n(ctx: &mut KernelContext<'_, '_>) -> Result<Vec<HostTensor>> {
    let first = ctx.input(0)?.clone();
    let mut acc = ctx.numbers(0)?;
    for i in 1..ctx.inputs.len() {
        if ctx.inputs[i].shape != first.shape {
            return Err(ctx.fail(format!(
                "inputs must have the same shape: {:?} vs. {:?}",
                first.shape, ctx.inputs[i].shape
            )));
        }
        for (a, b) in acc.iter_mut().zip(ctx.numbers(i)?) {
            *a += b;
        }
    }
    Ok(vec![first.with_f64(first.shape.clone(), acc)?])
}

fn cast(ctx: &mut KernelContext<'_, '_>) -> Result<Vec<HostTensor>> {
    let dst = ctx
        .attr("DstT")?
        .as_type()
        .ok_or_else(|| ctx.fail("attr 'DstT' is not a type"))?;
    let x = ctx.input(0)?;
    let values = ctx.numbers(0)?;
    let values = if dst.is_integer() || dst.is_unsigned() {
        values.into_iter().map(f64::trunc).collect()
    } else {
        values
    };
    Ok(vec![HostTensor::zeros(dst, &[])?.with_f64(x.shape.clone(), values)?])
}

fn var_handle(ctx: &mut KernelContext<'_, '_>) -> Result<Vec<HostTensor>> {
    Ok(vec![HostTensor::resource(&resource_key(ctx.node))])
}

/// Name of the resource a `VarHandleOp` node refers to.
pub fn resource_key(node: &Node) -> String {
    match node.attr("shared_name").and_then(AttrValue::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => node.name.clone(),
    }
}

fn assign(ctx: &mut KernelContext<'_, '_>, add: bool) -> Result<Vec<HostTensor>> {
    let name = ctx.resource(0)?;
    let value = ctx.input(1)?.clone();
    let node = ctx.node.name.clone();
    let cell = ctx.resources.get_mut(&name)?;
    let next = match (add, cell.as_ref()) {
        (false, Some(old)) if old.dtype != value.dtype => {
            return Err(Error::exec(
                node,
                format!(
                    "trying to assign variable with wrong dtype. Expected {} got {}",
                    old.dtype, value.dtype
                ),
            ))
        }
        (false, _) => value,
        (true, None) => return Err(Error::exec(node, "attempting to use an uninitialized variable")),
        (true, Some(old)) => {
            if old.shape != value.shape && value.num_elements() != 1 {
                return Err(Error::exec(
                    node,
                    format!("cannot add {:?} to a variable of shape {:?}", value.shape, old.shape),
                ));
            }
            let (a, b) = match (old.to_f64(), value.to_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(Error::exec(node, "variable is not numeric")),
            };
            let sum = a
                .iter()
                .enumerate()
                .map(|(i, x)| x + if b.len() == 1 { b[0] } else { b[i] })
                .collect();
            old.with_f64(old.shape.clone(), sum)?
        }
    };
    *cell = Some(next);
    Ok(Vec::new())
}

fn if_kernel(ctx: &mut KernelContext<'_, '_>) -> Result<Vec<HostTensor>> {
    let pred = ctx
        .input(0)?
        .scalar_truth()
        .ok_or_else(|| ctx.fail("the predicate of If must be a scalar"))?;
    let branch = if pred { "then_branch" } else { "else_branch" };
    let f = ctx
        .attr(branch)?
        .as_func()
        .ok_or_else(|| ctx.fail(format!("attr '{}' is not a function", branch)))?
        .to_string();
    let args = ctx.inputs[1..].to_vec();
    ctx.call_function(&f, args)
}

fn call(ctx: &mut KernelContext<'_, '_>) -> Result<Vec<HostTensor>> {
    let f = ctx
        .attr("f")?
        .as_func()
        .ok_or_else(|| ctx.fail("attr 'f' is not a function"))?
        .to_string();
    let args = std::mem::take(&mut ctx.inputs);
    ctx.call_function(&f, args)
}

// ── Selective registration ──────────────────────────────────────────────────

/// Sorted, de-duplicated `(op, kernel signature)` pairs needed to run
/// `graphs`, plus `default_ops` (`op:signature,...`; `all` keeps every
/// registered kernel). Ops without a kernel are skipped with a warning.
pub fn ops_and_kernels(graphs: &[GraphDef], kernels: &KernelRegistry, default_ops: &str) -> Result<Vec<(String, String)>> {
    let mut pairs: BTreeSet<(String, String)> = BTreeSet::new();
    let mut visit = |node: &NodeDef| match kernels.class_for(&node.op, &node.attr) {
        Some(class) => {
            pairs.insert((node.op.clone(), class));
        }
        None => tracing::warn!(op = %node.op, node = %node.name, "no kernel registered"),
    };
    for g in graphs {
        g.node.iter().for_each(&mut visit);
        g.library.iter().flat_map(|f| &f.node).for_each(&mut visit);
    }

    if default_ops == "all" {
        pairs.extend(kernels.classes());
    } else {
        for entry in default_ops.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (op, class) = entry.split_once(':').ok_or_else(|| {
                Error::invalid(format!("default op '{}' is not of the form op:kernel", entry))
            })?;
            pairs.insert((op.to_string(), class.to_string()));
        }
    }
    Ok(pairs.into_iter().collect())
}
