// exec.rs — Reference executor for graphs and function bodies
//
// A run prunes the graph to what its fetches and targets need, orders the
// remaining nodes topologically, locks every variable cell the run or any
// function in the graph's library may touch (in sorted name order), and
// evaluates one kernel per node. Function calls and `If` branches execute
// inside the same run and under the same locks.
//
// Preconditions: feeds name existing output slots.
// Postconditions: results are returned in fetch order; variable cells hold
//                 the values written by the run.
// Failure modes: `Error::Execution` from kernels; `Cycle` for cyclic graphs;
//                `InvalidArgument` for ill-typed feeds; `NotFound` for
//                unknown fetches and targets.
// Side effects: writes variable cells of the runtime's resource manager.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::control_deps::MAX_CALL_DEPTH;
use crate::error::{Error, Result};
use crate::graph::{FunctionDef, Graph, Input, NodeId, TensorRef};
use crate::kernels::{resource_key, KernelContext};
use crate::resource::LockedResources;
use crate::runtime::Runtime;
use crate::tensor::HostTensor;

/// Evaluate `fetches` of `graph`, also running the nodes named in `targets`.
/// Nodes without a device run on `device`.
#[tracing::instrument(skip_all, fields(nodes = graph.len(), fetches = fetches.len(), device = %device))]
pub fn run(
    rt: &Runtime,
    graph: &Graph,
    feeds: &[(TensorRef, HostTensor)],
    fetches: &[TensorRef],
    targets: &[&str],
    device: &str,
) -> Result<Vec<HostTensor>> {
    let feeds = check_feeds(graph, feeds)?;
    let needed = prune(graph, &feeds, fetches, targets)?;

    let mut names = BTreeSet::new();
    collect_resources(graph, &needed, &mut names);
    names.extend(
        feeds
            .values()
            .filter_map(|t| t.resource_name().map(str::to_string)),
    );
    let cells = rt.resources().cells(&names);
    let mut locked = LockedResources::lock(&cells);
    tracing::debug!(nodes = needed.len(), resources = names.len(), "executing");
    execute(rt, graph, graph, feeds, fetches, targets, device, &mut locked, 0)
}

/// Run a function body on `args`, returning its outputs.
pub fn run_function(rt: &Runtime, f: &FunctionDef, args: &[HostTensor], device: &str) -> Result<Vec<HostTensor>> {
    check_arity(f, args.len())?;
    let feeds: Vec<(TensorRef, HostTensor)> = f.inputs.iter().cloned().zip(args.iter().cloned()).collect();
    let targets: Vec<&str> = f.control_outputs.iter().map(String::as_str).collect();
    run(rt, &f.graph, &feeds, &f.outputs, &targets, device)
}

/// Run a function body within an ongoing run, under its locks.
pub(crate) fn execute_function(
    rt: &Runtime,
    library: &Graph,
    f: &FunctionDef,
    args: Vec<HostTensor>,
    resources: &mut LockedResources<'_>,
    device: &str,
    depth: usize,
) -> Result<Vec<HostTensor>> {
    if depth >= MAX_CALL_DEPTH {
        return Err(Error::exec(
            &f.name,
            format!("function calls nested deeper than {}", MAX_CALL_DEPTH),
        ));
    }
    check_arity(f, args.len())?;
    let feeds: HashMap<TensorRef, HostTensor> = f.inputs.iter().cloned().zip(args).collect();
    let targets: Vec<&str> = f.control_outputs.iter().map(String::as_str).collect();
    let library = if f.graph.functions().next().is_some() {
        &f.graph
    } else {
        library
    };
    execute(rt, &f.graph, library, feeds, &f.outputs, &targets, device, resources, depth)
}

fn check_arity(f: &FunctionDef, given: usize) -> Result<()> {
    if given != f.inputs.len() {
        return Err(Error::exec(
            &f.name,
            format!("function takes {} arguments, {} given", f.inputs.len(), given),
        ));
    }
    Ok(())
}

fn check_feeds(graph: &Graph, feeds: &[(TensorRef, HostTensor)]) -> Result<HashMap<TensorRef, HostTensor>> {
    let mut out = HashMap::with_capacity(feeds.len());
    for (t, value) in feeds {
        let slot = graph.output(t)?;
        if slot.dtype != value.dtype {
            return Err(Error::invalid(format!(
                "cannot feed a {} value to tensor '{}' of type {}",
                value.dtype, t, slot.dtype
            )));
        }
        if !slot.shape.is_compatible_with(&value.static_shape()) {
            return Err(Error::invalid(format!(
                "cannot feed a value of shape {} to tensor '{}' of shape {}",
                value.static_shape(),
                t,
                slot.shape
            )));
        }
        out.insert(t.clone(), value.clone());
    }
    Ok(out)
}

/// Nodes reachable backwards from the fetches and targets, not crossing fed edges.
fn prune(
    graph: &Graph,
    feeds: &HashMap<TensorRef, HostTensor>,
    fetches: &[TensorRef],
    targets: &[&str],
) -> Result<Vec<NodeId>> {
    let mut stack = Vec::new();
    for t in fetches {
        graph.output(t)?;
        if !feeds.contains_key(t) {
            stack.extend(graph.node_id(&t.node));
        }
    }
    for name in targets {
        stack.push(graph.node_id(name).ok_or_else(|| Error::not_found("node", *name))?);
    }
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let node = graph.node_at(id);
        for input in &node.inputs {
            if let Input::Data(t) = input {
                if feeds.contains_key(t) {
                    continue;
                }
            }
            let src = graph.node_id(input.node_name()).ok_or_else(|| Error::MissingInput {
                node: node.name.clone(),
                input: input.to_input_string(),
            })?;
            stack.push(src);
        }
    }
    let mut ids: Vec<NodeId> = seen.into_iter().collect();
    ids.sort();
    Ok(ids)
}

fn collect_resources(graph: &Graph, needed: &[NodeId], names: &mut BTreeSet<String>) {
    let top = needed.iter().map(|id| graph.node_at(*id));
    let library = graph.functions().flat_map(|f| f.graph.nodes());
    for node in top.chain(library) {
        if node.op == "VarHandleOp" {
            names.insert(resource_key(node));
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn execute(
    rt: &Runtime,
    graph: &Graph,
    library: &Graph,
    feeds: HashMap<TensorRef, HostTensor>,
    fetches: &[TensorRef],
    targets: &[&str],
    device: &str,
    resources: &mut LockedResources<'_>,
    depth: usize,
) -> Result<Vec<HostTensor>> {
    let needed = prune(graph, &feeds, fetches, targets)?;
    let order = graph.topological_order(&needed)?;
    let mut values: HashMap<TensorRef, HostTensor> = HashMap::new();

    for id in order {
        let node = graph.node_at(id);
        let fed = !node.outputs.is_empty()
            && (0..node.outputs.len()).all(|i| feeds.contains_key(&TensorRef::new(&node.name, i)));
        if fed {
            continue;
        }
        let inputs = node
            .data_inputs()
            .map(|t| {
                feeds
                    .get(t)
                    .or_else(|| values.get(t))
                    .cloned()
                    .ok_or_else(|| Error::exec(&node.name, format!("input {} was not computed", t)))
            })
            .collect::<Result<Vec<_>>>()?;
        let kernel = rt.kernels().get(&node.op).ok_or_else(|| {
            Error::exec(&node.name, format!("no kernel registered for op '{}'", node.op))
        })?;
        let node_device = if node.device.is_empty() { device } else { node.device.as_str() };
        let mut ctx = KernelContext {
            rt,
            node,
            inputs,
            library,
            resources: &mut *resources,
            device: node_device,
            depth,
        };
        let outputs = kernel.compute(&mut ctx)?;
        if outputs.len() != node.outputs.len() {
            return Err(Error::exec(
                &node.name,
                format!("kernel produced {} outputs, op declares {}", outputs.len(), node.outputs.len()),
            ));
        }
        tracing::trace!(node = %node.name, op = %node.op, "computed");
        for (i, t) in outputs.into_iter().enumerate() {
            values.insert(TensorRef::new(&node.name, i), t);
        }
    }

    fetches
        .iter()
        .map(|t| {
            feeds
                .get(t)
                .or_else(|| values.get(t))
                .cloned()
                .ok_or_else(|| Error::exec(&t.node, format!("fetch {} was not computed", t)))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::dtype::DType;
    use crate::shape::Shape;
    use crate::tensor::TensorData;
    use crate::init::Initializer;
    use crate::variable::VariableRequest;

    /// Run a single `op` node on `inputs`.
    pub(crate) fn run_op(op: &str, inputs: Vec<HostTensor>) -> Result<Vec<HostTensor>> {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let mut feeds = Vec::new();
        for (i, t) in inputs.into_iter().enumerate() {
            let p = b.placeholder(t.dtype, Shape::unknown(), Some(&format!("in{}", i)))?;
            feeds.push((p, t));
        }
        let args: Vec<TensorRef> = feeds.iter().map(|(p, _)| p.clone()).collect();
        let out = b.op(op).inputs(&args).finish()?;
        run(&rt, b.graph(), &feeds, &out, &[], "")
    }

    #[test]
    fn feeds_cut_their_producers() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let x = b.placeholder(DType::Float, Shape::scalar(), Some("x")).unwrap();
        let y = b.op("Square").input(&x).finish_one().unwrap();
        let err = run(&rt, b.graph(), &[], &[y.clone()], &[], "").unwrap_err();
        assert!(err.to_string().contains("must feed a value for placeholder tensor 'x'"));
        let out = run(&rt, b.graph(), &[(x, HostTensor::scalar_f32(3.0))], &[y.clone()], &[], "").unwrap();
        assert_eq!(out[0].data, TensorData::Float(vec![9.0]));
        // Feeding an intermediate tensor skips everything above it.
        let out = run(&rt, b.graph(), &[(y.clone(), HostTensor::scalar_f32(1.0))], &[y], &[], "").unwrap();
        assert_eq!(out[0].data, TensorData::Float(vec![1.0]));
    }

    #[test]
    fn ill_typed_feeds_are_rejected() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let x = b.placeholder(DType::Float, Shape::from_dims(&[2]), Some("x")).unwrap();
        let err = run(&rt, b.graph(), &[(x.clone(), HostTensor::scalar_i32(1))], &[x.clone()], &[], "");
        assert!(matches!(err, Err(Error::InvalidArgument { .. })));
        let err = run(&rt, b.graph(), &[(x.clone(), HostTensor::scalar_f32(1.0))], &[x], &[], "");
        assert!(matches!(err, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn variables_update_across_runs() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let v = b
            .get_variable(
                VariableRequest::new("counter")
                    .shape(&[])
                    .initializer(Initializer::Zeros),
            )
            .unwrap();
        let v = v.as_single().unwrap().clone();
        let one = b.scalar(1.0, DType::Float).unwrap();
        let bump = b.assign_add_variable(&v, &one).unwrap();
        let read = b
            .control_dependencies([bump.clone()], |b| b.read_variable(&v))
            .unwrap();
        for expected in [1.0, 2.0] {
            let out = run(&rt, b.graph(), &[], &[read.clone()], &[], "").unwrap();
            assert_eq!(out[0].data, TensorData::Float(vec![expected]));
        }
        assert_eq!(
            rt.resources().value("counter").unwrap().data,
            TensorData::Float(vec![2.0])
        );
    }

    #[test]
    fn cond_runs_the_selected_branch() {
        let rt = Runtime::default();
        let mut b = GraphBuilder::new(&rt);
        let p = b.placeholder(DType::Bool, Shape::scalar(), Some("p")).unwrap();
        let x = b.placeholder(DType::Float, Shape::scalar(), Some("x")).unwrap();
        let out = b
            .cond(
                &p,
                &[x.clone()],
                |b, a| Ok(vec![b.op("Neg").input(&a[0]).finish_one()?]),
                |b, a| Ok(vec![b.op("Square").input(&a[0]).finish_one()?]),
            )
            .unwrap();
        for (pred, expected) in [(true, -3.0), (false, 9.0)] {
            let feeds = [
                (p.clone(), HostTensor::scalar_bool(pred)),
                (x.clone(), HostTensor::scalar_f32(3.0)),
            ];
            let got = run(&rt, b.graph(), &feeds, &out, &[], "").unwrap();
            assert_eq!(got[0].data, TensorData::Float(vec![expected]));
        }
    }

    #[test]
    fn unknown_targets_fail() {
        let rt = Runtime::default();
        let b = GraphBuilder::new(&rt);
        assert!(matches!(
            run(&rt, b.graph(), &[], &[], &["nope"], ""),
            Err(Error::NotFound { .. })
        ));
    }
}
