// Integration tests for traced functions: cache keys, retracing, variables
// created inside traced bodies, concurrent callers and graph-mode calls.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tfg::dtype::DType;
use tfg::error::Error;
use tfg::init::Initializer;
use tfg::regularizer::Regularizer;
use tfg::shape::Shape;
use tfg::tensor::{HostTensor, TensorData};
use tfg::value::HostObject;
use tfg::variable::VariableRequest;
use tfg::{GraphBuilder, Param, Result, Runtime, TensorSpec, TracedFunction, Value};

// ── Helpers ─────────────────────────────────────────────────────────────────

fn floats(shape: &[i64], values: &[f32]) -> Value {
    Value::tensor(HostTensor::from_f32(shape, values).unwrap())
}

fn no_kwargs() -> BTreeMap<String, Value> {
    BTreeMap::new()
}

fn values_of(v: &Value) -> Vec<f64> {
    match &v.as_tensor().expect("tensor result").data {
        TensorData::Float(xs) => xs.clone(),
        other => panic!("expected float data, got {:?}", other),
    }
}

/// `scale(x, factor=2.0) = x * factor`, counting how often the body runs.
fn scale(traced: Arc<AtomicUsize>) -> TracedFunction {
    TracedFunction::new(
        "scale",
        vec![Param::positional("x"), Param::positional("factor").default(2.0)],
        move |b: &mut GraphBuilder<'_>, args: &mut [Value]| -> Result<Value> {
            traced.fetch_add(1, Ordering::SeqCst);
            let x = args[0].as_symbolic().expect("tensor argument").tensor.clone();
            let factor = match args[1] {
                Value::Float(f) => f,
                Value::Int(i) => i as f64,
                _ => return Err(Error::invalid("factor must be a number")),
            };
            let c = b.scalar(factor, DType::Float)?;
            let y = b.op("Mul").input(&x).input(&c).finish_one()?;
            b.symbolic(&y)
        },
    )
}

// ── Cache keys ──────────────────────────────────────────────────────────────

#[test]
fn retraces_only_when_the_signature_changes() {
    let rt = Runtime::default();
    let traced = Arc::new(AtomicUsize::new(0));
    let f = scale(traced.clone());

    let out = f.call(&rt, vec![floats(&[2], &[1.0, 2.0])], no_kwargs()).unwrap();
    assert_eq!(values_of(&out), vec![2.0, 4.0]);
    // Same dtype and shape, different values: no retrace.
    let out = f.call(&rt, vec![floats(&[2], &[5.0, 6.0])], no_kwargs()).unwrap();
    assert_eq!(values_of(&out), vec![10.0, 12.0]);
    assert_eq!(f.trace_count(), 1);

    // A new shape and a new plain value each trace.
    f.call(&rt, vec![floats(&[3], &[1.0, 1.0, 1.0])], no_kwargs()).unwrap();
    let out = f
        .call(&rt, vec![floats(&[2], &[1.0, 2.0]), Value::Float(3.0)], no_kwargs())
        .unwrap();
    assert_eq!(values_of(&out), vec![3.0, 6.0]);
    assert_eq!(f.trace_count(), 3);
    assert_eq!(traced.load(Ordering::SeqCst), 3);
    assert_eq!(f.concrete_functions().len(), 3);
}

#[test]
fn keyword_and_positional_calls_share_a_trace() {
    let rt = Runtime::default();
    let f = scale(Arc::new(AtomicUsize::new(0)));
    let x = floats(&[2], &[1.0, 2.0]);

    let a = f.get_concrete_function(&rt, vec![x.clone(), Value::Float(4.0)], no_kwargs()).unwrap();
    let b = f
        .get_concrete_function(
            &rt,
            vec![x.clone()],
            BTreeMap::from([("factor".to_string(), Value::Float(4.0))]),
        )
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    // The default is bound before keying.
    let c = f.get_concrete_function(&rt, vec![x.clone()], no_kwargs()).unwrap();
    let d = f.get_concrete_function(&rt, vec![x, Value::Float(2.0)], no_kwargs()).unwrap();
    assert!(Arc::ptr_eq(&c, &d));
    assert_eq!(f.trace_count(), 2);
}

#[test]
fn call_device_does_not_key_but_pinned_tensors_do() {
    let rt = Runtime::default();
    let f = scale(Arc::new(AtomicUsize::new(0)));
    let t = HostTensor::from_f32(&[2], &[1.0, 2.0]).unwrap();

    f.call(&rt, vec![Value::tensor(t.clone())], no_kwargs()).unwrap();
    f.call_on_device(&rt, "/device:CPU:0", vec![Value::tensor(t.clone())], no_kwargs())
        .unwrap();
    assert_eq!(f.trace_count(), 1);

    f.call(&rt, vec![Value::tensor_on(t, "/device:CPU:1")], no_kwargs()).unwrap();
    assert_eq!(f.trace_count(), 2);
}

#[derive(Debug)]
struct Config(i64);

impl HostObject for Config {
    fn type_name(&self) -> &str {
        "Config"
    }

    fn object_eq(&self, other: &dyn HostObject) -> Option<bool> {
        Some(other.as_any().downcast_ref::<Config>().is_some_and(|o| o.0 == self.0))
    }

    fn object_hash(&self) -> Option<u64> {
        Some(self.0 as u64)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct Opaque;

impl HostObject for Opaque {
    fn type_name(&self) -> &str {
        "Opaque"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn host_objects_key_by_equality_then_identity() {
    let rt = Runtime::default();
    let f = TracedFunction::new(
        "passthrough",
        vec![Param::positional("x"), Param::positional("obj")],
        |b: &mut GraphBuilder<'_>, args: &mut [Value]| -> Result<Value> {
            let x = args[0].as_symbolic().expect("tensor argument").tensor.clone();
            let y = b.identity(&x)?;
            b.symbolic(&y)
        },
    );
    let x = floats(&[], &[1.0]);

    f.call(&rt, vec![x.clone(), Value::object(Config(1))], no_kwargs()).unwrap();
    f.call(&rt, vec![x.clone(), Value::object(Config(1))], no_kwargs()).unwrap();
    assert_eq!(f.trace_count(), 1);
    f.call(&rt, vec![x.clone(), Value::object(Config(2))], no_kwargs()).unwrap();
    assert_eq!(f.trace_count(), 2);

    let opaque: Arc<dyn HostObject> = Arc::new(Opaque);
    f.call(&rt, vec![x.clone(), Value::Object(opaque.clone())], no_kwargs()).unwrap();
    f.call(&rt, vec![x.clone(), Value::Object(opaque)], no_kwargs()).unwrap();
    assert_eq!(f.trace_count(), 3);
    f.call(&rt, vec![x, Value::object(Opaque)], no_kwargs()).unwrap();
    assert_eq!(f.trace_count(), 4);
}

// ── Input signatures ────────────────────────────────────────────────────────

#[test]
fn input_signature_traces_once_for_compatible_shapes() {
    let rt = Runtime::default();
    let spec = TensorSpec::new(DType::Float, Shape::from_partial(&[-1])).named("values");
    let f = TracedFunction::with_input_signature(
        "total",
        vec![Param::positional("x")],
        vec![Value::Spec(spec)],
        |b: &mut GraphBuilder<'_>, args: &mut [Value]| -> Result<Value> {
            let x = args[0].as_symbolic().expect("tensor argument").tensor.clone();
            let y = b.op("Sum").input(&x).finish_one()?;
            b.symbolic(&y)
        },
    )
    .unwrap();

    let out = f.call(&rt, vec![floats(&[2], &[1.0, 2.0])], no_kwargs()).unwrap();
    assert_eq!(values_of(&out), vec![3.0]);
    let out = f.call(&rt, vec![floats(&[4], &[1.0, 2.0, 3.0, 4.0])], no_kwargs()).unwrap();
    assert_eq!(values_of(&out), vec![10.0]);
    assert_eq!(f.trace_count(), 1);

    let concrete = &f.concrete_functions()[0];
    assert!(concrete.fdef.graph.contains("values"));

    let err = f.call(&rt, vec![floats(&[2, 2], &[1.0; 4])], no_kwargs()).unwrap_err();
    assert!(matches!(err, Error::SignatureMismatch { .. }));
    let err = f.call(&rt, vec![Value::Int(3)], no_kwargs()).unwrap_err();
    assert!(matches!(err, Error::NonTensorWithSignature { .. }));
}

// ── Bodies ──────────────────────────────────────────────────────────────────

#[test]
fn appending_to_a_list_argument_is_rejected() {
    let rt = Runtime::default();
    let f = TracedFunction::new(
        "append",
        vec![Param::positional("items")],
        |_: &mut GraphBuilder<'_>, args: &mut [Value]| -> Result<Value> {
            if let Value::List(items) = &mut args[0] {
                items.push(Value::Int(1));
            }
            Ok(Value::None)
        },
    );
    let err = f
        .call(&rt, vec![Value::List(vec![floats(&[], &[1.0])])], no_kwargs())
        .unwrap_err();
    match err {
        Error::InputMutation { function, container } => {
            assert_eq!(function, "append");
            assert_eq!(container, "list");
        }
        other => panic!("expected InputMutation, got {}", other),
    }
    assert_eq!(f.trace_count(), 0);
}

#[test]
fn variables_are_created_once_and_keep_their_state() {
    let rt = Runtime::default();
    let f = TracedFunction::new(
        "tick",
        vec![],
        |b: &mut GraphBuilder<'_>, _: &mut [Value]| -> Result<Value> {
            let v = b.get_variable(
                VariableRequest::new("ticks")
                    .shape(&[])
                    .initializer(Initializer::Zeros),
            )?;
            let v = v.as_single().expect("single variable").clone();
            let one = b.scalar(1.0, DType::Float)?;
            b.assign_add_variable(&v, &one)?;
            let read = b.read_variable(&v)?;
            b.symbolic(&read)
        },
    );
    let outs: Vec<f64> = (0..3)
        .map(|_| values_of(&f.call(&rt, vec![], no_kwargs()).unwrap())[0])
        .collect();
    assert_eq!(outs, vec![1.0, 2.0, 3.0]);
    assert_eq!(f.trace_count(), 1);
    assert!(rt.variables().variable("ticks").is_some());
}

#[test]
fn penalties_of_variables_created_while_tracing_stay_retrievable() {
    let rt = Runtime::default();
    let f = TracedFunction::new(
        "dense",
        vec![],
        |b: &mut GraphBuilder<'_>, _: &mut [Value]| -> Result<Value> {
            let v = b.get_variable(
                VariableRequest::new("dense/kernel")
                    .initializer(Initializer::Value(HostTensor::from_f32(&[3], &[1.0, 2.0, 3.0])?))
                    .regularizer(Regularizer::L2(0.5)),
            )?;
            let v = v.as_single().expect("single variable").clone();
            let read = b.read_variable(&v)?;
            b.symbolic(&read)
        },
    );
    f.call(&rt, vec![], no_kwargs()).unwrap();
    f.call(&rt, vec![], no_kwargs()).unwrap();
    assert_eq!(f.trace_count(), 1);
    assert_eq!(rt.variables().regularized(None).len(), 1);

    let mut b = GraphBuilder::new(&rt);
    let losses = b.regularization_losses(Some("dense/")).unwrap();
    assert_eq!(losses.len(), 1);
    assert_eq!(b.regularization_losses(None).unwrap(), losses);
    assert!(b.regularization_losses(Some("other/")).unwrap().is_empty());
    let out = tfg::exec::run(&rt, b.graph(), &[], &losses, &[], "").unwrap();
    assert_eq!(out[0].data, TensorData::Float(vec![3.5]));
}

#[test]
fn concurrent_callers_trace_once() {
    let rt = Runtime::default();
    let traced = Arc::new(AtomicUsize::new(0));
    let f = scale(traced.clone());
    let barrier = Barrier::new(8);
    let results: Vec<Vec<f64>> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let (rt, f, barrier) = (&rt, &f, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    let out = f.call(rt, vec![floats(&[1], &[i as f32])], BTreeMap::new()).unwrap();
                    values_of(&out)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(traced.load(Ordering::SeqCst), 1);
    for (i, r) in results.iter().enumerate() {
        assert_eq!(r, &vec![2.0 * i as f64]);
    }
}

#[test]
fn graph_mode_calls_emit_call_nodes() {
    let rt = Runtime::default();
    let f = scale(Arc::new(AtomicUsize::new(0)));
    let mut b = GraphBuilder::new(&rt);
    let x = b.placeholder(DType::Float, Shape::from_dims(&[2]), Some("x")).unwrap();
    let arg = b.symbolic(&x).unwrap();
    let out = f.call_in(&mut b, vec![arg], no_kwargs()).unwrap();
    let y = out.as_symbolic().expect("symbolic result").tensor.clone();
    assert_eq!(b.graph().get_node(&y.node).unwrap().op, "PartitionedCall");
    assert_eq!(b.graph().functions().count(), 1);

    let feeds = vec![(x, HostTensor::from_f32(&[2], &[3.0, 4.0]).unwrap())];
    let result = tfg::exec::run(&rt, b.graph(), &feeds, &[y], &[], "").unwrap();
    assert_eq!(result[0].data, TensorData::Float(vec![6.0, 8.0]));
}

#[test]
fn a_function_is_bound_to_one_runtime() {
    let first = Runtime::default();
    let second = Runtime::default();
    let f = scale(Arc::new(AtomicUsize::new(0)));
    f.call(&first, vec![floats(&[1], &[1.0])], no_kwargs()).unwrap();
    let err = f.call(&second, vec![floats(&[1], &[1.0])], no_kwargs()).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
}

#[test]
fn a_replacement_runtime_is_still_a_different_runtime() {
    let f = scale(Arc::new(AtomicUsize::new(0)));
    let first = Box::new(Runtime::default());
    f.call(&first, vec![floats(&[1], &[1.0])], no_kwargs()).unwrap();
    drop(first);
    let second = Box::new(Runtime::default());
    let err = f.call(&second, vec![floats(&[1], &[1.0])], no_kwargs()).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
}
