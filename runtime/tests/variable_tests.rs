// Integration tests for variables built through scopes: sharing modes,
// partitioning, collections, regularization and executing reads and writes.

use tfg::collections::{REGULARIZATION_LOSSES, TRAINABLE_VARIABLES};
use tfg::dtype::DType;
use tfg::error::Error;
use tfg::init::Initializer;
use tfg::partition::FixedSizePartitioner;
use tfg::regularizer::Regularizer;
use tfg::tensor::{HostTensor, TensorData};
use tfg::variable::{Reuse, VariableRequest};
use tfg::variable_scope::ScopeOptions;
use tfg::{GraphBuilder, Runtime};

fn weights(name: &str) -> VariableRequest {
    VariableRequest::new(name)
        .shape(&[2])
        .initializer(Initializer::Ones)
}

#[test]
fn auto_reuse_shares_and_create_only_refuses() {
    let rt = Runtime::default();
    let mut b = GraphBuilder::new(&rt);
    let auto = ScopeOptions::default().reuse(Reuse::Auto);
    let first = b
        .variable_scope_with("layer", auto.clone(), |b| b.get_variable(weights("w")))
        .unwrap();
    let second = b
        .variable_scope_with("layer", auto, |b| b.get_variable(weights("w")))
        .unwrap();
    assert_eq!(first.name(), "layer/w");
    assert!(first.same_as(&second));

    let err = b
        .variable_scope("layer", |b| b.get_variable(weights("w")))
        .unwrap_err();
    match err {
        Error::VariableExists { name, .. } => assert_eq!(name, "layer/w"),
        other => panic!("expected VariableExists, got {}", other),
    }
    assert_eq!(rt.variables().variables().len(), 1);
}

#[test]
fn reuse_only_scopes_need_existing_variables() {
    let rt = Runtime::default();
    let mut b = GraphBuilder::new(&rt);
    let reuse = ScopeOptions::default().reuse(Reuse::ReuseOnly);
    let err = b
        .variable_scope_with("missing", reuse, |b| b.get_variable(weights("w")))
        .unwrap_err();
    assert!(err.to_string().contains("missing/w"), "got: {}", err);
    assert!(rt.variables().variable("missing/w").is_none());
}

#[test]
fn partitioned_variables_split_the_first_dimension() {
    let rt = Runtime::default();
    let mut b = GraphBuilder::new(&rt);
    let emb = b
        .get_variable(
            VariableRequest::new("emb")
                .shape(&[130])
                .initializer(Initializer::Constant(0.5))
                .partitioner(FixedSizePartitioner { num_shards: 3, axis: 0 }),
        )
        .unwrap();
    let part = emb.as_partitioned().expect("partitioned variable");
    let shapes: Vec<Vec<i64>> = part.shards().iter().map(|s| s.shape.clone()).collect();
    assert_eq!(shapes, vec![vec![44], vec![43], vec![43]]);
    let offsets: Vec<i64> = part
        .shards()
        .iter()
        .map(|s| s.partition.as_ref().unwrap().var_offset[0])
        .collect();
    assert_eq!(offsets, vec![0, 44, 87]);
    assert_eq!(part.shards()[2].name, "emb/part_2");

    let read = b.read_variable(&part.shards()[1]).unwrap();
    let out = tfg::exec::run(&rt, b.graph(), &[], &[read], &[], "").unwrap();
    assert_eq!(out[0].data, TensorData::Float(vec![0.5; 43]));
}

#[test]
fn collections_filter_by_scope() {
    let rt = Runtime::default();
    let mut b = GraphBuilder::new(&rt);
    b.variable_scope("enc", |b| b.get_variable(weights("w"))).unwrap();
    b.variable_scope("dec", |b| b.get_variable(weights("w"))).unwrap();
    b.get_local_variable(weights("step")).unwrap();

    let trainable: Vec<String> = b
        .get_collection(TRAINABLE_VARIABLES, None)
        .iter()
        .map(|i| i.name().to_string())
        .collect();
    assert_eq!(trainable, vec!["enc/w", "dec/w"]);
    let enc: Vec<String> = b
        .get_collection(TRAINABLE_VARIABLES, Some("enc"))
        .iter()
        .map(|i| i.name().to_string())
        .collect();
    assert_eq!(enc, vec!["enc/w"]);
}

#[test]
fn scope_regularizers_record_executable_losses() {
    let rt = Runtime::default();
    let mut b = GraphBuilder::new(&rt);
    let options = ScopeOptions::default().regularizer(Regularizer::L2(0.5));
    b.variable_scope_with("dense", options, |b| {
        b.get_variable(
            VariableRequest::new("kernel")
                .initializer(Initializer::Value(HostTensor::from_f32(&[3], &[1.0, 2.0, 3.0]).unwrap())),
        )
    })
    .unwrap();

    let losses = b.get_collection(REGULARIZATION_LOSSES, None);
    assert_eq!(losses.len(), 1);
    let loss = losses[0].as_tensor().unwrap().clone();
    let out = tfg::exec::run(&rt, b.graph(), &[], &[loss], &[], "").unwrap();
    assert_eq!(out[0].data, TensorData::Float(vec![3.5]));
}

#[test]
fn assignments_persist_in_the_runtime() {
    let rt = Runtime::default();
    let mut b = GraphBuilder::new(&rt);
    let v = b
        .get_variable(
            VariableRequest::new("total")
                .shape(&[])
                .dtype(DType::Int32)
                .initializer(Initializer::Zeros),
        )
        .unwrap();
    let v = v.as_single().unwrap().clone();
    let five = b.scalar(5.0, DType::Int32).unwrap();
    let bump = b.assign_add_variable(&v, &five).unwrap();
    let read = b.read_variable(&v).unwrap();

    tfg::exec::run(&rt, b.graph(), &[], &[], &[bump.as_str()], "").unwrap();
    tfg::exec::run(&rt, b.graph(), &[], &[], &[bump.as_str()], "").unwrap();
    let out = tfg::exec::run(&rt, b.graph(), &[], &[read], &[], "").unwrap();
    assert_eq!(out[0].data, TensorData::Int(vec![10]));
}
