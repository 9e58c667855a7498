// Snapshot tests: lock textual outputs (interchange text, DOT, selective
// registration lists, cache key rendering) to detect unintended changes.
//
// Uses `insta` inline snapshots. Run `cargo insta review` after intentional
// output changes to update them.

use std::collections::BTreeMap;

use tfg::fingerprint::{CacheKey, ExecutionMode};
use tfg::graph::Graph;
use tfg::graph_def::GraphDef;
use tfg::import::{import_graph_def, ImportOptions};
use tfg::kernels::{ops_and_kernels, KernelRegistry, DEFAULT_OPS};
use tfg::registry::OpRegistry;
use tfg::tensor::HostTensor;
use tfg::Value;

const PAIR: &str = r#"
node { name: "A" op: "NoOp" }
node { name: "B" op: "NoOp" input: "^A" attr { key: "_class" value { list { s: "loc:@A" } } } }
versions { producer: 21 }
"#;

fn imported(times: usize) -> Graph {
    let registry = OpRegistry::with_builtin_ops();
    let def = GraphDef::from_text(PAIR).unwrap();
    let mut g = Graph::new();
    for _ in 0..times {
        import_graph_def(&mut g, &registry, &def, &ImportOptions::default().with_prefix("")).unwrap();
    }
    g
}

#[test]
fn merged_imports_as_text() {
    let text = GraphDef::from_graph(&imported(2)).to_text();
    insta::assert_snapshot!(text, @r###"
    node {
      name: "A"
      op: "NoOp"
    }
    node {
      name: "B"
      op: "NoOp"
      input: "^A"
      attr {
        key: "_class"
        value {
          list {
            s: "loc:@A"
          }
        }
      }
    }
    node {
      name: "A_1"
      op: "NoOp"
    }
    node {
      name: "B_1"
      op: "NoOp"
      input: "^A_1"
      attr {
        key: "_class"
        value {
          list {
            s: "loc:@A_1"
          }
        }
      }
    }
    versions {
      producer: 21
    }
    "###);
}

#[test]
fn control_edges_in_dot() {
    let dot = tfg::dot::emit_dot(&imported(1));
    insta::assert_snapshot!(dot, @r###"
    digraph tfg {
        rankdir=TB;
        node [fontname="Helvetica", fontsize=10];
        edge [fontname="Helvetica", fontsize=9];
        "g:A" [label="A\nNoOp", shape=point];
        "g:B" [label="B\nNoOp", shape=point];
        "g:A" -> "g:B" [style=dashed, arrowhead=odot];
    }
    "###);
}

#[test]
fn selective_registration_list() {
    let def = GraphDef::from_text(
        r#"
node { name: "x" op: "Placeholder" attr { key: "dtype" value { type: DT_FLOAT } } }
node { name: "y" op: "Neg" input: "x" attr { key: "T" value { type: DT_FLOAT } } }
node { name: "z" op: "Neg" input: "y" attr { key: "T" value { type: DT_FLOAT } } }
"#,
    )
    .unwrap();
    let pairs = ops_and_kernels(&[def], &KernelRegistry::with_builtin_kernels(), DEFAULT_OPS).unwrap();
    let listing: String = pairs
        .iter()
        .map(|(op, kernel)| format!("{} {}\n", op, kernel))
        .collect();
    insta::assert_snapshot!(listing, @r###"
    Neg UnaryOp<CPUDevice, functor::neg<float>>
    NoOp NoOp
    Placeholder PlaceholderOp
    _Recv RecvOp
    _Send SendOp
    "###);
}

#[test]
fn cache_key_rendering() {
    let args = vec![
        Value::tensor(HostTensor::zeros(tfg::dtype::DType::Float, &[2, 3]).unwrap()),
        Value::List(vec![Value::Int(1), Value::from("a")]),
        Value::Dict(BTreeMap::from([("lr".to_string(), Value::Float(0.5))])),
    ];
    let key = CacheKey::new(&args, ExecutionMode::Graph);
    insta::assert_snapshot!(key.to_string(), @r###"Graph(*,[*,*],{lr:*}) [float32(2, 3), 1, "a", 0.5]"###);
}
