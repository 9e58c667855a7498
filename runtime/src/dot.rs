// dot.rs — Graphviz DOT output for computation graphs
//
// Renders a Graph into DOT format suitable for `dot` or other Graphviz
// layout engines. Library functions are drawn as dashed clusters next to the
// top-level graph. Data edges carry the dtype and static shape of the output
// they move; control edges are dashed.
//
// Preconditions: `graph` is a constructed Graph (any node order).
// Postconditions: returns a DOT string; node and function order is stable.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::graph::{Graph, Node, TensorRef};

/// Emit the graph and its function library as a Graphviz DOT string.
pub fn emit_dot(graph: &Graph) -> String {
    let mut buf = String::new();
    writeln!(buf, "digraph tfg {{").unwrap();
    writeln!(buf, "    rankdir=TB;").unwrap();
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();

    write_nodes(&mut buf, graph, "g", "    ");

    let mut functions: Vec<_> = graph.functions().collect();
    functions.sort_by(|a, b| a.name.cmp(&b.name));
    for (i, f) in functions.iter().enumerate() {
        let prefix = format!("f{i}");
        writeln!(buf).unwrap();
        writeln!(buf, "    subgraph cluster_{} {{", sanitize(&f.name)).unwrap();
        writeln!(buf, "        label=\"function: {}\";", escape(&f.name)).unwrap();
        writeln!(buf, "        style=dashed;").unwrap();
        writeln!(buf, "        color=gray50;").unwrap();
        write_nodes(&mut buf, &f.graph, &prefix, "        ");
        writeln!(buf, "    }}").unwrap();
    }

    writeln!(buf, "}}").unwrap();
    buf
}

fn write_nodes(buf: &mut String, graph: &Graph, prefix: &str, indent: &str) {
    for node in graph.nodes() {
        writeln!(
            buf,
            "{indent}{} [label=\"{}\", {}];",
            dot_node_id(prefix, &node.name),
            node_label(node),
            node_attrs(&node.op)
        )
        .unwrap();
    }
    for node in graph.nodes() {
        let dst = dot_node_id(prefix, &node.name);
        for t in node.data_inputs() {
            let src = dot_node_id(prefix, &t.node);
            writeln!(buf, "{indent}{src} -> {dst} [label=\"{}\"];", edge_label(graph, t)).unwrap();
        }
        for name in node.control_inputs() {
            let src = dot_node_id(prefix, name);
            writeln!(buf, "{indent}{src} -> {dst} [style=dashed, arrowhead=odot];").unwrap();
        }
    }
}

/// Replace characters DOT identifiers cannot carry.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn dot_node_id(prefix: &str, name: &str) -> String {
    format!("\"{prefix}:{}\"", escape(name))
}

fn node_label(node: &Node) -> String {
    let mut label = format!("{}\\n{}", escape(&node.name), escape(&node.op));
    if !node.device.is_empty() {
        write!(label, "\\n@{}", escape(&node.device)).unwrap();
    }
    label
}

fn node_attrs(op: &str) -> &'static str {
    match op {
        "Placeholder" => "shape=ellipse, style=filled, fillcolor=lightblue",
        "Const" => "shape=box, style=\"rounded,filled\", fillcolor=gray90",
        "VarHandleOp" => "shape=cylinder",
        "If" => "shape=diamond",
        "PartitionedCall" | "StatefulPartitionedCall" => "shape=component",
        "NoOp" => "shape=point",
        _ => "shape=box",
    }
}

/// `dtype shape` of the output an edge carries, with `:k` for non-zero slots.
fn edge_label(graph: &Graph, t: &TensorRef) -> String {
    let slot = match graph.output(t) {
        Ok(slot) => format!("{} {}", slot.dtype, slot.shape),
        Err(_) => String::from("?"),
    };
    if t.index == 0 {
        slot
    } else {
        format!(":{} {}", t.index, slot)
    }
}
