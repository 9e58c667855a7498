// graph_def.rs — Graph interchange format: serialized node lists, versions and function library
//
// Two encodings share one data model: a protobuf-text-like form (`.pbtxt`) and
// JSON (`.json`). Export from a live `Graph` writes colocation groups as the
// `_class` list attribute of `loc:@<name>` strings.
//
// Preconditions: none.
// Postconditions: `from_text(to_text(d)) == d` for every `d` whose attribute
//                 values are representable in the text form.
// Failure modes: syntax errors and unknown fields → `Error::Parse`;
//                malformed JSON → `Error::Json`; unreadable files → `Error::Io`.
// Side effects: `load` reads the file system.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::attr::{colocation_attr, AttrValue, COLOCATION_ATTR};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::{FunctionDef, Graph, GraphVersions, Node};
use crate::parser::{parse_text, TextField, TextValue};
use crate::shape::Shape;
use crate::tensor::{HostTensor, TensorData};

// ── Data model ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphDef {
    pub node: Vec<NodeDef>,
    pub versions: VersionDef,
    pub library: Vec<LibraryFunction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    /// `name`, `name:k` or `^name`.
    pub input: Vec<String>,
    pub device: String,
    pub attr: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionDef {
    pub producer: i32,
    pub min_consumer: i32,
    pub bad_consumers: Vec<i32>,
}

/// A function body in the library: its own node list plus argument and result bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryFunction {
    pub name: String,
    pub node: Vec<NodeDef>,
    /// Placeholder outputs receiving the arguments (`x:0`).
    pub input: Vec<String>,
    pub output: Vec<String>,
    pub control_output: Vec<String>,
}

impl From<&GraphVersions> for VersionDef {
    fn from(v: &GraphVersions) -> Self {
        VersionDef {
            producer: v.producer,
            min_consumer: v.min_consumer,
            bad_consumers: v.bad_consumers.clone(),
        }
    }
}

impl From<&VersionDef> for GraphVersions {
    fn from(v: &VersionDef) -> Self {
        GraphVersions {
            producer: v.producer,
            min_consumer: v.min_consumer,
            bad_consumers: v.bad_consumers.clone(),
        }
    }
}

impl NodeDef {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        NodeDef {
            name: name.into(),
            op: op.into(),
            ..NodeDef::default()
        }
    }

    pub fn from_node(node: &Node) -> Self {
        let mut attr = node.attrs.clone();
        if !node.colocation.is_empty() {
            attr.insert(COLOCATION_ATTR.to_string(), colocation_attr(&node.colocation));
        }
        NodeDef {
            name: node.name.clone(),
            op: node.op.clone(),
            input: node.inputs.iter().map(|i| i.to_input_string()).collect(),
            device: node.device.clone(),
            attr,
        }
    }
}

impl LibraryFunction {
    pub fn from_function(f: &FunctionDef) -> Self {
        LibraryFunction {
            name: f.name.clone(),
            node: f.graph.nodes().map(NodeDef::from_node).collect(),
            input: f.inputs.iter().map(|t| t.to_string()).collect(),
            output: f.outputs.iter().map(|t| t.to_string()).collect(),
            control_output: f.control_outputs.clone(),
        }
    }
}

impl GraphDef {
    /// Serialize a live graph. Nested function bodies are flattened into one library.
    pub fn from_graph(graph: &Graph) -> Self {
        GraphDef {
            node: graph.nodes().map(NodeDef::from_node).collect(),
            versions: graph.versions().into(),
            library: graph
                .functions()
                .map(|f| LibraryFunction::from_function(f))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node.is_empty() && self.library.is_empty()
    }

    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_text(source: &str) -> Result<Self> {
        let fields = parse_text(source)?;
        read_graph_def(&fields)
    }

    pub fn to_text(&self) -> String {
        let mut w = TextWriter::default();
        for node in &self.node {
            w.open("node");
            write_node(&mut w, node);
            w.close();
        }
        w.open("versions");
        w.scalar("producer", self.versions.producer);
        if self.versions.min_consumer != 0 {
            w.scalar("min_consumer", self.versions.min_consumer);
        }
        for b in &self.versions.bad_consumers {
            w.scalar("bad_consumers", b);
        }
        w.close();
        if !self.library.is_empty() {
            w.open("library");
            for f in &self.library {
                w.open("function");
                w.string("name", &f.name);
                for n in &f.node {
                    w.open("node");
                    write_node(&mut w, n);
                    w.close();
                }
                for i in &f.input {
                    w.string("input", i);
                }
                for o in &f.output {
                    w.string("output", o);
                }
                for c in &f.control_output {
                    w.string("control_output", c);
                }
                w.close();
            }
            w.close();
        }
        w.out
    }

    /// Serialized size used for the import size limits.
    pub fn byte_size(&self) -> usize {
        self.to_text().len()
    }

    /// Load from a file; `.json` selects JSON, anything else the text form.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        if path.extension().is_some_and(|e| e == "json") {
            GraphDef::from_json(&source)
        } else {
            GraphDef::from_text(&source)
        }
    }
}

// ── Text writer ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct TextWriter {
    out: String,
    indent: usize,
}

impl TextWriter {
    fn line(&mut self, text: std::fmt::Arguments<'_>) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        let _ = self.out.write_fmt(text);
        self.out.push('\n');
    }

    fn open(&mut self, name: &str) {
        self.line(format_args!("{} {{", name));
        self.indent += 1;
    }

    fn close(&mut self) {
        self.indent -= 1;
        self.line(format_args!("}}"));
    }

    fn scalar(&mut self, name: &str, value: impl std::fmt::Display) {
        self.line(format_args!("{}: {}", name, value));
    }

    fn string(&mut self, name: &str, value: &str) {
        self.line(format_args!("{}: {}", name, quote(value)));
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn float_text(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v.is_infinite() {
        let text = if v > 0.0 { "inf" } else { "-inf" };
        text.to_string()
    } else {
        // Debug keeps a fraction or exponent, so the value re-lexes as a float.
        format!("{:?}", v)
    }
}

fn write_node(w: &mut TextWriter, node: &NodeDef) {
    w.string("name", &node.name);
    w.string("op", &node.op);
    for input in &node.input {
        w.string("input", input);
    }
    if !node.device.is_empty() {
        w.string("device", &node.device);
    }
    for (key, value) in &node.attr {
        w.open("attr");
        w.string("key", key);
        w.open("value");
        write_attr_value(w, value);
        w.close();
        w.close();
    }
}

fn write_attr_value(w: &mut TextWriter, value: &AttrValue) {
    match value {
        AttrValue::S(s) => w.string("s", s),
        AttrValue::I(i) => w.scalar("i", i),
        AttrValue::F(f) => w.scalar("f", float_text(*f)),
        AttrValue::B(b) => w.scalar("b", b),
        AttrValue::Type(t) => w.scalar("type", t.wire_name()),
        AttrValue::Shape(s) => {
            w.open("shape");
            write_shape(w, s);
            w.close();
        }
        AttrValue::Tensor(t) => {
            w.open("tensor");
            write_tensor(w, t);
            w.close();
        }
        AttrValue::Func(name) => {
            w.open("func");
            w.string("name", name);
            w.close();
        }
        AttrValue::List(items) => {
            w.open("list");
            for item in items {
                write_attr_value(w, item);
            }
            w.close();
        }
    }
}

fn write_shape(w: &mut TextWriter, shape: &Shape) {
    match &shape.dims {
        None => w.scalar("unknown_rank", true),
        Some(dims) => {
            for d in dims {
                w.open("dim");
                w.scalar("size", d.unwrap_or(-1));
                w.close();
            }
        }
    }
}

fn tensor_value_field(dtype: DType) -> &'static str {
    match dtype {
        DType::Half | DType::Float => "float_val",
        DType::Double => "double_val",
        DType::Int64 | DType::UInt32 | DType::UInt64 => "int64_val",
        DType::Bool => "bool_val",
        DType::String | DType::Resource => "string_val",
        _ => "int_val",
    }
}

fn write_tensor(w: &mut TextWriter, t: &HostTensor) {
    w.scalar("dtype", t.dtype.wire_name());
    w.open("tensor_shape");
    write_shape(w, &t.static_shape());
    w.close();
    let field = tensor_value_field(t.dtype);
    match &t.data {
        TensorData::Float(v) => v.iter().for_each(|x| w.scalar(field, float_text(*x))),
        TensorData::Int(v) => v.iter().for_each(|x| w.scalar(field, x)),
        TensorData::Bool(v) => v.iter().for_each(|x| w.scalar(field, x)),
        TensorData::Str(v) => v.iter().for_each(|x| w.string(field, x)),
    }
}

// ── Text reader ─────────────────────────────────────────────────────────────

fn parse_err(message: impl Into<String>) -> Error {
    Error::Parse {
        message: message.into(),
    }
}

/// Values of a field, expanding `[a, b]` lists.
fn values(field: &TextField) -> Vec<&TextValue> {
    match &field.value {
        TextValue::List(items) => items.iter().collect(),
        v => vec![v],
    }
}

fn single<'a>(field: &'a TextField) -> Result<&'a TextValue> {
    match &field.value {
        TextValue::List(_) => Err(parse_err(format!(
            "field '{}' does not take a list",
            field.name
        ))),
        v => Ok(v),
    }
}

fn want_str(field: &TextField, v: &TextValue) -> Result<String> {
    match v {
        TextValue::Str(s) => Ok(s.clone()),
        _ => Err(parse_err(format!("field '{}' expects a string", field.name))),
    }
}

fn want_int(field: &TextField, v: &TextValue) -> Result<i64> {
    match v {
        TextValue::Int(i) => Ok(*i),
        _ => Err(parse_err(format!("field '{}' expects an integer", field.name))),
    }
}

fn want_i32(field: &TextField, v: &TextValue) -> Result<i32> {
    let i = want_int(field, v)?;
    i32::try_from(i).map_err(|_| parse_err(format!("field '{}' out of range: {}", field.name, i)))
}

fn want_float(field: &TextField, v: &TextValue) -> Result<f64> {
    match v {
        TextValue::Float(f) => Ok(*f),
        TextValue::Int(i) => Ok(*i as f64),
        TextValue::Ident(s) => match s.to_ascii_lowercase().as_str() {
            "inf" | "infinity" => Ok(f64::INFINITY),
            "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
            "nan" => Ok(f64::NAN),
            _ => Err(parse_err(format!("field '{}' expects a number", field.name))),
        },
        _ => Err(parse_err(format!("field '{}' expects a number", field.name))),
    }
}

fn want_bool(field: &TextField, v: &TextValue) -> Result<bool> {
    match v {
        TextValue::Ident(s) if s == "true" || s == "True" => Ok(true),
        TextValue::Ident(s) if s == "false" || s == "False" => Ok(false),
        TextValue::Int(1) => Ok(true),
        TextValue::Int(0) => Ok(false),
        _ => Err(parse_err(format!("field '{}' expects a bool", field.name))),
    }
}

fn want_dtype(field: &TextField, v: &TextValue) -> Result<DType> {
    match v {
        TextValue::Ident(s) | TextValue::Str(s) => DType::parse(s)
            .ok_or_else(|| parse_err(format!("field '{}': unknown dtype '{}'", field.name, s))),
        _ => Err(parse_err(format!("field '{}' expects a dtype", field.name))),
    }
}

fn want_message<'a>(field: &TextField, v: &'a TextValue) -> Result<&'a [TextField]> {
    match v {
        TextValue::Message(m) => Ok(m),
        _ => Err(parse_err(format!("field '{}' expects a message", field.name))),
    }
}

fn unknown_field(context: &str, field: &TextField) -> Error {
    parse_err(format!("unknown field '{}' in {}", field.name, context))
}

fn read_graph_def(fields: &[TextField]) -> Result<GraphDef> {
    let mut def = GraphDef::default();
    for field in fields {
        match field.name.as_str() {
            "node" => {
                for v in values(field) {
                    def.node.push(read_node(want_message(field, v)?)?);
                }
            }
            "versions" => def.versions = read_versions(want_message(field, single(field)?)?)?,
            // Legacy top-level producer version.
            "version" => def.versions.producer = want_i32(field, single(field)?)?,
            "library" => {
                for f in want_message(field, single(field)?)? {
                    match f.name.as_str() {
                        "function" => {
                            for v in values(f) {
                                def.library.push(read_function(want_message(f, v)?)?);
                            }
                        }
                        _ => return Err(unknown_field("library", f)),
                    }
                }
            }
            _ => return Err(unknown_field("graph definition", field)),
        }
    }
    Ok(def)
}

fn read_versions(fields: &[TextField]) -> Result<VersionDef> {
    let mut v = VersionDef::default();
    for field in fields {
        match field.name.as_str() {
            "producer" => v.producer = want_i32(field, single(field)?)?,
            "min_consumer" => v.min_consumer = want_i32(field, single(field)?)?,
            "bad_consumers" => {
                for x in values(field) {
                    v.bad_consumers.push(want_i32(field, x)?);
                }
            }
            _ => return Err(unknown_field("versions", field)),
        }
    }
    Ok(v)
}

fn read_node(fields: &[TextField]) -> Result<NodeDef> {
    let mut node = NodeDef::default();
    for field in fields {
        match field.name.as_str() {
            "name" => node.name = want_str(field, single(field)?)?,
            "op" => node.op = want_str(field, single(field)?)?,
            "device" => node.device = want_str(field, single(field)?)?,
            "input" => {
                for v in values(field) {
                    node.input.push(want_str(field, v)?);
                }
            }
            "attr" => {
                for v in values(field) {
                    let (key, value) = read_attr_entry(want_message(field, v)?)?;
                    node.attr.insert(key, value);
                }
            }
            _ => return Err(unknown_field("node", field)),
        }
    }
    if node.name.is_empty() {
        return Err(parse_err("node without a name"));
    }
    Ok(node)
}

fn read_function(fields: &[TextField]) -> Result<LibraryFunction> {
    let mut f = LibraryFunction::default();
    for field in fields {
        match field.name.as_str() {
            "name" => f.name = want_str(field, single(field)?)?,
            "node" => {
                for v in values(field) {
                    f.node.push(read_node(want_message(field, v)?)?);
                }
            }
            "input" | "output" | "control_output" => {
                let target = match field.name.as_str() {
                    "input" => &mut f.input,
                    "output" => &mut f.output,
                    _ => &mut f.control_output,
                };
                for v in values(field) {
                    target.push(want_str(field, v)?);
                }
            }
            _ => return Err(unknown_field("function", field)),
        }
    }
    if f.name.is_empty() {
        return Err(parse_err("library function without a name"));
    }
    Ok(f)
}

fn read_attr_entry(fields: &[TextField]) -> Result<(String, AttrValue)> {
    let mut key = None;
    let mut value = None;
    for field in fields {
        match field.name.as_str() {
            "key" => key = Some(want_str(field, single(field)?)?),
            "value" => value = Some(read_attr_value(field, want_message(field, single(field)?)?)?),
            _ => return Err(unknown_field("attr", field)),
        }
    }
    let key = key.ok_or_else(|| parse_err("attr entry without a key"))?;
    let value = value.ok_or_else(|| parse_err(format!("attr '{}' has no value", key)))?;
    Ok((key, value))
}

fn read_attr_value(parent: &TextField, fields: &[TextField]) -> Result<AttrValue> {
    let mut items = read_attr_items(fields)?;
    match (items.len(), items.pop()) {
        (1, Some(v)) => Ok(v),
        _ => Err(parse_err(format!(
            "field '{}' must hold exactly one attribute value",
            parent.name
        ))),
    }
}

/// Every value named in an attr-value or list message, in order.
fn read_attr_items(fields: &[TextField]) -> Result<Vec<AttrValue>> {
    let mut out = Vec::new();
    for field in fields {
        for v in values(field) {
            out.push(match field.name.as_str() {
                "s" => AttrValue::S(want_str(field, v)?),
                "i" => AttrValue::I(want_int(field, v)?),
                "f" => AttrValue::F(want_float(field, v)?),
                "b" => AttrValue::B(want_bool(field, v)?),
                "type" => AttrValue::Type(want_dtype(field, v)?),
                "shape" => AttrValue::Shape(read_shape(want_message(field, v)?)?),
                "tensor" => AttrValue::Tensor(read_tensor(want_message(field, v)?)?),
                "func" => {
                    let mut name = None;
                    for f in want_message(field, v)? {
                        match f.name.as_str() {
                            "name" => name = Some(want_str(f, single(f)?)?),
                            _ => return Err(unknown_field("func", f)),
                        }
                    }
                    AttrValue::Func(name.ok_or_else(|| parse_err("func without a name"))?)
                }
                "list" => AttrValue::List(read_attr_items(want_message(field, v)?)?),
                _ => return Err(unknown_field("attr value", field)),
            });
        }
    }
    Ok(out)
}

fn read_shape(fields: &[TextField]) -> Result<Shape> {
    let mut dims = Vec::new();
    let mut unknown_rank = false;
    for field in fields {
        match field.name.as_str() {
            "unknown_rank" => unknown_rank = want_bool(field, single(field)?)?,
            "dim" => {
                for v in values(field) {
                    let mut size = -1;
                    for f in want_message(field, v)? {
                        match f.name.as_str() {
                            "size" => size = want_int(f, single(f)?)?,
                            "name" => {}
                            _ => return Err(unknown_field("dim", f)),
                        }
                    }
                    dims.push(size);
                }
            }
            _ => return Err(unknown_field("shape", field)),
        }
    }
    if unknown_rank {
        Ok(Shape::unknown())
    } else {
        Ok(Shape::from_partial(&dims))
    }
}

fn read_tensor(fields: &[TextField]) -> Result<HostTensor> {
    let mut dtype = None;
    let mut shape = Shape::scalar();
    let mut floats = Vec::new();
    let mut ints = Vec::new();
    let mut bools = Vec::new();
    let mut strings = Vec::new();
    for field in fields {
        match field.name.as_str() {
            "dtype" => dtype = Some(want_dtype(field, single(field)?)?),
            "tensor_shape" => shape = read_shape(want_message(field, single(field)?)?)?,
            "float_val" | "double_val" | "half_val" => {
                for v in values(field) {
                    floats.push(want_float(field, v)?);
                }
            }
            "int_val" | "int64_val" | "uint32_val" | "uint64_val" => {
                for v in values(field) {
                    ints.push(want_int(field, v)?);
                }
            }
            "bool_val" => {
                for v in values(field) {
                    bools.push(want_bool(field, v)?);
                }
            }
            "string_val" => {
                for v in values(field) {
                    strings.push(want_str(field, v)?);
                }
            }
            _ => return Err(unknown_field("tensor", field)),
        }
    }
    let dtype = dtype.ok_or_else(|| parse_err("tensor without a dtype"))?;
    let dims = shape
        .to_vec()
        .ok_or_else(|| parse_err("tensor shape must be fully defined"))?;
    let n = dims.iter().product::<i64>().max(0) as usize;
    // A single value fills the whole tensor; no values means zeros.
    fn fill<T: Clone>(mut v: Vec<T>, n: usize, zero: T) -> Vec<T> {
        match v.len() {
            0 => vec![zero; n],
            1 if n != 1 => vec![v.remove(0); n],
            _ => v,
        }
    }
    let data = if dtype.is_floating() {
        TensorData::Float(fill(floats, n, 0.0))
    } else if dtype.is_integer() || dtype.is_unsigned() {
        TensorData::Int(fill(ints, n, 0))
    } else if dtype.is_bool() {
        TensorData::Bool(fill(bools, n, false))
    } else if matches!(dtype, DType::String | DType::Resource) {
        TensorData::Str(fill(strings, n, String::new()))
    } else {
        return Err(parse_err(format!("tensors of dtype {} are not supported", dtype)));
    };
    HostTensor::new(dtype, dims, data).map_err(|e| parse_err(e.to_string()))
}

// ── Tests ───────────────────────────────────────────────────────────────────
