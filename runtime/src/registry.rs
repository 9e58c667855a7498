// registry.rs — Op definition registry
//
// Op signatures are declared with REGISTER_OP() macro invocations, scanned at
// the text level from op library files and from the built-in definitions
// below. Each argument is `name: type` where type is a dtype (`int32`), a type
// attr (`T`), a repeated type attr (`N * T`) or a type-list attr (`Tin`).
//
//   REGISTER_OP(Add, INPUT(x: T), INPUT(y: T), OUTPUT(z: T), ATTR(T: type), SHAPE(broadcast))
//
// Preconditions: none.
// Postconditions: every registered op has unique name and resolvable arg types.
// Failure modes: malformed macros → `RegistryError::ParseError`; redefinition
//                → `RegistryError::DuplicateOp`.
// Side effects: `load_op_file` reads from disk.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::attr::AttrValue;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;

// ── Data types ──────────────────────────────────────────────────────────────

/// How an argument's element type is determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgType {
    /// A fixed dtype, e.g. `a: int32`.
    Fixed(DType),
    /// A `type` attr, e.g. `x: T`.
    Attr(String),
    /// `N * T`: `N` tensors of one type.
    Repeated { number_attr: String, elem: Box<ArgType> },
    /// A `list(type)` attr: one tensor per listed type.
    List(String),
}

/// Resource access performed through a resource input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDef {
    pub name: String,
    pub ty: ArgType,
    pub access: Option<Access>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttrDef {
    pub name: String,
    /// `type`, `int`, `float`, `bool`, `string`, `shape`, `tensor`, `func`,
    /// `list(type)`, `list(string)` or `list(int)`.
    pub kind: String,
    pub default: Option<AttrValue>,
}

/// Static output-shape rule of an op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeFn {
    Unknown,
    Scalar,
    SameAsInput(usize),
    Broadcast,
    /// Shape held in a `shape` attr.
    FromAttr(String),
    /// Shape of the `value` tensor attr.
    FromValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpDef {
    pub name: String,
    pub inputs: Vec<ArgDef>,
    pub outputs: Vec<ArgDef>,
    pub attrs: Vec<AttrDef>,
    pub stateful: bool,
    pub shape_fn: ShapeFn,
}

/// Errors that can occur during registry loading.
#[derive(Debug)]
pub enum RegistryError {
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        file: PathBuf,
        line: usize,
        message: String,
    },
    DuplicateOp {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::IoError { path, source } => {
                write!(f, "{}: {}", path.display(), source)
            }
            RegistryError::ParseError {
                file,
                line,
                message,
            } => {
                write!(f, "{}:{}: {}", file.display(), line, message)
            }
            RegistryError::DuplicateOp {
                name,
                first,
                second,
            } => {
                write!(
                    f,
                    "duplicate op '{}': first registered in {}, redefined in {}",
                    name,
                    first.display(),
                    second.display()
                )
            }
        }
    }
}

impl std::error::Error for RegistryError {}

// ── Signature resolution ────────────────────────────────────────────────────

impl OpDef {
    pub fn attr_def(&self, name: &str) -> Option<&AttrDef> {
        self.attrs.iter().find(|a| a.name == name)
    }

    /// Insert defaults for attrs the node leaves unset.
    pub fn fill_defaults(&self, attrs: &mut BTreeMap<String, AttrValue>) {
        for def in &self.attrs {
            if let Some(default) = &def.default {
                attrs
                    .entry(def.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
    }

    /// Reject attrs the op does not declare. Names starting with `_` are
    /// internal annotations and always allowed.
    pub fn check_attrs(&self, node: &str, attrs: &BTreeMap<String, AttrValue>) -> Result<()> {
        for name in attrs.keys() {
            if !name.starts_with('_') && self.attr_def(name).is_none() {
                return Err(Error::UnknownAttr {
                    node: node.to_string(),
                    op: self.name.clone(),
                    attr: name.clone(),
                });
            }
        }
        for def in &self.attrs {
            if def.default.is_none() && !attrs.contains_key(&def.name) {
                return Err(Error::MissingAttr {
                    node: node.to_string(),
                    attr: def.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Flattened input dtypes for a node with `attrs`.
    pub fn input_types(&self, node: &str, attrs: &BTreeMap<String, AttrValue>) -> Result<Vec<DType>> {
        flatten_args(&self.inputs, node, attrs).map(|v| v.into_iter().map(|(t, _)| t).collect())
    }

    pub fn output_types(&self, node: &str, attrs: &BTreeMap<String, AttrValue>) -> Result<Vec<DType>> {
        flatten_args(&self.outputs, node, attrs).map(|v| v.into_iter().map(|(t, _)| t).collect())
    }

    /// Resource access per flattened input position.
    pub fn input_access(
        &self,
        node: &str,
        attrs: &BTreeMap<String, AttrValue>,
    ) -> Result<Vec<Option<Access>>> {
        flatten_args(&self.inputs, node, attrs).map(|v| v.into_iter().map(|(_, a)| a).collect())
    }

    /// Static output shapes given the input shapes and attrs.
    pub fn infer_shapes(
        &self,
        input_shapes: &[Shape],
        attrs: &BTreeMap<String, AttrValue>,
        num_outputs: usize,
    ) -> Vec<Shape> {
        let one = match &self.shape_fn {
            ShapeFn::Unknown => Shape::unknown(),
            ShapeFn::Scalar => Shape::scalar(),
            ShapeFn::SameAsInput(i) => input_shapes.get(*i).cloned().unwrap_or_default(),
            ShapeFn::Broadcast => input_shapes
                .iter()
                .skip(1)
                .fold(input_shapes.first().cloned().unwrap_or_default(), |acc, s| {
                    acc.broadcast(s)
                }),
            ShapeFn::FromAttr(name) => attrs
                .get(name)
                .and_then(|a| a.as_shape())
                .cloned()
                .unwrap_or_default(),
            ShapeFn::FromValue => attrs
                .get("value")
                .and_then(|a| a.as_tensor())
                .map(|t| t.static_shape())
                .unwrap_or_default(),
        };
        vec![one; num_outputs]
    }
}

fn flatten_args(
    args: &[ArgDef],
    node: &str,
    attrs: &BTreeMap<String, AttrValue>,
) -> Result<Vec<(DType, Option<Access>)>> {
    let mut out = Vec::new();
    for arg in args {
        for t in arg_types(&arg.ty, node, attrs)? {
            out.push((t, arg.access));
        }
    }
    Ok(out)
}

fn arg_types(ty: &ArgType, node: &str, attrs: &BTreeMap<String, AttrValue>) -> Result<Vec<DType>> {
    let get = |name: &str| {
        attrs.get(name).ok_or_else(|| Error::MissingAttr {
            node: node.to_string(),
            attr: name.to_string(),
        })
    };
    match ty {
        ArgType::Fixed(t) => Ok(vec![*t]),
        ArgType::Attr(name) => get(name)?
            .as_type()
            .map(|t| vec![t])
            .ok_or_else(|| Error::AttrType {
                node: node.to_string(),
                attr: name.clone(),
                expected: "type",
            }),
        ArgType::Repeated { number_attr, elem } => {
            let n = get(number_attr)?
                .as_int()
                .filter(|n| *n >= 0)
                .ok_or_else(|| Error::AttrType {
                    node: node.to_string(),
                    attr: number_attr.clone(),
                    expected: "non-negative int",
                })?;
            let elem = arg_types(elem, node, attrs)?;
            Ok((0..n).flat_map(|_| elem.clone()).collect())
        }
        ArgType::List(name) => get(name)?
            .as_type_list()
            .ok_or_else(|| Error::AttrType {
                node: node.to_string(),
                attr: name.clone(),
                expected: "list(type)",
            }),
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

const BUILTIN_ORIGIN: &str = "<builtin>";

/// Op definitions known to this runtime.
const BUILTIN_OPS: &str = r#"
REGISTER_OP(NoOp)
REGISTER_OP(Const, OUTPUT(output: dtype), ATTR(value: tensor), ATTR(dtype: type), SHAPE(from_value))
REGISTER_OP(Placeholder, OUTPUT(output: dtype), ATTR(dtype: type), ATTR(shape: shape = ?),
            SHAPE(from_attr(shape)))
REGISTER_OP(Identity, INPUT(input: T), OUTPUT(output: T), ATTR(T: type), SHAPE(same_as_input(0)))

// Elementwise arithmetic; a scalar operand broadcasts.
REGISTER_OP(Add, INPUT(x: T), INPUT(y: T), OUTPUT(z: T), ATTR(T: type), SHAPE(broadcast))
REGISTER_OP(Sub, INPUT(x: T), INPUT(y: T), OUTPUT(z: T), ATTR(T: type), SHAPE(broadcast))
REGISTER_OP(Mul, INPUT(x: T), INPUT(y: T), OUTPUT(z: T), ATTR(T: type), SHAPE(broadcast))
REGISTER_OP(Greater, INPUT(x: T), INPUT(y: T), OUTPUT(z: bool), ATTR(T: type), SHAPE(broadcast))
REGISTER_OP(AddN, INPUT(inputs: N * T), OUTPUT(sum: T), ATTR(N: int), ATTR(T: type),
            SHAPE(same_as_input(0)))
REGISTER_OP(Neg, INPUT(x: T), OUTPUT(y: T), ATTR(T: type), SHAPE(same_as_input(0)))
REGISTER_OP(Abs, INPUT(x: T), OUTPUT(y: T), ATTR(T: type), SHAPE(same_as_input(0)))
REGISTER_OP(Square, INPUT(x: T), OUTPUT(y: T), ATTR(T: type), SHAPE(same_as_input(0)))
REGISTER_OP(Cast, INPUT(x: SrcT), OUTPUT(y: DstT), ATTR(SrcT: type), ATTR(DstT: type),
            SHAPE(same_as_input(0)))

// Full reductions.
REGISTER_OP(Sum, INPUT(input: T), OUTPUT(output: T), ATTR(T: type), SHAPE(scalar))
REGISTER_OP(L2Loss, INPUT(t: T), OUTPUT(output: T), ATTR(T: type), SHAPE(scalar))

// Resource variables.
REGISTER_OP(VarHandleOp, OUTPUT(resource: resource), ATTR(shared_name: string = ""),
            ATTR(dtype: type), ATTR(shape: shape), STATEFUL, SHAPE(scalar))
REGISTER_OP(ReadVariableOp, INPUT(resource: resource, READ), OUTPUT(value: dtype),
            ATTR(dtype: type), STATEFUL)
REGISTER_OP(AssignVariableOp, INPUT(resource: resource, WRITE), INPUT(value: dtype),
            ATTR(dtype: type), STATEFUL)
REGISTER_OP(AssignAddVariableOp, INPUT(resource: resource, WRITE), INPUT(value: dtype),
            ATTR(dtype: type), STATEFUL)

REGISTER_OP(Print, INPUT(input: T), OUTPUT(output: T), ATTR(T: type), ATTR(message: string = ""),
            STATEFUL, SHAPE(same_as_input(0)))

// Functional control flow and calls.
REGISTER_OP(If, INPUT(cond: Tcond), INPUT(input: Tin), OUTPUT(output: Tout), ATTR(Tcond: type),
            ATTR(Tin: list(type)), ATTR(Tout: list(type)), ATTR(then_branch: func),
            ATTR(else_branch: func), STATEFUL)
REGISTER_OP(PartitionedCall, INPUT(args: Tin), OUTPUT(output: Tout), ATTR(Tin: list(type)),
            ATTR(Tout: list(type)), ATTR(f: func))
REGISTER_OP(StatefulPartitionedCall, INPUT(args: Tin), OUTPUT(output: Tout),
            ATTR(Tin: list(type)), ATTR(Tout: list(type)), ATTR(f: func), STATEFUL)
"#;

/// Op definition registry.
pub struct OpRegistry {
    ops: HashMap<String, (OpDef, PathBuf)>,
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OpRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        OpRegistry {
            ops: HashMap::new(),
        }
    }

    /// A registry holding the built-in ops.
    pub fn with_builtin_ops() -> Self {
        let mut reg = OpRegistry::new();
        // The built-in table is a constant; a failure here is a programming error
        // caught by `builtin_ops_scan` below.
        if let Err(e) = reg.register_source(BUILTIN_OPS, Path::new(BUILTIN_ORIGIN)) {
            tracing::error!("built-in op table rejected: {}", e);
        }
        reg
    }

    /// Load ops from an op library file. Returns the number of ops found.
    pub fn load_op_file(&mut self, path: &Path) -> std::result::Result<usize, RegistryError> {
        let source = std::fs::read_to_string(path).map_err(|e| RegistryError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.register_source(&source, path)
    }

    /// Register every REGISTER_OP() in `source`, attributing them to `origin`.
    pub fn register_source(
        &mut self,
        source: &str,
        origin: &Path,
    ) -> std::result::Result<usize, RegistryError> {
        let ops = scan_ops(source, origin)?;
        let count = ops.len();
        for op in ops {
            self.register(op, origin)?;
        }
        Ok(count)
    }

    pub fn register(&mut self, op: OpDef, origin: &Path) -> std::result::Result<(), RegistryError> {
        if let Some((_, first)) = self.ops.get(&op.name) {
            return Err(RegistryError::DuplicateOp {
                name: op.name.clone(),
                first: first.clone(),
                second: origin.to_path_buf(),
            });
        }
        self.ops.insert(op.name.clone(), (op, origin.to_path_buf()));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&OpDef> {
        self.ops.get(name).map(|(def, _)| def)
    }

    /// Like `lookup`, reporting an unregistered op for `node`.
    pub fn get(&self, op: &str, node: &str) -> Result<&OpDef> {
        self.lookup(op).ok_or_else(|| Error::UnknownOp {
            node: node.to_string(),
            op: op.to_string(),
        })
    }

    /// Op names in sorted order.
    pub fn op_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ops.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ── Scanner ─────────────────────────────────────────────────────────────────

const MACRO: &str = "REGISTER_OP(";

/// Scan a source string for REGISTER_OP() invocations.
fn scan_ops(source: &str, file: &Path) -> std::result::Result<Vec<OpDef>, RegistryError> {
    let stripped = strip_comments(source);
    let bytes = stripped.as_bytes();
    let mut results = Vec::new();
    let mut pos = 0;

    while let Some(idx) = stripped[pos..].find(MACRO) {
        let abs_idx = pos + idx;
        if abs_idx > 0 {
            let prev = bytes[abs_idx - 1];
            if prev.is_ascii_alphanumeric() || prev == b'_' {
                pos = abs_idx + MACRO.len();
                continue;
            }
        }
        let line = stripped[..abs_idx].matches('\n').count() + 1;
        let paren_start = abs_idx + MACRO.len() - 1;
        let content_end =
            extract_balanced(bytes, paren_start).ok_or_else(|| RegistryError::ParseError {
                file: file.to_path_buf(),
                line,
                message: "unbalanced parentheses in REGISTER_OP() macro".to_string(),
            })?;
        let inner = &stripped[paren_start + 1..content_end];
        results.push(parse_op_macro(inner, file, line)?);
        pos = content_end + 1;
    }

    Ok(results)
}

/// Strip `//` line comments and `/* */` blocks, keeping newlines for line counts.
fn strip_comments(source: &str) -> String {
    let mut result = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            result.push(c);
            if c == '\\' {
                if let Some(next) = chars.next() {
                    result.push(next);
                }
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match (c, chars.peek()) {
            ('/', Some('/')) => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        result.push('\n');
                    }
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    prev = skipped;
                }
            }
            ('"', _) => {
                in_string = true;
                result.push(c);
            }
            _ => result.push(c),
        }
    }

    result
}

/// Index of the `)` closing the `(` at `start`.
fn extract_balanced(bytes: &[u8], start: usize) -> Option<usize> {
    if bytes.get(start) != Some(&b'(') {
        return None;
    }
    let mut depth = 0;
    for (i, b) in bytes.iter().enumerate().skip(start) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split by commas at the top level (respecting nested `()` and `[]`).
fn split_top_level_commas(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;

    for (i, b) in s.bytes().enumerate() {
        match b {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            b',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    parts.push(&s[start..]);
    parts
}

/// An argument before its type spec is resolved against the attr list.
struct RawArg {
    name: String,
    spec: String,
    access: Option<Access>,
}

/// Parse the inner content of a REGISTER_OP(...) invocation.
fn parse_op_macro(inner: &str, file: &Path, line: usize) -> std::result::Result<OpDef, RegistryError> {
    let err = |message: String| RegistryError::ParseError {
        file: file.to_path_buf(),
        line,
        message,
    };

    let fields = split_top_level_commas(inner);
    let name = fields[0].trim().to_string();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(err(format!("invalid op name: '{}'", name)));
    }

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut attrs = Vec::new();
    let mut stateful = false;
    let mut shape_fn = ShapeFn::Unknown;

    for field in &fields[1..] {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        if field == "STATEFUL" {
            stateful = true;
        } else if let Some(body) = macro_body(field, "INPUT") {
            inputs.push(parse_raw_arg(body).map_err(&err)?);
        } else if let Some(body) = macro_body(field, "OUTPUT") {
            outputs.push(parse_raw_arg(body).map_err(&err)?);
        } else if let Some(body) = macro_body(field, "ATTR") {
            attrs.push(parse_attr_def(body).map_err(&err)?);
        } else if let Some(body) = macro_body(field, "SHAPE") {
            shape_fn = parse_shape_fn(body.trim()).map_err(&err)?;
        } else {
            return Err(err(format!("unexpected field in REGISTER_OP({}): '{}'", name, field)));
        }
    }

    let resolve = |args: Vec<RawArg>| -> std::result::Result<Vec<ArgDef>, RegistryError> {
        args.into_iter()
            .map(|raw| {
                Ok(ArgDef {
                    ty: resolve_arg_type(&raw.spec, &attrs).map_err(&err)?,
                    name: raw.name,
                    access: raw.access,
                })
            })
            .collect()
    };
    let inputs = resolve(inputs)?;
    let outputs = resolve(outputs)?;

    Ok(OpDef {
        name,
        inputs,
        outputs,
        attrs,
        stateful,
        shape_fn,
    })
}

fn macro_body<'a>(field: &'a str, keyword: &str) -> Option<&'a str> {
    field
        .strip_prefix(keyword)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

/// `name: spec` or `name: spec, READ|WRITE`.
fn parse_raw_arg(body: &str) -> std::result::Result<RawArg, String> {
    let parts = split_top_level_commas(body);
    let (name, spec) = parts[0]
        .split_once(':')
        .ok_or_else(|| format!("expected 'name: type' in argument '{}'", body.trim()))?;
    let access = match parts.get(1).map(|s| s.trim()) {
        None => None,
        Some("READ") => Some(Access::Read),
        Some("WRITE") => Some(Access::Write),
        Some(other) => return Err(format!("unknown resource access '{}'", other)),
    };
    Ok(RawArg {
        name: name.trim().to_string(),
        spec: spec.trim().to_string(),
        access,
    })
}

fn resolve_arg_type(spec: &str, attrs: &[AttrDef]) -> std::result::Result<ArgType, String> {
    if let Some((n, elem)) = spec.split_once('*') {
        let number_attr = n.trim().to_string();
        if !attrs.iter().any(|a| a.name == number_attr && a.kind == "int") {
            return Err(format!("'{}' in '{}' is not an int attr", number_attr, spec));
        }
        return Ok(ArgType::Repeated {
            number_attr,
            elem: Box::new(resolve_arg_type(elem.trim(), attrs)?),
        });
    }
    if let Some(attr) = attrs.iter().find(|a| a.name == spec) {
        return match attr.kind.as_str() {
            "type" => Ok(ArgType::Attr(spec.to_string())),
            "list(type)" => Ok(ArgType::List(spec.to_string())),
            other => Err(format!("attr '{}' of kind {} cannot type an argument", spec, other)),
        };
    }
    DType::parse(spec)
        .map(ArgType::Fixed)
        .ok_or_else(|| format!("unknown argument type: '{}'", spec))
}

/// `name: kind` or `name: kind = default`.
fn parse_attr_def(body: &str) -> std::result::Result<AttrDef, String> {
    let (name, rest) = body
        .split_once(':')
        .ok_or_else(|| format!("expected 'name: kind' in attr '{}'", body.trim()))?;
    let (kind, default) = match rest.split_once('=') {
        Some((k, d)) => (k.trim(), Some(d.trim())),
        None => (rest.trim(), None),
    };
    const KINDS: [&str; 11] = [
        "type",
        "int",
        "float",
        "bool",
        "string",
        "shape",
        "tensor",
        "func",
        "list(type)",
        "list(string)",
        "list(int)",
    ];
    if !KINDS.contains(&kind) {
        return Err(format!("unknown attr kind '{}'", kind));
    }
    let default = match default {
        Some(text) => Some(parse_default(kind, text)?),
        None => None,
    };
    Ok(AttrDef {
        name: name.trim().to_string(),
        kind: kind.to_string(),
        default,
    })
}

fn parse_default(kind: &str, text: &str) -> std::result::Result<AttrValue, String> {
    let bad = || format!("bad default '{}' for attr of kind {}", text, kind);
    match kind {
        "type" => DType::parse(text).map(AttrValue::Type).ok_or_else(bad),
        "int" => text.parse().map(AttrValue::I).map_err(|_| bad()),
        "float" => text.parse().map(AttrValue::F).map_err(|_| bad()),
        "bool" => text.parse().map(AttrValue::B).map_err(|_| bad()),
        "string" => text
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .map(|t| AttrValue::S(t.to_string()))
            .ok_or_else(bad),
        "shape" if text == "?" => Ok(AttrValue::Shape(Shape::unknown())),
        "shape" => {
            let dims = text
                .strip_prefix('[')
                .and_then(|t| t.strip_suffix(']'))
                .ok_or_else(bad)?;
            let dims: std::result::Result<Vec<i64>, _> = dims
                .split(',')
                .filter(|d| !d.trim().is_empty())
                .map(|d| d.trim().parse::<i64>())
                .collect();
            Ok(AttrValue::Shape(Shape::from_partial(&dims.map_err(|_| bad())?)))
        }
        k if k.starts_with("list(") && text == "[]" => Ok(AttrValue::List(Vec::new())),
        _ => Err(bad()),
    }
}

fn parse_shape_fn(body: &str) -> std::result::Result<ShapeFn, String> {
    match body {
        "unknown" => Ok(ShapeFn::Unknown),
        "scalar" => Ok(ShapeFn::Scalar),
        "broadcast" => Ok(ShapeFn::Broadcast),
        "from_value" => Ok(ShapeFn::FromValue),
        _ => {
            if let Some(i) = macro_body(body, "same_as_input") {
                i.trim()
                    .parse()
                    .map(ShapeFn::SameAsInput)
                    .map_err(|_| format!("bad input index in '{}'", body))
            } else if let Some(attr) = macro_body(body, "from_attr") {
                Ok(ShapeFn::FromAttr(attr.trim().to_string()))
            } else {
                Err(format!("unknown shape function '{}'", body))
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_one(src: &str) -> OpDef {
        let ops = scan_ops(src, Path::new("test.ops")).expect("scan failed");
        assert_eq!(ops.len(), 1, "expected exactly 1 op");
        ops.into_iter().next().unwrap()
    }

    fn attrs(pairs: &[(&str, AttrValue)]) -> BTreeMap<String, AttrValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn builtin_ops_scan() {
        let mut reg = OpRegistry::new();
        let n = reg
            .register_source(BUILTIN_OPS, Path::new(BUILTIN_ORIGIN))
            .expect("built-in table must scan");
        assert_eq!(n, reg.len());
        assert!(reg.lookup("If").unwrap().stateful);
        assert!(!reg.lookup("Add").unwrap().stateful);
    }

    #[test]
    fn parse_fixed_and_attr_types() {
        let op = scan_one("REGISTER_OP(IntInputFloatInput, INPUT(a: int32), INPUT(b: float))");
        assert_eq!(op.inputs[0].ty, ArgType::Fixed(DType::Int32));
        assert_eq!(op.inputs[1].ty, ArgType::Fixed(DType::Float));
        assert!(op.outputs.is_empty());

        let op = scan_one("REGISTER_OP(Id, INPUT(x: T), OUTPUT(y: T), ATTR(T: type))");
        assert_eq!(op.inputs[0].ty, ArgType::Attr("T".into()));
    }

    #[test]
    fn repeated_and_list_args_flatten() {
        let op = scan_one(
            "REGISTER_OP(Pack, INPUT(values: N * T), INPUT(extra: Tin), OUTPUT(out: T),
                         ATTR(N: int), ATTR(T: type), ATTR(Tin: list(type)))",
        );
        let a = attrs(&[
            ("N", AttrValue::I(2)),
            ("T", AttrValue::Type(DType::Float)),
            ("Tin", AttrValue::type_list(&[DType::Int32])),
        ]);
        assert_eq!(
            op.input_types("p", &a).unwrap(),
            vec![DType::Float, DType::Float, DType::Int32]
        );
    }

    #[test]
    fn missing_type_attr_is_reported() {
        let op = scan_one("REGISTER_OP(Id, INPUT(x: T), OUTPUT(y: T), ATTR(T: type))");
        let err = op.output_types("id", &BTreeMap::new()).unwrap_err();
        assert_eq!(err.to_string(), "node 'id' has no attr named 'T'");
    }

    #[test]
    fn defaults_fill_and_unknown_attrs_reject() {
        let op = scan_one("REGISTER_OP(OpWithDefaultAttr, OUTPUT(a: int32), ATTR(default_int: int = 456))");
        let mut a = BTreeMap::new();
        op.fill_defaults(&mut a);
        assert_eq!(a.get("default_int"), Some(&AttrValue::I(456)));
        assert!(op.check_attrs("n", &a).is_ok());

        a.insert("bogus".into(), AttrValue::I(1));
        assert!(matches!(
            op.check_attrs("n", &a),
            Err(Error::UnknownAttr { .. })
        ));
        a.remove("bogus");
        a.insert("_class".into(), AttrValue::str_list(&["loc:@x"]));
        assert!(op.check_attrs("n", &a).is_ok());
    }

    #[test]
    fn resource_access_flags() {
        let reg = OpRegistry::with_builtin_ops();
        let op = reg.lookup("AssignVariableOp").unwrap();
        let a = attrs(&[("dtype", AttrValue::Type(DType::Float))]);
        assert_eq!(
            op.input_access("assign", &a).unwrap(),
            vec![Some(Access::Write), None]
        );
    }

    #[test]
    fn shape_defaults() {
        let op = scan_one("REGISTER_OP(P, OUTPUT(o: float), ATTR(shape: shape = [2, -1]), SHAPE(from_attr(shape)))");
        let mut a = BTreeMap::new();
        op.fill_defaults(&mut a);
        assert_eq!(
            op.infer_shapes(&[], &a, 1),
            vec![Shape::from_partial(&[2, -1])]
        );
    }

    #[test]
    fn unknown_type_error() {
        let result = scan_ops("REGISTER_OP(Bad, INPUT(x: quaternion))", Path::new("t.ops"));
        match result {
            Err(RegistryError::ParseError { message, line, .. }) => {
                assert!(message.contains("unknown argument type"), "got: {}", message);
                assert_eq!(line, 1);
            }
            other => panic!("expected ParseError, got: {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn skip_comments() {
        let src = r#"
// REGISTER_OP(CommentedOut)
/* REGISTER_OP(AlsoCommented) */
REGISTER_OP(Real, OUTPUT(a: int32))
"#;
        let ops = scan_ops(src, Path::new("t.ops")).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].name, "Real");
    }

    #[test]
    fn duplicate_op_error() {
        let mut reg = OpRegistry::with_builtin_ops();
        let err = reg
            .register_source("REGISTER_OP(Add)", Path::new("user.ops"))
            .unwrap_err();
        match err {
            RegistryError::DuplicateOp { name, first, .. } => {
                assert_eq!(name, "Add");
                assert_eq!(first, PathBuf::from(BUILTIN_ORIGIN));
            }
            other => panic!("expected DuplicateOp, got: {}", other),
        }
    }

    #[test]
    fn load_op_file_from_disk() {
        let dir = std::env::temp_dir().join("tfg_registry_load");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("user.ops");
        std::fs::write(&path, "REGISTER_OP(A, OUTPUT(o: int32))\nREGISTER_OP(B, INPUT(i: int32))\n")
            .unwrap();
        let mut reg = OpRegistry::new();
        assert_eq!(reg.load_op_file(&path).unwrap(), 2);
        assert_eq!(reg.op_names(), vec!["A", "B"]);
        std::fs::remove_dir_all(&dir).ok();
    }
}
