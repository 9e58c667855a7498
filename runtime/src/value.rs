// value.rs — Host-side argument and result values of traced functions
//
// Arguments of a traced function are nested lists, tuples and mappings whose
// leaves are tensors, tensor specs, plain scalars, strings or opaque host
// objects. While tracing, tensor leaves are replaced by symbolic tensors
// standing for placeholders of the function body.
//
// Preconditions: none.
// Postconditions: `flatten` visits leaves in a deterministic order (mapping
//                 entries sorted by key).
// Failure modes: none.
// Side effects: none.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::dtype::DType;
use crate::graph::TensorRef;
use crate::shape::Shape;
use crate::tensor::HostTensor;

/// An opaque host value passed through to the traced body.
///
/// Keys built from host objects use `object_eq`/`object_hash` when the type
/// defines them and the object's identity otherwise.
pub trait HostObject: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &str;

    /// `None` when the type has no notion of equality.
    fn object_eq(&self, _other: &dyn HostObject) -> Option<bool> {
        None
    }

    /// Must agree with `object_eq`; `None` when the type is unhashable.
    fn object_hash(&self) -> Option<u64> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// A concrete tensor argument, optionally pinned to a device.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorArg {
    pub value: HostTensor,
    pub device: Option<String>,
}

/// A tensor of a graph under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolicTensor {
    pub tensor: TensorRef,
    pub dtype: DType,
    pub shape: Shape,
}

/// Describes the tensors a function accepts; unknown dims act as wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
    pub name: Option<String>,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        TensorSpec {
            dtype,
            shape,
            name: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn is_compatible_with(&self, dtype: DType, shape: &Shape) -> bool {
        self.dtype == dtype && self.shape.is_compatible_with(shape)
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Tensor(TensorArg),
    Symbolic(SymbolicTensor),
    Spec(TensorSpec),
    Object(Arc<dyn HostObject>),
}

impl Value {
    pub fn tensor(value: HostTensor) -> Value {
        Value::Tensor(TensorArg { value, device: None })
    }

    pub fn tensor_on(value: HostTensor, device: &str) -> Value {
        Value::Tensor(TensorArg {
            value,
            device: Some(device.to_string()),
        })
    }

    pub fn object(obj: impl HostObject + 'static) -> Value {
        Value::Object(Arc::new(obj))
    }

    /// Name of the container kind, for containers.
    pub fn container_kind(&self) -> Option<&'static str> {
        match self {
            Value::List(_) => Some("list"),
            Value::Tuple(_) => Some("tuple"),
            Value::Dict(_) => Some("dict"),
            _ => None,
        }
    }

    pub fn is_tensor_like(&self) -> bool {
        matches!(self, Value::Tensor(_) | Value::Symbolic(_) | Value::Spec(_))
    }

    pub fn as_tensor(&self) -> Option<&HostTensor> {
        match self {
            Value::Tensor(t) => Some(&t.value),
            _ => None,
        }
    }

    pub fn as_symbolic(&self) -> Option<&SymbolicTensor> {
        match self {
            Value::Symbolic(s) => Some(s),
            _ => None,
        }
    }

    /// dtype and static shape of a tensor-like leaf.
    pub fn tensor_type(&self) -> Option<(DType, Shape)> {
        match self {
            Value::Tensor(t) => Some((t.value.dtype, t.value.static_shape())),
            Value::Symbolic(s) => Some((s.dtype, s.shape.clone())),
            Value::Spec(s) => Some((s.dtype, s.shape.clone())),
            _ => None,
        }
    }

    /// Leaves in depth-first order.
    pub fn flatten(&self) -> Vec<&Value> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into<'a>(&'a self, out: &mut Vec<&'a Value>) {
        match self {
            Value::List(items) | Value::Tuple(items) => items.iter().for_each(|v| v.flatten_into(out)),
            Value::Dict(map) => map.values().for_each(|v| v.flatten_into(out)),
            leaf => out.push(leaf),
        }
    }

    /// Same structure with every leaf replaced by `f(leaf)`.
    pub fn map_leaves<F>(&self, f: &mut F) -> Value
    where
        F: FnMut(&Value) -> Value,
    {
        match self {
            Value::List(items) => Value::List(items.iter().map(|v| v.map_leaves(f)).collect()),
            Value::Tuple(items) => Value::Tuple(items.iter().map(|v| v.map_leaves(f)).collect()),
            Value::Dict(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.map_leaves(f)))
                    .collect(),
            ),
            leaf => f(leaf),
        }
    }

    /// `map_leaves` with a fallible `f`; stops at the first error.
    pub fn try_map_leaves<F, E>(&self, f: &mut F) -> Result<Value, E>
    where
        F: FnMut(&Value) -> Result<Value, E>,
    {
        Ok(match self {
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|v| v.try_map_leaves(f))
                    .collect::<Result<_, E>>()?,
            ),
            Value::Tuple(items) => Value::Tuple(
                items
                    .iter()
                    .map(|v| v.try_map_leaves(f))
                    .collect::<Result<_, E>>()?,
            ),
            Value::Dict(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.try_map_leaves(f)?);
                }
                Value::Dict(out)
            }
            leaf => f(leaf)?,
        })
    }

    /// Same nesting of containers, same lengths and keys; leaves ignored.
    pub fn same_structure(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_structure(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same_structure(vb))
            }
            (a, b) => a.container_kind().is_none() && b.container_kind().is_none(),
        }
    }

    /// The innermost container kind whose structure differs between `self` and `other`.
    pub fn first_structure_change(&self, other: &Value) -> Option<&'static str> {
        if self.same_structure(other) {
            return None;
        }
        match (self, other) {
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) if a.len() == b.len() => a
                .iter()
                .zip(b)
                .find_map(|(x, y)| x.first_structure_change(y))
                .or(self.container_kind()),
            (Value::Dict(a), Value::Dict(b)) if a.keys().eq(b.keys()) => a
                .values()
                .zip(b.values())
                .find_map(|(x, y)| x.first_structure_change(y))
                .or(self.container_kind()),
            _ => self.container_kind().or(other.container_kind()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Tensor(a), Value::Tensor(b)) => a == b,
            (Value::Symbolic(a), Value::Symbolic(b)) => a == b,
            (Value::Spec(a), Value::Spec(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => objects_equal(a, b),
            _ => false,
        }
    }
}

/// Equality when the type defines it, identity otherwise.
pub fn objects_equal(a: &Arc<dyn HostObject>, b: &Arc<dyn HostObject>) -> bool {
    if a.type_name() != b.type_name() {
        return false;
    }
    a.object_eq(b.as_ref())
        .unwrap_or_else(|| std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)))
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<HostTensor> for Value {
    fn from(v: HostTensor) -> Self {
        Value::tensor(v)
    }
}

impl From<TensorSpec> for Value {
    fn from(v: TensorSpec) -> Self {
        Value::Spec(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seq = |f: &mut fmt::Formatter<'_>, items: &[Value], open: &str, close: &str| {
            write!(f, "{}", open)?;
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", v)?;
            }
            write!(f, "{}", close)
        };
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(items) => seq(f, items, "[", "]"),
            Value::Tuple(items) => seq(f, items, "(", ")"),
            Value::Dict(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Tensor(t) => write!(f, "Tensor({}, {})", t.value.dtype, t.value.static_shape()),
            Value::Symbolic(s) => write!(f, "{}", s.tensor),
            Value::Spec(s) => write!(f, "TensorSpec({}, {})", s.dtype, s.shape),
            Value::Object(o) => write!(f, "<{}>", o.type_name()),
        }
    }
}
