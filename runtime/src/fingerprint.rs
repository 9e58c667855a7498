// fingerprint.rs — Cache keys of traced-function calls
//
// A key is the structure of the bound arguments plus one key per leaf:
// tensors contribute dtype, shape and pinned device; other leaves their
// value; host objects their equality, or identity when they define none.
//
// Preconditions: arguments have been bound to the function's parameters.
// Postconditions: two calls get equal keys exactly when a graph traced for
//                 one is valid for the other.
// Failure modes: none.
// Side effects: none.

use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::dtype::DType;
use crate::shape::Shape;
use crate::value::{objects_equal, HostObject, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    #[default]
    Eager,
    /// Called while building another graph.
    Graph,
}

/// A host object inside a key.
#[derive(Clone)]
pub struct ObjectKey(pub Arc<dyn HostObject>);

impl ObjectKey {
    fn has_equality(&self) -> bool {
        self.0.object_eq(self.0.as_ref()).is_some()
    }
}

impl PartialEq for ObjectKey {
    fn eq(&self, other: &Self) -> bool {
        objects_equal(&self.0, &other.0)
    }
}

impl Eq for ObjectKey {}

impl Hash for ObjectKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.type_name().hash(state);
        if !self.has_equality() {
            (Arc::as_ptr(&self.0) as *const () as usize).hash(state);
        } else if let Some(h) = self.0.object_hash() {
            h.hash(state);
        }
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.has_equality(), self.0.object_hash()) {
            (true, Some(h)) => write!(f, "<{}#{:x}>", self.0.type_name(), h),
            (true, None) => write!(f, "<{}>", self.0.type_name()),
            (false, _) => write!(f, "<{}@{:p}>", self.0.type_name(), Arc::as_ptr(&self.0) as *const ()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeafKey {
    None,
    Bool(bool),
    Int(i64),
    /// Bit pattern, so that NaN keys equal themselves.
    Float(u64),
    Str(String),
    Tensor {
        dtype: DType,
        shape: Shape,
        device: Option<String>,
    },
    Object(ObjectKey),
}

impl LeafKey {
    fn of(leaf: &Value) -> LeafKey {
        match leaf {
            Value::None => LeafKey::None,
            Value::Bool(b) => LeafKey::Bool(*b),
            Value::Int(i) => LeafKey::Int(*i),
            Value::Float(x) => LeafKey::Float(x.to_bits()),
            Value::Str(s) => LeafKey::Str(s.clone()),
            Value::Tensor(t) => LeafKey::Tensor {
                dtype: t.value.dtype,
                shape: t.value.static_shape(),
                device: t.device.clone(),
            },
            Value::Symbolic(s) => LeafKey::Tensor {
                dtype: s.dtype,
                shape: s.shape.clone(),
                device: None,
            },
            Value::Spec(s) => LeafKey::Tensor {
                dtype: s.dtype,
                shape: s.shape.clone(),
                device: None,
            },
            Value::Object(o) => LeafKey::Object(ObjectKey(o.clone())),
            Value::List(_) | Value::Tuple(_) | Value::Dict(_) => {
                unreachable!("containers are flattened before keying")
            }
        }
    }
}

impl fmt::Display for LeafKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeafKey::None => write!(f, "None"),
            LeafKey::Bool(b) => write!(f, "{}", b),
            LeafKey::Int(i) => write!(f, "{}", i),
            LeafKey::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            LeafKey::Str(s) => write!(f, "{:?}", s),
            LeafKey::Tensor { dtype, shape, device } => {
                write!(f, "{}{}", dtype, shape)?;
                if let Some(d) = device {
                    write!(f, "@{}", d)?;
                }
                Ok(())
            }
            LeafKey::Object(o) => write!(f, "{}", o),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Nesting of containers with `*` marking leaves, e.g. `([*,*],{k:*})`.
    pub structure: String,
    pub leaves: Vec<LeafKey>,
    pub mode: ExecutionMode,
}

impl CacheKey {
    /// Key of bound positional arguments.
    pub fn new(args: &[Value], mode: ExecutionMode) -> CacheKey {
        let mut structure = String::new();
        let mut leaves = Vec::new();
        structure.push('(');
        for (i, a) in args.iter().enumerate() {
            if i > 0 {
                structure.push(',');
            }
            describe(a, &mut structure, &mut leaves);
        }
        structure.push(')');
        CacheKey {
            structure,
            leaves,
            mode,
        }
    }

    /// Stable hex digest of the key, for logs and generated names.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        let hash = hasher.finalize();
        hash.iter().take(8).fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
    }
}

fn describe(v: &Value, structure: &mut String, leaves: &mut Vec<LeafKey>) {
    let seq = |items: &[Value], open: char, close: char, structure: &mut String, leaves: &mut Vec<LeafKey>| {
        structure.push(open);
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                structure.push(',');
            }
            describe(item, structure, leaves);
        }
        structure.push(close);
    };
    match v {
        Value::List(items) => seq(items, '[', ']', structure, leaves),
        Value::Tuple(items) => seq(items, '(', ')', structure, leaves),
        Value::Dict(map) => {
            structure.push('{');
            for (i, (k, item)) in map.iter().enumerate() {
                if i > 0 {
                    structure.push(',');
                }
                structure.push_str(k);
                structure.push(':');
                describe(item, structure, leaves);
            }
            structure.push('}');
        }
        leaf => {
            structure.push('*');
            leaves.push(LeafKey::of(leaf));
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{} [", self.mode, self.structure)?;
        for (i, l) in self.leaves.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", l)?;
        }
        write!(f, "]")
    }
}
