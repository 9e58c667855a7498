// attr.rs — Typed node attributes
//
// Preconditions: none.
// Postconditions: none.
// Failure modes: typed accessors return `None` on a kind mismatch.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::shape::Shape;
use crate::tensor::HostTensor;

/// Attribute name carrying colocation constraints in the interchange format.
pub const COLOCATION_ATTR: &str = "_class";
/// Prefix of each colocation entry (`loc:@node`).
pub const COLOCATION_PREFIX: &str = "loc:@";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    S(String),
    I(i64),
    F(f64),
    B(bool),
    Type(DType),
    Shape(Shape),
    Tensor(HostTensor),
    /// Name of a function in the graph's library.
    Func(String),
    List(Vec<AttrValue>),
}

impl AttrValue {
    /// Kind name as used in op definitions (`type`, `list(type)`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            AttrValue::S(_) => "string",
            AttrValue::I(_) => "int",
            AttrValue::F(_) => "float",
            AttrValue::B(_) => "bool",
            AttrValue::Type(_) => "type",
            AttrValue::Shape(_) => "shape",
            AttrValue::Tensor(_) => "tensor",
            AttrValue::Func(_) => "func",
            AttrValue::List(items) => match items.first() {
                Some(AttrValue::Type(_)) => "list(type)",
                Some(AttrValue::S(_)) => "list(string)",
                Some(AttrValue::I(_)) => "list(int)",
                Some(AttrValue::Shape(_)) => "list(shape)",
                _ => "list",
            },
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::I(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::F(f) => Some(*f),
            AttrValue::I(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::B(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<DType> {
        match self {
            AttrValue::Type(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_shape(&self) -> Option<&Shape> {
        match self {
            AttrValue::Shape(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&HostTensor> {
        match self {
            AttrValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_func(&self) -> Option<&str> {
        match self {
            AttrValue::Func(f) => Some(f),
            _ => None,
        }
    }

    /// An empty list is a valid `list(type)`.
    pub fn as_type_list(&self) -> Option<Vec<DType>> {
        match self {
            AttrValue::List(items) => items.iter().map(|v| v.as_type()).collect(),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Option<Vec<&str>> {
        match self {
            AttrValue::List(items) => items.iter().map(|v| v.as_str()).collect(),
            _ => None,
        }
    }

    pub fn type_list(types: &[DType]) -> AttrValue {
        AttrValue::List(types.iter().map(|t| AttrValue::Type(*t)).collect())
    }

    pub fn str_list<S: AsRef<str>>(items: &[S]) -> AttrValue {
        AttrValue::List(
            items
                .iter()
                .map(|s| AttrValue::S(s.as_ref().to_string()))
                .collect(),
        )
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::S(s) => write!(f, "{:?}", s),
            AttrValue::I(i) => write!(f, "{}", i),
            AttrValue::F(x) => write!(f, "{}", x),
            AttrValue::B(b) => write!(f, "{}", b),
            AttrValue::Type(t) => write!(f, "{}", t),
            AttrValue::Shape(s) => write!(f, "{}", s),
            AttrValue::Tensor(t) => write!(f, "<{} tensor {:?}>", t.dtype, t.shape),
            AttrValue::Func(name) => write!(f, "@{}", name),
            AttrValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Colocation targets encoded in a `_class` attribute value.
pub fn colocation_targets(value: &AttrValue) -> Vec<String> {
    value
        .as_str_list()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|s| s.strip_prefix(COLOCATION_PREFIX))
        .map(str::to_string)
        .collect()
}

/// Encode colocation targets as a `_class` attribute value.
pub fn colocation_attr(targets: &[String]) -> AttrValue {
    AttrValue::List(
        targets
            .iter()
            .map(|t| AttrValue::S(format!("{}{}", COLOCATION_PREFIX, t)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colocation_round_trip() {
        let attr = colocation_attr(&["A".to_string(), "outer/B".to_string()]);
        assert_eq!(colocation_targets(&attr), vec!["A", "outer/B"]);
        let other = AttrValue::str_list(&["not-a-location", "loc:@C"]);
        assert_eq!(colocation_targets(&other), vec!["C"]);
    }

    #[test]
    fn list_kinds() {
        assert_eq!(AttrValue::type_list(&[DType::Int32]).kind(), "list(type)");
        assert_eq!(AttrValue::type_list(&[]).as_type_list(), Some(vec![]));
        assert_eq!(AttrValue::I(3).as_float(), Some(3.0));
    }

    #[test]
    fn json_form_is_tagged() {
        let v = AttrValue::Type(DType::Int32);
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"{"type":"DT_INT32"}"#);
        let back: AttrValue = serde_json::from_str(r#"{"list":[{"s":"loc:@A"}]}"#).unwrap();
        assert_eq!(colocation_targets(&back), vec!["A"]);
    }
}
