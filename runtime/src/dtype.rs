// dtype.rs — Element types carried by tensors, graph edges and variables
//
// Names follow the interchange format (`DT_FLOAT`) on the wire and the short
// form (`float32`) in messages.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: `DType::parse` returns `None` for unknown names.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DType {
    Half,
    Float,
    Double,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Bool,
    String,
    Complex64,
    Complex128,
    Resource,
    Variant,
}

const ALL: [DType; 17] = [
    DType::Half,
    DType::Float,
    DType::Double,
    DType::Int8,
    DType::Int16,
    DType::Int32,
    DType::Int64,
    DType::UInt8,
    DType::UInt16,
    DType::UInt32,
    DType::UInt64,
    DType::Bool,
    DType::String,
    DType::Complex64,
    DType::Complex128,
    DType::Resource,
    DType::Variant,
];

impl DType {
    /// Short name used in messages and in `type:` attribute values of JSON graphs.
    pub fn name(self) -> &'static str {
        match self {
            DType::Half => "float16",
            DType::Float => "float32",
            DType::Double => "float64",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Bool => "bool",
            DType::String => "string",
            DType::Complex64 => "complex64",
            DType::Complex128 => "complex128",
            DType::Resource => "resource",
            DType::Variant => "variant",
        }
    }

    /// Enum name used by the text interchange format.
    pub fn wire_name(self) -> &'static str {
        match self {
            DType::Half => "DT_HALF",
            DType::Float => "DT_FLOAT",
            DType::Double => "DT_DOUBLE",
            DType::Int8 => "DT_INT8",
            DType::Int16 => "DT_INT16",
            DType::Int32 => "DT_INT32",
            DType::Int64 => "DT_INT64",
            DType::UInt8 => "DT_UINT8",
            DType::UInt16 => "DT_UINT16",
            DType::UInt32 => "DT_UINT32",
            DType::UInt64 => "DT_UINT64",
            DType::Bool => "DT_BOOL",
            DType::String => "DT_STRING",
            DType::Complex64 => "DT_COMPLEX64",
            DType::Complex128 => "DT_COMPLEX128",
            DType::Resource => "DT_RESOURCE",
            DType::Variant => "DT_VARIANT",
        }
    }

    /// Accepts either the wire name (`DT_INT32`), the short name (`int32`),
    /// or the aliases `float`, `double` and `half`.
    pub fn parse(s: &str) -> Option<DType> {
        match s {
            "float" => return Some(DType::Float),
            "double" => return Some(DType::Double),
            "half" => return Some(DType::Half),
            _ => {}
        }
        ALL.iter()
            .copied()
            .find(|d| d.name() == s || d.wire_name() == s)
    }

    pub fn is_floating(self) -> bool {
        matches!(self, DType::Half | DType::Float | DType::Double)
    }

    pub fn is_complex(self) -> bool {
        matches!(self, DType::Complex64 | DType::Complex128)
    }

    /// Signed integer types.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DType::Int8 | DType::Int16 | DType::Int32 | DType::Int64
        )
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            DType::UInt8 | DType::UInt16 | DType::UInt32 | DType::UInt64
        )
    }

    pub fn is_bool(self) -> bool {
        self == DType::Bool
    }

    /// Bytes per element; `None` for variable-size types.
    pub fn size(self) -> Option<usize> {
        match self {
            DType::Int8 | DType::UInt8 | DType::Bool => Some(1),
            DType::Half | DType::Int16 | DType::UInt16 => Some(2),
            DType::Float | DType::Int32 | DType::UInt32 => Some(4),
            DType::Double | DType::Int64 | DType::UInt64 | DType::Complex64 => Some(8),
            DType::Complex128 => Some(16),
            DType::String | DType::Resource | DType::Variant => None,
        }
    }

    /// Types with an elementwise numeric representation in `HostTensor`.
    pub fn is_numeric(self) -> bool {
        self.is_floating() || self.is_integer() || self.is_unsigned()
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<DType> for String {
    fn from(d: DType) -> String {
        d.wire_name().to_string()
    }
}

impl TryFrom<String> for DType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        DType::parse(&s).ok_or_else(|| format!("unknown dtype '{}'", s))
    }
}

/// Render a type list as `int32, float32` for arity messages.
pub fn type_list(types: &[DType]) -> String {
    types
        .iter()
        .map(|t| t.name())
        .collect::<Vec<_>>()
        .join(", ")
}
