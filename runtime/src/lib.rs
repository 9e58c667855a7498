// tfg — Traced Function Graphs
//
// Library root. A `Runtime` owns the op registry, kernels and variable
// store; `GraphBuilder` records operations into a `Graph`; `function`
// traces callables into cached function graphs; `import` merges serialized
// graph definitions; `exec` evaluates graphs on host tensors.

pub mod attr;
pub mod builder;
pub mod collections;
pub mod control_deps;
pub mod device;
pub mod diag;
pub mod dot;
pub mod dtype;
pub mod error;
pub mod exec;
pub mod fingerprint;
pub mod function;
pub mod graph;
pub mod graph_def;
pub mod import;
pub mod init;
pub mod kernels;
pub mod lexer;
pub mod parser;
pub mod partition;
pub mod registry;
pub mod regularizer;
pub mod resource;
pub mod runtime;
pub mod shape;
pub mod tensor;
pub mod trace_cache;
pub mod value;
pub mod variable;
pub mod variable_scope;

pub use builder::GraphBuilder;
pub use error::{Error, Result};
pub use function::{Param, TracedFunction};
pub use runtime::{Runtime, RuntimeConfig};
pub use value::{TensorSpec, Value};
