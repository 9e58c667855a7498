// error.rs — Error taxonomy for graph construction, import, tracing and execution
//
// Every variant carries a stable code (see `Error::code`) and an `ErrorClass`:
// structural errors abort the current import/trace and leave the destination
// graph in an unspecified state; policy errors leave all stores untouched;
// limit errors report resource ceilings.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::path::PathBuf;

use thiserror::Error;

use crate::diag::DiagCode;
use crate::dtype::DType;
use crate::registry::RegistryError;
use crate::shape::Shape;

/// Broad classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or incompatible input; never retried.
    Structural,
    /// Reuse/create conflicts and API misuse; user-recoverable.
    Policy,
    /// Resource or size ceilings.
    Limit,
}

#[derive(Debug, Error)]
pub enum Error {
    // ── Structural ──────────────────────────────────────────────────────
    #[error("duplicate node name '{name}' in graph")]
    DuplicateName { name: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("cannot convert '{text}' to a tensor name")]
    InvalidTensorName { text: String },

    #[error("input tensor '{input}' not found (consumer '{node}')")]
    MissingInput { node: String, input: String },

    #[error("control input '^{input}' not found (consumer '{node}')")]
    MissingControlInput { node: String, input: String },

    #[error(
        "input {index} of node {node} was passed {actual} from {source_tensor} incompatible with expected {expected}"
    )]
    InputTypeMismatch {
        node: String,
        index: usize,
        expected: DType,
        actual: DType,
        source_tensor: String,
    },

    #[error("input types mismatch for node '{node}' (expected '{expected}' but got '{actual}')")]
    ArityMismatch {
        node: String,
        expected: String,
        actual: String,
    },

    #[error("node '{node}' expects to be colocated with unknown node '{target}'")]
    UnknownColocation { node: String, target: String },

    #[error(
        "graph producer version {producer} below min producer {min_producer} supported by this runtime; regenerate the graph"
    )]
    ProducerTooOld { producer: i32, min_producer: i32 },

    #[error(
        "graph min consumer version {min_consumer} above current version {current}; upgrade the runtime"
    )]
    ConsumerTooNew { min_consumer: i32, current: i32 },

    #[error("graph disallows consumer version {version}")]
    BadConsumer { version: i32 },

    #[error("attempted to map inputs that were not found in the graph definition: [{}]", .keys.join(", "))]
    UnmappedInputs { keys: Vec<String> },

    #[error("requested return element '{name}' not found in the graph definition")]
    ReturnElementNotFound { name: String },

    #[error("duplicate name '{name}' in graph definition")]
    DuplicateNodeDef { name: String },

    #[error("op type '{op}' of node '{node}' is not registered")]
    UnknownOp { node: String, op: String },

    #[error("node '{node}' has no attr named '{attr}'")]
    MissingAttr { node: String, attr: String },

    #[error("node '{node}' mentions attr '{attr}' not in op '{op}'")]
    UnknownAttr {
        node: String,
        op: String,
        attr: String,
    },

    #[error("attr '{attr}' of node '{node}' is not a {expected}")]
    AttrType {
        node: String,
        attr: String,
        expected: &'static str,
    },

    #[error("parse error: {message}")]
    Parse { message: String },

    #[error("graph contains a cycle through [{}]", .nodes.join(", "))]
    Cycle { nodes: Vec<String> },

    #[error("branches of '{node}' disagree: {detail}")]
    BranchMismatch { node: String, detail: String },

    #[error("error executing node '{node}': {message}")]
    Execution { node: String, message: String },

    #[error("invalid device specification '{spec}'")]
    InvalidDevice { spec: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed JSON graph: {0}")]
    Json(#[from] serde_json::Error),

    // ── Policy ──────────────────────────────────────────────────────────
    #[error(
        "variable {name} already exists, disallowed. Did you mean to set reuse=True or reuse=AUTO in the variable scope? Originally defined at: {site}"
    )]
    VariableExists { name: String, site: String },

    #[error(
        "variable {name} does not exist, or was not created with get_variable(). Did you mean to set reuse=AUTO in the variable scope?"
    )]
    VariableNotFound { name: String },

    #[error("trying to share variable {name}, but specified shape {requested} and found shape {existing}")]
    VariableShapeMismatch {
        name: String,
        requested: Shape,
        existing: Shape,
    },

    #[error("trying to share variable {name}, but specified dtype {requested} and found dtype {existing}")]
    VariableDTypeMismatch {
        name: String,
        requested: DType,
        existing: DType,
    },

    #[error("shape of a new variable ({name}) must be fully defined, but instead was {shape}")]
    ShapeNotFullyDefined { name: String, shape: Shape },

    #[error("an initializer for variable {name} of {dtype} is required")]
    InitializerRequired { name: String, dtype: DType },

    #[error("if initializer is a constant, do not specify shape (variable {name})")]
    ConstantInitializerWithShape { name: String },

    #[error("initializer of variable {name} has dtype {initializer} but {requested} was requested")]
    InitializerDTypeMismatch {
        name: String,
        initializer: DType,
        requested: DType,
    },

    #[error("a partitioner was provided, but an unpartitioned version of the variable was found: {name}")]
    PartitionedExpected { name: String },

    #[error("no partitioner was provided, but a partitioned version of the variable was found: {name}/part_0")]
    UnpartitionedExpected { name: String },

    #[error("trying to reuse partitioned variable {name}, but specified {requested} and found {existing}")]
    PartitionMismatch {
        name: String,
        requested: String,
        existing: String,
    },

    #[error("invalid partitioning of variable {name}: {message}")]
    InvalidPartition { name: String, message: String },

    #[error("partitioned variable with name {name} already exists. Did you mean to set reuse=True or reuse=AUTO in the variable scope?")]
    PartitionedVariableExists { name: String },

    #[error("partitioned variable {name} does not exist, or was not created with get_variable()")]
    PartitionedVariableNotFound { name: String },

    #[error("partitioned variable {name} has inconsistent shards: {message}")]
    PartitionShardMismatch { name: String, message: String },

    #[error("invalid reuse: {message}")]
    InvalidReuse { message: String },

    #[error(
        "function '{function}' modified the structure of its {container} argument; functions to be traced should not modify input arguments in place (for example push, pop or insert on a list or map argument)"
    )]
    InputMutation {
        function: String,
        container: &'static str,
    },

    #[error("inputs to '{function}' incompatible with input signature: {message}")]
    SignatureMismatch { function: String, message: String },

    #[error(
        "structure of inputs to '{function}' does not match input signature (expected {expected} arguments, got {actual})"
    )]
    SignatureStructure {
        function: String,
        expected: usize,
        actual: usize,
    },

    #[error("when an input signature is provided, all inputs to '{function}' must be tensors (argument '{param}' is not)")]
    NonTensorWithSignature { function: String, param: String },

    #[error("cannot define '{function}' with keyword or variadic parameters when an input signature is provided")]
    KeywordParamsWithSignature { function: String },

    #[error("parameter '{param}' of '{function}' cannot have a default value when an input signature is provided")]
    DefaultWithSignature { function: String, param: String },

    #[error("cannot bind arguments of '{function}': {message}")]
    ArgumentBinding { function: String, message: String },

    // ── Limit ───────────────────────────────────────────────────────────
    #[error("graph definition of {bytes} bytes exceeds the hard limit of {limit} bytes")]
    GraphTooLarge { bytes: usize, limit: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn class(&self) -> ErrorClass {
        use Error::*;
        match self {
            VariableExists { .. }
            | VariableNotFound { .. }
            | VariableShapeMismatch { .. }
            | VariableDTypeMismatch { .. }
            | ShapeNotFullyDefined { .. }
            | InitializerRequired { .. }
            | ConstantInitializerWithShape { .. }
            | InitializerDTypeMismatch { .. }
            | PartitionedExpected { .. }
            | UnpartitionedExpected { .. }
            | PartitionMismatch { .. }
            | InvalidPartition { .. }
            | PartitionedVariableExists { .. }
            | PartitionedVariableNotFound { .. }
            | PartitionShardMismatch { .. }
            | InvalidReuse { .. }
            | InputMutation { .. }
            | SignatureMismatch { .. }
            | SignatureStructure { .. }
            | NonTensorWithSignature { .. }
            | KeywordParamsWithSignature { .. }
            | DefaultWithSignature { .. }
            | ArgumentBinding { .. } => ErrorClass::Policy,
            GraphTooLarge { .. } => ErrorClass::Limit,
            _ => ErrorClass::Structural,
        }
    }

    /// Stable code. Once assigned a code keeps its meaning.
    pub fn code(&self) -> DiagCode {
        use Error::*;
        DiagCode(match self {
            DuplicateName { .. } => "E0101",
            NotFound { .. } => "E0102",
            InvalidTensorName { .. } => "E0103",
            MissingInput { .. } => "E0104",
            MissingControlInput { .. } => "E0105",
            InputTypeMismatch { .. } => "E0106",
            ArityMismatch { .. } => "E0107",
            UnknownColocation { .. } => "E0108",
            ProducerTooOld { .. } => "E0109",
            ConsumerTooNew { .. } => "E0110",
            BadConsumer { .. } => "E0111",
            UnmappedInputs { .. } => "E0112",
            ReturnElementNotFound { .. } => "E0113",
            DuplicateNodeDef { .. } => "E0114",
            UnknownOp { .. } => "E0115",
            MissingAttr { .. } => "E0116",
            UnknownAttr { .. } => "E0117",
            AttrType { .. } => "E0118",
            Parse { .. } => "E0119",
            Cycle { .. } => "E0120",
            BranchMismatch { .. } => "E0121",
            Execution { .. } => "E0122",
            InvalidDevice { .. } => "E0123",
            InvalidArgument { .. } => "E0124",
            Registry(_) => "E0125",
            Io { .. } => "E0126",
            Json(_) => "E0127",
            VariableExists { .. } => "E0201",
            VariableNotFound { .. } => "E0202",
            VariableShapeMismatch { .. } => "E0203",
            VariableDTypeMismatch { .. } => "E0204",
            ShapeNotFullyDefined { .. } => "E0205",
            InitializerRequired { .. } => "E0206",
            ConstantInitializerWithShape { .. } => "E0207",
            InitializerDTypeMismatch { .. } => "E0208",
            PartitionedExpected { .. } => "E0209",
            UnpartitionedExpected { .. } => "E0210",
            PartitionMismatch { .. } => "E0211",
            InvalidPartition { .. } => "E0212",
            PartitionedVariableExists { .. } => "E0213",
            PartitionedVariableNotFound { .. } => "E0214",
            PartitionShardMismatch { .. } => "E0215",
            InvalidReuse { .. } => "E0216",
            InputMutation { .. } => "E0217",
            SignatureMismatch { .. } => "E0218",
            SignatureStructure { .. } => "E0219",
            NonTensorWithSignature { .. } => "E0220",
            KeywordParamsWithSignature { .. } => "E0221",
            ArgumentBinding { .. } => "E0222",
            DefaultWithSignature { .. } => "E0223",
            GraphTooLarge { .. } => "E0301",
        })
    }

    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn exec(node: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Execution {
            node: node.into(),
            message: message.into(),
        }
    }
}
