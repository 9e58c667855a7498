// collections.rs — Named collections of variables and tensors

use std::fmt;
use std::sync::Arc;

use crate::graph::TensorRef;
use crate::variable::Variable;

pub const GLOBAL_VARIABLES: &str = "variables";
pub const TRAINABLE_VARIABLES: &str = "trainable_variables";
pub const LOCAL_VARIABLES: &str = "local_variables";
pub const REGULARIZATION_LOSSES: &str = "regularization_losses";

#[derive(Debug, Clone)]
pub enum CollectionItem {
    Variable(Arc<Variable>),
    /// A tensor recorded on behalf of a variable, e.g. its regularization penalty.
    Tensor { variable: String, tensor: TensorRef },
}

impl CollectionItem {
    /// Name matched against scope filters.
    pub fn name(&self) -> &str {
        match self {
            CollectionItem::Variable(v) => &v.name,
            CollectionItem::Tensor { tensor, .. } => &tensor.node,
        }
    }

    pub fn as_variable(&self) -> Option<&Arc<Variable>> {
        match self {
            CollectionItem::Variable(v) => Some(v),
            CollectionItem::Tensor { .. } => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorRef> {
        match self {
            CollectionItem::Tensor { tensor, .. } => Some(tensor),
            CollectionItem::Variable(_) => None,
        }
    }
}

impl fmt::Display for CollectionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionItem::Variable(v) => write!(f, "{}", v),
            CollectionItem::Tensor { variable, tensor } => write!(f, "{} (for {})", tensor, variable),
        }
    }
}

/// `true` when `name` lies under `scope`; no scope matches everything.
pub fn in_scope(name: &str, scope: Option<&str>) -> bool {
    match scope {
        None | Some("") => true,
        Some(s) => name.starts_with(s),
    }
}
