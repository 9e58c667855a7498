// variable_scope.rs — Variable scopes and custom getter chains
//
// A scope carries the name prefix of the variables created inside it, the
// defaults those variables inherit, and the reuse policy. Entering a scope
// derives a child from its parent (or from a captured scope object); the
// graph builder owns entering and leaving.

use std::fmt;
use std::sync::Arc;

use crate::dtype::DType;
use crate::error::Result;
use crate::init::Initializer;
use crate::partition::Partitioner;
use crate::regularizer::Regularizer;
use crate::variable::{Reuse, VariableRef, VariableRequest};

/// `custom_getter(true_getter, request)`. The getter may call `true_getter`
/// any number of times, with modified requests.
pub type CustomGetter = Arc<
    dyn Fn(&mut dyn FnMut(VariableRequest) -> Result<VariableRef>, VariableRequest) -> Result<VariableRef>
        + Send
        + Sync,
>;

/// Wrap a closure as a `CustomGetter`.
pub fn custom_getter<F>(f: F) -> CustomGetter
where
    F: Fn(&mut dyn FnMut(VariableRequest) -> Result<VariableRef>, VariableRequest) -> Result<VariableRef>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// A chain of custom getters. A getter entered over an existing chain becomes
/// the outer stage; its true getter runs the inner chain.
#[derive(Clone)]
pub enum GetterStage {
    Plain(CustomGetter),
    Wrapped {
        outer: CustomGetter,
        inner: Box<GetterStage>,
    },
}

impl GetterStage {
    pub fn wrap(self, outer: CustomGetter) -> GetterStage {
        GetterStage::Wrapped {
            outer,
            inner: Box::new(self),
        }
    }

    pub fn run(
        &self,
        true_getter: &mut dyn FnMut(VariableRequest) -> Result<VariableRef>,
        req: VariableRequest,
    ) -> Result<VariableRef> {
        match self {
            GetterStage::Plain(getter) => getter(true_getter, req),
            GetterStage::Wrapped { outer, inner } => {
                let mut delegate = |r: VariableRequest| inner.run(&mut *true_getter, r);
                outer(&mut delegate, req)
            }
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            GetterStage::Plain(_) => 1,
            GetterStage::Wrapped { inner, .. } => 1 + inner.depth(),
        }
    }
}

impl fmt::Debug for GetterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GetterStage(depth {})", self.depth())
    }
}

#[derive(Clone, Default)]
pub struct VariableScope {
    /// Full name; empty for the root scope.
    pub name: String,
    /// Name scope opened when this scope was first entered, with a trailing `/`.
    pub original_name_scope: String,
    pub reuse: Reuse,
    pub initializer: Option<Initializer>,
    pub regularizer: Option<Regularizer>,
    pub partitioner: Option<Arc<dyn Partitioner>>,
    pub custom_getter: Option<GetterStage>,
    pub dtype: Option<DType>,
    pub use_resource: Option<bool>,
}

impl VariableScope {
    pub fn root() -> Self {
        Self::default()
    }

    /// `name` qualified by this scope.
    pub fn full_name(&self, name: &str) -> String {
        if self.name.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.name, name)
        }
    }

    /// Child of `self` named `name`, with `options` applied over the inherited defaults.
    pub(crate) fn derive(&self, name: String, name_scope: String, options: &ScopeOptions) -> VariableScope {
        let reuse = match options.reuse {
            Some(r @ (Reuse::ReuseOnly | Reuse::Auto)) => r,
            _ => self.reuse,
        };
        let custom_getter = match (&options.custom_getter, &self.custom_getter) {
            (Some(new), Some(old)) => Some(old.clone().wrap(new.clone())),
            (Some(new), None) => Some(GetterStage::Plain(new.clone())),
            (None, old) => old.clone(),
        };
        VariableScope {
            name,
            original_name_scope: name_scope,
            reuse,
            initializer: options.initializer.clone().or_else(|| self.initializer.clone()),
            regularizer: options.regularizer.clone().or_else(|| self.regularizer.clone()),
            partitioner: options.partitioner.clone().or_else(|| self.partitioner.clone()),
            custom_getter,
            dtype: options.dtype.or(self.dtype),
            use_resource: options.use_resource.or(self.use_resource),
        }
    }
}

impl fmt::Debug for VariableScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableScope")
            .field("name", &self.name)
            .field("original_name_scope", &self.original_name_scope)
            .field("reuse", &self.reuse)
            .field("initializer", &self.initializer)
            .field("regularizer", &self.regularizer)
            .field("partitioned", &self.partitioner.is_some())
            .field("custom_getter", &self.custom_getter)
            .field("dtype", &self.dtype)
            .finish()
    }
}

/// What to enter.
#[derive(Debug, Clone)]
pub enum ScopeName {
    /// A name below the current scope; re-entering continues its counts.
    Named(String),
    /// A fresh name derived from a prefix (`dense`, `dense_1`, ...).
    Default(String),
    /// A scope object captured earlier; re-entered at its absolute name.
    Captured(VariableScope),
}

impl ScopeName {
    pub fn default_name(prefix: impl Into<String>) -> Self {
        ScopeName::Default(prefix.into())
    }
}

impl From<&str> for ScopeName {
    fn from(name: &str) -> Self {
        ScopeName::Named(name.to_string())
    }
}

impl From<String> for ScopeName {
    fn from(name: String) -> Self {
        ScopeName::Named(name)
    }
}

impl From<VariableScope> for ScopeName {
    fn from(scope: VariableScope) -> Self {
        ScopeName::Captured(scope)
    }
}

impl From<&VariableScope> for ScopeName {
    fn from(scope: &VariableScope) -> Self {
        ScopeName::Captured(scope.clone())
    }
}

/// Overrides applied when entering a scope. `reuse: Some(CreateOnly)` inherits.
#[derive(Clone, Default)]
pub struct ScopeOptions {
    pub reuse: Option<Reuse>,
    pub initializer: Option<Initializer>,
    pub regularizer: Option<Regularizer>,
    pub partitioner: Option<Arc<dyn Partitioner>>,
    pub custom_getter: Option<CustomGetter>,
    pub dtype: Option<DType>,
    pub use_resource: Option<bool>,
}

impl ScopeOptions {
    pub fn reuse(mut self, reuse: Reuse) -> Self {
        self.reuse = Some(reuse);
        self
    }

    pub fn initializer(mut self, init: Initializer) -> Self {
        self.initializer = Some(init);
        self
    }

    pub fn regularizer(mut self, reg: Regularizer) -> Self {
        self.regularizer = Some(reg);
        self
    }

    pub fn partitioner(mut self, p: impl Partitioner + 'static) -> Self {
        self.partitioner = Some(Arc::new(p));
        self
    }

    pub fn custom_getter(mut self, getter: CustomGetter) -> Self {
        self.custom_getter = Some(getter);
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn use_resource(mut self, flag: bool) -> Self {
        self.use_resource = Some(flag);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn full_names() {
        assert_eq!(VariableScope::root().full_name("v"), "v");
        let s = VariableScope::root().derive("a".into(), "a/".into(), &ScopeOptions::default());
        assert_eq!(s.full_name("v"), "a/v");
    }

    #[test]
    fn reuse_inherits_unless_set() {
        let root = VariableScope::root();
        let reusing = root.derive("a".into(), "a/".into(), &ScopeOptions::default().reuse(Reuse::ReuseOnly));
        assert_eq!(reusing.reuse, Reuse::ReuseOnly);
        // CreateOnly on a scope means inherit.
        let child = reusing.derive(
            "a/b".into(),
            "a/b/".into(),
            &ScopeOptions::default().reuse(Reuse::CreateOnly),
        );
        assert_eq!(child.reuse, Reuse::ReuseOnly);
    }

    #[test]
    fn getters_compose_outer_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tagging = |tag: &'static str, log: Arc<Mutex<Vec<&'static str>>>| {
            custom_getter(move |next, req| {
                log.lock().unwrap().push(tag);
                next(req)
            })
        };
        let root = VariableScope::root();
        let a = root.derive(
            "a".into(),
            "a/".into(),
            &ScopeOptions::default().custom_getter(tagging("old", log.clone())),
        );
        let b = a.derive(
            "a/b".into(),
            "a/b/".into(),
            &ScopeOptions::default().custom_getter(tagging("new", log.clone())),
        );
        let stage = b.custom_getter.unwrap();
        assert_eq!(stage.depth(), 2);
        let mut true_getter = |_req: VariableRequest| -> Result<VariableRef> {
            log.lock().unwrap().push("true");
            Err(crate::error::Error::invalid("stop"))
        };
        assert!(stage.run(&mut true_getter, VariableRequest::new("v")).is_err());
        assert_eq!(*log.lock().unwrap(), vec!["new", "old", "true"]);
    }
}
