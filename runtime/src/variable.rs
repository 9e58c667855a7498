// variable.rs — Variables and the store that creates and shares them
//
// The store maps full names to variables and partitioned variables and counts
// how often each variable scope name has been entered. All lookups and
// creations of one request happen under a single lock, so concurrent requests
// for one full name yield exactly one variable.
//
// Preconditions: `VariableRequest::name` is the full (scope-qualified) name.
// Postconditions: a name is bound to at most one of {variable, partitioned
//                 variable}; a reused variable is returned untouched.
// Failure modes: reuse/create conflicts, shape/dtype mismatches, missing
//                initializers and bad partitions → policy errors. A failed
//                request leaves the store unchanged.
// Side effects: initial values of created variables are written to the
//               resource manager.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::collections::{in_scope, GLOBAL_VARIABLES, TRAINABLE_VARIABLES};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::init::Initializer;
use crate::partition::{
    compute_slices, shard_name, slice_dim_and_count, PartitionInfo, PartitionedVariable, Partitioner,
};
use crate::regularizer::Regularizer;
use crate::resource::ResourceManager;
use crate::shape::Shape;
use crate::tensor::HostTensor;
use crate::variable_scope::CustomGetter;

// ── Variables ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Variable {
    pub name: String,
    pub shape: Vec<i64>,
    pub dtype: DType,
    pub initial_value: HostTensor,
    pub trainable: bool,
    pub collections: Vec<String>,
    pub created_at: &'static Location<'static>,
    /// Set when this variable is one shard of a partitioned variable.
    pub partition: Option<PartitionInfo>,
    pub use_resource: bool,
}

impl Variable {
    pub fn static_shape(&self) -> Shape {
        Shape::from_dims(&self.shape)
    }

    pub fn site(&self) -> String {
        format!("{}:{}", self.created_at.file(), self.created_at.line())
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (shape {}, dtype {})", self.name, self.static_shape(), self.dtype)
    }
}

/// A variable as returned by `get_variable`.
#[derive(Debug, Clone)]
pub enum VariableRef {
    Single(Arc<Variable>),
    Partitioned(Arc<PartitionedVariable>),
}

impl VariableRef {
    pub fn name(&self) -> &str {
        match self {
            VariableRef::Single(v) => &v.name,
            VariableRef::Partitioned(p) => &p.name,
        }
    }

    pub fn static_shape(&self) -> Shape {
        match self {
            VariableRef::Single(v) => v.static_shape(),
            VariableRef::Partitioned(p) => p.shape(),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            VariableRef::Single(v) => v.dtype,
            VariableRef::Partitioned(p) => p.dtype,
        }
    }

    pub fn as_single(&self) -> Option<&Arc<Variable>> {
        match self {
            VariableRef::Single(v) => Some(v),
            VariableRef::Partitioned(_) => None,
        }
    }

    pub fn as_partitioned(&self) -> Option<&Arc<PartitionedVariable>> {
        match self {
            VariableRef::Partitioned(p) => Some(p),
            VariableRef::Single(_) => None,
        }
    }

    /// The variable itself, or the shards in order.
    pub fn variables(&self) -> Vec<Arc<Variable>> {
        match self {
            VariableRef::Single(v) => vec![v.clone()],
            VariableRef::Partitioned(p) => p.shards.clone(),
        }
    }

    /// Same underlying object.
    pub fn same_as(&self, other: &VariableRef) -> bool {
        match (self, other) {
            (VariableRef::Single(a), VariableRef::Single(b)) => Arc::ptr_eq(a, b),
            (VariableRef::Partitioned(a), VariableRef::Partitioned(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableRef::Single(v) => write!(f, "{}", v),
            VariableRef::Partitioned(p) => write!(f, "{}", p),
        }
    }
}

// ── Requests ────────────────────────────────────────────────────────────────

/// Create/reuse policy of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reuse {
    /// Fail if the variable exists.
    #[default]
    CreateOnly,
    /// Fail if the variable does not exist.
    ReuseOnly,
    /// Create if absent, return if present.
    Auto,
}

#[derive(Clone)]
pub struct VariableRequest {
    pub name: String,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
    pub initializer: Option<Initializer>,
    pub regularizer: Option<Regularizer>,
    /// `None` inherits the enclosing scope's policy.
    pub reuse: Option<Reuse>,
    pub trainable: bool,
    /// `None` means the global variables collection.
    pub collections: Option<Vec<String>>,
    pub partitioner: Option<Arc<dyn Partitioner>>,
    pub custom_getter: Option<CustomGetter>,
    pub use_resource: Option<bool>,
    pub site: &'static Location<'static>,
}

impl VariableRequest {
    #[track_caller]
    pub fn new(name: impl Into<String>) -> Self {
        VariableRequest {
            name: name.into(),
            shape: None,
            dtype: None,
            initializer: None,
            regularizer: None,
            reuse: None,
            trainable: true,
            collections: None,
            partitioner: None,
            custom_getter: None,
            use_resource: None,
            site: Location::caller(),
        }
    }

    pub fn shape(mut self, dims: &[i64]) -> Self {
        self.shape = Some(Shape::from_dims(dims));
        self
    }

    /// A shape with unknown (`-1`) dimensions.
    pub fn partial_shape(mut self, shape: Shape) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
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

    pub fn reuse(mut self, reuse: Reuse) -> Self {
        self.reuse = Some(reuse);
        self
    }

    pub fn trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    pub fn collections(mut self, keys: &[&str]) -> Self {
        self.collections = Some(keys.iter().map(|k| k.to_string()).collect());
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

    pub fn use_resource(mut self, flag: bool) -> Self {
        self.use_resource = Some(flag);
        self
    }
}

impl fmt::Debug for VariableRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableRequest")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("initializer", &self.initializer)
            .field("reuse", &self.reuse)
            .field("trainable", &self.trainable)
            .field("partitioned", &self.partitioner.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of a store lookup: the variable plus whatever was newly created
/// (the variable itself, or some or all of its shards).
#[derive(Debug)]
pub struct Acquired {
    pub variable: VariableRef,
    pub created: Vec<Arc<Variable>>,
}

// ── Store ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct StoreState {
    vars: BTreeMap<String, Arc<Variable>>,
    partitioned: BTreeMap<String, Arc<PartitionedVariable>>,
    scope_counts: HashMap<String, usize>,
    collections: BTreeMap<String, Vec<Arc<Variable>>>,
    regularized: Vec<(Arc<Variable>, Regularizer)>,
}

/// A shard found or prepared while resolving a partitioned request.
enum Shard {
    Existing(Arc<Variable>),
    New(Variable),
}

pub struct VariableStore {
    default_dtype: DType,
    state: Mutex<StoreState>,
}

impl VariableStore {
    pub fn new(default_dtype: DType) -> Self {
        VariableStore {
            default_dtype,
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the variable `req.name`, creating it according to `req.reuse`.
    pub fn get_variable(&self, req: &VariableRequest, resources: &ResourceManager) -> Result<Acquired> {
        let mut state = self.lock();
        let name = req.name.as_str();
        let reuse = req.reuse.unwrap_or_default();
        let init_value = req.initializer.as_ref().and_then(Initializer::value);
        if init_value.is_some() && req.shape.is_some() {
            return Err(Error::ConstantInitializerWithShape {
                name: name.to_string(),
            });
        }
        let dtype = req
            .dtype
            .or(init_value.map(|t| t.dtype))
            .unwrap_or(self.default_dtype);
        let shape = match init_value {
            Some(v) => Some(v.static_shape()),
            None => req.shape.clone(),
        };
        let is_scalar = shape.as_ref().is_some_and(Shape::is_scalar);

        if req.partitioner.is_some() && !is_scalar {
            return self.get_partitioned(&mut state, req, shape, dtype, reuse, resources);
        }
        if reuse == Reuse::ReuseOnly && req.partitioner.is_none() && state.partitioned.contains_key(name) {
            return self.get_partitioned(&mut state, req, shape, dtype, reuse, resources);
        }
        if state.vars.contains_key(&shard_name(name, 0)) {
            return Err(Error::UnpartitionedExpected {
                name: name.to_string(),
            });
        }

        if let Some(found) = lookup_single(&state, name, shape.as_ref(), dtype, reuse)? {
            tracing::trace!(name, "reusing variable");
            return Ok(Acquired {
                variable: VariableRef::Single(found),
                created: Vec::new(),
            });
        }
        let var = self.new_variable(req, name, shape.as_ref(), dtype, None)?;
        let var = commit(&mut state, var, resources);
        tracing::debug!(name, shape = %var.static_shape(), dtype = %dtype, "created variable");
        Ok(Acquired {
            variable: VariableRef::Single(var.clone()),
            created: vec![var],
        })
    }

    fn get_partitioned(
        &self,
        state: &mut StoreState,
        req: &VariableRequest,
        shape: Option<Shape>,
        dtype: DType,
        reuse: Reuse,
        resources: &ResourceManager,
    ) -> Result<Acquired> {
        let name = req.name.as_str();
        let reuse_without_partition = reuse == Reuse::ReuseOnly && req.partitioner.is_none();
        if state.vars.contains_key(name) {
            return Err(Error::PartitionedExpected {
                name: name.to_string(),
            });
        }

        let mut layout = None;
        if let Some(partitioner) = req.partitioner.as_ref().filter(|_| !reuse_without_partition) {
            let full = shape
                .as_ref()
                .filter(|s| s.is_fully_defined())
                .and_then(Shape::to_vec)
                .ok_or_else(|| Error::ShapeNotFullyDefined {
                    name: name.to_string(),
                    shape: shape.clone().unwrap_or_default(),
                })?;
            let counts = partitioner.partition(&full, dtype)?;
            slice_dim_and_count(name, &full, &counts)?;
            layout = Some((full, counts));
        }

        if let Some(existing) = state.partitioned.get(name) {
            if reuse == Reuse::CreateOnly {
                return Err(Error::PartitionedVariableExists {
                    name: name.to_string(),
                });
            }
            let mismatch = |requested: String, found: String| Error::PartitionMismatch {
                name: name.to_string(),
                requested,
                existing: found,
            };
            if let Some(s) = shape.as_ref().filter(|s| !s.is_compatible_with(&existing.shape())) {
                return Err(mismatch(format!("shape {}", s), format!("shape {}", existing.shape())));
            }
            if dtype != existing.dtype {
                return Err(mismatch(format!("dtype {}", dtype), format!("dtype {}", existing.dtype)));
            }
            if let Some((_, counts)) = layout.as_ref().filter(|(_, c)| *c != existing.partitions) {
                return Err(mismatch(
                    format!("partitions {:?}", counts),
                    format!("partitions {:?}", existing.partitions),
                ));
            }
            return Ok(Acquired {
                variable: VariableRef::Partitioned(existing.clone()),
                created: Vec::new(),
            });
        }
        if reuse == Reuse::ReuseOnly {
            return Err(Error::PartitionedVariableNotFound {
                name: name.to_string(),
            });
        }
        let Some((full, counts)) = layout else {
            return Err(Error::PartitionedVariableNotFound {
                name: name.to_string(),
            });
        };

        let slices = compute_slices(name, &full, &counts)?;
        let n = slices.len();
        if state.vars.contains_key(&shard_name(name, 0)) {
            if !state.vars.contains_key(&shard_name(name, n - 1)) {
                return Err(Error::PartitionShardMismatch {
                    name: name.to_string(),
                    message: format!(
                        "expected {} shards, but {} was not found",
                        n,
                        shard_name(name, n - 1)
                    ),
                });
            }
            if state.vars.contains_key(&shard_name(name, n)) {
                return Err(Error::PartitionShardMismatch {
                    name: name.to_string(),
                    message: format!("expected {} shards, but {} exists", n, shard_name(name, n)),
                });
            }
        }

        let mut staged = Vec::with_capacity(n);
        for (i, slice) in slices.iter().enumerate() {
            let shard = shard_name(name, i);
            let shard_shape = Shape::from_dims(&slice.shape);
            match lookup_single(state, &shard, Some(&shard_shape), dtype, reuse)? {
                Some(existing) => staged.push(Shard::Existing(existing)),
                None => {
                    let info = PartitionInfo {
                        full_shape: full.clone(),
                        var_offset: slice.offset.clone(),
                    };
                    let var = self.new_variable(req, &shard, Some(&shard_shape), dtype, Some(info))?;
                    staged.push(Shard::New(var));
                }
            }
        }

        let mut shards = Vec::with_capacity(n);
        let mut created = Vec::new();
        for shard in staged {
            match shard {
                Shard::Existing(v) => shards.push(v),
                Shard::New(v) => {
                    let v = commit(state, v, resources);
                    created.push(v.clone());
                    shards.push(v);
                }
            }
        }
        let pv = Arc::new(PartitionedVariable {
            name: name.to_string(),
            full_shape: full,
            dtype,
            partitions: counts,
            shards,
        });
        state.partitioned.insert(name.to_string(), pv.clone());
        tracing::debug!(name, shards = n, "created partitioned variable");
        Ok(Acquired {
            variable: VariableRef::Partitioned(pv),
            created,
        })
    }

    fn new_variable(
        &self,
        req: &VariableRequest,
        name: &str,
        shape: Option<&Shape>,
        dtype: DType,
        partition: Option<PartitionInfo>,
    ) -> Result<Variable> {
        let initializer = match &req.initializer {
            Some(init) => init.clone(),
            None => Initializer::default_for(dtype).ok_or_else(|| Error::InitializerRequired {
                name: name.to_string(),
                dtype,
            })?,
        };
        if let Some(v) = initializer.value().filter(|v| v.dtype != dtype) {
            return Err(Error::InitializerDTypeMismatch {
                name: name.to_string(),
                initializer: v.dtype,
                requested: dtype,
            });
        }
        let dims = shape
            .filter(|s| s.is_fully_defined())
            .and_then(Shape::to_vec)
            .ok_or_else(|| Error::ShapeNotFullyDefined {
                name: name.to_string(),
                shape: shape.cloned().unwrap_or_default(),
            })?;
        let initial_value = initializer.initialize(&dims, dtype, partition.as_ref())?;

        let mut collections = req
            .collections
            .clone()
            .unwrap_or_else(|| vec![GLOBAL_VARIABLES.to_string()]);
        if req.trainable && !collections.iter().any(|c| c == TRAINABLE_VARIABLES) {
            collections.push(TRAINABLE_VARIABLES.to_string());
        }
        Ok(Variable {
            name: name.to_string(),
            shape: dims,
            dtype,
            initial_value,
            trainable: req.trainable,
            collections,
            created_at: req.site,
            partition,
            use_resource: req.use_resource.unwrap_or(true),
        })
    }

    // ── Queries ──

    pub fn variable(&self, name: &str) -> Option<Arc<Variable>> {
        self.lock().vars.get(name).cloned()
    }

    pub fn partitioned_variable(&self, name: &str) -> Option<Arc<PartitionedVariable>> {
        self.lock().partitioned.get(name).cloned()
    }

    /// Every variable, shards included, sorted by name.
    pub fn variables(&self) -> Vec<Arc<Variable>> {
        self.lock().vars.values().cloned().collect()
    }

    /// Members of collection `key` in creation order, filtered by name prefix.
    pub fn collection(&self, key: &str, scope: Option<&str>) -> Vec<Arc<Variable>> {
        self.lock()
            .collections
            .get(key)
            .map(|vars| {
                vars.iter()
                    .filter(|v| in_scope(&v.name, scope))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Note that `var` carries a regularization penalty. Any graph can then
    /// rebuild it, including graphs other than the one that created `var`.
    pub fn record_regularizer(&self, var: Arc<Variable>, regularizer: Regularizer) {
        let mut state = self.lock();
        if !state.regularized.iter().any(|(v, _)| v.name == var.name) {
            state.regularized.push((var, regularizer));
        }
    }

    /// Regularized variables in creation order, filtered by name prefix.
    pub fn regularized(&self, scope: Option<&str>) -> Vec<(Arc<Variable>, Regularizer)> {
        self.lock()
            .regularized
            .iter()
            .filter(|(v, _)| in_scope(&v.name, scope))
            .cloned()
            .collect()
    }

    // ── Scope counts ──

    pub fn open_scope(&self, name: &str) {
        *self.lock().scope_counts.entry(name.to_string()).or_default() += 1;
    }

    /// Zero the counts of every scope below `name` (all scopes for the root).
    pub fn close_subscopes(&self, name: &str) {
        let prefix = format!("{}/", name);
        for (scope, count) in self.lock().scope_counts.iter_mut() {
            if name.is_empty() || scope.starts_with(&prefix) {
                *count = 0;
            }
        }
    }

    pub fn scope_count(&self, name: &str) -> usize {
        self.lock().scope_counts.get(name).copied().unwrap_or(0)
    }

    pub fn snapshot_counts(&self) -> HashMap<String, usize> {
        self.lock().scope_counts.clone()
    }

    pub fn restore_counts(&self, counts: HashMap<String, usize>) {
        self.lock().scope_counts = counts;
    }

    /// First of `name`, `name_1`, `name_2`, ... never entered as a scope.
    pub fn unique_scope_name(&self, name: &str) -> String {
        let state = self.lock();
        let count = |n: &str| state.scope_counts.get(n).copied().unwrap_or(0);
        if count(name) == 0 {
            return name.to_string();
        }
        let mut i = 1;
        while count(&format!("{}_{}", name, i)) > 0 {
            i += 1;
        }
        format!("{}_{}", name, i)
    }
}

fn lookup_single(
    state: &StoreState,
    name: &str,
    shape: Option<&Shape>,
    dtype: DType,
    reuse: Reuse,
) -> Result<Option<Arc<Variable>>> {
    let Some(found) = state.vars.get(name) else {
        if reuse == Reuse::ReuseOnly {
            return Err(Error::VariableNotFound {
                name: name.to_string(),
            });
        }
        return Ok(None);
    };
    if reuse == Reuse::CreateOnly {
        return Err(Error::VariableExists {
            name: name.to_string(),
            site: found.site(),
        });
    }
    if let Some(s) = shape.filter(|s| !s.is_compatible_with(&found.static_shape())) {
        return Err(Error::VariableShapeMismatch {
            name: name.to_string(),
            requested: s.clone(),
            existing: found.static_shape(),
        });
    }
    if dtype != found.dtype {
        return Err(Error::VariableDTypeMismatch {
            name: name.to_string(),
            requested: dtype,
            existing: found.dtype,
        });
    }
    Ok(Some(found.clone()))
}

fn commit(state: &mut StoreState, var: Variable, resources: &ResourceManager) -> Arc<Variable> {
    resources.create(&var.name, var.initial_value.clone());
    let var = Arc::new(var);
    for key in &var.collections {
        state
            .collections
            .entry(key.clone())
            .or_default()
            .push(var.clone());
    }
    state.vars.insert(var.name.clone(), var.clone());
    var
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::FixedSizePartitioner;

    fn store() -> (VariableStore, ResourceManager) {
        (VariableStore::new(DType::Float), ResourceManager::new())
    }

    #[test]
    fn auto_returns_the_same_variable() {
        let (s, rm) = store();
        let req = VariableRequest::new("v").shape(&[2]).reuse(Reuse::Auto);
        let a = s.get_variable(&req, &rm).unwrap();
        let b = s.get_variable(&req, &rm).unwrap();
        assert!(a.variable.same_as(&b.variable));
        assert_eq!(a.created.len(), 1);
        assert!(b.created.is_empty());
        assert!(rm.contains("v"));
    }

    #[test]
    fn create_only_twice_names_the_site() {
        let (s, rm) = store();
        let req = VariableRequest::new("v").shape(&[1]);
        s.get_variable(&req, &rm).unwrap();
        let err = s.get_variable(&req, &rm).unwrap_err();
        assert!(matches!(&err, Error::VariableExists { site, .. } if site.contains("variable.rs")));
    }

    #[test]
    fn reuse_only_requires_existing() {
        let (s, rm) = store();
        let err = s
            .get_variable(&VariableRequest::new("v").reuse(Reuse::ReuseOnly), &rm)
            .unwrap_err();
        assert!(matches!(err, Error::VariableNotFound { .. }));
    }

    #[test]
    fn reuse_checks_shape_and_dtype() {
        let (s, rm) = store();
        s.get_variable(&VariableRequest::new("v").shape(&[3]), &rm).unwrap();
        let err = s
            .get_variable(&VariableRequest::new("v").shape(&[2]).reuse(Reuse::Auto), &rm)
            .unwrap_err();
        assert!(matches!(err, Error::VariableShapeMismatch { .. }));
        let err = s
            .get_variable(
                &VariableRequest::new("v").dtype(DType::Int32).reuse(Reuse::Auto),
                &rm,
            )
            .unwrap_err();
        assert!(matches!(err, Error::VariableDTypeMismatch { .. }));
        // An unknown dimension is compatible.
        s.get_variable(
            &VariableRequest::new("v")
                .partial_shape(Shape::from_partial(&[-1]))
                .reuse(Reuse::Auto),
            &rm,
        )
        .unwrap();
    }

    #[test]
    fn creation_needs_a_full_shape_and_an_initializer() {
        let (s, rm) = store();
        let err = s
            .get_variable(&VariableRequest::new("v").partial_shape(Shape::from_partial(&[-1, 2])), &rm)
            .unwrap_err();
        assert!(matches!(err, Error::ShapeNotFullyDefined { .. }));
        let err = s
            .get_variable(&VariableRequest::new("s").shape(&[1]).dtype(DType::String), &rm)
            .unwrap_err();
        assert!(matches!(err, Error::InitializerRequired { .. }));
        assert!(s.variables().is_empty());
    }

    #[test]
    fn value_initializer_supplies_the_shape() {
        let (s, rm) = store();
        let value = HostTensor::from_i32(&[2], &[4, 5]).unwrap();
        let got = s
            .get_variable(&VariableRequest::new("c").initializer(Initializer::Value(value.clone())), &rm)
            .unwrap();
        assert_eq!(got.variable.dtype(), DType::Int32);
        assert_eq!(rm.value("c"), Some(value.clone()));
        let err = s
            .get_variable(
                &VariableRequest::new("d").shape(&[2]).initializer(Initializer::Value(value)),
                &rm,
            )
            .unwrap_err();
        assert!(matches!(err, Error::ConstantInitializerWithShape { .. }));
    }

    #[test]
    fn integer_and_bool_variables_start_at_zero() {
        let (s, rm) = store();
        s.get_variable(&VariableRequest::new("i").shape(&[2]).dtype(DType::Int64), &rm)
            .unwrap();
        s.get_variable(&VariableRequest::new("b").shape(&[]).dtype(DType::Bool), &rm)
            .unwrap();
        assert_eq!(rm.value("i"), Some(HostTensor::zeros(DType::Int64, &[2]).unwrap()));
        assert_eq!(rm.value("b"), Some(HostTensor::scalar_bool(false)));
    }

    #[test]
    fn partitioned_shards_and_reuse() {
        let (s, rm) = store();
        let req = VariableRequest::new("p")
            .shape(&[130, 4])
            .partitioner(FixedSizePartitioner { num_shards: 3, axis: 0 })
            .reuse(Reuse::Auto);
        let got = s.get_variable(&req, &rm).unwrap();
        let pv = got.variable.as_partitioned().unwrap().clone();
        let rows: Vec<i64> = pv.shards.iter().map(|v| v.shape[0]).collect();
        assert_eq!(rows, vec![44, 43, 43]);
        assert_eq!(pv.shards[2].name, "p/part_2");
        assert_eq!(pv.shards[2].partition.as_ref().unwrap().var_offset, vec![87, 0]);
        assert_eq!(got.created.len(), 3);

        let again = s.get_variable(&req, &rm).unwrap();
        assert!(again.variable.same_as(&got.variable));

        // Reuse without a partitioner finds the partitioned variable.
        let plain = s
            .get_variable(&VariableRequest::new("p").reuse(Reuse::ReuseOnly), &rm)
            .unwrap();
        assert!(plain.variable.same_as(&got.variable));

        let err = s
            .get_variable(
                &VariableRequest::new("p")
                    .shape(&[130, 4])
                    .partitioner(FixedSizePartitioner { num_shards: 2, axis: 0 })
                    .reuse(Reuse::Auto),
                &rm,
            )
            .unwrap_err();
        assert!(matches!(err, Error::PartitionMismatch { .. }));
        let err = s
            .get_variable(&VariableRequest::new("p").shape(&[130, 4]).reuse(Reuse::Auto), &rm)
            .unwrap_err();
        assert!(matches!(err, Error::UnpartitionedExpected { .. }));
    }

    #[test]
    fn switching_single_to_partitioned_fails() {
        let (s, rm) = store();
        s.get_variable(&VariableRequest::new("w").shape(&[4]), &rm).unwrap();
        let err = s
            .get_variable(
                &VariableRequest::new("w")
                    .shape(&[4])
                    .partitioner(FixedSizePartitioner { num_shards: 2, axis: 0 })
                    .reuse(Reuse::Auto),
                &rm,
            )
            .unwrap_err();
        assert!(matches!(err, Error::PartitionedExpected { .. }));
    }

    #[test]
    fn scalar_bypasses_partitioning() {
        let (s, rm) = store();
        let got = s
            .get_variable(
                &VariableRequest::new("x")
                    .shape(&[])
                    .partitioner(FixedSizePartitioner { num_shards: 2, axis: 0 }),
                &rm,
            )
            .unwrap();
        assert!(got.variable.as_single().is_some());
    }

    #[test]
    fn collections_and_trainable() {
        let (s, rm) = store();
        s.get_variable(&VariableRequest::new("a/t").shape(&[1]), &rm).unwrap();
        s.get_variable(&VariableRequest::new("b/n").shape(&[1]).trainable(false), &rm)
            .unwrap();
        assert_eq!(s.collection(GLOBAL_VARIABLES, None).len(), 2);
        assert_eq!(s.collection(TRAINABLE_VARIABLES, None).len(), 1);
        assert_eq!(s.collection(GLOBAL_VARIABLES, Some("b/")).len(), 1);
    }

    #[test]
    fn scope_counts_probe_suffixes() {
        let (s, _) = store();
        assert_eq!(s.unique_scope_name("dense"), "dense");
        s.open_scope("dense");
        s.open_scope("dense_1");
        assert_eq!(s.unique_scope_name("dense"), "dense_2");
        s.open_scope("outer/inner");
        s.close_subscopes("outer");
        assert_eq!(s.scope_count("outer/inner"), 0);
        assert_eq!(s.scope_count("dense"), 1);
    }

    #[test]
    fn concurrent_creation_yields_one_variable() {
        let (s, rm) = store();
        let s = Arc::new(s);
        let rm = Arc::new(rm);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (s, rm) = (s.clone(), rm.clone());
                std::thread::spawn(move || {
                    s.get_variable(&VariableRequest::new("shared").shape(&[2]).reuse(Reuse::Auto), &rm)
                        .unwrap()
                        .variable
                })
            })
            .collect();
        let vars: Vec<VariableRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(vars.iter().all(|v| v.same_as(&vars[0])));
        assert_eq!(s.variables().len(), 1);
    }
}
