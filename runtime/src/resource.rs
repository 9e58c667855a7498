// resource.rs — Shared mutable state behind resource handles
//
// Every variable value lives in one cell keyed by its shared name. A run locks
// the cells it may touch up front, in sorted name order, and holds them until
// it finishes: runs sharing a resource serialize, disjoint runs proceed in
// parallel, and no two runs can deadlock.
//
// Preconditions: none.
// Postconditions: a cell, once created, lives as long as the manager.
// Failure modes: reading an uninitialized or unlocked resource → `Error::Execution`.
// Side effects: none beyond the cells themselves.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::tensor::HostTensor;

pub type Cell = Arc<Mutex<Option<HostTensor>>>;

#[derive(Default)]
pub struct ResourceManager {
    cells: Mutex<HashMap<String, Cell>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, name: &str) -> Cell {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.entry(name.to_string()).or_default().clone()
    }

    /// Store the initial value of a newly created variable.
    pub fn create(&self, name: &str, value: HostTensor) {
        let cell = self.cell(name);
        *cell.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
    }

    /// Current value, taking the cell lock only for the copy.
    pub fn value(&self, name: &str) -> Option<HostTensor> {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        let cell = cells.get(name)?.clone();
        drop(cells);
        let value = cell.lock().unwrap_or_else(|e| e.into_inner()).clone();
        value
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cells
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Cells for `names`, created empty where missing, in sorted order.
    pub fn cells(&self, names: &BTreeSet<String>) -> Vec<(String, Cell)> {
        names.iter().map(|n| (n.clone(), self.cell(n))).collect()
    }
}

/// The cells a run holds locked.
pub struct LockedResources<'a> {
    guards: BTreeMap<String, MutexGuard<'a, Option<HostTensor>>>,
}

impl<'a> LockedResources<'a> {
    /// Lock every cell. `cells` must be sorted by name, as `ResourceManager::cells` returns them.
    pub fn lock(cells: &'a [(String, Cell)]) -> Self {
        let guards = cells
            .iter()
            .map(|(name, cell)| (name.clone(), cell.lock().unwrap_or_else(|e| e.into_inner())))
            .collect();
        LockedResources { guards }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.guards.keys().map(String::as_str)
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Option<HostTensor>> {
        self.guards
            .get_mut(name)
            .map(|g| &mut **g)
            .ok_or_else(|| Error::exec(name, "resource is not held by this run"))
    }

    pub fn read(&mut self, name: &str) -> Result<HostTensor> {
        self.get_mut(name)?
            .clone()
            .ok_or_else(|| Error::exec(name, "attempting to use an uninitialized variable"))
    }
}
