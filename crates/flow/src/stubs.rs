// Archivo: stubs.rs
// Propósito: implementaciones en memoria para pruebas y wiring rápido.
//
// Incluye un repositorio en memoria (`InMemoryProcessRepository`, que además
// ofrece bloqueo de fila), una cache con expiración (`InMemoryCache`) para
// `CacheLock` y un oráculo de permisos estático. No son durables.
use crate::domain::{Process, ProcessId, Task, TaskFilter, TaskId, User};
use crate::errors::{FlowError, Result};
use crate::lock::{CacheBackend, ProcessLock, RowLockStore, RowLockTable};
use crate::permission::PermissionOracle;
use crate::repository::{Changes, ProcessRepository};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Repositorio en memoria. Las tareas conservan el orden de creación.
#[derive(Default)]
pub struct InMemoryProcessRepository {
    processes: Mutex<IndexMap<ProcessId, Process>>,
    tasks: Mutex<IndexMap<TaskId, Task>>,
    /// Llegadas a Joins por (proceso, nodo).
    joins: Mutex<HashMap<(ProcessId, String), Vec<String>>>,
    rows: RowLockTable,
}

impl InMemoryProcessRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Helper para mapear `Mutex::lock()` en un `Result` con
    /// `FlowError::Storage`.
    fn lock<'a, T>(&'a self, m: &'a Mutex<T>) -> std::result::Result<MutexGuard<'a, T>, FlowError> {
        m.lock().map_err(|e| FlowError::Storage(format!("mutex poisoned: {:?}", e)))
    }
}

impl ProcessRepository for InMemoryProcessRepository {
    fn create_process(&self, process: &Process) -> Result<()> {
        let mut processes = self.lock(&self.processes)?;
        if processes.contains_key(&process.id) {
            return Err(FlowError::Conflict(format!("proceso {} ya existe", process.id)));
        }
        processes.insert(process.id, process.clone());
        Ok(())
    }

    fn load_process(&self, id: &ProcessId) -> Result<Process> {
        self.lock(&self.processes)?
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(format!("proceso {}", id)))
    }

    fn save_process(&self, process: &Process) -> Result<()> {
        let mut processes = self.lock(&self.processes)?;
        match processes.get_mut(&process.id) {
            Some(slot) => {
                *slot = process.clone();
                Ok(())
            }
            None => Err(FlowError::NotFound(format!("proceso {}", process.id))),
        }
    }

    fn create_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.lock(&self.tasks)?;
        if tasks.contains_key(&task.id) {
            return Err(FlowError::Conflict(format!("tarea {} ya existe", task.id)));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn load_task(&self, id: &TaskId) -> Result<Task> {
        self.lock(&self.tasks)?
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(format!("tarea {}", id)))
    }

    fn save_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.lock(&self.tasks)?;
        match tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(FlowError::NotFound(format!("tarea {}", task.id))),
        }
    }

    fn tasks_for_process(&self, process_id: &ProcessId) -> Result<Vec<Task>> {
        Ok(self.lock(&self.tasks)?
               .values()
               .filter(|t| &t.process_id == process_id)
               .cloned()
               .collect())
    }

    fn list_processes(&self, flow: Option<&str>) -> Result<Vec<Process>> {
        Ok(self.lock(&self.processes)?
               .values()
               .filter(|p| flow.map_or(true, |f| p.flow == f))
               .cloned()
               .collect())
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.lock(&self.tasks)?
               .values()
               .filter(|t| filter.matches(t))
               .cloned()
               .collect())
    }

    fn join_arrivals(&self, process_id: &ProcessId, join: &str) -> Result<Vec<String>> {
        Ok(self.lock(&self.joins)?
               .get(&(*process_id, join.to_string()))
               .cloned()
               .unwrap_or_default())
    }

    fn save_join_arrivals(&self, process_id: &ProcessId, join: &str, arrived: &[String]) -> Result<()> {
        let mut joins = self.lock(&self.joins)?;
        let key = (*process_id, join.to_string());
        if arrived.is_empty() {
            joins.remove(&key);
        } else {
            joins.insert(key, arrived.to_vec());
        }
        Ok(())
    }

    fn apply(&self, changes: &Changes) -> Result<()> {
        // Una sola sección crítica, con los mutex siempre en el mismo orden:
        // se valida todo antes de escribir nada.
        let mut processes = self.lock(&self.processes)?;
        let mut tasks = self.lock(&self.tasks)?;
        let mut joins = self.lock(&self.joins)?;

        if let Some(process) = &changes.new_process {
            if processes.contains_key(&process.id) {
                return Err(FlowError::Conflict(format!("proceso {} ya existe", process.id)));
            }
        }
        if let Some(process) = &changes.process {
            let pending = changes.new_process.as_ref().map_or(false, |p| p.id == process.id);
            if !pending && !processes.contains_key(&process.id) {
                return Err(FlowError::NotFound(format!("proceso {}", process.id)));
            }
        }
        let mut fresh = HashSet::new();
        for task in &changes.created {
            if tasks.contains_key(&task.id) || !fresh.insert(task.id) {
                return Err(FlowError::Conflict(format!("tarea {} ya existe", task.id)));
            }
        }
        if let Some(task) = changes.updated
                                   .iter()
                                   .find(|t| !tasks.contains_key(&t.id) && !fresh.contains(&t.id))
        {
            return Err(FlowError::NotFound(format!("tarea {}", task.id)));
        }

        for process in changes.new_process.iter().chain(changes.process.iter()) {
            processes.insert(process.id, process.clone());
        }
        for task in changes.created.iter().chain(changes.updated.iter()) {
            tasks.insert(task.id, task.clone());
        }
        for (process_id, join, arrived) in &changes.arrivals {
            let key = (*process_id, join.clone());
            if arrived.is_empty() {
                joins.remove(&key);
            } else {
                joins.insert(key, arrived.clone());
            }
        }
        Ok(())
    }
}

impl RowLockStore for InMemoryProcessRepository {
    fn lock_row(&self, process_id: ProcessId, timeout: Duration) -> Result<ProcessLock> {
        self.rows.lock(process_id, timeout)
    }
}

/// Cache en memoria con expiración por clave. Una clave vencida puede ser
/// tomada por otro titular.
#[derive(Default)]
pub struct InMemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| e.value().1 > Instant::now())
            .unwrap_or(false)
    }
}

impl CacheBackend for InMemoryCache {
    fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().1 > now {
                    return Ok(false);
                }
                occupied.insert((value.to_string(), now + ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert((value.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    fn delete_if(&self, key: &str, value: &str) -> Result<bool> {
        Ok(self.entries.remove_if(key, |_, (held, _)| held == value).is_some())
    }
}

/// Oráculo de permisos con concesiones explícitas por usuario.
#[derive(Default)]
pub struct StaticPermissions {
    grants: DashMap<String, HashSet<String>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, username: &str, permission: &str) {
        self.grants
            .entry(username.to_string())
            .or_default()
            .insert(permission.to_string());
    }

    pub fn revoke(&self, username: &str, permission: &str) {
        if let Some(mut perms) = self.grants.get_mut(username) {
            perms.remove(permission);
        }
    }
}

impl PermissionOracle for StaticPermissions {
    fn has_permission(&self, user: &User, permission: &str) -> bool {
        self.grants
            .get(&user.username)
            .map(|perms| perms.contains(permission))
            .unwrap_or(false)
    }
}
