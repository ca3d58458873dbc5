// Archivo: service.rs
// Propósito: implementar `FlowService`, una capa orquestadora sobre todos los
// flows registrados: iniciar procesos, despachar acciones sobre tareas y
// listas de trabajo (bandeja de entrada, cola, archivo). Esta capa debe ser
// invocada desde handlers HTTP o desde la CLI.
use crate::domain::{Process, ProcessId, Task, TaskFilter, TaskId, TaskStatus, User};
use crate::engine::FlowEngine;
use crate::errors::Result;
use crate::node::NodeKind;
use crate::permission::PermissionOracle;
use crate::registry::FlowRegistry;
use crate::repository::ProcessRepository;
use crate::urls::Action;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Servicio de alto nivel que expone la API de operaciones sobre flujos.
#[derive(Clone)]
pub struct FlowService {
    registry: Arc<FlowRegistry>,
    repo: Arc<dyn ProcessRepository>,
    oracle: Arc<dyn PermissionOracle>,
}

impl FlowService {
    pub fn new(registry: Arc<FlowRegistry>, repo: Arc<dyn ProcessRepository>, oracle: Arc<dyn PermissionOracle>) -> Self {
        Self { registry, repo, oracle }
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn engine(&self, namespace: &str) -> Result<FlowEngine> {
        Ok(FlowEngine::new(self.registry.get(namespace)?, self.repo.clone(), self.oracle.clone()))
    }

    pub fn engine_for_task(&self, task_id: &TaskId) -> Result<FlowEngine> {
        let task = self.repo.load_task(task_id)?;
        self.engine(&task.flow)
    }

    /// Inicia un proceso ejecutando su nodo Start con `payload`. Devuelve el
    /// proceso y las tareas creadas.
    pub fn start(&self, namespace: &str, node: &str, user: &User, payload: JsonValue) -> Result<(Process, Vec<Task>)> {
        let engine = self.engine(namespace)?;
        let mut activation = engine.start(node, user)?;
        let created = activation.perform(payload, user)?;
        Ok((activation.process().clone(), created))
    }

    /// `prepare` + `done` sobre una tarea humana.
    pub fn perform(&self, task_id: &TaskId, user: &User, payload: JsonValue) -> Result<Vec<Task>> {
        self.dispatch(Action::Perform, task_id, user, Some(payload))
    }

    pub fn dispatch(&self, action: Action, task_id: &TaskId, user: &User, payload: Option<JsonValue>) -> Result<Vec<Task>> {
        self.engine_for_task(task_id)?.dispatch(action, task_id, user, payload)
    }

    pub fn cancel_process(&self, process_id: &ProcessId, user: &User) -> Result<Process> {
        let process = self.repo.load_process(process_id)?;
        self.engine(&process.flow)?.cancel_process(process_id, user)
    }

    /// Tareas asignadas o en curso del usuario.
    pub fn inbox(&self, user: &User) -> Result<Vec<Task>> {
        if !user.is_authenticated() {
            return Ok(Vec::new());
        }
        self.repo.list_tasks(&TaskFilter { owner: Some(user.username.clone()),
                                           statuses: vec![TaskStatus::Assigned, TaskStatus::Started],
                                           ..Default::default() })
    }

    /// Tareas humanas sin dueño que el usuario puede asignarse.
    pub fn queue(&self, user: &User) -> Result<Vec<Task>> {
        if !user.is_authenticated() {
            return Ok(Vec::new());
        }
        let candidates = self.repo.list_tasks(&TaskFilter { statuses: vec![TaskStatus::New],
                                                            unowned: true,
                                                            ..Default::default() })?;
        let mut queue = Vec::new();
        for task in candidates {
            let Ok(flow) = self.registry.get(&task.flow) else { continue };
            let Ok(node) = flow.node(&task.node) else { continue };
            if node.kind() != NodeKind::View {
                continue;
            }
            let process = self.repo.load_process(&task.process_id)?;
            if process.is_terminal() {
                continue;
            }
            let engine = FlowEngine::new(flow.clone(), self.repo.clone(), self.oracle.clone());
            if engine.gate().can_assign(user, node, &task, &process) {
                queue.push(task);
            }
        }
        Ok(queue)
    }

    /// Tareas completadas por el usuario.
    pub fn archive(&self, user: &User) -> Result<Vec<Task>> {
        if !user.is_authenticated() {
            return Ok(Vec::new());
        }
        self.repo.list_tasks(&TaskFilter { owner: Some(user.username.clone()),
                                           statuses: vec![TaskStatus::Done],
                                           ..Default::default() })
    }

    /// Procesos de los flows cuyo permiso de lectura tiene el usuario.
    pub fn processes(&self, user: &User) -> Result<Vec<Process>> {
        let mut processes = Vec::new();
        for flow in self.registry.iter() {
            let engine = FlowEngine::new(flow.clone(), self.repo.clone(), self.oracle.clone());
            if engine.gate().can_view_flow(user) {
                processes.extend(self.repo.list_processes(Some(flow.namespace().as_str()))?);
            }
        }
        Ok(processes)
    }
}
