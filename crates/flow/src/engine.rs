// Archivo: engine.rs
// Propósito: `FlowEngine`, punto de entrada para ejecutar un flow: crea
// procesos, abre activaciones bajo el lock del proceso y despacha acciones
// (nodo, acción) a la máquina de estados.
use crate::activation::Activation;
use crate::definition::FlowDefinition;
use crate::domain::{now, Process, ProcessId, ProcessStatus, Task, TaskId, TaskStatus, User};
use crate::errors::{FlowError, Result};
use crate::node::NodeKind;
use crate::permission::{PermissionGate, PermissionOracle};
use crate::repository::{Changes, ProcessRepository};
use crate::urls::Action;
use log::{debug, info, warn};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Motor de un flow concreto.
///
/// Es barato de clonar y `Send + Sync`: varios hilos pueden operar sobre
/// procesos distintos en paralelo; las operaciones sobre un mismo proceso
/// se serializan con el `LockStrategy` del flow.
#[derive(Clone)]
pub struct FlowEngine {
    flow: Arc<FlowDefinition>,
    repo: Arc<dyn ProcessRepository>,
    oracle: Arc<dyn PermissionOracle>,
}

impl FlowEngine {
    pub fn new(flow: Arc<FlowDefinition>, repo: Arc<dyn ProcessRepository>, oracle: Arc<dyn PermissionOracle>) -> Self {
        Self { flow, repo, oracle }
    }

    pub fn flow(&self) -> &Arc<FlowDefinition> {
        &self.flow
    }

    pub(crate) fn flow_ref(&self) -> &FlowDefinition {
        &self.flow
    }

    pub fn repository(&self) -> &Arc<dyn ProcessRepository> {
        &self.repo
    }

    pub fn gate(&self) -> PermissionGate<'_> {
        PermissionGate::new(&self.flow, self.oracle.clone())
    }

    /// Abre la activación de un nodo Start: un proceso NEW y su tarea de
    /// inicio, que sólo se persisten con la primera transición que escriba
    /// (`prepare`, `perform` o `done`).
    pub fn start(&self, node: &str, user: &User) -> Result<Activation<'_>> {
        let start = self.flow.node(node)?;
        if start.kind() != NodeKind::Start {
            return Err(FlowError::NotFound(format!("{} no es un nodo Start", node)));
        }
        let process = Process::new(self.flow.namespace(),
                                   self.flow.fingerprint(),
                                   Some(user.username.clone()).filter(|_| user.is_authenticated()));
        let gate = self.gate();
        gate.require(gate.can_start(user, start, &process), user, "iniciar", &self.flow.namespace())?;
        let lock = self.flow.lock().acquire(process.id)?;
        let task = Task::new(&process, start.name(), Vec::new());
        debug!("activación de inicio {} en {}", start.name(), self.flow.namespace());
        Ok(Activation::new(self, lock, process, task, true))
    }

    /// Abre la activación de una tarea existente. Toma el lock del proceso y
    /// relee tarea y proceso ya con el lock retenido.
    pub fn activate(&self, task_id: &TaskId) -> Result<Activation<'_>> {
        let seen = self.repo.load_task(task_id)?;
        let namespace = self.flow.namespace();
        if seen.flow != namespace {
            return Err(FlowError::NotFound(format!("tarea {} en el flow {}", task_id, namespace)));
        }
        let lock = self.flow.lock().acquire(seen.process_id)?;
        let task = self.repo.load_task(task_id)?;
        let process = self.repo.load_process(&task.process_id)?;
        if process.fingerprint != self.flow.fingerprint() {
            warn!("el proceso {} se inició con otra versión del flow {}", process.id, namespace);
        }
        Ok(Activation::new(self, lock, process, task, false))
    }

    /// Despacha una acción sobre una tarea. Devuelve las tareas afectadas:
    /// las creadas al completar (`perform`, `activate_next`) o la propia
    /// tarea tras la transición.
    pub fn dispatch(&self, action: Action, task_id: &TaskId, user: &User, payload: Option<JsonValue>) -> Result<Vec<Task>> {
        let mut activation = self.activate(task_id)?;
        let node = activation.node()?;
        if !node.kind().supports(action) {
            return Err(FlowError::NotFound(format!("el nodo {} no soporta la acción {}", node.name(), action)));
        }
        debug!("dispatch {} sobre la tarea {} ({})", action, task_id, node.name());
        match action {
            Action::Detail => {
                let gate = self.gate();
                gate.require(gate.can_view(user, activation.task()), user, "ver", &format!("la tarea {}", task_id))?;
                Ok(vec![activation.task().clone()])
            }
            Action::Assign => {
                activation.assign(user)?;
                Ok(vec![activation.task().clone()])
            }
            Action::Unassign => {
                activation.unassign(user)?;
                Ok(vec![activation.task().clone()])
            }
            Action::Undo => {
                activation.undo(user)?;
                Ok(vec![activation.task().clone()])
            }
            Action::Cancel => {
                if let Some(comment) = payload.as_ref().and_then(|p| p.get("comment")).and_then(JsonValue::as_str) {
                    activation.set_comment(comment);
                }
                activation.cancel(user)?;
                Ok(vec![activation.task().clone()])
            }
            Action::Perform => {
                activation.perform(payload.unwrap_or(JsonValue::Null), user)
            }
            Action::ActivateNext => {
                let gate = self.gate();
                gate.require(gate.can_cancel(user), user, "reactivar", &format!("la tarea {}", task_id))?;
                activation.done()
            }
        }
    }

    pub fn load_process(&self, process_id: &ProcessId) -> Result<Process> {
        self.repo.load_process(process_id)
    }

    /// Historial de tareas de un proceso.
    pub fn tasks(&self, process_id: &ProcessId) -> Result<Vec<Task>> {
        self.repo.tasks_for_process(process_id)
    }

    /// Cancela el proceso y todas sus tareas vivas. Requiere el permiso de
    /// gestión del flow.
    pub fn cancel_process(&self, process_id: &ProcessId, user: &User) -> Result<Process> {
        let gate = self.gate();
        gate.require(gate.can_cancel(user), user, "cancelar", &format!("el proceso {}", process_id))?;
        let _lock = self.flow.lock().acquire(*process_id)?;
        let mut process = self.repo.load_process(process_id)?;
        if process.is_terminal() {
            return Err(FlowError::Conflict(format!("el proceso {} ya está {}", process.id, process.status)));
        }
        let at = now();
        let mut changes = Changes::default();
        for mut task in self.repo.tasks_for_process(process_id)?.into_iter().filter(Task::is_live) {
            task.status = TaskStatus::Cancelled;
            task.finished_at = Some(at);
            changes.updated.push(task);
        }
        changes.arrivals = self.flow
                               .nodes()
                               .iter()
                               .filter(|n| n.kind() == NodeKind::Join)
                               .map(|join| (*process_id, join.name().to_string(), Vec::new()))
                               .collect();
        process.status = ProcessStatus::Cancelled;
        process.finished_at = Some(at);
        changes.process = Some(process.clone());
        self.repo.apply(&changes)?;
        info!("proceso {} cancelado por {}", process.id, user.username);
        Ok(process)
    }
}
