// Archivo: activation.rs
// Propósito: máquina de estados de una tarea.
//
//   NEW ──assign──▶ ASSIGNED ──prepare──▶ STARTED ──done──▶ DONE
//    ▲                 │  ▲                  │
//    └────unassign─────┘  └──────undo────────┘
//   (NEW | ASSIGNED | STARTED) ──cancel──▶ CANCELLED
//
// Una `Activation` retiene el lock del proceso durante toda su vida. Cada
// transición comprueba estado y permisos antes de mutar nada y escribe sus
// cambios con un solo `ProcessRepository::apply`: si falla, lo persistido
// queda intacto.
use chrono::{DateTime, Utc};
use crate::domain::{now, Process, ProcessStatus, Task, TaskStatus, User};
use crate::engine::FlowEngine;
use crate::errors::{FlowError, Result};
use crate::lock::ProcessLock;
use crate::node::{FlowNode, NodeKind};
use crate::repository::Changes;
use crate::traversal::{self, Plan};
use log::{debug, info, warn};
use serde_json::Value as JsonValue;

pub struct Activation<'e> {
    engine: &'e FlowEngine,
    _lock: ProcessLock,
    process: Process,
    task: Task,
    /// Datos validados en `prepare`, aplicados en `done`.
    prepared: Option<JsonValue>,
    /// Proceso y tarea de Start aún no persistidos.
    fresh: bool,
    comment: Option<String>,
}

impl<'e> Activation<'e> {
    pub(crate) fn new(engine: &'e FlowEngine, lock: ProcessLock, process: Process, task: Task, fresh: bool) -> Self {
        Self { engine,
               _lock: lock,
               process,
               task,
               prepared: None,
               fresh,
               comment: None }
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn node(&self) -> Result<&'e FlowNode> {
        self.engine.flow_ref().node(&self.task.node)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.process.is_terminal() {
            warn!("proceso {} terminado ({}), tarea {} rechazada", self.process.id, self.process.status, self.task.id);
            return Err(FlowError::Conflict(format!("el proceso {} está {}", self.process.id, self.process.status)));
        }
        Ok(())
    }

    fn conflict(&self, action: &str) -> FlowError {
        warn!("{} no permitido en la tarea {} ({})", action, self.task.id, self.task.status);
        FlowError::Conflict(format!("{} no permitido: la tarea {} está {}", action, self.task.id, self.task.status))
    }

    /// Persiste una transición de un solo paso. En un Start aún no
    /// persistido crea proceso y tarea juntos.
    fn save(&mut self, task: Task) -> Result<()> {
        let mut changes = Changes::default();
        if self.fresh {
            changes.new_process = Some(self.process.clone());
            changes.created.push(task.clone());
        } else {
            changes.updated.push(task.clone());
        }
        self.engine.repository().apply(&changes)?;
        if self.fresh {
            self.fresh = false;
            info!("proceso {} del flow {} iniciado", self.process.id, self.process.flow);
        }
        self.task = task;
        Ok(())
    }

    /// Comentario libre que se guarda en la tarea con la próxima transición
    /// que la cierre (`done`, `perform` o `cancel`).
    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = Some(comment.into());
    }

    /// Comprobaciones de `prepare` sin escribir nada: devuelve la tarea ya
    /// en STARTED y los datos validados.
    fn stage(&self,
             payload: JsonValue,
             user: &User,
             started_guard: Option<DateTime<Utc>>)
             -> Result<(Task, JsonValue)> {
        self.ensure_open()?;
        match (self.task.status, started_guard) {
            (TaskStatus::New | TaskStatus::Assigned, None) => {}
            (TaskStatus::Started, Some(seen)) if self.task.started_at == Some(seen) => {}
            (TaskStatus::Started, Some(_)) | (TaskStatus::New | TaskStatus::Assigned, Some(_)) => {
                warn!("token de inicio obsoleto para la tarea {}", self.task.id);
                return Err(FlowError::Conflict(format!("la tarea {} cambió desde que se leyó", self.task.id)));
            }
            _ => return Err(self.conflict("prepare")),
        }
        let node = self.node()?;
        if node.is_automatic() {
            return Err(self.conflict("prepare"));
        }
        let gate = self.engine.gate();
        gate.require(gate.can_proceed(user, node, &self.task, &self.process),
                     user,
                     "ejecutar",
                     &format!("la tarea {}", node.name()))?;
        let data = validate_payload(node, payload)?;

        let mut task = self.task.clone();
        if task.owner.is_none() {
            task.owner = Some(user.username.clone());
        }
        task.status = TaskStatus::Started;
        task.started_at = Some(now());
        Ok((task, data))
    }

    /// Valida `payload` contra los campos declarados del nodo y pasa la tarea
    /// a STARTED. `started_guard` es el `started_at` que el llamador observó:
    /// obligatorio para volver a preparar una tarea ya iniciada, y debe
    /// coincidir con el almacenado.
    pub fn prepare(&mut self, payload: JsonValue, user: &User, started_guard: Option<DateTime<Utc>>) -> Result<()> {
        let (task, data) = self.stage(payload, user, started_guard)?;
        self.save(task)?;
        self.prepared = Some(data);
        debug!("tarea {} ({}) iniciada por {}", self.task.id, self.task.node, user.username);
        Ok(())
    }

    /// `prepare` + `done` en una sola escritura: si el avance falla, la
    /// tarea (y en un Start, el proceso) queda como estaba.
    pub fn perform(&mut self, payload: JsonValue, user: &User) -> Result<Vec<Task>> {
        let (task, data) = self.stage(payload, user, None)?;
        debug!("tarea {} ({}) ejecutada por {}", task.id, task.node, user.username);
        self.complete(task, Some(data))
    }

    pub fn assign(&mut self, user: &User) -> Result<()> {
        self.ensure_open()?;
        if self.task.status != TaskStatus::New {
            return Err(self.conflict("assign"));
        }
        let node = self.node()?;
        let gate = self.engine.gate();
        gate.require(gate.can_assign(user, node, &self.task, &self.process),
                     user,
                     "asignarse",
                     &format!("la tarea {}", node.name()))?;
        let mut task = self.task.clone();
        task.owner = Some(user.username.clone());
        task.status = TaskStatus::Assigned;
        self.save(task)?;
        debug!("tarea {} asignada a {}", self.task.id, user.username);
        Ok(())
    }

    pub fn unassign(&mut self, user: &User) -> Result<()> {
        self.ensure_open()?;
        if self.task.status != TaskStatus::Assigned {
            return Err(self.conflict("unassign"));
        }
        let gate = self.engine.gate();
        gate.require(gate.can_unassign(user, &self.task),
                     user,
                     "liberar",
                     &format!("la tarea {}", self.task.node))?;
        let mut task = self.task.clone();
        task.owner = None;
        task.status = TaskStatus::New;
        self.save(task)?;
        debug!("tarea {} liberada", self.task.id);
        Ok(())
    }

    /// Devuelve una tarea STARTED a ASSIGNED descartando los datos
    /// preparados.
    pub fn undo(&mut self, user: &User) -> Result<()> {
        self.ensure_open()?;
        if self.task.status != TaskStatus::Started {
            return Err(self.conflict("undo"));
        }
        let node = self.node()?;
        let gate = self.engine.gate();
        gate.require(gate.can_proceed(user, node, &self.task, &self.process),
                     user,
                     "deshacer",
                     &format!("la tarea {}", node.name()))?;
        let mut task = self.task.clone();
        task.status = TaskStatus::Assigned;
        task.started_at = None;
        self.save(task)?;
        self.prepared = None;
        debug!("tarea {} devuelta a ASSIGNED", self.task.id);
        Ok(())
    }

    pub fn cancel(&mut self, user: &User) -> Result<()> {
        self.ensure_open()?;
        if !self.task.is_live() {
            return Err(self.conflict("cancel"));
        }
        let gate = self.engine.gate();
        gate.require(gate.can_cancel(user), user, "cancelar", &format!("la tarea {}", self.task.node))?;
        let mut task = self.task.clone();
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(now());
        if let Some(comment) = &self.comment {
            task.comment = Some(comment.clone());
        }
        self.save(task)?;
        self.prepared = None;
        self.comment = None;
        info!("tarea {} ({}) cancelada por {}", self.task.id, self.task.node, user.username);
        Ok(())
    }

    /// Completa la tarea y avanza el proceso. Devuelve las tareas creadas.
    pub fn done(&mut self) -> Result<Vec<Task>> {
        self.complete(self.task.clone(), self.prepared.clone())
    }

    /// `current` es la tarea tal como debe quedar antes de cerrarse; puede
    /// no estar persistida todavía (`perform`).
    fn complete(&mut self, current: Task, data: Option<JsonValue>) -> Result<Vec<Task>> {
        self.ensure_open()?;
        let node = self.node()?;
        let ready = match node.kind() {
            kind if kind.is_automatic() => current.status == TaskStatus::New,
            _ => current.status == TaskStatus::Started,
        };
        if !ready {
            return Err(self.conflict("done"));
        }
        let flow = self.engine.flow_ref();
        let repo = self.engine.repository();
        if node.kind() == NodeKind::Join && !traversal::join_is_complete(flow, repo.as_ref(), &self.process, node)? {
            return Err(FlowError::Conflict(format!("el Join {} sigue esperando ramas", node.name())));
        }

        let mut process = self.process.clone();
        if let Some(data) = &data {
            process.merge_payload(data);
        }
        if node.kind() == NodeKind::Start && process.status == ProcessStatus::New {
            process.status = ProcessStatus::Active;
        }
        let mut task = current;
        let at = now();
        task.status = TaskStatus::Done;
        task.started_at.get_or_insert(at);
        task.finished_at = Some(at);
        if let Some(comment) = &self.comment {
            task.comment = Some(comment.clone());
        }

        let mut plan = traversal::advance(flow, repo.as_ref(), &mut process, &task)?;
        if node.kind() == NodeKind::Join {
            plan.arrivals.entry(node.name().to_string()).or_insert_with(Vec::new);
        }
        self.commit(process, task, &plan)?;
        self.prepared = None;
        self.comment = None;

        let created = plan.created_tasks();
        debug!("tarea {} ({}) completada; {} tareas nuevas", self.task.id, self.task.node, created.len());
        Ok(created)
    }

    /// Escribe tarea, proceso y plan en una única unidad de trabajo.
    fn commit(&mut self, process: Process, task: Task, plan: &Plan) -> Result<()> {
        let mut changes = Changes::default();
        if self.fresh {
            changes.new_process = Some(process.clone());
            changes.created.push(task.clone());
        } else {
            changes.process = Some(process.clone());
            changes.updated.push(task.clone());
        }
        for (id, planned) in &plan.tasks {
            if plan.created.contains(id) {
                changes.created.push(planned.clone());
            } else {
                changes.updated.push(planned.clone());
            }
        }
        changes.arrivals = plan.arrivals
                               .iter()
                               .map(|(join, arrived)| (process.id, join.clone(), arrived.clone()))
                               .collect();
        self.engine.repository().apply(&changes)?;
        if self.fresh {
            self.fresh = false;
            info!("proceso {} del flow {} iniciado", process.id, process.flow);
        }
        self.process = process;
        self.task = task;
        Ok(())
    }
}

/// El payload debe ser un objeto cuyos campos estén todos declarados en el
/// nodo. `null` equivale a un objeto vacío.
fn validate_payload(node: &FlowNode, payload: JsonValue) -> Result<JsonValue> {
    let object = match payload {
        JsonValue::Null => serde_json::Map::new(),
        JsonValue::Object(map) => map,
        other => {
            return Err(FlowError::Validation(format!("se esperaba un objeto para la tarea {}, llegó {}",
                                                     node.name(),
                                                     other)))
        }
    };
    let unknown: Vec<&str> = object.keys()
                                   .map(String::as_str)
                                   .filter(|k| !node.fields().iter().any(|f| f == k))
                                   .collect();
    if !unknown.is_empty() {
        return Err(FlowError::Validation(format!("campos no permitidos en {}: {}", node.name(), unknown.join(", "))));
    }
    Ok(JsonValue::Object(object))
}
