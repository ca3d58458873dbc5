// Archivo: traversal.rs
// Propósito: avance de un proceso tras completar una tarea.
//
// El recorrido se planifica completo en memoria (`Plan`) y sólo después se
// persiste: si una condición falla a mitad de camino no queda ninguna
// escritura parcial. Los nodos automáticos (If, Split, Join, End) se
// ejecutan en línea bajo el mismo lock; los nodos View detienen el
// recorrido.
use crate::definition::FlowDefinition;
use crate::domain::{now, Process, ProcessStatus, Task, TaskId, TaskStatus};
use crate::errors::{FlowError, Result};
use crate::node::{EdgeKind, FlowNode, NodeId, NodeKind};
use crate::repository::ProcessRepository;
use indexmap::{IndexMap, IndexSet};
use log::{debug, info};
use std::collections::VecDeque;

/// Tope de nodos automáticos por recorrido; protege de ciclos sin nodos
/// humanos (p.ej. un If que vuelve sobre sí mismo).
pub const MAX_AUTOMATIC_STEPS: usize = 1000;

/// Resultado de registrar una llegada a un Join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arrival {
    /// Faltan ramas; el Join queda esperando.
    Pending,
    /// Llegaron todas las ramas; el Join se completa.
    Fired,
}

/// Cambios a persistir tras un recorrido.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    /// Tareas creadas o modificadas, en orden.
    pub(crate) tasks: IndexMap<TaskId, Task>,
    /// Ids de `tasks` que son nuevas.
    pub(crate) created: IndexSet<TaskId>,
    /// Registros de llegada por Join (vacío = limpiar).
    pub(crate) arrivals: IndexMap<String, Vec<String>>,
}

impl Plan {
    fn touch(&mut self, task: Task, is_new: bool) {
        if is_new {
            self.created.insert(task.id);
        }
        self.tasks.insert(task.id, task);
    }

    /// Tareas nuevas, en orden de creación.
    pub(crate) fn created_tasks(&self) -> Vec<Task> {
        self.tasks
            .values()
            .filter(|t| self.created.contains(&t.id))
            .cloned()
            .collect()
    }
}

struct Traversal<'a> {
    flow: &'a FlowDefinition,
    repo: &'a dyn ProcessRepository,
    /// Tareas del proceso tal como estaban antes del recorrido.
    existing: Vec<Task>,
    completed: TaskId,
    plan: Plan,
}

impl<'a> Traversal<'a> {
    fn current(&self, id: &TaskId) -> Option<&Task> {
        self.plan.tasks.get(id).or_else(|| self.existing.iter().find(|t| &t.id == id))
    }

    /// Tareas vivas después de aplicar el plan, sin contar la completada.
    fn has_live_tasks(&self) -> bool {
        let pending_existing = self.existing
                                   .iter()
                                   .filter(|t| t.id != self.completed && !self.plan.tasks.contains_key(&t.id))
                                   .any(Task::is_live);
        pending_existing || self.plan.tasks.values().any(Task::is_live)
    }

    fn arrivals(&self, process: &Process, join: &str) -> Result<Vec<String>> {
        match self.plan.arrivals.get(join) {
            Some(arrived) => Ok(arrived.clone()),
            None => self.repo.join_arrivals(&process.id, join),
        }
    }

    /// Tarea del Join que sigue esperando ramas, si la hay.
    fn waiting_join_task(&self, join: &str) -> Option<Task> {
        let ids: Vec<TaskId> = self.plan
                                   .tasks
                                   .keys()
                                   .copied()
                                   .chain(self.existing.iter().map(|t| t.id))
                                   .collect();
        ids.iter()
           .filter_map(|id| self.current(id))
           .find(|t| t.node == join && t.status == TaskStatus::New)
           .cloned()
    }

    fn successors(&self, node: &FlowNode, process: &Process) -> Result<Vec<NodeId>> {
        let targets = match node.kind() {
            NodeKind::Start | NodeKind::View | NodeKind::Join => node.edge(EdgeKind::Next).map(|e| e.dst).into_iter().collect(),
            NodeKind::If => {
                let kind = if node.evaluate(process)? { EdgeKind::Then } else { EdgeKind::Else };
                debug!("If {} sigue la rama {}", node.name(), kind.as_str());
                node.edge(kind).map(|e| e.dst).into_iter().collect()
            }
            NodeKind::Split => node.outgoing()
                                   .iter()
                                   .filter(|e| e.kind == EdgeKind::SplitBranch)
                                   .map(|e| e.dst)
                                   .collect(),
            NodeKind::End => Vec::new(),
        };
        Ok(targets)
    }

    fn arrive_at_join(&mut self, process: &Process, join: &FlowNode, source: &Task) -> Result<(Arrival, Task)> {
        let mut arrived = self.arrivals(process, join.name())?;
        if !arrived.iter().any(|s| s == &source.node) {
            arrived.push(source.node.clone());
        }

        let (mut task, is_new) = match self.waiting_join_task(join.name()) {
            Some(task) => (task, false),
            None => (Task::new(process, join.name(), Vec::new()), true),
        };
        task.previous.push(source.id);

        let complete = join.incoming()
                           .iter()
                           .map(|e| self.flow.get(e.src).name())
                           .all(|src| arrived.iter().any(|a| a == src));
        let outcome = if complete {
            let at = now();
            task.status = TaskStatus::Done;
            task.started_at = Some(at);
            task.finished_at = Some(at);
            self.plan.arrivals.insert(join.name().to_string(), Vec::new());
            debug!("Join {} completo en el proceso {}", join.name(), process.id);
            Arrival::Fired
        } else {
            self.plan.arrivals.insert(join.name().to_string(), arrived);
            Arrival::Pending
        };
        self.plan.touch(task.clone(), is_new);
        Ok((outcome, task))
    }
}

/// Planifica el avance de `process` a partir de `completed` (ya en DONE).
/// Puede marcar el proceso como FINISHED; el llamador persiste el plan.
pub(crate) fn advance(flow: &FlowDefinition,
                      repo: &dyn ProcessRepository,
                      process: &mut Process,
                      completed: &Task)
                      -> Result<Plan> {
    if process.is_terminal() {
        return Err(FlowError::Conflict(format!("el proceso {} está {}", process.id, process.status)));
    }
    let mut traversal = Traversal { flow,
                                    repo,
                                    existing: repo.tasks_for_process(&process.id)?,
                                    completed: completed.id,
                                    plan: Plan::default() };

    let mut queue: VecDeque<Task> = VecDeque::from([completed.clone()]);
    let mut reached_end = false;
    let mut steps = 0usize;
    while let Some(done) = queue.pop_front() {
        steps += 1;
        if steps > MAX_AUTOMATIC_STEPS {
            return Err(FlowError::Definition(format!("el flow {} encadena más de {} nodos automáticos",
                                                     flow.namespace(),
                                                     MAX_AUTOMATIC_STEPS)));
        }
        let node = flow.node(&done.node)?;
        if node.kind() == NodeKind::End {
            reached_end = true;
        }
        for dst in traversal.successors(node, process)? {
            let target = flow.get(dst);
            if target.kind() == NodeKind::Join {
                if let (Arrival::Fired, task) = traversal.arrive_at_join(process, target, &done)? {
                    queue.push_back(task);
                }
                continue;
            }
            let mut task = Task::new(process, target.name(), vec![done.id]);
            if target.is_automatic() {
                let at = now();
                task.status = TaskStatus::Done;
                task.started_at = Some(at);
                task.finished_at = Some(at);
                queue.push_back(task.clone());
            } else if let Some(owner) = target.assignee(process) {
                task.owner = Some(owner);
                task.status = TaskStatus::Assigned;
            }
            debug!("tarea {} creada para el nodo {} ({})", task.id, target.name(), task.status);
            traversal.plan.touch(task, true);
        }
    }

    if reached_end && !traversal.has_live_tasks() {
        process.status = ProcessStatus::Finished;
        process.finished_at = Some(now());
        info!("proceso {} del flow {} terminado", process.id, process.flow);
    }
    Ok(traversal.plan)
}

/// Verdadero si todas las ramas entrantes del Join llegaron.
pub(crate) fn join_is_complete(flow: &FlowDefinition,
                               repo: &dyn ProcessRepository,
                               process: &Process,
                               join: &FlowNode)
                               -> Result<bool> {
    let arrived = repo.join_arrivals(&process.id, join.name())?;
    Ok(join.incoming()
           .iter()
           .map(|e| flow.get(e.src).name())
           .all(|src| arrived.iter().any(|a| a == src)))
}
