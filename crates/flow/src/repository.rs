// Archivo: repository.rs
// Propósito: contrato de persistencia de procesos, tareas y llegadas a
// nodos Join.
use crate::domain::{Process, ProcessId, Task, TaskFilter, TaskId};
use crate::errors::Result;

/// Cambios de una transición, aplicados por `ProcessRepository::apply` de
/// forma atómica: o se escriben todos o ninguno.
#[derive(Debug, Clone, Default)]
pub struct Changes {
    /// Proceso a insertar (arranque de un Start).
    pub new_process: Option<Process>,
    /// Proceso existente a actualizar.
    pub process: Option<Process>,
    /// Tareas nuevas, en orden de creación.
    pub created: Vec<Task>,
    /// Tareas existentes a actualizar.
    pub updated: Vec<Task>,
    /// Registros de llegada por (proceso, Join); vacío = limpiar.
    pub arrivals: Vec<(ProcessId, String, Vec<String>)>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.new_process.is_none()
        && self.process.is_none()
        && self.created.is_empty()
        && self.updated.is_empty()
        && self.arrivals.is_empty()
    }
}

/// Repositorio de procesos y tareas.
///
/// Las implementaciones deben ser `Send + Sync`: el motor las comparte entre
/// hilos como `Arc<dyn ProcessRepository>`. La exclusión entre activaciones
/// de un mismo proceso la aporta el `LockStrategy` del flow, no el
/// repositorio.
pub trait ProcessRepository: Send + Sync {
    fn create_process(&self, process: &Process) -> Result<()>;

    /// `FlowError::NotFound` si no existe.
    fn load_process(&self, id: &ProcessId) -> Result<Process>;

    fn save_process(&self, process: &Process) -> Result<()>;

    fn create_task(&self, task: &Task) -> Result<()>;

    /// `FlowError::NotFound` si no existe.
    fn load_task(&self, id: &TaskId) -> Result<Task>;

    fn save_task(&self, task: &Task) -> Result<()>;

    /// Tareas de un proceso en orden de creación.
    fn tasks_for_process(&self, process_id: &ProcessId) -> Result<Vec<Task>>;

    /// Procesos, opcionalmente filtrados por namespace de flow.
    fn list_processes(&self, flow: Option<&str>) -> Result<Vec<Process>>;

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Nombres de los nodos de origen que llegaron al Join desde su último
    /// disparo.
    fn join_arrivals(&self, process_id: &ProcessId, join: &str) -> Result<Vec<String>>;

    /// Reemplaza el registro de llegadas; un slice vacío lo limpia.
    fn save_join_arrivals(&self, process_id: &ProcessId, join: &str, arrived: &[String]) -> Result<()>;

    /// Aplica `changes` en una sola unidad de trabajo. Si cualquier
    /// escritura falla (tarea duplicada, registro inexistente, error de
    /// almacenamiento) no queda nada escrito.
    fn apply(&self, changes: &Changes) -> Result<()>;
}
