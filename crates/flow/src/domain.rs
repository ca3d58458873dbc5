// Archivo: domain.rs
// Propósito: tipos de dominio persistidos por el motor (Process, Task),
// sus estados y el actor (`User`) que ejecuta las transiciones.
use chrono::{DateTime, SubsecRound, Utc};
use crate::errors::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type ProcessId = Uuid;
pub type TaskId = Uuid;

/// Marca de tiempo truncada a microsegundos: es la precisión que conservan
/// los repositorios, así el guardia de `prepare` compara valores idénticos
/// antes y después de persistir.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Actor que ejecuta una acción. La autenticación es responsabilidad del
/// llamador; el motor sólo distingue anónimos de autenticados.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub anonymous: bool,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self { username: username.into(),
               anonymous: false }
    }

    pub fn anonymous() -> Self {
        Self { username: String::new(),
               anonymous: true }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.anonymous
    }

    /// Verdadero si `owner` corresponde a este usuario.
    pub fn owns(&self, owner: Option<&str>) -> bool {
        self.is_authenticated() && owner == Some(self.username.as_str())
    }
}

/// Estado de un proceso.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessStatus {
    New,
    Active,
    Finished,
    Cancelled,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::New => "NEW",
            ProcessStatus::Active => "ACTIVE",
            ProcessStatus::Finished => "FINISHED",
            ProcessStatus::Cancelled => "CANCELLED",
        }
    }

    /// FINISHED y CANCELLED no admiten nuevas tareas.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Finished | ProcessStatus::Cancelled)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "NEW" => Ok(ProcessStatus::New),
            "ACTIVE" | "STARTED" => Ok(ProcessStatus::Active),
            "FINISHED" => Ok(ProcessStatus::Finished),
            "CANCELLED" | "CANCELED" => Ok(ProcessStatus::Cancelled),
            other => Err(FlowError::Storage(format!("estado de proceso desconocido: {}", other))),
        }
    }
}

/// Estado de una tarea. Las transiciones válidas las impone `Activation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    New,
    Assigned,
    Started,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "NEW",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Started => "STARTED",
            TaskStatus::Done => "DONE",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    /// Una tarea viva todavía puede avanzar o cancelarse.
    pub fn is_live(&self) -> bool {
        matches!(self, TaskStatus::New | TaskStatus::Assigned | TaskStatus::Started)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "NEW" => Ok(TaskStatus::New),
            "ASSIGNED" => Ok(TaskStatus::Assigned),
            "STARTED" => Ok(TaskStatus::Started),
            "DONE" => Ok(TaskStatus::Done),
            "CANCELLED" | "CANCELED" => Ok(TaskStatus::Cancelled),
            other => Err(FlowError::Storage(format!("estado de tarea desconocido: {}", other))),
        }
    }
}

/// Una ejecución concreta de un flow.
///
/// `payload` es la referencia al objeto de negocio (una instantánea JSON);
/// los nodos `If` evalúan sus condiciones contra él y las tareas `View`
/// modifican sólo los campos que declaran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    /// Namespace del flow que creó el proceso (`app/flow`).
    pub flow: String,
    pub status: ProcessStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub payload: JsonValue,
    /// Huella del grafo con el que se inició el proceso.
    pub fingerprint: String,
}

impl Process {
    pub fn new(flow: impl Into<String>, fingerprint: impl Into<String>, created_by: Option<String>) -> Self {
        Self { id: Uuid::new_v4(),
               flow: flow.into(),
               status: ProcessStatus::New,
               created_at: now(),
               finished_at: None,
               created_by,
               payload: JsonValue::Object(serde_json::Map::new()),
               fingerprint: fingerprint.into() }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Campo del payload, si existe.
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.payload.get(name)
    }

    /// Lee un campo booleano del payload para las condiciones de los nodos
    /// `If`. Un campo ausente es un `Conflict` (el proceso no tiene los datos
    /// que la rama necesita); un valor no booleano es un `Validation`.
    pub fn flag(&self, name: &str) -> Result<bool> {
        match self.field(name) {
            None | Some(JsonValue::Null) => {
                Err(FlowError::Conflict(format!("el proceso {} no tiene el campo '{}'", self.id, name)))
            }
            Some(JsonValue::Bool(b)) => Ok(*b),
            Some(other) => Err(FlowError::Validation(format!("el campo '{}' no es booleano: {}", name, other))),
        }
    }

    /// Aplica los campos de `data` sobre el payload actual.
    pub fn merge_payload(&mut self, data: &JsonValue) {
        if let JsonValue::Object(incoming) = data {
            if !self.payload.is_object() {
                self.payload = JsonValue::Object(serde_json::Map::new());
            }
            if let JsonValue::Object(current) = &mut self.payload {
                for (k, v) in incoming {
                    current.insert(k.clone(), v.clone());
                }
            }
        }
    }
}

/// Una unidad de trabajo ligada a un proceso y a un nodo (por nombre).
/// Las tareas nunca se borran: forman el historial del proceso.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub process_id: ProcessId,
    pub flow: String,
    pub node: String,
    pub status: TaskStatus,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    /// Tareas cuya finalización creó esta tarea.
    pub previous: Vec<TaskId>,
}

impl Task {
    pub fn new(process: &Process, node: impl Into<String>, previous: Vec<TaskId>) -> Self {
        Self { id: Uuid::new_v4(),
               process_id: process.id,
               flow: process.flow.clone(),
               node: node.into(),
               status: TaskStatus::New,
               owner: None,
               created_at: now(),
               started_at: None,
               finished_at: None,
               comment: None,
               previous }
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

/// Filtro para listar tareas desde el repositorio.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub flow: Option<String>,
    pub process_id: Option<ProcessId>,
    pub statuses: Vec<TaskStatus>,
    pub owner: Option<String>,
    pub unowned: bool,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(flow) = &self.flow {
            if &task.flow != flow {
                return false;
            }
        }
        if let Some(pid) = &self.process_id {
            if &task.process_id != pid {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(owner) = &self.owner {
            if task.owner.as_ref() != Some(owner) {
                return false;
            }
        }
        if self.unowned && task.owner.is_some() {
            return false;
        }
        true
    }
}
