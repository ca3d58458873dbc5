// Archivo: urls.rs
// Propósito: catálogo de acciones que soporta cada tipo de nodo y nombres
// canónicos de fragmentos de URL. El enrutado real lo hace la capa HTTP.
use crate::domain::{ProcessId, TaskId};
use crate::errors::{FlowError, Result};
use crate::node::{FlowNode, NodeKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Detail,
    Assign,
    Unassign,
    Cancel,
    Perform,
    ActivateNext,
    Undo,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Detail => "detail",
            Action::Assign => "assign",
            Action::Unassign => "unassign",
            Action::Cancel => "cancel",
            Action::Perform => "perform",
            Action::ActivateNext => "activate_next",
            Action::Undo => "undo",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "detail" => Ok(Action::Detail),
            "assign" => Ok(Action::Assign),
            "unassign" => Ok(Action::Unassign),
            "cancel" => Ok(Action::Cancel),
            "perform" => Ok(Action::Perform),
            "activate_next" => Ok(Action::ActivateNext),
            "undo" => Ok(Action::Undo),
            other => Err(FlowError::NotFound(format!("acción {}", other))),
        }
    }
}

const START_ACTIONS: &[Action] = &[Action::Perform];
const VIEW_ACTIONS: &[Action] =
    &[Action::Detail, Action::Assign, Action::Unassign, Action::Cancel, Action::Perform, Action::Undo];
const AUTOMATIC_ACTIONS: &[Action] = &[Action::Detail, Action::Cancel, Action::ActivateNext];

impl NodeKind {
    /// Capacidades (acciones) que expone cada tipo de nodo.
    pub fn actions(&self) -> &'static [Action] {
        match self {
            NodeKind::Start => START_ACTIONS,
            NodeKind::View => VIEW_ACTIONS,
            NodeKind::If | NodeKind::Split | NodeKind::Join | NodeKind::End => AUTOMATIC_ACTIONS,
        }
    }

    pub fn supports(&self, action: Action) -> bool {
        self.actions().contains(&action)
    }
}

/// Patrón de URL relativo de una acción de un nodo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlPattern {
    /// Nombre canónico, `{nodo}__{acción}`.
    pub name: String,
    /// Plantilla relativa con `<process_id>` y `<task_id>`.
    pub path: String,
    pub node: String,
    pub action: Action,
}

pub fn url_name(node: &str, action: Action) -> String {
    format!("{}__{}", node, action)
}

/// Patrones de todas las acciones soportadas por `node`.
pub fn node_urls(node: &FlowNode) -> Vec<UrlPattern> {
    node.kind()
        .actions()
        .iter()
        .map(|action| UrlPattern { name: url_name(node.name(), *action),
                                   path: format!("<process_id>/{}/<task_id>/{}/", node.name(), action),
                                   node: node.name().to_string(),
                                   action: *action })
        .collect()
}

/// Fragmento de URL concreto para una tarea. Falla con `NotFound` si el
/// nodo no soporta la acción.
pub fn task_url(node: &FlowNode, action: Action, process_id: &ProcessId, task_id: &TaskId) -> Result<String> {
    if !node.kind().supports(action) {
        return Err(FlowError::NotFound(format!("el nodo {} no soporta la acción {}", node.name(), action)));
    }
    Ok(format!("{}/{}/{}/{}/", process_id, node.name(), task_id, action))
}
