// Archivo: permission.rs
// Propósito: puerta de permisos por tarea. Consulta un `PermissionOracle`
// externo; el motor no gestiona usuarios ni grupos.
use crate::definition::FlowDefinition;
use crate::domain::{Process, Task, TaskStatus, User};
use crate::errors::{FlowError, Result};
use crate::node::{FlowNode, NodeKind};
use std::sync::Arc;

/// Fuente de verdad de permisos (BD de usuarios, LDAP, tabla estática...).
pub trait PermissionOracle: Send + Sync {
    fn has_permission(&self, user: &User, permission: &str) -> bool;
}

/// Reglas de acceso de un flow. Un anónimo nunca tiene permiso.
#[derive(Clone)]
pub struct PermissionGate<'f> {
    flow: &'f FlowDefinition,
    oracle: Arc<dyn PermissionOracle>,
}

impl<'f> PermissionGate<'f> {
    pub fn new(flow: &'f FlowDefinition, oracle: Arc<dyn PermissionOracle>) -> Self {
        Self { flow, oracle }
    }

    fn has(&self, user: &User, permission: &str) -> bool {
        user.is_authenticated() && self.oracle.has_permission(user, permission)
    }

    /// Permiso del nodo; sin regla basta con estar autenticado.
    pub fn has_node_perm(&self, user: &User, node: &FlowNode, process: &Process) -> bool {
        if !user.is_authenticated() {
            return false;
        }
        match node.permission() {
            None => true,
            Some(rule) => self.has(user, &rule.name_for(process)),
        }
    }

    pub fn can_start(&self, user: &User, node: &FlowNode, process: &Process) -> bool {
        node.kind() == NodeKind::Start && self.has_node_perm(user, node, process)
    }

    /// Una tarea con dueño sólo la ejecuta su dueño.
    pub fn can_proceed(&self, user: &User, node: &FlowNode, task: &Task, process: &Process) -> bool {
        match task.owner.as_deref() {
            Some(owner) => user.owns(Some(owner)),
            None => self.has_node_perm(user, node, process),
        }
    }

    pub fn can_assign(&self, user: &User, node: &FlowNode, task: &Task, process: &Process) -> bool {
        node.kind() == NodeKind::View
        && task.status == TaskStatus::New
        && task.owner.is_none()
        && self.has_node_perm(user, node, process)
    }

    pub fn can_unassign(&self, user: &User, task: &Task) -> bool {
        user.owns(task.owner.as_deref()) || self.has(user, &self.flow.manage_permission_name())
    }

    pub fn can_view(&self, user: &User, task: &Task) -> bool {
        user.owns(task.owner.as_deref()) || self.can_view_flow(user)
    }

    pub fn can_view_flow(&self, user: &User) -> bool {
        self.has(user, &self.flow.view_permission_name())
    }

    pub fn can_cancel(&self, user: &User) -> bool {
        self.has(user, &self.flow.manage_permission_name())
    }

    /// Convierte una comprobación fallida en `FlowError::Permission`.
    pub fn require(&self, allowed: bool, user: &User, action: &str, target: &str) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            let who = if user.is_authenticated() { user.username.as_str() } else { "anónimo" };
            Err(FlowError::Permission(format!("{} no puede {} {}", who, action, target)))
        }
    }
}
