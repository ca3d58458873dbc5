// Archivo: definition.rs
// Propósito: `FlowDefinition`, el grafo resuelto e inmutable que produce
// `FlowBuilder::build`. Se comparte entre hilos como `Arc<FlowDefinition>`.
use crate::errors::{FlowError, Result};
use crate::lock::LockStrategy;
use crate::node::{FlowNode, NodeId, NodeKind};
use crate::urls::{node_urls, UrlPattern};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

pub struct FlowDefinition {
    pub(crate) app_label: String,
    pub(crate) flow_label: String,
    pub(crate) name: String,
    pub(crate) title: String,
    pub(crate) description: Option<String>,
    pub(crate) process_model: String,
    pub(crate) nodes: Vec<FlowNode>,
    pub(crate) by_name: IndexMap<String, NodeId>,
    /// Catálogo de permisos creados al cargar: codename → texto de ayuda.
    pub(crate) permissions: IndexMap<String, String>,
    pub(crate) lock: Arc<dyn LockStrategy>,
    pub(crate) fingerprint: String,
}

impl FlowDefinition {
    pub fn app_label(&self) -> &str {
        &self.app_label
    }

    pub fn flow_label(&self) -> &str {
        &self.flow_label
    }

    /// `app_label/flow_label`; clave del registro y valor de `Process::flow`.
    pub fn namespace(&self) -> String {
        format!("{}/{}", self.app_label, self.flow_label)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Título del proceso ("OrderApprovalFlow" → "Order approval").
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn process_model(&self) -> &str {
        &self.process_model
    }

    /// Nodos en orden de declaración.
    pub fn nodes(&self) -> &[FlowNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Result<&FlowNode> {
        self.by_name
            .get(name)
            .map(|id| &self.nodes[id.index()])
            .ok_or_else(|| FlowError::NotFound(format!("nodo {} en el flow {}", name, self.namespace())))
    }

    pub fn get(&self, id: NodeId) -> &FlowNode {
        &self.nodes[id.index()]
    }

    pub fn start_nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.iter().filter(|n| n.kind() == NodeKind::Start)
    }

    /// Permiso de lectura sobre los procesos del flow.
    pub fn view_permission_name(&self) -> String {
        format!("{}.view_{}", self.app_label, self.process_model)
    }

    /// Permiso de gestión (cancelar, reasignar).
    pub fn manage_permission_name(&self) -> String {
        format!("{}.manage_{}", self.app_label, self.process_model)
    }

    pub fn permissions(&self) -> &IndexMap<String, String> {
        &self.permissions
    }

    pub fn lock(&self) -> &Arc<dyn LockStrategy> {
        &self.lock
    }

    /// Todos los patrones (nodo, acción) que expone el flow.
    pub fn urls(&self) -> Vec<UrlPattern> {
        self.nodes.iter().flat_map(node_urls).collect()
    }

    /// Huella blake3 de la estructura del grafo.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowDefinition")
         .field("namespace", &self.namespace())
         .field("nodes", &self.nodes)
         .field("lock", &self.lock)
         .field("fingerprint", &self.fingerprint)
         .finish()
    }
}
