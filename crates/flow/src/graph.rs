// Archivo: graph.rs
// Propósito: `FlowBuilder`, que compila declaraciones de nodos en un
// `FlowDefinition` resuelto.
//
// Orden de `build()`:
// 1. validar declaraciones (uso indebido del builder, aristas faltantes,
//    al menos un Start y un End);
// 2. asignar nombre e id a cada nodo;
// 3. resolver referencias simbólicas en una sola pasada;
// 4. invertir aristas salientes en entrantes;
// 5. fijar el namespace del flow en cada nodo;
// 6. sólo entonces, el hook `ready` de cada nodo (permisos auto-creados).
//
// Cualquier error detiene la carga: nunca se devuelve un flow a medias.
use crate::definition::FlowDefinition;
use crate::errors::{FlowError, Result};
use crate::hashing::hash_value;
use crate::lock::{LockStrategy, NoLock};
use crate::node::{humanize, Edge, EdgeKind, FlowNode, Node, NodeId, NodeKind, NodePermission, NodeShape, PermissionRule};
use indexmap::IndexMap;
use log::debug;
use serde_json::json;
use std::sync::Arc;

const DEFAULT_PROCESS_MODEL: &str = "process";

/// Declaración de un flow.
///
/// ```rust
/// use flow::graph::FlowBuilder;
/// use flow::node::{this, Node};
///
/// let flow = FlowBuilder::new("docs::flows", "ReviewFlow")
///     .node("start", Node::start().next(this("review")))
///     .node("review", Node::view().fields(["approved"]).next(this("end")))
///     .node("end", Node::end())
///     .build()
///     .unwrap();
/// assert_eq!(flow.namespace(), "docs/review");
/// ```
#[derive(Clone)]
pub struct FlowBuilder {
    module_path: String,
    name: String,
    nodes: IndexMap<String, Node>,
    process_model: String,
    lock: Arc<dyn LockStrategy>,
    title: Option<String>,
    description: Option<String>,
}

impl FlowBuilder {
    /// `module_path` identifica la app que declara el flow (`module_path!()`
    /// o una ruta con puntos); `name` es el nombre del flow.
    pub fn new(module_path: impl Into<String>, name: impl Into<String>) -> Self {
        Self { module_path: module_path.into(),
               name: name.into(),
               nodes: IndexMap::new(),
               process_model: DEFAULT_PROCESS_MODEL.to_string(),
               lock: Arc::new(NoLock),
               title: None,
               description: None }
    }

    /// Declara (o redefine) un nodo.
    pub fn node(mut self, name: impl Into<String>, node: Node) -> Self {
        self.nodes.insert(name.into(), node);
        self
    }

    /// Hereda los nodos de `base`. Los nodos declarados en este builder
    /// prevalecen sobre los heredados con el mismo nombre.
    pub fn extend(mut self, base: &FlowBuilder) -> Self {
        let mut merged = base.nodes.clone();
        for (name, node) in self.nodes.drain(..) {
            merged.insert(name, node);
        }
        self.nodes = merged;
        self
    }

    /// Nombre del modelo de proceso, usado en los permisos derivados.
    pub fn process_model(mut self, model: impl Into<String>) -> Self {
        self.process_model = model.into();
        self
    }

    pub fn lock(mut self, lock: Arc<dyn LockStrategy>) -> Self {
        self.lock = lock;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn build(self) -> Result<FlowDefinition> {
        let (app_label, flow_label) = derive_labels(&self.module_path, &self.name)?;
        let namespace = format!("{}/{}", app_label, flow_label);
        validate(&namespace, &self.nodes)?;

        let by_name: IndexMap<String, NodeId> =
            self.nodes.keys().enumerate().map(|(idx, name)| (name.clone(), NodeId(idx))).collect();

        let mut outgoing: Vec<Vec<Edge>> = Vec::with_capacity(self.nodes.len());
        for (idx, (name, node)) in self.nodes.iter().enumerate() {
            let mut edges: Vec<Edge> = Vec::new();
            for (kind, reference) in node.references() {
                let dst = by_name.get(reference.name())
                                 .copied()
                                 .ok_or_else(|| FlowError::UnresolvedReference { node: name.clone(),
                                                                                 reference: reference.name()
                                                                                                     .to_string() })?;
                let edge = Edge { src: NodeId(idx),
                                  dst,
                                  kind };
                // Un Split con la misma rama dos veces crea un único sucesor.
                if !edges.contains(&edge) {
                    edges.push(edge);
                }
            }
            outgoing.push(edges);
        }

        let mut incoming: Vec<Vec<Edge>> = vec![Vec::new(); self.nodes.len()];
        for edge in outgoing.iter().flatten() {
            incoming[edge.dst.index()].push(*edge);
        }

        let mut nodes: Vec<FlowNode> = Vec::with_capacity(self.nodes.len());
        for (idx, ((name, node), (out, inc))) in
            self.nodes.iter().zip(outgoing.into_iter().zip(incoming)).enumerate()
        {
            let (condition, assign) = match &node.shape {
                NodeShape::If { cond, .. } => (Some(cond.clone()), None),
                NodeShape::View { assign, .. } => (None, assign.clone()),
                _ => (None, None),
            };
            nodes.push(FlowNode { id: NodeId(idx),
                                  name: name.clone(),
                                  flow: namespace.clone(),
                                  kind: node.kind(),
                                  outgoing: out,
                                  incoming: inc,
                                  permission: None,
                                  condition,
                                  assign,
                                  fields: node.fields.clone(),
                                  title: node.title.clone().unwrap_or_else(|| humanize(name)),
                                  description: node.description.clone() });
        }

        let mut permissions: IndexMap<String, String> = IndexMap::new();
        permissions.insert(format!("view_{}", self.process_model), format!("Can view {}", self.process_model));
        permissions.insert(format!("manage_{}", self.process_model), format!("Can manage {}", self.process_model));

        // Hooks `ready`: el grafo ya está completamente resuelto.
        for (flow_node, node) in nodes.iter_mut().zip(self.nodes.values()) {
            flow_node.permission = ready_permission(flow_node.name(),
                                                    node.permission.as_ref(),
                                                    &app_label,
                                                    &self.process_model,
                                                    &mut permissions)?;
        }

        let fingerprint = fingerprint(&namespace, &nodes);
        let title = self.title.clone().unwrap_or_else(|| process_title(&self.name));
        debug!("flow {} construido: {} nodos, huella {}", namespace, nodes.len(), fingerprint);

        Ok(FlowDefinition { app_label,
                            flow_label,
                            name: self.name,
                            title,
                            description: self.description,
                            process_model: self.process_model,
                            nodes,
                            by_name,
                            permissions,
                            lock: self.lock,
                            fingerprint })
    }
}

fn validate(namespace: &str, nodes: &IndexMap<String, Node>) -> Result<()> {
    if nodes.is_empty() {
        return Err(FlowError::Definition(format!("el flow {} no declara nodos", namespace)));
    }
    for (name, node) in nodes {
        if name.is_empty() || name.contains('/') {
            return Err(FlowError::Definition(format!("nombre de nodo inválido: '{}'", name)));
        }
        if let Some(misuse) = node.misuse.first() {
            return Err(FlowError::Definition(format!("nodo {}: {}", name, misuse)));
        }
        let missing = match &node.shape {
            NodeShape::Start { next: None } | NodeShape::View { next: None, .. } | NodeShape::Join { next: None } => {
                Some("next")
            }
            NodeShape::If { then: None, .. } => Some("then"),
            NodeShape::If { otherwise: None, .. } => Some("else"),
            NodeShape::Split { branches } if branches.is_empty() => Some("branch"),
            _ => None,
        };
        if let Some(edge) = missing {
            return Err(FlowError::Definition(format!("el nodo {} ({}) no declara '{}'", name, node.kind(), edge)));
        }
    }
    if !nodes.values().any(|n| n.kind() == NodeKind::Start) {
        return Err(FlowError::Definition(format!("el flow {} no tiene nodo Start", namespace)));
    }
    if !nodes.values().any(|n| n.kind() == NodeKind::End) {
        return Err(FlowError::Definition(format!("el flow {} no tiene nodo End", namespace)));
    }
    Ok(())
}

/// Hook `ready` del permiso de un nodo. Los permisos auto-creados se
/// registran una sola vez en el catálogo y se cualifican con la app.
fn ready_permission(node: &str,
                    rule: Option<&PermissionRule>,
                    app_label: &str,
                    process_model: &str,
                    catalogue: &mut IndexMap<String, String>)
                    -> Result<Option<NodePermission>> {
    let permission = match rule {
        None => None,
        Some(PermissionRule::Static(name)) => Some(NodePermission::Static(name.clone())),
        Some(PermissionRule::Dynamic(rule)) => Some(NodePermission::Dynamic(rule.clone())),
        Some(PermissionRule::AutoCreate { codename, help_text }) => {
            let (codename, default_help) = match codename {
                Some(codename) => {
                    if codename.contains('.') {
                        return Err(FlowError::Definition(format!("nodo {}: el permiso auto-creado '{}' no puede \
                                                                  llevar app",
                                                                 node, codename)));
                    }
                    (codename.clone(), humanize(codename))
                }
                None => (format!("can_{}_{}", node, process_model), format!("Can {}", node.replace('_', " "))),
            };
            catalogue.entry(codename.clone())
                     .or_insert_with(|| help_text.clone().unwrap_or(default_help));
            Some(NodePermission::Static(format!("{}.{}", app_label, codename)))
        }
    };
    Ok(permission)
}

fn split_path(path: &str) -> Vec<String> {
    path.split("::")
        .flat_map(|s| s.split('.'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `("orders::flows", "OrderFlow")` → `("orders", "order")`;
/// `("shop.flows.billing", "RefundFlow")` → `("shop", "billing/refund")`.
pub(crate) fn derive_labels(module_path: &str, name: &str) -> Result<(String, String)> {
    let segments = split_path(module_path);
    let app_label = segments.first()
                            .cloned()
                            .ok_or_else(|| FlowError::Definition(format!("ruta de módulo vacía para el flow {}", name)))?;
    let mut rest: Vec<String> = segments.into_iter().skip(1).collect();
    if rest.first().map(String::as_str) == Some("flows") {
        rest.remove(0);
    }
    let short = match name.strip_suffix("Flow") {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => name,
    };
    if short.is_empty() {
        return Err(FlowError::Definition("el flow no tiene nombre".to_string()));
    }
    rest.push(short.to_string());
    let flow_label = rest.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>().join("/");
    Ok((app_label.to_lowercase(), flow_label))
}

/// "OrderApprovalFlow" → "Order approval".
pub(crate) fn process_title(name: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in name.chars() {
        if ch == '_' || ch == ' ' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if ch.is_uppercase() && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        words.push(current);
    }
    if words.len() > 1 && words.last().map(String::as_str) == Some("Flow") {
        words.pop();
    }
    humanize(&words.join(" ").to_lowercase())
}

fn fingerprint(namespace: &str, nodes: &[FlowNode]) -> String {
    let nodes_json: Vec<_> = nodes.iter()
                                  .map(|n| {
                                      let edges: Vec<_> =
                                          n.outgoing()
                                           .iter()
                                           .map(|e| json!([e.kind.as_str(), nodes[e.dst.index()].name()]))
                                           .collect();
                                      json!({ "name": n.name(), "kind": n.kind().as_str(), "edges": edges })
                                  })
                                  .collect();
    hash_value(&json!({ "flow": namespace, "nodes": nodes_json }))
}
