// Archivo: node.rs
// Propósito: declaración de nodos (builder fluido con referencias
// simbólicas) y nodos resueltos (`FlowNode`) con sus aristas concretas.
use crate::domain::Process;
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Condición de un nodo `If`. Se evalúa en el momento de recorrer el grafo.
pub type Condition = Arc<dyn Fn(&Process) -> Result<bool> + Send + Sync>;
/// Permiso calculado a partir del proceso (por departamento, por dueño...).
pub type PermissionFn = Arc<dyn Fn(&Process) -> String + Send + Sync>;
/// Regla de auto-asignación de tareas `View`.
pub type AssignFn = Arc<dyn Fn(&Process) -> Option<String> + Send + Sync>;

/// Referencia simbólica a otro nodo del mismo flow; el builder la resuelve
/// en una única pasada.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    ByName(String),
}

impl Reference {
    pub fn name(&self) -> &str {
        match self {
            Reference::ByName(name) => name,
        }
    }
}

impl From<&str> for Reference {
    fn from(name: &str) -> Self {
        Reference::ByName(name.to_string())
    }
}

impl From<String> for Reference {
    fn from(name: String) -> Self {
        Reference::ByName(name)
    }
}

/// Referencia al nodo `name` del flow que se está declarando.
pub fn this(name: &str) -> Reference {
    Reference::ByName(name.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    View,
    If,
    Split,
    Join,
    End,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::View => "view",
            NodeKind::If => "if",
            NodeKind::Split => "split",
            NodeKind::Join => "join",
            NodeKind::End => "end",
        }
    }

    /// Los nodos automáticos los ejecuta el motor al recorrer el grafo; los
    /// humanos (Start, View) esperan a un actor.
    pub fn is_automatic(&self) -> bool {
        matches!(self, NodeKind::If | NodeKind::Split | NodeKind::Join | NodeKind::End)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    Next,
    Then,
    Else,
    SplitBranch,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Next => "next",
            EdgeKind::Then => "then",
            EdgeKind::Else => "else",
            EdgeKind::SplitBranch => "split-branch",
        }
    }
}

/// Posición de un nodo dentro de su flow. Sólo el builder crea valores
/// válidos, así que indexar con él nunca falla.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Arista resuelta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub src: NodeId,
    pub dst: NodeId,
    pub kind: EdgeKind,
}

/// Regla de permiso declarada en un nodo.
#[derive(Clone)]
pub enum PermissionRule {
    /// Nombre de permiso ya cualificado (`app.codename`).
    Static(String),
    /// Nombre calculado a partir del proceso.
    Dynamic(PermissionFn),
    /// Permiso creado automáticamente al cargar el flow. Sin `codename` se
    /// deriva `can_{nodo}_{modelo}`.
    AutoCreate { codename: Option<String>, help_text: Option<String> },
}

impl fmt::Debug for PermissionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionRule::Static(name) => f.debug_tuple("Static").field(name).finish(),
            PermissionRule::Dynamic(_) => f.write_str("Dynamic(..)"),
            PermissionRule::AutoCreate { codename, help_text } => f.debug_struct("AutoCreate")
                                                                    .field("codename", codename)
                                                                    .field("help_text", help_text)
                                                                    .finish(),
        }
    }
}

#[derive(Clone)]
pub(crate) enum NodeShape {
    Start { next: Option<Reference> },
    View { next: Option<Reference>, assign: Option<AssignFn> },
    If { cond: Condition, then: Option<Reference>, otherwise: Option<Reference> },
    Split { branches: Vec<Reference> },
    Join { next: Option<Reference> },
    End,
}

/// Declaración de un nodo, previa a la resolución del grafo.
///
/// ```rust
/// use flow::node::{this, Node};
/// let review = Node::view().fields(["approved"]).permission("docs.can_review").next(this("check"));
/// let check = Node::if_(|p| p.flag("approved")).then(this("end")).otherwise(this("review"));
/// # let _ = (review, check);
/// ```
#[derive(Clone)]
pub struct Node {
    pub(crate) shape: NodeShape,
    pub(crate) permission: Option<PermissionRule>,
    pub(crate) fields: Vec<String>,
    pub(crate) title: Option<String>,
    pub(crate) description: Option<String>,
    /// Usos indebidos del builder; se reportan en `build()`.
    pub(crate) misuse: Vec<String>,
}

impl Node {
    fn with_shape(shape: NodeShape) -> Self {
        Self { shape,
               permission: None,
               fields: Vec::new(),
               title: None,
               description: None,
               misuse: Vec::new() }
    }

    pub fn start() -> Self {
        Self::with_shape(NodeShape::Start { next: None })
    }

    /// Tarea humana.
    pub fn view() -> Self {
        Self::with_shape(NodeShape::View { next: None, assign: None })
    }

    pub fn if_<F>(cond: F) -> Self
        where F: Fn(&Process) -> Result<bool> + Send + Sync + 'static
    {
        Self::with_shape(NodeShape::If { cond: Arc::new(cond),
                                       then: None,
                                       otherwise: None })
    }

    pub fn split() -> Self {
        Self::with_shape(NodeShape::Split { branches: Vec::new() })
    }

    pub fn join() -> Self {
        Self::with_shape(NodeShape::Join { next: None })
    }

    pub fn end() -> Self {
        Self::with_shape(NodeShape::End)
    }

    pub fn kind(&self) -> NodeKind {
        match self.shape {
            NodeShape::Start { .. } => NodeKind::Start,
            NodeShape::View { .. } => NodeKind::View,
            NodeShape::If { .. } => NodeKind::If,
            NodeShape::Split { .. } => NodeKind::Split,
            NodeShape::Join { .. } => NodeKind::Join,
            NodeShape::End => NodeKind::End,
        }
    }

    pub fn next(mut self, target: impl Into<Reference>) -> Self {
        let kind = self.kind();
        match &mut self.shape {
            NodeShape::Start { next } | NodeShape::View { next, .. } | NodeShape::Join { next } => {
                *next = Some(target.into())
            }
            _ => self.misuse.push(format!("next() no aplica a nodos {}", kind)),
        }
        self
    }

    pub fn then(mut self, target: impl Into<Reference>) -> Self {
        let kind = self.kind();
        match &mut self.shape {
            NodeShape::If { then, .. } => *then = Some(target.into()),
            _ => self.misuse.push(format!("then() no aplica a nodos {}", kind)),
        }
        self
    }

    pub fn otherwise(mut self, target: impl Into<Reference>) -> Self {
        let kind = self.kind();
        match &mut self.shape {
            NodeShape::If { otherwise, .. } => *otherwise = Some(target.into()),
            _ => self.misuse.push(format!("otherwise() no aplica a nodos {}", kind)),
        }
        self
    }

    /// Añade una rama paralela a un `Split`.
    pub fn branch(mut self, target: impl Into<Reference>) -> Self {
        let kind = self.kind();
        match &mut self.shape {
            NodeShape::Split { branches } => branches.push(target.into()),
            _ => self.misuse.push(format!("branch() no aplica a nodos {}", kind)),
        }
        self
    }

    /// Campos del payload que la tarea puede modificar (Start y View).
    pub fn fields<I, S>(mut self, fields: I) -> Self
        where I: IntoIterator<Item = S>,
              S: Into<String>
    {
        match self.kind() {
            NodeKind::Start | NodeKind::View => self.fields = fields.into_iter().map(Into::into).collect(),
            other => self.misuse.push(format!("fields() no aplica a nodos {}", other)),
        }
        self
    }

    /// Auto-asignación de la tarea al crearse (sólo View).
    pub fn assign<F>(mut self, rule: F) -> Self
        where F: Fn(&Process) -> Option<String> + Send + Sync + 'static
    {
        let kind = self.kind();
        match &mut self.shape {
            NodeShape::View { assign, .. } => *assign = Some(Arc::new(rule)),
            _ => self.misuse.push(format!("assign() no aplica a nodos {}", kind)),
        }
        self
    }

    /// Permiso estático ya cualificado, p.ej. `orders.can_verify_order`.
    pub fn permission(mut self, name: impl Into<String>) -> Self {
        self.permission = Some(PermissionRule::Static(name.into()));
        self
    }

    pub fn permission_fn<F>(mut self, rule: F) -> Self
        where F: Fn(&Process) -> String + Send + Sync + 'static
    {
        self.permission = Some(PermissionRule::Dynamic(Arc::new(rule)));
        self
    }

    /// Permiso creado al cargar el flow con nombre derivado del nodo.
    pub fn auto_permission(mut self) -> Self {
        self.permission = Some(PermissionRule::AutoCreate { codename: None,
                                                            help_text: None });
        self
    }

    /// Permiso creado al cargar el flow con un codename propio (sin punto).
    pub fn auto_permission_named(mut self, codename: impl Into<String>, help_text: Option<String>) -> Self {
        self.permission = Some(PermissionRule::AutoCreate { codename: Some(codename.into()),
                                                            help_text });
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

    /// Referencias salientes en orden de declaración, con su tipo de arista.
    pub(crate) fn references(&self) -> Vec<(EdgeKind, &Reference)> {
        match &self.shape {
            NodeShape::Start { next } | NodeShape::View { next, .. } | NodeShape::Join { next } => {
                next.iter().map(|r| (EdgeKind::Next, r)).collect()
            }
            NodeShape::If { then, otherwise, .. } => {
                then.iter()
                    .map(|r| (EdgeKind::Then, r))
                    .chain(otherwise.iter().map(|r| (EdgeKind::Else, r)))
                    .collect()
            }
            NodeShape::Split { branches } => branches.iter().map(|r| (EdgeKind::SplitBranch, r)).collect(),
            NodeShape::End => Vec::new(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
         .field("kind", &self.kind())
         .field("references", &self.references())
         .field("permission", &self.permission)
         .field("fields", &self.fields)
         .finish()
    }
}

/// Permiso de un nodo ya resuelto (cualificado con la app del flow).
#[derive(Clone)]
pub enum NodePermission {
    Static(String),
    Dynamic(PermissionFn),
}

impl NodePermission {
    pub fn name_for(&self, process: &Process) -> String {
        match self {
            NodePermission::Static(name) => name.clone(),
            NodePermission::Dynamic(rule) => rule(process),
        }
    }
}

impl fmt::Debug for NodePermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodePermission::Static(name) => f.debug_tuple("Static").field(name).finish(),
            NodePermission::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Nodo resuelto: inmutable mientras viva el flow.
#[derive(Clone)]
pub struct FlowNode {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) flow: String,
    pub(crate) kind: NodeKind,
    pub(crate) outgoing: Vec<Edge>,
    pub(crate) incoming: Vec<Edge>,
    pub(crate) permission: Option<NodePermission>,
    pub(crate) condition: Option<Condition>,
    pub(crate) assign: Option<AssignFn>,
    pub(crate) fields: Vec<String>,
    pub(crate) title: String,
    pub(crate) description: Option<String>,
}

impl FlowNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace del flow dueño del nodo.
    pub fn flow(&self) -> &str {
        &self.flow
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn outgoing(&self) -> &[Edge] {
        &self.outgoing
    }

    pub fn incoming(&self) -> &[Edge] {
        &self.incoming
    }

    pub fn permission(&self) -> Option<&NodePermission> {
        self.permission.as_ref()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_automatic(&self) -> bool {
        self.kind.is_automatic()
    }

    /// Primera arista saliente del tipo indicado.
    pub fn edge(&self, kind: EdgeKind) -> Option<&Edge> {
        self.outgoing.iter().find(|e| e.kind == kind)
    }

    /// Evalúa la condición de un `If` contra el estado actual del proceso.
    pub(crate) fn evaluate(&self, process: &Process) -> Result<bool> {
        match &self.condition {
            Some(cond) => cond(process),
            None => Ok(true),
        }
    }

    pub(crate) fn assignee(&self, process: &Process) -> Option<String> {
        self.assign.as_ref().and_then(|rule| rule(process))
    }
}

impl fmt::Debug for FlowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowNode")
         .field("name", &self.name)
         .field("kind", &self.kind)
         .field("outgoing", &self.outgoing)
         .field("incoming", &self.incoming)
         .field("permission", &self.permission)
         .finish()
    }
}

/// Título legible a partir del nombre del nodo: `approve_order` → "Approve
/// order".
pub(crate) fn humanize(name: &str) -> String {
    let spaced = name.replace('_', " ");
    let mut chars = spaced.trim().chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
