//! Crate `flow`: motor de procesos de negocio basado en grafos de nodos
//!
//! Un flow se declara con `FlowBuilder` como un conjunto de nodos con nombre
//! (Start, View, If, Split, Join, End) unidos por referencias simbólicas
//! (`this("nombre")`). `build()` resuelve el grafo una sola vez y produce un
//! `FlowDefinition` inmutable que se registra en un `FlowRegistry`.
//!
//! En ejecución, cada `Process` avanza a través de `Task`s. Una `Activation`
//! abre una tarea bajo el lock del proceso (`LockStrategy`) y aplica sus
//! transiciones (`prepare`, `assign`, `unassign`, `done`, `perform`,
//! `cancel`, `undo`) tras consultar la `PermissionGate`. Al completar una tarea el motor
//! recorre las aristas salientes, ejecuta en línea los nodos automáticos y
//! crea las tareas humanas siguientes.
//!
//! Diseño resumido:
//! - Todas las comprobaciones (estado, permisos, campos) ocurren antes de
//!   cualquier escritura, y cada transición se escribe con un único
//!   `ProcessRepository::apply`: un error no deja nada a medias.
//! - Los Joins guardan sus llegadas por (proceso, nodo) y disparan una única
//!   vez cuando han llegado todas sus ramas entrantes.
//! - La persistencia es un contrato (`ProcessRepository`); `stubs` ofrece una
//!   implementación en memoria para pruebas.
//!
//! Ejemplo rápido:
//! ```rust
//! use flow::{FlowBuilder, FlowEngine, InMemoryProcessRepository, Node, StaticPermissions, User, this};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let flow = FlowBuilder::new("docs", "ReviewFlow")
//!     .node("start", Node::start().fields(["text"]).next(this("review")))
//!     .node("review", Node::view().fields(["approved"]).next(this("end")))
//!     .node("end", Node::end())
//!     .build()
//!     .unwrap();
//! let engine = FlowEngine::new(Arc::new(flow),
//!                              Arc::new(InMemoryProcessRepository::new()),
//!                              Arc::new(StaticPermissions::new()));
//! let ana = User::new("ana");
//! let mut start = engine.start("start", &ana).unwrap();
//! let created = start.perform(json!({"text": "hola"}), &ana).unwrap();
//! assert_eq!(created[0].node, "review");
//! ```
pub mod activation;
pub mod config;
pub mod definition;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod hashing;
pub mod lock;
pub mod node;
pub mod permission;
pub mod registry;
pub mod repository;
pub mod service;
pub mod stubs;
mod traversal;
pub mod urls;

pub use activation::Activation;
pub use config::{FlowEngineConfig, LockKind};
pub use definition::FlowDefinition;
pub use domain::*;
pub use engine::FlowEngine;
pub use errors::*;
pub use graph::FlowBuilder;
pub use lock::*;
pub use node::{this, Edge, EdgeKind, FlowNode, Node, NodeId, NodeKind, NodePermission, PermissionRule, Reference};
pub use permission::{PermissionGate, PermissionOracle};
pub use registry::FlowRegistry;
pub use repository::{Changes, ProcessRepository};
pub use service::FlowService;
pub use stubs::*;
pub use traversal::MAX_AUTOMATIC_STEPS;
pub use urls::{task_url, url_name, Action, UrlPattern};
