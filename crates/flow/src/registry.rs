// Archivo: registry.rs
// Propósito: registro explícito de flows por namespace. Se construye una vez
// al arrancar y se comparte como `Arc<FlowRegistry>`.
use crate::definition::FlowDefinition;
use crate::errors::{FlowError, Result};
use indexmap::IndexMap;
use log::debug;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: IndexMap<String, Arc<FlowDefinition>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un flow. Dos flows con el mismo namespace son un error de
    /// definición.
    pub fn register(&mut self, flow: FlowDefinition) -> Result<Arc<FlowDefinition>> {
        let namespace = flow.namespace();
        if self.flows.contains_key(&namespace) {
            return Err(FlowError::Definition(format!("flow {} registrado dos veces", namespace)));
        }
        let flow = Arc::new(flow);
        debug!("flow {} registrado", namespace);
        self.flows.insert(namespace, flow.clone());
        Ok(flow)
    }

    pub fn get(&self, namespace: &str) -> Result<Arc<FlowDefinition>> {
        self.flows
            .get(namespace)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(format!("flow {}", namespace)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FlowDefinition>> {
        self.flows.values()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
