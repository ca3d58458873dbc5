// Archivo: errors.rs
// Propósito: definir los errores del motor de procesos y el alias Result<T>
// usado por las APIs del crate.
use thiserror::Error;

/// Errores del motor de flujos.
///
/// - `UnresolvedReference` y `Definition`: errores fatales al construir un
///   flow; el flow no llega a cargarse.
/// - `Permission`, `Conflict` y `Validation`: errores recuperables que se
///   devuelven al llamador sin haber mutado ningún estado.
/// - `NotFound` y `Storage`: errores de acceso al repositorio o a los locks.
#[derive(Error, Debug)]
pub enum FlowError {
  /// Un nodo referencia (`this("...")`) un nombre que no fue declarado.
  #[error("Referencia sin resolver en el nodo '{node}': '{reference}'")]
  UnresolvedReference { node: String, reference: String },
  /// Declaración de flow mal formada (aristas faltantes, uso indebido del
  /// builder, flow sin Start o sin End).
  #[error("Definición inválida: {0}")]
  Definition(String),
  /// El actor no tiene permiso para la acción pedida.
  #[error("Permiso denegado: {0}")]
  Permission(String),
  /// Guardia de transición fallida: estado incorrecto, lock ocupado, token
  /// de `prepare` obsoleto o proceso terminado.
  #[error("Conflicto: {0}")]
  Conflict(String),
  /// Los datos enviados no respetan los campos declarados del nodo.
  #[error("Error de validación: {0}")]
  Validation(String),
  /// Entidad no encontrada (proceso, tarea, nodo o flow).
  #[error("No encontrado: {0}")]
  NotFound(String),
  /// Error genérico de almacenamiento (BD, mutex envenenado, cache).
  #[error("Error de almacenamiento: {0}")]
  Storage(String),
}

impl FlowError {
  /// Indica si el error es recuperable en la frontera (el llamador puede
  /// reintentar o informar al actor).
  pub fn is_recoverable(&self) -> bool {
    matches!(self,
             FlowError::Permission(_) | FlowError::Conflict(_) | FlowError::Validation(_) | FlowError::NotFound(_))
  }
}

/// Alias de resultado usado por las APIs del crate.
pub type Result<T> = std::result::Result<T, FlowError>;
