//! Persistencia Diesel para el motor de procesos.
//! Este archivo expone el módulo `schema` y reexporta el repositorio Diesel
//! que implementa `ProcessRepository` y `RowLockStore`. La implementación
//! detallada está en `process_persistence.rs`.

mod process_persistence;
pub mod schema;

pub use process_persistence::{new_from_env, DieselProcessRepository, DEFAULT_LOCK_POOL_SIZE, DEFAULT_POOL_SIZE,
                              MIGRATIONS};
