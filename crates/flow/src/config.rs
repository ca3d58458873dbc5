// Archivo: config.rs
// Propósito: configuración del motor desde variables de entorno (`.env`
// opcional vía dotenvy).
//
// Variables:
// - `PROCFLOW_LOCK`: `none` | `row` | `cache` (por defecto `none`).
// - `PROCFLOW_LOCK_ATTEMPTS`: intentos de `CacheLock` (por defecto 5).
// - `PROCFLOW_LOCK_BACKOFF_MS`: espera base entre intentos (por defecto 50).
// - `PROCFLOW_LOCK_EXPIRY_SECS`: expiración de la clave de cache (60).
// - `PROCFLOW_ROW_LOCK_TIMEOUT_MS`: timeout del bloqueo de fila (5000).
use crate::errors::{FlowError, Result};
use crate::lock::{CacheBackend, CacheLock, LockStrategy, NoLock, RowLock, RowLockStore};
use log::warn;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    None,
    Row,
    Cache,
}

impl FromStr for LockKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" | "no" => Ok(LockKind::None),
            "row" | "select_for_update" => Ok(LockKind::Row),
            "cache" => Ok(LockKind::Cache),
            other => Err(FlowError::Definition(format!("PROCFLOW_LOCK desconocido: {}", other))),
        }
    }
}

/// Opciones del motor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEngineConfig {
    pub lock: LockKind,
    pub lock_attempts: u32,
    pub lock_backoff: Duration,
    pub lock_expiry: Duration,
    pub row_lock_timeout: Duration,
}

impl Default for FlowEngineConfig {
    fn default() -> Self {
        Self { lock: LockKind::None,
               lock_attempts: 5,
               lock_backoff: Duration::from_millis(50),
               lock_expiry: Duration::from_secs(60),
               row_lock_timeout: Duration::from_millis(5000) }
    }
}

fn env_number(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
                                         warn!("{}='{}' no es un número, se usa {}", name, raw, default);
                                         default
                                     }),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    let raw = env_number(name, u64::from(default));
    u32::try_from(raw).unwrap_or_else(|_| {
                          warn!("{}={} excede u32, se usa {}", name, raw, default);
                          default
                      })
}

impl FlowEngineConfig {
    /// Lee la configuración del entorno. Un `PROCFLOW_LOCK` desconocido es
    /// un error; los números mal formados caen al valor por defecto.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        let lock = match std::env::var("PROCFLOW_LOCK") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.lock,
        };
        Ok(Self { lock,
                  lock_attempts: env_u32("PROCFLOW_LOCK_ATTEMPTS", defaults.lock_attempts),
                  lock_backoff: Duration::from_millis(env_number("PROCFLOW_LOCK_BACKOFF_MS",
                                                                 defaults.lock_backoff.as_millis() as u64)),
                  lock_expiry: Duration::from_secs(env_number("PROCFLOW_LOCK_EXPIRY_SECS",
                                                              defaults.lock_expiry.as_secs())),
                  row_lock_timeout: Duration::from_millis(env_number("PROCFLOW_ROW_LOCK_TIMEOUT_MS",
                                                                     defaults.row_lock_timeout.as_millis() as u64)) })
    }

    /// Construye la estrategia configurada. `rows` y `cache` sólo se usan
    /// para `Row` y `Cache` respectivamente.
    pub fn lock_strategy(&self,
                         rows: Arc<dyn RowLockStore>,
                         cache: Arc<dyn CacheBackend>)
                         -> Arc<dyn LockStrategy> {
        match self.lock {
            LockKind::None => Arc::new(NoLock),
            LockKind::Row => Arc::new(RowLock::new(rows, self.row_lock_timeout)),
            LockKind::Cache => Arc::new(CacheLock::new(cache, self.lock_attempts, self.lock_backoff, self.lock_expiry)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_kind_parsing() {
        assert_eq!("ROW".parse::<LockKind>().unwrap(), LockKind::Row);
        assert_eq!("cache".parse::<LockKind>().unwrap(), LockKind::Cache);
        assert_eq!("".parse::<LockKind>().unwrap(), LockKind::None);
        assert!("redis".parse::<LockKind>().is_err());
    }

    #[test]
    fn oversized_numbers_fall_back_to_default() {
        std::env::set_var("PROCFLOW_TEST_ATTEMPTS_BIG", "4294967296");
        assert_eq!(env_u32("PROCFLOW_TEST_ATTEMPTS_BIG", 5), 5);
        std::env::set_var("PROCFLOW_TEST_ATTEMPTS_OK", "7");
        assert_eq!(env_u32("PROCFLOW_TEST_ATTEMPTS_OK", 5), 7);
        assert_eq!(env_u32("PROCFLOW_TEST_ATTEMPTS_UNSET", 5), 5);
    }
}
