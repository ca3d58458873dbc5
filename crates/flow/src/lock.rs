// Archivo: lock.rs
// Propósito: estrategias de exclusión mutua por proceso. Garantizan que a lo
// sumo una activación a la vez avance más allá de `prepare` para un mismo
// proceso.
//
// - `NoLock`: sin exclusión (herramientas de un solo hilo).
// - `RowLock`: semántica de bloqueo de fila (select-for-update); espera a
//   que el otro titular libere, acotado por el timeout de la transacción.
// - `CacheLock`: set-if-absent con expiración sobre un `CacheBackend`,
//   reintentado con espera lineal y un número acotado de intentos.
use crate::domain::ProcessId;
use crate::errors::{FlowError, Result};
use log::{debug, warn};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Token de exclusión retenido mientras dura una activación. Se libera al
/// soltarse, en cualquier camino de salida.
pub struct ProcessLock {
    process_id: ProcessId,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ProcessLock {
    pub fn new<F>(process_id: ProcessId, release: F) -> Self
        where F: FnOnce() + Send + 'static
    {
        Self { process_id,
               release: Some(Box::new(release)) }
    }

    /// Lock sin efecto (para `NoLock`).
    pub fn noop(process_id: ProcessId) -> Self {
        Self { process_id,
               release: None }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            debug!("lock liberado para el proceso {}", self.process_id);
        }
    }
}

impl fmt::Debug for ProcessLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLock")
         .field("process_id", &self.process_id)
         .field("held", &self.release.is_some())
         .finish()
    }
}

/// Estrategia de exclusión configurable por flow.
pub trait LockStrategy: Send + Sync + fmt::Debug {
    fn acquire(&self, process_id: ProcessId) -> Result<ProcessLock>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoLock;

impl LockStrategy for NoLock {
    fn acquire(&self, process_id: ProcessId) -> Result<ProcessLock> {
        Ok(ProcessLock::noop(process_id))
    }
}

/// Almacén capaz de bloquear la fila de un proceso hasta que se suelte el
/// `ProcessLock` devuelto. Lo implementan los repositorios.
pub trait RowLockStore: Send + Sync {
    fn lock_row(&self, process_id: ProcessId, timeout: Duration) -> Result<ProcessLock>;
}

/// Bloqueo a nivel de fila: el segundo llamador espera.
pub struct RowLock {
    store: Arc<dyn RowLockStore>,
    timeout: Duration,
}

impl RowLock {
    pub fn new(store: Arc<dyn RowLockStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }
}

impl fmt::Debug for RowLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowLock").field("timeout", &self.timeout).finish()
    }
}

impl LockStrategy for RowLock {
    fn acquire(&self, process_id: ProcessId) -> Result<ProcessLock> {
        self.store.lock_row(process_id, self.timeout)
    }
}

/// Tabla de filas bloqueadas en proceso. La usan los repositorios que no
/// tienen bloqueos de fila nativos (memoria, SQLite).
#[derive(Clone, Default)]
pub struct RowLockTable {
    inner: Arc<RowTableInner>,
}

#[derive(Default)]
struct RowTableInner {
    locked: Mutex<HashSet<ProcessId>>,
    released: Condvar,
}

impl RowLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bloquea la fila; espera mientras otro titular la tenga, hasta
    /// `timeout`. Vencido el plazo devuelve `Conflict`.
    pub fn lock(&self, process_id: ProcessId, timeout: Duration) -> Result<ProcessLock> {
        let deadline = Instant::now() + timeout;
        let mut locked = self.inner
                             .locked
                             .lock()
                             .map_err(|e| FlowError::Storage(format!("mutex poisoned: {:?}", e)))?;
        while locked.contains(&process_id) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("timeout esperando el lock de fila del proceso {}", process_id);
                return Err(FlowError::Conflict(format!("proceso {} bloqueado por otra activación", process_id)));
            }
            let (guard, _) = self.inner
                                 .released
                                 .wait_timeout(locked, remaining)
                                 .map_err(|e| FlowError::Storage(format!("mutex poisoned: {:?}", e)))?;
            locked = guard;
        }
        locked.insert(process_id);
        drop(locked);
        debug!("lock de fila tomado para el proceso {}", process_id);

        let inner = self.inner.clone();
        Ok(ProcessLock::new(process_id, move || {
            let mut locked = inner.locked.lock().unwrap_or_else(|e| e.into_inner());
            locked.remove(&process_id);
            inner.released.notify_all();
        }))
    }

    pub fn is_locked(&self, process_id: &ProcessId) -> bool {
        self.inner
            .locked
            .lock()
            .map(|l| l.contains(process_id))
            .unwrap_or(false)
    }
}

impl RowLockStore for RowLockTable {
    fn lock_row(&self, process_id: ProcessId, timeout: Duration) -> Result<ProcessLock> {
        self.lock(process_id, timeout)
    }
}

/// Cache distribuida mínima: set-if-absent con expiración y borrado
/// condicionado al valor (sólo el titular borra su propia clave).
pub trait CacheBackend: Send + Sync {
    /// Guarda `value` en `key` si no existe (o expiró). Devuelve si se
    /// guardó.
    fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    /// Borra `key` sólo si sigue teniendo `value`.
    fn delete_if(&self, key: &str, value: &str) -> Result<bool>;
}

/// Lock sobre cache con reintentos acotados.
pub struct CacheLock {
    cache: Arc<dyn CacheBackend>,
    attempts: u32,
    backoff: Duration,
    expires: Duration,
}

impl CacheLock {
    pub fn new(cache: Arc<dyn CacheBackend>, attempts: u32, backoff: Duration, expires: Duration) -> Self {
        Self { cache,
               attempts: attempts.max(1),
               backoff,
               expires }
    }

    fn key(process_id: &ProcessId) -> String {
        format!("procflow-lock-{}", process_id)
    }

    /// Espera antes del intento `attempt + 1`: lineal, saturada y nunca mayor
    /// que la expiración de la clave.
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt).min(self.expires)
    }
}

impl fmt::Debug for CacheLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLock")
         .field("attempts", &self.attempts)
         .field("backoff", &self.backoff)
         .field("expires", &self.expires)
         .finish()
    }
}

impl LockStrategy for CacheLock {
    fn acquire(&self, process_id: ProcessId) -> Result<ProcessLock> {
        let key = Self::key(&process_id);
        let token = Uuid::new_v4().to_string();
        for attempt in 1..=self.attempts {
            if self.cache.add(&key, &token, self.expires)? {
                debug!("lock de cache tomado para el proceso {} (intento {})", process_id, attempt);
                let cache = self.cache.clone();
                return Ok(ProcessLock::new(process_id, move || {
                    if let Err(e) = cache.delete_if(&key, &token) {
                        warn!("no se pudo liberar el lock {}: {}", key, e);
                    }
                }));
            }
            if attempt < self.attempts {
                thread::sleep(self.delay(attempt));
            }
        }
        warn!("lock de cache agotado para el proceso {} tras {} intentos", process_id, self.attempts);
        Err(FlowError::Conflict(format!("la tarea no puede ejecutarse: proceso {} bloqueado", process_id)))
    }
}
