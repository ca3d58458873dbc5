use crate::schema;
use crate::schema::join_arrivals::dsl as arrivals_dsl;
use crate::schema::processes::dsl as processes_dsl;
use crate::schema::tasks::dsl as tasks_dsl;
use chrono::{DateTime, Utc};
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use flow::{Changes, FlowError, Process, ProcessId, ProcessLock, ProcessRepository, Result, RowLockStore, Task,
           TaskFilter, TaskId};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");
#[cfg(feature = "pg")]
type DbConn = PgConnection;
#[cfg(not(feature = "pg"))]
type DbConn = SqliteConnection;
#[cfg(feature = "pg")]
type DbBackend = diesel::pg::Pg;
#[cfg(not(feature = "pg"))]
type DbBackend = diesel::sqlite::Sqlite;
type DbPool = Pool<ConnectionManager<DbConn>>;
/// Cada conexión SQLite del pool espera hasta 5s si la base está ocupada.
#[cfg(not(feature = "pg"))]
#[derive(Debug)]
struct SqlitePragmas;
#[cfg(not(feature = "pg"))]
impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
  fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
    diesel::sql_query("PRAGMA busy_timeout = 5000;").execute(conn).map_err(diesel::r2d2::Error::QueryError)?;
    Ok(())
  }
}
/// Conexiones del pool de datos.
pub const DEFAULT_POOL_SIZE: u32 = 4;
/// Conexiones reservadas a locks de fila (sólo Postgres): acota cuántas
/// activaciones pueden retener un lock a la vez.
pub const DEFAULT_LOCK_POOL_SIZE: u32 = 16;
/// Repo Diesel que implementa `ProcessRepository` y `RowLockStore`.
///
/// En SQLite el bloqueo de fila es una tabla en memoria del propio repo: dos
/// instancias sobre la misma base no se excluyen entre sí. En Postgres es un
/// `SELECT ... FOR UPDATE` sobre `process_locks` retenido hasta soltar el
/// `ProcessLock`, en una conexión de un pool aparte: los titulares de locks
/// nunca dejan sin conexiones a las lecturas y escrituras de su activación.
/// Con el pool de locks agotado, `lock_row` espera hasta su timeout y
/// devuelve `Conflict`.
pub struct DieselProcessRepository {
  pool: Arc<DbPool>,
  #[cfg(feature = "pg")]
  locks: Arc<DbPool>,
  #[cfg(not(feature = "pg"))]
  rows: flow::RowLockTable,
}
fn build_pool(database_url: &str, size: u32) -> Result<DbPool> {
  let manager = ConnectionManager::<DbConn>::new(database_url);
  let builder = Pool::<ConnectionManager<DbConn>>::builder().max_size(size.max(1));
  #[cfg(not(feature = "pg"))]
  let builder = builder.connection_customizer(Box::new(SqlitePragmas));
  builder.build(manager)
         .map_err(|e| FlowError::Storage(format!("no se pudo crear el pool de conexiones: {}", e)))
}
impl DieselProcessRepository {
  pub fn new(database_url: &str) -> Result<Self> {
    Self::with_pool_sizes(database_url, DEFAULT_POOL_SIZE, DEFAULT_LOCK_POOL_SIZE)
  }
  /// `lock_pool_size` sólo se usa con Postgres.
  pub fn with_pool_sizes(database_url: &str, pool_size: u32, lock_pool_size: u32) -> Result<Self> {
    let pool = build_pool(database_url, pool_size)?;
    #[cfg(not(feature = "pg"))]
    let _ = lock_pool_size;
    let repo = DieselProcessRepository { pool: Arc::new(pool),
                                         #[cfg(feature = "pg")]
                                         locks: Arc::new(build_pool(database_url, lock_pool_size)?),
                                         #[cfg(not(feature = "pg"))]
                                         rows: flow::RowLockTable::new() };
    let mut conn = repo.conn()?;
    let applied = conn.run_pending_migrations(MIGRATIONS)
                      .map_err(|e| FlowError::Storage(format!("migraciones: {}", e)))?;
    if !applied.is_empty() {
      info!("{} migraciones aplicadas", applied.len());
    }
    drop(conn);
    Ok(repo)
  }
  fn conn(&self) -> Result<PooledConnection<ConnectionManager<DbConn>>> {
    self.pool.get().map_err(|e| FlowError::Storage(format!("pool: {}", e)))
  }
}
#[derive(Debug, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = schema::processes, treat_none_as_null = true)]
struct ProcessRow {
  pub id: String,
  pub flow: String,
  pub status: String,
  pub created_at_ts: i64,
  pub finished_at_ts: Option<i64>,
  pub created_by: Option<String>,
  pub payload: String,
  pub fingerprint: String,
}
#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::tasks)]
struct TaskRow {
  pub id: String,
  pub seq: i64,
  pub process_id: String,
  pub flow: String,
  pub node: String,
  pub status: String,
  pub owner: Option<String>,
  pub created_at_ts: i64,
  pub started_at_ts: Option<i64>,
  pub finished_at_ts: Option<i64>,
  pub comment: Option<String>,
  pub previous: String,
}
/// Columnas que una tarea puede cambiar tras crearse.
#[derive(Debug, AsChangeset)]
#[diesel(table_name = schema::tasks, treat_none_as_null = true)]
struct TaskChanges {
  pub status: String,
  pub owner: Option<String>,
  pub started_at_ts: Option<i64>,
  pub finished_at_ts: Option<i64>,
  pub comment: Option<String>,
  pub previous: String,
}
#[derive(Debug, Insertable)]
#[diesel(table_name = schema::join_arrivals)]
struct ArrivalRow {
  pub process_id: String,
  pub join_node: String,
  pub source: String,
  pub position: i64,
}
fn db_error(e: DieselError) -> FlowError {
  match e {
    DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
      FlowError::Conflict(format!("db: {}", info.message()))
    }
    other => FlowError::Storage(format!("db: {}", other)),
  }
}
fn map_db_err<T>(res: std::result::Result<T, DieselError>) -> Result<T> {
  res.map_err(db_error)
}
fn from_micros(ts: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_micros(ts).ok_or_else(|| FlowError::Storage(format!("marca de tiempo inválida: {}", ts)))
}
fn parse_uuid(raw: &str) -> Result<Uuid> {
  Uuid::parse_str(raw).map_err(|e| FlowError::Storage(format!("invalid uuid '{}': {}", raw, e)))
}
fn process_row(p: &Process) -> ProcessRow {
  ProcessRow { id: p.id.to_string(),
               flow: p.flow.clone(),
               status: p.status.as_str().to_string(),
               created_at_ts: p.created_at.timestamp_micros(),
               finished_at_ts: p.finished_at.map(|t| t.timestamp_micros()),
               created_by: p.created_by.clone(),
               payload: p.payload.to_string(),
               fingerprint: p.fingerprint.clone() }
}
fn process_from_row(r: ProcessRow) -> Result<Process> {
  Ok(Process { id: parse_uuid(&r.id)?,
               flow: r.flow,
               status: r.status.parse()?,
               created_at: from_micros(r.created_at_ts)?,
               finished_at: r.finished_at_ts.map(from_micros).transpose()?,
               created_by: r.created_by,
               payload: serde_json::from_str(&r.payload).map_err(|e| FlowError::Storage(format!("payload: {}", e)))?,
               fingerprint: r.fingerprint })
}
fn previous_json(t: &Task) -> Result<String> {
  let ids: Vec<String> = t.previous.iter().map(|id| id.to_string()).collect();
  serde_json::to_string(&ids).map_err(|e| FlowError::Storage(format!("previous: {}", e)))
}
fn task_from_row(r: TaskRow) -> Result<Task> {
  let previous: Vec<String> =
    serde_json::from_str(&r.previous).map_err(|e| FlowError::Storage(format!("previous: {}", e)))?;
  Ok(Task { id: parse_uuid(&r.id)?,
            process_id: parse_uuid(&r.process_id)?,
            flow: r.flow,
            node: r.node,
            status: r.status.parse()?,
            owner: r.owner,
            created_at: from_micros(r.created_at_ts)?,
            started_at: r.started_at_ts.map(from_micros).transpose()?,
            finished_at: r.finished_at_ts.map(from_micros).transpose()?,
            comment: r.comment,
            previous: previous.iter().map(|s| parse_uuid(s)).collect::<Result<Vec<_>>>()? })
}
fn task_row(task: &Task) -> Result<TaskRow> {
  Ok(TaskRow { id: task.id.to_string(),
               seq: 0,
               process_id: task.process_id.to_string(),
               flow: task.flow.clone(),
               node: task.node.clone(),
               status: task.status.as_str().to_string(),
               owner: task.owner.clone(),
               created_at_ts: task.created_at.timestamp_micros(),
               started_at_ts: task.started_at.map(|t| t.timestamp_micros()),
               finished_at_ts: task.finished_at.map(|t| t.timestamp_micros()),
               comment: task.comment.clone(),
               previous: previous_json(task)? })
}
fn task_changes(task: &Task) -> Result<(String, TaskChanges)> {
  Ok((task.id.to_string(),
      TaskChanges { status: task.status.as_str().to_string(),
                    owner: task.owner.clone(),
                    started_at_ts: task.started_at.map(|t| t.timestamp_micros()),
                    finished_at_ts: task.finished_at.map(|t| t.timestamp_micros()),
                    comment: task.comment.clone(),
                    previous: previous_json(task)? }))
}
/// Error dentro de la transacción de `apply`: de la base o un registro que
/// no existe (se revierte igual).
enum TxError {
  Db(DieselError),
  Missing(String),
}
impl From<DieselError> for TxError {
  fn from(e: DieselError) -> Self {
    TxError::Db(e)
  }
}
/// `Changes` ya convertidos a filas, listos para escribir.
struct Rows {
  new_process: Option<ProcessRow>,
  process: Option<ProcessRow>,
  created: Vec<TaskRow>,
  updated: Vec<(String, TaskChanges)>,
  arrivals: Vec<(String, String, Vec<ArrivalRow>)>,
}
impl Rows {
  fn from_changes(changes: &Changes) -> Result<Self> {
    let mut arrivals = Vec::with_capacity(changes.arrivals.len());
    for (process_id, join, arrived) in &changes.arrivals {
      let pid = process_id.to_string();
      let rows: Vec<ArrivalRow> = arrived.iter()
                                         .enumerate()
                                         .map(|(i, source)| ArrivalRow { process_id: pid.clone(),
                                                                         join_node: join.clone(),
                                                                         source: source.clone(),
                                                                         position: i as i64 })
                                         .collect();
      arrivals.push((pid, join.clone(), rows));
    }
    Ok(Rows { new_process: changes.new_process.as_ref().map(process_row),
              process: changes.process.as_ref().map(process_row),
              created: changes.created.iter().map(task_row).collect::<Result<_>>()?,
              updated: changes.updated.iter().map(task_changes).collect::<Result<_>>()?,
              arrivals })
  }
  fn write(mut self, conn: &mut DbConn) -> std::result::Result<(), TxError> {
    if let Some(row) = &self.new_process {
      diesel::insert_into(processes_dsl::processes).values(row).execute(conn)?;
    }
    if let Some(row) = &self.process {
      let updated = diesel::update(processes_dsl::processes.filter(processes_dsl::id.eq(&row.id))).set(row)
                                                                                                 .execute(conn)?;
      if updated == 0 {
        return Err(TxError::Missing(format!("proceso {}", row.id)));
      }
    }
    if !self.created.is_empty() {
      // `seq` conserva el orden de creación aunque dos tareas compartan
      // marca de tiempo.
      let last: Option<i64> = tasks_dsl::tasks.select(max(tasks_dsl::seq)).first(conn)?;
      let mut seq = last.unwrap_or(0);
      for row in &mut self.created {
        seq += 1;
        row.seq = seq;
        diesel::insert_into(tasks_dsl::tasks).values(&*row).execute(conn)?;
      }
    }
    for (id, changes) in &self.updated {
      let updated = diesel::update(tasks_dsl::tasks.filter(tasks_dsl::id.eq(id))).set(changes).execute(conn)?;
      if updated == 0 {
        return Err(TxError::Missing(format!("tarea {}", id)));
      }
    }
    for (pid, join, rows) in &self.arrivals {
      diesel::delete(arrivals_dsl::join_arrivals.filter(arrivals_dsl::process_id.eq(pid))
                                                .filter(arrivals_dsl::join_node.eq(join)))
      .execute(conn)?;
      for row in rows {
        diesel::insert_into(arrivals_dsl::join_arrivals).values(row).execute(conn)?;
      }
    }
    Ok(())
  }
}
impl ProcessRepository for DieselProcessRepository {
  fn create_process(&self, process: &Process) -> Result<()> {
    self.apply(&Changes { new_process: Some(process.clone()),
                          ..Default::default() })
  }
  fn load_process(&self, id: &ProcessId) -> Result<Process> {
    let mut conn = self.conn()?;
    let row = map_db_err(processes_dsl::processes.filter(processes_dsl::id.eq(id.to_string()))
                                                 .first::<ProcessRow>(&mut conn)
                                                 .optional())?;
    process_from_row(row.ok_or_else(|| FlowError::NotFound(format!("proceso {}", id)))?)
  }
  fn save_process(&self, process: &Process) -> Result<()> {
    self.apply(&Changes { process: Some(process.clone()),
                          ..Default::default() })
  }
  fn create_task(&self, task: &Task) -> Result<()> {
    self.apply(&Changes { created: vec![task.clone()],
                          ..Default::default() })
  }
  fn load_task(&self, id: &TaskId) -> Result<Task> {
    let mut conn = self.conn()?;
    let row = map_db_err(tasks_dsl::tasks.filter(tasks_dsl::id.eq(id.to_string()))
                                         .first::<TaskRow>(&mut conn)
                                         .optional())?;
    task_from_row(row.ok_or_else(|| FlowError::NotFound(format!("tarea {}", id)))?)
  }
  fn save_task(&self, task: &Task) -> Result<()> {
    self.apply(&Changes { updated: vec![task.clone()],
                          ..Default::default() })
  }
  fn tasks_for_process(&self, process_id: &ProcessId) -> Result<Vec<Task>> {
    self.list_tasks(&TaskFilter { process_id: Some(*process_id),
                                  ..Default::default() })
  }
  fn list_processes(&self, flow: Option<&str>) -> Result<Vec<Process>> {
    let mut conn = self.conn()?;
    let mut query = processes_dsl::processes.into_boxed::<DbBackend>();
    if let Some(flow) = flow {
      query = query.filter(processes_dsl::flow.eq(flow.to_string()));
    }
    let rows = map_db_err(query.order((processes_dsl::created_at_ts.asc(), processes_dsl::id.asc()))
                               .load::<ProcessRow>(&mut conn))?;
    rows.into_iter().map(process_from_row).collect()
  }
  fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
    let mut conn = self.conn()?;
    let mut query = tasks_dsl::tasks.into_boxed::<DbBackend>();
    if let Some(flow) = &filter.flow {
      query = query.filter(tasks_dsl::flow.eq(flow.clone()));
    }
    if let Some(pid) = &filter.process_id {
      query = query.filter(tasks_dsl::process_id.eq(pid.to_string()));
    }
    if !filter.statuses.is_empty() {
      let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
      query = query.filter(tasks_dsl::status.eq_any(statuses));
    }
    if let Some(owner) = &filter.owner {
      query = query.filter(tasks_dsl::owner.eq(owner.clone()));
    }
    if filter.unowned {
      query = query.filter(tasks_dsl::owner.is_null());
    }
    let rows = map_db_err(query.order(tasks_dsl::seq.asc()).load::<TaskRow>(&mut conn))?;
    rows.into_iter().map(task_from_row).collect()
  }
  fn join_arrivals(&self, process_id: &ProcessId, join: &str) -> Result<Vec<String>> {
    let mut conn = self.conn()?;
    map_db_err(arrivals_dsl::join_arrivals.filter(arrivals_dsl::process_id.eq(process_id.to_string()))
                                          .filter(arrivals_dsl::join_node.eq(join))
                                          .order(arrivals_dsl::position.asc())
                                          .select(arrivals_dsl::source)
                                          .load::<String>(&mut conn))
  }
  fn save_join_arrivals(&self, process_id: &ProcessId, join: &str, arrived: &[String]) -> Result<()> {
    self.apply(&Changes { arrivals: vec![(*process_id, join.to_string(), arrived.to_vec())],
                          ..Default::default() })
  }
  fn apply(&self, changes: &Changes) -> Result<()> {
    if changes.is_empty() {
      return Ok(());
    }
    let rows = Rows::from_changes(changes)?;
    let mut pooled = self.conn()?;
    let conn: &mut DbConn = &mut pooled;
    conn.transaction::<_, TxError, _>(|conn| rows.write(conn)).map_err(|e| match e {
                                                                  TxError::Db(e) => db_error(e),
                                                                  TxError::Missing(what) => FlowError::NotFound(what),
                                                                })
  }
}
#[cfg(not(feature = "pg"))]
impl RowLockStore for DieselProcessRepository {
  fn lock_row(&self, process_id: ProcessId, timeout: Duration) -> Result<ProcessLock> {
    self.rows.lock(process_id, timeout)
  }
}
#[cfg(feature = "pg")]
impl RowLockStore for DieselProcessRepository {
  fn lock_row(&self, process_id: ProcessId, timeout: Duration) -> Result<ProcessLock> {
    use diesel::sql_types::Text;
    let mut conn = self.locks.get_timeout(timeout).map_err(|e| {
                     log::warn!("sin conexiones de lock para el proceso {}: {}", process_id, e);
                     FlowError::Conflict(format!("proceso {}: demasiados locks retenidos", process_id))
                   })?;
    let key = process_id.to_string();
    map_db_err(diesel::sql_query("INSERT INTO process_locks (process_id) VALUES ($1) ON CONFLICT DO NOTHING")
                 .bind::<Text, _>(&key)
                 .execute(&mut conn))?;
    // La transacción queda abierta en esta conexión hasta soltar el lock.
    map_db_err(diesel::sql_query("BEGIN").execute(&mut conn))?;
    map_db_err(diesel::sql_query(format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis())).execute(&mut conn))?;
    let locked = diesel::sql_query("SELECT process_id FROM process_locks WHERE process_id = $1 FOR UPDATE")
                   .bind::<Text, _>(&key)
                   .execute(&mut conn);
    if let Err(e) = locked {
      let _ = diesel::sql_query("ROLLBACK").execute(&mut conn);
      log::warn!("timeout esperando el lock de fila del proceso {}: {}", process_id, e);
      return Err(FlowError::Conflict(format!("proceso {} bloqueado por otra activación", process_id)));
    }
    debug!("lock de fila (FOR UPDATE) tomado para el proceso {}", process_id);
    Ok(ProcessLock::new(process_id, move || {
         let mut conn = conn;
         if let Err(e) = diesel::sql_query("COMMIT").execute(&mut conn) {
           log::warn!("no se pudo liberar el lock de fila: {}", e);
         }
       }))
  }
}
fn pool_size_from_env(name: &str, default: u32) -> u32 {
  match std::env::var(name) {
    Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
                                     log::warn!("{}='{}' no es un tamaño de pool válido, se usa {}", name, raw, default);
                                     default
                                   }),
    Err(_) => default,
  }
}
/// Crear repo desde las variables de entorno.
///
/// Lee `PROCFLOW_DB_URL` y usa `DATABASE_URL` como respaldo. Los pools se
/// dimensionan con `PROCFLOW_DB_POOL_SIZE` y, en Postgres,
/// `PROCFLOW_LOCK_POOL_SIZE`. Sin `pg` y sin
/// variables se usa una base SQLite en memoria compartida.
#[cfg(not(feature = "pg"))]
pub fn new_from_env() -> Result<DieselProcessRepository> {
  dotenvy::dotenv().ok();
  let url = std::env::var("PROCFLOW_DB_URL").or_else(|_| std::env::var("DATABASE_URL"))
                                            .unwrap_or_else(|_| "file:procflow?mode=memory&cache=shared".into());
  debug!("abriendo SQLite en {}", url);
  DieselProcessRepository::with_pool_sizes(&url, pool_size_from_env("PROCFLOW_DB_POOL_SIZE", DEFAULT_POOL_SIZE), 1)
}
#[cfg(feature = "pg")]
pub fn new_from_env() -> Result<DieselProcessRepository> {
  dotenvy::dotenv().ok();
  let url = std::env::var("PROCFLOW_DB_URL").or_else(|_| std::env::var("DATABASE_URL"))
                                            .map_err(|_| {
                                              FlowError::Storage("PROCFLOW_DB_URL / DATABASE_URL not set".into())
                                            })?;
  let l = url.to_lowercase();
  if !(l.starts_with("postgres") || url.contains('@')) {
    return Err(FlowError::Storage("PROCFLOW_DB_URL / DATABASE_URL does not look like Postgres URL".into()));
  }
  DieselProcessRepository::with_pool_sizes(&url,
                                           pool_size_from_env("PROCFLOW_DB_POOL_SIZE", DEFAULT_POOL_SIZE),
                                           pool_size_from_env("PROCFLOW_LOCK_POOL_SIZE", DEFAULT_LOCK_POOL_SIZE))
}
