mod common;

use common::{harness_with_repo, linear_builder, perform, start_process, stored};
use flow::{CacheBackend, CacheLock, FlowEngineConfig, FlowError, InMemoryCache, InMemoryProcessRepository, LockKind,
           LockStrategy, NoLock, RowLock, RowLockTable, TaskStatus, User};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

#[test]
fn row_lock_blocks_the_second_activation() {
  let repo = Arc::new(InMemoryProcessRepository::new());
  let flow = linear_builder().lock(Arc::new(RowLock::new(repo.clone(), Duration::from_secs(10))))
                             .build()
                             .unwrap();
  let h = harness_with_repo(flow, repo);
  let ana = User::new("ana");
  let (_, created) = start_process(&h, &ana, json!({}));
  let id = created[0].id;

  let mut first = h.engine.activate(&id).unwrap();
  first.prepare(json!({"approved": true}), &ana, None).unwrap();

  let finished = Arc::new(AtomicBool::new(false));
  let engine = h.engine.clone();
  let flag = finished.clone();
  let second = thread::spawn(move || {
    let bob = User::new("bob");
    let result = engine.dispatch(flow::Action::Perform, &id, &bob, Some(json!({})));
    flag.store(true, Ordering::SeqCst);
    result
  });

  thread::sleep(Duration::from_millis(150));
  assert!(!finished.load(Ordering::SeqCst), "la segunda activación no debió avanzar");
  first.done().unwrap();
  drop(first);

  let result = second.join().unwrap();
  // el segundo ve la tarea ya completada (y el proceso terminado)
  assert!(matches!(result, Err(FlowError::Conflict(_))));
  let task = stored(&h, &id);
  assert_eq!(task.status, TaskStatus::Done);
  assert_eq!(task.owner.as_deref(), Some("ana"));
}

#[test]
fn row_lock_times_out_with_conflict() {
  let table = RowLockTable::new();
  let pid = Uuid::new_v4();
  let held = table.lock(pid, Duration::from_millis(10)).unwrap();
  assert!(table.is_locked(&pid));
  let err = table.lock(pid, Duration::from_millis(30)).unwrap_err();
  assert!(matches!(err, FlowError::Conflict(_)));
  drop(held);
  assert!(!table.is_locked(&pid));
  assert!(table.lock(pid, Duration::from_millis(10)).is_ok());
}

#[test]
fn cache_lock_contention_fails_with_conflict() {
  let cache = Arc::new(InMemoryCache::new());
  let lock = Arc::new(CacheLock::new(cache.clone(), 3, Duration::from_millis(5), Duration::from_secs(60)));
  let repo = Arc::new(InMemoryProcessRepository::new());
  let flow = linear_builder().lock(lock).build().unwrap();
  let h = harness_with_repo(flow, repo);
  let ana = User::new("ana");
  let (_, created) = start_process(&h, &ana, json!({}));
  let id = created[0].id;

  let mut first = h.engine.activate(&id).unwrap();
  first.prepare(json!({}), &ana, None).unwrap();
  let contended = perform(&h, &id, &ana, json!({}));
  assert!(matches!(contended, Err(FlowError::Conflict(_))));

  first.done().unwrap();
  drop(first);
  let key = format!("procflow-lock-{}", created[0].process_id);
  assert!(!cache.contains(&key));
}

#[test]
fn cache_lock_is_released_on_every_exit_path() {
  let cache = Arc::new(InMemoryCache::new());
  let lock = CacheLock::new(cache.clone(), 1, Duration::from_millis(1), Duration::from_secs(60));
  let pid = Uuid::new_v4();
  {
    let _guard = lock.acquire(pid).unwrap();
    assert!(matches!(lock.acquire(pid), Err(FlowError::Conflict(_))));
  }
  let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                                          let _guard = lock.acquire(pid).unwrap();
                                          panic!("fallo dentro de la activación");
                                        }));
  assert!(result.is_err());
  assert!(lock.acquire(pid).is_ok());
}

#[test]
fn expired_cache_keys_can_be_taken_over() {
  let cache = InMemoryCache::new();
  assert!(cache.add("k", "a", Duration::from_millis(20)).unwrap());
  assert!(!cache.add("k", "b", Duration::from_millis(20)).unwrap());
  thread::sleep(Duration::from_millis(40));
  assert!(cache.add("k", "b", Duration::from_secs(1)).unwrap());
  // el titular anterior no puede borrar la clave del nuevo
  assert!(!cache.delete_if("k", "a").unwrap());
  assert!(cache.delete_if("k", "b").unwrap());
}

#[test]
fn no_lock_never_blocks() {
  let pid = Uuid::new_v4();
  let a = NoLock.acquire(pid).unwrap();
  let b = NoLock.acquire(pid).unwrap();
  assert_eq!(a.process_id(), b.process_id());
}

#[test]
fn config_builds_the_selected_strategy() {
  let rows = Arc::new(InMemoryProcessRepository::new());
  let cache = Arc::new(InMemoryCache::new());
  let mut config = FlowEngineConfig::default();
  assert_eq!(config.lock, LockKind::None);

  config.lock = LockKind::Cache;
  config.lock_attempts = 1;
  let strategy = config.lock_strategy(rows.clone(), cache.clone());
  let pid = Uuid::new_v4();
  let _held = strategy.acquire(pid).unwrap();
  assert!(matches!(strategy.acquire(pid), Err(FlowError::Conflict(_))));

  config.lock = LockKind::Row;
  config.row_lock_timeout = Duration::from_millis(20);
  let strategy = config.lock_strategy(rows, cache);
  let _row = strategy.acquire(pid).unwrap();
  assert!(matches!(strategy.acquire(pid), Err(FlowError::Conflict(_))));
}
