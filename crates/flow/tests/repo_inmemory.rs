mod common;

use common::split_join_builder;
use flow::{Changes, FlowEngine, FlowError, InMemoryProcessRepository, Process, ProcessId, ProcessRepository,
           StaticPermissions, Task, TaskFilter, TaskId, User};
use serde_json::json;
use std::sync::Arc;

#[test]
fn apply_writes_everything_or_nothing() {
  let repo = InMemoryProcessRepository::new();
  let process = Process::new("docs::flows", "abc", None);
  let first = Task::new(&process, "start", vec![]);
  let ghost = Task::new(&process, "review", vec![]);

  // una tarea a actualizar que no existe invalida todo el lote
  let broken = Changes { new_process: Some(process.clone()),
                         created: vec![first.clone()],
                         updated: vec![ghost],
                         arrivals: vec![(process.id, "join".into(), vec!["a".into()])],
                         ..Default::default() };
  assert!(matches!(repo.apply(&broken), Err(FlowError::NotFound(_))));
  assert!(matches!(repo.load_process(&process.id), Err(FlowError::NotFound(_))));
  assert!(matches!(repo.load_task(&first.id), Err(FlowError::NotFound(_))));
  assert!(repo.join_arrivals(&process.id, "join").unwrap().is_empty());

  // una tarea nueva repetida también
  let duplicated = Changes { new_process: Some(process.clone()),
                             created: vec![first.clone(), first.clone()],
                             ..Default::default() };
  assert!(matches!(repo.apply(&duplicated), Err(FlowError::Conflict(_))));
  assert!(repo.list_processes(None).unwrap().is_empty());

  let mut done = first.clone();
  done.status = flow::TaskStatus::Done;
  let ok = Changes { new_process: Some(process.clone()),
                     created: vec![first.clone()],
                     updated: vec![done.clone()],
                     ..Default::default() };
  repo.apply(&ok).unwrap();
  assert_eq!(repo.load_task(&first.id).unwrap(), done);
  assert_eq!(repo.tasks_for_process(&process.id).unwrap().len(), 1);
}

/// Repositorio que falla al crear tareas de un nodo concreto.
struct FailingRepository {
  inner: InMemoryProcessRepository,
  fail_on: &'static str,
}

impl ProcessRepository for FailingRepository {
  fn create_process(&self, process: &Process) -> flow::Result<()> {
    self.inner.create_process(process)
  }

  fn load_process(&self, id: &ProcessId) -> flow::Result<Process> {
    self.inner.load_process(id)
  }

  fn save_process(&self, process: &Process) -> flow::Result<()> {
    self.inner.save_process(process)
  }

  fn create_task(&self, task: &Task) -> flow::Result<()> {
    if task.node == self.fail_on {
      return Err(FlowError::Storage("disk full".into()));
    }
    self.inner.create_task(task)
  }

  fn load_task(&self, id: &TaskId) -> flow::Result<Task> {
    self.inner.load_task(id)
  }

  fn save_task(&self, task: &Task) -> flow::Result<()> {
    self.inner.save_task(task)
  }

  fn tasks_for_process(&self, process_id: &ProcessId) -> flow::Result<Vec<Task>> {
    self.inner.tasks_for_process(process_id)
  }

  fn list_processes(&self, flow: Option<&str>) -> flow::Result<Vec<Process>> {
    self.inner.list_processes(flow)
  }

  fn list_tasks(&self, filter: &TaskFilter) -> flow::Result<Vec<Task>> {
    self.inner.list_tasks(filter)
  }

  fn join_arrivals(&self, process_id: &ProcessId, join: &str) -> flow::Result<Vec<String>> {
    self.inner.join_arrivals(process_id, join)
  }

  fn save_join_arrivals(&self, process_id: &ProcessId, join: &str, arrived: &[String]) -> flow::Result<()> {
    self.inner.save_join_arrivals(process_id, join, arrived)
  }

  fn apply(&self, changes: &Changes) -> flow::Result<()> {
    if changes.created.iter().any(|t| t.node == self.fail_on) {
      return Err(FlowError::Storage("disk full".into()));
    }
    self.inner.apply(changes)
  }
}

#[test]
fn storage_failure_during_split_writes_nothing() {
  let flow = split_join_builder(&["a", "b"]).build().unwrap();
  let repo = Arc::new(FailingRepository { inner: InMemoryProcessRepository::new(),
                                          fail_on: "b" });
  let engine = FlowEngine::new(Arc::new(flow), repo.clone(), Arc::new(StaticPermissions::new()));
  let ana = User::new("ana");

  let mut activation = engine.start("start", &ana).unwrap();
  let err = activation.perform(json!({}), &ana).unwrap_err();
  assert!(matches!(err, FlowError::Storage(_)));
  assert!(!err.is_recoverable());
  drop(activation);

  // ni proceso ni la rama `a`: el Split crea sus N ramas o ninguna
  assert!(repo.inner.list_processes(None).unwrap().is_empty());
  assert!(repo.inner.list_tasks(&TaskFilter::default()).unwrap().is_empty());
}
