// Helpers compartidos por los tests de integración del crate `flow`.
#![allow(dead_code)]

use flow::{this, Action, FlowBuilder, FlowDefinition, FlowEngine, InMemoryProcessRepository, Node, Process,
           ProcessRepository, StaticPermissions, Task, TaskId, User};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct Harness {
  pub engine: FlowEngine,
  pub repo: Arc<InMemoryProcessRepository>,
  pub perms: Arc<StaticPermissions>,
}

pub fn harness(flow: FlowDefinition) -> Harness {
  harness_with_repo(flow, Arc::new(InMemoryProcessRepository::new()))
}

pub fn harness_with_repo(flow: FlowDefinition, repo: Arc<InMemoryProcessRepository>) -> Harness {
  let perms = Arc::new(StaticPermissions::new());
  let engine = FlowEngine::new(Arc::new(flow), repo.clone(), perms.clone());
  Harness { engine, repo, perms }
}

/// start -> review -> end
pub fn linear_builder() -> FlowBuilder {
  FlowBuilder::new("docs::flows", "LinearFlow").node("start", Node::start().fields(["text"]).next(this("review")))
                                               .node("review", Node::view().fields(["approved", "note"]).next(this("end")))
                                               .node("end", Node::end())
}

pub fn linear_flow() -> FlowDefinition {
  linear_builder().build().expect("linear flow")
}

/// start -> review -> check(If approved) -> publish -> end, o vuelta a review.
pub fn approval_flow() -> FlowDefinition {
  FlowBuilder::new("docs::flows", "ApprovalFlow").node("start", Node::start().fields(["text"]).next(this("review")))
                                                 .node("review", Node::view().fields(["approved"]).next(this("check")))
                                                 .node("check",
                                                       Node::if_(|p| p.flag("approved")).then(this("publish"))
                                                                                        .otherwise(this("review")))
                                                 .node("publish", Node::view().next(this("end")))
                                                 .node("end", Node::end())
                                                 .build()
                                                 .expect("approval flow")
}

/// start -> split{branches} -> join -> end, cada rama una View.
pub fn split_join_builder(branches: &[&str]) -> FlowBuilder {
  let mut split = Node::split();
  for b in branches {
    split = split.branch(this(b));
  }
  let mut builder = FlowBuilder::new("docs::flows", "ParallelFlow").node("start", Node::start().next(this("split")))
                                                                   .node("split", split);
  for b in branches {
    builder = builder.node(*b, Node::view().next(this("join")));
  }
  builder.node("join", Node::join().next(this("end"))).node("end", Node::end())
}

pub fn start_process(h: &Harness, user: &User, payload: Value) -> (Process, Vec<Task>) {
  let mut activation = h.engine.start("start", user).expect("start activation");
  activation.prepare(payload, user, None).expect("prepare start");
  let created = activation.done().expect("done start");
  (activation.process().clone(), created)
}

pub fn perform(h: &Harness, task_id: &TaskId, user: &User, payload: Value) -> flow::Result<Vec<Task>> {
  h.engine.dispatch(Action::Perform, task_id, user, Some(payload))
}

pub fn live_task(h: &Harness, process: &Process, node: &str) -> Task {
  h.engine
   .tasks(&process.id)
   .expect("tasks")
   .into_iter()
   .find(|t| t.node == node && t.is_live())
   .unwrap_or_else(|| panic!("no hay tarea viva para {}", node))
}

/// Estado persistido de una tarea.
pub fn stored(h: &Harness, id: &TaskId) -> Task {
  h.repo.load_task(id).expect("task")
}

pub fn count_node(h: &Harness, process: &Process, node: &str) -> usize {
  h.engine.tasks(&process.id).expect("tasks").iter().filter(|t| t.node == node).count()
}

pub fn empty() -> Value {
  json!({})
}
