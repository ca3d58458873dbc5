mod common;

use flow::{this, Action, FlowBuilder, FlowError, FlowRegistry, FlowService, InMemoryProcessRepository, Node,
           ProcessStatus, StaticPermissions, TaskStatus, User};
use serde_json::json;
use std::sync::Arc;

fn service() -> (FlowService, Arc<StaticPermissions>) {
  let mut registry = FlowRegistry::new();
  registry.register(common::linear_flow()).unwrap();
  registry.register(FlowBuilder::new("hr::flows", "HiringFlow").node("start", Node::start().next(this("interview")))
                                                               .node("interview",
                                                                     Node::view().permission("hr.can_interview")
                                                                                 .next(this("end")))
                                                               .node("end", Node::end())
                                                               .build()
                                                               .unwrap())
          .unwrap();
  let perms = Arc::new(StaticPermissions::new());
  let service = FlowService::new(Arc::new(registry), Arc::new(InMemoryProcessRepository::new()), perms.clone());
  (service, perms)
}

#[test]
fn start_and_perform_through_the_service() {
  let (service, _) = service();
  let ana = User::new("ana");
  let (process, created) = service.start("docs/linear", "start", &ana, json!({"text": "hola"})).unwrap();
  assert_eq!(process.flow, "docs/linear");
  assert_eq!(process.status, ProcessStatus::Active);
  let done = service.perform(&created[0].id, &ana, json!({"approved": true})).unwrap();
  assert_eq!(done[0].node, "end");
  assert!(matches!(service.start("docs/unknown", "start", &ana, json!({})), Err(FlowError::NotFound(_))));
}

#[test]
fn inbox_queue_and_archive() {
  let (service, perms) = service();
  let ana = User::new("ana");
  let bob = User::new("bob");
  let (_, docs) = service.start("docs/linear", "start", &ana, json!({})).unwrap();
  let (_, hiring) = service.start("hr/hiring", "start", &ana, json!({})).unwrap();

  // la cola sólo ofrece lo que el usuario puede asignarse
  let queue: Vec<String> = service.queue(&bob).unwrap().into_iter().map(|t| t.node).collect();
  assert_eq!(queue, vec!["review".to_string()]);
  perms.grant("bob", "hr.can_interview");
  assert_eq!(service.queue(&bob).unwrap().len(), 2);
  assert!(service.inbox(&bob).unwrap().is_empty());

  service.dispatch(Action::Assign, &hiring[0].id, &bob, None).unwrap();
  let inbox = service.inbox(&bob).unwrap();
  assert_eq!(inbox.len(), 1);
  assert_eq!(inbox[0].status, TaskStatus::Assigned);
  assert_eq!(service.queue(&bob).unwrap().len(), 1);

  service.perform(&hiring[0].id, &bob, json!({})).unwrap();
  assert!(service.inbox(&bob).unwrap().is_empty());
  let archive = service.archive(&bob).unwrap();
  assert_eq!(archive.len(), 1);
  assert_eq!(archive[0].node, "interview");

  // el start de ana también está en su archivo
  assert_eq!(service.archive(&ana).unwrap().len(), 2);
  assert!(service.queue(&User::anonymous()).unwrap().is_empty());
  assert_eq!(docs[0].node, "review");
}

#[test]
fn process_list_requires_view_permission() {
  let (service, perms) = service();
  let ana = User::new("ana");
  service.start("docs/linear", "start", &ana, json!({})).unwrap();
  service.start("hr/hiring", "start", &ana, json!({})).unwrap();

  assert!(service.processes(&ana).unwrap().is_empty());
  perms.grant("ana", "hr.view_process");
  let visible = service.processes(&ana).unwrap();
  assert_eq!(visible.len(), 1);
  assert_eq!(visible[0].flow, "hr/hiring");
}

#[test]
fn cancel_process_through_the_service() {
  let (service, perms) = service();
  let ana = User::new("ana");
  let (process, created) = service.start("docs/linear", "start", &ana, json!({})).unwrap();
  assert!(matches!(service.cancel_process(&process.id, &ana), Err(FlowError::Permission(_))));
  perms.grant("ana", "docs.manage_process");
  let cancelled = service.cancel_process(&process.id, &ana).unwrap();
  assert_eq!(cancelled.status, ProcessStatus::Cancelled);
  assert!(service.queue(&ana).unwrap().iter().all(|t| t.id != created[0].id));
}
