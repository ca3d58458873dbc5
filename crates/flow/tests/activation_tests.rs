mod common;

use chrono::Duration as ChronoDuration;
use common::{harness, linear_builder, linear_flow, live_task, perform, start_process, stored};
use flow::{this, Action, FlowError, Node, ProcessStatus, TaskStatus, User};
use serde_json::json;

#[test]
fn linear_start_view_end_scenario() {
  let h = harness(linear_flow());
  let ana = User::new("ana");
  let (process, created) = start_process(&h, &ana, json!({"text": "borrador"}));
  assert_eq!(process.status, ProcessStatus::Active);
  assert_eq!(process.created_by.as_deref(), Some("ana"));
  assert_eq!(created.len(), 1);
  assert_eq!(created[0].node, "review");
  assert_eq!(created[0].status, TaskStatus::New);

  let start_task = h.engine.tasks(&process.id).unwrap().into_iter().find(|t| t.node == "start").unwrap();
  assert_eq!(start_task.status, TaskStatus::Done);
  assert_eq!(created[0].previous, vec![start_task.id]);

  let bob = User::new("bob");
  let after = perform(&h, &created[0].id, &bob, json!({"approved": true})).unwrap();
  assert_eq!(after.len(), 1);
  assert_eq!(after[0].node, "end");
  assert_eq!(after[0].status, TaskStatus::Done);

  let process = h.engine.load_process(&process.id).unwrap();
  assert_eq!(process.status, ProcessStatus::Finished);
  assert!(process.finished_at.is_some());
  assert_eq!(process.field("text"), Some(&json!("borrador")));
  assert_eq!(process.field("approved"), Some(&json!(true)));

  let review = stored(&h, &created[0].id);
  assert_eq!(review.status, TaskStatus::Done);
  assert_eq!(review.owner.as_deref(), Some("bob"));
  assert!(review.started_at.is_some() && review.finished_at.is_some());
}

#[test]
fn done_on_a_finished_task_is_a_conflict() {
  let h = harness(common::split_join_builder(&["a", "b"]).build().unwrap());
  let ana = User::new("ana");
  let (process, _) = start_process(&h, &ana, json!({}));
  let a = live_task(&h, &process, "a");
  perform(&h, &a.id, &ana, json!({})).unwrap();

  let again = perform(&h, &a.id, &ana, json!({}));
  assert!(matches!(again, Err(FlowError::Conflict(_))));
  let mut activation = h.engine.activate(&a.id).unwrap();
  assert!(matches!(activation.done(), Err(FlowError::Conflict(_))));
  drop(activation);
  assert_eq!(stored(&h, &a.id).status, TaskStatus::Done);
}

#[test]
fn terminal_process_rejects_every_transition() {
  let h = harness(linear_flow());
  let ana = User::new("ana");
  let (process, created) = start_process(&h, &ana, json!({}));
  perform(&h, &created[0].id, &ana, json!({})).unwrap();
  assert_eq!(h.engine.load_process(&process.id).unwrap().status, ProcessStatus::Finished);

  let mut activation = h.engine.activate(&created[0].id).unwrap();
  assert!(matches!(activation.prepare(json!({}), &ana, None), Err(FlowError::Conflict(_))));
  assert!(matches!(activation.cancel(&ana), Err(FlowError::Conflict(_))));
}

#[test]
fn payload_is_validated_against_declared_fields() {
  let h = harness(linear_flow());
  let ana = User::new("ana");
  let (_, created) = start_process(&h, &ana, json!({}));
  let review = &created[0];

  let unknown = perform(&h, &review.id, &ana, json!({"approved": true, "price": 10}));
  assert!(matches!(unknown, Err(FlowError::Validation(_))));
  let not_object = perform(&h, &review.id, &ana, json!([1, 2]));
  assert!(matches!(not_object, Err(FlowError::Validation(_))));

  let task = stored(&h, &review.id);
  assert_eq!(task.status, TaskStatus::New);
  assert!(task.owner.is_none());

  let mut start = h.engine.start("start", &ana).unwrap();
  assert!(matches!(start.prepare(json!({"approved": true}), &ana, None), Err(FlowError::Validation(_))));
}

#[test]
fn node_permission_gates_execution() {
  let flow = linear_builder().node("review", Node::view().fields(["approved"]).permission("docs.can_review").next(this("end")))
                             .build()
                             .unwrap();
  let h = harness(flow);
  let ana = User::new("ana");
  let bob = User::new("bob");
  let (_, created) = start_process(&h, &ana, json!({}));
  let review = &created[0];

  let denied = perform(&h, &review.id, &bob, json!({}));
  assert!(matches!(denied, Err(FlowError::Permission(_))));
  assert_eq!(stored(&h, &review.id).status, TaskStatus::New);

  h.perms.grant("bob", "docs.can_review");
  perform(&h, &review.id, &bob, json!({"approved": false})).unwrap();
  assert_eq!(stored(&h, &review.id).status, TaskStatus::Done);
}

#[test]
fn dynamic_permission_uses_process_state() {
  let flow = linear_builder().node("review",
                                   Node::view().permission_fn(|p| {
                                                 let dept = p.field("text").and_then(|v| v.as_str()).unwrap_or("none");
                                                 format!("docs.review_{}", dept)
                                               })
                                               .next(this("end")))
                             .build()
                             .unwrap();
  let h = harness(flow);
  let ana = User::new("ana");
  let (_, created) = start_process(&h, &ana, json!({"text": "legal"}));
  h.perms.grant("bob", "docs.review_sales");
  let bob = User::new("bob");
  assert!(matches!(perform(&h, &created[0].id, &bob, json!({})), Err(FlowError::Permission(_))));
  h.perms.grant("bob", "docs.review_legal");
  assert!(perform(&h, &created[0].id, &bob, json!({})).is_ok());
}

#[test]
fn anonymous_users_are_never_permitted() {
  let h = harness(linear_flow());
  let anon = User::anonymous();
  assert!(matches!(h.engine.start("start", &anon), Err(FlowError::Permission(_))));

  let ana = User::new("ana");
  let (_, created) = start_process(&h, &ana, json!({}));
  assert!(matches!(perform(&h, &created[0].id, &anon, json!({})), Err(FlowError::Permission(_))));
  assert!(matches!(h.engine.dispatch(Action::Assign, &created[0].id, &anon, None), Err(FlowError::Permission(_))));
}

#[test]
fn assign_unassign_and_ownership() {
  let flow = linear_builder().node("review", Node::view().fields(["approved"]).permission("docs.can_review").next(this("end")))
                             .build()
                             .unwrap();
  let h = harness(flow);
  let ana = User::new("ana");
  let carl = User::new("carl");
  let dave = User::new("dave");
  h.perms.grant("carl", "docs.can_review");
  h.perms.grant("dave", "docs.can_review");
  let (_, created) = start_process(&h, &ana, json!({}));
  let id = created[0].id;

  // sin permiso de nodo no se puede asignar
  assert!(matches!(h.engine.dispatch(Action::Assign, &id, &ana, None), Err(FlowError::Permission(_))));

  let assigned = h.engine.dispatch(Action::Assign, &id, &carl, None).unwrap();
  assert_eq!(assigned[0].status, TaskStatus::Assigned);
  assert_eq!(assigned[0].owner.as_deref(), Some("carl"));

  // asignar dos veces es un conflicto de estado
  assert!(matches!(h.engine.dispatch(Action::Assign, &id, &dave, None), Err(FlowError::Conflict(_))));
  // sólo el dueño ejecuta
  assert!(matches!(perform(&h, &id, &dave, json!({})), Err(FlowError::Permission(_))));
  // dave no es dueño ni gestor
  assert!(matches!(h.engine.dispatch(Action::Unassign, &id, &dave, None), Err(FlowError::Permission(_))));

  let released = h.engine.dispatch(Action::Unassign, &id, &carl, None).unwrap();
  assert_eq!(released[0].status, TaskStatus::New);
  assert!(released[0].owner.is_none());
  assert!(matches!(h.engine.dispatch(Action::Unassign, &id, &carl, None), Err(FlowError::Conflict(_))));

  h.engine.dispatch(Action::Assign, &id, &dave, None).unwrap();
  h.perms.grant("ana", "docs.manage_process");
  h.engine.dispatch(Action::Unassign, &id, &ana, None).unwrap();
  assert_eq!(stored(&h, &id).status, TaskStatus::New);
}

#[test]
fn undo_returns_started_task_to_assigned() {
  let h = harness(linear_flow());
  let ana = User::new("ana");
  let (_, created) = start_process(&h, &ana, json!({}));
  let id = created[0].id;

  let mut activation = h.engine.activate(&id).unwrap();
  activation.prepare(json!({"approved": true}), &ana, None).unwrap();
  drop(activation);
  let started = stored(&h, &id);
  assert_eq!(started.status, TaskStatus::Started);
  assert_eq!(started.owner.as_deref(), Some("ana"));

  let bob = User::new("bob");
  assert!(matches!(h.engine.dispatch(Action::Undo, &id, &bob, None), Err(FlowError::Permission(_))));
  let undone = h.engine.dispatch(Action::Undo, &id, &ana, None).unwrap();
  assert_eq!(undone[0].status, TaskStatus::Assigned);
  assert!(undone[0].started_at.is_none());
  assert!(matches!(h.engine.dispatch(Action::Undo, &id, &ana, None), Err(FlowError::Conflict(_))));

  // el payload preparado se descartó: el proceso no lo recibió
  let process = h.engine.load_process(&undone[0].process_id).unwrap();
  assert!(process.field("approved").is_none());
}

#[test]
fn stale_started_token_is_rejected() {
  let h = harness(linear_flow());
  let ana = User::new("ana");
  let (_, created) = start_process(&h, &ana, json!({}));
  let id = created[0].id;

  let mut first = h.engine.activate(&id).unwrap();
  first.prepare(json!({}), &ana, None).unwrap();
  let seen = first.task().started_at.unwrap();
  drop(first);

  let mut second = h.engine.activate(&id).unwrap();
  assert!(matches!(second.prepare(json!({}), &ana, None), Err(FlowError::Conflict(_))));
  let stale = seen - ChronoDuration::seconds(1);
  assert!(matches!(second.prepare(json!({}), &ana, Some(stale)), Err(FlowError::Conflict(_))));
  assert_eq!(stored(&h, &id).started_at, Some(seen));

  second.prepare(json!({"note": "segunda vuelta"}), &ana, Some(seen)).unwrap();
  let finished = second.done().unwrap();
  assert_eq!(finished[0].node, "end");
}

#[test]
fn cancel_requires_manage_permission() {
  let h = harness(linear_flow());
  let ana = User::new("ana");
  let (process, created) = start_process(&h, &ana, json!({}));
  let id = created[0].id;

  assert!(matches!(h.engine.dispatch(Action::Cancel, &id, &ana, None), Err(FlowError::Permission(_))));
  h.perms.grant("ana", "docs.manage_process");
  let cancelled = h.engine.dispatch(Action::Cancel, &id, &ana, None).unwrap();
  assert_eq!(cancelled[0].status, TaskStatus::Cancelled);
  assert!(matches!(h.engine.dispatch(Action::Cancel, &id, &ana, None), Err(FlowError::Conflict(_))));
  // cancelar una tarea no avanza el proceso
  assert_eq!(h.engine.load_process(&process.id).unwrap().status, ProcessStatus::Active);
}

#[test]
fn closing_transitions_record_the_comment() {
  let h = harness(linear_flow());
  let ana = User::new("ana");
  let (_, created) = start_process(&h, &ana, json!({}));
  let review = created[0].id;

  let mut activation = h.engine.activate(&review).unwrap();
  activation.set_comment("revisado sin cambios");
  activation.perform(json!({"approved": true}), &ana).unwrap();
  drop(activation);
  assert_eq!(stored(&h, &review).comment.as_deref(), Some("revisado sin cambios"));

  let (_, created) = start_process(&h, &ana, json!({}));
  h.perms.grant("ana", "docs.manage_process");
  let cancelled = h.engine
                   .dispatch(Action::Cancel, &created[0].id, &ana, Some(json!({"comment": "duplicado"})))
                   .unwrap();
  assert_eq!(cancelled[0].comment.as_deref(), Some("duplicado"));
  assert_eq!(stored(&h, &created[0].id).comment.as_deref(), Some("duplicado"));
}

#[test]
fn cancel_process_cancels_live_tasks() {
  let h = harness(common::split_join_builder(&["a", "b"]).build().unwrap());
  let ana = User::new("ana");
  let (process, _) = start_process(&h, &ana, json!({}));
  let a = live_task(&h, &process, "a");
  perform(&h, &a.id, &ana, json!({})).unwrap();

  assert!(matches!(h.engine.cancel_process(&process.id, &ana), Err(FlowError::Permission(_))));
  h.perms.grant("ana", "docs.manage_process");
  let cancelled = h.engine.cancel_process(&process.id, &ana).unwrap();
  assert_eq!(cancelled.status, ProcessStatus::Cancelled);
  assert!(h.engine.tasks(&process.id).unwrap().iter().all(|t| !t.is_live()));
  assert!(matches!(h.engine.cancel_process(&process.id, &ana), Err(FlowError::Conflict(_))));

  let b = h.engine.tasks(&process.id).unwrap().into_iter().find(|t| t.node == "b").unwrap();
  assert_eq!(b.status, TaskStatus::Cancelled);
  assert!(matches!(perform(&h, &b.id, &ana, json!({})), Err(FlowError::Conflict(_))));
}

#[test]
fn dispatch_rejects_unsupported_actions() {
  let h = harness(linear_flow());
  let ana = User::new("ana");
  let (process, _) = start_process(&h, &ana, json!({}));
  let start = h.engine.tasks(&process.id).unwrap().into_iter().find(|t| t.node == "start").unwrap();
  assert!(matches!(h.engine.dispatch(Action::Assign, &start.id, &ana, None), Err(FlowError::NotFound(_))));
  assert!(matches!(h.engine.start("review", &ana), Err(FlowError::NotFound(_))));
}

#[test]
fn detail_requires_view_permission_or_ownership() {
  let h = harness(linear_flow());
  let ana = User::new("ana");
  let (_, created) = start_process(&h, &ana, json!({}));
  let id = created[0].id;
  let bob = User::new("bob");
  assert!(matches!(h.engine.dispatch(Action::Detail, &id, &bob, None), Err(FlowError::Permission(_))));
  h.perms.grant("bob", "docs.view_process");
  let detail = h.engine.dispatch(Action::Detail, &id, &bob, None).unwrap();
  assert_eq!(detail[0].id, id);
}
