use flow::{this, Action, FlowBuilder, FlowEngine, FlowError, InMemoryProcessRepository, Node, StaticPermissions, User};
use serde_json::json;
use std::sync::Arc;

fn main() -> Result<(), FlowError> {
    // Flow de aprobación: revisar hasta aprobar y luego publicar.
    let flow = FlowBuilder::new("docs::flows", "ApprovalFlow").title("Aprobación de documentos")
                                                               .node("start", Node::start().fields(["text"]).next(this("review")))
                                                               .node("review",
                                                                     Node::view().fields(["approved"])
                                                                                 .auto_permission()
                                                                                 .next(this("check")))
                                                               .node("check",
                                                                     Node::if_(|p| p.flag("approved")).then(this("publish"))
                                                                                                      .otherwise(this("review")))
                                                               .node("publish", Node::view().next(this("end")))
                                                               .node("end", Node::end())
                                                               .build()?;
    println!("flow {} ({})", flow.namespace(), flow.title());
    for url in flow.urls() {
        println!("  {} -> {}", url.name, url.path);
    }

    let repo = Arc::new(InMemoryProcessRepository::new());
    let perms = Arc::new(StaticPermissions::new());
    perms.grant("ana", "docs.can_review_process");
    let engine = FlowEngine::new(Arc::new(flow), repo, perms);
    let ana = User::new("ana");

    let mut activation = engine.start("start", &ana)?;
    let mut pending = activation.perform(json!({"text": "borrador"}), &ana)?;
    let process_id = activation.process().id;
    drop(activation);

    // primera revisión rechazada, la segunda aprueba
    for approved in [false, true] {
        let review = pending.iter().find(|t| t.node == "review").cloned();
        let Some(review) = review else { break };
        engine.dispatch(Action::Assign, &review.id, &ana, None)?;
        pending = engine.dispatch(Action::Perform, &review.id, &ana, Some(json!({"approved": approved})))?;
        println!("review approved={} -> {:?}", approved, pending.iter().map(|t| &t.node).collect::<Vec<_>>());
    }

    if let Some(publish) = pending.iter().find(|t| t.node == "publish") {
        engine.dispatch(Action::Perform, &publish.id, &ana, Some(json!({})))?;
    }

    let process = engine.load_process(&process_id)?;
    println!("proceso {} -> {}", process.id, process.status);
    for task in engine.tasks(&process_id)? {
        println!("  {:<8} {:<9} {:?}", task.node, task.status, task.owner);
    }
    Ok(())
}
