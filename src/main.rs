use flow::{this, Action, FlowBuilder, FlowDefinition, FlowEngineConfig, FlowRegistry, FlowService, InMemoryCache,
           LockStrategy, Node, StaticPermissions, User};
use log::info;
use serde_json::{json, Value};
use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;
use uuid::Uuid;

/// Flow de aprobación de documentos usado por la CLI:
/// start -> review -> check(approved?) -> publish -> end, o vuelta a review.
fn approval_flow(lock: Arc<dyn LockStrategy>) -> flow::Result<FlowDefinition> {
    FlowBuilder::new("docs::flows", "ApprovalFlow").title("Aprobación de documentos")
                                                   .lock(lock)
                                                   .node("start", Node::start().fields(["text"]).next(this("review")))
                                                   .node("review",
                                                         Node::view().fields(["approved", "note"])
                                                                     .auto_permission()
                                                                     .next(this("check")))
                                                   .node("check",
                                                         Node::if_(|p| p.flag("approved")).then(this("publish"))
                                                                                          .otherwise(this("review")))
                                                   .node("publish", Node::view().next(this("end")))
                                                   .node("end", Node::end())
                                                   .build()
}

/// Pequeño menú interactivo para operar procesos sobre el repositorio de
/// `flow-persistence`.
///
/// Opciones soportadas:
/// 1) Ver procesos
/// 2) Iniciar proceso
/// 3) Ver tareas de un proceso
/// 4) Bandeja y cola de un usuario
/// 5) Ejecutar acción sobre una tarea
/// 6) Cancelar proceso
/// 7) Conceder permiso
/// 8) Salir
fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let config = FlowEngineConfig::from_env()?;
    // Inicializar repo (aplica migraciones embebidas si procede)
    let repo = Arc::new(flow_persistence::new_from_env()?);
    let lock = config.lock_strategy(repo.clone(), Arc::new(InMemoryCache::new()));

    let mut registry = FlowRegistry::new();
    let flow = registry.register(approval_flow(lock)?)?;
    let perms = Arc::new(StaticPermissions::new());
    let service = FlowService::new(Arc::new(registry), repo, perms.clone());
    info!("flow {} cargado ({} nodos, lock {:?})", flow.namespace(), flow.nodes().len(), config.lock);

    loop {
        println!("\n== Procflow CLI ==");
        println!("1) Ver procesos");
        println!("2) Iniciar proceso");
        println!("3) Ver tareas de un proceso");
        println!("4) Bandeja y cola de un usuario");
        println!("5) Ejecutar acción sobre una tarea");
        println!("6) Cancelar proceso");
        println!("7) Conceder permiso");
        println!("8) Salir");
        print!("Elige una opción: ");
        io::stdout().flush().ok();

        let mut choice = String::new();
        io::stdin().read_line(&mut choice)?;
        match choice.trim() {
            "1" => {
                let user = ask_user()?;
                match service.processes(&user) {
                    Ok(processes) => {
                        println!("\nID                                   | ESTADO    | CREADO POR");
                        println!("-------------------------------------------------------------------");
                        for p in processes {
                            println!("{} | {:<9} | {}", p.id, p.status, p.created_by.unwrap_or_else(|| "-".into()));
                        }
                    }
                    Err(e) => eprintln!("Error listando procesos: {}", e),
                }
            }
            "2" => {
                let user = ask_user()?;
                let text = prompt("Texto del documento: ")?;
                match service.start(&flow.namespace(), "start", &user, json!({"text": text.trim()})) {
                    Ok((process, created)) => {
                        println!("Proceso creado: {}", process.id);
                        for t in created {
                            println!("  tarea {} ({}) {}", t.id, t.node, t.status);
                        }
                    }
                    Err(e) => eprintln!("Error iniciando proceso: {}", e),
                }
            }
            "3" => {
                let Some(pid) = ask_uuid("Process id (UUID): ")? else { continue };
                match service.engine(&flow.namespace()).and_then(|engine| engine.tasks(&pid)) {
                    Ok(tasks) => {
                        for t in tasks {
                            println!("{} | {:<8} | {:<9} | {}",
                                     t.id,
                                     t.node,
                                     t.status,
                                     t.owner.unwrap_or_else(|| "-".into()));
                        }
                    }
                    Err(e) => eprintln!("Error leyendo tareas: {}", e),
                }
            }
            "4" => {
                let user = ask_user()?;
                let inbox = service.inbox(&user)?;
                let queue = service.queue(&user)?;
                println!("Bandeja ({}):", inbox.len());
                for t in inbox {
                    println!("  {} {} {}", t.id, t.node, t.status);
                }
                println!("Cola ({}):", queue.len());
                for t in queue {
                    println!("  {} {}", t.id, t.node);
                }
            }
            "5" => {
                let Some(tid) = ask_uuid("Task id (UUID): ")? else { continue };
                let action: Action = match prompt("Acción (assign, unassign, perform, undo, cancel, detail, \
                                                   activate_next): ")?.trim()
                                                                      .parse()
                {
                    Ok(a) => a,
                    Err(e) => {
                        eprintln!("{}", e);
                        continue;
                    }
                };
                let user = ask_user()?;
                let payload = if action == Action::Perform {
                    let raw = prompt("Payload JSON (enter para {}): ")?;
                    if raw.trim().is_empty() {
                        Some(json!({}))
                    } else {
                        match serde_json::from_str::<Value>(raw.trim()) {
                            Ok(v) => Some(v),
                            Err(e) => {
                                eprintln!("JSON inválido: {}", e);
                                continue;
                            }
                        }
                    }
                } else {
                    None
                };
                match service.dispatch(action, &tid, &user, payload) {
                    Ok(created) => {
                        println!("Acción {} aplicada", action);
                        for t in created {
                            println!("  nueva tarea {} ({}) {}", t.id, t.node, t.status);
                        }
                    }
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            "6" => {
                let Some(pid) = ask_uuid("Process id a cancelar (UUID): ")? else { continue };
                let user = ask_user()?;
                let confirm = prompt(&format!("Confirma cancelación de {}? escribir 'yes' para confirmar: ", pid))?;
                if confirm.trim().to_lowercase() == "yes" {
                    match service.cancel_process(&pid, &user) {
                        Ok(p) => println!("Proceso {} -> {}", p.id, p.status),
                        Err(e) => eprintln!("Error cancelando proceso: {}", e),
                    }
                } else {
                    println!("Cancelación abortada");
                }
            }
            "7" => {
                let user = prompt("Usuario: ")?;
                println!("Permisos del flow:");
                for (codename, help) in flow.permissions() {
                    println!("  {}.{} ({})", flow.app_label(), codename, help);
                }
                let permission = prompt("Permiso: ")?;
                perms.grant(user.trim(), permission.trim());
                println!("Concedido {} a {}", permission.trim(), user.trim());
            }
            "8" => {
                println!("Saliendo...");
                break;
            }
            other => {
                println!("Opción inválida: {}", other);
            }
        }
    }

    Ok(())
}

fn ask_user() -> io::Result<User> {
    let name = prompt("Usuario (enter para anónimo): ")?;
    Ok(if name.trim().is_empty() { User::anonymous() } else { User::new(name.trim()) })
}

fn ask_uuid(msg: &str) -> io::Result<Option<Uuid>> {
    let raw = prompt(msg)?;
    match Uuid::parse_str(raw.trim()) {
        Ok(u) => Ok(Some(u)),
        Err(_) => {
            eprintln!("UUID inválido");
            Ok(None)
        }
    }
}

fn prompt(msg: &str) -> io::Result<String> {
    print!("{}", msg);
    io::stdout().flush()?;
    let mut s = String::new();
    io::stdin().read_line(&mut s)?;
    Ok(s)
}
