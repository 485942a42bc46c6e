mod common;

use common::*;
use torq_runtime::klvm::Literal;

/// An ask handler dispatching on two literal messages, as the canonical
/// hello-world actor does.
fn hello_world_handler() -> torq_runtime::klvm::ActorCfg {
    let goodbye = case_lit(
        "m",
        Literal::str("goodbye"),
        respond(str_lit("Goodbye, World!")),
        None,
    );
    let body = case_lit(
        "m",
        Literal::str("hello"),
        respond(str_lit("Hello, World!")),
        Some(goodbye),
    );
    simple_cfg(proc_def(&["m"], body), vec![])
}

#[tokio::test]
async fn hello_then_goodbye() {
    let system = system();
    let actor = spawn_actor(&system, "hello-world", hello_world_handler());

    let response = ask(&actor, torq_runtime::klvm::Complete::str("hello")).await;
    expect_str(&response, "Hello, World!");

    let response = ask(&actor, torq_runtime::klvm::Complete::str("goodbye")).await;
    expect_str(&response, "Goodbye, World!");
}

#[tokio::test]
async fn concurrent_requests_each_get_one_response() {
    let system = system();
    let actor = spawn_actor(&system, "hello-world-many", hello_world_handler());
    let mut pending = Vec::new();
    for _ in 0..8 {
        pending.push(torq_runtime::RequestClient::builder().send(
            &actor,
            torq_runtime::klvm::Complete::str("hello"),
        ));
    }
    for response in pending {
        let value = response
            .await_response(std::time::Duration::from_secs(5))
            .await
            .expect("response");
        expect_str(&value, "Hello, World!");
    }
}
