mod common;

use std::time::Duration;

use common::*;
use torq_runtime::klvm::{ActorCfg, BinOp, Complete};
use torq_runtime::RequestClient;

/// An actor that divides by zero on any request and halts.
fn divider_cfg() -> ActorCfg {
    let body = local(
        &["t"],
        seq(vec![
            op(BinOp::Div, var_of("m"), int(0), "t"),
            respond(var_of("t")),
        ]),
    );
    simple_cfg(proc_def(&["m"], body), vec![])
}

/// An actor that relays its request to the divider and responds with the
/// result.
fn relay_cfg(divider: Complete) -> ActorCfg {
    let body = local(
        &["t"],
        seq(vec![
            select_apply("divider", "ask", vec![var_of("m"), var_of("t")]),
            respond(var_of("t")),
        ]),
    );
    simple_cfg(proc_def(&["m"], body), vec![("divider", divider)])
}

#[tokio::test]
async fn failed_values_chain_across_asks() {
    let system = system();
    let divider = spawn_actor(&system, "b", divider_cfg());
    let relay = spawn_actor(
        &system,
        "a",
        relay_cfg(Complete::ActorRef(divider.clone())),
    );

    let response = ask(&relay, Complete::int(10)).await;
    let failed = match response {
        Complete::Failed(failed) => failed,
        other => panic!("expected a failed value, got {other}"),
    };
    // The relay wraps the divider's failure as its cause.
    assert_eq!(failed.actor_address(), "a");
    let cause = failed.cause().expect("chained cause");
    assert_eq!(cause.actor_address(), "b");
    let details = failed.to_details_string();
    assert!(details.contains("actor: a"));
    assert!(details.contains("actor: b"));
    assert!(details.contains("ArithmeticError"));
}

#[tokio::test]
async fn halted_actor_answers_every_later_request_with_the_failure() {
    let system = system();
    let divider = spawn_actor(&system, "halted", divider_cfg());

    let first = ask(&divider, Complete::int(1)).await;
    assert!(matches!(first, Complete::Failed(_)));

    // The actor never resumes; later requests are answered immediately
    // from the halt state.
    for _ in 0..3 {
        let later = RequestClient::builder()
            .send_and_await_response(&divider, Complete::int(2), Duration::from_secs(1))
            .await
            .expect("post-halt response");
        match later {
            Complete::Failed(failed) => assert_eq!(failed.actor_address(), "halted"),
            other => panic!("expected a failed value, got {other}"),
        }
    }
}

#[tokio::test]
async fn notifies_after_halt_are_dropped() {
    let system = system();
    let divider = spawn_actor(&system, "halted-notify", divider_cfg());
    let first = ask(&divider, Complete::int(1)).await;
    assert!(matches!(first, Complete::Failed(_)));

    // A notify to a halted actor is dropped; a subsequent request still
    // gets the failure.
    divider
        .referent()
        .send(torq_runtime::klvm::Envelope::notify(Complete::str("ping")));
    let later = ask(&divider, Complete::int(3)).await;
    assert!(matches!(later, Complete::Failed(_)));
}
