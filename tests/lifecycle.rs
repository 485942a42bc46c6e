mod common;

use std::time::Duration;

use common::*;
use torq_runtime::klvm::{Complete, ControlMessage, Envelope};
use torq_runtime::RequestClient;

fn echo_cfg() -> torq_runtime::klvm::ActorCfg {
    simple_cfg(proc_def(&["m"], respond(var_of("m"))), vec![])
}

#[tokio::test]
async fn stop_is_terminal() {
    let system = system();
    let actor = spawn_actor(&system, "stoppable", echo_cfg());

    let response = ask(&actor, Complete::str("ping")).await;
    expect_str(&response, "ping");

    actor
        .referent()
        .send(Envelope::control_notify(ControlMessage::Stop));
    // Give the stop a moment to process, then verify the actor is gone.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = RequestClient::builder()
        .send_and_await_response(&actor, Complete::str("ping"), Duration::from_millis(300))
        .await;
    assert!(after.is_err());
}

#[tokio::test]
async fn respond_in_a_notify_context_is_ignored() {
    let system = system();
    let actor = spawn_actor(&system, "notified", echo_cfg());

    // The notify runs the handler with no active request; its respond is
    // dropped with a warning and must not poison the actor.
    actor
        .referent()
        .send(Envelope::notify(Complete::str("fire-and-forget")));

    let response = ask(&actor, Complete::str("still-alive")).await;
    expect_str(&response, "still-alive");
}

#[tokio::test]
async fn requests_queued_behind_a_wait_are_served_in_order() {
    let system = system();
    // A responder gated by the test: the first request waits on its
    // response, the second request must stay queued (not interleave), then
    // both complete.
    let gate = GatedResponder::new("gate");
    let relay_cfg = {
        let body = local(
            &["t"],
            seq(vec![
                select_apply("gate", "ask", vec![var_of("m"), var_of("t")]),
                respond(var_of("t")),
            ]),
        );
        simple_cfg(
            proc_def(&["m"], body),
            vec![(
                "gate",
                Complete::ActorRef(torq_runtime::klvm::ActorRefObj::new(gate.clone())),
            )],
        )
    };
    let relay = spawn_actor(&system, "relay", relay_cfg);

    let first = RequestClient::builder().send(&relay, Complete::str("one"));
    let second = RequestClient::builder().send(&relay, Complete::str("two"));
    release_next(&gate, Complete::str("released")).await;
    // The second request only reaches the gate after the first completes.
    release_next(&gate, Complete::str("released")).await;

    let first = first
        .await_response(Duration::from_secs(5))
        .await
        .expect("first response");
    expect_str(&first, "released");
    let second = second
        .await_response(Duration::from_secs(5))
        .await
        .expect("second response");
    expect_str(&second, "released");
}
