mod common;

use std::sync::Arc;

use common::*;
use torq_runtime::klvm::{ActorCfg, ActorRefObj, BinOp, Complete, Literal};

/// A consumer that imports `Stream`/`Iter`, streams from a publisher, and
/// responds with the sum of every element before `eof`.
fn summing_consumer_cfg(publisher: Complete) -> ActorCfg {
    let loop_body = local(
        &["x"],
        seq(vec![
            apply("iter", vec![var_of("x")]),
            case_lit(
                "x",
                Literal::Eof,
                bind(var_of("out"), var_of("acc")),
                Some(local(
                    &["acc2"],
                    seq(vec![
                        op(BinOp::Add, var_of("acc"), var_of("x"), "acc2"),
                        apply("sum", vec![var_of("acc2"), var_of("out")]),
                    ]),
                )),
            ),
        ]),
    );
    let sum_def = proc_def(&["acc", "out"], loop_body);
    let handler_body = local(
        &["Stream", "Iter", "s", "iter", "sum", "total"],
        seq(vec![
            apply(
                "import",
                vec![str_lit("system"), str_tuple(&["Stream", "Iter"]).into_operand()],
            ),
            select_apply("Stream", "new", vec![var_of("pub"), var_of("m"), var_of("s")]),
            select_apply("Iter", "new", vec![var_of("s"), var_of("iter")]),
            create_proc(sum_def, "sum"),
            apply("sum", vec![int(0), var_of("total")]),
            respond(var_of("total")),
        ]),
    );
    simple_cfg(proc_def(&["m"], handler_body), vec![("pub", publisher)])
}

trait IntoOperand {
    fn into_operand(self) -> torq_runtime::klvm::CompleteOrIdent;
}

impl IntoOperand for Complete {
    fn into_operand(self) -> torq_runtime::klvm::CompleteOrIdent {
        torq_runtime::klvm::CompleteOrIdent::Complete(self)
    }
}

#[tokio::test]
async fn streams_deliver_batches_in_order() {
    let system = system();
    // One request; the publisher pushes two batches then a terminal eof.
    let publisher = ScriptedPublisher::new(
        "publisher",
        vec![vec![
            int_tuple(&[1, 2, 3]),
            int_tuple(&[4, 5]),
            eof_rec(false),
        ]],
    );
    let consumer = spawn_actor(
        &system,
        "consumer",
        summing_consumer_cfg(Complete::ActorRef(ActorRefObj::new(publisher.clone()))),
    );
    let response = ask(&consumer, Complete::str("all")).await;
    expect_int(&response, 15);
    // eof#{more: false} must not trigger another publisher request.
    assert_eq!(publisher.request_count(), 1);
}

#[tokio::test]
async fn eof_with_more_reissues_the_publisher_request() {
    let system = system();
    let publisher = ScriptedPublisher::new(
        "publisher-more",
        vec![
            vec![int_tuple(&[1, 2, 3]), eof_rec(true)],
            // The second fetch includes a legal empty batch.
            vec![tuple(vec![]), int_tuple(&[4, 5]), eof_rec(false)],
        ],
    );
    let consumer = spawn_actor(
        &system,
        "consumer-more",
        summing_consumer_cfg(Complete::ActorRef(ActorRefObj::new(publisher.clone()))),
    );
    let response = ask(&consumer, Complete::str("all")).await;
    expect_int(&response, 15);
    assert_eq!(publisher.request_count(), 2);
}

/// A kernel publisher: each request is answered through the free-procedure
/// `respond` selected out of the `system` module, so one request yields a
/// batch of raw response envelopes.
fn batch_publisher_cfg(sys_module: Complete) -> ActorCfg {
    let handler_body = local(
        &["publish"],
        seq(vec![
            Arc::new(torq_runtime::klvm::Instr::Select {
                rec: var_of("sys"),
                feature: Literal::str("respond").into(),
                target: var_of("publish"),
                span: span(),
            }),
            apply("publish", vec![int_tuple(&[1, 2]).into_operand()]),
            apply("publish", vec![eof_rec(false).into_operand()]),
        ]),
    );
    simple_cfg(proc_def(&["m"], handler_body), vec![("sys", sys_module)])
}

#[tokio::test]
async fn stream_client_collects_until_eof() {
    let system = system();
    let publisher = spawn_actor(
        &system,
        "kernel-publisher",
        batch_publisher_cfg(Complete::Rec(system.system_module())),
    );
    let envelopes = torq_runtime::StreamClient::builder()
        .send(&publisher, Complete::str("all"))
        .await_eof(std::time::Duration::from_secs(5))
        .await
        .expect("eof");
    assert_eq!(envelopes.len(), 2);
    assert!(envelopes[0]
        .value()
        .expect("batch value")
        .entails(&int_tuple(&[1, 2])));
    match envelopes[1].value().expect("eof value") {
        Complete::Rec(rec) => assert!(rec.label().is_eof()),
        other => panic!("expected an eof rec, got {other}"),
    }
}
