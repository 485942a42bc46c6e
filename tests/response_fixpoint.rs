mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use torq_runtime::klvm::{
    ActorCfg, ActorRefObj, Complete, CompleteRec, Feature, Instr, Literal, LiteralOrIdent,
};

/// Responds `{a: 99}` to any ask.
fn rec_responder_cfg() -> ActorCfg {
    let rec = Complete::Rec(Arc::new(
        CompleteRec::build(
            Literal::Nothing,
            vec![(Feature::str("a"), Complete::int(99))],
        )
        .expect("rec"),
    ));
    simple_cfg(
        proc_def(&["m"], respond(torq_runtime::klvm::CompleteOrIdent::Complete(rec))),
        vec![],
    )
}

/// The parent builds `{f: 99}` with an unbound feature var `f`, asks one
/// responder for the record and a gated responder for the feature name.
/// The record response cannot bind until the feature response does, so the
/// fixpoint must suspend it and retry once the feature binding arrives.
fn dependent_responses_cfg(rec_source: Complete, feature_source: Complete) -> ActorCfg {
    let handler_body = local(
        &["t", "f", "s"],
        seq(vec![
            select_apply("recs", "ask", vec![str_lit("rec"), var_of("t")]),
            select_apply("features", "ask", vec![str_lit("feature"), var_of("f")]),
            Arc::new(Instr::CreateRec {
                label: Literal::Nothing.into(),
                fields: vec![(LiteralOrIdent::Ident(ident("f")), int(99))],
                target: var_of("t"),
                span: span(),
            }),
            Arc::new(Instr::Select {
                rec: var_of("t"),
                feature: LiteralOrIdent::Literal(Literal::str("a")),
                target: var_of("s"),
                span: span(),
            }),
            respond(var_of("s")),
        ]),
    );
    simple_cfg(
        proc_def(&["m"], handler_body),
        vec![("recs", rec_source), ("features", feature_source)],
    )
}

#[tokio::test]
async fn responses_that_depend_on_each_other_reach_a_fixed_point() {
    let system = system();
    let recs = spawn_actor(&system, "recs", rec_responder_cfg());
    let gate = GatedResponder::new("features");
    let parent = spawn_actor(
        &system,
        "fixpoint",
        dependent_responses_cfg(
            Complete::ActorRef(recs),
            Complete::ActorRef(ActorRefObj::new(gate.clone())),
        ),
    );

    let pending = torq_runtime::RequestClient::builder().send(&parent, Complete::str("go"));

    // Let the record response arrive alone: it cannot bind against the
    // partial record while `f` is unbound, so the actor suspends it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    release_next(&gate, Complete::str("a")).await;

    let response = pending
        .await_response(Duration::from_secs(5))
        .await
        .expect("response");
    expect_int(&response, 99);
}
