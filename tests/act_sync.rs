mod common;

use std::sync::Arc;

use common::*;
use torq_runtime::klvm::{ActorCfg, BinOp, Instr, LiteralOrIdent};

/// The child computation starts before `x` is bound; the parent's later
/// binding fires the trigger, delivers a `SyncVar`, and the child resumes
/// and responds.
fn sync_on_scalar_cfg() -> ActorCfg {
    let act_body = op(BinOp::Add, var_of("x"), int(1), "t");
    let handler_body = local(
        &["x", "t"],
        seq(vec![
            Arc::new(Instr::Act {
                body: act_body,
                target: ident("t"),
                span: span(),
            }),
            bind(var_of("x"), var_of("m")),
            respond(var_of("t")),
        ]),
    );
    simple_cfg(proc_def(&["m"], handler_body), vec![])
}

#[tokio::test]
async fn child_suspends_until_parent_binds() {
    let system = system();
    let actor = spawn_actor(&system, "act-sync", sync_on_scalar_cfg());
    let response = ask(&actor, torq_runtime::klvm::Complete::int(42)).await;
    expect_int(&response, 43);
}

/// The captured parent value is a partial record whose field binds later:
/// the trigger must re-install itself on the unbound component and
/// synchronize once the record completes.
fn sync_on_partial_rec_cfg() -> ActorCfg {
    let act_body = Arc::new(Instr::Select {
        rec: var_of("r"),
        feature: LiteralOrIdent::Literal(torq_runtime::klvm::Literal::str("a")),
        target: var_of("t"),
        span: span(),
    });
    let handler_body = local(
        &["r", "a", "t"],
        seq(vec![
            Arc::new(Instr::CreateRec {
                label: torq_runtime::klvm::Literal::Nothing.into(),
                fields: vec![(
                    torq_runtime::klvm::Literal::str("a").into(),
                    var_of("a"),
                )],
                target: var_of("r"),
                span: span(),
            }),
            Arc::new(Instr::Act {
                body: act_body,
                target: ident("t"),
                span: span(),
            }),
            bind(var_of("a"), var_of("m")),
            respond(var_of("t")),
        ]),
    );
    simple_cfg(proc_def(&["m"], handler_body), vec![])
}

#[tokio::test]
async fn partial_values_synchronize_incrementally() {
    let system = system();
    let actor = spawn_actor(&system, "act-sync-partial", sync_on_partial_rec_cfg());
    let response = ask(&actor, torq_runtime::klvm::Complete::int(7)).await;
    expect_int(&response, 7);
}
