#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use torq_runtime::klvm::{
    ActorCfg, ActorRef, ActorRefObj, Address, Closure, Complete, CompleteOrIdent, CompleteRec,
    CompleteTuple, Env, EnvEntry, Envelope, Feature, Ident, Instr, Literal, LiteralOrIdent, Pat,
    ProcDef, ProcVal, SourceSpan, Var,
};
use torq_runtime::{ActorBuilder, ActorSystem, RequestClient};

pub fn ident(name: &str) -> Ident {
    Ident::new(name)
}

pub fn var_of(name: &str) -> CompleteOrIdent {
    CompleteOrIdent::ident(name)
}

pub fn int(value: i64) -> CompleteOrIdent {
    Literal::Int64(value).into()
}

pub fn dec(value: i64) -> CompleteOrIdent {
    Literal::Dec128(value.into()).into()
}

pub fn str_lit(value: &str) -> CompleteOrIdent {
    Literal::str(value).into()
}

pub fn span() -> SourceSpan {
    SourceSpan::default()
}

pub fn seq(body: Vec<Arc<Instr>>) -> Arc<Instr> {
    Arc::new(Instr::Seq { body, span: span() })
}

pub fn local(idents: &[&str], body: Arc<Instr>) -> Arc<Instr> {
    Arc::new(Instr::Local {
        idents: idents.iter().map(|name| ident(name)).collect(),
        body,
        span: span(),
    })
}

pub fn bind(left: CompleteOrIdent, right: CompleteOrIdent) -> Arc<Instr> {
    Arc::new(Instr::Bind {
        left,
        right,
        span: span(),
    })
}

pub fn op(
    op: torq_runtime::klvm::BinOp,
    left: CompleteOrIdent,
    right: CompleteOrIdent,
    target: &str,
) -> Arc<Instr> {
    Arc::new(Instr::Op {
        op,
        left,
        right,
        target: CompleteOrIdent::ident(target),
        span: span(),
    })
}

pub fn apply(proc: &str, args: Vec<CompleteOrIdent>) -> Arc<Instr> {
    Arc::new(Instr::Apply {
        proc: CompleteOrIdent::ident(proc),
        args,
        span: span(),
    })
}

pub fn select_apply(rec: &str, feature: &str, args: Vec<CompleteOrIdent>) -> Arc<Instr> {
    Arc::new(Instr::SelectApply {
        rec: CompleteOrIdent::ident(rec),
        feature: LiteralOrIdent::Literal(Literal::str(feature)),
        args,
        span: span(),
    })
}

pub fn case_lit(
    of: &str,
    literal: Literal,
    consequent: Arc<Instr>,
    alternate: Option<Arc<Instr>>,
) -> Arc<Instr> {
    Arc::new(Instr::Case {
        of: CompleteOrIdent::ident(of),
        pattern: Pat::Literal(literal),
        consequent,
        alternate,
        span: span(),
    })
}

pub fn proc_def(params: &[&str], body: Arc<Instr>) -> Arc<ProcDef> {
    Arc::new(ProcDef::new(
        params.iter().map(|name| ident(name)).collect(),
        body,
        span(),
    ))
}

pub fn create_proc(def: Arc<ProcDef>, target: &str) -> Arc<Instr> {
    Arc::new(Instr::CreateProc {
        def,
        target: ident(target),
        span: span(),
    })
}

pub fn respond(value: CompleteOrIdent) -> Arc<Instr> {
    apply("respond", vec![value])
}

/// A configuration whose constructor builds the given handler closure,
/// capturing `captured` from the embedding (plus whatever root intrinsics
/// the handler references).
pub fn simple_cfg(handler_def: Arc<ProcDef>, captured: Vec<(&str, Complete)>) -> ActorCfg {
    let out = ident("$out");
    let ctor_body = Arc::new(Instr::CreateProc {
        def: handler_def,
        target: out.clone(),
        span: span(),
    });
    let ctor_def = Arc::new(ProcDef::new(vec![out], ctor_body, span()));
    let entries = captured
        .into_iter()
        .map(|(name, value)| EnvEntry::new(ident(name), Var::bound_complete(value)))
        .collect();
    ActorCfg {
        args: vec![],
        handler_ctor: ProcVal::Closure(Arc::new(Closure {
            def: ctor_def,
            captured: Env::create(Env::empty(), entries),
        })),
    }
}

pub fn system() -> ActorSystem {
    let _ = env_logger::builder().is_test(true).try_init();
    ActorSystem::builder()
        .add_default_modules()
        .build()
        .expect("actor system")
}

pub fn spawn_actor(system: &ActorSystem, name: &str, cfg: ActorCfg) -> ActorRefObj {
    ActorBuilder::new()
        .set_system(system.clone())
        .set_address(Address::new(name))
        .spawn(cfg)
        .expect("spawn actor")
}

pub async fn ask(actor: &ActorRefObj, message: Complete) -> Complete {
    RequestClient::builder()
        .send_and_await_response(actor, message, Duration::from_secs(5))
        .await
        .expect("response")
}

pub fn tuple(values: Vec<Complete>) -> Complete {
    Complete::Tuple(Arc::new(CompleteTuple::new(Literal::Nothing, values)))
}

pub fn int_tuple(values: &[i64]) -> Complete {
    tuple(values.iter().map(|value| Complete::int(*value)).collect())
}

pub fn str_tuple(values: &[&str]) -> Complete {
    tuple(values.iter().map(|value| Complete::str(value)).collect())
}

pub fn eof_rec(more: bool) -> Complete {
    Complete::Rec(Arc::new(
        CompleteRec::build(
            Literal::Eof,
            vec![(Feature::str("more"), Complete::Literal(Literal::Bool(more)))],
        )
        .expect("eof rec"),
    ))
}

pub fn expect_int(value: &Complete, expected: i64) {
    assert!(
        value.entails(&Complete::int(expected)),
        "expected {expected}, got {value}"
    );
}

pub fn expect_dec(value: &Complete, expected: i64) {
    assert!(
        value.entails(&Complete::dec(expected.into())),
        "expected {expected}m, got {value}"
    );
}

pub fn expect_str(value: &Complete, expected: &str) {
    assert!(
        value.entails(&Complete::str(expected)),
        "expected '{expected}', got {value}"
    );
}

/// A native publisher that answers each request with a scripted batch of
/// response envelopes.
#[derive(Debug)]
pub struct ScriptedPublisher {
    address: Address,
    script: Mutex<VecDeque<Vec<Complete>>>,
    requests: AtomicUsize,
}

impl ScriptedPublisher {
    pub fn new(name: &str, script: Vec<Vec<Complete>>) -> Arc<ScriptedPublisher> {
        Arc::new(ScriptedPublisher {
            address: Address::new(name),
            script: Mutex::new(script.into()),
            requests: AtomicUsize::new(0),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Acquire)
    }
}

impl ActorRef for ScriptedPublisher {
    fn address(&self) -> &Address {
        &self.address
    }

    fn send(&self, envelope: Envelope) {
        if !envelope.is_request() {
            return;
        }
        self.requests.fetch_add(1, Ordering::AcqRel);
        let responses = self
            .script
            .lock()
            .expect("publisher script lock")
            .pop_front()
            .unwrap_or_default();
        if let Some(requester) = envelope.requester() {
            for response in responses {
                requester.send(Envelope::response(
                    response,
                    envelope.request_id().clone(),
                ));
            }
        }
    }
}

/// A native responder that parks incoming requests until the test releases
/// them with a value.
#[derive(Debug)]
pub struct GatedResponder {
    address: Address,
    pending: Mutex<Vec<Envelope>>,
}

impl GatedResponder {
    pub fn new(name: &str) -> Arc<GatedResponder> {
        Arc::new(GatedResponder {
            address: Address::new(name),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("gated responder lock").len()
    }

    pub fn release(&self, value: Complete) {
        let pending = std::mem::take(&mut *self.pending.lock().expect("gated responder lock"));
        for envelope in pending {
            if let Some(requester) = envelope.requester() {
                requester.send(Envelope::response(
                    value.clone(),
                    envelope.request_id().clone(),
                ));
            }
        }
    }
}

impl ActorRef for GatedResponder {
    fn address(&self) -> &Address {
        &self.address
    }

    fn send(&self, envelope: Envelope) {
        if envelope.is_request() {
            self.pending
                .lock()
                .expect("gated responder lock")
                .push(envelope);
        }
    }
}

/// Release the gate once a request is actually parked behind it.
pub async fn release_next(gate: &Arc<GatedResponder>, value: Complete) {
    for _ in 0..500 {
        if gate.pending_count() > 0 {
            gate.release(value);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no pending request arrived at the gate");
}
