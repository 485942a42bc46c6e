use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::{debug, error, info, warn};
use torq_klvm::machine::{resolve_for_op, resolve_value, resolve_value_or_var};
use torq_klvm::{
    ActPayload, ActorCfg, ActorRef, ActorRefObj, Address, CompleteActorCfg, ComputeHalt,
    ComputeResult, ControlMessage, Env, EnvEntry, Envelope, EnvelopeMessage, ExecCtx, FailedValue,
    Feature, Ident, Instr, Machine, MachineHost, NativeError, NativeProc, ProcVal, RequestId,
    Signal, SourceSpan, Complete, CompleteClosure, Literal, Value, ValueOrVar, Var,
};

use crate::mailbox::Mailbox;
use crate::stream::StreamObj;
use crate::system::ActorSystem;

/*
 * Wait state: the actor is a single-threaded kernel machine, and the wait
 * state is a single slot holding the barrier var that suspended it. A
 * non-empty wait state means only a response or a control can make the
 * actor executable again; notifies and requests stay queued.
 *
 * Priorities: control (0) ahead of response (1) ahead of notify/request
 * (2). Responses outrank requests because the actor may be waiting on an
 * unbound var that only a response can fulfill.
 */

const ROOT_IDENT_NAMES: [&str; 5] = ["act", "import", "respond", "self", "spawn"];

pub(crate) fn is_root_ident(ident: &Ident) -> bool {
    ROOT_IDENT_NAMES.contains(&ident.name())
}

enum OnMessageResult {
    Finished,
    NotFinished,
}

enum TurnOutcome {
    Continue,
    Idle,
    Terminal,
}

#[derive(Default)]
struct Dispatch {
    wait_barrier: Option<Var>,
    selectable: Vec<Envelope>,
    suspended: Vec<Envelope>,
}

struct TurnState {
    machine: Machine,
    dispatch: Dispatch,
    guts: ActorGuts,
}

/// A local actor: a priority mailbox, a kernel machine, and the lifecycle
/// state machine driving them on the shared executor.
pub struct LocalActor {
    address: Address,
    system: ActorSystem,
    trace: bool,
    self_ref: Weak<LocalActor>,
    mailbox: Mutex<Mailbox>,
    scheduled: AtomicBool,
    stopped: AtomicBool,
    halted: OnceLock<Arc<FailedValue>>,
    state: Mutex<TurnState>,
}

impl std::fmt::Debug for LocalActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalActor({})", self.address)
    }
}

impl LocalActor {
    pub(crate) fn new(address: Address, system: ActorSystem, trace: bool) -> Arc<LocalActor> {
        let actor = Arc::new_cyclic(|weak: &Weak<LocalActor>| {
            let root_env = build_root_env();
            LocalActor {
                address: address.clone(),
                system: system.clone(),
                trace,
                self_ref: weak.clone(),
                mailbox: Mutex::new(Mailbox::new()),
                scheduled: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                halted: OnceLock::new(),
                state: Mutex::new(TurnState {
                    machine: Machine::new(root_env.clone()),
                    dispatch: Dispatch::default(),
                    guts: ActorGuts {
                        address,
                        system,
                        trace,
                        self_ref: weak.clone(),
                        handler: None,
                        active_request: None,
                        child_count: 0,
                        triggers: Arc::new(Mutex::new(HashMap::new())),
                        root_env,
                    },
                }),
            }
        });
        if trace {
            info!("[{}] created", actor.address);
        }
        actor
    }

    /// Wake the actor if no turn task is active. The spawned task re-checks
    /// executability under the state lock, so spurious wakes are harmless.
    fn schedule(&self) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(actor) = self.self_ref.upgrade() {
            self.system.handle().spawn(async move {
                actor.run_turns().await;
            });
        }
    }

    async fn run_turns(self: Arc<Self>) {
        loop {
            match self.run_one_turn() {
                TurnOutcome::Continue => tokio::task::yield_now().await,
                TurnOutcome::Idle | TurnOutcome::Terminal => return,
            }
        }
    }

    fn run_one_turn(&self) -> TurnOutcome {
        let mut state = self.state.lock().expect("actor state lock");
        if self.halted.get().is_some() || self.stopped.load(Ordering::Acquire) {
            self.scheduled.store(false, Ordering::Release);
            return TurnOutcome::Terminal;
        }
        let batch = {
            let mut mailbox = self.mailbox.lock().expect("mailbox lock");
            if is_executable(&state.dispatch, &mailbox) {
                Some(select_next(&mut mailbox, &state.dispatch))
            } else {
                None
            }
        };
        let Some(batch) = batch else {
            self.scheduled.store(false, Ordering::Release);
            // Re-check: a send may have seen the flag still set while we
            // were deciding to park.
            let executable = {
                let mailbox = self.mailbox.lock().expect("mailbox lock");
                is_executable(&state.dispatch, &mailbox)
            };
            if executable && !self.scheduled.swap(true, Ordering::AcqRel) {
                return TurnOutcome::Continue;
            }
            return TurnOutcome::Idle;
        };
        match self.on_message(&mut state, batch) {
            OnMessageResult::Finished => {
                self.stopped.store(true, Ordering::Release);
                self.scheduled.store(false, Ordering::Release);
                if self.trace {
                    info!("[{}] stopped", self.address);
                }
                TurnOutcome::Terminal
            }
            OnMessageResult::NotFinished => {
                if self.halted.get().is_some() {
                    self.scheduled.store(false, Ordering::Release);
                    TurnOutcome::Terminal
                } else {
                    TurnOutcome::Continue
                }
            }
        }
    }

    fn on_message(&self, state: &mut TurnState, batch: Vec<Envelope>) -> OnMessageResult {
        // A batch can be empty: the actor is executable on selectable
        // responses alone.
        if batch.is_empty() || batch[0].is_response() {
            let mut all = batch;
            all.extend(std::mem::take(&mut state.dispatch.selectable));
            all.extend(std::mem::take(&mut state.dispatch.suspended));
            let total = all.len();
            let mut waiting = Vec::new();
            for envelope in all {
                if self.trace {
                    info!(
                        "[{}] received response for {:?}",
                        self.address,
                        envelope.request_id()
                    );
                }
                match self.bind_response_value(&envelope) {
                    Ok(()) => {}
                    Err(Signal::Wait(_)) => waiting.push(envelope),
                    Err(signal) => {
                        self.on_halt(state, signal_halt(signal));
                        return OnMessageResult::NotFinished;
                    }
                }
            }
            if waiting.len() == total {
                // No progress: every response is blocked on another binding.
                // Suspend them all; they become selectable again only when a
                // new response arrives.
                state.dispatch.suspended = waiting;
                state.dispatch.selectable = Vec::new();
                return OnMessageResult::NotFinished;
            }
            // Some responses bound. Blocked ones stay selectable and retry
            // next turn together with any newly arrived batch; it can take
            // several passes when responses depend on each other.
            state.dispatch.suspended = Vec::new();
            state.dispatch.selectable = waiting;
            self.compute_time_slice(state)
        } else {
            let mut batch = batch;
            let only = batch.remove(0);
            if only.is_control() {
                return self.on_control(state, only);
            }
            let Some(value) = only.value().cloned() else {
                self.on_halt(
                    state,
                    signal_halt(Signal::Native(NativeError::internal(
                        "notify or request without a value",
                    ))),
                );
                return OnMessageResult::NotFinished;
            };
            if only.is_request() {
                state.guts.active_request = Some(only);
            }
            self.compute_with_handler(state, value)
        }
    }

    /// Bind one response envelope into the requester-side target named by
    /// its request id.
    fn bind_response_value(&self, envelope: &Envelope) -> Result<(), Signal> {
        let message = envelope
            .value()
            .ok_or_else(|| {
                Signal::Native(NativeError::internal(
                    "control message in the response pipeline",
                ))
            })?
            .clone();
        match envelope.request_id() {
            // A typical request-response value binds directly; a failed
            // value binds silently here and taints later touches.
            RequestId::VarRef(target) => target.bind_value(message.into()),
            RequestId::Stream(stream_ref) => {
                let stream = stream_ref
                    .0
                    .clone()
                    .downcast::<StreamObj>()
                    .map_err(|_| {
                        Signal::Native(NativeError::internal("not a stream request id"))
                    })?;
                stream.on_response(&message)
            }
            RequestId::Nothing => Err(Signal::Native(NativeError::internal(
                "response without a request id",
            ))),
        }
    }

    fn on_control(&self, state: &mut TurnState, envelope: Envelope) -> OnMessageResult {
        if envelope.is_response() {
            self.on_halt(
                state,
                signal_halt(Signal::Native(NativeError::internal(
                    "control response outside the response pipeline",
                ))),
            );
            return OnMessageResult::NotFinished;
        }
        let control = match envelope.message() {
            EnvelopeMessage::Control(control) => control.clone(),
            EnvelopeMessage::Value(_) => {
                self.on_halt(
                    state,
                    signal_halt(Signal::Native(NativeError::internal(
                        "control envelope without a control message",
                    ))),
                );
                return OnMessageResult::NotFinished;
            }
        };
        match control {
            ControlMessage::Resume => {
                if self.trace {
                    info!("[{}] resuming computation", self.address);
                }
                self.compute_time_slice(state)
            }
            ControlMessage::SyncVar { var, value } => {
                if self.trace {
                    info!("[{}] synchronizing var {var:?} with {value}", self.address);
                }
                if let Err(signal) = var.bind_complete(value) {
                    self.on_halt(state, signal_halt(signal));
                    return OnMessageResult::NotFinished;
                }
                self.compute_time_slice(state)
            }
            ControlMessage::Act(payload) => self.on_act(state, envelope, payload),
            ControlMessage::Configure(cfg) => self.on_configure(state, cfg),
            ControlMessage::Stop => {
                if let Some(requester) = envelope.requester() {
                    requester.send(Envelope::control_response(
                        ControlMessage::Stop,
                        envelope.request_id().clone(),
                    ));
                }
                OnMessageResult::Finished
            }
        }
    }

    /// Install the handler by applying the configuration's constructor to
    /// its arguments, targeting the handler cell held for the actor's
    /// lifetime.
    fn on_configure(&self, state: &mut TurnState, cfg: Arc<CompleteActorCfg>) -> OnMessageResult {
        if self.trace {
            info!("[{}] configuring", self.address);
        }
        let root_env = state.guts.root_env.clone();
        state.machine = Machine::new(root_env.clone());
        let handler_entry = EnvEntry::new(Ident::handler(), Var::new());
        state.guts.handler = Some(handler_entry.clone());
        let mut entries = vec![handler_entry];
        let mut arg_operands = Vec::with_capacity(cfg.args.len() + 1);
        for (index, arg) in cfg.args.iter().enumerate() {
            let ident = Ident::system_arg(index);
            entries.push(EnvEntry::new(ident.clone(), Var::bound_complete(arg.clone())));
            arg_operands.push(ident.into());
        }
        // The constructor targets the handler cell with its result.
        arg_operands.push(Ident::handler().into());
        let ctor_ident = Ident::handler_ctor();
        entries.push(EnvEntry::new(
            ctor_ident.clone(),
            Var::bound(Value::Proc(ProcVal::CompleteClosure(cfg.handler_ctor.clone()))),
        ));
        let env = Env::create(root_env, entries);
        state.machine.push(
            Arc::new(Instr::Apply {
                proc: ctor_ident.into(),
                args: arg_operands,
                span: SourceSpan::default(),
            }),
            env,
        );
        self.compute_time_slice(state)
    }

    /// Run a child computation delivered by `act`. Its final statement
    /// responds the target back to the parent.
    fn on_act(
        &self,
        state: &mut TurnState,
        envelope: Envelope,
        payload: Arc<ActPayload>,
    ) -> OnMessageResult {
        state.guts.active_request = Some(envelope);
        let root_env = state.guts.root_env.clone();
        let env = Env::create(root_env.clone(), payload.input.clone())
            .add(EnvEntry::new(payload.target.clone(), Var::new()));
        state.machine = Machine::new(root_env);
        state.machine.push(payload.seq.clone(), env);
        self.compute_time_slice(state)
    }

    /// Apply `$handler($next)` to the incoming message value.
    fn compute_with_handler(&self, state: &mut TurnState, value: Complete) -> OnMessageResult {
        if self.trace {
            info!("[{}] processing message {value}", self.address);
        }
        if !state.machine.is_idle() {
            self.on_halt(
                state,
                signal_halt(Signal::Native(NativeError::internal(
                    "previous computation is not ended",
                ))),
            );
            return OnMessageResult::NotFinished;
        }
        let Some(handler_entry) = state.guts.handler.clone() else {
            self.on_halt(
                state,
                signal_halt(Signal::Native(NativeError::internal(
                    "actor is not configured",
                ))),
            );
            return OnMessageResult::NotFinished;
        };
        let next_entry = EnvEntry::new(Ident::next(), Var::bound_complete(value));
        let env = Env::create(Env::empty(), vec![handler_entry, next_entry]);
        state.machine.push(
            Arc::new(Instr::Apply {
                proc: Ident::handler().into(),
                args: vec![Ident::next().into()],
                span: SourceSpan::default(),
            }),
            env,
        );
        self.compute_time_slice(state)
    }

    fn compute_time_slice(&self, state: &mut TurnState) -> OnMessageResult {
        state.dispatch.wait_barrier = None;
        if self.trace {
            info!("[{}] computing", self.address);
        }
        let halted = {
            let TurnState {
                machine,
                guts,
                dispatch,
            } = state;
            match machine.compute(guts, self.system.time_slice()) {
                ComputeResult::Complete => None,
                ComputeResult::Wait(barrier) => {
                    if self.trace {
                        info!("[{}] waiting on {barrier:?}", self.address);
                    }
                    dispatch.wait_barrier = Some(barrier);
                    None
                }
                ComputeResult::Preempt => {
                    // Yield the executor and pick the computation back up on
                    // the self-addressed resume.
                    self.send(Envelope::control_notify(ControlMessage::Resume));
                    None
                }
                ComputeResult::Halt(halt) => Some(halt),
            }
        };
        if let Some(halt) = halted {
            self.on_halt(state, halt);
        }
        OnMessageResult::NotFinished
    }

    /// Convert a halt into this actor's failed value, answer the active
    /// request (or log), then drain the mailbox answering every queued
    /// request with the same failed value. A halted actor never resumes.
    fn on_halt(&self, state: &mut TurnState, halt: ComputeHalt) {
        let failed = if let Some(touched) = halt.touched_failed {
            Arc::new(FailedValue::new(
                self.address.to_string(),
                touched.error().clone(),
                halt.current,
                Some(touched),
                halt.native_cause,
            ))
        } else {
            Arc::new(FailedValue::new(
                self.address.to_string(),
                halt.uncaught_throw
                    .unwrap_or_else(|| Complete::str("halted")),
                halt.current,
                None,
                halt.native_cause,
            ))
        };
        let _ = self.halted.set(failed.clone());
        if let Some(request) = state.guts.active_request.take() {
            if let Some(requester) = request.requester() {
                requester.send(Envelope::response(
                    Complete::Failed(failed.clone()),
                    request.request_id().clone(),
                ));
            }
        } else {
            error!(
                "[{}] actor halted\n{}",
                self.address,
                failed.to_details_string()
            );
        }
        let mut mailbox = self.mailbox.lock().expect("mailbox lock");
        while let Some(next) = mailbox.remove_next() {
            if next.is_request() {
                if let Some(requester) = next.requester() {
                    requester.send(Envelope::response(
                        Complete::Failed(failed.clone()),
                        next.request_id().clone(),
                    ));
                }
            }
        }
    }

    /// Post-halt delivery: requests are answered immediately with the
    /// failed value; everything else is dropped.
    fn on_received_after_failed(&self, envelope: Envelope, failed: &Arc<FailedValue>) {
        if envelope.is_request() {
            if let Some(requester) = envelope.requester() {
                requester.send(Envelope::response(
                    Complete::Failed(failed.clone()),
                    envelope.request_id().clone(),
                ));
                return;
            }
        }
        warn!("[{}] dropping message received after halt", self.address);
    }
}

impl ActorRef for LocalActor {
    fn address(&self) -> &Address {
        &self.address
    }

    fn send(&self, envelope: Envelope) {
        if let Some(failed) = self.halted.get() {
            self.on_received_after_failed(envelope, failed);
            return;
        }
        if self.stopped.load(Ordering::Acquire) {
            debug!("[{}] dropping message after stop", self.address);
            return;
        }
        self.mailbox.lock().expect("mailbox lock").insert(envelope);
        self.schedule();
    }
}

/// The actor is executable when it is not waiting and has mail, or when it
/// is waiting but the head of the queue is a response or control, or when
/// previously blocked responses became selectable again.
fn is_executable(dispatch: &Dispatch, mailbox: &Mailbox) -> bool {
    if dispatch.wait_barrier.is_some() {
        let head_runs = mailbox
            .peek_next()
            .map_or(false, |next| next.is_response() || next.is_control());
        head_runs || !dispatch.selectable.is_empty()
    } else {
        !mailbox.is_empty()
    }
}

/// One scheduling turn's batch: a single control/notify/request envelope,
/// or the contiguous run of responses at the head of the queue. A waiting
/// actor only consumes responses and controls; a queued notify or request
/// stays put while selectable responses are retried with an empty batch.
fn select_next(mailbox: &mut Mailbox, dispatch: &Dispatch) -> Vec<Envelope> {
    let head_runs = match mailbox.peek_next() {
        None => false,
        Some(head) => {
            dispatch.wait_barrier.is_none() || head.is_response() || head.is_control()
        }
    };
    if !head_runs {
        return Vec::new();
    }
    let Some(first) = mailbox.remove_next() else {
        return Vec::new();
    };
    if !first.is_response() {
        return vec![first];
    }
    let mut responses = vec![first];
    while mailbox.peek_next().map_or(false, Envelope::is_response) {
        responses.push(mailbox.remove_next().expect("peeked envelope"));
    }
    responses
}

fn signal_halt(signal: Signal) -> ComputeHalt {
    match signal {
        Signal::TouchedFailed(failed) => ComputeHalt {
            uncaught_throw: None,
            touched_failed: Some(failed),
            native_cause: None,
            current: None,
        },
        Signal::Throw { value } => ComputeHalt {
            uncaught_throw: Some(
                value
                    .check_complete()
                    .unwrap_or_else(|_| Complete::str(&format!("{value}"))),
            ),
            touched_failed: None,
            native_cause: None,
            current: None,
        },
        Signal::Native(error) => ComputeHalt {
            native_cause: Some(error.to_string()),
            uncaught_throw: Some(error_complete(error.name, &error.message)),
            touched_failed: None,
            current: None,
        },
        Signal::Unify(error) => ComputeHalt {
            uncaught_throw: Some(error_complete("UnificationError", &error.message)),
            native_cause: Some(error.message),
            touched_failed: None,
            current: None,
        },
        Signal::Wait(_) => ComputeHalt {
            uncaught_throw: Some(error_complete(
                "InternalError",
                "suspension escaped the dispatch loop",
            )),
            touched_failed: None,
            native_cause: None,
            current: None,
        },
    }
}

fn error_complete(name: &str, message: &str) -> Complete {
    torq_klvm::machine::error_rec(name, message)
        .check_complete()
        .unwrap_or_else(|_| Complete::str(name))
}

/// The map from trigger-var identity to the child vars waiting on it.
type TriggerMap = HashMap<u64, Vec<ChildVar>>;

/// A parent-to-child synchronization record: the parent-side var being
/// watched and the child-side var to bind through a `SyncVar` control.
#[derive(Clone)]
struct ChildVar {
    parent_var: Var,
    child_var: Var,
    child: Arc<dyn ActorRef>,
}

/// The actor state visible to intrinsics through the machine host seam.
pub(crate) struct ActorGuts {
    address: Address,
    system: ActorSystem,
    trace: bool,
    self_ref: Weak<LocalActor>,
    handler: Option<EnvEntry>,
    active_request: Option<Envelope>,
    child_count: u32,
    triggers: Arc<Mutex<TriggerMap>>,
    root_env: Env,
}

impl MachineHost for ActorGuts {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn address(&self) -> &Address {
        &self.address
    }

    fn trace(&self) -> bool {
        self.trace
    }

    fn self_actor(&self) -> Option<Arc<dyn ActorRef>> {
        self.self_ref
            .upgrade()
            .map(|actor| actor as Arc<dyn ActorRef>)
    }
}

impl ActorGuts {
    fn next_child_address(&mut self) -> Address {
        self.child_count += 1;
        self.address.child(self.child_count)
    }

    fn self_actor_strong(&self) -> Result<Arc<dyn ActorRef>, Signal> {
        self.self_actor()
            .ok_or_else(|| Signal::Native(NativeError::internal("actor is gone")))
    }

    /// Watch `trigger`; when it binds, propagate `parent_var`'s value to the
    /// child as a `SyncVar` control (re-watching the next barrier while the
    /// parent value is still partial).
    fn add_parent_var_dependency(
        &mut self,
        trigger: &Var,
        parent_var: &Var,
        child_var: Var,
        child: Arc<dyn ActorRef>,
    ) {
        if self.trace {
            info!(
                "[{}] trigger on {trigger:?} synchronizes {parent_var:?} to {child_var:?} at {}",
                self.address,
                child.address()
            );
        }
        let newly_watched = {
            let mut triggers = self.triggers.lock().expect("trigger map lock");
            let pending = triggers.entry(trigger.id()).or_default();
            let newly_watched = pending.is_empty();
            pending.push(ChildVar {
                parent_var: parent_var.clone(),
                child_var,
                child,
            });
            newly_watched
        };
        if newly_watched {
            trigger.add_bind_callback(trigger_callback(self.triggers.clone(), self.trace));
        }
    }

    /// Spawn a kernel-actor child. Verifying the configuration walks the
    /// handler constructor's captures and suspends on any unbound one, so
    /// the whole spawn re-runs (idempotently) once that var binds; the
    /// child is created only after every capture checks complete.
    fn spawn_actor_cfg(&mut self, cfg: &ActorCfg) -> Result<ActorRefObj, Signal> {
        let handler_ctor = complete_handler_ctor(&cfg.handler_ctor)?;
        let child = LocalActor::new(self.next_child_address(), self.system.clone(), self.trace);
        child.send(Envelope::control_notify(ControlMessage::Configure(
            Arc::new(CompleteActorCfg {
                args: cfg.args.clone(),
                handler_ctor,
            }),
        )));
        Ok(ActorRefObj::new(child))
    }

    fn spawn_native_cfg(&mut self, cfg: &Arc<dyn torq_klvm::NativeActorCfg>) -> ActorRefObj {
        ActorRefObj::new(cfg.spawn(self.next_child_address()))
    }
}

fn trigger_callback(triggers: Arc<Mutex<TriggerMap>>, trace: bool) -> torq_klvm::BindCallback {
    Box::new(move |var, _value| fire_triggers(&triggers, trace, var))
}

fn fire_triggers(triggers: &Arc<Mutex<TriggerMap>>, trace: bool, trigger_var: &Var) {
    let pending = triggers
        .lock()
        .expect("trigger map lock")
        .remove(&trigger_var.id());
    let Some(pending) = pending else {
        return;
    };
    for child_var in &pending {
        let complete = match child_var.parent_var.resolve_value_or_var() {
            ValueOrVar::Var(next_barrier) => {
                re_register_triggers(triggers, trace, &next_barrier, pending.clone());
                return;
            }
            ValueOrVar::Value(value) => match value.check_complete() {
                Ok(complete) => complete,
                Err(Signal::Wait(next_barrier)) => {
                    // The parent value is still partial: watch the next
                    // unbound component and retry the whole pending list.
                    re_register_triggers(triggers, trace, &next_barrier, pending.clone());
                    return;
                }
                Err(signal) => {
                    warn!("cannot synchronize parent var: {signal:?}");
                    continue;
                }
            },
        };
        if trace {
            info!(
                "synchronizing {:?} to {:?} at {} with {complete}",
                child_var.parent_var,
                child_var.child_var,
                child_var.child.address()
            );
        }
        child_var.child.send(Envelope::control_notify(
            ControlMessage::SyncVar {
                var: child_var.child_var.clone(),
                value: complete,
            },
        ));
    }
}

fn re_register_triggers(
    triggers: &Arc<Mutex<TriggerMap>>,
    trace: bool,
    barrier: &Var,
    pending: Vec<ChildVar>,
) {
    let newly_watched = {
        let mut map = triggers.lock().expect("trigger map lock");
        let entry = map.entry(barrier.id()).or_default();
        let newly_watched = entry.is_empty();
        entry.extend(pending);
        newly_watched
    };
    if newly_watched {
        barrier.add_bind_callback(trigger_callback(triggers.clone(), trace));
    }
}

/// Resolve a handler constructor into its transportable complete form,
/// excluding captures of root-environment intrinsics (the receiving actor
/// supplies its own).
pub(crate) fn complete_handler_ctor(ctor: &ProcVal) -> Result<Arc<CompleteClosure>, Signal> {
    match ctor {
        ProcVal::CompleteClosure(complete) => Ok(complete.clone()),
        ProcVal::Closure(closure) => {
            let mut captured = Vec::new();
            for entry in closure.captured.local_entries() {
                if is_root_ident(&entry.ident) {
                    continue;
                }
                // Only complete, immutable values cross actor boundaries.
                captured.push((entry.ident.clone(), entry.var.check_complete()?));
            }
            Ok(Arc::new(CompleteClosure::new(closure.def.clone(), captured)))
        }
        ProcVal::Native(_) => Err(Signal::Native(NativeError::type_error(
            "a native proc cannot be a handler constructor",
        ))),
    }
}

fn guts_mut<'a>(host: &'a mut dyn MachineHost) -> Result<&'a mut ActorGuts, Signal> {
    host.as_any_mut()
        .downcast_mut::<ActorGuts>()
        .ok_or_else(|| Signal::Native(NativeError::internal("host is not a local actor")))
}

/// The process-wide root environment shape: the five intrinsics, bound per
/// actor at creation.
pub(crate) fn build_root_env() -> Env {
    let native = |name: &'static str,
                  f: fn(&mut ExecCtx<'_>, &[torq_klvm::CompleteOrIdent], &Env) -> Result<(), Signal>|
     -> EnvEntry {
        EnvEntry::new(
            Ident::new(name),
            Var::bound(Value::Proc(ProcVal::Native(NativeProc::new(name, f)))),
        )
    };
    Env::create(
        Env::empty(),
        vec![
            native("act", native_act),
            native("import", native_import),
            native("respond", native_respond_from_ask),
            native("self", native_self),
            native("spawn", native_spawn),
        ],
    )
}

/// The `respond` variant installed in the `system` module for free
/// procedure contexts (stream publishers): sends without completing the
/// active request.
pub(crate) fn respond_from_proc_native() -> NativeProc {
    NativeProc::new("respond", native_respond_from_proc)
}

/// `act`: capture the current act instruction's free identifiers and run
/// its body as a child computation whose result responds back into the
/// target var.
fn native_act(
    ctx: &mut ExecCtx<'_>,
    _args: &[torq_klvm::CompleteOrIdent],
    env: &Env,
) -> Result<(), Signal> {
    let current = ctx
        .machine
        .current()
        .ok_or_else(|| Signal::Native(NativeError::internal("act outside a computation")))?;
    let (body, target) = match &*current {
        Instr::Act { body, target, .. } => (body.clone(), target.clone()),
        _ => {
            return Err(Signal::Native(NativeError::internal(
                "act applied outside an act instruction",
            )))
        }
    };
    let guts = guts_mut(ctx.host)?;
    let child = LocalActor::new(guts.next_child_address(), guts.system.clone(), guts.trace);
    let mut input = Vec::new();
    for ident in body.free_idents() {
        if is_root_ident(&ident) || ident == target {
            continue;
        }
        let parent_var = env
            .get(&ident)
            .ok_or_else(|| Signal::Native(NativeError::ident_not_found(&ident)))?;
        let child_var = match parent_var.resolve_value_or_var() {
            ValueOrVar::Var(rep) => {
                let child_var = Var::new();
                guts.add_parent_var_dependency(
                    &rep,
                    &parent_var,
                    child_var.clone(),
                    child.clone(),
                );
                child_var
            }
            ValueOrVar::Value(value) => match value.check_complete() {
                Ok(complete) => Var::bound_complete(complete),
                Err(Signal::Wait(barrier)) => {
                    // A partial parent value: the child starts with a fresh
                    // var and receives the value by trigger once complete.
                    let child_var = Var::new();
                    guts.add_parent_var_dependency(
                        &barrier,
                        &parent_var,
                        child_var.clone(),
                        child.clone(),
                    );
                    child_var
                }
                Err(signal) => return Err(signal),
            },
        };
        input.push(EnvEntry::new(ident, child_var));
    }
    let respond_target = Arc::new(Instr::Apply {
        proc: Ident::respond().into(),
        args: vec![target.clone().into()],
        span: body.span(),
    });
    let seq = Arc::new(Instr::Seq {
        body: vec![body, respond_target],
        span: current.span(),
    });
    let response_target = env
        .get(&target)
        .ok_or_else(|| Signal::Native(NativeError::ident_not_found(&target)))?
        .resolve_value_or_var();
    let requester = guts.self_actor_strong()?;
    child.send(Envelope::control_request(
        ControlMessage::Act(Arc::new(ActPayload { seq, target, input })),
        requester,
        RequestId::VarRef(response_target),
    ));
    Ok(())
}

/// `spawn(cfg, target)`: create a child actor from an actor (or native)
/// configuration and bind its reference into `target`.
fn native_spawn(
    ctx: &mut ExecCtx<'_>,
    args: &[torq_klvm::CompleteOrIdent],
    env: &Env,
) -> Result<(), Signal> {
    if args.len() != 2 {
        return Err(Signal::Native(NativeError::invalid_arg_count(
            2,
            args.len(),
            "spawn",
        )));
    }
    // Resolve the target first: a bad target must not leak a spawned child.
    let target = resolve_value_or_var(&args[1], env)?;
    let config = resolve_for_op(&args[0], env)?;
    let guts = guts_mut(ctx.host)?;
    let child_ref = match config {
        Value::ActorCfg(cfg) => guts.spawn_actor_cfg(&cfg)?,
        Value::NativeCfg(cfg) => guts.spawn_native_cfg(&cfg),
        other => {
            return Err(Signal::Native(NativeError::type_error(&format!(
                "not an actor cfg: {other}"
            ))))
        }
    };
    target.bind_value(Value::ActorRef(child_ref))
}

fn native_respond_from_ask(
    ctx: &mut ExecCtx<'_>,
    args: &[torq_klvm::CompleteOrIdent],
    env: &Env,
) -> Result<(), Signal> {
    send_response(ctx, args, env)?;
    // The ask handler has completed its request.
    let guts = guts_mut(ctx.host)?;
    guts.active_request = None;
    Ok(())
}

fn native_respond_from_proc(
    ctx: &mut ExecCtx<'_>,
    args: &[torq_klvm::CompleteOrIdent],
    env: &Env,
) -> Result<(), Signal> {
    send_response(ctx, args, env)
}

fn send_response(
    ctx: &mut ExecCtx<'_>,
    args: &[torq_klvm::CompleteOrIdent],
    env: &Env,
) -> Result<(), Signal> {
    if args.len() != 1 {
        return Err(Signal::Native(NativeError::invalid_arg_count(
            1,
            args.len(),
            "respond",
        )));
    }
    let candidate = resolve_value(&args[0], env)?;
    // Completing the candidate suspends on a partial value; the respond
    // re-runs in full once the barrier binds, before any send happens.
    let complete = candidate.check_complete()?;
    let current = ctx.machine.current();
    let guts = guts_mut(ctx.host)?;
    // When a respond simply relays the result of an ask that failed, wrap
    // the child failure so the caller sees this call site in the chain.
    let complete = if let Complete::Failed(child_failed) = &complete {
        Complete::Failed(Arc::new(FailedValue::new(
            guts.address.to_string(),
            child_failed.error().clone(),
            current,
            Some(child_failed.clone()),
            None,
        )))
    } else {
        complete
    };
    let Some(request) = guts.active_request.as_ref() else {
        warn!(
            "[{}] respond with no active request; ignoring",
            guts.address
        );
        return Ok(());
    };
    let Some(requester) = request.requester() else {
        warn!("[{}] respond to a requester-less envelope; ignoring", guts.address);
        return Ok(());
    };
    if guts.trace {
        info!(
            "[{}] responding to {} with {complete}",
            guts.address,
            requester.address()
        );
    }
    requester.send(Envelope::response(complete, request.request_id().clone()));
    Ok(())
}

fn native_self(
    _ctx: &mut ExecCtx<'_>,
    _args: &[torq_klvm::CompleteOrIdent],
    _env: &Env,
) -> Result<(), Signal> {
    Err(Signal::Native(NativeError::not_implemented("self")))
}

/// `import(qualifier, selections)`: resolve a module record and bind each
/// selected component into its pre-declared environment entry.
fn native_import(
    ctx: &mut ExecCtx<'_>,
    args: &[torq_klvm::CompleteOrIdent],
    env: &Env,
) -> Result<(), Signal> {
    if args.len() != 2 {
        return Err(Signal::Native(NativeError::invalid_arg_count(
            2,
            args.len(),
            "import",
        )));
    }
    let qualifier = match resolve_for_op(&args[0], env)? {
        Value::Literal(Literal::Str(qualifier)) => qualifier,
        other => {
            return Err(Signal::Native(NativeError::type_error(&format!(
                "not a str: {other}"
            ))))
        }
    };
    let selections = match resolve_value_or_var(&args[1], env)?.check_complete()? {
        Complete::Tuple(selections) => selections,
        other => {
            return Err(Signal::Native(NativeError::type_error(&format!(
                "not a complete tuple: {other}"
            ))))
        }
    };
    let guts = guts_mut(ctx.host)?;
    let module = if &*qualifier == "system" {
        guts.system.system_module()
    } else {
        guts.system.module_at(&qualifier).ok_or_else(|| {
            Signal::Native(NativeError {
                name: "ModuleNotFoundError",
                message: format!("module not found: {qualifier}"),
            })
        })?
    };
    for selection in selections.values() {
        let name = match selection {
            Complete::Literal(Literal::Str(name)) => name.clone(),
            // The alias form is reserved for a future extension.
            _ => {
                return Err(Signal::Native(NativeError::not_implemented(
                    "import selection aliases",
                )))
            }
        };
        let value = module.find_value(&Feature::Str(name.clone())).ok_or_else(|| {
            Signal::Native(NativeError {
                name: "ComponentNotFoundError",
                message: format!("component not found: {name}"),
            })
        })?;
        let ident = Ident::new(&name);
        let var = env
            .get(&ident)
            .ok_or_else(|| Signal::Native(NativeError::ident_not_found(&ident)))?;
        var.bind_complete(value.clone())?;
    }
    Ok(())
}
