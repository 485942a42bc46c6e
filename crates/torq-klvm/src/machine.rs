use std::any::Any;
use std::fmt;
use std::sync::Arc;

use log::trace;
use rust_decimal::Decimal;

use crate::actor::{ActorRef, Address};
use crate::env::{Env, EnvEntry};
use crate::failed::FailedValue;
use crate::instr::{BinOp, Instr, Pat, SourceSpan};
use crate::rec::{
    CompleteRec, FeatureOrVar, LiteralOrVar, PartialField, PartialRec, PartialTuple, RecVal,
    TupleVal,
};
use crate::value::{
    ActorCfg, Closure, Complete, CompleteOrIdent, Feature, Ident, Literal, LiteralOrIdent, ProcVal,
    Value,
};
use crate::var::{ValueOrVar, Var};

/// A native error raised by the runtime. Native errors convert to kernel
/// throws of `error#{name: _, message: _}` and are catchable.
#[derive(Clone, Debug)]
pub struct NativeError {
    pub name: &'static str,
    pub message: String,
}

impl NativeError {
    pub fn type_error(message: &str) -> NativeError {
        NativeError {
            name: "TypeError",
            message: message.to_string(),
        }
    }

    pub fn arithmetic(message: &str) -> NativeError {
        NativeError {
            name: "ArithmeticError",
            message: message.to_string(),
        }
    }

    pub fn feature_not_found(feature: &Feature, subject: &str) -> NativeError {
        NativeError {
            name: "FeatureNotFoundError",
            message: format!("feature {feature} not found in {subject}"),
        }
    }

    pub fn invalid_arg_count(expected: usize, actual: usize, proc: &str) -> NativeError {
        NativeError {
            name: "InvalidArgCountError",
            message: format!("{proc} expects {expected} arguments, received {actual}"),
        }
    }

    pub fn ident_not_found(ident: &Ident) -> NativeError {
        NativeError {
            name: "IdentNotFoundError",
            message: format!("identifier not found: {ident}"),
        }
    }

    pub fn not_implemented(what: &str) -> NativeError {
        NativeError {
            name: "NotImplementedError",
            message: format!("{what} is not implemented"),
        }
    }

    pub fn internal(message: &str) -> NativeError {
        NativeError {
            name: "InternalError",
            message: message.to_string(),
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// A structural contradiction discovered by unification. Unlike native
/// errors, unification errors are not catchable: they halt the machine.
#[derive(Clone, Debug)]
pub struct UnifyError {
    pub message: String,
}

/// The control-flow signals of the interpreter. `Wait` and the error forms
/// are ordinary return values, never panics; only kernel `throw` values are
/// visible to kernel code.
#[derive(Debug)]
pub enum Signal {
    /// Progress requires the carried var to become bound.
    Wait(Var),
    /// A kernel `throw`, catchable by `try/catch`.
    Throw { value: Value },
    /// A computation resolved a var bound to a failed value.
    TouchedFailed(Arc<FailedValue>),
    /// A unification contradiction; halts the machine.
    Unify(UnifyError),
    /// A native error; converted to a catchable kernel throw.
    Native(NativeError),
}

impl Signal {
    pub fn unification(left: &Value, right: &Value) -> Signal {
        Signal::Unify(UnifyError {
            message: format!("cannot unify {left} with {right}"),
        })
    }

    pub fn unification_msg(message: &str) -> Signal {
        Signal::Unify(UnifyError {
            message: message.to_string(),
        })
    }
}

/// Why a `compute` call returned.
#[derive(Debug)]
pub enum ComputeResult {
    /// The stack is empty; the computation ended.
    Complete,
    /// The instruction budget expired with work remaining.
    Preempt,
    /// Execution cannot progress until the barrier binds.
    Wait(Var),
    /// The machine halted and will not run again.
    Halt(ComputeHalt),
}

/// The detail carried by a halt: either an uncaught throw or a touched
/// failed value, plus the instruction that was executing.
#[derive(Debug)]
pub struct ComputeHalt {
    pub uncaught_throw: Option<Complete>,
    pub touched_failed: Option<Arc<FailedValue>>,
    pub native_cause: Option<String>,
    pub current: Option<Arc<Instr>>,
}

/// The actor hosting a machine. Native procedures downcast the host to the
/// runtime's concrete actor state; the machine itself only needs identity
/// and the self reference for message sends.
pub trait MachineHost: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn address(&self) -> &Address;

    fn trace(&self) -> bool {
        false
    }

    fn self_actor(&self) -> Option<Arc<dyn ActorRef>>;
}

/// The context passed to native procedures. Native procedures must not push
/// machine frames; they complete synchronously or fail with a [`Signal`].
pub struct ExecCtx<'a> {
    pub machine: &'a mut Machine,
    pub host: &'a mut dyn MachineHost,
}

#[derive(Debug)]
enum Frame {
    Instr { instr: Arc<Instr>, env: Env },
    Catch { pattern: Pat, handler: Arc<Instr>, env: Env },
}

enum Step {
    Done,
    Push(Vec<Frame>),
}

/// The kernel machine: a frame stack driven by `compute(budget)`.
pub struct Machine {
    stack: Vec<Frame>,
    root_env: Env,
    current: Option<Arc<Instr>>,
}

impl Machine {
    pub fn new(root_env: Env) -> Machine {
        Machine {
            stack: Vec::new(),
            root_env,
            current: None,
        }
    }

    pub fn root_env(&self) -> &Env {
        &self.root_env
    }

    pub fn push(&mut self, instr: Arc<Instr>, env: Env) {
        self.stack.push(Frame::Instr { instr, env });
    }

    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    /// The instruction currently being executed, for diagnostics and for
    /// natives that inspect their call site.
    pub fn current(&self) -> Option<Arc<Instr>> {
        self.current.clone()
    }

    /// Run until the stack empties, the budget expires, execution suspends
    /// on an unbound var, or the machine halts. A suspended instruction is
    /// left on the stack and re-executes in full once its barrier binds.
    pub fn compute(&mut self, host: &mut dyn MachineHost, budget: u64) -> ComputeResult {
        let mut remaining = budget;
        loop {
            let top = match self.stack.last() {
                Some(top) => top,
                None => return ComputeResult::Complete,
            };
            // A catch frame reached by normal completion is discarded.
            if matches!(top, Frame::Catch { .. }) {
                self.stack.pop();
                continue;
            }
            if remaining == 0 {
                return ComputeResult::Preempt;
            }
            remaining -= 1;
            let (instr, env) = match top {
                Frame::Instr { instr, env } => (instr.clone(), env.clone()),
                Frame::Catch { .. } => unreachable!("catch frames are discarded above"),
            };
            self.current = Some(instr.clone());
            match self.exec(host, &instr, &env) {
                Ok(step) => {
                    self.stack.pop();
                    if let Step::Push(frames) = step {
                        self.stack.extend(frames);
                    }
                }
                Err(Signal::Wait(barrier)) => return ComputeResult::Wait(barrier),
                Err(Signal::Throw { value }) => {
                    if let Err(halt) = self.unwind(value, None) {
                        return ComputeResult::Halt(halt);
                    }
                }
                Err(Signal::TouchedFailed(failed)) => {
                    trace!("machine halting on a touched failed value");
                    return ComputeResult::Halt(ComputeHalt {
                        uncaught_throw: None,
                        touched_failed: Some(failed),
                        native_cause: None,
                        current: self.current.clone(),
                    });
                }
                Err(Signal::Unify(error)) => {
                    trace!("machine halting on a unification error: {}", error.message);
                    return ComputeResult::Halt(ComputeHalt {
                        uncaught_throw: Some(complete_or_render(&error_rec(
                            "UnificationError",
                            &error.message,
                        ))),
                        touched_failed: None,
                        native_cause: Some(error.message),
                        current: self.current.clone(),
                    });
                }
                Err(Signal::Native(error)) => {
                    let thrown = error_rec(error.name, &error.message);
                    if let Err(halt) = self.unwind(thrown, Some(error.to_string())) {
                        return ComputeResult::Halt(halt);
                    }
                }
            }
        }
    }

    /// Unwind to the nearest catch frame whose pattern matches, or halt.
    fn unwind(&mut self, thrown: Value, native_cause: Option<String>) -> Result<(), ComputeHalt> {
        while let Some(frame) = self.stack.pop() {
            if let Frame::Catch { pattern, handler, env } = frame {
                let mut bindings = Vec::new();
                if let Ok(true) =
                    match_pattern(&ValueOrVar::Value(thrown.clone()), &pattern, &env, &mut bindings)
                {
                    let env = Env::create(env, bindings);
                    self.stack.push(Frame::Instr { instr: handler, env });
                    return Ok(());
                }
            }
        }
        Err(ComputeHalt {
            uncaught_throw: Some(complete_or_render(&thrown)),
            touched_failed: None,
            native_cause,
            current: self.current.clone(),
        })
    }

    fn exec(
        &mut self,
        host: &mut dyn MachineHost,
        instr: &Arc<Instr>,
        env: &Env,
    ) -> Result<Step, Signal> {
        match &**instr {
            Instr::Local { idents, body, .. } => {
                let entries = idents
                    .iter()
                    .map(|ident| EnvEntry::new(ident.clone(), Var::new()))
                    .collect();
                Ok(Step::Push(vec![Frame::Instr {
                    instr: body.clone(),
                    env: Env::create(env.clone(), entries),
                }]))
            }
            Instr::Seq { body, .. } => {
                let frames = body
                    .iter()
                    .rev()
                    .map(|instr| Frame::Instr {
                        instr: instr.clone(),
                        env: env.clone(),
                    })
                    .collect();
                Ok(Step::Push(frames))
            }
            Instr::Bind { left, right, .. } => {
                let left = resolve_value_or_var(left, env)?;
                let right = resolve_value_or_var(right, env)?;
                left.bind_value_or_var(&right)?;
                Ok(Step::Done)
            }
            Instr::Op {
                op,
                left,
                right,
                target,
                ..
            } => {
                let result = match op {
                    BinOp::Eq | BinOp::Ne => {
                        let a = resolve_for_op(left, env)?.check_complete()?;
                        let b = resolve_for_op(right, env)?.check_complete()?;
                        let entailed = a.entails(&b);
                        Literal::Bool(if *op == BinOp::Eq { entailed } else { !entailed })
                    }
                    _ => {
                        let a = resolve_for_op(left, env)?;
                        let b = resolve_for_op(right, env)?;
                        eval_binop(*op, &a, &b)?
                    }
                };
                let target = resolve_value_or_var(target, env)?;
                target.bind_value(result.into())?;
                Ok(Step::Done)
            }
            Instr::CreateRec {
                label,
                fields,
                target,
                ..
            } => {
                let label = literal_or_var(label, env)?;
                let mut partial_fields = Vec::new();
                for (feature, value) in fields {
                    partial_fields.push(PartialField {
                        feature: feature_or_var(feature, env)?,
                        value: resolve_value_or_var(value, env)?,
                    });
                }
                let rec = Value::Rec(RecVal::Partial(Arc::new(PartialRec::new(
                    label,
                    partial_fields,
                ))));
                // Freeze into a complete rec right away when possible.
                let value = match rec.check_complete() {
                    Ok(complete) => complete.into(),
                    Err(Signal::Wait(_)) => rec,
                    Err(other) => return Err(other),
                };
                resolve_value_or_var(target, env)?.bind_value(value)?;
                Ok(Step::Done)
            }
            Instr::CreateTuple {
                label,
                values,
                target,
                ..
            } => {
                let label = literal_or_var(label, env)?;
                let mut tuple_values = Vec::new();
                for value in values {
                    tuple_values.push(resolve_value_or_var(value, env)?);
                }
                let tuple = Value::Tuple(TupleVal::Partial(Arc::new(PartialTuple {
                    label,
                    values: tuple_values,
                })));
                let value = match tuple.check_complete() {
                    Ok(complete) => complete.into(),
                    Err(Signal::Wait(_)) => tuple,
                    Err(other) => return Err(other),
                };
                resolve_value_or_var(target, env)?.bind_value(value)?;
                Ok(Step::Done)
            }
            Instr::CreateProc { def, target, .. } => {
                let mut entries = Vec::new();
                for ident in &def.free {
                    let var = env
                        .get(ident)
                        .ok_or_else(|| Signal::Native(NativeError::ident_not_found(ident)))?;
                    entries.push(EnvEntry::new(ident.clone(), var));
                }
                let closure = Value::Proc(ProcVal::Closure(Arc::new(Closure {
                    def: def.clone(),
                    captured: Env::create(Env::empty(), entries),
                })));
                let target = env
                    .get(target)
                    .ok_or_else(|| Signal::Native(NativeError::ident_not_found(target)))?;
                target.bind_value(closure)?;
                Ok(Step::Done)
            }
            Instr::CreateActorCfg {
                ctor, args, target, ..
            } => {
                let ctor = match resolve_for_op(ctor, env)? {
                    Value::Proc(proc) => proc,
                    other => {
                        return Err(Signal::Native(NativeError::type_error(&format!(
                            "not a handler constructor: {other}"
                        ))))
                    }
                };
                let mut complete_args = Vec::new();
                for arg in args {
                    complete_args.push(resolve_value_or_var(arg, env)?.check_complete()?);
                }
                let cfg = Value::ActorCfg(Arc::new(ActorCfg {
                    args: complete_args,
                    handler_ctor: ctor,
                }));
                resolve_value_or_var(target, env)?.bind_value(cfg)?;
                Ok(Step::Done)
            }
            Instr::Select {
                rec,
                feature,
                target,
                ..
            } => {
                let feature = resolve_feature(feature, env)?;
                let selected = select_feature(&resolve_for_op(rec, env)?, &feature)?;
                let target = resolve_value_or_var(target, env)?;
                target.bind_value_or_var(&selected)?;
                Ok(Step::Done)
            }
            Instr::SelectApply {
                rec, feature, args, ..
            } => {
                let feature = resolve_feature(feature, env)?;
                let selected = select_feature(&resolve_for_op(rec, env)?, &feature)?;
                let proc = match selected {
                    ValueOrVar::Value(Value::Proc(proc)) => proc,
                    ValueOrVar::Var(unbound) => return Err(Signal::Wait(unbound)),
                    ValueOrVar::Value(other) => {
                        return Err(Signal::Native(NativeError::type_error(&format!(
                            "selected feature {feature} is not a proc: {other}"
                        ))))
                    }
                };
                self.apply_proc(host, &proc, args, env)
            }
            Instr::Apply { proc, args, .. } => {
                let proc = match resolve_for_op(proc, env)? {
                    Value::Proc(proc) => proc,
                    other => {
                        return Err(Signal::Native(NativeError::type_error(&format!(
                            "not a proc: {other}"
                        ))))
                    }
                };
                self.apply_proc(host, &proc, args, env)
            }
            Instr::If {
                cond,
                consequent,
                alternate,
                ..
            } => {
                let cond = match resolve_for_op(cond, env)? {
                    Value::Literal(Literal::Bool(b)) => b,
                    other => {
                        return Err(Signal::Native(NativeError::type_error(&format!(
                            "not a bool: {other}"
                        ))))
                    }
                };
                let branch = if cond {
                    Some(consequent.clone())
                } else {
                    alternate.clone()
                };
                Ok(match branch {
                    Some(instr) => Step::Push(vec![Frame::Instr {
                        instr,
                        env: env.clone(),
                    }]),
                    None => Step::Done,
                })
            }
            Instr::Case {
                of,
                pattern,
                consequent,
                alternate,
                ..
            } => {
                let subject = resolve_value_or_var(of, env)?;
                if let ValueOrVar::Var(unbound) = &subject {
                    return Err(Signal::Wait(unbound.clone()));
                }
                let mut bindings = Vec::new();
                let matched = match_pattern(&subject, pattern, env, &mut bindings)?;
                let branch = if matched {
                    Some(Frame::Instr {
                        instr: consequent.clone(),
                        env: Env::create(env.clone(), bindings),
                    })
                } else {
                    alternate.clone().map(|instr| Frame::Instr {
                        instr,
                        env: env.clone(),
                    })
                };
                Ok(match branch {
                    Some(frame) => Step::Push(vec![frame]),
                    None => Step::Done,
                })
            }
            Instr::Throw { value, .. } => {
                let value = resolve_for_op(value, env)?;
                Err(Signal::Throw { value })
            }
            Instr::TryCatch {
                body,
                pattern,
                handler,
                ..
            } => Ok(Step::Push(vec![
                Frame::Catch {
                    pattern: pattern.clone(),
                    handler: handler.clone(),
                    env: env.clone(),
                },
                Frame::Instr {
                    instr: body.clone(),
                    env: env.clone(),
                },
            ])),
            Instr::Act { .. } => {
                // `act` is dispatched through the root-env intrinsic so the
                // hosting actor can capture free variables and spawn the
                // child computation.
                let act = env
                    .get(&Ident::act())
                    .ok_or_else(|| Signal::Native(NativeError::ident_not_found(&Ident::act())))?;
                match act.resolve_value_or_var() {
                    ValueOrVar::Value(Value::Proc(ProcVal::Native(native))) => {
                        let mut ctx = ExecCtx {
                            machine: self,
                            host,
                        };
                        native.apply(&mut ctx, &[], env)?;
                        Ok(Step::Done)
                    }
                    other => Err(Signal::Native(NativeError::type_error(&format!(
                        "act is not a native proc: {other}"
                    )))),
                }
            }
        }
    }

    fn apply_proc(
        &mut self,
        host: &mut dyn MachineHost,
        proc: &ProcVal,
        args: &[CompleteOrIdent],
        env: &Env,
    ) -> Result<Step, Signal> {
        match proc {
            ProcVal::Native(native) => {
                let mut ctx = ExecCtx {
                    machine: self,
                    host,
                };
                native.apply(&mut ctx, args, env)?;
                Ok(Step::Done)
            }
            ProcVal::Closure(closure) => {
                let params = &closure.def.params;
                if params.len() != args.len() {
                    return Err(Signal::Native(NativeError::invalid_arg_count(
                        params.len(),
                        args.len(),
                        "proc",
                    )));
                }
                let entries = param_entries(params, args, env)?;
                Ok(Step::Push(vec![Frame::Instr {
                    instr: closure.def.body.clone(),
                    env: Env::create(closure.captured.clone(), entries),
                }]))
            }
            ProcVal::CompleteClosure(closure) => {
                let params = &closure.def().params;
                if params.len() != args.len() {
                    return Err(Signal::Native(NativeError::invalid_arg_count(
                        params.len(),
                        args.len(),
                        "proc",
                    )));
                }
                let entries = param_entries(params, args, env)?;
                // A complete closure crossed an actor boundary; its captures
                // are rebuilt over the receiving actor's root environment.
                let captured: Vec<EnvEntry> = closure
                    .captured()
                    .map(|(ident, value)| {
                        EnvEntry::new(ident.clone(), Var::bound_complete(value.clone()))
                    })
                    .collect();
                let captured_env = Env::create(self.root_env.clone(), captured);
                Ok(Step::Push(vec![Frame::Instr {
                    instr: closure.def().body.clone(),
                    env: Env::create(captured_env, entries),
                }]))
            }
        }
    }
}

fn param_entries(
    params: &[Ident],
    args: &[CompleteOrIdent],
    env: &Env,
) -> Result<Vec<EnvEntry>, Signal> {
    let mut entries = Vec::with_capacity(params.len());
    for (param, arg) in params.iter().zip(args.iter()) {
        let var = match resolve_value_or_var(arg, env)? {
            // Share the caller's cell so out-parameters flow back.
            ValueOrVar::Var(var) => var,
            ValueOrVar::Value(value) => Var::bound(value),
        };
        entries.push(EnvEntry::new(param.clone(), var));
    }
    Ok(entries)
}

/// Resolve an operand to a value or the canonical unbound var.
pub fn resolve_value_or_var(operand: &CompleteOrIdent, env: &Env) -> Result<ValueOrVar, Signal> {
    match operand {
        CompleteOrIdent::Complete(complete) => Ok(ValueOrVar::Value(complete.clone().into())),
        CompleteOrIdent::Ident(ident) => {
            let var = env
                .get(ident)
                .ok_or_else(|| Signal::Native(NativeError::ident_not_found(ident)))?;
            Ok(var.resolve_value_or_var())
        }
    }
}

/// Resolve an operand to a value, suspending on an unbound var.
pub fn resolve_value(operand: &CompleteOrIdent, env: &Env) -> Result<Value, Signal> {
    match resolve_value_or_var(operand, env)? {
        ValueOrVar::Value(value) => Ok(value),
        ValueOrVar::Var(unbound) => Err(Signal::Wait(unbound)),
    }
}

/// Resolve an operand for computational use. Touching a failed value halts
/// the machine.
pub fn resolve_for_op(operand: &CompleteOrIdent, env: &Env) -> Result<Value, Signal> {
    match resolve_value(operand, env)? {
        Value::Failed(failed) => Err(Signal::TouchedFailed(failed)),
        value => Ok(value),
    }
}

/// Resolve a label or feature operand to a literal, suspending as needed.
pub fn resolve_literal(operand: &LiteralOrIdent, env: &Env) -> Result<Literal, Signal> {
    match operand {
        LiteralOrIdent::Literal(literal) => Ok(literal.clone()),
        LiteralOrIdent::Ident(ident) => {
            match resolve_for_op(&CompleteOrIdent::Ident(ident.clone()), env)? {
                Value::Literal(literal) => Ok(literal),
                other => Err(Signal::Native(NativeError::type_error(&format!(
                    "not a literal: {other}"
                )))),
            }
        }
    }
}

pub fn resolve_feature(operand: &LiteralOrIdent, env: &Env) -> Result<Feature, Signal> {
    Feature::try_from(&resolve_literal(operand, env)?).map_err(Signal::Native)
}

/// Resolve a label operand without suspending: an unbound label stays a var
/// inside the partial record.
fn literal_or_var(operand: &LiteralOrIdent, env: &Env) -> Result<LiteralOrVar, Signal> {
    match operand {
        LiteralOrIdent::Literal(literal) => Ok(LiteralOrVar::Literal(literal.clone())),
        LiteralOrIdent::Ident(ident) => {
            match resolve_value_or_var(&CompleteOrIdent::Ident(ident.clone()), env)? {
                ValueOrVar::Value(Value::Literal(literal)) => Ok(LiteralOrVar::Literal(literal)),
                ValueOrVar::Var(var) => Ok(LiteralOrVar::Var(var)),
                ValueOrVar::Value(other) => Err(Signal::Native(NativeError::type_error(
                    &format!("not a literal: {other}"),
                ))),
            }
        }
    }
}

fn feature_or_var(operand: &LiteralOrIdent, env: &Env) -> Result<FeatureOrVar, Signal> {
    match literal_or_var(operand, env)? {
        LiteralOrVar::Literal(literal) => Ok(FeatureOrVar::Feature(
            Feature::try_from(&literal).map_err(Signal::Native)?,
        )),
        LiteralOrVar::Var(var) => Ok(FeatureOrVar::Var(var)),
    }
}

/// Select a feature out of a value. Only records, tuples, actor references,
/// and objects have features; selecting into an actor cfg is an error.
pub fn select_feature(value: &Value, feature: &Feature) -> Result<ValueOrVar, Signal> {
    match value {
        Value::Rec(rec) => rec.select(feature),
        Value::Tuple(tuple) => tuple.select(feature),
        Value::ActorRef(actor_ref) => actor_ref
            .select(feature)
            .map(|complete| ValueOrVar::Value(complete.into())),
        Value::Obj(obj) => obj.select(feature),
        Value::CompleteObj(obj) => obj
            .select(feature)
            .map(|complete| ValueOrVar::Value(complete.into())),
        Value::ActorCfg(_) => Err(Signal::Native(NativeError::not_implemented(
            "selecting into an actor cfg",
        ))),
        other => Err(Signal::Native(NativeError::type_error(&format!(
            "cannot select feature {feature} from a {}",
            other.kind_name()
        )))),
    }
}

fn eval_binop(op: BinOp, a: &Value, b: &Value) -> Result<Literal, Signal> {
    let (a, b) = match (a, b) {
        (Value::Literal(a), Value::Literal(b)) => (a, b),
        _ => {
            return Err(Signal::Native(NativeError::type_error(&format!(
                "cannot apply {op} to {a} and {b}"
            ))))
        }
    };
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mult | BinOp::Div | BinOp::Mod => eval_arith(op, a, b),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare_literals(a, b)?;
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Literal::Bool(result))
        }
        BinOp::Eq | BinOp::Ne => unreachable!("entailment is handled by the caller"),
    }
}

/// Mixed `Int64`/`Dec128` arithmetic promotes to `Dec128`.
fn eval_arith(op: BinOp, a: &Literal, b: &Literal) -> Result<Literal, Signal> {
    match (a, b) {
        (Literal::Int64(a), Literal::Int64(b)) => {
            let result = match op {
                BinOp::Add => a.wrapping_add(*b),
                BinOp::Sub => a.wrapping_sub(*b),
                BinOp::Mult => a.wrapping_mul(*b),
                BinOp::Div => a
                    .checked_div(*b)
                    .ok_or_else(|| Signal::Native(NativeError::arithmetic("/ by zero")))?,
                BinOp::Mod => a
                    .checked_rem(*b)
                    .ok_or_else(|| Signal::Native(NativeError::arithmetic("% by zero")))?,
                _ => unreachable!(),
            };
            Ok(Literal::Int64(result))
        }
        (Literal::Dec128(_), _) | (_, Literal::Dec128(_)) => {
            let a = as_decimal(a)?;
            let b = as_decimal(b)?;
            let result = match op {
                BinOp::Add => a
                    .checked_add(b)
                    .ok_or_else(|| Signal::Native(NativeError::arithmetic("decimal overflow")))?,
                BinOp::Sub => a
                    .checked_sub(b)
                    .ok_or_else(|| Signal::Native(NativeError::arithmetic("decimal overflow")))?,
                BinOp::Mult => a
                    .checked_mul(b)
                    .ok_or_else(|| Signal::Native(NativeError::arithmetic("decimal overflow")))?,
                BinOp::Div => a
                    .checked_div(b)
                    .ok_or_else(|| Signal::Native(NativeError::arithmetic("/ by zero")))?,
                BinOp::Mod => a
                    .checked_rem(b)
                    .ok_or_else(|| Signal::Native(NativeError::arithmetic("% by zero")))?,
                _ => unreachable!(),
            };
            Ok(Literal::Dec128(result))
        }
        _ => Err(Signal::Native(NativeError::type_error(&format!(
            "cannot apply {op} to {a} and {b}"
        )))),
    }
}

fn as_decimal(literal: &Literal) -> Result<Decimal, Signal> {
    match literal {
        Literal::Dec128(d) => Ok(*d),
        Literal::Int64(i) => Ok(Decimal::from(*i)),
        other => Err(Signal::Native(NativeError::type_error(&format!(
            "not a number: {other}"
        )))),
    }
}

fn compare_literals(a: &Literal, b: &Literal) -> Result<std::cmp::Ordering, Signal> {
    match (a, b) {
        (Literal::Int64(a), Literal::Int64(b)) => Ok(a.cmp(b)),
        (Literal::Dec128(_), Literal::Int64(_) | Literal::Dec128(_))
        | (Literal::Int64(_), Literal::Dec128(_)) => {
            let a = as_decimal(a)?;
            let b = as_decimal(b)?;
            Ok(a.cmp(&b))
        }
        (Literal::Str(a), Literal::Str(b)) => Ok(a.cmp(b)),
        (Literal::Char(a), Literal::Char(b)) => Ok(a.cmp(b)),
        _ => Err(Signal::Native(NativeError::type_error(&format!(
            "cannot compare {a} with {b}"
        )))),
    }
}

/// Match a value against a pattern, accumulating capture bindings. Captures
/// bind without resolving, so an unbound field var flows into the branch.
pub fn match_pattern(
    subject: &ValueOrVar,
    pattern: &Pat,
    env: &Env,
    bindings: &mut Vec<EnvEntry>,
) -> Result<bool, Signal> {
    match pattern {
        Pat::Capture(ident) => {
            let var = match subject {
                ValueOrVar::Var(var) => var.clone(),
                ValueOrVar::Value(value) => Var::bound(value.clone()),
            };
            bindings.push(EnvEntry::new(ident.clone(), var));
            Ok(true)
        }
        Pat::Literal(literal) => match resolve_subject(subject)? {
            Value::Literal(actual) => Ok(actual == *literal),
            _ => Ok(false),
        },
        Pat::Esc(ident) => {
            let expected =
                resolve_value_or_var(&CompleteOrIdent::Ident(ident.clone()), env)?.check_complete()?;
            let actual = subject.check_complete()?;
            Ok(expected.entails(&actual))
        }
        Pat::Rec {
            label,
            fields,
            partial,
        } => {
            let rec = match resolve_subject(subject)? {
                Value::Rec(rec) => rec,
                _ => return Ok(false),
            };
            if rec.label()? != resolve_literal(label, env)? {
                return Ok(false);
            }
            if !partial && rec.field_count() != fields.len() {
                return Ok(false);
            }
            for (feature, sub) in fields {
                let feature = resolve_feature(feature, env)?;
                match rec.find_value_or_var(&feature)? {
                    Some(value) => {
                        if !match_pattern(&value, sub, env, bindings)? {
                            return Ok(false);
                        }
                    }
                    None => return Ok(false),
                }
            }
            Ok(true)
        }
        Pat::Tuple {
            label,
            values,
            partial,
        } => {
            let tuple = match resolve_subject(subject)? {
                Value::Tuple(tuple) => tuple,
                _ => return Ok(false),
            };
            if tuple.label()? != resolve_literal(label, env)? {
                return Ok(false);
            }
            if (!partial && tuple.len() != values.len()) || tuple.len() < values.len() {
                return Ok(false);
            }
            for (index, sub) in values.iter().enumerate() {
                let value = match tuple.value_at(index) {
                    Some(value) => value,
                    None => return Ok(false),
                };
                if !match_pattern(&value, sub, env, bindings)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

fn resolve_subject(subject: &ValueOrVar) -> Result<Value, Signal> {
    let value = match subject {
        ValueOrVar::Value(value) => value.clone(),
        ValueOrVar::Var(var) => match var.resolve_value_or_var() {
            ValueOrVar::Value(value) => value,
            ValueOrVar::Var(unbound) => return Err(Signal::Wait(unbound)),
        },
    };
    match value {
        Value::Failed(failed) => Err(Signal::TouchedFailed(failed)),
        value => Ok(value),
    }
}

/// Build the `error#{name: _, message: _}` record for a native error.
pub fn error_rec(name: &str, message: &str) -> Value {
    let rec = CompleteRec::build(
        Literal::str("error"),
        vec![
            (Feature::str("name"), Complete::str(name)),
            (Feature::str("message"), Complete::str(message)),
        ],
    )
    .expect("error rec features are distinct");
    Value::Rec(RecVal::Complete(Arc::new(rec)))
}

fn complete_or_render(value: &Value) -> Complete {
    value
        .check_complete()
        .unwrap_or_else(|_| Complete::str(&format!("{value}")))
}
