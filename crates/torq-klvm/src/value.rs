use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use rust_decimal::Decimal;

use crate::actor::{ActorRefObj, NativeActorCfg};
use crate::env::Env;
use crate::failed::FailedValue;
use crate::instr::ProcDef;
use crate::machine::{ExecCtx, NativeError, Signal};
use crate::rec::{CompleteRec, CompleteTuple, RecVal, TupleVal};
use crate::var::{Var, ValueOrVar};

/// An identifier in kernel code and environments.
///
/// Identifiers starting with `$` are reserved for the runtime (`$handler`,
/// `$next`, ...) and can never collide with lowered source identifiers.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(Arc<str>);

impl Ident {
    pub fn new(name: &str) -> Ident {
        Ident(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// The cell holding the actor's message handler for its lifetime.
    pub fn handler() -> Ident {
        Ident::new("$handler")
    }

    /// The constructor applied at configure time to produce the handler.
    pub fn handler_ctor() -> Ident {
        Ident::new("$handler_ctor")
    }

    /// The incoming message within a handler application.
    pub fn next() -> Ident {
        Ident::new("$next")
    }

    /// Synthetic identifiers for configuration arguments.
    pub fn system_arg(index: usize) -> Ident {
        Ident::new(&format!("$arg{index}"))
    }

    pub fn act() -> Ident {
        Ident::new("act")
    }

    pub fn import() -> Ident {
        Ident::new("import")
    }

    pub fn respond() -> Ident {
        Ident::new("respond")
    }

    pub fn self_ident() -> Ident {
        Ident::new("self")
    }

    pub fn spawn() -> Ident {
        Ident::new("spawn")
    }
}

impl fmt::Debug for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Atomic kernel values. Literals are valid record labels, and all literals
/// except `Dec128` are valid record features.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Literal {
    Nothing,
    Eof,
    Bool(bool),
    Char(char),
    Int64(i64),
    Dec128(Decimal),
    Str(Arc<str>),
}

impl Literal {
    pub fn str(value: &str) -> Literal {
        Literal::Str(Arc::from(value))
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Literal::Eof)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Nothing => write!(f, "nothing"),
            Literal::Eof => write!(f, "eof"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Char(c) => write!(f, "&{c}"),
            Literal::Int64(i) => write!(f, "{i}"),
            Literal::Dec128(d) => write!(f, "{d}m"),
            Literal::Str(s) => write!(f, "'{s}'"),
        }
    }
}

/// A record feature. Features order canonically: integers first, then
/// characters, booleans, strings, and finally the `eof`/`nothing` atoms.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feature {
    Int64(i64),
    Char(char),
    Bool(bool),
    Str(Arc<str>),
    Eof,
    Nothing,
}

impl Feature {
    pub fn str(value: &str) -> Feature {
        Feature::Str(Arc::from(value))
    }
}

impl TryFrom<&Literal> for Feature {
    type Error = NativeError;

    fn try_from(literal: &Literal) -> Result<Feature, NativeError> {
        match literal {
            Literal::Int64(i) => Ok(Feature::Int64(*i)),
            Literal::Char(c) => Ok(Feature::Char(*c)),
            Literal::Bool(b) => Ok(Feature::Bool(*b)),
            Literal::Str(s) => Ok(Feature::Str(s.clone())),
            Literal::Eof => Ok(Feature::Eof),
            Literal::Nothing => Ok(Feature::Nothing),
            Literal::Dec128(_) => Err(NativeError::type_error("a Dec128 is not a valid feature")),
        }
    }
}

impl From<&Feature> for Literal {
    fn from(feature: &Feature) -> Literal {
        match feature {
            Feature::Int64(i) => Literal::Int64(*i),
            Feature::Char(c) => Literal::Char(*c),
            Feature::Bool(b) => Literal::Bool(*b),
            Feature::Str(s) => Literal::Str(s.clone()),
            Feature::Eof => Literal::Eof,
            Feature::Nothing => Literal::Nothing,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Literal::from(self))
    }
}

/// An actor-local object, such as a stream. Local objects never cross actor
/// boundaries and are not completable.
pub trait Obj: fmt::Debug + Send + Sync {
    fn select(&self, feature: &Feature) -> Result<ValueOrVar, Signal>;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// An opaque object that is itself a complete value, such as a module class.
pub trait CompleteObj: fmt::Debug + Send + Sync {
    fn select(&self, feature: &Feature) -> Result<Complete, Signal>;
}

/// A procedure implemented by the runtime rather than by kernel code.
///
/// Native procedures must not push machine frames; they either complete
/// synchronously or fail with a [`Signal`].
#[derive(Clone)]
pub struct NativeProc {
    name: &'static str,
    apply: Arc<NativeApply>,
}

pub type NativeApply =
    dyn Fn(&mut ExecCtx<'_>, &[CompleteOrIdent], &Env) -> Result<(), Signal> + Send + Sync;

impl NativeProc {
    pub fn new(
        name: &'static str,
        apply: impl Fn(&mut ExecCtx<'_>, &[CompleteOrIdent], &Env) -> Result<(), Signal>
            + Send
            + Sync
            + 'static,
    ) -> NativeProc {
        NativeProc {
            name,
            apply: Arc::new(apply),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(
        &self,
        ctx: &mut ExecCtx<'_>,
        args: &[CompleteOrIdent],
        env: &Env,
    ) -> Result<(), Signal> {
        (self.apply)(ctx, args, env)
    }

    pub fn same_proc(&self, other: &NativeProc) -> bool {
        Arc::ptr_eq(&self.apply, &other.apply)
    }
}

impl fmt::Debug for NativeProc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native proc {}>", self.name)
    }
}

/// A kernel closure: a procedure definition plus the captured environment
/// entries for its free identifiers.
#[derive(Clone, Debug)]
pub struct Closure {
    pub def: Arc<ProcDef>,
    pub captured: Env,
}

/// A closure whose captured values are all complete. Complete closures may
/// cross actor boundaries; they are applied against the receiving actor's
/// root environment.
///
/// Captured slots are `OnceLock`s so that a self-recursive closure can be
/// completed in two phases: the closure is memoized first, then its captures
/// are resolved (which may resolve back to the closure itself).
#[derive(Debug)]
pub struct CompleteClosure {
    def: Arc<ProcDef>,
    captured: Vec<(Ident, OnceLock<Complete>)>,
}

impl CompleteClosure {
    pub fn new(def: Arc<ProcDef>, captured: Vec<(Ident, Complete)>) -> CompleteClosure {
        CompleteClosure {
            def,
            captured: captured
                .into_iter()
                .map(|(ident, value)| (ident, OnceLock::from(value)))
                .collect(),
        }
    }

    fn with_empty_slots(def: Arc<ProcDef>, idents: Vec<Ident>) -> CompleteClosure {
        CompleteClosure {
            def,
            captured: idents
                .into_iter()
                .map(|ident| (ident, OnceLock::new()))
                .collect(),
        }
    }

    pub fn def(&self) -> &Arc<ProcDef> {
        &self.def
    }

    pub fn captured(&self) -> impl Iterator<Item = (&Ident, &Complete)> {
        self.captured
            .iter()
            .map(|(ident, slot)| (ident, slot.get().expect("captured slot is filled")))
    }
}

#[derive(Clone, Debug)]
pub enum ProcVal {
    Closure(Arc<Closure>),
    CompleteClosure(Arc<CompleteClosure>),
    Native(NativeProc),
}

impl ProcVal {
    fn same_proc(&self, other: &ProcVal) -> bool {
        match (self, other) {
            (ProcVal::Closure(a), ProcVal::Closure(b)) => Arc::ptr_eq(a, b),
            (ProcVal::CompleteClosure(a), ProcVal::CompleteClosure(b)) => Arc::ptr_eq(a, b),
            (ProcVal::Native(a), ProcVal::Native(b)) => a.same_proc(b),
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub enum CompleteProcVal {
    CompleteClosure(Arc<CompleteClosure>),
    Native(NativeProc),
}

impl From<CompleteProcVal> for ProcVal {
    fn from(proc: CompleteProcVal) -> ProcVal {
        match proc {
            CompleteProcVal::CompleteClosure(c) => ProcVal::CompleteClosure(c),
            CompleteProcVal::Native(n) => ProcVal::Native(n),
        }
    }
}

/// An actor configuration: handler-constructor closure plus configuration
/// arguments. The configuration is verified to be effectively complete at
/// spawn time, not at construction time, to increase concurrency.
#[derive(Clone, Debug)]
pub struct ActorCfg {
    pub args: Vec<Complete>,
    pub handler_ctor: ProcVal,
}

/// A kernel value. Values are actor-local; only the [`Complete`] subset may
/// be shared across actor boundaries.
#[derive(Clone, Debug)]
pub enum Value {
    Literal(Literal),
    Rec(RecVal),
    Tuple(TupleVal),
    Proc(ProcVal),
    ActorRef(ActorRefObj),
    ActorCfg(Arc<ActorCfg>),
    NativeCfg(Arc<dyn NativeActorCfg>),
    Obj(Arc<dyn Obj>),
    CompleteObj(Arc<dyn CompleteObj>),
    Failed(Arc<FailedValue>),
}

impl Value {
    /// Resolve this value to its complete form, or fail with
    /// `Signal::Wait(barrier)` carrying the first unbound sub-variable.
    pub fn check_complete(&self) -> Result<Complete, Signal> {
        Completer::default().complete_value(self)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Literal(_) => "literal",
            Value::Rec(_) => "rec",
            Value::Tuple(_) => "tuple",
            Value::Proc(_) => "proc",
            Value::ActorRef(_) => "actor ref",
            Value::ActorCfg(_) => "actor cfg",
            Value::NativeCfg(_) => "native actor cfg",
            Value::Obj(_) => "obj",
            Value::CompleteObj(_) => "obj",
            Value::Failed(_) => "failed value",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Literal(l) => write!(f, "{l}"),
            Value::Rec(r) => write!(f, "{r}"),
            Value::Tuple(t) => write!(f, "{t}"),
            Value::Proc(ProcVal::Native(n)) => write!(f, "{n:?}"),
            Value::Proc(_) => write!(f, "<proc>"),
            Value::ActorRef(r) => write!(f, "<actor {}>", r.referent().address()),
            Value::ActorCfg(_) => write!(f, "<actor cfg>"),
            Value::NativeCfg(_) => write!(f, "<native actor cfg>"),
            Value::Obj(o) => write!(f, "{o:?}"),
            Value::CompleteObj(o) => write!(f, "{o:?}"),
            Value::Failed(v) => write!(f, "{v}"),
        }
    }
}

/// A complete value: transitively free of unbound variables, immutable, and
/// safe to copy across actor boundaries.
#[derive(Clone, Debug)]
pub enum Complete {
    Literal(Literal),
    Rec(Arc<CompleteRec>),
    Tuple(Arc<CompleteTuple>),
    Proc(CompleteProcVal),
    ActorRef(ActorRefObj),
    NativeCfg(Arc<dyn NativeActorCfg>),
    Obj(Arc<dyn CompleteObj>),
    Failed(Arc<FailedValue>),
}

impl Complete {
    pub fn str(value: &str) -> Complete {
        Complete::Literal(Literal::str(value))
    }

    pub fn int(value: i64) -> Complete {
        Complete::Literal(Literal::Int64(value))
    }

    pub fn dec(value: Decimal) -> Complete {
        Complete::Literal(Literal::Dec128(value))
    }

    pub fn nothing() -> Complete {
        Complete::Literal(Literal::Nothing)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Complete::Literal(Literal::Eof))
    }

    /// Structural entailment: equal literals, structurally equal records and
    /// tuples, identity for procedures, objects, and actor references.
    pub fn entails(&self, other: &Complete) -> bool {
        match (self, other) {
            (Complete::Literal(a), Complete::Literal(b)) => a == b,
            (Complete::Rec(a), Complete::Rec(b)) => a.entails(b),
            (Complete::Tuple(a), Complete::Tuple(b)) => a.entails(b),
            (Complete::Proc(a), Complete::Proc(b)) => {
                ProcVal::from(a.clone()).same_proc(&ProcVal::from(b.clone()))
            }
            (Complete::ActorRef(a), Complete::ActorRef(b)) => a.same_referent(b),
            (Complete::NativeCfg(a), Complete::NativeCfg(b)) => Arc::ptr_eq(a, b),
            (Complete::Obj(a), Complete::Obj(b)) => Arc::ptr_eq(a, b),
            (Complete::Failed(a), Complete::Failed(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Complete> for Value {
    fn from(complete: Complete) -> Value {
        match complete {
            Complete::Literal(l) => Value::Literal(l),
            Complete::Rec(r) => Value::Rec(RecVal::Complete(r)),
            Complete::Tuple(t) => Value::Tuple(TupleVal::Complete(t)),
            Complete::Proc(p) => Value::Proc(p.into()),
            Complete::ActorRef(r) => Value::ActorRef(r),
            Complete::NativeCfg(n) => Value::NativeCfg(n),
            Complete::Obj(o) => Value::CompleteObj(o),
            Complete::Failed(v) => Value::Failed(v),
        }
    }
}

impl From<Literal> for Value {
    fn from(literal: Literal) -> Value {
        Value::Literal(literal)
    }
}

impl fmt::Display for Complete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complete::Literal(l) => write!(f, "{l}"),
            Complete::Rec(r) => write!(f, "{r}"),
            Complete::Tuple(t) => write!(f, "{t}"),
            Complete::Proc(CompleteProcVal::Native(n)) => write!(f, "{n:?}"),
            Complete::Proc(_) => write!(f, "<proc>"),
            Complete::ActorRef(r) => write!(f, "<actor {}>", r.referent().address()),
            Complete::NativeCfg(_) => write!(f, "<native actor cfg>"),
            Complete::Obj(o) => write!(f, "{o:?}"),
            Complete::Failed(v) => write!(f, "{v}"),
        }
    }
}

/// An instruction operand: either an embedded complete value or an
/// identifier resolved against the environment.
#[derive(Clone, Debug)]
pub enum CompleteOrIdent {
    Complete(Complete),
    Ident(Ident),
}

impl CompleteOrIdent {
    pub fn ident(name: &str) -> CompleteOrIdent {
        CompleteOrIdent::Ident(Ident::new(name))
    }
}

impl From<Literal> for CompleteOrIdent {
    fn from(literal: Literal) -> CompleteOrIdent {
        CompleteOrIdent::Complete(Complete::Literal(literal))
    }
}

impl From<Ident> for CompleteOrIdent {
    fn from(ident: Ident) -> CompleteOrIdent {
        CompleteOrIdent::Ident(ident)
    }
}

/// A label or feature operand in record construction and patterns.
#[derive(Clone, Debug)]
pub enum LiteralOrIdent {
    Literal(Literal),
    Ident(Ident),
}

impl From<Literal> for LiteralOrIdent {
    fn from(literal: Literal) -> LiteralOrIdent {
        LiteralOrIdent::Literal(literal)
    }
}

impl From<Ident> for LiteralOrIdent {
    fn from(ident: Ident) -> LiteralOrIdent {
        LiteralOrIdent::Ident(ident)
    }
}

/// Resolves values into their complete form, memoizing closures so that
/// self-recursive captures terminate.
#[derive(Default)]
pub(crate) struct Completer {
    closures: HashMap<usize, Arc<CompleteClosure>>,
}

impl Completer {
    pub(crate) fn complete_value_or_var(&mut self, vv: &ValueOrVar) -> Result<Complete, Signal> {
        match vv {
            ValueOrVar::Value(value) => self.complete_value(value),
            ValueOrVar::Var(var) => match var.resolve_value_or_var() {
                ValueOrVar::Value(value) => self.complete_value(&value),
                ValueOrVar::Var(unbound) => Err(Signal::Wait(unbound)),
            },
        }
    }

    pub(crate) fn complete_value(&mut self, value: &Value) -> Result<Complete, Signal> {
        match value {
            Value::Literal(l) => Ok(Complete::Literal(l.clone())),
            Value::Rec(r) => Ok(Complete::Rec(r.check_complete(self)?)),
            Value::Tuple(t) => Ok(Complete::Tuple(t.check_complete(self)?)),
            Value::Proc(p) => self.complete_proc(p),
            Value::ActorRef(r) => Ok(Complete::ActorRef(r.clone())),
            Value::ActorCfg(_) => Err(Signal::Native(NativeError::type_error(
                "an actor cfg cannot be converted to a complete value",
            ))),
            Value::NativeCfg(n) => Ok(Complete::NativeCfg(n.clone())),
            Value::Obj(_) => Err(Signal::Native(NativeError::type_error(
                "a local obj cannot be converted to a complete value",
            ))),
            Value::CompleteObj(o) => Ok(Complete::Obj(o.clone())),
            Value::Failed(v) => Ok(Complete::Failed(v.clone())),
        }
    }

    fn complete_proc(&mut self, proc: &ProcVal) -> Result<Complete, Signal> {
        match proc {
            ProcVal::Native(n) => Ok(Complete::Proc(CompleteProcVal::Native(n.clone()))),
            ProcVal::CompleteClosure(c) => {
                Ok(Complete::Proc(CompleteProcVal::CompleteClosure(c.clone())))
            }
            ProcVal::Closure(closure) => {
                let key = Arc::as_ptr(closure) as usize;
                if let Some(memoized) = self.closures.get(&key) {
                    return Ok(Complete::Proc(CompleteProcVal::CompleteClosure(
                        memoized.clone(),
                    )));
                }
                let entries: Vec<_> = closure.captured.local_entries().to_vec();
                let complete = Arc::new(CompleteClosure::with_empty_slots(
                    closure.def.clone(),
                    entries.iter().map(|e| e.ident.clone()).collect(),
                ));
                self.closures.insert(key, complete.clone());
                for (entry, (_, slot)) in entries.iter().zip(complete.captured.iter()) {
                    let resolved =
                        self.complete_value_or_var(&ValueOrVar::Var(entry.var.clone()))?;
                    let _ = slot.set(resolved);
                }
                Ok(Complete::Proc(CompleteProcVal::CompleteClosure(complete)))
            }
        }
    }
}
