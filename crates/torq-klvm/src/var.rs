use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::machine::Signal;
use crate::rec::{unify_recs, unify_tuples};
use crate::value::{Complete, Completer, Value};

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(1);

/// A callback fired exactly once when its variable binds.
pub type BindCallback = Box<dyn FnOnce(&Var, &Value) + Send>;

/// A dataflow variable: a single-assignment cell that is either unbound
/// (holding bind-callbacks and possibly linked into an equivalence class) or
/// bound to a value that may itself still be partial.
///
/// A var is conceptually owned by its home actor and only ever touched from
/// that actor's turn; the internal mutex is uncontended and exists to keep
/// values `Send` across turn tasks.
#[derive(Clone)]
pub struct Var(Arc<VarInner>);

struct VarInner {
    id: u64,
    cell: Mutex<VarCell>,
}

enum VarCell {
    Unbound { callbacks: Vec<BindCallback> },
    Link(Var),
    Bound(Value),
}

/// Either a resolved value or the canonical unbound variable.
#[derive(Clone, Debug)]
pub enum ValueOrVar {
    Value(Value),
    Var(Var),
}

impl ValueOrVar {
    pub fn bind_value(&self, value: Value) -> Result<(), Signal> {
        match self {
            ValueOrVar::Var(var) => var.bind_value(value),
            ValueOrVar::Value(existing) => unify_values(existing, &value),
        }
    }

    pub fn bind_value_or_var(&self, other: &ValueOrVar) -> Result<(), Signal> {
        match (self, other) {
            (ValueOrVar::Var(a), ValueOrVar::Var(b)) => a.unify_var(b),
            (ValueOrVar::Var(a), ValueOrVar::Value(v)) => a.bind_value(v.clone()),
            (ValueOrVar::Value(v), ValueOrVar::Var(b)) => b.bind_value(v.clone()),
            (ValueOrVar::Value(a), ValueOrVar::Value(b)) => unify_values(a, b),
        }
    }

    pub fn check_complete(&self) -> Result<Complete, Signal> {
        Completer::default().complete_value_or_var(self)
    }
}

impl fmt::Display for ValueOrVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueOrVar::Value(v) => write!(f, "{v}"),
            ValueOrVar::Var(v) => write!(f, "{v:?}"),
        }
    }
}

impl Var {
    pub fn new() -> Var {
        Var(Arc::new(VarInner {
            id: NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed),
            cell: Mutex::new(VarCell::Unbound { callbacks: vec![] }),
        }))
    }

    pub fn bound(value: Value) -> Var {
        Var(Arc::new(VarInner {
            id: NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed),
            cell: Mutex::new(VarCell::Bound(value)),
        }))
    }

    pub fn bound_complete(value: Complete) -> Var {
        Var::bound(value.into())
    }

    /// A stable identity for trigger maps and diagnostics.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn same_var(&self, other: &Var) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VarCell> {
        self.0.cell.lock().expect("var cell lock")
    }

    /// Walk the representative chain.
    fn representative(&self) -> Var {
        let mut current = self.clone();
        loop {
            let next = {
                let guard = current.lock();
                match &*guard {
                    VarCell::Link(next) => next.clone(),
                    _ => {
                        drop(guard);
                        return current;
                    }
                }
            };
            current = next;
        }
    }

    /// Walk the representative chain and return either the bound value or
    /// the canonical unbound var.
    pub fn resolve_value_or_var(&self) -> ValueOrVar {
        let rep = self.representative();
        let cell = rep.lock();
        match &*cell {
            VarCell::Bound(value) => ValueOrVar::Value(value.clone()),
            VarCell::Unbound { .. } => {
                drop(cell);
                ValueOrVar::Var(rep)
            }
            VarCell::Link(_) => unreachable!("representative is never a link"),
        }
    }

    pub fn check_complete(&self) -> Result<Complete, Signal> {
        ValueOrVar::Var(self.clone()).check_complete()
    }

    /// Register a callback fired when this var binds. If the var is already
    /// bound the callback fires immediately.
    pub fn add_bind_callback(&self, callback: BindCallback) {
        let rep = self.representative();
        let bound = {
            let mut cell = rep.lock();
            match &mut *cell {
                VarCell::Unbound { callbacks } => {
                    callbacks.push(callback);
                    None
                }
                VarCell::Bound(value) => Some((callback, value.clone())),
                VarCell::Link(_) => unreachable!("representative is never a link"),
            }
        };
        if let Some((callback, value)) = bound {
            callback(&rep, &value);
        }
    }

    /// Dataflow unification: bind this var to a value, or unify the value
    /// with an existing binding.
    pub fn bind_value(&self, value: Value) -> Result<(), Signal> {
        let rep = self.representative();
        let fired = {
            let mut cell = rep.lock();
            match &mut *cell {
                VarCell::Bound(existing) => {
                    let existing = existing.clone();
                    drop(cell);
                    return unify_values(&existing, &value);
                }
                VarCell::Unbound { callbacks } => {
                    let fired = std::mem::take(callbacks);
                    *cell = VarCell::Bound(value.clone());
                    fired
                }
                VarCell::Link(_) => unreachable!("representative is never a link"),
            }
        };
        for callback in fired {
            callback(&rep, &value);
        }
        Ok(())
    }

    pub fn bind_complete(&self, value: Complete) -> Result<(), Signal> {
        self.bind_value(value.into())
    }

    pub fn bind_value_or_var(&self, other: &ValueOrVar) -> Result<(), Signal> {
        match other {
            ValueOrVar::Value(value) => self.bind_value(value.clone()),
            ValueOrVar::Var(var) => self.unify_var(var),
        }
    }

    /// Merge two equivalence classes, or unify their bindings. Vars are
    /// actor-local, so the two cells are inspected sequentially.
    pub fn unify_var(&self, other: &Var) -> Result<(), Signal> {
        let a = self.representative();
        let b = other.representative();
        if a.same_var(&b) {
            return Ok(());
        }
        // Resolve b's state; an unbound b is linked into a's class and its
        // callbacks are carried over.
        let b_state: Result<Value, Vec<BindCallback>> = {
            let mut cell = b.lock();
            match &mut *cell {
                VarCell::Bound(value) => Ok(value.clone()),
                VarCell::Unbound { callbacks } => {
                    let taken = std::mem::take(callbacks);
                    *cell = VarCell::Link(a.clone());
                    Err(taken)
                }
                VarCell::Link(_) => unreachable!("representative is never a link"),
            }
        };
        match b_state {
            Ok(b_value) => a.bind_value(b_value),
            Err(b_callbacks) => {
                let fired = {
                    let mut cell = a.lock();
                    match &mut *cell {
                        VarCell::Unbound { callbacks } => {
                            callbacks.extend(b_callbacks);
                            None
                        }
                        VarCell::Bound(value) => Some((b_callbacks, value.clone())),
                        VarCell::Link(_) => unreachable!("representative is never a link"),
                    }
                };
                if let Some((callbacks, value)) = fired {
                    for callback in callbacks {
                        callback(&a, &value);
                    }
                }
                Ok(())
            }
        }
    }
}

impl Default for Var {
    fn default() -> Var {
        Var::new()
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.lock() {
            VarCell::Bound(value) => write!(f, "_V{}={value}", self.0.id),
            VarCell::Link(next) => write!(f, "_V{}->{next:?}", self.0.id),
            VarCell::Unbound { .. } => write!(f, "_V{}", self.0.id),
        }
    }
}

/// Structural unification of two values.
pub fn unify_values(a: &Value, b: &Value) -> Result<(), Signal> {
    match (a, b) {
        (Value::Literal(la), Value::Literal(lb)) => {
            if la == lb {
                Ok(())
            } else {
                Err(Signal::unification(a, b))
            }
        }
        (Value::Rec(ra), Value::Rec(rb)) => unify_recs(ra, rb),
        (Value::Tuple(ta), Value::Tuple(tb)) => unify_tuples(ta, tb),
        (Value::Proc(pa), Value::Proc(pb)) => {
            // Procedures unify by identity only.
            if unify_values_proc_eq(pa, pb) {
                Ok(())
            } else {
                Err(Signal::unification(a, b))
            }
        }
        (Value::ActorRef(ra), Value::ActorRef(rb)) => {
            if ra.same_referent(rb) {
                Ok(())
            } else {
                Err(Signal::unification(a, b))
            }
        }
        (Value::ActorCfg(ca), Value::ActorCfg(cb)) => {
            if Arc::ptr_eq(ca, cb) {
                Ok(())
            } else {
                Err(Signal::unification(a, b))
            }
        }
        (Value::NativeCfg(ca), Value::NativeCfg(cb)) => {
            if Arc::ptr_eq(ca, cb) {
                Ok(())
            } else {
                Err(Signal::unification(a, b))
            }
        }
        (Value::Obj(oa), Value::Obj(ob)) => {
            if Arc::ptr_eq(oa, ob) {
                Ok(())
            } else {
                Err(Signal::unification(a, b))
            }
        }
        (Value::CompleteObj(oa), Value::CompleteObj(ob)) => {
            if Arc::ptr_eq(oa, ob) {
                Ok(())
            } else {
                Err(Signal::unification(a, b))
            }
        }
        (Value::Failed(fa), Value::Failed(fb)) => {
            if Arc::ptr_eq(fa, fb) {
                Ok(())
            } else {
                Err(Signal::unification(a, b))
            }
        }
        _ => Err(Signal::unification(a, b)),
    }
}

fn unify_values_proc_eq(a: &crate::value::ProcVal, b: &crate::value::ProcVal) -> bool {
    use crate::value::ProcVal;
    match (a, b) {
        (ProcVal::Closure(ca), ProcVal::Closure(cb)) => Arc::ptr_eq(ca, cb),
        (ProcVal::CompleteClosure(ca), ProcVal::CompleteClosure(cb)) => Arc::ptr_eq(ca, cb),
        (ProcVal::Native(na), ProcVal::Native(nb)) => na.same_proc(nb),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::value::Literal;

    #[test]
    fn bind_once_then_conflict() {
        let var = Var::new();
        var.bind_value(Literal::Int64(1).into()).unwrap();
        // Re-binding the same value is a unification no-op.
        var.bind_value(Literal::Int64(1).into()).unwrap();
        // A contradictory binding fails.
        assert!(var.bind_value(Literal::Int64(2).into()).is_err());
        match var.resolve_value_or_var() {
            ValueOrVar::Value(Value::Literal(Literal::Int64(1))) => {}
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn unify_unbound_vars_share_binding() {
        let a = Var::new();
        let b = Var::new();
        a.unify_var(&b).unwrap();
        b.bind_value(Literal::str("shared").into()).unwrap();
        match a.resolve_value_or_var() {
            ValueOrVar::Value(Value::Literal(l)) => assert_eq!(l, Literal::str("shared")),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn callbacks_fire_once_in_registration_order() {
        let var = Var::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let fired = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let order = order.clone();
            let fired = fired.clone();
            var.add_bind_callback(Box::new(move |_, _| {
                order.lock().unwrap().push(i);
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        var.bind_value(Literal::Int64(7).into()).unwrap();
        // A second no-op unification does not re-fire callbacks.
        var.bind_value(Literal::Int64(7).into()).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn merged_classes_concatenate_callbacks() {
        let a = Var::new();
        let b = Var::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let push = |tag: &'static str| {
            let order = order.clone();
            Box::new(move |_: &Var, _: &Value| order.lock().unwrap().push(tag))
        };
        a.add_bind_callback(push("a"));
        b.add_bind_callback(push("b"));
        a.unify_var(&b).unwrap();
        a.bind_value(Literal::Bool(true).into()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn callback_on_bound_var_fires_immediately() {
        let var = Var::bound(Literal::Int64(9).into());
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        var.add_bind_callback(Box::new(move |_, _| {
            observer.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unify_bound_with_unbound_fires_unbound_side() {
        let bound = Var::bound(Literal::Int64(5).into());
        let unbound = Var::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        unbound.add_bind_callback(Box::new(move |_, value| {
            assert!(matches!(value, Value::Literal(Literal::Int64(5))));
            observer.fetch_add(1, Ordering::SeqCst);
        }));
        unbound.unify_var(&bound).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
