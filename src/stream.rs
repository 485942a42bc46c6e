use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::info;
use torq_klvm::machine::{resolve_for_op, resolve_value_or_var};
use torq_klvm::{
    ActorRef, ActorRefObj, Complete, CompleteObj, Envelope, Feature, Literal, NativeError,
    NativeProc, Obj, RequestId, Signal, StreamRef, Value, ValueOrVar, Var,
};

/// A lazy stream: a linked run of elements fed by publisher responses, with
/// an unbound tail. The embedded iterator advertises the consumer's hole
/// into the tail (reverse dataflow) and suspends on it until a response
/// binds it.
#[derive(Debug)]
pub struct StreamObj {
    publisher: ActorRefObj,
    request: Complete,
    owner: Arc<dyn ActorRef>,
    trace: bool,
    inner: Mutex<StreamState>,
}

#[derive(Debug)]
struct StreamState {
    /// Front is the iteration head; back is the unbound tail except after
    /// the terminal `eof` binding.
    entries: VecDeque<ValueOrVar>,
    waiting: bool,
}

impl StreamObj {
    pub fn new(
        publisher: ActorRefObj,
        request: Complete,
        owner: Arc<dyn ActorRef>,
        trace: bool,
    ) -> Arc<StreamObj> {
        let stream = Arc::new(StreamObj {
            publisher,
            request,
            owner,
            trace,
            inner: Mutex::new(StreamState {
                entries: VecDeque::from([ValueOrVar::Var(Var::new())]),
                waiting: false,
            }),
        });
        stream.fetch_next_from_publisher();
        stream
    }

    pub fn fetch_next_from_publisher(self: &Arc<Self>) {
        if self.trace {
            info!(
                "[{}] stream requesting {} from {}",
                self.owner.address(),
                self.request,
                self.publisher.referent().address()
            );
        }
        self.publisher.referent().send(Envelope::request(
            self.request.clone(),
            self.owner.clone(),
            RequestId::Stream(StreamRef(self.clone())),
        ));
    }

    fn tail_var(&self, state: &StreamState) -> Result<Var, Signal> {
        match state.entries.back() {
            Some(ValueOrVar::Var(var)) => Ok(var.clone()),
            _ => Err(Signal::Native(NativeError::internal(
                "stream tail is already terminated",
            ))),
        }
    }

    /// Feed one publisher response into the stream. Called by the owning
    /// actor's response pipeline.
    pub fn on_response(self: &Arc<Self>, message: &Complete) -> Result<(), Signal> {
        match message {
            Complete::Failed(failed) => {
                let mut state = self.inner.lock().expect("stream lock");
                let tail = self.tail_var(&state)?;
                tail.bind_value(Value::Failed(failed.clone()))?;
                state.entries.push_back(ValueOrVar::Var(Var::new()));
                Ok(())
            }
            // An empty batch is a legal no-op.
            Complete::Tuple(tuple) if tuple.is_empty() => Ok(()),
            Complete::Rec(rec) if rec.field_count() == 0 => Ok(()),
            Complete::Rec(rec) if rec.label().is_eof() => {
                let more = match rec.find_value(&Feature::str("more")) {
                    Some(Complete::Literal(Literal::Bool(more))) => *more,
                    _ => {
                        return Err(Signal::Native(NativeError::type_error(
                            "an eof response requires a bool 'more' feature",
                        )))
                    }
                };
                if more {
                    self.fetch_next_from_publisher();
                } else {
                    if self.trace {
                        info!("[{}] stream binding terminal eof", self.owner.address());
                    }
                    let state = self.inner.lock().expect("stream lock");
                    let tail = self.tail_var(&state)?;
                    tail.bind_value(Literal::Eof.into())?;
                }
                Ok(())
            }
            Complete::Tuple(tuple) => {
                let mut state = self.inner.lock().expect("stream lock");
                let tail = self.tail_var(&state)?;
                let mut values = tuple.values();
                let first = values.next().expect("non-empty batch");
                tail.bind_value(first.clone().into())?;
                for value in values {
                    state
                        .entries
                        .push_back(ValueOrVar::Value(value.clone().into()));
                }
                state.entries.push_back(ValueOrVar::Var(Var::new()));
                Ok(())
            }
            other => Err(Signal::Native(NativeError::type_error(&format!(
                "not a stream response: {other}"
            )))),
        }
    }

    /// The iteration procedure: `iter(target)` binds the next element into
    /// `target`, advertising the target as the tail's hole when no element
    /// is available yet.
    pub fn iter_proc(self: &Arc<Self>) -> NativeProc {
        let stream = self.clone();
        NativeProc::new("Stream.iter", move |_ctx, args, env| {
            if args.len() != 1 {
                return Err(Signal::Native(NativeError::invalid_arg_count(
                    1,
                    args.len(),
                    "Stream.iter",
                )));
            }
            let target = resolve_value_or_var(&args[0], env)?;
            let mut state = stream.inner.lock().expect("stream lock");
            if state.waiting {
                let head = head_of(&state)?;
                match resolve_entry(&head) {
                    ValueOrVar::Var(unbound) => return Err(Signal::Wait(unbound)),
                    ValueOrVar::Value(value) => {
                        state.waiting = false;
                        if !is_eof(&value) {
                            state.entries.pop_front();
                        }
                    }
                }
            }
            let head = head_of(&state)?;
            match resolve_entry(&head) {
                ValueOrVar::Var(hole) => {
                    // Reverse dataflow: the consumer's target becomes the
                    // tail's hole, bound by a later response.
                    hole.bind_value_or_var(&target)?;
                    state.waiting = true;
                    Ok(())
                }
                ValueOrVar::Value(value) => {
                    target.bind_value(value.clone())?;
                    if !is_eof(&value) {
                        state.entries.pop_front();
                    }
                    Ok(())
                }
            }
        })
    }
}

fn head_of(state: &StreamState) -> Result<ValueOrVar, Signal> {
    state
        .entries
        .front()
        .cloned()
        .ok_or_else(|| Signal::Native(NativeError::internal("stream head is gone")))
}

fn resolve_entry(entry: &ValueOrVar) -> ValueOrVar {
    match entry {
        ValueOrVar::Value(value) => ValueOrVar::Value(value.clone()),
        ValueOrVar::Var(var) => var.resolve_value_or_var(),
    }
}

fn is_eof(value: &Value) -> bool {
    matches!(value, Value::Literal(Literal::Eof))
}

impl Obj for StreamObj {
    fn select(&self, feature: &Feature) -> Result<ValueOrVar, Signal> {
        Err(Signal::Native(NativeError::not_implemented(&format!(
            "selecting feature {feature} from a stream"
        ))))
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The `Stream` class exposed by the `system` module.
#[derive(Debug)]
pub struct StreamCls;

impl StreamCls {
    /// `Stream.new(publisher, request, target)`.
    fn new_proc() -> NativeProc {
        NativeProc::new("Stream.new", |ctx, args, env| {
            if args.len() != 3 {
                return Err(Signal::Native(NativeError::invalid_arg_count(
                    3,
                    args.len(),
                    "Stream.new",
                )));
            }
            let publisher = match resolve_for_op(&args[0], env)? {
                Value::ActorRef(publisher) => publisher,
                other => {
                    return Err(Signal::Native(NativeError::type_error(&format!(
                        "not an actor ref: {other}"
                    ))))
                }
            };
            let request = resolve_value_or_var(&args[1], env)?.check_complete()?;
            let target = resolve_value_or_var(&args[2], env)?;
            let owner = ctx
                .host
                .self_actor()
                .ok_or_else(|| Signal::Native(NativeError::internal("stream owner is gone")))?;
            let stream = StreamObj::new(publisher, request, owner, ctx.host.trace());
            target.bind_value(Value::Obj(stream))?;
            Ok(())
        })
    }
}

impl CompleteObj for StreamCls {
    fn select(&self, feature: &Feature) -> Result<Complete, Signal> {
        match feature {
            Feature::Str(name) if &**name == "new" => Ok(Complete::Proc(
                torq_klvm::CompleteProcVal::Native(StreamCls::new_proc()),
            )),
            _ => Err(Signal::Native(NativeError::feature_not_found(
                feature,
                "Stream",
            ))),
        }
    }
}

/// The `Iter` class exposed by the `system` module: `Iter.new(source,
/// target)` binds `target` to the source's iteration procedure.
#[derive(Debug)]
pub struct IterCls;

impl IterCls {
    fn new_proc() -> NativeProc {
        NativeProc::new("Iter.new", |_ctx, args, env| {
            if args.len() != 2 {
                return Err(Signal::Native(NativeError::invalid_arg_count(
                    2,
                    args.len(),
                    "Iter.new",
                )));
            }
            let source = resolve_for_op(&args[0], env)?;
            let target = resolve_value_or_var(&args[1], env)?;
            let stream = match &source {
                Value::Obj(obj) => obj.clone().as_any_arc().downcast::<StreamObj>().ok(),
                _ => None,
            };
            match stream {
                Some(stream) => {
                    target.bind_value(Value::Proc(torq_klvm::ProcVal::Native(
                        stream.iter_proc(),
                    )))?;
                    Ok(())
                }
                None => Err(Signal::Native(NativeError::type_error(&format!(
                    "not an iterable source: {source}"
                )))),
            }
        })
    }
}

impl CompleteObj for IterCls {
    fn select(&self, feature: &Feature) -> Result<Complete, Signal> {
        match feature {
            Feature::Str(name) if &**name == "new" => Ok(Complete::Proc(
                torq_klvm::CompleteProcVal::Native(IterCls::new_proc()),
            )),
            _ => Err(Signal::Native(NativeError::feature_not_found(
                feature, "Iter",
            ))),
        }
    }
}
