use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::env::EnvEntry;
use crate::instr::Instr;
use crate::machine::{resolve_value_or_var, NativeError, Signal};
use crate::value::{Complete, CompleteClosure, Feature, Ident, NativeProc};
use crate::var::{ValueOrVar, Var};

/// A hierarchical actor address: children extend the parent path with their
/// spawn ordinal.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address(Arc<str>);

impl Address {
    pub fn new(path: &str) -> Address {
        Address(Arc::from(path))
    }

    pub fn child(&self, ordinal: u32) -> Address {
        Address(Arc::from(format!("{}/{}", self.0, ordinal).as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A handle to an actor: the only cross-actor operation is an atomic
/// envelope enqueue.
pub trait ActorRef: fmt::Debug + Send + Sync {
    fn address(&self) -> &Address;

    fn send(&self, envelope: Envelope);
}

/// The kernel-value wrapper around an actor handle, carrying the `ask` and
/// `tell` features.
#[derive(Clone, Debug)]
pub struct ActorRefObj {
    referent: Arc<dyn ActorRef>,
}

impl ActorRefObj {
    pub fn new(referent: Arc<dyn ActorRef>) -> ActorRefObj {
        ActorRefObj { referent }
    }

    pub fn referent(&self) -> &Arc<dyn ActorRef> {
        &self.referent
    }

    pub fn same_referent(&self, other: &ActorRefObj) -> bool {
        Arc::ptr_eq(&self.referent, &other.referent)
    }

    pub fn select(&self, feature: &Feature) -> Result<Complete, Signal> {
        match feature {
            Feature::Str(name) if &**name == "ask" => Ok(Complete::Proc(
                crate::value::CompleteProcVal::Native(self.ask_proc()),
            )),
            Feature::Str(name) if &**name == "tell" => Ok(Complete::Proc(
                crate::value::CompleteProcVal::Native(self.tell_proc()),
            )),
            _ => Err(Signal::Native(NativeError::feature_not_found(
                feature,
                "an actor ref",
            ))),
        }
    }

    /// `ask(message, target)`: send a request whose response binds `target`.
    fn ask_proc(&self) -> NativeProc {
        let referent = self.referent.clone();
        NativeProc::new("ActorRef.ask", move |ctx, args, env| {
            if args.len() != 2 {
                return Err(Signal::Native(NativeError::invalid_arg_count(
                    2,
                    args.len(),
                    "ActorRef.ask",
                )));
            }
            let target = resolve_value_or_var(&args[1], env)?;
            let message = resolve_value_or_var(&args[0], env)?.check_complete()?;
            let requester = ctx.host.self_actor().ok_or_else(|| {
                Signal::Native(NativeError::internal("asking actor is gone"))
            })?;
            referent.send(Envelope::request(
                message,
                requester,
                RequestId::VarRef(target),
            ));
            Ok(())
        })
    }

    /// `tell(message)`: send a one-way notify.
    fn tell_proc(&self) -> NativeProc {
        let referent = self.referent.clone();
        NativeProc::new("ActorRef.tell", move |_ctx, args, env| {
            if args.len() != 1 {
                return Err(Signal::Native(NativeError::invalid_arg_count(
                    1,
                    args.len(),
                    "ActorRef.tell",
                )));
            }
            let message = resolve_value_or_var(&args[0], env)?.check_complete()?;
            referent.send(Envelope::notify(message));
            Ok(())
        })
    }
}

/// A configuration for spawning a native (runtime-implemented) actor.
pub trait NativeActorCfg: fmt::Debug + Send + Sync {
    fn spawn(&self, address: Address) -> Arc<dyn ActorRef>;
}

/// An actor configuration whose captures have been verified complete; the
/// only configuration shape that crosses the spawn boundary.
#[derive(Debug)]
pub struct CompleteActorCfg {
    pub args: Vec<Complete>,
    pub handler_ctor: Arc<CompleteClosure>,
}

/// The opaque token a requester attaches to a request. The responder echoes
/// it verbatim; only the requester interprets it.
#[derive(Clone, Debug)]
pub enum RequestId {
    /// External clients correlate by channel, not by id.
    Nothing,
    /// A unary response binds directly into the requester's target.
    VarRef(ValueOrVar),
    /// A streaming response feeds the requester's stream object.
    Stream(StreamRef),
}

/// An opaque handle to the requester's stream object; only the requester
/// downcasts it.
#[derive(Clone)]
pub struct StreamRef(pub Arc<dyn Any + Send + Sync>);

impl fmt::Debug for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<stream ref>")
    }
}

/// The messages that drive the actor lifecycle, delivered at control
/// priority.
#[derive(Clone, Debug)]
pub enum ControlMessage {
    /// Re-enter `compute` after a preemption.
    Resume,
    /// First-time handler installation.
    Configure(Arc<CompleteActorCfg>),
    /// Cooperative termination.
    Stop,
    /// A child computation spawned by `act`.
    Act(Arc<ActPayload>),
    /// Bind a child-side var with a value propagated from the parent.
    SyncVar { var: Var, value: Complete },
}

/// The payload of an `act` control request: the child's computation, its
/// response target, and the captured free-variable bindings.
#[derive(Debug)]
pub struct ActPayload {
    pub seq: Arc<Instr>,
    pub target: Ident,
    pub input: Vec<EnvEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    ControlNotify,
    ControlRequest,
    ControlResponse,
    Notify,
    Request,
    Response,
}

#[derive(Clone, Debug)]
pub enum EnvelopeMessage {
    Value(Complete),
    Control(ControlMessage),
}

/// A message together with its sender, request id, and kind flags.
#[derive(Clone, Debug)]
pub struct Envelope {
    kind: Kind,
    message: EnvelopeMessage,
    requester: Option<Arc<dyn ActorRef>>,
    request_id: RequestId,
}

impl Envelope {
    pub fn notify(message: Complete) -> Envelope {
        Envelope {
            kind: Kind::Notify,
            message: EnvelopeMessage::Value(message),
            requester: None,
            request_id: RequestId::Nothing,
        }
    }

    pub fn request(
        message: Complete,
        requester: Arc<dyn ActorRef>,
        request_id: RequestId,
    ) -> Envelope {
        Envelope {
            kind: Kind::Request,
            message: EnvelopeMessage::Value(message),
            requester: Some(requester),
            request_id,
        }
    }

    pub fn response(message: Complete, request_id: RequestId) -> Envelope {
        Envelope {
            kind: Kind::Response,
            message: EnvelopeMessage::Value(message),
            requester: None,
            request_id,
        }
    }

    pub fn control_notify(message: ControlMessage) -> Envelope {
        Envelope {
            kind: Kind::ControlNotify,
            message: EnvelopeMessage::Control(message),
            requester: None,
            request_id: RequestId::Nothing,
        }
    }

    pub fn control_request(
        message: ControlMessage,
        requester: Arc<dyn ActorRef>,
        request_id: RequestId,
    ) -> Envelope {
        Envelope {
            kind: Kind::ControlRequest,
            message: EnvelopeMessage::Control(message),
            requester: Some(requester),
            request_id,
        }
    }

    pub fn control_response(message: ControlMessage, request_id: RequestId) -> Envelope {
        Envelope {
            kind: Kind::ControlResponse,
            message: EnvelopeMessage::Control(message),
            requester: None,
            request_id,
        }
    }

    /// Control 0, response 1, notify/request 2. Lower runs first.
    pub fn priority(&self) -> u8 {
        match self.kind {
            Kind::ControlNotify | Kind::ControlRequest | Kind::ControlResponse => 0,
            Kind::Response => 1,
            Kind::Notify | Kind::Request => 2,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self.kind,
            Kind::ControlNotify | Kind::ControlRequest | Kind::ControlResponse
        )
    }

    pub fn is_response(&self) -> bool {
        matches!(self.kind, Kind::Response | Kind::ControlResponse)
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, Kind::Request | Kind::ControlRequest)
    }

    pub fn is_notify(&self) -> bool {
        matches!(self.kind, Kind::Notify | Kind::ControlNotify)
    }

    pub fn message(&self) -> &EnvelopeMessage {
        &self.message
    }

    /// The message payload of a non-control envelope.
    pub fn value(&self) -> Option<&Complete> {
        match &self.message {
            EnvelopeMessage::Value(value) => Some(value),
            EnvelopeMessage::Control(_) => None,
        }
    }

    pub fn requester(&self) -> Option<&Arc<dyn ActorRef>> {
        self.requester.as_ref()
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }
}

