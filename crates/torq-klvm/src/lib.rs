//! The kernel-language virtual machine (KLVM): a small instruction set over
//! dataflow variables, plus the actor-boundary types kernel values carry.
//!
//! A [`machine::Machine`] executes [`instr::Instr`] trees against chained
//! [`env::Env`] scopes. Every operand resolves through single-assignment
//! [`var::Var`] cells; an operation that needs an unbound cell suspends the
//! machine with a `Wait` carrying that cell as the barrier. Only the
//! [`value::Complete`] subset of values may cross actor boundaries.

pub mod actor;
pub mod env;
pub mod failed;
pub mod instr;
pub mod machine;
pub mod rec;
pub mod value;
pub mod var;

pub use actor::{
    ActPayload, ActorRef, ActorRefObj, Address, CompleteActorCfg, ControlMessage, Envelope,
    EnvelopeMessage, NativeActorCfg, RequestId, StreamRef,
};
pub use env::{Env, EnvEntry};
pub use failed::FailedValue;
pub use instr::{BinOp, Instr, Pat, ProcDef, SourceSpan};
pub use machine::{
    ComputeHalt, ComputeResult, ExecCtx, Machine, MachineHost, NativeError, Signal,
};
pub use rec::{
    CompleteRec, CompleteTuple, FeatureOrVar, LiteralOrVar, PartialField, PartialRec,
    PartialTuple, RecVal, TupleVal,
};
pub use value::{
    ActorCfg, Closure, Complete, CompleteClosure, CompleteObj, CompleteOrIdent, CompleteProcVal,
    Feature, Ident, Literal, LiteralOrIdent, NativeProc, Obj, ProcVal, Value,
};
pub use var::{BindCallback, ValueOrVar, Var};
