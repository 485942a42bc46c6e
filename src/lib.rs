//! The local actor runtime hosting the Torq kernel-language virtual
//! machine.
//!
//! Each actor owns a priority [`mailbox::Mailbox`], a kernel
//! [`torq_klvm::Machine`], and the lifecycle state driving them. Actor
//! turns run as tasks on the shared tokio runtime; an actor yields when its
//! instruction budget expires (resuming through a self-addressed control),
//! when it suspends on an unbound dataflow variable, or when its stack
//! empties. Failure converts to a [`torq_klvm::FailedValue`] that answers
//! the active request and every request queued behind it.
//!
//! Embedders spawn actors through [`system::ActorBuilder`] and talk to them
//! with [`client::RequestClient`] and [`client::StreamClient`].

pub mod client;
pub mod local_actor;
pub mod mailbox;
pub mod stream;
pub mod system;

pub use torq_klvm as klvm;

pub use client::{PendingResponse, PendingStream, RequestClient, StreamClient};
pub use local_actor::LocalActor;
pub use mailbox::Mailbox;
pub use stream::{IterCls, StreamCls, StreamObj};
pub use system::{ActorBuilder, ActorSystem, ActorSystemBuilder, DEFAULT_TIME_SLICE};
