use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use tokio::runtime::Handle;

use torq_klvm::{
    ActorCfg, ActorRef, ActorRefObj, Address, Complete, CompleteActorCfg, CompleteProcVal,
    CompleteRec, ControlMessage, Envelope, Feature, Literal, NativeActorCfg,
};

use crate::local_actor::{complete_handler_ctor, respond_from_proc_native, LocalActor};
use crate::stream::{IterCls, StreamCls};

/// The default instruction budget for one compute slice.
pub const DEFAULT_TIME_SLICE: u64 = 10_000;

static NEXT_ANONYMOUS_ACTOR: AtomicU64 = AtomicU64::new(1);

/// A per-process actor system: the module registry, the executor handle,
/// and the instruction-budget configuration shared by its actors.
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

struct SystemInner {
    modules: DashMap<String, Arc<CompleteRec>>,
    system_module: Arc<CompleteRec>,
    handle: Handle,
    time_slice: u64,
}

impl ActorSystem {
    pub fn builder() -> ActorSystemBuilder {
        ActorSystemBuilder {
            modules: Vec::new(),
            time_slice: DEFAULT_TIME_SLICE,
            default_modules: false,
        }
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub(crate) fn time_slice(&self) -> u64 {
        self.inner.time_slice
    }

    /// The built-in `system` module: `respond` (free-procedure variant),
    /// `Stream`, and `Iter`.
    pub fn system_module(&self) -> Arc<CompleteRec> {
        self.inner.system_module.clone()
    }

    pub fn module_at(&self, qualifier: &str) -> Option<Arc<CompleteRec>> {
        self.inner
            .modules
            .get(qualifier)
            .map(|module| module.clone())
    }

    pub fn add_module(&self, qualifier: &str, module: Arc<CompleteRec>) {
        self.inner.modules.insert(qualifier.to_string(), module);
    }
}

pub struct ActorSystemBuilder {
    modules: Vec<(String, Arc<CompleteRec>)>,
    time_slice: u64,
    default_modules: bool,
}

impl ActorSystemBuilder {
    pub fn add_default_modules(mut self) -> Self {
        self.default_modules = true;
        self
    }

    pub fn add_module(mut self, qualifier: &str, module: Arc<CompleteRec>) -> Self {
        self.modules.push((qualifier.to_string(), module));
        self
    }

    /// Override the per-slice instruction budget.
    pub fn set_time_slice(mut self, time_slice: u64) -> Self {
        self.time_slice = time_slice;
        self
    }

    /// Build the system against the current tokio runtime.
    pub fn build(self) -> Result<ActorSystem> {
        let handle =
            Handle::try_current().context("an actor system must be built inside a tokio runtime")?;
        let system_module = build_system_module();
        let modules = DashMap::new();
        if self.default_modules {
            modules.insert("system".to_string(), system_module.clone());
        }
        for (qualifier, module) in self.modules {
            modules.insert(qualifier, module);
        }
        Ok(ActorSystem {
            inner: Arc::new(SystemInner {
                modules,
                system_module,
                handle,
                time_slice: self.time_slice,
            }),
        })
    }
}

fn build_system_module() -> Arc<CompleteRec> {
    Arc::new(
        CompleteRec::build(
            Literal::str("system"),
            vec![
                (Feature::str("Iter"), Complete::Obj(Arc::new(IterCls))),
                (Feature::str("Stream"), Complete::Obj(Arc::new(StreamCls))),
                (
                    Feature::str("respond"),
                    Complete::Proc(CompleteProcVal::Native(respond_from_proc_native())),
                ),
            ],
        )
        .expect("system module features are distinct"),
    )
}

/// Spawns top-level actors into a system.
#[derive(Default)]
pub struct ActorBuilder {
    system: Option<ActorSystem>,
    address: Option<Address>,
    trace: bool,
}

impl ActorBuilder {
    pub fn new() -> ActorBuilder {
        ActorBuilder::default()
    }

    pub fn set_system(mut self, system: ActorSystem) -> Self {
        self.system = Some(system);
        self
    }

    pub fn set_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    /// Promote this actor's lifecycle logging to info level.
    pub fn set_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Spawn an actor from a configuration and send its `Configure`
    /// control. The configuration's captures must already be complete; a
    /// top-level spawn has no machine to suspend.
    pub fn spawn(self, cfg: ActorCfg) -> Result<ActorRefObj> {
        let system = self
            .system
            .context("an actor system is required to spawn")?;
        let address = self.address.unwrap_or_else(next_anonymous_address);
        let handler_ctor = complete_handler_ctor(&cfg.handler_ctor)
            .map_err(|signal| anyhow!("configuration is not complete: {signal:?}"))?;
        let actor = LocalActor::new(address, system, self.trace);
        actor.send(Envelope::control_notify(ControlMessage::Configure(
            Arc::new(CompleteActorCfg {
                args: cfg.args,
                handler_ctor,
            }),
        )));
        Ok(ActorRefObj::new(actor))
    }

    /// Spawn a runtime-implemented actor from a native configuration.
    pub fn spawn_native(self, cfg: &dyn NativeActorCfg) -> Result<ActorRefObj> {
        let address = self.address.unwrap_or_else(next_anonymous_address);
        Ok(ActorRefObj::new(cfg.spawn(address)))
    }
}

fn next_anonymous_address() -> Address {
    Address::new(&format!(
        "actor-{}",
        NEXT_ANONYMOUS_ACTOR.fetch_add(1, Ordering::Relaxed)
    ))
}
