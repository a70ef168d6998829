//! Engine thread.
//!
//! The engine lives on a dedicated OS thread with a single-threaded Tokio
//! runtime. Host jobs and loop events reach it through [`EngineCommand`] and
//! run sequentially on that thread, which owns the [`Env`]. Each command runs
//! inside its own handle scope.
//!
//! The loop ends on shutdown, or once every [`EngineHandle`](crate::EngineHandle)
//! is gone and no referenced threadsafe function remains.

use crate::runtime::config::EngineConfig;
use crate::runtime::error::BridgeError;
use crate::runtime::js_value::JsValue;
use crate::runtime::module::initialize_module;
use crate::runtime::sys::{Env, EventSink, LoopEvent};
use crate::runtime::threadsafe::BridgeRegistry;
use crate::runtime::values::{describe_exception, JsObject};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::Receiver as StdReceiver;
use std::sync::mpsc::Sender as StdSender;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

type InitSignalChannel = (
    StdSender<Result<(), BridgeError>>,
    StdReceiver<Result<(), BridgeError>>,
);

/// A host closure run on the engine thread. It delivers its own result.
pub type EngineJob = Box<dyn FnOnce(&Env) + Send>;

/// Commands sent to the engine thread.
pub enum EngineCommand {
    Run { job: EngineJob },
    /// Threadsafe-function dispatch or finalize, or async-work completion.
    Event(LoopEvent),
    Shutdown { responder: Sender<()> },
}

/// Posts loop events into the command channel.
///
/// Holds a weak sender: only handles and referenced threadsafe functions keep
/// the loop alive. The latter hold a strong sender in `keepalive`.
struct ChannelSink {
    tx: mpsc::WeakUnboundedSender<EngineCommand>,
    keepalive: Mutex<Option<mpsc::UnboundedSender<EngineCommand>>>,
}

impl ChannelSink {
    fn keepalive(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<EngineCommand>>> {
        match self.keepalive.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EventSink for ChannelSink {
    fn post(&self, event: LoopEvent) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(EngineCommand::Event(event)).is_ok(),
            None => false,
        }
    }

    fn keep_alive(&self, alive: bool) {
        let mut keepalive = self.keepalive();
        if !alive {
            if keepalive.take().is_some() {
                debug!("engine loop no longer held by threadsafe functions");
            }
        } else if keepalive.is_none() {
            *keepalive = self.tx.upgrade();
        }
    }
}

/// Run `job` on the engine thread, turning a panic into [`BridgeError::Fault`].
pub(crate) fn run_contained<R>(
    env: &Env,
    job: impl FnOnce(&Env) -> Result<R, BridgeError>,
) -> Result<R, BridgeError> {
    catch_unwind(AssertUnwindSafe(|| job(env))).unwrap_or_else(|payload| {
        let err = BridgeError::from_panic(payload);
        error!("engine job panicked: {}", err);
        Err(err)
    })
}

pub fn spawn_engine_thread(
    config: EngineConfig,
) -> Result<(mpsc::UnboundedSender<EngineCommand>, ThreadId), BridgeError> {
    config.validate()?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<EngineCommand>();
    let (init_tx, init_rx): InitSignalChannel = std::sync::mpsc::channel();
    let sink = Arc::new(ChannelSink {
        tx: cmd_tx.downgrade(),
        keepalive: Mutex::new(None),
    });

    let thread = std::thread::Builder::new()
        .name(config.thread_name.clone())
        .spawn(move || {
            let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(BridgeError::runtime(format!(
                        "failed to build tokio runtime: {}",
                        err
                    ))));
                    return;
                }
            };

            let mut core = match EngineCore::new(config, sink) {
                Ok(core) => {
                    let _ = init_tx.send(Ok(()));
                    core
                }
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };

            tokio_rt.block_on(async move {
                core.run(cmd_rx).await;
            });
        })
        .map_err(|e| BridgeError::runtime(format!("failed to spawn engine thread: {}", e)))?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok((cmd_tx, thread.thread().id())),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(BridgeError::runtime("engine thread initialization failed")),
    }
}

struct EngineCore {
    env: Env,
    registry: Arc<BridgeRegistry>,
}

impl EngineCore {
    fn new(config: EngineConfig, sink: Arc<dyn EventSink>) -> Result<Self, BridgeError> {
        let env = Env::new(config.to_env_options(), sink);
        let registry = BridgeRegistry::for_env(&env)?;

        let exports = JsObject::new(&env);
        JsObject::global(&env).set("exports", &exports.clone().into())?;
        let registered = match &config.module_registry {
            Some(modules) => modules.initialize(&env, &exports),
            None => initialize_module(&env, &exports),
        };
        if let Err(err) = registered {
            // Surfaced to the spawner instead of a script caller.
            env.get_and_clear_last_exception();
            return Err(err);
        }

        debug!("engine {} started on '{}'", env.id(), config.thread_name);
        Ok(Self { env, registry })
    }

    async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<EngineCommand>) {
        while let Some(cmd) = rx.recv().await {
            if self.handle(cmd) {
                break;
            }
        }
        debug!("engine {} stopped", self.env.id());
    }

    /// Run one command. Returns `true` on shutdown.
    fn handle(&self, cmd: EngineCommand) -> bool {
        let _scope = self.env.open_handle_scope();
        match cmd {
            EngineCommand::Run { job } => {
                let env = &self.env;
                if catch_unwind(AssertUnwindSafe(|| job(env))).is_err() {
                    error!("engine job panicked outside its fault boundary");
                }
            }
            EngineCommand::Event(event) => self.env.process_event(event),
            EngineCommand::Shutdown { responder } => {
                self.report_uncaught();
                self.warn_leaks();
                let _ = responder.send(());
                return true;
            }
        }
        self.report_uncaught();
        false
    }

    /// Exceptions still pending here have no script caller to receive them.
    fn report_uncaught(&self) {
        if let Some(raw) = self.env.report_uncaught() {
            match JsValue::new(&self.env, raw) {
                Ok(value) => error!("uncaught exception: {}", describe_exception(&value)),
                Err(err) => error!("uncaught exception (unreadable: {})", err),
            }
        }
    }

    fn warn_leaks(&self) {
        let (tsfns, works) = self.env.outstanding_resources();
        if tsfns > 0 {
            warn!(
                "{} threadsafe functions not released before shutdown: {:?}",
                tsfns,
                self.registry.unreleased()
            );
        }
        if works > 0 {
            warn!("{} async works not completed before shutdown", works);
        }
        let pending = self.registry.pending_calls();
        if pending > 0 {
            warn!("{} threadsafe calls dropped at shutdown", pending);
        }
    }
}
