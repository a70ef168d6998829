//! In-process implementation of the native embedding interface.
//!
//! Every call mirrors one N-API primitive and reports failure through
//! [`Status`]. The bridge layers above only ever talk to the engine through
//! this module.

mod async_work;
mod env;
mod heap;
mod status;
mod threadsafe;

pub use async_work::{AsyncWork, CompleteCallback, ExecuteCallback};
pub use env::{Deferred, Env, EnvOptions, HandleScope, Reference};
pub use heap::{CallbackInfo, NativeCallback, PromiseState, RawValue, TypedArrayType, ValueType};
pub use status::{Status, StatusError, SysResult};
pub use threadsafe::{
    CallJsCallback, CallMode, FinalizeCallback, ReleaseMode, ThreadsafeFunctionHandle,
};

/// Work the engine loop must run on the engine thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// Deliver one threadsafe-function call.
    Dispatch { tsfn: u64, data: u64 },
    /// Tear down a threadsafe function whose queue has drained.
    Finalize { tsfn: u64 },
    /// Report the outcome of async work.
    Complete { work: u64, status: Status },
}

/// Where the engine posts [`LoopEvent`]s. Implemented by the engine loop.
///
/// `post` returns `false` once the loop no longer accepts events.
pub trait EventSink: Send + Sync {
    fn post(&self, event: LoopEvent) -> bool;

    /// Told whether a referenced threadsafe function exists. While `alive`
    /// the loop should keep running even with no other work.
    fn keep_alive(&self, _alive: bool) {}
}

#[cfg(test)]
pub(crate) use env::tests::{test_env, QueueSink};
