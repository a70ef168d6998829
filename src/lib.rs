//! Bridge between host Rust code and an embedded JavaScript engine.
//!
//! The most common entry points are re-exported here: [`to_js`] and
//! [`from_js`] for marshaling, [`HostFunction`] for exposing host code,
//! [`ThreadsafeFunction`] for calling into the engine from other threads,
//! [`AsyncWorker`] for promise-returning background work, and
//! [`EngineHandle`] for running an engine on its own thread.

pub mod runtime;

pub use runtime::async_worker::{AsyncWorker, CancelToken, Settle};
pub use runtime::config::EngineConfig;
pub use runtime::conversion::{from_js, from_js_into, omit, to_js, Date};
pub use runtime::error::{ArityError, BridgeError, ConversionError};
pub use runtime::handle::EngineHandle;
pub use runtime::host_fn::{optional_function, wrap_optional, CallContext, HostFunction};
pub use runtime::js_value::{AnyValue, JsValue, ValueKind};
pub use runtime::module::{global_registry, initialize_module, ModuleRegistry};
pub use runtime::sys::{CallMode, Env, ReleaseMode};
pub use runtime::threadsafe::{ThreadsafeFunction, ThreadsafeFunctionBuilder};
pub use runtime::values::{
    JsArray, JsArrayBuffer, JsBigInt, JsBoolean, JsBuffer, JsDataView, JsDate, JsDeferred,
    JsError, JsExternal, JsFunction, JsHandle, JsNumber, JsObject, JsPromise, JsString,
    JsSymbol, JsTypedArray, PromiseOutcome,
};
