//! Threadsafe call bridge: lets any thread schedule a host callback on the
//! engine thread, carrying a typed payload.
//!
//! Each [`ThreadsafeFunction::call`] parks its payload in the registry's
//! [`HandleTable`] and enqueues only the token. Once the enqueue succeeds the
//! token belongs to the engine thread: the dispatch trampoline takes the
//! payload out, frees the slot and runs the callback. A failed enqueue frees
//! the slot on the calling thread.

use crate::runtime::conversion::to_js;
use crate::runtime::error::BridgeError;
use crate::runtime::handles::{Handle, HandleTable};
use crate::runtime::host_fn::throw_bridge_error;
use crate::runtime::js_value::JsValue;
use crate::runtime::sys::{
    CallJsCallback, CallMode, Env, FinalizeCallback, RawValue, ReleaseMode,
    ThreadsafeFunctionHandle,
};
use crate::runtime::values::{JsError, JsFunction, JsHandle};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, warn};

/// Bridge-side state of one threadsafe function.
struct TsfnWrapper {
    resource_name: String,
    context: Option<Arc<dyn Any + Send + Sync>>,
}

/// One queued call: the wrapper it belongs to and the caller's data.
struct Payload {
    wrapper: Arc<TsfnWrapper>,
    data: Box<dyn Any + Send>,
}

/// Cross-thread state shared by every threadsafe function of one environment.
pub struct BridgeRegistry {
    wrappers: RwLock<HashMap<u64, Arc<TsfnWrapper>>>,
    registrations: HandleTable<Arc<TsfnWrapper>>,
    payloads: HandleTable<Payload>,
}

/// Bridge-data slot holding an environment's registry.
struct RegistrySlot(Arc<BridgeRegistry>);

impl BridgeRegistry {
    fn new() -> Self {
        Self {
            wrappers: RwLock::new(HashMap::new()),
            registrations: HandleTable::new(),
            payloads: HandleTable::new(),
        }
    }

    /// The registry attached to `env`, created on first use.
    ///
    /// It lives in a slot of its own, so user instance data is left alone.
    pub fn for_env(env: &Env) -> Result<Arc<BridgeRegistry>, BridgeError> {
        if let Some(data) = env.bridge_data() {
            return match data.downcast::<RegistrySlot>() {
                Ok(slot) => Ok(slot.0.clone()),
                Err(_) => Err(BridgeError::runtime("bridge slot holds a foreign value")),
            };
        }
        let registry = Arc::new(BridgeRegistry::new());
        env.set_bridge_data(Rc::new(RegistrySlot(registry.clone())));
        Ok(registry)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<u64, Arc<TsfnWrapper>>> {
        match self.wrappers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u64, Arc<TsfnWrapper>>> {
        match self.wrappers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether the native function `id` is registered and not yet released.
    pub fn is_registered(&self, id: u64) -> bool {
        self.read().contains_key(&id)
    }

    /// Resource names of functions that were never released.
    pub fn unreleased(&self) -> Vec<String> {
        self.read()
            .values()
            .map(|wrapper| wrapper.resource_name.clone())
            .collect()
    }

    /// Payloads enqueued but not yet dispatched.
    pub fn pending_calls(&self) -> usize {
        self.payloads.len()
    }
}

type Callback<T> = dyn Fn(&Env, Option<&JsFunction>, T) -> Result<(), BridgeError>;

/// Configures a [`ThreadsafeFunction`]. Obtained from [`ThreadsafeFunction::builder`].
pub struct ThreadsafeFunctionBuilder<T> {
    resource_name: String,
    js_function: Option<JsFunction>,
    max_queue_size: Option<usize>,
    initial_thread_count: usize,
    context: Option<Arc<dyn Any + Send + Sync>>,
    finalize: Option<Box<dyn FnOnce(&Env)>>,
    _payload: PhantomData<fn(T)>,
}

impl<T: Send + 'static> ThreadsafeFunctionBuilder<T> {
    /// Script function handed to the callback on every dispatch.
    pub fn js_function(mut self, function: JsFunction) -> Self {
        self.js_function = Some(function);
        self
    }

    /// Queue capacity; `0` is unbounded. Defaults to the environment's setting.
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    pub fn initial_thread_count(mut self, count: usize) -> Self {
        self.initial_thread_count = count;
        self
    }

    /// Data readable from any thread through [`ThreadsafeFunction::context`].
    pub fn context<C: Any + Send + Sync>(mut self, context: C) -> Self {
        self.context = Some(Arc::new(context));
        self
    }

    /// Runs on the engine thread once the function is released and drained.
    pub fn finalize<F>(mut self, finalize: F) -> Self
    where
        F: FnOnce(&Env) + 'static,
    {
        self.finalize = Some(Box::new(finalize));
        self
    }

    /// Create the function with `callback` as its dispatch target.
    pub fn build<F>(self, env: &Env, callback: F) -> Result<ThreadsafeFunction<T>, BridgeError>
    where
        F: Fn(&Env, Option<&JsFunction>, T) -> Result<(), BridgeError> + 'static,
    {
        self.create(env, Rc::new(callback))
    }

    fn create(
        self,
        env: &Env,
        callback: Rc<Callback<T>>,
    ) -> Result<ThreadsafeFunction<T>, BridgeError> {
        if self.initial_thread_count < 1 {
            return Err(BridgeError::runtime(
                "initial thread count must be at least 1",
            ));
        }
        let registry = BridgeRegistry::for_env(env)?;
        let max_queue_size = self
            .max_queue_size
            .unwrap_or(env.options().default_max_queue_size);

        let trampoline: CallJsCallback = {
            let registry = registry.clone();
            Box::new(move |env: Option<&Env>, js_func: Option<RawValue>, _context: u64, data: u64| {
                dispatch(&registry, &*callback, env, js_func, data)
            })
        };
        let teardown: FinalizeCallback = {
            let registry = registry.clone();
            let user_finalize = self.finalize;
            Box::new(move |env: &Env, registration: u64, _context: u64| {
                finalize(&registry, env, registration, user_finalize)
            })
        };

        let wrapper = Arc::new(TsfnWrapper {
            resource_name: self.resource_name,
            context: self.context,
        });
        let registration = registry.registrations.insert(wrapper.clone());
        let token = registration.to_token();
        let native = match env.create_threadsafe_function(
            self.js_function.as_ref().map(|function| function.raw()),
            &wrapper.resource_name,
            max_queue_size,
            self.initial_thread_count,
            token,
            Some(teardown),
            token,
            Some(trampoline),
        ) {
            Ok(native) => native,
            Err(status) => {
                registry.registrations.take(registration);
                return Err(status.into());
            }
        };

        registry.write().insert(native.id(), wrapper.clone());
        debug!(
            tsfn = native.id(),
            resource = %wrapper.resource_name,
            "registered threadsafe function"
        );
        Ok(ThreadsafeFunction {
            native,
            wrapper,
            registry,
            _payload: PhantomData,
        })
    }
}

impl<T: Serialize + Send + 'static> ThreadsafeFunctionBuilder<T> {
    /// Create the function with the default dispatch: convert the payload and
    /// call the script function with it. A payload that fails to convert is
    /// passed as an Error object instead.
    pub fn build_default(self, env: &Env) -> Result<ThreadsafeFunction<T>, BridgeError> {
        if self.js_function.is_none() {
            return Err(BridgeError::runtime(
                "default dispatch needs a script function",
            ));
        }
        self.create(env, Rc::new(default_callback::<T>))
    }
}

fn default_callback<T: Serialize>(
    env: &Env,
    js_function: Option<&JsFunction>,
    data: T,
) -> Result<(), BridgeError> {
    let Some(js_function) = js_function else {
        warn!("default threadsafe dispatch without a script function");
        return Ok(());
    };
    let argument = match to_js(env, &data) {
        Ok(value) => value,
        Err(err) => {
            warn!("threadsafe payload conversion failed: {}", err);
            let message = format!("failed to convert threadsafe payload: {}", err);
            JsValue::from(JsError::new(env, err.code(), &message)?)
        }
    };
    js_function.call(&[argument])?;
    Ok(())
}

fn dispatch<T: 'static>(
    registry: &BridgeRegistry,
    callback: &Callback<T>,
    env: Option<&Env>,
    js_func: Option<RawValue>,
    data: u64,
) {
    let Some(Payload { wrapper, data }) = registry.payloads.take(Handle::from_token(data)) else {
        warn!(token = data, "threadsafe dispatch with an unknown payload handle");
        return;
    };
    let Some(env) = env else {
        debug!(
            resource = %wrapper.resource_name,
            "dropping payload of aborted threadsafe function"
        );
        return;
    };
    let data = match data.downcast::<T>() {
        Ok(data) => *data,
        Err(_) => {
            error!(resource = %wrapper.resource_name, "threadsafe payload has the wrong type");
            return;
        }
    };
    let js_function =
        js_func.map(|raw| JsFunction::from_value_unchecked(JsValue::from_raw(env, raw)));

    let outcome = catch_unwind(AssertUnwindSafe(|| callback(env, js_function.as_ref(), data)))
        .unwrap_or_else(|payload| Err(BridgeError::from_panic(payload)));
    if let Err(err) = outcome {
        error!(
            resource = %wrapper.resource_name,
            "threadsafe function callback failed: {}", err
        );
        throw_bridge_error(env, &err);
    }
}

fn finalize(
    registry: &BridgeRegistry,
    env: &Env,
    registration: u64,
    user_finalize: Option<Box<dyn FnOnce(&Env)>>,
) {
    if let Some(wrapper) = registry.registrations.take(Handle::from_token(registration)) {
        // Dropped here when the function closed without a bridge-side release.
        registry
            .write()
            .retain(|_, registered| !Arc::ptr_eq(registered, &wrapper));
        debug!(resource = %wrapper.resource_name, "finalized threadsafe function");
    }
    let Some(user_finalize) = user_finalize else {
        return;
    };
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| user_finalize(env))) {
        let err = BridgeError::from_panic(payload);
        error!("threadsafe function finalizer failed: {}", err);
        throw_bridge_error(env, &err);
    }
}

/// A function any thread can call to run a host callback on the engine
/// thread with a payload of type `T`.
///
/// Cloning shares the same native function; thread references are managed
/// explicitly with [`acquire`](Self::acquire) and [`release`](Self::release).
pub struct ThreadsafeFunction<T> {
    native: ThreadsafeFunctionHandle,
    wrapper: Arc<TsfnWrapper>,
    registry: Arc<BridgeRegistry>,
    _payload: PhantomData<fn(T)>,
}

impl<T> Clone for ThreadsafeFunction<T> {
    fn clone(&self) -> Self {
        Self {
            native: self.native.clone(),
            wrapper: self.wrapper.clone(),
            registry: self.registry.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ThreadsafeFunction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadsafeFunction")
            .field("id", &self.native.id())
            .field("resource_name", &self.wrapper.resource_name)
            .finish()
    }
}

impl<T: Send + 'static> ThreadsafeFunction<T> {
    pub fn builder(resource_name: impl Into<String>) -> ThreadsafeFunctionBuilder<T> {
        ThreadsafeFunctionBuilder {
            resource_name: resource_name.into(),
            js_function: None,
            max_queue_size: None,
            initial_thread_count: 1,
            context: None,
            finalize: None,
            _payload: PhantomData,
        }
    }

    /// Shorthand for a function that calls `js_function` with each converted payload.
    pub fn with_default_callback(
        env: &Env,
        js_function: JsFunction,
        resource_name: impl Into<String>,
    ) -> Result<Self, BridgeError>
    where
        T: Serialize,
    {
        Self::builder(resource_name)
            .js_function(js_function)
            .build_default(env)
    }

    pub fn id(&self) -> u64 {
        self.native.id()
    }

    /// Enqueue `data` for the callback. Calls from one thread are dispatched
    /// in the order they were made.
    pub fn call(&self, data: T, mode: CallMode) -> Result<(), BridgeError> {
        let handle = self.registry.payloads.insert(Payload {
            wrapper: self.wrapper.clone(),
            data: Box::new(data),
        });
        match self.native.call(handle.to_token(), mode) {
            // The engine thread owns the payload from here on.
            Ok(()) => Ok(()),
            Err(status) => {
                self.registry.payloads.take(handle);
                Err(status.into())
            }
        }
    }

    pub fn acquire(&self) -> Result<(), BridgeError> {
        Ok(self.native.acquire()?)
    }

    /// Give up one thread reference.
    ///
    /// The registration is dropped once the last reference is gone or the
    /// function was aborted. The finalizer drops it too if it runs first.
    pub fn release(&self, mode: ReleaseMode) -> Result<(), BridgeError> {
        let id = self.native.id();
        match self.native.release(mode) {
            Ok(()) => {
                if self.native.is_closing() {
                    self.registry.write().remove(&id);
                }
                debug!(tsfn = id, ?mode, "released threadsafe function");
                Ok(())
            }
            Err(status) => {
                warn!(tsfn = id, "failed to release threadsafe function: {}", status);
                Err(status.into())
            }
        }
    }

    /// Keep the engine loop alive while this function exists. Engine thread only.
    pub fn ref_(&self, env: &Env) -> Result<(), BridgeError> {
        Ok(env.ref_threadsafe_function(&self.native)?)
    }

    /// Let the engine loop exit while this function still exists. Engine thread only.
    pub fn unref(&self, env: &Env) -> Result<(), BridgeError> {
        Ok(env.unref_threadsafe_function(&self.native)?)
    }

    /// The context given at build time, if it has type `C`.
    pub fn context<C: Any + Send + Sync>(&self) -> Option<&C> {
        self.wrapper.context.as_deref()?.downcast_ref::<C>()
    }
}
