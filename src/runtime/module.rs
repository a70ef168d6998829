//! Module registration: the callbacks that populate a module's exports.
//!
//! The embedding runtime calls [`initialize_module`] once per loaded module
//! instance. Each registered callback receives the environment and the
//! exports object, in registration order.

use crate::runtime::error::BridgeError;
use crate::runtime::host_fn::throw_bridge_error;
use crate::runtime::sys::Env;
use crate::runtime::values::JsObject;
use once_cell::sync::Lazy;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error};

type RegisterFn = dyn Fn(&Env, &JsObject) -> Result<(), BridgeError> + Send + Sync;

struct Registration {
    name: String,
    callback: Arc<RegisterFn>,
}

/// Ordered list of named registration callbacks.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: Mutex<Vec<Registration>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Registration>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append a callback. Names are unique within a registry.
    pub fn register<F>(&self, name: impl Into<String>, callback: F) -> Result<(), BridgeError>
    where
        F: Fn(&Env, &JsObject) -> Result<(), BridgeError> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut entries = self.lock();
        if entries.iter().any(|entry| entry.name == name) {
            return Err(BridgeError::runtime(format!(
                "module '{}' is already registered",
                name
            )));
        }
        entries.push(Registration {
            name,
            callback: Arc::new(callback),
        });
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().iter().map(|entry| entry.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every callback against `exports`.
    ///
    /// The first failure (an `Err` or a panic) is thrown into the engine and
    /// returned; later callbacks do not run.
    pub fn initialize(&self, env: &Env, exports: &JsObject) -> Result<(), BridgeError> {
        // Snapshot so a callback may register further modules without deadlocking.
        let callbacks: Vec<(String, Arc<RegisterFn>)> = self
            .lock()
            .iter()
            .map(|entry| (entry.name.clone(), entry.callback.clone()))
            .collect();

        for (name, callback) in callbacks {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(env, exports)))
                .unwrap_or_else(|payload| Err(BridgeError::from_panic(payload)));
            if let Err(err) = outcome {
                error!("module '{}' failed to register: {}", name, err);
                throw_bridge_error(env, &err);
                return Err(err);
            }
            debug!("registered module '{}'", name);
        }
        Ok(())
    }
}

static GLOBAL_REGISTRY: Lazy<ModuleRegistry> = Lazy::new(ModuleRegistry::new);

/// The process-wide registry used when no explicit one is configured.
pub fn global_registry() -> &'static ModuleRegistry {
    &GLOBAL_REGISTRY
}

/// Fixed entry point: populate `exports` from the process-wide registry.
pub fn initialize_module(env: &Env, exports: &JsObject) -> Result<(), BridgeError> {
    global_registry().initialize(env, exports)
}
