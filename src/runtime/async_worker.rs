//! Background work that settles a promise on the engine thread.
//!
//! [`AsyncWorker::run`] returns a pending promise right away and runs `exec`
//! on the async-work pool. Back on the engine thread exactly one outcome
//! settles the promise:
//!
//! - `exec` panicked: rejected with the panic message, `done` never runs;
//! - the work was cancelled before it started: rejected with `ERR_CANCELLED`;
//! - otherwise `done` runs and resolves or rejects through [`Settle`]. If it
//!   returns without doing either, the promise is rejected.

use crate::runtime::conversion::to_js;
use crate::runtime::error::{panic_message, BridgeError};
use crate::runtime::js_value::JsValue;
use crate::runtime::sys::{AsyncWork, Env, Status};
use crate::runtime::values::{JsDeferred, JsError, JsPromise};
use serde::Serialize;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

pub const CANCELLED_CODE: &str = "ERR_CANCELLED";
pub const UNSETTLED_CODE: &str = "ERR_UNSETTLED";

/// Cooperative cancellation flag shared with `exec`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Resolve/reject capability handed to `done`. Only the first settlement counts.
pub struct Settle {
    env: Env,
    deferred: RefCell<Option<JsDeferred>>,
}

impl Settle {
    fn take(&self) -> Result<JsDeferred, BridgeError> {
        self.deferred
            .borrow_mut()
            .take()
            .ok_or_else(|| BridgeError::runtime("promise already settled"))
    }

    pub fn resolve(&self, value: &JsValue) -> Result<(), BridgeError> {
        self.take()?.resolve(value)
    }

    /// Resolve with a converted host value.
    pub fn resolve_with<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), BridgeError> {
        let value = to_js(&self.env, value)?;
        self.resolve(&value)
    }

    pub fn reject(&self, reason: &JsValue) -> Result<(), BridgeError> {
        self.take()?.reject(reason)
    }

    /// Reject with an Error object carrying `code` and `message`.
    pub fn reject_with_error(&self, code: Option<&str>, message: &str) -> Result<(), BridgeError> {
        let error = JsError::new(&self.env, code, message)?;
        self.reject(&error.into())
    }

    pub fn is_settled(&self) -> bool {
        self.deferred.borrow().is_none()
    }
}

/// A queued unit of background work and the promise it settles.
pub struct AsyncWorker {
    env: Env,
    work: AsyncWork,
    promise: JsPromise,
    cancel: CancelToken,
}

type ExecOutcome<T> = Arc<Mutex<Option<Result<T, String>>>>;

impl AsyncWorker {
    /// Queue `exec` on the worker pool; `done` settles the promise once it finishes.
    pub fn run<T, E, D>(env: &Env, exec: E, done: D) -> Result<AsyncWorker, BridgeError>
    where
        T: Send + 'static,
        E: FnOnce(&CancelToken) -> T + Send + 'static,
        D: FnOnce(&Env, T, &Settle) -> Result<(), BridgeError> + 'static,
    {
        let (promise, deferred) = JsPromise::new(env);
        let cancel = CancelToken::default();
        let outcome: ExecOutcome<T> = Arc::new(Mutex::new(None));

        let execute = {
            let outcome = outcome.clone();
            let cancel = cancel.clone();
            Box::new(move || {
                let result = catch_unwind(AssertUnwindSafe(|| exec(&cancel)))
                    .map_err(|payload| panic_message(payload.as_ref()));
                if let Ok(mut slot) = outcome.lock() {
                    *slot = Some(result);
                }
            })
        };

        // Filled in after the work is created; read only by `complete`.
        let handle = Arc::new(Mutex::new(None::<AsyncWork>));
        let complete = {
            let handle = handle.clone();
            Box::new(move |env: &Env, status: Status| {
                let settle = Settle {
                    env: env.clone(),
                    deferred: RefCell::new(Some(deferred)),
                };
                let result = outcome.lock().ok().and_then(|mut slot| slot.take());
                finish(env, status, result, done, &settle);
                let work = handle.lock().ok().and_then(|mut work| work.take());
                if let Some(work) = work {
                    if let Err(status) = env.delete_async_work(work) {
                        warn!("failed to delete async work: {}", status);
                    }
                }
            })
        };

        let work = env.create_async_work(execute, complete);
        if let Ok(mut slot) = handle.lock() {
            *slot = Some(work);
        }
        if let Err(status) = env.queue_async_work(work) {
            if let Ok(mut slot) = handle.lock() {
                slot.take();
            }
            if let Err(err) = env.delete_async_work(work) {
                warn!("failed to delete unqueued async work: {}", err);
            }
            return Err(status.into());
        }
        debug!(work = ?work, "queued async worker");
        Ok(AsyncWorker {
            env: env.clone(),
            work,
            promise,
            cancel,
        })
    }

    /// The promise this worker settles.
    pub fn promise(&self) -> &JsPromise {
        &self.promise
    }

    /// Flag for `exec` to poll; may be sent to other threads.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cancellation. Returns `true` when the work had not started and
    /// will never run; running work only sees its [`CancelToken`] flip.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel();
        match self.env.cancel_async_work(self.work) {
            Ok(()) => true,
            Err(status) => {
                debug!(work = ?self.work, "async work not cancellable: {}", status);
                false
            }
        }
    }
}

fn finish<T, D>(
    env: &Env,
    status: Status,
    result: Option<Result<T, String>>,
    done: D,
    settle: &Settle,
) where
    D: FnOnce(&Env, T, &Settle) -> Result<(), BridgeError>,
{
    let settled = match (status, result) {
        (Status::Cancelled, _) => {
            settle.reject_with_error(Some(CANCELLED_CODE), "async work was cancelled")
        }
        (_, Some(Err(message))) => {
            error!("async worker panicked: {}", message);
            let err = BridgeError::Fault(message);
            settle.reject_with_error(err.code(), &err.to_string())
        }
        (_, Some(Ok(value))) => {
            let outcome = catch_unwind(AssertUnwindSafe(|| done(env, value, settle)))
                .unwrap_or_else(|payload| Err(BridgeError::from_panic(payload)));
            match outcome {
                Ok(()) if settle.is_settled() => Ok(()),
                Ok(()) => settle.reject_with_error(
                    Some(UNSETTLED_CODE),
                    "async worker did not settle the promise",
                ),
                Err(err) if settle.is_settled() => {
                    warn!("async worker completion failed after settling: {}", err);
                    Ok(())
                }
                Err(err) => settle.reject_with_error(err.code(), &err.to_string()),
            }
        }
        (status, None) => settle.reject_with_error(
            None,
            &format!("async work finished without a result ({})", status),
        ),
    };
    if let Err(err) = settled {
        error!("failed to settle async worker promise: {}", err);
    }
}
