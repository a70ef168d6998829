//! Native threadsafe functions: a queue any thread can push into, drained on
//! the engine thread.

use super::env::Env;
use super::heap::RawValue;
use super::status::{Status, SysResult};
use super::{EventSink, LoopEvent};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

static NEXT_TSFN_ID: AtomicU64 = AtomicU64::new(1);

/// How `call_threadsafe_function` behaves when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Blocking,
    NonBlocking,
}

/// How `release_threadsafe_function` gives up its reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    Release,
    Abort,
}

/// Engine-thread dispatch: `(env, js_callback, context, data)`. `env` is
/// `None` when the function was aborted and the call is only being drained.
pub type CallJsCallback = Box<dyn Fn(Option<&Env>, Option<RawValue>, u64, u64)>;
/// Engine-thread teardown: `(env, finalize_data, context)`.
pub type FinalizeCallback = Box<dyn FnOnce(&Env, u64, u64)>;

struct QueueState {
    thread_count: usize,
    queued: usize,
    closing: bool,
    aborted: bool,
}

struct TsfnShared {
    id: u64,
    env: u32,
    max_queue_size: usize,
    context: u64,
    state: Mutex<QueueState>,
    space: Condvar,
    sink: Arc<dyn EventSink>,
}

/// Cross-thread handle to a native threadsafe function.
#[derive(Clone)]
pub struct ThreadsafeFunctionHandle {
    shared: Arc<TsfnShared>,
}

impl PartialEq for ThreadsafeFunctionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for ThreadsafeFunctionHandle {}

impl Hash for ThreadsafeFunctionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl std::fmt::Debug for ThreadsafeFunctionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ThreadsafeFunctionHandle")
            .field(&self.shared.id)
            .finish()
    }
}

pub(crate) struct TsfnEntry {
    handle: ThreadsafeFunctionHandle,
    js_func: Option<RawValue>,
    context: u64,
    call_js: Option<CallJsCallback>,
    finalize: Option<(FinalizeCallback, u64)>,
    refed: bool,
}

impl TsfnEntry {
    /// The script function kept alive for dispatch.
    pub(crate) fn rooted(&self) -> Option<RawValue> {
        self.js_func
    }
}

impl ThreadsafeFunctionHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueue one call carrying `data`. FIFO with respect to other calls
    /// from the same thread.
    pub fn call(&self, data: u64, mode: CallMode) -> SysResult<()> {
        let mut state = self.lock();
        loop {
            if state.closing {
                return Err(Status::Closing);
            }
            let full = self.shared.max_queue_size > 0 && state.queued >= self.shared.max_queue_size;
            if !full {
                break;
            }
            match mode {
                CallMode::NonBlocking => return Err(Status::QueueFull),
                CallMode::Blocking => {
                    state = match self.shared.space.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
        if !self.shared.sink.post(LoopEvent::Dispatch {
            tsfn: self.shared.id,
            data,
        }) {
            return Err(Status::Closing);
        }
        state.queued += 1;
        Ok(())
    }

    pub fn acquire(&self) -> SysResult<()> {
        let mut state = self.lock();
        if state.closing {
            return Err(Status::Closing);
        }
        state.thread_count += 1;
        Ok(())
    }

    pub fn release(&self, mode: ReleaseMode) -> SysResult<()> {
        let mut state = self.lock();
        if state.thread_count == 0 {
            return Err(Status::InvalidArg);
        }
        state.thread_count -= 1;
        if mode == ReleaseMode::Abort {
            state.aborted = true;
        }
        let was_closing = state.closing;
        if state.thread_count == 0 || state.aborted {
            state.closing = true;
        }
        if state.closing && !was_closing {
            // Posted behind every dispatch already in the loop channel.
            self.shared.sink.post(LoopEvent::Finalize {
                tsfn: self.shared.id,
            });
            self.shared.space.notify_all();
        }
        Ok(())
    }

    pub fn context(&self) -> u64 {
        self.shared.context
    }

    /// Whether the function stopped accepting calls: every thread reference
    /// was released, or it was aborted.
    pub fn is_closing(&self) -> bool {
        self.lock().closing
    }

    pub(crate) fn env_id(&self) -> u32 {
        self.shared.env
    }
}

impl Env {
    #[allow(clippy::too_many_arguments)]
    pub fn create_threadsafe_function(
        &self,
        js_func: Option<RawValue>,
        resource_name: &str,
        max_queue_size: usize,
        initial_thread_count: usize,
        finalize_data: u64,
        finalize_cb: Option<FinalizeCallback>,
        context: u64,
        call_js_cb: Option<CallJsCallback>,
    ) -> SysResult<ThreadsafeFunctionHandle> {
        if initial_thread_count == 0 {
            return Err(Status::InvalidArg);
        }
        match js_func {
            Some(func) => {
                if self.typeof_value(func)? != super::ValueType::Function {
                    return Err(Status::FunctionExpected);
                }
            }
            None if call_js_cb.is_none() => return Err(Status::InvalidArg),
            None => {}
        }
        let id = NEXT_TSFN_ID.fetch_add(1, Ordering::Relaxed);
        let handle = ThreadsafeFunctionHandle {
            shared: Arc::new(TsfnShared {
                id,
                env: self.id(),
                max_queue_size,
                context,
                state: Mutex::new(QueueState {
                    thread_count: initial_thread_count,
                    queued: 0,
                    closing: false,
                    aborted: false,
                }),
                space: Condvar::new(),
                sink: self.inner.sink.clone(),
            }),
        };
        self.inner.tsfns.borrow_mut().insert(
            id,
            TsfnEntry {
                handle: handle.clone(),
                js_func,
                context,
                call_js: call_js_cb,
                finalize: finalize_cb.map(|cb| (cb, finalize_data)),
                refed: true,
            },
        );
        tracing::debug!(tsfn = id, resource = resource_name, "created threadsafe function");
        self.sync_keep_alive();
        Ok(handle)
    }

    pub fn ref_threadsafe_function(&self, handle: &ThreadsafeFunctionHandle) -> SysResult<()> {
        self.set_tsfn_ref(handle, true)
    }

    pub fn unref_threadsafe_function(&self, handle: &ThreadsafeFunctionHandle) -> SysResult<()> {
        self.set_tsfn_ref(handle, false)
    }

    fn set_tsfn_ref(&self, handle: &ThreadsafeFunctionHandle, refed: bool) -> SysResult<()> {
        if handle.env_id() != self.id() {
            return Err(Status::InvalidArg);
        }
        {
            let mut tsfns = self.inner.tsfns.borrow_mut();
            let entry = tsfns.get_mut(&handle.id()).ok_or(Status::InvalidArg)?;
            entry.refed = refed;
        }
        self.sync_keep_alive();
        Ok(())
    }

    /// Whether any live threadsafe function still keeps the loop referenced.
    pub fn has_refed_threadsafe_functions(&self) -> bool {
        self.inner.tsfns.borrow().values().any(|entry| entry.refed)
    }

    fn sync_keep_alive(&self) {
        self.inner
            .sink
            .keep_alive(self.has_refed_threadsafe_functions());
    }

    pub(crate) fn dispatch_threadsafe_call(&self, tsfn: u64, data: u64) {
        let (handle, js_func, context, call_js) = {
            let mut tsfns = self.inner.tsfns.borrow_mut();
            match tsfns.get_mut(&tsfn) {
                Some(entry) => (
                    entry.handle.clone(),
                    entry.js_func,
                    entry.context,
                    entry.call_js.take(),
                ),
                None => {
                    tracing::warn!(tsfn, "dispatch for unknown threadsafe function");
                    return;
                }
            }
        };
        let aborted = {
            let mut state = handle.lock();
            state.queued = state.queued.saturating_sub(1);
            handle.shared.space.notify_one();
            state.aborted
        };
        let env = if aborted { None } else { Some(self) };
        match &call_js {
            Some(call_js) => call_js(env, js_func, context, data),
            None => {
                if let (Some(env), Some(func)) = (env, js_func) {
                    let recv = env.get_undefined();
                    let _ = env.call_function(recv, func, &[]);
                }
            }
        }
        if let Some(entry) = self.inner.tsfns.borrow_mut().get_mut(&tsfn) {
            entry.call_js = call_js;
        }
    }

    pub(crate) fn finalize_threadsafe_function(&self, tsfn: u64) {
        let entry = self.inner.tsfns.borrow_mut().remove(&tsfn);
        self.sync_keep_alive();
        match entry {
            Some(entry) => {
                tracing::debug!(tsfn, "finalizing threadsafe function");
                if let Some((finalize, finalize_data)) = entry.finalize {
                    finalize(self, finalize_data, entry.context);
                }
            }
            None => tracing::warn!(tsfn, "finalize for unknown threadsafe function"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sys::env::tests::test_env;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn pump(env: &Env, sink: &crate::runtime::sys::env::tests::QueueSink) {
        let events: Vec<LoopEvent> = std::mem::take(&mut *sink.events.lock().unwrap());
        for event in events {
            env.process_event(event);
        }
    }

    #[test]
    fn test_calls_delivered_in_order_then_finalized() {
        let (env, sink) = test_env();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in_call = seen.clone();
        let finalized = Rc::new(RefCell::new(false));
        let finalized_flag = finalized.clone();
        let handle = env
            .create_threadsafe_function(
                None,
                "test",
                0,
                1,
                9,
                Some(Box::new(move |_env, data, _ctx| {
                    assert_eq!(data, 9);
                    *finalized_flag.borrow_mut() = true;
                })),
                0,
                Some(Box::new(move |env, _js, _ctx, data| {
                    assert!(env.is_some());
                    seen_in_call.borrow_mut().push(data);
                })),
            )
            .unwrap();
        handle.call(1, CallMode::Blocking).unwrap();
        handle.call(2, CallMode::Blocking).unwrap();
        handle.release(ReleaseMode::Release).unwrap();
        assert_eq!(handle.call(3, CallMode::Blocking), Err(Status::Closing));
        pump(&env, &sink);
        assert_eq!(*seen.borrow(), vec![1, 2]);
        assert!(*finalized.borrow());
        assert_eq!(env.outstanding_resources().0, 0);
    }

    #[test]
    fn test_nonblocking_call_reports_full_queue() {
        let (env, sink) = test_env();
        let handle = env
            .create_threadsafe_function(
                None,
                "bounded",
                1,
                1,
                0,
                None,
                0,
                Some(Box::new(|_env, _js, _ctx, _data| {})),
            )
            .unwrap();
        handle.call(1, CallMode::NonBlocking).unwrap();
        assert_eq!(handle.call(2, CallMode::NonBlocking), Err(Status::QueueFull));
        pump(&env, &sink);
        handle.call(3, CallMode::NonBlocking).unwrap();
        handle.release(ReleaseMode::Release).unwrap();
        pump(&env, &sink);
    }

    #[test]
    fn test_abort_drains_without_env() {
        let (env, sink) = test_env();
        let drained = Rc::new(RefCell::new(Vec::new()));
        let drained_in_call = drained.clone();
        let handle = env
            .create_threadsafe_function(
                None,
                "abort",
                0,
                2,
                0,
                None,
                0,
                Some(Box::new(move |env, _js, _ctx, data| {
                    drained_in_call.borrow_mut().push((env.is_some(), data));
                })),
            )
            .unwrap();
        handle.call(5, CallMode::Blocking).unwrap();
        handle.release(ReleaseMode::Abort).unwrap();
        assert_eq!(handle.acquire(), Err(Status::Closing));
        pump(&env, &sink);
        assert_eq!(*drained.borrow(), vec![(false, 5)]);
    }

    #[test]
    fn test_ref_state_drives_keep_alive() {
        let (env, sink) = test_env();
        let handle = env
            .create_threadsafe_function(
                None,
                "held",
                0,
                1,
                0,
                None,
                0,
                Some(Box::new(|_env, _js, _ctx, _data| {})),
            )
            .unwrap();
        assert!(env.has_refed_threadsafe_functions());
        env.unref_threadsafe_function(&handle).unwrap();
        assert!(!env.has_refed_threadsafe_functions());
        env.ref_threadsafe_function(&handle).unwrap();
        handle.release(ReleaseMode::Release).unwrap();
        pump(&env, &sink);
        assert!(!env.has_refed_threadsafe_functions());
        assert_eq!(*sink.alive.lock().unwrap(), vec![true, false, true, false]);
    }

    #[test]
    fn test_zero_thread_count_is_rejected() {
        let (env, _sink) = test_env();
        let result = env.create_threadsafe_function(
            None,
            "bad",
            0,
            0,
            0,
            None,
            0,
            Some(Box::new(|_env, _js, _ctx, _data| {})),
        );
        assert_eq!(result.err(), Some(Status::InvalidArg));
    }
}
