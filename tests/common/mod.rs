#![allow(dead_code)]

use jsbridge::runtime::sys::{EnvOptions, EventSink, LoopEvent};
use jsbridge::{BridgeError, EngineHandle, Env, JsObject};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Sink for environments that never run a loop.
pub struct NullSink;

impl EventSink for NullSink {
    fn post(&self, _event: LoopEvent) -> bool {
        false
    }
}

pub fn detached_env() -> Env {
    Env::new(EnvOptions::default(), Arc::new(NullSink))
}

/// Poll `check` on the engine thread until it yields a value.
pub fn wait_for<T, F>(handle: &EngineHandle, check: F) -> T
where
    T: Send + 'static,
    F: Fn(&Env) -> Result<Option<T>, BridgeError> + Clone + Send + 'static,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let check = check.clone();
        if let Some(value) = handle.run_sync(move |env| check(env)).unwrap() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting on the engine");
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn global(env: &Env) -> JsObject {
    JsObject::global(env)
}
