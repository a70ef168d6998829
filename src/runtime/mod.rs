//! Host-value bridge for an embedded JavaScript engine.
//!
//! Each engine owns a single [`Env`](sys::Env) running on a dedicated OS
//! thread with a Tokio event loop. Host code marshals values in and out
//! through serde, exposes host functions with checked arity, and calls back
//! into the engine from other threads through threadsafe functions.

pub mod async_worker;
pub mod config;
pub mod conversion;
pub mod error;
pub mod handle;
pub mod handles;
pub mod host_fn;
pub mod js_value;
pub mod module;
pub mod runner;
pub mod sys;
pub mod threadsafe;
pub mod values;

// Re-export key types for convenience
pub use config::EngineConfig;
pub use error::{ArityError, BridgeError, ConversionError};
pub use handle::EngineHandle;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::values::JsObject;
    use std::thread;

    #[test]
    fn test_engine_lifecycle() {
        let mut handle = EngineHandle::spawn(EngineConfig::default()).unwrap();
        assert!(!handle.is_shutdown());

        let has_exports = handle
            .run_sync(|env| JsObject::global(env).has("exports"))
            .unwrap();
        assert!(has_exports);

        handle.close().unwrap();
        assert!(handle.is_shutdown());
    }

    #[test]
    fn test_multiple_engines_sequential() {
        for i in 0..3 {
            let mut handle = EngineHandle::spawn(EngineConfig::default()).unwrap();
            let doubled: i32 = handle
                .run_sync(move |env| {
                    let value = conversion::to_js(env, &i)?;
                    let n: i32 = conversion::from_js(&value)?;
                    Ok(n * 2)
                })
                .unwrap();
            assert_eq!(doubled, i * 2);
            handle.close().unwrap();
        }
    }

    #[test]
    fn test_concurrent_engines() {
        let handles: Vec<EngineHandle> = (0..3)
            .map(|i| {
                EngineHandle::spawn(EngineConfig::new().with_thread_name(format!("engine-{}", i)))
                    .unwrap()
            })
            .collect();

        let mut threads = vec![];
        for (i, handle) in handles.into_iter().enumerate() {
            threads.push(thread::spawn(move || {
                let name = handle
                    .run_sync(|_env| Ok(thread::current().name().map(str::to_string)))
                    .unwrap();
                assert_eq!(name, Some(format!("engine-{}", i)));
            }));
        }

        for t in threads {
            t.join().unwrap();
        }
    }
}
