//! Host-facing handle for interacting with the engine thread.

use crate::runtime::config::EngineConfig;
use crate::runtime::error::BridgeError;
use crate::runtime::runner::{run_contained, spawn_engine_thread, EngineCommand};
use crate::runtime::sys::Env;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;
use tokio::sync::mpsc as async_mpsc;
use tokio::sync::oneshot;

/// Cloneable handle to one engine thread.
///
/// The engine stops on [`close`](EngineHandle::close), or once every clone
/// has been dropped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: Option<async_mpsc::UnboundedSender<EngineCommand>>,
    engine_thread: ThreadId,
    shutdown: Arc<Mutex<bool>>,
}

impl EngineHandle {
    pub fn spawn(config: EngineConfig) -> Result<Self, BridgeError> {
        let (tx, engine_thread) = spawn_engine_thread(config)?;
        Ok(Self {
            tx: Some(tx),
            engine_thread,
            shutdown: Arc::new(Mutex::new(false)),
        })
    }

    fn shutdown_flag(&self) -> MutexGuard<'_, bool> {
        match self.shutdown.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn sender(&self) -> Result<&async_mpsc::UnboundedSender<EngineCommand>, BridgeError> {
        if *self.shutdown_flag() {
            return Err(BridgeError::runtime("engine has been shut down"));
        }
        self.tx
            .as_ref()
            .ok_or_else(|| BridgeError::runtime("engine has been shut down"))
    }

    /// Run `job` on the engine thread and block until it returns.
    ///
    /// Calling this from the engine thread itself would deadlock and is rejected.
    pub fn run_sync<R, F>(&self, job: F) -> Result<R, BridgeError>
    where
        F: FnOnce(&Env) -> Result<R, BridgeError> + Send + 'static,
        R: Send + 'static,
    {
        if std::thread::current().id() == self.engine_thread {
            return Err(BridgeError::runtime(
                "run_sync called from the engine thread",
            ));
        }
        let sender = self.sender()?.clone();
        let (result_tx, result_rx) = mpsc::channel();

        sender
            .send(EngineCommand::Run {
                job: Box::new(move |env: &Env| {
                    let _ = result_tx.send(run_contained(env, job));
                }),
            })
            .map_err(|_| BridgeError::runtime("failed to send job to engine thread"))?;

        result_rx
            .recv()
            .map_err(|_| BridgeError::runtime("failed to receive job result"))?
    }

    /// Run `job` on the engine thread and await its result.
    pub async fn run_async<R, F>(&self, job: F) -> Result<R, BridgeError>
    where
        F: FnOnce(&Env) -> Result<R, BridgeError> + Send + 'static,
        R: Send + 'static,
    {
        let sender = self.sender()?.clone();
        let (result_tx, result_rx) = oneshot::channel();

        sender
            .send(EngineCommand::Run {
                job: Box::new(move |env: &Env| {
                    let _ = result_tx.send(run_contained(env, job));
                }),
            })
            .map_err(|_| BridgeError::runtime("failed to send job to engine thread"))?;

        result_rx
            .await
            .map_err(|_| BridgeError::runtime("failed to receive job result"))?
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_flag()
    }

    /// Stop the engine loop and wait for it to acknowledge.
    pub fn close(&mut self) -> Result<(), BridgeError> {
        let mut shutdown_guard = match self.shutdown.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *shutdown_guard {
            return Ok(());
        }

        if let Some(tx) = self.tx.take() {
            let (result_tx, result_rx) = mpsc::channel();
            tx.send(EngineCommand::Shutdown {
                responder: result_tx,
            })
            .map_err(|_| BridgeError::runtime("failed to send shutdown command"))?;

            result_rx
                .recv()
                .map_err(|_| BridgeError::runtime("failed to confirm engine shutdown"))?;
            *shutdown_guard = true;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::values::JsObject;

    #[test]
    fn test_run_sync_returns_job_result() {
        let mut handle = EngineHandle::spawn(EngineConfig::default()).unwrap();
        let sum = handle.run_sync(|_env| Ok(20 + 22)).unwrap();
        assert_eq!(sum, 42);
        handle.close().unwrap();
        assert!(handle.is_shutdown());
    }

    #[test]
    fn test_panicking_job_is_contained() {
        let mut handle = EngineHandle::spawn(EngineConfig::default()).unwrap();
        let err = handle
            .run_sync(|_env| -> Result<(), BridgeError> { panic!("job exploded") })
            .unwrap_err();
        assert!(matches!(err, BridgeError::Fault(ref msg) if msg.contains("job exploded")));
        // The engine keeps serving after a contained fault.
        assert!(handle.run_sync(|_env| Ok(())).is_ok());
        handle.close().unwrap();
    }

    #[test]
    fn test_state_persists_between_jobs() {
        let mut handle = EngineHandle::spawn(EngineConfig::default()).unwrap();
        handle
            .run_sync(|env| JsObject::global(env).set_value("counter", &7))
            .unwrap();
        let counter: i32 = handle
            .run_sync(|env| JsObject::global(env).get_as("counter"))
            .unwrap();
        assert_eq!(counter, 7);
        handle.close().unwrap();
    }

    #[test]
    fn test_job_temporaries_are_reclaimed() {
        let mut handle = EngineHandle::spawn(EngineConfig::default()).unwrap();
        let job = |env: &Env| -> Result<(), BridgeError> {
            for n in 0..1000 {
                let value = crate::runtime::conversion::to_js(env, &vec![n, n + 1])?;
                let _: Vec<i32> = crate::runtime::conversion::from_js(&value)?;
            }
            Ok(())
        };
        handle.run_sync(job).unwrap();
        let baseline = handle.run_sync(|env| Ok(env.live_values())).unwrap();
        for _ in 0..20 {
            handle.run_sync(job).unwrap();
        }
        let after = handle.run_sync(|env| Ok(env.live_values())).unwrap();
        assert_eq!(after, baseline);
        handle.close().unwrap();
    }

    #[test]
    fn test_closed_handle_rejects_jobs() {
        let mut handle = EngineHandle::spawn(EngineConfig::default()).unwrap();
        handle.close().unwrap();
        assert!(handle.close().is_ok());
        let err = handle.run_sync(|_env| Ok(())).unwrap_err();
        assert!(err.to_string().contains("shut down"));
    }

    #[test]
    fn test_invalid_config_fails_spawn() {
        let result = EngineHandle::spawn(EngineConfig::new().with_async_work_threads(0));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_async() {
        let mut handle = EngineHandle::spawn(EngineConfig::default()).unwrap();
        let name = handle
            .run_async(|env| Ok(format!("env-{}", env.id() > 0)))
            .await
            .unwrap();
        assert_eq!(name, "env-true");
        handle.close().unwrap();
    }
}
