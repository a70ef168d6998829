mod common;

use common::{global, init_tracing, wait_for};
use jsbridge::runtime::sys::Status;
use jsbridge::{
    from_js, AsyncWorker, BridgeError, CallContext, CallMode, EngineConfig, EngineHandle,
    HostFunction, JsArray, JsError, JsFunction, JsObject, JsPromise, JsValue, ModuleRegistry,
    PromiseOutcome, ReleaseMode, ThreadsafeFunction,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

fn spawn() -> EngineHandle {
    init_tracing();
    EngineHandle::spawn(EngineConfig::default()).unwrap()
}

/// `{message, code}` of a rejected promise stored as a global, once settled.
fn rejection(env: &jsbridge::Env, name: &str) -> Result<Option<(String, Option<String>)>, BridgeError> {
    let promise: JsPromise = global(env).get(name)?.cast()?;
    match promise.outcome()? {
        PromiseOutcome::Pending => Ok(None),
        PromiseOutcome::Fulfilled(_) => Err(BridgeError::runtime("promise fulfilled")),
        PromiseOutcome::Rejected(reason) => {
            let error: JsError = reason.cast()?;
            Ok(Some((error.message()?, error.code()?)))
        }
    }
}

#[test]
fn test_arity_mismatch_throws_before_invoking() {
    let mut handle = spawn();
    let outcome = handle
        .run_sync(|env| {
            let add = HostFunction::new("add", |a: i32, b: i32| a + b).to_function(env)?;
            let short = add.call_with(&[1]).unwrap_err().to_string();

            let status = env.call_function(env.get_undefined(), add.raw(), &[]);
            assert_eq!(status.unwrap_err(), Status::PendingException);
            let raw = env.get_and_clear_last_exception().unwrap();
            let code = JsValue::new(env, raw)?.cast::<JsError>()?.code()?;

            let sum: i32 = from_js(&add.call_with(&[40, 2])?)?;
            Ok((short, code, sum))
        })
        .unwrap();

    assert_eq!(outcome.0, "require 2 arguments, called with 1");
    assert_eq!(outcome.1.as_deref(), Some("ERR_INVALID_ARG_COUNT"));
    assert_eq!(outcome.2, 42);
    handle.close().unwrap();
}

#[test]
fn test_multiple_returns_and_trailing_error() {
    let mut handle = spawn();
    let (pair, err) = handle
        .run_sync(|env| {
            let divmod = HostFunction::new(
                "divmod",
                |a: i64, b: i64| -> Result<(i64, i64), BridgeError> {
                    if b == 0 {
                        return Err("division by zero".into());
                    }
                    Ok((a / b, a % b))
                },
            )
            .to_function(env)?;
            let pair: (i64, i64) = from_js(&divmod.call_with(&[17, 5])?)?;
            let err = divmod.call_with(&[1, 0]).unwrap_err();
            Ok((pair, err.to_string()))
        })
        .unwrap();

    assert_eq!(pair, (3, 2));
    assert_eq!(err, "division by zero");
    handle.close().unwrap();
}

#[test]
fn test_threadsafe_calls_from_worker_thread_arrive_in_order() {
    let mut handle = spawn();
    let tsfn = handle
        .run_sync(|env| {
            global(env).set("seen", &JsArray::new(env).into())?;
            ThreadsafeFunction::<u32>::builder("ordered")
                .finalize(|env| {
                    let _ = global(env).set_value("finalized", &true);
                })
                .build(env, |env, _js, n| {
                    let seen: JsArray = global(env).get("seen")?.cast()?;
                    seen.push(&jsbridge::to_js(env, &n)?)
                })
        })
        .unwrap();

    let producer = thread::spawn(move || {
        for n in 0..200 {
            tsfn.call(n, CallMode::Blocking).unwrap();
        }
        tsfn.release(ReleaseMode::Release).unwrap();
    });
    producer.join().unwrap();

    let seen: Vec<u32> = wait_for(&handle, |env| {
        if !global(env).has("finalized")? {
            return Ok(None);
        }
        Ok(Some(global(env).get_as("seen")?))
    });
    assert_eq!(seen, (0..200).collect::<Vec<_>>());
    handle.close().unwrap();
}

#[test]
fn test_non_blocking_call_reports_full_queue() {
    let mut handle = spawn();
    let tsfn = handle
        .run_sync(|env| {
            ThreadsafeFunction::<&'static str>::builder("bounded")
                .max_queue_size(1)
                .build(env, |_env, _js, _label| Ok(()))
        })
        .unwrap();

    // Park the engine thread so nothing drains the queue.
    let (started_tx, started_rx) = mpsc::channel();
    let (unblock_tx, unblock_rx) = mpsc::channel::<()>();
    let blocker = {
        let handle = handle.clone();
        thread::spawn(move || {
            handle.run_sync(move |_env| {
                let _ = started_tx.send(());
                let _ = unblock_rx.recv();
                Ok(())
            })
        })
    };
    started_rx.recv().unwrap();

    tsfn.call("first", CallMode::NonBlocking).unwrap();
    let err = tsfn.call("second", CallMode::NonBlocking).unwrap_err();
    assert_eq!(err.status(), Some(Status::QueueFull));

    unblock_tx.send(()).unwrap();
    blocker.join().unwrap().unwrap();
    tsfn.release(ReleaseMode::Release).unwrap();
    handle.close().unwrap();
}

#[test]
fn test_unreferenced_function_does_not_hold_the_loop() {
    let handle = spawn();
    let tsfn = handle
        .run_sync(|env| {
            let tsfn = ThreadsafeFunction::<u32>::builder("background")
                .build(env, |_env, _js, _n| Ok(()))?;
            tsfn.unref(env)?;
            Ok(tsfn)
        })
        .unwrap();

    // Last handle gone: nothing keeps the loop running.
    drop(handle);
    let err = tsfn.call(1, CallMode::NonBlocking).unwrap_err();
    assert_eq!(err.status(), Some(Status::Closing));
}

#[test]
fn test_referenced_function_keeps_loop_until_released() {
    let handle = spawn();
    let (events_tx, events_rx) = mpsc::channel();
    let tsfn = handle
        .run_sync(move |env| {
            let finalized_tx = events_tx.clone();
            ThreadsafeFunction::<u32>::builder("held")
                .finalize(move |_env| {
                    let _ = finalized_tx.send(None);
                })
                .build(env, move |_env, _js, n| {
                    let _ = events_tx.send(Some(n));
                    Ok(())
                })
        })
        .unwrap();

    drop(handle);
    tsfn.call(7, CallMode::Blocking).unwrap();
    let timeout = std::time::Duration::from_secs(10);
    assert_eq!(events_rx.recv_timeout(timeout).unwrap(), Some(7));

    tsfn.release(ReleaseMode::Release).unwrap();
    assert_eq!(events_rx.recv_timeout(timeout).unwrap(), None);
    let err = tsfn.call(8, CallMode::NonBlocking).unwrap_err();
    assert_eq!(err.status(), Some(Status::Closing));
}

#[derive(Serialize)]
struct Progress {
    step: u32,
    total: u32,
}

#[test]
fn test_default_dispatch_calls_script_function() {
    let mut handle = spawn();
    let tsfn = handle
        .run_sync(|env| {
            global(env).set("reports", &JsArray::new(env).into())?;
            let report = HostFunction::raw("report", |ctx: &CallContext| {
                let reports: JsArray = global(ctx.env()).get("reports")?.cast()?;
                reports.push(&ctx.arg(0))?;
                Ok(JsValue::undefined(ctx.env()))
            })
            .to_function(env)?;
            ThreadsafeFunction::<Progress>::with_default_callback(env, report, "progress")
        })
        .unwrap();

    thread::spawn(move || {
        for step in 1..=3 {
            tsfn.call(Progress { step, total: 3 }, CallMode::Blocking)
                .unwrap();
        }
        tsfn.release(ReleaseMode::Release).unwrap();
    })
    .join()
    .unwrap();

    let steps: Vec<u32> = wait_for(&handle, |env| {
        let reports: JsArray = global(env).get("reports")?.cast()?;
        if reports.len()? < 3 {
            return Ok(None);
        }
        let steps = reports
            .to_vec()?
            .iter()
            .map(|report| report.clone().cast::<JsObject>()?.get_as::<u32>("step"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(steps))
    });
    assert_eq!(steps, vec![1, 2, 3]);
    handle.close().unwrap();
}

#[test]
fn test_failing_threadsafe_callback_is_reported_uncaught() {
    let mut handle = spawn();
    let tsfn = handle
        .run_sync(|env| {
            ThreadsafeFunction::<String>::builder("strict").build(env, |_env, _js, payload| {
                Err(BridgeError::runtime(format!("rejected payload {}", payload)))
            })
        })
        .unwrap();
    tsfn.call("x".to_string(), CallMode::Blocking).unwrap();

    let messages: Vec<String> = wait_for(&handle, |env| {
        let uncaught = env.take_uncaught_exceptions();
        if uncaught.is_empty() {
            return Ok(None);
        }
        uncaught
            .into_iter()
            .map(|raw| JsValue::new(env, raw)?.cast::<JsError>()?.message())
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    });
    assert_eq!(messages, vec!["rejected payload x".to_string()]);
    tsfn.release(ReleaseMode::Release).unwrap();
    handle.close().unwrap();
}

#[test]
fn test_async_worker_resolves_on_engine_thread() {
    let mut handle = spawn();
    handle
        .run_sync(|env| {
            let worker = AsyncWorker::run(
                env,
                |_cancel| (1..=10u64).product::<u64>(),
                |_env, value, settle| settle.resolve_with(&value),
            )?;
            global(env).set("p", &worker.promise().clone().into())
        })
        .unwrap();

    let value: u64 = wait_for(&handle, |env| {
        let promise: JsPromise = global(env).get("p")?.cast()?;
        match promise.outcome()? {
            PromiseOutcome::Fulfilled(value) => Ok(Some(from_js(&value)?)),
            _ => Ok(None),
        }
    });
    assert_eq!(value, 3_628_800);
    handle.close().unwrap();
}

#[test]
fn test_async_worker_panic_rejects_promise() {
    let mut handle = spawn();
    let done_ran = Arc::new(AtomicBool::new(false));
    let flag = done_ran.clone();
    handle
        .run_sync(move |env| {
            let worker = AsyncWorker::run(
                env,
                |_cancel| -> u32 { panic!("boom") },
                move |_env, value, settle| {
                    flag.store(true, Ordering::SeqCst);
                    settle.resolve_with(&value)
                },
            )?;
            global(env).set("p", &worker.promise().clone().into())
        })
        .unwrap();

    let (message, code) = wait_for(&handle, |env| rejection(env, "p"));
    assert!(message.contains("boom"), "{message}");
    assert_eq!(code.as_deref(), Some("ERR_HOST_PANIC"));
    assert!(!done_ran.load(Ordering::SeqCst));
    handle.close().unwrap();
}

#[test]
fn test_cancel_queued_work_on_single_thread_pool() {
    init_tracing();
    let mut handle =
        EngineHandle::spawn(EngineConfig::new().with_async_work_threads(1)).unwrap();
    let (unblock_tx, unblock_rx) = mpsc::channel::<()>();
    let second_ran = Arc::new(AtomicBool::new(false));
    let ran = second_ran.clone();

    let cancelled = handle
        .run_sync(move |env| {
            let first = AsyncWorker::run(
                env,
                move |_cancel| {
                    let _ = unblock_rx.recv();
                    "done"
                },
                |_env, value, settle| settle.resolve_with(value),
            )?;
            let second = AsyncWorker::run(
                env,
                move |_cancel| ran.store(true, Ordering::SeqCst),
                |_env, (), settle| settle.resolve_with(&()),
            )?;
            global(env).set("first", &first.promise().clone().into())?;
            global(env).set("second", &second.promise().clone().into())?;
            Ok(second.cancel())
        })
        .unwrap();
    assert!(cancelled);
    unblock_tx.send(()).unwrap();

    let (_, code) = wait_for(&handle, |env| rejection(env, "second"));
    assert_eq!(code.as_deref(), Some("ERR_CANCELLED"));

    let first: String = wait_for(&handle, |env| {
        let promise: JsPromise = global(env).get("first")?.cast()?;
        match promise.outcome()? {
            PromiseOutcome::Fulfilled(value) => Ok(Some(from_js(&value)?)),
            _ => Ok(None),
        }
    });
    assert_eq!(first, "done");
    assert!(!second_ran.load(Ordering::SeqCst));

    let outstanding = handle.run_sync(|env| Ok(env.outstanding_resources())).unwrap();
    assert_eq!(outstanding, (0, 0));
    handle.close().unwrap();
}

#[test]
fn test_registered_modules_populate_exports() {
    init_tracing();
    let registry = ModuleRegistry::new();
    registry
        .register("greeter", |env, exports| {
            let greet = HostFunction::new("greet", |name: String| format!("hello {}", name));
            exports.set("greet", &greet.to_function(env)?.into())
        })
        .unwrap();

    let mut handle =
        EngineHandle::spawn(EngineConfig::new().with_module_registry(Arc::new(registry))).unwrap();
    let greeting: String = handle
        .run_sync(|env| {
            let exports: JsObject = global(env).get("exports")?.cast()?;
            let greet: JsFunction = exports.get("greet")?.cast()?;
            from_js(&greet.call_with(&["Ada"])?)
        })
        .unwrap();
    assert_eq!(greeting, "hello Ada");
    handle.close().unwrap();
}

#[test]
fn test_panicking_module_fails_engine_start() {
    init_tracing();
    let registry = ModuleRegistry::new();
    registry
        .register("broken", |_env, _exports| panic!("cannot load"))
        .unwrap();

    let result = EngineHandle::spawn(EngineConfig::new().with_module_registry(Arc::new(registry)));
    match result {
        Err(BridgeError::Fault(message)) => assert!(message.contains("cannot load")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("engine started despite a failing module"),
    }
}
