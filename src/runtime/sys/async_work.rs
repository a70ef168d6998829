//! Native async work: `execute` on a worker pool, `complete` on the engine thread.

use super::env::Env;
use super::status::{Status, SysResult};
use super::{EventSink, LoopEvent};
use crossbeam_channel::{unbounded, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;

/// Body run on a pool thread.
pub type ExecuteCallback = Box<dyn FnOnce() + Send>;
/// Completion run on the engine thread with the final status.
pub type CompleteCallback = Box<dyn FnOnce(&Env, Status)>;

/// Handle to a unit of native async work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncWork(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkPhase {
    Created,
    Queued,
    Running,
    Finished,
    Cancelled,
}

pub(crate) struct WorkEntry {
    phase: Arc<Mutex<WorkPhase>>,
    execute: Option<ExecuteCallback>,
    complete: Option<CompleteCallback>,
}

struct PoolJob {
    work: u64,
    phase: Arc<Mutex<WorkPhase>>,
    execute: ExecuteCallback,
}

/// Fixed-size worker pool fed by an MPMC queue.
pub(crate) struct WorkPool {
    jobs: Sender<PoolJob>,
}

impl WorkPool {
    fn new(threads: usize, sink: Arc<dyn EventSink>) -> SysResult<Self> {
        let (jobs, queue) = unbounded::<PoolJob>();
        for index in 0..threads.max(1) {
            let queue = queue.clone();
            let sink = sink.clone();
            thread::Builder::new()
                .name(format!("jsbridge-worker-{}", index))
                .spawn(move || {
                    while let Ok(job) = queue.recv() {
                        run_job(job, sink.as_ref());
                    }
                })
                .map_err(|err| {
                    tracing::error!(error = %err, "failed to spawn async work thread");
                    Status::GenericFailure
                })?;
        }
        Ok(Self { jobs })
    }
}

fn run_job(job: PoolJob, sink: &dyn EventSink) {
    {
        let mut phase = match job.phase.lock() {
            Ok(phase) => phase,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *phase != WorkPhase::Queued {
            return;
        }
        *phase = WorkPhase::Running;
    }
    let status = match catch_unwind(AssertUnwindSafe(job.execute)) {
        Ok(()) => Status::Ok,
        Err(_) => {
            tracing::error!(work = job.work, "async work execute panicked");
            Status::GenericFailure
        }
    };
    if let Ok(mut phase) = job.phase.lock() {
        *phase = WorkPhase::Finished;
    }
    if !sink.post(LoopEvent::Complete {
        work: job.work,
        status,
    }) {
        tracing::warn!(work = job.work, "engine loop closed before async work completed");
    }
}

impl Env {
    pub fn create_async_work(
        &self,
        execute: ExecuteCallback,
        complete: CompleteCallback,
    ) -> AsyncWork {
        let id = self.inner.next_work.get();
        self.inner.next_work.set(id + 1);
        self.inner.works.borrow_mut().insert(
            id,
            WorkEntry {
                phase: Arc::new(Mutex::new(WorkPhase::Created)),
                execute: Some(execute),
                complete: Some(complete),
            },
        );
        AsyncWork(id)
    }

    pub fn queue_async_work(&self, work: AsyncWork) -> SysResult<()> {
        let (phase, execute) = {
            let mut works = self.inner.works.borrow_mut();
            let entry = works.get_mut(&work.0).ok_or(Status::InvalidArg)?;
            let execute = entry.execute.take().ok_or(Status::GenericFailure)?;
            (entry.phase.clone(), execute)
        };
        if let Ok(mut current) = phase.lock() {
            *current = WorkPhase::Queued;
        }
        let mut pool = self.inner.pool.borrow_mut();
        if pool.is_none() {
            *pool = Some(WorkPool::new(
                self.inner.options.async_work_threads,
                self.inner.sink.clone(),
            )?);
        }
        let job = PoolJob {
            work: work.0,
            phase,
            execute,
        };
        match pool.as_ref() {
            Some(pool) => pool.jobs.send(job).map_err(|_| Status::GenericFailure),
            None => Err(Status::GenericFailure),
        }
    }

    /// Cancel work that has not started yet. Work already running or finished
    /// cannot be cancelled.
    pub fn cancel_async_work(&self, work: AsyncWork) -> SysResult<()> {
        let phase = self
            .inner
            .works
            .borrow()
            .get(&work.0)
            .map(|entry| entry.phase.clone())
            .ok_or(Status::InvalidArg)?;
        let mut current = phase.lock().map_err(|_| Status::GenericFailure)?;
        if *current != WorkPhase::Queued {
            return Err(Status::GenericFailure);
        }
        *current = WorkPhase::Cancelled;
        drop(current);
        if !self.inner.sink.post(LoopEvent::Complete {
            work: work.0,
            status: Status::Cancelled,
        }) {
            return Err(Status::GenericFailure);
        }
        Ok(())
    }

    pub fn delete_async_work(&self, work: AsyncWork) -> SysResult<()> {
        self.inner
            .works
            .borrow_mut()
            .remove(&work.0)
            .map(|_| ())
            .ok_or(Status::InvalidArg)
    }

    pub(crate) fn complete_async_work(&self, work: u64, status: Status) {
        let complete = self
            .inner
            .works
            .borrow_mut()
            .get_mut(&work)
            .and_then(|entry| entry.complete.take());
        match complete {
            Some(complete) => complete(self, status),
            None => tracing::warn!(work, "completion for unknown async work"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sys::env::tests::test_env;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    fn wait_for_event(sink: &super::super::env::tests::QueueSink) -> LoopEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(event) = sink.events.lock().unwrap().pop() {
                return event;
            }
            assert!(Instant::now() < deadline, "timed out waiting for event");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_work_completes_on_engine_thread() {
        let (env, sink) = test_env();
        let seen = Rc::new(RefCell::new(None));
        let seen_in_complete = seen.clone();
        let work = env.create_async_work(
            Box::new(|| {}),
            Box::new(move |_env, status| {
                *seen_in_complete.borrow_mut() = Some(status);
            }),
        );
        env.queue_async_work(work).unwrap();
        let event = wait_for_event(&sink);
        env.process_event(event);
        assert_eq!(*seen.borrow(), Some(Status::Ok));
        env.delete_async_work(work).unwrap();
        assert_eq!(env.delete_async_work(work), Err(Status::InvalidArg));
    }

    #[test]
    fn test_cancel_after_finish_fails() {
        let (env, sink) = test_env();
        let work = env.create_async_work(Box::new(|| {}), Box::new(|_env, _status| {}));
        env.queue_async_work(work).unwrap();
        let event = wait_for_event(&sink);
        assert_eq!(env.cancel_async_work(work), Err(Status::GenericFailure));
        env.process_event(event);
    }
}
