//! Worker-thread coordination for background hooks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use shoal_core::{Error, Result};

use crate::ContinuousDynamicTestCase;

/// One pausable worker thread per background hook.
///
/// The executor hands the job a fresh [`ContinuousDynamicTestCase`] via
/// [`resume`](Self::resume) after each `before_test`, and collects it with
/// [`pause`](Self::pause) during `after_test`. A failure inside the case is
/// captured and returned from the matching `pause`.
pub struct BackgroundJob {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
    hook_name: String,
}

struct Inner {
    state: Mutex<JobState>,
    wake: Condvar,
}

struct JobState {
    case: Option<ContinuousDynamicTestCase>,
    /// Stop flag of the case currently owned by the worker.
    stop_flag: Option<Arc<AtomicBool>>,
    should_resume: bool,
    should_stop: bool,
    idle: bool,
    exc: Option<Error>,
}

impl BackgroundJob {
    pub fn spawn(hook_name: impl Into<String>) -> Self {
        let hook_name = hook_name.into();
        let inner = Arc::new(Inner {
            state: Mutex::new(JobState {
                case: None,
                stop_flag: None,
                should_resume: false,
                should_stop: false,
                idle: true,
                exc: None,
            }),
            wake: Condvar::new(),
        });

        let for_thread = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("shoal-bg-{hook_name}"))
            .spawn(move || worker_loop(for_thread))
            .expect("failed to spawn background hook thread");

        Self {
            inner,
            handle: Some(handle),
            hook_name,
        }
    }

    pub fn hook_name(&self) -> &str {
        &self.hook_name
    }

    /// Hand `case` to the worker and wake it. Exactly one dynamic run starts
    /// per resume; resuming while the worker is still busy is a harness bug.
    pub fn resume(&self, case: ContinuousDynamicTestCase) -> Result<()> {
        let mut state = self
            .inner
            .state
            .lock()
            .expect("background job lock poisoned");
        if !state.idle || state.should_resume {
            return Err(Error::internal(format!(
                "background job {} resumed while still active",
                self.hook_name
            )));
        }
        state.stop_flag = Some(case.stop_handle());
        state.case = Some(case);
        state.should_resume = true;
        state.idle = false;
        self.inner.wake.notify_all();
        Ok(())
    }

    /// Ask the current case to stop and wait for the worker to go idle.
    /// Returns the error the case failed with, if any.
    pub fn pause(&self) -> Result<()> {
        let mut state = self
            .inner
            .state
            .lock()
            .expect("background job lock poisoned");
        if let Some(flag) = &state.stop_flag {
            flag.store(true, Ordering::SeqCst);
        }
        while !state.idle {
            state = self
                .inner
                .wake
                .wait(state)
                .expect("background job lock poisoned");
        }
        state.stop_flag = None;
        match state.exc.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop the worker thread and join it. Any error left by a final
    /// iteration is returned.
    pub fn stop(mut self) -> Result<()> {
        let pending = {
            let mut state = self
                .inner
                .state
                .lock()
                .expect("background job lock poisoned");
            state.should_stop = true;
            if let Some(flag) = &state.stop_flag {
                flag.store(true, Ordering::SeqCst);
            }
            self.inner.wake.notify_all();
            state.exc.take()
        };

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                return Err(Error::internal(format!(
                    "background job {} worker panicked",
                    self.hook_name
                )));
            }
        }

        match pending {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for BackgroundJob {
    fn drop(&mut self) {
        // Stragglers happen when the executor bails out early; make sure the
        // worker can exit so the process doesn't hang on join.
        if let Some(handle) = self.handle.take() {
            if let Ok(mut state) = self.inner.state.lock() {
                state.should_stop = true;
                if let Some(flag) = &state.stop_flag {
                    flag.store(true, Ordering::SeqCst);
                }
                self.inner.wake.notify_all();
            }
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let mut case = {
            let mut state = inner.state.lock().expect("background job lock poisoned");
            while !state.should_resume && !state.should_stop {
                state = inner
                    .wake
                    .wait(state)
                    .expect("background job lock poisoned");
            }
            if state.should_stop {
                state.idle = true;
                inner.wake.notify_all();
                return;
            }
            state.should_resume = false;
            state.case.take()
        };

        let result = match case.as_mut() {
            Some(case) => case.run().map(|_| ()),
            None => Ok(()),
        };

        let mut state = inner.state.lock().expect("background job lock poisoned");
        if let Err(err) = result {
            state.exc = Some(err);
        }
        state.idle = true;
        inner.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DynamicTestCase;
    use shoal_testing::{ConnectionInfo, TestCase, TestOutcome, TestStatus};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct LoopedCase {
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    impl TestCase for LoopedCase {
        fn display_name(&self) -> &str {
            "looped"
        }

        fn configure(&mut self, _connection: &ConnectionInfo) -> Result<()> {
            Ok(())
        }

        fn run(&mut self) -> Result<TestOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            // Keep iterations short so pause() lands quickly.
            std::thread::sleep(Duration::from_millis(5));
            if self.fail {
                return Ok(TestOutcome {
                    status: TestStatus::Failed,
                    return_code: Some(1),
                    duration: Duration::ZERO,
                    message: Some("probe tripped".to_string()),
                });
            }
            Ok(TestOutcome::passed(Duration::ZERO))
        }
    }

    fn connection() -> ConnectionInfo {
        ConnectionInfo {
            connection_string: "localhost:20000".to_string(),
            driver_url: "mongodb://localhost:20000".to_string(),
        }
    }

    fn case(runs: &Arc<AtomicUsize>, fail: bool) -> ContinuousDynamicTestCase {
        let inner = DynamicTestCase::new(
            "hook",
            "test",
            Box::new(LoopedCase {
                runs: Arc::clone(runs),
                fail,
            }),
            &connection(),
        )
        .unwrap();
        ContinuousDynamicTestCase::new(inner)
    }

    #[test]
    fn resume_runs_the_case_at_least_once_before_pause() {
        let runs = Arc::new(AtomicUsize::new(0));
        let job = BackgroundJob::spawn("TestHook");

        job.resume(case(&runs, false)).unwrap();
        job.pause().unwrap();
        let after_first = runs.load(Ordering::SeqCst);
        assert!(after_first >= 1);

        // The pair is reusable across tests.
        job.resume(case(&runs, false)).unwrap();
        job.pause().unwrap();
        assert!(runs.load(Ordering::SeqCst) > after_first);

        job.stop().unwrap();
    }

    #[test]
    fn double_resume_is_a_harness_bug() {
        let runs = Arc::new(AtomicUsize::new(0));
        let job = BackgroundJob::spawn("TestHook");

        job.resume(case(&runs, false)).unwrap();
        let err = job.resume(case(&runs, false)).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        job.pause().unwrap();
        job.stop().unwrap();
    }

    #[test]
    fn pause_surfaces_the_case_failure() {
        let runs = Arc::new(AtomicUsize::new(0));
        let job = BackgroundJob::spawn("TestHook");

        job.resume(case(&runs, true)).unwrap();
        let err = job.pause().unwrap_err();
        assert!(matches!(err, Error::TestFailure(_)));
        assert!(err.to_string().contains("probe tripped"));

        job.stop().unwrap();
    }
}
