//! Test cases synthesized at runtime by hooks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shoal_core::Result;
use shoal_testing::{ConnectionInfo, TestCase, TestOutcome};

/// A hook-made test case wrapping a real one. The display name ties the
/// probe to the test it ran against (`test:hook`).
pub struct DynamicTestCase {
    display_name: String,
    case: Box<dyn TestCase>,
}

impl DynamicTestCase {
    pub fn new(
        hook_name: &str,
        test_name: &str,
        mut case: Box<dyn TestCase>,
        connection: &ConnectionInfo,
    ) -> Result<Self> {
        case.configure(connection)?;
        Ok(Self {
            display_name: format!("{test_name}:{hook_name}"),
            case,
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn run(&mut self) -> Result<TestOutcome> {
        self.case.run()
    }
}

/// A dynamic case that loops its embedded case until told to stop.
///
/// `signal_stop` never interrupts an in-flight iteration; the current run
/// completes and the loop exits afterwards.
pub struct ContinuousDynamicTestCase {
    inner: DynamicTestCase,
    should_stop: Arc<AtomicBool>,
}

impl ContinuousDynamicTestCase {
    pub fn new(inner: DynamicTestCase) -> Self {
        Self {
            inner,
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn display_name(&self) -> &str {
        self.inner.display_name()
    }

    /// A handle the controlling thread keeps to stop the loop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.should_stop)
    }

    pub fn signal_stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }

    /// Run the embedded case repeatedly. Returns the number of completed
    /// iterations; the first failing iteration aborts the loop with its
    /// error.
    pub fn run(&mut self) -> Result<usize> {
        let mut iterations = 0;
        loop {
            let outcome = self.inner.run()?;
            iterations += 1;
            outcome.into_result(self.inner.display_name())?;
            if self.should_stop.load(Ordering::SeqCst) {
                tracing::debug!(
                    target: "shoal::hooks",
                    case = %self.inner.display_name(),
                    iterations,
                    "continuous case stopped"
                );
                return Ok(iterations);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::Error;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct ScriptedCase {
        runs: Arc<AtomicUsize>,
        fail_on: Option<usize>,
        stop_after: Option<(usize, Arc<AtomicBool>)>,
    }

    impl TestCase for ScriptedCase {
        fn display_name(&self) -> &str {
            "scripted"
        }

        fn configure(&mut self, _connection: &ConnectionInfo) -> Result<()> {
            Ok(())
        }

        fn run(&mut self) -> Result<TestOutcome> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, flag)) = &self.stop_after {
                if run >= *after {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            if self.fail_on == Some(run) {
                return Ok(TestOutcome {
                    status: shoal_testing::TestStatus::Failed,
                    return_code: Some(1),
                    duration: Duration::ZERO,
                    message: Some("scripted failure".to_string()),
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

    #[test]
    fn display_name_ties_probe_to_test() {
        let runs = Arc::new(AtomicUsize::new(0));
        let case = DynamicTestCase::new(
            "CheckReplDBHash",
            "jstests/core/find.js",
            Box::new(ScriptedCase {
                runs,
                fail_on: None,
                stop_after: None,
            }),
            &connection(),
        )
        .unwrap();
        assert_eq!(case.display_name(), "jstests/core/find.js:CheckReplDBHash");
    }

    #[test]
    fn continuous_case_loops_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let inner = DynamicTestCase::new(
            "hook",
            "test",
            Box::new(ScriptedCase {
                runs: Arc::clone(&runs),
                fail_on: None,
                stop_after: None,
            }),
            &connection(),
        )
        .unwrap();
        let mut case = ContinuousDynamicTestCase::new(inner);

        // Have the case flip its own stop flag after three iterations.
        let flag = case.stop_handle();
        case.inner.case = Box::new(ScriptedCase {
            runs: Arc::clone(&runs),
            fail_on: None,
            stop_after: Some((3, flag)),
        });

        let iterations = case.run().unwrap();
        assert_eq!(iterations, 3);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn continuous_case_aborts_on_first_failure() {
        let runs = Arc::new(AtomicUsize::new(0));
        let inner = DynamicTestCase::new(
            "hook",
            "test",
            Box::new(ScriptedCase {
                runs: Arc::clone(&runs),
                fail_on: Some(2),
                stop_after: None,
            }),
            &connection(),
        )
        .unwrap();
        let mut case = ContinuousDynamicTestCase::new(inner);

        let err = case.run().unwrap_err();
        assert!(matches!(err, Error::TestFailure(_)));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
