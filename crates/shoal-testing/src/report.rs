//! Run report: every primary and hook-synthesized test result lands here.

use crate::{TestOutcome, TestStatus};

/// One recorded result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub display_name: String,
    pub outcome: TestOutcome,
    /// Name of the hook that produced this entry, if it was not a primary
    /// test.
    pub hook: Option<String>,
}

/// Where recorded results go. The in-memory [`Report`] is the default;
/// external serializers implement the same trait.
pub trait ReportSink: Send {
    fn add_test(&mut self, entry: ReportEntry);
}

#[derive(Debug, Default)]
pub struct Report {
    entries: Vec<ReportEntry>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn num_passed(&self) -> usize {
        self.count(TestStatus::Passed)
    }

    pub fn num_failed(&self) -> usize {
        self.count(TestStatus::Failed)
    }

    pub fn num_errored(&self) -> usize {
        self.count(TestStatus::Errored)
    }

    pub fn all_passed(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| entry.outcome.status == TestStatus::Passed)
    }

    fn count(&self, status: TestStatus) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.outcome.status == status)
            .count()
    }
}

impl ReportSink for Report {
    fn add_test(&mut self, entry: ReportEntry) {
        tracing::info!(
            target: "shoal::report",
            test = %entry.display_name,
            status = ?entry.outcome.status,
            hook = entry.hook.as_deref(),
            "recorded result"
        );
        self.entries.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(name: &str, status: TestStatus) -> ReportEntry {
        ReportEntry {
            display_name: name.to_string(),
            outcome: TestOutcome {
                status,
                return_code: None,
                duration: Duration::ZERO,
                message: None,
            },
            hook: None,
        }
    }

    #[test]
    fn counts_follow_recorded_statuses() {
        let mut report = Report::new();
        assert!(report.all_passed());

        report.add_test(entry("a.js", TestStatus::Passed));
        report.add_test(entry("b.js", TestStatus::Failed));
        report.add_test(entry("c.js", TestStatus::Errored));
        report.add_test(entry("d.js", TestStatus::Passed));

        assert_eq!(report.num_passed(), 2);
        assert_eq!(report.num_failed(), 1);
        assert_eq!(report.num_errored(), 1);
        assert!(!report.all_passed());
        assert_eq!(report.entries().len(), 4);
    }
}
