//! The test-kind table.
//!
//! Every kind is known at compile time; the selector dispatches on
//! [`SelectionFamily`] rather than on a string-keyed class registry.

use std::fmt;
use std::str::FromStr;

use shoal_core::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestKind {
    CppIntegrationTest,
    CppUnitTest,
    BenchmarkTest,
    CppLibfuzzerTest,
    DbTest,
    JsTest,
    AllVersionsJsTest,
    MultiStmtTxnPassthrough,
    FsmWorkloadTest,
    ParallelFsmWorkloadTest,
    JsonSchemaTest,
    SdamJsonTest,
    ServerSelectionJsonTest,
    PyTest,
    SleepTest,
    MongosTest,
    PrettyPrinterTest,
    TlaPlusTest,
}

/// How a kind's tests are selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionFamily {
    /// JS files carrying inline tags; the full pipeline applies.
    Js,
    /// JS workload files grouped into rolling multi-test groups.
    MultiJs,
    /// Program paths listed in a root file; explicit command-line roots
    /// bypass the filtering pipeline.
    CppProgram,
    /// Names enumerated by running an external binary; no tags.
    DbTest,
    /// Plain file-backed tests without inline tags.
    File,
    /// Opaque names, not backed by files.
    Name,
}

impl TestKind {
    pub const ALL: &'static [TestKind] = &[
        TestKind::CppIntegrationTest,
        TestKind::CppUnitTest,
        TestKind::BenchmarkTest,
        TestKind::CppLibfuzzerTest,
        TestKind::DbTest,
        TestKind::JsTest,
        TestKind::AllVersionsJsTest,
        TestKind::MultiStmtTxnPassthrough,
        TestKind::FsmWorkloadTest,
        TestKind::ParallelFsmWorkloadTest,
        TestKind::JsonSchemaTest,
        TestKind::SdamJsonTest,
        TestKind::ServerSelectionJsonTest,
        TestKind::PyTest,
        TestKind::SleepTest,
        TestKind::MongosTest,
        TestKind::PrettyPrinterTest,
        TestKind::TlaPlusTest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::CppIntegrationTest => "cpp_integration_test",
            TestKind::CppUnitTest => "cpp_unit_test",
            TestKind::BenchmarkTest => "benchmark_test",
            TestKind::CppLibfuzzerTest => "cpp_libfuzzer_test",
            TestKind::DbTest => "db_test",
            TestKind::JsTest => "js_test",
            TestKind::AllVersionsJsTest => "all_versions_js_test",
            TestKind::MultiStmtTxnPassthrough => "multi_stmt_txn_passthrough",
            TestKind::FsmWorkloadTest => "fsm_workload_test",
            TestKind::ParallelFsmWorkloadTest => "parallel_fsm_workload_test",
            TestKind::JsonSchemaTest => "json_schema_test",
            TestKind::SdamJsonTest => "sdam_json_test",
            TestKind::ServerSelectionJsonTest => "server_selection_json_test",
            TestKind::PyTest => "py_test",
            TestKind::SleepTest => "sleep_test",
            TestKind::MongosTest => "mongos_test",
            TestKind::PrettyPrinterTest => "pretty_printer_test",
            TestKind::TlaPlusTest => "tla_plus_test",
        }
    }

    pub fn family(&self) -> SelectionFamily {
        match self {
            TestKind::JsTest
            | TestKind::AllVersionsJsTest
            | TestKind::MultiStmtTxnPassthrough
            | TestKind::FsmWorkloadTest => SelectionFamily::Js,
            TestKind::ParallelFsmWorkloadTest => SelectionFamily::MultiJs,
            TestKind::CppIntegrationTest
            | TestKind::CppUnitTest
            | TestKind::BenchmarkTest
            | TestKind::CppLibfuzzerTest => SelectionFamily::CppProgram,
            TestKind::DbTest => SelectionFamily::DbTest,
            TestKind::JsonSchemaTest
            | TestKind::SdamJsonTest
            | TestKind::ServerSelectionJsonTest
            | TestKind::PyTest
            | TestKind::MongosTest
            | TestKind::PrettyPrinterTest
            | TestKind::TlaPlusTest => SelectionFamily::File,
            TestKind::SleepTest => SelectionFamily::Name,
        }
    }

    /// Whether tests of this kind are identified by file paths.
    pub fn tests_are_files(&self) -> bool {
        !matches!(
            self.family(),
            SelectionFamily::DbTest | SelectionFamily::Name
        )
    }

    /// Whether tests of this kind carry inline tag annotations.
    pub fn has_inline_tags(&self) -> bool {
        matches!(
            self.family(),
            SelectionFamily::Js | SelectionFamily::MultiJs
        )
    }
}

impl FromStr for TestKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        TestKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::config(format!("unknown test kind: {s:?}")))
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
