//! Process exit codes of the top-level entry points.

/// All selected tests passed.
pub const SUCCESS: i32 = 0;
/// At least one test or hook failed.
pub const TEST_FAILURE: i32 = 1;
/// Malformed configuration: unknown test kind, conflicting selector options,
/// unparseable tag expression, unknown hook class.
pub const CONFIG_ERROR: i32 = 2;
/// The fixture could not be set up or never became ready.
pub const FIXTURE_FAILURE: i32 = 3;

/// Map an error to the exit code the entry points report for it.
pub fn code_for(err: &crate::Error) -> i32 {
    match err {
        crate::Error::Config(_) => CONFIG_ERROR,
        crate::Error::ServerFailure(_) | crate::Error::StopExecution(_) => FIXTURE_FAILURE,
        _ => TEST_FAILURE,
    }
}
