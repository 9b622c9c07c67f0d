//! Runtime invariant checks with contract-test support.
//!
//! Production code asserts invariants through [`assert_invariant!`]; every
//! check is recorded so a test can later prove a given invariant was actually
//! exercised, not merely declared.
//!
//! ```rust,ignore
//! use crabview::invariant_ppt::*;
//!
//! assert_invariant!(
//!     self.transport.is_none(),
//!     "Teardown leaves no live session resources",
//!     "stream_controller"
//! );
//!
//! #[test]
//! fn contract_teardown() {
//!     contract_test("teardown", &["Teardown leaves no live session resources"]);
//! }
//! ```
//!
//! The log is process-wide because controller tasks run on tokio worker
//! threads, not on the thread that runs the test.

use std::collections::HashSet;
use std::sync::Mutex;

lazy_static::lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Assert an invariant and log it for contract testing.
///
/// # Arguments
/// * `condition` - The invariant condition (must be true)
/// * `message` - Description of the invariant
/// * `context` - Optional context (module/function name)
///
/// # Panics
/// Panics if the condition is false.
#[macro_export]
macro_rules! assert_invariant {
    ($condition:expr, $message:expr) => {
        $crate::invariant_ppt::__assert_invariant_impl($condition, $message, None)
    };
    ($condition:expr, $message:expr, $context:expr) => {
        $crate::invariant_ppt::__assert_invariant_impl($condition, $message, Some($context))
    };
}

#[doc(hidden)]
pub fn __assert_invariant_impl(condition: bool, message: &str, context: Option<&str>) {
    if let Ok(mut log) = INVARIANT_LOG.lock() {
        log.insert(message.to_string());
    }

    if !condition {
        let ctx = context.unwrap_or("unknown");
        log::error!("Invariant violated [{}]: {}", ctx, message);
        panic!("INVARIANT VIOLATION [{}]: {}", ctx, message);
    }
}

/// Whether an invariant has been checked since the log was last cleared.
pub fn invariant_checked(message: &str) -> bool {
    INVARIANT_LOG
        .lock()
        .map(|log| log.contains(message))
        .unwrap_or(false)
}

/// Check that specific invariants were verified during test execution.
///
/// # Panics
/// Panics if any required invariant was not checked.
pub fn contract_test(test_name: &str, required_invariants: &[&str]) {
    let missing: Vec<&str> = required_invariants
        .iter()
        .copied()
        .filter(|invariant| !invariant_checked(invariant))
        .collect();

    if !missing.is_empty() {
        panic!(
            "CONTRACT FAILURE [{}]: The following invariants were not checked:\n  - {}",
            test_name,
            missing.join("\n  - ")
        );
    }
}

/// Clear the invariant log
pub fn clear_invariant_log() {
    if let Ok(mut log) = INVARIANT_LOG.lock() {
        log.clear();
    }
}
