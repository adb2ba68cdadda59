//! Panic recovery around user callouts.
//!
//! Function logic, sources, duties, governance and handlers are user code.
//! A panic in any of them becomes an error escalated like any other failure
//! instead of unwinding through a team's worker.

use crate::types::{Error, Result};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Run a callout, converting a panic into [`Error::Internal`].
///
/// # Example
/// ```
/// use office_kernel::kernel::with_recovery;
///
/// let result: office_kernel::Result<u32> = with_recovery(|| Ok(7), "parse_order");
/// assert_eq!(result.unwrap(), 7);
/// ```
pub fn with_recovery<F, T>(callout: F, callout_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(callout)) {
        Ok(result) => result,
        Err(payload) => {
            let panic_msg = panic_message(payload.as_ref());
            tracing::error!(callout = %callout_name, panic = %panic_msg, "panic_recovered");
            Err(Error::internal(format!("Panic in {}: {}", callout_name, panic_msg)))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callout_result_passes_through() {
        assert_eq!(with_recovery(|| Ok(42), "answer").unwrap(), 42);

        let result: Result<()> = with_recovery(|| Err(Error::sourcing("db unreachable")), "db");
        assert!(result.unwrap_err().to_string().contains("db unreachable"));
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let result: Result<()> = with_recovery(|| panic!("boom"), "load_order");
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(err.to_string().contains("Panic in load_order: boom"));
    }

    #[test]
    fn test_formatted_panic_message() {
        let result: Result<()> = with_recovery(|| panic!("{} failed", "enlist"), "tx");
        assert!(result.unwrap_err().to_string().contains("enlist failed"));
    }

    #[test]
    fn test_panic_message_for_opaque_payload() {
        let payload = std::panic::catch_unwind(|| std::panic::panic_any(17u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "Unknown panic (no message)");
    }
}
