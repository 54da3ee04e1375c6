//! Bounded retry for optimistic concurrency conflicts.

use tracing::warn;

use crate::command_dispatcher::DispatchError;

/// Run `attempt` until it succeeds, fails with a non-concurrency error, or
/// has been retried `max_retries` times.
///
/// Each attempt must reload its aggregates; the closure receives the attempt
/// number starting at 0. The last concurrency error is returned when the
/// budget runs out.
pub fn with_retries<T>(
    operation: &str,
    max_retries: u32,
    mut attempt: impl FnMut(u32) -> Result<T, DispatchError>,
) -> Result<T, DispatchError> {
    let mut n = 0;
    loop {
        match attempt(n) {
            Err(err) if err.is_concurrency() && n < max_retries => {
                warn!(operation, attempt = n, error = %err, "concurrency conflict, retrying");
                n += 1;
            }
            other => return other,
        }
    }
}
