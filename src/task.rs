//! Scoped execution wrapper for the pipeline's long-running steps.
//!
//! Logs the step label, runs the closure, logs the measured duration on
//! the way out. This is the explicit form of the original tool's
//! decorator-based logging/timing.

use std::time::Instant;

/// Run `f` with start/end logging and duration measurement.
///
/// The label is logged before the work starts; completion or failure is
/// logged with the elapsed wall time.
pub fn scoped<T, E, F>(label: &str, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: std::fmt::Display,
{
    log::info!("{label}");
    let start = Instant::now();
    let result = f();
    let elapsed = start.elapsed();
    match &result {
        Ok(_) => log::info!("{label} done in {:.1}s", elapsed.as_secs_f64()),
        Err(e) => log::warn!("{label} failed after {:.1}s: {e}", elapsed.as_secs_f64()),
    }
    result
}
