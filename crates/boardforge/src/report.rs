use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{error, info, warn};

/// Run-wide log fanout. Per-target and per-file failures are reported here
/// and counted instead of unwinding; the final exit status is derived from
/// the error count.
#[derive(Debug, Default)]
pub struct Reporter {
    warnings: AtomicUsize,
    errors: AtomicUsize,
}

impl Reporter {
    pub fn info(&self, msg: &str) {
        info!("{msg}");
    }

    pub fn ok(&self, msg: &str) {
        info!("{msg}");
    }

    pub fn warn(&self, msg: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        warn!("{msg}");
    }

    pub fn error(&self, msg: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        error!("{msg}");
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_warnings_and_errors_separately() {
        let r = Reporter::default();
        r.info("hello");
        r.warn("careful");
        r.error("broken");
        r.error("still broken");
        assert_eq!(r.warning_count(), 1);
        assert_eq!(r.error_count(), 2);
    }
}
