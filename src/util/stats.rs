//! Transfer statistics output
// (c) 2024 Ross Younger

use std::fmt::Display;
use std::time::Duration;

use human_repr::{HumanCount as _, HumanDuration as _, HumanThroughput as _};

/// Human friendly output helper
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataRate {
    /// Bytes per second; if None, we were unable to compute a rate.
    rate: Option<f64>,
}

impl DataRate {
    /// Standard constructor
    #[must_use]
    pub(crate) fn new(bytes: u64, time: Duration) -> Self {
        if time.is_zero() {
            // divide by zero is not meaningful
            return Self { rate: None };
        }
        Self {
            #[allow(clippy::cast_precision_loss)]
            rate: Some((bytes as f64) / time.as_secs_f64()),
        }
    }

    /// Accessor
    #[must_use]
    pub(crate) fn byte_rate(&self) -> Option<f64> {
        self.rate
    }
}

impl Display for DataRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.byte_rate() {
            None => f.write_str("unknown"),
            Some(rate) => rate.human_throughput_bytes().fmt(f),
        }
    }
}

/// One-line summary of a completed batch
#[must_use]
pub(crate) fn batch_summary(files: usize, bytes: u64, elapsed: Duration) -> String {
    format!(
        "{files} file(s), {} in {} ({})",
        bytes.human_count_bytes(),
        elapsed.human_duration(),
        DataRate::new(bytes, elapsed)
    )
}
