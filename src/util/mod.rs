//! General utility code that didn't fit anywhere else
//!
//! Note that most of this module is not exported.
// (c) 2024 Ross Younger

pub(crate) mod stats;
pub(crate) mod time;

mod tracing;
pub use tracing::TimeFormat;
pub(crate) use tracing::{
    ConsoleTraceType, is_initialized as tracing_is_initialised, setup as setup_tracing,
    trace_level,
};

mod port_range;
pub use port_range::PortRange;

#[cfg(test)]
pub(crate) mod littertray;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
pub(crate) mod test_protocol;
