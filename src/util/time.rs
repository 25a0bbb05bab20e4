//! Time stamps in the forms the protocol and the archive use
// (c) 2025 Ross Younger

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// SOSS header time format (`YYYYmmddHHMMSS.mmm`)
const SOSS_FORMAT: &str = "%Y%m%d%H%M%S%.3f";
/// Suffix appended to a file moved out of the way
const RENAME_FORMAT: &str = ".%Y%m%d-%H%M%S";

/// The current local time in SOSS header form
#[must_use]
pub(crate) fn soss_timestamp() -> String {
    Local::now().format(SOSS_FORMAT).to_string()
}

/// Seconds since the Unix epoch, as recorded in transaction fields
#[must_use]
pub(crate) fn now_seconds() -> f64 {
    epoch_seconds(&Local::now())
}

/// Converts a time to fractional seconds since the Unix epoch
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub(crate) fn epoch_seconds(t: &DateTime<Local>) -> f64 {
    t.timestamp_micros() as f64 / 1e6
}

/// The name a pre-existing file at `path` is moved to, stamped with `when`
#[must_use]
pub(crate) fn aside_path(path: &Path, when: &DateTime<Local>) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(when.format(RENAME_FORMAT).to_string());
    PathBuf::from(s)
}
