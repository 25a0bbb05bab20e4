//! Services the interfaces call out to
// (c) 2025 Ross Younger
//!
//! * A [`StatusSource`] answers status requests.
//! * A [`StatusSink`] receives pushed status tables.
//! * A [`FrameIndex`] records the outcome of every file transfer.
//!
//! [`MemoryStatus`] implements both status traits with an in-memory table.
//! [`TracingFrameIndex`] and [`JsonLinesFrameIndex`] are the two shipped frame indexes.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

/// A status value
#[derive(Clone, Debug, PartialEq)]
pub enum StatusValue {
    /// Text
    Text(String),
    /// Integer
    Int(i64),
    /// Real number
    Real(f64),
}

impl StatusValue {
    /// Interprets a token from a status file: integer, then real, else text.
    /// Surrounding double quotes are removed from text.
    #[must_use]
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        if let Ok(i) = token.parse() {
            return StatusValue::Int(i);
        }
        if let Ok(f) = token.parse() {
            return StatusValue::Real(f);
        }
        let unquoted = token
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .unwrap_or(token);
        StatusValue::Text(unquoted.to_string())
    }
}

impl Display for StatusValue {
    /// Text containing whitespace is quoted, unless it already is
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusValue::Int(i) => write!(f, "{i}"),
            StatusValue::Real(r) => write!(f, "{r}"),
            StatusValue::Text(s) => {
                let quoted = s.len() >= 2 && s.starts_with('"') && s.ends_with('"');
                if !quoted && s.contains(char::is_whitespace) {
                    write!(f, "\"{s}\"")
                } else {
                    f.write_str(s)
                }
            }
        }
    }
}

/// Looks up status values by alias
#[async_trait]
pub trait StatusSource: Send + Sync + Debug {
    /// Fetches the named aliases. Aliases that are not known are simply absent from the result.
    async fn fetch(&self, aliases: &[String]) -> anyhow::Result<HashMap<String, StatusValue>>;
}

/// Receives pushed status tables
pub trait StatusSink: Send + Sync + Debug {
    /// Stores one table, verbatim
    fn put_table(&self, table: &str, data: &str) -> anyhow::Result<()>;
}

/// One file transfer, as recorded in the frame index
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    /// Frame id
    pub frame_id: String,
    /// When the transfer started (RFC 3339)
    pub time_start: String,
    /// When it finished (RFC 3339)
    pub time_done: String,
    /// Host the file came from
    pub src_host: String,
    /// Path on that host
    pub src_path: String,
    /// Host the file went to
    pub dst_host: String,
    /// Destination path
    pub dst_path: String,
    /// Transfer method
    pub xfer_method: String,
    /// External command run, if any
    pub xfer_cmd: String,
    /// Exit code of the external command, if any
    pub xfer_code: Option<i32>,
    /// Outcome, in words
    pub res_str: String,
    /// Outcome: 0 is success
    pub res_code: i32,
}

/// Records completed transfers
pub trait FrameIndex: Send + Sync + Debug {
    /// Records one transfer
    fn record_transfer(&self, record: &TransferRecord) -> anyhow::Result<()>;
}

/// An in-memory status table.
///
/// Serves status requests, and stores pushed tables so they can be inspected.
#[derive(Debug, Default)]
pub struct MemoryStatus {
    values: Mutex<HashMap<String, StatusValue>>,
    tables: Mutex<HashMap<String, String>>,
}

impl MemoryStatus {
    /// Constructor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `alias value` lines from a file. Blank lines and `#` comments are ignored.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading status file {}", path.display()))?;
        let status = Self::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((alias, value)) = line.split_once(char::is_whitespace) else {
                anyhow::bail!("{}:{}: expected `alias value`", path.display(), n + 1);
            };
            status.set(alias, StatusValue::parse(value));
        }
        debug!("read {} status values from {}", status.len(), path.display());
        Ok(status)
    }

    /// Sets one value
    pub fn set(&self, alias: &str, value: StatusValue) {
        let _ = self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias.to_string(), value);
    }

    /// Number of values held
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Is it empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The last data pushed for a table
    #[must_use]
    pub fn table(&self, name: &str) -> Option<String> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl StatusSource for MemoryStatus {
    async fn fetch(&self, aliases: &[String]) -> anyhow::Result<HashMap<String, StatusValue>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(aliases
            .iter()
            .filter_map(|a| values.get(a).map(|v| (a.clone(), v.clone())))
            .collect())
    }
}

impl StatusSink for MemoryStatus {
    fn put_table(&self, table: &str, data: &str) -> anyhow::Result<()> {
        let _ = self
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string(), data.to_string());
        Ok(())
    }
}

/// A frame index that only logs
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingFrameIndex;

impl FrameIndex for TracingFrameIndex {
    fn record_transfer(&self, r: &TransferRecord) -> anyhow::Result<()> {
        info!(
            frame = %r.frame_id,
            method = %r.xfer_method,
            code = r.res_code,
            "{}:{} -> {}: {}",
            r.src_host,
            r.src_path,
            r.dst_path,
            r.res_str
        );
        Ok(())
    }
}

/// A frame index that appends one JSON object per line to a file
#[derive(Debug)]
pub struct JsonLinesFrameIndex {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesFrameIndex {
    /// Constructor. The file is created on first use.
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }
}

impl FrameIndex for JsonLinesFrameIndex {
    fn record_transfer(&self, record: &TransferRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening transfer log {}", self.path.display()))?;
        f.write_all(line.as_bytes())
            .with_context(|| format!("writing transfer log {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io::Write as _;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::{
        FrameIndex as _, JsonLinesFrameIndex, MemoryStatus, StatusSink as _, StatusSource as _,
        StatusValue, TransferRecord,
    };

    #[rstest]
    #[case("42", StatusValue::Int(42), "42")]
    #[case("2.5", StatusValue::Real(2.5), "2.5")]
    #[case("OPEN", StatusValue::Text("OPEN".into()), "OPEN")]
    #[case("\"NOT READY\"", StatusValue::Text("NOT READY".into()), "\"NOT READY\"")]
    fn values(#[case] token: &str, #[case] value: StatusValue, #[case] shown: &str) {
        let v = StatusValue::parse(token);
        assert_eq!(v, value);
        assert_eq!(v.to_string(), shown);
    }

    #[test]
    fn already_quoted_text_is_left_alone() {
        let v = StatusValue::Text("\"A B\"".into());
        assert_eq!(v.to_string(), "\"A B\"");
    }

    #[tokio::test]
    async fn memory_status_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# comment\nSTATS.AZ 123.5\n\nTSCS.STATE \"GUIDING ON\"").unwrap();
        let s = MemoryStatus::from_file(f.path()).unwrap();
        assert_eq!(s.len(), 2);
        let got = s
            .fetch(&["STATS.AZ".into(), "NOPE".into(), "TSCS.STATE".into()])
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got["STATS.AZ"], StatusValue::Real(123.5));
        assert_eq!(got["TSCS.STATE"].to_string(), "\"GUIDING ON\"");

        s.put_table("TSCL", "0123").unwrap();
        assert_eq!(s.table("TSCL").as_deref(), Some("0123"));
    }

    #[test]
    fn json_lines_index_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xfer.log");
        let index = JsonLinesFrameIndex::new(&path);
        for id in ["A1", "A2"] {
            index
                .record_transfer(&TransferRecord {
                    frame_id: id.into(),
                    res_code: 0,
                    ..Default::default()
                })
                .unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["frame_id"], "A2");
        assert_eq!(lines[0]["xfer_code"], serde_json::Value::Null);
    }
}
