//! Fetching a file from the OBCP
// (c) 2025 Ross Younger

use std::path::Path;
use std::process::Stdio;

use chrono::Local;
use serde::{Deserialize, Serialize, de};
use strum::VariantNames as _;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::interface::Error;
use crate::interface::collaborators::TransferRecord;

/// How files are fetched. One method is used for every file an archive interface handles.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
    clap::ValueEnum,
    Serialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum TransferMethod {
    /// Local filesystem copy (the source path must be visible here)
    Copy,
    /// `scp user@host:src dst`; passwordless login is assumed
    Scp,
    /// FTP, via `lftp`
    #[default]
    Ftp,
    /// FTP with TLS, via `lftp`
    Ftps,
    /// SFTP, via `lftp`
    Sftp,
    /// In-band: the OBCP pushes the data to our FITS data program
    Rpc,
}

impl<'de> Deserialize<'de> for TransferMethod {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| de::Error::unknown_variant(&s, TransferMethod::VARIANTS))
    }
}

/// Settings common to every `lftp` transfer
pub const LFTP_SETUP: &str = concat!(
    "set xfer:log yes; ",
    "set net:max-retries 1; ",
    "set net:reconnect-interval-max 2; ",
    "set net:reconnect-interval-base 2; ",
    "set xfer:disk-full-fatal true;",
);
const FTP_SETUP: &str = " set ftp:use-feat no; set ftp:use-mdtm no;";
const TLS_SETUP: &str = " set ftp:ssl-force yes;";

/// The login name to use when none is configured: `$LOGNAME`, else `anonymous`
#[must_use]
pub fn default_username() -> String {
    std::env::var("LOGNAME")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// One file to fetch
#[derive(Clone, Copy, Debug)]
pub struct Fetch<'a> {
    /// Host holding the file
    pub host: &'a str,
    /// Path on that host
    pub path: &'a str,
    /// Where to put it
    pub dest: &'a Path,
    /// Login name
    pub username: &'a str,
    /// Non-standard port, if any
    pub port: Option<u16>,
}

/// The external command that fetches a file, if the method uses one
#[must_use]
pub fn command_line(method: TransferMethod, fetch: &Fetch<'_>) -> Option<Vec<String>> {
    let dest = fetch.dest.display();
    let setup = match method {
        TransferMethod::Copy | TransferMethod::Rpc => return None,
        TransferMethod::Scp => {
            return Some(vec![
                "scp".into(),
                format!("{}@{}:{}", fetch.username, fetch.host, fetch.path),
                dest.to_string(),
            ]);
        }
        TransferMethod::Ftp => format!("{LFTP_SETUP}{FTP_SETUP}"),
        TransferMethod::Ftps | TransferMethod::Sftp => {
            format!("{LFTP_SETUP}{FTP_SETUP}{TLS_SETUP}")
        }
    };
    let url = match fetch.port {
        Some(port) => format!("{method}://{}:{port}", fetch.host),
        None => format!("{method}://{}", fetch.host),
    };
    Some(vec![
        "lftp".into(),
        "-e".into(),
        format!("{setup} get {} -o {dest}; exit", fetch.path),
        "-u".into(),
        fetch.username.to_string(),
        url,
    ])
}

/// Renders a command line for logs, quoting words that need it
fn render(argv: &[String]) -> String {
    argv.iter()
        .map(|a| {
            if a.is_empty() || a.contains(|c: char| c.is_whitespace() || c == ';' || c == '\'') {
                format!("'{}'", a.replace('\'', r"'\''"))
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fetches a file with a side-channel method (anything except [`TransferMethod::Rpc`]),
/// filling in the transfer record as it goes
pub async fn fetch_file(
    method: TransferMethod,
    fetch: &Fetch<'_>,
    record: &mut TransferRecord,
) -> Result<(), Error> {
    info!(
        "transfer file ({method}): {} <-- {}",
        fetch.dest.display(),
        fetch.path
    );
    record.time_start = Local::now().to_rfc3339();
    record.src_host = fetch.host.to_string();
    record.src_path = fetch.path.to_string();
    record.dst_path = fetch.dest.display().to_string();
    record.xfer_method = method.to_string();

    let result = match command_line(method, fetch) {
        Some(argv) => run(&argv, record).await,
        None if method == TransferMethod::Copy => {
            tokio::fs::copy(fetch.path, fetch.dest)
                .await
                .map(|_| ())
                .map_err(|e| Error::Transfer(format!("copying {}: {e}", fetch.path)))
        }
        None => Err(Error::Transfer(format!(
            "{method} transfers need the in-band receiver"
        ))),
    };
    record.time_done = Local::now().to_rfc3339();
    if let Err(e) = &result {
        record.res_str = e.to_string();
    }
    result
}

async fn run(argv: &[String], record: &mut TransferRecord) -> Result<(), Error> {
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::Transfer("empty command".into()));
    };
    let cmd = render(argv);
    debug!("{cmd}");
    record.xfer_cmd.clone_from(&cmd);
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| {
            record.xfer_code = Some(-1);
            error!("command was: {cmd}");
            Error::Transfer(format!("could not run {program}: {e}"))
        })?;
    record.xfer_code = status.code();
    if status.success() {
        Ok(())
    } else {
        error!("command was: {cmd}");
        Err(Error::Transfer(format!("{program} failed: {status}")))
    }
}
