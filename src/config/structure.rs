//! Configuration structure
// (c) 2024 Ross Younger

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use figment::providers::Serialized;
use figment::value::{Dict, Map};
use figment::{Metadata, Profile, Provider};
use serde::{Deserialize, Serialize};

use crate::container::{InterfaceKind, parse_interfaces};
use crate::interface::HostFilter;
use crate::interface::archive::{ArchiveSettings, TransferMethod};
use crate::protocol::service::{MAX_MONITOR_UNIT, MAX_OBCP};
use crate::server::ServerOptions;
use crate::transport::{Protocol, RetryPolicy};
use crate::util::{PortRange, TimeFormat};

/// The set of configurable options supported by insint.
///
/// **Note:** The configuration file is parsed into this structure via figment.
/// Command line options come from [`ConfigOverrides`], which carries the same fields as options.
///
/// Every field has a default; see [`Configuration::system_default`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    // INSTRUMENT ===============================================================================
    /// Number of the instrument control computer (OBCP) we talk to, 1 to 32
    pub obcp_num: u8,
    /// Host name of the OBCP
    pub obcp_host: String,
    /// Fixed port for calls we make to the OBCP and its peers.
    /// 0 means ask the portmapper.
    pub obcp_port: u16,
    /// The name we give for ourselves in message headers
    pub my_host: String,

    // INTERFACES ===============================================================================
    /// Interfaces to run: any of `cmd`, `thru`, `sreq`, `sdst`, `file`
    /// (comma or space separated)
    pub interfaces: String,
    /// Hosts allowed to make requests of us (comma or space separated).
    /// Empty means allow everyone.
    pub host_filter: String,
    /// Status push unit we listen for, 1 to 5
    pub monitor_unit: u8,
    /// Worker pool size. 0 means work it out from the number of interfaces.
    pub num_threads: usize,

    // NETWORK ==================================================================================
    /// RPC protocol to serve and call with
    pub protocol: Protocol,
    /// Ports our servers may bind
    pub port_range: PortRange,
    /// Register our servers with the local portmapper
    pub portmapper: bool,
    /// Initial wait for a reply to a datagram call, in seconds
    pub rpc_timeout: f64,
    /// Longest wait between datagram resends, in seconds
    pub rpc_max_interval: u64,
    /// Number of datagram resends
    pub rpc_retries: u32,

    // ARCHIVE ==================================================================================
    /// Directory frames are saved into
    pub fits_dir: PathBuf,
    /// How frame files are fetched
    pub transfer_method: TransferMethod,
    /// Login name for file transfers. Empty means `$LOGNAME`.
    pub username: String,
    /// Port for file transfers. 0 means the protocol's usual port.
    pub transfer_port: u16,
    /// Port for the in-band FITS data server
    pub fits_port: u16,
    /// Maximum number of files fetched at once
    pub group_size: usize,
    /// How long a group of file transfers may take, in seconds
    pub data_timeout: u64,
    /// How long to wait for an in-band frame to arrive, in seconds
    pub inband_timeout: u64,
    /// Append a JSON record of every file transfer to this file
    pub transfer_log: Option<PathBuf>,
    /// Seed the status table from this file (`alias value` lines)
    pub status_file: Option<PathBuf>,

    // LOGGING ==================================================================================
    /// Log to this file as well as the console
    pub log_file: Option<String>,
    /// Time format for log messages
    pub time_format: TimeFormat,
}

/// Our short host name, lower-cased
fn local_host_name() -> String {
    let name = gethostname::gethostname().to_string_lossy().to_lowercase();
    match name.split_once('.') {
        Some((short, _)) => short.to_string(),
        None => name,
    }
}

static SYSTEM_DEFAULT_CONFIG: LazyLock<Configuration> = LazyLock::new(|| Configuration {
    obcp_num: 9,
    obcp_host: "localhost".into(),
    obcp_port: 0,
    my_host: local_host_name(),
    interfaces: "cmd,file,sreq,sdst".into(),
    host_filter: String::new(),
    monitor_unit: 3,
    num_threads: 0,
    protocol: Protocol::Tcp,
    port_range: PortRange {
        begin: 20000,
        end: 30000,
    },
    portmapper: true,
    rpc_timeout: 1.0,
    rpc_max_interval: 25,
    rpc_retries: 5,
    fits_dir: PathBuf::from("/tmp"),
    transfer_method: TransferMethod::Ftp,
    username: String::new(),
    transfer_port: 0,
    fits_port: 8991,
    group_size: 10,
    data_timeout: 240,
    inband_timeout: 25,
    transfer_log: None,
    status_file: None,
    log_file: None,
    time_format: TimeFormat::Local,
});

impl Default for Configuration {
    fn default() -> Self {
        SYSTEM_DEFAULT_CONFIG.clone()
    }
}

impl Configuration {
    /// Hard-wired configuration defaults
    #[must_use]
    pub fn system_default() -> &'static Self {
        &SYSTEM_DEFAULT_CONFIG
    }

    /// The names of every configuration field
    pub(crate) fn field_names() -> Vec<String> {
        match serde_json::to_value(Self::system_default()) {
            Ok(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Performs additional validation checks on the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=MAX_OBCP).contains(&self.obcp_num),
            "obcp_num must be between 1 and {MAX_OBCP} (got {})",
            self.obcp_num
        );
        anyhow::ensure!(
            (1..=MAX_MONITOR_UNIT).contains(&self.monitor_unit),
            "monitor_unit must be between 1 and {MAX_MONITOR_UNIT} (got {})",
            self.monitor_unit
        );
        anyhow::ensure!(!self.obcp_host.is_empty(), "obcp_host must be set");
        anyhow::ensure!(!self.my_host.is_empty(), "my_host must be set");
        anyhow::ensure!(self.group_size > 0, "group_size must be at least 1");
        anyhow::ensure!(
            self.rpc_timeout.is_finite() && self.rpc_timeout > 0.0,
            "rpc_timeout must be positive"
        );
        let kinds = self.interface_kinds()?;
        anyhow::ensure!(!kinds.is_empty(), "no interfaces configured");
        Ok(())
    }

    /// The interfaces to run
    pub fn interface_kinds(&self) -> anyhow::Result<Vec<InterfaceKind>> {
        parse_interfaces(&self.interfaces)
    }

    /// Hosts allowed to make requests
    #[must_use]
    pub fn allowed_hosts(&self) -> HostFilter {
        HostFilter::new(
            self.host_filter
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty()),
        )
    }

    /// Resend schedule for outgoing datagram calls
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::try_from_secs_f64(self.rpc_timeout)
                .unwrap_or(RetryPolicy::default().initial),
            max_interval: Duration::from_secs(self.rpc_max_interval),
            retries: self.rpc_retries,
        }
    }

    /// Fixed port for outgoing calls, if there is one
    #[must_use]
    pub fn call_port(&self) -> Option<u16> {
        (self.obcp_port != 0).then_some(self.obcp_port)
    }

    /// How our SOSS servers listen
    #[must_use]
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            protocol: self.protocol,
            port: None,
            port_range: self.port_range,
            register: self.portmapper,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Settings for the file transfer interface
    #[must_use]
    pub fn archive_settings(&self) -> ArchiveSettings {
        ArchiveSettings {
            fits_dir: self.fits_dir.clone(),
            method: self.transfer_method,
            username: self.username.clone(),
            transfer_port: (self.transfer_port != 0).then_some(self.transfer_port),
            group_size: self.group_size,
            data_timeout: Duration::from_secs(self.data_timeout),
            inband_timeout: Duration::from_secs(self.inband_timeout),
        }
    }
}

/// Configuration options given on the command line.
///
/// Only the options actually given are merged over the other configuration sources.
#[derive(Clone, Debug, Default, PartialEq, clap::Args, Serialize)]
#[command(next_help_heading = "Configuration")]
pub struct ConfigOverrides {
    /// Number of the OBCP to talk to (1-32)
    #[arg(long, value_name = "N")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obcp_num: Option<u8>,
    /// Host name of the OBCP
    #[arg(long, value_name = "HOST")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obcp_host: Option<String>,
    /// Fixed port for calls to the OBCP (0 = ask the portmapper)
    #[arg(long, value_name = "PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obcp_port: Option<u16>,
    /// Our name, as given in message headers
    #[arg(long, value_name = "HOST")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub my_host: Option<String>,
    /// Interfaces to run (any of: cmd, thru, sreq, sdst, file)
    #[arg(long, value_name = "LIST")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<String>,
    /// Hosts allowed to make requests of us (empty = everyone)
    #[arg(long, value_name = "LIST")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_filter: Option<String>,
    /// Status push unit to listen for (1-5)
    #[arg(long, value_name = "N")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_unit: Option<u8>,
    /// Worker pool size (0 = automatic)
    #[arg(long, value_name = "N")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<usize>,
    /// RPC protocol
    #[arg(long, value_name = "PROTOCOL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// Ports our servers may bind
    #[arg(long, value_name = "M-N")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<PortRange>,
    /// Do not register with the local portmapper
    #[arg(long)]
    #[serde(skip)]
    pub no_portmapper: bool,
    /// Directory frames are saved into
    #[arg(long, value_name = "DIR")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fits_dir: Option<PathBuf>,
    /// How frame files are fetched
    #[arg(long, value_name = "METHOD")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_method: Option<TransferMethod>,
    /// Login name for file transfers
    #[arg(long, value_name = "USER")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Port for file transfers (0 = the protocol's usual port)
    #[arg(long, value_name = "PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_port: Option<u16>,
    /// Port for the in-band FITS data server
    #[arg(long, value_name = "PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fits_port: Option<u16>,
    /// Maximum number of files fetched at once
    #[arg(long, value_name = "N")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_size: Option<usize>,
    /// Append a JSON record of every file transfer to this file
    #[arg(long, value_name = "FILE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_log: Option<PathBuf>,
    /// Seed the status table from this file
    #[arg(long, value_name = "FILE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,
    /// Log to this file as well as the console
    #[arg(short = 'l', long, value_name = "FILE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    /// Time format for log messages
    #[arg(long, value_name = "FORMAT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_format: Option<TimeFormat>,
}

impl Provider for ConfigOverrides {
    fn metadata(&self) -> Metadata {
        Metadata::named("command line")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        let mut data = Serialized::defaults(self).data()?;
        if self.no_portmapper {
            let _ = data
                .entry(Profile::Default)
                .or_default()
                .insert("portmapper".into(), false.into());
        }
        Ok(data)
    }
}
