// (c) 2024 Ross Younger
//! # 📖 Configuration management
//!
//! insint obtains run-time configuration from the following sources, highest priority first:
//! 1. Command-line options
//! 2. Environment variables named `INSINT_` followed by the option name, e.g. `INSINT_OBCP_HOST`
//! 3. The user's configuration file, `~/.config/insint/insint.conf`
//! 4. The system-wide configuration file, `/etc/insint.conf`
//! 5. Hard-wired defaults
//!
//! Run `insint --config-files` for a list of which files we read.
//!
//! ## File format
//!
//! Each line contains a keyword (the option name) and its value.
//!
//! Option names are case insensitive; hyphens and underscores are ignored.
//! `ObcpHost`, `obcp_host` and `obcp-host` are the same option.
//!
//! The value is separated from the keyword by whitespace. `Key=Value` and `Key = Value` also work.
//! Values containing spaces may be surrounded by double quotes (`"`).
//!
//! Everything after a `#` is a comment. Empty lines are ignored.
//! If an option appears twice, the later setting wins.
//!
//! ## Configurable options
//!
//! The set of supported fields is the [Configuration] structure.
//!
//! * `insint --show-config` outputs every field, its current value, and where the value came from.
//! * For an explanation of each field, refer to `insint --help`.
//!
//! ## Example
//!
//! ```text
//! # Talk to IRCS on OBCP 9
//! ObcpNum        9
//! ObcpHost       obcp9
//! Interfaces     cmd,file,sreq
//! HostFilter     obcp9 obcp9-dev
//! FitsDir        /raid/frames
//! TransferMethod sftp
//! GroupSize      4
//! ```

mod errors;
pub use errors::ConfigFileError;

mod manager;
pub use manager::Manager;

mod prettyprint;
pub use prettyprint::DisplayAdapter;

mod source;
pub(crate) use source::LocalConfigSource;

pub mod structure;
pub use structure::{ConfigOverrides, Configuration};

/// Name of the configuration files we read
pub(crate) const BASE_CONFIG_FILENAME: &str = "insint.conf";

/// Prefix of the environment variables we read
pub(crate) const ENV_PREFIX: &str = "INSINT_";
