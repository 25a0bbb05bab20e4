//! Command line argument definitions
// (c) 2024 Ross Younger

use std::ffi::OsString;

use clap::Parser;

use crate::config::ConfigOverrides;

/// What the program has been asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub(crate) enum MainMode {
    /// Run the interfaces until interrupted
    Run,
    /// Send a single command, wait for it to finish, then exit
    Send,
    /// Print the configuration and exit
    ShowConfig,
    /// Print the list of configuration files and exit
    ShowConfigFiles,
}

/// Instrument interface between an observatory control system and an
/// on-board control processor (OBCP).
///
/// Starts the configured interfaces and serves them until interrupted.
#[derive(Debug, Parser, Clone, Default)]
#[command(
    version(crate::version::short()),
    about,
    styles(super::styles::CLAP_STYLES),
    infer_long_args(true)
)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct CliArgs {
    /// Enable detailed debug output
    ///
    /// This has the same effect as setting `RUST_LOG=insint=debug` in the environment.
    /// If present, `RUST_LOG` overrides this option.
    #[arg(short, long, action, help_heading("Output"))]
    pub(crate) debug: bool,

    /// Quiet mode: reports only errors
    #[arg(short, long, action, conflicts_with("debug"), help_heading("Output"))]
    pub(crate) quiet: bool,

    /// Outputs the configuration, then exits.
    ///
    /// Each setting is shown with where it came from.
    #[arg(long, help_heading("Configuration"))]
    pub(crate) show_config: bool,

    /// Outputs the paths to configuration file(s), then exits
    #[arg(long, help_heading("Configuration"))]
    pub(crate) config_files: bool,

    /// Sends a single command to the OBCP, waits for it to finish, and prints
    /// the final state of the transaction.
    ///
    /// Requires the `cmd` interface.
    #[arg(
        long,
        num_args(2),
        value_names(["TAG", "COMMAND"]),
        help_heading("Commands")
    )]
    pub(crate) send: Option<Vec<String>>,

    #[command(flatten)]
    pub(crate) overrides: ConfigOverrides,
}

impl CliArgs {
    pub(crate) fn custom_parse<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(args)
    }

    pub(crate) fn mode(&self) -> MainMode {
        if self.config_files {
            MainMode::ShowConfigFiles
        } else if self.show_config {
            MainMode::ShowConfig
        } else if self.send.is_some() {
            MainMode::Send
        } else {
            MainMode::Run
        }
    }

    /// The tag and command given to `--send`, if any
    pub(crate) fn send_args(&self) -> Option<(&str, &str)> {
        match self.send.as_deref() {
            Some([tag, command]) => Some((tag.as_str(), command.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod test {
    use clap::CommandFactory as _;
    use pretty_assertions::assert_eq;

    use super::{CliArgs, MainMode};

    #[test]
    fn command_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn modes() {
        let a = CliArgs::custom_parse(["insint"]).unwrap();
        assert_eq!(a.mode(), MainMode::Run);
        let a = CliArgs::custom_parse(["insint", "--config-files"]).unwrap();
        assert_eq!(a.mode(), MainMode::ShowConfigFiles);
        let a = CliArgs::custom_parse(["insint", "--show-config"]).unwrap();
        assert_eq!(a.mode(), MainMode::ShowConfig);
    }

    #[test]
    fn send() {
        let a = CliArgs::custom_parse(["insint", "--send", "t1", "EXEC OBE MOVE"]).unwrap();
        assert_eq!(a.mode(), MainMode::Send);
        assert_eq!(a.send_args(), Some(("t1", "EXEC OBE MOVE")));
        assert!(CliArgs::custom_parse(["insint", "--send", "t1"]).is_err());
    }

    #[test]
    fn overrides() {
        let a = CliArgs::custom_parse([
            "insint",
            "--obcp-num",
            "12",
            "--no-portmapper",
            "-l",
            "/tmp/insint.log",
        ])
        .unwrap();
        assert_eq!(a.overrides.obcp_num, Some(12));
        assert!(a.overrides.no_portmapper);
        assert_eq!(a.overrides.log_file.as_deref(), Some("/tmp/insint.log"));
    }

    #[test]
    fn debug_and_quiet_conflict() {
        assert!(CliArgs::custom_parse(["insint", "-d", "-q"]).is_err());
    }
}
