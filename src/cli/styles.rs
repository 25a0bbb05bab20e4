// (c) 2024 Ross Younger
//! CLI output styling

#[allow(clippy::enum_glob_use)]
use anstyle::AnsiColor::*;
use anstyle::Color::Ansi;
use clap::builder::styling::Styles;
use std::io::IsTerminal as _;

/// Error message styling. This can be Displayed directly.
const ERROR: anstyle::Style = anstyle::Style::new().bold().fg_color(Some(Ansi(Red)));

const WARNING: anstyle::Style = anstyle::Style::new().bold().fg_color(Some(Ansi(Yellow)));

const INFO: anstyle::Style = anstyle::Style::new().fg_color(Some(Ansi(Cyan)));

const HEADER: anstyle::Style = anstyle::Style::new()
    .underline()
    .fg_color(Some(Ansi(Yellow)));

// We don't need to make this conditional, as clap already reads the CLICOLOR environment variables.
pub(crate) const CLAP_STYLES: Styles = Styles::styled()
    .usage(HEADER)
    .header(HEADER)
    .literal(anstyle::Style::new().bold())
    .invalid(WARNING)
    .error(ERROR)
    .valid(INFO.bold().underline())
    .placeholder(INFO);

/// Should we colour output to stderr?
///
/// Follows the quasi-standard `NO_COLOR` and `CLICOLOR_FORCE` environment variables
/// (see <https://bixense.com/clicolors/>), otherwise only when stderr is a terminal.
pub(crate) fn use_colours() -> bool {
    if std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty()) {
        false
    } else if std::env::var_os("CLICOLOR_FORCE").is_some_and(|v| !v.is_empty()) {
        true
    } else {
        std::io::stderr().is_terminal()
    }
}

/// Styling for error messages, if colours are in use
pub(crate) fn error() -> anstyle::Style {
    if use_colours() {
        ERROR
    } else {
        anstyle::Style::new()
    }
}
