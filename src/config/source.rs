//! Configuration file reader
// (c) 2025 Ross Younger
//!
//! A configuration file holds one `keyword value` setting per line.
//! Keywords are matched to [`Configuration`] fields without regard to case,
//! hyphens or underscores. An `=` between keyword and value is optional.
//! Values containing spaces may be double-quoted. `#` starts a comment.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context as _;
use figment::{Error, Metadata, Profile, Provider, Source, value::Dict, value::Map, value::Value};
use tracing::{trace, warn};

use super::Configuration;

/// A set of settings read from a file, usable as a figment provider
#[derive(Debug, Clone)]
pub(crate) struct LocalConfigSource {
    source: String,
    path: Option<std::path::PathBuf>,
    data: Dict,
}

/// Canonical form of a keyword for matching
fn squash(keyword: &str) -> String {
    keyword
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Removes a trailing comment, respecting double quotes
fn strip_comment(line: &str) -> &str {
    let mut quoted = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '#' if !quoted => return &line[..i],
            _ => (),
        }
    }
    line
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

impl LocalConfigSource {
    pub(crate) fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            path: None,
            data: Dict::new(),
        }
    }

    pub(crate) fn add(&mut self, key: &str, val: Value) {
        let _ = self.data.insert(key.into(), val);
    }

    #[cfg(test)]
    pub(crate) fn borrow(&mut self) -> &mut Dict {
        &mut self.data
    }

    /// Parses configuration text. `source` names it in messages.
    ///
    /// Unknown keywords are kept under their own name, with a warning.
    /// A later setting of the same keyword replaces an earlier one.
    pub(crate) fn parse(source: &str, text: &str) -> anyhow::Result<Self> {
        let known: HashMap<String, String> = Configuration::field_names()
            .into_iter()
            .map(|f| (squash(&f), f))
            .collect();
        let mut result = Self::new(source);
        for (n, line) in text.lines().enumerate() {
            let line = strip_comment(line).trim();
            if line.is_empty() {
                continue;
            }
            let (keyword, rest) = line
                .split_once(|c: char| c.is_whitespace() || c == '=')
                .unwrap_or((line, ""));
            let rest = rest.trim_start();
            let value = unquote(rest.strip_prefix('=').unwrap_or(rest).trim());
            anyhow::ensure!(
                !value.is_empty(),
                "{source} line {}: no value for {keyword}",
                n + 1
            );
            let field = if let Some(f) = known.get(&squash(keyword)) {
                f.clone()
            } else {
                warn!("{source} line {}: unknown keyword {keyword}", n + 1);
                keyword.to_string()
            };
            trace!("{source}: {field} = {value}");
            result.add(&field, value.into());
        }
        Ok(result)
    }

    /// Reads and parses a configuration file
    pub(crate) fn read(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut result = Self::parse(&path.display().to_string(), &text)?;
        result.path = Some(path.to_path_buf());
        Ok(result)
    }
}

impl Provider for LocalConfigSource {
    fn metadata(&self) -> Metadata {
        let md = Metadata::named(self.source.clone());
        match &self.path {
            Some(p) => md.source(Source::File(p.clone())),
            None => md,
        }
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut profile_map = Map::new();
        let _ = profile_map.insert(Profile::Default, self.data.clone());
        Ok(profile_map)
    }
}
