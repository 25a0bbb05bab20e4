//! Configuration error reporting
// (c) 2024 Ross Younger

use figment::error::{Kind, OneOf};
use thiserror::Error;

/// A figment error, displayed in terms a configuration file author will recognise
#[derive(Debug, Error, PartialEq)]
pub struct ConfigFileError(#[source] Box<figment::Error>);

impl From<figment::Error> for ConfigFileError {
    fn from(e: figment::Error) -> Self {
        Self(Box::new(e))
    }
}

impl std::ops::Deref for ConfigFileError {
    type Target = figment::Error;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ConfigFileError {
    fn expected(s: &str) -> String {
        match s {
            "a boolean" => format!(
                "a boolean ({})",
                OneOf(&["yes", "no", "true", "false", "on", "off", "1", "0"])
            ),
            "u8" | "u16" | "u32" | "u64" | "usize" => format!("a whole number ({s})"),
            "f64" => "a number of seconds".into(),
            _ => s.to_owned(),
        }
    }

    fn fmt_kind(kind: &Kind, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match kind {
            Kind::InvalidType(v, exp) => {
                write!(f, "invalid type: found {v}, expected {}", Self::expected(exp))
            }
            Kind::UnknownVariant(v, exp) => {
                write!(f, "unknown variant: found {v}, expected {}", OneOf(exp))
            }
            Kind::MissingField(field) => write!(f, "setting {field} is required"),
            _ => std::fmt::Display::fmt(&kind, f),
        }
    }
}

impl std::fmt::Display for ConfigFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let e = &self.0;
        Self::fmt_kind(&e.kind, f)?;

        if let (Some(profile), Some(md)) = (&e.profile, &e.metadata) {
            if !e.path.is_empty() {
                write!(f, " for {}", md.interpolate(profile, &e.path))?;
            }
        }
        if let Some(md) = &e.metadata {
            match &md.source {
                Some(source) => write!(f, " at {source}")?,
                None => write!(f, " in {}", md.name)?,
            }
        }
        Ok(())
    }
}
