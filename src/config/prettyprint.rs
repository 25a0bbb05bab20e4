//! Configuration pretty-printing
// (c) 2024 Ross Younger

use std::fmt::Display;

use figment::{Metadata, value::Value};
use heck::ToUpperCamelCase as _;

use super::{Configuration, Manager};

/// One row of the output table
struct PrettyConfig {
    field: String,
    value: String,
    source: String,
}

impl PrettyConfig {
    fn render_source(meta: Option<&Metadata>) -> String {
        meta.map(|m| {
            m.source
                .as_ref()
                .map_or_else(|| m.name.to_string(), figment::Source::to_string)
        })
        .unwrap_or_default()
    }

    fn render_value(value: &Value) -> String {
        match value {
            Value::String(_tag, s) => s.to_string(),
            Value::Char(_tag, c) => c.to_string(),
            Value::Bool(_tag, b) => b.to_string(),
            Value::Num(_tag, num) => num
                .to_i128()
                .map(|i| i.to_string())
                .or_else(|| num.to_u128().map(|u| u.to_string()))
                .or_else(|| num.to_f64().map(|f| f.to_string()))
                .unwrap_or_default(),
            Value::Empty(_tag, _) => "<none>".into(),
            Value::Dict(_tag, dict) => format!("{{{} entries}}", dict.len()),
            Value::Array(_tag, vec) => format!(
                "[{}]",
                vec.iter()
                    .map(PrettyConfig::render_value)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }
}

/// Pretty-printing type wrapper to Manager
#[derive(Debug)]
pub struct DisplayAdapter<'a> {
    source: &'a Manager,
}

impl Manager {
    /// Creates a `DisplayAdapter` showing every [`Configuration`] field, its value
    /// and where the value came from
    #[must_use]
    pub fn to_display_adapter(&self) -> DisplayAdapter<'_> {
        DisplayAdapter { source: self }
    }
}

impl Display for DisplayAdapter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = &self.source.data;
        let mut keys = Configuration::field_names();
        keys.sort();

        let mut rows = vec![PrettyConfig {
            field: "Field".into(),
            value: "Value".into(),
            source: "Source".into(),
        }];
        for field in keys {
            if let Ok(value) = data.find_value(&field) {
                rows.push(PrettyConfig {
                    field: field.to_upper_camel_case(),
                    value: PrettyConfig::render_value(&value),
                    source: PrettyConfig::render_source(data.get_metadata(value.tag())),
                });
            }
        }
        let w1 = rows.iter().map(|r| r.field.len()).max().unwrap_or(0);
        let w2 = rows.iter().map(|r| r.value.len()).max().unwrap_or(0);
        for (i, r) in rows.iter().enumerate() {
            writeln!(f, "{:<w1$}  {:<w2$}  {}", r.field, r.value, r.source)?;
            if i == 0 {
                writeln!(f, "{:-<w1$}  {:-<w2$}  {:-<6}", "", "", "")?;
            }
        }
        Ok(())
    }
}
