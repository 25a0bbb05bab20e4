//! Configuration helper type - a range of port numbers
// (c) 2024 Ross Younger
use serde::{
    Serialize,
    de::{self, Error, Unexpected},
};
use std::{fmt::Display, str::FromStr};

/// A range of port numbers our servers may bind.
///
/// Port 0 is allowed with the usual meaning ("any available port"), but 0 may not form part of a range.
///
/// In a configuration file, a range may specified as an integer or as a pair of ports. For example:
/// ```text
/// port_range 20000         # a single port
/// port_range 20000-30000   # a range
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(from = "String", into = "String")]
pub struct PortRange {
    /// First number in the range
    pub begin: u16,
    /// Last number in the range, inclusive.
    pub end: u16,
}

impl Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.begin == self.end {
            f.write_fmt(format_args!("{}", self.begin))
        } else {
            f.write_fmt(format_args!("{}-{}", self.begin, self.end))
        }
    }
}

impl From<PortRange> for String {
    fn from(value: PortRange) -> Self {
        value.to_string()
    }
}

static PR_EXPECTED: &str = "a single port number [0..65535] or a range `a-b`";

impl FromStr for PortRange {
    type Err = figment::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use figment::error::Error as FigmentError;
        if let Ok(n) = s.parse::<u16>() {
            // case 1: it's a number
            // port 0 is allowed here (with the usual "unspecified" semantics), the user may know what they're doing.
            return Ok(Self { begin: n, end: n });
        }
        if let Ok(n) = s.parse::<u64>() {
            // out of range
            return Err(FigmentError::invalid_value(
                Unexpected::Unsigned(n),
                &PR_EXPECTED,
            ));
        }
        // case 2: it's a range
        if let Some((a, b)) = s.split_once('-') {
            let aa = a.parse();
            let bb = b.parse();
            if aa.is_ok() && bb.is_ok() {
                let aa = aa.unwrap_or_default();
                let bb = bb.unwrap_or_default();
                if aa > bb {
                    return Err(FigmentError::custom(format!(
                        "invalid port range `{s}` (must be increasing)"
                    )));
                } else if aa == 0 && bb != 0 {
                    return Err(FigmentError::custom(format!(
                        "invalid port range `{s}` (port 0 means \"any\" so cannot be part of a range)"
                    )));
                }
                return Ok(Self { begin: aa, end: bb });
            }
            // else failed to parse
        }
        // else failed to parse
        Err(FigmentError::invalid_value(
            Unexpected::Str(s),
            &PR_EXPECTED,
        ))
    }
}

struct PortRangeVisitor;

impl de::Visitor<'_> for PortRangeVisitor {
    type Value = PortRange;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(PR_EXPECTED)
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<PortRange, E> {
        FromStr::from_str(s).map_err(|e: figment::Error| {
            if let figment::error::Kind::InvalidValue(_, _) = e.kind {
                E::invalid_value(Unexpected::Str(s), &PR_EXPECTED)
            } else {
                E::custom(e)
            }
        })
    }

    // a lone port number may arrive as an integer
    fn visit_u64<E: de::Error>(self, n: u64) -> Result<PortRange, E> {
        let port = u16::try_from(n)
            .map_err(|_| E::invalid_value(Unexpected::Unsigned(n), &PR_EXPECTED))?;
        Ok(PortRange {
            begin: port,
            end: port,
        })
    }

    fn visit_i64<E: de::Error>(self, n: i64) -> Result<PortRange, E> {
        let n = u64::try_from(n)
            .map_err(|_| E::invalid_value(Unexpected::Signed(n), &PR_EXPECTED))?;
        self.visit_u64(n)
    }
}

impl<'de> serde::Deserialize<'de> for PortRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(PortRangeVisitor)
    }
}

impl From<PortRange> for figment::value::Value {
    fn from(value: PortRange) -> Self {
        value.to_string().into()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::str::FromStr;

    type Uut = super::PortRange;

    #[test]
    fn output_single() {
        let uut = Uut {
            begin: 123,
            end: 123,
        };
        assert_eq!(format!("{uut}"), "123");
    }
    #[test]
    fn output_range() {
        let uut = Uut {
            begin: 123,
            end: 456,
        };
        assert_eq!(format!("{uut}"), "123-456");
    }
    #[test]
    fn parse_single() {
        let uut = Uut::from_str("1234").unwrap();
        assert_eq!(uut.begin, 1234);
        assert_eq!(uut.end, 1234);
    }
    #[test]
    fn parse_range() {
        let uut = Uut::from_str("1234-2345").unwrap();
        assert_eq!(uut.begin, 1234);
        assert_eq!(uut.end, 2345);
        // and convert to a value
        let v = figment::value::Value::from(uut);
        assert_eq!(v.as_str(), Some("1234-2345"));
    }
    #[test]
    fn invalid_range() {
        let _ = Uut::from_str("1000-999").expect_err("should have failed");
    }
    #[test]
    fn invalid_negative() {
        let _ = Uut::from_str("-500").expect_err("should have failed");
    }
    #[test]
    fn invalid_out_of_range() {
        let _ = Uut::from_str("65537").expect_err("should have failed");
    }
    #[test]
    fn invalid_unparseable() {
        let _ = Uut::from_str("fdsfdsfds").expect_err("should have failed");
    }
    #[test]
    fn port_range_not_zero() {
        let _ = Uut::from_str("0-1000").expect_err("should have failed");
    }

    #[test]
    fn deserialize_number_or_string() {
        #[derive(serde::Deserialize)]
        struct Test {
            p: Uut,
        }
        let t: Test = serde_json::from_str(r#"{"p": 5000}"#).unwrap();
        assert_eq!(t.p, Uut { begin: 5000, end: 5000 });
        let t: Test = serde_json::from_str(r#"{"p": "20000-30000"}"#).unwrap();
        assert_eq!(t.p, Uut { begin: 20000, end: 30000 });
        assert!(serde_json::from_str::<Test>(r#"{"p": 70000}"#).is_err());
        assert!(serde_json::from_str::<Test>(r#"{"p": "9-1"}"#).is_err());
    }
}
