/*
 * Copyright 2024 ArpNetworking
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Core data model for metrics aggregation
//!
//! Defines the Statsd metric variants, the line-protocol parser that
//! produces them, and the flush records emitted to destinations.

use thiserror::Error;

/// A single parsed Statsd metric.
///
/// The wire form is `name:value|type[|@sample_rate]` with
/// `type ∈ {c, g, s, ms}`. A gauge value carrying an explicit leading
/// sign is a delta applied to the current gauge rather than an absolute
/// set.
#[derive(Debug, Clone, PartialEq)]
pub enum Metric {
    /// Monotonic event count, scaled by the client-side sample rate
    Counter {
        name: String,
        value: f64,
        sample_rate: f64,
    },
    /// Absolute point-in-time value
    Gauge { name: String, value: f64 },
    /// Signed increment to the current gauge value
    GaugeDelta { name: String, delta: f64 },
    /// One member observed for a distinct-count set
    Set { name: String, member: String },
    /// Duration measurement in milliseconds
    Timer {
        name: String,
        value: f64,
        sample_rate: f64,
    },
}

/// Failure to parse a single metric line.
///
/// Parse failures never abort batch processing; the processor counts
/// them and moves on to the next line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("metric line is missing the name:value separator")]
    MissingSeparator,

    #[error("invalid metric name {0:?}")]
    InvalidName(String),

    #[error("expected value|type[|@rate] but found {0:?}")]
    MalformedFields(String),

    #[error("unknown metric type {0:?}")]
    UnknownType(String),

    #[error("invalid metric value {0:?}")]
    InvalidValue(String),

    #[error("invalid sample rate {0:?}")]
    InvalidSampleRate(String),
}

impl Metric {
    /// Parse one metric line (no trailing newline).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let (name, rest) = line.split_once(':').ok_or(ParseError::MissingSeparator)?;
        if !is_valid_name(name) {
            return Err(ParseError::InvalidName(name.to_owned()));
        }
        if rest.is_empty() {
            return Err(ParseError::MalformedFields(rest.to_owned()));
        }

        let mut fields = rest.split('|');
        let value_str = fields.next().unwrap_or_default();
        let type_str = fields
            .next()
            .ok_or_else(|| ParseError::MalformedFields(rest.to_owned()))?;
        let sample_str = fields.next();
        if fields.next().is_some() {
            return Err(ParseError::MalformedFields(rest.to_owned()));
        }

        let sample_rate = match sample_str {
            Some(field) => parse_sample_rate(field)?,
            None => 1.0,
        };

        let name = name.to_owned();
        match type_str {
            "c" => Ok(Metric::Counter {
                name,
                value: parse_value(value_str)?,
                sample_rate,
            }),
            "ms" => Ok(Metric::Timer {
                name,
                value: parse_value(value_str)?,
                sample_rate,
            }),
            "g" => {
                let value = parse_value(value_str)?;
                if value_str.starts_with('+') || value_str.starts_with('-') {
                    Ok(Metric::GaugeDelta { name, delta: value })
                } else {
                    Ok(Metric::Gauge { name, value })
                }
            }
            "s" => Ok(Metric::Set {
                name,
                member: value_str.to_owned(),
            }),
            other => Err(ParseError::UnknownType(other.to_owned())),
        }
    }

    /// The metric name as it appeared on the wire.
    pub fn name(&self) -> &str {
        match self {
            Metric::Counter { name, .. }
            | Metric::Gauge { name, .. }
            | Metric::GaugeDelta { name, .. }
            | Metric::Set { name, .. }
            | Metric::Timer { name, .. } => name,
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| matches!(c, ':' | '|' | '@') || c.is_whitespace() || c.is_control())
}

fn parse_value(value_str: &str) -> Result<f64, ParseError> {
    let value: f64 = value_str
        .parse()
        .map_err(|_| ParseError::InvalidValue(value_str.to_owned()))?;
    if !value.is_finite() {
        return Err(ParseError::InvalidValue(value_str.to_owned()));
    }
    Ok(value)
}

fn parse_sample_rate(field: &str) -> Result<f64, ParseError> {
    let rate_str = field
        .strip_prefix('@')
        .ok_or_else(|| ParseError::InvalidSampleRate(field.to_owned()))?;
    let rate: f64 = rate_str
        .parse()
        .map_err(|_| ParseError::InvalidSampleRate(field.to_owned()))?;
    if !(rate > 0.0 && rate <= 1.0) {
        return Err(ParseError::InvalidSampleRate(field.to_owned()));
    }
    Ok(rate)
}

/// One aggregated value emitted during a flush.
///
/// All records produced by a single flush share the same epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushRecord {
    pub name: String,
    pub value: f64,
    pub timestamp: i64,
}

impl FlushRecord {
    pub fn new(name: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counter() {
        assert_eq!(
            Metric::parse("hits:3|c").unwrap(),
            Metric::Counter {
                name: "hits".into(),
                value: 3.0,
                sample_rate: 1.0,
            }
        );
    }

    #[test]
    fn test_parse_sampled_counter() {
        assert_eq!(
            Metric::parse("hits:2|c|@0.5").unwrap(),
            Metric::Counter {
                name: "hits".into(),
                value: 2.0,
                sample_rate: 0.5,
            }
        );
    }

    #[test]
    fn test_parse_gauge_and_deltas() {
        assert_eq!(
            Metric::parse("temp:50|g").unwrap(),
            Metric::Gauge {
                name: "temp".into(),
                value: 50.0,
            }
        );
        assert_eq!(
            Metric::parse("temp:+5|g").unwrap(),
            Metric::GaugeDelta {
                name: "temp".into(),
                delta: 5.0,
            }
        );
        assert_eq!(
            Metric::parse("temp:-2|g").unwrap(),
            Metric::GaugeDelta {
                name: "temp".into(),
                delta: -2.0,
            }
        );
    }

    #[test]
    fn test_parse_set_keeps_member_verbatim() {
        assert_eq!(
            Metric::parse("users:alice|s").unwrap(),
            Metric::Set {
                name: "users".into(),
                member: "alice".into(),
            }
        );
        // Set members are literal strings, not numbers.
        assert_eq!(
            Metric::parse("users:42|s").unwrap(),
            Metric::Set {
                name: "users".into(),
                member: "42".into(),
            }
        );
    }

    #[test]
    fn test_parse_timer() {
        assert_eq!(
            Metric::parse("req.time:320.5|ms|@0.1").unwrap(),
            Metric::Timer {
                name: "req.time".into(),
                value: 320.5,
                sample_rate: 0.1,
            }
        );
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        assert_eq!(
            Metric::parse("bad_line_without_value").unwrap_err(),
            ParseError::MissingSeparator
        );
    }

    #[test]
    fn test_parse_rejects_empty_name() {
        assert_eq!(
            Metric::parse(":1|c").unwrap_err(),
            ParseError::InvalidName(String::new())
        );
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        assert!(matches!(
            Metric::parse("sp ace:1|c").unwrap_err(),
            ParseError::InvalidName(_)
        ));
        assert!(matches!(
            Metric::parse("at@sign:1|c").unwrap_err(),
            ParseError::InvalidName(_)
        ));
        assert!(matches!(
            Metric::parse("tab\there:1|c").unwrap_err(),
            ParseError::InvalidName(_)
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert_eq!(
            Metric::parse("x:1|h").unwrap_err(),
            ParseError::UnknownType("h".into())
        );
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(matches!(
            Metric::parse("x:abc|c").unwrap_err(),
            ParseError::InvalidValue(_)
        ));
        assert!(matches!(
            Metric::parse("x:|c").unwrap_err(),
            ParseError::InvalidValue(_)
        ));
        assert!(matches!(
            Metric::parse("x:inf|c").unwrap_err(),
            ParseError::InvalidValue(_)
        ));
    }

    #[test]
    fn test_parse_rejects_bad_sample_rates() {
        for line in [
            "x:1|c|0.5",
            "x:1|c|@0",
            "x:1|c|@-0.5",
            "x:1|c|@1.5",
            "x:1|c|@nope",
        ] {
            assert!(
                matches!(
                    Metric::parse(line).unwrap_err(),
                    ParseError::InvalidSampleRate(_)
                ),
                "line {line:?} should fail on the sample rate"
            );
        }
    }

    #[test]
    fn test_parse_rejects_extra_fields() {
        assert!(matches!(
            Metric::parse("x:1|c|@0.5|junk").unwrap_err(),
            ParseError::MalformedFields(_)
        ));
    }
}
