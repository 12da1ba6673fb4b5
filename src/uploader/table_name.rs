// SPDX-License-Identifier: Apache-2.0

//! Destination table names derived from a record's date.
//!
//! A format such as `logs_{YEAR}{MONTH:02}{DAY:02}` is parsed once at startup. The
//! placeholders are `YEAR`, `MONTH` and `DAY`, each optionally followed by `:0N` to
//! zero-pad to width `N`. `{{` and `}}` produce literal braces.

use std::fmt::Write;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone};

use crate::error::ConfigError;

pub const DEFAULT_TABLE_NAME_FORMAT: &str = "logs_{YEAR}{MONTH:02}{DAY:02}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Component {
    Year,
    Month,
    Day,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field { component: Component, width: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNameFormat {
    source: String,
    segments: Vec<Segment>,
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::invalid("table_name_format", reason)
}

fn parse_placeholder(spec: &str) -> Result<Segment, ConfigError> {
    let (name, format) = match spec.split_once(':') {
        Some((name, format)) => (name, Some(format)),
        None => (spec, None),
    };

    let component = match name {
        "YEAR" => Component::Year,
        "MONTH" => Component::Month,
        "DAY" => Component::Day,
        other => return Err(invalid(format!("unknown placeholder {{{}}}", other))),
    };

    let width = match format {
        None | Some("") => 0,
        Some(f) => f
            .strip_prefix('0')
            .and_then(|w| w.parse::<usize>().ok())
            .ok_or_else(|| invalid(format!("unsupported format spec '{}' for {}", f, name)))?,
    };

    Ok(Segment::Field { component, width })
}

impl FromStr for TableNameFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut spec = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => spec.push(c),
                            None => return Err(invalid("unterminated placeholder")),
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_placeholder(&spec)?);
                }
                '}' => return Err(invalid("unmatched '}'")),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if segments.is_empty() {
            return Err(invalid("format is empty"));
        }

        Ok(Self {
            source: s.to_string(),
            segments,
        })
    }
}

impl Default for TableNameFormat {
    fn default() -> Self {
        Self {
            source: DEFAULT_TABLE_NAME_FORMAT.to_string(),
            segments: vec![
                Segment::Literal("logs_".to_string()),
                Segment::Field {
                    component: Component::Year,
                    width: 0,
                },
                Segment::Field {
                    component: Component::Month,
                    width: 2,
                },
                Segment::Field {
                    component: Component::Day,
                    width: 2,
                },
            ],
        }
    }
}

impl TableNameFormat {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn render<Tz: TimeZone>(&self, time: &DateTime<Tz>) -> String {
        let mut out = String::with_capacity(self.source.len() + 8);
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field { component, width } => {
                    let value = match component {
                        Component::Year => time.year() as i64,
                        Component::Month => time.month() as i64,
                        Component::Day => time.day() as i64,
                    };
                    let _ = write!(out, "{:0width$}", value, width = *width);
                }
            }
        }
        out
    }
}
