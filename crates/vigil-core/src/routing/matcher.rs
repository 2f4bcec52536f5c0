//! Label matchers in Alertmanager syntax

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use crate::error::{Error, Result};
use crate::models::Labels;

/// Matcher operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `=~`
    Regexp,
    /// `!~`
    NotRegexp,
}

impl MatchType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regexp => "=~",
            Self::NotRegexp => "!~",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "=" => Ok(Self::Equal),
            "!=" => Ok(Self::NotEqual),
            "=~" => Ok(Self::Regexp),
            "!~" => Ok(Self::NotRegexp),
            other => Err(Error::config_validation(format!("unknown match type {other:?}"))),
        }
    }
}

/// A compiled label matcher
#[derive(Debug, Clone)]
pub struct Matcher {
    /// Label name
    pub name: String,
    /// Operator
    pub op: MatchType,
    /// Value or pattern
    pub value: String,
    regex: Option<Regex>,
}

impl Matcher {
    /// Build a matcher; regular expressions are anchored at both ends
    pub fn new(name: impl Into<String>, op: MatchType, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();

        if !is_valid_label_name(&name) {
            return Err(Error::config_validation(format!("invalid label name {name:?}")));
        }

        let regex = match op {
            MatchType::Regexp | MatchType::NotRegexp => Some(
                Regex::new(&format!("^(?:{value})$")).map_err(|e| {
                    Error::config_validation(format!("invalid regular expression {value:?}: {e}"))
                })?,
            ),
            MatchType::Equal | MatchType::NotEqual => None,
        };

        Ok(Self {
            name,
            op,
            value,
            regex,
        })
    }

    /// Parse one matcher such as `team="backend"` or `env=~prod.*`
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let input = input
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(input)
            .trim();

        let bad = || Error::config_validation(format!("bad matcher format: {input}"));

        let (pos, op) = ["=~", "!~", "!=", "="]
            .iter()
            .filter_map(|op| input.find(op).map(|pos| (pos, *op)))
            .min_by_key(|(pos, op)| (*pos, std::cmp::Reverse(op.len())))
            .ok_or_else(bad)?;

        let name = input[..pos].trim();
        let raw = input[pos + op.len()..].trim();
        if name.is_empty() {
            return Err(bad());
        }

        let value = match raw.strip_prefix('"') {
            Some(quoted) => unquote(quoted.strip_suffix('"').ok_or_else(bad)?)?,
            None => raw.to_string(),
        };

        Self::new(name, op.parse()?, value)
    }

    /// Whether a label set satisfies this matcher; a missing label reads as empty
    pub fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.name).unwrap_or("");
        match (&self.op, &self.regex) {
            (MatchType::Equal, _) => value == self.value,
            (MatchType::NotEqual, _) => value != self.value,
            (MatchType::Regexp, Some(re)) => re.is_match(value),
            (MatchType::NotRegexp, Some(re)) => !re.is_match(value),
            (_, None) => false,
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(c @ ('"' | '\\')) => out.push(c),
            Some(c) => {
                out.push('\\');
                out.push(c);
            }
            None => return Err(Error::config_validation(format!("unterminated escape in {s:?}"))),
        }
    }
    Ok(out)
}

/// All conditions of a route; empty matches everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matchers(pub Vec<Matcher>);

impl Matchers {
    /// Whether every matcher accepts the label set
    pub fn matches(&self, labels: &Labels) -> bool {
        self.0.iter().all(|m| m.matches(labels))
    }

    /// Whether there are no matchers
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
