//! Value selection for `--status` / `--severity` style options.
//!
//! A comma-separated list is a whitelist: `open,assigned` lets only those
//! values through. Starting the list with `-` turns it into a blacklist:
//! `-closed,wontfix` lets everything except those values through. The
//! special list `all` lets everything through.

use std::fmt::Display;
use std::str::FromStr;

use thiserror::Error;

/// Prefix that switches a selection into blacklist mode.
pub const NEGATION_MARKER: char = '-';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("Invalid {kind} '{value}'. Valid values are: {valid}")]
    InvalidValue {
        kind: &'static str,
        value: String,
        valid: String,
    },

    #[error("Empty {kind} selection")]
    Empty { kind: &'static str },
}

/// A parsed whitelist or blacklist over some value type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueFilter<T> {
    Any,
    Only(Vec<T>),
    Except(Vec<T>),
}

impl<T> Default for ValueFilter<T> {
    fn default() -> Self {
        ValueFilter::Any
    }
}

impl<T: PartialEq> ValueFilter<T> {
    pub fn allows(&self, value: &T) -> bool {
        match self {
            ValueFilter::Any => true,
            ValueFilter::Only(values) => values.contains(value),
            ValueFilter::Except(values) => !values.contains(value),
        }
    }
}

impl<T> ValueFilter<T>
where
    T: FromStr + Display + Copy + PartialEq,
{
    /// Parse a selection string, checking every entry against `possible`.
    ///
    /// `kind` only names the option in error messages.
    pub fn parse(selection: &str, possible: &[T], kind: &'static str) -> Result<Self, SelectError> {
        if selection == "all" {
            return Ok(ValueFilter::Any);
        }
        let (blacklist, list) = match selection.strip_prefix(NEGATION_MARKER) {
            Some(rest) => (true, rest),
            None => (false, selection),
        };

        let mut values = Vec::new();
        for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let value = possible
                .iter()
                .copied()
                .find(|candidate| candidate.to_string() == raw)
                .ok_or_else(|| SelectError::InvalidValue {
                    kind,
                    value: raw.to_string(),
                    valid: possible
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                })?;
            if !values.contains(&value) {
                values.push(value);
            }
        }
        if values.is_empty() {
            return Err(SelectError::Empty { kind });
        }

        Ok(if blacklist {
            ValueFilter::Except(values)
        } else {
            ValueFilter::Only(values)
        })
    }

    /// Parse an optional selection; `None` selects everything.
    pub fn parse_opt(
        selection: Option<&str>,
        possible: &[T],
        kind: &'static str,
    ) -> Result<Self, SelectError> {
        selection.map_or(Ok(ValueFilter::Any), |s| Self::parse(s, possible, kind))
    }

    /// The allowed values, in the order of `possible`.
    pub fn selected(&self, possible: &[T]) -> Vec<T> {
        possible.iter().copied().filter(|v| self.allows(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Severity, Status};

    #[test]
    fn test_whitelist() {
        let filter = ValueFilter::parse("open,assigned", &Status::ALL, "status").unwrap();
        assert_eq!(
            filter.selected(&Status::ALL),
            vec![Status::Open, Status::Assigned]
        );
        assert!(!filter.allows(&Status::Closed));
    }

    #[test]
    fn test_blacklist() {
        let filter = ValueFilter::parse("-target", &Severity::ALL, "severity").unwrap();
        assert!(!filter.allows(&Severity::Target));
        assert_eq!(filter.selected(&Severity::ALL).len(), Severity::ALL.len() - 1);
    }

    #[test]
    fn test_all_and_none() {
        let all = ValueFilter::parse("all", &Status::ALL, "status").unwrap();
        assert_eq!(all, ValueFilter::Any);
        let none = ValueFilter::<Status>::parse_opt(None, &Status::ALL, "status").unwrap();
        assert!(none.allows(&Status::WontFix));
    }

    #[test]
    fn test_invalid_values() {
        let err = ValueFilter::parse("open,bogus", &Status::ALL, "status").unwrap_err();
        assert!(matches!(err, SelectError::InvalidValue { ref value, .. } if value == "bogus"));
        assert_eq!(
            ValueFilter::parse("-", &Status::ALL, "status").unwrap_err(),
            SelectError::Empty { kind: "status" }
        );
    }
}
