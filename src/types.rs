use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::comment::CommentTree;

/// Issue status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Unconfirmed,
    #[default]
    Open,
    Assigned,
    Test,
    Closed,
    Fixed,
    WontFix,
}

impl Status {
    /// Every status, active ones first.
    pub const ALL: [Status; 7] = [
        Status::Unconfirmed,
        Status::Open,
        Status::Assigned,
        Status::Test,
        Status::Closed,
        Status::Fixed,
        Status::WontFix,
    ];

    /// Get the string representation of this status
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unconfirmed => "unconfirmed",
            Status::Open => "open",
            Status::Assigned => "assigned",
            Status::Test => "test",
            Status::Closed => "closed",
            Status::Fixed => "fixed",
            Status::WontFix => "wontfix",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Status::Unconfirmed => "A possible bug which lacks independent existence confirmation.",
            Status::Open => "A working bug that has not been assigned to a developer.",
            Status::Assigned => "A working bug that has been assigned to a developer.",
            Status::Test => "The code has been adjusted, but the fix is still being tested.",
            Status::Closed => "The bug is no longer relevant.",
            Status::Fixed => "The bug should no longer occur.",
            Status::WontFix => "It's not a bug, it's a feature.",
        }
    }

    /// Whether work on the issue is still outstanding.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Status::Unconfirmed | Status::Open | Status::Assigned | Status::Test
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid status: '{}'. Valid values are: {}",
                    s,
                    joined(Status::ALL.iter().map(Status::as_str))
                )
            })
    }
}

/// Issue severity, least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Target,
    Wishlist,
    #[default]
    Minor,
    Serious,
    Critical,
    Fatal,
}

impl Severity {
    pub const ALL: [Severity; 6] = [
        Severity::Target,
        Severity::Wishlist,
        Severity::Minor,
        Severity::Serious,
        Severity::Critical,
        Severity::Fatal,
    ];

    /// Get the string representation of this severity
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Target => "target",
            Severity::Wishlist => "wishlist",
            Severity::Minor => "minor",
            Severity::Serious => "serious",
            Severity::Critical => "critical",
            Severity::Fatal => "fatal",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Severity::Target => "The issue is a target or milestone, not a bug.",
            Severity::Wishlist => "A feature that could improve usefulness, but not a bug.",
            Severity::Minor => "The standard bug level.",
            Severity::Serious => "A bug that requires workarounds.",
            Severity::Critical => "A bug that prevents some features from working at all.",
            Severity::Fatal => "A bug that makes the package unusable.",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .iter()
            .copied()
            .find(|severity| severity.as_str() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid severity: '{}'. Valid values are: {}",
                    s,
                    joined(Severity::ALL.iter().map(Severity::as_str))
                )
            })
    }
}

fn joined<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values.collect::<Vec<_>>().join(", ")
}

/// Issue structure
///
/// `extra_strings` is an ordered bag of opaque tags. Some of them encode
/// dependency links (see [`crate::depend`]); the rest are free-form labels.
#[derive(Debug, Clone)]
pub struct Issue {
    pub uuid: Uuid,
    pub status: Status,
    pub severity: Severity,
    pub assigned: Option<String>,
    pub summary: String,
    pub creator: Option<String>,
    pub time: DateTime<Utc>,
    pub extra_strings: Vec<String>,
    pub comments: CommentTree,
}

impl Issue {
    pub fn new(summary: String, creator: Option<String>) -> Self {
        Self::with_uuid(Uuid::new_v4(), summary, creator)
    }

    pub fn with_uuid(uuid: Uuid, summary: String, creator: Option<String>) -> Self {
        Self {
            uuid,
            status: Status::default(),
            severity: Severity::default(),
            assigned: None,
            summary,
            creator,
            time: Utc::now(),
            extra_strings: Vec::new(),
            comments: CommentTree::new(),
        }
    }

    /// Add a tag unless it is already present. Returns true if added.
    pub fn add_extra_string(&mut self, tag: String) -> bool {
        if self.extra_strings.contains(&tag) {
            return false;
        }
        self.extra_strings.push(tag);
        true
    }

    /// Remove every copy of a tag. Returns true if anything was removed.
    pub fn remove_extra_string(&mut self, tag: &str) -> bool {
        let before = self.extra_strings.len();
        self.extra_strings.retain(|s| s != tag);
        self.extra_strings.len() != before
    }

    /// One-line listing form: `<short>:<status letter><severity letter>: <summary>`
    pub fn short_line(&self, short_id: &str) -> String {
        format!(
            "{}:{}{}: {}",
            short_id,
            &self.status.as_str()[..1],
            &self.severity.as_str()[..1],
            self.summary
        )
    }
}

/// Issue row for JSON listings
#[derive(Debug, Serialize, Deserialize)]
pub struct IssueSummary {
    pub uuid: Uuid,
    pub short_id: String,
    pub status: Status,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned: Option<String>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_strings: Vec<String>,
    pub comment_count: usize,
}

impl IssueSummary {
    pub fn new(issue: &Issue, short_id: String) -> Self {
        Self {
            uuid: issue.uuid,
            short_id,
            status: issue.status,
            severity: issue.severity,
            assigned: issue.assigned.clone(),
            summary: issue.summary.clone(),
            extra_strings: issue.extra_strings.clone(),
            comment_count: issue.comments.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_and_activity() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!(Status::Test.is_active());
        assert!(!Status::WontFix.is_active());
        let err = "none".parse::<Status>().unwrap_err().to_string();
        assert!(err.contains("Invalid status: 'none'"), "{err}");
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Fatal > Severity::Serious);
        assert_eq!("wishlist".parse::<Severity>().unwrap(), Severity::Wishlist);
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn test_extra_strings_behave_like_a_set() {
        let mut issue = Issue::new("Bug A".to_string(), None);
        assert!(issue.add_extra_string("TAG:x".to_string()));
        assert!(!issue.add_extra_string("TAG:x".to_string()));
        assert!(issue.add_extra_string("TAG:y".to_string()));
        assert_eq!(issue.extra_strings, vec!["TAG:x", "TAG:y"]);
        assert!(issue.remove_extra_string("TAG:x"));
        assert!(!issue.remove_extra_string("TAG:x"));
        assert_eq!(issue.extra_strings, vec!["TAG:y"]);
    }

    #[test]
    fn test_short_line() {
        let mut issue = Issue::new("Bug A".to_string(), None);
        issue.severity = Severity::Minor;
        assert_eq!(issue.short_line("a"), "a:om: Bug A");
    }
}
