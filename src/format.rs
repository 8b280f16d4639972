//! Conversion between in-memory records and the string mappings that
//! [`crate::mapfile`] persists.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::comment::{Comment, DEFAULT_CONTENT_TYPE};
use crate::mapfile::Mapping;
use crate::types::Issue;

const STATUS: &str = "status";
const SEVERITY: &str = "severity";
const ASSIGNED: &str = "assigned";
const SUMMARY: &str = "summary";
const CREATOR: &str = "creator";
const TIME: &str = "time";
const EXTRA_STRINGS: &str = "extra_strings";

const AUTHOR: &str = "Author";
const DATE: &str = "Date";
const CONTENT_TYPE: &str = "Content-type";
const IN_REPLY_TO: &str = "In-reply-to";
const ALT_ID: &str = "Alt-id";

/// Convert an Issue to its stored fields
pub fn issue_to_values(issue: &Issue) -> Result<Mapping> {
    let mut values = Mapping::new();
    values.insert(STATUS.to_string(), issue.status.to_string());
    values.insert(SEVERITY.to_string(), issue.severity.to_string());
    if let Some(assigned) = &issue.assigned {
        values.insert(ASSIGNED.to_string(), assigned.clone());
    }
    values.insert(SUMMARY.to_string(), issue.summary.clone());
    if let Some(creator) = &issue.creator {
        values.insert(CREATOR.to_string(), creator.clone());
    }
    values.insert(TIME.to_string(), format_timestamp(&issue.time));
    if !issue.extra_strings.is_empty() {
        let json = serde_json::to_string(&issue.extra_strings)
            .context("Failed to serialize extra_strings")?;
        values.insert(EXTRA_STRINGS.to_string(), json);
    }
    Ok(values)
}

/// Build an Issue from its stored fields. Comments are attached separately.
pub fn values_to_issue(uuid: Uuid, values: &Mapping) -> Result<Issue> {
    let mut issue = Issue::with_uuid(
        uuid,
        values.get(SUMMARY).cloned().unwrap_or_default(),
        values.get(CREATOR).cloned(),
    );
    if let Some(status) = values.get(STATUS) {
        issue.status = status.parse()?;
    }
    if let Some(severity) = values.get(SEVERITY) {
        issue.severity = severity.parse()?;
    }
    issue.assigned = values.get(ASSIGNED).cloned();
    if let Some(time) = values.get(TIME) {
        issue.time = parse_timestamp(time)?;
    }
    if let Some(json) = values.get(EXTRA_STRINGS) {
        issue.extra_strings = serde_json::from_str(json)
            .with_context(|| format!("Invalid extra_strings for issue {}", uuid))?;
    }
    for key in values.keys() {
        if ![STATUS, SEVERITY, ASSIGNED, SUMMARY, CREATOR, TIME, EXTRA_STRINGS].contains(&key.as_str()) {
            debug!(%uuid, key, "ignoring unknown issue field");
        }
    }
    Ok(issue)
}

/// Stored fields of a comment, without its body.
pub fn comment_to_values(comment: &Comment) -> Mapping {
    let mut values = Mapping::new();
    values.insert(AUTHOR.to_string(), comment.author.clone());
    values.insert(DATE.to_string(), format_timestamp(&comment.time));
    values.insert(CONTENT_TYPE.to_string(), comment.content_type.clone());
    if let Some(reply) = &comment.in_reply_to {
        values.insert(IN_REPLY_TO.to_string(), reply.clone());
    }
    if let Some(alt) = &comment.alt_id {
        values.insert(ALT_ID.to_string(), alt.clone());
    }
    values
}

pub fn values_to_comment(uuid: Uuid, values: &Mapping, body: String) -> Result<Comment> {
    let time = match values.get(DATE) {
        Some(date) => parse_timestamp(date)?,
        None => Utc::now(),
    };
    Ok(Comment {
        uuid,
        alt_id: values.get(ALT_ID).cloned(),
        author: values.get(AUTHOR).cloned().unwrap_or_default(),
        time,
        content_type: values
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        body,
        in_reply_to: values.get(IN_REPLY_TO).cloned(),
    })
}

/// Stored timestamps keep full precision; sibling order depends on it.
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a timestamp in RFC 2822, RFC 3339 or a few looser forms.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc2822(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }

    let formats = ["%Y-%m-%dT%H:%M:%S%:z", "%Y-%m-%d %H:%M:%S %z"];
    for format in &formats {
        if let Ok(t) = DateTime::parse_from_str(s, format) {
            return Ok(t.with_timezone(&Utc));
        }
    }

    // No offset given: assume UTC
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(t.and_utc());
        }
    }

    anyhow::bail!("Failed to parse timestamp: {}", s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Severity, Status};

    #[test]
    fn test_issue_roundtrip() {
        let mut issue = Issue::new("Title: with colon".to_string(), Some("Jane".to_string()));
        issue.status = Status::Assigned;
        issue.severity = Severity::Critical;
        issue.assigned = Some("John <john@example.com>".to_string());
        issue.add_extra_string("BLOCKS:x".to_string());
        issue.add_extra_string("TAG:with \"quotes\"".to_string());

        let values = issue_to_values(&issue).unwrap();
        assert_eq!(values["status"], "assigned");
        let parsed = values_to_issue(issue.uuid, &values).unwrap();

        assert_eq!(parsed.summary, issue.summary);
        assert_eq!(parsed.status, issue.status);
        assert_eq!(parsed.severity, issue.severity);
        assert_eq!(parsed.assigned, issue.assigned);
        assert_eq!(parsed.creator, issue.creator);
        assert_eq!(parsed.extra_strings, issue.extra_strings);
        assert_eq!(parsed.time, issue.time);
    }

    #[test]
    fn test_minimal_issue_defaults() {
        let mut values = Mapping::new();
        values.insert("summary".to_string(), "Bare".to_string());
        let issue = values_to_issue(Uuid::new_v4(), &values).unwrap();
        assert_eq!(issue.status, Status::Open);
        assert_eq!(issue.severity, Severity::Minor);
        assert!(issue.extra_strings.is_empty());

        values.insert("status".to_string(), "bogus".to_string());
        assert!(values_to_issue(Uuid::new_v4(), &values).is_err());
    }

    #[test]
    fn test_comment_roundtrip() {
        let mut comment = Comment::new("Jane".to_string(), "body\n".to_string(), None);
        comment.alt_id = Some("alt".to_string());
        comment.in_reply_to = Some(Uuid::new_v4().to_string());
        let values = comment_to_values(&comment);
        assert_eq!(values["Content-type"], "text/plain");
        let parsed = values_to_comment(comment.uuid, &values, comment.body.clone()).unwrap();
        assert_eq!(parsed.alt_id, comment.alt_id);
        assert_eq!(parsed.in_reply_to, comment.in_reply_to);
        assert_eq!(parsed.time, comment.time);
    }

    #[test]
    fn test_timestamp_forms() {
        let expected = 1_230_768_000;
        for s in [
            "Thu, 01 Jan 2009 00:00:00 +0000",
            "2009-01-01T00:00:00Z",
            "2009-01-01T01:00:00+01:00",
            "2009-01-01 00:00:00",
            "2009-01-01T00:00:00",
        ] {
            assert_eq!(parse_timestamp(s).unwrap().timestamp(), expected, "{s}");
        }
        assert!(parse_timestamp("yesterday").is_err());
    }
}
