//! In-memory issue collection.
//!
//! Issues keep the order in which they were added (storage loads them sorted
//! by UUID), and can be looked up by full UUID or by any unique UUID prefix.

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::types::Issue;

/// Short ids never get shorter than this.
pub const MIN_SHORT_ID: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("No issue matches '{0}'")]
    NotFound(String),

    #[error("Ambiguous id '{id}' matches: {candidates}")]
    Ambiguous { id: String, candidates: String },

    #[error("Duplicate issue {0}")]
    Duplicate(Uuid),
}

#[derive(Debug, Clone, Default)]
pub struct Tracker {
    issues: Vec<Issue>,
    index: HashMap<Uuid, usize>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_issues(issues: impl IntoIterator<Item = Issue>) -> Result<Self, TrackerError> {
        let mut tracker = Self::new();
        for issue in issues {
            tracker.add(issue)?;
        }
        Ok(tracker)
    }

    pub fn add(&mut self, issue: Issue) -> Result<&mut Issue, TrackerError> {
        if self.index.contains_key(&issue.uuid) {
            return Err(TrackerError::Duplicate(issue.uuid));
        }
        let pos = self.issues.len();
        self.index.insert(issue.uuid, pos);
        self.issues.push(issue);
        Ok(&mut self.issues[pos])
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter()
    }

    pub fn uuids(&self) -> Vec<Uuid> {
        self.issues.iter().map(|i| i.uuid).collect()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.index.contains_key(uuid)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&Issue> {
        self.index.get(uuid).map(|&i| &self.issues[i])
    }

    pub fn get_mut(&mut self, uuid: &Uuid) -> Option<&mut Issue> {
        match self.index.get(uuid) {
            Some(&i) => self.issues.get_mut(i),
            None => None,
        }
    }

    /// Resolve a full UUID or a unique prefix of one.
    pub fn resolve(&self, id: &str) -> Result<Uuid, TrackerError> {
        if let Ok(uuid) = Uuid::parse_str(id) {
            if self.contains(&uuid) {
                return Ok(uuid);
            }
        }
        let id_lower = id.to_ascii_lowercase();
        let matches: Vec<Uuid> = self
            .issues
            .iter()
            .map(|i| i.uuid)
            .filter(|u| !id.is_empty() && u.to_string().starts_with(&id_lower))
            .collect();
        match matches.as_slice() {
            [] => Err(TrackerError::NotFound(id.to_string())),
            [uuid] => Ok(*uuid),
            _ => Err(TrackerError::Ambiguous {
                id: id.to_string(),
                candidates: matches
                    .iter()
                    .map(|u| self.short_id(u))
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    pub fn lookup(&self, id: &str) -> Result<&Issue, TrackerError> {
        let uuid = self.resolve(id)?;
        self.get(&uuid)
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    pub fn lookup_mut(&mut self, id: &str) -> Result<&mut Issue, TrackerError> {
        let uuid = self.resolve(id)?;
        self.get_mut(&uuid)
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    /// Shortest prefix of `uuid` that no other issue shares, at least
    /// [`MIN_SHORT_ID`] characters long.
    pub fn short_id(&self, uuid: &Uuid) -> String {
        let full = uuid.to_string();
        let others: Vec<String> = self
            .issues
            .iter()
            .filter(|i| i.uuid != *uuid)
            .map(|i| i.uuid.to_string())
            .collect();
        let len = (MIN_SHORT_ID..full.len())
            .find(|&n| others.iter().all(|o| !o.starts_with(&full[..n])))
            .unwrap_or(full.len());
        full[..len].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(uuid: &str, summary: &str) -> Issue {
        Issue::with_uuid(Uuid::parse_str(uuid).unwrap(), summary.to_string(), None)
    }

    fn sample() -> Tracker {
        Tracker::from_issues([
            issue("a0000000-0000-4000-8000-000000000000", "Bug A"),
            issue("a1000000-0000-4000-8000-000000000000", "Bug B"),
            issue("b0000000-0000-4000-8000-000000000000", "Bug C"),
        ])
        .unwrap()
    }

    #[test]
    fn test_short_ids() {
        let tracker = sample();
        let ids: Vec<String> = tracker.iter().map(|i| tracker.short_id(&i.uuid)).collect();
        assert_eq!(ids, vec!["a00", "a10", "b00"]);
    }

    #[test]
    fn test_lookup_by_prefix_and_uuid() {
        let tracker = sample();
        assert_eq!(tracker.lookup("b").unwrap().summary, "Bug C");
        assert_eq!(tracker.lookup("A1").unwrap().summary, "Bug B");
        assert_eq!(
            tracker
                .lookup("a0000000-0000-4000-8000-000000000000")
                .unwrap()
                .summary,
            "Bug A"
        );
        assert!(matches!(
            tracker.lookup("a").unwrap_err(),
            TrackerError::Ambiguous { .. }
        ));
        assert_eq!(
            tracker.lookup("c").unwrap_err(),
            TrackerError::NotFound("c".to_string())
        );
        assert!(tracker.lookup("").is_err());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut tracker = sample();
        let err = tracker
            .add(issue("b0000000-0000-4000-8000-000000000000", "again"))
            .unwrap_err();
        assert!(matches!(err, TrackerError::Duplicate(_)));
        assert_eq!(tracker.len(), 3);
    }
}
