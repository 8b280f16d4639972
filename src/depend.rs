//! Issue dependencies stored as paired tags.
//!
//! A "blocks" relation between a blocker B and a blocked issue A lives in
//! two places: `BLOCKS:<A>` in B's extra strings and `BLOCKED-BY:<B>` in
//! A's. Merges can leave only one half of a pair behind, so
//! [`check_dependencies`] finds one-sided links and can add the missing
//! half.

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::select::ValueFilter;
use crate::tracker::Tracker;
use crate::types::{Issue, Severity, Status};

pub const BLOCKS_TAG: &str = "BLOCKS:";
pub const BLOCKED_BY_TAG: &str = "BLOCKED-BY:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependError {
    #[error("{0}")]
    Usage(String),

    #[error("Issue {0} not found")]
    UnknownIssue(Uuid),

    #[error("An issue cannot block itself")]
    SelfBlock,

    #[error("{blocker} does not block {blocked}")]
    NotLinked { blocked: Uuid, blocker: Uuid },
}

pub type Result<T> = std::result::Result<T, DependError>;

pub fn blocks_tag(blocked: &Uuid) -> String {
    format!("{BLOCKS_TAG}{blocked}")
}

pub fn blocked_by_tag(blocker: &Uuid) -> String {
    format!("{BLOCKED_BY_TAG}{blocker}")
}

/// Raw references after `prefix`, in extra-strings order.
fn tag_refs<'a>(issue: &'a Issue, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    issue
        .extra_strings
        .iter()
        .filter_map(move |s| s.strip_prefix(prefix))
}

fn parse_refs(issue: &Issue, prefix: &str) -> Vec<Uuid> {
    tag_refs(issue, prefix)
        .filter_map(|r| Uuid::parse_str(r).ok())
        .collect()
}

/// Issues that `issue` blocks.
pub fn get_blocks(issue: &Issue) -> Vec<Uuid> {
    parse_refs(issue, BLOCKS_TAG)
}

/// Issues blocking `issue`.
pub fn get_blocked_by(issue: &Issue) -> Vec<Uuid> {
    parse_refs(issue, BLOCKED_BY_TAG)
}

fn issue_mut<'a>(tracker: &'a mut Tracker, uuid: &Uuid) -> Result<&'a mut Issue> {
    tracker
        .get_mut(uuid)
        .ok_or(DependError::UnknownIssue(*uuid))
}

/// Record that `blocker` blocks `blocked`. Existing tags are not duplicated.
pub fn add_block(tracker: &mut Tracker, blocked: Uuid, blocker: Uuid) -> Result<()> {
    if blocked == blocker {
        return Err(DependError::SelfBlock);
    }
    if !tracker.contains(&blocker) {
        return Err(DependError::UnknownIssue(blocker));
    }
    issue_mut(tracker, &blocked)?.add_extra_string(blocked_by_tag(&blocker));
    issue_mut(tracker, &blocker)?.add_extra_string(blocks_tag(&blocked));
    debug!(%blocked, %blocker, "added dependency");
    Ok(())
}

/// Drop both halves of a link. Fails only if neither half was present.
pub fn remove_block(tracker: &mut Tracker, blocked: Uuid, blocker: Uuid) -> Result<()> {
    if !tracker.contains(&blocker) {
        return Err(DependError::UnknownIssue(blocker));
    }
    let a = issue_mut(tracker, &blocked)?.remove_extra_string(&blocked_by_tag(&blocker));
    let b = issue_mut(tracker, &blocker)?.remove_extra_string(&blocks_tag(&blocked));
    if !a && !b {
        return Err(DependError::NotLinked { blocked, blocker });
    }
    debug!(%blocked, %blocker, "removed dependency");
    Ok(())
}

/// One dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    pub blocked: Uuid,
    pub blocker: Uuid,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} |-- {}", self.blocked, self.blocker)
    }
}

/// A tag naming an issue that does not exist (or is not a UUID).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingRef {
    pub issue: Uuid,
    pub tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyReport {
    pub good: Vec<Link>,
    pub fixed: Vec<Link>,
    pub broken: Vec<Link>,
    pub dangling: Vec<DanglingRef>,
}

impl DependencyReport {
    pub fn is_consistent(&self) -> bool {
        self.broken.is_empty() && self.dangling.is_empty()
    }
}

/// Check that every link is recorded on both of its issues.
///
/// Each link is classified once. With `repair`, the missing half of every
/// one-sided link is added and the link reported as fixed; nothing is ever
/// removed. References to unknown issues are reported as dangling and left
/// alone.
pub fn check_dependencies(tracker: &mut Tracker, repair: bool) -> DependencyReport {
    let mut report = DependencyReport::default();
    let mut seen: HashSet<Link> = HashSet::new();

    for uuid in tracker.uuids() {
        let Some(issue) = tracker.get(&uuid) else {
            continue;
        };
        let blocked_by: Vec<String> = tag_refs(issue, BLOCKED_BY_TAG).map(String::from).collect();
        let blocks: Vec<String> = tag_refs(issue, BLOCKS_TAG).map(String::from).collect();

        for reference in blocked_by {
            let Some(blocker) = resolve_ref(tracker, &uuid, BLOCKED_BY_TAG, &reference, &mut report)
            else {
                continue;
            };
            let link = Link {
                blocked: uuid,
                blocker,
            };
            if seen.insert(link) {
                classify(tracker, link, &blocker, blocks_tag(&uuid), repair, &mut report);
            }
        }

        for reference in blocks {
            let Some(blocked) = resolve_ref(tracker, &uuid, BLOCKS_TAG, &reference, &mut report)
            else {
                continue;
            };
            let link = Link {
                blocked,
                blocker: uuid,
            };
            if seen.insert(link) {
                classify(tracker, link, &blocked, blocked_by_tag(&uuid), repair, &mut report);
            }
        }
    }
    report
}

fn resolve_ref(
    tracker: &Tracker,
    issue: &Uuid,
    prefix: &str,
    reference: &str,
    report: &mut DependencyReport,
) -> Option<Uuid> {
    match Uuid::parse_str(reference) {
        Ok(target) if tracker.contains(&target) => Some(target),
        _ => {
            warn!(%issue, reference, "dangling dependency reference");
            report.dangling.push(DanglingRef {
                issue: *issue,
                tag: format!("{prefix}{reference}"),
            });
            None
        }
    }
}

/// `other` is expected to carry `mirror_tag`.
fn classify(
    tracker: &mut Tracker,
    link: Link,
    other: &Uuid,
    mirror_tag: String,
    repair: bool,
    report: &mut DependencyReport,
) {
    let Some(issue) = tracker.get_mut(other) else {
        return;
    };
    if issue.extra_strings.contains(&mirror_tag) {
        report.good.push(link);
    } else if repair {
        issue.add_extra_string(mirror_tag);
        debug!(%link, "repaired one-way link");
        report.fixed.push(link);
    } else {
        report.broken.push(link);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow `BLOCKS:` tags: issues the root holds up.
    Blocks,
    /// Follow `BLOCKED-BY:` tags: issues holding up the root.
    BlockedBy,
}

impl Direction {
    fn children(self, issue: &Issue) -> Vec<Uuid> {
        match self {
            Direction::Blocks => get_blocks(issue),
            Direction::BlockedBy => get_blocked_by(issue),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TreeFilter {
    pub status: ValueFilter<Status>,
    pub severity: ValueFilter<Severity>,
}

impl TreeFilter {
    pub fn allows(&self, issue: &Issue) -> bool {
        self.status.allows(&issue.status) && self.severity.allows(&issue.severity)
    }
}

#[derive(Debug, Clone)]
struct TreeNode {
    uuid: Uuid,
    depth: usize,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Dependency tree rooted at one issue, expanded in one direction.
#[derive(Debug, Clone)]
pub struct DependencyTree {
    nodes: Vec<TreeNode>,
}

impl DependencyTree {
    /// Expand from `root` until `depth_limit` levels (no limit when `<= 0`)
    /// or until no children pass `filter`. The root itself is never
    /// filtered. An issue already on the path back to the root is not
    /// added again.
    pub fn build(
        tracker: &Tracker,
        root: Uuid,
        direction: Direction,
        depth_limit: i64,
        filter: &TreeFilter,
    ) -> Result<Self> {
        if !tracker.contains(&root) {
            return Err(DependError::UnknownIssue(root));
        }
        let limit = usize::try_from(depth_limit).ok().filter(|&d| d > 0);
        let mut nodes = vec![TreeNode {
            uuid: root,
            depth: 0,
            parent: None,
            children: Vec::new(),
        }];
        let mut stack = vec![0usize];

        while let Some(idx) = stack.pop() {
            let depth = nodes[idx].depth;
            if limit.is_some_and(|l| depth >= l) {
                continue;
            }
            let Some(issue) = tracker.get(&nodes[idx].uuid) else {
                continue;
            };
            for child in direction.children(issue) {
                let Some(child_issue) = tracker.get(&child) else {
                    continue;
                };
                if !filter.allows(child_issue) || on_path(&nodes, idx, &child) {
                    continue;
                }
                let child_idx = nodes.len();
                nodes.push(TreeNode {
                    uuid: child,
                    depth: depth + 1,
                    parent: Some(idx),
                    children: Vec::new(),
                });
                nodes[idx].children.push(child_idx);
                stack.push(child_idx);
            }
        }
        Ok(Self { nodes })
    }

    pub fn root(&self) -> Uuid {
        self.nodes[0].uuid
    }

    /// Number of issues below the root.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pre-order walk below the root, yielding `(depth, uuid)`.
    pub fn thread(&self) -> Vec<(usize, Uuid)> {
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.nodes[0].children.iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            out.push((node.depth, node.uuid));
            stack.extend(node.children.iter().rev());
        }
        out
    }
}

fn on_path(nodes: &[TreeNode], mut idx: usize, uuid: &Uuid) -> bool {
    loop {
        if nodes[idx].uuid == *uuid {
            return true;
        }
        match nodes[idx].parent {
            Some(p) => idx = p,
            None => return false,
        }
    }
}

/// What a `depend` invocation asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependMode {
    /// Report one-sided links without touching them.
    Check,
    /// Add the missing half of one-sided links.
    Repair,
    /// List direct blockers and blockees of an issue.
    Show { issue: String },
    /// Print dependency trees in both directions.
    Tree { issue: String, depth: i64 },
    /// Add (or remove) a link, then show the issue.
    Link {
        blocked: String,
        blocker: String,
        remove: bool,
    },
}

impl DependMode {
    pub fn from_args(
        issue: Option<&str>,
        blocker: Option<&str>,
        remove: bool,
        tree_depth: Option<i64>,
        repair: bool,
        check: bool,
    ) -> Result<Self> {
        if repair && check {
            return Err(DependError::Usage(
                "--repair and --check are mutually exclusive.".to_string(),
            ));
        }
        if repair || check {
            if issue.is_some() {
                return Err(DependError::Usage(
                    "No arguments with --repair calls.".to_string(),
                ));
            }
            return Ok(if repair {
                DependMode::Repair
            } else {
                DependMode::Check
            });
        }
        let Some(issue) = issue else {
            return Err(DependError::Usage(
                "Must specify either --repair or an issue ID".to_string(),
            ));
        };
        if tree_depth.is_some() && blocker.is_some() {
            return Err(DependError::Usage(
                "Only one issue ID used in tree mode.".to_string(),
            ));
        }
        if let Some(depth) = tree_depth {
            return Ok(DependMode::Tree {
                issue: issue.to_string(),
                depth,
            });
        }
        match blocker {
            Some(blocker) => Ok(DependMode::Link {
                blocked: issue.to_string(),
                blocker: blocker.to_string(),
                remove,
            }),
            None if remove => Err(DependError::Usage(
                "--remove needs a blocking issue ID".to_string(),
            )),
            None => Ok(DependMode::Show {
                issue: issue.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(n: usize) -> (Tracker, Vec<Uuid>) {
        let mut tracker = Tracker::new();
        let mut ids = Vec::new();
        for i in 0..n {
            let issue = Issue::new(format!("Issue {i}"), None);
            ids.push(issue.uuid);
            tracker.add(issue).unwrap();
        }
        (tracker, ids)
    }

    #[test]
    fn test_add_block_pairs_tags() {
        let (mut t, ids) = tracker(2);
        let (a, b) = (ids[0], ids[1]);
        add_block(&mut t, a, b).unwrap();
        assert_eq!(get_blocked_by(t.get(&a).unwrap()), vec![b]);
        assert_eq!(get_blocks(t.get(&b).unwrap()), vec![a]);

        add_block(&mut t, a, b).unwrap();
        assert_eq!(t.get(&a).unwrap().extra_strings.len(), 1);
        assert_eq!(add_block(&mut t, a, a), Err(DependError::SelfBlock));
    }

    #[test]
    fn test_remove_block_keeps_unrelated_tags() {
        let (mut t, ids) = tracker(2);
        let (a, b) = (ids[0], ids[1]);
        t.get_mut(&a).unwrap().add_extra_string("TAG:keep".to_string());
        add_block(&mut t, a, b).unwrap();
        remove_block(&mut t, a, b).unwrap();
        assert_eq!(t.get(&a).unwrap().extra_strings, vec!["TAG:keep"]);
        assert!(t.get(&b).unwrap().extra_strings.is_empty());
        assert_eq!(
            remove_block(&mut t, a, b),
            Err(DependError::NotLinked {
                blocked: a,
                blocker: b
            })
        );
    }

    #[test]
    fn test_check_good_broken_fixed_cycle() {
        let (mut t, ids) = tracker(2);
        let (a, b) = (ids[0], ids[1]);
        let link = Link {
            blocked: a,
            blocker: b,
        };
        add_block(&mut t, a, b).unwrap();
        let report = check_dependencies(&mut t, false);
        assert_eq!(report.good, vec![link]);
        assert!(report.is_consistent());

        t.get_mut(&b).unwrap().remove_extra_string(&blocks_tag(&a));
        let report = check_dependencies(&mut t, false);
        assert_eq!(report.broken, vec![link]);
        assert!(report.good.is_empty());

        let report = check_dependencies(&mut t, true);
        assert_eq!(report.fixed, vec![link]);
        assert!(report.broken.is_empty());

        let report = check_dependencies(&mut t, true);
        assert!(report.fixed.is_empty());
        assert_eq!(report.good, vec![link]);
    }

    #[test]
    fn test_repair_adds_missing_blocked_by() {
        let (mut t, ids) = tracker(2);
        let (a, b) = (ids[0], ids[1]);
        t.get_mut(&b).unwrap().add_extra_string(blocks_tag(&a));
        let report = check_dependencies(&mut t, true);
        assert_eq!(report.fixed.len(), 1);
        assert_eq!(get_blocked_by(t.get(&a).unwrap()), vec![b]);
        assert_eq!(report.fixed[0].to_string(), format!("{a} |-- {b}"));
    }

    #[test]
    fn test_dangling_refs_are_not_repaired() {
        let (mut t, ids) = tracker(1);
        let ghost = Uuid::new_v4();
        let issue = t.get_mut(&ids[0]).unwrap();
        issue.add_extra_string(blocked_by_tag(&ghost));
        issue.add_extra_string("BLOCKS:not-a-uuid".to_string());
        let report = check_dependencies(&mut t, true);
        assert_eq!(report.dangling.len(), 2);
        assert!(report.fixed.is_empty() && report.broken.is_empty());
        assert_eq!(t.get(&ids[0]).unwrap().extra_strings.len(), 2);
    }

    #[test]
    fn test_tree_depth_and_filters() {
        let (mut t, ids) = tracker(4);
        // 0 <- 1 <- 2 <- 3
        add_block(&mut t, ids[0], ids[1]).unwrap();
        add_block(&mut t, ids[1], ids[2]).unwrap();
        add_block(&mut t, ids[2], ids[3]).unwrap();

        let all = TreeFilter::default();
        let tree = DependencyTree::build(&t, ids[0], Direction::BlockedBy, 0, &all).unwrap();
        assert_eq!(tree.thread(), vec![(1, ids[1]), (2, ids[2]), (3, ids[3])]);

        let tree = DependencyTree::build(&t, ids[0], Direction::BlockedBy, 2, &all).unwrap();
        assert_eq!(tree.len(), 2);

        let tree = DependencyTree::build(&t, ids[3], Direction::Blocks, -1, &all).unwrap();
        assert_eq!(tree.thread().last(), Some(&(3, ids[0])));

        t.get_mut(&ids[2]).unwrap().status = Status::Closed;
        let open_only = TreeFilter {
            status: ValueFilter::parse("-closed", &Status::ALL, "status").unwrap(),
            ..TreeFilter::default()
        };
        let tree = DependencyTree::build(&t, ids[0], Direction::BlockedBy, 0, &open_only).unwrap();
        assert_eq!(tree.thread(), vec![(1, ids[1])]);
    }

    #[test]
    fn test_tree_stops_on_cycles() {
        let (mut t, ids) = tracker(2);
        add_block(&mut t, ids[0], ids[1]).unwrap();
        add_block(&mut t, ids[1], ids[0]).unwrap();
        let tree =
            DependencyTree::build(&t, ids[0], Direction::Blocks, 0, &TreeFilter::default()).unwrap();
        assert_eq!(tree.thread(), vec![(1, ids[1])]);
    }

    #[test]
    fn test_mode_usage_errors() {
        assert!(matches!(
            DependMode::from_args(Some("a"), None, false, None, true, false),
            Err(DependError::Usage(_))
        ));
        assert!(matches!(
            DependMode::from_args(None, None, false, None, false, false),
            Err(DependError::Usage(_))
        ));
        assert!(matches!(
            DependMode::from_args(Some("a"), Some("b"), false, Some(2), false, false),
            Err(DependError::Usage(_))
        ));
        assert_eq!(
            DependMode::from_args(None, None, false, None, true, false).unwrap(),
            DependMode::Repair
        );
        assert_eq!(
            DependMode::from_args(Some("a"), None, false, Some(0), false, false).unwrap(),
            DependMode::Tree {
                issue: "a".to_string(),
                depth: 0
            }
        );
    }
}
