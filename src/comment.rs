//! Threaded comments attached to an issue.
//!
//! Comments form a forest whose implicit root is the issue itself. The
//! forest is kept in an arena: every node records its parent (or `None`
//! for a direct reply to the issue) and its ordered children, and nodes are
//! addressed by [`CommentId`] indices that stay valid for the life of the
//! tree.
//!
//! A comment can be named by a *shortname* relative to its issue. With an
//! issue short id of `a`, the first reply to the issue is `a:1`, the
//! second reply to that one is `a:1.2`, and so on.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, TimeDelta, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::editor::{Editor, EditorError};
use crate::format::{format_timestamp, parse_timestamp};

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Root tags accepted by [`CommentTree::import_xml`].
pub const XML_ROOT_TAGS: [&str; 3] = ["bug", "issue", "comment-list"];

#[derive(Error, Debug)]
pub enum CommentError {
    #[error("Invalid id '{0}'")]
    InvalidShortname(String),

    #[error("No comment matches '{0}'")]
    NoSuchComment(String),

    #[error("No comment supplied, and no editor configured")]
    NoContent,

    #[error("No comment entered")]
    EmptyComment,

    #[error(transparent)]
    Editor(#[from] EditorError),

    #[error("Invalid XML: root element must be one of <bug>, <issue> or <comment-list>, found <{0}>")]
    InvalidRoot(String),

    #[error("Invalid XML: {0}")]
    Xml(String),

    #[error("Invalid <{field}> value '{value}'")]
    InvalidField { field: String, value: String },

    #[error("Clashing comment alt_id: {0}")]
    AltIdCollision(String),

    #[error("Comment {comment} replies to missing comment {reference}")]
    MissingReference { comment: String, reference: String },

    #[error("Comment {0} is part of a reply cycle")]
    ReferenceCycle(String),

    /// A linked comment is not reachable from the import target. This is a
    /// bug in the linking code, never a problem with the input.
    #[error("Internal error: comment {uuid} was not linked under its import target")]
    Integrity { uuid: Uuid },
}

pub type Result<T> = std::result::Result<T, CommentError>;

/// A single comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub uuid: Uuid,
    /// Caller-assigned secondary name.
    pub alt_id: Option<String>,
    pub author: String,
    pub time: DateTime<Utc>,
    pub content_type: String,
    pub body: String,
    /// UUID of the comment this replies to; `None` for a direct reply to
    /// the issue. Stored comments may also name their parent by alt-id.
    pub in_reply_to: Option<String>,
}

impl Comment {
    pub fn new(author: String, body: String, content_type: Option<&str>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            alt_id: None,
            author,
            time: Utc::now(),
            content_type: content_type.unwrap_or(DEFAULT_CONTENT_TYPE).to_string(),
            body,
            in_reply_to: None,
        }
    }

    pub fn is_text(&self) -> bool {
        self.content_type.starts_with("text/")
    }

    /// True if `id` is this comment's UUID or alt-id.
    pub fn matches_id(&self, id: &str) -> bool {
        self.uuid.to_string() == id || self.alt_id.as_deref() == Some(id)
    }
}

/// Index of a comment inside its [`CommentTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommentId(usize);

#[derive(Debug, Clone)]
struct Node {
    comment: Comment,
    parent: Option<CommentId>,
    children: Vec<CommentId>,
}

/// Options for [`CommentTree::import_xml`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Attach comments with unresolvable `in-reply-to` references to the
    /// import target instead of failing the whole import.
    pub ignore_missing_references: bool,
}

/// Where a comment in an import batch will hang.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Target,
    Existing(CommentId),
    Batch(usize),
}

#[derive(Debug, Clone, Default)]
pub struct CommentTree {
    nodes: Vec<Node>,
    roots: Vec<CommentId>,
}

impl CommentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tree from stored comments.
    ///
    /// Siblings are ordered by time, then UUID. A comment whose parent cannot
    /// be found, or that sits on a reply cycle, becomes a direct reply to the
    /// issue.
    pub fn from_comments(mut comments: Vec<Comment>) -> Self {
        comments.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.uuid.cmp(&b.uuid)));

        let mut by_id: HashMap<String, usize> = HashMap::new();
        for (i, c) in comments.iter().enumerate() {
            by_id.insert(c.uuid.to_string(), i);
        }
        for (i, c) in comments.iter().enumerate() {
            if let Some(alt) = &c.alt_id {
                by_id.entry(alt.clone()).or_insert(i);
            }
        }

        let mut parents: Vec<Option<usize>> = Vec::with_capacity(comments.len());
        for (i, c) in comments.iter_mut().enumerate() {
            let parent = match c.in_reply_to.as_deref() {
                None => None,
                Some(r) => match by_id.get(r) {
                    Some(&p) if p != i => Some(p),
                    _ => {
                        warn!(comment = %c.uuid, reference = r, "dropping unresolvable in-reply-to");
                        c.in_reply_to = None;
                        None
                    }
                },
            };
            parents.push(parent);
        }

        for i in 0..parents.len() {
            let mut seen = HashSet::from([i]);
            let mut cur = parents[i];
            while let Some(p) = cur {
                if !seen.insert(p) {
                    warn!(comment = %comments[p].uuid, "breaking reply cycle");
                    parents[p] = None;
                    comments[p].in_reply_to = None;
                    break;
                }
                cur = parents[p];
            }
        }

        let mut tree = CommentTree {
            nodes: Vec::with_capacity(comments.len()),
            roots: Vec::new(),
        };
        for (comment, parent) in comments.into_iter().zip(parents.iter()) {
            tree.nodes.push(Node {
                comment,
                parent: parent.map(CommentId),
                children: Vec::new(),
            });
        }
        for i in 0..tree.nodes.len() {
            tree.link(CommentId(i));
        }
        tree
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: CommentId) -> Option<&Comment> {
        self.nodes.get(id.0).map(|n| &n.comment)
    }

    /// Replace a comment's body. Structure is never changed after linking.
    pub fn set_body(&mut self, id: CommentId, body: String) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| CommentError::NoSuchComment(format!("#{}", id.0)))?;
        node.comment.body = body;
        Ok(())
    }

    /// Name a comment with an alt-id not yet used by any UUID or alt-id.
    pub fn set_alt_id(&mut self, id: CommentId, alt_id: String) -> Result<()> {
        if self
            .nodes
            .iter()
            .enumerate()
            .any(|(i, n)| i != id.0 && n.comment.matches_id(&alt_id))
        {
            return Err(CommentError::AltIdCollision(alt_id));
        }
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| CommentError::NoSuchComment(format!("#{}", id.0)))?;
        node.comment.alt_id = Some(alt_id);
        Ok(())
    }

    pub fn parent(&self, id: CommentId) -> Option<CommentId> {
        self.nodes.get(id.0).and_then(|n| n.parent)
    }

    /// Direct replies to `parent`, or to the issue when `parent` is `None`.
    pub fn children(&self, parent: Option<CommentId>) -> &[CommentId] {
        match parent {
            None => &self.roots,
            Some(id) => self
                .nodes
                .get(id.0)
                .map(|n| n.children.as_slice())
                .unwrap_or(&[]),
        }
    }

    /// Find a comment by UUID or alt-id. UUIDs win over alt-ids.
    pub fn find_by_id(&self, id: &str) -> Option<CommentId> {
        self.position(|c| c.uuid.to_string() == id)
            .or_else(|| self.position(|c| c.alt_id.as_deref() == Some(id)))
    }

    fn position(&self, pred: impl Fn(&Comment) -> bool) -> Option<CommentId> {
        self.nodes
            .iter()
            .position(|n| pred(&n.comment))
            .map(CommentId)
    }

    /// Depth-first walk below `parent`, yielding `(depth, id)` with direct
    /// replies at depth 1.
    pub fn thread(&self, parent: Option<CommentId>) -> Vec<(usize, CommentId)> {
        let mut out = Vec::new();
        let mut stack: Vec<(usize, CommentId)> = self
            .children(parent)
            .iter()
            .rev()
            .map(|&id| (1, id))
            .collect();
        while let Some((depth, id)) = stack.pop() {
            out.push((depth, id));
            stack.extend(self.children(Some(id)).iter().rev().map(|&c| (depth + 1, c)));
        }
        out
    }

    /// All comments in thread order.
    pub fn iter(&self) -> impl Iterator<Item = (CommentId, &Comment)> + '_ {
        self.thread(None)
            .into_iter()
            .map(move |(_, id)| (id, &self.nodes[id.0].comment))
    }

    /// True if `id` is `ancestor` or lies beneath it. Everything lies beneath
    /// the issue root (`None`).
    pub fn is_within(&self, id: CommentId, ancestor: Option<CommentId>) -> bool {
        let Some(ancestor) = ancestor else {
            return true;
        };
        let mut cur = Some(id);
        while let Some(c) = cur {
            if c == ancestor {
                return true;
            }
            cur = self.parent(c);
        }
        false
    }

    fn check_parent(&self, parent: Option<CommentId>) -> Result<()> {
        match parent {
            Some(id) if id.0 >= self.nodes.len() => {
                Err(CommentError::NoSuchComment(format!("#{}", id.0)))
            }
            _ => Ok(()),
        }
    }

    fn sibling_key(&self, id: CommentId) -> (DateTime<Utc>, Uuid) {
        let c = &self.nodes[id.0].comment;
        (c.time, c.uuid)
    }

    /// Insert `id` among its siblings in (time, UUID) order, the same order
    /// [`CommentTree::from_comments`] rebuilds, so shortnames survive a reload.
    fn link(&mut self, id: CommentId) {
        let key = self.sibling_key(id);
        let parent = self.nodes[id.0].parent;
        let siblings = match parent {
            None => &self.roots,
            Some(p) => &self.nodes[p.0].children,
        };
        let pos = siblings.partition_point(|&s| self.sibling_key(s) <= key);
        match parent {
            None => self.roots.insert(pos, id),
            Some(p) => self.nodes[p.0].children.insert(pos, id),
        }
    }

    /// A timestamp later than every comment in the tree.
    fn next_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.nodes.iter().map(|n| n.comment.time).max() {
            Some(latest) if latest >= now => latest + TimeDelta::nanoseconds(1),
            _ => now,
        }
    }

    /// Create a reply under `parent` (the issue itself when `None`).
    ///
    /// The comment is authored by the configured user, stamped with the
    /// current time (bumped past any later timestamp already in the tree)
    /// and appended as the parent's last child. It is not saved.
    pub fn new_reply(
        &mut self,
        parent: Option<CommentId>,
        body: String,
        content_type: Option<&str>,
        config: &Config,
    ) -> Result<CommentId> {
        self.check_parent(parent)?;
        let mut comment = Comment::new(config.user_id.clone(), body, content_type);
        comment.time = self.next_time();
        comment.in_reply_to = parent.map(|p| self.nodes[p.0].comment.uuid.to_string());

        let id = CommentId(self.nodes.len());
        self.nodes.push(Node {
            comment,
            parent,
            children: Vec::new(),
        });
        self.link(id);
        debug!(uuid = %self.nodes[id.0].comment.uuid, "added reply");
        Ok(id)
    }

    /// 1-based sibling positions from the issue root down to `id`.
    pub fn path(&self, id: CommentId) -> Vec<usize> {
        let mut path = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let parent = self.parent(c);
            let pos = self
                .children(parent)
                .iter()
                .position(|&s| s == c)
                .map_or(0, |p| p + 1);
            path.push(pos);
            cur = parent;
        }
        path.reverse();
        path
    }

    pub fn shortname(&self, issue_short: &str, id: CommentId) -> String {
        let path: Vec<String> = self.path(id).iter().map(ToString::to_string).collect();
        format!("{}:{}", issue_short, path.join("."))
    }

    /// Every comment with its shortname, in thread order.
    pub fn comment_shortnames(&self, issue_short: &str) -> Vec<(String, CommentId)> {
        self.thread(None)
            .into_iter()
            .map(|(_, id)| (self.shortname(issue_short, id), id))
            .collect()
    }

    /// Walk a dotted path such as `1.2.1` down from the issue root.
    pub fn resolve_path(&self, path: &str) -> Result<CommentId> {
        let mut cur: Option<CommentId> = None;
        for part in path.split('.') {
            let pos: usize = part
                .parse()
                .ok()
                .filter(|&p| p >= 1)
                .ok_or_else(|| CommentError::InvalidShortname(path.to_string()))?;
            let next = self
                .children(cur)
                .get(pos - 1)
                .copied()
                .ok_or_else(|| CommentError::NoSuchComment(path.to_string()))?;
            cur = Some(next);
        }
        cur.ok_or_else(|| CommentError::InvalidShortname(path.to_string()))
    }

    /// Resolve a full shortname. The issue part is assumed to name this
    /// tree's issue; `Ok(None)` means the shortname names the issue itself.
    pub fn comment_from_shortname(&self, shortname: &str) -> Result<Option<CommentId>> {
        match split_shortname(shortname)? {
            (_, None) => Ok(None),
            (_, Some(path)) => self.resolve_path(path).map(Some),
        }
    }

    /// Text quoted when composing a reply to `parent`.
    pub fn reply_source(&self, parent: Option<CommentId>, issue_summary: &str) -> String {
        match parent.and_then(|p| self.get(p)) {
            Some(comment) => comment.body.clone(),
            None => format!("{}\n", issue_summary),
        }
    }

    /// Import `<comment>` elements from an XML document as replies under
    /// `target`.
    ///
    /// The batch is all-or-nothing: on any error, including the final
    /// reachability check, the tree is left exactly as it was. Returns the
    /// ids of the new comments in document order.
    pub fn import_xml(
        &mut self,
        xml: &str,
        target: Option<CommentId>,
        options: ImportOptions,
        config: &Config,
    ) -> Result<Vec<CommentId>> {
        self.check_parent(target)?;
        let mut undated = self.next_time();
        let (batch, sources): (Vec<Comment>, Vec<Option<String>>) = parse_comment_list(xml)?
            .into_iter()
            .map(|fields| comment_from_fields(fields, config, &mut undated))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();
        self.link_batch(batch, &sources, target, options)
    }

    /// Link freshly built comments under `target`. `sources` holds each
    /// comment's `<uuid>` from the input, which other batch members may
    /// reply to.
    fn link_batch(
        &mut self,
        mut batch: Vec<Comment>,
        sources: &[Option<String>],
        target: Option<CommentId>,
        options: ImportOptions,
    ) -> Result<Vec<CommentId>> {
        let mut ids: HashSet<String> = HashSet::new();
        for node in &self.nodes {
            ids.insert(node.comment.uuid.to_string());
            if let Some(alt) = &node.comment.alt_id {
                ids.insert(alt.clone());
            }
        }
        for c in &batch {
            if let Some(alt) = &c.alt_id {
                if ids.contains(alt) {
                    return Err(CommentError::AltIdCollision(alt.clone()));
                }
            }
            ids.insert(c.uuid.to_string());
            if let Some(alt) = &c.alt_id {
                ids.insert(alt.clone());
            }
        }

        let target_uuid = target.map(|t| self.nodes[t.0].comment.uuid.to_string());
        let mut lookup: HashMap<String, Slot> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            lookup.insert(node.comment.uuid.to_string(), Slot::Existing(CommentId(i)));
        }
        for (i, c) in batch.iter().enumerate() {
            lookup.insert(c.uuid.to_string(), Slot::Batch(i));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if let Some(alt) = &node.comment.alt_id {
                lookup
                    .entry(alt.clone())
                    .or_insert(Slot::Existing(CommentId(i)));
            }
        }
        for (i, c) in batch.iter().enumerate() {
            if let Some(alt) = &c.alt_id {
                lookup.entry(alt.clone()).or_insert(Slot::Batch(i));
            }
        }
        for (i, source) in sources.iter().enumerate() {
            if let Some(source) = source {
                lookup.entry(source.clone()).or_insert(Slot::Batch(i));
            }
        }
        if let Some(uuid) = &target_uuid {
            lookup.insert(uuid.clone(), Slot::Target);
        }

        let lenient = options.ignore_missing_references;
        let mut parents = Vec::with_capacity(batch.len());
        for c in &batch {
            let resolved = match c.in_reply_to.as_deref() {
                None => Some(Slot::Target),
                Some(r) => match lookup.get(r) {
                    Some(Slot::Existing(id)) if !self.is_within(*id, target) => None,
                    Some(slot) => Some(*slot),
                    None => None,
                },
            };
            let slot = match resolved {
                Some(slot) => slot,
                None => {
                    let reference = c.in_reply_to.clone().unwrap_or_default();
                    if !lenient {
                        return Err(CommentError::MissingReference {
                            comment: label(c),
                            reference,
                        });
                    }
                    warn!(comment = %label(c), reference = %reference, "ignoring missing reference");
                    Slot::Target
                }
            };
            parents.push(slot);
        }

        for i in 0..parents.len() {
            while let Some(j) = find_batch_cycle(&parents, i) {
                if !lenient {
                    return Err(CommentError::ReferenceCycle(label(&batch[j])));
                }
                warn!(comment = %label(&batch[j]), "breaking reply cycle");
                parents[j] = Slot::Target;
            }
        }

        let uuids: Vec<Uuid> = batch.iter().map(|c| c.uuid).collect();
        for (c, slot) in batch.iter_mut().zip(&parents) {
            c.in_reply_to = match *slot {
                Slot::Target => target_uuid.clone(),
                Slot::Existing(id) => Some(self.nodes[id.0].comment.uuid.to_string()),
                Slot::Batch(j) => Some(uuids[j].to_string()),
            };
        }

        let snapshot = self.clone();
        let base = self.nodes.len();
        for (comment, slot) in batch.into_iter().zip(&parents) {
            let parent = match *slot {
                Slot::Target => target,
                Slot::Existing(id) => Some(id),
                Slot::Batch(j) => Some(CommentId(base + j)),
            };
            self.nodes.push(Node {
                comment,
                parent,
                children: Vec::new(),
            });
        }
        for i in base..self.nodes.len() {
            self.link(CommentId(i));
        }

        if let Err(e) = self.verify_reachable(target, &uuids) {
            *self = snapshot;
            return Err(e);
        }
        debug!(count = uuids.len(), "linked imported comments");
        Ok((base..self.nodes.len()).map(CommentId).collect())
    }

    /// Check that every UUID in `uuids` lies beneath `target`.
    fn verify_reachable(&self, target: Option<CommentId>, uuids: &[Uuid]) -> Result<()> {
        let reachable: HashSet<Uuid> = self
            .thread(target)
            .into_iter()
            .map(|(_, id)| self.nodes[id.0].comment.uuid)
            .collect();
        match uuids.iter().find(|u| !reachable.contains(u)) {
            Some(&uuid) => Err(CommentError::Integrity { uuid }),
            None => Ok(()),
        }
    }

    /// Render the comments beneath `parent` as a `<comment-list>` document
    /// that [`Self::import_xml`] accepts.
    pub fn to_xml(&self, issue_short: &str, parent: Option<CommentId>) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;
        writer
            .write_event(Event::Start(BytesStart::new("comment-list")))
            .map_err(xml_error)?;
        for (_, id) in self.thread(parent) {
            let c = &self.nodes[id.0].comment;
            writer
                .write_event(Event::Start(BytesStart::new("comment")))
                .map_err(xml_error)?;
            write_field(&mut writer, "uuid", &c.uuid.to_string())?;
            write_field(&mut writer, "short-name", &self.shortname(issue_short, id))?;
            if let Some(reply) = &c.in_reply_to {
                write_field(&mut writer, "in-reply-to", reply)?;
            }
            write_field(&mut writer, "author", &c.author)?;
            write_field(&mut writer, "date", &format_timestamp(&c.time))?;
            write_field(&mut writer, "content-type", &c.content_type)?;
            if let Some(alt) = &c.alt_id {
                write_field(&mut writer, "alt-id", alt)?;
            }
            write_field(&mut writer, "body", &c.body)?;
            writer
                .write_event(Event::End(BytesEnd::new("comment")))
                .map_err(xml_error)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("comment-list")))
            .map_err(xml_error)?;

        let mut out = String::from_utf8(writer.into_inner()).map_err(xml_error)?;
        out.push('\n');
        Ok(out)
    }
}

/// Walk the batch parent chain from `start`; if it loops, return a batch
/// index on the loop.
fn find_batch_cycle(parents: &[Slot], start: usize) -> Option<usize> {
    let mut seen = vec![start];
    let mut cur = parents[start];
    while let Slot::Batch(j) = cur {
        if seen.contains(&j) {
            return Some(j);
        }
        seen.push(j);
        cur = parents[j];
    }
    None
}

fn label(c: &Comment) -> String {
    c.alt_id.clone().unwrap_or_else(|| c.uuid.to_string())
}

fn xml_error(e: impl std::fmt::Display) -> CommentError {
    CommentError::Xml(e.to_string())
}

fn write_field<W: std::io::Write>(writer: &mut Writer<W>, name: &str, value: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_error)?;
    Ok(())
}

/// Split `issue:path` into its parts. More than one `:` is invalid.
pub fn split_shortname(shortname: &str) -> Result<(&str, Option<&str>)> {
    match shortname.matches(':').count() {
        0 => Ok((shortname, None)),
        1 => {
            let (issue, path) = shortname
                .split_once(':')
                .ok_or_else(|| CommentError::InvalidShortname(shortname.to_string()))?;
            if issue.is_empty() || path.is_empty() {
                return Err(CommentError::InvalidShortname(shortname.to_string()));
            }
            Ok((issue, Some(path)))
        }
        _ => Err(CommentError::InvalidShortname(shortname.to_string())),
    }
}

type Fields = HashMap<String, String>;

fn tag_name(start: &BytesStart<'_>) -> Result<String> {
    String::from_utf8(start.name().as_ref().to_vec()).map_err(xml_error)
}

fn check_root(name: &str) -> Result<()> {
    if XML_ROOT_TAGS.contains(&name) {
        Ok(())
    } else {
        Err(CommentError::InvalidRoot(name.to_string()))
    }
}

/// Pull the child fields of every `<comment>` under the root element.
fn parse_comment_list(xml: &str) -> Result<Vec<Fields>> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;
    let mut root: Option<String> = None;
    let mut items = Vec::new();
    let mut current: Option<Fields> = None;
    let mut field: Option<(String, String)> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                let name = tag_name(&e)?;
                match depth {
                    0 => {
                        if root.is_some() {
                            return Err(CommentError::Xml("multiple root elements".to_string()));
                        }
                        check_root(&name)?;
                        root = Some(name);
                    }
                    1 if name == "comment" => current = Some(Fields::new()),
                    1 => warn!(
                        "Ignoring unknown tag {} in {}",
                        name,
                        root.as_deref().unwrap_or_default()
                    ),
                    2 if current.is_some() => field = Some((name, String::new())),
                    _ => {}
                }
                depth += 1;
            }
            Event::Empty(e) => {
                let name = tag_name(&e)?;
                match depth {
                    0 => {
                        if root.is_some() {
                            return Err(CommentError::Xml("multiple root elements".to_string()));
                        }
                        check_root(&name)?;
                        root = Some(name);
                    }
                    1 if name == "comment" => items.push(Fields::new()),
                    1 => warn!(
                        "Ignoring unknown tag {} in {}",
                        name,
                        root.as_deref().unwrap_or_default()
                    ),
                    2 => {
                        if let Some(fields) = current.as_mut() {
                            fields.insert(name, String::new());
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) if depth == 3 => {
                if let Some((_, text)) = field.as_mut() {
                    text.push_str(&t.unescape().map_err(xml_error)?);
                }
            }
            Event::CData(c) if depth == 3 => {
                if let Some((_, text)) = field.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                match depth {
                    2 => {
                        if let (Some(fields), Some((name, text))) = (current.as_mut(), field.take()) {
                            fields.insert(name, text);
                        }
                    }
                    1 => {
                        if let Some(fields) = current.take() {
                            items.push(fields);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(CommentError::Xml("unexpected end of document".to_string()));
    }
    if root.is_none() {
        return Err(CommentError::InvalidRoot(String::new()));
    }
    Ok(items)
}

/// Build a comment from `<comment>` child fields, returned with the input
/// `<uuid>`. The UUID is always fresh; an input `<uuid>` only serves as the
/// alt-id when `<alt-id>` is absent. Unknown fields are ignored.
///
/// Comments without a `<date>` are stamped from `undated`, which advances
/// by a nanosecond each time so they keep their document order.
fn comment_from_fields(
    fields: Fields,
    config: &Config,
    undated: &mut DateTime<Utc>,
) -> Result<(Comment, Option<String>)> {
    let get = |name: &str| {
        fields
            .get(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let content_type = get("content-type").unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
    let mut comment = Comment::new(
        get("author").unwrap_or_else(|| config.user_id.clone()),
        String::new(),
        Some(content_type.as_str()),
    );
    comment.alt_id = get("alt-id").or_else(|| get("uuid"));
    comment.in_reply_to = get("in-reply-to");
    comment.time = match get("date") {
        Some(date) => parse_timestamp(&date).map_err(|_| CommentError::InvalidField {
            field: "date".to_string(),
            value: date.clone(),
        })?,
        None => {
            let time = *undated;
            *undated += TimeDelta::nanoseconds(1);
            time
        }
    };
    let body = fields.get("body").cloned().unwrap_or_default();
    comment.body = if comment.is_text() {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}\n", trimmed)
        }
    } else {
        body
    };
    Ok((comment, get("uuid")))
}

/// Seed text handed to the editor when composing a reply.
pub fn reply_seed(source: &str) -> String {
    let quoted: Vec<&str> = source.lines().collect();
    format!(
        "Please enter your comment above\n\n> {}\n",
        quoted.join("\n> ")
    )
}

/// Obtain a comment body: the supplied one, or else one typed into the
/// editor, seeded with `source` quoted line by line.
pub fn compose_body(
    body: Option<String>,
    source: &str,
    editor: Option<&dyn Editor>,
) -> Result<String> {
    if let Some(body) = body {
        return Ok(body);
    }
    let editor = editor.ok_or(CommentError::NoContent)?;
    let seed = reply_seed(source);
    let edited = editor.edit(&seed)?.ok_or(CommentError::EmptyComment)?;
    let text = edited.strip_suffix(seed.as_str()).unwrap_or(&edited);
    if text.trim().is_empty() {
        return Err(CommentError::EmptyComment);
    }
    Ok(ensure_trailing_newline(text.to_string()))
}

pub fn ensure_trailing_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}
