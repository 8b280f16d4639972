use crate::comment::{Comment, CommentTree};
use crate::config::{Config, ConfigFile};
use crate::format::{comment_to_values, issue_to_values, values_to_comment, values_to_issue};
use crate::tracker::Tracker;
use crate::types::Issue;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Name of the tracker directory inside a project
pub const EVERBUG_DIR: &str = ".everbug";

const CONFIG_FILE: &str = "config.yaml";
const ISSUES_DIR: &str = "issues";
const COMMENTS_DIR: &str = "comments";
const VALUES_FILE: &str = "values";
const BODY_FILE: &str = "body";

pub struct Storage {
    root: PathBuf,
    issues_dir: PathBuf,
    config: Config,
}

impl Storage {
    /// Get the tracker directory path
    pub fn dir(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Storage {
    /// Initialize a new tracker directory
    pub fn init(root: PathBuf, config: Config) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            anyhow::bail!("Tracker already initialized at {}", root.display());
        }

        let issues_dir = root.join(ISSUES_DIR);
        fs::create_dir_all(&issues_dir).context("Failed to create issues directory")?;
        config.to_file().save(&config_path)?;

        // Ensure .gitignore exists and has required entries
        ensure_gitignore(&root)?;

        debug!(dir = %root.display(), "initialized tracker");
        Ok(Self {
            root,
            issues_dir,
            config,
        })
    }

    /// Open an existing tracker directory, layering its config.yaml over `config`
    pub fn open(root: PathBuf, mut config: Config) -> Result<Self> {
        if !root.is_dir() {
            anyhow::bail!("No tracker directory at {}", root.display());
        }
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            config.apply_file(&ConfigFile::load(&config_path)?)?;
        }
        let issues_dir = root.join(ISSUES_DIR);
        fs::create_dir_all(&issues_dir).context("Failed to create issues directory")?;

        Ok(Self {
            root,
            issues_dir,
            config,
        })
    }

    fn issue_dir(&self, uuid: &Uuid) -> PathBuf {
        self.issues_dir.join(uuid.to_string())
    }

    fn read_values(&self, path: &Path) -> Result<crate::mapfile::Mapping> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.config
            .format
            .decode(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn write_values(&self, path: &Path, values: &crate::mapfile::Mapping) -> Result<()> {
        let text = self
            .config
            .format
            .encode(values, self.config.context)
            .with_context(|| format!("Failed to encode {}", path.display()))?;
        fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Load every issue with its comments, ordered by UUID
    pub fn load_tracker(&self) -> Result<Tracker> {
        let mut uuids = uuid_entries(&self.issues_dir)?;
        uuids.sort();

        let mut issues = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            issues.push(self.load_issue(&uuid)?);
        }
        debug!(count = issues.len(), "loaded issues");
        Tracker::from_issues(issues).context("Failed to index issues")
    }

    fn load_issue(&self, uuid: &Uuid) -> Result<Issue> {
        let dir = self.issue_dir(uuid);
        let values = self.read_values(&dir.join(VALUES_FILE))?;
        let mut issue = values_to_issue(*uuid, &values)
            .with_context(|| format!("Invalid issue {}", uuid))?;

        let comments_dir = dir.join(COMMENTS_DIR);
        if comments_dir.is_dir() {
            let mut comments = Vec::new();
            for comment_uuid in uuid_entries(&comments_dir)? {
                comments.push(self.load_comment(&comments_dir, &comment_uuid)?);
            }
            issue.comments = CommentTree::from_comments(comments);
        }
        Ok(issue)
    }

    fn load_comment(&self, comments_dir: &Path, uuid: &Uuid) -> Result<Comment> {
        let dir = comments_dir.join(uuid.to_string());
        let values = self.read_values(&dir.join(VALUES_FILE))?;
        let body_path = dir.join(BODY_FILE);
        let body = if body_path.exists() {
            fs::read_to_string(&body_path)
                .with_context(|| format!("Failed to read {}", body_path.display()))?
        } else {
            String::new()
        };
        values_to_comment(*uuid, &values, body).with_context(|| format!("Invalid comment {}", uuid))
    }

    /// Write an issue and all of its comments
    pub fn save_issue(&self, issue: &Issue) -> Result<()> {
        let dir = self.issue_dir(&issue.uuid);
        fs::create_dir_all(&dir).context("Failed to create issue directory")?;
        self.write_values(&dir.join(VALUES_FILE), &issue_to_values(issue)?)?;
        for (_, comment) in issue.comments.iter() {
            self.save_comment(&issue.uuid, comment)?;
        }
        debug!(uuid = %issue.uuid, "saved issue");
        Ok(())
    }

    pub fn save_comment(&self, issue: &Uuid, comment: &Comment) -> Result<()> {
        let dir = self
            .issue_dir(issue)
            .join(COMMENTS_DIR)
            .join(comment.uuid.to_string());
        fs::create_dir_all(&dir).context("Failed to create comment directory")?;
        self.write_values(&dir.join(VALUES_FILE), &comment_to_values(comment))?;
        let body_path = dir.join(BODY_FILE);
        fs::write(&body_path, &comment.body)
            .with_context(|| format!("Failed to write {}", body_path.display()))
    }

    pub fn save_tracker(&self, tracker: &Tracker) -> Result<()> {
        for issue in tracker.iter() {
            self.save_issue(issue)?;
        }
        Ok(())
    }
}

/// Sub-directories of `dir` named by a UUID
fn uuid_entries(dir: &Path) -> Result<Vec<Uuid>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory {}", dir.display()))?;

    let mut uuids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        match Uuid::parse_str(&name_str) {
            Ok(uuid) => uuids.push(uuid),
            Err(_) => warn!(path = %entry.path().display(), "skipping non-UUID directory"),
        }
    }
    Ok(uuids)
}

/// Search the current directory and its ancestors for a tracker directory
pub fn find_everbug_dir() -> Result<PathBuf> {
    let mut current = std::env::current_dir()?;

    loop {
        let dir = current.join(EVERBUG_DIR);
        if dir.is_dir() {
            return Ok(dir);
        }

        if !current.pop() {
            anyhow::bail!(
                "No {} directory found. Run 'eb init' to initialize a new tracker.",
                EVERBUG_DIR
            );
        }
    }
}

/// Ensure .gitignore exists and contains required entries
fn ensure_gitignore(root: &Path) -> Result<()> {
    let gitignore_path = root.join(".gitignore");
    let required_entries = ["command_history.log"];

    let existing = if gitignore_path.exists() {
        fs::read_to_string(&gitignore_path).context("Failed to read .gitignore")?
    } else {
        String::new()
    };

    let missing: Vec<&str> = required_entries
        .iter()
        .copied()
        .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    for entry in missing {
        content.push_str(entry);
        content.push('\n');
    }
    fs::write(&gitignore_path, content).context("Failed to write .gitignore")
}
