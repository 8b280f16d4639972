use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use everbug::comment::{
    compose_body, ensure_trailing_newline, split_shortname, CommentId, ImportOptions,
    DEFAULT_CONTENT_TYPE,
};
use everbug::config::Config;
use everbug::depend::{self, DependMode, DependencyReport, DependencyTree, Direction, TreeFilter};
use everbug::editor::{Editor, ExternalEditor};
use everbug::logging::init_logging;
use everbug::mapfile::Format;
use everbug::select::ValueFilter;
use everbug::storage::{find_everbug_dir, Storage, EVERBUG_DIR};
use everbug::tracker::Tracker;
use everbug::types::{Issue, IssueSummary, Severity, Status};
use regex::Regex;
use std::collections::BTreeSet;
use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[allow(dead_code)]
mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser)]
#[command(name = "eb", about = "Everbug - a distributed issue tracker", version)]
struct Cli {
    /// Path to the .everbug directory (supports EB_DIR env var)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Disable command logging to .everbug/command_history.log
    #[arg(long, global = true)]
    no_cmd_logging: bool,

    /// More diagnostics on stderr (repeatable)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only report errors on stderr
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a tracker in the current directory
    Init {
        /// Record format version (1 or 2)
        #[arg(long)]
        format: Option<Format>,

        /// Context lines written around each value
        #[arg(long)]
        context: Option<usize>,
    },

    /// Create a new issue
    New {
        /// One-line summary
        summary: String,

        /// Initial severity
        #[arg(long)]
        severity: Option<Severity>,
    },

    /// List issues
    List {
        /// Statuses to show, e.g. open,assigned or -closed (default: active ones)
        #[arg(long, allow_hyphen_values = true)]
        status: Option<String>,

        /// Severities to show, e.g. serious,critical or -target
        #[arg(long, allow_hyphen_values = true)]
        severity: Option<String>,

        /// Only show issues with an extra string matching one of these regexes
        #[arg(long, value_name = "RE,..")]
        extra_strings: Option<String>,

        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Show an issue or comment
    Show {
        /// Issue ID or comment shortname (e.g. abc:1.2)
        id: String,

        /// Dump the comments as XML
        #[arg(long)]
        xml: bool,
    },

    /// Add a comment to an issue or reply to a comment
    Comment {
        /// Issue ID or comment shortname to reply to
        id: String,

        /// Comment text, or '-' for stdin. Launches $EDITOR when omitted.
        body: Option<String>,

        /// Author (defaults to the current user)
        #[arg(short, long)]
        author: Option<String>,

        /// Alternate id for the new comment
        #[arg(long)]
        alt_id: Option<String>,

        /// MIME type of the body
        #[arg(short, long)]
        content_type: Option<String>,

        /// BODY is an XML <comment-list> to import
        #[arg(long)]
        xml: bool,

        /// Attach imported comments with unknown in-reply-to to the target
        #[arg(long)]
        ignore_missing_references: bool,
    },

    /// Add, remove or inspect issue dependencies
    Depend {
        /// Blocked issue
        issue: Option<String>,

        /// Blocking issue
        blocker: Option<String>,

        /// Remove the dependency instead of adding it
        #[arg(short, long)]
        remove: bool,

        /// Show the status of related issues
        #[arg(short, long)]
        show_status: bool,

        /// Only follow issues matching these statuses (tree mode)
        #[arg(long, allow_hyphen_values = true)]
        status: Option<String>,

        /// Only follow issues matching these severities (tree mode)
        #[arg(long, allow_hyphen_values = true)]
        severity: Option<String>,

        /// Print dependency trees DEPTH levels deep (<= 0 for no limit)
        #[arg(short, long, value_name = "DEPTH", allow_negative_numbers = true)]
        tree_depth: Option<i64>,

        /// Check for and repair one-way links
        #[arg(long)]
        repair: bool,

        /// Report one-way links without repairing them
        #[arg(long)]
        check: bool,
    },

    /// Show or set an issue's status
    Status {
        id: String,
        value: Option<Status>,
    },

    /// Show or set an issue's severity
    Severity {
        id: String,
        value: Option<Severity>,
    },

    /// Show or set an issue's assignee ('-' for yourself, 'none' to clear)
    Assign {
        id: String,
        assignee: Option<String>,
    },

    /// Show version information
    Version,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let mut config = Config::from_env();

    match cli.command {
        Commands::Init { format, context } => {
            let root = match &cli.dir {
                Some(dir) => dir.clone(),
                None => env::var("EB_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(EVERBUG_DIR)),
            };
            if let Some(format) = format {
                config.format = format;
            }
            if let Some(context) = context {
                if context == 0 {
                    anyhow::bail!("--context must be at least 1");
                }
                config.context = context;
            }
            let storage = Storage::init(root, config)?;

            // Log command after successful init
            if !cli.no_cmd_logging {
                let _ = log_command(storage.dir(), &env::args().collect::<Vec<_>>());
            }

            println!(
                "Initialized everbug tracker in {} (format {})",
                storage.dir().display(),
                storage.config().format
            );
            Ok(())
        }

        Commands::Version => {
            print_version();
            Ok(())
        }

        command => {
            let storage = get_storage(&cli.dir, config)?;

            // Log command after storage is validated
            if !cli.no_cmd_logging {
                let _ = log_command(storage.dir(), &env::args().collect::<Vec<_>>());
            }

            let mut tracker = storage.load_tracker()?;
            execute(command, &storage, &mut tracker)
        }
    }
}

fn execute(command: Commands, storage: &Storage, tracker: &mut Tracker) -> Result<()> {
    match command {
        Commands::New { summary, severity } => {
            if summary.trim().is_empty() || summary.contains('\n') {
                anyhow::bail!("Summary must be a single non-empty line");
            }
            let mut issue = Issue::new(summary, Some(storage.config().user_id.clone()));
            if let Some(severity) = severity {
                issue.severity = severity;
            }
            storage.save_issue(&issue)?;
            let uuid = issue.uuid;
            tracker.add(issue)?;
            println!("Created issue with ID {}", tracker.short_id(&uuid));
            Ok(())
        }

        Commands::List {
            status,
            severity,
            extra_strings,
            json,
        } => cmd_list(tracker, status, severity, extra_strings, json),

        Commands::Show { id, xml } => cmd_show(tracker, &id, xml),

        Commands::Comment {
            id,
            body,
            author,
            alt_id,
            content_type,
            xml,
            ignore_missing_references,
        } => {
            let mut config = storage.config().clone();
            if let Some(author) = author {
                config.user_id = author;
            }
            let input = match body.as_deref() {
                Some("-") => Some(read_stdin()?),
                Some(text) => Some(text.to_string()),
                None => None,
            };
            if xml {
                if alt_id.is_some() || content_type.is_some() {
                    anyhow::bail!("--alt-id and --content-type do not apply to --xml imports");
                }
                let input = input.context("--xml needs the document as BODY or on stdin ('-')")?;
                let options = ImportOptions {
                    ignore_missing_references,
                };
                cmd_import(storage, tracker, &id, &input, options, &config)
            } else {
                cmd_comment(storage, tracker, &id, input, alt_id, content_type, &config)
            }
        }

        Commands::Depend {
            issue,
            blocker,
            remove,
            show_status,
            status,
            severity,
            tree_depth,
            repair,
            check,
        } => {
            let mode = DependMode::from_args(
                issue.as_deref(),
                blocker.as_deref(),
                remove,
                tree_depth,
                repair,
                check,
            )?;
            let filter = TreeFilter {
                status: ValueFilter::parse_opt(status.as_deref(), &Status::ALL, "status")?,
                severity: ValueFilter::parse_opt(severity.as_deref(), &Severity::ALL, "severity")?,
            };
            cmd_depend(storage, tracker, mode, &filter, show_status)
        }

        Commands::Status { id, value } => {
            let issue = tracker.lookup_mut(&id)?;
            match value {
                None => println!("{}", issue.status),
                Some(status) => {
                    issue.status = status;
                    storage.save_issue(issue)?;
                }
            }
            Ok(())
        }

        Commands::Severity { id, value } => {
            let issue = tracker.lookup_mut(&id)?;
            match value {
                None => println!("{}", issue.severity),
                Some(severity) => {
                    issue.severity = severity;
                    storage.save_issue(issue)?;
                }
            }
            Ok(())
        }

        Commands::Assign { id, assignee } => {
            let user = storage.config().user_id.clone();
            let issue = tracker.lookup_mut(&id)?;
            match assignee.as_deref() {
                None => println!("{}", issue.assigned.as_deref().unwrap_or("None")),
                Some(value) => {
                    issue.assigned = match value {
                        "-" => Some(user),
                        "none" => None,
                        other => Some(other.to_string()),
                    };
                    storage.save_issue(issue)?;
                }
            }
            Ok(())
        }

        Commands::Init { .. } | Commands::Version => Ok(()),
    }
}

fn cmd_list(
    tracker: &Tracker,
    status: Option<String>,
    severity: Option<String>,
    extra_strings: Option<String>,
    json: bool,
) -> Result<()> {
    let status_filter = match status.as_deref() {
        Some(selection) => ValueFilter::parse(selection, &Status::ALL, "status")?,
        None => ValueFilter::Only(Status::ALL.iter().copied().filter(Status::is_active).collect()),
    };
    let severity_filter = ValueFilter::parse_opt(severity.as_deref(), &Severity::ALL, "severity")?;
    let patterns = match extra_strings.as_deref() {
        Some(list) => list
            .split(',')
            .map(|p| Regex::new(&format!("^(?:{})", p)).with_context(|| format!("Invalid regex '{}'", p)))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    let mut issues: Vec<&Issue> = tracker
        .iter()
        .filter(|i| status_filter.allows(&i.status) && severity_filter.allows(&i.severity))
        .filter(|i| {
            patterns.is_empty()
                || i.extra_strings
                    .iter()
                    .any(|s| patterns.iter().any(|re| re.is_match(s)))
        })
        .collect();
    let status_rank = |s: &Status| Status::ALL.iter().position(|x| x == s);
    issues.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| status_rank(&a.status).cmp(&status_rank(&b.status)))
            .then_with(|| a.time.cmp(&b.time))
    });

    if json {
        let summaries: Vec<IssueSummary> = issues
            .iter()
            .map(|i| IssueSummary::new(i, tracker.short_id(&i.uuid)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        for issue in issues {
            println!("{}", issue.short_line(&tracker.short_id(&issue.uuid)));
        }
    }
    Ok(())
}

/// Resolve `issue[:path]` to an issue and an optional comment in it
fn resolve_target(tracker: &Tracker, id: &str) -> Result<(Uuid, Option<CommentId>)> {
    let (issue_part, path) = split_shortname(id)?;
    let uuid = tracker.resolve(issue_part)?;
    let comment = match path {
        None => None,
        Some(path) => {
            let issue = tracker
                .get(&uuid)
                .with_context(|| format!("Issue {} not loaded", uuid))?;
            Some(issue.comments.resolve_path(path)?)
        }
    };
    Ok((uuid, comment))
}

fn cmd_show(tracker: &Tracker, id: &str, xml: bool) -> Result<()> {
    let (uuid, comment) = resolve_target(tracker, id)?;
    let issue = tracker
        .get(&uuid)
        .with_context(|| format!("Issue {} not loaded", uuid))?;
    let short = tracker.short_id(&uuid);

    if xml {
        print!("{}", issue.comments.to_xml(&short, comment)?);
        return Ok(());
    }
    match comment {
        Some(cid) => print_comment(issue, &short, cid, 0),
        None => {
            println!("          ID : {}", issue.uuid);
            println!("  Short name : {}", short);
            println!("    Severity : {}", issue.severity);
            println!("      Status : {}", issue.status);
            println!("    Assigned : {}", issue.assigned.as_deref().unwrap_or(""));
            println!("     Creator : {}", issue.creator.as_deref().unwrap_or(""));
            println!("     Created : {}", issue.time.to_rfc2822());
            println!("{}", issue.summary);
            for (depth, cid) in issue.comments.thread(None) {
                print_comment(issue, &short, cid, depth - 1);
            }
        }
    }
    Ok(())
}

fn print_comment(issue: &Issue, short: &str, id: CommentId, indent: usize) {
    let Some(comment) = issue.comments.get(id) else {
        return;
    };
    let pad = "    ".repeat(indent);
    println!("{}--------- Comment ---------", pad);
    println!("{}Name: {}", pad, issue.comments.shortname(short, id));
    println!("{}From: {}", pad, comment.author);
    println!("{}Date: {}", pad, comment.time.to_rfc2822());
    println!();
    if comment.is_text() {
        for line in comment.body.lines() {
            println!("{}{}", pad, line);
        }
    } else {
        println!(
            "{}Content type {} not printable. Try XML output instead",
            pad, comment.content_type
        );
    }
}

fn cmd_comment(
    storage: &Storage,
    tracker: &mut Tracker,
    id: &str,
    input: Option<String>,
    alt_id: Option<String>,
    content_type: Option<String>,
    config: &Config,
) -> Result<()> {
    let (uuid, parent) = resolve_target(tracker, id)?;
    let short = tracker.short_id(&uuid);
    let issue = tracker
        .get_mut(&uuid)
        .with_context(|| format!("Issue {} not loaded", uuid))?;

    let source = issue.comments.reply_source(parent, &issue.summary);
    let editor = ExternalEditor::from_config(config.editor.as_deref());
    let body = compose_body(input, &source, editor.as_ref().map(|e| e as &dyn Editor))?;
    let content_type = content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
    let body = if content_type.starts_with("text/") {
        ensure_trailing_newline(body)
    } else {
        body
    };

    let cid = issue
        .comments
        .new_reply(parent, body, Some(content_type.as_str()), config)?;
    if let Some(alt_id) = alt_id {
        issue.comments.set_alt_id(cid, alt_id)?;
    }
    let comment = issue
        .comments
        .get(cid)
        .context("New comment missing from tree")?;
    storage.save_comment(&uuid, comment)?;
    println!(
        "Created comment with ID {}",
        issue.comments.shortname(&short, cid)
    );
    Ok(())
}

fn cmd_import(
    storage: &Storage,
    tracker: &mut Tracker,
    id: &str,
    xml: &str,
    options: ImportOptions,
    config: &Config,
) -> Result<()> {
    let (uuid, target) = resolve_target(tracker, id)?;
    let short = tracker.short_id(&uuid);
    let issue = tracker
        .get_mut(&uuid)
        .with_context(|| format!("Issue {} not loaded", uuid))?;

    let ids = issue.comments.import_xml(xml, target, options, config)?;
    for &cid in &ids {
        if let Some(comment) = issue.comments.get(cid) {
            storage.save_comment(&uuid, comment)?;
        }
    }
    for cid in ids {
        println!(
            "Created comment with ID {}",
            issue.comments.shortname(&short, cid)
        );
    }
    Ok(())
}

fn cmd_depend(
    storage: &Storage,
    tracker: &mut Tracker,
    mode: DependMode,
    filter: &TreeFilter,
    show_status: bool,
) -> Result<()> {
    match mode {
        DependMode::Repair => {
            let report = depend::check_dependencies(tracker, true);
            let touched: BTreeSet<Uuid> = report
                .fixed
                .iter()
                .flat_map(|link| [link.blocked, link.blocker])
                .collect();
            for uuid in touched {
                if let Some(issue) = tracker.get(&uuid) {
                    storage.save_issue(issue)?;
                }
            }
            if !report.fixed.is_empty() {
                println!("Fixed the following links:");
                for link in &report.fixed {
                    println!("{}", link);
                }
            }
            print_dangling(tracker, &report);
        }

        DependMode::Check => {
            let report = depend::check_dependencies(tracker, false);
            if !report.broken.is_empty() {
                println!("Broken links:");
                for link in &report.broken {
                    println!("{}", link);
                }
            }
            print_dangling(tracker, &report);
        }

        DependMode::Tree { issue, depth } => {
            let uuid = tracker.resolve(&issue)?;
            let short = tracker.short_id(&uuid);
            for (direction, label) in [
                (Direction::BlockedBy, "blocked by"),
                (Direction::Blocks, "blocks"),
            ] {
                let tree = DependencyTree::build(tracker, uuid, direction, depth, filter)?;
                if tree.is_empty() {
                    continue;
                }
                println!("{} {}:", short, label);
                for (level, node) in tree.thread() {
                    if let Some(issue) = tracker.get(&node) {
                        println!(
                            "{}{}",
                            " ".repeat(level),
                            issue.short_line(&tracker.short_id(&node))
                        );
                    }
                }
            }
        }

        DependMode::Link {
            blocked,
            blocker,
            remove,
        } => {
            let blocked = tracker.resolve(&blocked)?;
            let blocker = tracker.resolve(&blocker)?;
            if remove {
                depend::remove_block(tracker, blocked, blocker)?;
            } else {
                depend::add_block(tracker, blocked, blocker)?;
            }
            for uuid in [blocked, blocker] {
                if let Some(issue) = tracker.get(&uuid) {
                    storage.save_issue(issue)?;
                }
            }
            show_links(tracker, blocked, show_status);
        }

        DependMode::Show { issue } => {
            let uuid = tracker.resolve(&issue)?;
            show_links(tracker, uuid, show_status);
        }
    }
    Ok(())
}

fn show_links(tracker: &Tracker, uuid: Uuid, show_status: bool) {
    let Some(issue) = tracker.get(&uuid) else {
        return;
    };
    let short = tracker.short_id(&uuid);
    let line = |other: &Uuid| match tracker.get(other) {
        Some(o) if show_status => format!("{}\t{}", tracker.short_id(other), o.status),
        Some(_) => tracker.short_id(other),
        None => format!("{}\t(missing)", other),
    };

    let blocked_by = depend::get_blocked_by(issue);
    if !blocked_by.is_empty() {
        println!("{} blocked by:", short);
        for other in &blocked_by {
            println!("{}", line(other));
        }
    }
    let blocks = depend::get_blocks(issue);
    if !blocks.is_empty() {
        println!("{} blocks:", short);
        for other in &blocks {
            println!("{}", line(other));
        }
    }
}

fn print_dangling(tracker: &Tracker, report: &DependencyReport) {
    if report.dangling.is_empty() {
        return;
    }
    println!("Dangling references:");
    for dangling in &report.dangling {
        println!("{}: {}", tracker.short_id(&dangling.issue), dangling.tag);
    }
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("Failed to read stdin")?;
    Ok(buf)
}

fn get_storage(dir_arg: &Option<PathBuf>, config: Config) -> Result<Storage> {
    let dir = if let Some(dir) = dir_arg {
        dir.clone()
    } else if let Ok(dir) = env::var("EB_DIR") {
        PathBuf::from(dir)
    } else {
        // Search for .everbug directory
        find_everbug_dir()?
    };

    Storage::open(dir, config).context("Failed to open storage")
}

/// Log command to command_history.log
fn log_command(dir: &Path, args: &[String]) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;

    let log_path = dir.join("command_history.log");
    let timestamp = chrono::Utc::now().to_rfc3339();

    // Skip the binary path
    let command_line = args.get(1..).map(|rest| rest.join(" ")).unwrap_or_default();

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open command history log")?;

    writeln!(file, "{} {}", timestamp, command_line)
        .context("Failed to write to command history log")?;

    Ok(())
}

fn print_version() {
    println!("eb version {}", env!("CARGO_PKG_VERSION"));
    println!("built {}", env!("BUILD_DATE"));
    if let Some(hash) = built_info::GIT_COMMIT_HASH_SHORT {
        let dirty = if built_info::GIT_DIRTY == Some(true) {
            " (dirty)"
        } else {
            ""
        };
        println!("commit {}{}", hash, dirty);
    }
}
