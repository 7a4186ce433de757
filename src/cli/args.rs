//! Command line argument parsing for the mailfts CLI using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::search::SearchScope;

/// mailfts - full-text search indexes for mailboxes
#[derive(Parser, Debug, Clone)]
#[command(name = "mailfts")]
#[command(about = "Build and query full-text search indexes of mailboxes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct MailftsArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl MailftsArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Index one message from header and body part files
    Index(IndexArgs),

    /// Search a mailbox index
    Search(SearchArgs),

    /// Expunge uids from a mailbox index
    Expunge(ExpungeArgs),

    /// Compact a mailbox index
    Compact(CompactArgs),

    /// Show the state of a mailbox index
    Status(StatusArgs),

    /// Delete and recreate a mailbox index
    Rebuild(RebuildArgs),
}

/// Options shared by every command that opens a mailbox index.
#[derive(Args, Debug, Clone)]
pub struct MailboxArgs {
    /// Path to the mailbox index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,

    /// UID validity of the mailbox
    #[arg(short = 'u', long, env = "MAILFTS_UID_VALIDITY")]
    pub uid_validity: u32,

    /// JSON configuration file
    #[arg(short, long, env = "MAILFTS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Configuration overrides (key=value), applied after the file
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
    pub settings: Vec<String>,
}

/// A body part given on the command line as `PATH[=CONTENT_TYPE]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    pub path: PathBuf,
    pub content_type: String,
    pub disposition: Option<String>,
}

/// Parse `PATH[=CONTENT_TYPE[;DISPOSITION]]`.
pub fn parse_body_part(value: &str) -> std::result::Result<BodyPart, String> {
    let (path, rest) = match value.split_once('=') {
        Some((path, rest)) => (path, Some(rest)),
        None => (value, None),
    };
    if path.is_empty() {
        return Err(format!("missing path in body part: {value:?}"));
    }
    let (content_type, disposition) = match rest {
        Some(rest) => match rest.split_once(';') {
            Some((content_type, disposition)) => {
                (content_type.trim(), Some(disposition.trim().to_string()))
            }
            None => (rest.trim(), None),
        },
        None => ("text/plain", None),
    };
    if content_type.is_empty() {
        return Err(format!("missing content type in body part: {value:?}"));
    }
    Ok(BodyPart {
        path: PathBuf::from(path),
        content_type: content_type.to_string(),
        disposition,
    })
}

/// Arguments for indexing a message
#[derive(Parser, Debug, Clone)]
pub struct IndexArgs {
    #[command(flatten)]
    pub mailbox: MailboxArgs,

    /// UID of the message
    #[arg(long)]
    pub uid: u32,

    /// File holding the message header block
    #[arg(long, value_name = "FILE")]
    pub header: Option<PathBuf>,

    /// Body part as PATH[=CONTENT_TYPE[;DISPOSITION]] (repeatable)
    #[arg(short, long, value_name = "PART", value_parser = parse_body_part)]
    pub body: Vec<BodyPart>,

    /// Run the helper on a tokio runtime
    #[arg(long)]
    pub cooperative: bool,
}

/// Arguments for searching
#[derive(Parser, Debug, Clone)]
pub struct SearchArgs {
    #[command(flatten)]
    pub mailbox: MailboxArgs,

    /// Phrase to match (repeatable, all must match)
    #[arg(short, long)]
    pub phrase: Vec<String>,

    /// Substring to match (repeatable, all must match)
    #[arg(long)]
    pub substring: Vec<String>,

    /// Parts of the message to search
    #[arg(long, default_value = "all")]
    pub scope: ScopeArg,

    /// Report per-uid scores
    #[arg(long)]
    pub scored: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeArg {
    Header,
    Body,
    All,
}

impl From<ScopeArg> for SearchScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Header => SearchScope::HEADER,
            ScopeArg::Body => SearchScope::BODY,
            ScopeArg::All => SearchScope::ALL,
        }
    }
}

/// Arguments for expunging
#[derive(Parser, Debug, Clone)]
pub struct ExpungeArgs {
    #[command(flatten)]
    pub mailbox: MailboxArgs,

    /// UIDs to expunge
    #[arg(value_name = "UID", required = true)]
    pub uids: Vec<u32>,

    /// Compact right away when the thresholds are reached
    #[arg(long)]
    pub optimize: bool,
}

/// Arguments for compaction
#[derive(Parser, Debug, Clone)]
pub struct CompactArgs {
    #[command(flatten)]
    pub mailbox: MailboxArgs,

    /// Compact even below the thresholds
    #[arg(long)]
    pub force: bool,
}

/// Arguments for index status
#[derive(Parser, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub mailbox: MailboxArgs,
}

/// Arguments for rebuilding
#[derive(Parser, Debug, Clone)]
pub struct RebuildArgs {
    #[command(flatten)]
    pub mailbox: MailboxArgs,
}

/// Output formats
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable format
    Human,
    /// JSON format
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_definition() {
        MailftsArgs::command().debug_assert();
    }

    #[test]
    fn test_verbosity() {
        let args = MailftsArgs::parse_from(["mailfts", "status", "/tmp/idx", "-u", "1"]);
        assert_eq!(args.verbosity(), 1);
        let args = MailftsArgs::parse_from(["mailfts", "-vvv", "status", "/tmp/idx", "-u", "1"]);
        assert_eq!(args.verbosity(), 3);
        let args = MailftsArgs::parse_from(["mailfts", "-q", "-v", "status", "/tmp/idx", "-u", "1"]);
        assert_eq!(args.verbosity(), 0);
    }

    #[test]
    fn test_parse_body_part() {
        let part = parse_body_part("body.txt").unwrap();
        assert_eq!(part.content_type, "text/plain");
        assert_eq!(part.disposition, None);

        let part = parse_body_part("a.pdf=application/pdf").unwrap();
        assert_eq!(part.path, PathBuf::from("a.pdf"));
        assert_eq!(part.content_type, "application/pdf");

        let part =
            parse_body_part("x.bin=application/octet-stream;attachment; filename=\"r.pdf\"")
                .unwrap();
        assert_eq!(
            part.disposition.as_deref(),
            Some("attachment; filename=\"r.pdf\"")
        );

        assert!(parse_body_part("=text/plain").is_err());
        assert!(parse_body_part("a.txt=").is_err());
    }

    #[test]
    fn test_index_command() {
        let args = MailftsArgs::parse_from([
            "mailfts",
            "index",
            "/tmp/idx",
            "-u",
            "7",
            "--uid",
            "100",
            "--header",
            "h.txt",
            "-b",
            "b.txt",
            "-b",
            "a.pdf=application/pdf",
        ]);
        let Command::Index(index) = args.command else {
            panic!("expected index command");
        };
        assert_eq!(index.mailbox.uid_validity, 7);
        assert_eq!(index.uid, 100);
        assert_eq!(index.body.len(), 2);
        assert!(!index.cooperative);
    }
}
