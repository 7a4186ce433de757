//! Command implementations for the mailfts CLI.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, anyhow};

use crate::build::{BuildSession, BuildStats};
use crate::cli::args::*;
use crate::cli::output::*;
use crate::config::IndexConfig;
use crate::mailbox::MailboxIndex;
use crate::search::{MailQuery, SearchScope};

/// Bytes handed to the build session per append.
const APPEND_CHUNK_SIZE: usize = 64 * 1024;

/// Execute a CLI command.
pub fn execute_command(args: MailftsArgs) -> anyhow::Result<()> {
    match &args.command {
        Command::Index(index_args) => index_message(index_args, &args),
        Command::Search(search_args) => search_index(search_args, &args),
        Command::Expunge(expunge_args) => expunge_uids(expunge_args, &args),
        Command::Compact(compact_args) => compact_index(compact_args, &args),
        Command::Status(status_args) => show_status(status_args, &args),
        Command::Rebuild(rebuild_args) => rebuild_index(rebuild_args, &args),
    }
}

/// Build the configuration from the optional file and the overrides.
pub fn load_config(args: &MailboxArgs) -> anyhow::Result<IndexConfig> {
    let mut config = match &args.config {
        Some(path) => IndexConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => IndexConfig::default(),
    };
    for setting in &args.settings {
        let (key, value) = setting
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got {setting:?}"))?;
        config.set(key, value)?;
    }
    config.validate()?;
    Ok(config)
}

fn open_mailbox(args: &MailboxArgs) -> anyhow::Result<MailboxIndex> {
    let config = load_config(args)?;
    MailboxIndex::open(&args.index_path, args.uid_validity, config)
        .with_context(|| format!("opening index {}", args.index_path.display()))
}

/// Index one message from its header and body part files.
fn index_message(args: &IndexArgs, cli_args: &MailftsArgs) -> anyhow::Result<()> {
    let mut mailbox = open_mailbox(&args.mailbox)?;
    let start_time = Instant::now();

    let stats_and_fallback = if args.cooperative {
        let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
        runtime.block_on(index_message_async(&mut mailbox, args))?
    } else {
        let mut session = mailbox.build_init()?;
        if let Some(header) = &args.header {
            session.begin_header(args.uid)?;
            append_file(&mut session, header)?;
        }
        for part in &args.body {
            if session.begin_body(args.uid, &part.content_type, part.disposition.as_deref())? {
                append_file(&mut session, &part.path)?;
            }
        }
        let fell_back = session.fell_back();
        (session.deinit(false)?, fell_back)
    };
    let (stats, fell_back) = stats_and_fallback;

    output_result(
        "Message indexed",
        &IndexingResult {
            uid: args.uid,
            parts: args.body.len() + usize::from(args.header.is_some()),
            stats,
            fell_back,
            duration_ms: start_time.elapsed().as_millis() as u64,
        },
        cli_args,
    )?;
    Ok(())
}

async fn index_message_async(
    mailbox: &mut MailboxIndex,
    args: &IndexArgs,
) -> anyhow::Result<(BuildStats, bool)> {
    let mut session = mailbox.build_init()?;
    if let Some(header) = &args.header {
        session.begin_header_async(args.uid).await?;
        append_file(&mut session, header)?;
    }
    for part in &args.body {
        let accepted = session
            .begin_body_async(args.uid, &part.content_type, part.disposition.as_deref())
            .await?;
        if accepted {
            append_file(&mut session, &part.path)?;
        }
    }
    let fell_back = session.fell_back();
    Ok((session.deinit_async(false).await?, fell_back))
}

fn append_file(session: &mut BuildSession<'_>, path: &Path) -> anyhow::Result<()> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut chunk = vec![0u8; APPEND_CHUNK_SIZE];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            return Ok(());
        }
        session.append(&chunk[..read])?;
    }
}

/// Search a mailbox index.
fn search_index(args: &SearchArgs, cli_args: &MailftsArgs) -> anyhow::Result<()> {
    if args.phrase.is_empty() && args.substring.is_empty() {
        return Err(anyhow!("nothing to search for: give --phrase or --substring"));
    }
    let mailbox = open_mailbox(&args.mailbox)?;
    let scope = SearchScope::from(args.scope);
    let start_time = Instant::now();

    let results = if args.scored {
        let queries: Vec<MailQuery> = args
            .phrase
            .iter()
            .map(|text| MailQuery::new().phrase(text.as_str()))
            .chain(
                args.substring
                    .iter()
                    .map(|text| MailQuery::new().substring(text.as_str())),
            )
            .collect();
        let scored = mailbox.lookup_scored(&queries, scope)?;
        SearchResults {
            definite: scored.definite,
            maybe: scored.maybe,
            scores: Some(scored.scores),
            unsearchable: scored.unsearchable,
            duration_ms: start_time.elapsed().as_millis() as u64,
        }
    } else {
        let query = args
            .substring
            .iter()
            .fold(
                args.phrase
                    .iter()
                    .fold(MailQuery::new(), |query, text| query.phrase(text.as_str())),
                |query, text| query.substring(text.as_str()),
            );
        let result = mailbox.lookup(&query, scope)?;
        SearchResults {
            definite: result.definite,
            maybe: result.maybe,
            scores: None,
            unsearchable: result.unsearchable,
            duration_ms: start_time.elapsed().as_millis() as u64,
        }
    };

    output_result("Search results", &results, cli_args)?;
    Ok(())
}

/// Defer and commit expunges, optionally compacting afterwards.
fn expunge_uids(args: &ExpungeArgs, cli_args: &MailftsArgs) -> anyhow::Result<()> {
    let mut mailbox = open_mailbox(&args.mailbox)?;
    for &uid in &args.uids {
        mailbox.defer_expunge(uid);
    }
    let committed = mailbox.commit_expunges()?;
    let compaction = if args.optimize {
        mailbox.optimize()?
    } else {
        None
    };

    output_result(
        "Expunges committed",
        &ExpungeResult {
            committed,
            compaction,
        },
        cli_args,
    )?;
    Ok(())
}

/// Compact a mailbox index.
fn compact_index(args: &CompactArgs, cli_args: &MailftsArgs) -> anyhow::Result<()> {
    let mut mailbox = open_mailbox(&args.mailbox)?;
    let start_time = Instant::now();

    let stats = if args.force {
        Some(mailbox.compact()?)
    } else {
        mailbox.optimize()?
    };

    output_result(
        "Compaction finished",
        &CompactionResult {
            performed: stats.is_some(),
            stats,
            duration_ms: start_time.elapsed().as_millis() as u64,
        },
        cli_args,
    )?;
    Ok(())
}

/// Show the state of a mailbox index.
fn show_status(args: &StatusArgs, cli_args: &MailftsArgs) -> anyhow::Result<()> {
    let mailbox = open_mailbox(&args.mailbox)?;
    let status = mailbox.status()?;
    output_result("Index status", &status, cli_args)?;
    Ok(())
}

/// Delete and recreate a mailbox index.
fn rebuild_index(args: &RebuildArgs, cli_args: &MailftsArgs) -> anyhow::Result<()> {
    let mut mailbox = open_mailbox(&args.mailbox)?;
    mailbox.rebuild()?;
    output_result(
        "Index rebuilt",
        &RebuildResult {
            path: args.mailbox.index_path.to_string_lossy().to_string(),
            uid_validity: args.mailbox.uid_validity,
        },
        cli_args,
    )?;
    Ok(())
}
