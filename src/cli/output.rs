//! Output formatting for CLI commands.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::build::BuildStats;
use crate::cli::args::{MailftsArgs, OutputFormat};
use crate::error::Result;
use crate::expunge::CompactionStats;
use crate::mailbox::IndexStatus;

/// Result structure for indexing one message.
#[derive(Debug, Serialize)]
pub struct IndexingResult {
    pub uid: u32,
    pub parts: usize,
    pub stats: BuildStats,
    pub fell_back: bool,
    pub duration_ms: u64,
}

/// Result structure for search operations.
#[derive(Debug, Serialize)]
pub struct SearchResults {
    pub definite: BTreeSet<u32>,
    pub maybe: BTreeSet<u32>,
    pub scores: Option<Vec<(u32, f32)>>,
    pub unsearchable: bool,
    pub duration_ms: u64,
}

/// Result structure for expunges.
#[derive(Debug, Serialize)]
pub struct ExpungeResult {
    pub committed: usize,
    pub compaction: Option<CompactionStats>,
}

/// Result structure for compaction.
#[derive(Debug, Serialize)]
pub struct CompactionResult {
    pub performed: bool,
    pub stats: Option<CompactionStats>,
    pub duration_ms: u64,
}

/// Result structure for a rebuild.
#[derive(Debug, Serialize)]
pub struct RebuildResult {
    pub path: String,
    pub uid_validity: u32,
}

/// How a result prints in human-readable form.
pub trait HumanOutput {
    fn print_human(&self);
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize + HumanOutput>(
    message: &str,
    result: &T,
    args: &MailftsArgs,
) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => {
            if args.verbosity() > 1 {
                println!("{message}");
                println!();
            }
            result.print_human();
            Ok(())
        }
        OutputFormat::Json => output_json(result, args),
    }
}

/// Output in JSON format.
fn output_json<T: Serialize>(result: &T, args: &MailftsArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };
    println!("{json}");
    Ok(())
}

impl HumanOutput for IndexingResult {
    fn print_human(&self) {
        println!("Indexed uid {} ({} parts)", self.uid, self.parts);
        println!("Documents: {}", self.stats.documents);
        if self.stats.spilled > 0 {
            println!("Extracted by helper: {}", self.stats.spilled);
        }
        if self.stats.skipped > 0 {
            println!("Skipped: {}", self.stats.skipped);
        }
        println!("Last indexed uid: {}", self.stats.last_indexed_uid);
        if self.fell_back {
            println!("Helper unavailable, indexed inline");
        }
        println!("Time: {}ms", self.duration_ms);
    }
}

impl HumanOutput for SearchResults {
    fn print_human(&self) {
        if self.unsearchable {
            println!("Index cannot narrow this search; every message is a candidate");
            return;
        }
        println!("Definite: {}", format_uids(&self.definite));
        println!("Maybe: {}", format_uids(&self.maybe));
        if let Some(scores) = &self.scores {
            for (uid, score) in scores {
                println!("  {uid}: {score:.3}");
            }
        }
        println!("Search time: {}ms", self.duration_ms);
    }
}

impl HumanOutput for ExpungeResult {
    fn print_human(&self) {
        println!("Deferred expunges: {}", self.committed);
        if let Some(stats) = &self.compaction {
            print_compaction(stats);
        }
    }
}

impl HumanOutput for CompactionResult {
    fn print_human(&self) {
        match &self.stats {
            Some(stats) if self.performed => print_compaction(stats),
            _ => println!("Nothing to compact"),
        }
        println!("Time: {}ms", self.duration_ms);
    }
}

impl HumanOutput for IndexStatus {
    fn print_human(&self) {
        println!("Index: {}", self.directory.display());
        if !self.exists {
            println!("Not created yet");
            return;
        }
        println!("UID validity: {}", self.uid_validity);
        println!("Last indexed uid: {}", self.last_indexed_uid);
        println!("Documents: {}", self.documents);
        println!("Fragments: {}", self.fragments);
        for (number, size) in self.fragment_sizes.iter().enumerate() {
            println!("  {number}: {}", format_bytes(*size));
        }
        if self.deferred_expunges > 0 {
            let since = self
                .deferred_since
                .map(|since| since.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "Deferred expunges: {} (since {since})",
                self.deferred_expunges
            );
        }
    }
}

impl HumanOutput for RebuildResult {
    fn print_human(&self) {
        println!("Rebuilt {} (uid validity {})", self.path, self.uid_validity);
    }
}

fn print_compaction(stats: &CompactionStats) {
    println!("Compacted uids: {}", stats.uids);
    println!("Documents removed: {}", stats.documents_removed);
    if stats.missing_shadows > 0 {
        println!("Uids without shadow: {}", stats.missing_shadows);
    }
}

/// Format a uid set compactly, folding consecutive runs into ranges.
fn format_uids(uids: &BTreeSet<u32>) -> String {
    if uids.is_empty() {
        return "(none)".to_string();
    }
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for &uid in uids {
        match ranges.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(uid) => *end = uid,
            _ => ranges.push((uid, uid)),
        }
    }
    ranges
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}:{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Format bytes into human-readable format.
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    let unit = UNITS[unit_index];
    if unit_index == 0 {
        format!("{bytes} {unit}")
    } else {
        format!("{size:.1} {unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576), "1.0 MB");
    }

    #[test]
    fn test_format_uids() {
        assert_eq!(format_uids(&BTreeSet::new()), "(none)");
        assert_eq!(format_uids(&BTreeSet::from([4])), "4");
        assert_eq!(
            format_uids(&BTreeSet::from([1, 2, 3, 7, 9, 10])),
            "1:3,7,9:10"
        );
        assert_eq!(
            format_uids(&BTreeSet::from([u32::MAX - 1, u32::MAX])),
            format!("{}:{}", u32::MAX - 1, u32::MAX)
        );
    }
}
