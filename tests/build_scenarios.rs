use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use mailfts::config::HelperConfig;
use mailfts::prelude::*;
use tempfile::TempDir;

const HEADER_100: &[u8] = b"Subject: Budget meeting\r\nFrom: Alice <alice@example.com>\r\n";
const BODY_100: &[u8] = b"Let us discuss the budget tomorrow morning.";
const PDF_101: &[u8] = b"%PDF-1.4\n%\xe2\xe3\xcf\xd3\n1 0 obj\nBT /F1 12 Tf (Quarterly report for the board) Tj ET\nendobj\n%%EOF\n";

fn helper_config() -> IndexConfig {
    IndexConfig {
        lock_timeout_secs: 5,
        indexer_timeout_secs: 10,
        helper: HelperConfig {
            program: PathBuf::from(env!("CARGO_BIN_EXE_mailfts-helper")),
            args: Vec::new(),
        },
        ..Default::default()
    }
}

fn uids(list: &[u32]) -> BTreeSet<u32> {
    list.iter().copied().collect()
}

fn index_message_100(mailbox: &mut MailboxIndex) -> BuildStats {
    let mut session = mailbox.build_init().unwrap();
    session.begin_header(100).unwrap();
    session.append(HEADER_100).unwrap();
    assert!(session.begin_body(100, "text/plain", None).unwrap());
    session.append(BODY_100).unwrap();
    session.deinit(false).unwrap()
}

fn leftover_files(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".spill") || name.ends_with(".txt"))
        .collect()
}

#[test]
fn test_inline_message_is_searchable() {
    let dir = TempDir::new().unwrap();
    let mut mailbox = MailboxIndex::open(dir.path(), 7, helper_config()).unwrap();
    assert_eq!(mailbox.last_indexed_uid().unwrap(), 0);

    let stats = index_message_100(&mut mailbox);
    assert!(stats.committed);
    assert_eq!(stats.documents, 2);
    assert_eq!(stats.shadows, 1);
    assert_eq!(stats.spilled, 0);
    assert_eq!(stats.last_indexed_uid, 100);
    assert_eq!(mailbox.last_indexed_uid().unwrap(), 100);

    let query = MailQuery::new().phrase("budget meeting");
    let header = mailbox.lookup(&query, SearchScope::HEADER).unwrap();
    assert_eq!(header.definite, uids(&[100]));
    let body = mailbox.lookup(&query, SearchScope::BODY).unwrap();
    assert!(body.definite.is_empty());

    let query = MailQuery::new().phrase("discuss the budget");
    let body = mailbox.lookup(&query, SearchScope::BODY).unwrap();
    assert_eq!(body.definite, uids(&[100]));
    assert!(!body.unsearchable);
}

#[test]
fn test_binary_part_goes_through_helper() {
    let dir = TempDir::new().unwrap();
    let mut mailbox = MailboxIndex::open(dir.path(), 7, helper_config()).unwrap();
    index_message_100(&mut mailbox);

    let mut session = mailbox.build_init().unwrap();
    session.begin_header(101).unwrap();
    session.append(b"Subject: Figures\r\n").unwrap();
    assert!(session.begin_body(101, "application/pdf", None).unwrap());
    session.append(PDF_101).unwrap();
    let stats = session.deinit(false).unwrap();

    assert_eq!(stats.documents, 2);
    assert_eq!(stats.spilled, 1);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.shadows, 1);
    assert_eq!(mailbox.last_indexed_uid().unwrap(), 101);

    let result = mailbox
        .lookup(&MailQuery::new().phrase("quarterly report"), SearchScope::ALL)
        .unwrap();
    assert_eq!(result.definite, uids(&[101]));
    assert!(leftover_files(dir.path()).is_empty());

    // the helper-built shadow still lets compaction find every document
    mailbox.defer_expunge(101);
    mailbox.commit_expunges().unwrap();
    let compaction = mailbox.compact().unwrap();
    assert_eq!(compaction.documents_removed, 2);
    assert_eq!(compaction.shadows_removed, 1);
    assert_eq!(compaction.missing_shadows, 0);
}

#[test]
fn test_octet_stream_with_pdf_filename() {
    let dir = TempDir::new().unwrap();
    let mut mailbox = MailboxIndex::open(dir.path(), 7, helper_config()).unwrap();

    let mut session = mailbox.build_init().unwrap();
    assert!(!session.begin_body(5, "multipart/mixed; boundary=x", None).unwrap());
    assert!(
        session
            .begin_body(
                5,
                "application/octet-stream",
                Some("attachment; filename=\"figures.pdf\""),
            )
            .unwrap()
    );
    session.append(PDF_101).unwrap();
    let stats = session.deinit(false).unwrap();
    assert_eq!(stats.spilled, 1);

    let result = mailbox
        .lookup(&MailQuery::new().phrase("for the board"), SearchScope::BODY)
        .unwrap();
    assert_eq!(result.definite, uids(&[5]));
}

#[test]
fn test_uid_regression_fails_the_session() {
    let dir = TempDir::new().unwrap();
    let mut mailbox = MailboxIndex::open(dir.path(), 7, helper_config()).unwrap();

    let mut session = mailbox.build_init().unwrap();
    session.begin_header(100).unwrap();
    session.append(HEADER_100).unwrap();
    let err = session.begin_header(99).unwrap_err();
    assert!(matches!(err, MailFtsError::UidOrder { uid: 99, last: 100 }));
    assert!(session.append(b"more").is_err());
    assert!(session.deinit(false).is_err());

    assert_eq!(mailbox.last_indexed_uid().unwrap(), 0);
    let result = mailbox
        .lookup(&MailQuery::new().phrase("budget"), SearchScope::ALL)
        .unwrap();
    assert!(result.definite.is_empty());
}

#[test]
fn test_cancel_persists_nothing() {
    let dir = TempDir::new().unwrap();
    let mut mailbox = MailboxIndex::open(dir.path(), 7, helper_config()).unwrap();
    index_message_100(&mut mailbox);

    let mut session = mailbox.build_init().unwrap();
    session.begin_header(200).unwrap();
    session.append(b"Subject: Cancelled plans\r\n").unwrap();
    let stats = session.deinit(true).unwrap();
    assert!(!stats.committed);

    assert_eq!(mailbox.last_indexed_uid().unwrap(), 100);
    let result = mailbox
        .lookup(&MailQuery::new().phrase("cancelled plans"), SearchScope::ALL)
        .unwrap();
    assert!(result.definite.is_empty());
}

#[test]
fn test_documents_spread_over_fragments() {
    let dir = TempDir::new().unwrap();
    let config = IndexConfig {
        fragment_threshold_bytes: 1,
        ..helper_config()
    };
    let mut mailbox = MailboxIndex::open(dir.path(), 7, config).unwrap();
    index_message_100(&mut mailbox);

    // primary, header, body and shadow each end up in their own fragment
    let status = mailbox.status().unwrap();
    assert_eq!(status.fragments, 4);
    assert_eq!(status.fragment_sizes.len(), 4);
    assert_eq!(status.last_indexed_uid, 100);

    let result = mailbox
        .lookup(&MailQuery::new().phrase("budget meeting"), SearchScope::ALL)
        .unwrap();
    assert_eq!(result.definite, uids(&[100]));

    mailbox.defer_expunge(100);
    mailbox.commit_expunges().unwrap();
    let compaction = mailbox.compact().unwrap();
    assert_eq!(compaction.documents_removed, 2);
    assert_eq!(compaction.shadows_removed, 1);

    let status = mailbox.status().unwrap();
    assert_eq!(status.deferred_expunges, 0);
    // only the meta document is left
    assert_eq!(status.documents, 1);
}

#[test]
fn test_large_text_part_spills_to_helper() {
    let dir = TempDir::new().unwrap();
    let config = IndexConfig {
        accumulation_limit_bytes: 16,
        ..helper_config()
    };
    let mut mailbox = MailboxIndex::open(dir.path(), 7, config).unwrap();

    let mut session = mailbox.build_init().unwrap();
    assert!(session.begin_body(3, "text/plain", None).unwrap());
    session.append(b"a long text part ").unwrap();
    session.append(b"about harbour logistics").unwrap();
    let stats = session.deinit(false).unwrap();
    assert_eq!(stats.spilled, 1);
    assert_eq!(stats.documents, 1);

    let result = mailbox
        .lookup(&MailQuery::new().phrase("harbour logistics"), SearchScope::BODY)
        .unwrap();
    assert_eq!(result.definite, uids(&[3]));
    assert!(leftover_files(dir.path()).is_empty());
}

#[test]
fn test_search_terms_may_match_header_and_body() {
    let dir = TempDir::new().unwrap();
    let mut mailbox = MailboxIndex::open(dir.path(), 7, helper_config()).unwrap();
    index_message_100(&mut mailbox);

    let query = MailQuery::new().phrase("meeting").phrase("tomorrow");
    let result = mailbox.lookup(&query, SearchScope::ALL).unwrap();
    assert_eq!(result.definite, uids(&[100]));

    let result = mailbox.lookup(&query, SearchScope::HEADER).unwrap();
    assert!(result.definite.is_empty());
    assert!(result.maybe.is_empty());
}

fn index_reports(mailbox: &mut MailboxIndex, count: u32, cancel: bool) -> BuildStats {
    let mut session = mailbox.build_init().unwrap();
    for uid in 1..=count {
        session.begin_header(uid).unwrap();
        session
            .append(format!("Subject: Report {uid}\r\n").as_bytes())
            .unwrap();
        assert!(session.begin_body(uid, "text/plain", None).unwrap());
        session
            .append(format!("Status report number {uid} for the week").as_bytes())
            .unwrap();
    }
    session.deinit(cancel).unwrap()
}

#[test]
fn test_long_build_respects_fragment_threshold() {
    let dir = TempDir::new().unwrap();
    let threshold = 4096;
    let config = IndexConfig {
        fragment_threshold_bytes: threshold,
        ..helper_config()
    };
    let mut mailbox = MailboxIndex::open(dir.path(), 7, config).unwrap();

    let stats = index_reports(&mut mailbox, 300, false);
    assert!(stats.committed);
    assert_eq!(stats.documents, 600);
    assert_eq!(stats.shadows, 300);

    let status = mailbox.status().unwrap();
    assert!(status.fragments > 10, "only {} fragments", status.fragments);
    for (number, size) in status.fragment_sizes.iter().enumerate() {
        // a fragment stops taking documents once the next one would cross
        // the threshold; the estimate may miss by one small document
        assert!(*size < threshold + 1024, "fragment {number} holds {size} bytes");
    }

    let result = mailbox
        .lookup(&MailQuery::new().phrase("report number 150"), SearchScope::BODY)
        .unwrap();
    assert_eq!(result.definite, uids(&[150]));

    mailbox.defer_expunge(150);
    mailbox.commit_expunges().unwrap();
    let compaction = mailbox.compact().unwrap();
    assert_eq!(compaction.documents_removed, 2);
    assert_eq!(compaction.shadows_removed, 1);
}

#[test]
fn test_cancel_after_new_fragment_leaves_nothing() {
    let dir = TempDir::new().unwrap();
    let config = IndexConfig {
        fragment_threshold_bytes: 4096,
        ..helper_config()
    };
    let mut mailbox = MailboxIndex::open(dir.path(), 7, config.clone()).unwrap();

    let stats = index_reports(&mut mailbox, 40, true);
    assert!(!stats.committed);

    let reopened = MailboxIndex::open(dir.path(), 7, config).unwrap();
    let status = reopened.status().unwrap();
    assert!(status.fragments > 1);
    assert_eq!(status.last_indexed_uid, 0);
    // only the meta document is left
    assert_eq!(status.documents, 1);
    let result = reopened
        .lookup(&MailQuery::new().phrase("status report"), SearchScope::ALL)
        .unwrap();
    assert!(result.definite.is_empty());
}

/// A helper that copies its input as the extracted text, except that the
/// very first `index` request fails.
#[cfg(unix)]
fn flaky_helper_config(state_dir: &Path) -> IndexConfig {
    let failed_once = state_dir.join("failed-once");
    let script = format!(
        r#"read version; echo "$version"
           while IFS="$(printf '\t')" read tag cmd; do
             set -- $cmd
             if [ "$1" = index ] && [ ! -e {flag} ]; then
               touch {flag}
               printf '%s\tERROR\tunreadable attachment\n' "$tag"
             else
               cp "$2" "$2.txt"
               printf '%s\tOK\t%s.txt\n' "$tag" "$2"
             fi
           done"#,
        flag = failed_once.display()
    );
    IndexConfig {
        helper: HelperConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script],
        },
        ..helper_config()
    }
}

#[cfg(unix)]
#[test]
fn test_helper_failure_skips_one_part() {
    let dir = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let mut mailbox = MailboxIndex::open(dir.path(), 7, flaky_helper_config(state.path())).unwrap();

    let mut session = mailbox.build_init().unwrap();
    assert!(session.begin_body(1, "application/pdf", None).unwrap());
    session.append(b"first attachment about lighthouses").unwrap();
    assert!(session.begin_body(2, "application/pdf", None).unwrap());
    session.append(b"second attachment about windmills").unwrap();
    let stats = session.deinit(false).unwrap();

    assert!(stats.committed);
    assert_eq!(stats.spilled, 2);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.documents, 1);
    assert_eq!(stats.shadows, 2);
    assert_eq!(mailbox.last_indexed_uid().unwrap(), 2);

    let result = mailbox
        .lookup(&MailQuery::new().phrase("about windmills"), SearchScope::BODY)
        .unwrap();
    assert_eq!(result.definite, uids(&[2]));
    let result = mailbox
        .lookup(&MailQuery::new().phrase("about lighthouses"), SearchScope::BODY)
        .unwrap();
    assert!(result.definite.is_empty());
    assert!(leftover_files(dir.path()).is_empty());
}

#[test]
fn test_missing_helper_fails_binary_build() {
    let dir = TempDir::new().unwrap();
    let config = IndexConfig {
        helper: HelperConfig {
            program: PathBuf::from("/nonexistent/mailfts-helper"),
            args: Vec::new(),
        },
        ..helper_config()
    };
    let mut mailbox = MailboxIndex::open(dir.path(), 7, config).unwrap();

    let mut session = mailbox.build_init().unwrap();
    assert!(session.begin_body(9, "application/pdf", None).unwrap());
    session.append(PDF_101).unwrap();
    let err = session.deinit(false).unwrap_err();
    assert!(matches!(err, MailFtsError::IndexerProcess(_)));
    assert_eq!(mailbox.last_indexed_uid().unwrap(), 0);
}
