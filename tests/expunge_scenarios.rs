use std::collections::BTreeSet;

use mailfts::prelude::*;
use tempfile::TempDir;

fn config() -> IndexConfig {
    IndexConfig {
        lock_timeout_secs: 5,
        compact_expunges: 2,
        ..Default::default()
    }
}

fn index_messages(mailbox: &mut MailboxIndex, messages: &[(u32, &str)]) {
    let mut session = mailbox.build_init().unwrap();
    for &(uid, body) in messages {
        session.begin_header(uid).unwrap();
        session
            .append(format!("Subject: message {uid}\r\n").as_bytes())
            .unwrap();
        assert!(session.begin_body(uid, "text/plain", None).unwrap());
        session.append(body.as_bytes()).unwrap();
    }
    let stats = session.deinit(false).unwrap();
    assert!(stats.committed);
}

fn find(mailbox: &MailboxIndex, phrase: &str) -> BTreeSet<u32> {
    mailbox
        .lookup(&MailQuery::new().phrase(phrase), SearchScope::ALL)
        .unwrap()
        .definite
}

#[test]
fn test_dropped_pending_expunges_are_forgotten() {
    let dir = TempDir::new().unwrap();
    {
        let mut mailbox = MailboxIndex::open(dir.path(), 3, config()).unwrap();
        index_messages(&mut mailbox, &[(100, "lighthouse keeper")]);
        mailbox.defer_expunge(100);
        assert!(find(&mailbox, "lighthouse keeper").is_empty());
    }

    let mailbox = MailboxIndex::open(dir.path(), 3, config()).unwrap();
    assert!(mailbox.pending_expunges().is_empty());
    assert_eq!(find(&mailbox, "lighthouse keeper"), BTreeSet::from([100]));
}

#[test]
fn test_cancelled_expunges_are_searchable_again() {
    let dir = TempDir::new().unwrap();
    let mut mailbox = MailboxIndex::open(dir.path(), 3, config()).unwrap();
    index_messages(&mut mailbox, &[(1, "orange juice")]);

    mailbox.defer_expunge(1);
    assert!(find(&mailbox, "orange juice").is_empty());
    mailbox.cancel_expunges();
    assert_eq!(find(&mailbox, "orange juice"), BTreeSet::from([1]));
    assert_eq!(mailbox.commit_expunges().unwrap(), 0);
}

#[test]
fn test_expunged_uids_are_filtered_at_every_stage() {
    let dir = TempDir::new().unwrap();
    let mut mailbox = MailboxIndex::open(dir.path(), 3, config()).unwrap();
    index_messages(
        &mut mailbox,
        &[(1, "shared words here"), (2, "shared words here"), (3, "shared words here")],
    );
    assert_eq!(find(&mailbox, "shared words"), BTreeSet::from([1, 2, 3]));

    // pending
    mailbox.defer_expunge(2);
    assert_eq!(find(&mailbox, "shared words"), BTreeSet::from([1, 3]));

    // committed, seen by a fresh handle too
    assert_eq!(mailbox.commit_expunges().unwrap(), 1);
    assert!(mailbox.pending_expunges().is_empty());
    let other = MailboxIndex::open(dir.path(), 3, config()).unwrap();
    assert_eq!(find(&other, "shared words"), BTreeSet::from([1, 3]));
    let status = other.status().unwrap();
    assert_eq!(status.deferred_expunges, 1);
    assert!(status.deferred_since.is_some());
    drop(other);

    // compacted
    let stats = mailbox.compact().unwrap();
    assert_eq!(stats.uids, 1);
    assert_eq!(stats.documents_removed, 2);
    assert_eq!(find(&mailbox, "shared words"), BTreeSet::from([1, 3]));
    assert_eq!(find(&mailbox, "message 2"), BTreeSet::new());
    assert_eq!(mailbox.status().unwrap().deferred_expunges, 0);
}

#[test]
fn test_compaction_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut mailbox = MailboxIndex::open(dir.path(), 3, config()).unwrap();
    index_messages(&mut mailbox, &[(10, "first body"), (11, "second body")]);

    mailbox.defer_expunge(10);
    mailbox.commit_expunges().unwrap();
    let first = mailbox.compact().unwrap();
    assert_eq!(first.documents_removed, 2);
    let documents = mailbox.status().unwrap().documents;

    // the same uid again: its shadow is gone, nothing else changes
    mailbox.defer_expunge(10);
    mailbox.commit_expunges().unwrap();
    let second = mailbox.compact().unwrap();
    assert_eq!(second.documents_removed, 0);
    assert_eq!(second.missing_shadows, 1);
    assert_eq!(mailbox.status().unwrap().documents, documents);

    // nothing deferred
    let third = mailbox.compact().unwrap();
    assert_eq!(third.uids, 0);
    assert_eq!(find(&mailbox, "second body"), BTreeSet::from([11]));
}

#[test]
fn test_optimize_waits_for_threshold() {
    let dir = TempDir::new().unwrap();
    let mut mailbox = MailboxIndex::open(dir.path(), 3, config()).unwrap();
    index_messages(
        &mut mailbox,
        &[(1, "alpha"), (2, "beta"), (3, "gamma")],
    );

    mailbox.defer_expunge(1);
    assert!(mailbox.optimize().unwrap().is_none());
    assert!(!mailbox.should_compact().unwrap());
    assert_eq!(mailbox.status().unwrap().deferred_expunges, 1);

    mailbox.defer_expunge(2);
    let stats = mailbox.optimize().unwrap().expect("threshold reached");
    assert_eq!(stats.uids, 2);
    assert!(!mailbox.should_compact().unwrap());
    assert_eq!(find(&mailbox, "gamma"), BTreeSet::from([3]));
}
