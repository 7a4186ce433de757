//! # mailfts
//!
//! Full-text search indexing for mail stores.
//!
//! ## Features
//!
//! - One index per mailbox, split into size-bounded fragments
//! - Header and body parts indexed per uid, with a shadow document per uid
//! - Binary attachments extracted by an external helper process
//! - Deferred expunges with batched compaction
//! - Cross-process locking with in-process owner arbitration
//! - Blocking and cooperative (tokio) execution of the helper

pub mod build;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod expunge;
pub mod fragment;
pub mod indexer;
pub mod lock;
pub mod mailbox;
pub mod meta;
pub mod search;
pub mod shadow;

pub mod prelude {
    pub use crate::build::{BuildSession, BuildStats};
    pub use crate::config::{HelperConfig, IndexConfig, SpillDir};
    pub use crate::error::{MailFtsError, Result};
    pub use crate::mailbox::{IndexStatus, MailboxIndex};
    pub use crate::search::{LookupResult, MailQuery, ScoredLookupResult, SearchScope};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
