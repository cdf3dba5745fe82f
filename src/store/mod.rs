//! SQLite-backed storage layer: schema DDL, the canonical node/edge store,
//! and the mailbox/search store. Grounded on angzarr's `src/storage/sqlite`
//! module layout (one file per concern, DDL factored into its own module).

pub mod canonical;
pub mod mailbox;
pub mod schema_sql;

pub use canonical::{CanonicalStore, CanonicalStoreConfig};
pub use mailbox::{MailboxItem, MailboxStore, MailboxStoreConfig, SearchResult};
