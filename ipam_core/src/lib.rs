//! Hierarchical IP prefix allocation.
//!
//! Address space is kept as binary radix trees (one per rib and IP version)
//! stored as rows of a prefix table. Blocks are handed out from tagged pools
//! by splitting free blocks in halves and given back by collapsing free
//! halves again.

pub mod config;
pub mod constants;
pub mod engine;
pub mod errors;
pub mod helpers;
pub mod predicate;
pub mod query;
pub mod store;
pub mod tags;
pub mod telemetry;
pub mod types;

pub use config::IpamConfig;
pub use engine::Ipam;
pub use errors::{Error, ErrorCode, Result};
pub use predicate::{Cmp, WordPredicate};
pub use store::{Order, PrefixTable, Select, Snapshot, Table, Transaction};
pub use tags::TagIndex;
pub use telemetry::{register_stats_callback, StatsCallback};
pub use types::{Net, Prefix, PrefixId, PrefixRecord, PrefixTag, Version};

use once_cell::sync::OnceCell;

// ---- logging bootstrapper ---------------------------------------------------
pub(crate) fn ensure_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let _ = env_logger::builder()
            .format_timestamp(None)
            .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
            .try_init();
    });
}
