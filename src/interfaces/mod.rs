pub mod site;
pub mod store;
pub mod tunnel;

pub use site::{Fetcher, RawResult, SearchSite};
pub use store::{DedupCache, ItemStore, KeywordSource, RunLogSink, UpsertOutcome};
pub use tunnel::TunnelControl;
