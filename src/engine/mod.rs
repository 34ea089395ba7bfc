pub mod context;
pub mod dedup;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use pipeline::CollectorEngine;
