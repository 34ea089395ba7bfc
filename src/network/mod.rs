pub mod cache;
pub mod fetcher;
pub mod middleware;
pub mod service;
pub mod tunnel;
