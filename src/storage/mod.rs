//! 本地文件存储
//!
//! 关键词目录、条目存储与运行日志的文件实现，目录结构均位于 `cache_path` 之下。

pub mod items;
pub mod keywords;
pub mod logs;

pub use items::JsonFileStore;
pub use keywords::FileKeywordSource;
pub use logs::JsonFileLogSink;
