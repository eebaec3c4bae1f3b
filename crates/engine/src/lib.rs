pub mod dedup;
pub mod error;
pub mod reconciler;
pub mod source;
pub mod supervisor;

pub use dedup::DedupCache;
pub use error::EngineError;
pub use reconciler::Reconciler;
pub use source::{JobSource, SourceError, WatchEvent};
pub use supervisor::TaskGroup;
