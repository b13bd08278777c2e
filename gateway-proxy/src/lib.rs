//! Upstream Proxy Engine: runs one request through the account lease,
//! southbound translation, streaming usage extraction, and upstream
//! error classification with failover.

mod classify;
mod engine;
mod extractor;

pub use classify::Disposition;
pub use engine::{ProxyEngine, ProxyOutcome, ProxyRequest};
pub use extractor::{ExtractedUsage, UsageExtractor};
