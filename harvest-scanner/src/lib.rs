pub mod crawler;
pub mod error;
pub mod extractor;
pub mod resolver;
pub mod result;
pub mod sanitize;
pub mod shutdown;
pub mod transport;
pub mod urls;

pub use crawler::{ProgressCallback, SnapshotCrawler};
pub use error::ScanError;
pub use extractor::{TextExtractor, TextSummary};
pub use resolver::{DedupPolicy, SnapshotResolver};
pub use result::{PageKind, PageRecord, SkipReason, SnapshotCrawl, SnapshotDescriptor};
pub use shutdown::Shutdown;
pub use transport::{RateLimiter, Transport, TransportConfig};
pub use urls::{ArchiveBase, normalize_source_url};
